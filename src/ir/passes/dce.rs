//! Dead-code elimination: reverse iteration removing any
//! instruction with no result uses and no side-effect flag, to a fixpoint.

use crate::ir::Builder;

pub fn run(builder: &mut Builder) {
    loop {
        let mut removed_any = false;
        for block_idx in 0..builder.blocks.len() {
            let instrs: Vec<_> = builder.blocks[block_idx].instrs.iter().rev().copied().collect();
            for instr_id in instrs {
                let instr = builder.instr(instr_id);
                if instr.has_side_effect() {
                    continue;
                }
                let dead = match instr.result {
                    Some(result) => !builder.value(result).has_uses(),
                    None => false,
                };
                if dead {
                    builder.remove_instr(instr_id);
                    removed_any = true;
                }
            }
        }
        if !removed_any {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Constant;

    #[test]
    fn unused_arithmetic_is_removed() {
        let mut b = Builder::new();
        let entry = b.block();
        let a = b.alloc_constant(Constant::I32(1));
        let c = b.alloc_constant(Constant::I32(2));
        let _unused = b.emit_add(a, c); // never stored or branched on
        b.emit_branch(entry);

        run(&mut b);
        assert_eq!(b.blocks[entry.0 as usize].instrs.len(), 1); // only the branch remains
    }

    #[test]
    fn side_effecting_store_survives_even_with_no_result_uses() {
        let mut b = Builder::new();
        let entry = b.block();
        let a = b.alloc_constant(Constant::I32(1));
        b.emit_store_context(0, a);
        b.emit_branch(entry);

        run(&mut b);
        assert_eq!(b.blocks[entry.0 as usize].instrs.len(), 2);
    }

    #[test]
    fn transitive_dead_chain_is_fully_removed() {
        let mut b = Builder::new();
        let entry = b.block();
        let a = b.alloc_constant(Constant::I32(1));
        let c = b.alloc_constant(Constant::I32(2));
        let sum = b.emit_add(a, c);
        let _unused = b.emit_mul(sum, c); // only consumer of `sum`, itself unused
        b.emit_branch(entry);

        run(&mut b);
        assert_eq!(b.blocks[entry.0 as usize].instrs.len(), 1);
    }
}
