//! Control-flow analysis: resolve `branch`/`branch_cond`
//! targets into predecessor/successor sets per block.

use crate::ir::{Builder, Opcode};

pub fn run(builder: &mut Builder) {
    for block in builder.blocks.iter_mut() {
        block.preds.clear();
        block.succs.clear();
    }
    let num_blocks = builder.blocks.len();
    for from in 0..num_blocks {
        let block_id = crate::ir::BlockId(from as u32);
        let Some(term) = builder.blocks[from].terminator() else { continue };
        let instr = builder.instr(term);
        let targets: Vec<crate::ir::BlockId> = match instr.opcode {
            Opcode::Branch => {
                let arg = instr.args[0].expect("branch has a target");
                vec![builder.branch_target(arg)]
            }
            Opcode::BranchCond => {
                let t = instr.args[1].expect("branch_cond has a true target");
                let f = instr.args[2].expect("branch_cond has a false target");
                vec![builder.branch_target(t), builder.branch_target(f)]
            }
            _ => continue,
        };
        for target in targets {
            builder.blocks[target.0 as usize].preds.push(block_id);
            builder.blocks[from].succs.push(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Constant};

    #[test]
    fn branch_links_pred_and_succ() {
        let mut b = Builder::new();
        let entry = b.block();
        let target = b.block();
        b.set_insert_point(entry, None);
        b.emit_branch(target);
        b.set_insert_point(target, None);
        b.emit_branch(target);

        run(&mut b);
        assert_eq!(b.blocks[entry.0 as usize].succs, vec![target]);
        assert_eq!(b.blocks[target.0 as usize].preds, vec![entry, target]);
    }

    #[test]
    fn branch_cond_links_both_targets() {
        let mut b = Builder::new();
        let entry = b.block();
        let if_true = b.block();
        let if_false = b.block();
        b.set_insert_point(entry, None);
        let cond = b.alloc_constant(Constant::I8(1));
        b.emit_branch_cond(cond, if_true, if_false);
        b.set_insert_point(if_true, None);
        b.emit_branch(if_true);
        b.set_insert_point(if_false, None);
        b.emit_branch(if_false);

        run(&mut b);
        assert_eq!(b.blocks[entry.0 as usize].succs, vec![if_true, if_false]);
        assert!(b.blocks[if_true.0 as usize].preds.contains(&entry));
        assert!(b.blocks[if_false.0 as usize].preds.contains(&entry));
    }
}
