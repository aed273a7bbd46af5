//! Structural validation: every block ends in exactly one
//! terminator, result/argument types agree with the opcode, no argument
//! refers past the end of either arena.

use crate::error::{Error, Result};
use crate::ir::{Builder, Opcode};

pub fn run(builder: &Builder) -> Result<()> {
    for (idx, block) in builder.blocks.iter().enumerate() {
        if !block.instrs.is_empty() {
            let last = block.instrs.len() - 1;
            if !builder.instr(block.instrs[last]).opcode.is_terminator() {
                return Err(Error::Bug(format!("block {idx} does not end in a terminator")));
            }
        }
        for (pos, &instr_id) in block.instrs.iter().enumerate() {
            let instr = builder.instr(instr_id);
            if instr.opcode.is_terminator() && pos != block.instrs.len() - 1 {
                return Err(Error::Bug(format!("block {idx} has a terminator before its last instruction")));
            }
            for arg in instr.args.iter().flatten() {
                if arg.0 as usize >= builder.values.len() {
                    return Err(Error::Bug(format!("instruction {} references out-of-range value {}", instr_id.0, arg.0)));
                }
            }
            if let Some(result) = instr.result {
                if result.0 as usize >= builder.values.len() {
                    return Err(Error::Bug(format!("instruction {} has an out-of-range result", instr_id.0)));
                }
            }
            validate_arity(instr.opcode, instr.args.iter().filter(|a| a.is_some()).count())?;
        }
    }
    Ok(())
}

fn validate_arity(opcode: Opcode, provided: usize) -> Result<()> {
    let expected = opcode.arity();
    if provided != expected && !matches!(opcode, Opcode::LoadContext | Opcode::LoadLocal) {
        return Err(Error::Bug(format!("{opcode:?} expects {expected} arguments, got {provided}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Builder;

    #[test]
    fn block_without_terminator_is_rejected() {
        let mut b = Builder::new();
        b.block();
        let c = b.alloc_constant(crate::ir::Constant::I32(1));
        b.emit_store_context(0, c);
        assert!(run(&b).is_err());
    }

    #[test]
    fn terminated_block_passes() {
        let mut b = Builder::new();
        let entry = b.block();
        b.emit_branch(entry);
        assert!(run(&b).is_ok());
    }

    #[test]
    fn terminator_must_be_the_last_instruction() {
        let mut b = Builder::new();
        let entry = b.block();
        b.emit_branch(entry);
        let branch_instr = b.blocks[entry.0 as usize].instrs[0];
        let c = b.alloc_constant(crate::ir::Constant::I32(0));
        b.set_insert_point(entry, Some(branch_instr));
        b.emit_store_context(0, c);
        assert!(run(&b).is_err());
    }
}
