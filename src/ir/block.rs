//! IR blocks.

use super::instr::BlockId;
use super::value::InstrId;

#[derive(Default)]
pub struct Block {
    /// Ordered list of instructions; `branch`/`branch_cond` appears only as
    /// the final element once the block is complete.
    pub instrs: Vec<InstrId>,
    /// Populated by the control-flow-analysis pass.
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
}

impl Block {
    pub fn new() -> Self {
        Block::default()
    }

    pub fn terminator(&self) -> Option<InstrId> {
        self.instrs.last().copied()
    }

    pub fn index_of(&self, instr: InstrId) -> Option<usize> {
        self.instrs.iter().position(|&i| i == instr)
    }
}
