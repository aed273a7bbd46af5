//! IR instructions.

use super::opcode::{OpFlags, Opcode};
use super::value::{InstrId, UseNode, ValueId};
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

pub struct Instr {
    pub opcode: Opcode,
    pub result: Option<ValueId>,
    pub args: [Option<ValueId>; 3],
    /// Pointer to this instruction's use-list node in each referenced
    /// argument value, for O(1) detach/relink. `None` where `args[i]` is
    /// `None` or refers to a constant that tracks no use-list.
    pub(crate) use_nodes: [Option<NonNull<UseNode>>; 3],
    /// Free-form word passes use to attach ordinals, marks, or other
    /// pass-local state.
    pub tag: i64,
    /// Byte offset within the SH4 context struct, for `load_context` /
    /// `store_context`; the local-slot offset, for `load_local` /
    /// `store_local`.
    pub context_offset: Option<u32>,
    pub flags: OpFlags,
    pub block: BlockId,
    /// The guest address this instruction originated from, used by the
    /// fastmem fault path to re-associate a faulting host instruction with
    /// the owning block.
    pub guest_addr: u32,
}

impl Instr {
    pub fn has_side_effect(&self) -> bool {
        self.opcode.has_side_effect() || self.flags.intersects(OpFlags::IF_INVALIDATE_CONTEXT | OpFlags::OP_FLAG_SET_SR | OpFlags::OP_FLAG_SET_FPSCR)
    }
}
