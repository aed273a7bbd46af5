//! Backend contract: an assembler from IR to an
//! executable runtime block, shared by the interpreter and x86-64 backends.

pub mod interpreter;
pub mod x64;

use bitflags::bitflags;

use crate::error::Result;
use crate::ir::Builder;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Recompile the next time `resolve` is asked for this slot.
        const BF_INVALIDATE = 1 << 0;
        /// Disable fastmem lowering for this block on its next compile.
        const BF_SLOWMEM = 1 << 1;
    }
}

impl Default for BlockFlags {
    fn default() -> Self {
        BlockFlags::empty()
    }
}

/// A physical register a backend exposes to the allocator: its name (for
/// diagnostics) and the value-type mask it can hold.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalRegister {
    pub name: &'static str,
    pub is_float: bool,
}

/// The callable entry point of a compiled block: `fn(ctx) -> next_pc`.
pub type BlockFn = unsafe extern "C" fn(*mut crate::frontend::sh4::SH4Context) -> u32;

pub struct RuntimeBlock {
    pub entry: BlockFn,
    pub guest_cycles: i32,
    pub flags: BlockFlags,
}

pub trait Backend {
    fn registers(&self) -> &'static [PhysicalRegister];

    /// Tells the backend whether the *next* `assemble` call should skip
    /// fastmem lowering for `load`/`store`, because the block being
    /// recompiled has already faulted through the fastmem path once.
    /// Backends without a fastmem path (the interpreter) ignore this.
    fn set_slowmem_hint(&mut self, _slowmem: bool) {}

    /// Lowers an optimized `Builder` into an executable runtime block.
    /// Returns `Err(Error::BufferOverflow)` when the code buffer is
    /// exhausted; the caller flushes the whole cache and retries once.
    fn assemble(&mut self, builder: &Builder) -> Result<RuntimeBlock>;

    /// Binds the address space pointer this backend's compiled blocks read
    /// from on the fastmem fault path. Backends without a
    /// fastmem path (the interpreter) ignore this.
    ///
    /// # Safety
    /// `memory` must outlive every compiled block this backend runs until
    /// the next call to `bind_memory` or the backend's own drop.
    unsafe fn bind_memory(&mut self, _memory: *const crate::address_space::AddressSpace) {}

    /// Drops every block this backend has emitted, freeing its code buffer.
    fn reset(&mut self);

    /// Attempts to resolve a host exception raised while executing code
    /// this backend emitted. On success, rewrites `ex.thread_state` so the
    /// faulting thread resumes past the fault; returns `true` if handled.
    fn handle_exception(&mut self, ex: &mut crate::exception::Exception) -> bool;
}
