//! Block cache: a direct-mapped table from guest PC to
//! compiled host function, indexed by `(guest_pc & 0x03ffffff) >> 1`. Every
//! slot holds either the compile trampoline or a previously emitted runtime
//! block; SMC detection, the fastmem recompile request, and FPSCR-precision
//! changes all invalidate through the same path.

use crate::backend::{Backend, BlockFn, BlockFlags};
use crate::config::CompileFlags;
use crate::error::{Error, Result};
use crate::frontend::sh4::{self, FpuState, SH4Context};

/// `1 << 23` direct-mapped slots.
pub const NUM_SLOTS: usize = 1 << 23;

fn slot_index(guest_pc: u32) -> usize {
    ((guest_pc & 0x03ff_ffff) >> 1) as usize
}

#[derive(Clone, Copy)]
struct Slot {
    entry: BlockFn,
    guest_cycles: i32,
    flags: BlockFlags,
    compiled: bool,
}

pub struct BlockCache<B: Backend> {
    slots: Vec<Slot>,
    backend: B,
    compile_flags: CompileFlags,
    /// Whether the most recent `resolve` call for each slot required a
    /// fresh compile in slowmem mode, keyed by slot index; read by
    /// `compile` to decide whether to disable fastmem lowering for the
    /// recompiled block.
    force_slowmem: std::collections::HashSet<usize>,
}

impl<B: Backend> BlockCache<B> {
    pub fn new(backend: B, compile_flags: CompileFlags) -> Self {
        let trampoline = Slot { entry: trampoline_fn, guest_cycles: 0, flags: BlockFlags::empty(), compiled: false };
        BlockCache { slots: vec![trampoline; NUM_SLOTS], backend, compile_flags, force_slowmem: std::collections::HashSet::new() }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Returns the direct-mapped slot's function pointer: either the
    /// compile trampoline or a valid runtime block.
    pub fn resolve(&self, guest_pc: u32) -> BlockFn {
        self.slots[slot_index(guest_pc)].entry
    }

    pub fn guest_cycles_of(&self, guest_pc: u32) -> i32 {
        self.slots[slot_index(guest_pc)].guest_cycles
    }

    /// Invoked by the trampoline (or directly, by callers that already know
    /// a slot needs recompiling) on first visit or after invalidation.
    /// Runs frontend → optimizer → backend; a single `BufferOverflow`
    /// flushes the whole cache and retries once, a second is fatal.
    pub fn compile(&mut self, memory: &crate::address_space::AddressSpace, pc: u32, fpu_state: FpuState) -> Result<BlockFn> {
        let slowmem = self.force_slowmem.remove(&slot_index(pc));
        match self.try_compile(memory, pc, fpu_state, slowmem) {
            Ok(entry) => Ok(entry),
            Err(Error::BufferOverflow) => {
                log::warn!("backend code buffer exhausted; flushing block cache and retrying pc={pc:#010x}");
                self.reset();
                self.try_compile(memory, pc, fpu_state, slowmem)
            }
            Err(e) => Err(e),
        }
    }

    fn try_compile(&mut self, memory: &crate::address_space::AddressSpace, pc: u32, fpu_state: FpuState, slowmem: bool) -> Result<BlockFn> {
        let single_instr = self.compile_flags.contains(CompileFlags::SH4_SINGLE_INSTR);
        let analyzed = sh4::analyze_block(memory, pc, fpu_state, 64, single_instr);
        let mut builder = sh4::translate_block(memory, &analyzed);
        crate::ir::passes::run(&mut builder)?;
        self.backend.set_slowmem_hint(slowmem);
        let mut block = self.backend.assemble(&builder)?;
        if slowmem {
            block.flags |= BlockFlags::BF_SLOWMEM;
        }
        let idx = slot_index(pc);
        self.slots[idx] = Slot { entry: block.entry, guest_cycles: block.guest_cycles, flags: block.flags, compiled: true };
        Ok(block.entry)
    }

    /// Resets an individual slot to the trampoline, forcing recompilation
    /// on its next resolve.
    pub fn invalidate(&mut self, guest_pc: u32) {
        let idx = slot_index(guest_pc);
        if self.slots[idx].flags.contains(BlockFlags::BF_SLOWMEM) {
            self.force_slowmem.insert(idx);
        }
        self.slots[idx] = Slot { entry: trampoline_fn, guest_cycles: 0, flags: BlockFlags::empty(), compiled: false };
    }

    /// Resets the whole table to the trampoline and drops every block the
    /// backend emitted.
    pub fn invalidate_all(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.backend.reset();
        for slot in &mut self.slots {
            *slot = Slot { entry: trampoline_fn, guest_cycles: 0, flags: BlockFlags::empty(), compiled: false };
        }
    }

    pub fn is_compiled(&self, guest_pc: u32) -> bool {
        self.slots[slot_index(guest_pc)].compiled
    }

    /// Marks the block owning `guest_pc` for recompilation in slowmem mode.
    /// Used by the fastmem fault path once it has rewritten the faulting
    /// host instruction pointer to resume in the thunk.
    pub fn mark_slowmem_and_invalidate(&mut self, guest_pc: u32) {
        let idx = slot_index(guest_pc);
        self.force_slowmem.insert(idx);
        self.slots[idx] = Slot { entry: trampoline_fn, guest_cycles: 0, flags: BlockFlags::BF_INVALIDATE | BlockFlags::BF_SLOWMEM, compiled: false };
    }
}

/// The compile trampoline:
/// compiles the block at `ctx.pc`, writes the cache update, then tail-calls
/// into the freshly compiled code. The active `BlockCache` is reached
/// through a thread-local set by [`Dreamcast::execute`] for the duration of
/// the SH4 device's `execute(cycles)` loop, since the ABI carries no
/// environment pointer.
thread_local! {
    static ACTIVE_CACHE: std::cell::Cell<Option<*mut ()>> = const { std::cell::Cell::new(None) };
}

/// Installs `cache` as the trampoline's target for the duration of `f`.
/// # Safety
/// `cache` must outlive the call to `f` and must not be concurrently
/// accessed from another thread.
pub unsafe fn with_active_cache<B: Backend, R>(cache: &mut BlockCache<B>, memory: *const crate::address_space::AddressSpace, f: impl FnOnce() -> R) -> R {
    let prev = ACTIVE_CACHE.with(|c| c.get());
    let ctx = TrampolineCtx { cache: cache as *mut BlockCache<B> as *mut (), memory, compile: trampoline_compile::<B> };
    let boxed = Box::new(ctx);
    ACTIVE_CACHE.with(|c| c.set(Some(Box::into_raw(boxed) as *mut ())));
    let result = f();
    let raw = ACTIVE_CACHE.with(|c| c.replace(prev));
    if let Some(raw) = raw {
        unsafe { drop(Box::from_raw(raw as *mut TrampolineCtx)) };
    }
    result
}

struct TrampolineCtx {
    cache: *mut (),
    memory: *const crate::address_space::AddressSpace,
    compile: unsafe fn(*mut (), *const crate::address_space::AddressSpace, *mut SH4Context) -> u32,
}

unsafe fn trampoline_compile<B: Backend>(cache: *mut (), memory: *const crate::address_space::AddressSpace, ctx: *mut SH4Context) -> u32 {
    let cache = unsafe { &mut *(cache as *mut BlockCache<B>) };
    let memory = unsafe { &*memory };
    let pc = unsafe { (*ctx).pc };
    let fpu_state = unsafe { (*ctx).fpu_state() };
    match cache.compile(memory, pc, fpu_state) {
        Ok(entry) => unsafe { entry(ctx) },
        Err(e) => {
            log::error!("fatal compile error at pc={pc:#010x}: {e}");
            pc
        }
    }
}

unsafe extern "C" fn trampoline_fn(ctx: *mut SH4Context) -> u32 {
    let raw = ACTIVE_CACHE.with(|c| c.get()).expect("trampoline invoked without an active block cache");
    let tctx = unsafe { &*(raw as *const TrampolineCtx) };
    unsafe { (tctx.compile)(tctx.cache, tctx.memory, ctx) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_mapped_index_wraps() {
        assert_eq!(slot_index(0x0c00_0000), slot_index(0x8c00_0000));
        assert_eq!(slot_index(0), 0);
    }
}
