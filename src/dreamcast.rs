//! The `Dreamcast` aggregate: owns the guest
//! address space, the scheduler, the block cache, and the SH4 register
//! file. Peripherals register their regions against [`Dreamcast::memory_mut`]
//! and unregister by dropping the returned handle; the scheduler drives the
//! SH4 itself as just another [`crate::scheduler::Device`], alongside
//! whatever ARM7/timer peripherals a caller adds with [`Dreamcast::add_device`].

use crate::address_space::AddressSpace;
use crate::backend::Backend;
use crate::block_cache::{with_active_cache, BlockCache};
use crate::config::Config;
use crate::error::Result;
use crate::exception::{self, Exception, HandlerToken};
use crate::frontend::sh4::SH4Context;
use crate::scheduler::{Device, DeviceHandle, Scheduler};

/// The SH4's real hardware clock.
pub const SH4_CLOCK_HZ: u64 = 200_000_000;

/// Owns every piece of guest state: the shadow-paged address space, the
/// block cache (parameterized over whichever [`Backend`] the caller picked),
/// the SH4 context, and the scheduler that drives the SH4 and any other
/// registered peripherals by clock-accurate cycle budgets.
///
/// Always heap-allocated: [`Dreamcast::new`] returns a `Box<Self>` because
/// the scheduler's SH4 device and the process-wide exception handler both
/// hold a raw pointer back to this struct (see [`Sh4Device`]) that must
/// outlive every call into generated code. A `Dreamcast` must never be moved
/// out of that box.
pub struct Dreamcast<B: Backend> {
    memory: AddressSpace,
    scheduler: Scheduler,
    cache: BlockCache<B>,
    context: SH4Context,
    sh4_device: DeviceHandle,
    exception_token: Option<HandlerToken>,
}

impl<B: Backend + 'static> Dreamcast<B> {
    /// Builds a fresh aggregate with an empty address space (no regions
    /// mounted yet — callers mount their own memory map via
    /// [`Dreamcast::memory_mut`] and [`AddressSpace::install_map`]) and
    /// registers the SH4 as scheduler device 0.
    pub fn new(config: Config, backend: B) -> Self {
        let mut dc = Dreamcast {
            memory: AddressSpace::new(),
            scheduler: Scheduler::new(),
            cache: BlockCache::new(backend, config.compile_flags),
            context: SH4Context::default(),
            sh4_device: 0,
            exception_token: None,
        };
        if config.block_flags.contains(crate::backend::BlockFlags::BF_SLOWMEM) {
            // Debug knob: force every block this session compiles through
            // the slow MMIO path instead of fastmem.
            dc.cache.backend_mut().set_slowmem_hint(true);
        }
        dc
    }

    /// Finishes wiring the aggregate up as a heap allocation: registers the
    /// SH4 scheduler device and the process-wide exception handler, both of
    /// which capture a raw pointer to `self` that must not outlive this box.
    ///
    /// Call once, immediately after [`Dreamcast::new`].
    pub fn boxed(config: Config, backend: B) -> Box<Self> {
        let mut dc = Box::new(Self::new(config, backend));
        let owner: *mut Dreamcast<B> = dc.as_mut();

        dc.sh4_device = dc.scheduler.add_device(Box::new(Sh4Device { owner }));

        let handler_ptr = SendPtr(owner);
        let token = exception::add_handler(Box::new(move |ex: &mut Exception| {
            // SAFETY: `owner` outlives this handler — it's removed in
            // `Dreamcast::drop` before the box is freed, and the emulation
            // thread is the only thread that ever faults into generated
            // code.
            let dc = unsafe { &mut *handler_ptr.0 };
            dc.cache.backend_mut().handle_exception(ex)
        }));
        dc.exception_token = Some(token);

        dc
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.memory
    }

    pub fn context(&self) -> &SH4Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SH4Context {
        &mut self.context
    }

    pub fn cache_mut(&mut self) -> &mut BlockCache<B> {
        &mut self.cache
    }

    /// Registers an additional scheduled peripheral (ARM7, timer-driven
    /// devices) alongside the SH4.
    pub fn add_device(&mut self, device: Box<dyn Device>) -> DeviceHandle {
        self.scheduler.add_device(device)
    }

    /// Invalidates the block covering `guest_pc`, forcing recompilation on
    /// its next resolve. Callers are responsible for calling this after any
    /// guest write to an executable range —
    /// this crate does not wire an automatic write-barrier, since that
    /// requires knowing which ranges are executable, a policy decision left
    /// to the frontend/peripheral combination driving this core.
    pub fn invalidate(&mut self, guest_pc: u32) {
        self.cache.invalidate(guest_pc);
    }

    pub fn invalidate_all(&mut self) {
        self.cache.invalidate_all();
    }

    /// Advances the whole system by `delta_ns` nanoseconds: the scheduler
    /// runs the SH4 and every other registered device in slices, firing
    /// timers at slice boundaries.
    pub fn tick(&mut self, delta_ns: u64) {
        self.scheduler.tick(delta_ns);
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// The SH4 execution loop: `pc = resolve(pc, ctx)(ctx)`
    /// while the cycle budget stays positive, deducting each returned
    /// block's precomputed guest-cycle cost. Invoked by [`Sh4Device::execute`]
    /// through the scheduler; also callable directly by a driver that
    /// doesn't need ARM7/timer peripherals.
    pub fn run_slice(&mut self, budget: u32) -> u32 {
        self.context.memory = &mut self.memory as *mut AddressSpace;
        let memory_ptr: *const AddressSpace = &self.memory;
        // SAFETY: `memory_ptr` outlives this call; the backend only reads
        // through it while handling a fault raised by code this same call
        // executes.
        unsafe { self.cache.backend_mut().bind_memory(memory_ptr) };

        let cache_ptr: *mut BlockCache<B> = &mut self.cache;
        let ctx_ptr: *mut SH4Context = &mut self.context;
        let mut remaining: i64 = budget as i64;
        let mut ran: u32 = 0;

        // SAFETY: `cache_ptr`/`ctx_ptr` are derived from `self`, which
        // outlives the call below; `with_active_cache`'s contract requires
        // the cache not be touched from another thread for the duration,
        // satisfied since the whole emulator is single-threaded.
        unsafe {
            with_active_cache(&mut *cache_ptr, memory_ptr, || {
                while remaining > 0 {
                    let cache = unsafe { &*cache_ptr };
                    let pc = unsafe { (*ctx_ptr).pc };
                    let entry = cache.resolve(pc);
                    let guest_cycles = cache.guest_cycles_of(pc).max(1);
                    let next_pc = unsafe { entry(ctx_ptr) };
                    unsafe { (*ctx_ptr).pc = next_pc };
                    remaining -= guest_cycles as i64;
                    ran = ran.saturating_add(guest_cycles as u32);
                }
            });
        }
        ran
    }
}

impl<B: Backend> Drop for Dreamcast<B> {
    fn drop(&mut self) {
        if let Some(token) = self.exception_token.take() {
            exception::remove_handler(token);
        }
    }
}

/// Thin [`Device`] adapter driving the SH4 through [`Dreamcast::run_slice`].
///
/// Holds a raw pointer back to its owning `Dreamcast` rather than a
/// reference because the scheduler (owned by that same `Dreamcast`) must
/// hold this device as `Box<dyn Device>` — an ownership cycle resolved the
/// same way [`crate::block_cache`]'s compile trampoline resolves its own
/// (a thread-local / raw pointer rather than a borrow). Sound because
/// [`Dreamcast::boxed`] only ever constructs this after the aggregate is
/// heap-allocated, so the address it captures is stable for the rest of
/// the aggregate's life.
struct Sh4Device<B: Backend> {
    owner: *mut Dreamcast<B>,
}

// SAFETY: the emulation thread is the only thread that ever calls
// `Device::execute` on a scheduler; `Box<dyn Device>` merely
// requires the bound to exist, not that the device actually cross threads.
unsafe impl<B: Backend> Send for Sh4Device<B> {}

impl<B: Backend> Device for Sh4Device<B> {
    fn clock_hz(&self) -> u64 {
        SH4_CLOCK_HZ
    }

    fn execute(&mut self, cycles: u32) -> u32 {
        let dc = unsafe { &mut *self.owner };
        dc.run_slice(cycles)
    }
}

/// A raw pointer wrapper asserting `Send + Sync` so it can live inside the
/// process-wide exception handler registry's `Box<dyn Fn(..) + Send + Sync>`.
/// Sound under the same single-emulation-thread contract as [`Sh4Device`]:
/// nothing ever accesses the pointee from a second thread.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::interpreter::InterpreterBackend;
    use crate::layout;

    fn boot_config() -> (Box<Dreamcast<InterpreterBackend>>, u32) {
        let mut dc = Dreamcast::boxed(Config::default(), InterpreterBackend::new());
        let region = dc.memory_mut().create_region_static(layout::MAIN_RAM_BEGIN, layout::MAIN_RAM_SIZE).unwrap();
        let mut map = crate::address_space::MemoryMap::new();
        map.mount(layout::MAIN_RAM_BEGIN, region);
        dc.memory_mut().install_map(&map).unwrap();
        (dc, region)
    }

    #[test]
    fn run_slice_executes_a_nop_loop() {
        let (mut dc, _region) = boot_config();
        // `nop` is opcode 0x0009; four of them followed by nothing decodable
        // ends the block naturally via `DecodeFailure`, which the analyzer
        // treats as an implicit fallthrough terminator.
        let nops: [u16; 4] = [0x0009, 0x0009, 0x0009, 0x0009];
        for (i, op) in nops.iter().enumerate() {
            dc.memory_mut().write16(layout::MAIN_RAM_BEGIN + (i as u32) * 2, *op);
        }
        dc.context_mut().pc = layout::MAIN_RAM_BEGIN;
        let ran = dc.run_slice(1000);
        assert!(ran > 0);
        assert!(dc.cache_mut().is_compiled(layout::MAIN_RAM_BEGIN));
    }

    #[test]
    fn tick_drives_sh4_alongside_a_timer() {
        let (mut dc, _region) = boot_config();
        dc.memory_mut().write16(layout::MAIN_RAM_BEGIN, 0x0009);
        dc.context_mut().pc = layout::MAIN_RAM_BEGIN;

        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired_cb = fired.clone();
        dc.scheduler_mut().add_oneshot_timer(500, Box::new(move || fired_cb.set(true)));

        dc.tick(1_000);
        assert!(fired.get());
    }
}
