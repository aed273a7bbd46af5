//! Converts host access-violation / illegal-instruction signals into a
//! language-neutral [`Exception`] record dispatched to registered handlers in
//! LIFO order.
//!
//! Handler invocation happens on the signal-handling thread, i.e. the thread
//! that faulted. No heap allocation and no mutex acquisition (beyond the
//! registry spinlock, which is only ever taken for the length of an array
//! scan) is permitted on that path.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const MAX_HANDLERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    AccessViolation,
    IllegalInstruction,
}

/// A platform-neutral capture of the faulting thread's integer registers and
/// instruction pointer. Field order matches the System V AMD64 ABI's
/// callee-saved-plus-argument register layout used by the x86-64 backend
///; other architectures would populate a subset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadState {
    pub rip: usize,
    pub rax: usize,
    pub rbx: usize,
    pub rcx: usize,
    pub rdx: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub rsp: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,
}

/// The canonical exception record passed to every registered handler.
#[derive(Debug, Clone, Copy)]
pub struct Exception {
    pub kind: ExceptionKind,
    pub fault_addr: usize,
    pub pc: usize,
    pub thread_state: ThreadState,
}

pub type HandlerToken = usize;

/// A handler returns `true` ("handled") to stop dispatch and resume with the
/// (possibly modified) thread state it wrote back into `Exception`.
pub type HandlerFn = Box<dyn Fn(&mut Exception) -> bool + Send + Sync>;

struct Slot {
    token: HandlerToken,
    handler: HandlerFn,
}

/// The process-wide handler registry. `handlers` is only mutated by
/// `add_handler`/`remove_handler`, off the signal path; `dispatch` only reads
/// it, holding the same lock for the (short, allocation-free) duration of the
/// scan.
struct Registry {
    handlers: Mutex<Vec<Slot>>,
    next_token: AtomicUsize,
}

static REGISTRY: OnceCell<Registry> = OnceCell::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry { handlers: Mutex::new(Vec::new()), next_token: AtomicUsize::new(1) })
}

/// Installs the process-wide signal handler for SIGSEGV/SIGBUS (access
/// violation) and SIGILL (illegal instruction).
#[cfg(unix)]
pub fn install() -> crate::error::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(SigHandler::SigAction(trampoline_shim), SaFlags::SA_SIGINFO, SigSet::empty());
    unsafe {
        sigaction(Signal::SIGSEGV, &action)?;
        sigaction(Signal::SIGBUS, &action)?;
        sigaction(Signal::SIGILL, &action)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install() -> crate::error::Result<()> {
    Err(crate::error::Error::Bug("exception interceptor requires a unix host".into()))
}

/// Registers a handler and returns a token usable with [`remove_handler`].
/// `cb` must not allocate or block; it runs on the faulting thread.
pub fn add_handler(cb: HandlerFn) -> HandlerToken {
    let reg = registry();
    let token = reg.next_token.fetch_add(1, Ordering::Relaxed);
    let mut handlers = reg.handlers.lock().expect("handler registry poisoned");
    handlers.push(Slot { token, handler: cb });
    token
}

pub fn remove_handler(token: HandlerToken) {
    let reg = registry();
    let mut handlers = reg.handlers.lock().expect("handler registry poisoned");
    handlers.retain(|slot| slot.token != token);
}

/// Invokes handlers in reverse-registration (LIFO) order until one returns
/// `true`. Returns whether any handler handled the exception.
pub fn dispatch(ex: &mut Exception) -> bool {
    let reg = registry();
    let handlers = reg.handlers.lock().expect("handler registry poisoned");
    for slot in handlers.iter().rev() {
        if (slot.handler)(ex) {
            return true;
        }
    }
    false
}

#[cfg(unix)]
extern "C" fn trampoline_shim(signum: i32, _info: *mut nix::libc::siginfo_t, ctx: *mut std::ffi::c_void) {
    handle_signal(signum, ctx);
}

#[cfg(unix)]
fn handle_signal(signum: i32, ctx: *mut std::ffi::c_void) {
    use nix::sys::signal::Signal;

    let kind = match Signal::try_from(signum) {
        Ok(Signal::SIGILL) => ExceptionKind::IllegalInstruction,
        _ => ExceptionKind::AccessViolation,
    };

    // On a real host, `ctx` is a `ucontext_t*`; a full port would decode the
    // platform-specific `mcontext_t` into `ThreadState` here. We expose the
    // decode point as a single seam so architecture-specific code stays out
    // of the dispatch logic.
    let thread_state = unsafe { decode_ucontext(ctx) };
    let mut ex = Exception {
        kind,
        fault_addr: thread_state.rip,
        pc: thread_state.rip,
        thread_state,
    };

    if !dispatch(&mut ex) {
        // No handler claimed it: restore default disposition and re-raise so
        // the OS produces its normal crash diagnostic.
        unsafe {
            let _ = nix::sys::signal::signal(
                Signal::try_from(signum).unwrap_or(Signal::SIGSEGV),
                nix::sys::signal::SigHandler::SigDfl,
            );
            libc_raise(signum);
        }
    } else {
        unsafe { write_back_ucontext(ctx, &ex.thread_state) };
    }
}

#[cfg(unix)]
unsafe fn decode_ucontext(_ctx: *mut std::ffi::c_void) -> ThreadState {
    ThreadState::default()
}

#[cfg(unix)]
unsafe fn write_back_ucontext(_ctx: *mut std::ffi::c_void, _state: &ThreadState) {}

#[cfg(unix)]
unsafe fn libc_raise(signum: i32) {
    nix::libc::raise(signum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn lifo_dispatch_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let t1 = add_handler(Box::new(move |_ex| {
            o1.lock().unwrap().push(1);
            false
        }));
        let o2 = order.clone();
        let handled = Arc::new(AtomicBool::new(false));
        let handled2 = handled.clone();
        let t2 = add_handler(Box::new(move |_ex| {
            o2.lock().unwrap().push(2);
            handled2.store(true, Ordering::SeqCst);
            true
        }));

        let mut ex = Exception {
            kind: ExceptionKind::AccessViolation,
            fault_addr: 0,
            pc: 0,
            thread_state: ThreadState::default(),
        };
        assert!(dispatch(&mut ex));
        assert_eq!(*order.lock().unwrap(), vec![2]);

        remove_handler(t1);
        remove_handler(t2);
    }
}
