//! Runtime configuration recognized by the core.

use bitflags::bitflags;

bitflags! {
    /// Flags a caller can pass into [`crate::block_cache::BlockCache::compile`]
    /// (or that the frontend consults while analyzing a block).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompileFlags: u32 {
        /// Stop analysis after exactly one decoded instruction. Used by the debugger
        /// single-step path.
        const SH4_SINGLE_INSTR = 1 << 0;
    }
}

/// Flags recorded on a compiled [`crate::backend::RuntimeBlock`]. Defined
/// alongside [`crate::backend::RuntimeBlock`] itself since backends are the
/// only code that sets them; re-exported here so callers configuring a
/// [`Config`] don't need to reach into `backend` for it.
pub use crate::backend::BlockFlags;

/// Extra diagnostic toggles; all are off by default and gate `log::trace!` output
/// rather than any bespoke printing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugOptions {
    /// Log the SH4 register file contents at block entry.
    pub log_regs: bool,
    /// Log every `load_register`/`store_register` helper call in the frontend.
    pub log_reg_access: bool,
    /// Log the IR builder contents before and after each optimizer pass.
    pub dump_ir: bool,
}

/// Top-level configuration passed to [`crate::dreamcast::Dreamcast::new`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub compile_flags: CompileFlags,
    pub block_flags: BlockFlags,
    pub debug: DebugOptions,
}

impl Default for CompileFlags {
    fn default() -> Self {
        CompileFlags::empty()
    }
}
