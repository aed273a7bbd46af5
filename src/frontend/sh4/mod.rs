//! SH4 frontend: decode table, context layout, and IR emitters.

pub mod context;
pub mod decode;
pub mod emit;

pub use context::{FpuState, SH4Context};
pub use emit::{analyze_block, translate_block, AnalyzedBlock};
