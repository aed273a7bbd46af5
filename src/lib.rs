//! Dynamic binary-translation core for a Sega Dreamcast SH4 recompiler:
//! address space, exception interceptor, IR, optimizer, SH4 frontend,
//! interpreter/x86-64 backends, block cache, and scheduler. Peripheral
//! register files, disc/flash parsing, rendering, and UI are out of scope —
//! this crate exposes only the narrow contracts those layers plug into.

pub mod address_space;
pub mod backend;
pub mod block_cache;
pub mod config;
pub mod dreamcast;
pub mod error;
pub mod exception;
pub mod frontend;
pub mod ir;
pub mod layout;
pub mod scheduler;

pub use config::Config;
pub use dreamcast::Dreamcast;
pub use error::{Error, Result};
