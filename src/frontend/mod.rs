//! Guest instruction-set frontends. The SH4 is the only
//! frontend this core implements; the module is split out so a future ARM7
//! (AICA) frontend has somewhere to live without disturbing callers.

pub mod sh4;
