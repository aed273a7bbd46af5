//! The optimizer pipeline: validate, control-flow analysis,
//! load/store elimination, constant propagation, dead-code elimination,
//! register allocation, run in that fixed order.

mod cfa;
mod constant_prop;
mod dce;
mod load_store_elim;
mod regalloc;
mod validate;

pub use regalloc::PhysReg;

use crate::error::Result;
use crate::ir::Builder;

pub fn run(builder: &mut Builder) -> Result<()> {
    validate::run(builder)?;
    cfa::run(builder);
    load_store_elim::run(builder);
    constant_prop::run(builder);
    dce::run(builder);
    regalloc::run(builder);
    Ok(())
}
