//! Load/store elimination: two linear scans per block over
//! context (guest-register) accesses only, never guest-memory loads/stores.

use std::collections::HashMap;

use crate::ir::{Builder, Opcode, OpFlags, ValueId, ValueType};

pub fn run(builder: &mut Builder) {
    let block_ids: Vec<_> = (0..builder.blocks.len()).collect();
    for idx in &block_ids {
        forward_scan(builder, *idx);
    }
    for idx in &block_ids {
        backward_scan(builder, *idx);
    }
}

/// Replaces a redundant `load_context(offset)` with the last value stored or
/// loaded at that offset, clearing the cache at any context-invalidating
/// instruction.
fn forward_scan(builder: &mut Builder, block_idx: usize) {
    let mut cached: HashMap<u32, ValueId> = HashMap::new();
    let instrs = builder.blocks[block_idx].instrs.clone();
    let mut to_remove = Vec::new();
    for instr_id in instrs {
        let instr = builder.instr(instr_id);
        if instr.flags.contains(OpFlags::IF_INVALIDATE_CONTEXT) {
            cached.clear();
            continue;
        }
        match instr.opcode {
            Opcode::LoadContext => {
                let offset = instr.context_offset.expect("load_context carries an offset");
                let result = instr.result.expect("load_context produces a result");
                let result_ty = builder.ty_of(result);
                if let Some(&cached_value) = cached.get(&offset) {
                    if builder.ty_of(cached_value) == result_ty {
                        builder.replace_all_uses_of(result, cached_value);
                        to_remove.push(instr_id);
                        continue;
                    }
                }
                cached.insert(offset, result);
            }
            Opcode::StoreContext => {
                let offset = instr.context_offset.expect("store_context carries an offset");
                let value = instr.args[0].expect("store_context carries a value");
                cached.insert(offset, value);
            }
            _ => {}
        }
    }
    for instr_id in to_remove {
        builder.remove_instr(instr_id);
    }
}

#[cfg(test)]
mod forward_tests {
    use super::*;
    use crate::ir::Constant;

    #[test]
    fn redundant_load_is_replaced_by_the_stored_value() {
        let mut b = Builder::new();
        let entry = b.block();
        let c = b.alloc_constant(Constant::I32(5));
        b.emit_store_context(0, c);
        let loaded = b.emit_load_context(0, ValueType::I32);
        b.emit_store_context(4, loaded);
        b.emit_branch(entry);

        run(&mut b);

        // The load_context(0) should be gone, replaced everywhere by `c`.
        assert!(!b.blocks[entry.0 as usize]
            .instrs
            .iter()
            .any(|&id| b.instr(id).opcode == Opcode::LoadContext));
    }

    #[test]
    fn invalidate_context_clears_the_cache() {
        let mut b = Builder::new();
        let entry = b.block();
        let c = b.alloc_constant(Constant::I32(5));
        b.emit_store_context(0, c);
        b.emit_invalidate_context();
        let loaded = b.emit_load_context(0, ValueType::I32);
        b.emit_store_context(4, loaded);
        b.emit_branch(entry);

        run(&mut b);

        // After an invalidation the load must survive — nothing cached to fold it into.
        assert!(b.blocks[entry.0 as usize]
            .instrs
            .iter()
            .any(|&id| b.instr(id).opcode == Opcode::LoadContext));
    }
}

/// Removes a `store_context(offset, v)` made dead by a later, at-least-as-wide
/// store to the same offset with no intervening context invalidation.
fn backward_scan(builder: &mut Builder, block_idx: usize) {
    let mut next_store: HashMap<u32, ValueType> = HashMap::new();
    let instrs = builder.blocks[block_idx].instrs.clone();
    let mut to_remove = Vec::new();
    for instr_id in instrs.into_iter().rev() {
        let instr = builder.instr(instr_id);
        if instr.flags.contains(OpFlags::IF_INVALIDATE_CONTEXT) {
            next_store.clear();
            continue;
        }
        if instr.opcode == Opcode::StoreContext {
            let offset = instr.context_offset.expect("store_context carries an offset");
            let value = instr.args[0].expect("store_context carries a value");
            let ty = builder.ty_of(value);
            if let Some(&later_ty) = next_store.get(&offset) {
                if later_ty.bits() >= ty.bits() {
                    to_remove.push(instr_id);
                    continue;
                }
            }
            next_store.insert(offset, ty);
        }
    }
    for instr_id in to_remove {
        builder.remove_instr(instr_id);
    }
}

#[cfg(test)]
mod backward_tests {
    use super::*;
    use crate::ir::Constant;

    #[test]
    fn superseded_store_is_removed() {
        let mut b = Builder::new();
        let entry = b.block();
        let first = b.alloc_constant(Constant::I32(1));
        let second = b.alloc_constant(Constant::I32(2));
        b.emit_store_context(0, first);
        b.emit_store_context(0, second);
        b.emit_branch(entry);

        run(&mut b);
        let store_count = b.blocks[entry.0 as usize].instrs.iter().filter(|&&id| b.instr(id).opcode == Opcode::StoreContext).count();
        assert_eq!(store_count, 1);
    }

    #[test]
    fn narrower_later_store_does_not_eliminate_a_wider_earlier_one() {
        let mut b = Builder::new();
        let entry = b.block();
        let wide = b.alloc_constant(Constant::I32(1));
        let narrow = b.alloc_constant(Constant::I8(2));
        b.emit_store_context(0, wide);
        b.emit_store_context(0, narrow);
        b.emit_branch(entry);

        run(&mut b);
        let store_count = b.blocks[entry.0 as usize].instrs.iter().filter(|&&id| b.instr(id).opcode == Opcode::StoreContext).count();
        assert_eq!(store_count, 2);
    }
}
