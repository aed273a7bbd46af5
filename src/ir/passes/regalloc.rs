//! Register allocation: a modified linear scan over one block
//! at a time, with two-operand reuse and furthest-next-use spilling.

use std::collections::HashMap;

use crate::ir::{BlockId, Builder, InstrId, Opcode, ValueId};

/// Number of integer and floating-point physical registers the backends
/// expose to the allocator. x86-64 SysV leaves rax/rcx/rdx/rsp/rbp reserved
/// for the backend's own scratch use and call-argument staging.
pub const NUM_INT_REGS: u8 = 11;
pub const NUM_FLOAT_REGS: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg(pub u8);

struct LiveEntry {
    value: ValueId,
    reg: PhysReg,
    next_use: i64,
}

struct ClassState {
    free: Vec<PhysReg>,
    live: Vec<LiveEntry>,
}

impl ClassState {
    fn new(count: u8) -> Self {
        ClassState { free: (0..count).map(PhysReg).rev().collect(), live: Vec::new() }
    }

    /// Removes every interval whose next use precedes `ordinal`, returning
    /// freed registers to the pool.
    fn expire(&mut self, ordinal: i64) {
        let mut i = 0;
        while i < self.live.len() {
            if self.live[i].next_use < ordinal {
                let entry = self.live.remove(i);
                self.free.push(entry.reg);
            } else {
                i += 1;
            }
        }
    }

    fn insert(&mut self, value: ValueId, reg: PhysReg, next_use: i64) {
        let pos = self.live.iter().position(|e| e.next_use > next_use).unwrap_or(self.live.len());
        self.live.insert(pos, LiveEntry { value, reg, next_use });
    }

    fn find(&self, value: ValueId) -> Option<usize> {
        self.live.iter().position(|e| e.value == value)
    }

    fn furthest(&self) -> usize {
        // live is sorted ascending by next_use; the furthest is the last entry.
        self.live.len() - 1
    }
}

type UseSites = HashMap<ValueId, Vec<(i64, InstrId, u8)>>;

pub fn run(builder: &mut Builder) {
    for block_idx in 0..builder.blocks.len() {
        allocate_block(builder, block_idx);
    }
}

fn allocate_block(builder: &mut Builder, block_idx: usize) {
    let instrs = builder.blocks[block_idx].instrs.clone();

    let mut ordinal_of: HashMap<InstrId, i64> = HashMap::new();
    let mut ordinal = 0i64;
    for &id in &instrs {
        builder.instr_mut(id).tag = ordinal;
        ordinal_of.insert(id, ordinal);
        ordinal += 10;
    }

    let mut use_sites: UseSites = HashMap::new();
    for &id in &instrs {
        let ord = ordinal_of[&id];
        let args = builder.instr(id).args;
        for (i, arg) in args.iter().enumerate() {
            if let Some(arg) = arg {
                use_sites.entry(*arg).or_default().push((ord, id, i as u8));
            }
        }
    }
    for sites in use_sites.values_mut() {
        sites.sort_by_key(|&(ord, _, _)| ord);
    }

    let mut ints = ClassState::new(NUM_INT_REGS);
    let mut floats = ClassState::new(NUM_FLOAT_REGS);

    let mut pos = 0usize;
    loop {
        if pos >= builder.blocks[block_idx].instrs.len() {
            break;
        }
        let id = builder.blocks[block_idx].instrs[pos];
        let Some(&ord) = ordinal_of.get(&id) else {
            // instruction inserted by a spill fixup in this same pass; skip.
            pos += 1;
            continue;
        };
        ints.expire(ord);
        floats.expire(ord);

        let instr = builder.instr(id);
        let opcode = instr.opcode;
        let args = instr.args;
        let result = instr.result;

        let Some(result) = result else {
            pos += 1;
            continue;
        };
        let ty = builder.ty_of(result);
        let is_float = ty.is_float();

        let arg0_reusable = opcode != Opcode::Select
            && args[0].is_some_and(|a| {
                let v = builder.value(a);
                !v.is_constant() && v.reg >= 0 && v.ty.is_float() == is_float && next_use_after(&use_sites, a, ord).is_none()
            });

        let reg = if arg0_reusable {
            let a = args[0].unwrap();
            let reg = PhysReg(builder.value(a).reg as u8);
            let class = if is_float { &mut floats } else { &mut ints };
            if let Some(idx) = class.find(a) {
                class.live.remove(idx);
            }
            reg
        } else {
            let class = if is_float { &mut floats } else { &mut ints };
            match class.free.pop() {
                Some(reg) => reg,
                None => spill_and_allocate(builder, block_idx, class, ord, &mut use_sites, &mut ordinal_of),
            }
        };

        builder.value_mut(result).reg = reg.0 as i32;
        let next = next_use_after(&use_sites, result, ord).unwrap_or(i64::MAX);
        if next != i64::MAX {
            let class = if is_float { &mut floats } else { &mut ints };
            class.insert(result, reg, next);
        }

        // A spill may have inserted a store_local/load_local before `id`'s
        // current position, shifting everything after it by one or more
        // slots; re-resolve `id`'s position rather than assuming `pos + 1`.
        pos = builder.blocks[block_idx].index_of(id).map(|i| i + 1).unwrap_or(pos + 1);
    }
}

fn next_use_after(use_sites: &UseSites, value: ValueId, ordinal: i64) -> Option<i64> {
    use_sites.get(&value).and_then(|sites| sites.iter().find(|&&(o, _, _)| o > ordinal).map(|&(o, _, _)| o))
}

/// Evicts the live interval with the furthest next use, spilling it to a
/// fresh local slot, and hands its freed register to the caller.
///
/// `ordinal_of`/`use_sites` are the same maps the main scan reads from; any
/// `load_local` this inserts to reload the victim must be registered into
/// both, or the scan would skip straight past it and the reloaded value
/// would never get a register of its own.
fn spill_and_allocate(
    builder: &mut Builder,
    block_idx: usize,
    class: &mut ClassState,
    current_ordinal: i64,
    use_sites: &mut UseSites,
    ordinal_of: &mut HashMap<InstrId, i64>,
) -> PhysReg {
    let victim_idx = class.furthest();
    let victim = class.live.remove(victim_idx);
    let ty = builder.value(victim.value).ty;
    let slot = builder.alloc_local(ty);

    let prev_instr = use_sites
        .get(&victim.value)
        .and_then(|sites| sites.iter().rev().find(|&&(o, _, _)| o <= current_ordinal).map(|&(_, instr, _)| instr))
        .or_else(|| find_def(builder, block_idx, victim.value));
    if let Some(prev_instr) = prev_instr {
        builder.set_insert_point(BlockId(block_idx as u32), Some(prev_instr));
        builder.emit_store_local(slot, victim.value);
    }

    if let Some((next_ord, next_instr, _)) = use_sites.get(&victim.value).and_then(|sites| sites.iter().find(|&&(o, _, _)| o > current_ordinal).copied()) {
        let block = &builder.blocks[block_idx];
        let idx = block.instrs.iter().position(|&i| i == next_instr).expect("next use site is in this block");
        let before = if idx == 0 { None } else { Some(block.instrs[idx - 1]) };
        builder.set_insert_point(BlockId(block_idx as u32), before);
        let loaded = builder.emit_load_local(slot, ty);
        let loaded_instr = InstrId((builder.instrs.len() - 1) as u32);

        // The reload sits strictly between `current_ordinal` and the use it
        // feeds; give it an ordinal in that gap (ordinals are spaced by 10)
        // so the main scan treats it like any other result-producing
        // instruction instead of silently skipping its register assignment.
        ordinal_of.insert(loaded_instr, next_ord - 1);

        rewrite_uses_from(builder, victim.value, loaded, next_ord, use_sites);

        // Move every use-site at or after `next_ord` from the victim onto
        // `loaded`, so later lookups (including the reload's own next-use
        // query) see them under the right key.
        if let Some(sites) = use_sites.get_mut(&victim.value) {
            let moved: Vec<_> = {
                let mut i = 0;
                let mut moved = Vec::new();
                while i < sites.len() {
                    if sites[i].0 >= next_ord {
                        moved.push(sites.remove(i));
                    } else {
                        i += 1;
                    }
                }
                moved
            };
            use_sites.entry(loaded).or_default().extend(moved);
        }
    }

    victim.reg
}

fn find_def(builder: &Builder, block_idx: usize, value: ValueId) -> Option<InstrId> {
    builder.blocks[block_idx].instrs.iter().copied().find(|&id| builder.instr(id).result == Some(value))
}

/// Redirects every use of `old` at or after `cutoff_ordinal` to `new`,
/// relinking the use-list nodes in place via their cached pointers.
fn rewrite_uses_from(builder: &mut Builder, old: ValueId, new: ValueId, cutoff_ordinal: i64, use_sites: &UseSites) {
    let Some(sites) = use_sites.get(&old) else { return };
    for &(ord, instr_id, arg_idx) in sites {
        if ord < cutoff_ordinal {
            continue;
        }
        let ptr = builder.instr(instr_id).use_nodes[arg_idx as usize];
        if let Some(ptr) = ptr {
            unsafe {
                let mut cursor = builder.value_mut(old).uses.cursor_mut_from_ptr(ptr.as_ptr());
                if let Some(node) = cursor.remove() {
                    builder.value_mut(new).uses.push_back(node);
                }
            }
        }
        builder.instr_mut(instr_id).args[arg_idx as usize] = Some(new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Opcode, ValueType};

    /// Scaled to this allocator's fixed 11-register integer class: load one
    /// more live `i32` than there are registers, keep every one of them live
    /// simultaneously, then drain them. Exactly one must spill, and at no
    /// ordinal does the live set exceed the register count.
    #[test]
    fn excess_live_values_spill_exactly_once() {
        let live_count = NUM_INT_REGS as usize + 1;
        let mut b = Builder::new();
        b.block();
        let loads: Vec<_> = (0..live_count).map(|i| b.emit_load_context((i as u32) * 4, ValueType::I32)).collect();
        // Store in reverse so every load is still live right after the last
        // one, maximizing overlap before any of them is consumed.
        for (i, &v) in loads.iter().enumerate().rev() {
            b.emit_store_context(1000 + (i as u32) * 4, v);
        }

        run(&mut b);

        let stores = b.blocks[0].instrs.iter().filter(|&&id| b.instr(id).opcode == Opcode::StoreLocal).count();
        let reload_id = b.blocks[0].instrs.iter().copied().find(|&id| b.instr(id).opcode == Opcode::LoadLocal);
        assert_eq!(stores, 1, "exactly one excess live value should be spilled to a local slot");
        let reload_id = reload_id.expect("exactly one reload should be emitted");

        // The reloaded value must itself get a real physical register —
        // every later instruction that consumes it reads `.reg` directly.
        let reloaded = b.instr(reload_id).result.expect("load_local produces a result");
        assert!(b.value(reloaded).reg >= 0, "reloaded value must receive a register, not stay at NO_REGISTER");

        for &id in &b.blocks[0].instrs {
            for arg in b.instr(id).args.iter().flatten() {
                assert!(b.value(*arg).reg >= 0, "every value consumed in the block must have a register assigned");
            }
        }
    }

    #[test]
    fn two_operand_reuse_skips_allocating_a_fresh_register() {
        let mut b = Builder::new();
        b.block();
        let a = b.emit_load_context(0, ValueType::I32);
        let c = b.emit_load_context(4, ValueType::I32);
        let sum = b.emit_add(a, c); // arg0 (`a`) has no further use past this point
        b.emit_store_context(8, sum);

        run(&mut b);

        let add_id = b.blocks[0].instrs.iter().copied().find(|&id| b.instr(id).opcode == Opcode::Add).unwrap();
        let add_result = b.instr(add_id).result.unwrap();
        assert_eq!(b.value(add_result).reg, b.value(a).reg, "add should inherit arg0's register");
    }
}
