//! SH4 instruction emitters: analyzes a guest instruction
//! range into a block boundary, then lowers each instruction to IR via a
//! per-opcode emitter function, threading delay slots through correctly.

use crate::address_space::AddressSpace;
use crate::ir::{Builder, Constant, OpFlags, ValueId, ValueType};

use super::context::{fpscr_bits, offsets, sr_bits, FpuState};
use super::decode::{self, Decoded, Op};

pub struct AnalyzedBlock {
    pub start_addr: u32,
    pub end_addr: u32,
    pub num_instrs: u32,
    pub fpu_state: FpuState,
}

/// Advances through guest memory two bytes at a time (four across a delay
/// slot) until the first terminator: a branch-flagged instruction, or one
/// that sets SR or FPSCR.
pub fn analyze_block(memory: &AddressSpace, start_addr: u32, fpu_state: FpuState, max_instrs: u32, single_instr: bool) -> AnalyzedBlock {
    let mut addr = start_addr;
    let mut count = 0u32;
    loop {
        let code = memory.read16(addr);
        let decoded = decode::decode(addr, code);
        count += 1;
        let mut delayed = false;
        if let Some(decoded) = &decoded {
            let spec = decode::spec_of(decoded);
            delayed = spec.flags.contains(OpFlags::OP_FLAG_DELAYED);
            addr = addr.wrapping_add(2);
            if delayed {
                addr = addr.wrapping_add(2);
                count += 1;
            }
            if single_instr {
                break;
            }
            if spec.flags.contains(OpFlags::OP_FLAG_BRANCH) || spec.flags.contains(OpFlags::OP_FLAG_SET_SR) || spec.flags.contains(OpFlags::OP_FLAG_SET_FPSCR) {
                break;
            }
        } else {
            addr = addr.wrapping_add(2);
            if single_instr {
                break;
            }
        }
        let _ = delayed;
        if count >= max_instrs {
            break;
        }
    }
    AnalyzedBlock { start_addr, end_addr: addr, num_instrs: count, fpu_state }
}

/// Lowers the analyzed instruction range into IR, recursively translating a
/// delay-slot instruction at `pc+2` before the branch's own effect.
pub fn translate_block(memory: &AddressSpace, analyzed: &AnalyzedBlock) -> Builder {
    let mut b = Builder::new();
    b.block();
    b.metadata.entry_pc = analyzed.start_addr;
    let mut pc = analyzed.start_addr;
    let mut remaining = analyzed.num_instrs;
    // Tracks whether the last instruction translated already wrote `PC`
    // itself (any branch op); only then can the trailing fallthrough store
    // be skipped without losing the real target.
    let mut last_was_branch = false;
    while pc < analyzed.end_addr && remaining > 0 {
        let code = memory.read16(pc);
        let Some(decoded) = decode::decode(pc, code) else {
            pc = pc.wrapping_add(2);
            remaining -= 1;
            last_was_branch = false;
            continue;
        };
        let spec = decode::spec_of(&decoded);
        b.metadata.guest_cycles += spec.cycles as i32;
        let delayed = spec.flags.contains(OpFlags::OP_FLAG_DELAYED);
        last_was_branch = spec.flags.contains(OpFlags::OP_FLAG_BRANCH);

        if delayed {
            let slot_pc = pc.wrapping_add(2);
            let slot_code = memory.read16(slot_pc);
            emit_one(&mut b, &decoded, analyzed.fpu_state);
            if let Some(slot_decoded) = decode::decode(slot_pc, slot_code) {
                emit_one(&mut b, &slot_decoded, analyzed.fpu_state);
            }
            pc = slot_pc.wrapping_add(2);
            remaining = remaining.saturating_sub(2);
        } else {
            emit_one(&mut b, &decoded, analyzed.fpu_state);
            pc = pc.wrapping_add(2);
            remaining -= 1;
        }
    }
    if !last_was_branch {
        let next_pc = b.alloc_constant(Constant::I32(analyzed.end_addr as i32));
        store_pc(&mut b, next_pc);
        let fallthrough = b.block();
        b.emit_branch(fallthrough);
    }
    b
}

fn emit_one(b: &mut Builder, decoded: &Decoded, fpu: FpuState) {
    let spec = decode::spec_of(decoded);
    let rm = decoded.rm as usize;
    let rn = decoded.rn as usize;
    let imm = decoded.imm as i32;
    let disp = decoded.disp as i32;
    let _ = fpu;
    match spec.op {
        Op::Nop | Op::Sleep => {}
        Op::MovImm => {
            let c = b.alloc_constant(Constant::I32(sign_extend(imm, 8)));
            store_register(b, rn, c);
        }
        Op::MovReg => {
            let v = load_register(b, rm, ValueType::I32);
            store_register(b, rn, v);
        }
        Op::MovLoadDisp => {
            let base = load_register(b, rm, ValueType::I32);
            let off = b.alloc_constant(Constant::I32(disp * 4));
            let addr = b.emit_add(base, off);
            let v = b.emit_load(addr, ValueType::I32);
            store_register(b, rn, v);
        }
        Op::MovStoreDisp => {
            let base = load_register(b, rn, ValueType::I32);
            let off = b.alloc_constant(Constant::I32(disp * 4));
            let addr = b.emit_add(base, off);
            let v = load_register(b, rm, ValueType::I32);
            b.emit_store(addr, v);
        }
        Op::MovLoadIndexed => {
            let r0 = load_register(b, 0, ValueType::I32);
            let base = load_register(b, rm, ValueType::I32);
            let addr = b.emit_add(base, r0);
            let v = b.emit_load(addr, ValueType::I32);
            store_register(b, rn, v);
        }
        Op::MovStoreIndexed => {
            let r0 = load_register(b, 0, ValueType::I32);
            let base = load_register(b, rn, ValueType::I32);
            let addr = b.emit_add(base, r0);
            let v = load_register(b, rm, ValueType::I32);
            b.emit_store(addr, v);
        }
        Op::MovLoadPostInc => {
            let base = load_register(b, rm, ValueType::I32);
            let v = b.emit_load(base, ValueType::I32);
            let four = b.alloc_constant(Constant::I32(4));
            let next = b.emit_add(base, four);
            store_register(b, rm, next);
            store_register(b, rn, v);
        }
        Op::MovStorePreDec => {
            let base = load_register(b, rn, ValueType::I32);
            let four = b.alloc_constant(Constant::I32(4));
            let addr = b.emit_sub(base, four);
            let v = load_register(b, rm, ValueType::I32);
            b.emit_store(addr, v);
            store_register(b, rn, addr);
        }
        Op::Add => binary_rn_rm(b, rn, rm, Builder::emit_add),
        Op::AddImm => {
            let a = load_register(b, rn, ValueType::I32);
            let c = b.alloc_constant(Constant::I32(sign_extend(imm, 8)));
            let result = b.emit_add(a, c);
            store_register(b, rn, result);
        }
        Op::Sub => binary_rn_rm(b, rn, rm, Builder::emit_sub),
        Op::MulL | Op::Dmulu => binary_rn_rm(b, rn, rm, Builder::emit_umul),
        Op::Dmuls => binary_rn_rm(b, rn, rm, Builder::emit_mul),
        Op::And => binary_rn_rm(b, rn, rm, Builder::emit_and),
        Op::AndImm => {
            let a = load_register(b, 0, ValueType::I32);
            let c = b.alloc_constant(Constant::I32(imm));
            let result = b.emit_and(a, c);
            store_register(b, 0, result);
        }
        Op::Or => binary_rn_rm(b, rn, rm, Builder::emit_or),
        Op::OrImm => {
            let a = load_register(b, 0, ValueType::I32);
            let c = b.alloc_constant(Constant::I32(imm));
            let result = b.emit_or(a, c);
            store_register(b, 0, result);
        }
        Op::Xor => binary_rn_rm(b, rn, rm, Builder::emit_xor),
        Op::XorImm => {
            let a = load_register(b, 0, ValueType::I32);
            let c = b.alloc_constant(Constant::I32(imm));
            let result = b.emit_xor(a, c);
            store_register(b, 0, result);
        }
        Op::Not => {
            let v = load_register(b, rm, ValueType::I32);
            let result = b.emit_not(v);
            store_register(b, rn, result);
        }
        Op::Shll => shift_const(b, rn, 1, true),
        Op::Shlr => shift_const(b, rn, -1, true),
        Op::Shll2 => shift_const(b, rn, 2, false),
        Op::Shlr2 => shift_const(b, rn, -2, false),
        Op::Shar => {
            let v = load_register(b, rn, ValueType::I32);
            let one = b.alloc_constant(Constant::I32(1));
            let result = b.emit_ashr(v, one);
            store_register(b, rn, result);
            store_t(b, result);
        }
        Op::CmpEq => compare(b, rn, rm, Builder::emit_cmp_eq),
        Op::CmpEqImm => {
            let a = load_register(b, 0, ValueType::I32);
            let c = b.alloc_constant(Constant::I32(sign_extend(imm, 8)));
            let t = b.emit_cmp_eq(a, c);
            store_t(b, t);
        }
        Op::CmpGt => compare(b, rn, rm, Builder::emit_cmp_sgt),
        Op::CmpGe => compare(b, rn, rm, Builder::emit_cmp_sge),
        Op::CmpHi => compare(b, rn, rm, Builder::emit_cmp_ugt),
        Op::CmpHs => compare(b, rn, rm, Builder::emit_cmp_uge),
        Op::CmpPz => {
            let v = load_register(b, rn, ValueType::I32);
            let zero = b.alloc_constant(Constant::I32(0));
            let t = b.emit_cmp_sge(v, zero);
            store_t(b, t);
        }
        Op::CmpPl => {
            let v = load_register(b, rn, ValueType::I32);
            let zero = b.alloc_constant(Constant::I32(0));
            let t = b.emit_cmp_sgt(v, zero);
            store_t(b, t);
        }
        Op::Tst => {
            let a = load_register(b, rn, ValueType::I32);
            let c = load_register(b, rm, ValueType::I32);
            let and = b.emit_and(a, c);
            let zero = b.alloc_constant(Constant::I32(0));
            let t = b.emit_cmp_eq(and, zero);
            store_t(b, t);
        }
        Op::Bra | Op::Bsr => {
            if spec.op == Op::Bsr {
                let pr = b.alloc_constant(Constant::I32((decoded.addr.wrapping_add(4)) as i32));
                store_register_field(b, offsets::PR, pr);
            }
            let target = branch_target(decoded, disp);
            let next_pc = b.alloc_constant(Constant::I32(target as i32));
            store_pc(b, next_pc);
        }
        Op::Bt | Op::Bf | Op::BtS | Op::BfS => {
            let t = load_t(b);
            let want_true = matches!(spec.op, Op::Bt | Op::BtS);
            let taken_pc = b.alloc_constant(Constant::I32(branch_target(decoded, disp) as i32));
            let next_pc = b.alloc_constant(Constant::I32(decoded.addr.wrapping_add(if matches!(spec.op, Op::BtS | Op::BfS) { 4 } else { 2 }) as i32));
            let (if_true, if_false) = if want_true { (taken_pc, next_pc) } else { (next_pc, taken_pc) };
            let selected = b.emit_select(t, if_true, if_false);
            store_pc(b, selected);
        }
        Op::Jmp => {
            let target = load_register(b, rn, ValueType::I32);
            store_pc(b, target);
        }
        Op::Jsr => {
            let pr = b.alloc_constant(Constant::I32(decoded.addr.wrapping_add(4) as i32));
            store_register_field(b, offsets::PR, pr);
            let target = load_register(b, rn, ValueType::I32);
            store_pc(b, target);
        }
        Op::Rts => {
            let pr = load_register_field(b, offsets::PR, ValueType::I32);
            store_pc(b, pr);
        }
        Op::LdcSr => {
            let v = load_register(b, rn, ValueType::I32);
            store_sr(b, v);
        }
        Op::StcSr => {
            let v = load_sr(b);
            store_register(b, rn, v);
        }
        Op::LdsPr => {
            let v = load_register(b, rn, ValueType::I32);
            store_register_field(b, offsets::PR, v);
        }
        Op::StsPr => {
            let v = load_register_field(b, offsets::PR, ValueType::I32);
            store_register(b, rn, v);
        }
        Op::LdsFpscr => {
            let base = load_register(b, rn, ValueType::I32);
            let v = b.emit_load(base, ValueType::I32);
            let four = b.alloc_constant(Constant::I32(4));
            let next = b.emit_add(base, four);
            store_register(b, rn, next);
            store_fpscr(b, v);
        }
        Op::Fadd => float_binary(b, rn, rm, fpu, Builder::emit_add),
        Op::Fsub => float_binary(b, rn, rm, fpu, Builder::emit_sub),
        Op::Fmul => float_binary(b, rn, rm, fpu, Builder::emit_mul),
        Op::Fdiv => float_binary(b, rn, rm, fpu, Builder::emit_div),
        Op::FcmpEq => {
            let ty = float_ty(fpu);
            let a = load_register_f(b, rn, ty);
            let c = load_register_f(b, rm, ty);
            let t = b.emit_cmp_eq(a, c);
            store_t(b, t);
        }
        Op::FcmpGt => {
            let ty = float_ty(fpu);
            let a = load_register_f(b, rn, ty);
            let c = load_register_f(b, rm, ty);
            let t = b.emit_cmp_sgt(a, c);
            store_t(b, t);
        }
        Op::Fmov => {
            let ty = float_ty(fpu);
            let v = load_register_f(b, rm, ty);
            store_register_f(b, rn, v);
        }
        Op::Flds => {
            let v = load_register_f(b, rn, ValueType::F32);
            store_register_field(b, offsets::FPUL, v);
        }
        Op::Fsts => {
            let v = load_register_field(b, offsets::FPUL, ValueType::F32);
            store_register_f(b, rn, v);
        }
        Op::Float => {
            let v = load_register_field(b, offsets::FPUL, ValueType::I32);
            let ty = float_ty(fpu);
            let result = b.emit_cast(ty, v);
            store_register_f(b, rn, result);
        }
        Op::Ftrc => {
            let ty = float_ty(fpu);
            let v = load_register_f(b, rn, ty);
            let result = b.emit_cast(ValueType::I32, v);
            store_register_field(b, offsets::FPUL, result);
        }
        Op::Fneg => {
            let ty = float_ty(fpu);
            let v = load_register_f(b, rn, ty);
            let result = b.emit_neg(v);
            store_register_f(b, rn, result);
        }
        Op::Fabs => {
            let ty = float_ty(fpu);
            let v = load_register_f(b, rn, ty);
            let result = b.emit_abs(v);
            store_register_f(b, rn, result);
        }
        Op::Fsqrt => {
            let ty = float_ty(fpu);
            let v = load_register_f(b, rn, ty);
            let result = b.emit_sqrt(v);
            store_register_f(b, rn, result);
        }
    }
}

fn sign_extend(v: i32, bits: u32) -> i32 {
    let shift = 32 - bits;
    (v << shift) >> shift
}

fn branch_target(decoded: &Decoded, disp: i32) -> u32 {
    let signed_disp = sign_extend(disp, 12) * 2;
    decoded.addr.wrapping_add(4).wrapping_add(signed_disp as u32)
}

fn binary_rn_rm(b: &mut Builder, rn: usize, rm: usize, op: impl Fn(&mut Builder, ValueId, ValueId) -> ValueId) {
    let a = load_register(b, rn, ValueType::I32);
    let c = load_register(b, rm, ValueType::I32);
    let result = op(b, a, c);
    store_register(b, rn, result);
}

fn compare(b: &mut Builder, rn: usize, rm: usize, op: impl Fn(&mut Builder, ValueId, ValueId) -> ValueId) {
    let a = load_register(b, rn, ValueType::I32);
    let c = load_register(b, rm, ValueType::I32);
    let t = op(b, a, c);
    store_t(b, t);
}

fn shift_const(b: &mut Builder, rn: usize, amount: i32, set_t_flag: bool) {
    let v = load_register(b, rn, ValueType::I32);
    let result = if amount > 0 {
        let c = b.alloc_constant(Constant::I32(amount));
        b.emit_shl(v, c)
    } else {
        let c = b.alloc_constant(Constant::I32(-amount));
        b.emit_lshr(v, c)
    };
    store_register(b, rn, result);
    if set_t_flag {
        let zero = b.alloc_constant(Constant::I32(0));
        let msb_pos = b.alloc_constant(Constant::I32(if amount > 0 { 31 } else { 0 }));
        let bit = b.emit_ashr(v, msb_pos);
        let _ = zero;
        let one = b.alloc_constant(Constant::I32(1));
        let t = b.emit_and(bit, one);
        store_t(b, t);
    }
}

fn float_binary(b: &mut Builder, rn: usize, rm: usize, fpu: FpuState, op: impl Fn(&mut Builder, ValueId, ValueId) -> ValueId) {
    let ty = float_ty(fpu);
    let a = load_register_f(b, rn, ty);
    let c = load_register_f(b, rm, ty);
    let result = op(b, a, c);
    store_register_f(b, rn, result);
}

fn float_ty(fpu: FpuState) -> ValueType {
    if fpu.double_pr {
        ValueType::F64
    } else {
        ValueType::F32
    }
}

// -- context helpers exposed to emitters -----------------

pub fn load_register(b: &mut Builder, n: usize, ty: ValueType) -> ValueId {
    b.emit_load_context(offsets::r(n), ty)
}

pub fn store_register(b: &mut Builder, n: usize, v: ValueId) {
    b.emit_store_context(offsets::r(n), v)
}

pub fn load_register_f(b: &mut Builder, n: usize, ty: ValueType) -> ValueId {
    b.emit_load_context(offsets::fr(n), ty)
}

pub fn store_register_f(b: &mut Builder, n: usize, v: ValueId) {
    b.emit_store_context(offsets::fr(n), v)
}

pub fn load_register_xf(b: &mut Builder, n: usize, ty: ValueType) -> ValueId {
    b.emit_load_context(offsets::xf(n), ty)
}

pub fn store_register_xf(b: &mut Builder, n: usize, v: ValueId) {
    b.emit_store_context(offsets::xf(n), v)
}

fn load_register_field(b: &mut Builder, offset: u32, ty: ValueType) -> ValueId {
    b.emit_load_context(offset, ty)
}

fn store_register_field(b: &mut Builder, offset: u32, v: ValueId) {
    b.emit_store_context(offset, v)
}

pub fn load_sr(b: &mut Builder) -> ValueId {
    b.emit_load_context(offsets::SR, ValueType::I32)
}

/// SR writes invalidate the whole context cache: unmasked interrupts can
/// observe any register between this instruction and the next.
pub fn store_sr(b: &mut Builder, v: ValueId) {
    b.emit_store_context_flagged(offsets::SR, v, OpFlags::IF_INVALIDATE_CONTEXT | OpFlags::OP_FLAG_SET_SR);
}

pub fn load_gbr(b: &mut Builder) -> ValueId {
    b.emit_load_context(offsets::GBR, ValueType::I32)
}

pub fn store_gbr(b: &mut Builder, v: ValueId) {
    b.emit_store_context(offsets::GBR, v)
}

pub fn load_fpscr(b: &mut Builder) -> ValueId {
    b.emit_load_context(offsets::FPSCR, ValueType::I32)
}

/// FPSCR writes invalidate the context cache: the block's captured
/// `fpu_state` no longer matches the live precision mode past this point.
pub fn store_fpscr(b: &mut Builder, v: ValueId) {
    b.emit_store_context_flagged(offsets::FPSCR, v, OpFlags::IF_INVALIDATE_CONTEXT | OpFlags::OP_FLAG_SET_FPSCR);
}

pub fn load_pr(b: &mut Builder) -> ValueId {
    b.emit_load_context(offsets::PR, ValueType::I32)
}

pub fn store_pr(b: &mut Builder, v: ValueId) {
    b.emit_store_context(offsets::PR, v)
}

pub fn load_t(b: &mut Builder) -> ValueId {
    b.emit_load_context(offsets::T, ValueType::I8)
}

pub fn store_t(b: &mut Builder, v: ValueId) {
    b.emit_store_context_flagged(offsets::T, v, OpFlags::OP_FLAG_SET_T)
}

fn store_pc(b: &mut Builder, v: ValueId) {
    b.emit_store_context(offsets::PC, v)
}

pub const _SR_MD_BIT: u32 = sr_bits::MD;
pub const _FPSCR_PR_BIT: u32 = fpscr_bits::PR;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::MemoryMap;
    use crate::ir::Opcode;
    use crate::layout::PAGE_SIZE;

    fn memory_with(code: &[u16]) -> AddressSpace {
        let mut space = AddressSpace::new();
        let region = space.create_region_static(0, PAGE_SIZE).unwrap();
        let mut map = MemoryMap::new();
        map.mount(0, region);
        space.install_map(&map).unwrap();
        for (i, insn) in code.iter().enumerate() {
            space.write16((i as u32) * 2, *insn);
        }
        space
    }

    const FPU: FpuState = FpuState { double_pr: false, double_sz: false };

    #[test]
    fn analyze_block_stops_after_a_delayed_branch_counting_its_slot() {
        let memory = memory_with(&[0x0009, 0xA000]); // nop; bra 0
        let analyzed = analyze_block(&memory, 0, FPU, 64, false);
        assert_eq!(analyzed.num_instrs, 3); // nop + bra + its delay slot
        assert_eq!(analyzed.end_addr, 6);
    }

    #[test]
    fn analyze_block_stops_at_max_instrs_even_without_a_branch() {
        let memory = memory_with(&[0x0009, 0x0009, 0x0009, 0x0009]); // four nops
        let analyzed = analyze_block(&memory, 0, FPU, 2, false);
        assert_eq!(analyzed.num_instrs, 2);
        assert_eq!(analyzed.end_addr, 4);
    }

    #[test]
    fn translate_block_of_straight_line_code_appends_a_trailing_pc_store() {
        // mov #5,R1 ; add R1,R1 ; cut off by max_instrs, no guest branch.
        let memory = memory_with(&[0xE105, 0x311C]);
        let analyzed = analyze_block(&memory, 0, FPU, 2, false);
        let b = translate_block(&memory, &analyzed);

        // Straight-line code never calls `store_pc` on its own, so the last
        // instruction in block 0 must be the appended fallthrough PC store;
        // the `Branch` it sets up as a tail marker lives in a second, never-
        // executed block that neither backend ever lowers.
        let block0 = &b.blocks[0].instrs;
        assert_eq!(b.blocks.len(), 2);
        let pc_store = b.instr(block0[block0.len() - 1]);
        assert_eq!(pc_store.opcode, Opcode::StoreContext);
        assert_eq!(pc_store.context_offset, Some(offsets::PC));
        let stored = pc_store.args[0].unwrap();
        assert_eq!(b.value(stored).constant, Some(Constant::I32(analyzed.end_addr as i32)));
    }

    #[test]
    fn translate_block_ending_in_a_branch_does_not_append_a_second_pc_store() {
        let memory = memory_with(&[0x0009, 0xA000]); // nop; bra 0
        let analyzed = analyze_block(&memory, 0, FPU, 64, false);
        let b = translate_block(&memory, &analyzed);

        let block0 = &b.blocks[0].instrs;
        let pc_stores: Vec<_> = block0.iter().filter(|&&id| b.instr(id).opcode == Opcode::StoreContext && b.instr(id).context_offset == Some(offsets::PC)).collect();
        assert_eq!(pc_stores.len(), 1, "bra's own store_pc must be the only PC write in the block");
        assert!(!block0.iter().any(|&id| b.instr(id).opcode == Opcode::Branch), "block 0 itself never holds the IR Branch opcode for a guest bra");
    }

    #[test]
    fn mov_imm_lowers_to_a_single_sign_extended_store() {
        let memory = memory_with(&[0xE1FF]); // mov #-1,R1 (imm byte 0xff)
        let analyzed = analyze_block(&memory, 0, FPU, 1, true);
        let b = translate_block(&memory, &analyzed);

        let store_id = b.blocks[0].instrs[0];
        let store = b.instr(store_id);
        assert_eq!(store.opcode, Opcode::StoreContext);
        assert_eq!(store.context_offset, Some(offsets::r(1)));
        let v = store.args[0].unwrap();
        assert_eq!(b.value(v).constant, Some(Constant::I32(-1)));
    }

    #[test]
    fn mov_store_disp_computes_a_scaled_address() {
        let memory = memory_with(&[0x1121]); // mov.l R2,@(1,R1) -> disp*4 = 4
        let analyzed = analyze_block(&memory, 0, FPU, 1, true);
        let b = translate_block(&memory, &analyzed);

        let store_id = b.blocks[0].instrs.iter().copied().find(|&id| b.instr(id).opcode == Opcode::Store).unwrap();
        let addr = b.instr(store_id).args[0].unwrap();
        let add_id = b.blocks[0].instrs.iter().copied().find(|&id| b.instr(id).result == Some(addr)).unwrap();
        let add = b.instr(add_id);
        assert_eq!(add.opcode, Opcode::Add);
        let off = add.args[1].unwrap();
        assert_eq!(b.value(off).constant, Some(Constant::I32(4)));
    }
}
