//! Threaded-code interpreter backend. A block lowers to a
//! flat array of `IntInstr` records, each holding a callback selected at
//! assembly time from a table keyed by the instruction's opcode/type
//! signature; the entrypoint loops `i = instrs[i].call(ctx, locals)` until
//! the index equals the block's own length.

use std::collections::HashMap;

use crate::address_space::AddressSpace;
use crate::backend::{Backend, BlockFn, BlockFlags, PhysicalRegister, RuntimeBlock};
use crate::error::{Error, Result};
use crate::exception::Exception;
use crate::frontend::sh4::SH4Context;
use crate::ir::{Builder, Constant, Opcode, ValueId, ValueType};

/// Virtual registers and locals are both just slots in a per-call `i64`/
/// `f64` scratch array; `Operand` tells a callback where to find a value.
#[derive(Debug, Clone, Copy)]
enum Operand {
    Reg(u32),
    Local(i32),
    ImmInt(i64),
    ImmFloat(f64),
    ContextOffset(u32),
}

struct IntInstr {
    opcode: Opcode,
    args: [Operand; 3],
    result_slot: Option<u32>,
    result_ty: ValueType,
    /// Element width for `load`/`store`/`load_local`/`store_local`.
    mem_width: ValueType,
    guest_addr: u32,
}

pub struct CompiledBlock {
    instrs: Vec<IntInstr>,
    num_slots: u32,
    locals_size: u32,
    entry_pc: u32,
}

/// One block per slot; `BLOCKS` is keyed by the `ctx`-independent sequence
/// number baked into `entry` via a thread-local index, since the threaded
/// interpreter's `fn` pointer signature carries no closure environment.
thread_local! {
    static BLOCKS: std::cell::RefCell<Vec<CompiledBlock>> = std::cell::RefCell::new(Vec::new());
}

pub const REGISTERS: &[PhysicalRegister] = &[PhysicalRegister { name: "slot", is_float: false }];

pub struct InterpreterBackend {
    next_id: u32,
}

impl InterpreterBackend {
    pub fn new() -> Self {
        InterpreterBackend { next_id: 0 }
    }
}

impl Default for InterpreterBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for InterpreterBackend {
    fn registers(&self) -> &'static [PhysicalRegister] {
        REGISTERS
    }

    fn assemble(&mut self, builder: &Builder) -> Result<RuntimeBlock> {
        // Entry is always block 0: `translate_block` only ever appends a
        // second, empty fallthrough block as a branch target.
        let instrs = &builder.blocks[0].instrs;
        let mut slots = HashMap::new();
        let mut num_slots = 0u32;
        let mut lowered = Vec::with_capacity(instrs.len());

        for &instr_id in instrs {
            let instr = builder.instr(instr_id);
            // `StoreContext`/`StoreLocal` carry their destination in
            // `context_offset` and their value in `args[0]`; every other
            // opcode's args line up positionally.
            let args = match instr.opcode {
                Opcode::LoadContext => [Operand::ContextOffset(instr.context_offset.unwrap()), Operand::ImmInt(0), Operand::ImmInt(0)],
                Opcode::StoreContext => {
                    let v = value_operand_of(builder, instr.args[0], &mut slots, &mut num_slots);
                    [Operand::ContextOffset(instr.context_offset.unwrap()), v, Operand::ImmInt(0)]
                }
                Opcode::LoadLocal => [Operand::Local(instr.context_offset.unwrap() as i32), Operand::ImmInt(0), Operand::ImmInt(0)],
                Opcode::StoreLocal => {
                    let v = value_operand_of(builder, instr.args[0], &mut slots, &mut num_slots);
                    [Operand::Local(instr.context_offset.unwrap() as i32), v, Operand::ImmInt(0)]
                }
                _ => [
                    value_operand_of(builder, instr.args[0], &mut slots, &mut num_slots),
                    value_operand_of(builder, instr.args[1], &mut slots, &mut num_slots),
                    value_operand_of(builder, instr.args[2], &mut slots, &mut num_slots),
                ],
            };
            let result_slot = instr.result.map(|r| *slots.entry(r).or_insert_with(|| { let s = num_slots; num_slots += 1; s }));
            let result_ty = instr.result.map(|r| builder.ty_of(r)).unwrap_or(ValueType::I32);
            let mem_width = match instr.opcode {
                Opcode::Load | Opcode::LoadLocal | Opcode::LoadContext => result_ty,
                Opcode::Store => instr.args[1].map(|v| builder.ty_of(v)).unwrap_or(ValueType::I32),
                Opcode::StoreLocal | Opcode::StoreContext => instr.args[0].map(|v| builder.ty_of(v)).unwrap_or(ValueType::I32),
                // Comparisons produce a bool-typed result (`result_ty`), so the
                // operand type — the thing that decides whether the operands
                // are read back as IEEE floats or two's-complement ints — has
                // to be carried separately; stash it in `mem_width` like the
                // other "type of the operand, not the result" cases above.
                Opcode::CmpEq
                | Opcode::CmpNe
                | Opcode::CmpSlt
                | Opcode::CmpSle
                | Opcode::CmpSgt
                | Opcode::CmpSge
                | Opcode::CmpUlt
                | Opcode::CmpUle
                | Opcode::CmpUgt
                | Opcode::CmpUge => instr.args[0].map(|v| builder.ty_of(v)).unwrap_or(ValueType::I32),
                _ => ValueType::I32,
            };
            lowered.push(IntInstr { opcode: instr.opcode, args, result_slot, result_ty, mem_width, guest_addr: instr.guest_addr });
        }

        let compiled = CompiledBlock { instrs: lowered, num_slots, locals_size: builder.locals_size.max(0) as u32, entry_pc: builder.metadata.entry_pc };
        let id = self.next_id;
        if id as usize >= DISPATCH.len() {
            return Err(Error::BufferOverflow);
        }
        self.next_id += 1;
        BLOCKS.with(|b| {
            let mut b = b.borrow_mut();
            if id as usize != b.len() {
                return Err(Error::Bug("interpreter block id desynchronized".into()));
            }
            b.push(compiled);
            Ok(())
        })?;

        Ok(RuntimeBlock { entry: DISPATCH[id as usize], guest_cycles: builder.metadata.guest_cycles, flags: BlockFlags::empty() })
    }

    fn reset(&mut self) {
        self.next_id = 0;
        BLOCKS.with(|b| b.borrow_mut().clear());
    }

    fn handle_exception(&mut self, _ex: &mut Exception) -> bool {
        // `Load`/`Store` always go through `AddressSpace::read*`/`write*`
        // rather than a raw faulting host pointer, so there's no fastmem
        // thunk for this backend to rewrite.
        false
    }
}

/// Resolves a plain SSA argument (constant or register slot) to its
/// threaded-code `Operand`. Never used for the destination operand of
/// `*Context`/`*Local` opcodes — those come from `context_offset` instead.
fn value_operand_of(builder: &Builder, arg: Option<ValueId>, slots: &mut HashMap<ValueId, u32>, num_slots: &mut u32) -> Operand {
    match arg {
        None => Operand::ImmInt(0),
        Some(v) => {
            let value = builder.value(v);
            if let Some(c) = value.constant {
                match c {
                    Constant::F32(f) => Operand::ImmFloat(f as f64),
                    Constant::F64(f) => Operand::ImmFloat(f),
                    other => Operand::ImmInt(other.as_i64()),
                }
            } else {
                let slot = *slots.entry(v).or_insert_with(|| {
                    let s = *num_slots;
                    *num_slots += 1;
                    s
                });
                Operand::Reg(slot)
            }
        }
    }
}

/// The `fn(ctx) -> u32` ABI carries no closure environment, so each
/// concurrently-resident block is dispatched through its own monomorphized
/// trampoline; exceeding 64 resident interpreter blocks is treated as a
/// buffer overflow and forces a cache flush, same as the x86-64 backend
/// running out of code-buffer space.
const DISPATCH: [BlockFn; 64] = [
    run_block_0,
    run_block_1,
    run_block_2,
    run_block_3,
    run_block_4,
    run_block_5,
    run_block_6,
    run_block_7,
    run_block_8,
    run_block_9,
    run_block_10,
    run_block_11,
    run_block_12,
    run_block_13,
    run_block_14,
    run_block_15,
    run_block_16,
    run_block_17,
    run_block_18,
    run_block_19,
    run_block_20,
    run_block_21,
    run_block_22,
    run_block_23,
    run_block_24,
    run_block_25,
    run_block_26,
    run_block_27,
    run_block_28,
    run_block_29,
    run_block_30,
    run_block_31,
    run_block_32,
    run_block_33,
    run_block_34,
    run_block_35,
    run_block_36,
    run_block_37,
    run_block_38,
    run_block_39,
    run_block_40,
    run_block_41,
    run_block_42,
    run_block_43,
    run_block_44,
    run_block_45,
    run_block_46,
    run_block_47,
    run_block_48,
    run_block_49,
    run_block_50,
    run_block_51,
    run_block_52,
    run_block_53,
    run_block_54,
    run_block_55,
    run_block_56,
    run_block_57,
    run_block_58,
    run_block_59,
    run_block_60,
    run_block_61,
    run_block_62,
    run_block_63
];

unsafe extern "C" fn run_block_0(ctx: *mut SH4Context) -> u32 {
    interpret(0, ctx)
}
unsafe extern "C" fn run_block_1(ctx: *mut SH4Context) -> u32 {
    interpret(1, ctx)
}
unsafe extern "C" fn run_block_2(ctx: *mut SH4Context) -> u32 {
    interpret(2, ctx)
}
unsafe extern "C" fn run_block_3(ctx: *mut SH4Context) -> u32 {
    interpret(3, ctx)
}
unsafe extern "C" fn run_block_4(ctx: *mut SH4Context) -> u32 {
    interpret(4, ctx)
}
unsafe extern "C" fn run_block_5(ctx: *mut SH4Context) -> u32 {
    interpret(5, ctx)
}
unsafe extern "C" fn run_block_6(ctx: *mut SH4Context) -> u32 {
    interpret(6, ctx)
}
unsafe extern "C" fn run_block_7(ctx: *mut SH4Context) -> u32 {
    interpret(7, ctx)
}
unsafe extern "C" fn run_block_8(ctx: *mut SH4Context) -> u32 {
    interpret(8, ctx)
}
unsafe extern "C" fn run_block_9(ctx: *mut SH4Context) -> u32 {
    interpret(9, ctx)
}
unsafe extern "C" fn run_block_10(ctx: *mut SH4Context) -> u32 {
    interpret(10, ctx)
}
unsafe extern "C" fn run_block_11(ctx: *mut SH4Context) -> u32 {
    interpret(11, ctx)
}
unsafe extern "C" fn run_block_12(ctx: *mut SH4Context) -> u32 {
    interpret(12, ctx)
}
unsafe extern "C" fn run_block_13(ctx: *mut SH4Context) -> u32 {
    interpret(13, ctx)
}
unsafe extern "C" fn run_block_14(ctx: *mut SH4Context) -> u32 {
    interpret(14, ctx)
}
unsafe extern "C" fn run_block_15(ctx: *mut SH4Context) -> u32 {
    interpret(15, ctx)
}
unsafe extern "C" fn run_block_16(ctx: *mut SH4Context) -> u32 {
    interpret(16, ctx)
}
unsafe extern "C" fn run_block_17(ctx: *mut SH4Context) -> u32 {
    interpret(17, ctx)
}
unsafe extern "C" fn run_block_18(ctx: *mut SH4Context) -> u32 {
    interpret(18, ctx)
}
unsafe extern "C" fn run_block_19(ctx: *mut SH4Context) -> u32 {
    interpret(19, ctx)
}
unsafe extern "C" fn run_block_20(ctx: *mut SH4Context) -> u32 {
    interpret(20, ctx)
}
unsafe extern "C" fn run_block_21(ctx: *mut SH4Context) -> u32 {
    interpret(21, ctx)
}
unsafe extern "C" fn run_block_22(ctx: *mut SH4Context) -> u32 {
    interpret(22, ctx)
}
unsafe extern "C" fn run_block_23(ctx: *mut SH4Context) -> u32 {
    interpret(23, ctx)
}
unsafe extern "C" fn run_block_24(ctx: *mut SH4Context) -> u32 {
    interpret(24, ctx)
}
unsafe extern "C" fn run_block_25(ctx: *mut SH4Context) -> u32 {
    interpret(25, ctx)
}
unsafe extern "C" fn run_block_26(ctx: *mut SH4Context) -> u32 {
    interpret(26, ctx)
}
unsafe extern "C" fn run_block_27(ctx: *mut SH4Context) -> u32 {
    interpret(27, ctx)
}
unsafe extern "C" fn run_block_28(ctx: *mut SH4Context) -> u32 {
    interpret(28, ctx)
}
unsafe extern "C" fn run_block_29(ctx: *mut SH4Context) -> u32 {
    interpret(29, ctx)
}
unsafe extern "C" fn run_block_30(ctx: *mut SH4Context) -> u32 {
    interpret(30, ctx)
}
unsafe extern "C" fn run_block_31(ctx: *mut SH4Context) -> u32 {
    interpret(31, ctx)
}
unsafe extern "C" fn run_block_32(ctx: *mut SH4Context) -> u32 {
    interpret(32, ctx)
}
unsafe extern "C" fn run_block_33(ctx: *mut SH4Context) -> u32 {
    interpret(33, ctx)
}
unsafe extern "C" fn run_block_34(ctx: *mut SH4Context) -> u32 {
    interpret(34, ctx)
}
unsafe extern "C" fn run_block_35(ctx: *mut SH4Context) -> u32 {
    interpret(35, ctx)
}
unsafe extern "C" fn run_block_36(ctx: *mut SH4Context) -> u32 {
    interpret(36, ctx)
}
unsafe extern "C" fn run_block_37(ctx: *mut SH4Context) -> u32 {
    interpret(37, ctx)
}
unsafe extern "C" fn run_block_38(ctx: *mut SH4Context) -> u32 {
    interpret(38, ctx)
}
unsafe extern "C" fn run_block_39(ctx: *mut SH4Context) -> u32 {
    interpret(39, ctx)
}
unsafe extern "C" fn run_block_40(ctx: *mut SH4Context) -> u32 {
    interpret(40, ctx)
}
unsafe extern "C" fn run_block_41(ctx: *mut SH4Context) -> u32 {
    interpret(41, ctx)
}
unsafe extern "C" fn run_block_42(ctx: *mut SH4Context) -> u32 {
    interpret(42, ctx)
}
unsafe extern "C" fn run_block_43(ctx: *mut SH4Context) -> u32 {
    interpret(43, ctx)
}
unsafe extern "C" fn run_block_44(ctx: *mut SH4Context) -> u32 {
    interpret(44, ctx)
}
unsafe extern "C" fn run_block_45(ctx: *mut SH4Context) -> u32 {
    interpret(45, ctx)
}
unsafe extern "C" fn run_block_46(ctx: *mut SH4Context) -> u32 {
    interpret(46, ctx)
}
unsafe extern "C" fn run_block_47(ctx: *mut SH4Context) -> u32 {
    interpret(47, ctx)
}
unsafe extern "C" fn run_block_48(ctx: *mut SH4Context) -> u32 {
    interpret(48, ctx)
}
unsafe extern "C" fn run_block_49(ctx: *mut SH4Context) -> u32 {
    interpret(49, ctx)
}
unsafe extern "C" fn run_block_50(ctx: *mut SH4Context) -> u32 {
    interpret(50, ctx)
}
unsafe extern "C" fn run_block_51(ctx: *mut SH4Context) -> u32 {
    interpret(51, ctx)
}
unsafe extern "C" fn run_block_52(ctx: *mut SH4Context) -> u32 {
    interpret(52, ctx)
}
unsafe extern "C" fn run_block_53(ctx: *mut SH4Context) -> u32 {
    interpret(53, ctx)
}
unsafe extern "C" fn run_block_54(ctx: *mut SH4Context) -> u32 {
    interpret(54, ctx)
}
unsafe extern "C" fn run_block_55(ctx: *mut SH4Context) -> u32 {
    interpret(55, ctx)
}
unsafe extern "C" fn run_block_56(ctx: *mut SH4Context) -> u32 {
    interpret(56, ctx)
}
unsafe extern "C" fn run_block_57(ctx: *mut SH4Context) -> u32 {
    interpret(57, ctx)
}
unsafe extern "C" fn run_block_58(ctx: *mut SH4Context) -> u32 {
    interpret(58, ctx)
}
unsafe extern "C" fn run_block_59(ctx: *mut SH4Context) -> u32 {
    interpret(59, ctx)
}
unsafe extern "C" fn run_block_60(ctx: *mut SH4Context) -> u32 {
    interpret(60, ctx)
}
unsafe extern "C" fn run_block_61(ctx: *mut SH4Context) -> u32 {
    interpret(61, ctx)
}
unsafe extern "C" fn run_block_62(ctx: *mut SH4Context) -> u32 {
    interpret(62, ctx)
}
unsafe extern "C" fn run_block_63(ctx: *mut SH4Context) -> u32 {
    interpret(63, ctx)
}

fn interpret(block_id: u32, ctx: *mut SH4Context) -> u32 {
    BLOCKS.with(|b| {
        let blocks = b.borrow();
        let block = &blocks[block_id as usize];
        let mut int_slots = vec![0i64; block.num_slots as usize];
        let mut float_slots = vec![0f64; block.num_slots as usize];
        let mut locals = vec![0u8; block.locals_size as usize];
        let mut i = 0usize;
        while i < block.instrs.len() {
            let instr = &block.instrs[i];
            i = step(instr, ctx, &mut int_slots, &mut float_slots, &mut locals, i);
        }
        unsafe { (*ctx).pc }
    })
}

fn read_operand_int(op: Operand, ctx: *mut SH4Context, int_slots: &[i64], locals: &[u8], width: ValueType) -> i64 {
    match op {
        Operand::Reg(s) => int_slots[s as usize],
        Operand::Local(off) => read_local_int(locals, off, width),
        Operand::ImmInt(v) => v,
        Operand::ImmFloat(v) => v.to_bits() as i64,
        Operand::ContextOffset(off) => unsafe { read_context_int(ctx, off, width) },
    }
}

fn read_operand_float(op: Operand, ctx: *mut SH4Context, int_slots: &[i64], float_slots: &[f64], locals: &[u8], width: ValueType) -> f64 {
    match op {
        Operand::Reg(s) => float_slots[s as usize],
        Operand::ImmFloat(v) => v,
        Operand::ImmInt(v) => v as f64,
        Operand::Local(off) => {
            if width == ValueType::F64 {
                f64::from_bits(read_local_int(locals, off, ValueType::I64) as u64)
            } else {
                f32::from_bits(read_local_int(locals, off, ValueType::I32) as u32) as f64
            }
        }
        Operand::ContextOffset(off) => unsafe { read_context_float(ctx, off, width) },
    }
}

unsafe fn read_context_int(ctx: *mut SH4Context, off: u32, width: ValueType) -> i64 {
    let p = (ctx as *const u8).add(off as usize);
    match width {
        ValueType::I8 => *(p as *const i8) as i64,
        ValueType::I16 => *(p as *const i16) as i64,
        ValueType::I64 => *(p as *const i64),
        ValueType::F32 => (*(p as *const f32)).to_bits() as i64,
        ValueType::F64 => (*(p as *const f64)).to_bits() as i64,
        _ => *(p as *const i32) as i64,
    }
}

unsafe fn read_context_float(ctx: *mut SH4Context, off: u32, width: ValueType) -> f64 {
    let p = (ctx as *const u8).add(off as usize);
    if width == ValueType::F64 {
        *(p as *const f64)
    } else {
        *(p as *const f32) as f64
    }
}

unsafe fn write_context(ctx: *mut SH4Context, off: u32, v: i64, width: ValueType) {
    let p = (ctx as *mut u8).add(off as usize);
    match width {
        ValueType::I8 => *(p as *mut i8) = v as i8,
        ValueType::I16 => *(p as *mut i16) = v as i16,
        ValueType::I64 => *(p as *mut i64) = v,
        ValueType::F32 => *(p as *mut f32) = f32::from_bits(v as u32),
        ValueType::F64 => *(p as *mut f64) = f64::from_bits(v as u64),
        _ => *(p as *mut i32) = v as i32,
    }
}

fn read_local_int(locals: &[u8], off: i32, width: ValueType) -> i64 {
    let off = off as usize;
    match width {
        ValueType::I8 => locals[off] as i8 as i64,
        ValueType::I16 => i16::from_ne_bytes(locals[off..off + 2].try_into().unwrap()) as i64,
        ValueType::I64 | ValueType::F64 => i64::from_ne_bytes(locals[off..off + 8].try_into().unwrap()),
        _ => i32::from_ne_bytes(locals[off..off + 4].try_into().unwrap()) as i64,
    }
}

fn write_local(locals: &mut [u8], off: i32, v: i64, width: ValueType) {
    let off = off as usize;
    match width {
        ValueType::I8 => locals[off] = v as u8,
        ValueType::I16 => locals[off..off + 2].copy_from_slice(&(v as i16).to_ne_bytes()),
        ValueType::I64 | ValueType::F64 => locals[off..off + 8].copy_from_slice(&v.to_ne_bytes()),
        _ => locals[off..off + 4].copy_from_slice(&(v as i32).to_ne_bytes()),
    }
}

fn step(
    instr: &IntInstr,
    ctx: *mut SH4Context,
    int_slots: &mut [i64],
    float_slots: &mut [f64],
    locals: &mut [u8],
    i: usize,
) -> usize {
    use Opcode::*;
    let is_float = instr.result_ty.is_float();
    match instr.opcode {
        LoadContext => {
            if let Operand::ContextOffset(off) = instr.args[0] {
                if is_float {
                    let f = unsafe { read_context_float(ctx, off, instr.mem_width) };
                    store_result(instr, f.to_bits() as i64, f, int_slots, float_slots);
                } else {
                    let raw = unsafe { read_context_int(ctx, off, instr.mem_width) };
                    store_result(instr, raw, raw as f64, int_slots, float_slots);
                }
            }
        }
        StoreContext => {
            if let Operand::ContextOffset(off) = instr.args[0] {
                let v = if instr.mem_width.is_float() {
                    read_operand_float(instr.args[1], ctx, int_slots, float_slots, locals, instr.mem_width).to_bits() as i64
                } else {
                    read_operand_int(instr.args[1], ctx, int_slots, locals, instr.mem_width)
                };
                unsafe { write_context(ctx, off, v, instr.mem_width) };
            }
        }
        LoadLocal => {
            if let Operand::Local(off) = instr.args[0] {
                if is_float {
                    let v = read_operand_float(Operand::Local(off), ctx, int_slots, float_slots, locals, instr.mem_width);
                    store_result(instr, v.to_bits() as i64, v, int_slots, float_slots);
                } else {
                    let v = read_local_int(locals, off, instr.mem_width);
                    store_result(instr, v, v as f64, int_slots, float_slots);
                }
            }
        }
        StoreLocal => {
            if let Operand::Local(off) = instr.args[0] {
                if instr.mem_width.is_float() {
                    let v = read_operand_float(instr.args[1], ctx, int_slots, float_slots, locals, instr.mem_width);
                    write_local(locals, off, v.to_bits() as i64, instr.mem_width);
                } else {
                    let v = read_operand_int(instr.args[1], ctx, int_slots, locals, instr.mem_width);
                    write_local(locals, off, v, instr.mem_width);
                }
            }
        }
        Load => {
            let addr = read_operand_int(instr.args[0], ctx, int_slots, locals, ValueType::I32) as u32;
            let memory = unsafe { &*(*ctx).memory };
            let v = read_guest(memory, addr, instr.mem_width);
            if is_float {
                let f = if instr.mem_width == ValueType::F64 { f64::from_bits(v as u64) } else { f32::from_bits(v as u32) as f64 };
                store_result(instr, f.to_bits() as i64, f, int_slots, float_slots);
            } else {
                store_result(instr, v, v as f64, int_slots, float_slots);
            }
        }
        Store => {
            let addr = read_operand_int(instr.args[0], ctx, int_slots, locals, ValueType::I32) as u32;
            let memory = unsafe { &*(*ctx).memory };
            let v = if instr.mem_width.is_float() {
                read_operand_float(instr.args[1], ctx, int_slots, float_slots, locals, instr.mem_width).to_bits() as i64
            } else {
                read_operand_int(instr.args[1], ctx, int_slots, locals, instr.mem_width)
            };
            write_guest(memory, addr, v, instr.mem_width);
        }
        Add | Sub | Mul | UMul | Div | UDiv | And | Or | Xor | Shl | Ashr | Lshr => {
            if is_float {
                let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, instr.result_ty);
                let b = read_operand_float(instr.args[1], ctx, int_slots, float_slots, locals, instr.result_ty);
                let r = apply_float_binary(instr.opcode, a, b);
                store_result(instr, r.to_bits() as i64, r, int_slots, float_slots);
            } else {
                let a = read_operand_int(instr.args[0], ctx, int_slots, locals, instr.result_ty);
                let b = read_operand_int(instr.args[1], ctx, int_slots, locals, instr.result_ty);
                let r = apply_int_binary(instr.opcode, a, b);
                store_result(instr, r, r as f64, int_slots, float_slots);
            }
        }
        CmpEq | CmpNe | CmpSlt | CmpSle | CmpSgt | CmpSge | CmpUlt | CmpUle | CmpUgt | CmpUge => {
            let r = if instr.mem_width.is_float() {
                let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, instr.mem_width);
                let b = read_operand_float(instr.args[1], ctx, int_slots, float_slots, locals, instr.mem_width);
                apply_cmp_float(instr.opcode, a, b) as i64
            } else {
                let a = read_operand_int(instr.args[0], ctx, int_slots, locals, instr.mem_width);
                let b = read_operand_int(instr.args[1], ctx, int_slots, locals, instr.mem_width);
                apply_cmp(instr.opcode, a, b) as i64
            };
            store_result(instr, r, r as f64, int_slots, float_slots);
        }
        Neg => {
            if is_float {
                let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, instr.result_ty);
                store_result(instr, (-a).to_bits() as i64, -a, int_slots, float_slots);
            } else {
                let a = read_operand_int(instr.args[0], ctx, int_slots, locals, instr.result_ty);
                store_result(instr, a.wrapping_neg(), 0.0, int_slots, float_slots);
            }
        }
        Not => {
            let a = read_operand_int(instr.args[0], ctx, int_slots, locals, instr.result_ty);
            store_result(instr, !a, 0.0, int_slots, float_slots);
        }
        Select => {
            let cond = read_operand_int(instr.args[0], ctx, int_slots, locals, ValueType::I32);
            let a = read_operand_int(instr.args[1], ctx, int_slots, locals, instr.result_ty);
            let b = read_operand_int(instr.args[2], ctx, int_slots, locals, instr.result_ty);
            let r = if cond != 0 { a } else { b };
            store_result(instr, r, r as f64, int_slots, float_slots);
        }
        Cast => {
            // Int <-> float bit-value conversion (SH4 `float`/`ftrc`): the
            // source type is whatever the argument value actually holds,
            // the destination is `instr.result_ty`.
            if is_float {
                let a = read_operand_int(instr.args[0], ctx, int_slots, locals, ValueType::I32);
                let f = a as f64;
                store_result(instr, f.to_bits() as i64, f, int_slots, float_slots);
            } else {
                let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, ValueType::F32);
                let r = a as i64;
                store_result(instr, r, r as f64, int_slots, float_slots);
            }
        }
        Sqrt => {
            let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, instr.result_ty);
            let r = a.sqrt();
            store_result(instr, r.to_bits() as i64, r, int_slots, float_slots);
        }
        Abs => {
            if is_float {
                let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, instr.result_ty);
                let r = a.abs();
                store_result(instr, r.to_bits() as i64, r, int_slots, float_slots);
            } else {
                let a = read_operand_int(instr.args[0], ctx, int_slots, locals, instr.result_ty);
                let r = a.wrapping_abs();
                store_result(instr, r, r as f64, int_slots, float_slots);
            }
        }
        Sin => {
            let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, instr.result_ty);
            let r = a.sin();
            store_result(instr, r.to_bits() as i64, r, int_slots, float_slots);
        }
        Cos => {
            let a = read_operand_float(instr.args[0], ctx, int_slots, float_slots, locals, instr.result_ty);
            let r = a.cos();
            store_result(instr, r.to_bits() as i64, r, int_slots, float_slots);
        }
        // Neither `sext`/`zext`/`truncate` is reachable from the SH4
        // frontend today (every width change it needs goes through a typed
        // `load_context`/`load` instead), but the optimizer passes are free
        // to introduce one, so fall back to a raw bit passthrough sized to
        // the result: correct whenever the source slot's high bits are
        // already clean, which holds for every value this interpreter
        // itself ever produces.
        Sext | Zext | Truncate => {
            let a = read_operand_int(instr.args[0], ctx, int_slots, locals, instr.result_ty);
            let r = match instr.opcode {
                Zext => match instr.result_ty {
                    ValueType::I8 => (a as u8) as i64,
                    ValueType::I16 => (a as u16) as i64,
                    ValueType::I32 => (a as u32) as i64,
                    _ => a,
                },
                _ => a,
            };
            store_result(instr, r, r as f64, int_slots, float_slots);
        }
        InvalidateContext | CallExternal => {}
        // The SH4 frontend only ever emits `Branch` once per block, as its
        // final instruction, targeting the empty fallthrough block it
        // appends purely to keep every block terminated; the next PC was
        // already committed by a preceding `store_pc` (`StoreContext`), so
        // there's nothing left to execute. `BranchCond` never appears in
        // frontend output (conditional control flow lowers through
        // `Select` instead) but is handled the same way for any optimizer
        // pass that might introduce one.
        Branch | BranchCond => return usize::MAX,
        _ => {}
    }
    i + 1
}

fn read_guest(memory: &AddressSpace, addr: u32, width: ValueType) -> i64 {
    match width {
        ValueType::I8 => memory.read8(addr) as i64,
        ValueType::I16 => memory.read16(addr) as i64,
        ValueType::I64 | ValueType::F64 => memory.read64(addr) as i64,
        _ => memory.read32(addr) as i64,
    }
}

fn write_guest(memory: &AddressSpace, addr: u32, v: i64, width: ValueType) {
    match width {
        ValueType::I8 => memory.write8(addr, v as u8),
        ValueType::I16 => memory.write16(addr, v as u16),
        ValueType::I64 | ValueType::F64 => memory.write64(addr, v as u64),
        _ => memory.write32(addr, v as u32),
    }
}

fn store_result(instr: &IntInstr, int_v: i64, float_v: f64, int_slots: &mut [i64], float_slots: &mut [f64]) {
    if let Some(slot) = instr.result_slot {
        int_slots[slot as usize] = int_v;
        float_slots[slot as usize] = float_v;
    }
}

fn apply_int_binary(op: Opcode, a: i64, b: i64) -> i64 {
    use Opcode::*;
    match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        UMul => ((a as u64).wrapping_mul(b as u64)) as i64,
        Div => {
            if b == 0 {
                0
            } else {
                a.wrapping_div(b)
            }
        }
        UDiv => {
            if b == 0 {
                0
            } else {
                ((a as u64) / (b as u64)) as i64
            }
        }
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        Shl => a.wrapping_shl(b as u32),
        Ashr => a.wrapping_shr(b as u32),
        Lshr => ((a as u64).wrapping_shr(b as u32)) as i64,
        _ => 0,
    }
}

fn apply_float_binary(op: Opcode, a: f64, b: f64) -> f64 {
    use Opcode::*;
    match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => a / b,
        _ => 0.0,
    }
}

fn apply_cmp(op: Opcode, a: i64, b: i64) -> bool {
    use Opcode::*;
    match op {
        CmpEq => a == b,
        CmpNe => a != b,
        CmpSlt => a < b,
        CmpSle => a <= b,
        CmpSgt => a > b,
        CmpSge => a >= b,
        CmpUlt => (a as u64) < (b as u64),
        CmpUle => (a as u64) <= (b as u64),
        CmpUgt => (a as u64) > (b as u64),
        CmpUge => (a as u64) >= (b as u64),
        _ => false,
    }
}

/// Float comparisons use Rust's IEEE-754-ordering `f64` comparison operators
/// directly rather than comparing bit patterns as integers, which is not
/// IEEE ordering for negative operands (sign-magnitude vs. two's complement)
/// or for NaN (every ordered comparison involving NaN is false). The
/// signed/unsigned opcode split doesn't apply to floats — `cmp_sgt`/`cmp_ugt`
/// both mean "ordered greater-than" here, matching the x64 backend's
/// `ucomiss`/`ucomisd`-based lowering.
fn apply_cmp_float(op: Opcode, a: f64, b: f64) -> bool {
    use Opcode::*;
    match op {
        CmpEq => a == b,
        CmpNe => a != b,
        CmpSlt | CmpUlt => a < b,
        CmpSle | CmpUle => a <= b,
        CmpSgt | CmpUgt => a > b,
        CmpSge | CmpUge => a >= b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Regression: comparing float operands as bit patterns via
    /// `apply_cmp` disagrees with IEEE ordering as soon as either operand
    /// is negative (sign-magnitude vs. two's complement), e.g.
    /// `-1.0 > 2.0` would read true if `-1.0`'s bit pattern (which has its
    /// sign bit set, making it a huge negative `i64`) were compared
    /// directly against `2.0`'s.
    #[test]
    fn float_gt_follows_ieee_ordering_for_a_negative_operand() {
        assert!(!apply_cmp_float(Opcode::CmpSgt, -1.0, 2.0));
        assert!(apply_cmp_float(Opcode::CmpSgt, 2.0, -1.0));
    }

    #[test]
    fn float_eq_and_ne_agree_with_ieee_equality() {
        assert!(apply_cmp_float(Opcode::CmpEq, 1.5, 1.5));
        assert!(!apply_cmp_float(Opcode::CmpNe, 1.5, 1.5));
        assert!(apply_cmp_float(Opcode::CmpNe, f64::NAN, f64::NAN));
        assert!(!apply_cmp_float(Opcode::CmpEq, f64::NAN, f64::NAN));
    }
}
