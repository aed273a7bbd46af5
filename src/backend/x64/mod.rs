//! The x86-64 JIT backend: lowers one optimized block's IR
//! straight into machine code, one instruction at a time, with no
//! intermediate assembly text. Built on the register-allocation contract
//! [`crate::ir::passes::regalloc`] already fixes (`NUM_INT_REGS`/
//! `NUM_FLOAT_REGS`) and on a fastmem scheme where guest loads/stores index
//! directly off a `protected_base` alias, and a page fault on a dynamic
//! (MMIO) address routes through [`fastmem`] instead of a checked branch on
//! every access.
//!
//! ## Register convention
//! Of the 16 general-purpose registers, five are reserved and never handed
//! to the allocator: RSP (the stack), RAX/RCX (scratch, used to stage
//! constants and as the mandatory operands of `idiv`/shift-by-`cl`), RDI
//! (holds the `ctx: *mut SH4Context` argument for the whole block — the
//! SysV ABI already puts it there at entry, so there is no prologue move),
//! and RBP (repurposed to hold `protected_base`, loaded once per block via
//! a host call since [`AddressSpace`] exposes it only through a method, not
//! a fixed struct offset). The remaining 11 — RBX, RDX, RSI, R8-R15 — are
//! exactly [`regalloc::NUM_INT_REGS`](crate::ir::passes::regalloc::NUM_INT_REGS).
//! All 16 xmm registers are allocator-visible; float `abs`/`neg` use a
//! bitcast-and-mask trick through the integer domain instead of a reserved
//! scratch xmm.
//!
//! Every value of IR type `I8`/`I16`/`I32` is kept zero-extended to the
//! full 64 bits of its GPR at rest, so ordinary ALU ops can operate
//! uniformly in 64-bit width without tracking per-value width — except
//! where the SH4 source value is genuinely signed (division, int<->float
//! conversion), which reads the *32-bit* sub-register explicitly.
//!
//! `Branch`/`BranchCond` need no codegen at all: the SH4 frontend commits
//! the next PC through a preceding `store_context(PC, ...)`, and a block
//! has exactly one basic block, so the terminator is reached only once,
//! right before the epilogue (see [`backend::interpreter`](crate::backend::interpreter)'s
//! identical observation).

pub mod asm;
pub mod fastmem;
pub mod mov_decoder;

use crate::address_space::AddressSpace;
use crate::backend::{Backend, BlockFlags, BlockFn, PhysicalRegister, RuntimeBlock};
use crate::error::{Error, Result};
use crate::exception::Exception;
use crate::frontend::sh4::SH4Context;
use crate::ir::{Builder, Constant, Opcode, ValueId, ValueType};

use asm::{cc, CodeBuffer, Gpr, Width, Xmm};

/// 16 MiB of committed code per backend instance, matching the interpreter
/// backend's 64-resident-block ceiling in spirit: plenty for normal play,
/// a `BufferOverflow` past this just flushes the cache and retries once.
const CODE_BUFFER_CAPACITY: usize = 16 * 1024 * 1024;

const CTX: Gpr = Gpr::RDI;
const VBASE: Gpr = Gpr::RBP;
const SCRATCH0: Gpr = Gpr::RAX;
const SCRATCH1: Gpr = Gpr::RCX;

/// Ordinal-to-register table the allocator's `PhysReg(n)` indexes into for
/// the integer class; length must equal `regalloc::NUM_INT_REGS`.
const INT_REGS: [Gpr; 11] = [Gpr::RBX, Gpr::RDX, Gpr::RSI, Gpr::R8, Gpr::R9, Gpr::R10, Gpr::R11, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];
/// Ditto for the float class; length must equal `regalloc::NUM_FLOAT_REGS`.
const FLOAT_REGS: [Xmm; 16] = [
    Xmm(0),
    Xmm(1),
    Xmm(2),
    Xmm(3),
    Xmm(4),
    Xmm(5),
    Xmm(6),
    Xmm(7),
    Xmm(8),
    Xmm(9),
    Xmm(10),
    Xmm(11),
    Xmm(12),
    Xmm(13),
    Xmm(14),
    Xmm(15),
];

/// Caller-saved GPRs this backend either allocates to live values (RDX,
/// RSI) or treats as permanently live (RDI, the `ctx` pointer) that must be
/// preserved across any host call; RCX is included purely to keep the
/// saved set's byte size a multiple of 16 so the stack stays aligned
/// through the call. RAX is deliberately excluded: it carries the call's
/// return value out.
const CALL_SAVED_GPRS: [Gpr; 8] = [Gpr::RDI, Gpr::RDX, Gpr::RSI, Gpr::RCX, Gpr::R8, Gpr::R9, Gpr::R10, Gpr::R11];
const XMM_SCRATCH_BYTES: i32 = 128;

pub const REGISTERS: &[PhysicalRegister] = &[
    PhysicalRegister { name: "rbx", is_float: false },
    PhysicalRegister { name: "rdx", is_float: false },
    PhysicalRegister { name: "rsi", is_float: false },
    PhysicalRegister { name: "r8", is_float: false },
    PhysicalRegister { name: "r9", is_float: false },
    PhysicalRegister { name: "r10", is_float: false },
    PhysicalRegister { name: "r11", is_float: false },
    PhysicalRegister { name: "r12", is_float: false },
    PhysicalRegister { name: "r13", is_float: false },
    PhysicalRegister { name: "r14", is_float: false },
    PhysicalRegister { name: "r15", is_float: false },
    PhysicalRegister { name: "xmm0", is_float: true },
    PhysicalRegister { name: "xmm1", is_float: true },
    PhysicalRegister { name: "xmm2", is_float: true },
    PhysicalRegister { name: "xmm3", is_float: true },
    PhysicalRegister { name: "xmm4", is_float: true },
    PhysicalRegister { name: "xmm5", is_float: true },
    PhysicalRegister { name: "xmm6", is_float: true },
    PhysicalRegister { name: "xmm7", is_float: true },
    PhysicalRegister { name: "xmm8", is_float: true },
    PhysicalRegister { name: "xmm9", is_float: true },
    PhysicalRegister { name: "xmm10", is_float: true },
    PhysicalRegister { name: "xmm11", is_float: true },
    PhysicalRegister { name: "xmm12", is_float: true },
    PhysicalRegister { name: "xmm13", is_float: true },
    PhysicalRegister { name: "xmm14", is_float: true },
    PhysicalRegister { name: "xmm15", is_float: true },
];

pub struct X64Backend {
    code: CodeBuffer,
    pending_slowmem: bool,
    /// The address space the currently-running block's `ctx.memory` points
    /// at, bound by [`Dreamcast::execute`](crate::dreamcast::Dreamcast::execute)
    /// for the duration of its run loop so `handle_exception` has something
    /// to pass to [`fastmem::handle`] (the `Backend` trait's exception hook
    /// carries no environment pointer, same reason `block_cache`'s
    /// trampoline uses a thread-local).
    memory: Option<*const AddressSpace>,
}

impl X64Backend {
    pub fn new() -> Result<Self> {
        Ok(X64Backend { code: CodeBuffer::new(CODE_BUFFER_CAPACITY)?, pending_slowmem: false, memory: None })
    }
}

impl Default for X64Backend {
    fn default() -> Self {
        Self::new().expect("reserving the JIT code buffer failed")
    }
}

impl Backend for X64Backend {
    fn registers(&self) -> &'static [PhysicalRegister] {
        REGISTERS
    }

    fn set_slowmem_hint(&mut self, slowmem: bool) {
        self.pending_slowmem = slowmem;
    }

    fn assemble(&mut self, builder: &Builder) -> Result<RuntimeBlock> {
        let slowmem = std::mem::replace(&mut self.pending_slowmem, false);
        let mut cg = Codegen { buf: &mut self.code, slowmem };
        cg.emit_prologue(builder)?;
        // Entry is always block 0 (see `backend::interpreter`'s identical
        // comment): `translate_block` only ever appends a second, empty
        // fallthrough block as a branch target.
        for &instr_id in &builder.blocks[0].instrs {
            cg.emit_instr(builder, instr_id)?;
        }
        cg.emit_epilogue(builder)?;
        let entry = self.code.finalize()?;
        let entry: BlockFn = unsafe { std::mem::transmute::<*const u8, BlockFn>(entry) };
        Ok(RuntimeBlock { entry, guest_cycles: builder.metadata.guest_cycles, flags: BlockFlags::empty() })
    }

    unsafe fn bind_memory(&mut self, memory: *const AddressSpace) {
        self.memory = Some(memory);
    }

    fn reset(&mut self) {
        if let Err(e) = self.code.reset() {
            log::error!("failed to reset x64 backend code buffer: {e}");
        }
    }

    fn handle_exception(&mut self, ex: &mut Exception) -> bool {
        let Some(memory) = self.memory else { return false };
        let memory = unsafe { &*memory };
        fastmem::handle(memory, ex)
    }
}

/// Rounds `locals_size` up to the next multiple of 16 so the prologue's
/// `sub rsp` preserves the SysV alignment invariant (rsp ≡ 8 mod 16 at
/// block entry, since the `call` that got us here just pushed a return
/// address onto a 16-aligned stack) all the way through the frame.
fn frame_size_of(locals_size: i32) -> u32 {
    ((locals_size.max(0) as u32) + 15) & !15
}

/// Per-assemble codegen state. Holds a `&mut CodeBuffer` rather than owning
/// one so `X64Backend::assemble` can still read `self.code` elsewhere if a
/// future change needs to (kept as a plain struct rather than free
/// functions because prologue/epilogue/instr emission all share `slowmem`).
struct Codegen<'a> {
    buf: &'a mut CodeBuffer,
    slowmem: bool,
}

impl<'a> Codegen<'a> {
    fn emit_prologue(&mut self, builder: &Builder) -> Result<()> {
        self.buf.push_reg(Gpr::RBP)?;
        let frame = frame_size_of(builder.locals_size);
        if frame > 0 {
            self.buf.sub_rsp_imm32(frame)?;
        }
        // Load `ctx.memory.protected_base_ptr()` into RBP. `ctx` is already
        // in RDI per the SysV ABI; `call_host` preserves it across the call.
        self.call_host(host_vbase as usize, &[])?;
        self.buf.mov_reg_reg(VBASE, Gpr::RAX)
    }

    fn emit_epilogue(&mut self, builder: &Builder) -> Result<()> {
        // The next PC was already committed via `store_context(PC, ...)`
        // before the block's terminating `branch`; load it back as the
        // return value.
        self.buf.load_mem(Gpr::RAX, CTX, crate::frontend::sh4::offsets::PC as i32, Width::W32, false)?;
        let frame = frame_size_of(builder.locals_size);
        if frame > 0 {
            self.buf.add_rsp_imm32(frame)?;
        }
        self.buf.pop_reg(Gpr::RBP)?;
        self.buf.ret()
    }

    fn emit_instr(&mut self, builder: &Builder, instr_id: crate::ir::InstrId) -> Result<()> {
        let instr = builder.instr(instr_id);
        use Opcode::*;
        match instr.opcode {
            Branch | BranchCond => Ok(()),
            InvalidateContext => Ok(()),
            CallExternal => Ok(()),
            LoadContext => {
                let offset = instr.context_offset.unwrap() as i32;
                let ty = builder.ty_of(instr.result.unwrap());
                self.load_typed(instr.result.unwrap(), builder, CTX, offset, ty)
            }
            StoreContext => {
                let offset = instr.context_offset.unwrap() as i32;
                let v = instr.args[0].unwrap();
                self.store_typed(builder, CTX, offset, v)
            }
            LoadLocal => {
                let offset = instr.context_offset.unwrap() as i32;
                let ty = builder.ty_of(instr.result.unwrap());
                self.load_typed(instr.result.unwrap(), builder, Gpr::RSP, offset, ty)
            }
            StoreLocal => {
                let offset = instr.context_offset.unwrap() as i32;
                let v = instr.args[0].unwrap();
                self.store_typed(builder, Gpr::RSP, offset, v)
            }
            Load => self.emit_load(builder, instr),
            Store => self.emit_store(builder, instr),
            Add => self.emit_binary(builder, instr, |b, d, s, w| b.add_reg_reg(d, s, w), |b, d, s| b.addsd(d, s), |b, d, s| b.addss(d, s)),
            Sub => self.emit_binary(builder, instr, |b, d, s, w| b.sub_reg_reg(d, s, w), |b, d, s| b.subsd(d, s), |b, d, s| b.subss(d, s)),
            Mul | UMul => self.emit_binary(builder, instr, |b, d, s, w| b.imul_reg_reg(d, s, w), |b, d, s| b.mulsd(d, s), |b, d, s| b.mulss(d, s)),
            And => self.emit_int_binary(builder, instr, |b, d, s, w| b.and_reg_reg(d, s, w)),
            Or => self.emit_int_binary(builder, instr, |b, d, s, w| b.or_reg_reg(d, s, w)),
            Xor => self.emit_int_binary(builder, instr, |b, d, s, w| b.xor_reg_reg(d, s, w)),
            Shl => self.emit_shift(builder, instr, |b, d, w| b.shl_cl(d, w)),
            Ashr => self.emit_shift(builder, instr, |b, d, w| b.sar_cl(d, w)),
            Lshr => self.emit_shift(builder, instr, |b, d, w| b.shr_cl(d, w)),
            Div => self.emit_div_or_fdiv(builder, instr, true),
            UDiv => self.emit_div_or_fdiv(builder, instr, false),
            Neg => self.emit_unary(builder, instr),
            Not => {
                let dst = self.materialize_dst_from_arg0(builder, instr)?;
                let w64 = builder.ty_of(instr.result.unwrap()).bits() == 64;
                self.buf.not_reg(dst, w64)
            }
            CmpEq | CmpNe | CmpSlt | CmpSle | CmpSgt | CmpSge | CmpUlt | CmpUle | CmpUgt | CmpUge => self.emit_cmp(builder, instr),
            Sext | Zext | Truncate => self.emit_widen(builder, instr),
            Cast => self.emit_cast(builder, instr),
            Sqrt => self.emit_float_unary(builder, instr, |b, d, s| b.sqrtsd(d, s), |b, d, s| b.sqrtss(d, s)),
            Abs => self.emit_abs(builder, instr),
            Sin => self.emit_math_intrinsic(builder, instr, host_sin as usize),
            Cos => self.emit_math_intrinsic(builder, instr, host_cos as usize),
            Select => self.emit_select(builder, instr),
        }
    }

    // -- value location resolution ---------------------------------------

    fn int_reg_of(&self, builder: &Builder, v: ValueId) -> Gpr {
        INT_REGS[builder.value(v).reg as usize]
    }
    fn float_reg_of(&self, builder: &Builder, v: ValueId) -> Xmm {
        FLOAT_REGS[builder.value(v).reg as usize]
    }

    /// Loads `v`'s value into `dst`, handling both constants and
    /// already-allocated registers (a no-op if `v` already lives in `dst`).
    fn materialize_int(&mut self, builder: &Builder, v: ValueId, dst: Gpr) -> Result<()> {
        let value = builder.value(v);
        if let Some(c) = value.constant {
            let bits = c.as_i64();
            if bits as i32 as i64 == bits {
                self.buf.mov_reg_imm32(dst, bits as u32)
            } else {
                self.buf.mov_reg_imm64(dst, bits as u64)
            }
        } else {
            let src = self.int_reg_of(builder, v);
            if src == dst {
                Ok(())
            } else {
                self.buf.mov_reg_reg(dst, src)
            }
        }
    }

    fn materialize_float(&mut self, builder: &Builder, v: ValueId, dst: Xmm) -> Result<()> {
        let value = builder.value(v);
        if let Some(c) = value.constant {
            let bits: u64 = match c {
                Constant::F32(f) => f.to_bits() as u64,
                Constant::F64(f) => f.to_bits(),
                other => other.as_i64() as u64,
            };
            self.buf.mov_reg_imm64(SCRATCH0, bits)?;
            self.buf.movq_xmm_gpr(dst, SCRATCH0)
        } else {
            let src = self.float_reg_of(builder, v);
            if src == dst {
                Ok(())
            } else if value.ty == ValueType::F64 {
                self.buf.movsd_reg_reg(dst, src)
            } else {
                self.buf.movss_reg_reg(dst, src)
            }
        }
    }

    // -- typed context/local access ---------------------------------------

    fn load_typed(&mut self, result: ValueId, builder: &Builder, base: Gpr, offset: i32, ty: ValueType) -> Result<()> {
        if ty.is_float() {
            let dst = self.float_reg_of(builder, result);
            if ty == ValueType::F64 {
                self.buf.movsd_load(dst, base, offset)
            } else {
                self.buf.movss_load(dst, base, offset)
            }
        } else {
            let dst = self.int_reg_of(builder, result);
            self.buf.load_mem(dst, base, offset, width_of(ty), false)
        }
    }

    fn store_typed(&mut self, builder: &Builder, base: Gpr, offset: i32, v: ValueId) -> Result<()> {
        let ty = builder.ty_of(v);
        if ty.is_float() {
            self.materialize_float(builder, v, SCRATCH_XMM)?;
            if ty == ValueType::F64 {
                self.buf.movsd_store(base, offset, SCRATCH_XMM)
            } else {
                self.buf.movss_store(base, offset, SCRATCH_XMM)
            }
        } else {
            self.materialize_int(builder, v, SCRATCH0)?;
            self.buf.store_mem(base, offset, SCRATCH0, width_of(ty))
        }
    }

    // -- guest memory -------------------------------------------------------

    fn emit_load(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let addr = instr.args[0].unwrap();
        let result = instr.result.unwrap();
        let ty = builder.ty_of(result);
        if self.slowmem {
            self.materialize_int(builder, addr, Gpr::RSI)?;
            let target = match ty.bits() {
                8 => host_read8 as usize,
                16 => host_read16 as usize,
                64 => host_read64 as usize,
                _ => host_read32 as usize,
            };
            self.call_host(target, &[])?;
            if ty.is_float() {
                let dst = self.float_reg_of(builder, result);
                self.buf.movq_xmm_gpr(dst, Gpr::RAX)?;
            } else {
                let dst = self.int_reg_of(builder, result);
                if dst != Gpr::RAX {
                    self.buf.mov_reg_reg(dst, Gpr::RAX)?;
                }
            }
            Ok(())
        } else {
            self.materialize_int(builder, addr, SCRATCH1)?;
            if ty.is_float() {
                let dst = self.float_reg_of(builder, result);
                self.buf.load_mem_indexed(SCRATCH0, VBASE, SCRATCH1, width_of(ty), false)?;
                self.buf.movq_xmm_gpr(dst, SCRATCH0)
            } else {
                let dst = self.int_reg_of(builder, result);
                self.buf.load_mem_indexed(dst, VBASE, SCRATCH1, width_of(ty), false)
            }
        }
    }

    fn emit_store(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let addr = instr.args[0].unwrap();
        let v = instr.args[1].unwrap();
        let ty = builder.ty_of(v);
        if self.slowmem {
            self.materialize_int(builder, addr, Gpr::RSI)?;
            if ty.is_float() {
                self.materialize_float(builder, v, SCRATCH_XMM)?;
                self.buf.movq_gpr_xmm(Gpr::RDX, SCRATCH_XMM)?;
            } else {
                self.materialize_int(builder, v, Gpr::RDX)?;
            }
            let target = match ty.bits() {
                8 => host_write8 as usize,
                16 => host_write16 as usize,
                64 => host_write64 as usize,
                _ => host_write32 as usize,
            };
            self.call_host(target, &[])
        } else {
            self.materialize_int(builder, addr, SCRATCH1)?;
            if ty.is_float() {
                self.materialize_float(builder, v, SCRATCH_XMM)?;
                self.buf.movq_gpr_xmm(SCRATCH0, SCRATCH_XMM)?;
            } else {
                self.materialize_int(builder, v, SCRATCH0)?;
            }
            self.buf.store_mem_indexed(VBASE, SCRATCH1, SCRATCH0, width_of(ty))
        }
    }

    // -- ALU ----------------------------------------------------------------

    /// Two-operand reuse: regalloc already aliased `result`'s register with
    /// `args[0]`'s whenever that was legal, so codegen only needs to move
    /// `args[0]` into `result`'s register when they *don't* already match.
    fn materialize_dst_from_arg0(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<Gpr> {
        let dst = self.int_reg_of(builder, instr.result.unwrap());
        self.materialize_int(builder, instr.args[0].unwrap(), dst)?;
        Ok(dst)
    }

    fn emit_int_binary(&mut self, builder: &Builder, instr: &crate::ir::Instr, op: impl Fn(&mut CodeBuffer, Gpr, Gpr, bool) -> Result<()>) -> Result<()> {
        let dst = self.materialize_dst_from_arg0(builder, instr)?;
        let w64 = builder.ty_of(instr.result.unwrap()).bits() == 64;
        self.materialize_int(builder, instr.args[1].unwrap(), SCRATCH0)?;
        op(self.buf, dst, SCRATCH0, w64)
    }

    /// Two-operand reuse for the float class: like
    /// `materialize_dst_from_arg0`, but writes arg0 into `result`'s xmm
    /// register rather than a GPR.
    fn materialize_dst_from_arg0_float(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<Xmm> {
        let dst = self.float_reg_of(builder, instr.result.unwrap());
        self.materialize_float(builder, instr.args[0].unwrap(), dst)?;
        Ok(dst)
    }

    /// Picks an xmm scratch register distinct from `dst`. Unlike the
    /// integer class, every xmm register is allocator-visible (module doc
    /// comment), so `args[1]` must be staged into a register that is
    /// provably not `dst` before the op clobbers it.
    fn float_scratch_avoiding(dst: Xmm) -> Xmm {
        if dst == Xmm(1) {
            Xmm(0)
        } else {
            Xmm(1)
        }
    }

    /// `Add`/`Sub`/`Mul`/`UMul` dispatch on the result type: integer
    /// operands go through the GPR path, float operands through the
    /// matching `ss`/`sd` SSE op. Routing float-typed values through the
    /// integer ALU would index `INT_REGS` with a register ordinal the
    /// allocator assigned from the float class and either panic or corrupt
    /// an unrelated GPR.
    fn emit_binary(
        &mut self,
        builder: &Builder,
        instr: &crate::ir::Instr,
        int_op: impl Fn(&mut CodeBuffer, Gpr, Gpr, bool) -> Result<()>,
        sd_op: impl Fn(&mut CodeBuffer, Xmm, Xmm) -> Result<()>,
        ss_op: impl Fn(&mut CodeBuffer, Xmm, Xmm) -> Result<()>,
    ) -> Result<()> {
        let ty = builder.ty_of(instr.result.unwrap());
        if ty.is_float() {
            let dst = self.materialize_dst_from_arg0_float(builder, instr)?;
            let scratch = Self::float_scratch_avoiding(dst);
            self.materialize_float(builder, instr.args[1].unwrap(), scratch)?;
            if ty == ValueType::F64 {
                sd_op(self.buf, dst, scratch)
            } else {
                ss_op(self.buf, dst, scratch)
            }
        } else {
            self.emit_int_binary(builder, instr, int_op)
        }
    }

    fn emit_shift(&mut self, builder: &Builder, instr: &crate::ir::Instr, op: impl Fn(&mut CodeBuffer, Gpr, bool) -> Result<()>) -> Result<()> {
        let dst = self.materialize_dst_from_arg0(builder, instr)?;
        let w64 = builder.ty_of(instr.result.unwrap()).bits() == 64;
        self.materialize_int(builder, instr.args[1].unwrap(), SCRATCH1)?;
        op(self.buf, dst, w64)
    }

    fn emit_unary(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let ty = builder.ty_of(instr.result.unwrap());
        if ty.is_float() {
            self.emit_float_neg(builder, instr)
        } else {
            let dst = self.materialize_dst_from_arg0(builder, instr)?;
            self.buf.neg_reg(dst, ty.bits() == 64)
        }
    }

    /// `dividend` (args[0]) is read into RAX and `divisor` (args[1]) into
    /// RCX *before* RDX is clobbered by `cqo`/zeroing, since RDX is one of
    /// this backend's allocatable registers and may hold either operand's
    /// current value (see the module doc comment's register convention).
    fn emit_div(&mut self, builder: &Builder, instr: &crate::ir::Instr, signed: bool) -> Result<()> {
        let w64 = builder.ty_of(instr.result.unwrap()).bits() == 64;
        self.materialize_int(builder, instr.args[1].unwrap(), SCRATCH1)?;
        self.materialize_int(builder, instr.args[0].unwrap(), Gpr::RAX)?;
        if signed {
            self.buf.cqo(w64)?;
            self.buf.idiv_reg(SCRATCH1, w64)?;
        } else {
            self.buf.xor_reg_reg(Gpr::RDX, Gpr::RDX, w64)?;
            self.buf.div_reg(SCRATCH1, w64)?;
        }
        let dst = self.int_reg_of(builder, instr.result.unwrap());
        if dst != Gpr::RAX {
            self.buf.mov_reg_reg(dst, Gpr::RAX)?;
        }
        Ok(())
    }

    /// `Div`/`UDiv` dispatch on the result type the same way [`Self::emit_binary`]
    /// does: the signed/unsigned split only matters for the integer `idiv`/`div`
    /// path, since SSE has a single `divss`/`divsd` regardless.
    fn emit_div_or_fdiv(&mut self, builder: &Builder, instr: &crate::ir::Instr, signed: bool) -> Result<()> {
        let ty = builder.ty_of(instr.result.unwrap());
        if ty.is_float() {
            let dst = self.materialize_dst_from_arg0_float(builder, instr)?;
            let scratch = Self::float_scratch_avoiding(dst);
            self.materialize_float(builder, instr.args[1].unwrap(), scratch)?;
            if ty == ValueType::F64 {
                self.buf.divsd(dst, scratch)
            } else {
                self.buf.divss(dst, scratch)
            }
        } else {
            self.emit_div(builder, instr, signed)
        }
    }

    fn emit_cmp(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let a = instr.args[0].unwrap();
        let b = instr.args[1].unwrap();
        let is_float = builder.ty_of(a).is_float();
        let dst = self.int_reg_of(builder, instr.result.unwrap());
        let cond = cc_for(instr.opcode, is_float);
        if is_float {
            self.materialize_float(builder, a, Xmm(1))?;
            self.materialize_float(builder, b, Xmm(0))?;
            if builder.ty_of(a) == ValueType::F64 {
                self.buf.ucomisd(Xmm(1), Xmm(0))?;
            } else {
                self.buf.ucomiss(Xmm(1), Xmm(0))?;
            }
        } else {
            let w64 = builder.ty_of(a).bits() == 64;
            self.materialize_int(builder, a, SCRATCH0)?;
            self.materialize_int(builder, b, SCRATCH1)?;
            self.buf.cmp_reg_reg(SCRATCH0, SCRATCH1, w64)?;
        }
        self.buf.setcc(cond, dst)
    }

    fn emit_widen(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        // Neither reachable from the SH4 frontend today (see
        // `backend::interpreter`'s identical note): every width change it
        // needs goes through a typed `load_context`/`load` instead. Kept
        // correct for the common case an optimizer pass would introduce —
        // our zero-extension invariant already makes `zext`/`truncate` a
        // plain register move; only `sext` needs real work.
        let dst = self.int_reg_of(builder, instr.result.unwrap());
        let src_ty = builder.ty_of(instr.args[0].unwrap());
        self.materialize_int(builder, instr.args[0].unwrap(), dst)?;
        if instr.opcode == Opcode::Sext {
            // Shift the sign bit of the narrow value up to bit 63, then
            // shift back down arithmetically to refill it: `dst` already
            // holds the zero-extended value per this backend's at-rest
            // invariant, so only the shift amount depends on `src_ty`.
            let shift = match src_ty {
                ValueType::I8 => 56,
                ValueType::I16 => 48,
                ValueType::I32 => 32,
                _ => return Ok(()),
            };
            debug_assert_ne!(dst, SCRATCH1, "sext's dst is never the shift-count register");
            self.buf.mov_reg_imm32(SCRATCH1, shift)?;
            self.buf.shl_cl(dst, true)?;
            self.buf.mov_reg_imm32(SCRATCH1, shift)?;
            self.buf.sar_cl(dst, true)
        } else {
            Ok(())
        }
    }

    fn emit_cast(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let dst_ty = builder.ty_of(instr.result.unwrap());
        let src = instr.args[0].unwrap();
        if dst_ty.is_float() {
            self.materialize_int(builder, src, SCRATCH0)?;
            let dst = self.float_reg_of(builder, instr.result.unwrap());
            if dst_ty == ValueType::F64 {
                self.buf.cvtsi2sd(dst, SCRATCH0, false)
            } else {
                self.buf.cvtsi2ss(dst, SCRATCH0, false)
            }
        } else {
            let src_ty = builder.ty_of(src);
            self.materialize_float(builder, src, Xmm(0))?;
            let dst = self.int_reg_of(builder, instr.result.unwrap());
            if src_ty == ValueType::F64 {
                self.buf.cvttsd2si(dst, Xmm(0), false)
            } else {
                self.buf.cvttss2si(dst, Xmm(0), false)
            }
        }
    }

    fn emit_float_unary(
        &mut self,
        builder: &Builder,
        instr: &crate::ir::Instr,
        sd: impl Fn(&mut CodeBuffer, Xmm, Xmm) -> Result<()>,
        ss: impl Fn(&mut CodeBuffer, Xmm, Xmm) -> Result<()>,
    ) -> Result<()> {
        let ty = builder.ty_of(instr.result.unwrap());
        let dst = self.float_reg_of(builder, instr.result.unwrap());
        self.materialize_float(builder, instr.args[0].unwrap(), dst)?;
        if ty == ValueType::F64 {
            sd(self.buf, dst, dst)
        } else {
            ss(self.buf, dst, dst)
        }
    }

    /// `abs`: clear the sign bit through the integer domain (`and` with
    /// `0x7fff...`), avoiding a reserved scratch xmm register (module doc
    /// comment).
    fn emit_abs(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let ty = builder.ty_of(instr.result.unwrap());
        if !ty.is_float() {
            let dst = self.materialize_dst_from_arg0(builder, instr)?;
            // `wrapping_abs`: negate if negative. `cdq`-style: mask = dst>>31
            // (arithmetic), dst = (dst ^ mask) - mask.
            self.buf.mov_reg_reg(SCRATCH1, dst)?;
            self.buf.mov_reg_imm32(SCRATCH0, 31)?;
            self.buf.mov_reg_reg(Gpr::RCX, SCRATCH0)?;
            self.buf.sar_cl(SCRATCH1, ty.bits() == 64)?;
            self.buf.xor_reg_reg(dst, SCRATCH1, ty.bits() == 64)?;
            return self.buf.sub_reg_reg(dst, SCRATCH1, ty.bits() == 64);
        }
        let dst = self.float_reg_of(builder, instr.result.unwrap());
        self.materialize_float(builder, instr.args[0].unwrap(), dst)?;
        self.buf.movq_gpr_xmm(SCRATCH0, dst)?;
        let mask: u64 = if ty == ValueType::F64 { 0x7fff_ffff_ffff_ffff } else { 0x0000_0000_7fff_ffff };
        self.buf.mov_reg_imm64(SCRATCH1, mask)?;
        self.buf.and_reg_reg(SCRATCH0, SCRATCH1, true)?;
        self.buf.movq_xmm_gpr(dst, SCRATCH0)
    }

    fn emit_float_neg(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let ty = builder.ty_of(instr.result.unwrap());
        let dst = self.float_reg_of(builder, instr.result.unwrap());
        self.materialize_float(builder, instr.args[0].unwrap(), dst)?;
        self.buf.movq_gpr_xmm(SCRATCH0, dst)?;
        let mask: u64 = if ty == ValueType::F64 { 0x8000_0000_0000_0000 } else { 0x0000_0000_8000_0000 };
        self.buf.mov_reg_imm64(SCRATCH1, mask)?;
        self.buf.xor_reg_reg(SCRATCH0, SCRATCH1, true)?;
        self.buf.movq_xmm_gpr(dst, SCRATCH0)
    }

    /// `sin`/`cos`: not reachable from the SH4 frontend (no such opcode),
    /// but kept buildable for a future optimizer pass or frontend
    /// extension, via the same host-call staging as the slowmem load/store
    /// fallback.
    fn emit_math_intrinsic(&mut self, builder: &Builder, instr: &crate::ir::Instr, target: usize) -> Result<()> {
        let ty = builder.ty_of(instr.result.unwrap());
        self.materialize_float(builder, instr.args[0].unwrap(), Xmm(0))?;
        self.call_host(target, &[])?;
        let dst = self.float_reg_of(builder, instr.result.unwrap());
        if ty == ValueType::F64 {
            self.buf.movsd_reg_reg(dst, Xmm(0))
        } else {
            self.buf.movss_reg_reg(dst, Xmm(0))
        }
    }

    fn emit_select(&mut self, builder: &Builder, instr: &crate::ir::Instr) -> Result<()> {
        let cond = instr.args[0].unwrap();
        let a = instr.args[1].unwrap();
        let b = instr.args[2].unwrap();
        let ty = builder.ty_of(a);
        self.materialize_int(builder, cond, SCRATCH1)?;
        self.buf.test_reg_reg(SCRATCH1, SCRATCH1, false)?;
        if ty.is_float() {
            // No `cmovcc` for xmm registers: bitcast both sides into the
            // integer domain, `cmovcc` there, bitcast back.
            let dst = self.float_reg_of(builder, instr.result.unwrap());
            self.materialize_float(builder, b, dst)?;
            self.buf.movq_gpr_xmm(SCRATCH0, dst)?;
            self.materialize_float(builder, a, SCRATCH_XMM)?;
            self.buf.movq_gpr_xmm(SCRATCH1, SCRATCH_XMM)?;
            self.buf.cmovcc(cc::NE, SCRATCH0, SCRATCH1)?;
            self.buf.movq_xmm_gpr(dst, SCRATCH0)
        } else {
            let dst = self.int_reg_of(builder, instr.result.unwrap());
            self.materialize_int(builder, b, dst)?;
            self.materialize_int(builder, a, SCRATCH0)?;
            self.buf.cmovcc(cc::NE, dst, SCRATCH0)
        }
    }

    // -- host calls -----------------------------------------------------

    /// Saves every caller-saved register this backend treats as live
    /// (`CALL_SAVED_GPRS` plus all 16 xmm registers — every xmm is
    /// caller-saved under SysV and this backend reserves none as scratch),
    /// issues an indirect call to `target`, then restores them. `args` is
    /// unused today (every current call site stages its own arguments into
    /// RDI/RSI/RDX immediately before calling, since `ctx` already lives in
    /// RDI) but is kept so a future call site with more than two arguments
    /// has somewhere to put them.
    fn call_host(&mut self, target: usize, _args: &[Gpr]) -> Result<()> {
        self.buf.mov_reg_imm64(SCRATCH0, target as u64)?;
        for &r in &CALL_SAVED_GPRS {
            self.buf.push_reg(r)?;
        }
        self.buf.sub_rsp_imm32(XMM_SCRATCH_BYTES as u32)?;
        for (i, &xmm) in FLOAT_REGS.iter().enumerate() {
            self.buf.movsd_store(Gpr::RSP, i as i32 * 8, xmm)?;
        }
        self.buf.call_reg(SCRATCH0)?;
        for (i, &xmm) in FLOAT_REGS.iter().enumerate() {
            self.buf.movsd_load(xmm, Gpr::RSP, i as i32 * 8)?;
        }
        self.buf.add_rsp_imm32(XMM_SCRATCH_BYTES as u32)?;
        for &r in CALL_SAVED_GPRS.iter().rev() {
            self.buf.pop_reg(r)?;
        }
        Ok(())
    }
}

fn width_of(ty: ValueType) -> Width {
    match ty {
        ValueType::I8 => Width::W8,
        ValueType::I16 => Width::W16,
        ValueType::I32 | ValueType::F32 => Width::W32,
        ValueType::I64 | ValueType::F64 | ValueType::BlockRef => Width::W64,
    }
}

/// `ucomiss`/`ucomisd` set EFLAGS with unsigned semantics (CF/ZF/PF; SF/OF
/// always cleared), so a float comparison must use the unsigned condition
/// codes even where the IR opcode says "signed" — `cmp_sgt` on float
/// operands means "ordered greater-than", which is `seta`, not `setg`.
fn cc_for(opcode: Opcode, is_float: bool) -> u8 {
    use Opcode::*;
    match opcode {
        CmpEq => cc::E,
        CmpNe => cc::NE,
        CmpSlt => {
            if is_float {
                cc::B
            } else {
                cc::L
            }
        }
        CmpSle => {
            if is_float {
                cc::BE
            } else {
                cc::LE
            }
        }
        CmpSgt => {
            if is_float {
                cc::A
            } else {
                cc::G
            }
        }
        CmpSge => {
            if is_float {
                cc::AE
            } else {
                cc::GE
            }
        }
        CmpUlt => cc::B,
        CmpUle => cc::BE,
        CmpUgt => cc::A,
        CmpUge => cc::AE,
        _ => unreachable!("cc_for called on non-comparison opcode"),
    }
}

/// A second xmm register reserved purely as scratch for the rare ops
/// (`store_typed` for floats, `Select` on floats) that need to stage a
/// value outside the allocator's view. xmm1 doubles as the comparison
/// scratch in `emit_cmp`; neither runs concurrently with the other.
const SCRATCH_XMM: Xmm = Xmm(1);

// -- host trampolines ----------------------------------------------------
//
// Every compiled block's `ctx` pointer is the sole argument SysV guarantees
// on entry; these trampolines take it (or take what codegen has already
// staged in RSI/RDX per the call site) and do the one thing a JIT-emitted
// `call` can't: reach into `AddressSpace`'s checked, non-`repr(C)` API.

unsafe extern "C" fn host_vbase(ctx: *mut SH4Context) -> *mut u8 {
    let memory = unsafe { &*(*ctx).memory };
    memory.protected_base_ptr().unwrap_or(std::ptr::null_mut())
}

unsafe extern "C" fn host_read8(ctx: *mut SH4Context, addr: u32) -> u64 {
    unsafe { &*(*ctx).memory }.read8(addr) as u64
}
unsafe extern "C" fn host_read16(ctx: *mut SH4Context, addr: u32) -> u64 {
    unsafe { &*(*ctx).memory }.read16(addr) as u64
}
unsafe extern "C" fn host_read32(ctx: *mut SH4Context, addr: u32) -> u64 {
    unsafe { &*(*ctx).memory }.read32(addr) as u64
}
unsafe extern "C" fn host_read64(ctx: *mut SH4Context, addr: u32) -> u64 {
    unsafe { &*(*ctx).memory }.read64(addr)
}
unsafe extern "C" fn host_write8(ctx: *mut SH4Context, addr: u32, value: u64) {
    unsafe { &*(*ctx).memory }.write8(addr, value as u8)
}
unsafe extern "C" fn host_write16(ctx: *mut SH4Context, addr: u32, value: u64) {
    unsafe { &*(*ctx).memory }.write16(addr, value as u16)
}
unsafe extern "C" fn host_write32(ctx: *mut SH4Context, addr: u32, value: u64) {
    unsafe { &*(*ctx).memory }.write32(addr, value as u32)
}
unsafe extern "C" fn host_write64(ctx: *mut SH4Context, addr: u32, value: u64) {
    unsafe { &*(*ctx).memory }.write64(addr, value)
}

extern "C" fn host_sin(x: f64) -> f64 {
    x.sin()
}
extern "C" fn host_cos(x: f64) -> f64 {
    x.cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::passes;

    #[test]
    fn assembles_identity_block() {
        let mut b = Builder::new();
        b.block();
        let pc = b.emit_load_context(crate::frontend::sh4::offsets::PC, ValueType::I32);
        let one = b.alloc_constant(Constant::I32(1));
        let next = b.emit_add(pc, one);
        b.emit_store_context(crate::frontend::sh4::offsets::PC, next);
        b.emit_branch(crate::ir::BlockId(1));
        b.block();
        passes::run(&mut b).expect("passes succeed on a trivial block");

        let mut backend = X64Backend::new().expect("reserve code buffer");
        let block = backend.assemble(&b).expect("assembles");
        assert!(block.guest_cycles >= 0);
    }

    #[test]
    fn sext_i8_sign_extends_into_a_64_bit_register() {
        let mut b = Builder::new();
        b.block();
        let narrow = b.emit_load_context(crate::frontend::sh4::offsets::r(0), ValueType::I8);
        let wide = b.emit_sext(ValueType::I32, narrow);
        b.emit_store_context(crate::frontend::sh4::offsets::r(1), wide);
        b.emit_branch(crate::ir::BlockId(1));
        b.block();
        passes::run(&mut b).expect("passes succeed on a trivial block");

        let mut backend = X64Backend::new().expect("reserve code buffer");
        let block = backend.assemble(&b).expect("assembles");

        let mut space = crate::address_space::AddressSpace::new();
        let mut ctx = crate::frontend::sh4::SH4Context::default();
        ctx.memory = &mut space;
        ctx.r[0] = 0xff; // low byte of an i8 holding -1

        unsafe { (block.entry)(&mut ctx) };
        assert_eq!(ctx.r[1] as i32, -1, "sign bit of the narrow i8 must fill the whole 32-bit result");
    }

    /// Regression for routing float-typed `Add` through the integer ALU:
    /// before the fix this either panicked (`INT_REGS` indexed with a
    /// float-class ordinal) or silently added the two `f32`s' bit patterns
    /// as integers.
    #[test]
    fn float_add_uses_sse_not_the_integer_alu() {
        let mut b = Builder::new();
        b.block();
        let a = b.emit_load_context(crate::frontend::sh4::offsets::fr(0), ValueType::F32);
        let c = b.emit_load_context(crate::frontend::sh4::offsets::fr(1), ValueType::F32);
        let sum = b.emit_add(a, c);
        b.emit_store_context(crate::frontend::sh4::offsets::fr(2), sum);
        b.emit_branch(crate::ir::BlockId(1));
        b.block();
        passes::run(&mut b).expect("passes succeed on a trivial block");

        let mut backend = X64Backend::new().expect("reserve code buffer");
        let block = backend.assemble(&b).expect("assembles");

        let mut space = crate::address_space::AddressSpace::new();
        let mut ctx = crate::frontend::sh4::SH4Context::default();
        ctx.memory = &mut space;
        ctx.fr[0] = 1.5f32.to_bits();
        ctx.fr[1] = 2.25f32.to_bits();

        unsafe { (block.entry)(&mut ctx) };
        assert_eq!(f32::from_bits(ctx.fr[2]), 3.75f32);
    }

    /// Regression for `cmp/gt` on float operands: `ucomiss`'s EFLAGS are
    /// unsigned, so a naive `setg` mis-classifies e.g. `-1.0 > 2.0` whenever
    /// the sign bit makes the bit-pattern comparison disagree with IEEE
    /// ordering.
    #[test]
    fn float_cmp_sgt_follows_ieee_ordering_not_setg() {
        let mut b = Builder::new();
        b.block();
        let a = b.emit_load_context(crate::frontend::sh4::offsets::fr(0), ValueType::F32);
        let c = b.emit_load_context(crate::frontend::sh4::offsets::fr(1), ValueType::F32);
        let gt = b.emit_cmp_sgt(a, c);
        b.emit_store_context(crate::frontend::sh4::offsets::r(0), gt);
        b.emit_branch(crate::ir::BlockId(1));
        b.block();
        passes::run(&mut b).expect("passes succeed on a trivial block");

        let mut backend = X64Backend::new().expect("reserve code buffer");
        let block = backend.assemble(&b).expect("assembles");

        let mut space = crate::address_space::AddressSpace::new();
        let mut ctx = crate::frontend::sh4::SH4Context::default();
        ctx.memory = &mut space;
        ctx.fr[0] = (-1.0f32).to_bits();
        ctx.fr[1] = 2.0f32.to_bits();

        unsafe { (block.entry)(&mut ctx) };
        assert_eq!(ctx.r[0], 0, "-1.0 > 2.0 must be false under IEEE ordering");
    }

    #[test]
    fn frame_size_rounds_up_to_16() {
        assert_eq!(frame_size_of(0), 0);
        assert_eq!(frame_size_of(1), 16);
        assert_eq!(frame_size_of(16), 16);
        assert_eq!(frame_size_of(17), 32);
    }

    #[test]
    fn cc_table_covers_every_comparison() {
        for op in [
            Opcode::CmpEq,
            Opcode::CmpNe,
            Opcode::CmpSlt,
            Opcode::CmpSle,
            Opcode::CmpSgt,
            Opcode::CmpSge,
            Opcode::CmpUlt,
            Opcode::CmpUle,
            Opcode::CmpUgt,
            Opcode::CmpUge,
        ] {
            let _ = cc_for(op, false);
            let _ = cc_for(op, true);
        }
    }

    /// `cmp_sgt` on float operands must use `seta` (unsigned-above, which is
    /// what `ucomiss`'s EFLAGS actually encode), not `setg`: `setg` here
    /// reduces to `ZF=0`, which would call a<b "greater" whenever both
    /// operands compare not-equal in the wrong direction.
    #[test]
    fn float_greater_than_uses_unsigned_condition_code() {
        assert_eq!(cc_for(Opcode::CmpSgt, true), cc::A);
        assert_eq!(cc_for(Opcode::CmpSgt, false), cc::G);
        assert_eq!(cc_for(Opcode::CmpSlt, true), cc::B);
        assert_eq!(cc_for(Opcode::CmpSge, true), cc::AE);
        assert_eq!(cc_for(Opcode::CmpSle, true), cc::BE);
    }
}
