//! A small inline assembler for the subset of x86-64 this backend emits:
//! REX prefix bit layout, ModR/M, and SIB addressing for `mov` plus the
//! handful of ALU/SSE instructions the IR lowering needs.
//!
//! Not a general-purpose assembler: every `emit_*` method here produces
//! exactly the encoding [`super::mov_decoder`] can parse back out, for the
//! `load`/`store` fastmem instructions specifically.

use crate::address_space::mmap_shim::HostMapping;
use crate::error::{Error, Result};

/// An x86-64 general-purpose register, numbered 0-15 per the ModR/M and
/// REX.B/R/X extension scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpr(pub u8);

impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    fn low(self) -> u8 {
        self.0 & 0b111
    }
    fn needs_rex_bit(self) -> bool {
        self.0 >= 8
    }
}

/// An SSE register, xmm0-xmm15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xmm(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

/// A growable, incrementally-executable code buffer backing one backend's
/// worth of compiled blocks. `reserve`s one host mapping up front and keeps
/// it for the buffer's whole lifetime — [`CodeBuffer::finalize`] only
/// toggles that single mapping between writable and executable to commit
/// whatever has been staged since the last call, so pointers handed back by
/// earlier `finalize` calls stay valid for as long as the buffer lives.
pub struct CodeBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    mapping: HostMapping,
    /// Bytes already copied into `mapping` and made executable.
    committed: usize,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        let mapping = HostMapping::reserve(capacity)?;
        Ok(CodeBuffer { bytes: Vec::with_capacity(capacity), capacity, mapping, committed: 0 })
    }

    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    /// The bytes emitted so far, before `finalize` maps them executable.
    /// Used by tests and by the fastmem fault path, which decodes directly
    /// out of the mapped code rather than this buffer — but shares the
    /// accessor name for symmetry.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn push(&mut self, b: u8) -> Result<()> {
        if self.bytes.len() + 1 > self.capacity {
            return Err(Error::BufferOverflow);
        }
        self.bytes.push(b);
        Ok(())
    }

    fn push_slice(&mut self, s: &[u8]) -> Result<()> {
        if self.bytes.len() + s.len() > self.capacity {
            return Err(Error::BufferOverflow);
        }
        self.bytes.extend_from_slice(s);
        Ok(())
    }

    /// Commits every byte staged since the previous `finalize` (or since
    /// construction) into the backing mapping and returns a pointer to the
    /// start of *this* commit — i.e. the entry point of the block just
    /// assembled. Toggles the whole mapping write→exec around the copy,
    /// since a single page cannot be both on most hardened hosts.
    pub fn finalize(&mut self) -> Result<*const u8> {
        let entry_offset = self.committed;
        let new_bytes = &self.bytes[self.committed..];
        if !new_bytes.is_empty() {
            self.mapping.make_read_write(self.capacity)?;
            unsafe {
                std::ptr::copy_nonoverlapping(new_bytes.as_ptr(), self.mapping.as_ptr().add(entry_offset), new_bytes.len());
            }
            self.mapping.make_read_exec(self.capacity)?;
        }
        self.committed = self.bytes.len();
        Ok(unsafe { self.mapping.as_ptr().add(entry_offset) as *const u8 })
    }

    /// Drops every committed block and starts writing from byte zero again,
    /// freeing the old mapping.
    pub fn reset(&mut self) -> Result<()> {
        self.bytes.clear();
        self.committed = 0;
        self.mapping = HostMapping::reserve(self.capacity)?;
        Ok(())
    }

    // -- REX / ModR/M helpers --------------------------------------------

    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) -> Result<()> {
        if w || r || x || b {
            let byte = 0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8);
            self.push(byte)?;
        }
        Ok(())
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) -> Result<()> {
        self.push((md << 6) | ((reg & 7) << 3) | (rm & 7))
    }

    // -- GPR moves ---------------------------------------------------------

    /// `mov dst, src` (64-bit register-to-register).
    pub fn mov_reg_reg(&mut self, dst: Gpr, src: Gpr) -> Result<()> {
        self.rex(true, src.needs_rex_bit(), false, dst.needs_rex_bit())?;
        self.push(0x89)?;
        self.modrm(0b11, src.low(), dst.low())
    }

    /// `movabs dst, imm64`.
    pub fn mov_reg_imm64(&mut self, dst: Gpr, imm: u64) -> Result<()> {
        self.rex(true, false, false, dst.needs_rex_bit())?;
        self.push(0xB8 + dst.low())?;
        self.push_slice(&imm.to_le_bytes())
    }

    /// `mov dst_reg, imm32` (zero-extends into the 64-bit register; used for
    /// guest 32-bit constants, which is the common case for SH4 code).
    pub fn mov_reg_imm32(&mut self, dst: Gpr, imm: u32) -> Result<()> {
        self.rex(false, false, false, dst.needs_rex_bit())?;
        self.push(0xB8 + dst.low())?;
        self.push_slice(&imm.to_le_bytes())
    }

    /// `mov dst, [base + disp32]` / `movzx`/`movsx` depending on `width` and
    /// `signed`. `disp32` is always emitted (mod=0b10) to keep encoding
    /// uniform regardless of offset size.
    pub fn load_mem(&mut self, dst: Gpr, base: Gpr, disp: i32, width: Width, signed: bool) -> Result<()> {
        match width {
            Width::W64 => {
                self.rex(true, dst.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x8B)?;
            }
            Width::W32 if !signed => {
                self.rex(false, dst.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x8B)?;
            }
            Width::W32 => {
                // movsxd dst, dword [base+disp]
                self.rex(true, dst.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x63)?;
            }
            Width::W16 => {
                self.rex(false, dst.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x0F)?;
                self.push(if signed { 0xBF } else { 0xB7 })?;
            }
            Width::W8 => {
                self.rex(false, dst.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x0F)?;
                self.push(if signed { 0xBE } else { 0xB6 })?;
            }
        }
        self.mem_operand(dst.low(), base, disp)
    }

    /// `mov [base + disp32], src`, truncated to `width`.
    pub fn store_mem(&mut self, base: Gpr, disp: i32, src: Gpr, width: Width) -> Result<()> {
        match width {
            Width::W64 => {
                self.rex(true, src.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x89)?;
            }
            Width::W32 => {
                self.rex(false, src.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x89)?;
            }
            Width::W16 => {
                self.push(0x66)?;
                self.rex(false, src.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x89)?;
            }
            Width::W8 => {
                self.rex(false, src.needs_rex_bit(), false, base.needs_rex_bit())?;
                self.push(0x88)?;
            }
        }
        self.mem_operand(src.low(), base, disp)
    }

    /// Emits the ModR/M (+ SIB, if `base` is RSP/R12) and disp32 for a
    /// `[base + disp32]` memory operand with reg field `reg_field`.
    fn mem_operand(&mut self, reg_field: u8, base: Gpr, disp: i32) -> Result<()> {
        self.modrm(0b10, reg_field, base.low())?;
        if base.low() == 0b100 {
            // SIB byte with no index: scale=0, index=100 (none), base=base.
            self.push(0x24)?;
        }
        self.push_slice(&disp.to_le_bytes())
    }

    /// `mov [base + index], src` — a guest-address fastmem access with no
    /// displacement and a register index (the common case: `[vbase + addr]`).
    pub fn store_mem_indexed(&mut self, base: Gpr, index: Gpr, src: Gpr, width: Width) -> Result<()> {
        match width {
            Width::W64 => {
                self.rex(true, src.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x89)?;
            }
            Width::W32 => {
                self.rex(false, src.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x89)?;
            }
            Width::W16 => {
                self.push(0x66)?;
                self.rex(false, src.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x89)?;
            }
            Width::W8 => {
                self.rex(false, src.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x88)?;
            }
        }
        self.modrm(0b00, src.low(), 0b100)?;
        self.push((0 << 6) | ((index.low()) << 3) | base.low())
    }

    pub fn load_mem_indexed(&mut self, dst: Gpr, base: Gpr, index: Gpr, width: Width, signed: bool) -> Result<()> {
        match width {
            Width::W64 => {
                self.rex(true, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x8B)?;
            }
            Width::W32 if !signed => {
                self.rex(false, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x8B)?;
            }
            Width::W32 => {
                self.rex(true, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x63)?;
            }
            Width::W16 => {
                self.rex(false, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x0F)?;
                self.push(if signed { 0xBF } else { 0xB7 })?;
            }
            Width::W8 => {
                self.rex(false, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit())?;
                self.push(0x0F)?;
                self.push(if signed { 0xBE } else { 0xB6 })?;
            }
        }
        self.modrm(0b00, dst.low(), 0b100)?;
        self.push((0 << 6) | (index.low() << 3) | base.low())
    }

    // -- ALU -----------------------------------------------------------

    /// `w64` selects the operand width: `true` emits `REX.W` for a full
    /// 64-bit op, `false` a plain 32-bit op (which, per x86-64 semantics,
    /// zeroes the destination's upper 32 bits — the backend's way of
    /// keeping every `I32` value canonically zero-extended in its GPR; see
    /// the module doc comment).
    fn alu_reg_reg(&mut self, opcode: u8, dst: Gpr, src: Gpr, w64: bool) -> Result<()> {
        self.rex(w64, src.needs_rex_bit(), false, dst.needs_rex_bit())?;
        self.push(opcode)?;
        self.modrm(0b11, src.low(), dst.low())
    }

    pub fn add_reg_reg(&mut self, dst: Gpr, src: Gpr, w64: bool) -> Result<()> {
        self.alu_reg_reg(0x01, dst, src, w64)
    }
    pub fn sub_reg_reg(&mut self, dst: Gpr, src: Gpr, w64: bool) -> Result<()> {
        self.alu_reg_reg(0x29, dst, src, w64)
    }
    pub fn and_reg_reg(&mut self, dst: Gpr, src: Gpr, w64: bool) -> Result<()> {
        self.alu_reg_reg(0x21, dst, src, w64)
    }
    pub fn or_reg_reg(&mut self, dst: Gpr, src: Gpr, w64: bool) -> Result<()> {
        self.alu_reg_reg(0x09, dst, src, w64)
    }
    pub fn xor_reg_reg(&mut self, dst: Gpr, src: Gpr, w64: bool) -> Result<()> {
        self.alu_reg_reg(0x31, dst, src, w64)
    }
    pub fn cmp_reg_reg(&mut self, a: Gpr, b: Gpr, w64: bool) -> Result<()> {
        self.alu_reg_reg(0x39, a, b, w64)
    }
    pub fn test_reg_reg(&mut self, a: Gpr, b: Gpr, w64: bool) -> Result<()> {
        self.alu_reg_reg(0x85, a, b, w64)
    }

    /// `imul dst, src` (two-operand form, signed multiply).
    pub fn imul_reg_reg(&mut self, dst: Gpr, src: Gpr, w64: bool) -> Result<()> {
        self.rex(w64, dst.needs_rex_bit(), false, src.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0xAF)?;
        self.modrm(0b11, dst.low(), src.low())
    }

    /// Sign-extends RAX into RDX:RAX (`w64`) or EAX into EDX:EAX, ahead of
    /// `idiv`. Caller is responsible for `dividend` already being in
    /// RAX/EAX.
    pub fn cqo(&mut self, w64: bool) -> Result<()> {
        if w64 {
            self.push(0x48)?;
        }
        self.push(0x99)
    }
    pub fn idiv_reg(&mut self, divisor: Gpr, w64: bool) -> Result<()> {
        self.rex(w64, false, false, divisor.needs_rex_bit())?;
        self.push(0xF7)?;
        self.modrm(0b11, 7, divisor.low())
    }
    /// Unsigned division; caller clears RDX/EDX first.
    pub fn div_reg(&mut self, divisor: Gpr, w64: bool) -> Result<()> {
        self.rex(w64, false, false, divisor.needs_rex_bit())?;
        self.push(0xF7)?;
        self.modrm(0b11, 6, divisor.low())
    }

    pub fn neg_reg(&mut self, r: Gpr, w64: bool) -> Result<()> {
        self.rex(w64, false, false, r.needs_rex_bit())?;
        self.push(0xF7)?;
        self.modrm(0b11, 3, r.low())
    }
    pub fn not_reg(&mut self, r: Gpr, w64: bool) -> Result<()> {
        self.rex(w64, false, false, r.needs_rex_bit())?;
        self.push(0xF7)?;
        self.modrm(0b11, 2, r.low())
    }

    /// `shl/sar/shr dst, cl` — the count must already be in `%cl`.
    pub fn shl_cl(&mut self, dst: Gpr, w64: bool) -> Result<()> {
        self.shift_cl(4, dst, w64)
    }
    pub fn sar_cl(&mut self, dst: Gpr, w64: bool) -> Result<()> {
        self.shift_cl(7, dst, w64)
    }
    pub fn shr_cl(&mut self, dst: Gpr, w64: bool) -> Result<()> {
        self.shift_cl(5, dst, w64)
    }
    fn shift_cl(&mut self, ext: u8, dst: Gpr, w64: bool) -> Result<()> {
        self.rex(w64, false, false, dst.needs_rex_bit())?;
        self.push(0xD3)?;
        self.modrm(0b11, ext, dst.low())
    }

    /// `setcc al_equivalent(dst)`, zero-extended into the full register via
    /// a following `movzx`.
    pub fn setcc(&mut self, cond: u8, dst: Gpr) -> Result<()> {
        self.rex(false, false, false, dst.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x90 | cond)?;
        self.modrm(0b11, 0, dst.low())?;
        // movzx dst, dst_byte
        self.rex(true, dst.needs_rex_bit(), false, dst.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0xB6)?;
        self.modrm(0b11, dst.low(), dst.low())
    }

    /// `cmovcc dst, src` — used to lower IR `Select` without backpatchable
    /// jump infrastructure.
    pub fn cmovcc(&mut self, cond: u8, dst: Gpr, src: Gpr) -> Result<()> {
        self.rex(true, dst.needs_rex_bit(), false, src.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x40 | cond)?;
        self.modrm(0b11, dst.low(), src.low())
    }

    pub fn push_reg(&mut self, r: Gpr) -> Result<()> {
        if r.needs_rex_bit() {
            self.push(0x41)?;
        }
        self.push(0x50 + r.low())
    }
    pub fn pop_reg(&mut self, r: Gpr) -> Result<()> {
        if r.needs_rex_bit() {
            self.push(0x41)?;
        }
        self.push(0x58 + r.low())
    }

    pub fn ret(&mut self) -> Result<()> {
        self.push(0xC3)
    }

    /// `call reg` (indirect call through a register holding the target).
    pub fn call_reg(&mut self, r: Gpr) -> Result<()> {
        if r.needs_rex_bit() {
            self.push(0x41)?;
        }
        self.push(0xFF)?;
        self.modrm(0b11, 2, r.low())
    }

    /// `sub rsp, imm32` / `add rsp, imm32` (stack frame allocation).
    pub fn sub_rsp_imm32(&mut self, imm: u32) -> Result<()> {
        self.rex(true, false, false, false)?;
        self.push(0x81)?;
        self.modrm(0b11, 5, Gpr::RSP.low())?;
        self.push_slice(&imm.to_le_bytes())
    }
    pub fn add_rsp_imm32(&mut self, imm: u32) -> Result<()> {
        self.rex(true, false, false, false)?;
        self.push(0x81)?;
        self.modrm(0b11, 0, Gpr::RSP.low())?;
        self.push_slice(&imm.to_le_bytes())
    }

    // -- SSE -------------------------------------------------------------

    fn sse_rr(&mut self, prefix: u8, opcode: u8, dst: Xmm, src: Xmm) -> Result<()> {
        self.push(prefix)?;
        let rex_r = dst.0 >= 8;
        let rex_b = src.0 >= 8;
        self.rex(false, rex_r, false, rex_b)?;
        self.push(0x0F)?;
        self.push(opcode)?;
        self.modrm(0b11, dst.0 & 7, src.0 & 7)
    }

    pub fn movsd_reg_reg(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF2, 0x10, dst, src)
    }
    pub fn movss_reg_reg(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF3, 0x10, dst, src)
    }
    pub fn addsd(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF2, 0x58, dst, src)
    }
    pub fn subsd(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF2, 0x5C, dst, src)
    }
    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF2, 0x59, dst, src)
    }
    pub fn divsd(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF2, 0x5E, dst, src)
    }
    pub fn sqrtsd(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF2, 0x51, dst, src)
    }
    pub fn addss(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF3, 0x58, dst, src)
    }
    pub fn subss(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF3, 0x5C, dst, src)
    }
    pub fn mulss(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF3, 0x59, dst, src)
    }
    pub fn divss(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF3, 0x5E, dst, src)
    }
    pub fn sqrtss(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF3, 0x51, dst, src)
    }
    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) -> Result<()> {
        self.push(0x66)?;
        let rex_r = a.0 >= 8;
        let rex_b = b.0 >= 8;
        self.rex(false, rex_r, false, rex_b)?;
        self.push(0x0F)?;
        self.push(0x2E)?;
        self.modrm(0b11, a.0 & 7, b.0 & 7)
    }
    pub fn ucomiss(&mut self, a: Xmm, b: Xmm) -> Result<()> {
        let rex_r = a.0 >= 8;
        let rex_b = b.0 >= 8;
        self.rex(false, rex_r, false, rex_b)?;
        self.push(0x0F)?;
        self.push(0x2E)?;
        self.modrm(0b11, a.0 & 7, b.0 & 7)
    }

    /// `movq xmm, gpr` (bitcast, for abs/neg-via-mask and cast emission).
    pub fn movq_xmm_gpr(&mut self, dst: Xmm, src: Gpr) -> Result<()> {
        self.push(0x66)?;
        self.rex(true, dst.0 >= 8, false, src.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x6E)?;
        self.modrm(0b11, dst.0 & 7, src.low())
    }
    pub fn movq_gpr_xmm(&mut self, dst: Gpr, src: Xmm) -> Result<()> {
        self.push(0x66)?;
        self.rex(true, src.0 >= 8, false, dst.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x7E)?;
        self.modrm(0b11, src.0 & 7, dst.low())
    }

    /// `w64` selects whether the integer side is read/written as a 32-bit
    /// or 64-bit GPR (SH4 `float`/`ftrc` always work on the 32-bit FPUL, so
    /// callers pass `false`; exposed for completeness).
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Gpr, w64: bool) -> Result<()> {
        self.push(0xF2)?;
        self.rex(w64, dst.0 >= 8, false, src.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x2A)?;
        self.modrm(0b11, dst.0 & 7, src.low())
    }
    pub fn cvtsi2ss(&mut self, dst: Xmm, src: Gpr, w64: bool) -> Result<()> {
        self.push(0xF3)?;
        self.rex(w64, dst.0 >= 8, false, src.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x2A)?;
        self.modrm(0b11, dst.0 & 7, src.low())
    }
    pub fn cvttsd2si(&mut self, dst: Gpr, src: Xmm, w64: bool) -> Result<()> {
        self.push(0xF2)?;
        self.rex(w64, dst.needs_rex_bit(), false, src.0 >= 8)?;
        self.push(0x0F)?;
        self.push(0x2C)?;
        self.modrm(0b11, dst.low(), src.0 & 7)
    }
    pub fn cvttss2si(&mut self, dst: Gpr, src: Xmm, w64: bool) -> Result<()> {
        self.push(0xF3)?;
        self.rex(w64, dst.needs_rex_bit(), false, src.0 >= 8)?;
        self.push(0x0F)?;
        self.push(0x2C)?;
        self.modrm(0b11, dst.low(), src.0 & 7)
    }

    /// `movsd`/`movss [base + disp32], src` and the matching loads — used to
    /// spill/fill xmm registers around host calls (`set_slowmem_hint`'s
    /// slow-path load/store, `Sin`/`Cos`) since every xmm register is
    /// caller-saved under SysV.
    pub fn movsd_store(&mut self, base: Gpr, disp: i32, src: Xmm) -> Result<()> {
        self.push(0xF2)?;
        self.rex(false, src.0 >= 8, false, base.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x11)?;
        self.mem_operand(src.0 & 7, base, disp)
    }
    pub fn movsd_load(&mut self, dst: Xmm, base: Gpr, disp: i32) -> Result<()> {
        self.push(0xF2)?;
        self.rex(false, dst.0 >= 8, false, base.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x10)?;
        self.mem_operand(dst.0 & 7, base, disp)
    }
    pub fn movss_store(&mut self, base: Gpr, disp: i32, src: Xmm) -> Result<()> {
        self.push(0xF3)?;
        self.rex(false, src.0 >= 8, false, base.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x11)?;
        self.mem_operand(src.0 & 7, base, disp)
    }
    pub fn movss_load(&mut self, dst: Xmm, base: Gpr, disp: i32) -> Result<()> {
        self.push(0xF3)?;
        self.rex(false, dst.0 >= 8, false, base.needs_rex_bit())?;
        self.push(0x0F)?;
        self.push(0x10)?;
        self.mem_operand(dst.0 & 7, base, disp)
    }
    /// `cvtsd2ss`/`cvtss2sd` — SH4 `double_pr` toggles lower/raise the
    /// working float width between blocks; this backend never mixes widths
    /// within one block (the frontend samples `fpu_state` once per block),
    /// but the opcode is exposed for completeness.
    pub fn cvtsd2ss(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF2, 0x5A, dst, src)
    }
    pub fn cvtss2sd(&mut self, dst: Xmm, src: Xmm) -> Result<()> {
        self.sse_rr(0xF3, 0x5A, dst, src)
    }
}

pub mod cc {
    pub const E: u8 = 0x4;
    pub const NE: u8 = 0x5;
    pub const L: u8 = 0xC;
    pub const LE: u8 = 0xE;
    pub const G: u8 = 0xF;
    pub const GE: u8 = 0xD;
    pub const B: u8 = 0x2;
    pub const BE: u8 = 0x6;
    pub const A: u8 = 0x7;
    pub const AE: u8 = 0x3;
}
