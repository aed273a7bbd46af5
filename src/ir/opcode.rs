//! IR opcodes, their flags, and the value-type system.

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// A reference to a block, used only as the target argument of branches.
    BlockRef,
}

impl ValueType {
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }

    pub fn bits(self) -> u32 {
        match self {
            ValueType::I8 => 8,
            ValueType::I16 => 16,
            ValueType::I32 | ValueType::F32 => 32,
            ValueType::I64 | ValueType::F64 => 64,
            ValueType::BlockRef => 64,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Executing this instruction can invalidate every context (guest
        /// register) load/store elimination has cached so far.
        const IF_INVALIDATE_CONTEXT = 1 << 0;
        const OP_FLAG_BRANCH        = 1 << 1;
        const OP_FLAG_SET_SR        = 1 << 2;
        const OP_FLAG_SET_FPSCR     = 1 << 3;
        /// This instruction has an SH4 delay slot.
        const OP_FLAG_DELAYED       = 1 << 4;
        const OP_FLAG_CONDITIONAL   = 1 << 5;
        const OP_FLAG_SET_T         = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Control
    Branch,
    BranchCond,
    CallExternal,
    InvalidateContext,

    // Memory: context (guest register file)
    LoadContext,
    StoreContext,
    // Memory: builder-local spill/scratch slots
    LoadLocal,
    StoreLocal,
    // Memory: guest address space
    Load,
    Store,

    // Arithmetic
    Add,
    Sub,
    Mul,
    UMul,
    Div,
    UDiv,
    Neg,

    // Bitwise
    And,
    Or,
    Xor,
    Not,
    Shl,
    Ashr,
    Lshr,

    // Compare (result is i8 boolean: 0 or 1)
    CmpEq,
    CmpNe,
    CmpSlt,
    CmpSle,
    CmpSgt,
    CmpSge,
    CmpUlt,
    CmpUle,
    CmpUgt,
    CmpUge,

    // Conversion
    Sext,
    Zext,
    Truncate,
    Cast,

    // Math intrinsics
    Sqrt,
    Abs,
    Sin,
    Cos,

    // Control flow helper
    Select,
}

impl Opcode {
    pub fn flags(self) -> OpFlags {
        use Opcode::*;
        match self {
            Branch | BranchCond => OpFlags::OP_FLAG_BRANCH,
            CallExternal | InvalidateContext => OpFlags::IF_INVALIDATE_CONTEXT,
            _ => OpFlags::empty(),
        }
    }

    pub fn has_side_effect(self) -> bool {
        use Opcode::*;
        matches!(self, Branch | BranchCond | CallExternal | InvalidateContext | StoreContext | StoreLocal | Store)
    }

    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::BranchCond)
    }

    /// Number of argument slots this opcode reads (ignoring the extra
    /// bookkeeping arguments of `load_context`/`store_context`, which are
    /// modeled via `Instr::context_offset` instead of an IR value argument).
    pub fn arity(self) -> usize {
        use Opcode::*;
        match self {
            Branch => 1,
            BranchCond => 3,
            CallExternal => 0,
            InvalidateContext => 0,
            LoadContext | LoadLocal => 0,
            StoreContext | StoreLocal => 1,
            Load => 1,
            Store => 2,
            Neg | Not | Sext | Zext | Truncate | Cast | Sqrt | Abs | Sin | Cos => 1,
            Select => 3,
            _ => 2,
        }
    }
}
