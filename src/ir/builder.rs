//! The IR builder. Owns every value, instruction, and
//! block transitively; dropping a `Builder` frees the whole graph.

use std::ptr::NonNull;

use super::block::Block;
use super::instr::{BlockId, Instr};
use super::opcode::{OpFlags, Opcode, ValueType};
use super::value::{Constant, InstrId, UseNode, Value, ValueId};

#[derive(Debug, Clone, Copy, Default)]
pub struct Metadata {
    pub guest_cycles: i32,
    pub entry_pc: u32,
}

pub struct LocalSlot {
    pub ty: ValueType,
    pub offset: i32,
}

pub struct Builder {
    pub values: Vec<Value>,
    pub instrs: Vec<Instr>,
    pub blocks: Vec<Block>,
    pub locals: Vec<LocalSlot>,
    pub locals_size: i32,
    pub metadata: Metadata,
    insert_block: BlockId,
    insert_index: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            values: Vec::new(),
            instrs: Vec::new(),
            blocks: Vec::new(),
            locals: Vec::new(),
            locals_size: 0,
            metadata: Metadata::default(),
            insert_block: BlockId(0),
            insert_index: 0,
        }
    }

    // -- block management -------------------------------------------------

    pub fn block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new());
        self.insert_block = id;
        self.insert_index = 0;
        id
    }

    pub fn current_block(&self) -> BlockId {
        self.insert_block
    }

    pub fn set_insert_point(&mut self, block: BlockId, after: Option<InstrId>) {
        self.insert_block = block;
        self.insert_index = match after {
            None => 0,
            Some(instr) => self.blocks[block.0 as usize].index_of(instr).map(|i| i + 1).unwrap_or(self.blocks[block.0 as usize].instrs.len()),
        };
    }

    // -- value accessors ----------------------------------------------------

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0 as usize]
    }

    pub fn ty_of(&self, id: ValueId) -> ValueType {
        self.values[id.0 as usize].ty
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.0 as usize]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.0 as usize]
    }

    pub fn alloc_constant(&mut self, c: Constant) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value::new_constant(c));
        id
    }

    pub fn alloc_block_ref(&mut self, block: BlockId) -> ValueId {
        self.alloc_constant(Constant::I32(block.0 as i32))
    }

    pub fn alloc_local(&mut self, ty: ValueType) -> i32 {
        let offset = self.locals_size;
        self.locals_size += (ty.bits() / 8) as i32;
        self.locals.push(LocalSlot { ty, offset });
        offset
    }

    // -- graph surgery --------------------------------------------------

    /// Walks `old`'s use-list and rewrites every argument pointer to `new`,
    /// transferring use-list membership node-for-node.
    pub fn replace_all_uses_of(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        loop {
            let node = match self.values[old.0 as usize].uses.pop_front() {
                Some(node) => node,
                None => break,
            };
            let user = node.user;
            let arg_index = node.arg_index as usize;
            self.instrs[user.0 as usize].args[arg_index] = Some(new);
            self.values[new.0 as usize].uses.push_back(node);
        }
    }

    /// Detaches `instr` from its block and from every argument's use-list.
    pub fn remove_instr(&mut self, instr: InstrId) {
        let block_id = self.instrs[instr.0 as usize].block;
        if let Some(idx) = self.blocks[block_id.0 as usize].index_of(instr) {
            self.blocks[block_id.0 as usize].instrs.remove(idx);
        }
        let use_nodes = self.instrs[instr.0 as usize].use_nodes;
        let args = self.instrs[instr.0 as usize].args;
        for i in 0..3 {
            if let (Some(ptr), Some(arg)) = (use_nodes[i], args[i]) {
                unsafe {
                    let mut cursor = self.values[arg.0 as usize].uses.cursor_mut_from_ptr(ptr.as_ptr());
                    cursor.remove();
                }
            }
        }
    }

    // -- instruction emission --------------------------------------------

    fn push_instr(
        &mut self,
        opcode: Opcode,
        result_ty: Option<ValueType>,
        args: [Option<ValueId>; 3],
        context_offset: Option<u32>,
        extra_flags: OpFlags,
        guest_addr: u32,
    ) -> (InstrId, Option<ValueId>) {
        let instr_id = InstrId(self.instrs.len() as u32);
        let mut use_nodes: [Option<NonNull<UseNode>>; 3] = [None, None, None];
        for (i, arg) in args.iter().enumerate() {
            if let Some(arg) = arg {
                let node = UseNode::new(instr_id, i as u8);
                let ptr = NonNull::from(node.as_ref());
                self.values[arg.0 as usize].uses.push_back(node);
                use_nodes[i] = Some(ptr);
            }
        }
        let result = result_ty.map(|ty| {
            let id = ValueId(self.values.len() as u32);
            self.values.push(Value::new(ty));
            id
        });
        let flags = opcode.flags() | extra_flags;
        let instr = Instr { opcode, result, args, use_nodes, tag: 0, context_offset, flags, block: self.insert_block, guest_addr };
        self.instrs.push(instr);
        let block = &mut self.blocks[self.insert_block.0 as usize];
        block.instrs.insert(self.insert_index, instr_id);
        self.insert_index += 1;
        (instr_id, result)
    }

    fn emit_binary(&mut self, opcode: Opcode, a: ValueId, b: ValueId) -> ValueId {
        debug_assert_eq!(self.ty_of(a), self.ty_of(b));
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(opcode, Some(ty), [Some(a), Some(b), None], None, OpFlags::empty(), 0);
        result.expect("binary op always produces a result")
    }

    fn emit_cmp(&mut self, opcode: Opcode, a: ValueId, b: ValueId) -> ValueId {
        debug_assert_eq!(self.ty_of(a), self.ty_of(b));
        let (_, result) = self.push_instr(opcode, Some(ValueType::I8), [Some(a), Some(b), None], None, OpFlags::empty(), 0);
        result.expect("compare always produces a result")
    }

    pub fn emit_add(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Add, a, b)
    }
    pub fn emit_sub(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Sub, a, b)
    }
    pub fn emit_mul(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Mul, a, b)
    }
    pub fn emit_umul(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::UMul, a, b)
    }
    pub fn emit_div(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Div, a, b)
    }
    pub fn emit_udiv(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::UDiv, a, b)
    }
    pub fn emit_and(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::And, a, b)
    }
    pub fn emit_or(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Or, a, b)
    }
    pub fn emit_xor(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Xor, a, b)
    }
    pub fn emit_shl(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Shl, a, b)
    }
    pub fn emit_ashr(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Ashr, a, b)
    }
    pub fn emit_lshr(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_binary(Opcode::Lshr, a, b)
    }

    pub fn emit_neg(&mut self, a: ValueId) -> ValueId {
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(Opcode::Neg, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_not(&mut self, a: ValueId) -> ValueId {
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(Opcode::Not, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }

    pub fn emit_cmp_eq(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpEq, a, b)
    }
    pub fn emit_cmp_ne(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpNe, a, b)
    }
    pub fn emit_cmp_slt(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpSlt, a, b)
    }
    pub fn emit_cmp_sle(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpSle, a, b)
    }
    pub fn emit_cmp_sgt(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpSgt, a, b)
    }
    pub fn emit_cmp_sge(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpSge, a, b)
    }
    pub fn emit_cmp_ult(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpUlt, a, b)
    }
    pub fn emit_cmp_ule(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpUle, a, b)
    }
    pub fn emit_cmp_ugt(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpUgt, a, b)
    }
    pub fn emit_cmp_uge(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.emit_cmp(Opcode::CmpUge, a, b)
    }

    pub fn emit_sext(&mut self, ty: ValueType, a: ValueId) -> ValueId {
        let (_, result) = self.push_instr(Opcode::Sext, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_zext(&mut self, ty: ValueType, a: ValueId) -> ValueId {
        let (_, result) = self.push_instr(Opcode::Zext, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_truncate(&mut self, ty: ValueType, a: ValueId) -> ValueId {
        let (_, result) = self.push_instr(Opcode::Truncate, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_cast(&mut self, ty: ValueType, a: ValueId) -> ValueId {
        let (_, result) = self.push_instr(Opcode::Cast, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }

    pub fn emit_sqrt(&mut self, a: ValueId) -> ValueId {
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(Opcode::Sqrt, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_abs(&mut self, a: ValueId) -> ValueId {
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(Opcode::Abs, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_sin(&mut self, a: ValueId) -> ValueId {
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(Opcode::Sin, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_cos(&mut self, a: ValueId) -> ValueId {
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(Opcode::Cos, Some(ty), [Some(a), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }

    pub fn emit_select(&mut self, cond: ValueId, a: ValueId, b: ValueId) -> ValueId {
        debug_assert_eq!(self.ty_of(a), self.ty_of(b));
        let ty = self.ty_of(a);
        let (_, result) = self.push_instr(Opcode::Select, Some(ty), [Some(cond), Some(a), Some(b)], None, OpFlags::empty(), 0);
        result.unwrap()
    }

    pub fn emit_load_context(&mut self, offset: u32, ty: ValueType) -> ValueId {
        let (_, result) = self.push_instr(Opcode::LoadContext, Some(ty), [None, None, None], Some(offset), OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_store_context(&mut self, offset: u32, v: ValueId) {
        self.push_instr(Opcode::StoreContext, None, [Some(v), None, None], Some(offset), OpFlags::empty(), 0);
    }
    pub fn emit_store_context_flagged(&mut self, offset: u32, v: ValueId, extra: OpFlags) {
        self.push_instr(Opcode::StoreContext, None, [Some(v), None, None], Some(offset), extra, 0);
    }

    pub fn emit_load_local(&mut self, offset: i32, ty: ValueType) -> ValueId {
        let (_, result) = self.push_instr(Opcode::LoadLocal, Some(ty), [None, None, None], Some(offset as u32), OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_store_local(&mut self, offset: i32, v: ValueId) {
        self.push_instr(Opcode::StoreLocal, None, [Some(v), None, None], Some(offset as u32), OpFlags::empty(), 0);
    }

    pub fn emit_load(&mut self, addr: ValueId, ty: ValueType) -> ValueId {
        let (_, result) = self.push_instr(Opcode::Load, Some(ty), [Some(addr), None, None], None, OpFlags::empty(), 0);
        result.unwrap()
    }
    pub fn emit_store(&mut self, addr: ValueId, v: ValueId) {
        self.push_instr(Opcode::Store, None, [Some(addr), Some(v), None], None, OpFlags::empty(), 0);
    }

    pub fn emit_branch(&mut self, target: BlockId) {
        let target_val = self.alloc_block_ref(target);
        self.push_instr(Opcode::Branch, None, [Some(target_val), None, None], None, OpFlags::empty(), 0);
    }

    pub fn emit_branch_cond(&mut self, cond: ValueId, if_true: BlockId, if_false: BlockId) {
        let t = self.alloc_block_ref(if_true);
        let f = self.alloc_block_ref(if_false);
        self.push_instr(Opcode::BranchCond, None, [Some(cond), Some(t), Some(f)], None, OpFlags::empty(), 0);
    }

    pub fn emit_call_external(&mut self, fn_tag: i64) {
        let (id, _) = self.push_instr(Opcode::CallExternal, None, [None, None, None], None, OpFlags::empty(), 0);
        self.instrs[id.0 as usize].tag = fn_tag;
    }

    pub fn emit_invalidate_context(&mut self) {
        self.push_instr(Opcode::InvalidateContext, None, [None, None, None], None, OpFlags::empty(), 0);
    }

    pub fn branch_target(&self, block_ref: ValueId) -> BlockId {
        match self.values[block_ref.0 as usize].constant {
            Some(Constant::I32(idx)) => BlockId(idx as u32),
            _ => panic!("value is not a block reference"),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_add_links_both_operands_use_lists() {
        let mut b = Builder::new();
        b.block();
        let a = b.alloc_constant(Constant::I32(1));
        let c = b.alloc_constant(Constant::I32(2));
        let sum = b.emit_add(a, c);

        assert_eq!(b.ty_of(sum), ValueType::I32);
        assert_eq!(b.value(a).use_count(), 1);
        assert_eq!(b.value(c).use_count(), 1);
    }

    #[test]
    fn alloc_local_packs_slots_by_type_width() {
        let mut b = Builder::new();
        let first = b.alloc_local(ValueType::I8);
        let second = b.alloc_local(ValueType::I32);
        let third = b.alloc_local(ValueType::I64);

        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(third, 5);
        assert_eq!(b.locals_size, 13);
    }

    #[test]
    fn set_insert_point_after_an_instruction_inserts_right_after_it() {
        let mut b = Builder::new();
        b.block();
        let a = b.alloc_constant(Constant::I32(1));
        let first = b.emit_neg(a);
        let first_instr = InstrId((b.instrs.len() - 1) as u32);
        let second = b.emit_neg(a);

        // Rewind and insert a third negation directly after the first,
        // mirroring how the register allocator threads spill fixups mid-block.
        b.set_insert_point(b.current_block(), Some(first_instr));
        let third = b.emit_neg(a);

        let block = &b.blocks[b.current_block().0 as usize];
        let pos_of = |v: ValueId| block.instrs.iter().position(|&id| b.instr(id).result == Some(v)).unwrap();
        assert!(pos_of(third) < pos_of(second));
        assert!(pos_of(first) < pos_of(third));
    }

    #[test]
    fn replace_all_uses_of_retargets_every_argument_slot() {
        let mut b = Builder::new();
        b.block();
        let a = b.alloc_constant(Constant::I32(1));
        let c = b.alloc_constant(Constant::I32(2));
        let new = b.alloc_constant(Constant::I32(9));
        let sum = b.emit_add(a, c);
        b.emit_store_context(0, sum);

        b.replace_all_uses_of(a, new);

        assert_eq!(b.value(a).use_count(), 0);
        assert_eq!(b.value(new).use_count(), 1);
        let add_id = b.blocks[0].instrs.iter().copied().find(|&id| b.instr(id).result == Some(sum)).unwrap();
        assert_eq!(b.instr(add_id).args[0], Some(new));
    }

    #[test]
    fn remove_instr_detaches_from_block_and_operand_use_lists() {
        let mut b = Builder::new();
        b.block();
        let a = b.alloc_constant(Constant::I32(1));
        let neg = b.emit_neg(a);
        let neg_instr = InstrId((b.instrs.len() - 1) as u32);
        b.emit_store_context(0, neg);

        b.remove_instr(neg_instr);

        assert!(b.blocks[0].index_of(neg_instr).is_none());
        assert_eq!(b.value(a).use_count(), 0);
    }
}
