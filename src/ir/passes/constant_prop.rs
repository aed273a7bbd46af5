//! Constant propagation: a table-driven folder keyed by
//! opcode, firing only when the operand positions an opcode declares as
//! fold-required are themselves constants.

use crate::ir::{Builder, Constant, Opcode, ValueId};

/// Folds each block in forward program order, rewriting uses as soon as an
/// instruction folds so that a chain like `add(3,4)` feeding `mul(_,10)`
/// collapses to a single constant within one pass rather than needing a
/// second iteration to see the first fold's result.
pub fn run(builder: &mut Builder) {
    for block_idx in 0..builder.blocks.len() {
        let instrs = builder.blocks[block_idx].instrs.clone();
        for instr_id in instrs {
            let instr = builder.instr(instr_id);
            let opcode = instr.opcode;
            let args = instr.args;
            let result = instr.result;
            let Some(result) = result else { continue };

            let result_ty = builder.ty_of(result);
            let folded_value = if opcode == Opcode::Select {
                fold_select(builder, args)
            } else {
                fold_arith(builder, opcode, args, result_ty)
            };
            let Some(value) = folded_value else { continue };
            match value {
                FoldResult::Constant(c) => {
                    let new_value = builder.alloc_constant(c);
                    builder.replace_all_uses_of(result, new_value);
                    builder.remove_instr(instr_id);
                }
                FoldResult::Value(v) => {
                    builder.replace_all_uses_of(result, v);
                    builder.remove_instr(instr_id);
                }
            }
        }
    }
}

enum FoldResult {
    Constant(Constant),
    Value(ValueId),
}

fn constant_of(builder: &Builder, id: ValueId) -> Option<Constant> {
    builder.value(id).constant
}

fn fold_select(builder: &Builder, args: [Option<ValueId>; 3]) -> Option<FoldResult> {
    let cond = args[0]?;
    let a = args[1]?;
    let b = args[2]?;
    let cond_c = constant_of(builder, cond)?;
    Some(FoldResult::Value(if cond_c.is_zero() { b } else { a }))
}

fn fold_arith(builder: &Builder, opcode: Opcode, args: [Option<ValueId>; 3], result_ty: crate::ir::ValueType) -> Option<FoldResult> {
    use Opcode::*;
    match opcode {
        Add | Sub | Mul | UMul | Div | UDiv | And | Or | Xor | Shl | Ashr | Lshr | CmpEq | CmpNe | CmpSlt | CmpSle | CmpSgt | CmpSge | CmpUlt | CmpUle | CmpUgt | CmpUge => {
            let a = constant_of(builder, args[0]?)?;
            let b = constant_of(builder, args[1]?)?;
            fold_binary(opcode, a, b).map(FoldResult::Constant)
        }
        Neg | Not => {
            let a = constant_of(builder, args[0]?)?;
            fold_unary(opcode, a).map(FoldResult::Constant)
        }
        Sext | Zext | Truncate | Cast => {
            let a = constant_of(builder, args[0]?)?;
            Some(FoldResult::Constant(fold_conversion(opcode, a, result_ty)))
        }
        _ => None,
    }
}

fn fold_conversion(opcode: Opcode, a: Constant, result_ty: crate::ir::ValueType) -> Constant {
    use crate::ir::ValueType::*;
    use Opcode::*;
    match opcode {
        Sext => rebuild(opcode, result_ty, a.as_i64()),
        Zext => {
            let bits = a.ty().bits();
            let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
            rebuild(opcode, result_ty, (a.as_i64() as u64 & mask) as i64)
        }
        Truncate => {
            let bits = result_ty.bits();
            let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
            rebuild(opcode, result_ty, (a.as_i64() as u64 & mask) as i64)
        }
        Cast => match (a, result_ty) {
            (Constant::F32(v), F64) => Constant::F64(v as f64),
            (Constant::F64(v), F32) => Constant::F32(v as f32),
            (Constant::F32(v), _) => rebuild(opcode, result_ty, v as i64),
            (Constant::F64(v), _) => rebuild(opcode, result_ty, v as i64),
            (_, F32) => Constant::F32(a.as_i64() as f32),
            (_, F64) => Constant::F64(a.as_i64() as f64),
            _ => rebuild(opcode, result_ty, a.as_i64()),
        },
        _ => unreachable!(),
    }
}

fn fold_binary(opcode: Opcode, a: Constant, b: Constant) -> Option<Constant> {
    use Opcode::*;
    if a.ty().is_float() || b.ty().is_float() {
        return fold_binary_float(opcode, a, b);
    }
    let (x, y) = (a.as_i64(), b.as_i64());
    let result = match opcode {
        Add => x.wrapping_add(y),
        Sub => x.wrapping_sub(y),
        Mul => x.wrapping_mul(y),
        UMul => ((x as u64).wrapping_mul(y as u64)) as i64,
        Div => {
            if y == 0 {
                return None;
            }
            x.wrapping_div(y)
        }
        UDiv => {
            if y == 0 {
                return None;
            }
            ((x as u64) / (y as u64)) as i64
        }
        And => x & y,
        Or => x | y,
        Xor => x ^ y,
        Shl => x.wrapping_shl(y as u32),
        Ashr => x.wrapping_shr(y as u32),
        Lshr => ((x as u64).wrapping_shr(y as u32)) as i64,
        CmpEq => return Some(Constant::I8((x == y) as i8)),
        CmpNe => return Some(Constant::I8((x != y) as i8)),
        CmpSlt => return Some(Constant::I8((x < y) as i8)),
        CmpSle => return Some(Constant::I8((x <= y) as i8)),
        CmpSgt => return Some(Constant::I8((x > y) as i8)),
        CmpSge => return Some(Constant::I8((x >= y) as i8)),
        CmpUlt => return Some(Constant::I8(((x as u64) < (y as u64)) as i8)),
        CmpUle => return Some(Constant::I8(((x as u64) <= (y as u64)) as i8)),
        CmpUgt => return Some(Constant::I8(((x as u64) > (y as u64)) as i8)),
        CmpUge => return Some(Constant::I8(((x as u64) >= (y as u64)) as i8)),
        _ => return None,
    };
    Some(rebuild(opcode, a.ty(), result))
}

fn fold_binary_float(opcode: Opcode, a: Constant, b: Constant) -> Option<Constant> {
    use Opcode::*;
    let (x, y) = (a.as_f64(), b.as_f64());
    let cmp = match opcode {
        CmpEq => Some(x == y),
        CmpNe => Some(x != y),
        CmpSlt => Some(x < y),
        CmpSle => Some(x <= y),
        CmpSgt => Some(x > y),
        CmpSge => Some(x >= y),
        _ => None,
    };
    if let Some(result) = cmp {
        return Some(Constant::I8(result as i8));
    }
    let result = match opcode {
        Add => x + y,
        Sub => x - y,
        Mul => x * y,
        Div => x / y,
        _ => return None,
    };
    Some(match a.ty() {
        crate::ir::ValueType::F32 => Constant::F32(result as f32),
        _ => Constant::F64(result),
    })
}

fn fold_unary(opcode: Opcode, a: Constant) -> Option<Constant> {
    use Opcode::*;
    match opcode {
        Neg => Some(if a.ty().is_float() {
            match a {
                Constant::F32(v) => Constant::F32(-v),
                Constant::F64(v) => Constant::F64(-v),
                _ => unreachable!(),
            }
        } else {
            rebuild(opcode, a.ty(), a.as_i64().wrapping_neg())
        }),
        Not => Some(rebuild(opcode, a.ty(), !a.as_i64())),
        Sext | Zext | Truncate | Cast => None, // target type only known at the call site; see constant_prop_typed below
    }
}

fn rebuild(_opcode: Opcode, ty: crate::ir::ValueType, v: i64) -> Constant {
    use crate::ir::ValueType::*;
    match ty {
        I8 => Constant::I8(v as i8),
        I16 => Constant::I16(v as i16),
        I32 => Constant::I32(v as i32),
        I64 => Constant::I64(v),
        F32 => Constant::F32(f32::from_bits(v as u32)),
        F64 => Constant::F64(f64::from_bits(v as u64)),
        BlockRef => Constant::I64(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Builder;

    /// `add(3, 4)` then `mul(r, 10)` folds to a single constant `70` after
    /// constant propagation (DCE then removes whatever isn't finally
    /// consumed).
    #[test]
    fn add_then_mul_folds_to_seventy() {
        let mut b = Builder::new();
        let entry = b.block();
        let three = b.alloc_constant(Constant::I32(3));
        let four = b.alloc_constant(Constant::I32(4));
        let r = b.emit_add(three, four);
        let ten = b.alloc_constant(Constant::I32(10));
        let t = b.emit_mul(r, ten);
        b.emit_store_context(0, t);
        b.emit_branch(entry);

        run(&mut b);

        let remaining_arith = b.blocks[entry.0 as usize]
            .instrs
            .iter()
            .filter(|&&id| matches!(b.instr(id).opcode, Opcode::Add | Opcode::Mul))
            .count();
        assert_eq!(remaining_arith, 0);

        let stored = b.instr(b.blocks[entry.0 as usize].instrs[0]).args[0].unwrap();
        assert_eq!(b.value(stored).constant, Some(Constant::I32(70)));
    }

    #[test]
    fn select_with_constant_condition_picks_a_branch() {
        let mut b = Builder::new();
        let entry = b.block();
        let cond = b.alloc_constant(Constant::I8(1));
        let a = b.alloc_constant(Constant::I32(11));
        let c = b.alloc_constant(Constant::I32(22));
        let picked = b.emit_select(cond, a, c);
        b.emit_store_context(0, picked);
        b.emit_branch(entry);

        run(&mut b);
        let stored = b.instr(b.blocks[entry.0 as usize].instrs[0]).args[0].unwrap();
        assert_eq!(stored, a);
    }

    #[test]
    fn division_by_constant_zero_is_not_folded() {
        let mut b = Builder::new();
        let entry = b.block();
        let n = b.alloc_constant(Constant::I32(5));
        let zero = b.alloc_constant(Constant::I32(0));
        let _q = b.emit_div(n, zero);
        b.emit_branch(entry);

        run(&mut b);
        // The div must survive: folding it would require evaluating 5/0.
        assert!(b.blocks[entry.0 as usize].instrs.iter().any(|&id| b.instr(id).opcode == Opcode::Div));
    }
}
