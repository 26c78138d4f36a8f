//! Instruction lowering
//!
//! One `match` over [`Op`] drives every source instruction. Arithmetic works
//! on stack-width values (32-bit for sub-word integers, doubles for floats);
//! narrowing happens only at explicit conversions and stores.

use super::context::Home;
use super::lower::{Flow, Lowerer};
use super::types::{stack_type, width_type, LoweredType};
use super::{CodegenError, CodegenResult};
use crate::ir::{
    CheckedOp, CompareKind, CompareRhs, Cond, Conversion, CorlibException, FloatBinOp, IntBinOp,
    IntWidth, MinMaxOp, Op, Region, ReturnStorage, SourceType, TypeId, VectorOp, VectorShape, Vreg,
};
use cranelift::prelude::{
    types as ctypes, FloatCC, InstBuilder, IntCC, JumpTableData, MemFlags, TrapCode, Type, Value,
};
use cranelift_codegen::ir::BlockCall;
use cranelift_module::Module;

fn int_cc(cond: Cond) -> IntCC {
    match cond {
        Cond::Eq => IntCC::Equal,
        Cond::Ne => IntCC::NotEqual,
        Cond::Lt => IntCC::SignedLessThan,
        Cond::Le => IntCC::SignedLessThanOrEqual,
        Cond::Gt => IntCC::SignedGreaterThan,
        Cond::Ge => IntCC::SignedGreaterThanOrEqual,
        Cond::LtUn => IntCC::UnsignedLessThan,
        Cond::LeUn => IntCC::UnsignedLessThanOrEqual,
        Cond::GtUn => IntCC::UnsignedGreaterThan,
        Cond::GeUn => IntCC::UnsignedGreaterThanOrEqual,
    }
}

/// The `Un` forms are true on unordered operands
fn float_cc(cond: Cond) -> FloatCC {
    match cond {
        Cond::Eq => FloatCC::Equal,
        Cond::Ne => FloatCC::NotEqual,
        Cond::Lt => FloatCC::LessThan,
        Cond::Le => FloatCC::LessThanOrEqual,
        Cond::Gt => FloatCC::GreaterThan,
        Cond::Ge => FloatCC::GreaterThanOrEqual,
        Cond::LtUn => FloatCC::UnorderedOrLessThan,
        Cond::LeUn => FloatCC::UnorderedOrLessThanOrEqual,
        Cond::GtUn => FloatCC::UnorderedOrGreaterThan,
        Cond::GeUn => FloatCC::UnorderedOrGreaterThanOrEqual,
    }
}

impl<'a, 'f, M: Module> Lowerer<'a, 'f, M> {
    /// Lower `ops[index]`, possibly together with `ops[index + 1]`
    pub(crate) fn lower_op(&mut self, ops: &[Op], index: usize) -> CodegenResult<Flow> {
        self.ensure_lowering()?;
        let op = &ops[index];
        match op {
            Op::Nop | Op::Phi { .. } | Op::StartHandler => {}
            Op::IConst { dst, value } => {
                let value = self.builder.ins().iconst(ctypes::I32, i64::from(*value));
                self.define(*dst, value)?;
            }
            Op::I8Const { dst, value } => {
                let value = self.builder.ins().iconst(ctypes::I64, *value);
                self.define(*dst, value)?;
            }
            Op::R4Const { dst, value } => {
                let single = self.builder.ins().f32const(*value);
                let value = self.builder.ins().fpromote(ctypes::F64, single);
                self.define(*dst, value)?;
            }
            Op::R8Const { dst, value } => {
                let value = self.builder.ins().f64const(*value);
                self.define(*dst, value)?;
            }
            Op::Move { dst, src } => self.lower_move(*dst, *src)?,
            Op::FMove { dst, src } => {
                let mut value = self.operand(*src, ctypes::F64)?;
                if self.method.variable(*dst).map(|v| v.ty == SourceType::R4).unwrap_or(false) {
                    let single = self.builder.ins().fdemote(ctypes::F32, value);
                    value = self.builder.ins().fpromote(ctypes::F64, single);
                }
                self.define(*dst, value)?;
            }

            Op::IntBinary { op, width, dst, lhs, rhs } => {
                let ty = width_type(*width, self.ptr);
                let a = self.operand(*lhs, ty)?;
                let b = self.operand(*rhs, ty)?;
                let value = self.int_binary(*op, a, b);
                self.define(*dst, value)?;
            }
            Op::IntBinaryImm { op, width, dst, lhs, imm } => {
                let ty = width_type(*width, self.ptr);
                let a = self.operand(*lhs, ty)?;
                let b = self.int_const(ty, *imm);
                let value = self.int_binary(*op, a, b);
                self.define(*dst, value)?;
            }
            Op::FloatBinary { op, dst, lhs, rhs } => {
                let a = self.operand(*lhs, ctypes::F64)?;
                let b = self.operand(*rhs, ctypes::F64)?;
                let ins = self.builder.ins();
                let value = match op {
                    FloatBinOp::Add => ins.fadd(a, b),
                    FloatBinOp::Sub => ins.fsub(a, b),
                    FloatBinOp::Mul => ins.fmul(a, b),
                    FloatBinOp::Div => ins.fdiv(a, b),
                };
                self.define(*dst, value)?;
            }
            Op::CheckedBinary { op, width, unsigned, dst, lhs, rhs } => {
                let ty = width_type(*width, self.ptr);
                let a = self.operand(*lhs, ty)?;
                let b = self.operand(*rhs, ty)?;
                let (value, overflow) = self.checked_binary(*op, *unsigned, a, b);
                self.emit_cond_throw(overflow, CorlibException::OverflowException)?;
                self.define(*dst, value)?;
            }
            Op::Neg { width, dst, src } => {
                let value = self.operand(*src, width_type(*width, self.ptr))?;
                let value = self.builder.ins().ineg(value);
                self.define(*dst, value)?;
            }
            Op::Not { width, dst, src } => {
                let value = self.operand(*src, width_type(*width, self.ptr))?;
                let value = self.builder.ins().bnot(value);
                self.define(*dst, value)?;
            }
            Op::FNeg { dst, src } => {
                let value = self.operand(*src, ctypes::F64)?;
                let value = self.builder.ins().fneg(value);
                self.define(*dst, value)?;
            }
            Op::FAbs { dst, src } => {
                let value = self.operand(*src, ctypes::F64)?;
                let value = self.builder.ins().fabs(value);
                self.define(*dst, value)?;
            }
            Op::MinMax { op, width, dst, lhs, rhs } => {
                let ty = width_type(*width, self.ptr);
                let a = self.operand(*lhs, ty)?;
                let b = self.operand(*rhs, ty)?;
                let cc = match op {
                    MinMaxOp::Min => IntCC::SignedLessThan,
                    MinMaxOp::MinUn => IntCC::UnsignedLessThan,
                    MinMaxOp::Max => IntCC::SignedGreaterThan,
                    MinMaxOp::MaxUn => IntCC::UnsignedGreaterThan,
                };
                let pick_a = self.builder.ins().icmp(cc, a, b);
                let value = self.builder.ins().select(pick_a, a, b);
                self.define(*dst, value)?;
            }
            Op::Convert { conv, dst, src } => {
                let value = self.lower_conversion(*conv, *src)?;
                self.define(*dst, value)?;
            }

            Op::Compare { kind, lhs, rhs } => return self.lower_compare(*kind, *lhs, *rhs, ops.get(index + 1)),
            Op::CondBranch { .. } | Op::SetCond { .. } | Op::CondThrow { .. } => {
                return Err(CodegenError::invariant(format!(
                    "{} without a preceding compare",
                    op.name()
                )))
            }
            Op::FloatSetCond { cond, dst, lhs, rhs } => {
                let a = self.operand(*lhs, ctypes::F64)?;
                let b = self.operand(*rhs, ctypes::F64)?;
                let flag = self.builder.ins().fcmp(float_cc(*cond), a, b);
                let value = self.builder.ins().uextend(ctypes::I32, flag);
                self.define(*dst, value)?;
            }

            Op::Br { target } => {
                let target = self.ctx.primary(*target)?;
                self.builder.ins().jump(target, &[]);
                return Ok(Flow::Terminated);
            }
            Op::Switch { src, targets } => {
                self.lower_switch(*src, targets)?;
                return Ok(Flow::Terminated);
            }
            Op::SetRet { src } => {
                self.lower_set_ret(*src)?;
                return Ok(Flow::Terminated);
            }
            Op::NotReached => {
                self.builder.ins().trap(TrapCode::UnreachableCodeReached);
                return Ok(Flow::Terminated);
            }

            Op::Load { .. }
            | Op::Store { .. }
            | Op::StoreImm { .. }
            | Op::CheckThis { .. }
            | Op::LdAddr { .. }
            | Op::Localloc { .. }
            | Op::LocallocImm { .. } => self.lower_memory(op)?,

            Op::Call { dst, callee, signature, call_info, args } => {
                return self.lower_call(*dst, callee, signature, call_info, args)
            }
            Op::Throw { src } => {
                let exception = self.operand(*src, self.ptr)?;
                return self.lower_throw(exception);
            }
            Op::CallHandler { target } => return self.lower_call_handler(*target),
            Op::EndFinally => return self.lower_end_finally(),
            Op::ImplicitException => {
                let region = self.method.block(self.current).map(|b| b.region).unwrap_or_default();
                if region != Region::None {
                    return Err(CodegenError::unsupported("implicit exception inside an exception region"));
                }
            }

            Op::VZero { .. } | Op::VMove { .. } | Op::LoadV { .. } | Op::StoreV { .. } | Op::OutArgVt { .. } => {
                self.lower_aggregate(op)?
            }

            Op::XZero { dst, ty } => {
                let (vty, _) = self.vector_of(*ty)?;
                let value = self.zero_value(vty);
                self.define(*dst, value)?;
            }
            Op::LoadX { dst, base, offset, ty } => {
                let (vty, _) = self.vector_of(*ty)?;
                let addr = self.operand(*base, self.ptr)?;
                let value = self.builder.ins().load(vty, MemFlags::new(), addr, *offset);
                self.define(*dst, value)?;
            }
            Op::VectorBinary { op, ty, dst, lhs, rhs } => {
                let (vty, shape) = self.vector_of(*ty)?;
                let a = self.operand(*lhs, vty)?;
                let b = self.operand(*rhs, vty)?;
                let value = self.vector_binary(*op, shape, a, b)?;
                self.define(*dst, value)?;
            }
            Op::ExtractLane { dst, src, ty, lane } => {
                let (vty, shape) = self.vector_of(*ty)?;
                if *lane >= shape.lane_count() {
                    return Err(CodegenError::invariant(format!(
                        "lane {} of a {}-lane vector",
                        lane,
                        shape.lane_count()
                    )));
                }
                let vector = self.operand(*src, vty)?;
                let element = self.builder.ins().extractlane(vector, *lane);
                let value = self.convert(element, stack_type(vty.lane_type()), shape.is_unsigned())?;
                self.define(*dst, value)?;
            }

            Op::Atomic { .. } | Op::AtomicCas { .. } | Op::MemoryBarrier => self.lower_atomic(op)?,

            Op::AotConst { dst, symbol } => {
                if !self.tables.is_aot() {
                    return Err(CodegenError::unsupported(format!(
                        "aot constant {} outside an ahead-of-time module",
                        symbol
                    )));
                }
                let data = self.tables.import_data(self.module, symbol)?;
                let global = self.module.declare_data_in_func(data, self.builder.func);
                let addr = self.builder.ins().global_value(self.ptr, global);
                let value = self.builder.ins().load(self.ptr, MemFlags::new(), addr, 0);
                self.define(*dst, value)?;
            }
        }
        Ok(Flow::Next)
    }

    fn lower_move(&mut self, dst: Vreg, src: Vreg) -> CodegenResult<()> {
        let method = self.method;
        if let Some(Home::Address(from)) = self.ctx.home(src) {
            match (self.ctx.home(dst), method.variable(dst)) {
                (Some(Home::Address(to)), Some(var)) => {
                    if let LoweredType::Aggregate(layout) = self.lower(&var.ty)? {
                        self.copy_memory(to, from, layout.size);
                        return Ok(());
                    }
                }
                _ => {
                    self.ctx.set_home(dst, Home::Address(from));
                    return Ok(());
                }
            }
        }
        let value = self.scalar(src)?;
        self.define(dst, value)
    }

    fn int_binary(&mut self, op: IntBinOp, a: Value, b: Value) -> Value {
        let ins = self.builder.ins();
        match op {
            IntBinOp::Add => ins.iadd(a, b),
            IntBinOp::Sub => ins.isub(a, b),
            IntBinOp::Mul => ins.imul(a, b),
            IntBinOp::Div => ins.sdiv(a, b),
            IntBinOp::DivUn => ins.udiv(a, b),
            IntBinOp::Rem => ins.srem(a, b),
            IntBinOp::RemUn => ins.urem(a, b),
            IntBinOp::And => ins.band(a, b),
            IntBinOp::Or => ins.bor(a, b),
            IntBinOp::Xor => ins.bxor(a, b),
            IntBinOp::Shl => ins.ishl(a, b),
            IntBinOp::Shr => ins.sshr(a, b),
            IntBinOp::ShrUn => ins.ushr(a, b),
        }
    }

    /// Result and overflow flag of a checked operation
    fn checked_binary(&mut self, op: CheckedOp, unsigned: bool, a: Value, b: Value) -> (Value, Value) {
        let bits = self.builder.func.dfg.value_type(a).bits();
        let ins = self.builder.ins();
        match (op, unsigned) {
            (CheckedOp::Add, false) => {
                let sum = ins.iadd(a, b);
                let sa = self.builder.ins().bxor(a, sum);
                let sb = self.builder.ins().bxor(b, sum);
                let both = self.builder.ins().band(sa, sb);
                let flag = self.builder.ins().icmp_imm(IntCC::SignedLessThan, both, 0);
                (sum, flag)
            }
            (CheckedOp::Add, true) => {
                let sum = ins.iadd(a, b);
                let flag = self.builder.ins().icmp(IntCC::UnsignedLessThan, sum, a);
                (sum, flag)
            }
            (CheckedOp::Sub, false) => {
                let diff = ins.isub(a, b);
                let operands = self.builder.ins().bxor(a, b);
                let result = self.builder.ins().bxor(a, diff);
                let both = self.builder.ins().band(operands, result);
                let flag = self.builder.ins().icmp_imm(IntCC::SignedLessThan, both, 0);
                (diff, flag)
            }
            (CheckedOp::Sub, true) => {
                let diff = ins.isub(a, b);
                let flag = self.builder.ins().icmp(IntCC::UnsignedLessThan, a, b);
                (diff, flag)
            }
            (CheckedOp::Mul, false) => {
                let product = ins.imul(a, b);
                let high = self.builder.ins().smulhi(a, b);
                let sign = self.builder.ins().sshr_imm(product, i64::from(bits - 1));
                let flag = self.builder.ins().icmp(IntCC::NotEqual, high, sign);
                (product, flag)
            }
            (CheckedOp::Mul, true) => {
                let product = ins.imul(a, b);
                let high = self.builder.ins().umulhi(a, b);
                let flag = self.builder.ins().icmp_imm(IntCC::NotEqual, high, 0);
                (product, flag)
            }
        }
    }

    /// Narrow to `narrow` and re-extend to 32 bits
    fn narrow_to_stack(&mut self, value: Value, narrow: Type, unsigned: bool) -> CodegenResult<Value> {
        let narrowed = self.convert(value, narrow, unsigned)?;
        self.convert(narrowed, ctypes::I32, unsigned)
    }

    fn lower_conversion(&mut self, conv: Conversion, src: Vreg) -> CodegenResult<Value> {
        use Conversion::*;
        let value = match conv {
            ToI1 | ToU1 | ToI2 | ToU2 => {
                let value = self.scalar(src)?;
                let narrow = if matches!(conv, ToI1 | ToU1) { ctypes::I8 } else { ctypes::I16 };
                self.narrow_to_stack(value, narrow, matches!(conv, ToU1 | ToU2))?
            }
            ToI4 | ToU4 => {
                let value = self.scalar(src)?;
                self.convert(value, ctypes::I32, conv == ToU4)?
            }
            ToI8 | ToU8 => {
                let value = self.scalar(src)?;
                self.convert(value, ctypes::I64, conv == ToU8)?
            }
            FloatToI1 | FloatToU1 | FloatToI2 | FloatToU2 => {
                let value = self.operand(src, ctypes::F64)?;
                let unsigned = matches!(conv, FloatToU1 | FloatToU2);
                let int = if unsigned {
                    self.builder.ins().fcvt_to_uint_sat(ctypes::I32, value)
                } else {
                    self.builder.ins().fcvt_to_sint_sat(ctypes::I32, value)
                };
                let narrow = if matches!(conv, FloatToI1 | FloatToU1) { ctypes::I8 } else { ctypes::I16 };
                self.narrow_to_stack(int, narrow, unsigned)?
            }
            FloatToI4 | FloatToU4 | FloatToI8 | FloatToU8 | FloatToI => {
                let value = self.operand(src, ctypes::F64)?;
                let ty = match conv {
                    FloatToI4 | FloatToU4 => ctypes::I32,
                    FloatToI8 | FloatToU8 => ctypes::I64,
                    _ => self.ptr,
                };
                if matches!(conv, FloatToU4 | FloatToU8) {
                    self.builder.ins().fcvt_to_uint_sat(ty, value)
                } else {
                    self.builder.ins().fcvt_to_sint_sat(ty, value)
                }
            }
            IntToR8 | LongToR8 | LongToR8Un => {
                let from = if conv == IntToR8 { ctypes::I32 } else { ctypes::I64 };
                let value = self.operand(src, from)?;
                if conv == LongToR8Un {
                    self.builder.ins().fcvt_from_uint(ctypes::F64, value)
                } else {
                    self.builder.ins().fcvt_from_sint(ctypes::F64, value)
                }
            }
            IntToR4 | LongToR4 => {
                let from = if conv == IntToR4 { ctypes::I32 } else { ctypes::I64 };
                let value = self.operand(src, from)?;
                let single = self.builder.ins().fcvt_from_sint(ctypes::F32, value);
                self.builder.ins().fpromote(ctypes::F64, single)
            }
            FloatToR4 => {
                let value = self.operand(src, ctypes::F64)?;
                let single = self.builder.ins().fdemote(ctypes::F32, value);
                self.builder.ins().fpromote(ctypes::F64, single)
            }
            SextI4 | ZextI4 => {
                let value = self.operand(src, ctypes::I32)?;
                if conv == ZextI4 {
                    self.builder.ins().uextend(ctypes::I64, value)
                } else {
                    self.builder.ins().sextend(ctypes::I64, value)
                }
            }
            TruncI4 => self.operand(src, ctypes::I32)?,
        };
        Ok(value)
    }

    fn compare_value(&mut self, kind: CompareKind, lhs: Vreg, rhs: CompareRhs, cond: Cond) -> CodegenResult<Value> {
        if kind == CompareKind::Float {
            let a = self.operand(lhs, ctypes::F64)?;
            let b = match rhs {
                CompareRhs::Reg(r) => self.operand(r, ctypes::F64)?,
                CompareRhs::Imm(_) => {
                    return Err(CodegenError::invariant("float compare against an integer immediate"))
                }
            };
            return Ok(self.builder.ins().fcmp(float_cc(cond), a, b));
        }
        let ty = match kind {
            CompareKind::I32 => ctypes::I32,
            CompareKind::I64 => ctypes::I64,
            _ => width_type(IntWidth::Native, self.ptr),
        };
        let a = self.operand(lhs, ty)?;
        let b = match rhs {
            CompareRhs::Reg(r) => self.operand(r, ty)?,
            CompareRhs::Imm(imm) => self.int_const(ty, imm),
        };
        Ok(self.builder.ins().icmp(int_cc(cond), a, b))
    }

    /// A compare is lowered together with the instruction consuming it
    fn lower_compare(&mut self, kind: CompareKind, lhs: Vreg, rhs: CompareRhs, next: Option<&Op>) -> CodegenResult<Flow> {
        match next {
            Some(Op::CondBranch { cond, if_true, if_false }) => {
                let flag = self.compare_value(kind, lhs, rhs, *cond)?;
                let then_block = self.ctx.primary(*if_true)?;
                let else_block = self.ctx.primary(*if_false)?;
                self.builder.ins().brif(flag, then_block, &[], else_block, &[]);
                Ok(Flow::Terminated)
            }
            Some(Op::SetCond { cond, dst }) => {
                let flag = self.compare_value(kind, lhs, rhs, *cond)?;
                let value = self.builder.ins().uextend(ctypes::I32, flag);
                self.define(*dst, value)?;
                Ok(Flow::Fused)
            }
            Some(Op::CondThrow { cond, exception }) => {
                let flag = self.compare_value(kind, lhs, rhs, *cond)?;
                self.emit_cond_throw(flag, *exception)?;
                Ok(Flow::Fused)
            }
            // No consumer: the comparison has no observable result
            _ => Ok(Flow::Next),
        }
    }

    fn lower_switch(&mut self, src: Vreg, targets: &[crate::ir::BlockId]) -> CodegenResult<()> {
        let index = self.operand(src, ctypes::I32)?;
        let blocks = targets
            .iter()
            .map(|t| self.ctx.primary(*t))
            .collect::<CodegenResult<Vec<_>>>()?;
        let fallback = self.builder.create_block();

        let pool = &mut self.builder.func.dfg.value_lists;
        let default = BlockCall::new(fallback, &[], pool);
        let entries: Vec<BlockCall> = blocks.iter().map(|b| BlockCall::new(*b, &[], pool)).collect();
        let table = self.builder.create_jump_table(JumpTableData::new(default, &entries));
        self.builder.ins().br_table(index, table);

        self.builder.switch_to_block(fallback);
        self.builder.set_cold_block(fallback);
        self.builder.ins().trap(TrapCode::UnreachableCodeReached);
        Ok(())
    }

    fn lower_set_ret(&mut self, src: Option<Vreg>) -> CodegenResult<()> {
        let method = self.method;
        let required = |src: Option<Vreg>| {
            src.ok_or_else(|| CodegenError::invariant(format!("{} returns without a value", method.name)))
        };
        match method.call_info.ret {
            ReturnStorage::None => {
                self.builder.ins().return_(&[]);
            }
            ReturnStorage::Register | ReturnStorage::FloatRegister => {
                let src = required(src)?;
                let ty = self
                    .builder
                    .func
                    .signature
                    .returns
                    .first()
                    .map(|p| p.value_type)
                    .ok_or_else(|| CodegenError::invariant("register return without a return type"))?;
                let value = self.operand(src, ty)?;
                self.builder.ins().return_(&[value]);
            }
            ReturnStorage::RegisterPair { lanes } => {
                let src = required(src)?;
                let values = match self.lower(&method.signature.ret)? {
                    LoweredType::Aggregate(layout) => {
                        let addr = self.ctx.address(src)?;
                        self.pack_lanes(addr, layout.size, lanes)
                    }
                    LoweredType::Vector(_) => {
                        let vector = self.scalar(src)?;
                        self.pack_vector(vector, lanes)?
                    }
                    other => {
                        return Err(CodegenError::invariant(format!(
                            "{:?} returned in register lanes",
                            other
                        )))
                    }
                };
                self.builder.ins().return_(&values);
            }
            ReturnStorage::HiddenPointer => {
                let src = required(src)?;
                let LoweredType::Aggregate(layout) = self.lower(&method.signature.ret)? else {
                    return Err(CodegenError::invariant("hidden-pointer return of a non-aggregate"));
                };
                let dst = self
                    .ctx
                    .vret
                    .ok_or_else(|| CodegenError::invariant("hidden return buffer is missing"))?;
                let from = self.ctx.address(src)?;
                self.copy_memory(dst, from, layout.size);
                self.builder.ins().return_(&[]);
            }
        }
        Ok(())
    }

    fn vector_of(&mut self, ty: TypeId) -> CodegenResult<(Type, VectorShape)> {
        match (self.types.vector_shape(ty), self.lower(&SourceType::ValueType(ty))?) {
            (Some(shape), LoweredType::Vector(vty)) => Ok((vty, shape)),
            _ => Err(CodegenError::unsupported(format!(
                "{} is not a short vector type",
                self.types.type_name(ty)
            ))),
        }
    }

    fn vector_binary(&mut self, op: VectorOp, shape: VectorShape, a: Value, b: Value) -> CodegenResult<Value> {
        let ins = self.builder.ins();
        let value = match (op, shape.is_float()) {
            (VectorOp::Add, true) => ins.fadd(a, b),
            (VectorOp::Sub, true) => ins.fsub(a, b),
            (VectorOp::Mul, true) => ins.fmul(a, b),
            (VectorOp::Div, true) => ins.fdiv(a, b),
            (VectorOp::Add, false) => ins.iadd(a, b),
            (VectorOp::Sub, false) => ins.isub(a, b),
            (VectorOp::Mul, false) => ins.imul(a, b),
            (VectorOp::Div, false) => return Err(CodegenError::unsupported("integer vector division")),
            (VectorOp::And, _) => ins.band(a, b),
            (VectorOp::Or, _) => ins.bor(a, b),
            (VectorOp::Xor, _) => ins.bxor(a, b),
        };
        Ok(value)
    }
}
