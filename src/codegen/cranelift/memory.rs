//! Stack storage and memory instructions
//!
//! Every piece of memory the lowering engine owns is an explicit stack slot:
//! homes of aggregates and address-taken scalars, finally indicators, local
//! allocations and register-pair reconstruction buffers. Aggregate values
//! never travel as SSA values; their instructions become byte fills and
//! copies between homes.

use super::context::Home;
use super::lower::Lowerer;
use super::types::{mem_type, padded_size, stack_type, width_type, LoweredType};
use super::{CodegenError, CodegenResult};
use crate::ir::{AtomicOp, IntWidth, MemType, Op, SourceType, TypeId, Vreg};
use cranelift::prelude::{types as ctypes, InstBuilder, MemFlags, StackSlotData, StackSlotKind, Type, Value};
use cranelift_codegen::ir::{AtomicRmwOp, StackSlot};
use cranelift_module::Module;

impl<'a, 'f, M: Module> Lowerer<'a, 'f, M> {
    /// Explicit slot of at least `bytes`, padded to whole pointer words
    pub(crate) fn alloc_slot(&mut self, bytes: u32) -> StackSlot {
        let size = padded_size(bytes, self.ptr.bytes());
        self.builder
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size))
    }

    /// Fresh slot, returned as an address
    pub(crate) fn alloc_home(&mut self, bytes: u32) -> Value {
        let slot = self.alloc_slot(bytes);
        self.builder.ins().stack_addr(self.ptr, slot, 0)
    }

    pub(crate) fn zero_memory(&mut self, addr: Value, size: u32) {
        self.builder
            .emit_small_memset(self.frontend, addr, 0, u64::from(size), 1, MemFlags::new());
    }

    pub(crate) fn copy_memory(&mut self, dst: Value, src: Value, size: u32) {
        self.builder.emit_small_memory_copy(
            self.frontend,
            dst,
            src,
            u64::from(size),
            1,
            1,
            true,
            MemFlags::new(),
        );
    }

    /// `base + offset` as a pointer
    pub(crate) fn address_at(&mut self, base: Vreg, offset: i32) -> CodegenResult<Value> {
        let base = self.operand(base, self.ptr)?;
        Ok(if offset == 0 {
            base
        } else {
            self.builder.ins().iadd_imm(base, i64::from(offset))
        })
    }

    /// Destination storage of an aggregate definition. Declared variables
    /// keep their home; temporaries get a new one per definition.
    pub(crate) fn aggregate_home(&mut self, dst: Vreg, size: u32) -> Value {
        if self.method.variable(dst).is_some() {
            if let Some(Home::Address(addr)) = self.ctx.home(dst) {
                return addr;
            }
        }
        let addr = self.alloc_home(size);
        self.ctx.set_home(dst, Home::Address(addr));
        addr
    }

    /// Load of `ty`, widened to stack width
    fn load_widened(&mut self, ty: Type, zero_extend: bool, addr: Value, offset: i32) -> CodegenResult<Value> {
        let loaded = self.builder.ins().load(ty, MemFlags::new(), addr, offset);
        self.convert(loaded, stack_type(ty), zero_extend)
    }

    pub(crate) fn lower_memory(&mut self, op: &Op) -> CodegenResult<()> {
        match op {
            Op::Load { ty, dst, base, offset } => {
                let (mty, zext) = mem_type(*ty, self.ptr);
                let addr = self.operand(*base, self.ptr)?;
                let value = self.load_widened(mty, zext, addr, *offset)?;
                self.define(*dst, value)
            }
            Op::Store { ty, base, offset, src } => {
                let (mty, _) = mem_type(*ty, self.ptr);
                let addr = self.operand(*base, self.ptr)?;
                let value = self.operand(*src, mty)?;
                self.builder.ins().store(MemFlags::new(), value, addr, *offset);
                Ok(())
            }
            Op::StoreImm { ty, base, offset, value } => {
                if matches!(ty, MemType::R4 | MemType::R8) {
                    return Err(CodegenError::unsupported("floating point immediate store"));
                }
                let (mty, _) = mem_type(*ty, self.ptr);
                let addr = self.operand(*base, self.ptr)?;
                let imm = self.int_const(mty, *value);
                self.builder.ins().store(MemFlags::new(), imm, addr, *offset);
                Ok(())
            }
            Op::CheckThis { src } => {
                // A faulting load stands in for the null check
                let addr = self.operand(*src, self.ptr)?;
                self.builder.ins().load(ctypes::I8, MemFlags::new(), addr, 0);
                Ok(())
            }
            Op::LdAddr { dst, var } => {
                let addr = match self.ctx.home(*var) {
                    Some(Home::Slot { slot, .. }) => self.builder.ins().stack_addr(self.ptr, slot, 0),
                    Some(Home::Address(addr)) => addr,
                    None => {
                        return Err(CodegenError::invariant(format!(
                            "address of {} which has no storage",
                            var
                        )))
                    }
                };
                self.define(*dst, addr)
            }
            Op::Localloc { .. } => Err(CodegenError::unsupported("localloc with a dynamic size")),
            Op::LocallocImm { dst, size, zero } => {
                let addr = self.alloc_home(*size);
                if *zero {
                    self.zero_memory(addr, *size);
                }
                self.define(*dst, addr)
            }
            other => Err(CodegenError::InternalError(format!(
                "{} is not a memory instruction",
                other.name()
            ))),
        }
    }

    /// Lowered form of a value type named by an instruction
    fn value_type_of(&mut self, ty: TypeId) -> CodegenResult<LoweredType> {
        self.lower(&SourceType::ValueType(ty))
    }

    pub(crate) fn lower_aggregate(&mut self, op: &Op) -> CodegenResult<()> {
        match op {
            Op::VZero { dst, ty } => match self.value_type_of(*ty)? {
                LoweredType::Aggregate(layout) => {
                    let addr = self.aggregate_home(*dst, layout.size);
                    self.zero_memory(addr, layout.size);
                    Ok(())
                }
                LoweredType::Scalar(t) | LoweredType::Vector(t) => {
                    let zero = self.zero_value(t);
                    self.define(*dst, zero)
                }
                LoweredType::Void => Err(CodegenError::invariant(format!("vzero of void type {}", ty))),
            },
            Op::VMove { dst, src, ty } | Op::OutArgVt { dst, src, ty } => match self.value_type_of(*ty)? {
                LoweredType::Aggregate(layout) => {
                    let from = self.ctx.address(*src)?;
                    let to = self.aggregate_home(*dst, layout.size);
                    self.copy_memory(to, from, layout.size);
                    Ok(())
                }
                _ => {
                    let value = self.scalar(*src)?;
                    self.define(*dst, value)
                }
            },
            Op::LoadV { dst, base, offset, ty } => match self.value_type_of(*ty)? {
                LoweredType::Aggregate(layout) => {
                    let from = self.address_at(*base, *offset)?;
                    let to = self.aggregate_home(*dst, layout.size);
                    self.copy_memory(to, from, layout.size);
                    Ok(())
                }
                LoweredType::Scalar(t) | LoweredType::Vector(t) => {
                    let addr = self.operand(*base, self.ptr)?;
                    let unsigned = self.is_unsigned(*dst);
                    let value = self.load_widened(t, unsigned, addr, *offset)?;
                    self.define(*dst, value)
                }
                LoweredType::Void => Err(CodegenError::invariant(format!("loadv of void type {}", ty))),
            },
            Op::StoreV { base, offset, src, ty } => match self.value_type_of(*ty)? {
                LoweredType::Aggregate(layout) => {
                    let from = self.ctx.address(*src)?;
                    let to = self.address_at(*base, *offset)?;
                    self.copy_memory(to, from, layout.size);
                    Ok(())
                }
                LoweredType::Scalar(t) | LoweredType::Vector(t) => {
                    let addr = self.operand(*base, self.ptr)?;
                    let value = self.operand(*src, t)?;
                    self.builder.ins().store(MemFlags::new(), value, addr, *offset);
                    Ok(())
                }
                LoweredType::Void => Err(CodegenError::invariant(format!("storev of void type {}", ty))),
            },
            other => Err(CodegenError::InternalError(format!(
                "{} is not an aggregate instruction",
                other.name()
            ))),
        }
    }

    /// All-zero value of a scalar or vector type
    pub(crate) fn zero_value(&mut self, ty: Type) -> Value {
        if ty.is_vector() {
            let lane = self.zero_value(ty.lane_type());
            return self.builder.ins().splat(ty, lane);
        }
        match ty {
            ctypes::F32 => self.builder.ins().f32const(0.0),
            ctypes::F64 => self.builder.ins().f64const(0.0),
            int => self.builder.ins().iconst(int, 0),
        }
    }

    pub(crate) fn lower_atomic(&mut self, op: &Op) -> CodegenResult<()> {
        match op {
            Op::Atomic { op, width, dst, addr, value } => {
                let ty = self.atomic_type(*width);
                let addr = self.operand(*addr, self.ptr)?;
                let value = self.operand(*value, ty)?;
                let result = match op {
                    AtomicOp::Exchange => {
                        self.builder
                            .ins()
                            .atomic_rmw(ty, MemFlags::new(), AtomicRmwOp::Xchg, addr, value)
                    }
                    AtomicOp::Add => {
                        let old = self
                            .builder
                            .ins()
                            .atomic_rmw(ty, MemFlags::new(), AtomicRmwOp::Add, addr, value);
                        self.builder.ins().iadd(old, value)
                    }
                };
                self.define(*dst, result)
            }
            Op::AtomicCas { width, dst, addr, expected, new } => {
                let ty = self.atomic_type(*width);
                let addr = self.operand(*addr, self.ptr)?;
                let expected = self.operand(*expected, ty)?;
                let new = self.operand(*new, ty)?;
                let old = self.builder.ins().atomic_cas(MemFlags::new(), addr, expected, new);
                self.define(*dst, old)
            }
            Op::MemoryBarrier => {
                self.builder.ins().fence();
                Ok(())
            }
            other => Err(CodegenError::InternalError(format!(
                "{} is not an atomic instruction",
                other.name()
            ))),
        }
    }

    fn atomic_type(&self, width: IntWidth) -> Type {
        width_type(width, self.ptr)
    }
}
