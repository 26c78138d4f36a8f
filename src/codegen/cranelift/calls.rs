//! Calls and parameter reception
//!
//! Arguments are marshaled per their placement: scalars convert to the
//! parameter type, register-pair aggregates are split into lanes, by-value
//! aggregates pass their home annotated for a callee copy, and by-reference
//! aggregates are copied into a fresh slot whose address is passed. Results
//! come back the same way in reverse; a hidden-pointer result is written by
//! the callee straight into the destination's home.

use super::abi;
use super::context::Home;
use super::lower::{Flow, Lowerer};
use super::types::{stack_type, LoweredType};
use super::{CodegenError, CodegenResult};
use crate::ir::{ArgStorage, CallInfo, Callee, MethodSignature, ReturnStorage, Vreg};
use cranelift::prelude::{Block, InstBuilder, MemFlags, Value};
use cranelift_module::Module;

impl<'a, 'f, M: Module> Lowerer<'a, 'f, M> {
    /// Bind the incoming parameters of `entry` to the method's registers
    pub(crate) fn unpack_params(&mut self, entry: Block) -> CodegenResult<()> {
        let method = self.method;
        let params = self.builder.block_params(entry).to_vec();
        let mut params = params.into_iter();

        if method.call_info.uses_hidden_return() {
            let vret = params
                .next()
                .ok_or_else(|| CodegenError::invariant("hidden return parameter is missing"))?;
            self.ctx.vret = Some(vret);
            if let Some(vreg) = method.vret_addr {
                self.define(vreg, vret)?;
            }
        }

        let arg_types = method.signature.arg_types();
        if arg_types.len() != method.args.len() {
            return Err(CodegenError::invariant(format!(
                "{} declares {} arguments but binds {} registers",
                method.name,
                arg_types.len(),
                method.args.len()
            )));
        }
        for ((vreg, ty), storage) in method.args.iter().zip(&arg_types).zip(&method.call_info.args) {
            let lowered = self.lower(ty)?;
            let mut next = || {
                params
                    .next()
                    .ok_or_else(|| CodegenError::invariant(format!("no parameter left for {}", vreg)))
            };
            match (storage, lowered) {
                (ArgStorage::Register | ArgStorage::FloatRegister, LoweredType::Scalar(t)) => {
                    let value = next()?;
                    let value = self.convert(value, stack_type(t), ty.is_unsigned())?;
                    self.define(*vreg, value)?;
                }
                (ArgStorage::Register | ArgStorage::FloatRegister, LoweredType::Vector(_)) => {
                    let value = next()?;
                    self.define(*vreg, value)?;
                }
                (ArgStorage::RegisterPair { lanes }, LoweredType::Aggregate(layout)) => {
                    let values = (0..abi::lane_layout(layout.size, *lanes, self.ptr).len())
                        .map(|_| next())
                        .collect::<CodegenResult<Vec<_>>>()?;
                    let home = self.aggregate_home(*vreg, layout.size);
                    self.unpack_lanes(&values, home, layout.size, *lanes)?;
                }
                (ArgStorage::RegisterPair { lanes }, LoweredType::Vector(t)) => {
                    let values = [next()?, next()?];
                    let value = self.unpack_vector(&values, t, *lanes)?;
                    self.define(*vreg, value)?;
                }
                (ArgStorage::ByValue | ArgStorage::ByReference, LoweredType::Aggregate(_)) => {
                    let addr = next()?;
                    self.ctx.set_home(*vreg, Home::Address(addr));
                }
                (storage, lowered) => {
                    return Err(CodegenError::invariant(format!(
                        "parameter {} ({:?}) cannot arrive as {:?}",
                        vreg, lowered, storage
                    )))
                }
            }
        }
        Ok(())
    }

    fn call_arguments(&mut self, sig: &MethodSignature, info: &CallInfo, args: &[Vreg]) -> CodegenResult<Vec<Value>> {
        let arg_types = sig.arg_types();
        if args.len() != arg_types.len() || args.len() != info.args.len() {
            return Err(CodegenError::invariant(format!(
                "call passes {} arguments to a signature of {}",
                args.len(),
                arg_types.len()
            )));
        }

        let mut values = Vec::with_capacity(args.len());
        for ((arg, ty), storage) in args.iter().zip(&arg_types).zip(&info.args) {
            match (storage, self.lower(ty)?) {
                (ArgStorage::Register | ArgStorage::FloatRegister, LoweredType::Scalar(t)) => {
                    values.push(self.operand(*arg, super::types::arg_type(t))?);
                }
                (ArgStorage::Register | ArgStorage::FloatRegister, LoweredType::Vector(t)) => {
                    values.push(self.operand(*arg, t)?);
                }
                (ArgStorage::RegisterPair { lanes }, LoweredType::Aggregate(layout)) => {
                    let addr = self.ctx.address(*arg)?;
                    values.extend(self.pack_lanes(addr, layout.size, *lanes));
                }
                (ArgStorage::RegisterPair { lanes }, LoweredType::Vector(_)) => {
                    let vector = self.scalar(*arg)?;
                    values.extend(self.pack_vector(vector, *lanes)?);
                }
                (ArgStorage::ByValue, LoweredType::Aggregate(_)) => {
                    values.push(self.ctx.address(*arg)?);
                }
                (ArgStorage::ByReference, LoweredType::Aggregate(layout)) => {
                    let src = self.ctx.address(*arg)?;
                    let copy = self.alloc_home(layout.size);
                    self.copy_memory(copy, src, layout.size);
                    values.push(copy);
                }
                (storage, lowered) => {
                    return Err(CodegenError::invariant(format!(
                        "argument {} ({:?}) cannot be passed as {:?}",
                        arg, lowered, storage
                    )))
                }
            }
        }
        Ok(values)
    }

    pub(crate) fn lower_call(
        &mut self,
        dst: Option<Vreg>,
        callee: &Callee,
        sig: &MethodSignature,
        info: &CallInfo,
        args: &[Vreg],
    ) -> CodegenResult<Flow> {
        if sig.varargs {
            return Err(CodegenError::unsupported("variadic call"));
        }
        let signature = abi::build_signature(
            sig,
            info,
            self.types,
            &mut self.tables.type_cache,
            self.ptr,
            self.call_conv,
        )?;
        let ret = self.lower(&sig.ret)?;

        let mut values = Vec::with_capacity(signature.params.len());
        let mut ret_home = None;
        if info.uses_hidden_return() {
            let LoweredType::Aggregate(layout) = ret else {
                return Err(CodegenError::invariant("hidden-pointer return of a non-aggregate"));
            };
            let home = match dst {
                Some(dst) => self.aggregate_home(dst, layout.size),
                None => self.alloc_home(layout.size),
            };
            values.push(home);
            ret_home = Some(home);
        }
        values.extend(self.call_arguments(sig, info, args)?);

        let call = match callee {
            Callee::Direct { symbol } => {
                let id = if *symbol == self.method.name {
                    self.tables.declare_self(self.module, symbol, &signature)?
                } else {
                    self.tables.import_function(self.module, symbol, &signature)?
                };
                let func = self.module.declare_func_in_func(id, self.builder.func);
                self.builder.ins().call(func, &values)
            }
            Callee::Virtual { interface: true, .. } => {
                return Err(CodegenError::unsupported("interface call through the IMT"));
            }
            Callee::Virtual { base, slot_offset, .. } => {
                let object = self.operand(*base, self.ptr)?;
                let vtable = self.builder.ins().load(self.ptr, MemFlags::new(), object, 0);
                let target = self.builder.ins().load(self.ptr, MemFlags::new(), vtable, *slot_offset);
                let sig_ref = self.builder.import_signature(signature);
                self.builder.ins().call_indirect(sig_ref, target, &values)
            }
            Callee::Indirect { target } => {
                let target = self.operand(*target, self.ptr)?;
                let sig_ref = self.builder.import_signature(signature);
                self.builder.ins().call_indirect(sig_ref, target, &values)
            }
        };
        let results = self.builder.inst_results(call).to_vec();

        self.emit_exception_check()?;

        let Some(dst) = dst else {
            return Ok(Flow::Next);
        };
        match (info.ret, ret) {
            (ReturnStorage::None, _) => {
                return Err(CodegenError::invariant(format!("{} receives the result of a void call", dst)))
            }
            (ReturnStorage::Register | ReturnStorage::FloatRegister, LoweredType::Scalar(t)) => {
                let value = self.first_result(&results)?;
                let value = self.convert(value, stack_type(t), sig.ret.is_unsigned())?;
                self.define(dst, value)?;
            }
            (ReturnStorage::Register | ReturnStorage::FloatRegister, LoweredType::Vector(_)) => {
                let value = self.first_result(&results)?;
                self.define(dst, value)?;
            }
            (ReturnStorage::RegisterPair { lanes }, LoweredType::Aggregate(layout)) => {
                let home = self.aggregate_home(dst, layout.size);
                self.unpack_lanes(&results, home, layout.size, lanes)?;
            }
            (ReturnStorage::RegisterPair { lanes }, LoweredType::Vector(t)) => {
                let value = self.unpack_vector(&results, t, lanes)?;
                self.define(dst, value)?;
            }
            (ReturnStorage::HiddenPointer, _) => {
                if ret_home.is_none() {
                    return Err(CodegenError::InternalError("hidden return buffer was not allocated".into()));
                }
            }
            (storage, lowered) => {
                return Err(CodegenError::invariant(format!(
                    "result {:?} cannot come back as {:?}",
                    lowered, storage
                )))
            }
        }
        Ok(Flow::Next)
    }

    fn first_result(&self, results: &[Value]) -> CodegenResult<Value> {
        results
            .first()
            .copied()
            .ok_or_else(|| CodegenError::invariant("call produced no result"))
    }
}
