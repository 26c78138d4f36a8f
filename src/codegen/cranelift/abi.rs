//! Calling-convention marshaling
//!
//! Placement decisions come from [`CallInfo`]; this module turns them into
//! Cranelift signatures and moves aggregates between memory and
//! pointer-width register lanes. Lane `j` of an aggregate covers the bytes at
//! offset `j * ptr`, zero-extended to pointer width in the register. Memory is
//! only touched within the aggregate: a lane whose remaining size is not a
//! power of two is moved as several smaller pieces. Short vectors are split by
//! element index instead of by address.

use super::lower::Lowerer;
use super::types::{arg_type, lower_type, LoweredType, TypeCache};
use super::{CodegenError, CodegenResult};
use crate::ir::{ArgStorage, CallInfo, LaneStorage, MethodSignature, ReturnStorage, TypeQueries};
use cranelift::prelude::{types as ctypes, AbiParam, InstBuilder, MemFlags, Signature, Type, Value};
use cranelift_codegen::ir::{ArgumentPurpose, Endianness};
use cranelift_codegen::isa::CallConv;
use cranelift_module::Module;

/// Offset and access type of every used lane
pub(crate) fn lane_layout(size: u32, lanes: [LaneStorage; 2], ptr: Type) -> Vec<(i32, Type)> {
    let ptr_bytes = ptr.bytes();
    lanes
        .iter()
        .enumerate()
        .filter(|(_, lane)| lane.is_used())
        .map(|(j, _)| {
            let offset = j as u32 * ptr_bytes;
            let remaining = size.saturating_sub(offset).clamp(1, ptr_bytes);
            let width = remaining.next_power_of_two();
            (offset as i32, Type::int((width * 8) as u16).unwrap_or(ptr))
        })
        .collect()
}

/// Pieces covering the `size` bytes of one lane: offset within the lane and
/// access type, widest first
pub(crate) fn lane_pieces(size: u32) -> Vec<(u32, Type)> {
    let mut pieces = Vec::new();
    let mut offset = 0;
    for width in [8u32, 4, 2, 1] {
        if size - offset >= width {
            pieces.push((offset, Type::int((width * 8) as u16).unwrap_or(ctypes::I8)));
            offset += width;
        }
    }
    pieces
}

/// Bytes of the aggregate lane `offset` covers
fn lane_bytes(size: u32, offset: i32, ptr: Type) -> u32 {
    size.saturating_sub(offset as u32).clamp(1, ptr.bytes())
}

fn used_lanes(lanes: [LaneStorage; 2]) -> usize {
    lanes.iter().filter(|l| l.is_used()).count()
}

/// Cranelift signature for a source signature and its placement
pub(crate) fn build_signature(
    sig: &MethodSignature,
    info: &CallInfo,
    types: &dyn TypeQueries,
    cache: &mut TypeCache,
    ptr: Type,
    call_conv: CallConv,
) -> CodegenResult<Signature> {
    if sig.varargs {
        return Err(CodegenError::unsupported("variadic signature"));
    }
    let arg_types = sig.arg_types();
    if arg_types.len() != info.args.len() {
        return Err(CodegenError::invariant(format!(
            "{} arguments but {} placements",
            arg_types.len(),
            info.args.len()
        )));
    }

    let mut signature = Signature::new(call_conv);
    let ret = lower_type(&sig.ret, types, cache, ptr)?;
    match info.ret {
        ReturnStorage::None => {}
        ReturnStorage::Register | ReturnStorage::FloatRegister => match ret {
            LoweredType::Scalar(ty) => signature.returns.push(AbiParam::new(arg_type(ty))),
            LoweredType::Vector(ty) => signature.returns.push(AbiParam::new(ty)),
            other => {
                return Err(CodegenError::invariant(format!(
                    "{:?} return classified as a register",
                    other
                )))
            }
        },
        ReturnStorage::RegisterPair { lanes } => {
            for _ in 0..used_lanes(lanes) {
                signature.returns.push(AbiParam::new(ptr));
            }
        }
        ReturnStorage::HiddenPointer => signature.params.push(AbiParam::new(ptr)),
    }

    for (ty, storage) in arg_types.iter().zip(&info.args) {
        let lowered = lower_type(ty, types, cache, ptr)?;
        match (storage, lowered) {
            (ArgStorage::Register | ArgStorage::FloatRegister, LoweredType::Scalar(t)) => {
                signature.params.push(AbiParam::new(arg_type(t)))
            }
            (ArgStorage::Register | ArgStorage::FloatRegister, LoweredType::Vector(t)) => {
                signature.params.push(AbiParam::new(t))
            }
            (ArgStorage::RegisterPair { lanes }, LoweredType::Aggregate(_) | LoweredType::Vector(_)) => {
                for _ in 0..used_lanes(*lanes) {
                    signature.params.push(AbiParam::new(ptr));
                }
            }
            (ArgStorage::ByValue, LoweredType::Aggregate(layout)) => signature
                .params
                .push(AbiParam::special(ptr, ArgumentPurpose::StructArgument(layout.size))),
            (ArgStorage::ByReference, LoweredType::Aggregate(_)) => signature.params.push(AbiParam::new(ptr)),
            (storage, lowered) => {
                return Err(CodegenError::invariant(format!(
                    "argument of type {} ({:?}) cannot be passed as {:?}",
                    ty, lowered, storage
                )))
            }
        }
    }
    Ok(signature)
}

impl<'a, 'f, M: Module> Lowerer<'a, 'f, M> {
    /// Lanes of the aggregate at `addr`
    pub(crate) fn pack_lanes(&mut self, addr: Value, size: u32, lanes: [LaneStorage; 2]) -> Vec<Value> {
        lane_layout(size, lanes, self.ptr)
            .into_iter()
            .map(|(offset, _)| {
                let mut lane: Option<Value> = None;
                for (at, ty) in lane_pieces(lane_bytes(size, offset, self.ptr)) {
                    let piece = self.builder.ins().load(ty, MemFlags::new(), addr, offset + at as i32);
                    let piece = if ty == self.ptr {
                        piece
                    } else {
                        self.builder.ins().uextend(self.ptr, piece)
                    };
                    let piece = if at == 0 {
                        piece
                    } else {
                        self.builder.ins().ishl_imm(piece, i64::from(at * 8))
                    };
                    lane = Some(match lane {
                        Some(acc) => self.builder.ins().bor(acc, piece),
                        None => piece,
                    });
                }
                lane.unwrap_or_else(|| self.builder.ins().iconst(self.ptr, 0))
            })
            .collect()
    }

    /// Write `values` back as the aggregate at `addr`
    pub(crate) fn unpack_lanes(
        &mut self,
        values: &[Value],
        addr: Value,
        size: u32,
        lanes: [LaneStorage; 2],
    ) -> CodegenResult<()> {
        let layout = lane_layout(size, lanes, self.ptr);
        if layout.len() != values.len() {
            return Err(CodegenError::invariant(format!(
                "{} register lanes for {} values",
                layout.len(),
                values.len()
            )));
        }
        for ((offset, _), value) in layout.into_iter().zip(values) {
            for (at, ty) in lane_pieces(lane_bytes(size, offset, self.ptr)) {
                let piece = if at == 0 {
                    *value
                } else {
                    self.builder.ins().ushr_imm(*value, i64::from(at * 8))
                };
                let piece = if ty == self.ptr {
                    piece
                } else {
                    self.builder.ins().ireduce(ty, piece)
                };
                self.builder.ins().store(MemFlags::new(), piece, addr, offset + at as i32);
            }
        }
        Ok(())
    }

    fn check_vector_lanes(&self, lanes: [LaneStorage; 2]) -> CodegenResult<()> {
        if self.ptr != ctypes::I64 || used_lanes(lanes) != 2 {
            return Err(CodegenError::unsupported(
                "short vector in registers needs two 64-bit lanes",
            ));
        }
        Ok(())
    }

    /// Split a vector into its two 64-bit halves
    pub(crate) fn pack_vector(&mut self, vector: Value, lanes: [LaneStorage; 2]) -> CodegenResult<Vec<Value>> {
        self.check_vector_lanes(lanes)?;
        let halves = self.builder.ins().bitcast(
            ctypes::I64X2,
            MemFlags::new().with_endianness(Endianness::Little),
            vector,
        );
        Ok((0..2u8)
            .map(|lane| self.builder.ins().extractlane(halves, lane))
            .collect())
    }

    /// Rebuild a vector of type `ty` from two 64-bit halves
    pub(crate) fn unpack_vector(&mut self, values: &[Value], ty: Type, lanes: [LaneStorage; 2]) -> CodegenResult<Value> {
        self.check_vector_lanes(lanes)?;
        let [low, high] = values else {
            return Err(CodegenError::invariant(format!(
                "vector returned in {} lanes",
                values.len()
            )));
        };
        let halves = self.builder.ins().scalar_to_vector(ctypes::I64X2, *low);
        let halves = self.builder.ins().insertlane(halves, *high, 1);
        Ok(self.builder.ins().bitcast(
            ty,
            MemFlags::new().with_endianness(Endianness::Little),
            halves,
        ))
    }
}
