//! Type lowering
//!
//! Maps source types to Cranelift types. Sub-word integers keep their storage
//! width in memory but are widened to 32 bits in registers; single-precision
//! values are carried as doubles between memory accesses.

use super::{CodegenError, CodegenResult};
use crate::ir::{IntWidth, MemType, SourceType, TypeId, TypeQueries, VectorShape};
use cranelift::prelude::{types as ctypes, Type};
use std::collections::HashMap;

/// Size and alignment of an aggregate kept in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateLayout {
    pub size: u32,
    pub align: u32,
}

/// Lowered form of a source type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweredType {
    Void,
    /// Held in one SSA value
    Scalar(Type),
    /// Short vector held in one SSA value
    Vector(Type),
    /// Opaque bytes behind an address
    Aggregate(AggregateLayout),
}

impl LoweredType {
    /// Type of the SSA value representing the source value
    pub fn value_type(self, ptr: Type) -> Option<Type> {
        match self {
            LoweredType::Void => None,
            LoweredType::Scalar(ty) | LoweredType::Vector(ty) => Some(ty),
            LoweredType::Aggregate(_) => Some(ptr),
        }
    }

    pub fn is_aggregate(self) -> bool {
        matches!(self, LoweredType::Aggregate(_))
    }
}

/// Per-module memo of lowered value types
pub type TypeCache = HashMap<TypeId, LoweredType>;

pub fn vector_type(shape: VectorShape) -> Type {
    match shape {
        VectorShape::I8x16 | VectorShape::U8x16 => ctypes::I8X16,
        VectorShape::I16x8 | VectorShape::U16x8 => ctypes::I16X8,
        VectorShape::I32x4 | VectorShape::U32x4 => ctypes::I32X4,
        VectorShape::I64x2 | VectorShape::U64x2 => ctypes::I64X2,
        VectorShape::F32x4 => ctypes::F32X4,
        VectorShape::F64x2 => ctypes::F64X2,
    }
}

fn scalar_type(ty: &SourceType, ptr: Type) -> Option<Type> {
    let lowered = match ty {
        SourceType::Boolean | SourceType::I1 | SourceType::U1 => ctypes::I8,
        SourceType::I2 | SourceType::U2 | SourceType::Char => ctypes::I16,
        SourceType::I4 | SourceType::U4 => ctypes::I32,
        SourceType::I8 | SourceType::U8 => ctypes::I64,
        SourceType::R4 => ctypes::F32,
        SourceType::R8 => ctypes::F64,
        SourceType::I | SourceType::U | SourceType::Ptr | SourceType::ByRef => ptr,
        other if other.is_reference() => ptr,
        _ => return None,
    };
    Some(lowered)
}

/// Lower a source type, memoizing value types in `cache`
pub fn lower_type(
    ty: &SourceType,
    types: &dyn TypeQueries,
    cache: &mut TypeCache,
    ptr: Type,
) -> CodegenResult<LoweredType> {
    if ty.is_void() {
        return Ok(LoweredType::Void);
    }
    if let Some(scalar) = scalar_type(ty, ptr) {
        return Ok(LoweredType::Scalar(scalar));
    }
    match ty {
        SourceType::ValueType(id) => {
            if let Some(cached) = cache.get(id) {
                return Ok(*cached);
            }
            let lowered = lower_value_type(*id, types, ptr)?;
            cache.insert(*id, lowered);
            Ok(lowered)
        }
        other => Err(CodegenError::unsupported(format!("type {} has no lowering", other))),
    }
}

fn lower_value_type(id: TypeId, types: &dyn TypeQueries, ptr: Type) -> CodegenResult<LoweredType> {
    if let Some(shape) = types.vector_shape(id) {
        return Ok(LoweredType::Vector(vector_type(shape)));
    }
    if let Some(base) = types.enum_base(id) {
        return match scalar_type(&base, ptr) {
            Some(scalar) => Ok(LoweredType::Scalar(scalar)),
            None => Err(CodegenError::unsupported(format!(
                "enum {} has non-scalar base {}",
                types.type_name(id),
                base
            ))),
        };
    }
    let size = types
        .value_size(id)
        .ok_or_else(|| CodegenError::unsupported(format!("unknown value type {}", id)))?;
    let align = types.min_align(id).unwrap_or(1).max(1);
    Ok(LoweredType::Aggregate(AggregateLayout { size, align }))
}

/// Register representation of a value of type `ty`
pub fn stack_type(ty: Type) -> Type {
    match ty {
        ctypes::I8 | ctypes::I16 => ctypes::I32,
        ctypes::F32 => ctypes::F64,
        other => other,
    }
}

/// Type of a scalar argument or return in a signature
pub fn arg_type(ty: Type) -> Type {
    match ty {
        ctypes::I8 | ctypes::I16 => ctypes::I32,
        other => other,
    }
}

/// Integer type of an arithmetic width
pub fn width_type(width: IntWidth, ptr: Type) -> Type {
    match width {
        IntWidth::I32 => ctypes::I32,
        IntWidth::I64 => ctypes::I64,
        IntWidth::Native => ptr,
    }
}

/// Memory type of an access and whether it zero-extends
pub fn mem_type(ty: MemType, ptr: Type) -> (Type, bool) {
    match ty {
        MemType::I1 => (ctypes::I8, false),
        MemType::U1 => (ctypes::I8, true),
        MemType::I2 => (ctypes::I16, false),
        MemType::U2 => (ctypes::I16, true),
        MemType::I4 => (ctypes::I32, false),
        MemType::U4 => (ctypes::I32, true),
        MemType::I8 => (ctypes::I64, false),
        MemType::R4 => (ctypes::F32, false),
        MemType::R8 => (ctypes::F64, false),
        MemType::Native => (ptr, false),
    }
}

/// Bytes reserved for an aggregate home: whole pointer-size words
pub fn padded_size(size: u32, ptr_bytes: u32) -> u32 {
    let size = size.max(1);
    size.div_ceil(ptr_bytes) * ptr_bytes
}
