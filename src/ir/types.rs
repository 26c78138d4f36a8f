//! Source value types and the type-query interface
//!
//! The lowering engine never inspects class metadata directly. Everything it
//! needs about a value type (size, alignment, vector shape, enum base) comes
//! through [`TypeQueries`], which the embedding runtime implements. A
//! serde-loadable [`TypeTable`] is provided for the command line driver and
//! for tests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a value type in the embedding runtime's type system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Type of a value as seen by the front end
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// Native-width signed integer
    I,
    /// Native-width unsigned integer
    U,
    /// Unmanaged pointer
    Ptr,
    /// Managed pointer (byref)
    ByRef,
    Object,
    Class,
    String,
    Array,
    SzArray,
    /// Generic parameter, shared as a reference
    GenericParam,
    /// A value type; its shape is resolved through [`TypeQueries`]
    ValueType(TypeId),
    /// Typed reference (no lowering exists)
    TypedByRef,
    /// Function pointer (no lowering exists)
    FnPtr,
}

impl SourceType {
    /// Whether extension from this type is a zero extension
    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            SourceType::Boolean
                | SourceType::Char
                | SourceType::U1
                | SourceType::U2
                | SourceType::U4
                | SourceType::U8
                | SourceType::U
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SourceType::R4 | SourceType::R8)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, SourceType::Void)
    }

    /// Object references are all lowered to one pointer-sized representation
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            SourceType::Object
                | SourceType::Class
                | SourceType::String
                | SourceType::Array
                | SourceType::SzArray
                | SourceType::GenericParam
        )
    }

    pub fn value_type(&self) -> Option<TypeId> {
        match self {
            SourceType::ValueType(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::ValueType(id) => write!(f, "valuetype {}", id),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Shape of a fixed-width short vector type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorShape {
    I8x16,
    U8x16,
    I16x8,
    U16x8,
    I32x4,
    U32x4,
    I64x2,
    U64x2,
    F32x4,
    F64x2,
}

impl VectorShape {
    pub fn lane_count(self) -> u8 {
        match self {
            VectorShape::I8x16 | VectorShape::U8x16 => 16,
            VectorShape::I16x8 | VectorShape::U16x8 => 8,
            VectorShape::I32x4 | VectorShape::U32x4 | VectorShape::F32x4 => 4,
            VectorShape::I64x2 | VectorShape::U64x2 | VectorShape::F64x2 => 2,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, VectorShape::F32x4 | VectorShape::F64x2)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            VectorShape::U8x16 | VectorShape::U16x8 | VectorShape::U32x4 | VectorShape::U64x2
        )
    }

    /// All supported shapes are 128 bits wide
    pub fn byte_size(self) -> u32 {
        16
    }
}

/// Type queries answered by the embedding runtime
pub trait TypeQueries {
    /// Size in bytes of an instance of the value type
    fn value_size(&self, ty: TypeId) -> Option<u32>;

    /// Minimum alignment of the value type
    fn min_align(&self, ty: TypeId) -> Option<u32>;

    /// Vector shape, if the type is a short-vector type
    fn vector_shape(&self, ty: TypeId) -> Option<VectorShape>;

    /// Underlying scalar type, if the type is an enum
    fn enum_base(&self, ty: TypeId) -> Option<SourceType>;

    /// Human-readable name for diagnostics
    fn type_name(&self, ty: TypeId) -> String {
        ty.to_string()
    }
}

/// Description of one value type in a [`TypeTable`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDesc {
    pub id: TypeId,
    pub name: String,
    pub size: u32,
    #[serde(default = "default_align")]
    pub align: u32,
    #[serde(default)]
    pub vector: Option<VectorShape>,
    #[serde(default)]
    pub enum_base: Option<SourceType>,
}

fn default_align() -> u32 {
    1
}

/// Flat table of value types, loadable from JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTable {
    types: Vec<TypeDesc>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> TypeId {
        TypeId(self.types.iter().map(|t| t.id.0 + 1).max().unwrap_or(0))
    }

    fn push(&mut self, desc: TypeDesc) -> TypeId {
        let id = desc.id;
        self.types.push(desc);
        id
    }

    /// Register a plain struct-like value type
    pub fn add_struct(&mut self, name: &str, size: u32, align: u32) -> TypeId {
        let id = self.next_id();
        self.push(TypeDesc {
            id,
            name: name.to_string(),
            size,
            align,
            vector: None,
            enum_base: None,
        })
    }

    /// Register a short-vector value type
    pub fn add_vector(&mut self, name: &str, shape: VectorShape) -> TypeId {
        let id = self.next_id();
        self.push(TypeDesc {
            id,
            name: name.to_string(),
            size: shape.byte_size(),
            align: 16,
            vector: Some(shape),
            enum_base: None,
        })
    }

    /// Register an enum backed by a scalar type
    pub fn add_enum(&mut self, name: &str, base: SourceType, size: u32) -> TypeId {
        let id = self.next_id();
        self.push(TypeDesc {
            id,
            name: name.to_string(),
            size,
            align: size.max(1),
            vector: None,
            enum_base: Some(base),
        })
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDesc> {
        self.types.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl TypeQueries for TypeTable {
    fn value_size(&self, ty: TypeId) -> Option<u32> {
        self.get(ty).map(|t| t.size)
    }

    fn min_align(&self, ty: TypeId) -> Option<u32> {
        self.get(ty).map(|t| t.align)
    }

    fn vector_shape(&self, ty: TypeId) -> Option<VectorShape> {
        self.get(ty).and_then(|t| t.vector)
    }

    fn enum_base(&self, ty: TypeId) -> Option<SourceType> {
        self.get(ty).and_then(|t| t.enum_base.clone())
    }

    fn type_name(&self, ty: TypeId) -> String {
        self.get(ty)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| ty.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_table_ids_are_distinct() {
        let mut table = TypeTable::new();
        let a = table.add_struct("A", 12, 4);
        let b = table.add_vector("V", VectorShape::F32x4);
        let c = table.add_enum("E", SourceType::U2, 2);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(table.value_size(a), Some(12));
        assert_eq!(table.vector_shape(b), Some(VectorShape::F32x4));
        assert_eq!(table.enum_base(c), Some(SourceType::U2));
        assert_eq!(table.type_name(a), "A");
    }

    #[test]
    fn test_unsignedness() {
        assert!(SourceType::U1.is_unsigned());
        assert!(SourceType::Char.is_unsigned());
        assert!(!SourceType::I4.is_unsigned());
        assert!(SourceType::String.is_reference());
    }

    #[test]
    fn test_type_table_json() {
        let json = r#"[{"id": 3, "name": "Pair", "size": 16, "align": 8}]"#;
        let table: TypeTable = serde_json::from_str(json).expect("type table should parse");
        assert_eq!(table.value_size(TypeId(3)), Some(16));
        assert_eq!(table.vector_shape(TypeId(3)), None);
    }
}
