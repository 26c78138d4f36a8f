//! Calling-convention descriptors
//!
//! The front end decides where every argument and return value lives; the
//! backend only consumes that decision. [`CallInfo::classify`] is a reference
//! classifier for a 64-bit SysV-like convention, used by the driver and tests.

use super::types::{SourceType, TypeQueries};
use super::MethodSignature;
use serde::{Deserialize, Serialize};

/// Storage of one pointer-width lane of a register-pair aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStorage {
    Integer,
    None,
}

/// Placement of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgStorage {
    Register,
    FloatRegister,
    /// Aggregate split into up to two pointer-width lanes
    RegisterPair { lanes: [LaneStorage; 2] },
    /// Aggregate passed by value in memory; the callee receives its own copy
    ByValue,
    /// Aggregate copied by the caller; a pointer to the copy is passed
    ByReference,
}

/// Placement of the return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStorage {
    None,
    Register,
    FloatRegister,
    RegisterPair { lanes: [LaneStorage; 2] },
    /// Caller passes the destination address as a hidden first argument
    HiddenPointer,
}

impl LaneStorage {
    pub fn is_used(self) -> bool {
        matches!(self, LaneStorage::Integer)
    }
}

/// Per-call-site (or per-method) calling-convention description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub ret: ReturnStorage,
    /// One entry per argument, `this` first when present
    pub args: Vec<ArgStorage>,
}

impl CallInfo {
    pub fn uses_hidden_return(&self) -> bool {
        matches!(self.ret, ReturnStorage::HiddenPointer)
    }

    /// Classify a signature: aggregates up to one pointer width use one lane,
    /// up to two pointer widths use two lanes, anything larger goes by
    /// reference (arguments) or through a hidden pointer (returns).
    pub fn classify(sig: &MethodSignature, types: &dyn TypeQueries, ptr_bytes: u32) -> CallInfo {
        let mut args = Vec::with_capacity(sig.params.len() + 1);
        if sig.has_this {
            args.push(ArgStorage::Register);
        }
        for param in &sig.params {
            args.push(classify_arg(param, types, ptr_bytes));
        }
        CallInfo {
            ret: classify_ret(&sig.ret, types, ptr_bytes),
            args,
        }
    }
}

fn scalar_of(ty: &SourceType, types: &dyn TypeQueries) -> Option<SourceType> {
    match ty {
        SourceType::ValueType(id) => {
            if types.vector_shape(*id).is_some() {
                None
            } else {
                types.enum_base(*id)
            }
        }
        other => Some(other.clone()),
    }
}

fn lanes_for(size: u32, ptr_bytes: u32) -> Option<[LaneStorage; 2]> {
    if size <= ptr_bytes {
        Some([LaneStorage::Integer, LaneStorage::None])
    } else if size <= ptr_bytes * 2 {
        Some([LaneStorage::Integer, LaneStorage::Integer])
    } else {
        None
    }
}

fn aggregate_size(ty: &SourceType, types: &dyn TypeQueries) -> u32 {
    ty.value_type()
        .and_then(|id| types.value_size(id))
        .unwrap_or(0)
}

fn classify_arg(ty: &SourceType, types: &dyn TypeQueries, ptr_bytes: u32) -> ArgStorage {
    match scalar_of(ty, types) {
        Some(scalar) if scalar.is_float() => ArgStorage::FloatRegister,
        Some(_) => ArgStorage::Register,
        None => match lanes_for(aggregate_size(ty, types), ptr_bytes) {
            Some(lanes) => ArgStorage::RegisterPair { lanes },
            None => ArgStorage::ByReference,
        },
    }
}

fn classify_ret(ty: &SourceType, types: &dyn TypeQueries, ptr_bytes: u32) -> ReturnStorage {
    match scalar_of(ty, types) {
        Some(SourceType::Void) => ReturnStorage::None,
        Some(scalar) if scalar.is_float() => ReturnStorage::FloatRegister,
        Some(_) => ReturnStorage::Register,
        None => match lanes_for(aggregate_size(ty, types), ptr_bytes) {
            Some(lanes) => ReturnStorage::RegisterPair { lanes },
            None => ReturnStorage::HiddenPointer,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{TypeTable, VectorShape};

    fn sig(params: Vec<SourceType>, ret: SourceType) -> MethodSignature {
        MethodSignature {
            params,
            ret,
            has_this: false,
            varargs: false,
        }
    }

    #[test]
    fn test_classify_aggregate_sizes() {
        let mut types = TypeTable::new();
        let expectations = [
            (1, Some(1)),
            (8, Some(1)),
            (9, Some(2)),
            (16, Some(2)),
            (17, None),
        ];
        for (size, lanes) in expectations {
            let id = types.add_struct(&format!("S{}", size), size, 1);
            let info = CallInfo::classify(
                &sig(vec![SourceType::ValueType(id)], SourceType::ValueType(id)),
                &types,
                8,
            );
            match lanes {
                Some(n) => {
                    let ArgStorage::RegisterPair { lanes } = info.args[0] else {
                        panic!("size {} should use register lanes", size);
                    };
                    assert_eq!(lanes.iter().filter(|l| l.is_used()).count(), n);
                    assert!(matches!(info.ret, ReturnStorage::RegisterPair { .. }));
                }
                None => {
                    assert_eq!(info.args[0], ArgStorage::ByReference);
                    assert_eq!(info.ret, ReturnStorage::HiddenPointer);
                }
            }
        }
    }

    #[test]
    fn test_classify_scalars_and_enums() {
        let mut types = TypeTable::new();
        let color = types.add_enum("Color", SourceType::I4, 4);
        let vec4 = types.add_vector("Vector4", VectorShape::F32x4);
        let mut signature = sig(
            vec![SourceType::R8, SourceType::ValueType(color), SourceType::ValueType(vec4)],
            SourceType::Void,
        );
        signature.has_this = true;
        let info = CallInfo::classify(&signature, &types, 8);
        assert_eq!(
            info.args,
            vec![
                ArgStorage::Register,
                ArgStorage::FloatRegister,
                ArgStorage::Register,
                ArgStorage::RegisterPair { lanes: [LaneStorage::Integer, LaneStorage::Integer] },
            ]
        );
        assert_eq!(info.ret, ReturnStorage::None);
    }
}
