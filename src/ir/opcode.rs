//! Source instruction set
//!
//! Every source instruction is one variant of [`Op`]. Operands are virtual
//! registers ([`Vreg`]); immediates and type identities are carried inline.

use super::callconv::CallInfo;
use super::types::{SourceType, TypeId};
use super::{BlockId, MethodSignature, Vreg};
use serde::{Deserialize, Serialize};

/// Operand width of integer arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntWidth {
    I32,
    I64,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntBinOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatBinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Arithmetic that raises `OverflowException` on overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckedOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinMaxOp {
    Min,
    MinUn,
    Max,
    MaxUn,
}

/// Condition consumed by branches, set-condition and conditional throws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LtUn,
    LeUn,
    GtUn,
    GeUn,
}

/// Operand class of a compare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareKind {
    I32,
    I64,
    Native,
    Float,
}

/// Right-hand side of a compare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareRhs {
    Reg(Vreg),
    Imm(i64),
}

/// Explicit numeric conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// Integer narrowing to a sub-word type, re-extended to stack width
    ToI1,
    ToU1,
    ToI2,
    ToU2,
    ToI4,
    ToU4,
    /// Widening of a 32-bit value to 64 bits
    ToI8,
    ToU8,
    FloatToI1,
    FloatToU1,
    FloatToI2,
    FloatToU2,
    FloatToI4,
    FloatToU4,
    FloatToI8,
    FloatToU8,
    FloatToI,
    IntToR8,
    LongToR8,
    LongToR8Un,
    IntToR4,
    LongToR4,
    FloatToR4,
    SextI4,
    ZextI4,
    TruncI4,
}

/// Width and extension of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemType {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    R4,
    R8,
    Native,
}

/// Runtime exceptions raised by conditional throws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorlibException {
    OverflowException,
    DivideByZeroException,
    IndexOutOfRangeException,
    NullReferenceException,
    InvalidCastException,
    ArithmeticException,
    ArgumentOutOfRangeException,
}

impl CorlibException {
    /// Type-definition token of the exception class in the core library
    pub fn type_token(self) -> u32 {
        let row = match self {
            CorlibException::OverflowException => 0x1c,
            CorlibException::DivideByZeroException => 0x1d,
            CorlibException::IndexOutOfRangeException => 0x1e,
            CorlibException::NullReferenceException => 0x1f,
            CorlibException::InvalidCastException => 0x20,
            CorlibException::ArithmeticException => 0x21,
            CorlibException::ArgumentOutOfRangeException => 0x22,
        };
        0x0200_0000 | row
    }

    pub fn name(self) -> &'static str {
        match self {
            CorlibException::OverflowException => "OverflowException",
            CorlibException::DivideByZeroException => "DivideByZeroException",
            CorlibException::IndexOutOfRangeException => "IndexOutOfRangeException",
            CorlibException::NullReferenceException => "NullReferenceException",
            CorlibException::InvalidCastException => "InvalidCastException",
            CorlibException::ArithmeticException => "ArithmeticException",
            CorlibException::ArgumentOutOfRangeException => "ArgumentOutOfRangeException",
        }
    }
}

/// Target of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    /// Call to a named symbol
    Direct { symbol: String },
    /// Call through a vtable slot of the object in `base`
    Virtual {
        base: Vreg,
        slot_offset: i32,
        #[serde(default)]
        interface: bool,
    },
    /// Call through a code pointer held in a register
    Indirect { target: Vreg },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicOp {
    /// Store the new value, produce the old one
    Exchange,
    /// Add, produce the new value
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
}

/// One source instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Nop,
    #[serde(rename = "iconst")]
    IConst { dst: Vreg, value: i32 },
    #[serde(rename = "i8const")]
    I8Const { dst: Vreg, value: i64 },
    #[serde(rename = "r4const")]
    R4Const { dst: Vreg, value: f32 },
    #[serde(rename = "r8const")]
    R8Const { dst: Vreg, value: f64 },
    Move { dst: Vreg, src: Vreg },
    FMove { dst: Vreg, src: Vreg },

    IntBinary { op: IntBinOp, width: IntWidth, dst: Vreg, lhs: Vreg, rhs: Vreg },
    IntBinaryImm { op: IntBinOp, width: IntWidth, dst: Vreg, lhs: Vreg, imm: i64 },
    FloatBinary { op: FloatBinOp, dst: Vreg, lhs: Vreg, rhs: Vreg },
    CheckedBinary {
        op: CheckedOp,
        width: IntWidth,
        #[serde(default)]
        unsigned: bool,
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
    },
    Neg { width: IntWidth, dst: Vreg, src: Vreg },
    Not { width: IntWidth, dst: Vreg, src: Vreg },
    FNeg { dst: Vreg, src: Vreg },
    FAbs { dst: Vreg, src: Vreg },
    MinMax { op: MinMaxOp, width: IntWidth, dst: Vreg, lhs: Vreg, rhs: Vreg },
    Convert { conv: Conversion, dst: Vreg, src: Vreg },

    /// Compare, fused with the instruction that follows it
    Compare { kind: CompareKind, lhs: Vreg, rhs: CompareRhs },
    CondBranch { cond: Cond, if_true: BlockId, if_false: BlockId },
    SetCond { cond: Cond, dst: Vreg },
    CondThrow { cond: Cond, exception: CorlibException },
    FloatSetCond { cond: Cond, dst: Vreg, lhs: Vreg, rhs: Vreg },

    Br { target: BlockId },
    Switch { src: Vreg, targets: Vec<BlockId> },
    SetRet { src: Option<Vreg> },
    NotReached,

    Load { ty: MemType, dst: Vreg, base: Vreg, offset: i32 },
    Store { ty: MemType, base: Vreg, offset: i32, src: Vreg },
    StoreImm { ty: MemType, base: Vreg, offset: i32, value: i64 },
    CheckThis { src: Vreg },
    LdAddr { dst: Vreg, var: Vreg },
    Localloc { dst: Vreg, size: Vreg },
    LocallocImm {
        dst: Vreg,
        size: u32,
        #[serde(default)]
        zero: bool,
    },

    Call {
        dst: Option<Vreg>,
        callee: Callee,
        signature: MethodSignature,
        call_info: CallInfo,
        args: Vec<Vreg>,
    },
    Throw { src: Vreg },
    CallHandler { target: BlockId },
    StartHandler,
    EndFinally,
    ImplicitException,

    VZero { dst: Vreg, ty: TypeId },
    VMove { dst: Vreg, src: Vreg, ty: TypeId },
    LoadV { dst: Vreg, base: Vreg, offset: i32, ty: TypeId },
    StoreV { base: Vreg, offset: i32, src: Vreg, ty: TypeId },
    OutArgVt { dst: Vreg, src: Vreg, ty: TypeId },

    XZero { dst: Vreg, ty: TypeId },
    LoadX { dst: Vreg, base: Vreg, offset: i32, ty: TypeId },
    VectorBinary { op: VectorOp, ty: TypeId, dst: Vreg, lhs: Vreg, rhs: Vreg },
    ExtractLane { dst: Vreg, src: Vreg, ty: TypeId, lane: u8 },

    Atomic { op: AtomicOp, width: IntWidth, dst: Vreg, addr: Vreg, value: Vreg },
    AtomicCas { width: IntWidth, dst: Vreg, addr: Vreg, expected: Vreg, new: Vreg },
    MemoryBarrier,

    /// Load of a runtime constant resolved when the artifact is loaded
    AotConst { dst: Vreg, symbol: String },

    /// SSA join; `args[i]` flows in from the block's `preds[i]`
    Phi { dst: Vreg, ty: SourceType, args: Vec<Vreg> },
}

impl Op {
    /// Short opcode name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::IConst { .. } => "iconst",
            Op::I8Const { .. } => "i8const",
            Op::R4Const { .. } => "r4const",
            Op::R8Const { .. } => "r8const",
            Op::Move { .. } => "move",
            Op::FMove { .. } => "fmove",
            Op::IntBinary { .. } => "int-binary",
            Op::IntBinaryImm { .. } => "int-binary-imm",
            Op::FloatBinary { .. } => "float-binary",
            Op::CheckedBinary { .. } => "checked-binary",
            Op::Neg { .. } => "neg",
            Op::Not { .. } => "not",
            Op::FNeg { .. } => "fneg",
            Op::FAbs { .. } => "fabs",
            Op::MinMax { .. } => "min-max",
            Op::Convert { .. } => "convert",
            Op::Compare { .. } => "compare",
            Op::CondBranch { .. } => "cond-branch",
            Op::SetCond { .. } => "set-cond",
            Op::CondThrow { .. } => "cond-throw",
            Op::FloatSetCond { .. } => "float-set-cond",
            Op::Br { .. } => "br",
            Op::Switch { .. } => "switch",
            Op::SetRet { .. } => "setret",
            Op::NotReached => "not-reached",
            Op::Load { .. } => "load",
            Op::Store { .. } => "store",
            Op::StoreImm { .. } => "store-imm",
            Op::CheckThis { .. } => "check-this",
            Op::LdAddr { .. } => "ldaddr",
            Op::Localloc { .. } => "localloc",
            Op::LocallocImm { .. } => "localloc-imm",
            Op::Call { .. } => "call",
            Op::Throw { .. } => "throw",
            Op::CallHandler { .. } => "call-handler",
            Op::StartHandler => "start-handler",
            Op::EndFinally => "end-finally",
            Op::ImplicitException => "implicit-exception",
            Op::VZero { .. } => "vzero",
            Op::VMove { .. } => "vmove",
            Op::LoadV { .. } => "loadv",
            Op::StoreV { .. } => "storev",
            Op::OutArgVt { .. } => "outarg-vt",
            Op::XZero { .. } => "xzero",
            Op::LoadX { .. } => "loadx",
            Op::VectorBinary { .. } => "vector-binary",
            Op::ExtractLane { .. } => "extract-lane",
            Op::Atomic { .. } => "atomic",
            Op::AtomicCas { .. } => "atomic-cas",
            Op::MemoryBarrier => "memory-barrier",
            Op::AotConst { .. } => "aotconst",
            Op::Phi { .. } => "phi",
        }
    }

    /// Ends the block; nothing after it is lowered
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Br { .. }
                | Op::CondBranch { .. }
                | Op::Switch { .. }
                | Op::SetRet { .. }
                | Op::NotReached
                | Op::EndFinally
        )
    }

    /// Nothing after this instruction runs: a terminator or a throw
    pub fn ends_flow(&self) -> bool {
        self.is_terminator() || matches!(self, Op::Throw { .. })
    }

    /// Can transfer control to an exception handler when inside a try region
    pub fn may_raise(&self) -> bool {
        matches!(
            self,
            Op::Call { .. } | Op::Throw { .. } | Op::CheckedBinary { .. } | Op::CondThrow { .. }
        )
    }

    /// Blocks this instruction can branch to
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Op::Br { target } | Op::CallHandler { target } => vec![*target],
            Op::CondBranch { if_true, if_false, .. } => vec![*if_true, *if_false],
            Op::Switch { targets, .. } => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Register written by the instruction, if any
    pub fn dst(&self) -> Option<Vreg> {
        match self {
            Op::IConst { dst, .. }
            | Op::I8Const { dst, .. }
            | Op::R4Const { dst, .. }
            | Op::R8Const { dst, .. }
            | Op::Move { dst, .. }
            | Op::FMove { dst, .. }
            | Op::IntBinary { dst, .. }
            | Op::IntBinaryImm { dst, .. }
            | Op::FloatBinary { dst, .. }
            | Op::CheckedBinary { dst, .. }
            | Op::Neg { dst, .. }
            | Op::Not { dst, .. }
            | Op::FNeg { dst, .. }
            | Op::FAbs { dst, .. }
            | Op::MinMax { dst, .. }
            | Op::Convert { dst, .. }
            | Op::SetCond { dst, .. }
            | Op::FloatSetCond { dst, .. }
            | Op::Load { dst, .. }
            | Op::LdAddr { dst, .. }
            | Op::Localloc { dst, .. }
            | Op::LocallocImm { dst, .. }
            | Op::VZero { dst, .. }
            | Op::VMove { dst, .. }
            | Op::LoadV { dst, .. }
            | Op::OutArgVt { dst, .. }
            | Op::XZero { dst, .. }
            | Op::LoadX { dst, .. }
            | Op::VectorBinary { dst, .. }
            | Op::ExtractLane { dst, .. }
            | Op::Atomic { dst, .. }
            | Op::AtomicCas { dst, .. }
            | Op::AotConst { dst, .. }
            | Op::Phi { dst, .. } => Some(*dst),
            Op::Call { dst, .. } => *dst,
            _ => None,
        }
    }
}
