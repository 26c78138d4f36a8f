//! Source Intermediate Representation
//!
//! The front end hands the backend one method at a time in this form:
//! - ordered basic blocks of register-based instructions (block 0 is the entry)
//! - a predecessor list per block, which fixes the operand order of phis
//! - an exception-clause table and per-block region membership
//! - calling-convention descriptors for the method and for every call site
//!
//! Everything here derives serde so whole methods can be loaded from JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod builder;
pub mod callconv;
pub mod opcode;
pub mod types;

pub use builder::MethodBuilder;
pub use callconv::{ArgStorage, CallInfo, LaneStorage, ReturnStorage};
pub use opcode::{
    AtomicOp, Callee, CheckedOp, CompareKind, CompareRhs, Cond, Conversion, CorlibException,
    FloatBinOp, IntBinOp, IntWidth, MemType, MinMaxOp, Op, VectorOp,
};
pub use types::{SourceType, TypeDesc, TypeId, TypeQueries, TypeTable, VectorShape};

/// Virtual register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vreg(pub u32);

impl fmt::Display for Vreg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Index of a basic block in [`Method::blocks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BB{}", self.0)
    }
}

/// Innermost exception region a block belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    #[default]
    None,
    /// Protected range of the clause with this index
    Try(usize),
    /// Handler body of the clause with this index
    Handler(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub instructions: Vec<Op>,
    /// Predecessors in the global block graph
    #[serde(default)]
    pub preds: Vec<BlockId>,
    #[serde(default)]
    pub region: Region,
    /// Catch handlers: the variable receiving the exception object
    #[serde(default)]
    pub exception_var: Option<Vreg>,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            preds: Vec::new(),
            region: Region::None,
            exception_var: None,
        }
    }

    /// Control never leaves the block normally: its flow ends in a
    /// "never reached" marker or a throw
    pub fn ends_unreachable(&self) -> bool {
        matches!(
            self.instructions.iter().find(|op| op.ends_flow()),
            Some(Op::NotReached) | Some(Op::Throw { .. })
        )
    }

    /// Contains an instruction that can raise inside a try region
    pub fn may_raise(&self) -> bool {
        self.instructions.iter().any(Op::may_raise)
    }

    /// Ends a finally body whose exceptional exit resumes unwinding
    pub fn ends_finally(&self) -> bool {
        self.instructions.iter().any(|op| matches!(op, Op::EndFinally))
    }

    pub fn try_clause(&self) -> Option<usize> {
        match self.region {
            Region::Try(clause) => Some(clause),
            _ => None,
        }
    }

    pub fn handler_clause(&self) -> Option<usize> {
        match self.region {
            Region::Handler(clause) => Some(clause),
            _ => None,
        }
    }

    /// Normal-flow successors. Lowering stops at the first terminator or
    /// throw; a block without either falls through to `next`.
    pub fn successors(&self, next: Option<BlockId>) -> Vec<BlockId> {
        let mut succs = Vec::new();
        for op in &self.instructions {
            for target in op.targets() {
                if !succs.contains(&target) {
                    succs.push(target);
                }
            }
            if op.ends_flow() {
                return succs;
            }
        }
        if let Some(next) = next {
            if !succs.contains(&next) {
                succs.push(next);
            }
        }
        succs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseKind {
    Catch,
    Finally,
    Filter,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionClause {
    pub kind: ClauseKind,
    pub handler_entry: BlockId,
    #[serde(default)]
    pub catch_token: Option<u32>,
    /// Clause consulted next when this one does not take the exception:
    /// a sibling catch over the same range or the surrounding try
    #[serde(default)]
    pub enclosing: Option<usize>,
}

impl ExceptionClause {
    pub fn new(kind: ClauseKind, handler_entry: BlockId, catch_token: Option<u32>) -> Self {
        Self {
            kind,
            handler_entry,
            catch_token,
            enclosing: None,
        }
    }
}

/// Clauses an exception raised under `first` is offered to, innermost first
pub fn clause_chain(clauses: &[ExceptionClause], first: usize) -> Vec<usize> {
    let mut chain = Vec::new();
    let mut next = Some(first);
    while let Some(index) = next {
        if index >= clauses.len() || chain.contains(&index) {
            break;
        }
        chain.push(index);
        next = clauses[index].enclosing;
    }
    chain
}

/// First clause offered an exception raised in `block`.
///
/// Try blocks start at their own clause. Finally bodies hand exceptions to
/// the clause enclosing their try; anything raised in a catch body leaves
/// the method.
pub fn unwind_clause(block: &BasicBlock, clauses: &[ExceptionClause]) -> Option<usize> {
    match block.region {
        Region::Try(clause) => Some(clause),
        Region::Handler(clause) => clauses
            .get(clause)
            .filter(|c| c.kind == ClauseKind::Finally)
            .and_then(|c| c.enclosing),
        Region::None => None,
    }
}

/// Handler entries reachable from `block` by raising
pub fn exceptional_successors(block: &BasicBlock, clauses: &[ExceptionClause]) -> Vec<BlockId> {
    let mut handlers = Vec::new();
    if !block.may_raise() && !block.ends_finally() {
        return handlers;
    }
    if let Some(first) = unwind_clause(block, clauses) {
        for index in clause_chain(clauses, first) {
            let handler = clauses[index].handler_entry;
            if !handlers.contains(&handler) {
                handlers.push(handler);
            }
        }
    }
    handlers
}

/// A named local or argument with storage requirements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub vreg: Vreg,
    pub ty: SourceType,
    /// Must live in memory across exception edges
    #[serde(default)]
    pub volatile: bool,
    /// Address is taken
    #[serde(default)]
    pub indirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub params: Vec<SourceType>,
    pub ret: SourceType,
    #[serde(default)]
    pub has_this: bool,
    #[serde(default)]
    pub varargs: bool,
}

impl MethodSignature {
    pub fn new(params: Vec<SourceType>, ret: SourceType) -> Self {
        Self {
            params,
            ret,
            has_this: false,
            varargs: false,
        }
    }

    /// Argument types in calling order, `this` first when present
    pub fn arg_types(&self) -> Vec<SourceType> {
        let mut tys = Vec::with_capacity(self.params.len() + 1);
        if self.has_this {
            tys.push(SourceType::Object);
        }
        tys.extend(self.params.iter().cloned());
        tys
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub signature: MethodSignature,
    pub call_info: CallInfo,
    pub blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub clauses: Vec<ExceptionClause>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    /// Registers receiving the incoming arguments, `this` first
    pub args: Vec<Vreg>,
    /// Register receiving the hidden return-buffer address
    #[serde(default)]
    pub vret_addr: Option<Vreg>,
    #[serde(default)]
    pub saves_lmf: bool,
    #[serde(default)]
    pub pinvoke: bool,
}

impl Method {
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    pub fn next_block(&self, id: BlockId) -> Option<BlockId> {
        let next = BlockId(id.0 + 1);
        self.block(next).map(|_| next)
    }

    pub fn variable(&self, vreg: Vreg) -> Option<&Variable> {
        self.variables.iter().find(|v| v.vreg == vreg)
    }

    /// Clause whose handler starts at `id`
    pub fn clause_of_handler(&self, id: BlockId) -> Option<usize> {
        self.clauses.iter().position(|c| c.handler_entry == id)
    }

    pub fn is_handler_entry(&self, id: BlockId) -> bool {
        self.clause_of_handler(id).is_some()
    }

    pub fn clause_chain(&self, first: usize) -> Vec<usize> {
        clause_chain(&self.clauses, first)
    }

    /// First clause offered an exception raised in block `id`
    pub fn unwind_clause(&self, id: BlockId) -> Option<usize> {
        self.block(id).and_then(|b| unwind_clause(b, &self.clauses))
    }
}

/// A set of methods plus the value types they reference
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodBundle {
    #[serde(default)]
    pub types: TypeTable,
    pub methods: Vec<Method>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successors_stop_at_terminator() {
        let mut block = BasicBlock::new(BlockId(0));
        block.instructions.push(Op::CallHandler { target: BlockId(3) });
        block.instructions.push(Op::Br { target: BlockId(2) });
        block.instructions.push(Op::Br { target: BlockId(5) });
        assert_eq!(block.successors(Some(BlockId(1))), vec![BlockId(3), BlockId(2)]);
    }

    #[test]
    fn test_fallthrough_successor() {
        let mut block = BasicBlock::new(BlockId(0));
        block.instructions.push(Op::IConst { dst: Vreg(0), value: 1 });
        assert_eq!(block.successors(Some(BlockId(1))), vec![BlockId(1)]);
        assert!(block.successors(None).is_empty());
    }

    #[test]
    fn test_not_reached_has_no_successors() {
        let mut block = BasicBlock::new(BlockId(0));
        block.instructions.push(Op::NotReached);
        assert!(block.ends_unreachable());
        assert!(block.successors(Some(BlockId(1))).is_empty());
    }

    #[test]
    fn test_clause_chain_follows_enclosing() {
        let mut clauses = vec![
            ExceptionClause::new(ClauseKind::Catch, BlockId(3), Some(7)),
            ExceptionClause::new(ClauseKind::Catch, BlockId(4), None),
            ExceptionClause::new(ClauseKind::Finally, BlockId(5), None),
        ];
        clauses[0].enclosing = Some(1);
        clauses[1].enclosing = Some(2);
        assert_eq!(clause_chain(&clauses, 0), vec![0, 1, 2]);
        assert_eq!(clause_chain(&clauses, 2), vec![2]);

        // A cycle ends the chain instead of looping
        clauses[2].enclosing = Some(0);
        assert_eq!(clause_chain(&clauses, 1), vec![1, 2, 0]);
    }

    #[test]
    fn test_end_finally_resumes_into_enclosing_handlers() {
        let mut clauses = vec![
            ExceptionClause::new(ClauseKind::Finally, BlockId(2), None),
            ExceptionClause::new(ClauseKind::Catch, BlockId(3), None),
        ];
        let mut finally = BasicBlock::new(BlockId(2));
        finally.region = Region::Handler(0);
        finally.instructions.push(Op::EndFinally);
        assert!(exceptional_successors(&finally, &clauses).is_empty());

        clauses[0].enclosing = Some(1);
        assert_eq!(exceptional_successors(&finally, &clauses), vec![BlockId(3)]);
    }

    #[test]
    fn test_throw_ends_flow() {
        let mut block = BasicBlock::new(BlockId(0));
        block.instructions.push(Op::Throw { src: Vreg(0) });
        assert!(block.ends_unreachable());
        assert!(block.successors(Some(BlockId(1))).is_empty());
    }
}
