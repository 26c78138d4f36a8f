//! Per-method compilation context
//!
//! Tracks, for one method being lowered, what each virtual register currently
//! denotes and how source blocks map onto Cranelift blocks. A context is
//! created when lowering starts and dropped when it ends; nothing in it is
//! shared between methods.

use super::{CodegenError, CodegenResult};
use crate::ir::{BlockId, Vreg};
use cranelift::prelude::{Block, Type, Value};
use cranelift_codegen::ir::{JumpTable, StackSlot};
use std::collections::HashMap;

/// Value-table entry of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Value(Value),
    /// Phi with no live predecessor; only unreachable code may read it
    Dead,
}

/// Address-table entry of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    /// Scalar kept in memory (volatile or address-taken)
    Slot { slot: StackSlot, ty: Type, unsigned: bool },
    /// Aggregate bytes at this address
    Address(Value),
}

/// Finally-block bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinallyState {
    /// Which call-handler site resumes when the finally returns
    pub indicator: StackSlot,
    /// Exception being unwound when the body was entered by raising
    pub exception: StackSlot,
    /// Continuations of the call-handler sites, in call order
    pub resume_points: Vec<Block>,
    /// Dispatch table of each end-finally and its unwind-resume block
    pub dispatches: Vec<(JumpTable, Block)>,
}

/// Mapping of one source block onto Cranelift blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDesc {
    /// Entry; every branch into the source block lands here
    pub primary: Block,
    /// Where instructions of the source block are currently appended
    pub tail: Block,
    pub finally: Option<FinallyState>,
}

/// Value table, address table and block descriptors of one method
#[derive(Debug, Default)]
pub struct MethodContext {
    values: HashMap<Vreg, Entry>,
    /// Source block holding each register's definition
    defs: HashMap<Vreg, BlockId>,
    homes: HashMap<Vreg, Home>,
    /// Type a register must have when it feeds a phi
    expected: HashMap<Vreg, Type>,
    blocks: Vec<BlockDesc>,
    /// Landing block of each clause: offers the pending exception to the
    /// clause and, failing that, to the clauses after it
    landings: HashMap<usize, Block>,
    /// Landings created but not yet filled
    unfilled: Vec<usize>,
    /// Returns from the method with an exception pending
    propagate: Option<Block>,
    /// Exceptional edges into each clause's handler
    edge_counts: HashMap<usize, usize>,
    /// Hidden return-buffer address
    pub vret: Option<Value>,
}

impl MethodContext {
    /// Create a context with one descriptor per source block
    pub fn new(primaries: Vec<Block>) -> Self {
        Self {
            blocks: primaries
                .into_iter()
                .map(|primary| BlockDesc {
                    primary,
                    tail: primary,
                    finally: None,
                })
                .collect(),
            ..Self::default()
        }
    }

    fn desc(&self, id: BlockId) -> CodegenResult<&BlockDesc> {
        self.blocks
            .get(id.index())
            .ok_or_else(|| CodegenError::invariant(format!("reference to missing block {}", id)))
    }

    fn desc_mut(&mut self, id: BlockId) -> CodegenResult<&mut BlockDesc> {
        self.blocks
            .get_mut(id.index())
            .ok_or_else(|| CodegenError::invariant(format!("reference to missing block {}", id)))
    }

    /// Branch target for source block `id`
    pub fn primary(&self, id: BlockId) -> CodegenResult<Block> {
        Ok(self.desc(id)?.primary)
    }

    /// Current tail of source block `id`
    pub fn tail(&self, id: BlockId) -> CodegenResult<Block> {
        Ok(self.desc(id)?.tail)
    }

    pub fn set_tail(&mut self, id: BlockId, tail: Block) -> CodegenResult<()> {
        self.desc_mut(id)?.tail = tail;
        Ok(())
    }

    pub fn primaries(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.iter().map(|d| d.primary)
    }

    pub fn set_finally(&mut self, id: BlockId, indicator: StackSlot, exception: StackSlot) -> CodegenResult<()> {
        self.desc_mut(id)?.finally = Some(FinallyState {
            indicator,
            exception,
            resume_points: Vec::new(),
            dispatches: Vec::new(),
        });
        Ok(())
    }

    pub fn finally_mut(&mut self, id: BlockId) -> CodegenResult<&mut FinallyState> {
        self.desc_mut(id)?
            .finally
            .as_mut()
            .ok_or_else(|| CodegenError::invariant(format!("{} is not a finally handler", id)))
    }

    /// Finally blocks and their state
    pub fn finally_blocks(&self) -> impl Iterator<Item = &FinallyState> + '_ {
        self.blocks.iter().filter_map(|d| d.finally.as_ref())
    }

    pub fn entry(&self, vreg: Vreg) -> Option<Entry> {
        self.values.get(&vreg).copied()
    }

    pub fn set_value(&mut self, vreg: Vreg, value: Value) {
        self.values.insert(vreg, Entry::Value(value));
    }

    pub fn set_def(&mut self, vreg: Vreg, block: BlockId) {
        self.defs.insert(vreg, block);
    }

    /// Source block that defines `vreg`
    pub fn def_block(&self, vreg: Vreg) -> Option<BlockId> {
        self.defs.get(&vreg).copied()
    }

    /// Retire a phi: neither its value nor its address may be read
    pub fn mark_dead(&mut self, vreg: Vreg) {
        self.values.insert(vreg, Entry::Dead);
        self.homes.remove(&vreg);
    }

    /// Materialized value of `vreg`; absent and dead entries are violations
    pub fn value(&self, vreg: Vreg) -> CodegenResult<Value> {
        match self.values.get(&vreg) {
            Some(Entry::Value(v)) => Ok(*v),
            Some(Entry::Dead) => Err(CodegenError::invariant(format!(
                "{} reads a phi with no live predecessor",
                vreg
            ))),
            None => Err(CodegenError::invariant(format!("{} used before definition", vreg))),
        }
    }

    pub fn home(&self, vreg: Vreg) -> Option<Home> {
        self.homes.get(&vreg).copied()
    }

    pub fn set_home(&mut self, vreg: Vreg, home: Home) {
        self.homes.insert(vreg, home);
    }

    /// Address of an aggregate register
    pub fn address(&self, vreg: Vreg) -> CodegenResult<Value> {
        match self.homes.get(&vreg) {
            Some(Home::Address(addr)) => Ok(*addr),
            Some(Home::Slot { .. }) => Err(CodegenError::invariant(format!(
                "{} is a scalar, not an aggregate",
                vreg
            ))),
            None => Err(CodegenError::invariant(format!("aggregate {} used before definition", vreg))),
        }
    }

    pub fn expect_type(&mut self, vreg: Vreg, ty: Type) {
        self.expected.insert(vreg, ty);
    }

    pub fn expected_type(&self, vreg: Vreg) -> Option<Type> {
        self.expected.get(&vreg).copied()
    }

    pub fn landing(&self, clause: usize) -> Option<Block> {
        self.landings.get(&clause).copied()
    }

    /// Record a new landing block that still has to be filled
    pub fn add_landing(&mut self, clause: usize, block: Block) {
        self.landings.insert(clause, block);
        self.unfilled.push(clause);
    }

    pub fn take_unfilled(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.unfilled)
    }

    pub fn propagate(&self) -> Option<Block> {
        self.propagate
    }

    pub fn set_propagate(&mut self, block: Block) {
        self.propagate = Some(block);
    }

    pub fn count_edge(&mut self, clause: usize) {
        *self.edge_counts.entry(clause).or_insert(0) += 1;
    }

    pub fn edge_count(&self, clause: usize) -> usize {
        self.edge_counts.get(&clause).copied().unwrap_or(0)
    }
}
