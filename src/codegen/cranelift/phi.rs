//! Phi resolution
//!
//! Phis are resolved in three passes so that instructions may read a phi
//! before its block is lowered (loops) and edges may be wired after their
//! predecessors have been split:
//!
//! 1. every phi gets a detached block parameter, registered in the value or
//!    address table immediately
//! 2. when the owning block is entered the parameter is attached, unless no
//!    live predecessor exists, in which case the phi is dead
//! 3. after all blocks are lowered each binding appends its value to the
//!    branch at the end of the predecessor's tail block
//!
//! Parameters that never get attached are parked on an unlinked block when
//! lowering fails so no value is left dangling.

use super::context::Home;
use super::lower::Lowerer;
use super::types::{stack_type, LoweredType};
use super::{CodegenError, CodegenResult};
use crate::ir::{BlockId, Op, Vreg};
use cranelift::prelude::{Block, InstBuilder, Type, Value};
use cranelift_codegen::ir::Function;
use cranelift_module::Module;
use log::trace;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhiState {
    /// Created but its block has not been entered
    Pending,
    Placed,
    /// No live predecessor; never inserted
    Dead,
    Parked,
}

#[derive(Debug, Clone)]
pub(crate) struct PhiSlot {
    pub(crate) dst: Vreg,
    pub(crate) owner: BlockId,
    pub(crate) value: Value,
    pub(crate) ty: Type,
    /// Phi over the address of an aggregate
    pub(crate) aggregate: bool,
    pub(crate) args: Vec<Vreg>,
    pub(crate) state: PhiState,
    /// Live (predecessor, source) pairs
    pub(crate) bindings: Vec<(BlockId, Vreg)>,
}

/// Stable storage for every phi of a method
#[derive(Debug, Default)]
pub(crate) struct PhiArena {
    slots: Vec<PhiSlot>,
    by_block: HashMap<BlockId, Vec<usize>>,
}

impl PhiArena {
    /// Allocate a block parameter not attached to any block
    fn detached_value(func: &mut Function, ty: Type) -> Value {
        let holder = func.dfg.make_block();
        let value = func.dfg.append_block_param(holder, ty);
        func.dfg.remove_block_param(value);
        value
    }

    fn push(&mut self, slot: PhiSlot) {
        self.by_block.entry(slot.owner).or_default().push(self.slots.len());
        self.slots.push(slot);
    }

    fn in_block(&self, id: BlockId) -> Vec<usize> {
        self.by_block.get(&id).cloned().unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Move every parameter that is not attached onto an unlinked block
    pub(crate) fn park(&mut self, func: &mut Function) -> usize {
        let mut sink: Option<Block> = None;
        let mut parked = 0;
        for slot in &mut self.slots {
            if matches!(slot.state, PhiState::Placed | PhiState::Parked) {
                continue;
            }
            let block = *sink.get_or_insert_with(|| func.dfg.make_block());
            func.dfg.attach_block_param(block, slot.value);
            slot.state = PhiState::Parked;
            parked += 1;
        }
        parked
    }
}

impl<'a, 'f, M: Module> Lowerer<'a, 'f, M> {
    /// Pass 1: give every phi its value before any instruction is lowered
    pub(crate) fn create_phis(&mut self) -> CodegenResult<()> {
        let method = self.method;
        for block in &method.blocks {
            for op in &block.instructions {
                let Op::Phi { dst, ty, args } = op else {
                    continue;
                };
                if block.id == BlockId(0) || method.is_handler_entry(block.id) {
                    return Err(CodegenError::unsupported(format!(
                        "phi {} at the head of {}",
                        dst, block.id
                    )));
                }
                if args.len() != block.preds.len() {
                    return Err(CodegenError::invariant(format!(
                        "phi {} in {} has {} operands for {} predecessors",
                        dst,
                        block.id,
                        args.len(),
                        block.preds.len()
                    )));
                }

                let (ty, aggregate) = match self.lower(ty)? {
                    LoweredType::Void => {
                        return Err(CodegenError::invariant(format!("phi {} has no value type", dst)))
                    }
                    LoweredType::Scalar(t) => (stack_type(t), false),
                    LoweredType::Vector(t) => (t, false),
                    LoweredType::Aggregate(_) => (self.ptr, true),
                };
                let value = PhiArena::detached_value(self.builder.func, ty);
                if aggregate {
                    self.ctx.set_home(*dst, Home::Address(value));
                } else {
                    self.ctx.set_value(*dst, value);
                    self.ctx.set_def(*dst, block.id);
                    for arg in args {
                        self.ctx.expect_type(*arg, ty);
                    }
                }
                self.phis.push(PhiSlot {
                    dst: *dst,
                    owner: block.id,
                    value,
                    ty,
                    aggregate,
                    args: args.clone(),
                    state: PhiState::Pending,
                    bindings: Vec::new(),
                });
            }
        }
        trace!("{}: {} phis created", method.name, self.phis.len());
        Ok(())
    }

    /// Pass 2: attach the phis of `id`, which has just become current
    pub(crate) fn place_phis(&mut self, id: BlockId) -> CodegenResult<()> {
        let method = self.method;
        let Some(block) = method.block(id) else {
            return Ok(());
        };
        let primary = self.ctx.primary(id)?;
        for index in self.phis.in_block(id) {
            let slot = &self.phis.slots[index];
            let mut bindings: Vec<(BlockId, Vreg)> = Vec::new();
            for (pred, src) in block.preds.iter().zip(&slot.args) {
                let reachable = self.plan.is_live(*pred)
                    && method.block(*pred).map(|b| !b.ends_unreachable()).unwrap_or(false);
                if reachable && !bindings.iter().any(|(p, _)| p == pred) {
                    bindings.push((*pred, *src));
                }
            }
            let (dst, value, ty) = (slot.dst, slot.value, slot.ty);

            if bindings.is_empty() {
                trace!("{}: phi {} in {} is dead", method.name, dst, id);
                self.ctx.mark_dead(dst);
                self.phis.slots[index].state = PhiState::Dead;
                self.stats.dead_phis += 1;
                continue;
            }

            self.builder.func.dfg.attach_block_param(primary, value);
            let slot = &mut self.phis.slots[index];
            slot.bindings = bindings;
            slot.state = PhiState::Placed;
            self.stats.placed_phis += 1;

            if let Some(Home::Slot { slot, ty: mem_ty, unsigned }) = self.ctx.home(dst) {
                let stored = self.convert(value, mem_ty, unsigned)?;
                self.builder.ins().stack_store(stored, slot, 0);
            }
            trace!("{}: phi {} placed in {} as {}", method.name, dst, id, ty);
        }
        Ok(())
    }

    /// Phis of a block that is never lowered
    pub(crate) fn retire_phis(&mut self, id: BlockId) {
        for index in self.phis.in_block(id) {
            let dst = self.phis.slots[index].dst;
            self.ctx.mark_dead(dst);
            self.phis.slots[index].state = PhiState::Dead;
            self.stats.dead_phis += 1;
        }
    }

    /// Pass 3: append each bound value to the predecessor's branch
    pub(crate) fn wire_phis(&mut self) -> CodegenResult<()> {
        let placed: Vec<PhiSlot> = self
            .phis
            .slots
            .iter()
            .filter(|s| s.state == PhiState::Placed)
            .cloned()
            .collect();

        for slot in placed {
            let target = self.ctx.primary(slot.owner)?;
            for (pred, src) in &slot.bindings {
                let tail = self.ctx.tail(*pred)?;
                let value = if slot.aggregate {
                    self.ctx.address(*src)?
                } else {
                    self.reaching_value(*src, *pred)?
                };
                let actual = self.builder.func.dfg.value_type(value);
                if actual != slot.ty {
                    return Err(CodegenError::invariant(format!(
                        "phi {} expects {} but {} from {} is {}",
                        slot.dst, slot.ty, src, pred, actual
                    )));
                }
                self.append_edge_argument(tail, target, value).map_err(|_| {
                    CodegenError::invariant(format!(
                        "{} is a predecessor of {} but does not branch to it",
                        pred, slot.owner
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Add `value` to every edge from the end of `from` into `to`
    fn append_edge_argument(&mut self, from: Block, to: Block, value: Value) -> CodegenResult<()> {
        let func = &mut *self.builder.func;
        let inst = func
            .layout
            .last_inst(from)
            .ok_or_else(|| CodegenError::invariant(format!("{} has no terminator", from)))?;
        let dfg = &mut func.dfg;
        let mut matched = 0;
        for call in dfg.insts[inst].branch_destination_mut(&mut dfg.jump_tables) {
            if call.block(&dfg.value_lists) == to {
                call.append_argument(value, &mut dfg.value_lists);
                matched += 1;
            }
        }
        if matched == 0 {
            return Err(CodegenError::invariant(format!("{} does not branch to {}", from, to)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift::prelude::types;

    #[test]
    fn test_detached_values_can_be_parked() {
        let mut func = Function::new();
        let mut arena = PhiArena::default();
        for owner in [BlockId(1), BlockId(1), BlockId(2)] {
            let value = PhiArena::detached_value(&mut func, types::I32);
            assert!(!func.dfg.value_is_attached(value));
            arena.push(PhiSlot {
                dst: Vreg(owner.0),
                owner,
                value,
                ty: types::I32,
                aggregate: false,
                args: Vec::new(),
                state: PhiState::Pending,
                bindings: Vec::new(),
            });
        }
        assert_eq!(arena.in_block(BlockId(1)), vec![0, 1]);

        arena.slots[0].state = PhiState::Placed;
        assert_eq!(arena.park(&mut func), 2);
        assert!(func.dfg.value_is_attached(arena.slots[1].value));
        assert_eq!(arena.park(&mut func), 0);
    }
}
