//! Exception and finally dispatch
//!
//! Cranelift has no landing pads, so every non-local transfer is built from
//! ordinary branches around the runtime helpers:
//!
//! - every call is followed by a pending check. Inside a try region the
//!   exceptional side branches to the clause's landing block; elsewhere it
//!   branches to the propagate block, which returns from the method and
//!   leaves the exception pending for the caller
//! - a raising helper that returns jumps to the same place unconditionally
//! - the landing block of a typed catch asks the runtime whether the token
//!   matches and otherwise falls through to the landing of the next clause in
//!   the chain, and after the last one to the propagate block
//! - entering a handler announces the clause, fetches the exception object
//!   and, for a finally body, keeps it for end-finally to raise again
//! - `call-handler` stores a nonzero site id into the finally indicator and
//!   jumps into the finally body; `end-finally` dispatches on the indicator
//!   through a jump table whose entries are completed once every site is known

use super::lower::{ExceptionalEdge, FinallySite, Flow, Lowerer};
use super::{CodegenError, CodegenResult};
use crate::codegen::runtime::RuntimeHelper;
use crate::ir::{ClauseKind, CorlibException, Region};
use cranelift::prelude::{types as ctypes, Block, InstBuilder, JumpTableData, Type, Value};
use cranelift_codegen::ir::BlockCall;
use cranelift_module::Module;
use log::trace;

impl<'a, 'f, M: Module> Lowerer<'a, 'f, M> {
    /// First clause offered an exception raised in the block being lowered
    pub(crate) fn unwind_clause(&self) -> Option<usize> {
        self.method.unwind_clause(self.current)
    }

    /// Call a runtime helper, returning its result if it has one
    pub(crate) fn call_helper(&mut self, helper: RuntimeHelper, args: &[Value]) -> CodegenResult<Option<Value>> {
        let id = self.tables.helper(self.module, helper, self.ptr, self.call_conv)?;
        let callee = self.module.declare_func_in_func(id, self.builder.func);
        let call = self.builder.ins().call(callee, args);
        Ok(self.builder.inst_results(call).first().copied())
    }

    fn helper_result(&mut self, helper: RuntimeHelper, args: &[Value]) -> CodegenResult<Value> {
        self.call_helper(helper, args)?
            .ok_or_else(|| CodegenError::InternalError(format!("{:?} helper has no result", helper)))
    }

    /// Where an exception raised under `clause` goes
    fn unwind_target(&mut self, clause: Option<usize>) -> CodegenResult<Block> {
        let Some(clause) = clause else {
            return Ok(self.propagate_block());
        };
        if clause >= self.method.clauses.len() {
            return Err(CodegenError::invariant(format!(
                "{} unwinds to missing clause {}",
                self.current, clause
            )));
        }
        if let Some(block) = self.ctx.landing(clause) {
            return Ok(block);
        }
        let block = self.builder.create_block();
        self.ctx.add_landing(clause, block);
        Ok(block)
    }

    fn propagate_block(&mut self) -> Block {
        if let Some(block) = self.ctx.propagate() {
            return block;
        }
        let block = self.builder.create_block();
        self.ctx.set_propagate(block);
        block
    }

    /// Call a raising helper. If it returns, the exception is pending and
    /// control goes to the enclosing handlers or out of the method.
    pub(crate) fn raise(&mut self, helper: RuntimeHelper, args: &[Value]) -> CodegenResult<()> {
        let clause = self.unwind_clause();
        self.call_helper(helper, args)?;
        let target = self.unwind_target(clause)?;
        self.builder.ins().jump(target, &[]);
        self.fill_landings()?;
        self.record_edge(clause, target, None);
        Ok(())
    }

    /// After a call: leave normal flow when an exception is pending
    pub(crate) fn emit_exception_check(&mut self) -> CodegenResult<()> {
        let clause = self.unwind_clause();
        let pending = self.helper_result(RuntimeHelper::ExceptionPending, &[])?;
        let target = self.unwind_target(clause)?;
        let continuation = self.builder.create_block();
        self.builder.ins().brif(pending, target, &[], continuation, &[]);
        self.fill_landings()?;
        self.continue_in(continuation)?;
        self.record_edge(clause, target, Some(continuation));
        Ok(())
    }

    fn record_edge(&mut self, clause: Option<usize>, landing: Block, continuation: Option<Block>) {
        let Some(clause) = clause else {
            return;
        };
        for index in self.method.clause_chain(clause) {
            self.ctx.count_edge(index);
        }
        let Some(handler) = self.method.clauses.get(clause).map(|c| c.handler_entry) else {
            return;
        };
        self.stats.exceptional_edges.push(ExceptionalEdge {
            from: self.current,
            clause,
            handler,
            landing,
            continuation,
        });
        trace!("{}: exceptional edge {} -> {}", self.method.name, self.current, handler);
    }

    /// Fill the landing blocks created since the last call; filling one may
    /// create the landing of the next clause in its chain
    fn fill_landings(&mut self) -> CodegenResult<()> {
        loop {
            let unfilled = self.ctx.take_unfilled();
            if unfilled.is_empty() {
                return Ok(());
            }
            for clause in unfilled {
                self.fill_landing(clause)?;
            }
        }
    }

    fn fill_landing(&mut self, index: usize) -> CodegenResult<()> {
        let method = self.method;
        let clause = method
            .clauses
            .get(index)
            .ok_or_else(|| CodegenError::invariant(format!("landing for missing clause {}", index)))?;
        let landing = self
            .ctx
            .landing(index)
            .ok_or_else(|| CodegenError::InternalError(format!("clause {} has no landing block", index)))?;
        self.builder.switch_to_block(landing);
        self.builder.set_cold_block(landing);

        if let (ClauseKind::Catch, Some(token)) = (clause.kind, clause.catch_token) {
            let next = self.unwind_target(clause.enclosing)?;
            let exception = self.helper_result(RuntimeHelper::ExceptionPending, &[])?;
            let token = self.int_const(ctypes::I32, i64::from(token));
            let matches = self.helper_result(RuntimeHelper::ExceptionMatches, &[exception, token])?;
            let enter = self.builder.create_block();
            self.builder.ins().brif(matches, enter, &[], next, &[]);
            self.builder.switch_to_block(enter);
            self.builder.set_cold_block(enter);
        }

        let clause_index = self.builder.ins().iconst(ctypes::I32, index as i64);
        self.call_helper(RuntimeHelper::BeginUnwind, &[clause_index])?;
        let exception = self.helper_result(RuntimeHelper::FetchException, &[])?;
        let handler = clause.handler_entry;
        if clause.kind == ClauseKind::Finally {
            let state = self.ctx.finally_mut(handler)?;
            let (indicator, saved) = (state.indicator, state.exception);
            self.builder.ins().stack_store(exception, saved, 0);
            let unwinding = self.builder.ins().iconst(ctypes::I32, 0);
            self.builder.ins().stack_store(unwinding, indicator, 0);
        }
        if let Some(var) = method.block(handler).and_then(|b| b.exception_var) {
            self.define_at(handler, var, exception)?;
        }
        let entry = self.ctx.primary(handler)?;
        self.builder.ins().jump(entry, &[]);
        trace!("{}: landing for clause {} enters {}", method.name, index, handler);
        Ok(())
    }

    /// Return from the method with the exception still pending. Results are
    /// zero; a hidden return buffer is left untouched.
    pub(crate) fn complete_propagate(&mut self) {
        let Some(block) = self.ctx.propagate() else {
            return;
        };
        self.builder.switch_to_block(block);
        self.builder.set_cold_block(block);
        let returns: Vec<Type> = self
            .builder
            .func
            .signature
            .returns
            .iter()
            .map(|p| p.value_type)
            .collect();
        let values: Vec<Value> = returns.into_iter().map(|ty| self.zero_value(ty)).collect();
        self.builder.ins().return_(&values);
    }

    /// Throw a core-library exception when `cond` is nonzero
    pub(crate) fn emit_cond_throw(&mut self, cond: Value, exception: CorlibException) -> CodegenResult<()> {
        let throw_block = self.builder.create_block();
        let continuation = self.builder.create_block();
        self.builder.ins().brif(cond, throw_block, &[], continuation, &[]);

        self.builder.switch_to_block(throw_block);
        self.builder.set_cold_block(throw_block);
        let token = self.int_const(ctypes::I32, i64::from(exception.type_token()));
        let pc = self.builder.ins().iconst(ctypes::I32, 0);
        self.raise(RuntimeHelper::ThrowCorlibException, &[token, pc])?;

        self.continue_in(continuation)
    }

    pub(crate) fn lower_throw(&mut self, exception: Value) -> CodegenResult<Flow> {
        self.raise(RuntimeHelper::ThrowException, &[exception])?;
        Ok(Flow::Terminated)
    }

    /// Enter the finally body at `target`, resuming in a new block afterwards
    pub(crate) fn lower_call_handler(&mut self, target: crate::ir::BlockId) -> CodegenResult<Flow> {
        let is_finally = self
            .method
            .clause_of_handler(target)
            .and_then(|c| self.method.clauses.get(c))
            .map(|c| c.kind == ClauseKind::Finally)
            .unwrap_or(false);
        if !is_finally {
            return Err(CodegenError::unsupported(format!(
                "call-handler into {} which is not a finally handler",
                target
            )));
        }

        let resume = self.builder.create_block();
        let state = self.ctx.finally_mut(target)?;
        state.resume_points.push(resume);
        let id = state.resume_points.len() as u32;
        let indicator = state.indicator;

        let site = self.builder.ins().iconst(ctypes::I32, i64::from(id));
        self.builder.ins().stack_store(site, indicator, 0);
        let entry = self.ctx.primary(target)?;
        self.builder.ins().jump(entry, &[]);

        self.continue_in(resume)?;
        self.stats.finally_sites.push(FinallySite {
            from: self.current,
            finally: target,
            id,
            resume,
        });
        Ok(Flow::Next)
    }

    /// Leave a finally body through its indicator
    pub(crate) fn lower_end_finally(&mut self) -> CodegenResult<Flow> {
        let method = self.method;
        let entry = match method.block(self.current).map(|b| b.region) {
            Some(Region::Handler(c)) => method
                .clauses
                .get(c)
                .filter(|clause| clause.kind == ClauseKind::Finally)
                .map(|clause| clause.handler_entry),
            _ => None,
        }
        .ok_or_else(|| {
            CodegenError::unsupported(format!("end-finally in {} outside a finally handler", self.current))
        })?;

        let indicator = self.ctx.finally_mut(entry)?.indicator;
        let id = self.builder.ins().stack_load(ctypes::I32, indicator, 0);
        let zero = self.builder.ins().iconst(ctypes::I32, 0);
        self.builder.ins().stack_store(zero, indicator, 0);

        let resume_unwind = self.builder.create_block();
        let default = BlockCall::new(resume_unwind, &[], &mut self.builder.func.dfg.value_lists);
        let table = self.builder.create_jump_table(JumpTableData::new(default, &[]));
        self.builder.ins().br_table(id, table);
        self.ctx.finally_mut(entry)?.dispatches.push((table, resume_unwind));

        self.builder.switch_to_block(resume_unwind);
        self.builder.set_cold_block(resume_unwind);
        let saved = self.ctx.finally_mut(entry)?.exception;
        let exception = self.builder.ins().stack_load(self.ptr, saved, 0);
        self.raise(RuntimeHelper::ResumeUnwind, &[exception])?;
        Ok(Flow::Terminated)
    }

    /// Every clause needs at least one exceptional edge into its handler
    pub(crate) fn check_handler_edges(&self) -> CodegenResult<()> {
        for (index, clause) in self.method.clauses.iter().enumerate() {
            if self.ctx.edge_count(index) == 0 {
                return Err(CodegenError::unsupported(format!(
                    "handler {} of clause {} has no exceptional edge",
                    clause.handler_entry, index
                )));
            }
        }
        Ok(())
    }

    /// Fill the dispatch tables: 0 resumes unwinding, k resumes site k
    pub(crate) fn complete_finally_dispatch(&mut self) {
        let fixes: Vec<_> = self
            .ctx
            .finally_blocks()
            .flat_map(|state| {
                state
                    .dispatches
                    .iter()
                    .map(move |(table, resume)| (*table, *resume, state.resume_points.clone()))
            })
            .collect();

        for (table, resume, points) in fixes {
            let pool = &mut self.builder.func.dfg.value_lists;
            let default = BlockCall::new(resume, &[], pool);
            let mut entries = vec![BlockCall::new(resume, &[], pool)];
            entries.extend(points.iter().map(|point| BlockCall::new(*point, &[], pool)));
            self.builder.func.dfg.jump_tables[table] = JumpTableData::new(default, &entries);
        }
    }
}
