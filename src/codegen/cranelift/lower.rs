//! Method lowering driver
//!
//! [`Lowerer`] owns everything needed to translate one method: the Cranelift
//! function under construction, the per-method [`MethodContext`], the phi
//! arena and the module-wide tables. The component modules (`phi`,
//! `exceptions`, `instructions`, `calls`, `memory`) extend it with their own
//! `impl` blocks; this module sequences them:
//!
//! 1. a prologue block receives the parameters, allocates homes, zeroes the
//!    finally indicators and jumps to the source entry block
//! 2. every phi gets a detached Cranelift value before any instruction runs
//! 3. live blocks are lowered in plan order, placing phis as blocks are entered
//! 4. handler edges are checked, phi edges wired, finally dispatch completed
//!    and the propagate block filled
//!
//! Every register read checks that its defining source block dominates the
//! reading one; a use the definition does not reach is an invariant
//! violation, whether or not the backend verifier runs.

use super::blocks::{self, BlockPlan};
use super::context::{Home, MethodContext};
use super::controller::LoweringPhase;
use super::phi::PhiArena;
use super::state::ModuleTables;
use super::types::{self, stack_type, LoweredType};
use super::{abi, CodegenError, CodegenResult};
use crate::config::LoweringConfig;
use crate::ir::{BlockId, ClauseKind, Method, Op, ReturnStorage, SourceType, TypeQueries, Vreg};
use cranelift::prelude::{types as ctypes, Block, InstBuilder, MemFlags, Type, Value};
use cranelift_codegen::ir::{Endianness, Function, UserFuncName};
use cranelift_codegen::isa::{CallConv, TargetFrontendConfig};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::Module;
use log::{debug, trace};

/// Exceptional edge created for a raising instruction under a clause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionalEdge {
    pub from: BlockId,
    /// First clause offered the exception
    pub clause: usize,
    pub handler: BlockId,
    /// Cranelift block that offers the exception to the clause chain
    pub landing: Block,
    /// Cranelift block where normal flow continues; none after a throw
    pub continuation: Option<Block>,
}

/// A call-handler site and the id it writes into the finally indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinallySite {
    pub from: BlockId,
    pub finally: BlockId,
    pub id: u32,
    pub resume: Block,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoweringStats {
    /// Cranelift blocks in the final layout
    pub materialized_blocks: usize,
    pub placed_phis: usize,
    pub dead_phis: usize,
    pub exceptional_edges: Vec<ExceptionalEdge>,
    pub finally_sites: Vec<FinallySite>,
}

/// A lowered (not yet compiled) method
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub func: Function,
    pub stats: LoweringStats,
}

/// How lowering continues after one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    /// The instruction consumed its successor as well
    Fused,
    /// The source block is complete
    Terminated,
}

pub(crate) struct Lowerer<'a, 'f, M: Module> {
    pub(crate) method: &'a Method,
    pub(crate) types: &'a dyn TypeQueries,
    pub(crate) module: &'a mut M,
    pub(crate) tables: &'a mut ModuleTables,
    pub(crate) builder: FunctionBuilder<'f>,
    pub(crate) ctx: MethodContext,
    pub(crate) phis: PhiArena,
    pub(crate) plan: BlockPlan,
    pub(crate) stats: LoweringStats,
    pub(crate) ptr: Type,
    pub(crate) call_conv: CallConv,
    pub(crate) frontend: TargetFrontendConfig,
    /// Source block being lowered
    pub(crate) current: BlockId,
    pub(crate) phase: LoweringPhase,
}

/// Lower `method` into a fresh Cranelift function
pub(crate) fn lower_method<M: Module>(
    module: &mut M,
    tables: &mut ModuleTables,
    builder_context: &mut FunctionBuilderContext,
    method: &Method,
    types: &dyn TypeQueries,
    config: &LoweringConfig,
) -> CodegenResult<LoweredFunction> {
    let frontend = module.target_config();
    let ptr = frontend.pointer_type();
    let signature = abi::build_signature(
        &method.signature,
        &method.call_info,
        types,
        &mut tables.type_cache,
        ptr,
        frontend.default_call_conv,
    )?;
    let mut func = Function::with_name_signature(
        UserFuncName::user(0, tables.attempts() as u32),
        signature,
    );

    debug!("lowering {} ({} blocks)", method.name, method.blocks.len());
    let stats = {
        let mut builder = FunctionBuilder::new(&mut func, builder_context);
        let primaries = method.blocks.iter().map(|_| builder.create_block()).collect();
        let lowerer = Lowerer {
            method,
            types,
            module,
            tables,
            builder,
            ctx: MethodContext::new(primaries),
            phis: PhiArena::default(),
            plan: blocks::plan(method),
            stats: LoweringStats::default(),
            ptr,
            call_conv: frontend.default_call_conv,
            frontend,
            current: BlockId(0),
            phase: LoweringPhase::Lowering,
        };
        lowerer.run()?
    };
    if config.dump_ir {
        debug!("{}:\n{}", method.name, func.display());
    }
    debug!(
        "lowered {}: {} blocks, {} phis ({} dead), {} exceptional edges",
        method.name,
        stats.materialized_blocks,
        stats.placed_phis,
        stats.dead_phis,
        stats.exceptional_edges.len()
    );
    Ok(LoweredFunction { func, stats })
}

impl<'a, 'f, M: Module> Lowerer<'a, 'f, M> {
    fn run(mut self) -> CodegenResult<LoweringStats> {
        if let Err(err) = self.lower_body() {
            self.phase = LoweringPhase::Failed(err.to_string());
            let parked = self.phis.park(self.builder.func);
            debug!("lowering of {} failed ({} phis parked): {}", self.method.name, parked, err);
            return Err(err);
        }
        self.builder.seal_all_blocks();
        let mut stats = self.stats;
        stats.materialized_blocks = self.builder.func.layout.blocks().count();
        self.builder.finalize();
        Ok(stats)
    }

    fn lower_body(&mut self) -> CodegenResult<()> {
        self.ensure_lowering()?;
        let prologue = self.builder.create_block();
        self.builder.append_block_params_for_function_params(prologue);
        self.builder.switch_to_block(prologue);

        self.create_phis()?;
        self.emit_prologue(prologue)?;

        for id in self.plan.order.clone() {
            self.lower_block(id)?;
        }
        for id in self.plan.retired.clone() {
            self.retire_phis(id);
        }

        self.check_handler_edges()?;
        self.wire_phis()?;
        self.complete_finally_dispatch();
        self.complete_propagate();
        Ok(())
    }

    /// Components refuse to run once lowering has failed
    pub(crate) fn ensure_lowering(&self) -> CodegenResult<()> {
        match &self.phase {
            LoweringPhase::Lowering => Ok(()),
            LoweringPhase::Failed(reason) => Err(CodegenError::InternalError(format!(
                "lowering resumed after failure: {}",
                reason
            ))),
        }
    }

    fn emit_prologue(&mut self, prologue: Block) -> CodegenResult<()> {
        let method = self.method;
        for var in &method.variables {
            let lowered = self.lower(&var.ty)?;
            match lowered {
                // Aggregate arguments get their home while unpacking
                LoweredType::Aggregate(_) if method.args.contains(&var.vreg) => {}
                LoweredType::Aggregate(layout) => {
                    let addr = self.alloc_home(layout.size);
                    self.ctx.set_home(var.vreg, Home::Address(addr));
                }
                LoweredType::Scalar(ty) | LoweredType::Vector(ty) if var.volatile || var.indirect => {
                    let slot = self.alloc_slot(ty.bytes());
                    self.ctx.set_home(
                        var.vreg,
                        Home::Slot {
                            slot,
                            ty,
                            unsigned: var.ty.is_unsigned(),
                        },
                    );
                }
                _ => {}
            }
        }

        self.unpack_params(prologue)?;

        for clause in &method.clauses {
            if clause.kind == ClauseKind::Finally {
                let indicator = self.alloc_slot(4);
                let zero = self.builder.ins().iconst(ctypes::I32, 0);
                self.builder.ins().stack_store(zero, indicator, 0);
                let exception = self.alloc_slot(self.ptr.bytes());
                self.ctx.set_finally(clause.handler_entry, indicator, exception)?;
            }
        }

        let entry = self.ctx.primary(BlockId(0))?;
        self.builder.ins().jump(entry, &[]);
        Ok(())
    }

    fn lower_block(&mut self, id: BlockId) -> CodegenResult<()> {
        self.ensure_lowering()?;
        let method = self.method;
        let block = method
            .block(id)
            .ok_or_else(|| CodegenError::invariant(format!("missing block {}", id)))?;
        trace!("{}: lowering {} ({} instructions)", method.name, id, block.instructions.len());

        self.current = id;
        let primary = self.ctx.primary(id)?;
        self.builder.switch_to_block(primary);
        self.ctx.set_tail(id, primary)?;
        self.place_phis(id)?;

        let ops = &block.instructions;
        let mut index = 0;
        while index < ops.len() {
            match self.lower_op(ops, index)? {
                Flow::Next => index += 1,
                Flow::Fused => index += 2,
                Flow::Terminated => return Ok(()),
            }
        }

        match method.next_block(id) {
            Some(next) => {
                let target = self.ctx.primary(next)?;
                self.builder.ins().jump(target, &[]);
            }
            None if matches!(method.call_info.ret, ReturnStorage::None) => {
                self.builder.ins().return_(&[]);
            }
            None => {
                return Err(CodegenError::unsupported(format!(
                    "{} falls off the end of {}",
                    id, method.name
                )))
            }
        }
        Ok(())
    }

    /// Lower a source type through the module's type memo
    pub(crate) fn lower(&mut self, ty: &SourceType) -> CodegenResult<LoweredType> {
        types::lower_type(ty, self.types, &mut self.tables.type_cache, self.ptr)
    }

    pub(crate) fn is_unsigned(&self, vreg: Vreg) -> bool {
        self.method
            .variable(vreg)
            .map(|v| v.ty.is_unsigned())
            .unwrap_or(false)
    }

    /// Convert between integer widths, float precisions or vector shapes
    pub(crate) fn convert(&mut self, value: Value, to: Type, unsigned: bool) -> CodegenResult<Value> {
        let from = self.builder.func.dfg.value_type(value);
        if from == to {
            return Ok(value);
        }
        let ins = self.builder.ins();
        let converted = if from.is_int() && to.is_int() {
            if from.bits() < to.bits() {
                if unsigned {
                    ins.uextend(to, value)
                } else {
                    ins.sextend(to, value)
                }
            } else {
                ins.ireduce(to, value)
            }
        } else if from == ctypes::F32 && to == ctypes::F64 {
            ins.fpromote(to, value)
        } else if from == ctypes::F64 && to == ctypes::F32 {
            ins.fdemote(to, value)
        } else if from.is_vector() && to.is_vector() && from.bits() == to.bits() {
            ins.bitcast(to, MemFlags::new().with_endianness(Endianness::Little), value)
        } else {
            return Err(CodegenError::invariant(format!("cannot convert {} to {}", from, to)));
        };
        Ok(converted)
    }

    /// Record the value of `vreg`, converting it for any phi it feeds and
    /// writing it through to memory when the register lives there
    pub(crate) fn define(&mut self, vreg: Vreg, value: Value) -> CodegenResult<()> {
        self.define_at(self.current, vreg, value)
    }

    /// [`Lowerer::define`] for a definition that belongs to source block `block`
    pub(crate) fn define_at(&mut self, block: BlockId, vreg: Vreg, value: Value) -> CodegenResult<()> {
        self.ctx.set_def(vreg, block);
        let unsigned = self.is_unsigned(vreg);
        let value = match self.ctx.expected_type(vreg) {
            Some(ty) => self.convert(value, ty, unsigned)?,
            None => value,
        };
        self.ctx.set_value(vreg, value);
        if let Some(Home::Slot { slot, ty, .. }) = self.ctx.home(vreg) {
            let stored = self.convert(value, ty, unsigned)?;
            self.builder.ins().stack_store(stored, slot, 0);
        }
        Ok(())
    }

    /// Current value of a scalar or vector register at stack width
    pub(crate) fn scalar(&mut self, vreg: Vreg) -> CodegenResult<Value> {
        if let Some(Home::Slot { slot, ty, unsigned }) = self.ctx.home(vreg) {
            let loaded = self.builder.ins().stack_load(ty, slot, 0);
            return self.convert(loaded, stack_type(ty), unsigned);
        }
        self.reaching_value(vreg, self.current)
    }

    /// SSA value of `vreg` as read in source block `at`
    pub(crate) fn reaching_value(&self, vreg: Vreg, at: BlockId) -> CodegenResult<Value> {
        let value = self.ctx.value(vreg)?;
        if let Some(def) = self.ctx.def_block(vreg) {
            if !self.plan.dominators.dominates(def, at) {
                return Err(CodegenError::invariant(format!(
                    "{} is defined in {}, which does not dominate its use in {}",
                    vreg, def, at
                )));
            }
        }
        Ok(value)
    }

    /// Value of `vreg` converted to `ty`
    pub(crate) fn operand(&mut self, vreg: Vreg, ty: Type) -> CodegenResult<Value> {
        let value = self.scalar(vreg)?;
        let unsigned = self.is_unsigned(vreg);
        self.convert(value, ty, unsigned)
    }

    /// Integer constant truncated to the width of `ty`
    pub(crate) fn int_const(&mut self, ty: Type, imm: i64) -> Value {
        let bits = ty.bits();
        let masked = if bits >= 64 { imm } else { imm & ((1i64 << bits) - 1) };
        self.builder.ins().iconst(ty, masked)
    }

    /// Continue the current source block in `block`
    pub(crate) fn continue_in(&mut self, block: Block) -> CodegenResult<()> {
        self.builder.switch_to_block(block);
        self.ctx.set_tail(self.current, block)
    }
}
