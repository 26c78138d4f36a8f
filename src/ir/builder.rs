//! Programmatic construction of source methods
//!
//! Front ends without a serialized form (and the test suites) build methods
//! through [`MethodBuilder`]. It allocates registers, classifies calling
//! conventions and derives the predecessor lists from the blocks' branches,
//! so phi operands can be given per predecessor instead of by position.

use super::callconv::CallInfo;
use super::opcode::{Callee, Op};
use super::types::{SourceType, TypeQueries};
use super::{
    exceptional_successors, BasicBlock, BlockId, ClauseKind, ExceptionClause, Method, MethodSignature,
    Region, Variable, Vreg,
};
use crate::codegen::{CodegenError, CodegenResult};
use std::collections::HashMap;

/// A phi whose operands are keyed by predecessor until the graph is known
struct PendingPhi {
    block: BlockId,
    dst: Vreg,
    ty: SourceType,
    incoming: Vec<(BlockId, Vreg)>,
}

pub struct MethodBuilder<'a> {
    name: String,
    signature: MethodSignature,
    call_info: CallInfo,
    types: &'a dyn TypeQueries,
    ptr_bytes: u32,
    blocks: Vec<BasicBlock>,
    clauses: Vec<ExceptionClause>,
    variables: Vec<Variable>,
    args: Vec<Vreg>,
    vret_addr: Option<Vreg>,
    phis: Vec<PendingPhi>,
    extra_edges: Vec<(BlockId, BlockId)>,
    current: BlockId,
    next_vreg: u32,
    saves_lmf: bool,
    pinvoke: bool,
}

impl<'a> MethodBuilder<'a> {
    /// Start a method; block 0 exists and is current
    pub fn new(
        name: &str,
        signature: MethodSignature,
        types: &'a dyn TypeQueries,
        ptr_bytes: u32,
    ) -> Self {
        let call_info = CallInfo::classify(&signature, types, ptr_bytes);
        let mut builder = Self {
            name: name.to_string(),
            signature,
            call_info,
            types,
            ptr_bytes,
            blocks: vec![BasicBlock::new(BlockId(0))],
            clauses: Vec::new(),
            variables: Vec::new(),
            args: Vec::new(),
            vret_addr: None,
            phis: Vec::new(),
            extra_edges: Vec::new(),
            current: BlockId(0),
            next_vreg: 0,
            saves_lmf: false,
            pinvoke: false,
        };

        for ty in builder.signature.arg_types() {
            let vreg = builder.vreg();
            builder.args.push(vreg);
            if ty.value_type().is_some() {
                builder.variables.push(Variable {
                    vreg,
                    ty,
                    volatile: false,
                    indirect: false,
                });
            }
        }
        if builder.call_info.uses_hidden_return() {
            builder.vret_addr = Some(builder.vreg());
        }
        builder
    }

    pub fn types(&self) -> &'a dyn TypeQueries {
        self.types
    }

    /// Allocate a fresh virtual register
    pub fn vreg(&mut self) -> Vreg {
        let vreg = Vreg(self.next_vreg);
        self.next_vreg += 1;
        vreg
    }

    /// Register receiving argument `index` (`this` is index 0 when present)
    ///
    /// # Panics
    ///
    /// Panics if the signature has no argument `index`; [`MethodBuilder::args`]
    /// gives checked access.
    pub fn arg(&self, index: usize) -> Vreg {
        match self.args.get(index) {
            Some(vreg) => *vreg,
            None => panic!("{} has {} arguments, not {}", self.name, self.args.len(), index + 1),
        }
    }

    /// Registers receiving the arguments, `this` first
    pub fn args(&self) -> &[Vreg] {
        &self.args
    }

    pub fn vret_addr(&self) -> Option<Vreg> {
        self.vret_addr
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id));
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Append an instruction to the current block
    pub fn push(&mut self, op: Op) {
        let index = self.current.index();
        self.blocks[index].instructions.push(op);
    }

    /// Append a call, classifying its calling convention
    pub fn call(&mut self, dst: Option<Vreg>, callee: Callee, signature: MethodSignature, args: Vec<Vreg>) {
        let call_info = CallInfo::classify(&signature, self.types, self.ptr_bytes);
        self.push(Op::Call {
            dst,
            callee,
            signature,
            call_info,
            args,
        });
    }

    pub fn set_region(&mut self, block: BlockId, region: Region) {
        self.blocks[block.index()].region = region;
    }

    pub fn set_exception_var(&mut self, block: BlockId, vreg: Vreg) {
        self.blocks[block.index()].exception_var = Some(vreg);
    }

    /// Declare storage requirements for a register
    pub fn add_variable(&mut self, vreg: Vreg, ty: SourceType, volatile: bool, indirect: bool) {
        if let Some(existing) = self.variables.iter_mut().find(|v| v.vreg == vreg) {
            existing.ty = ty;
            existing.volatile |= volatile;
            existing.indirect |= indirect;
            return;
        }
        self.variables.push(Variable {
            vreg,
            ty,
            volatile,
            indirect,
        });
    }

    /// Add an exception clause, returning its index
    pub fn add_clause(&mut self, kind: ClauseKind, handler_entry: BlockId, catch_token: Option<u32>) -> usize {
        self.clauses.push(ExceptionClause::new(kind, handler_entry, catch_token));
        self.clauses.len() - 1
    }

    /// Offer exceptions `clause` does not take to `outer` next
    pub fn set_enclosing(&mut self, clause: usize, outer: usize) {
        if let Some(c) = self.clauses.get_mut(clause) {
            c.enclosing = Some(outer);
        }
    }

    /// Add a phi at the head of `block`; operands are keyed by predecessor
    pub fn phi(&mut self, block: BlockId, dst: Vreg, ty: SourceType, incoming: &[(BlockId, Vreg)]) {
        self.phis.push(PendingPhi {
            block,
            dst,
            ty,
            incoming: incoming.to_vec(),
        });
    }

    /// Record a graph edge that no branch expresses
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.extra_edges.push((from, to));
    }

    pub fn set_saves_lmf(&mut self, saves_lmf: bool) {
        self.saves_lmf = saves_lmf;
    }

    pub fn set_pinvoke(&mut self, pinvoke: bool) {
        self.pinvoke = pinvoke;
    }

    pub fn finish(self) -> CodegenResult<Method> {
        let mut blocks = self.blocks;
        let count = blocks.len();

        let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); count];
        let add_pred = |preds: &mut Vec<Vec<BlockId>>, from: BlockId, to: BlockId| {
            if let Some(list) = preds.get_mut(to.index()) {
                if !list.contains(&from) {
                    list.push(from);
                }
            }
        };
        for block in &blocks {
            let next = if block.id.index() + 1 < count {
                Some(BlockId(block.id.0 + 1))
            } else {
                None
            };
            for succ in block.successors(next) {
                add_pred(&mut preds, block.id, succ);
            }
            for handler in exceptional_successors(block, &self.clauses) {
                add_pred(&mut preds, block.id, handler);
            }
        }
        for (from, to) in &self.extra_edges {
            add_pred(&mut preds, *from, *to);
        }
        for (block, list) in blocks.iter_mut().zip(preds) {
            block.preds = list;
        }

        // Phis go to the block head in declaration order
        let mut heads: HashMap<BlockId, Vec<Op>> = HashMap::new();
        for phi in self.phis {
            let block = blocks
                .get(phi.block.index())
                .ok_or_else(|| CodegenError::invariant(format!("phi {} in missing block {}", phi.dst, phi.block)))?;
            let mut args = Vec::with_capacity(block.preds.len());
            for pred in &block.preds {
                let (_, vreg) = phi
                    .incoming
                    .iter()
                    .find(|(from, _)| from == pred)
                    .ok_or_else(|| {
                        CodegenError::invariant(format!(
                            "phi {} in {} has no operand for predecessor {}",
                            phi.dst, phi.block, pred
                        ))
                    })?;
                args.push(*vreg);
            }
            heads.entry(phi.block).or_default().push(Op::Phi {
                dst: phi.dst,
                ty: phi.ty,
                args,
            });
        }
        for (id, mut ops) in heads {
            let block = &mut blocks[id.index()];
            ops.append(&mut block.instructions);
            block.instructions = ops;
        }

        Ok(Method {
            name: self.name,
            signature: self.signature,
            call_info: self.call_info,
            blocks,
            clauses: self.clauses,
            variables: self.variables,
            args: self.args,
            vret_addr: self.vret_addr,
            saves_lmf: self.saves_lmf,
            pinvoke: self.pinvoke,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::opcode::{CompareKind, CompareRhs, Cond};
    use crate::ir::types::TypeTable;

    #[test]
    fn test_preds_follow_branches() {
        let types = TypeTable::new();
        let sig = MethodSignature::new(vec![SourceType::I4], SourceType::I4);
        let mut b = MethodBuilder::new("select", sig, &types, 8);
        let x = b.arg(0);
        let then_bb = b.create_block();
        let else_bb = b.create_block();
        let join = b.create_block();
        b.push(Op::Compare { kind: CompareKind::I32, lhs: x, rhs: CompareRhs::Imm(0) });
        b.push(Op::CondBranch { cond: Cond::Gt, if_true: then_bb, if_false: else_bb });

        let one = b.vreg();
        let two = b.vreg();
        b.switch_to(then_bb);
        b.push(Op::IConst { dst: one, value: 1 });
        b.push(Op::Br { target: join });
        b.switch_to(else_bb);
        b.push(Op::IConst { dst: two, value: 2 });

        let result = b.vreg();
        b.phi(join, result, SourceType::I4, &[(else_bb, two), (then_bb, one)]);
        b.switch_to(join);
        b.push(Op::SetRet { src: Some(result) });

        let method = b.finish().expect("method should build");
        let join_block = &method.blocks[join.index()];
        assert_eq!(join_block.preds, vec![then_bb, else_bb]);
        assert_eq!(
            join_block.instructions[0],
            Op::Phi { dst: result, ty: SourceType::I4, args: vec![one, two] }
        );
    }

    #[test]
    fn test_missing_phi_operand_is_rejected() {
        let types = TypeTable::new();
        let sig = MethodSignature::new(vec![], SourceType::I4);
        let mut b = MethodBuilder::new("broken", sig, &types, 8);
        let next = b.create_block();
        let v = b.vreg();
        let dst = b.vreg();
        b.push(Op::IConst { dst: v, value: 0 });
        b.phi(next, dst, SourceType::I4, &[]);
        let err = b.finish().expect_err("phi without operands must fail");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_args_are_checked() {
        let types = TypeTable::new();
        let mut sig = MethodSignature::new(vec![SourceType::I4], SourceType::Void);
        sig.has_this = true;
        let b = MethodBuilder::new("instance", sig, &types, 8);
        assert_eq!(b.args().len(), 2);
        assert_eq!(b.args().get(1).copied(), Some(b.arg(1)));
        assert_eq!(b.args().get(2), None);
    }

    #[test]
    #[should_panic(expected = "has 1 arguments, not 2")]
    fn test_missing_arg_panics_with_context() {
        let types = TypeTable::new();
        let sig = MethodSignature::new(vec![SourceType::I4], SourceType::Void);
        MethodBuilder::new("unary", sig, &types, 8).arg(1);
    }

    #[test]
    fn test_enclosing_clause_adds_handler_preds() {
        let types = TypeTable::new();
        let sig = MethodSignature::new(vec![], SourceType::Void);
        let mut b = MethodBuilder::new("nested", sig, &types, 8);
        let inner = b.create_block();
        let outer = b.create_block();
        let exit = b.create_block();
        let first = b.add_clause(ClauseKind::Catch, inner, Some(0x0100_0001));
        let second = b.add_clause(ClauseKind::Catch, outer, None);
        b.set_enclosing(first, second);
        b.set_region(BlockId(0), Region::Try(first));
        b.set_region(inner, Region::Handler(first));
        b.set_region(outer, Region::Handler(second));

        b.call(None, Callee::Direct { symbol: "work".into() }, MethodSignature::new(vec![], SourceType::Void), vec![]);
        b.push(Op::Br { target: exit });
        for handler in [inner, outer] {
            b.switch_to(handler);
            b.push(Op::Br { target: exit });
        }
        b.switch_to(exit);
        b.push(Op::SetRet { src: None });

        let method = b.finish().expect("method should build");
        assert_eq!(method.blocks[inner.index()].preds, vec![BlockId(0)]);
        assert_eq!(method.blocks[outer.index()].preds, vec![BlockId(0)]);
        assert_eq!(method.clause_chain(first), vec![first, second]);
    }

    #[test]
    fn test_hidden_return_allocates_vret() {
        let mut types = TypeTable::new();
        let big = types.add_struct("Big", 32, 8);
        let sig = MethodSignature::new(vec![], SourceType::ValueType(big));
        let b = MethodBuilder::new("make_big", sig, &types, 8);
        assert!(b.vret_addr().is_some());
    }
}
