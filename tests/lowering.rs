//! Lowering outcomes: fallbacks, invariant errors and lowering statistics

mod common;

use common::*;
use methodjit::codegen::cranelift::unwind;
use methodjit::ir::{
    BlockId, Callee, ClauseKind, CompareKind, CompareRhs, Cond, ExceptionClause, MethodBuilder, MethodSignature,
    Op, Region, SourceType, TypeTable,
};
use methodjit::{CodegenError, LoweredFunction, LoweringConfig, Method, MethodOutcome};

fn fallback_reason(outcome: MethodOutcome<LoweredFunction>) -> String {
    match outcome {
        MethodOutcome::Compiled(_) => panic!("expected a fallback"),
        MethodOutcome::NotLowerable(fallback) => {
            assert!(fallback.do_not_retry);
            fallback.reason
        }
    }
}

fn lowered(outcome: MethodOutcome<LoweredFunction>) -> LoweredFunction {
    match outcome {
        MethodOutcome::Compiled(lowered) => lowered,
        MethodOutcome::NotLowerable(fallback) => panic!("unexpected fallback: {}", fallback),
    }
}

fn assert_falls_back(method: &Method, types: &TypeTable, needle: &str) {
    let backend = jit(&hooks());
    let reason = fallback_reason(backend.lower_only(method, types).expect("fallback is not an error"));
    assert!(reason.contains(needle), "{:?} should mention {:?}", reason, needle);
}

#[test]
fn test_method_level_fallbacks() {
    let types = TypeTable::new();

    let mut varargs = answer(&types);
    varargs.signature.varargs = true;
    assert_falls_back(&varargs, &types, "variadic");

    let mut lmf = answer(&types);
    lmf.saves_lmf = true;
    assert_falls_back(&lmf, &types, "LMF");

    let mut pinvoke = answer(&types);
    pinvoke.pinvoke = true;
    assert_falls_back(&pinvoke, &types, "pinvoke");

    let mut filter = guarded_add(&types);
    filter.clauses.push(ExceptionClause::new(ClauseKind::Filter, BlockId(1), None));
    assert_falls_back(&filter, &types, "Filter");
}

#[test]
fn test_unsupported_instructions_fall_back() {
    let types = TypeTable::new();

    let mut b = MethodBuilder::new("dynamic_alloca", MethodSignature::new(vec![SourceType::I4], SourceType::Void), &types, PTR_BYTES);
    let size = b.arg(0);
    let p = b.vreg();
    b.push(Op::Localloc { dst: p, size });
    b.push(Op::SetRet { src: None });
    assert_falls_back(&b.finish().expect("method"), &types, "dynamic size");

    let mut b = MethodBuilder::new("aot_const", MethodSignature::new(vec![], SourceType::I), &types, PTR_BYTES);
    let v = b.vreg();
    b.push(Op::AotConst { dst: v, symbol: "class_vtable".into() });
    b.push(Op::SetRet { src: Some(v) });
    assert_falls_back(&b.finish().expect("method"), &types, "ahead-of-time");

    let mut b = MethodBuilder::new(
        "interface_call",
        MethodSignature::new(vec![SourceType::Object], SourceType::Void),
        &types,
        PTR_BYTES,
    );
    let this = b.arg(0);
    let mut sig = MethodSignature::new(vec![], SourceType::Void);
    sig.has_this = true;
    b.call(None, Callee::Virtual { base: this, slot_offset: 16, interface: true }, sig, vec![this]);
    b.push(Op::SetRet { src: None });
    assert_falls_back(&b.finish().expect("method"), &types, "interface");

    let mut b = MethodBuilder::new("typed_ref", MethodSignature::new(vec![SourceType::TypedByRef], SourceType::Void), &types, PTR_BYTES);
    b.push(Op::SetRet { src: None });
    assert_falls_back(&b.finish().expect("method"), &types, "TypedByRef");
}

#[test]
fn test_unresolvable_call_falls_back_in_jit() {
    let types = TypeTable::new();
    let mut b = MethodBuilder::new("calls_nowhere", MethodSignature::new(vec![], SourceType::Void), &types, PTR_BYTES);
    b.call(None, Callee::Direct { symbol: "nowhere".into() }, MethodSignature::new(vec![], SourceType::Void), vec![]);
    b.push(Op::SetRet { src: None });
    assert_falls_back(&b.finish().expect("method"), &types, "cannot be resolved");
}

#[test]
fn test_handler_without_exceptional_edge_falls_back() {
    let types = TypeTable::new();
    // The protected block raises nothing, so the handler is never entered
    let mut b = MethodBuilder::new("quiet_try", MethodSignature::new(vec![], SourceType::I4), &types, PTR_BYTES);
    let handler = b.create_block();
    let clause = b.add_clause(ClauseKind::Catch, handler, None);
    b.set_region(BlockId(0), Region::Try(clause));
    b.set_region(handler, Region::Handler(clause));
    let (r, minus_one) = (b.vreg(), b.vreg());
    b.push(Op::IConst { dst: r, value: 1 });
    b.push(Op::SetRet { src: Some(r) });
    b.switch_to(handler);
    b.push(Op::StartHandler);
    b.push(Op::IConst { dst: minus_one, value: -1 });
    b.push(Op::SetRet { src: Some(minus_one) });
    assert_falls_back(&b.finish().expect("method"), &types, "no exceptional edge");
}

#[test]
fn test_phi_at_handler_entry_falls_back() {
    let types = TypeTable::new();
    let mut b = MethodBuilder::new("phi_handler", MethodSignature::new(vec![SourceType::I4], SourceType::I4), &types, PTR_BYTES);
    let x = b.arg(0);
    let handler = b.create_block();
    let clause = b.add_clause(ClauseKind::Catch, handler, None);
    b.set_region(BlockId(0), Region::Try(clause));
    b.set_region(handler, Region::Handler(clause));

    let r = b.vreg();
    b.call(
        Some(r),
        Callee::Direct { symbol: "may_fail".into() },
        MethodSignature::new(vec![SourceType::I4], SourceType::I4),
        vec![x],
    );
    b.push(Op::SetRet { src: Some(r) });

    let merged = b.vreg();
    b.phi(handler, merged, SourceType::I4, &[(BlockId(0), x)]);
    b.switch_to(handler);
    b.push(Op::SetRet { src: Some(merged) });
    assert_falls_back(&b.finish().expect("method"), &types, "phi");
}

#[test]
fn test_use_before_definition_is_an_error() {
    let types = TypeTable::new();
    let mut b = MethodBuilder::new("undefined", MethodSignature::new(vec![], SourceType::I4), &types, PTR_BYTES);
    let never = b.vreg();
    b.push(Op::SetRet { src: Some(never) });
    let method = b.finish().expect("method");

    let backend = jit(&hooks());
    let err = backend.lower_only(&method, &types).expect_err("undefined register");
    assert!(matches!(err, CodegenError::InvariantViolation(_)), "{:?}", err);
    assert_eq!(backend.rejection("undefined").expect("lock"), None);
}

#[test]
fn test_use_on_a_path_that_skips_the_definition_is_an_error() {
    let types = TypeTable::new();
    let mut b = MethodBuilder::new("one_armed", MethodSignature::new(vec![SourceType::I4], SourceType::I4), &types, PTR_BYTES);
    let x = b.arg(0);
    let left = b.create_block();
    let right = b.create_block();
    let join = b.create_block();
    b.push(Op::Compare {
        kind: CompareKind::I32,
        lhs: x,
        rhs: CompareRhs::Imm(0),
    });
    b.push(Op::CondBranch {
        cond: Cond::Gt,
        if_true: left,
        if_false: right,
    });

    // Defined only on the left arm, read after the arms merge
    let r = b.vreg();
    b.switch_to(left);
    b.push(Op::IConst { dst: r, value: 1 });
    b.push(Op::Br { target: join });
    b.switch_to(right);
    b.push(Op::Br { target: join });
    b.switch_to(join);
    b.push(Op::SetRet { src: Some(r) });

    let backend = jit(&hooks());
    let err = backend
        .lower_only(&b.finish().expect("method"), &types)
        .expect_err("definition does not dominate the use");
    match err {
        CodegenError::InvariantViolation(message) => {
            assert!(message.contains("does not dominate"), "{}", message)
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_phi_type_mismatch_is_an_error() {
    let types = TypeTable::new();
    let mut b = MethodBuilder::new("mismatch", MethodSignature::new(vec![], SourceType::I4), &types, PTR_BYTES);
    let join = b.create_block();
    let (d, r) = (b.vreg(), b.vreg());
    b.push(Op::R8Const { dst: d, value: 1.5 });
    b.phi(join, r, SourceType::I4, &[(BlockId(0), d)]);
    b.switch_to(join);
    b.push(Op::SetRet { src: Some(r) });
    let method = b.finish().expect("method");

    let backend = jit(&hooks());
    let err = backend.compile(&method, &types).expect_err("float into an int phi");
    assert!(matches!(err, CodegenError::InvariantViolation(_)), "{:?}", err);
}

#[test]
fn test_unreachable_phi_is_dead() {
    let types = TypeTable::new();
    let mut b = MethodBuilder::new("dead_loop", MethodSignature::new(vec![], SourceType::I4), &types, PTR_BYTES);
    let head = b.create_block();
    let tail = b.create_block();
    let (zero, x, y) = (b.vreg(), b.vreg(), b.vreg());
    b.push(Op::IConst { dst: zero, value: 0 });
    b.push(Op::SetRet { src: Some(zero) });

    b.phi(head, x, SourceType::I4, &[(tail, y)]);
    b.switch_to(head);
    b.push(Op::Br { target: tail });
    b.switch_to(tail);
    b.push(Op::IConst { dst: y, value: 1 });
    b.push(Op::Br { target: head });

    let backend = jit(&hooks());
    let lowered = lowered(backend.lower_only(&b.finish().expect("method"), &types).expect("lower"));
    assert_eq!(lowered.stats.dead_phis, 1);
    assert_eq!(lowered.stats.placed_phis, 0);
}

#[test]
fn test_finally_sites_are_numbered() {
    let types = TypeTable::new();
    let backend = jit(&hooks());
    let lowered = lowered(backend.lower_only(&with_finally(&types, "finally_twice", 2), &types).expect("lower"));

    let ids: Vec<u32> = lowered.stats.finally_sites.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(lowered.stats.finally_sites.iter().all(|s| s.finally == BlockId(2)));

    // The call to touch() can raise, which leads into the finally body
    assert_eq!(lowered.stats.exceptional_edges.len(), 1);
    assert_eq!(lowered.stats.exceptional_edges[0].handler, BlockId(2));

    let text = lowered.func.display().to_string();
    assert!(text.contains("br_table"), "{}", text);
}

#[test]
fn test_region_table_counts_landing_sites() {
    let types = TypeTable::new();
    let backend = jit(&hooks());
    let method = call_may_fail(&types);
    let lowered = lowered(backend.lower_only(&method, &types).expect("lower"));

    let regions = unwind::regions(&method, &lowered.stats);
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].kind, ClauseKind::Catch);
    assert_eq!(regions[0].catch_token, None);
    assert_eq!(regions[0].landing_sites, 1);
}

#[test]
fn test_fallback_is_sticky() {
    let types = TypeTable::new();
    let backend = jit(&hooks());
    let mut method = answer(&types);
    method.pinvoke = true;

    let first = fallback_reason(backend.lower_only(&method, &types).expect("first attempt"));
    assert_eq!(backend.rejection("answer").expect("lock").as_deref(), Some(first.as_str()));

    // Even a now-valid body is not lowered again under the same name
    method.pinvoke = false;
    let second = fallback_reason(backend.lower_only(&method, &types).expect("second attempt"));
    assert_eq!(first, second);
}

#[test]
fn test_method_limit_trips_the_breaker() {
    let types = TypeTable::new();
    let config = LoweringConfig {
        method_limit: Some(1),
        ..config()
    };
    let backend = methodjit::JitBackend::new(config, &hooks()).expect("backend");

    assert!(backend.compile(&answer(&types), &types).expect("first").is_compiled());
    let outcome = backend.compile(&add_i4(&types, "add", false), &types).expect("second");
    let reason = outcome.fallback().map(|f| f.reason.clone()).unwrap_or_default();
    assert!(reason.contains("limit"), "{:?}", reason);
}

#[test]
fn test_lowering_is_deterministic() {
    let types = TypeTable::new();
    let first = lowered(jit(&hooks()).lower_only(&sum_to(&types), &types).expect("lower"));
    let second = lowered(jit(&hooks()).lower_only(&sum_to(&types), &types).expect("lower"));
    assert_eq!(first.func.display().to_string(), second.func.display().to_string());
    assert_eq!(first.stats, second.stats);
}
