//! Ahead-of-time object emission

mod common;

use common::*;
use methodjit::ir::{Callee, MethodBuilder, MethodSignature, Op, SourceType, TypeTable};
use methodjit::{AotBackend, CodegenError, Method, MethodOutcome};

/// `nint lookup() => helper(class_vtable)`
fn lookup(types: &TypeTable) -> Method {
    let mut b = MethodBuilder::new("lookup", MethodSignature::new(vec![], SourceType::I), types, PTR_BYTES);
    let (vtable, r) = (b.vreg(), b.vreg());
    b.push(Op::AotConst { dst: vtable, symbol: "class_vtable".into() });
    b.call(
        Some(r),
        Callee::Direct { symbol: "helper".into() },
        MethodSignature::new(vec![SourceType::I], SourceType::I),
        vec![vtable],
    );
    b.push(Op::SetRet { src: Some(r) });
    b.finish().expect("lookup")
}

#[test]
fn test_imports_become_deferred_stubs() {
    let types = TypeTable::new();
    let backend = AotBackend::new(config(), "test_object").expect("backend");

    let outcome = backend.compile(&lookup(&types), &types).expect("compile");
    let method = match outcome {
        MethodOutcome::Compiled(method) => method,
        MethodOutcome::NotLowerable(fallback) => panic!("unexpected fallback: {}", fallback),
    };
    assert_eq!(method.symbol, "lookup");
    assert!(method.size > 0);

    let mut stubs = backend.deferred_stubs().expect("stubs");
    stubs.sort_by(|a, b| a.target.cmp(&b.target));
    let names: Vec<(&str, &str, bool)> = stubs
        .iter()
        .map(|s| (s.target.as_str(), s.stub.as_str(), s.is_data))
        .collect();
    assert!(names.contains(&("class_vtable", "plt_class_vtable", true)));
    assert!(names.contains(&("helper", "plt_helper", false)));
}

#[test]
fn test_methods_in_the_object_call_each_other_directly() {
    let types = TypeTable::new();
    let backend = AotBackend::new(config(), "test_object").expect("backend");
    assert!(backend.compile(&sum_down(&types), &types).expect("compile").is_compiled());

    let mut b = MethodBuilder::new("calls_sum_down", MethodSignature::new(vec![], SourceType::I4), &types, PTR_BYTES);
    let (n, r) = (b.vreg(), b.vreg());
    b.push(Op::IConst { dst: n, value: 4 });
    b.call(
        Some(r),
        Callee::Direct { symbol: "sum_down".into() },
        MethodSignature::new(vec![SourceType::I4], SourceType::I4),
        vec![n],
    );
    b.push(Op::SetRet { src: Some(r) });
    assert!(backend.compile(&b.finish().expect("caller"), &types).expect("compile").is_compiled());

    let stubs = backend.deferred_stubs().expect("stubs");
    assert!(stubs.iter().all(|s| s.target != "sum_down"), "{:?}", stubs);
    assert!(backend.finish().is_ok());
}

#[test]
fn test_finished_object_is_written() {
    let types = TypeTable::new();
    let backend = AotBackend::new(config(), "test_object").expect("backend");
    for method in [answer(&types), sum_to(&types), guarded_add(&types)] {
        assert!(backend.compile(&method, &types).expect("compile").is_compiled());
    }

    let artifact = backend.finish().expect("finish");
    assert!(!artifact.object.is_empty());
    #[cfg(target_os = "linux")]
    assert_eq!(&artifact.object[..4], b"\x7fELF");
    assert!(artifact
        .stubs
        .iter()
        .any(|s| s.target == methodjit::RuntimeHelper::ThrowCorlibException.symbol()));

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("methods.o");
    artifact.write_to(&path).expect("write object");
    assert_eq!(std::fs::read(&path).expect("read back"), artifact.object);
}

#[test]
fn test_fallbacks_do_not_poison_the_artifact() {
    let types = TypeTable::new();
    let backend = AotBackend::new(config(), "test_object").expect("backend");

    let mut pinvoke = answer(&types);
    pinvoke.pinvoke = true;
    assert!(!backend.compile(&pinvoke, &types).expect("fallback").is_compiled());
    assert!(backend.compile(&add_i4(&types, "add", true), &types).expect("compile").is_compiled());
    assert!(backend.finish().is_ok());
}

#[test]
fn test_invariant_errors_surface() {
    let types = TypeTable::new();
    let backend = AotBackend::new(config(), "test_object").expect("backend");

    let mut b = MethodBuilder::new("undefined", MethodSignature::new(vec![], SourceType::I4), &types, PTR_BYTES);
    let never = b.vreg();
    b.push(Op::SetRet { src: Some(never) });
    let err = backend
        .compile(&b.finish().expect("method"), &types)
        .expect_err("undefined register");
    assert!(matches!(err, CodegenError::InvariantViolation(_)));
}
