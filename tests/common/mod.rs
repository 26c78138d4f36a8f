//! Sample methods and runtime hooks shared by the integration tests

#![allow(dead_code)]

use methodjit::codegen::runtime::{set_pending_exception, RuntimeHelper, RuntimeHooks};
use methodjit::ir::{
    BlockId, Callee, CheckedOp, ClauseKind, CompareKind, CompareRhs, Cond, CorlibException, IntBinOp,
    IntWidth, Method, MethodBuilder, MethodSignature, Op, Region, SourceType, TypeId, TypeTable,
};
use methodjit::{JitBackend, LoweringConfig};
use std::cell::Cell;

pub const PTR_BYTES: u32 = 8;

pub fn config() -> LoweringConfig {
    LoweringConfig {
        verify: true,
        ..LoweringConfig::default()
    }
}

pub fn jit(hooks: &RuntimeHooks) -> JitBackend {
    JitBackend::new(config(), hooks).expect("JIT backend should build for the host")
}

thread_local! {
    static THROWN: Cell<i32> = const { Cell::new(0) };
}

/// Raises by recording the exception as pending and returning
pub extern "C" fn record_corlib_throw(type_token: i32, _pc_offset: i32) {
    THROWN.with(|t| t.set(type_token));
    set_pending_exception(type_token as u32 as usize);
}

/// Type token of the last core-library exception raised on this thread
pub fn take_thrown() -> i32 {
    THROWN.with(|t| t.replace(0))
}

/// Doubles its argument; negative input raises
pub extern "C" fn may_fail(x: i32) -> i32 {
    if x < 0 {
        set_pending_exception(0xbad0);
        return 0;
    }
    x * 2
}

pub extern "C" fn touch(counter: *mut i32) {
    unsafe { *counter += 1 }
}

pub fn hooks() -> RuntimeHooks {
    RuntimeHooks::default()
        .with_helper(RuntimeHelper::ThrowCorlibException, record_corlib_throw as usize)
        .with_symbol("may_fail", may_fail as usize)
        .with_symbol("touch", touch as usize)
}

fn builder<'a>(name: &str, params: Vec<SourceType>, ret: SourceType, types: &'a TypeTable) -> MethodBuilder<'a> {
    MethodBuilder::new(name, MethodSignature::new(params, ret), types, PTR_BYTES)
}

/// `int answer() => 42`
pub fn answer(types: &TypeTable) -> Method {
    let mut b = builder("answer", vec![], SourceType::I4, types);
    let r = b.vreg();
    b.push(Op::IConst { dst: r, value: 42 });
    b.push(Op::SetRet { src: Some(r) });
    b.finish().expect("answer")
}

/// `int name(int a, int b) => a + b`, wrapping or checked
pub fn add_i4(types: &TypeTable, name: &str, checked: bool) -> Method {
    let mut b = builder(name, vec![SourceType::I4, SourceType::I4], SourceType::I4, types);
    let (lhs, rhs) = (b.arg(0), b.arg(1));
    let dst = b.vreg();
    if checked {
        b.push(Op::CheckedBinary {
            op: CheckedOp::Add,
            width: IntWidth::I32,
            unsigned: false,
            dst,
            lhs,
            rhs,
        });
    } else {
        b.push(Op::IntBinary {
            op: IntBinOp::Add,
            width: IntWidth::I32,
            dst,
            lhs,
            rhs,
        });
    }
    b.push(Op::SetRet { src: Some(dst) });
    b.finish().expect("add")
}

/// Protect block 0 with a catch clause whose handler is a new block
fn catch_block(b: &mut MethodBuilder<'_>, token: Option<u32>) -> BlockId {
    let handler = b.create_block();
    let clause = b.add_clause(ClauseKind::Catch, handler, token);
    b.set_region(BlockId(0), Region::Try(clause));
    b.set_region(handler, Region::Handler(clause));
    let exception = b.vreg();
    b.add_variable(exception, SourceType::Object, false, false);
    b.set_exception_var(handler, exception);
    handler
}

fn return_minus_one(b: &mut MethodBuilder<'_>, handler: BlockId) {
    b.switch_to(handler);
    b.push(Op::StartHandler);
    let minus_one = b.vreg();
    b.push(Op::IConst { dst: minus_one, value: -1 });
    b.push(Op::SetRet { src: Some(minus_one) });
}

/// `try { return checked(a + b); } catch (OverflowException) { return -1; }`
pub fn guarded_add(types: &TypeTable) -> Method {
    let mut b = builder("guarded_add", vec![SourceType::I4, SourceType::I4], SourceType::I4, types);
    let (lhs, rhs) = (b.arg(0), b.arg(1));
    let handler = catch_block(&mut b, Some(CorlibException::OverflowException.type_token()));

    b.switch_to(BlockId(0));
    let dst = b.vreg();
    b.push(Op::CheckedBinary {
        op: CheckedOp::Add,
        width: IntWidth::I32,
        unsigned: false,
        dst,
        lhs,
        rhs,
    });
    b.push(Op::SetRet { src: Some(dst) });

    return_minus_one(&mut b, handler);
    b.finish().expect("guarded_add")
}

/// `try { return callee(args); } catch (token) { return -1; }`, with a
/// catch-all clause when `token` is `None`
pub fn guarded_call(
    types: &TypeTable,
    name: &str,
    callee: &str,
    params: Vec<SourceType>,
    token: Option<u32>,
) -> Method {
    let mut b = builder(name, params.clone(), SourceType::I4, types);
    let args = b.args().to_vec();
    let handler = catch_block(&mut b, token);

    b.switch_to(BlockId(0));
    let r = b.vreg();
    b.call(
        Some(r),
        Callee::Direct { symbol: callee.to_string() },
        MethodSignature::new(params, SourceType::I4),
        args,
    );
    b.push(Op::SetRet { src: Some(r) });

    return_minus_one(&mut b, handler);
    b.finish().expect(name)
}

/// `try { return may_fail(x); } catch { return -1; }`
pub fn call_may_fail(types: &TypeTable) -> Method {
    guarded_call(types, "call_may_fail", "may_fail", vec![SourceType::I4], None)
}

/// ```text
/// try {
///     try { return checked(may_fail(x) + y); }
///     catch (OverflowException) { return -1; }
/// } catch { return -2; }
/// ```
///
/// Both clauses protect block 0; the overflow catch is offered first.
pub fn nested_catch(types: &TypeTable) -> Method {
    let mut b = builder("nested_catch", vec![SourceType::I4, SourceType::I4], SourceType::I4, types);
    let (x, y) = (b.arg(0), b.arg(1));
    let inner = b.create_block();
    let outer = b.create_block();
    let overflow = b.add_clause(
        ClauseKind::Catch,
        inner,
        Some(CorlibException::OverflowException.type_token()),
    );
    let any = b.add_clause(ClauseKind::Catch, outer, None);
    b.set_enclosing(overflow, any);
    b.set_region(BlockId(0), Region::Try(overflow));
    b.set_region(inner, Region::Handler(overflow));
    b.set_region(outer, Region::Handler(any));

    let (doubled, sum) = (b.vreg(), b.vreg());
    b.call(
        Some(doubled),
        Callee::Direct { symbol: "may_fail".into() },
        MethodSignature::new(vec![SourceType::I4], SourceType::I4),
        vec![x],
    );
    b.push(Op::CheckedBinary {
        op: CheckedOp::Add,
        width: IntWidth::I32,
        unsigned: false,
        dst: sum,
        lhs: doubled,
        rhs: y,
    });
    b.push(Op::SetRet { src: Some(sum) });

    return_minus_one(&mut b, inner);
    b.switch_to(outer);
    b.push(Op::StartHandler);
    let minus_two = b.vreg();
    b.push(Op::IConst { dst: minus_two, value: -2 });
    b.push(Op::SetRet { src: Some(minus_two) });
    b.finish().expect("nested_catch")
}

/// `try { touch(p); } finally { p[1] = 99; } return 7;`
///
/// `sites` call-handler instructions lead into the finally body.
pub fn with_finally(types: &TypeTable, name: &str, sites: usize) -> Method {
    let mut b = builder(name, vec![SourceType::Ptr], SourceType::I4, types);
    let p = b.arg(0);
    let exit = b.create_block();
    let finally = b.create_block();
    let clause = b.add_clause(ClauseKind::Finally, finally, None);
    b.set_region(BlockId(0), Region::Try(clause));
    b.set_region(finally, Region::Handler(clause));

    b.call(
        None,
        Callee::Direct { symbol: "touch".into() },
        MethodSignature::new(vec![SourceType::Ptr], SourceType::Void),
        vec![p],
    );
    for _ in 0..sites {
        b.push(Op::CallHandler { target: finally });
    }
    b.push(Op::Br { target: exit });

    b.switch_to(exit);
    let seven = b.vreg();
    b.push(Op::IConst { dst: seven, value: 7 });
    b.push(Op::SetRet { src: Some(seven) });

    b.switch_to(finally);
    b.push(Op::StoreImm {
        ty: methodjit::ir::MemType::I4,
        base: p,
        offset: 4,
        value: 99,
    });
    b.push(Op::EndFinally);
    b.finish().expect("with_finally")
}

/// ```text
/// try { touch(p); } finally { touch(p); }   // site 1
/// p[1] = 11;
/// ... finally again ...                      // site 2
/// p[2] = 22;
/// return 7;
/// ```
///
/// The two call-handler sites resume into different stores.
pub fn finally_two_sites(types: &TypeTable) -> Method {
    let mut b = builder("finally_two_sites", vec![SourceType::Ptr], SourceType::I4, types);
    let p = b.arg(0);
    let exit = b.create_block();
    let finally = b.create_block();
    let clause = b.add_clause(ClauseKind::Finally, finally, None);
    b.set_region(BlockId(0), Region::Try(clause));
    b.set_region(finally, Region::Handler(clause));

    let touch_sig = MethodSignature::new(vec![SourceType::Ptr], SourceType::Void);
    b.call(None, Callee::Direct { symbol: "touch".into() }, touch_sig.clone(), vec![p]);
    for (offset, value) in [(4, 11), (8, 22)] {
        b.push(Op::CallHandler { target: finally });
        b.push(Op::StoreImm {
            ty: methodjit::ir::MemType::I4,
            base: p,
            offset,
            value,
        });
    }
    b.push(Op::Br { target: exit });

    b.switch_to(exit);
    let seven = b.vreg();
    b.push(Op::IConst { dst: seven, value: 7 });
    b.push(Op::SetRet { src: Some(seven) });

    b.switch_to(finally);
    b.call(None, Callee::Direct { symbol: "touch".into() }, touch_sig, vec![p]);
    b.push(Op::EndFinally);
    b.finish().expect("finally_two_sites")
}

/// `int name(int x, int* p) { try { may_fail(x); } finally { touch(p); } return 7; }`
pub fn finally_around_may_fail(types: &TypeTable, name: &str) -> Method {
    let mut b = builder(name, vec![SourceType::I4, SourceType::Ptr], SourceType::I4, types);
    let (x, p) = (b.arg(0), b.arg(1));
    let exit = b.create_block();
    let finally = b.create_block();
    let clause = b.add_clause(ClauseKind::Finally, finally, None);
    b.set_region(BlockId(0), Region::Try(clause));
    b.set_region(finally, Region::Handler(clause));

    b.call(
        None,
        Callee::Direct { symbol: "may_fail".into() },
        MethodSignature::new(vec![SourceType::I4], SourceType::I4),
        vec![x],
    );
    b.push(Op::CallHandler { target: finally });
    b.push(Op::Br { target: exit });

    b.switch_to(exit);
    let seven = b.vreg();
    b.push(Op::IConst { dst: seven, value: 7 });
    b.push(Op::SetRet { src: Some(seven) });

    b.switch_to(finally);
    b.call(
        None,
        Callee::Direct { symbol: "touch".into() },
        MethodSignature::new(vec![SourceType::Ptr], SourceType::Void),
        vec![p],
    );
    b.push(Op::EndFinally);
    b.finish().expect(name)
}

/// `int sum_down(int n) => n <= 0 ? 0 : n + sum_down(n - 1)`
pub fn sum_down(types: &TypeTable) -> Method {
    let mut b = builder("sum_down", vec![SourceType::I4], SourceType::I4, types);
    let n = b.arg(0);
    let base = b.create_block();
    let recurse = b.create_block();
    b.push(Op::Compare {
        kind: CompareKind::I32,
        lhs: n,
        rhs: CompareRhs::Imm(0),
    });
    b.push(Op::CondBranch {
        cond: Cond::Le,
        if_true: base,
        if_false: recurse,
    });

    b.switch_to(base);
    let zero = b.vreg();
    b.push(Op::IConst { dst: zero, value: 0 });
    b.push(Op::SetRet { src: Some(zero) });

    b.switch_to(recurse);
    let (m, rest, total) = (b.vreg(), b.vreg(), b.vreg());
    b.push(Op::IntBinaryImm {
        op: IntBinOp::Add,
        width: IntWidth::I32,
        dst: m,
        lhs: n,
        imm: -1,
    });
    b.call(
        Some(rest),
        Callee::Direct { symbol: "sum_down".into() },
        MethodSignature::new(vec![SourceType::I4], SourceType::I4),
        vec![m],
    );
    b.push(Op::IntBinary {
        op: IntBinOp::Add,
        width: IntWidth::I32,
        dst: total,
        lhs: n,
        rhs: rest,
    });
    b.push(Op::SetRet { src: Some(total) });
    b.finish().expect("sum_down")
}

/// `int sum_to(int n) { int s = 0; for (int i = 0; i < n;) { i++; s += i; } return s; }`
pub fn sum_to(types: &TypeTable) -> Method {
    let mut b = builder("sum_to", vec![SourceType::I4], SourceType::I4, types);
    let n = b.arg(0);
    let header = b.create_block();
    let body = b.create_block();
    let exit = b.create_block();

    let (i0, s0) = (b.vreg(), b.vreg());
    b.push(Op::IConst { dst: i0, value: 0 });
    b.push(Op::IConst { dst: s0, value: 0 });

    let (i, s, i1, s1) = (b.vreg(), b.vreg(), b.vreg(), b.vreg());
    b.phi(header, i, SourceType::I4, &[(BlockId(0), i0), (body, i1)]);
    b.phi(header, s, SourceType::I4, &[(BlockId(0), s0), (body, s1)]);
    b.switch_to(header);
    b.push(Op::Compare {
        kind: CompareKind::I32,
        lhs: i,
        rhs: CompareRhs::Reg(n),
    });
    b.push(Op::CondBranch {
        cond: Cond::Ge,
        if_true: exit,
        if_false: body,
    });

    b.switch_to(body);
    b.push(Op::IntBinaryImm {
        op: IntBinOp::Add,
        width: IntWidth::I32,
        dst: i1,
        lhs: i,
        imm: 1,
    });
    b.push(Op::IntBinary {
        op: IntBinOp::Add,
        width: IntWidth::I32,
        dst: s1,
        lhs: s,
        rhs: i1,
    });
    b.push(Op::Br { target: header });

    b.switch_to(exit);
    b.push(Op::SetRet { src: Some(s) });
    b.finish().expect("sum_to")
}

/// Loads an aggregate of type `ty` from `src`, passes it through `callee`
/// and stores the result to `dst`
pub fn copy_through(types: &TypeTable, ty: TypeId, callee: &str) -> Method {
    let value_type = SourceType::ValueType(ty);
    let mut b = builder(
        &format!("copy_through_{}", callee),
        vec![SourceType::Ptr, SourceType::Ptr],
        SourceType::Void,
        types,
    );
    let (src, dst) = (b.arg(0), b.arg(1));
    let (arg, result) = (b.vreg(), b.vreg());
    b.add_variable(arg, value_type.clone(), false, false);
    b.add_variable(result, value_type.clone(), false, false);

    b.push(Op::LoadV {
        dst: arg,
        base: src,
        offset: 0,
        ty,
    });
    b.call(
        Some(result),
        Callee::Direct { symbol: callee.to_string() },
        MethodSignature::new(vec![value_type.clone()], value_type),
        vec![arg],
    );
    b.push(Op::StoreV {
        base: dst,
        offset: 0,
        src: result,
        ty,
    });
    b.push(Op::SetRet { src: None });
    b.finish().expect("copy_through")
}

/// Method whose single block is `ops` followed by a void return
pub fn void_method(types: &TypeTable, name: &str, params: Vec<SourceType>, ops: Vec<Op>) -> Method {
    let mut b = builder(name, params, SourceType::Void, types);
    for op in ops {
        b.push(op);
    }
    b.push(Op::SetRet { src: None });
    b.finish().expect("void method")
}
