use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_vm::opcode::*;
use crate::test::ProtoBuilder;
use crate::{Coroutine, LuaThread, LuaValue, Prototype};

/// function body(a, b)
///   local s = a + b
///   local r = yield(s)
///   return r + 1
/// end
fn yielding_body() -> Rc<Prototype> {
    let mut builder = ProtoBuilder::new("body.lua").params(2).max_stack(6);
    let kyield = builder.string("yield");
    let k1 = builder.num(1.0);
    builder.emit(iabc(OP_ADD, 2, 0, 1));
    builder.emit(iabx(OP_GETGLOBAL, 3, kyield));
    builder.emit(iabc(OP_MOVE, 4, 2, 0));
    builder.emit(iabc(OP_CALL, 3, 2, 2)); // r = yield(s)
    builder.emit(iabc(OP_ADD, 3, 3, rk(k1)));
    builder.emit(iabc(OP_RETURN, 3, 2, 0));
    builder.build()
}

fn thread_with_yield_global() -> LuaThread {
    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();

    // Expose coroutine.yield as a plain global for compact test bytecode
    let coroutine_lib = thread.get_global("coroutine");
    let yield_fn = coroutine_lib
        .as_table()
        .map(|table| table.borrow().rawget_str("yield"))
        .unwrap_or(LuaValue::Nil);
    thread.set_global("yield", yield_fn);
    thread
}

#[test]
fn test_resume_yield_resume_value_flow() {
    let mut thread = thread_with_yield_global();

    let closure = thread.load_prototype(yielding_body());
    let co = Rc::new(RefCell::new(Coroutine::spawn(closure, thread.globals())));

    // First resume delivers the arguments; the coroutine yields a + b
    let first = thread
        .resume(&co, &[LuaValue::Number(1.0), LuaValue::Number(2.0)])
        .unwrap();
    assert_eq!(
        first,
        vec![LuaValue::Boolean(true), LuaValue::Number(3.0)]
    );
    assert_eq!(co.borrow().status_str(), "suspended");

    // Second resume: 3 becomes the return value of the in-script yield,
    // and the local s survived the suspension
    let second = thread.resume(&co, &[LuaValue::Number(3.0)]).unwrap();
    assert_eq!(
        second,
        vec![LuaValue::Boolean(true), LuaValue::Number(4.0)]
    );
    assert_eq!(co.borrow().status_str(), "dead");
}

#[test]
fn test_locals_survive_suspension() {
    // function body()
    //   local a = 11
    //   yield()
    //   return a
    // end
    let mut builder = ProtoBuilder::new("body.lua").max_stack(6);
    let k11 = builder.num(11.0);
    let kyield = builder.string("yield");
    builder.emit(iabx(OP_LOADK, 0, k11));
    builder.emit(iabx(OP_GETGLOBAL, 1, kyield));
    builder.emit(iabc(OP_CALL, 1, 1, 1));
    builder.emit(iabc(OP_RETURN, 0, 2, 0));

    let mut thread = thread_with_yield_global();
    let closure = thread.load_prototype(builder.build());
    let co = Rc::new(RefCell::new(Coroutine::spawn(closure, thread.globals())));

    let first = thread.resume(&co, &[]).unwrap();
    assert_eq!(first, vec![LuaValue::Boolean(true)]);

    let second = thread.resume(&co, &[]).unwrap();
    assert_eq!(
        second,
        vec![LuaValue::Boolean(true), LuaValue::Number(11.0)]
    );
}

#[test]
fn test_resume_dead_coroutine_is_illegal() {
    let mut builder = ProtoBuilder::new("body.lua").max_stack(2);
    builder.emit(iabc(OP_RETURN, 0, 1, 0));

    let mut thread = LuaThread::new();
    let closure = thread.load_prototype(builder.build());
    let co = Rc::new(RefCell::new(Coroutine::spawn(closure, thread.globals())));

    thread.resume(&co, &[]).unwrap();
    assert!(co.borrow().is_dead());

    let err = thread.resume(&co, &[]).unwrap_err();
    assert!(err.message.contains("dead coroutine"), "{}", err.message);
}

#[test]
fn test_error_in_coroutine_delivers_failure_triple() {
    // function body() local x = nil; return x.field end
    let mut builder = ProtoBuilder::new("body.lua").max_stack(4);
    let kfield = builder.string("field");
    builder.emit(iabc(OP_LOADNIL, 0, 0, 0));
    builder.emit(iabc(OP_GETTABLE, 1, 0, rk(kfield)));
    builder.emit(iabc(OP_RETURN, 1, 2, 0));

    let mut thread = LuaThread::new();
    let closure = thread.load_prototype(builder.build());
    let co = Rc::new(RefCell::new(Coroutine::spawn(closure, thread.globals())));

    let results = thread.resume(&co, &[]).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], LuaValue::Boolean(false));
    let cause = results[1].as_str().unwrap().to_string();
    assert!(cause.contains("attempt to index"), "{}", cause);
    let trace = results[2].as_str().unwrap().to_string();
    assert!(trace.contains("body.lua:2"), "{}", trace);

    assert!(co.borrow().is_dead());
}

#[test]
fn test_script_level_resume_and_yield() {
    // Pure in-script coroutine round trip, no host recursion:
    //   co = create(body); a = select 2 of resume(co, 5)
    //   b = select 2 of resume(co, 10); return a, b
    // where body(x) = local y = yield(x * 2); return y + x
    let mut body = ProtoBuilder::new("body.lua").params(1).max_stack(6);
    let k2 = body.num(2.0);
    let kyield = body.string("yield");
    body.emit(iabc(OP_MUL, 1, 0, rk(k2)));
    body.emit(iabx(OP_GETGLOBAL, 2, kyield));
    body.emit(iabc(OP_MOVE, 3, 1, 0));
    body.emit(iabc(OP_CALL, 2, 2, 2)); // y = yield(x * 2)
    body.emit(iabc(OP_ADD, 2, 2, 0));
    body.emit(iabc(OP_RETURN, 2, 2, 0));

    let mut main = ProtoBuilder::new("main.lua").max_stack(10);
    let kcreate = main.string("create");
    let kresume = main.string("resume");
    let kbody = main.string("body");
    let k5 = main.num(5.0);
    let k10 = main.num(10.0);

    // R0 = create(body)
    main.emit(iabx(OP_GETGLOBAL, 0, kcreate));
    main.emit(iabx(OP_GETGLOBAL, 1, kbody));
    main.emit(iabc(OP_CALL, 0, 2, 2));
    // R1, R2, R3 = resume(R0, 5)    -- ok, yielded value
    main.emit(iabx(OP_GETGLOBAL, 1, kresume));
    main.emit(iabc(OP_MOVE, 2, 0, 0));
    main.emit(iabx(OP_LOADK, 3, k5));
    main.emit(iabc(OP_CALL, 1, 3, 3));
    // R4 = R2 (first yielded value)
    main.emit(iabc(OP_MOVE, 4, 2, 0));
    // R1, R2, R3 = resume(R0, 10)
    main.emit(iabx(OP_GETGLOBAL, 1, kresume));
    main.emit(iabc(OP_MOVE, 2, 0, 0));
    main.emit(iabx(OP_LOADK, 3, k10));
    main.emit(iabc(OP_CALL, 1, 3, 3));
    // return R4, R2
    main.emit(iabc(OP_MOVE, 5, 2, 0));
    main.emit(iabc(OP_RETURN, 4, 3, 0));

    let mut thread = thread_with_yield_global();

    let coroutine_lib = thread.get_global("coroutine");
    let table = coroutine_lib.as_table().unwrap();
    let create = table.borrow().rawget_str("create");
    let resume = table.borrow().rawget_str("resume");
    thread.set_global("create", create);
    thread.set_global("resume", resume);

    let body_closure = thread.load_prototype(body.build());
    thread.set_global("body", LuaValue::closure(body_closure));

    let results = crate::test::run(&mut thread, main.build(), &[]).unwrap();
    // First yield: 5 * 2 = 10; final return: 10 + 5 = 15
    assert_eq!(results, vec![LuaValue::Number(10.0), LuaValue::Number(15.0)]);
}

#[test]
fn test_yield_outside_coroutine_raises() {
    let mut builder = ProtoBuilder::new("main.lua").max_stack(4);
    let kyield = builder.string("yield");
    builder.emit(iabx(OP_GETGLOBAL, 0, kyield));
    builder.emit(iabc(OP_CALL, 0, 1, 1));
    builder.emit(iabc(OP_RETURN, 0, 1, 0));

    let mut thread = thread_with_yield_global();
    let err = crate::test::run(&mut thread, builder.build(), &[]).unwrap_err();
    assert!(
        err.message.contains("yield outside"),
        "{}",
        err.message
    );
}

#[test]
fn test_wrapped_coroutine_returns_plain_values() {
    let mut thread = thread_with_yield_global();

    let body_closure = thread.load_prototype(yielding_body());
    thread.set_global("body", LuaValue::closure(body_closure));

    let coroutine_lib = thread.get_global("coroutine");
    let wrap = coroutine_lib
        .as_table()
        .map(|table| table.borrow().rawget_str("wrap"))
        .unwrap_or(LuaValue::Nil);

    let body = thread.get_global("body");
    let wrapped = thread.call_value(&wrap, &[body]).unwrap();

    // No success flag: the yielded value comes back bare
    let first = thread
        .call_multret(
            &wrapped,
            &[LuaValue::Number(4.0), LuaValue::Number(5.0)],
        )
        .unwrap();
    assert_eq!(first, vec![LuaValue::Number(9.0)]);

    let second = thread
        .call_multret(&wrapped, &[LuaValue::Number(1.0)])
        .unwrap();
    assert_eq!(second, vec![LuaValue::Number(2.0)]);
}

#[test]
fn test_wrapped_coroutine_reraises_failure() {
    // body() errors immediately
    let mut builder = ProtoBuilder::new("boom.lua").max_stack(4);
    let kfield = builder.string("field");
    builder.emit(iabc(OP_LOADNIL, 0, 0, 0));
    builder.emit(iabc(OP_GETTABLE, 1, 0, rk(kfield)));
    builder.emit(iabc(OP_RETURN, 1, 2, 0));

    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();

    let body_closure = thread.load_prototype(builder.build());

    let coroutine_lib = thread.get_global("coroutine");
    let wrap = coroutine_lib
        .as_table()
        .map(|table| table.borrow().rawget_str("wrap"))
        .unwrap_or(LuaValue::Nil);

    let wrapped = thread
        .call_value(&wrap, &[LuaValue::closure(body_closure)])
        .unwrap();

    let err = thread.call_multret(&wrapped, &[]).unwrap_err();
    assert!(
        err.message.contains("attempt to index"),
        "{}",
        err.message
    );
}

#[test]
fn test_status_transitions() {
    let mut thread = thread_with_yield_global();

    // body yields once
    let mut builder = ProtoBuilder::new("body.lua").max_stack(4);
    let kyield = builder.string("yield");
    builder.emit(iabx(OP_GETGLOBAL, 0, kyield));
    builder.emit(iabc(OP_CALL, 0, 1, 1));
    builder.emit(iabc(OP_RETURN, 0, 1, 0));

    let closure = thread.load_prototype(builder.build());
    let co = Rc::new(RefCell::new(Coroutine::spawn(closure, thread.globals())));

    assert_eq!(co.borrow().status_str(), "suspended");

    thread.resume(&co, &[]).unwrap();
    assert_eq!(co.borrow().status_str(), "suspended");

    thread.resume(&co, &[]).unwrap();
    assert_eq!(co.borrow().status_str(), "dead");
}
