use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_vm::opcode::*;
use crate::test::{ProtoBuilder, run};
use crate::{Coroutine, LuaErrorKind, LuaThread, LuaValue, Prototype};

/// function boom() local x = nil; return x.field end
fn failing_proto() -> Rc<Prototype> {
    let mut builder = ProtoBuilder::new("boom.lua").max_stack(4);
    let kfield = builder.string("field");
    builder.emit(iabc(OP_LOADNIL, 0, 0, 0));
    builder.emit(iabc(OP_GETTABLE, 1, 0, rk(kfield)));
    builder.emit(iabc(OP_RETURN, 1, 2, 0));
    builder.build()
}

/// function outer() return boom() via a plain call, one level down end
fn nested_failing_proto(thread: &mut LuaThread) -> Rc<Prototype> {
    let boom = thread.load_prototype(failing_proto());
    thread.set_global("boom", LuaValue::closure(boom));

    let mut builder = ProtoBuilder::new("outer.lua").max_stack(4);
    let kboom = builder.string("boom");
    builder.emit(iabx(OP_GETGLOBAL, 0, kboom));
    builder.emit(iabc(OP_CALL, 0, 1, 2));
    builder.emit(iabc(OP_RETURN, 0, 2, 0));
    builder.build()
}

#[test]
fn test_index_error_propagates_to_host() {
    let mut thread = LuaThread::new();
    let err = run(&mut thread, failing_proto(), &[]).unwrap_err();
    assert_eq!(err.kind, LuaErrorKind::Type);
    assert!(err.message.contains("attempt to index"), "{}", err.message);
}

#[test]
fn test_pcall_catches_and_restores_frame_depth() {
    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();
    let proto = nested_failing_proto(&mut thread);
    let outer = thread.load_prototype(proto);

    let pcall = thread.get_global("pcall");
    let depth_before = thread.coroutine.borrow().frame_count();

    let results = thread
        .call_multret(&pcall, &[LuaValue::closure(outer)])
        .unwrap();

    assert_eq!(thread.coroutine.borrow().frame_count(), depth_before);
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], LuaValue::Boolean(false));

    let cause = results[1].as_str().unwrap().to_string();
    assert!(cause.contains("attempt to index"), "{}", cause);

    // One line per discarded frame: depth counter, symbol, source:line
    let trace = results[2].as_str().unwrap().to_string();
    assert!(trace.contains("boom.lua:2"), "{}", trace);
    assert!(trace.contains("1."), "{}", trace);
}

#[test]
fn test_pcall_success_prefixes_true() {
    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();

    let mut builder = ProtoBuilder::new("ok.lua").max_stack(2);
    let k = builder.num(7.0);
    builder.emit(iabx(OP_LOADK, 0, k));
    builder.emit(iabc(OP_RETURN, 0, 2, 0));
    let ok = thread.load_prototype(builder.build());

    let pcall = thread.get_global("pcall");
    let results = thread
        .call_multret(&pcall, &[LuaValue::closure(ok)])
        .unwrap();
    assert_eq!(
        results,
        vec![LuaValue::Boolean(true), LuaValue::Number(7.0)]
    );
}

#[test]
fn test_error_value_passes_through_pcall_intact() {
    // error({}) must deliver the identical table as the cause
    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();

    let marker = LuaValue::table(crate::LuaTable::new());
    thread.set_global("marker", marker.clone());

    // function() error(marker) end
    let mut builder = ProtoBuilder::new("raise.lua").max_stack(4);
    let kerror = builder.string("error");
    let kmarker = builder.string("marker");
    builder.emit(iabx(OP_GETGLOBAL, 0, kerror));
    builder.emit(iabx(OP_GETGLOBAL, 1, kmarker));
    builder.emit(iabc(OP_CALL, 0, 2, 1));
    builder.emit(iabc(OP_RETURN, 0, 1, 0));
    let raiser = thread.load_prototype(builder.build());

    let pcall = thread.get_global("pcall");
    let results = thread
        .call_multret(&pcall, &[LuaValue::closure(raiser)])
        .unwrap();

    assert_eq!(results[0], LuaValue::Boolean(false));
    assert_eq!(results[1], marker, "cause must be the identical table");
}

#[test]
fn test_pcall_closes_upvalues_below_boundary() {
    // The failing function first hands out a closure over its local, then
    // errors. After pcall, the cell must be closed and keep its value.
    //
    // function victim()
    //   local v = 123
    //   stash = function() return v end
    //   local x = nil
    //   return x.y
    // end
    let mut getter = ProtoBuilder::new("stash.lua").upvalues(1).max_stack(2);
    getter.emit(iabc(OP_GETUPVAL, 0, 0, 0));
    getter.emit(iabc(OP_RETURN, 0, 2, 0));

    let mut victim = ProtoBuilder::new("victim.lua").max_stack(6);
    let k123 = victim.num(123.0);
    let kstash = victim.string("stash");
    let ky = victim.string("y");
    let p_get = victim.child(getter.build());
    victim.emit(iabx(OP_LOADK, 0, k123));
    victim.emit(iabx(OP_CLOSURE, 1, p_get));
    victim.emit(iabc(OP_MOVE, 0, 0, 0)); // pseudo: capture R0
    victim.emit(iabx(OP_SETGLOBAL, 1, kstash));
    victim.emit(iabc(OP_LOADNIL, 2, 2, 0));
    victim.emit(iabc(OP_GETTABLE, 3, 2, rk(ky)));
    victim.emit(iabc(OP_RETURN, 3, 2, 0));

    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();
    let victim = thread.load_prototype(victim.build());

    let pcall = thread.get_global("pcall");
    let results = thread
        .call_multret(&pcall, &[LuaValue::closure(victim)])
        .unwrap();
    assert_eq!(results[0], LuaValue::Boolean(false));

    // No open upvalues may survive the unwind
    assert_eq!(thread.coroutine.borrow().open_upvalue_count(), 0);

    let stash = thread.get_global("stash");
    let v = thread.call_value(&stash, &[]).unwrap();
    assert_eq!(v, LuaValue::Number(123.0));
}

#[test]
fn test_argument_error_names_position_and_types() {
    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();

    let string_lib = thread.get_global("string");
    let len = string_lib
        .as_table()
        .map(|table| table.borrow().rawget_str("len"))
        .unwrap_or(LuaValue::Nil);

    let err = thread
        .call_value(&len, &[LuaValue::Number(5.0)])
        .unwrap_err();
    assert_eq!(err.kind, LuaErrorKind::Argument);
    assert!(err.message.contains("#1"), "{}", err.message);
    assert!(err.message.contains("string"), "{}", err.message);
    assert!(err.message.contains("number"), "{}", err.message);

    let err = thread.call_value(&len, &[]).unwrap_err();
    assert!(err.message.contains("no value"), "{}", err.message);
}

#[test]
fn test_root_coroutine_error_is_fatal_to_host() {
    let mut thread = LuaThread::new();
    let proto = nested_failing_proto(&mut thread);
    let outer = thread.load_prototype(proto);

    let err = thread
        .call_multret(&LuaValue::closure(outer), &[])
        .unwrap_err();
    assert_eq!(err.kind, LuaErrorKind::Type);

    // The coroutine survives for further host calls
    let mut ok = ProtoBuilder::new("ok.lua").max_stack(2);
    let k = ok.num(1.0);
    ok.emit(iabx(OP_LOADK, 0, k));
    ok.emit(iabc(OP_RETURN, 0, 2, 0));
    let results = run(&mut thread, ok.build(), &[]).unwrap();
    assert_eq!(results, vec![LuaValue::Number(1.0)]);
}

#[test]
fn test_arithmetic_type_error_names_operand() {
    // 1 + {}
    let mut builder = ProtoBuilder::new("arith.lua").max_stack(4);
    let k1 = builder.num(1.0);
    builder.emit(iabc(OP_NEWTABLE, 0, 0, 0));
    builder.emit(iabc(OP_ADD, 1, rk(k1), 0));
    builder.emit(iabc(OP_RETURN, 1, 2, 0));

    let mut thread = LuaThread::new();
    let err = run(&mut thread, builder.build(), &[]).unwrap_err();
    assert_eq!(err.kind, LuaErrorKind::Type);
    assert!(
        err.message.contains("attempt to perform arithmetic"),
        "{}",
        err.message
    );
    assert!(err.message.contains("table value"), "{}", err.message);
}

#[test]
fn test_value_stack_overflow_is_fatal() {
    let env = Rc::new(RefCell::new(crate::LuaTable::new()));
    let mut co = Coroutine::new(env);
    let err = co.set_top(crate::lua_vm::MAX_STACK_SIZE + 1).unwrap_err();
    assert_eq!(err.kind, LuaErrorKind::Overflow);
    assert!(err.message.contains("stack overflow"), "{}", err.message);
}
