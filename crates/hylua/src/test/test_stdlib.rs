use std::cell::RefCell;
use std::rc::Rc;

use crate::{LuaErrorKind, LuaTable, LuaThread, LuaValue};

fn stdlib_thread() -> LuaThread {
    let mut thread = LuaThread::new();
    thread.open_stdlib().unwrap();
    thread
}

fn lib_fn(thread: &LuaThread, module: &str, name: &str) -> LuaValue {
    thread
        .get_global(module)
        .as_table()
        .map(|table| table.borrow().rawget_str(name))
        .unwrap_or(LuaValue::Nil)
}

#[test]
fn test_type_and_tostring() {
    let mut thread = stdlib_thread();

    let type_fn = thread.get_global("type");
    assert_eq!(
        thread.call_value(&type_fn, &[LuaValue::Nil]).unwrap(),
        LuaValue::string("nil")
    );
    assert_eq!(
        thread
            .call_value(&type_fn, &[LuaValue::table(LuaTable::new())])
            .unwrap(),
        LuaValue::string("table")
    );

    let tostring = thread.get_global("tostring");
    assert_eq!(
        thread
            .call_value(&tostring, &[LuaValue::Number(42.0)])
            .unwrap(),
        LuaValue::string("42")
    );
    assert_eq!(
        thread
            .call_value(&tostring, &[LuaValue::Number(0.5)])
            .unwrap(),
        LuaValue::string("0.5")
    );
    assert_eq!(
        thread
            .call_value(&tostring, &[LuaValue::Boolean(true)])
            .unwrap(),
        LuaValue::string("true")
    );
}

#[test]
fn test_tonumber() {
    let mut thread = stdlib_thread();
    let tonumber = thread.get_global("tonumber");

    assert_eq!(
        thread
            .call_value(&tonumber, &[LuaValue::string("3.5")])
            .unwrap(),
        LuaValue::Number(3.5)
    );
    assert_eq!(
        thread
            .call_value(&tonumber, &[LuaValue::string("0x10")])
            .unwrap(),
        LuaValue::Number(16.0)
    );
    assert_eq!(
        thread
            .call_value(
                &tonumber,
                &[LuaValue::string("ff"), LuaValue::Number(16.0)]
            )
            .unwrap(),
        LuaValue::Number(255.0)
    );
    assert_eq!(
        thread
            .call_value(&tonumber, &[LuaValue::string("not a number")])
            .unwrap(),
        LuaValue::Nil
    );
}

#[test]
fn test_select() {
    let mut thread = stdlib_thread();
    let select = thread.get_global("select");

    let count = thread
        .call_multret(
            &select,
            &[
                LuaValue::string("#"),
                LuaValue::Number(1.0),
                LuaValue::Number(2.0),
                LuaValue::Number(3.0),
            ],
        )
        .unwrap();
    assert_eq!(count, vec![LuaValue::Number(3.0)]);

    let tail = thread
        .call_multret(
            &select,
            &[
                LuaValue::Number(2.0),
                LuaValue::string("a"),
                LuaValue::string("b"),
                LuaValue::string("c"),
            ],
        )
        .unwrap();
    assert_eq!(tail, vec![LuaValue::string("b"), LuaValue::string("c")]);
}

#[test]
fn test_next_and_unpack() {
    let mut thread = stdlib_thread();

    let table = Rc::new(RefCell::new(LuaTable::new()));
    for index in 1..=3i64 {
        table
            .borrow_mut()
            .rawset_int(index, LuaValue::Number((index * 10) as f64));
    }

    let next = thread.get_global("next");
    let first = thread
        .call_multret(&next, &[LuaValue::Table(table.clone()), LuaValue::Nil])
        .unwrap();
    assert_eq!(first, vec![LuaValue::Number(1.0), LuaValue::Number(10.0)]);

    let unpack = thread.get_global("unpack");
    let values = thread
        .call_multret(&unpack, &[LuaValue::Table(table)])
        .unwrap();
    assert_eq!(
        values,
        vec![
            LuaValue::Number(10.0),
            LuaValue::Number(20.0),
            LuaValue::Number(30.0)
        ]
    );
}

#[test]
fn test_rawget_rawset_rawequal() {
    let mut thread = stdlib_thread();

    let table = LuaValue::table(LuaTable::new());
    let rawset = thread.get_global("rawset");
    let rawget = thread.get_global("rawget");
    let rawequal = thread.get_global("rawequal");

    thread
        .call_value(
            &rawset,
            &[table.clone(), LuaValue::string("k"), LuaValue::Number(9.0)],
        )
        .unwrap();
    assert_eq!(
        thread
            .call_value(&rawget, &[table.clone(), LuaValue::string("k")])
            .unwrap(),
        LuaValue::Number(9.0)
    );

    assert_eq!(
        thread
            .call_value(&rawequal, &[table.clone(), table.clone()])
            .unwrap(),
        LuaValue::Boolean(true)
    );
    assert_eq!(
        thread
            .call_value(
                &rawequal,
                &[table, LuaValue::table(LuaTable::new())]
            )
            .unwrap(),
        LuaValue::Boolean(false)
    );
}

#[test]
fn test_metatable_protection() {
    let mut thread = stdlib_thread();

    let setmetatable = thread.get_global("setmetatable");
    let getmetatable = thread.get_global("getmetatable");

    let table = LuaValue::table(LuaTable::new());
    let meta = LuaValue::table(LuaTable::new());
    if let LuaValue::Table(m) = &meta {
        m.borrow_mut()
            .rawset_str("__metatable", LuaValue::string("locked"));
    }

    thread
        .call_value(&setmetatable, &[table.clone(), meta.clone()])
        .unwrap();

    // __metatable overrides what getmetatable reports
    assert_eq!(
        thread.call_value(&getmetatable, &[table.clone()]).unwrap(),
        LuaValue::string("locked")
    );

    // And blocks further replacement
    let err = thread
        .call_value(&setmetatable, &[table, LuaValue::table(LuaTable::new())])
        .unwrap_err();
    assert!(err.message.contains("protected"), "{}", err.message);
}

#[test]
fn test_assert_failure_carries_cause() {
    let mut thread = stdlib_thread();
    let assert_fn = thread.get_global("assert");

    let err = thread
        .call_value(
            &assert_fn,
            &[LuaValue::Boolean(false), LuaValue::string("custom reason")],
        )
        .unwrap_err();
    assert_eq!(err.cause(), LuaValue::string("custom reason"));

    // Success passes the arguments through
    let passed = thread
        .call_multret(
            &assert_fn,
            &[LuaValue::Number(1.0), LuaValue::string("ignored")],
        )
        .unwrap();
    assert_eq!(passed.len(), 2);
}

#[test]
fn test_table_library() {
    let mut thread = stdlib_thread();

    let table = Rc::new(RefCell::new(LuaTable::new()));
    for index in 1..=3i64 {
        table
            .borrow_mut()
            .rawset_int(index, LuaValue::Number(index as f64));
    }
    let value = LuaValue::Table(table.clone());

    let insert = lib_fn(&thread, "table", "insert");
    let remove = lib_fn(&thread, "table", "remove");
    let concat = lib_fn(&thread, "table", "concat");
    let maxn = lib_fn(&thread, "table", "maxn");

    // Append form
    thread
        .call_value(&insert, &[value.clone(), LuaValue::Number(4.0)])
        .unwrap();
    assert_eq!(table.borrow().maxn(), 4);

    // Positional form shifts the tail up
    thread
        .call_value(
            &insert,
            &[value.clone(), LuaValue::Number(1.0), LuaValue::Number(0.0)],
        )
        .unwrap();
    assert_eq!(table.borrow().rawget_int(1), LuaValue::Number(0.0));
    assert_eq!(table.borrow().rawget_int(5), LuaValue::Number(4.0));

    let removed = thread.call_value(&remove, &[value.clone()]).unwrap();
    assert_eq!(removed, LuaValue::Number(4.0));
    assert_eq!(table.borrow().maxn(), 4);

    let joined = thread
        .call_value(&concat, &[value.clone(), LuaValue::string("-")])
        .unwrap();
    assert_eq!(joined, LuaValue::string("0-1-2-3"));

    assert_eq!(
        thread.call_value(&maxn, &[value]).unwrap(),
        LuaValue::Number(4.0)
    );
}

#[test]
fn test_math_library() {
    let mut thread = stdlib_thread();

    let floor = lib_fn(&thread, "math", "floor");
    assert_eq!(
        thread.call_value(&floor, &[LuaValue::Number(3.7)]).unwrap(),
        LuaValue::Number(3.0)
    );

    let max = lib_fn(&thread, "math", "max");
    assert_eq!(
        thread
            .call_value(
                &max,
                &[
                    LuaValue::Number(3.0),
                    LuaValue::Number(9.0),
                    LuaValue::Number(5.0)
                ]
            )
            .unwrap(),
        LuaValue::Number(9.0)
    );

    // math.fmod keeps the dividend's sign (unlike the % operator)
    let fmod = lib_fn(&thread, "math", "fmod");
    assert_eq!(
        thread
            .call_value(&fmod, &[LuaValue::Number(-5.0), LuaValue::Number(3.0)])
            .unwrap(),
        LuaValue::Number(-2.0)
    );

    let huge = lib_fn(&thread, "math", "huge");
    assert_eq!(huge, LuaValue::Number(f64::INFINITY));

    // random(n) stays within [1, n]
    let random = lib_fn(&thread, "math", "random");
    for _ in 0..50 {
        let sample = thread
            .call_value(&random, &[LuaValue::Number(6.0)])
            .unwrap();
        let n = sample.as_number().unwrap();
        assert!((1.0..=6.0).contains(&n), "out of range: {}", n);
        assert_eq!(n, n.trunc());
    }
}

#[test]
fn test_string_library() {
    let mut thread = stdlib_thread();

    let sub = lib_fn(&thread, "string", "sub");
    assert_eq!(
        thread
            .call_value(
                &sub,
                &[
                    LuaValue::string("hello world"),
                    LuaValue::Number(1.0),
                    LuaValue::Number(5.0)
                ]
            )
            .unwrap(),
        LuaValue::string("hello")
    );
    assert_eq!(
        thread
            .call_value(
                &sub,
                &[LuaValue::string("hello"), LuaValue::Number(-3.0)]
            )
            .unwrap(),
        LuaValue::string("llo")
    );

    let rep = lib_fn(&thread, "string", "rep");
    assert_eq!(
        thread
            .call_value(&rep, &[LuaValue::string("ab"), LuaValue::Number(3.0)])
            .unwrap(),
        LuaValue::string("ababab")
    );

    let upper = lib_fn(&thread, "string", "upper");
    assert_eq!(
        thread
            .call_value(&upper, &[LuaValue::string("mixed Case")])
            .unwrap(),
        LuaValue::string("MIXED CASE")
    );

    let byte = lib_fn(&thread, "string", "byte");
    assert_eq!(
        thread
            .call_value(&byte, &[LuaValue::string("A")])
            .unwrap(),
        LuaValue::Number(65.0)
    );

    let char_fn = lib_fn(&thread, "string", "char");
    assert_eq!(
        thread
            .call_value(
                &char_fn,
                &[
                    LuaValue::Number(76.0),
                    LuaValue::Number(117.0),
                    LuaValue::Number(97.0)
                ]
            )
            .unwrap(),
        LuaValue::string("Lua")
    );
}

#[test]
fn test_string_methods_via_metatable() {
    // The string library is wired as __index of the shared string
    // metatable, so indexing a string resolves its methods
    let mut thread = stdlib_thread();

    let method = thread
        .table_get(&LuaValue::string("abc"), &LuaValue::string("upper"))
        .unwrap();
    assert!(method.is_callable());

    let result = thread
        .call_value(&method, &[LuaValue::string("abc")])
        .unwrap();
    assert_eq!(result, LuaValue::string("ABC"));
}

#[test]
fn test_pairs_returns_iterator_triple() {
    let mut thread = stdlib_thread();

    let table = Rc::new(RefCell::new(LuaTable::new()));
    table.borrow_mut().rawset_int(1, LuaValue::Number(10.0));
    table.borrow_mut().rawset_int(2, LuaValue::Number(20.0));

    let pairs = thread.get_global("pairs");
    let triple = thread
        .call_multret(&pairs, &[LuaValue::Table(table.clone())])
        .unwrap();
    assert_eq!(triple.len(), 3);
    assert!(triple[0].is_callable());
    assert_eq!(triple[1], LuaValue::Table(table));
    assert_eq!(triple[2], LuaValue::Nil);

    // Drive the iterator to completion by hand
    let mut seen = 0;
    let mut control = LuaValue::Nil;
    loop {
        let step = thread
            .call_multret(&triple[0], &[triple[1].clone(), control.clone()])
            .unwrap();
        if step[0].is_nil() {
            break;
        }
        control = step[0].clone();
        seen += 1;
    }
    assert_eq!(seen, 2);
}

#[test]
fn test_bad_argument_kind() {
    let mut thread = stdlib_thread();
    let floor = lib_fn(&thread, "math", "floor");

    let err = thread
        .call_value(&floor, &[LuaValue::string("nan?")])
        .unwrap_err();
    assert_eq!(err.kind, LuaErrorKind::Argument);
}
