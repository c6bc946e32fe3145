// Base library: print, type, pcall, error, iteration and raw table access.

use crate::lib_registry::LibraryModule;
use crate::lua_value::{LuaFunction, LuaValue};
use crate::lua_vm::{FrameHandle, LuaError, LuaResult, LuaThread};
use crate::lib_module;

pub fn create_basic_lib() -> LibraryModule {
    lib_module!("_G", {
        "print" => base_print,
        "assert" => base_assert,
        "error" => base_error,
        "pcall" => base_pcall,
        "type" => base_type,
        "tostring" => base_tostring,
        "tonumber" => base_tonumber,
        "next" => base_next,
        "inext" => base_inext,
        "pairs" => base_pairs,
        "ipairs" => base_ipairs,
        "select" => base_select,
        "rawget" => base_rawget,
        "rawset" => base_rawset,
        "rawequal" => base_rawequal,
        "setmetatable" => base_setmetatable,
        "getmetatable" => base_getmetatable,
        "setfenv" => base_setfenv,
        "getfenv" => base_getfenv,
        "unpack" => base_unpack,
    })
}

fn base_print(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let mut line = String::new();
    for index in 0..frame.arg_count() {
        if index > 0 {
            line.push('\t');
        }
        let text = thread.tostring(&frame.get(index))?;
        line.push_str(&text.raw_tostring());
    }
    println!("{}", line);
    Ok(0)
}

fn base_assert(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    if !frame.get_arg_or_nil(0).is_truthy() {
        let cause = match frame.get_arg_or_nil(1) {
            LuaValue::Nil => LuaValue::string("assertion failed!"),
            other => other,
        };
        return Err(LuaError::user(cause));
    }
    Ok(frame.arg_count())
}

fn base_error(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    Err(LuaError::user(frame.get_arg_or_nil(0)))
}

fn base_pcall(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let arg_count = frame.arg_count();
    if arg_count == 0 {
        return Err(LuaError::argument(
            "bad argument #1 (expected function, got no value)",
        ));
    }
    thread.pcall(arg_count - 1)
}

fn base_type(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let value = frame.get_arg(0)?;
    frame.push(LuaValue::string(value.type_name()))?;
    Ok(1)
}

fn base_tostring(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let value = frame.get_arg(0)?;
    let text = thread.tostring(&value)?;
    frame.push(text)?;
    Ok(1)
}

fn base_tonumber(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let value = frame.get_arg(0)?;
    let radix = frame.get_int_arg_or(1, 10)?;
    if !(2..=36).contains(&radix) {
        return Err(LuaError::argument("bad argument #2 (base out of range)"));
    }

    let parsed = match &value {
        LuaValue::Number(n) if radix == 10 => Some(*n),
        LuaValue::String(s) => {
            let text = s.trim();
            if radix == 10 {
                parse_decimal(text)
            } else {
                i64::from_str_radix(text, radix as u32).ok().map(|n| n as f64)
            }
        }
        _ => None,
    };

    match parsed {
        Some(n) => frame.push(LuaValue::Number(n))?,
        None => frame.push(LuaValue::Nil)?,
    }
    Ok(1)
}

fn parse_decimal(text: &str) -> Option<f64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    text.parse::<f64>().ok()
}

fn base_next(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let key = frame.get_arg_or_nil(1);

    let next = table.borrow().next_key(&key)?;
    match next {
        Some(next) => {
            let value = table.borrow().rawget(&next)?;
            frame.push(next)?;
            frame.push(value)?;
            Ok(2)
        }
        None => {
            frame.push(LuaValue::Nil)?;
            Ok(1)
        }
    }
}

fn base_inext(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let index = frame.get_int_arg_or(1, 0)? + 1;

    let value = table.borrow().rawget_int(index);
    if value.is_nil() {
        frame.push(LuaValue::Nil)?;
        Ok(1)
    } else {
        frame.push(LuaValue::Number(index as f64))?;
        frame.push(value)?;
        Ok(2)
    }
}

fn base_pairs(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;

    frame.push(thread.get_global("next"))?;
    frame.push(LuaValue::Table(table))?;
    frame.push(LuaValue::Nil)?;
    Ok(3)
}

fn base_ipairs(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;

    frame.push(thread.get_global("inext"))?;
    frame.push(LuaValue::Table(table))?;
    frame.push(LuaValue::Nil)?;
    Ok(3)
}

fn base_select(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let arg_count = frame.arg_count();
    let selector = frame.get_arg(0)?;

    if let Some(text) = selector.as_str() {
        if text.starts_with('#') {
            frame.push(LuaValue::Number((arg_count - 1) as f64))?;
            return Ok(1);
        }
    }

    let limit = frame.get_int_arg(0)?;
    if limit >= 1 && (limit as usize) < arg_count {
        // The trailing arguments are already in place on the frame
        return Ok(arg_count - limit as usize);
    }
    Ok(0)
}

fn base_rawget(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let key = frame.get_arg(1)?;

    let value = table.borrow().rawget(&key)?;
    frame.push(value)?;
    Ok(1)
}

fn base_rawset(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let key = frame.get_arg(1)?;
    let value = frame.get_arg_or_nil(2);

    table.borrow_mut().rawset(&key, value)?;
    Ok(0)
}

fn base_rawequal(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let a = frame.get_arg_or_nil(0);
    let b = frame.get_arg_or_nil(1);
    frame.push(LuaValue::Boolean(a == b))?;
    Ok(1)
}

fn base_setmetatable(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let meta = match frame.get_arg_or_nil(1) {
        LuaValue::Nil => None,
        LuaValue::Table(meta) => Some(meta),
        other => {
            return Err(LuaError::argument(format!(
                "bad argument #2 (expected table, got {})",
                other.type_name()
            )));
        }
    };

    let protected = table
        .borrow()
        .get_metatable()
        .map(|current| !current.borrow().rawget_str("__metatable").is_nil())
        .unwrap_or(false);
    if protected {
        return Err(LuaError::runtime("cannot change a protected metatable"));
    }

    table.borrow_mut().set_metatable(meta);
    frame.push(LuaValue::Table(table))?;
    Ok(1)
}

fn base_getmetatable(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;

    let meta = table.borrow().get_metatable();
    match meta {
        Some(meta) => {
            let override_value = meta.borrow().rawget_str("__metatable");
            if override_value.is_nil() {
                frame.push(LuaValue::Table(meta))?;
            } else {
                frame.push(override_value)?;
            }
        }
        None => frame.push(LuaValue::Nil)?,
    }
    Ok(1)
}

fn base_setfenv(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let closure = frame.get_closure_arg(0)?;
    let env = frame.get_table_arg(1)?;

    closure.set_env(env);
    Ok(0)
}

fn base_getfenv(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    match frame.get_arg_or_nil(0) {
        LuaValue::Function(LuaFunction::Closure(closure)) => {
            frame.push(LuaValue::Table(closure.env()))?;
        }
        _ => {
            frame.push(LuaValue::Table(frame.env()))?;
        }
    }
    Ok(1)
}

fn base_unpack(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;

    let start = frame.get_int_arg_or(1, 1)?;
    let limit = frame.get_int_arg_or(2, table.borrow().maxn())?;

    if limit == 0 {
        return Ok(0);
    }
    if start < 1 || limit < start {
        return Err(LuaError::runtime("invalid unpack bounds"));
    }

    let count = (limit - start + 1) as usize;
    frame.set_top(count)?;
    for offset in 0..count {
        let value = table.borrow().rawget_int(start + offset as i64);
        frame.set(offset, value)?;
    }
    Ok(count)
}
