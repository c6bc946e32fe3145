// String library subset: byte-indexed primitives, no pattern engine.

use crate::lib_registry::LibraryModule;
use crate::lua_value::LuaValue;
use crate::lua_vm::{FrameHandle, LuaError, LuaResult, LuaThread};
use crate::lib_module;

pub fn create_string_lib() -> LibraryModule {
    lib_module!("string", {
        "len" => string_len,
        "sub" => string_sub,
        "upper" => string_upper,
        "lower" => string_lower,
        "rep" => string_rep,
        "reverse" => string_reverse,
        "byte" => string_byte,
        "char" => string_char,
    })
}

/// Lua string positions: 1-based, negative counts from the end. Returns a
/// clamped `[start, end)` byte range.
fn resolve_range(len: usize, start: i64, stop: i64) -> (usize, usize) {
    let len = len as i64;

    let mut start = if start < 0 { len + start + 1 } else { start };
    if start < 1 {
        start = 1;
    }

    let mut stop = if stop < 0 { len + stop + 1 } else { stop };
    if stop > len {
        stop = len;
    }

    if start > stop {
        (0, 0)
    } else {
        ((start - 1) as usize, stop as usize)
    }
}

fn string_len(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let s = frame.get_str_arg(0)?;
    frame.push(LuaValue::Number(s.len() as f64))?;
    Ok(1)
}

fn string_sub(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let s = frame.get_str_arg(0)?;
    let start = frame.get_int_arg_or(1, 1)?;
    let stop = frame.get_int_arg_or(2, -1)?;

    let (from, to) = resolve_range(s.len(), start, stop);
    let slice = String::from_utf8_lossy(&s.as_bytes()[from..to]).into_owned();
    frame.push(LuaValue::string(&slice))?;
    Ok(1)
}

fn string_upper(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let s = frame.get_str_arg(0)?;
    frame.push(LuaValue::string(&s.to_uppercase()))?;
    Ok(1)
}

fn string_lower(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let s = frame.get_str_arg(0)?;
    frame.push(LuaValue::string(&s.to_lowercase()))?;
    Ok(1)
}

fn string_rep(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let s = frame.get_str_arg(0)?;
    let count = frame.get_int_arg(1)?;

    let repeated = if count > 0 {
        s.repeat(count as usize)
    } else {
        String::new()
    };
    frame.push(LuaValue::string(&repeated))?;
    Ok(1)
}

fn string_reverse(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let s = frame.get_str_arg(0)?;
    let reversed: String = s.chars().rev().collect();
    frame.push(LuaValue::string(&reversed))?;
    Ok(1)
}

fn string_byte(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let s = frame.get_str_arg(0)?;
    let start = frame.get_int_arg_or(1, 1)?;
    let stop = frame.get_int_arg_or(2, start)?;

    let (from, to) = resolve_range(s.len(), start, stop);
    let bytes = &s.as_bytes()[from..to];

    for byte in bytes {
        frame.push(LuaValue::Number(*byte as f64))?;
    }
    Ok(bytes.len())
}

fn string_char(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let mut bytes = Vec::with_capacity(frame.arg_count());
    for index in 0..frame.arg_count() {
        let code = frame.get_int_arg(index)?;
        if !(0..=255).contains(&code) {
            return Err(LuaError::argument(format!(
                "bad argument #{} (value out of range)",
                index + 1
            )));
        }
        bytes.push(code as u8);
    }

    let text = String::from_utf8_lossy(&bytes).into_owned();
    frame.push(LuaValue::string(&text))?;
    Ok(1)
}
