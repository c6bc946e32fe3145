// Table library, built on the raw array-list shift operations.

use crate::lib_registry::LibraryModule;
use crate::lua_value::LuaValue;
use crate::lua_vm::{FrameHandle, LuaError, LuaResult, LuaThread};
use crate::lib_module;

pub fn create_table_lib() -> LibraryModule {
    lib_module!("table", {
        "insert" => table_insert,
        "remove" => table_remove,
        "concat" => table_concat,
        "maxn" => table_maxn,
    })
}

fn table_insert(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;

    match frame.arg_count() {
        2 => {
            // table.insert(t, value) appends at the border
            let value = frame.get(1);
            let index = table.borrow().maxn() + 1;
            table.borrow_mut().insert(value, index);
        }
        3 => {
            let index = frame.get_int_arg(1)?;
            let value = frame.get(2);
            table.borrow_mut().insert(value, index);
        }
        _ => {
            return Err(LuaError::argument("wrong number of arguments to 'insert'"));
        }
    }
    Ok(0)
}

fn table_remove(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let index = {
        let border = table.borrow().maxn();
        frame.get_int_arg_or(1, border)?
    };

    let removed = table.borrow_mut().remove(index);
    frame.push(removed)?;
    Ok(1)
}

fn table_concat(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let separator = match frame.get_arg_or_nil(1) {
        LuaValue::Nil => String::new(),
        other => other
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LuaError::argument("bad argument #2 (expected string)"))?,
    };
    let start = frame.get_int_arg_or(2, 1)?;
    let stop = {
        let border = table.borrow().maxn();
        frame.get_int_arg_or(3, border)?
    };

    let mut buffer = String::new();
    for index in start..=stop {
        let value = table.borrow().rawget_int(index);
        match &value {
            LuaValue::String(_) | LuaValue::Number(_) => {
                let text = thread.tostring(&value)?;
                buffer.push_str(&text.raw_tostring());
            }
            other => {
                return Err(LuaError::runtime(format!(
                    "invalid value (at index {}) in table for 'concat': {}",
                    index,
                    other.type_name()
                )));
            }
        }
        if index < stop {
            buffer.push_str(&separator);
        }
    }

    frame.push(LuaValue::string(&buffer))?;
    Ok(1)
}

fn table_maxn(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let table = frame.get_table_arg(0)?;
    let border = table.borrow().maxn();
    frame.push(LuaValue::Number(border as f64))?;
    Ok(1)
}
