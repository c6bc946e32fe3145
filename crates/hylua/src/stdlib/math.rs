// Math library. random uses a thread-local xorshift64 state, seedable
// through randomseed.

use std::cell::Cell;

use crate::lib_registry::LibraryModule;
use crate::lua_value::LuaValue;
use crate::lua_vm::{FrameHandle, LuaError, LuaResult, LuaThread};
use crate::lib_module;

pub fn create_math_lib() -> LibraryModule {
    lib_module!("math", {
        "floor" => math_floor,
        "ceil" => math_ceil,
        "abs" => math_abs,
        "sqrt" => math_sqrt,
        "max" => math_max,
        "min" => math_min,
        "fmod" => math_fmod,
        "pow" => math_pow,
        "random" => math_random,
        "randomseed" => math_randomseed,
    })
    .with_value("huge", LuaValue::Number(f64::INFINITY))
    .with_value("pi", LuaValue::Number(std::f64::consts::PI))
}

fn math_floor(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let n = frame.get_number_arg(0)?;
    frame.push(LuaValue::Number(n.floor()))?;
    Ok(1)
}

fn math_ceil(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let n = frame.get_number_arg(0)?;
    frame.push(LuaValue::Number(n.ceil()))?;
    Ok(1)
}

fn math_abs(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let n = frame.get_number_arg(0)?;
    frame.push(LuaValue::Number(n.abs()))?;
    Ok(1)
}

fn math_sqrt(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let n = frame.get_number_arg(0)?;
    frame.push(LuaValue::Number(n.sqrt()))?;
    Ok(1)
}

fn math_max(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let mut best = frame.get_number_arg(0)?;
    for index in 1..frame.arg_count() {
        best = best.max(frame.get_number_arg(index)?);
    }
    frame.push(LuaValue::Number(best))?;
    Ok(1)
}

fn math_min(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let mut best = frame.get_number_arg(0)?;
    for index in 1..frame.arg_count() {
        best = best.min(frame.get_number_arg(index)?);
    }
    frame.push(LuaValue::Number(best))?;
    Ok(1)
}

fn math_fmod(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let a = frame.get_number_arg(0)?;
    let b = frame.get_number_arg(1)?;
    // C fmod: the result follows the dividend's sign, unlike the %
    // operator's floored modulo
    frame.push(LuaValue::Number(a % b))?;
    Ok(1)
}

fn math_pow(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let a = frame.get_number_arg(0)?;
    let b = frame.get_number_arg(1)?;
    frame.push(LuaValue::Number(a.powf(b)))?;
    Ok(1)
}

thread_local! {
    static RANDOM_STATE: Cell<u64> = const { Cell::new(0x2545F4914F6CDD1D) };
}

fn xorshift64() -> u64 {
    RANDOM_STATE.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        x
    })
}

fn math_random(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let sample = (xorshift64() >> 11) as f64 / (1u64 << 53) as f64;

    let value = match frame.arg_count() {
        0 => LuaValue::Number(sample),
        1 => {
            let upper = frame.get_int_arg(0)?;
            if upper < 1 {
                return Err(LuaError::argument("bad argument #1 (interval is empty)"));
            }
            LuaValue::Number((sample * upper as f64).floor() + 1.0)
        }
        _ => {
            let lower = frame.get_int_arg(0)?;
            let upper = frame.get_int_arg(1)?;
            if upper < lower {
                return Err(LuaError::argument("bad argument #2 (interval is empty)"));
            }
            let span = (upper - lower + 1) as f64;
            LuaValue::Number((sample * span).floor() + lower as f64)
        }
    };

    frame.push(value)?;
    Ok(1)
}

fn math_randomseed(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let seed = frame.get_number_arg(0)?;
    let seed = (seed.to_bits() | 1).wrapping_mul(0x9E3779B97F4A7C15);
    RANDOM_STATE.with(|state| state.set(seed | 1));
    Ok(0)
}
