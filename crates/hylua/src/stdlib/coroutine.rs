// Coroutine library: create, resume, yield, status, running, wrap.

use std::rc::Rc;

use crate::lib_registry::LibraryModule;
use crate::lua_value::LuaValue;
use crate::lua_vm::{Callable, Coroutine, CoroutineRef, FrameHandle, LuaError, LuaResult, LuaThread};
use crate::lib_module;

pub fn create_coroutine_lib() -> LibraryModule {
    lib_module!("coroutine", {
        "create" => coroutine_create,
        "resume" => coroutine_resume,
        "yield" => coroutine_yield,
        "status" => coroutine_status,
        "running" => coroutine_running,
        "wrap" => coroutine_wrap,
    })
}

fn coroutine_create(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let closure = frame.get_closure_arg(0)?;

    let co = Coroutine::spawn(closure, frame.env());
    frame.push(LuaValue::coroutine(co))?;
    Ok(1)
}

/// Script-level resume: primes the target's frame and hands it the driver.
/// The interpreter continues inside the target once this native returns;
/// the success flag and values arrive in this call's return window when
/// the target yields, finishes or fails.
fn coroutine_resume(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let co = frame.get_coroutine_arg(0)?;

    if co.borrow().is_dead() {
        return Err(LuaError::runtime("cannot resume dead coroutine"));
    }
    if Rc::ptr_eq(&co, frame.coroutine()) || co.borrow().parent().is_some() {
        return Err(LuaError::runtime("cannot resume non-suspended coroutine"));
    }

    co.borrow_mut().parent = Some(frame.coroutine().clone());

    let target_index = co
        .borrow()
        .current_frame_index()
        .ok_or_else(|| LuaError::runtime("cannot resume dead coroutine"))?;
    let next_frame = FrameHandle::new(co.clone(), target_index);

    let first = next_frame.raw_arg_count() == -1;
    if first {
        next_frame.set_top(0)?;
    }

    let arg_count = frame.arg_count();
    for index in 1..arg_count {
        next_frame.push(frame.get(index))?;
    }

    if first {
        next_frame.with_arg_count(arg_count as i32 - 1);
        next_frame.init()?;
    }

    // The driver picks the new coroutine up when this native returns
    thread.coroutine = co;
    Ok(0)
}

fn coroutine_yield(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let co = frame.coroutine().clone();

    if co.borrow().parent().is_none() {
        return Err(LuaError::runtime("cannot yield outside a coroutine"));
    }

    // Legality is judged on the Lua frame beneath this native call: it
    // must have been entered through a resume
    let below = co
        .borrow()
        .frame_count()
        .checked_sub(2)
        .ok_or_else(|| LuaError::runtime("cannot yield outside a coroutine"))?;
    let check_frame = FrameHandle::new(co, below);

    thread.do_yield(&check_frame, frame, frame.arg_count())?;
    Ok(0)
}

fn coroutine_status(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let co = frame.get_coroutine_arg(0)?;

    let status = if Rc::ptr_eq(&co, &thread.coroutine) {
        "running"
    } else {
        co.borrow().status_str()
    };

    frame.push(LuaValue::string(status))?;
    Ok(1)
}

fn coroutine_running(thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    frame.push(LuaValue::Coroutine(thread.coroutine.clone()))?;
    Ok(1)
}

/// A wrapped coroutine: an ordinary callable that resumes through the host
/// boundary and re-raises failures instead of returning a success flag.
struct WrappedCoroutine {
    co: CoroutineRef,
}

impl Callable for WrappedCoroutine {
    fn call(&self, thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
        let args: Vec<LuaValue> = (0..frame.arg_count()).map(|index| frame.get(index)).collect();

        let mut results = thread.resume(&self.co, &args)?;

        let ok = results.first().map(LuaValue::is_truthy).unwrap_or(false);
        if !ok {
            let cause = if results.len() > 1 {
                results.swap_remove(1)
            } else {
                LuaValue::string("coroutine failure")
            };
            return Err(LuaError::user(cause));
        }

        let count = results.len() - 1;
        for value in results.into_iter().skip(1) {
            frame.push(value)?;
        }
        Ok(count)
    }

    fn name(&self) -> &str {
        "wrapped coroutine"
    }
}

fn coroutine_wrap(_thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
    let closure = frame.get_closure_arg(0)?;

    let co = Coroutine::spawn(closure, frame.env());
    let wrapped = WrappedCoroutine {
        co: Rc::new(std::cell::RefCell::new(co)),
    };

    frame.push(LuaValue::native(Rc::new(wrapped)))?;
    Ok(1)
}
