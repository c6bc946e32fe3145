use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_value::{LuaClosure, LuaValue, TableRef};
use crate::lua_vm::{CoroutineRef, LuaError, LuaResult, LuaThread, UpValue, coroutine};

/// The native-callable boundary: one operation. The frame gives argument
/// access and a place to push results; the return value is how many
/// results were pushed. Natives may re-enter the driver through `thread`,
/// including calls that switch the running coroutine.
pub trait Callable {
    fn call(&self, thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize>;

    fn name(&self) -> &str {
        "?"
    }
}

pub type NativeFn = fn(&mut LuaThread, &FrameHandle) -> LuaResult<usize>;

/// A plain named native function; stateful callables implement [`Callable`]
/// directly.
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

impl Callable for NativeFunction {
    fn call(&self, thread: &mut LuaThread, frame: &FrameHandle) -> LuaResult<usize> {
        (self.func)(thread, frame)
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// One active call: a window into the owning coroutine's value stack.
///
/// Plain data living on the coroutine's frame stack. `arg_count == -1`
/// marks a frame that has never been initialized (a spawned coroutine
/// before its first resume).
pub struct CallFrame {
    pub closure: Option<Rc<LuaClosure>>,
    pub function: Option<Rc<dyn Callable>>,

    pub pc: usize,

    pub local_base: usize,
    pub return_base: usize,
    pub arg_count: i32,

    /// Entered from a Lua CALL site (as opposed to a host-level call).
    pub from_lua: bool,
    /// Re-extend the window to `max_stacksize` when control returns here.
    pub restore_top: bool,
    /// Yielding is legal while this frame runs.
    pub can_yield: bool,
}

impl CallFrame {
    pub fn is_lua(&self) -> bool {
        self.closure.is_some()
    }
}

/// A handle to one frame of one coroutine — the view handed to native
/// callables and used by the interpreter for window operations.
///
/// Every accessor takes a short borrow of the owning coroutine and drops
/// it before returning, so handle methods can be freely interleaved with
/// re-entrant driver calls.
#[derive(Clone)]
pub struct FrameHandle {
    pub(crate) coroutine: CoroutineRef,
    pub(crate) index: usize,
}

impl FrameHandle {
    pub fn new(coroutine: CoroutineRef, index: usize) -> Self {
        Self { coroutine, index }
    }

    pub fn coroutine(&self) -> &CoroutineRef {
        &self.coroutine
    }

    fn with_frame<R>(&self, read: impl FnOnce(&CallFrame) -> R) -> R {
        let co = self.coroutine.borrow();
        let frame = co.frame(self.index).unwrap_or_else(|| {
            // A stale handle is a driver bug, not a script error
            panic!("frame handle outlived its frame")
        });
        read(frame)
    }

    fn with_frame_mut<R>(&self, write: impl FnOnce(&mut CallFrame) -> R) -> R {
        let mut co = self.coroutine.borrow_mut();
        let frame = co
            .frame_mut(self.index)
            .unwrap_or_else(|| panic!("frame handle outlived its frame"));
        write(frame)
    }

    pub fn local_base(&self) -> usize {
        self.with_frame(|frame| frame.local_base)
    }

    pub fn return_base(&self) -> usize {
        self.with_frame(|frame| frame.return_base)
    }

    pub fn closure(&self) -> Option<Rc<LuaClosure>> {
        self.with_frame(|frame| frame.closure.clone())
    }

    pub fn is_lua(&self) -> bool {
        self.with_frame(|frame| frame.is_lua())
    }

    pub fn can_yield(&self) -> bool {
        self.with_frame(|frame| frame.can_yield)
    }

    pub fn raw_arg_count(&self) -> i32 {
        self.with_frame(|frame| frame.arg_count)
    }

    pub(crate) fn set_restore_top(&self, restore: bool) {
        self.with_frame_mut(|frame| frame.restore_top = restore);
    }

    /// Late argument-count fill-in for a frame created with `-1` (a spawned
    /// coroutine being resumed for the first time).
    pub(crate) fn with_arg_count(&self, arg_count: i32) {
        self.with_frame_mut(|frame| frame.arg_count = arg_count);
    }

    /// The environment seen from this frame: the closure's for Lua calls,
    /// the coroutine's for native ones.
    pub fn env(&self) -> TableRef {
        match self.closure() {
            Some(closure) => closure.env(),
            None => self.coroutine.borrow().env(),
        }
    }

    /*
     * Program counter
     */

    pub fn pc(&self) -> usize {
        self.with_frame(|frame| frame.pc)
    }

    pub fn set_pc(&self, pc: usize) {
        self.with_frame_mut(|frame| frame.pc = pc);
    }

    pub fn bump_pc(&self, delta: i32) {
        self.with_frame_mut(|frame| {
            frame.pc = (frame.pc as i64 + delta as i64) as usize;
        });
    }

    /*
     * Stack window
     */

    /// Logical top of this frame, relative to its base.
    pub fn get_top(&self) -> usize {
        let base = self.local_base();
        self.coroutine.borrow().top().saturating_sub(base)
    }

    pub fn set_top(&self, top: usize) -> LuaResult<()> {
        let base = self.local_base();
        self.coroutine.borrow_mut().set_top(base + top)
    }

    pub fn get(&self, index: usize) -> LuaValue {
        let base = self.local_base();
        self.coroutine.borrow().stack_get(base + index)
    }

    pub fn set(&self, index: usize, value: LuaValue) -> LuaResult<()> {
        if self.get_top() <= index {
            return Err(LuaError::runtime("write above the frame top"));
        }
        let base = self.local_base();
        self.coroutine.borrow_mut().stack_set(base + index, value);
        Ok(())
    }

    pub fn push(&self, value: LuaValue) -> LuaResult<()> {
        let top = self.get_top();
        self.set_top(top + 1)?;
        self.set(top, value)
    }

    pub fn stack_clear(&self, from: usize, end: usize) {
        let base = self.local_base();
        self.coroutine.borrow_mut().stack_clear(base + from, base + end);
    }

    pub fn stack_copy(&self, from: usize, dest: usize, len: usize) {
        let base = self.local_base();
        self.coroutine
            .borrow_mut()
            .stack_copy(base + from, base + dest, len);
    }

    /// Nil out everything from `index` upward, extending the top to it
    /// first if needed.
    pub fn clear_from_index(&self, index: usize) -> LuaResult<()> {
        if self.get_top() < index {
            self.set_top(index)?;
        }
        let top = self.get_top();
        if top > 0 {
            self.stack_clear(index, top - 1);
        }
        Ok(())
    }

    /*
     * Upvalues
     */

    pub fn close_upvalues(&self, limit: usize) {
        let base = self.local_base();
        self.coroutine.borrow_mut().close_upvalues(base + limit);
    }

    pub fn find_upvalue(&self, index: usize) -> Rc<RefCell<UpValue>> {
        let base = self.local_base();
        coroutine::find_upvalue(&self.coroutine, base + index)
    }

    /*
     * Call window setup
     */

    /// Establish the stack window for a fresh (or tail-reused) call.
    ///
    /// Fixed-arity: extra arguments are discarded and missing ones nil
    /// filled up to `max_stacksize`. Vararg: the base shifts past the raw
    /// argument tail, which stays addressable for the VARARG instruction,
    /// and the fixed parameters are copied forward.
    pub fn init(&self) -> LuaResult<()> {
        self.with_frame_mut(|frame| frame.pc = 0);

        let Some(closure) = self.closure() else {
            return Ok(());
        };
        let proto = closure.proto.clone();
        let arg_count = self.raw_arg_count().max(0) as usize;

        if proto.is_vararg {
            self.with_frame_mut(|frame| frame.local_base += arg_count);

            self.set_top(proto.max_stacksize)?;
            let base = self.local_base();
            self.coroutine.borrow_mut().stack_copy(
                base - arg_count,
                base,
                arg_count.min(proto.num_params),
            );
        } else {
            self.set_top(proto.max_stacksize)?;
            self.stack_clear(proto.num_params, arg_count);
        }
        Ok(())
    }

    /// Expand the vararg tail into `[index, index + n)`; `n == -1` means
    /// all of it, moving the top.
    pub fn push_varargs(&self, index: usize, n: i32) -> LuaResult<()> {
        let Some(closure) = self.closure() else {
            return Ok(());
        };
        let num_params = closure.proto.num_params;
        let arg_count = self.raw_arg_count().max(0) as usize;
        let n_varargs = arg_count.saturating_sub(num_params);

        let count = if n == -1 {
            self.set_top(index + n_varargs)?;
            n_varargs
        } else {
            n as usize
        };

        let copied = n_varargs.min(count);
        let base = self.local_base();
        self.coroutine
            .borrow_mut()
            .stack_copy(base - arg_count + num_params, base + index, copied);

        if count > copied {
            self.stack_clear(index + copied, index + count - 1);
        }
        Ok(())
    }

    /*
     * Native argument accessors
     */

    /// Declared argument count of this call (zero-based access).
    pub fn arg_count(&self) -> usize {
        self.raw_arg_count().max(0) as usize
    }

    pub fn get_arg(&self, n: usize) -> LuaResult<LuaValue> {
        if self.arg_count() <= n {
            return Err(LuaError::argument(format!(
                "bad argument #{} (value expected)",
                n + 1
            )));
        }
        Ok(self.get(n))
    }

    /// Missing arguments read as nil.
    pub fn get_arg_or_nil(&self, n: usize) -> LuaValue {
        if self.arg_count() <= n {
            LuaValue::Nil
        } else {
            self.get(n)
        }
    }

    fn arg_type_error(n: usize, expected: &str, got: &LuaValue) -> LuaError {
        if got.is_nil() {
            LuaError::argument(format!(
                "bad argument #{} (expected {}, got no value)",
                n + 1,
                expected
            ))
        } else {
            LuaError::argument(format!(
                "bad argument #{} (expected {}, got {})",
                n + 1,
                expected,
                got.type_name()
            ))
        }
    }

    pub fn get_number_arg(&self, n: usize) -> LuaResult<f64> {
        let value = self.get_arg_or_nil(n);
        value
            .as_number()
            .ok_or_else(|| Self::arg_type_error(n, "number", &value))
    }

    pub fn get_number_arg_or(&self, n: usize, fallback: f64) -> LuaResult<f64> {
        if self.arg_count() <= n || self.get(n).is_nil() {
            return Ok(fallback);
        }
        self.get_number_arg(n)
    }

    pub fn get_int_arg(&self, n: usize) -> LuaResult<i64> {
        let number = self.get_number_arg(n)?;
        if number != (number as i64) as f64 {
            return Err(LuaError::argument(format!(
                "bad argument #{} (expected whole number)",
                n + 1
            )));
        }
        Ok(number as i64)
    }

    pub fn get_int_arg_or(&self, n: usize, fallback: i64) -> LuaResult<i64> {
        if self.arg_count() <= n || self.get(n).is_nil() {
            return Ok(fallback);
        }
        self.get_int_arg(n)
    }

    pub fn get_str_arg(&self, n: usize) -> LuaResult<Rc<str>> {
        let value = self.get_arg_or_nil(n);
        match value {
            LuaValue::String(s) => Ok(s),
            other => Err(Self::arg_type_error(n, "string", &other)),
        }
    }

    pub fn get_table_arg(&self, n: usize) -> LuaResult<TableRef> {
        let value = self.get_arg_or_nil(n);
        match value {
            LuaValue::Table(t) => Ok(t),
            other => Err(Self::arg_type_error(n, "table", &other)),
        }
    }

    pub fn get_function_arg(&self, n: usize) -> LuaResult<LuaValue> {
        let value = self.get_arg_or_nil(n);
        if value.is_callable() {
            Ok(value)
        } else {
            Err(Self::arg_type_error(n, "function", &value))
        }
    }

    pub fn get_closure_arg(&self, n: usize) -> LuaResult<Rc<LuaClosure>> {
        let value = self.get_arg_or_nil(n);
        match value.as_closure() {
            Some(closure) => Ok(closure.clone()),
            None => Err(Self::arg_type_error(n, "function", &value)),
        }
    }

    pub fn get_coroutine_arg(&self, n: usize) -> LuaResult<CoroutineRef> {
        let value = self.get_arg_or_nil(n);
        match value.as_coroutine() {
            Some(co) => Ok(co.clone()),
            None => Err(Self::arg_type_error(n, "thread", &value)),
        }
    }

    /*
     * Diagnostics
     */

    /// `source:line` for Lua frames, `[native]: name` otherwise. Safe to
    /// call on a handle whose frame has already been discarded.
    pub fn source_location(&self) -> String {
        let info = {
            let co = self.coroutine.borrow();
            co.frame(self.index)
                .map(|frame| (frame.closure.clone(), frame.function.clone(), frame.pc))
        };

        match info {
            Some((Some(closure), _, pc)) => closure.proto.source_location(pc),
            Some((None, Some(function), _)) => format!("[native]: {}", function.name()),
            _ => "?".to_string(),
        }
    }
}
