use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_value::{LuaClosure, LuaValue, TableRef};
use crate::lua_vm::{CallFrame, Callable, LuaError, LuaResult, UpValue};

pub type CoroutineRef = Rc<RefCell<Coroutine>>;

pub const INITIAL_STACK_SIZE: usize = 32;
pub const INITIAL_FRAME_SIZE: usize = 10;

pub const MAX_STACK_SIZE: usize = 1024;
pub const MAX_FRAME_SIZE: usize = 100;

/// An independent execution context: a value stack, a call-frame stack,
/// the ordered list of open upvalues over that stack, and the link to
/// whichever coroutine resumed this one.
///
/// Both stacks are exclusively owned; nothing outside the single driver
/// ever touches them while the coroutine runs.
pub struct Coroutine {
    stack: Vec<LuaValue>,
    frames: Vec<CallFrame>,

    /// Open cells ordered by ascending stack index, so bulk closing scans
    /// a suffix.
    open_upvalues: Vec<Rc<RefCell<UpValue>>>,

    /// The resumer; `None` while suspended or running as the root.
    pub(crate) parent: Option<CoroutineRef>,

    env: TableRef,

    stack_trace: String,
    trace_level: i32,
}

impl Coroutine {
    pub fn new(env: TableRef) -> Self {
        Self {
            stack: Vec::with_capacity(INITIAL_STACK_SIZE),
            frames: Vec::with_capacity(INITIAL_FRAME_SIZE),
            open_upvalues: Vec::new(),
            parent: None,
            env,
            stack_trace: String::new(),
            trace_level: 0,
        }
    }

    /// A fresh coroutine primed with its root closure; the frame is left
    /// uninitialized (`arg_count == -1`) until the first resume delivers
    /// the arguments.
    pub fn spawn(closure: Rc<LuaClosure>, env: TableRef) -> Self {
        let mut co = Self::new(env);

        co.frames.push(CallFrame {
            closure: Some(closure),
            function: None,
            pc: 0,
            local_base: 0,
            return_base: 0,
            arg_count: -1,
            from_lua: true,
            restore_top: false,
            can_yield: true,
        });

        co
    }

    pub fn env(&self) -> TableRef {
        self.env.clone()
    }

    pub fn parent(&self) -> Option<CoroutineRef> {
        self.parent.clone()
    }

    /*
     * Value stack
     */

    pub fn top(&self) -> usize {
        self.stack.len()
    }

    pub fn set_top(&mut self, new_top: usize) -> LuaResult<()> {
        if new_top > MAX_STACK_SIZE {
            return Err(LuaError::overflow("stack overflow"));
        }
        if new_top > self.stack.len() {
            self.stack.resize(new_top, LuaValue::Nil);
        } else {
            self.stack.truncate(new_top);
        }
        Ok(())
    }

    /// Slots at or above the top read as nil.
    pub fn stack_get(&self, index: usize) -> LuaValue {
        self.stack.get(index).cloned().unwrap_or(LuaValue::Nil)
    }

    /// Writes above the top are dropped; callers manage the top explicitly.
    pub fn stack_set(&mut self, index: usize, value: LuaValue) {
        if index < self.stack.len() {
            self.stack[index] = value;
        }
    }

    /// Clear `[from, end]` to nil, clamped to the live window.
    pub fn stack_clear(&mut self, from: usize, end: usize) {
        let stop = (end + 1).min(self.stack.len());
        for slot in from..stop {
            self.stack[slot] = LuaValue::Nil;
        }
    }

    /// Overlapping-safe copy of `len` slots from `from` to `dest`.
    pub fn stack_copy(&mut self, from: usize, dest: usize, len: usize) {
        if len == 0 || from == dest {
            return;
        }
        if dest < from {
            for offset in 0..len {
                self.stack[dest + offset] = self.stack[from + offset].clone();
            }
        } else {
            for offset in (0..len).rev() {
                self.stack[dest + offset] = self.stack[from + offset].clone();
            }
        }
    }

    /*
     * Frame stack
     */

    fn pull_new_frame(&mut self) -> LuaResult<()> {
        if self.frames.len() + 1 > MAX_FRAME_SIZE {
            return Err(LuaError::overflow("frame stack overflow"));
        }
        Ok(())
    }

    pub fn push_call_frame(
        &mut self,
        closure: Rc<LuaClosure>,
        local_base: usize,
        return_base: usize,
        arg_count: i32,
    ) -> LuaResult<usize> {
        self.pull_new_frame()?;
        self.frames.push(CallFrame {
            closure: Some(closure),
            function: None,
            pc: 0,
            local_base,
            return_base,
            arg_count,
            from_lua: false,
            restore_top: false,
            can_yield: false,
        });
        Ok(self.frames.len() - 1)
    }

    /// Push a native (or placeholder) frame; a `None` callable marks a
    /// host-side receiver frame used by resume to collect yielded values.
    pub fn push_native_frame(
        &mut self,
        function: Option<Rc<dyn Callable>>,
        local_base: usize,
        return_base: usize,
        arg_count: i32,
    ) -> LuaResult<usize> {
        self.pull_new_frame()?;
        self.frames.push(CallFrame {
            closure: None,
            function,
            pc: 0,
            local_base,
            return_base,
            arg_count,
            from_lua: false,
            restore_top: false,
            can_yield: false,
        });
        Ok(self.frames.len() - 1)
    }

    pub fn pop_call_frame(&mut self) {
        self.frames.pop();
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame_index(&self) -> Option<usize> {
        self.frames.len().checked_sub(1)
    }

    pub fn frame(&self, index: usize) -> Option<&CallFrame> {
        self.frames.get(index)
    }

    pub fn frame_mut(&mut self, index: usize) -> Option<&mut CallFrame> {
        self.frames.get_mut(index)
    }

    /// Dead once the frame stack has emptied through return or error;
    /// permanently so.
    pub fn is_dead(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_at_bottom(&self) -> bool {
        self.frames.len() == 1
    }

    /// `suspended`/`normal`/`dead`; "running" is a driver-level fact and
    /// layered on top by the caller.
    pub fn status_str(&self) -> &'static str {
        if self.parent.is_none() {
            if self.is_dead() { "dead" } else { "suspended" }
        } else {
            "normal"
        }
    }

    /*
     * Upvalues
     */

    /// Close and deregister every open cell with stack index >= `limit`.
    /// Called on block exit, frame return, tail-call reuse and error
    /// unwind, while the slots are still live.
    pub fn close_upvalues(&mut self, limit: usize) {
        while let Some(cell) = self.open_upvalues.last().cloned() {
            let index = cell.borrow().stack_index();
            if index < limit {
                return;
            }

            self.open_upvalues.pop();
            let value = self.stack_get(index);
            cell.borrow_mut().close_with(value);
        }
    }

    pub(crate) fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    /*
     * Stack trace accumulation
     */

    pub(crate) fn begin_stack_trace(&mut self, location: &str, message: &str) {
        self.stack_trace.push_str(location);
        self.stack_trace.push_str(": ");
        self.stack_trace.push_str(message);
        self.stack_trace.push('\n');
        self.trace_level = -1;
    }

    /// One line per discarded frame: depth counter, call-site symbol,
    /// source location. The frame that raised was already reported by
    /// `begin_stack_trace` and is skipped.
    pub(crate) fn add_trace(&mut self, origin: &str, location: &str) {
        self.trace_level += 1;
        if self.trace_level == 0 {
            return;
        }

        for _ in 0..self.trace_level {
            self.stack_trace.push(' ');
        }
        self.stack_trace.push_str(&self.trace_level.to_string());
        self.stack_trace.push_str(". ");
        self.stack_trace.push_str(origin);
        self.stack_trace.push_str(" - ");
        self.stack_trace.push_str(location);
        self.stack_trace.push('\n');
    }

    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }

    pub(crate) fn reset_stack_trace(&mut self) {
        self.stack_trace.clear();
        self.trace_level = 0;
    }
}

/// The identity-preserving open-cell lookup: returns the existing cell for
/// `index` when one is registered, otherwise creates and registers one,
/// keeping the list ordered by stack index.
pub fn find_upvalue(co: &CoroutineRef, index: usize) -> Rc<RefCell<UpValue>> {
    let mut inner = co.borrow_mut();

    let mut insert_at = 0;
    for (position, cell) in inner.open_upvalues.iter().enumerate().rev() {
        let current = cell.borrow().stack_index();
        if current == index {
            return cell.clone();
        }
        if current < index {
            insert_at = position + 1;
            break;
        }
    }

    let cell = Rc::new(RefCell::new(UpValue::open(co, index)));
    inner.open_upvalues.insert(insert_at, cell.clone());
    cell
}
