use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_value::{LuaClosure, LuaFunction, LuaTable, LuaValue, Prototype, TableRef};
use crate::lua_value::number_to_string;
use crate::lua_vm::opcode::*;
use crate::lua_vm::{
    Callable, Coroutine, CoroutineRef, DebugHook, FrameHandle, LuaError, LuaResult,
};

/// Depth cap for `__index`/`__newindex` chains.
pub const MAX_INDEX_RECURSION: usize = 100;

/// Per-kind metatables for non-table values (string methods and the like).
/// An explicit registry owned by the driver, installed by the embedder.
#[derive(Default)]
struct TypeMetatables {
    boolean: Option<TableRef>,
    number: Option<TableRef>,
    string: Option<TableRef>,
    function: Option<TableRef>,
    coroutine: Option<TableRef>,
    /// Fallback consulted for tables that carry no metatable of their own.
    table: Option<TableRef>,
}

impl TypeMetatables {
    fn for_value(&self, value: &LuaValue) -> Option<TableRef> {
        match value {
            LuaValue::Nil => None,
            LuaValue::Boolean(_) => self.boolean.clone(),
            LuaValue::Number(_) => self.number.clone(),
            LuaValue::String(_) => self.string.clone(),
            LuaValue::Table(_) => self.table.clone(),
            LuaValue::Function(_) => self.function.clone(),
            LuaValue::Coroutine(_) => self.coroutine.clone(),
        }
    }
}

/// Dispatch-loop continuation after one instruction.
enum Flow {
    Continue,
    /// Control crossed back into a host boundary; leave the loop.
    Exit,
}

/// Cached execution context for the frame the loop is running. Reloaded on
/// every call, return and coroutine switch.
struct ExecContext {
    frame: FrameHandle,
    closure: Rc<LuaClosure>,
    proto: Rc<Prototype>,
}

/// The thread driver: owns the root coroutine, tracks the running one and
/// runs the opcode interpreter.
///
/// One driver means one native call stack: Lua-to-Lua calls are loop
/// continuations on the frame stack, and only native callables recurse
/// into the host stack. Exactly one coroutine runs at a time; switching
/// happens only through resume and yield.
pub struct LuaThread {
    root: CoroutineRef,
    /// The currently running coroutine.
    pub coroutine: CoroutineRef,

    globals: TableRef,
    type_metatables: TypeMetatables,

    pub hook: Option<Box<dyn DebugHook>>,
}

impl LuaThread {
    pub fn new() -> Self {
        let globals: TableRef = Rc::new(RefCell::new(LuaTable::new()));
        globals
            .borrow_mut()
            .rawset_str("_G", LuaValue::Table(globals.clone()));

        let root = Rc::new(RefCell::new(Coroutine::new(globals.clone())));

        Self {
            coroutine: root.clone(),
            root,
            globals,
            type_metatables: TypeMetatables::default(),
            hook: None,
        }
    }

    /*
     * Environment
     */

    pub fn globals(&self) -> TableRef {
        self.globals.clone()
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        self.globals.borrow_mut().rawset_str(name, value);
    }

    pub fn get_global(&self, name: &str) -> LuaValue {
        self.globals.borrow().rawget_str(name)
    }

    pub fn set_string_metatable(&mut self, meta: Option<TableRef>) {
        self.type_metatables.string = meta;
    }

    pub fn set_type_metatable(&mut self, type_name: &str, meta: Option<TableRef>) {
        match type_name {
            "boolean" => self.type_metatables.boolean = meta,
            "number" => self.type_metatables.number = meta,
            "string" => self.type_metatables.string = meta,
            "table" => self.type_metatables.table = meta,
            "function" => self.type_metatables.function = meta,
            "thread" => self.type_metatables.coroutine = meta,
            _ => {}
        }
    }

    /// Instantiate `proto` against the global environment.
    pub fn load_prototype(&self, proto: Rc<Prototype>) -> Rc<LuaClosure> {
        Rc::new(LuaClosure::new(proto, self.globals.clone()))
    }

    /// Install the full standard library into the globals.
    pub fn open_stdlib(&mut self) -> LuaResult<()> {
        crate::lib_registry::create_standard_registry().load_all(self)
    }

    /*
     * Host call boundary
     */

    /// Stack-protocol call: the current coroutine's stack holds the callee
    /// followed by `arg_count` arguments at its top. Returns how many
    /// results were left starting at the callee's slot.
    pub fn call(&mut self, arg_count: usize) -> LuaResult<usize> {
        let (base, func) = {
            let co = self.coroutine.borrow();
            let base = co
                .top()
                .checked_sub(arg_count + 1)
                .ok_or_else(|| LuaError::runtime("call arguments are not on the stack"))?;
            (base, co.stack_get(base))
        };

        match func {
            LuaValue::Function(LuaFunction::Native(native)) => {
                self.call_native(native, base + 1, base, arg_count as i32)
            }
            LuaValue::Function(LuaFunction::Closure(closure)) => {
                let co = self.coroutine.clone();
                let index =
                    co.borrow_mut()
                        .push_call_frame(closure, base + 1, base, arg_count as i32)?;
                let frame = FrameHandle::new(co, index);
                frame.init()?;

                self.mainloop()?;

                Ok(self.coroutine.borrow().top() - base)
            }
            other => Err(LuaError::type_error(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    /// Protected call over the same stack protocol. On success the results
    /// are prefixed with `true`; on failure the coroutine is restored to
    /// its pre-call frame depth and `(false, cause, traceback)` is left
    /// instead. Never propagates script errors to the host.
    pub fn pcall(&mut self, arg_count: usize) -> LuaResult<usize> {
        let co = self.coroutine.clone();
        let frame_mark = co.borrow().frame_count();
        let base = {
            let inner = co.borrow();
            inner
                .top()
                .checked_sub(arg_count + 1)
                .ok_or_else(|| LuaError::runtime("call arguments are not on the stack"))?
        };

        match self.call(arg_count) {
            Ok(rets) => {
                let mut inner = co.borrow_mut();
                inner.set_top(base + rets + 1)?;
                inner.stack_copy(base, base + 1, rets);
                inner.stack_set(base, LuaValue::Boolean(true));
                Ok(rets + 1)
            }
            Err(err) => {
                // Close captures made below the boundary before their
                // slots go away
                if frame_mark > 0 {
                    let limit = co
                        .borrow()
                        .frame(frame_mark - 1)
                        .map(|frame| frame.local_base);
                    if let Some(limit) = limit {
                        co.borrow_mut().close_upvalues(limit);
                    }
                }

                // Discard every frame pushed above the boundary, recording
                // one trace line each
                while co.borrow().frame_count() > frame_mark {
                    self.trace_and_pop(&co);
                }

                let trace = co.borrow().stack_trace().to_string();
                {
                    let mut inner = co.borrow_mut();
                    inner.set_top(base + 3)?;
                    inner.stack_set(base, LuaValue::Boolean(false));
                    inner.stack_set(base + 1, err.cause());
                    inner.stack_set(base + 2, LuaValue::string(&trace));
                    inner.reset_stack_trace();
                }
                Ok(3)
            }
        }
    }

    /// Convenience call: returns the first result.
    pub fn call_value(&mut self, func: &LuaValue, args: &[LuaValue]) -> LuaResult<LuaValue> {
        let co = self.coroutine.clone();
        let top = co.borrow().top();

        {
            let mut inner = co.borrow_mut();
            inner.set_top(top + args.len() + 1)?;
            inner.stack_set(top, func.clone());
            for (offset, arg) in args.iter().enumerate() {
                inner.stack_set(top + 1 + offset, arg.clone());
            }
        }

        let rets = self.call(args.len())?;
        let result = if rets >= 1 {
            co.borrow().stack_get(top)
        } else {
            LuaValue::Nil
        };

        co.borrow_mut().set_top(top)?;
        Ok(result)
    }

    /// Convenience call collecting every result.
    pub fn call_multret(&mut self, func: &LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let co = self.coroutine.clone();
        let top = co.borrow().top();

        {
            let mut inner = co.borrow_mut();
            inner.set_top(top + args.len() + 1)?;
            inner.stack_set(top, func.clone());
            for (offset, arg) in args.iter().enumerate() {
                inner.stack_set(top + 1 + offset, arg.clone());
            }
        }

        let rets = self.call(args.len())?;
        let mut values = Vec::with_capacity(rets);
        {
            let inner = co.borrow();
            for offset in 0..rets {
                values.push(inner.stack_get(top + offset));
            }
        }

        co.borrow_mut().set_top(top)?;
        Ok(values)
    }

    /// Host-level resume. Pushes a receiver frame on the current coroutine
    /// to collect what the target yields (or returns, or fails with), then
    /// transfers control. The returned values start with the success flag.
    pub fn resume(&mut self, target: &CoroutineRef, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        if target.borrow().is_dead() {
            return Err(LuaError::runtime("cannot resume dead coroutine"));
        }
        if Rc::ptr_eq(target, &self.coroutine) || target.borrow().parent().is_some() {
            return Err(LuaError::runtime("cannot resume non-suspended coroutine"));
        }

        let caller = self.coroutine.clone();
        let top = caller.borrow().top();
        caller.borrow_mut().push_native_frame(None, top, top, 0)?;

        target.borrow_mut().parent = Some(caller.clone());

        let target_index = target
            .borrow()
            .current_frame_index()
            .ok_or_else(|| LuaError::runtime("cannot resume dead coroutine"))?;
        let next_frame = FrameHandle::new(target.clone(), target_index);

        let primed: LuaResult<()> = {
            let first = next_frame.raw_arg_count() == -1;
            (|| {
                if first {
                    next_frame.set_top(0)?;
                }
                for arg in args {
                    next_frame.push(arg.clone())?;
                }
                if first {
                    next_frame.with_arg_count(args.len() as i32);
                    next_frame.init()?;
                }
                Ok(())
            })()
        };
        if let Err(err) = primed {
            target.borrow_mut().parent = None;
            let _ = caller.borrow_mut().set_top(top);
            caller.borrow_mut().pop_call_frame();
            return Err(err);
        }

        self.coroutine = target.clone();
        self.mainloop()?;

        // Control is back: the receiver frame of the (again current)
        // coroutine holds the delivered values
        let values = {
            let co = self.coroutine.clone();
            let index = co.borrow().current_frame_index();
            match index {
                Some(index) => {
                    let frame = FrameHandle::new(co, index);
                    let count = frame.get_top();
                    (0..count).map(|offset| frame.get(offset)).collect()
                }
                None => Vec::new(),
            }
        };

        caller.borrow_mut().set_top(top)?;
        caller.borrow_mut().pop_call_frame();

        Ok(values)
    }

    /// Native-call recursion: push a frame, invoke, copy the declared
    /// results down into the caller's return window, pop. The callable may
    /// have switched the running coroutine; the bookkeeping stays on the
    /// frame's owner.
    pub(crate) fn call_native(
        &mut self,
        func: Rc<dyn Callable>,
        local_base: usize,
        return_base: usize,
        arg_count: i32,
    ) -> LuaResult<usize> {
        let caller = self.coroutine.clone();
        let index =
            caller
                .borrow_mut()
                .push_native_frame(Some(func.clone()), local_base, return_base, arg_count)?;
        let frame = FrameHandle::new(caller.clone(), index);

        let ret_count = func.call(self, &frame)?;

        {
            let mut co = caller.borrow_mut();
            let top = co.top();
            let actual_base = top.saturating_sub(ret_count);
            co.stack_copy(actual_base, return_base, ret_count);
            co.set_top(return_base + ret_count)?;
            co.pop_call_frame();
        }

        Ok(ret_count)
    }

    /// The yield transfer: deliver `true` plus `arg_count` values from
    /// `arg_frame` onto the parent's current frame, detach the parent link
    /// and make the parent the running coroutine.
    pub(crate) fn do_yield(
        &mut self,
        check_frame: &FrameHandle,
        arg_frame: &FrameHandle,
        arg_count: usize,
    ) -> LuaResult<()> {
        if !check_frame.can_yield() {
            return Err(LuaError::runtime("cannot yield outside of a coroutine"));
        }

        let co = check_frame.coroutine().clone();
        let parent = co
            .borrow()
            .parent()
            .ok_or_else(|| LuaError::runtime("cannot yield a root coroutine"))?;

        let mut values = Vec::with_capacity(arg_count + 1);
        values.push(LuaValue::Boolean(true));
        for offset in 0..arg_count {
            values.push(arg_frame.get(offset));
        }

        co.borrow_mut().parent = None;

        if parent.borrow().is_dead() {
            let mut inner = parent.borrow_mut();
            inner.set_top(arg_count + 1)?;
            for (slot, value) in values.into_iter().enumerate() {
                inner.stack_set(slot, value);
            }
        } else {
            let index = parent
                .borrow()
                .current_frame_index()
                .ok_or_else(|| LuaError::runtime("yield target has no frame"))?;
            let receiver = FrameHandle::new(parent.clone(), index);
            for value in values {
                receiver.push(value)?;
            }
        }

        self.coroutine = parent;
        Ok(())
    }

    /*
     * Metatables
     */

    /// The metamethod `event` for `value`, or nil. Tables use their own
    /// metatable, falling back to the per-type registry; everything else
    /// consults the registry directly.
    pub fn get_meta_value(&self, value: &LuaValue, event: &str) -> LuaValue {
        let meta = match value {
            LuaValue::Table(table) => table
                .borrow()
                .get_metatable()
                .or_else(|| self.type_metatables.for_value(value)),
            other => self.type_metatables.for_value(other),
        };

        match meta {
            Some(meta) => meta.borrow().rawget_str(event),
            None => LuaValue::Nil,
        }
    }

    /// `__eq`-style shared lookup: only meaningful when both operands
    /// resolve the exact same metamethod value.
    fn get_shared_meta_value(&self, a: &LuaValue, b: &LuaValue, event: &str) -> LuaValue {
        let meta_a = self.get_meta_value(a, event);
        let meta_b = self.get_meta_value(b, event);

        if meta_a.is_nil() || meta_a != meta_b {
            LuaValue::Nil
        } else {
            meta_a
        }
    }

    /*
     * Indexing with metamethod fallback
     */

    pub fn table_get(&mut self, table: &LuaValue, key: &LuaValue) -> LuaResult<LuaValue> {
        let mut current = table.clone();

        for _ in 0..MAX_INDEX_RECURSION {
            let is_table = matches!(current, LuaValue::Table(_));

            if let LuaValue::Table(inner) = &current {
                let value = inner.borrow().rawget(key)?;
                if !value.is_nil() {
                    return Ok(value);
                }
            }

            let meta = self.get_meta_value(&current, "__index");
            if meta.is_nil() {
                if is_table {
                    return Ok(LuaValue::Nil);
                }
                return Err(LuaError::type_error(format!(
                    "attempt to index a {} value",
                    current.type_name()
                )));
            }

            if meta.is_callable() {
                return self.call_value(&meta, &[table.clone(), key.clone()]);
            }
            current = meta;
        }

        Err(LuaError::runtime("loop in gettable"))
    }

    pub fn table_set(
        &mut self,
        table: &LuaValue,
        key: &LuaValue,
        value: LuaValue,
    ) -> LuaResult<()> {
        let mut current = table.clone();

        for _ in 0..MAX_INDEX_RECURSION {
            let meta;

            if let LuaValue::Table(inner) = &current {
                let existing = inner.borrow().rawget(key)?;
                if !existing.is_nil() {
                    inner.borrow_mut().rawset(key, value.clone())?;
                    return Ok(());
                }
                meta = self.get_meta_value(&current, "__newindex");
                if meta.is_nil() {
                    inner.borrow_mut().rawset(key, value.clone())?;
                    return Ok(());
                }
            } else {
                meta = self.get_meta_value(&current, "__newindex");
                if meta.is_nil() {
                    return Err(LuaError::type_error(format!(
                        "attempt to index a {} value",
                        current.type_name()
                    )));
                }
            }

            if meta.is_callable() {
                self.call_value(&meta, &[table.clone(), key.clone(), value.clone()])?;
                return Ok(());
            }
            current = meta;
        }

        Err(LuaError::runtime("loop in settable"))
    }

    /*
     * Comparison
     */

    /// EQ/LT/LE semantics shared by the comparison opcodes and the library.
    ///
    /// Equality short-circuits primitives by value and falls back to
    /// identity unless both operands share the identical `__eq`. Ordering
    /// is primitive for number and string pairs; otherwise `__lt`/`__le`,
    /// where a missing `__le` computes `a <= b` as `not (b < a)` with the
    /// operand order inverted.
    pub fn compare(&mut self, a: &LuaValue, b: &LuaValue, op: u32) -> LuaResult<bool> {
        match op {
            OP_EQ => {
                if a.is_nil() || b.is_nil() {
                    return Ok(a.is_nil() && b.is_nil());
                }
                match (a, b) {
                    (LuaValue::Number(_), LuaValue::Number(_))
                    | (LuaValue::String(_), LuaValue::String(_)) => Ok(a == b),
                    _ => {
                        let meta = self.get_shared_meta_value(a, b, "__eq");
                        if meta.is_nil() {
                            return Ok(a == b);
                        }
                        Ok(self.call_value(&meta, &[a.clone(), b.clone()])?.is_truthy())
                    }
                }
            }
            OP_LT | OP_LE => {
                match (a, b) {
                    (LuaValue::Number(x), LuaValue::Number(y)) => {
                        return Ok(if op == OP_LT { x < y } else { x <= y });
                    }
                    (LuaValue::String(x), LuaValue::String(y)) => {
                        return Ok(if op == OP_LT { x < y } else { x <= y });
                    }
                    _ => {}
                }

                let type_a = a.type_name();
                let type_b = b.type_name();

                let mut lhs = a.clone();
                let mut rhs = b.clone();
                let mut inverted = false;

                let event = meta_op_name(op).unwrap_or("__lt");
                let mut meta = self.get_shared_meta_value(&lhs, &rhs, event);

                if meta.is_nil() && op == OP_LE {
                    // a <= b becomes not (b < a); note the operand order
                    meta = self.get_shared_meta_value(&lhs, &rhs, "__lt");
                    std::mem::swap(&mut lhs, &mut rhs);
                    inverted = true;
                }

                if meta.is_nil() {
                    return Err(LuaError::type_error(format!(
                        "attempt to compare a {} with a {} value",
                        type_a, type_b
                    )));
                }

                let result = self.call_value(&meta, &[lhs, rhs])?.is_truthy();
                Ok(result == !inverted)
            }
            _ => Err(LuaError::bytecode("bad comparison opcode")),
        }
    }

    /// `tostring` with `__tostring` dispatch.
    pub fn tostring(&mut self, value: &LuaValue) -> LuaResult<LuaValue> {
        match value {
            LuaValue::Nil
            | LuaValue::Boolean(_)
            | LuaValue::Number(_)
            | LuaValue::String(_) => Ok(LuaValue::string(&value.raw_tostring())),
            other => {
                let meta = self.get_meta_value(other, "__tostring");
                if meta.is_nil() {
                    Ok(LuaValue::string(&other.raw_tostring()))
                } else {
                    self.call_value(&meta, &[other.clone()])
                }
            }
        }
    }

    /*
     * Interpreter loop
     */

    /// Rebuild the execution context from the running coroutine's current
    /// frame. `None` when control has crossed back into a host boundary
    /// (no frame, or a native frame on top).
    fn reload_context(&mut self) -> LuaResult<Option<ExecContext>> {
        let co = self.coroutine.clone();

        let (index, closure, restore_top) = {
            let inner = co.borrow();
            let Some(index) = inner.current_frame_index() else {
                return Ok(None);
            };
            let Some(frame) = inner.frame(index) else {
                return Ok(None);
            };
            let Some(closure) = frame.closure.clone() else {
                return Ok(None);
            };
            (index, closure, frame.restore_top)
        };

        let proto = closure.proto.clone();
        let frame = FrameHandle::new(co, index);

        if restore_top {
            frame.set_top(proto.max_stacksize)?;
        }

        Ok(Some(ExecContext {
            frame,
            closure,
            proto,
        }))
    }

    /// Run until the frame chain entered at the host boundary unwinds back
    /// out of it (return, yield back into the host, or error).
    fn mainloop(&mut self) -> LuaResult<()> {
        let Some(mut ctx) = self.reload_context()? else {
            return Ok(());
        };

        loop {
            match self.step(&mut ctx) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return Ok(()),
                Err(err) => {
                    if !self.unwind(err, &mut ctx)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn fetch(&self, ctx: &ExecContext) -> LuaResult<u32> {
        let pc = ctx.frame.pc();
        let code = ctx
            .proto
            .code
            .get(pc)
            .copied()
            .ok_or_else(|| LuaError::bytecode("instruction pointer out of range"))?;
        ctx.frame.set_pc(pc + 1);
        Ok(code)
    }

    fn konst(&self, ctx: &ExecContext, index: usize) -> LuaResult<LuaValue> {
        ctx.proto
            .constants
            .get(index)
            .cloned()
            .ok_or_else(|| LuaError::bytecode("constant index out of range"))
    }

    /// Register-or-constant operand.
    fn rk(&self, ctx: &ExecContext, index: usize) -> LuaResult<LuaValue> {
        if index >= 256 {
            self.konst(ctx, index - 256)
        } else {
            Ok(ctx.frame.get(index))
        }
    }

    fn notify_instruction(&mut self) -> LuaResult<()> {
        if self.hook.is_some() {
            let co = self.coroutine.clone();
            if let Some(mut hook) = self.hook.take() {
                let result = hook.on_instruction(&co);
                self.hook = Some(hook);
                result?;
            }
        }
        Ok(())
    }

    fn notify_call(&mut self) -> LuaResult<()> {
        if self.hook.is_some() {
            let co = self.coroutine.clone();
            if let Some(mut hook) = self.hook.take() {
                let result = hook.on_call(&co);
                self.hook = Some(hook);
                result?;
            }
        }
        Ok(())
    }

    fn notify_return(&mut self) -> LuaResult<()> {
        if self.hook.is_some() {
            let co = self.coroutine.clone();
            if let Some(mut hook) = self.hook.take() {
                let result = hook.on_return(&co);
                self.hook = Some(hook);
                result?;
            }
        }
        Ok(())
    }

    /// Dispatch one instruction of the current context.
    fn step(&mut self, ctx: &mut ExecContext) -> LuaResult<Flow> {
        let code = self.fetch(ctx)?;
        self.notify_instruction()?;

        match get_op(code) {
            OP_MOVE => {
                let a = get_a8(code);
                let b = get_b9(code);
                ctx.frame.set(a, ctx.frame.get(b))?;
            }

            OP_LOADK => {
                let a = get_a8(code);
                let bx = get_bx(code);
                ctx.frame.set(a, self.konst(ctx, bx)?)?;
            }

            OP_LOADBOOL => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);
                ctx.frame.set(a, LuaValue::Boolean(b != 0))?;
                if c != 0 {
                    ctx.frame.bump_pc(1);
                }
            }

            OP_LOADNIL => {
                let a = get_a8(code);
                let b = get_b9(code);
                ctx.frame.stack_clear(a, b);
            }

            OP_GETUPVAL => {
                let a = get_a8(code);
                let b = get_b9(code);
                let cell = ctx
                    .closure
                    .upvalue(b)
                    .ok_or_else(|| LuaError::bytecode("upvalue index out of range"))?;
                let value = cell.borrow().get();
                ctx.frame.set(a, value)?;
            }

            OP_SETUPVAL => {
                let a = get_a8(code);
                let b = get_b9(code);
                let cell = ctx
                    .closure
                    .upvalue(b)
                    .ok_or_else(|| LuaError::bytecode("upvalue index out of range"))?;
                let value = ctx.frame.get(a);
                cell.borrow_mut().set(value);
            }

            OP_GETGLOBAL => {
                let a = get_a8(code);
                let bx = get_bx(code);
                let key = self.konst(ctx, bx)?;
                let env = LuaValue::Table(ctx.closure.env());
                let value = self.table_get(&env, &key)?;
                ctx.frame.set(a, value)?;
            }

            OP_SETGLOBAL => {
                let a = get_a8(code);
                let bx = get_bx(code);
                let key = self.konst(ctx, bx)?;
                let env = LuaValue::Table(ctx.closure.env());
                let value = ctx.frame.get(a);
                self.table_set(&env, &key, value)?;
            }

            OP_GETTABLE => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);

                let table = ctx.frame.get(b);
                let key = self.rk(ctx, c)?;

                let is_table = matches!(table, LuaValue::Table(_));
                if !is_table && self.get_meta_value(&table, "__index").is_nil() {
                    return Err(self.slot_error(ctx, b, "attempt to index", &table));
                }

                let value = self.table_get(&table, &key)?;
                ctx.frame.set(a, value)?;
            }

            OP_SETTABLE => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);

                let table = ctx.frame.get(a);
                let key = self.rk(ctx, b)?;
                let value = self.rk(ctx, c)?;

                let is_table = matches!(table, LuaValue::Table(_));
                if !is_table && self.get_meta_value(&table, "__newindex").is_nil() {
                    return Err(self.slot_error(ctx, a, "attempt to index", &table));
                }

                self.table_set(&table, &key, value)?;
            }

            OP_NEWTABLE => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);
                ctx.frame
                    .set(a, LuaValue::table(LuaTable::with_capacity(b, c)))?;
            }

            OP_SELF => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);

                let table = ctx.frame.get(b);
                let key = self.rk(ctx, c)?;

                let value = self.table_get(&table, &key)?;
                ctx.frame.set(a, value)?;
                ctx.frame.set(a + 1, table)?;
            }

            OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MOD | OP_POW => {
                let op = get_op(code);
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);

                let lhs = self.rk(ctx, b)?;
                let rhs = self.rk(ctx, c)?;

                if let (LuaValue::Number(x), LuaValue::Number(y)) = (&lhs, &rhs) {
                    let (x, y) = (*x, *y);
                    let result = match op {
                        OP_ADD => x + y,
                        OP_SUB => x - y,
                        OP_MUL => x * y,
                        OP_DIV => x / y,
                        // Floored modulo: the result follows the divisor's sign
                        OP_MOD => x - (x / y).floor() * y,
                        _ => x.powf(y),
                    };
                    ctx.frame.set(a, LuaValue::Number(result))?;
                } else {
                    let event = meta_op_name(op).unwrap_or("__add");
                    let mut meta = LuaValue::Nil;

                    if !lhs.is_number() {
                        meta = self.get_meta_value(&lhs, event);
                        if meta.is_nil() {
                            return Err(self.slot_error(
                                ctx,
                                b,
                                "attempt to perform arithmetic on",
                                &lhs,
                            ));
                        }
                    }
                    if meta.is_nil() && !rhs.is_number() {
                        meta = self.get_meta_value(&rhs, event);
                        if meta.is_nil() {
                            return Err(self.slot_error(
                                ctx,
                                c,
                                "attempt to perform arithmetic on",
                                &rhs,
                            ));
                        }
                    }

                    let result = self.call_value(&meta, &[lhs, rhs])?;
                    ctx.frame.set(a, result)?;
                }
            }

            OP_UNM => {
                let a = get_a8(code);
                let b = get_b9(code);
                let value = ctx.frame.get(b);

                match value {
                    LuaValue::Number(n) => ctx.frame.set(a, LuaValue::Number(-n))?,
                    other => {
                        let meta = self.get_meta_value(&other, "__unm");
                        if meta.is_nil() {
                            return Err(self.slot_error(
                                ctx,
                                b,
                                "attempt to perform arithmetic on",
                                &other,
                            ));
                        }
                        let result = self.call_value(&meta, &[other])?;
                        ctx.frame.set(a, result)?;
                    }
                }
            }

            OP_NOT => {
                let a = get_a8(code);
                let b = get_b9(code);
                let value = ctx.frame.get(b);
                ctx.frame.set(a, LuaValue::Boolean(!value.is_truthy()))?;
            }

            OP_LEN => {
                let a = get_a8(code);
                let b = get_b9(code);
                let value = ctx.frame.get(b);

                match &value {
                    LuaValue::Table(table) => {
                        let border = table.borrow().maxn();
                        ctx.frame.set(a, LuaValue::Number(border as f64))?;
                    }
                    LuaValue::String(s) => {
                        ctx.frame.set(a, LuaValue::Number(s.len() as f64))?;
                    }
                    other => {
                        let meta = self.get_meta_value(other, "__len");
                        if meta.is_nil() {
                            return Err(self.slot_error(
                                ctx,
                                b,
                                "attempt to get length of",
                                other,
                            ));
                        }
                        let result = self.call_value(&meta, &[other.clone()])?;
                        ctx.frame.set(a, result)?;
                    }
                }
            }

            OP_CONCAT => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);
                let result = self.concat_range(ctx, b, c)?;
                ctx.frame.set(a, result)?;
            }

            OP_JMP => {
                ctx.frame.bump_pc(get_sbx(code));
            }

            OP_EQ | OP_LT | OP_LE => {
                let op = get_op(code);
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);

                let lhs = self.rk(ctx, b)?;
                let rhs = self.rk(ctx, c)?;

                if self.compare(&lhs, &rhs, op)? != (a == 1) {
                    ctx.frame.bump_pc(1);
                }
            }

            OP_TEST => {
                let a = get_a8(code);
                let c = get_c9(code);
                if ctx.frame.get(a).is_truthy() == (c == 0) {
                    ctx.frame.bump_pc(1);
                }
            }

            OP_TESTSET => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);

                let value = ctx.frame.get(b);
                if value.is_truthy() != (c == 0) {
                    ctx.frame.set(a, value)?;
                } else {
                    ctx.frame.bump_pc(1);
                }
            }

            OP_CALL => {
                let a = get_a8(code);
                let b = get_b9(code);
                let c = get_c9(code);

                self.notify_call()?;

                let mut call_arg_count = b as i32 - 1;
                if call_arg_count != -1 {
                    ctx.frame.set_top(a + call_arg_count as usize + 1)?;
                } else {
                    call_arg_count = ctx.frame.get_top() as i32 - a as i32 - 1;
                    if call_arg_count < 0 {
                        return Err(LuaError::bytecode("malformed open call"));
                    }
                }
                ctx.frame.set_restore_top(c != 0);

                let base = ctx.frame.local_base();
                let mut callee_base = base + a + 1;
                let callee_return = base + a;

                let mut func = ctx.frame.get(a);
                if !func.is_callable() {
                    // __call substitution: the original callee becomes the
                    // implicit first argument
                    let meta = self.get_meta_value(&func, "__call");
                    if meta != func {
                        func = meta;
                        callee_base = callee_return;
                        call_arg_count += 1;
                    }
                }

                match func {
                    LuaValue::Function(LuaFunction::Closure(closure)) => {
                        let can_yield = ctx.frame.can_yield();
                        let co = self.coroutine.clone();
                        let index = co.borrow_mut().push_call_frame(
                            closure,
                            callee_base,
                            callee_return,
                            call_arg_count,
                        )?;
                        {
                            let mut inner = co.borrow_mut();
                            if let Some(frame) = inner.frame_mut(index) {
                                frame.from_lua = true;
                                frame.can_yield = can_yield;
                            }
                        }

                        let handle = FrameHandle::new(co, index);
                        handle.init()?;

                        *ctx = self
                            .reload_context()?
                            .ok_or_else(|| LuaError::runtime("lost call frame"))?;
                    }
                    LuaValue::Function(LuaFunction::Native(native)) => {
                        self.call_native(native, callee_base, callee_return, call_arg_count)?;

                        match self.reload_context()? {
                            // Back from a yield into the host boundary
                            None => return Ok(Flow::Exit),
                            Some(reloaded) => *ctx = reloaded,
                        }
                    }
                    other => {
                        return Err(self.slot_error(ctx, a, "attempt to call", &other));
                    }
                }
            }

            OP_TAILCALL => {
                let a = get_a8(code);
                let b = get_b9(code);

                self.notify_call()?;

                let mut call_arg_count = b as i32 - 1;
                if call_arg_count == -1 {
                    call_arg_count = ctx.frame.get_top() as i32 - a as i32 - 1;
                    if call_arg_count < 0 {
                        return Err(LuaError::bytecode("malformed open call"));
                    }
                }
                ctx.frame.set_restore_top(false);

                let base = ctx.frame.local_base();
                let return_base = ctx.frame.return_base();
                let mut callee_base = return_base + 1;

                self.coroutine.borrow_mut().close_upvalues(base);

                let mut func = ctx.frame.get(a);
                if !func.is_callable() {
                    let meta = self.get_meta_value(&func, "__call");
                    if meta != func {
                        func = meta;
                        callee_base = return_base;
                        call_arg_count += 1;
                    }
                }

                // Reuse the current frame's window: callee and arguments
                // slide down over it
                {
                    let mut co = self.coroutine.borrow_mut();
                    co.stack_copy(base + a, return_base, call_arg_count as usize + 1);
                    co.set_top(return_base + call_arg_count as usize + 1)?;
                }

                match func {
                    LuaValue::Function(LuaFunction::Closure(closure)) => {
                        {
                            let mut co = self.coroutine.borrow_mut();
                            if let Some(frame) = co.frame_mut(ctx.frame.index) {
                                frame.local_base = callee_base;
                                frame.arg_count = call_arg_count;
                                frame.closure = Some(closure);
                                frame.function = None;
                            }
                        }
                        ctx.frame.init()?;

                        *ctx = self
                            .reload_context()?
                            .ok_or_else(|| LuaError::runtime("lost call frame"))?;
                    }
                    LuaValue::Function(LuaFunction::Native(native)) => {
                        let caller = self.coroutine.clone();
                        let from_lua = {
                            let inner = caller.borrow();
                            inner
                                .frame(ctx.frame.index)
                                .map(|frame| frame.from_lua)
                                .unwrap_or(false)
                        };

                        self.call_native(native, callee_base, return_base, call_arg_count)?;

                        // The tail-calling frame is finished; its results
                        // already sit in the return window
                        caller.borrow_mut().pop_call_frame();

                        if !Rc::ptr_eq(&caller, &self.coroutine) {
                            if caller.borrow().is_dead() {
                                if Rc::ptr_eq(&caller, &self.root) {
                                    return Err(LuaError::runtime(
                                        "implicit yield in the root coroutine",
                                    ));
                                }
                                let parent_is_caller = self
                                    .coroutine
                                    .borrow()
                                    .parent()
                                    .map(|parent| Rc::ptr_eq(&parent, &caller))
                                    .unwrap_or(false);
                                if parent_is_caller {
                                    return Err(LuaError::runtime(
                                        "implicit yield across a tail call",
                                    ));
                                }
                            }

                            match self.reload_context()? {
                                None => return Ok(Flow::Exit),
                                Some(reloaded) => *ctx = reloaded,
                            }
                        } else {
                            if !from_lua {
                                return Ok(Flow::Exit);
                            }
                            match self.reload_context()? {
                                None => return Ok(Flow::Exit),
                                Some(reloaded) => *ctx = reloaded,
                            }
                        }
                    }
                    other => {
                        return Err(self.slot_error(ctx, a, "attempt to call", &other));
                    }
                }
            }

            OP_RETURN => {
                let a = get_a8(code);
                let b = get_b9(code) as i32 - 1;

                self.notify_return()?;

                let base = ctx.frame.local_base();
                self.coroutine.borrow_mut().close_upvalues(base);

                let count = if b == -1 {
                    ctx.frame.get_top().saturating_sub(a)
                } else {
                    b as usize
                };

                let return_base = ctx.frame.return_base();
                {
                    let mut co = self.coroutine.borrow_mut();
                    co.stack_copy(base + a, return_base, count);
                    co.set_top(return_base + count)?;
                }

                let (from_lua, can_yield) = {
                    let inner = self.coroutine.borrow();
                    match inner.frame(ctx.frame.index) {
                        Some(frame) => (frame.from_lua, frame.can_yield),
                        None => (false, false),
                    }
                };

                if from_lua {
                    let co = self.coroutine.clone();

                    if can_yield && co.borrow().is_at_bottom() {
                        // The coroutine's root frame returned: deliver the
                        // results to the parent as an implicit final yield
                        {
                            let mut inner = co.borrow_mut();
                            if let Some(frame) = inner.frame_mut(ctx.frame.index) {
                                frame.local_base = frame.return_base;
                            }
                        }
                        let handle = ctx.frame.clone();
                        self.do_yield(&handle, &handle, count)?;
                        co.borrow_mut().pop_call_frame();

                        match self.reload_context()? {
                            None => return Ok(Flow::Exit),
                            Some(reloaded) => *ctx = reloaded,
                        }
                    } else {
                        co.borrow_mut().pop_call_frame();
                        match self.reload_context()? {
                            None => return Ok(Flow::Exit),
                            Some(reloaded) => *ctx = reloaded,
                        }
                    }
                } else {
                    self.coroutine.borrow_mut().pop_call_frame();
                    return Ok(Flow::Exit);
                }
            }

            OP_FORLOOP => {
                let a = get_a8(code);

                let index = ctx
                    .frame
                    .get(a)
                    .as_number()
                    .ok_or_else(|| LuaError::type_error("'for' loop variable must be a number"))?;
                let limit = ctx
                    .frame
                    .get(a + 1)
                    .as_number()
                    .ok_or_else(|| LuaError::type_error("'for' limit must be a number"))?;
                let step = ctx
                    .frame
                    .get(a + 2)
                    .as_number()
                    .ok_or_else(|| LuaError::type_error("'for' step must be a number"))?;

                let index = index + step;

                let continuing = if step > 0.0 {
                    index <= limit
                } else {
                    index >= limit
                };

                if continuing {
                    ctx.frame.bump_pc(get_sbx(code));
                    ctx.frame.set(a, LuaValue::Number(index))?;
                    ctx.frame.set(a + 3, LuaValue::Number(index))?;
                } else {
                    ctx.frame.clear_from_index(a)?;
                }
            }

            OP_FORPREP => {
                let a = get_a8(code);

                let index = ctx.frame.get(a);
                let step = ctx.frame.get(a + 2);

                let (Some(index), Some(step)) = (index.as_number(), step.as_number()) else {
                    return Err(LuaError::type_error("invalid for preparation"));
                };

                ctx.frame.set(a, LuaValue::Number(index - step))?;
                ctx.frame.bump_pc(get_sbx(code));
            }

            OP_TFORLOOP => {
                let a = get_a8(code);
                let c = get_c9(code);

                ctx.frame.set_top(a + 6)?;
                ctx.frame.stack_copy(a, a + 3, 3);
                self.call(2)?;
                ctx.frame.clear_from_index(a + c + 3)?;
                ctx.frame.set_top(ctx.proto.max_stacksize)?;

                let control = ctx.frame.get(a + 3);
                if !control.is_nil() {
                    ctx.frame.set(a + 2, control)?;
                } else {
                    ctx.frame.bump_pc(1);
                }
            }

            OP_SETLIST => {
                let a = get_a8(code);
                let mut b = get_b9(code);
                let mut c = get_c9(code);

                if b == 0 {
                    b = ctx.frame.get_top().saturating_sub(a + 1);
                }
                if c == 0 {
                    c = self.fetch(ctx)? as usize;
                }

                let offset = (c - 1) * FIELDS_PER_FLUSH;

                let LuaValue::Table(table) = ctx.frame.get(a) else {
                    return Err(LuaError::bytecode("SETLIST target is not a table"));
                };
                for index in 1..=b {
                    let value = ctx.frame.get(a + index);
                    table.borrow_mut().rawset_int((offset + index) as i64, value);
                }

                // Restore the window in case a trailing multret moved it
                ctx.frame.set_top(ctx.proto.max_stacksize)?;
            }

            OP_CLOSE => {
                ctx.frame.close_upvalues(get_a8(code));
            }

            OP_CLOSURE => {
                let a = get_a8(code);
                let bx = get_bx(code);

                let new_proto = ctx
                    .proto
                    .prototypes
                    .get(bx)
                    .cloned()
                    .ok_or_else(|| LuaError::bytecode("prototype index out of range"))?;
                let num_upvalues = new_proto.num_upvalues;

                let new_closure = Rc::new(LuaClosure::new(new_proto, ctx.closure.env()));
                ctx.frame
                    .set(a, LuaValue::closure(new_closure.clone()))?;

                // The pseudo-instructions following CLOSURE bind each
                // upvalue: MOVE captures an enclosing local (sharing the
                // open cell), GETUPVAL re-shares one of ours
                for _ in 0..num_upvalues {
                    let pseudo = self.fetch(ctx)?;
                    let b = get_b9(pseudo);

                    let cell = match get_op(pseudo) {
                        OP_MOVE => ctx.frame.find_upvalue(b),
                        OP_GETUPVAL => ctx
                            .closure
                            .upvalue(b)
                            .ok_or_else(|| LuaError::bytecode("upvalue index out of range"))?,
                        _ => {
                            return Err(LuaError::bytecode(
                                "malformed closure pseudo-instruction",
                            ));
                        }
                    };
                    new_closure.upvalues.borrow_mut().push(cell);
                }
            }

            OP_VARARG => {
                let a = get_a8(code);
                let b = get_b9(code);
                ctx.frame.push_varargs(a, b as i32 - 1)?;
            }

            unknown => {
                return Err(LuaError::bytecode(format!(
                    "broken bytecode (unknown opcode {})",
                    unknown
                )));
            }
        }

        Ok(Flow::Continue)
    }

    /// Left-to-right concatenation over `[from, to]`, batching adjacent
    /// stringifiable values and dispatching `__concat` for the rest.
    fn concat_range(&mut self, ctx: &ExecContext, from: usize, to: usize) -> LuaResult<LuaValue> {
        fn stringify(value: &LuaValue) -> Option<String> {
            match value {
                LuaValue::Nil => Some("nil".to_string()),
                LuaValue::String(s) => Some(s.to_string()),
                LuaValue::Number(n) => Some(number_to_string(*n)),
                _ => None,
            }
        }

        let mut result = LuaValue::string("");
        let mut index = from;

        while index <= to {
            let mut pending = Some(ctx.frame.get(index));
            let mut text = stringify(pending.as_ref().unwrap_or(&LuaValue::Nil));

            if matches!(result, LuaValue::String(_)) && text.is_some() {
                let mut buffer = match &result {
                    LuaValue::String(s) => s.to_string(),
                    _ => String::new(),
                };
                loop {
                    if let Some(chunk) = &text {
                        buffer.push_str(chunk);
                    }
                    index += 1;
                    if index > to {
                        pending = None;
                        break;
                    }
                    let value = ctx.frame.get(index);
                    text = stringify(&value);
                    pending = Some(value);
                    if text.is_none() {
                        break;
                    }
                }
                result = LuaValue::string(&buffer);
            }

            if let Some(operand) = pending {
                let meta = self.get_meta_value(&operand, "__concat");
                if !meta.is_callable() {
                    return Err(self.slot_error(ctx, index, "attempt to concatenate", &operand));
                }
                result = self.call_value(&meta, &[result, operand])?;
                index += 1;
            }
        }

        Ok(result)
    }

    /*
     * Error reporting and unwinding
     */

    /// Best-effort symbolic origin of `slot`, traced backwards through the
    /// instruction stream: a MOVE names a local, GETGLOBAL a global,
    /// GETUPVAL an upvalue, SELF a method.
    fn find_slot_origin(proto: &Prototype, pc: usize, slot: usize) -> Option<String> {
        let mut scan = pc as i64 - 2;

        while scan >= 0 {
            let code = proto.code[scan as usize];

            if get_a8(code) == slot {
                return match get_op(code) {
                    OP_MOVE => proto
                        .find_local_name(get_b9(code), pc)
                        .map(|name| name.to_string()),
                    OP_GETGLOBAL => proto
                        .constants
                        .get(get_bx(code))
                        .map(|name| format!("global {}", name.raw_tostring())),
                    OP_GETUPVAL => proto
                        .upvalue_names
                        .get(get_b9(code))
                        .map(|name| name.to_string()),
                    OP_SELF => proto
                        .constants
                        .get(get_c9(code).wrapping_sub(256))
                        .map(|name| format!("method {}", name.raw_tostring())),
                    _ => None,
                };
            }

            scan -= 1;
        }

        None
    }

    /// A type error annotated with the symbolic origin of the offending
    /// slot and the operand's runtime type.
    fn slot_error(
        &self,
        ctx: &ExecContext,
        slot: usize,
        message: &str,
        value: &LuaValue,
    ) -> LuaError {
        let origin = if slot < 256 {
            Self::find_slot_origin(&ctx.proto, ctx.frame.pc(), slot)
        } else {
            None
        };
        let origin = origin.unwrap_or_else(|| "?".to_string());

        LuaError::type_error(format!(
            "{} {} (a {} value)",
            message,
            origin,
            value.type_name()
        ))
    }

    /// Record a trace line for the coroutine's current frame, then pop it.
    fn trace_and_pop(&mut self, co: &CoroutineRef) {
        let described = {
            let inner = co.borrow();
            inner.current_frame_index().map(|index| {
                let frame = FrameHandle::new(co.clone(), index);
                let location = frame.source_location();

                let origin = match frame.closure() {
                    Some(closure) => {
                        let pc = frame.pc();
                        let proto = &closure.proto;
                        pc.checked_sub(1)
                            .and_then(|last| proto.code.get(last).copied())
                            .and_then(|last_code| {
                                Self::find_slot_origin(proto, pc, get_a8(last_code))
                            })
                            .unwrap_or_else(|| "unknown".to_string())
                    }
                    None => "native call".to_string(),
                };
                (origin, location)
            })
        };

        if let Some((origin, location)) = described {
            let mut inner = co.borrow_mut();
            inner.add_trace(&origin, &location);
            inner.pop_call_frame();
        }
    }

    /// The unwind protocol. Pops frames while accumulating the trace; an
    /// error that empties a resumed coroutine is converted into a failure
    /// triple delivered to the parent, an error that crosses a host-entered
    /// frame propagates out, and an error that empties the root is fatal.
    ///
    /// Returns `Ok(true)` when execution continues (in the parent
    /// coroutine), `Ok(false)` when control is back at a host boundary.
    fn unwind(&mut self, err: LuaError, ctx: &mut ExecContext) -> LuaResult<bool> {
        {
            let location = ctx.frame.source_location();
            self.coroutine
                .borrow_mut()
                .begin_stack_trace(&location, &err.message);
        }

        // Native frames above the failing Lua frame go first
        loop {
            let co = self.coroutine.clone();
            let on_top_is_lua = {
                let inner = co.borrow();
                match inner.current_frame_index().and_then(|i| inner.frame(i)) {
                    Some(frame) => frame.is_lua(),
                    None => break,
                }
            };
            if on_top_is_lua {
                break;
            }
            self.trace_and_pop(&co);
        }

        let mut do_throw = true;
        let mut unwound_base: Option<usize> = None;

        loop {
            let co = self.coroutine.clone();

            if co.borrow().is_dead() {
                // Close whatever captures the dead coroutine still holds
                co.borrow_mut().close_upvalues(0);

                let parent = co.borrow().parent();
                if let Some(parent) = parent {
                    // Convert into an implicit failed yield for the parent
                    let trace = co.borrow().stack_trace().to_string();
                    let delivery = [
                        LuaValue::Boolean(false),
                        err.cause(),
                        LuaValue::string(&trace),
                    ];

                    let receiver = parent.borrow().current_frame_index();
                    match receiver {
                        Some(index) => {
                            let handle = FrameHandle::new(parent.clone(), index);
                            for value in delivery {
                                handle.push(value)?;
                            }
                        }
                        None => {
                            let mut inner = parent.borrow_mut();
                            inner.set_top(3)?;
                            for (slot, value) in delivery.into_iter().enumerate() {
                                inner.stack_set(slot, value);
                            }
                        }
                    }

                    co.borrow_mut().reset_stack_trace();
                    co.borrow_mut().parent = None;
                    self.coroutine = parent;

                    match self.reload_context()? {
                        None => return Ok(false),
                        Some(reloaded) => {
                            *ctx = reloaded;
                            do_throw = false;
                        }
                    }
                }
                break;
            }

            let (from_lua, local_base) = {
                let inner = co.borrow();
                match inner.current_frame_index().and_then(|i| inner.frame(i)) {
                    Some(frame) => (frame.from_lua, frame.local_base),
                    None => break,
                }
            };

            self.trace_and_pop(&co);
            unwound_base = Some(local_base.min(unwound_base.unwrap_or(usize::MAX)));

            if !from_lua {
                break;
            }
        }

        // Close captures over the unwound region before handing the stack
        // back to whoever catches
        if do_throw {
            if let Some(limit) = unwound_base {
                self.coroutine.borrow_mut().close_upvalues(limit);
            }
        }

        if do_throw { Err(err) } else { Ok(true) }
    }
}

impl Default for LuaThread {
    fn default() -> Self {
        Self::new()
    }
}
