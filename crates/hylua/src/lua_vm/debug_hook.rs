use crate::lua_vm::{CoroutineRef, LuaResult};

/// Host-installed execution hook.
///
/// `on_instruction` fires before every dispatched opcode; returning an
/// error aborts the running coroutine through the normal unwind path,
/// which is the supported way to stop a runaway script (there is no
/// preemption).
pub trait DebugHook {
    fn on_instruction(&mut self, coroutine: &CoroutineRef) -> LuaResult<()>;

    fn on_call(&mut self, coroutine: &CoroutineRef) -> LuaResult<()> {
        let _ = coroutine;
        Ok(())
    }

    fn on_return(&mut self, coroutine: &CoroutineRef) -> LuaResult<()> {
        let _ = coroutine;
        Ok(())
    }
}
