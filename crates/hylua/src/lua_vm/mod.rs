mod call_frame;
mod coroutine;
mod debug_hook;
mod lua_error;
pub mod opcode;
mod thread;
mod upvalue;

pub use call_frame::{CallFrame, Callable, FrameHandle, NativeFn, NativeFunction};
pub use coroutine::{
    Coroutine, CoroutineRef, INITIAL_FRAME_SIZE, INITIAL_STACK_SIZE, MAX_FRAME_SIZE,
    MAX_STACK_SIZE, find_upvalue,
};
pub use debug_hook::DebugHook;
pub use lua_error::{LuaError, LuaErrorKind, LuaResult};
pub use thread::{LuaThread, MAX_INDEX_RECURSION};
pub use upvalue::UpValue;
