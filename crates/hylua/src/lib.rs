// Hybrid Lua Runtime
// A compact register-based Lua 5.1 VM core: values, hybrid tables, closures,
// coroutines and the opcode interpreter. Bytecode arrives as in-memory
// prototypes built by the host; the front-end compiler lives elsewhere.

#[cfg(test)]
mod test;

pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use lib_registry::{LibraryEntry, LibraryModule, LibraryRegistry};
pub use lua_value::{LocalVar, LuaClosure, LuaFunction, LuaTable, LuaValue, Prototype, TableRef};
pub use lua_vm::{
    Callable, CallFrame, Coroutine, CoroutineRef, DebugHook, FrameHandle, LuaError, LuaErrorKind,
    LuaResult, LuaThread, NativeFn, NativeFunction,
};
