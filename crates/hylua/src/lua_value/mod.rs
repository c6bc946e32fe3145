mod lua_closure;
mod lua_table;
mod lua_value;

pub use lua_closure::{LocalVar, LuaClosure, Prototype};
pub use lua_table::{
    ARRAY_LOAD_FACTOR, HASH_LOAD_FACTOR, INITIAL_ARRAY_SIZE, INITIAL_HASH_SIZE, LuaTable, TableRef,
};
pub use lua_value::{LuaFunction, LuaValue};

pub(crate) use lua_value::number_to_string;
