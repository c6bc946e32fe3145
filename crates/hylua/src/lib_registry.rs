// Library registration: a clean way to install native callables into the
// global environment. The registry is an explicit object owned by the
// embedder, not ambient static state.

use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_value::{LuaTable, LuaValue};
use crate::lua_vm::{LuaResult, LuaThread, NativeFn, NativeFunction};
use crate::stdlib;

/// Entry in a library module: a native function or a plain value.
pub enum LibraryEntry {
    Function(NativeFunction),
    Value(LuaValue),
}

/// A named module of natives and constants.
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, func: NativeFn) -> Self {
        self.entries
            .push((name, LibraryEntry::Function(NativeFunction { name, func })));
        self
    }

    pub fn with_value(mut self, name: &'static str, value: LuaValue) -> Self {
        self.entries.push((name, LibraryEntry::Value(value)));
        self
    }
}

/// Builder for library modules of plain native functions.
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:expr => $item:expr),* $(,)?
    }) => {{
        let mut module = $crate::lib_registry::LibraryModule::new($name);
        $(
            module = module.with_function($item_name, $item);
        )*
        module
    }};
}

/// Registry of library modules, loaded in insertion order.
pub struct LibraryRegistry {
    modules: Vec<LibraryModule>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: LibraryModule) {
        self.modules.push(module);
    }

    pub fn load_all(&self, thread: &mut LuaThread) -> LuaResult<()> {
        for module in &self.modules {
            self.load_module(thread, module)?;
        }
        Ok(())
    }

    pub fn load_module(&self, thread: &mut LuaThread, module: &LibraryModule) -> LuaResult<()> {
        fn entry_value(entry: &LibraryEntry) -> LuaValue {
            match entry {
                LibraryEntry::Function(function) => LuaValue::native(Rc::new(NativeFunction {
                    name: function.name,
                    func: function.func,
                })),
                LibraryEntry::Value(value) => value.clone(),
            }
        }

        if module.name == "_G" {
            // Globals register directly, not behind a module table
            for (name, entry) in &module.entries {
                thread.set_global(name, entry_value(entry));
            }
            return Ok(());
        }

        let table = Rc::new(RefCell::new(LuaTable::new()));
        for (name, entry) in &module.entries {
            table.borrow_mut().rawset_str(name, entry_value(entry));
        }
        thread.set_global(module.name, LuaValue::Table(table.clone()));

        // All strings share one metatable whose __index is the string
        // library, so s:upper() resolves
        if module.name == "string" {
            let meta = Rc::new(RefCell::new(LuaTable::new()));
            meta.borrow_mut()
                .rawset_str("__index", LuaValue::Table(table));
            thread.set_string_metatable(Some(meta));
        }

        Ok(())
    }

    pub fn get_module(&self, name: &str) -> Option<&LibraryModule> {
        self.modules.iter().find(|module| module.name == name)
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The standard registry: every library the engine ships.
pub fn create_standard_registry() -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();

    registry.register(stdlib::basic::create_basic_lib());
    registry.register(stdlib::coroutine::create_coroutine_lib());
    registry.register(stdlib::table::create_table_lib());
    registry.register(stdlib::math::create_math_lib());
    registry.register(stdlib::string::create_string_lib());

    registry
}
