use std::cell::RefCell;
use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::{LuaValue, TableRef};
use crate::lua_vm::UpValue;

/// Debug live range of one local variable, in instruction indices.
pub struct LocalVar {
    pub name: SmolStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// The immutable compiled template for one function body.
///
/// Built once by the host (compiler or bytecode loader) and shared
/// read-only by every closure instantiated from it. The engine performs
/// best-effort bounds checks on operands and constant indices; a malformed
/// prototype surfaces as a runtime error, not undefined behavior.
pub struct Prototype {
    pub code: Vec<u32>,
    /// Nil, booleans, numbers and strings only.
    pub constants: Vec<LuaValue>,
    pub prototypes: Vec<Rc<Prototype>>,

    pub num_params: usize,
    pub is_vararg: bool,
    pub num_upvalues: usize,
    pub max_stacksize: usize,

    pub source: SmolStr,

    // Debug info; all optional (empty when stripped)
    pub lines: Vec<u32>,
    pub locals: Vec<LocalVar>,
    pub upvalue_names: Vec<SmolStr>,
}

impl Prototype {
    /// Name of the local occupying `slot` at instruction `pc`, if the
    /// debug tables carry it.
    pub fn find_local_name(&self, slot: usize, pc: usize) -> Option<&str> {
        let mut slot = slot as isize;
        for local in &self.locals {
            if local.start_pc as usize > pc {
                break;
            }
            if local.end_pc as usize >= pc {
                if slot == 0 {
                    return Some(&local.name);
                }
                slot -= 1;
            }
        }
        None
    }

    /// `source:line` of the instruction preceding `pc` (the one being
    /// executed once the counter has advanced past it).
    pub fn source_location(&self, pc: usize) -> String {
        if self.lines.is_empty() {
            return format!("{}:-1", self.source);
        }
        match pc.checked_sub(1).and_then(|index| self.lines.get(index)) {
            Some(line) => format!("{}:{}", self.source, line),
            None => format!("{}:-1", self.source),
        }
    }
}

/// A prototype bound to an environment table and its captured upvalues.
///
/// The upvalue array is populated by the CLOSURE pseudo-instructions right
/// after construction; cells are shared between closures capturing the
/// same enclosing local.
pub struct LuaClosure {
    pub proto: Rc<Prototype>,
    pub env: RefCell<TableRef>,
    pub upvalues: RefCell<Vec<Rc<RefCell<UpValue>>>>,
}

impl LuaClosure {
    pub fn new(proto: Rc<Prototype>, env: TableRef) -> Self {
        Self {
            proto,
            env: RefCell::new(env),
            upvalues: RefCell::new(Vec::new()),
        }
    }

    pub fn env(&self) -> TableRef {
        self.env.borrow().clone()
    }

    pub fn set_env(&self, env: TableRef) {
        *self.env.borrow_mut() = env;
    }

    pub fn upvalue(&self, index: usize) -> Option<Rc<RefCell<UpValue>>> {
        self.upvalues.borrow().get(index).cloned()
    }
}
