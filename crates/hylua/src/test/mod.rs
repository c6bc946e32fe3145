// Engine tests. The front-end compiler is out of scope, so programs are
// assembled in memory with ProtoBuilder and the opcode encode helpers.

mod test_coroutine;
mod test_errors;
mod test_stdlib;

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::{LocalVar, LuaValue, Prototype};

pub struct ProtoBuilder {
    code: Vec<u32>,
    constants: Vec<LuaValue>,
    prototypes: Vec<Rc<Prototype>>,
    num_params: usize,
    is_vararg: bool,
    num_upvalues: usize,
    max_stacksize: usize,
    source: SmolStr,
    lines: Vec<u32>,
    locals: Vec<LocalVar>,
    upvalue_names: Vec<SmolStr>,
}

impl ProtoBuilder {
    pub fn new(source: &str) -> Self {
        Self {
            code: Vec::new(),
            constants: Vec::new(),
            prototypes: Vec::new(),
            num_params: 0,
            is_vararg: false,
            num_upvalues: 0,
            max_stacksize: 8,
            source: SmolStr::new(source),
            lines: Vec::new(),
            locals: Vec::new(),
            upvalue_names: Vec::new(),
        }
    }

    pub fn params(mut self, count: usize) -> Self {
        self.num_params = count;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn upvalues(mut self, count: usize) -> Self {
        self.num_upvalues = count;
        for index in 0..count {
            self.upvalue_names.push(SmolStr::new(format!("uv{}", index)));
        }
        self
    }

    pub fn max_stack(mut self, size: usize) -> Self {
        self.max_stacksize = size;
        self
    }

    pub fn local(mut self, name: &str, start_pc: u32, end_pc: u32) -> Self {
        self.locals.push(LocalVar {
            name: SmolStr::new(name),
            start_pc,
            end_pc,
        });
        self
    }

    /// Add a constant, returning its pool index.
    pub fn konst(&mut self, value: LuaValue) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn num(&mut self, n: f64) -> usize {
        self.konst(LuaValue::Number(n))
    }

    pub fn string(&mut self, s: &str) -> usize {
        self.konst(LuaValue::string(s))
    }

    pub fn child(&mut self, proto: Rc<Prototype>) -> usize {
        self.prototypes.push(proto);
        self.prototypes.len() - 1
    }

    pub fn emit(&mut self, code: u32) {
        self.code.push(code);
        self.lines.push(self.code.len() as u32);
    }

    pub fn build(self) -> Rc<Prototype> {
        Rc::new(Prototype {
            code: self.code,
            constants: self.constants,
            prototypes: self.prototypes,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            num_upvalues: self.num_upvalues,
            max_stacksize: self.max_stacksize,
            source: self.source,
            lines: self.lines,
            locals: self.locals,
            upvalue_names: self.upvalue_names,
        })
    }
}

/// Call a prototype as a closure over the thread's globals.
pub fn run(
    thread: &mut crate::LuaThread,
    proto: Rc<Prototype>,
    args: &[LuaValue],
) -> crate::LuaResult<Vec<LuaValue>> {
    let closure = thread.load_prototype(proto);
    thread.call_multret(&LuaValue::closure(closure), args)
}
