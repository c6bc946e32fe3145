use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::lua_value::LuaValue;
use crate::lua_vm::Coroutine;

/// A closure capture cell.
///
/// Open while the captured local still lives on a coroutine stack — reads
/// and writes go through to the live slot — and closed (owning a private
/// copy) once that scope exits. The transition happens exactly once, in
/// place, so every closure sharing the cell observes it; cells are shared
/// by identity between closures capturing the same enclosing local.
pub enum UpValue {
    Open {
        coroutine: Weak<RefCell<Coroutine>>,
        index: usize,
    },
    Closed(LuaValue),
}

impl UpValue {
    pub fn open(coroutine: &Rc<RefCell<Coroutine>>, index: usize) -> Self {
        UpValue::Open {
            coroutine: Rc::downgrade(coroutine),
            index,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, UpValue::Open { .. })
    }

    /// Stack slot of an open cell; meaningless once closed (closed cells
    /// never sit on a coroutine's open list).
    pub fn stack_index(&self) -> usize {
        match self {
            UpValue::Open { index, .. } => *index,
            UpValue::Closed(_) => usize::MAX,
        }
    }

    pub fn get(&self) -> LuaValue {
        match self {
            UpValue::Open { coroutine, index } => match coroutine.upgrade() {
                Some(co) => co.borrow().stack_get(*index),
                None => LuaValue::Nil,
            },
            UpValue::Closed(value) => value.clone(),
        }
    }

    pub fn set(&mut self, value: LuaValue) {
        match self {
            UpValue::Open { coroutine, index } => {
                if let Some(co) = coroutine.upgrade() {
                    co.borrow_mut().stack_set(*index, value);
                }
            }
            UpValue::Closed(slot) => *slot = value,
        }
    }

    /// One-way transition to the owned state. The current slot value is
    /// read by the caller (which already holds the coroutine) to avoid a
    /// re-entrant borrow.
    pub fn close_with(&mut self, value: LuaValue) {
        *self = UpValue::Closed(value);
    }
}
