// Standard library: ordinary native callables built entirely on the
// public table/frame API.

pub mod basic;
pub mod coroutine;
pub mod math;
pub mod string;
pub mod table;
