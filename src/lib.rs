//! A Lua 5.4-compatible compiler front end and register-based virtual
//! machine, structured the way an embeddable scripting engine is: a lexer
//! and recursive-descent parser feeding a register allocator/bytecode
//! emitter, a binary chunk reader/writer, and a flat-dispatch VM with
//! symmetric coroutines and a standard library installed on top.

pub mod arena;
pub mod ast;
pub mod chunk;
pub mod codegen;
pub mod compiler;
pub mod error;
pub mod handle;
pub mod heap;
pub mod lexer;
pub mod metamethod;
pub mod opcode;
pub mod parser;
pub mod register;
pub mod stdlib;
pub mod value;
pub mod vm;
pub mod weak_table;

pub use error::{ErrorKind, LuaError, Result};
pub use value::Value;
pub use vm::{Limits, Vm};

use std::rc::Rc;

use handle::ClosureHandle;
use value::{Closure, Proto};
use vm::UpvalueCell;

/// Top-level embedding handle: a [`Vm`] with the standard library already
/// installed. Mirrors the reference `lua_State` + `luaL_openlibs` pairing.
pub struct Lua {
    vm: Vm,
}

impl Lua {
    pub fn new() -> Self {
        let mut vm = Vm::new();
        stdlib::install(&mut vm);
        Lua { vm }
    }

    pub fn with_limits(limits: Limits) -> Self {
        let mut vm = Vm::with_limits(limits);
        stdlib::install(&mut vm);
        Lua { vm }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Compiles `source` and wraps it in a closure whose sole upvalue
    /// (`_ENV`) is closed over this VM's globals table.
    pub fn load(&mut self, source: &str, chunk_name: impl Into<String>) -> Result<ClosureHandle> {
        let proto = compile_source(&mut self.vm, source, chunk_name)?;
        Ok(self.wrap_main_proto(proto))
    }

    /// Compiles and runs `source` to completion, returning its results.
    pub fn exec(&mut self, source: &str, chunk_name: impl Into<String>) -> Result<Vec<Value>> {
        let closure = self.load(source, chunk_name)?;
        self.vm.call_closure(closure, Vec::new())
    }

    /// Wraps an already-compiled (or deserialized-from-a-binary-chunk)
    /// [`Proto`] in a closure over this VM's globals, bypassing
    /// lex/parse/compile. Used by embedders driving [`crate::chunk::read_chunk`]
    /// directly and by this crate's own round-trip tests.
    pub fn load_proto(&mut self, proto: Rc<Proto>) -> ClosureHandle {
        self.wrap_main_proto(proto)
    }

    fn wrap_main_proto(&mut self, proto: Rc<Proto>) -> ClosureHandle {
        let globals = self.vm.heap.globals();
        let env_cell = self.vm.heap.create_upvalue(UpvalueCell::Closed(Value::Table(globals)));
        self.vm.heap.create_closure(Closure { proto, upvalues: vec![env_cell] })
    }
}

impl Default for Lua {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared by `Lua::load` and `stdlib::base::load`/`require`: lex, parse and
/// compile `source` into a top-level [`Proto`] without wrapping it in a
/// closure yet (callers differ in which `_ENV` they close over).
pub fn compile_source(vm: &mut Vm, source: &str, chunk_name: impl Into<String>) -> Result<Rc<Proto>> {
    let chunk_name = chunk_name.into();
    let parser = parser::Parser::new(source.as_bytes(), chunk_name.clone())?;
    let chunk = parser.parse_chunk()?;
    compiler::compile_chunk(&mut vm.heap, chunk, chunk_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_simple_table_sum() {
        let mut lua = Lua::new();
        let results = lua.exec("local t = {1,2,3}; return t[1]+t[2]+t[3]", "=test").unwrap();
        assert_eq!(results, vec![Value::Integer(6)]);
    }

    #[test]
    fn closure_over_upvalue() {
        let mut lua = Lua::new();
        let results = lua
            .exec("local function mk(x) return function() return x end end; return mk(7)()", "=test")
            .unwrap();
        assert_eq!(results, vec![Value::Integer(7)]);
    }

    #[test]
    fn pcall_catches_error_with_location_prefix() {
        let mut lua = Lua::new();
        let results = lua
            .exec("local ok, err = pcall(function() error(\"boom\", 1) end); return ok, err", "=test")
            .unwrap();
        assert_eq!(results[0], Value::Boolean(false));
        match &results[1] {
            Value::String(_) => {}
            other => panic!("expected string error, got {:?}", other),
        }
    }
}
