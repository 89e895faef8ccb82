//! Standard library: one module per Lua library table, each exposing an
//! `init_*_lib` entry point that installs its functions into a freshly
//! created table and binds that table as a global (`§3` of the expansion
//! notes). Every builtin is a `fn(&mut dyn ExecutionContext) -> Result<i32>`,
//! mirroring the teacher's `stdlib/*.rs` register-style bindings.

pub mod base;
pub mod bit32;
pub mod coroutine;
pub mod debug;
pub mod io;
pub mod math;
pub mod os;
pub mod package;
pub mod string;
pub mod table;
pub mod utf8;

use crate::handle::TableHandle;
use crate::value::{CFunction, Value};
use crate::vm::Vm;

/// Installs every standard library into `vm`'s globals, in the order the
/// reference `luaL_openlibs` does (base first, since later libraries use
/// `error`/`type` from it in their own argument-checking helpers).
pub fn install(vm: &mut Vm) {
    base::init_base_lib(vm);
    string::init_string_lib(vm);
    table::init_table_lib(vm);
    math::init_math_lib(vm);
    os::init_os_lib(vm);
    io::init_io_lib(vm);
    utf8::init_utf8_lib(vm);
    bit32::init_bit32_lib(vm);
    coroutine::init_coroutine_lib(vm);
    package::init_package_lib(vm);
    debug::init_debug_lib(vm);
}

/// Creates a new table, installs `functions` into it, and binds it as
/// `name` in globals. Returns the table handle so callers can add
/// additional entries (constants, sub-tables) afterward.
pub fn register_lib(vm: &mut Vm, name: &str, functions: &[(&str, CFunction)]) -> TableHandle {
    let lib = vm.heap.create_table();
    for (fname, f) in functions {
        set_field(vm, lib, fname, Value::CFunction(*f));
    }
    let key = vm.heap.intern_str(name);
    let globals = vm.heap.globals();
    vm.heap.table_mut(globals).unwrap().set(Value::String(key), Value::Table(lib));
    lib
}

pub fn set_field(vm: &mut Vm, table: TableHandle, name: &str, value: Value) {
    let key = vm.heap.intern_str(name);
    vm.heap.table_mut(table).unwrap().set(Value::String(key), value);
}

/// Argument-checking helpers shared across library modules, mirroring
/// `luaL_check*`'s "raise a runtime-arity/runtime-type error with the
/// argument position" convention (`§7`).
pub mod check {
    use crate::error::{ErrorKind, LuaError};
    use crate::value::Value;
    use crate::vm::ExecutionContext;

    pub fn arg(ctx: &dyn ExecutionContext, n: usize) -> Value {
        ctx.arg(n)
    }

    pub fn number(ctx: &dyn ExecutionContext, n: usize, fname: &str) -> crate::error::Result<f64> {
        ctx.arg(n)
            .as_float()
            .ok_or_else(|| bad_arg(n, fname, "number", &ctx.arg(n)))
    }

    pub fn integer(ctx: &dyn ExecutionContext, n: usize, fname: &str) -> crate::error::Result<i64> {
        match ctx.arg(n) {
            Value::Integer(i) => Ok(i),
            Value::Float(f) => Value::float_to_integer_exact(f)
                .ok_or_else(|| LuaError::Runtime { message: format!("bad argument #{} to '{}' (number has no integer representation)", n + 1, fname), kind: ErrorKind::RuntimeType }),
            other => Err(bad_arg(n, fname, "number", &other)),
        }
    }

    pub fn string_bytes(ctx: &dyn ExecutionContext, n: usize, fname: &str) -> crate::error::Result<Vec<u8>> {
        match ctx.arg(n) {
            Value::String(h) => Ok(ctx.heap().get_string(h)?.as_bytes().to_vec()),
            Value::Integer(i) => Ok(i.to_string().into_bytes()),
            Value::Float(_) => Ok(ctx.arg(n).to_string().into_bytes()),
            other => Err(bad_arg(n, fname, "string", &other)),
        }
    }

    pub fn table(ctx: &dyn ExecutionContext, n: usize, fname: &str) -> crate::error::Result<crate::handle::TableHandle> {
        match ctx.arg(n) {
            Value::Table(t) => Ok(t),
            other => Err(bad_arg(n, fname, "table", &other)),
        }
    }

    pub fn opt_integer(ctx: &dyn ExecutionContext, n: usize, fname: &str, default: i64) -> crate::error::Result<i64> {
        if ctx.arg(n).is_nil() {
            Ok(default)
        } else {
            integer(ctx, n, fname)
        }
    }

    pub fn bad_arg(n: usize, fname: &str, expected: &str, got: &Value) -> LuaError {
        LuaError::Runtime {
            message: format!("bad argument #{} to '{}' ({} expected, got {})", n + 1, fname, expected, got.type_name()),
            kind: ErrorKind::RuntimeArity,
        }
    }
}
