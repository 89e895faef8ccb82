//! `package`/`require`: an in-process module cache only — no filesystem
//! search, since this embedding has no `io` file layer (`§3` ambient-stack
//! notes). `package.preload` lets an embedder register module bodies as
//! Lua closures or native functions ahead of time; `require` then just
//! drives `stdlib::base::compile_for_load`-style execution and caches by
//! name in `package.loaded`.

use crate::error::{LuaError, Result};
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib, set_field};

pub fn init_package_lib(vm: &mut Vm) {
    let lib = register_lib(vm, "package", &[]);
    let loaded = vm.heap.create_table();
    let preload = vm.heap.create_table();
    set_field(vm, lib, "loaded", Value::Table(loaded));
    set_field(vm, lib, "preload", Value::Table(preload));
    let path = vm.heap.intern_str("./?.lua;./?/init.lua");
    set_field(vm, lib, "path", Value::String(path));

    let require_fn = vm.heap.intern_str("require");
    let globals = vm.heap.globals();
    vm.heap.table_mut(globals).unwrap().set(Value::String(require_fn), Value::CFunction(require));
}

fn package_table(ctx: &mut dyn ExecutionContext) -> Result<crate::handle::TableHandle> {
    let key = ctx.heap_mut().intern_str("package");
    match ctx.heap().table(ctx.heap().globals())?.get(&Value::String(key)) {
        Value::Table(t) => Ok(t),
        _ => Err(LuaError::Internal("package table missing".into())),
    }
}

fn require(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let name_bytes = check::string_bytes(ctx, 0, "require")?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    let pkg = package_table(ctx)?;

    let loaded_key = ctx.heap_mut().intern_str("loaded");
    let loaded = match ctx.heap().table(pkg)?.get(&Value::String(loaded_key)) {
        Value::Table(t) => t,
        _ => return Err(LuaError::Internal("package.loaded missing".into())),
    };
    let name_key = ctx.heap_mut().intern_str(&name);
    let existing = ctx.heap().table(loaded)?.get(&Value::String(name_key));
    if !existing.is_nil() {
        ctx.push_result(existing);
        return Ok(1);
    }

    let preload_key = ctx.heap_mut().intern_str("preload");
    let preload = match ctx.heap().table(pkg)?.get(&Value::String(preload_key)) {
        Value::Table(t) => t,
        _ => return Err(LuaError::Internal("package.preload missing".into())),
    };
    let loader = ctx.heap().table(preload)?.get(&Value::String(name_key));
    if loader.is_nil() {
        return Err(LuaError::runtime(format!(
            "module '{}' not found: no field package.preload['{}']",
            name, name
        )));
    }

    let name_val = Value::String(name_key);
    let results = ctx.call_value(loader, vec![name_val])?;
    let value = results.into_iter().next().unwrap_or(Value::Boolean(true));
    ctx.heap_mut().table_mut(loaded)?.set(Value::String(name_key), value.clone());
    ctx.push_result(value);
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lua;

    #[test]
    fn require_reads_from_preload_and_caches() {
        let mut lua = Lua::new();
        let results = lua
            .exec(
                "package.preload['m'] = function() return 42 end; \
                 local a = require('m'); local b = require('m'); return a, b",
                "=test",
            )
            .unwrap();
        assert_eq!(results, vec![Value::Integer(42), Value::Integer(42)]);
    }
}
