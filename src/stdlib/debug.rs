//! `debug` library: a small, introspection-only subset backed by the
//! `ExecutionContext::traceback`/`location_at_level` machinery already
//! wired for `error`'s location prefix (`§4.7`), plus `sethook`/`gethook`
//! over the VM's call/return/line/count hook dispatcher and
//! `getlocal`/`setlocal` over `Proto.locals` (`§4.9`).

use crate::error::Result;
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib};

pub fn init_debug_lib(vm: &mut Vm) {
    register_lib(
        vm,
        "debug",
        &[
            ("traceback", traceback),
            ("getinfo", getinfo),
            ("sethook", sethook),
            ("gethook", gethook),
            ("getlocal", getlocal),
            ("setlocal", setlocal),
        ],
    );
}

fn traceback(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let message = if ctx.arg_count() >= 1 && !ctx.arg(0).is_nil() {
        Some(check::string_bytes(ctx, 0, "traceback")?)
    } else {
        None
    };
    let message_str = message.as_ref().map(|b| String::from_utf8_lossy(b).into_owned());
    let text = ctx.traceback(message_str.as_deref());
    let h = ctx.heap_mut().intern_str(&text);
    ctx.push_result(Value::String(h));
    Ok(1)
}

/// A minimal `getinfo`: only the `source`/`currentline`/`short_src` fields
/// that `location_at_level` can actually answer, no `func`/`nups`/`what`.
fn getinfo(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let level = check::opt_integer(ctx, 0, "getinfo", 1)? as u32;
    let info = ctx.heap_mut().create_table();
    match ctx.location_at_level(level) {
        Some((source, line)) => {
            let source_val = {
                let h = ctx.heap_mut().intern_str(&source);
                Value::String(h)
            };
            set_field(ctx, info, "source", source_val);
            set_field(ctx, info, "short_src", {
                let h = ctx.heap_mut().intern_str(&source);
                Value::String(h)
            });
            set_field(ctx, info, "currentline", Value::Integer(line as i64));
            ctx.push_result(Value::Table(info));
        }
        None => ctx.push_result(Value::Nil),
    }
    Ok(1)
}

/// `debug.sethook(f, mask, count)`: `mask` is a string combining `'c'`
/// (call), `'r'` (return), `'l'` (line); `count` independently installs an
/// instruction-count trigger (`0` to disable it). A bare `debug.sethook()`
/// clears any installed hook.
fn sethook(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    if ctx.arg_count() == 0 || ctx.arg(0).is_nil() {
        ctx.clear_hook();
        return Ok(0);
    }
    let hook = ctx.arg(0);
    let mask_bytes = check::string_bytes(ctx, 1, "sethook")?;
    let mask = String::from_utf8_lossy(&mask_bytes).into_owned();
    let count = check::opt_integer(ctx, 2, "sethook", 0)?.max(0) as u32;
    ctx.set_hook(hook, &mask, count);
    Ok(0)
}

fn gethook(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    match ctx.get_hook() {
        Some((hook, mask, count)) => {
            ctx.push_result(hook);
            let mask_val = ctx.heap_mut().intern_str(&mask);
            ctx.push_result(Value::String(mask_val));
            ctx.push_result(Value::Integer(count as i64));
            Ok(3)
        }
        None => {
            ctx.push_result(Value::Nil);
            Ok(1)
        }
    }
}

fn getlocal(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let level = check::integer(ctx, 0, "getlocal")? as u32;
    let index = check::integer(ctx, 1, "getlocal")? as u32;
    match ctx.get_local(level, index) {
        Some((name, value)) => {
            let h = ctx.heap_mut().intern_str(&name);
            ctx.push_result(Value::String(h));
            ctx.push_result(value);
            Ok(2)
        }
        None => {
            ctx.push_result(Value::Nil);
            Ok(1)
        }
    }
}

fn setlocal(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let level = check::integer(ctx, 0, "setlocal")? as u32;
    let index = check::integer(ctx, 1, "setlocal")? as u32;
    let value = ctx.arg(2);
    match ctx.set_local(level, index, value) {
        Some(name) => {
            let h = ctx.heap_mut().intern_str(&name);
            ctx.push_result(Value::String(h));
            Ok(1)
        }
        None => {
            ctx.push_result(Value::Nil);
            Ok(1)
        }
    }
}

/// `debug.rs`'s own `set_field`, taking an `ExecutionContext` rather than a
/// `Vm` (the `stdlib::set_field` helper needs the latter and isn't reachable
/// from native builtins).
fn set_field(ctx: &mut dyn ExecutionContext, table: crate::handle::TableHandle, name: &str, value: Value) {
    let key = ctx.heap_mut().intern_str(name);
    ctx.heap_mut().table_mut(table).unwrap().set(Value::String(key), value);
}
