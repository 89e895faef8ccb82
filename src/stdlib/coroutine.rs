//! `coroutine` library: symmetric suspend/resume over the VM's thread
//! arena, wiring `create_coroutine`/`resume_coroutine`/`yield_coroutine`
//! exposed on `ExecutionContext` (`§4.7`).

use crate::error::{LuaError, Result};
use crate::value::{ThreadStatus, Value};
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib};

pub fn init_coroutine_lib(vm: &mut Vm) {
    register_lib(
        vm,
        "coroutine",
        &[
            ("create", create),
            ("resume", resume),
            ("yield", yield_),
            ("status", status),
            ("wrap", wrap),
            ("isyieldable", isyieldable),
            ("running", running),
            ("close", close),
        ],
    );
}

fn entry_closure(ctx: &dyn ExecutionContext, n: usize, fname: &str) -> Result<crate::handle::ClosureHandle> {
    match ctx.arg(n) {
        Value::Closure(c) => Ok(c),
        other => Err(check::bad_arg(n, fname, "function", &other)),
    }
}

fn create(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let closure = entry_closure(ctx, 0, "create")?;
    let co = ctx.create_coroutine(closure);
    ctx.push_result(Value::Thread(co));
    Ok(1)
}

fn resume(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let co = match ctx.arg(0) {
        Value::Thread(t) => t,
        other => return Err(check::bad_arg(0, "resume", "coroutine", &other)),
    };
    let rest = ctx.args()[1..].to_vec();
    match ctx.resume_coroutine(co, rest) {
        Ok(results) => {
            ctx.push_result(Value::Boolean(true));
            let n = results.len();
            for r in results {
                ctx.push_result(r);
            }
            Ok(1 + n as i32)
        }
        Err(e) => {
            ctx.push_result(Value::Boolean(false));
            let v = match e {
                LuaError::Value(v) => v,
                other => {
                    let h = ctx.heap_mut().intern_str(&other.describe());
                    Value::String(h)
                }
            };
            ctx.push_result(v);
            Ok(2)
        }
    }
}

fn yield_(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let args = ctx.args();
    let results = ctx.yield_coroutine(args)?;
    let n = results.len();
    for r in results {
        ctx.push_result(r);
    }
    Ok(n as i32)
}

fn status(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let co = match ctx.arg(0) {
        Value::Thread(t) => t,
        other => return Err(check::bad_arg(0, "status", "coroutine", &other)),
    };
    let name = match ctx.thread_status(co)? {
        ThreadStatus::Suspended => "suspended",
        ThreadStatus::Running => {
            if co == ctx.current_thread() {
                "running"
            } else {
                "normal"
            }
        }
        ThreadStatus::Normal => "normal",
        ThreadStatus::Dead => "dead",
    };
    let h = ctx.heap_mut().intern_str(name);
    ctx.push_result(Value::String(h));
    Ok(1)
}

/// `coroutine.wrap` builds a closure over a freshly created coroutine and
/// hands back a native function that resumes it and re-raises on error,
/// rather than returning the `ok, ...` pair `resume` does.
fn wrap(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let closure = entry_closure(ctx, 0, "wrap")?;
    let co = ctx.create_coroutine(closure);
    let wrapper_table = ctx.heap_mut().create_table();
    let co_key = ctx.heap_mut().intern_str("__co");
    ctx.heap_mut().table_mut(wrapper_table)?.set(Value::String(co_key), Value::Thread(co));
    set_wrap_metatable(ctx, wrapper_table)?;
    ctx.push_result(Value::Table(wrapper_table));
    Ok(1)
}

fn set_wrap_metatable(ctx: &mut dyn ExecutionContext, wrapper_table: crate::handle::TableHandle) -> Result<()> {
    let mt = ctx.heap_mut().create_table();
    let call_key = ctx.heap_mut().intern_str("__call");
    ctx.heap_mut().table_mut(mt)?.set(Value::String(call_key), Value::CFunction(wrap_call));
    ctx.heap_mut().table_mut(wrapper_table)?.metatable = Some(mt);
    Ok(())
}

fn wrap_call(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let wrapper = match ctx.arg(0) {
        Value::Table(t) => t,
        other => return Err(check::bad_arg(0, "wrap", "table", &other)),
    };
    let co_key = ctx.heap_mut().intern_str("__co");
    let co = match ctx.heap().table(wrapper)?.get(&Value::String(co_key)) {
        Value::Thread(t) => t,
        _ => return Err(LuaError::Internal("coroutine.wrap closure missing thread".into())),
    };
    let rest = ctx.args()[1..].to_vec();
    let results = ctx.resume_coroutine(co, rest)?;
    let n = results.len();
    for r in results {
        ctx.push_result(r);
    }
    Ok(n as i32)
}

fn isyieldable(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    ctx.push_result(Value::Boolean(ctx.is_yieldable()));
    Ok(1)
}

fn running(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let current = ctx.current_thread();
    ctx.push_result(Value::Thread(current));
    ctx.push_result(Value::Boolean(!ctx.is_yieldable()));
    Ok(2)
}

fn close(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let co = match ctx.arg(0) {
        Value::Thread(t) => t,
        other => return Err(check::bad_arg(0, "close", "coroutine", &other)),
    };
    match ctx.thread_status(co)? {
        ThreadStatus::Suspended | ThreadStatus::Dead => {
            ctx.push_result(Value::Boolean(true));
            Ok(1)
        }
        _ => Err(LuaError::CoroutineState("cannot close a running coroutine".into())),
    }
}
