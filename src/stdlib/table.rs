//! `table` library, grounded on the teacher's `stdlib/table.rs` raw-get/set
//! traversal style but using integer borders/`call_value` for comparators.

use crate::error::{LuaError, Result};
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib};

pub fn init_table_lib(vm: &mut Vm) {
    register_lib(
        vm,
        "table",
        &[
            ("insert", insert),
            ("remove", remove),
            ("concat", concat),
            ("sort", sort),
            ("pack", pack),
            ("unpack", unpack),
        ],
    );
}

fn insert(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = check::table(ctx, 0, "insert")?;
    let len = ctx.heap().table(t)?.border();
    let nargs = ctx.arg_count();
    let (pos, value) = if nargs == 2 {
        (len + 1, ctx.arg(1))
    } else if nargs == 3 {
        let pos = check::integer(ctx, 1, "insert")?;
        if pos < 1 || pos > len + 1 {
            return Err(LuaError::arity("bad argument #2 to 'insert' (position out of bounds)"));
        }
        (pos, ctx.arg(2))
    } else {
        return Err(LuaError::arity("wrong number of arguments to 'insert'"));
    };
    let mut i = len;
    while i >= pos {
        let moved = ctx.heap().table(t)?.get(&Value::Integer(i));
        ctx.heap_mut().table_mut(t)?.set(Value::Integer(i + 1), moved);
        i -= 1;
    }
    ctx.heap_mut().table_mut(t)?.set(Value::Integer(pos), value);
    Ok(0)
}

fn remove(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = check::table(ctx, 0, "remove")?;
    let len = ctx.heap().table(t)?.border();
    if len == 0 && ctx.arg_count() < 2 {
        ctx.push_result(Value::Nil);
        return Ok(1);
    }
    let pos = check::opt_integer(ctx, 1, "remove", len)?;
    if len > 0 && (pos < 1 || pos > len + 1) {
        return Err(LuaError::arity("bad argument #2 to 'remove' (position out of bounds)"));
    }
    let removed = ctx.heap().table(t)?.get(&Value::Integer(pos));
    let mut i = pos;
    while i < len {
        let moved = ctx.heap().table(t)?.get(&Value::Integer(i + 1));
        ctx.heap_mut().table_mut(t)?.set(Value::Integer(i), moved);
        i += 1;
    }
    if pos <= len {
        ctx.heap_mut().table_mut(t)?.set(Value::Integer(len), Value::Nil);
    }
    ctx.push_result(removed);
    Ok(1)
}

fn concat(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = check::table(ctx, 0, "concat")?;
    let sep = if ctx.arg_count() >= 2 && !ctx.arg(1).is_nil() {
        check::string_bytes(ctx, 1, "concat")?
    } else {
        Vec::new()
    };
    let len = ctx.heap().table(t)?.border();
    let start = check::opt_integer(ctx, 2, "concat", 1)?;
    let end = check::opt_integer(ctx, 3, "concat", len)?;
    let mut out = Vec::new();
    let mut i = start;
    while i <= end {
        if i > start {
            out.extend_from_slice(&sep);
        }
        let v = ctx.heap().table(t)?.get(&Value::Integer(i));
        match v {
            Value::String(h) => out.extend_from_slice(ctx.heap().get_string(h)?.as_bytes()),
            Value::Integer(_) | Value::Float(_) => out.extend_from_slice(v.to_string().as_bytes()),
            other => {
                return Err(LuaError::runtime(format!(
                    "invalid value ({}) at index {} in table for 'concat'",
                    other.type_name(),
                    i
                )));
            }
        }
        i += 1;
    }
    let h = ctx.heap_mut().intern(&out);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn pack(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let args = ctx.args();
    let t = ctx.heap_mut().create_table();
    for (i, v) in args.iter().enumerate() {
        ctx.heap_mut().table_mut(t)?.set(Value::Integer(i as i64 + 1), v.clone());
    }
    let n = ctx.heap_mut().intern_str("n");
    ctx.heap_mut().table_mut(t)?.set(Value::String(n), Value::Integer(args.len() as i64));
    ctx.push_result(Value::Table(t));
    Ok(1)
}

pub fn unpack(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = check::table(ctx, 0, "unpack")?;
    let start = check::opt_integer(ctx, 1, "unpack", 1)?;
    let end = check::opt_integer(ctx, 2, "unpack", ctx.heap().table(t)?.border())?;
    let mut count = 0;
    let mut i = start;
    while i <= end {
        ctx.push_result(ctx.heap().table(t)?.get(&Value::Integer(i)));
        i += 1;
        count += 1;
    }
    Ok(count)
}

fn value_less(ctx: &mut dyn ExecutionContext, a: &Value, b: &Value) -> Result<bool> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(x < y),
        (Value::Integer(x), Value::Float(y)) => Ok((*x as f64) < *y),
        (Value::Float(x), Value::Integer(y)) => Ok(*x < *y as f64),
        (Value::Float(x), Value::Float(y)) => Ok(x < y),
        (Value::String(x), Value::String(y)) => {
            Ok(ctx.heap().get_string(*x)?.as_bytes() < ctx.heap().get_string(*y)?.as_bytes())
        }
        _ => Err(LuaError::runtime(format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn sort(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = check::table(ctx, 0, "sort")?;
    let comparator = if ctx.arg_count() >= 2 && !ctx.arg(1).is_nil() {
        Some(ctx.arg(1))
    } else {
        None
    };
    let len = ctx.heap().table(t)?.border();
    let mut elems = Vec::with_capacity(len as usize);
    for i in 1..=len {
        elems.push(ctx.heap().table(t)?.get(&Value::Integer(i)));
    }
    // Insertion sort: the only order that lets a user comparator raise a
    // Lua error mid-sort without fighting `Vec::sort_by`'s panic-on-unwind
    // comparator contract.
    for i in 1..elems.len() {
        let mut j = i;
        while j > 0 {
            let less = match &comparator {
                Some(f) => {
                    let results = ctx.call_value(f.clone(), vec![elems[j].clone(), elems[j - 1].clone()])?;
                    matches!(results.first(), Some(v) if v.is_truthy())
                }
                None => value_less(ctx, &elems[j], &elems[j - 1])?,
            };
            if !less {
                break;
            }
            elems.swap(j, j - 1);
            j -= 1;
        }
    }
    for (i, v) in elems.into_iter().enumerate() {
        ctx.heap_mut().table_mut(t)?.set(Value::Integer(i as i64 + 1), v);
    }
    Ok(0)
}
