//! `base` library: globals installed directly rather than under a library
//! table, grounded on the teacher's `stdlib/base.rs` binding style.

use crate::error::{LuaError, Result};
use crate::metamethod::{self, MetaEvent};
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::set_field;

pub fn init_base_lib(vm: &mut Vm) {
    let globals = vm.heap.globals();
    set_field(vm, globals, "print", Value::CFunction(print));
    set_field(vm, globals, "type", Value::CFunction(type_));
    set_field(vm, globals, "tostring", Value::CFunction(tostring));
    set_field(vm, globals, "tonumber", Value::CFunction(tonumber));
    set_field(vm, globals, "pairs", Value::CFunction(pairs));
    set_field(vm, globals, "ipairs", Value::CFunction(ipairs));
    set_field(vm, globals, "next", Value::CFunction(next));
    set_field(vm, globals, "error", Value::CFunction(error));
    set_field(vm, globals, "assert", Value::CFunction(assert));
    set_field(vm, globals, "pcall", Value::CFunction(pcall));
    set_field(vm, globals, "xpcall", Value::CFunction(xpcall));
    set_field(vm, globals, "select", Value::CFunction(select));
    set_field(vm, globals, "rawget", Value::CFunction(rawget));
    set_field(vm, globals, "rawset", Value::CFunction(rawset));
    set_field(vm, globals, "rawequal", Value::CFunction(rawequal));
    set_field(vm, globals, "rawlen", Value::CFunction(rawlen));
    set_field(vm, globals, "setmetatable", Value::CFunction(setmetatable));
    set_field(vm, globals, "getmetatable", Value::CFunction(getmetatable));
    set_field(vm, globals, "load", Value::CFunction(load));
    set_field(vm, globals, "loadstring", Value::CFunction(load));
    set_field(vm, globals, "unpack", Value::CFunction(super::table::unpack));
    set_field(vm, globals, "collectgarbage", Value::CFunction(collectgarbage));
    let version = vm.heap.intern_str("Lua 5.4");
    set_field(vm, globals, "_VERSION", Value::String(version));
    set_field(vm, globals, "_G", Value::Table(globals));
}

/// `tostring`'s body, reusable by `print`/`string.format`'s `%s`: consults
/// `__tostring` first, then `__name` for a typed placeholder, then falls
/// back to the raw representation.
pub fn tostring_bytes(ctx: &mut dyn ExecutionContext, v: &Value) -> Result<Vec<u8>> {
    if let Some(handler) = metamethod::raw_event(ctx.heap(), v, MetaEvent::ToString) {
        let results = ctx.call_value(handler, vec![v.clone()])?;
        return match results.into_iter().next() {
            Some(Value::String(h)) => Ok(ctx.heap().get_string(h)?.as_bytes().to_vec()),
            Some(other) => Ok(other.to_string().into_bytes()),
            None => Ok(b"nil".to_vec()),
        };
    }
    match v {
        Value::String(h) => Ok(ctx.heap().get_string(*h)?.as_bytes().to_vec()),
        Value::Table(_) | Value::UserData(_) => {
            if let Some(Value::String(name)) = metamethod::raw_event(ctx.heap(), v, MetaEvent::Name) {
                let name = ctx.heap().get_string(name)?.to_str_lossy().into_owned();
                Ok(format!("{}: {:?}", name, v).into_bytes())
            } else {
                Ok(v.to_string().into_bytes())
            }
        }
        other => Ok(other.to_string().into_bytes()),
    }
}

fn print(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let args = ctx.args();
    let mut out = Vec::new();
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        out.extend(tostring_bytes(ctx, a)?);
    }
    out.push(b'\n');
    use std::io::Write;
    std::io::stdout().write_all(&out).ok();
    Ok(0)
}

fn type_(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let name = ctx.arg(0).type_name();
    let h = ctx.heap_mut().intern_str(name);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn tostring(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let v = ctx.arg(0);
    let bytes = tostring_bytes(ctx, &v)?;
    let h = ctx.heap_mut().intern(&bytes);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn tonumber(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let v = ctx.arg(0);
    if ctx.arg_count() >= 2 && !ctx.arg(1).is_nil() {
        let base = super::check::integer(ctx, 1, "tonumber")?;
        let bytes = match &v {
            Value::String(h) => ctx.heap().get_string(*h)?.as_bytes().to_vec(),
            _ => return Err(super::check::bad_arg(0, "tonumber", "string", &v)),
        };
        let s = String::from_utf8_lossy(&bytes);
        match i64::from_str_radix(s.trim(), base as u32) {
            Ok(i) => ctx.push_result(Value::Integer(i)),
            Err(_) => ctx.push_result(Value::Nil),
        }
        return Ok(1);
    }
    match v {
        Value::Integer(_) | Value::Float(_) => ctx.push_result(v),
        Value::String(h) => {
            let s = ctx.heap().get_string(h)?.to_str_lossy().trim().to_string();
            ctx.push_result(parse_number(&s).unwrap_or(Value::Nil));
        }
        _ => ctx.push_result(Value::Nil),
    }
    Ok(1)
}

pub fn parse_number(s: &str) -> Option<Value> {
    if s.is_empty() {
        return None;
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(Value::Integer);
    }
    if let Some(hex) = s.strip_prefix("-0x").or_else(|| s.strip_prefix("-0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|i| Value::Integer(-i));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Integer(i));
    }
    s.parse::<f64>().ok().map(Value::Float)
}

fn next(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = super::check::table(ctx, 0, "next")?;
    let key = if ctx.arg_count() >= 2 { ctx.arg(1) } else { Value::Nil };
    match ctx.heap().table(t)?.next_key(&key) {
        Some((k, v)) => {
            ctx.push_result(k);
            ctx.push_result(v);
            Ok(2)
        }
        None => {
            ctx.push_result(Value::Nil);
            Ok(1)
        }
    }
}

fn pairs(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let v = ctx.arg(0);
    if let Some(handler) = metamethod::raw_event(ctx.heap(), &v, MetaEvent::Pairs) {
        let mut results = ctx.call_value(handler, vec![v])?;
        results.resize(3, Value::Nil);
        for r in results {
            ctx.push_result(r);
        }
        return Ok(3);
    }
    ctx.push_result(Value::CFunction(next));
    ctx.push_result(v);
    ctx.push_result(Value::Nil);
    Ok(3)
}

fn ipairs_iterator(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = ctx.arg(0);
    let i = match ctx.arg(1) {
        Value::Integer(i) => i,
        _ => 0,
    } + 1;
    let v = match &t {
        Value::Table(th) => ctx.heap().table(*th)?.get(&Value::Integer(i)),
        _ => Value::Nil,
    };
    if v.is_nil() {
        ctx.push_result(Value::Nil);
        Ok(1)
    } else {
        ctx.push_result(Value::Integer(i));
        ctx.push_result(v);
        Ok(2)
    }
}

fn ipairs(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = ctx.arg(0);
    ctx.push_result(Value::CFunction(ipairs_iterator));
    ctx.push_result(t);
    ctx.push_result(Value::Integer(0));
    Ok(3)
}

fn error(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let message = ctx.arg(0);
    let level = super::check::opt_integer(ctx, 1, "error", 1)?;
    match message {
        Value::String(h) if level > 0 => {
            let text = ctx.heap().get_string(h)?.to_str_lossy().into_owned();
            let prefixed = match ctx.location_at_level(level as u32) {
                Some((source, line)) => format!("{}:{}: {}", source, line, text),
                None => text,
            };
            let handle = ctx.heap_mut().intern_str(&prefixed);
            Err(LuaError::Value(Value::String(handle)))
        }
        other => Err(LuaError::Value(other)),
    }
}

fn assert(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let v = ctx.arg(0);
    if v.is_truthy() {
        for a in ctx.args() {
            ctx.push_result(a);
        }
        return Ok(ctx.arg_count() as i32);
    }
    if ctx.arg_count() >= 2 {
        Err(LuaError::Value(ctx.arg(1)))
    } else {
        Err(LuaError::runtime("assertion failed!"))
    }
}

fn pcall(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let mut args = ctx.args();
    if args.is_empty() {
        return Err(LuaError::arity("bad argument #1 to 'pcall' (value expected)"));
    }
    let f = args.remove(0);
    match ctx.call_value(f, args) {
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
            ctx.push_result(error_to_value(ctx, e)?);
            Ok(2)
        }
    }
}

fn xpcall(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let mut args = ctx.args();
    if args.len() < 2 {
        return Err(LuaError::arity("bad argument #2 to 'xpcall' (value expected)"));
    }
    let f = args.remove(0);
    let handler = args.remove(0);
    match ctx.call_value(f, args) {
        Ok(results) => {
            ctx.push_result(Value::Boolean(true));
            let n = results.len();
            for r in results {
                ctx.push_result(r);
            }
            Ok(1 + n as i32)
        }
        Err(e) => {
            let ev = error_to_value(ctx, e)?;
            let handled = ctx.call_value(handler, vec![ev]).unwrap_or_default();
            ctx.push_result(Value::Boolean(false));
            let n = handled.len();
            for r in handled {
                ctx.push_result(r);
            }
            Ok(1 + n as i32)
        }
    }
}

fn error_to_value(ctx: &mut dyn ExecutionContext, e: LuaError) -> Result<Value> {
    match e {
        LuaError::Value(v) => Ok(v),
        other => {
            let h = ctx.heap_mut().intern_str(&other.describe());
            Ok(Value::String(h))
        }
    }
}

fn select(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let first = ctx.arg(0);
    let rest = &ctx.args()[1..];
    if let Value::String(h) = &first {
        if ctx.heap().get_string(*h)?.as_bytes() == b"#" {
            ctx.push_result(Value::Integer(rest.len() as i64));
            return Ok(1);
        }
    }
    let n = super::check::integer(ctx, 0, "select")?;
    let start = if n < 0 { (rest.len() as i64 + n).max(0) as usize } else { (n - 1).max(0) as usize };
    let mut count = 0;
    for v in rest.iter().skip(start) {
        ctx.push_result(v.clone());
        count += 1;
    }
    Ok(count)
}

fn rawget(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = super::check::table(ctx, 0, "rawget")?;
    let key = ctx.arg(1);
    ctx.push_result(ctx.heap().table(t)?.get(&key));
    Ok(1)
}

fn rawset(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = super::check::table(ctx, 0, "rawset")?;
    let key = ctx.arg(1);
    let value = ctx.arg(2);
    if key.is_nil() {
        return Err(LuaError::runtime("table index is nil"));
    }
    ctx.heap_mut().table_mut(t)?.set(key, value);
    ctx.push_result(Value::Table(t));
    Ok(1)
}

fn rawequal(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let a = ctx.arg(0);
    let b = ctx.arg(1);
    ctx.push_result(Value::Boolean(a == b));
    Ok(1)
}

fn rawlen(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    match ctx.arg(0) {
        Value::Table(t) => ctx.push_result(Value::Integer(ctx.heap().table(t)?.border())),
        Value::String(h) => ctx.push_result(Value::Integer(ctx.heap().get_string(h)?.len() as i64)),
        other => return Err(super::check::bad_arg(0, "rawlen", "table or string", &other)),
    }
    Ok(1)
}

fn setmetatable(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t = super::check::table(ctx, 0, "setmetatable")?;
    let mt_value = ctx.arg(1);
    let mt = match mt_value {
        Value::Nil => None,
        Value::Table(h) => Some(h),
        other => return Err(super::check::bad_arg(1, "setmetatable", "nil or table", &other)),
    };
    ctx.heap_mut().table_mut(t)?.metatable = mt;
    ctx.push_result(Value::Table(t));
    Ok(1)
}

fn getmetatable(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let v = ctx.arg(0);
    match metamethod::metatable_of(ctx.heap(), &v) {
        Some(mt) => ctx.push_result(Value::Table(mt)),
        None => ctx.push_result(Value::Nil),
    }
    Ok(1)
}

fn load(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let chunk = ctx.arg(0);
    let source_bytes = match chunk {
        Value::String(h) => ctx.heap().get_string(h)?.as_bytes().to_vec(),
        Value::Closure(_) | Value::CFunction(_) => {
            // Function-chunk-reader form: repeatedly call it for pieces.
            let mut out = Vec::new();
            loop {
                let piece = ctx.call_value(chunk.clone(), vec![])?;
                match piece.into_iter().next() {
                    Some(Value::String(h)) => {
                        let bytes = ctx.heap().get_string(h)?.as_bytes().to_vec();
                        if bytes.is_empty() {
                            break;
                        }
                        out.extend(bytes);
                    }
                    _ => break,
                }
            }
            out
        }
        other => return Err(super::check::bad_arg(0, "load", "string or function", &other)),
    };
    let chunk_name = match ctx.arg(1) {
        Value::String(h) => ctx.heap().get_string(h)?.to_str_lossy().into_owned(),
        _ => "=(load)".to_string(),
    };
    let source = String::from_utf8_lossy(&source_bytes).into_owned();
    match compile_for_load(ctx, &source, chunk_name) {
        Ok(closure) => ctx.push_result(Value::Closure(closure)),
        Err(e) => {
            ctx.push_result(Value::Nil);
            let msg = ctx.heap_mut().intern_str(&e.describe());
            ctx.push_result(Value::String(msg));
            return Ok(2);
        }
    }
    Ok(1)
}

/// `load`/`require` both need a closure over the *current* globals, but
/// `ExecutionContext` doesn't expose the concrete `Vm` needed by
/// `crate::compile_source`/`Lua::load` — so this re-derives the same two
/// steps (compile, then wrap with a fresh `_ENV` upvalue) against the heap
/// directly.
pub fn compile_for_load(ctx: &mut dyn ExecutionContext, source: &str, chunk_name: String) -> Result<crate::handle::ClosureHandle> {
    let parser = crate::parser::Parser::new(source.as_bytes(), chunk_name.clone())?;
    let chunk = parser.parse_chunk()?;
    let proto = crate::compiler::compile_chunk(ctx.heap_mut(), chunk, chunk_name)?;
    let globals = Value::Table(globals_of(ctx));
    let env_cell = ctx.heap_mut().create_upvalue(crate::vm::UpvalueCell::Closed(globals));
    Ok(ctx.heap_mut().create_closure(crate::value::Closure { proto, upvalues: vec![env_cell] }))
}

fn globals_of(ctx: &dyn ExecutionContext) -> crate::handle::TableHandle {
    ctx.heap().globals()
}

fn collectgarbage(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let opt = match ctx.arg(0) {
        Value::String(h) => ctx.heap().get_string(h)?.to_str_lossy().into_owned(),
        _ => "collect".to_string(),
    };
    match opt.as_str() {
        "collect" | "" => {
            ctx.heap_mut().collect_garbage(&[]);
            ctx.push_result(Value::Integer(0));
        }
        "count" => ctx.push_result(Value::Float(0.0)),
        _ => ctx.push_result(Value::Integer(0)),
    }
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tonumber_parses_hex_and_decimal() {
        assert_eq!(parse_number("42"), Some(Value::Integer(42)));
        assert_eq!(parse_number("0x2A"), Some(Value::Integer(42)));
        assert_eq!(parse_number("3.5"), Some(Value::Float(3.5)));
        assert_eq!(parse_number("not a number"), None);
    }
}
