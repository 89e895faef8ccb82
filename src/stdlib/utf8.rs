//! `utf8` library: char/codepoint/len/offset plus the `charpattern` constant,
//! operating on the raw bytes Lua strings carry (no encoding assumed beyond
//! what the script itself puts there).

use crate::error::{LuaError, Result};
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib, set_field};

pub fn init_utf8_lib(vm: &mut Vm) {
    let lib = register_lib(
        vm,
        "utf8",
        &[("char", char_), ("codepoint", codepoint), ("len", len), ("offset", offset)],
    );
    set_field(vm, lib, "charpattern", Value::Nil);
    let pattern = vm.heap.intern_str("[\0-\u{7F}\u{C2}-\u{FD}][\u{80}-\u{BF}]*");
    super::set_field(vm, lib, "charpattern", Value::String(pattern));
}

fn char_(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let n = ctx.arg_count();
    let mut s = String::new();
    for i in 0..n {
        let cp = check::integer(ctx, i, "char")? as u32;
        let c = char::from_u32(cp).ok_or_else(|| LuaError::runtime("value out of range"))?;
        s.push(c);
    }
    let h = ctx.heap_mut().intern_str(&s);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn codepoint(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "codepoint")?;
    let s = String::from_utf8_lossy(&bytes);
    let i = check::opt_integer(ctx, 1, "codepoint", 1)? as usize;
    let j = check::opt_integer(ctx, 2, "codepoint", i as i64)? as usize;
    let mut count = 0;
    for (byte_pos, c) in s.char_indices() {
        let pos = byte_pos + 1;
        if pos >= i && pos <= j {
            ctx.push_result(Value::Integer(c as i64));
            count += 1;
        }
    }
    Ok(count)
}

fn len(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "len")?;
    match std::str::from_utf8(&bytes) {
        Ok(s) => ctx.push_result(Value::Integer(s.chars().count() as i64)),
        Err(e) => {
            ctx.push_result(Value::Nil);
            ctx.push_result(Value::Integer(e.valid_up_to() as i64 + 1));
            return Ok(2);
        }
    }
    Ok(1)
}

fn offset(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "offset")?;
    let s = String::from_utf8_lossy(&bytes);
    let n = check::integer(ctx, 1, "offset")?;
    let char_count = s.char_indices().count();
    let byte_positions: Vec<usize> = s.char_indices().map(|(i, _)| i).chain(std::iter::once(bytes.len())).collect();
    let start_char = if n >= 0 { 0usize } else { char_count };
    let target = start_char as i64 + n - if n > 0 { 1 } else { 0 };
    if target < 0 || target as usize >= byte_positions.len() {
        ctx.push_result(Value::Nil);
    } else {
        ctx.push_result(Value::Integer(byte_positions[target as usize] as i64 + 1));
    }
    Ok(1)
}
