//! `io` library: only `io.write`/`io.read`, per the ambient-stack notes —
//! no file handles, since this embedding has no filesystem surface.

use std::io::{BufRead, Write as _};

use crate::error::Result;
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib};

pub fn init_io_lib(vm: &mut Vm) {
    register_lib(vm, "io", &[("write", write), ("read", read)]);
}

fn write(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let n = ctx.arg_count();
    let mut stdout = std::io::stdout();
    for i in 0..n {
        let bytes = check::string_bytes(ctx, i, "write")?;
        stdout.write_all(&bytes).ok();
    }
    Ok(0)
}

fn read(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let mode = if ctx.arg_count() >= 1 {
        String::from_utf8_lossy(&check::string_bytes(ctx, 0, "read")?).into_owned()
    } else {
        "l".to_string()
    };
    let mode = mode.trim_start_matches('*');
    let mut line = String::new();
    let n = std::io::stdin().lock().read_line(&mut line).unwrap_or(0);
    if n == 0 {
        ctx.push_result(Value::Nil);
        return Ok(1);
    }
    if mode != "L" {
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
    }
    if mode == "n" {
        match super::base::parse_number(line.trim()) {
            Some(v) => ctx.push_result(v),
            None => ctx.push_result(Value::Nil),
        }
    } else {
        let h = ctx.heap_mut().intern_str(&line);
        ctx.push_result(Value::String(h));
    }
    Ok(1)
}
