//! `bit32` library. Real Lua 5.4 dropped this table in favor of native
//! bitwise operators, but the expansion notes keep it for scripts migrating
//! from 5.2-era code; every function truncates through `u32`.

use crate::error::Result;
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib};

pub fn init_bit32_lib(vm: &mut Vm) {
    register_lib(
        vm,
        "bit32",
        &[
            ("band", band),
            ("bor", bor),
            ("bxor", bxor),
            ("bnot", bnot),
            ("lshift", lshift),
            ("rshift", rshift),
            ("arshift", arshift),
        ],
    );
}

fn to_u32(ctx: &mut dyn ExecutionContext, n: usize, fname: &str) -> Result<u32> {
    Ok(check::integer(ctx, n, fname)? as u32)
}

fn band(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let mut acc = !0u32;
    for i in 0..ctx.arg_count() {
        acc &= to_u32(ctx, i, "band")?;
    }
    ctx.push_result(Value::Integer(acc as i64));
    Ok(1)
}

fn bor(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let mut acc = 0u32;
    for i in 0..ctx.arg_count() {
        acc |= to_u32(ctx, i, "bor")?;
    }
    ctx.push_result(Value::Integer(acc as i64));
    Ok(1)
}

fn bxor(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let mut acc = 0u32;
    for i in 0..ctx.arg_count() {
        acc ^= to_u32(ctx, i, "bxor")?;
    }
    ctx.push_result(Value::Integer(acc as i64));
    Ok(1)
}

fn bnot(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let x = to_u32(ctx, 0, "bnot")?;
    ctx.push_result(Value::Integer(!x as i64));
    Ok(1)
}

fn lshift(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let x = to_u32(ctx, 0, "lshift")?;
    let n = check::integer(ctx, 1, "lshift")?;
    let result = shift(x, n);
    ctx.push_result(Value::Integer(result as i64));
    Ok(1)
}

fn rshift(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let x = to_u32(ctx, 0, "rshift")?;
    let n = check::integer(ctx, 1, "rshift")?;
    let result = shift(x, -n);
    ctx.push_result(Value::Integer(result as i64));
    Ok(1)
}

fn shift(x: u32, n: i64) -> u32 {
    if n <= -32 || n >= 32 {
        0
    } else if n >= 0 {
        x.wrapping_shl(n as u32)
    } else {
        x.wrapping_shr((-n) as u32)
    }
}

fn arshift(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let x = to_u32(ctx, 0, "arshift")? as i32;
    let n = check::integer(ctx, 1, "arshift")?;
    let result = if n >= 0 {
        if n >= 32 {
            if x < 0 { -1i32 } else { 0 }
        } else {
            x >> n
        }
    } else {
        shift(x as u32, n) as i32
    };
    ctx.push_result(Value::Integer(result as u32 as i64));
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_saturates_past_width() {
        assert_eq!(shift(0xFFFF_FFFF, 32), 0);
        assert_eq!(shift(0xFFFF_FFFF, -32), 0);
    }
}
