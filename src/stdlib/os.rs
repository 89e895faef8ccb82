//! `os` library. Kept deliberately small per the ambient-stack notes:
//! process/filesystem operations raise a runtime error rather than silently
//! no-opping, since a script that branches on their success would otherwise
//! silently misbehave in this embedding.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{LuaError, Result};
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib};

pub fn init_os_lib(vm: &mut Vm) {
    register_lib(
        vm,
        "os",
        &[
            ("time", time),
            ("clock", clock),
            ("difftime", difftime),
            ("date", date),
            ("getenv", not_supported_getenv),
            ("execute", not_supported_execute),
            ("remove", not_supported_remove),
            ("rename", not_supported_rename),
            ("tmpname", not_supported_tmpname),
            ("exit", exit),
        ],
    );
}

fn time(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    ctx.push_result(Value::Integer(secs));
    Ok(1)
}

fn clock(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
    ctx.push_result(Value::Float(secs));
    Ok(1)
}

fn difftime(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let t2 = check::number(ctx, 0, "difftime")?;
    let t1 = check::number(ctx, 1, "difftime")?;
    ctx.push_result(Value::Float(t2 - t1));
    Ok(1)
}

/// Supports the `%Y %m %d %H %M %S` subset of `strftime`, enough for the
/// common `os.date("%Y-%m-%d")`-style logging timestamp.
fn date(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let format = if ctx.arg_count() >= 1 {
        String::from_utf8_lossy(&check::string_bytes(ctx, 0, "date")?).into_owned()
    } else {
        "%c".to_string()
    };
    let t = if ctx.arg_count() >= 2 {
        check::integer(ctx, 1, "date")?
    } else {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    };
    let format = format.strip_prefix('!').unwrap_or(&format).to_string();
    let (y, mo, d, h, mi, s) = civil_from_unix(t);
    if format == "*t" {
        let tbl = ctx.heap_mut().create_table();
        for (k, v) in [("year", y), ("month", mo as i64), ("day", d as i64), ("hour", h as i64), ("min", mi as i64), ("sec", s as i64)] {
            let key = ctx.heap_mut().intern_str(k);
            ctx.heap_mut().table_mut(tbl)?.set(Value::String(key), Value::Integer(v));
        }
        ctx.push_result(Value::Table(tbl));
        return Ok(1);
    }
    let rendered = render_strftime(&format, y, mo, d, h, mi, s);
    let h = ctx.heap_mut().intern_str(&rendered);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn render_strftime(fmt: &str, y: i64, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> String {
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&y.to_string()),
            Some('m') => out.push_str(&format!("{:02}", mo)),
            Some('d') => out.push_str(&format!("{:02}", d)),
            Some('H') => out.push_str(&format!("{:02}", h)),
            Some('M') => out.push_str(&format!("{:02}", mi)),
            Some('S') => out.push_str(&format!("{:02}", s)),
            Some('%') => out.push('%'),
            Some('c') => out.push_str(&format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, mo, d, h, mi, s)),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Civil calendar conversion from a Unix timestamp (UTC), Howard Hinnant's
/// days-from-civil algorithm inverted.
fn civil_from_unix(t: i64) -> (i64, u32, u32, u32, u32, u32) {
    let days = t.div_euclid(86400);
    let secs_of_day = t.rem_euclid(86400);
    let (h, mi, s) = (secs_of_day / 3600, (secs_of_day % 3600) / 60, secs_of_day % 60);
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d, h as u32, mi as u32, s as u32)
}

fn exit(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let code = if ctx.arg_count() >= 1 { check::opt_integer(ctx, 0, "exit", 0)? } else { 0 };
    std::process::exit(code as i32);
}

fn not_supported(name: &str) -> LuaError {
    LuaError::runtime(format!("os.{} is not supported in this environment", name))
}

fn not_supported_getenv(_ctx: &mut dyn ExecutionContext) -> Result<i32> {
    Err(not_supported("getenv"))
}

fn not_supported_execute(_ctx: &mut dyn ExecutionContext) -> Result<i32> {
    Err(not_supported("execute"))
}

fn not_supported_remove(_ctx: &mut dyn ExecutionContext) -> Result<i32> {
    Err(not_supported("remove"))
}

fn not_supported_rename(_ctx: &mut dyn ExecutionContext) -> Result<i32> {
    Err(not_supported("rename"))
}

fn not_supported_tmpname(_ctx: &mut dyn ExecutionContext) -> Result<i32> {
    Err(not_supported("tmpname"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_from_unix_epoch_is_1970() {
        assert_eq!(civil_from_unix(0), (1970, 1, 1, 0, 0, 0));
    }

    #[test]
    fn render_strftime_formats_date_fields() {
        assert_eq!(render_strftime("%Y-%m-%d", 2024, 3, 5, 0, 0, 0), "2024-03-05");
    }
}
