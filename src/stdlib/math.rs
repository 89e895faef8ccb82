//! `math` library, grounded on the teacher's `stdlib/math.rs` one-function-
//! per-builtin layout, adapted for Lua 5.4's integer/float duality.

use std::cell::RefCell;
use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{LuaError, Result};
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib, set_field};

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(0));
}

pub fn init_math_lib(vm: &mut Vm) {
    let lib = register_lib(
        vm,
        "math",
        &[
            ("abs", abs),
            ("ceil", ceil),
            ("floor", floor),
            ("sqrt", sqrt),
            ("sin", sin),
            ("cos", cos),
            ("tan", tan),
            ("asin", asin),
            ("acos", acos),
            ("atan", atan),
            ("exp", exp),
            ("log", log),
            ("fmod", fmod),
            ("modf", modf),
            ("max", max),
            ("min", min),
            ("random", random),
            ("randomseed", randomseed),
            ("tointeger", tointeger),
            ("type", type_),
            ("ult", ult),
        ],
    );
    set_field(vm, lib, "pi", Value::Float(PI));
    set_field(vm, lib, "huge", Value::Float(f64::INFINITY));
    set_field(vm, lib, "maxinteger", Value::Integer(i64::MAX));
    set_field(vm, lib, "mininteger", Value::Integer(i64::MIN));
}

fn abs(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    match ctx.arg(0) {
        Value::Integer(i) => ctx.push_result(Value::Integer(i.wrapping_abs())),
        _ => {
            let x = check::number(ctx, 0, "abs")?;
            ctx.push_result(Value::Float(x.abs()));
        }
    }
    Ok(1)
}

fn ceil(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    match ctx.arg(0) {
        Value::Integer(i) => ctx.push_result(Value::Integer(i)),
        _ => {
            let x = check::number(ctx, 0, "ceil")?;
            ctx.push_result(float_to_int_result(x.ceil()));
        }
    }
    Ok(1)
}

fn floor(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    match ctx.arg(0) {
        Value::Integer(i) => ctx.push_result(Value::Integer(i)),
        _ => {
            let x = check::number(ctx, 0, "floor")?;
            ctx.push_result(float_to_int_result(x.floor()));
        }
    }
    Ok(1)
}

fn float_to_int_result(f: f64) -> Value {
    Value::float_to_integer_exact(f).map(Value::Integer).unwrap_or(Value::Float(f))
}

fn sqrt(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let x = check::number(ctx, 0, "sqrt")?;
    ctx.push_result(Value::Float(x.sqrt()));
    Ok(1)
}

macro_rules! unary_float_fn {
    ($name:ident, $method:ident) => {
        fn $name(ctx: &mut dyn ExecutionContext) -> Result<i32> {
            let x = check::number(ctx, 0, stringify!($name))?;
            ctx.push_result(Value::Float(x.$method()));
            Ok(1)
        }
    };
}

unary_float_fn!(sin, sin);
unary_float_fn!(cos, cos);
unary_float_fn!(tan, tan);
unary_float_fn!(asin, asin);
unary_float_fn!(acos, acos);
unary_float_fn!(exp, exp);

fn atan(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let y = check::number(ctx, 0, "atan")?;
    let x = if ctx.arg_count() >= 2 { check::number(ctx, 1, "atan")? } else { 1.0 };
    ctx.push_result(Value::Float(y.atan2(x)));
    Ok(1)
}

fn log(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let x = check::number(ctx, 0, "log")?;
    let result = if ctx.arg_count() >= 2 {
        let base = check::number(ctx, 1, "log")?;
        x.log(base)
    } else {
        x.ln()
    };
    ctx.push_result(Value::Float(result));
    Ok(1)
}

fn fmod(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    match (ctx.arg(0), ctx.arg(1)) {
        (Value::Integer(a), Value::Integer(b)) => {
            if b == 0 {
                return Err(LuaError::domain("bad argument #2 to 'fmod' (zero)"));
            }
            ctx.push_result(Value::Integer(a.wrapping_rem(b)));
        }
        _ => {
            let a = check::number(ctx, 0, "fmod")?;
            let b = check::number(ctx, 1, "fmod")?;
            ctx.push_result(Value::Float(a % b));
        }
    }
    Ok(1)
}

fn modf(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let x = check::number(ctx, 0, "modf")?;
    let int_part = if x < 0.0 { x.ceil() } else { x.floor() };
    let frac_part = if x.is_infinite() { 0.0 } else { x - int_part };
    ctx.push_result(Value::Float(int_part));
    ctx.push_result(Value::Float(frac_part));
    Ok(2)
}

fn max(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    minmax(ctx, "max", |a, b| a < b)
}

fn min(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    minmax(ctx, "min", |a, b| a > b)
}

fn minmax(ctx: &mut dyn ExecutionContext, fname: &str, replace_if: impl Fn(f64, f64) -> bool) -> Result<i32> {
    let n = ctx.arg_count();
    if n == 0 {
        return Err(LuaError::arity(format!("bad argument #1 to '{}' (value expected)", fname)));
    }
    let mut best = ctx.arg(0);
    let mut best_f = check::number(ctx, 0, fname)?;
    for i in 1..n {
        let v = ctx.arg(i);
        let f = check::number(ctx, i, fname)?;
        if replace_if(best_f, f) {
            best_f = f;
            best = v;
        }
    }
    ctx.push_result(best);
    Ok(1)
}

fn random(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let n = ctx.arg_count();
    let result = match n {
        0 => Value::Float(RNG.with(|r| r.borrow_mut().gen::<f64>())),
        1 => {
            let m = check::integer(ctx, 0, "random")?;
            if m == 0 {
                Value::Integer(RNG.with(|r| r.borrow_mut().gen::<i64>()))
            } else if m < 1 {
                return Err(LuaError::arity("bad argument #1 to 'random' (interval is empty)"));
            } else {
                Value::Integer(RNG.with(|r| r.borrow_mut().gen_range(1..=m)))
            }
        }
        _ => {
            let lo = check::integer(ctx, 0, "random")?;
            let hi = check::integer(ctx, 1, "random")?;
            if lo > hi {
                return Err(LuaError::arity("bad argument #2 to 'random' (interval is empty)"));
            }
            Value::Integer(RNG.with(|r| r.borrow_mut().gen_range(lo..=hi)))
        }
    };
    ctx.push_result(result);
    Ok(1)
}

fn randomseed(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let seed = if ctx.arg_count() >= 1 { check::integer(ctx, 0, "randomseed")? as u64 } else { 0 };
    RNG.with(|r| *r.borrow_mut() = StdRng::seed_from_u64(seed));
    Ok(0)
}

fn tointeger(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    match ctx.arg(0) {
        Value::Integer(i) => ctx.push_result(Value::Integer(i)),
        Value::Float(f) => match Value::float_to_integer_exact(f) {
            Some(i) => ctx.push_result(Value::Integer(i)),
            None => ctx.push_result(Value::Nil),
        },
        _ => ctx.push_result(Value::Nil),
    }
    Ok(1)
}

fn type_(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let name = match ctx.arg(0) {
        Value::Integer(_) => Some("integer"),
        Value::Float(_) => Some("float"),
        _ => None,
    };
    match name {
        Some(n) => {
            let h = ctx.heap_mut().intern_str(n);
            ctx.push_result(Value::String(h));
        }
        None => ctx.push_result(Value::Nil),
    }
    Ok(1)
}

fn ult(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let a = check::integer(ctx, 0, "ult")? as u64;
    let b = check::integer(ctx, 1, "ult")? as u64;
    ctx.push_result(Value::Boolean(a < b));
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_int_result_keeps_non_integral_floats_as_floats() {
        assert_eq!(float_to_int_result(3.0), Value::Integer(3));
        assert_eq!(float_to_int_result(f64::INFINITY), Value::Float(f64::INFINITY));
    }
}
