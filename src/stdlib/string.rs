//! `string` library, grounded on the teacher's `stdlib/string.rs` one-
//! function-per-builtin layout and index-normalization helper, but with a
//! real Lua pattern-matching engine (the teacher's `find`/`match`/`gsub`
//! were plain-substring placeholders) and a `%`-directive `format`.

use crate::error::{LuaError, Result};
use crate::handle::StringHandle;
use crate::value::Value;
use crate::vm::{ExecutionContext, Vm};

use super::{check, register_lib};

mod pattern;

pub fn init_string_lib(vm: &mut Vm) {
    register_lib(
        vm,
        "string",
        &[
            ("len", len),
            ("sub", sub),
            ("upper", upper),
            ("lower", lower),
            ("rep", rep),
            ("reverse", reverse),
            ("byte", byte),
            ("char", char_),
            ("format", format),
            ("find", find),
            ("match", match_),
            ("gmatch", gmatch),
            ("gsub", gsub),
        ],
    );
}

/// 1-based, negative-from-end Lua string index, clamped into `[0, len]`
/// (0-based, inclusive-exclusive friendly) the way the teacher's
/// `normalize_string_index` does.
fn resolve_index(i: i64, len: usize) -> i64 {
    if i >= 0 {
        i
    } else {
        (len as i64 + i + 1).max(0)
    }
}

fn len(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "len")?;
    ctx.push_result(Value::Integer(bytes.len() as i64));
    Ok(1)
}

fn sub(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "sub")?;
    let len = bytes.len();
    let i = resolve_index(check::opt_integer(ctx, 1, "sub", 1)?, len).max(1);
    let j = resolve_index(check::opt_integer(ctx, 2, "sub", -1)?, len).min(len as i64);
    let h = if i > j {
        ctx.heap_mut().intern(&[])
    } else {
        ctx.heap_mut().intern(&bytes[(i - 1) as usize..j as usize])
    };
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn upper(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "upper")?;
    let upper: Vec<u8> = bytes.iter().map(|b| b.to_ascii_uppercase()).collect();
    let h = ctx.heap_mut().intern(&upper);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn lower(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "lower")?;
    let lower: Vec<u8> = bytes.iter().map(|b| b.to_ascii_lowercase()).collect();
    let h = ctx.heap_mut().intern(&lower);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn rep(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "rep")?;
    let n = check::integer(ctx, 1, "rep")?;
    let sep = if ctx.arg_count() >= 3 { check::string_bytes(ctx, 2, "rep")? } else { Vec::new() };
    let mut out = Vec::new();
    for i in 0..n.max(0) {
        if i > 0 {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(&bytes);
    }
    let h = ctx.heap_mut().intern(&out);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn reverse(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let mut bytes = check::string_bytes(ctx, 0, "reverse")?;
    bytes.reverse();
    let h = ctx.heap_mut().intern(&bytes);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn byte(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let bytes = check::string_bytes(ctx, 0, "byte")?;
    let len = bytes.len();
    let i = resolve_index(check::opt_integer(ctx, 1, "byte", 1)?, len).max(1);
    let j = resolve_index(check::opt_integer(ctx, 2, "byte", i)?, len).min(len as i64);
    let mut count = 0;
    let mut k = i;
    while k <= j {
        if k >= 1 && (k as usize) <= len {
            ctx.push_result(Value::Integer(bytes[(k - 1) as usize] as i64));
            count += 1;
        }
        k += 1;
    }
    Ok(count)
}

fn char_(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let n = ctx.arg_count();
    let mut bytes = Vec::with_capacity(n);
    for i in 0..n {
        let code = check::integer(ctx, i, "char")?;
        if !(0..=255).contains(&code) {
            return Err(LuaError::arity(format!("bad argument #{} to 'char' (value out of range)", i + 1)));
        }
        bytes.push(code as u8);
    }
    let h = ctx.heap_mut().intern(&bytes);
    ctx.push_result(Value::String(h));
    Ok(1)
}

/// Used by `value.rs`'s `Display for Value::Float` for Lua's default `%.14g`
/// number-to-string conversion.
pub fn format_g(value: f64, precision: usize) -> Option<String> {
    if value.is_nan() {
        return Some("nan".to_string());
    }
    if value.is_infinite() {
        return Some(if value < 0.0 { "-inf".to_string() } else { "inf".to_string() });
    }
    if value == 0.0 {
        return Some(if value.is_sign_negative() { "-0.0".to_string() } else { "0.0".to_string() });
    }
    let precision = precision.max(1);
    let exponent = value.abs().log10().floor() as i32;
    let s = if exponent < -4 || exponent >= precision as i32 {
        let mantissa_digits = precision.saturating_sub(1);
        let formatted = format!("{:.*e}", mantissa_digits, value);
        normalize_exponent_form(&formatted)
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let formatted = format!("{:.*}", decimals, value);
        trim_trailing_zeros(&formatted)
    };
    Some(if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("nan") {
        s
    } else {
        format!("{}.0", s)
    })
}

fn trim_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let trimmed = s.trim_end_matches('0');
    trimmed.trim_end_matches('.').to_string()
}

fn normalize_exponent_form(s: &str) -> String {
    let (mantissa, exp) = match s.split_once('e') {
        Some((m, e)) => (m, e),
        None => return s.to_string(),
    };
    let mantissa = trim_trailing_zeros(mantissa);
    let exp_val: i32 = exp.parse().unwrap_or(0);
    format!("{}e{}{:02}", mantissa, if exp_val < 0 { "-" } else { "+" }, exp_val.abs())
}

fn format(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let fmt_bytes = check::string_bytes(ctx, 0, "format")?;
    let fmt = String::from_utf8_lossy(&fmt_bytes).into_owned();
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    let mut arg_idx = 1usize;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = String::from("%");
        while let Some(&next) = chars.peek() {
            if "-+ #0".contains(next) {
                spec.push(next);
                chars.next();
            } else {
                break;
            }
        }
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() {
                spec.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if chars.peek() == Some(&'.') {
            spec.push('.');
            chars.next();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() {
                    spec.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        let conv = match chars.next() {
            Some(c) => c,
            None => return Err(LuaError::runtime("invalid conversion to 'format'")),
        };
        if conv == '%' {
            out.push('%');
            continue;
        }
        let (width, precision, left_align, zero_pad) = parse_spec(&spec);
        let rendered = match conv {
            'd' | 'i' => {
                let n = check::integer(ctx, arg_idx, "format")?;
                arg_idx += 1;
                n.to_string()
            }
            'u' => {
                let n = check::integer(ctx, arg_idx, "format")? as u64;
                arg_idx += 1;
                n.to_string()
            }
            'x' => {
                let n = check::integer(ctx, arg_idx, "format")? as u64;
                arg_idx += 1;
                format!("{:x}", n)
            }
            'X' => {
                let n = check::integer(ctx, arg_idx, "format")? as u64;
                arg_idx += 1;
                format!("{:X}", n)
            }
            'o' => {
                let n = check::integer(ctx, arg_idx, "format")? as u64;
                arg_idx += 1;
                format!("{:o}", n)
            }
            'c' => {
                let n = check::integer(ctx, arg_idx, "format")?;
                arg_idx += 1;
                (n as u8 as char).to_string()
            }
            'f' | 'F' => {
                let n = check::number(ctx, arg_idx, "format")?;
                arg_idx += 1;
                format!("{:.*}", precision.unwrap_or(6), n)
            }
            'e' | 'E' => {
                let n = check::number(ctx, arg_idx, "format")?;
                arg_idx += 1;
                let s = format!("{:.*e}", precision.unwrap_or(6), n);
                let s = normalize_exponent_form(&s);
                if conv == 'E' {
                    s.to_uppercase()
                } else {
                    s
                }
            }
            'g' | 'G' => {
                let n = check::number(ctx, arg_idx, "format")?;
                arg_idx += 1;
                let s = format_g(n, precision.unwrap_or(6)).unwrap_or_default();
                if conv == 'G' {
                    s.to_uppercase()
                } else {
                    s
                }
            }
            's' => {
                let v = ctx.arg(arg_idx);
                arg_idx += 1;
                let bytes = super::base::tostring_bytes(ctx, &v)?;
                let mut s = String::from_utf8_lossy(&bytes).into_owned();
                if let Some(p) = precision {
                    s.truncate(p);
                }
                s
            }
            'q' => {
                let bytes = check::string_bytes(ctx, arg_idx, "format")?;
                arg_idx += 1;
                quote_string(&bytes)
            }
            other => return Err(LuaError::runtime(format!("invalid conversion '%{}' to 'format'", other))),
        };
        out.push_str(&pad(&rendered, width, left_align, zero_pad));
    }
    let h = ctx.heap_mut().intern_str(&out);
    ctx.push_result(Value::String(h));
    Ok(1)
}

fn parse_spec(spec: &str) -> (Option<usize>, Option<usize>, bool, bool) {
    let left_align = spec.contains('-');
    let zero_pad = spec.contains('0') && !spec.starts_with("%0.");
    let body = spec.trim_start_matches('%').trim_start_matches(|c| "-+ #0".contains(c));
    let (width_str, prec_str) = match body.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (body, None),
    };
    let width = width_str.parse::<usize>().ok();
    let precision = prec_str.and_then(|p| p.parse::<usize>().ok());
    (width, precision, left_align, zero_pad)
}

fn pad(s: &str, width: Option<usize>, left_align: bool, zero_pad: bool) -> String {
    match width {
        Some(w) if s.len() < w => {
            let fill = w - s.len();
            if left_align {
                format!("{}{}", s, " ".repeat(fill))
            } else if zero_pad {
                format!("{}{}", "0".repeat(fill), s)
            } else {
                format!("{}{}", " ".repeat(fill), s)
            }
        }
        _ => s.to_string(),
    }
}

fn quote_string(bytes: &[u8]) -> String {
    let mut out = String::from("\"");
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0 => out.push_str("\\0"),
            0x20..=0x7e => out.push(b as char),
            other => out.push_str(&format!("\\{}", other)),
        }
    }
    out.push('"');
    out
}

fn find(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let s = check::string_bytes(ctx, 0, "find")?;
    let pat = check::string_bytes(ctx, 1, "find")?;
    let init = resolve_index(check::opt_integer(ctx, 2, "find", 1)?, s.len()).max(1);
    let plain = ctx.arg_count() >= 4 && ctx.arg(3).is_truthy();
    let start = ((init - 1).max(0) as usize).min(s.len());

    if plain || !pattern::has_specials(&pat) {
        if pat.is_empty() {
            ctx.push_result(Value::Integer(start as i64 + 1));
            ctx.push_result(Value::Integer(start as i64));
            return Ok(2);
        }
        if let Some(pos) = find_subslice(&s[start..], &pat) {
            let abs = start + pos;
            ctx.push_result(Value::Integer(abs as i64 + 1));
            ctx.push_result(Value::Integer((abs + pat.len()) as i64));
            return Ok(2);
        }
        ctx.push_result(Value::Nil);
        return Ok(1);
    }

    match pattern::find(&s, &pat, start) {
        Some(m) => {
            ctx.push_result(Value::Integer(m.start as i64 + 1));
            ctx.push_result(Value::Integer(m.end as i64));
            for cap in &m.captures {
                ctx.push_result(capture_value(ctx, &s, cap)?);
            }
            Ok(2 + m.captures.len() as i32)
        }
        None => {
            ctx.push_result(Value::Nil);
            Ok(1)
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn capture_value(ctx: &mut dyn ExecutionContext, s: &[u8], cap: &pattern::Capture) -> Result<Value> {
    match cap {
        pattern::Capture::Position(p) => Ok(Value::Integer(*p as i64 + 1)),
        pattern::Capture::Span(start, end) => {
            let h = ctx.heap_mut().intern(&s[*start..*end]);
            Ok(Value::String(h))
        }
    }
}

fn match_(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let s = check::string_bytes(ctx, 0, "match")?;
    let pat = check::string_bytes(ctx, 1, "match")?;
    let init = resolve_index(check::opt_integer(ctx, 2, "match", 1)?, s.len()).max(1);
    let start = ((init - 1).max(0) as usize).min(s.len());
    match pattern::find(&s, &pat, start) {
        Some(m) => {
            if m.captures.is_empty() {
                let h = ctx.heap_mut().intern(&s[m.start..m.end]);
                ctx.push_result(Value::String(h));
                Ok(1)
            } else {
                let n = m.captures.len();
                for cap in &m.captures {
                    ctx.push_result(capture_value(ctx, &s, cap)?);
                }
                Ok(n as i32)
            }
        }
        None => {
            ctx.push_result(Value::Nil);
            Ok(1)
        }
    }
}

fn gmatch(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let s = check::string_bytes(ctx, 0, "gmatch")?;
    let pat = check::string_bytes(ctx, 1, "gmatch")?;
    let iter_state = ctx.heap_mut().create_table();
    let s_h = ctx.heap_mut().intern(&s);
    let pat_h = ctx.heap_mut().intern(&pat);
    let s_key = ctx.heap_mut().intern_str("s");
    let pat_key = ctx.heap_mut().intern_str("p");
    let pos_key = ctx.heap_mut().intern_str("pos");
    ctx.heap_mut().table_mut(iter_state)?.set(Value::String(s_key), Value::String(s_h));
    ctx.heap_mut().table_mut(iter_state)?.set(Value::String(pat_key), Value::String(pat_h));
    ctx.heap_mut().table_mut(iter_state)?.set(Value::String(pos_key), Value::Integer(0));
    let mt = ctx.heap_mut().create_table();
    let call_key = ctx.heap_mut().intern_str("__call");
    ctx.heap_mut().table_mut(mt)?.set(Value::String(call_key), Value::CFunction(gmatch_step));
    ctx.heap_mut().table_mut(iter_state)?.metatable = Some(mt);
    ctx.push_result(Value::Table(iter_state));
    Ok(1)
}

fn gmatch_step(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let state = match ctx.arg(0) {
        Value::Table(t) => t,
        _ => return Err(LuaError::Internal("gmatch iterator missing state".into())),
    };
    let s_key = ctx.heap_mut().intern_str("s");
    let pat_key = ctx.heap_mut().intern_str("p");
    let pos_key = ctx.heap_mut().intern_str("pos");
    let s_handle = match ctx.heap().table(state)?.get(&Value::String(s_key)) {
        Value::String(h) => h,
        _ => return Err(LuaError::Internal("gmatch iterator missing subject".into())),
    };
    let pat_handle = match ctx.heap().table(state)?.get(&Value::String(pat_key)) {
        Value::String(h) => h,
        _ => return Err(LuaError::Internal("gmatch iterator missing pattern".into())),
    };
    let pos = match ctx.heap().table(state)?.get(&Value::String(pos_key)) {
        Value::Integer(i) => i as usize,
        _ => 0,
    };
    let s = ctx.heap().get_string(s_handle)?.as_bytes().to_vec();
    let pat = ctx.heap().get_string(pat_handle)?.as_bytes().to_vec();
    if pos > s.len() {
        ctx.push_result(Value::Nil);
        return Ok(1);
    }
    match pattern::find(&s, &pat, pos) {
        Some(m) => {
            let next_pos = if m.end > m.start { m.end } else { m.end + 1 };
            ctx.heap_mut().table_mut(state)?.set(Value::String(pos_key), Value::Integer(next_pos as i64));
            if m.captures.is_empty() {
                let h = ctx.heap_mut().intern(&s[m.start..m.end]);
                ctx.push_result(Value::String(h));
                Ok(1)
            } else {
                let n = m.captures.len();
                for cap in &m.captures {
                    ctx.push_result(capture_value(ctx, &s, cap)?);
                }
                Ok(n as i32)
            }
        }
        None => {
            ctx.push_result(Value::Nil);
            Ok(1)
        }
    }
}

fn gsub(ctx: &mut dyn ExecutionContext) -> Result<i32> {
    let s = check::string_bytes(ctx, 0, "gsub")?;
    let pat = check::string_bytes(ctx, 1, "gsub")?;
    let repl = ctx.arg(2);
    let max_n = if ctx.arg_count() >= 4 { check::integer(ctx, 3, "gsub")? } else { i64::MAX };

    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut count: i64 = 0;
    while pos <= s.len() && count < max_n {
        match pattern::find(&s, &pat, pos) {
            Some(m) => {
                out.extend_from_slice(&s[pos..m.start]);
                let whole = &s[m.start..m.end];
                let replacement = render_replacement(ctx, &s, whole, &m.captures, &repl)?;
                out.extend_from_slice(&replacement);
                count += 1;
                pos = if m.end > m.start {
                    m.end
                } else {
                    if m.end < s.len() {
                        out.push(s[m.end]);
                    }
                    m.end + 1
                };
            }
            None => break,
        }
    }
    if pos <= s.len() {
        out.extend_from_slice(&s[pos..]);
    }
    let h = ctx.heap_mut().intern(&out);
    ctx.push_result(Value::String(h));
    ctx.push_result(Value::Integer(count));
    Ok(2)
}

fn render_replacement(
    ctx: &mut dyn ExecutionContext,
    s: &[u8],
    whole: &[u8],
    captures: &[pattern::Capture],
    repl: &Value,
) -> Result<Vec<u8>> {
    match repl {
        Value::String(h) => {
            let template = ctx.heap().get_string(*h)?.as_bytes().to_vec();
            let mut out = Vec::new();
            let mut i = 0;
            while i < template.len() {
                if template[i] == b'%' && i + 1 < template.len() {
                    let next = template[i + 1];
                    if next == b'%' {
                        out.push(b'%');
                        i += 2;
                        continue;
                    }
                    if next == b'0' {
                        out.extend_from_slice(whole);
                        i += 2;
                        continue;
                    }
                    if next.is_ascii_digit() {
                        let idx = (next - b'1') as usize;
                        if captures.is_empty() && idx == 0 {
                            out.extend_from_slice(whole);
                        } else if let Some(cap) = captures.get(idx) {
                            match cap {
                                pattern::Capture::Span(a, b) => out.extend_from_slice(&s[*a..*b]),
                                pattern::Capture::Position(p) => out.extend_from_slice((p + 1).to_string().as_bytes()),
                            }
                        }
                        i += 2;
                        continue;
                    }
                }
                out.push(template[i]);
                i += 1;
            }
            Ok(out)
        }
        Value::Table(t) => {
            let key = if captures.is_empty() {
                let h = ctx.heap_mut().intern(whole);
                Value::String(h)
            } else {
                capture_value(ctx, s, &captures[0])?
            };
            let v = ctx.heap().table(*t)?.get(&key);
            replacement_result_bytes(ctx, v, whole)
        }
        Value::Closure(_) | Value::CFunction(_) => {
            let args = if captures.is_empty() {
                let h = ctx.heap_mut().intern(whole);
                vec![Value::String(h)]
            } else {
                captures.iter().map(|c| capture_value(ctx, s, c)).collect::<Result<Vec<_>>>()?
            };
            let results = ctx.call_value(repl.clone(), args)?;
            replacement_result_bytes(ctx, results.into_iter().next().unwrap_or(Value::Nil), whole)
        }
        other => Err(super::check::bad_arg(2, "gsub", "string/function/table", other)),
    }
}

fn replacement_result_bytes(ctx: &mut dyn ExecutionContext, v: Value, whole: &[u8]) -> Result<Vec<u8>> {
    match v {
        Value::Nil | Value::Boolean(false) => Ok(whole.to_vec()),
        Value::String(h) => Ok(ctx.heap().get_string(h)?.as_bytes().to_vec()),
        Value::Integer(_) | Value::Float(_) => Ok(v.to_string().into_bytes()),
        other => Err(LuaError::runtime(format!("invalid replacement value (a {})", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_g_trims_trailing_zeros() {
        assert_eq!(format_g(3.0, 14).as_deref(), Some("3.0"));
        assert_eq!(format_g(3.5, 14).as_deref(), Some("3.5"));
    }

    #[test]
    fn resolve_index_handles_negative_offsets() {
        assert_eq!(resolve_index(-1, 5), 5);
        assert_eq!(resolve_index(1, 5), 1);
    }
}
