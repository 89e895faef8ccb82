//! Lua pattern matching: character classes, sets, anchors, quantifiers,
//! captures, `%b` balanced matches and `%f` frontier patterns. Ported from
//! the algorithm described in the Lua reference manual's `§6.4.1`, not from
//! any corpus file — the teacher's `string.rs` leaves this unimplemented.

const MAX_CAPTURES: usize = 32;
const CAP_POSITION: isize = -2;
const CAP_UNFINISHED: isize = -1;

#[derive(Debug, Clone, Copy)]
struct CapSlot {
    start: usize,
    len: isize,
}

#[derive(Debug, Clone)]
pub enum Capture {
    Span(usize, usize),
    Position(usize),
}

pub struct Match {
    pub start: usize,
    pub end: usize,
    pub captures: Vec<Capture>,
}

struct MatchState<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    caps: Vec<CapSlot>,
}

/// Quick pre-check so callers can take a plain-substring fast path when a
/// "pattern" has no magic characters at all.
pub fn has_specials(pat: &[u8]) -> bool {
    pat.iter().any(|&b| b"^$*+?.([%-".contains(&b))
}

pub fn find(src: &[u8], pat: &[u8], init: usize) -> Option<Match> {
    let anchored = pat.first() == Some(&b'^');
    let pat_body = if anchored { &pat[1..] } else { pat };
    let mut start = init.min(src.len());
    loop {
        let mut ms = MatchState { src, pat, caps: Vec::new() };
        if let Some(end) = do_match(&mut ms, start, pat_offset(pat, pat_body)) {
            let captures = ms
                .caps
                .iter()
                .map(|c| {
                    if c.len == CAP_POSITION {
                        Capture::Position(c.start)
                    } else {
                        Capture::Span(c.start, (c.start as isize + c.len) as usize)
                    }
                })
                .collect();
            return Some(Match { start, end, captures });
        }
        if anchored || start >= src.len() {
            return None;
        }
        start += 1;
    }
}

fn pat_offset(full: &[u8], body: &[u8]) -> usize {
    full.len() - body.len()
}

/// Attempts a match of `pat[pp..]` against `src[sp..]`; returns the end
/// position in `src` on success. Mirrors Lua's recursive `match` in
/// `lstrlib.c`, adapted to Rust indices/slices.
fn do_match(ms: &mut MatchState, sp: usize, pp: usize) -> Option<usize> {
    if pp >= ms.pat.len() {
        return Some(sp);
    }
    match ms.pat[pp] {
        b'(' => {
            if ms.pat.get(pp + 1) == Some(&b')') {
                start_capture(ms, sp, pp + 2, CAP_POSITION)
            } else {
                start_capture(ms, sp, pp + 1, CAP_UNFINISHED)
            }
        }
        b')' => end_capture(ms, sp, pp + 1),
        b'$' if pp + 1 == ms.pat.len() => {
            if sp == ms.src.len() {
                Some(sp)
            } else {
                None
            }
        }
        b'%' if ms.pat.get(pp + 1) == Some(&b'b') => match_balance(ms, sp, pp),
        b'%' if ms.pat.get(pp + 1) == Some(&b'f') => match_frontier(ms, sp, pp),
        b'%' if ms.pat.get(pp + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
            match_capture_backref(ms, sp, pp)
        }
        _ => match_default(ms, sp, pp),
    }
}

fn start_capture(ms: &mut MatchState, sp: usize, pp: usize, what: isize) -> Option<usize> {
    if ms.caps.len() >= MAX_CAPTURES {
        return None;
    }
    ms.caps.push(CapSlot { start: sp, len: what });
    let res = do_match(ms, sp, pp);
    if res.is_none() {
        ms.caps.pop();
    }
    res
}

fn end_capture(ms: &mut MatchState, sp: usize, pp: usize) -> Option<usize> {
    let idx = ms.caps.iter().rposition(|c| c.len == CAP_UNFINISHED)?;
    ms.caps[idx].len = sp as isize - ms.caps[idx].start as isize;
    let res = do_match(ms, sp, pp);
    if res.is_none() {
        ms.caps[idx].len = CAP_UNFINISHED;
    }
    res
}

fn match_capture_backref(ms: &mut MatchState, sp: usize, pp: usize) -> Option<usize> {
    let idx = (ms.pat[pp + 1] - b'1') as usize;
    let cap = *ms.caps.get(idx)?;
    if cap.len < 0 {
        return None;
    }
    let text = &ms.src[cap.start..(cap.start as isize + cap.len) as usize];
    if ms.src.len() >= sp + text.len() && &ms.src[sp..sp + text.len()] == text {
        do_match(ms, sp + text.len(), pp + 2)
    } else {
        None
    }
}

fn match_balance(ms: &mut MatchState, sp: usize, pp: usize) -> Option<usize> {
    let open = *ms.pat.get(pp + 2)?;
    let close = *ms.pat.get(pp + 3)?;
    if ms.src.get(sp) != Some(&open) {
        return None;
    }
    let mut depth = 1;
    let mut i = sp + 1;
    while i < ms.src.len() {
        if ms.src[i] == close {
            depth -= 1;
            if depth == 0 {
                return do_match(ms, i + 1, pp + 4);
            }
        } else if ms.src[i] == open {
            depth += 1;
        }
        i += 1;
    }
    None
}

fn match_frontier(ms: &mut MatchState, sp: usize, pp: usize) -> Option<usize> {
    if ms.pat.get(pp + 2) != Some(&b'[') {
        return None;
    }
    let set_start = pp + 2;
    let set_end = class_end(ms.pat, set_start);
    let prev = if sp == 0 { 0u8 } else { ms.src[sp - 1] };
    let cur = if sp < ms.src.len() { ms.src[sp] } else { 0u8 };
    if !match_class_set(prev, ms.pat, set_start, set_end) && match_class_set(cur, ms.pat, set_start, set_end) {
        do_match(ms, sp, set_end)
    } else {
        None
    }
}

/// Handles a single pattern item (class/set/literal) possibly followed by a
/// `* + - ?` quantifier.
fn match_default(ms: &mut MatchState, sp: usize, pp: usize) -> Option<usize> {
    let ep = class_end(ms.pat, pp);
    let matches_here = sp < ms.src.len() && single_match(ms.src[sp], ms.pat, pp, ep);
    match ms.pat.get(ep) {
        Some(b'?') => {
            if matches_here {
                if let Some(r) = do_match(ms, sp + 1, ep + 1) {
                    return Some(r);
                }
            }
            do_match(ms, sp, ep + 1)
        }
        Some(b'*') => max_expand(ms, sp, pp, ep),
        Some(b'+') => {
            if matches_here {
                max_expand(ms, sp + 1, pp, ep)
            } else {
                None
            }
        }
        Some(b'-') => min_expand(ms, sp, pp, ep),
        _ => {
            if matches_here {
                do_match(ms, sp + 1, ep)
            } else {
                None
            }
        }
    }
}

fn max_expand(ms: &mut MatchState, sp: usize, pp: usize, ep: usize) -> Option<usize> {
    let mut count = 0;
    while sp + count < ms.src.len() && single_match(ms.src[sp + count], ms.pat, pp, ep) {
        count += 1;
    }
    loop {
        if let Some(r) = do_match(ms, sp + count, ep + 1) {
            return Some(r);
        }
        if count == 0 {
            return None;
        }
        count -= 1;
    }
}

fn min_expand(ms: &mut MatchState, mut sp: usize, pp: usize, ep: usize) -> Option<usize> {
    loop {
        if let Some(r) = do_match(ms, sp, ep + 1) {
            return Some(r);
        }
        if sp < ms.src.len() && single_match(ms.src[sp], ms.pat, pp, ep) {
            sp += 1;
        } else {
            return None;
        }
    }
}

/// Index just past a single pattern item starting at `pp` (a `%x` escape, a
/// `[...]` set, or a lone literal/`.`).
fn class_end(pat: &[u8], pp: usize) -> usize {
    match pat.get(pp) {
        Some(b'%') => pp + 2,
        Some(b'[') => {
            let mut i = pp + 1;
            if pat.get(i) == Some(&b'^') {
                i += 1;
            }
            if pat.get(i) == Some(&b']') {
                i += 1;
            }
            while pat.get(i) != Some(&b']') {
                if i >= pat.len() {
                    return pat.len();
                }
                if pat[i] == b'%' {
                    i += 1;
                }
                i += 1;
            }
            i + 1
        }
        _ => pp + 1,
    }
}

fn single_match(c: u8, pat: &[u8], pp: usize, ep: usize) -> bool {
    match pat[pp] {
        b'.' => true,
        b'%' => match_class(c, pat[pp + 1]),
        b'[' => match_class_set(c, pat, pp, ep),
        other => other == c,
    }
}

fn match_class(c: u8, class: u8) -> bool {
    let result = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'd' => c.is_ascii_digit(),
        b'l' => c.is_ascii_lowercase(),
        b'u' => c.is_ascii_uppercase(),
        b's' => c.is_ascii_whitespace(),
        b'w' => c.is_ascii_alphanumeric(),
        b'c' => c.is_ascii_control(),
        b'p' => c.is_ascii_punctuation(),
        b'x' => c.is_ascii_hexdigit(),
        b'g' => c.is_ascii_graphic(),
        _ => return c == class,
    };
    if class.is_ascii_uppercase() {
        !result
    } else {
        result
    }
}

fn match_class_set(c: u8, pat: &[u8], mut pp: usize, ep: usize) -> bool {
    pp += 1;
    let negate = pat.get(pp) == Some(&b'^');
    if negate {
        pp += 1;
    }
    let mut found = false;
    while pp < ep - 1 {
        if pat[pp] == b'%' {
            pp += 1;
            if match_class(c, pat[pp]) {
                found = true;
            }
            pp += 1;
        } else if pp + 2 < ep - 1 && pat[pp + 1] == b'-' {
            if pat[pp] <= c && c <= pat[pp + 2] {
                found = true;
            }
            pp += 3;
        } else {
            if pat[pp] == c {
                found = true;
            }
            pp += 1;
        }
    }
    found != negate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_literal_matches() {
        let m = find(b"hello world", b"world", 0).unwrap();
        assert_eq!((m.start, m.end), (6, 11));
    }

    #[test]
    fn digit_class_captures() {
        let m = find(b"abc 123 def", b"(%d+)", 0).unwrap();
        assert_eq!(m.start, 4);
        assert_eq!(m.end, 7);
        match &m.captures[0] {
            Capture::Span(a, b) => assert_eq!((*a, *b), (4, 7)),
            _ => panic!("expected span capture"),
        }
    }

    #[test]
    fn anchored_pattern_only_matches_at_start() {
        assert!(find(b"xabc", b"^abc", 0).is_none());
        assert!(find(b"abcx", b"^abc", 0).is_some());
    }

    #[test]
    fn balanced_match_finds_matching_parens() {
        let m = find(b"(foo(bar)baz)", b"%b()", 0).unwrap();
        assert_eq!((m.start, m.end), (0, 13));
    }

    #[test]
    fn character_set_negation() {
        let m = find(b"abc123", b"[^%d]+", 0).unwrap();
        assert_eq!((m.start, m.end), (0, 3));
    }

    #[test]
    fn position_capture_returns_index() {
        let m = find(b"hello", b"()ll", 0).unwrap();
        match &m.captures[0] {
            Capture::Position(p) => assert_eq!(*p, 2),
            _ => panic!("expected position capture"),
        }
    }
}
