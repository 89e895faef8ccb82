//! Binary chunk writer/reader (`§6`): the exact byte-for-byte Lua
//! 5.4-wire-compatible layout — signature/version/format bytes, the
//! `LUAC_DATA` integrity check, size markers, endian probes, and a
//! recursive `Proto` encoding with tag-prefixed constants. Chunks produced
//! by [`write_chunk`] round-trip through [`read_chunk`] (`§8`'s
//! `dump . load = identity` property).

use std::rc::Rc;

use crate::error::ChunkError;
use crate::heap::LuaHeap;
use crate::value::{LineEvent, LineEventKind, LocalVarInfo, Proto, UpvalueDesc, Value, VarAttrib};

const SIGNATURE: [u8; 4] = [0x1B, b'L', b'u', b'a'];
const LUAC_VERSION: u8 = 0x54;
const LUAC_FORMAT: u8 = 0x00;
const LUAC_DATA: [u8; 6] = [0x19, 0x93, b'\r', b'\n', 0x1A, b'\n'];
const SIZEOF_INT: u8 = 4;
const SIZEOF_SIZE_T: u8 = 8;
const SIZEOF_INSTRUCTION: u8 = 4;
const SIZEOF_LUA_INTEGER: u8 = 8;
const SIZEOF_LUA_NUMBER: u8 = 8;
const LUAC_INT: i64 = 0x5678;
const LUAC_NUM: f64 = 370.5;

const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_FUNCTION: u8 = 6;

const NUMBER_VARIANT_INT: u8 = 0;
const NUMBER_VARIANT_FLOAT: u8 = 1;

/// Serializes `proto` (the compiled main chunk) to a Lua 5.4-shaped binary
/// chunk. `strip`: omit source names, line info and local-variable records
/// the way `luac -s` does.
pub fn write_chunk(heap: &LuaHeap, proto: &Proto, strip: bool) -> Vec<u8> {
    let mut w = Writer { buf: Vec::new() };
    w.bytes(&SIGNATURE);
    w.u8(LUAC_VERSION);
    w.u8(LUAC_FORMAT);
    w.bytes(&LUAC_DATA);
    w.u8(SIZEOF_INT);
    w.u8(SIZEOF_SIZE_T);
    w.u8(SIZEOF_INSTRUCTION);
    w.u8(SIZEOF_LUA_INTEGER);
    w.u8(SIZEOF_LUA_NUMBER);
    w.i64(LUAC_INT);
    w.f64(LUAC_NUM);
    w.u8(proto.upvalues.len() as u8);
    write_proto(&mut w, heap, proto, strip);
    w.buf
}

/// Parses a chunk produced by [`write_chunk`], interning any string
/// constants into `heap`.
pub fn read_chunk(heap: &mut LuaHeap, data: &[u8]) -> Result<Proto, ChunkError> {
    let mut r = Reader { data, pos: 0 };
    let sig = r.bytes(4)?;
    if sig != SIGNATURE {
        return Err(ChunkError::BadSignature);
    }
    let version = r.u8()?;
    if version != LUAC_VERSION {
        return Err(ChunkError::VersionMismatch { expected: LUAC_VERSION, got: version });
    }
    let _format = r.u8()?;
    let data_check = r.bytes(6)?;
    if data_check != LUAC_DATA {
        return Err(ChunkError::Corrupted("LUAC_DATA check failed".into()));
    }
    expect_size(&mut r, "int", SIZEOF_INT)?;
    expect_size(&mut r, "size_t", SIZEOF_SIZE_T)?;
    expect_size(&mut r, "Instruction", SIZEOF_INSTRUCTION)?;
    expect_size(&mut r, "lua_Integer", SIZEOF_LUA_INTEGER)?;
    expect_size(&mut r, "lua_Number", SIZEOF_LUA_NUMBER)?;
    let int_probe = r.i64()?;
    if int_probe != LUAC_INT {
        return Err(ChunkError::Corrupted("integer endianness probe mismatch".into()));
    }
    let num_probe = r.f64()?;
    if num_probe != LUAC_NUM {
        return Err(ChunkError::Corrupted("float endianness probe mismatch".into()));
    }
    let _main_nups = r.u8()?;
    read_proto(&mut r, heap)
}

/// Re-serializes `proto` with debug info zeroed, matching `luac -s`; the
/// chunk this returns is bit-identical whether stripped once or twice
/// (`§8`'s "stripping is idempotent" property), since stripping is just a
/// choice made at dump time rather than a mutation of `proto` itself.
pub fn strip_chunk(heap: &LuaHeap, proto: &Proto) -> Vec<u8> {
    write_chunk(heap, proto, true)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }

    fn lua_bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.bytes(b);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, ChunkError> {
        let b = self.bytes(1)?;
        Ok(b[0])
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        if self.pos + n > self.data.len() {
            return Err(ChunkError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, ChunkError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, ChunkError> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, ChunkError> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, ChunkError> {
        let bytes = self.lua_bytes()?;
        String::from_utf8(bytes).map_err(|_| ChunkError::Corrupted("non-UTF8 source name".into()))
    }

    fn lua_bytes(&mut self) -> Result<Vec<u8>, ChunkError> {
        let len = self.u32()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }
}

fn expect_size(r: &mut Reader, name: &'static str, expected: u8) -> Result<(), ChunkError> {
    let got = r.u8()?;
    if got != expected {
        return Err(ChunkError::SizeMismatch { name, expected, got });
    }
    Ok(())
}

/// Serializes one `Proto` in the exact field order `§6` lists: header
/// fields, instructions, constants, upvalues, child protos, then the
/// debug-info block (line info, local records, upvalue names) that
/// stripping zeroes out.
fn write_proto(w: &mut Writer, heap: &LuaHeap, proto: &Proto, strip: bool) {
    w.string(if strip { "=?" } else { &proto.source });
    w.u32(proto.line_defined);
    w.u32(proto.last_line_defined);
    w.u8(proto.num_params);
    w.u8(proto.is_vararg as u8);
    w.u8(proto.max_stack_size);

    w.u32(proto.instructions.len() as u32);
    for &instr in &proto.instructions {
        w.u32(instr);
    }

    w.u32(proto.constants.len() as u32);
    for k in &proto.constants {
        write_constant(w, heap, k);
    }

    w.u32(proto.upvalues.len() as u32);
    for uv in &proto.upvalues {
        w.u8(uv.in_stack as u8);
        w.u8(uv.index);
        w.u8(0); // kind: reserved, this runtime does not track per-upvalue const/close kind
    }

    w.u32(proto.protos.len() as u32);
    for child in &proto.protos {
        write_proto(w, heap, child, strip);
    }

    if strip {
        w.u32(0); // line events
        w.u32(0); // local vars
    } else {
        write_line_events(w, &proto.line_events);
        w.u32(proto.locals.len() as u32);
        for l in &proto.locals {
            w.string(&l.name);
            w.u32(l.register as u32);
            w.u32(l.start_pc);
            w.u32(l.end_pc);
            w.u8(var_attrib_tag(l.attrib));
        }
    }
    for uv in &proto.upvalues {
        if strip && uv.name != "_ENV" {
            w.string("");
        } else {
            w.string(&uv.name);
        }
    }
}

fn read_proto(r: &mut Reader, heap: &mut LuaHeap) -> Result<Proto, ChunkError> {
    let source = r.string()?;
    let line_defined = r.u32()?;
    let last_line_defined = r.u32()?;
    let num_params = r.u8()?;
    let is_vararg = r.u8()? != 0;
    let max_stack_size = r.u8()?;

    let n_instr = r.u32()? as usize;
    let mut instructions = Vec::with_capacity(n_instr);
    for _ in 0..n_instr {
        instructions.push(r.u32()?);
    }

    let n_const = r.u32()? as usize;
    let mut constants = Vec::with_capacity(n_const);
    for _ in 0..n_const {
        constants.push(read_constant(r, heap)?);
    }

    let n_upval = r.u32()? as usize;
    let mut in_stack = Vec::with_capacity(n_upval);
    let mut index = Vec::with_capacity(n_upval);
    for _ in 0..n_upval {
        in_stack.push(r.u8()? != 0);
        index.push(r.u8()?);
        let _kind = r.u8()?;
    }

    let n_protos = r.u32()? as usize;
    let mut protos = Vec::with_capacity(n_protos);
    for _ in 0..n_protos {
        protos.push(Rc::new(read_proto(r, heap)?));
    }

    let line_events = read_line_events(r)?;

    let n_locals = r.u32()? as usize;
    let mut locals = Vec::with_capacity(n_locals);
    for _ in 0..n_locals {
        let name = r.string()?;
        let register = r.u32()? as u8;
        let start_pc = r.u32()?;
        let end_pc = r.u32()?;
        let attrib = var_attrib_from_tag(r.u8()?)?;
        locals.push(LocalVarInfo { name, register, start_pc, end_pc, attrib });
    }

    let mut upvalues = Vec::with_capacity(n_upval);
    for i in 0..n_upval {
        let name = r.string()?;
        upvalues.push(UpvalueDesc { name, in_stack: in_stack[i], index: index[i] });
    }

    Ok(Proto {
        source,
        line_defined,
        last_line_defined,
        num_params,
        is_vararg,
        max_stack_size,
        instructions,
        constants,
        protos,
        upvalues,
        locals,
        line_events,
        name: None,
    })
}

/// Run-length-encodes consecutive events that share a line and kind over
/// contiguous `pc`s, as `§6`'s "line info run-length-encoded" calls for.
fn write_line_events(w: &mut Writer, events: &[LineEvent]) {
    let mut runs: Vec<(u32, u32, u8, u32)> = Vec::new();
    let mut i = 0;
    while i < events.len() {
        let start = &events[i];
        let kind = line_event_kind_tag(start.kind);
        let mut len = 1u32;
        while i + (len as usize) < events.len() {
            let next = &events[i + len as usize];
            if next.pc == start.pc + len && next.line == start.line && line_event_kind_tag(next.kind) == kind {
                len += 1;
            } else {
                break;
            }
        }
        runs.push((start.pc, start.line, kind, len));
        i += len as usize;
    }
    w.u32(runs.len() as u32);
    for (start_pc, line, kind, len) in runs {
        w.u32(start_pc);
        w.u32(line);
        w.u8(kind);
        w.u32(len);
    }
}

fn read_line_events(r: &mut Reader) -> Result<Vec<LineEvent>, ChunkError> {
    let n_runs = r.u32()? as usize;
    let mut events = Vec::new();
    for _ in 0..n_runs {
        let start_pc = r.u32()?;
        let line = r.u32()?;
        let kind = line_event_kind_from_tag(r.u8()?)?;
        let run_len = r.u32()?;
        for j in 0..run_len {
            events.push(LineEvent { pc: start_pc + j, line, kind });
        }
    }
    Ok(events)
}

fn write_constant(w: &mut Writer, heap: &LuaHeap, value: &Value) {
    match value {
        Value::Nil => w.u8(TAG_NIL),
        Value::Boolean(b) => {
            w.u8(TAG_BOOLEAN);
            w.u8(*b as u8);
        }
        Value::Integer(i) => {
            w.u8(TAG_NUMBER);
            w.u8(NUMBER_VARIANT_INT);
            w.i64(*i);
        }
        Value::Float(f) => {
            w.u8(TAG_NUMBER);
            w.u8(NUMBER_VARIANT_FLOAT);
            w.f64(*f);
        }
        Value::String(h) => {
            w.u8(TAG_STRING);
            let bytes = heap.get_string(*h).map(|s| s.as_bytes().to_vec()).unwrap_or_default();
            w.lua_bytes(&bytes);
        }
        other => panic!("{} is not a valid chunk constant", other.type_name()),
    }
}

fn read_constant(r: &mut Reader, heap: &mut LuaHeap) -> Result<Value, ChunkError> {
    let tag = r.u8()?;
    match tag {
        TAG_NIL => Ok(Value::Nil),
        TAG_BOOLEAN => Ok(Value::Boolean(r.u8()? != 0)),
        TAG_NUMBER => match r.u8()? {
            NUMBER_VARIANT_INT => Ok(Value::Integer(r.i64()?)),
            NUMBER_VARIANT_FLOAT => Ok(Value::Float(r.f64()?)),
            other => Err(ChunkError::Corrupted(format!("unknown number variant {}", other))),
        },
        TAG_STRING => {
            let bytes = r.lua_bytes()?;
            Ok(Value::String(heap.intern(&bytes)))
        }
        TAG_FUNCTION => {
            // Consumed to keep the reader's position correct for any
            // trailing sibling data, but this runtime has no bare-proto
            // value to hand back: function constants are only reachable
            // here through a foreign producer, since this compiler always
            // reaches nested functions through `protos` plus `CLOSURE`.
            let _ = read_proto(r, heap)?;
            Err(ChunkError::Corrupted("function constants are not supported".into()))
        }
        other => Err(ChunkError::Corrupted(format!("unknown constant tag {}", other))),
    }
}

fn line_event_kind_tag(kind: LineEventKind) -> u8 {
    match kind {
        LineEventKind::Execution => 0,
        LineEventKind::Iteration => 1,
        LineEventKind::Branch => 2,
        LineEventKind::Close => 3,
    }
}

fn line_event_kind_from_tag(tag: u8) -> Result<LineEventKind, ChunkError> {
    match tag {
        0 => Ok(LineEventKind::Execution),
        1 => Ok(LineEventKind::Iteration),
        2 => Ok(LineEventKind::Branch),
        3 => Ok(LineEventKind::Close),
        other => Err(ChunkError::Corrupted(format!("unknown line event kind {}", other))),
    }
}

fn var_attrib_tag(attrib: VarAttrib) -> u8 {
    match attrib {
        VarAttrib::None => 0,
        VarAttrib::Const => 1,
        VarAttrib::Close => 2,
    }
}

fn var_attrib_from_tag(tag: u8) -> Result<VarAttrib, ChunkError> {
    match tag {
        0 => Ok(VarAttrib::None),
        1 => Ok(VarAttrib::Const),
        2 => Ok(VarAttrib::Close),
        other => Err(ChunkError::Corrupted(format!("unknown variable attribute {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proto(heap: &mut LuaHeap) -> Proto {
        let s = heap.intern_str("hello");
        Proto {
            source: "=test".into(),
            line_defined: 0,
            last_line_defined: 3,
            num_params: 1,
            is_vararg: false,
            max_stack_size: 3,
            instructions: vec![0x0102_0304, 0xABCD_EF01],
            constants: vec![Value::Integer(7), Value::Float(1.5), Value::String(s), Value::Nil],
            protos: Vec::new(),
            upvalues: vec![UpvalueDesc { name: "_ENV".into(), in_stack: false, index: 0 }],
            locals: vec![LocalVarInfo { name: "x".into(), register: 0, start_pc: 0, end_pc: 2, attrib: VarAttrib::None }],
            line_events: vec![LineEvent { pc: 0, line: 1, kind: LineEventKind::Execution }],
            name: Some("f".into()),
        }
    }

    #[test]
    fn round_trips_unstripped() {
        let mut heap = LuaHeap::new();
        let proto = sample_proto(&mut heap);
        let bytes = write_chunk(&heap, &proto, false);
        let loaded = read_chunk(&mut heap, &bytes).unwrap();
        assert_eq!(loaded.instructions, proto.instructions);
        assert_eq!(loaded.source, proto.source);
        assert_eq!(loaded.locals.len(), 1);
        assert_eq!(loaded.upvalues[0].name, "_ENV");
    }

    #[test]
    fn strip_clears_debug_info_but_keeps_shape() {
        let mut heap = LuaHeap::new();
        let proto = sample_proto(&mut heap);
        let bytes = strip_chunk(&heap, &proto);
        let loaded = read_chunk(&mut heap, &bytes).unwrap();
        assert_eq!(loaded.source, "=?");
        assert!(loaded.locals.is_empty());
        assert!(loaded.line_events.is_empty());
        assert_eq!(loaded.upvalues[0].name, "_ENV");
        assert_eq!(loaded.line_defined, proto.line_defined);
        assert_eq!(loaded.last_line_defined, proto.last_line_defined);
    }

    #[test]
    fn stripping_is_idempotent() {
        let mut heap = LuaHeap::new();
        let proto = sample_proto(&mut heap);
        let once = strip_chunk(&heap, &proto);
        let loaded = read_chunk(&mut heap, &once).unwrap();
        let twice = strip_chunk(&heap, &loaded);
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_bad_signature() {
        let err = read_chunk(&mut LuaHeap::new(), b"not a chunk").unwrap_err();
        assert!(matches!(err, ChunkError::BadSignature));
    }
}
