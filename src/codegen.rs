//! Low-level instruction emission shared by [`crate::compiler`] (`§4.5`).
//!
//! One [`FunctionState`] per function being compiled: its own register
//! file, constant pool, child-prototype list, upvalue descriptors, and
//! line-event log. `crate::compiler::FunctionCompiler` drives these from
//! the AST; this module only knows about bytecode words and pools.

use std::rc::Rc;

use crate::error::{compile_error, Result};
use crate::opcode::{Instruction, OpCode};
use crate::register::RegisterAllocator;
use crate::value::{LineEvent, LineEventKind, LocalVarInfo, Proto, UpvalueDesc, Value, VarAttrib};

pub struct FunctionState {
    pub source: String,
    pub line_defined: u32,
    pub name: Option<String>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub reg: RegisterAllocator,
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    protos: Vec<Rc<Proto>>,
    upvalues: Vec<UpvalueDesc>,
    locals: Vec<LocalVarInfo>,
    line_events: Vec<LineEvent>,
    last_line: u32,
}

impl FunctionState {
    pub fn new(source: String, line_defined: u32, name: Option<String>) -> Self {
        FunctionState {
            source,
            line_defined,
            name,
            num_params: 0,
            is_vararg: false,
            reg: RegisterAllocator::new(),
            instructions: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            line_events: Vec::new(),
            last_line: line_defined,
        }
    }

    pub fn here(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn push(&mut self, instr: Instruction, line: u32) -> u32 {
        self.mark_line(line, LineEventKind::Execution);
        let pc = self.here();
        self.instructions.push(instr);
        pc
    }

    pub fn emit_abc(&mut self, op: OpCode, a: u8, b: u8, c: u8, line: u32) -> u32 {
        self.push(Instruction::abc(op, a, b, c), line)
    }

    pub fn emit_abx(&mut self, op: OpCode, a: u8, bx: u16, line: u32) -> u32 {
        self.push(Instruction::abx(op, a, bx), line)
    }

    pub fn emit_asbx(&mut self, op: OpCode, a: u8, sbx: i32, line: u32) -> u32 {
        self.push(Instruction::asbx(op, a, sbx), line)
    }

    /// Emits a placeholder jump, to be fixed up with [`Self::patch_jump`]
    /// once the target address is known.
    pub fn emit_jump(&mut self, line: u32) -> u32 {
        self.emit_asbx(OpCode::Jmp, 0, 0, line)
    }

    pub fn patch_jump(&mut self, pc: u32, target: u32) {
        let instr = self.instructions[pc as usize];
        let offset = target as i32 - pc as i32 - 1;
        self.instructions[pc as usize] = Instruction::asbx(instr.opcode(), instr.a(), offset);
    }

    pub fn patch_jump_here(&mut self, pc: u32) {
        let here = self.here();
        self.patch_jump(pc, here);
    }

    /// Appends a line event of `kind` unless it would be a no-op repeat of
    /// the immediately preceding event at the same line (`§4.5`'s dedup
    /// rule — only the first event at a given source line is kept for a
    /// straight-line run of instructions).
    pub fn mark_line(&mut self, line: u32, kind: LineEventKind) {
        if kind == LineEventKind::Execution {
            if let Some(last) = self.line_events.last() {
                if last.line == line && last.kind == LineEventKind::Execution {
                    return;
                }
            }
        }
        self.line_events.push(LineEvent { pc: self.here(), line, kind });
        self.last_line = line;
    }

    /// Interns a constant, reusing an existing slot for an equal value so
    /// small constant pools don't balloon on repeated literals.
    pub fn add_constant(&mut self, value: Value, line: u32) -> Result<u8> {
        if let Some(idx) = self.constants.iter().position(|existing| constants_equal(existing, &value)) {
            return Ok(idx as u8);
        }
        let idx = self.constants.len();
        if idx >= 256 {
            return Err(compile_error("function uses too many constants", line));
        }
        self.constants.push(value);
        Ok(idx as u8)
    }

    pub fn add_proto(&mut self, proto: Rc<Proto>, line: u32) -> Result<u16> {
        let idx = self.protos.len();
        if idx >= u16::MAX as usize {
            return Err(compile_error("function has too many nested functions", line));
        }
        self.protos.push(proto);
        Ok(idx as u16)
    }

    /// `true`: next slot is a fresh index; used by the compiler to dedup
    /// upvalue captures by (name, source) pair before calling
    /// [`Self::add_upvalue`].
    pub fn find_upvalue(&self, name: &str) -> Option<u8> {
        self.upvalues.iter().position(|u| u.name == name).map(|i| i as u8)
    }

    pub fn add_upvalue(&mut self, name: String, in_stack: bool, index: u8, line: u32) -> Result<u8> {
        if let Some(existing) = self.find_upvalue(&name) {
            return Ok(existing);
        }
        let idx = self.upvalues.len();
        if idx >= 256 {
            return Err(compile_error("function uses too many upvalues", line));
        }
        self.upvalues.push(UpvalueDesc { name, in_stack, index });
        Ok(idx as u8)
    }

    pub fn add_local(&mut self, name: String, register: u8, start_pc: u32, attrib: VarAttrib) -> usize {
        self.locals.push(LocalVarInfo { name, register, start_pc, end_pc: u32::MAX, attrib });
        self.locals.len() - 1
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn last_line(&self) -> u32 {
        self.last_line
    }

    pub fn close_locals_from(&mut self, mark: usize, end_pc: u32) {
        for local in &mut self.locals[mark..] {
            if local.end_pc == u32::MAX {
                local.end_pc = end_pc;
            }
        }
    }

    pub fn finish(self, last_line_defined: u32) -> Proto {
        Proto {
            source: self.source,
            line_defined: self.line_defined,
            last_line_defined,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.reg.max_stack_size().max(2) as u8,
            instructions: self.instructions.into_iter().map(|i| i.0).collect(),
            constants: self.constants,
            protos: self.protos,
            upvalues: self.upvalues,
            locals: self.locals,
            line_events: self.line_events,
            name: self.name,
        }
    }
}

fn constants_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::String(x), Value::String(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_dedup_reuses_slot() {
        let mut fs = FunctionState::new("=test".into(), 0, None);
        let a = fs.add_constant(Value::Integer(7), 1).unwrap();
        let b = fs.add_constant(Value::Integer(7), 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn jump_patch_computes_relative_offset() {
        let mut fs = FunctionState::new("=test".into(), 0, None);
        let j = fs.emit_jump(1);
        fs.emit_abc(OpCode::Move, 0, 0, 0, 2);
        fs.patch_jump_here(j);
        let proto = fs.finish(2);
        let instr = Instruction(proto.instructions[j as usize]);
        assert_eq!(instr.sbx(), 1);
    }
}
