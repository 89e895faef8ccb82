//! Function-local register allocation (`§4.3`).
//!
//! Mirrors the reference compiler's stack-slot discipline: locals and
//! temporaries share one flat register file per function, temporaries are
//! allocated and freed strictly LIFO (only the current top may be freed),
//! and `max_stack_size` is the high-water mark over the function's whole
//! compilation, not just its final depth.

use crate::error::{compile_error, Result};

/// One function's register file during codegen.
pub struct RegisterAllocator {
    /// Number of registers currently holding named locals (a prefix of the
    /// file; these never move once declared and are freed only when their
    /// enclosing scope ends).
    locals: u16,
    /// Current top of the register file (locals + live temporaries).
    top: u16,
    /// High-water mark of `top`, becomes `Proto::max_stack_size`.
    max: u16,
    line: u32,
}

impl RegisterAllocator {
    pub fn new() -> Self {
        RegisterAllocator { locals: 0, top: 0, max: 0, line: 0 }
    }

    pub fn max_stack_size(&self) -> u16 {
        self.max
    }

    pub fn top(&self) -> u16 {
        self.top
    }

    fn bump_max(&mut self) {
        if self.top > self.max {
            self.max = self.top;
        }
    }

    /// Reserves the next register as a new named local. Locals are never
    /// freed individually; `truncate_locals` drops a whole scope's worth at
    /// once when the block exits.
    pub fn alloc_local(&mut self, line: u32) -> Result<u8> {
        self.line = line;
        let reg = self.top;
        self.top = self.top.checked_add(1).ok_or_else(|| too_many_registers(line))?;
        self.locals = self.top;
        self.bump_max();
        u16_to_reg(reg, line)
    }

    /// Registers `count` consecutive locals, returning the first's index.
    pub fn alloc_locals(&mut self, count: u16, line: u32) -> Result<u8> {
        let first = self.top;
        for _ in 0..count {
            self.alloc_local(line)?;
        }
        u16_to_reg(first, line)
    }

    /// Drops every local from `mark` onward (a block/scope exit); any
    /// temporaries above them must already have been freed by the caller,
    /// enforced by the debug assertion below.
    pub fn truncate_locals(&mut self, mark: u16) {
        debug_assert!(self.top == self.locals, "temporaries still live when truncating locals");
        self.locals = mark;
        self.top = mark;
    }

    pub fn locals_mark(&self) -> u16 {
        self.locals
    }

    /// Allocates one temporary register above the current top.
    pub fn alloc_temp(&mut self, line: u32) -> Result<u8> {
        self.line = line;
        let reg = self.top;
        self.top = self.top.checked_add(1).ok_or_else(|| too_many_registers(line))?;
        self.bump_max();
        u16_to_reg(reg, line)
    }

    /// Allocates `count` consecutive temporaries, returning the first's
    /// index (used for call argument lists and table-constructor fields).
    pub fn alloc_temps(&mut self, count: u16, line: u32) -> Result<u8> {
        let first = self.top;
        for _ in 0..count {
            self.alloc_temp(line)?;
        }
        u16_to_reg(first, line)
    }

    /// Frees the single temporary at `reg`, which must be the current top
    /// minus one (LIFO discipline — only the most recently allocated
    /// temporary may be freed).
    pub fn free_temp(&mut self, reg: u8) {
        let reg = reg as u16;
        if reg >= self.locals {
            debug_assert_eq!(reg + 1, self.top, "temporaries must be freed in LIFO order");
            self.top = reg;
        }
    }

    /// Frees `count` temporaries ending at the current top.
    pub fn free_temps(&mut self, count: u16) {
        if count == 0 {
            return;
        }
        debug_assert!(self.top >= self.locals + count, "freeing more temporaries than are live");
        self.top -= count;
    }

    /// Runs `f` with one scratch temporary reserved, freeing it afterward
    /// regardless of how `f` returns (still requires the caller to respect
    /// LIFO freeing of anything `f` itself allocated above it).
    pub fn with_temp<T>(&mut self, line: u32, f: impl FnOnce(&mut Self, u8) -> Result<T>) -> Result<T> {
        let reg = self.alloc_temp(line)?;
        let result = f(self, reg);
        self.free_temp(reg);
        result
    }

    pub fn with_temps<T>(&mut self, count: u16, line: u32, f: impl FnOnce(&mut Self, u8) -> Result<T>) -> Result<T> {
        let first = self.alloc_temps(count, line)?;
        let result = f(self, first);
        self.free_temps(count);
        result
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn u16_to_reg(v: u16, line: u32) -> Result<u8> {
    u8::try_from(v).map_err(|_| too_many_registers(line))
}

fn too_many_registers(line: u32) -> crate::error::LuaError {
    compile_error("function or expression needs too many registers", line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locals_then_temps_lifo() {
        let mut a = RegisterAllocator::new();
        let l0 = a.alloc_local(1).unwrap();
        let l1 = a.alloc_local(1).unwrap();
        assert_eq!((l0, l1), (0, 1));
        let t0 = a.alloc_temp(1).unwrap();
        assert_eq!(t0, 2);
        a.free_temp(t0);
        assert_eq!(a.top(), 2);
    }

    #[test]
    fn max_stack_tracks_high_water_mark() {
        let mut a = RegisterAllocator::new();
        a.alloc_temps(5, 1).unwrap();
        a.free_temps(5);
        assert_eq!(a.max_stack_size(), 5);
        assert_eq!(a.top(), 0);
    }

    #[test]
    fn truncate_locals_drops_scope() {
        let mut a = RegisterAllocator::new();
        a.alloc_local(1).unwrap();
        let mark = a.locals_mark();
        a.alloc_local(1).unwrap();
        a.alloc_local(1).unwrap();
        a.truncate_locals(mark);
        assert_eq!(a.top(), mark);
    }

    #[test]
    fn too_many_registers_errors_instead_of_overflowing() {
        let mut a = RegisterAllocator::new();
        for _ in 0..256 {
            let _ = a.alloc_temp(1);
        }
        assert!(a.alloc_temp(1).is_err());
    }
}
