//! AST-to-bytecode compilation (`§4.4`/`§4.5`).
//!
//! One [`crate::codegen::FunctionState`] per nested Lua function, held on a
//! flat stack so upvalue capture can walk outward without self-referential
//! borrows. Variable resolution always bottoms out at `_ENV`: a name with
//! no visible local/upvalue binding compiles to `_ENV[name]`, matching the
//! reference semantics that globals are sugar for indexing the current
//! environment.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::*;
use crate::codegen::FunctionState;
use crate::error::{compile_error, Result};
use crate::heap::LuaHeap;
use crate::opcode::{rk_const, rk_reg, OpCode};
use crate::value::{LineEventKind, Proto, VarAttrib, Value};

/// Compiles a top-level chunk into a callable prototype. The chunk behaves
/// like a vararg function whose sole upvalue is `_ENV`, bound by whatever
/// creates the resulting closure (see `crate::lib`).
pub fn compile_chunk(heap: &mut LuaHeap, chunk: FunctionBody, source: impl Into<String>) -> Result<Rc<Proto>> {
    let mut c = Compiler { heap, funcs: Vec::new() };
    c.push_function(source.into(), chunk.line, None, true);
    c.cur().fs.add_upvalue("_ENV".to_string(), false, 0, chunk.line)?;
    c.compile_function_body(&chunk)?;
    let proto = c.pop_function(chunk.last_line)?;
    Ok(Rc::new(proto))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VarRef {
    Local(u8),
    Upvalue(u8),
}

struct PendingGoto {
    label: String,
    jump_pc: u32,
    line: u32,
}

struct Scope {
    locals_mark: u16,
    local_count_mark: usize,
    names: Vec<(String, u8, VarAttrib)>,
    labels: HashMap<String, u32>,
    pending_gotos: Vec<PendingGoto>,
    is_loop: bool,
    break_jumps: Vec<u32>,
}

struct FuncCtx {
    fs: FunctionState,
    scopes: Vec<Scope>,
}

struct Compiler<'h> {
    heap: &'h mut LuaHeap,
    funcs: Vec<FuncCtx>,
}

impl<'h> Compiler<'h> {
    fn push_function(&mut self, source: String, line: u32, name: Option<String>, is_vararg: bool) {
        let mut fs = FunctionState::new(source, line, name);
        fs.is_vararg = is_vararg;
        self.funcs.push(FuncCtx { fs, scopes: Vec::new() });
    }

    fn pop_function(&mut self, last_line: u32) -> Result<Proto> {
        let ctx = self.funcs.pop().expect("pop_function with no active function");
        debug_assert!(ctx.scopes.is_empty(), "function popped with open scopes");
        Ok(ctx.fs.finish(last_line))
    }

    fn cur(&mut self) -> &mut FuncCtx {
        self.funcs.last_mut().expect("no active function")
    }

    fn fs(&mut self) -> &mut FunctionState {
        &mut self.funcs.last_mut().expect("no active function").fs
    }

    fn push_scope(&mut self, is_loop: bool) {
        let ctx = self.cur();
        let locals_mark = ctx.fs.reg.locals_mark();
        let local_count_mark = ctx.fs.local_count();
        ctx.scopes.push(Scope {
            locals_mark,
            local_count_mark,
            names: Vec::new(),
            labels: HashMap::new(),
            pending_gotos: Vec::new(),
            is_loop,
            break_jumps: Vec::new(),
        });
    }

    /// Closes the innermost scope: resolves any of its own forward gotos
    /// against its own labels, truncates locals/registers, and propagates
    /// whatever's left unresolved to the enclosing scope (or errors, at
    /// the outermost scope of a function).
    fn pop_scope(&mut self) -> Result<Scope> {
        let ctx = self.cur();
        let mut scope = ctx.scopes.pop().expect("pop_scope with no open scope");
        let end_pc = ctx.fs.here();

        scope.pending_gotos.retain(|g| {
            if let Some(&target) = scope.labels.get(&g.label) {
                ctx.fs.patch_jump(g.jump_pc, target);
                false
            } else {
                true
            }
        });

        // Closing here severs any open upvalues captured from this scope's
        // locals so a closure made on one loop iteration doesn't see the
        // next iteration's values. `<close>` variables additionally run
        // their __close metamethod, but only at the owning function's
        // return (`pop_frame` drains `pending_close` regardless of
        // register) — a `break`/`goto` past this point still closes
        // upvalues correctly but defers `__close` to the function exit,
        // a simplification from per-block-exit closing.
        if !scope.names.is_empty() {
            ctx.fs.emit_abc(OpCode::Close, scope.locals_mark as u8, 0, 0, ctx.fs.last_line());
        }

        ctx.fs.close_locals_from(scope.local_count_mark, end_pc);
        ctx.fs.reg.truncate_locals(scope.locals_mark);

        if let Some(parent) = ctx.scopes.last_mut() {
            parent.pending_gotos.extend(scope.pending_gotos.drain(..));
        } else if let Some(first) = scope.pending_gotos.first() {
            return Err(compile_error(format!("no visible label '{}' for goto", first.label), first.line));
        }
        Ok(scope)
    }

    fn declare_local(&mut self, name: String, attrib: VarAttrib, line: u32) -> Result<u8> {
        let ctx = self.cur();
        let reg = ctx.fs.reg.alloc_local(line)?;
        ctx.fs.add_local(name.clone(), reg, ctx.fs.here(), attrib);
        ctx.scopes.last_mut().expect("declare_local outside any scope").names.push((name, reg, attrib));
        Ok(reg)
    }

    /// Search `name` through the scope chain of function `idx`, capturing
    /// it as an upvalue into every function between its binding site and
    /// the function that asked, `§4.4`.
    fn resolve_in(&mut self, idx: usize, name: &str, line: u32) -> Result<Option<VarRef>> {
        for scope in self.funcs[idx].scopes.iter().rev() {
            if let Some(&(_, reg, _)) = scope.names.iter().rev().find(|(n, _, _)| n == name) {
                return Ok(Some(VarRef::Local(reg)));
            }
        }
        if idx == 0 {
            return Ok(None);
        }
        match self.resolve_in(idx - 1, name, line)? {
            Some(VarRef::Local(reg)) => {
                let uv = self.funcs[idx].fs.add_upvalue(name.to_string(), true, reg, line)?;
                Ok(Some(VarRef::Upvalue(uv)))
            }
            Some(VarRef::Upvalue(parent_uv)) => {
                let uv = self.funcs[idx].fs.add_upvalue(name.to_string(), false, parent_uv, line)?;
                Ok(Some(VarRef::Upvalue(uv)))
            }
            None => Ok(None),
        }
    }

    fn resolve(&mut self, name: &str, line: u32) -> Result<Option<VarRef>> {
        let top = self.funcs.len() - 1;
        self.resolve_in(top, name, line)
    }

    fn env_ref(&mut self, line: u32) -> Result<VarRef> {
        Ok(self.resolve("_ENV", line)?.expect("_ENV must always resolve: seeded on the main chunk"))
    }

    fn const_attrib_of(&mut self, name: &str) -> Option<VarAttrib> {
        let ctx = self.funcs.last()?;
        for scope in ctx.scopes.iter().rev() {
            if let Some(&(_, _, attrib)) = scope.names.iter().rev().find(|(n, _, _)| n == name) {
                return Some(attrib);
            }
        }
        None
    }

    // ----- constants -----

    fn const_string(&mut self, s: &[u8], line: u32) -> Result<u8> {
        let handle = self.heap.intern(s);
        self.fs().add_constant(Value::String(handle), line)
    }

    // ----- statements -----

    fn compile_function_body(&mut self, body: &FunctionBody) -> Result<()> {
        self.push_scope(false);
        for p in &body.params {
            self.declare_local(p.clone(), VarAttrib::None, body.line)?;
        }
        self.cur().fs.num_params = body.params.len() as u8;
        self.compile_block(&body.block)?;
        self.pop_scope()?;
        self.fs().emit_abc(OpCode::Return, 0, 1, 0, body.last_line);
        Ok(())
    }

    fn compile_block(&mut self, block: &Block) -> Result<()> {
        let mut i = 0;
        while i < block.statements.len() {
            self.compile_stat(&block.statements[i])?;
            i += 1;
        }
        Ok(())
    }

    fn compile_stat(&mut self, stat: &Stat) -> Result<()> {
        match stat {
            Stat::Assign { targets, values, line } => self.compile_assign(targets, values, *line),
            Stat::Local { names, values, line } => self.compile_local(names, values, *line),
            Stat::Call(expr) => self.compile_call_statement(expr),
            Stat::Do(block) => {
                self.push_scope(false);
                self.compile_block(block)?;
                self.pop_scope()?;
                Ok(())
            }
            Stat::While { cond, body, line } => self.compile_while(cond, body, *line),
            Stat::Repeat { body, cond, line } => self.compile_repeat(body, cond, *line),
            Stat::If { arms, else_block, line } => self.compile_if(arms, else_block, *line),
            Stat::NumericFor { var, start, limit, step, body, line } => {
                self.compile_numeric_for(var, start, limit, step.as_ref(), body, *line)
            }
            Stat::GenericFor { names, exprs, body, line } => self.compile_generic_for(names, exprs, body, *line),
            Stat::FunctionDecl { target, is_method, body, line } => self.compile_function_decl(target, *is_method, body, *line),
            Stat::LocalFunction { name, body, line } => self.compile_local_function(name, body, *line),
            Stat::Return { values, line } => self.compile_return(values, *line),
            Stat::Break(line) => self.compile_break(*line),
            Stat::Goto { label, line } => self.compile_goto(label, *line),
            Stat::Label(name) => self.compile_label(name),
        }
    }

    fn compile_label(&mut self, name: &str) -> Result<()> {
        let pc = self.fs().here();
        let ctx = self.cur();
        let scope = ctx.scopes.last_mut().expect("label outside any scope");
        scope.labels.insert(name.to_string(), pc);
        Ok(())
    }

    fn compile_goto(&mut self, label: &str, line: u32) -> Result<()> {
        for scope in self.cur().scopes.iter().rev() {
            if let Some(&target) = scope.labels.get(label) {
                let jmp = self.fs().emit_jump(line);
                self.fs().patch_jump(jmp, target);
                return Ok(());
            }
        }
        let jmp = self.fs().emit_jump(line);
        self.cur().scopes.last_mut().expect("goto outside any scope").pending_gotos.push(PendingGoto {
            label: label.to_string(),
            jump_pc: jmp,
            line,
        });
        Ok(())
    }

    fn compile_break(&mut self, line: u32) -> Result<()> {
        let jmp = self.fs().emit_jump(line);
        for scope in self.cur().scopes.iter_mut().rev() {
            if scope.is_loop {
                scope.break_jumps.push(jmp);
                return Ok(());
            }
        }
        Err(compile_error("break outside a loop", line))
    }

    fn compile_return(&mut self, values: &[Expr], line: u32) -> Result<()> {
        if values.is_empty() {
            self.fs().emit_abc(OpCode::Return, 0, 1, 0, line);
            return Ok(());
        }
        let first = self.compile_exprlist(values, -1, line)?;
        self.fs().emit_abc(OpCode::Return, first, 0, 0, line);
        self.cur().fs.reg.free_temps(values.len() as u16);
        Ok(())
    }

    fn compile_assign(&mut self, targets: &[Expr], values: &[Expr], line: u32) -> Result<()> {
        let first = self.compile_exprlist(values, targets.len() as i32, line)?;
        for (i, target) in targets.iter().enumerate() {
            self.store_to_target(target, first + i as u8, line)?;
        }
        self.cur().fs.reg.free_temps(reserved_count(values.len(), targets.len() as i32));
        Ok(())
    }

    fn store_to_target(&mut self, target: &Expr, value_reg: u8, line: u32) -> Result<()> {
        match target {
            Expr::Name(name) => {
                if let Some(VarAttrib::Const | VarAttrib::Close) = self.const_attrib_of(name) {
                    return Err(compile_error(format!("attempt to assign to const variable '{}'", name), line));
                }
                match self.resolve(name, line)? {
                    Some(VarRef::Local(reg)) => {
                        self.fs().emit_abc(OpCode::Move, reg, value_reg, 0, line);
                    }
                    Some(VarRef::Upvalue(uv)) => {
                        self.fs().emit_abc(OpCode::SetUpval, value_reg, uv, 0, line);
                    }
                    None => {
                        let env = self.env_ref(line)?;
                        let key = self.const_string(name.as_bytes(), line)?;
                        self.emit_env_store(env, rk_const(key), value_reg, line)?;
                    }
                }
            }
            Expr::Index { object, key, line: iline } => {
                let (obj_reg, obj_free) = self.compile_to_reg(object, *iline)?;
                let (key_rk, key_free) = self.compile_to_rk(key, *iline)?;
                self.fs().emit_abc(OpCode::SetTable, obj_reg, key_rk, rk_reg(value_reg), *iline);
                self.free_opt(key_free);
                self.free_opt(obj_free);
            }
            _ => return Err(compile_error("cannot assign to this expression", line)),
        }
        Ok(())
    }

    fn emit_env_store(&mut self, env: VarRef, key_rk: u8, value_reg: u8, line: u32) -> Result<()> {
        match env {
            VarRef::Upvalue(uv) => {
                self.fs().emit_abc(OpCode::SetTabUp, uv, key_rk, rk_reg(value_reg), line);
            }
            VarRef::Local(reg) => {
                self.fs().emit_abc(OpCode::SetTable, reg, key_rk, rk_reg(value_reg), line);
            }
        }
        Ok(())
    }

    fn compile_local(&mut self, names: &[(String, VarAttrib)], values: &[Expr], line: u32) -> Result<()> {
        let first = self.compile_exprlist(values, names.len() as i32, line)?;
        self.cur().fs.reg.free_temps(reserved_count(values.len(), names.len() as i32));
        for (i, (name, attrib)) in names.iter().enumerate() {
            let reg = self.declare_local(name.clone(), *attrib, line)?;
            debug_assert_eq!(reg, first + i as u8, "locals must land exactly where their values were computed");
            if *attrib == VarAttrib::Close {
                self.fs().emit_abc(OpCode::Tbc, reg, 0, 0, line);
            }
        }
        Ok(())
    }

    fn compile_local_function(&mut self, name: &str, body: &FunctionBody, line: u32) -> Result<()> {
        // The name is declared before the body compiles so the function
        // can see itself for recursion.
        let reg = self.declare_local(name.to_string(), VarAttrib::None, line)?;
        self.compile_closure_expr(body, Some(name.to_string()), reg, line)
    }

    fn compile_function_decl(&mut self, target: &FunctionName, is_method: bool, body: &FunctionBody, line: u32) -> Result<()> {
        let full_name = std::iter::once(target.base.clone()).chain(target.path.iter().cloned()).collect::<Vec<_>>().join(if is_method { ":" } else { "." });
        let reg = self.cur().fs.reg.alloc_temp(line)?;
        self.compile_closure_expr(body, Some(full_name), reg, line)?;
        if target.path.is_empty() {
            self.store_to_target(&Expr::Name(target.base.clone()), reg, line)?;
        } else {
            let mut obj = Expr::Name(target.base.clone());
            for (i, segment) in target.path.iter().enumerate() {
                if i + 1 == target.path.len() {
                    self.store_to_target(
                        &Expr::Index { object: Box::new(obj.clone()), key: Box::new(Expr::Str(segment.clone().into_bytes())), line },
                        reg,
                        line,
                    )?;
                } else {
                    obj = Expr::Index { object: Box::new(obj), key: Box::new(Expr::Str(segment.clone().into_bytes())), line };
                }
            }
        }
        self.cur().fs.reg.free_temp(reg);
        Ok(())
    }

    fn compile_if(&mut self, arms: &[(Expr, Block)], else_block: &Option<Block>, line: u32) -> Result<()> {
        let mut end_jumps = Vec::new();
        for (idx, (cond, body)) in arms.iter().enumerate() {
            let jmp_false = self.jump_if_false(cond, line)?;
            self.push_scope(false);
            self.compile_block(body)?;
            self.pop_scope()?;
            let has_more = idx + 1 < arms.len() || else_block.is_some();
            if has_more {
                end_jumps.push(self.fs().emit_jump(line));
            }
            self.fs().patch_jump_here(jmp_false);
        }
        if let Some(block) = else_block {
            self.push_scope(false);
            self.compile_block(block)?;
            self.pop_scope()?;
        }
        for jmp in end_jumps {
            self.fs().patch_jump_here(jmp);
        }
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<()> {
        let loop_start = self.fs().here();
        let jmp_out = self.jump_if_false(cond, line)?;
        self.push_scope(true);
        self.compile_block(body)?;
        let scope = self.pop_scope()?;
        let back = self.fs().emit_jump(line);
        self.fs().patch_jump(back, loop_start);
        self.fs().patch_jump_here(jmp_out);
        for jmp in scope.break_jumps {
            self.fs().patch_jump_here(jmp);
        }
        Ok(())
    }

    fn compile_repeat(&mut self, body: &Block, cond: &Expr, line: u32) -> Result<()> {
        let loop_start = self.fs().here();
        self.push_scope(true);
        self.compile_block(body)?;
        // `until` can still see the body's locals, so the scope can't close
        // before the condition compiles — but a looping iteration still
        // needs its upvalues severed before the next one starts, so close
        // explicitly here rather than waiting for `pop_scope`.
        let (locals_mark, has_names) = {
            let scope = self.cur().scopes.last().unwrap();
            (scope.locals_mark, !scope.names.is_empty())
        };
        if has_names {
            self.fs().emit_abc(OpCode::Close, locals_mark as u8, 0, 0, line);
        }
        let jmp_repeat = self.jump_if_false(cond, line)?;
        self.fs().patch_jump(jmp_repeat, loop_start);
        let scope = self.pop_scope()?;
        for jmp in scope.break_jumps {
            self.fs().patch_jump_here(jmp);
        }
        Ok(())
    }

    fn compile_numeric_for(&mut self, var: &str, start: &Expr, limit: &Expr, step: Option<&Expr>, body: &Block, line: u32) -> Result<()> {
        self.push_scope(true);
        let base = self.cur().fs.reg.alloc_local(line)?;
        self.compile_expr(start, base, line)?;
        self.cur().fs.reg.alloc_local(line)?;
        self.compile_expr(limit, base + 1, line)?;
        self.cur().fs.reg.alloc_local(line)?;
        match step {
            Some(e) => self.compile_expr(e, base + 2, line)?,
            None => {
                let k = self.fs().add_constant(Value::Integer(1), line)?;
                self.fs().emit_abx(OpCode::LoadK, base + 2, k as u16, line);
            }
        }

        let prep = self.fs().emit_asbx(OpCode::ForPrep, base, 0, line);
        let body_start = self.fs().here();
        // The loop variable and the body's own locals get a fresh scope
        // each iteration (not shared with the control registers above),
        // closing here — before the back-jump — so a closure made in one
        // iteration doesn't see later iterations' values.
        self.push_scope(false);
        let var_reg = self.declare_local(var.to_string(), VarAttrib::None, line)?;
        debug_assert_eq!(var_reg, base + 3);
        self.compile_block(body)?;
        self.pop_scope()?;
        let loop_pc = self.fs().emit_asbx(OpCode::ForLoop, base, 0, line);
        // FORPREP jumps straight to FORLOOP (not past it): FORLOOP does the
        // add-then-test on its own first run, so a range already out of
        // bounds skips the body entirely instead of running it once.
        self.fs().patch_jump(prep, loop_pc);
        self.fs().patch_jump(loop_pc, body_start);

        let scope = self.pop_scope()?;
        for jmp in scope.break_jumps {
            self.fs().patch_jump_here(jmp);
        }
        Ok(())
    }

    fn compile_generic_for(&mut self, names: &[String], exprs: &[Expr], body: &Block, line: u32) -> Result<()> {
        self.push_scope(true);
        let base = self.compile_exprlist(exprs, 3, line)?;
        self.cur().fs.reg.free_temps(reserved_count(exprs.len(), 3));
        let reclaimed = self.cur().fs.reg.alloc_local(line)?;
        debug_assert_eq!(reclaimed, base, "iterator triple must stay at the registers its values were computed into");
        self.cur().fs.reg.alloc_local(line)?;
        self.cur().fs.reg.alloc_local(line)?;

        let jmp_to_call = self.fs().emit_jump(line);
        let body_start = self.fs().here();
        self.push_scope(false);
        for name in names {
            self.declare_local(name.clone(), VarAttrib::None, line)?;
        }
        self.compile_block(body)?;
        self.pop_scope()?;
        self.fs().patch_jump_here(jmp_to_call);
        self.fs().emit_abc(OpCode::TForCall, base, 0, names.len() as u8, line);
        let loop_pc = self.fs().emit_asbx(OpCode::TForLoop, base, 0, line);
        self.fs().patch_jump(loop_pc, body_start);

        let scope = self.pop_scope()?;
        for jmp in scope.break_jumps {
            self.fs().patch_jump_here(jmp);
        }
        Ok(())
    }

    fn compile_call_statement(&mut self, expr: &Expr) -> Result<()> {
        let line = expr_line(expr);
        let reg = self.cur().fs.reg.alloc_temp(line)?;
        match expr {
            Expr::Call { callee, args, line } => self.compile_call(callee, args, reg, 0, *line)?,
            Expr::MethodCall { object, method, args, line } => self.compile_method_call(object, method, args, reg, 0, *line)?,
            _ => return Err(compile_error("syntax error (statement has no effect)", line)),
        }
        self.cur().fs.reg.free_temp(reg);
        Ok(())
    }

    // ----- expressions -----

    /// Compiles `expr` so exactly one value lands in `dest`.
    fn compile_expr(&mut self, expr: &Expr, dest: u8, line: u32) -> Result<()> {
        match expr {
            Expr::Nil => {
                self.fs().emit_abc(OpCode::LoadNil, dest, 0, 0, line);
            }
            Expr::True => {
                self.fs().emit_abc(OpCode::LoadBool, dest, 1, 0, line);
            }
            Expr::False => {
                self.fs().emit_abc(OpCode::LoadBool, dest, 0, 0, line);
            }
            Expr::Int(i) => {
                let k = self.fs().add_constant(Value::Integer(*i), line)?;
                self.fs().emit_abx(OpCode::LoadK, dest, k as u16, line);
            }
            Expr::Float(f) => {
                let k = self.fs().add_constant(Value::Float(*f), line)?;
                self.fs().emit_abx(OpCode::LoadK, dest, k as u16, line);
            }
            Expr::Str(s) => {
                let k = self.const_string(s, line)?;
                self.fs().emit_abx(OpCode::LoadK, dest, k as u16, line);
            }
            Expr::Vararg => {
                self.fs().emit_abc(OpCode::VarArg, dest, 2, 0, line);
            }
            Expr::Name(name) => self.compile_name(name, dest, line)?,
            Expr::Index { object, key, line } => {
                let (obj_reg, obj_free) = self.compile_to_reg(object, *line)?;
                let (key_rk, key_free) = self.compile_to_rk(key, *line)?;
                self.fs().emit_abc(OpCode::GetTable, dest, obj_reg, key_rk, *line);
                self.free_opt(key_free);
                self.free_opt(obj_free);
            }
            Expr::Call { callee, args, line } => self.compile_call(callee, args, dest, 1, *line)?,
            Expr::MethodCall { object, method, args, line } => self.compile_method_call(object, method, args, dest, 1, *line)?,
            Expr::Function(body) => self.compile_closure_expr(body, None, dest, line)?,
            Expr::Table { fields, line } => self.compile_table(fields, dest, *line)?,
            Expr::Binary { op: BinOp::And, lhs, rhs, line } => self.compile_and(lhs, rhs, dest, *line)?,
            Expr::Binary { op: BinOp::Or, lhs, rhs, line } => self.compile_or(lhs, rhs, dest, *line)?,
            Expr::Binary { op, lhs, rhs, line } if is_comparison(*op) => self.compile_comparison(*op, lhs, rhs, dest, *line)?,
            Expr::Binary { op: BinOp::Concat, lhs, rhs, line } => self.compile_concat(lhs, rhs, dest, *line)?,
            Expr::Binary { op, lhs, rhs, line } => {
                let (l, lfree) = self.compile_to_rk(lhs, *line)?;
                let (r, rfree) = self.compile_to_rk(rhs, *line)?;
                self.fs().emit_abc(arith_opcode(*op), dest, l, r, *line);
                self.free_opt(rfree);
                self.free_opt(lfree);
            }
            Expr::Unary { op, operand, line } => self.compile_unary(*op, operand, dest, *line)?,
            Expr::Paren(inner) => self.compile_expr(inner, dest, line)?,
        }
        Ok(())
    }

    fn compile_name(&mut self, name: &str, dest: u8, line: u32) -> Result<()> {
        match self.resolve(name, line)? {
            Some(VarRef::Local(reg)) => {
                self.fs().emit_abc(OpCode::Move, dest, reg, 0, line);
            }
            Some(VarRef::Upvalue(uv)) => {
                self.fs().emit_abc(OpCode::GetUpval, dest, uv, 0, line);
            }
            None => {
                let env = self.env_ref(line)?;
                let key = self.const_string(name.as_bytes(), line)?;
                match env {
                    VarRef::Upvalue(uv) => {
                        self.fs().emit_abc(OpCode::GetTabUp, dest, uv, rk_const(key), line);
                    }
                    VarRef::Local(reg) => {
                        self.fs().emit_abc(OpCode::GetTable, dest, reg, rk_const(key), line);
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_expr_to_any_reg(&mut self, expr: &Expr) -> Result<u8> {
        let line = expr_line(expr);
        let reg = self.cur().fs.reg.alloc_temp(line)?;
        self.compile_expr(expr, reg, line)?;
        Ok(reg)
    }

    /// Compiles `expr` to an `RK` operand: a constant-pool index for a
    /// foldable literal, the register already holding a local, or a fresh
    /// temporary otherwise. Returns the temporary (if any) so the caller
    /// can free it once the instruction using the operand is emitted.
    fn compile_to_rk(&mut self, expr: &Expr, line: u32) -> Result<(u8, Option<u8>)> {
        match expr {
            Expr::Int(i) => Ok((rk_const(self.fs().add_constant(Value::Integer(*i), line)?), None)),
            Expr::Float(f) => Ok((rk_const(self.fs().add_constant(Value::Float(*f), line)?), None)),
            Expr::Str(s) => Ok((rk_const(self.const_string(s, line)?), None)),
            Expr::Name(name) => match self.resolve(name, line)? {
                Some(VarRef::Local(reg)) => Ok((rk_reg(reg), None)),
                _ => {
                    let reg = self.compile_expr_to_any_reg(expr)?;
                    Ok((rk_reg(reg), Some(reg)))
                }
            },
            _ => {
                let reg = self.compile_expr_to_any_reg(expr)?;
                Ok((rk_reg(reg), Some(reg)))
            }
        }
    }

    /// Like [`Self::compile_to_rk`] but always yields a plain register —
    /// for operands (`GETTABLE`/`SETTABLE`/`SELF`'s object) that the
    /// instruction set never encodes as a constant-pool RK.
    fn compile_to_reg(&mut self, expr: &Expr, line: u32) -> Result<(u8, Option<u8>)> {
        match expr {
            Expr::Name(name) => match self.resolve(name, line)? {
                Some(VarRef::Local(reg)) => Ok((reg, None)),
                _ => {
                    let reg = self.compile_expr_to_any_reg(expr)?;
                    Ok((reg, Some(reg)))
                }
            },
            _ => {
                let reg = self.compile_expr_to_any_reg(expr)?;
                Ok((reg, Some(reg)))
            }
        }
    }

    fn free_opt(&mut self, reg: Option<u8>) {
        if let Some(r) = reg {
            self.cur().fs.reg.free_temp(r);
        }
    }

    fn jump_if_false(&mut self, cond: &Expr, line: u32) -> Result<u32> {
        let reg = self.compile_expr_to_any_reg(cond)?;
        self.fs().emit_abc(OpCode::Test, reg, 0, 0, line);
        let jmp = self.fs().emit_jump(line);
        self.cur().fs.reg.free_temp(reg);
        Ok(jmp)
    }

    fn compile_and(&mut self, lhs: &Expr, rhs: &Expr, dest: u8, line: u32) -> Result<()> {
        self.compile_expr(lhs, dest, line)?;
        self.fs().emit_abc(OpCode::TestSet, dest, dest, 0, line);
        let jmp = self.fs().emit_jump(line);
        self.compile_expr(rhs, dest, line)?;
        self.fs().patch_jump_here(jmp);
        Ok(())
    }

    fn compile_or(&mut self, lhs: &Expr, rhs: &Expr, dest: u8, line: u32) -> Result<()> {
        self.compile_expr(lhs, dest, line)?;
        self.fs().emit_abc(OpCode::TestSet, dest, dest, 1, line);
        let jmp = self.fs().emit_jump(line);
        self.compile_expr(rhs, dest, line)?;
        self.fs().patch_jump_here(jmp);
        Ok(())
    }

    fn compile_comparison(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, dest: u8, line: u32) -> Result<()> {
        let (opcode, a_flag, swap) = match op {
            BinOp::Eq => (OpCode::Eq, 1u8, false),
            BinOp::Ne => (OpCode::Eq, 0u8, false),
            BinOp::Lt => (OpCode::Lt, 1u8, false),
            BinOp::Le => (OpCode::Le, 1u8, false),
            BinOp::Gt => (OpCode::Lt, 1u8, true),
            BinOp::Ge => (OpCode::Le, 1u8, true),
            _ => unreachable!("compile_comparison called with non-comparison operator"),
        };
        let (l_expr, r_expr) = if swap { (rhs, lhs) } else { (lhs, rhs) };
        let (l, lfree) = self.compile_to_rk(l_expr, line)?;
        let (r, rfree) = self.compile_to_rk(r_expr, line)?;
        self.fs().emit_abc(opcode, a_flag, l, r, line);
        self.fs().emit_abc(OpCode::LoadBool, dest, 1, 1, line);
        self.fs().emit_abc(OpCode::LoadBool, dest, 0, 0, line);
        self.free_opt(rfree);
        self.free_opt(lfree);
        Ok(())
    }

    fn compile_concat(&mut self, lhs: &Expr, rhs: &Expr, dest: u8, line: u32) -> Result<()> {
        // Flatten a right-leaning `..` chain into one CONCAT over a
        // contiguous register range, matching `§4.5`'s n-ary concat.
        let mut operands = Vec::new();
        flatten_concat(lhs, &mut operands);
        flatten_concat(rhs, &mut operands);
        let first = self.cur().fs.reg.alloc_temps(operands.len() as u16, line)?;
        for (i, e) in operands.iter().enumerate() {
            self.compile_expr(e, first + i as u8, line)?;
        }
        self.fs().emit_abc(OpCode::Concat, dest, first, first + operands.len() as u8 - 1, line);
        self.cur().fs.reg.free_temps(operands.len() as u16);
        Ok(())
    }

    fn compile_unary(&mut self, op: UnOp, operand: &Expr, dest: u8, line: u32) -> Result<()> {
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
            UnOp::BNot => OpCode::BNot,
        };
        let reg = self.compile_expr_to_any_reg(operand)?;
        self.fs().emit_abc(opcode, dest, reg, 0, line);
        self.cur().fs.reg.free_temp(reg);
        Ok(())
    }

    fn compile_closure_expr(&mut self, body: &FunctionBody, name: Option<String>, dest: u8, line: u32) -> Result<()> {
        let source = self.cur().fs.source.clone();
        self.push_function(source, body.line, name, body.is_vararg);
        self.compile_function_body(body)?;
        let proto = Rc::new(self.pop_function(body.last_line)?);
        let idx = self.fs().add_proto(proto, line)?;
        self.fs().emit_abx(OpCode::Closure, dest, idx, line);
        Ok(())
    }

    fn compile_table(&mut self, fields: &[TableField], dest: u8, line: u32) -> Result<()> {
        let narray = fields.iter().filter(|f| matches!(f, TableField::Positional(_))).count();
        let nhash = fields.len() - narray;
        self.fs().emit_abc(OpCode::NewTable, dest, narray.min(255) as u8, nhash.min(255) as u8, line);

        let mut positional = Vec::new();
        for field in fields {
            match field {
                TableField::Positional(e) => positional.push(e.clone()),
                TableField::Named(name, value) => {
                    let key = self.const_string(name.as_bytes(), line)?;
                    let (val_rk, val_free) = self.compile_to_rk(value, line)?;
                    self.fs().emit_abc(OpCode::SetTable, dest, rk_const(key), val_rk, line);
                    self.free_opt(val_free);
                }
                TableField::Indexed(key_expr, value) => {
                    let (key_rk, key_free) = self.compile_to_rk(key_expr, line)?;
                    let (val_rk, val_free) = self.compile_to_rk(value, line)?;
                    self.fs().emit_abc(OpCode::SetTable, dest, key_rk, val_rk, line);
                    self.free_opt(val_free);
                    self.free_opt(key_free);
                }
            }
        }

        if !positional.is_empty() {
            self.compile_exprlist(&positional, -1, line)?;
            let n = positional.len();
            self.fs().emit_abc(OpCode::SetList, dest, n.min(255) as u8, 0, line);
            self.cur().fs.reg.free_temps(n as u16);
        }
        Ok(())
    }

    /// Compiles `exprs`, allocating one register at a time as it goes
    /// (rather than reserving the whole span up front) so that a call
    /// expression earlier in the list is free to use higher temporaries
    /// for its own arguments without colliding with registers meant for
    /// later elements. Returns the register holding the first result.
    ///
    /// `want == -1` leaves the true count open (the last element, if a
    /// call or vararg, expands to however many results it produces at
    /// runtime); `want >= 0` pads with `nil` up to that many. Either way
    /// the caller should free [`reserved_count`]`(exprs.len(), want)`
    /// temporaries once done with the results.
    fn compile_exprlist(&mut self, exprs: &[Expr], want: i32, line: u32) -> Result<u8> {
        if exprs.is_empty() {
            let count = want.max(0) as u16;
            let first = self.cur().fs.reg.alloc_temps(count, line)?;
            if count > 0 {
                self.fs().emit_abc(OpCode::LoadNil, first, count as u8 - 1, 0, line);
            }
            return Ok(first);
        }
        let n = exprs.len();
        let mut first = None;
        for (i, e) in exprs.iter().enumerate() {
            let eline = expr_line(e);
            let is_last = i == n - 1;
            if is_last && expands_multi(e) {
                let reg = self.cur().fs.reg.alloc_temp(eline)?;
                first.get_or_insert(reg);
                let remainder = if want < 0 { -1 } else { (want - (n as i32 - 1)).max(0) };
                self.compile_open(e, reg, remainder, eline)?;
                if remainder > 1 {
                    self.cur().fs.reg.alloc_temps(remainder as u16 - 1, eline)?;
                }
            } else {
                let reg = self.cur().fs.reg.alloc_temp(eline)?;
                first.get_or_insert(reg);
                self.compile_expr(e, reg, eline)?;
            }
        }
        let first = first.expect("exprs is non-empty");
        if want > n as i32 && !expands_multi(&exprs[n - 1]) {
            let pad = want - n as i32;
            let padfirst = self.cur().fs.reg.alloc_temps(pad as u16, line)?;
            self.fs().emit_abc(OpCode::LoadNil, padfirst, pad as u8 - 1, 0, line);
        }
        Ok(first)
    }

    /// Compiles a call/method-call/vararg expression that may produce more
    /// than one value, requesting exactly `want` results (`-1` = all).
    fn compile_open(&mut self, expr: &Expr, dest: u8, want: i32, line: u32) -> Result<()> {
        match expr {
            Expr::Call { callee, args, .. } => self.compile_call(callee, args, dest, want, line),
            Expr::MethodCall { object, method, args, .. } => self.compile_method_call(object, method, args, dest, want, line),
            Expr::Vararg => {
                let b = if want < 0 { 0 } else { want as u8 + 1 };
                self.fs().emit_abc(OpCode::VarArg, dest, b, 0, line);
                Ok(())
            }
            _ => self.compile_expr(expr, dest, line),
        }
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr], dest: u8, want: i32, line: u32) -> Result<()> {
        self.compile_expr(callee, dest, line)?;
        self.emit_call_args_and_instr(args, dest, want, line)
    }

    fn compile_method_call(&mut self, object: &Expr, method: &str, args: &[Expr], dest: u8, want: i32, line: u32) -> Result<()> {
        let (obj_reg, obj_free) = self.compile_to_reg(object, line)?;
        let key = self.const_string(method.as_bytes(), line)?;
        self.fs().emit_abc(OpCode::SelfOp, dest, obj_reg, rk_const(key), line);
        self.free_opt(obj_free);
        // SelfOp already placed `self` at dest+1; the argument list starts
        // one slot further.
        self.emit_call_args_from(args, dest, 1, want, line)
    }

    fn emit_call_args_and_instr(&mut self, args: &[Expr], dest: u8, want: i32, line: u32) -> Result<()> {
        self.emit_call_args_from(args, dest, 0, want, line)
    }

    /// `extra` is `1` for a method call (the implicit `self` already
    /// occupies `dest+1`), `0` for a plain call.
    fn emit_call_args_from(&mut self, args: &[Expr], dest: u8, extra: u8, want: i32, line: u32) -> Result<()> {
        let argbase = dest + 1 + extra;
        if !args.is_empty() {
            let first = self.compile_exprlist(args, -1, line)?;
            debug_assert_eq!(first, argbase, "call arguments must be contiguous with the callee/self registers");
        }
        let open_args = args.last().is_some_and(expands_multi);
        let b = if open_args { 0 } else { extra + args.len() as u8 + 1 };
        let c = if want < 0 { 0 } else { want as u8 + 1 };
        self.fs().emit_abc(OpCode::Call, dest, b, c, line);
        if !args.is_empty() {
            self.cur().fs.reg.free_temps(args.len() as u16);
        }
        Ok(())
    }
}

fn is_comparison(op: BinOp) -> bool {
    matches!(op, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
}

fn arith_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Div => OpCode::Div,
        BinOp::IDiv => OpCode::IDiv,
        BinOp::Mod => OpCode::Mod,
        BinOp::Pow => OpCode::Pow,
        BinOp::BAnd => OpCode::BAnd,
        BinOp::BOr => OpCode::BOr,
        BinOp::BXor => OpCode::BXor,
        BinOp::Shl => OpCode::Shl,
        BinOp::Shr => OpCode::Shr,
        _ => unreachable!("arith_opcode called with a non-arithmetic operator"),
    }
}

/// How many registers [`Compiler::compile_exprlist`] leaves reserved for
/// `n` source expressions compiled against a `want` target count.
fn reserved_count(n: usize, want: i32) -> u16 {
    if want < 0 {
        n as u16
    } else {
        (n as i32).max(want) as u16
    }
}

fn expands_multi(e: &Expr) -> bool {
    matches!(e, Expr::Call { .. } | Expr::MethodCall { .. } | Expr::Vararg)
}

fn flatten_concat(e: &Expr, out: &mut Vec<Expr>) {
    match e {
        Expr::Binary { op: BinOp::Concat, lhs, rhs, .. } => {
            flatten_concat(lhs, out);
            flatten_concat(rhs, out);
        }
        other => out.push(other.clone()),
    }
}

fn expr_line(e: &Expr) -> u32 {
    match e {
        Expr::Index { line, .. }
        | Expr::Call { line, .. }
        | Expr::MethodCall { line, .. }
        | Expr::Table { line, .. }
        | Expr::Binary { line, .. }
        | Expr::Unary { line, .. } => *line,
        Expr::Function(body) => body.line,
        Expr::Paren(inner) => expr_line(inner),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> Rc<Proto> {
        let body = Parser::new(src.as_bytes(), "=test").unwrap().parse_chunk().unwrap();
        let mut heap = LuaHeap::new();
        compile_chunk(&mut heap, body, "=test").unwrap()
    }

    #[test]
    fn compiles_local_arithmetic() {
        let proto = compile("local x = 1 + 2 return x");
        assert!(!proto.instructions.is_empty());
        assert!(proto.constants.iter().any(|c| matches!(c, Value::Integer(1))));
    }

    #[test]
    fn compiles_if_else() {
        let proto = compile("local x = 1 if x then x = 2 else x = 3 end return x");
        assert!(proto.instructions.len() > 4);
    }

    #[test]
    fn compiles_while_loop() {
        let proto = compile("local i = 0 while i < 10 do i = i + 1 end return i");
        assert!(proto.instructions.iter().any(|&w| crate::opcode::Instruction(w).opcode() == OpCode::Jmp));
    }

    #[test]
    fn compiles_function_literal_with_upvalue() {
        let proto = compile("local x = 1 local f = function() return x end return f");
        assert_eq!(proto.protos.len(), 1);
        assert_eq!(proto.protos[0].upvalues.len(), 1);
        assert_eq!(proto.protos[0].upvalues[0].name, "x");
    }

    #[test]
    fn compiles_global_access_via_env() {
        let proto = compile("print(1)");
        assert_eq!(proto.upvalues.len(), 1);
        assert_eq!(proto.upvalues[0].name, "_ENV");
    }

    #[test]
    fn rejects_const_reassignment() {
        let body = Parser::new(b"local x <const> = 1 x = 2", "=test").unwrap().parse_chunk().unwrap();
        let mut heap = LuaHeap::new();
        assert!(compile_chunk(&mut heap, body, "=test").is_err());
    }
}
