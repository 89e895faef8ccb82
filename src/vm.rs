//! The register-based bytecode interpreter (`§4.5`-`§4.7`).
//!
//! Dispatch is a flat loop over the active thread's topmost [`CallFrame`]
//! rather than Rust recursion: a Lua-level call pushes a new frame onto
//! [`crate::value::Thread::frames`] and the loop keeps running, so a
//! coroutine can suspend mid-call without unwinding the Rust stack. Native
//! (Rust) code calling back into Lua — `pcall`, metamethod dispatch,
//! `table.sort`'s comparator, `string.gsub`'s replacement function — goes
//! through [`Vm::call_value`], which is the only place `native_depth` is
//! incremented; that counter is what makes `coroutine.yield` illegal across
//! a C boundary (`§4.7`).

use std::rc::Rc;

use crate::error::{LuaError, Result};
use crate::handle::{ClosureHandle, ThreadHandle, UpvalueHandle};
use crate::heap::LuaHeap;
use crate::metamethod::{self, MetaEvent};
use crate::opcode::{rk_index, rk_is_const, OpCode};
use crate::value::{CFunction, Closure, Proto, ThreadStatus, Value};

/// Execution limits, configurable the way the reference server's
/// `LuaLimits` config block is (`§2` of the expanded design notes).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Stack slots per thread.
    pub max_stack: usize,
    /// Rust-call nesting before `"stack overflow"` (native_depth, `§4.7`).
    pub max_native_depth: u32,
    /// Lua call-frame nesting before `"stack overflow"`.
    pub max_call_depth: usize,
    /// `__index`/`__newindex` chain length before `"'__index' chain too long"`.
    pub max_meta_chain: u32,
    /// Bytecode instructions executed between debug count-hook firings.
    pub hook_instruction_count: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_stack: 1_000_000,
            max_native_depth: 200,
            max_call_depth: 200,
            max_meta_chain: metamethod::MAX_META_CHAIN,
            hook_instruction_count: 0,
        }
    }
}

/// Either still-open (reads/writes a live stack slot) or closed (holds its
/// own value after the owning frame popped), `§3`.
#[derive(Debug, Clone)]
pub enum UpvalueCell {
    Open { thread: ThreadHandle, register: usize },
    Closed(Value),
}

/// One activation record. `base` is this frame's register 0 within the
/// owning thread's flat `stack`.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub closure: ClosureHandle,
    pub base: usize,
    pub pc: usize,
    pub varargs: Vec<Value>,
    /// `<close>` variables declared in this frame, in declaration order;
    /// closed in reverse when the frame exits (`§4.6`).
    pub pending_close: Vec<(u8, Value)>,
    pub is_tail_call: bool,
    /// Where the caller wants this frame's results written: an absolute
    /// stack index plus the `C` operand of the `CALL`/`TAILCALL` that
    /// invoked it (`0` meaning "all of them"). `None` for the frame
    /// `Vm::run_thread` was entered to run — its results propagate out of
    /// `run_thread` itself instead of being written into a register.
    pub return_to: Option<(usize, u8)>,
    /// Source line the line hook last fired for in this frame, so it fires
    /// once per distinct line rather than once per instruction (`§4.9`).
    pub hook_line: Option<u32>,
}

/// `debug.sethook`'s event mask: which of the call/return/line events
/// dispatch the installed hook. The instruction-count trigger is independent
/// of this mask (`§4.9`).
#[derive(Debug, Clone, Copy, Default)]
struct HookMask {
    call: bool,
    ret: bool,
    line: bool,
}

impl HookMask {
    fn from_str(s: &str) -> Self {
        HookMask { call: s.contains('c'), ret: s.contains('r'), line: s.contains('l') }
    }

    fn as_str(self) -> String {
        let mut s = String::new();
        if self.call {
            s.push('c');
        }
        if self.ret {
            s.push('r');
        }
        if self.line {
            s.push('l');
        }
        s
    }
}

#[derive(Debug, Clone)]
struct HookState {
    callback: Value,
    mask: HookMask,
    /// Instructions between count-hook firings; `0` disables it.
    count: u32,
}

/// What a native (Rust) function sees of the interpreter while it runs.
/// [`Vm`] implements this directly; stdlib functions receive `&mut dyn
/// ExecutionContext` so they don't need to know about `Vm`'s internals.
pub trait ExecutionContext {
    fn heap(&self) -> &LuaHeap;
    fn heap_mut(&mut self) -> &mut LuaHeap;
    fn limits(&self) -> &Limits;
    fn current_thread(&self) -> ThreadHandle;
    fn arg_count(&self) -> usize;
    fn arg(&self, index: usize) -> Value;
    fn args(&self) -> Vec<Value>;
    fn push_result(&mut self, value: Value);
    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Vec<Value>>;
    fn raise(&self, message: impl Into<String>) -> LuaError
    where
        Self: Sized,
    {
        LuaError::runtime(message)
    }

    /// `(source, line)` of the Lua frame that called into the currently
    /// running native function — level 1 for `error`/`assert`'s location
    /// prefix, `§7`.
    fn current_location(&self) -> Option<(String, u32)>;

    /// `(source, line)` of the `level`'th Lua frame counting from the
    /// caller of the native function outward (1-based, matching `error`'s
    /// `level` argument).
    fn location_at_level(&self, level: u32) -> Option<(String, u32)>;

    /// One line per active Lua frame, innermost first, `"source:line: in
    /// function"`-shaped, used by `debug.traceback`/unhandled-error reports.
    fn traceback(&self, message: Option<&str>) -> String;

    /// Creates a fresh suspended coroutine whose body is `closure`, for
    /// `coroutine.create`/`coroutine.wrap`.
    fn create_coroutine(&mut self, closure: ClosureHandle) -> ThreadHandle;

    /// `coroutine.resume`.
    fn resume_coroutine(&mut self, co: ThreadHandle, args: Vec<Value>) -> Result<Vec<Value>>;

    /// `coroutine.yield`.
    fn yield_coroutine(&mut self, values: Vec<Value>) -> Result<Vec<Value>>;

    fn thread_status(&self, co: ThreadHandle) -> Result<ThreadStatus>;

    /// True unless the currently running thread is the main thread (which
    /// can never yield).
    fn is_yieldable(&self) -> bool;

    /// `debug.getlocal`: the name and current value of the `index`'th local
    /// variable (1-based, in declaration order) active at `level`'th Lua
    /// frame's current `pc`, or `None` if there is no such frame/local.
    fn get_local(&self, level: u32, index: u32) -> Option<(String, Value)>;

    /// `debug.setlocal`: overwrite that local's register; returns its name
    /// on success.
    fn set_local(&mut self, level: u32, index: u32, value: Value) -> Option<String>;

    /// `debug.sethook(f, mask, count)`: installs a hook firing on any
    /// combination of call/return/line events named in `mask` (`'c'`/`'r'`/
    /// `'l'`), plus an independent instruction-count trigger (`count`, `0`
    /// to disable it).
    fn set_hook(&mut self, hook: Value, mask: &str, count: u32);

    /// `debug.sethook()` with no arguments: removes any installed hook.
    fn clear_hook(&mut self);

    /// `debug.gethook`: the currently installed hook, its mask string, and
    /// its count interval, if any.
    fn get_hook(&self) -> Option<(Value, String, u32)>;
}

struct NativeCall {
    args: Vec<Value>,
    results: Vec<Value>,
}

/// Owns the heap and drives bytecode execution for whichever thread is
/// current. A single `Vm` is shared by every coroutine spawned from it.
pub struct Vm {
    pub heap: LuaHeap,
    pub limits: Limits,
    current_thread: ThreadHandle,
    native_depth: u32,
    native_calls: Vec<NativeCall>,
    instructions_since_hook: u32,
    /// `debug.sethook`'s installed hook, if any (`§4.9`).
    debug_hook: Option<HookState>,
    /// Guards against a hook's own execution re-triggering itself.
    in_hook: bool,
}

impl Vm {
    pub fn new() -> Self {
        let heap = LuaHeap::new();
        let current_thread = heap.main_thread();
        Vm {
            heap,
            limits: Limits::default(),
            current_thread,
            native_depth: 0,
            native_calls: Vec::new(),
            instructions_since_hook: 0,
            debug_hook: None,
            in_hook: false,
        }
    }

    pub fn with_limits(limits: Limits) -> Self {
        let mut vm = Self::new();
        vm.limits = limits;
        vm
    }

    /// Run a closure to completion on the main thread, returning its results.
    pub fn call_closure(&mut self, closure: ClosureHandle, args: Vec<Value>) -> Result<Vec<Value>> {
        let thread = self.current_thread;
        let base_depth = self.heap.thread(thread)?.frames.len();
        self.push_frame(thread, closure, args, false, None)?;
        self.run_thread(thread, base_depth)
    }

    fn find_or_open_upvalue(&mut self, thread: ThreadHandle, register: usize) -> Result<UpvalueHandle> {
        let existing = {
            let t = self.heap.thread(thread)?;
            t.open_upvalues.iter().copied().find(|&h| {
                matches!(self.heap.upvalue(h), Ok(UpvalueCell::Open { register: r, .. }) if *r == register)
            })
        };
        if let Some(h) = existing {
            return Ok(h);
        }
        let h = self.heap.create_upvalue(UpvalueCell::Open { thread, register });
        self.heap.thread_mut(thread)?.open_upvalues.push(h);
        Ok(h)
    }

    /// Close every open upvalue at or above `from_register`, snapshotting
    /// its current stack value. Used by scope exit and the `JMP` "close
    /// upvalues" rider, `§4.5`.
    fn close_upvalues_from(&mut self, thread: ThreadHandle, from_register: usize) -> Result<()> {
        let to_close: Vec<UpvalueHandle> = {
            let t = self.heap.thread(thread)?;
            t.open_upvalues
                .iter()
                .copied()
                .filter(|&h| matches!(self.heap.upvalue(h), Ok(UpvalueCell::Open { register, .. }) if *register >= from_register))
                .collect()
        };
        for h in &to_close {
            let reg = match self.heap.upvalue(*h)? {
                UpvalueCell::Open { register, .. } => *register,
                UpvalueCell::Closed(_) => continue,
            };
            let value = self.heap.thread(thread)?.stack.get(reg).cloned().unwrap_or(Value::Nil);
            *self.heap.upvalue_mut(*h)? = UpvalueCell::Closed(value);
        }
        let t = self.heap.thread_mut(thread)?;
        t.open_upvalues.retain(|h| !to_close.contains(h));
        Ok(())
    }

    fn get_register(&self, thread: ThreadHandle, reg: u8) -> Result<Value> {
        let t = self.heap.thread(thread)?;
        let base = t.frames.last().ok_or_else(|| LuaError::Internal("no active frame".into()))?.base;
        Ok(t.stack.get(base + reg as usize).cloned().unwrap_or(Value::Nil))
    }

    fn set_register(&mut self, thread: ThreadHandle, reg: u8, value: Value) -> Result<()> {
        let base = self.heap.thread(thread)?.frames.last().ok_or_else(|| LuaError::Internal("no active frame".into()))?.base;
        let t = self.heap.thread_mut(thread)?;
        let idx = base + reg as usize;
        if idx >= t.stack.len() {
            t.stack.resize(idx + 1, Value::Nil);
        }
        t.stack[idx] = value;
        Ok(())
    }

    /// Resolves an `RK(x)` operand: register if the constant flag is clear,
    /// a constant-pool entry otherwise.
    fn rk(&self, thread: ThreadHandle, closure: &Closure, operand: u8) -> Result<Value> {
        if rk_is_const(operand) {
            closure
                .proto
                .constants
                .get(rk_index(operand) as usize)
                .cloned()
                .ok_or_else(|| LuaError::Internal("constant index out of range".into()))
        } else {
            self.get_register(thread, rk_index(operand))
        }
    }

    fn current_closure(&self, thread: ThreadHandle) -> Result<Closure> {
        let t = self.heap.thread(thread)?;
        let frame = t.frames.last().ok_or_else(|| LuaError::Internal("no active frame".into()))?;
        Ok(self.heap.closure(frame.closure)?.clone())
    }

    fn push_frame(
        &mut self,
        thread: ThreadHandle,
        closure_h: ClosureHandle,
        mut args: Vec<Value>,
        is_tail_call: bool,
        return_to: Option<(usize, u8)>,
    ) -> Result<()> {
        if self.heap.thread(thread)?.frames.len() >= self.limits.max_call_depth {
            return Err(LuaError::StackOverflow);
        }
        let closure = self.heap.closure(closure_h)?.clone();
        let nparams = closure.proto.num_params as usize;
        let varargs = if closure.proto.is_vararg && args.len() > nparams {
            args.split_off(nparams)
        } else {
            Vec::new()
        };
        args.resize(nparams, Value::Nil);

        let t = self.heap.thread_mut(thread)?;
        let base = t.stack.len();
        t.stack.extend(args);
        t.stack.resize(base + closure.proto.max_stack_size as usize, Value::Nil);
        t.frames.push(CallFrame {
            closure: closure_h,
            base,
            pc: 0,
            varargs,
            pending_close: Vec::new(),
            is_tail_call,
            return_to,
            hook_line: None,
        });
        Ok(())
    }

    /// Pop the current frame, running any pending `<close>` handlers in
    /// reverse declaration order first and aggregating their errors with
    /// whatever error (if any) is already propagating (`§4.6`).
    fn pop_frame(&mut self, thread: ThreadHandle, propagating: Option<LuaError>) -> Result<Option<LuaError>> {
        self.close_upvalues_from(thread, self.heap.thread(thread)?.frames.last().unwrap().base)?;
        let frame = self.heap.thread_mut(thread)?.frames.pop().ok_or_else(|| LuaError::Internal("pop_frame with no frame".into()))?;
        let mut err = propagating;
        for (_, value) in frame.pending_close.into_iter().rev() {
            if value.is_nil() || matches!(value, Value::Boolean(false)) {
                continue;
            }
            if let Some(handler) = metamethod::raw_event(&self.heap, &value, MetaEvent::Close) {
                let call_err = self.call_value(handler, vec![value, err_to_value(&err)]).err();
                if let Some(e) = call_err {
                    err = Some(e);
                }
            }
        }
        let t = self.heap.thread_mut(thread)?;
        t.stack.truncate(frame.base);
        Ok(err)
    }

    /// Run `thread` from its topmost frame until that frame (identified by
    /// having `return_to == None`) returns, or until an error propagates
    /// out. Every other `RETURN`/`TAILCALL` along the way writes its
    /// results into the caller's registers via `return_to` and the loop
    /// just continues — no Rust recursion for ordinary nested calls.
    ///
    /// `base_depth` is the thread's frame count at the call boundary this
    /// invocation is responsible for (before any frame this call itself
    /// pushed). On error, every frame above that depth is unwound via
    /// [`Vm::pop_frame`] — running its pending `<close>` handlers — before
    /// the error propagates to the caller, per `§4.6`'s "on error unwind"
    /// clause.
    fn run_thread(&mut self, thread: ThreadHandle, base_depth: usize) -> Result<Vec<Value>> {
        loop {
            match self.step(thread) {
                Ok(StepOutcome::Continue) => continue,
                Ok(StepOutcome::Returned(values)) => return Ok(values),
                Err(e) => return Err(self.unwind_to(thread, base_depth, e)?),
            }
        }
    }

    /// Pops frames down to `target_depth`, running each one's pending
    /// `<close>` handlers and aggregating any error they raise with the
    /// one already propagating (`pop_frame`'s usual aggregation rule).
    fn unwind_to(&mut self, thread: ThreadHandle, target_depth: usize, err: LuaError) -> Result<LuaError> {
        let mut current = err;
        while self.heap.thread(thread)?.frames.len() > target_depth {
            current = match self.pop_frame(thread, Some(current))? {
                Some(e) => e,
                None => return Err(LuaError::Internal("unwind lost its propagating error".into())),
            };
        }
        Ok(current)
    }

    /// Deliver `values` to wherever `return_to` says they belong, after a
    /// frame has already been popped by `pop_frame`. `None` means propagate
    /// out of `run_thread` instead.
    fn deliver_or_return(&mut self, thread: ThreadHandle, return_to: Option<(usize, u8)>, values: Vec<Value>) -> Result<StepOutcome> {
        match return_to {
            Some((abs_reg, c)) => {
                let want = if c == 0 { values.len() } else { c as usize - 1 };
                let t = self.heap.thread_mut(thread)?;
                if abs_reg + want > t.stack.len() {
                    t.stack.resize(abs_reg + want, Value::Nil);
                }
                for i in 0..want {
                    t.stack[abs_reg + i] = values.get(i).cloned().unwrap_or(Value::Nil);
                }
                Ok(StepOutcome::Continue)
            }
            None => Ok(StepOutcome::Returned(values)),
        }
    }

    /// Execute exactly one instruction of the current frame. A `CALL` of a
    /// Lua closure pushes a new frame and returns `Continue` so the loop
    /// picks it up next iteration; a `RETURN` pops the current frame.
    fn step(&mut self, thread: ThreadHandle) -> Result<StepOutcome> {
        self.instructions_since_hook += 1;
        self.fire_count_hook()?;

        let closure = self.current_closure(thread)?;
        let pc = self.heap.thread(thread)?.frames.last().unwrap().pc;
        self.fire_line_hook(thread, &closure, pc)?;
        let word = *closure.proto.instructions.get(pc).ok_or_else(|| LuaError::Internal("pc out of range".into()))?;
        let instr = crate::opcode::Instruction(word);
        self.heap.thread_mut(thread)?.frames.last_mut().unwrap().pc = pc + 1;

        use OpCode::*;
        match instr.opcode() {
            Move => {
                let v = self.get_register(thread, instr.b())?;
                self.set_register(thread, instr.a(), v)?;
            }
            LoadK => {
                let k = closure.proto.constants.get(instr.bx() as usize).cloned().unwrap_or(Value::Nil);
                self.set_register(thread, instr.a(), k)?;
            }
            LoadBool => {
                self.set_register(thread, instr.a(), Value::Boolean(instr.b() != 0))?;
                if instr.c() != 0 {
                    self.heap.thread_mut(thread)?.frames.last_mut().unwrap().pc += 1;
                }
            }
            LoadNil => {
                for i in instr.a()..=instr.a().saturating_add(instr.b()) {
                    self.set_register(thread, i, Value::Nil)?;
                }
            }
            GetUpval => {
                let uv = closure.upvalues[instr.b() as usize];
                let v = self.read_upvalue(uv)?;
                self.set_register(thread, instr.a(), v)?;
            }
            SetUpval => {
                let uv = closure.upvalues[instr.b() as usize];
                let v = self.get_register(thread, instr.a())?;
                self.write_upvalue(uv, v)?;
            }
            GetTabUp => {
                let uv = closure.upvalues[instr.b() as usize];
                let table = self.read_upvalue(uv)?;
                let key = self.rk(thread, &closure, instr.c())?;
                let v = self.index_value(&table, &key)?;
                self.set_register(thread, instr.a(), v)?;
            }
            SetTabUp => {
                let uv = closure.upvalues[instr.a() as usize];
                let table = self.read_upvalue(uv)?;
                let key = self.rk(thread, &closure, instr.b())?;
                let value = self.rk(thread, &closure, instr.c())?;
                self.newindex_value(&table, key, value)?;
            }
            GetTable => {
                let table = self.get_register(thread, instr.b())?;
                let key = self.rk(thread, &closure, instr.c())?;
                let v = self.index_value(&table, &key)?;
                self.set_register(thread, instr.a(), v)?;
            }
            SetTable => {
                let table = self.get_register(thread, instr.a())?;
                let key = self.rk(thread, &closure, instr.b())?;
                let value = self.rk(thread, &closure, instr.c())?;
                self.newindex_value(&table, key, value)?;
            }
            NewTable => {
                let t = self.heap.create_table_with_capacity(instr.b() as usize, instr.c() as usize);
                self.set_register(thread, instr.a(), Value::Table(t))?;
            }
            SelfOp => {
                let obj = self.get_register(thread, instr.b())?;
                let key = self.rk(thread, &closure, instr.c())?;
                let method = self.index_value(&obj, &key)?;
                self.set_register(thread, instr.a() + 1, obj)?;
                self.set_register(thread, instr.a(), method)?;
            }
            Add | Sub | Mul | Div | Mod | Pow | IDiv | BAnd | BOr | BXor | Shl | Shr => {
                let lhs = self.rk(thread, &closure, instr.b())?;
                let rhs = self.rk(thread, &closure, instr.c())?;
                let v = self.arith(instr.opcode(), lhs, rhs)?;
                self.set_register(thread, instr.a(), v)?;
            }
            Unm => {
                let v = self.get_register(thread, instr.b())?;
                let r = self.unary_minus(v)?;
                self.set_register(thread, instr.a(), r)?;
            }
            BNot => {
                let v = self.get_register(thread, instr.b())?;
                let r = self.bitwise_not(v)?;
                self.set_register(thread, instr.a(), r)?;
            }
            Not => {
                let v = self.get_register(thread, instr.b())?;
                self.set_register(thread, instr.a(), Value::Boolean(v.is_falsey()))?;
            }
            Len => {
                let v = self.get_register(thread, instr.b())?;
                let r = self.length_of(&v)?;
                self.set_register(thread, instr.a(), r)?;
            }
            Concat => {
                let mut acc = self.get_register(thread, instr.c())?;
                let mut i = instr.c();
                while i > instr.b() {
                    i -= 1;
                    let left = self.get_register(thread, i)?;
                    acc = self.concat(left, acc)?;
                }
                self.set_register(thread, instr.a(), acc)?;
            }
            Jmp => {
                if instr.a() > 0 {
                    let base = self.heap.thread(thread)?.frames.last().unwrap().base;
                    self.close_upvalues_from(thread, base + instr.a() as usize - 1)?;
                }
                let frame = self.heap.thread_mut(thread)?.frames.last_mut().unwrap();
                frame.pc = (frame.pc as i64 + instr.sbx() as i64) as usize;
            }
            Eq | Lt | Le => {
                let lhs = self.rk(thread, &closure, instr.b())?;
                let rhs = self.rk(thread, &closure, instr.c())?;
                let result = self.compare(instr.opcode(), &lhs, &rhs)?;
                if result != (instr.a() != 0) {
                    self.heap.thread_mut(thread)?.frames.last_mut().unwrap().pc += 1;
                }
            }
            Test => {
                let v = self.get_register(thread, instr.a())?;
                if v.is_truthy() != (instr.c() != 0) {
                    self.heap.thread_mut(thread)?.frames.last_mut().unwrap().pc += 1;
                }
            }
            TestSet => {
                let v = self.get_register(thread, instr.b())?;
                if v.is_truthy() == (instr.c() != 0) {
                    self.set_register(thread, instr.a(), v)?;
                } else {
                    self.heap.thread_mut(thread)?.frames.last_mut().unwrap().pc += 1;
                }
            }
            Call => {
                return self.do_call(thread, instr.a(), instr.b(), instr.c());
            }
            TailCall => {
                return self.do_tail_call(thread, instr.a(), instr.b());
            }
            Return => {
                let nret = instr.b();
                let values = if nret == 0 {
                    let base = self.heap.thread(thread)?.frames.last().unwrap().base;
                    let stack = &self.heap.thread(thread)?.stack;
                    stack[base + instr.a() as usize..].to_vec()
                } else {
                    let mut out = Vec::with_capacity(nret as usize - 1);
                    for i in 0..nret - 1 {
                        out.push(self.get_register(thread, instr.a() + i)?);
                    }
                    out
                };
                self.fire_return_hook()?;
                let return_to = self.heap.thread(thread)?.frames.last().unwrap().return_to;
                let err = self.pop_frame(thread, None)?;
                if let Some(e) = err {
                    return Err(e);
                }
                return self.deliver_or_return(thread, return_to, values);
            }
            ForPrep => {
                let a = instr.a();
                let init = as_number(&self.get_register(thread, a)?)?;
                let limit = as_number(&self.get_register(thread, a + 1)?)?;
                let step = as_number(&self.get_register(thread, a + 2)?)?;
                if step == 0.0 {
                    return Err(LuaError::runtime("'for' step is zero"));
                }
                // Pre-subtract the step so FORLOOP's add-then-test sees the
                // real initial value on its first check, `§4.5`. The jump
                // target is FORLOOP itself, so a range that's already
                // out-of-bounds never runs the body at all.
                self.set_register(thread, a, float_or_int(init - step))?;
                self.set_register(thread, a + 1, float_or_int(limit))?;
                self.set_register(thread, a + 2, float_or_int(step))?;
                let frame = self.heap.thread_mut(thread)?.frames.last_mut().unwrap();
                frame.pc = (frame.pc as i64 + instr.sbx() as i64) as usize;
            }
            ForLoop => {
                let a = instr.a();
                let step = as_number(&self.get_register(thread, a + 2)?)?;
                let mut i = as_number(&self.get_register(thread, a)?)?;
                let limit = as_number(&self.get_register(thread, a + 1)?)?;
                i += step;
                let continue_loop = if step > 0.0 { i <= limit } else { i >= limit };
                if continue_loop {
                    self.set_register(thread, a, float_or_int(i))?;
                    self.set_register(thread, a + 3, float_or_int(i))?;
                    let frame = self.heap.thread_mut(thread)?.frames.last_mut().unwrap();
                    frame.pc = (frame.pc as i64 + instr.sbx() as i64) as usize;
                }
            }
            TForCall => {
                let a = instr.a();
                let iter_fn = self.get_register(thread, a)?;
                let state = self.get_register(thread, a + 1)?;
                let control = self.get_register(thread, a + 2)?;
                let results = self.call_value(iter_fn, vec![state, control])?;
                for i in 0..instr.c() {
                    let v = results.get(i as usize).cloned().unwrap_or(Value::Nil);
                    self.set_register(thread, a + 3 + i, v)?;
                }
            }
            TForLoop => {
                // Mirrors TFORCALL's layout: a=iterator, a+1=state, a+2=control,
                // a+3..=loop variables. The first loop variable doubles as the
                // next iteration's control value, per `§4.5`.
                let a = instr.a();
                let first_var = self.get_register(thread, a + 3)?;
                if !first_var.is_nil() {
                    self.set_register(thread, a + 2, first_var)?;
                    let frame = self.heap.thread_mut(thread)?.frames.last_mut().unwrap();
                    frame.pc = (frame.pc as i64 + instr.sbx() as i64) as usize;
                }
            }
            SetList => {
                let a = instr.a();
                let n = instr.b();
                let table = self.get_register(thread, a)?;
                let Value::Table(th) = table else {
                    return Err(LuaError::Internal("SETLIST target not a table".into()));
                };
                let count = if n == 0 {
                    let base = self.heap.thread(thread)?.frames.last().unwrap().base;
                    self.heap.thread(thread)?.stack.len() - base - a as usize - 1
                } else {
                    n as usize
                };
                for i in 0..count {
                    let v = self.get_register(thread, a + 1 + i as u8)?;
                    let idx = instr.c() as i64 + i as i64 + 1;
                    self.heap.table_mut(th)?.set(Value::Integer(idx), v);
                }
            }
            Closure => {
                let proto = closure.proto.protos[instr.bx() as usize].clone();
                let upvalues = self.build_upvalues(thread, &closure, &proto)?;
                let ch = self.heap.create_closure(Closure { proto, upvalues });
                self.set_register(thread, instr.a(), Value::Closure(ch))?;
            }
            VarArg => {
                let frame = self.heap.thread(thread)?.frames.last().unwrap().clone();
                let want = instr.b();
                let n = if want == 0 { frame.varargs.len() as u8 } else { want - 1 };
                for i in 0..n {
                    let v = frame.varargs.get(i as usize).cloned().unwrap_or(Value::Nil);
                    self.set_register(thread, instr.a() + i, v)?;
                }
            }
            Close => {
                let base = self.heap.thread(thread)?.frames.last().unwrap().base;
                self.close_upvalues_from(thread, base + instr.a() as usize)?;
            }
            Tbc => {
                let v = self.get_register(thread, instr.a())?;
                if !v.is_nil() && !matches!(v, Value::Boolean(false)) && metamethod::raw_event(&self.heap, &v, MetaEvent::Close).is_none() {
                    return Err(LuaError::runtime("variable has a non-closable value"));
                }
                self.heap.thread_mut(thread)?.frames.last_mut().unwrap().pending_close.push((instr.a(), v));
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn read_upvalue(&self, h: UpvalueHandle) -> Result<Value> {
        match self.heap.upvalue(h)? {
            UpvalueCell::Closed(v) => Ok(v.clone()),
            UpvalueCell::Open { thread, register } => {
                Ok(self.heap.thread(*thread)?.stack.get(*register).cloned().unwrap_or(Value::Nil))
            }
        }
    }

    fn write_upvalue(&mut self, h: UpvalueHandle, value: Value) -> Result<()> {
        let (thread, register) = match self.heap.upvalue(h)? {
            UpvalueCell::Closed(_) => {
                *self.heap.upvalue_mut(h)? = UpvalueCell::Closed(value);
                return Ok(());
            }
            UpvalueCell::Open { thread, register } => (*thread, *register),
        };
        let t = self.heap.thread_mut(thread)?;
        if register >= t.stack.len() {
            t.stack.resize(register + 1, Value::Nil);
        }
        t.stack[register] = value;
        Ok(())
    }

    fn build_upvalues(&mut self, thread: ThreadHandle, parent: &Closure, proto: &Rc<Proto>) -> Result<Vec<UpvalueHandle>> {
        let base = self.heap.thread(thread)?.frames.last().unwrap().base;
        let mut out = Vec::with_capacity(proto.upvalues.len());
        for desc in &proto.upvalues {
            let h = if desc.in_stack {
                self.find_or_open_upvalue(thread, base + desc.index as usize)?
            } else {
                parent.upvalues[desc.index as usize]
            };
            out.push(h);
        }
        Ok(out)
    }

    fn index_value(&mut self, table: &Value, key: &Value) -> Result<Value> {
        let mut current = table.clone();
        for _ in 0..self.limits.max_meta_chain {
            if let Value::Table(th) = &current {
                let raw = self.heap.table(*th)?.get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match metamethod::raw_event(&self.heap, &current, MetaEvent::Index) {
                    Some(Value::Closure(_)) | Some(Value::CFunction(_)) => {
                        let handler = metamethod::raw_event(&self.heap, &current, MetaEvent::Index).unwrap();
                        let mut results = self.call_value(handler, vec![current.clone(), key.clone()])?;
                        return Ok(results.drain(..).next().unwrap_or(Value::Nil));
                    }
                    Some(next) => current = next,
                    None => return Ok(Value::Nil),
                }
            } else {
                match metamethod::raw_event(&self.heap, &current, MetaEvent::Index) {
                    Some(Value::Closure(_)) | Some(Value::CFunction(_)) => {
                        let handler = metamethod::raw_event(&self.heap, &current, MetaEvent::Index).unwrap();
                        let mut results = self.call_value(handler, vec![current.clone(), key.clone()])?;
                        return Ok(results.drain(..).next().unwrap_or(Value::Nil));
                    }
                    Some(next) => current = next,
                    None => {
                        return Err(LuaError::runtime(format!("attempt to index a {} value", current.type_name())));
                    }
                }
            }
        }
        Err(LuaError::runtime("'__index' chain too long; possible loop"))
    }

    fn newindex_value(&mut self, table: &Value, key: Value, value: Value) -> Result<()> {
        let mut current = table.clone();
        for _ in 0..self.limits.max_meta_chain {
            if let Value::Table(th) = &current {
                let has_raw = !self.heap.table(*th)?.get(&key).is_nil();
                if has_raw || metamethod::raw_event(&self.heap, &current, MetaEvent::NewIndex).is_none() {
                    if key.is_nil() {
                        return Err(LuaError::runtime("table index is nil"));
                    }
                    if matches!(&key, Value::Float(f) if f.is_nan()) {
                        return Err(LuaError::runtime("table index is NaN"));
                    }
                    self.heap.table_mut(*th)?.set(key, value);
                    return Ok(());
                }
                match metamethod::raw_event(&self.heap, &current, MetaEvent::NewIndex).unwrap() {
                    Value::Closure(_) | Value::CFunction(_) => {
                        let handler = metamethod::raw_event(&self.heap, &current, MetaEvent::NewIndex).unwrap();
                        self.call_value(handler, vec![current.clone(), key, value])?;
                        return Ok(());
                    }
                    next => current = next,
                }
            } else {
                match metamethod::raw_event(&self.heap, &current, MetaEvent::NewIndex) {
                    Some(Value::Closure(_)) | Some(Value::CFunction(_)) => {
                        let handler = metamethod::raw_event(&self.heap, &current, MetaEvent::NewIndex).unwrap();
                        self.call_value(handler, vec![current.clone(), key, value])?;
                        return Ok(());
                    }
                    Some(next) => current = next,
                    None => return Err(LuaError::runtime(format!("attempt to index a {} value", current.type_name()))),
                }
            }
        }
        Err(LuaError::runtime("'__newindex' chain too long; possible loop"))
    }

    fn arith(&mut self, op: OpCode, lhs: Value, rhs: Value) -> Result<Value> {
        if let (Value::Integer(a), Value::Integer(b)) = (&lhs, &rhs) {
            if let Some(v) = int_arith(op, *a, *b)? {
                return Ok(v);
            }
        }
        if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
            if let Some(v) = float_arith(op, a, b) {
                return Ok(v);
            }
        }
        let event = arith_event(op);
        match metamethod::binary_event(&self.heap, &lhs, &rhs, event) {
            Some(handler) => Ok(self.call_value(handler, vec![lhs, rhs])?.into_iter().next().unwrap_or(Value::Nil)),
            None => Err(LuaError::runtime(format!(
                "attempt to perform arithmetic on a {} value",
                if lhs.is_number() { rhs.type_name() } else { lhs.type_name() }
            ))),
        }
    }

    fn unary_minus(&mut self, v: Value) -> Result<Value> {
        match v {
            Value::Integer(i) => Ok(Value::Integer(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => match metamethod::raw_event(&self.heap, &other, MetaEvent::Unm) {
                Some(handler) => Ok(self.call_value(handler, vec![other.clone(), other])?.into_iter().next().unwrap_or(Value::Nil)),
                None => Err(LuaError::runtime(format!("attempt to perform arithmetic on a {} value", other.type_name()))),
            },
        }
    }

    fn bitwise_not(&mut self, v: Value) -> Result<Value> {
        match to_integer_for_bitwise(&v) {
            Some(i) => Ok(Value::Integer(!i)),
            None => match metamethod::raw_event(&self.heap, &v, MetaEvent::BNot) {
                Some(handler) => Ok(self.call_value(handler, vec![v.clone(), v])?.into_iter().next().unwrap_or(Value::Nil)),
                None => Err(LuaError::runtime(format!("attempt to perform bitwise operation on a {} value", v.type_name()))),
            },
        }
    }

    fn length_of(&mut self, v: &Value) -> Result<Value> {
        match v {
            Value::String(s) => Ok(Value::Integer(self.heap.get_string(*s)?.len() as i64)),
            Value::Table(t) => match metamethod::raw_event(&self.heap, v, MetaEvent::Len) {
                Some(handler) => Ok(self.call_value(handler, vec![v.clone()])?.into_iter().next().unwrap_or(Value::Nil)),
                None => Ok(Value::Integer(self.heap.table(*t)?.border())),
            },
            other => Err(LuaError::runtime(format!("attempt to get length of a {} value", other.type_name()))),
        }
    }

    fn concat(&mut self, lhs: Value, rhs: Value) -> Result<Value> {
        let as_bytes = |heap: &LuaHeap, v: &Value| -> Option<Vec<u8>> {
            match v {
                Value::String(s) => heap.get_string(*s).ok().map(|s| s.as_bytes().to_vec()),
                Value::Integer(i) => Some(i.to_string().into_bytes()),
                Value::Float(_) => Some(v.to_string().into_bytes()),
                _ => None,
            }
        };
        if let (Some(mut a), Some(b)) = (as_bytes(&self.heap, &lhs), as_bytes(&self.heap, &rhs)) {
            a.extend(b);
            return Ok(Value::String(self.heap.intern(&a)));
        }
        match metamethod::binary_event(&self.heap, &lhs, &rhs, MetaEvent::Concat) {
            Some(handler) => Ok(self.call_value(handler, vec![lhs, rhs])?.into_iter().next().unwrap_or(Value::Nil)),
            None => {
                let bad = if as_bytes(&self.heap, &lhs).is_none() { &lhs } else { &rhs };
                Err(LuaError::runtime(format!("attempt to concatenate a {} value", bad.type_name())))
            }
        }
    }

    fn compare(&mut self, op: OpCode, lhs: &Value, rhs: &Value) -> Result<bool> {
        match op {
            OpCode::Eq => self.values_equal(lhs, rhs),
            OpCode::Lt => self.values_less(lhs, rhs, false),
            OpCode::Le => self.values_less(lhs, rhs, true),
            _ => unreachable!(),
        }
    }

    fn values_equal(&mut self, lhs: &Value, rhs: &Value) -> Result<bool> {
        match (lhs, rhs) {
            (Value::Integer(a), Value::Integer(b)) => Ok(a == b),
            (Value::Float(a), Value::Float(b)) => Ok(a == b),
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                Ok(Value::float_to_integer_exact(*b) == Some(*a))
            }
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_)) => {
                if lhs == rhs {
                    return Ok(true);
                }
                match metamethod::binary_event(&self.heap, lhs, rhs, MetaEvent::Eq) {
                    Some(handler) => {
                        let r = self.call_value(handler, vec![lhs.clone(), rhs.clone()])?;
                        Ok(r.first().map(Value::is_truthy).unwrap_or(false))
                    }
                    None => Ok(false),
                }
            }
            _ => Ok(lhs == rhs),
        }
    }

    fn values_less(&mut self, lhs: &Value, rhs: &Value, or_equal: bool) -> Result<bool> {
        if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
            return Ok(if or_equal { a <= b } else { a < b });
        }
        if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
            let a = self.heap.get_string(*a)?.as_bytes().to_vec();
            let b = self.heap.get_string(*b)?.as_bytes().to_vec();
            return Ok(if or_equal { a <= b } else { a < b });
        }
        let event = if or_equal { MetaEvent::Le } else { MetaEvent::Lt };
        match metamethod::binary_event(&self.heap, lhs, rhs, event) {
            Some(handler) => {
                let r = self.call_value(handler, vec![lhs.clone(), rhs.clone()])?;
                Ok(r.first().map(Value::is_truthy).unwrap_or(false))
            }
            None => Err(LuaError::runtime(format!("attempt to compare two {} values", lhs.type_name()))),
        }
    }

    fn gather_call_args(&mut self, thread: ThreadHandle, a: u8, b: u8) -> Result<Vec<Value>> {
        let nargs = if b == 0 {
            let base = self.heap.thread(thread)?.frames.last().unwrap().base;
            self.heap.thread(thread)?.stack.len() - base - a as usize - 1
        } else {
            b as usize - 1
        };
        let mut args = Vec::with_capacity(nargs);
        for i in 0..nargs {
            args.push(self.get_register(thread, a + 1 + i as u8)?);
        }
        Ok(args)
    }

    fn do_call(&mut self, thread: ThreadHandle, a: u8, b: u8, c: u8) -> Result<StepOutcome> {
        let callee = self.get_register(thread, a)?;
        let args = self.gather_call_args(thread, a, b)?;
        let abs_reg = self.heap.thread(thread)?.frames.last().unwrap().base + a as usize;

        match self.resolve_callable(callee)? {
            ResolvedCall::Lua(ch) => {
                self.push_frame(thread, ch, args, false, Some((abs_reg, c)))?;
                self.fire_call_hook("call")?;
                Ok(StepOutcome::Continue)
            }
            ResolvedCall::Native(f) => {
                let results = self.invoke_native(thread, f, args)?;
                self.deliver_or_return(thread, Some((abs_reg, c)), results)
            }
        }
    }

    /// Proper (stack-constant) tail call: the current frame is popped
    /// *before* the callee is resolved and pushed, inheriting the popped
    /// frame's `return_to` so results still land where the original caller
    /// expects them, `§4.5`.
    fn do_tail_call(&mut self, thread: ThreadHandle, a: u8, b: u8) -> Result<StepOutcome> {
        let callee = self.get_register(thread, a)?;
        let args = self.gather_call_args(thread, a, b)?;
        self.fire_return_hook()?;
        let return_to = self.heap.thread(thread)?.frames.last().unwrap().return_to;
        let err = self.pop_frame(thread, None)?;
        if let Some(e) = err {
            return Err(e);
        }
        match self.resolve_callable(callee)? {
            ResolvedCall::Lua(ch) => {
                self.push_frame(thread, ch, args, true, return_to)?;
                self.fire_call_hook("tail call")?;
                Ok(StepOutcome::Continue)
            }
            ResolvedCall::Native(f) => {
                let results = self.invoke_native(thread, f, args)?;
                self.deliver_or_return(thread, return_to, results)
            }
        }
    }

    fn resolve_callable(&mut self, value: Value) -> Result<ResolvedCall> {
        match value {
            Value::Closure(h) => Ok(ResolvedCall::Lua(h)),
            Value::CFunction(f) => Ok(ResolvedCall::Native(f)),
            other => match metamethod::raw_event(&self.heap, &other, MetaEvent::Call) {
                Some(handler) => self.resolve_callable(handler),
                None => Err(LuaError::runtime(format!("attempt to call a {} value", other.type_name()))),
            },
        }
    }

    fn invoke_native(&mut self, thread: ThreadHandle, f: CFunction, args: Vec<Value>) -> Result<Vec<Value>> {
        if self.native_depth >= self.limits.max_native_depth {
            return Err(LuaError::StackOverflow);
        }
        let saved_current = self.current_thread;
        self.current_thread = thread;
        self.native_depth += 1;
        self.native_calls.push(NativeCall { args, results: Vec::new() });
        let outcome = f(self);
        let call = self.native_calls.pop().expect("native call stack underflow");
        self.native_depth -= 1;
        self.current_thread = saved_current;
        outcome?;
        Ok(call.results)
    }

    pub fn current_thread_handle(&self) -> ThreadHandle {
        self.current_thread
    }

    /// `coroutine.resume`: switches the interpreter's attention to `co` and
    /// runs it until it yields, returns, or errors. The resumer's native
    /// depth is parked on the outgoing thread and restored on the way back.
    pub fn resume(&mut self, co: ThreadHandle, args: Vec<Value>) -> Result<Vec<Value>> {
        {
            let t = self.heap.thread(co)?;
            match t.status {
                ThreadStatus::Suspended => {}
                ThreadStatus::Dead => return Err(LuaError::CoroutineState("cannot resume dead coroutine".into())),
                ThreadStatus::Running | ThreadStatus::Normal => {
                    return Err(LuaError::CoroutineState("cannot resume non-suspended coroutine".into()))
                }
            }
        }
        let resumer = self.current_thread;
        self.heap.thread_mut(resumer)?.status = ThreadStatus::Normal;
        self.heap.thread_mut(co)?.status = ThreadStatus::Running;
        self.heap.thread_mut(co)?.resumer = Some(resumer);

        let first_resume = self.heap.thread(co)?.frames.is_empty();
        if first_resume {
            let closure = match self.heap.thread(co)?.stack.first().cloned() {
                Some(Value::Closure(h)) => h,
                _ => return Err(LuaError::Internal("coroutine has no entry closure".into())),
            };
            self.heap.thread_mut(co)?.stack.clear();
            self.push_frame(co, closure, args, false, None)?;
        } else {
            self.heap.thread_mut(co)?.stack.extend(args);
        }

        let saved_current = self.current_thread;
        self.current_thread = co;
        let saved_native_depth = self.native_depth;
        self.native_depth = self.heap.thread(co)?.saved_native_depth;

        // Target depth 0: an error anywhere in the coroutine's call chain
        // unwinds its *entire* frame stack (running every pending `<close>`
        // handler along the way), not just frames pushed by this resume, so
        // the `frames.is_empty()` check below reliably observes `Dead`.
        let result = self.run_thread(co, 0);

        self.heap.thread_mut(co)?.saved_native_depth = self.native_depth;
        self.native_depth = saved_native_depth;
        self.current_thread = saved_current;
        self.heap.thread_mut(resumer)?.status = ThreadStatus::Running;
        if self.heap.thread(co)?.frames.is_empty() {
            self.heap.thread_mut(co)?.status = ThreadStatus::Dead;
        }
        result
    }

    /// `coroutine.yield`: only legal with no native call *other than this
    /// one* on the stack — `native_depth` already counts `yield`'s own
    /// `invoke_native` frame, so anything deeper than 1 means some other C
    /// function (e.g. `pcall`, a metamethod, `table.sort`'s comparator) is
    /// between here and the nearest Lua frame (`§4.7`'s C-call-boundary rule).
    pub fn yield_current(&mut self, values: Vec<Value>) -> Result<Vec<Value>> {
        if self.native_depth > 1 {
            return Err(LuaError::CoroutineState("attempt to yield across a C-call boundary".into()));
        }
        let co = self.current_thread;
        self.heap.thread_mut(co)?.status = ThreadStatus::Suspended;
        Ok(values)
    }

    /// `debug.sethook`'s count trigger: independent of `HookMask`, fires
    /// every `count` instructions regardless of mask contents.
    fn fire_count_hook(&mut self) -> Result<()> {
        if self.in_hook {
            return Ok(());
        }
        let Some(state) = self.debug_hook.clone() else { return Ok(()) };
        if state.count == 0 || self.instructions_since_hook < state.count {
            return Ok(());
        }
        self.instructions_since_hook = 0;
        self.in_hook = true;
        let event = Value::String(self.heap.intern_str("count"));
        let outcome = self.call_value(state.callback, vec![event]);
        self.in_hook = false;
        outcome?;
        Ok(())
    }

    /// Fires once per distinct source line reached in the current frame,
    /// mirroring the reference VM's line-hook behavior: a loop body that
    /// revisits the same line on every iteration fires again each time,
    /// since `pc` leaving and re-entering the line resets nothing but the
    /// per-frame `hook_line` marker does get overwritten on every other line
    /// visited in between.
    fn fire_line_hook(&mut self, thread: ThreadHandle, closure: &Closure, pc: usize) -> Result<()> {
        if self.in_hook {
            return Ok(());
        }
        let Some(state) = self.debug_hook.clone() else { return Ok(()) };
        if !state.mask.line {
            return Ok(());
        }
        let line = closure.proto.line_at(pc);
        let last = self.heap.thread(thread)?.frames.last().unwrap().hook_line;
        if last == Some(line) {
            return Ok(());
        }
        self.heap.thread_mut(thread)?.frames.last_mut().unwrap().hook_line = Some(line);
        self.in_hook = true;
        let event = Value::String(self.heap.intern_str("line"));
        let outcome = self.call_value(state.callback, vec![event, Value::Integer(line as i64)]);
        self.in_hook = false;
        outcome?;
        Ok(())
    }

    /// Fired right after a Lua frame is pushed for a `CALL`/`TAILCALL`.
    /// Native (`CFunction`) calls don't fire it — there is no Lua frame to
    /// report a location for.
    fn fire_call_hook(&mut self, event_name: &str) -> Result<()> {
        if self.in_hook {
            return Ok(());
        }
        let Some(state) = self.debug_hook.clone() else { return Ok(()) };
        if !state.mask.call {
            return Ok(());
        }
        self.in_hook = true;
        let event = Value::String(self.heap.intern_str(event_name));
        let outcome = self.call_value(state.callback, vec![event]);
        self.in_hook = false;
        outcome?;
        Ok(())
    }

    /// Fired just before a frame is popped by `RETURN` or replaced by a
    /// tail call, while its closure/locals are still live to inspect.
    fn fire_return_hook(&mut self) -> Result<()> {
        if self.in_hook {
            return Ok(());
        }
        let Some(state) = self.debug_hook.clone() else { return Ok(()) };
        if !state.mask.ret {
            return Ok(());
        }
        self.in_hook = true;
        let event = Value::String(self.heap.intern_str("return"));
        let outcome = self.call_value(state.callback, vec![event]);
        self.in_hook = false;
        outcome?;
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

enum ResolvedCall {
    Lua(ClosureHandle),
    Native(CFunction),
}

enum StepOutcome {
    Continue,
    Returned(Vec<Value>),
}

impl ExecutionContext for Vm {
    fn heap(&self) -> &LuaHeap {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut LuaHeap {
        &mut self.heap
    }

    fn limits(&self) -> &Limits {
        &self.limits
    }

    fn current_thread(&self) -> ThreadHandle {
        self.current_thread
    }

    fn arg_count(&self) -> usize {
        self.native_calls.last().map(|c| c.args.len()).unwrap_or(0)
    }

    fn arg(&self, index: usize) -> Value {
        self.native_calls.last().and_then(|c| c.args.get(index)).cloned().unwrap_or(Value::Nil)
    }

    fn args(&self) -> Vec<Value> {
        self.native_calls.last().map(|c| c.args.clone()).unwrap_or_default()
    }

    fn push_result(&mut self, value: Value) {
        if let Some(call) = self.native_calls.last_mut() {
            call.results.push(value);
        }
    }

    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Vec<Value>> {
        match self.resolve_callable(callee)? {
            ResolvedCall::Lua(ch) => {
                let thread = self.current_thread;
                let base_depth = self.heap.thread(thread)?.frames.len();
                self.push_frame(thread, ch, args, false, None)?;
                self.run_thread(thread, base_depth)
            }
            ResolvedCall::Native(f) => {
                let thread = self.current_thread;
                self.invoke_native(thread, f, args)
            }
        }
    }

    fn current_location(&self) -> Option<(String, u32)> {
        self.location_at_level(1)
    }

    fn location_at_level(&self, level: u32) -> Option<(String, u32)> {
        if level == 0 {
            return None;
        }
        let t = self.heap.thread(self.current_thread).ok()?;
        let frame = t.frames.iter().rev().nth(level as usize - 1)?;
        let closure = self.heap.closure(frame.closure).ok()?;
        let pc = frame.pc.saturating_sub(1);
        Some((closure.proto.source.clone(), closure.proto.line_at(pc)))
    }

    fn traceback(&self, message: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(m) = message {
            out.push_str(m);
            out.push('\n');
        }
        out.push_str("stack traceback:");
        if let Ok(t) = self.heap.thread(self.current_thread) {
            for frame in t.frames.iter().rev() {
                if let Ok(closure) = self.heap.closure(frame.closure) {
                    let pc = frame.pc.saturating_sub(1);
                    let line = closure.proto.line_at(pc);
                    let name = closure.proto.name.as_deref().unwrap_or("?");
                    out.push_str(&format!("\n\t{}:{}: in function '{}'", closure.proto.source, line, name));
                }
            }
        }
        out
    }

    fn create_coroutine(&mut self, closure: ClosureHandle) -> ThreadHandle {
        let co = self.heap.create_thread();
        self.heap.thread_mut(co).expect("freshly created thread").stack.push(Value::Closure(closure));
        co
    }

    fn resume_coroutine(&mut self, co: ThreadHandle, args: Vec<Value>) -> Result<Vec<Value>> {
        self.resume(co, args)
    }

    fn yield_coroutine(&mut self, values: Vec<Value>) -> Result<Vec<Value>> {
        self.yield_current(values)
    }

    fn thread_status(&self, co: ThreadHandle) -> Result<ThreadStatus> {
        Ok(self.heap.thread(co)?.status)
    }

    fn is_yieldable(&self) -> bool {
        self.current_thread != self.heap.main_thread()
    }

    fn get_local(&self, level: u32, index: u32) -> Option<(String, Value)> {
        if level == 0 || index == 0 {
            return None;
        }
        let t = self.heap.thread(self.current_thread).ok()?;
        let frame = t.frames.iter().rev().nth(level as usize - 1)?;
        let closure = self.heap.closure(frame.closure).ok()?;
        let local = closure
            .proto
            .locals
            .iter()
            .filter(|l| frame.pc as u32 >= l.start_pc && (frame.pc as u32) < l.end_pc)
            .nth(index as usize - 1)?;
        let reg = frame.base + local.register as usize;
        let value = t.stack.get(reg).cloned().unwrap_or(Value::Nil);
        Some((local.name.clone(), value))
    }

    fn set_local(&mut self, level: u32, index: u32, value: Value) -> Option<String> {
        if level == 0 || index == 0 {
            return None;
        }
        let t = self.heap.thread(self.current_thread).ok()?;
        let frame = t.frames.iter().rev().nth(level as usize - 1)?.clone();
        let closure = self.heap.closure(frame.closure).ok()?;
        let local = closure
            .proto
            .locals
            .iter()
            .filter(|l| frame.pc as u32 >= l.start_pc && (frame.pc as u32) < l.end_pc)
            .nth(index as usize - 1)
            .cloned()?;
        let reg = frame.base + local.register as usize;
        let t = self.heap.thread_mut(self.current_thread).ok()?;
        if let Some(slot) = t.stack.get_mut(reg) {
            *slot = value;
        }
        Some(local.name)
    }

    fn set_hook(&mut self, hook: Value, mask: &str, count: u32) {
        self.instructions_since_hook = 0;
        self.debug_hook = Some(HookState { callback: hook, mask: HookMask::from_str(mask), count });
    }

    fn clear_hook(&mut self) {
        self.debug_hook = None;
    }

    fn get_hook(&self) -> Option<(Value, String, u32)> {
        self.debug_hook.clone().map(|s| (s.callback, s.mask.as_str(), s.count))
    }
}

/// `__close`'s second argument: the error value that triggered an
/// abnormal frame exit, or `nil` for a plain `return`. A non-`error(value)`
/// Rust-side fault (e.g. a type error raised as a formatted string) has no
/// original Lua value to hand back, so it surfaces as `nil` here; the
/// message itself is still delivered to whatever ultimately catches the
/// propagating [`LuaError`].
fn err_to_value(err: &Option<LuaError>) -> Value {
    match err {
        Some(LuaError::Value(v)) => v.clone(),
        _ => Value::Nil,
    }
}

fn as_number(v: &Value) -> Result<f64> {
    v.as_float().ok_or_else(|| LuaError::runtime("'for' initial value must be a number"))
}

fn float_or_int(f: f64) -> Value {
    match Value::float_to_integer_exact(f) {
        Some(i) if f.fract() == 0.0 => Value::Integer(i),
        _ => Value::Float(f),
    }
}

fn to_integer_for_bitwise(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(*i),
        Value::Float(f) => Value::float_to_integer_exact(*f),
        _ => None,
    }
}

fn arith_event(op: OpCode) -> MetaEvent {
    use OpCode::*;
    match op {
        Add => MetaEvent::Add,
        Sub => MetaEvent::Sub,
        Mul => MetaEvent::Mul,
        Div => MetaEvent::Div,
        Mod => MetaEvent::Mod,
        Pow => MetaEvent::Pow,
        IDiv => MetaEvent::IDiv,
        BAnd => MetaEvent::BAnd,
        BOr => MetaEvent::BOr,
        BXor => MetaEvent::BXor,
        Shl => MetaEvent::Shl,
        Shr => MetaEvent::Shr,
        _ => unreachable!(),
    }
}

/// Integer-domain arithmetic. Returns `None` when the operator isn't
/// integer-valid for these operands (e.g. float division always goes
/// through `float_arith`, `§3`'s "/ always produces a float" rule).
fn int_arith(op: OpCode, a: i64, b: i64) -> Result<Option<Value>> {
    use OpCode::*;
    Ok(Some(match op {
        Add => Value::Integer(a.wrapping_add(b)),
        Sub => Value::Integer(a.wrapping_sub(b)),
        Mul => Value::Integer(a.wrapping_mul(b)),
        Mod => {
            if b == 0 {
                return Err(LuaError::domain("attempt to perform 'n%%0'"));
            }
            // Lua's `%` is floor-modulo: result has the same sign as `b`.
            let r = a.wrapping_rem(b);
            Value::Integer(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
        }
        IDiv => {
            if b == 0 {
                return Err(LuaError::domain("attempt to perform 'n//0'"));
            }
            // Lua's `//` floors toward negative infinity regardless of sign.
            let q = a.wrapping_div(b);
            let r = a.wrapping_rem(b);
            Value::Integer(if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q })
        }
        BAnd => Value::Integer(a & b),
        BOr => Value::Integer(a | b),
        BXor => Value::Integer(a ^ b),
        Shl => Value::Integer(shift_left(a, b)),
        Shr => Value::Integer(shift_left(a, -b)),
        Div | Pow => return Ok(None),
        _ => unreachable!(),
    }))
}

fn shift_left(a: i64, by: i64) -> i64 {
    if by <= -64 || by >= 64 {
        0
    } else if by >= 0 {
        ((a as u64) << by) as i64
    } else {
        ((a as u64) >> (-by)) as i64
    }
}

fn float_arith(op: OpCode, a: f64, b: f64) -> Option<Value> {
    use OpCode::*;
    Some(match op {
        Add => Value::Float(a + b),
        Sub => Value::Float(a - b),
        Mul => Value::Float(a * b),
        Div => Value::Float(a / b),
        Pow => Value::Float(a.powf(b)),
        Mod => Value::Float(a - (a / b).floor() * b),
        IDiv => Value::Float((a / b).floor()),
        BAnd | BOr | BXor | Shl | Shr => return None,
        _ => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trivial_proto(instructions: Vec<u32>, constants: Vec<Value>, max_stack: u8) -> Rc<Proto> {
        Rc::new(Proto {
            source: "=test".into(),
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: max_stack,
            instructions,
            constants,
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            line_events: Vec::new(),
            name: None,
        })
    }

    #[test]
    fn runs_load_and_return() {
        use crate::opcode::Instruction as I;
        let proto = trivial_proto(
            vec![I::abx(OpCode::LoadK, 0, 0).0, I::abc(OpCode::Return, 0, 2, 0).0],
            vec![Value::Integer(7)],
            1,
        );
        let mut vm = Vm::new();
        let ch = vm.heap.create_closure(Closure { proto, upvalues: Vec::new() });
        let results = vm.call_closure(ch, vec![]).unwrap();
        assert_eq!(results, vec![Value::Integer(7)]);
    }

    #[test]
    fn integer_add_stays_integer() {
        use crate::opcode::Instruction as I;
        let proto = trivial_proto(
            vec![
                I::abx(OpCode::LoadK, 0, 0).0,
                I::abx(OpCode::LoadK, 1, 1).0,
                I::abc(OpCode::Add, 2, 0, 1).0,
                I::abc(OpCode::Return, 2, 2, 0).0,
            ],
            vec![Value::Integer(3), Value::Integer(4)],
            3,
        );
        let mut vm = Vm::new();
        let ch = vm.heap.create_closure(Closure { proto, upvalues: Vec::new() });
        let results = vm.call_closure(ch, vec![]).unwrap();
        assert_eq!(results, vec![Value::Integer(7)]);
    }

    #[test]
    fn for_loop_counts_up() {
        use crate::opcode::Instruction as I;
        // for i=1,3 do end; return i-equivalent isn't tracked here, just
        // exercise FORPREP/FORLOOP without trapping.
        let proto = trivial_proto(
            vec![
                I::abx(OpCode::LoadK, 0, 0).0, // init = 1
                I::abx(OpCode::LoadK, 1, 1).0, // limit = 3
                I::abx(OpCode::LoadK, 2, 2).0, // step = 1
                I::asbx(OpCode::ForPrep, 0, 1).0,
                I::abc(OpCode::Return, 0, 1, 0).0, // placeholder body (no-op)
                I::asbx(OpCode::ForLoop, 0, -1).0,
                I::abc(OpCode::Return, 0, 1, 0).0,
            ],
            vec![Value::Integer(1), Value::Integer(3), Value::Integer(1)],
            4,
        );
        let mut vm = Vm::new();
        let ch = vm.heap.create_closure(Closure { proto, upvalues: Vec::new() });
        let results = vm.call_closure(ch, vec![]).unwrap();
        assert!(results.is_empty());
    }
}
