//! The bytecode dispatch loop: one flat frame stack per thread, walked
//! by a single `while` loop so that `coroutine.yield` and `pcall` can
//! unwind to an arbitrary depth without relying on Rust-native
//! recursion or OS fibers.

use crate::compiler::opcode::OpCode;
use crate::error::{LuaError, LuaResult};
use crate::value::closure::{ClosureKind, Intrinsic, UpvalueCell, UpvalueSource};
use crate::value::{float_to_integer_exact, Closure, LuaTable, LuaValue};
use crate::vm::close;
use crate::vm::metamethod::{binop_metamethod, get_metamethod, MetaEvent};
use crate::vm::state::VmState;
use crate::vm::thread::{Frame, FrameKind, LuaThread, PendingClose};
use std::cell::RefCell;
use std::rc::Rc;

/// Lua 5.4 integer modulo: result has the same sign as the divisor.
pub fn lua_imod(a: i64, b: i64) -> i64 {
    if b == -1 {
        return 0;
    }
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r + b
    } else {
        r
    }
}

/// Lua 5.4 integer floor division.
pub fn lua_ifloordiv(a: i64, b: i64) -> i64 {
    if b == -1 {
        return a.wrapping_neg();
    }
    let q = a.wrapping_div(b);
    if (a % b != 0) && ((a ^ b) < 0) {
        q - 1
    } else {
        q
    }
}

/// Float modulo with Lua's divisor-sign rule (`a - floor(a/b)*b`).
pub fn lua_fmod(a: f64, b: f64) -> f64 {
    if b.is_infinite() && a.is_finite() {
        return if (a >= 0.0) == (b > 0.0) { a } else { b };
    }
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

pub enum LoopOutcome {
    Returned(Vec<LuaValue>),
    Yielded(Vec<LuaValue>),
}

/// Runs `thread` until its frame stack empties (return) or it yields.
/// Assumes the thread's frame stack is non-empty on entry.
pub fn run_loop(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>) -> LuaResult<LoopOutcome> {
    loop {
        let depth = thread.borrow().frames.len();
        if depth == 0 {
            let results = std::mem::take(&mut thread.borrow_mut().resume_values);
            return Ok(LoopOutcome::Returned(results));
        }
        if depth > state.config.max_call_depth {
            return Err(LuaError::StackOverflow);
        }
        match step(state, thread) {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::Returned(vals)) => return Ok(LoopOutcome::Returned(vals)),
            Ok(StepOutcome::Yielded(vals)) => return Ok(LoopOutcome::Yielded(vals)),
            Err(e) => {
                if matches!(e, LuaError::Runtime) {
                    state.last_traceback = Some(crate::vm::debug::capture_traceback(thread));
                }
                match unwind_to_protected(state, thread, e.clone())? {
                    Some(results) => {
                        // A `pcall`/`xpcall` boundary absorbed the error;
                        // its results are already placed, keep looping.
                        let _ = results;
                    }
                    None => return Err(e),
                }
            }
        }
    }
}

enum StepOutcome {
    Continue,
    Returned(Vec<LuaValue>),
    Yielded(Vec<LuaValue>),
}

/// On error, unwinds frames (running `<close>` handlers) up to the
/// nearest `FrameKind::Protected` marker. Returns `Some(())` if a
/// protected frame absorbed the error (its `pcall` results are pushed
/// in its caller's registers), `None` if the error reached the bottom
/// of the stack unhandled.
fn unwind_to_protected(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    err: LuaError,
) -> LuaResult<Option<()>> {
    let err_value = state.take_error();
    loop {
        let frame = {
            let mut t = thread.borrow_mut();
            t.frames.pop()
        };
        let frame = match frame {
            Some(f) => f,
            None => {
                state.set_error(err_value);
                return Ok(None);
            }
        };
        close::close_frame_on_error(state, thread, &frame, &err_value)?;
        if let FrameKind::Protected { handler } = &frame.kind {
            let (ok_value, message) = match handler {
                Some(h) => {
                    let h = h.clone();
                    match call_value(state, thread, &h, vec![err_value.clone()]) {
                        Ok(mut r) => (false, r.pop().unwrap_or(LuaValue::Nil)),
                        Err(_) => (false, state.take_error()),
                    }
                }
                None => (false, err_value.clone()),
            };
            let mut results = vec![LuaValue::Boolean(ok_value)];
            results.push(message);
            place_results(thread, frame.return_base, frame.want_results, results);
            return Ok(Some(()));
        }
        let _ = err;
    }
}

fn place_results(thread: &Rc<RefCell<LuaThread>>, base: usize, want: Option<u16>, mut results: Vec<LuaValue>) {
    let n = match want {
        Some(n) => n as usize,
        None => results.len(),
    };
    results.resize(n, LuaValue::Nil);
    let mut t = thread.borrow_mut();
    t.ensure_register_capacity(base + n);
    for (i, v) in results.into_iter().enumerate() {
        t.registers[base + i] = v;
    }
}

fn step(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>) -> LuaResult<StepOutcome> {
    let (op, a, b, c, base, pc) = {
        let t = thread.borrow();
        let frame = t.frames.last().unwrap();
        let proto = frame.closure.proto().expect("bytecode frame holds a Lua closure");
        if frame.pc >= proto.bytecode.len() {
            drop(t);
            return finish_return(state, thread, Vec::new());
        }
        let ins = proto.bytecode[frame.pc];
        (ins.op, ins.a, ins.b, ins.c, frame.base, frame.pc)
    };
    fire_pre_instruction_hooks(state, thread, pc)?;
    thread.borrow_mut().frames.last_mut().unwrap().pc = pc + 1;

    macro_rules! reg {
        ($i:expr) => {
            get_reg(thread, base, $i)
        };
    }
    macro_rules! set_reg {
        ($i:expr, $v:expr) => {
            set_reg(thread, base, $i, $v)
        };
    }
    macro_rules! k {
        ($i:expr) => {
            current_proto(thread).constants[$i as usize].clone()
        };
    }

    match op {
        OpCode::LoadK => set_reg!(a, k!(b)),
        OpCode::LoadNil => {
            for i in a..=(a + b) {
                set_reg!(i, LuaValue::Nil);
            }
        }
        OpCode::LoadBool => {
            set_reg!(a, LuaValue::Boolean(b != 0));
            if c != 0 {
                thread.borrow_mut().frames.last_mut().unwrap().pc += 1;
            }
        }
        OpCode::LoadInt => set_reg!(a, LuaValue::Integer(b as i64)),
        OpCode::Move => set_reg!(a, reg!(b)),
        OpCode::GetUpval => set_reg!(a, get_upvalue(thread, b as usize)),
        OpCode::SetUpval => set_upvalue(thread, b as usize, reg!(a)),
        OpCode::GetTabUp => {
            let up = get_upvalue(thread, b as usize);
            let key = k!(c);
            let v = index_value(state, thread, &up, &key)?;
            set_reg!(a, v);
        }
        OpCode::SetTabUp => {
            let up = get_upvalue(thread, a as usize);
            let key = k!(b);
            let v = reg!(c);
            newindex_value(state, thread, &up, key, v)?;
        }
        OpCode::GetTable => {
            let obj = reg!(b);
            let key = reg!(c);
            let v = index_value(state, thread, &obj, &key)?;
            set_reg!(a, v);
        }
        OpCode::GetField => {
            let obj = reg!(b);
            let key = k!(c);
            let v = index_value(state, thread, &obj, &key)?;
            set_reg!(a, v);
        }
        OpCode::SetTable => {
            let obj = reg!(a);
            let key = reg!(b);
            let v = reg!(c);
            newindex_value(state, thread, &obj, key, v)?;
        }
        OpCode::SetField => {
            let obj = reg!(a);
            let key = k!(b);
            let v = reg!(c);
            newindex_value(state, thread, &obj, key, v)?;
        }
        OpCode::NewTable => {
            let _ = (b, c);
            set_reg!(a, LuaValue::Table(Rc::new(RefCell::new(LuaTable::new()))));
        }
        OpCode::SelfOp => {
            let obj = reg!(b);
            let key = k!(c);
            let method = index_value(state, thread, &obj, &key)?;
            set_reg!(a + 1, obj);
            set_reg!(a, method);
        }
        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow
        | OpCode::IDiv | OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr => {
            let lhs = reg!(b);
            let rhs = reg!(c);
            let v = arith_op(state, thread, op, &lhs, &rhs)?;
            set_reg!(a, v);
        }
        OpCode::Unm => {
            let v = reg!(b);
            let r = match &v {
                LuaValue::Integer(i) => LuaValue::Integer(i.wrapping_neg()),
                LuaValue::Number(f) => LuaValue::Number(-f),
                _ => match coerce_number(&v) {
                    Some(LuaValue::Integer(i)) => LuaValue::Integer(i.wrapping_neg()),
                    Some(LuaValue::Number(f)) => LuaValue::Number(-f),
                    _ => call_unary_meta(state, thread, MetaEvent::Unm, &v)?,
                },
            };
            set_reg!(a, r);
        }
        OpCode::BNot => {
            let v = reg!(b);
            let r = match to_integer_for_bitop(&v) {
                Some(i) => LuaValue::Integer(!i),
                None => call_unary_meta(state, thread, MetaEvent::BNot, &v)?,
            };
            set_reg!(a, r);
        }
        OpCode::Not => {
            let v = reg!(b);
            set_reg!(a, LuaValue::Boolean(!v.is_truthy()));
        }
        OpCode::Len => {
            let v = reg!(b);
            let r = match &v {
                LuaValue::Str(s) => LuaValue::Integer(s.len() as i64),
                LuaValue::Table(t) => {
                    if let Some(m) = get_metamethod(&v, MetaEvent::Len, state) {
                        call_value(state, thread, &m, vec![v.clone()])?
                            .into_iter()
                            .next()
                            .unwrap_or(LuaValue::Nil)
                    } else {
                        LuaValue::Integer(t.borrow().len())
                    }
                }
                _ => call_unary_meta(state, thread, MetaEvent::Len, &v)?,
            };
            set_reg!(a, r);
        }
        OpCode::Concat => {
            let n = b as usize;
            let mut parts = Vec::with_capacity(n);
            for i in 0..n {
                parts.push(reg!(a + i as i32));
            }
            let v = concat_values(state, thread, parts)?;
            set_reg!(a, v);
        }
        OpCode::Jmp => {
            thread.borrow_mut().frames.last_mut().unwrap().pc =
                (pc as i32 + a + 1) as usize;
        }
        OpCode::Eq => {
            let lhs = reg!(b);
            let rhs = reg!(c);
            let eq = values_equal(state, thread, &lhs, &rhs)?;
            set_reg!(a, LuaValue::Boolean(eq));
        }
        OpCode::Lt => {
            let lhs = reg!(b);
            let rhs = reg!(c);
            let lt = values_less(state, thread, &lhs, &rhs, false)?;
            set_reg!(a, LuaValue::Boolean(lt));
        }
        OpCode::Le => {
            let lhs = reg!(b);
            let rhs = reg!(c);
            let le = values_less(state, thread, &lhs, &rhs, true)?;
            set_reg!(a, LuaValue::Boolean(le));
        }
        OpCode::Test => {
            let v = reg!(a);
            if v.is_truthy() == (c != 0) {
                thread.borrow_mut().frames.last_mut().unwrap().pc += 1;
            }
        }
        OpCode::TestSet => {
            let v = reg!(b);
            if v.is_truthy() == (c != 0) {
                thread.borrow_mut().frames.last_mut().unwrap().pc += 1;
            } else {
                set_reg!(a, v);
            }
        }
        OpCode::Call => {
            return do_call(state, thread, base, a, b, c, false);
        }
        OpCode::TailCall => {
            return do_tail_call(state, thread, base, a, b);
        }
        OpCode::Return => {
            let count = if b == 0 {
                open_count(thread)
            } else {
                (b - 1) as usize
            };
            let mut results = Vec::with_capacity(count);
            for i in 0..count {
                results.push(reg!(a + i as i32));
            }
            return finish_return(state, thread, results);
        }
        OpCode::ForPrep => {
            let init = reg!(a);
            let limit = reg!(a + 1);
            let step = reg!(a + 2);
            match for_prep(&init, &limit, &step) {
                Ok(Some((i0, lim, st))) => {
                    set_reg!(a, LuaValue::Integer(i0));
                    set_reg!(a + 1, LuaValue::Integer(lim));
                    set_reg!(a + 2, LuaValue::Integer(st));
                    set_reg!(a + 3, LuaValue::Integer(i0));
                }
                Ok(None) => {
                    // Empty range: jump past the loop body (to ForLoop's target).
                    thread.borrow_mut().frames.last_mut().unwrap().pc =
                        (pc as i32 + b + 1) as usize;
                }
                Err(msg) => return runtime_error(state, msg),
            }
        }
        OpCode::ForLoop => {
            let i = match reg!(a) {
                LuaValue::Integer(i) => i,
                _ => return runtime_error(state, "'for' control value must be an integer"),
            };
            let limit = match reg!(a + 1) {
                LuaValue::Integer(l) => l,
                _ => return runtime_error(state, "'for' control value must be an integer"),
            };
            let step = match reg!(a + 2) {
                LuaValue::Integer(s) => s,
                _ => return runtime_error(state, "'for' control value must be an integer"),
            };
            if let Some(next) = i.checked_add(step) {
                let continues = if step >= 0 { next <= limit } else { next >= limit };
                if continues {
                    set_reg!(a, LuaValue::Integer(next));
                    set_reg!(a + 3, LuaValue::Integer(next));
                    thread.borrow_mut().frames.last_mut().unwrap().pc =
                        (pc as i32 + b + 1) as usize;
                }
            }
        }
        OpCode::TForPrep => {
            let _ = (a, b);
        }
        OpCode::TForCall => {
            let iter = reg!(a);
            let state_v = reg!(a + 1);
            let control = reg!(a + 2);
            let results = call_value(state, thread, &iter, vec![state_v, control])?;
            let n = c as usize;
            for i in 0..n {
                set_reg!(a + 4 + i as i32, results.get(i).cloned().unwrap_or(LuaValue::Nil));
            }
        }
        OpCode::TForLoop => {
            let first = reg!(a + 4);
            if !first.is_nil() {
                set_reg!(a + 2, first);
                thread.borrow_mut().frames.last_mut().unwrap().pc =
                    (pc as i32 + b + 1) as usize;
            }
        }
        OpCode::SetList => {
            let table = reg!(a);
            let t = match &table {
                LuaValue::Table(t) => t.clone(),
                _ => return runtime_error(state, "SETLIST target is not a table"),
            };
            let count = if c == 0 { open_count(thread) } else { c as usize };
            for i in 0..count {
                let v = reg!(a + 1 + i as i32);
                t.borrow_mut().set_int(b as i64 + i as i64 + 1, v);
            }
        }
        OpCode::Closure => {
            let proto = current_proto(thread).protos[b as usize].clone();
            let mut upvalues = Vec::with_capacity(proto.upvalues.len());
            for desc in &proto.upvalues {
                let cell = match desc.source {
                    UpvalueSource::ParentLocal(reg_idx) => {
                        open_upvalue(thread, base + reg_idx as usize)
                    }
                    UpvalueSource::ParentUpvalue(idx) => get_upvalue_cell(thread, idx as usize),
                };
                upvalues.push(cell);
            }
            set_reg!(a, LuaValue::Function(Closure::new_lua(proto, upvalues)));
        }
        OpCode::Vararg => {
            let varargs = thread.borrow().frames.last().unwrap().varargs.clone();
            let count = if b == 0 { varargs.len() } else { (b - 1) as usize };
            for i in 0..count {
                set_reg!(a + i as i32, varargs.get(i).cloned().unwrap_or(LuaValue::Nil));
            }
            if b == 0 {
                set_open_count(thread, varargs.len());
            }
        }
        OpCode::Close => {
            close::close_registers_from(state, thread, base + a as usize)?;
        }
        OpCode::Tbc => {
            let v = reg!(a);
            if !v.is_nil() && !v.is_truthy().then_some(()).is_none() {
                register_tbc(state, thread, a as u16, v)?;
            }
        }
    }
    Ok(StepOutcome::Continue)
}

fn register_tbc(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>, register: u16, v: LuaValue) -> LuaResult<()> {
    if v.is_nil() || matches!(v, LuaValue::Boolean(false)) {
        return Ok(());
    }
    if get_metamethod(&v, MetaEvent::Close, state).is_none() {
        return runtime_error_unit(state, "variable has a non-closable value");
    }
    thread
        .borrow_mut()
        .frames
        .last_mut()
        .unwrap()
        .to_be_closed
        .push(PendingClose { register, value: v });
    Ok(())
}

fn runtime_error_unit(state: &mut VmState, msg: &str) -> LuaResult<()> {
    state.set_error(LuaValue::Str(Rc::from(msg.as_bytes())));
    Err(LuaError::Runtime)
}

fn runtime_error<T>(state: &mut VmState, msg: &str) -> LuaResult<T> {
    state.set_error(LuaValue::Str(Rc::from(msg.as_bytes())));
    Err(LuaError::Runtime)
}

/// Invokes the installed debug hook with `(event, line)`, guarded against
/// re-entrancy (a hook that triggers another hook call is suppressed, as
/// real Lua does). Hook errors propagate like any other runtime error.
fn fire_hook(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>, event: &str, line: Option<i64>) -> LuaResult<()> {
    if state.hooks.in_hook {
        return Ok(());
    }
    let callback = match state.hooks.callback.clone() {
        Some(c) => c,
        None => return Ok(()),
    };
    let line_arg = line.map(LuaValue::Integer).unwrap_or(LuaValue::Nil);
    let args = vec![LuaValue::Str(state.interner.intern_str(event)), line_arg];
    state.hooks.in_hook = true;
    let result = call_value(state, thread, &callback, args);
    state.hooks.in_hook = false;
    result.map(|_| ())
}

/// Checks the line/count hook conditions before executing the
/// instruction at `pc`. A loop body revisiting the same source line
/// still refires the line hook once per backward jump (a new iteration),
/// not just once ever.
fn fire_pre_instruction_hooks(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>, pc: usize) -> LuaResult<()> {
    if state.hooks.callback.is_none() || state.hooks.in_hook {
        return Ok(());
    }
    if state.hooks.mask.count {
        state.hooks.count_remaining -= 1;
        if state.hooks.count_remaining <= 0 {
            state.hooks.count_remaining = state.hooks.count.max(1);
            fire_hook(state, thread, "count", None)?;
        }
    }
    if state.hooks.mask.line {
        let proto = current_proto(thread);
        let line = proto.line_at(pc).map(|l| l as i64);
        let (last_line, last_pc) = {
            let t = thread.borrow();
            let frame = t.frames.last().unwrap();
            (frame.last_hook_line, frame.last_hook_pc)
        };
        let revisited_line = line.map(|l| l as u32) == last_line;
        let backward_jump = last_pc.is_some_and(|lp| pc <= lp);
        if !revisited_line || backward_jump {
            let mut t = thread.borrow_mut();
            let frame = t.frames.last_mut().unwrap();
            frame.last_hook_line = line.map(|l| l as u32);
            frame.last_hook_pc = Some(pc);
            drop(t);
            fire_hook(state, thread, "line", line)?;
        }
    }
    Ok(())
}

fn finish_return(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    results: Vec<LuaValue>,
) -> LuaResult<StepOutcome> {
    let frame = thread.borrow_mut().frames.pop().unwrap();
    close::close_frame_on_return(state, thread, &frame)?;
    if state.hooks.mask.return_ {
        fire_hook(state, thread, "return", None)?;
    }
    if thread.borrow().frames.is_empty() {
        return Ok(StepOutcome::Returned(results));
    }
    // A `pcall`/`xpcall` callee returning successfully also pops its
    // guarding `Protected` marker and prepends the `true` status value
    // — the marker frame itself never runs bytecode, so it's never the
    // one whose `Return` opcode got us here.
    let is_protected_return = matches!(thread.borrow().frames.last().unwrap().kind, FrameKind::Protected { .. });
    if is_protected_return {
        let marker = thread.borrow_mut().frames.pop().unwrap();
        let mut wrapped = Vec::with_capacity(results.len() + 1);
        wrapped.push(LuaValue::Boolean(true));
        wrapped.extend(results);
        let wrapped_len = wrapped.len();
        place_results(thread, marker.return_base, marker.want_results, wrapped);
        if marker.want_results.is_none() {
            set_open_count(thread, wrapped_len);
        }
        return Ok(StepOutcome::Continue);
    }
    let results_len = results.len();
    place_results(thread, frame.return_base, frame.want_results, results);
    if frame.want_results.is_none() {
        set_open_count(thread, results_len);
    }
    Ok(StepOutcome::Continue)
}

fn open_count(thread: &Rc<RefCell<LuaThread>>) -> usize {
    thread.borrow().frames.last().map(|f| f.base).unwrap_or(0);
    OPEN_COUNT.with(|c| *c.borrow())
}

fn set_open_count(_thread: &Rc<RefCell<LuaThread>>, n: usize) {
    OPEN_COUNT.with(|c| *c.borrow_mut() = n);
}

thread_local! {
    static OPEN_COUNT: RefCell<usize> = RefCell::new(0);
}

fn get_reg(thread: &Rc<RefCell<LuaThread>>, base: usize, i: i32) -> LuaValue {
    thread.borrow().registers[base + i as usize].clone()
}

fn set_reg(thread: &Rc<RefCell<LuaThread>>, base: usize, i: i32, v: LuaValue) {
    let idx = base + i as usize;
    let mut t = thread.borrow_mut();
    t.ensure_register_capacity(idx + 1);
    t.registers[idx] = v;
}

fn current_proto(thread: &Rc<RefCell<LuaThread>>) -> Rc<crate::value::closure::Proto> {
    thread
        .borrow()
        .frames
        .last()
        .unwrap()
        .closure
        .proto()
        .unwrap()
        .clone()
}

fn get_upvalue(thread: &Rc<RefCell<LuaThread>>, idx: usize) -> LuaValue {
    let cell = get_upvalue_cell(thread, idx);
    let cell_ref = cell.borrow();
    match &*cell_ref {
        UpvalueCell::Closed(v) => v.clone(),
        UpvalueCell::Open { thread: owner, index } => {
            if let Some(owner) = owner.upgrade() {
                owner.borrow().registers[*index].clone()
            } else {
                LuaValue::Nil
            }
        }
    }
}

fn set_upvalue(thread: &Rc<RefCell<LuaThread>>, idx: usize, v: LuaValue) {
    let cell = get_upvalue_cell(thread, idx);
    let mut cell_ref = cell.borrow_mut();
    match &mut *cell_ref {
        UpvalueCell::Closed(slot) => *slot = v,
        UpvalueCell::Open { thread: owner, index } => {
            if let Some(owner) = owner.upgrade() {
                owner.borrow_mut().registers[*index] = v;
            }
        }
    }
}

fn get_upvalue_cell(thread: &Rc<RefCell<LuaThread>>, idx: usize) -> crate::value::closure::Upvalue {
    thread.borrow().frames.last().unwrap().closure.upvalues.borrow()[idx].clone()
}

fn open_upvalue(thread: &Rc<RefCell<LuaThread>>, index: usize) -> crate::value::closure::Upvalue {
    Rc::new(RefCell::new(UpvalueCell::Open {
        thread: Rc::downgrade(thread),
        index,
    }))
}

fn for_prep(init: &LuaValue, limit: &LuaValue, step: &LuaValue) -> Result<Option<(i64, i64, i64)>, &'static str> {
    let step_i = step.as_integer_exact().ok_or("'for' step must be a number")?;
    if step_i == 0 {
        return Err("'for' step is zero");
    }
    let init_i = init.as_integer_exact().ok_or("'for' initial value must be a number")?;
    let limit_i = match limit.as_integer_exact() {
        Some(l) => l,
        None => {
            let lf = limit.as_f64().ok_or("'for' limit must be a number")?;
            clamp_float_limit(lf, step_i > 0)
        }
    };
    let continues = if step_i >= 0 { init_i <= limit_i } else { init_i >= limit_i };
    if !continues {
        return Ok(None);
    }
    Ok(Some((init_i, limit_i, step_i)))
}

fn clamp_float_limit(lf: f64, ascending: bool) -> i64 {
    if ascending {
        if lf >= i64::MAX as f64 { i64::MAX } else { lf.floor() as i64 }
    } else if lf <= i64::MIN as f64 {
        i64::MIN
    } else {
        lf.ceil() as i64
    }
}

fn to_integer_for_bitop(v: &LuaValue) -> Option<i64> {
    match v {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::Number(f) => float_to_integer_exact(*f),
        _ => None,
    }
}

/// String-to-number coercion for arithmetic (Lua 5.4 coerces numeric
/// strings in arithmetic contexts, unlike equality/concatenation).
fn coerce_number(v: &LuaValue) -> Option<LuaValue> {
    match v {
        LuaValue::Integer(_) | LuaValue::Number(_) => Some(v.clone()),
        LuaValue::Str(s) => crate::vm::load::parse_number_str(s),
        _ => None,
    }
}

fn call_unary_meta(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    event: MetaEvent,
    v: &LuaValue,
) -> LuaResult<LuaValue> {
    if let Some(m) = get_metamethod(v, event, state) {
        let r = call_value(state, thread, &m, vec![v.clone(), v.clone()])?;
        Ok(r.into_iter().next().unwrap_or(LuaValue::Nil))
    } else {
        runtime_error(
            state,
            &format!("attempt to perform arithmetic on a {} value", v.type_name()),
        )
    }
}

fn arith_op(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    op: OpCode,
    lhs: &LuaValue,
    rhs: &LuaValue,
) -> LuaResult<LuaValue> {
    let event = match op {
        OpCode::Add => MetaEvent::Add,
        OpCode::Sub => MetaEvent::Sub,
        OpCode::Mul => MetaEvent::Mul,
        OpCode::Div => MetaEvent::Div,
        OpCode::Mod => MetaEvent::Mod,
        OpCode::Pow => MetaEvent::Pow,
        OpCode::IDiv => MetaEvent::IDiv,
        OpCode::BAnd => MetaEvent::BAnd,
        OpCode::BOr => MetaEvent::BOr,
        OpCode::BXor => MetaEvent::BXor,
        OpCode::Shl => MetaEvent::Shl,
        OpCode::Shr => MetaEvent::Shr,
        _ => unreachable!(),
    };
    let is_bitwise = matches!(op, OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr);
    if is_bitwise {
        if let (Some(a), Some(b)) = (to_integer_for_bitop(lhs), to_integer_for_bitop(rhs)) {
            return Ok(LuaValue::Integer(match op {
                OpCode::BAnd => a & b,
                OpCode::BOr => a | b,
                OpCode::BXor => a ^ b,
                OpCode::Shl => shift_left(a, b),
                OpCode::Shr => shift_left(a, -b),
                _ => unreachable!(),
            }));
        }
        if let Some(m) = binop_metamethod(lhs, rhs, event, state) {
            let r = call_value(state, thread, &m, vec![lhs.clone(), rhs.clone()])?;
            return Ok(r.into_iter().next().unwrap_or(LuaValue::Nil));
        }
        let bad = if lhs.is_number() { rhs } else { lhs };
        if bad.is_number() {
            return runtime_error(state, "number has no integer representation");
        }
        return runtime_error(state, "bitwise operation on non-integer");
    }

    let l = coerce_number(lhs);
    let r = coerce_number(rhs);
    if let (Some(l), Some(r)) = (l, r) {
        return apply_arith(op, &l, &r).or_else(|msg| runtime_error(state, msg));
    }
    if let Some(m) = binop_metamethod(lhs, rhs, event, state) {
        let res = call_value(state, thread, &m, vec![lhs.clone(), rhs.clone()])?;
        return Ok(res.into_iter().next().unwrap_or(LuaValue::Nil));
    }
    let bad = if lhs.is_number() { rhs } else { lhs };
    runtime_error(state, &format!("attempt to perform arithmetic on a {} value", bad.type_name()))
}

fn shift_left(a: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((a as u64) << n) as i64
    } else {
        ((a as u64) >> (-n)) as i64
    }
}

fn apply_arith(op: OpCode, l: &LuaValue, r: &LuaValue) -> Result<LuaValue, &'static str> {
    use LuaValue::*;
    Ok(match op {
        OpCode::Div => LuaValue::Number(to_f64(l) / to_f64(r)),
        OpCode::Pow => LuaValue::Number(to_f64(l).powf(to_f64(r))),
        _ => match (l, r) {
            (Integer(a), Integer(b)) => match op {
                OpCode::Add => Integer(a.wrapping_add(*b)),
                OpCode::Sub => Integer(a.wrapping_sub(*b)),
                OpCode::Mul => Integer(a.wrapping_mul(*b)),
                OpCode::Mod => {
                    if *b == 0 {
                        return Err("attempt to perform 'n%0'");
                    }
                    Integer(lua_imod(*a, *b))
                }
                OpCode::IDiv => {
                    if *b == 0 {
                        return Err("attempt to perform 'n//0'");
                    }
                    Integer(lua_ifloordiv(*a, *b))
                }
                _ => unreachable!(),
            },
            _ => {
                let a = to_f64(l);
                let b = to_f64(r);
                match op {
                    OpCode::Add => Number(a + b),
                    OpCode::Sub => Number(a - b),
                    OpCode::Mul => Number(a * b),
                    OpCode::Mod => Number(lua_fmod(a, b)),
                    OpCode::IDiv => Number((a / b).floor()),
                    _ => unreachable!(),
                }
            }
        },
    })
}

fn to_f64(v: &LuaValue) -> f64 {
    v.as_f64().unwrap_or(f64::NAN)
}

fn values_equal(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
    if a.raw_eq(b) {
        return Ok(true);
    }
    let same_comparable = matches!(
        (a, b),
        (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::UserData(_), LuaValue::UserData(_))
    );
    if !same_comparable {
        return Ok(false);
    }
    if let Some(m) = binop_metamethod(a, b, MetaEvent::Eq, state) {
        let r = call_value(state, thread, &m, vec![a.clone(), b.clone()])?;
        Ok(r.into_iter().next().unwrap_or(LuaValue::Nil).is_truthy())
    } else {
        Ok(false)
    }
}

fn values_less(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    a: &LuaValue,
    b: &LuaValue,
    or_equal: bool,
) -> LuaResult<bool> {
    use crate::value::{float_le_int, float_lt_int, int_le_float, int_lt_float};
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => Ok(if or_equal { x <= y } else { x < y }),
        (LuaValue::Number(x), LuaValue::Number(y)) => Ok(if or_equal { x <= y } else { x < y }),
        (LuaValue::Integer(x), LuaValue::Number(y)) => Ok(if or_equal { int_le_float(*x, *y) } else { int_lt_float(*x, *y) }),
        (LuaValue::Number(x), LuaValue::Integer(y)) => Ok(if or_equal { float_le_int(*x, *y) } else { float_lt_int(*x, *y) }),
        (LuaValue::Str(x), LuaValue::Str(y)) => Ok(if or_equal { x <= y } else { x < y }),
        _ => {
            let event = if or_equal { MetaEvent::Le } else { MetaEvent::Lt };
            if let Some(m) = binop_metamethod(a, b, event, state) {
                let r = call_value(state, thread, &m, vec![a.clone(), b.clone()])?;
                Ok(r.into_iter().next().unwrap_or(LuaValue::Nil).is_truthy())
            } else {
                runtime_error(state, &format!("attempt to compare two {} values", a.type_name()))
            }
        }
    }
}

fn concat_values(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>, values: Vec<LuaValue>) -> LuaResult<LuaValue> {
    // Right-fold so a `__concat` metamethod sees its two immediate operands.
    let mut iter = values.into_iter().rev();
    let mut acc = iter.next().unwrap_or(LuaValue::Nil);
    for v in iter {
        acc = concat_pair(state, thread, v, acc)?;
    }
    Ok(acc)
}

fn concat_pair(state: &mut VmState, thread: &Rc<RefCell<LuaThread>>, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    let both_stringable = is_stringable(&a) && is_stringable(&b);
    if both_stringable {
        let mut s = Vec::new();
        s.extend_from_slice(&stringable_bytes(&a));
        s.extend_from_slice(&stringable_bytes(&b));
        return Ok(LuaValue::Str(Rc::from(s.into_boxed_slice())));
    }
    if let Some(m) = binop_metamethod(&a, &b, MetaEvent::Concat, state) {
        let r = call_value(state, thread, &m, vec![a, b])?;
        Ok(r.into_iter().next().unwrap_or(LuaValue::Nil))
    } else {
        let bad = if is_stringable(&a) { &b } else { &a };
        runtime_error(state, &format!("attempt to concatenate a {} value", bad.type_name()))
    }
}

fn is_stringable(v: &LuaValue) -> bool {
    matches!(v, LuaValue::Str(_) | LuaValue::Integer(_) | LuaValue::Number(_))
}

fn stringable_bytes(v: &LuaValue) -> Vec<u8> {
    match v {
        LuaValue::Str(s) => s.to_vec(),
        _ => crate::value::display_value_raw(v).into_bytes(),
    }
}

pub fn index_value(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    obj: &LuaValue,
    key: &LuaValue,
) -> LuaResult<LuaValue> {
    if let LuaValue::Table(t) = obj {
        let raw = t.borrow().get(key);
        if !raw.is_nil() {
            return Ok(raw);
        }
        match get_metamethod(obj, MetaEvent::Index, state) {
            Some(LuaValue::Function(_)) => {}
            Some(h) => return index_value(state, thread, &h, key),
            None => return Ok(LuaValue::Nil),
        }
    }
    if let Some(h) = get_metamethod(obj, MetaEvent::Index, state) {
        match &h {
            LuaValue::Function(_) => {
                let r = call_value(state, thread, &h, vec![obj.clone(), key.clone()])?;
                return Ok(r.into_iter().next().unwrap_or(LuaValue::Nil));
            }
            _ => return index_value(state, thread, &h, key),
        }
    }
    if matches!(obj, LuaValue::Table(_)) {
        return Ok(LuaValue::Nil);
    }
    runtime_error(state, &format!("attempt to index a {} value", obj.type_name()))
}

pub fn newindex_value(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    obj: &LuaValue,
    key: LuaValue,
    value: LuaValue,
) -> LuaResult<()> {
    if let LuaValue::Table(t) = obj {
        let has_raw = !t.borrow().get(&key).is_nil();
        if has_raw {
            return set_raw(state, t, key, value);
        }
        match get_metamethod(obj, MetaEvent::NewIndex, state) {
            None => return set_raw(state, t, key, value),
            Some(LuaValue::Function(f)) => {
                call_value(state, thread, &LuaValue::Function(f), vec![obj.clone(), key, value])?;
                return Ok(());
            }
            Some(h) => return newindex_value(state, thread, &h, key, value),
        }
    }
    if let Some(h) = get_metamethod(obj, MetaEvent::NewIndex, state) {
        match &h {
            LuaValue::Function(_) => {
                call_value(state, thread, &h, vec![obj.clone(), key, value])?;
                return Ok(());
            }
            _ => return newindex_value(state, thread, &h, key, value),
        }
    }
    runtime_error(state, &format!("attempt to index a {} value", obj.type_name()))
}

fn set_raw(state: &mut VmState, t: &Rc<RefCell<LuaTable>>, key: LuaValue, value: LuaValue) -> LuaResult<()> {
    match t.borrow_mut().set(key, value) {
        Ok(()) => Ok(()),
        Err(msg) => runtime_error(state, msg),
    }
}

/// Calls any callable value (Lua closure, host function, or intrinsic),
/// running it to completion (host/generic calls are plain Rust calls;
/// Lua calls push frames onto `thread` and drive `run_loop` to
/// completion for this nested invocation only — see DESIGN.md for why
/// `pcall`/`xpcall`/`coroutine.resume` are intrinsics rather than going
/// through this path when yield-transparency matters).
pub fn call_value(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    f: &LuaValue,
    args: Vec<LuaValue>,
) -> LuaResult<Vec<LuaValue>> {
    let closure = match f {
        LuaValue::Function(c) => c.clone(),
        _ => {
            if let Some(m) = get_metamethod(f, MetaEvent::Call, state) {
                let mut new_args = vec![f.clone()];
                new_args.extend(args);
                return call_value(state, thread, &m, new_args);
            }
            return runtime_error(state, &format!("attempt to call a {} value", f.type_name()));
        }
    };
    match &closure.kind {
        ClosureKind::Host { func, .. } => func.clone()(state, &args),
        ClosureKind::Intrinsic(i) => crate::vm::coroutine::call_intrinsic(state, thread, i, args),
        ClosureKind::Lua(_) => {
            let depth_before = thread.borrow().frames.len();
            push_lua_frame(thread, closure, args, usize::MAX, None, false);
            loop {
                if thread.borrow().frames.len() <= depth_before {
                    break;
                }
                match step(state, thread) {
                    Ok(StepOutcome::Continue) => {}
                    Ok(StepOutcome::Returned(vals)) => return Ok(vals),
                    Ok(StepOutcome::Yielded(_)) => {
                        return Err(LuaError::Runtime);
                    }
                    Err(e) => {
                        if matches!(e, LuaError::Runtime) {
                            state.last_traceback = Some(crate::vm::debug::capture_traceback(thread));
                        }
                        match unwind_to_protected(state, thread, e.clone())? {
                            Some(()) => {
                                if thread.borrow().frames.len() <= depth_before {
                                    let v = place_holder_results(thread, depth_before);
                                    return Ok(v);
                                }
                            }
                            None => return Err(e),
                        }
                    }
                }
                if thread.borrow().frames.len() < depth_before {
                    break;
                }
            }
            Ok(Vec::new())
        }
    }
}

fn place_holder_results(_thread: &Rc<RefCell<LuaThread>>, _depth_before: usize) -> Vec<LuaValue> {
    Vec::new()
}

fn push_lua_frame(
    thread: &Rc<RefCell<LuaThread>>,
    closure: Rc<Closure>,
    mut args: Vec<LuaValue>,
    return_base: usize,
    want_results: Option<u16>,
    is_tail: bool,
) {
    let proto = closure.proto().unwrap().clone();
    let nparams = proto.num_params as usize;
    let varargs = if proto.is_vararg && args.len() > nparams {
        args.split_off(nparams)
    } else {
        Vec::new()
    };
    args.resize(nparams, LuaValue::Nil);
    let base = {
        let t = thread.borrow();
        t.registers.len().max(
            t.frames
                .last()
                .map(|f| f.base + proto.max_stack_size as usize)
                .unwrap_or(0),
        )
    };
    {
        let mut t = thread.borrow_mut();
        t.ensure_register_capacity(base + proto.max_stack_size as usize);
        for (i, v) in args.into_iter().enumerate() {
            t.registers[base + i] = v;
        }
    }
    thread.borrow_mut().frames.push(Frame {
        closure,
        pc: 0,
        base,
        varargs,
        kind: FrameKind::Lua,
        return_base,
        want_results,
        to_be_closed: Vec::new(),
        is_tail_call: is_tail,
        last_hook_line: None,
        last_hook_pc: None,
    });
}

/// Pushes a coroutine's very first frame so [`run_loop`] has something
/// to run. `body` must be a Lua closure or a host function standing in
/// for one; host-bodied coroutines run to completion in a single
/// `resume` since they can't themselves call `coroutine.yield` through
/// this path.
pub fn start_thread_body(thread: &Rc<RefCell<LuaThread>>, body: Rc<Closure>, args: Vec<LuaValue>) {
    if body.is_lua() {
        push_lua_frame(thread, body, args, 0, None, false);
    } else {
        thread.borrow_mut().resume_values = args;
    }
}

/// Writes the values a just-issued `resume` is delivering into the
/// register slot the suspended thread's pending `coroutine.yield` call
/// is waiting to read its results from, so the bytecode loop can simply
/// keep going from the instruction after that call.
pub fn deliver_resume_values(thread: &Rc<RefCell<LuaThread>>) {
    let pending = thread.borrow_mut().pending_yield_return.take();
    let values = std::mem::take(&mut thread.borrow_mut().resume_values);
    if let Some((func_reg, want)) = pending {
        let n = values.len();
        place_results(thread, func_reg, want, values);
        if want.is_none() {
            set_open_count(thread, n);
        }
    }
}

fn do_call(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    base: usize,
    a: i32,
    b: i32,
    c: i32,
    _is_tail: bool,
) -> LuaResult<StepOutcome> {
    let func_reg = base + a as usize;
    let f = thread.borrow().registers[func_reg].clone();
    let nargs = if b == 0 { open_count(thread) } else { (b - 1) as usize };
    let mut args = Vec::with_capacity(nargs);
    {
        let t = thread.borrow();
        for i in 0..nargs {
            args.push(t.registers[func_reg + 1 + i].clone());
        }
    }
    let want = if c == 0 { None } else { Some((c - 1) as u16) };
    match &f {
        LuaValue::Function(cl) if cl.is_lua() => {
            push_lua_frame(thread, cl.clone(), args, func_reg, want, false);
            if state.hooks.mask.call {
                fire_hook(state, thread, "call", None)?;
            }
        }
        LuaValue::Function(cl) => match &cl.kind {
            ClosureKind::Host { func, .. } => {
                let results = func.clone()(state, &args)?;
                place_results(thread, func_reg, want, results.clone());
                if want.is_none() {
                    set_open_count(thread, results.len());
                }
            }
            ClosureKind::Intrinsic(Intrinsic::PCall) => {
                return begin_protected_call(state, thread, func_reg, want, None, args);
            }
            ClosureKind::Intrinsic(Intrinsic::XPCall) => {
                let handler = if args.is_empty() { LuaValue::Nil } else { args.remove(0) };
                return begin_protected_call(state, thread, func_reg, want, Some(handler), args);
            }
            ClosureKind::Intrinsic(Intrinsic::CoroutineYield) => {
                thread.borrow_mut().pending_yield_return = Some((func_reg, want));
                return Ok(StepOutcome::Yielded(args));
            }
            ClosureKind::Intrinsic(i) => {
                let results = crate::vm::coroutine::call_intrinsic(state, thread, i, args)?;
                place_results(thread, func_reg, want, results.clone());
                if want.is_none() {
                    set_open_count(thread, results.len());
                }
            }
            ClosureKind::Lua(_) => unreachable!(),
        },
        other => {
            if let Some(m) = get_metamethod(other, MetaEvent::Call, state) {
                let mut new_args = vec![other.clone()];
                new_args.extend(args);
                let results = call_value(state, thread, &m, new_args)?;
                place_results(thread, func_reg, want, results.clone());
                if want.is_none() {
                    set_open_count(thread, results.len());
                }
            } else {
                return runtime_error(state, &format!("attempt to call a {} value", other.type_name()));
            }
        }
    }
    Ok(StepOutcome::Continue)
}

/// Begins a `pcall`/`xpcall`: pushes a `Protected` marker frame followed
/// by the callee's own frame onto the *same* flat stack `run_loop`
/// drives, so a `coroutine.yield` anywhere inside the protected call
/// simply suspends the whole thread like any other yield — there is no
/// separate Rust call frame here to make that impossible. A non-Lua
/// callee (host function or `__call` metamethod target) can't yield
/// regardless, so it's invoked synchronously instead of costing a
/// marker frame.
fn begin_protected_call(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    return_base: usize,
    want: Option<u16>,
    handler: Option<LuaValue>,
    mut args: Vec<LuaValue>,
) -> LuaResult<StepOutcome> {
    if args.is_empty() {
        args.push(LuaValue::Nil);
    }
    let target = args.remove(0);
    if let LuaValue::Function(cl) = &target {
        if cl.is_lua() {
            thread.borrow_mut().frames.push(Frame {
                closure: cl.clone(),
                pc: 0,
                base: thread.borrow().registers.len(),
                varargs: Vec::new(),
                kind: FrameKind::Protected { handler },
                return_base,
                want_results: want,
                to_be_closed: Vec::new(),
                is_tail_call: false,
                last_hook_line: None,
                last_hook_pc: None,
            });
            push_lua_frame(thread, cl.clone(), args, return_base, want, false);
            return Ok(StepOutcome::Continue);
        }
    }
    match call_value(state, thread, &target, args) {
        Ok(mut results) => {
            let mut wrapped = Vec::with_capacity(results.len() + 1);
            wrapped.push(LuaValue::Boolean(true));
            wrapped.append(&mut results);
            let n = wrapped.len();
            place_results(thread, return_base, want, wrapped);
            if want.is_none() {
                set_open_count(thread, n);
            }
        }
        Err(_) => {
            let err_value = state.take_error();
            let message = match handler {
                Some(h) => match call_value(state, thread, &h, vec![err_value.clone()]) {
                    Ok(mut r) => r.pop().unwrap_or(LuaValue::Nil),
                    Err(_) => state.take_error(),
                },
                None => err_value,
            };
            let results = vec![LuaValue::Boolean(false), message];
            let n = results.len();
            place_results(thread, return_base, want, results);
            if want.is_none() {
                set_open_count(thread, n);
            }
        }
    }
    Ok(StepOutcome::Continue)
}

/// Tail call: pops the current frame first so the callee reuses its
/// slot (the point of a tail call — the frame stack never grows).
fn do_tail_call(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    base: usize,
    a: i32,
    b: i32,
) -> LuaResult<StepOutcome> {
    let func_reg = base + a as usize;
    let f = thread.borrow().registers[func_reg].clone();
    let nargs = if b == 0 { open_count(thread) } else { (b - 1) as usize };
    let mut args = Vec::with_capacity(nargs);
    {
        let t = thread.borrow();
        for i in 0..nargs {
            args.push(t.registers[func_reg + 1 + i].clone());
        }
    }
    let outgoing = thread.borrow_mut().frames.pop().unwrap();
    close::close_frame_on_return(state, thread, &outgoing)?;
    match &f {
        LuaValue::Function(cl) if cl.is_lua() => {
            push_lua_frame(thread, cl.clone(), args, outgoing.return_base, outgoing.want_results, true);
            if state.hooks.mask.call {
                fire_hook(state, thread, "tail call", None)?;
            }
            Ok(StepOutcome::Continue)
        }
        _ => {
            let results = call_value(state, thread, &f, args)?;
            if thread.borrow().frames.is_empty() {
                Ok(StepOutcome::Returned(results))
            } else {
                place_results(thread, outgoing.return_base, outgoing.want_results, results.clone());
                if outgoing.want_results.is_none() {
                    set_open_count(thread, results.len());
                }
                Ok(StepOutcome::Continue)
            }
        }
    }
}
