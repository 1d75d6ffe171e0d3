//! Coroutine lifecycle: `create`/`resume`/`yield`/`status`/`wrap` and
//! the glue those need from the execute loop.
//!
//! `coroutine.resume` is an ordinary (synchronous) call from the
//! resumer's point of view: it drives the target thread's own flat
//! frame stack via [`run_loop`] until that thread yields or returns,
//! then comes straight back. No unwinding of the *resumer's* stack is
//! needed because the resumer isn't itself inside a yield — only the
//! resumee's frames need to survive in place across the suspension,
//! and they do, since `run_loop` simply stops looping and leaves
//! `thread.frames` untouched. `coroutine.yield` is the hard direction
//! and is handled directly in the execute loop (see
//! [`crate::vm::execute`]'s `do_call`) rather than here, since by the
//! time control reaches a `HostFn`-style function it's already too
//! late: a real Rust call frame can't be transparently suspended.

use crate::error::{LuaError, LuaResult};
use crate::value::closure::Intrinsic;
use crate::value::{Closure, LuaTable, LuaValue};
use crate::vm::execute::{call_value, run_loop, LoopOutcome};
use crate::vm::state::VmState;
use crate::vm::thread::{CoroutineStatus, LuaThread};
use std::cell::RefCell;
use std::rc::Rc;

/// Dispatches an [`Intrinsic`] reached through a path other than the
/// execute loop's own `do_call` splice (e.g. called indirectly via
/// `__call`, or from stdlib code holding the closure value directly).
/// `PCall`/`XPCall` fall back to a synchronous `call_value` here and so
/// lose yield-transparency; `CoroutineYield` reached this way has
/// escaped its resumer's flat stack and can't suspend anything, so it
/// reports the same error real Lua gives for yielding across a
/// non-yieldable boundary.
pub fn call_intrinsic(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    intrinsic: &Intrinsic,
    mut args: Vec<LuaValue>,
) -> LuaResult<Vec<LuaValue>> {
    match intrinsic {
        Intrinsic::PCall => {
            if args.is_empty() {
                args.push(LuaValue::Nil);
            }
            let target = args.remove(0);
            match call_value(state, thread, &target, args) {
                Ok(mut r) => {
                    let mut out = vec![LuaValue::Boolean(true)];
                    out.append(&mut r);
                    Ok(out)
                }
                Err(_) => Ok(vec![LuaValue::Boolean(false), state.take_error()]),
            }
        }
        Intrinsic::XPCall => {
            if args.is_empty() {
                args.push(LuaValue::Nil);
            }
            let target = args.remove(0);
            let handler = if args.is_empty() { LuaValue::Nil } else { args.remove(0) };
            match call_value(state, thread, &target, args) {
                Ok(mut r) => {
                    let mut out = vec![LuaValue::Boolean(true)];
                    out.append(&mut r);
                    Ok(out)
                }
                Err(_) => {
                    let err_value = state.take_error();
                    let message = match call_value(state, thread, &handler, vec![err_value.clone()]) {
                        Ok(mut r) => r.pop().unwrap_or(LuaValue::Nil),
                        Err(_) => state.take_error(),
                    };
                    Ok(vec![LuaValue::Boolean(false), message])
                }
            }
        }
        Intrinsic::CoroutineYield => runtime_error(state, "attempt to yield from outside a coroutine"),
        Intrinsic::CoroutineResume => {
            if args.is_empty() {
                return runtime_error(state, "bad argument #1 to 'resume' (coroutine expected)");
            }
            let target = args.remove(0);
            let co = match target {
                LuaValue::Thread(t) => t,
                _ => return runtime_error(state, "bad argument #1 to 'resume' (coroutine expected)"),
            };
            resume(state, thread, &co, args)
        }
        Intrinsic::CoroutineWrap(co) => {
            let co = co.clone();
            match resume(state, thread, &co, args) {
                Ok(mut r) => {
                    if !r.is_empty() && matches!(r[0], LuaValue::Boolean(true)) {
                        r.remove(0);
                        Ok(r)
                    } else {
                        let message = r.into_iter().nth(1).unwrap_or(LuaValue::Nil);
                        state.set_error(message);
                        Err(LuaError::Runtime)
                    }
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn runtime_error(state: &mut VmState, msg: &str) -> LuaResult<Vec<LuaValue>> {
    state.set_error(LuaValue::Str(Rc::from(msg.as_bytes())));
    Err(LuaError::Runtime)
}

/// Resumes `co` with `args`, returning `(true, results...)` on a normal
/// return or a yield, `(false, error)` if the body raised.
fn resume(
    state: &mut VmState,
    resumer: &Rc<RefCell<LuaThread>>,
    co: &Rc<RefCell<LuaThread>>,
    args: Vec<LuaValue>,
) -> LuaResult<Vec<LuaValue>> {
    if Rc::ptr_eq(co, resumer) {
        return Ok(vec![LuaValue::Boolean(false), LuaValue::Str(Rc::from(&b"cannot resume non-suspended coroutine"[..]))]);
    }
    {
        let st = co.borrow().status;
        if !matches!(st, CoroutineStatus::Suspended) {
            let msg = match st {
                CoroutineStatus::Dead => "cannot resume dead coroutine",
                _ => "cannot resume non-suspended coroutine",
            };
            return Ok(vec![LuaValue::Boolean(false), LuaValue::Str(Rc::from(msg.as_bytes()))]);
        }
    }

    let first_resume = co.borrow().frames.is_empty();
    if first_resume {
        let body = co.borrow().body.clone();
        crate::vm::execute::start_thread_body(co, body, args);
    } else {
        co.borrow_mut().resume_values = args;
        crate::vm::execute::deliver_resume_values(co);
    }

    co.borrow_mut().status = CoroutineStatus::Running;
    resumer.borrow_mut().status = CoroutineStatus::Normal;
    state.resume_stack.push(resumer.clone());
    let prev_current = state.current_thread.clone();
    state.current_thread = co.clone();

    let outcome = run_loop(state, co);

    state.current_thread = prev_current;
    state.resume_stack.pop();
    resumer.borrow_mut().status = CoroutineStatus::Running;

    match outcome {
        Ok(LoopOutcome::Returned(vals)) => {
            co.borrow_mut().status = CoroutineStatus::Dead;
            let mut out = vec![LuaValue::Boolean(true)];
            out.extend(vals);
            Ok(out)
        }
        Ok(LoopOutcome::Yielded(vals)) => {
            co.borrow_mut().status = CoroutineStatus::Suspended;
            let mut out = vec![LuaValue::Boolean(true)];
            out.extend(vals);
            Ok(out)
        }
        Err(_) => {
            let mut c = co.borrow_mut();
            c.status = CoroutineStatus::Dead;
            c.dead_traceback = state.last_traceback.clone();
            drop(c);
            Ok(vec![LuaValue::Boolean(false), state.take_error()])
        }
    }
}

/// Builds the `coroutine` global table.
pub fn install(state: &mut VmState) -> Rc<RefCell<LuaTable>> {
    let t = Rc::new(RefCell::new(LuaTable::new()));
    macro_rules! set_host {
        ($name:expr, $f:expr) => {
            t.borrow_mut()
                .set(
                    LuaValue::Str(state.interner.intern_str($name)),
                    LuaValue::Function(Closure::new_host(Some($name), Rc::new($f))),
                )
                .unwrap();
        };
    }

    set_host!("create", |state: &mut VmState, args: &[LuaValue]| {
        let f = match args.first() {
            Some(LuaValue::Function(f)) if f.is_lua() => f.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'create' (Lua function expected)"),
        };
        let th = Rc::new(RefCell::new(LuaThread::new(f, false)));
        Ok(vec![LuaValue::Thread(th)])
    });

    t.borrow_mut()
        .set(
            LuaValue::Str(state.interner.intern_str("resume")),
            LuaValue::Function(Closure::new_intrinsic("resume", Intrinsic::CoroutineResume)),
        )
        .unwrap();
    t.borrow_mut()
        .set(
            LuaValue::Str(state.interner.intern_str("yield")),
            LuaValue::Function(Closure::new_intrinsic("yield", Intrinsic::CoroutineYield)),
        )
        .unwrap();

    set_host!("status", |state: &mut VmState, args: &[LuaValue]| {
        match args.first() {
            Some(LuaValue::Thread(t)) => {
                let status = if Rc::ptr_eq(t, &state.current_thread) {
                    CoroutineStatus::Running
                } else {
                    t.borrow().status
                };
                Ok(vec![LuaValue::Str(state.interner.intern_str(status.as_str()))])
            }
            _ => runtime_error(state, "bad argument #1 to 'status' (coroutine expected)"),
        }
    });

    set_host!("wrap", |state: &mut VmState, args: &[LuaValue]| {
        let f = match args.first() {
            Some(LuaValue::Function(f)) if f.is_lua() => f.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'wrap' (Lua function expected)"),
        };
        let th = Rc::new(RefCell::new(LuaThread::new(f, false)));
        Ok(vec![LuaValue::Function(Closure::new_intrinsic(
            "wrapped coroutine",
            Intrinsic::CoroutineWrap(th),
        ))])
    });

    set_host!("running", |state: &mut VmState, _args: &[LuaValue]| {
        let cur = state.current_thread.clone();
        let is_main = state.is_main_thread(&cur);
        Ok(vec![LuaValue::Thread(cur), LuaValue::Boolean(is_main)])
    });

    set_host!("isyieldable", |state: &mut VmState, _args: &[LuaValue]| {
        Ok(vec![LuaValue::Boolean(!state.is_main_thread(&state.current_thread.clone()))])
    });

    set_host!("close", |state: &mut VmState, args: &[LuaValue]| {
        match args.first() {
            Some(LuaValue::Thread(t)) => {
                let st = t.borrow().status;
                if matches!(st, CoroutineStatus::Running | CoroutineStatus::Normal) {
                    return runtime_error(state, "cannot close a running coroutine");
                }
                t.borrow_mut().status = CoroutineStatus::Dead;
                t.borrow_mut().frames.clear();
                Ok(vec![LuaValue::Boolean(true)])
            }
            _ => runtime_error(state, "bad argument #1 to 'close' (coroutine expected)"),
        }
    });

    t
}
