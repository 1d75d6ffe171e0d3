//! `<close>` machinery: running `__close` handlers in LIFO order when a
//! to-be-closed local's scope ends, whether by falling off the end of
//! a block, returning, or unwinding on error.

use crate::error::{LuaError, LuaResult};
use crate::value::LuaValue;
use crate::vm::execute::call_value;
use crate::vm::metamethod::{get_metamethod, MetaEvent};
use crate::vm::state::VmState;
use crate::vm::thread::{Frame, LuaThread};
use std::cell::RefCell;
use std::rc::Rc;

/// Closes every to-be-closed register at or above `abs_threshold` in
/// the thread's current frame, in LIFO declaration order, as if their
/// enclosing block had just ended without error.
pub fn close_registers_from(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    abs_threshold: usize,
) -> LuaResult<()> {
    loop {
        let next = {
            let mut t = thread.borrow_mut();
            let frame = t.frames.last_mut().unwrap();
            let base = frame.base;
            let pos = frame
                .to_be_closed
                .iter()
                .rposition(|p| base + p.register as usize >= abs_threshold);
            pos.map(|i| frame.to_be_closed.remove(i))
        };
        match next {
            Some(pending) => invoke_close(state, thread, pending.value, LuaValue::Nil)?,
            None => return Ok(()),
        }
    }
}

/// Runs every remaining to-be-closed value in `frame` (already popped
/// from the thread) in LIFO order, as part of a normal return.
pub fn close_frame_on_return(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    frame: &Frame,
) -> LuaResult<()> {
    for pending in frame.to_be_closed.iter().rev() {
        invoke_close(state, thread, pending.value.clone(), LuaValue::Nil)?;
    }
    Ok(())
}

/// Same as [`close_frame_on_return`] but passes the in-flight error
/// value to each `__close` handler, per Lua 5.4's error-propagation
/// rule for to-be-closed variables: every handler runs in reverse
/// declaration order regardless of earlier handlers raising, and if
/// more than one raises, the last one to run (the earliest-declared
/// variable) is the error that survives.
pub fn close_frame_on_error(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    frame: &Frame,
    err: &LuaValue,
) -> LuaResult<()> {
    let mut current = err.clone();
    let mut any_failed = false;
    for pending in frame.to_be_closed.iter().rev() {
        if invoke_close(state, thread, pending.value.clone(), current.clone()).is_err() {
            any_failed = true;
            current = state.take_error();
        }
    }
    if any_failed {
        state.set_error(current);
        return Err(LuaError::Runtime);
    }
    Ok(())
}

fn invoke_close(
    state: &mut VmState,
    thread: &Rc<RefCell<LuaThread>>,
    value: LuaValue,
    err: LuaValue,
) -> LuaResult<()> {
    if value.is_nil() || matches!(value, LuaValue::Boolean(false)) {
        return Ok(());
    }
    if let Some(m) = get_metamethod(&value, MetaEvent::Close, state) {
        call_value(state, thread, &m, vec![value, err])?;
    }
    Ok(())
}
