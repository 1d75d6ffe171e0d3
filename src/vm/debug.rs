//! The `debug` library: stack/local/upvalue introspection, hook
//! registration and `traceback` rendering.
//!
//! Everything here reads data the VM already carries for its own sake
//! (`Proto`'s line table and local-variable records, a `Frame`'s `pc`
//! and `base`, a `Closure`'s upvalue cells) rather than tracking any
//! separate shadow state. The one exception is hook bookkeeping itself
//! (`VmState::hooks`), which exists only to serve this module and the
//! hook probe in [`crate::vm::execute`].

use crate::value::closure::{ClosureKind, UpvalueCell};
use crate::value::{Closure, LuaTable, LuaValue};
use crate::vm::state::{HookMask, VmState};
use crate::vm::thread::{CoroutineStatus, Frame, LuaThread};
use crate::error::{LuaError, LuaResult};
use std::cell::RefCell;
use std::rc::Rc;

const SHORT_SRC_MAX: usize = 60;

/// Formats a `Proto::source` the way `short_src` does: `@file` sources
/// are truncated keeping the suffix, `=name` sources are used verbatim
/// (up to the limit), and anything else is a loaded literal shown as
/// `[string "..."]`.
pub fn short_src(source: &str) -> String {
    if let Some(rest) = source.strip_prefix('@') {
        if rest.chars().count() <= SHORT_SRC_MAX {
            rest.to_string()
        } else {
            let suffix: String = rest.chars().rev().take(SHORT_SRC_MAX - 3).collect::<Vec<_>>().into_iter().rev().collect();
            format!("...{suffix}")
        }
    } else if let Some(rest) = source.strip_prefix('=') {
        rest.chars().take(SHORT_SRC_MAX).collect()
    } else if source.is_empty() {
        "[string \"\"]".to_string()
    } else if source.starts_with('\n') {
        "[string \"...\"]".to_string()
    } else {
        let first_line = source.split('\n').next().unwrap_or("");
        let over_limit = first_line.chars().count() > SHORT_SRC_MAX || first_line.len() < source.len();
        if over_limit {
            let head: String = source.chars().take(SHORT_SRC_MAX).collect();
            format!("[string \"{head}...\"]")
        } else {
            format!("[string \"{first_line}\"]")
        }
    }
}

fn runtime_error<T>(state: &mut VmState, msg: &str) -> LuaResult<T> {
    state.set_error(LuaValue::Str(Rc::from(msg.as_bytes())));
    Err(LuaError::Runtime)
}

/// `args[0]` is an explicit coroutine when present; otherwise the
/// currently running thread is implied. Returns the resolved thread and
/// the remaining arguments.
fn split_thread_arg<'a>(state: &VmState, args: &'a [LuaValue]) -> (Rc<RefCell<LuaThread>>, &'a [LuaValue]) {
    match args.first() {
        Some(LuaValue::Thread(t)) => (t.clone(), &args[1..]),
        _ => (state.current_thread.clone(), args),
    }
}

/// Level 1 is the function that called the debug function currently
/// running (the usual meaning); level 0 is aliased to level 1 here,
/// since host calls leave no frame of their own on the stack to
/// distinguish the two.
fn frame_index_for_level(thread: &Rc<RefCell<LuaThread>>, level: i64) -> Option<usize> {
    let t = thread.borrow();
    let n = t.frames.len();
    let lvl = if level <= 0 { 1 } else { level as usize };
    if lvl == 0 || lvl > n {
        None
    } else {
        Some(n - lvl)
    }
}

enum InfoTarget {
    Frame { closure: Rc<Closure>, pc: usize, is_tail: bool, is_main: bool },
    Bare(Rc<Closure>),
}

fn resolve_info_target(thread: &Rc<RefCell<LuaThread>>, target: &LuaValue) -> Option<InfoTarget> {
    match target {
        LuaValue::Integer(level) => {
            let idx = frame_index_for_level(thread, *level)?;
            let t = thread.borrow();
            let frame = &t.frames[idx];
            Some(InfoTarget::Frame {
                closure: frame.closure.clone(),
                pc: frame.pc,
                is_tail: frame.is_tail_call,
                is_main: idx == 0,
            })
        }
        LuaValue::Function(c) => Some(InfoTarget::Bare(c.clone())),
        _ => None,
    }
}

pub fn getinfo(state: &mut VmState, target: &LuaValue, what: &str) -> LuaResult<LuaValue> {
    let thread = state.current_thread.clone();
    let resolved = match resolve_info_target(&thread, target) {
        Some(r) => r,
        None => return Ok(LuaValue::Nil),
    };
    let closure = match &resolved {
        InfoTarget::Frame { closure, .. } => closure.clone(),
        InfoTarget::Bare(c) => c.clone(),
    };

    let table = Rc::new(RefCell::new(LuaTable::new()));
    macro_rules! setf {
        ($k:expr, $v:expr) => {
            table.borrow_mut().set(LuaValue::Str(state.interner.intern_str($k)), $v).unwrap();
        };
    }

    if what.contains('f') {
        setf!("func", LuaValue::Function(closure.clone()));
    }
    if what.contains('n') {
        let (name, namewhat) = match &closure.kind {
            ClosureKind::Host { name: Some(n), .. } => (Some(n.clone()), "global"),
            ClosureKind::Intrinsic(_) => (closure.upvalue_names.first().cloned(), "global"),
            _ => (None, ""),
        };
        setf!("name", name.map(|n| LuaValue::Str(state.interner.intern(n.as_bytes()))).unwrap_or(LuaValue::Nil));
        setf!("namewhat", LuaValue::Str(state.interner.intern_str(namewhat)));
    }
    match closure.proto() {
        Some(proto) => {
            if what.contains('S') {
                let is_main = matches!(resolved, InfoTarget::Frame { is_main: true, .. });
                let is_tail = matches!(resolved, InfoTarget::Frame { is_tail: true, .. });
                let kind = if is_main {
                    "main"
                } else if is_tail {
                    "tail"
                } else {
                    "Lua"
                };
                setf!("source", LuaValue::Str(state.interner.intern(proto.source.as_bytes())));
                setf!("short_src", LuaValue::Str(state.interner.intern(short_src(&proto.source).as_bytes())));
                setf!("what", LuaValue::Str(state.interner.intern_str(kind)));
                setf!("linedefined", LuaValue::Integer(proto.line_defined as i64));
                setf!("lastlinedefined", LuaValue::Integer(proto.last_line_defined as i64));
            }
            if what.contains('l') {
                let line = match &resolved {
                    InfoTarget::Frame { pc, .. } => proto.line_at(pc.saturating_sub(1)).map(|l| l as i64).unwrap_or(-1),
                    InfoTarget::Bare(_) => -1,
                };
                setf!("currentline", LuaValue::Integer(line));
            }
            if what.contains('u') {
                setf!("nups", LuaValue::Integer(closure.upvalues.borrow().len() as i64));
                setf!("nparams", LuaValue::Integer(proto.num_params as i64));
                setf!("isvararg", LuaValue::Boolean(proto.is_vararg));
            }
            if what.contains('L') {
                let active = Rc::new(RefCell::new(LuaTable::new()));
                for line in proto.active_lines() {
                    active.borrow_mut().set(LuaValue::Integer(line as i64), LuaValue::Boolean(true)).unwrap();
                }
                setf!("activelines", LuaValue::Table(active));
            }
        }
        None => {
            if what.contains('S') {
                setf!("source", LuaValue::Str(state.interner.intern_str("=[C]")));
                setf!("short_src", LuaValue::Str(state.interner.intern_str("[C]")));
                setf!("what", LuaValue::Str(state.interner.intern_str("C")));
                setf!("linedefined", LuaValue::Integer(-1));
                setf!("lastlinedefined", LuaValue::Integer(-1));
            }
            if what.contains('l') {
                setf!("currentline", LuaValue::Integer(-1));
            }
            if what.contains('u') {
                setf!("nups", LuaValue::Integer(closure.upvalues.borrow().len() as i64));
                setf!("nparams", LuaValue::Integer(0));
                setf!("isvararg", LuaValue::Boolean(true));
            }
            if what.contains('L') {
                setf!("activelines", LuaValue::Table(Rc::new(RefCell::new(LuaTable::new()))));
            }
        }
    }
    if what.contains('t') {
        let is_tail = matches!(resolved, InfoTarget::Frame { is_tail: true, .. });
        setf!("istailcall", LuaValue::Boolean(is_tail));
    }
    if what.contains('r') {
        // Transfer-register tracking is not implemented; reported as empty.
        setf!("ftransfer", LuaValue::Integer(0));
        setf!("ntransfer", LuaValue::Integer(0));
    }
    Ok(LuaValue::Table(table))
}

/// `getlocal(level, i)` / `getlocal(thread, level, i)`.
pub fn getlocal(state: &mut VmState, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
    let (thread, rest) = split_thread_arg(state, args);
    let level = rest.first().and_then(|v| v.as_integer_exact()).unwrap_or(0);
    let i = rest.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(0);
    let idx = match frame_index_for_level(&thread, level) {
        Some(idx) => idx,
        None => return Ok(vec![LuaValue::Nil]),
    };
    let t = thread.borrow();
    let frame = &t.frames[idx];
    if i < 0 {
        let vi = (-i - 1) as usize;
        return match frame.varargs.get(vi) {
            Some(v) => Ok(vec![LuaValue::Str(state.interner.intern_str("(vararg)")), v.clone()]),
            None => Ok(vec![LuaValue::Nil]),
        };
    }
    let proto = match frame.closure.proto() {
        Some(p) => p,
        None => return Ok(vec![LuaValue::Nil]),
    };
    let mut active: Vec<_> = proto
        .locals
        .iter()
        .filter(|l| (l.first_pc as usize) <= frame.pc && frame.pc <= l.last_pc as usize)
        .collect();
    active.sort_by_key(|l| l.register);
    match active.get((i - 1) as usize) {
        Some(local) => {
            let value = t.registers[frame.base + local.register as usize].clone();
            Ok(vec![LuaValue::Str(state.interner.intern_str(&local.name)), value])
        }
        None => Ok(vec![LuaValue::Nil]),
    }
}

/// `setlocal(level, i, value)` / `setlocal(thread, level, i, value)`;
/// returns the local's name, or nil if there is no such local.
pub fn setlocal(state: &mut VmState, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
    let (thread, rest) = split_thread_arg(state, args);
    let level = rest.first().and_then(|v| v.as_integer_exact()).unwrap_or(0);
    let i = rest.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(0);
    let value = rest.get(2).cloned().unwrap_or(LuaValue::Nil);
    let idx = match frame_index_for_level(&thread, level) {
        Some(idx) => idx,
        None => return Ok(vec![LuaValue::Nil]),
    };
    let mut t = thread.borrow_mut();
    let (base, register, name) = {
        let frame = &t.frames[idx];
        let proto = match frame.closure.proto() {
            Some(p) => p,
            None => return Ok(vec![LuaValue::Nil]),
        };
        let mut active: Vec<_> = proto
            .locals
            .iter()
            .filter(|l| (l.first_pc as usize) <= frame.pc && frame.pc <= l.last_pc as usize)
            .collect();
        active.sort_by_key(|l| l.register);
        match active.get((i - 1) as usize) {
            Some(local) => (frame.base, local.register as usize, local.name.clone()),
            None => return Ok(vec![LuaValue::Nil]),
        }
    };
    t.registers[base + register] = value;
    drop(t);
    Ok(vec![LuaValue::Str(state.interner.intern_str(&name))])
}

fn read_upvalue_cell(cell: &crate::value::closure::Upvalue) -> LuaValue {
    match &*cell.borrow() {
        UpvalueCell::Closed(v) => v.clone(),
        UpvalueCell::Open { thread, index } => match thread.upgrade() {
            Some(owner) => owner.borrow().registers[*index].clone(),
            None => LuaValue::Nil,
        },
    }
}

fn write_upvalue_cell(cell: &crate::value::closure::Upvalue, v: LuaValue) {
    match &mut *cell.borrow_mut() {
        UpvalueCell::Closed(slot) => *slot = v,
        UpvalueCell::Open { thread, index } => {
            if let Some(owner) = thread.upgrade() {
                owner.borrow_mut().registers[*index] = v;
            }
        }
    }
}

pub fn getupvalue(closure: &Rc<Closure>, i: i64) -> Option<(String, LuaValue)> {
    if i < 1 || i as usize > closure.upvalues.borrow().len() {
        return None;
    }
    let idx = (i - 1) as usize;
    let name = closure.upvalue_names.get(idx).cloned().unwrap_or_default();
    let value = read_upvalue_cell(&closure.upvalues.borrow()[idx]);
    Some((name, value))
}

pub fn setupvalue(closure: &Rc<Closure>, i: i64, value: LuaValue) -> Option<String> {
    if i < 1 || i as usize > closure.upvalues.borrow().len() {
        return None;
    }
    let idx = (i - 1) as usize;
    write_upvalue_cell(&closure.upvalues.borrow()[idx], value);
    Some(closure.upvalue_names.get(idx).cloned().unwrap_or_default())
}

/// Cell identity: equal only when two closures share the same upvalue
/// cell (including after [`upvaluejoin`]).
pub fn upvalueid(closure: &Rc<Closure>, i: i64) -> Option<i64> {
    if i < 1 || i as usize > closure.upvalues.borrow().len() {
        return None;
    }
    let cell = &closure.upvalues.borrow()[(i - 1) as usize];
    Some(Rc::as_ptr(cell) as i64)
}

pub fn upvaluejoin(f1: &Rc<Closure>, n1: i64, f2: &Rc<Closure>, n2: i64) -> bool {
    let len1 = f1.upvalues.borrow().len();
    let len2 = f2.upvalues.borrow().len();
    if n1 < 1 || n1 as usize > len1 || n2 < 1 || n2 as usize > len2 {
        return false;
    }
    let cell = f2.upvalues.borrow()[(n2 - 1) as usize].clone();
    f1.upvalues.borrow_mut()[(n1 - 1) as usize] = cell;
    true
}

pub fn sethook(state: &mut VmState, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
    let (_thread, rest) = split_thread_arg(state, args);
    if rest.is_empty() || rest[0].is_nil() {
        state.hooks.callback = None;
        state.hooks.mask = HookMask::default();
        return Ok(vec![]);
    }
    let hook = rest[0].clone();
    let mask_str = rest.get(1).and_then(|v| v.as_str_bytes()).unwrap_or(b"");
    let count = rest.get(2).and_then(|v| v.as_integer_exact()).unwrap_or(0);
    let mask = HookMask {
        call: mask_str.contains(&b'c'),
        return_: mask_str.contains(&b'r'),
        line: mask_str.contains(&b'l'),
        count: count > 0,
    };
    state.hooks.callback = Some(hook);
    state.hooks.mask = mask;
    state.hooks.count = count as i32;
    state.hooks.count_remaining = count.max(1) as i32;
    Ok(vec![])
}

pub fn gethook(state: &mut VmState, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
    let (_thread, _rest) = split_thread_arg(state, args);
    match &state.hooks.callback {
        None => Ok(vec![LuaValue::Nil]),
        Some(cb) => {
            let mut mask = String::new();
            if state.hooks.mask.call {
                mask.push('c');
            }
            if state.hooks.mask.return_ {
                mask.push('r');
            }
            if state.hooks.mask.line {
                mask.push('l');
            }
            Ok(vec![
                cb.clone(),
                LuaValue::Str(state.interner.intern_str(&mask)),
                LuaValue::Integer(state.hooks.count as i64),
            ])
        }
    }
}

fn format_frame_line(frame: &Frame, is_main: bool) -> String {
    match &frame.closure.kind {
        ClosureKind::Host { name: Some(n), .. } => format!("\t[C]: in function '{n}'"),
        ClosureKind::Host { name: None, .. } => "\t[C]: in ?".to_string(),
        ClosureKind::Intrinsic(_) => match frame.closure.upvalue_names.first() {
            Some(n) if !n.is_empty() => format!("\t[C]: in function '{n}'"),
            _ => "\t[C]: in ?".to_string(),
        },
        ClosureKind::Lua(proto) => {
            let line = proto.line_at(frame.pc.saturating_sub(1)).map(|l| l.to_string()).unwrap_or_else(|| "?".to_string());
            let loc = format!("{}:{}", short_src(&proto.source), line);
            let what = if is_main {
                "main chunk".to_string()
            } else {
                format!("function <{}:{}>", short_src(&proto.source), proto.line_defined)
            };
            format!("\t{loc}: in {what}")
        }
    }
}

/// `debug.traceback([thread,] message, level)`.
pub fn traceback(state: &mut VmState, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
    let (thread, rest) = split_thread_arg(state, args);
    let message = rest.first().cloned().unwrap_or(LuaValue::Nil);
    if !message.is_nil() && !matches!(message, LuaValue::Str(_)) {
        return Ok(vec![message]);
    }
    let level = rest.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(1);

    let dead_snapshot = {
        let t = thread.borrow();
        if matches!(t.status, CoroutineStatus::Dead) { t.dead_traceback.clone() } else { None }
    };
    if let Some(body) = dead_snapshot {
        let mut out = String::new();
        if let LuaValue::Str(s) = &message {
            out.push_str(&String::from_utf8_lossy(s));
            out.push('\n');
        }
        out.push_str(&body);
        return Ok(vec![LuaValue::Str(state.interner.intern(out.as_bytes()))]);
    }

    let mut out = String::new();
    if let LuaValue::Str(s) = &message {
        out.push_str(&String::from_utf8_lossy(s));
        out.push('\n');
    }
    out.push_str("stack traceback:");

    let mut lines = Vec::new();
    if level <= 0 {
        lines.push("\t[C]: in function 'traceback'".to_string());
    }
    let skip = if level > 0 { (level - 1) as usize } else { 0 };
    let t = thread.borrow();
    let n = t.frames.len();
    if skip < n {
        for idx in (0..=(n - 1 - skip)).rev() {
            lines.push(format_frame_line(&t.frames[idx], idx == 0));
        }
    }
    let explicit_thread = matches!(args.first(), Some(LuaValue::Thread(_)));
    let is_main = state.is_main_thread(&thread);
    drop(t);

    const HEAD: usize = 10;
    const TAIL: usize = 11;
    if lines.len() > HEAD + TAIL + 1 {
        let skipped = lines.len() - HEAD - TAIL;
        let mut truncated: Vec<String> = lines[..HEAD].to_vec();
        truncated.push(format!("\t...\t(skipping {skipped} levels)"));
        truncated.extend_from_slice(&lines[lines.len() - TAIL..]);
        lines = truncated;
    }

    for line in &lines {
        out.push('\n');
        out.push_str(line);
    }
    if !explicit_thread || is_main {
        out.push_str("\n\t[C]: in ?");
    }

    Ok(vec![LuaValue::Str(state.interner.intern(out.as_bytes()))])
}

/// Renders every live frame of `thread` as a traceback string, for
/// capture at the moment an error is raised (before unwinding discards
/// the frames that produced it). Used by the execute loop and by the
/// top-level `Vm` error boundary; not exposed to Lua directly (that's
/// [`traceback`], which adds message/level handling).
pub fn capture_traceback(thread: &Rc<RefCell<LuaThread>>) -> String {
    let t = thread.borrow();
    let mut out = String::from("stack traceback:");
    let n = t.frames.len();
    for idx in (0..n).rev() {
        out.push('\n');
        out.push_str(&format_frame_line(&t.frames[idx], idx == 0));
    }
    out.push_str("\n\t[C]: in ?");
    out
}

pub fn getregistry(state: &mut VmState) -> LuaValue {
    LuaValue::Table(state.registry.clone())
}

/// Builds the `debug` global table.
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

    set_host!("getinfo", |state: &mut VmState, args: &[LuaValue]| {
        let (thread, rest) = split_thread_arg(state, args);
        let _ = thread;
        let target = rest.first().cloned().unwrap_or(LuaValue::Integer(1));
        let what = rest.get(1).and_then(|v| v.as_str_bytes()).map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_else(|| "nSluf".to_string());
        Ok(vec![getinfo(state, &target, &what)?])
    });

    set_host!("getlocal", getlocal);
    set_host!("setlocal", setlocal);

    set_host!("getupvalue", |state: &mut VmState, args: &[LuaValue]| {
        let closure = match args.first() {
            Some(LuaValue::Function(c)) => c.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'getupvalue' (function expected)"),
        };
        let i = args.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(0);
        match getupvalue(&closure, i) {
            Some((name, value)) => Ok(vec![LuaValue::Str(state.interner.intern_str(&name)), value]),
            None => Ok(vec![LuaValue::Nil]),
        }
    });

    set_host!("setupvalue", |state: &mut VmState, args: &[LuaValue]| {
        let closure = match args.first() {
            Some(LuaValue::Function(c)) => c.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'setupvalue' (function expected)"),
        };
        let i = args.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(0);
        let value = args.get(2).cloned().unwrap_or(LuaValue::Nil);
        match setupvalue(&closure, i, value) {
            Some(name) => Ok(vec![LuaValue::Str(state.interner.intern_str(&name))]),
            None => Ok(vec![LuaValue::Nil]),
        }
    });

    set_host!("upvalueid", |state: &mut VmState, args: &[LuaValue]| {
        let closure = match args.first() {
            Some(LuaValue::Function(c)) => c.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'upvalueid' (function expected)"),
        };
        let i = args.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(0);
        match upvalueid(&closure, i) {
            Some(id) => Ok(vec![LuaValue::Integer(id)]),
            None => Ok(vec![LuaValue::Nil]),
        }
    });

    set_host!("upvaluejoin", |state: &mut VmState, args: &[LuaValue]| {
        let f1 = match args.first() {
            Some(LuaValue::Function(c)) => c.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'upvaluejoin' (function expected)"),
        };
        let n1 = args.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(0);
        let f2 = match args.get(2) {
            Some(LuaValue::Function(c)) => c.clone(),
            _ => return runtime_error(state, "bad argument #3 to 'upvaluejoin' (function expected)"),
        };
        let n2 = args.get(3).and_then(|v| v.as_integer_exact()).unwrap_or(0);
        if upvaluejoin(&f1, n1, &f2, n2) {
            Ok(vec![])
        } else {
            runtime_error(state, "invalid upvalue index")
        }
    });

    set_host!("sethook", sethook);
    set_host!("gethook", gethook);
    set_host!("traceback", traceback);

    set_host!("getregistry", |state: &mut VmState, _args: &[LuaValue]| { Ok(vec![getregistry(state)]) });

    set_host!("setmetatable", |state: &mut VmState, args: &[LuaValue]| {
        let target = match args.first() {
            Some(LuaValue::Table(t)) => t.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'setmetatable' (table expected)"),
        };
        match args.get(1) {
            Some(LuaValue::Table(m)) => target.borrow_mut().metatable = Some(m.clone()),
            _ => target.borrow_mut().metatable = None,
        }
        Ok(vec![LuaValue::Table(target)])
    });

    set_host!("getmetatable", |state: &mut VmState, args: &[LuaValue]| {
        let v = args.first().cloned().unwrap_or(LuaValue::Nil);
        match crate::vm::metamethod::metatable_of(&v, state) {
            Some(m) => Ok(vec![LuaValue::Table(m)]),
            None => Ok(vec![LuaValue::Nil]),
        }
    });

    t
}
