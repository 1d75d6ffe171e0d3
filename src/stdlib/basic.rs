//! `_G` basic functions: the contracts the core itself depends on
//! (`type`, `pcall`, `select`, `error`, …) plus `load`, since loading a
//! new chunk is squarely a core concern even though the reader-function
//! variant and file I/O around it are not.

use crate::error::{LuaError, LuaResult};
use crate::value::closure::{ClosureKind, Intrinsic};
use crate::value::{display_value_raw, Closure, LuaTable, LuaValue};
use crate::vm::execute::call_value;
use crate::vm::load::{self, parse_number_str};
use crate::vm::metamethod::{get_metamethod, metatable_of, MetaEvent};
use crate::vm::state::VmState;
use std::cell::RefCell;
use std::rc::Rc;

fn runtime_error<T>(state: &mut VmState, msg: &str) -> LuaResult<T> {
    state.set_error(LuaValue::Str(Rc::from(msg.as_bytes())));
    Err(LuaError::Runtime)
}

fn arg(args: &[LuaValue], i: usize) -> LuaValue {
    args.get(i).cloned().unwrap_or(LuaValue::Nil)
}

/// `tostring`, honoring `__tostring` and falling back to `__name` for
/// the default `type: 0xADDR` rendering of tables/userdata.
pub fn lua_tostring(state: &mut VmState, v: &LuaValue) -> LuaResult<LuaValue> {
    if let Some(m) = get_metamethod(v, MetaEvent::ToString, state) {
        let thread = state.current_thread.clone();
        let mut results = call_value(state, &thread, &m, vec![v.clone()])?;
        return Ok(if results.is_empty() { LuaValue::Nil } else { results.remove(0) });
    }
    if let LuaValue::Table(_) | LuaValue::UserData(_) = v {
        if let Some(mt) = metatable_of(v, state) {
            let name = mt.borrow().get(&LuaValue::Str(state.interner.intern_str("__name")));
            if let LuaValue::Str(n) = name {
                let addr = match v {
                    LuaValue::Table(t) => Rc::as_ptr(t) as usize,
                    LuaValue::UserData(u) => Rc::as_ptr(u) as usize,
                    _ => 0,
                };
                return Ok(LuaValue::Str(state.interner.intern(format!("{}: {:#x}", String::from_utf8_lossy(&n), addr).as_bytes())));
            }
        }
    }
    Ok(LuaValue::Str(state.interner.intern(display_value_raw(v).as_bytes())))
}

/// Prefixes a string error message with `short_src:line:` the way
/// `error(msg, level)` does for `level >= 1` and a string message.
fn add_position(state: &mut VmState, msg: String, level: i64) -> LuaValue {
    if level <= 0 {
        return LuaValue::Str(state.interner.intern(msg.as_bytes()));
    }
    let thread = state.current_thread.clone();
    let t = thread.borrow();
    // Level 1 is the function that called `error`, i.e. the frame
    // beneath the `error` call itself (error never pushes its own
    // frame — it runs as a host function with the caller still on top).
    let idx = t.frames.len().checked_sub(level as usize);
    let Some(idx) = idx else {
        drop(t);
        return LuaValue::Str(state.interner.intern(msg.as_bytes()));
    };
    let Some(frame) = t.frames.get(idx) else {
        drop(t);
        return LuaValue::Str(state.interner.intern(msg.as_bytes()));
    };
    let located = match &frame.closure.kind {
        ClosureKind::Lua(proto) => {
            let line = proto.line_at(frame.pc.saturating_sub(1)).map(|l| l.to_string()).unwrap_or_else(|| "?".to_string());
            format!("{}:{}: {}", crate::vm::debug::short_src(&proto.source), line, msg)
        }
        _ => msg,
    };
    drop(t);
    LuaValue::Str(state.interner.intern(located.as_bytes()))
}

pub fn install(state: &mut VmState) {
    let g = state.globals.clone();
    macro_rules! set_host {
        ($name:expr, $f:expr) => {
            g.borrow_mut()
                .set(
                    LuaValue::Str(state.interner.intern_str($name)),
                    LuaValue::Function(Closure::new_host(Some($name), Rc::new($f))),
                )
                .unwrap();
        };
    }
    macro_rules! set_val {
        ($name:expr, $v:expr) => {
            g.borrow_mut().set(LuaValue::Str(state.interner.intern_str($name)), $v).unwrap();
        };
    }

    set_val!("_VERSION", LuaValue::Str(state.interner.intern_str("Lua 5.4")));

    set_host!("type", |state: &mut VmState, args: &[LuaValue]| {
        if args.is_empty() {
            return runtime_error(state, "bad argument #1 to 'type' (value expected)");
        }
        Ok(vec![LuaValue::Str(state.interner.intern_str(args[0].type_name()))])
    });

    set_host!("tostring", |state: &mut VmState, args: &[LuaValue]| {
        let v = arg(args, 0);
        Ok(vec![lua_tostring(state, &v)?])
    });

    set_host!("tonumber", |state: &mut VmState, args: &[LuaValue]| {
        let v = arg(args, 0);
        match args.get(1) {
            None | Some(LuaValue::Nil) => match &v {
                LuaValue::Integer(_) | LuaValue::Number(_) => Ok(vec![v]),
                LuaValue::Str(s) => Ok(vec![parse_number_str(s).unwrap_or(LuaValue::Nil)]),
                _ => Ok(vec![LuaValue::Nil]),
            },
            Some(base_v) => {
                let base = base_v.as_integer_exact().unwrap_or(10);
                let s = match &v {
                    LuaValue::Str(s) => s.clone(),
                    _ => return runtime_error(state, "bad argument #1 to 'tonumber' (string expected)"),
                };
                let text = String::from_utf8_lossy(&s);
                let text = text.trim();
                if !(2..=36).contains(&base) {
                    return runtime_error(state, "bad argument #2 to 'tonumber' (base out of range)");
                }
                match i64::from_str_radix(text, base as u32) {
                    Ok(i) => Ok(vec![LuaValue::Integer(i)]),
                    Err(_) => Ok(vec![LuaValue::Nil]),
                }
            }
        }
    });

    set_host!("rawget", |state: &mut VmState, args: &[LuaValue]| {
        match args.first() {
            Some(LuaValue::Table(t)) => Ok(vec![t.borrow().get(&arg(args, 1))]),
            _ => runtime_error(state, "bad argument #1 to 'rawget' (table expected)"),
        }
    });

    set_host!("rawset", |state: &mut VmState, args: &[LuaValue]| {
        match args.first() {
            Some(LuaValue::Table(t)) => {
                let t = t.clone();
                let result = t.borrow_mut().set(arg(args, 1), arg(args, 2));
                match result {
                    Ok(()) => Ok(vec![LuaValue::Table(t)]),
                    Err(msg) => runtime_error(state, msg),
                }
            }
            _ => runtime_error(state, "bad argument #1 to 'rawset' (table expected)"),
        }
    });

    set_host!("rawequal", |_state: &mut VmState, args: &[LuaValue]| { Ok(vec![LuaValue::Boolean(arg(args, 0).raw_eq(&arg(args, 1)))]) });

    set_host!("rawlen", |state: &mut VmState, args: &[LuaValue]| {
        match args.first() {
            Some(LuaValue::Table(t)) => Ok(vec![LuaValue::Integer(t.borrow().len())]),
            Some(LuaValue::Str(s)) => Ok(vec![LuaValue::Integer(s.len() as i64)]),
            _ => runtime_error(state, "table or string expected"),
        }
    });

    set_host!("next", |state: &mut VmState, args: &[LuaValue]| {
        match args.first() {
            Some(LuaValue::Table(t)) => match t.borrow().next(&arg(args, 1)) {
                Ok(Some((k, v))) => Ok(vec![k, v]),
                Ok(None) => Ok(vec![LuaValue::Nil]),
                Err(msg) => runtime_error(state, msg),
            },
            _ => runtime_error(state, "bad argument #1 to 'next' (table expected)"),
        }
    });

    set_host!("ipairs", |state: &mut VmState, args: &[LuaValue]| {
        let t = match args.first() {
            Some(t @ LuaValue::Table(_)) => t.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'ipairs' (table expected)"),
        };
        let iter = Closure::new_host(Some("ipairs_iterator"), Rc::new(|_state: &mut VmState, args: &[LuaValue]| {
            let t = match args.first() {
                Some(LuaValue::Table(t)) => t.clone(),
                _ => return Ok(vec![LuaValue::Nil]),
            };
            let i = arg(args, 1).as_integer_exact().unwrap_or(0) + 1;
            let v = t.borrow().get_int(i);
            if v.is_nil() {
                Ok(vec![LuaValue::Nil])
            } else {
                Ok(vec![LuaValue::Integer(i), v])
            }
        }));
        Ok(vec![LuaValue::Function(iter), t, LuaValue::Integer(0)])
    });

    set_host!("pairs", |state: &mut VmState, args: &[LuaValue]| {
        let t = match args.first() {
            Some(t @ LuaValue::Table(_)) => t.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'pairs' (table expected)"),
        };
        if let Some(m) = get_metamethod(&t, MetaEvent::Pairs, state) {
            let thread = state.current_thread.clone();
            return call_value(state, &thread, &m, vec![t]);
        }
        let next_fn = state.globals.borrow().get(&LuaValue::Str(state.interner.intern_str("next")));
        Ok(vec![next_fn, t, LuaValue::Nil])
    });

    set_host!("select", |state: &mut VmState, args: &[LuaValue]| {
        match args.first() {
            Some(LuaValue::Str(s)) if s.as_ref() == b"#" => Ok(vec![LuaValue::Integer(args.len() as i64 - 1)]),
            Some(v) => {
                let n = match v.as_integer_exact() {
                    Some(n) => n,
                    None => return runtime_error(state, "bad argument #1 to 'select' (number expected)"),
                };
                let rest = &args[1..];
                if n < 0 {
                    let from = rest.len() as i64 + n;
                    if from < 0 {
                        return runtime_error(state, "bad argument #1 to 'select' (index out of range)");
                    }
                    Ok(rest[from as usize..].to_vec())
                } else if n == 0 {
                    runtime_error(state, "bad argument #1 to 'select' (index out of range)")
                } else {
                    let from = (n as usize - 1).min(rest.len());
                    Ok(rest[from..].to_vec())
                }
            }
            None => runtime_error(state, "bad argument #1 to 'select' (number expected, got no value)"),
        }
    });

    set_host!("error", |state: &mut VmState, args: &[LuaValue]| {
        let v = arg(args, 0);
        let level = args.get(1).and_then(|l| l.as_integer_exact()).unwrap_or(1);
        let located = match v {
            LuaValue::Str(s) => add_position(state, String::from_utf8_lossy(&s).into_owned(), level),
            other => other,
        };
        state.set_error(located);
        Err(LuaError::Runtime)
    });

    set_host!("assert", |state: &mut VmState, args: &[LuaValue]| {
        if arg(args, 0).is_truthy() {
            return Ok(args.to_vec());
        }
        let msg = match args.get(1) {
            Some(v) => v.clone(),
            None => LuaValue::Str(state.interner.intern_str("assertion failed!")),
        };
        state.set_error(msg);
        Err(LuaError::Runtime)
    });

    g.borrow_mut()
        .set(LuaValue::Str(state.interner.intern_str("pcall")), LuaValue::Function(Closure::new_intrinsic("pcall", Intrinsic::PCall)))
        .unwrap();
    g.borrow_mut()
        .set(LuaValue::Str(state.interner.intern_str("xpcall")), LuaValue::Function(Closure::new_intrinsic("xpcall", Intrinsic::XPCall)))
        .unwrap();

    set_host!("setmetatable", |state: &mut VmState, args: &[LuaValue]| {
        let target = match args.first() {
            Some(LuaValue::Table(t)) => t.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'setmetatable' (table expected)"),
        };
        if let Some(existing) = &target.borrow().metatable {
            let protected = existing.borrow().get(&LuaValue::Str(state.interner.intern_str("__metatable")));
            if !protected.is_nil() {
                return runtime_error(state, "cannot change a protected metatable");
            }
        }
        match args.get(1) {
            Some(LuaValue::Table(m)) => target.borrow_mut().metatable = Some(m.clone()),
            Some(LuaValue::Nil) | None => target.borrow_mut().metatable = None,
            _ => return runtime_error(state, "bad argument #2 to 'setmetatable' (nil or table expected)"),
        }
        Ok(vec![LuaValue::Table(target)])
    });

    set_host!("getmetatable", |state: &mut VmState, args: &[LuaValue]| {
        let v = arg(args, 0);
        match metatable_of(&v, state) {
            Some(m) => {
                let protected = m.borrow().get(&LuaValue::Str(state.interner.intern_str("__metatable")));
                Ok(vec![if protected.is_nil() { LuaValue::Table(m) } else { protected }])
            }
            None => Ok(vec![LuaValue::Nil]),
        }
    });

    set_host!("load", |state: &mut VmState, args: &[LuaValue]| {
        let chunk = match args.first() {
            Some(LuaValue::Str(s)) => s.to_vec(),
            Some(LuaValue::Function(f)) if !f.is_lua() => {
                // Reader function: call repeatedly until it returns nil/"".
                let thread = state.current_thread.clone();
                let mut buf = Vec::new();
                loop {
                    let piece = call_value(state, &thread, &LuaValue::Function(f.clone()), vec![])?;
                    match piece.into_iter().next() {
                        Some(LuaValue::Str(s)) if !s.is_empty() => buf.extend_from_slice(&s),
                        _ => break,
                    }
                }
                buf
            }
            _ => return runtime_error(state, "bad argument #1 to 'load' (string or function expected)"),
        };
        if chunk.first() == Some(&b'#') {
            return Ok(vec![LuaValue::Nil, LuaValue::Str(state.interner.intern_str("load: shebang not allowed"))]);
        }
        let chunk_name = match args.get(1) {
            Some(LuaValue::Str(s)) => String::from_utf8_lossy(s).into_owned(),
            _ => {
                let mut preview: Vec<u8> = chunk.iter().take(60).copied().collect();
                preview.retain(|&b| b != b'\n');
                format!("[string \"{}\"]", String::from_utf8_lossy(&preview))
            }
        };
        let env = match args.get(3) {
            Some(LuaValue::Table(t)) => t.clone(),
            _ => state.globals.clone(),
        };
        let proto = if chunk.first() == Some(&load::MAGIC) {
            load::load_binary(&chunk)
        } else {
            crate::compiler::compile(&chunk, &chunk_name)
        };
        match proto {
            Ok(proto) => {
                let env_cell = Rc::new(RefCell::new(crate::value::closure::UpvalueCell::Closed(LuaValue::Table(env))));
                let closure = Closure::new_lua(proto, vec![env_cell]);
                Ok(vec![LuaValue::Function(closure)])
            }
            Err(LuaError::Syntax(msg)) => Ok(vec![LuaValue::Nil, LuaValue::Str(state.interner.intern(msg.as_bytes()))]),
            Err(_) => Ok(vec![LuaValue::Nil, LuaValue::Str(state.interner.intern_str("load: malformed chunk"))]),
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::vm::Vm;
    use crate::value::LuaValue;

    #[test]
    fn select_count_and_index() {
        let mut vm = Vm::new();
        let r = vm.exec(b"return select('#', 1,2,3)", "t").unwrap();
        assert!(matches!(r.as_slice(), [LuaValue::Integer(3)]));
        let r = vm.exec(b"return select(2, 'a','b','c')", "t").unwrap();
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn pcall_catches_error() {
        let mut vm = Vm::new();
        let r = vm.exec(b"return pcall(function() error('x') end)", "t").unwrap();
        assert!(matches!(r.first(), Some(LuaValue::Boolean(false))));
    }

    #[test]
    fn load_compiles_and_runs_new_chunk() {
        let mut vm = Vm::new();
        let r = vm.exec(b"local f = load('return 1+1') return f()", "t").unwrap();
        assert!(matches!(r.as_slice(), [LuaValue::Integer(2)]));
    }

    #[test]
    fn load_rejects_const_reassignment() {
        let mut vm = Vm::new();
        let r = vm
            .exec(b"local ok, err = load(\"local x <const> = 1; x = 2\") return ok == nil and err:find(\"const\") ~= nil", "t")
            .unwrap();
        assert!(matches!(r.as_slice(), [LuaValue::Boolean(true)]));
    }
}
