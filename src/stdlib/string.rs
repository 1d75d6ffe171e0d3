//! `string` library: only the handful of operations the core's own
//! test scenarios exercise directly (`dump`/`find`/`sub`/...) plus the
//! mechanism — the per-value default metatable — that lets `("x"):upper()`
//! dispatch through `__index` at all. A full Lua pattern-matching
//! engine is out of scope; `find`/`match`-style searches here are
//! plain substring search only.

use crate::error::{LuaError, LuaResult};
use crate::value::{Closure, LuaTable, LuaValue};
use crate::vm::load;
use crate::vm::state::VmState;
use std::cell::RefCell;
use std::rc::Rc;

fn runtime_error<T>(state: &mut VmState, msg: &str) -> LuaResult<T> {
    state.set_error(LuaValue::Str(Rc::from(msg.as_bytes())));
    Err(LuaError::Runtime)
}

fn str_arg<'a>(state: &mut VmState, args: &'a [LuaValue], i: usize, name: &str) -> LuaResult<std::borrow::Cow<'a, [u8]>> {
    match args.get(i) {
        Some(LuaValue::Str(s)) => Ok(std::borrow::Cow::Borrowed(s.as_ref())),
        Some(LuaValue::Integer(n)) => Ok(std::borrow::Cow::Owned(n.to_string().into_bytes())),
        Some(LuaValue::Number(n)) => Ok(std::borrow::Cow::Owned(crate::value::format_lua_float(*n).into_bytes())),
        _ => runtime_error(state, &format!("bad argument #{} to '{}' (string expected)", i + 1, name)),
    }
}

/// Normalizes a 1-based, possibly-negative Lua string index to a
/// 0-based byte offset clamped to `[0, len]`.
fn norm_index(i: i64, len: usize) -> usize {
    if i > 0 {
        ((i - 1) as usize).min(len)
    } else if i == 0 {
        0
    } else {
        len.saturating_sub((-i) as usize)
    }
}

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

    set_host!("len", |state: &mut VmState, args: &[LuaValue]| {
        let s = str_arg(state, args, 0, "len")?;
        Ok(vec![LuaValue::Integer(s.len() as i64)])
    });

    set_host!("sub", |state: &mut VmState, args: &[LuaValue]| {
        let s = str_arg(state, args, 0, "sub")?.into_owned();
        let len = s.len() as i64;
        let i = args.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(1);
        let j = args.get(2).and_then(|v| v.as_integer_exact()).unwrap_or(-1);
        let i = if i < 0 { (len + i + 1).max(1) } else { i.max(1) };
        let j = if j < 0 { len + j + 1 } else { j.min(len) };
        if i > j {
            return Ok(vec![LuaValue::Str(state.interner.intern_str(""))]);
        }
        let slice = &s[(i - 1) as usize..j as usize];
        Ok(vec![LuaValue::Str(state.interner.intern(slice))])
    });

    set_host!("upper", |state: &mut VmState, args: &[LuaValue]| {
        let s = str_arg(state, args, 0, "upper")?.into_owned();
        Ok(vec![LuaValue::Str(state.interner.intern(&s.to_ascii_uppercase()))])
    });

    set_host!("lower", |state: &mut VmState, args: &[LuaValue]| {
        let s = str_arg(state, args, 0, "lower")?.into_owned();
        Ok(vec![LuaValue::Str(state.interner.intern(&s.to_ascii_lowercase()))])
    });

    set_host!("rep", |state: &mut VmState, args: &[LuaValue]| {
        let s = str_arg(state, args, 0, "rep")?.into_owned();
        let n = args.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(0).max(0) as usize;
        let sep = match args.get(2) {
            Some(LuaValue::Str(sep)) => sep.to_vec(),
            _ => Vec::new(),
        };
        if n == 0 {
            return Ok(vec![LuaValue::Str(state.interner.intern_str(""))]);
        }
        let mut out = Vec::with_capacity(s.len() * n);
        for i in 0..n {
            if i > 0 {
                out.extend_from_slice(&sep);
            }
            out.extend_from_slice(&s);
        }
        Ok(vec![LuaValue::Str(state.interner.intern(&out))])
    });

    set_host!("byte", |state: &mut VmState, args: &[LuaValue]| {
        let s = str_arg(state, args, 0, "byte")?.into_owned();
        let len = s.len() as i64;
        let i = args.get(1).and_then(|v| v.as_integer_exact()).unwrap_or(1);
        let j = args.get(2).and_then(|v| v.as_integer_exact()).unwrap_or(i);
        let i = if i < 0 { (len + i + 1).max(1) } else { i.max(1) };
        let j = if j < 0 { len + j + 1 } else { j.min(len) };
        if i > j {
            return Ok(vec![]);
        }
        Ok(s[(i - 1) as usize..j as usize].iter().map(|b| LuaValue::Integer(*b as i64)).collect())
    });

    set_host!("char", |state: &mut VmState, args: &[LuaValue]| {
        let mut out = Vec::with_capacity(args.len());
        for a in args {
            match a.as_integer_exact() {
                Some(c) if (0..=255).contains(&c) => out.push(c as u8),
                _ => return runtime_error(state, "bad argument to 'char' (value out of range)"),
            }
        }
        Ok(vec![LuaValue::Str(state.interner.intern(&out))])
    });

    set_host!("find", |state: &mut VmState, args: &[LuaValue]| {
        let s = str_arg(state, args, 0, "find")?.into_owned();
        let pattern = str_arg(state, args, 1, "find")?.into_owned();
        let init = args.get(2).and_then(|v| v.as_integer_exact()).unwrap_or(1);
        let start = norm_index(if init == 0 { 1 } else { init }, s.len());
        if pattern.is_empty() {
            return Ok(vec![LuaValue::Integer(start as i64 + 1), LuaValue::Integer(start as i64)]);
        }
        match s[start.min(s.len())..].windows(pattern.len()).position(|w| w == pattern.as_slice()) {
            Some(pos) => {
                let from = start + pos;
                Ok(vec![LuaValue::Integer(from as i64 + 1), LuaValue::Integer((from + pattern.len()) as i64)])
            }
            None => Ok(vec![LuaValue::Nil]),
        }
    });

    set_host!("dump", |state: &mut VmState, args: &[LuaValue]| {
        let f = match args.first() {
            Some(LuaValue::Function(f)) if f.is_lua() => f.clone(),
            _ => return runtime_error(state, "bad argument #1 to 'dump' (Lua function expected)"),
        };
        let strip = matches!(args.get(1), Some(v) if v.is_truthy());
        let bytes = load::dump(f.proto().unwrap(), strip);
        Ok(vec![LuaValue::Str(state.interner.intern(&bytes))])
    });

    t
}

#[cfg(test)]
mod tests {
    use crate::value::LuaValue;
    use crate::vm::Vm;

    #[test]
    fn string_methods_dispatch_through_metatable() {
        let mut vm = Vm::new();
        let r = vm.exec(b"return ('hello'):upper()", "t").unwrap();
        assert!(matches!(&r[0], LuaValue::Str(s) if s.as_ref() == b"HELLO"));
    }

    #[test]
    fn find_locates_plain_substring() {
        let mut vm = Vm::new();
        let r = vm.exec(b"return ('attempt to assign'):find('to assign')", "t").unwrap();
        assert!(matches!(r.as_slice(), [LuaValue::Integer(_), LuaValue::Integer(_)]));
    }

    #[test]
    fn dump_and_load_round_trip() {
        let mut vm = Vm::new();
        let r = vm.exec(b"local f = function(x) return x+1 end local b = string.dump(f) local g = load(b) return g(41)", "t").unwrap();
        assert!(matches!(r.as_slice(), [LuaValue::Integer(42)]));
    }
}
