//! Standard-library surface: the thin contract functions the core
//! engine itself depends on (`type`, `pcall`, `select`, `coroutine.*`,
//! `debug.*`, …), installed into a fresh `VmState`'s globals table.
//! Full library *bodies* (`string` pattern matching, `table.sort`,
//! `io`/`os`) are client-code concerns outside the core engine.

pub mod basic;
pub mod math;
pub mod string;

use crate::value::LuaValue;
use crate::vm::state::VmState;

/// Populates `state.globals` with the basic/`coroutine`/`debug`/`math`/
/// `string` tables and wires the string default metatable's `__index`
/// to the `string` table so `("x"):upper()` dispatches correctly.
pub fn install(state: &mut VmState) {
    basic::install(state);

    let coroutine_table = crate::vm::coroutine::install(state);
    let debug_table = crate::vm::debug::install(state);
    let math_table = math::install(state);
    let string_table = string::install(state);

    let string_mt = crate::value::LuaTable::new();
    let string_mt = std::rc::Rc::new(std::cell::RefCell::new(string_mt));
    string_mt
        .borrow_mut()
        .set(LuaValue::Str(state.interner.intern_str("__index")), LuaValue::Table(string_table.clone()))
        .unwrap();
    state.string_metatable = Some(string_mt);

    let g = state.globals.clone();
    let mut globals = g.borrow_mut();
    globals.set(LuaValue::Str(state.interner.intern_str("coroutine")), LuaValue::Table(coroutine_table)).unwrap();
    globals.set(LuaValue::Str(state.interner.intern_str("debug")), LuaValue::Table(debug_table)).unwrap();
    globals.set(LuaValue::Str(state.interner.intern_str("math")), LuaValue::Table(math_table)).unwrap();
    globals.set(LuaValue::Str(state.interner.intern_str("string")), LuaValue::Table(string_table)).unwrap();
    drop(globals);
    globals_self_reference(state);
}

/// Lua's `_G` is the globals table itself, reachable as a key inside
/// itself — set after the rest of `install` so `_G._G.print` (etc.)
/// resolves without a separate bootstrap pass.
fn globals_self_reference(state: &mut VmState) {
    let g = state.globals.clone();
    g.borrow_mut().set(LuaValue::Str(state.interner.intern_str("_G")), LuaValue::Table(g.clone())).unwrap();
}
