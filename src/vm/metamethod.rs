//! Metamethod resolution and dispatch: deciding which `__event` table
//! slot governs a given operation on a given value, and invoking it.

use crate::value::{LuaTable, LuaValue};
use crate::vm::state::VmState;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaEvent {
    Index,
    NewIndex,
    Call,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    Close,
    Gc,
    ToString,
    Name,
    Pairs,
    Metatable,
}

impl MetaEvent {
    pub fn name(self) -> &'static str {
        use MetaEvent::*;
        match self {
            Index => "__index",
            NewIndex => "__newindex",
            Call => "__call",
            Add => "__add",
            Sub => "__sub",
            Mul => "__mul",
            Div => "__div",
            Mod => "__mod",
            Pow => "__pow",
            IDiv => "__idiv",
            BAnd => "__band",
            BOr => "__bor",
            BXor => "__bxor",
            Shl => "__shl",
            Shr => "__shr",
            Unm => "__unm",
            BNot => "__bnot",
            Concat => "__concat",
            Len => "__len",
            Eq => "__eq",
            Lt => "__lt",
            Le => "__le",
            Close => "__close",
            Gc => "__gc",
            ToString => "__tostring",
            Name => "__name",
            Pairs => "__pairs",
            Metatable => "__metatable",
        }
    }
}

/// The value's *effective* metatable: its own for tables/userdata, the
/// per-type default for everything else (currently only strings carry
/// one; every other primitive type has a slot for a default metatable
/// but nothing in this engine ever populates it).
pub fn metatable_of(v: &LuaValue, state: &VmState) -> Option<Rc<RefCell<LuaTable>>> {
    match v {
        LuaValue::Table(t) => t.borrow().metatable.clone(),
        LuaValue::UserData(u) => u.borrow().metatable.clone(),
        LuaValue::Str(_) => state.string_metatable.clone(),
        _ => None,
    }
}

pub fn get_metamethod(v: &LuaValue, event: MetaEvent, state: &VmState) -> Option<LuaValue> {
    let mt = metatable_of(v, state)?;
    let key = LuaValue::Str(state_intern_static(event.name()));
    let m = mt.borrow().get(&key);
    if m.is_nil() {
        None
    } else {
        Some(m)
    }
}

/// Metamethod event names are fixed ASCII literals; interning them
/// fresh each lookup would be wasteful but correctness only requires
/// that the bytes compare equal, so a throwaway `Rc` is fine here —
/// `LuaTable::get` compares by content for string keys, not identity.
fn state_intern_static(s: &'static str) -> Rc<[u8]> {
    Rc::from(s.as_bytes())
}

/// Resolves the binary-arithmetic metamethod for `a OP b`: tries `a`
/// first, then `b` (Lua 5.4's rule — either operand may supply it).
pub fn binop_metamethod(a: &LuaValue, b: &LuaValue, event: MetaEvent, state: &VmState) -> Option<LuaValue> {
    get_metamethod(a, event, state).or_else(|| get_metamethod(b, event, state))
}
