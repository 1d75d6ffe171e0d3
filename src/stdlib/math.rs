//! `math` library: the contract the core itself depends on
//! (`math.type`) plus the handful of constants every arithmetic test
//! against `i64`/`f64` boundaries needs (`maxinteger`, `mininteger`,
//! `huge`, `pi`). Transcendental functions and `math.random` are stdlib
//! body concerns and out of scope here.

use crate::error::LuaResult;
use crate::value::{Closure, LuaTable, LuaValue};
use crate::vm::state::VmState;
use std::cell::RefCell;
use std::rc::Rc;

pub fn install(state: &mut VmState) -> Rc<RefCell<LuaTable>> {
    let t = Rc::new(RefCell::new(LuaTable::new()));
    macro_rules! set_val {
        ($name:expr, $v:expr) => {
            t.borrow_mut().set(LuaValue::Str(state.interner.intern_str($name)), $v).unwrap();
        };
    }

    set_val!("maxinteger", LuaValue::Integer(i64::MAX));
    set_val!("mininteger", LuaValue::Integer(i64::MIN));
    set_val!("huge", LuaValue::Number(f64::INFINITY));
    set_val!("pi", LuaValue::Number(std::f64::consts::PI));

    t.borrow_mut()
        .set(
            LuaValue::Str(state.interner.intern_str("type")),
            LuaValue::Function(Closure::new_host(Some("type"), Rc::new(|state: &mut VmState, args: &[LuaValue]| -> LuaResult<Vec<LuaValue>> {
                let name = args.first().and_then(|v| v.math_type());
                Ok(vec![match name {
                    Some(n) => LuaValue::Str(state.interner.intern_str(n)),
                    None => LuaValue::Nil,
                }])
            }))),
        )
        .unwrap();

    t
}

#[cfg(test)]
mod tests {
    use crate::value::LuaValue;
    use crate::vm::Vm;

    #[test]
    fn math_type_distinguishes_integer_and_float() {
        let mut vm = Vm::new();
        let r = vm.exec(b"return math.type(1), math.type(1.0), math.type('x')", "t").unwrap();
        assert!(matches!(&r[0], LuaValue::Str(s) if s.as_ref() == b"integer"));
        assert!(matches!(&r[1], LuaValue::Str(s) if s.as_ref() == b"float"));
        assert!(matches!(&r[2], LuaValue::Nil));
    }
}
