//! Compiler front end: lexing, parsing, and code generation combined
//! into one pass that produces a ready-to-run [`Proto`].

pub mod func_state;
pub mod opcode;
pub mod parser;

use crate::error::{LuaError, LuaResult};
use crate::value::closure::Proto;
use parser::Parser;
use std::rc::Rc;

/// Compiles Lua source into a main-chunk prototype, ready to be wrapped
/// in a [`crate::value::closure::Closure`] and called.
pub fn compile(source: &[u8], chunk_name: &str) -> LuaResult<Rc<Proto>> {
    let source = strip_shebang(source);
    let parser = Parser::new(source, chunk_name).map_err(|e| {
        LuaError::Syntax(format!("{}:{}: {}", chunk_name, e.line, e.message))
    })?;
    parser
        .parse_main_chunk()
        .map_err(|e| LuaError::Syntax(format!("{}:{}: {}", chunk_name, e.line, e.message)))
}

fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        match source.iter().position(|&b| b == b'\n') {
            Some(i) => &source[i..],
            None => b"",
        }
    } else {
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiles(src: &str) {
        compile(src.as_bytes(), "test").unwrap_or_else(|e| panic!("{}: {:?}", src, e));
    }

    #[test]
    fn compiles_empty_chunk() {
        compiles("");
    }

    #[test]
    fn compiles_local_and_arith() {
        compiles("local x = 1 + 2 * 3 return x");
    }

    #[test]
    fn compiles_if_while_for() {
        compiles(
            r#"
            local t = {}
            for i = 1, 10 do
                if i % 2 == 0 then
                    t[i] = i
                else
                    t[i] = -i
                end
            end
            local i = 1
            while i < 10 do i = i + 1 end
            return t
            "#,
        );
    }

    #[test]
    fn compiles_function_and_closure() {
        compiles(
            r#"
            local function counter()
                local n = 0
                return function()
                    n = n + 1
                    return n
                end
            end
            local c = counter()
            return c(), c(), c()
            "#,
        );
    }

    #[test]
    fn compiles_generic_for_and_methods() {
        compiles(
            r#"
            local obj = {}
            function obj:greet(name)
                return "hi " .. name
            end
            for k, v in pairs(obj) do
                print(k, v)
            end
            return obj:greet("world")
            "#,
        );
    }

    #[test]
    fn rejects_const_assignment() {
        let err = compile(b"local x <const> = 1 x = 2", "test").unwrap_err();
        match err {
            LuaError::Syntax(msg) => assert!(msg.contains("const")),
            _ => panic!("expected syntax error"),
        }
    }

    #[test]
    fn compiles_goto_label() {
        compiles(
            r#"
            local i = 0
            ::top::
            i = i + 1
            if i < 5 then goto top end
            return i
            "#,
        );
    }
}
