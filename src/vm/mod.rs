//! Public entry point: the `Vm` struct ties the register-bytecode
//! compiler to the execute loop, seeds the global table with the
//! standard-library contracts the core depends on, and translates the
//! internal [`LuaError`]/[`LuaValue`] error representation into the
//! boundary-facing [`LuaFullError`] an embedder actually wants.

pub mod close;
pub mod coroutine;
pub mod debug;
pub mod execute;
pub mod load;
pub mod metamethod;
pub mod state;
pub mod thread;

use crate::compiler::compile;
use crate::error::{LuaError, LuaFullError, LuaResult};
use crate::value::closure::{Closure, Upvalue, UpvalueCell};
use crate::value::{display_value_raw, LuaTable, LuaValue};
use state::{VmConfig, VmState};
use std::cell::RefCell;
use std::rc::Rc;
use thread::LuaThread;

pub struct Vm {
    state: VmState,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        // The main thread needs *some* closure at construction; it is
        // never actually run as a coroutine body (the main thread is
        // driven by `exec`/`call`, not `resume`), so an empty chunk
        // stands in for it.
        let placeholder = compile(b"", "=(vm)").expect("empty chunk always compiles");
        let env_cell: Upvalue = Rc::new(RefCell::new(UpvalueCell::Closed(LuaValue::Nil)));
        let placeholder_closure = Closure::new_lua(placeholder, vec![env_cell]);
        let mut state = VmState::new(config, placeholder_closure);
        crate::stdlib::install(&mut state);
        Vm { state }
    }

    pub fn globals(&self) -> Rc<RefCell<LuaTable>> {
        self.state.globals.clone()
    }

    pub fn state_mut(&mut self) -> &mut VmState {
        &mut self.state
    }

    /// Compiles and runs `source` as a new main chunk closed over the
    /// current globals table, returning its results.
    pub fn exec(&mut self, source: &[u8], chunk_name: &str) -> Result<Vec<LuaValue>, LuaFullError> {
        let proto = compile(source, chunk_name).map_err(|e| self.to_full_error(e))?;
        let env_cell: Upvalue = Rc::new(RefCell::new(UpvalueCell::Closed(LuaValue::Table(self.state.globals.clone()))));
        let closure = Closure::new_lua(proto, vec![env_cell]);
        self.call(&LuaValue::Function(closure), Vec::new())
    }

    /// Calls an arbitrary Lua value (typically a closure obtained from
    /// a previous `exec`) with `args`, on the main thread.
    pub fn call(&mut self, f: &LuaValue, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaFullError> {
        let thread = self.state.main_thread.clone();
        match execute::call_value(&mut self.state, &thread, f, args) {
            Ok(results) => Ok(results),
            Err(e) => Err(self.to_full_error(e)),
        }
    }

    /// Parses `chunk` per `load`'s rules (source or a pre-dumped binary
    /// chunk) and returns a callable closure, or an error message —
    /// mirroring `load`'s `(function, nil) | (nil, message)` contract
    /// without the stdlib wrapper around it.
    pub fn load(&mut self, chunk: &[u8], chunk_name: &str, env: Option<Rc<RefCell<LuaTable>>>) -> Result<LuaValue, String> {
        let proto = if chunk.first() == Some(&load::MAGIC) {
            load::load_binary(chunk).map_err(|e| e.to_string())?
        } else {
            compile(chunk, chunk_name).map_err(|e| e.to_string())?
        };
        let env_table = env.unwrap_or_else(|| self.state.globals.clone());
        let env_cell: Upvalue = Rc::new(RefCell::new(UpvalueCell::Closed(LuaValue::Table(env_table))));
        Ok(LuaValue::Function(Closure::new_lua(proto, vec![env_cell])))
    }

    fn to_full_error(&mut self, err: LuaError) -> LuaFullError {
        match err {
            LuaError::Syntax(message) => LuaFullError { kind: LuaError::Syntax(message.clone()), message, traceback: None },
            LuaError::StackOverflow => LuaFullError {
                kind: LuaError::StackOverflow,
                message: "stack overflow".to_string(),
                traceback: self.state.take_traceback(),
            },
            other => {
                let value = self.state.take_error();
                let message = display_value_raw(&value);
                LuaFullError { kind: other, message, traceback: self.state.take_traceback() }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a fresh, unstarted coroutine around a Lua closure, for
/// embedders driving coroutines directly rather than through
/// `coroutine.create`.
pub fn new_thread(body: Rc<Closure>) -> Rc<RefCell<LuaThread>> {
    Rc::new(RefCell::new(LuaThread::new(body, false)))
}

pub use state::HookMask;

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> Vec<LuaValue> {
        let mut vm = Vm::new();
        vm.exec(src.as_bytes(), "test").unwrap_or_else(|e| panic!("{src}: {e}"))
    }

    #[test]
    fn executes_arithmetic_and_returns_value() {
        let results = run("return 1 + 2 * 3");
        assert!(matches!(results.as_slice(), [LuaValue::Integer(7)]));
    }

    #[test]
    fn globals_persist_across_exec_calls() {
        let mut vm = Vm::new();
        vm.exec(b"x = 10", "a").unwrap();
        let results = vm.exec(b"return x + 1", "b").unwrap();
        assert!(matches!(results.as_slice(), [LuaValue::Integer(11)]));
    }

    #[test]
    fn runtime_error_reports_message_and_traceback() {
        let mut vm = Vm::new();
        let err = vm.exec(b"error('boom')", "test").unwrap_err();
        assert!(err.message.contains("boom"));
        assert!(err.traceback.is_some());
    }

    #[test]
    fn syntax_error_has_no_traceback() {
        let mut vm = Vm::new();
        let err = vm.exec(b"local = = =", "test").unwrap_err();
        assert!(matches!(err.kind, LuaError::Syntax(_)));
        assert!(err.traceback.is_none());
    }
}
