//! Global interpreter state: the globals table, string interner,
//! per-type default metatables, debug hook registration, and the
//! bookkeeping `pcall`/`error`/coroutine machinery reads and writes.

use crate::gc::Interner;
use crate::value::{Closure, LuaTable, LuaValue};
use crate::vm::thread::LuaThread;
use std::cell::RefCell;
use std::rc::Rc;

/// Engine limits, set at `Vm::new`/`Vm::with_config` and matching Lua
/// 5.4's reference defaults.
#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_registers: u16,
    pub short_string_threshold: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 200,
            max_registers: 250,
            short_string_threshold: 40,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HookMask {
    pub call: bool,
    pub return_: bool,
    pub line: bool,
    pub count: bool,
}

pub struct HookState {
    pub mask: HookMask,
    /// Configured instruction interval for the count hook.
    pub count: i32,
    /// Countdown to the next count-hook firing; reloaded from `count`.
    pub count_remaining: i32,
    pub callback: Option<LuaValue>,
    /// Re-entrancy guard: a hook firing another hook call is suppressed.
    pub in_hook: bool,
}

impl Default for HookState {
    fn default() -> Self {
        HookState {
            mask: HookMask::default(),
            count: 0,
            count_remaining: 0,
            callback: None,
            in_hook: false,
        }
    }
}

/// The interpreter-global state shared by every thread (coroutine).
/// Reachable from every `HostFn` so standard-library functions can read
/// globals, raise errors, or create new coroutines.
pub struct VmState {
    pub globals: Rc<RefCell<LuaTable>>,
    pub string_metatable: Option<Rc<RefCell<LuaTable>>>,
    pub interner: Interner,
    pub config: VmConfig,
    /// The coroutine currently running (innermost `resume`'d thread, or
    /// the main thread when nothing has been resumed).
    pub current_thread: Rc<RefCell<LuaThread>>,
    pub main_thread: Rc<RefCell<LuaThread>>,
    /// Stack of resumer threads, for `coroutine.running`/`isyieldable`
    /// and for marking a resumer's status as `"normal"` while resumed.
    pub resume_stack: Vec<Rc<RefCell<LuaThread>>>,
    /// The pending error value for the innermost unwinding error: Lua
    /// errors are ordinary values, not a fixed message type.
    pub error_value: LuaValue,
    /// Traceback captured at the point an error was raised, before the
    /// frame stack unwinds past it — an `xpcall` handler or the embedder
    /// reading a top-level error both want the failure site, not
    /// wherever unwinding happened to stop.
    pub last_traceback: Option<String>,
    pub hooks: HookState,
    /// Registry table, returned by `debug.getregistry`.
    pub registry: Rc<RefCell<LuaTable>>,
}

impl VmState {
    pub fn new(config: VmConfig, main_body: Rc<Closure>) -> Self {
        let main_thread = Rc::new(RefCell::new(LuaThread::new(main_body, true)));
        VmState {
            globals: Rc::new(RefCell::new(LuaTable::new())),
            string_metatable: None,
            interner: Interner::new(),
            config,
            current_thread: main_thread.clone(),
            main_thread,
            resume_stack: Vec::new(),
            error_value: LuaValue::Nil,
            last_traceback: None,
            hooks: HookState::default(),
            registry: Rc::new(RefCell::new(LuaTable::new())),
        }
    }

    pub fn take_error(&mut self) -> LuaValue {
        std::mem::replace(&mut self.error_value, LuaValue::Nil)
    }

    pub fn set_error(&mut self, v: LuaValue) {
        self.error_value = v;
    }

    pub fn take_traceback(&mut self) -> Option<String> {
        self.last_traceback.take()
    }

    pub fn is_main_thread(&self, t: &Rc<RefCell<LuaThread>>) -> bool {
        Rc::ptr_eq(t, &self.main_thread)
    }
}
