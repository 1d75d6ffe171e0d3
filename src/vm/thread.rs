//! Per-coroutine execution state: each `LuaThread` owns its own flat
//! frame stack and register file, independent of every other thread.
//! Resuming a thread runs its frame stack to completion or to the next
//! `yield`; nothing here depends on OS-level fibers or Rust recursion
//! to make that possible.

use crate::value::closure::Closure;
use crate::value::LuaValue;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Suspended,
    Running,
    Normal,
    Dead,
}

impl CoroutineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// A to-be-closed slot pending cleanup when its owning frame unwinds,
/// either normally or by error. The `__close` handler invocation itself
/// lives in `vm::close`; this just records what each frame owns.
pub struct PendingClose {
    pub register: u16,
    pub value: LuaValue,
}

/// Marks why a frame exists in the stack besides running bytecode.
pub enum FrameKind {
    /// A normal Lua call.
    Lua,
    /// A `pcall`/`xpcall` protected boundary: errors raised at or below
    /// this frame are caught here instead of propagating further.
    /// `handler` is the `xpcall` message handler, if any.
    Protected { handler: Option<LuaValue> },
}

pub struct Frame {
    pub closure: Rc<Closure>,
    pub pc: usize,
    /// Index into the thread's register stack where this frame's
    /// registers begin.
    pub base: usize,
    pub varargs: Vec<LuaValue>,
    pub kind: FrameKind,
    /// Where the caller wants this frame's eventual results written
    /// (register index in the *caller's* frame, which is `base` minus
    /// the callee's own reserved registers — recorded absolutely here).
    pub return_base: usize,
    /// `None` means "all results" (an open call/return); `Some(n)` caps
    /// the caller's requested result count.
    pub want_results: Option<u16>,
    pub to_be_closed: Vec<PendingClose>,
    pub is_tail_call: bool,
    /// Last source line the line hook fired for, and the PC it fired at,
    /// so a loop body revisiting the same line still refires once per
    /// backward jump (a new iteration) rather than only once ever.
    pub last_hook_line: Option<u32>,
    pub last_hook_pc: Option<usize>,
}

pub struct LuaThread {
    pub status: CoroutineStatus,
    pub frames: Vec<Frame>,
    pub registers: Vec<LuaValue>,
    /// The closure the thread was created with (its "body").
    pub body: Rc<Closure>,
    /// Values passed to the most recent `resume`.
    pub resume_values: Vec<LuaValue>,
    /// Values passed to the most recent `yield` (read by `resume`'s caller).
    pub yield_values: Vec<LuaValue>,
    /// Where the next `resume`'s values must land before execution
    /// continues: the register (absolute) and requested result count of
    /// the `Call` instruction that invoked `coroutine.yield`. `None`
    /// before the thread's first resume.
    pub pending_yield_return: Option<(usize, Option<u16>)>,
    pub is_main: bool,
    /// Traceback captured at the moment this thread died from an
    /// unhandled error, kept around since `frames` itself is unwound to
    /// empty by then. Lets `debug.traceback` still describe a dead
    /// coroutine's failure after the fact.
    pub dead_traceback: Option<String>,
}

impl LuaThread {
    pub fn new(body: Rc<Closure>, is_main: bool) -> Self {
        LuaThread {
            status: CoroutineStatus::Suspended,
            frames: Vec::new(),
            registers: Vec::new(),
            body,
            resume_values: Vec::new(),
            yield_values: Vec::new(),
            pending_yield_return: None,
            is_main,
            dead_traceback: None,
        }
    }

    pub fn can_resume(&self) -> bool {
        matches!(self.status, CoroutineStatus::Suspended)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.status, CoroutineStatus::Dead)
    }

    pub fn ensure_register_capacity(&mut self, top: usize) {
        if self.registers.len() < top {
            self.registers.resize(top, LuaValue::Nil);
        }
    }
}
