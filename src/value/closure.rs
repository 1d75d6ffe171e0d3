//! Function prototypes and closures: compiled bytecode, upvalue descriptors, and the runtime closure objects built from them.

use super::LuaValue;
use crate::compiler::opcode::Instruction;
use crate::error::LuaResult;
use crate::vm::state::VmState;
use std::cell::RefCell;
use std::rc::Rc;

/// Where an upvalue's initial value comes from when a closure is built
/// by the `Closure` opcode: either a parent local register or a parent upvalue slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpvalueSource {
    ParentLocal(u32),
    ParentUpvalue(u32),
}

#[derive(Clone, Debug)]
pub struct UpvalueDesc {
    pub name: String,
    pub source: UpvalueSource,
}

/// A single local-variable's live range, used by `debug.getlocal` and
/// by the compiler to know which register is live at which PC.
#[derive(Clone, Debug)]
pub struct LocalVarInfo {
    pub name: String,
    pub first_pc: u32,
    pub last_pc: u32,
    pub register: u16,
    pub is_const: bool,
    pub is_close: bool,
}

/// Compiled function prototype: bytecode plus everything `debug.*`
/// needs to describe it.
pub struct Proto {
    pub bytecode: Vec<Instruction>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub locals: Vec<LocalVarInfo>,
    /// PC -> source line; empty when debug info has been stripped.
    pub line_info: Vec<u32>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u16,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub stripped: bool,
}

impl std::fmt::Debug for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto")
            .field("source", &self.source)
            .field("line_defined", &self.line_defined)
            .field("last_line_defined", &self.last_line_defined)
            .finish()
    }
}

impl Proto {
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        if self.stripped {
            return None;
        }
        self.line_info.get(pc).copied()
    }

    /// Union of PC->line across the whole function (the set of "active lines").
    pub fn active_lines(&self) -> Vec<u32> {
        if self.stripped {
            return Vec::new();
        }
        let mut lines: Vec<u32> = self.line_info.clone();
        lines.sort_unstable();
        lines.dedup();
        lines
    }
}

/// A shared, possibly-open upvalue cell.
pub enum UpvalueCell {
    /// Points into a live thread's register file at `index`.
    Open {
        thread: std::rc::Weak<RefCell<crate::vm::thread::LuaThread>>,
        index: usize,
    },
    Closed(LuaValue),
}

pub type Upvalue = Rc<RefCell<UpvalueCell>>;

/// Signature for a host (Rust) function exposed to Lua.
pub type HostFn = Rc<dyn Fn(&mut VmState, &[LuaValue]) -> LuaResult<Vec<LuaValue>>>;

/// VM-loop intrinsics: calls the execute loop must splice into the
/// flat frame stack itself rather than dispatch as a plain Rust call,
/// because their whole point is to be transparent to `coroutine.yield`
/// unwinding through them (a generic `HostFn` call is a real Rust call
/// frame and cannot survive a yield).
pub enum Intrinsic {
    PCall,
    XPCall,
    CoroutineResume,
    CoroutineYield,
    CoroutineWrap(Rc<RefCell<crate::vm::thread::LuaThread>>),
}

pub enum ClosureKind {
    Lua(Rc<Proto>),
    Host {
        func: HostFn,
        name: Option<String>,
    },
    Intrinsic(Intrinsic),
}

pub struct Closure {
    pub kind: ClosureKind,
    pub upvalues: RefCell<Vec<Upvalue>>,
    /// Names shown by `debug.getupvalue` on host closures ("" when unnamed).
    pub upvalue_names: Vec<String>,
}

impl Closure {
    pub fn new_lua(proto: Rc<Proto>, upvalues: Vec<Upvalue>) -> Rc<Closure> {
        let names = proto.upvalues.iter().map(|u| u.name.clone()).collect();
        Rc::new(Closure {
            kind: ClosureKind::Lua(proto),
            upvalues: RefCell::new(upvalues),
            upvalue_names: names,
        })
    }

    pub fn new_host(name: Option<&str>, func: HostFn) -> Rc<Closure> {
        Rc::new(Closure {
            kind: ClosureKind::Host {
                func,
                name: name.map(|s| s.to_string()),
            },
            upvalues: RefCell::new(Vec::new()),
            upvalue_names: Vec::new(),
        })
    }

    pub fn new_intrinsic(name: &str, intrinsic: Intrinsic) -> Rc<Closure> {
        Rc::new(Closure {
            kind: ClosureKind::Intrinsic(intrinsic),
            upvalues: RefCell::new(Vec::new()),
            upvalue_names: vec![name.to_string()],
        })
    }

    pub fn is_lua(&self) -> bool {
        matches!(self.kind, ClosureKind::Lua(_))
    }

    pub fn proto(&self) -> Option<&Rc<Proto>> {
        match &self.kind {
            ClosureKind::Lua(p) => Some(p),
            _ => None,
        }
    }

    pub fn host_name(&self) -> Option<&str> {
        match &self.kind {
            ClosureKind::Host { name, .. } => name.as_deref(),
            _ => None,
        }
    }
}
