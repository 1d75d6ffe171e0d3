//! Per-function compile-time state: register allocation, local/upvalue
//! scopes, constant pool, and jump patch lists.

use crate::compiler::opcode::{Instruction, OpCode};
use crate::value::closure::{LocalVarInfo, Proto, UpvalueDesc, UpvalueSource};
use crate::value::LuaValue;
use std::rc::Rc;

#[derive(Clone)]
pub struct LocalSlot {
    pub name: String,
    pub register: u16,
    pub is_const: bool,
    pub is_close: bool,
    pub first_pc: u32,
}

/// One lexical block. `is_loop` lets `break` find its jump-patch list;
/// `first_local` records how many locals to pop on block exit.
pub struct BlockScope {
    pub first_local: usize,
    pub is_loop: bool,
    pub break_jumps: Vec<usize>,
    pub labels: Vec<(String, usize, u16)>, // name, pc, num_locals at label
    pub pending_gotos: Vec<PendingGoto>,
    pub has_close: bool,
}

pub struct PendingGoto {
    pub name: String,
    pub jump_pc: usize,
    pub line: u32,
    pub num_locals: u16,
}

pub struct FuncState {
    pub instructions: Vec<Instruction>,
    pub lines: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub locals: Vec<LocalSlot>,
    pub local_debug: Vec<LocalVarInfo>,
    pub blocks: Vec<BlockScope>,
    pub free_reg: u16,
    pub max_reg: u16,
    pub num_params: u8,
    pub is_vararg: bool,
    pub source: String,
    pub line_defined: u32,
}

impl FuncState {
    pub fn new(source: &str, line_defined: u32) -> Self {
        FuncState {
            instructions: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            local_debug: Vec::new(),
            blocks: vec![BlockScope {
                first_local: 0,
                is_loop: false,
                break_jumps: Vec::new(),
                labels: Vec::new(),
                pending_gotos: Vec::new(),
                has_close: false,
            }],
            free_reg: 0,
            max_reg: 0,
            num_params: 0,
            is_vararg: false,
            source: source.to_string(),
            line_defined,
        }
    }

    pub fn emit(&mut self, op: OpCode, a: i32, b: i32, c: i32, line: u32) -> usize {
        self.instructions.push(Instruction::new(op, a, b, c));
        self.lines.push(line);
        self.instructions.len() - 1
    }

    pub fn pc(&self) -> usize {
        self.instructions.len()
    }

    pub fn patch_jump_to_here(&mut self, jump_pc: usize) {
        let here = self.pc() as i32;
        self.instructions[jump_pc].a = here - jump_pc as i32 - 1;
    }

    pub fn patch_jump_to(&mut self, jump_pc: usize, target: usize) {
        self.instructions[jump_pc].a = target as i32 - jump_pc as i32 - 1;
    }

    pub fn emit_jump(&mut self, line: u32) -> usize {
        self.emit(OpCode::Jmp, 0, 0, 0, line)
    }

    pub fn reserve_reg(&mut self, n: u16) -> u16 {
        let r = self.free_reg;
        self.free_reg += n;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        r
    }

    pub fn add_constant(&mut self, v: LuaValue) -> u32 {
        for (i, c) in self.constants.iter().enumerate() {
            if c.raw_eq(&v) && std::mem::discriminant(c) == std::mem::discriminant(&v) {
                return i as u32;
            }
        }
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockScope {
            first_local: self.locals.len(),
            is_loop,
            break_jumps: Vec::new(),
            labels: Vec::new(),
            pending_gotos: Vec::new(),
            has_close: false,
        });
    }

    /// Leaves the current block, emitting `Close` if any `<close>`
    /// local was declared in it, and propagating unresolved gotos to
    /// the parent block.
    pub fn leave_block(&mut self, line: u32) -> Result<(), String> {
        let block = self.blocks.pop().unwrap();
        let base_reg = self
            .locals
            .get(block.first_local)
            .map(|l| l.register)
            .unwrap_or(self.free_reg);
        if block.has_close {
            self.emit(OpCode::Close, base_reg as i32, 0, 0, line);
        }
        let cur_pc = self.pc() as u32;
        for l in self.locals.drain(block.first_local..) {
            if let Some(info) = self
                .local_debug
                .iter_mut()
                .rev()
                .find(|d| d.register == l.register && d.last_pc == u32::MAX)
            {
                info.last_pc = cur_pc;
            }
        }
        self.free_reg = base_reg;
        if let Some(parent) = self.blocks.last_mut() {
            for g in block.pending_gotos {
                parent.pending_gotos.push(g);
            }
        } else if !block.pending_gotos.is_empty() {
            let g = &block.pending_gotos[0];
            return Err(format!("no visible label '{}' for goto at line {}", g.name, g.line));
        }
        Ok(())
    }

    /// Binds `name` to `reg`, a register the caller has already reserved
    /// (via `reserve_reg`/`discharge_list_to`) for the local's value.
    pub fn declare_local(&mut self, name: &str, is_const: bool, is_close: bool, reg: u16) -> u16 {
        self.locals.push(LocalSlot {
            name: name.to_string(),
            register: reg,
            is_const,
            is_close,
            first_pc: self.pc() as u32,
        });
        self.local_debug.push(LocalVarInfo {
            name: name.to_string(),
            first_pc: self.pc() as u32,
            last_pc: u32::MAX,
            register: reg,
            is_const,
            is_close,
        });
        if is_close {
            if let Some(b) = self.blocks.last_mut() {
                b.has_close = true;
            }
        }
        reg
    }

    pub fn resolve_local(&self, name: &str) -> Option<&LocalSlot> {
        self.locals.iter().rev().find(|l| l.name == name)
    }

    pub fn find_or_add_upvalue(&mut self, name: &str, source: UpvalueSource) -> u32 {
        if let Some(i) = self.upvalues.iter().position(|u| u.name == name) {
            return i as u32;
        }
        self.upvalues.push(UpvalueDesc {
            name: name.to_string(),
            source,
        });
        (self.upvalues.len() - 1) as u32
    }

    pub fn finish_local_debug(&mut self) {
        let end = self.pc() as u32;
        for d in self.local_debug.iter_mut() {
            if d.last_pc == u32::MAX {
                d.last_pc = end;
            }
        }
    }
}
