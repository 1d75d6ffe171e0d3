//! Single-pass recursive-descent parser + code generator.
//!
//! Expressions compile directly into bytecode as they are parsed
//! (there is no intermediate AST); [`ExprDesc`] is the compile-time
//! description of "where an expression's value currently lives" that
//! lets the caller decide how to consume it (assign it, call it,
//! test it, or simply discharge it into a fresh register).

use super::func_state::FuncState;
use super::opcode::OpCode;
use crate::lexer::{LexError, Lexer, Token, TokenKind};
use crate::value::closure::{Proto, UpvalueSource};
use crate::value::LuaValue;
use std::rc::Rc;

pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError {
            message: e.message,
            line: e.line,
        }
    }
}

type PResult<T> = Result<T, ParseError>;

#[derive(Clone, Copy)]
pub enum IndexKey {
    Const(u32),
    Reg(u16),
}

pub enum ExprDesc {
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Const(u32),
    /// A local variable's permanent register (never freed on discharge).
    Local(u16),
    /// A temporary value already sitting in a register.
    Temp(u16),
    Upvalue(u32),
    /// Global access: `_ENV[name]`, name is a string constant index.
    Global(u32),
    Index {
        obj_reg: u16,
        obj_is_temp: bool,
        key: IndexKey,
    },
    /// A call compiled to yield exactly one result, already in `reg`.
    Call {
        reg: u16,
    },
    /// A call compiled to yield all results (multi-result position).
    /// `pc` is the emitted `Call` instruction, whose `c` operand a later
    /// fixed-arity consumer (`discharge_list_to`) may retarget.
    OpenCall {
        reg: u16,
        pc: usize,
    },
    Vararg {
        reg: u16,
    },
    /// `pc` is the emitted `Vararg` instruction, whose `b` operand a later
    /// fixed-arity consumer may retarget the same way as `OpenCall`.
    OpenVararg {
        reg: u16,
        pc: usize,
    },
}

impl ExprDesc {
    fn is_multi(&self) -> bool {
        matches!(self, ExprDesc::OpenCall { .. } | ExprDesc::OpenVararg { .. })
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    fs_stack: Vec<FuncState>,
    chunk_name: String,
}

fn binop_prec(op: &TokenKind) -> Option<(u8, u8, BinOp)> {
    use TokenKind::*;
    Some(match op {
        Or => (1, 1, BinOp::Or),
        And => (2, 2, BinOp::And),
        Lt => (3, 3, BinOp::Lt),
        Gt => (3, 3, BinOp::Gt),
        Le => (3, 3, BinOp::Le),
        Ge => (3, 3, BinOp::Ge),
        Ne => (3, 3, BinOp::Ne),
        Eq => (3, 3, BinOp::Eq),
        Pipe => (4, 4, BinOp::BOr),
        Tilde => (5, 5, BinOp::BXor),
        Amp => (6, 6, BinOp::BAnd),
        Shl => (7, 7, BinOp::Shl),
        Shr => (7, 7, BinOp::Shr),
        Concat => (9, 8, BinOp::Concat), // right-assoc
        Plus => (10, 10, BinOp::Add),
        Minus => (10, 10, BinOp::Sub),
        Star => (11, 11, BinOp::Mul),
        Slash => (11, 11, BinOp::Div),
        DSlash => (11, 11, BinOp::IDiv),
        Percent => (11, 11, BinOp::Mod),
        Caret => (14, 13, BinOp::Pow), // right-assoc, binds tighter than unary
        _ => return None,
    })
}

const UNARY_PREC: u8 = 12;

#[derive(Clone, Copy, PartialEq)]
enum BinOp {
    Or, And, Lt, Gt, Le, Ge, Ne, Eq, BOr, BXor, BAnd, Shl, Shr, Concat,
    Add, Sub, Mul, Div, IDiv, Mod, Pow,
}

enum UnOp {
    Neg,
    Not,
    Len,
    BNot,
}

impl Parser {
    pub fn new(source: &[u8], chunk_name: &str) -> PResult<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Parser {
            tokens,
            pos: 0,
            fs_stack: Vec::new(),
            chunk_name: chunk_name.to_string(),
        })
    }

    fn fs(&mut self) -> &mut FuncState {
        self.fs_stack.last_mut().unwrap()
    }

    fn cur(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn cur_line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, k: &TokenKind) -> bool {
        self.cur() == k
    }

    fn accept(&mut self, k: &TokenKind) -> bool {
        if self.check(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, k: TokenKind, what: &str) -> PResult<()> {
        if self.check(&k) {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("'{}' expected", what)))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.cur().clone() {
            TokenKind::Name(n) => {
                self.advance();
                Ok(n)
            }
            _ => Err(self.err("<name> expected".to_string())),
        }
    }

    fn err(&self, msg: String) -> ParseError {
        ParseError {
            message: msg,
            line: self.cur_line(),
        }
    }

    // ---------------- top-level ----------------

    pub fn parse_main_chunk(mut self) -> PResult<Rc<Proto>> {
        let mut fs = FuncState::new(&self.chunk_name, 0);
        fs.is_vararg = true;
        // The main chunk's first upvalue is always `_ENV`.
        fs.upvalues.push(crate::value::closure::UpvalueDesc {
            name: "_ENV".to_string(),
            source: UpvalueSource::ParentUpvalue(0),
        });
        self.fs_stack.push(fs);
        self.block()?;
        if !self.check(&TokenKind::Eof) {
            return Err(self.err("'<eof>' expected".to_string()));
        }
        let line = self.cur_line();
        self.fs().emit(OpCode::Return, 0, 0, 0, line);
        let fs = self.fs_stack.pop().unwrap();
        Ok(Rc::new(finish_proto(fs, 0, line)))
    }

    fn env_upvalue_index(&mut self) -> u32 {
        // Walk up the fs stack chain ensuring every enclosing function
        // threads `_ENV` down from the main chunk.
        self.resolve_upvalue_chain("_ENV").expect("_ENV always resolvable")
    }

    /// Resolves `name` as an upvalue of the *current* function,
    /// searching enclosing functions' locals/upvalues and threading
    /// intermediate upvalue descriptors as needed.
    fn resolve_upvalue_chain(&mut self, name: &str) -> Option<u32> {
        self.resolve_upvalue_at(self.fs_stack.len() - 1, name)
    }

    fn resolve_upvalue_at(&mut self, level: usize, name: &str) -> Option<u32> {
        if let Some(i) = self.fs_stack[level].upvalues.iter().position(|u| u.name == name) {
            return Some(i as u32);
        }
        if level == 0 {
            return None;
        }
        if let Some(local) = self.fs_stack[level - 1].resolve_local(name) {
            let reg = local.register;
            return Some(self.fs_stack[level].find_or_add_upvalue(name, UpvalueSource::ParentLocal(reg as u32)));
        }
        let parent_up = self.resolve_upvalue_at(level - 1, name)?;
        Some(self.fs_stack[level].find_or_add_upvalue(name, UpvalueSource::ParentUpvalue(parent_up)))
    }

    fn resolve_name(&mut self, name: &str) -> ExprDesc {
        if let Some(local) = self.fs().resolve_local(name) {
            if local.is_const {
                // consts still read like locals; assignment is rejected elsewhere
            }
            return ExprDesc::Local(local.register);
        }
        if let Some(idx) = self.resolve_upvalue_chain(name) {
            return ExprDesc::Upvalue(idx);
        }
        let env = self.env_upvalue_index();
        let name_const = self.fs().add_constant(LuaValue::Str(Rc::from(name.as_bytes())));
        let _ = env;
        ExprDesc::Global(name_const)
    }

    // ---------------- blocks / statements ----------------

    fn block(&mut self) -> PResult<()> {
        loop {
            if self.block_follow() {
                break;
            }
            if self.check(&TokenKind::Return) {
                self.return_stat()?;
                break;
            }
            self.statement()?;
        }
        Ok(())
    }

    fn block_follow(&self) -> bool {
        matches!(
            self.cur(),
            TokenKind::Eof
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
        )
    }

    fn statement(&mut self) -> PResult<()> {
        let line = self.cur_line();
        match self.cur().clone() {
            TokenKind::Semi => {
                self.advance();
                Ok(())
            }
            TokenKind::DColon => self.label_stat(),
            TokenKind::Break => {
                self.advance();
                self.break_stat(line)
            }
            TokenKind::Goto => {
                self.advance();
                let name = self.expect_name()?;
                let jump_pc = self.fs().emit_jump(line);
                let num_locals = self.fs().locals.len() as u16;
                self.fs().blocks.last_mut().unwrap().pending_gotos.push(
                    super::func_state::PendingGoto { name, jump_pc, line, num_locals },
                );
                Ok(())
            }
            TokenKind::Do => {
                self.advance();
                self.fs().enter_block(false);
                self.block()?;
                self.expect(TokenKind::End, "end")?;
                self.fs().leave_block(line).map_err(|m| ParseError { message: m, line })
            }
            TokenKind::While => self.while_stat(line),
            TokenKind::Repeat => self.repeat_stat(line),
            TokenKind::If => self.if_stat(line),
            TokenKind::For => self.for_stat(line),
            TokenKind::Function => self.function_stat(line),
            TokenKind::Local => self.local_stat(line),
            _ => self.expr_stat(line),
        }
    }

    fn label_stat(&mut self) -> PResult<()> {
        self.advance();
        let name = self.expect_name()?;
        self.expect(TokenKind::DColon, "::")?;
        let pc = self.fs().pc();
        let num_locals = self.fs().locals.len() as u16;
        self.fs().blocks.last_mut().unwrap().labels.push((name.clone(), pc, num_locals));
        // Resolve any pending gotos in this block (and propagate the rest).
        self.resolve_gotos_for_label(&name, pc);
        Ok(())
    }

    fn resolve_gotos_for_label(&mut self, name: &str, pc: usize) {
        let pending: Vec<_> = self.fs().blocks.last_mut().unwrap().pending_gotos.drain(..).collect();
        let mut remaining = Vec::new();
        for g in pending {
            if g.name == name {
                let jp = g.jump_pc;
                self.fs().patch_jump_to(jp, pc);
            } else {
                remaining.push(g);
            }
        }
        self.fs().blocks.last_mut().unwrap().pending_gotos = remaining;
    }

    fn break_stat(&mut self, line: u32) -> PResult<()> {
        let jump_pc = self.fs().emit_jump(line);
        for b in self.fs().blocks.iter_mut().rev() {
            if b.is_loop {
                b.break_jumps.push(jump_pc);
                return Ok(());
            }
        }
        Err(ParseError { message: "break outside a loop".to_string(), line })
    }

    fn while_stat(&mut self, line: u32) -> PResult<()> {
        self.advance();
        let loop_start = self.fs().pc();
        let cond_reg = self.expr_into_fresh_reg(0)?;
        self.free_if_temp(cond_reg, cond_reg + 1);
        let test_pc = self.fs().emit(OpCode::Test, cond_reg as i32, 0, 1, line);
        let exit_jump = self.fs().emit_jump(line);
        let _ = test_pc;
        self.expect(TokenKind::Do, "do")?;
        self.fs().enter_block(true);
        self.block()?;
        self.expect(TokenKind::End, "end")?;
        let back_jump = self.fs().emit_jump(line);
        self.fs().patch_jump_to(back_jump, loop_start);
        self.fs().leave_block(line).map_err(|m| ParseError { message: m, line })?;
        self.fs().patch_jump_to_here(exit_jump);
        for bj in std::mem::take(&mut self.fs().blocks) {
            let _ = bj; // unreachable, blocks already popped above
        }
        Ok(())
    }

    fn repeat_stat(&mut self, line: u32) -> PResult<()> {
        self.advance();
        let loop_start = self.fs().pc();
        self.fs().enter_block(true);
        self.block()?;
        self.expect(TokenKind::Until, "until")?;
        // `until`'s condition is compiled INSIDE the loop's scope, so it
        // can see locals declared in the body (Lua semantics).
        let cond_line = self.cur_line();
        let cond_reg = self.expr_into_fresh_reg(0)?;
        let test_pc = self.fs().emit(OpCode::Test, cond_reg as i32, 0, 0, cond_line);
        let _ = test_pc;
        let back_jump = self.fs().emit_jump(cond_line);
        self.fs().patch_jump_to(back_jump, loop_start);
        self.fs().leave_block(line).map_err(|m| ParseError { message: m, line })?;
        Ok(())
    }

    fn if_stat(&mut self, line: u32) -> PResult<()> {
        self.advance();
        let mut end_jumps = Vec::new();
        loop {
            let cond_reg = self.expr_into_fresh_reg(0)?;
            self.free_if_temp(cond_reg, cond_reg + 1);
            let cline = self.cur_line();
            self.fs().emit(OpCode::Test, cond_reg as i32, 0, 1, cline);
            let else_jump = self.fs().emit_jump(cline);
            self.expect(TokenKind::Then, "then")?;
            self.fs().enter_block(false);
            self.block()?;
            self.fs().leave_block(cline).map_err(|m| ParseError { message: m, line: cline })?;
            if matches!(self.cur(), TokenKind::Elseif) {
                let j = self.fs().emit_jump(cline);
                end_jumps.push(j);
                self.fs().patch_jump_to_here(else_jump);
                self.advance();
                continue;
            }
            if matches!(self.cur(), TokenKind::Else) {
                let j = self.fs().emit_jump(cline);
                end_jumps.push(j);
                self.fs().patch_jump_to_here(else_jump);
                self.advance();
                self.fs().enter_block(false);
                self.block()?;
                self.fs().leave_block(cline).map_err(|m| ParseError { message: m, line: cline })?;
            } else {
                self.fs().patch_jump_to_here(else_jump);
            }
            break;
        }
        self.expect(TokenKind::End, "end")?;
        for j in end_jumps {
            self.fs().patch_jump_to_here(j);
        }
        let _ = line;
        Ok(())
    }

    fn for_stat(&mut self, line: u32) -> PResult<()> {
        self.advance();
        let name1 = self.expect_name()?;
        if self.check(&TokenKind::Assign) {
            self.numeric_for(name1, line)
        } else {
            self.generic_for(name1, line)
        }
    }

    fn numeric_for(&mut self, var: String, line: u32) -> PResult<()> {
        self.advance(); // '='
        self.fs().enter_block(true);
        let base = self.fs().reserve_reg(4); // init, limit, step, loopvar(hidden)
        self.expr_into_reg(base)?;
        self.expect(TokenKind::Comma, ",")?;
        self.expr_into_reg(base + 1)?;
        if self.accept(&TokenKind::Comma) {
            self.expr_into_reg(base + 2)?;
        } else {
            let k = self.fs().add_constant(LuaValue::Integer(1));
            self.fs().emit(OpCode::LoadK, (base + 2) as i32, k as i32, 0, line);
        }
        let prep_pc = self.fs().emit(OpCode::ForPrep, base as i32, 0, 0, line);
        let loop_top = self.fs().pc();
        self.fs().declare_local(&var, false, false, base + 3);
        self.expect(TokenKind::Do, "do")?;
        self.block()?;
        self.expect(TokenKind::End, "end")?;
        let loop_pc = self.fs().emit(OpCode::ForLoop, base as i32, 0, 0, line);
        self.fs().patch_jump_to(loop_pc, loop_top);
        let end_pc = self.fs().pc() - 1;
        self.fs().patch_jump_to(prep_pc, end_pc);
        self.fs().leave_block(line).map_err(|m| ParseError { message: m, line })?;
        Ok(())
    }

    fn generic_for(&mut self, first: String, line: u32) -> PResult<()> {
        let mut names = vec![first];
        while self.accept(&TokenKind::Comma) {
            names.push(self.expect_name()?);
        }
        self.expect(TokenKind::In, "in")?;
        self.fs().enter_block(true);
        let base = self.fs().reserve_reg(4); // iter, state, control, closing
        let mut exprs = vec![self.expr(0)?];
        while self.accept(&TokenKind::Comma) {
            exprs.push(self.expr(0)?);
        }
        self.discharge_list_to(exprs, base, 4)?;
        self.fs().emit(OpCode::TForPrep, base as i32, 0, 0, line);
        let loop_top = self.fs().pc();
        let first_var = self.fs().reserve_reg(names.len() as u16);
        for (i, n) in names.iter().enumerate() {
            self.fs().declare_local(n, false, false, first_var + i as u16);
        }
        self.expect(TokenKind::Do, "do")?;
        self.fs().emit(OpCode::TForCall, base as i32, first_var as i32, names.len() as i32, line);
        self.block()?;
        self.expect(TokenKind::End, "end")?;
        let loop_pc = self.fs().emit(OpCode::TForLoop, base as i32, 0, first_var as i32, line);
        self.fs().patch_jump_to(loop_pc, loop_top);
        self.fs().leave_block(line).map_err(|m| ParseError { message: m, line })?;
        Ok(())
    }

    fn function_stat(&mut self, line: u32) -> PResult<()> {
        self.advance();
        let mut name = self.expect_name()?;
        let base = self.resolve_name(&name);
        let mut is_method = false;
        let mut field_chain: Vec<String> = Vec::new();
        loop {
            if self.accept(&TokenKind::Dot) {
                let field = self.expect_name()?;
                field_chain.push(field);
            } else if self.accept(&TokenKind::Colon) {
                let field = self.expect_name()?;
                field_chain.push(field);
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let full_name_last = field_chain.last().cloned().unwrap_or_else(|| name.clone());
        let body_reg = self.fs().reserve_reg(1);
        self.function_body(is_method, line, &full_name_last)?;
        self.fs().free_reg -= 1; // discharge_function_body leaves result at top; reclaim bookkeeping below
        self.fs().free_reg += 1;
        let _ = body_reg;
        if field_chain.is_empty() {
            self.assign_to_named(&name, ExprDesc::Temp(body_reg), line)?;
        } else {
            // a.b.c.d = function
            let mut obj = self.discharge(base, false);
            for f in &field_chain[..field_chain.len() - 1] {
                let k = self.fs().add_constant(LuaValue::Str(Rc::from(f.as_bytes())));
                let next = self.fs().reserve_reg(1);
                self.fs().emit(OpCode::GetField, next as i32, obj as i32, k as i32, line);
                obj = next;
            }
            let k = self.fs().add_constant(LuaValue::Str(Rc::from(full_name_last.as_bytes())));
            self.fs().emit(OpCode::SetField, obj as i32, k as i32, body_reg as i32, line);
        }
        let _ = &mut name;
        Ok(())
    }

    fn local_stat(&mut self, line: u32) -> PResult<()> {
        self.advance();
        if self.accept(&TokenKind::Function) {
            let name = self.expect_name()?;
            let reg = self.fs().reserve_reg(1);
            self.fs().declare_local(&name, false, false, reg);
            self.function_body(false, line, &name)?;
            // function_body discharged its result onto the just-declared
            // register (top of free_reg before the call): move it in place.
            let result_reg = self.fs().free_reg - 1;
            if result_reg != reg {
                self.fs().emit(OpCode::Move, reg as i32, result_reg as i32, 0, line);
                self.fs().free_reg -= 1;
            }
            return Ok(());
        }
        let mut names = Vec::new();
        loop {
            let name = self.expect_name()?;
            let mut is_const = false;
            let mut is_close = false;
            if self.accept(&TokenKind::Lt) {
                let attr = self.expect_name()?;
                match attr.as_str() {
                    "const" => is_const = true,
                    "close" => is_close = true,
                    other => {
                        return Err(ParseError {
                            message: format!("unknown attribute '{}'", other),
                            line,
                        })
                    }
                }
                self.expect(TokenKind::Gt, ">")?;
            }
            names.push((name, is_const, is_close));
            if !self.accept(&TokenKind::Comma) {
                break;
            }
        }
        let mut exprs = Vec::new();
        if self.accept(&TokenKind::Assign) {
            exprs.push(self.expr(0)?);
            while self.accept(&TokenKind::Comma) {
                exprs.push(self.expr(0)?);
            }
        }
        let base = self.fs().free_reg;
        self.discharge_list_to(exprs, base, names.len() as u32)?;
        for (i, (name, is_const, is_close)) in names.iter().enumerate() {
            let reg = self.fs().declare_local(name, *is_const, *is_close, base + i as u16);
            if *is_close {
                self.fs().emit(OpCode::Tbc, reg as i32, 0, 0, line);
            }
        }
        Ok(())
    }

    fn return_stat(&mut self) -> PResult<()> {
        let line = self.cur_line();
        self.advance();
        let base = self.fs().free_reg;
        if self.block_follow() || self.check(&TokenKind::Semi) {
            self.fs().emit(OpCode::Return, base as i32, 1, 0, line);
        } else {
            let mut exprs = vec![self.expr(0)?];
            while self.accept(&TokenKind::Comma) {
                exprs.push(self.expr(0)?);
            }
            let last_is_multi = exprs.last().map_or(false, |e| matches!(e, ExprDesc::OpenCall { .. } | ExprDesc::OpenVararg { .. }) || self.expr_is_multi_capable(exprs.last().unwrap()));
            let n = exprs.len();
            let count = self.discharge_list_open(exprs, base)?;
            let b = if last_is_multi { 0 } else { (count).max(n as i32) + 1 };
            self.fs().emit(OpCode::Return, base as i32, b, 0, line);
        }
        self.accept(&TokenKind::Semi);
        Ok(())
    }

    fn expr_is_multi_capable(&self, _e: &ExprDesc) -> bool {
        false
    }

    fn expr_stat(&mut self, line: u32) -> PResult<()> {
        let e = self.suffixed_expr()?;
        if self.check(&TokenKind::Assign) || self.check(&TokenKind::Comma) {
            let mut targets = vec![e];
            while self.accept(&TokenKind::Comma) {
                targets.push(self.suffixed_expr()?);
            }
            self.expect(TokenKind::Assign, "=")?;
            let mut exprs = vec![self.expr(0)?];
            while self.accept(&TokenKind::Comma) {
                exprs.push(self.expr(0)?);
            }
            self.assign_multi(targets, exprs, line)?;
            Ok(())
        } else {
            // Must have been a function call for its side effects.
            match e {
                ExprDesc::Call { .. } | ExprDesc::OpenCall { .. } => Ok(()),
                _ => Err(ParseError { message: "syntax error (expected statement)".to_string(), line }),
            }
        }
    }

    // ---------------- assignment ----------------

    fn assign_multi(&mut self, targets: Vec<ExprDesc>, exprs: Vec<ExprDesc>, line: u32) -> PResult<()> {
        for t in &targets {
            self.check_assignable(t, line)?;
        }
        let base = self.fs().free_reg;
        self.discharge_list_to(exprs, base, targets.len() as u32)?;
        for (i, t) in targets.into_iter().enumerate() {
            self.store(t, base + i as u16, line)?;
        }
        self.fs().free_reg = base;
        Ok(())
    }

    fn check_assignable(&self, e: &ExprDesc, line: u32) -> PResult<()> {
        if let ExprDesc::Local(reg) = e {
            if let Some(l) = self.fs_stack.last().unwrap().locals.iter().rev().find(|l| l.register == *reg) {
                if l.is_const {
                    return Err(ParseError {
                        message: format!("attempt to assign to const variable '{}'", l.name),
                        line,
                    });
                }
            }
        }
        Ok(())
    }

    fn store(&mut self, target: ExprDesc, value_reg: u16, line: u32) -> PResult<()> {
        match target {
            ExprDesc::Local(reg) => {
                if reg != value_reg {
                    self.fs().emit(OpCode::Move, reg as i32, value_reg as i32, 0, line);
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.fs().emit(OpCode::SetUpval, value_reg as i32, idx as i32, 0, line);
            }
            ExprDesc::Global(name_const) => {
                let env = self.env_upvalue_index();
                self.fs().emit(OpCode::SetTabUp, env as i32, name_const as i32, value_reg as i32, line);
            }
            ExprDesc::Index { obj_reg, key, .. } => match key {
                IndexKey::Const(k) => {
                    self.fs().emit(OpCode::SetField, obj_reg as i32, k as i32, value_reg as i32, line);
                }
                IndexKey::Reg(k) => {
                    self.fs().emit(OpCode::SetTable, obj_reg as i32, k as i32, value_reg as i32, line);
                }
            },
            _ => return Err(ParseError { message: "cannot assign to this expression".to_string(), line }),
        }
        Ok(())
    }

    fn assign_to_named(&mut self, name: &str, value: ExprDesc, line: u32) -> PResult<()> {
        let target = self.resolve_name(name);
        let reg = self.discharge(value, false);
        self.store(target, reg, line)?;
        let top = self.fs().free_reg;
        self.free_if_temp(reg, top);
        Ok(())
    }

    // ---------------- function bodies / calls ----------------

    fn function_body(&mut self, is_method: bool, line: u32, name_hint: &str) -> PResult<()> {
        self.expect(TokenKind::LParen, "(")?;
        let mut fs = FuncState::new(&self.chunk_name, line);
        self.fs_stack.push(fs);
        if is_method {
            let reg = self.fs().reserve_reg(1);
            self.fs().declare_local("self", false, false, reg);
        }
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.accept(&TokenKind::Ellipsis) {
                    self.fs().is_vararg = true;
                    break;
                }
                let pname = self.expect_name()?;
                let reg = self.fs().reserve_reg(1);
                self.fs().declare_local(&pname, false, false, reg);
                if !self.accept(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.fs().num_params = self.fs().locals.len() as u8;
        self.expect(TokenKind::RParen, ")")?;
        self.block()?;
        let end_line = self.cur_line();
        self.expect(TokenKind::End, "end")?;
        self.fs().emit(OpCode::Return, 0, 1, 0, end_line);
        fs = self.fs_stack.pop().unwrap();
        let proto = Rc::new(finish_proto(fs, line, end_line));
        let idx = {
            let parent = self.fs();
            parent.protos.push(proto);
            parent.protos.len() as u32 - 1
        };
        let dest = self.fs().reserve_reg(1);
        self.fs().emit(OpCode::Closure, dest as i32, idx as i32, 0, line);
        let _ = name_hint;
        Ok(())
    }

    fn call_args(&mut self) -> PResult<Vec<ExprDesc>> {
        let mut args = Vec::new();
        match self.cur().clone() {
            TokenKind::LParen => {
                self.advance();
                if !self.check(&TokenKind::RParen) {
                    args.push(self.expr(0)?);
                    while self.accept(&TokenKind::Comma) {
                        args.push(self.expr(0)?);
                    }
                }
                self.expect(TokenKind::RParen, ")")?;
            }
            TokenKind::Str(s) => {
                let line = self.cur_line();
                self.advance();
                let k = self.fs().add_constant(LuaValue::Str(s));
                args.push(ExprDesc::Const(k));
                let _ = line;
            }
            TokenKind::LBrace => {
                args.push(self.table_constructor()?);
            }
            _ => return Err(self.err("function arguments expected".to_string())),
        }
        Ok(args)
    }

    // ---------------- primary / suffixed expressions ----------------

    fn primary_expr(&mut self) -> PResult<ExprDesc> {
        match self.cur().clone() {
            TokenKind::LParen => {
                self.advance();
                let e = self.expr(0)?;
                self.expect(TokenKind::RParen, ")")?;
                // Parens truncate a multi-value expression to one value.
                let reg = self.discharge(e, true);
                Ok(ExprDesc::Temp(reg))
            }
            TokenKind::Name(n) => {
                self.advance();
                Ok(self.resolve_name(&n))
            }
            _ => Err(self.err("unexpected symbol".to_string())),
        }
    }

    fn suffixed_expr(&mut self) -> PResult<ExprDesc> {
        let mut e = self.primary_expr()?;
        loop {
            let line = self.cur_line();
            match self.cur().clone() {
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect_name()?;
                    let k = self.fs().add_constant(LuaValue::Str(Rc::from(field.as_bytes())));
                    let obj = self.discharge(e, false);
                    e = ExprDesc::Index { obj_reg: obj, obj_is_temp: self.is_temp_reg(obj), key: IndexKey::Const(k) };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key_expr = self.expr(0)?;
                    self.expect(TokenKind::RBracket, "]")?;
                    let obj = self.discharge(e, false);
                    let kreg = self.discharge(key_expr, false);
                    e = ExprDesc::Index { obj_reg: obj, obj_is_temp: self.is_temp_reg(obj), key: IndexKey::Reg(kreg) };
                }
                TokenKind::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let k = self.fs().add_constant(LuaValue::Str(Rc::from(method.as_bytes())));
                    let obj = self.discharge(e, false);
                    let base = self.fs().reserve_reg(2);
                    self.fs().emit(OpCode::SelfOp, base as i32, obj as i32, k as i32, line);
                    self.free_if_temp(obj, base);
                    self.fs().free_reg = base + 2;
                    let args = self.call_args()?;
                    let multi = self.args_are_multi(&args);
                    let nargs = self.discharge_args(args, base + 2)? + 1;
                    self.fs().free_reg = base + 2;
                    let b = if multi { 0 } else { nargs + 1 };
                    self.fs().emit(OpCode::Call, base as i32, b, 2, line);
                    self.fs().free_reg = base + 1;
                    e = ExprDesc::Call { reg: base };
                }
                TokenKind::LParen | TokenKind::Str(_) | TokenKind::LBrace => {
                    let base = self.discharge(e, false);
                    self.fs().free_reg = base + 1;
                    let args = self.call_args()?;
                    let multi = self.args_are_multi(&args);
                    let nargs = self.discharge_args(args, base + 1)?;
                    self.fs().free_reg = base + 1;
                    let b = if multi { 0 } else { nargs + 1 };
                    let pc = self.fs().emit(OpCode::Call, base as i32, b, 0, line);
                    self.fs().free_reg = base + 1;
                    e = ExprDesc::OpenCall { reg: base, pc };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn args_are_multi(&self, args: &[ExprDesc]) -> bool {
        matches!(args.last(), Some(ExprDesc::OpenCall { .. }) | Some(ExprDesc::OpenVararg { .. }))
    }

    /// Places `args` into consecutive registers starting at `base`,
    /// returning how many fixed slots they occupy (the final multi-value
    /// arg, if any, is left open at the top of the register file).
    fn discharge_args(&mut self, args: Vec<ExprDesc>, base: u16) -> PResult<i32> {
        let n = args.len();
        for (i, a) in args.into_iter().enumerate() {
            let target = base + i as u16;
            if i + 1 == n {
                self.discharge_last_to(a, target)?;
            } else {
                self.discharge_to(a, target);
            }
        }
        Ok(n as i32)
    }

    fn discharge_last_to(&mut self, e: ExprDesc, target: u16) -> PResult<()> {
        match e {
            ExprDesc::OpenCall { reg, .. } | ExprDesc::OpenVararg { reg, .. } => {
                // Left open (c/b == 0, "all results"): the caller wants the
                // whole multret tail here, so no result count to retarget.
                if reg != target {
                    self.fs().emit(OpCode::Move, target as i32, reg as i32, 0, 0);
                }
            }
            other => self.discharge_to(other, target),
        }
        Ok(())
    }

    fn is_temp_reg(&self, reg: u16) -> bool {
        !self.fs_stack.last().unwrap().locals.iter().any(|l| l.register == reg)
    }

    // ---------------- expression parsing (precedence climbing) ----------------

    fn expr(&mut self, limit: u8) -> PResult<ExprDesc> {
        let line = self.cur_line();
        let mut left = if let Some(u) = unop(self.cur()) {
            self.advance();
            let operand = self.expr(UNARY_PREC)?;
            self.emit_unop(u, operand, line)
        } else {
            self.simple_expr()?
        };
        while let Some((lprec, rprec, op)) = binop_prec(self.cur()) {
            if lprec <= limit {
                break;
            }
            let opline = self.cur_line();
            self.advance();
            if op == BinOp::And || op == BinOp::Or {
                left = self.compile_logical(op, left, rprec, opline)?;
                continue;
            }
            let right = self.expr(rprec)?;
            left = self.emit_binop(op, left, right, opline)?;
        }
        Ok(left)
    }

    fn compile_logical(&mut self, op: BinOp, left: ExprDesc, rprec: u8, line: u32) -> PResult<ExprDesc> {
        let dst = self.discharge(left, true);
        self.fs().free_reg = dst + 1;
        let c = if op == BinOp::And { 1 } else { 0 };
        self.fs().emit(OpCode::Test, dst as i32, 0, c, line);
        let skip = self.fs().emit_jump(line);
        let right = self.expr(rprec)?;
        self.discharge_to(right, dst);
        self.fs().patch_jump_to_here(skip);
        Ok(ExprDesc::Temp(dst))
    }

    fn simple_expr(&mut self) -> PResult<ExprDesc> {
        let line = self.cur_line();
        match self.cur().clone() {
            TokenKind::Nil => { self.advance(); Ok(ExprDesc::Nil) }
            TokenKind::True => { self.advance(); Ok(ExprDesc::True) }
            TokenKind::False => { self.advance(); Ok(ExprDesc::False) }
            TokenKind::Int(i) => { self.advance(); Ok(ExprDesc::Int(i)) }
            TokenKind::Float(f) => { self.advance(); Ok(ExprDesc::Float(f)) }
            TokenKind::Str(s) => {
                self.advance();
                let k = self.fs().add_constant(LuaValue::Str(s));
                Ok(ExprDesc::Const(k))
            }
            TokenKind::Ellipsis => {
                self.advance();
                if !self.fs().is_vararg {
                    return Err(ParseError { message: "cannot use '...' outside a vararg function".to_string(), line });
                }
                let reg = self.fs().reserve_reg(1);
                let pc = self.fs().emit(OpCode::Vararg, reg as i32, 2, 0, line);
                Ok(ExprDesc::OpenVararg { reg, pc })
            }
            TokenKind::Function => {
                self.advance();
                self.function_body(false, line, "")?;
                let reg = self.fs().free_reg - 1;
                Ok(ExprDesc::Temp(reg))
            }
            TokenKind::LBrace => self.table_constructor(),
            _ => self.suffixed_expr(),
        }
    }

    fn table_constructor(&mut self) -> PResult<ExprDesc> {
        let line = self.cur_line();
        self.expect(TokenKind::LBrace, "{")?;
        let table_reg = self.fs().reserve_reg(1);
        self.fs().emit(OpCode::NewTable, table_reg as i32, 0, 0, line);
        let mut array_index: i64 = 0;
        let mut pending_array: Vec<ExprDesc> = Vec::new();
        let flush_base = table_reg + 1;
        loop {
            if self.check(&TokenKind::RBrace) {
                break;
            }
            if self.check(&TokenKind::LBracket) {
                self.flush_array_items(&mut pending_array, table_reg, flush_base, &mut array_index, line)?;
                self.advance();
                let key = self.expr(0)?;
                self.expect(TokenKind::RBracket, "]")?;
                self.expect(TokenKind::Assign, "=")?;
                let val = self.expr(0)?;
                let kreg = self.discharge(key, false);
                let vreg = self.discharge(val, false);
                self.fs().emit(OpCode::SetTable, table_reg as i32, kreg as i32, vreg as i32, line);
                self.fs().free_reg = flush_base;
            } else if matches!(self.cur(), TokenKind::Name(_)) && self.peek_is_assign() {
                self.flush_array_items(&mut pending_array, table_reg, flush_base, &mut array_index, line)?;
                let name = self.expect_name()?;
                self.expect(TokenKind::Assign, "=")?;
                let val = self.expr(0)?;
                let k = self.fs().add_constant(LuaValue::Str(Rc::from(name.as_bytes())));
                let vreg = self.discharge(val, false);
                self.fs().emit(OpCode::SetField, table_reg as i32, k as i32, vreg as i32, line);
                self.fs().free_reg = flush_base;
            } else {
                let e = self.expr(0)?;
                let is_last_before_close = {
                    let save = self.pos;
                    let more = self.check(&TokenKind::Comma) || self.check(&TokenKind::Semi);
                    self.pos = save;
                    !more
                };
                if is_last_before_close && e.is_multi() {
                    self.discharge_to(e, flush_base + pending_array.len() as u16);
                    self.fs().free_reg = flush_base + pending_array.len() as u16 + 1;
                    self.fs().emit(
                        OpCode::SetList,
                        table_reg as i32,
                        array_index as i32,
                        0,
                        line,
                    );
                    self.fs().free_reg = flush_base;
                    array_index = 0;
                } else {
                    pending_array.push(e);
                }
            }
            if !self.accept(&TokenKind::Comma) && !self.accept(&TokenKind::Semi) {
                break;
            }
        }
        self.flush_array_items(&mut pending_array, table_reg, flush_base, &mut array_index, line)?;
        self.expect(TokenKind::RBrace, "}")?;
        self.fs().free_reg = table_reg + 1;
        Ok(ExprDesc::Temp(table_reg))
    }

    fn peek_is_assign(&self) -> bool {
        matches!(self.tokens.get(self.pos + 1).map(|t| &t.kind), Some(TokenKind::Assign))
    }

    fn flush_array_items(
        &mut self,
        pending: &mut Vec<ExprDesc>,
        table_reg: u16,
        flush_base: u16,
        array_index: &mut i64,
        line: u32,
    ) -> PResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(pending);
        let n = items.len();
        for (i, e) in items.into_iter().enumerate() {
            self.discharge_to(e, flush_base + i as u16);
        }
        self.fs().free_reg = flush_base + n as u16;
        self.fs().emit(OpCode::SetList, table_reg as i32, *array_index as i32, n as i32, line);
        *array_index += n as i64;
        self.fs().free_reg = flush_base;
        Ok(())
    }

    // ---------------- discharge helpers ----------------

    /// Materializes `e` into some register, returning it. Locals are
    /// returned as-is (their permanent register) unless `force_fresh`.
    fn discharge(&mut self, e: ExprDesc, force_fresh: bool) -> u16 {
        match e {
            ExprDesc::Local(r) if !force_fresh => r,
            ExprDesc::Temp(r) => r,
            other => {
                let r = self.fs().reserve_reg(1);
                self.discharge_to(other, r);
                r
            }
        }
    }

    fn expr_into_fresh_reg(&mut self, limit: u8) -> PResult<u16> {
        let e = self.expr(limit)?;
        Ok(self.discharge(e, true))
    }

    fn expr_into_reg(&mut self, target: u16) -> PResult<()> {
        let e = self.expr(0)?;
        self.discharge_to(e, target);
        Ok(())
    }

    fn free_if_temp(&mut self, reg: u16, current_top: u16) {
        if reg + 1 == current_top && self.is_temp_reg(reg) {
            self.fs().free_reg = reg;
        }
    }

    fn discharge_to(&mut self, e: ExprDesc, target: u16) {
        let line = 0;
        match e {
            ExprDesc::Nil => {
                self.fs().emit(OpCode::LoadNil, target as i32, 0, 0, line);
            }
            ExprDesc::True => {
                self.fs().emit(OpCode::LoadBool, target as i32, 1, 0, line);
            }
            ExprDesc::False => {
                self.fs().emit(OpCode::LoadBool, target as i32, 0, 0, line);
            }
            ExprDesc::Int(i) => {
                let k = self.fs().add_constant(LuaValue::Integer(i));
                self.fs().emit(OpCode::LoadK, target as i32, k as i32, 0, line);
            }
            ExprDesc::Float(f) => {
                let k = self.fs().add_constant(LuaValue::Number(f));
                self.fs().emit(OpCode::LoadK, target as i32, k as i32, 0, line);
            }
            ExprDesc::Const(k) => {
                self.fs().emit(OpCode::LoadK, target as i32, k as i32, 0, line);
            }
            ExprDesc::Local(r) | ExprDesc::Temp(r) => {
                if r != target {
                    self.fs().emit(OpCode::Move, target as i32, r as i32, 0, line);
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.fs().emit(OpCode::GetUpval, target as i32, idx as i32, 0, line);
            }
            ExprDesc::Global(name_const) => {
                let env = self.env_upvalue_index();
                self.fs().emit(OpCode::GetTabUp, target as i32, env as i32, name_const as i32, line);
            }
            ExprDesc::Index { obj_reg, key, .. } => match key {
                IndexKey::Const(k) => {
                    self.fs().emit(OpCode::GetField, target as i32, obj_reg as i32, k as i32, line);
                }
                IndexKey::Reg(k) => {
                    self.fs().emit(OpCode::GetTable, target as i32, obj_reg as i32, k as i32, line);
                }
            },
            ExprDesc::Call { reg } | ExprDesc::OpenCall { reg, .. } => {
                if reg != target {
                    self.fs().emit(OpCode::Move, target as i32, reg as i32, 0, line);
                }
            }
            ExprDesc::Vararg { reg } | ExprDesc::OpenVararg { reg, .. } => {
                if reg != target {
                    self.fs().emit(OpCode::Move, target as i32, reg as i32, 0, line);
                }
            }
        }
    }

    fn discharge_list_to(&mut self, exprs: Vec<ExprDesc>, base: u16, want: u32) -> PResult<()> {
        let n = exprs.len();
        let want = want as usize;
        for (i, e) in exprs.into_iter().enumerate() {
            if i >= want {
                // Extra expressions are still evaluated for side effects,
                // into throwaway temporaries past `want`.
                let r = self.fs().reserve_reg(1);
                self.discharge_to(e, r);
                self.fs().free_reg = base + want as u16;
                continue;
            }
            let target = base + i as u16;
            if i + 1 == n && e.is_multi() && want > n {
                // Last expr is open (call/vararg): retarget its already-emitted
                // instruction to request exactly the remaining slots instead
                // of "all results", so the VM itself nil-pads any shortfall.
                let remaining = (want - i) as i32;
                match e {
                    ExprDesc::OpenCall { reg, pc } => {
                        self.fs().instructions[pc].c = remaining + 1;
                        if reg != target {
                            for j in 0..remaining as u16 {
                                self.fs().emit(OpCode::Move, (target + j) as i32, (reg + j) as i32, 0, 0);
                            }
                        }
                    }
                    ExprDesc::OpenVararg { reg, pc } => {
                        self.fs().instructions[pc].b = remaining + 1;
                        if reg != target {
                            for j in 0..remaining as u16 {
                                self.fs().emit(OpCode::Move, (target + j) as i32, (reg + j) as i32, 0, 0);
                            }
                        }
                    }
                    _ => unreachable!("is_multi() only holds for OpenCall/OpenVararg"),
                }
                self.fs().free_reg = base + want as u16;
                return Ok(());
            }
            self.discharge_to(e, target);
        }
        for i in n..want {
            self.fs().emit(OpCode::LoadNil, (base + i as u16) as i32, 0, 0, 0);
        }
        self.fs().free_reg = base + want as u16;
        Ok(())
    }

    fn discharge_list_open(&mut self, exprs: Vec<ExprDesc>, base: u16) -> PResult<i32> {
        let n = exprs.len();
        for (i, e) in exprs.into_iter().enumerate() {
            let target = base + i as u16;
            if i + 1 == n {
                self.discharge_last_to(e, target)?;
            } else {
                self.discharge_to(e, target);
            }
        }
        self.fs().free_reg = base + n as u16;
        Ok(n as i32)
    }

    // ---------------- unary / binary codegen ----------------

    fn emit_unop(&mut self, op: UnOp, operand: ExprDesc, line: u32) -> ExprDesc {
        if let UnOp::Neg = op {
            match operand {
                ExprDesc::Int(i) => return ExprDesc::Int(i.wrapping_neg()),
                ExprDesc::Float(f) => return ExprDesc::Float(-f),
                _ => {}
            }
        }
        let src = self.discharge(operand, false);
        let dst = if self.is_temp_reg(src) { src } else { self.fs().reserve_reg(1) };
        let code = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
            UnOp::BNot => OpCode::BNot,
        };
        self.fs().emit(code, dst as i32, src as i32, 0, line);
        ExprDesc::Temp(dst)
    }

    fn emit_binop(&mut self, op: BinOp, left: ExprDesc, right: ExprDesc, line: u32) -> PResult<ExprDesc> {
        if let Some(folded) = try_fold(op, &left, &right) {
            return Ok(folded);
        }
        if op == BinOp::Concat {
            // Flatten a chain of concats into one CONCAT over a register run.
            let lstart = self.discharge(left, false);
            let lstart = if self.is_temp_reg(lstart) { lstart } else {
                let r = self.fs().reserve_reg(1);
                self.fs().emit(OpCode::Move, r as i32, lstart as i32, 0, line);
                r
            };
            self.fs().free_reg = lstart + 1;
            let rreg = self.discharge(right, false);
            let _ = rreg;
            self.fs().free_reg = lstart + 2;
            self.fs().emit(OpCode::Concat, lstart as i32, 2, 0, line);
            self.fs().free_reg = lstart + 1;
            return Ok(ExprDesc::Temp(lstart));
        }
        let lreg = self.discharge(left, false);
        let dst = if self.is_temp_reg(lreg) { lreg } else { self.fs().reserve_reg(1) };
        self.fs().free_reg = dst + 1;
        let rreg = self.discharge(right, false);
        self.fs().free_reg = dst + 1;
        let (code, swapped_for_gt) = match op {
            BinOp::Add => (OpCode::Add, false),
            BinOp::Sub => (OpCode::Sub, false),
            BinOp::Mul => (OpCode::Mul, false),
            BinOp::Div => (OpCode::Div, false),
            BinOp::IDiv => (OpCode::IDiv, false),
            BinOp::Mod => (OpCode::Mod, false),
            BinOp::Pow => (OpCode::Pow, false),
            BinOp::BAnd => (OpCode::BAnd, false),
            BinOp::BOr => (OpCode::BOr, false),
            BinOp::BXor => (OpCode::BXor, false),
            BinOp::Shl => (OpCode::Shl, false),
            BinOp::Shr => (OpCode::Shr, false),
            BinOp::Eq => (OpCode::Eq, false),
            BinOp::Lt => (OpCode::Lt, false),
            BinOp::Le => (OpCode::Le, false),
            BinOp::Gt => (OpCode::Lt, true),
            BinOp::Ge => (OpCode::Le, true),
            BinOp::Ne => (OpCode::Eq, false),
            BinOp::And | BinOp::Or | BinOp::Concat => unreachable!(),
        };
        if swapped_for_gt {
            self.fs().emit(code, dst as i32, rreg as i32, lreg as i32, line);
        } else {
            self.fs().emit(code, dst as i32, lreg as i32, rreg as i32, line);
        }
        if op == BinOp::Ne {
            self.fs().emit(OpCode::Not, dst as i32, dst as i32, 0, line);
        }
        Ok(ExprDesc::Temp(dst))
    }
}

fn unop(t: &TokenKind) -> Option<UnOp> {
    match t {
        TokenKind::Minus => Some(UnOp::Neg),
        TokenKind::Not => Some(UnOp::Not),
        TokenKind::Hash => Some(UnOp::Len),
        TokenKind::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

/// Constant folding for literal numeric operands: the
/// type rule (integer wraps, any float contaminates, `/`/`^` always
/// float, `//`/`%` preserve integer-ness) is applied here exactly as
/// the runtime arithmetic would apply it, so folded code and executed
/// code never diverge.
fn try_fold(op: BinOp, left: &ExprDesc, right: &ExprDesc) -> Option<ExprDesc> {
    use crate::vm::execute::{lua_fmod, lua_ifloordiv, lua_imod};
    let (li, lf) = match left {
        ExprDesc::Int(i) => (Some(*i), None),
        ExprDesc::Float(f) => (None, Some(*f)),
        _ => return None,
    };
    let (ri, rf) = match right {
        ExprDesc::Int(i) => (Some(*i), None),
        ExprDesc::Float(f) => (None, Some(*f)),
        _ => return None,
    };
    let as_int = |i: Option<i64>, f: Option<f64>| (i, f);
    let _ = as_int;
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Mod | BinOp::IDiv => {
            if let (Some(a1), Some(a2)) = (li, ri) {
                return Some(ExprDesc::Int(match op {
                    BinOp::Add => a1.wrapping_add(a2),
                    BinOp::Sub => a1.wrapping_sub(a2),
                    BinOp::Mul => a1.wrapping_mul(a2),
                    BinOp::Mod => {
                        if a2 == 0 { return None; }
                        lua_imod(a1, a2)
                    }
                    BinOp::IDiv => {
                        if a2 == 0 { return None; }
                        lua_ifloordiv(a1, a2)
                    }
                    _ => unreachable!(),
                }));
            }
            let fa = lf.or(li.map(|i| i as f64))?;
            let fb = rf.or(ri.map(|i| i as f64))?;
            Some(ExprDesc::Float(match op {
                BinOp::Add => fa + fb,
                BinOp::Sub => fa - fb,
                BinOp::Mul => fa * fb,
                BinOp::Mod => lua_fmod(fa, fb),
                BinOp::IDiv => (fa / fb).floor(),
                _ => unreachable!(),
            }))
        }
        BinOp::Div => {
            let fa = lf.or(li.map(|i| i as f64))?;
            let fb = rf.or(ri.map(|i| i as f64))?;
            Some(ExprDesc::Float(fa / fb))
        }
        BinOp::Pow => {
            let fa = lf.or(li.map(|i| i as f64))?;
            let fb = rf.or(ri.map(|i| i as f64))?;
            Some(ExprDesc::Float(fa.powf(fb)))
        }
        _ => None,
    }
}

fn finish_proto(mut fs: FuncState, line_defined: u32, last_line: u32) -> Proto {
    fs.finish_local_debug();
    Proto {
        bytecode: fs.instructions,
        constants: fs.constants,
        protos: fs.protos,
        upvalues: fs.upvalues,
        locals: fs.local_debug,
        line_info: fs.lines,
        num_params: fs.num_params,
        is_vararg: fs.is_vararg,
        max_stack_size: fs.max_reg.max(2),
        source: fs.source,
        line_defined,
        last_line_defined: last_line,
        stripped: false,
    }
}
