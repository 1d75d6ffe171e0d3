//! String-to-number coercion and the binary chunk format behind
//! `load`/`string.dump`.
//!
//! The binary format is a flat, hand-rolled serialization of a [`Proto`]
//! tree — magic byte, version, format byte, a fixed identifier, a
//! little-endian size/endianness header, then the tree itself. There is
//! no general object graph to support (constants are always primitives
//! or strings), so this reaches for no serialization crate and is
//! hand-rolled end to end instead.

use crate::compiler::opcode::{Instruction, OpCode};
use crate::error::{LuaError, LuaResult};
use crate::value::closure::{LocalVarInfo, Proto, UpvalueDesc, UpvalueSource};
use crate::value::LuaValue;
use std::rc::Rc;

pub const MAGIC: u8 = 0x1B;
pub const LUA_VERSION: u8 = 0x54;
pub const FORMAT: u8 = 0;
pub const IDENTIFIER: &[u8; 6] = b"\x19\x93\r\n\x1a\n";

/// Parses a Lua numeral from source text (decimal/hex, int/float,
/// optional surrounding whitespace and sign) — the grammar `tonumber`
/// and arithmetic-on-strings coercion both rely on. Returns `None` for
/// anything that isn't a complete numeral.
pub fn parse_number_str(s: &[u8]) -> Option<LuaValue> {
    let text = std::str::from_utf8(s).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let (sign, rest) = match text.as_bytes()[0] {
        b'-' => (-1i64, &text[1..]),
        b'+' => (1i64, &text[1..]),
        _ => (1i64, text),
    };
    if rest.is_empty() {
        return None;
    }
    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        return parse_hex_numeral(hex, sign);
    }
    if rest.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = rest.parse::<i64>() {
            return Some(LuaValue::Integer(i * sign));
        }
        return rest.parse::<f64>().ok().map(|f| LuaValue::Number(f * sign as f64));
    }
    if !rest.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-')) {
        return None;
    }
    rest.parse::<f64>().ok().map(|f| LuaValue::Number(f * sign as f64))
}

fn parse_hex_numeral(hex: &str, sign: i64) -> Option<LuaValue> {
    if hex.is_empty() {
        return None;
    }
    if hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        let mut acc: i64 = 0;
        for b in hex.bytes() {
            acc = acc.wrapping_mul(16).wrapping_add(hex_digit(b)? as i64);
        }
        return Some(LuaValue::Integer(acc.wrapping_mul(sign)));
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit() || matches!(b, b'.' | b'p' | b'P' | b'+' | b'-')) {
        return None;
    }
    let (mantissa, exp) = match hex.split_once(['p', 'P']) {
        Some((m, e)) => (m, e.parse::<i32>().ok()?),
        None => (hex, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut value = 0.0f64;
    for b in int_part.bytes() {
        value = value * 16.0 + hex_digit(b)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for b in frac_part.bytes() {
        value += hex_digit(b)? as f64 * scale;
        scale /= 16.0;
    }
    Some(LuaValue::Number(value * 2f64.powi(exp) * sign as f64))
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Serializes `proto` (and its nested prototypes) into the binary
/// chunk format `string.dump` exposes. `strip` drops line info and
/// local/upvalue names, matching Lua's own `strip` parameter.
pub fn dump(proto: &Proto, strip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(MAGIC);
    out.push(LUA_VERSION);
    out.push(FORMAT);
    out.extend_from_slice(IDENTIFIER);
    out.push(std::mem::size_of::<i64>() as u8);
    out.push(std::mem::size_of::<f64>() as u8);
    write_proto(&mut out, proto, strip);
    out
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &[u8]) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s);
}

fn write_proto(out: &mut Vec<u8>, proto: &Proto, strip: bool) {
    write_str(out, proto.source.as_bytes());
    write_u32(out, proto.line_defined);
    write_u32(out, proto.last_line_defined);
    out.push(proto.num_params);
    out.push(proto.is_vararg as u8);
    write_u32(out, proto.max_stack_size as u32);

    write_u32(out, proto.bytecode.len() as u32);
    for instr in &proto.bytecode {
        out.push(instr.op as u8);
        write_i64(out, instr.a as i64);
        write_i64(out, instr.b as i64);
        write_i64(out, instr.c as i64);
    }

    write_u32(out, proto.constants.len() as u32);
    for k in &proto.constants {
        write_constant(out, k);
    }

    write_u32(out, proto.upvalues.len() as u32);
    for u in &proto.upvalues {
        match u.source {
            UpvalueSource::ParentLocal(idx) => {
                out.push(0);
                write_u32(out, idx);
            }
            UpvalueSource::ParentUpvalue(idx) => {
                out.push(1);
                write_u32(out, idx);
            }
        }
        write_str(out, if strip { b"" } else { u.name.as_bytes() });
    }

    out.push(strip as u8);
    if strip {
        write_u32(out, 0);
        write_u32(out, 0);
    } else {
        write_u32(out, proto.line_info.len() as u32);
        for l in &proto.line_info {
            write_u32(out, *l);
        }
        write_u32(out, proto.locals.len() as u32);
        for l in &proto.locals {
            write_str(out, l.name.as_bytes());
            write_u32(out, l.first_pc);
            write_u32(out, l.last_pc);
            write_u32(out, l.register as u32);
            out.push(l.is_const as u8);
            out.push(l.is_close as u8);
        }
    }

    write_u32(out, proto.protos.len() as u32);
    for p in &proto.protos {
        write_proto(out, p, strip);
    }
}

fn write_constant(out: &mut Vec<u8>, v: &LuaValue) {
    match v {
        LuaValue::Nil => out.push(0),
        LuaValue::Boolean(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        LuaValue::Integer(i) => {
            out.push(2);
            write_i64(out, *i);
        }
        LuaValue::Number(f) => {
            out.push(3);
            write_f64(out, *f);
        }
        LuaValue::Str(s) => {
            out.push(4);
            write_str(out, s);
        }
        _ => out.push(0),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> LuaResult<u8> {
        let b = *self.bytes.get(self.pos).ok_or(LuaError::Runtime)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> LuaResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(LuaError::Runtime)?;
        let slice = self.bytes.get(self.pos..end).ok_or(LuaError::Runtime)?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> LuaResult<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> LuaResult<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> LuaResult<f64> {
        Ok(f64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> LuaResult<Vec<u8>> {
        let n = self.u32()? as usize;
        Ok(self.bytes(n)?.to_vec())
    }
}

/// Parses a binary chunk produced by [`dump`]. Returns the root
/// [`Proto`], ready to be closed over `_ENV` the same way a freshly
/// compiled main chunk is.
pub fn load_binary(bytes: &[u8]) -> LuaResult<Rc<Proto>> {
    let mut r = Reader { bytes, pos: 0 };
    if r.u8()? != MAGIC || r.u8()? != LUA_VERSION || r.u8()? != FORMAT {
        return Err(LuaError::Runtime);
    }
    if r.bytes(6)? != IDENTIFIER {
        return Err(LuaError::Runtime);
    }
    let int_size = r.u8()?;
    let float_size = r.u8()?;
    if int_size as usize != std::mem::size_of::<i64>() || float_size as usize != std::mem::size_of::<f64>() {
        return Err(LuaError::Runtime);
    }
    Ok(Rc::new(read_proto(&mut r)?))
}

fn read_proto(r: &mut Reader) -> LuaResult<Proto> {
    let source = String::from_utf8_lossy(&r.string()?).into_owned();
    let line_defined = r.u32()?;
    let last_line_defined = r.u32()?;
    let num_params = r.u8()?;
    let is_vararg = r.u8()? != 0;
    let max_stack_size = r.u32()? as u16;

    let n_instr = r.u32()? as usize;
    let mut bytecode = Vec::with_capacity(n_instr);
    for _ in 0..n_instr {
        let op = OpCode::from_u8(r.u8()?).ok_or(LuaError::Runtime)?;
        let a = r.i64()? as i32;
        let b = r.i64()? as i32;
        let c = r.i64()? as i32;
        bytecode.push(Instruction::new(op, a, b, c));
    }

    let n_const = r.u32()? as usize;
    let mut constants = Vec::with_capacity(n_const);
    for _ in 0..n_const {
        constants.push(read_constant(r)?);
    }

    let n_up = r.u32()? as usize;
    let mut upvalues = Vec::with_capacity(n_up);
    for _ in 0..n_up {
        let tag = r.u8()?;
        let idx = r.u32()?;
        let name = String::from_utf8_lossy(&r.string()?).into_owned();
        let source = if tag == 0 {
            UpvalueSource::ParentLocal(idx)
        } else {
            UpvalueSource::ParentUpvalue(idx)
        };
        upvalues.push(UpvalueDesc { name, source });
    }

    let stripped = r.u8()? != 0;
    let n_lines = r.u32()? as usize;
    let mut line_info = Vec::with_capacity(n_lines);
    for _ in 0..n_lines {
        line_info.push(r.u32()?);
    }

    let n_locals = r.u32()? as usize;
    let mut locals = Vec::with_capacity(n_locals);
    for _ in 0..n_locals {
        let name = String::from_utf8_lossy(&r.string()?).into_owned();
        let first_pc = r.u32()?;
        let last_pc = r.u32()?;
        let register = r.u32()? as u16;
        let is_const = r.u8()? != 0;
        let is_close = r.u8()? != 0;
        locals.push(LocalVarInfo {
            name,
            first_pc,
            last_pc,
            register,
            is_const,
            is_close,
        });
    }

    let n_protos = r.u32()? as usize;
    let mut protos = Vec::with_capacity(n_protos);
    for _ in 0..n_protos {
        protos.push(Rc::new(read_proto(r)?));
    }

    Ok(Proto {
        bytecode,
        constants,
        protos,
        upvalues,
        locals,
        line_info,
        num_params,
        is_vararg,
        max_stack_size,
        source,
        line_defined,
        last_line_defined,
        stripped,
    })
}

fn read_constant(r: &mut Reader) -> LuaResult<LuaValue> {
    match r.u8()? {
        0 => Ok(LuaValue::Nil),
        1 => Ok(LuaValue::Boolean(r.u8()? != 0)),
        2 => Ok(LuaValue::Integer(r.i64()?)),
        3 => Ok(LuaValue::Number(r.f64()?)),
        4 => Ok(LuaValue::Str(Rc::from(r.string()?.into_boxed_slice()))),
        _ => Err(LuaError::Runtime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_hex() {
        assert!(matches!(parse_number_str(b"42"), Some(LuaValue::Integer(42))));
        assert!(matches!(parse_number_str(b"  -7  "), Some(LuaValue::Integer(-7))));
        assert!(matches!(parse_number_str(b"0x2A"), Some(LuaValue::Integer(42))));
        assert!(matches!(parse_number_str(b"3.5"), Some(LuaValue::Number(f)) if f == 3.5));
        assert!(matches!(parse_number_str(b"1e2"), Some(LuaValue::Number(f)) if f == 100.0));
        assert!(parse_number_str(b"not a number").is_none());
        assert!(parse_number_str(b"").is_none());
    }

    #[test]
    fn dump_and_reload_round_trips_bytecode() {
        let proto = crate::compiler::compile(b"return 1 + 2", "=(test)").unwrap();
        let bytes = dump(&proto, false);
        let reloaded = load_binary(&bytes).unwrap();
        assert_eq!(reloaded.bytecode.len(), proto.bytecode.len());
        assert_eq!(reloaded.constants.len(), proto.constants.len());
    }

    #[test]
    fn strip_drops_line_info_and_names() {
        let proto = crate::compiler::compile(b"local x = 1\nreturn x", "=(test)").unwrap();
        let bytes = dump(&proto, true);
        let reloaded = load_binary(&bytes).unwrap();
        assert!(reloaded.stripped);
        assert!(reloaded.locals.iter().all(|l| l.name.is_empty()) || reloaded.locals.is_empty());
    }
}
