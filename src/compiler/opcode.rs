//! Bytecode instruction set executed by the VM's dispatch loop.
//!
//! Real Lua packs an instruction into a 32-bit word with several
//! argument-field layouts (`iABC`/`iABx`/`iAsBx`). `lua54rt` instead
//! uses a plain struct of `i32` operands — the VM never needs to fit
//! in a cache-line-sized word for this exercise, and a struct keeps
//! every opcode handler free of bit-shift arithmetic.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    LoadK,     // R[a] = K[b]
    LoadNil,   // R[a..=a+b] = nil
    LoadBool,  // R[a] = (b != 0); if c != 0, pc += 1
    LoadInt,   // R[a] = b as i64 (small-int fast path)
    Move,      // R[a] = R[b]
    GetUpval,  // R[a] = Upval[b]
    SetUpval,  // Upval[b] = R[a]
    GetTabUp,  // R[a] = Upval[b][K[c]]     (global access via _ENV)
    SetTabUp,  // Upval[a][K[b]] = RK[c]
    GetTable,  // R[a] = R[b][R[c]]
    GetField,  // R[a] = R[b][K[c]]
    SetTable,  // R[a][R[b]] = R[c]
    SetField,  // R[a][K[b]] = R[c]
    NewTable,  // R[a] = {} (array hint b, hash hint c)
    SelfOp,    // R[a+1] = R[b]; R[a] = R[b][K[c]]
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
    Not,
    Len,
    Concat, // R[a] = R[a] .. ... .. R[a+b-1]
    Jmp,  // pc += a (signed)
    // Value-producing comparisons: R[a] = bool(R[b] OP R[c]). Kept
    // value-producing (rather than real Lua's compare-and-skip form)
    // so every boolean-valued expression — `if`/`while` conditions
    // included — funnels through the same `Test`+`Jmp` branch pattern.
    Eq,
    Lt,
    Le,
    Test,    // if (truthy(R[a]) == (c != 0)) then pc += 1 (skips the following Jmp)
    TestSet, // like Test, but also R[a] = R[b] when the test does NOT skip
    Call,     // R[a..] = R[a](R[a+1..a+b]); b=0 => to top; c = nresults+1 (0 = all)
    TailCall, // return R[a](R[a+1..a+b]); b=0 => to top
    Return,   // return R[a..a+b-1]; b=0 => to top
    ForPrep, // numeric for setup at a; jumps to ForLoop's pc+b on empty range
    ForLoop,
    TForPrep, // evaluates the (iter,state,control[,closing]) exprlist at a
    TForCall, // R[a+4..a+4+c] = R[a](R[a+1], R[a+2])
    TForLoop, // if R[a+4] ~= nil then R[a+2] = R[a+4]; pc += b
    SetList, // R[a][b+1..] = R[a+1..a+c]; c=0 => to top
    Closure, // R[a] = closure(protos[b])
    Vararg,  // R[a..a+b-2] = varargs; b=0 => all
    Close,   // close upvalues and run <close> for registers >= a
    Tbc,     // mark R[a] as to-be-closed
}

/// Every variant in declaration order, used by the binary chunk
/// (de)serializer to round-trip an opcode as a single byte.
pub const ALL_OPCODES: &[OpCode] = &[
    OpCode::LoadK,
    OpCode::LoadNil,
    OpCode::LoadBool,
    OpCode::LoadInt,
    OpCode::Move,
    OpCode::GetUpval,
    OpCode::SetUpval,
    OpCode::GetTabUp,
    OpCode::SetTabUp,
    OpCode::GetTable,
    OpCode::GetField,
    OpCode::SetTable,
    OpCode::SetField,
    OpCode::NewTable,
    OpCode::SelfOp,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Mod,
    OpCode::Pow,
    OpCode::IDiv,
    OpCode::BAnd,
    OpCode::BOr,
    OpCode::BXor,
    OpCode::Shl,
    OpCode::Shr,
    OpCode::Unm,
    OpCode::BNot,
    OpCode::Not,
    OpCode::Len,
    OpCode::Concat,
    OpCode::Jmp,
    OpCode::Eq,
    OpCode::Lt,
    OpCode::Le,
    OpCode::Test,
    OpCode::TestSet,
    OpCode::Call,
    OpCode::TailCall,
    OpCode::Return,
    OpCode::ForPrep,
    OpCode::ForLoop,
    OpCode::TForPrep,
    OpCode::TForCall,
    OpCode::TForLoop,
    OpCode::SetList,
    OpCode::Closure,
    OpCode::Vararg,
    OpCode::Close,
    OpCode::Tbc,
];

impl OpCode {
    pub fn from_u8(b: u8) -> Option<OpCode> {
        ALL_OPCODES.get(b as usize).copied()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Instruction {
    pub op: OpCode,
    pub a: i32,
    pub b: i32,
    pub c: i32,
}

impl Instruction {
    pub fn new(op: OpCode, a: i32, b: i32, c: i32) -> Self {
        Instruction { op, a, b, c }
    }
}
