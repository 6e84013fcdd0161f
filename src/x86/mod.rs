//! IA-32 instruction model.
//!
//! The code generator never writes bytes directly. It builds [`Insn`] values
//! and hands them to a [`CodeStream`]: either the byte [`Assembler`] or the
//! recording [`Listing`]. Branch targets are [`Label`] handles that the
//! stream resolves once the method is complete.

mod codebuf;
mod encoder;
mod listing;

pub use codebuf::{CodeBuffer, RefSize};
pub use encoder::Assembler;
pub use listing::Listing;

use std::fmt;
use thiserror::Error;

/// IA-32 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    Eax = 0, // Return value (low word), accumulator for MUL/IDIV
    Ecx = 1, // Shift count, LOOP counter
    Edx = 2, // Return value (high word), IDIV remainder
    Ebx = 3,
    Esp = 4, // Native stack pointer
    Ebp = 5, // Frame pointer
    Esi = 6, // LODSD source
    Edi = 7,
}

impl Reg {
    pub const ALL: [Reg; 8] = [
        Reg::Eax,
        Reg::Ecx,
        Reg::Edx,
        Reg::Ebx,
        Reg::Esp,
        Reg::Ebp,
        Reg::Esi,
        Reg::Edi,
    ];

    /// Get the 3-bit register code.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Reg {
        Self::ALL[(code & 0x7) as usize]
    }

    /// Whether the low byte of this register is addressable (AL, CL, DL, BL).
    pub fn has_byte_form(self) -> bool {
        (self as u8) < 4
    }

    pub fn name(self) -> &'static str {
        ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"][self as usize]
    }

    fn name_sized(self, width: Width) -> &'static str {
        match width {
            Width::Dword => self.name(),
            Width::Word => ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"][self as usize],
            Width::Byte => ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"][self as usize],
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Condition codes (for Jcc and SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even (x87 unordered after SAHF)
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }

    /// The condition that holds for `b ? a` whenever this one holds for `a ? b`.
    pub fn swap_operands(self) -> Self {
        match self {
            Cond::B => Cond::A,
            Cond::A => Cond::B,
            Cond::Ae => Cond::Be,
            Cond::Be => Cond::Ae,
            Cond::L => Cond::G,
            Cond::G => Cond::L,
            Cond::Le => Cond::Ge,
            Cond::Ge => Cond::Le,
            other => other,
        }
    }

    /// Evaluate a signed comparison at compile time.
    pub fn holds_signed(self, a: i32, b: i32) -> Option<bool> {
        Some(match self {
            Cond::E => a == b,
            Cond::Ne => a != b,
            Cond::L => a < b,
            Cond::Ge => a >= b,
            Cond::G => a > b,
            Cond::Le => a <= b,
            Cond::B => (a as u32) < (b as u32),
            Cond::Ae => (a as u32) >= (b as u32),
            Cond::A => (a as u32) > (b as u32),
            Cond::Be => (a as u32) <= (b as u32),
            _ => return None,
        })
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

/// Operand width of an integer move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }

    fn ptr(self) -> &'static str {
        match self {
            Width::Byte => "byte",
            Width::Word => "word",
            Width::Dword => "dword",
        }
    }
}

/// Memory operand: `[base + index*scale + disp]`, or `[disp]` when absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Option<Reg>,
    pub index: Option<(Reg, u8)>,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Reg, disp: i32) -> Self {
        Mem { base: Some(base), index: None, disp }
    }

    pub fn indexed(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        Mem {
            base: Some(base),
            index: Some((index, scale)),
            disp,
        }
    }

    /// Absolute address (no base register).
    pub fn abs(addr: u32) -> Self {
        Mem {
            base: None,
            index: None,
            disp: addr as i32,
        }
    }

    /// The same address shifted by `delta` bytes.
    pub fn offset(self, delta: i32) -> Self {
        Mem {
            disp: self.disp.wrapping_add(delta),
            ..self
        }
    }

    pub fn uses(&self, reg: Reg) -> bool {
        self.base == Some(reg) || matches!(self.index, Some((r, _)) if r == reg)
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        if let Some(base) = self.base {
            write!(f, "{}", base)?;
            first = false;
        }
        if let Some((index, scale)) = self.index {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{}*{}", index, scale)?;
            first = false;
        }
        if first {
            write!(f, "0x{:x}", self.disp as u32)?;
        } else if self.disp > 0 {
            write!(f, "+{}", self.disp)?;
        } else if self.disp < 0 {
            write!(f, "-{}", (self.disp as i64).unsigned_abs())?;
        }
        f.write_str("]")
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Mem(Mem),
    Imm(i32),
}

impl Operand {
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }

    fn sized(&self, width: Width) -> String {
        match self {
            Operand::Reg(r) => r.name_sized(width).to_string(),
            Operand::Mem(m) => format!("{} {}", width.ptr(), m),
            Operand::Imm(v) => v.to_string(),
        }
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl From<Mem> for Operand {
    fn from(m: Mem) -> Self {
        Operand::Mem(m)
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Operand::Imm(v)
    }
}

/// Two-operand integer ALU operations, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    fn mnemonic(self) -> &'static str {
        ["add", "or", "adc", "sbb", "and", "sub", "xor", "cmp"][self as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Inc,
    Dec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleShiftOp {
    Shld,
    Shrd,
}

/// Shift count: the CL register or an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Cl,
    Imm(u8),
}

/// Size of an x87 memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpSize {
    M32,
    M64,
}

impl FpSize {
    fn ptr(self) -> &'static str {
        match self {
            FpSize::M32 => "dword",
            FpSize::M64 => "qword",
        }
    }
}

/// Popping x87 arithmetic: `st(1) = st(1) op st(0)`, then pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A branch target, resolved by the stream once bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One IA-32 instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    Mov { width: Width, dst: Operand, src: Operand },
    Movsx { width: Width, dst: Reg, src: Operand },
    Movzx { width: Width, dst: Reg, src: Operand },
    Lea { dst: Reg, src: Mem },
    Alu { op: AluOp, dst: Operand, src: Operand },
    Test { dst: Operand, src: Operand },
    Unary { op: UnaryOp, dst: Operand },
    Shift { op: ShiftOp, dst: Reg, count: Count },
    DoubleShift { op: DoubleShiftOp, dst: Reg, src: Reg, count: Count },
    Imul { dst: Reg, src: Operand },
    Mul { src: Operand },
    Idiv { src: Operand },
    Cdq,
    Push(Operand),
    Pop(Operand),
    Jmp(Label),
    Jcc(Cond, Label),
    JmpIndirect(Operand),
    Call(Operand),
    CallLabel(Label),
    Ret(u16),
    Loop(Label),
    Lodsd,
    Int(u8),
    Nop,
    Setcc(Cond, Reg),
    Fld { size: FpSize, src: Mem },
    Fild { size: FpSize, src: Mem },
    Fstp { size: FpSize, dst: Mem },
    Fisttp { size: FpSize, dst: Mem },
    Farith(FpuOp),
    Fchs,
    Fprem,
    Fucompp,
    FnstswAx,
    Sahf,
    Fldz,
    Fld1,
    FstpSt0,
    Fxch,
}

impl Insn {
    /// Check that the operand combination is encodable.
    pub fn validate(&self) -> Result<(), EncodeError> {
        let bad = |why: &str| Err(EncodeError::InvalidOperands(format!("{}: {}", self, why)));
        let mem_mem = |a: &Operand, b: &Operand| a.is_mem() && b.is_mem();
        match self {
            Insn::Mov { width, dst, src } => {
                if dst.is_imm() {
                    return bad("immediate destination");
                }
                if mem_mem(dst, src) {
                    return bad("memory to memory");
                }
                if *width == Width::Byte {
                    for op in [dst, src] {
                        if matches!(op, Operand::Reg(r) if !r.has_byte_form()) {
                            return bad("register has no byte form");
                        }
                    }
                }
            }
            Insn::Movsx { width, src, .. } | Insn::Movzx { width, src, .. } => {
                if *width == Width::Dword {
                    return bad("extension from dword");
                }
                match src {
                    Operand::Imm(_) => return bad("immediate source"),
                    Operand::Reg(r) if *width == Width::Byte && !r.has_byte_form() => {
                        return bad("register has no byte form");
                    }
                    _ => {}
                }
            }
            Insn::Alu { dst, src, .. } | Insn::Test { dst, src } => {
                if dst.is_imm() {
                    return bad("immediate destination");
                }
                if mem_mem(dst, src) {
                    return bad("memory to memory");
                }
            }
            Insn::Unary { dst, .. } | Insn::Pop(dst) => {
                if dst.is_imm() {
                    return bad("immediate operand");
                }
            }
            Insn::Imul { src, .. }
            | Insn::Mul { src }
            | Insn::Idiv { src }
            | Insn::JmpIndirect(src)
            | Insn::Call(src) => {
                if src.is_imm() {
                    return bad("immediate operand");
                }
            }
            Insn::Setcc(_, r) if !r.has_byte_form() => return bad("register has no byte form"),
            Insn::Lea { src, .. } if src.base.is_none() && src.index.is_none() => {
                return bad("lea of absolute address");
            }
            _ => {}
        }
        for mem in self.memory_operands() {
            if let Some((index, scale)) = mem.index {
                if index == Reg::Esp {
                    return bad("esp as index");
                }
                if ![1, 2, 4, 8].contains(&scale) {
                    return bad("scale");
                }
            }
        }
        Ok(())
    }

    fn memory_operands(&self) -> Vec<Mem> {
        let mut out = Vec::new();
        let mut add = |op: &Operand| {
            if let Operand::Mem(m) = op {
                out.push(*m);
            }
        };
        match self {
            Insn::Mov { dst, src, .. } | Insn::Alu { dst, src, .. } | Insn::Test { dst, src } => {
                add(dst);
                add(src);
            }
            Insn::Movsx { src, .. }
            | Insn::Movzx { src, .. }
            | Insn::Imul { src, .. }
            | Insn::Mul { src }
            | Insn::Idiv { src }
            | Insn::Unary { dst: src, .. }
            | Insn::Push(src)
            | Insn::Pop(src)
            | Insn::JmpIndirect(src)
            | Insn::Call(src) => add(src),
            Insn::Lea { src, .. } | Insn::Fld { src, .. } | Insn::Fild { src, .. } => {
                add(&Operand::Mem(*src))
            }
            Insn::Fstp { dst, .. } | Insn::Fisttp { dst, .. } => add(&Operand::Mem(*dst)),
            _ => {}
        }
        out
    }

    /// Labels this instruction refers to.
    pub fn target(&self) -> Option<Label> {
        match self {
            Insn::Jmp(l) | Insn::Jcc(_, l) | Insn::CallLabel(l) | Insn::Loop(l) => Some(*l),
            _ => None,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dw = Width::Dword;
        match self {
            Insn::Mov { width, dst, src } => {
                write!(f, "mov {}, {}", dst.sized(*width), src.sized(*width))
            }
            Insn::Movsx { width, dst, src } => write!(f, "movsx {}, {}", dst, src.sized(*width)),
            Insn::Movzx { width, dst, src } => write!(f, "movzx {}, {}", dst, src.sized(*width)),
            Insn::Lea { dst, src } => write!(f, "lea {}, {}", dst, src),
            Insn::Alu { op, dst, src } => {
                write!(f, "{} {}, {}", op.mnemonic(), dst.sized(dw), src.sized(dw))
            }
            Insn::Test { dst, src } => write!(f, "test {}, {}", dst.sized(dw), src.sized(dw)),
            Insn::Unary { op, dst } => {
                let m = match op {
                    UnaryOp::Not => "not",
                    UnaryOp::Neg => "neg",
                    UnaryOp::Inc => "inc",
                    UnaryOp::Dec => "dec",
                };
                write!(f, "{} {}", m, dst.sized(dw))
            }
            Insn::Shift { op, dst, count } => {
                let m = match op {
                    ShiftOp::Shl => "shl",
                    ShiftOp::Shr => "shr",
                    ShiftOp::Sar => "sar",
                };
                match count {
                    Count::Cl => write!(f, "{} {}, cl", m, dst),
                    Count::Imm(n) => write!(f, "{} {}, {}", m, dst, n),
                }
            }
            Insn::DoubleShift { op, dst, src, count } => {
                let m = match op {
                    DoubleShiftOp::Shld => "shld",
                    DoubleShiftOp::Shrd => "shrd",
                };
                match count {
                    Count::Cl => write!(f, "{} {}, {}, cl", m, dst, src),
                    Count::Imm(n) => write!(f, "{} {}, {}, {}", m, dst, src, n),
                }
            }
            Insn::Imul { dst, src } => write!(f, "imul {}, {}", dst, src.sized(dw)),
            Insn::Mul { src } => write!(f, "mul {}", src.sized(dw)),
            Insn::Idiv { src } => write!(f, "idiv {}", src.sized(dw)),
            Insn::Cdq => f.write_str("cdq"),
            Insn::Push(op) => write!(f, "push {}", op.sized(dw)),
            Insn::Pop(op) => write!(f, "pop {}", op.sized(dw)),
            Insn::Jmp(l) => write!(f, "jmp {}", l),
            Insn::Jcc(c, l) => write!(f, "j{} {}", c.mnemonic(), l),
            Insn::JmpIndirect(op) => write!(f, "jmp {}", op.sized(dw)),
            Insn::Call(op) => write!(f, "call {}", op.sized(dw)),
            Insn::CallLabel(l) => write!(f, "call {}", l),
            Insn::Ret(0) => f.write_str("ret"),
            Insn::Ret(n) => write!(f, "ret {}", n),
            Insn::Loop(l) => write!(f, "loop {}", l),
            Insn::Lodsd => f.write_str("lodsd"),
            Insn::Int(n) => write!(f, "int {}", n),
            Insn::Nop => f.write_str("nop"),
            Insn::Setcc(c, r) => write!(f, "set{} {}", c.mnemonic(), r.name_sized(Width::Byte)),
            Insn::Fld { size, src } => write!(f, "fld {} {}", size.ptr(), src),
            Insn::Fild { size, src } => write!(f, "fild {} {}", size.ptr(), src),
            Insn::Fstp { size, dst } => write!(f, "fstp {} {}", size.ptr(), dst),
            Insn::Fisttp { size, dst } => write!(f, "fisttp {} {}", size.ptr(), dst),
            Insn::Farith(op) => {
                let m = match op {
                    FpuOp::Add => "faddp",
                    FpuOp::Sub => "fsubp",
                    FpuOp::Mul => "fmulp",
                    FpuOp::Div => "fdivp",
                };
                write!(f, "{} st(1), st(0)", m)
            }
            Insn::Fchs => f.write_str("fchs"),
            Insn::Fprem => f.write_str("fprem"),
            Insn::Fucompp => f.write_str("fucompp"),
            Insn::FnstswAx => f.write_str("fnstsw ax"),
            Insn::Sahf => f.write_str("sahf"),
            Insn::Fldz => f.write_str("fldz"),
            Insn::Fld1 => f.write_str("fld1"),
            Insn::FstpSt0 => f.write_str("fstp st(0)"),
            Insn::Fxch => f.write_str("fxch st(1)"),
        }
    }
}

/// Errors raised while encoding or resolving an instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("invalid operands for {0}")]
    InvalidOperands(String),
    #[error("label {0} is referenced but never bound")]
    UnboundLabel(Label),
    #[error("label {0} is bound twice")]
    LabelRebound(Label),
    #[error("branch to {0} does not fit in a rel8 displacement")]
    Rel8OutOfRange(Label),
}

/// Sink for emitted instructions.
///
/// Implementations may defer errors (e.g. an invalid operand combination)
/// until the stream is finished; emission itself never fails.
pub trait CodeStream {
    fn emit(&mut self, insn: Insn);

    /// Allocate a fresh, unbound label.
    fn new_label(&mut self) -> Label;

    /// Bind `label` to the position of the next emitted instruction.
    fn bind(&mut self, label: Label);

    /// Current native offset (bytes for the encoder, instructions for a listing).
    fn position(&self) -> usize;
}

/// Mnemonic-style helpers over any [`CodeStream`].
pub trait Emit: CodeStream {
    fn mov(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.mov_w(Width::Dword, dst, src);
    }

    fn mov_w(&mut self, width: Width, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.emit(Insn::Mov {
            width,
            dst: dst.into(),
            src: src.into(),
        });
    }

    fn movsx(&mut self, width: Width, dst: Reg, src: impl Into<Operand>) {
        self.emit(Insn::Movsx {
            width,
            dst,
            src: src.into(),
        });
    }

    fn movzx(&mut self, width: Width, dst: Reg, src: impl Into<Operand>) {
        self.emit(Insn::Movzx {
            width,
            dst,
            src: src.into(),
        });
    }

    fn lea(&mut self, dst: Reg, src: Mem) {
        self.emit(Insn::Lea { dst, src });
    }

    fn alu(&mut self, op: AluOp, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.emit(Insn::Alu {
            op,
            dst: dst.into(),
            src: src.into(),
        });
    }

    fn add(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.alu(AluOp::Add, dst, src);
    }

    fn sub(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.alu(AluOp::Sub, dst, src);
    }

    fn and(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.alu(AluOp::And, dst, src);
    }

    fn or(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.alu(AluOp::Or, dst, src);
    }

    fn xor(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.alu(AluOp::Xor, dst, src);
    }

    fn cmp(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.alu(AluOp::Cmp, dst, src);
    }

    fn test(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.emit(Insn::Test {
            dst: dst.into(),
            src: src.into(),
        });
    }

    fn unary(&mut self, op: UnaryOp, dst: impl Into<Operand>) {
        self.emit(Insn::Unary { op, dst: dst.into() });
    }

    fn shift(&mut self, op: ShiftOp, dst: Reg, count: Count) {
        self.emit(Insn::Shift { op, dst, count });
    }

    fn double_shift(&mut self, op: DoubleShiftOp, dst: Reg, src: Reg, count: Count) {
        self.emit(Insn::DoubleShift { op, dst, src, count });
    }

    fn imul(&mut self, dst: Reg, src: impl Into<Operand>) {
        self.emit(Insn::Imul { dst, src: src.into() });
    }

    fn mul(&mut self, src: impl Into<Operand>) {
        self.emit(Insn::Mul { src: src.into() });
    }

    fn idiv(&mut self, src: impl Into<Operand>) {
        self.emit(Insn::Idiv { src: src.into() });
    }

    fn push(&mut self, op: impl Into<Operand>) {
        self.emit(Insn::Push(op.into()));
    }

    fn pop(&mut self, op: impl Into<Operand>) {
        self.emit(Insn::Pop(op.into()));
    }

    fn jmp(&mut self, label: Label) {
        self.emit(Insn::Jmp(label));
    }

    fn jcc(&mut self, cond: Cond, label: Label) {
        self.emit(Insn::Jcc(cond, label));
    }

    fn call(&mut self, target: impl Into<Operand>) {
        self.emit(Insn::Call(target.into()));
    }
}

impl<T: CodeStream + ?Sized> Emit for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_swap_and_invert() {
        assert_eq!(Cond::L.swap_operands(), Cond::G);
        assert_eq!(Cond::Ae.swap_operands(), Cond::Be);
        assert_eq!(Cond::E.swap_operands(), Cond::E);
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::A.holds_signed(-1, 3), Some(true));
        assert_eq!(Cond::G.holds_signed(-1, 3), Some(false));
    }

    #[test]
    fn test_validate_rejects_bad_forms() {
        let mm = Insn::Mov {
            width: Width::Dword,
            dst: Mem::base(Reg::Ebp, -4).into(),
            src: Mem::base(Reg::Ebp, -8).into(),
        };
        assert!(mm.validate().is_err());

        let esi_byte = Insn::Mov {
            width: Width::Byte,
            dst: Mem::base(Reg::Eax, 12).into(),
            src: Reg::Esi.into(),
        };
        assert!(esi_byte.validate().is_err());

        let esp_index = Insn::Lea {
            dst: Reg::Eax,
            src: Mem::indexed(Reg::Ebx, Reg::Esp, 4, 0),
        };
        assert!(esp_index.validate().is_err());

        let ok = Insn::Alu {
            op: AluOp::Cmp,
            dst: Mem::base(Reg::Ebx, 8).into(),
            src: Operand::Imm(3),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_display_intel_syntax() {
        let insn = Insn::Mov {
            width: Width::Dword,
            dst: Reg::Eax.into(),
            src: Mem::base(Reg::Ebp, -8).into(),
        };
        assert_eq!(insn.to_string(), "mov eax, dword [ebp-8]");

        let insn = Insn::Movsx {
            width: Width::Byte,
            dst: Reg::Ebx,
            src: Mem::indexed(Reg::Ebx, Reg::Ecx, 1, 12).into(),
        };
        assert_eq!(insn.to_string(), "movsx ebx, byte [ebx+ecx*1+12]");
        assert_eq!(Insn::Call(Mem::abs(0x8000).into()).to_string(), "call dword [0x8000]");
    }
}
