//! IA-32 subset executor for [`Listing`]s.
//!
//! Instruction `k` of the `n`th loaded listing lives at
//! `CODE_BASE + n * CODE_STRIDE + k`. A call to an address in the hook range
//! stops execution with [`Exit::Hook`] so the runtime can service the helper.

use super::Fault;
use crate::meta::Helper;
use crate::x86::{
    AluOp, Cond, Count, DoubleShiftOp, FpSize, FpuOp, Insn, Label, Listing, Mem, Operand, Reg,
    ShiftOp, UnaryOp, Width,
};
use std::collections::HashMap;

pub const NULL_PAGE_END: u32 = 0x1000;
pub const CODE_BASE: u32 = 0x4000_0000;
pub const CODE_STRIDE: u32 = 0x0001_0000;
/// Helper `i` is entered at `HOOK_BASE + 4*i`.
pub const HOOK_BASE: u32 = 0xFFFF_0000;
/// Return address that ends a top-level call.
pub const RETURN_SENTINEL: u32 = 0xFFFF_FFF0;

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// x87 status word condition bits
const C0: u16 = 1 << 8;
const C2: u16 = 1 << 10;
const C3: u16 = 1 << 14;

// =============================================================================
// Memory
// =============================================================================

fn unmapped(addr: u32) -> Fault {
    if addr < NULL_PAGE_END {
        Fault::NullPointer
    } else {
        Fault::BadAddress(addr)
    }
}

/// Sparse little-endian memory. Only explicitly mapped pages are accessible,
/// and the page at address zero is never mapped.
#[derive(Default)]
pub struct Memory {
    pages: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
}

impl Memory {
    /// Map zeroed pages covering `[base, base + len)`.
    pub fn map(&mut self, base: u32, len: u32) {
        if len == 0 {
            return;
        }
        let first = base >> PAGE_SHIFT;
        let last = base.saturating_add(len - 1) >> PAGE_SHIFT;
        for page in first..=last {
            if page == 0 {
                continue;
            }
            self.pages
                .entry(page)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
        }
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8, Fault> {
        let page = self.pages.get(&(addr >> PAGE_SHIFT)).ok_or(unmapped(addr))?;
        Ok(page[addr as usize & (PAGE_SIZE - 1)])
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Fault> {
        let page = self
            .pages
            .get_mut(&(addr >> PAGE_SHIFT))
            .ok_or(unmapped(addr))?;
        page[addr as usize & (PAGE_SIZE - 1)] = value;
        Ok(())
    }

    pub fn read(&self, addr: u32, width: Width) -> Result<u32, Fault> {
        let mut value = 0u32;
        for i in 0..width.bytes() {
            value |= (self.read_u8(addr.wrapping_add(i))? as u32) << (8 * i);
        }
        Ok(value)
    }

    pub fn write(&mut self, addr: u32, width: Width, value: u32) -> Result<(), Fault> {
        for i in 0..width.bytes() {
            self.write_u8(addr.wrapping_add(i), (value >> (8 * i)) as u8)?;
        }
        Ok(())
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, Fault> {
        self.read(addr, Width::Dword)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), Fault> {
        self.write(addr, Width::Dword, value)
    }

    pub fn read_u64(&self, addr: u32) -> Result<u64, Fault> {
        let lo = self.read_u32(addr)? as u64;
        let hi = self.read_u32(addr.wrapping_add(4))? as u64;
        Ok(hi << 32 | lo)
    }

    pub fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), Fault> {
        self.write_u32(addr, value as u32)?;
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32)
    }
}

// =============================================================================
// Machine
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub cf: bool,
    pub zf: bool,
    pub sf: bool,
    pub of: bool,
    pub pf: bool,
}

impl Flags {
    fn holds(&self, cond: Cond) -> bool {
        match cond {
            Cond::O => self.of,
            Cond::No => !self.of,
            Cond::B => self.cf,
            Cond::Ae => !self.cf,
            Cond::E => self.zf,
            Cond::Ne => !self.zf,
            Cond::Be => self.cf || self.zf,
            Cond::A => !self.cf && !self.zf,
            Cond::S => self.sf,
            Cond::Ns => !self.sf,
            Cond::P => self.pf,
            Cond::Np => !self.pf,
            Cond::L => self.sf != self.of,
            Cond::Ge => self.sf == self.of,
            Cond::Le => self.zf || self.sf != self.of,
            Cond::G => !self.zf && self.sf == self.of,
        }
    }
}

/// Why [`Machine::run`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Control returned to [`RETURN_SENTINEL`].
    Return,
    /// A runtime helper was called; its return address is at `[esp]`.
    Hook(Helper),
}

pub struct Machine {
    pub mem: Memory,
    regs: [u32; 8],
    pub flags: Flags,
    fpu: Vec<f64>,
    fpu_status: u16,
    eip: u32,
    code: Vec<Listing>,
    steps: u64,
    max_steps: u64,
}

impl Machine {
    pub fn new(max_steps: u64) -> Self {
        Self {
            mem: Memory::default(),
            regs: [0; 8],
            flags: Flags::default(),
            fpu: Vec::new(),
            fpu_status: 0,
            eip: RETURN_SENTINEL,
            code: Vec::new(),
            steps: 0,
            max_steps,
        }
    }

    /// Load a listing and return its code base address.
    pub fn load(&mut self, listing: Listing) -> Result<u32, Fault> {
        if listing.len() >= CODE_STRIDE as usize {
            return Err(Fault::IllegalInstruction(format!(
                "listing of {} instructions does not fit a code region",
                listing.len()
            )));
        }
        let base = CODE_BASE + self.code.len() as u32 * CODE_STRIDE;
        self.code.push(listing);
        Ok(base)
    }

    pub fn hook_address(helper: Helper) -> u32 {
        HOOK_BASE + 4 * helper.index()
    }

    pub fn reg(&self, r: Reg) -> u32 {
        self.regs[r as usize]
    }

    pub fn set_reg(&mut self, r: Reg, value: u32) {
        self.regs[r as usize] = value;
    }

    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn push(&mut self, value: u32) -> Result<(), Fault> {
        let esp = self.reg(Reg::Esp).wrapping_sub(4);
        self.mem.write_u32(esp, value)?;
        self.set_reg(Reg::Esp, esp);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<u32, Fault> {
        let esp = self.reg(Reg::Esp);
        let value = self.mem.read_u32(esp)?;
        self.set_reg(Reg::Esp, esp.wrapping_add(4));
        Ok(value)
    }

    /// Return from a hook: pop the return address and `arg_words` argument
    /// words, as the managed convention requires of the callee.
    pub fn return_from_hook(&mut self, arg_words: u32) -> Result<(), Fault> {
        let ret = self.pop()?;
        let esp = self.reg(Reg::Esp).wrapping_add(4 * arg_words);
        self.set_reg(Reg::Esp, esp);
        self.eip = ret;
        Ok(())
    }

    /// Argument word `i` of a hook taking `arg_words` words (first pushed is 0).
    pub fn hook_arg(&self, arg_words: u32, i: u32) -> Result<u32, Fault> {
        let esp = self.reg(Reg::Esp);
        self.mem.read_u32(esp + 4 + 4 * (arg_words - 1 - i))
    }

    /// Run until control reaches the return sentinel or a hook.
    pub fn run(&mut self) -> Result<Exit, Fault> {
        loop {
            if self.eip == RETURN_SENTINEL {
                return Ok(Exit::Return);
            }
            if self.eip >= HOOK_BASE {
                let helper = Helper::from_index((self.eip - HOOK_BASE) / 4)
                    .filter(|_| self.eip % 4 == 0)
                    .ok_or(Fault::BadJump(self.eip))?;
                return Ok(Exit::Hook(helper));
            }
            self.steps += 1;
            if self.steps > self.max_steps {
                return Err(Fault::StepLimit(self.max_steps));
            }
            let (base, insn) = self.fetch()?;
            self.eip += 1;
            self.execute(base, &insn)?;
        }
    }

    fn fetch(&self) -> Result<(u32, Insn), Fault> {
        let bad = Fault::BadJump(self.eip);
        let offset = self.eip.checked_sub(CODE_BASE).ok_or(bad.clone())?;
        let index = offset / CODE_STRIDE;
        let listing = self.code.get(index as usize).ok_or(bad.clone())?;
        let insn = listing
            .insns()
            .get((offset % CODE_STRIDE) as usize)
            .ok_or(bad)?;
        Ok((CODE_BASE + index * CODE_STRIDE, insn.clone()))
    }

    fn label_address(&self, base: u32, label: Label) -> Result<u32, Fault> {
        let listing = &self.code[((base - CODE_BASE) / CODE_STRIDE) as usize];
        listing
            .target(label)
            .map(|k| base + k as u32)
            .ok_or(Fault::BadJump(base))
    }

    // ==================== Operands ====================

    fn address(&self, m: &Mem) -> u32 {
        let mut addr = m.disp as u32;
        if let Some(base) = m.base {
            addr = addr.wrapping_add(self.reg(base));
        }
        if let Some((index, scale)) = m.index {
            addr = addr.wrapping_add(self.reg(index).wrapping_mul(scale as u32));
        }
        addr
    }

    fn read(&self, op: &Operand, width: Width) -> Result<u32, Fault> {
        let mask = match width {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => u32::MAX,
        };
        match op {
            Operand::Reg(r) => Ok(self.reg(*r) & mask),
            Operand::Mem(m) => self.mem.read(self.address(m), width),
            Operand::Imm(v) => Ok(*v as u32 & mask),
        }
    }

    fn write(&mut self, op: &Operand, width: Width, value: u32) -> Result<(), Fault> {
        match op {
            Operand::Reg(r) => {
                let old = self.reg(*r);
                let new = match width {
                    Width::Byte => old & !0xFF | value & 0xFF,
                    Width::Word => old & !0xFFFF | value & 0xFFFF,
                    Width::Dword => value,
                };
                self.set_reg(*r, new);
                Ok(())
            }
            Operand::Mem(m) => self.mem.write(self.address(m), width, value),
            Operand::Imm(_) => Err(Fault::IllegalInstruction("write to an immediate".into())),
        }
    }

    // ==================== Flags ====================

    fn set_result_flags(&mut self, r: u32) {
        self.flags.zf = r == 0;
        self.flags.sf = (r as i32) < 0;
        self.flags.pf = (r as u8).count_ones() % 2 == 0;
    }

    fn alu(&mut self, op: AluOp, a: u32, b: u32) -> u32 {
        let carry = self.flags.cf as u64;
        let r = match op {
            AluOp::Add | AluOp::Adc => {
                let c = if op == AluOp::Adc { carry } else { 0 };
                let wide = a as u64 + b as u64 + c;
                let r = wide as u32;
                self.flags.cf = wide > u32::MAX as u64;
                self.flags.of = ((a ^ r) & (b ^ r)) >> 31 == 1;
                r
            }
            AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
                let c = if op == AluOp::Sbb { carry } else { 0 };
                let r = a.wrapping_sub(b).wrapping_sub(c as u32);
                self.flags.cf = (a as u64) < b as u64 + c;
                self.flags.of = ((a ^ b) & (a ^ r)) >> 31 == 1;
                r
            }
            AluOp::And | AluOp::Or | AluOp::Xor => {
                self.flags.cf = false;
                self.flags.of = false;
                match op {
                    AluOp::And => a & b,
                    AluOp::Or => a | b,
                    _ => a ^ b,
                }
            }
        };
        self.set_result_flags(r);
        r
    }

    fn shift_count(&self, count: Count) -> u32 {
        let n = match count {
            Count::Cl => self.reg(Reg::Ecx),
            Count::Imm(n) => n as u32,
        };
        n & 31
    }

    // ==================== x87 ====================

    fn fpu_push(&mut self, v: f64) {
        self.fpu.push(v);
    }

    fn fpu_pop(&mut self) -> Result<f64, Fault> {
        self.fpu
            .pop()
            .ok_or_else(|| Fault::IllegalInstruction("x87 stack underflow".into()))
    }

    fn fpu_top(&mut self, depth: usize) -> Result<&mut f64, Fault> {
        let n = self.fpu.len();
        n.checked_sub(depth + 1)
            .and_then(|i| self.fpu.get_mut(i))
            .ok_or_else(|| Fault::IllegalInstruction("x87 stack underflow".into()))
    }

    /// Truncating store conversion; out-of-range and NaN give the integer
    /// indefinite value.
    fn truncate(v: f64, size: FpSize) -> u64 {
        match size {
            FpSize::M32 if v > -2_147_483_649.0 && v < 2_147_483_648.0 => v as i32 as u32 as u64,
            FpSize::M32 => 0x8000_0000,
            FpSize::M64 if v >= -9.223_372_036_854_776e18 && v < 9.223_372_036_854_776e18 => {
                v as i64 as u64
            }
            FpSize::M64 => 1 << 63,
        }
    }

    // ==================== Execution ====================

    fn execute(&mut self, base: u32, insn: &Insn) -> Result<(), Fault> {
        let dw = Width::Dword;
        match insn {
            Insn::Mov { width, dst, src } => {
                let v = self.read(src, *width)?;
                self.write(dst, *width, v)?;
            }
            Insn::Movsx { width, dst, src } => {
                let v = self.read(src, *width)?;
                let v = match width {
                    Width::Byte => v as u8 as i8 as i32 as u32,
                    Width::Word => v as u16 as i16 as i32 as u32,
                    Width::Dword => v,
                };
                self.set_reg(*dst, v);
            }
            Insn::Movzx { width, dst, src } => {
                let v = self.read(src, *width)?;
                self.set_reg(*dst, v);
            }
            Insn::Lea { dst, src } => {
                let addr = self.address(src);
                self.set_reg(*dst, addr);
            }
            Insn::Alu { op, dst, src } => {
                let a = self.read(dst, dw)?;
                let b = self.read(src, dw)?;
                let r = self.alu(*op, a, b);
                if *op != AluOp::Cmp {
                    self.write(dst, dw, r)?;
                }
            }
            Insn::Test { dst, src } => {
                let r = self.read(dst, dw)? & self.read(src, dw)?;
                self.flags.cf = false;
                self.flags.of = false;
                self.set_result_flags(r);
            }
            Insn::Unary { op, dst } => {
                let v = self.read(dst, dw)?;
                let r = match op {
                    UnaryOp::Not => !v,
                    UnaryOp::Neg => {
                        self.flags.cf = v != 0;
                        self.flags.of = v == 0x8000_0000;
                        v.wrapping_neg()
                    }
                    UnaryOp::Inc => {
                        self.flags.of = v == 0x7FFF_FFFF;
                        v.wrapping_add(1)
                    }
                    UnaryOp::Dec => {
                        self.flags.of = v == 0x8000_0000;
                        v.wrapping_sub(1)
                    }
                };
                if *op != UnaryOp::Not {
                    self.set_result_flags(r);
                }
                self.write(dst, dw, r)?;
            }
            Insn::Shift { op, dst, count } => {
                let n = self.shift_count(*count);
                if n != 0 {
                    let v = self.reg(*dst);
                    let (r, cf) = match op {
                        ShiftOp::Shl => (v << n, (v >> (32 - n)) & 1 == 1),
                        ShiftOp::Shr => (v >> n, (v >> (n - 1)) & 1 == 1),
                        ShiftOp::Sar => (((v as i32) >> n) as u32, (v >> (n - 1)) & 1 == 1),
                    };
                    self.flags.cf = cf;
                    self.set_result_flags(r);
                    self.set_reg(*dst, r);
                }
            }
            Insn::DoubleShift { op, dst, src, count } => {
                let n = self.shift_count(*count);
                if n != 0 {
                    let (d, s) = (self.reg(*dst), self.reg(*src));
                    let r = match op {
                        DoubleShiftOp::Shld => d << n | s >> (32 - n),
                        DoubleShiftOp::Shrd => d >> n | s << (32 - n),
                    };
                    self.set_result_flags(r);
                    self.set_reg(*dst, r);
                }
            }
            Insn::Imul { dst, src } => {
                let wide = self.reg(*dst) as i32 as i64 * self.read(src, dw)? as i32 as i64;
                let r = wide as i32;
                self.flags.cf = r as i64 != wide;
                self.flags.of = self.flags.cf;
                self.set_reg(*dst, r as u32);
            }
            Insn::Mul { src } => {
                let wide = self.reg(Reg::Eax) as u64 * self.read(src, dw)? as u64;
                self.set_reg(Reg::Eax, wide as u32);
                self.set_reg(Reg::Edx, (wide >> 32) as u32);
                self.flags.cf = wide >> 32 != 0;
                self.flags.of = self.flags.cf;
            }
            Insn::Idiv { src } => {
                let divisor = self.read(src, dw)? as i32 as i64;
                if divisor == 0 {
                    return Err(Fault::DivideByZero);
                }
                let dividend =
                    ((self.reg(Reg::Edx) as u64) << 32 | self.reg(Reg::Eax) as u64) as i64;
                let quotient = dividend.wrapping_div(divisor);
                if quotient != quotient as i32 as i64 {
                    return Err(Fault::DivideByZero);
                }
                self.set_reg(Reg::Eax, quotient as u32);
                self.set_reg(Reg::Edx, dividend.wrapping_rem(divisor) as u32);
            }
            Insn::Cdq => {
                let sign = if (self.reg(Reg::Eax) as i32) < 0 { u32::MAX } else { 0 };
                self.set_reg(Reg::Edx, sign);
            }
            Insn::Push(op) => {
                let v = self.read(op, dw)?;
                self.push(v)?;
            }
            Insn::Pop(op) => {
                let v = self.pop()?;
                self.write(op, dw, v)?;
            }
            Insn::Jmp(label) => self.eip = self.label_address(base, *label)?,
            Insn::Jcc(cond, label) => {
                if self.flags.holds(*cond) {
                    self.eip = self.label_address(base, *label)?;
                }
            }
            Insn::JmpIndirect(op) => self.eip = self.read(op, dw)?,
            Insn::Call(op) => {
                let target = self.read(op, dw)?;
                self.push(self.eip)?;
                self.eip = target;
            }
            Insn::CallLabel(label) => {
                let target = self.label_address(base, *label)?;
                self.push(self.eip)?;
                self.eip = target;
            }
            Insn::Ret(n) => {
                let ret = self.pop()?;
                let esp = self.reg(Reg::Esp).wrapping_add(*n as u32);
                self.set_reg(Reg::Esp, esp);
                self.eip = ret;
            }
            Insn::Loop(label) => {
                let ecx = self.reg(Reg::Ecx).wrapping_sub(1);
                self.set_reg(Reg::Ecx, ecx);
                if ecx != 0 {
                    self.eip = self.label_address(base, *label)?;
                }
            }
            Insn::Lodsd => {
                let esi = self.reg(Reg::Esi);
                let v = self.mem.read_u32(esi)?;
                self.set_reg(Reg::Eax, v);
                self.set_reg(Reg::Esi, esi.wrapping_add(4));
            }
            Insn::Int(5) => return Err(Fault::ArrayBounds),
            Insn::Int(n) => return Err(Fault::IllegalInstruction(format!("int {}", n))),
            Insn::Nop => {}
            Insn::Setcc(cond, r) => {
                let v = self.flags.holds(*cond) as u32;
                self.write(&Operand::Reg(*r), Width::Byte, v)?;
            }

            Insn::Fld { size, src } => {
                let addr = self.address(src);
                let v = match size {
                    FpSize::M32 => f32::from_bits(self.mem.read_u32(addr)?) as f64,
                    FpSize::M64 => f64::from_bits(self.mem.read_u64(addr)?),
                };
                self.fpu_push(v);
            }
            Insn::Fild { size, src } => {
                let addr = self.address(src);
                let v = match size {
                    FpSize::M32 => self.mem.read_u32(addr)? as i32 as f64,
                    FpSize::M64 => self.mem.read_u64(addr)? as i64 as f64,
                };
                self.fpu_push(v);
            }
            Insn::Fstp { size, dst } => {
                let v = self.fpu_pop()?;
                let addr = self.address(dst);
                match size {
                    FpSize::M32 => self.mem.write_u32(addr, (v as f32).to_bits())?,
                    FpSize::M64 => self.mem.write_u64(addr, v.to_bits())?,
                }
            }
            Insn::Fisttp { size, dst } => {
                let v = self.fpu_pop()?;
                let addr = self.address(dst);
                let bits = Self::truncate(v, *size);
                match size {
                    FpSize::M32 => self.mem.write_u32(addr, bits as u32)?,
                    FpSize::M64 => self.mem.write_u64(addr, bits)?,
                }
            }
            Insn::Farith(op) => {
                let b = self.fpu_pop()?;
                let a = self.fpu_pop()?;
                self.fpu_push(match op {
                    FpuOp::Add => a + b,
                    FpuOp::Sub => a - b,
                    FpuOp::Mul => a * b,
                    FpuOp::Div => a / b,
                });
            }
            Insn::Fchs => {
                let top = self.fpu_top(0)?;
                *top = -*top;
            }
            Insn::Fprem => {
                let divisor = *self.fpu_top(1)?;
                let top = self.fpu_top(0)?;
                *top %= divisor;
                self.fpu_status &= !C2;
            }
            Insn::Fucompp => {
                let a = self.fpu_pop()?;
                let b = self.fpu_pop()?;
                self.fpu_status &= !(C0 | C2 | C3);
                self.fpu_status |= match a.partial_cmp(&b) {
                    None => C0 | C2 | C3,
                    Some(std::cmp::Ordering::Less) => C0,
                    Some(std::cmp::Ordering::Equal) => C3,
                    Some(std::cmp::Ordering::Greater) => 0,
                };
            }
            Insn::FnstswAx => {
                let eax = self.reg(Reg::Eax) & 0xFFFF_0000 | self.fpu_status as u32;
                self.set_reg(Reg::Eax, eax);
            }
            Insn::Sahf => {
                let ah = (self.reg(Reg::Eax) >> 8) as u8;
                self.flags.cf = ah & 0x01 != 0;
                self.flags.pf = ah & 0x04 != 0;
                self.flags.zf = ah & 0x40 != 0;
                self.flags.sf = ah & 0x80 != 0;
            }
            Insn::Fldz => self.fpu_push(0.0),
            Insn::Fld1 => self.fpu_push(1.0),
            Insn::FstpSt0 => {
                self.fpu_pop()?;
            }
            Insn::Fxch => {
                let n = self.fpu.len();
                if n < 2 {
                    return Err(Fault::IllegalInstruction("x87 stack underflow".into()));
                }
                self.fpu.swap(n - 1, n - 2);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{CodeStream, Emit};

    const STACK_TOP: u32 = 0x0080_0000;

    fn machine(listing: Listing) -> (Machine, u32) {
        let mut m = Machine::new(1000);
        m.mem.map(STACK_TOP - 0x1000, 0x1000);
        m.set_reg(Reg::Esp, STACK_TOP);
        let base = m.load(listing).unwrap();
        m.push(RETURN_SENTINEL).unwrap();
        m.set_eip(base);
        (m, base)
    }

    #[test]
    fn test_memory_is_little_endian() {
        let mut mem = Memory::default();
        mem.map(0x2000, 8);
        mem.write_u32(0x2000, 0x1122_3344).unwrap();
        assert_eq!(mem.read_u8(0x2000).unwrap(), 0x44);
        assert_eq!(mem.read(0x2002, Width::Word).unwrap(), 0x1122);
        assert_eq!(mem.read_u32(0x10), Err(Fault::NullPointer));
        assert_eq!(mem.read_u32(0x9000), Err(Fault::BadAddress(0x9000)));
        // Straddling the end of the mapped page faults on the first missing byte.
        assert_eq!(mem.read_u32(0x2FFE), Err(Fault::BadAddress(0x3000)));
    }

    #[test]
    fn test_carry_chain_and_loop() {
        let mut l = Listing::new();
        let top = l.new_label();
        l.mov(Reg::Eax, -1);
        l.mov(Reg::Edx, 0);
        l.add(Reg::Eax, 1);
        l.alu(AluOp::Adc, Reg::Edx, 0);
        l.mov(Reg::Ecx, 3);
        l.mov(Reg::Ebx, 0);
        l.bind(top);
        l.add(Reg::Ebx, 2);
        l.emit(Insn::Loop(top));
        l.emit(Insn::Ret(0));
        let (mut m, _) = machine(l);
        assert_eq!(m.run(), Ok(Exit::Return));
        assert_eq!(m.reg(Reg::Eax), 0);
        assert_eq!(m.reg(Reg::Edx), 1);
        assert_eq!(m.reg(Reg::Ebx), 6);
    }

    #[test]
    fn test_idiv_faults() {
        let mut l = Listing::new();
        l.mov(Reg::Eax, 7);
        l.emit(Insn::Cdq);
        l.mov(Reg::Ecx, 0);
        l.idiv(Reg::Ecx);
        let (mut m, _) = machine(l);
        assert_eq!(m.run(), Err(Fault::DivideByZero));
    }

    #[test]
    fn test_helper_call_stops_at_hook() {
        let mut l = Listing::new();
        l.push(5);
        l.mov(Reg::Eax, Machine::hook_address(Helper::Yield) as i32);
        l.call(Reg::Eax);
        l.emit(Insn::Ret(0));
        let (mut m, _) = machine(l);
        assert_eq!(m.run(), Ok(Exit::Hook(Helper::Yield)));
        assert_eq!(m.hook_arg(1, 0).unwrap(), 5);
        m.return_from_hook(1).unwrap();
        assert_eq!(m.run(), Ok(Exit::Return));
    }

    #[test]
    fn test_fucompp_sets_flags_through_sahf() {
        let mut l = Listing::new();
        l.emit(Insn::Fld1);
        l.emit(Insn::Fldz);
        // st0 = 0, st1 = 1: below
        l.emit(Insn::Fucompp);
        l.emit(Insn::FnstswAx);
        l.emit(Insn::Sahf);
        l.emit(Insn::Setcc(Cond::B, Reg::Ebx));
        l.emit(Insn::Ret(0));
        let (mut m, _) = machine(l);
        m.run().unwrap();
        assert_eq!(m.reg(Reg::Ebx) & 0xFF, 1);
    }

    #[test]
    fn test_step_limit() {
        let mut l = Listing::new();
        let spin = l.new_label();
        l.bind(spin);
        l.jmp(spin);
        let (mut m, _) = machine(l);
        assert_eq!(m.run(), Err(Fault::StepLimit(1000)));
    }
}
