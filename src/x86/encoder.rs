//! IA-32 instruction encoding.
//!
//! [`Assembler`] is the byte-producing [`CodeStream`]. Every [`Insn`] is
//! encoded in its 32-bit protected-mode form; branches to labels always use
//! rel32 displacements except LOOP, which only exists with rel8.

use super::codebuf::{CodeBuffer, RefSize};
use super::{
    AluOp, CodeStream, Count, DoubleShiftOp, EncodeError, FpSize, FpuOp, Insn, Label, Mem,
    Operand, Reg, ShiftOp, UnaryOp, Width,
};

/// Encoding [`CodeStream`] backed by a [`CodeBuffer`].
pub struct Assembler {
    buf: CodeBuffer,
    /// First error seen while emitting; reported by `finish`.
    error: Option<EncodeError>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::with_capacity(256),
            error: None,
        }
    }

    /// Resolve label references and return the encoded bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, EncodeError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.buf.resolve()?;
        Ok(self.buf.into_code())
    }

    /// Raw bytes emitted so far (label references unpatched).
    pub fn code(&self) -> &[u8] {
        self.buf.code()
    }

    fn fail(&mut self, err: EncodeError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    // ==================== ModR/M helpers ====================

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    fn sib(scale: u8, index: u8, base: u8) -> u8 {
        let ss = match scale {
            1 => 0,
            2 => 1,
            4 => 2,
            _ => 3,
        };
        (ss << 6) | ((index & 0x7) << 3) | (base & 0x7)
    }

    /// Emit the ModR/M (+SIB +displacement) bytes for a memory operand.
    fn emit_mem(&mut self, reg: u8, mem: &Mem) {
        let disp = mem.disp;
        let disp_mode = |base: Reg| {
            if disp == 0 && base != Reg::Ebp {
                0b00
            } else if (-128..=127).contains(&disp) {
                0b01
            } else {
                0b10
            }
        };

        match (mem.base, mem.index) {
            (None, None) => {
                self.buf.emit_u8(Self::modrm(0b00, reg, 0b101));
                self.buf.emit_u32(disp as u32);
                return;
            }
            (None, Some((index, scale))) => {
                self.buf.emit_u8(Self::modrm(0b00, reg, 0b100));
                self.buf.emit_u8(Self::sib(scale, index.code(), 0b101));
                self.buf.emit_u32(disp as u32);
                return;
            }
            (Some(base), None) => {
                let mode = disp_mode(base);
                if base == Reg::Esp {
                    // ESP as base always needs a SIB byte
                    self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                    self.buf.emit_u8(0x24);
                } else {
                    self.buf.emit_u8(Self::modrm(mode, reg, base.code()));
                }
                self.emit_disp(mode, disp);
            }
            (Some(base), Some((index, scale))) => {
                let mode = disp_mode(base);
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(Self::sib(scale, index.code(), base.code()));
                self.emit_disp(mode, disp);
            }
        }
    }

    fn emit_disp(&mut self, mode: u8, disp: i32) {
        match mode {
            0b01 => self.buf.emit_u8(disp as i8 as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// Emit ModR/M for a register-or-memory operand.
    fn emit_rm(&mut self, reg: u8, rm: &Operand) {
        match rm {
            Operand::Reg(r) => self.buf.emit_u8(Self::modrm(0b11, reg, r.code())),
            Operand::Mem(m) => self.emit_mem(reg, m),
            Operand::Imm(_) => unreachable!("immediates are rejected by Insn::validate"),
        }
    }

    fn emit_imm(&mut self, width: Width, value: i32) {
        match width {
            Width::Byte => self.buf.emit_u8(value as u8),
            Width::Word => self.buf.emit_u16(value as u16),
            Width::Dword => self.buf.emit_u32(value as u32),
        }
    }

    // ==================== Encoders ====================

    fn encode_mov(&mut self, width: Width, dst: &Operand, src: &Operand) {
        if width == Width::Word {
            self.buf.emit_u8(0x66); // operand-size prefix
        }
        let byte = width == Width::Byte;
        match (dst, src) {
            (Operand::Reg(d), Operand::Imm(v)) => {
                // MOV r, imm
                self.buf.emit_u8(if byte { 0xB0 } else { 0xB8 } + d.code());
                self.emit_imm(width, *v);
            }
            (Operand::Mem(_), Operand::Imm(v)) => {
                // MOV r/m, imm
                self.buf.emit_u8(if byte { 0xC6 } else { 0xC7 });
                self.emit_rm(0, dst);
                self.emit_imm(width, *v);
            }
            (_, Operand::Reg(s)) => {
                // MOV r/m, r
                self.buf.emit_u8(if byte { 0x88 } else { 0x89 });
                self.emit_rm(s.code(), dst);
            }
            (Operand::Reg(d), Operand::Mem(_)) => {
                // MOV r, r/m
                self.buf.emit_u8(if byte { 0x8A } else { 0x8B });
                self.emit_rm(d.code(), src);
            }
            _ => unreachable!("rejected by Insn::validate"),
        }
    }

    fn encode_alu(&mut self, op: AluOp, dst: &Operand, src: &Operand) {
        let base = (op as u8) << 3;
        let ext = op as u8;
        match (dst, src) {
            (_, Operand::Imm(v)) if (-128..=127).contains(v) => {
                self.buf.emit_u8(0x83); // op r/m32, imm8
                self.emit_rm(ext, dst);
                self.buf.emit_u8(*v as i8 as u8);
            }
            (_, Operand::Imm(v)) => {
                self.buf.emit_u8(0x81); // op r/m32, imm32
                self.emit_rm(ext, dst);
                self.buf.emit_u32(*v as u32);
            }
            (_, Operand::Reg(s)) => {
                self.buf.emit_u8(base + 0x01); // op r/m32, r32
                self.emit_rm(s.code(), dst);
            }
            (Operand::Reg(d), Operand::Mem(_)) => {
                self.buf.emit_u8(base + 0x03); // op r32, r/m32
                self.emit_rm(d.code(), src);
            }
            _ => unreachable!("rejected by Insn::validate"),
        }
    }

    fn encode_test(&mut self, dst: &Operand, src: &Operand) {
        match (dst, src) {
            (_, Operand::Imm(v)) => {
                self.buf.emit_u8(0xF7); // TEST r/m32, imm32
                self.emit_rm(0, dst);
                self.buf.emit_u32(*v as u32);
            }
            (_, Operand::Reg(s)) => {
                self.buf.emit_u8(0x85); // TEST r/m32, r32
                self.emit_rm(s.code(), dst);
            }
            (Operand::Reg(d), Operand::Mem(_)) => {
                // TEST is commutative
                self.buf.emit_u8(0x85);
                self.emit_rm(d.code(), src);
            }
            _ => unreachable!("rejected by Insn::validate"),
        }
    }

    fn encode_push(&mut self, op: &Operand) {
        match op {
            Operand::Reg(r) => self.buf.emit_u8(0x50 + r.code()),
            Operand::Imm(v) if (-128..=127).contains(v) => {
                self.buf.emit_u8(0x6A);
                self.buf.emit_u8(*v as i8 as u8);
            }
            Operand::Imm(v) => {
                self.buf.emit_u8(0x68);
                self.buf.emit_u32(*v as u32);
            }
            Operand::Mem(_) => {
                self.buf.emit_u8(0xFF); // PUSH r/m32
                self.emit_rm(6, op);
            }
        }
    }

    fn encode_pop(&mut self, op: &Operand) {
        match op {
            Operand::Reg(r) => self.buf.emit_u8(0x58 + r.code()),
            _ => {
                self.buf.emit_u8(0x8F); // POP r/m32
                self.emit_rm(0, op);
            }
        }
    }

    fn encode_branch(&mut self, opcode: &[u8], label: Label, size: RefSize) {
        self.buf.emit_bytes(opcode);
        self.buf.emit_label_ref(label, size);
    }

    fn encode_x87_mem(&mut self, opcode: u8, ext: u8, mem: &Mem) {
        self.buf.emit_u8(opcode);
        self.emit_mem(ext, mem);
    }

    fn encode(&mut self, insn: &Insn) {
        match insn {
            Insn::Mov { width, dst, src } => self.encode_mov(*width, dst, src),
            Insn::Movsx { width, dst, src } | Insn::Movzx { width, dst, src } => {
                let sign = matches!(insn, Insn::Movsx { .. });
                let op = match (sign, width) {
                    (true, Width::Byte) => 0xBE,
                    (true, _) => 0xBF,
                    (false, Width::Byte) => 0xB6,
                    (false, _) => 0xB7,
                };
                self.buf.emit_bytes(&[0x0F, op]);
                self.emit_rm(dst.code(), src);
            }
            Insn::Lea { dst, src } => {
                self.buf.emit_u8(0x8D);
                self.emit_mem(dst.code(), src);
            }
            Insn::Alu { op, dst, src } => self.encode_alu(*op, dst, src),
            Insn::Test { dst, src } => self.encode_test(dst, src),
            Insn::Unary { op, dst } => {
                let (opcode, ext) = match op {
                    UnaryOp::Not => (0xF7, 2),
                    UnaryOp::Neg => (0xF7, 3),
                    UnaryOp::Inc => (0xFF, 0),
                    UnaryOp::Dec => (0xFF, 1),
                };
                self.buf.emit_u8(opcode);
                self.emit_rm(ext, dst);
            }
            Insn::Shift { op, dst, count } => {
                let ext = match op {
                    ShiftOp::Shl => 4,
                    ShiftOp::Shr => 5,
                    ShiftOp::Sar => 7,
                };
                match count {
                    Count::Cl => {
                        self.buf.emit_u8(0xD3); // shift r/m32, CL
                        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
                    }
                    Count::Imm(n) => {
                        self.buf.emit_u8(0xC1); // shift r/m32, imm8
                        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
                        self.buf.emit_u8(*n);
                    }
                }
            }
            Insn::DoubleShift { op, dst, src, count } => {
                let base = match op {
                    DoubleShiftOp::Shld => 0xA4,
                    DoubleShiftOp::Shrd => 0xAC,
                };
                match count {
                    Count::Imm(n) => {
                        self.buf.emit_bytes(&[0x0F, base]);
                        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
                        self.buf.emit_u8(*n);
                    }
                    Count::Cl => {
                        self.buf.emit_bytes(&[0x0F, base + 1]);
                        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
                    }
                }
            }
            Insn::Imul { dst, src } => {
                self.buf.emit_bytes(&[0x0F, 0xAF]); // IMUL r32, r/m32
                self.emit_rm(dst.code(), src);
            }
            Insn::Mul { src } => {
                self.buf.emit_u8(0xF7);
                self.emit_rm(4, src);
            }
            Insn::Idiv { src } => {
                self.buf.emit_u8(0xF7);
                self.emit_rm(7, src);
            }
            Insn::Cdq => self.buf.emit_u8(0x99),
            Insn::Push(op) => self.encode_push(op),
            Insn::Pop(op) => self.encode_pop(op),
            Insn::Jmp(l) => self.encode_branch(&[0xE9], *l, RefSize::Rel32),
            Insn::Jcc(c, l) => self.encode_branch(&[0x0F, 0x80 + *c as u8], *l, RefSize::Rel32),
            Insn::JmpIndirect(op) => {
                self.buf.emit_u8(0xFF);
                self.emit_rm(4, op);
            }
            Insn::Call(op) => {
                self.buf.emit_u8(0xFF);
                self.emit_rm(2, op);
            }
            Insn::CallLabel(l) => self.encode_branch(&[0xE8], *l, RefSize::Rel32),
            Insn::Ret(0) => self.buf.emit_u8(0xC3),
            Insn::Ret(n) => {
                self.buf.emit_u8(0xC2);
                self.buf.emit_u16(*n);
            }
            Insn::Loop(l) => self.encode_branch(&[0xE2], *l, RefSize::Rel8),
            Insn::Lodsd => self.buf.emit_u8(0xAD),
            Insn::Int(n) => self.buf.emit_bytes(&[0xCD, *n]),
            Insn::Nop => self.buf.emit_u8(0x90),
            Insn::Setcc(c, r) => {
                self.buf.emit_bytes(&[0x0F, 0x90 + *c as u8]);
                self.buf.emit_u8(Self::modrm(0b11, 0, r.code()));
            }
            Insn::Fld { size, src } => match size {
                FpSize::M32 => self.encode_x87_mem(0xD9, 0, src),
                FpSize::M64 => self.encode_x87_mem(0xDD, 0, src),
            },
            Insn::Fild { size, src } => match size {
                FpSize::M32 => self.encode_x87_mem(0xDB, 0, src),
                FpSize::M64 => self.encode_x87_mem(0xDF, 5, src),
            },
            Insn::Fstp { size, dst } => match size {
                FpSize::M32 => self.encode_x87_mem(0xD9, 3, dst),
                FpSize::M64 => self.encode_x87_mem(0xDD, 3, dst),
            },
            Insn::Fisttp { size, dst } => match size {
                FpSize::M32 => self.encode_x87_mem(0xDB, 1, dst),
                FpSize::M64 => self.encode_x87_mem(0xDD, 1, dst),
            },
            Insn::Farith(op) => {
                let modrm = match op {
                    FpuOp::Add => 0xC1, // FADDP ST(1), ST(0)
                    FpuOp::Mul => 0xC9, // FMULP ST(1), ST(0)
                    FpuOp::Sub => 0xE9, // FSUBP ST(1), ST(0): st1 - st0
                    FpuOp::Div => 0xF9, // FDIVP ST(1), ST(0): st1 / st0
                };
                self.buf.emit_bytes(&[0xDE, modrm]);
            }
            Insn::Fchs => self.buf.emit_bytes(&[0xD9, 0xE0]),
            Insn::Fprem => self.buf.emit_bytes(&[0xD9, 0xF8]),
            Insn::Fucompp => self.buf.emit_bytes(&[0xDA, 0xE9]),
            Insn::FnstswAx => self.buf.emit_bytes(&[0xDF, 0xE0]),
            Insn::Sahf => self.buf.emit_u8(0x9E),
            Insn::Fldz => self.buf.emit_bytes(&[0xD9, 0xEE]),
            Insn::Fld1 => self.buf.emit_bytes(&[0xD9, 0xE8]),
            Insn::FstpSt0 => self.buf.emit_bytes(&[0xDD, 0xD8]),
            Insn::Fxch => self.buf.emit_bytes(&[0xD9, 0xC9]),
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeStream for Assembler {
    fn emit(&mut self, insn: Insn) {
        match insn.validate() {
            Ok(()) => self.encode(&insn),
            Err(err) => self.fail(err),
        }
    }

    fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    fn bind(&mut self, label: Label) {
        if let Err(err) = self.buf.bind_label(label) {
            self.fail(err);
        }
    }

    fn position(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{Cond, Emit};

    fn encode(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.finish().unwrap()
    }

    #[test]
    fn test_mov_forms() {
        // MOV EAX, EBX = 89 D8
        assert_eq!(encode(|a| a.mov(Reg::Eax, Reg::Ebx)), vec![0x89, 0xD8]);
        // MOV ECX, 5 = B9 05 00 00 00
        assert_eq!(encode(|a| a.mov(Reg::Ecx, 5)), vec![0xB9, 5, 0, 0, 0]);
        // MOV EAX, [EBP-4] = 8B 45 FC
        assert_eq!(
            encode(|a| a.mov(Reg::Eax, Mem::base(Reg::Ebp, -4))),
            vec![0x8B, 0x45, 0xFC]
        );
        // MOV [ESP], EDX = 89 14 24
        assert_eq!(
            encode(|a| a.mov(Mem::base(Reg::Esp, 0), Reg::Edx)),
            vec![0x89, 0x14, 0x24]
        );
        // MOV DWORD [EBP+8], 7 = C7 45 08 07 00 00 00
        assert_eq!(
            encode(|a| a.mov(Mem::base(Reg::Ebp, 8), 7)),
            vec![0xC7, 0x45, 0x08, 7, 0, 0, 0]
        );
    }

    #[test]
    fn test_ebp_base_needs_disp8() {
        // MOV EAX, [EBP] = 8B 45 00
        assert_eq!(
            encode(|a| a.mov(Reg::Eax, Mem::base(Reg::Ebp, 0))),
            vec![0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_indexed_and_absolute() {
        // MOV EBX, [EBX+ECX*4+12] = 8B 5C 8B 0C
        assert_eq!(
            encode(|a| a.mov(Reg::Ebx, Mem::indexed(Reg::Ebx, Reg::Ecx, 4, 12))),
            vec![0x8B, 0x5C, 0x8B, 0x0C]
        );
        // CALL [0x00080010] = FF 15 10 00 08 00
        assert_eq!(
            encode(|a| a.call(Mem::abs(0x0008_0010))),
            vec![0xFF, 0x15, 0x10, 0x00, 0x08, 0x00]
        );
    }

    #[test]
    fn test_alu_forms() {
        // ADD EAX, ECX = 01 C8
        assert_eq!(encode(|a| a.add(Reg::Eax, Reg::Ecx)), vec![0x01, 0xC8]);
        // SUB EBX, [EBP-8] = 2B 5D F8
        assert_eq!(
            encode(|a| a.sub(Reg::Ebx, Mem::base(Reg::Ebp, -8))),
            vec![0x2B, 0x5D, 0xF8]
        );
        // CMP [EBX+8], ESI = 39 73 08
        assert_eq!(
            encode(|a| a.cmp(Mem::base(Reg::Ebx, 8), Reg::Esi)),
            vec![0x39, 0x73, 0x08]
        );
        // AND ECX, 63 = 83 E1 3F
        assert_eq!(encode(|a| a.and(Reg::Ecx, 63)), vec![0x83, 0xE1, 0x3F]);
        // ADC EDX, 0x1000 = 81 D2 00 10 00 00
        assert_eq!(
            encode(|a| a.alu(AluOp::Adc, Reg::Edx, 0x1000)),
            vec![0x81, 0xD2, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_shifts() {
        // SHL EAX, CL = D3 E0
        assert_eq!(encode(|a| a.shift(ShiftOp::Shl, Reg::Eax, Count::Cl)), vec![0xD3, 0xE0]);
        // SAR EDX, 31 = C1 FA 1F
        assert_eq!(
            encode(|a| a.shift(ShiftOp::Sar, Reg::Edx, Count::Imm(31))),
            vec![0xC1, 0xFA, 0x1F]
        );
        // SHLD EDX, EAX, CL = 0F A5 C2
        assert_eq!(
            encode(|a| a.double_shift(DoubleShiftOp::Shld, Reg::Edx, Reg::Eax, Count::Cl)),
            vec![0x0F, 0xA5, 0xC2]
        );
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(encode(|a| a.push(Reg::Ebp)), vec![0x55]);
        assert_eq!(encode(|a| a.push(0)), vec![0x6A, 0x00]);
        // PUSH DWORD [EBP-4] = FF 75 FC
        assert_eq!(encode(|a| a.push(Mem::base(Reg::Ebp, -4))), vec![0xFF, 0x75, 0xFC]);
        // POP DWORD [EBP+12] = 8F 45 0C
        assert_eq!(encode(|a| a.pop(Mem::base(Reg::Ebp, 12))), vec![0x8F, 0x45, 0x0C]);
    }

    #[test]
    fn test_branches() {
        let code = encode(|a| {
            let l = a.new_label();
            a.jcc(Cond::A, l);
            a.emit(Insn::Int(5));
            a.bind(l);
            a.emit(Insn::Ret(8));
        });
        // JA +2; INT 5; RET 8
        assert_eq!(code, vec![0x0F, 0x87, 2, 0, 0, 0, 0xCD, 5, 0xC2, 8, 0]);
    }

    #[test]
    fn test_x87() {
        let code = encode(|a| {
            a.emit(Insn::Fld { size: FpSize::M64, src: Mem::base(Reg::Esp, 0) });
            a.emit(Insn::Farith(FpuOp::Sub));
            a.emit(Insn::Fisttp { size: FpSize::M32, dst: Mem::base(Reg::Esp, 0) });
            a.emit(Insn::FnstswAx);
        });
        assert_eq!(
            code,
            vec![0xDD, 0x04, 0x24, 0xDE, 0xE9, 0xDB, 0x0C, 0x24, 0xDF, 0xE0]
        );
    }

    #[test]
    fn test_invalid_operands_reported_by_finish() {
        let mut asm = Assembler::new();
        asm.mov_w(Width::Byte, Mem::base(Reg::Eax, 0), Reg::Edi);
        assert!(matches!(asm.finish(), Err(EncodeError::InvalidOperands(_))));
    }
}
