//! Integer and long arithmetic, shifts, `lcmp` and integer conversions.

use super::MethodCompiler;
use super::item::{Item, KindSet, Location};
use crate::bytecode::JvmType;
use crate::error::Result;
use crate::meta::Helper;
use crate::x86::{AluOp, Cond, Count, DoubleShiftOp, Emit, Insn, Reg, ShiftOp, UnaryOp, Width};

fn fold_alu(op: AluOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::And => a & b,
        AluOp::Or => a | b,
        AluOp::Xor => a ^ b,
        _ => return None,
    })
}

fn fold_shift(op: ShiftOp, a: i64, n: u32, bits: u32) -> i64 {
    match (op, bits) {
        (ShiftOp::Shl, 32) => (a as i32).wrapping_shl(n) as i64,
        (ShiftOp::Sar, 32) => (a as i32).wrapping_shr(n) as i64,
        (ShiftOp::Shr, 32) => (a as u32).wrapping_shr(n) as i32 as i64,
        (ShiftOp::Shl, _) => a.wrapping_shl(n),
        (ShiftOp::Sar, _) => a.wrapping_shr(n),
        (ShiftOp::Shr, _) => (a as u64).wrapping_shr(n) as i64,
    }
}

fn commutative(op: AluOp) -> bool {
    matches!(op, AluOp::Add | AluOp::And | AluOp::Or | AluOp::Xor)
}

impl MethodCompiler<'_> {
    /// Constants of the two topmost Items, if both are constant.
    fn constant_operands(&self) -> Option<(i64, i64)> {
        let b = self.em.stack.peek(0)?.const_bits()?;
        let a = self.em.stack.peek(1)?.const_bits()?;
        Some((a, b))
    }

    /// Replace the two operands with a folded result.
    fn fold_binary(&mut self, ty: JvmType, result: i64) -> Result<()> {
        self.em.pop_any()?;
        self.em.pop_any()?;
        self.em.push(Item::constant(ty, result));
        Ok(())
    }

    // ==================== int ====================

    pub(super) fn visit_int_alu(&mut self, op: AluOp) -> Result<()> {
        let mut b = self.em.pop_int()?;
        let mut a = self.em.pop_int()?;
        let folded = match (a.const_bits(), b.const_bits()) {
            (Some(x), Some(y)) => fold_alu(op, x, y),
            _ => None,
        };
        if let Some(v) = folded {
            self.em.push(Item::int(v as i32));
            return Ok(());
        }
        b.load_if(&mut self.em, KindSet::CONSTANT | KindSet::LOCAL | KindSet::REGISTER)?;
        if commutative(op) && a.const_bits().is_some() && matches!(b.location(), Location::Reg(_)) {
            std::mem::swap(&mut a, &mut b);
        }
        let r = a.load_reg(&mut self.em)?;
        self.em.os.alu(op, r, b.operand()?);
        b.release(&mut self.em.pool);
        self.em.push(a);
        Ok(())
    }

    pub(super) fn visit_imul(&mut self) -> Result<()> {
        let mut b = self.em.pop_int()?;
        let mut a = self.em.pop_int()?;
        if let (Some(x), Some(y)) = (a.const_i32(), b.const_i32()) {
            self.em.push(Item::int(x.wrapping_mul(y)));
            return Ok(());
        }
        // IMUL has no plain immediate source form.
        b.load_if(&mut self.em, KindSet::LOCAL | KindSet::REGISTER)?;
        let r = a.load_reg(&mut self.em)?;
        self.em.os.imul(r, b.operand()?);
        b.release(&mut self.em.pool);
        self.em.push(a);
        Ok(())
    }

    pub(super) fn visit_ineg(&mut self) -> Result<()> {
        let mut a = self.em.pop_int()?;
        if let Some(x) = a.const_i32() {
            self.em.push(Item::int(x.wrapping_neg()));
            return Ok(());
        }
        let r = a.load_reg(&mut self.em)?;
        self.em.os.unary(UnaryOp::Neg, r);
        self.em.push(a);
        Ok(())
    }

    pub(super) fn visit_int_shift(&mut self, op: ShiftOp) -> Result<()> {
        if let Some(n) = self.em.stack.peek(0).and_then(Item::const_i32) {
            let n = (n & 31) as u32;
            self.em.pop_int()?;
            let mut a = self.em.pop_int()?;
            if let Some(x) = a.const_bits() {
                self.em.push(Item::int(fold_shift(op, x, n, 32) as i32));
                return Ok(());
            }
            let r = a.load_reg(&mut self.em)?;
            if n != 0 {
                self.em.os.shift(op, r, Count::Imm(n as u8));
            }
            self.em.push(a);
            return Ok(());
        }
        self.em.request_register_for_top(Reg::Ecx)?;
        let mut b = self.em.pop_int()?;
        let mut a = self.em.pop_int()?;
        b.load_to(&mut self.em, Reg::Ecx)?;
        let r = a.load_reg(&mut self.em)?;
        self.em.os.shift(op, r, Count::Cl);
        b.release(&mut self.em.pool);
        self.em.push(a);
        Ok(())
    }

    /// `idiv` and `irem`. A divisor of -1 takes a separate path: IDIV would
    /// trap on `MIN / -1`.
    pub(super) fn visit_int_div(&mut self, remainder: bool) -> Result<()> {
        if let Some((x, y)) = self.constant_operands() {
            let (x, y) = (x as i32, y as i32);
            if y != 0 {
                let v = if remainder { x.wrapping_rem(y) } else { x.wrapping_div(y) };
                return self.fold_binary(JvmType::Int, v as i64);
            }
        }
        self.em.request_register(Reg::Eax)?;
        self.em.request_register(Reg::Edx)?;
        let mut b = self.em.pop_int()?;
        let mut a = self.em.pop_int()?;
        b.load_if(&mut self.em, KindSet::LOCAL | KindSet::REGISTER)?;
        a.load_to(&mut self.em, Reg::Eax)?;

        let divide = self.em.os.new_label();
        let done = self.em.os.new_label();
        let divisor = b.operand()?;
        let os = &mut *self.em.os;
        os.cmp(divisor, -1);
        os.jcc(Cond::Ne, divide);
        if remainder {
            os.xor(Reg::Edx, Reg::Edx);
        } else {
            os.unary(UnaryOp::Neg, Reg::Eax);
        }
        os.jmp(done);
        os.bind(divide);
        os.emit(Insn::Cdq);
        os.idiv(divisor);
        os.bind(done);

        b.release(&mut self.em.pool);
        if remainder {
            a.release(&mut self.em.pool);
            let result = Item::in_reg(JvmType::Int, Reg::Edx, &mut self.em.pool);
            self.em.push(result);
        } else {
            self.em.release_register(Reg::Edx);
            self.em.push(a);
        }
        Ok(())
    }

    // ==================== long ====================

    pub(super) fn visit_long_alu(&mut self, lo_op: AluOp, hi_op: AluOp) -> Result<()> {
        let mut b = self.em.pop(JvmType::Long)?;
        let mut a = self.em.pop(JvmType::Long)?;
        let folded = match (a.const_bits(), b.const_bits()) {
            (Some(x), Some(y)) => fold_alu(lo_op, x, y),
            _ => None,
        };
        if let Some(v) = folded {
            self.em.push(Item::long(v));
            return Ok(());
        }
        b.load_if(&mut self.em, KindSet::CONSTANT | KindSet::LOCAL | KindSet::REGISTER)?;
        let (lo, hi) = a.load_pair(&mut self.em)?;
        let (blo, bhi) = b.word_operands()?;
        self.em.os.alu(lo_op, lo, blo);
        self.em.os.alu(hi_op, hi, bhi);
        b.release(&mut self.em.pool);
        self.em.push(a);
        Ok(())
    }

    pub(super) fn visit_lneg(&mut self) -> Result<()> {
        let mut a = self.em.pop(JvmType::Long)?;
        if let Some(x) = a.const_bits() {
            self.em.push(Item::long(x.wrapping_neg()));
            return Ok(());
        }
        let (lo, hi) = a.load_pair(&mut self.em)?;
        let os = &mut *self.em.os;
        os.unary(UnaryOp::Neg, hi);
        os.unary(UnaryOp::Neg, lo);
        os.alu(AluOp::Sbb, hi, 0);
        self.em.push(a);
        Ok(())
    }

    pub(super) fn visit_lmul(&mut self) -> Result<()> {
        if let Some((x, y)) = self.constant_operands() {
            return self.fold_binary(JvmType::Long, x.wrapping_mul(y));
        }
        self.em.request_register(Reg::Eax)?;
        self.em.request_register(Reg::Edx)?;
        let mut b = self.em.pop(JvmType::Long)?;
        let mut a = self.em.pop(JvmType::Long)?;
        let (blo, bhi) = b.load_pair(&mut self.em)?;
        let (alo, ahi) = a.load_pair(&mut self.em)?;

        let full = self.em.os.new_label();
        let done = self.em.os.new_label();
        let os = &mut *self.em.os;
        // Both high words zero: one 32x32->64 multiply.
        os.mov(Reg::Eax, ahi);
        os.or(Reg::Eax, bhi);
        os.jcc(Cond::Ne, full);
        os.mov(Reg::Eax, alo);
        os.mul(blo);
        os.jmp(done);
        os.bind(full);
        os.mov(Reg::Eax, ahi);
        os.imul(Reg::Eax, blo);
        os.imul(bhi, alo);
        os.add(bhi, Reg::Eax);
        os.mov(Reg::Eax, alo);
        os.mul(blo);
        os.add(Reg::Edx, bhi);
        os.bind(done);

        a.release(&mut self.em.pool);
        b.release(&mut self.em.pool);
        let result = Item::in_pair(JvmType::Long, Reg::Eax, Reg::Edx, &mut self.em.pool);
        self.em.push(result);
        Ok(())
    }

    /// `ldiv` and `lrem` through the runtime.
    pub(super) fn visit_long_helper(&mut self, helper: Helper) -> Result<()> {
        if let Some((x, y)) = self.constant_operands() {
            if y != 0 {
                let v = match helper {
                    Helper::LongRem => x.wrapping_rem(y),
                    _ => x.wrapping_div(y),
                };
                return self.fold_binary(JvmType::Long, v);
            }
        }
        self.em.flush();
        self.em.pop(JvmType::Long)?;
        self.em.pop(JvmType::Long)?;
        self.call_helper(helper);
        self.push_call_result(Some(JvmType::Long));
        Ok(())
    }

    pub(super) fn visit_long_shift(&mut self, op: ShiftOp) -> Result<()> {
        if let Some(n) = self.em.stack.peek(0).and_then(Item::const_i32) {
            let n = (n & 63) as u8;
            self.em.pop_int()?;
            let mut a = self.em.pop(JvmType::Long)?;
            if let Some(x) = a.const_bits() {
                self.em.push(Item::long(fold_shift(op, x, n as u32, 64)));
                return Ok(());
            }
            let (lo, hi) = a.load_pair(&mut self.em)?;
            self.emit_long_shift_const(op, lo, hi, n);
            self.em.push(a);
            return Ok(());
        }

        self.em.request_register_for_top(Reg::Ecx)?;
        let mut b = self.em.pop_int()?;
        let mut a = self.em.pop(JvmType::Long)?;
        b.load_to(&mut self.em, Reg::Ecx)?;
        let (lo, hi) = a.load_pair(&mut self.em)?;

        let big = self.em.os.new_label();
        let done = self.em.os.new_label();
        let os = &mut *self.em.os;
        os.and(Reg::Ecx, 63);
        os.cmp(Reg::Ecx, 32);
        os.jcc(Cond::Ae, big);
        match op {
            ShiftOp::Shl => {
                os.double_shift(DoubleShiftOp::Shld, hi, lo, Count::Cl);
                os.shift(ShiftOp::Shl, lo, Count::Cl);
            }
            _ => {
                os.double_shift(DoubleShiftOp::Shrd, lo, hi, Count::Cl);
                os.shift(op, hi, Count::Cl);
            }
        }
        os.jmp(done);
        // CL is masked to 5 bits, so the remaining shift is by n-32.
        os.bind(big);
        match op {
            ShiftOp::Shl => {
                os.mov(hi, lo);
                os.xor(lo, lo);
                os.shift(ShiftOp::Shl, hi, Count::Cl);
            }
            ShiftOp::Sar => {
                os.mov(lo, hi);
                os.shift(ShiftOp::Sar, hi, Count::Imm(31));
                os.shift(ShiftOp::Sar, lo, Count::Cl);
            }
            ShiftOp::Shr => {
                os.mov(lo, hi);
                os.xor(hi, hi);
                os.shift(ShiftOp::Shr, lo, Count::Cl);
            }
        }
        os.bind(done);

        b.release(&mut self.em.pool);
        self.em.push(a);
        Ok(())
    }

    fn emit_long_shift_const(&mut self, op: ShiftOp, lo: Reg, hi: Reg, n: u8) {
        let os = &mut *self.em.os;
        match (op, n) {
            (_, 0) => {}
            (ShiftOp::Shl, 1..=31) => {
                os.double_shift(DoubleShiftOp::Shld, hi, lo, Count::Imm(n));
                os.shift(ShiftOp::Shl, lo, Count::Imm(n));
            }
            (_, 1..=31) => {
                os.double_shift(DoubleShiftOp::Shrd, lo, hi, Count::Imm(n));
                os.shift(op, hi, Count::Imm(n));
            }
            (ShiftOp::Shl, _) => {
                os.mov(hi, lo);
                os.xor(lo, lo);
                if n > 32 {
                    os.shift(ShiftOp::Shl, hi, Count::Imm(n - 32));
                }
            }
            (ShiftOp::Sar, _) => {
                os.mov(lo, hi);
                os.shift(ShiftOp::Sar, hi, Count::Imm(31));
                if n > 32 {
                    os.shift(ShiftOp::Sar, lo, Count::Imm(n - 32));
                }
            }
            (ShiftOp::Shr, _) => {
                os.mov(lo, hi);
                os.xor(hi, hi);
                if n > 32 {
                    os.shift(ShiftOp::Shr, lo, Count::Imm(n - 32));
                }
            }
        }
    }

    /// Three-way long compare: -1, 0 or 1.
    pub(super) fn visit_lcmp(&mut self) -> Result<()> {
        if let Some((x, y)) = self.constant_operands() {
            return self.fold_binary(JvmType::Int, x.cmp(&y) as i64);
        }
        let mut b = self.em.pop(JvmType::Long)?;
        let mut a = self.em.pop(JvmType::Long)?;
        b.load_if(&mut self.em, KindSet::CONSTANT | KindSet::LOCAL | KindSet::REGISTER)?;
        let (lo, hi) = a.load_pair(&mut self.em)?;
        let (blo, bhi) = b.word_operands()?;

        let less = self.em.os.new_label();
        let done = self.em.os.new_label();
        let os = &mut *self.em.os;
        os.sub(lo, blo);
        os.alu(AluOp::Sbb, hi, bhi);
        os.jcc(Cond::L, less);
        os.or(lo, hi);
        os.jcc(Cond::E, done);
        os.mov(lo, 1);
        os.jmp(done);
        os.bind(less);
        os.mov(lo, -1);
        os.bind(done);

        b.release(&mut self.em.pool);
        a.release(&mut self.em.pool);
        let result = Item::in_reg(JvmType::Int, lo, &mut self.em.pool);
        self.em.push(result);
        Ok(())
    }

    // ==================== Integer conversions ====================

    pub(super) fn visit_i2l(&mut self) -> Result<()> {
        let mut a = self.em.pop_int()?;
        if let Some(x) = a.const_i32() {
            self.em.push(Item::long(x as i64));
            return Ok(());
        }
        let lo = a.load_reg(&mut self.em)?;
        let owner = a.owner(&mut self.em.pool);
        let hi = self.em.alloc(owner)?;
        self.em.os.mov(hi, lo);
        self.em.os.shift(ShiftOp::Sar, hi, Count::Imm(31));
        a.set_location(Location::Pair(lo, hi));
        a.retype(JvmType::Long);
        self.em.push(a);
        Ok(())
    }

    pub(super) fn visit_l2i(&mut self) -> Result<()> {
        let mut a = self.em.pop(JvmType::Long)?;
        match a.location() {
            Location::Constant(x) => {
                self.em.push(Item::int(x as i32));
                return Ok(());
            }
            // The low word is the int.
            Location::Local(_) => {}
            _ => {
                let (lo, hi) = a.load_pair(&mut self.em)?;
                self.em.pool.release(hi);
                a.set_location(Location::Reg(lo));
            }
        }
        a.retype(JvmType::Int);
        self.em.push(a);
        Ok(())
    }

    /// `i2b`, `i2c` and `i2s`: truncate and extend in place.
    pub(super) fn visit_int_narrow(&mut self, width: Width, signed: bool) -> Result<()> {
        let mut a = self.em.pop_int()?;
        if let Some(x) = a.const_i32() {
            let v = match (width, signed) {
                (Width::Byte, _) => x as i8 as i32,
                (_, true) => x as i16 as i32,
                (_, false) => x as u16 as i32,
            };
            self.em.push(Item::int(v));
            return Ok(());
        }
        let r = if width == Width::Byte {
            a.load_byte(&mut self.em)?
        } else {
            a.load_reg(&mut self.em)?
        };
        if signed {
            self.em.os.movsx(width, r, r);
        } else {
            self.em.os.movzx(width, r, r);
        }
        self.em.push(a);
        Ok(())
    }
}
