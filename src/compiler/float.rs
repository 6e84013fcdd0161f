//! Float and double arithmetic on the x87 stack, compares and conversions.
//!
//! Operands are moved onto the x87 stack from wherever they live: frame
//! slots and native stack words are addressed in place, registers and
//! constants go through a transient native stack slot. Results come back
//! into general registers.

use super::MethodCompiler;
use super::item::{Item, Location};
use crate::bytecode::JvmType;
use crate::error::{CompileError, Result};
use crate::x86::{Cond, Emit, FpSize, FpuOp, Insn, Label, Mem, Reg};

fn fp_size(ty: JvmType) -> FpSize {
    if ty.is_wide() { FpSize::M64 } else { FpSize::M32 }
}

fn is_integer(ty: JvmType) -> bool {
    matches!(ty, JvmType::Int | JvmType::Long)
}

/// Constant bits as an f64, whatever the floating type.
fn float_value(ty: JvmType, bits: i64) -> f64 {
    match ty {
        JvmType::Float => f32::from_bits(bits as u32) as f64,
        _ => f64::from_bits(bits as u64),
    }
}

/// Truncate the way `fisttp` stores: NaN and out-of-range values become
/// the integer indefinite, the most negative value of the target width.
fn fisttp_int(v: f64) -> i32 {
    if v > -2_147_483_649.0 && v < 2_147_483_648.0 {
        v as i32
    } else {
        i32::MIN
    }
}

fn fisttp_long(v: f64) -> i64 {
    if v >= -9.223_372_036_854_776e18 && v < 9.223_372_036_854_776e18 {
        v as i64
    } else {
        i64::MIN
    }
}

fn float_item(ty: JvmType, v: f64) -> Item {
    match ty {
        JvmType::Float => Item::float(v as f32),
        _ => Item::double(v),
    }
}

impl MethodCompiler<'_> {
    /// Push `item` onto the x87 stack. `above` is the number of native stack
    /// bytes on top of the item's own words when it lives there.
    fn fpu_load(&mut self, item: &Item, above: i32) -> Result<()> {
        let ty = item.ty();
        let size = fp_size(ty);
        let load = |src: Mem| {
            if is_integer(ty) {
                Insn::Fild { size, src }
            } else {
                Insn::Fld { size, src }
            }
        };
        let os = &mut *self.em.os;
        match item.location() {
            Location::Local(d) => os.emit(load(Mem::base(Reg::Ebp, d))),
            Location::Stack => os.emit(load(Mem::base(Reg::Esp, above))),
            Location::Constant(bits) => {
                if ty.is_wide() {
                    os.push((bits >> 32) as i32);
                }
                os.push(bits as i32);
                os.emit(load(Mem::base(Reg::Esp, 0)));
                os.lea(Reg::Esp, Mem::base(Reg::Esp, ty.size()));
            }
            Location::Reg(r) => {
                os.push(r);
                os.emit(load(Mem::base(Reg::Esp, 0)));
                os.lea(Reg::Esp, Mem::base(Reg::Esp, 4));
            }
            Location::Pair(lo, hi) => {
                os.push(hi);
                os.push(lo);
                os.emit(load(Mem::base(Reg::Esp, 0)));
                os.lea(Reg::Esp, Mem::base(Reg::Esp, 8));
            }
        }
        Ok(())
    }

    /// Load the operands in `order` (left operand first unless reversed),
    /// then drop any native stack words they occupied and release them.
    fn fpu_load_operands(&mut self, mut a: Item, mut b: Item, b_first: bool) -> Result<()> {
        let a_above = if b.is_stack() { b.ty().size() } else { 0 };
        if b_first {
            self.fpu_load(&b, 0)?;
            self.fpu_load(&a, a_above)?;
        } else {
            self.fpu_load(&a, a_above)?;
            self.fpu_load(&b, 0)?;
        }
        let dropped: i32 = [&a, &b]
            .iter()
            .filter(|i| i.is_stack())
            .map(|i| i.ty().size())
            .sum();
        if dropped > 0 {
            self.em.os.lea(Reg::Esp, Mem::base(Reg::Esp, dropped));
        }
        a.release(&mut self.em.pool);
        b.release(&mut self.em.pool);
        Ok(())
    }

    fn fpu_load_single(&mut self, mut a: Item) -> Result<()> {
        self.fpu_load(&a, 0)?;
        if a.is_stack() {
            self.em.os.lea(Reg::Esp, Mem::base(Reg::Esp, a.ty().size()));
        }
        a.release(&mut self.em.pool);
        Ok(())
    }

    /// Pop st(0) into fresh registers as a value of `ty`. Integer types
    /// are stored with truncation.
    fn fpu_store(&mut self, ty: JvmType) -> Result<Item> {
        let id = self.em.pool.fresh_id();
        let size = fp_size(ty);
        let dst = Mem::base(Reg::Esp, 0);
        let store = if is_integer(ty) {
            Insn::Fisttp { size, dst }
        } else {
            Insn::Fstp { size, dst }
        };
        if ty.is_wide() {
            let (lo, hi) = self.em.alloc_pair(id)?;
            let os = &mut *self.em.os;
            os.sub(Reg::Esp, 8);
            os.emit(store);
            os.pop(lo);
            os.pop(hi);
            Ok(Item::in_pair(ty, lo, hi, &mut self.em.pool))
        } else {
            let r = self.em.alloc(id)?;
            let os = &mut *self.em.os;
            os.sub(Reg::Esp, 4);
            os.emit(store);
            os.pop(r);
            Ok(Item::in_reg(ty, r, &mut self.em.pool))
        }
    }

    // ==================== Arithmetic ====================

    pub(super) fn visit_fpu_arith(&mut self, ty: JvmType, op: FpuOp) -> Result<()> {
        let b = self.em.pop(ty)?;
        let a = self.em.pop(ty)?;
        if let (Some(x), Some(y)) = (a.const_bits(), b.const_bits()) {
            let result = match ty {
                JvmType::Float => {
                    let (x, y) = (float_value(ty, x) as f32, float_value(ty, y) as f32);
                    let v = match op {
                        FpuOp::Add => x + y,
                        FpuOp::Sub => x - y,
                        FpuOp::Mul => x * y,
                        FpuOp::Div => x / y,
                    };
                    Item::float(v)
                }
                _ => {
                    let (x, y) = (float_value(ty, x), float_value(ty, y));
                    let v = match op {
                        FpuOp::Add => x + y,
                        FpuOp::Sub => x - y,
                        FpuOp::Mul => x * y,
                        FpuOp::Div => x / y,
                    };
                    Item::double(v)
                }
            };
            self.em.push(result);
            return Ok(());
        }
        self.fpu_load_operands(a, b, false)?;
        self.em.os.emit(Insn::Farith(op));
        let result = self.fpu_store(ty)?;
        self.em.push(result);
        Ok(())
    }

    /// `frem`/`drem`: truncating remainder, repeating FPREM until C2 clears.
    pub(super) fn visit_fpu_rem(&mut self, ty: JvmType) -> Result<()> {
        if let (Some(b), Some(a)) = (
            self.em.stack.peek(0).and_then(Item::const_bits),
            self.em.stack.peek(1).and_then(Item::const_bits),
        ) {
            let v = float_value(ty, a) % float_value(ty, b);
            self.em.pop(ty)?;
            self.em.pop(ty)?;
            self.em.push(float_item(ty, v));
            return Ok(());
        }
        self.em.request_register(Reg::Eax)?;
        let b = self.em.pop(ty)?;
        let a = self.em.pop(ty)?;
        self.fpu_load_operands(a, b, true)?;
        let again = self.em.os.new_label();
        let os = &mut *self.em.os;
        os.bind(again);
        os.emit(Insn::Fprem);
        os.emit(Insn::FnstswAx);
        os.emit(Insn::Sahf);
        os.jcc(Cond::P, again);
        self.em.release_register(Reg::Eax);
        let result = self.fpu_store(ty)?;
        self.em.os.emit(Insn::FstpSt0);
        self.em.push(result);
        Ok(())
    }

    /// Negation flips the sign bit, which also covers zeros and NaNs.
    pub(super) fn visit_fpu_neg(&mut self, ty: JvmType) -> Result<()> {
        let mut a = self.em.pop(ty)?;
        if let Some(bits) = a.const_bits() {
            let flipped = match ty {
                JvmType::Float => (bits as u32 ^ 0x8000_0000) as i64,
                _ => bits ^ i64::MIN,
            };
            self.em.push(Item::constant(ty, flipped));
            return Ok(());
        }
        if ty.is_wide() {
            let (_, hi) = a.load_pair(&mut self.em)?;
            self.em.os.xor(hi, i32::MIN);
        } else {
            let r = a.load_reg(&mut self.em)?;
            self.em.os.xor(r, i32::MIN);
        }
        self.em.push(a);
        Ok(())
    }

    // ==================== Compares ====================

    /// `fcmpl`/`fcmpg`/`dcmpl`/`dcmpg`. An unordered compare yields 1 for
    /// the `g` variants and -1 for the `l` variants.
    pub(super) fn visit_fpu_compare(&mut self, ty: JvmType, greater_on_nan: bool) -> Result<()> {
        let nan_result = if greater_on_nan { 1 } else { -1 };
        if let (Some(b), Some(a)) = (
            self.em.stack.peek(0).and_then(Item::const_bits),
            self.em.stack.peek(1).and_then(Item::const_bits),
        ) {
            let (x, y) = (float_value(ty, a), float_value(ty, b));
            let v = match x.partial_cmp(&y) {
                Some(ord) => ord as i32,
                None => nan_result,
            };
            self.em.pop(ty)?;
            self.em.pop(ty)?;
            self.em.push(Item::int(v));
            return Ok(());
        }
        self.em.request_register(Reg::Eax)?;
        let b = self.em.pop(ty)?;
        let a = self.em.pop(ty)?;
        self.fpu_load_operands(a, b, true)?;

        let labels: Vec<Label> = (0..4).map(|_| self.em.os.new_label()).collect();
        let (unordered, equal, less, done) = (labels[0], labels[1], labels[2], labels[3]);
        let os = &mut *self.em.os;
        os.emit(Insn::Fucompp);
        os.emit(Insn::FnstswAx);
        os.emit(Insn::Sahf);
        os.jcc(Cond::P, unordered);
        os.jcc(Cond::E, equal);
        os.jcc(Cond::B, less);
        os.mov(Reg::Eax, 1);
        os.jmp(done);
        os.bind(less);
        os.mov(Reg::Eax, -1);
        os.jmp(done);
        os.bind(equal);
        os.mov(Reg::Eax, 0);
        os.jmp(done);
        os.bind(unordered);
        os.mov(Reg::Eax, nan_result);
        os.bind(done);

        let result = Item::in_reg(JvmType::Int, Reg::Eax, &mut self.em.pool);
        self.em.push(result);
        Ok(())
    }

    // ==================== Conversions ====================

    /// Conversions involving float or double. Float-to-integer stores
    /// truncate toward zero.
    pub(super) fn visit_convert(&mut self, from: JvmType, to: JvmType) -> Result<()> {
        if is_integer(from) && is_integer(to) {
            return Err(CompileError::internal(format!(
                "{} to {} is not an x87 conversion",
                from, to
            )));
        }
        let a = self.em.pop(from)?;
        if let Some(bits) = a.const_bits() {
            let result = match (from, to) {
                (JvmType::Int, _) => float_item(to, bits as i32 as f64),
                (JvmType::Long, JvmType::Float) => Item::float(bits as f32),
                (JvmType::Long, _) => Item::double(bits as f64),
                (_, JvmType::Int) => Item::int(fisttp_int(float_value(from, bits))),
                (_, JvmType::Long) => Item::long(fisttp_long(float_value(from, bits))),
                (_, _) => float_item(to, float_value(from, bits)),
            };
            self.em.push(result);
            return Ok(());
        }
        self.fpu_load_single(a)?;
        let result = self.fpu_store(to)?;
        self.em.push(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::bytecode::Opcode;

    #[test]
    fn test_fadd_from_locals() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "(FF)V",
            3,
            &[Opcode::Fload(0), Opcode::Fload(1), Opcode::Fadd, Opcode::Fstore(2)],
        );
        assert_eq!(
            text,
            [
                "fld dword [ebp+12]",
                "fld dword [ebp+8]",
                "faddp st(1), st(0)",
                "sub esp, 4",
                "fstp dword [esp]",
                "pop ebx",
                "mov dword [ebp-4], ebx",
            ]
        );
    }

    #[test]
    fn test_constant_compare_folds_nan() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "()V",
            2,
            &[
                Opcode::Fconst(f32::NAN),
                Opcode::Fconst(1.0),
                Opcode::Fcmpg,
                Opcode::Istore(0),
                Opcode::Dconst(-0.0),
                Opcode::Dconst(0.0),
                Opcode::Dcmpl,
                Opcode::Istore(1),
            ],
        );
        assert_eq!(text, ["mov dword [ebp-4], 1", "mov dword [ebp-8], 0"]);
    }

    #[test]
    fn test_constant_truncation_matches_fisttp() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "()V",
            4,
            &[
                Opcode::Fconst(f32::NAN),
                Opcode::F2i,
                Opcode::Istore(0),
                Opcode::Dconst(1e10),
                Opcode::D2i,
                Opcode::Istore(1),
                Opcode::Dconst(-3.9),
                Opcode::D2i,
                Opcode::Istore(2),
                Opcode::Fconst(f32::NEG_INFINITY),
                Opcode::F2i,
                Opcode::Istore(3),
            ],
        );
        assert_eq!(
            text,
            [
                "mov dword [ebp-4], -2147483648",
                "mov dword [ebp-8], -2147483648",
                "mov dword [ebp-12], -3",
                "mov dword [ebp-16], -2147483648",
            ]
        );
        assert_eq!(fisttp_long(f64::INFINITY), i64::MIN);
        assert_eq!(fisttp_long(1e19), i64::MIN);
        assert_eq!(fisttp_long(-9.223_372_036_854_776e18), i64::MIN);
        assert_eq!(fisttp_long(-1e18), -1_000_000_000_000_000_000);
        assert_eq!(fisttp_int(2_147_483_647.5), i32::MAX);
    }

    #[test]
    fn test_i2d_from_register() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "(II)V",
            4,
            &[Opcode::Iload(0), Opcode::Iload(1), Opcode::Iadd, Opcode::I2d, Opcode::Dstore(2)],
        );
        assert_eq!(
            &text[2..9],
            [
                "push ebx",
                "fild dword [esp]",
                "lea esp, [esp+4]",
                "sub esp, 8",
                "fstp qword [esp]",
                "pop ebx",
                "pop esi",
            ]
        );
    }
}
