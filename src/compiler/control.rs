//! Branches, switches, subroutines and returns.
//!
//! Every control transfer flushes the operands that stay on the stack, so
//! all predecessors of a block agree on a fully native-stack-resident entry
//! shape.

use super::MethodCompiler;
use super::item::{Item, KindSet, Location};
use crate::bytecode::JvmType;
use crate::error::Result;
use crate::x86::{Cond, Emit, Insn, Mem, Reg};

impl MethodCompiler<'_> {
    /// Emit `cmp value, 0` (or `test r, r`) on a loaded operand.
    fn compare_zero(&mut self, value: &Item) -> Result<()> {
        match value.location() {
            Location::Reg(r) => self.em.os.test(r, r),
            _ => self.em.os.cmp(value.operand()?, 0),
        }
        Ok(())
    }

    pub(super) fn visit_if_zero(&mut self, ty: JvmType, cond: Cond, target: u32) -> Result<()> {
        let mut value = self.em.pop(ty)?;
        let label = self.label(target);
        self.em.flush();
        if let Some(v) = value.const_i32() {
            if cond.holds_signed(v, 0) == Some(true) {
                self.em.os.jmp(label);
            }
            return Ok(());
        }
        value.load_if(&mut self.em, KindSet::LOCAL | KindSet::REGISTER)?;
        self.compare_zero(&value)?;
        self.em.os.jcc(cond, label);
        value.release(&mut self.em.pool);
        Ok(())
    }

    pub(super) fn visit_if_compare(&mut self, ty: JvmType, cond: Cond, target: u32) -> Result<()> {
        let mut b = self.em.pop(ty)?;
        let mut a = self.em.pop(ty)?;
        let label = self.label(target);
        self.em.flush();
        if let (Some(x), Some(y)) = (a.const_i32(), b.const_i32()) {
            if cond.holds_signed(x, y) == Some(true) {
                self.em.os.jmp(label);
            }
            return Ok(());
        }
        let any = KindSet::CONSTANT | KindSet::LOCAL | KindSet::REGISTER;
        b.load_if(&mut self.em, any)?;
        a.load_if(&mut self.em, any)?;
        let mut cond = cond;
        if a.const_bits().is_some() {
            std::mem::swap(&mut a, &mut b);
            cond = cond.swap_operands();
        }
        if matches!(a.location(), Location::Local(_)) && matches!(b.location(), Location::Local(_)) {
            a.load(&mut self.em)?;
        }
        self.em.os.cmp(a.operand()?, b.operand()?);
        self.em.os.jcc(cond, label);
        a.release(&mut self.em.pool);
        b.release(&mut self.em.pool);
        Ok(())
    }

    pub(super) fn visit_goto(&mut self, target: u32) -> Result<()> {
        let label = self.label(target);
        self.em.flush();
        self.em.os.jmp(label);
        self.em.discard_all();
        Ok(())
    }

    /// `jsr` calls the subroutine block; the native return address becomes
    /// the reference the subroutine stores with `astore`.
    pub(super) fn visit_jsr(&mut self, target: u32) -> Result<()> {
        let label = self.label(target);
        self.em.flush();
        self.em.os.emit(Insn::CallLabel(label));
        self.em.discard_all();
        Ok(())
    }

    pub(super) fn visit_ret(&mut self, index: u16) -> Result<()> {
        let disp = self.frame()?.local_disp(index, false);
        self.em.flush();
        self.em.os.emit(Insn::JmpIndirect(Mem::base(Reg::Ebp, disp).into()));
        self.em.discard_all();
        Ok(())
    }

    /// Both switch forms become a compare chain ending in a jump to the
    /// default target.
    pub(super) fn visit_switch(&mut self, cases: &[(i32, u32)], default: u32) -> Result<()> {
        let mut key = self.em.pop_int()?;
        self.em.flush();
        if let Some(k) = key.const_i32() {
            let target = cases
                .iter()
                .find(|(v, _)| *v == k)
                .map_or(default, |(_, t)| *t);
            let label = self.label(target);
            self.em.os.jmp(label);
            return Ok(());
        }
        key.load_if(&mut self.em, KindSet::LOCAL | KindSet::REGISTER)?;
        let operand = key.operand()?;
        for (value, target) in cases {
            let label = self.label(*target);
            self.em.os.cmp(operand, *value);
            self.em.os.jcc(Cond::E, label);
        }
        let label = self.label(default);
        self.em.os.jmp(label);
        key.release(&mut self.em.pool);
        self.em.discard_all();
        Ok(())
    }

    pub(super) fn visit_return(&mut self, ty: Option<JvmType>) -> Result<()> {
        if !self.inlined.is_empty() {
            return self.visit_inlined_return(ty);
        }
        let mut value = match ty {
            Some(ty) => Some(self.em.pop(ty)?),
            None => None,
        };
        // The epilogue resets ESP, so whatever else is on the stack is dead.
        self.em.discard_all();
        if let Some(value) = value.as_mut() {
            if value.is_wide() {
                value.load_to_pair(&mut self.em, Reg::Eax, Reg::Edx)?;
            } else {
                value.load_to(&mut self.em, Reg::Eax)?;
            }
            value.release(&mut self.em.pool);
        }
        let epilogue = self.frame()?.epilogue_label();
        self.em.os.jmp(epilogue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::bytecode::Opcode;

    #[test]
    fn test_if_zero_on_local_uses_memory_form() {
        let pool = empty_pool();
        let text = compile_block(&pool, "(I)V", 1, &[Opcode::Iload(0), Opcode::Ifeq(9)]);
        assert_eq!(text, ["cmp dword [ebp+8], 0", "je L4"]);
    }

    #[test]
    fn test_constant_on_left_swaps_condition() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "(I)V",
            1,
            &[Opcode::Iconst(3), Opcode::Iload(0), Opcode::IfIcmplt(9)],
        );
        assert_eq!(text, ["cmp dword [ebp+8], 3", "jg L4"]);
    }

    #[test]
    fn test_branch_flushes_remaining_operands() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "(II)V",
            2,
            &[Opcode::Iload(0), Opcode::Iload(1), Opcode::Iload(0), Opcode::IfIcmpne(9)],
        );
        assert_eq!(
            text,
            [
                "push dword [ebp+12]",
                "mov ebx, dword [ebp+8]",
                "cmp ebx, dword [ebp+12]",
                "jne L4",
            ]
        );
    }

    #[test]
    fn test_constant_compare_folds() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "()V",
            0,
            &[
                Opcode::Iconst(1),
                Opcode::Iconst(2),
                Opcode::IfIcmpgt(9),
                Opcode::Iconst(0),
                Opcode::Ifeq(10),
            ],
        );
        assert_eq!(text, ["jmp L5"]);
    }

    #[test]
    fn test_switch_compare_chain() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "(I)V",
            1,
            &[
                Opcode::Iload(0),
                Opcode::Lookupswitch {
                    default: 9,
                    pairs: vec![(1, 4), (10, 6)],
                },
            ],
        );
        assert_eq!(
            text,
            [
                "cmp dword [ebp+8], 1",
                "je L4",
                "cmp dword [ebp+8], 10",
                "je L5",
                "jmp L6",
            ]
        );
    }

    #[test]
    fn test_long_return_in_edx_eax() {
        let pool = empty_pool();
        let text = compile_block(&pool, "(J)J", 2, &[Opcode::Lload(0), Opcode::Lreturn]);
        assert_eq!(
            text,
            ["mov eax, dword [ebp+8]", "mov edx, dword [ebp+12]", "jmp L2"]
        );
    }

    #[test]
    fn test_ret_jumps_through_local() {
        let pool = empty_pool();
        let text = compile_block(&pool, "()V", 1, &[Opcode::Ret(0)]);
        assert_eq!(text, ["jmp dword [ebp-4]"]);
    }
}
