//! Constants, locals and operand-stack shuffles.

use super::MethodCompiler;
use super::item::{Item, Location};
use crate::bytecode::{FieldKind, JvmType, LdcValue};
use crate::error::{CompileError, Result};
use crate::x86::{Emit, Mem, Reg, UnaryOp};

impl MethodCompiler<'_> {
    pub(super) fn visit_ldc(&mut self, value: &LdcValue) -> Result<()> {
        let item = match value {
            LdcValue::Int(v) => Item::int(*v),
            LdcValue::Long(v) => Item::long(*v),
            LdcValue::Float(v) => Item::float(*v),
            LdcValue::Double(v) => Item::double(*v),
            LdcValue::String(s) => {
                let slot = self.resolver.resolve_string(s)?;
                self.load_value(FieldKind::Reference, self.env.statics_slot(slot))?
            }
            LdcValue::Class(c) => {
                let class = self.resolver.resolve_class(c)?;
                self.load_value(FieldKind::Reference, self.env.statics_slot(class.type_slot))?
            }
        };
        self.em.push(item);
        Ok(())
    }

    // ==================== Locals ====================

    pub(super) fn visit_load(&mut self, ty: JvmType, index: u16) -> Result<()> {
        let item = match self.constants.get(&index) {
            Some((cty, bits)) if *cty == ty => Item::constant(ty, *bits),
            _ => Item::local(ty, self.frame()?.local_disp(index, ty.is_wide())),
        };
        self.em.push(item);
        Ok(())
    }

    /// Drop tracked constants overlapping slots `[index, index+words)`.
    fn forget_locals(&mut self, index: u16, words: u16) {
        let end = index + words;
        self.constants.retain(|i, (ty, _)| {
            let i_end = *i + ty.category() as u16;
            i_end <= index || end <= *i
        });
    }

    pub(super) fn visit_store(&mut self, ty: JvmType, index: u16) -> Result<()> {
        let disp = self.frame()?.local_disp(index, ty.is_wide());
        self.em.load_local(disp, ty.size())?;
        let mut value = self.em.pop(ty)?;
        self.forget_locals(index, ty.category() as u16);

        let dst = Mem::base(Reg::Ebp, disp);
        match value.location() {
            Location::Constant(bits) => {
                let (lo, hi) = value.store_operands()?;
                self.em.os.mov(dst, lo);
                if let Some(hi) = hi {
                    self.em.os.mov(dst.offset(4), hi);
                }
                self.constants.insert(index, (ty, bits));
            }
            Location::Stack => {
                self.em.os.pop(dst);
                if ty.is_wide() {
                    self.em.os.pop(dst.offset(4));
                }
            }
            _ => {
                value.load(&mut self.em)?;
                let (lo, hi) = value.store_operands()?;
                self.em.os.mov(dst, lo);
                if let Some(hi) = hi {
                    self.em.os.mov(dst.offset(4), hi);
                }
            }
        }
        value.release(&mut self.em.pool);
        Ok(())
    }

    pub(super) fn visit_iinc(&mut self, index: u16, delta: i32) -> Result<()> {
        let disp = self.frame()?.local_disp(index, false);
        self.em.load_local(disp, 4)?;
        self.forget_locals(index, 1);
        let dst = Mem::base(Reg::Ebp, disp);
        match delta {
            0 => {}
            1 => self.em.os.unary(UnaryOp::Inc, dst),
            -1 => self.em.os.unary(UnaryOp::Dec, dst),
            _ => self.em.os.add(dst, delta),
        }
        Ok(())
    }

    // ==================== Stack shuffles ====================

    pub(super) fn visit_pop(&mut self, words: usize) -> Result<()> {
        for item in self.em.pop_words(words)? {
            item.discard(&mut self.em);
        }
        Ok(())
    }

    /// The dup family: copy the top `top` words and insert the copy below
    /// the `under` words beneath them.
    pub(super) fn visit_dup(&mut self, top: usize, under: usize) -> Result<()> {
        let mut upper = self.em.pop_words(top)?;
        let mut lower = self.em.pop_words(under)?;
        // Native stack values come off top-first.
        for item in upper.iter_mut().rev().chain(lower.iter_mut().rev()) {
            if item.is_stack() {
                item.load(&mut self.em)?;
            }
        }
        for item in &upper {
            let copy = item.duplicate(&mut self.em)?;
            self.em.push(copy);
        }
        for item in lower.into_iter().chain(upper) {
            self.em.push(item);
        }
        Ok(())
    }

    pub(super) fn visit_swap(&mut self) -> Result<()> {
        let mut a = self.em.pop_any()?;
        let mut b = self.em.pop_any()?;
        if a.is_wide() || b.is_wide() {
            return Err(CompileError::internal(format!(
                "swap of a category-2 value at bytecode {}",
                self.em.address
            )));
        }
        for item in [&mut a, &mut b] {
            if item.is_stack() {
                item.load(&mut self.em)?;
            }
        }
        self.em.push(a);
        self.em.push(b);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::bytecode::Opcode;

    #[test]
    fn test_store_of_helper_result() {
        let pool = empty_pool();
        // The quotient arrives in EDX:EAX.
        let text = compile_block(
            &pool,
            "(JJ)V",
            6,
            &[
                Opcode::Lload(0),
                Opcode::Lload(2),
                Opcode::Ldiv,
                Opcode::Lstore(4),
            ],
        );
        assert!(text.iter().any(|t| t == "call dword [0x8014]"));
        assert!(text.ends_with(&["mov dword [ebp-8], eax".to_string(), "mov dword [ebp-4], edx".to_string()]));
    }

    #[test]
    fn test_iinc_materializes_pending_loads() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "(I)I",
            1,
            &[Opcode::Iload(0), Opcode::Iinc { index: 0, delta: 1 }, Opcode::Istore(0)],
        );
        assert_eq!(
            text,
            [
                "mov ebx, dword [ebp+8]",
                "inc dword [ebp+8]",
                "mov dword [ebp+8], ebx",
            ]
        );
    }

    #[test]
    fn test_dup_x1_order() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "()V",
            2,
            &[
                Opcode::Iconst(1),
                Opcode::Iconst(2),
                Opcode::DupX1,
                Opcode::Istore(0),
                Opcode::Istore(1),
                Opcode::Pop,
            ],
        );
        // Stack after dup_x1 is 2 1 2: stores take 2 then 1.
        assert_eq!(text, ["mov dword [ebp-4], 2", "mov dword [ebp-8], 1"]);
    }

    #[test]
    fn test_swap_register_and_constant() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "(I)V",
            2,
            &[Opcode::Iload(0), Opcode::Iconst(7), Opcode::Swap, Opcode::Istore(1), Opcode::Pop],
        );
        assert_eq!(text, ["mov ebx, dword [ebp+8]", "mov dword [ebp-4], ebx"]);
    }
}
