//! Array elements, instance fields and statics.

use super::MethodCompiler;
use super::item::{Item, Kind, KindSet, Location};
use crate::bytecode::{FieldKind, FieldRef};
use crate::error::{CompileError, Result};
use crate::meta::{FieldStorage, Helper, ResolveError, ResolvedField, layout};
use crate::x86::{Cond, Count, Emit, Insn, Mem, Reg, ShiftOp, Width};
use std::sync::Arc;

/// Address of an array element, folding a constant index into the displacement.
fn element(array: Reg, index: &Item, size: i32) -> Result<Mem> {
    match index.location() {
        Location::Constant(i) => Ok(Mem::base(
            array,
            layout::ARRAY_DATA_OFFSET.wrapping_add((i as i32).wrapping_mul(size)),
        )),
        Location::Reg(r) => Ok(Mem::indexed(array, r, size as u8, layout::ARRAY_DATA_OFFSET)),
        _ => Err(CompileError::internal(format!("array index {} not loaded", index))),
    }
}

fn incompatible(field: &FieldRef, why: &str) -> CompileError {
    ResolveError::Incompatible(format!("{} {}", field, why)).into()
}

impl MethodCompiler<'_> {
    /// Load a value of `kind` from memory into fresh registers, widening
    /// narrow kinds to int.
    pub(super) fn load_value(&mut self, kind: FieldKind, src: Mem) -> Result<Item> {
        let ty = kind.jvm_type();
        let id = self.em.pool.fresh_id();
        if ty.is_wide() {
            let (lo, hi) = self.em.alloc_pair(id)?;
            let os = &mut *self.em.os;
            if src.uses(lo) {
                os.lea(lo, src);
                os.mov(hi, Mem::base(lo, 4));
                os.mov(lo, Mem::base(lo, 0));
            } else {
                os.mov(lo, src);
                os.mov(hi, src.offset(4));
            }
            return Ok(Item::in_pair(ty, lo, hi, &mut self.em.pool));
        }
        let r = self.em.alloc(id)?;
        let os = &mut *self.em.os;
        match kind {
            FieldKind::Byte => os.movsx(Width::Byte, r, src),
            FieldKind::Boolean => os.movzx(Width::Byte, r, src),
            FieldKind::Char => os.movzx(Width::Word, r, src),
            FieldKind::Short => os.movsx(Width::Word, r, src),
            _ => os.mov(r, src),
        }
        Ok(Item::in_reg(ty, r, &mut self.em.pool))
    }

    /// Bring a value about to be stored into a constant or register form
    /// that `store_value` accepts.
    fn prepare_store_value(&mut self, kind: FieldKind, value: &mut Item) -> Result<()> {
        value.load_if(&mut self.em, KindSet::CONSTANT | KindSet::REGISTER)?;
        if kind.size() == 1 && value.kind() != Kind::Constant {
            value.load_byte(&mut self.em)?;
        }
        Ok(())
    }

    fn store_value(&mut self, kind: FieldKind, dst: Mem, value: &Item) -> Result<()> {
        let (lo, hi) = value.store_operands()?;
        let os = &mut *self.em.os;
        match kind.size() {
            1 => os.mov_w(Width::Byte, dst, lo),
            2 => os.mov_w(Width::Word, dst, lo),
            _ => os.mov(dst, lo),
        }
        if let Some(hi) = hi {
            os.mov(dst.offset(4), hi);
        }
        Ok(())
    }

    /// Mark the card of the object in `object`. Clobbers the register.
    fn store_barrier(&mut self, object: Reg) {
        let os = &mut *self.em.os;
        os.shift(ShiftOp::Shr, object, Count::Imm(layout::CARD_SHIFT));
        os.mov_w(Width::Byte, Mem::base(object, self.env.card_table as i32), 1);
    }

    /// `cmp [array+8], index; ja ok; int 5; ok:`
    fn bounds_check(&mut self, array: Reg, index: &Item) -> Result<()> {
        let ok = self.em.os.new_label();
        self.em
            .os
            .cmp(Mem::base(array, layout::ARRAY_LENGTH_OFFSET), index.operand()?);
        self.em.os.jcc(Cond::A, ok);
        self.em.os.emit(Insn::Int(5));
        self.em.os.bind(ok);
        Ok(())
    }

    // ==================== Arrays ====================

    pub(super) fn visit_arraylength(&mut self) -> Result<()> {
        let mut array = self.em.pop_ref()?;
        let r = array.load_reg(&mut self.em)?;
        array.release(&mut self.em.pool);
        let length = self.load_value(FieldKind::Int, Mem::base(r, layout::ARRAY_LENGTH_OFFSET))?;
        self.em.push(length);
        Ok(())
    }

    pub(super) fn visit_array_load(&mut self, kind: FieldKind) -> Result<()> {
        let mut index = self.em.pop_int()?;
        let mut array = self.em.pop_ref()?;
        index.load_if(&mut self.em, KindSet::CONSTANT | KindSet::REGISTER)?;
        let r = array.load_reg(&mut self.em)?;
        self.bounds_check(r, &index)?;
        let src = element(r, &index, kind.size())?;
        index.release(&mut self.em.pool);
        array.release(&mut self.em.pool);
        let value = self.load_value(kind, src)?;
        self.em.push(value);
        Ok(())
    }

    pub(super) fn visit_array_store(&mut self, kind: FieldKind) -> Result<()> {
        let mut value = self.em.pop(kind.jvm_type())?;
        let mut index = self.em.pop_int()?;
        let mut array = self.em.pop_ref()?;
        self.prepare_store_value(kind, &mut value)?;
        index.load_if(&mut self.em, KindSet::CONSTANT | KindSet::REGISTER)?;
        let r = array.load_reg(&mut self.em)?;
        self.bounds_check(r, &index)?;
        let dst = element(r, &index, kind.size())?;
        self.store_value(kind, dst, &value)?;
        for mut item in [value, index, array] {
            item.release(&mut self.em.pool);
        }
        Ok(())
    }

    /// Reference array store: element type check through the runtime, then
    /// the store and its card mark. Storing null needs neither.
    pub(super) fn visit_aastore(&mut self) -> Result<()> {
        let null_value = matches!(self.em.stack.peek(0), Some(v) if v.const_bits() == Some(0));
        if null_value {
            return self.visit_array_store(FieldKind::Reference);
        }
        self.em.flush();
        let mut value = self.em.pop_ref()?;
        let mut index = self.em.pop_int()?;
        let mut array = self.em.pop_ref()?;
        let v = value.load_reg(&mut self.em)?;
        let i = index.load_reg(&mut self.em)?;
        let a = array.load_reg(&mut self.em)?;
        self.bounds_check(a, &index)?;

        let os = &mut *self.em.os;
        for r in [a, i, v] {
            os.push(r);
        }
        os.push(a);
        os.push(v);
        self.call_helper(Helper::ArrayStoreCheck);
        let os = &mut *self.em.os;
        for r in [v, i, a] {
            os.pop(r);
        }

        os.mov(Mem::indexed(a, i, 4, layout::ARRAY_DATA_OFFSET), v);
        self.store_barrier(a);
        for mut item in [value, index, array] {
            item.release(&mut self.em.pool);
        }
        Ok(())
    }

    // ==================== Fields ====================

    fn resolve_static(&self, field: &FieldRef) -> Result<(Arc<ResolvedField>, u32)> {
        let resolved = self.resolver.resolve_field(field)?;
        match resolved.storage {
            FieldStorage::Static { slot } => Ok((resolved, slot)),
            FieldStorage::Instance { .. } => Err(incompatible(field, "is not static")),
        }
    }

    fn resolve_instance(&self, field: &FieldRef) -> Result<(FieldKind, i32)> {
        let resolved = self.resolver.resolve_field(field)?;
        match resolved.storage {
            FieldStorage::Instance { offset } => Ok((resolved.kind, offset)),
            FieldStorage::Static { .. } => Err(incompatible(field, "is static")),
        }
    }

    pub(super) fn visit_getstatic(&mut self, field: &FieldRef) -> Result<()> {
        let (resolved, slot) = self.resolve_static(field)?;
        self.init_guard(&resolved.declaring)?;
        let value = self.load_value(resolved.kind, self.env.statics_slot(slot))?;
        self.em.push(value);
        Ok(())
    }

    pub(super) fn visit_putstatic(&mut self, field: &FieldRef) -> Result<()> {
        let (resolved, slot) = self.resolve_static(field)?;
        let kind = resolved.kind;
        self.init_guard(&resolved.declaring)?;
        let mut value = self.em.pop(kind.jvm_type())?;
        self.prepare_store_value(kind, &mut value)?;
        let dst = self.env.statics_slot(slot);
        self.store_value(kind, dst, &value)?;
        if kind == FieldKind::Reference && value.const_bits() != Some(0) {
            // The slot address is known, and so is its card.
            let card = self.env.card_table + ((dst.disp as u32) >> layout::CARD_SHIFT);
            self.em.os.mov_w(Width::Byte, Mem::abs(card), 1);
        }
        value.release(&mut self.em.pool);
        Ok(())
    }

    pub(super) fn visit_getfield(&mut self, field: &FieldRef) -> Result<()> {
        let (kind, offset) = self.resolve_instance(field)?;
        let mut object = self.em.pop_ref()?;
        let r = object.load_reg(&mut self.em)?;
        object.release(&mut self.em.pool);
        let value = self.load_value(kind, Mem::base(r, offset))?;
        self.em.push(value);
        Ok(())
    }

    pub(super) fn visit_putfield(&mut self, field: &FieldRef) -> Result<()> {
        let (kind, offset) = self.resolve_instance(field)?;
        let mut value = self.em.pop(kind.jvm_type())?;
        let mut object = self.em.pop_ref()?;
        self.prepare_store_value(kind, &mut value)?;
        let r = object.load_reg(&mut self.em)?;
        self.store_value(kind, Mem::base(r, offset), &value)?;
        if kind == FieldKind::Reference && value.const_bits() != Some(0) {
            self.store_barrier(r);
        }
        value.release(&mut self.em.pool);
        object.release(&mut self.em.pool);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::bytecode::Opcode;
    use crate::meta::{ClassDef, ClassPool};

    fn point_pool() -> ClassPool {
        let defs: Vec<ClassDef> = toml::from_str::<Classes>(
            r#"
            [[class]]
            name = "demo/Point"
            initialized = true
            field = [
                { name = "x", descriptor = "I" },
                { name = "next", descriptor = "Ldemo/Point;" },
                { name = "origin", descriptor = "Ldemo/Point;", static = true },
            ]
            "#,
        )
        .unwrap()
        .class;
        ClassPool::new(defs).unwrap()
    }

    #[derive(serde::Deserialize)]
    struct Classes {
        class: Vec<ClassDef>,
    }

    #[test]
    fn test_constant_index_folds_into_displacement() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "([I)I",
            1,
            &[Opcode::Aload(0), Opcode::Iconst(3), Opcode::Iaload, Opcode::Ireturn],
        );
        assert_eq!(
            &text[..4],
            [
                "mov ebx, dword [ebp+8]",
                "cmp dword [ebx+8], 3",
                "ja L4",
                "int 5",
            ]
        );
        assert_eq!(text[4], "mov ebx, dword [ebx+24]");
    }

    #[test]
    fn test_byte_store_uses_byte_register() {
        let pool = empty_pool();
        let text = compile_block(
            &pool,
            "([BII)V",
            3,
            &[Opcode::Aload(0), Opcode::Iload(1), Opcode::Iload(2), Opcode::Bastore],
        );
        assert_eq!(text[0], "mov ebx, dword [ebp+8]");
        assert!(text.contains(&"mov byte [edi+esi*1+12], bl".to_string()));
    }

    #[test]
    fn test_putfield_marks_card() {
        let pool = point_pool();
        let text = compile_block(
            &pool,
            "(Ldemo/Point;Ldemo/Point;)V",
            2,
            &[
                Opcode::Aload(0),
                Opcode::Aload(1),
                Opcode::Putfield("demo/Point.next:Ldemo/Point;".parse().unwrap()),
            ],
        );
        assert_eq!(
            text,
            [
                "mov ebx, dword [ebp+8]",
                "mov esi, dword [ebp+12]",
                "mov dword [esi+12], ebx",
                "shr esi, 9",
                "mov byte [esi+2097152], 1",
            ]
        );
    }

    #[test]
    fn test_aastore_checks_then_marks_card() {
        let pool = point_pool();
        let text = compile_block(
            &pool,
            "([Ldemo/Point;ILdemo/Point;)V",
            3,
            &[Opcode::Aload(0), Opcode::Iload(1), Opcode::Aload(2), Opcode::Aastore],
        );
        let check = text.iter().position(|t| t.starts_with("call ")).unwrap();
        let store = text
            .iter()
            .position(|t| t.starts_with("mov dword [") && t.contains("*4+12], "))
            .unwrap();
        assert!(check < store, "{:?}", text);
        let array = text[store]["mov dword [".len()..].split('+').next().unwrap();
        assert_eq!(text[store + 1], format!("shr {}, 9", array));
        assert_eq!(text[store + 2], format!("mov byte [{}+2097152], 1", array));
        assert_eq!(text.len(), store + 3);
    }

    #[test]
    fn test_null_store_skips_barrier() {
        let pool = point_pool();
        let text = compile_block(
            &pool,
            "(Ldemo/Point;)V",
            1,
            &[
                Opcode::Aload(0),
                Opcode::AconstNull,
                Opcode::Putfield("demo/Point.next:Ldemo/Point;".parse().unwrap()),
                Opcode::AconstNull,
                Opcode::Putstatic("demo/Point.origin:Ldemo/Point;".parse().unwrap()),
            ],
        );
        assert_eq!(text.len(), 3);
        assert!(text.iter().all(|t| !t.starts_with("shr")));
    }
}
