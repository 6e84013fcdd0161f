//! Allocation, type checks, monitors, throws and class-initialization guards.

use super::MethodCompiler;
use super::item::{Item, Location};
use crate::bytecode::{ArrayType, ClassRef, JvmType};
use crate::error::{CompileError, Result};
use crate::meta::{Helper, ResolveError, ResolvedClass, layout};
use crate::x86::{Cond, Emit, Insn, Mem, Reg};

/// Whether a class reference names an array type.
fn is_array(class: &ClassRef) -> bool {
    class.0.starts_with('[')
}

impl MethodCompiler<'_> {
    /// Call the class initializer unless the type object's state word says
    /// it already ran. Skipped for pre-initialized classes and for the class
    /// of the method being compiled.
    pub(super) fn init_guard(&mut self, class: &ResolvedClass) -> Result<()> {
        if class.initialized || self.classes.last() == Some(&class.name) {
            return Ok(());
        }
        self.em.flush();
        let type_object = self.env.statics_slot(class.type_slot);
        let os = &mut *self.em.os;
        let skip = os.new_label();
        os.mov(Reg::Eax, type_object);
        os.test(
            Mem::base(Reg::Eax, layout::TYPE_STATE_OFFSET),
            layout::ST_INITIALIZED,
        );
        os.jcc(Cond::Ne, skip);
        os.push(Reg::Eax);
        self.call_helper(Helper::InitializeClass);
        self.em.os.bind(skip);
        Ok(())
    }

    /// Statics slot of the type object for `class`, array classes included.
    fn type_operand(&self, class: &ClassRef) -> Result<Mem> {
        let resolved = self.resolver.resolve_class(class)?;
        Ok(self.env.statics_slot(resolved.type_slot))
    }

    // ==================== Allocation ====================

    pub(super) fn visit_new(&mut self, class: &ClassRef) -> Result<()> {
        if is_array(class) {
            return Err(ResolveError::Incompatible(format!(
                "cannot instantiate array class {}",
                class
            ))
            .into());
        }
        let resolved = self.resolver.resolve_class(class)?;
        if resolved.is_interface {
            return Err(ResolveError::Incompatible(format!(
                "cannot instantiate interface {}",
                class
            ))
            .into());
        }
        self.init_guard(&resolved)?;
        self.em.flush();
        self.em.os.push(self.env.statics_slot(resolved.type_slot));
        self.call_helper(Helper::AllocObject);
        self.push_call_result(Some(JvmType::Reference));
        Ok(())
    }

    pub(super) fn visit_newarray(&mut self, ty: ArrayType) -> Result<()> {
        self.em.flush();
        self.em.pop_int()?;
        self.em.os.push(ty as i32);
        self.call_helper(Helper::AllocPrimitiveArray);
        self.push_call_result(Some(JvmType::Reference));
        Ok(())
    }

    /// Push the type object of the elements of an object array.
    fn push_element_type(&mut self, class: &ClassRef) -> Result<()> {
        let slot = self.type_operand(class)?;
        self.em.os.push(slot);
        Ok(())
    }

    pub(super) fn visit_anewarray(&mut self, class: &ClassRef) -> Result<()> {
        self.em.flush();
        self.em.pop_int()?;
        self.push_element_type(class)?;
        self.call_helper(Helper::AllocObjectArray);
        self.push_call_result(Some(JvmType::Reference));
        Ok(())
    }

    /// `class` is the full array type, e.g. `[[I`. The innermost element is
    /// passed as a primitive array-type code or a type object.
    pub(super) fn visit_multianewarray(&mut self, class: &ClassRef, dims: u8) -> Result<()> {
        let depth = class.0.chars().take_while(|c| *c == '[').count();
        if dims == 0 || depth < dims as usize {
            return Err(CompileError::internal(format!(
                "multianewarray of {} with {} dimensions",
                class, dims
            )));
        }
        let element = &class.0[dims as usize..];
        self.em.flush();
        for _ in 0..dims {
            self.em.pop_int()?;
        }
        self.em.os.push(dims as i32);
        match element {
            "Z" => self.em.os.push(ArrayType::Boolean as i32),
            "C" => self.em.os.push(ArrayType::Char as i32),
            "F" => self.em.os.push(ArrayType::Float as i32),
            "D" => self.em.os.push(ArrayType::Double as i32),
            "B" => self.em.os.push(ArrayType::Byte as i32),
            "S" => self.em.os.push(ArrayType::Short as i32),
            "I" => self.em.os.push(ArrayType::Int as i32),
            "J" => self.em.os.push(ArrayType::Long as i32),
            other => {
                let name = other
                    .strip_prefix('L')
                    .and_then(|s| s.strip_suffix(';'))
                    .unwrap_or(other);
                self.push_element_type(&ClassRef(name.to_string()))?;
            }
        }
        self.call_helper(Helper::AllocMultiArray);
        self.push_call_result(Some(JvmType::Reference));
        Ok(())
    }

    // ==================== Type checks ====================

    /// The helper gets a copy of the reference, so the original stays on
    /// the stack.
    pub(super) fn visit_checkcast(&mut self, class: &ClassRef) -> Result<()> {
        let target = self.type_operand(class)?;
        self.em.flush();
        let os = &mut *self.em.os;
        os.push(Mem::base(Reg::Esp, 0));
        os.push(target);
        self.call_helper(Helper::CheckCast);
        Ok(())
    }

    /// Inline walk of the ancestor array. Null is not an instance of
    /// anything.
    pub(super) fn visit_instanceof(&mut self, class: &ClassRef) -> Result<()> {
        let target = self.type_operand(class)?;
        for reg in [Reg::Eax, Reg::Ecx, Reg::Esi] {
            self.em.request_register(reg)?;
        }
        let mut object = self.em.pop_ref()?;
        if let Location::Constant(0) = object.location() {
            for reg in [Reg::Eax, Reg::Ecx, Reg::Esi] {
                self.em.release_register(reg);
            }
            self.em.push(Item::int(0));
            return Ok(());
        }
        let r = object.load_reg(&mut self.em)?;
        let os = &mut *self.em.os;
        let (scan, miss, hit, done) = (os.new_label(), os.new_label(), os.new_label(), os.new_label());
        os.test(r, r);
        os.jcc(Cond::E, done);
        os.mov(Reg::Esi, Mem::base(r, layout::TIB_OFFSET));
        os.mov(
            Reg::Esi,
            Mem::base(Reg::Esi, layout::array_slot(layout::TIB_ANCESTORS_INDEX)),
        );
        os.mov(Reg::Ecx, Mem::base(Reg::Esi, layout::ARRAY_LENGTH_OFFSET));
        os.lea(Reg::Esi, Mem::base(Reg::Esi, layout::ARRAY_DATA_OFFSET));
        os.test(Reg::Ecx, Reg::Ecx);
        os.jcc(Cond::E, miss);
        os.bind(scan);
        os.emit(Insn::Lodsd);
        os.cmp(Reg::Eax, target);
        os.jcc(Cond::E, hit);
        os.emit(Insn::Loop(scan));
        os.bind(miss);
        os.mov(r, 0);
        os.jmp(done);
        os.bind(hit);
        os.mov(r, 1);
        os.bind(done);
        for reg in [Reg::Eax, Reg::Ecx, Reg::Esi] {
            self.em.release_register(reg);
        }
        object.retype(JvmType::Int);
        self.em.push(object);
        Ok(())
    }

    // ==================== Helpers without results ====================

    pub(super) fn visit_monitor(&mut self, helper: Helper) -> Result<()> {
        self.em.flush();
        self.em.pop_ref()?;
        self.call_helper(helper);
        Ok(())
    }

    pub(super) fn visit_athrow(&mut self) -> Result<()> {
        self.em.flush();
        self.em.pop_ref()?;
        self.call_helper(Helper::Throw);
        self.em.discard_all();
        Ok(())
    }
}
