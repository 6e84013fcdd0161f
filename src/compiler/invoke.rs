//! Method invocation: static, special, virtual and interface dispatch.
//!
//! Arguments are flushed to the native stack in bytecode order, which is
//! exactly the managed calling convention, so an invoke only has to find
//! the callee's code address and call it.

use super::MethodCompiler;
use crate::bytecode::MethodRef;
use crate::error::{CompileError, Result};
use crate::meta::{ResolveError, ResolvedMethod, layout};
use crate::x86::{Cond, Emit, Insn, Mem, Reg, Width};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum InvokeKind {
    Virtual,
    Special,
    Static,
    Interface,
}

fn incompatible(method: &MethodRef, why: &str) -> CompileError {
    ResolveError::Incompatible(format!("{} {}", method, why)).into()
}

impl MethodCompiler<'_> {
    pub(super) fn visit_invoke(&mut self, kind: InvokeKind, mref: &MethodRef) -> Result<()> {
        let method = self.resolver.resolve_method(mref)?;
        match kind {
            InvokeKind::Static if !method.is_static => return Err(incompatible(mref, "is not static")),
            InvokeKind::Virtual | InvokeKind::Special | InvokeKind::Interface if method.is_static => {
                return Err(incompatible(mref, "is static"));
            }
            InvokeKind::Interface if !method.declaring.is_interface => {
                return Err(incompatible(mref, "is not an interface method"));
            }
            _ => {}
        }
        if kind == InvokeKind::Static {
            self.init_guard(&method.declaring)?;
        }

        self.em.flush();
        for ty in method.arg_types().iter().rev() {
            let arg = self.em.pop(*ty)?;
            if !arg.is_stack() {
                return Err(CompileError::internal(format!("argument {} not flushed", arg)));
            }
        }
        trace!(callee = %mref, ?kind, "invoke");

        match kind {
            InvokeKind::Static | InvokeKind::Special => {
                let entry = self.env.statics_slot(method.code_slot);
                self.em.os.call(entry);
            }
            InvokeKind::Virtual => self.emit_virtual_call(mref, &method)?,
            InvokeKind::Interface => self.emit_interface_call(&method),
        }
        self.push_call_result(method.return_type());
        Ok(())
    }

    /// Load the receiver's TIB into EAX. A null receiver faults here.
    fn load_receiver_tib(&mut self, method: &ResolvedMethod) {
        let receiver = 4 * (method.arg_slots() as i32 - 1);
        let os = &mut *self.em.os;
        os.mov(Reg::Eax, Mem::base(Reg::Esp, receiver));
        os.mov(Reg::Eax, Mem::base(Reg::Eax, layout::TIB_OFFSET));
    }

    fn emit_virtual_call(&mut self, mref: &MethodRef, method: &ResolvedMethod) -> Result<()> {
        let index = method
            .vtable_index
            .ok_or_else(|| incompatible(mref, "has no virtual table entry"))?;
        self.load_receiver_tib(method);
        let slot = layout::array_slot(layout::TIB_FIRST_METHOD_INDEX + index as i32);
        self.em.os.call(Mem::base(Reg::Eax, slot));
        Ok(())
    }

    /// IMT dispatch. A slot whose collision flag is set holds a list of
    /// method objects that is scanned for the selector; a failed scan loads
    /// through a null pointer.
    fn emit_interface_call(&mut self, method: &ResolvedMethod) {
        let imt = method.imt_index() as i32;
        self.load_receiver_tib(method);
        let os = &mut *self.em.os;
        let direct = os.new_label();
        let scan = os.new_label();
        let miss = os.new_label();
        let found = os.new_label();

        os.mov(
            Reg::Ecx,
            Mem::base(Reg::Eax, layout::array_slot(layout::TIB_IMT_COLLISIONS_INDEX)),
        );
        os.movzx(
            Width::Byte,
            Reg::Ecx,
            Mem::base(Reg::Ecx, layout::ARRAY_DATA_OFFSET + imt),
        );
        os.mov(Reg::Eax, Mem::base(Reg::Eax, layout::array_slot(layout::TIB_IMT_INDEX)));
        os.mov(Reg::Eax, Mem::base(Reg::Eax, layout::array_slot(imt)));
        os.test(Reg::Ecx, Reg::Ecx);
        os.jcc(Cond::E, direct);

        os.mov(Reg::Ecx, Mem::base(Reg::Eax, layout::ARRAY_LENGTH_OFFSET));
        os.lea(Reg::Esi, Mem::base(Reg::Eax, layout::ARRAY_DATA_OFFSET));
        os.test(Reg::Ecx, Reg::Ecx);
        os.jcc(Cond::E, miss);
        os.bind(scan);
        os.emit(Insn::Lodsd);
        os.cmp(
            Mem::base(Reg::Eax, layout::METHOD_SELECTOR_OFFSET),
            method.selector as i32,
        );
        os.jcc(Cond::E, found);
        os.emit(Insn::Loop(scan));
        os.bind(miss);
        os.xor(Reg::Eax, Reg::Eax);
        os.bind(found);
        os.mov(Reg::Eax, Mem::base(Reg::Eax, layout::METHOD_CODE_OFFSET));
        os.bind(direct);
        os.call(Reg::Eax);
    }
}
