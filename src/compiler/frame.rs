//! Stack frame layout, prologue and epilogue.
//!
//! ```text
//!   [ebp+8+4*(n-1)]  argument 0        (pushed first by the caller)
//!   ...
//!   [ebp+8]          argument n-1
//!   [ebp+4]          return address
//!   [ebp]            saved ebp
//!   [ebp-4]          local n
//!   [ebp-8]          local n+1 ...
//! ```
//!
//! Non-argument locals are allocated by a trailer emitted after the method
//! body, so their count can still grow while inlined callees are compiled.

use crate::x86::{CodeStream, Emit, Insn, Label, Reg};

#[derive(Debug)]
pub struct Frame {
    arg_slots: u16,
    max_locals: u16,
    after_init: Label,
    init_locals: Label,
    epilogue: Label,
}

impl Frame {
    pub fn new(os: &mut dyn CodeStream, arg_slots: u16, max_locals: u16) -> Self {
        Frame {
            arg_slots,
            max_locals: max_locals.max(arg_slots),
            after_init: os.new_label(),
            init_locals: os.new_label(),
            epilogue: os.new_label(),
        }
    }

    pub fn arg_slots(&self) -> u16 {
        self.arg_slots
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    /// Extend the frame to hold at least `locals` slots.
    pub fn grow(&mut self, locals: u16) {
        self.max_locals = self.max_locals.max(locals);
    }

    /// Label every return jumps to.
    pub fn epilogue_label(&self) -> Label {
        self.epilogue
    }

    fn slot_disp(&self, index: u16) -> i32 {
        let i = index as i32;
        let args = self.arg_slots as i32;
        if i < args {
            8 + 4 * (args - 1 - i)
        } else {
            -4 * (i - args + 1)
        }
    }

    /// Displacement from EBP of local `index`. A category-2 local uses the
    /// slot of `index + 1` for its low word; the high word is 4 bytes above.
    pub fn local_disp(&self, index: u16, wide: bool) -> i32 {
        self.slot_disp(if wide { index + 1 } else { index })
    }

    pub fn emit_prologue(&self, os: &mut dyn CodeStream) {
        os.push(Reg::Ebp);
        os.mov(Reg::Ebp, Reg::Esp);
        os.jmp(self.init_locals);
        os.bind(self.after_init);
    }

    /// Epilogue followed by the local-initialization trailer.
    pub fn emit_epilogue(&self, os: &mut dyn CodeStream) {
        os.bind(self.epilogue);
        os.mov(Reg::Esp, Reg::Ebp);
        os.pop(Reg::Ebp);
        os.emit(Insn::Ret(self.arg_slots * 4));

        os.bind(self.init_locals);
        for _ in self.arg_slots..self.max_locals {
            os.push(0);
        }
        os.jmp(self.after_init);
    }
}
