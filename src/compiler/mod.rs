//! Single-pass bytecode to IA-32 compiler.
//!
//! A [`MethodCompiler`] is driven through a callback protocol: one call per
//! method, basic block and instruction. Each instruction is dispatched by
//! [`MethodCompiler::visit`] to a handler that moves [`Item`]s between the
//! virtual stack, registers and memory, emitting code only when a value has
//! to be materialized. Handlers live in the submodules by opcode group.
//!
//! ## Register conventions
//!
//! - EAX / EDX:EAX: call results, MUL/IDIV operands
//! - ECX: variable shift counts, LOOP counter
//! - ESI: LODSD source in `instanceof` and interface dispatch
//! - ESP / EBP: native stack and frame pointer, never allocated

mod arith;
mod control;
mod float;
mod frame;
mod invoke;
mod item;
mod memory;
mod objects;
mod regpool;
mod stackops;
mod vstack;

pub use frame::Frame;
pub use item::{Item, Kind, KindSet, Location};
pub use regpool::{ItemId, RegState, RegisterPool};
pub use vstack::{Emitter, VirtualStack};

use crate::bytecode::{ClassRef, FieldKind, JvmType, MethodBody, Opcode};
use crate::error::{CompileError, Result};
use crate::meta::{Helper, Resolver, RuntimeEnv};
use crate::x86::{AluOp, CodeStream, Cond, Emit, FpuOp, Insn, Label, Mem, Reg, ShiftOp, Width};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, trace};

/// One (bytecode address, native offset) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddressMapEntry {
    pub bytecode: u32,
    pub native: usize,
}

/// Result of compiling one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledMethod {
    pub method: String,
    pub arg_slots: u16,
    pub max_locals: u16,
    /// Native extent `[code_start, code_end)` in stream positions
    pub code_start: usize,
    pub code_end: usize,
    pub address_map: Vec<AddressMapEntry>,
}

/// An inlined callee being compiled.
struct InlineFrame {
    end: Label,
    /// Virtual stack depth of the caller below the callee's operands
    outer_depth: usize,
}

pub struct MethodCompiler<'a> {
    em: Emitter<'a>,
    resolver: &'a dyn Resolver,
    env: RuntimeEnv,
    frame: Option<Frame>,
    method: String,
    /// Declaring class of the method and of each inlined callee
    classes: Vec<String>,
    /// Bytecode address -> label, one scope per (inlined) method
    scopes: Vec<HashMap<u32, Label>>,
    inlined: Vec<InlineFrame>,
    /// Locals known to hold a constant in the current block: index -> (type, bits)
    constants: HashMap<u16, (JvmType, i64)>,
    address_map: Vec<AddressMapEntry>,
    code_start: usize,
}

impl<'a> MethodCompiler<'a> {
    pub fn new(os: &'a mut dyn CodeStream, resolver: &'a dyn Resolver, env: RuntimeEnv) -> Self {
        Self {
            em: Emitter::new(os),
            resolver,
            env,
            frame: None,
            method: String::new(),
            classes: Vec::new(),
            scopes: vec![HashMap::new()],
            inlined: Vec::new(),
            constants: HashMap::new(),
            address_map: Vec::new(),
            code_start: 0,
        }
    }

    pub fn stack(&self) -> &VirtualStack {
        &self.em.stack
    }

    pub fn pool(&self) -> &RegisterPool {
        &self.em.pool
    }

    fn frame(&self) -> Result<&Frame> {
        self.frame
            .as_ref()
            .ok_or_else(|| CompileError::internal("no method started"))
    }

    fn label(&mut self, address: u32) -> Label {
        let os = &mut *self.em.os;
        let scope = self.scopes.last_mut();
        match scope {
            Some(scope) => *scope.entry(address).or_insert_with(|| os.new_label()),
            None => os.new_label(),
        }
    }

    fn call_helper(&mut self, helper: Helper) {
        let target = self.env.helper(helper);
        self.em.os.call(target);
    }

    /// Push the value a call left in EAX or EDX:EAX.
    fn push_call_result(&mut self, ty: Option<JvmType>) {
        match ty {
            Some(ty) if ty.is_wide() => {
                let item = Item::in_pair(ty, Reg::Eax, Reg::Edx, &mut self.em.pool);
                self.em.push(item);
            }
            Some(ty) => {
                let item = Item::in_reg(ty, Reg::Eax, &mut self.em.pool);
                self.em.push(item);
            }
            None => {}
        }
    }

    // ==================== Callbacks ====================

    pub fn start_method(&mut self, body: &MethodBody) -> Result<()> {
        let arg_slots = body.arg_slots()?;
        self.method = body.to_string();
        self.classes = vec![body.class.clone()];
        self.code_start = self.em.os.position();
        let frame = Frame::new(self.em.os, arg_slots, body.max_locals);
        frame.emit_prologue(self.em.os);
        debug!(method = %body, arg_slots, max_locals = frame.max_locals(), "start method");
        self.frame = Some(frame);
        Ok(())
    }

    /// Start a block whose entry operand stack has the given types. The
    /// values are on the native stack, as left by every predecessor.
    pub fn start_basic_block(&mut self, address: u32, entry: &[JvmType]) -> Result<()> {
        if !self.em.stack.is_empty() || !self.em.pool.all_free() {
            return Err(CompileError::internal(format!(
                "block {} started with live values",
                address
            )));
        }
        let label = self.label(address);
        self.em.os.bind(label);
        self.em.address = address;
        for ty in entry {
            self.em.push(Item::stack(*ty));
        }
        self.constants.clear();
        debug!(address, depth = entry.len(), "start block");
        Ok(())
    }

    pub fn start_instruction(&mut self, address: u32) {
        self.em.address = address;
        if self.inlined.is_empty() {
            self.address_map.push(AddressMapEntry {
                bytecode: address,
                native: self.em.os.position(),
            });
        }
    }

    pub fn end_instruction(&mut self) -> Result<()> {
        if !self.em.stack.stack_items_are_prefix() {
            return Err(CompileError::internal(format!(
                "native stack items out of order after bytecode {}",
                self.em.address
            )));
        }
        Ok(())
    }

    pub fn end_basic_block(&mut self) -> Result<()> {
        self.em.flush();
        self.em.discard_all();
        self.constants.clear();
        if !self.em.pool.all_free() {
            return Err(CompileError::internal(format!(
                "registers still held at the end of block {}",
                self.em.address
            )));
        }
        Ok(())
    }

    pub fn end_method(mut self) -> Result<CompiledMethod> {
        if !self.inlined.is_empty() {
            return Err(CompileError::internal("method ended inside an inlined callee"));
        }
        let frame = self
            .frame
            .take()
            .ok_or_else(|| CompileError::internal("no method started"))?;
        frame.emit_epilogue(self.em.os);
        let code_end = self.em.os.position();
        debug!(method = %self.method, size = code_end - self.code_start, "end method");
        Ok(CompiledMethod {
            method: self.method,
            arg_slots: frame.arg_slots(),
            max_locals: frame.max_locals(),
            code_start: self.code_start,
            code_end,
            address_map: self.address_map,
        })
    }

    /// Begin splicing `callee` in. Its locals start at `locals_base`.
    pub fn start_inlined_method(&mut self, callee: &MethodBody, locals_base: u16) -> Result<()> {
        let end = self.em.os.new_label();
        let arg_slots = callee.arg_slots()?;
        let outer_depth = self
            .em
            .stack
            .len()
            .checked_sub(callee.arg_types()?.len())
            .ok_or(CompileError::StackUnderflow {
                address: self.em.address,
            })?;
        let locals = locals_base + callee.max_locals.max(arg_slots);
        match self.frame.as_mut() {
            Some(frame) => frame.grow(locals),
            None => return Err(CompileError::internal("no method started")),
        }
        if callee.is_static {
            let class = self.resolver.resolve_class(&ClassRef(callee.class.clone()))?;
            self.init_guard(&class)?;
        }
        debug!(callee = %callee, locals_base, "start inlined method");
        self.classes.push(callee.class.clone());
        self.scopes.push(HashMap::new());
        self.inlined.push(InlineFrame { end, outer_depth });
        Ok(())
    }

    /// A return inside an inlined callee: leave the result on top of the
    /// caller's operands and continue after the call site.
    pub fn visit_inlined_return(&mut self, ty: Option<JvmType>) -> Result<()> {
        let (end, outer_depth) = match self.inlined.last() {
            Some(frame) => (frame.end, frame.outer_depth),
            None => return Err(CompileError::internal("inlined return outside an inlined callee")),
        };
        let mut result = match ty {
            Some(ty) => Some(self.em.pop(ty)?),
            None => None,
        };
        if self.em.stack.len() > outer_depth {
            if let Some(value) = result.as_mut() {
                value.load(&mut self.em)?;
            }
            while self.em.stack.len() > outer_depth {
                let extra = self.em.pop_any()?;
                extra.discard(&mut self.em);
            }
        }
        if let Some(value) = result {
            self.em.push(value);
        }
        self.em.flush();
        self.em.discard_all();
        self.em.os.jmp(end);
        Ok(())
    }

    pub fn end_inlined_method(&mut self) -> Result<()> {
        let frame = self
            .inlined
            .pop()
            .ok_or_else(|| CompileError::internal("no inlined method to end"))?;
        self.scopes.pop();
        self.classes.pop();
        self.em.os.bind(frame.end);
        debug!("end inlined method");
        Ok(())
    }

    /// Poll the yield flag; call the yield helper when it is set.
    pub fn visit_yieldpoint(&mut self) -> Result<()> {
        self.em.flush();
        let skip = self.em.os.new_label();
        self.em.os.cmp(Mem::abs(self.env.yield_flag), 0);
        self.em.os.jcc(Cond::E, skip);
        self.call_helper(Helper::Yield);
        self.em.os.bind(skip);
        Ok(())
    }

    // ==================== Dispatch ====================

    pub fn visit(&mut self, op: &Opcode) -> Result<()> {
        use Opcode::*;
        trace!(address = self.em.address, ?op, depth = self.em.stack.len(), "visit");
        match op {
            Nop => self.em.os.emit(Insn::Nop),
            AconstNull => self.em.push(Item::null()),
            Iconst(v) => self.em.push(Item::int(*v)),
            Lconst(v) => self.em.push(Item::long(*v)),
            Fconst(v) => self.em.push(Item::float(*v)),
            Dconst(v) => self.em.push(Item::double(*v)),
            Ldc(value) => self.visit_ldc(value)?,

            Iload(i) => self.visit_load(JvmType::Int, *i)?,
            Lload(i) => self.visit_load(JvmType::Long, *i)?,
            Fload(i) => self.visit_load(JvmType::Float, *i)?,
            Dload(i) => self.visit_load(JvmType::Double, *i)?,
            Aload(i) => self.visit_load(JvmType::Reference, *i)?,
            Istore(i) => self.visit_store(JvmType::Int, *i)?,
            Lstore(i) => self.visit_store(JvmType::Long, *i)?,
            Fstore(i) => self.visit_store(JvmType::Float, *i)?,
            Dstore(i) => self.visit_store(JvmType::Double, *i)?,
            Astore(i) => self.visit_store(JvmType::Reference, *i)?,
            Iinc { index, delta } => self.visit_iinc(*index, *delta)?,

            Iaload => self.visit_array_load(FieldKind::Int)?,
            Laload => self.visit_array_load(FieldKind::Long)?,
            Faload => self.visit_array_load(FieldKind::Float)?,
            Daload => self.visit_array_load(FieldKind::Double)?,
            Aaload => self.visit_array_load(FieldKind::Reference)?,
            Baload => self.visit_array_load(FieldKind::Byte)?,
            Caload => self.visit_array_load(FieldKind::Char)?,
            Saload => self.visit_array_load(FieldKind::Short)?,
            Iastore => self.visit_array_store(FieldKind::Int)?,
            Lastore => self.visit_array_store(FieldKind::Long)?,
            Fastore => self.visit_array_store(FieldKind::Float)?,
            Dastore => self.visit_array_store(FieldKind::Double)?,
            Aastore => self.visit_aastore()?,
            Bastore => self.visit_array_store(FieldKind::Byte)?,
            Castore => self.visit_array_store(FieldKind::Char)?,
            Sastore => self.visit_array_store(FieldKind::Short)?,

            Pop => self.visit_pop(1)?,
            Pop2 => self.visit_pop(2)?,
            Dup => self.visit_dup(1, 0)?,
            DupX1 => self.visit_dup(1, 1)?,
            DupX2 => self.visit_dup(1, 2)?,
            Dup2 => self.visit_dup(2, 0)?,
            Dup2X1 => self.visit_dup(2, 1)?,
            Dup2X2 => self.visit_dup(2, 2)?,
            Swap => self.visit_swap()?,

            Iadd => self.visit_int_alu(AluOp::Add)?,
            Isub => self.visit_int_alu(AluOp::Sub)?,
            Iand => self.visit_int_alu(AluOp::And)?,
            Ior => self.visit_int_alu(AluOp::Or)?,
            Ixor => self.visit_int_alu(AluOp::Xor)?,
            Imul => self.visit_imul()?,
            Idiv => self.visit_int_div(false)?,
            Irem => self.visit_int_div(true)?,
            Ineg => self.visit_ineg()?,
            Ishl => self.visit_int_shift(ShiftOp::Shl)?,
            Ishr => self.visit_int_shift(ShiftOp::Sar)?,
            Iushr => self.visit_int_shift(ShiftOp::Shr)?,

            Ladd => self.visit_long_alu(AluOp::Add, AluOp::Adc)?,
            Lsub => self.visit_long_alu(AluOp::Sub, AluOp::Sbb)?,
            Land => self.visit_long_alu(AluOp::And, AluOp::And)?,
            Lor => self.visit_long_alu(AluOp::Or, AluOp::Or)?,
            Lxor => self.visit_long_alu(AluOp::Xor, AluOp::Xor)?,
            Lmul => self.visit_lmul()?,
            Ldiv => self.visit_long_helper(Helper::LongDiv)?,
            Lrem => self.visit_long_helper(Helper::LongRem)?,
            Lneg => self.visit_lneg()?,
            Lshl => self.visit_long_shift(ShiftOp::Shl)?,
            Lshr => self.visit_long_shift(ShiftOp::Sar)?,
            Lushr => self.visit_long_shift(ShiftOp::Shr)?,

            Fadd => self.visit_fpu_arith(JvmType::Float, FpuOp::Add)?,
            Fsub => self.visit_fpu_arith(JvmType::Float, FpuOp::Sub)?,
            Fmul => self.visit_fpu_arith(JvmType::Float, FpuOp::Mul)?,
            Fdiv => self.visit_fpu_arith(JvmType::Float, FpuOp::Div)?,
            Frem => self.visit_fpu_rem(JvmType::Float)?,
            Fneg => self.visit_fpu_neg(JvmType::Float)?,
            Dadd => self.visit_fpu_arith(JvmType::Double, FpuOp::Add)?,
            Dsub => self.visit_fpu_arith(JvmType::Double, FpuOp::Sub)?,
            Dmul => self.visit_fpu_arith(JvmType::Double, FpuOp::Mul)?,
            Ddiv => self.visit_fpu_arith(JvmType::Double, FpuOp::Div)?,
            Drem => self.visit_fpu_rem(JvmType::Double)?,
            Dneg => self.visit_fpu_neg(JvmType::Double)?,

            I2l => self.visit_i2l()?,
            L2i => self.visit_l2i()?,
            I2b => self.visit_int_narrow(Width::Byte, true)?,
            I2c => self.visit_int_narrow(Width::Word, false)?,
            I2s => self.visit_int_narrow(Width::Word, true)?,
            I2f => self.visit_convert(JvmType::Int, JvmType::Float)?,
            I2d => self.visit_convert(JvmType::Int, JvmType::Double)?,
            L2f => self.visit_convert(JvmType::Long, JvmType::Float)?,
            L2d => self.visit_convert(JvmType::Long, JvmType::Double)?,
            F2i => self.visit_convert(JvmType::Float, JvmType::Int)?,
            F2l => self.visit_convert(JvmType::Float, JvmType::Long)?,
            F2d => self.visit_convert(JvmType::Float, JvmType::Double)?,
            D2i => self.visit_convert(JvmType::Double, JvmType::Int)?,
            D2l => self.visit_convert(JvmType::Double, JvmType::Long)?,
            D2f => self.visit_convert(JvmType::Double, JvmType::Float)?,

            Lcmp => self.visit_lcmp()?,
            Fcmpl => self.visit_fpu_compare(JvmType::Float, false)?,
            Fcmpg => self.visit_fpu_compare(JvmType::Float, true)?,
            Dcmpl => self.visit_fpu_compare(JvmType::Double, false)?,
            Dcmpg => self.visit_fpu_compare(JvmType::Double, true)?,

            Ifeq(t) => self.visit_if_zero(JvmType::Int, Cond::E, *t)?,
            Ifne(t) => self.visit_if_zero(JvmType::Int, Cond::Ne, *t)?,
            Iflt(t) => self.visit_if_zero(JvmType::Int, Cond::L, *t)?,
            Ifge(t) => self.visit_if_zero(JvmType::Int, Cond::Ge, *t)?,
            Ifgt(t) => self.visit_if_zero(JvmType::Int, Cond::G, *t)?,
            Ifle(t) => self.visit_if_zero(JvmType::Int, Cond::Le, *t)?,
            Ifnull(t) => self.visit_if_zero(JvmType::Reference, Cond::E, *t)?,
            Ifnonnull(t) => self.visit_if_zero(JvmType::Reference, Cond::Ne, *t)?,
            IfIcmpeq(t) => self.visit_if_compare(JvmType::Int, Cond::E, *t)?,
            IfIcmpne(t) => self.visit_if_compare(JvmType::Int, Cond::Ne, *t)?,
            IfIcmplt(t) => self.visit_if_compare(JvmType::Int, Cond::L, *t)?,
            IfIcmpge(t) => self.visit_if_compare(JvmType::Int, Cond::Ge, *t)?,
            IfIcmpgt(t) => self.visit_if_compare(JvmType::Int, Cond::G, *t)?,
            IfIcmple(t) => self.visit_if_compare(JvmType::Int, Cond::Le, *t)?,
            IfAcmpeq(t) => self.visit_if_compare(JvmType::Reference, Cond::E, *t)?,
            IfAcmpne(t) => self.visit_if_compare(JvmType::Reference, Cond::Ne, *t)?,
            Goto(t) => self.visit_goto(*t)?,
            Jsr(t) => self.visit_jsr(*t)?,
            Ret(i) => self.visit_ret(*i)?,
            Tableswitch {
                default,
                low,
                targets,
            } => {
                let cases: Vec<(i32, u32)> = targets
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (low.wrapping_add(i as i32), *t))
                    .collect();
                self.visit_switch(&cases, *default)?
            }
            Lookupswitch { default, pairs } => self.visit_switch(pairs, *default)?,

            Ireturn => self.visit_return(Some(JvmType::Int))?,
            Lreturn => self.visit_return(Some(JvmType::Long))?,
            Freturn => self.visit_return(Some(JvmType::Float))?,
            Dreturn => self.visit_return(Some(JvmType::Double))?,
            Areturn => self.visit_return(Some(JvmType::Reference))?,
            Return => self.visit_return(None)?,

            Getstatic(f) => self.visit_getstatic(f)?,
            Putstatic(f) => self.visit_putstatic(f)?,
            Getfield(f) => self.visit_getfield(f)?,
            Putfield(f) => self.visit_putfield(f)?,
            Invokevirtual(m) => self.visit_invoke(invoke::InvokeKind::Virtual, m)?,
            Invokespecial(m) => self.visit_invoke(invoke::InvokeKind::Special, m)?,
            Invokestatic(m) => self.visit_invoke(invoke::InvokeKind::Static, m)?,
            Invokeinterface(m) => self.visit_invoke(invoke::InvokeKind::Interface, m)?,

            New(c) => self.visit_new(c)?,
            Newarray(t) => self.visit_newarray(*t)?,
            Anewarray(c) => self.visit_anewarray(c)?,
            Multianewarray { class, dims } => self.visit_multianewarray(class, *dims)?,
            Arraylength => self.visit_arraylength()?,
            Athrow => self.visit_athrow()?,
            Checkcast(c) => self.visit_checkcast(c)?,
            Instanceof(c) => self.visit_instanceof(c)?,
            Monitorenter => self.visit_monitor(Helper::MonitorEnter)?,
            Monitorexit => self.visit_monitor(Helper::MonitorExit)?,
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for compiling small snippets in unit tests.

    use super::*;
    use crate::meta::ClassPool;
    use crate::x86::Listing;

    pub fn empty_pool() -> ClassPool {
        ClassPool::new(Vec::new()).unwrap()
    }

    pub fn body(descriptor: &str, max_locals: u16, code: Vec<Opcode>) -> MethodBody {
        MethodBody {
            class: "test/T".into(),
            name: "m".into(),
            descriptor: descriptor.into(),
            is_static: true,
            max_locals,
            code,
            handlers: Vec::new(),
        }
    }

    /// Compile straight-line code as a single block and return the listing
    /// text of the body (without prologue and epilogue).
    pub fn compile_block(pool: &ClassPool, descriptor: &str, max_locals: u16, code: &[Opcode]) -> Vec<String> {
        let mut l = Listing::new();
        let m = body(descriptor, max_locals, code.to_vec());
        let mut c = MethodCompiler::new(&mut l, pool, RuntimeEnv::default());
        c.start_method(&m).unwrap();
        c.start_basic_block(0, &[]).unwrap();
        for (i, op) in code.iter().enumerate() {
            c.start_instruction(i as u32);
            c.visit(op).unwrap();
            c.end_instruction().unwrap();
        }
        c.end_basic_block().unwrap();
        c.end_method().unwrap();
        let text: Vec<String> = l.insns().iter().map(|i| i.to_string()).collect();
        // Drop "push ebp; mov ebp, esp; jmp" and everything from the epilogue.
        let end = text.iter().position(|t| t == "mov esp, ebp").unwrap_or(text.len());
        text[3..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::x86::Listing;

    #[test]
    fn test_constant_local_is_reused() {
        let pool = empty_pool();
        let mut l = Listing::new();
        let m = body("()I", 1, vec![]);
        let mut c = MethodCompiler::new(&mut l, &pool, RuntimeEnv::default());
        c.start_method(&m).unwrap();
        c.start_basic_block(0, &[]).unwrap();
        for op in [Opcode::Iconst(5), Opcode::Istore(0), Opcode::Iload(0)] {
            c.visit(&op).unwrap();
        }
        assert_eq!(c.stack().peek(0).unwrap().location(), Location::Constant(5));
        c.visit(&Opcode::Ireturn).unwrap();
        c.end_basic_block().unwrap();
        c.end_method().unwrap();
        let text: Vec<String> = l.insns().iter().map(|i| i.to_string()).collect();
        assert!(text.contains(&"mov dword [ebp-4], 5".to_string()));
        assert!(text.contains(&"mov eax, 5".to_string()));
    }

    #[test]
    fn test_address_map_is_monotonic() {
        let pool = empty_pool();
        let mut l = Listing::new();
        let code = vec![
            Opcode::Iload(0),
            Opcode::Iload(1),
            Opcode::Iadd,
            Opcode::Istore(2),
            Opcode::Return,
        ];
        let m = body("(II)V", 3, code.clone());
        let mut c = MethodCompiler::new(&mut l, &pool, RuntimeEnv::default());
        c.start_method(&m).unwrap();
        c.start_basic_block(0, &[]).unwrap();
        for (i, op) in code.iter().enumerate() {
            c.start_instruction(i as u32);
            c.visit(op).unwrap();
            c.end_instruction().unwrap();
        }
        c.end_basic_block().unwrap();
        let done = c.end_method().unwrap();
        let map = &done.address_map;
        assert!(map.windows(2).all(|w| w[0].bytecode < w[1].bytecode && w[0].native <= w[1].native));
        assert_eq!(done.arg_slots, 2);
        assert!(l.check().is_ok());
    }

    #[test]
    fn test_block_start_rejects_live_values() {
        let pool = empty_pool();
        let mut l = Listing::new();
        let m = body("()V", 0, vec![]);
        let mut c = MethodCompiler::new(&mut l, &pool, RuntimeEnv::default());
        c.start_method(&m).unwrap();
        c.start_basic_block(0, &[]).unwrap();
        c.visit(&Opcode::Iconst(1)).unwrap();
        let err = c.start_basic_block(1, &[]).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_stack_underflow_is_internal_error() {
        let pool = empty_pool();
        let mut l = Listing::new();
        let m = body("()V", 0, vec![]);
        let mut c = MethodCompiler::new(&mut l, &pool, RuntimeEnv::default());
        c.start_method(&m).unwrap();
        c.start_basic_block(0, &[]).unwrap();
        c.start_instruction(0);
        assert_eq!(c.visit(&Opcode::Pop), Err(CompileError::StackUnderflow { address: 0 }));
    }
}
