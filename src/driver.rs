//! Bytecode decoder driving [`MethodCompiler`] through its callbacks.
//!
//! A method is split into basic blocks, the operand-stack types on entry to
//! every reachable block are found by abstract interpretation, and the
//! blocks are fed to the compiler in address order. Small static callees
//! can be spliced into the caller when inlining is enabled.

use crate::bytecode::{JvmType, LdcValue, MethodBody, Opcode};
use crate::compiler::{CompiledMethod, MethodCompiler};
use crate::config::CompilerConfig;
use crate::error::{CompileError, Result};
use crate::meta::{ClassPool, Resolver, RuntimeEnv};
use crate::x86::{Assembler, CodeStream, Listing};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Basic blocks of one method body.
#[derive(Debug, Default)]
pub struct BlockMap {
    leaders: BTreeSet<u32>,
    /// Entry operand stack (bottom first) of every reachable block
    entries: BTreeMap<u32, Vec<JvmType>>,
    len: u32,
}

impl BlockMap {
    pub fn leaders(&self) -> impl Iterator<Item = u32> + '_ {
        self.leaders.iter().copied()
    }

    pub fn entry(&self, start: u32) -> Option<&[JvmType]> {
        self.entries.get(&start).map(Vec::as_slice)
    }

    /// Reachable blocks in address order as (start, end, entry types).
    pub fn blocks(&self) -> impl Iterator<Item = (u32, u32, &[JvmType])> + '_ {
        self.entries.iter().map(|(start, entry)| {
            let end = self
                .leaders
                .range(start + 1..)
                .next()
                .copied()
                .unwrap_or(self.len);
            (*start, end, entry.as_slice())
        })
    }
}

/// One compiled method and the listing it was emitted into.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub class: String,
    /// `name` + descriptor
    pub key: String,
    pub listing: Listing,
    pub compiled: CompiledMethod,
}

pub struct Driver<'a> {
    resolver: &'a dyn Resolver,
    env: RuntimeEnv,
    config: &'a CompilerConfig,
}

fn underflow(address: u32) -> CompileError {
    CompileError::StackUnderflow { address }
}

/// Pop entries totalling `words` native words, bottom first.
fn take_words(stack: &mut Vec<JvmType>, words: usize, address: u32) -> Result<Vec<JvmType>> {
    let mut taken = Vec::new();
    let mut got = 0;
    while got < words {
        let ty = stack.pop().ok_or_else(|| underflow(address))?;
        got += ty.category() as usize;
        taken.push(ty);
    }
    if got != words {
        return Err(CompileError::internal(format!(
            "category-2 value split at bytecode {}",
            address
        )));
    }
    taken.reverse();
    Ok(taken)
}

impl<'a> Driver<'a> {
    pub fn new(resolver: &'a dyn Resolver, env: RuntimeEnv, config: &'a CompilerConfig) -> Self {
        Self {
            resolver,
            env,
            config,
        }
    }

    // ==================== Analysis ====================

    /// The callee to splice in for `op`, if it qualifies. `chain` holds the
    /// methods being compiled, outermost first.
    fn inline_target(&self, op: &Opcode, chain: &[String]) -> Result<Option<Arc<MethodBody>>> {
        let Opcode::Invokestatic(mref) = op else {
            return Ok(None);
        };
        if !self.config.inline || chain.len() > self.config.inline_max_depth {
            return Ok(None);
        }
        let method = self.resolver.resolve_method(mref)?;
        let Some(body) = method.body.clone() else {
            return Ok(None);
        };
        let eligible = method.is_static
            && body.code.len() <= self.config.inline_max_code
            && body.handlers.is_empty()
            && !body
                .code
                .iter()
                .any(|op| matches!(op, Opcode::Jsr(_) | Opcode::Ret(_)))
            && !chain.contains(&body.to_string());
        Ok(eligible.then_some(body))
    }

    /// Apply the stack effect of `op` to an abstract operand stack.
    fn effect(&self, op: &Opcode, stack: &mut Vec<JvmType>, address: u32) -> Result<()> {
        use JvmType::*;
        use Opcode::*;
        let (pops, push) = match op {
            Pop2 => {
                take_words(stack, 2, address)?;
                return Ok(());
            }
            Dup | DupX1 | DupX2 | Dup2 | Dup2X1 | Dup2X2 => {
                let (top, under) = match op {
                    Dup => (1, 0),
                    DupX1 => (1, 1),
                    DupX2 => (1, 2),
                    Dup2 => (2, 0),
                    Dup2X1 => (2, 1),
                    _ => (2, 2),
                };
                let upper = take_words(stack, top, address)?;
                let lower = take_words(stack, under, address)?;
                stack.extend(&upper);
                stack.extend(lower);
                stack.extend(upper);
                return Ok(());
            }
            Swap => {
                let n = stack.len();
                if n < 2 {
                    return Err(underflow(address));
                }
                stack.swap(n - 1, n - 2);
                return Ok(());
            }

            Nop | Iinc { .. } | Goto(_) | Jsr(_) | Ret(_) | Return | Checkcast(_) => (0, None),
            AconstNull | New(_) => (0, Some(Reference)),
            Iconst(_) => (0, Some(Int)),
            Lconst(_) => (0, Some(Long)),
            Fconst(_) => (0, Some(Float)),
            Dconst(_) => (0, Some(Double)),
            Ldc(value) => {
                let ty = match value {
                    LdcValue::Int(_) => Int,
                    LdcValue::Long(_) => Long,
                    LdcValue::Float(_) => Float,
                    LdcValue::Double(_) => Double,
                    LdcValue::String(_) | LdcValue::Class(_) => Reference,
                };
                (0, Some(ty))
            }
            Iload(_) => (0, Some(Int)),
            Lload(_) => (0, Some(Long)),
            Fload(_) => (0, Some(Float)),
            Dload(_) => (0, Some(Double)),
            Aload(_) => (0, Some(Reference)),
            Istore(_) | Lstore(_) | Fstore(_) | Dstore(_) | Astore(_) | Pop => (1, None),

            Iaload | Baload | Caload | Saload => (2, Some(Int)),
            Laload => (2, Some(Long)),
            Faload => (2, Some(Float)),
            Daload => (2, Some(Double)),
            Aaload => (2, Some(Reference)),
            Iastore | Lastore | Fastore | Dastore | Aastore | Bastore | Castore | Sastore => {
                (3, None)
            }

            Iadd | Isub | Imul | Idiv | Irem | Ishl | Ishr | Iushr | Iand | Ior | Ixor => {
                (2, Some(Int))
            }
            Ladd | Lsub | Lmul | Ldiv | Lrem | Lshl | Lshr | Lushr | Land | Lor | Lxor => {
                (2, Some(Long))
            }
            Fadd | Fsub | Fmul | Fdiv | Frem => (2, Some(Float)),
            Dadd | Dsub | Dmul | Ddiv | Drem => (2, Some(Double)),
            Ineg | I2b | I2c | I2s | L2i | F2i | D2i | Arraylength | Instanceof(_) => {
                (1, Some(Int))
            }
            Lneg | I2l | F2l | D2l => (1, Some(Long)),
            Fneg | I2f | L2f | D2f => (1, Some(Float)),
            Dneg | I2d | L2d | F2d => (1, Some(Double)),
            Lcmp | Fcmpl | Fcmpg | Dcmpl | Dcmpg => (2, Some(Int)),

            Ifeq(_) | Ifne(_) | Iflt(_) | Ifge(_) | Ifgt(_) | Ifle(_) | Ifnull(_)
            | Ifnonnull(_) => (1, None),
            IfIcmpeq(_) | IfIcmpne(_) | IfIcmplt(_) | IfIcmpge(_) | IfIcmpgt(_)
            | IfIcmple(_) | IfAcmpeq(_) | IfAcmpne(_) => (2, None),
            Tableswitch { .. } | Lookupswitch { .. } => (1, None),
            Ireturn | Lreturn | Freturn | Dreturn | Areturn | Athrow | Monitorenter
            | Monitorexit => (1, None),

            Getstatic(f) => (0, Some(self.resolver.resolve_field(f)?.kind.jvm_type())),
            Putstatic(_) => (1, None),
            Getfield(f) => (1, Some(self.resolver.resolve_field(f)?.kind.jvm_type())),
            Putfield(_) => (2, None),
            Invokevirtual(m) | Invokespecial(m) | Invokestatic(m) | Invokeinterface(m) => {
                let method = self.resolver.resolve_method(m)?;
                (method.arg_types().len(), method.return_type())
            }
            Newarray(_) | Anewarray(_) => (1, Some(Reference)),
            Multianewarray { dims, .. } => (*dims as usize, Some(Reference)),
        };
        let remaining = stack.len().checked_sub(pops).ok_or_else(|| underflow(address))?;
        stack.truncate(remaining);
        stack.extend(push);
        Ok(())
    }

    /// Find the basic blocks of `body` and their entry stacks.
    pub fn analyze(&self, body: &MethodBody, chain: &[String]) -> Result<BlockMap> {
        let code = &body.code;
        let len = code.len() as u32;
        let mut leaders = BTreeSet::from([0]);
        for handler in &body.handlers {
            leaders.insert(handler.handler);
        }
        for (address, op) in (0..).zip(code) {
            for target in op.branch_targets() {
                if target >= len {
                    return Err(CompileError::internal(format!(
                        "branch at {} to {} is outside the code",
                        address, target
                    )));
                }
                leaders.insert(target);
            }
            if op.ends_block() || self.inline_target(op, chain)?.is_some() {
                leaders.insert(address + 1);
            }
        }
        leaders.retain(|a| *a < len);

        let mut entries: BTreeMap<u32, Vec<JvmType>> = BTreeMap::new();
        let mut work = vec![(0, Vec::new())];
        for handler in &body.handlers {
            work.push((handler.handler, vec![JvmType::Reference]));
        }
        while let Some((start, mut stack)) = work.pop() {
            if let Some(known) = entries.get(&start) {
                if *known != stack {
                    return Err(CompileError::internal(format!(
                        "block {} is entered with different stacks",
                        start
                    )));
                }
                continue;
            }
            entries.insert(start, stack.clone());
            let mut address = start;
            loop {
                let op = code.get(address as usize).ok_or_else(|| {
                    CompileError::internal(format!("control falls off the end at {}", address))
                })?;
                self.effect(op, &mut stack, address)?;
                match op {
                    Opcode::Jsr(target) => {
                        let mut with_return = stack.clone();
                        with_return.push(JvmType::Reference);
                        work.push((*target, with_return));
                    }
                    _ => {
                        for target in op.branch_targets() {
                            work.push((target, stack.clone()));
                        }
                    }
                }
                if !op.falls_through() {
                    break;
                }
                address += 1;
                if leaders.contains(&address) || address >= len {
                    work.push((address, stack));
                    break;
                }
            }
        }
        Ok(BlockMap {
            leaders,
            entries,
            len,
        })
    }

    // ==================== Compilation ====================

    /// Compile one method into `os`.
    pub fn compile(&self, os: &mut dyn CodeStream, body: &MethodBody) -> Result<CompiledMethod> {
        let mut c = MethodCompiler::new(os, self.resolver, self.env);
        c.start_method(body)?;
        let chain = vec![body.to_string()];
        let top = body.max_locals.max(body.arg_slots()?);
        self.compile_body(&mut c, body, &chain, &[], top, 0)?;
        let compiled = c.end_method()?;
        info!(
            method = %body,
            insns = compiled.code_end - compiled.code_start,
            "compiled"
        );
        Ok(compiled)
    }

    /// Compile into a fresh listing and check it.
    pub fn compile_listing(&self, body: &MethodBody) -> Result<(Listing, CompiledMethod)> {
        let mut listing = Listing::new();
        let compiled = self.compile(&mut listing, body)?;
        listing.check()?;
        Ok((listing, compiled))
    }

    /// `prefix` is the caller's operand stack below an inlined callee's
    /// arguments; `top` is the first local free for nested callees and
    /// `base` the offset applied to this body's local indices.
    fn compile_body(
        &self,
        c: &mut MethodCompiler<'_>,
        body: &MethodBody,
        chain: &[String],
        prefix: &[JvmType],
        top: u16,
        base: u16,
    ) -> Result<()> {
        let blocks = self.analyze(body, chain)?;
        for (start, end, entry) in blocks.blocks() {
            let mut stack = entry.to_vec();
            let types: Vec<JvmType> = prefix.iter().chain(entry).copied().collect();
            c.start_basic_block(start, &types)?;
            for address in start..end {
                let op = body.code[address as usize].relocate_locals(base);
                c.start_instruction(address);
                if self.config.yieldpoints && op.branch_targets().iter().any(|t| *t <= address) {
                    c.visit_yieldpoint()?;
                }
                match self.inline_target(&op, chain)? {
                    Some(callee) => {
                        let args = callee.arg_types()?.len();
                        let mut below: Vec<JvmType> = prefix.iter().chain(&stack).copied().collect();
                        let depth = below.len().checked_sub(args).ok_or_else(|| underflow(address))?;
                        below.truncate(depth);
                        self.inline_call(c, &callee, chain, &below, top)?;
                    }
                    None => c.visit(&op)?,
                }
                c.end_instruction()?;
                self.effect(&op, &mut stack, address)?;
            }
            c.end_basic_block()?;
        }
        Ok(())
    }

    fn inline_call(
        &self,
        c: &mut MethodCompiler<'_>,
        callee: &MethodBody,
        chain: &[String],
        below: &[JvmType],
        base: u16,
    ) -> Result<()> {
        debug!(callee = %callee, base, "inline");
        c.start_inlined_method(callee, base)?;
        let types = callee.arg_types()?;
        let mut slots = Vec::with_capacity(types.len());
        let mut slot = base;
        for ty in &types {
            slots.push(slot);
            slot += ty.category() as u16;
        }
        for (ty, slot) in types.iter().zip(slots).rev() {
            c.visit(&Opcode::store_for(*ty, slot))?;
        }
        c.end_basic_block()?;

        let mut inner = chain.to_vec();
        inner.push(callee.to_string());
        let top = base + callee.max_locals.max(callee.arg_slots()?);
        self.compile_body(c, callee, &inner, below, top, base)?;
        c.end_inlined_method()
    }

    /// Compile every method with bytecode in the pool.
    pub fn compile_pool(&self, pool: &ClassPool) -> Result<Vec<CompiledCode>> {
        pool.method_bodies()
            .into_iter()
            .map(|m| -> Result<CompiledCode> {
                let (listing, compiled) = self.compile_listing(&m.body)?;
                Ok(CompiledCode {
                    class: m.class.clone(),
                    key: m.key(),
                    listing,
                    compiled,
                })
            })
            .collect()
    }
}

/// Encode a listing into machine code.
pub fn assemble(listing: &Listing) -> Result<Vec<u8>> {
    let mut asm = Assembler::new();
    listing.replay(&mut asm);
    Ok(asm.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ClassDef;

    #[derive(serde::Deserialize)]
    struct Classes {
        class: Vec<ClassDef>,
    }

    fn pool(src: &str) -> ClassPool {
        ClassPool::new(toml::from_str::<Classes>(src).unwrap().class).unwrap()
    }

    fn method(pool: &ClassPool, class: &str, key: &str) -> Arc<MethodBody> {
        Arc::clone(&pool.find_method(class, key).unwrap().body)
    }

    const LOOP: &str = r#"
        [[class]]
        name = "demo/Loop"
        initialized = true
        [[class.method]]
        name = "sum"
        descriptor = "(I)I"
        static = true
        max_locals = 2
        code = [
            { iconst = 0 },
            { istore = 1 },
            { goto = 7 },
            { iload = 1 },
            { iload = 0 },
            "iadd",
            { istore = 1 },
            { iinc = { index = 0, delta = -1 } },
            { iload = 0 },
            { ifgt = 3 },
            { iload = 1 },
            "ireturn",
        ]
        [[class.method]]
        name = "pick"
        descriptor = "(I)I"
        static = true
        max_locals = 1
        code = [
            { iconst = 10 },
            { iload = 0 },
            { ifeq = 4 },
            { iconst = 20 },
            { iconst = 1 },
            "iadd",
            "ireturn",
        ]
    "#;

    #[test]
    fn test_leaders_and_entry_stacks() {
        let pool = pool(LOOP);
        let config = CompilerConfig::default();
        let driver = Driver::new(&pool, RuntimeEnv::default(), &config);
        let sum = method(&pool, "demo/Loop", "sum(I)I");
        let blocks = driver.analyze(&sum, &[]).unwrap();
        assert_eq!(blocks.leaders().collect::<Vec<_>>(), [0, 3, 7, 10]);
        assert!(blocks.entry(3).unwrap().is_empty());

        // Block 4 of `pick` is reached with one int on the stack by the branch
        // and with two by the fall-through.
        let pick = method(&pool, "demo/Loop", "pick(I)I");
        assert!(driver.analyze(&pick, &[]).unwrap_err().is_internal());
    }

    #[test]
    fn test_yieldpoint_before_backward_branch() {
        let pool = pool(LOOP);
        let config = CompilerConfig {
            yieldpoints: true,
            ..CompilerConfig::default()
        };
        let driver = Driver::new(&pool, RuntimeEnv::default(), &config);
        let sum = method(&pool, "demo/Loop", "sum(I)I");
        let (listing, compiled) = driver.compile_listing(&sum).unwrap();
        let text = listing.to_string();
        assert_eq!(text.matches("cmp dword [0x7000], 0").count(), 1);
        assert_eq!(compiled.address_map.len(), sum.code.len());
        assert!(assemble(&listing).is_ok());
    }

    #[test]
    fn test_jsr_target_gets_return_address() {
        let pool = pool(
            r#"
            [[class]]
            name = "demo/Sub"
            [[class.method]]
            name = "run"
            descriptor = "()V"
            static = true
            max_locals = 1
            code = [{ jsr = 2 }, "return", { astore = 0 }, { ret = 0 }]
            "#,
        );
        let config = CompilerConfig::default();
        let driver = Driver::new(&pool, RuntimeEnv::default(), &config);
        let run = method(&pool, "demo/Sub", "run()V");
        let blocks = driver.analyze(&run, &[]).unwrap();
        assert_eq!(blocks.entry(2), Some(&[JvmType::Reference][..]));
        assert_eq!(blocks.entry(1), Some(&[][..]));
        let (listing, _) = driver.compile_listing(&run).unwrap();
        assert!(listing.to_string().contains("jmp dword [ebp-4]"));
    }

    #[test]
    fn test_unreachable_block_is_skipped() {
        let pool = pool(
            r#"
            [[class]]
            name = "demo/Dead"
            [[class.method]]
            name = "run"
            descriptor = "()I"
            static = true
            code = [{ iconst = 1 }, "ireturn", { iconst = 2 }, "ireturn"]
            "#,
        );
        let config = CompilerConfig::default();
        let driver = Driver::new(&pool, RuntimeEnv::default(), &config);
        let run = method(&pool, "demo/Dead", "run()I");
        let blocks = driver.analyze(&run, &[]).unwrap();
        assert_eq!(blocks.blocks().count(), 1);
        let (listing, _) = driver.compile_listing(&run).unwrap();
        assert!(!listing.to_string().contains("mov eax, 2"));
    }

    #[test]
    fn test_inlined_callee_has_no_call() {
        let pool = pool(
            r#"
            [[class]]
            name = "demo/Math"
            initialized = true
            [[class.method]]
            name = "twice"
            descriptor = "(I)I"
            static = true
            max_locals = 1
            code = [{ iload = 0 }, { iload = 0 }, "iadd", "ireturn"]
            [[class.method]]
            name = "main"
            descriptor = "(I)I"
            static = true
            max_locals = 1
            code = [{ iload = 0 }, { invokestatic = "demo/Math.twice(I)I" }, "ireturn"]
            "#,
        );
        let config = CompilerConfig {
            inline: true,
            ..CompilerConfig::default()
        };
        let driver = Driver::new(&pool, RuntimeEnv::default(), &config);
        let main = method(&pool, "demo/Math", "main(I)I");
        let (listing, compiled) = driver.compile_listing(&main).unwrap();
        assert!(!listing.to_string().contains("call"));
        // The callee's argument lives in a local above the caller's.
        assert_eq!(compiled.max_locals, 2);
        let calls: Vec<u32> = compiled.address_map.iter().map(|e| e.bytecode).collect();
        assert_eq!(calls, [0, 1, 2]);
    }
}
