//! Virtual stack and the emission context shared by all handlers.
//!
//! The virtual stack mirrors the bytecode operand stack for one basic block.
//! Items on it that live on the native stack always form a prefix: spilling
//! pushes everything from the first non-native Item up to the victim, and
//! handlers materialize popped operands top-first.

use super::item::{Item, Location};
use super::regpool::{ItemId, RegState, RegisterPool};
use crate::bytecode::JvmType;
use crate::error::{CompileError, Result};
use crate::x86::{CodeStream, Emit, Reg};
use tracing::debug;

#[derive(Debug, Default)]
pub struct VirtualStack {
    items: Vec<Item>,
}

impl VirtualStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item `depth` positions below the top (0 is the top).
    pub fn peek(&self, depth: usize) -> Option<&Item> {
        self.items.len().checked_sub(depth + 1).map(|i| &self.items[i])
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    fn position_of(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|i| i.id() == Some(id))
    }

    /// Whether native-stack Items form a prefix.
    pub fn stack_items_are_prefix(&self) -> bool {
        let first_other = self.items.iter().position(|i| !i.is_stack());
        match first_other {
            Some(i) => self.items[i..].iter().all(|i| !i.is_stack()),
            None => true,
        }
    }
}

/// Code stream, register pool and virtual stack of one method compilation.
pub struct Emitter<'a> {
    pub os: &'a mut dyn CodeStream,
    pub pool: RegisterPool,
    pub stack: VirtualStack,
    /// Bytecode address of the instruction being compiled
    pub address: u32,
}

impl<'a> Emitter<'a> {
    pub fn new(os: &'a mut dyn CodeStream) -> Self {
        Self {
            os,
            pool: RegisterPool::new(),
            stack: VirtualStack::new(),
            address: 0,
        }
    }

    // ==================== Allocation ====================

    /// Claim a register for `owner`, evicting stack Items if needed.
    pub fn alloc(&mut self, owner: ItemId) -> Result<Reg> {
        loop {
            if let Some(reg) = self.pool.request(owner) {
                return Ok(reg);
            }
            if !self.spill_lowest() {
                return Err(self.exhausted());
            }
        }
    }

    pub fn alloc_byte(&mut self, owner: ItemId) -> Result<Reg> {
        loop {
            if let Some(reg) = self.pool.request_byte(owner) {
                return Ok(reg);
            }
            if !self.spill_lowest() {
                return Err(self.exhausted());
            }
        }
    }

    pub fn alloc_pair(&mut self, owner: ItemId) -> Result<(Reg, Reg)> {
        let lo = self.alloc(owner)?;
        let hi = self.alloc(owner)?;
        Ok((lo, hi))
    }

    /// A register for handler scratch use, marked reserved.
    pub fn scratch(&mut self) -> Result<Reg> {
        let tmp = self.pool.fresh_id();
        let reg = self.alloc(tmp)?;
        self.pool.release(reg);
        self.pool.reserve(reg);
        Ok(reg)
    }

    fn exhausted(&self) -> CompileError {
        CompileError::internal(format!(
            "no register available at bytecode {}",
            self.address
        ))
    }

    /// Evict the least recently pushed register-resident Item (and every
    /// Item below it) to the native stack. Returns false if there is none.
    pub fn spill_lowest(&mut self) -> bool {
        let victim = self
            .stack
            .items
            .iter()
            .position(|i| matches!(i.location(), Location::Reg(_) | Location::Pair(..)));
        match victim {
            Some(index) => {
                debug!(address = self.address, index, "evict");
                self.spill_through(index);
                true
            }
            None => false,
        }
    }

    fn spill_through(&mut self, index: usize) {
        for item in &mut self.stack.items[..=index] {
            item.push(self.os, &mut self.pool);
        }
    }

    /// Free `reg` for a fixed-register operation and mark it reserved.
    /// A holder on the virtual stack moves to another free register, or is
    /// spilled when none is left.
    pub fn request_register(&mut self, reg: Reg) -> Result<()> {
        match self.pool.state(reg) {
            RegState::Free => {}
            RegState::Held(owner) => {
                let index = self.stack.position_of(owner).ok_or_else(|| {
                    CompileError::internal(format!("{} is held outside the virtual stack", reg))
                })?;
                match self.pool.request(owner) {
                    Some(new) => {
                        self.os.mov(new, reg);
                        self.stack.items[index].replace_reg(reg, new);
                        self.pool.release(reg);
                    }
                    None => self.spill_through(index),
                }
            }
            RegState::Reserved | RegState::Unavailable => {
                return Err(CompileError::internal(format!("{} cannot be requested", reg)));
            }
        }
        self.pool.reserve(reg);
        Ok(())
    }

    /// Reserve `reg` unless the top Item already holds exactly it, in which
    /// case the handler will pop that Item and use it in place.
    pub fn request_register_for_top(&mut self, reg: Reg) -> Result<()> {
        match self.stack.peek(0).map(|i| i.location()) {
            Some(Location::Reg(r)) if r == reg => Ok(()),
            _ => self.request_register(reg),
        }
    }

    pub fn release_register(&mut self, reg: Reg) {
        self.pool.release(reg);
    }

    // ==================== Stack operations ====================

    pub fn push(&mut self, item: Item) {
        self.stack.items.push(item);
    }

    pub fn pop_any(&mut self) -> Result<Item> {
        self.stack.items.pop().ok_or(CompileError::StackUnderflow {
            address: self.address,
        })
    }

    /// Pop an Item of the expected type.
    pub fn pop(&mut self, expected: JvmType) -> Result<Item> {
        let item = self.pop_any()?;
        if item.ty() != expected {
            return Err(CompileError::TypeMismatch {
                address: self.address,
                expected,
                found: item.ty(),
            });
        }
        Ok(item)
    }

    pub fn pop_int(&mut self) -> Result<Item> {
        self.pop(JvmType::Int)
    }

    pub fn pop_ref(&mut self) -> Result<Item> {
        self.pop(JvmType::Reference)
    }

    /// Pop Items totalling exactly `words` native words, returned bottom-first.
    pub fn pop_words(&mut self, words: usize) -> Result<Vec<Item>> {
        let mut taken = Vec::new();
        let mut got = 0;
        while got < words {
            let item = self.pop_any()?;
            got += item.ty().category() as usize;
            taken.push(item);
        }
        if got != words {
            return Err(CompileError::internal(format!(
                "category-2 value split by a {}-word stack operation at bytecode {}",
                words, self.address
            )));
        }
        taken.reverse();
        Ok(taken)
    }

    /// Push every Item to the native stack, bottom to top.
    pub fn flush(&mut self) {
        if !self.stack.is_empty() {
            let last = self.stack.len() - 1;
            self.spill_through(last);
        }
    }

    /// Drop all Items without emitting code, returning their registers.
    /// Used where control does not continue (returns, throws, jumps after a
    /// flush).
    pub fn discard_all(&mut self) {
        for mut item in self.stack.items.drain(..) {
            item.release(&mut self.pool);
        }
    }

    /// Materialize every Item reading the frame bytes `[disp, disp+size)`,
    /// before those bytes are overwritten.
    pub fn load_local(&mut self, disp: i32, size: i32) -> Result<()> {
        for index in 0..self.stack.len() {
            if !self.stack.items[index].aliases(disp, size) {
                continue;
            }
            let loaded = self.stack.items[index].try_load_in_place(self.os, &mut self.pool)?;
            if !loaded {
                self.spill_through(index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::item::Kind;
    use crate::x86::Listing;

    fn text(l: &Listing) -> Vec<String> {
        l.insns().iter().map(|i| i.to_string()).collect()
    }

    /// Push `n` ints held in registers.
    fn fill(em: &mut Emitter<'_>, n: usize) {
        for v in 0..n {
            let mut item = Item::int(v as i32);
            item.load(em).unwrap();
            em.push(item);
        }
    }

    #[test]
    fn test_pop_checks_balance_and_type() {
        let mut l = Listing::new();
        let mut em = Emitter::new(&mut l);
        em.address = 3;
        assert_eq!(em.pop_int(), Err(CompileError::StackUnderflow { address: 3 }));
        em.push(Item::long(1));
        assert!(matches!(
            em.pop_int(),
            Err(CompileError::TypeMismatch { expected: JvmType::Int, found: JvmType::Long, .. })
        ));
    }

    #[test]
    fn test_eviction_spills_lowest_prefix() {
        let mut l = Listing::new();
        let mut em = Emitter::new(&mut l);
        em.push(Item::local(JvmType::Int, -4));
        fill(&mut em, 6);
        assert_eq!(em.pool.free_count(), 0);

        let mut extra = Item::int(99);
        extra.load(&mut em).unwrap();
        // The local below the victim must be pushed first to keep the prefix.
        assert!(em.stack.items()[0].is_stack());
        assert!(em.stack.items()[1].is_stack());
        assert_eq!(em.stack.items()[2].kind(), Kind::Register);
        assert!(em.stack.stack_items_are_prefix());
        assert_eq!(extra.reg().unwrap(), Reg::Ebx);
        drop(em);
        let t = text(&l);
        assert_eq!(&t[6..8], ["push dword [ebp-4]", "push ebx"]);
    }

    #[test]
    fn test_request_register_moves_holder() {
        let mut l = Listing::new();
        let mut em = Emitter::new(&mut l);
        fill(&mut em, 6);
        let top = em.stack.peek(0).unwrap().reg().unwrap();
        assert_eq!(top, Reg::Eax);
        em.stack.items[0].release(&mut em.pool);
        em.stack.items[0].set_location(Location::Stack);
        em.request_register(Reg::Eax).unwrap();
        assert_eq!(em.pool.state(Reg::Eax), RegState::Reserved);
        assert_eq!(em.stack.peek(0).unwrap().reg().unwrap(), Reg::Ebx);
        assert!(em.request_register(Reg::Eax).is_err());
    }

    #[test]
    fn test_request_register_spills_when_full() {
        let mut l = Listing::new();
        let mut em = Emitter::new(&mut l);
        fill(&mut em, 6);
        em.request_register(Reg::Ecx).unwrap();
        // ECX was the fourth allocation: items 0..=3 are spilled.
        for i in 0..4 {
            assert!(em.stack.items()[i].is_stack());
        }
        assert_eq!(em.pool.state(Reg::Ecx), RegState::Reserved);
        assert_eq!(em.pool.free_count(), 3);
    }

    #[test]
    fn test_load_local_materializes_aliases() {
        let mut l = Listing::new();
        let mut em = Emitter::new(&mut l);
        em.push(Item::local(JvmType::Int, -4));
        em.push(Item::local(JvmType::Int, -8));
        em.load_local(-4, 4).unwrap();
        assert_eq!(em.stack.items()[0].kind(), Kind::Register);
        assert_eq!(em.stack.items()[1].kind(), Kind::Local);
    }

    #[test]
    fn test_flush_and_pool_balance() {
        let mut l = Listing::new();
        let mut em = Emitter::new(&mut l);
        fill(&mut em, 3);
        em.push(Item::long(7));
        em.flush();
        assert!(em.stack.items().iter().all(|i| i.is_stack()));
        assert!(em.pool.all_free());
        let words = em.pop_words(2).unwrap();
        assert_eq!(words.len(), 1);
        assert!(em.pop_words(2).is_ok());
        em.push(Item::long(1));
        assert!(em.pop_words(1).is_err());
    }
}
