//! Register pool.
//!
//! Registers are claimed on demand and given back as soon as the Item that
//! holds them is consumed. A register is either free, held by exactly one
//! Item (named by its [`ItemId`]), or reserved by a handler that needs a
//! fixed register (shift count, divide operands, x87 status word).

use crate::x86::Reg;
use std::fmt;

/// Ownership token of an Item that holds registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// ESP and EBP
    Unavailable,
    Free,
    Held(ItemId),
    Reserved,
}

/// Allocation order for general requests.
const PREFERENCE: [Reg; 6] = [Reg::Ebx, Reg::Esi, Reg::Edi, Reg::Ecx, Reg::Edx, Reg::Eax];

/// Allocation order for registers with a byte form.
const BYTE_PREFERENCE: [Reg; 4] = [Reg::Ebx, Reg::Ecx, Reg::Edx, Reg::Eax];

#[derive(Debug, Clone)]
pub struct RegisterPool {
    state: [RegState; 8],
    next_id: u32,
}

impl RegisterPool {
    pub fn new() -> Self {
        let mut state = [RegState::Free; 8];
        state[Reg::Esp as usize] = RegState::Unavailable;
        state[Reg::Ebp as usize] = RegState::Unavailable;
        Self { state, next_id: 0 }
    }

    pub fn fresh_id(&mut self) -> ItemId {
        self.next_id += 1;
        ItemId(self.next_id)
    }

    pub fn state(&self, reg: Reg) -> RegState {
        self.state[reg as usize]
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        self.state(reg) == RegState::Free
    }

    pub fn holder(&self, reg: Reg) -> Option<ItemId> {
        match self.state(reg) {
            RegState::Held(id) => Some(id),
            _ => None,
        }
    }

    /// Registers currently held by `owner`.
    pub fn held_by(&self, owner: ItemId) -> Vec<Reg> {
        Reg::ALL
            .into_iter()
            .filter(|r| self.holder(*r) == Some(owner))
            .collect()
    }

    pub fn free_count(&self) -> usize {
        PREFERENCE.iter().filter(|r| self.is_free(**r)).count()
    }

    /// Whether no register is held or reserved.
    pub fn all_free(&self) -> bool {
        self.free_count() == PREFERENCE.len()
    }

    pub fn request(&mut self, owner: ItemId) -> Option<Reg> {
        self.take_first(&PREFERENCE, owner)
    }

    pub fn request_byte(&mut self, owner: ItemId) -> Option<Reg> {
        self.take_first(&BYTE_PREFERENCE, owner)
    }

    fn take_first(&mut self, order: &[Reg], owner: ItemId) -> Option<Reg> {
        let reg = order.iter().copied().find(|r| self.is_free(*r))?;
        self.state[reg as usize] = RegState::Held(owner);
        Some(reg)
    }

    /// Mark a free register reserved. Returns false if it is not free.
    pub fn reserve(&mut self, reg: Reg) -> bool {
        if self.is_free(reg) {
            self.state[reg as usize] = RegState::Reserved;
            true
        } else {
            false
        }
    }

    /// Hand a free or reserved register (or one held by someone else) to `owner`.
    pub fn transfer(&mut self, reg: Reg, owner: ItemId) -> bool {
        match self.state(reg) {
            RegState::Unavailable => false,
            _ => {
                self.state[reg as usize] = RegState::Held(owner);
                true
            }
        }
    }

    pub fn release(&mut self, reg: Reg) {
        if self.state(reg) != RegState::Unavailable {
            self.state[reg as usize] = RegState::Free;
        }
    }
}

impl Default for RegisterPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_order() {
        let mut pool = RegisterPool::new();
        let id = pool.fresh_id();
        let got: Vec<Reg> = std::iter::from_fn(|| pool.request(id)).collect();
        assert_eq!(got, PREFERENCE.to_vec());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.state(Reg::Esp), RegState::Unavailable);
    }

    #[test]
    fn test_byte_requests_skip_esi_edi() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh_id();
        assert_eq!(pool.request(a), Some(Reg::Ebx));
        assert_eq!(pool.request_byte(a), Some(Reg::Ecx));
        assert_eq!(pool.request_byte(a), Some(Reg::Edx));
        assert_eq!(pool.request_byte(a), Some(Reg::Eax));
        assert_eq!(pool.request_byte(a), None);
        assert_eq!(pool.request(a), Some(Reg::Esi));
    }

    #[test]
    fn test_single_owner_until_release() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh_id();
        let b = pool.fresh_id();
        let r = pool.request(a).unwrap();
        assert_eq!(pool.holder(r), Some(a));
        assert!(!pool.is_free(r));
        assert!(!pool.reserve(r));
        pool.release(r);
        assert!(pool.is_free(r));
        assert!(pool.reserve(r));
        assert!(pool.transfer(r, b));
        assert_eq!(pool.held_by(b), vec![r]);
        pool.release(r);
        assert!(pool.all_free());
    }
}
