//! Items: typed operand values and where they currently live.
//!
//! An Item is created when a value becomes available (constant push, local
//! load, arithmetic result) and consumed when a handler pops and releases
//! it. Code is only emitted when an Item has to change location.

use super::regpool::{ItemId, RegState, RegisterPool};
use super::vstack::Emitter;
use crate::bytecode::JvmType;
use crate::error::{CompileError, Result};
use crate::x86::{CodeStream, Emit, Mem, Operand, Reg};
use std::fmt;
use std::ops::BitOr;

/// Current storage of an Item's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Compile-time constant (float/double as raw bits)
    Constant(i64),
    /// Frame slot at `[ebp+disp]` (low word for category-2 values)
    Local(i32),
    Reg(Reg),
    /// (low word, high word)
    Pair(Reg, Reg),
    /// On the native stack
    Stack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Constant,
    Local,
    Register,
    Stack,
}

/// Set of acceptable kinds for [`Item::load_if`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSet(u8);

impl KindSet {
    pub const CONSTANT: KindSet = KindSet(1);
    pub const LOCAL: KindSet = KindSet(2);
    pub const REGISTER: KindSet = KindSet(4);
    pub const STACK: KindSet = KindSet(8);

    pub fn contains(self, kind: Kind) -> bool {
        let bit = match kind {
            Kind::Constant => Self::CONSTANT,
            Kind::Local => Self::LOCAL,
            Kind::Register => Self::REGISTER,
            Kind::Stack => Self::STACK,
        };
        self.0 & bit.0 != 0
    }
}

impl BitOr for KindSet {
    type Output = KindSet;

    fn bitor(self, rhs: KindSet) -> KindSet {
        KindSet(self.0 | rhs.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Item {
    ty: JvmType,
    loc: Location,
    id: Option<ItemId>,
}

fn frame(disp: i32) -> Mem {
    Mem::base(Reg::Ebp, disp)
}

impl Item {
    // ==================== Constructors ====================

    pub fn constant(ty: JvmType, bits: i64) -> Self {
        Item {
            ty,
            loc: Location::Constant(bits),
            id: None,
        }
    }

    pub fn int(value: i32) -> Self {
        Self::constant(JvmType::Int, value as i64)
    }

    pub fn long(value: i64) -> Self {
        Self::constant(JvmType::Long, value)
    }

    pub fn float(value: f32) -> Self {
        Self::constant(JvmType::Float, value.to_bits() as i64)
    }

    pub fn double(value: f64) -> Self {
        Self::constant(JvmType::Double, value.to_bits() as i64)
    }

    pub fn null() -> Self {
        Self::constant(JvmType::Reference, 0)
    }

    pub fn local(ty: JvmType, disp: i32) -> Self {
        Item {
            ty,
            loc: Location::Local(disp),
            id: None,
        }
    }

    pub fn stack(ty: JvmType) -> Self {
        Item {
            ty,
            loc: Location::Stack,
            id: None,
        }
    }

    /// A value the handler has just computed into `reg`.
    pub fn in_reg(ty: JvmType, reg: Reg, pool: &mut RegisterPool) -> Self {
        let id = pool.fresh_id();
        pool.transfer(reg, id);
        Item {
            ty,
            loc: Location::Reg(reg),
            id: Some(id),
        }
    }

    pub fn in_pair(ty: JvmType, lo: Reg, hi: Reg, pool: &mut RegisterPool) -> Self {
        let id = pool.fresh_id();
        pool.transfer(lo, id);
        pool.transfer(hi, id);
        Item {
            ty,
            loc: Location::Pair(lo, hi),
            id: Some(id),
        }
    }

    // ==================== Queries ====================

    pub fn ty(&self) -> JvmType {
        self.ty
    }

    pub fn location(&self) -> Location {
        self.loc
    }

    pub fn id(&self) -> Option<ItemId> {
        self.id
    }

    pub fn kind(&self) -> Kind {
        match self.loc {
            Location::Constant(_) => Kind::Constant,
            Location::Local(_) => Kind::Local,
            Location::Reg(_) | Location::Pair(..) => Kind::Register,
            Location::Stack => Kind::Stack,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.ty.is_wide()
    }

    pub fn is_stack(&self) -> bool {
        self.loc == Location::Stack
    }

    pub fn const_bits(&self) -> Option<i64> {
        match self.loc {
            Location::Constant(v) => Some(v),
            _ => None,
        }
    }

    /// Constant value as a 32-bit word (ints, references, float bits).
    pub fn const_i32(&self) -> Option<i32> {
        self.const_bits().map(|v| v as i32)
    }

    pub fn reg(&self) -> Result<Reg> {
        match self.loc {
            Location::Reg(r) => Ok(r),
            _ => Err(CompileError::internal(format!("{} is not in a register", self))),
        }
    }

    pub fn pair(&self) -> Result<(Reg, Reg)> {
        match self.loc {
            Location::Pair(lo, hi) => Ok((lo, hi)),
            _ => Err(CompileError::internal(format!("{} is not in a register pair", self))),
        }
    }

    pub fn uses_reg(&self, reg: Reg) -> bool {
        match self.loc {
            Location::Reg(r) => r == reg,
            Location::Pair(lo, hi) => lo == reg || hi == reg,
            _ => false,
        }
    }

    /// Whether this Item reads any of the frame bytes `[lo, lo+size)`.
    pub fn aliases(&self, lo: i32, size: i32) -> bool {
        match self.loc {
            Location::Local(d) => d < lo + size && lo < d + self.ty.size(),
            _ => false,
        }
    }

    /// Operand for a category-1 Item that is not on the native stack.
    pub fn operand(&self) -> Result<Operand> {
        match self.loc {
            Location::Constant(v) => Ok(Operand::Imm(v as i32)),
            Location::Local(d) => Ok(frame(d).into()),
            Location::Reg(r) => Ok(r.into()),
            _ => Err(CompileError::internal(format!("{} has no direct operand", self))),
        }
    }

    /// Low and high word operands of a category-2 Item.
    pub fn word_operands(&self) -> Result<(Operand, Operand)> {
        match self.loc {
            Location::Constant(v) => Ok((Operand::Imm(v as i32), Operand::Imm((v >> 32) as i32))),
            Location::Local(d) => Ok((frame(d).into(), frame(d + 4).into())),
            Location::Pair(lo, hi) => Ok((lo.into(), hi.into())),
            _ => Err(CompileError::internal(format!("{} has no word operands", self))),
        }
    }

    /// Word operands for a store: the high word only for category-2 values.
    pub fn store_operands(&self) -> Result<(Operand, Option<Operand>)> {
        if self.is_wide() {
            let (lo, hi) = self.word_operands()?;
            Ok((lo, Some(hi)))
        } else {
            Ok((self.operand()?, None))
        }
    }

    pub fn owner(&mut self, pool: &mut RegisterPool) -> ItemId {
        *self.id.get_or_insert_with(|| pool.fresh_id())
    }

    /// Change the semantic type in place (same words, e.g. after a conversion).
    pub fn retype(&mut self, ty: JvmType) {
        self.ty = ty;
    }

    pub fn set_location(&mut self, loc: Location) {
        self.loc = loc;
    }

    /// Rename one of this Item's registers after the value was moved.
    pub fn replace_reg(&mut self, old: Reg, new: Reg) {
        self.loc = match self.loc {
            Location::Reg(r) if r == old => Location::Reg(new),
            Location::Pair(lo, hi) if lo == old => Location::Pair(new, hi),
            Location::Pair(lo, hi) if hi == old => Location::Pair(lo, new),
            other => other,
        };
    }

    // ==================== Materialization ====================

    fn materialize(&self, os: &mut dyn CodeStream, reg: Reg) -> Result<()> {
        match self.loc {
            Location::Constant(v) => os.mov(reg, v as i32),
            Location::Local(d) => os.mov(reg, frame(d)),
            Location::Reg(r) if r != reg => os.mov(reg, r),
            Location::Reg(_) => {}
            Location::Stack => os.pop(reg),
            Location::Pair(..) => return Err(CompileError::internal("pair into one register")),
        }
        Ok(())
    }

    fn materialize_pair(&self, os: &mut dyn CodeStream, lo: Reg, hi: Reg) -> Result<()> {
        match self.loc {
            Location::Constant(v) => {
                os.mov(lo, v as i32);
                os.mov(hi, (v >> 32) as i32);
            }
            Location::Local(d) => {
                os.mov(lo, frame(d));
                os.mov(hi, frame(d + 4));
            }
            Location::Stack => {
                os.pop(lo);
                os.pop(hi);
            }
            Location::Pair(a, b) => {
                if (a, b) == (lo, hi) {
                } else if b != lo {
                    if a != lo {
                        os.mov(lo, a);
                    }
                    if b != hi {
                        os.mov(hi, b);
                    }
                } else if a != hi {
                    os.mov(hi, b);
                    os.mov(lo, a);
                } else {
                    // Swapped halves.
                    os.push(b);
                    os.push(a);
                    os.pop(lo);
                    os.pop(hi);
                }
            }
            Location::Reg(_) => return Err(CompileError::internal("one register into a pair")),
        }
        Ok(())
    }

    /// Load into registers without evicting anything. Returns false (and
    /// changes nothing) when not enough registers are free.
    pub fn try_load_in_place(&mut self, os: &mut dyn CodeStream, pool: &mut RegisterPool) -> Result<bool> {
        if self.kind() == Kind::Register {
            return Ok(true);
        }
        let needed = self.ty.category() as usize;
        if pool.free_count() < needed {
            return Ok(false);
        }
        let id = self.owner(pool);
        if self.is_wide() {
            let (Some(lo), Some(hi)) = (pool.request(id), pool.request(id)) else {
                return Ok(false);
            };
            self.materialize_pair(os, lo, hi)?;
            self.loc = Location::Pair(lo, hi);
        } else {
            let Some(reg) = pool.request(id) else {
                return Ok(false);
            };
            self.materialize(os, reg)?;
            self.loc = Location::Reg(reg);
        }
        Ok(true)
    }

    /// Force the value into a register (or a pair for category-2 values).
    pub fn load(&mut self, em: &mut Emitter<'_>) -> Result<()> {
        if self.kind() == Kind::Register {
            return Ok(());
        }
        let id = self.owner(&mut em.pool);
        if self.is_wide() {
            let (lo, hi) = em.alloc_pair(id)?;
            self.materialize_pair(em.os, lo, hi)?;
            self.loc = Location::Pair(lo, hi);
        } else {
            let reg = em.alloc(id)?;
            self.materialize(em.os, reg)?;
            self.loc = Location::Reg(reg);
        }
        Ok(())
    }

    /// Load a category-1 value and return its register.
    pub fn load_reg(&mut self, em: &mut Emitter<'_>) -> Result<Reg> {
        self.load(em)?;
        self.reg()
    }

    /// Load a category-2 value and return its (low, high) registers.
    pub fn load_pair(&mut self, em: &mut Emitter<'_>) -> Result<(Reg, Reg)> {
        self.load(em)?;
        self.pair()
    }

    /// Load only if the current kind is not in `allowed`.
    pub fn load_if(&mut self, em: &mut Emitter<'_>, allowed: KindSet) -> Result<()> {
        if allowed.contains(self.kind()) {
            Ok(())
        } else {
            self.load(em)
        }
    }

    fn claim(&mut self, pool: &mut RegisterPool, reg: Reg) -> Result<()> {
        let id = self.owner(pool);
        match pool.state(reg) {
            RegState::Held(other) if other != id => Err(CompileError::internal(format!(
                "{} is held by {} while loading {}",
                reg, other, self
            ))),
            RegState::Unavailable => Err(CompileError::internal(format!("{} is not allocatable", reg))),
            _ => {
                pool.transfer(reg, id);
                Ok(())
            }
        }
    }

    /// Force a category-1 value into `reg`, which must be free, reserved, or
    /// already held by this Item.
    pub fn load_to(&mut self, em: &mut Emitter<'_>, reg: Reg) -> Result<()> {
        if self.loc == Location::Reg(reg) {
            return Ok(());
        }
        self.claim(&mut em.pool, reg)?;
        self.materialize(em.os, reg)?;
        if let Location::Reg(old) = self.loc {
            em.pool.release(old);
        }
        self.loc = Location::Reg(reg);
        Ok(())
    }

    /// Force a category-2 value into the given (low, high) registers.
    pub fn load_to_pair(&mut self, em: &mut Emitter<'_>, lo: Reg, hi: Reg) -> Result<()> {
        if self.loc == Location::Pair(lo, hi) {
            return Ok(());
        }
        self.claim(&mut em.pool, lo)?;
        self.claim(&mut em.pool, hi)?;
        self.materialize_pair(em.os, lo, hi)?;
        if let Location::Pair(a, b) = self.loc {
            for r in [a, b] {
                if r != lo && r != hi {
                    em.pool.release(r);
                }
            }
        }
        self.loc = Location::Pair(lo, hi);
        Ok(())
    }

    /// Force a category-1 value into a register with a byte form.
    pub fn load_byte(&mut self, em: &mut Emitter<'_>) -> Result<Reg> {
        if let Location::Reg(r) = self.loc {
            if r.has_byte_form() {
                return Ok(r);
            }
        }
        let id = self.owner(&mut em.pool);
        let reg = em.alloc_byte(id)?;
        self.materialize(em.os, reg)?;
        if let Location::Reg(old) = self.loc {
            em.pool.release(old);
        }
        self.loc = Location::Reg(reg);
        Ok(reg)
    }

    /// Move the value onto the native stack. Never needs a register.
    pub fn push(&mut self, os: &mut dyn CodeStream, pool: &mut RegisterPool) {
        match (self.loc, self.is_wide()) {
            (Location::Stack, _) => return,
            (Location::Constant(v), false) => os.push(v as i32),
            (Location::Constant(v), true) => {
                os.push((v >> 32) as i32);
                os.push(v as i32);
            }
            (Location::Local(d), false) => os.push(frame(d)),
            (Location::Local(d), true) => {
                os.push(frame(d + 4));
                os.push(frame(d));
            }
            (Location::Reg(r), _) => os.push(r),
            (Location::Pair(lo, hi), _) => {
                os.push(hi);
                os.push(lo);
            }
        }
        self.release(pool);
        self.loc = Location::Stack;
    }

    /// Give back any registers this Item holds. A no-op for Items that never
    /// claimed one.
    pub fn release(&mut self, pool: &mut RegisterPool) {
        match self.loc {
            Location::Reg(r) => pool.release(r),
            Location::Pair(lo, hi) => {
                pool.release(lo);
                pool.release(hi);
            }
            _ => {}
        }
    }

    /// Consume the Item, dropping its native stack words if it has any.
    pub fn discard(mut self, em: &mut Emitter<'_>) {
        if self.is_stack() {
            em.os.lea(Reg::Esp, Mem::base(Reg::Esp, self.ty.size()));
        }
        self.release(&mut em.pool);
    }

    /// An independent copy of this Item. Register values are copied into
    /// fresh registers; native stack values cannot be copied.
    pub fn duplicate(&self, em: &mut Emitter<'_>) -> Result<Item> {
        let mut copy = Item {
            ty: self.ty,
            loc: self.loc,
            id: None,
        };
        match self.loc {
            Location::Constant(_) | Location::Local(_) => {}
            Location::Reg(r) => {
                let id = copy.owner(&mut em.pool);
                let reg = em.alloc(id)?;
                em.os.mov(reg, r);
                copy.loc = Location::Reg(reg);
            }
            Location::Pair(lo, hi) => {
                let id = copy.owner(&mut em.pool);
                let (nlo, nhi) = em.alloc_pair(id)?;
                em.os.mov(nlo, lo);
                em.os.mov(nhi, hi);
                copy.loc = Location::Pair(nlo, nhi);
            }
            Location::Stack => {
                return Err(CompileError::internal("cannot duplicate a native stack item"));
            }
        }
        Ok(copy)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.loc {
            Location::Constant(v) => write!(f, "{}:const({})", self.ty, v),
            Location::Local(d) => write!(f, "{}:local[ebp{:+}]", self.ty, d),
            Location::Reg(r) => write!(f, "{}:{}", self.ty, r),
            Location::Pair(lo, hi) => write!(f, "{}:{}:{}", self.ty, hi, lo),
            Location::Stack => write!(f, "{}:stack", self.ty),
        }
    }
}
