//! Reference machine: runs compiled listings against an in-memory runtime.
//!
//! [`Machine`] executes the IA-32 subset the compiler emits; [`Runtime`]
//! lays out the statics table, type objects, TIBs and heap the compiled
//! code expects and services the runtime helpers.

mod machine;
mod runtime;

pub use machine::{Exit, Flags, Machine, Memory};
pub use runtime::{ArrayKind, Runtime};

use crate::bytecode::JvmType;
use std::fmt;
use thiserror::Error;

/// A fault raised while running compiled code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("array index out of bounds")]
    ArrayBounds,
    #[error("null pointer dereference")]
    NullPointer,
    #[error("division by zero")]
    DivideByZero,
    #[error("negative array size {0}")]
    NegativeArraySize(i32),
    #[error("uncaught exception of class {0}")]
    Thrown(String),
    #[error("{0} cannot be cast to {1}")]
    ClassCast(String, String),
    #[error("cannot store {0} into an array of {1}")]
    ArrayStore(String, String),
    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),
    #[error("jump to non-code address {0:#x}")]
    BadJump(u32),
    #[error("access to unmapped address {0:#x}")]
    BadAddress(u32),
    #[error("illegal instruction: {0}")]
    IllegalInstruction(String),
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("cannot invoke {0}")]
    BadEntry(String),
}

/// A typed argument or result of a managed call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(u32),
}

impl Value {
    pub fn ty(&self) -> JvmType {
        match self {
            Value::Int(_) => JvmType::Int,
            Value::Long(_) => JvmType::Long,
            Value::Float(_) => JvmType::Float,
            Value::Double(_) => JvmType::Double,
            Value::Reference(_) => JvmType::Reference,
        }
    }

    /// Native words in push order: high word first for category 2.
    pub fn words(&self) -> Vec<u32> {
        let wide = |bits: u64| vec![(bits >> 32) as u32, bits as u32];
        match *self {
            Value::Int(v) => vec![v as u32],
            Value::Float(v) => vec![v.to_bits()],
            Value::Reference(v) => vec![v],
            Value::Long(v) => wide(v as u64),
            Value::Double(v) => wide(v.to_bits()),
        }
    }

    /// Rebuild a value of type `ty` from EAX and EDX.
    pub fn from_result(ty: JvmType, eax: u32, edx: u32) -> Value {
        let wide = (edx as u64) << 32 | eax as u64;
        match ty {
            JvmType::Int => Value::Int(eax as i32),
            JvmType::Float => Value::Float(f32::from_bits(eax)),
            JvmType::Reference => Value::Reference(eax),
            JvmType::Long => Value::Long(wide as i64),
            JvmType::Double => Value::Double(f64::from_bits(wide)),
        }
    }

    /// Parse a command-line argument as a value of type `ty`.
    pub fn parse(ty: JvmType, s: &str) -> Option<Value> {
        Some(match ty {
            JvmType::Int => Value::Int(s.parse().ok()?),
            JvmType::Long => Value::Long(s.parse().ok()?),
            JvmType::Float => Value::Float(s.parse().ok()?),
            JvmType::Double => Value::Double(s.parse().ok()?),
            JvmType::Reference if s == "null" => Value::Reference(0),
            JvmType::Reference => {
                let hex = s.strip_prefix("0x")?;
                Value::Reference(u32::from_str_radix(hex, 16).ok()?)
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Double(v) => write!(f, "{:?}", v),
            Value::Reference(0) => f.write_str("null"),
            Value::Reference(v) => write!(f, "{:#x}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_values_push_high_word_first() {
        assert_eq!(Value::Long(0x1_0000_0002).words(), [1, 2]);
        let back = Value::from_result(JvmType::Long, 2, 1);
        assert_eq!(back, Value::Long(0x1_0000_0002));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(Value::parse(JvmType::Int, "-3"), Some(Value::Int(-3)));
        assert_eq!(Value::parse(JvmType::Reference, "null"), Some(Value::Reference(0)));
        assert_eq!(Value::parse(JvmType::Long, "x"), None);
        assert_eq!(Value::Double(1.0).to_string(), "1.0");
    }
}
