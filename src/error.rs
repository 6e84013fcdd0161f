//! Compilation errors

use crate::bytecode::{DescriptorError, JvmType};
use crate::meta::ResolveError;
use crate::x86::EncodeError;
use thiserror::Error;

/// Errors that abort the compilation of one method.
///
/// Only `Resolve` is caused by the input program. Everything else reports a
/// broken invariant inside the code generator or an operation it does not
/// implement.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("internal compiler error: {0}")]
    Internal(String),
    #[error("virtual stack underflow at bytecode {address}")]
    StackUnderflow { address: u32 },
    #[error("type mismatch at bytecode {address}: expected {expected}, found {found}")]
    TypeMismatch {
        address: u32,
        expected: JvmType,
        found: JvmType,
    },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

impl CompileError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    /// Whether this error is a code-generation bug rather than bad input.
    pub fn is_internal(&self) -> bool {
        !matches!(self, CompileError::Resolve(_))
    }
}

impl From<DescriptorError> for CompileError {
    fn from(err: DescriptorError) -> Self {
        CompileError::Resolve(ResolveError::Descriptor(err))
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
