//! bcx86 - a single-pass bytecode to IA-32 compiler
//!
//! The compiler consumes stack-machine bytecode one opcode at a time and
//! emits IA-32 code through a virtual operand stack, so most values never
//! touch the native stack. A reference machine runs the emitted listings.

pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod error;
pub mod meta;
pub mod program;
pub mod sim;
pub mod x86;

// Re-export commonly used types
pub use config::{CompilerConfig, OutputFormat};
pub use driver::Driver;
pub use error::CompileError;
pub use program::{Build, Program, ProgramError};
