//! Compiler configuration types.

use serde::Deserialize;

/// How `compile` prints a method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Intel-syntax listing
    #[default]
    Listing,
    /// Encoded machine code bytes
    Hex,
    /// Bytecode address to native offset map, as JSON
    Map,
}

/// Configuration for the driver and the reference machine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Splice small static callees into their callers.
    pub inline: bool,
    /// Largest callee (in instructions) considered for inlining
    pub inline_max_code: usize,
    pub inline_max_depth: usize,
    /// Emit a yield point before every backward branch.
    pub yieldpoints: bool,
    /// Instruction budget of the reference machine
    pub max_steps: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            inline: false,
            inline_max_code: 32,
            inline_max_depth: 2,
            yieldpoints: false,
            max_steps: 10_000_000,
        }
    }
}
