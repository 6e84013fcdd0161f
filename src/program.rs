//! Program files: a `[compiler]` table and the classes to compile.

use crate::config::CompilerConfig;
use crate::driver::{CompiledCode, Driver};
use crate::error::CompileError;
use crate::meta::{ClassDef, ClassPool, ResolveError, RuntimeEnv};
use crate::sim::{Fault, Runtime, Value};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse program: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("{method}: {source}")]
    Compile {
        method: String,
        source: CompileError,
    },
    #[error("no method {0}")]
    NoMethod(String),
    #[error("bad argument {value:?} for {method}: expected {expected} arguments")]
    BadArgument {
        method: String,
        value: String,
        expected: usize,
    },
    #[error(transparent)]
    Fault(#[from] Fault),
}

/// A parsed program file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub runtime: RuntimeEnv,
    #[serde(default)]
    pub class: Vec<ClassDef>,
}

impl Program {
    pub fn parse(src: &str) -> Result<Self, ProgramError> {
        Ok(toml::from_str(src)?)
    }

    pub fn load(path: &Path) -> Result<Self, ProgramError> {
        let src = fs::read_to_string(path).map_err(|source| ProgramError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&src)
    }

    /// Link the classes into a pool.
    pub fn link(&self) -> Result<ClassPool, ProgramError> {
        Ok(ClassPool::new(self.class.clone())?)
    }
}

/// A linked program with every method compiled.
pub struct Build {
    pub pool: ClassPool,
    pub code: Vec<CompiledCode>,
    pub config: CompilerConfig,
    pub env: RuntimeEnv,
}

impl Build {
    pub fn new(program: &Program) -> Result<Self, ProgramError> {
        let pool = program.link()?;
        let code = {
            let driver = Driver::new(&pool, program.runtime, &program.compiler);
            let mut code = Vec::new();
            for m in pool.method_bodies() {
                let (listing, compiled) =
                    driver
                        .compile_listing(&m.body)
                        .map_err(|source| ProgramError::Compile {
                            method: m.body.to_string(),
                            source,
                        })?;
                code.push(CompiledCode {
                    class: m.class.clone(),
                    key: m.key(),
                    listing,
                    compiled,
                });
            }
            code
        };
        info!(methods = code.len(), "program compiled");
        Ok(Self {
            pool,
            code,
            config: program.compiler.clone(),
            env: program.runtime,
        })
    }

    /// The compiled method named `Class.name(desc)`.
    pub fn method(&self, id: &str) -> Option<&CompiledCode> {
        self.code
            .iter()
            .find(|c| format!("{}.{}", c.class, c.key) == id)
    }

    /// Load the program into a fresh reference machine.
    pub fn runtime(&self) -> Result<Runtime, ProgramError> {
        Ok(Runtime::new(
            &self.pool,
            self.code.clone(),
            self.env,
            self.config.max_steps,
        )?)
    }

    /// Run `entry` with arguments given as text.
    pub fn run(&self, entry: &str, args: &[String]) -> Result<Option<Value>, ProgramError> {
        let mut rt = self.runtime()?;
        let types = rt
            .arg_types(entry)
            .ok_or_else(|| ProgramError::NoMethod(entry.to_string()))?
            .to_vec();
        if types.len() != args.len() {
            return Err(ProgramError::BadArgument {
                method: entry.to_string(),
                value: args.join(" "),
                expected: types.len(),
            });
        }
        let mut values = Vec::with_capacity(args.len());
        for (ty, arg) in types.iter().zip(args) {
            let value = Value::parse(*ty, arg).ok_or_else(|| ProgramError::BadArgument {
                method: entry.to_string(),
                value: arg.clone(),
                expected: types.len(),
            })?;
            values.push(value);
        }
        Ok(rt.invoke(entry, &values)?)
    }
}
