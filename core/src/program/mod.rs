//! Compiled program representation: function table, bytecode and string constants.
//!
//! Programs arrive as JSON (`Program::from_json`) or are assembled in-process with
//! `ProgramBuilder`. Every task loads its own copy through `LoadedProgram::load`.

mod builder;
mod builtin;
mod bytecode;
mod loader;

pub use builder::{Label, ProgramBuilder};
pub use builtin::Builtin;
pub use bytecode::{CmpOp, FunctionInfo, Instr};
pub use loader::LoadedProgram;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<FunctionInfo>,
    pub code: Vec<Instr>,
    #[serde(default)]
    pub strings: Vec<String>,
    pub main: u32,
}

impl Program {
    pub fn from_json(src: &str) -> Result<Self> {
        serde_json::from_str(src).context("parse program")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path).with_context(|| format!("read program {}", path.display()))?;
        Self::from_json(&src).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize program")
    }

    pub fn load(self) -> Result<LoadedProgram> {
        LoadedProgram::load(self)
    }
}

#[cfg(test)]
mod program_test;
