use anyhow::{Context, Result, bail};

use super::bytecode::{CmpOp, FunctionInfo, Instr};
use super::Program;

/// Forward reference to a code address, patched by `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembles a `Program` one instruction at a time.
///
/// ```ignore
/// let mut b = ProgramBuilder::new();
/// let main = b.function("main", 0, 2);
/// b.emit(Instr::PushNumber(42.0)).emit(Instr::Return);
/// let program = b.finish(main)?;
/// ```
#[derive(Debug)]
pub struct ProgramBuilder {
    functions: Vec<FunctionInfo>,
    code: Vec<Instr>,
    strings: Vec<String>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            code: vec![Instr::Begin],
            strings: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Reserve a function number so that bodies can refer to it before it is defined.
    pub fn declare(&mut self, name: &str, arity: u32) -> u32 {
        self.functions.push(FunctionInfo::new(name, arity, arity, u32::MAX));
        (self.functions.len() - 1) as u32
    }

    /// Start the body of a declared function at the current position.
    pub fn define(&mut self, fno: u32, stack_depth: u32) -> &mut Self {
        let here = self.here();
        let f = &mut self.functions[fno as usize];
        f.address = here;
        f.stack_depth = stack_depth.max(f.arity);
        self.code.push(Instr::GlobStart(fno));
        self
    }

    pub fn function(&mut self, name: &str, arity: u32, stack_depth: u32) -> u32 {
        let fno = self.declare(name, arity);
        self.define(fno, stack_depth);
        fno
    }

    pub fn strict(&mut self, fno: u32, flags: &[bool]) -> &mut Self {
        self.functions[fno as usize].strict = flags.to_vec();
        self
    }

    /// Mark the current position as the entry that skips argument evaluation.
    pub fn entry_ne(&mut self, fno: u32) -> &mut Self {
        let here = self.here();
        self.functions[fno as usize].address_ne = Some(here);
        self
    }

    pub fn missing_entry(&mut self, fno: u32) -> &mut Self {
        let here = self.here();
        self.functions[fno as usize].missing_entries.push(here);
        self
    }

    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.code.push(instr);
        self
    }

    pub fn string(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.strings.iter().position(|x| x == s) {
            return idx as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.here());
        self
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.fixup(Instr::Jump(u32::MAX), label)
    }

    pub fn jfalse(&mut self, label: Label) -> &mut Self {
        self.fixup(Instr::Jfalse(u32::MAX), label)
    }

    pub fn jcmp(&mut self, op: CmpOp, label: Label) -> &mut Self {
        self.fixup(Instr::JCmp(op, u32::MAX), label)
    }

    fn fixup(&mut self, instr: Instr, label: Label) -> &mut Self {
        self.fixups.push((self.code.len(), label));
        self.code.push(instr);
        self
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn finish(mut self, main: u32) -> Result<Program> {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].with_context(|| format!("label {} never bound", label.0))?;
            self.code[at] = match self.code[at] {
                Instr::Jump(_) => Instr::Jump(target),
                Instr::Jfalse(_) => Instr::Jfalse(target),
                Instr::JCmp(op, _) => Instr::JCmp(op, target),
                other => bail!("instruction {:?} at {} is not a jump", other, at),
            };
        }
        if let Some(f) = self.functions.iter().find(|f| f.address == u32::MAX) {
            bail!("function {} declared but never defined", f.name);
        }
        self.code.push(Instr::End);
        Ok(Program {
            functions: self.functions,
            code: self.code,
            strings: self.strings,
            main,
        })
    }
}
