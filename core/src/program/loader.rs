use anyhow::{Result, bail, ensure};
use tracing::debug;

use super::builtin::Builtin;
use super::bytecode::{FunctionInfo, Instr};
use super::Program;
use crate::error::RtResult;
use crate::fatal;

/// A validated program plus the runtime's own helper functions.
///
/// Three families of helpers are appended after the user's code:
/// the eval stub (`Eval 0; Return`), the apply stub (`Eval 1; Do`), and one
/// wrapper per builtin that forces its strict arguments before `Bif`.
#[derive(Debug, Clone)]
pub struct LoadedProgram {
    pub functions: Vec<FunctionInfo>,
    pub code: Vec<Instr>,
    pub strings: Vec<String>,
    pub main: u32,
    pub eval_stub: u32,
    pub apply_stub: u32,
    wrappers: Vec<u32>,
    user_functions: u32,
}

impl LoadedProgram {
    pub fn load(program: Program) -> Result<Self> {
        let Program {
            mut functions,
            mut code,
            strings,
            main,
        } = program;

        ensure!(!functions.is_empty(), "program defines no functions");
        ensure!(
            matches!(code.first(), Some(Instr::Begin)) && matches!(code.last(), Some(Instr::End)),
            "code must be bracketed by Begin/End"
        );
        let nfuncs = functions.len() as u32;
        ensure!(main < nfuncs, "main function {} out of range", main);
        ensure!(functions[main as usize].arity == 0, "main function must take no arguments");

        let len = code.len() as u32;
        for (fno, f) in functions.iter().enumerate() {
            let at = |addr: u32| -> Result<()> {
                ensure!(addr < len, "{}: entry {} outside code", f.name, addr);
                Ok(())
            };
            at(f.address)?;
            if let Some(ne) = f.address_ne {
                at(ne)?;
            }
            for e in &f.missing_entries {
                at(*e)?;
            }
            ensure!(
                code[f.address as usize] == Instr::GlobStart(fno as u32),
                "{}: entry does not start with GlobStart({})",
                f.name,
                fno
            );
            ensure!(f.strict.len() as u32 <= f.arity, "{}: more strictness flags than arguments", f.name);
            ensure!(f.stack_depth >= f.arity, "{}: stack depth below arity", f.name);
        }

        for (pc, instr) in code.iter().enumerate() {
            let fno_ok = |fno: u32| fno < nfuncs;
            match *instr {
                Instr::Jfalse(t) | Instr::Jump(t) | Instr::JCmp(_, t) if t >= len => {
                    bail!("pc {}: jump target {} outside code", pc, t)
                }
                Instr::Call(fno) | Instr::PushFn(fno) | Instr::GlobStart(fno) if !fno_ok(fno) => {
                    bail!("pc {}: unknown function {}", pc, fno)
                }
                Instr::MkFrame { fno, n } => {
                    ensure!(fno_ok(fno), "pc {}: unknown function {}", pc, fno);
                    ensure!(
                        n as u32 == functions[fno as usize].arity,
                        "pc {}: MkFrame needs exactly {} args for {}",
                        pc,
                        functions[fno as usize].arity,
                        functions[fno as usize].name
                    );
                }
                Instr::MkCap { fno, n } => {
                    ensure!(fno_ok(fno), "pc {}: unknown function {}", pc, fno);
                    ensure!(
                        (n as u32) < functions[fno as usize].arity,
                        "pc {}: MkCap must be under-saturated",
                        pc
                    );
                }
                Instr::PushString(idx) if idx as usize >= strings.len() => {
                    bail!("pc {}: unknown string constant {}", pc, idx)
                }
                _ => {}
            }
        }

        let user_functions = nfuncs;
        let mut add = |functions: &mut Vec<FunctionInfo>, name: String, arity: u32, body: &[Instr]| -> u32 {
            let fno = functions.len() as u32;
            let address = code.len() as u32;
            code.push(Instr::GlobStart(fno));
            code.extend_from_slice(body);
            functions.push(FunctionInfo::new(name, arity, arity + 1, address));
            fno
        };

        let eval_stub = add(&mut functions, "__eval".into(), 1, &[Instr::Eval(0), Instr::Return]);
        let apply_stub = add(&mut functions, "__apply".into(), 2, &[Instr::Eval(1), Instr::Do]);

        let mut wrappers = Vec::with_capacity(Builtin::ALL.len());
        for b in Builtin::ALL {
            let mut body: Vec<Instr> = (0..b.strict()).map(|i| Instr::Eval(i as u16)).collect();
            body.push(Instr::Bif(b));
            body.push(Instr::Return);
            wrappers.push(add(&mut functions, format!("__bif_{}", b.name()), b.arity(), &body));
        }

        debug!(
            target: "nreduce::task",
            functions = user_functions,
            instructions = len,
            strings = strings.len(),
            "program.loaded"
        );

        Ok(Self {
            functions,
            code,
            strings,
            main,
            eval_stub,
            apply_stub,
            wrappers,
            user_functions,
        })
    }

    pub fn function(&self, fno: u32) -> RtResult<&FunctionInfo> {
        self.functions
            .get(fno as usize)
            .ok_or_else(|| fatal!("invalid function number {}", fno))
    }

    #[inline]
    pub fn instr(&self, pc: u32) -> RtResult<Instr> {
        self.code
            .get(pc as usize)
            .copied()
            .ok_or_else(|| fatal!("pc {} outside code", pc))
    }

    pub fn string(&self, idx: u32) -> RtResult<&str> {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| fatal!("invalid string constant {}", idx))
    }

    /// Function number of the wrapper that implements `b` as a callable.
    pub fn wrapper(&self, b: Builtin) -> u32 {
        self.wrappers[b.id() as usize]
    }

    pub fn user_functions(&self) -> u32 {
        self.user_functions
    }

    /// `name+offset` for the function containing `pc`, used in error locations.
    pub fn describe(&self, fno: u32, pc: u32) -> String {
        match self.functions.get(fno as usize) {
            Some(f) if pc >= f.address => format!("{}+{}", f.name, pc - f.address),
            Some(f) => format!("{}@{}", f.name, pc),
            None => format!("?@{}", pc),
        }
    }
}
