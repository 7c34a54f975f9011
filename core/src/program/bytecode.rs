use serde::{Deserialize, Serialize};

use super::builtin::Builtin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    #[inline]
    pub fn test(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

/// One bytecode instruction. Slot operands index the current frame's stack
/// from the bottom; jump targets are absolute code addresses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    Begin,
    End,
    GlobStart(u32),
    /// Force a slot to weak head normal form, blocking if needed.
    Eval(u16),
    Return,
    /// Apply the evaluated function on top of the stack to every slot below it.
    Do,
    /// Run a known function eagerly on the top `arity` slots.
    Call(u32),
    Jfalse(u32),
    Jump(u32),
    /// Pop two numbers and jump when the comparison is false.
    JCmp(CmpOp, u32),
    Push(u16),
    Pop(u16),
    /// Drop `remove` slots sitting directly below the top `keep` slots.
    Squeeze {
        keep: u16,
        remove: u16,
    },
    Alloc(u16),
    /// Fill the hole at a slot with the popped top value.
    Update(u16),
    MkCap {
        fno: u32,
        n: u16,
    },
    MkFrame {
        fno: u32,
        n: u16,
    },
    /// Pop a function and an argument and push a lazy application of them.
    MkAp,
    PushFn(u32),
    PushBuiltin(Builtin),
    Spark(u16),
    Bif(Builtin),
    PushNil,
    PushNumber(f64),
    PushString(u32),
    ConsN(u16),
    ArrayN(u16),
    ItemN(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub arity: u32,
    pub stack_depth: u32,
    /// Full entry: evaluates strict arguments before the body.
    pub address: u32,
    /// Entry that skips argument evaluation, used by `Call`.
    #[serde(default)]
    pub address_ne: Option<u32>,
    /// `missing_entries[k - 1]` is taken when an application supplies the last `k` arguments.
    #[serde(default)]
    pub missing_entries: Vec<u32>,
    #[serde(default)]
    pub strict: Vec<bool>,
}

impl FunctionInfo {
    pub fn new(name: impl Into<String>, arity: u32, stack_depth: u32, address: u32) -> Self {
        Self {
            name: name.into(),
            arity,
            stack_depth,
            address,
            address_ne: None,
            missing_entries: Vec::new(),
            strict: Vec::new(),
        }
    }

    #[inline]
    pub fn entry_ne(&self) -> u32 {
        self.address_ne.unwrap_or(self.address)
    }

    /// Entry for a saturating application that supplied `supplied` new arguments
    /// on top of `captured` ones already held by a closure.
    pub fn entry_for(&self, captured: usize, supplied: usize) -> u32 {
        if captured > 0 && (1..=2).contains(&supplied) {
            if let Some(addr) = self.missing_entries.get(supplied - 1) {
                return *addr;
            }
        }
        self.address
    }

    pub fn is_strict(&self, arg: usize) -> bool {
        self.strict.get(arg).copied().unwrap_or(false)
    }
}
