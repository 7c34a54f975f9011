use serde::{Deserialize, Serialize};

/// Primitive operations reachable through `Bif` and builtin reference cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Builtin {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Neg,
    Floor,
    Ceil,
    Sqrt,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    Not,
    And,
    Or,
    Cons,
    Head,
    Tail,
    IsPair,
    IsNumber,
    IsNil,
    ArraySize,
    ArrayItem,
    ArraySkip,
    NumToString,
    StrLen,
    Print,
    Connect,
    Listen,
    Accept,
    Read,
    Write,
    Close,
    IoError,
}

impl Builtin {
    pub const ALL: [Builtin; 43] = [
        Builtin::Add,
        Builtin::Sub,
        Builtin::Mul,
        Builtin::Div,
        Builtin::Mod,
        Builtin::Eq,
        Builtin::Ne,
        Builtin::Lt,
        Builtin::Le,
        Builtin::Gt,
        Builtin::Ge,
        Builtin::Neg,
        Builtin::Floor,
        Builtin::Ceil,
        Builtin::Sqrt,
        Builtin::BitAnd,
        Builtin::BitOr,
        Builtin::BitXor,
        Builtin::BitNot,
        Builtin::Shl,
        Builtin::Shr,
        Builtin::Not,
        Builtin::And,
        Builtin::Or,
        Builtin::Cons,
        Builtin::Head,
        Builtin::Tail,
        Builtin::IsPair,
        Builtin::IsNumber,
        Builtin::IsNil,
        Builtin::ArraySize,
        Builtin::ArrayItem,
        Builtin::ArraySkip,
        Builtin::NumToString,
        Builtin::StrLen,
        Builtin::Print,
        Builtin::Connect,
        Builtin::Listen,
        Builtin::Accept,
        Builtin::Read,
        Builtin::Write,
        Builtin::Close,
        Builtin::IoError,
    ];

    #[inline]
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Builtin> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn name(self) -> &'static str {
        use Builtin::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            Neg => "neg",
            Floor => "floor",
            Ceil => "ceil",
            Sqrt => "sqrt",
            BitAnd => "&",
            BitOr => "|",
            BitXor => "^",
            BitNot => "~",
            Shl => "<<",
            Shr => ">>",
            Not => "not",
            And => "and",
            Or => "or",
            Cons => "cons",
            Head => "head",
            Tail => "tail",
            IsPair => "ispair",
            IsNumber => "isnumber",
            IsNil => "isnil",
            ArraySize => "arraysize",
            ArrayItem => "arrayitem",
            ArraySkip => "arrayskip",
            NumToString => "numtostring",
            StrLen => "strlen",
            Print => "print",
            Connect => "connect",
            Listen => "listen",
            Accept => "accept",
            Read => "read",
            Write => "write",
            Close => "close",
            IoError => "ioerror",
        }
    }

    pub fn arity(self) -> u32 {
        use Builtin::*;
        match self {
            Neg | Floor | Ceil | Sqrt | BitNot | Not | Head | Tail | IsPair | IsNumber | IsNil | ArraySize
            | NumToString | StrLen | Print | Listen | Accept | Read | Close | IoError => 1,
            _ => 2,
        }
    }

    /// Number of leading arguments that must be in WHNF before the call.
    pub fn strict(self) -> u32 {
        match self {
            Builtin::Cons => 0,
            other => other.arity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_table_order() {
        for (idx, b) in Builtin::ALL.iter().enumerate() {
            assert_eq!(b.id() as usize, idx);
            assert_eq!(Builtin::from_id(idx as u16), Some(*b));
        }
        assert_eq!(Builtin::from_id(Builtin::ALL.len() as u16), None);
    }

    #[test]
    fn cons_is_lazy_in_both_arguments() {
        assert_eq!(Builtin::Cons.arity(), 2);
        assert_eq!(Builtin::Cons.strict(), 0);
        assert_eq!(Builtin::Add.strict(), 2);
    }
}
