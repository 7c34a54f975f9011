//! Tagged value words.
//!
//! A `Pntr` is an 8-byte word that is either an IEEE-754 double or a
//! reference to a heap cell. References live in the negative quiet-NaN
//! space:
//!
//! ```text
//! number:  any double outside 0xFFFC_xxxx_xxxx_xxxx
//! cell:    0xFFFC_0000_IIII_IIII   (I = 32-bit cell index)
//! ```
//!
//! NaN results are canonicalised to the positive quiet NaN so that no
//! arithmetic result can ever be read back as a cell reference.

use std::fmt;

const BOX_BASE: u64 = 0xFFFC_0000_0000_0000;
const BOX_MASK: u64 = 0xFFFF_0000_0000_0000;
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Index of a cell inside a task's heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub(crate) u32);

impl CellId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pntr(u64);

/// Decoded view of a `Pntr`; the only way to look inside one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PntrKind {
    Number(f64),
    Cell(CellId),
}

impl Pntr {
    #[inline]
    pub fn number(n: f64) -> Self {
        if n.is_nan() { Pntr(CANONICAL_NAN) } else { Pntr(n.to_bits()) }
    }

    #[inline]
    pub const fn cell(id: CellId) -> Self {
        Pntr(BOX_BASE | id.0 as u64)
    }

    #[inline]
    pub fn kind(self) -> PntrKind {
        if self.0 & BOX_MASK == BOX_BASE {
            PntrKind::Cell(CellId(self.0 as u32))
        } else {
            PntrKind::Number(f64::from_bits(self.0))
        }
    }

    #[inline]
    pub fn is_cell(self) -> bool {
        self.0 & BOX_MASK == BOX_BASE
    }

    #[inline]
    pub fn as_number(self) -> Option<f64> {
        match self.kind() {
            PntrKind::Number(n) => Some(n),
            PntrKind::Cell(_) => None,
        }
    }

    #[inline]
    pub fn as_cell(self) -> Option<CellId> {
        match self.kind() {
            PntrKind::Cell(id) => Some(id),
            PntrKind::Number(_) => None,
        }
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Pntr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            PntrKind::Number(n) => write!(f, "#{}", n),
            PntrKind::Cell(id) => write!(f, "@{}", id.0),
        }
    }
}

impl From<CellId> for Pntr {
    fn from(id: CellId) -> Self {
        Pntr::cell(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_never_look_like_cells() {
        let samples = [
            0.0,
            -0.0,
            1.0,
            -1.5,
            f64::MAX,
            f64::MIN,
            f64::MIN_POSITIVE,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NAN,
            -f64::NAN,
            f64::from_bits(0xFFFC_0000_0000_0001),
            f64::from_bits(0xFFFF_FFFF_FFFF_FFFF),
        ];
        for n in samples {
            let p = Pntr::number(n);
            assert!(!p.is_cell(), "{:?} misread as a cell", n);
            match p.kind() {
                PntrKind::Number(back) if n.is_nan() => assert!(back.is_nan()),
                PntrKind::Number(back) => assert_eq!(back.to_bits(), n.to_bits()),
                PntrKind::Cell(_) => unreachable!(),
            }
        }
    }

    #[test]
    fn cells_round_trip_their_index() {
        for raw in [0u32, 1, 7, 65_535, 1 << 24, u32::MAX] {
            let p = Pntr::cell(CellId(raw));
            assert!(p.is_cell());
            assert_eq!(p.as_cell(), Some(CellId(raw)));
            assert_eq!(p.as_number(), None);
        }
    }

    #[test]
    fn walking_integer_range_keeps_tags() {
        let mut x = -1000.25f64;
        while x < 1000.0 {
            assert_eq!(Pntr::number(x).as_number(), Some(x));
            x += 3.75;
        }
    }
}
