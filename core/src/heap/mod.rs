//! Per-task cell heap.
//!
//! Cells are addressed by index and are never freed by hand; the only way a
//! slot becomes reusable is a collection (`gc.rs`). New cells start in the
//! young generation and get promoted by the first collection they survive.

mod gc;
mod pntr;

pub use gc::{CollectScope, FrameEdges, SweepReport};
pub use pntr::{CellId, Pntr, PntrKind};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::addr::GlobalId;
use crate::error::RtResult;
use crate::fatal;
use crate::program::Builtin;
use crate::task::{FrameId, SysObjectId};

/// Partially applied function. Shared once built; extension copies it.
#[derive(Debug, Clone, PartialEq)]
pub struct Cap {
    pub fno: u32,
    pub arity: u32,
    pub args: Vec<Pntr>,
}

/// Variable-length array payload. The element size is implied by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Bytes(Vec<u8>),
    Values(Vec<Pntr>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Bytes(b) => b.len(),
            ArrayData::Values(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elem_size(&self) -> usize {
        match self {
            ArrayData::Bytes(_) => 1,
            ArrayData::Values(_) => std::mem::size_of::<Pntr>(),
        }
    }

    pub fn item(&self, idx: usize) -> Option<Pntr> {
        match self {
            ArrayData::Bytes(b) => b.get(idx).map(|byte| Pntr::number(*byte as f64)),
            ArrayData::Values(v) => v.get(idx).copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellKind {
    Application(Pntr, Pntr),
    Builtin(Builtin),
    Cons(Pntr, Pntr),
    Ind(Pntr),
    Scref(u32),
    ArrayRef { array: CellId, start: usize },
    Hole,
    Frame(FrameId),
    Cap(Box<Cap>),
    Nil,
    Array(ArrayData),
    Remote(GlobalId),
    SysObject(SysObjectId),
}

impl CellKind {
    pub fn name(&self) -> &'static str {
        match self {
            CellKind::Application(..) => "application",
            CellKind::Builtin(_) => "builtin",
            CellKind::Cons(..) => "cons",
            CellKind::Ind(_) => "indirection",
            CellKind::Scref(_) => "function",
            CellKind::ArrayRef { .. } => "arrayref",
            CellKind::Hole => "hole",
            CellKind::Frame(_) => "frame",
            CellKind::Cap(_) => "closure",
            CellKind::Nil => "nil",
            CellKind::Array(_) => "array",
            CellKind::Remote(_) => "remote",
            CellKind::SysObject(_) => "sysobject",
        }
    }
}

/// A `Pntr` with indirections already skipped.
#[derive(Debug, Clone, Copy)]
pub enum View<'a> {
    Number(f64),
    Cell(CellId, &'a CellKind),
}

impl View<'_> {
    pub fn type_name(&self) -> &'static str {
        match self {
            View::Number(_) => "number",
            View::Cell(_, kind) => kind.name(),
        }
    }
}

#[derive(Debug)]
struct Cell {
    kind: CellKind,
    old: bool,
    marked: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub allocated: u64,
    pub minor_collections: u64,
    pub major_collections: u64,
}

#[derive(Debug)]
pub struct Heap {
    cells: Vec<Option<Cell>>,
    free: Vec<u32>,
    young: Vec<CellId>,
    remembered: Vec<CellId>,
    nil: CellId,
    stats: HeapStats,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        let nil = CellId(0);
        Self {
            cells: vec![Some(Cell {
                kind: CellKind::Nil,
                old: true,
                marked: false,
            })],
            free: Vec::new(),
            young: Vec::new(),
            remembered: Vec::new(),
            nil,
            stats: HeapStats::default(),
        }
    }

    #[inline]
    pub fn nil(&self) -> Pntr {
        Pntr::cell(self.nil)
    }

    pub fn alloc(&mut self, kind: CellKind) -> Pntr {
        Pntr::cell(self.alloc_id(kind))
    }

    pub fn alloc_id(&mut self, kind: CellKind) -> CellId {
        let cell = Cell {
            kind,
            old: false,
            marked: false,
        };
        let id = match self.free.pop() {
            Some(idx) => {
                self.cells[idx as usize] = Some(cell);
                CellId(idx)
            }
            None => {
                self.cells.push(Some(cell));
                CellId((self.cells.len() - 1) as u32)
            }
        };
        self.young.push(id);
        self.stats.allocated += 1;
        id
    }

    /// Raw cell contents, indirections included. Only the collector, the
    /// wire exporter's identity checks and tests need this.
    pub fn raw(&self, id: CellId) -> RtResult<&CellKind> {
        match self.cells.get(id.index()) {
            Some(Some(cell)) => Ok(&cell.kind),
            _ => Err(fatal!("access to unallocated cell {}", id.0)),
        }
    }

    /// Follow indirections until a non-indirection value is reached.
    pub fn resolve(&self, mut p: Pntr) -> RtResult<Pntr> {
        while let PntrKind::Cell(id) = p.kind() {
            match self.raw(id)? {
                CellKind::Ind(next) => p = *next,
                _ => break,
            }
        }
        Ok(p)
    }

    pub fn view(&self, p: Pntr) -> RtResult<View<'_>> {
        let p = self.resolve(p)?;
        Ok(match p.kind() {
            PntrKind::Number(n) => View::Number(n),
            PntrKind::Cell(id) => View::Cell(id, self.raw(id)?),
        })
    }

    pub fn is_nil(&self, p: Pntr) -> RtResult<bool> {
        Ok(matches!(self.view(p)?, View::Cell(_, CellKind::Nil)))
    }

    /// Overwrite a cell in place. Old cells are recorded so the next minor
    /// collection scans whatever young cells they now reach.
    pub fn set(&mut self, id: CellId, kind: CellKind) -> RtResult<()> {
        if id == self.nil {
            return Err(fatal!("attempt to overwrite the nil cell"));
        }
        let Some(Some(cell)) = self.cells.get_mut(id.index()) else {
            return Err(fatal!("write to unallocated cell {}", id.0));
        };
        cell.kind = kind;
        if cell.old {
            self.remembered.push(id);
        }
        Ok(())
    }

    /// Turn `id` into an indirection to `target` (memoised update).
    pub fn make_ind(&mut self, id: CellId, target: Pntr) -> RtResult<()> {
        let resolved = self.resolve(target)?;
        if resolved == Pntr::cell(id) {
            return Err(fatal!("indirection cycle through cell {}", id.0));
        }
        trace!(target: "nreduce::heap", cell = id.0, target = ?resolved, "heap.ind");
        self.set(id, CellKind::Ind(resolved))
    }

    pub fn bytes(&mut self, data: &[u8]) -> Pntr {
        if data.is_empty() {
            return self.nil();
        }
        self.alloc(CellKind::Array(ArrayData::Bytes(data.to_vec())))
    }

    pub fn values(&mut self, data: Vec<Pntr>) -> Pntr {
        if data.is_empty() {
            return self.nil();
        }
        self.alloc(CellKind::Array(ArrayData::Values(data)))
    }

    /// Suffix of an array starting at `start`, sharing the array storage.
    pub fn array_suffix(&mut self, array: CellId, start: usize) -> RtResult<Pntr> {
        let len = match self.raw(array)? {
            CellKind::Array(data) => data.len(),
            other => return Err(fatal!("arrayref target is a {}", other.name())),
        };
        if start >= len {
            return Ok(self.nil());
        }
        if start == 0 {
            return Ok(Pntr::cell(array));
        }
        Ok(self.alloc(CellKind::ArrayRef { array, start }))
    }

    pub fn cons(&mut self, head: Pntr, tail: Pntr) -> Pntr {
        self.alloc(CellKind::Cons(head, tail))
    }

    pub fn live_cells(&self) -> usize {
        self.cells.len() - self.free.len()
    }

    pub fn young_len(&self) -> usize {
        self.young.len()
    }

    pub fn contains(&self, p: Pntr) -> bool {
        match p.kind() {
            PntrKind::Number(_) => true,
            PntrKind::Cell(id) => matches!(self.cells.get(id.index()), Some(Some(_))),
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }
}
