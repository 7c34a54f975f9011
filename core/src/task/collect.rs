//! Task 0's result collector.
//!
//! `main` only evaluates to weak head normal form. The collector walks the
//! result, demands every part that is still unevaluated through an eval
//! stub frame, and once a walk finds nothing left to demand it converts the
//! graph into a heap-independent `Value`. Lists keep a cursor between walks
//! so a long lazily produced list is only converted once.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, trace};

use super::exec::Demand;
use super::Task;
use crate::error::{RtResult, RuntimeError};
use crate::heap::{ArrayData, CellId, CellKind, Pntr, PntrKind};
use crate::value::Value;

#[derive(Debug)]
pub(crate) struct Collector {
    root: Pntr,
    /// Cells of the eval frames issued by the last walk.
    demands: Vec<CellId>,
    /// Partly converted lists, keyed by their first cell.
    lists: FxHashMap<CellId, ListCursor>,
}

impl Collector {
    pub fn roots(&self, out: &mut Vec<Pntr>) {
        out.push(self.root);
        out.extend(self.demands.iter().map(|c| Pntr::cell(*c)));
        out.extend(self.lists.values().map(|l| l.next));
    }
}

/// The converted prefix of a list and the first spine cell after it.
#[derive(Debug)]
struct ListCursor {
    done: Vec<Value>,
    next: Pntr,
    spine: FxHashSet<CellId>,
}

/// State of one walk over the result graph.
struct Walk {
    demanded: FxHashSet<CellId>,
    issued: Vec<CellId>,
    lists: FxHashMap<CellId, ListCursor>,
}

impl Task {
    /// Start evaluating `main` on this task.
    pub(crate) fn boot(&mut self) -> RtResult<()> {
        let main = self.program.main;
        let entry = self.program.function(main)?.address;
        let (fid, cell) = self.spawn_frame(main, entry, Vec::new())?;
        self.make_ready(fid)?;
        self.collector = Some(Collector {
            root: Pntr::cell(cell),
            demands: Vec::new(),
            lists: FxHashMap::default(),
        });
        info!(target: "nreduce::task", tid = self.tid, main = %self.program.describe(main, entry), "task.boot");
        Ok(())
    }

    fn evaluated(&self, cell: CellId) -> RtResult<bool> {
        let p = self.heap.resolve(Pntr::cell(cell))?;
        match p.as_cell() {
            Some(id) => Ok(self.demand(id)? == Demand::Whnf),
            None => Ok(true),
        }
    }

    pub(crate) fn poll_collector(&mut self) -> RtResult<()> {
        if self.finished.is_some() || self.error.is_some() {
            return Ok(());
        }
        let Some(collector) = &self.collector else {
            return Ok(());
        };
        for cell in &collector.demands {
            if !self.evaluated(*cell)? {
                return Ok(());
            }
        }
        let root = collector.root;
        let lists = match self.collector.as_mut() {
            Some(c) => std::mem::take(&mut c.lists),
            None => FxHashMap::default(),
        };
        let mut walk = Walk {
            demanded: FxHashSet::default(),
            issued: Vec::new(),
            lists,
        };
        let value = self.walk(root, &mut walk);
        if let Some(c) = self.collector.as_mut() {
            c.lists = std::mem::take(&mut walk.lists);
        }
        let value = value?;
        match value {
            Some(value) if walk.issued.is_empty() => {
                info!(target: "nreduce::task", tid = self.tid, "task.result_ready");
                self.collector = None;
                self.finished = Some(Ok(value));
            }
            _ => {
                trace!(target: "nreduce::task", demands = walk.issued.len(), lists = walk.lists.len(), "collect.demand");
                if let Some(c) = self.collector.as_mut() {
                    c.demands = walk.issued;
                }
            }
        }
        Ok(())
    }

    /// Evaluate `cell` on behalf of the collector.
    fn issue(&mut self, cell: CellId, walk: &mut Walk) -> RtResult<()> {
        if !walk.demanded.insert(cell) {
            return Ok(());
        }
        let stub = self.program.eval_stub;
        let entry = self.program.function(stub)?.address;
        let (fid, stub_cell) = self.spawn_frame(stub, entry, vec![Pntr::cell(cell)])?;
        self.make_ready(fid)?;
        walk.issued.push(stub_cell);
        Ok(())
    }

    /// Convert the graph under `p`. Returns None when part of it had to be demanded.
    fn walk(&mut self, p: Pntr, walk: &mut Walk) -> RtResult<Option<Value>> {
        let p = self.heap.resolve(p)?;
        let id = match p.kind() {
            PntrKind::Number(n) => return Ok(Some(Value::Number(n))),
            PntrKind::Cell(id) => id,
        };
        if self.demand(id)? != Demand::Whnf {
            self.issue(id, walk)?;
            return Ok(None);
        }
        match self.heap.raw(id)?.clone() {
            CellKind::Nil => Ok(Some(Value::Nil)),
            CellKind::Cons(..) => self.walk_list(p, walk),
            CellKind::Array(ArrayData::Bytes(b)) => Ok(Some(Value::Bytes(b))),
            CellKind::Array(ArrayData::Values(items)) => self.walk_items(items, walk),
            CellKind::ArrayRef { array, start } => match self.heap.raw(array)?.clone() {
                CellKind::Array(ArrayData::Bytes(b)) => Ok(Some(Value::Bytes(b[start.min(b.len())..].to_vec()))),
                CellKind::Array(ArrayData::Values(items)) => {
                    self.walk_items(items[start.min(items.len())..].to_vec(), walk)
                }
                other => Err(RuntimeError::app(format!("arrayref over a {}", other.name()))),
            },
            CellKind::Cap(_) | CellKind::Scref(_) | CellKind::Builtin(_) => Ok(Some(Value::Opaque("function".into()))),
            CellKind::SysObject(_) => Ok(Some(Value::Opaque("connection".into()))),
            other => Err(RuntimeError::app(format!("result contains a {}", other.name()))),
        }
    }

    fn walk_items(&mut self, items: Vec<Pntr>, walk: &mut Walk) -> RtResult<Option<Value>> {
        let mut out = Vec::with_capacity(items.len());
        let mut complete = true;
        for item in items {
            match self.walk(item, walk)? {
                Some(v) => out.push(v),
                None => complete = false,
            }
        }
        Ok(complete.then_some(Value::List(out)))
    }

    /// Lists are walked along the spine without recursion. A tail that is
    /// an array is spliced in, so `cons` onto a string reads as one list.
    /// The walk resumes where the last one stalled; past a stall it only
    /// issues demands.
    fn walk_list(&mut self, p: Pntr, walk: &mut Walk) -> RtResult<Option<Value>> {
        let PntrKind::Cell(key) = self.heap.resolve(p)?.kind() else {
            return Err(RuntimeError::app("list ends in a number"));
        };
        let (mut out, mut p, mut spine) = match walk.lists.remove(&key) {
            Some(c) => (c.done, c.next, c.spine),
            None => (Vec::new(), Pntr::cell(key), FxHashSet::default()),
        };
        let mut stalled: Option<ListCursor> = None;
        loop {
            let id = match self.heap.resolve(p)?.kind() {
                PntrKind::Cell(id) => id,
                PntrKind::Number(_) => return Err(RuntimeError::app("list ends in a number")),
            };
            if self.demand(id)? != Demand::Whnf {
                self.issue(id, walk)?;
                if stalled.is_none() {
                    stalled = Some(ListCursor {
                        done: std::mem::take(&mut out),
                        next: p,
                        spine: spine.clone(),
                    });
                }
                break;
            }
            if !spine.insert(id) {
                return Err(RuntimeError::app("result is a cyclic list"));
            }
            let (value, here, last) = match self.heap.raw(id)?.clone() {
                CellKind::Cons(h, t) => {
                    let head = self.walk(h, walk)?;
                    let here = p;
                    p = t;
                    (head, here, false)
                }
                CellKind::Nil => break,
                _ => match self.walk(Pntr::cell(id), walk)? {
                    Some(Value::List(rest)) => (Some(Value::List(rest)), p, true),
                    Some(Value::Bytes(rest)) => (
                        Some(Value::List(rest.into_iter().map(|b| Value::Number(b as f64)).collect())),
                        p,
                        true,
                    ),
                    Some(other) => return Err(RuntimeError::app(format!("list ends in {}", other))),
                    None => (None, p, true),
                },
            };
            if stalled.is_none() {
                match value {
                    Some(Value::List(rest)) if last => out.extend(rest),
                    Some(v) => out.push(v),
                    None => {
                        let mut before = spine.clone();
                        before.remove(&id);
                        stalled = Some(ListCursor {
                            done: std::mem::take(&mut out),
                            next: here,
                            spine: before,
                        });
                    }
                }
            }
            if last {
                break;
            }
        }
        match stalled {
            Some(cursor) => {
                walk.lists.insert(key, cursor);
                Ok(None)
            }
            None => Ok(Some(Value::List(out))),
        }
    }
}
