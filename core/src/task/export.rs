//! Moving values between heaps.
//!
//! Export walks a local graph and produces its wire form. Anything with an
//! identity that can travel gets a physical address so that the receiver's
//! replica and later references to the same object line up. Unevaluated or
//! unmovable objects (frames, holes, sockets) only travel as references.
//! Import is the inverse; a known address always resolves to the existing
//! local object instead of a second copy.

use rustc_hash::FxHashSet;
use tracing::trace;

use super::{FrameId, Task};
use crate::addr::GAddr;
use crate::error::RtResult;
use crate::fatal;
use crate::heap::{ArrayData, Cap, CellId, CellKind, Pntr, PntrKind};
use crate::wire::{WireArray, WireValue};

impl Task {
    pub(crate) fn export(&mut self, p: Pntr) -> RtResult<WireValue> {
        let mut seen = FxHashSet::default();
        self.export_at(p, 0, &mut seen)
    }

    fn export_ref(&mut self, p: Pntr) -> WireValue {
        WireValue::Ref(self.globals.make_phys(p))
    }

    fn export_at(&mut self, p: Pntr, depth: usize, seen: &mut FxHashSet<CellId>) -> RtResult<WireValue> {
        let p = self.heap.resolve(p)?;
        let id = match p.kind() {
            PntrKind::Number(n) => return Ok(WireValue::Number(n)),
            PntrKind::Cell(id) => id,
        };
        if let Some(gid) = self.globals.target_of(p) {
            let g = self.globals.get(gid)?;
            if !g.pending {
                return Ok(WireValue::Ref(g.addr));
            }
            return Ok(self.export_ref(p));
        }

        let kind = self.heap.raw(id)?.clone();
        match kind {
            CellKind::Nil => return Ok(WireValue::Nil),
            CellKind::Builtin(b) => return Ok(WireValue::Builtin(b)),
            CellKind::Scref(fno) if self.program.function(fno)?.arity > 0 => return Ok(WireValue::Scref(fno)),
            _ => {}
        }
        if depth >= self.config.max_serialize_depth || !seen.insert(id) {
            return Ok(self.export_ref(p));
        }

        Ok(match kind {
            CellKind::Cons(h, t) => {
                let addr = self.globals.make_phys(p);
                let head = self.export_at(h, depth + 1, seen)?;
                let tail = self.export_at(t, depth + 1, seen)?;
                WireValue::Cons {
                    addr,
                    head: Box::new(head),
                    tail: Box::new(tail),
                }
            }
            CellKind::Array(data) => self.export_array(p, &data, depth, seen)?,
            CellKind::ArrayRef { array, start } => {
                let addr = self.globals.make_phys(p);
                let data = match self.heap.raw(array)? {
                    CellKind::Array(data) => data.clone(),
                    other => return Err(fatal!("arrayref over a {}", other.name())),
                };
                seen.insert(array);
                let array = self.export_array(Pntr::cell(array), &data, depth + 1, seen)?;
                WireValue::ArrayRef {
                    addr,
                    array: Box::new(array),
                    start: start as u32,
                }
            }
            CellKind::Cap(cap) => {
                let addr = self.globals.make_phys(p);
                let mut args = Vec::with_capacity(cap.args.len());
                for a in &cap.args {
                    args.push(self.export_at(*a, depth + 1, seen)?);
                }
                WireValue::Cap {
                    addr,
                    fno: cap.fno,
                    arity: cap.arity,
                    args,
                }
            }
            CellKind::Ind(_) => return Err(fatal!("unresolved indirection at cell {}", id.0)),
            CellKind::Frame(_)
            | CellKind::Hole
            | CellKind::SysObject(_)
            | CellKind::Application(..)
            | CellKind::Scref(_)
            | CellKind::Remote(_)
            | CellKind::Nil
            | CellKind::Builtin(_) => self.export_ref(p),
        })
    }

    fn export_array(
        &mut self,
        p: Pntr,
        data: &ArrayData,
        depth: usize,
        seen: &mut FxHashSet<CellId>,
    ) -> RtResult<WireValue> {
        let addr = self.globals.make_phys(p);
        let data = match data {
            ArrayData::Bytes(b) => WireArray::Bytes(b.clone()),
            ArrayData::Values(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.export_at(*item, depth + 1, seen)?);
                }
                WireArray::Values(out)
            }
        };
        Ok(WireValue::Array { addr, data })
    }

    /// Wire form of an unstarted frame about to move to another task.
    pub(crate) fn export_frame(&mut self, fid: FrameId, addr: GAddr) -> RtResult<WireValue> {
        let frame = self.frames.get(fid)?;
        if !frame.state.is_unstarted() {
            return Err(fatal!("frame {} is {:?} and cannot migrate", fid, frame.state));
        }
        let (fno, pc, slots) = (frame.fno, frame.pc, frame.slots.clone());
        let mut seen = FxHashSet::default();
        if let Some(cell) = frame.cell() {
            seen.insert(cell);
        }
        let mut out = Vec::with_capacity(slots.len());
        for s in slots {
            out.push(self.export_at(s, 1, &mut seen)?);
        }
        trace!(target: "nreduce::proto", frame = %fid, %addr, slots = out.len(), "export.frame");
        Ok(WireValue::Frame {
            addr,
            fno,
            pc,
            slots: out,
        })
    }

    /// Local pointer for an address that already has a global, if any.
    fn known(&self, addr: GAddr) -> RtResult<Option<Pntr>> {
        if addr.tid == self.tid {
            let gid = self.globals.lookup_addr(addr)?;
            return Ok(Some(self.globals.get(gid)?.p));
        }
        match self.globals.find_addr(addr) {
            Some(gid) => Ok(Some(self.globals.get(gid)?.p)),
            None => Ok(None),
        }
    }

    /// Cell that stands in for `addr` while its contents are imported.
    fn placeholder(&mut self, addr: GAddr) -> RtResult<CellId> {
        let id = self.heap.alloc_id(CellKind::Hole);
        self.globals.add_target(addr, Pntr::cell(id))?;
        Ok(id)
    }

    pub(crate) fn import(&mut self, v: WireValue) -> RtResult<Pntr> {
        Ok(match v {
            WireValue::Number(n) => Pntr::number(n),
            WireValue::Nil => self.heap.nil(),
            WireValue::Builtin(b) => self.heap.alloc(CellKind::Builtin(b)),
            WireValue::Scref(fno) => {
                self.program.function(fno)?;
                self.heap.alloc(CellKind::Scref(fno))
            }
            WireValue::Ref(addr) => {
                if let Some(p) = self.known(addr)? {
                    return Ok(p);
                }
                let id = self.heap.alloc_id(CellKind::Hole);
                let gid = self.globals.add_target(addr, Pntr::cell(id))?;
                self.heap.set(id, CellKind::Remote(gid))?;
                Pntr::cell(id)
            }
            WireValue::Cons { addr, head, tail } => {
                if let Some(p) = self.known(addr)? {
                    return Ok(p);
                }
                let id = self.placeholder(addr)?;
                let h = self.import(*head)?;
                let t = self.import(*tail)?;
                self.heap.set(id, CellKind::Cons(h, t))?;
                Pntr::cell(id)
            }
            WireValue::Array { addr, data } => {
                if let Some(p) = self.known(addr)? {
                    return Ok(p);
                }
                let id = self.placeholder(addr)?;
                let data = self.import_array(data)?;
                self.heap.set(id, CellKind::Array(data))?;
                Pntr::cell(id)
            }
            WireValue::ArrayRef { addr, array, start } => {
                if let Some(p) = self.known(addr)? {
                    return Ok(p);
                }
                let id = self.placeholder(addr)?;
                let WireValue::Array { addr: backing_addr, data } = *array else {
                    return Err(fatal!("arrayref {} does not carry its array", addr));
                };
                let backing = match self.known(backing_addr)? {
                    Some(p) => self.heap.resolve(p)?.as_cell().filter(|a| {
                        matches!(self.heap.raw(*a), Ok(CellKind::Array(_)))
                    }),
                    None => None,
                };
                let backing = match backing {
                    Some(a) => a,
                    None => {
                        let data = self.import_array(data)?;
                        match self.globals.find_addr(backing_addr) {
                            Some(_) => self.heap.alloc_id(CellKind::Array(data)),
                            None => {
                                let a = self.placeholder(backing_addr)?;
                                self.heap.set(a, CellKind::Array(data))?;
                                a
                            }
                        }
                    }
                };
                self.heap.set(
                    id,
                    CellKind::ArrayRef {
                        array: backing,
                        start: start as usize,
                    },
                )?;
                Pntr::cell(id)
            }
            WireValue::Cap { addr, fno, arity, args } => {
                if let Some(p) = self.known(addr)? {
                    return Ok(p);
                }
                if self.program.function(fno)?.arity != arity {
                    return Err(fatal!("closure over function {} with arity {}", fno, arity));
                }
                let id = self.placeholder(addr)?;
                let mut items = Vec::with_capacity(args.len());
                for a in args {
                    items.push(self.import(a)?);
                }
                self.heap.set(id, CellKind::Cap(Box::new(Cap { fno, arity, args: items })))?;
                Pntr::cell(id)
            }
            WireValue::Frame { addr, .. } => {
                return Err(fatal!("frame {} received where a value was expected", addr));
            }
        })
    }

    fn import_array(&mut self, data: WireArray) -> RtResult<ArrayData> {
        Ok(match data {
            WireArray::Bytes(b) => ArrayData::Bytes(b),
            WireArray::Values(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.import(item)?);
                }
                ArrayData::Values(out)
            }
        })
    }

    /// Rebuild a migrated frame as a new, unstarted local frame.
    pub(crate) fn import_frame(&mut self, v: WireValue) -> RtResult<(FrameId, CellId)> {
        let WireValue::Frame { addr, fno, pc, slots } = v else {
            return Err(fatal!("expected a frame"));
        };
        let info = self.program.function(fno)?;
        if pc < info.address {
            return Err(fatal!("frame {} of function {} starts before its entry", addr, fno));
        }
        self.program.instr(pc)?;
        let mut local = Vec::with_capacity(slots.len());
        for s in slots {
            local.push(self.import(s)?);
        }
        let (fid, cell) = self.spawn_frame(fno, pc, local)?;
        trace!(target: "nreduce::proto", frame = %fid, %addr, "import.frame");
        Ok((fid, cell))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::{self, TestTask};
    use super::*;

    #[test]
    fn self_round_trip_rebuilds_a_list() {
        let mut t = TestTask::new(testkit::trivial_program(), 0, 2);
        let mut list = t.task.heap.nil();
        for n in (1..=5).rev() {
            list = t.task.heap.cons(Pntr::number(n as f64), list);
        }
        let wire = t.task.export(list).unwrap();
        let back = t.task.import(wire).unwrap();
        assert_eq!(back, list);
        assert_eq!(testkit::numbers(&t.task, back), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn export_assigns_one_address_per_object() {
        let mut t = TestTask::new(testkit::trivial_program(), 0, 2);
        let shared = t.task.heap.cons(Pntr::number(1.0), t.task.heap.nil());
        let pair = t.task.heap.cons(shared, shared);
        let WireValue::Cons { head, tail, .. } = t.task.export(pair).unwrap() else {
            panic!("expected a cons");
        };
        let WireValue::Cons { addr, .. } = *head else {
            panic!("expected the shared cons inline");
        };
        assert_eq!(*tail, WireValue::Ref(addr));
        assert!(t.task.globals.check_consistency().is_ok());
    }

    #[test]
    fn unevaluated_cells_travel_as_references() {
        let mut t = TestTask::new(testkit::trivial_program(), 0, 2);
        let hole = t.task.heap.alloc(CellKind::Hole);
        assert!(matches!(t.task.export(hole).unwrap(), WireValue::Ref(a) if a.tid == 0));
    }

    #[test]
    fn imported_refs_become_remote_cells() {
        let mut t = TestTask::new(testkit::trivial_program(), 0, 2);
        let addr = GAddr::new(1, 7);
        let p = t.task.import(WireValue::Ref(addr)).unwrap();
        let id = p.as_cell().unwrap();
        let CellKind::Remote(gid) = *t.task.heap.raw(id).unwrap() else {
            panic!("expected a remote cell");
        };
        assert_eq!(t.task.globals.get(gid).unwrap().addr, addr);
        assert_eq!(t.task.import(WireValue::Ref(addr)).unwrap(), p);
        assert_eq!(t.task.export(p).unwrap(), WireValue::Ref(addr));
    }

    #[test]
    fn deep_lists_are_cut_into_references() {
        let mut t = TestTask::new(testkit::trivial_program(), 0, 2);
        t.task.config.max_serialize_depth = 4;
        let mut list = t.task.heap.nil();
        for n in 0..10 {
            list = t.task.heap.cons(Pntr::number(n as f64), list);
        }
        let mut v = t.task.export(list).unwrap();
        let mut inline = 0;
        while let WireValue::Cons { tail, .. } = v {
            inline += 1;
            v = *tail;
        }
        assert_eq!(inline, 4);
        assert!(matches!(v, WireValue::Ref(_)));
    }

    #[test]
    fn frames_outside_migration_are_rejected() {
        let mut t = TestTask::new(testkit::trivial_program(), 0, 2);
        let err = t
            .task
            .import(WireValue::Frame {
                addr: GAddr::new(1, 1),
                fno: 0,
                pc: 1,
                slots: Vec::new(),
            })
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
