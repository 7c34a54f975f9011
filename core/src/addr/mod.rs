//! Cross-task addressing.
//!
//! Every object that another task may name has a `Global` entry here. Owned
//! objects are indexed by local pointer in `phys`; local stand-ins for
//! objects owned elsewhere (remote cells and replicas) are indexed in
//! `target`. Both kinds are also indexed by their `GAddr` in `addr`, except
//! for pending targets: a frame we just migrated has no address at its new
//! owner yet, so its global only enters `addr` once UPDATEREF names it.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::RtResult;
use crate::fatal;
use crate::heap::Pntr;
use crate::task::FrameId;

pub type TaskId = u32;

/// Network-wide object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GAddr {
    pub tid: TaskId,
    pub lid: u32,
}

impl GAddr {
    pub const fn new(tid: TaskId, lid: u32) -> Self {
        Self { tid, lid }
    }
}

impl fmt::Display for GAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.lid, self.tid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u32);

impl GlobalId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A peer waiting for a value: once known, RESPOND it to `task` under `store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetcher {
    pub task: TaskId,
    pub store: GAddr,
}

/// Parties waiting on a value that is not available yet.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WaitQueue {
    pub frames: Vec<FrameId>,
    pub fetchers: Vec<Fetcher>,
}

impl WaitQueue {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.fetchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len() + self.fetchers.len()
    }

    pub fn append(&mut self, other: &mut WaitQueue) {
        self.frames.append(&mut other.frames);
        self.fetchers.append(&mut other.fetchers);
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub addr: GAddr,
    pub p: Pntr,
    /// Owned by this task (indexed in `phys`) rather than a stand-in (`target`).
    pub owned: bool,
    /// A FETCH is outstanding for this address.
    pub fetching: bool,
    /// Migrated frame whose new address has not been reported back yet.
    pub pending: bool,
    pub wq: WaitQueue,
    pub dist_marked: bool,
}

#[derive(Debug)]
pub struct AddressTables {
    tid: TaskId,
    globals: Vec<Option<Global>>,
    free: Vec<u32>,
    phys: FxHashMap<Pntr, GlobalId>,
    target: FxHashMap<Pntr, GlobalId>,
    addr: FxHashMap<GAddr, GlobalId>,
    pending: FxHashMap<GAddr, GlobalId>,
    next_lid: u32,
}

impl AddressTables {
    pub fn new(tid: TaskId) -> Self {
        Self {
            tid,
            globals: Vec::new(),
            free: Vec::new(),
            phys: FxHashMap::default(),
            target: FxHashMap::default(),
            addr: FxHashMap::default(),
            pending: FxHashMap::default(),
            next_lid: 1,
        }
    }

    #[inline]
    pub fn tid(&self) -> TaskId {
        self.tid
    }

    pub fn len(&self) -> usize {
        self.globals.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: GlobalId) -> RtResult<&Global> {
        match self.globals.get(id.index()) {
            Some(Some(g)) => Ok(g),
            _ => Err(fatal!("stale global handle {}", id.0)),
        }
    }

    pub fn get_mut(&mut self, id: GlobalId) -> RtResult<&mut Global> {
        match self.globals.get_mut(id.index()) {
            Some(Some(g)) => Ok(g),
            _ => Err(fatal!("stale global handle {}", id.0)),
        }
    }

    fn insert(&mut self, global: Global) -> GlobalId {
        match self.free.pop() {
            Some(idx) => {
                self.globals[idx as usize] = Some(global);
                GlobalId(idx)
            }
            None => {
                self.globals.push(Some(global));
                GlobalId((self.globals.len() - 1) as u32)
            }
        }
    }

    fn fresh_addr(&mut self) -> GAddr {
        let lid = self.next_lid;
        self.next_lid += 1;
        GAddr::new(self.tid, lid)
    }

    /// Address under which other tasks may name the owned value `p`.
    /// Repeated calls for the same pointer return the same address.
    pub fn make_phys(&mut self, p: Pntr) -> GAddr {
        if let Some(id) = self.phys.get(&p) {
            if let Some(Some(g)) = self.globals.get(id.index()) {
                return g.addr;
            }
        }
        let addr = self.fresh_addr();
        let id = self.insert(Global {
            addr,
            p,
            owned: true,
            fetching: false,
            pending: false,
            wq: WaitQueue::default(),
            dist_marked: false,
        });
        self.phys.insert(p, id);
        self.addr.insert(addr, id);
        trace!(target: "nreduce::proto", %addr, ?p, "addr.phys");
        addr
    }

    pub fn phys_of(&self, p: Pntr) -> Option<GlobalId> {
        self.phys.get(&p).copied()
    }

    pub fn target_of(&self, p: Pntr) -> Option<GlobalId> {
        self.target.get(&p).copied()
    }

    /// Bind a local stand-in `p` to an object owned by another task.
    pub fn add_target(&mut self, addr: GAddr, p: Pntr) -> RtResult<GlobalId> {
        if addr.tid == self.tid {
            return Err(fatal!("target address {} is owned by this task", addr));
        }
        if self.addr.contains_key(&addr) {
            return Err(fatal!("address {} already bound", addr));
        }
        if self.target.contains_key(&p) {
            return Err(fatal!("pointer {:?} already stands in for another address", p));
        }
        let id = self.insert(Global {
            addr,
            p,
            owned: false,
            fetching: false,
            pending: false,
            wq: WaitQueue::default(),
            dist_marked: false,
        });
        self.target.insert(p, id);
        self.addr.insert(addr, id);
        trace!(target: "nreduce::proto", %addr, ?p, "addr.target");
        Ok(id)
    }

    /// Stand-in for a frame handed to another task. The returned address is
    /// what the new owner quotes back in its UPDATEREF.
    pub fn add_pending_target(&mut self, p: Pntr) -> RtResult<(GlobalId, GAddr)> {
        if self.target.contains_key(&p) {
            return Err(fatal!("pointer {:?} already stands in for another address", p));
        }
        let tell = self.fresh_addr();
        let id = self.insert(Global {
            addr: tell,
            p,
            owned: false,
            fetching: false,
            pending: true,
            wq: WaitQueue::default(),
            dist_marked: false,
        });
        self.target.insert(p, id);
        self.pending.insert(tell, id);
        Ok((id, tell))
    }

    /// Take a pending target out of the pending index. The caller decides
    /// whether to `bind_addr` it or merge it into an existing global.
    pub fn resolve_pending(&mut self, tell: GAddr) -> RtResult<GlobalId> {
        let id = self
            .pending
            .remove(&tell)
            .ok_or_else(|| fatal!("UPDATEREF for unknown reference {}", tell))?;
        self.get_mut(id)?.pending = false;
        Ok(id)
    }

    pub fn bind_addr(&mut self, id: GlobalId, addr: GAddr) -> RtResult<()> {
        if self.addr.contains_key(&addr) {
            return Err(fatal!("address {} already bound", addr));
        }
        self.get_mut(id)?.addr = addr;
        self.addr.insert(addr, id);
        Ok(())
    }

    /// Global for an address named in an incoming message. Missing entries mean
    /// an object was dropped while still referenced, which is unrecoverable.
    pub fn lookup_addr(&self, addr: GAddr) -> RtResult<GlobalId> {
        self.find_addr(addr)
            .ok_or_else(|| fatal!("no global for address {}", addr))
    }

    pub fn find_addr(&self, addr: GAddr) -> Option<GlobalId> {
        self.addr.get(&addr).copied()
    }

    pub fn remove(&mut self, id: GlobalId) -> RtResult<Global> {
        let g = self
            .globals
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or_else(|| fatal!("stale global handle {}", id.0))?;
        if g.owned {
            self.phys.remove(&g.p);
        } else {
            self.target.remove(&g.p);
        }
        if g.pending {
            self.pending.remove(&g.addr);
        } else {
            self.addr.remove(&g.addr);
        }
        self.free.push(id.0);
        trace!(target: "nreduce::proto", addr = %g.addr, "addr.remove");
        Ok(g)
    }

    pub fn ids(&self) -> Vec<GlobalId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GlobalId, &Global)> + '_ {
        self.globals
            .iter()
            .enumerate()
            .filter_map(|(idx, g)| g.as_ref().map(|g| (GlobalId(idx as u32), g)))
    }

    pub fn clear_dist_marks(&mut self) {
        for g in self.globals.iter_mut().flatten() {
            g.dist_marked = false;
        }
    }

    pub fn check_consistency(&self) -> Result<(), String> {
        for (id, g) in self.iter() {
            let (own, other) = if g.owned {
                (&self.phys, &self.target)
            } else {
                (&self.target, &self.phys)
            };
            if own.get(&g.p) != Some(&id) {
                return Err(format!("global {} missing from its pointer index", g.addr));
            }
            if other.get(&g.p) == Some(&id) {
                return Err(format!("global {} is both owned and a reference", g.addr));
            }
            let by_addr = if g.pending { &self.pending } else { &self.addr };
            if by_addr.get(&g.addr) != Some(&id) {
                return Err(format!("global {} missing from the address index", g.addr));
            }
            if g.owned != (g.addr.tid == self.tid) && !g.pending {
                return Err(format!("global {} has the wrong owner", g.addr));
            }
        }
        let indexed = self.phys.len() + self.target.len();
        if indexed != self.len() || self.addr.len() + self.pending.len() != self.len() {
            return Err("index sizes disagree with the global table".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{CellKind, Heap};

    #[test]
    fn make_phys_is_idempotent() {
        let mut heap = Heap::new();
        let mut tables = AddressTables::new(0);
        let p = heap.cons(Pntr::number(1.0), heap.nil());
        let a = tables.make_phys(p);
        assert_eq!(tables.make_phys(p), a);
        assert_eq!(a.tid, 0);
        assert_eq!(tables.len(), 1);
        tables.check_consistency().unwrap();
    }

    #[test]
    fn targets_are_indexed_by_pointer_and_address() {
        let mut heap = Heap::new();
        let mut tables = AddressTables::new(1);
        let remote = heap.alloc(CellKind::Hole);
        let addr = GAddr::new(0, 5);
        let id = tables.add_target(addr, remote).unwrap();
        assert_eq!(tables.target_of(remote), Some(id));
        assert_eq!(tables.lookup_addr(addr).unwrap(), id);
        assert!(tables.add_target(addr, heap.alloc(CellKind::Hole)).is_err());
        assert!(tables.add_target(GAddr::new(1, 9), heap.alloc(CellKind::Hole)).is_err());
        tables.check_consistency().unwrap();
    }

    #[test]
    fn pending_targets_join_the_address_index_when_bound() {
        let mut heap = Heap::new();
        let mut tables = AddressTables::new(0);
        let cell = heap.alloc(CellKind::Hole);
        let (id, tell) = tables.add_pending_target(cell).unwrap();
        tables.check_consistency().unwrap();
        assert!(tables.find_addr(tell).is_none());

        let resolved = tables.resolve_pending(tell).unwrap();
        assert_eq!(resolved, id);
        tables.bind_addr(id, GAddr::new(2, 40)).unwrap();
        assert_eq!(tables.lookup_addr(GAddr::new(2, 40)).unwrap(), id);
        tables.check_consistency().unwrap();
        assert!(tables.resolve_pending(tell).is_err());
    }

    #[test]
    fn missing_address_lookup_is_fatal() {
        let tables = AddressTables::new(0);
        assert!(tables.lookup_addr(GAddr::new(1, 1)).unwrap_err().is_fatal());
    }

    #[test]
    fn removal_keeps_indexes_consistent() {
        let mut heap = Heap::new();
        let mut tables = AddressTables::new(0);
        let mut ids = Vec::new();
        for i in 0..20 {
            let p = heap.cons(Pntr::number(i as f64), heap.nil());
            tables.make_phys(p);
            let r = heap.alloc(CellKind::Hole);
            ids.push(tables.add_target(GAddr::new(1, i + 1), r).unwrap());
        }
        for id in ids.iter().step_by(2) {
            tables.remove(*id).unwrap();
        }
        assert_eq!(tables.len(), 30);
        tables.check_consistency().unwrap();
        assert!(tables.get(ids[0]).is_err());
    }

    #[test]
    fn clearing_marks_touches_every_global() {
        let mut heap = Heap::new();
        let mut tables = AddressTables::new(0);
        let a = tables.make_phys(heap.cons(Pntr::number(1.0), heap.nil()));
        let b = tables.add_target(GAddr::new(2, 1), heap.alloc(CellKind::Hole)).unwrap();
        let a = tables.lookup_addr(a).unwrap();
        tables.get_mut(a).unwrap().dist_marked = true;
        tables.get_mut(b).unwrap().dist_marked = true;
        tables.clear_dist_marks();
        assert!(tables.iter().all(|(_, g)| !g.dist_marked));
    }
}
