//! Distributed mark/sweep over physical addresses.
//!
//! Local collection treats every address handed out to another task as a
//! root. This collector finds out which of those are still referenced
//! anywhere in the group. Task 0 coordinates each epoch:
//!
//! 1. STARTDISTGC: every task stops mutating its heap (heap messages are
//!    deferred), clears its marks and acknowledges.
//! 2. MARKROOTS: every task marks from its own roots, including the
//!    addresses of its unacknowledged messages, and sends MARKENTRY to the
//!    owners of remote objects it reaches. Each task reports its per-peer
//!    sent/received MARKENTRY counters in GCUPDATE after every step,
//!    flagging whether it has marked its own roots yet.
//! 3. SWEEP: once every task has marked its roots and all counters
//!    balance, no marks are in flight. Unmarked physical addresses are dropped and
//!    normal operation resumes.

use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use super::Task;
use crate::addr::{GAddr, TaskId};
use crate::error::RtResult;
use crate::fatal;
use crate::heap::{CellId, Pntr};
use crate::wire::{GcPhase, Message};

#[derive(Debug)]
enum Phase {
    Idle,
    Starting { acks: u32 },
    Marking { reports: Vec<Option<Report>> },
    Sweeping { acks: u32 },
}

/// The latest GCUPDATE from one task.
#[derive(Debug, Clone)]
pub(crate) struct Report {
    pub sent: Vec<u64>,
    pub received: Vec<u64>,
    pub roots_marked: bool,
}

#[derive(Debug)]
struct Coordinator {
    interval: Duration,
    last: Instant,
    phase: Phase,
}

#[derive(Debug)]
pub(crate) struct DistGc {
    /// Set between STARTDISTGC and SWEEP.
    pub active: bool,
    pub epoch: u32,
    sent: Vec<u64>,
    received: Vec<u64>,
    roots_marked: bool,
    visited: FxHashSet<CellId>,
    coordinator: Option<Coordinator>,
}

impl DistGc {
    pub fn new(tid: TaskId, ntasks: u32, interval: Option<Duration>) -> Self {
        let coordinator = match interval {
            Some(interval) if tid == 0 && ntasks > 1 => Some(Coordinator {
                interval,
                last: Instant::now(),
                phase: Phase::Idle,
            }),
            _ => None,
        };
        Self {
            active: false,
            epoch: 0,
            sent: vec![0; ntasks as usize],
            received: vec![0; ntasks as usize],
            roots_marked: false,
            visited: FxHashSet::default(),
            coordinator,
        }
    }

    #[cfg(test)]
    pub fn is_coordinating(&self) -> bool {
        matches!(&self.coordinator, Some(c) if !matches!(c.phase, Phase::Idle))
    }
}

/// Every task has marked its roots and every sent count is matched by the
/// receiver's received count.
fn balanced(reports: &[Option<Report>]) -> bool {
    let mut all = Vec::with_capacity(reports.len());
    for r in reports {
        match r {
            Some(r) if r.roots_marked => all.push(r),
            _ => return false,
        }
    }
    for (i, from) in all.iter().enumerate() {
        for (j, to) in all.iter().enumerate() {
            if from.sent.get(j) != to.received.get(i) {
                return false;
            }
        }
    }
    true
}

impl Task {
    /// Coordinator side: start an epoch when one is due.
    pub(crate) fn dgc_tick(&mut self) -> RtResult<()> {
        let due = match &self.dgc.coordinator {
            Some(c) => matches!(c.phase, Phase::Idle) && c.last.elapsed() >= c.interval,
            None => false,
        };
        if !due || self.shutdown || self.finished.is_some() {
            return Ok(());
        }
        self.begin_dist_gc()
    }

    pub(crate) fn begin_dist_gc(&mut self) -> RtResult<()> {
        let Some(c) = self.dgc.coordinator.as_mut() else {
            return Err(fatal!("task {} does not coordinate distributed collection", self.tid));
        };
        if !matches!(c.phase, Phase::Idle) {
            return Ok(());
        }
        c.phase = Phase::Starting { acks: 0 };
        self.dgc.epoch += 1;
        self.stats.dist_epochs += 1;
        let epoch = self.dgc.epoch;
        debug!(target: "nreduce::dgc", epoch, "dgc.epoch_start");
        for t in 0..self.ntasks {
            self.send(t, Message::StartDistGc { epoch })?;
        }
        Ok(())
    }

    pub(crate) fn handle_start_dist_gc(&mut self, epoch: u32) -> RtResult<()> {
        let dgc = &mut self.dgc;
        dgc.active = true;
        dgc.epoch = epoch;
        dgc.sent.iter_mut().for_each(|n| *n = 0);
        dgc.received.iter_mut().for_each(|n| *n = 0);
        dgc.roots_marked = false;
        dgc.visited.clear();
        self.globals.clear_dist_marks();
        trace!(target: "nreduce::dgc", tid = self.tid, epoch, "dgc.started");
        self.send(
            0,
            Message::GcAck {
                epoch,
                phase: GcPhase::Started,
            },
        )
    }

    fn dist_roots(&self) -> Vec<Pntr> {
        let mut roots = Vec::new();
        for (_, frame) in self.frames.iter() {
            if frame.state == super::FrameState::New {
                continue;
            }
            roots.extend_from_slice(&frame.slots);
            if let Some(cell) = frame.cell() {
                roots.push(Pntr::cell(cell));
            }
        }
        for (_, g) in self.globals.iter() {
            if !g.owned && (g.fetching || g.pending || !g.wq.is_empty()) {
                roots.push(g.p);
            }
        }
        if let Some(collector) = &self.collector {
            collector.roots(&mut roots);
        }
        roots
    }

    /// Mark everything reachable from `stack`, queueing the addresses of
    /// remote objects for their owners.
    fn dist_traverse(&mut self, mut stack: Vec<Pntr>, outgoing: &mut [Vec<GAddr>]) -> RtResult<()> {
        while let Some(p) = stack.pop() {
            let Some(id) = p.as_cell() else { continue };
            if !self.heap.contains(p) || !self.dgc.visited.insert(id) {
                continue;
            }
            if let Some(gid) = self.globals.phys_of(p) {
                self.globals.get_mut(gid)?.dist_marked = true;
            }
            if let Some(gid) = self.globals.target_of(p) {
                let g = self.globals.get(gid)?;
                if !g.pending {
                    let owner = g.addr.tid as usize;
                    outgoing
                        .get_mut(owner)
                        .ok_or_else(|| fatal!("address {} names an unknown task", g.addr))?
                        .push(g.addr);
                }
            }
            self.heap.trace_children(id, &self.frames, &mut stack)?;
        }
        Ok(())
    }

    /// Mark an address owned by this task and what it reaches. Unknown
    /// addresses are skipped: they belong to migrations not yet named.
    fn mark_owned(&mut self, addr: GAddr, outgoing: &mut [Vec<GAddr>]) -> RtResult<()> {
        let Some(gid) = self.globals.find_addr(addr) else {
            trace!(target: "nreduce::dgc", tid = self.tid, %addr, "dgc.mark_unknown");
            return Ok(());
        };
        let g = self.globals.get_mut(gid)?;
        g.dist_marked = true;
        let p = g.p;
        self.dist_traverse(vec![p], outgoing)
    }

    fn flush_marks(&mut self, outgoing: Vec<Vec<GAddr>>) -> RtResult<()> {
        let epoch = self.dgc.epoch;
        for (owner, addrs) in outgoing.into_iter().enumerate() {
            if addrs.is_empty() {
                continue;
            }
            self.dgc.sent[owner] += addrs.len() as u64;
            self.send(owner as TaskId, Message::MarkEntry { epoch, addrs })?;
        }
        let report = Message::GcUpdate {
            epoch,
            sent: self.dgc.sent.clone(),
            received: self.dgc.received.clone(),
            roots_marked: self.dgc.roots_marked,
        };
        self.send(0, report)
    }

    pub(crate) fn handle_mark_roots(&mut self, epoch: u32) -> RtResult<()> {
        if !self.dgc.active || epoch != self.dgc.epoch {
            return Err(fatal!("MARKROOTS for epoch {} outside a collection", epoch));
        }
        let mut outgoing = vec![Vec::new(); self.ntasks as usize];
        let roots = self.dist_roots();
        self.dist_traverse(roots, &mut outgoing)?;

        let inflight: Vec<GAddr> = self
            .links
            .iter()
            .flat_map(|l| l.inflight.iter().flatten().copied())
            .collect();
        for addr in inflight {
            if addr.tid == self.tid {
                self.mark_owned(addr, &mut outgoing)?;
            } else {
                outgoing[addr.tid as usize].push(addr);
            }
        }
        self.dgc.roots_marked = true;
        trace!(target: "nreduce::dgc", tid = self.tid, epoch, visited = self.dgc.visited.len(), "dgc.marked_roots");
        self.flush_marks(outgoing)
    }

    pub(crate) fn handle_mark_entry(&mut self, from: TaskId, epoch: u32, addrs: Vec<GAddr>) -> RtResult<()> {
        if !self.dgc.active || epoch != self.dgc.epoch {
            return Err(fatal!("MARKENTRY from task {} for epoch {} outside a collection", from, epoch));
        }
        self.dgc.received[from as usize] += addrs.len() as u64;
        let mut outgoing = vec![Vec::new(); self.ntasks as usize];
        for addr in addrs {
            if addr.tid != self.tid {
                return Err(fatal!("MARKENTRY for {} sent to task {}", addr, self.tid));
            }
            self.mark_owned(addr, &mut outgoing)?;
        }
        self.flush_marks(outgoing)
    }

    pub(crate) fn handle_sweep(&mut self, epoch: u32) -> RtResult<()> {
        if !self.dgc.active || epoch != self.dgc.epoch {
            return Err(fatal!("SWEEP for epoch {} outside a collection", epoch));
        }
        let dead: Vec<_> = self
            .globals
            .iter()
            .filter(|(_, g)| g.owned && !g.dist_marked && g.wq.is_empty())
            .map(|(id, _)| id)
            .collect();
        for gid in &dead {
            self.globals.remove(*gid)?;
        }
        self.dgc.active = false;
        self.dgc.visited.clear();
        debug!(
            target: "nreduce::dgc",
            tid = self.tid,
            epoch,
            swept = dead.len(),
            globals = self.globals.len(),
            deferred = self.deferred.len(),
            "dgc.swept"
        );
        self.send(
            0,
            Message::GcAck {
                epoch,
                phase: GcPhase::Swept,
            },
        )?;
        self.replay_deferred()
    }

    pub(crate) fn handle_gc_update(&mut self, from: TaskId, epoch: u32, report: Report) -> RtResult<()> {
        let ntasks = self.ntasks;
        let current = self.dgc.epoch;
        let Some(c) = self.dgc.coordinator.as_mut() else {
            return Err(fatal!("GCUPDATE sent to task {}", self.tid));
        };
        if epoch != current {
            return Ok(());
        }
        let Phase::Marking { reports } = &mut c.phase else {
            return Ok(());
        };
        let slot = reports
            .get_mut(from as usize)
            .ok_or_else(|| fatal!("GCUPDATE from unknown task {}", from))?;
        *slot = Some(report);
        if !balanced(reports) {
            return Ok(());
        }
        c.phase = Phase::Sweeping { acks: 0 };
        debug!(target: "nreduce::dgc", epoch, "dgc.sweep");
        for t in 0..ntasks {
            self.send(t, Message::Sweep { epoch })?;
        }
        Ok(())
    }

    pub(crate) fn handle_gc_ack(&mut self, from: TaskId, epoch: u32, phase: GcPhase) -> RtResult<()> {
        let ntasks = self.ntasks;
        let current = self.dgc.epoch;
        let Some(c) = self.dgc.coordinator.as_mut() else {
            return Err(fatal!("GCACK sent to task {}", self.tid));
        };
        if epoch != current {
            return Ok(());
        }
        let next = match (&mut c.phase, phase) {
            (Phase::Starting { acks }, GcPhase::Started) => {
                *acks += 1;
                if *acks < ntasks {
                    return Ok(());
                }
                Phase::Marking {
                    reports: vec![None; ntasks as usize],
                }
            }
            (Phase::Sweeping { acks }, GcPhase::Swept) => {
                *acks += 1;
                if *acks < ntasks {
                    return Ok(());
                }
                Phase::Idle
            }
            (_, phase) => return Err(fatal!("unexpected GCACK {:?} from task {} in epoch {}", phase, from, epoch)),
        };
        let marking = matches!(next, Phase::Marking { .. });
        c.phase = next;
        if !marking {
            c.last = Instant::now();
            debug!(target: "nreduce::dgc", epoch, "dgc.epoch_done");
            return Ok(());
        }
        trace!(target: "nreduce::dgc", epoch, "dgc.mark");
        for t in 0..ntasks {
            self.send(t, Message::MarkRoots { epoch })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_needs_every_report() {
        let a = report(vec![0, 2], vec![0, 0], true);
        let b = report(vec![0, 0], vec![2, 0], true);
        assert!(balanced(&[a.clone(), b.clone()]));
        assert!(!balanced(&[a.clone(), None]));
        let lagging = report(vec![0, 0], vec![1, 0], true);
        assert!(!balanced(&[a, lagging]));
    }

    #[test]
    fn balance_needs_every_task_to_have_marked_its_roots() {
        let a = report(vec![0, 2], vec![0, 0], true);
        let early = report(vec![0, 0], vec![2, 0], false);
        assert!(!balanced(&[a, early]));
    }

    fn report(sent: Vec<u64>, received: Vec<u64>, roots_marked: bool) -> Option<Report> {
        Some(Report {
            sent,
            received,
            roots_marked,
        })
    }

    #[test]
    fn only_task_zero_of_a_group_coordinates() {
        let every = Some(Duration::from_millis(10));
        assert!(DistGc::new(0, 2, every).coordinator.is_some());
        assert!(DistGc::new(1, 2, every).coordinator.is_none());
        assert!(DistGc::new(0, 1, every).coordinator.is_none());
        assert!(DistGc::new(0, 2, None).coordinator.is_none());
    }
}
