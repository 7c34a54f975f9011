//! The object protocol: FETCH / RESPOND for reading remote values,
//! SCHEDULE / UPDATEREF for handing unstarted frames to another task.

use tracing::{debug, trace, warn};

use super::exec::Demand;
use super::{FrameState, Task};
use crate::addr::{Fetcher, GAddr, GlobalId, TaskId};
use crate::error::RtResult;
use crate::fatal;
use crate::heap::{CellId, CellKind, Pntr, PntrKind};
use crate::wire::{Message, ScheduledFrame, WireValue};

impl Task {
    /// Ask the owner of `gid` for its value. `cell` is the local remote cell
    /// the answer will overwrite.
    pub(crate) fn fetch(&mut self, gid: GlobalId, cell: CellId) -> RtResult<()> {
        let store = self.globals.make_phys(Pntr::cell(cell));
        let g = self.globals.get_mut(gid)?;
        if g.pending {
            return Err(fatal!("fetch of {} before its new owner replied", g.addr));
        }
        g.fetching = true;
        let target = g.addr;
        self.stats.fetches += 1;
        debug!(target: "nreduce::proto", tid = self.tid, %target, %store, "proto.fetch");
        self.send(target.tid, Message::Fetch { target, store })
    }

    fn respond(&mut self, fetcher: Fetcher, value: WireValue) -> RtResult<()> {
        self.send(
            fetcher.task,
            Message::Respond {
                store: fetcher.store,
                value,
            },
        )
    }

    pub(crate) fn handle_fetch(&mut self, from: TaskId, target: GAddr, store: GAddr) -> RtResult<()> {
        if target.tid != self.tid {
            return Err(fatal!("task {} fetched {} from the wrong owner", from, target));
        }
        let gid = self.globals.lookup_addr(target)?;
        let p = self.globals.get(gid)?.p;
        self.serve_fetch(Fetcher { task: from, store }, p)
    }

    /// Answer a fetch for `p` now if it is a value, otherwise queue the
    /// fetcher on whatever will produce it. Unstarted frames are handed over
    /// whole rather than evaluated here.
    pub(crate) fn serve_fetch(&mut self, fetcher: Fetcher, p: Pntr) -> RtResult<()> {
        loop {
            let p = self.heap.resolve(p)?;
            let id = match p.kind() {
                PntrKind::Number(n) => return self.respond(fetcher, WireValue::Number(n)),
                PntrKind::Cell(id) => id,
            };
            match self.demand(id)? {
                Demand::Whnf => {
                    if let CellKind::SysObject(_) = self.heap.raw(id)? {
                        warn!(target: "nreduce::proto", tid = self.tid, "proto.sysobject_fetched");
                        return self.respond(fetcher, WireValue::Nil);
                    }
                    let value = self.export(p)?;
                    return self.respond(fetcher, value);
                }
                d @ (Demand::Apply(..) | Demand::Call(_)) => {
                    self.thunk_to_frame(id, d)?;
                }
                Demand::Frame(fid) => {
                    if self.frames.state(fid)?.is_unstarted() {
                        return self.hand_over(fetcher, fid, id);
                    }
                    trace!(target: "nreduce::proto", tid = self.tid, frame = %fid, "proto.fetch_waits_on_frame");
                    self.frames.get_mut(fid)?.wq.fetchers.push(fetcher);
                    return Ok(());
                }
                Demand::Remote(gid) => {
                    let g = self.globals.get_mut(gid)?;
                    g.wq.fetchers.push(fetcher);
                    if !g.fetching && !g.pending {
                        self.fetch(gid, id)?;
                    }
                    return Ok(());
                }
                Demand::Hole => {
                    let hole = self
                        .holes
                        .get_mut(&id)
                        .ok_or_else(|| fatal!("hole at cell {} has no owner", id.0))?;
                    hole.wq.fetchers.push(fetcher);
                    return Ok(());
                }
            }
        }
    }

    /// Migrate an unstarted frame to the task that asked for its value. The
    /// local cell becomes a reference to the fetcher's copy.
    fn hand_over(&mut self, fetcher: Fetcher, fid: super::FrameId, cell: CellId) -> RtResult<()> {
        if self.frames.state(fid)? == FrameState::Sparked {
            self.sparks.retain(|f| *f != fid);
        }
        let frame = self.export_frame(fid, fetcher.store)?;
        self.frames.release(fid)?;
        match self.globals.find_addr(fetcher.store) {
            Some(existing) => {
                let p = self.globals.get(existing)?.p;
                self.heap.make_ind(cell, p)?;
            }
            None => {
                let gid = self.globals.add_target(fetcher.store, Pntr::cell(cell))?;
                self.heap.set(cell, CellKind::Remote(gid))?;
            }
        }
        self.stats.frames_sent += 1;
        debug!(target: "nreduce::proto", tid = self.tid, to = fetcher.task, frame = %fid, "proto.frame_handed_over");
        self.respond(fetcher, frame)
    }

    pub(crate) fn handle_respond(&mut self, store: GAddr, value: WireValue) -> RtResult<()> {
        let rg = self.globals.lookup_addr(store)?;
        let r = self.globals.get(rg)?.p;
        let rid = r
            .as_cell()
            .ok_or_else(|| fatal!("RESPOND for {} which names a number", store))?;
        let gt = match self.heap.raw(rid)? {
            CellKind::Remote(g) => *g,
            other => return Err(fatal!("RESPOND for {} which holds a {}", store, other.name())),
        };
        // Drop the stand-in first so an answer carrying the same address
        // builds a fresh replica instead of resolving to the remote cell.
        let g = self.globals.remove(gt)?;
        trace!(target: "nreduce::proto", tid = self.tid, %store, from = %g.addr, "proto.respond");

        if let WireValue::Frame { .. } = value {
            let (fid, cell) = self.import_frame(value)?;
            self.heap.make_ind(rid, Pntr::cell(cell))?;
            self.frames.get_mut(fid)?.wq = g.wq;
            self.make_ready(fid)?;
            self.stats.frames_received += 1;
            return Ok(());
        }

        let v = self.import(value)?;
        if self.heap.resolve(v)? == r {
            return Err(fatal!("RESPOND for {} resolved to its own remote cell", store));
        }
        self.heap.make_ind(rid, v)?;
        self.wake(g.wq, r)
    }

    pub(crate) fn handle_schedule(&mut self, from: TaskId, frames: Vec<ScheduledFrame>) -> RtResult<()> {
        debug!(target: "nreduce::sched", tid = self.tid, from, count = frames.len(), "sched.received");
        for sf in frames {
            let (fid, cell) = self.import_frame(sf.frame)?;
            let addr = self.globals.make_phys(Pntr::cell(cell));
            self.send(from, Message::UpdateRef { tell: sf.tell, addr })?;
            self.make_ready(fid)?;
            self.stats.frames_received += 1;
        }
        Ok(())
    }

    pub(crate) fn handle_update_ref(&mut self, tell: GAddr, addr: GAddr) -> RtResult<()> {
        let gid = self.globals.resolve_pending(tell)?;
        let target = match self.globals.find_addr(addr) {
            Some(existing) => {
                let mut old = self.globals.remove(gid)?;
                let old_cell = old
                    .p
                    .as_cell()
                    .ok_or_else(|| fatal!("pending reference {} stood for a number", tell))?;
                let p = self.globals.get(existing)?.p;
                self.heap.make_ind(old_cell, p)?;
                self.globals.get_mut(existing)?.wq.append(&mut old.wq);
                trace!(target: "nreduce::proto", tid = self.tid, %tell, %addr, "proto.update_ref_merged");
                existing
            }
            None => {
                self.globals.bind_addr(gid, addr)?;
                trace!(target: "nreduce::proto", tid = self.tid, %tell, %addr, "proto.update_ref");
                gid
            }
        };

        let g = self.globals.get(target)?;
        if g.wq.is_empty() || g.fetching {
            return Ok(());
        }
        let p = self.heap.resolve(g.p)?;
        match p.as_cell() {
            Some(cell) if matches!(self.heap.raw(cell)?, CellKind::Remote(_)) => self.fetch(target, cell),
            _ => {
                // merged into a replica that is already a value
                let wq = std::mem::take(&mut self.globals.get_mut(target)?.wq);
                self.wake(wq, p)
            }
        }
    }
}
