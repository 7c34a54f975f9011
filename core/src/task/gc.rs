//! Local collection: gathers the task's roots, runs the heap collector and
//! cleans up the tables that point into the heap.

use tracing::debug;

use super::Task;
use crate::addr::GlobalId;
use crate::error::RtResult;
use crate::fatal;
use crate::heap::{CollectScope, Pntr};
use crate::net::{IoOp, IoRequest};

impl Task {
    pub(crate) fn maybe_collect(&mut self) -> RtResult<()> {
        if self.dgc.active || !self.heap.minor_due(self.config.minor_gc_threshold) {
            return Ok(());
        }
        self.minors_since_major += 1;
        let scope = if self.minors_since_major >= self.config.major_every.max(1) {
            self.minors_since_major = 0;
            CollectScope::Major
        } else {
            CollectScope::Minor
        };
        self.collect_garbage(scope)
    }

    /// Everything the task itself keeps alive. Unstarted frames are only live
    /// through their cells; holes only through whoever references them.
    pub(crate) fn local_roots(&self) -> Vec<Pntr> {
        let mut roots = Vec::new();
        for (_, frame) in self.frames.iter() {
            if frame.state.is_unstarted() {
                continue;
            }
            roots.extend_from_slice(&frame.slots);
            if let Some(cell) = frame.cell() {
                roots.push(Pntr::cell(cell));
            }
        }
        for (_, g) in self.globals.iter() {
            if g.owned || g.fetching || g.pending || !g.wq.is_empty() {
                roots.push(g.p);
            }
        }
        if let Some(collector) = &self.collector {
            collector.roots(&mut roots);
        }
        roots
    }

    pub(crate) fn collect_garbage(&mut self, scope: CollectScope) -> RtResult<()> {
        let roots = self.local_roots();
        let report = self.heap.collect(&roots, &self.frames, scope);
        match scope {
            CollectScope::Minor => self.stats.minor_gcs += 1,
            CollectScope::Major => self.stats.major_gcs += 1,
        }

        for fid in report.freed_frames {
            if !self.frames.contains(fid) {
                continue;
            }
            let state = self.frames.state(fid)?;
            if !state.is_unstarted() {
                return Err(fatal!("collected the cell of {:?} frame {}", state, fid));
            }
            self.sparks.retain(|f| *f != fid);
            self.frames.release(fid)?;
        }
        for sid in report.freed_sysobjects {
            if self.sysobjects.release(sid) {
                self.submit_io(IoRequest {
                    sysobj: sid,
                    op: IoOp::Close,
                })?;
            }
        }

        let dead: Vec<GlobalId> = self
            .globals
            .iter()
            .filter(|(_, g)| !g.owned && !self.heap.contains(g.p))
            .map(|(id, _)| id)
            .collect();
        for gid in &dead {
            self.globals.remove(*gid)?;
        }
        let heap = &self.heap;
        self.holes.retain(|cell, _| heap.contains(Pntr::cell(*cell)));

        debug!(
            target: "nreduce::gc",
            tid = self.tid,
            ?scope,
            freed = report.freed,
            live = self.heap.live_cells(),
            frames = self.frames.len(),
            globals = self.globals.len(),
            dropped_targets = dead.len(),
            "gc.local"
        );
        Ok(())
    }
}
