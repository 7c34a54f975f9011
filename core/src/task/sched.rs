//! Local scheduling and work stealing.
//!
//! Runnable frames are served first-come first-served in slices of
//! `config.slice` instructions. When nothing is runnable the task takes its
//! newest spark, and when it has no sparks either it sends a FISH to a random
//! peer, which answers by migrating its oldest sparks.

use std::time::Instant;

use rand::Rng;
use tracing::{debug, trace};

use super::{FrameState, Task};
use crate::addr::TaskId;
use crate::error::RtResult;
use crate::fatal;
use crate::heap::{CellKind, Pntr};
use crate::wire::{Message, ScheduledFrame};

impl Task {
    /// Pick the next frame to run. Returns false when there is nothing to do.
    pub(crate) fn schedule_next(&mut self) -> RtResult<bool> {
        if self.running.is_some() {
            return Ok(true);
        }
        while let Some(fid) = self.run_queue.pop_front() {
            if !self.frames.contains(fid) || self.frames.state(fid)? != FrameState::Ready {
                continue;
            }
            self.frames.transition(fid, FrameState::Running)?;
            self.running = Some(fid);
            return Ok(true);
        }
        if let Some(fid) = self.sparks.pop_back() {
            trace!(target: "nreduce::sched", tid = self.tid, frame = %fid, "sched.run_spark");
            self.frames.transition(fid, FrameState::Running)?;
            self.running = Some(fid);
            return Ok(true);
        }
        Ok(false)
    }

    /// Run up to one slice of instructions. Returns whether anything ran.
    pub(crate) fn run_slice(&mut self) -> RtResult<bool> {
        let mut steps = 0;
        while steps < self.config.slice {
            if !self.schedule_next()? {
                break;
            }
            let Some(fid) = self.running else { break };
            self.step(fid)?;
            steps += 1;
        }
        if let Some(fid) = self.running.take() {
            self.frames.transition(fid, FrameState::Ready)?;
            self.run_queue.push_back(fid);
        }
        Ok(steps > 0)
    }

    fn random_peer(&mut self, exclude: &[TaskId]) -> Option<TaskId> {
        let candidates: Vec<TaskId> = (0..self.ntasks).filter(|t| !exclude.contains(t)).collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.gen_range(0..candidates.len())])
    }

    /// Ask a random peer for work if this task has been idle long enough.
    pub(crate) fn maybe_fish(&mut self) -> RtResult<()> {
        if self.ntasks < 2
            || self.shutdown
            || self.running.is_some()
            || !self.run_queue.is_empty()
            || !self.sparks.is_empty()
        {
            return Ok(());
        }
        if let Some(last) = self.last_fish {
            if last.elapsed() < self.config.fish_interval() {
                return Ok(());
            }
        }
        let Some(peer) = self.random_peer(&[self.tid]) else {
            return Ok(());
        };
        self.last_fish = Some(Instant::now());
        self.stats.fish_sent += 1;
        trace!(target: "nreduce::sched", tid = self.tid, peer, "sched.fish");
        self.send(
            peer,
            Message::Fish {
                from: self.tid,
                hops: self.config.fish_hops,
                count: self.config.fish_count,
            },
        )
    }

    pub(crate) fn handle_fish(&mut self, origin: TaskId, hops: u32, count: u32) -> RtResult<()> {
        if origin == self.tid {
            return Ok(());
        }
        if !self.sparks.is_empty() {
            return self.migrate(origin, count as usize);
        }
        if hops == 0 {
            return Ok(());
        }
        match self.random_peer(&[self.tid, origin]) {
            Some(peer) => self.send(
                peer,
                Message::Fish {
                    from: origin,
                    hops: hops - 1,
                    count,
                },
            ),
            None => Ok(()),
        }
    }

    /// Send up to `count` of the oldest sparks to `to`. Each migrated cell
    /// becomes a pending remote reference until the receiver names it.
    pub(crate) fn migrate(&mut self, to: TaskId, count: usize) -> RtResult<()> {
        let mut frames = Vec::new();
        while frames.len() < count {
            let Some(fid) = self.sparks.pop_front() else { break };
            if self.frames.state(fid)? != FrameState::Sparked {
                return Err(fatal!("spark {} is {:?}", fid, self.frames.state(fid)?));
            }
            let cell = self
                .frames
                .get(fid)?
                .cell()
                .ok_or_else(|| fatal!("spark {} has no cell", fid))?;
            let (gid, tell) = self.globals.add_pending_target(Pntr::cell(cell))?;
            let frame = self.export_frame(fid, tell)?;
            self.frames.release(fid)?;
            self.heap.set(cell, CellKind::Remote(gid))?;
            frames.push(ScheduledFrame { tell, frame });
        }
        if frames.is_empty() {
            return Ok(());
        }
        self.stats.frames_sent += frames.len() as u64;
        debug!(
            target: "nreduce::sched",
            tid = self.tid,
            to,
            count = frames.len(),
            kept = self.sparks.len(),
            "sched.migrate"
        );
        self.send(to, Message::Schedule { frames })
    }
}
