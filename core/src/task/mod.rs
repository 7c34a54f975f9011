//! One task of a group: a heap, its frames, and the loop that drives them.
//!
//! A task is single threaded. It alternates between draining its mailbox
//! (protocol messages, I/O completions) and running the current frame for
//! a bounded slice of instructions. All cross-task interaction goes through
//! `send`, which is also where in-flight addresses are tracked for the
//! distributed collector.

mod bif;
mod collect;
mod dgc;
mod exec;
mod export;
mod frame;
mod gc;
mod proto;
mod sched;
mod sysobj;

#[cfg(test)]
pub(crate) mod testkit;

#[cfg(test)]
mod dgc_test;

pub use frame::{Frame, FrameArena, FrameId, FrameState, ResultDest};
pub use sysobj::{SysObject, SysObjectId, SysObjectKind, SysObjects};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::addr::{AddressTables, GAddr, TaskId, WaitQueue};
use crate::config::RuntimeConfig;
use crate::error::{RtResult, RuntimeError, TaskError};
use crate::fatal;
use crate::heap::{CellId, Heap};
use crate::net::{Endpoint, Incoming, IoCompletion};
use crate::program::LoadedProgram;
use crate::value::Value;
use crate::wire::{Message, decode_message, encode_message};

use collect::Collector;
use dgc::{DistGc, Report};

/// How long a task keeps running after a peer vanished, waiting for the
/// SHUTDOWN that usually explains it.
const PEER_LOSS_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub instructions: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub fetches: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub fish_sent: u64,
    pub minor_gcs: u64,
    pub major_gcs: u64,
    pub dist_epochs: u64,
}

/// What a task hands back once the group shuts down. Only task 0 carries a result.
#[derive(Debug)]
pub struct RunOutput {
    pub tid: TaskId,
    pub result: Option<Result<Value, TaskError>>,
    pub output: Vec<u8>,
    pub stats: TaskStats,
}

/// An unfilled letrec placeholder and whoever is waiting for it.
#[derive(Debug)]
pub(crate) struct Hole {
    pub creator: FrameId,
    pub wq: WaitQueue,
}

/// Per-peer bookkeeping for acknowledged messages.
#[derive(Debug, Default)]
pub(crate) struct PeerLink {
    /// Addresses of every counted message sent and not yet acknowledged, oldest first.
    pub inflight: VecDeque<Vec<GAddr>>,
    pub unacked: u32,
    pub unacked_addrs: u32,
}

pub struct Task {
    pub(crate) tid: TaskId,
    pub(crate) ntasks: u32,
    pub(crate) program: Arc<LoadedProgram>,
    pub(crate) config: RuntimeConfig,
    pub(crate) heap: Heap,
    pub(crate) frames: FrameArena,
    pub(crate) globals: AddressTables,
    pub(crate) sysobjects: SysObjects,
    endpoint: Box<dyn Endpoint>,
    mailbox: Receiver<Incoming>,
    pub(crate) running: Option<FrameId>,
    pub(crate) run_queue: VecDeque<FrameId>,
    pub(crate) sparks: VecDeque<FrameId>,
    pub(crate) holes: FxHashMap<CellId, Hole>,
    pub(crate) links: Vec<PeerLink>,
    pub(crate) dgc: DistGc,
    deferred: VecDeque<(TaskId, Message)>,
    local: VecDeque<Message>,
    pub(crate) collector: Option<Collector>,
    pub(crate) error: Option<TaskError>,
    pub(crate) output: Vec<u8>,
    pub(crate) finished: Option<Result<Value, TaskError>>,
    shutdown: bool,
    lost_peer: Option<(TaskId, Instant)>,
    pub(crate) rng: StdRng,
    pub(crate) last_fish: Option<Instant>,
    minors_since_major: u32,
    pub(crate) stats: TaskStats,
}

impl Task {
    pub fn new(
        tid: TaskId,
        ntasks: u32,
        program: Arc<LoadedProgram>,
        config: RuntimeConfig,
        endpoint: Box<dyn Endpoint>,
        mailbox: Receiver<Incoming>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(tid as u64)),
            None => StdRng::from_entropy(),
        };
        let dgc = DistGc::new(tid, ntasks, config.dist_gc_interval());
        Self {
            tid,
            ntasks,
            program,
            config,
            heap: Heap::new(),
            frames: FrameArena::new(),
            globals: AddressTables::new(tid),
            sysobjects: SysObjects::new(),
            endpoint,
            mailbox,
            running: None,
            run_queue: VecDeque::new(),
            sparks: VecDeque::new(),
            holes: FxHashMap::default(),
            links: (0..ntasks).map(|_| PeerLink::default()).collect(),
            dgc,
            deferred: VecDeque::new(),
            local: VecDeque::new(),
            collector: None,
            error: None,
            output: Vec::new(),
            finished: None,
            shutdown: false,
            lost_peer: None,
            rng,
            last_fish: None,
            minors_since_major: 0,
            stats: TaskStats::default(),
        }
    }

    pub fn tid(&self) -> TaskId {
        self.tid
    }

    /// Run until the group shuts down. Task 0 evaluates `main` and decides
    /// when that is; every other task serves requests until told to stop.
    pub fn run(mut self) -> Result<RunOutput> {
        info!(target: "nreduce::task", tid = self.tid, ntasks = self.ntasks, "task.start");
        if self.tid == 0 {
            let booted = self.boot();
            self.settle(booted)?;
        }
        loop {
            let handled = self.drain()?;
            let flushed = self.flush_acks();
            self.settle(flushed)?;
            if self.shutdown {
                break;
            }
            if self.tid == 0 && self.finished.is_some() {
                let stopped = self.broadcast_shutdown();
                self.settle(stopped)?;
                break;
            }
            if let Some((peer, since)) = self.lost_peer {
                if since.elapsed() >= PEER_LOSS_GRACE {
                    return Err(anyhow!("task {}: lost connection to task {}", self.tid, peer));
                }
            }

            let mut worked = false;
            if !self.dgc.active && self.error.is_none() {
                let ran = self.run_slice();
                worked = self.settle(ran)?;
                let collected = self.maybe_collect();
                self.settle(collected)?;
                let fished = self.maybe_fish();
                self.settle(fished)?;
            }
            let ticked = self.dgc_tick();
            self.settle(ticked)?;
            if self.tid == 0 && !self.dgc.active {
                let polled = self.poll_collector();
                self.settle(polled)?;
            }

            if !worked && handled == 0 && self.local.is_empty() && !self.runnable() {
                match self.mailbox.recv_timeout(self.config.idle_timeout()) {
                    Ok(incoming) => {
                        let r = self.on_incoming(incoming);
                        self.settle(r)?;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(anyhow!("task {}: mailbox closed", self.tid));
                    }
                }
            }
        }
        info!(
            target: "nreduce::task",
            tid = self.tid,
            instructions = self.stats.instructions,
            sent = self.stats.messages_sent,
            received = self.stats.messages_received,
            "task.stop"
        );
        Ok(RunOutput {
            tid: self.tid,
            result: self.finished.take(),
            output: std::mem::take(&mut self.output),
            stats: self.stats.clone(),
        })
    }

    /// Whether a time slice could make progress now. Queued frames stay
    /// put during a distributed collection and after an application error.
    pub(crate) fn runnable(&self) -> bool {
        !self.dgc.active && self.error.is_none() && !self.run_queue.is_empty()
    }

    /// Turn an internal result into the loop's view: application errors are
    /// recorded on the task, fatal ones end it.
    fn settle<T: Default>(&mut self, r: RtResult<T>) -> Result<T> {
        match r {
            Ok(v) => Ok(v),
            Err(RuntimeError::Application(message)) => {
                let location = self.location();
                self.fail(message, location)
                    .map_err(|e| anyhow!("task {}: {}", self.tid, e))?;
                Ok(T::default())
            }
            Err(e) => Err(anyhow!("task {}: {}", self.tid, e)),
        }
    }

    fn location(&self) -> String {
        match self.running.and_then(|fid| self.frames.get(fid).ok()) {
            Some(f) => self.program.describe(f.fno, f.pc),
            None => "<task>".into(),
        }
    }

    /// Record an application error and stop scheduling work.
    pub(crate) fn fail(&mut self, message: String, location: String) -> RtResult<()> {
        let error = TaskError {
            task: self.tid,
            message,
            location,
        };
        warn!(target: "nreduce::task", tid = self.tid, error = %error, "task.error");
        self.running = None;
        if self.error.is_some() {
            return Ok(());
        }
        self.error = Some(error.clone());
        if self.tid == 0 {
            if self.finished.is_none() {
                self.finished = Some(Err(error));
            }
            Ok(())
        } else {
            self.send(0, Message::ReportError { error })
        }
    }

    fn broadcast_shutdown(&mut self) -> RtResult<()> {
        debug!(target: "nreduce::task", tid = self.tid, "task.shutdown");
        for peer in 1..self.ntasks {
            self.send(peer, Message::Shutdown)?;
        }
        self.shutdown = true;
        Ok(())
    }

    /// Process everything already queued without blocking.
    fn drain(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            if let Some(msg) = self.local.pop_front() {
                handled += 1;
                let tid = self.tid;
                let r = self.dispatch(tid, msg);
                self.settle(r)?;
                continue;
            }
            if self.shutdown {
                break;
            }
            match self.mailbox.try_recv() {
                Ok(incoming) => {
                    handled += 1;
                    let r = self.on_incoming(incoming);
                    self.settle(r)?;
                }
                Err(_) => break,
            }
        }
        Ok(handled)
    }

    pub(crate) fn on_incoming(&mut self, incoming: Incoming) -> RtResult<()> {
        match incoming {
            Incoming::Frame { from, bytes } => {
                let msg = decode_message(&bytes).map_err(|e| fatal!("bad frame from task {}: {:#}", from, e))?;
                self.dispatch(from, msg)
            }
            Incoming::Io(c) => self.on_io(c),
            Incoming::PeerLost(peer) => {
                if !self.shutdown && self.lost_peer.is_none() {
                    warn!(target: "nreduce::net", tid = self.tid, peer, "task.peer_lost");
                    self.lost_peer = Some((peer, Instant::now()));
                }
                Ok(())
            }
        }
    }

    fn on_io(&mut self, c: IoCompletion) -> RtResult<()> {
        trace!(target: "nreduce::io", tid = self.tid, sysobj = c.sysobj.0, result = ?c.result, "io.completion");
        for fid in self.sysobjects.complete(c) {
            if self.frames.contains(fid) {
                self.make_ready(fid)?;
            }
        }
        Ok(())
    }

    /// Messages that touch the heap wait while a distributed collection is marking.
    fn deferrable(msg: &Message) -> bool {
        matches!(
            msg,
            Message::Fetch { .. }
                | Message::Respond { .. }
                | Message::Schedule { .. }
                | Message::UpdateRef { .. }
                | Message::Fish { .. }
        )
    }

    pub(crate) fn dispatch(&mut self, from: TaskId, msg: Message) -> RtResult<()> {
        if self.dgc.active && Self::deferrable(&msg) {
            trace!(target: "nreduce::dgc", tid = self.tid, from, msg = msg.name(), "dgc.defer");
            self.deferred.push_back((from, msg));
            return Ok(());
        }
        self.stats.messages_received += 1;
        trace!(target: "nreduce::proto", tid = self.tid, from, msg = msg.name(), "msg.recv");
        if msg.is_counted() {
            let addrs = msg.addresses().len() as u32;
            let link = self.link(from)?;
            link.unacked += 1;
            link.unacked_addrs += addrs;
        }
        match msg {
            Message::Fetch { target, store } => self.handle_fetch(from, target, store),
            Message::Respond { store, value } => self.handle_respond(store, value),
            Message::Schedule { frames } => self.handle_schedule(from, frames),
            Message::UpdateRef { tell, addr } => self.handle_update_ref(tell, addr),
            Message::Ack { count, .. } => self.handle_ack(from, count),
            Message::Fish { from: origin, hops, count } => self.handle_fish(origin, hops, count),
            Message::StartDistGc { epoch } => self.handle_start_dist_gc(epoch),
            Message::MarkRoots { epoch } => self.handle_mark_roots(epoch),
            Message::MarkEntry { epoch, addrs } => self.handle_mark_entry(from, epoch, addrs),
            Message::Sweep { epoch } => self.handle_sweep(epoch),
            Message::GcUpdate {
                epoch,
                sent,
                received,
                roots_marked,
            } => self.handle_gc_update(
                from,
                epoch,
                Report {
                    sent,
                    received,
                    roots_marked,
                },
            ),
            Message::GcAck { epoch, phase } => self.handle_gc_ack(from, epoch, phase),
            Message::Output { bytes } => {
                self.output.extend_from_slice(&bytes);
                Ok(())
            }
            Message::ReportError { error } => {
                if self.tid == 0 && self.finished.is_none() {
                    self.finished = Some(Err(error));
                }
                Ok(())
            }
            Message::Shutdown => {
                debug!(target: "nreduce::task", tid = self.tid, from, "task.shutdown_received");
                self.shutdown = true;
                Ok(())
            }
        }
    }

    /// Hand back the messages held during a distributed collection, in arrival order.
    pub(crate) fn replay_deferred(&mut self) -> RtResult<()> {
        while let Some((from, msg)) = self.deferred.pop_front() {
            self.dispatch(from, msg)?;
            if self.dgc.active {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn link(&mut self, peer: TaskId) -> RtResult<&mut PeerLink> {
        self.links
            .get_mut(peer as usize)
            .ok_or_else(|| fatal!("task {} is not a member of this group", peer))
    }

    pub(crate) fn send(&mut self, to: TaskId, msg: Message) -> RtResult<()> {
        self.stats.messages_sent += 1;
        trace!(target: "nreduce::proto", tid = self.tid, to, msg = msg.name(), "msg.send");
        if to == self.tid {
            self.local.push_back(msg);
            return Ok(());
        }
        if msg.is_counted() {
            let addrs = msg.addresses();
            self.link(to)?.inflight.push_back(addrs);
        }
        let frame = encode_message(&msg);
        self.endpoint
            .send_frame(to, frame)
            .map_err(|e| fatal!("sending {} to task {}: {:#}", msg.name(), to, e))
    }

    fn flush_acks(&mut self) -> RtResult<()> {
        for peer in 0..self.ntasks {
            let link = self.link(peer)?;
            if link.unacked == 0 {
                continue;
            }
            let count = std::mem::take(&mut link.unacked);
            let addr_count = std::mem::take(&mut link.unacked_addrs);
            self.send(peer, Message::Ack { count, addr_count })?;
        }
        Ok(())
    }

    fn handle_ack(&mut self, from: TaskId, count: u32) -> RtResult<()> {
        let link = self.link(from)?;
        for _ in 0..count {
            if link.inflight.pop_front().is_none() {
                return Err(fatal!("task {} acknowledged more messages than were sent", from));
            }
        }
        Ok(())
    }

    pub(crate) fn submit_io(&mut self, req: crate::net::IoRequest) -> RtResult<()> {
        self.endpoint
            .submit_io(req)
            .map_err(|e| fatal!("I/O service unavailable: {:#}", e))
    }
}
