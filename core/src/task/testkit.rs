//! In-process harness for driving tasks by hand.
//!
//! Tasks get an endpoint that records what they send instead of delivering
//! it, so tests can inspect, hold back or reorder messages before handing
//! them to the receiver with `Cluster::pump`.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use crossbeam::channel::{Sender, unbounded};

use super::Task;
use crate::addr::TaskId;
use crate::config::RuntimeConfig;
use crate::error::TaskError;
use crate::heap::{CellKind, Pntr, View};
use crate::net::{Endpoint, Incoming, IoRequest};
use crate::program::{CmpOp, Instr, Program, ProgramBuilder};
use crate::value::Value;
use crate::wire::{Message, decode_message};

type Outbox = Arc<Mutex<Vec<(TaskId, Message)>>>;

struct RecordingEndpoint {
    sent: Outbox,
    io: Arc<Mutex<Vec<IoRequest>>>,
}

impl Endpoint for RecordingEndpoint {
    fn send_frame(&mut self, to: TaskId, frame: Vec<u8>) -> Result<()> {
        let msg = decode_message(&frame)?;
        self.sent.lock().unwrap().push((to, msg));
        Ok(())
    }

    fn submit_io(&mut self, req: IoRequest) -> Result<()> {
        self.io.lock().unwrap().push(req);
        Ok(())
    }
}

pub(crate) fn config() -> RuntimeConfig {
    RuntimeConfig {
        seed: Some(7),
        fish_interval_ms: 0,
        dist_gc_interval_ms: 0,
        ..RuntimeConfig::default()
    }
}

pub(crate) struct TestTask {
    pub task: Task,
    sent: Outbox,
    pub io: Arc<Mutex<Vec<IoRequest>>>,
    _mailbox: Sender<Incoming>,
}

impl TestTask {
    pub fn new(program: Program, tid: TaskId, ntasks: u32) -> Self {
        Self::with_config(program, tid, ntasks, config())
    }

    pub fn with_config(program: Program, tid: TaskId, ntasks: u32, config: RuntimeConfig) -> Self {
        let sent = Outbox::default();
        let io = Arc::new(Mutex::new(Vec::new()));
        let endpoint = RecordingEndpoint {
            sent: sent.clone(),
            io: io.clone(),
        };
        let (tx, rx) = unbounded();
        let program = Arc::new(program.load().unwrap());
        let task = Task::new(tid, ntasks, program, config, Box::new(endpoint), rx);
        Self {
            task,
            sent,
            io,
            _mailbox: tx,
        }
    }

    /// Messages sent to other tasks since the last call.
    pub fn take_sent(&self) -> Vec<(TaskId, Message)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn deliver(&mut self, from: TaskId, msg: Message) {
        let r = self.task.dispatch(from, msg);
        self.task.settle(r).unwrap();
    }

    /// Run local work until nothing is runnable. Returns whether anything happened.
    pub fn run_until_idle(&mut self, fish: bool) -> bool {
        let mut progressed = false;
        loop {
            let mut worked = false;
            while let Some(msg) = self.task.local.pop_front() {
                let tid = self.task.tid;
                self.deliver(tid, msg);
                worked = true;
            }
            if !self.task.dgc.active && self.task.error.is_none() {
                let ran = self.task.run_slice();
                worked |= self.task.settle(ran).unwrap();
                let collected = self.task.maybe_collect();
                self.task.settle(collected).unwrap();
            }
            if self.task.tid == 0 && !self.task.dgc.active {
                let polled = self.task.poll_collector();
                self.task.settle(polled).unwrap();
            }
            if !worked && self.task.local.is_empty() && !self.task.runnable() {
                break;
            }
            progressed = true;
        }
        if fish {
            let fished = self.task.maybe_fish();
            self.task.settle(fished).unwrap();
        }
        let flushed = self.task.flush_acks();
        self.task.settle(flushed).unwrap();
        progressed
    }

    /// Boot `main` and run it alone to completion.
    pub fn run_main(program: Program) -> (Result<Value, TaskError>, Vec<u8>) {
        let mut t = TestTask::new(program, 0, 1);
        t.boot();
        for _ in 0..10_000 {
            t.run_until_idle(false);
            if let Some(result) = t.task.finished.take() {
                return (result, std::mem::take(&mut t.task.output));
            }
        }
        panic!("main did not finish");
    }

    pub fn boot(&mut self) {
        let booted = self.task.boot();
        self.task.settle(booted).unwrap();
    }

    /// Start a frame evaluating `p` and return the cell that will hold the result.
    pub fn demand(&mut self, p: Pntr) -> Pntr {
        let stub = self.task.program.eval_stub;
        let entry = self.task.program.function(stub).unwrap().address;
        let (fid, cell) = self.task.spawn_frame(stub, entry, vec![p]).unwrap();
        self.task.make_ready(fid).unwrap();
        Pntr::cell(cell)
    }
}

pub(crate) struct Cluster {
    pub tasks: Vec<TestTask>,
    /// Idle tasks send FISH while pumping.
    pub fishing: bool,
}

impl Cluster {
    pub fn new(program: Program, ntasks: u32) -> Self {
        Self::with_config(program, ntasks, config())
    }

    pub fn with_config(program: Program, ntasks: u32, config: RuntimeConfig) -> Self {
        let tasks = (0..ntasks)
            .map(|tid| TestTask::with_config(program.clone(), tid, ntasks, config.clone()))
            .collect();
        Self { tasks, fishing: false }
    }

    pub fn task(&mut self, tid: TaskId) -> &mut Task {
        &mut self.tasks[tid as usize].task
    }

    /// One round: every task runs, then everything sent is delivered.
    /// Returns the number of messages delivered.
    pub fn round(&mut self) -> usize {
        let fishing = self.fishing;
        for t in &mut self.tasks {
            t.run_until_idle(fishing);
        }
        let mut mail = Vec::new();
        for (from, t) in self.tasks.iter().enumerate() {
            for (to, msg) in t.take_sent() {
                mail.push((from as TaskId, to, msg));
            }
        }
        let n = mail.len();
        for (from, to, msg) in mail {
            self.tasks[to as usize].deliver(from, msg);
        }
        n
    }

    /// Deliver messages until the group is quiet.
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            let delivered = self.round();
            let busy = self.tasks.iter().any(|t| t.task.runnable() || !t.task.local.is_empty());
            if delivered == 0 && !busy {
                return;
            }
        }
        panic!("group never went quiet");
    }

    /// Boot `main` on task 0 and run rounds until it has a result.
    pub fn run_main(&mut self) -> Result<Value, TaskError> {
        self.tasks[0].boot();
        for _ in 0..100_000 {
            self.round();
            if let Some(result) = self.tasks[0].task.finished.take() {
                return result;
            }
        }
        panic!("main did not finish");
    }
}

/// Numbers along a fully evaluated list.
pub(crate) fn numbers(task: &Task, p: Pntr) -> Vec<f64> {
    let mut out = Vec::new();
    let mut p = p;
    loop {
        match task.heap.view(p).unwrap() {
            View::Cell(_, CellKind::Cons(h, t)) => {
                out.push(h.as_number().expect("number element"));
                p = *t;
            }
            View::Cell(_, CellKind::Nil) => return out,
            other => panic!("not a list: {:?}", other),
        }
    }
}

pub(crate) fn number(task: &Task, p: Pntr) -> f64 {
    match task.heap.view(p).unwrap() {
        View::Number(n) => n,
        other => panic!("not a number: {:?}", other),
    }
}

/// `main = 42`
pub(crate) fn trivial_program() -> Program {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", 0, 1);
    b.emit(Instr::PushNumber(42.0)).emit(Instr::Return);
    b.finish(main).unwrap()
}

/// Adds `fact(n)` as function 0 and returns its number.
pub(crate) fn define_fact(b: &mut ProgramBuilder) -> u32 {
    let fact = b.declare("fact", 1);
    b.define(fact, 3);
    let recurse = b.label();
    b.emit(Instr::Eval(0))
        .emit(Instr::Push(0))
        .emit(Instr::PushNumber(1.0));
    b.jcmp(CmpOp::Le, recurse);
    b.emit(Instr::PushNumber(1.0)).emit(Instr::Return);
    b.bind(recurse);
    b.emit(Instr::Push(0))
        .emit(Instr::PushNumber(1.0))
        .emit(Instr::Bif(crate::program::Builtin::Sub))
        .emit(Instr::Call(fact))
        .emit(Instr::Bif(crate::program::Builtin::Mul))
        .emit(Instr::Return);
    fact
}

/// `main = fact(n)`
pub(crate) fn fact_program(n: f64) -> Program {
    let mut b = ProgramBuilder::new();
    let fact = define_fact(&mut b);
    let main = b.function("main", 0, 1);
    b.emit(Instr::PushNumber(n))
        .emit(Instr::Call(fact))
        .emit(Instr::Return);
    b.finish(main).unwrap()
}

/// `main = sum [fact(k) | k <- 1..=n]`, each term sparked.
pub(crate) fn parallel_sum_program(n: u16) -> Program {
    let mut b = ProgramBuilder::new();
    let fact = define_fact(&mut b);
    let main = b.function("main", 0, n as u32 + 1);
    for k in 1..=n {
        b.emit(Instr::PushNumber(k as f64))
            .emit(Instr::MkFrame { fno: fact, n: 1 })
            .emit(Instr::Spark(k - 1));
    }
    b.emit(Instr::PushNumber(0.0));
    for k in 0..n {
        b.emit(Instr::Eval(k)).emit(Instr::Push(k)).emit(Instr::Bif(crate::program::Builtin::Add));
    }
    b.emit(Instr::Return);
    b.finish(main).unwrap()
}
