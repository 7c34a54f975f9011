//! Running a whole task group.
//!
//! `run_local` keeps every task in this process, one thread each, talking
//! over `LoopbackNet`. Across machines a `Master` hands out task ids over the
//! bootstrap channel and each `run_worker` process runs one task over
//! `TcpNet`. Either way task 0 evaluates `main` and owns the result.

use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail, ensure};
use crossbeam::channel::unbounded;
use tracing::{debug, info, warn};

use crate::addr::TaskId;
use crate::config::RuntimeConfig;
use crate::error::TaskError;
use crate::net::bootstrap::{BootChannel, BootMsg};
use crate::net::{Incoming, LoopbackNet, TcpNet};
use crate::program::Program;
use crate::task::{RunOutput, Task};
use crate::value::Value;

#[cfg(test)]
mod group_test;

/// What a finished group hands back to its caller.
#[derive(Debug)]
pub struct GroupOutput {
    pub result: Result<Value, TaskError>,
    /// Everything the program printed, in the order task 0 received it.
    pub output: Vec<u8>,
}

/// Run `program` on `ntasks` tasks inside this process.
pub fn run_local(program: Program, ntasks: u32, config: RuntimeConfig) -> Result<GroupOutput> {
    ensure!(ntasks > 0, "a group needs at least one task");
    let program = Arc::new(program.load()?);
    info!(target: "nreduce::group", ntasks, "group.local_start");

    let mut handles = Vec::with_capacity(ntasks as usize);
    for (tid, (net, mailbox)) in LoopbackNet::group(ntasks as usize).into_iter().enumerate() {
        let tid = tid as TaskId;
        let peers = net.senders();
        let task = Task::new(tid, ntasks, program.clone(), config.clone(), Box::new(net), mailbox);
        let handle = thread::Builder::new()
            .name(format!("nreduce-task-{}", tid))
            .spawn(move || {
                let out = task.run();
                if out.is_err() {
                    for (peer, mailbox) in peers.iter().enumerate() {
                        if peer as TaskId != tid {
                            let _ = mailbox.send(Incoming::PeerLost(tid));
                        }
                    }
                }
                out
            })
            .with_context(|| format!("failed to spawn task {}", tid))?;
        handles.push(handle);
    }

    let mut outputs = Vec::with_capacity(handles.len());
    let mut failure = None;
    for (tid, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(out)) => outputs.push(out),
            Ok(Err(e)) => {
                warn!(target: "nreduce::group", tid, error = %e, "group.task_failed");
                failure = failure.or(Some(e));
            }
            Err(_) => failure = failure.or(Some(anyhow!("task {} panicked", tid))),
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    for out in &outputs {
        log_stats(out);
    }
    let main = outputs
        .into_iter()
        .find(|o| o.tid == 0)
        .context("task 0 did not report")?;
    Ok(GroupOutput {
        result: main.result.context("task 0 stopped without a result")?,
        output: main.output,
    })
}

fn log_stats(out: &RunOutput) {
    let s = &out.stats;
    info!(
        target: "nreduce::group",
        tid = out.tid,
        instructions = s.instructions,
        sent = s.messages_sent,
        fetches = s.fetches,
        frames_sent = s.frames_sent,
        frames_received = s.frames_received,
        minor_gcs = s.minor_gcs,
        major_gcs = s.major_gcs,
        dist_epochs = s.dist_epochs,
        "group.task_stats"
    );
}

/// Lines of a host list file, skipping blanks and `#` comments.
pub fn read_hosts(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read host list {}", path.display()))?;
    let hosts: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect();
    ensure!(!hosts.is_empty(), "host list {} names no hosts", path.display());
    Ok(hosts)
}

/// Coordinates a group of worker processes.
#[derive(Debug)]
pub struct Master {
    listener: TcpListener,
    hosts: Vec<String>,
    config: RuntimeConfig,
    children: Vec<Child>,
}

impl Master {
    /// Listen for workers on `bootstrap`. One task is created per entry in `hosts`.
    pub fn bind(bootstrap: &str, hosts: Vec<String>, config: RuntimeConfig) -> Result<Self> {
        ensure!(!hosts.is_empty(), "a group needs at least one host");
        let listener =
            TcpListener::bind(bootstrap).with_context(|| format!("failed to bind bootstrap address {}", bootstrap))?;
        Ok(Self {
            listener,
            hosts,
            config,
            children: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<String> {
        Ok(self
            .listener
            .local_addr()
            .context("bootstrap listener has no address")?
            .to_string())
    }

    /// Start one `exe worker` process per host on this machine.
    pub fn spawn_local_workers(&mut self, exe: &Path) -> Result<()> {
        let master = self.local_addr()?;
        for host in &self.hosts {
            let child = Command::new(exe)
                .args(["worker", "--master", &master, "--listen", &format!("{}:0", host)])
                .stdin(Stdio::null())
                .spawn()
                .with_context(|| format!("failed to start worker {}", exe.display()))?;
            debug!(target: "nreduce::group", pid = child.id(), %host, "group.worker_spawned");
            self.children.push(child);
        }
        Ok(())
    }

    /// Admit every worker, send out the setup and wait for task 0 to finish.
    pub fn run(mut self, program: Program) -> Result<GroupOutput> {
        program.clone().load().context("program rejected before distribution")?;
        let ntasks = self.hosts.len();
        let mut channels = Vec::with_capacity(ntasks);
        let mut members = Vec::with_capacity(ntasks);
        while channels.len() < ntasks {
            let (stream, peer) = self.listener.accept().context("failed to accept a worker")?;
            let mut ch = BootChannel::new(stream)?;
            match ch.recv()? {
                BootMsg::Hello { listen } => {
                    info!(target: "nreduce::group", tid = channels.len(), %peer, %listen, "group.worker_joined");
                    members.push(listen);
                    channels.push(ch);
                }
                other => bail!("worker {} opened with {:?} instead of hello", peer, other),
            }
        }

        for (tid, ch) in channels.iter_mut().enumerate() {
            ch.send(&BootMsg::Setup {
                tid: tid as TaskId,
                members: members.clone(),
                program: program.clone(),
                config: self.config.clone(),
            })?;
        }
        info!(target: "nreduce::group", ntasks, "group.started");

        let finished = channels[0].recv().context("lost task 0 before it finished")?;
        let BootMsg::Finished { result, output } = finished else {
            bail!("task 0 sent {:?} instead of its result", finished);
        };
        for mut child in std::mem::take(&mut self.children) {
            let status = child.wait().context("failed to wait for a worker")?;
            if !status.success() {
                warn!(target: "nreduce::group", pid = child.id(), %status, "group.worker_failed");
            }
        }
        info!(target: "nreduce::group", ok = result.is_ok(), "group.finished");
        Ok(GroupOutput { result, output })
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Join the group coordinated at `master` and run one task until shutdown.
/// `listen` is where this task accepts its peers; port 0 picks a free one.
pub fn run_worker(master: &str, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen).with_context(|| format!("failed to bind task listener {}", listen))?;
    let local = listener.local_addr().context("task listener has no address")?.to_string();
    let mut ch = BootChannel::connect(master)?;
    ch.send(&BootMsg::Hello { listen: local.clone() })?;

    let BootMsg::Setup {
        tid,
        members,
        program,
        config,
    } = ch.recv()?
    else {
        bail!("master {} did not send a setup", ch.peer());
    };
    ensure!(
        (tid as usize) < members.len(),
        "task id {} outside a group of {}",
        tid,
        members.len()
    );
    info!(target: "nreduce::group", tid, listen = %local, ntasks = members.len(), "group.worker_setup");

    let ntasks = members.len() as u32;
    let program = Arc::new(program.load()?);
    let (tx, rx) = unbounded();
    let net = TcpNet::start(tid, listener, members, tx)?;
    let task = Task::new(tid, ntasks, program, config, Box::new(net), rx);
    let out = task.run()?;
    log_stats(&out);

    if tid == 0 {
        let result = out.result.context("task 0 stopped without a result")?;
        ch.send(&BootMsg::Finished {
            result,
            output: out.output,
        })?;
    }
    Ok(())
}
