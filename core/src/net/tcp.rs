//! Task-to-task transport over TCP.
//!
//! Each task runs one network thread with a current-thread tokio runtime.
//! Outbound traffic uses one persistent stream per peer, opened on first use;
//! the stream starts with the sender's task id and then carries
//! length-prefixed frames. Inbound streams are accepted on the task's own
//! listener and decoded straight into the mailbox.

use std::net::TcpListener as StdTcpListener;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam::channel::Sender;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{Endpoint, Incoming, IoRequest, IoService};
use crate::addr::TaskId;

const MAX_FRAME: u32 = 256 * 1024 * 1024;
const CONNECT_ATTEMPTS: u32 = 40;
const CONNECT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct TcpNet {
    tid: TaskId,
    mailbox: Sender<Incoming>,
    writers: Vec<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    io: IoService,
    thread: Option<thread::JoinHandle<()>>,
}

impl TcpNet {
    /// Start the network thread for task `tid`. `members[i]` is the
    /// `host:port` task `i` listens on; `listener` is this task's own.
    pub fn start(tid: TaskId, listener: StdTcpListener, members: Vec<String>, mailbox: Sender<Incoming>) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .context("failed to make the task listener non-blocking")?;

        let mut writers = Vec::with_capacity(members.len());
        let mut outbound = Vec::new();
        for (peer, addr) in members.into_iter().enumerate() {
            if peer as TaskId == tid {
                writers.push(None);
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            writers.push(Some(tx));
            outbound.push((peer as TaskId, addr, rx));
        }

        let inbox = mailbox.clone();
        let thread = thread::Builder::new()
            .name(format!("nreduce-net-{}", tid))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(target: "nreduce::net", error = %e, "net.runtime_failed");
                        return;
                    }
                };
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => {
                            tokio::spawn(accept_loop(listener, inbox.clone()));
                        }
                        Err(e) => warn!(target: "nreduce::net", error = %e, "net.listener_failed"),
                    }
                    let handles: Vec<_> = outbound
                        .into_iter()
                        .map(|(peer, addr, rx)| tokio::spawn(writer(tid, peer, addr, rx, inbox.clone())))
                        .collect();
                    // writers finish once the endpoint is dropped and their queues drain
                    for h in handles {
                        let _ = h.await;
                    }
                });
            })
            .context("failed to spawn network thread")?;

        debug!(target: "nreduce::net", tid, peers = writers.len(), "net.started");
        Ok(Self {
            tid,
            io: IoService::new(mailbox.clone()),
            mailbox,
            writers,
            thread: Some(thread),
        })
    }
}

impl Endpoint for TcpNet {
    fn send_frame(&mut self, to: TaskId, frame: Vec<u8>) -> Result<()> {
        if to == self.tid {
            let _ = self.mailbox.send(Incoming::Frame {
                from: self.tid,
                bytes: frame,
            });
            return Ok(());
        }
        let Some(Some(writer)) = self.writers.get(to as usize) else {
            bail!("task {} is not a member of this group", to);
        };
        trace!(target: "nreduce::net", to, len = frame.len(), "net.send");
        if writer.send(frame).is_err() {
            bail!("connection to task {} is gone", to);
        }
        Ok(())
    }

    fn submit_io(&mut self, req: IoRequest) -> Result<()> {
        self.io.submit(req)
    }
}

impl Drop for TcpNet {
    fn drop(&mut self) {
        self.writers.clear();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(target: "nreduce::net", tid = self.tid, "net.stopped");
    }
}

async fn accept_loop(listener: TcpListener, mailbox: Sender<Incoming>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!(target: "nreduce::net", %peer, "net.accepted");
                tokio::spawn(reader(stream, mailbox.clone()));
            }
            Err(e) => {
                warn!(target: "nreduce::net", error = %e, "net.accept_failed");
                return;
            }
        }
    }
}

async fn reader(mut stream: TcpStream, mailbox: Sender<Incoming>) {
    let from = match stream.read_u32().await {
        Ok(from) => from,
        Err(e) => {
            warn!(target: "nreduce::net", error = %e, "net.handshake_failed");
            return;
        }
    };
    debug!(target: "nreduce::net", from, "net.peer_connected");
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len,
            Err(_) => break,
        };
        if len > MAX_FRAME {
            warn!(target: "nreduce::net", from, len, "net.frame_too_large");
            break;
        }
        let mut bytes = vec![0u8; len as usize];
        if let Err(e) = stream.read_exact(&mut bytes).await {
            warn!(target: "nreduce::net", from, error = %e, "net.read_failed");
            break;
        }
        if mailbox.send(Incoming::Frame { from, bytes }).is_err() {
            return;
        }
    }
    let _ = mailbox.send(Incoming::PeerLost(from));
}

async fn connect(tid: TaskId, addr: &str) -> Result<TcpStream> {
    let mut attempt = 0;
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                trace!(target: "nreduce::net", addr, attempt, error = %e, "net.connect_retry");
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e).with_context(|| format!("connect to {}", addr)),
        }
    };
    stream.set_nodelay(true).context("set TCP_NODELAY")?;
    stream.write_u32(tid).await.context("send handshake")?;
    Ok(stream)
}

async fn writer(
    tid: TaskId,
    peer: TaskId,
    addr: String,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mailbox: Sender<Incoming>,
) {
    let mut stream: Option<TcpStream> = None;
    while let Some(frame) = rx.recv().await {
        if stream.is_none() {
            match connect(tid, &addr).await {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    warn!(target: "nreduce::net", peer, error = %format!("{:#}", e), "net.connect_failed");
                    let _ = mailbox.send(Incoming::PeerLost(peer));
                    return;
                }
            }
        }
        let Some(s) = stream.as_mut() else { return };
        let written = match s.write_u32(frame.len() as u32).await {
            Ok(()) => s.write_all(&frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(target: "nreduce::net", peer, error = %e, "net.write_failed");
            let _ = mailbox.send(Incoming::PeerLost(peer));
            return;
        }
    }
    if let Some(mut s) = stream {
        let _ = s.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn bind() -> (StdTcpListener, String) {
        let l = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = l.local_addr().unwrap().to_string();
        (l, addr)
    }

    #[test]
    fn frames_cross_the_wire_in_order() {
        let (l0, a0) = bind();
        let (l1, a1) = bind();
        let members = vec![a0, a1];
        let (tx0, rx0) = unbounded();
        let (tx1, _rx1) = unbounded();
        let _net0 = TcpNet::start(0, l0, members.clone(), tx0).unwrap();
        let mut net1 = TcpNet::start(1, l1, members, tx1).unwrap();

        for i in 0..10u8 {
            net1.send_frame(0, vec![i; i as usize + 1]).unwrap();
        }
        for i in 0..10u8 {
            match rx0.recv_timeout(Duration::from_secs(5)).unwrap() {
                Incoming::Frame { from, bytes } => {
                    assert_eq!(from, 1);
                    assert_eq!(bytes, vec![i; i as usize + 1]);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn self_sends_skip_the_network() {
        let (l0, a0) = bind();
        let (tx0, rx0) = unbounded();
        let mut net0 = TcpNet::start(0, l0, vec![a0], tx0).unwrap();
        net0.send_frame(0, vec![7]).unwrap();
        assert!(matches!(
            rx0.recv_timeout(Duration::from_secs(1)).unwrap(),
            Incoming::Frame { from: 0, .. }
        ));
    }

    #[test]
    fn a_closed_peer_is_reported() {
        let (l0, a0) = bind();
        let (l1, a1) = bind();
        let members = vec![a0, a1];
        let (tx0, rx0) = unbounded();
        let (tx1, _rx1) = unbounded();
        let _net0 = TcpNet::start(0, l0, members.clone(), tx0).unwrap();
        let mut net1 = TcpNet::start(1, l1, members, tx1).unwrap();
        net1.send_frame(0, vec![1]).unwrap();
        assert!(matches!(
            rx0.recv_timeout(Duration::from_secs(5)).unwrap(),
            Incoming::Frame { .. }
        ));
        drop(net1);
        assert!(matches!(
            rx0.recv_timeout(Duration::from_secs(5)).unwrap(),
            Incoming::PeerLost(1)
        ));
    }
}
