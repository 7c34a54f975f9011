//! Socket service behind the user-level I/O builtins.
//!
//! Requests are tagged with the system object they act on. Each object gets
//! its own actor on a private tokio runtime, so operations on one socket run
//! in submission order while different sockets proceed independently.
//! Completions come back through the owning task's mailbox.

use std::thread;

use anyhow::{Context, Result};
use crossbeam::channel::Sender;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::Incoming;
use crate::task::SysObjectId;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum IoOp {
    Connect { host: String, port: u16 },
    Listen { port: u16 },
    /// Accept one connection; `conn` names the system object it will become.
    Accept { conn: SysObjectId },
    Read,
    Write { data: Vec<u8> },
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoRequest {
    pub sysobj: SysObjectId,
    pub op: IoOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IoResult {
    Connected,
    Listening { port: u16 },
    Accepted { conn: SysObjectId },
    /// Empty data means the peer closed its side.
    Data(Vec<u8>),
    Written(usize),
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoCompletion {
    pub sysobj: SysObjectId,
    pub result: IoResult,
}

enum Control {
    Request(IoRequest),
    Adopt(SysObjectId, TcpStream),
}

/// Lazily started: tasks that never touch a socket never spawn the thread.
#[derive(Debug)]
pub struct IoService {
    completions: Sender<Incoming>,
    tx: Option<mpsc::UnboundedSender<Control>>,
}

impl IoService {
    pub fn new(completions: Sender<Incoming>) -> Self {
        Self { completions, tx: None }
    }

    pub fn submit(&mut self, req: IoRequest) -> Result<()> {
        trace!(target: "nreduce::io", sysobj = req.sysobj.0, op = ?req.op, "io.submit");
        if self.tx.is_none() {
            self.tx = Some(self.start()?);
        }
        let tx = self.tx.as_ref().context("io service not running")?;
        tx.send(Control::Request(req))
            .map_err(|_| anyhow::anyhow!("io service stopped"))
    }

    fn start(&self) -> Result<mpsc::UnboundedSender<Control>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let completions = self.completions.clone();
        let own = tx.downgrade();
        thread::Builder::new()
            .name("nreduce-io".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(target: "nreduce::io", error = %e, "io.runtime_failed");
                        return;
                    }
                };
                runtime.block_on(dispatch(rx, own, completions));
            })
            .context("failed to spawn io thread")?;
        debug!(target: "nreduce::io", "io.started");
        Ok(tx)
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Control>,
    own: mpsc::WeakUnboundedSender<Control>,
    completions: Sender<Incoming>,
) {
    let mut actors: FxHashMap<SysObjectId, mpsc::UnboundedSender<Control>> = FxHashMap::default();
    while let Some(ctl) = rx.recv().await {
        let id = match &ctl {
            Control::Request(req) => req.sysobj,
            Control::Adopt(id, _) => *id,
        };
        let actor = actors.entry(id).or_insert_with(|| {
            let (atx, arx) = mpsc::unbounded_channel();
            tokio::spawn(actor(id, arx, own.clone(), completions.clone()));
            atx
        });
        let closing = matches!(&ctl, Control::Request(IoRequest { op: IoOp::Close, .. }));
        if actor.send(ctl).is_err() {
            warn!(target: "nreduce::io", sysobj = id.0, "io.actor_gone");
        }
        if closing {
            actors.remove(&id);
        }
    }
}

enum Socket {
    None,
    Stream(TcpStream),
    Listener(TcpListener),
}

async fn actor(
    id: SysObjectId,
    mut rx: mpsc::UnboundedReceiver<Control>,
    dispatch: mpsc::WeakUnboundedSender<Control>,
    completions: Sender<Incoming>,
) {
    let mut socket = Socket::None;
    let mut buf = vec![0u8; READ_CHUNK];
    while let Some(ctl) = rx.recv().await {
        let op = match ctl {
            Control::Adopt(_, stream) => {
                socket = Socket::Stream(stream);
                continue;
            }
            Control::Request(req) => req.op,
        };
        let result = match op {
            IoOp::Connect { host, port } => match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    socket = Socket::Stream(stream);
                    IoResult::Connected
                }
                Err(e) => IoResult::Failed(format!("connect {}:{}: {}", host, port, e)),
            },
            IoOp::Listen { port } => match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    socket = Socket::Listener(listener);
                    IoResult::Listening { port }
                }
                Err(e) => IoResult::Failed(format!("listen on {}: {}", port, e)),
            },
            IoOp::Accept { conn } => match &socket {
                Socket::Listener(listener) => match listener.accept().await {
                    Ok((stream, peer)) => {
                        trace!(target: "nreduce::io", listener = id.0, conn = conn.0, %peer, "io.accepted");
                        if let Some(dispatch) = dispatch.upgrade() {
                            let _ = dispatch.send(Control::Adopt(conn, stream));
                        }
                        IoResult::Accepted { conn }
                    }
                    Err(e) => IoResult::Failed(format!("accept: {}", e)),
                },
                _ => IoResult::Failed("accept on a socket that is not listening".into()),
            },
            IoOp::Read => match &mut socket {
                Socket::Stream(stream) => match stream.read(&mut buf).await {
                    Ok(n) => IoResult::Data(buf[..n].to_vec()),
                    Err(e) => IoResult::Failed(format!("read: {}", e)),
                },
                _ => IoResult::Failed("read from an unconnected socket".into()),
            },
            IoOp::Write { data } => match &mut socket {
                Socket::Stream(stream) => match stream.write_all(&data).await {
                    Ok(()) => IoResult::Written(data.len()),
                    Err(e) => IoResult::Failed(format!("write: {}", e)),
                },
                _ => IoResult::Failed("write to an unconnected socket".into()),
            },
            IoOp::Close => {
                socket = Socket::None;
                IoResult::Closed
            }
        };
        let done = result == IoResult::Closed;
        if completions
            .send(Incoming::Io(IoCompletion { sysobj: id, result }))
            .is_err()
        {
            break;
        }
        if done {
            break;
        }
    }
    drop(socket);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::time::Duration;

    fn next(rx: &crossbeam::channel::Receiver<Incoming>) -> IoCompletion {
        match rx.recv_timeout(Duration::from_secs(5)).expect("completion") {
            Incoming::Io(c) => c,
            _ => panic!("expected an io completion"),
        }
    }

    #[test]
    fn listen_accept_read_write_round_trip() {
        let (tx, rx) = unbounded();
        let mut io = IoService::new(tx);
        let listener = SysObjectId(1);
        io.submit(IoRequest {
            sysobj: listener,
            op: IoOp::Listen { port: 0 },
        })
        .unwrap();
        let port = match next(&rx).result {
            IoResult::Listening { port } => port,
            other => panic!("unexpected {:?}", other),
        };

        let server = SysObjectId(2);
        io.submit(IoRequest {
            sysobj: listener,
            op: IoOp::Accept { conn: server },
        })
        .unwrap();
        let client = SysObjectId(3);
        io.submit(IoRequest {
            sysobj: client,
            op: IoOp::Connect {
                host: "127.0.0.1".into(),
                port,
            },
        })
        .unwrap();

        let mut seen = vec![next(&rx), next(&rx)];
        seen.sort_by_key(|c| c.sysobj.0);
        assert_eq!(seen[0].result, IoResult::Accepted { conn: server });
        assert_eq!(seen[1].result, IoResult::Connected);

        io.submit(IoRequest {
            sysobj: client,
            op: IoOp::Write { data: b"ping".to_vec() },
        })
        .unwrap();
        assert_eq!(next(&rx).result, IoResult::Written(4));

        io.submit(IoRequest {
            sysobj: server,
            op: IoOp::Read,
        })
        .unwrap();
        assert_eq!(next(&rx).result, IoResult::Data(b"ping".to_vec()));
    }

    #[test]
    fn failures_are_reported_not_raised() {
        let (tx, rx) = unbounded();
        let mut io = IoService::new(tx);
        io.submit(IoRequest {
            sysobj: SysObjectId(9),
            op: IoOp::Read,
        })
        .unwrap();
        assert!(matches!(next(&rx).result, IoResult::Failed(_)));
    }
}
