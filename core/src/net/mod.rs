//! Transports between tasks, plus the socket service used by user programs.
//!
//! A task never touches a socket directly. It owns a crossbeam mailbox that
//! every transport and the I/O service feed, and it talks outwards only
//! through an [`Endpoint`].

pub mod bootstrap;
pub mod io;
pub mod loopback;
pub mod tcp;

use anyhow::Result;

use crate::addr::TaskId;

pub use io::{IoCompletion, IoOp, IoRequest, IoResult, IoService};
pub use loopback::LoopbackNet;
pub use tcp::TcpNet;

/// Everything that can land in a task's mailbox.
#[derive(Debug)]
pub enum Incoming {
    /// One encoded protocol message from a peer.
    Frame { from: TaskId, bytes: Vec<u8> },
    Io(IoCompletion),
    /// The stream to a peer broke. Fatal unless the group is shutting down.
    PeerLost(TaskId),
}

pub trait Endpoint: Send {
    fn send_frame(&mut self, to: TaskId, frame: Vec<u8>) -> Result<()>;
    fn submit_io(&mut self, req: IoRequest) -> Result<()>;
}
