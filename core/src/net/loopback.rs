use anyhow::{Result, bail};
use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::trace;

use super::{Endpoint, Incoming, IoRequest, IoService};
use crate::addr::TaskId;

/// In-process group. Frames still go through the codec, so a loopback run
/// exercises the same bytes a TCP run would.
#[derive(Debug)]
pub struct LoopbackNet {
    tid: TaskId,
    peers: Vec<Sender<Incoming>>,
    io: IoService,
}

impl LoopbackNet {
    /// One endpoint and one mailbox per task, fully connected.
    pub fn group(ntasks: usize) -> Vec<(LoopbackNet, Receiver<Incoming>)> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..ntasks).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(tid, rx)| {
                let net = LoopbackNet {
                    tid: tid as TaskId,
                    peers: senders.clone(),
                    io: IoService::new(senders[tid].clone()),
                };
                (net, rx)
            })
            .collect()
    }

    /// Mailboxes of the whole group, for telling survivors that a task died.
    pub fn senders(&self) -> Vec<Sender<Incoming>> {
        self.peers.clone()
    }
}

impl Endpoint for LoopbackNet {
    fn send_frame(&mut self, to: TaskId, frame: Vec<u8>) -> Result<()> {
        let Some(peer) = self.peers.get(to as usize) else {
            bail!("task {} is not a member of this group", to);
        };
        trace!(target: "nreduce::net", from = self.tid, to, len = frame.len(), "net.loopback_send");
        // a finished peer has dropped its mailbox; nothing is waiting for the frame
        let _ = peer.send(Incoming::Frame {
            from: self.tid,
            bytes: frame,
        });
        Ok(())
    }

    fn submit_io(&mut self, req: IoRequest) -> Result<()> {
        self.io.submit(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reach_the_addressed_mailbox() {
        let mut group = LoopbackNet::group(3);
        let (mut net0, _rx0) = group.remove(0);
        net0.send_frame(2, vec![1, 2, 3]).unwrap();
        let (_, rx2) = &group[1];
        match rx2.try_recv().unwrap() {
            Incoming::Frame { from, bytes } => {
                assert_eq!(from, 0);
                assert_eq!(bytes, vec![1, 2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(group[0].1.try_recv().is_err());
    }

    #[test]
    fn unknown_peers_are_rejected() {
        let mut group = LoopbackNet::group(1);
        assert!(group[0].0.send_frame(4, Vec::new()).is_err());
    }
}
