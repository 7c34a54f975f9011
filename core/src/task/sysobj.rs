//! Sockets as seen by user programs.
//!
//! A system object mirrors the state of one socket in the I/O service. The
//! builtins never wait on the socket itself: they submit a request, park the
//! calling frame on the object, and re-run once a completion has updated it.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::FrameId;
use crate::error::RtResult;
use crate::fatal;
use crate::net::{IoCompletion, IoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SysObjectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysObjectKind {
    Connection,
    Listener,
}

#[derive(Debug)]
pub struct SysObject {
    pub kind: SysObjectKind,
    pub connected: bool,
    pub closed: bool,
    pub error: bool,
    pub message: String,
    pub incoming: VecDeque<Vec<u8>>,
    pub eof: bool,
    pub read_pending: bool,
    pub write_pending: bool,
    pub write_done: bool,
    pub accept_pending: bool,
    pub accepted: VecDeque<SysObjectId>,
    pub port: u16,
    pub waiters: Vec<FrameId>,
}

impl SysObject {
    fn new(kind: SysObjectKind) -> Self {
        Self {
            kind,
            connected: false,
            closed: false,
            error: false,
            message: String::new(),
            incoming: VecDeque::new(),
            eof: false,
            read_pending: false,
            write_pending: false,
            write_done: false,
            accept_pending: false,
            accepted: VecDeque::new(),
            port: 0,
            waiters: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SysObjects {
    objects: FxHashMap<SysObjectId, SysObject>,
    next: u32,
}

impl SysObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for an object the I/O service will create later (an accepted connection).
    pub fn reserve(&mut self) -> SysObjectId {
        self.next += 1;
        SysObjectId(self.next)
    }

    pub fn create(&mut self, kind: SysObjectKind) -> SysObjectId {
        let id = self.reserve();
        self.objects.insert(id, SysObject::new(kind));
        trace!(target: "nreduce::io", sysobj = id.0, ?kind, "sysobj.create");
        id
    }

    pub fn get(&self, id: SysObjectId) -> RtResult<&SysObject> {
        self.objects
            .get(&id)
            .ok_or_else(|| fatal!("unknown system object {}", id.0))
    }

    pub fn get_mut(&mut self, id: SysObjectId) -> RtResult<&mut SysObject> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| fatal!("unknown system object {}", id.0))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Apply a completion and hand back the frames that should re-run.
    pub fn complete(&mut self, c: IoCompletion) -> Vec<FrameId> {
        if let IoResult::Accepted { conn } = c.result {
            let mut obj = SysObject::new(SysObjectKind::Connection);
            obj.connected = true;
            self.objects.insert(conn, obj);
        }
        let Some(obj) = self.objects.get_mut(&c.sysobj) else {
            trace!(target: "nreduce::io", sysobj = c.sysobj.0, "sysobj.completion_dropped");
            return Vec::new();
        };
        match c.result {
            IoResult::Connected => obj.connected = true,
            IoResult::Listening { port } => {
                obj.connected = true;
                obj.port = port;
            }
            IoResult::Accepted { conn } => {
                obj.accept_pending = false;
                obj.accepted.push_back(conn);
            }
            IoResult::Data(data) => {
                obj.read_pending = false;
                if data.is_empty() {
                    obj.eof = true;
                } else {
                    obj.incoming.push_back(data);
                }
            }
            IoResult::Written(_) => {
                obj.write_pending = false;
                obj.write_done = true;
            }
            IoResult::Closed => obj.closed = true,
            IoResult::Failed(message) => {
                debug!(target: "nreduce::io", sysobj = c.sysobj.0, %message, "sysobj.failed");
                obj.error = true;
                obj.closed = true;
                obj.message = message;
                obj.read_pending = false;
                obj.write_pending = false;
                obj.accept_pending = false;
            }
        }
        std::mem::take(&mut obj.waiters)
    }

    /// Forget an object whose cell was collected. Returns true when the
    /// socket is still open and must be closed by the caller.
    pub fn release(&mut self, id: SysObjectId) -> bool {
        match self.objects.remove(&id) {
            Some(obj) => !obj.closed,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_queue_data_and_flag_eof() {
        let mut objs = SysObjects::new();
        let id = objs.create(SysObjectKind::Connection);
        objs.get_mut(id).unwrap().read_pending = true;
        objs.complete(IoCompletion {
            sysobj: id,
            result: IoResult::Data(b"abc".to_vec()),
        });
        objs.complete(IoCompletion {
            sysobj: id,
            result: IoResult::Data(Vec::new()),
        });
        let obj = objs.get(id).unwrap();
        assert!(!obj.read_pending);
        assert_eq!(obj.incoming.front().map(Vec::as_slice), Some(&b"abc"[..]));
        assert!(obj.eof);
    }

    #[test]
    fn accepted_connections_become_objects() {
        let mut objs = SysObjects::new();
        let listener = objs.create(SysObjectKind::Listener);
        let conn = objs.reserve();
        objs.complete(IoCompletion {
            sysobj: listener,
            result: IoResult::Accepted { conn },
        });
        assert_eq!(objs.get(listener).unwrap().accepted.front(), Some(&conn));
        assert!(objs.get(conn).unwrap().connected);
    }

    #[test]
    fn failures_close_and_record_the_message() {
        let mut objs = SysObjects::new();
        let id = objs.create(SysObjectKind::Connection);
        objs.get_mut(id).unwrap().write_pending = true;
        objs.complete(IoCompletion {
            sysobj: id,
            result: IoResult::Failed("refused".into()),
        });
        let obj = objs.get(id).unwrap();
        assert!(obj.error && obj.closed && !obj.write_pending);
        assert_eq!(obj.message, "refused");
        assert!(!objs.release(id));
    }
}
