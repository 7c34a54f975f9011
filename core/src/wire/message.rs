use serde::{Deserialize, Serialize};

use crate::addr::{GAddr, TaskId};
use crate::error::TaskError;
use crate::program::Builtin;

/// A heap value as it travels between tasks.
///
/// Objects that carry an address are replicas of something owned by the
/// sender; the receiver keeps the address so that later references to the
/// same object reuse the replica instead of copying it again.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Number(f64),
    Nil,
    /// Handle only: the receiver builds a remote reference.
    Ref(GAddr),
    Cons {
        addr: GAddr,
        head: Box<WireValue>,
        tail: Box<WireValue>,
    },
    Array {
        addr: GAddr,
        data: WireArray,
    },
    ArrayRef {
        addr: GAddr,
        array: Box<WireValue>,
        start: u32,
    },
    Cap {
        addr: GAddr,
        fno: u32,
        arity: u32,
        args: Vec<WireValue>,
    },
    /// An unstarted frame being migrated to the receiver.
    Frame {
        addr: GAddr,
        fno: u32,
        pc: u32,
        slots: Vec<WireValue>,
    },
    Scref(u32),
    Builtin(Builtin),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireArray {
    Bytes(Vec<u8>),
    Values(Vec<WireValue>),
}

impl WireValue {
    /// Every address mentioned anywhere inside the value.
    pub fn collect_addrs(&self, out: &mut Vec<GAddr>) {
        match self {
            WireValue::Number(_) | WireValue::Nil | WireValue::Scref(_) | WireValue::Builtin(_) => {}
            WireValue::Ref(a) => out.push(*a),
            WireValue::Cons { addr, head, tail } => {
                out.push(*addr);
                head.collect_addrs(out);
                tail.collect_addrs(out);
            }
            WireValue::Array { addr, data } => {
                out.push(*addr);
                if let WireArray::Values(items) = data {
                    items.iter().for_each(|v| v.collect_addrs(out));
                }
            }
            WireValue::ArrayRef { addr, array, .. } => {
                out.push(*addr);
                array.collect_addrs(out);
            }
            WireValue::Cap { addr, args, .. } => {
                out.push(*addr);
                args.iter().for_each(|v| v.collect_addrs(out));
            }
            WireValue::Frame { addr, slots, .. } => {
                out.push(*addr);
                slots.iter().for_each(|v| v.collect_addrs(out));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledFrame {
    /// Address the new owner quotes back in UPDATEREF.
    pub tell: GAddr,
    pub frame: WireValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcPhase {
    Started,
    Swept,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Fetch { target: GAddr, store: GAddr },
    Respond { store: GAddr, value: WireValue },
    Schedule { frames: Vec<ScheduledFrame> },
    UpdateRef { tell: GAddr, addr: GAddr },
    Ack { count: u32, addr_count: u32 },
    Fish { from: TaskId, hops: u32, count: u32 },
    StartDistGc { epoch: u32 },
    MarkRoots { epoch: u32 },
    MarkEntry { epoch: u32, addrs: Vec<GAddr> },
    Sweep { epoch: u32 },
    /// `roots_marked` is set once the reporting task has handled MARKROOTS.
    GcUpdate {
        epoch: u32,
        sent: Vec<u64>,
        received: Vec<u64>,
        roots_marked: bool,
    },
    GcAck { epoch: u32, phase: GcPhase },
    Output { bytes: Vec<u8> },
    ReportError { error: TaskError },
    Shutdown,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Fetch { .. } => "FETCH",
            Message::Respond { .. } => "RESPOND",
            Message::Schedule { .. } => "SCHEDULE",
            Message::UpdateRef { .. } => "UPDATEREF",
            Message::Ack { .. } => "ACK",
            Message::Fish { .. } => "FISH",
            Message::StartDistGc { .. } => "STARTDISTGC",
            Message::MarkRoots { .. } => "MARKROOTS",
            Message::MarkEntry { .. } => "MARKENTRY",
            Message::Sweep { .. } => "SWEEP",
            Message::GcUpdate { .. } => "GCUPDATE",
            Message::GcAck { .. } => "GCACK",
            Message::Output { .. } => "OUTPUT",
            Message::ReportError { .. } => "REPORTERROR",
            Message::Shutdown => "SHUTDOWN",
        }
    }

    /// Messages that embed object addresses and are therefore acknowledged,
    /// keeping those addresses in the sender's in-flight set until then.
    pub fn is_counted(&self) -> bool {
        matches!(
            self,
            Message::Fetch { .. } | Message::Respond { .. } | Message::Schedule { .. } | Message::UpdateRef { .. }
        )
    }

    pub fn addresses(&self) -> Vec<GAddr> {
        let mut out = Vec::new();
        match self {
            Message::Fetch { target, store } => out.extend([*target, *store]),
            Message::Respond { store, value } => {
                out.push(*store);
                value.collect_addrs(&mut out);
            }
            Message::Schedule { frames } => {
                for f in frames {
                    out.push(f.tell);
                    f.frame.collect_addrs(&mut out);
                }
            }
            Message::UpdateRef { tell, addr } => out.extend([*tell, *addr]),
            Message::MarkEntry { addrs, .. } => out.extend_from_slice(addrs),
            _ => {}
        }
        out
    }
}
