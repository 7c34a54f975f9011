//! Binary encoding of protocol messages.
//!
//! Every primitive is written with a one-byte type tag in front of it, so
//! the decoder can check that it is reading the field it expects. A frame
//! starts with the protocol version; transports add their own length prefix.

use anyhow::{Result, bail, ensure};

use super::message::{GcPhase, Message, ScheduledFrame, WireArray, WireValue};
use crate::addr::GAddr;
use crate::error::TaskError;
use crate::program::Builtin;

pub const VERSION: u8 = 1;
const MAX_DEPTH: usize = 512;

const P_CHAR: u8 = b'c';
const P_SHORT: u8 = b's';
const P_INT: u8 = b'i';
const P_LONG: u8 = b'l';
const P_DOUBLE: u8 = b'd';
const P_STRING: u8 = b'S';
const P_BINARY: u8 = b'B';
const P_GADDR: u8 = b'G';

const M_FETCH: u8 = 1;
const M_RESPOND: u8 = 2;
const M_SCHEDULE: u8 = 3;
const M_UPDATEREF: u8 = 4;
const M_ACK: u8 = 5;
const M_FISH: u8 = 6;
const M_STARTDISTGC: u8 = 7;
const M_MARKROOTS: u8 = 8;
const M_MARKENTRY: u8 = 9;
const M_SWEEP: u8 = 10;
const M_GCUPDATE: u8 = 11;
const M_GCACK: u8 = 12;
const M_OUTPUT: u8 = 13;
const M_REPORTERROR: u8 = 14;
const M_SHUTDOWN: u8 = 15;

const V_NUMBER: u8 = 1;
const V_NIL: u8 = 2;
const V_REF: u8 = 3;
const V_CONS: u8 = 4;
const V_BYTES: u8 = 5;
const V_VALUES: u8 = 6;
const V_ARRAYREF: u8 = 7;
const V_CAP: u8 = 8;
const V_FRAME: u8 = 9;
const V_SCREF: u8 = 10;
const V_BUILTIN: u8 = 11;

#[derive(Debug, Default)]
pub struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    pub fn write_char(&mut self, v: u8) {
        self.out.push(P_CHAR);
        self.out.push(v);
    }

    pub fn write_short(&mut self, v: u16) {
        self.out.push(P_SHORT);
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_int(&mut self, v: u32) {
        self.out.push(P_INT);
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_long(&mut self, v: u64) {
        self.out.push(P_LONG);
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_double(&mut self, v: f64) {
        self.out.push(P_DOUBLE);
        self.out.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn write_string(&mut self, v: &str) {
        self.out.push(P_STRING);
        self.out.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.out.extend_from_slice(v.as_bytes());
    }

    pub fn write_binary(&mut self, v: &[u8]) {
        self.out.push(P_BINARY);
        self.out.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.out.extend_from_slice(v);
    }

    pub fn write_gaddr(&mut self, a: GAddr) {
        self.out.push(P_GADDR);
        self.out.extend_from_slice(&a.tid.to_le_bytes());
        self.out.extend_from_slice(&a.lid.to_le_bytes());
    }

    fn write_len(&mut self, n: usize) {
        self.write_int(n as u32);
    }

    pub fn write_value(&mut self, v: &WireValue) {
        match v {
            WireValue::Number(n) => {
                self.write_char(V_NUMBER);
                self.write_double(*n);
            }
            WireValue::Nil => self.write_char(V_NIL),
            WireValue::Ref(a) => {
                self.write_char(V_REF);
                self.write_gaddr(*a);
            }
            WireValue::Cons { addr, head, tail } => {
                self.write_char(V_CONS);
                self.write_gaddr(*addr);
                self.write_value(head);
                self.write_value(tail);
            }
            WireValue::Array {
                addr,
                data: WireArray::Bytes(bytes),
            } => {
                self.write_char(V_BYTES);
                self.write_gaddr(*addr);
                self.write_binary(bytes);
            }
            WireValue::Array {
                addr,
                data: WireArray::Values(items),
            } => {
                self.write_char(V_VALUES);
                self.write_gaddr(*addr);
                self.write_len(items.len());
                items.iter().for_each(|item| self.write_value(item));
            }
            WireValue::ArrayRef { addr, array, start } => {
                self.write_char(V_ARRAYREF);
                self.write_gaddr(*addr);
                self.write_int(*start);
                self.write_value(array);
            }
            WireValue::Cap { addr, fno, arity, args } => {
                self.write_char(V_CAP);
                self.write_gaddr(*addr);
                self.write_int(*fno);
                self.write_int(*arity);
                self.write_len(args.len());
                args.iter().for_each(|a| self.write_value(a));
            }
            WireValue::Frame { addr, fno, pc, slots } => {
                self.write_char(V_FRAME);
                self.write_gaddr(*addr);
                self.write_int(*fno);
                self.write_int(*pc);
                self.write_len(slots.len());
                slots.iter().for_each(|s| self.write_value(s));
            }
            WireValue::Scref(fno) => {
                self.write_char(V_SCREF);
                self.write_int(*fno);
            }
            WireValue::Builtin(b) => {
                self.write_char(V_BUILTIN);
                self.write_short(b.id());
            }
        }
    }
}

pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.out.push(VERSION);
    match msg {
        Message::Fetch { target, store } => {
            enc.write_char(M_FETCH);
            enc.write_gaddr(*target);
            enc.write_gaddr(*store);
        }
        Message::Respond { store, value } => {
            enc.write_char(M_RESPOND);
            enc.write_gaddr(*store);
            enc.write_value(value);
        }
        Message::Schedule { frames } => {
            enc.write_char(M_SCHEDULE);
            enc.write_len(frames.len());
            for f in frames {
                enc.write_gaddr(f.tell);
                enc.write_value(&f.frame);
            }
        }
        Message::UpdateRef { tell, addr } => {
            enc.write_char(M_UPDATEREF);
            enc.write_gaddr(*tell);
            enc.write_gaddr(*addr);
        }
        Message::Ack { count, addr_count } => {
            enc.write_char(M_ACK);
            enc.write_int(*count);
            enc.write_int(*addr_count);
        }
        Message::Fish { from, hops, count } => {
            enc.write_char(M_FISH);
            enc.write_int(*from);
            enc.write_int(*hops);
            enc.write_int(*count);
        }
        Message::StartDistGc { epoch } => {
            enc.write_char(M_STARTDISTGC);
            enc.write_int(*epoch);
        }
        Message::MarkRoots { epoch } => {
            enc.write_char(M_MARKROOTS);
            enc.write_int(*epoch);
        }
        Message::MarkEntry { epoch, addrs } => {
            enc.write_char(M_MARKENTRY);
            enc.write_int(*epoch);
            enc.write_len(addrs.len());
            addrs.iter().for_each(|a| enc.write_gaddr(*a));
        }
        Message::Sweep { epoch } => {
            enc.write_char(M_SWEEP);
            enc.write_int(*epoch);
        }
        Message::GcUpdate {
            epoch,
            sent,
            received,
            roots_marked,
        } => {
            enc.write_char(M_GCUPDATE);
            enc.write_int(*epoch);
            enc.write_char(u8::from(*roots_marked));
            enc.write_len(sent.len());
            sent.iter().for_each(|n| enc.write_long(*n));
            enc.write_len(received.len());
            received.iter().for_each(|n| enc.write_long(*n));
        }
        Message::GcAck { epoch, phase } => {
            enc.write_char(M_GCACK);
            enc.write_int(*epoch);
            enc.write_char(match phase {
                GcPhase::Started => 0,
                GcPhase::Swept => 1,
            });
        }
        Message::Output { bytes } => {
            enc.write_char(M_OUTPUT);
            enc.write_binary(bytes);
        }
        Message::ReportError { error } => {
            enc.write_char(M_REPORTERROR);
            enc.write_int(error.task);
            enc.write_string(&error.message);
            enc.write_string(&error.location);
        }
        Message::Shutdown => enc.write_char(M_SHUTDOWN),
    }
    enc.finish()
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    cursor: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            cursor: 0,
            depth: 0,
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.cursor == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.cursor + n <= self.bytes.len(),
            "unexpected end of frame at offset {} (need {} bytes)",
            self.cursor,
            n
        );
        let slice = &self.bytes[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    fn expect(&mut self, tag: u8, what: &str) -> Result<()> {
        let at = self.cursor;
        let found = self.take(1)?[0];
        ensure!(
            found == tag,
            "expected {} (tag {:?}) at offset {}, found tag {:?}",
            what,
            tag as char,
            at,
            found as char
        );
        Ok(())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub fn read_char(&mut self) -> Result<u8> {
        self.expect(P_CHAR, "char")?;
        Ok(self.take(1)?[0])
    }

    pub fn read_short(&mut self) -> Result<u16> {
        self.expect(P_SHORT, "short")?;
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn read_int(&mut self) -> Result<u32> {
        self.expect(P_INT, "int")?;
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn read_long(&mut self) -> Result<u64> {
        self.expect(P_LONG, "long")?;
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.expect(P_DOUBLE, "double")?;
        Ok(f64::from_bits(u64::from_le_bytes(self.array()?)))
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.expect(P_STRING, "string")?;
        let len = u32::from_le_bytes(self.array()?) as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    pub fn read_binary(&mut self) -> Result<Vec<u8>> {
        self.expect(P_BINARY, "binary")?;
        let len = u32::from_le_bytes(self.array()?) as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_gaddr(&mut self) -> Result<GAddr> {
        self.expect(P_GADDR, "address")?;
        let tid = u32::from_le_bytes(self.array()?);
        let lid = u32::from_le_bytes(self.array()?);
        Ok(GAddr::new(tid, lid))
    }

    /// Element count, bounded by what the rest of the frame could hold.
    fn read_len(&mut self) -> Result<usize> {
        let n = self.read_int()? as usize;
        ensure!(
            n <= self.bytes.len() - self.cursor,
            "element count {} exceeds remaining frame",
            n
        );
        Ok(n)
    }

    pub fn read_value(&mut self) -> Result<WireValue> {
        self.depth += 1;
        ensure!(self.depth <= MAX_DEPTH, "value nesting deeper than {}", MAX_DEPTH);
        let v = self.read_value_inner();
        self.depth -= 1;
        v
    }

    fn read_value_inner(&mut self) -> Result<WireValue> {
        let tag = self.read_char()?;
        Ok(match tag {
            V_NUMBER => WireValue::Number(self.read_double()?),
            V_NIL => WireValue::Nil,
            V_REF => WireValue::Ref(self.read_gaddr()?),
            V_CONS => {
                let addr = self.read_gaddr()?;
                let head = Box::new(self.read_value()?);
                let tail = Box::new(self.read_value()?);
                WireValue::Cons { addr, head, tail }
            }
            V_BYTES => {
                let addr = self.read_gaddr()?;
                WireValue::Array {
                    addr,
                    data: WireArray::Bytes(self.read_binary()?),
                }
            }
            V_VALUES => {
                let addr = self.read_gaddr()?;
                let n = self.read_len()?;
                let items = (0..n).map(|_| self.read_value()).collect::<Result<Vec<_>>>()?;
                WireValue::Array {
                    addr,
                    data: WireArray::Values(items),
                }
            }
            V_ARRAYREF => {
                let addr = self.read_gaddr()?;
                let start = self.read_int()?;
                let array = Box::new(self.read_value()?);
                WireValue::ArrayRef { addr, array, start }
            }
            V_CAP => {
                let addr = self.read_gaddr()?;
                let fno = self.read_int()?;
                let arity = self.read_int()?;
                let n = self.read_len()?;
                let args = (0..n).map(|_| self.read_value()).collect::<Result<Vec<_>>>()?;
                WireValue::Cap { addr, fno, arity, args }
            }
            V_FRAME => {
                let addr = self.read_gaddr()?;
                let fno = self.read_int()?;
                let pc = self.read_int()?;
                let n = self.read_len()?;
                let slots = (0..n).map(|_| self.read_value()).collect::<Result<Vec<_>>>()?;
                WireValue::Frame { addr, fno, pc, slots }
            }
            V_SCREF => WireValue::Scref(self.read_int()?),
            V_BUILTIN => {
                let id = self.read_short()?;
                match Builtin::from_id(id) {
                    Some(b) => WireValue::Builtin(b),
                    None => bail!("unknown builtin id {}", id),
                }
            }
            other => bail!("unknown value tag {}", other),
        })
    }
}

pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    ensure!(!bytes.is_empty(), "empty frame");
    ensure!(
        bytes[0] == VERSION,
        "protocol version mismatch: got {}, expected {}",
        bytes[0],
        VERSION
    );
    let mut d = Decoder::new(&bytes[1..]);
    let tag = d.read_char()?;
    let msg = match tag {
        M_FETCH => Message::Fetch {
            target: d.read_gaddr()?,
            store: d.read_gaddr()?,
        },
        M_RESPOND => Message::Respond {
            store: d.read_gaddr()?,
            value: d.read_value()?,
        },
        M_SCHEDULE => {
            let n = d.read_len()?;
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                let tell = d.read_gaddr()?;
                let frame = d.read_value()?;
                ensure!(matches!(frame, WireValue::Frame { .. }), "SCHEDULE entry is not a frame");
                frames.push(ScheduledFrame { tell, frame });
            }
            Message::Schedule { frames }
        }
        M_UPDATEREF => Message::UpdateRef {
            tell: d.read_gaddr()?,
            addr: d.read_gaddr()?,
        },
        M_ACK => Message::Ack {
            count: d.read_int()?,
            addr_count: d.read_int()?,
        },
        M_FISH => Message::Fish {
            from: d.read_int()?,
            hops: d.read_int()?,
            count: d.read_int()?,
        },
        M_STARTDISTGC => Message::StartDistGc { epoch: d.read_int()? },
        M_MARKROOTS => Message::MarkRoots { epoch: d.read_int()? },
        M_MARKENTRY => {
            let epoch = d.read_int()?;
            let n = d.read_len()?;
            let addrs = (0..n).map(|_| d.read_gaddr()).collect::<Result<Vec<_>>>()?;
            Message::MarkEntry { epoch, addrs }
        }
        M_SWEEP => Message::Sweep { epoch: d.read_int()? },
        M_GCUPDATE => {
            let epoch = d.read_int()?;
            let roots_marked = match d.read_char()? {
                0 => false,
                1 => true,
                other => bail!("bad roots flag {}", other),
            };
            let n = d.read_len()?;
            let sent = (0..n).map(|_| d.read_long()).collect::<Result<Vec<_>>>()?;
            let n = d.read_len()?;
            let received = (0..n).map(|_| d.read_long()).collect::<Result<Vec<_>>>()?;
            Message::GcUpdate {
                epoch,
                sent,
                received,
                roots_marked,
            }
        }
        M_GCACK => {
            let epoch = d.read_int()?;
            let phase = match d.read_char()? {
                0 => GcPhase::Started,
                1 => GcPhase::Swept,
                other => bail!("unknown gc phase {}", other),
            };
            Message::GcAck { epoch, phase }
        }
        M_OUTPUT => Message::Output { bytes: d.read_binary()? },
        M_REPORTERROR => Message::ReportError {
            error: TaskError {
                task: d.read_int()?,
                message: d.read_string()?,
                location: d.read_string()?,
            },
        },
        M_SHUTDOWN => Message::Shutdown,
        other => bail!("unknown message tag {}", other),
    };
    ensure!(d.is_at_end(), "trailing bytes after {}", msg.name());
    Ok(msg)
}
