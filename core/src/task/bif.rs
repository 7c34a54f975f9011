use tracing::trace;

use super::{SysObjectId, SysObjectKind, Task};
use crate::error::{RtResult, RuntimeError};
use crate::heap::{ArrayData, CellKind, Pntr, View};
use crate::net::{IoOp, IoRequest};
use crate::program::Builtin;
use crate::value::format_number;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BifOutcome {
    Value(Pntr),
    /// Park the frame on this system object and run the builtin again later.
    Block(SysObjectId),
}

fn app_err<T>(msg: impl Into<String>) -> RtResult<T> {
    Err(RuntimeError::app(msg))
}

impl Task {
    fn truth(&self, b: bool) -> Pntr {
        if b { Pntr::number(1.0) } else { self.heap.nil() }
    }

    fn int(&self, p: Pntr, b: Builtin) -> RtResult<i64> {
        Ok(self.number(p, b.name())? as i64)
    }

    fn sysobj_arg(&self, p: Pntr, b: Builtin) -> RtResult<SysObjectId> {
        match self.heap.view(p)? {
            View::Cell(_, CellKind::SysObject(id)) => Ok(*id),
            other => app_err(format!("{} expects a connection, got {}", b.name(), other.type_name())),
        }
    }

    /// Bytes of a string-like value: a byte array, a suffix of one, an array
    /// of numbers or an evaluated list of numbers.
    pub(crate) fn flatten_bytes(&self, p: Pntr) -> RtResult<Option<Vec<u8>>> {
        let mut out = Vec::new();
        let mut p = p;
        loop {
            match self.heap.view(p)? {
                View::Cell(_, CellKind::Nil) => return Ok(Some(out)),
                View::Cell(_, CellKind::Array(data)) => {
                    self.append_array(data, 0, &mut out)?;
                    return Ok(Some(out));
                }
                View::Cell(_, CellKind::ArrayRef { array, start }) => {
                    if let CellKind::Array(data) = self.heap.raw(*array)? {
                        self.append_array(data, *start, &mut out)?;
                        return Ok(Some(out));
                    }
                    return Ok(None);
                }
                View::Cell(_, CellKind::Cons(h, t)) => {
                    match self.heap.view(*h)? {
                        View::Number(n) => out.push(n as u8),
                        _ => return Ok(None),
                    }
                    p = *t;
                }
                _ => return Ok(None),
            }
        }
    }

    fn append_array(&self, data: &ArrayData, start: usize, out: &mut Vec<u8>) -> RtResult<()> {
        match data {
            ArrayData::Bytes(b) => out.extend_from_slice(b.get(start..).unwrap_or(&[])),
            ArrayData::Values(items) => {
                for item in items.iter().skip(start) {
                    match self.heap.view(*item)? {
                        View::Number(n) => out.push(n as u8),
                        other => return app_err(format!("string element is a {}", other.type_name())),
                    }
                }
            }
        }
        Ok(())
    }

    fn string_arg(&self, p: Pntr, b: Builtin) -> RtResult<Vec<u8>> {
        match self.flatten_bytes(p)? {
            Some(bytes) => Ok(bytes),
            None => app_err(format!("{} expects a string", b.name())),
        }
    }

    pub(crate) fn call_builtin(&mut self, b: Builtin, args: &[Pntr]) -> RtResult<BifOutcome> {
        use Builtin::*;
        let arg = |i: usize| args.get(i).copied().ok_or_else(|| crate::fatal!("{} missing argument {}", b.name(), i));
        trace!(target: "nreduce::task", builtin = b.name(), "exec.bif");
        let v = match b {
            Add | Sub | Mul | Div | Mod => {
                let x = self.number(arg(0)?, b.name())?;
                let y = self.number(arg(1)?, b.name())?;
                if matches!(b, Div | Mod) && y == 0.0 {
                    return app_err("division by zero");
                }
                Pntr::number(match b {
                    Add => x + y,
                    Sub => x - y,
                    Mul => x * y,
                    Div => x / y,
                    _ => x % y,
                })
            }
            Eq | Ne | Lt | Le | Gt | Ge => {
                let x = self.number(arg(0)?, b.name())?;
                let y = self.number(arg(1)?, b.name())?;
                self.truth(match b {
                    Eq => x == y,
                    Ne => x != y,
                    Lt => x < y,
                    Le => x <= y,
                    Gt => x > y,
                    _ => x >= y,
                })
            }
            Neg | Floor | Ceil | Sqrt => {
                let x = self.number(arg(0)?, b.name())?;
                Pntr::number(match b {
                    Neg => -x,
                    Floor => x.floor(),
                    Ceil => x.ceil(),
                    _ => x.sqrt(),
                })
            }
            BitAnd | BitOr | BitXor | Shl | Shr => {
                let x = self.int(arg(0)?, b)?;
                let y = self.int(arg(1)?, b)?;
                let r = match b {
                    BitAnd => x & y,
                    BitOr => x | y,
                    BitXor => x ^ y,
                    Shl => x.wrapping_shl((y & 63) as u32),
                    _ => x.wrapping_shr((y & 63) as u32),
                };
                Pntr::number(r as f64)
            }
            BitNot => Pntr::number(!self.int(arg(0)?, b)? as f64),
            Not => {
                let nil = self.heap.is_nil(arg(0)?)?;
                self.truth(nil)
            }
            And => {
                if self.heap.is_nil(arg(0)?)? {
                    self.heap.nil()
                } else {
                    arg(1)?
                }
            }
            Or => {
                if self.heap.is_nil(arg(0)?)? {
                    arg(1)?
                } else {
                    arg(0)?
                }
            }
            Cons => self.heap.cons(arg(0)?, arg(1)?),
            Head | Tail => self.head_tail(b, arg(0)?)?,
            IsPair => {
                let pair = matches!(
                    self.heap.view(arg(0)?)?,
                    View::Cell(_, CellKind::Cons(..) | CellKind::Array(_) | CellKind::ArrayRef { .. })
                );
                self.truth(pair)
            }
            IsNumber => {
                let num = matches!(self.heap.view(arg(0)?)?, View::Number(_));
                self.truth(num)
            }
            IsNil => {
                let nil = self.heap.is_nil(arg(0)?)?;
                self.truth(nil)
            }
            ArraySize => {
                let len = match self.heap.view(arg(0)?)? {
                    View::Cell(_, CellKind::Nil) => 0,
                    View::Cell(_, CellKind::Array(data)) => data.len(),
                    View::Cell(_, CellKind::ArrayRef { array, start }) => match self.heap.raw(*array)? {
                        CellKind::Array(data) => data.len().saturating_sub(*start),
                        _ => 0,
                    },
                    other => return app_err(format!("arraysize of a {}", other.type_name())),
                };
                Pntr::number(len as f64)
            }
            ArrayItem => {
                let idx = self.number(arg(1)?, b.name())?;
                if idx < 0.0 {
                    return app_err(format!("index {} out of range", idx));
                }
                self.array_at(arg(0)?, idx as usize)?
            }
            ArraySkip => {
                let n = self.number(arg(1)?, b.name())?.max(0.0) as usize;
                match self.heap.view(arg(0)?)? {
                    View::Cell(_, CellKind::Nil) => self.heap.nil(),
                    View::Cell(id, CellKind::Array(_)) => self.heap.array_suffix(id, n)?,
                    View::Cell(_, CellKind::ArrayRef { array, start }) => {
                        let (array, start) = (*array, *start);
                        self.heap.array_suffix(array, start + n)?
                    }
                    other => return app_err(format!("arrayskip of a {}", other.type_name())),
                }
            }
            NumToString => {
                let n = self.number(arg(0)?, b.name())?;
                self.heap.bytes(format_number(n).as_bytes())
            }
            StrLen => {
                let s = self.string_arg(arg(0)?, b)?;
                Pntr::number(s.len() as f64)
            }
            Print => {
                let bytes = match self.heap.view(arg(0)?)? {
                    View::Number(n) => format_number(n).into_bytes(),
                    _ => self.string_arg(arg(0)?, b)?,
                };
                if self.tid == 0 {
                    self.output.extend_from_slice(&bytes);
                } else {
                    self.send(0, crate::wire::Message::Output { bytes })?;
                }
                self.heap.nil()
            }
            Connect => {
                let host = String::from_utf8_lossy(&self.string_arg(arg(0)?, b)?).into_owned();
                let port = self.port_arg(arg(1)?, b)?;
                let id = self.sysobjects.create(SysObjectKind::Connection);
                self.submit_io(IoRequest {
                    sysobj: id,
                    op: IoOp::Connect { host, port },
                })?;
                self.heap.alloc(CellKind::SysObject(id))
            }
            Listen => {
                let port = self.port_arg(arg(0)?, b)?;
                let id = self.sysobjects.create(SysObjectKind::Listener);
                self.submit_io(IoRequest {
                    sysobj: id,
                    op: IoOp::Listen { port },
                })?;
                self.heap.alloc(CellKind::SysObject(id))
            }
            Accept => return self.accept(arg(0)?),
            Read => return self.read(arg(0)?),
            Write => return self.write(arg(0)?, arg(1)?),
            Close => {
                let id = self.sysobj_arg(arg(0)?, b)?;
                let obj = self.sysobjects.get_mut(id)?;
                if !obj.closed {
                    obj.closed = true;
                    self.submit_io(IoRequest { sysobj: id, op: IoOp::Close })?;
                }
                self.heap.nil()
            }
            IoError => {
                let id = self.sysobj_arg(arg(0)?, b)?;
                let obj = self.sysobjects.get(id)?;
                if obj.error {
                    let message = obj.message.clone();
                    self.heap.bytes(message.as_bytes())
                } else {
                    self.heap.nil()
                }
            }
        };
        Ok(BifOutcome::Value(v))
    }

    fn port_arg(&self, p: Pntr, b: Builtin) -> RtResult<u16> {
        let n = self.number(p, b.name())?;
        if !(0.0..=65535.0).contains(&n) || n.fract() != 0.0 {
            return app_err(format!("{}: invalid port {}", b.name(), n));
        }
        Ok(n as u16)
    }

    fn head_tail(&mut self, b: Builtin, p: Pntr) -> RtResult<Pntr> {
        let head = b == Builtin::Head;
        match self.heap.view(p)? {
            View::Cell(_, CellKind::Cons(h, t)) => Ok(if head { *h } else { *t }),
            View::Cell(id, CellKind::Array(data)) => {
                if head {
                    data.item(0).ok_or_else(|| RuntimeError::app("head of an empty array"))
                } else {
                    self.heap.array_suffix(id, 1)
                }
            }
            View::Cell(_, CellKind::ArrayRef { array, start }) => {
                let (array, start) = (*array, *start);
                if head {
                    self.array_at(Pntr::cell(array), start)
                } else {
                    self.heap.array_suffix(array, start + 1)
                }
            }
            other => app_err(format!("{} of {}", b.name(), other.type_name())),
        }
    }

    fn array_at(&self, p: Pntr, idx: usize) -> RtResult<Pntr> {
        let item = match self.heap.view(p)? {
            View::Cell(_, CellKind::Array(data)) => data.item(idx),
            View::Cell(_, CellKind::ArrayRef { array, start }) => match self.heap.raw(*array)? {
                CellKind::Array(data) => data.item(start + idx),
                _ => None,
            },
            other => return app_err(format!("arrayitem of a {}", other.type_name())),
        };
        item.ok_or_else(|| RuntimeError::app(format!("index {} out of range", idx)))
    }

    fn accept(&mut self, listener: Pntr) -> RtResult<BifOutcome> {
        let id = self.sysobj_arg(listener, Builtin::Accept)?;
        let obj = self.sysobjects.get_mut(id)?;
        if let Some(conn) = obj.accepted.pop_front() {
            return Ok(BifOutcome::Value(self.heap.alloc(CellKind::SysObject(conn))));
        }
        if obj.error || obj.closed {
            return Ok(BifOutcome::Value(self.heap.nil()));
        }
        if !obj.accept_pending {
            obj.accept_pending = true;
            let conn = self.sysobjects.reserve();
            self.submit_io(IoRequest {
                sysobj: id,
                op: IoOp::Accept { conn },
            })?;
        }
        Ok(BifOutcome::Block(id))
    }

    fn read(&mut self, conn: Pntr) -> RtResult<BifOutcome> {
        let id = self.sysobj_arg(conn, Builtin::Read)?;
        let obj = self.sysobjects.get_mut(id)?;
        if let Some(data) = obj.incoming.pop_front() {
            return Ok(BifOutcome::Value(self.heap.bytes(&data)));
        }
        if obj.eof || obj.error || obj.closed {
            return Ok(BifOutcome::Value(self.heap.nil()));
        }
        if !obj.read_pending {
            obj.read_pending = true;
            self.submit_io(IoRequest { sysobj: id, op: IoOp::Read })?;
        }
        Ok(BifOutcome::Block(id))
    }

    fn write(&mut self, conn: Pntr, data: Pntr) -> RtResult<BifOutcome> {
        let id = self.sysobj_arg(conn, Builtin::Write)?;
        let obj = self.sysobjects.get(id)?;
        if obj.write_done {
            self.sysobjects.get_mut(id)?.write_done = false;
            return Ok(BifOutcome::Value(Pntr::number(1.0)));
        }
        if obj.error || obj.closed {
            return Ok(BifOutcome::Value(self.heap.nil()));
        }
        if !obj.write_pending {
            let bytes = self.string_arg(data, Builtin::Write)?;
            self.sysobjects.get_mut(id)?.write_pending = true;
            self.submit_io(IoRequest {
                sysobj: id,
                op: IoOp::Write { data: bytes },
            })?;
        }
        Ok(BifOutcome::Block(id))
    }
}
