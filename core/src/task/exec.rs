//! Bytecode interpreter.
//!
//! `step` executes one instruction of the running frame. An instruction that
//! has to wait (for another frame, a remote value, a hole or a socket)
//! blocks the frame without advancing its pc, so the same instruction runs
//! again when the frame is woken.

use tracing::trace;

use super::bif::BifOutcome;
use super::{Frame, FrameId, FrameState, Hole, ResultDest, Task};
use crate::addr::{GlobalId, WaitQueue};
use crate::error::{RtResult, RuntimeError};
use crate::fatal;
use crate::heap::{Cap, CellId, CellKind, Pntr, View};
use crate::program::Instr;

/// Outcome of demanding a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Forced {
    Value(Pntr),
    Blocked,
}

/// What a resolved cell needs before it is a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Demand {
    Whnf,
    Apply(Pntr, Pntr),
    Call(u32),
    Frame(FrameId),
    Remote(GlobalId),
    Hole,
}

impl Task {
    pub(crate) fn demand(&self, id: CellId) -> RtResult<Demand> {
        Ok(match self.heap.raw(id)? {
            CellKind::Application(f, a) => Demand::Apply(*f, *a),
            CellKind::Scref(fno) if self.program.function(*fno)?.arity == 0 => Demand::Call(*fno),
            CellKind::Frame(fid) => Demand::Frame(*fid),
            CellKind::Remote(g) => Demand::Remote(*g),
            CellKind::Hole => Demand::Hole,
            CellKind::Ind(_) => return Err(fatal!("unresolved indirection at cell {}", id.0)),
            _ => Demand::Whnf,
        })
    }

    /// Allocate a frame together with the cell that names it.
    pub(crate) fn spawn_frame(&mut self, fno: u32, pc: u32, slots: Vec<Pntr>) -> RtResult<(FrameId, CellId)> {
        let depth = self.program.function(fno)?.stack_depth as usize;
        let cell = self.heap.alloc_id(CellKind::Hole);
        let fid = self.frames.alloc(Frame::new(fno, pc, slots, depth, ResultDest::Cell(cell)));
        self.heap.set(cell, CellKind::Frame(fid))?;
        Ok((fid, cell))
    }

    /// Rewrite a suspended application in place as an unstarted frame.
    pub(crate) fn thunk_to_frame(&mut self, id: CellId, demand: Demand) -> RtResult<FrameId> {
        let (fno, slots) = match demand {
            Demand::Apply(f, a) => (self.program.apply_stub, vec![a, f]),
            Demand::Call(fno) => (fno, Vec::new()),
            other => return Err(fatal!("cell {} is not a thunk ({:?})", id.0, other)),
        };
        let info = self.program.function(fno)?;
        let (pc, depth) = (info.address, info.stack_depth as usize);
        let fid = self.frames.alloc(Frame::new(fno, pc, slots, depth, ResultDest::Cell(id)));
        self.heap.set(id, CellKind::Frame(fid))?;
        trace!(target: "nreduce::task", cell = id.0, frame = %fid, "exec.thunk");
        Ok(fid)
    }

    pub(crate) fn block(&mut self, fid: FrameId) -> RtResult<()> {
        self.frames.transition(fid, FrameState::Blocked)?;
        if self.running == Some(fid) {
            self.running = None;
        }
        Ok(())
    }

    pub(crate) fn make_ready(&mut self, fid: FrameId) -> RtResult<()> {
        self.frames.transition(fid, FrameState::Ready)?;
        self.run_queue.push_back(fid);
        Ok(())
    }

    /// Release everyone waiting on a value that is now available as `p`.
    pub(crate) fn wake(&mut self, wq: WaitQueue, p: Pntr) -> RtResult<()> {
        for fid in wq.frames {
            self.make_ready(fid)?;
        }
        for fetcher in wq.fetchers {
            self.serve_fetch(fetcher, p)?;
        }
        Ok(())
    }

    /// Bring `p` to weak head normal form on behalf of `fid`, or block `fid`
    /// until that is possible.
    pub(crate) fn force(&mut self, fid: FrameId, p: Pntr) -> RtResult<Forced> {
        let p = self.heap.resolve(p)?;
        let Some(id) = p.as_cell() else {
            return Ok(Forced::Value(p));
        };
        loop {
            match self.demand(id)? {
                Demand::Whnf => return Ok(Forced::Value(p)),
                d @ (Demand::Apply(..) | Demand::Call(_)) => {
                    self.thunk_to_frame(id, d)?;
                }
                Demand::Frame(target) => {
                    self.await_frame(fid, target)?;
                    return Ok(Forced::Blocked);
                }
                Demand::Remote(g) => {
                    self.await_remote(fid, id, g)?;
                    return Ok(Forced::Blocked);
                }
                Demand::Hole => {
                    self.await_hole(fid, id)?;
                    return Ok(Forced::Blocked);
                }
            }
        }
    }

    fn await_frame(&mut self, fid: FrameId, target: FrameId) -> RtResult<()> {
        if target == fid {
            return Err(RuntimeError::app("infinite loop: value depends on itself"));
        }
        match self.frames.state(target)? {
            state @ (FrameState::New | FrameState::Sparked) => {
                if state == FrameState::Sparked {
                    self.sparks.retain(|f| *f != target);
                }
                self.frames.get_mut(target)?.wq.frames.push(fid);
                self.block(fid)?;
                self.frames.transition(target, FrameState::Running)?;
                self.running = Some(target);
            }
            FrameState::Ready | FrameState::Running | FrameState::Blocked => {
                self.frames.get_mut(target)?.wq.frames.push(fid);
                self.block(fid)?;
            }
            FrameState::Done | FrameState::Free => {
                return Err(fatal!("frame {} is finished but its cell was not updated", target));
            }
        }
        Ok(())
    }

    fn await_remote(&mut self, fid: FrameId, cell: CellId, gid: GlobalId) -> RtResult<()> {
        let g = self.globals.get_mut(gid)?;
        g.wq.frames.push(fid);
        let fetch = !g.fetching && !g.pending;
        self.block(fid)?;
        if fetch {
            self.fetch(gid, cell)?;
        }
        Ok(())
    }

    fn await_hole(&mut self, fid: FrameId, cell: CellId) -> RtResult<()> {
        let hole = self
            .holes
            .get_mut(&cell)
            .ok_or_else(|| fatal!("hole at cell {} has no owner", cell.0))?;
        if hole.creator == fid {
            return Err(RuntimeError::app("black hole: value defined in terms of itself"));
        }
        hole.wq.frames.push(fid);
        self.block(fid)
    }

    /// Publish a frame's result, wake its waiters and recycle it.
    pub(crate) fn complete(&mut self, fid: FrameId, value: Pntr) -> RtResult<()> {
        let frame = self.frames.get_mut(fid)?;
        let wq = std::mem::take(&mut frame.wq);
        let dest = frame.dest;
        let woken = match dest {
            ResultDest::Cell(cell) => {
                if self.heap.resolve(value)? == Pntr::cell(cell) {
                    return Err(RuntimeError::app("infinite loop: function returned itself"));
                }
                self.heap.make_ind(cell, value)?;
                Pntr::cell(cell)
            }
            ResultDest::Slot { frame, slot } => {
                self.frames.get_mut(frame)?.set_slot(slot, value)?;
                value
            }
        };
        self.frames.transition(fid, FrameState::Done)?;
        self.frames.release(fid)?;
        if self.running == Some(fid) {
            self.running = None;
        }
        trace!(target: "nreduce::task", frame = %fid, waiters = wq.len(), "exec.return");
        self.wake(wq, woken)
    }

    fn advance(&mut self, fid: FrameId) -> RtResult<()> {
        self.frames.get_mut(fid)?.pc += 1;
        Ok(())
    }

    fn push(&mut self, fid: FrameId, p: Pntr) -> RtResult<()> {
        let frame = self.frames.get_mut(fid)?;
        frame.push(p);
        frame.pc += 1;
        Ok(())
    }

    pub(crate) fn number(&self, p: Pntr, what: &str) -> RtResult<f64> {
        match self.heap.view(p)? {
            View::Number(n) => Ok(n),
            other => Err(RuntimeError::app(format!(
                "{} expects a number, got {}",
                what,
                other.type_name()
            ))),
        }
    }

    /// Execute one instruction of the running frame `fid`.
    pub(crate) fn step(&mut self, fid: FrameId) -> RtResult<()> {
        let pc = self.frames.get(fid)?.pc;
        let instr = self.program.instr(pc)?;
        self.stats.instructions += 1;
        match instr {
            Instr::Begin | Instr::End => Err(fatal!("frame {} ran into a program marker at {}", fid, pc)),
            Instr::GlobStart(_) => self.advance(fid),
            Instr::Eval(slot) => {
                let p = self.frames.get(fid)?.slot(slot)?;
                if let Forced::Value(v) = self.force(fid, p)? {
                    let frame = self.frames.get_mut(fid)?;
                    frame.set_slot(slot, v)?;
                    frame.pc += 1;
                }
                Ok(())
            }
            Instr::Return => {
                let v = self.frames.get_mut(fid)?.pop()?;
                self.complete(fid, v)
            }
            Instr::Do => self.apply(fid),
            Instr::Call(fno) => self.call(fid, fno),
            Instr::Jfalse(target) => {
                let v = self.frames.get_mut(fid)?.pop()?;
                let nil = self.heap.is_nil(v)?;
                let frame = self.frames.get_mut(fid)?;
                frame.pc = if nil { target } else { pc + 1 };
                Ok(())
            }
            Instr::Jump(target) => {
                self.frames.get_mut(fid)?.pc = target;
                Ok(())
            }
            Instr::JCmp(op, target) => {
                let frame = self.frames.get_mut(fid)?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                let a = self.number(a, "comparison")?;
                let b = self.number(b, "comparison")?;
                self.frames.get_mut(fid)?.pc = if op.test(a, b) { pc + 1 } else { target };
                Ok(())
            }
            Instr::Push(slot) => {
                let p = self.frames.get(fid)?.slot(slot)?;
                self.push(fid, p)
            }
            Instr::Pop(n) => {
                let frame = self.frames.get_mut(fid)?;
                frame.pop_n(n as usize)?;
                frame.pc += 1;
                Ok(())
            }
            Instr::Squeeze { keep, remove } => {
                let frame = self.frames.get_mut(fid)?;
                let len = frame.slots.len();
                let (keep, remove) = (keep as usize, remove as usize);
                if keep + remove > len {
                    return Err(fatal!("squeeze {}/{} on a stack of {}", keep, remove, len));
                }
                frame.slots.drain(len - keep - remove..len - keep);
                frame.pc += 1;
                Ok(())
            }
            Instr::Alloc(n) => {
                for _ in 0..n {
                    let id = self.heap.alloc_id(CellKind::Hole);
                    self.holes.insert(
                        id,
                        Hole {
                            creator: fid,
                            wq: WaitQueue::default(),
                        },
                    );
                    self.frames.get_mut(fid)?.push(Pntr::cell(id));
                }
                self.advance(fid)
            }
            Instr::Update(slot) => {
                let frame = self.frames.get_mut(fid)?;
                let v = frame.pop()?;
                let target = frame.slot(slot)?;
                frame.pc += 1;
                self.fill_hole(target, v)
            }
            Instr::MkCap { fno, n } => {
                let arity = self.program.function(fno)?.arity;
                let args = self.frames.get_mut(fid)?.pop_n(n as usize)?;
                let cap = self.heap.alloc(CellKind::Cap(Box::new(Cap { fno, arity, args })));
                self.push(fid, cap)
            }
            Instr::MkFrame { fno, n } => {
                let entry = self.program.function(fno)?.address;
                let args = self.frames.get_mut(fid)?.pop_n(n as usize)?;
                let (_, cell) = self.spawn_frame(fno, entry, args)?;
                self.push(fid, Pntr::cell(cell))
            }
            Instr::MkAp => {
                let frame = self.frames.get_mut(fid)?;
                let fun = frame.pop()?;
                let arg = frame.pop()?;
                let ap = self.heap.alloc(CellKind::Application(fun, arg));
                self.push(fid, ap)
            }
            Instr::PushFn(fno) => {
                let p = self.heap.alloc(CellKind::Scref(fno));
                self.push(fid, p)
            }
            Instr::PushBuiltin(b) => {
                let p = self.heap.alloc(CellKind::Builtin(b));
                self.push(fid, p)
            }
            Instr::Spark(slot) => {
                let p = self.frames.get(fid)?.slot(slot)?;
                self.spark(p)?;
                self.advance(fid)
            }
            Instr::Bif(b) => {
                let arity = b.arity() as usize;
                let args = {
                    let frame = self.frames.get(fid)?;
                    let len = frame.slots.len();
                    if len < arity {
                        return Err(fatal!("{} needs {} arguments, stack holds {}", b.name(), arity, len));
                    }
                    frame.slots[len - arity..].to_vec()
                };
                match self.call_builtin(b, &args)? {
                    BifOutcome::Value(v) => {
                        let frame = self.frames.get_mut(fid)?;
                        frame.pop_n(arity)?;
                        frame.push(v);
                        frame.pc += 1;
                        Ok(())
                    }
                    BifOutcome::Block(sid) => {
                        self.sysobjects.get_mut(sid)?.waiters.push(fid);
                        self.block(fid)
                    }
                }
            }
            Instr::PushNil => {
                let nil = self.heap.nil();
                self.push(fid, nil)
            }
            Instr::PushNumber(n) => self.push(fid, Pntr::number(n)),
            Instr::PushString(idx) => {
                let s = self.program.string(idx)?;
                let p = self.heap.bytes(s.as_bytes());
                self.push(fid, p)
            }
            Instr::ConsN(n) => {
                let mut items = self.frames.get_mut(fid)?.pop_n(n as usize + 1)?;
                let mut list = items.pop().ok_or_else(|| fatal!("ConsN without a tail"))?;
                for x in items.into_iter().rev() {
                    list = self.heap.cons(x, list);
                }
                self.push(fid, list)
            }
            Instr::ArrayN(n) => {
                let items = self.frames.get_mut(fid)?.pop_n(n as usize)?;
                let arr = self.heap.values(items);
                self.push(fid, arr)
            }
            Instr::ItemN(n) => {
                let top = self.frames.get_mut(fid)?.pop()?;
                let item = self.item(top, n as usize)?;
                self.push(fid, item)
            }
        }
    }

    /// `Do`: apply the function on top of the stack to the slots below it.
    fn apply(&mut self, fid: FrameId) -> RtResult<()> {
        let top = self.frames.get(fid)?.top()?;
        let fun = match self.force(fid, top)? {
            Forced::Value(v) => v,
            Forced::Blocked => return Ok(()),
        };
        let (fno, arity, captured) = match self.heap.view(fun)? {
            View::Cell(_, CellKind::Cap(cap)) => (cap.fno, cap.arity, cap.args.clone()),
            View::Cell(_, CellKind::Scref(fno)) => (*fno, self.program.function(*fno)?.arity, Vec::new()),
            View::Cell(_, CellKind::Builtin(b)) => (self.program.wrapper(*b), b.arity(), Vec::new()),
            other => return Err(RuntimeError::app(format!("cannot apply a {}", other.type_name()))),
        };
        let frame = self.frames.get_mut(fid)?;
        frame.slots.pop();
        let args = std::mem::take(&mut frame.slots);
        let have = captured.len();
        let need = (arity as usize).saturating_sub(have);
        let n = args.len();

        if n == 0 {
            return self.complete(fid, fun);
        }
        if n < need {
            let mut all = captured;
            all.extend(args);
            let cap = self.heap.alloc(CellKind::Cap(Box::new(Cap { fno, arity, args: all })));
            return self.complete(fid, cap);
        }

        let info = self.program.function(fno)?;
        let entry = info.entry_for(have, need);
        let depth = info.stack_depth as usize;
        let mut first = captured;
        first.extend_from_slice(&args[..need]);
        if n == need {
            first.reserve(depth.saturating_sub(first.len()));
            let frame = self.frames.get_mut(fid)?;
            frame.fno = fno;
            frame.pc = entry;
            frame.slots = first;
            return Ok(());
        }

        // over-saturated: run the saturated part as its own frame, then apply its result to the rest
        let (_, child) = self.spawn_frame(fno, entry, first)?;
        let frame = self.frames.get_mut(fid)?;
        frame.slots = args[need..].to_vec();
        frame.slots.push(Pntr::cell(child));
        Ok(())
    }

    /// `Call`: run a known function eagerly, result into a fresh top slot.
    fn call(&mut self, fid: FrameId, fno: u32) -> RtResult<()> {
        let info = self.program.function(fno)?;
        let (arity, entry, depth) = (info.arity as usize, info.entry_ne(), info.stack_depth as usize);
        let nil = self.heap.nil();
        let frame = self.frames.get_mut(fid)?;
        let args = frame.pop_n(arity)?;
        frame.pc += 1;
        frame.push(nil);
        let slot = (frame.slots.len() - 1) as u16;
        let mut child = Frame::new(fno, entry, args, depth, ResultDest::Slot { frame: fid, slot });
        child.wq.frames.push(fid);
        let child = self.frames.alloc(child);
        self.block(fid)?;
        self.frames.transition(child, FrameState::Running)?;
        self.running = Some(child);
        Ok(())
    }

    fn fill_hole(&mut self, target: Pntr, value: Pntr) -> RtResult<()> {
        let id = target
            .as_cell()
            .ok_or_else(|| fatal!("update target is a number"))?;
        let hole = self
            .holes
            .remove(&id)
            .ok_or_else(|| fatal!("update of cell {} which is not a pending hole", id.0))?;
        if self.heap.resolve(value)? == target {
            return Err(RuntimeError::app("black hole: value defined in terms of itself"));
        }
        self.heap.make_ind(id, value)?;
        self.wake(hole.wq, target)
    }

    /// Offer an unstarted frame (or a thunk, made into one) to idle peers.
    pub(crate) fn spark(&mut self, p: Pntr) -> RtResult<()> {
        let p = self.heap.resolve(p)?;
        let Some(id) = p.as_cell() else { return Ok(()) };
        let target = match self.demand(id)? {
            Demand::Frame(fid) => fid,
            d @ (Demand::Apply(..) | Demand::Call(_)) => self.thunk_to_frame(id, d)?,
            _ => return Ok(()),
        };
        if self.frames.state(target)? == FrameState::New {
            self.frames.transition(target, FrameState::Sparked)?;
            self.sparks.push_back(target);
            trace!(target: "nreduce::sched", frame = %target, sparks = self.sparks.len(), "sched.spark");
        }
        Ok(())
    }

    fn item(&self, p: Pntr, n: usize) -> RtResult<Pntr> {
        let mut p = p;
        let mut n = n;
        loop {
            match self.heap.view(p)? {
                View::Cell(_, CellKind::Array(data)) => {
                    return data
                        .item(n)
                        .ok_or_else(|| RuntimeError::app(format!("index {} out of range", n)));
                }
                View::Cell(_, CellKind::ArrayRef { array, start }) => {
                    let start = *start;
                    return match self.heap.raw(*array)? {
                        CellKind::Array(data) => data
                            .item(start + n)
                            .ok_or_else(|| RuntimeError::app(format!("index {} out of range", n))),
                        other => Err(fatal!("arrayref over a {}", other.name())),
                    };
                }
                View::Cell(_, CellKind::Cons(h, t)) => {
                    if n == 0 {
                        return Ok(*h);
                    }
                    n -= 1;
                    p = *t;
                }
                other => return Err(RuntimeError::app(format!("cannot index a {}", other.type_name()))),
            }
        }
    }
}
