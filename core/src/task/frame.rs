//! Function activations and the arena that owns them.
//!
//! Frames are referred to by `FrameId` (slot index plus generation), so a
//! handle kept past a frame's release is detected instead of silently
//! aliasing whatever activation reused the slot.

use std::fmt;

use tracing::trace;

use crate::addr::WaitQueue;
use crate::error::RtResult;
use crate::fatal;
use crate::heap::{CellId, FrameEdges, Pntr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Free,
    New,
    Sparked,
    Ready,
    Running,
    Blocked,
    Done,
}

impl FrameState {
    pub fn can_become(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (New, Sparked)
                | (New, Running)
                | (New, Ready)
                | (New, Free)
                | (Sparked, Running)
                | (Sparked, Ready)
                | (Sparked, Free)
                | (Ready, Running)
                | (Running, Blocked)
                | (Running, Ready)
                | (Running, Done)
                | (Blocked, Ready)
                | (Done, Free)
        )
    }

    /// Has not started running yet, so it may still be migrated whole.
    pub fn is_unstarted(self) -> bool {
        matches!(self, FrameState::New | FrameState::Sparked)
    }
}

/// Where a finished frame publishes its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDest {
    /// The frame's own heap cell, which becomes an indirection to the result.
    Cell(CellId),
    /// A slot of the frame that ran it through `Call`.
    Slot { frame: FrameId, slot: u16 },
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub state: FrameState,
    pub fno: u32,
    pub pc: u32,
    pub slots: Vec<Pntr>,
    pub dest: ResultDest,
    pub wq: WaitQueue,
}

impl Frame {
    /// `depth` is the function's stack depth; the slot array is reserved to it.
    pub fn new(fno: u32, pc: u32, mut slots: Vec<Pntr>, depth: usize, dest: ResultDest) -> Self {
        slots.reserve(depth.saturating_sub(slots.len()));
        Self {
            state: FrameState::New,
            fno,
            pc,
            slots,
            dest,
            wq: WaitQueue::default(),
        }
    }

    pub fn cell(&self) -> Option<CellId> {
        match self.dest {
            ResultDest::Cell(c) => Some(c),
            ResultDest::Slot { .. } => None,
        }
    }

    pub fn slot(&self, idx: u16) -> RtResult<Pntr> {
        self.slots
            .get(idx as usize)
            .copied()
            .ok_or_else(|| fatal!("slot {} out of range ({} live)", idx, self.slots.len()))
    }

    pub fn set_slot(&mut self, idx: u16, p: Pntr) -> RtResult<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(idx as usize)
            .ok_or_else(|| fatal!("slot {} out of range ({} live)", idx, len))?;
        *slot = p;
        Ok(())
    }

    pub fn push(&mut self, p: Pntr) {
        self.slots.push(p);
    }

    pub fn pop(&mut self) -> RtResult<Pntr> {
        self.slots.pop().ok_or_else(|| fatal!("pop from empty frame stack"))
    }

    pub fn top(&self) -> RtResult<Pntr> {
        self.slots.last().copied().ok_or_else(|| fatal!("empty frame stack"))
    }

    /// Split off the top `n` slots, bottom first.
    pub fn pop_n(&mut self, n: usize) -> RtResult<Vec<Pntr>> {
        if n > self.slots.len() {
            return Err(fatal!("need {} slots, frame holds {}", n, self.slots.len()));
        }
        let at = self.slots.len() - n;
        Ok(self.slots.split_off(at))
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    frame: Option<Frame>,
}

#[derive(Debug, Default)]
pub struct FrameArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl FrameArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, frame: Frame) -> FrameId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.frame = Some(frame);
                FrameId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    frame: Some(frame),
                });
                FrameId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        trace!(target: "nreduce::task", frame = %id, "frame.alloc");
        id
    }

    pub fn contains(&self, id: FrameId) -> bool {
        matches!(
            self.slots.get(id.index as usize),
            Some(Slot { generation, frame: Some(_) }) if *generation == id.generation
        )
    }

    pub fn get(&self, id: FrameId) -> RtResult<&Frame> {
        match self.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                frame: Some(frame),
            }) if *generation == id.generation => Ok(frame),
            _ => Err(fatal!("stale frame handle {}", id)),
        }
    }

    pub fn get_mut(&mut self, id: FrameId) -> RtResult<&mut Frame> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot {
                generation,
                frame: Some(frame),
            }) if *generation == id.generation => Ok(frame),
            _ => Err(fatal!("stale frame handle {}", id)),
        }
    }

    pub fn state(&self, id: FrameId) -> RtResult<FrameState> {
        Ok(self.get(id)?.state)
    }

    pub fn transition(&mut self, id: FrameId, next: FrameState) -> RtResult<()> {
        let frame = self.get_mut(id)?;
        if !frame.state.can_become(next) {
            return Err(fatal!("frame {} cannot go from {:?} to {:?}", id, frame.state, next));
        }
        trace!(target: "nreduce::task", frame = %id, from = ?frame.state, to = ?next, "frame.state");
        frame.state = next;
        Ok(())
    }

    /// Return a frame's slot to the arena. Only frames that are finished or
    /// were never started may be released.
    pub fn release(&mut self, id: FrameId) -> RtResult<Frame> {
        self.transition(id, FrameState::Free)?;
        let slot = &mut self.slots[id.index as usize];
        let mut frame = slot
            .frame
            .take()
            .ok_or_else(|| fatal!("stale frame handle {}", id))?;
        if !frame.wq.is_empty() {
            return Err(fatal!("frame {} released with {} waiters", id, frame.wq.len()));
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        frame.state = FrameState::Free;
        Ok(frame)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &Frame)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.frame.as_ref().map(|frame| {
                (
                    FrameId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    frame,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<FrameId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl FrameEdges for FrameArena {
    fn frame_edges(&self, fid: FrameId, out: &mut Vec<Pntr>) {
        if let Ok(frame) = self.get(fid) {
            out.extend_from_slice(&frame.slots);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FrameState::*;

    fn frame() -> Frame {
        Frame::new(0, 0, vec![Pntr::number(1.0)], 4, ResultDest::Cell(CellId(1)))
    }

    #[test]
    fn lifecycle_follows_the_state_machine() {
        let mut arena = FrameArena::new();
        let id = arena.alloc(frame());
        for next in [Sparked, Running, Blocked, Ready, Running, Done, Free] {
            arena.transition(id, next).unwrap();
        }
        assert_eq!(arena.state(id).unwrap(), Free);
    }

    #[test]
    fn illegal_transitions_are_fatal() {
        let all = [Free, New, Sparked, Ready, Running, Blocked, Done];
        let mut allowed = 0;
        for from in all {
            for to in all {
                if from.can_become(to) {
                    allowed += 1;
                }
            }
        }
        assert_eq!(allowed, 13);

        let mut arena = FrameArena::new();
        let id = arena.alloc(frame());
        assert!(arena.transition(id, Blocked).is_err());
        assert!(arena.transition(id, Done).is_err());
        arena.transition(id, Running).unwrap();
        arena.transition(id, Done).unwrap();
        assert!(arena.transition(id, Running).unwrap_err().is_fatal());
    }

    #[test]
    fn released_handles_go_stale() {
        let mut arena = FrameArena::new();
        let id = arena.alloc(frame());
        arena.release(id).unwrap();
        assert!(!arena.contains(id));
        assert!(arena.get(id).is_err());

        let reused = arena.alloc(frame());
        assert_ne!(reused, id);
        assert!(arena.contains(reused));
        assert!(arena.get(id).is_err());
    }

    #[test]
    fn running_frames_cannot_be_released() {
        let mut arena = FrameArena::new();
        let id = arena.alloc(frame());
        arena.transition(id, Running).unwrap();
        assert!(arena.release(id).is_err());
    }

    #[test]
    fn pop_n_keeps_argument_order() {
        let mut f = frame();
        f.push(Pntr::number(2.0));
        f.push(Pntr::number(3.0));
        let args = f.pop_n(2).unwrap();
        assert_eq!(args, vec![Pntr::number(2.0), Pntr::number(3.0)]);
        assert_eq!(f.slots.len(), 1);
        assert!(f.pop_n(5).is_err());
    }

    #[test]
    fn slots_are_reserved_to_the_stack_depth() {
        let f = Frame::new(0, 0, vec![Pntr::number(1.0)], 8, ResultDest::Cell(CellId(1)));
        assert_eq!(f.slots.len(), 1);
        assert!(f.slots.capacity() >= 8);
    }
}
