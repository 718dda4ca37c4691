//! Frame queue collaborator
//!
//! Every stage (group leader or capture sub-stage) owns a [`FrameQueue`]: a
//! fixed set of frames, each sitting in exactly one of the FREE, REQUEST,
//! PROCESS or COMPLETE lists. The scheduler moves frames between lists under
//! the queue's short lock; [`FrameQueueState::trans`] is idempotent so a
//! frame already in its target list is never transitioned twice.

use crate::types::NodeGroup;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// List a frame currently sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameState {
    Free,
    Request,
    Process,
    Complete,
}

impl FrameState {
    pub const COUNT: usize = 4;

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameState::Free => "FREE",
            FrameState::Request => "REQUEST",
            FrameState::Process => "PROCESS",
            FrameState::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// Outcome reported with a completed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameResult {
    Done,
    Error,
}

/// One buffer slot of a stage
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub state: FrameState,
    /// Frame tag
    pub fcount: u32,
    /// Request count echoed back by the hardware
    pub rcount: u32,
    /// Batch size for multi-buffer submissions
    pub num_buffers: u32,
    /// Per-stage configuration as requested by the client
    pub node_group: NodeGroup,
    /// Bits of outputs still pending for this frame
    pub out_flag: u64,
    /// Copy of `out_flag` taken at submission
    pub bak_flag: u64,
    pub result: Option<FrameResult>,
    /// False once the frame has been invalidated by a cancel
    pub valid: bool,
}

impl Frame {
    fn new(index: usize, capture_nodes: usize) -> Self {
        Self {
            index,
            state: FrameState::Free,
            fcount: 0,
            rcount: 0,
            num_buffers: 1,
            node_group: NodeGroup::with_capacity(capture_nodes),
            out_flag: 0,
            bak_flag: 0,
            result: None,
            valid: true,
        }
    }
}

/// Lock-protected contents of a frame queue
#[derive(Debug)]
pub struct FrameQueueState {
    frames: Vec<Frame>,
    lists: [VecDeque<usize>; FrameState::COUNT],
}

impl FrameQueueState {
    /// Number of frames owned by the queue
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn frame_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    /// Number of frames in `state`
    pub fn count(&self, state: FrameState) -> usize {
        self.lists[state.index()].len()
    }

    /// Oldest frame in `state`
    pub fn peek(&self, state: FrameState) -> Option<usize> {
        self.lists[state.index()].front().copied()
    }

    /// Newest frame in `state`
    pub fn peek_tail(&self, state: FrameState) -> Option<usize> {
        self.lists[state.index()].back().copied()
    }

    /// First frame in `state` carrying tag `fcount`
    pub fn find(&self, state: FrameState, fcount: u32) -> Option<usize> {
        self.lists[state.index()]
            .iter()
            .copied()
            .find(|&i| self.frames[i].fcount == fcount)
    }

    /// Move a frame to the tail of the `to` list.
    ///
    /// Returns false (and does nothing) if the frame is already in `to` or
    /// the index is out of range.
    pub fn trans(&mut self, index: usize, to: FrameState) -> bool {
        let Some(frame) = self.frames.get(index) else {
            return false;
        };
        let from = frame.state;
        if from == to {
            return false;
        }
        let list = &mut self.lists[from.index()];
        if let Some(pos) = list.iter().position(|&i| i == index) {
            list.remove(pos);
        }
        self.lists[to.index()].push_back(index);
        self.frames[index].state = to;
        true
    }
}

/// A stage's set of frames behind a short lock
#[derive(Debug)]
pub struct FrameQueue {
    name: String,
    state: Mutex<FrameQueueState>,
}

impl FrameQueue {
    /// Create a queue of `frames` frames, all FREE
    pub fn new(name: impl Into<String>, frames: usize, capture_nodes: usize) -> Self {
        let mut lists: [VecDeque<usize>; FrameState::COUNT] = Default::default();
        lists[FrameState::Free.index()] = (0..frames).collect();
        Self {
            name: name.into(),
            state: Mutex::new(FrameQueueState {
                frames: (0..frames).map(|i| Frame::new(i, capture_nodes)).collect(),
                lists,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, FrameQueueState> {
        self.state.lock()
    }

    /// Number of frames in `state`
    pub fn count(&self, state: FrameState) -> usize {
        self.state.lock().count(state)
    }

    /// Snapshot of one frame
    pub fn snapshot(&self, index: usize) -> Option<Frame> {
        self.state.lock().frame(index).cloned()
    }
}
