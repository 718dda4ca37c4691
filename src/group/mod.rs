//! Pipeline groups
//!
//! A [`Group`] is one stage of a stream's pipeline. It carries its state
//! flags, frame counters, shot quota and the trigger semaphore the producer
//! uses to release synchronized shots. Neighbour links live in the stream
//! topology, not in the group, so a group never owns another group.
//!
//! Each group has a leader [`SubStage`] (its input node and frame queue) and
//! any number of capture sub-stages, one of which may be the junction that
//! feeds the next group.

pub mod semaphore;
pub mod task;

pub use semaphore::Semaphore;
pub use task::{GroupTask, ShotRunner, Work, WorkerPriority};

use crate::frame::FrameQueue;
use crate::hw::{SensorDevice, ShotCallback};
use crate::id::{GroupHandle, GroupId, StreamId, VideoId};
use crate::types::{Crop, InputMode, ShotQuota, Size, Slot};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

// ==================== State Flags ====================

/// Group state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GroupFlag {
    Open = 0,
    Init,
    Start,
    Shot,
    OtfInput,
    OtfOutput,
    PipeInput,
    PipeOutput,
    SemiPipeInput,
    SemiPipeOutput,
    VotfInput,
    VotfOutput,
    RequestForceStop,
    ForceStop,
}

impl GroupFlag {
    pub const ALL: [GroupFlag; 14] = [
        GroupFlag::Open,
        GroupFlag::Init,
        GroupFlag::Start,
        GroupFlag::Shot,
        GroupFlag::OtfInput,
        GroupFlag::OtfOutput,
        GroupFlag::PipeInput,
        GroupFlag::PipeOutput,
        GroupFlag::SemiPipeInput,
        GroupFlag::SemiPipeOutput,
        GroupFlag::VotfInput,
        GroupFlag::VotfOutput,
        GroupFlag::RequestForceStop,
        GroupFlag::ForceStop,
    ];

    #[inline]
    fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            GroupFlag::Open => "OPEN",
            GroupFlag::Init => "INIT",
            GroupFlag::Start => "START",
            GroupFlag::Shot => "SHOT",
            GroupFlag::OtfInput => "OTF_INPUT",
            GroupFlag::OtfOutput => "OTF_OUTPUT",
            GroupFlag::PipeInput => "PIPE_INPUT",
            GroupFlag::PipeOutput => "PIPE_OUTPUT",
            GroupFlag::SemiPipeInput => "SEMI_PIPE_INPUT",
            GroupFlag::SemiPipeOutput => "SEMI_PIPE_OUTPUT",
            GroupFlag::VotfInput => "VOTF_INPUT",
            GroupFlag::VotfOutput => "VOTF_OUTPUT",
            GroupFlag::RequestForceStop => "REQUEST_FSTOP",
            GroupFlag::ForceStop => "FORCE_STOP",
        }
    }
}

/// Atomic set of [`GroupFlag`]s
#[derive(Debug, Default)]
pub struct GroupFlags(AtomicU32);

impl GroupFlags {
    pub fn set(&self, flag: GroupFlag) {
        self.0.fetch_or(flag.bit(), Ordering::AcqRel);
    }

    pub fn clear(&self, flag: GroupFlag) {
        self.0.fetch_and(!flag.bit(), Ordering::AcqRel);
    }

    pub fn test(&self, flag: GroupFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag.bit() != 0
    }

    /// Clear `flag`, returning whether it was set
    pub fn test_and_clear(&self, flag: GroupFlag) -> bool {
        self.0.fetch_and(!flag.bit(), Ordering::AcqRel) & flag.bit() != 0
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn names(&self) -> Vec<&'static str> {
        GroupFlag::ALL
            .iter()
            .filter(|f| self.test(**f))
            .map(|f| f.name())
            .collect()
    }
}

// ==================== Counters ====================

/// Frame and shot counters of one group
#[derive(Debug, Default)]
pub struct GroupCounters {
    /// Current frame number of this stage
    pub fcount: AtomicU32,
    /// Outstanding shot requests
    pub rcount: AtomicI32,
    /// Shots submitted
    pub scount: AtomicU32,
    /// Producer frame counter used for synchronization
    pub sensor_fcount: AtomicU32,
    /// Last frame tag committed by a synchronized shot
    pub backup_fcount: AtomicU32,
    /// Last checkpoint reached by the shot path
    pub pcount: AtomicU32,
}

impl GroupCounters {
    fn reset(&self) {
        self.fcount.store(0, Ordering::Release);
        self.rcount.store(0, Ordering::Release);
        self.scount.store(0, Ordering::Release);
        self.sensor_fcount.store(1, Ordering::Release);
        self.backup_fcount.store(0, Ordering::Release);
        self.pcount.store(0, Ordering::Release);
    }
}

// ==================== Sub-stages ====================

const SUBDEV_OPEN: u32 = 1 << 0;
const SUBDEV_START: u32 = 1 << 1;
const SUBDEV_RUN: u32 = 1 << 2;

const CID_INVALID: u32 = u32::MAX;

/// A node of a group: its leader input or one of its capture outputs
#[derive(Debug)]
pub struct SubStage {
    vid: VideoId,
    name: String,
    owner: GroupHandle,
    leader: bool,
    /// Input capability for a leader, output capability for a capture node
    size: Mutex<Size>,
    queue: FrameQueue,
    state: AtomicU32,
    cid: AtomicU32,
}

impl SubStage {
    pub fn new(
        owner: GroupHandle,
        vid: VideoId,
        name: impl Into<String>,
        size: Size,
        frames: usize,
        capture_nodes: usize,
        leader: bool,
    ) -> Self {
        let name = name.into();
        Self {
            vid,
            queue: FrameQueue::new(name.clone(), frames, capture_nodes),
            name,
            owner,
            leader,
            size: Mutex::new(size),
            state: AtomicU32::new(0),
            cid: AtomicU32::new(CID_INVALID),
        }
    }

    pub fn vid(&self) -> VideoId {
        self.vid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> GroupHandle {
        self.owner
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn size(&self) -> Size {
        *self.size.lock()
    }

    pub fn set_size(&self, size: Size) {
        *self.size.lock() = size;
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    /// Capture entry index assigned by the last shot that referenced this node
    pub fn cid(&self) -> Option<usize> {
        match self.cid.load(Ordering::Acquire) {
            CID_INVALID => None,
            cid => Some(cid as usize),
        }
    }

    pub fn set_cid(&self, cid: usize) {
        self.cid.store(cid as u32, Ordering::Release);
    }

    pub fn open(&self) {
        self.state.fetch_or(SUBDEV_OPEN, Ordering::AcqRel);
    }

    /// Mark the node streaming
    pub fn start(&self) {
        self.state.fetch_or(SUBDEV_OPEN | SUBDEV_START, Ordering::AcqRel);
    }

    pub fn stop(&self) {
        self.state.fetch_and(!SUBDEV_START, Ordering::AcqRel);
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) & SUBDEV_START != 0
    }

    pub fn set_running(&self, running: bool) {
        if running {
            self.state.fetch_or(SUBDEV_RUN, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!SUBDEV_RUN, Ordering::AcqRel);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) & SUBDEV_RUN != 0
    }

    fn close(&self) {
        self.state.store(0, Ordering::Release);
        self.cid.store(CID_INVALID, Ordering::Release);
    }
}

// ==================== Group ====================

/// Parameters applied by `open`
#[derive(Clone)]
pub struct GroupOpenParams {
    pub id: GroupId,
    pub leader_vid: VideoId,
    /// Declared input capability of the leader
    pub input: Size,
    /// Frames in the leader queue
    pub frames: usize,
    pub shot_callback: Option<Arc<dyn ShotCallback>>,
}

impl GroupOpenParams {
    pub fn new(id: GroupId, leader_vid: VideoId, input: Size) -> Self {
        Self {
            id,
            leader_vid,
            input,
            frames: 8,
            shot_callback: None,
        }
    }

    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn shot_callback(mut self, callback: Arc<dyn ShotCallback>) -> Self {
        self.shot_callback = Some(callback);
        self
    }
}

/// One pipeline stage of a stream
pub struct Group {
    handle: GroupHandle,
    stream: StreamId,
    slot: Slot,
    capture_nodes: usize,
    id: AtomicU32,
    source_vid: AtomicU32,
    input_mode: Mutex<Option<InputMode>>,
    pub flags: GroupFlags,
    pub counters: GroupCounters,
    quota: Mutex<ShotQuota>,
    /// Free shot slots; drops while shots are in flight
    shot_budget: AtomicI32,
    /// Released by the producer on frame start
    pub trigger: Semaphore,
    leader: RwLock<Arc<SubStage>>,
    subdevs: RwLock<Vec<Arc<SubStage>>>,
    leader_canvas: Mutex<Crop>,
    shot_callback: RwLock<Option<Arc<dyn ShotCallback>>>,
    /// Frames of the virtual neighbour parked until this group's next shot
    votf_pending: Mutex<VecDeque<usize>>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("handle", &self.handle)
            .field("stream", &self.stream)
            .field("slot", &self.slot)
            .field("id", &self.id())
            .field("flags", &self.flags.names())
            .finish()
    }
}

impl Group {
    pub fn new(handle: GroupHandle, stream: StreamId, slot: Slot, capture_nodes: usize) -> Self {
        Self {
            handle,
            stream,
            slot,
            capture_nodes,
            id: AtomicU32::new(GroupId::INVALID.0),
            source_vid: AtomicU32::new(0),
            input_mode: Mutex::new(None),
            flags: GroupFlags::default(),
            counters: GroupCounters::default(),
            quota: Mutex::new(ShotQuota::default()),
            shot_budget: AtomicI32::new(0),
            trigger: Semaphore::new(0),
            leader: RwLock::new(Arc::new(SubStage::new(
                handle,
                VideoId::NONE,
                slot.to_string(),
                Size::default(),
                0,
                capture_nodes,
                true,
            ))),
            subdevs: RwLock::new(Vec::new()),
            leader_canvas: Mutex::new(Crop::default()),
            shot_callback: RwLock::new(None),
            votf_pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn handle(&self) -> GroupHandle {
        self.handle
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn id(&self) -> GroupId {
        GroupId(self.id.load(Ordering::Acquire))
    }

    pub fn capture_nodes(&self) -> usize {
        self.capture_nodes
    }

    pub fn source_vid(&self) -> VideoId {
        VideoId(self.source_vid.load(Ordering::Acquire))
    }

    pub fn input_mode(&self) -> Option<InputMode> {
        *self.input_mode.lock()
    }

    pub fn is_open(&self) -> bool {
        self.flags.test(GroupFlag::Open)
    }

    pub fn is_started(&self) -> bool {
        self.flags.test(GroupFlag::Start)
    }

    pub fn is_otf_input(&self) -> bool {
        self.flags.test(GroupFlag::OtfInput)
    }

    pub fn quota(&self) -> ShotQuota {
        *self.quota.lock()
    }

    pub(crate) fn set_quota(&self, quota: ShotQuota) {
        *self.quota.lock() = quota;
    }

    pub fn shot_budget(&self) -> i32 {
        self.shot_budget.load(Ordering::Acquire)
    }

    pub(crate) fn set_shot_budget(&self, budget: i32) {
        self.shot_budget.store(budget, Ordering::Release);
    }

    pub(crate) fn shot_budget_dec(&self) {
        self.shot_budget.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn shot_budget_inc(&self) {
        self.shot_budget.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leader(&self) -> Arc<SubStage> {
        self.leader.read().clone()
    }

    pub fn subdevs(&self) -> Vec<Arc<SubStage>> {
        self.subdevs.read().clone()
    }

    /// Capture sub-stage with video id `vid`
    pub fn subdev(&self, vid: VideoId) -> Option<Arc<SubStage>> {
        self.subdevs.read().iter().find(|s| s.vid() == vid).cloned()
    }

    pub(crate) fn add_subdev(&self, subdev: Arc<SubStage>) {
        self.subdevs.write().push(subdev);
    }

    pub fn leader_canvas(&self) -> Crop {
        *self.leader_canvas.lock()
    }

    pub(crate) fn set_leader_canvas(&self, canvas: Crop) {
        *self.leader_canvas.lock() = canvas;
    }

    pub(crate) fn shot_callback(&self) -> Option<Arc<dyn ShotCallback>> {
        self.shot_callback.read().clone()
    }

    pub(crate) fn votf_push(&self, frame: usize) {
        self.votf_pending.lock().push_back(frame);
    }

    pub(crate) fn votf_pop(&self) -> Option<usize> {
        self.votf_pending.lock().pop_front()
    }

    pub(crate) fn votf_has_pending(&self) -> bool {
        !self.votf_pending.lock().is_empty()
    }

    /// Record the checkpoint reached by the shot path
    pub(crate) fn mark_pc(&self, pc: u32) {
        self.counters.pcount.store(pc, Ordering::Release);
    }

    pub(crate) fn open(&self, params: GroupOpenParams) {
        self.flags.reset();
        self.counters.reset();
        self.id.store(params.id.0, Ordering::Release);
        self.source_vid.store(0, Ordering::Release);
        *self.input_mode.lock() = None;
        *self.quota.lock() = ShotQuota::default();
        self.shot_budget.store(0, Ordering::Release);
        self.trigger.reset(0);
        let leader = Arc::new(SubStage::new(
            self.handle,
            params.leader_vid,
            format!("{}{}", self.slot, params.id.0),
            params.input,
            params.frames,
            self.capture_nodes,
            true,
        ));
        leader.open();
        *self.leader.write() = leader;
        self.subdevs.write().clear();
        *self.leader_canvas.lock() = Crop::default();
        *self.shot_callback.write() = params.shot_callback;
        self.votf_pending.lock().clear();
        self.flags.set(GroupFlag::Open);
    }

    pub(crate) fn init(&self, mode: InputMode, source_vid: VideoId) {
        *self.input_mode.lock() = Some(mode);
        self.source_vid.store(source_vid.0, Ordering::Release);
    }

    pub(crate) fn close(&self) {
        self.leader.read().close();
        for subdev in self.subdevs.read().iter() {
            subdev.close();
        }
        self.flags.reset();
        self.id.store(GroupId::INVALID.0, Ordering::Release);
        *self.shot_callback.write() = None;
        self.votf_pending.lock().clear();
    }

    pub(crate) fn sensor_fcount(&self) -> u32 {
        self.counters.sensor_fcount.load(Ordering::Acquire)
    }

    pub(crate) fn backup_fcount(&self) -> u32 {
        self.counters.backup_fcount.load(Ordering::Acquire)
    }

    pub(crate) fn rcount(&self) -> i32 {
        self.counters.rcount.load(Ordering::Acquire)
    }

    pub(crate) fn scount(&self) -> u32 {
        self.counters.scount.load(Ordering::Acquire)
    }
}

/// Snapshot of a group for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub slot: Slot,
    pub id: GroupId,
    pub flags: Vec<&'static str>,
    pub fcount: u32,
    pub rcount: i32,
    pub scount: u32,
    pub sensor_fcount: u32,
    pub backup_fcount: u32,
    pub pcount: u32,
    pub quota: ShotQuota,
    pub shot_budget: i32,
    pub trigger_permits: i64,
    pub carriers: usize,
}

impl Group {
    pub(crate) fn status(&self, carriers: usize) -> GroupStatus {
        GroupStatus {
            slot: self.slot,
            id: self.id(),
            flags: self.flags.names(),
            fcount: self.counters.fcount.load(Ordering::Acquire),
            rcount: self.rcount(),
            scount: self.scount(),
            sensor_fcount: self.sensor_fcount(),
            backup_fcount: self.backup_fcount(),
            pcount: self.counters.pcount.load(Ordering::Acquire),
            quota: self.quota(),
            shot_budget: self.shot_budget(),
            trigger_permits: self.trigger.permits(),
            carriers,
        }
    }
}

/// Sensor handle shared by the groups of a stream
pub type SharedSensor = Arc<dyn SensorDevice>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_set_clear() {
        let flags = GroupFlags::default();
        flags.set(GroupFlag::Open);
        flags.set(GroupFlag::OtfInput);
        assert!(flags.test(GroupFlag::Open));
        assert!(flags.test_and_clear(GroupFlag::OtfInput));
        assert!(!flags.test_and_clear(GroupFlag::OtfInput));
        assert_eq!(flags.names(), vec!["OPEN"]);
        flags.reset();
        assert!(!flags.test(GroupFlag::Open));
    }

    #[test]
    fn test_open_resets_state() {
        let group = Group::new(GroupHandle(3), 0, Slot::Isp, 4);
        group.flags.set(GroupFlag::ForceStop);
        group.counters.scount.store(9, Ordering::Release);
        group.open(GroupOpenParams::new(GroupId(4), VideoId(30), Size::new(4032, 3024)).frames(4));

        assert!(group.is_open());
        assert!(!group.flags.test(GroupFlag::ForceStop));
        assert_eq!(group.scount(), 0);
        assert_eq!(group.sensor_fcount(), 1);
        assert_eq!(group.id(), GroupId(4));
        assert_eq!(group.leader().size(), Size::new(4032, 3024));
        assert_eq!(group.leader().queue().lock().len(), 4);
    }

    #[test]
    fn test_subdev_lookup_and_cid() {
        let group = Group::new(GroupHandle(0), 0, Slot::ThreeAa, 4);
        let sub = Arc::new(SubStage::new(
            GroupHandle(0),
            VideoId(12),
            "3XC",
            Size::new(1920, 1080),
            4,
            4,
            false,
        ));
        group.add_subdev(sub.clone());
        assert!(group.subdev(VideoId(12)).is_some());
        assert!(group.subdev(VideoId(13)).is_none());

        assert_eq!(sub.cid(), None);
        sub.set_cid(2);
        assert_eq!(sub.cid(), Some(2));
        sub.start();
        sub.set_running(true);
        assert!(sub.is_started() && sub.is_running());
        sub.close();
        assert!(!sub.is_started());
        assert_eq!(sub.cid(), None);
    }
}
