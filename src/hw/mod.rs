//! Collaborator interfaces consumed by the scheduler
//!
//! The scheduler never programs hardware or owns the sensor. It talks to
//! those layers through these traits so that both real drivers and the
//! simulated implementations in [`sim`] can be plugged in.

pub mod sim;

pub use sim::{SimCompleter, SimHardware, SimSensor};

use crate::error::Result;
use crate::frame::FrameResult;
use crate::id::{GroupHandle, GroupId, StreamId, VideoId};
use crate::types::{ExMode, NodeGroup, Slot};

/// Everything the hardware layer needs to run one shot
#[derive(Debug, Clone, PartialEq)]
pub struct ShotRequest {
    pub stream: StreamId,
    pub group: GroupHandle,
    pub group_id: GroupId,
    pub slot: Slot,
    pub frame: usize,
    pub fcount: u32,
    pub num_buffers: u32,
    /// Configuration after crop clamping
    pub node_group: NodeGroup,
}

/// Producer (sensor) state consulted by the scheduler
#[cfg_attr(test, mockall::automock)]
pub trait SensorDevice: Send + Sync {
    /// Current producer frame counter
    fn fcount(&self) -> u32;

    fn framerate(&self) -> u32;

    fn ex_mode(&self) -> ExMode;

    fn is_open(&self) -> bool;

    /// Front end (capture) is streaming
    fn is_front_started(&self) -> bool;

    /// Back end (output) is streaming
    fn is_back_started(&self) -> bool;
}

/// Hardware submission layer
#[cfg_attr(test, mockall::automock)]
pub trait HwInterface: Send + Sync {
    fn submit_shot(&self, group: GroupId, shot: &ShotRequest) -> Result<()>;

    /// Finish in-flight work, then stop
    fn process_stop(&self, group: GroupId) -> Result<()>;

    /// Stop immediately
    fn force_stop(&self, group: GroupId) -> Result<()>;
}

/// Stage-specific hook run before hardware submission
#[cfg_attr(test, mockall::automock)]
pub trait ShotCallback: Send + Sync {
    fn shot(&self, group: GroupId, shot: &ShotRequest) -> Result<()>;
}

/// Receives every frame that reaches COMPLETE
#[cfg_attr(test, mockall::automock)]
pub trait BufferDone: Send + Sync {
    fn buffer_done(&self, group: GroupHandle, vid: VideoId, frame: usize, result: FrameResult);
}
