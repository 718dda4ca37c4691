//! # isp-groups: pipeline group scheduler
//!
//! Sequences per-frame work across the chain of stages of a camera ISP
//! pipeline (sensor → 3AA → ISP → scaler ...). Each stage is a *group*; groups
//! are either hardware-pipelined to their predecessor ("on-the-fly") or fed
//! from memory and scheduled explicitly.
//!
//! ## Architecture
//!
//! - **Manager**: owns every group, worker task, carrier pool and topology
//! - **Groups**: per-stage flags, counters, shot quota and trigger semaphore
//! - **Workers**: one named thread per group id, fed through crossbeam channels
//! - **Carriers**: per-frame configuration handed from stage to stage
//! - **Collaborators**: sensor, hardware and completion sink behind traits,
//!   with simulated implementations in [`hw::sim`]
//!
//! ## Configuration
//!
//! Tunables (quota constants, retry policies, worker priorities) live in
//! [`config::SchedulerConfig`], stored as TOML under the platform config
//! directory in `dev.hxyulin.isp-groups/scheduler.toml`.
//!
//! ## Example
//!
//! ```ignore
//! use isp_groups::{
//!     hw::{sim::DoneRecorder, SimHardware, SimSensor},
//!     GroupId, GroupManager, GroupOpenParams, InputMode, SchedulerConfig, Size, Slot, VideoId,
//! };
//! use std::sync::Arc;
//!
//! let manager = GroupManager::probe(
//!     SchedulerConfig::default(),
//!     Arc::new(SimHardware::new()),
//!     Arc::new(DoneRecorder::default()),
//! )?;
//! manager.set_sensor(0, Arc::new(SimSensor::new().streaming()))?;
//!
//! let taa = manager.open(0, Slot::ThreeAa, GroupOpenParams::new(GroupId(1), VideoId(10), Size::new(4032, 3024)))?;
//! manager.init(taa, InputMode::Otf, VideoId(1), true)?;
//! manager.build(0)?;
//! manager.start(taa)?;
//! ```

pub mod carrier;
pub mod config;
pub mod error;
pub mod frame;
pub mod group;
pub mod hw;
pub mod id;
pub mod manager;
pub mod types;

// Re-export commonly used types
pub use config::SchedulerConfig;
pub use error::{GroupError, Result, ResultExt};
pub use frame::{FrameResult, FrameState};
pub use group::{GroupFlag, GroupOpenParams};
pub use id::{GroupHandle, GroupId, StreamId, VideoId};
pub use manager::{FrameRequest, GroupManager, SpliceDirection, StopReport};
pub use types::{Crop, InputMode, NodeGroup, ShotQuota, Size, Slot};
