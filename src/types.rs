//! Core data types for the group scheduler
//!
//! # Main Types
//!
//! - [`Crop`] / [`Size`] - Geometry used by the cross-stage crop contracts
//! - [`Slot`] - Role of a group in the pipeline (sensor, 3AA, ISP, scaler...)
//! - [`InputMode`] - How a group is fed by its predecessor
//! - [`NodeGroup`] - Per-stage configuration block carried by frames and carriers
//! - [`ShotQuota`] - The async/sync/skip/init shot partition

use crate::id::VideoId;
use serde::{Deserialize, Serialize};
use std::fmt;

// ==================== Geometry ====================

/// A crop rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Crop {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Crop covering a whole frame of `size`
    pub const fn full(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    #[inline]
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// Clamp width and height to `size` when this crop covers more area.
    ///
    /// Returns true if the crop was modified.
    pub fn clamp_to(&mut self, size: Size) -> bool {
        if self.area() > size.area() {
            self.w = size.width;
            self.h = size.height;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Crop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}, {}", self.x, self.y, self.w, self.h)
    }
}

/// A width/height pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ==================== Pipeline Roles ====================

/// Position of a group in the fixed stage order of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    Sensor,
    Paf,
    ThreeAa,
    Isp,
    Dis,
    Dcp,
    Mcs,
    Vra,
}

impl Slot {
    pub const COUNT: usize = 8;

    pub const ALL: [Slot; Slot::COUNT] = [
        Slot::Sensor,
        Slot::Paf,
        Slot::ThreeAa,
        Slot::Isp,
        Slot::Dis,
        Slot::Dcp,
        Slot::Mcs,
        Slot::Vra,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Device family the slot belongs to
    pub fn device_type(self) -> DeviceType {
        match self {
            Slot::Sensor => DeviceType::Sensor,
            _ => DeviceType::Ischain,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Slot::Sensor => "SS",
            Slot::Paf => "PAF",
            Slot::ThreeAa => "3XS",
            Slot::Isp => "IXS",
            Slot::Dis => "DIS",
            Slot::Dcp => "DCP",
            Slot::Mcs => "MXS",
            Slot::Vra => "VRA",
        };
        f.write_str(name)
    }
}

/// Device family used to scope chain-wide locking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Sensor,
    Ischain,
    /// Matches every device type
    All,
}

impl DeviceType {
    pub fn matches(self, other: DeviceType) -> bool {
        self == DeviceType::All || self == other
    }
}

/// How a group receives its input from the previous stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputMode {
    /// Fully decoupled memory-to-memory input
    Memory,
    /// Hardware-pipelined ("on-the-fly") input
    Otf,
    /// Software-pipelined input
    Pipe,
    /// Software-pipelined input with a DMA leg
    SemiPipe,
    /// Dynamically spliced on-the-fly input
    VirtualOtf,
}

impl InputMode {
    /// Arrow used in chain diagnostics
    pub fn symbol(self) -> &'static str {
        match self {
            InputMode::Otf => "->",
            InputMode::Pipe => "~>",
            InputMode::SemiPipe => ">>",
            InputMode::VirtualOtf => "*>",
            InputMode::Memory => "=>",
        }
    }
}

/// Producer extension mode that affects the quota table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExMode {
    #[default]
    None,
    DualFps960,
    DualFps480,
}

impl ExMode {
    pub fn is_dual_fps(self) -> bool {
        matches!(self, ExMode::DualFps960 | ExMode::DualFps480)
    }
}

// ==================== Stage Configuration ====================

/// Leader (input) configuration of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaderConfig {
    pub vid: VideoId,
    pub input: Crop,
}

/// One capture node request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub vid: VideoId,
    pub request: bool,
    pub output: Crop,
}

/// Per-stage configuration block: leader input crop plus capture node requests
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeGroup {
    pub leader: LeaderConfig,
    pub capture: Vec<CaptureConfig>,
}

impl NodeGroup {
    /// Block with `capture_nodes` empty capture entries
    pub fn with_capacity(capture_nodes: usize) -> Self {
        Self {
            leader: LeaderConfig::default(),
            capture: vec![CaptureConfig::default(); capture_nodes],
        }
    }

    /// True if capture entry `cid` is requested
    pub fn requested(&self, cid: usize) -> bool {
        self.capture.get(cid).map(|c| c.request).unwrap_or(false)
    }
}

/// Partition of in-flight shots for one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShotQuota {
    /// Shots allowed ahead of the producer without waiting
    pub async_shots: u32,
    /// Shots that must wait on a producer trigger
    pub sync_shots: u32,
    /// Frames the producer leads by before its triggers apply
    pub skip_shots: u32,
    /// Shots issued before the producer starts streaming
    pub init_shots: u32,
}

impl ShotQuota {
    pub const fn new(async_shots: u32, sync_shots: u32, skip_shots: u32, init_shots: u32) -> Self {
        Self {
            async_shots,
            sync_shots,
            skip_shots,
            init_shots,
        }
    }

    /// Shots that may be in flight at once
    pub fn depth(&self) -> u32 {
        self.async_shots + self.sync_shots
    }
}
