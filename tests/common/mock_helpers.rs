//! Mock construction helpers

use isp_groups::hw::{ShotCallback, ShotRequest};
use isp_groups::types::{CaptureConfig, LeaderConfig};
use isp_groups::{Crop, GroupError, GroupId, NodeGroup, Result, SchedulerConfig, VideoId};
use parking_lot::Mutex;

/// Configuration with short retry loops and no real-time workers
pub fn fast_config() -> SchedulerConfig {
    let mut config = SchedulerConfig {
        stream_count: 2,
        ..SchedulerConfig::default()
    };
    config.stop.retries = 50;
    config.stop.interval_ms = 2;
    config.stop.stall_threshold = 30;
    config.cancel.wait_count = 10;
    config.cancel.interval_us = 100;
    config.worker.realtime = false;
    config
}

/// Node group with a leader input crop and the given capture requests
pub fn node_group(input: Crop, captures: &[(VideoId, Crop)]) -> NodeGroup {
    NodeGroup {
        leader: LeaderConfig {
            vid: VideoId::NONE,
            input,
        },
        capture: captures
            .iter()
            .map(|&(vid, output)| CaptureConfig {
                vid,
                request: true,
                output,
            })
            .collect(),
    }
}

/// Stage callback that records every shot and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingCallback {
    shots: Mutex<Vec<(GroupId, u32)>>,
    fail: Mutex<bool>,
}

impl RecordingCallback {
    pub fn failing() -> Self {
        Self {
            fail: Mutex::new(true),
            ..Self::default()
        }
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn fcounts(&self) -> Vec<u32> {
        self.shots.lock().iter().map(|(_, f)| *f).collect()
    }
}

impl ShotCallback for RecordingCallback {
    fn shot(&self, group: GroupId, shot: &ShotRequest) -> Result<()> {
        if *self.fail.lock() {
            return Err(GroupError::Hardware(format!(
                "{} callback rejected fcount {}",
                group, shot.fcount
            )));
        }
        self.shots.lock().push((group, shot.fcount));
        Ok(())
    }
}
