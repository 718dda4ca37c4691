//! Test chain builders

use super::mock_helpers::fast_config;
use super::{test_timeout, wait_for};
use isp_groups::hw::sim::{Completion, DoneRecorder};
use isp_groups::hw::{ShotCallback, SimCompleter, SimHardware, SimSensor};
use isp_groups::{
    FrameRequest, GroupHandle, GroupId, GroupManager, GroupOpenParams, InputMode, Result,
    SchedulerConfig, Size, Slot, VideoId,
};
use std::sync::Arc;

/// Stream every harness runs on
pub const STREAM: usize = 0;

/// Video node of the first stage's producer
pub const SENSOR_VID: VideoId = VideoId(1);

/// Leader video id of a stage at `slot`
pub fn leader_vid(slot: Slot) -> VideoId {
    VideoId(10 * (slot.index() as u32 + 1))
}

/// Junction capture video id of a stage at `slot`
pub fn capture_vid(slot: Slot) -> VideoId {
    VideoId(leader_vid(slot).0 + 1)
}

#[derive(Debug, Clone, Copy)]
struct StageSpec {
    slot: Slot,
    id: GroupId,
    mode: InputMode,
}

/// Builder for a single-stream chain of simulated groups
pub struct ChainBuilder {
    config: SchedulerConfig,
    sensor: SimSensor,
    auto_complete: bool,
    frames: usize,
    input: Size,
    stages: Vec<StageSpec>,
    callback: Option<Arc<dyn ShotCallback>>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self {
            config: fast_config(),
            sensor: SimSensor::new().streaming(),
            auto_complete: true,
            frames: 8,
            input: Size::new(4032, 3024),
            stages: Vec::new(),
            callback: None,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut SchedulerConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn sensor(mut self, sensor: SimSensor) -> Self {
        self.sensor = sensor;
        self
    }

    /// Complete every submission from a background thread
    pub fn auto_complete(mut self, on: bool) -> Self {
        self.auto_complete = on;
        self
    }

    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Leader input capability and junction output size of every stage
    pub fn input(mut self, size: Size) -> Self {
        self.input = size;
        self
    }

    pub fn stage(mut self, slot: Slot, id: u32, mode: InputMode) -> Self {
        self.stages.push(StageSpec {
            slot,
            id: GroupId(id),
            mode,
        });
        self
    }

    /// Stage callback of the first stage
    pub fn callback(mut self, callback: Arc<dyn ShotCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Open, attach and init every stage, then build the chain
    pub fn build(self) -> Result<Harness> {
        let sensor = Arc::new(self.sensor);
        let (hw, completions) = if self.auto_complete {
            let (hw, rx) = SimHardware::with_completion();
            (Arc::new(hw), Some(rx))
        } else {
            (Arc::new(SimHardware::new()), None)
        };
        let sink = Arc::new(DoneRecorder::default());
        let manager = GroupManager::probe(self.config, hw.clone(), sink.clone())?;
        manager.set_sensor(STREAM, sensor.clone())?;

        let mut handles = Vec::new();
        let mut source = SENSOR_VID;
        for (i, stage) in self.stages.iter().enumerate() {
            let mut params = GroupOpenParams::new(stage.id, leader_vid(stage.slot), self.input)
                .frames(self.frames);
            if i == 0 {
                if let Some(callback) = &self.callback {
                    params = params.shot_callback(callback.clone());
                }
            }
            let handle = manager.open(STREAM, stage.slot, params)?;
            manager.attach_substage(
                handle,
                capture_vid(stage.slot),
                format!("{}C", stage.slot),
                self.input,
                self.frames,
            )?;
            manager.init(handle, stage.mode, source, i == 0)?;
            source = capture_vid(stage.slot);
            handles.push(handle);
        }
        if !handles.is_empty() {
            manager.build(STREAM)?;
        }

        let completer = completions
            .map(|rx| SimCompleter::spawn(manager.clone(), rx, Some(sensor.clone())));
        Ok(Harness {
            manager,
            hw,
            sink,
            sensor,
            handles,
            slots: self.stages.iter().map(|s| s.slot).collect(),
            completer,
        })
    }
}

/// A built chain with its simulated collaborators
pub struct Harness {
    pub manager: GroupManager,
    pub hw: Arc<SimHardware>,
    pub sink: Arc<DoneRecorder>,
    pub sensor: Arc<SimSensor>,
    pub handles: Vec<GroupHandle>,
    pub slots: Vec<Slot>,
    completer: Option<SimCompleter>,
}

impl Harness {
    pub fn head(&self) -> GroupHandle {
        self.handles[0]
    }

    /// Start every stage from the tail back to the head, then check the chain
    pub fn start_all(&self) -> Result<()> {
        for &handle in self.handles.iter().rev() {
            self.manager.start(handle)?;
        }
        self.manager.configure(STREAM)
    }

    pub fn queue(&self, stage: usize, index: usize, request: FrameRequest) -> Result<()> {
        self.manager.buffer_queue(self.handles[stage], index, request)
    }

    /// Queue a free junction capture frame on `stage`
    pub fn queue_capture(&self, stage: usize, index: usize) -> Result<()> {
        self.manager
            .substage_queue(self.handles[stage], capture_vid(self.slots[stage]), index)
    }

    pub fn wait_submissions(&self, n: usize) -> bool {
        wait_for(test_timeout(), || self.hw.submissions().len() >= n)
    }

    /// Completions reported for the leader of `stage`
    pub fn leader_completions(&self, stage: usize) -> Vec<Completion> {
        let vid = leader_vid(self.slots[stage]);
        self.sink
            .completions()
            .into_iter()
            .filter(|c| c.vid == vid)
            .collect()
    }

    pub fn wait_completions(&self, stage: usize, n: usize) -> bool {
        wait_for(test_timeout(), || self.leader_completions(stage).len() >= n)
    }

    /// Stop every started stage and close every open one
    pub fn shutdown(mut self) {
        for &handle in &self.handles {
            let started = self
                .manager
                .group(handle)
                .map(|g| g.is_started())
                .unwrap_or(false);
            if started {
                let _ = self.manager.stop(handle);
            }
        }
        if let Some(completer) = self.completer.take() {
            completer.stop();
        }
        for &handle in &self.handles {
            let open = self
                .manager
                .group(handle)
                .map(|g| g.is_open())
                .unwrap_or(false);
            if open {
                let _ = self.manager.close(handle);
            }
        }
    }
}
