//! Simulated collaborators
//!
//! Stand-ins for the sensor driver and the hardware submission layer, used by
//! the tests and the demo binary.
//!
//! - [`SimSensor`] - atomic frame counter plus open/streaming flags
//! - [`SimHardware`] - records submissions and stop calls, optionally forwards
//!   submissions to a completion channel
//! - [`SimCompleter`] - background thread that turns forwarded submissions into
//!   a producer frame start followed by `done`
//! - [`DoneRecorder`] - a [`BufferDone`] sink that keeps every completion
//!
//! # Example
//!
//! ```ignore
//! let sensor = Arc::new(SimSensor::new().streaming());
//! let (hw, completions) = SimHardware::with_completion();
//! let manager = GroupManager::probe(config, Arc::new(hw), Arc::new(DoneRecorder::default()))?;
//! let completer = SimCompleter::spawn(manager.clone(), completions, Some(sensor.clone()));
//! ```

use super::{BufferDone, HwInterface, SensorDevice, ShotRequest};
use crate::error::{GroupError, Result};
use crate::frame::FrameResult;
use crate::id::{GroupHandle, GroupId, VideoId};
use crate::manager::GroupManager;
use crate::types::ExMode;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// ==================== Sensor ====================

/// Simulated producer
#[derive(Debug)]
pub struct SimSensor {
    fcount: AtomicU32,
    framerate: AtomicU32,
    ex_mode: Mutex<ExMode>,
    open: AtomicBool,
    front: AtomicBool,
    back: AtomicBool,
}

impl Default for SimSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSensor {
    /// An open sensor at 30 fps that is not streaming yet
    pub fn new() -> Self {
        Self {
            fcount: AtomicU32::new(0),
            framerate: AtomicU32::new(30),
            ex_mode: Mutex::new(ExMode::None),
            open: AtomicBool::new(true),
            front: AtomicBool::new(false),
            back: AtomicBool::new(false),
        }
    }

    pub fn streaming(self) -> Self {
        self.set_streaming(true);
        self
    }

    pub fn with_framerate(self, fps: u32) -> Self {
        self.framerate.store(fps, Ordering::Release);
        self
    }

    pub fn with_ex_mode(self, mode: ExMode) -> Self {
        *self.ex_mode.lock() = mode;
        self
    }

    pub fn set_streaming(&self, on: bool) {
        self.front.store(on, Ordering::Release);
        self.back.store(on, Ordering::Release);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
        if !open {
            self.set_streaming(false);
        }
    }

    /// Move the frame counter forward to at least `fcount`
    pub fn advance_to(&self, fcount: u32) {
        self.fcount.fetch_max(fcount, Ordering::AcqRel);
    }
}

impl SensorDevice for SimSensor {
    fn fcount(&self) -> u32 {
        self.fcount.load(Ordering::Acquire)
    }

    fn framerate(&self) -> u32 {
        self.framerate.load(Ordering::Acquire)
    }

    fn ex_mode(&self) -> ExMode {
        *self.ex_mode.lock()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_front_started(&self) -> bool {
        self.front.load(Ordering::Acquire)
    }

    fn is_back_started(&self) -> bool {
        self.back.load(Ordering::Acquire)
    }
}

// ==================== Hardware ====================

/// Kind of stop requested from the hardware layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Process,
    Force,
}

/// Simulated hardware submission layer
#[derive(Debug, Default)]
pub struct SimHardware {
    submissions: Mutex<Vec<ShotRequest>>,
    stops: Mutex<Vec<(GroupId, StopKind)>>,
    fail_submit: AtomicBool,
    completion: Option<Sender<ShotRequest>>,
}

impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hardware whose submissions are also sent to the returned receiver
    pub fn with_completion() -> (Self, Receiver<ShotRequest>) {
        let (tx, rx) = unbounded();
        let hw = Self {
            completion: Some(tx),
            ..Self::default()
        };
        (hw, rx)
    }

    /// Make every following submission fail
    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::Release);
    }

    pub fn submissions(&self) -> Vec<ShotRequest> {
        self.submissions.lock().clone()
    }

    /// Frame tags submitted for `group`, in submission order
    pub fn fcounts(&self, group: GroupId) -> Vec<u32> {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.group_id == group)
            .map(|s| s.fcount)
            .collect()
    }

    pub fn stops(&self) -> Vec<(GroupId, StopKind)> {
        self.stops.lock().clone()
    }
}

impl HwInterface for SimHardware {
    fn submit_shot(&self, group: GroupId, shot: &ShotRequest) -> Result<()> {
        if self.fail_submit.load(Ordering::Acquire) {
            return Err(GroupError::Hardware(format!(
                "{} rejected fcount {}",
                group, shot.fcount
            )));
        }
        self.submissions.lock().push(shot.clone());
        if let Some(tx) = &self.completion {
            let _ = tx.send(shot.clone());
        }
        Ok(())
    }

    fn process_stop(&self, group: GroupId) -> Result<()> {
        self.stops.lock().push((group, StopKind::Process));
        Ok(())
    }

    fn force_stop(&self, group: GroupId) -> Result<()> {
        self.stops.lock().push((group, StopKind::Force));
        Ok(())
    }
}

// ==================== Completer ====================

/// Completes forwarded submissions from a background thread
pub struct SimCompleter {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimCompleter {
    pub fn spawn(
        manager: GroupManager,
        rx: Receiver<ShotRequest>,
        sensor: Option<Arc<SimSensor>>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name("sim-completer".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    let shot = match rx.recv_timeout(Duration::from_millis(5)) {
                        Ok(shot) => shot,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    if let Some(sensor) = &sensor {
                        sensor.advance_to(shot.fcount);
                    }
                    manager.frame_start(shot.stream, shot.fcount);
                    if let Err(e) = manager.done(shot.group, shot.frame, FrameResult::Done) {
                        tracing::warn!("sim completion of fcount {} failed: {}", shot.fcount, e);
                    }
                }
            })
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn sim completer thread");
        }
        Self { running, handle }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimCompleter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ==================== Done Sink ====================

/// One recorded completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub group: GroupHandle,
    pub vid: VideoId,
    pub frame: usize,
    pub result: FrameResult,
}

/// [`BufferDone`] sink that records completions
#[derive(Debug, Default)]
pub struct DoneRecorder {
    completions: Mutex<Vec<Completion>>,
}

impl DoneRecorder {
    pub fn completions(&self) -> Vec<Completion> {
        self.completions.lock().clone()
    }

    pub fn count(&self, result: FrameResult) -> usize {
        self.completions
            .lock()
            .iter()
            .filter(|c| c.result == result)
            .count()
    }
}

impl BufferDone for DoneRecorder {
    fn buffer_done(&self, group: GroupHandle, vid: VideoId, frame: usize, result: FrameResult) {
        self.completions.lock().push(Completion {
            group,
            vid,
            frame,
            result,
        });
    }
}
