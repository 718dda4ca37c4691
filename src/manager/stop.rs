//! Stop and cancel
//!
//! Every wait here is a bounded polling loop. When a loop runs out the engine
//! counts an error and carries on with forced cleanup, so a stopped group is
//! always left stopped.

use super::GroupManager;
use crate::error::{GroupError, Result};
use crate::frame::{FrameQueueState, FrameResult, FrameState};
use crate::group::GroupFlag;
use crate::id::{GroupHandle, VideoId};
use crate::types::DeviceType;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::thread;

/// Outcome of [`GroupManager::stop`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Distinct anomalies met while stopping
    pub errors: u32,
    /// The chain was stopped with `force_stop`
    pub forced: bool,
    /// Queued shots discarded without running
    pub work_dropped: usize,
    /// Leader frames completed with an error during cleanup
    pub frames_cancelled: usize,
    /// Carriers returned to the pool
    pub carriers_flushed: usize,
}

impl StopReport {
    /// Zero for a clean stop, otherwise the negated error count
    pub fn code(&self) -> i32 {
        -(self.errors as i32)
    }

    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

impl GroupManager {
    /// Ask a hardware-pipelined group to stop on its next frame
    pub fn request_force_stop(&self, handle: GroupHandle) -> Result<()> {
        self.group(handle)?.flags.set(GroupFlag::RequestForceStop);
        Ok(())
    }

    /// Drain or abort all shots of `handle`'s chain and stop streaming
    pub fn stop(&self, handle: GroupHandle) -> Result<StopReport> {
        let group = self.group(handle)?;
        if !group.is_started() {
            return Err(GroupError::InvalidState(format!(
                "{} is already stopped",
                group.slot()
            )));
        }
        let task = self.task_of(&group)?;
        let ctx = self.stream_ctx(group.stream())?;
        let policy = self.shared.config.stop.clone();
        let stream = group.stream();
        let mut report = StopReport::default();

        if group.flags.test_and_clear(GroupFlag::RequestForceStop) && group.is_otf_input() {
            group.flags.set(GroupFlag::ForceStop);
        }

        // outstanding requests
        let leader = group.leader();
        let requested = || leader.queue().count(FrameState::Request);
        let mut retry = policy.retries;
        while requested() > 0 && retry > 0 {
            if group.is_otf_input() && group.trigger.has_waiters() {
                let reason = match ctx.sensor() {
                    None => Some("producer is absent"),
                    Some(s) if !s.is_open() => Some("producer is closed"),
                    Some(s) if !s.is_front_started() => Some("producer front is stopped"),
                    Some(s) if !s.is_back_started() => Some("producer back is stopped"),
                    Some(_) if retry < policy.stall_threshold => Some("producer is stalled"),
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    if !group.flags.test(GroupFlag::ForceStop) {
                        tracing::warn!(stream, "{}: {}, forcing trigger", group.slot(), reason);
                    }
                    group.flags.set(GroupFlag::ForceStop);
                    group.trigger.up();
                }
            }
            thread::sleep(policy.interval());
            retry -= 1;
        }
        if requested() > 0 {
            report.work_dropped = task.clear_pending();
            report.errors += 1;
            tracing::error!(
                stream,
                requested = requested(),
                dropped = report.work_dropped,
                "{} request count did not drain",
                group.slot()
            );
        }

        // shot in progress
        if !wait_until(policy.retries, policy.interval(), || !group.flags.test(GroupFlag::Shot)) {
            report.errors += 1;
            tracing::error!(stream, "{} shot did not finish", group.slot());
        }

        report.forced = group.flags.test(GroupFlag::ForceStop);
        let chain = self.chain_of(handle)?;
        for member in &chain {
            let ret = if report.forced {
                self.shared.hw.force_stop(member.id())
            } else {
                self.shared.hw.process_stop(member.id())
            };
            if let Err(e) = ret {
                report.errors += 1;
                tracing::error!(stream, "{} hardware stop failed: {}", member.slot(), e);
            }
        }

        // frames in flight
        if !wait_until(policy.retries, policy.interval(), || {
            leader.queue().count(FrameState::Process) == 0
        }) {
            report.errors += 1;
            tracing::error!(
                stream,
                pcount = leader.queue().count(FrameState::Process),
                "{} frames still processing",
                group.slot()
            );
        }
        let rcount = group.counters.rcount.swap(0, Ordering::AcqRel);
        if rcount != 0 {
            report.errors += 1;
            tracing::error!(stream, rcount, "{} request count is not zero", group.slot());
        }

        let leftover: Vec<usize> = {
            let queue = leader.queue().lock();
            pending_frames(&queue)
        };
        let members: Vec<GroupHandle> = chain.iter().map(|g| g.handle()).collect();
        for index in leftover {
            match self.cancel_frame(handle, index) {
                Ok(Some(FrameState::Process)) => {
                    // Submitted shot that will never see done
                    if let Err(e) = self.release_shot_resources(&group, task, &members) {
                        report.errors += 1;
                        tracing::error!(stream, "frame {} resources were not restored: {}", index, e);
                    }
                    report.frames_cancelled += 1;
                }
                Ok(Some(_)) => report.frames_cancelled += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(stream, "cancel of frame {} failed: {}", index, e),
            }
        }

        for subdev in self.chain_subdevs(handle)? {
            if !wait_until(policy.retries, policy.interval(), || {
                subdev.queue().count(FrameState::Process) == 0
            }) {
                report.errors += 1;
                tracing::error!(stream, "{} frames still processing", subdev.name());
            }
            subdev.set_running(false);
            subdev.stop();
        }

        {
            let mut pool = ctx.pool.lock();
            for member in &chain {
                report.carriers_flushed += pool.flush(member.handle());
            }
        }

        for flag in [GroupFlag::ForceStop, GroupFlag::RequestForceStop, GroupFlag::Start] {
            group.flags.clear(flag);
        }
        leader.stop();
        group.trigger.reset(0);
        report.frames_cancelled += self.cancel_parked(handle);

        tracing::info!(
            stream,
            group = %group.id(),
            errors = report.errors,
            forced = report.forced,
            "{} group is stopped",
            group.slot()
        );
        Ok(report)
    }

    /// Complete leader frame `index` and its pending captures with an error.
    ///
    /// A frame that already reached COMPLETE or FREE is left untouched, so
    /// cancelling twice never completes anything twice.
    pub fn cancel(&self, handle: GroupHandle, index: usize) -> Result<()> {
        self.cancel_frame(handle, index).map(|_| ())
    }

    /// Cancel frame `index`, returning the state it was cancelled from
    fn cancel_frame(&self, handle: GroupHandle, index: usize) -> Result<Option<FrameState>> {
        let group = self.group(handle)?;
        let policy = &self.shared.config.cancel;
        let leader = group.leader();

        let settled = wait_until(policy.wait_count, policy.interval(), || {
            !is_unsettled(&leader.queue().lock(), index)
        });
        if !settled {
            tracing::warn!(
                stream = group.stream(),
                "{} earlier frames did not settle before cancel",
                group.slot()
            );
        }

        let (completions, cancelled) = self.lock_chain(handle, DeviceType::All, true, |lock| {
            let mut completed: Vec<(GroupHandle, VideoId, usize)> = Vec::new();
            let leader_vid = lock.leader_stage().map(|s| s.vid()).unwrap_or(VideoId::NONE);
            let Some((state, fcount, node_group)) = lock.leader().and_then(|q| {
                q.frame(index)
                    .filter(|f| matches!(f.state, FrameState::Request | FrameState::Process))
                    .map(|f| (f.state, f.fcount, f.node_group.clone()))
            }) else {
                return (completed, None);
            };

            for capture in node_group.capture.iter().filter(|c| c.request) {
                for (subdev, queue) in lock.subs() {
                    if subdev.vid() != capture.vid || !subdev.is_started() {
                        continue;
                    }
                    let target = queue
                        .find(FrameState::Process, fcount)
                        .or_else(|| queue.peek(FrameState::Request));
                    let Some(i) = target else {
                        continue;
                    };
                    if let Some(frame) = queue.frame_mut(i) {
                        frame.valid = false;
                        frame.result = Some(FrameResult::Error);
                    }
                    if queue.trans(i, FrameState::Complete) {
                        tracing::debug!(fcount, "{} frame {} is cancelled", subdev.name(), i);
                        completed.push((subdev.owner(), subdev.vid(), i));
                    }
                }
            }

            if let Some(queue) = lock.leader() {
                if let Some(frame) = queue.frame_mut(index) {
                    frame.out_flag = 0;
                    frame.result = Some(FrameResult::Error);
                }
                if queue.trans(index, FrameState::Complete) {
                    completed.push((handle, leader_vid, index));
                }
            }
            (completed, Some(state))
        })?;

        for (owner, vid, frame) in completions {
            self.shared
                .done_sink
                .buffer_done(owner, vid, frame, FrameResult::Error);
        }
        Ok(cancelled)
    }

    /// Cancel the frames of the virtual successor still parked on `handle`
    fn cancel_parked(&self, handle: GroupHandle) -> usize {
        let Ok(group) = self.group(handle) else {
            return 0;
        };
        let vnext = self
            .stream_ctx(group.stream())
            .ok()
            .and_then(|ctx| ctx.topology.read().get(handle).vnext);
        let mut cancelled = 0;
        while let Some(frame) = group.votf_pop() {
            let Some(next) = vnext else {
                tracing::error!(stream = group.stream(), "parked frame {} has no virtual successor", frame);
                continue;
            };
            if let Ok(next_group) = self.group(next) {
                // Queued but never shot
                next_group.counters.rcount.fetch_sub(1, Ordering::AcqRel);
            }
            match self.cancel_frame(next, frame) {
                Ok(Some(_)) => cancelled += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(stream = group.stream(), "cancel of parked frame {} failed: {}", frame, e),
            }
        }
        cancelled
    }
}

/// An earlier frame still has outputs in flight
fn is_unsettled(queue: &FrameQueueState, index: usize) -> bool {
    let flagged = |i: Option<usize>| {
        i.filter(|&i| i != index)
            .and_then(|i| queue.frame(i))
            .map(|f| f.out_flag != 0)
            .unwrap_or(false)
    };
    let process_head = queue
        .peek(FrameState::Process)
        .filter(|&i| i != index)
        .and_then(|i| queue.frame(i))
        .map(|f| f.bak_flag != f.out_flag)
        .unwrap_or(false);
    flagged(queue.peek_tail(FrameState::Free))
        || flagged(queue.peek_tail(FrameState::Complete))
        || process_head
}

/// Leader frames that never reached the hardware or never came back
fn pending_frames(queue: &FrameQueueState) -> Vec<usize> {
    (0..queue.len())
        .filter(|&i| {
            queue
                .frame(i)
                .map(|f| matches!(f.state, FrameState::Request | FrameState::Process))
                .unwrap_or(false)
        })
        .collect()
}

fn wait_until(retries: u32, interval: std::time::Duration, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..retries {
        if done() {
            return true;
        }
        thread::sleep(interval);
    }
    done()
}
