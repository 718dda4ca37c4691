//! Group lifecycle and buffer accounting
//!
//! open → init → (build) → start → buffer_queue / shot / done → stop → close

use super::{GroupManager, Shared};
use crate::error::{GroupError, Result};
use crate::frame::FrameState;
use crate::group::{GroupFlag, GroupOpenParams, SubStage, WorkerPriority};
use crate::id::{GroupHandle, StreamId, VideoId};
use crate::types::{InputMode, NodeGroup, ShotQuota, Size, Slot};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Client request attached to a queued leader frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    /// Frame tag; ignored for hardware-pipelined groups that compute their own
    pub fcount: u32,
    pub num_buffers: u32,
    pub node_group: NodeGroup,
}

impl Default for FrameRequest {
    fn default() -> Self {
        Self {
            fcount: 0,
            num_buffers: 1,
            node_group: NodeGroup::default(),
        }
    }
}

impl FrameRequest {
    pub fn new(fcount: u32, node_group: NodeGroup) -> Self {
        Self {
            fcount,
            num_buffers: 1,
            node_group,
        }
    }

    pub fn num_buffers(mut self, num_buffers: u32) -> Self {
        self.num_buffers = num_buffers.max(1);
        self
    }
}

impl GroupManager {
    /// Open the group at `slot` of `stream`
    pub fn open(
        &self,
        stream: StreamId,
        slot: Slot,
        params: GroupOpenParams,
    ) -> Result<GroupHandle> {
        let handle = self.handle(stream, slot)?;
        let group = self.group(handle)?;
        if group.is_open() {
            return Err(GroupError::Busy(group.id().0));
        }
        let task = self.task(params.id).ok_or_else(|| {
            GroupError::InvalidArgument(format!(
                "group id {} exceeds {}",
                params.id.0, self.shared.config.group_id_max
            ))
        })?;
        if params.frames == 0 {
            return Err(GroupError::InvalidArgument(format!(
                "{} needs at least one frame",
                slot
            )));
        }

        let worker = &self.shared.config.worker;
        let priority = if !worker.realtime {
            WorkerPriority::Normal
        } else if matches!(slot, Slot::Sensor | Slot::Paf | Slot::ThreeAa) {
            WorkerPriority::Fifo(worker.otf_priority)
        } else {
            WorkerPriority::Fifo(worker.dma_priority)
        };
        task.start(priority, shot_runner(Arc::downgrade(&self.shared)))?;

        let id = params.id;
        group.open(params);
        self.stream_ctx(stream)?.topology.write().reset(handle);

        tracing::info!(stream, group = %id, "{} group is opened", slot);
        Ok(handle)
    }

    /// Add a capture sub-stage to an open group
    pub fn attach_substage(
        &self,
        handle: GroupHandle,
        vid: VideoId,
        name: impl Into<String>,
        output: Size,
        frames: usize,
    ) -> Result<Arc<SubStage>> {
        let group = self.group(handle)?;
        if !group.is_open() {
            return Err(GroupError::InvalidState(format!("{} is not open", group.slot())));
        }
        if !vid.is_some() || group.subdev(vid).is_some() || group.leader().vid() == vid {
            return Err(GroupError::InvalidArgument(format!(
                "video id {:?} is invalid or already used on {}",
                vid,
                group.slot()
            )));
        }
        let subdev = Arc::new(SubStage::new(
            handle,
            vid,
            name,
            output,
            frames,
            self.shared.config.capture_node_max,
            false,
        ));
        subdev.open();
        group.add_subdev(subdev.clone());
        Ok(subdev)
    }

    /// Select the input mode, source and role of an open group
    pub fn init(
        &self,
        handle: GroupHandle,
        mode: InputMode,
        source_vid: VideoId,
        stream_leader: bool,
    ) -> Result<()> {
        let group = self.group(handle)?;
        if !group.is_open() {
            return Err(GroupError::InvalidState(format!("{} is not open", group.slot())));
        }
        if group.is_started() {
            return Err(GroupError::InvalidState(format!(
                "{} is already started",
                group.slot()
            )));
        }

        for flag in [
            GroupFlag::OtfInput,
            GroupFlag::PipeInput,
            GroupFlag::SemiPipeInput,
            GroupFlag::VotfInput,
        ] {
            group.flags.clear(flag);
        }

        let q = &self.shared.config.quota;
        let (budget, quota) = match mode {
            InputMode::Otf => {
                group.flags.set(GroupFlag::OtfInput);
                (
                    q.min_shot_resource,
                    ShotQuota::new(
                        q.min_async_shots,
                        q.min_sync_shots,
                        q.min_async_shots,
                        q.min_async_shots,
                    ),
                )
            }
            InputMode::Pipe => {
                group.flags.set(GroupFlag::PipeInput);
                (1, ShotQuota::new(0, 1, 0, 0))
            }
            InputMode::SemiPipe => {
                group.flags.set(GroupFlag::SemiPipeInput);
                (1, ShotQuota::new(0, 1, 0, 0))
            }
            InputMode::VirtualOtf => (1, ShotQuota::new(0, 1, 0, 0)),
            InputMode::Memory => (1, ShotQuota::new(0, 1, 0, 0)),
        };
        group.set_quota(quota);
        group.set_shot_budget(budget as i32);
        group.init(mode, source_vid);
        group.flags.set(GroupFlag::Init);

        if stream_leader {
            *self.stream_ctx(group.stream())?.leader.lock() = Some(handle);
        }

        tracing::info!(
            stream = group.stream(),
            group = %group.id(),
            ?mode,
            source = source_vid.0,
            "{} group is initialized",
            group.slot()
        );
        Ok(())
    }

    /// Compute the start-time quota and start streaming on a group
    pub fn start(&self, handle: GroupHandle) -> Result<()> {
        let group = self.group(handle)?;
        if !group.flags.test(GroupFlag::Init) {
            return Err(GroupError::InvalidState(format!(
                "{} is not initialized",
                group.slot()
            )));
        }
        if group.is_started() {
            return Err(GroupError::InvalidState(format!(
                "{} is already started",
                group.slot()
            )));
        }
        let task = self.task_of(&group)?;
        let ctx = self.stream_ctx(group.stream())?;
        let sensor = ctx.sensor();
        let q = &self.shared.config.quota;
        let framerate = sensor.as_ref().map(|s| s.framerate()).unwrap_or(0);

        let otf = !ctx.is_reprocessing() && group.is_otf_input();
        let quota = if ctx.is_reprocessing() {
            ShotQuota::new(1, 0, 0, 0)
        } else if group.is_otf_input() {
            let quota = match &q.quota_override {
                Some(quota) => *quota,
                None => {
                    let ex_mode = sensor.as_ref().map(|s| s.ex_mode()).unwrap_or_default();
                    let (mut async_shots, mut sync_shots) =
                        if ex_mode.is_dual_fps() || framerate > q.high_fps_threshold {
                            (q.min_async_shots + 1, q.min_sync_shots)
                        } else {
                            (q.min_async_shots, q.min_sync_shots)
                        };
                    if q.reduce_command_delay {
                        async_shots += 1;
                        sync_shots = 0;
                    }
                    ShotQuota::new(async_shots, sync_shots, async_shots, async_shots)
                }
            };

            if sensor.is_none() {
                tracing::warn!(
                    stream = group.stream(),
                    "{} has no producer, frame counter starts at zero",
                    group.slot()
                );
            }
            let sensor_fcount = sensor.as_ref().map(|s| s.fcount()).unwrap_or(0) + 1;
            group.counters.sensor_fcount.store(sensor_fcount, Ordering::Release);
            group.counters.backup_fcount.store(sensor_fcount - 1, Ordering::Release);
            group.counters.fcount.store(sensor_fcount - 1, Ordering::Release);
            quota
        } else {
            let async_shots = if framerate > q.m2m_fast_fps_threshold {
                q.min_async_shots_240fps
            } else {
                q.min_async_shots
            };
            ShotQuota::new(async_shots, 0, 0, 0)
        };

        let budget = quota.depth().max(1);
        group.set_quota(quota);
        group.set_shot_budget(budget as i32);
        group.counters.scount.store(0, Ordering::Release);
        group.counters.pcount.store(0, Ordering::Release);
        group.trigger.reset(0);
        // Memory-fed workers keep the single resource taken at task start
        if otf {
            task.resource().reset(budget as i64);
        }
        for subdev in group.subdevs() {
            subdev.start();
        }
        group.leader().start();
        group.flags.set(GroupFlag::Start);

        tracing::info!(
            stream = group.stream(),
            group = %group.id(),
            async_shots = quota.async_shots,
            sync_shots = quota.sync_shots,
            skip_shots = quota.skip_shots,
            init_shots = quota.init_shots,
            framerate,
            "{} group is started",
            group.slot()
        );
        Ok(())
    }

    /// Close a group, stopping it first if it is still streaming
    pub fn close(&self, handle: GroupHandle) -> Result<()> {
        let group = self.group(handle)?;
        if !group.is_open() {
            return Err(GroupError::InvalidState(format!("{} is not open", group.slot())));
        }
        if group.is_started() {
            tracing::warn!(stream = group.stream(), "{} is closed while streaming", group.slot());
            let report = self.stop(handle)?;
            if report.errors > 0 {
                tracing::warn!(errors = report.errors, "{} stopped with anomalies", group.slot());
            }
        }

        let task = self.task_of(&group)?;
        group.trigger.interrupt();
        task.stop()?;

        let stream = group.stream();
        let ctx = self.stream_ctx(stream)?;
        ctx.pool.lock().flush(handle);
        group.close();
        ctx.topology.write().reset(handle);
        {
            let mut leader = ctx.leader.lock();
            if *leader == Some(handle) {
                *leader = None;
            }
        }

        if self.stream_groups(stream).iter().all(|g| !g.is_open()) {
            let mut pool = ctx.pool.lock();
            if pool.free_count() != pool.capacity() {
                tracing::warn!(
                    stream,
                    free = pool.free_count(),
                    capacity = pool.capacity(),
                    "carrier pool is not full on last close, rebuilding"
                );
                pool.reset();
            }
        }

        tracing::info!(stream, "{} group is closed", group.slot());
        Ok(())
    }

    /// Queue leader frame `index` and schedule its shot
    pub fn buffer_queue(&self, handle: GroupHandle, index: usize, request: FrameRequest) -> Result<()> {
        let group = self.group(handle)?;
        if !group.is_started() {
            return Err(GroupError::InvalidState(format!(
                "{} is not started",
                group.slot()
            )));
        }
        let leader = group.leader();
        {
            let mut queue = leader.queue().lock();
            let total = queue.len();
            let frame = queue.frame_mut(index).ok_or_else(|| {
                GroupError::InvalidArgument(format!("frame {} is out of range", index))
            })?;
            if frame.state != FrameState::Free {
                return Err(GroupError::InvalidState(format!(
                    "frame {} of {} is {}, not FREE",
                    index,
                    group.slot(),
                    frame.state
                )));
            }
            if frame.out_flag != 0 {
                tracing::warn!(
                    stream = group.stream(),
                    "frame {} of {} has stale output flag {:#x}",
                    index,
                    group.slot(),
                    frame.out_flag
                );
                frame.out_flag = 0;
            }
            frame.fcount = request.fcount;
            frame.num_buffers = request.num_buffers.max(1);
            frame.node_group = request.node_group;
            frame.result = None;
            frame.valid = true;
            frame.bak_flag = 0;
            queue.trans(index, FrameState::Request);

            let requested = queue.count(FrameState::Request);
            if group.input_mode() == Some(InputMode::Memory) && requested > total / 2 {
                tracing::warn!(
                    stream = group.stream(),
                    requested,
                    total,
                    "{} request queue is more than half full",
                    group.slot()
                );
            }
        }
        group.counters.rcount.fetch_add(1, Ordering::AcqRel);

        let ctx = self.stream_ctx(group.stream())?;
        let vprev = ctx.topology.read().get(handle).vprev;
        match vprev {
            Some(vprev) => {
                self.group(vprev)?.votf_push(index);
                tracing::trace!(
                    stream = group.stream(),
                    "{} frame {} parked for the virtual path",
                    group.slot(),
                    index
                );
                Ok(())
            }
            None => self.task_of(&group)?.queue(handle, index),
        }
    }

    /// Return completed leader frame `index` to FREE
    pub fn buffer_finish(&self, handle: GroupHandle, index: usize) -> Result<()> {
        let group = self.group(handle)?;
        if !group.is_open() {
            tracing::warn!(stream = group.stream(), "{} is closed, finish ignored", group.slot());
            return Ok(());
        }
        let leader = group.leader();
        let mut queue = leader.queue().lock();
        let frame = queue.frame(index).ok_or_else(|| {
            GroupError::InvalidArgument(format!("frame {} is out of range", index))
        })?;
        if frame.state != FrameState::Complete {
            return Err(GroupError::InvalidState(format!(
                "frame {} of {} is {}, not COMPLETE",
                index,
                group.slot(),
                frame.state
            )));
        }
        queue.trans(index, FrameState::Free);
        Ok(())
    }

    /// Queue capture frame `index` of sub-stage `vid`
    pub fn substage_queue(&self, handle: GroupHandle, vid: VideoId, index: usize) -> Result<()> {
        self.substage_trans(handle, vid, index, FrameState::Free, FrameState::Request)
    }

    /// Return completed capture frame `index` of sub-stage `vid` to FREE
    pub fn substage_finish(&self, handle: GroupHandle, vid: VideoId, index: usize) -> Result<()> {
        self.substage_trans(handle, vid, index, FrameState::Complete, FrameState::Free)
    }

    fn substage_trans(
        &self,
        handle: GroupHandle,
        vid: VideoId,
        index: usize,
        from: FrameState,
        to: FrameState,
    ) -> Result<()> {
        let group = self.group(handle)?;
        let subdev = group.subdev(vid).ok_or_else(|| {
            GroupError::InvalidArgument(format!("{} has no sub-stage {:?}", group.slot(), vid))
        })?;
        let mut queue = subdev.queue().lock();
        let frame = queue.frame_mut(index).ok_or_else(|| {
            GroupError::InvalidArgument(format!("frame {} is out of range", index))
        })?;
        if frame.state != from {
            return Err(GroupError::InvalidState(format!(
                "frame {} of {} is {}, not {}",
                index,
                subdev.name(),
                frame.state,
                from
            )));
        }
        if to == FrameState::Request {
            frame.result = None;
            frame.valid = true;
        }
        queue.trans(index, to);
        Ok(())
    }
}

fn shot_runner(shared: Weak<Shared>) -> crate::group::ShotRunner {
    Arc::new(move |handle, frame| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let manager = GroupManager { shared };
        if let Err(e) = manager.shot(handle, frame) {
            match e {
                GroupError::Interrupted | GroupError::Cancelled(_) => {
                    tracing::debug!(%handle, frame, "shot abandoned: {}", e)
                }
                _ => tracing::error!(%handle, frame, "shot failed: {}", e),
            }
        }
    })
}
