//! Group manager
//!
//! The [`GroupManager`] owns every group of every stream, the per-id worker
//! tasks and each stream's carrier pool and topology. It is cheap to clone;
//! clones share the same state.
//!
//! # Submodules
//!
//! - `topology` - chain building, virtual splicing and the chain-wide lock
//! - `lifecycle` - open / init / start / close and buffer accounting
//! - `shot` - the per-frame shot state machine and `done`
//! - `stop` - bounded-retry stop and shot cancellation
//!
//! # Example
//!
//! ```ignore
//! let manager = GroupManager::probe(SchedulerConfig::default(), hw, done_sink)?;
//! let taa = manager.open(0, Slot::ThreeAa, GroupOpenParams::new(GroupId(1), VideoId(10), size))?;
//! manager.init(taa, InputMode::Otf, VideoId(1), true)?;
//! manager.build(0)?;
//! manager.start(taa)?;
//! manager.buffer_queue(taa, 0, FrameRequest::default())?;
//! ```

mod lifecycle;
mod shot;
mod stop;
mod topology;

pub use lifecycle::FrameRequest;
pub use stop::StopReport;
pub use topology::{ChainLock, Links, SpliceDirection, Topology};

use crate::carrier::CarrierPool;
use crate::config::SchedulerConfig;
use crate::error::{GroupError, Result};
use crate::group::{Group, GroupStatus, GroupTask, SharedSensor};
use crate::hw::{BufferDone, HwInterface};
use crate::id::{GroupHandle, GroupId, StreamId};
use crate::types::Slot;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-stream state shared by its groups
pub(crate) struct StreamContext {
    id: StreamId,
    pool: CarrierPool,
    topology: RwLock<Topology>,
    leader: Mutex<Option<GroupHandle>>,
    sensor: RwLock<Option<SharedSensor>>,
    reprocessing: AtomicBool,
}

impl StreamContext {
    fn new(id: StreamId, config: &SchedulerConfig) -> Self {
        Self {
            id,
            pool: CarrierPool::new(id, config.carrier_pool_size, config.capture_node_max),
            topology: RwLock::new(Topology::default()),
            leader: Mutex::new(None),
            sensor: RwLock::new(None),
            reprocessing: AtomicBool::new(false),
        }
    }

    fn sensor(&self) -> Option<SharedSensor> {
        self.sensor.read().clone()
    }

    fn is_reprocessing(&self) -> bool {
        self.reprocessing.load(Ordering::Acquire)
    }
}

pub(crate) struct Shared {
    config: SchedulerConfig,
    groups: Vec<Arc<Group>>,
    tasks: Vec<GroupTask>,
    streams: Vec<StreamContext>,
    hw: Arc<dyn HwInterface>,
    done_sink: Arc<dyn BufferDone>,
}

/// Owner of all groups, tasks, pools and topologies
#[derive(Clone)]
pub struct GroupManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager")
            .field("streams", &self.shared.streams.len())
            .field("groups", &self.shared.groups.len())
            .finish()
    }
}

/// Diagnostic snapshot of one stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub stream: StreamId,
    pub leader: Option<Slot>,
    pub pool_capacity: usize,
    pub pool_free: usize,
    pub groups: Vec<GroupStatus>,
    pub tasks: Vec<TaskStatus>,
}

/// Diagnostic snapshot of one worker task
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: GroupId,
    pub refcount: u32,
    pub started: bool,
    pub resource_permits: i64,
    pub pending: usize,
}

impl GroupManager {
    /// Allocate every group, task, pool and topology
    pub fn probe(
        config: SchedulerConfig,
        hw: Arc<dyn HwInterface>,
        done_sink: Arc<dyn BufferDone>,
    ) -> Result<Self> {
        config.validate()?;

        let mut groups = Vec::with_capacity(config.stream_count * Slot::COUNT);
        for stream in 0..config.stream_count {
            for slot in Slot::ALL {
                let handle = Self::handle_of(stream, slot);
                groups.push(Arc::new(Group::new(
                    handle,
                    stream,
                    slot,
                    config.capture_node_max,
                )));
            }
        }
        let tasks = (0..config.group_id_max).map(|id| GroupTask::new(GroupId(id))).collect();
        let streams = (0..config.stream_count)
            .map(|id| StreamContext::new(id, &config))
            .collect();

        tracing::info!(
            streams = config.stream_count,
            carriers = config.carrier_pool_size,
            "group manager probed"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                groups,
                tasks,
                streams,
                hw,
                done_sink,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    fn handle_of(stream: StreamId, slot: Slot) -> GroupHandle {
        GroupHandle((stream * Slot::COUNT + slot.index()) as u32)
    }

    /// Handle of the group at `slot` of `stream`
    pub fn handle(&self, stream: StreamId, slot: Slot) -> Result<GroupHandle> {
        if stream >= self.shared.streams.len() {
            return Err(GroupError::InvalidArgument(format!(
                "stream {} is out of range",
                stream
            )));
        }
        Ok(Self::handle_of(stream, slot))
    }

    pub fn group(&self, handle: GroupHandle) -> Result<Arc<Group>> {
        self.shared
            .groups
            .get(handle.index())
            .cloned()
            .ok_or_else(|| GroupError::InvalidArgument(format!("{} is out of range", handle)))
    }

    /// Worker task for a group id
    pub fn task(&self, id: GroupId) -> Option<&GroupTask> {
        self.shared.tasks.get(id.index())
    }

    fn task_of(&self, group: &Group) -> Result<&GroupTask> {
        self.task(group.id()).ok_or_else(|| {
            GroupError::InvalidState(format!("group {} has no valid id", group.handle()))
        })
    }

    fn stream_ctx(&self, stream: StreamId) -> Result<&StreamContext> {
        self.shared.streams.get(stream).ok_or_else(|| {
            GroupError::InvalidArgument(format!("stream {} is out of range", stream))
        })
    }

    /// Carrier pool of a stream
    pub fn pool(&self, stream: StreamId) -> Result<&CarrierPool> {
        Ok(&self.stream_ctx(stream)?.pool)
    }

    /// Attach the producer feeding a stream
    pub fn set_sensor(&self, stream: StreamId, sensor: SharedSensor) -> Result<()> {
        *self.stream_ctx(stream)?.sensor.write() = Some(sensor);
        Ok(())
    }

    /// Detach the producer of a stream
    pub fn clear_sensor(&self, stream: StreamId) -> Result<()> {
        *self.stream_ctx(stream)?.sensor.write() = None;
        Ok(())
    }

    /// Mark a stream as reprocessing (frame tags come from the client)
    pub fn set_reprocessing(&self, stream: StreamId, reprocessing: bool) -> Result<()> {
        self.stream_ctx(stream)?
            .reprocessing
            .store(reprocessing, Ordering::Release);
        Ok(())
    }

    /// Current links of a group
    pub fn links(&self, handle: GroupHandle) -> Result<Links> {
        let group = self.group(handle)?;
        let ctx = self.stream_ctx(group.stream())?;
        let links = ctx.topology.read().get(handle);
        Ok(links)
    }

    /// Diagnostic snapshot of a stream
    pub fn status(&self, stream: StreamId) -> Result<StreamStatus> {
        let ctx = self.stream_ctx(stream)?;
        let pool = ctx.pool.lock();
        let mut groups = Vec::new();
        let mut tasks: Vec<TaskStatus> = Vec::new();
        for slot in Slot::ALL {
            let group = self.group(Self::handle_of(stream, slot))?;
            if !group.is_open() {
                continue;
            }
            groups.push(group.status(pool.in_use(group.handle())));
            if let Some(task) = self.task(group.id()) {
                if !tasks.iter().any(|t| t.id == task.id()) {
                    tasks.push(TaskStatus {
                        id: task.id(),
                        refcount: task.refcount(),
                        started: task.is_started(),
                        resource_permits: task.resource().permits(),
                        pending: task.pending(),
                    });
                }
            }
        }
        let leader = ctx.leader.lock().map(|h| self.shared.groups[h.index()].slot());
        Ok(StreamStatus {
            stream: ctx.id,
            leader,
            pool_capacity: pool.capacity(),
            pool_free: pool.free_count(),
            groups,
            tasks,
        })
    }

    /// Diagnostic snapshot of a stream as pretty JSON
    pub fn status_json(&self, stream: StreamId) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.status(stream)?)?)
    }

    /// Groups of a stream in slot order
    fn stream_groups(&self, stream: StreamId) -> Vec<Arc<Group>> {
        Slot::ALL
            .iter()
            .filter_map(|slot| self.shared.groups.get(Self::handle_of(stream, *slot).index()))
            .cloned()
            .collect()
    }
}
