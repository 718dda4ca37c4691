//! Shot state machine
//!
//! One call of [`GroupManager::shot`] takes a REQUEST frame of a group from
//! admission to hardware submission:
//!
//! 1. admission: force stop / task stop checks
//! 2. shot budget and worker resource, then nested child resources
//! 3. virtual path activation
//! 4. frame tag: bootstrap, trigger wait or client supplied
//! 5. carrier binding with crop clamping and junction checks
//! 6. stage callback, carrier hand-off, hardware submission
//!
//! Any failure before submission unwinds what was taken and completes the
//! frame with an error.

use super::{GroupManager, SpliceDirection, StreamContext};
use crate::carrier::CarrierPoolState;
use crate::config::MIN_OF_SYNC_SHOTS;
use crate::error::{GroupError, Result};
use crate::frame::{FrameResult, FrameState};
use crate::group::{Group, GroupFlag, GroupTask};
use crate::hw::ShotRequest;
use crate::id::{CarrierId, GroupHandle, GroupId, VideoId};
use crate::types::{DeviceType, NodeGroup};
use std::sync::atomic::Ordering;
use std::sync::Arc;

// Checkpoints recorded in the group's pcount
const PC_ENTER: u32 = 1;
const PC_ADMITTED: u32 = 2;
const PC_RESOURCE: u32 = 3;
const PC_VIRTUAL: u32 = 4;
const PC_TAGGED: u32 = 5;
const PC_CARRIER: u32 = 6;
const PC_CALLBACK: u32 = 7;
const PC_SUBMITTED: u32 = 8;

/// Leader bit of a frame's output flag
const OUT_LEADER: u64 = 1;

#[inline]
fn out_capture(cid: usize) -> u64 {
    1u64.checked_shl(cid as u32 + 1).unwrap_or(0)
}

/// Everything a shot took so far, returned on failure
#[derive(Debug, Default)]
struct Held {
    budget: bool,
    resource: bool,
    children: Vec<GroupId>,
    /// Carrier and the group whose list holds it
    carrier: Option<(CarrierId, GroupHandle)>,
}

impl GroupManager {
    /// Run the shot of leader frame `index` on `handle`
    pub fn shot(&self, handle: GroupHandle, index: usize) -> Result<()> {
        let group = self.group(handle)?;
        let task = self.task_of(&group)?;
        let ctx = self.stream_ctx(group.stream())?;

        group.flags.set(GroupFlag::Shot);
        group.counters.rcount.fetch_sub(1, Ordering::AcqRel);
        group.mark_pc(PC_ENTER);

        let mut held = Held::default();
        let result = self.run_shot(&group, task, ctx, index, &mut held);
        if let Err(e) = &result {
            self.unwind(&group, task, ctx, index, held, e);
        }
        group.flags.clear(GroupFlag::Shot);
        result
    }

    fn run_shot(
        &self,
        group: &Arc<Group>,
        task: &GroupTask,
        ctx: &StreamContext,
        index: usize,
        held: &mut Held,
    ) -> Result<()> {
        let handle = group.handle();
        check_stop(group, task, PC_ENTER)?;
        group.mark_pc(PC_ADMITTED);

        group.shot_budget_dec();
        held.budget = true;
        task.resource().down()?;
        held.resource = true;
        check_stop(group, task, PC_ADMITTED)?;
        group.mark_pc(PC_RESOURCE);

        let vnext = ctx.topology.read().get(handle).vnext;
        if let Some(vnext) = vnext {
            if group.votf_has_pending() {
                self.splice_virtual(vnext, SpliceDirection::Start)?;
            }
        }
        let links = ctx.topology.read().get(handle);
        group.mark_pc(PC_VIRTUAL);

        if !group.is_otf_input() {
            let chain = ctx.topology.read().chain(handle);
            for child in chain.into_iter().skip(1) {
                let id = self.group(child)?.id();
                if id == group.id() {
                    continue;
                }
                if let Some(child_task) = self.task(id).filter(|t| t.is_started()) {
                    child_task.resource().down()?;
                    held.children.push(id);
                }
            }
        }

        let (num_buffers, client_fcount) = {
            let leader = group.leader();
            let queue = leader.queue().lock();
            let frame = queue.frame(index).ok_or_else(|| {
                GroupError::InvalidArgument(format!("frame {} is out of range", index))
            })?;
            if frame.state != FrameState::Request {
                return Err(GroupError::InvalidState(format!(
                    "frame {} of {} is {}, not REQUEST",
                    index,
                    group.slot(),
                    frame.state
                )));
            }
            (frame.num_buffers.max(1), frame.fcount)
        };

        let tag = self.frame_tag(group, task, ctx, num_buffers, client_fcount)?;
        group.mark_pc(PC_TAGGED);

        let node_group = {
            let leader = group.leader();
            let mut queue = leader.queue().lock();
            let frame = queue.frame_mut(index).ok_or_else(|| {
                GroupError::InvalidArgument(format!("frame {} is out of range", index))
            })?;
            frame.fcount = tag;
            frame.node_group.clone()
        };

        let (carrier, node_group) = self.bind_carrier(group, ctx, &links, tag, node_group, held)?;
        {
            let leader = group.leader();
            let mut queue = leader.queue().lock();
            if let Some(frame) = queue.frame_mut(index) {
                frame.node_group = node_group.clone();
            }
        }
        group.set_leader_canvas(node_group.leader.input);
        group.mark_pc(PC_CARRIER);

        let request = ShotRequest {
            stream: group.stream(),
            group: handle,
            group_id: group.id(),
            slot: group.slot(),
            frame: index,
            fcount: tag,
            num_buffers,
            node_group,
        };

        if let Some(callback) = group.shot_callback() {
            callback.shot(group.id(), &request)?;
        }
        group.mark_pc(PC_CALLBACK);

        self.post(group, ctx, &links, carrier, &request.node_group, held)?;
        let out_flag = self.mark_process(group, index, &request)?;

        self.shared.hw.submit_shot(group.id(), &request)?;
        group.mark_pc(PC_SUBMITTED);

        if let Some(vnext) = links.vnext {
            self.forward_virtual(group, vnext);
        }

        group.counters.scount.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            stream = group.stream(),
            group = %group.id(),
            fcount = tag,
            out_flag = format_args!("{:#x}", out_flag),
            "{} shot",
            group.slot()
        );
        Ok(())
    }

    /// Decide the frame tag, waiting on the trigger when the quota says so
    fn frame_tag(
        &self,
        group: &Group,
        task: &GroupTask,
        ctx: &StreamContext,
        num_buffers: u32,
        client_fcount: u32,
    ) -> Result<u32> {
        let counters = &group.counters;
        let reprocessing = ctx.is_reprocessing();

        if !group.is_otf_input() || reprocessing {
            return self.check_client_tag(group, client_fcount, num_buffers, reprocessing);
        }

        let quota = group.quota();
        // Only a present producer that has not started streaming is bootstrapped
        let bootstrap = ctx
            .sensor()
            .map(|s| !s.is_front_started())
            .unwrap_or(false);

        let tag = if bootstrap && quota.init_shots > group.scount() {
            let tag = group.sensor_fcount();
            counters.backup_fcount.store(tag, Ordering::Release);
            counters.sensor_fcount.fetch_add(num_buffers, Ordering::AcqRel);
            tracing::trace!(stream = group.stream(), fcount = tag, "{} bootstrap shot", group.slot());
            tag
        } else if quota.sync_shots > 0 {
            let budget = group.shot_budget();
            let try_sync = quota.async_shots == 0
                || budget < MIN_OF_SYNC_SHOTS as i32
                || group.backup_fcount() >= group.sensor_fcount();
            if try_sync {
                loop {
                    group.trigger.down()?;
                    check_stop(group, task, PC_RESOURCE)?;
                    if group.backup_fcount() < group.sensor_fcount() {
                        break;
                    }
                    tracing::trace!(
                        stream = group.stream(),
                        backup = group.backup_fcount(),
                        "{} trigger is stale, waiting again",
                        group.slot()
                    );
                }
            }
            let tag = next_tag(group, num_buffers);
            counters.backup_fcount.store(tag, Ordering::Release);
            if !try_sync && budget > MIN_OF_SYNC_SHOTS as i32 {
                counters.sensor_fcount.fetch_add(num_buffers, Ordering::AcqRel);
            }
            tag
        } else {
            let tag = next_tag(group, num_buffers);
            counters.backup_fcount.store(tag, Ordering::Release);
            tag
        };

        if tag == 0 {
            return Err(GroupError::InvalidState(format!(
                "{} computed a zero frame tag",
                group.slot()
            )));
        }
        counters.fcount.store(tag, Ordering::Release);
        Ok(tag)
    }

    /// Validate a client supplied tag against the group's frame counter
    fn check_client_tag(
        &self,
        group: &Group,
        fcount: u32,
        num_buffers: u32,
        reprocessing: bool,
    ) -> Result<u32> {
        let counter = &group.counters.fcount;
        if reprocessing {
            counter.store(fcount, Ordering::Release);
            return Ok(fcount);
        }
        if fcount == 0 {
            return Err(GroupError::InvalidArgument(format!(
                "{} frame tag is zero",
                group.slot()
            )));
        }

        let added = if group.scount() > 0 { num_buffers } else { 1 };
        let expected = counter.fetch_add(added, Ordering::AcqRel).wrapping_add(added);
        if fcount > expected {
            tracing::warn!(
                stream = group.stream(),
                fcount,
                expected,
                "{} frame tag jumped ahead",
                group.slot()
            );
            counter.store(fcount, Ordering::Release);
        } else if fcount < expected {
            tracing::error!(
                stream = group.stream(),
                fcount,
                expected,
                "{} frame tag went backwards",
                group.slot()
            );
            counter.fetch_sub(added, Ordering::AcqRel);
            return Err(GroupError::InvalidArgument(format!(
                "{} frame tag {} is older than {}",
                group.slot(),
                fcount,
                expected
            )));
        }
        Ok(fcount)
    }

    /// Claim or look up the carrier for `tag` and apply the crop contracts
    fn bind_carrier(
        &self,
        group: &Group,
        ctx: &StreamContext,
        links: &super::Links,
        tag: u32,
        mut node_group: NodeGroup,
        held: &mut Held,
    ) -> Result<(CarrierId, NodeGroup)> {
        let handle = group.handle();
        let stream = group.stream();

        let leader_size = group.leader().size();
        let requested_input = node_group.leader.input;
        if node_group.leader.input.clamp_to(leader_size) {
            tracing::warn!(
                stream,
                fcount = tag,
                "{} input crop ({}) exceeds {}, clamped",
                group.slot(),
                requested_input,
                leader_size
            );
        }

        let subdevs = self.chain_subdevs(handle)?;
        for (cid, capture) in node_group.capture.iter_mut().enumerate() {
            if !capture.request {
                continue;
            }
            let Some(subdev) = subdevs.iter().find(|s| s.vid() == capture.vid) else {
                tracing::error!(
                    stream,
                    fcount = tag,
                    "{} capture {:?} is not in the chain, dropped",
                    group.slot(),
                    capture.vid
                );
                capture.request = false;
                continue;
            };
            subdev.set_cid(cid);
            let requested = capture.output;
            let size = subdev.size();
            if capture.output.clamp_to(size) {
                tracing::warn!(
                    stream,
                    fcount = tag,
                    "{} output crop ({}) exceeds {}, clamped",
                    subdev.name(),
                    requested,
                    size
                );
            }
            if subdev.queue().count(FrameState::Request) == 0 {
                tracing::warn!(
                    stream,
                    fcount = tag,
                    "{} has no queued frame, capture dropped",
                    subdev.name()
                );
                capture.request = false;
            }
        }

        let gnext_junction = match links.gnext {
            Some(_) => Some(self.tail_junction(handle)?.ok_or_else(|| {
                GroupError::Topology(format!("{} has no junction to its next group", group.slot()))
            })?),
            None => None,
        };
        let gprev_junction = match links.gprev {
            Some(gprev) => {
                let junction = self.tail_junction(gprev)?.ok_or_else(|| {
                    GroupError::Topology(format!("{} has no junction from its previous group", group.slot()))
                })?;
                let cid = junction.cid().ok_or_else(|| {
                    GroupError::Topology(format!("junction {} was never shot", junction.name()))
                })?;
                Some((self.group(gprev)?.slot(), cid))
            }
            None => None,
        };

        let mut pool = ctx.pool.lock();
        let id = match links.gprev {
            None => {
                let id = pool
                    .claim(handle)
                    .ok_or(GroupError::PoolExhausted { stream })?;
                held.carrier = Some((id, handle));
                reset_carrier(&mut pool, id, tag, group.capture_nodes());
                id
            }
            Some(_) => {
                let id = pool.rewind(handle, tag).ok_or_else(|| {
                    tracing::error!(stream, fcount = tag, "{} carrier resync failed", group.slot());
                    GroupError::CarrierNotFound {
                        group: group.id().0,
                        fcount: tag,
                    }
                })?;
                held.carrier = Some((id, handle));
                id
            }
        };
        let carrier = pool.carrier_mut(id).ok_or(GroupError::CarrierNotFound {
            group: group.id().0,
            fcount: tag,
        })?;

        if let Some((prev_slot, cid)) = gprev_junction {
            let source = carrier
                .config(prev_slot)
                .capture
                .get(cid)
                .map(|c| c.output)
                .unwrap_or_default();
            let input = &mut node_group.leader.input;
            if source.area() > 0 && source.area() < input.area() {
                tracing::warn!(
                    stream,
                    fcount = tag,
                    "{} input ({}) is bigger than its source ({}), narrowed",
                    group.slot(),
                    input,
                    source
                );
                input.w = source.w;
                input.h = source.h;
            }
        }
        if let (Some(next), Some(junction)) = (links.gnext, gnext_junction) {
            if let Some(cid) = junction.cid().filter(|&cid| node_group.requested(cid)) {
                let next_size = self.group(next)?.leader().size();
                let output = &mut node_group.capture[cid].output;
                let requested = *output;
                if output.clamp_to(next_size) {
                    tracing::warn!(
                        stream,
                        fcount = tag,
                        "{} junction output ({}) exceeds next input {}, clamped",
                        junction.name(),
                        requested,
                        next_size
                    );
                }
            }
        }

        *carrier.config_mut(group.slot()) = node_group.clone();
        Ok((id, node_group))
    }

    /// Hand the carrier to the next group or return it to the pool
    fn post(
        &self,
        group: &Group,
        ctx: &StreamContext,
        links: &super::Links,
        carrier: CarrierId,
        node_group: &NodeGroup,
        held: &mut Held,
    ) -> Result<()> {
        let handle = group.handle();
        let handoff = match links.gnext {
            Some(next) => self
                .tail_junction(handle)?
                .and_then(|j| j.cid())
                .filter(|&cid| node_group.requested(cid))
                .map(|cid| (next, node_group.capture[cid].output)),
            None => None,
        };

        let mut pool = ctx.pool.lock();
        match handoff {
            Some((next, canvas)) => {
                if let Some(c) = pool.carrier_mut(carrier) {
                    c.canvas = canvas;
                }
                pool.transfer(carrier, handle, next)?;
                held.carrier = Some((carrier, next));
            }
            None => {
                pool.release(carrier, handle)?;
                held.carrier = None;
            }
        }
        Ok(())
    }

    /// Move the leader frame and requested captures to PROCESS
    fn mark_process(&self, group: &Group, index: usize, request: &ShotRequest) -> Result<u64> {
        let subdevs = self.chain_subdevs(group.handle())?;
        let mut out_flag = OUT_LEADER;
        for (cid, capture) in request.node_group.capture.iter().enumerate() {
            if !capture.request {
                continue;
            }
            let Some(subdev) = subdevs.iter().find(|s| s.vid() == capture.vid) else {
                continue;
            };
            let mut queue = subdev.queue().lock();
            if let Some(i) = queue.peek(FrameState::Request) {
                if let Some(frame) = queue.frame_mut(i) {
                    frame.fcount = request.fcount;
                    frame.result = None;
                }
                queue.trans(i, FrameState::Process);
                subdev.set_running(true);
                out_flag |= out_capture(cid);
            }
        }

        let leader = group.leader();
        let mut queue = leader.queue().lock();
        let frame = queue.frame_mut(index).ok_or_else(|| {
            GroupError::InvalidArgument(format!("frame {} is out of range", index))
        })?;
        frame.out_flag = out_flag;
        frame.bak_flag = out_flag;
        queue.trans(index, FrameState::Process);
        Ok(out_flag)
    }

    /// Give back what a failed shot took and complete its frame with an error
    fn unwind(
        &self,
        group: &Group,
        task: &GroupTask,
        ctx: &StreamContext,
        index: usize,
        held: Held,
        error: &GroupError,
    ) {
        for id in held.children.iter().rev() {
            if let Some(child) = self.task(*id) {
                child.resource().up();
            }
        }
        if held.resource {
            task.resource().up();
        }
        if held.budget {
            group.shot_budget_inc();
        }
        if let Some((id, owner)) = held.carrier {
            if let Err(e) = ctx.pool.lock().release(id, owner) {
                tracing::error!(stream = group.stream(), "carrier release on unwind failed: {}", e);
            }
        }

        // The parked virtual frame still has to run or fail on its own worker
        let links = ctx.topology.read().get(group.handle());
        if let Some(vnext) = links.vnext {
            self.forward_virtual(group, vnext);
        }
        if links.vprev.is_some() {
            if let Err(e) = self.splice_virtual(group.handle(), SpliceDirection::End) {
                tracing::error!(stream = group.stream(), "virtual path restore failed: {}", e);
            }
        }

        let pc = group.counters.pcount.load(Ordering::Acquire);
        match error {
            GroupError::Interrupted | GroupError::Cancelled(_) => tracing::info!(
                stream = group.stream(),
                pc,
                "{} shot {} cancelled: {}",
                group.slot(),
                index,
                error
            ),
            _ => tracing::error!(
                stream = group.stream(),
                pc,
                "{} shot {} failed: {}",
                group.slot(),
                index,
                error
            ),
        }

        if let Err(e) = self.cancel(group.handle(), index) {
            tracing::error!(stream = group.stream(), "cancel of frame {} failed: {}", index, e);
        }
    }

    /// Queue the oldest frame parked on `group` to the worker of `vnext`
    fn forward_virtual(&self, group: &Group, vnext: GroupHandle) {
        let Some(frame) = group.votf_pop() else {
            return;
        };
        let queued = self
            .group(vnext)
            .and_then(|next| self.task_of(&next).and_then(|t| t.queue(vnext, frame)));
        if let Err(e) = queued {
            tracing::error!(
                stream = group.stream(),
                "virtual frame {} could not be forwarded: {}",
                frame,
                e
            );
        }
    }

    /// Give back the shot budget and worker resources a submitted shot holds
    pub(super) fn release_shot_resources(
        &self,
        group: &Group,
        task: &GroupTask,
        chain: &[GroupHandle],
    ) -> Result<()> {
        if !group.is_otf_input() {
            for &child in chain.iter().skip(1) {
                let id = self.group(child)?.id();
                if id == group.id() {
                    continue;
                }
                if let Some(child_task) = self.task(id).filter(|t| t.is_started()) {
                    child_task.resource().up();
                }
            }
        }
        group.shot_budget_inc();
        task.resource().up();
        Ok(())
    }

    /// Report completion of leader frame `index`
    pub fn done(&self, handle: GroupHandle, index: usize, result: FrameResult) -> Result<()> {
        let group = self.group(handle)?;
        let fcount = {
            let leader = group.leader();
            let queue = leader.queue().lock();
            let frame = queue.frame(index).ok_or_else(|| {
                GroupError::InvalidArgument(format!("frame {} is out of range", index))
            })?;
            if frame.state != FrameState::Process {
                return Err(GroupError::InvalidState(format!(
                    "frame {} of {} is {}, not PROCESS",
                    index,
                    group.slot(),
                    frame.state
                )));
            }
            frame.fcount
        };
        let task = self.task_of(&group)?;
        let ctx = self.stream_ctx(group.stream())?;
        let (links, chain) = {
            let topo = ctx.topology.read();
            (topo.get(handle), topo.chain(handle))
        };

        if result == FrameResult::Error {
            if let Some(next) = links.gnext {
                let mut pool = ctx.pool.lock();
                if let Some(id) = pool.find(next, fcount) {
                    if let Err(e) = pool.release(id, next) {
                        tracing::error!(stream = group.stream(), fcount, "carrier release failed: {}", e);
                    }
                }
            }
        }

        self.release_shot_resources(&group, task, &chain)?;

        if links.vprev.is_some() {
            if let Err(e) = self.splice_virtual(handle, SpliceDirection::End) {
                tracing::error!(stream = group.stream(), "virtual path restore failed: {}", e);
            }
        }

        let completions = self.lock_chain(handle, DeviceType::All, true, |lock| {
            let mut completed: Vec<(GroupHandle, VideoId, usize)> = Vec::new();
            let leader_vid = lock.leader_stage().map(|s| s.vid()).unwrap_or(VideoId::NONE);
            let Some((out_flag, node_group)) = lock
                .leader()
                .and_then(|q| q.frame(index).map(|f| (f.out_flag, f.node_group.clone())))
            else {
                return completed;
            };

            for (cid, capture) in node_group.capture.iter().enumerate() {
                if out_flag & out_capture(cid) == 0 {
                    continue;
                }
                for (subdev, queue) in lock.subs() {
                    if subdev.vid() != capture.vid {
                        continue;
                    }
                    if let Some(i) = queue.find(FrameState::Process, fcount) {
                        if let Some(frame) = queue.frame_mut(i) {
                            frame.result = Some(result);
                        }
                        if queue.trans(i, FrameState::Complete) {
                            completed.push((subdev.owner(), subdev.vid(), i));
                        }
                    }
                }
            }

            if let Some(queue) = lock.leader() {
                if let Some(frame) = queue.frame_mut(index) {
                    frame.out_flag = 0;
                    frame.result = Some(result);
                }
                if queue.trans(index, FrameState::Complete) {
                    completed.push((handle, leader_vid, index));
                }
            }
            completed
        })?;

        for (owner, vid, frame) in completions {
            self.shared.done_sink.buffer_done(owner, vid, frame, result);
        }
        tracing::trace!(stream = group.stream(), fcount, ?result, "{} done", group.slot());
        Ok(())
    }

    /// Producer frame start: advance the frame counter of streaming
    /// on-the-fly groups and release their trigger
    pub fn frame_start(&self, stream: crate::id::StreamId, fcount: u32) {
        for group in self.stream_groups(stream) {
            if !group.is_started() || !group.is_otf_input() {
                continue;
            }
            let lead = group.quota().skip_shots.max(1);
            group
                .counters
                .sensor_fcount
                .fetch_max(fcount.saturating_add(lead), Ordering::AcqRel);
            group.trigger.up_capped(1);
        }
    }
}

fn check_stop(group: &Group, task: &GroupTask, pc: u32) -> Result<()> {
    if group.flags.test(GroupFlag::ForceStop) {
        return Err(GroupError::Cancelled(format!(
            "{} is force stopped (pc {})",
            group.slot(),
            pc
        )));
    }
    if task.is_stop_requested() {
        return Err(GroupError::Cancelled(format!(
            "task {} is stopping (pc {})",
            task.id(),
            pc
        )));
    }
    Ok(())
}

/// Next tag from the producer counter, keeping batches in step and tags increasing
fn next_tag(group: &Group, num_buffers: u32) -> u32 {
    let sensor = group.sensor_fcount();
    let backup = group.backup_fcount();
    let mut tag = if num_buffers > 1 {
        if sensor <= backup + num_buffers {
            backup + num_buffers
        } else {
            tracing::warn!(
                stream = group.stream(),
                sensor,
                backup,
                "{} batch tag is pinned to the producer",
                group.slot()
            );
            sensor
        }
    } else {
        sensor
    };
    if tag <= backup {
        tracing::warn!(
            stream = group.stream(),
            sensor,
            backup,
            "{} runs ahead of the producer",
            group.slot()
        );
        tag = backup + num_buffers;
    }
    tag
}

fn reset_carrier(pool: &mut CarrierPoolState, id: CarrierId, fcount: u32, capture_nodes: usize) {
    if let Some(carrier) = pool.carrier_mut(id) {
        carrier.fcount = fcount;
        carrier.canvas = Default::default();
        for config in carrier.configs.iter_mut() {
            *config = NodeGroup::with_capacity(capture_nodes);
        }
    }
}
