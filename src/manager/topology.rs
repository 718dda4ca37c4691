//! Stream topology
//!
//! Groups are wired into a chain per stream:
//!
//! - `prev`/`next` follow slot order across every active group
//! - `gprev`/`gnext` hop over a DMA junction (memory or pipe hand-off)
//! - `parent`/`child` nest on-the-fly groups under the group that feeds them
//! - `vprev`/`vnext` mark a virtual on-the-fly link spliced in at shot time
//! - `head`/`tail` cache the boundaries of each on-the-fly run
//!
//! All links of a stream live in one [`Topology`] behind the stream's
//! `RwLock`, so a splice is a single write-locked edit and shots read a
//! consistent copy.

use super::GroupManager;
use crate::error::{GroupError, Result};
use crate::frame::FrameQueueState;
use crate::group::{Group, GroupFlag, SubStage};
use crate::id::{GroupHandle, StreamId, VideoId};
use crate::types::{DeviceType, InputMode, Slot};
use parking_lot::MutexGuard;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Neighbour links of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Links {
    pub prev: Option<GroupHandle>,
    pub next: Option<GroupHandle>,
    pub gprev: Option<GroupHandle>,
    pub gnext: Option<GroupHandle>,
    pub parent: Option<GroupHandle>,
    pub child: Option<GroupHandle>,
    pub vprev: Option<GroupHandle>,
    pub vnext: Option<GroupHandle>,
    pub head: GroupHandle,
    pub tail: GroupHandle,
    /// Capture sub-stage feeding `next`
    pub junction: Option<VideoId>,
}

impl Links {
    /// Links of a group that is not part of any chain
    pub fn isolated(handle: GroupHandle) -> Self {
        Self {
            prev: None,
            next: None,
            gprev: None,
            gnext: None,
            parent: None,
            child: None,
            vprev: None,
            vnext: None,
            head: handle,
            tail: handle,
            junction: None,
        }
    }
}

/// All links of one stream
#[derive(Debug, Default)]
pub struct Topology {
    links: HashMap<GroupHandle, Links>,
}

impl Topology {
    /// Links of `handle`; isolated if the group was never wired
    pub fn get(&self, handle: GroupHandle) -> Links {
        self.links
            .get(&handle)
            .copied()
            .unwrap_or_else(|| Links::isolated(handle))
    }

    pub(super) fn get_mut(&mut self, handle: GroupHandle) -> &mut Links {
        self.links
            .entry(handle)
            .or_insert_with(|| Links::isolated(handle))
    }

    pub(super) fn reset(&mut self, handle: GroupHandle) {
        self.links.insert(handle, Links::isolated(handle));
    }

    /// `handle` followed by its nested on-the-fly children
    pub fn chain(&self, handle: GroupHandle) -> Vec<GroupHandle> {
        let mut chain = vec![handle];
        let mut cur = self.get(handle).child;
        while let Some(h) = cur {
            if chain.contains(&h) {
                break;
            }
            chain.push(h);
            cur = self.get(h).child;
        }
        chain
    }

    fn set_head_from(&mut self, first: Option<GroupHandle>, head: GroupHandle) {
        let mut cur = first;
        let mut seen = Vec::new();
        while let Some(h) = cur {
            if seen.contains(&h) {
                break;
            }
            seen.push(h);
            let links = self.get_mut(h);
            links.head = head;
            cur = links.child;
        }
    }
}

/// Direction of a virtual on-the-fly splice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceDirection {
    /// Insert the group between its `vprev` and that group's successors
    Start,
    /// Restore the chain without the group
    End,
}

/// Frame queues of a chain, locked leader first then children depth-first
pub struct ChainLock<'a> {
    leader: Option<(&'a SubStage, MutexGuard<'a, FrameQueueState>)>,
    subs: Vec<(&'a SubStage, MutexGuard<'a, FrameQueueState>)>,
}

impl<'a> ChainLock<'a> {
    /// The leader frame queue, if it was locked
    pub fn leader(&mut self) -> Option<&mut FrameQueueState> {
        self.leader.as_mut().map(|(_, q)| &mut **q)
    }

    pub fn leader_stage(&self) -> Option<&SubStage> {
        self.leader.as_ref().map(|(s, _)| *s)
    }

    /// Every locked capture sub-stage with its queue
    pub fn subs(&mut self) -> Vec<(&SubStage, &mut FrameQueueState)> {
        self.subs.iter_mut().map(|(s, q)| (*s, &mut **q)).collect()
    }

    /// Video ids of the capture sub-stages whose queues were taken
    pub fn locked_vids(&self) -> Vec<VideoId> {
        self.subs.iter().map(|(s, _)| s.vid()).collect()
    }
}

impl GroupManager {
    /// Wire the active groups of `stream` into a chain
    pub fn build(&self, stream: StreamId) -> Result<()> {
        let ctx = self.stream_ctx(stream)?;
        let leader = ctx.leader.lock().ok_or_else(|| {
            GroupError::Topology(format!("stream {} has no leader group", stream))
        })?;
        let groups = self.stream_groups(stream);
        let leader_slot = self.group(leader)?.slot();

        let mut topo = ctx.topology.write();
        for group in &groups {
            topo.reset(group.handle());
        }

        // prev/next in slot order
        let mut active: Vec<Arc<Group>> = Vec::new();
        for group in &groups {
            if group.slot() < leader_slot || !group.flags.test(GroupFlag::Init) {
                continue;
            }
            if group.handle() != leader && !group.source_vid().is_some() {
                continue;
            }
            if let Some(prev) = active.last() {
                topo.get_mut(prev.handle()).next = Some(group.handle());
                topo.get_mut(group.handle()).prev = Some(prev.handle());
            }
            active.push(group.clone());
        }

        let Some(first) = active.first() else {
            return Err(GroupError::Topology(format!(
                "leader of stream {} is not initialized",
                stream
            )));
        };

        // junctions and output flags
        let mut dmsg = format!("{}{}", first.slot(), first.id().0);
        for pair in active.windows(2) {
            let (group, next) = (&pair[0], &pair[1]);
            let mode = next.input_mode().unwrap_or(InputMode::Memory);
            let junction = group
                .subdevs()
                .into_iter()
                .find(|s| s.vid() == next.source_vid());
            if junction.is_none() && mode != InputMode::Otf {
                return Err(GroupError::Topology(format!(
                    "junction subdev can not be found between {} and {}",
                    group.slot(),
                    next.slot()
                )));
            }
            topo.get_mut(group.handle()).junction = junction.map(|s| s.vid());
            for flag in [
                GroupFlag::OtfOutput,
                GroupFlag::PipeOutput,
                GroupFlag::SemiPipeOutput,
                GroupFlag::VotfOutput,
            ] {
                group.flags.clear(flag);
            }
            match mode {
                InputMode::Otf => group.flags.set(GroupFlag::OtfOutput),
                InputMode::Pipe => group.flags.set(GroupFlag::PipeOutput),
                InputMode::SemiPipe => group.flags.set(GroupFlag::SemiPipeOutput),
                InputMode::VirtualOtf => group.flags.set(GroupFlag::VotfOutput),
                InputMode::Memory => {}
            }
            dmsg.push_str(&format!(" {} {}{}", mode.symbol(), next.slot(), next.id().0));
        }

        // child/parent, gprev/gnext, vprev/vnext
        let mut sibling = leader;
        for pair in active.windows(2) {
            let (group, next) = (pair[0].handle(), pair[1].handle());
            match pair[1].input_mode().unwrap_or(InputMode::Memory) {
                InputMode::Otf => {
                    match topo.get(group).vprev {
                        Some(vprev) => {
                            topo.get_mut(vprev).child = Some(next);
                            topo.get_mut(next).parent = Some(vprev);
                        }
                        None => {
                            topo.get_mut(group).child = Some(next);
                            topo.get_mut(next).parent = Some(group);
                        }
                    }
                    topo.get_mut(sibling).tail = next;
                    topo.get_mut(next).head = sibling;
                }
                InputMode::VirtualOtf => {
                    topo.get_mut(group).vnext = Some(next);
                    topo.get_mut(next).vprev = Some(group);
                }
                InputMode::Pipe | InputMode::SemiPipe | InputMode::Memory => {
                    topo.get_mut(sibling).gnext = Some(next);
                    topo.get_mut(next).gprev = Some(sibling);
                    sibling = next;
                }
            }
        }

        // on-the-fly runs share the tail of their head
        let mut sibling = leader;
        for pair in active.windows(2) {
            let next = pair[1].handle();
            if pair[1].input_mode() == Some(InputMode::Otf) {
                let tail = topo.get(sibling).tail;
                topo.get_mut(next).tail = tail;
            } else {
                sibling = next;
            }
        }

        tracing::info!(stream, "chain: {}", dmsg);
        Ok(())
    }

    /// Check a built chain before streaming
    pub fn configure(&self, stream: StreamId) -> Result<()> {
        let ctx = self.stream_ctx(stream)?;
        let leader = ctx.leader.lock().ok_or_else(|| {
            GroupError::Topology(format!("stream {} has no leader group", stream))
        })?;
        let topo = ctx.topology.read();

        let mut cur = Some(leader);
        while let Some(h) = cur {
            let group = self.group(h)?;
            let links = topo.get(h);
            if !group.is_otf_input() && !group.is_started() {
                return Err(GroupError::InvalidState(format!(
                    "{} is not started",
                    group.slot()
                )));
            }
            if let Some(prev) = links.prev {
                let prev_links = topo.get(prev);
                if group.input_mode() != Some(InputMode::Otf) {
                    let prev_group = self.group(prev)?;
                    let junction = prev_links
                        .junction
                        .and_then(|vid| prev_group.subdev(vid))
                        .ok_or_else(|| {
                            GroupError::Topology(format!(
                                "{} has no junction feeding {}",
                                prev_group.slot(),
                                group.slot()
                            ))
                        })?;
                    let leader_size = group.leader().size();
                    if junction.size() != leader_size {
                        return Err(GroupError::InvalidState(format!(
                            "junction {} output {} differs from {} input {}",
                            junction.name(),
                            junction.size(),
                            group.slot(),
                            leader_size
                        )));
                    }
                }
            }
            cur = links.next;
        }
        Ok(())
    }

    /// Splice `handle` into or out of its virtual predecessor's chain
    pub fn splice_virtual(&self, handle: GroupHandle, direction: SpliceDirection) -> Result<()> {
        let group = self.group(handle)?;
        let ctx = self.stream_ctx(group.stream())?;
        let mut topo = ctx.topology.write();
        let links = topo.get(handle);
        let vprev = links.vprev.ok_or_else(|| {
            GroupError::Topology(format!("{} has no virtual predecessor", group.slot()))
        })?;

        match direction {
            SpliceDirection::Start => {
                let vlinks = topo.get(vprev);
                if vlinks.gnext == Some(handle) {
                    return Ok(());
                }
                let sibling = vlinks.gnext;
                let vchild = vlinks.child;

                let g = topo.get_mut(handle);
                g.gnext = vlinks.gnext;
                g.gprev = Some(vlinks.head);

                if let Some(vchild) = vchild {
                    let vchild_tail = topo.get(vchild).tail;
                    let g = topo.get_mut(handle);
                    g.child = Some(vchild);
                    g.tail = vchild_tail;
                    topo.get_mut(vchild).parent = Some(handle);
                    topo.set_head_from(Some(vchild), handle);
                }

                let v = topo.get_mut(vprev);
                v.child = None;
                v.tail = vprev;
                v.gnext = Some(handle);

                if let Some(sibling) = sibling {
                    topo.get_mut(sibling).gprev = Some(handle);
                }
                group.flags.set(GroupFlag::VotfInput);
            }
            SpliceDirection::End => {
                if topo.get(vprev).gnext != Some(handle) {
                    return Ok(());
                }
                let sibling = links.gnext;
                let vchild = links.child;

                if let Some(sibling) = sibling {
                    topo.get_mut(sibling).gprev = Some(vprev);
                }
                topo.get_mut(vprev).gnext = links.gnext;

                if let Some(vchild) = vchild {
                    let vchild_tail = topo.get(vchild).tail;
                    let vhead = topo.get(vprev).head;
                    let v = topo.get_mut(vprev);
                    v.child = Some(vchild);
                    v.tail = vchild_tail;
                    topo.get_mut(vchild).parent = Some(vprev);
                    topo.set_head_from(Some(vchild), vhead);
                }

                let g = topo.get_mut(handle);
                g.child = None;
                g.tail = handle;
                g.gnext = None;
                g.gprev = None;
                group.flags.clear(GroupFlag::VotfInput);
            }
        }
        tracing::debug!(stream = group.stream(), ?direction, "{} virtual path changed", group.slot());
        Ok(())
    }

    /// Run `f` with the frame queues of `handle`'s chain locked.
    ///
    /// The group's leader queue is taken first (when `include_leader`), then the
    /// started capture sub-stages of the group and its children in depth
    /// order. The walk stops at the first group outside `scope`. Every lock is
    /// released when `f` returns.
    pub fn lock_chain<R>(
        &self,
        handle: GroupHandle,
        scope: DeviceType,
        include_leader: bool,
        f: impl FnOnce(&mut ChainLock<'_>) -> R,
    ) -> Result<R> {
        let group = self.group(handle)?;
        let ctx = self.stream_ctx(group.stream())?;
        let chain = ctx.topology.read().chain(handle);

        let leader_stage = if include_leader {
            Some(group.leader())
        } else {
            None
        };
        let mut subs: Vec<Arc<SubStage>> = Vec::new();
        for h in chain {
            let g = self.group(h)?;
            if !scope.matches(g.slot().device_type()) {
                break;
            }
            subs.extend(g.subdevs().into_iter().filter(|s| s.is_started()));
        }

        let mut lock = ChainLock {
            leader: leader_stage.as_deref().map(|s| (s, s.queue().lock())),
            subs: subs.iter().map(|s| (&**s, s.queue().lock())).collect(),
        };
        Ok(f(&mut lock))
    }

    /// `handle` and its nested children
    pub(crate) fn chain_of(&self, handle: GroupHandle) -> Result<Vec<Arc<Group>>> {
        let group = self.group(handle)?;
        let ctx = self.stream_ctx(group.stream())?;
        let chain = ctx.topology.read().chain(handle);
        chain.into_iter().map(|h| self.group(h)).collect()
    }

    /// Capture sub-stages of `handle`'s chain
    pub(crate) fn chain_subdevs(&self, handle: GroupHandle) -> Result<Vec<Arc<SubStage>>> {
        Ok(self
            .chain_of(handle)?
            .iter()
            .flat_map(|g| g.subdevs())
            .collect())
    }

    /// Junction sub-stage of the tail of `handle`'s run
    pub(crate) fn tail_junction(&self, handle: GroupHandle) -> Result<Option<Arc<SubStage>>> {
        let group = self.group(handle)?;
        let ctx = self.stream_ctx(group.stream())?;
        let (tail, junction) = {
            let topo = ctx.topology.read();
            let tail = topo.get(handle).tail;
            (tail, topo.get(tail).junction)
        };
        Ok(junction.and_then(|vid| self.shared.groups[tail.index()].subdev(vid)))
    }

    /// Slot of the stream leader
    pub fn leader_slot(&self, stream: StreamId) -> Result<Option<Slot>> {
        let ctx = self.stream_ctx(stream)?;
        let leader = *ctx.leader.lock();
        Ok(leader.map(|h| self.shared.groups[h.index()].slot()))
    }
}
