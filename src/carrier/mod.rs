//! Frame carrier pool
//!
//! A carrier holds the per-frame-count configuration (crop regions and capture
//! requests for every slot) that travels stage by stage alongside a frame.
//! Each stream owns a fixed arena of carriers. Every carrier is owned by
//! exactly one of:
//!
//! - the stream's free list
//! - one group's pending list
//! - the caller, between [`CarrierPoolState::take_free`] and the matching
//!   [`CarrierPoolState::give_free`] / [`CarrierPoolState::attach`]
//!
//! All transitions happen under the pool's single short lock and never block.

use crate::error::{GroupError, Result};
use crate::id::{CarrierId, GroupHandle, StreamId};
use crate::types::{Crop, NodeGroup, Slot};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};

/// Current holder of a carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Free,
    Detached,
    Group(GroupHandle),
}

/// Per-frame-count configuration exchanged between adjacent stages
#[derive(Debug, Clone)]
pub struct Carrier {
    pub id: CarrierId,
    /// Frame tag
    pub fcount: u32,
    /// Configuration block per slot
    pub configs: Vec<NodeGroup>,
    /// Output crop of the last stage that handed this carrier on
    pub canvas: Crop,
    owner: Owner,
}

impl Carrier {
    fn new(id: CarrierId, capture_nodes: usize) -> Self {
        Self {
            id,
            fcount: 0,
            configs: vec![NodeGroup::with_capacity(capture_nodes); Slot::COUNT],
            canvas: Crop::default(),
            owner: Owner::Free,
        }
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn config(&self, slot: Slot) -> &NodeGroup {
        &self.configs[slot.index()]
    }

    pub fn config_mut(&mut self, slot: Slot) -> &mut NodeGroup {
        &mut self.configs[slot.index()]
    }
}

/// Lock-protected contents of a carrier pool
#[derive(Debug)]
pub struct CarrierPoolState {
    stream: StreamId,
    capture_nodes: usize,
    carriers: Vec<Carrier>,
    free: VecDeque<CarrierId>,
    groups: HashMap<GroupHandle, VecDeque<CarrierId>>,
}

impl CarrierPoolState {
    fn new(stream: StreamId, capacity: usize, capture_nodes: usize) -> Self {
        let carriers: Vec<Carrier> = (0..capacity)
            .map(|i| Carrier::new(CarrierId(i as u32), capture_nodes))
            .collect();
        let free = carriers.iter().map(|c| c.id).collect();
        Self {
            stream,
            capture_nodes,
            carriers,
            free,
            groups: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.carriers.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Carriers pending on `group`
    pub fn in_use(&self, group: GroupHandle) -> usize {
        self.groups.get(&group).map(VecDeque::len).unwrap_or(0)
    }

    /// Carriers pending on any group
    pub fn in_use_total(&self) -> usize {
        self.groups.values().map(VecDeque::len).sum()
    }

    /// Carriers currently held outside the pool's lists
    pub fn detached(&self) -> usize {
        self.carriers
            .iter()
            .filter(|c| c.owner == Owner::Detached)
            .count()
    }

    /// `free + Σ in-use == capacity`
    pub fn is_conserved(&self) -> bool {
        self.free_count() + self.in_use_total() == self.capacity()
    }

    pub fn carrier(&self, id: CarrierId) -> Option<&Carrier> {
        self.carriers.get(id.index())
    }

    pub fn carrier_mut(&mut self, id: CarrierId) -> Option<&mut Carrier> {
        self.carriers.get_mut(id.index())
    }

    /// Oldest carrier pending on `group`
    pub fn head(&self, group: GroupHandle) -> Option<CarrierId> {
        self.groups.get(&group).and_then(|l| l.front().copied())
    }

    /// Pop the head of the free list. The caller now owns the carrier.
    pub fn take_free(&mut self) -> Option<CarrierId> {
        let id = self.free.pop_front()?;
        self.carriers[id.index()].owner = Owner::Detached;
        Some(id)
    }

    /// Return a detached carrier to the tail of the free list
    pub fn give_free(&mut self, id: CarrierId) -> Result<()> {
        self.expect_owner(id, Owner::Detached)?;
        self.carriers[id.index()].owner = Owner::Free;
        self.free.push_back(id);
        Ok(())
    }

    /// Append a detached carrier to `group`'s pending list
    pub fn attach(&mut self, id: CarrierId, group: GroupHandle) -> Result<()> {
        self.expect_owner(id, Owner::Detached)?;
        self.carriers[id.index()].owner = Owner::Group(group);
        self.groups.entry(group).or_default().push_back(id);
        Ok(())
    }

    /// Take a free carrier straight onto `group`'s pending list
    pub fn claim(&mut self, group: GroupHandle) -> Option<CarrierId> {
        let id = self.take_free()?;
        self.carriers[id.index()].owner = Owner::Group(group);
        self.groups.entry(group).or_default().push_back(id);
        Some(id)
    }

    /// Hand a carrier from one group to another
    pub fn transfer(&mut self, id: CarrierId, from: GroupHandle, to: GroupHandle) -> Result<()> {
        self.detach_from(id, from)?;
        self.carriers[id.index()].owner = Owner::Group(to);
        self.groups.entry(to).or_default().push_back(id);
        Ok(())
    }

    /// Retire a carrier from `group` back to the free list
    pub fn release(&mut self, id: CarrierId, group: GroupHandle) -> Result<()> {
        self.detach_from(id, group)?;
        self.carriers[id.index()].owner = Owner::Free;
        self.free.push_back(id);
        Ok(())
    }

    /// Look up a carrier pending on `group` by tag without removing it
    pub fn find(&self, group: GroupHandle, fcount: u32) -> Option<CarrierId> {
        self.groups.get(&group).and_then(|l| {
            l.iter()
                .copied()
                .find(|id| self.carriers[id.index()].fcount == fcount)
        })
    }

    /// Drop carriers older than `target` from `group` until the target is found.
    ///
    /// Returns the carrier tagged `target`, or `None` when the walk hits a
    /// newer tag first or empties the list. Carriers newer than the target are
    /// never released.
    pub fn rewind(&mut self, group: GroupHandle, target: u32) -> Option<CarrierId> {
        loop {
            let id = self.head(group)?;
            let fcount = self.carriers[id.index()].fcount;
            if fcount == target {
                return Some(id);
            }
            if fcount > target {
                tracing::warn!(
                    stream = self.stream,
                    %group,
                    "target fcount {} is older than pending carrier {}",
                    target,
                    fcount
                );
                return None;
            }
            tracing::warn!(
                stream = self.stream,
                %group,
                "carrier {} is cancelled (target {})",
                fcount,
                target
            );
            // Head was just read from this group's list
            let _ = self.release(id, group);
        }
    }

    /// Return every carrier pending on `group` to the free list
    pub fn flush(&mut self, group: GroupHandle) -> usize {
        let Some(list) = self.groups.remove(&group) else {
            return 0;
        };
        let flushed = list.len();
        for id in list {
            self.carriers[id.index()].owner = Owner::Free;
            self.free.push_back(id);
        }
        flushed
    }

    /// Rebuild the arena with every carrier free
    pub fn reset(&mut self) {
        *self = Self::new(self.stream, self.carriers.len(), self.capture_nodes);
    }

    fn expect_owner(&self, id: CarrierId, owner: Owner) -> Result<()> {
        let carrier = self.carriers.get(id.index()).ok_or_else(|| {
            GroupError::InvalidArgument(format!("carrier {:?} out of range", id))
        })?;
        if carrier.owner != owner {
            return Err(GroupError::InvalidState(format!(
                "carrier {:?} is owned by {:?}, expected {:?}",
                id, carrier.owner, owner
            )));
        }
        Ok(())
    }

    fn detach_from(&mut self, id: CarrierId, group: GroupHandle) -> Result<()> {
        self.expect_owner(id, Owner::Group(group))?;
        let list = self.groups.get_mut(&group).ok_or_else(|| {
            GroupError::InvalidState(format!("group {} has no pending carriers", group))
        })?;
        let pos = list.iter().position(|&c| c == id).ok_or_else(|| {
            GroupError::InvalidState(format!("carrier {:?} missing from {}", id, group))
        })?;
        list.remove(pos);
        if list.is_empty() {
            self.groups.remove(&group);
        }
        self.carriers[id.index()].owner = Owner::Detached;
        Ok(())
    }
}

/// Shared carrier pool of one stream
#[derive(Debug)]
pub struct CarrierPool {
    inner: Mutex<CarrierPoolState>,
}

impl CarrierPool {
    pub fn new(stream: StreamId, capacity: usize, capture_nodes: usize) -> Self {
        Self {
            inner: Mutex::new(CarrierPoolState::new(stream, capacity, capture_nodes)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CarrierPoolState> {
        self.inner.lock()
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_count()
    }

    pub fn is_conserved(&self) -> bool {
        self.inner.lock().is_conserved()
    }
}
