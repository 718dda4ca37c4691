//! Property tests for the carrier pool
//!
//! Random sequences of pool operations must never lose or duplicate a
//! carrier: every carrier is free, pending on exactly one group or held by
//! the caller.

use isp_groups::carrier::{CarrierPool, Owner};
use isp_groups::id::CarrierId;
use isp_groups::GroupHandle;
use proptest::prelude::*;

const CAPACITY: usize = 8;
const GROUPS: [GroupHandle; 3] = [GroupHandle(2), GroupHandle(3), GroupHandle(6)];

#[derive(Debug, Clone)]
enum Op {
    Claim { group: usize, fcount: u32 },
    Transfer { from: usize, to: usize },
    Release { group: usize },
    Rewind { group: usize, target: u32 },
    Flush { group: usize },
    TakeFree,
    Return { attach: Option<usize> },
}

fn op() -> impl Strategy<Value = Op> {
    let group = 0..GROUPS.len();
    prop_oneof![
        3 => (group.clone(), 1u32..20).prop_map(|(group, fcount)| Op::Claim { group, fcount }),
        2 => (group.clone(), 0..GROUPS.len()).prop_map(|(from, to)| Op::Transfer { from, to }),
        2 => group.clone().prop_map(|group| Op::Release { group }),
        2 => (group.clone(), 1u32..20).prop_map(|(group, target)| Op::Rewind { group, target }),
        1 => group.clone().prop_map(|group| Op::Flush { group }),
        1 => Just(Op::TakeFree),
        1 => proptest::option::of(group).prop_map(|attach| Op::Return { attach }),
    ]
}

proptest! {
    #[test]
    fn prop_pool_conserves_carriers(ops in proptest::collection::vec(op(), 1..64)) {
        let pool = CarrierPool::new(0, CAPACITY, 4);
        let mut held: Vec<CarrierId> = Vec::new();

        for op in ops {
            let mut state = pool.lock();
            match op {
                Op::Claim { group, fcount } => {
                    if let Some(id) = state.claim(GROUPS[group]) {
                        state.carrier_mut(id).unwrap().fcount = fcount;
                    }
                }
                Op::Transfer { from, to } => {
                    if let Some(id) = state.head(GROUPS[from]) {
                        state.transfer(id, GROUPS[from], GROUPS[to]).unwrap();
                        prop_assert_eq!(state.carrier(id).unwrap().owner(), Owner::Group(GROUPS[to]));
                    }
                }
                Op::Release { group } => {
                    if let Some(id) = state.head(GROUPS[group]) {
                        state.release(id, GROUPS[group]).unwrap();
                    }
                }
                Op::Rewind { group, target } => {
                    let before = state.in_use(GROUPS[group]);
                    match state.rewind(GROUPS[group], target) {
                        Some(id) => {
                            prop_assert_eq!(state.carrier(id).unwrap().fcount, target);
                            prop_assert_eq!(state.head(GROUPS[group]), Some(id));
                        }
                        None => {
                            // Whatever is left is newer than the target
                            if let Some(head) = state.head(GROUPS[group]) {
                                prop_assert!(state.carrier(head).unwrap().fcount > target);
                            }
                        }
                    }
                    prop_assert!(state.in_use(GROUPS[group]) <= before);
                }
                Op::Flush { group } => {
                    let pending = state.in_use(GROUPS[group]);
                    prop_assert_eq!(state.flush(GROUPS[group]), pending);
                }
                Op::TakeFree => {
                    if let Some(id) = state.take_free() {
                        held.push(id);
                    }
                }
                Op::Return { attach } => {
                    if let Some(id) = held.pop() {
                        match attach {
                            Some(group) => state.attach(id, GROUPS[group]).unwrap(),
                            None => state.give_free(id).unwrap(),
                        }
                    }
                }
            }

            prop_assert_eq!(state.detached(), held.len());
            prop_assert_eq!(
                state.free_count() + state.in_use_total() + held.len(),
                CAPACITY
            );
        }

        let mut state = pool.lock();
        for id in held.drain(..) {
            state.give_free(id).unwrap();
        }
        for group in GROUPS {
            state.flush(group);
        }
        prop_assert!(state.is_conserved());
        prop_assert_eq!(state.free_count(), CAPACITY);
    }

    #[test]
    fn prop_rewind_never_drops_newer_carriers(
        tags in proptest::collection::btree_set(1u32..50, 1..8),
        target in 1u32..50,
    ) {
        let pool = CarrierPool::new(0, CAPACITY, 4);
        let group = GROUPS[0];
        let mut state = pool.lock();
        for &fcount in &tags {
            let id = state.claim(group).unwrap();
            state.carrier_mut(id).unwrap().fcount = fcount;
        }

        let found = state.rewind(group, target);
        let newer = tags.iter().filter(|&&t| t > target).count();
        let exact = tags.contains(&target);
        prop_assert_eq!(found.is_some(), exact);
        prop_assert_eq!(state.in_use(group), newer + usize::from(exact));
        prop_assert!(state.is_conserved());
    }
}
