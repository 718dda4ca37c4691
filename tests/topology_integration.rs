//! Integration tests for chain topology
//!
//! These tests validate how `build` wires groups, how `configure` checks a
//! built chain, virtual path splicing and the chain-wide frame lock.

mod common;

use common::builders::{capture_vid, ChainBuilder, STREAM};
use common::mock_helpers::{fast_config, node_group};
use isp_groups::hw::sim::DoneRecorder;
use isp_groups::hw::SimHardware;
use isp_groups::types::DeviceType;
use isp_groups::{
    Crop, FrameRequest, FrameResult, GroupError, GroupFlag, GroupId, GroupManager,
    GroupOpenParams, InputMode, Size, Slot, SpliceDirection, VideoId,
};
use std::sync::Arc;

const INPUT: Size = Size::new(4032, 3024);
const FULL: Crop = Crop::full(INPUT);

fn manager() -> GroupManager {
    GroupManager::probe(
        fast_config(),
        Arc::new(SimHardware::new()),
        Arc::new(DoneRecorder::default()),
    )
    .unwrap()
}

#[test]
fn test_otf_chain_nests_children() {
    let harness = ChainBuilder::new()
        .stage(Slot::ThreeAa, 1, InputMode::Otf)
        .stage(Slot::Isp, 4, InputMode::Otf)
        .stage(Slot::Mcs, 8, InputMode::Otf)
        .build()
        .unwrap();
    let [taa, isp, mcs] = [harness.handles[0], harness.handles[1], harness.handles[2]];
    let links = |h| harness.manager.links(h).unwrap();

    assert_eq!(links(taa).next, Some(isp));
    assert_eq!(links(isp).prev, Some(taa));
    assert_eq!(links(taa).child, Some(isp));
    assert_eq!(links(isp).parent, Some(taa));
    assert_eq!(links(isp).child, Some(mcs));
    assert_eq!(links(mcs).parent, Some(isp));
    for h in [isp, mcs] {
        assert_eq!(links(h).head, taa);
        assert_eq!(links(h).tail, mcs);
    }
    assert_eq!(links(taa).tail, mcs);
    assert_eq!(links(taa).gnext, None);
    assert_eq!(links(taa).junction, Some(capture_vid(Slot::ThreeAa)));
    assert_eq!(links(mcs).junction, None);

    let group = harness.manager.group(taa).unwrap();
    assert!(group.flags.test(GroupFlag::OtfOutput));
    assert!(!harness.manager.group(mcs).unwrap().flags.test(GroupFlag::OtfOutput));

    harness.shutdown();
}

#[test]
fn test_memory_chain_links_over_junction() {
    let harness = ChainBuilder::new()
        .stage(Slot::ThreeAa, 1, InputMode::Memory)
        .stage(Slot::Isp, 4, InputMode::Memory)
        .build()
        .unwrap();
    let (taa, isp) = (harness.handles[0], harness.handles[1]);
    let links = |h| harness.manager.links(h).unwrap();

    assert_eq!(links(taa).gnext, Some(isp));
    assert_eq!(links(isp).gprev, Some(taa));
    assert_eq!(links(taa).child, None);
    assert_eq!(links(isp).parent, None);
    assert_eq!(links(isp).head, isp);
    assert_eq!(links(taa).tail, taa);

    harness.shutdown();
}

#[test]
fn test_mixed_chain_hands_carrier_across_otf_run() {
    let harness = ChainBuilder::new()
        .stage(Slot::ThreeAa, 1, InputMode::Otf)
        .stage(Slot::Isp, 4, InputMode::Otf)
        .stage(Slot::Mcs, 8, InputMode::Memory)
        .build()
        .unwrap();
    let [taa, isp, mcs] = [harness.handles[0], harness.handles[1], harness.handles[2]];
    let links = |h| harness.manager.links(h).unwrap();
    assert_eq!(links(taa).gnext, Some(mcs));
    assert_eq!(links(mcs).gprev, Some(taa));
    assert_eq!(links(taa).tail, isp);
    assert_eq!(links(isp).tail, isp);

    harness.start_all().unwrap();
    let junction = capture_vid(Slot::Isp);
    harness.queue_capture(1, 0).unwrap();
    harness
        .queue(0, 0, FrameRequest::new(0, node_group(FULL, &[(junction, FULL)])))
        .unwrap();
    assert!(harness.wait_completions(0, 1));
    assert_eq!(harness.hw.fcounts(GroupId(1)), vec![1]);
    assert_eq!(harness.manager.pool(STREAM).unwrap().lock().in_use(mcs), 1);

    harness
        .queue(2, 0, FrameRequest::new(1, node_group(FULL, &[])))
        .unwrap();
    assert!(harness.wait_completions(2, 1));
    assert_eq!(harness.leader_completions(2)[0].result, FrameResult::Done);
    assert!(harness.manager.pool(STREAM).unwrap().is_conserved());
    assert_eq!(harness.manager.pool(STREAM).unwrap().lock().in_use(mcs), 0);

    harness.shutdown();
}

#[test]
fn test_build_requires_junction_for_memory_input() {
    let manager = manager();
    let taa = manager
        .open(STREAM, Slot::ThreeAa, GroupOpenParams::new(GroupId(1), VideoId(30), INPUT))
        .unwrap();
    let isp = manager
        .open(STREAM, Slot::Isp, GroupOpenParams::new(GroupId(4), VideoId(40), INPUT))
        .unwrap();
    manager.attach_substage(taa, VideoId(31), "3XC", INPUT, 4).unwrap();
    manager.init(taa, InputMode::Memory, VideoId(1), true).unwrap();
    manager.init(isp, InputMode::Memory, VideoId(77), false).unwrap();

    let err = manager.build(STREAM).unwrap_err();
    assert!(matches!(err, GroupError::Topology(_)));

    // An on-the-fly successor does not need one
    manager.init(isp, InputMode::Otf, VideoId(77), false).unwrap();
    manager.build(STREAM).unwrap();
    assert_eq!(manager.links(taa).unwrap().child, Some(isp));
    assert_eq!(manager.links(taa).unwrap().junction, None);
}

#[test]
fn test_build_requires_initialized_leader() {
    let manager = manager();
    assert!(matches!(manager.build(STREAM), Err(GroupError::Topology(_))));

    let isp = manager
        .open(STREAM, Slot::Isp, GroupOpenParams::new(GroupId(4), VideoId(40), INPUT))
        .unwrap();
    manager.init(isp, InputMode::Memory, VideoId(31), true).unwrap();
    manager.build(STREAM).unwrap();
    assert_eq!(manager.links(isp).unwrap().next, None);
}

#[test]
fn test_configure_checks_started_and_sizes() {
    let harness = ChainBuilder::new()
        .stage(Slot::ThreeAa, 1, InputMode::Memory)
        .stage(Slot::Isp, 4, InputMode::Memory)
        .build()
        .unwrap();
    let (taa, isp) = (harness.handles[0], harness.handles[1]);

    harness.manager.start(taa).unwrap();
    assert!(matches!(
        harness.manager.configure(STREAM),
        Err(GroupError::InvalidState(_))
    ));

    harness.manager.start(isp).unwrap();
    harness.manager.configure(STREAM).unwrap();

    let junction = harness
        .manager
        .group(taa)
        .unwrap()
        .subdev(capture_vid(Slot::ThreeAa))
        .unwrap();
    junction.set_size(Size::new(1920, 1080));
    assert!(matches!(
        harness.manager.configure(STREAM),
        Err(GroupError::InvalidState(_))
    ));

    harness.shutdown();
}

fn virtual_chain() -> common::builders::Harness {
    ChainBuilder::new()
        .stage(Slot::Isp, 4, InputMode::Otf)
        .stage(Slot::Dcp, 6, InputMode::VirtualOtf)
        .stage(Slot::Mcs, 8, InputMode::Otf)
        .build()
        .unwrap()
}

#[test]
fn test_virtual_splice_start_and_end() {
    let harness = virtual_chain();
    let [isp, dcp, mcs] = [harness.handles[0], harness.handles[1], harness.handles[2]];
    let links = |h| harness.manager.links(h).unwrap();

    assert_eq!(links(isp).vnext, Some(dcp));
    assert_eq!(links(dcp).vprev, Some(isp));
    assert_eq!(links(isp).child, Some(mcs));
    assert_eq!(links(mcs).parent, Some(isp));

    harness.manager.splice_virtual(dcp, SpliceDirection::Start).unwrap();
    let spliced = links(dcp);
    assert_eq!(links(isp).gnext, Some(dcp));
    assert_eq!(links(isp).child, None);
    assert_eq!(links(isp).tail, isp);
    assert_eq!(spliced.gprev, Some(isp));
    assert_eq!(spliced.child, Some(mcs));
    assert_eq!(links(mcs).parent, Some(dcp));
    assert_eq!(links(mcs).head, dcp);
    let dcp_group = harness.manager.group(dcp).unwrap();
    assert!(dcp_group.flags.test(GroupFlag::VotfInput));

    // Splicing twice changes nothing
    harness.manager.splice_virtual(dcp, SpliceDirection::Start).unwrap();
    assert_eq!(links(dcp), spliced);

    harness.manager.splice_virtual(dcp, SpliceDirection::End).unwrap();
    assert_eq!(links(isp).gnext, None);
    assert_eq!(links(isp).child, Some(mcs));
    assert_eq!(links(mcs).parent, Some(isp));
    assert_eq!(links(mcs).head, isp);
    assert_eq!(links(dcp).gprev, None);
    assert_eq!(links(dcp).child, None);
    assert_eq!(links(dcp).tail, dcp);
    assert!(!dcp_group.flags.test(GroupFlag::VotfInput));

    let restored = links(dcp);
    harness.manager.splice_virtual(dcp, SpliceDirection::End).unwrap();
    assert_eq!(links(dcp), restored);

    assert!(matches!(
        harness.manager.splice_virtual(mcs, SpliceDirection::Start),
        Err(GroupError::Topology(_))
    ));

    harness.shutdown();
}

#[test]
fn test_virtual_path_shot_round_trip() {
    let harness = virtual_chain();
    harness.start_all().unwrap();
    let [isp, dcp, mcs] = [harness.handles[0], harness.handles[1], harness.handles[2]];
    let junction = capture_vid(Slot::Isp);

    // The DCP frame waits on ISP until ISP shoots with the junction requested
    harness
        .queue(1, 0, FrameRequest::new(1, node_group(FULL, &[])))
        .unwrap();
    assert!(harness.hw.submissions().is_empty());
    harness.queue_capture(0, 0).unwrap();
    harness
        .queue(0, 0, FrameRequest::new(0, node_group(FULL, &[(junction, FULL)])))
        .unwrap();

    assert!(harness.wait_completions(0, 1));
    assert!(harness.wait_completions(1, 1));
    assert_eq!(harness.hw.fcounts(GroupId(4)), vec![1]);
    assert_eq!(harness.hw.fcounts(GroupId(6)), vec![1]);
    assert_eq!(harness.leader_completions(1)[0].result, FrameResult::Done);

    let links = |h| harness.manager.links(h).unwrap();
    assert!(common::wait_for(common::test_timeout(), || links(isp).gnext.is_none()));
    assert_eq!(links(isp).child, Some(mcs));
    assert_eq!(links(dcp).gprev, None);
    let pool = harness.manager.pool(STREAM).unwrap();
    assert_eq!(pool.free_count(), harness.manager.config().carrier_pool_size);

    harness.shutdown();
}

#[test]
fn test_failed_virtual_shot_releases_parked_frame() {
    let harness = virtual_chain();
    harness.start_all().unwrap();
    let [isp, dcp, mcs] = [harness.handles[0], harness.handles[1], harness.handles[2]];
    let junction = capture_vid(Slot::Isp);

    harness
        .queue(1, 0, FrameRequest::new(1, node_group(FULL, &[])))
        .unwrap();
    harness.hw.set_fail_submit(true);
    harness.queue_capture(0, 0).unwrap();
    harness
        .queue(0, 0, FrameRequest::new(0, node_group(FULL, &[(junction, FULL)])))
        .unwrap();

    // Both frames complete with an error instead of the DCP frame hanging
    assert!(harness.wait_completions(0, 1));
    assert!(harness.wait_completions(1, 1));
    assert_eq!(harness.leader_completions(0)[0].result, FrameResult::Error);
    assert_eq!(harness.leader_completions(1)[0].result, FrameResult::Error);
    assert!(harness.hw.submissions().is_empty());

    let links = |h| harness.manager.links(h).unwrap();
    assert!(common::wait_for(common::test_timeout(), || links(isp).gnext.is_none()));
    assert_eq!(links(isp).child, Some(mcs));
    assert_eq!(links(dcp).gprev, None);

    let mcs_group = harness.manager.group(mcs).unwrap();
    let mcs_task = harness.manager.task(GroupId(8)).unwrap();
    assert_eq!(mcs_task.resource().permits(), mcs_group.quota().depth() as i64);
    let pool = harness.manager.pool(STREAM).unwrap();
    assert_eq!(pool.free_count(), harness.manager.config().carrier_pool_size);

    let report = harness.manager.stop(dcp).unwrap();
    assert!(report.is_clean(), "unexpected stop errors: {:?}", report);

    harness.shutdown();
}

#[test]
fn test_stop_cancels_parked_virtual_frames() {
    let harness = virtual_chain();
    harness.start_all().unwrap();
    let [isp, dcp] = [harness.handles[0], harness.handles[1]];

    harness
        .queue(1, 0, FrameRequest::new(1, node_group(FULL, &[])))
        .unwrap();
    let report = harness.manager.stop(isp).unwrap();
    assert!(report.is_clean(), "unexpected stop errors: {:?}", report);
    assert_eq!(report.frames_cancelled, 1);

    let completions = harness.leader_completions(1);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].result, FrameResult::Error);

    let report = harness.manager.stop(dcp).unwrap();
    assert!(report.is_clean(), "unexpected stop errors: {:?}", report);

    harness.shutdown();
}

#[test]
fn test_lock_chain_respects_scope() {
    let harness = ChainBuilder::new()
        .stage(Slot::Sensor, 0, InputMode::Otf)
        .stage(Slot::ThreeAa, 1, InputMode::Otf)
        .stage(Slot::Isp, 4, InputMode::Otf)
        .build()
        .unwrap();
    let head = harness.head();
    let vids = |scope, leader| {
        harness
            .manager
            .lock_chain(head, scope, leader, |lock| {
                (lock.leader().is_some(), lock.locked_vids())
            })
            .unwrap()
    };

    // Nothing is started yet
    assert_eq!(vids(DeviceType::All, true), (true, vec![]));

    harness.start_all().unwrap();
    let all = vec![
        capture_vid(Slot::Sensor),
        capture_vid(Slot::ThreeAa),
        capture_vid(Slot::Isp),
    ];
    assert_eq!(vids(DeviceType::All, true), (true, all));
    assert_eq!(
        vids(DeviceType::Sensor, false),
        (false, vec![capture_vid(Slot::Sensor)])
    );
    assert_eq!(vids(DeviceType::Ischain, true), (true, vec![]));

    harness.shutdown();
}
