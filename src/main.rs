//! Group scheduler demo
//!
//! Runs a simulated three-stage on-the-fly chain (3AA -> ISP -> MCS) on one
//! stream, pushes a few frames through it and prints the stream status.
//!
//! Set `ISP_GROUPS_LOG_DIR` to also write logs to a daily rolling file.

use anyhow::Context;
use isp_groups::{
    hw::{sim::DoneRecorder, SimCompleter, SimHardware, SimSensor},
    FrameRequest, FrameResult, GroupId, GroupManager, GroupOpenParams, InputMode,
    SchedulerConfig, Size, Slot, VideoId,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const STREAM: usize = 0;
const FRAMES: usize = 8;

fn main() -> anyhow::Result<()> {
    let _guard = init_logging();

    tracing::info!("Starting group scheduler demo");

    let config = SchedulerConfig::load_or_default();
    let sensor = Arc::new(SimSensor::new().streaming());
    let (hw, completions) = SimHardware::with_completion();
    let hw = Arc::new(hw);
    let sink = Arc::new(DoneRecorder::default());

    let manager = GroupManager::probe(config, hw.clone(), sink.clone())
        .context("failed to probe the group manager")?;
    manager.set_sensor(STREAM, sensor.clone())?;
    let completer = SimCompleter::spawn(manager.clone(), completions, Some(sensor));

    let full = Size::new(4032, 3024);
    let stages = [
        (Slot::ThreeAa, GroupId(1), VideoId(10), VideoId(1), true),
        (Slot::Isp, GroupId(4), VideoId(30), VideoId(11), false),
        (Slot::Mcs, GroupId(8), VideoId(60), VideoId(31), false),
    ];
    let mut handles = Vec::new();
    for (slot, id, leader, source, stream_leader) in stages {
        let params = GroupOpenParams::new(id, leader, full).frames(FRAMES);
        let handle = manager
            .open(STREAM, slot, params)
            .with_context(|| format!("failed to open {}", slot))?;
        manager.attach_substage(handle, VideoId(leader.0 + 1), format!("{}C", slot), full, FRAMES)?;
        manager.init(handle, InputMode::Otf, source, stream_leader)?;
        handles.push(handle);
    }
    manager.build(STREAM).context("failed to build the chain")?;
    for &handle in handles.iter().rev() {
        manager.start(handle)?;
    }
    manager.configure(STREAM)?;

    let head = handles[0];
    for index in 0..FRAMES {
        manager.buffer_queue(head, index, FrameRequest::default())?;
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while sink.completions().len() < FRAMES && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    tracing::info!(
        done = sink.count(FrameResult::Done),
        error = sink.count(FrameResult::Error),
        fcounts = ?hw.fcounts(GroupId(1)),
        "frames completed"
    );

    println!("{}", manager.status_json(STREAM)?);

    for &handle in &handles {
        let report = manager.stop(handle)?;
        if !report.is_clean() {
            tracing::warn!(code = report.code(), "stop reported anomalies");
        }
    }
    completer.stop();
    for &handle in &handles {
        manager.close(handle)?;
    }

    tracing::info!("Shutting down...");
    Ok(())
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,isp_groups=debug"));

    match std::env::var_os("ISP_GROUPS_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "isp-groups.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}
