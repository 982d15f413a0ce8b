mod common;

use common::SweepGenerator;
use lightsweep::config::{CalibrationStore, StoredLighthouse};
use lightsweep::playback::{self, Record};
use lightsweep::{
    ChannelReporter, EventStream, Recorder, ReportEvent, ReportFilter, TimedPose, Toggle, TrackerConfig,
    TrackerSession,
};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lightsweep-playback-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn save_store(path: &Path) {
    let store = CalibrationStore {
        lighthouses: common::lighthouses()
            .into_iter()
            .map(|(id, pose)| {
                (
                    id,
                    StoredLighthouse {
                        pose,
                        calibration: None,
                    },
                )
            })
            .collect(),
    };
    store.save(path).unwrap();
}

fn poses(stream: &EventStream) -> Vec<TimedPose> {
    stream
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ReportEvent::Pose { pose, .. } => Some(pose),
            _ => None,
        })
        .collect()
}

#[test]
fn replayed_log_reproduces_live_poses() {
    common::init_logging();
    let dir = scratch("replay");
    let config_file = dir.join("config.json");
    let log_file = dir.join("session.log");
    save_store(&config_file);

    let base = TrackerConfig {
        config_file: Some(config_file.clone()),
        use_imu: Toggle::No,
        ..TrackerConfig::default()
    };

    // Live session, recorded to disk.
    let (reporter, live_stream) = ChannelReporter::new(100_000);
    let recorder = Recorder::new(std::fs::File::create(&log_file).unwrap());
    let body = common::cube_body("TR0");
    let mut live = TrackerSession::builder(base.clone())
        .reporter(Box::new(reporter), ReportFilter::POSE)
        .reporter(Box::new(recorder), ReportFilter::LIGHT | ReportFilter::POSE | ReportFilter::CONFIG)
        .body(body.clone())
        .build()
        .unwrap();
    let sink = live.start().unwrap();
    let truth = common::truth();
    let angles = common::synthesize(&body, &truth, &common::lighthouses());
    let mut generator = SweepGenerator::new(body.id, 5_000);
    let mut pushed = 0;
    for _ in 0..8 {
        for event in generator.cycle(&angles, &[0, 1]) {
            sink.push(event).unwrap();
            pushed += 1;
        }
    }
    drop(live);
    let live_poses = poses(&live_stream);
    assert!(!live_poses.is_empty());

    let records = playback::read_records(BufReader::new(std::fs::File::open(&log_file).unwrap())).unwrap();
    let recorded_events = records.iter().filter(|r| matches!(r, Record::Event(_))).count();
    let recorded_poses = records.iter().filter(|r| matches!(r, Record::Pose(_))).count();
    assert_eq!(recorded_events, pushed);
    assert_eq!(recorded_poses, live_poses.len());

    // Replay as fast as possible.
    let config = TrackerConfig {
        playback_file: Some(log_file.clone()),
        playback_factor: 0.0,
        ..base
    };
    let (reporter, replay_stream) = ChannelReporter::new(100_000);
    let mut replay = TrackerSession::builder(config)
        .reporter(Box::new(reporter), ReportFilter::POSE)
        .body(body)
        .grace_period(Duration::from_secs(5))
        .build()
        .unwrap();
    replay.start().unwrap();
    replay.wait_for_captures(Duration::from_secs(30)).unwrap();
    replay.shutdown();
    assert_eq!(replay.snapshot().stats.events, pushed as u64);

    let replayed = poses(&replay_stream);
    assert_eq!(replayed.len(), live_poses.len());
    for (a, b) in live_poses.iter().zip(&replayed) {
        assert_eq!(a.timecode, b.timecode);
        let (dp, dr) = a.pose.distance_to(&b.pose);
        assert!(dp < 1e-6 && dr < 1e-6, "replay diverged at {}: {} m, {} rad", a.timecode, dp, dr);
    }
}

#[test]
fn handwritten_log_replays_through_session() {
    common::init_logging();
    let dir = scratch("handwritten");
    let log_file = dir.join("buttons.log");
    std::fs::write(
        &log_file,
        "# two button presses\n\
         B WM0 1 2 0 0 0 0\n\
         \n\
         B WM0 2 2 0 0 0 0\n",
    )
    .unwrap();
    let config = TrackerConfig {
        playback_file: Some(log_file),
        playback_factor: 0.0,
        ..TrackerConfig::default()
    };
    let (reporter, stream) = ChannelReporter::new(16);
    let mut session = TrackerSession::builder(config)
        .reporter(Box::new(reporter), ReportFilter::BUTTON)
        .build()
        .unwrap();
    session.start().unwrap();
    session.wait_for_captures(Duration::from_secs(10)).unwrap();
    session.shutdown();

    let kinds: Vec<u8> = stream
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ReportEvent::Button { object, button } if object == "WM0" => Some(button.event_type),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![1, 2]);
}

#[test]
fn malformed_log_stops_replay_without_crashing() {
    let dir = scratch("malformed");
    let log_file = dir.join("bad.log");
    std::fs::write(&log_file, "B WM0 1 2 0 0 0 0\nQ nonsense\nB WM0 2 2 0 0 0 0\n").unwrap();
    let config = TrackerConfig {
        playback_file: Some(log_file),
        playback_factor: 0.0,
        ..TrackerConfig::default()
    };
    let (reporter, stream) = ChannelReporter::new(16);
    let mut session = TrackerSession::builder(config)
        .reporter(Box::new(reporter), ReportFilter::BUTTON)
        .build()
        .unwrap();
    session.start().unwrap();
    session.wait_for_captures(Duration::from_secs(10)).unwrap();
    session.shutdown();
    let buttons = stream
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ReportEvent::Button { .. }))
        .count();
    assert_eq!(buttons, 1);
}
