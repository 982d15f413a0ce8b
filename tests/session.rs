mod common;

use common::SweepGenerator;
use lightsweep::config::CalibrationStore;
use lightsweep::ootx;
use lightsweep::queue::QueueConfig;
use lightsweep::{
    CalibrationStatus, ChannelReporter, Diagnostic, LighthouseStatus, Pose, ReportEvent, ReportFilter, Toggle,
    TrackerConfig, TrackerError, TrackerSession,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lightsweep-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn wait_until(session: &TrackerSession, timeout: Duration, done: impl Fn(&TrackerSession) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(session) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done(session)
}

#[test]
fn calibrates_from_scratch_and_saves_lighthouses() {
    common::init_logging();
    let dir = scratch("calibrate");
    let config_file = dir.join("config.json");
    let config = TrackerConfig {
        config_file: Some(config_file.clone()),
        use_imu: Toggle::No,
        ..TrackerConfig::default()
    };

    let (reporter, stream) = ChannelReporter::new(50_000);
    let body = common::cube_body("TR0");
    let mut session = TrackerSession::builder(config)
        .reporter(
            Box::new(reporter),
            ReportFilter::POSE | ReportFilter::LIGHTHOUSE | ReportFilter::INFO,
        )
        .body(body.clone())
        .queue(QueueConfig {
            light_capacity: 32_768,
            ..QueueConfig::default()
        })
        .grace_period(Duration::from_secs(5))
        .build()
        .unwrap();
    let sink = session.start().unwrap();

    // The watchman sits at the origin, so its frame is the world frame.
    let lighthouses = common::lighthouses();
    let angles = common::synthesize(&body, &Pose::IDENTITY, &lighthouses);
    let mut generator = SweepGenerator::new(body.id, 1_000);
    for lh in [0u8, 1] {
        let payload = common::sample_calibration(0x1000 + u32::from(lh)).to_payload();
        generator = generator.with_ootx(lh, ootx::encode_frame(&payload));
    }
    let mut pushed = 0u64;
    for _ in 0..500 {
        for event in generator.cycle(&angles, &[0, 1]) {
            sink.push(event).unwrap();
            pushed += 1;
        }
    }

    let processed = wait_until(&session, Duration::from_secs(60), |s| s.snapshot().stats.events >= pushed);
    assert!(processed, "worker did not catch up");
    assert_eq!(session.calibration_status(), CalibrationStatus::Complete);

    let solved = session.lighthouses();
    for (lh, truth) in &lighthouses {
        let info = &solved[lh];
        assert_eq!(info.status, LighthouseStatus::Posed);
        assert_eq!(info.calibration.map(|c| c.id), Some(0x1000 + u32::from(*lh)));
        let (dp, dr) = info.pose.unwrap().distance_to(truth);
        assert!(dp < 1e-3 && dr < 1e-3, "lighthouse {} off by {} m, {} rad", lh, dp, dr);
    }

    session.shutdown();

    let statuses: Vec<CalibrationStatus> = stream
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ReportEvent::Calibration { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.first(), Some(&CalibrationStatus::CollectingOotx));
    assert_eq!(statuses.last(), Some(&CalibrationStatus::Complete));
    for pair in statuses.windows(2) {
        assert_eq!(pair[0].next(), Some(pair[1]));
    }

    let store = CalibrationStore::load(&config_file).unwrap();
    assert!(store.covers(2, None));
    let (dp, _) = store.lighthouses[&0].pose.distance_to(&lighthouses[&0]);
    assert!(dp < 1e-3);
    assert!(store.lighthouses[&1].calibration.is_some());
}

#[test]
fn tracks_with_saved_calibration_and_reports_poses() {
    common::init_logging();
    let dir = scratch("tracking");
    let config_file = dir.join("config.json");
    let store = CalibrationStore {
        lighthouses: common::lighthouses()
            .into_iter()
            .map(|(id, pose)| {
                (
                    id,
                    lightsweep::config::StoredLighthouse {
                        pose,
                        calibration: None,
                    },
                )
            })
            .collect(),
    };
    store.save(&config_file).unwrap();

    let config = TrackerConfig {
        config_file: Some(config_file.clone()),
        use_imu: Toggle::No,
        ..TrackerConfig::default()
    };
    let (reporter, stream) = ChannelReporter::new(100_000);
    let body = common::cube_body("TR0");
    let mut session = TrackerSession::builder(config)
        .reporter(Box::new(reporter), ReportFilter::POSE)
        .body(body.clone())
        .build()
        .unwrap();
    let sink = session.start().unwrap();
    assert_eq!(session.lighthouses().len(), 2);
    assert_eq!(session.calibration_status(), CalibrationStatus::NotCalibrating);

    let truth = common::truth();
    let angles = common::synthesize(&body, &truth, &common::lighthouses());
    let mut generator = SweepGenerator::new(body.id, 1_000);
    for _ in 0..10 {
        for event in generator.cycle(&angles, &[0, 1]) {
            sink.push(event).unwrap();
        }
    }
    session.shutdown();

    let poses: Vec<_> = stream
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ReportEvent::Pose { object, pose } => Some((object, pose)),
            _ => None,
        })
        .collect();
    assert!(!poses.is_empty());
    for pair in poses.windows(2) {
        assert!(pair[0].1.timecode <= pair[1].1.timecode, "poses out of order");
    }
    let (object, last) = poses.last().unwrap();
    assert_eq!(object, "TR0");
    let (dp, dr) = last.pose.distance_to(&truth);
    assert!(dp < 1e-3 && dr < 1e-3, "pose off by {} m, {} rad", dp, dr);

    let state = session.body("TR0").unwrap();
    assert_eq!(state.pose.map(|p| p.timecode), Some(last.timecode));
    // Calibration never ran, so the file is left alone.
    assert_eq!(CalibrationStore::load(&config_file).unwrap(), store);
}

#[test]
fn bodies_on_independent_clocks_track_side_by_side() {
    common::init_logging();
    let dir = scratch("two-clocks");
    let config_file = dir.join("config.json");
    CalibrationStore {
        lighthouses: common::lighthouses()
            .into_iter()
            .map(|(id, pose)| {
                (
                    id,
                    lightsweep::config::StoredLighthouse {
                        pose,
                        calibration: None,
                    },
                )
            })
            .collect(),
    }
    .save(&config_file)
    .unwrap();

    let config = TrackerConfig {
        config_file: Some(config_file),
        use_imu: Toggle::No,
        ..TrackerConfig::default()
    };
    let (reporter, stream) = ChannelReporter::new(100_000);
    let first = common::cube_body("TR0");
    let second = common::cube_body("TR1");
    let mut session = TrackerSession::builder(config)
        .reporter(Box::new(reporter), ReportFilter::POSE | ReportFilter::ERROR)
        .body(first.clone())
        .body(second.clone())
        .build()
        .unwrap();
    let sink = session.start().unwrap();

    let lighthouses = common::lighthouses();
    let first_truth = common::truth();
    let second_truth = Pose::new([-0.15, 0.1, -0.05], [0.98, -0.05, 0.1, 0.15]);
    let first_angles = common::synthesize(&first, &first_truth, &lighthouses);
    let second_angles = common::synthesize(&second, &second_truth, &lighthouses);
    // Each body counts ticks from its own power-on.
    let mut first_clock = SweepGenerator::new(first.id, 1_000);
    let mut second_clock = SweepGenerator::new(second.id, 3_000_000_000);
    for _ in 0..10 {
        for event in first_clock.cycle(&first_angles, &[0, 1]) {
            sink.push(event).unwrap();
        }
        for event in second_clock.cycle(&second_angles, &[0, 1]) {
            sink.push(event).unwrap();
        }
    }
    session.shutdown();

    let events = stream.drain();
    let late = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ReportEvent::Message { message, .. }
                    if matches!(message.diagnostic, Some(Diagnostic::LateArrival { .. }))
            )
        })
        .count();
    assert_eq!(late, 0);

    for (name, truth) in [("TR0", &first_truth), ("TR1", &second_truth)] {
        let poses: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ReportEvent::Pose { object, pose } if object == name => Some(*pose),
                _ => None,
            })
            .collect();
        assert!(!poses.is_empty(), "no poses for {}", name);
        for pair in poses.windows(2) {
            assert!(pair[0].timecode <= pair[1].timecode, "{} poses out of order", name);
        }
        let last = poses.last().unwrap();
        let (dp, dr) = last.pose.distance_to(truth);
        assert!(dp < 1e-3 && dr < 1e-3, "{} off by {} m, {} rad", name, dp, dr);
    }
    assert!(session.body("TR1").unwrap().pose.unwrap().timecode > 3_000_000_000);
}

#[test]
fn recalibrate_restarts_from_not_calibrating() {
    let dir = scratch("recalibrate");
    let config = TrackerConfig {
        config_file: Some(dir.join("config.json")),
        disable_calibrate: Toggle::Yes,
        ..TrackerConfig::default()
    };
    let (reporter, stream) = ChannelReporter::new(1024);
    let mut session = TrackerSession::builder(config)
        .reporter(Box::new(reporter), ReportFilter::LIGHTHOUSE)
        .build()
        .unwrap();
    assert!(matches!(session.recalibrate(), Err(TrackerError::NotRunning)));
    session.start().unwrap();
    assert_eq!(session.calibration_status(), CalibrationStatus::NotCalibrating);

    session.recalibrate().unwrap();
    let started = wait_until(&session, Duration::from_secs(5), |s| {
        s.calibration_status() == CalibrationStatus::CollectingOotx
    });
    assert!(started);
    session.shutdown();
    assert!(stream.drain().iter().any(|e| matches!(
        e,
        ReportEvent::Calibration {
            status: CalibrationStatus::CollectingOotx,
            ..
        }
    )));
}

#[test]
fn sessions_run_side_by_side() {
    let mut a = TrackerSession::builder(TrackerConfig::default()).build().unwrap();
    let mut b = TrackerSession::builder(TrackerConfig::default()).build().unwrap();
    let sink_a = a.start().unwrap();
    b.start().unwrap();
    sink_a
        .push(lightsweep::Event::Status {
            object: lightsweep::ObjectId::from_name("WM0").unwrap(),
            charge: 50,
            charging: false,
        })
        .unwrap();
    a.shutdown();
    assert!(b.is_running());
    assert_eq!(a.snapshot().stats.events, 1);
    assert_eq!(b.snapshot().stats.events, 0);
    b.shutdown();
}
