#![allow(dead_code)]

use lightsweep::device::Sensor;
use lightsweep::math;
use lightsweep::ootx::LighthouseCalibration;
use lightsweep::protocol::{self, SyncCode, SWEEP_PERIOD_TICKS};
use lightsweep::{
    AngleMeasurement, Event, LightHit, LighthouseId, ObjectId, Pose, RigidBody, SweepAxis, SyncPulse,
};
use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};
use std::collections::BTreeMap;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Eight-sensor cube of half-width 0.1 m.
pub fn cube_body(name: &str) -> RigidBody {
    let mut sensors = Vec::new();
    for x in [-0.1, 0.1] {
        for y in [-0.1, 0.1] {
            for z in [-0.1, 0.1] {
                let n = Vector3::new(x, y, z).normalize();
                sensors.push(Sensor {
                    position: [x, y, z],
                    normal: [n.x, n.y, n.z],
                });
            }
        }
    }
    RigidBody::new(name, "Tracker", sensors).unwrap()
}

/// Two lighthouses about two meters out, both looking along -Z at the origin.
pub fn lighthouses() -> BTreeMap<LighthouseId, Pose> {
    let mut out = BTreeMap::new();
    for (id, eye) in [(0u8, Vector3::new(1.5, 0.3, 1.4)), (1u8, Vector3::new(-1.2, -0.4, 1.6))] {
        let iso = Isometry3::face_towards(&eye.into(), &Point3::origin(), &Vector3::z());
        let flip = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::PI);
        let iso = Isometry3::from_parts(iso.translation, iso.rotation * flip);
        out.insert(id, Pose::from_isometry(&iso));
    }
    out
}

pub fn truth() -> Pose {
    Pose::new([0.05, -0.02, 0.1], [0.96, 0.1, -0.15, 0.2])
}

pub fn synthesize(body: &RigidBody, pose: &Pose, lighthouses: &BTreeMap<LighthouseId, Pose>) -> Vec<AngleMeasurement> {
    let mut out = Vec::new();
    for (lh, lh_pose) in lighthouses {
        for (i, s) in body.sensors.iter().enumerate() {
            let world = pose.to_isometry() * Point3::from(s.position);
            let local = lh_pose.to_isometry().inverse() * world;
            for axis in [SweepAxis::Horizontal, SweepAxis::Vertical] {
                if let Some(angle) = math::predict_angle(axis, &local.coords) {
                    out.push(AngleMeasurement {
                        object: body.id,
                        sensor: i as u8,
                        axis,
                        timecode: 0,
                        pulse_length_s: 0.0,
                        angle,
                        lighthouse: *lh,
                    });
                }
            }
        }
    }
    out
}

pub fn sample_calibration(id: u32) -> LighthouseCalibration {
    LighthouseCalibration {
        fw_version: 0x0246,
        id,
        phase: [0.0, 0.0],
        tilt: [0.0, 0.0],
        sys_unlock_count: 1,
        hw_version: 9,
        curve: [0.0, 0.0],
        accel_dir: [0, 0, 127],
        gib_phase: [0.0, 0.0],
        gib_mag: [0.0, 0.0],
        mode_current: 0,
        sys_faults: 0,
    }
}

/// Generates sweep cycles: every lighthouse sweeps H then V, each sync
/// carrying the next bit of that lighthouse's OOTX stream.
pub struct SweepGenerator {
    pub object: ObjectId,
    pub timecode: u64,
    ootx: BTreeMap<LighthouseId, (Vec<bool>, usize)>,
}

impl SweepGenerator {
    pub fn new(object: ObjectId, start: u64) -> Self {
        Self {
            object,
            timecode: start,
            ootx: BTreeMap::new(),
        }
    }

    /// Repeat `bits` on the sync pulses of `lighthouse`.
    pub fn with_ootx(mut self, lighthouse: LighthouseId, bits: Vec<bool>) -> Self {
        self.ootx.insert(lighthouse, (bits, 0));
        self
    }

    fn next_bit(&mut self, lighthouse: LighthouseId) -> bool {
        match self.ootx.get_mut(&lighthouse) {
            Some((bits, i)) if !bits.is_empty() => {
                let bit = bits[*i % bits.len()];
                *i += 1;
                bit
            }
            _ => false,
        }
    }

    /// One rotor cycle for each lighthouse in `angles`.
    pub fn cycle(&mut self, angles: &[AngleMeasurement], lighthouses: &[LighthouseId]) -> Vec<Event> {
        let mut events = Vec::new();
        for &lh in lighthouses {
            for axis in [SweepAxis::Horizontal, SweepAxis::Vertical] {
                let code = SyncCode {
                    axis,
                    data: self.next_bit(lh),
                    skip: false,
                };
                let t = self.timecode;
                events.push(Event::Sync(SyncPulse {
                    object: self.object,
                    lighthouse: lh,
                    timecode: t,
                    pulse_length: code.pulse_length(),
                }));
                for a in angles.iter().filter(|a| a.lighthouse == lh && a.axis == axis) {
                    let ticks = protocol::angle_to_ticks(a.angle);
                    events.push(Event::Light(LightHit {
                        object: a.object,
                        sensor: a.sensor,
                        axis,
                        time_in_sweep: ticks,
                        timecode: t + ticks as u64,
                        pulse_length: 100,
                        lighthouse: lh,
                    }));
                }
                self.timecode += SWEEP_PERIOD_TICKS;
            }
        }
        events
    }
}
