//! Merging sparse solver poses with dense IMU integration.
//!
//! Each body gets a [`BodyFusion`]. Solved poses anchor the estimate; IMU
//! samples carry it forward between solves, so with an IMU attached the output
//! runs at IMU rate. Samples reaching this module are already calibrated
//! (`value * scale - bias`, accel in g, gyro in rad/s, IMU-local axes).
//!
//! Solved poses that jump farther than [`FusionConfig::max_jump`] from the
//! estimate are held back until they persist.

use crate::device::RigidBody;
use crate::math::skew;
use crate::types::{ImuPresence, ImuSample, ObjectId, Pose, TimedPose};
use nalgebra::{Isometry3, Matrix3, Matrix6, SMatrix, SVector, Translation3, UnitQuaternion, Vector3, Vector6};

const STANDARD_GRAVITY: f64 = 9.806_65;
/// Accelerometer readings this close to 1 g are taken as pointing up.
const UP_TOLERANCE: f64 = 0.1;

type Matrix9 = SMatrix<f64, 9, 9>;
type Vector9 = SVector<f64, 9>;
type Matrix6x9 = SMatrix<f64, 6, 9>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMode {
    /// Solved poses go out unchanged; IMU samples are ignored.
    PassThrough,
    /// Latest solved pose reprojected with the gyro's angular delta.
    #[default]
    Complementary,
    /// Error-state Kalman filter: IMU predicts, solved poses update.
    Kalman,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    pub mode: FusionMode,
    /// Report the IMU's pose instead of the sensor rig's.
    pub report_in_imu: bool,
    /// Weight given to a new solved pose against the running estimate (0..=1).
    pub complementary_gain: f64,
    /// IMU gaps longer than this are not integrated, in seconds.
    pub max_imu_gap: f64,
    /// Accelerometer noise density used by the filter, m/s².
    pub accel_noise: f64,
    /// Gyroscope noise used by the filter, rad/s.
    pub gyro_noise: f64,
    /// Standard deviation of a solved position, meters.
    pub position_noise: f64,
    /// Standard deviation of a solved rotation, radians.
    pub rotation_noise: f64,
    /// Low-pass factor for the world gravity estimate.
    pub gravity_filter: f64,
    /// Fraction of the accelerometer's tilt disagreement removed per IMU
    /// sample in complementary mode. Zero turns re-righting off.
    pub up_correction: f64,
    /// Largest position change a single solved pose may apply, meters.
    pub max_jump: f64,
    /// Consecutive jumps tolerated before the estimate re-anchors on them.
    pub max_jump_rejections: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            mode: FusionMode::Complementary,
            report_in_imu: false,
            complementary_gain: 0.3,
            max_imu_gap: 0.1,
            accel_noise: 0.5,
            gyro_noise: 0.02,
            position_noise: 0.005,
            rotation_noise: 0.01,
            gravity_filter: 0.01,
            up_correction: 0.002,
            max_jump: 0.4,
            max_jump_rejections: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Nominal {
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
}

/// Fusion state for one rigid body.
pub struct BodyFusion {
    config: FusionConfig,
    object: ObjectId,
    rig_from_imu: Isometry3<f64>,
    timebase_hz: f64,
    state: Option<Nominal>,
    covariance: Matrix9,
    gravity: Option<Vector3<f64>>,
    /// World up seen through solved orientations.
    up: Option<Vector3<f64>>,
    /// Latest near-1 g accelerometer direction, rig frame.
    accel_up: Option<Vector3<f64>>,
    jumps: usize,
    last_imu: Option<u64>,
    last_solve: Option<(u64, Vector3<f64>)>,
    timecode: u64,
    imu_seen: bool,
}

impl BodyFusion {
    pub fn new(body: &RigidBody, config: FusionConfig) -> BodyFusion {
        BodyFusion {
            config,
            object: body.id,
            rig_from_imu: body.imu_to_rig.to_isometry(),
            timebase_hz: body.timebase_hz as f64,
            state: None,
            covariance: Matrix9::identity(),
            gravity: None,
            up: None,
            accel_up: None,
            jumps: 0,
            last_imu: None,
            last_solve: None,
            timecode: 0,
            imu_seen: false,
        }
    }

    pub fn mode(&self) -> FusionMode {
        self.config.mode
    }

    pub fn reset(&mut self) {
        self.state = None;
        self.gravity = None;
        self.up = None;
        self.accel_up = None;
        self.jumps = 0;
        self.last_imu = None;
        self.last_solve = None;
        self.imu_seen = false;
    }

    /// Latest estimate in the reporting frame.
    pub fn current(&self) -> Option<TimedPose> {
        let state = self.state.as_ref()?;
        let rig = Isometry3::from_parts(Translation3::from(state.position), state.rotation);
        let iso = if self.config.report_in_imu {
            rig * self.rig_from_imu
        } else {
            rig
        };
        Some(TimedPose {
            object: self.object,
            timecode: self.timecode,
            pose: Pose::from_isometry(&iso),
        })
    }

    /// Feed a solved pose. Returns a pose to report when no IMU drives the output.
    pub fn on_solved_pose(&mut self, timecode: u64, pose: &Pose) -> Option<TimedPose> {
        let measured = pose.normalized();
        let position = measured.position_vector();
        let rotation = measured.unit_quaternion();

        if let Some(state) = self.state.as_ref() {
            let jump = (position - state.position).norm();
            if jump > self.config.max_jump {
                self.jumps += 1;
                if self.jumps <= self.config.max_jump_rejections {
                    log::debug!("{}: solved pose jumped {:.3} m, holding", self.object, jump);
                    return None;
                }
                log::debug!("{}: jump of {:.3} m persisted, re-anchoring", self.object, jump);
                self.state = None;
                self.last_solve = None;
            }
        }
        self.jumps = 0;

        let mode = self.config.mode;
        if mode == FusionMode::PassThrough || self.state.is_none() {
            let velocity = self.solved_velocity(timecode, &position);
            self.state = Some(Nominal {
                position,
                velocity,
                rotation,
            });
            self.covariance = self.initial_covariance();
        } else if mode == FusionMode::Kalman {
            self.kalman_update(&position, &rotation);
        } else {
            let gain = self.config.complementary_gain.clamp(0.0, 1.0);
            let velocity = self.solved_velocity(timecode, &position);
            if let Some(state) = self.state.as_mut() {
                state.position = state.position.lerp(&position, gain);
                state.rotation = state
                    .rotation
                    .try_slerp(&rotation, gain, 1e-9)
                    .unwrap_or(rotation);
                state.velocity = velocity;
            }
        }
        self.last_solve = Some((timecode, position));
        self.timecode = self.timecode.max(timecode);
        self.learn_up(&rotation);
        self.renormalize();

        if self.config.mode == FusionMode::PassThrough || !self.imu_seen {
            self.current()
        } else {
            None
        }
    }

    /// Feed a calibrated IMU sample. Returns the propagated pose.
    pub fn on_imu(&mut self, sample: &ImuSample) -> Option<TimedPose> {
        if self.config.mode == FusionMode::PassThrough {
            return None;
        }
        let previous = self.last_imu;
        match previous {
            Some(last) if sample.timecode <= last => {
                log::trace!("{}: IMU sample out of order ({} <= {})", self.object, sample.timecode, last);
                return None;
            }
            _ => self.last_imu = Some(sample.timecode),
        }
        if sample.presence.contains(ImuPresence::ACCEL) {
            let accel = self.rig_from_imu.rotation * Vector3::from(sample.accel);
            let g = accel.norm();
            self.accel_up = ((g - 1.0).abs() < UP_TOLERANCE).then(|| accel / g);
        }
        if self.state.is_none() {
            return None;
        }
        self.imu_seen = true;
        let dt = match previous {
            Some(last) => (sample.timecode - last) as f64 / self.timebase_hz,
            None => return None,
        };
        if dt > self.config.max_imu_gap {
            log::debug!("{}: IMU gap of {:.3} s, not integrating", self.object, dt);
            return None;
        }

        let imu_rotation = self.rig_from_imu.rotation;
        let gyro = if sample.presence.contains(ImuPresence::GYRO) {
            imu_rotation * Vector3::from(sample.gyro)
        } else {
            Vector3::zeros()
        };
        let specific_force = if sample.presence.contains(ImuPresence::ACCEL) {
            Some(imu_rotation * Vector3::from(sample.accel) * STANDARD_GRAVITY)
        } else {
            None
        };

        match self.config.mode {
            FusionMode::Kalman => self.kalman_predict(dt, &gyro, specific_force.as_ref()),
            _ => self.complementary_predict(dt, &gyro),
        }
        self.timecode = self.timecode.max(sample.timecode);
        self.renormalize();
        self.current()
    }

    fn solved_velocity(&self, timecode: u64, position: &Vector3<f64>) -> Vector3<f64> {
        match self.last_solve {
            Some((tc, last)) if timecode > tc => {
                let dt = (timecode - tc) as f64 / self.timebase_hz;
                if dt <= self.config.max_imu_gap * 10.0 {
                    (position - last) / dt
                } else {
                    Vector3::zeros()
                }
            }
            _ => Vector3::zeros(),
        }
    }

    fn initial_covariance(&self) -> Matrix9 {
        let mut p = Matrix9::zeros();
        let pos = self.config.position_noise.powi(2);
        let rot = self.config.rotation_noise.powi(2);
        for k in 0..3 {
            p[(k, k)] = pos;
            p[(k + 3, k + 3)] = 1.0;
            p[(k + 6, k + 6)] = rot;
        }
        p
    }

    fn learn_up(&mut self, solved: &UnitQuaternion<f64>) {
        let Some(accel_up) = self.accel_up else {
            return;
        };
        let seen = solved * accel_up;
        self.up = Some(match self.up {
            Some(up) => (up + (seen - up) * self.config.gravity_filter).normalize(),
            None => seen,
        });
    }

    fn complementary_predict(&mut self, dt: f64, gyro: &Vector3<f64>) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.rotation *= UnitQuaternion::from_scaled_axis(gyro * dt);
        state.position += state.velocity * dt;

        // Nudge the orientation so the accelerometer agrees with world up.
        if let (Some(up), Some(accel_up)) = (self.up, self.accel_up) {
            let measured = state.rotation * accel_up;
            if let Some(tilt) = UnitQuaternion::rotation_between(&measured, &up) {
                let gain = self.config.up_correction.clamp(0.0, 1.0);
                state.rotation = UnitQuaternion::from_scaled_axis(tilt.scaled_axis() * gain) * state.rotation;
            }
        }
    }

    fn kalman_predict(&mut self, dt: f64, gyro: &Vector3<f64>, specific_force: Option<&Vector3<f64>>) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let world_force = specific_force.map(|f| state.rotation * f);
        let accel = match (world_force, self.gravity.as_mut()) {
            (Some(f), Some(g)) => {
                *g += (f - *g) * self.config.gravity_filter;
                f - *g
            }
            (Some(f), None) => {
                self.gravity = Some(f);
                Vector3::zeros()
            }
            (None, _) => Vector3::zeros(),
        };

        state.position += state.velocity * dt + accel * (0.5 * dt * dt);
        state.velocity += accel * dt;
        state.rotation *= UnitQuaternion::from_scaled_axis(gyro * dt);

        let mut f = Matrix9::identity();
        f.fixed_view_mut::<3, 3>(0, 3).copy_from(&(Matrix3::identity() * dt));
        if let Some(force) = world_force {
            f.fixed_view_mut::<3, 3>(3, 6).copy_from(&(-skew(&force) * dt));
        }
        let mut q = Matrix9::zeros();
        let qv = (self.config.accel_noise * dt).powi(2);
        let qr = (self.config.gyro_noise * dt).powi(2);
        for k in 0..3 {
            q[(k + 3, k + 3)] = qv;
            q[(k + 6, k + 6)] = qr;
        }
        self.covariance = f * self.covariance * f.transpose() + q;
    }

    fn kalman_update(&mut self, position: &Vector3<f64>, rotation: &UnitQuaternion<f64>) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let mut h = Matrix6x9::zeros();
        h.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
        h.fixed_view_mut::<3, 3>(3, 6).copy_from(&Matrix3::identity());

        let dp = position - state.position;
        let dtheta = (rotation * state.rotation.inverse()).scaled_axis();
        let y = Vector6::new(dp.x, dp.y, dp.z, dtheta.x, dtheta.y, dtheta.z);

        let mut r = Matrix6::zeros();
        for k in 0..3 {
            r[(k, k)] = self.config.position_noise.powi(2);
            r[(k + 3, k + 3)] = self.config.rotation_noise.powi(2);
        }
        let s = h * self.covariance * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            log::debug!("{}: singular innovation covariance, resetting filter", self.object);
            state.position = *position;
            state.rotation = *rotation;
            state.velocity = Vector3::zeros();
            self.covariance = self.initial_covariance();
            return;
        };
        let k = self.covariance * h.transpose() * s_inv;
        let dx: Vector9 = k * y;
        state.position += dx.fixed_rows::<3>(0);
        state.velocity += dx.fixed_rows::<3>(3);
        state.rotation = UnitQuaternion::from_scaled_axis(dx.fixed_rows::<3>(6).into_owned()) * state.rotation;

        let p = (Matrix9::identity() - k * h) * self.covariance;
        self.covariance = (p + p.transpose()) * 0.5;
    }

    fn renormalize(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.rotation.renormalize();
            let finite = state.position.iter().chain(state.velocity.iter()).all(|v| v.is_finite())
                && state.rotation.coords.iter().all(|v| v.is_finite());
            if !finite {
                log::warn!("{}: fusion state diverged, waiting for the next solve", self.object);
                self.state = None;
            }
        }
    }
}
