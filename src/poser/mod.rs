//! Pose solvers: sweep angles plus sensor geometry in, rigid-body pose out.
//!
//! Every solver works on [`Observation`]s: one sweep angle of one sensor seen
//! from a lighthouse whose world pose is known. The result is the body's
//! world pose. Calibration runs the same solvers against an identity
//! lighthouse to get the body pose in that lighthouse's frame.

mod epnp;
mod ortho;
mod refine;

pub use epnp::epnp;
pub use ortho::weak_perspective;
pub use refine::{levenberg_marquardt, residuals, rms, JacobianMode, LmOptions, LmOutcome, Loss};

use crate::device::RigidBody;
use crate::math;
use crate::types::{AngleMeasurement, LighthouseId, Pose, SensorId, SweepAxis};
use nalgebra::{Isometry3, Vector3};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Fewest angles that constrain all six degrees of freedom.
pub const MIN_OBSERVATIONS: usize = 6;
/// Fewest sensors with both axes from one lighthouse for a closed-form solve.
pub const MIN_PAIRED_POINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SolverKind {
    /// Weak-perspective affine solve, fast and approximate.
    Orthographic,
    /// Closed-form perspective-n-point followed by refinement.
    Epnp,
    /// Robust (Huber) refinement from a seed pose.
    BundleAdjustment,
    /// Plain least-squares refinement from a seed pose.
    LeastSquares,
    /// Least squares that drops poorly fitting hits and refits.
    CulledRefine,
}

impl SolverKind {
    pub fn create(self, options: SolverOptions) -> Box<dyn PoseSolver> {
        match self {
            SolverKind::Orthographic => Box::new(Orthographic { options }),
            SolverKind::Epnp => Box::new(Epnp { options }),
            SolverKind::BundleAdjustment => Box::new(BundleAdjustment { options }),
            SolverKind::LeastSquares => Box::new(LeastSquares { options }),
            SolverKind::CulledRefine => Box::new(CulledRefine { options }),
        }
    }

    pub fn requires_seed(self) -> bool {
        matches!(
            self,
            SolverKind::BundleAdjustment | SolverKind::LeastSquares | SolverKind::CulledRefine
        )
    }
}

impl std::fmt::Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverKind::Orthographic => f.write_str("orthographic"),
            SolverKind::Epnp => f.write_str("EPnP"),
            SolverKind::BundleAdjustment => f.write_str("bundle-adjustment"),
            SolverKind::LeastSquares => f.write_str("least-squares"),
            SolverKind::CulledRefine => f.write_str("culled-refine"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveBudget {
    pub max_iterations: usize,
    pub deadline: Option<Instant>,
}

impl Default for SolveBudget {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            deadline: None,
        }
    }
}

impl SolveBudget {
    pub fn with_timeout(max_iterations: usize, timeout: Duration) -> Self {
        Self {
            max_iterations,
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    InsufficientData,
    Degenerate,
    NotConverged,
    DeadlineExceeded,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::InsufficientData => f.write_str("insufficient data"),
            FailureReason::Degenerate => f.write_str("degenerate geometry"),
            FailureReason::NotConverged => f.write_str("did not converge"),
            FailureReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("{reason} (last residual {last_residual:.3e} rad)")]
pub struct SolveFailure {
    pub reason: FailureReason,
    pub last_residual: f64,
}

impl SolveFailure {
    pub fn new(reason: FailureReason, last_residual: f64) -> Self {
        Self {
            reason,
            last_residual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum SolveError {
    #[error("solver needs a seed pose")]
    MissingSeed,
    #[error(transparent)]
    Failed(#[from] SolveFailure),
}

/// One sweep angle of one sensor, with the observing lighthouse's world pose.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub lighthouse: LighthouseId,
    pub world_from_lighthouse: Isometry3<f64>,
    pub sensor: SensorId,
    /// Sensor position in the body frame.
    pub point: Vector3<f64>,
    pub axis: SweepAxis,
    pub angle: f64,
}

pub struct SolveInput<'a> {
    pub body: &'a RigidBody,
    pub angles: &'a [AngleMeasurement],
    /// World pose of every lighthouse that can be used.
    pub lighthouses: &'a BTreeMap<LighthouseId, Pose>,
    pub seed: Option<&'a Pose>,
    pub budget: SolveBudget,
}

impl SolveInput<'_> {
    /// Angles with a known lighthouse and sensor, converted to observations.
    pub fn observations(&self) -> Vec<Observation> {
        self.angles
            .iter()
            .filter(|a| a.object == self.body.id)
            .filter_map(|a| {
                let lighthouse = self.lighthouses.get(&a.lighthouse)?;
                Some(Observation {
                    lighthouse: a.lighthouse,
                    world_from_lighthouse: lighthouse.to_isometry(),
                    sensor: a.sensor,
                    point: self.body.sensor_point(a.sensor)?,
                    axis: a.axis,
                    angle: a.angle,
                })
            })
            .collect()
    }
}

/// Sensors seen on both axes by one lighthouse, as body points and image points.
#[derive(Debug, Default)]
pub(crate) struct Correspondences {
    pub world: Vec<Vector3<f64>>,
    pub image: Vec<(f64, f64)>,
}

/// Pair up horizontal and vertical angles per sensor for the lighthouse with the most pairs.
pub(crate) fn best_correspondences(obs: &[Observation]) -> Option<(LighthouseId, Isometry3<f64>, Correspondences)> {
    let mut per_lh: BTreeMap<LighthouseId, (Isometry3<f64>, BTreeMap<SensorId, (Vector3<f64>, [Option<f64>; 2])>)> =
        BTreeMap::new();
    for o in obs {
        let entry = per_lh
            .entry(o.lighthouse)
            .or_insert_with(|| (o.world_from_lighthouse, BTreeMap::new()));
        let slot = entry.1.entry(o.sensor).or_insert((o.point, [None, None]));
        slot.1[o.axis.index()] = Some(o.angle);
    }
    per_lh
        .into_iter()
        .map(|(lh, (pose, sensors))| {
            let mut c = Correspondences::default();
            for (_, (point, angles)) in sensors {
                if let [Some(h), Some(v)] = angles {
                    c.world.push(point);
                    c.image.push(math::image_point(h, v));
                }
            }
            (lh, pose, c)
        })
        .filter(|(_, _, c)| c.world.len() >= MIN_PAIRED_POINTS)
        .max_by_key(|(_, _, c)| c.world.len())
}

/// World pose of the body from its pose in a lighthouse's pinhole camera frame.
pub(crate) fn world_from_camera_solution(
    world_from_lighthouse: &Isometry3<f64>,
    camera_from_body: &Isometry3<f64>,
) -> Isometry3<f64> {
    let lighthouse_from_camera = Isometry3::from_parts(
        nalgebra::Translation3::identity(),
        math::camera_from_lighthouse().inverse(),
    );
    world_from_lighthouse * lighthouse_from_camera * camera_from_body
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    /// Use the analytic Jacobian in least squares instead of finite differences.
    pub use_jacobian: bool,
    /// Largest RMS angle residual accepted as converged, in radians.
    pub max_rms: f64,
    /// Huber threshold for bundle adjustment, in radians.
    pub huber_delta: f64,
    /// Culled refinement drops hits whose residual exceeds this many times the RMS.
    pub cull_factor: f64,
    /// Residuals below this never get a hit culled, in radians.
    pub cull_floor: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            use_jacobian: true,
            max_rms: 0.01,
            huber_delta: 0.005,
            cull_factor: 3.0,
            cull_floor: 1e-3,
        }
    }
}

pub trait PoseSolver: Send {
    fn kind(&self) -> SolverKind;

    fn requires_seed(&self) -> bool {
        self.kind().requires_seed()
    }

    fn solve(&self, input: &SolveInput<'_>) -> Result<Pose, SolveError>;
}

fn lm_options(budget: &SolveBudget, loss: Loss, jacobian: JacobianMode) -> LmOptions {
    LmOptions {
        loss,
        jacobian,
        max_iterations: budget.max_iterations,
        deadline: budget.deadline,
        ..LmOptions::default()
    }
}

fn accept(kind: SolverKind, outcome: LmOutcome, options: &SolverOptions) -> Result<Pose, SolveError> {
    let pose = Pose::from_isometry(&outcome.pose);
    if !pose.is_finite() || outcome.rms > options.max_rms {
        log::debug!("{} rejected: rms {:.3e} after {} iterations", kind, outcome.rms, outcome.iterations);
        return Err(SolveFailure::new(FailureReason::NotConverged, outcome.rms).into());
    }
    log::trace!("{} converged: rms {:.3e} after {} iterations", kind, outcome.rms, outcome.iterations);
    Ok(pose)
}

fn check_observations(obs: &[Observation]) -> Result<(), SolveError> {
    if obs.len() < MIN_OBSERVATIONS {
        return Err(SolveFailure::new(FailureReason::InsufficientData, f64::NAN).into());
    }
    Ok(())
}

/// Lowest-residual refinement among the candidate starting poses.
fn refine_best(
    obs: &[Observation],
    starts: &[Isometry3<f64>],
    options: &LmOptions,
) -> Result<LmOutcome, SolveFailure> {
    let mut best: Option<LmOutcome> = None;
    let mut last_failure = SolveFailure::new(FailureReason::Degenerate, f64::NAN);
    for start in starts {
        match levenberg_marquardt(obs, start, options) {
            Ok(outcome) => {
                if best.as_ref().map_or(true, |b| outcome.rms < b.rms) {
                    best = Some(outcome);
                }
            }
            Err(failure) => last_failure = failure,
        }
    }
    best.ok_or(last_failure)
}

pub struct Orthographic {
    options: SolverOptions,
}

/// Refinement iterations used to polish the weak-perspective estimate.
const ORTHO_POLISH_ITERATIONS: usize = 5;

impl PoseSolver for Orthographic {
    fn kind(&self) -> SolverKind {
        SolverKind::Orthographic
    }

    fn solve(&self, input: &SolveInput<'_>) -> Result<Pose, SolveError> {
        let obs = input.observations();
        check_observations(&obs)?;
        let (_, world_from_lh, c) = best_correspondences(&obs)
            .ok_or(SolveFailure::new(FailureReason::InsufficientData, f64::NAN))?;
        let starts: Vec<Isometry3<f64>> = weak_perspective(&c.world, &c.image)
            .iter()
            .map(|cam| world_from_camera_solution(&world_from_lh, cam))
            .collect();
        if starts.is_empty() {
            return Err(SolveFailure::new(FailureReason::Degenerate, f64::NAN).into());
        }
        let budget = SolveBudget {
            max_iterations: input.budget.max_iterations.min(ORTHO_POLISH_ITERATIONS),
            ..input.budget
        };
        let options = lm_options(&budget, Loss::Squared, JacobianMode::Analytic);
        let outcome = refine_best(&obs, &starts, &options)?;
        accept(self.kind(), outcome, &self.options)
    }
}

pub struct Epnp {
    options: SolverOptions,
}

impl PoseSolver for Epnp {
    fn kind(&self) -> SolverKind {
        SolverKind::Epnp
    }

    fn solve(&self, input: &SolveInput<'_>) -> Result<Pose, SolveError> {
        let obs = input.observations();
        check_observations(&obs)?;
        let mut starts = Vec::new();
        if let Some((lh, world_from_lh, c)) = best_correspondences(&obs) {
            match epnp(&c.world, &c.image) {
                Some(cam) => starts.push(world_from_camera_solution(&world_from_lh, &cam)),
                None => log::debug!("EPnP degenerate on lighthouse {} ({} points)", lh, c.world.len()),
            }
        }
        if let Some(seed) = input.seed {
            starts.push(seed.to_isometry());
        }
        if starts.is_empty() {
            return Err(SolveFailure::new(FailureReason::Degenerate, f64::NAN).into());
        }
        let options = lm_options(&input.budget, Loss::Squared, JacobianMode::Analytic);
        let outcome = refine_best(&obs, &starts, &options)?;
        accept(self.kind(), outcome, &self.options)
    }
}

pub struct BundleAdjustment {
    options: SolverOptions,
}

impl PoseSolver for BundleAdjustment {
    fn kind(&self) -> SolverKind {
        SolverKind::BundleAdjustment
    }

    fn solve(&self, input: &SolveInput<'_>) -> Result<Pose, SolveError> {
        let seed = input.seed.ok_or(SolveError::MissingSeed)?;
        let obs = input.observations();
        check_observations(&obs)?;
        let options = lm_options(
            &input.budget,
            Loss::Huber(self.options.huber_delta),
            JacobianMode::Analytic,
        );
        let outcome = levenberg_marquardt(&obs, &seed.to_isometry(), &options)?;
        accept(self.kind(), outcome, &self.options)
    }
}

pub struct LeastSquares {
    options: SolverOptions,
}

impl PoseSolver for LeastSquares {
    fn kind(&self) -> SolverKind {
        SolverKind::LeastSquares
    }

    fn solve(&self, input: &SolveInput<'_>) -> Result<Pose, SolveError> {
        let seed = input.seed.ok_or(SolveError::MissingSeed)?;
        let obs = input.observations();
        check_observations(&obs)?;
        let jacobian = if self.options.use_jacobian {
            JacobianMode::Analytic
        } else {
            JacobianMode::FiniteDifference
        };
        let options = lm_options(&input.budget, Loss::Squared, jacobian);
        let outcome = levenberg_marquardt(&obs, &seed.to_isometry(), &options)?;
        accept(self.kind(), outcome, &self.options)
    }
}

/// Seeded least squares in two passes: fit, drop the hits that fit worst, refit.
pub struct CulledRefine {
    options: SolverOptions,
}

impl CulledRefine {
    fn keep(&self, obs: &[Observation], outcome: &LmOutcome) -> Vec<Observation> {
        let limit = (outcome.rms * self.options.cull_factor).max(self.options.cull_floor);
        residuals(obs, &outcome.pose)
            .into_iter()
            .zip(obs)
            .filter(|(r, _)| r.abs() <= limit)
            .map(|(_, o)| *o)
            .collect()
    }
}

impl PoseSolver for CulledRefine {
    fn kind(&self) -> SolverKind {
        SolverKind::CulledRefine
    }

    fn solve(&self, input: &SolveInput<'_>) -> Result<Pose, SolveError> {
        let seed = input.seed.ok_or(SolveError::MissingSeed)?;
        let obs = input.observations();
        check_observations(&obs)?;
        let options = lm_options(&input.budget, Loss::Squared, JacobianMode::Analytic);
        let first = levenberg_marquardt(&obs, &seed.to_isometry(), &options)?;
        let kept = self.keep(&obs, &first);
        if kept.len() == obs.len() || kept.len() < MIN_OBSERVATIONS {
            return accept(self.kind(), first, &self.options);
        }
        log::trace!("{} culled {} of {} hits", self.kind(), obs.len() - kept.len(), obs.len());
        let second = levenberg_marquardt(&kept, &first.pose, &options)?;
        accept(self.kind(), second, &self.options)
    }
}
