//! Lighthouse calibration state machine.
//!
//! `NotCalibrating → CollectingOotx → FindingWatchman → CollectingSweepData →
//! PoseCalculation → Complete`. Forward moves go one state at a time. A forced
//! restart returns to `NotCalibrating` from anywhere, and a failed pose
//! calculation steps back to `CollectingSweepData`.
//!
//! The "watchman" is the body that defines the world frame: once it has been
//! visible for long enough its sweeps are collected, and each lighthouse's
//! pose is the inverse of the watchman's pose solved in that lighthouse's frame.

use crate::device::RigidBody;
use crate::disambiguator::ResolvedSweep;
use crate::error::Diagnostic;
use crate::poser::{PoseSolver, SolveBudget, SolveError, SolveInput, SolverKind, SolverOptions};
use crate::protocol::TIMEBASE_HZ;
use crate::types::{AngleMeasurement, LighthouseId, ObjectId, Pose, SensorId, SweepAxis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CalibrationStatus {
    NotCalibrating = 0,
    CollectingOotx = 1,
    FindingWatchman = 2,
    CollectingSweepData = 3,
    PoseCalculation = 4,
    Complete = 5,
}

impl CalibrationStatus {
    /// The state a forward transition leads to.
    pub fn next(self) -> Option<CalibrationStatus> {
        match self {
            CalibrationStatus::NotCalibrating => Some(CalibrationStatus::CollectingOotx),
            CalibrationStatus::CollectingOotx => Some(CalibrationStatus::FindingWatchman),
            CalibrationStatus::FindingWatchman => Some(CalibrationStatus::CollectingSweepData),
            CalibrationStatus::CollectingSweepData => Some(CalibrationStatus::PoseCalculation),
            CalibrationStatus::PoseCalculation => Some(CalibrationStatus::Complete),
            CalibrationStatus::Complete => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a startup timeout applies in this state.
    fn waits_for_lighthouses(self) -> bool {
        matches!(
            self,
            CalibrationStatus::CollectingOotx | CalibrationStatus::FindingWatchman
        )
    }
}

impl std::fmt::Display for CalibrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CalibrationStatus::NotCalibrating => "NotCalibrating",
            CalibrationStatus::CollectingOotx => "CollectingOOTX",
            CalibrationStatus::FindingWatchman => "FindingWatchman",
            CalibrationStatus::CollectingSweepData => "CollectingSweepData",
            CalibrationStatus::PoseCalculation => "PoseCalculation",
            CalibrationStatus::Complete => "Complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Lighthouses that must decode OOTX and be posed.
    pub required_lighthouses: usize,
    /// Codenames allowed to act as the watchman. Empty means any body.
    pub required_trackers: Vec<String>,
    pub allow_all_trackers: bool,
    /// Sweeps per lighthouse axis collected before solving.
    pub min_sweep_frames: usize,
    /// Consecutive sweeps a body must appear in to become the watchman.
    pub visibility_frames: usize,
    /// Ticks without progress before the startup phase gives up.
    pub startup_timeout_ticks: u64,
    /// Start in `NotCalibrating` and stay there until a forced recalibration.
    pub disabled: bool,
    pub solver: SolverKind,
    /// Solver that produces the seed when `solver` needs one.
    pub seed_solver: Option<SolverKind>,
    pub solver_options: SolverOptions,
    pub solve_timeout: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            required_lighthouses: 2,
            required_trackers: Vec::new(),
            allow_all_trackers: false,
            min_sweep_frames: 20,
            visibility_frames: 3,
            startup_timeout_ticks: 30 * TIMEBASE_HZ,
            disabled: false,
            solver: SolverKind::Epnp,
            seed_solver: Some(SolverKind::Epnp),
            solver_options: SolverOptions::default(),
            solve_timeout: Duration::from_millis(500),
        }
    }
}

/// What a calibration step produced, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    Status(CalibrationStatus),
    Diagnostic(Diagnostic),
    /// Solved lighthouse poses in the watchman's frame.
    LighthousePoses(BTreeMap<LighthouseId, Pose>),
}

/// Sweeps collected for the watchman on one lighthouse.
#[derive(Debug, Default)]
struct Collected {
    frames: [usize; 2],
    /// (sensor, axis) -> (sum, count)
    sums: BTreeMap<(SensorId, SweepAxis), (f64, usize)>,
}

impl Collected {
    fn is_ready(&self, min_frames: usize) -> bool {
        self.frames.iter().all(|&n| n >= min_frames)
    }

    fn averages(&self, object: ObjectId, lighthouse: LighthouseId) -> Vec<AngleMeasurement> {
        self.sums
            .iter()
            .map(|(&(sensor, axis), &(sum, count))| AngleMeasurement {
                object,
                sensor,
                axis,
                timecode: 0,
                pulse_length_s: 0.0,
                angle: sum / count as f64,
                lighthouse,
            })
            .collect()
    }
}

pub struct CalibrationMachine {
    config: CalibrationConfig,
    status: CalibrationStatus,
    history: Vec<CalibrationStatus>,
    started: Option<u64>,
    decoded: BTreeSet<LighthouseId>,
    visibility: BTreeMap<ObjectId, usize>,
    watchman: Option<ObjectId>,
    collected: BTreeMap<LighthouseId, Collected>,
    solver: Box<dyn PoseSolver>,
    seed_solver: Option<Box<dyn PoseSolver>>,
}

impl CalibrationMachine {
    pub fn new(config: CalibrationConfig) -> CalibrationMachine {
        let solver = config.solver.create(config.solver_options);
        let seed_solver = config
            .seed_solver
            .filter(|kind| !kind.requires_seed())
            .map(|kind| kind.create(config.solver_options));
        CalibrationMachine {
            config,
            status: CalibrationStatus::NotCalibrating,
            history: vec![CalibrationStatus::NotCalibrating],
            started: None,
            decoded: BTreeSet::new(),
            visibility: BTreeMap::new(),
            watchman: None,
            collected: BTreeMap::new(),
            solver,
            seed_solver,
        }
    }

    pub fn status(&self) -> CalibrationStatus {
        self.status
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[CalibrationStatus] {
        &self.history
    }

    pub fn watchman(&self) -> Option<ObjectId> {
        self.watchman
    }

    pub fn is_disabled(&self) -> bool {
        self.config.disabled
    }

    /// Whether a body may act as the watchman.
    pub fn is_eligible(&self, name: &str) -> bool {
        self.config.allow_all_trackers
            || self.config.required_trackers.is_empty()
            || self.config.required_trackers.iter().any(|t| t == name)
    }

    fn enter(&mut self, status: CalibrationStatus, events: &mut Vec<CalibrationEvent>) {
        if status == self.status {
            return;
        }
        log::info!("Calibration: {} -> {}", self.status, status);
        self.status = status;
        self.history.push(status);
        events.push(CalibrationEvent::Status(status));
    }

    fn advance(&mut self, events: &mut Vec<CalibrationEvent>) {
        if let Some(next) = self.status.next() {
            self.enter(next, events);
        }
    }

    fn clear(&mut self) {
        self.started = None;
        self.decoded.clear();
        self.visibility.clear();
        self.watchman = None;
        self.collected.clear();
    }

    /// Session start. Does nothing when calibration is disabled or already running.
    pub fn start(&mut self, now: u64) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        if self.config.disabled {
            log::info!("Calibration disabled, staying in {}", self.status);
            return events;
        }
        if self.status == CalibrationStatus::NotCalibrating {
            self.clear();
            self.started = Some(now);
            self.advance(&mut events);
        }
        events
    }

    /// Abandon whatever is in progress and return to `NotCalibrating`.
    pub fn force_restart(&mut self) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        self.clear();
        self.enter(CalibrationStatus::NotCalibrating, &mut events);
        events
    }

    /// Forced recalibration: restart, then start even if disabled.
    pub fn recalibrate(&mut self, now: u64) -> Vec<CalibrationEvent> {
        let mut events = self.force_restart();
        self.config.disabled = false;
        events.extend(self.start(now));
        events
    }

    /// Disable calibration. Only honored before calibration has started.
    pub fn disable(&mut self) -> bool {
        if self.status != CalibrationStatus::NotCalibrating {
            log::warn!("Ignoring disable-calibrate request in {}", self.status);
            return false;
        }
        self.config.disabled = true;
        true
    }

    pub fn on_ootx(&mut self, lighthouse: LighthouseId, now: u64) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        if self.decoded.insert(lighthouse) {
            log::debug!("Calibration: OOTX from lighthouse {} ({} of {})", lighthouse, self.decoded.len(), self.config.required_lighthouses);
            self.started = self.started.map(|_| now);
        }
        if self.status == CalibrationStatus::CollectingOotx
            && self.decoded.len() >= self.config.required_lighthouses
        {
            self.advance(&mut events);
        }
        events
    }

    /// Feed a resolved sweep. Bodies supply geometry for the pose calculation.
    pub fn on_sweep(
        &mut self,
        sweep: &ResolvedSweep,
        bodies: &BTreeMap<ObjectId, RigidBody>,
    ) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        match self.status {
            CalibrationStatus::FindingWatchman => self.find_watchman(sweep, bodies, &mut events),
            CalibrationStatus::CollectingSweepData => {
                self.collect(sweep);
                let ready: Vec<LighthouseId> = self
                    .collected
                    .iter()
                    .filter(|(_, c)| c.is_ready(self.config.min_sweep_frames))
                    .map(|(lh, _)| *lh)
                    .collect();
                if ready.len() >= self.config.required_lighthouses {
                    self.advance(&mut events);
                    self.run_pose_calculation(bodies, &mut events);
                }
            }
            _ => {}
        }
        events
    }

    /// Startup timeout check.
    pub fn tick(&mut self, now: u64) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        if !self.status.waits_for_lighthouses() {
            return events;
        }
        let Some(started) = self.started else {
            self.started = Some(now);
            return events;
        };
        if now.saturating_sub(started) > self.config.startup_timeout_ticks {
            let state = self.status;
            log::warn!("Calibration timed out in {}", state);
            events.push(CalibrationEvent::Diagnostic(Diagnostic::CalibrationTimeout { state }));
            self.clear();
            self.enter(CalibrationStatus::NotCalibrating, &mut events);
        }
        events
    }

    fn find_watchman(
        &mut self,
        sweep: &ResolvedSweep,
        bodies: &BTreeMap<ObjectId, RigidBody>,
        events: &mut Vec<CalibrationEvent>,
    ) {
        let seen = sweep.objects();
        let eligible: Vec<ObjectId> = bodies
            .values()
            .filter(|b| self.is_eligible(&b.name))
            .map(|b| b.id)
            .collect();
        for id in eligible {
            let count = self.visibility.entry(id).or_insert(0);
            if seen.contains(&id) {
                *count += 1;
            } else {
                *count = 0;
            }
        }
        let found = self
            .visibility
            .iter()
            .filter(|&(_, &n)| n >= self.config.visibility_frames)
            .max_by_key(|&(_, &n)| n)
            .map(|(id, _)| *id);
        if let Some(id) = found {
            log::info!("Calibration: watchman is {}", id);
            self.watchman = Some(id);
            self.advance(events);
        }
    }

    fn collect(&mut self, sweep: &ResolvedSweep) {
        let Some(watchman) = self.watchman else {
            return;
        };
        let mut angles = sweep.angles_for(watchman).peekable();
        if angles.peek().is_none() {
            return;
        }
        let entry = self.collected.entry(sweep.lighthouse).or_default();
        entry.frames[sweep.axis.index()] += 1;
        for a in angles {
            let slot = entry.sums.entry((a.sensor, a.axis)).or_insert((0.0, 0));
            slot.0 += a.angle;
            slot.1 += 1;
        }
    }

    fn solve_in_lighthouse(
        &self,
        body: &RigidBody,
        angles: &[AngleMeasurement],
        lighthouse: LighthouseId,
    ) -> Result<Pose, Diagnostic> {
        let identity = BTreeMap::from([(lighthouse, Pose::IDENTITY)]);
        let budget = SolveBudget::with_timeout(100, self.config.solve_timeout);
        let seed: Pose;
        let mut input = SolveInput {
            body,
            angles,
            lighthouses: &identity,
            seed: None,
            budget,
        };
        if self.solver.requires_seed() {
            let Some(seed_solver) = self.seed_solver.as_ref() else {
                return Err(Diagnostic::MissingSeed {
                    object: body.id,
                    solver: self.solver.kind(),
                });
            };
            seed = seed_solver.solve(&input).map_err(|e| self.diagnostic(body.id, seed_solver.kind(), e))?;
            input.seed = Some(&seed);
        }
        self.solver
            .solve(&input)
            .map_err(|e| self.diagnostic(body.id, self.solver.kind(), e))
    }

    fn diagnostic(&self, object: ObjectId, solver: SolverKind, error: SolveError) -> Diagnostic {
        match error {
            SolveError::MissingSeed => Diagnostic::MissingSeed { object, solver },
            SolveError::Failed(failure) => Diagnostic::SolveFailure {
                object,
                solver,
                failure,
            },
        }
    }

    fn run_pose_calculation(
        &mut self,
        bodies: &BTreeMap<ObjectId, RigidBody>,
        events: &mut Vec<CalibrationEvent>,
    ) {
        let Some(body) = self.watchman.and_then(|id| bodies.get(&id)) else {
            log::warn!("Calibration: watchman left before pose calculation");
            self.collected.clear();
            self.enter(CalibrationStatus::CollectingSweepData, events);
            return;
        };

        let mut poses = BTreeMap::new();
        let mut failed = Vec::new();
        for (lh, collected) in self.collected.iter() {
            if !collected.is_ready(self.config.min_sweep_frames) {
                continue;
            }
            let angles = collected.averages(body.id, *lh);
            match self.solve_in_lighthouse(body, &angles, *lh) {
                Ok(body_in_lh) => {
                    poses.insert(*lh, body_in_lh.inverse());
                }
                Err(diagnostic) => {
                    log::warn!("Calibration: lighthouse {}: {}", lh, diagnostic);
                    failed.push(*lh);
                    events.push(CalibrationEvent::Diagnostic(diagnostic));
                }
            }
        }

        if poses.len() >= self.config.required_lighthouses {
            for (lh, pose) in &poses {
                log::info!("Calibration: lighthouse {} at {:?}", lh, pose.position);
            }
            events.push(CalibrationEvent::LighthousePoses(poses));
            self.advance(events);
        } else {
            for lh in failed {
                self.collected.remove(&lh);
            }
            self.enter(CalibrationStatus::CollectingSweepData, events);
        }
    }
}
