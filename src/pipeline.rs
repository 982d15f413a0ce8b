//! The synchronous pipeline run by the session worker thread.
//!
//! Events go in through [`Pipeline::handle`] one at a time, in arrival order.
//! Nothing here blocks or spawns. Everything downstream of the ingest queue runs
//! on the caller's thread: sweep aggregation, disambiguation, OOTX decoding,
//! calibration, pose solving, fusion and per-body output ordering.

use crate::aggregator::{AggregatorConfig, SweepAggregator, SweepFrame};
use crate::calibration::{CalibrationEvent, CalibrationMachine, CalibrationStatus};
use crate::config::{CalibrationStore, StoredLighthouse, TrackerConfig};
use crate::device::{DevicePreset, RigidBody};
use crate::disambiguator::{DisambiguationContext, Disambiguator, ResolvedSweep};
use crate::error::{Diagnostic, LateKind};
use crate::fusion::{BodyFusion, FusionConfig};
use crate::ootx::{LighthouseCalibration, OotxDecoder};
use crate::poser::{PoseSolver, SolveBudget, SolveError, SolveFailure, SolveInput, SolverKind, MIN_OBSERVATIONS};
use crate::protocol::{SyncCode, ROTOR_PERIOD_TICKS, SWEEP_PERIOD_TICKS};
use crate::reorder::ReorderBuffer;
use crate::report::ReporterRegistry;
use crate::types::{
    AngleMeasurement, ButtonEvent, DeviceAnnouncement, Event, ImuSample, LightHit, LighthouseId,
    LighthouseInfo, LighthouseStatus, Message, ObjectId, Pose, SensorId, SweepAxis, SyncPulse,
    TimedPose,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Syncs from the same lighthouse closer than this are one flash.
const SYNC_DEDUP_TICKS: u64 = SWEEP_PERIOD_TICKS / 4;
/// Angles older than this are not used for a tracking solve.
const ANGLE_MAX_AGE_TICKS: u64 = 4 * ROTOR_PERIOD_TICKS;
const TRACKING_MAX_ITERATIONS: usize = 50;
const TRACKING_SOLVE_TIMEOUT: Duration = Duration::from_millis(50);
/// Output poses are held this long for reordering.
const REORDER_WINDOW_TICKS: u64 = SWEEP_PERIOD_TICKS;
const REORDER_CAPACITY: usize = 64;

/// Read-only copy of one body's state.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyState {
    pub id: ObjectId,
    pub name: String,
    pub driver_name: String,
    /// Last pose released to reporters.
    pub pose: Option<TimedPose>,
    pub charge: u8,
    pub charging: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub events: u64,
    pub frames: u64,
    pub ambiguous_frames: u64,
    pub solves: u64,
    pub solve_failures: u64,
    pub poses: u64,
    pub late_poses: u64,
    pub diagnostics: u64,
}

/// What consumers see of the session. Published as a whole, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub lighthouses: BTreeMap<LighthouseId, LighthouseInfo>,
    pub bodies: BTreeMap<ObjectId, BodyState>,
    pub calibration: CalibrationStatus,
    pub stats: PipelineStats,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            lighthouses: BTreeMap::new(),
            bodies: BTreeMap::new(),
            calibration: CalibrationStatus::NotCalibrating,
            stats: PipelineStats::default(),
        }
    }
}

pub type SharedSnapshot = Arc<RwLock<Snapshot>>;

/// Commands the session sends to the worker outside the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Recalibrate,
}

type AngleKey = (LighthouseId, SensorId, SweepAxis);

struct Tracked {
    body: RigidBody,
    fusion: BodyFusion,
    reorder: ReorderBuffer<TimedPose>,
    angles: BTreeMap<AngleKey, AngleMeasurement>,
    released: Option<TimedPose>,
}

pub struct Pipeline {
    registry: ReporterRegistry,
    aggregator: SweepAggregator,
    disambiguator: Box<dyn Disambiguator>,
    solver: Box<dyn PoseSolver>,
    seed_solver: Box<dyn PoseSolver>,
    calibration: CalibrationMachine,
    fusion_config: FusionConfig,
    ootx_tolerant: bool,
    disabled_lighthouse: Option<LighthouseId>,
    decoders: BTreeMap<LighthouseId, OotxDecoder>,
    // The object whose sync pulses drive each lighthouse's epochs and OOTX stream.
    sync_source: BTreeMap<LighthouseId, (ObjectId, u64)>,
    lighthouses: BTreeMap<LighthouseId, LighthouseInfo>,
    tracked: BTreeMap<ObjectId, Tracked>,
    // Body geometry for the disambiguator and calibration, kept in step with `tracked`.
    bodies: BTreeMap<ObjectId, RigidBody>,
    calibration_pending: bool,
    store_dirty: bool,
    last_timecode: u64,
    stats: PipelineStats,
    shared: SharedSnapshot,
}

impl Pipeline {
    /// Build a pipeline from a validated config.
    ///
    /// Lighthouse poses in `store` are used as-is when they cover every enabled
    /// lighthouse and calibration is not forced; otherwise calibration runs.
    pub fn new(config: &TrackerConfig, registry: ReporterRegistry, store: Option<&CalibrationStore>) -> Pipeline {
        let solver_options = config.solver_options();
        let mut pipeline = Pipeline {
            registry,
            aggregator: SweepAggregator::new(AggregatorConfig {
                disabled_lighthouse: config.disable_lighthouse,
                ..AggregatorConfig::default()
            }),
            disambiguator: config.disambiguator.kind().create(),
            solver: config.default_solver().create(solver_options),
            seed_solver: config.seed_solver().create(solver_options),
            calibration: CalibrationMachine::new(config.calibration_config()),
            fusion_config: config.fusion_config(),
            ootx_tolerant: config.ootx_tolerant(),
            disabled_lighthouse: config.disable_lighthouse,
            decoders: BTreeMap::new(),
            sync_source: BTreeMap::new(),
            lighthouses: BTreeMap::new(),
            tracked: BTreeMap::new(),
            bodies: BTreeMap::new(),
            calibration_pending: false,
            store_dirty: false,
            last_timecode: 0,
            stats: PipelineStats::default(),
            shared: Arc::new(RwLock::new(Snapshot::default())),
        };

        let stored = store
            .filter(|s| s.covers(config.lighthouse_count(), config.disable_lighthouse))
            .filter(|_| !config.force_calibrate());
        match stored {
            Some(store) => {
                log::info!("Using {} stored lighthouse poses", store.lighthouses.len());
                for (id, entry) in &store.lighthouses {
                    let mut info = LighthouseInfo::new(*id);
                    info.pose = Some(entry.pose);
                    info.calibration = entry.calibration;
                    info.status = LighthouseStatus::Posed;
                    pipeline.lighthouses.insert(*id, info);
                }
            }
            None if pipeline.calibration.is_disabled() => {
                log::warn!("Calibration disabled and no stored lighthouse poses; no poses will be solved");
            }
            None => pipeline.calibration_pending = true,
        }
        pipeline
    }

    /// Handle to the published snapshot.
    pub fn shared(&self) -> SharedSnapshot {
        self.shared.clone()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.calibration.status()
    }

    pub fn lighthouses(&self) -> &BTreeMap<LighthouseId, LighthouseInfo> {
        &self.lighthouses
    }

    pub fn body(&self, id: ObjectId) -> Option<&RigidBody> {
        self.bodies.get(&id)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Add or replace a body. Replacing resets its fusion and ordering state.
    pub fn register_body(&mut self, body: RigidBody) {
        let id = body.id;
        if self.tracked.contains_key(&id) {
            log::info!("Replacing body {} ({} sensors)", body.name, body.sensor_count());
        } else {
            log::info!("Registered body {} ({}, {} sensors)", body.name, body.driver_name, body.sensor_count());
        }
        self.aggregator.register_body(id, body.sensor_count());
        self.tracked.insert(
            id,
            Tracked {
                fusion: BodyFusion::new(&body, self.fusion_config),
                reorder: ReorderBuffer::new(REORDER_WINDOW_TICKS, REORDER_CAPACITY),
                angles: BTreeMap::new(),
                released: None,
                body: body.clone(),
            },
        );
        self.bodies.insert(id, body);
    }

    pub fn control(&mut self, control: Control) {
        match control {
            Control::Recalibrate => {
                log::info!("Recalibration requested");
                self.calibration_pending = false;
                let events = self.calibration.recalibrate(self.last_timecode);
                self.apply_calibration(events);
            }
        }
    }

    pub fn handle(&mut self, event: Event) {
        self.stats.events += 1;
        if let Some(tc) = event.timecode() {
            self.on_timecode(tc);
        }
        match event {
            Event::Light(hit) => self.on_light(hit),
            Event::Sync(pulse) => self.on_sync(pulse),
            Event::Imu(sample) => self.on_imu(sample),
            Event::Button(button) => self.on_button(button),
            Event::Status {
                object,
                charge,
                charging,
            } => {
                if let Some(t) = self.tracked.get_mut(&object) {
                    t.body.charge = charge;
                    t.body.charging = charging;
                }
            }
            Event::Device(device) => self.on_device(device),
        }
    }

    /// Report a diagnostic raised outside the pipeline, such as a queue overflow.
    pub fn report_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.stats.diagnostics += 1;
        if diagnostic.is_drop() {
            log::warn!("{}", diagnostic);
        } else {
            log::debug!("{}", diagnostic);
        }
        let object = diagnostic_object(&diagnostic);
        let message = Message::from_diagnostic(diagnostic);
        self.registry.message(&object, &message);
    }

    /// Copy current state into the shared snapshot.
    pub fn publish(&self) {
        let snapshot = Snapshot {
            lighthouses: self.lighthouses.clone(),
            bodies: self
                .tracked
                .iter()
                .map(|(id, t)| {
                    let state = BodyState {
                        id: *id,
                        name: t.body.name.clone(),
                        driver_name: t.body.driver_name.clone(),
                        pose: t.released,
                        charge: t.body.charge,
                        charging: t.body.charging,
                    };
                    (*id, state)
                })
                .collect(),
            calibration: self.calibration.status(),
            stats: self.stats,
        };
        let mut guard = match self.shared.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = snapshot;
    }

    /// Close open frames, release held poses and publish a final snapshot.
    ///
    /// Returns the lighthouse poses to persist when calibration produced new ones.
    pub fn finish(&mut self) -> Option<CalibrationStore> {
        for frame in self.aggregator.flush() {
            self.process_frame(frame);
        }
        let ids: Vec<ObjectId> = self.tracked.keys().copied().collect();
        for id in ids {
            let released = match self.tracked.get_mut(&id) {
                Some(t) => t.reorder.flush(),
                None => continue,
            };
            self.release(id, released);
        }
        self.publish();
        log::info!(
            "Pipeline finished: {} events, {} frames, {} poses, {} diagnostics",
            self.stats.events,
            self.stats.frames,
            self.stats.poses,
            self.stats.diagnostics
        );
        if !self.store_dirty {
            return None;
        }
        let lighthouses = self
            .lighthouses
            .iter()
            .filter_map(|(id, info)| {
                info.pose.map(|pose| {
                    (
                        *id,
                        StoredLighthouse {
                            pose,
                            calibration: info.calibration,
                        },
                    )
                })
            })
            .collect();
        Some(CalibrationStore { lighthouses })
    }

    fn on_timecode(&mut self, tc: u64) {
        self.last_timecode = self.last_timecode.max(tc);
        if self.calibration_pending {
            self.calibration_pending = false;
            let events = self.calibration.start(tc);
            self.apply_calibration(events);
        }
        let events = self.calibration.tick(tc);
        self.apply_calibration(events);
    }

    fn ensure_body(&mut self, object: ObjectId) -> bool {
        if self.tracked.contains_key(&object) {
            return true;
        }
        match DevicePreset::from_codename(&object.name()) {
            Some(preset) => {
                log::info!("Unannounced device {}, using {} preset", object, preset.codename());
                self.register_body(RigidBody::preset(preset));
                true
            }
            None => false,
        }
    }

    fn on_light(&mut self, hit: LightHit) {
        self.registry.light(&hit.object.name(), &hit);
        if !self.ensure_body(hit.object) {
            log::trace!("Light from unknown object {}", hit.object);
            return;
        }
        let out = self.aggregator.on_hit(hit);
        for diagnostic in out.diagnostics {
            self.report_diagnostic(diagnostic);
        }
        for frame in out.frames {
            self.process_frame(frame);
        }
    }

    fn on_sync(&mut self, pulse: SyncPulse) {
        self.registry.sync(&pulse.object.name(), &pulse);
        self.ensure_body(pulse.object);
        let lh = pulse.lighthouse;
        if self.disabled_lighthouse == Some(lh) {
            return;
        }
        let Some(code) = SyncCode::from_pulse_length(pulse.pulse_length) else {
            log::trace!("Pulse of {} ticks on lighthouse {} is not a sync flash", pulse.pulse_length, lh);
            return;
        };

        if !self.lighthouses.contains_key(&lh) {
            log::info!("Detected lighthouse {}", lh);
            let info = LighthouseInfo::new(lh);
            self.registry.lighthouse(&info);
            self.lighthouses.insert(lh, info);
        }

        match self.sync_source.get(&lh) {
            Some(&(source, _)) if source != pulse.object => return,
            Some(&(_, last)) if pulse.timecode.saturating_sub(last) < SYNC_DEDUP_TICKS && pulse.timecode >= last => {
                return;
            }
            _ => {}
        }
        self.sync_source.insert(lh, (pulse.object, pulse.timecode));

        self.push_ootx_bit(lh, code.data, pulse.timecode);

        let mut frames = self.aggregator.advance(pulse.timecode);
        if !code.skip {
            frames.extend(self.aggregator.on_sync(lh, code.axis, pulse.timecode));
        }
        for frame in frames {
            self.process_frame(frame);
        }
    }

    fn push_ootx_bit(&mut self, lh: LighthouseId, bit: bool, timecode: u64) {
        let tolerant = self.ootx_tolerant;
        let decoder = self
            .decoders
            .entry(lh)
            .or_insert_with(|| OotxDecoder::new(lh, tolerant));
        match decoder.push_bit(bit) {
            Ok(None) => {}
            Ok(Some(payload)) => match LighthouseCalibration::parse(&payload) {
                Some(calibration) => self.on_ootx(lh, calibration, timecode),
                None => log::warn!("Lighthouse {}: OOTX payload of {} bytes is not a calibration block", lh, payload.len()),
            },
            Err(e) => self.report_diagnostic(Diagnostic::SyncError {
                lighthouse: lh,
                detail: e.to_string(),
            }),
        }
    }

    fn on_ootx(&mut self, lh: LighthouseId, calibration: LighthouseCalibration, timecode: u64) {
        let info = self.lighthouses.entry(lh).or_insert_with(|| LighthouseInfo::new(lh));
        let changed = info.calibration != Some(calibration);
        info.calibration = Some(calibration);
        if info.status == LighthouseStatus::Detected {
            info.status = LighthouseStatus::Decoded;
        }
        if changed {
            log::info!("Lighthouse {}: OOTX calibration decoded (serial {:08x})", lh, calibration.id);
            let info = info.clone();
            self.registry.lighthouse(&info);
            if info.pose.is_some() {
                self.store_dirty = true;
            }
        }
        let events = self.calibration.on_ootx(lh, timecode);
        self.apply_calibration(events);
    }

    fn on_imu(&mut self, sample: ImuSample) {
        let name = sample.object.name();
        self.registry.raw_imu(&name, &sample);
        if !self.ensure_body(sample.object) {
            return;
        }
        let Some(t) = self.tracked.get_mut(&sample.object) else {
            return;
        };
        let calibrated = t.body.imu_calibration.apply(&sample);
        let fused = t.fusion.on_imu(&calibrated);
        self.registry.imu(&name, &calibrated);
        if let Some(pose) = fused {
            self.emit(pose);
        }
    }

    fn on_button(&mut self, button: ButtonEvent) {
        self.registry.button(&button.object.name(), &button);
    }

    fn on_device(&mut self, device: DeviceAnnouncement) {
        let name = device.object.name();
        self.registry.config(&name, &device);
        match RigidBody::from_htc_json(&name, &device.driver, &device.config_json) {
            Ok(body) => self.register_body(body),
            Err(e) => {
                log::warn!("Rejected device config for {}: {}", name, e);
                let message = Message {
                    level: crate::types::MessageLevel::Error,
                    text: e.to_string(),
                    diagnostic: None,
                };
                self.registry.message(&name, &message);
            }
        }
    }

    fn process_frame(&mut self, frame: SweepFrame) {
        if frame.is_empty() && frame.late.is_empty() {
            log::trace!("Empty sweep on lighthouse {} {} epoch {}", frame.lighthouse, frame.axis, frame.epoch);
            return;
        }
        self.stats.frames += 1;
        let resolved = {
            let ctx = DisambiguationContext {
                bodies: &self.bodies,
                lighthouses: &self.lighthouses,
            };
            self.disambiguator.resolve(&frame, &ctx)
        };
        let sweep = match resolved {
            Ok(sweep) => sweep,
            Err(ambiguous) => {
                self.stats.ambiguous_frames += 1;
                log::debug!(
                    "Dropping lighthouse {} {} epoch {} ({} hits) for pose purposes",
                    frame.lighthouse,
                    frame.axis,
                    frame.epoch,
                    frame.len()
                );
                self.report_diagnostic(ambiguous.into());
                return;
            }
        };
        log::trace!(
            "Resolved lighthouse {} {} epoch {}: {} angles, {} rejected",
            sweep.lighthouse,
            sweep.axis,
            sweep.epoch,
            sweep.angles.len(),
            sweep.rejected
        );

        for angle in &sweep.angles {
            self.registry.angle(&angle.object.name(), angle);
            if let Some(t) = self.tracked.get_mut(&angle.object) {
                t.angles.insert((angle.lighthouse, angle.sensor, angle.axis), *angle);
            }
        }

        let events = self.calibration.on_sweep(&sweep, &self.bodies);
        self.apply_calibration(events);
        self.solve_objects(&sweep);
    }

    fn solve_objects(&mut self, sweep: &ResolvedSweep) {
        let posed: BTreeMap<LighthouseId, Pose> = self
            .lighthouses
            .iter()
            .filter_map(|(id, info)| info.pose.map(|p| (*id, p)))
            .collect();
        if posed.is_empty() {
            return;
        }
        for object in sweep.objects() {
            self.solve_body(object, sweep.timecode, &posed);
        }
    }

    fn solve_body(&mut self, object: ObjectId, now: u64, posed: &BTreeMap<LighthouseId, Pose>) {
        let Some(t) = self.tracked.get_mut(&object) else {
            return;
        };
        t.angles.retain(|_, a| now.saturating_sub(a.timecode) <= ANGLE_MAX_AGE_TICKS);
        let angles: Vec<AngleMeasurement> = t
            .angles
            .values()
            .filter(|a| posed.contains_key(&a.lighthouse))
            .copied()
            .collect();
        if angles.len() < MIN_OBSERVATIONS {
            return;
        }

        self.stats.solves += 1;
        let budget = SolveBudget::with_timeout(TRACKING_MAX_ITERATIONS, TRACKING_SOLVE_TIMEOUT);
        let seeded: Pose;
        let mut input = SolveInput {
            body: &t.body,
            angles: &angles,
            lighthouses: posed,
            seed: t.body.pose.as_ref(),
            budget,
        };
        if self.solver.requires_seed() && input.seed.is_none() {
            match self.seed_solver.solve(&input) {
                Ok(pose) => {
                    seeded = pose;
                    input.seed = Some(&seeded);
                }
                Err(e) => {
                    let kind = self.seed_solver.kind();
                    self.solve_failed(object, kind, e);
                    return;
                }
            }
        }
        let result = self.solver.solve(&input);
        match result {
            Ok(pose) => {
                let Some(t) = self.tracked.get_mut(&object) else {
                    return;
                };
                t.body.pose = Some(pose);
                t.body.pose_timecode = Some(now);
                if let Some(body) = self.bodies.get_mut(&object) {
                    body.pose = Some(pose);
                    body.pose_timecode = Some(now);
                }
                if let Some(out) = t.fusion.on_solved_pose(now, &pose) {
                    self.emit(out);
                }
            }
            Err(e) => {
                let kind = self.solver.kind();
                self.solve_failed(object, kind, e);
            }
        }
    }

    fn solve_failed(&mut self, object: ObjectId, solver: SolverKind, error: SolveError) {
        self.stats.solve_failures += 1;
        let diagnostic = match error {
            SolveError::MissingSeed => Diagnostic::MissingSeed { object, solver },
            SolveError::Failed(failure) => {
                // A failed solve invalidates the prior; the next one starts over.
                self.clear_prior(object, &failure);
                Diagnostic::SolveFailure {
                    object,
                    solver,
                    failure,
                }
            }
        };
        self.report_diagnostic(diagnostic);
    }

    fn clear_prior(&mut self, object: ObjectId, failure: &SolveFailure) {
        log::trace!("{}: clearing prior pose after {}", object, failure);
        if let Some(t) = self.tracked.get_mut(&object) {
            t.body.pose = None;
        }
        if let Some(body) = self.bodies.get_mut(&object) {
            body.pose = None;
        }
    }

    fn emit(&mut self, pose: TimedPose) {
        let object = pose.object;
        let Some(t) = self.tracked.get_mut(&object) else {
            return;
        };
        match t.reorder.push(pose.timecode, pose) {
            Ok(released) => self.release(object, released),
            Err(late) => {
                self.stats.late_poses += 1;
                self.report_diagnostic(Diagnostic::LateArrival {
                    kind: LateKind::Pose,
                    object,
                    timecode: late.timestamp,
                });
            }
        }
    }

    fn release(&mut self, object: ObjectId, released: Vec<(u64, TimedPose)>) {
        if released.is_empty() {
            return;
        }
        let name = object.name();
        for (_, pose) in released {
            self.stats.poses += 1;
            self.registry.pose(&name, &pose);
            if let Some(t) = self.tracked.get_mut(&object) {
                t.released = Some(pose);
            }
        }
    }

    fn apply_calibration(&mut self, events: Vec<CalibrationEvent>) {
        for event in events {
            match event {
                CalibrationEvent::Status(status) => {
                    let object = self.calibration.watchman().map(|w| w.name()).unwrap_or_default();
                    self.registry.calibration(&object, status);
                    self.registry
                        .message(&object, &Message::info(format!("Calibration state {}", status)));
                }
                CalibrationEvent::Diagnostic(d) => self.report_diagnostic(d),
                CalibrationEvent::LighthousePoses(poses) => self.set_lighthouse_poses(poses),
            }
        }
    }

    fn set_lighthouse_poses(&mut self, poses: BTreeMap<LighthouseId, Pose>) {
        for (id, pose) in poses {
            let info = self.lighthouses.entry(id).or_insert_with(|| LighthouseInfo::new(id));
            info.pose = Some(pose);
            info.status = LighthouseStatus::Posed;
            let info = info.clone();
            self.registry.lighthouse(&info);
        }
        self.store_dirty = true;
        // The world frame moved; estimates from the old one are meaningless.
        for t in self.tracked.values_mut() {
            t.fusion.reset();
            t.body.pose = None;
        }
        for body in self.bodies.values_mut() {
            body.pose = None;
        }
    }
}

fn diagnostic_object(diagnostic: &Diagnostic) -> String {
    match diagnostic {
        Diagnostic::LateArrival { object, .. }
        | Diagnostic::MissingSeed { object, .. }
        | Diagnostic::SolveFailure { object, .. } => object.name(),
        Diagnostic::AmbiguousAssignment { lighthouse, .. } | Diagnostic::SyncError { lighthouse, .. } => {
            crate::report::lighthouse_name(*lighthouse)
        }
        Diagnostic::QueueOverflow { .. } | Diagnostic::CalibrationTimeout { .. } => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationStatus;
    use crate::config::Toggle;
    use crate::ootx;
    use crate::poser::fixtures;
    use crate::protocol::{angle_to_ticks, SYNC_BASE_TICKS};
    use crate::report::{ChannelReporter, EventStream, ReportEvent, ReportFilter};
    use crate::types::{ImuPresence, SweepAxis};

    fn pipeline(config: &TrackerConfig, store: Option<&CalibrationStore>) -> (Pipeline, EventStream) {
        let (reporter, stream) = ChannelReporter::new(100_000);
        let mut registry = ReporterRegistry::new();
        registry.register(Box::new(reporter), ReportFilter::all());
        (Pipeline::new(config, registry, store), stream)
    }

    fn stored() -> CalibrationStore {
        CalibrationStore {
            lighthouses: fixtures::lighthouses()
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
        }
    }

    fn sync(object: ObjectId, lighthouse: LighthouseId, axis: SweepAxis, timecode: u64) -> Event {
        Event::Sync(SyncPulse {
            object,
            lighthouse,
            timecode,
            pulse_length: SyncCode {
                axis,
                data: false,
                skip: false,
            }
            .pulse_length(),
        })
    }

    /// One sweep of every lighthouse axis seeing `angles`, starting at `t0`.
    fn sweep_events(angles: &[AngleMeasurement], t0: u64) -> (Vec<Event>, u64) {
        let mut events = Vec::new();
        let mut t = t0;
        for lh in [0u8, 1] {
            for axis in [SweepAxis::Horizontal, SweepAxis::Vertical] {
                let object = angles[0].object;
                events.push(sync(object, lh, axis, t));
                for a in angles.iter().filter(|a| a.lighthouse == lh && a.axis == axis) {
                    let ticks = angle_to_ticks(a.angle);
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
                t += SWEEP_PERIOD_TICKS;
            }
        }
        (events, t)
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
    fn test_tracks_with_stored_lighthouses() {
        let config = TrackerConfig {
            use_imu: Toggle::No,
            ..TrackerConfig::default()
        };
        let store = stored();
        let (mut p, stream) = pipeline(&config, Some(&store));
        assert_eq!(p.calibration_status(), CalibrationStatus::NotCalibrating);
        let body = fixtures::cube_body();
        let id = body.id;
        p.register_body(body.clone());

        let truth = fixtures::truth();
        let angles = fixtures::synthesize(&body, &truth, &fixtures::lighthouses());
        let (events, _) = sweep_events(&angles, 1_000);
        for e in events {
            p.handle(e);
        }
        p.finish();

        let out = poses(&stream);
        assert!(!out.is_empty(), "no poses emitted");
        let last = out.last().unwrap();
        assert_eq!(last.object, id);
        let (dp, dr) = last.pose.distance_to(&truth);
        assert!(dp < 1e-3 && dr < 1e-3, "pose off by {} m, {} rad", dp, dr);
        for pair in out.windows(2) {
            assert!(pair[0].timecode <= pair[1].timecode);
        }
        // The stored calibration is unchanged, so nothing needs saving.
        assert!(p.finish().is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let (mut p, _stream) = pipeline(&TrackerConfig::default(), Some(&stored()));
        let shared = p.shared();
        p.register_body(fixtures::cube_body());
        p.publish();
        let before = shared.read().unwrap().clone();
        p.handle(Event::Status {
            object: fixtures::cube_body().id,
            charge: 80,
            charging: true,
        });
        assert_eq!(before.bodies.values().next().unwrap().charge, 0);
        p.publish();
        assert_eq!(shared.read().unwrap().bodies.values().next().unwrap().charge, 80);
    }

    #[test]
    fn test_calibration_starts_on_first_data() {
        let (mut p, stream) = pipeline(&TrackerConfig::default(), None);
        assert_eq!(p.calibration_status(), CalibrationStatus::NotCalibrating);
        let object = ObjectId::from_name("WM0").unwrap();
        p.handle(sync(object, 0, SweepAxis::Horizontal, 5_000_000));
        assert_eq!(p.calibration_status(), CalibrationStatus::CollectingOotx);
        // The preset body was registered from its codename.
        assert!(p.body(object).is_some());
        assert!(stream
            .drain()
            .iter()
            .any(|e| matches!(e, ReportEvent::Calibration { status: CalibrationStatus::CollectingOotx, .. })));
    }

    #[test]
    fn test_ootx_from_sync_pulses() {
        let (mut p, _stream) = pipeline(&TrackerConfig::default(), None);
        let object = ObjectId::from_name("WM0").unwrap();
        let calibration = LighthouseCalibration {
            fw_version: 0x0246,
            id: 0xdead_beef,
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
        };
        let bits = ootx::encode_frame(&calibration.to_payload());
        let mut t = 1_000;
        for bit in bits {
            let code = SyncCode {
                axis: SweepAxis::Horizontal,
                data: bit,
                skip: false,
            };
            p.handle(Event::Sync(SyncPulse {
                object,
                lighthouse: 0,
                timecode: t,
                pulse_length: code.pulse_length(),
            }));
            t += SWEEP_PERIOD_TICKS;
        }
        let info = &p.lighthouses()[&0];
        assert_eq!(info.status, LighthouseStatus::Decoded);
        assert_eq!(info.calibration.map(|c| c.id), Some(0xdead_beef));
    }

    #[test]
    fn test_duplicate_sync_is_ignored() {
        let (mut p, _stream) = pipeline(&TrackerConfig::default(), Some(&stored()));
        let wm0 = ObjectId::from_name("WM0").unwrap();
        let wm1 = ObjectId::from_name("WM1").unwrap();
        p.handle(sync(wm0, 0, SweepAxis::Horizontal, 1_000));
        p.handle(sync(wm0, 0, SweepAxis::Horizontal, 1_100));
        p.handle(sync(wm1, 0, SweepAxis::Horizontal, 90_000));
        assert_eq!(p.aggregator.open_frames(), 1);
        assert_eq!(p.sync_source[&0], (wm0, 1_000));
    }

    #[test]
    fn test_bad_device_config_is_reported() {
        let (mut p, stream) = pipeline(&TrackerConfig::default(), None);
        let object = ObjectId::from_name("XX9").unwrap();
        p.handle(Event::Device(DeviceAnnouncement {
            object,
            driver: "Custom".into(),
            config_json: "not json".into(),
        }));
        assert!(p.body(object).is_none());
        assert!(stream.drain().iter().any(|e| matches!(
            e,
            ReportEvent::Message { message, .. } if message.level == crate::types::MessageLevel::Error
        )));
    }

    #[test]
    fn test_imu_reported_raw_and_calibrated() {
        let (mut p, stream) = pipeline(&TrackerConfig::default(), Some(&stored()));
        let mut body = fixtures::cube_body();
        body.imu_calibration.gyro_bias = [0.5, 0.0, 0.0];
        let id = body.id;
        p.register_body(body);
        p.handle(Event::Imu(ImuSample {
            object: id,
            accel: [0.0, 0.0, 1.0],
            gyro: [0.5, 0.0, 0.0],
            mag: [0.0; 3],
            timecode: 10,
            presence: ImuPresence::ACCEL | ImuPresence::GYRO,
        }));
        let imu: Vec<ImuSample> = stream
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ReportEvent::Imu { sample, .. } => Some(sample),
                _ => None,
            })
            .collect();
        assert_eq!(imu.len(), 1);
        assert!(imu[0].gyro[0].abs() < 1e-12);
    }

    #[test]
    fn test_ambiguous_frame_is_reported() {
        let config = TrackerConfig {
            disambiguator: crate::config::DisambiguatorChoice::Charles,
            ..TrackerConfig::default()
        };
        let (mut p, stream) = pipeline(&config, Some(&stored()));
        let body = fixtures::cube_body();
        let id = body.id;
        p.register_body(body);
        let start = 1_000u64;
        p.handle(sync(id, 0, SweepAxis::Horizontal, start));
        // Pulse lengths far outside the sweep range.
        for sensor in 0..3 {
            p.handle(Event::Light(LightHit {
                object: id,
                sensor,
                axis: SweepAxis::Horizontal,
                time_in_sweep: 200_000,
                timecode: start + 200_000,
                pulse_length: SYNC_BASE_TICKS,
                lighthouse: 0,
            }));
        }
        p.finish();
        assert!(p.stats().ambiguous_frames >= 1);
        assert!(stream.drain().iter().any(|e| matches!(
            e,
            ReportEvent::Message { message, .. }
                if matches!(message.diagnostic, Some(Diagnostic::AmbiguousAssignment { .. }))
        )));
    }
}
