//! Resolves which lighthouse and sweep axis produced each hit of a sweep frame.

use crate::aggregator::SweepFrame;
use crate::device::RigidBody;
use crate::error::Diagnostic;
use crate::math;
use crate::protocol::{self, TIMEBASE_HZ};
use crate::types::{AngleMeasurement, LightHit, LighthouseId, LighthouseInfo, ObjectId, SweepAxis};
use std::collections::{BTreeMap, BTreeSet};

/// Widest plausible sweep angle from the optical axis.
pub const MAX_SWEEP_ANGLE: f64 = 70.0 * std::f64::consts::PI / 180.0;

/// Closest a body is assumed to get to a lighthouse, in meters.
const MIN_RANGE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisambiguatorKind {
    FastHeuristic,
    RobustIterative,
    #[default]
    StateBased,
}

impl DisambiguatorKind {
    pub fn create(self) -> Box<dyn Disambiguator> {
        match self {
            DisambiguatorKind::FastHeuristic => Box::new(FastHeuristic::default()),
            DisambiguatorKind::RobustIterative => Box::new(RobustIterative::default()),
            DisambiguatorKind::StateBased => Box::new(StateBased::default()),
        }
    }
}

/// Read-only view of what the session knows, borrowed for one resolve call.
pub struct DisambiguationContext<'a> {
    pub bodies: &'a BTreeMap<ObjectId, RigidBody>,
    pub lighthouses: &'a BTreeMap<LighthouseId, LighthouseInfo>,
}

/// A sweep frame with every accepted hit converted to an angle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSweep {
    pub lighthouse: LighthouseId,
    pub axis: SweepAxis,
    pub epoch: u64,
    pub complete: bool,
    pub angles: Vec<AngleMeasurement>,
    pub confidence: f64,
    pub rejected: usize,
    /// Latest timecode among the accepted hits.
    pub timecode: u64,
}

impl ResolvedSweep {
    pub fn objects(&self) -> BTreeSet<ObjectId> {
        self.angles.iter().map(|a| a.object).collect()
    }

    pub fn angles_for(&self, object: ObjectId) -> impl Iterator<Item = &AngleMeasurement> {
        self.angles.iter().filter(move |a| a.object == object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbiguousAssignment {
    pub lighthouse: LighthouseId,
    pub axis: SweepAxis,
    pub confidence: f64,
    pub threshold: f64,
}

impl From<AmbiguousAssignment> for Diagnostic {
    fn from(a: AmbiguousAssignment) -> Diagnostic {
        Diagnostic::AmbiguousAssignment {
            lighthouse: a.lighthouse,
            axis: a.axis,
            confidence: a.confidence,
            threshold: a.threshold,
        }
    }
}

pub trait Disambiguator: Send {
    fn kind(&self) -> DisambiguatorKind;

    fn resolve(
        &mut self,
        frame: &SweepFrame,
        ctx: &DisambiguationContext<'_>,
    ) -> Result<ResolvedSweep, AmbiguousAssignment>;
}

/// Every hit of a frame, including late hits routed into it.
fn frame_hits(frame: &SweepFrame) -> Vec<LightHit> {
    frame.hits.values().chain(frame.late.iter()).copied().collect()
}

fn to_measurement(hit: &LightHit, lighthouse: LighthouseId, axis: SweepAxis, ctx: &DisambiguationContext<'_>) -> AngleMeasurement {
    let timebase = ctx
        .bodies
        .get(&hit.object)
        .map(|b| b.timebase_hz)
        .unwrap_or(TIMEBASE_HZ);
    AngleMeasurement {
        object: hit.object,
        sensor: hit.sensor,
        axis,
        timecode: hit.timecode,
        pulse_length_s: protocol::ticks_to_seconds(hit.pulse_length as u64, timebase),
        angle: protocol::ticks_to_angle(hit.time_in_sweep),
        lighthouse,
    }
}

/// Pulse length, field of view and sensor index checks shared by every strategy.
fn is_plausible(hit: &LightHit, ctx: &DisambiguationContext<'_>) -> bool {
    if !protocol::is_plausible_sweep_length(hit.pulse_length) {
        return false;
    }
    if protocol::ticks_to_angle(hit.time_in_sweep).abs() > MAX_SWEEP_ANGLE {
        return false;
    }
    match ctx.bodies.get(&hit.object) {
        Some(body) => (hit.sensor as usize) < body.sensor_count(),
        None => false,
    }
}

fn resolved(
    frame: &SweepFrame,
    lighthouse: LighthouseId,
    axis: SweepAxis,
    accepted: &[LightHit],
    total: usize,
    confidence: f64,
    ctx: &DisambiguationContext<'_>,
) -> ResolvedSweep {
    let angles: Vec<AngleMeasurement> = accepted
        .iter()
        .map(|h| to_measurement(h, lighthouse, axis, ctx))
        .collect();
    ResolvedSweep {
        lighthouse,
        axis,
        epoch: frame.epoch,
        complete: frame.complete,
        timecode: accepted.iter().map(|h| h.timecode).max().unwrap_or(frame.start),
        rejected: total - angles.len(),
        angles,
        confidence,
    }
}

/// Trusts the capture labels and drops implausible hits.
#[derive(Debug, Clone)]
pub struct FastHeuristic {
    pub threshold: f64,
}

impl Default for FastHeuristic {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl Disambiguator for FastHeuristic {
    fn kind(&self) -> DisambiguatorKind {
        DisambiguatorKind::FastHeuristic
    }

    fn resolve(
        &mut self,
        frame: &SweepFrame,
        ctx: &DisambiguationContext<'_>,
    ) -> Result<ResolvedSweep, AmbiguousAssignment> {
        let hits = frame_hits(frame);
        let accepted: Vec<LightHit> = hits.iter().filter(|h| is_plausible(h, ctx)).copied().collect();
        let confidence = if hits.is_empty() {
            0.0
        } else {
            accepted.len() as f64 / hits.len() as f64
        };
        if confidence < self.threshold {
            return Err(AmbiguousAssignment {
                lighthouse: frame.lighthouse,
                axis: frame.axis,
                confidence,
                threshold: self.threshold,
            });
        }
        Ok(resolved(frame, frame.lighthouse, frame.axis, &accepted, hits.len(), confidence, ctx))
    }
}

// Hypothesis score weights. They sum to 1.0 for a perfect hypothesis.
const W_LABEL_LIGHTHOUSE: f64 = 0.3;
const W_LABEL_AXIS: f64 = 0.2;
const W_HISTORY: f64 = 0.1;
const W_GEOMETRY: f64 = 0.4;

#[derive(Debug, Clone)]
struct Hypothesis {
    lighthouse: LighthouseId,
    axis: SweepAxis,
    score: f64,
    inliers: Vec<LightHit>,
}

/// Scores (lighthouse, axis) hypotheses against sensor geometry and assignment history.
#[derive(Debug, Clone)]
pub struct RobustIterative {
    pub threshold: f64,
    /// Required score gap between the best and runner-up hypothesis.
    pub min_margin: f64,
    /// Outlier-removal rounds per hypothesis.
    pub max_rounds: usize,
    /// Residual accepted when a predicted angle is available.
    pub residual_tolerance: f64,
    last_axis: BTreeMap<LighthouseId, SweepAxis>,
}

impl Default for RobustIterative {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_margin: 0.05,
            max_rounds: 8,
            residual_tolerance: 0.1,
            last_axis: BTreeMap::new(),
        }
    }
}

impl RobustIterative {
    fn candidates(frame: &SweepFrame, ctx: &DisambiguationContext<'_>) -> Vec<(LighthouseId, SweepAxis)> {
        let mut lighthouses: BTreeSet<LighthouseId> = ctx.lighthouses.keys().copied().collect();
        lighthouses.insert(frame.lighthouse);
        lighthouses
            .into_iter()
            .flat_map(|lh| [(lh, SweepAxis::Horizontal), (lh, SweepAxis::Vertical)])
            .collect()
    }

    /// Predicted angle for a hit if both the lighthouse and body poses are known.
    fn predicted(
        hit: &LightHit,
        lighthouse: LighthouseId,
        axis: SweepAxis,
        ctx: &DisambiguationContext<'_>,
    ) -> Option<f64> {
        let lh_pose = ctx.lighthouses.get(&lighthouse)?.pose?;
        let body = ctx.bodies.get(&hit.object)?;
        let body_pose = body.pose?;
        let world = body_pose.to_isometry() * nalgebra::Point3::from(body.sensor_point(hit.sensor)?);
        let local = lh_pose.to_isometry().inverse() * world;
        math::predict_angle(axis, &local.coords)
    }

    /// Iteratively drop the hit most at odds with the rest until the set is consistent.
    fn consistent_subset(
        &self,
        hits: &[LightHit],
        lighthouse: LighthouseId,
        axis: SweepAxis,
        ctx: &DisambiguationContext<'_>,
        use_priors: bool,
    ) -> Vec<LightHit> {
        let mut set: Vec<LightHit> = hits.to_vec();

        if use_priors {
            let predictions: Vec<Option<f64>> = set.iter().map(|h| Self::predicted(h, lighthouse, axis, ctx)).collect();
            if predictions.iter().all(|p| p.is_some()) && !set.is_empty() {
                return set
                    .into_iter()
                    .zip(predictions)
                    .filter(|(h, p)| {
                        let angle = protocol::ticks_to_angle(h.time_in_sweep);
                        p.map(|p| math::wrap_angle(angle - p).abs() <= self.residual_tolerance)
                            .unwrap_or(false)
                    })
                    .map(|(h, _)| h)
                    .collect();
            }
        }

        for _ in 0..self.max_rounds {
            let violations: Vec<usize> = set
                .iter()
                .map(|a| set.iter().filter(|b| Self::violates(a, b, ctx)).count())
                .collect();
            let Some((worst, &count)) = violations.iter().enumerate().max_by_key(|(_, c)| **c) else {
                break;
            };
            if count == 0 {
                break;
            }
            set.remove(worst);
        }
        set
    }

    /// Two hits on one body cannot be further apart in angle than the sensors subtend at `MIN_RANGE`.
    ///
    /// The bound holds for any lighthouse and axis, so without priors the
    /// geometry term scores every hypothesis alike and only the labels and
    /// history separate them.
    fn violates(a: &LightHit, b: &LightHit, ctx: &DisambiguationContext<'_>) -> bool {
        if a.object != b.object || a.sensor == b.sensor {
            return false;
        }
        let Some(distance) = ctx.bodies.get(&a.object).and_then(|body| body.sensor_distance(a.sensor, b.sensor)) else {
            return false;
        };
        let bound = 2.0 * (distance / (2.0 * MIN_RANGE)).atan() + 0.02;
        let delta = protocol::ticks_to_angle(a.time_in_sweep) - protocol::ticks_to_angle(b.time_in_sweep);
        delta.abs() > bound
    }

    fn score(
        &self,
        frame: &SweepFrame,
        hits: &[LightHit],
        lighthouse: LighthouseId,
        axis: SweepAxis,
        ctx: &DisambiguationContext<'_>,
        use_priors: bool,
    ) -> Hypothesis {
        let mut score = 0.0;
        if lighthouse == frame.lighthouse {
            score += W_LABEL_LIGHTHOUSE;
        }
        if axis == frame.axis {
            score += W_LABEL_AXIS;
        }
        score += match self.last_axis.get(&lighthouse) {
            Some(last) if *last != axis => W_HISTORY,
            Some(_) => 0.0,
            None => W_HISTORY / 2.0,
        };
        let inliers = self.consistent_subset(hits, lighthouse, axis, ctx, use_priors);
        if !hits.is_empty() {
            score += W_GEOMETRY * inliers.len() as f64 / hits.len() as f64;
        }
        Hypothesis {
            lighthouse,
            axis,
            score,
            inliers,
        }
    }

    fn resolve_with(
        &mut self,
        frame: &SweepFrame,
        ctx: &DisambiguationContext<'_>,
        use_priors: bool,
    ) -> Result<ResolvedSweep, AmbiguousAssignment> {
        let all = frame_hits(frame);
        let plausible: Vec<LightHit> = all.iter().filter(|h| is_plausible(h, ctx)).copied().collect();

        let mut hypotheses: Vec<Hypothesis> = Self::candidates(frame, ctx)
            .into_iter()
            .map(|(lh, axis)| self.score(frame, &plausible, lh, axis, ctx, use_priors))
            .collect();
        hypotheses.sort_by(|a, b| b.score.total_cmp(&a.score));

        let ambiguous = |confidence: f64| AmbiguousAssignment {
            lighthouse: frame.lighthouse,
            axis: frame.axis,
            confidence,
            threshold: self.threshold,
        };
        let Some(best) = hypotheses.first() else {
            return Err(ambiguous(0.0));
        };
        let margin = hypotheses.get(1).map(|h| best.score - h.score).unwrap_or(best.score);
        log::trace!(
            "robust: lh{} {} score {:.2} margin {:.2} ({}/{} inliers)",
            best.lighthouse,
            best.axis,
            best.score,
            margin,
            best.inliers.len(),
            all.len()
        );
        if best.score < self.threshold || margin < self.min_margin || best.inliers.is_empty() {
            return Err(ambiguous(best.score));
        }
        self.last_axis.insert(best.lighthouse, best.axis);
        Ok(resolved(frame, best.lighthouse, best.axis, &best.inliers, all.len(), best.score, ctx))
    }

    fn remember(&mut self, lighthouse: LighthouseId, axis: SweepAxis) {
        self.last_axis.insert(lighthouse, axis);
    }
}

impl Disambiguator for RobustIterative {
    fn kind(&self) -> DisambiguatorKind {
        DisambiguatorKind::RobustIterative
    }

    fn resolve(
        &mut self,
        frame: &SweepFrame,
        ctx: &DisambiguationContext<'_>,
    ) -> Result<ResolvedSweep, AmbiguousAssignment> {
        self.resolve_with(frame, ctx, true)
    }
}

/// Predicts angles from the prior pose and keeps hits inside a tolerance window.
///
/// Falls back to [`RobustIterative`] without priors when a pose is missing or
/// the prior no longer explains the frame.
#[derive(Debug, Clone)]
pub struct StateBased {
    pub tolerance: f64,
    pub threshold: f64,
    fallback: RobustIterative,
}

impl Default for StateBased {
    fn default() -> Self {
        Self {
            tolerance: 0.05,
            threshold: 0.6,
            fallback: RobustIterative::default(),
        }
    }
}

impl StateBased {
    fn has_priors(frame: &SweepFrame, ctx: &DisambiguationContext<'_>) -> bool {
        let lighthouse_posed = ctx
            .lighthouses
            .get(&frame.lighthouse)
            .is_some_and(|lh| lh.pose.is_some());
        lighthouse_posed
            && frame
                .objects()
                .iter()
                .all(|o| ctx.bodies.get(o).is_some_and(|b| b.pose.is_some()))
    }
}

impl Disambiguator for StateBased {
    fn kind(&self) -> DisambiguatorKind {
        DisambiguatorKind::StateBased
    }

    fn resolve(
        &mut self,
        frame: &SweepFrame,
        ctx: &DisambiguationContext<'_>,
    ) -> Result<ResolvedSweep, AmbiguousAssignment> {
        if !Self::has_priors(frame, ctx) {
            return self.fallback.resolve_with(frame, ctx, false);
        }
        let all = frame_hits(frame);
        let plausible: Vec<LightHit> = all.iter().filter(|h| is_plausible(h, ctx)).copied().collect();

        let mut best: Option<(LighthouseId, SweepAxis, Vec<LightHit>)> = None;
        let mut candidates = vec![(frame.lighthouse, frame.axis), (frame.lighthouse, frame.axis.other())];
        candidates.extend(
            ctx.lighthouses
                .iter()
                .filter(|(id, lh)| **id != frame.lighthouse && lh.pose.is_some())
                .flat_map(|(id, _)| [(*id, SweepAxis::Horizontal), (*id, SweepAxis::Vertical)]),
        );
        for (lh, axis) in candidates {
            let inliers: Vec<LightHit> = plausible
                .iter()
                .filter(|h| {
                    RobustIterative::predicted(h, lh, axis, ctx).is_some_and(|p| {
                        math::wrap_angle(protocol::ticks_to_angle(h.time_in_sweep) - p).abs() <= self.tolerance
                    })
                })
                .copied()
                .collect();
            // Candidates are ordered so ties keep the capture labels.
            if best.as_ref().map_or(true, |(_, _, b)| inliers.len() > b.len()) {
                best = Some((lh, axis, inliers));
            }
        }

        let Some((lighthouse, axis, inliers)) = best else {
            return self.fallback.resolve_with(frame, ctx, false);
        };
        let confidence = if all.is_empty() {
            0.0
        } else {
            inliers.len() as f64 / all.len() as f64
        };
        if confidence < self.threshold {
            log::debug!(
                "state-based: prior explains {:.0}% of lh{} {} epoch {}, falling back",
                confidence * 100.0,
                frame.lighthouse,
                frame.axis,
                frame.epoch
            );
            return self.fallback.resolve_with(frame, ctx, false);
        }
        self.fallback.remember(lighthouse, axis);
        Ok(resolved(frame, lighthouse, axis, &inliers, all.len(), confidence, ctx))
    }
}
