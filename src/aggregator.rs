//! Groups light hits into per-lighthouse, per-axis sweep frames.
//!
//! A frame is keyed by `(lighthouse, axis)` and numbered by epoch. It closes
//! when every sensor of every body visible to the lighthouse has reported, when
//! its deadline passes, or when the next sync pulse for the same key arrives.
//! Closed frames are frozen copies; nothing mutates them after hand-off.

use crate::error::{Diagnostic, LateKind};
use crate::protocol::SWEEP_PERIOD_TICKS;
use crate::types::{LightHit, LighthouseId, ObjectId, SensorId, SweepAxis};
use std::collections::{BTreeMap, BTreeSet};

pub type SensorKey = (ObjectId, SensorId);
type FrameKey = (LighthouseId, SweepAxis);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorConfig {
    /// Ticks after a frame opens before it is closed as incomplete.
    pub sweep_timeout: u64,
    /// Hits from this lighthouse index are ignored.
    pub disabled_lighthouse: Option<LighthouseId>,
    /// Late hits held per key while no frame is open.
    pub max_late_hits: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            sweep_timeout: SWEEP_PERIOD_TICKS,
            disabled_lighthouse: None,
            max_late_hits: 256,
        }
    }
}

/// A closed sweep: every hit one lighthouse axis produced during one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepFrame {
    pub lighthouse: LighthouseId,
    pub axis: SweepAxis,
    pub epoch: u64,
    pub start: u64,
    pub deadline: u64,
    pub hits: BTreeMap<SensorKey, LightHit>,
    /// Sensor count of the bodies visible when the frame closed.
    pub expected: usize,
    pub complete: bool,
    /// Hits that repeated a sensor already present in the frame.
    pub duplicates: usize,
    /// Hits from an earlier, already closed epoch routed into this frame.
    pub late: Vec<LightHit>,
}

impl SweepFrame {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn objects(&self) -> BTreeSet<ObjectId> {
        self.hits.keys().map(|(o, _)| *o).collect()
    }

    /// Most recent timecode among the frame's hits.
    pub fn latest_timecode(&self) -> u64 {
        self.hits
            .values()
            .map(|h| h.timecode)
            .max()
            .unwrap_or(self.start)
    }
}

#[derive(Debug)]
struct OpenFrame {
    epoch: u64,
    start: u64,
    deadline: u64,
    hits: BTreeMap<SensorKey, LightHit>,
    duplicates: usize,
    late: Vec<LightHit>,
}

/// What remains of a frame after it closes, for routing stragglers.
#[derive(Debug)]
struct ClosedWindow {
    start: u64,
    end: u64,
    deadline: u64,
    sensors: BTreeSet<SensorKey>,
}

impl ClosedWindow {
    /// A hit before the frame ended, or a repeat of one of its sensors
    /// before the frame's deadline, belongs to the closed epoch.
    fn claims(&self, hit: &LightHit) -> bool {
        hit.timecode < self.end
            || (hit.timecode >= self.start
                && hit.timecode < self.deadline
                && self.sensors.contains(&(hit.object, hit.sensor)))
    }
}

#[derive(Debug, Default)]
pub struct AggregatorOutput {
    pub frames: Vec<SweepFrame>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct SweepAggregator {
    config: AggregatorConfig,
    bodies: BTreeMap<ObjectId, usize>,
    visible: BTreeMap<LighthouseId, BTreeSet<ObjectId>>,
    open: BTreeMap<FrameKey, OpenFrame>,
    closed: BTreeMap<FrameKey, ClosedWindow>,
    next_epoch: BTreeMap<FrameKey, Vec<LightHit>>,
    epochs: BTreeMap<FrameKey, u64>,
}

impl SweepAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            bodies: BTreeMap::new(),
            visible: BTreeMap::new(),
            open: BTreeMap::new(),
            closed: BTreeMap::new(),
            next_epoch: BTreeMap::new(),
            epochs: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn register_body(&mut self, id: ObjectId, sensor_count: usize) {
        self.bodies.insert(id, sensor_count);
    }

    pub fn unregister_body(&mut self, id: ObjectId) {
        self.bodies.remove(&id);
        for seen in self.visible.values_mut() {
            seen.remove(&id);
        }
    }

    pub fn open_frames(&self) -> usize {
        self.open.len()
    }

    /// A sync pulse closes the open frame for its key and starts the next epoch.
    pub fn on_sync(&mut self, lighthouse: LighthouseId, axis: SweepAxis, timecode: u64) -> Vec<SweepFrame> {
        if self.config.disabled_lighthouse == Some(lighthouse) {
            return Vec::new();
        }
        let key = (lighthouse, axis);
        let mut out = Vec::new();
        out.extend(self.close(key, timecode));
        self.open_frame(key, timecode);
        out
    }

    pub fn on_hit(&mut self, hit: LightHit) -> AggregatorOutput {
        let mut out = AggregatorOutput::default();
        if self.config.disabled_lighthouse == Some(hit.lighthouse) {
            log::trace!("ignoring hit from disabled lighthouse {}", hit.lighthouse);
            return out;
        }
        if !self.bodies.contains_key(&hit.object) {
            log::trace!("ignoring hit from unregistered object {}", hit.object);
            return out;
        }
        let key = (hit.lighthouse, hit.axis);

        if let Some(open) = self.open.get(&key) {
            if hit.timecode > open.deadline {
                let deadline = open.deadline;
                out.frames.extend(self.close(key, deadline));
            }
        }

        let is_late = match (self.open.get(&key), self.closed.get(&key)) {
            (Some(open), _) => hit.timecode < open.start,
            (None, Some(window)) => window.claims(&hit),
            (None, None) => false,
        };
        if is_late {
            log::debug!(
                "late hit: {} sensor {} on lighthouse {} {} at {}",
                hit.object,
                hit.sensor,
                hit.lighthouse,
                hit.axis,
                hit.timecode
            );
            out.diagnostics.push(Diagnostic::LateArrival {
                kind: LateKind::Hit,
                object: hit.object,
                timecode: hit.timecode,
            });
            match self.open.get_mut(&key) {
                Some(open) => open.late.push(hit),
                None => {
                    let bucket = self.next_epoch.entry(key).or_default();
                    if bucket.len() >= self.config.max_late_hits {
                        log::warn!("late-hit bucket full for lighthouse {} {}, dropping oldest", key.0, key.1);
                        bucket.remove(0);
                    }
                    bucket.push(hit);
                }
            }
            return out;
        }

        if !self.open.contains_key(&key) {
            self.open_frame(key, hit.timecode);
        }
        if let Some(open) = self.open.get_mut(&key) {
            let sensor = (hit.object, hit.sensor);
            match open.hits.get_mut(&sensor) {
                Some(existing) => {
                    open.duplicates += 1;
                    if hit.pulse_length > existing.pulse_length {
                        *existing = hit;
                    }
                }
                None => {
                    open.hits.insert(sensor, hit);
                }
            }
        }
        self.visible.entry(hit.lighthouse).or_default().insert(hit.object);

        if self.is_complete(key) {
            out.frames.extend(self.close(key, hit.timecode));
        }
        out
    }

    /// Close every frame whose deadline is before `now`.
    pub fn advance(&mut self, now: u64) -> Vec<SweepFrame> {
        let expired: Vec<(FrameKey, u64)> = self
            .open
            .iter()
            .filter(|(_, f)| f.deadline < now)
            .map(|(k, f)| (*k, f.deadline))
            .collect();
        expired
            .into_iter()
            .filter_map(|(key, deadline)| self.close(key, deadline))
            .collect()
    }

    /// Close everything still open.
    pub fn flush(&mut self) -> Vec<SweepFrame> {
        let keys: Vec<(FrameKey, u64)> = self.open.iter().map(|(k, f)| (*k, f.deadline)).collect();
        keys.into_iter()
            .filter_map(|(key, deadline)| self.close(key, deadline))
            .collect()
    }

    fn open_frame(&mut self, key: FrameKey, start: u64) {
        let epoch = self.epochs.entry(key).or_insert(0);
        *epoch += 1;
        let late = self.next_epoch.remove(&key).unwrap_or_default();
        self.open.insert(
            key,
            OpenFrame {
                epoch: *epoch,
                start,
                deadline: start + self.config.sweep_timeout,
                hits: BTreeMap::new(),
                duplicates: 0,
                late,
            },
        );
    }

    fn expected_bodies(&self, key: FrameKey) -> BTreeSet<ObjectId> {
        let mut set = self.visible.get(&key.0).cloned().unwrap_or_default();
        if let Some(open) = self.open.get(&key) {
            set.extend(open.hits.keys().map(|(o, _)| *o));
        }
        set.retain(|o| self.bodies.contains_key(o));
        set
    }

    fn expected_count(&self, key: FrameKey) -> usize {
        self.expected_bodies(key)
            .iter()
            .map(|o| self.bodies.get(o).copied().unwrap_or(0))
            .sum()
    }

    fn is_complete(&self, key: FrameKey) -> bool {
        let Some(open) = self.open.get(&key) else {
            return false;
        };
        let bodies = self.expected_bodies(key);
        if bodies.is_empty() {
            return false;
        }
        bodies.iter().all(|o| {
            let want = self.bodies.get(o).copied().unwrap_or(0);
            let have = open.hits.keys().filter(|(obj, _)| obj == o).count();
            want > 0 && have >= want
        })
    }

    fn close(&mut self, key: FrameKey, end: u64) -> Option<SweepFrame> {
        let expected = self.expected_count(key);
        let complete = self.is_complete(key);
        let open = self.open.remove(&key)?;
        self.closed.insert(
            key,
            ClosedWindow {
                start: open.start,
                end,
                deadline: open.deadline,
                sensors: open.hits.keys().copied().collect(),
            },
        );

        let seen: BTreeSet<ObjectId> = open.hits.keys().map(|(o, _)| *o).collect();
        if !seen.is_empty() {
            self.visible.insert(key.0, seen);
        }

        if open.hits.is_empty() && open.late.is_empty() {
            log::trace!("lighthouse {} {} epoch {} closed empty", key.0, key.1, open.epoch);
            return None;
        }
        log::trace!(
            "lighthouse {} {} epoch {} closed with {}/{} hits{}",
            key.0,
            key.1,
            open.epoch,
            open.hits.len(),
            expected,
            if complete { "" } else { " (incomplete)" }
        );
        Some(SweepFrame {
            lighthouse: key.0,
            axis: key.1,
            epoch: open.epoch,
            start: open.start,
            deadline: open.deadline,
            hits: open.hits,
            expected,
            complete,
            duplicates: open.duplicates,
            late: open.late,
        })
    }
}
