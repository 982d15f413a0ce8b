use crate::types::SweepAxis;
use std::f64::consts::PI;

// -- Timebase --
pub const TIMEBASE_HZ: u64 = 48_000_000;

// -- Rotor timing (60 Hz rotor on a 48 MHz timebase) --
/// Ticks for one full rotor revolution.
pub const ROTOR_PERIOD_TICKS: u64 = 800_000;
/// Ticks between consecutive sweeps (one sweep per axis per period).
pub const SWEEP_PERIOD_TICKS: u64 = 400_000;
/// Time in sweep at which the laser crosses the optical axis.
pub const SWEEP_CENTER_TICKS: f64 = 200_000.0;

// -- Sync pulse encoding --
/// Pulse length of acode 0.
pub const SYNC_BASE_TICKS: u32 = 2_750;
/// Pulse length step between consecutive acodes.
pub const SYNC_STEP_TICKS: u32 = 500;
/// Sync pulses are 8 acodes wide; anything longer is not a sync flash.
pub const SYNC_MAX_TICKS: u32 = SYNC_BASE_TICKS + 8 * SYNC_STEP_TICKS;
/// Pulses shorter than this are laser sweeps, not sync flashes.
pub const SYNC_MIN_TICKS: u32 = 2_500;

// -- Sweep pulse plausibility --
pub const SWEEP_PULSE_MIN_TICKS: u32 = 10;
pub const SWEEP_PULSE_MAX_TICKS: u32 = 2_000;

/// Decoded acode bits of one sync flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCode {
    /// Axis swept in the cycle this flash starts.
    pub axis: SweepAxis,
    /// One OOTX payload bit.
    pub data: bool,
    /// The lighthouse does not sweep this cycle.
    pub skip: bool,
}

impl SyncCode {
    /// Decode the acode carried in a sync pulse length.
    ///
    /// Returns `None` when the length is outside the sync flash range.
    pub fn from_pulse_length(length: u32) -> Option<SyncCode> {
        if !(SYNC_MIN_TICKS..SYNC_MAX_TICKS).contains(&length) {
            return None;
        }
        // Rounded to the nearest acode so small jitter below the base still decodes.
        let acode = (length.saturating_sub(SYNC_BASE_TICKS - SYNC_STEP_TICKS / 2)) / SYNC_STEP_TICKS;
        let acode = acode.min(7) as u8;
        Some(SyncCode {
            axis: SweepAxis::from_index(acode & 1),
            data: (acode >> 1) & 1 == 1,
            skip: (acode >> 2) & 1 == 1,
        })
    }

    /// Pulse length at the center of this code's acode slot.
    pub fn pulse_length(&self) -> u32 {
        let acode = self.axis as u32 | (self.data as u32) << 1 | (self.skip as u32) << 2;
        SYNC_BASE_TICKS + acode * SYNC_STEP_TICKS
    }
}

pub fn is_sync_length(length: u32) -> bool {
    (SYNC_MIN_TICKS..SYNC_MAX_TICKS).contains(&length)
}

pub fn is_plausible_sweep_length(length: u32) -> bool {
    (SWEEP_PULSE_MIN_TICKS..=SWEEP_PULSE_MAX_TICKS).contains(&length)
}

/// Convert time-in-sweep ticks to an angle in radians from the optical axis.
pub fn ticks_to_angle(time_in_sweep: u32) -> f64 {
    (time_in_sweep as f64 - SWEEP_CENTER_TICKS) / ROTOR_PERIOD_TICKS as f64 * 2.0 * PI
}

/// Inverse of [`ticks_to_angle`], rounded to the nearest tick.
pub fn angle_to_ticks(angle: f64) -> u32 {
    let ticks = angle / (2.0 * PI) * ROTOR_PERIOD_TICKS as f64 + SWEEP_CENTER_TICKS;
    ticks.round().clamp(0.0, u32::MAX as f64) as u32
}

pub fn ticks_to_seconds(ticks: u64, timebase_hz: u64) -> f64 {
    ticks as f64 / timebase_hz.max(1) as f64
}

/// Unwraps a 32-bit device counter into a monotonically growing 64-bit timecode.
#[derive(Debug, Clone, Default)]
pub struct TimecodeUnwrapper {
    last: Option<u32>,
    high: u64,
}

impl TimecodeUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, raw: u32) -> u64 {
        if let Some(last) = self.last {
            // A backwards jump of more than half the range is a wrap, not jitter.
            if raw < last && last - raw > u32::MAX / 2 {
                self.high += 1 << 32;
            }
        }
        self.last = Some(raw);
        self.high | raw as u64
    }
}
