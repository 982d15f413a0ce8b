use crate::error::Diagnostic;
use crate::ootx::LighthouseCalibration;
use serde::{Deserialize, Serialize};

/// Lighthouse (base station) index as assigned by the capture front end.
pub type LighthouseId = u8;

/// Photodiode index on a rigid body.
pub type SensorId = u8;

/// Stable identifier of a tracked rigid body.
///
/// Packs an ASCII codename of up to eight bytes ("HMD", "WM0", "TR1") so the id
/// can be recovered as the body's name without a lookup table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Longest codename an id can hold.
    pub const MAX_NAME_LEN: usize = 8;

    /// Build an id from a codename. Returns `None` for empty, overlong or
    /// non-printable names.
    pub fn from_name(name: &str) -> Option<ObjectId> {
        let bytes = name.as_bytes();
        if bytes.is_empty()
            || bytes.len() > Self::MAX_NAME_LEN
            || !bytes.iter().all(|b| b.is_ascii_graphic())
        {
            return None;
        }
        Some(ObjectId::pack(bytes))
    }

    /// Pack a name already known to be valid, truncating past eight bytes.
    pub(crate) fn pack(bytes: &[u8]) -> ObjectId {
        let len = bytes.len().min(Self::MAX_NAME_LEN);
        let mut packed = [0u8; 8];
        packed[..len].copy_from_slice(&bytes[..len]);
        ObjectId(u64::from_be_bytes(packed))
    }

    /// The codename this id was built from.
    pub fn name(&self) -> String {
        let bytes = self.0.to_be_bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.name())
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Rotor axis that produced a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SweepAxis {
    Horizontal = 0,
    Vertical = 1,
}

impl SweepAxis {
    pub fn from_index(index: u8) -> SweepAxis {
        if index & 1 == 0 {
            SweepAxis::Horizontal
        } else {
            SweepAxis::Vertical
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn other(self) -> SweepAxis {
        match self {
            SweepAxis::Horizontal => SweepAxis::Vertical,
            SweepAxis::Vertical => SweepAxis::Horizontal,
        }
    }
}

impl std::fmt::Display for SweepAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepAxis::Horizontal => f.write_str("horizontal"),
            SweepAxis::Vertical => f.write_str("vertical"),
        }
    }
}

/// One photodiode crossing of a laser sweep.
///
/// `lighthouse` and `axis` are the capture front end's tentative labels taken
/// from the most recent sync pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightHit {
    pub object: ObjectId,
    pub sensor: SensorId,
    pub axis: SweepAxis,
    /// Ticks since the sync pulse that started this sweep.
    pub time_in_sweep: u32,
    /// Object-local 48 MHz timecode, unwrapped to 64 bits.
    pub timecode: u64,
    pub pulse_length: u32,
    pub lighthouse: LighthouseId,
}

/// Omnidirectional sync flash that starts each sweep and carries OOTX data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPulse {
    pub object: ObjectId,
    pub lighthouse: LighthouseId,
    pub timecode: u64,
    pub pulse_length: u32,
}

/// A light hit after disambiguation, converted to a sweep angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleMeasurement {
    pub object: ObjectId,
    pub sensor: SensorId,
    pub axis: SweepAxis,
    pub timecode: u64,
    pub pulse_length_s: f64,
    /// Radians from the lighthouse's optical axis.
    pub angle: f64,
    pub lighthouse: LighthouseId,
}

bitflags::bitflags! {
    /// Which channels of an [`ImuSample`] carry data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImuPresence: u8 {
        const ACCEL = 1 << 0;
        const GYRO  = 1 << 1;
        const MAG   = 1 << 2;
    }
}

/// Inertial sample in IMU-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub object: ObjectId,
    /// Accelerometer [x, y, z] in g.
    pub accel: [f64; 3],
    /// Gyroscope [x, y, z] in rad/s.
    pub gyro: [f64; 3],
    pub mag: [f64; 3],
    pub timecode: u64,
    pub presence: ImuPresence,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ButtonEvent {
    pub object: ObjectId,
    pub event_type: u8,
    pub button_id: u8,
    pub axis1_id: u8,
    pub axis1_val: u16,
    pub axis2_id: u8,
    pub axis2_val: u16,
}

/// A device announcing itself with its JSON configuration blob.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAnnouncement {
    pub object: ObjectId,
    pub driver: String,
    pub config_json: String,
}

/// Anything a capture source can push into the ingest queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Light(LightHit),
    Sync(SyncPulse),
    Imu(ImuSample),
    Button(ButtonEvent),
    Status {
        object: ObjectId,
        charge: u8,
        charging: bool,
    },
    Device(DeviceAnnouncement),
}

impl Event {
    pub fn object(&self) -> ObjectId {
        match self {
            Event::Light(hit) => hit.object,
            Event::Sync(pulse) => pulse.object,
            Event::Imu(sample) => sample.object,
            Event::Button(button) => button.object,
            Event::Status { object, .. } => *object,
            Event::Device(device) => device.object,
        }
    }

    /// Timecode carried by the event, if it has one.
    pub fn timecode(&self) -> Option<u64> {
        match self {
            Event::Light(hit) => Some(hit.timecode),
            Event::Sync(pulse) => Some(pulse.timecode),
            Event::Imu(sample) => Some(sample.timecode),
            _ => None,
        }
    }
}

/// Rigid transform: position in meters and unit quaternion (w, x, y, z).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub rotation: [f64; 4],
}

impl Default for Pose {
    fn default() -> Self {
        Pose::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: [0.0; 3],
        rotation: [1.0, 0.0, 0.0, 0.0],
    };

    pub fn new(position: [f64; 3], rotation: [f64; 4]) -> Pose {
        Pose { position, rotation }.normalized()
    }

    pub fn rotation_norm(&self) -> f64 {
        self.rotation.iter().map(|c| c * c).sum::<f64>().sqrt()
    }

    /// Copy with a unit-norm quaternion. A zero quaternion becomes identity.
    pub fn normalized(&self) -> Pose {
        let n = self.rotation_norm();
        let rotation = if n > 1e-12 && n.is_finite() {
            let r = self.rotation;
            [r[0] / n, r[1] / n, r[2] / n, r[3] / n]
        } else {
            [1.0, 0.0, 0.0, 0.0]
        };
        Pose {
            position: self.position,
            rotation,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().chain(self.rotation.iter()).all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LighthouseStatus {
    /// Sync pulses seen, nothing decoded yet.
    Detected,
    /// OOTX calibration decoded.
    Decoded,
    /// Pose known, from calibration or a stored calibration file.
    Posed,
}

/// What the session knows about one lighthouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LighthouseInfo {
    pub id: LighthouseId,
    /// Lighthouse pose in the world frame.
    pub pose: Option<Pose>,
    pub calibration: Option<LighthouseCalibration>,
    pub status: LighthouseStatus,
}

impl LighthouseInfo {
    pub fn new(id: LighthouseId) -> LighthouseInfo {
        LighthouseInfo {
            id,
            pose: None,
            calibration: None,
            status: LighthouseStatus::Detected,
        }
    }
}

/// A pose stamped with the timecode of the data it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedPose {
    pub object: ObjectId,
    pub timecode: u64,
    pub pose: Pose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Payload of the info/error reporting channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub level: MessageLevel,
    pub text: String,
    pub diagnostic: Option<Diagnostic>,
}

impl Message {
    pub fn info(text: impl Into<String>) -> Message {
        Message {
            level: MessageLevel::Info,
            text: text.into(),
            diagnostic: None,
        }
    }

    pub fn from_diagnostic(diagnostic: Diagnostic) -> Message {
        Message {
            level: MessageLevel::Warning,
            text: diagnostic.to_string(),
            diagnostic: Some(diagnostic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_round_trips_name() {
        let id = ObjectId::from_name("WM0").unwrap();
        assert_eq!(id.name(), "WM0");
        assert_eq!(id.to_string(), "WM0");
        assert_ne!(id, ObjectId::from_name("WM1").unwrap());
    }

    #[test]
    fn test_object_id_rejects_bad_names() {
        assert!(ObjectId::from_name("").is_none());
        assert!(ObjectId::from_name("TOOLONGNAME").is_none());
        assert!(ObjectId::from_name("a b").is_none());
    }

    #[test]
    fn test_pose_normalized() {
        let pose = Pose {
            position: [1.0, 2.0, 3.0],
            rotation: [2.0, 0.0, 0.0, 0.0],
        }
        .normalized();
        assert!((pose.rotation_norm() - 1.0).abs() < 1e-12);
        assert_eq!(pose.position, [1.0, 2.0, 3.0]);

        let zero = Pose {
            position: [0.0; 3],
            rotation: [0.0; 4],
        }
        .normalized();
        assert_eq!(zero.rotation, [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_axis_from_index() {
        assert_eq!(SweepAxis::from_index(0), SweepAxis::Horizontal);
        assert_eq!(SweepAxis::from_index(3), SweepAxis::Vertical);
        assert_eq!(SweepAxis::Vertical.other(), SweepAxis::Horizontal);
    }
}
