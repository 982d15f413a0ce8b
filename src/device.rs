use crate::math;
use crate::protocol::TIMEBASE_HZ;
use crate::types::{ImuSample, ObjectId, Pose, SensorId};
use crate::{Result, TrackerError};
use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// One photodiode: position and outward normal in the sensor-rig frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub position: [f64; 3],
    pub normal: [f64; 3],
}

/// Per-axis linear correction applied to raw IMU values: `value * scale - bias`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuCalibration {
    pub acc_scale: [f64; 3],
    pub acc_bias: [f64; 3],
    pub gyro_scale: [f64; 3],
    pub gyro_bias: [f64; 3],
}

impl Default for ImuCalibration {
    fn default() -> Self {
        ImuCalibration::IDENTITY
    }
}

impl ImuCalibration {
    pub const IDENTITY: ImuCalibration = ImuCalibration {
        acc_scale: [1.0; 3],
        acc_bias: [0.0; 3],
        gyro_scale: [1.0; 3],
        gyro_bias: [0.0; 3],
    };

    pub fn apply(&self, sample: &ImuSample) -> ImuSample {
        let mut out = *sample;
        for i in 0..3 {
            out.accel[i] = sample.accel[i] * self.acc_scale[i] - self.acc_bias[i];
            out.gyro[i] = sample.gyro[i] * self.gyro_scale[i] - self.gyro_bias[i];
        }
        out
    }
}

/// Device families that differ in raw IMU scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Hmd,
    Wand,
    Other,
}

impl DeviceClass {
    pub fn from_codename(name: &str) -> DeviceClass {
        if name == "HMD" {
            DeviceClass::Hmd
        } else if name.starts_with("WM") {
            DeviceClass::Wand
        } else {
            DeviceClass::Other
        }
    }

    /// Raw accelerometer LSB to g.
    fn accel_factor(self) -> f64 {
        match self {
            DeviceClass::Hmd => 1.0 / 8192.0,
            DeviceClass::Wand | DeviceClass::Other => 2.0 / 8192.0,
        }
    }

    /// Raw gyro LSB to rad/s.
    fn gyro_factor(self) -> f64 {
        let deg_per_sec = match self {
            DeviceClass::Hmd => 500.0,
            DeviceClass::Wand | DeviceClass::Other => 2000.0,
        };
        deg_per_sec / (1u32 << 15) as f64 * PI / 180.0
    }
}

/// Built-in device definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreset {
    Hmd,
    Wm0,
    Wm1,
    Tr0,
    Tr1,
    Ww0,
}

impl DevicePreset {
    pub const ALL: [DevicePreset; 6] = [
        DevicePreset::Hmd,
        DevicePreset::Wm0,
        DevicePreset::Wm1,
        DevicePreset::Tr0,
        DevicePreset::Tr1,
        DevicePreset::Ww0,
    ];

    pub fn codename(self) -> &'static str {
        match self {
            DevicePreset::Hmd => "HMD",
            DevicePreset::Wm0 => "WM0",
            DevicePreset::Wm1 => "WM1",
            DevicePreset::Tr0 => "TR0",
            DevicePreset::Tr1 => "TR1",
            DevicePreset::Ww0 => "WW0",
        }
    }

    pub fn driver_name(self) -> &'static str {
        match self {
            DevicePreset::Hmd => "Lighthouse HMD",
            DevicePreset::Wm0 | DevicePreset::Wm1 => "Wired Watchman",
            DevicePreset::Tr0 | DevicePreset::Tr1 => "Tracker",
            DevicePreset::Ww0 => "Wireless Watchman",
        }
    }

    pub fn from_codename(name: &str) -> Option<DevicePreset> {
        DevicePreset::ALL.into_iter().find(|p| p.codename() == name)
    }

    fn sensor_layout(self) -> Vec<Sensor> {
        match self {
            DevicePreset::Hmd => sensor_cap(32, 0.09, 1.2),
            DevicePreset::Wm0 | DevicePreset::Wm1 | DevicePreset::Ww0 => sensor_cap(24, 0.06, 1.4),
            DevicePreset::Tr0 | DevicePreset::Tr1 => sensor_cap(22, 0.05, 1.3),
        }
    }
}

/// Sensors spread over a spherical cap facing +Z, normals pointing outward.
fn sensor_cap(count: usize, radius: f64, half_angle: f64) -> Vec<Sensor> {
    let golden = PI * (3.0 - 5f64.sqrt());
    let min_cos = half_angle.cos();
    (0..count)
        .map(|i| {
            let t = (i as f64 + 0.5) / count as f64;
            let cos_theta = 1.0 - t * (1.0 - min_cos);
            let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
            let phi = golden * i as f64;
            let n = [sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta];
            Sensor {
                position: [n[0] * radius, n[1] * radius, n[2] * radius],
                normal: n,
            }
        })
        .collect()
}

/// A tracked device: sensor geometry plus the state fusion and calibration keep on it.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidBody {
    pub id: ObjectId,
    pub name: String,
    pub driver_name: String,
    pub sensors: Vec<Sensor>,
    /// Pose of the IMU in the sensor-rig frame.
    pub imu_to_rig: Pose,
    /// Pose of the head reference point in the sensor-rig frame.
    pub head_to_rig: Pose,
    pub imu_calibration: ImuCalibration,
    pub imu_hz: f64,
    pub timebase_hz: u64,
    pub pose: Option<Pose>,
    pub pose_timecode: Option<u64>,
    pub charge: u8,
    pub charging: bool,
}

impl RigidBody {
    pub fn new(name: &str, driver_name: &str, sensors: Vec<Sensor>) -> Result<RigidBody> {
        let id = ObjectId::from_name(name).ok_or_else(|| TrackerError::DeviceConfig {
            object: name.to_string(),
            message: format!(
                "codename must be 1-{} printable ASCII characters",
                ObjectId::MAX_NAME_LEN
            ),
        })?;
        Ok(RigidBody {
            id,
            name: name.to_string(),
            driver_name: driver_name.to_string(),
            sensors,
            imu_to_rig: Pose::IDENTITY,
            head_to_rig: Pose::IDENTITY,
            imu_calibration: ImuCalibration::IDENTITY,
            imu_hz: if name == "HMD" { 1000.0 } else { 250.0 },
            timebase_hz: TIMEBASE_HZ,
            pose: None,
            pose_timecode: None,
            charge: 0,
            charging: false,
        })
    }

    pub fn preset(preset: DevicePreset) -> RigidBody {
        let sensors = preset.sensor_layout();
        RigidBody {
            id: ObjectId::pack(preset.codename().as_bytes()),
            name: preset.codename().to_string(),
            driver_name: preset.driver_name().to_string(),
            sensors,
            imu_to_rig: Pose::IDENTITY,
            head_to_rig: Pose::IDENTITY,
            imu_calibration: ImuCalibration::IDENTITY,
            imu_hz: if preset == DevicePreset::Hmd { 1000.0 } else { 250.0 },
            timebase_hz: TIMEBASE_HZ,
            pose: None,
            pose_timecode: None,
            charge: 0,
            charging: false,
        }
    }

    /// Parse an HTC-style device JSON blob.
    ///
    /// Keys are looked up anywhere in the document. `plus_x`, `plus_z` and
    /// `position` count only inside an `imu` object, and when present they
    /// override `trackref_from_imu`.
    pub fn from_htc_json(name: &str, driver_name: &str, json: &str) -> Result<RigidBody> {
        let err = |message: String| TrackerError::DeviceConfig {
            object: name.to_string(),
            message,
        };
        let root: serde_json::Value = serde_json::from_str(json)?;
        if !root.is_object() {
            return Err(err("expected a JSON object".into()));
        }

        let points: Vec<[f64; 3]> = match find_key(&root, "modelPoints") {
            Some(v) => serde_json::from_value(v.clone())?,
            None => return Err(err("missing modelPoints".into())),
        };
        let normals: Vec<[f64; 3]> = match find_key(&root, "modelNormals") {
            Some(v) => serde_json::from_value(v.clone())?,
            None => vec![[0.0, 0.0, 1.0]; points.len()],
        };
        if normals.len() != points.len() {
            return Err(err(format!(
                "{} modelPoints but {} modelNormals",
                points.len(),
                normals.len()
            )));
        }
        if points.len() > SensorId::MAX as usize + 1 {
            return Err(err(format!("too many sensors ({})", points.len())));
        }
        let sensors = points
            .into_iter()
            .zip(normals)
            .map(|(position, normal)| Sensor { position, normal })
            .collect();
        let mut body = RigidBody::new(name, driver_name, sensors)?;

        let class = DeviceClass::from_codename(name);
        let mut cal = ImuCalibration::IDENTITY;
        if let Some(v) = read_vec3(&root, "acc_scale")? {
            cal.acc_scale = v.map(|x| x * class.accel_factor());
        }
        if let Some(v) = read_vec3(&root, "acc_bias")? {
            cal.acc_bias = v;
        }
        if let Some(v) = read_vec3(&root, "gyro_scale")? {
            cal.gyro_scale = v.map(|x| x * class.gyro_factor());
        }
        if let Some(v) = read_vec3(&root, "gyro_bias")? {
            cal.gyro_bias = v;
        }
        body.imu_calibration = cal;

        if let Some(pose) = read_json_pose(&root, "trackref_from_imu")? {
            body.imu_to_rig = pose;
        }
        if let Some(pose) = read_json_pose(&root, "trackref_from_head")? {
            body.head_to_rig = pose;
        }
        if let Some(imu) = find_key(&root, "imu") {
            let plus_x: Option<[f64; 3]> = imu.get("plus_x").map(|v| serde_json::from_value::<[f64; 3]>(v.clone())).transpose()?;
            let plus_z: Option<[f64; 3]> = imu.get("plus_z").map(|v| serde_json::from_value::<[f64; 3]>(v.clone())).transpose()?;
            let position: [f64; 3] = imu
                .get("position")
                .map(|v| serde_json::from_value::<[f64; 3]>(v.clone()))
                .transpose()?
                .unwrap_or([0.0; 3]);
            if let (Some(x), Some(z)) = (plus_x, plus_z) {
                if let Some(rotation) = math::rotation_from_axes(&Vector3::from(x), &Vector3::from(z)) {
                    body.imu_to_rig = Pose::from_isometry(&Isometry3::from_parts(
                        Vector3::from(position).into(),
                        rotation,
                    ));
                }
            }
        }

        log::debug!(
            "parsed device config for {} ({} sensors, imu at {:?})",
            name,
            body.sensors.len(),
            body.imu_to_rig.position
        );
        Ok(body)
    }

    pub fn sensor(&self, id: SensorId) -> Option<&Sensor> {
        self.sensors.get(id as usize)
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn sensor_point(&self, id: SensorId) -> Option<Vector3<f64>> {
        self.sensor(id).map(|s| Vector3::from(s.position))
    }

    /// Largest distance between any two sensors.
    pub fn extent(&self) -> f64 {
        let mut best = 0.0f64;
        for (i, a) in self.sensors.iter().enumerate() {
            for b in &self.sensors[i + 1..] {
                let d = (Point3::from(a.position) - Point3::from(b.position)).norm();
                best = best.max(d);
            }
        }
        best
    }

    pub fn sensor_distance(&self, a: SensorId, b: SensorId) -> Option<f64> {
        Some((self.sensor_point(a)? - self.sensor_point(b)?).norm())
    }
}

/// Depth-first search for the first value stored under `key`.
fn find_key<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return Some(v);
            }
            map.values().find_map(|v| find_key(v, key))
        }
        serde_json::Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

fn read_vec3(root: &serde_json::Value, key: &str) -> Result<Option<[f64; 3]>> {
    match find_key(root, key) {
        Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        None => Ok(None),
    }
}

/// Seven-value pose `[qx, qy, qz, qw, px, py, pz]`.
fn read_json_pose(root: &serde_json::Value, key: &str) -> Result<Option<Pose>> {
    let Some(v) = find_key(root, key) else {
        return Ok(None);
    };
    let values: Vec<f64> = serde_json::from_value(v.clone())?;
    if values.len() != 7 {
        log::warn!("{} has {} values, expected 7; ignoring", key, values.len());
        return Ok(None);
    }
    Ok(Some(Pose::new(
        [values[4], values[5], values[6]],
        [values[3], values[0], values[1], values[2]],
    )))
}
