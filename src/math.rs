//! Pose helpers and the lighthouse projection model.
//!
//! A lighthouse looks along its local -Z axis. A point `q` in lighthouse
//! coordinates is seen at horizontal angle `atan2(q.x, -q.z)` and vertical angle
//! `atan2(q.y, -q.z)`. The pinhole camera used by the perspective solvers looks
//! along +Z with a y-down image, so `c = (q.x, -q.y, -q.z)`.

use crate::types::{Pose, SweepAxis};
use nalgebra::{
    Isometry3, Matrix3, Quaternion, Rotation3, Translation3, UnitQuaternion, Vector3,
};
use std::f64::consts::PI;

impl Pose {
    pub fn from_isometry(iso: &Isometry3<f64>) -> Pose {
        let t = iso.translation.vector;
        let q = iso.rotation.quaternion();
        Pose {
            position: [t.x, t.y, t.z],
            rotation: [q.w, q.i, q.j, q.k],
        }
        .normalized()
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(self.translation(), self.unit_quaternion())
    }

    pub fn unit_quaternion(&self) -> UnitQuaternion<f64> {
        let r = self.rotation;
        UnitQuaternion::from_quaternion(Quaternion::new(r[0], r[1], r[2], r[3]))
    }

    pub fn translation(&self) -> Translation3<f64> {
        Translation3::new(self.position[0], self.position[1], self.position[2])
    }

    pub fn position_vector(&self) -> Vector3<f64> {
        Vector3::from(self.position)
    }

    pub fn inverse(&self) -> Pose {
        Pose::from_isometry(&self.to_isometry().inverse())
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose::from_isometry(&(self.to_isometry() * other.to_isometry()))
    }

    pub fn transform_point(&self, p: &[f64; 3]) -> [f64; 3] {
        let w = self.to_isometry() * nalgebra::Point3::from(*p);
        [w.x, w.y, w.z]
    }

    /// Translation distance plus rotation angle to another pose.
    pub fn distance_to(&self, other: &Pose) -> (f64, f64) {
        let dp = (self.position_vector() - other.position_vector()).norm();
        let dr = self.unit_quaternion().angle_to(&other.unit_quaternion());
        (dp, dr)
    }
}

/// Wrap an angle into (-π, π].
pub fn wrap_angle(a: f64) -> f64 {
    let mut a = a % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Sweep angles of a point in lighthouse coordinates, or `None` behind the lighthouse.
pub fn lighthouse_angles(q: &Vector3<f64>) -> Option<(f64, f64)> {
    if -q.z <= 1e-9 {
        return None;
    }
    Some((q.x.atan2(-q.z), q.y.atan2(-q.z)))
}

pub fn predict_angle(axis: SweepAxis, q: &Vector3<f64>) -> Option<f64> {
    lighthouse_angles(q).map(|(h, v)| match axis {
        SweepAxis::Horizontal => h,
        SweepAxis::Vertical => v,
    })
}

/// Gradient of the predicted sweep angle with respect to the lighthouse-frame point.
pub fn angle_gradient(axis: SweepAxis, q: &Vector3<f64>) -> Vector3<f64> {
    match axis {
        SweepAxis::Horizontal => {
            let d = q.x * q.x + q.z * q.z;
            if d < 1e-18 {
                return Vector3::zeros();
            }
            Vector3::new(-q.z / d, 0.0, q.x / d)
        }
        SweepAxis::Vertical => {
            let d = q.y * q.y + q.z * q.z;
            if d < 1e-18 {
                return Vector3::zeros();
            }
            Vector3::new(0.0, -q.z / d, q.y / d)
        }
    }
}

/// Normalized image coordinates for a pair of sweep angles.
pub fn image_point(horizontal: f64, vertical: f64) -> (f64, f64) {
    (horizontal.tan(), -vertical.tan())
}

/// Rotation taking lighthouse coordinates to pinhole camera coordinates.
pub fn camera_from_lighthouse() -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::x_axis(), PI)
}

pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Best rigid transform mapping `src[i]` onto `dst[i]` (Kabsch with reflection fix).
pub fn kabsch(src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> Option<Isometry3<f64>> {
    if src.len() != dst.len() || src.len() < 3 {
        return None;
    }
    let n = src.len() as f64;
    let cs = src.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let cd = dst.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;

    let mut h = Matrix3::zeros();
    for (s, d) in src.iter().zip(dst) {
        h += (s - cs) * (d - cd).transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let v = v_t.transpose();
    let d = (v * u.transpose()).determinant().signum();
    let correction = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d));
    let r = v * correction * u.transpose();
    if !r.iter().all(|x| x.is_finite()) {
        return None;
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let t = cd - rotation * cs;
    Some(Isometry3::from_parts(Translation3::from(t), rotation))
}

/// Rotation whose X axis points along `plus_x` and Z axis along `plus_z`.
pub fn rotation_from_axes(plus_x: &Vector3<f64>, plus_z: &Vector3<f64>) -> Option<UnitQuaternion<f64>> {
    let x = plus_x.try_normalize(1e-12)?;
    let z = (plus_z - x * x.dot(plus_z)).try_normalize(1e-12)?;
    let y = z.cross(&x);
    let m = Matrix3::from_columns(&[x, y, z]);
    Some(UnitQuaternion::from_rotation_matrix(
        &Rotation3::from_matrix_unchecked(m),
    ))
}

/// Decode an IEEE 754 binary16 value.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0f32 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x03ff) as f32;
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        0x1f if mantissa == 0.0 => sign * f32::INFINITY,
        0x1f => f32::NAN,
        e => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(e - 15),
    }
}

/// Encode an `f32` as IEEE 754 binary16 (round toward zero).
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;
    if exponent == 0xff {
        return sign | 0x7c00 | if mantissa != 0 { 0x200 } else { 0 };
    }
    let e = exponent - 127 + 15;
    if e >= 0x1f {
        sign | 0x7c00
    } else if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = (mantissa | 0x0080_0000) >> (14 - e);
        sign | m as u16
    } else {
        sign | ((e as u16) << 10) | (mantissa >> 13) as u16
    }
}
