//! Scaled-orthographic (weak perspective) pose estimate.

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Camera-from-body candidates under weak perspective.
///
/// The two rotations are the mirror pair that weak perspective cannot tell
/// apart; callers pick between them with the full projection.
pub fn weak_perspective(world: &[Vector3<f64>], image: &[(f64, f64)]) -> Vec<Isometry3<f64>> {
    let n = world.len();
    if n < 4 || image.len() != n {
        return Vec::new();
    }
    let centroid = world.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n as f64;
    let u_mean = image.iter().map(|(u, _)| u).sum::<f64>() / n as f64;
    let v_mean = image.iter().map(|(_, v)| v).sum::<f64>() / n as f64;

    let mut a = DMatrix::<f64>::zeros(n, 3);
    let mut bu = DVector::<f64>::zeros(n);
    let mut bv = DVector::<f64>::zeros(n);
    for (i, (p, (u, v))) in world.iter().zip(image).enumerate() {
        let d = p - centroid;
        a[(i, 0)] = d.x;
        a[(i, 1)] = d.y;
        a[(i, 2)] = d.z;
        bu[i] = u - u_mean;
        bv[i] = v - v_mean;
    }
    let svd = a.svd(true, true);
    let (Ok(r1), Ok(r2)) = (svd.solve(&bu, 1e-12), svd.solve(&bv, 1e-12)) else {
        return Vec::new();
    };
    let r1 = Vector3::new(r1[0], r1[1], r1[2]);
    let r2 = Vector3::new(r2[0], r2[1], r2[2]);
    let s = 0.5 * (r1.norm() + r2.norm());
    if s < 1e-9 {
        return Vec::new();
    }
    let Some(i) = r1.try_normalize(1e-12) else {
        return Vec::new();
    };
    let Some(j) = (r2 - i * i.dot(&r2)).try_normalize(1e-12) else {
        return Vec::new();
    };

    let depth = 1.0 / s;
    let reference = Vector3::new(u_mean * depth, v_mean * depth, depth);
    let mirrored_i = Vector3::new(i.x, i.y, -i.z);
    let mirrored_j = Vector3::new(j.x, j.y, -j.z);

    [(i, j), (mirrored_i, mirrored_j)]
        .into_iter()
        .filter_map(|(i, j)| {
            let j = (j - i * i.dot(&j)).try_normalize(1e-12)?;
            let k = i.cross(&j);
            let m = Matrix3::from_rows(&[i.transpose(), j.transpose(), k.transpose()]);
            let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m));
            // Body centroid sits at the reference point.
            let t = reference - rotation * centroid;
            Some(Isometry3::from_parts(Translation3::from(t), rotation))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_candidate_is_close_when_far() {
        let truth = Isometry3::from_parts(
            Translation3::new(0.05, -0.02, 4.0),
            UnitQuaternion::from_euler_angles(0.3, 0.2, -0.4),
        );
        let pts: Vec<Vector3<f64>> = vec![
            Vector3::new(0.1, 0.1, 0.1),
            Vector3::new(-0.1, 0.1, -0.1),
            Vector3::new(0.1, -0.1, -0.1),
            Vector3::new(-0.1, -0.1, 0.1),
            Vector3::new(0.0, 0.0, 0.12),
        ];
        let image: Vec<(f64, f64)> = pts
            .iter()
            .map(|p| {
                let c = truth * nalgebra::Point3::from(*p);
                (c.x / c.z, c.y / c.z)
            })
            .collect();
        let candidates = weak_perspective(&pts, &image);
        assert_eq!(candidates.len(), 2);
        let best = candidates
            .iter()
            .map(|c| c.rotation.angle_to(&truth.rotation))
            .fold(f64::INFINITY, f64::min);
        assert!(best < 0.1, "rotation error {}", best);
        for c in &candidates {
            assert!((c.translation.vector.z - 4.0).abs() < 0.2);
        }
    }
}
