//! Efficient perspective-n-point (Lepetit, Moreno-Noguer, Fua).
//!
//! Input is body-frame points and normalized pinhole image points. The pose
//! is expressed through four control points; their camera coordinates come
//! from the null space of a 2n x 12 linear system.

use crate::math::kabsch;
use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Vector3};

type Controls = [Vector3<f64>; 4];

/// Camera-from-body pose, or `None` for fewer than four points or planar/degenerate geometry.
pub fn epnp(world: &[Vector3<f64>], image: &[(f64, f64)]) -> Option<Isometry3<f64>> {
    let n = world.len();
    if n < 4 || image.len() != n {
        return None;
    }
    let controls = control_points(world)?;
    let alphas = barycentric(world, &controls)?;

    let mut m = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (alpha, (u, v))) in alphas.iter().zip(image).enumerate() {
        for j in 0..4 {
            let a = alpha[j];
            m[(2 * i, 3 * j)] = a;
            m[(2 * i, 3 * j + 2)] = -a * u;
            m[(2 * i + 1, 3 * j + 1)] = a;
            m[(2 * i + 1, 3 * j + 2)] = -a * v;
        }
    }
    let mtm = m.transpose() * &m;
    let eigen = mtm.symmetric_eigen();
    let mut order: Vec<usize> = (0..12).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let null_vector = |k: usize| -> Controls {
        let col = eigen.eigenvectors.column(order[k]);
        [0, 1, 2, 3].map(|j| Vector3::new(col[3 * j], col[3 * j + 1], col[3 * j + 2]))
    };
    let v1 = null_vector(0);
    let v2 = null_vector(1);

    let mut candidates = Vec::with_capacity(2);
    if let Some(cc) = solve_n1(&v1, &controls) {
        candidates.push(cc);
    }
    if let Some(cc) = solve_n2(&v1, &v2, &controls) {
        candidates.push(cc);
    }

    candidates
        .into_iter()
        .filter_map(|cc| pose_from_controls(world, &alphas, &cc))
        .map(|pose| (reprojection_error(world, image, &pose), pose))
        .filter(|(err, _)| err.is_finite())
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, pose)| pose)
}

/// Centroid plus the principal axes scaled by their spread.
fn control_points(world: &[Vector3<f64>]) -> Option<Controls> {
    let n = world.len() as f64;
    let c0 = world.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let mut cov = Matrix3::zeros();
    for p in world {
        let d = p - c0;
        cov += d * d.transpose();
    }
    cov /= n;
    let eigen = cov.symmetric_eigen();
    let mut controls = [c0; 4];
    for k in 0..3 {
        let lambda = eigen.eigenvalues[k];
        if lambda < 1e-10 {
            return None;
        }
        controls[k + 1] = c0 + eigen.eigenvectors.column(k).into_owned() * lambda.sqrt();
    }
    Some(controls)
}

fn barycentric(world: &[Vector3<f64>], controls: &Controls) -> Option<Vec<[f64; 4]>> {
    let basis = Matrix3::from_columns(&[
        controls[1] - controls[0],
        controls[2] - controls[0],
        controls[3] - controls[0],
    ]);
    let inv = basis.try_inverse()?;
    Some(
        world
            .iter()
            .map(|p| {
                let a = inv * (p - controls[0]);
                [1.0 - a.x - a.y - a.z, a.x, a.y, a.z]
            })
            .collect(),
    )
}

const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

fn scale(v: &Controls, beta: f64) -> Controls {
    v.map(|c| c * beta)
}

fn solve_n1(v: &Controls, controls: &Controls) -> Option<Controls> {
    let mut num = 0.0;
    let mut den = 0.0;
    for (a, b) in PAIRS {
        let dv = (v[a] - v[b]).norm();
        num += dv * (controls[a] - controls[b]).norm();
        den += dv * dv;
    }
    if den < 1e-18 {
        return None;
    }
    Some(scale(v, num / den))
}

/// Two-vector null space: solve for (β1², β1β2, β2²) from the control-point distances.
fn solve_n2(v1: &Controls, v2: &Controls, controls: &Controls) -> Option<Controls> {
    let mut l = DMatrix::<f64>::zeros(6, 3);
    let mut rho = DVector::<f64>::zeros(6);
    for (row, (a, b)) in PAIRS.into_iter().enumerate() {
        let d1 = v1[a] - v1[b];
        let d2 = v2[a] - v2[b];
        l[(row, 0)] = d1.dot(&d1);
        l[(row, 1)] = 2.0 * d1.dot(&d2);
        l[(row, 2)] = d2.dot(&d2);
        rho[row] = (controls[a] - controls[b]).norm_squared();
    }
    let x = l.svd(true, true).solve(&rho, 1e-12).ok()?;
    let (b11, b12, b22) = (x[0], x[1], x[2]);
    let (mut beta1, beta2) = if b11 < 0.0 {
        ((-b11).sqrt(), if b22 < 0.0 { (-b22).sqrt() } else { 0.0 })
    } else {
        (b11.sqrt(), if b22 > 0.0 { b22.sqrt() } else { 0.0 })
    };
    if b12 < 0.0 {
        beta1 = -beta1;
    }
    if !(beta1.is_finite() && beta2.is_finite()) {
        return None;
    }
    Some([0, 1, 2, 3].map(|j| v1[j] * beta1 + v2[j] * beta2))
}

fn pose_from_controls(world: &[Vector3<f64>], alphas: &[[f64; 4]], cc: &Controls) -> Option<Isometry3<f64>> {
    let mut camera: Vec<Vector3<f64>> = alphas
        .iter()
        .map(|a| cc[0] * a[0] + cc[1] * a[1] + cc[2] * a[2] + cc[3] * a[3])
        .collect();
    // The null vector's sign is arbitrary; points must be in front of the camera.
    let mean_z = camera.iter().map(|p| p.z).sum::<f64>() / camera.len() as f64;
    if mean_z < 0.0 {
        for p in camera.iter_mut() {
            *p = -*p;
        }
    }
    kabsch(world, &camera)
}

fn reprojection_error(world: &[Vector3<f64>], image: &[(f64, f64)], pose: &Isometry3<f64>) -> f64 {
    let mut sum = 0.0;
    for (p, (u, v)) in world.iter().zip(image) {
        let c = pose * nalgebra::Point3::from(*p);
        if c.z <= 1e-9 {
            return f64::INFINITY;
        }
        sum += (c.x / c.z - u).powi(2) + (c.y / c.z - v).powi(2);
    }
    (sum / world.len() as f64).sqrt()
}
