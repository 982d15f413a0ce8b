//! Levenberg-Marquardt refinement of a body pose against sweep angles.
//!
//! The pose is perturbed on the left: `R <- exp(dθ) R`, `t <- t + dt`, so the
//! Jacobian of a predicted angle with respect to `[dt, dθ]` is
//! `gᵀ Lᵀ [I | -[R p]×]` where `g` is the angle gradient in the lighthouse
//! frame and `L` the lighthouse orientation.

use super::{FailureReason, Observation, SolveFailure};
use crate::math::{angle_gradient, predict_angle, skew, wrap_angle};
use nalgebra::{Isometry3, Matrix6, Point3, RowVector6, Translation3, UnitQuaternion, Vector3, Vector6};
use std::f64::consts::FRAC_PI_2;
use std::time::Instant;

/// Residual charged for a sensor that ends up behind the lighthouse.
const BEHIND_PENALTY: f64 = FRAC_PI_2;
const FD_STEP: f64 = 1e-6;
const MAX_DAMPING_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Loss {
    Squared,
    /// Quadratic inside the threshold, linear outside.
    Huber(f64),
}

impl Loss {
    fn rho(self, r: f64) -> f64 {
        match self {
            Loss::Squared => r * r,
            Loss::Huber(delta) => {
                let a = r.abs();
                if a <= delta {
                    r * r
                } else {
                    2.0 * delta * a - delta * delta
                }
            }
        }
    }

    fn weight(self, r: f64) -> f64 {
        match self {
            Loss::Squared => 1.0,
            Loss::Huber(delta) => {
                let a = r.abs();
                if a <= delta {
                    1.0
                } else {
                    delta / a
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianMode {
    Analytic,
    FiniteDifference,
}

#[derive(Debug, Clone, Copy)]
pub struct LmOptions {
    pub loss: Loss,
    pub jacobian: JacobianMode,
    pub max_iterations: usize,
    pub deadline: Option<Instant>,
    pub initial_lambda: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            loss: Loss::Squared,
            jacobian: JacobianMode::Analytic,
            max_iterations: 50,
            deadline: None,
            initial_lambda: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LmOutcome {
    pub pose: Isometry3<f64>,
    /// Unweighted RMS angle residual, radians.
    pub rms: f64,
    pub iterations: usize,
    pub converged: bool,
}

fn residual(o: &Observation, pose: &Isometry3<f64>) -> f64 {
    let q = o
        .world_from_lighthouse
        .inverse_transform_point(&(pose * Point3::from(o.point)));
    match predict_angle(o.axis, &q.coords) {
        Some(predicted) => wrap_angle(o.angle - predicted),
        None => BEHIND_PENALTY,
    }
}

/// Signed angle residual of every observation, measured minus predicted.
pub fn residuals(obs: &[Observation], pose: &Isometry3<f64>) -> Vec<f64> {
    obs.iter().map(|o| residual(o, pose)).collect()
}

/// RMS angle residual of a pose over the observations.
pub fn rms(obs: &[Observation], pose: &Isometry3<f64>) -> f64 {
    if obs.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = obs.iter().map(|o| residual(o, pose).powi(2)).sum();
    (sum / obs.len() as f64).sqrt()
}

fn cost(loss: Loss, r: &[f64]) -> f64 {
    r.iter().map(|&x| loss.rho(x)).sum()
}

fn apply_delta(pose: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let dt = Vector3::new(delta[0], delta[1], delta[2]);
    let dtheta = Vector3::new(delta[3], delta[4], delta[5]);
    Isometry3::from_parts(
        Translation3::from(pose.translation.vector + dt),
        UnitQuaternion::from_scaled_axis(dtheta) * pose.rotation,
    )
}

/// Row of d(predicted angle)/d[dt, dθ].
fn analytic_row(o: &Observation, pose: &Isometry3<f64>) -> RowVector6<f64> {
    let rotated = pose.rotation * o.point;
    let world = pose.translation.vector + rotated;
    let q = o
        .world_from_lighthouse
        .inverse_transform_point(&Point3::from(world));
    if predict_angle(o.axis, &q.coords).is_none() {
        return RowVector6::zeros();
    }
    let g = angle_gradient(o.axis, &q.coords);
    // Gradient with respect to the world point.
    let gw = o.world_from_lighthouse.rotation * g;
    let d_theta = -(skew(&rotated).transpose() * gw);
    RowVector6::new(gw.x, gw.y, gw.z, d_theta.x, d_theta.y, d_theta.z)
}

fn finite_difference_row(o: &Observation, pose: &Isometry3<f64>) -> RowVector6<f64> {
    let mut row = RowVector6::zeros();
    for k in 0..6 {
        let mut step = Vector6::zeros();
        step[k] = FD_STEP;
        let plus = residual(o, &apply_delta(pose, &step));
        let minus = residual(o, &apply_delta(pose, &(-step)));
        // Residual is measured minus predicted.
        row[k] = -wrap_angle(plus - minus) / (2.0 * FD_STEP);
    }
    row
}

/// Minimize the angle residuals starting from `initial`.
///
/// Fails only when the deadline passes; a run that stops improving returns its
/// best pose with `converged` set and lets the caller judge the residual.
pub fn levenberg_marquardt(
    obs: &[Observation],
    initial: &Isometry3<f64>,
    options: &LmOptions,
) -> Result<LmOutcome, SolveFailure> {
    let mut pose = *initial;
    let mut r = residuals(obs, &pose);
    let mut current = cost(options.loss, &r);
    let mut lambda = options.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        if options.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SolveFailure::new(FailureReason::DeadlineExceeded, rms(obs, &pose)));
        }
        iterations += 1;

        let mut jtj = Matrix6::zeros();
        let mut jtr = Vector6::zeros();
        for (o, &ri) in obs.iter().zip(&r) {
            let row = match options.jacobian {
                JacobianMode::Analytic => analytic_row(o, &pose),
                JacobianMode::FiniteDifference => finite_difference_row(o, &pose),
            };
            let w = options.loss.weight(ri);
            jtj += row.transpose() * row * w;
            jtr += row.transpose() * (ri * w);
        }

        let mut accepted = None;
        for _ in 0..MAX_DAMPING_ATTEMPTS {
            let mut a = jtj;
            for k in 0..6 {
                a[(k, k)] += lambda * jtj[(k, k)].max(1e-9);
            }
            let Some(delta) = a.cholesky().map(|c| c.solve(&jtr)) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = apply_delta(&pose, &delta);
            let r_candidate = residuals(obs, &candidate);
            let c = cost(options.loss, &r_candidate);
            if c.is_finite() && c < current {
                lambda = (lambda / 10.0).max(1e-12);
                accepted = Some((candidate, r_candidate, c, delta.norm()));
                break;
            }
            lambda *= 10.0;
        }

        let Some((candidate, r_candidate, c, step)) = accepted else {
            converged = true;
            break;
        };
        let improvement = current - c;
        pose = candidate;
        r = r_candidate;
        current = c;
        if step < 1e-10 || improvement < 1e-14 * (1.0 + current) {
            converged = true;
            break;
        }
    }

    Ok(LmOutcome {
        pose,
        rms: rms(obs, &pose),
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{SolveBudget, SolveInput};
    use super::*;
    use approx::assert_relative_eq;

    fn observations() -> Vec<Observation> {
        let body = cube_body();
        let lighthouses = lighthouses();
        let angles = synthesize(&body, &truth(), &lighthouses);
        SolveInput {
            body: &body,
            angles: &angles,
            lighthouses: &lighthouses,
            seed: None,
            budget: SolveBudget::default(),
        }
        .observations()
    }

    #[test]
    fn test_analytic_row_matches_finite_difference() {
        let obs = observations();
        let pose = truth().to_isometry();
        for o in obs.iter().take(8) {
            let a = analytic_row(o, &pose);
            let f = finite_difference_row(o, &pose);
            for k in 0..6 {
                assert_relative_eq!(a[k], f[k], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_truth_has_zero_residual() {
        let obs = observations();
        assert!(rms(&obs, &truth().to_isometry()) < 1e-12);
    }

    #[test]
    fn test_huber_weights() {
        let loss = Loss::Huber(0.1);
        assert_eq!(loss.weight(0.05), 1.0);
        assert_relative_eq!(loss.weight(0.5), 0.2);
        assert_relative_eq!(loss.rho(0.5), 2.0 * 0.1 * 0.5 - 0.01);
        assert_eq!(Loss::Squared.weight(10.0), 1.0);
    }

    #[test]
    fn test_deadline_in_past_fails() {
        let obs = observations();
        let options = LmOptions {
            deadline: Some(Instant::now()),
            ..LmOptions::default()
        };
        let err = levenberg_marquardt(&obs, &Isometry3::identity(), &options).unwrap_err();
        assert_eq!(err.reason, FailureReason::DeadlineExceeded);
    }

    #[test]
    fn test_converges_from_perturbed_start() {
        let obs = observations();
        let start = apply_delta(
            &truth().to_isometry(),
            &Vector6::new(0.05, -0.03, 0.04, 0.05, -0.04, 0.03),
        );
        let outcome = levenberg_marquardt(&obs, &start, &LmOptions::default()).unwrap();
        assert!(outcome.rms < 1e-8, "rms {}", outcome.rms);
        assert!(outcome.iterations <= 50);
    }
}
