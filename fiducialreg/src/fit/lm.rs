//! Weighted Levenberg-Marquardt optimizer for small fixed-size models.

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

/// Configuration for Levenberg-Marquardt optimization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LmConfig {
    /// Maximum iterations.
    pub max_iterations: usize,
    /// Convergence threshold for the largest parameter change.
    pub convergence_threshold: f64,
    /// Initial damping parameter.
    pub initial_lambda: f64,
    /// Factor to increase lambda on failed step.
    pub lambda_up: f64,
    /// Factor to decrease lambda on successful step.
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-8,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// How the optimizer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LmTermination {
    Converged,
    MaxIterations,
    /// Damping grew without bound or the normal equations became singular
    Stalled,
}

/// Result of L-M optimization.
#[derive(Debug, Clone, Copy)]
pub struct LmResult<const N: usize> {
    pub params: [f64; N],
    /// Weighted sum of squared residuals
    pub chi2: f64,
    pub termination: LmTermination,
    pub iterations: usize,
    /// `(JᵀWJ)⁻¹` at the solution, `None` when singular
    pub inverse_hessian: Option<SMatrix<f64, N, N>>,
}

/// Trait for models that can be fit with L-M optimization.
pub trait LmModel<const N: usize> {
    /// Evaluate the model at a `(x, y, z)` sample position.
    fn evaluate(&self, point: &[f64; 3], params: &[f64; N]) -> f64;

    /// Compute partial derivatives at a sample position.
    fn jacobian_row(&self, point: &[f64; 3], params: &[f64; N]) -> [f64; N];

    /// Apply parameter constraints after an update.
    fn constrain(&self, _params: &mut [f64; N]) {}
}

/// Samples to fit: positions, observed values and per-sample weights.
#[derive(Debug, Clone, Copy)]
pub struct WeightedSamples<'a> {
    pub points: &'a [[f64; 3]],
    pub values: &'a [f64],
    pub weights: &'a [f64],
}

impl WeightedSamples<'_> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Run weighted L-M optimization for an N-parameter model.
pub fn optimize<const N: usize, M: LmModel<N>>(
    model: &M,
    samples: &WeightedSamples<'_>,
    initial_params: [f64; N],
    config: &LmConfig,
) -> LmResult<N> {
    let mut params = initial_params;
    model.constrain(&mut params);
    let mut lambda = config.initial_lambda;
    let mut prev_chi2 = compute_chi2(model, samples, &params);
    let mut termination = LmTermination::MaxIterations;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let (hessian, gradient) = normal_equations(model, samples, &params);

        let mut damped = hessian;
        for i in 0..N {
            damped[(i, i)] *= 1.0 + lambda;
        }

        let Some(delta) = damped.cholesky().map(|c| c.solve(&gradient)) else {
            termination = LmTermination::Stalled;
            break;
        };

        let mut new_params = params;
        for (p, d) in new_params.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        model.constrain(&mut new_params);

        let new_chi2 = compute_chi2(model, samples, &new_params);

        let improved = new_chi2 < prev_chi2;
        // rejected steps whose chi2 differs only by rounding count as converged
        let flat = (new_chi2 - prev_chi2).abs() <= 1e-12 * prev_chi2.max(f64::MIN_POSITIVE);
        if improved {
            params = new_params;
            prev_chi2 = new_chi2;
        }

        if delta.amax() < config.convergence_threshold && (improved || flat) {
            termination = LmTermination::Converged;
            break;
        }

        if improved {
            lambda *= config.lambda_down;
        } else {
            lambda *= config.lambda_up;
            if lambda > 1e10 {
                termination = LmTermination::Stalled;
                break;
            }
        }
    }

    let (hessian, _) = normal_equations(model, samples, &params);
    let inverse_hessian = hessian.cholesky().map(|c| c.inverse());
    if termination == LmTermination::Converged && inverse_hessian.is_none() {
        termination = LmTermination::Stalled;
    }

    LmResult {
        params,
        chi2: prev_chi2,
        termination,
        iterations,
        inverse_hessian,
    }
}

fn compute_chi2<const N: usize, M: LmModel<N>>(
    model: &M,
    samples: &WeightedSamples<'_>,
    params: &[f64; N],
) -> f64 {
    samples
        .points
        .iter()
        .zip(samples.values.iter())
        .zip(samples.weights.iter())
        .map(|((point, &value), &weight)| {
            let residual = value - model.evaluate(point, params);
            weight * residual * residual
        })
        .sum()
}

/// `JᵀWJ` and `JᵀWr` at `params`.
fn normal_equations<const N: usize, M: LmModel<N>>(
    model: &M,
    samples: &WeightedSamples<'_>,
    params: &[f64; N],
) -> (SMatrix<f64, N, N>, SVector<f64, N>) {
    let mut hessian = SMatrix::<f64, N, N>::zeros();
    let mut gradient = SVector::<f64, N>::zeros();

    for ((point, &value), &weight) in samples
        .points
        .iter()
        .zip(samples.values.iter())
        .zip(samples.weights.iter())
    {
        let row = SVector::<f64, N>::from(model.jacobian_row(point, params));
        let residual = value - model.evaluate(point, params);
        gradient += row * (weight * residual);
        hessian += row * row.transpose() * weight;
    }

    (hessian, gradient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `a·x + b·y + c·z + d`
    struct Plane;

    impl LmModel<4> for Plane {
        fn evaluate(&self, point: &[f64; 3], params: &[f64; 4]) -> f64 {
            params[0] * point[0] + params[1] * point[1] + params[2] * point[2] + params[3]
        }

        fn jacobian_row(&self, point: &[f64; 3], _params: &[f64; 4]) -> [f64; 4] {
            [point[0], point[1], point[2], 1.0]
        }
    }

    #[test]
    fn test_linear_model_converges() {
        let mut points = Vec::new();
        for z in 0..3 {
            for y in 0..4 {
                for x in 0..5 {
                    points.push([x as f64, y as f64, z as f64]);
                }
            }
        }
        let truth = [0.5, -1.25, 2.0, 3.0];
        let values: Vec<f64> = points.iter().map(|p| Plane.evaluate(p, &truth)).collect();
        let weights = vec![1.0; values.len()];
        let samples = WeightedSamples {
            points: &points,
            values: &values,
            weights: &weights,
        };

        let result = optimize(&Plane, &samples, [0.0; 4], &LmConfig::default());
        assert_eq!(result.termination, LmTermination::Converged);
        for (fitted, expected) in result.params.iter().zip(truth.iter()) {
            assert_relative_eq!(*fitted, *expected, epsilon = 1e-6);
        }
        assert!(result.inverse_hessian.is_some());
    }

    #[test]
    fn test_degenerate_samples_stall() {
        // all samples share x, so the x coefficient is unconstrained
        let points: Vec<[f64; 3]> = (0..10).map(|i| [1.0, i as f64, 0.0]).collect();
        let values: Vec<f64> = points.iter().map(|p| 2.0 * p[1]).collect();
        let weights = vec![1.0; values.len()];
        let samples = WeightedSamples {
            points: &points,
            values: &values,
            weights: &weights,
        };

        let result = optimize(&Plane, &samples, [0.0; 4], &LmConfig::default());
        assert!(result.inverse_hessian.is_none());
        assert_ne!(result.termination, LmTermination::Converged);
    }

    /// Every step is uphill, so damping grows until it gives up.
    struct Unreachable;

    impl LmModel<1> for Unreachable {
        fn evaluate(&self, _point: &[f64; 3], params: &[f64; 1]) -> f64 {
            params[0]
        }

        // wrong sign on purpose: the solved step always points away from the data
        fn jacobian_row(&self, _point: &[f64; 3], _params: &[f64; 1]) -> [f64; 1] {
            [-1.0]
        }
    }

    #[test]
    fn test_runaway_damping_is_stalled() {
        let points = vec![[0.0; 3]; 5];
        let values = vec![1.0; 5];
        let weights = vec![1.0; 5];
        let samples = WeightedSamples {
            points: &points,
            values: &values,
            weights: &weights,
        };

        let result = optimize(&Unreachable, &samples, [0.0], &LmConfig::default());
        assert_eq!(result.termination, LmTermination::Stalled);
        assert_relative_eq!(result.params[0], 0.0);
        assert_relative_eq!(result.chi2, 5.0);
    }
}
