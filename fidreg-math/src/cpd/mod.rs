//! Coherent Point Drift registration
//!
//! CPD treats the moving point set as the centroids of a Gaussian mixture and
//! fits it to the fixed set by expectation maximisation. Unlike the closed-form
//! solvers in [`crate::transform`] no correspondence between the two sets is
//! needed: the E-step assigns soft responsibilities between every pair.
//!
//! Point sets here are `N×D` (fixed, `X`) and `M×D` (moving, `Y`) with one point
//! per row. The fitted transform maps `Y` onto `X` as `s·R·y + t`.

mod strategy;
mod two_step;

pub use strategy::{Affine, CpdStrategy, Rigid, Similarity, TransformUpdate};
pub use two_step::{cpd_2step, TwoStepResult};

use std::f64::consts::PI;

use log::debug;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transform::embed;

/// Errors that can occur during CPD registration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CpdError {
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error("SVD decomposition failed to produce U or V^T matrices")]
    SvdFailed,

    #[error("weighted moving covariance is singular")]
    SingularCovariance,

    #[error("no point received any responsibility (sigma2 = {sigma2})")]
    NoResponsibility { sigma2: f64 },
}

/// Iteration limits and noise model for CPD
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpdConfig {
    pub max_iterations: usize,
    /// Registration stops once the objective changes by less than this
    pub tolerance: f64,
    /// Weight of the uniform outlier component, in `[0, 1)`
    pub w: f64,
    /// Initial variance; estimated from the data when `None`
    pub sigma2: Option<f64>,
}

impl Default for CpdConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 0.001,
            w: 0.0,
            sigma2: None,
        }
    }
}

/// Lifecycle of a registration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpdState {
    Uninitialized,
    Iterating,
    Converged,
    MaxIterationsReached,
}

/// Soft correspondences from one E-step
#[derive(Debug, Clone)]
pub struct Posterior {
    /// `M×N` responsibilities, each column normalised over the moving points
    pub p: DMatrix<f64>,
    /// Total responsibility per fixed point (length `N`)
    pub pt1: DVector<f64>,
    /// Total responsibility per moving point (length `M`)
    pub p1: DVector<f64>,
    /// Sum of all responsibilities
    pub np: f64,
}

/// Weighted first and second moments shared by every M-step variant
#[derive(Debug, Clone)]
pub struct Moments {
    pub mu_x: DVector<f64>,
    pub mu_y: DVector<f64>,
    /// Weighted cross-covariance `X̂ᵀ·Pᵀ·Ŷ` (`D×D`)
    pub a: DMatrix<f64>,
    /// `Σ Pt1ₙ·|x̂ₙ|²`
    pub x_px: f64,
    /// `Ŷᵀ·diag(P1)·Ŷ` (`D×D`); its trace is the scalar `Σ P1ₘ·|ŷₘ|²`
    pub ypy: DMatrix<f64>,
}

impl Moments {
    fn compute(x: &DMatrix<f64>, y: &DMatrix<f64>, posterior: &Posterior) -> Self {
        let np = posterior.np;
        let mu_x = x.tr_mul(&posterior.pt1) / np;
        let mu_y = y.tr_mul(&posterior.p1) / np;

        let x_hat = center_rows(x, &mu_x);
        let y_hat = center_rows(y, &mu_y);

        let a = x_hat.tr_mul(&posterior.p.tr_mul(&y_hat));

        let x_px = x_hat
            .row_iter()
            .zip(posterior.pt1.iter())
            .map(|(row, w)| w * row.norm_squared())
            .sum();

        let mut weighted = y_hat.clone();
        for (mut row, w) in weighted.row_iter_mut().zip(posterior.p1.iter()) {
            row *= *w;
        }
        let ypy = y_hat.tr_mul(&weighted);

        Self {
            mu_x,
            mu_y,
            a,
            x_px,
            ypy,
        }
    }
}

fn center_rows(points: &DMatrix<f64>, mean: &DVector<f64>) -> DMatrix<f64> {
    let mut out = points.clone();
    let mean_t = mean.transpose();
    for mut row in out.row_iter_mut() {
        row -= &mean_t;
    }
    out
}

/// Progress of a single EM iteration, passed to the `register_with` callback
#[derive(Debug, Clone, Copy)]
pub struct IterationInfo {
    pub iteration: usize,
    pub error: f64,
    pub sigma2: f64,
}

/// Outcome of a CPD run
#[derive(Debug, Clone)]
pub struct CpdResult {
    /// Moving points after the final transform (`M×D`)
    pub transformed: DMatrix<f64>,
    pub scale: f64,
    /// Linear part: a rotation for rigid/similarity, a general matrix for affine
    pub rotation: DMatrix<f64>,
    pub translation: DVector<f64>,
    /// `(D+1)×(D+1)` homogeneous matrix mapping moving points onto fixed points
    pub matrix: DMatrix<f64>,
    pub sigma2: f64,
    pub iterations: usize,
    /// Last change of the objective
    pub err: f64,
    pub state: CpdState,
}

/// EM driver shared by all CPD variants
pub struct CpdRegistration<S: CpdStrategy> {
    x: DMatrix<f64>,
    y: DMatrix<f64>,
    ty: DMatrix<f64>,
    strategy: S,
    config: CpdConfig,
    rotation: DMatrix<f64>,
    translation: DVector<f64>,
    scale: f64,
    sigma2: f64,
    q: f64,
    err: f64,
    iteration: usize,
    state: CpdState,
}

pub type CpdRigid = CpdRegistration<Rigid>;
pub type CpdSimilarity = CpdRegistration<Similarity>;
pub type CpdAffine = CpdRegistration<Affine>;

impl CpdRegistration<Rigid> {
    pub fn rigid(x: &DMatrix<f64>, y: &DMatrix<f64>, config: CpdConfig) -> Result<Self, CpdError> {
        Self::new(x, y, Rigid, config)
    }
}

impl CpdRegistration<Similarity> {
    pub fn similarity(
        x: &DMatrix<f64>,
        y: &DMatrix<f64>,
        config: CpdConfig,
    ) -> Result<Self, CpdError> {
        Self::new(x, y, Similarity, config)
    }
}

impl CpdRegistration<Affine> {
    pub fn affine(
        x: &DMatrix<f64>,
        y: &DMatrix<f64>,
        config: CpdConfig,
    ) -> Result<Self, CpdError> {
        Self::new(x, y, Affine, config)
    }
}

impl<S: CpdStrategy> CpdRegistration<S> {
    /// Sets up a registration of moving `y` (`M×D`) onto fixed `x` (`N×D`).
    ///
    /// # Errors
    /// * `CpdError::ArgumentError` - if either set is empty, the dimensions differ,
    ///   `w` lies outside `[0, 1)` or a supplied `sigma2` is not positive
    pub fn new(
        x: &DMatrix<f64>,
        y: &DMatrix<f64>,
        strategy: S,
        config: CpdConfig,
    ) -> Result<Self, CpdError> {
        if x.nrows() == 0 || y.nrows() == 0 {
            return Err(CpdError::ArgumentError(
                "both point sets must contain at least one point".to_string(),
            ));
        }
        if x.ncols() != y.ncols() || x.ncols() == 0 {
            return Err(CpdError::ArgumentError(format!(
                "point sets must share a non-zero dimension, got {} and {}",
                x.ncols(),
                y.ncols()
            )));
        }
        if !(0.0..1.0).contains(&config.w) {
            return Err(CpdError::ArgumentError(format!(
                "outlier weight w must lie in [0, 1), got {}",
                config.w
            )));
        }
        if let Some(sigma2) = config.sigma2 {
            if sigma2 <= 0.0 || !sigma2.is_finite() {
                return Err(CpdError::ArgumentError(format!(
                    "initial sigma2 must be positive, got {sigma2}"
                )));
            }
        }

        let d = x.ncols();
        Ok(Self {
            x: x.clone(),
            y: y.clone(),
            ty: y.clone(),
            strategy,
            config,
            rotation: DMatrix::identity(d, d),
            translation: DVector::zeros(d),
            scale: 1.0,
            sigma2: 0.0,
            q: f64::INFINITY,
            err: f64::INFINITY,
            iteration: 0,
            state: CpdState::Uninitialized,
        })
    }

    /// Starts the iteration from an initial `s·R·y + t` instead of the identity.
    pub fn with_initial(
        mut self,
        rotation: DMatrix<f64>,
        translation: DVector<f64>,
        scale: f64,
    ) -> Result<Self, CpdError> {
        let d = self.dim();
        if rotation.shape() != (d, d) || translation.len() != d {
            return Err(CpdError::ArgumentError(format!(
                "initial transform must be {d}x{d} with a length {d} translation"
            )));
        }
        self.rotation = rotation;
        self.translation = translation;
        self.scale = scale;
        Ok(self)
    }

    pub fn dim(&self) -> usize {
        self.x.ncols()
    }

    pub fn state(&self) -> CpdState {
        self.state
    }

    /// Runs EM until convergence or the iteration limit.
    pub fn register(self) -> Result<CpdResult, CpdError> {
        self.register_with(|_| {})
    }

    /// Runs EM, reporting progress after every iteration.
    pub fn register_with<F>(mut self, mut callback: F) -> Result<CpdResult, CpdError>
    where
        F: FnMut(&IterationInfo),
    {
        self.initialize();

        while self.iteration < self.config.max_iterations && self.err > self.config.tolerance {
            self.iterate()?;
            callback(&IterationInfo {
                iteration: self.iteration,
                error: self.err,
                sigma2: self.sigma2,
            });
        }

        self.state = if self.err <= self.config.tolerance {
            CpdState::Converged
        } else {
            CpdState::MaxIterationsReached
        };
        debug!(
            "{} CPD finished after {} iterations: err {:.3e}, sigma2 {:.3e}, {:?}",
            S::NAME,
            self.iteration,
            self.err,
            self.sigma2,
            self.state
        );

        let matrix = embed(&(&self.rotation * self.scale), &self.translation);
        Ok(CpdResult {
            transformed: self.ty,
            scale: self.scale,
            rotation: self.rotation,
            translation: self.translation,
            matrix,
            sigma2: self.sigma2,
            iterations: self.iteration,
            err: self.err,
            state: self.state,
        })
    }

    fn initialize(&mut self) {
        self.ty = self.apply(&self.y);
        self.sigma2 = match self.config.sigma2 {
            Some(sigma2) => sigma2,
            None => initial_sigma2(&self.x, &self.ty),
        };
        if self.sigma2 <= 0.0 {
            self.sigma2 = self.variance_floor();
        }
        self.q = f64::INFINITY;
        self.err = f64::INFINITY;
        self.iteration = 0;
        self.state = CpdState::Iterating;
    }

    fn iterate(&mut self) -> Result<(), CpdError> {
        let posterior = self.expectation()?;
        let moments = Moments::compute(&self.x, &self.y, &posterior);
        let update = self.strategy.update_transform(&moments)?;

        self.rotation = update.rotation;
        self.translation = update.translation;
        self.scale = update.scale;
        self.ty = self.apply(&self.y);

        self.update_variance(update.residual, posterior.np);
        self.iteration += 1;
        debug!(
            "{} CPD iteration {}: err {:.3e}, sigma2 {:.3e}",
            S::NAME,
            self.iteration,
            self.err,
            self.sigma2
        );
        Ok(())
    }

    /// E-step: Gaussian responsibilities normalised per fixed point.
    fn expectation(&self) -> Result<Posterior, CpdError> {
        let (n, d) = self.x.shape();
        let m = self.ty.nrows();
        let sigma2 = self.sigma2;
        let w = self.config.w;

        let outlier = (2.0 * PI * sigma2).powf(d as f64 / 2.0) * w / (1.0 - w) * m as f64
            / n as f64;

        let mut p = DMatrix::<f64>::zeros(m, n);
        let x = &self.x;
        let ty = &self.ty;
        p.as_mut_slice()
            .par_chunks_mut(m)
            .enumerate()
            .for_each(|(col, column)| {
                let x_n = x.row(col);
                for (row, value) in column.iter_mut().enumerate() {
                    let dist2 = (ty.row(row) - x_n).norm_squared();
                    *value = (-dist2 / (2.0 * sigma2)).exp();
                }
                let mut den: f64 = column.iter().sum();
                if den == 0.0 {
                    den = f64::EPSILON;
                }
                den += outlier;
                for value in column.iter_mut() {
                    *value /= den;
                }
            });

        let pt1 = p.row_sum().transpose();
        let p1 = p.column_sum();
        let np = p1.sum();
        if np <= f64::EPSILON || !np.is_finite() {
            return Err(CpdError::NoResponsibility { sigma2 });
        }

        Ok(Posterior { p, pt1, p1, np })
    }

    fn update_variance(&mut self, residual: f64, np: f64) {
        let d = self.dim() as f64;
        let q_prev = self.q;

        self.q = residual / (2.0 * self.sigma2) + np * d / 2.0 * self.sigma2.ln();
        self.err = (self.q - q_prev).abs();

        self.sigma2 = residual / (np * d);
        if self.sigma2.is_nan() || self.sigma2 <= 0.0 {
            self.sigma2 = self.variance_floor();
        }
    }

    fn variance_floor(&self) -> f64 {
        self.config.tolerance / 10.0
    }

    fn apply(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        let linear = &self.rotation * self.scale;
        let mut out = points * linear.transpose();
        let t = self.translation.transpose();
        for mut row in out.row_iter_mut() {
            row += &t;
        }
        out
    }
}

/// Mean squared distance over every fixed/moving pair, divided by `D`.
fn initial_sigma2(x: &DMatrix<f64>, y: &DMatrix<f64>) -> f64 {
    let (n, d) = x.shape();
    let m = y.nrows();
    let total: f64 = (0..n)
        .into_par_iter()
        .map(|i| {
            let x_i = x.row(i);
            y.row_iter().map(|y_j| (y_j - x_i).norm_squared()).sum::<f64>()
        })
        .sum();
    total / (d * m * n) as f64
}
