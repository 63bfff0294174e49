//! 3D Gaussian fitting of single beads.
//!
//! Fits the model
//!
//! ```text
//! f(x, y, z) = A·exp(-((x-x0)² + (y-y0)²) / (2·wxy²) - (z-z0)² / (2·wz²)) + bg
//! ```
//!
//! to the voxels of a region of interest by weighted Levenberg-Marquardt. The
//! fit runs in physical units (`x·dx`, `y·dx`, `z·dz`) and the weights come
//! from a camera noise model. Centres are reported back in 0-based pixel
//! coordinates `(x, y, z)`.

pub mod lm;

use log::trace;
use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::label::Roi3;
use lm::{optimize, LmModel, LmTermination, WeightedSamples};

pub use lm::LmConfig;

/// Number of model parameters `[A, x0, y0, z0, wxy, wz, bg]`
pub const NUM_PARAMS: usize = 7;

/// Reasons a single bead fit is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("region of interest is empty or outside the volume")]
    EmptyRoi,

    #[error("{samples} samples cannot constrain {params} parameters")]
    InsufficientData { samples: usize, params: usize },

    #[error("fit diverged: {0}")]
    Diverged(String),

    #[error("non-finite value in fit")]
    NonFinite,

    #[error("fitted centre ({x:.2}, {y:.2}, {z:.2}) lies outside the volume")]
    OutOfBounds { x: f64, y: f64, z: f64 },
}

/// Per-pixel noise of an sCMOS/EMCCD camera
///
/// The variance of a pixel reading `v` (in ADU) is
/// `(read_noise² + noise_factor²·e) / electrons_per_adu²` with
/// `e = max(v - adu_offset, 0)·electrons_per_adu / em_gain` photo-electrons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraNoiseModel {
    pub electrons_per_adu: f64,
    /// Read noise in electrons
    pub read_noise: f64,
    /// Excess noise factor of the gain register
    pub noise_factor: f64,
    pub em_gain: f64,
    pub adu_offset: f64,
}

impl Default for CameraNoiseModel {
    fn default() -> Self {
        Self {
            electrons_per_adu: 0.5,
            read_noise: 1.2,
            noise_factor: 1.41,
            em_gain: 1.0,
            adu_offset: 0.0,
        }
    }
}

impl CameraNoiseModel {
    /// Variance in ADU² of a pixel reading `value`.
    pub fn variance(&self, value: f64) -> f64 {
        let electrons = (value - self.adu_offset).max(0.0) * self.electrons_per_adu / self.em_gain;
        let variance_e = self.read_noise.powi(2) + self.noise_factor.powi(2) * electrons;
        (variance_e / self.electrons_per_adu.powi(2)).max(f64::MIN_POSITIVE)
    }

    /// Least-squares weight `1/σ²` of a pixel reading.
    pub fn weight(&self, value: f64) -> f64 {
        1.0 / self.variance(value)
    }
}

/// Configuration of [`GaussFitter3D`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussFitConfig {
    /// Lateral voxel size
    pub dx: f64,
    /// Axial voxel size
    pub dz: f64,
    /// Initial lateral width guess in physical units
    pub wx: f64,
    /// Initial axial width guess in physical units
    pub wz: f64,
    pub noise: CameraNoiseModel,
    pub lm: LmConfig,
}

impl Default for GaussFitConfig {
    fn default() -> Self {
        Self {
            dx: 0.1,
            dz: 0.2,
            wx: 0.1,
            wz: 0.2,
            noise: CameraNoiseModel::default(),
            lm: LmConfig::default(),
        }
    }
}

/// Result code of a fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    MaxIterations,
    Stalled,
}

impl From<LmTermination> for FitStatus {
    fn from(value: LmTermination) -> Self {
        match value {
            LmTermination::Converged => FitStatus::Converged,
            LmTermination::MaxIterations => FitStatus::MaxIterations,
            LmTermination::Stalled => FitStatus::Stalled,
        }
    }
}

/// A fitted bead
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussFitResult {
    pub amplitude: f64,
    /// Centre as 0-based pixel coordinates `[x, y, z]`
    pub center: [f64; 3],
    /// Lateral width in physical units
    pub sigma_xy: f64,
    /// Axial width in physical units
    pub sigma_z: f64,
    pub background: f64,
    /// Standard errors of `[A, x0, y0, z0, wxy, wz, bg]` in physical units,
    /// `None` when the covariance is singular
    pub errors: Option<[f64; NUM_PARAMS]>,
    pub reduced_chi2: f64,
    pub status: FitStatus,
    pub iterations: usize,
    pub roi: Roi3,
}

/// Isotropic-in-xy 3D Gaussian on a constant background
#[derive(Debug, Clone, Copy)]
struct Gaussian3D {
    min_wxy: f64,
    min_wz: f64,
}

impl Gaussian3D {
    #[inline]
    fn exponential(point: &[f64; 3], params: &[f64; NUM_PARAMS]) -> (f64, [f64; 3]) {
        let [_, x0, y0, z0, wxy, wz, _] = *params;
        let d = [point[0] - x0, point[1] - y0, point[2] - z0];
        let lateral = (d[0] * d[0] + d[1] * d[1]) / (2.0 * wxy * wxy);
        let axial = d[2] * d[2] / (2.0 * wz * wz);
        ((-lateral - axial).exp(), d)
    }
}

impl LmModel<NUM_PARAMS> for Gaussian3D {
    #[inline]
    fn evaluate(&self, point: &[f64; 3], params: &[f64; NUM_PARAMS]) -> f64 {
        let (e, _) = Self::exponential(point, params);
        params[0] * e + params[6]
    }

    #[inline]
    fn jacobian_row(&self, point: &[f64; 3], params: &[f64; NUM_PARAMS]) -> [f64; NUM_PARAMS] {
        let [amp, _, _, _, wxy, wz, _] = *params;
        let (e, d) = Self::exponential(point, params);
        let wxy2 = wxy * wxy;
        let wz2 = wz * wz;
        let amp_e = amp * e;

        [
            e,                                                    // df/dA
            amp_e * d[0] / wxy2,                                  // df/dx0
            amp_e * d[1] / wxy2,                                  // df/dy0
            amp_e * d[2] / wz2,                                   // df/dz0
            amp_e * (d[0] * d[0] + d[1] * d[1]) / (wxy2 * wxy),   // df/dwxy
            amp_e * d[2] * d[2] / (wz2 * wz),                     // df/dwz
            1.0,                                                  // df/dbg
        ]
    }

    #[inline]
    fn constrain(&self, params: &mut [f64; NUM_PARAMS]) {
        params[4] = params[4].abs().max(self.min_wxy);
        params[5] = params[5].abs().max(self.min_wz);
    }
}

/// Fits 3D Gaussians to regions of a volume
///
/// The volume is indexed `(z, y, x)`. The fitter borrows it read-only, so one
/// fitter can serve parallel fits of different regions.
#[derive(Debug, Clone, Copy)]
pub struct GaussFitter3D<'a> {
    data: ArrayView3<'a, f64>,
    config: GaussFitConfig,
}

impl<'a> GaussFitter3D<'a> {
    pub fn new(data: ArrayView3<'a, f64>, config: GaussFitConfig) -> Self {
        Self { data, config }
    }

    pub fn config(&self) -> &GaussFitConfig {
        &self.config
    }

    /// Fits one bead inside `roi`.
    pub fn fit(&self, roi: &Roi3) -> Result<GaussFitResult, FitError> {
        if !roi.fits_in(self.data.dim()) {
            return Err(FitError::EmptyRoi);
        }
        let GaussFitConfig { dx, dz, .. } = self.config;

        let capacity = roi.volume();
        let mut points = Vec::with_capacity(capacity);
        let mut values = Vec::with_capacity(capacity);
        let mut weights = Vec::with_capacity(capacity);
        for z in roi.min[0]..=roi.max[0] {
            for y in roi.min[1]..=roi.max[1] {
                for x in roi.min[2]..=roi.max[2] {
                    let value = self.data[[z, y, x]];
                    if !value.is_finite() {
                        return Err(FitError::NonFinite);
                    }
                    points.push([x as f64 * dx, y as f64 * dx, z as f64 * dz]);
                    values.push(value);
                    weights.push(self.config.noise.weight(value));
                }
            }
        }
        if values.len() <= NUM_PARAMS {
            return Err(FitError::InsufficientData {
                samples: values.len(),
                params: NUM_PARAMS,
            });
        }

        let initial = self.initial_guess(&points, &values);
        let model = Gaussian3D {
            min_wxy: 1e-3 * dx.abs(),
            min_wz: 1e-3 * dz.abs(),
        };
        let samples = WeightedSamples {
            points: &points,
            values: &values,
            weights: &weights,
        };
        let result = optimize(&model, &samples, initial, &self.config.lm);

        let params = result.params;
        if params.iter().any(|p| !p.is_finite()) || !result.chi2.is_finite() {
            return Err(FitError::NonFinite);
        }
        if params[0] <= 0.0 {
            return Err(FitError::Diverged(format!(
                "non-positive amplitude {:.3}",
                params[0]
            )));
        }

        let center = [params[1] / dx, params[2] / dx, params[3] / dz];
        check_bounds(center, self.data.dim())?;

        let dof = (values.len() - NUM_PARAMS) as f64;
        let reduced_chi2 = result.chi2 / dof;
        let errors = result.inverse_hessian.and_then(|inverse| {
            let mut errors = [0.0; NUM_PARAMS];
            for (i, e) in errors.iter_mut().enumerate() {
                *e = (inverse[(i, i)] * reduced_chi2).sqrt();
            }
            errors.iter().all(|e| e.is_finite()).then_some(errors)
        });

        trace!(
            "bead fit at ({:.2}, {:.2}, {:.2}) after {} iterations, {:?}",
            center[0],
            center[1],
            center[2],
            result.iterations,
            result.termination
        );

        Ok(GaussFitResult {
            amplitude: params[0],
            center,
            sigma_xy: params[4],
            sigma_z: params[5],
            background: params[6],
            errors,
            reduced_chi2,
            status: result.termination.into(),
            iterations: result.iterations,
            roi: *roi,
        })
    }

    /// Start vector from the intensity range and a half-max centroid.
    fn initial_guess(&self, points: &[[f64; 3]], values: &[f64]) -> [f64; NUM_PARAMS] {
        let (lo, hi) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        let amplitude = hi - lo;
        let half_max = 0.5 * amplitude;

        let mut sum = [0.0; 3];
        let mut total = 0.0;
        for (point, value) in points.iter().zip(values.iter()) {
            let above = value - lo;
            if above > half_max {
                for (s, p) in sum.iter_mut().zip(point.iter()) {
                    *s += above * p;
                }
                total += above;
            }
        }

        let center = if total > 0.0 {
            sum.map(|s| s / total)
        } else {
            let n = points.len() as f64;
            let mut mean = [0.0; 3];
            for point in points {
                for (m, p) in mean.iter_mut().zip(point.iter()) {
                    *m += p / n;
                }
            }
            mean
        };

        [
            amplitude,
            center[0],
            center[1],
            center[2],
            self.config.wx,
            self.config.wz,
            lo,
        ]
    }
}

/// Requires `0 < c < n - 1` on every axis for a `(z, y, x)` volume shape.
fn check_bounds(center: [f64; 3], shape: (usize, usize, usize)) -> Result<(), FitError> {
    let (nz, ny, nx) = shape;
    let limits = [nx, ny, nz];
    let inside = center
        .iter()
        .zip(limits.iter())
        .all(|(c, n)| *c > 0.0 && *c < n.saturating_sub(1) as f64);
    if inside {
        Ok(())
    } else {
        Err(FitError::OutOfBounds {
            x: center[0],
            y: center[1],
            z: center[2],
        })
    }
}

#[cfg(test)]
mod tests;
