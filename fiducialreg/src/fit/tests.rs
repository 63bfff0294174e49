//! Tests for 3D Gaussian bead fitting.

use super::*;
use approx::assert_relative_eq;
use ndarray::Array3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

const SHAPE: (usize, usize, usize) = (15, 21, 21);

/// Bead with widths in pixels, centre as `[x, y, z]` pixels.
fn make_bead(center: [f64; 3], sigma_px: [f64; 2], amplitude: f64, background: f64) -> Array3<f64> {
    Array3::from_shape_fn(SHAPE, |(z, y, x)| {
        let dx = x as f64 - center[0];
        let dy = y as f64 - center[1];
        let dz = z as f64 - center[2];
        let exponent = (dx * dx + dy * dy) / (2.0 * sigma_px[0] * sigma_px[0])
            + dz * dz / (2.0 * sigma_px[1] * sigma_px[1]);
        amplitude * (-exponent).exp() + background
    })
}

#[test]
fn test_fit_noiseless_bead() {
    let truth = [10.3, 9.6, 7.2];
    let volume = make_bead(truth, [1.5, 1.2], 1000.0, 100.0);
    let config = GaussFitConfig::default();
    let fitter = GaussFitter3D::new(volume.view(), config);

    let result = fitter.fit(&Roi3::full(SHAPE)).unwrap();
    for (fitted, expected) in result.center.iter().zip(truth.iter()) {
        assert_relative_eq!(*fitted, *expected, epsilon = 1e-3);
    }
    assert_relative_eq!(result.amplitude, 1000.0, epsilon = 0.5);
    assert_relative_eq!(result.background, 100.0, epsilon = 0.5);
    assert_relative_eq!(result.sigma_xy, 1.5 * config.dx, epsilon = 1e-4);
    assert_relative_eq!(result.sigma_z, 1.2 * config.dz, epsilon = 1e-4);
    assert_eq!(result.status, FitStatus::Converged);
    assert_eq!(result.roi, Roi3::full(SHAPE));
}

#[test]
fn test_fit_sub_roi() {
    let truth = [6.4, 12.2, 5.0];
    let volume = make_bead(truth, [1.5, 1.2], 500.0, 50.0);
    let fitter = GaussFitter3D::new(volume.view(), GaussFitConfig::default());

    let roi = Roi3::from_bounds([1, 8, 2], [9, 16, 10]);
    let result = fitter.fit(&roi).unwrap();
    assert_relative_eq!(result.center[0], truth[0], epsilon = 1e-3);
    assert_relative_eq!(result.center[1], truth[1], epsilon = 1e-3);
    assert_relative_eq!(result.center[2], truth[2], epsilon = 1e-3);
}

#[test]
fn test_noisy_fit_reports_errors() {
    let truth = [10.0, 10.5, 7.5];
    let clean = make_bead(truth, [1.5, 1.2], 800.0, 100.0);
    let config = GaussFitConfig::default();

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let noisy = clean.mapv(|v| {
        let sd = config.noise.variance(v).sqrt();
        v + Normal::new(0.0, sd).unwrap().sample(&mut rng)
    });

    let fitter = GaussFitter3D::new(noisy.view(), config);
    let result = fitter.fit(&Roi3::full(SHAPE)).unwrap();

    let errors = result.errors.expect("covariance should be available");
    assert!(errors.iter().all(|e| *e > 0.0));
    assert!(result.reduced_chi2 > 0.7 && result.reduced_chi2 < 1.4);
    for (fitted, expected) in result.center.iter().zip(truth.iter()) {
        assert!((fitted - expected).abs() < 0.1);
    }
}

#[test]
fn test_flat_region_diverges() {
    let volume = Array3::from_elem(SHAPE, 100.0);
    let fitter = GaussFitter3D::new(volume.view(), GaussFitConfig::default());
    let result = fitter.fit(&Roi3::from_bounds([2, 2, 2], [8, 8, 8]));
    assert!(matches!(result, Err(FitError::Diverged(_))));
}

#[test]
fn test_insufficient_data() {
    let volume = make_bead([10.0, 10.0, 7.0], [1.5, 1.2], 1000.0, 100.0);
    let fitter = GaussFitter3D::new(volume.view(), GaussFitConfig::default());
    let result = fitter.fit(&Roi3::from_bounds([7, 10, 10], [7, 11, 11]));
    assert_eq!(
        result,
        Err(FitError::InsufficientData {
            samples: 4,
            params: NUM_PARAMS
        })
    );
}

#[test]
fn test_roi_outside_volume() {
    let volume = make_bead([10.0, 10.0, 7.0], [1.5, 1.2], 1000.0, 100.0);
    let fitter = GaussFitter3D::new(volume.view(), GaussFitConfig::default());
    assert_eq!(
        fitter.fit(&Roi3::from_bounds([0, 0, 0], [20, 20, 20])),
        Err(FitError::EmptyRoi)
    );
    assert_eq!(fitter.fit(&Roi3::new()), Err(FitError::EmptyRoi));
}

#[test]
fn test_non_finite_voxel() {
    let mut volume = make_bead([10.0, 10.0, 7.0], [1.5, 1.2], 1000.0, 100.0);
    volume[[7, 10, 10]] = f64::NAN;
    let fitter = GaussFitter3D::new(volume.view(), GaussFitConfig::default());
    assert_eq!(fitter.fit(&Roi3::full(SHAPE)), Err(FitError::NonFinite));
}

#[test]
fn test_bounds_are_strict() {
    assert!(check_bounds([1.0, 1.0, 1.0], SHAPE).is_ok());
    assert!(check_bounds([0.0, 5.0, 5.0], SHAPE).is_err());
    assert!(check_bounds([20.0, 5.0, 5.0], SHAPE).is_err());
    assert!(check_bounds([19.9, 19.9, 13.9], SHAPE).is_ok());
    assert!(check_bounds([5.0, 5.0, 14.0], SHAPE).is_err());
}

#[test]
fn test_noise_model_variance() {
    let noise = CameraNoiseModel::default();
    // 50 electrons at 0.5 e/ADU
    let expected = (1.2f64.powi(2) + 1.41f64.powi(2) * 50.0) / 0.25;
    assert_relative_eq!(noise.variance(100.0), expected, epsilon = 1e-9);
    // below the offset only read noise remains
    assert_relative_eq!(noise.variance(-5.0), 1.44 / 0.25, epsilon = 1e-12);
    assert_relative_eq!(noise.weight(100.0), 1.0 / expected, epsilon = 1e-12);
}
