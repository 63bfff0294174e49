//! Synthetic bead volumes for tests and demos.

use ndarray::{Array3, Zip};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::fit::CameraNoiseModel;

/// A Gaussian bead with its centre in 0-based pixel coordinates `[x, y, z]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticBead {
    pub center: [f64; 3],
    pub sigma_xy: f64,
    pub sigma_z: f64,
    pub amplitude: f64,
}

impl SyntheticBead {
    pub fn new(center: [f64; 3], sigma_xy: f64, sigma_z: f64, amplitude: f64) -> Self {
        Self {
            center,
            sigma_xy,
            sigma_z,
            amplitude,
        }
    }

    /// Same bead moved by `shift` pixels.
    pub fn shifted(&self, shift: [f64; 3]) -> Self {
        let mut out = *self;
        for (c, s) in out.center.iter_mut().zip(shift.iter()) {
            *c += s;
        }
        out
    }

    fn value_at(&self, x: f64, y: f64, z: f64) -> f64 {
        let dx = x - self.center[0];
        let dy = y - self.center[1];
        let dz = z - self.center[2];
        let exponent = (dx * dx + dy * dy) / (2.0 * self.sigma_xy * self.sigma_xy)
            + dz * dz / (2.0 * self.sigma_z * self.sigma_z);
        self.amplitude * (-exponent).exp()
    }
}

/// Renders `beads` on a flat `background` into a `(z, y, x)` volume.
pub fn render_beads(
    shape: (usize, usize, usize),
    beads: &[SyntheticBead],
    background: f64,
) -> Array3<f64> {
    let mut volume = Array3::from_elem(shape, background);
    Zip::indexed(&mut volume).par_for_each(|(z, y, x), value| {
        let (xf, yf, zf) = (x as f64, y as f64, z as f64);
        *value += beads.iter().map(|b| b.value_at(xf, yf, zf)).sum::<f64>();
    });
    volume
}

/// Up to `n` random centres at least `margin` pixels from every face and
/// `min_separation` pixels from each other.
///
/// Fewer points are returned when the volume cannot hold `n` of them.
pub fn scattered_positions(
    n: usize,
    shape: (usize, usize, usize),
    margin: f64,
    min_separation: f64,
    seed: u64,
) -> Vec<[f64; 3]> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let (nz, ny, nx) = shape;
    let extent = [nx as f64, ny as f64, nz as f64];
    if extent.iter().any(|e| e - 1.0 - 2.0 * margin <= 0.0) {
        return Vec::new();
    }

    let mut positions: Vec<[f64; 3]> = Vec::with_capacity(n);
    let max_attempts = 1000 * n.max(1);
    for _ in 0..max_attempts {
        if positions.len() == n {
            break;
        }
        let candidate = extent.map(|e| rng.random_range(margin..(e - 1.0 - margin)));
        let separated = positions.iter().all(|p| {
            let d2: f64 = p
                .iter()
                .zip(candidate.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            d2 >= min_separation * min_separation
        });
        if separated {
            positions.push(candidate);
        }
    }
    positions
}

/// Adds camera noise drawn from `noise` to every voxel.
pub fn add_noise(volume: &mut Array3<f64>, noise: &CameraNoiseModel, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    volume.mapv_inplace(|v| {
        let sd = noise.variance(v).sqrt();
        match Normal::new(0.0, sd) {
            Ok(distribution) => v + distribution.sample(&mut rng),
            Err(_) => v,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_render_peak() {
        let bead = SyntheticBead::new([5.0, 6.0, 3.0], 1.0, 1.5, 200.0);
        let volume = render_beads((8, 12, 12), &[bead], 10.0);
        assert_relative_eq!(volume[[3, 6, 5]], 210.0, epsilon = 1e-12);
        assert!(volume[[3, 6, 6]] < 210.0);
        assert_relative_eq!(volume[[0, 0, 0]], 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_positions_respect_margin_and_separation() {
        let shape = (20, 40, 40);
        let positions = scattered_positions(8, shape, 4.0, 6.0, 3);
        assert_eq!(positions.len(), 8);
        for p in &positions {
            assert!(p[0] >= 4.0 && p[0] <= 35.0);
            assert!(p[2] >= 4.0 && p[2] <= 15.0);
        }
        for (i, a) in positions.iter().enumerate() {
            for b in &positions[i + 1..] {
                let d2: f64 = a.iter().zip(b).map(|(u, v)| (u - v).powi(2)).sum();
                assert!(d2 >= 36.0);
            }
        }
        assert_eq!(scattered_positions(8, shape, 4.0, 6.0, 3), positions);
    }

    #[test]
    fn test_positions_in_tiny_volume() {
        assert!(scattered_positions(3, (4, 4, 4), 2.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_noise_is_reproducible() {
        let mut a = Array3::from_elem((2, 3, 4), 100.0);
        let mut b = a.clone();
        add_noise(&mut a, &CameraNoiseModel::default(), 9);
        add_noise(&mut b, &CameraNoiseModel::default(), 9);
        assert_eq!(a, b);
        assert!(a.iter().any(|v| (v - 100.0).abs() > 1e-6));
    }
}
