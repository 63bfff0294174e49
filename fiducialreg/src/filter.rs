//! Separable Gaussian and Laplacian-of-Gaussian filtering of 3D volumes.
//!
//! Volumes are `(z, y, x)` arrays. Borders use half-sample reflection
//! (`d c b a | a b c d | d c b a`) and kernels are truncated at `4σ`.

use ndarray::{Array3, ArrayView3, Axis, Zip};

/// Derivative order of a 1D Gaussian kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelOrder {
    Smooth,
    SecondDerivative,
}

/// Sampled 1D Gaussian (or its second derivative) with radius `round(4σ)`.
///
/// The smoothing kernel sums to one. The second-derivative taps are shifted to
/// sum to zero so a flat region filters to exactly zero.
pub fn gaussian_kernel(sigma: f64, order: KernelOrder) -> Vec<f64> {
    if sigma <= 0.0 {
        return match order {
            KernelOrder::Smooth => vec![1.0],
            KernelOrder::SecondDerivative => vec![0.0],
        };
    }

    let radius = (4.0 * sigma + 0.5) as i64;
    let sigma2 = sigma * sigma;
    let phi: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x * x) as f64 / sigma2).exp())
        .collect();
    let norm: f64 = phi.iter().sum();

    match order {
        KernelOrder::Smooth => phi.iter().map(|p| p / norm).collect(),
        KernelOrder::SecondDerivative => {
            let mut taps: Vec<f64> = (-radius..=radius)
                .zip(phi.iter())
                .map(|(x, p)| p / norm * ((x * x) as f64 - sigma2) / (sigma2 * sigma2))
                .collect();
            let mean = taps.iter().sum::<f64>() / taps.len() as f64;
            taps.iter_mut().for_each(|t| *t -= mean);
            taps
        }
    }
}

/// Maps an out-of-range index back into `[0, n)` by half-sample reflection.
fn reflect(index: i64, n: usize) -> usize {
    let n = n as i64;
    let period = 2 * n;
    let m = index.rem_euclid(period);
    if m < n {
        m as usize
    } else {
        (period - m - 1) as usize
    }
}

/// Correlates every lane along `axis` with `kernel` (centred, odd length).
pub fn convolve_axis(input: ArrayView3<f64>, kernel: &[f64], axis: Axis) -> Array3<f64> {
    let mut output = Array3::zeros(input.raw_dim());
    if input.is_empty() {
        return output;
    }
    let radius = (kernel.len() / 2) as i64;
    let n = input.len_of(axis);

    Zip::from(output.lanes_mut(axis))
        .and(input.lanes(axis))
        .par_for_each(|mut out, lane| {
            for (i, value) in out.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let source = reflect(i as i64 + k as i64 - radius, n);
                    acc += weight * lane[source];
                }
                *value = acc;
            }
        });
    output
}

/// Gaussian filter with per-axis sigmas `[z, y, x]`.
pub fn gaussian_filter(volume: ArrayView3<f64>, sigmas: [f64; 3]) -> Array3<f64> {
    let mut current = volume.to_owned();
    for (axis, sigma) in sigmas.iter().enumerate() {
        let kernel = gaussian_kernel(*sigma, KernelOrder::Smooth);
        if kernel.len() > 1 {
            current = convolve_axis(current.view(), &kernel, Axis(axis));
        }
    }
    current
}

/// Negated Laplacian of Gaussian with negative responses clipped to zero.
///
/// Bright blobs of roughly the filter size give strong positive peaks; the
/// surrounding negative ring and flat background become zero.
pub fn log_filter(volume: ArrayView3<f64>, xysig: f64, zsig: f64) -> Array3<f64> {
    let sigmas = [zsig, xysig, xysig];
    let smooth: Vec<Vec<f64>> = sigmas
        .iter()
        .map(|s| gaussian_kernel(*s, KernelOrder::Smooth))
        .collect();
    let second: Vec<Vec<f64>> = sigmas
        .iter()
        .map(|s| gaussian_kernel(*s, KernelOrder::SecondDerivative))
        .collect();

    // d²/dz² term
    let dz = convolve_axis(volume, &second[0], Axis(0));
    let dz = convolve_axis(dz.view(), &smooth[1], Axis(1));
    let mut laplacian = convolve_axis(dz.view(), &smooth[2], Axis(2));

    // shared z smoothing for the lateral terms
    let gz = convolve_axis(volume, &smooth[0], Axis(0));

    let dy = convolve_axis(gz.view(), &second[1], Axis(1));
    laplacian += &convolve_axis(dy.view(), &smooth[2], Axis(2));

    let gzy = convolve_axis(gz.view(), &smooth[1], Axis(1));
    laplacian += &convolve_axis(gzy.view(), &second[2], Axis(2));

    laplacian.mapv_inplace(|v| (-v).max(0.0));
    laplacian
}
