//! Automatic threshold selection from the stability of the component count.
//!
//! Scanning thresholds from the minimum to the maximum of a filtered volume,
//! the number of connected components stays constant across a plateau where
//! every bead is separated from its neighbours and from the background. The most
//! frequent count is taken as the bead count and the lowest threshold giving it
//! marks the start of the plateau.

use log::{debug, warn};
use ndarray::ArrayView3;
use rayon::prelude::*;

use crate::label::count_components;

/// Most frequent value, the smallest one among ties.
pub fn mode_of(values: &[usize]) -> Option<usize> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();

    let mut best: Option<(usize, usize)> = None;
    for chunk in sorted.chunk_by(|a, b| a == b) {
        let candidate = (chunk[0], chunk.len());
        best = match best {
            Some((_, count)) if count >= candidate.1 => best,
            _ => Some(candidate),
        };
    }
    best.map(|(value, _)| value)
}

/// `steps` evenly spaced values from `lo` to `hi` inclusive.
fn linspace(lo: f64, hi: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![lo],
        _ => (0..steps)
            .map(|i| lo + (hi - lo) * i as f64 / (steps - 1) as f64)
            .collect(),
    }
}

/// Picks a segmentation threshold for `filtered`.
///
/// Returns `(threshold, component_count)`. Counts below `mincount` are ignored
/// when looking for the plateau; with `mincount = None` every non-zero count
/// takes part. When no count reaches `mincount` the plateau of all non-zero
/// counts is used instead. A volume without any component yields its maximum
/// and a count of zero.
pub fn get_thresh(
    filtered: ArrayView3<f64>,
    mincount: Option<usize>,
    steps: usize,
) -> (f64, usize) {
    let (lo, hi) = filtered
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    if filtered.is_empty() || hi.is_nan() || hi <= lo {
        return (if hi.is_finite() { hi } else { 0.0 }, 0);
    }

    let levels = linspace(lo, hi, steps.max(2));
    let counts: Vec<usize> = levels
        .par_iter()
        .map(|level| count_components(filtered, *level))
        .collect();
    debug!("component counts over {} threshold levels: {:?}", levels.len(), counts);

    let floor = mincount.unwrap_or(1).max(1);
    let mut candidates: Vec<usize> = counts.iter().copied().filter(|c| *c >= floor).collect();
    if candidates.is_empty() {
        if mincount.is_some() {
            warn!(
                "no threshold yields at least {} objects (max {}), using all non-zero counts",
                floor,
                counts.iter().max().copied().unwrap_or(0)
            );
        }
        candidates = counts.iter().copied().filter(|c| *c > 0).collect();
    }

    let Some(mode) = mode_of(&candidates) else {
        return (hi, 0);
    };
    let index = counts.iter().position(|c| *c == mode).unwrap_or(0);
    debug!("auto threshold {:.4} gives {} objects", levels[index], mode);
    (levels[index], mode)
}
