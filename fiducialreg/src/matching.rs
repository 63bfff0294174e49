//! Bead correspondence between point clouds.
//!
//! Clouds are `3×N` matrices with one point per column. Two clouds are matched
//! by nearest neighbour, one-to-one, with a robust filter on the distribution
//! of neighbour distances: pairs whose distance deviates from the median by more
//! than `k·MAD` are dropped. Several clouds are matched against the first one
//! and then pruned pairwise until every remaining tuple is mutually consistent.

use std::collections::HashMap;

use log::debug;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Centre statistic used by the distance filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    #[default]
    Median,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub method: MatchMethod,
    /// Pairs farther than `mad_multiplier · MAD` from the centre distance are dropped
    pub mad_multiplier: f64,
    /// Floor on the accepted deviation from the centre distance, in the working units.
    ///
    /// Clean data gives nearly identical distances and a MAD at rounding level;
    /// deviations below this floor are never treated as outliers.
    pub min_spread: f64,
    /// Hard cutoff on the neighbour distance, in the working units
    pub max_distance: Option<f64>,
    /// Match in world coordinates instead of pixels
    pub in_world: bool,
    /// Upper bound on consistency passes over all cloud pairs
    pub max_passes: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            method: MatchMethod::Median,
            mad_multiplier: 4.0,
            min_spread: 1e-3,
            max_distance: None,
            in_world: false,
            max_passes: 10,
        }
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    })
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// `(centre, deviation)`: the median and median absolute deviation, or the mean
/// and mean absolute deviation.
pub fn mad(values: &[f64], method: MatchMethod) -> Option<(f64, f64)> {
    let centre_of = |v: &[f64]| match method {
        MatchMethod::Median => median(v),
        MatchMethod::Mean => mean(v),
    };
    let centre = centre_of(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - centre).abs()).collect();
    Some((centre, centre_of(&deviations)?))
}

/// For every column of `a`, the distance to and index of its nearest column in `b`.
///
/// Both outputs are empty when `b` has no points.
pub fn get_closest_points(a: &DMatrix<f64>, b: &DMatrix<f64>) -> (Vec<f64>, Vec<usize>) {
    if b.ncols() == 0 || a.nrows() != b.nrows() {
        return (Vec::new(), Vec::new());
    }
    (0..a.ncols())
        .into_par_iter()
        .map(|i| {
            let point = a.column(i);
            b.column_iter()
                .enumerate()
                .map(|(j, candidate)| ((candidate - point).norm(), j))
                .fold((f64::INFINITY, 0), |best, current| {
                    if current.0 < best.0 {
                        current
                    } else {
                        best
                    }
                })
        })
        .unzip()
}

/// One-to-one nearest-neighbour pairs `(index in a, index in b)`, sorted by the
/// index in `a`.
///
/// A point of `b` claimed by several points of `a` stays with the closest one.
/// With `robust` set the distance filter of `config` is applied as well.
fn nearest_pairs(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    config: &MatchingConfig,
    robust: bool,
) -> Vec<(usize, usize)> {
    let (distances, indices) = get_closest_points(a, b);

    let mut owner: HashMap<usize, (usize, f64)> = HashMap::new();
    for (ia, (&ib, &d)) in indices.iter().zip(distances.iter()).enumerate() {
        let entry = owner.entry(ib).or_insert((ia, d));
        if d < entry.1 {
            *entry = (ia, d);
        }
    }

    let mut pairs: Vec<(usize, usize, f64)> = owner
        .into_iter()
        .map(|(ib, (ia, d))| (ia, ib, d))
        .filter(|(_, _, d)| config.max_distance.map_or(true, |max| *d <= max))
        .collect();
    pairs.sort_unstable_by_key(|(ia, _, _)| *ia);

    if robust {
        let kept: Vec<f64> = pairs.iter().map(|(_, _, d)| *d).collect();
        if let Some((centre, deviation)) = mad(&kept, config.method) {
            let limit = (config.mad_multiplier * deviation).max(config.min_spread);
            pairs.retain(|(_, _, d)| (d - centre).abs() <= limit);
        }
    }

    pairs.into_iter().map(|(ia, ib, _)| (ia, ib)).collect()
}

/// Matched pairs `(index in a, index in b)` between two clouds.
pub fn get_matching_points(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    config: &MatchingConfig,
) -> Vec<(usize, usize)> {
    let pairs = nearest_pairs(a, b, config, true);
    debug!(
        "matched {} of {}/{} points",
        pairs.len(),
        a.ncols(),
        b.ncols()
    );
    pairs
}

fn select_columns(cloud: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    cloud.select_columns(indices.iter())
}

/// Corresponding points across all `clouds`.
///
/// Returns one index list per cloud, all of the same length; entry `t` of every
/// list refers to the same bead. Each cloud is first matched against cloud 0
/// with the robust filter. Tuples are then dropped whenever, for some pair of
/// clouds, the nearest neighbour among the remaining points is not the tuple
/// partner, until a pass over all pairs changes nothing.
pub fn match_clouds(clouds: &[&DMatrix<f64>], config: &MatchingConfig) -> Vec<Vec<usize>> {
    match clouds {
        [] => return Vec::new(),
        [only] => return vec![(0..only.ncols()).collect()],
        _ => {}
    }

    let anchor = clouds[0];
    let maps: Vec<HashMap<usize, usize>> = clouds[1..]
        .iter()
        .map(|cloud| {
            get_matching_points(anchor, cloud, config)
                .into_iter()
                .collect()
        })
        .collect();

    let mut tuples: Vec<Vec<usize>> = (0..anchor.ncols())
        .filter_map(|ia| {
            let mut tuple = Vec::with_capacity(clouds.len());
            tuple.push(ia);
            for map in &maps {
                tuple.push(*map.get(&ia)?);
            }
            Some(tuple)
        })
        .collect();
    debug!("{} tuples common to all {} clouds", tuples.len(), clouds.len());

    for pass in 0..config.max_passes {
        let before = tuples.len();
        for j in 0..clouds.len() {
            for k in (j + 1)..clouds.len() {
                if tuples.is_empty() {
                    break;
                }
                let sub_j: Vec<usize> = tuples.iter().map(|t| t[j]).collect();
                let sub_k: Vec<usize> = tuples.iter().map(|t| t[k]).collect();
                let pairs = nearest_pairs(
                    &select_columns(clouds[j], &sub_j),
                    &select_columns(clouds[k], &sub_k),
                    config,
                    pass == 0 && j > 0,
                );
                let consistent: Vec<usize> = pairs
                    .into_iter()
                    .filter_map(|(pj, pk)| (pj == pk).then_some(pj))
                    .collect();
                tuples = consistent.into_iter().map(|t| tuples[t].clone()).collect();
            }
        }
        debug!("consistency pass {}: {} -> {} tuples", pass + 1, before, tuples.len());
        if tuples.len() == before {
            break;
        }
    }

    (0..clouds.len())
        .map(|c| tuples.iter().map(|t| t[c]).collect())
        .collect()
}
