//! Connected-component labelling and bounding boxes for 3D masks.

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in a `(z, y, x)` volume with inclusive bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi3 {
    /// Minimum `(z, y, x)` index (inclusive)
    pub min: [usize; 3],
    /// Maximum `(z, y, x)` index (inclusive)
    pub max: [usize; 3],
}

impl Default for Roi3 {
    fn default() -> Self {
        Self::new()
    }
}

impl Roi3 {
    /// Empty box that becomes valid once a voxel is added with `expand_to_include`.
    pub fn new() -> Self {
        Self {
            min: [usize::MAX; 3],
            max: [0; 3],
        }
    }

    pub fn from_bounds(min: [usize; 3], max: [usize; 3]) -> Self {
        Self { min, max }
    }

    /// Box covering a whole volume of the given shape.
    pub fn full(shape: (usize, usize, usize)) -> Self {
        let (nz, ny, nx) = shape;
        Self {
            min: [0; 3],
            max: [
                nz.saturating_sub(1),
                ny.saturating_sub(1),
                nx.saturating_sub(1),
            ],
        }
    }

    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| self.min[i] <= self.max[i])
    }

    pub fn expand_to_include(&mut self, z: usize, y: usize, x: usize) {
        for (axis, value) in [z, y, x].into_iter().enumerate() {
            self.min[axis] = self.min[axis].min(value);
            self.max[axis] = self.max[axis].max(value);
        }
    }

    /// Extent along each axis as `(nz, ny, nx)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        if !self.is_valid() {
            return (0, 0, 0);
        }
        (
            self.max[0] - self.min[0] + 1,
            self.max[1] - self.min[1] + 1,
            self.max[2] - self.min[2] + 1,
        )
    }

    /// Number of voxels inside the box.
    pub fn volume(&self) -> usize {
        let (nz, ny, nx) = self.shape();
        nz * ny * nx
    }

    /// Grows the box by `padding` voxels on every side, clipped to `shape`.
    pub fn padded(&self, padding: usize, shape: (usize, usize, usize)) -> Self {
        if !self.is_valid() {
            return *self;
        }
        let limits = [shape.0, shape.1, shape.2];
        let mut out = *self;
        for axis in 0..3 {
            out.min[axis] = self.min[axis].saturating_sub(padding);
            out.max[axis] = (self.max[axis] + padding).min(limits[axis].saturating_sub(1));
        }
        out
    }

    /// Whether the box lies entirely inside a volume of `shape`.
    pub fn fits_in(&self, shape: (usize, usize, usize)) -> bool {
        self.is_valid() && self.max[0] < shape.0 && self.max[1] < shape.1 && self.max[2] < shape.2
    }
}

const FACE_NEIGHBOURS: [(isize, isize, isize); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

/// Labels face-connected (6-neighbourhood) components of a binary mask.
///
/// Returns the label volume (0 = background, components numbered from 1 in
/// raster order of their first voxel) and the component count.
pub fn label_components(mask: ArrayView3<bool>) -> (Array3<u32>, u32) {
    let (nz, ny, nx) = mask.dim();
    let mut labels = Array3::zeros((nz, ny, nx));
    let mut label_counter = 0;
    let mut stack = Vec::new();

    for ((z, y, x), &set) in mask.indexed_iter() {
        if !set || labels[[z, y, x]] != 0 {
            continue;
        }
        label_counter += 1;
        labels[[z, y, x]] = label_counter;
        stack.push((z, y, x));

        while let Some((cz, cy, cx)) = stack.pop() {
            for &(dz, dy, dx) in &FACE_NEIGHBOURS {
                let (Some(qz), Some(qy), Some(qx)) = (
                    cz.checked_add_signed(dz).filter(|v| *v < nz),
                    cy.checked_add_signed(dy).filter(|v| *v < ny),
                    cx.checked_add_signed(dx).filter(|v| *v < nx),
                ) else {
                    continue;
                };
                if mask[[qz, qy, qx]] && labels[[qz, qy, qx]] == 0 {
                    labels[[qz, qy, qx]] = label_counter;
                    stack.push((qz, qy, qx));
                }
            }
        }
    }

    (labels, label_counter)
}

/// Number of face-connected components in `volume > threshold`.
pub fn count_components(volume: ArrayView3<f64>, threshold: f64) -> usize {
    let mask = volume.mapv(|v| v > threshold);
    label_components(mask.view()).1 as usize
}

/// Bounding box of every label `1..=num_labels`, indexed by `label - 1`.
pub fn find_objects(labels: ArrayView3<u32>, num_labels: u32) -> Vec<Roi3> {
    let mut boxes = vec![Roi3::new(); num_labels as usize];
    for ((z, y, x), &label) in labels.indexed_iter() {
        if label > 0 && label <= num_labels {
            boxes[label as usize - 1].expand_to_include(z, y, x);
        }
    }
    boxes
}
