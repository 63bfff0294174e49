//! Spatial referencing between intrinsic (pixel) and world coordinates.
//!
//! Intrinsic coordinates are 1-based and pixel-centred: pixel `i` covers the
//! intrinsic interval `[i - 0.5, i + 0.5]`, so a grid of `n` samples spans
//! `[0.5, n + 0.5]`. In world units pixel 1 starts at `start` and has width
//! `delta`, giving
//!
//! ```text
//! world     = start + (intrinsic - 0.5) * delta
//! intrinsic = 0.5 + (world - start) / delta
//! ```
//!
//! A negative `delta` means world coordinates decrease as the pixel index grows.
//!
//! All types here are immutable values. Changing the sample count or the world
//! limits goes through `with_*` methods that return a new, consistent value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when building a spatial reference
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImRefError {
    #[error("number of samples must be at least 1")]
    ZeroSamples,

    #[error("world limits must be ascending, got [{lo}, {hi}]")]
    NonAscendingLimits { lo: f64, hi: f64 },

    #[error("pixel extent must be finite and non-zero, got {0}")]
    InvalidDelta(f64),
}

/// One axis of a spatial reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionManager {
    number_of_samples: usize,
    delta: f64,
    start_coordinate_in_world: f64,
}

impl DimensionManager {
    pub fn new(number_of_samples: usize, delta: f64, start: f64) -> Result<Self, ImRefError> {
        if number_of_samples == 0 {
            return Err(ImRefError::ZeroSamples);
        }
        if delta == 0.0 || !delta.is_finite() {
            return Err(ImRefError::InvalidDelta(delta));
        }
        Ok(Self {
            number_of_samples,
            delta,
            start_coordinate_in_world: start,
        })
    }

    /// Unit pixels: world and intrinsic coordinates coincide.
    pub fn with_unit_spacing(number_of_samples: usize) -> Result<Self, ImRefError> {
        Self::new(number_of_samples, 1.0, 0.5)
    }

    /// Pixels of width `delta` with world limits `[delta/2, (n + 1/2)·delta]`.
    pub fn from_pixel_extent(number_of_samples: usize, delta: f64) -> Result<Self, ImRefError> {
        Self::new(number_of_samples, delta, 0.5 * delta)
    }

    /// Solves `delta` and `start` so that the grid spans `limits`.
    pub fn from_world_limits(number_of_samples: usize, limits: [f64; 2]) -> Result<Self, ImRefError> {
        let [lo, hi] = limits;
        if hi.is_nan() || lo.is_nan() || hi <= lo {
            return Err(ImRefError::NonAscendingLimits { lo, hi });
        }
        if number_of_samples == 0 {
            return Err(ImRefError::ZeroSamples);
        }
        Self::new(number_of_samples, (hi - lo) / number_of_samples as f64, lo)
    }

    pub fn number_of_samples(&self) -> usize {
        self.number_of_samples
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn start_coordinate_in_world(&self) -> f64 {
        self.start_coordinate_in_world
    }

    /// World interval covered by the grid, always ascending.
    pub fn world_limits(&self) -> [f64; 2] {
        let end = self.start_coordinate_in_world + self.number_of_samples as f64 * self.delta;
        if self.delta > 0.0 {
            [self.start_coordinate_in_world, end]
        } else {
            [end, self.start_coordinate_in_world]
        }
    }

    pub fn intrinsic_limits(&self) -> [f64; 2] {
        [0.5, self.number_of_samples as f64 + 0.5]
    }

    pub fn extent_in_world(&self) -> f64 {
        self.number_of_samples as f64 * self.delta.abs()
    }

    /// Same sample count, new world limits.
    pub fn with_world_limits(&self, limits: [f64; 2]) -> Result<Self, ImRefError> {
        self.resampled(self.number_of_samples, limits)
    }

    /// New sample count; `delta` is re-solved so the world limits are preserved.
    pub fn with_sample_count(&self, number_of_samples: usize) -> Result<Self, ImRefError> {
        self.resampled(number_of_samples, self.world_limits())
    }

    fn resampled(&self, number_of_samples: usize, limits: [f64; 2]) -> Result<Self, ImRefError> {
        let updated = Self::from_world_limits(number_of_samples, limits)?;
        if self.delta > 0.0 {
            Ok(updated)
        } else {
            Self::new(number_of_samples, -updated.delta, limits[1])
        }
    }

    pub fn intrinsic_to_world(&self, intrinsic: f64) -> f64 {
        self.start_coordinate_in_world + (intrinsic - 0.5) * self.delta
    }

    pub fn world_to_intrinsic(&self, world: f64) -> f64 {
        0.5 + (world - self.start_coordinate_in_world) / self.delta
    }

    /// 1-based index of the pixel containing `world`, `None` outside the grid.
    pub fn world_to_subscript(&self, world: f64) -> Option<usize> {
        if !self.contains(world) {
            return None;
        }
        let index = self.world_to_intrinsic(world).round().max(1.0) as usize;
        Some(index.min(self.number_of_samples))
    }

    pub fn contains(&self, world: f64) -> bool {
        let [lo, hi] = self.world_limits();
        world >= lo && world <= hi
    }
}

/// Spatial reference of a 2D image with shape `(rows, cols)` = `(y, x)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImRef2d {
    pub x: DimensionManager,
    pub y: DimensionManager,
}

impl ImRef2d {
    /// Unit pixels for an image of shape `(ny, nx)`.
    pub fn new(image_size: (usize, usize)) -> Result<Self, ImRefError> {
        let (ny, nx) = image_size;
        Ok(Self {
            x: DimensionManager::with_unit_spacing(nx)?,
            y: DimensionManager::with_unit_spacing(ny)?,
        })
    }

    pub fn with_pixel_extents(
        image_size: (usize, usize),
        dx: f64,
        dy: f64,
    ) -> Result<Self, ImRefError> {
        let (ny, nx) = image_size;
        Ok(Self {
            x: DimensionManager::from_pixel_extent(nx, dx)?,
            y: DimensionManager::from_pixel_extent(ny, dy)?,
        })
    }

    pub fn from_world_limits(
        image_size: (usize, usize),
        x_limits: [f64; 2],
        y_limits: [f64; 2],
    ) -> Result<Self, ImRefError> {
        let (ny, nx) = image_size;
        Ok(Self {
            x: DimensionManager::from_world_limits(nx, x_limits)?,
            y: DimensionManager::from_world_limits(ny, y_limits)?,
        })
    }

    /// Shape as `(ny, nx)`.
    pub fn image_size(&self) -> (usize, usize) {
        (self.y.number_of_samples(), self.x.number_of_samples())
    }

    pub fn with_image_size(&self, image_size: (usize, usize)) -> Result<Self, ImRefError> {
        let (ny, nx) = image_size;
        Ok(Self {
            x: self.x.with_sample_count(nx)?,
            y: self.y.with_sample_count(ny)?,
        })
    }

    pub fn pixel_extent_in_world(&self) -> (f64, f64) {
        (self.x.delta().abs(), self.y.delta().abs())
    }

    pub fn image_extent_in_world(&self) -> (f64, f64) {
        (self.x.extent_in_world(), self.y.extent_in_world())
    }

    pub fn intrinsic_to_world(&self, xi: f64, yi: f64) -> (f64, f64) {
        (self.x.intrinsic_to_world(xi), self.y.intrinsic_to_world(yi))
    }

    pub fn world_to_intrinsic(&self, xw: f64, yw: f64) -> (f64, f64) {
        (self.x.world_to_intrinsic(xw), self.y.world_to_intrinsic(yw))
    }

    /// `[row, col]` 1-based subscripts, `None` outside the image.
    pub fn world_to_subscript(&self, xw: f64, yw: f64) -> Option<[usize; 2]> {
        Some([self.y.world_to_subscript(yw)?, self.x.world_to_subscript(xw)?])
    }

    pub fn contains(&self, xw: f64, yw: f64) -> bool {
        self.x.contains(xw) && self.y.contains(yw)
    }

    pub fn sizes_match(&self, other: &Self) -> bool {
        self.image_size() == other.image_size()
    }
}

/// Spatial reference of a volume with shape `(planes, rows, cols)` = `(z, y, x)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImRef3d {
    pub x: DimensionManager,
    pub y: DimensionManager,
    pub z: DimensionManager,
}

impl ImRef3d {
    /// Unit voxels for a volume of shape `(nz, ny, nx)`.
    pub fn new(image_size: (usize, usize, usize)) -> Result<Self, ImRefError> {
        let (nz, ny, nx) = image_size;
        Ok(Self {
            x: DimensionManager::with_unit_spacing(nx)?,
            y: DimensionManager::with_unit_spacing(ny)?,
            z: DimensionManager::with_unit_spacing(nz)?,
        })
    }

    pub fn with_pixel_extents(
        image_size: (usize, usize, usize),
        dx: f64,
        dy: f64,
        dz: f64,
    ) -> Result<Self, ImRefError> {
        let (nz, ny, nx) = image_size;
        Ok(Self {
            x: DimensionManager::from_pixel_extent(nx, dx)?,
            y: DimensionManager::from_pixel_extent(ny, dy)?,
            z: DimensionManager::from_pixel_extent(nz, dz)?,
        })
    }

    pub fn from_world_limits(
        image_size: (usize, usize, usize),
        x_limits: [f64; 2],
        y_limits: [f64; 2],
        z_limits: [f64; 2],
    ) -> Result<Self, ImRefError> {
        let (nz, ny, nx) = image_size;
        Ok(Self {
            x: DimensionManager::from_world_limits(nx, x_limits)?,
            y: DimensionManager::from_world_limits(ny, y_limits)?,
            z: DimensionManager::from_world_limits(nz, z_limits)?,
        })
    }

    /// Shape as `(nz, ny, nx)`.
    pub fn image_size(&self) -> (usize, usize, usize) {
        (
            self.z.number_of_samples(),
            self.y.number_of_samples(),
            self.x.number_of_samples(),
        )
    }

    pub fn with_image_size(&self, image_size: (usize, usize, usize)) -> Result<Self, ImRefError> {
        let (nz, ny, nx) = image_size;
        Ok(Self {
            x: self.x.with_sample_count(nx)?,
            y: self.y.with_sample_count(ny)?,
            z: self.z.with_sample_count(nz)?,
        })
    }

    pub fn pixel_extent_in_world(&self) -> (f64, f64, f64) {
        (
            self.x.delta().abs(),
            self.y.delta().abs(),
            self.z.delta().abs(),
        )
    }

    pub fn image_extent_in_world(&self) -> (f64, f64, f64) {
        (
            self.x.extent_in_world(),
            self.y.extent_in_world(),
            self.z.extent_in_world(),
        )
    }

    pub fn intrinsic_to_world(&self, xi: f64, yi: f64, zi: f64) -> (f64, f64, f64) {
        (
            self.x.intrinsic_to_world(xi),
            self.y.intrinsic_to_world(yi),
            self.z.intrinsic_to_world(zi),
        )
    }

    pub fn world_to_intrinsic(&self, xw: f64, yw: f64, zw: f64) -> (f64, f64, f64) {
        (
            self.x.world_to_intrinsic(xw),
            self.y.world_to_intrinsic(yw),
            self.z.world_to_intrinsic(zw),
        )
    }

    /// `[row, col, plane]` 1-based subscripts, `None` outside the volume.
    pub fn world_to_subscript(&self, xw: f64, yw: f64, zw: f64) -> Option<[usize; 3]> {
        Some([
            self.y.world_to_subscript(yw)?,
            self.x.world_to_subscript(xw)?,
            self.z.world_to_subscript(zw)?,
        ])
    }

    pub fn contains(&self, xw: f64, yw: f64, zw: f64) -> bool {
        self.x.contains(xw) && self.y.contains(yw) && self.z.contains(zw)
    }

    pub fn sizes_match(&self, other: &Self) -> bool {
        self.image_size() == other.image_size()
    }
}
