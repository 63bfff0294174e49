//! Bead point cloud of a single channel.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use fidreg_math::ImRef3d;
use log::{debug, info, warn};
use nalgebra::DMatrix;
use ndarray::{Array3, ArrayView3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::filter::log_filter;
use crate::fit::{CameraNoiseModel, GaussFitConfig, GaussFitResult, GaussFitter3D, LmConfig};
use crate::io::read_tiff_stack;
use crate::label::{find_objects, label_components, Roi3};
use crate::persist::FiducialCloudRecord;
use crate::threshold::get_thresh;

/// Segmentation threshold on the filtered volume
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "ThresholdRepr", into = "ThresholdRepr")]
pub enum Threshold {
    /// Picked from the plateau of component counts
    #[default]
    Auto,
    Fixed(f64),
}

/// Wire form of [`Threshold`]: the string `"auto"` or a number
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ThresholdRepr {
    Value(f64),
    Name(String),
}

impl TryFrom<ThresholdRepr> for Threshold {
    type Error = String;

    fn try_from(value: ThresholdRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            ThresholdRepr::Value(v) => Ok(Threshold::Fixed(v)),
            ThresholdRepr::Name(name) if name == "auto" => Ok(Threshold::Auto),
            ThresholdRepr::Name(name) => Err(format!("invalid threshold '{name}'")),
        }
    }
}

impl From<Threshold> for ThresholdRepr {
    fn from(value: Threshold) -> Self {
        match value {
            Threshold::Auto => ThresholdRepr::Name("auto".to_string()),
            Threshold::Fixed(v) => ThresholdRepr::Value(v),
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Auto => f.write_str("auto"),
            Threshold::Fixed(v) => write!(f, "{v}"),
        }
    }
}

/// Detection and fitting parameters of a [`FiducialCloud`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiducialCloudConfig {
    /// Lateral voxel size
    pub dx: f64,
    /// Axial voxel size
    pub dz: f64,
    /// Lateral LoG sigma in pixels
    pub xysig: f64,
    /// Axial LoG sigma in pixels
    pub zsig: f64,
    pub threshold: Threshold,
    /// Smallest component count considered a plausible bead count
    pub mincount: Option<usize>,
    /// Number of levels scanned by the auto threshold
    pub threshold_steps: usize,
    /// Voxels added around each component before fitting
    pub roi_padding: usize,
    /// Initial lateral bead width in physical units
    pub wx: f64,
    /// Initial axial bead width in physical units
    pub wz: f64,
    pub noise: CameraNoiseModel,
    pub lm: LmConfig,
}

impl Default for FiducialCloudConfig {
    fn default() -> Self {
        let fit = GaussFitConfig::default();
        Self {
            dx: fit.dx,
            dz: fit.dz,
            xysig: 1.0,
            zsig: 2.5,
            threshold: Threshold::Auto,
            mincount: None,
            threshold_steps: 100,
            roi_padding: 2,
            wx: fit.wx,
            wz: fit.wz,
            noise: fit.noise,
            lm: fit.lm,
        }
    }
}

impl FiducialCloudConfig {
    pub fn fit_config(&self) -> GaussFitConfig {
        GaussFitConfig {
            dx: self.dx,
            dz: self.dz,
            wx: self.wx,
            wz: self.wz,
            noise: self.noise,
            lm: self.lm,
        }
    }

    fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(RegistrationError::ArgumentError(format!(
                    "{name} must be positive, got {v}"
                )))
            }
        };
        positive("dx", self.dx)?;
        positive("dz", self.dz)?;
        if self.xysig < 0.0 || self.zsig < 0.0 {
            return Err(RegistrationError::ArgumentError(format!(
                "filter sigmas must not be negative, got xy {} z {}",
                self.xysig, self.zsig
            )));
        }
        Ok(())
    }
}

/// Bead centres detected in one 3D volume
///
/// The volume is `(z, y, x)`. Coordinates are a `3×N` matrix with rows
/// `x, y, z` in 0-based pixel units.
#[derive(Debug)]
pub struct FiducialCloud {
    data: Option<Array3<f64>>,
    config: FiducialCloudConfig,
    imref: ImRef3d,
    filtered: OnceLock<Array3<f64>>,
    coords: DMatrix<f64>,
    beads: Vec<GaussFitResult>,
    threshold_used: Option<f64>,
}

impl FiducialCloud {
    /// Detects beads in `data` right away.
    pub fn new(data: Array3<f64>, config: FiducialCloudConfig) -> Result<Self> {
        config.validate()?;
        if data.is_empty() {
            return Err(RegistrationError::InvalidVolume(format!(
                "volume of shape {:?} has no voxels",
                data.shape()
            )));
        }
        let imref = ImRef3d::with_pixel_extents(data.dim(), config.dx, config.dx, config.dz)?;
        let mut cloud = Self {
            data: Some(data),
            config,
            imref,
            filtered: OnceLock::new(),
            coords: DMatrix::zeros(3, 0),
            beads: Vec::new(),
            threshold_used: None,
        };
        cloud.update_coords()?;
        Ok(cloud)
    }

    /// Cloud with known coordinates and no image data.
    pub fn from_coords(
        coords: DMatrix<f64>,
        imref: ImRef3d,
        config: FiducialCloudConfig,
    ) -> Result<Self> {
        config.validate()?;
        if coords.nrows() != 3 {
            return Err(RegistrationError::ArgumentError(format!(
                "coordinates must have 3 rows, got {}",
                coords.nrows()
            )));
        }
        Ok(Self {
            data: None,
            config,
            imref,
            filtered: OnceLock::new(),
            coords,
            beads: Vec::new(),
            threshold_used: None,
        })
    }

    /// Loads a multi-page TIFF stack and detects beads in it.
    pub fn from_tiff<P: AsRef<Path>>(path: P, config: FiducialCloudConfig) -> Result<Self> {
        let data = read_tiff_stack(path.as_ref())?;
        info!(
            "loaded {} with shape {:?}",
            path.as_ref().display(),
            data.shape()
        );
        Self::new(data, config)
    }

    pub fn count(&self) -> usize {
        self.coords.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Bead centres as a `3×N` matrix of pixel coordinates.
    pub fn coords(&self) -> &DMatrix<f64> {
        &self.coords
    }

    /// Bead centres in physical units, `worldStart + (c - 0.5)·delta` per axis.
    pub fn coords_in_world(&self) -> DMatrix<f64> {
        let mut world = DMatrix::zeros(3, self.count());
        for (column, mut out) in self.coords.column_iter().zip(world.column_iter_mut()) {
            let (x, y, z) = self.imref.intrinsic_to_world(column[0], column[1], column[2]);
            out[0] = x;
            out[1] = y;
            out[2] = z;
        }
        world
    }

    /// Per-bead fit details, empty for clouds built from coordinates.
    pub fn beads(&self) -> &[GaussFitResult] {
        &self.beads
    }

    pub fn config(&self) -> &FiducialCloudConfig {
        &self.config
    }

    pub fn imref(&self) -> &ImRef3d {
        &self.imref
    }

    pub fn data(&self) -> Option<ArrayView3<'_, f64>> {
        self.data.as_ref().map(|d| d.view())
    }

    pub fn threshold(&self) -> Threshold {
        self.config.threshold
    }

    /// Threshold applied by the last detection run.
    pub fn threshold_used(&self) -> Option<f64> {
        self.threshold_used
    }

    pub fn mincount(&self) -> Option<usize> {
        self.config.mincount
    }

    /// Axial to lateral voxel size ratio.
    pub fn dzdx(&self) -> f64 {
        self.config.dz / self.config.dx
    }

    /// Negated, clipped LoG response of the volume, computed once.
    pub fn filtered(&self) -> Result<&Array3<f64>> {
        let data = self.data.as_ref().ok_or(RegistrationError::NoImageData)?;
        Ok(self.filtered.get_or_init(|| {
            debug!(
                "LoG filtering volume {:?} (xysig {}, zsig {})",
                data.shape(),
                self.config.xysig,
                self.config.zsig
            );
            log_filter(data.view(), self.config.xysig, self.config.zsig)
        }))
    }

    /// Drops the cached filtered volume.
    pub fn invalidate_filtered(&mut self) {
        self.filtered = OnceLock::new();
    }

    /// `(threshold, bead count)` from the component-count plateau.
    pub fn autothresh(&self) -> Result<(f64, usize)> {
        let filtered = self.filtered()?;
        Ok(get_thresh(
            filtered.view(),
            self.config.mincount,
            self.config.threshold_steps,
        ))
    }

    pub fn set_threshold(&mut self, threshold: Threshold) -> Result<()> {
        self.config.threshold = threshold;
        self.recompute_if_possible()
    }

    /// Changes the minimum bead count and re-detects the beads.
    pub fn set_mincount(&mut self, mincount: Option<usize>) -> Result<()> {
        self.config.mincount = mincount;
        self.recompute_if_possible()
    }

    fn recompute_if_possible(&mut self) -> Result<()> {
        if self.data.is_some() {
            self.update_coords()
        } else {
            Ok(())
        }
    }

    /// Segments the filtered volume and fits every component.
    ///
    /// Beads whose fit fails are dropped; zero beads is not an error.
    pub fn update_coords(&mut self) -> Result<()> {
        let (threshold, beads) = {
            let data = self.data.as_ref().ok_or(RegistrationError::NoImageData)?;
            let filtered = self.filtered()?;
            let threshold = match self.config.threshold {
                Threshold::Auto => {
                    get_thresh(
                        filtered.view(),
                        self.config.mincount,
                        self.config.threshold_steps,
                    )
                    .0
                }
                Threshold::Fixed(value) => value,
            };

            let mask = filtered.mapv(|v| v > threshold);
            let (labels, count) = label_components(mask.view());
            let rois: Vec<Roi3> = find_objects(labels.view(), count)
                .into_iter()
                .map(|roi| roi.padded(self.config.roi_padding, data.dim()))
                .collect();

            let fitter = GaussFitter3D::new(data.view(), self.config.fit_config());
            let beads: Vec<GaussFitResult> = rois
                .par_iter()
                .filter_map(|roi| match fitter.fit(roi) {
                    Ok(bead) => Some(bead),
                    Err(e) => {
                        debug!("rejected candidate {:?}..{:?}: {}", roi.min, roi.max, e);
                        None
                    }
                })
                .collect();
            debug!(
                "threshold {:.4}: {} candidates, {} fitted",
                threshold,
                rois.len(),
                beads.len()
            );
            (threshold, beads)
        };

        self.coords = DMatrix::from_fn(3, beads.len(), |r, c| beads[c].center[r]);
        self.beads = beads;
        self.threshold_used = Some(threshold);

        if self.beads.is_empty() {
            warn!("no beads detected (threshold {:.4})", threshold);
        } else {
            info!("detected {} beads", self.beads.len());
        }
        Ok(())
    }

    pub fn to_record(&self) -> FiducialCloudRecord {
        FiducialCloudRecord {
            dx: self.config.dx,
            dz: self.config.dz,
            xysig: self.config.xysig,
            zsig: self.config.zsig,
            threshold: self.config.threshold,
            mincount: self.config.mincount,
            imref: self.imref,
            coords: self
                .coords
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
        }
    }

    /// Restores a cloud without image data.
    pub fn from_record(record: &FiducialCloudRecord) -> Result<Self> {
        let config = FiducialCloudConfig {
            dx: record.dx,
            dz: record.dz,
            xysig: record.xysig,
            zsig: record.zsig,
            threshold: record.threshold,
            mincount: record.mincount,
            ..Default::default()
        };
        Self::from_coords(record.coords_matrix()?, record.imref, config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let record: FiducialCloudRecord = serde_json::from_str(json)?;
        Self::from_record(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_threshold_serde() {
        assert_eq!(serde_json::to_string(&Threshold::Auto).unwrap(), "\"auto\"");
        assert_eq!(serde_json::to_string(&Threshold::Fixed(2.5)).unwrap(), "2.5");
        assert_eq!(
            serde_json::from_str::<Threshold>("\"auto\"").unwrap(),
            Threshold::Auto
        );
        assert_eq!(
            serde_json::from_str::<Threshold>("12").unwrap(),
            Threshold::Fixed(12.0)
        );
        assert!(serde_json::from_str::<Threshold>("\"manual\"").is_err());
    }

    #[test]
    fn test_blank_volume_gives_empty_cloud() {
        let cloud = FiducialCloud::new(
            Array3::zeros((8, 16, 16)),
            FiducialCloudConfig::default(),
        )
        .unwrap();
        assert_eq!(cloud.count(), 0);
        assert_eq!(cloud.coords().shape(), (3, 0));
        assert!(cloud.coords_in_world().is_empty());
    }

    #[test]
    fn test_empty_volume_rejected() {
        let result = FiducialCloud::new(Array3::zeros((0, 4, 4)), FiducialCloudConfig::default());
        assert!(matches!(result, Err(RegistrationError::InvalidVolume(_))));
    }

    #[test]
    fn test_invalid_voxel_size() {
        let config = FiducialCloudConfig {
            dx: 0.0,
            ..Default::default()
        };
        let result = FiducialCloud::new(Array3::zeros((4, 4, 4)), config);
        assert!(matches!(result, Err(RegistrationError::ArgumentError(_))));
    }

    #[test]
    fn test_world_coordinates() {
        let config = FiducialCloudConfig {
            dx: 0.1,
            dz: 0.3,
            ..Default::default()
        };
        let imref = ImRef3d::with_pixel_extents((10, 20, 20), 0.1, 0.1, 0.3).unwrap();
        let coords = DMatrix::from_column_slice(3, 2, &[0.0, 0.0, 0.0, 4.0, 2.0, 1.0]);
        let cloud = FiducialCloud::from_coords(coords, imref, config).unwrap();

        let world = cloud.coords_in_world();
        // the world start sits half a voxel past coordinate 0
        assert_relative_eq!(world[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(world[(2, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(world[(0, 1)], 0.4, epsilon = 1e-12);
        assert_relative_eq!(world[(1, 1)], 0.2, epsilon = 1e-12);
        assert_relative_eq!(world[(2, 1)], 0.3, epsilon = 1e-12);
        assert_relative_eq!(cloud.dzdx(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coords_cloud_has_no_filtered_volume() {
        let imref = ImRef3d::new((4, 4, 4)).unwrap();
        let mut cloud =
            FiducialCloud::from_coords(DMatrix::zeros(3, 0), imref, Default::default()).unwrap();
        assert!(matches!(cloud.filtered(), Err(RegistrationError::NoImageData)));
        assert!(matches!(cloud.update_coords(), Err(RegistrationError::NoImageData)));
        // without data the count is kept as is
        cloud.set_mincount(Some(3)).unwrap();
        assert_eq!(cloud.mincount(), Some(3));
    }

    #[test]
    fn test_bad_coordinate_rows() {
        let imref = ImRef3d::new((4, 4, 4)).unwrap();
        let result = FiducialCloud::from_coords(DMatrix::zeros(2, 5), imref, Default::default());
        assert!(matches!(result, Err(RegistrationError::ArgumentError(_))));
    }
}
