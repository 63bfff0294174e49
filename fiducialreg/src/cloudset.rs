//! Bead clouds of several channels and the transforms between them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use fidreg_math::transform::invert_homogeneous;
use fidreg_math::{
    affine_xf, cpd_2step, infer_2step, infer_affine, infer_rigid, infer_similarity,
    infer_translation, CpdConfig, CpdRegistration,
};
use log::info;
use nalgebra::DMatrix;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::cloud::{FiducialCloud, FiducialCloudConfig};
use crate::error::{RegistrationError, Result};
use crate::matching::{match_clouds, MatchingConfig};
use crate::mode::TransformMode;
use crate::persist::{matrix_to_rows, CloudSetRecord, RegistrationFile};

/// Name of a channel: an emission wavelength or free text
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelLabel {
    Wavelength(i64),
    Name(String),
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelLabel::Wavelength(nm) => write!(f, "{nm}"),
            ChannelLabel::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for ChannelLabel {
    fn from(value: i64) -> Self {
        ChannelLabel::Wavelength(value)
    }
}

impl From<&str> for ChannelLabel {
    fn from(value: &str) -> Self {
        ChannelLabel::Name(value.to_string())
    }
}

impl From<String> for ChannelLabel {
    fn from(value: String) -> Self {
        ChannelLabel::Name(value)
    }
}

/// Summary of one channel-to-channel registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationReport {
    pub moving: ChannelLabel,
    pub fixed: ChannelLabel,
    pub mode: TransformMode,
    pub bead_counts: Vec<(ChannelLabel, usize)>,
    /// Beads matched across all channels, 0 when matching failed
    pub matched: usize,
    /// RMS distance between transformed moving and fixed matched beads
    pub rms_residual: Option<f64>,
    pub matrix: Vec<Vec<f64>>,
}

/// Point clouds of two or more channels of the same bead sample
///
/// Matched beads are cached until the clouds or the matching configuration
/// change. Transforms are expressed in pixel units, or in world units when
/// [`MatchingConfig::in_world`] is set.
#[derive(Debug)]
pub struct CloudSet {
    clouds: Vec<FiducialCloud>,
    labels: Vec<ChannelLabel>,
    matching_config: MatchingConfig,
    cpd_config: CpdConfig,
    matching: OnceLock<Vec<DMatrix<f64>>>,
}

impl CloudSet {
    /// Groups `clouds` under `labels`, which default to the indices `0..N`.
    pub fn new(clouds: Vec<FiducialCloud>, labels: Option<Vec<ChannelLabel>>) -> Result<Self> {
        if clouds.len() < 2 {
            return Err(RegistrationError::ArgumentError(format!(
                "a cloud set needs at least 2 clouds, got {}",
                clouds.len()
            )));
        }
        let labels = labels.unwrap_or_else(|| {
            (0..clouds.len())
                .map(|i| ChannelLabel::Wavelength(i as i64))
                .collect()
        });
        if labels.len() != clouds.len() {
            return Err(RegistrationError::LabelCountMismatch {
                clouds: clouds.len(),
                labels: labels.len(),
            });
        }
        let mut seen = HashSet::new();
        for label in &labels {
            if !seen.insert(label) {
                return Err(RegistrationError::DuplicateLabel(label.to_string()));
            }
        }

        Ok(Self {
            clouds,
            labels,
            matching_config: MatchingConfig::default(),
            cpd_config: CpdConfig::default(),
            matching: OnceLock::new(),
        })
    }

    /// Detects beads in every volume with a shared configuration.
    pub fn from_volumes(
        volumes: Vec<Array3<f64>>,
        labels: Option<Vec<ChannelLabel>>,
        config: FiducialCloudConfig,
    ) -> Result<Self> {
        let clouds = volumes
            .into_iter()
            .map(|volume| FiducialCloud::new(volume, config))
            .collect::<Result<Vec<_>>>()?;
        Self::new(clouds, labels)
    }

    pub fn with_matching_config(mut self, config: MatchingConfig) -> Self {
        self.matching_config = config;
        self.invalidate_matching();
        self
    }

    pub fn with_cpd_config(mut self, config: CpdConfig) -> Self {
        self.cpd_config = config;
        self
    }

    pub fn matching_config(&self) -> &MatchingConfig {
        &self.matching_config
    }

    pub fn len(&self) -> usize {
        self.clouds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }

    pub fn labels(&self) -> &[ChannelLabel] {
        &self.labels
    }

    pub fn has_label(&self, label: &ChannelLabel) -> bool {
        self.labels.contains(label)
    }

    fn index_of(&self, label: &ChannelLabel) -> Result<usize> {
        self.labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| RegistrationError::UnknownLabel {
                label: label.to_string(),
                known: self.label_names(),
            })
    }

    fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(ToString::to_string).collect()
    }

    pub fn cloud(&self, label: &ChannelLabel) -> Result<&FiducialCloud> {
        Ok(&self.clouds[self.index_of(label)?])
    }

    pub fn clouds(&self) -> &[FiducialCloud] {
        &self.clouds
    }

    /// Bead count of every cloud, in label order.
    pub fn count(&self) -> Vec<usize> {
        self.clouds.iter().map(FiducialCloud::count).collect()
    }

    fn working_coords(&self, index: usize) -> DMatrix<f64> {
        let cloud = &self.clouds[index];
        if self.matching_config.in_world {
            cloud.coords_in_world()
        } else {
            cloud.coords().clone()
        }
    }

    /// Matched beads of every cloud as `3×K` matrices with aligned columns.
    pub fn matching(&self) -> Result<&[DMatrix<f64>]> {
        if let Some(matched) = self.matching.get() {
            return Ok(matched);
        }

        let coords: Vec<DMatrix<f64>> = (0..self.len()).map(|i| self.working_coords(i)).collect();
        let refs: Vec<&DMatrix<f64>> = coords.iter().collect();
        let indices = match_clouds(&refs, &self.matching_config);
        let matched_count = indices.first().map_or(0, Vec::len);
        if matched_count == 0 {
            return Err(RegistrationError::NoMatchingPoints {
                labels: self.label_names(),
            });
        }
        info!(
            "matched {} beads across {} channels (counts {:?})",
            matched_count,
            self.len(),
            self.count()
        );

        let matched = coords
            .iter()
            .zip(indices.iter())
            .map(|(cloud, idx)| cloud.select_columns(idx.iter()))
            .collect();
        let _ = self.matching.set(matched);
        self.matching
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| RegistrationError::NoMatchingPoints {
                labels: self.label_names(),
            })
    }

    pub fn count_matching(&self) -> Result<usize> {
        Ok(self.matching()?.first().map_or(0, DMatrix::ncols))
    }

    pub fn invalidate_matching(&mut self) {
        self.matching = OnceLock::new();
    }

    /// Sets the minimum bead count of every cloud and re-detects their beads.
    pub fn set_mincount(&mut self, mincount: Option<usize>) -> Result<()> {
        for cloud in &mut self.clouds {
            cloud.set_mincount(mincount)?;
        }
        self.invalidate_matching();
        Ok(())
    }

    fn resolve(
        &self,
        moving: Option<&ChannelLabel>,
        fixed: Option<&ChannelLabel>,
    ) -> Result<(usize, usize)> {
        let moving = moving.map_or(Ok(1), |label| self.index_of(label))?;
        let fixed = fixed.map_or(Ok(0), |label| self.index_of(label))?;
        Ok((moving, fixed))
    }

    /// Matched `(moving, fixed)` beads as `3×K` matrices.
    fn matched_pair(&self, mi: usize, fi: usize) -> Result<(&DMatrix<f64>, &DMatrix<f64>)> {
        let matched = self.matching()?;
        Ok((&matched[mi], &matched[fi]))
    }

    /// Unmatched `(fixed, moving)` clouds with one point per row, as CPD expects.
    fn raw_pair(&self, mi: usize, fi: usize) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        let x = self.working_coords(fi).transpose();
        let y = self.working_coords(mi).transpose();
        if x.nrows() == 0 || y.nrows() == 0 {
            return Err(RegistrationError::NoMatchingPoints {
                labels: vec![self.labels[mi].to_string(), self.labels[fi].to_string()],
            });
        }
        Ok((x, y))
    }

    /// Homogeneous 4×4 matrix mapping the `moving` channel onto `fixed`.
    ///
    /// Labels default to the second (moving) and first (fixed) channel.
    pub fn tform(
        &self,
        moving: Option<&ChannelLabel>,
        fixed: Option<&ChannelLabel>,
        mode: TransformMode,
    ) -> Result<DMatrix<f64>> {
        let (mi, fi) = self.resolve(moving, fixed)?;
        if mi == fi {
            return Ok(DMatrix::identity(4, 4));
        }

        let matrix = match mode {
            TransformMode::Translation => {
                let (x, y) = self.matched_pair(mi, fi)?;
                infer_translation(x, y)?
            }
            TransformMode::Rigid => {
                let (x, y) = self.matched_pair(mi, fi)?;
                infer_rigid(x, y, false)?
            }
            TransformMode::Similarity => {
                let (x, y) = self.matched_pair(mi, fi)?;
                infer_similarity(x, y)?
            }
            TransformMode::Affine => {
                let (x, y) = self.matched_pair(mi, fi)?;
                infer_affine(x, y)?
            }
            TransformMode::TwoStep => {
                let (x, y) = self.matched_pair(mi, fi)?;
                infer_2step(x, y)?
            }
            TransformMode::CpdRigid => {
                let (x, y) = self.raw_pair(mi, fi)?;
                CpdRegistration::rigid(&x, &y, self.cpd_config)?.register()?.matrix
            }
            TransformMode::CpdSimilarity => {
                let (x, y) = self.raw_pair(mi, fi)?;
                CpdRegistration::similarity(&x, &y, self.cpd_config)?.register()?.matrix
            }
            TransformMode::CpdAffine => {
                let (x, y) = self.raw_pair(mi, fi)?;
                CpdRegistration::affine(&x, &y, self.cpd_config)?.register()?.matrix
            }
            TransformMode::CpdTwoStep => {
                let (x, y) = self.raw_pair(mi, fi)?;
                cpd_2step(&x, &y, self.cpd_config)?.matrix
            }
        };

        info!(
            "{} transform {} -> {}",
            mode, self.labels[mi], self.labels[fi]
        );
        Ok(matrix)
    }

    /// [`Self::tform`] with the mode given by name.
    pub fn tform_named(
        &self,
        moving: Option<&ChannelLabel>,
        fixed: Option<&ChannelLabel>,
        mode: &str,
    ) -> Result<DMatrix<f64>> {
        self.tform(moving, fixed, mode.parse()?)
    }

    /// Matrix mapping `fixed` back onto `moving`.
    pub fn tform_inverse(
        &self,
        moving: Option<&ChannelLabel>,
        fixed: Option<&ChannelLabel>,
        mode: TransformMode,
    ) -> Result<DMatrix<f64>> {
        Ok(invert_homogeneous(&self.tform(moving, fixed, mode)?)?)
    }

    /// Computes a transform and measures it on the matched beads.
    pub fn registration_report(
        &self,
        moving: Option<&ChannelLabel>,
        fixed: Option<&ChannelLabel>,
        mode: TransformMode,
    ) -> Result<RegistrationReport> {
        let (mi, fi) = self.resolve(moving, fixed)?;
        let matrix = self.tform(Some(&self.labels[mi]), Some(&self.labels[fi]), mode)?;

        let (matched, rms_residual) = match self.matching() {
            Ok(points) => {
                let moved = affine_xf(&points[mi], &matrix, false)?;
                let residual = &moved - &points[fi];
                let n = residual.ncols() as f64;
                let rms = (residual.norm_squared() / n).sqrt();
                (points[mi].ncols(), Some(rms))
            }
            Err(_) => (0, None),
        };

        Ok(RegistrationReport {
            moving: self.labels[mi].clone(),
            fixed: self.labels[fi].clone(),
            mode,
            bead_counts: self.labels.iter().cloned().zip(self.count()).collect(),
            matched,
            rms_residual,
            matrix: matrix_to_rows(&matrix),
        })
    }

    /// Transforms of every channel onto `reference` (the first label by default).
    pub fn registration_file(
        &self,
        reference: Option<&ChannelLabel>,
        mode: TransformMode,
    ) -> Result<RegistrationFile> {
        let reference = reference.unwrap_or(&self.labels[0]);
        let fixed = self.index_of(reference)?;

        let mut tforms = BTreeMap::new();
        let mut bead_counts = BTreeMap::new();
        for (label, cloud) in self.labels.iter().zip(self.clouds.iter()) {
            let matrix = self.tform(Some(label), Some(&self.labels[fixed]), mode)?;
            tforms.insert(label.to_string(), matrix_to_rows(&matrix));
            bead_counts.insert(label.to_string(), cloud.count());
        }

        Ok(RegistrationFile {
            reference: reference.clone(),
            mode,
            tforms,
            bead_counts,
            matched: self.count_matching().unwrap_or(0),
        })
    }

    pub fn to_record(&self) -> CloudSetRecord {
        CloudSetRecord {
            n: self.len(),
            clouds: self.clouds.iter().map(FiducialCloud::to_record).collect(),
            labels: self.labels.clone(),
        }
    }

    pub fn from_record(record: &CloudSetRecord) -> Result<Self> {
        if record.n != record.clouds.len() {
            return Err(RegistrationError::ArgumentError(format!(
                "record lists N = {} but holds {} clouds",
                record.n,
                record.clouds.len()
            )));
        }
        let clouds = record
            .clouds
            .iter()
            .map(FiducialCloud::from_record)
            .collect::<Result<Vec<_>>>()?;
        Self::new(clouds, Some(record.labels.clone()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let record: CloudSetRecord = serde_json::from_str(json)?;
        Self::from_record(&record)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
