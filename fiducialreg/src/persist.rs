//! JSON records of clouds, cloud sets and computed registrations.
//!
//! Records carry configuration and derived coordinates only, never image data.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use fidreg_math::ImRef3d;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::cloud::Threshold;
use crate::cloudset::ChannelLabel;
use crate::error::{RegistrationError, Result};
use crate::mode::TransformMode;

/// Persisted form of a [`crate::FiducialCloud`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiducialCloudRecord {
    pub dx: f64,
    pub dz: f64,
    pub xysig: f64,
    pub zsig: f64,
    pub threshold: Threshold,
    pub mincount: Option<usize>,
    pub imref: ImRef3d,
    /// Rows `x`, `y`, `z` of the bead coordinates
    pub coords: Vec<Vec<f64>>,
}

impl FiducialCloudRecord {
    pub fn coords_matrix(&self) -> Result<DMatrix<f64>> {
        if self.coords.len() != 3 {
            return Err(RegistrationError::ArgumentError(format!(
                "cloud record needs 3 coordinate rows, got {}",
                self.coords.len()
            )));
        }
        rows_to_matrix(&self.coords)
    }
}

/// Persisted form of a [`crate::CloudSet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudSetRecord {
    #[serde(rename = "N")]
    pub n: usize,
    pub clouds: Vec<FiducialCloudRecord>,
    pub labels: Vec<ChannelLabel>,
}

/// Matrices registering every channel onto a reference channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationFile {
    pub reference: ChannelLabel,
    pub mode: TransformMode,
    /// Row-major homogeneous matrix per moving channel
    pub tforms: BTreeMap<String, Vec<Vec<f64>>>,
    pub bead_counts: BTreeMap<String, usize>,
    /// Beads matched across all channels
    pub matched: usize,
}

impl RegistrationFile {
    /// Matrix mapping channel `label` onto the reference.
    pub fn matrix(&self, label: &ChannelLabel) -> Result<DMatrix<f64>> {
        let key = label.to_string();
        let rows = self
            .tforms
            .get(&key)
            .ok_or_else(|| RegistrationError::UnknownLabel {
                label: key,
                known: self.tforms.keys().cloned().collect(),
            })?;
        rows_to_matrix(rows)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

pub fn matrix_to_rows(matrix: &DMatrix<f64>) -> Vec<Vec<f64>> {
    matrix
        .row_iter()
        .map(|row| row.iter().copied().collect())
        .collect()
}

/// Builds a matrix from equally long rows.
pub fn rows_to_matrix(rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    let ncols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|row| row.len() != ncols) {
        return Err(RegistrationError::ArgumentError(
            "matrix rows differ in length".to_string(),
        ));
    }
    Ok(DMatrix::from_fn(rows.len(), ncols, |r, c| rows[r][c]))
}
