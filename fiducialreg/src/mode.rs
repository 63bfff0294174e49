//! Transform modes understood by [`crate::CloudSet::tform`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

/// How the transform between two channels is estimated
///
/// The closed-form modes work on matched bead pairs; the `Cpd*` modes register
/// the raw clouds with Coherent Point Drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformMode {
    #[serde(rename = "translation")]
    Translation,
    #[serde(rename = "rigid")]
    Rigid,
    #[serde(rename = "similarity")]
    Similarity,
    #[serde(rename = "affine")]
    Affine,
    /// Affine in XY followed by a similarity fit for Z
    #[serde(rename = "2step")]
    TwoStep,
    #[serde(rename = "cpd_rigid")]
    CpdRigid,
    #[serde(rename = "cpd_similarity")]
    CpdSimilarity,
    #[serde(rename = "cpd_affine")]
    CpdAffine,
    #[serde(rename = "cpd_2step")]
    CpdTwoStep,
}

impl TransformMode {
    pub const ALL: [TransformMode; 9] = [
        TransformMode::Translation,
        TransformMode::Rigid,
        TransformMode::Similarity,
        TransformMode::Affine,
        TransformMode::TwoStep,
        TransformMode::CpdRigid,
        TransformMode::CpdSimilarity,
        TransformMode::CpdAffine,
        TransformMode::CpdTwoStep,
    ];

    pub const NAMES: [&'static str; 9] = [
        "translation",
        "rigid",
        "similarity",
        "affine",
        "2step",
        "cpd_rigid",
        "cpd_similarity",
        "cpd_affine",
        "cpd_2step",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TransformMode::Translation => "translation",
            TransformMode::Rigid => "rigid",
            TransformMode::Similarity => "similarity",
            TransformMode::Affine => "affine",
            TransformMode::TwoStep => "2step",
            TransformMode::CpdRigid => "cpd_rigid",
            TransformMode::CpdSimilarity => "cpd_similarity",
            TransformMode::CpdAffine => "cpd_affine",
            TransformMode::CpdTwoStep => "cpd_2step",
        }
    }

    /// Whether the mode registers raw clouds instead of matched pairs.
    pub fn is_cpd(&self) -> bool {
        matches!(
            self,
            TransformMode::CpdRigid
                | TransformMode::CpdSimilarity
                | TransformMode::CpdAffine
                | TransformMode::CpdTwoStep
        )
    }
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransformMode {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransformMode::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| RegistrationError::UnknownMode(s.to_string()))
    }
}
