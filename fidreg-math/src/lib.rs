//! Point-set registration math for fiducial bead clouds.
//!
//! This crate holds the parts of the bead registration pipeline that know nothing
//! about images or bead detection:
//!
//! - [`transform`]: homogeneous matrices and closed-form inference
//!   (translation, rigid, similarity, affine and the XY/Z two-step fit)
//! - [`cpd`]: Coherent Point Drift, an EM registration for point sets without
//!   known correspondence
//! - [`imref`]: intrinsic/world coordinate referencing of 2D and 3D grids
//! - [`imwarp`]: reverse-mapped resampling of volumes and point arrays
//!
//! Closed-form solvers take `D×N` point matrices (one column per point). CPD takes
//! `N×D` matrices (one row per point). Every solver returns a `(D+1)×(D+1)`
//! homogeneous matrix that maps the moving set onto the fixed set.

pub mod cpd;
pub mod imref;
pub mod imwarp;
pub mod transform;

pub use cpd::{
    cpd_2step, CpdAffine, CpdConfig, CpdError, CpdRegistration, CpdResult, CpdRigid,
    CpdSimilarity, CpdState, TwoStepResult,
};
pub use imref::{DimensionManager, ImRef2d, ImRef3d, ImRefError};
pub use imwarp::{
    affine_xf_volume, imwarp, imwarp_2d, transform_points, TransformedPoints, WarpError,
};
pub use transform::{
    affine_xf, infer_2step, infer_affine, infer_rigid, infer_similarity, infer_translation,
    TransformError,
};
