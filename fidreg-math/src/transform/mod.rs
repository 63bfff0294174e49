//! Homogeneous transformation matrices and closed-form point-set registration.
//!
//! A transform for `D`-dimensional data is a `(D+1)×(D+1)` matrix whose top-left
//! `D×D` block holds rotation/scale/shear, whose last column holds translation and
//! whose last row is `[0, ..., 0, 1]`. Point sets are `D×N` matrices with one point
//! per column.

mod infer;

pub use infer::{infer_2step, infer_affine, infer_rigid, infer_similarity, infer_translation};

use nalgebra::{DMatrix, DVector, Rotation3, Unit, Vector3};
use thiserror::Error;

/// Errors raised while estimating or applying a transform
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error("need at least {needed} points for this fit, got {got}")]
    InsufficientPoints { needed: usize, got: usize },

    #[error("point sets differ in shape: {left:?} vs {right:?}")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("expected a {expected}x{expected} homogeneous matrix, got {rows}x{cols}")]
    MatrixSize {
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[error("points are degenerate: rank {rank} is below the {needed} required")]
    Degenerate { rank: usize, needed: usize },

    #[error("SVD decomposition failed to produce U or V^T matrices")]
    SvdFailed,

    #[error("transformation matrix is singular")]
    Singular,
}

/// Spatial dimension of a square homogeneous matrix.
pub fn dimension_of(matrix: &DMatrix<f64>) -> Result<usize, TransformError> {
    let (rows, cols) = matrix.shape();
    if rows != cols || rows < 2 {
        return Err(TransformError::MatrixSize {
            expected: rows.max(2),
            rows,
            cols,
        });
    }
    Ok(rows - 1)
}

/// Checks that `matrix` is `(dim+1)×(dim+1)`.
pub fn expect_dimension(matrix: &DMatrix<f64>, dim: usize) -> Result<(), TransformError> {
    let (rows, cols) = matrix.shape();
    if rows != dim + 1 || cols != dim + 1 {
        return Err(TransformError::MatrixSize {
            expected: dim + 1,
            rows,
            cols,
        });
    }
    Ok(())
}

/// Builds a homogeneous matrix from a linear block and a translation vector.
pub fn embed(linear: &DMatrix<f64>, translation: &DVector<f64>) -> DMatrix<f64> {
    let d = linear.nrows();
    let mut m = DMatrix::identity(d + 1, d + 1);
    m.view_mut((0, 0), (d, d)).copy_from(linear);
    m.view_mut((0, d), (d, 1)).copy_from(translation);
    m
}

/// Linear `D×D` block of a homogeneous matrix.
pub fn linear_part(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    let d = matrix.nrows() - 1;
    matrix.view((0, 0), (d, d)).into_owned()
}

/// Translation column of a homogeneous matrix.
pub fn translation_part(matrix: &DMatrix<f64>) -> DVector<f64> {
    let d = matrix.nrows() - 1;
    matrix.view((0, d), (d, 1)).column(0).into_owned()
}

/// Inverts a homogeneous matrix.
///
/// # Errors
/// * `TransformError::MatrixSize` - if the matrix is not square
/// * `TransformError::Singular` - if the matrix has no inverse
pub fn invert_homogeneous(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, TransformError> {
    dimension_of(matrix)?;
    matrix
        .clone()
        .try_inverse()
        .ok_or(TransformError::Singular)
}

/// Applies a homogeneous transform to a `D×N` point matrix.
///
/// With `inverse` set the inverse of `matrix` is applied instead.
pub fn affine_xf(
    points: &DMatrix<f64>,
    matrix: &DMatrix<f64>,
    inverse: bool,
) -> Result<DMatrix<f64>, TransformError> {
    let d = points.nrows();
    expect_dimension(matrix, d)?;

    let m = if inverse {
        invert_homogeneous(matrix)?
    } else {
        matrix.clone()
    };

    let translation = translation_part(&m);
    let mut out = m.view((0, 0), (d, d)) * points;
    for mut column in out.column_iter_mut() {
        column += &translation;
    }
    Ok(out)
}

/// Embeds a 2D homogeneous (3×3) matrix into a 3D (4×4) one that leaves Z untouched.
pub fn mat2to3(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, TransformError> {
    expect_dimension(matrix, 2)?;

    let mut m = DMatrix::identity(4, 4);
    m.view_mut((0, 0), (2, 2))
        .copy_from(&matrix.view((0, 0), (2, 2)));
    m[(0, 3)] = matrix[(0, 2)];
    m[(1, 3)] = matrix[(1, 2)];
    Ok(m)
}

/// Pure translation matrix with dimension `shift.len()`.
pub fn translation_matrix(shift: &[f64]) -> DMatrix<f64> {
    let d = shift.len();
    embed(&DMatrix::identity(d, d), &DVector::from_column_slice(shift))
}

/// Axis-aligned scaling matrix with dimension `scales.len()`.
pub fn scale_matrix(scales: &[f64]) -> DMatrix<f64> {
    let d = scales.len();
    embed(
        &DMatrix::from_diagonal(&DVector::from_column_slice(scales)),
        &DVector::zeros(d),
    )
}

/// 4×4 rotation of `angle` radians about `axis` (right-handed).
pub fn rotation_matrix_3d(axis: &Vector3<f64>, angle: f64) -> DMatrix<f64> {
    let rotation = Rotation3::from_axis_angle(&Unit::new_normalize(*axis), angle);
    let linear = DMatrix::from_iterator(3, 3, rotation.matrix().iter().copied());
    embed(&linear, &DVector::zeros(3))
}

#[cfg(test)]
mod tests;
