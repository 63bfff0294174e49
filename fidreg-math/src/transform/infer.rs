//! Closed-form transform estimation from corresponding point sets.
//!
//! Every function takes a moving set `x` and a fixed set `y`, both `D×N` with
//! column `i` of `x` corresponding to column `i` of `y`, and returns the
//! `(D+1)×(D+1)` matrix `M` minimising `||y - M·x||`.

use log::debug;
use nalgebra::{DMatrix, DVector};

use super::{affine_xf, embed, mat2to3, TransformError};

/// Relative singular value cutoff below which a design matrix is rank deficient.
const RANK_EPSILON: f64 = 1e-10;

fn check_pair(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
    min_points: usize,
) -> Result<(), TransformError> {
    if x.shape() != y.shape() {
        return Err(TransformError::ShapeMismatch {
            left: x.shape(),
            right: y.shape(),
        });
    }
    if x.nrows() == 0 {
        return Err(TransformError::ArgumentError(
            "point sets must have at least one dimension".to_string(),
        ));
    }
    if x.ncols() < min_points {
        return Err(TransformError::InsufficientPoints {
            needed: min_points,
            got: x.ncols(),
        });
    }
    Ok(())
}

fn centered(points: &DMatrix<f64>, centroid: &DVector<f64>) -> DMatrix<f64> {
    let mut out = points.clone();
    for mut column in out.column_iter_mut() {
        column -= centroid;
    }
    out
}

/// Pure translation: the mean of `y - x` per axis.
pub fn infer_translation(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
) -> Result<DMatrix<f64>, TransformError> {
    check_pair(x, y, 1)?;
    let d = x.nrows();
    let shift = (y - x).column_mean();
    Ok(embed(&DMatrix::identity(d, d), &shift))
}

/// Rotation plus translation (and uniform scale when `scale` is set).
///
/// Kabsch/Umeyama alignment: both sets are centred, the cross-covariance
/// `C = Yc·Xcᵀ/n` is decomposed as `U·Σ·Vᵀ`, and the rotation is
/// `U·diag(1, …, 1, det(U·Vᵀ))·Vᵀ`. The determinant term keeps the result a proper
/// rotation for coplanar or otherwise degenerate inputs.
///
/// # Errors
/// * `TransformError::InsufficientPoints` - fewer than `D` points
/// * `TransformError::ShapeMismatch` - `x` and `y` differ in shape
/// * `TransformError::SvdFailed` - the decomposition did not produce U or Vᵀ
pub fn infer_rigid(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
    scale: bool,
) -> Result<DMatrix<f64>, TransformError> {
    let d = x.nrows();
    check_pair(x, y, d.max(1))?;
    let n = x.ncols() as f64;

    let mu_x = x.column_mean();
    let mu_y = y.column_mean();
    let xc = centered(x, &mu_x);
    let yc = centered(y, &mu_y);

    let cov = &yc * xc.transpose() / n;
    let svd = cov.clone().svd(true, true);
    let u = svd.u.ok_or(TransformError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(TransformError::SvdFailed)?;

    let mut signs = DVector::from_element(d, 1.0);
    if (&u * &v_t).determinant() < 0.0 {
        signs[d - 1] = -1.0;
    }
    let rotation = &u * DMatrix::from_diagonal(&signs) * &v_t;

    let s = if scale {
        let var_x = xc.norm_squared() / n;
        if var_x <= f64::EPSILON {
            return Err(TransformError::Degenerate { rank: 0, needed: 1 });
        }
        (rotation.transpose() * &cov).trace() / var_x
    } else {
        1.0
    };

    let linear = rotation * s;
    let translation = &mu_y - &linear * &mu_x;
    Ok(embed(&linear, &translation))
}

/// Rotation, uniform scale and translation.
pub fn infer_similarity(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
) -> Result<DMatrix<f64>, TransformError> {
    infer_rigid(x, y, true)
}

/// General affine transform by linear least squares.
///
/// Solves `y = M·[x; 1]` for the `D×(D+1)` block of `M`. Needs at least `D+1`
/// points that are not all coplanar (collinear in 2D).
pub fn infer_affine(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
) -> Result<DMatrix<f64>, TransformError> {
    let d = x.nrows();
    check_pair(x, y, d + 1)?;

    // Xhᵀ·Mᵀ = Yᵀ
    let design = x.clone().insert_row(d, 1.0).transpose();
    let svd = design.svd(true, true);

    let max_sv = svd.singular_values.max();
    let rank = svd.rank(max_sv * RANK_EPSILON);
    if rank < d + 1 {
        return Err(TransformError::Degenerate {
            rank,
            needed: d + 1,
        });
    }

    let m_t = svd
        .solve(&y.transpose(), max_sv * RANK_EPSILON)
        .map_err(|e| TransformError::ArgumentError(e.to_string()))?;

    let mut m = DMatrix::identity(d + 1, d + 1);
    m.view_mut((0, 0), (d, d + 1)).copy_from(&m_t.transpose());
    Ok(m)
}

/// Two-stage 3D fit: XY affine first, then a similarity fit for Z.
///
/// 1. A 2D affine transform is fitted between the XY projections and applied to
///    the XY coordinates of `x`.
/// 2. A 3D similarity transform is fitted between the XY-corrected points and `y`.
///
/// The result keeps the 2D affine block for X and Y and takes the Z translation
/// and Z scale from the second fit.
pub fn infer_2step(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
) -> Result<DMatrix<f64>, TransformError> {
    if x.nrows() != 3 {
        return Err(TransformError::ArgumentError(format!(
            "2step registration needs 3D points, got {}D",
            x.nrows()
        )));
    }
    check_pair(x, y, 3)?;

    let x_xy = x.rows(0, 2).into_owned();
    let y_xy = y.rows(0, 2).into_owned();
    let xy_affine = infer_affine(&x_xy, &y_xy)?;

    let mut x_reg = x.clone();
    x_reg
        .rows_mut(0, 2)
        .copy_from(&affine_xf(&x_xy, &xy_affine, false)?);

    let z_fit = infer_similarity(&x_reg, y)?;
    debug!(
        "2step z correction: scale {:.6}, shift {:.6}",
        z_fit[(2, 2)],
        z_fit[(2, 3)]
    );

    let mut m = mat2to3(&xy_affine)?;
    m[(2, 3)] = z_fit[(2, 3)];
    m[(2, 2)] *= z_fit[(2, 2)];
    Ok(m)
}
