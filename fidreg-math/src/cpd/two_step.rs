use log::debug;
use nalgebra::DMatrix;

use super::{CpdConfig, CpdError, CpdRegistration, CpdResult};
use crate::transform::mat2to3;

/// Result of [`cpd_2step`]
#[derive(Debug, Clone)]
pub struct TwoStepResult {
    /// 4×4 matrix mapping moving points onto fixed points
    pub matrix: DMatrix<f64>,
    /// Moving points after `matrix` (`M×3`)
    pub transformed: DMatrix<f64>,
    /// Affine registration of the XY projections
    pub xy: CpdResult,
    /// Rigid registration of the XY-corrected points in 3D
    pub z: CpdResult,
}

/// Two-stage CPD for 3D point clouds.
///
/// An affine CPD registers the XY projections first. The moving points, with
/// their XY coordinates replaced by the registered ones, are then registered
/// rigidly in 3D. The returned matrix keeps the XY affine block and takes the Z
/// shift and Z scale from the second stage.
///
/// `x` is the fixed set (`N×3`) and `y` the moving set (`M×3`).
pub fn cpd_2step(
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
    config: CpdConfig,
) -> Result<TwoStepResult, CpdError> {
    if x.ncols() != 3 || y.ncols() != 3 {
        return Err(CpdError::ArgumentError(format!(
            "2step CPD needs 3D points, got {} and {} columns",
            x.ncols(),
            y.ncols()
        )));
    }

    let x_xy = x.columns(0, 2).into_owned();
    let y_xy = y.columns(0, 2).into_owned();
    let xy = CpdRegistration::affine(&x_xy, &y_xy, config)?.register()?;

    let mut y_corrected = y.clone();
    y_corrected.columns_mut(0, 2).copy_from(&xy.transformed);
    let z = CpdRegistration::rigid(x, &y_corrected, config)?.register()?;

    let mut matrix =
        mat2to3(&xy.matrix).map_err(|e| CpdError::ArgumentError(e.to_string()))?;
    matrix[(2, 3)] = z.matrix[(2, 3)];
    matrix[(2, 2)] *= z.matrix[(2, 2)];
    debug!(
        "2step CPD: xy {} iterations, z {} iterations, z shift {:.4}",
        xy.iterations, z.iterations, matrix[(2, 3)]
    );

    let mut transformed = y * matrix.view((0, 0), (3, 3)).transpose();
    let shift = matrix.view((0, 3), (3, 1)).transpose();
    for mut row in transformed.row_iter_mut() {
        row += &shift;
    }

    Ok(TwoStepResult {
        matrix,
        transformed,
        xy,
        z,
    })
}
