//! Applying homogeneous transforms to volumes and coordinate arrays.
//!
//! Resampling is done by reverse mapping: every output voxel is mapped through
//! the inverse transform into the input grid and the input is sampled there
//! with linear interpolation. Output voxels that land outside the input take the
//! fill value.

use nalgebra::{DMatrix, Matrix3, Matrix4, Vector3, Vector4};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Zip};
use thiserror::Error;

use crate::imref::{ImRef2d, ImRef3d};
use crate::transform::{affine_xf, expect_dimension, invert_homogeneous, TransformError};

/// Errors raised while warping volumes or points
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WarpError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("array shape {array:?} does not match its spatial reference {reference:?}")]
    ReferenceMismatch {
        array: Vec<usize>,
        reference: Vec<usize>,
    },

    #[error("coordinate arrays differ in length: {0:?}")]
    LengthMismatch(Vec<usize>),
}

/// Resamples `input` onto `output_ref` through `tform`.
///
/// `tform` is a 4×4 matrix mapping input world coordinates `(x, y, z)` to output
/// world coordinates. `input` has shape `(nz, ny, nx)` matching `input_ref`.
///
/// # Errors
/// * `WarpError::ReferenceMismatch` - if `input` and `input_ref` disagree on shape
/// * `WarpError::Transform` - if `tform` is not 4×4 or cannot be inverted
pub fn imwarp(
    input: ArrayView3<f64>,
    tform: &DMatrix<f64>,
    input_ref: &ImRef3d,
    output_ref: &ImRef3d,
    fill_value: f64,
) -> Result<Array3<f64>, WarpError> {
    if input.dim() != input_ref.image_size() {
        let (nz, ny, nx) = input_ref.image_size();
        return Err(WarpError::ReferenceMismatch {
            array: input.shape().to_vec(),
            reference: vec![nz, ny, nx],
        });
    }
    let inverse = inverse_4x4(tform)?;

    Ok(resample_3d(
        &input,
        output_ref.image_size(),
        |x, y, z| {
            // 0-based output index -> 1-based intrinsic -> world
            let (xw, yw, zw) = output_ref.intrinsic_to_world(x + 1.0, y + 1.0, z + 1.0);
            let src = inverse * Vector4::new(xw, yw, zw, 1.0);
            let (xi, yi, zi) = input_ref.world_to_intrinsic(src.x, src.y, src.z);
            (xi - 1.0, yi - 1.0, zi - 1.0)
        },
        fill_value,
    ))
}

/// Resamples a volume through `tform` in array-index coordinates on its own grid.
///
/// The `(x, y, z)` coordinates seen by `tform` are 0-based `(col, row, plane)`
/// indices, the same units fitted bead positions are reported in.
pub fn affine_xf_volume(
    input: ArrayView3<f64>,
    tform: &DMatrix<f64>,
    fill_value: f64,
) -> Result<Array3<f64>, WarpError> {
    let inverse = inverse_4x4(tform)?;
    Ok(resample_3d(
        &input,
        input.dim(),
        |x, y, z| {
            let src = inverse * Vector4::new(x, y, z, 1.0);
            (src.x, src.y, src.z)
        },
        fill_value,
    ))
}

/// 2D counterpart of [`imwarp`] for images of shape `(ny, nx)` and 3×3 matrices.
pub fn imwarp_2d(
    input: ArrayView2<f64>,
    tform: &DMatrix<f64>,
    input_ref: &ImRef2d,
    output_ref: &ImRef2d,
    fill_value: f64,
) -> Result<Array2<f64>, WarpError> {
    if input.dim() != input_ref.image_size() {
        let (ny, nx) = input_ref.image_size();
        return Err(WarpError::ReferenceMismatch {
            array: input.shape().to_vec(),
            reference: vec![ny, nx],
        });
    }
    expect_dimension(tform, 2)?;
    let inverse = Matrix3::from_iterator(invert_homogeneous(tform)?.iter().copied());

    let mut output = Array2::from_elem(output_ref.image_size(), fill_value);
    Zip::indexed(&mut output).par_for_each(|(row, col), value| {
        let (xw, yw) = output_ref.intrinsic_to_world(col as f64 + 1.0, row as f64 + 1.0);
        let src = inverse * Vector3::new(xw, yw, 1.0);
        let (xi, yi) = input_ref.world_to_intrinsic(src.x, src.y);
        *value = bilinear(&input, xi - 1.0, yi - 1.0, fill_value);
    });
    Ok(output)
}

/// Coordinates produced by [`transform_points`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedPoints {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Option<Vec<f64>>,
}

/// Applies `m` (or its inverse) to parallel coordinate arrays.
///
/// Without `z` the points are 2D and `m` must be 3×3; with `z` they are 3D and
/// `m` must be 4×4.
pub fn transform_points(
    m: &DMatrix<f64>,
    x: &[f64],
    y: &[f64],
    z: Option<&[f64]>,
    inverse: bool,
) -> Result<TransformedPoints, WarpError> {
    let lengths_match = x.len() == y.len() && z.map_or(true, |z| z.len() == x.len());
    if !lengths_match {
        let mut lengths = vec![x.len(), y.len()];
        lengths.extend(z.map(<[f64]>::len));
        return Err(WarpError::LengthMismatch(lengths));
    }

    let d = if z.is_some() { 3 } else { 2 };
    let n = x.len();
    let points = DMatrix::from_fn(d, n, |row, col| match row {
        0 => x[col],
        1 => y[col],
        _ => z.map_or(0.0, |z| z[col]),
    });

    let moved = affine_xf(&points, m, inverse)?;
    Ok(TransformedPoints {
        x: moved.row(0).iter().copied().collect(),
        y: moved.row(1).iter().copied().collect(),
        z: z.map(|_| moved.row(2).iter().copied().collect()),
    })
}

fn inverse_4x4(tform: &DMatrix<f64>) -> Result<Matrix4<f64>, TransformError> {
    expect_dimension(tform, 3)?;
    Ok(Matrix4::from_iterator(
        invert_homogeneous(tform)?.iter().copied(),
    ))
}

/// Fills an output volume by sampling `input` at `map(x, y, z)` for each 0-based
/// output index.
fn resample_3d<F>(
    input: &ArrayView3<f64>,
    shape: (usize, usize, usize),
    map: F,
    fill_value: f64,
) -> Array3<f64>
where
    F: Fn(f64, f64, f64) -> (f64, f64, f64) + Sync,
{
    let mut output = Array3::from_elem(shape, fill_value);
    Zip::indexed(&mut output).par_for_each(|(plane, row, col), value| {
        let (x, y, z) = map(col as f64, row as f64, plane as f64);
        *value = trilinear(input, x, y, z, fill_value);
    });
    output
}

/// Lower sample index and fractional weight along one axis, `None` outside `[0, n-1]`.
fn axis_sample(coord: f64, n: usize) -> Option<(usize, usize, f64)> {
    const EDGE: f64 = 1e-9;
    if !coord.is_finite() || coord < -EDGE || coord > (n - 1) as f64 + EDGE {
        return None;
    }
    let clamped = coord.clamp(0.0, (n - 1) as f64);
    let lo = clamped.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    Some((lo, hi, clamped - lo as f64))
}

fn trilinear(input: &ArrayView3<f64>, x: f64, y: f64, z: f64, fill_value: f64) -> f64 {
    let (nz, ny, nx) = input.dim();
    let (Some((x0, x1, fx)), Some((y0, y1, fy)), Some((z0, z1, fz))) =
        (axis_sample(x, nx), axis_sample(y, ny), axis_sample(z, nz))
    else {
        return fill_value;
    };

    let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;
    let plane = |z: usize| {
        let top = lerp(input[[z, y0, x0]], input[[z, y0, x1]], fx);
        let bottom = lerp(input[[z, y1, x0]], input[[z, y1, x1]], fx);
        lerp(top, bottom, fy)
    };
    lerp(plane(z0), plane(z1), fz)
}

fn bilinear(input: &ArrayView2<f64>, x: f64, y: f64, fill_value: f64) -> f64 {
    let (ny, nx) = input.dim();
    let (Some((x0, x1, fx)), Some((y0, y1, fy))) = (axis_sample(x, nx), axis_sample(y, ny))
    else {
        return fill_value;
    };

    let top = input[[y0, x0]] + (input[[y0, x1]] - input[[y0, x0]]) * fx;
    let bottom = input[[y1, x0]] + (input[[y1, x1]] - input[[y1, x0]]) * fx;
    top + (bottom - top) * fy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{rotation_matrix_3d, translation_matrix};
    use approx::assert_relative_eq;
    use nalgebra::Vector3 as V3;

    fn blob(shape: (usize, usize, usize), center: (f64, f64, f64)) -> Array3<f64> {
        let (cz, cy, cx) = center;
        Array3::from_shape_fn(shape, |(z, y, x)| {
            let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2) + (z as f64 - cz).powi(2);
            (-d2 / 8.0).exp()
        })
    }

    #[test]
    fn test_identity_warp_reproduces_input() {
        let input = blob((8, 10, 12), (4.0, 5.0, 6.0));
        let r = ImRef3d::new(input.dim()).unwrap();
        let out = imwarp(input.view(), &DMatrix::identity(4, 4), &r, &r, 0.0).unwrap();
        for (a, b) in out.iter().zip(input.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_translation_moves_peak() {
        let input = blob((10, 12, 14), (4.0, 5.0, 6.0));
        let r = ImRef3d::new(input.dim()).unwrap();
        let tform = translation_matrix(&[2.0, 1.0, 1.0]);
        let out = imwarp(input.view(), &tform, &r, &r, 0.0).unwrap();

        assert_relative_eq!(out[[5, 6, 8]], 1.0, epsilon = 1e-12);
        assert_relative_eq!(out[[5, 6, 8]], input[[4, 5, 6]], epsilon = 1e-12);
        // voxels mapped from outside the input take the fill value
        assert_eq!(out[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_world_units_are_respected() {
        let input = blob((6, 8, 8), (3.0, 4.0, 4.0));
        let r = ImRef3d::with_pixel_extents(input.dim(), 0.5, 0.5, 2.0).unwrap();
        // one voxel in each direction, expressed in world units
        let tform = translation_matrix(&[0.5, 0.5, 2.0]);
        let out = imwarp(input.view(), &tform, &r, &r, -1.0).unwrap();
        assert_relative_eq!(out[[4, 5, 5]], input[[3, 4, 4]], epsilon = 1e-12);
        assert_eq!(out[[0, 0, 0]], -1.0);
    }

    #[test]
    fn test_fractional_shift_interpolates() {
        let input = Array3::from_shape_fn((2, 2, 4), |(_, _, x)| x as f64);
        let out = affine_xf_volume(input.view(), &translation_matrix(&[0.5, 0.0, 0.0]), f64::NAN)
            .unwrap();
        assert!(out[[0, 0, 0]].is_nan());
        assert_relative_eq!(out[[0, 0, 1]], 0.5, epsilon = 1e-12);
        assert_relative_eq!(out[[1, 1, 3]], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_reference_mismatch() {
        let input = Array3::<f64>::zeros((4, 5, 6));
        let r = ImRef3d::new((4, 6, 5)).unwrap();
        assert!(matches!(
            imwarp(input.view(), &DMatrix::identity(4, 4), &r, &r, 0.0),
            Err(WarpError::ReferenceMismatch { .. })
        ));
    }

    #[test]
    fn test_singular_matrix_propagates() {
        let input = Array3::<f64>::zeros((2, 2, 2));
        let r = ImRef3d::new(input.dim()).unwrap();
        let singular = DMatrix::<f64>::zeros(4, 4);
        assert_eq!(
            imwarp(input.view(), &singular, &r, &r, 0.0),
            Err(WarpError::Transform(TransformError::Singular))
        );
    }

    #[test]
    fn test_imwarp_2d_shift() {
        let input = Array2::from_shape_fn((5, 5), |(y, x)| (y * 10 + x) as f64);
        let r = ImRef2d::new(input.dim()).unwrap();
        let mut tform = DMatrix::identity(3, 3);
        tform[(0, 2)] = 1.0;
        let out = imwarp_2d(input.view(), &tform, &r, &r, 0.0).unwrap();
        assert_eq!(out[[2, 0]], 0.0);
        assert_relative_eq!(out[[2, 3]], input[[2, 2]], epsilon = 1e-12);
    }

    #[test]
    fn test_transform_points_round_trip() {
        let m = translation_matrix(&[1.0, 2.0, 3.0])
            * rotation_matrix_3d(&V3::new(0.0, 1.0, 0.0), 0.3);
        let x = [0.0, 1.0, 2.0];
        let y = [3.0, -1.0, 0.5];
        let z = [1.0, 1.0, 4.0];

        let moved = transform_points(&m, &x, &y, Some(&z), false).unwrap();
        let back = transform_points(
            &m,
            &moved.x,
            &moved.y,
            moved.z.as_deref(),
            true,
        )
        .unwrap();
        for (a, b) in back.x.iter().zip(x.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        for (a, b) in back.z.unwrap().iter().zip(z.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_transform_points_validation() {
        let m = DMatrix::identity(4, 4);
        assert!(matches!(
            transform_points(&m, &[1.0, 2.0], &[1.0], Some(&[0.0, 0.0]), false),
            Err(WarpError::LengthMismatch(_))
        ));
        // 2D points need a 3x3 matrix
        assert!(matches!(
            transform_points(&m, &[1.0], &[1.0], None, false),
            Err(WarpError::Transform(TransformError::MatrixSize { .. }))
        ));
    }
}
