use super::*;
use approx::assert_relative_eq;
use nalgebra::{DMatrix, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_points(d: usize, n: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    DMatrix::from_fn(d, n, |_, _| rng.random_range(-50.0..50.0))
}

fn assert_matrix_close(a: &DMatrix<f64>, b: &DMatrix<f64>, eps: f64) {
    assert_eq!(a.shape(), b.shape());
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        assert_relative_eq!(*lhs, *rhs, epsilon = eps);
    }
}

fn known_rigid() -> DMatrix<f64> {
    let rotation = rotation_matrix_3d(&Vector3::new(0.3, -0.2, 1.0), 0.4);
    translation_matrix(&[4.0, -2.5, 1.25]) * rotation
}

#[test]
fn test_affine_xf_round_trip() {
    let points = random_points(3, 20, 1);
    let m = known_rigid() * scale_matrix(&[1.1, 0.9, 1.3]);

    let moved = affine_xf(&points, &m, false).unwrap();
    let back = affine_xf(&moved, &m, true).unwrap();
    assert_matrix_close(&back, &points, 1e-9);
}

#[test]
fn test_affine_xf_rejects_wrong_size() {
    let points = random_points(3, 5, 2);
    let m = DMatrix::<f64>::identity(3, 3);
    assert!(matches!(
        affine_xf(&points, &m, false),
        Err(TransformError::MatrixSize { expected: 4, .. })
    ));
}

#[test]
fn test_infer_translation() {
    let x = random_points(3, 12, 3);
    let m = translation_matrix(&[1.0, -2.0, 0.5]);
    let y = affine_xf(&x, &m, false).unwrap();

    let fitted = infer_translation(&x, &y).unwrap();
    assert_matrix_close(&fitted, &m, 1e-10);
}

#[test]
fn test_infer_rigid_recovers_rotation() {
    let x = random_points(3, 25, 4);
    let m = known_rigid();
    let y = affine_xf(&x, &m, false).unwrap();

    let fitted = infer_rigid(&x, &y, false).unwrap();
    assert_matrix_close(&fitted, &m, 1e-8);
    assert_relative_eq!(linear_part(&fitted).determinant(), 1.0, epsilon = 1e-10);
}

#[test]
fn test_infer_similarity_recovers_scale() {
    let x = random_points(3, 25, 5);
    let m = known_rigid() * scale_matrix(&[1.7, 1.7, 1.7]);
    let y = affine_xf(&x, &m, false).unwrap();

    let fitted = infer_similarity(&x, &y).unwrap();
    assert_matrix_close(&fitted, &m, 1e-8);
}

#[test]
fn test_infer_rigid_coplanar_points_stay_proper() {
    // all points in the z = 0 plane
    let mut x = random_points(3, 15, 6);
    x.row_mut(2).fill(0.0);
    let m = known_rigid();
    let y = affine_xf(&x, &m, false).unwrap();

    let fitted = infer_rigid(&x, &y, false).unwrap();
    assert_relative_eq!(linear_part(&fitted).determinant(), 1.0, epsilon = 1e-9);
    assert_matrix_close(&affine_xf(&x, &fitted, false).unwrap(), &y, 1e-8);
}

#[test]
fn test_infer_rigid_2d() {
    let x = random_points(2, 10, 7);
    let (s, c) = 0.7_f64.sin_cos();
    let mut m = DMatrix::identity(3, 3);
    m[(0, 0)] = c;
    m[(0, 1)] = -s;
    m[(1, 0)] = s;
    m[(1, 1)] = c;
    m[(0, 2)] = 3.0;
    m[(1, 2)] = -1.0;
    let y = affine_xf(&x, &m, false).unwrap();

    let fitted = infer_rigid(&x, &y, false).unwrap();
    assert_matrix_close(&fitted, &m, 1e-9);
}

#[test]
fn test_infer_affine_recovers_shear() {
    let x = random_points(3, 30, 8);
    let mut m = known_rigid() * scale_matrix(&[1.05, 0.95, 2.0]);
    m[(0, 1)] += 0.08;
    m[(2, 0)] -= 0.03;
    let y = affine_xf(&x, &m, false).unwrap();

    let fitted = infer_affine(&x, &y).unwrap();
    assert_matrix_close(&fitted, &m, 1e-8);
}

#[test]
fn test_infer_affine_rejects_coplanar() {
    let mut x = random_points(3, 10, 9);
    x.row_mut(2).fill(3.0);
    let y = x.clone();
    assert!(matches!(
        infer_affine(&x, &y),
        Err(TransformError::Degenerate { needed: 4, .. })
    ));
}

#[test]
fn test_infer_too_few_points() {
    let x = random_points(3, 3, 10);
    assert!(matches!(
        infer_affine(&x, &x),
        Err(TransformError::InsufficientPoints { needed: 4, got: 3 })
    ));
    assert!(matches!(
        infer_rigid(&x.columns(0, 2).into_owned(), &x.columns(0, 2).into_owned(), false),
        Err(TransformError::InsufficientPoints { needed: 3, got: 2 })
    ));
}

#[test]
fn test_infer_shape_mismatch() {
    let x = random_points(3, 10, 11);
    let y = random_points(3, 9, 12);
    assert!(matches!(
        infer_translation(&x, &y),
        Err(TransformError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_infer_2step_xy_affine_z_shift() {
    let x = random_points(3, 40, 13);
    let mut m = DMatrix::identity(4, 4);
    m[(0, 0)] = 1.02;
    m[(0, 1)] = 0.04;
    m[(1, 0)] = -0.03;
    m[(1, 1)] = 0.98;
    m[(0, 3)] = 2.0;
    m[(1, 3)] = -1.5;
    m[(2, 3)] = 0.75;
    let y = affine_xf(&x, &m, false).unwrap();

    let fitted = infer_2step(&x, &y).unwrap();
    assert_relative_eq!(fitted[(0, 0)], 1.02, epsilon = 1e-8);
    assert_relative_eq!(fitted[(1, 0)], -0.03, epsilon = 1e-8);
    assert_relative_eq!(fitted[(0, 3)], 2.0, epsilon = 1e-8);
    assert_relative_eq!(fitted[(1, 3)], -1.5, epsilon = 1e-8);
    assert_relative_eq!(fitted[(2, 3)], 0.75, epsilon = 1e-6);
    assert_relative_eq!(fitted[(2, 2)], 1.0, epsilon = 1e-6);
}

#[test]
fn test_infer_2step_rejects_2d() {
    let x = random_points(2, 10, 14);
    assert!(matches!(
        infer_2step(&x, &x),
        Err(TransformError::ArgumentError(_))
    ));
}

#[test]
fn test_mat2to3_keeps_z() {
    let mut m2 = DMatrix::identity(3, 3);
    m2[(0, 1)] = 0.5;
    m2[(0, 2)] = 7.0;
    m2[(1, 2)] = -3.0;
    let m3 = mat2to3(&m2).unwrap();
    assert_eq!(m3[(0, 1)], 0.5);
    assert_eq!(m3[(0, 3)], 7.0);
    assert_eq!(m3[(1, 3)], -3.0);
    assert_eq!(m3[(2, 2)], 1.0);
    assert_eq!(m3[(2, 3)], 0.0);
}

#[test]
fn test_invert_singular() {
    let m = scale_matrix(&[1.0, 0.0, 1.0]);
    assert_eq!(invert_homogeneous(&m), Err(TransformError::Singular));
}
