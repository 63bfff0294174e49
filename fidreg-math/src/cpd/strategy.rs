//! M-step variants for the CPD driver.

use nalgebra::{DMatrix, DVector};

use super::{CpdError, Moments};

/// Transform estimated by one M-step
#[derive(Debug, Clone)]
pub struct TransformUpdate {
    pub rotation: DMatrix<f64>,
    pub translation: DVector<f64>,
    pub scale: f64,
    /// Weighted squared residual `Σ P·|x - (sRy + t)|²`, used for the variance update
    pub residual: f64,
}

/// Transform family fitted by a CPD run
pub trait CpdStrategy {
    const NAME: &'static str;

    fn update_transform(&self, moments: &Moments) -> Result<TransformUpdate, CpdError>;
}

/// Rotation and translation, scale fixed at one
#[derive(Debug, Clone, Copy, Default)]
pub struct Rigid;

/// Rotation, uniform scale and translation
#[derive(Debug, Clone, Copy, Default)]
pub struct Similarity;

/// General linear map and translation
#[derive(Debug, Clone, Copy, Default)]
pub struct Affine;

/// Weighted Procrustes rotation `U·diag(1, …, det(U·Vᵀ))·Vᵀ` of `A = U·Σ·Vᵀ`.
fn proper_rotation(a: &DMatrix<f64>) -> Result<DMatrix<f64>, CpdError> {
    let d = a.nrows();
    let svd = a.clone().svd(true, true);
    let u = svd.u.ok_or(CpdError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(CpdError::SvdFailed)?;

    let mut signs = DVector::from_element(d, 1.0);
    if (&u * &v_t).determinant() < 0.0 {
        signs[d - 1] = -1.0;
    }
    Ok(&u * DMatrix::from_diagonal(&signs) * &v_t)
}

impl CpdStrategy for Rigid {
    const NAME: &'static str = "rigid";

    fn update_transform(&self, moments: &Moments) -> Result<TransformUpdate, CpdError> {
        let rotation = proper_rotation(&moments.a)?;
        let tr_ar = (moments.a.transpose() * &rotation).trace();
        let translation = &moments.mu_x - &rotation * &moments.mu_y;
        let residual = moments.x_px - 2.0 * tr_ar + moments.ypy.trace();

        Ok(TransformUpdate {
            rotation,
            translation,
            scale: 1.0,
            residual,
        })
    }
}

impl CpdStrategy for Similarity {
    const NAME: &'static str = "similarity";

    fn update_transform(&self, moments: &Moments) -> Result<TransformUpdate, CpdError> {
        let rotation = proper_rotation(&moments.a)?;
        let tr_ar = (moments.a.transpose() * &rotation).trace();
        let ypy = moments.ypy.trace();
        if ypy <= f64::EPSILON {
            return Err(CpdError::SingularCovariance);
        }

        let scale = tr_ar / ypy;
        let translation = &moments.mu_x - &rotation * &moments.mu_y * scale;
        let residual = moments.x_px - scale * tr_ar;

        Ok(TransformUpdate {
            rotation,
            translation,
            scale,
            residual,
        })
    }
}

impl CpdStrategy for Affine {
    const NAME: &'static str = "affine";

    fn update_transform(&self, moments: &Moments) -> Result<TransformUpdate, CpdError> {
        let ypy_inv = moments
            .ypy
            .clone()
            .try_inverse()
            .ok_or(CpdError::SingularCovariance)?;

        let b = &moments.a * ypy_inv;
        let translation = &moments.mu_x - &b * &moments.mu_y;
        let residual = moments.x_px - (&moments.a * b.transpose()).trace();

        Ok(TransformUpdate {
            rotation: b,
            translation,
            scale: 1.0,
            residual,
        })
    }
}
