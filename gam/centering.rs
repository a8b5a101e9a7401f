//! Sum-to-zero reparameterization of a smooth term.
//!
//! A spline basis can represent constants, so next to a global intercept (or
//! another smooth term) one of its directions is not identifiable. The
//! transform here removes that direction: `Z` has `k - 1` orthonormal rows, all
//! orthogonal to the vector of basis column means, and the centered basis
//! `X Z'` has columns that each sum to zero.

use crate::basis::{BasisError, symmetrize};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};

/// A basis after centering, with the transform that produced it.
#[derive(Debug, Clone)]
pub struct CenteredBasis {
    /// `n_rows × (k - 1)` centered basis, `X Z'`.
    pub basis: Array2<f64>,
    /// `(k - 1) × (k - 1)` penalty, `Z S Z'`.
    pub penalty: Array2<f64>,
    /// `(k - 1) × k` null-space transform.
    pub z: Array2<f64>,
}

/// Centering is needed whenever the smooth term's constant direction would be
/// redundant: more than one smooth term, or at least two terms in total.
pub fn should_center(num_smooth: usize, num_non_smooth_predictors: usize) -> bool {
    num_smooth > 1 || num_non_smooth_predictors + num_smooth >= 2
}

/// Computes the `(k - 1) × k` transform whose rows span the orthogonal
/// complement of the basis column-mean vector.
///
/// Uses the Householder reflector `H = I - 2 u u' / (u' u)` with
/// `u = a + sign(a_0) |a| e_0`. `H` is symmetric and orthogonal and maps `a`
/// onto `e_0`, so its trailing `k - 1` rows are orthonormal and orthogonal to `a`.
pub fn null_space_transform(basis: ArrayView2<f64>) -> Result<Array2<f64>, BasisError> {
    let k = basis.ncols();
    if k < 2 {
        return Err(BasisError::TooFewKnots { found: k });
    }
    let means = basis
        .mean_axis(Axis(0))
        .ok_or_else(|| BasisError::DimensionMismatch("basis has no rows".to_string()))?;
    householder_complement(means.view())
}

fn householder_complement(a: ArrayView1<f64>) -> Result<Array2<f64>, BasisError> {
    let k = a.len();
    let norm = a.dot(&a).sqrt();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return Err(BasisError::SingularCentering { norm });
    }

    let mut u: Array1<f64> = a.to_owned();
    let sign = if a[0] >= 0.0 { 1.0 } else { -1.0 };
    u[0] += sign * norm;
    let utu = u.dot(&u);

    let mut h = Array2::<f64>::eye(k);
    for i in 0..k {
        for j in 0..k {
            h[[i, j]] -= 2.0 * u[i] * u[j] / utu;
        }
    }
    Ok(h.slice(s![1.., ..]).to_owned())
}

/// Right-multiplies a raw basis by `Z'`, producing the centered basis.
pub fn apply_transform(basis: ArrayView2<f64>, z: ArrayView2<f64>) -> Result<Array2<f64>, BasisError> {
    if basis.ncols() != z.ncols() {
        return Err(BasisError::DimensionMismatch(format!(
            "basis has {} columns but Z expects {}",
            basis.ncols(),
            z.ncols()
        )));
    }
    Ok(basis.dot(&z.t()))
}

/// Transforms a penalty congruently, `Z S Z'`, and re-symmetrizes the result.
pub fn transform_penalty(penalty: ArrayView2<f64>, z: ArrayView2<f64>) -> Result<Array2<f64>, BasisError> {
    if penalty.nrows() != z.ncols() || penalty.ncols() != z.ncols() {
        return Err(BasisError::DimensionMismatch(format!(
            "penalty is {}×{} but Z expects {}×{}",
            penalty.nrows(),
            penalty.ncols(),
            z.ncols(),
            z.ncols()
        )));
    }
    let transformed = z.dot(&penalty).dot(&z.t());
    Ok(symmetrize(transformed.view()))
}

/// Centers a raw basis and its penalty.
pub fn center_basis(
    basis: ArrayView2<f64>,
    penalty: ArrayView2<f64>,
) -> Result<CenteredBasis, BasisError> {
    let z = null_space_transform(basis)?;
    let centered = apply_transform(basis, z.view())?;
    let penalty = transform_penalty(penalty, z.view())?;
    if centered.iter().any(|v| !v.is_finite()) {
        return Err(BasisError::NonFiniteBasis("centered basis"));
    }
    Ok(CenteredBasis {
        basis: centered,
        penalty,
        z,
    })
}

/// Maps coefficients of the centered basis back onto the raw basis, `Z' beta`.
pub fn uncenter_coefficients(
    centered_beta: ArrayView1<f64>,
    z: ArrayView2<f64>,
) -> Result<Array1<f64>, BasisError> {
    if centered_beta.len() != z.nrows() {
        return Err(BasisError::DimensionMismatch(format!(
            "{} centered coefficients for a Z with {} rows",
            centered_beta.len(),
            z.nrows()
        )));
    }
    Ok(z.t().dot(&centered_beta))
}
