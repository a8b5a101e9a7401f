use crate::knots::{data_range, locate_bin, uniform_knots};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The basis families a smooth predictor can be expanded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BasisType {
    /// Cubic regression spline parameterized by its values at the knots.
    #[default]
    #[serde(rename = "cr")]
    CubicRegression,
}

impl BasisType {
    /// Short tag used when naming generated columns.
    pub fn tag(self) -> &'static str {
        match self {
            BasisType::CubicRegression => "cr",
        }
    }
}

impl std::fmt::Display for BasisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("A cubic regression spline needs at least 2 knots, but {found} were requested.")]
    TooFewKnots { found: usize },

    #[error("Cannot build a spline basis for an empty predictor column.")]
    EmptyPredictor,

    #[error("The predictor column contains non-finite values; impute it before building a basis.")]
    NonFinitePredictor,

    #[error("Knot vector must be finite and non-decreasing; knot {index} ({value}) breaks this.")]
    InvalidKnots { index: usize, value: f64 },

    #[error(
        "Knots {index} and {next} coincide at {value}; the zero-width interval makes the basis degenerate."
    )]
    DegenerateKnots { index: usize, next: usize, value: f64 },

    #[error("The generated {0} contains non-finite entries.")]
    NonFiniteBasis(&'static str),

    #[error(
        "Centering is impossible: the basis column means have norm {norm:e}, so no identifiable null space exists."
    )]
    SingularCentering { norm: f64 },

    #[error("Matrix dimensions do not agree: {0}")]
    DimensionMismatch(String),

    #[error("Inverting the knot-spacing matrix failed: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Where the knots of a basis come from.
#[derive(Debug, Clone, Copy)]
pub enum KnotSource<'a> {
    /// Spread this many knots evenly over the observed range of the data.
    Count(usize),
    /// Use these knots, given in the scale of the raw predictor.
    Explicit(ArrayView1<'a, f64>),
}

/// Centering and scaling applied to a predictor before basis evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub mean: f64,
    pub sd: f64,
}

impl Standardization {
    /// Mean and population standard deviation of `values`. A zero or
    /// non-finite spread falls back to a unit scale.
    pub fn from_data(values: ArrayView1<f64>) -> Self {
        let n = values.len().max(1) as f64;
        let mean = values.sum() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        let sd = var.sqrt();
        let sd = if sd.is_finite() && sd > 0.0 { sd } else { 1.0 };
        Self { mean, sd }
    }

    pub fn apply(&self, values: ArrayView1<f64>) -> Array1<f64> {
        values.mapv(|v| (v - self.mean) / self.sd)
    }
}

/// Everything generated for a single smooth predictor before centering.
#[derive(Debug, Clone)]
pub struct GeneratedBasis {
    /// Knots in the scale the basis is evaluated in.
    pub knots: Array1<f64>,
    /// `n_rows × num_knots` basis matrix.
    pub basis: Array2<f64>,
    /// `num_knots × num_knots` roughness penalty, already multiplied by the scale.
    pub penalty: Array2<f64>,
    pub standardization: Option<Standardization>,
}

/// Builds the cubic regression spline basis and scaled roughness penalty for
/// one fully imputed predictor column.
///
/// With `KnotSource::Count(k)` the knots are spread evenly over the observed
/// range. With `standardize` the predictor (and any explicit knots) are first
/// mapped to `(x - mean) / sd`.
pub fn generate_basis(
    values: ArrayView1<f64>,
    knots: KnotSource<'_>,
    scale: f64,
    standardize: bool,
) -> Result<GeneratedBasis, BasisError> {
    if values.is_empty() {
        return Err(BasisError::EmptyPredictor);
    }
    if let KnotSource::Count(k) = knots {
        if k < 2 {
            return Err(BasisError::TooFewKnots { found: k });
        }
    }

    let standardization = standardize.then(|| Standardization::from_data(values));
    let transformed = match &standardization {
        Some(st) => st.apply(values),
        None => values.to_owned(),
    };

    let knot_vector = match knots {
        KnotSource::Count(k) => {
            let (min, max) = data_range(transformed.view()).ok_or(BasisError::NonFinitePredictor)?;
            uniform_knots(min, max, k)
        }
        KnotSource::Explicit(raw) => match &standardization {
            Some(st) => st.apply(raw),
            None => raw.to_owned(),
        },
    };

    let (basis, unscaled_penalty) = create_cr_spline_basis(transformed.view(), knot_vector.view())?;
    let penalty = unscaled_penalty * scale;
    if penalty.iter().any(|v| !v.is_finite()) {
        return Err(BasisError::NonFiniteBasis("penalty matrix"));
    }

    Ok(GeneratedBasis {
        knots: knot_vector,
        basis,
        penalty,
        standardization,
    })
}

/// Evaluates the cubic regression spline basis at `data` for the given knots.
///
/// Returns the `[data.len(), knots.len()]` basis matrix and the unscaled
/// penalty `S = D' B^-1 D`, where `beta' S beta` is the integrated squared
/// second derivative of the spline with knot values `beta`.
pub fn create_cr_spline_basis(
    data: ArrayView1<f64>,
    knots: ArrayView1<f64>,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let (f_matrix, penalty) = cr_spline_matrices(knots)?;

    let mut basis = Array2::zeros((data.len(), knots.len()));
    for (i, &x) in data.iter().enumerate() {
        if !x.is_finite() {
            return Err(BasisError::NonFinitePredictor);
        }
        let row = internal::evaluate_at_point(x, knots, f_matrix.view());
        basis.row_mut(i).assign(&row);
    }

    if basis.iter().any(|v| !v.is_finite()) {
        return Err(BasisError::NonFiniteBasis("basis matrix"));
    }
    Ok((basis, penalty))
}

/// Computes `F` (maps knot values to second derivatives at the knots) and the
/// roughness penalty `S` for a knot vector.
///
/// With `h_j = x_{j+1} - x_j`, `D` is the `(k-2) × k` second-difference matrix
/// and `B` the `(k-2) × (k-2)` symmetric tridiagonal matrix of the natural
/// cubic spline continuity conditions. `F = [0; B^-1 D; 0]` and the penalty
/// is `S = D' B^-1 D`.
pub fn cr_spline_matrices(knots: ArrayView1<f64>) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let k = knots.len();
    if k < 2 {
        return Err(BasisError::TooFewKnots { found: k });
    }
    internal::validate_knots(knots)?;

    let h: Vec<f64> = knots.windows(2).into_iter().map(|w| w[1] - w[0]).collect();
    if let Some(index) = h.iter().position(|&hj| hj <= 0.0) {
        return Err(BasisError::DegenerateKnots {
            index,
            next: index + 1,
            value: knots[index],
        });
    }

    // Two knots: the spline is linear and carries no curvature.
    if k == 2 {
        return Ok((Array2::zeros((2, 2)), Array2::zeros((2, 2))));
    }

    let m = k - 2;
    let mut d = Array2::<f64>::zeros((m, k));
    let mut b = Array2::<f64>::zeros((m, m));
    for i in 0..m {
        d[[i, i]] = 1.0 / h[i];
        d[[i, i + 1]] = -1.0 / h[i] - 1.0 / h[i + 1];
        d[[i, i + 2]] = 1.0 / h[i + 1];

        b[[i, i]] = (h[i] + h[i + 1]) / 3.0;
        if i + 1 < m {
            b[[i, i + 1]] = h[i + 1] / 6.0;
            b[[i + 1, i]] = h[i + 1] / 6.0;
        }
    }

    let binv_d = b.inv()?.dot(&d);

    let mut f_matrix = Array2::zeros((k, k));
    f_matrix.slice_mut(s![1..k - 1, ..]).assign(&binv_d);

    let s_raw = d.t().dot(&binv_d);
    let penalty = symmetrize(s_raw.view());

    if f_matrix.iter().any(|v| !v.is_finite()) || penalty.iter().any(|v| !v.is_finite()) {
        return Err(BasisError::NonFiniteBasis("knot spacing matrices"));
    }
    Ok((f_matrix, penalty))
}

/// Returns `(A + A') / 2`.
pub fn symmetrize(a: ArrayView2<f64>) -> Array2<f64> {
    (&a + &a.t()) * 0.5
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) fn validate_knots(knots: ArrayView1<f64>) -> Result<(), BasisError> {
        for (index, &value) in knots.iter().enumerate() {
            let out_of_order = index > 0 && value < knots[index - 1];
            if !value.is_finite() || out_of_order {
                return Err(BasisError::InvalidKnots { index, value });
            }
        }
        Ok(())
    }

    /// Evaluates all `k` basis functions at `x`.
    ///
    /// Inside `[x_0, x_{k-1}]` this is the cardinal cubic form on the interval
    /// `[x_j, x_{j+1}]`. Outside, the spline is continued linearly, matching
    /// the zero second derivative at the boundary knots.
    pub(super) fn evaluate_at_point(
        x: f64,
        knots: ArrayView1<f64>,
        f_matrix: ArrayView2<f64>,
    ) -> Array1<f64> {
        let k = knots.len();
        let first = knots[0];
        let last = knots[k - 1];

        if x < first {
            let j = 0;
            let h = knots[1] - knots[0];
            let mut slope = &f_matrix.row(j) * (-h / 3.0) + &f_matrix.row(j + 1) * (-h / 6.0);
            slope[j] -= 1.0 / h;
            slope[j + 1] += 1.0 / h;
            let mut row = slope * (x - first);
            row[j] += 1.0;
            return row;
        }
        if x > last {
            let j = k - 2;
            let h = knots[k - 1] - knots[k - 2];
            let mut slope = &f_matrix.row(j) * (h / 6.0) + &f_matrix.row(j + 1) * (h / 3.0);
            slope[j] -= 1.0 / h;
            slope[j + 1] += 1.0 / h;
            let mut row = slope * (x - last);
            row[j + 1] += 1.0;
            return row;
        }

        let j = locate_bin(x, knots);
        let h = knots[j + 1] - knots[j];
        let right = knots[j + 1] - x;
        let left = x - knots[j];

        let a_minus = right / h;
        let a_plus = left / h;
        let c_minus = (right.powi(3) / h - h * right) / 6.0;
        let c_plus = (left.powi(3) / h - h * left) / 6.0;

        let mut row = &f_matrix.row(j) * c_minus + &f_matrix.row(j + 1) * c_plus;
        row[j] += a_minus;
        row[j + 1] += a_plus;
        row
    }
}
