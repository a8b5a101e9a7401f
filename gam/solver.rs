//! The bridge between GAM configuration and a penalized GLM solver.
//!
//! Fields shared with the GLM are copied into `GlmParameters` one by one; the
//! GAM-only settings never reach the solver as scalars. They travel as one
//! `PenaltyAttachment` per smooth term instead, each holding the term's penalty
//! and the design columns it applies to.

use crate::config::{Family, GamParameters, Link, MissingValuesHandling, Solver};
use crate::construction::GamColumns;
use crate::design::{AugmentedDesign, GamLayout};
use ndarray::{Array1, Array2, Axis, s};
use ndarray_linalg::{Eigh, UPLO};
use std::ops::Range;
use thiserror::Error;

/// Eigenvalues below this fraction of the largest are treated as zero when
/// solving the penalized normal equations.
const EIGEN_RELATIVE_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("The built-in Gaussian solver does not support {0}.")]
    Unsupported(String),
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("The penalized normal equations produced non-finite coefficients.")]
    NonFiniteCoefficients,
    #[error("Eigendecomposition of the penalized normal equations failed: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// The parameter set of the penalized GLM, holding only fields it shares with
/// `GamParameters`.
#[derive(Debug, Clone, PartialEq)]
pub struct GlmParameters {
    pub response_column: String,
    pub ignored_columns: Vec<String>,
    pub family: Family,
    pub link: Link,
    pub solver: Solver,
    pub standardize: bool,
    pub intercept: bool,
    pub alpha: Vec<f64>,
    pub lambda: Vec<f64>,
    pub lambda_search: bool,
    pub nlambdas: Option<usize>,
    pub lambda_min_ratio: Option<f64>,
    pub tweedie_variance_power: f64,
    pub tweedie_link_power: f64,
    pub theta: f64,
    pub prior: Option<f64>,
    pub non_negative: bool,
    pub max_iterations: Option<usize>,
    pub beta_epsilon: f64,
    pub objective_epsilon: Option<f64>,
    pub gradient_epsilon: Option<f64>,
    pub obj_reg: Option<f64>,
    pub compute_p_values: bool,
    pub remove_collinear_columns: bool,
    pub early_stopping: bool,
    pub missing_values_handling: MissingValuesHandling,
    pub seed: Option<u64>,
}

impl GlmParameters {
    /// Copies every shared field. Knots, basis types, scales, thread counts
    /// and the retention flags stay with the GAM.
    pub fn from_gam(gam: &GamParameters) -> Self {
        Self {
            response_column: gam.response_column.clone(),
            ignored_columns: gam.ignored_columns.clone(),
            family: gam.family,
            link: gam.link,
            solver: gam.solver,
            standardize: gam.standardize,
            intercept: gam.intercept,
            alpha: gam.alpha.clone(),
            lambda: gam.lambda.clone(),
            lambda_search: gam.lambda_search,
            nlambdas: gam.nlambdas,
            lambda_min_ratio: gam.lambda_min_ratio,
            tweedie_variance_power: gam.tweedie_variance_power,
            tweedie_link_power: gam.tweedie_link_power,
            theta: gam.theta,
            prior: gam.prior,
            non_negative: gam.non_negative,
            max_iterations: gam.max_iterations,
            beta_epsilon: gam.beta_epsilon,
            objective_epsilon: gam.objective_epsilon,
            gradient_epsilon: gam.gradient_epsilon,
            obj_reg: gam.obj_reg,
            compute_p_values: gam.compute_p_values,
            remove_collinear_columns: gam.remove_collinear_columns,
            early_stopping: gam.early_stopping,
            missing_values_handling: gam.missing_values_handling,
            seed: gam.seed,
        }
    }
}

/// A smooth term's penalty together with the named design columns it acts on.
#[derive(Debug, Clone)]
pub struct PenaltyAttachment {
    pub term_name: String,
    pub column_names: Vec<String>,
    pub col_range: Range<usize>,
    pub penalty: Array2<f64>,
}

impl PenaltyAttachment {
    /// One attachment per penalized block of `layout`, in predictor order.
    pub fn from_layout(layout: &GamLayout, columns: &GamColumns) -> Result<Vec<Self>, SolverError> {
        if layout.penalty_map.len() != columns.artifacts.len() {
            return Err(SolverError::DimensionMismatch(format!(
                "{} penalized blocks for {} smooth terms",
                layout.penalty_map.len(),
                columns.artifacts.len()
            )));
        }
        Ok(layout
            .penalty_map
            .iter()
            .zip(&columns.artifacts)
            .map(|(block, artifact)| PenaltyAttachment {
                term_name: block.term_name.clone(),
                column_names: artifact.column_names.clone(),
                col_range: block.col_range.clone(),
                penalty: artifact.penalty.clone(),
            })
            .collect())
    }
}

/// Coefficients returned by a solver.
#[derive(Debug, Clone)]
pub struct GlmFit {
    /// One entry per design column, in design order.
    pub coefficients: Array1<f64>,
    pub intercept: Option<f64>,
    pub residual_sum_of_squares: f64,
}

/// A penalized regression solver invoked once on the assembled design.
pub trait PenalizedSolver {
    fn fit(
        &self,
        design: &AugmentedDesign,
        penalties: &[PenaltyAttachment],
        params: &GlmParameters,
    ) -> Result<GlmFit, SolverError>;
}

/// Closed-form penalized least squares for the Gaussian family with identity
/// link. Minimizes
/// `|y - b0 - X beta|^2 + sum_j beta_j' S_j beta_j + lambda (1 - alpha) |beta|^2`
/// with `b0` unpenalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianPenalizedSolver;

impl PenalizedSolver for GaussianPenalizedSolver {
    fn fit(
        &self,
        design: &AugmentedDesign,
        penalties: &[PenaltyAttachment],
        params: &GlmParameters,
    ) -> Result<GlmFit, SolverError> {
        check_supported(params)?;
        let x = &design.x;
        let y = &design.y;
        let (n, p) = x.dim();
        if y.len() != n {
            return Err(SolverError::DimensionMismatch(format!(
                "design has {n} rows but the response has {}",
                y.len()
            )));
        }
        for attachment in penalties {
            let width = attachment.col_range.len();
            if attachment.col_range.end > p || attachment.penalty.dim() != (width, width) {
                return Err(SolverError::DimensionMismatch(format!(
                    "penalty for {} does not fit columns {:?} of a {p}-column design",
                    attachment.term_name, attachment.col_range
                )));
            }
        }

        // Column centering stands in for an unpenalized intercept.
        let (x_means, y_mean) = if params.intercept {
            let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
            (means, y.mean().unwrap_or(0.0))
        } else {
            (Array1::zeros(p), 0.0)
        };
        let scales = if params.standardize {
            column_scales(x, &x_means)
        } else {
            Array1::ones(p)
        };

        let xs = (x - &x_means.view().insert_axis(Axis(0))) / &scales.view().insert_axis(Axis(0));
        let ys = y - y_mean;

        let mut system = xs.t().dot(&xs);
        for attachment in penalties {
            let range = attachment.col_range.clone();
            let block_scales = scales.slice(s![range.clone()]);
            // Penalty on the standardized coefficients beta_j * scale_j.
            let scaled = &attachment.penalty
                / &(&block_scales.view().insert_axis(Axis(1)) * &block_scales.view().insert_axis(Axis(0)));
            let mut block = system.slice_mut(s![range.clone(), range]);
            block += &scaled;
        }
        let ridge = params.lambda.first().copied().unwrap_or(0.0)
            * (1.0 - params.alpha.first().copied().unwrap_or(0.0));
        if ridge > 0.0 {
            for j in 0..p {
                system[[j, j]] += ridge;
            }
        }
        let rhs = xs.t().dot(&ys);

        let beta_std = solve_symmetric_pseudo_inverse(&system, &rhs)?;
        let coefficients = &beta_std / &scales;
        if coefficients.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFiniteCoefficients);
        }
        let intercept = params.intercept.then(|| y_mean - x_means.dot(&coefficients));

        let fitted = x.dot(&coefficients) + intercept.unwrap_or(0.0);
        let residual_sum_of_squares = (y - &fitted).mapv(|r| r * r).sum();
        log::info!(
            "Gaussian penalized fit on {n} rows × {p} columns with {} penalties; RSS = {residual_sum_of_squares:.6e}",
            penalties.len()
        );

        Ok(GlmFit {
            coefficients,
            intercept,
            residual_sum_of_squares,
        })
    }
}

fn check_supported(params: &GlmParameters) -> Result<(), SolverError> {
    if params.family != Family::Gaussian || !matches!(params.link, Link::Identity | Link::FamilyDefault) {
        return Err(SolverError::Unsupported(format!(
            "family {:?} with link {:?}",
            params.family, params.link
        )));
    }
    if params.alpha.iter().any(|&a| a > 0.0) {
        return Err(SolverError::Unsupported("an L1 penalty (alpha > 0)".to_string()));
    }
    if params.non_negative {
        return Err(SolverError::Unsupported("non-negative coefficients".to_string()));
    }
    if params.lambda_search || params.lambda.len() > 1 || params.alpha.len() > 1 {
        return Err(SolverError::Unsupported("a regularization path".to_string()));
    }
    Ok(())
}

/// Population standard deviation of every column around `means`; zero spread maps to 1.
fn column_scales(x: &Array2<f64>, means: &Array1<f64>) -> Array1<f64> {
    let n = x.nrows().max(1) as f64;
    Array1::from_iter(x.columns().into_iter().zip(means.iter()).map(|(col, &m)| {
        let sd = (col.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n).sqrt();
        if sd.is_finite() && sd > 0.0 { sd } else { 1.0 }
    }))
}

/// Solves `A beta = b` for symmetric positive semi-definite `A`, dropping
/// directions whose eigenvalue is negligible. Returns the minimum-norm solution.
fn solve_symmetric_pseudo_inverse(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, SolverError> {
    if a.is_empty() {
        return Ok(Array1::zeros(0));
    }
    let (eigenvalues, eigenvectors): (Array1<f64>, Array2<f64>) = a.eigh(UPLO::Lower)?;
    let largest = eigenvalues.iter().fold(0.0_f64, |m, &v| m.max(v.abs()));
    let tolerance = largest * EIGEN_RELATIVE_TOLERANCE;

    let projected = eigenvectors.t().dot(b);
    let weights = Array1::from_iter(
        eigenvalues
            .iter()
            .zip(projected.iter())
            .map(|(&ev, &c)| if ev > tolerance { c / ev } else { 0.0 }),
    );
    Ok(eigenvectors.dot(&weights))
}
