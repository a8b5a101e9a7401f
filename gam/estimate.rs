//! # GAM Fitting
//!
//! Drives one fit from validated parameters to a `GamModel`:
//!
//! 1.  **Validation:** every configuration error is reported before any basis
//!     is built.
//! 2.  **Construction:** the GAM columns of all smooth predictors are built in
//!     parallel and collected in predictor order.
//! 3.  **Assembly:** original predictors and generated columns form the
//!     augmented design; each term's penalty is attached to its column block.
//! 4.  **Solve:** the penalized solver is invoked once, and the retention flags
//!     decide which intermediate artifacts outlive the fit.

use crate::basis::BasisError;
use crate::centering::should_center;
use crate::config::{ConfigError, GamParameters};
use crate::construction::{BuildOptions, ConstructionError, GamColumns, build_gam_columns};
use crate::data::{DataError, TrainingFrame};
use crate::design::{AugmentedDesign, DesignError, GamLayout, assemble_design};
use crate::model::{GamModel, GamModelOutput, ModelError};
use crate::solver::{GlmFit, GlmParameters, PenaltyAttachment, PenalizedSolver, SolverError};
use crate::store::{ArtifactStore, unique_fit_key};
use std::time::Instant;
use thiserror::Error;

/// A comprehensive error type for the GAM fitting process.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid GAM configuration: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Failed to load training data: {0}")]
    DataError(#[from] DataError),

    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] BasisError),

    #[error("{0}")]
    ConstructionError(#[from] ConstructionError),

    #[error("Failed to assemble the design matrix: {0}")]
    DesignError(#[from] DesignError),

    #[error("The penalized solver failed: {0}")]
    SolverError(#[from] SolverError),

    #[error("{0}")]
    ModelError(#[from] ModelError),
}

/// Fits a Gaussian GAM on `frame`.
///
/// Generated frames are put into `store` while the columns are built. They are
/// removed again once the solver has run unless `save_gam_cols` is set.
pub fn fit_gam(
    frame: &TrainingFrame,
    params: &GamParameters,
    store: &dyn ArtifactStore,
    solver: &dyn PenalizedSolver,
) -> Result<GamModel, FitError> {
    let validated = params.validate(frame)?;
    let center = should_center(validated.predictors.len(), validated.num_non_smooth);
    log::info!(
        "Starting GAM fit: {} rows, {} smooth predictors, {} other predictors.",
        frame.nrows(),
        validated.predictors.len(),
        validated.num_non_smooth
    );
    let start = Instant::now();

    let options = BuildOptions {
        center,
        standardize: params.standardize,
        model_key: unique_fit_key(&params.model_key),
        num_threads: params.num_threads,
    };
    let columns = build_gam_columns(frame, &validated.predictors, &options, store)?;

    let solved = internal::assemble_and_solve(
        frame,
        params,
        &validated.predictor_columns,
        &columns,
        solver,
    );
    if !params.save_gam_cols {
        for key in columns.store_keys() {
            store.remove(&key);
        }
    }
    let (design, layout, fit) = solved?;
    log_layout_info(&layout);

    let output = GamModelOutput {
        coefficient_names: design.column_names,
        coefficients: fit.coefficients,
        intercept: fit.intercept,
        residual_sum_of_squares: fit.residual_sum_of_squares,
        center_gam: center,
        predictor_columns: validated.predictor_columns,
        gam_column_names: columns.column_groups(),
        artifacts: columns.artifacts.iter().map(|a| a.term()).collect(),
        z_matrices: (params.save_z_matrix && center).then(|| {
            columns
                .artifacts
                .iter()
                .filter_map(|a| a.smooth.z().cloned())
                .collect()
        }),
        penalty_matrices: params
            .save_penalty_mat
            .then(|| columns.artifacts.iter().map(|a| a.penalty.clone()).collect()),
        gam_frame_keys: params.save_gam_cols.then(|| columns.store_keys()),
    };

    log::info!("GAM fit finished in {:.2?}.", start.elapsed());
    Ok(GamModel {
        parameters: params.clone(),
        output,
    })
}

fn log_layout_info(layout: &GamLayout) {
    log::debug!(
        "Design layout: {} coefficients, predictors in columns {:?}.",
        layout.total_coeffs,
        layout.predictor_cols
    );
    for block in &layout.penalty_map {
        log::debug!(
            "  {} -> columns {:?} (penalty {})",
            block.term_name,
            block.col_range,
            block.penalty_idx
        );
    }
}

/// Internal module for estimation-specific implementation details.
mod internal {
    use super::*;

    pub(super) fn assemble_and_solve(
        frame: &TrainingFrame,
        params: &GamParameters,
        predictor_columns: &[String],
        columns: &GamColumns,
        solver: &dyn PenalizedSolver,
    ) -> Result<(AugmentedDesign, GamLayout, GlmFit), FitError> {
        let (design, layout) =
            assemble_design(frame, &params.response_column, predictor_columns, columns)?;
        let attachments = PenaltyAttachment::from_layout(&layout, columns)?;
        let glm_params = GlmParameters::from_gam(params);
        let fit = solver.fit(&design, &attachments, &glm_params)?;
        if fit.coefficients.len() != design.ncols() {
            return Err(SolverError::DimensionMismatch(format!(
                "solver returned {} coefficients for {} design columns",
                fit.coefficients.len(),
                design.ncols()
            ))
            .into());
        }
        Ok((design, layout, fit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PredictorSpec;
    use crate::solver::GaussianPenalizedSolver;
    use crate::store::InMemoryStore;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array1};

    fn smooth_frame(n: usize) -> TrainingFrame {
        let x = Array::linspace(0.0, 1.0, n);
        let w = x.mapv(|v: f64| (5.0 * v).cos());
        let y = x.mapv(|v: f64| (2.0 * std::f64::consts::PI * v).sin()) + &w * 0.5;
        TrainingFrame::from_columns([("x", x), ("w", w), ("y", y)]).unwrap()
    }

    fn params(columns: &[&str]) -> GamParameters {
        GamParameters {
            response_column: "y".to_string(),
            gam_columns: columns
                .iter()
                .map(|c| PredictorSpec::new(*c).with_num_knots(8).with_scale(1e-4))
                .collect(),
            ..GamParameters::default()
        }
    }

    #[test]
    fn fit_recovers_a_smooth_signal_and_clears_the_store() {
        let frame = smooth_frame(60);
        let store = InMemoryStore::new();
        let model = fit_gam(&frame, &params(&["x"]), &store, &GaussianPenalizedSolver).unwrap();

        assert!(model.output.center_gam);
        assert_eq!(model.output.predictor_columns, vec!["x", "w"]);
        assert_eq!(model.output.coefficients.len(), 2 + 7);
        assert_eq!(model.output.coefficient_names[2], "x_cr_decenter_0");
        assert!(model.output.z_matrices.is_none());
        assert!(model.output.penalty_matrices.is_none());
        assert!(model.output.gam_frame_keys.is_none());
        assert!(store.is_empty());

        let tss: f64 = {
            let y = frame.column("y").unwrap();
            let mean = y.mean().unwrap();
            y.iter().map(|v| (v - mean) * (v - mean)).sum()
        };
        assert!(model.output.residual_sum_of_squares < 0.01 * tss);
    }

    #[test]
    fn retention_flags_keep_the_requested_artifacts() {
        let frame = smooth_frame(40);
        let store = InMemoryStore::new();
        let mut p = params(&["x", "w"]);
        p.save_gam_cols = true;
        p.save_z_matrix = true;
        p.save_penalty_mat = true;
        let model = fit_gam(&frame, &p, &store, &GaussianPenalizedSolver).unwrap();

        let keys = model.output.gam_frame_keys.clone().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].starts_with("gam_") && keys[0].ends_with("_gamcols_x"));
        assert!(keys[1].ends_with("_gamcols_w"));
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(store.keys(), sorted);
        let zs = model.output.z_matrices.as_ref().unwrap();
        assert_eq!(zs.len(), 2);
        assert_eq!(zs[0].dim(), (7, 8));
        let penalties = model.output.penalty_matrices.as_ref().unwrap();
        assert_eq!(penalties[1].dim(), (7, 7));
    }

    #[test]
    fn fits_sharing_a_store_keep_their_frames_apart() {
        let frame = smooth_frame(40);
        let store = InMemoryStore::new();
        let mut retained = params(&["x"]);
        retained.save_gam_cols = true;
        let first = fit_gam(&frame, &retained, &store, &GaussianPenalizedSolver).unwrap();
        let second = fit_gam(&frame, &retained, &store, &GaussianPenalizedSolver).unwrap();

        let first_keys = first.output.gam_frame_keys.unwrap();
        let second_keys = second.output.gam_frame_keys.unwrap();
        assert_ne!(first_keys, second_keys);
        assert_eq!(store.len(), 2);

        // A fit that cleans up after itself leaves the retained frames alone.
        fit_gam(&frame, &params(&["x"]), &store, &GaussianPenalizedSolver).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains(&first_keys[0]));
        assert!(store.contains(&second_keys[0]));
    }

    #[test]
    fn configuration_errors_stop_the_fit_before_construction() {
        let frame = smooth_frame(20);
        let store = InMemoryStore::new();
        let mut p = params(&["x"]);
        p.gam_columns[0].num_knots = Some(1);
        match fit_gam(&frame, &p, &store, &GaussianPenalizedSolver).unwrap_err() {
            FitError::ConfigError(ConfigError::TooFewKnots { found, .. }) => assert_eq!(found, 1),
            other => panic!("Expected a configuration error, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn solver_failures_still_clear_the_store() {
        let frame = smooth_frame(20);
        let store = InMemoryStore::new();
        let mut p = params(&["x"]);
        p.alpha = vec![1.0];
        assert!(matches!(
            fit_gam(&frame, &p, &store, &GaussianPenalizedSolver),
            Err(FitError::SolverError(SolverError::Unsupported(_)))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn raw_coefficients_reproduce_the_fitted_smooth() {
        let frame = smooth_frame(50);
        let store = InMemoryStore::new();
        let model = fit_gam(&frame, &params(&["x"]), &store, &GaussianPenalizedSolver).unwrap();

        let x = frame.column("x").unwrap();
        let centered = model.regenerate_columns("x", x).unwrap();
        let beta = model.smooth_coefficients("x").unwrap();
        let term = &model.output.artifacts[0];
        let (raw_basis, _) =
            crate::basis::create_cr_spline_basis(x, term.knots.view()).unwrap();
        let raw_beta = model.raw_smooth_coefficients("x").unwrap();
        let via_centered: Array1<f64> = centered.dot(&beta);
        assert_abs_diff_eq!(via_centered, raw_basis.dot(&raw_beta), epsilon = 1e-10);
    }
}
