//! Parallel construction of the per-predictor GAM columns.
//!
//! Every smooth predictor is one independent unit of work: build its basis and
//! penalty, center them when required, and put the generated columns into the
//! artifact store. Units run on rayon and each writes only into its own,
//! pre-allocated output slot. The build fails as a whole if any unit fails.

use crate::basis::{
    BasisError, BasisType, KnotSource, Standardization, create_cr_spline_basis, generate_basis,
};
use crate::centering::{apply_transform, center_basis};
use crate::config::ResolvedPredictor;
use crate::data::{DataError, TrainingFrame};
use crate::store::{ArtifactStore, gam_frame_key};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("Failed to build GAM columns for '{column}': {source}")]
    Predictor {
        column: String,
        #[source]
        source: BasisError,
    },
    #[error("Predictor column '{0}' is not present in the training frame.")]
    MissingColumn(String),
    #[error("Generated frame '{0}' was not found in the artifact store.")]
    MissingFrame(String),
    #[error("Construction unit {0} finished without producing a result.")]
    UnitNotRun(usize),
    #[error("Failed to build the construction thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to assemble generated columns: {0}")]
    Frame(#[from] DataError),
}

/// The basis of one smooth term, with the centering transform when one was applied.
#[derive(Debug, Clone)]
pub enum SmoothBasis {
    Uncentered { basis: Array2<f64> },
    Centered { basis: Array2<f64>, z: Array2<f64> },
}

impl SmoothBasis {
    pub fn basis(&self) -> &Array2<f64> {
        match self {
            SmoothBasis::Uncentered { basis } | SmoothBasis::Centered { basis, .. } => basis,
        }
    }

    pub fn z(&self) -> Option<&Array2<f64>> {
        match self {
            SmoothBasis::Uncentered { .. } => None,
            SmoothBasis::Centered { z, .. } => Some(z),
        }
    }

    pub fn is_centered(&self) -> bool {
        matches!(self, SmoothBasis::Centered { .. })
    }
}

/// Everything one construction unit produced for its predictor.
#[derive(Debug, Clone)]
pub struct PredictorArtifactSet {
    pub column: String,
    pub basis_type: BasisType,
    pub scale: f64,
    /// Knots in the scale the basis was evaluated in.
    pub knots: Array1<f64>,
    pub standardization: Option<Standardization>,
    pub smooth: SmoothBasis,
    /// Penalty matching `smooth`: `k × k`, or `(k-1) × (k-1)` when centered.
    pub penalty: Array2<f64>,
    pub column_names: Vec<String>,
    pub store_key: String,
}

/// The state needed to regenerate a smooth term's columns for new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothTerm {
    pub column: String,
    pub basis_type: BasisType,
    pub scale: f64,
    pub knots: Array1<f64>,
    pub standardization: Option<Standardization>,
    pub z: Option<Array2<f64>>,
    pub column_names: Vec<String>,
}

impl PredictorArtifactSet {
    pub fn num_columns(&self) -> usize {
        self.column_names.len()
    }

    pub fn term(&self) -> SmoothTerm {
        SmoothTerm {
            column: self.column.clone(),
            basis_type: self.basis_type,
            scale: self.scale,
            knots: self.knots.clone(),
            standardization: self.standardization,
            z: self.smooth.z().cloned(),
            column_names: self.column_names.clone(),
        }
    }
}

impl SmoothTerm {
    /// Evaluates this term's basis at `values`, applying the stored
    /// standardization and centering transform.
    pub fn regenerate(&self, values: ArrayView1<f64>) -> Result<Array2<f64>, BasisError> {
        let transformed = match &self.standardization {
            Some(st) => st.apply(values),
            None => values.to_owned(),
        };
        let (basis, _) = create_cr_spline_basis(transformed.view(), self.knots.view())?;
        match &self.z {
            Some(z) => apply_transform(basis.view(), z.view()),
            None => Ok(basis),
        }
    }
}

/// Settings shared by every construction unit of one fit.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub center: bool,
    pub standardize: bool,
    pub model_key: String,
    pub num_threads: Option<usize>,
}

/// The aggregated output of all construction units, in predictor order.
#[derive(Debug, Clone)]
pub struct GamColumns {
    pub artifacts: Vec<PredictorArtifactSet>,
    /// Generated frames fetched back from the store.
    pub frames: Vec<Arc<TrainingFrame>>,
    pub center: bool,
}

impl GamColumns {
    pub fn column_groups(&self) -> Vec<Vec<String>> {
        self.artifacts.iter().map(|a| a.column_names.clone()).collect()
    }

    pub fn store_keys(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.store_key.clone()).collect()
    }
}

/// Builds the GAM columns of every predictor in parallel and collects them in
/// predictor order once all units have finished.
pub fn build_gam_columns(
    frame: &TrainingFrame,
    predictors: &[ResolvedPredictor],
    options: &BuildOptions,
    store: &dyn ArtifactStore,
) -> Result<GamColumns, ConstructionError> {
    log::info!(
        "Building GAM columns for {} predictors [{}] (centering: {}).",
        predictors.len(),
        predictors.iter().map(|p| p.column.as_str()).join(", "),
        options.center
    );
    let start = Instant::now();

    let outcomes = dispatch_units(predictors.len(), options.num_threads, |i| {
        build_predictor_unit(frame, &predictors[i], options, store)
    })?;

    let mut artifacts = Vec::with_capacity(outcomes.len());
    let mut first_error = None;
    for outcome in outcomes {
        match outcome {
            Ok(artifact) => artifacts.push(artifact),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    // No partial results survive a failed build.
    if let Some(e) = first_error {
        for artifact in &artifacts {
            store.remove(&artifact.store_key);
        }
        return Err(e);
    }

    let mut frames = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        let generated = store
            .get(&artifact.store_key)
            .ok_or_else(|| ConstructionError::MissingFrame(artifact.store_key.clone()))?;
        frames.push(generated);
    }

    log::info!(
        "Built {} GAM columns in {:.2?}.",
        artifacts.iter().map(PredictorArtifactSet::num_columns).sum::<usize>(),
        start.elapsed()
    );
    Ok(GamColumns {
        artifacts,
        frames,
        center: options.center,
    })
}

/// Runs `unit(i)` for every `i < count` in parallel, each writing only into
/// slot `i`, and returns the outcomes in index order after all have finished.
pub fn dispatch_units<T, F>(
    count: usize,
    num_threads: Option<usize>,
    unit: F,
) -> Result<Vec<Result<T, ConstructionError>>, ConstructionError>
where
    T: Send,
    F: Fn(usize) -> Result<T, ConstructionError> + Sync,
{
    let mut slots: Vec<Option<Result<T, ConstructionError>>> = (0..count).map(|_| None).collect();

    let run = |slots: &mut [Option<Result<T, ConstructionError>>]| {
        slots
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, slot)| *slot = Some(unit(i)));
    };

    match num_threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            pool.install(|| run(&mut slots));
        }
        None => run(&mut slots),
    }

    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| slot.unwrap_or(Err(ConstructionError::UnitNotRun(i))))
        .collect())
}

/// One construction unit: basis, penalty, optional centering, and the store put.
pub fn build_predictor_unit(
    frame: &TrainingFrame,
    predictor: &ResolvedPredictor,
    options: &BuildOptions,
    store: &dyn ArtifactStore,
) -> Result<PredictorArtifactSet, ConstructionError> {
    log::debug!("Starting GAM columns for '{}'.", predictor.column);
    let fail = |source: BasisError| ConstructionError::Predictor {
        column: predictor.column.clone(),
        source,
    };

    let values = frame
        .column(&predictor.column)
        .ok_or_else(|| ConstructionError::MissingColumn(predictor.column.clone()))?;
    let knots = match &predictor.knots {
        Some(explicit) => KnotSource::Explicit(explicit.view()),
        None => KnotSource::Count(predictor.num_knots),
    };
    let generated =
        generate_basis(values, knots, predictor.scale, options.standardize).map_err(fail)?;

    let (smooth, penalty, column_names) = if options.center {
        let centered = center_basis(generated.basis.view(), generated.penalty.view()).map_err(fail)?;
        (
            SmoothBasis::Centered {
                basis: centered.basis,
                z: centered.z,
            },
            centered.penalty,
            predictor.centered_column_names(),
        )
    } else {
        (
            SmoothBasis::Uncentered {
                basis: generated.basis,
            },
            generated.penalty,
            predictor.column_names(),
        )
    };

    let generated_frame = TrainingFrame::from_columns(
        column_names
            .iter()
            .cloned()
            .zip(smooth.basis().columns().into_iter().map(|c| c.to_owned())),
    )?;
    let store_key = gam_frame_key(&options.model_key, &predictor.column);
    store.put(&store_key, generated_frame);

    log::debug!(
        "Finished GAM columns for '{}' ({} columns).",
        predictor.column,
        column_names.len()
    );
    Ok(PredictorArtifactSet {
        column: predictor.column.clone(),
        basis_type: predictor.basis,
        scale: predictor.scale,
        knots: generated.knots,
        standardization: generated.standardization,
        smooth,
        penalty,
        column_names,
        store_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Axis, array};
    use std::thread;
    use std::time::Duration;

    fn resolved(column: &str, num_knots: usize) -> ResolvedPredictor {
        ResolvedPredictor {
            column: column.to_string(),
            num_knots,
            basis: BasisType::CubicRegression,
            scale: 1.0,
            knots: None,
        }
    }

    fn options(center: bool) -> BuildOptions {
        BuildOptions {
            center,
            standardize: false,
            model_key: "test".to_string(),
            num_threads: Some(2),
        }
    }

    fn frame() -> TrainingFrame {
        let x = Array::linspace(0.0, 1.0, 30);
        let z = x.mapv(|v: f64| (3.0 * v).sin());
        TrainingFrame::from_columns([("x", x), ("z", z)]).unwrap()
    }

    #[test]
    fn uncentered_unit_stores_its_named_columns() {
        let store = InMemoryStore::new();
        let artifact =
            build_predictor_unit(&frame(), &resolved("x", 5), &options(false), &store).unwrap();
        assert!(!artifact.smooth.is_centered());
        assert_eq!(artifact.smooth.basis().dim(), (30, 5));
        assert_eq!(artifact.penalty.dim(), (5, 5));
        assert_eq!(artifact.column_names[4], "x_cr_4");

        let stored = store.get("test_gamcols_x").unwrap();
        assert_eq!(stored.column_names(), artifact.column_names.as_slice());
        assert_eq!(stored.column("x_cr_2").unwrap(), artifact.smooth.basis().column(2));
    }

    #[test]
    fn centered_units_are_collected_in_order() {
        let store = InMemoryStore::new();
        let predictors = vec![resolved("z", 4), resolved("x", 6)];
        let columns = build_gam_columns(&frame(), &predictors, &options(true), &store).unwrap();

        assert_eq!(columns.artifacts[0].column, "z");
        assert_eq!(columns.artifacts[1].column, "x");
        assert_eq!(columns.frames[1].ncols(), 5);
        assert_eq!(columns.column_groups()[0], vec!["z_cr_decenter_0", "z_cr_decenter_1", "z_cr_decenter_2"]);
        for artifact in &columns.artifacts {
            for sum in artifact.smooth.basis().sum_axis(Axis(0)).iter() {
                assert_abs_diff_eq!(*sum, 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn one_failing_unit_fails_the_build_and_clears_the_store() {
        let store = InMemoryStore::new();
        let constant = TrainingFrame::from_columns([
            ("x", Array::linspace(0.0, 1.0, 10)),
            ("c", Array1::from_elem(10, 2.0)),
        ])
        .unwrap();
        let predictors = vec![resolved("x", 4), resolved("c", 4)];
        match build_gam_columns(&constant, &predictors, &options(true), &store).unwrap_err() {
            ConstructionError::Predictor { column, source } => {
                assert_eq!(column, "c");
                assert!(matches!(source, BasisError::DegenerateKnots { .. }));
            }
            other => panic!("Expected a predictor failure, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn dispatch_order_ignores_completion_order() {
        let outcomes = dispatch_units(5, Some(5), |i| {
            if i == 1 {
                thread::sleep(Duration::from_millis(50));
            }
            Ok(i * 10)
        })
        .unwrap();
        let values: Vec<usize> = outcomes.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn regeneration_reproduces_the_training_columns() {
        let store = InMemoryStore::new();
        let mut opts = options(true);
        opts.standardize = true;
        let f = frame();
        let artifact = build_predictor_unit(&f, &resolved("z", 5), &opts, &store).unwrap();
        let term = artifact.term();

        let first = term.regenerate(f.column("z").unwrap()).unwrap();
        let second = term.regenerate(f.column("z").unwrap()).unwrap();
        assert_eq!(first, second);
        assert_abs_diff_eq!(first, artifact.smooth.basis().clone(), epsilon = 1e-12);

        let new_values = array![0.1, 0.5];
        assert_eq!(term.regenerate(new_values.view()).unwrap().dim(), (2, 4));
    }
}
