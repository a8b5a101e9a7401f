//! Parameters of a GAM fit and their eager validation.
//!
//! `GamParameters` is the single, serializable description of a fit. It holds
//! the fields shared with the penalized GLM solver (family, link,
//! regularization controls, ...) together with the GAM-only fields (which
//! predictors are smoothed, their knots, basis types, scales and the retention
//! flags). All configuration errors are detected here, before any basis
//! construction is dispatched.

use crate::basis::BasisType;
use crate::data::TrainingFrame;
use crate::knots::default_num_knots;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use thiserror::Error;

/// Distribution family of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    #[default]
    Gaussian,
    Binomial,
    Poisson,
    Gamma,
    Tweedie,
}

/// Link function connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    /// The canonical link of the family.
    #[default]
    FamilyDefault,
    Identity,
    Log,
    Logit,
    Inverse,
}

/// Which solver the GLM should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    #[default]
    Auto,
    Irlsm,
    LBfgs,
    CoordinateDescent,
}

/// How missing predictor cells are handled when data are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingValuesHandling {
    #[default]
    MeanImputation,
    Skip,
}

/// One predictor to be expanded into spline basis columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorSpec {
    pub column: String,
    /// Number of knots. Defaults to `min(10, n_rows)`, or to the length of
    /// `knots` when explicit knots are given.
    #[serde(default)]
    pub num_knots: Option<usize>,
    #[serde(default)]
    pub basis: BasisType,
    /// Multiplies the roughness penalty; larger values give smoother fits.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Explicit knot locations in the scale of the raw predictor.
    #[serde(default)]
    pub knots: Option<Vec<f64>>,
}

fn default_scale() -> f64 {
    1.0
}

impl PredictorSpec {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            num_knots: None,
            basis: BasisType::default(),
            scale: default_scale(),
            knots: None,
        }
    }

    pub fn with_num_knots(mut self, num_knots: usize) -> Self {
        self.num_knots = Some(num_knots);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_knots(mut self, knots: Vec<f64>) -> Self {
        self.knots = Some(knots);
        self
    }
}

/// The complete set of parameters for one GAM fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamParameters {
    // --- Fields shared with the GLM solver ---
    pub response_column: String,
    pub ignored_columns: Vec<String>,
    pub family: Family,
    pub link: Link,
    pub solver: Solver,
    pub standardize: bool,
    pub intercept: bool,
    /// Elastic-net mixing; `0` is pure ridge.
    pub alpha: Vec<f64>,
    /// Overall regularization strength.
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

    // --- GAM-only fields ---
    pub gam_columns: Vec<PredictorSpec>,
    pub save_z_matrix: bool,
    pub save_gam_cols: bool,
    pub save_penalty_mat: bool,
    /// Worker threads for basis construction; `None` uses the global rayon pool.
    pub num_threads: Option<usize>,
    /// Prefix for keys of generated frames in the artifact store. Each fit
    /// extends it with a process-unique suffix.
    pub model_key: String,
}

impl Default for GamParameters {
    fn default() -> Self {
        Self {
            response_column: "response".to_string(),
            ignored_columns: Vec::new(),
            family: Family::Gaussian,
            link: Link::FamilyDefault,
            solver: Solver::Auto,
            standardize: false,
            intercept: true,
            alpha: vec![0.0],
            lambda: vec![0.0],
            lambda_search: false,
            nlambdas: None,
            lambda_min_ratio: None,
            tweedie_variance_power: 0.0,
            tweedie_link_power: 1.0,
            theta: 1e-10,
            prior: None,
            non_negative: false,
            max_iterations: None,
            beta_epsilon: 1e-4,
            objective_epsilon: None,
            gradient_epsilon: None,
            obj_reg: None,
            compute_p_values: false,
            remove_collinear_columns: false,
            early_stopping: true,
            missing_values_handling: MissingValuesHandling::MeanImputation,
            seed: None,
            gam_columns: Vec::new(),
            save_z_matrix: false,
            save_gam_cols: false,
            save_penalty_mat: false,
            num_threads: None,
            model_key: "gam".to_string(),
        }
    }
}

/// Configuration problems, all reported before any computation starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No GAM columns were specified. Use a plain GLM if no predictor needs smoothing.")]
    MissingGamColumns,
    #[error("Only the gaussian family is supported, but {0:?} was requested.")]
    UnsupportedFamily(Family),
    #[error("Only the identity or family_default link is supported, but {0:?} was requested.")]
    UnsupportedLink(Link),
    #[error("Column '{0}' was not found in the training frame.")]
    ColumnNotFound(String),
    #[error("Column '{0}' is the response and cannot be smoothed.")]
    ResponseAsGamColumn(String),
    #[error("Column '{0}' is listed as ignored and cannot be smoothed.")]
    IgnoredGamColumn(String),
    #[error("Column '{0}' is listed more than once as a GAM column.")]
    DuplicateGamColumn(String),
    #[error("GAM column '{column}' needs at least 2 knots, but {found} were requested.")]
    TooFewKnots { column: String, found: usize },
    #[error("GAM column '{column}' asks for {num_knots} knots but lists {explicit} explicit knots.")]
    KnotCountMismatch {
        column: String,
        num_knots: usize,
        explicit: usize,
    },
    #[error("Explicit knots for '{0}' must be finite and non-decreasing.")]
    InvalidKnots(String),
    #[error("Scale for '{column}' must be finite and positive, got {scale}.")]
    InvalidScale { column: String, scale: f64 },
    #[error(
        "save_gam_cols/save_z_matrix need at least 2 model terms (unsmoothed predictors plus GAM columns), found {0}."
    )]
    RetentionNotMeaningful(usize),
    #[error("Regularization parameter '{name}' has invalid value {value}.")]
    InvalidRegularization { name: &'static str, value: f64 },
    #[error("num_threads must be at least 1.")]
    InvalidThreadCount,
    #[error("Failed to read parameter file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML parameter file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize parameters to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// A `PredictorSpec` after validation, with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPredictor {
    pub column: String,
    pub num_knots: usize,
    pub basis: BasisType,
    pub scale: f64,
    pub knots: Option<Array1<f64>>,
}

impl ResolvedPredictor {
    /// Names of the uncentered basis columns, `"{column}_{basis}_{j}"`.
    pub fn column_names(&self) -> Vec<String> {
        (0..self.num_knots)
            .map(|j| format!("{}_{}_{}", self.column, self.basis, j))
            .collect()
    }

    /// Names of the centered basis columns, `"{column}_{basis}_decenter_{j}"`.
    pub fn centered_column_names(&self) -> Vec<String> {
        (0..self.num_knots - 1)
            .map(|j| format!("{}_{}_decenter_{}", self.column, self.basis, j))
            .collect()
    }
}

/// The outcome of validating parameters against a training frame.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub predictors: Vec<ResolvedPredictor>,
    /// Frame columns entering the design as plain predictors, in frame order.
    pub predictor_columns: Vec<String>,
    /// Plain predictors that are not smoothed.
    pub num_non_smooth: usize,
}

impl GamParameters {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads parameters from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates the parameters against `frame` and resolves per-predictor
    /// defaults. Nothing is computed if this fails.
    pub fn validate(&self, frame: &TrainingFrame) -> Result<ValidatedConfig, ConfigError> {
        if self.gam_columns.is_empty() {
            return Err(ConfigError::MissingGamColumns);
        }
        if self.family != Family::Gaussian {
            return Err(ConfigError::UnsupportedFamily(self.family));
        }
        if !matches!(self.link, Link::Identity | Link::FamilyDefault) {
            return Err(ConfigError::UnsupportedLink(self.link));
        }
        if frame.position(&self.response_column).is_none() {
            return Err(ConfigError::ColumnNotFound(self.response_column.clone()));
        }
        // Loaders may already have dropped the ignored columns.
        for ignored in &self.ignored_columns {
            if frame.position(ignored).is_none() {
                log::debug!("Ignored column '{ignored}' is not in the training frame.");
            }
        }
        self.validate_regularization()?;
        match self.num_threads {
            Some(0) => return Err(ConfigError::InvalidThreadCount),
            Some(n) if n > num_cpus::get() => log::warn!(
                "num_threads = {n} exceeds the {} available cores.",
                num_cpus::get()
            ),
            _ => {}
        }

        let mut seen = HashSet::new();
        let mut predictors = Vec::with_capacity(self.gam_columns.len());
        for spec in &self.gam_columns {
            predictors.push(self.resolve_predictor(spec, frame, &mut seen)?);
        }

        let predictor_columns: Vec<String> = frame
            .column_names()
            .iter()
            .filter(|c| **c != self.response_column && !self.ignored_columns.contains(c))
            .cloned()
            .collect();
        let num_non_smooth = predictor_columns
            .iter()
            .filter(|c| !seen.contains(c.as_str()))
            .count();

        // The same term count decides whether the smooth terms are centered.
        let total_terms = num_non_smooth + predictors.len();
        if (self.save_gam_cols || self.save_z_matrix) && total_terms < 2 {
            return Err(ConfigError::RetentionNotMeaningful(total_terms));
        }

        Ok(ValidatedConfig {
            predictors,
            predictor_columns,
            num_non_smooth,
        })
    }

    fn resolve_predictor<'a>(
        &self,
        spec: &'a PredictorSpec,
        frame: &TrainingFrame,
        seen: &mut HashSet<&'a str>,
    ) -> Result<ResolvedPredictor, ConfigError> {
        let column = spec.column.clone();
        if column == self.response_column {
            return Err(ConfigError::ResponseAsGamColumn(column));
        }
        if self.ignored_columns.contains(&column) {
            return Err(ConfigError::IgnoredGamColumn(column));
        }
        if frame.position(&column).is_none() {
            return Err(ConfigError::ColumnNotFound(column));
        }
        if !seen.insert(spec.column.as_str()) {
            return Err(ConfigError::DuplicateGamColumn(column));
        }
        if !spec.scale.is_finite() || spec.scale <= 0.0 {
            return Err(ConfigError::InvalidScale {
                column,
                scale: spec.scale,
            });
        }

        let explicit_len = spec.knots.as_ref().map(Vec::len);
        let num_knots = match (spec.num_knots, explicit_len) {
            (Some(k), Some(len)) if k != len => {
                return Err(ConfigError::KnotCountMismatch {
                    column,
                    num_knots: k,
                    explicit: len,
                });
            }
            (Some(k), _) => k,
            (None, Some(len)) => len,
            (None, None) => default_num_knots(frame.nrows()),
        };
        if num_knots < 2 {
            return Err(ConfigError::TooFewKnots {
                column,
                found: num_knots,
            });
        }

        let knots = match &spec.knots {
            Some(values) => {
                let ordered = values.windows(2).all(|w| w[0] <= w[1]);
                if !ordered || values.iter().any(|v| !v.is_finite()) {
                    return Err(ConfigError::InvalidKnots(column));
                }
                Some(Array1::from_vec(values.clone()))
            }
            None => None,
        };

        Ok(ResolvedPredictor {
            column,
            num_knots,
            basis: spec.basis,
            scale: spec.scale,
            knots,
        })
    }

    fn validate_regularization(&self) -> Result<(), ConfigError> {
        for &value in &self.alpha {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidRegularization { name: "alpha", value });
            }
        }
        for &value in &self.lambda {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidRegularization { name: "lambda", value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn frame(n: usize, names: &[&str]) -> TrainingFrame {
        TrainingFrame::from_columns(
            names
                .iter()
                .enumerate()
                .map(|(j, name)| (*name, Array::linspace(0.0, 1.0 + j as f64, n))),
        )
        .unwrap()
    }

    fn params(columns: &[&str]) -> GamParameters {
        GamParameters {
            response_column: "y".to_string(),
            gam_columns: columns.iter().map(|c| PredictorSpec::new(*c)).collect(),
            ..GamParameters::default()
        }
    }

    #[test]
    fn default_knots_are_capped_by_row_count() {
        let validated = params(&["x"]).validate(&frame(6, &["x", "y"])).unwrap();
        assert_eq!(validated.predictors[0].num_knots, 6);
        assert_eq!(validated.num_non_smooth, 0);

        let validated = params(&["x"]).validate(&frame(50, &["x", "z", "y"])).unwrap();
        assert_eq!(validated.predictors[0].num_knots, 10);
        assert_eq!(validated.predictor_columns, vec!["x", "z"]);
        assert_eq!(validated.num_non_smooth, 1);
    }

    #[test]
    fn explicit_knots_set_the_knot_count() {
        let mut p = params(&["x"]);
        p.gam_columns[0] = PredictorSpec::new("x").with_knots(vec![0.0, 0.5, 1.0]);
        let validated = p.validate(&frame(20, &["x", "y"])).unwrap();
        assert_eq!(validated.predictors[0].num_knots, 3);

        p.gam_columns[0] = PredictorSpec::new("x").with_num_knots(4).with_knots(vec![0.0, 1.0]);
        assert!(matches!(
            p.validate(&frame(20, &["x", "y"])),
            Err(ConfigError::KnotCountMismatch { num_knots: 4, explicit: 2, .. })
        ));

        p.gam_columns[0] = PredictorSpec::new("x").with_knots(vec![0.0, 2.0, 1.0]);
        assert!(matches!(
            p.validate(&frame(20, &["x", "y"])),
            Err(ConfigError::InvalidKnots(_))
        ));
    }

    #[test]
    fn configuration_errors_are_reported() {
        let f = frame(20, &["x", "z", "y"]);

        assert!(matches!(params(&[]).validate(&f), Err(ConfigError::MissingGamColumns)));
        assert!(matches!(
            params(&["nope"]).validate(&f),
            Err(ConfigError::ColumnNotFound(c)) if c == "nope"
        ));
        assert!(matches!(
            params(&["y"]).validate(&f),
            Err(ConfigError::ResponseAsGamColumn(_))
        ));
        assert!(matches!(
            params(&["x", "x"]).validate(&f),
            Err(ConfigError::DuplicateGamColumn(_))
        ));

        let mut p = params(&["x"]);
        p.gam_columns[0] = PredictorSpec::new("x").with_num_knots(1);
        assert!(matches!(
            p.validate(&f),
            Err(ConfigError::TooFewKnots { found: 1, .. })
        ));

        let mut p = params(&["x"]);
        p.gam_columns[0] = PredictorSpec::new("x").with_scale(0.0);
        assert!(matches!(p.validate(&f), Err(ConfigError::InvalidScale { .. })));

        let mut p = params(&["x"]);
        p.family = Family::Poisson;
        assert!(matches!(p.validate(&f), Err(ConfigError::UnsupportedFamily(Family::Poisson))));

        let mut p = params(&["x"]);
        p.link = Link::Log;
        assert!(matches!(p.validate(&f), Err(ConfigError::UnsupportedLink(Link::Log))));

        let mut p = params(&["x"]);
        p.alpha = vec![1.5];
        assert!(matches!(
            p.validate(&f),
            Err(ConfigError::InvalidRegularization { name: "alpha", .. })
        ));
    }

    #[test]
    fn retention_flags_need_enough_columns() {
        let mut p = params(&["x"]);
        p.save_gam_cols = true;
        assert!(matches!(
            p.validate(&frame(20, &["x", "y"])),
            Err(ConfigError::RetentionNotMeaningful(1))
        ));
        assert!(p.validate(&frame(20, &["x", "z", "y"])).is_ok());

        // Ignored columns do not count as predictors.
        p.ignored_columns = vec!["z".to_string()];
        assert!(p.validate(&frame(20, &["x", "z", "y"])).is_err());
    }

    #[test]
    fn ignored_columns_may_be_absent_from_the_frame() {
        let mut p = params(&["x"]);
        p.ignored_columns = vec!["w".to_string()];
        let validated = p.validate(&frame(20, &["y", "x", "z"])).unwrap();
        assert_eq!(validated.predictor_columns, vec!["x", "z"]);
        assert_eq!(validated.num_non_smooth, 1);

        // Still refused as a smooth term, present or not.
        let mut p = params(&["w"]);
        p.ignored_columns = vec!["w".to_string()];
        assert!(matches!(
            p.validate(&frame(20, &["y", "x"])),
            Err(ConfigError::IgnoredGamColumn(c)) if c == "w"
        ));
    }

    #[test]
    fn column_names_follow_the_basis_tag() {
        let resolved = ResolvedPredictor {
            column: "age".to_string(),
            num_knots: 3,
            basis: BasisType::CubicRegression,
            scale: 1.0,
            knots: None,
        };
        assert_eq!(resolved.column_names(), vec!["age_cr_0", "age_cr_1", "age_cr_2"]);
        assert_eq!(resolved.centered_column_names(), vec!["age_cr_decenter_0", "age_cr_decenter_1"]);
    }

    #[test]
    fn parameters_load_from_toml_with_defaults() {
        let text = r#"
            response_column = "y"
            standardize = true
            save_penalty_mat = true

            [[gam_columns]]
            column = "x"
            num_knots = 6
            basis = "cr"

            [[gam_columns]]
            column = "z"
            scale = 0.5
        "#;
        let p = GamParameters::from_toml_str(text).unwrap();
        assert_eq!(p.gam_columns.len(), 2);
        assert_eq!(p.gam_columns[0].num_knots, Some(6));
        assert_eq!(p.gam_columns[1].scale, 0.5);
        assert_eq!(p.gam_columns[1].basis, BasisType::CubicRegression);
        assert!(p.intercept);
        assert_eq!(p.family, Family::Gaussian);

        let again = GamParameters::from_toml_str(&p.to_toml_string().unwrap()).unwrap();
        assert_eq!(again, p);
    }
}
