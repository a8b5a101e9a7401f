use crate::basis::BasisError;
use crate::centering::uncenter_coefficients;
use crate::config::GamParameters;
use crate::construction::SmoothTerm;
use csv::WriterBuilder;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These define the human-readable TOML format of a fitted GAM.

/// Everything a fit produces besides its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamModelOutput {
    /// Design column names, in the order of `coefficients`.
    pub coefficient_names: Vec<String>,
    pub coefficients: Array1<f64>,
    pub intercept: Option<f64>,
    pub residual_sum_of_squares: f64,
    /// Whether the smooth terms were centered.
    pub center_gam: bool,
    /// Original frame columns entering the design unsmoothed.
    pub predictor_columns: Vec<String>,
    /// One group of generated column names per smooth predictor.
    pub gam_column_names: Vec<Vec<String>>,
    /// Per smooth predictor, the state needed to regenerate its columns.
    pub artifacts: Vec<SmoothTerm>,
    /// Present when `save_z_matrix` was set and the terms were centered.
    pub z_matrices: Option<Vec<Array2<f64>>>,
    /// Present when `save_penalty_mat` was set.
    pub penalty_matrices: Option<Vec<Array2<f64>>>,
    /// Store keys of the generated frames, present when `save_gam_cols` was set.
    pub gam_frame_keys: Option<Vec<String>>,
}

/// The top-level fitted model artifact, saved to and loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamModel {
    pub parameters: GamParameters,
    pub output: GamModelOutput,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to write coefficient table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The model has no smooth term for column '{0}'.")]
    UnknownTerm(String),
    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] BasisError),
    #[error(
        "Coefficient vector has {found} entries but the model describes {expected} design columns."
    )]
    CoefficientCountMismatch { found: usize, expected: usize },
}

impl GamModel {
    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: GamModel = toml::from_str(&toml_string)?;
        model.check_consistency()?;
        Ok(model)
    }

    fn check_consistency(&self) -> Result<(), ModelError> {
        let found = self.output.coefficients.len();
        let expected = self.output.coefficient_names.len();
        if found != expected {
            return Err(ModelError::CoefficientCountMismatch { found, expected });
        }
        Ok(())
    }

    /// Writes `name\tcoefficient` rows, intercept first when fitted.
    pub fn write_coefficients(&self, path: &Path) -> Result<(), ModelError> {
        let mut wtr = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)?;
        wtr.write_record(["name", "coefficient"])?;
        if let Some(intercept) = self.output.intercept {
            wtr.write_record(["intercept".to_string(), format!("{intercept:.12}")])?;
        }
        for (name, value) in self
            .output
            .coefficient_names
            .iter()
            .zip(self.output.coefficients.iter())
        {
            wtr.write_record([name.clone(), format!("{value:.12}")])?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn term(&self, column: &str) -> Result<(usize, &SmoothTerm), ModelError> {
        self.output
            .artifacts
            .iter()
            .enumerate()
            .find(|(_, t)| t.column == column)
            .ok_or_else(|| ModelError::UnknownTerm(column.to_string()))
    }

    /// Rebuilds the GAM columns of `column` for new predictor values, using the
    /// knots, standardization and centering transform stored at fit time.
    pub fn regenerate_columns(
        &self,
        column: &str,
        values: ArrayView1<f64>,
    ) -> Result<Array2<f64>, ModelError> {
        let (_, term) = self.term(column)?;
        Ok(term.regenerate(values)?)
    }

    /// The fitted coefficients of one smooth term, in its generated-column order.
    pub fn smooth_coefficients(&self, column: &str) -> Result<Array1<f64>, ModelError> {
        let (index, _) = self.term(column)?;
        let start = self.output.predictor_columns.len()
            + self.output.gam_column_names[..index]
                .iter()
                .map(Vec::len)
                .sum::<usize>();
        let width = self.output.gam_column_names[index].len();
        let end = start + width;
        if end > self.output.coefficients.len() {
            return Err(ModelError::CoefficientCountMismatch {
                found: self.output.coefficients.len(),
                expected: end,
            });
        }
        Ok(self.output.coefficients.slice(ndarray::s![start..end]).to_owned())
    }

    /// The coefficients of one smooth term on its raw (uncentered) basis, one
    /// per knot.
    pub fn raw_smooth_coefficients(&self, column: &str) -> Result<Array1<f64>, ModelError> {
        let (_, term) = self.term(column)?;
        let beta = self.smooth_coefficients(column)?;
        match &term.z {
            Some(z) => Ok(uncenter_coefficients(beta.view(), z.view())?),
            None => Ok(beta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::BasisType;
    use ndarray::array;
    use tempfile::tempdir;

    fn model() -> GamModel {
        let z = array![[0.6, -0.8, 0.0], [0.0, 0.0, 1.0]];
        GamModel {
            parameters: GamParameters::default(),
            output: GamModelOutput {
                coefficient_names: vec![
                    "w".to_string(),
                    "x_cr_decenter_0".to_string(),
                    "x_cr_decenter_1".to_string(),
                ],
                coefficients: array![0.5, 1.0, -2.0],
                intercept: Some(3.0),
                residual_sum_of_squares: 0.25,
                center_gam: true,
                predictor_columns: vec!["w".to_string()],
                gam_column_names: vec![vec![
                    "x_cr_decenter_0".to_string(),
                    "x_cr_decenter_1".to_string(),
                ]],
                artifacts: vec![SmoothTerm {
                    column: "x".to_string(),
                    basis_type: BasisType::CubicRegression,
                    scale: 1.0,
                    knots: array![0.0, 0.5, 1.0],
                    standardization: None,
                    z: Some(z.clone()),
                    column_names: vec![
                        "x_cr_decenter_0".to_string(),
                        "x_cr_decenter_1".to_string(),
                    ],
                }],
                z_matrices: Some(vec![z]),
                penalty_matrices: None,
                gam_frame_keys: None,
            },
        }
    }

    #[test]
    fn save_and_load_preserve_the_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let original = model();
        original.save(path.to_str().unwrap()).unwrap();
        let loaded = GamModel::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn smooth_coefficients_are_sliced_and_uncentered() {
        let m = model();
        assert_eq!(m.smooth_coefficients("x").unwrap(), array![1.0, -2.0]);
        let raw = m.raw_smooth_coefficients("x").unwrap();
        assert_eq!(raw.len(), 3);
        approx::assert_abs_diff_eq!(raw, array![0.6, -0.8, -2.0], epsilon = 1e-12);
        assert!(matches!(m.smooth_coefficients("q"), Err(ModelError::UnknownTerm(_))));
    }

    #[test]
    fn regenerated_columns_match_the_stored_transform() {
        let m = model();
        let at_knots = m.regenerate_columns("x", array![0.0, 0.5, 1.0].view()).unwrap();
        // The raw basis is the identity at the knots, so the result is Z'.
        approx::assert_abs_diff_eq!(at_knots, m.output.z_matrices.as_ref().unwrap()[0].t().to_owned(), epsilon = 1e-12);
    }

    #[test]
    fn coefficients_are_written_as_tsv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coefficients.tsv");
        model().write_coefficients(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name\tcoefficient");
        assert!(lines[1].starts_with("intercept\t3.0"));
        assert!(lines[3].starts_with("x_cr_decenter_0\t1.0"));
        assert_eq!(lines.len(), 5);
    }
}
