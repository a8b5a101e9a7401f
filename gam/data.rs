//! # Training Frame Loading
//!
//! Reads the tabular training data (TSV) into the in-memory column store the
//! rest of the crate works on. Every column is numeric; the response may not
//! contain missing values, while missing predictor cells are either imputed
//! with the column mean or cause the row to be dropped, depending on the
//! configured `MissingValuesHandling`.

use crate::config::MissingValuesHandling;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, ShapeBuilder};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A named, column-oriented numeric frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingFrame {
    column_names: Vec<String>,
    /// Shape: `[n_rows, column_names.len()]`.
    data: Array2<f64>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to f64. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Missing values were found in the response column '{0}'.")]
    MissingResponse(String),
    #[error("Column '{0}' has no observed values to impute from.")]
    NothingToImpute(String),
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Column '{0}' appears more than once.")]
    DuplicateColumn(String),
    #[error("Frame has {rows} rows but column '{column}' has {found} values.")]
    RaggedColumn {
        column: String,
        rows: usize,
        found: usize,
    },
    #[error("No rows remain after dropping rows with missing values.")]
    NoRowsRemaining,
}

impl TrainingFrame {
    /// Builds a frame from `(name, values)` pairs, in order.
    pub fn from_columns<I, S>(columns: I) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = (S, Array1<f64>)>,
        S: Into<String>,
    {
        let mut column_names = Vec::new();
        let mut values: Vec<Array1<f64>> = Vec::new();
        let mut seen = HashSet::new();
        for (name, column) in columns {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(DataError::DuplicateColumn(name));
            }
            if let Some(first) = values.first() {
                if first.len() != column.len() {
                    return Err(DataError::RaggedColumn {
                        column: name,
                        rows: first.len(),
                        found: column.len(),
                    });
                }
            }
            column_names.push(name);
            values.push(column);
        }

        let n_rows = values.first().map_or(0, |c| c.len());
        let mut data = Array2::zeros((n_rows, values.len()).f());
        for (j, column) in values.iter().enumerate() {
            data.column_mut(j).assign(column);
        }
        Ok(Self { column_names, data })
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.column_names.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.position(name).map(|j| self.data.column(j))
    }

    pub fn column_at(&self, index: usize) -> ArrayView1<'_, f64> {
        self.data.column(index)
    }

    /// All values as an `n_rows × n_cols` matrix, columns in frame order.
    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Returns a frame holding only the named columns, in the given order.
    pub fn select(&self, names: &[&str]) -> Result<Self, DataError> {
        let mut picked = Vec::with_capacity(names.len());
        for &name in names {
            let column = self
                .column(name)
                .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
            picked.push((name.to_string(), column.to_owned()));
        }
        Self::from_columns(picked)
    }

    /// Appends the columns of `other` on the right.
    pub fn append(&mut self, other: &TrainingFrame) -> Result<(), DataError> {
        if other.ncols() == 0 {
            return Ok(());
        }
        if self.ncols() > 0 && other.nrows() != self.nrows() {
            return Err(DataError::RaggedColumn {
                column: other.column_names[0].clone(),
                rows: self.nrows(),
                found: other.nrows(),
            });
        }
        for name in &other.column_names {
            if self.position(name).is_some() {
                return Err(DataError::DuplicateColumn(name.clone()));
            }
        }
        self.data = if self.ncols() == 0 {
            other.data.clone()
        } else {
            ndarray::concatenate(Axis(1), &[self.data.view(), other.data.view()])
                .map_err(|_| DataError::RaggedColumn {
                    column: other.column_names[0].clone(),
                    rows: self.nrows(),
                    found: other.nrows(),
                })?
        };
        self.column_names.extend(other.column_names.iter().cloned());
        Ok(())
    }
}

/// Loads a tab-separated training file, keeping `response` and every column in
/// `predictors` (all other columns are dropped).
pub fn load_training_frame(
    path: &str,
    response: &str,
    predictors: &[String],
    missing: MissingValuesHandling,
) -> Result<TrainingFrame, DataError> {
    log::info!("Loading training data from '{path}'");
    let df = internal::read_tsv(path)?;
    internal::frame_from_dataframe(&df, response, predictors, missing)
}

/// Loads a tab-separated training file, keeping every column except those in
/// `ignored`. The response always comes first.
pub fn load_all_columns(
    path: &str,
    response: &str,
    ignored: &[String],
    missing: MissingValuesHandling,
) -> Result<TrainingFrame, DataError> {
    log::info!("Loading training data from '{path}'");
    let df = internal::read_tsv(path)?;
    let predictors: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .filter(|name| name != response && !ignored.contains(name))
        .collect();
    internal::frame_from_dataframe(&df, response, &predictors, missing)
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    pub(super) fn read_tsv(path: &str) -> Result<DataFrame, DataError> {
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;
        Ok(df)
    }

    pub(super) fn frame_from_dataframe(
        df: &DataFrame,
        response: &str,
        predictors: &[String],
        missing: MissingValuesHandling,
    ) -> Result<TrainingFrame, DataError> {
        let columns_set: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let mut required: Vec<&str> = Vec::with_capacity(predictors.len() + 1);
        required.push(response);
        required.extend(predictors.iter().map(String::as_str).filter(|p| *p != response));
        for name in &required {
            if !columns_set.contains(*name) {
                return Err(DataError::ColumnNotFound((*name).to_string()));
            }
        }

        let response_values = extract_numeric_column(df, response)?;
        if response_values.iter().any(Option::is_none) {
            return Err(DataError::MissingResponse(response.to_string()));
        }

        let mut raw: Vec<(String, Vec<Option<f64>>)> =
            vec![(response.to_string(), response_values)];
        for name in required.iter().skip(1) {
            raw.push((name.to_string(), extract_numeric_column(df, name)?));
        }

        let frame = match missing {
            MissingValuesHandling::MeanImputation => mean_impute(raw)?,
            MissingValuesHandling::Skip => drop_incomplete_rows(raw)?,
        };
        log::info!(
            "Loaded {} rows and {} columns (response '{}').",
            frame.nrows(),
            frame.ncols(),
            response
        );
        Ok(frame)
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<f64>>, DataError> {
        let series = df.column(column_name)?;
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                found_type: format!("{:?}", series.dtype()),
            })?;

        // A cast that introduces new nulls means some cells were not numeric.
        if casted.null_count() > series.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
        if values.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn mean_impute(
        raw: Vec<(String, Vec<Option<f64>>)>,
    ) -> Result<TrainingFrame, DataError> {
        let mut columns = Vec::with_capacity(raw.len());
        for (name, values) in raw {
            let observed: Vec<f64> = values.iter().flatten().copied().collect();
            if observed.is_empty() {
                return Err(DataError::NothingToImpute(name));
            }
            let missing = values.len() - observed.len();
            let mean = observed.iter().sum::<f64>() / observed.len() as f64;
            if missing > 0 {
                log::info!("Imputed {missing} missing values in '{name}' with mean {mean:.6}");
            }
            let filled = Array1::from_iter(values.into_iter().map(|v| v.unwrap_or(mean)));
            columns.push((name, filled));
        }
        TrainingFrame::from_columns(columns)
    }

    pub(super) fn drop_incomplete_rows(
        raw: Vec<(String, Vec<Option<f64>>)>,
    ) -> Result<TrainingFrame, DataError> {
        let n_rows = raw.first().map_or(0, |(_, v)| v.len());
        let keep: Vec<usize> = (0..n_rows)
            .filter(|&i| raw.iter().all(|(_, v)| v[i].is_some()))
            .collect();
        if keep.is_empty() {
            return Err(DataError::NoRowsRemaining);
        }
        if keep.len() < n_rows {
            log::warn!("Dropped {} rows with missing values.", n_rows - keep.len());
        }
        let columns = raw.into_iter().map(|(name, values)| {
            let kept = Array1::from_iter(keep.iter().filter_map(|&i| values[i]));
            (name, kept)
        });
        TrainingFrame::from_columns(columns)
    }
}
