use crate::construction::GamColumns;
use crate::data::{DataError, TrainingFrame};
use ndarray::{Array1, Array2, s};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Response column '{0}' is not present in the training frame.")]
    MissingResponse(String),
    #[error("{0}")]
    LayoutError(String),
    #[error("Failed to assemble the augmented frame: {0}")]
    Frame(#[from] DataError),
}

/// Where each smooth term's coefficients live in the augmented design.
#[derive(Clone, Debug)]
pub struct GamLayout {
    /// Columns holding the original (unsmoothed) predictors.
    pub predictor_cols: Range<usize>,
    pub penalty_map: Vec<PenalizedBlock>,
    pub total_coeffs: usize,
}

/// Information about a single penalized block of coefficients.
#[derive(Clone, Debug, PartialEq)]
pub struct PenalizedBlock {
    pub term_name: String,
    pub col_range: Range<usize>,
    pub penalty_idx: usize,
}

impl GamLayout {
    /// Lays out `num_predictors` plain columns followed by one penalized block
    /// per entry of `block_sizes`, in order.
    pub fn new(
        num_predictors: usize,
        term_names: &[String],
        block_sizes: &[usize],
    ) -> Result<Self, DesignError> {
        if term_names.len() != block_sizes.len() {
            return Err(DesignError::LayoutError(format!(
                "GamLayout received {} term names but {} block sizes",
                term_names.len(),
                block_sizes.len()
            )));
        }
        let mut penalty_map = Vec::with_capacity(block_sizes.len());
        let mut current_col = num_predictors;
        for (penalty_idx, (name, &size)) in term_names.iter().zip(block_sizes).enumerate() {
            penalty_map.push(PenalizedBlock {
                term_name: format!("s({name})"),
                col_range: current_col..current_col + size,
                penalty_idx,
            });
            current_col += size;
        }
        Ok(GamLayout {
            predictor_cols: 0..num_predictors,
            penalty_map,
            total_coeffs: current_col,
        })
    }

    /// Places each block penalty into a `total_coeffs × total_coeffs` matrix
    /// at its block's position.
    pub fn embed_penalties(&self, penalties: &[Array2<f64>]) -> Result<Vec<Array2<f64>>, DesignError> {
        if penalties.len() != self.penalty_map.len() {
            return Err(DesignError::LayoutError(format!(
                "{} penalties supplied for {} penalized blocks",
                penalties.len(),
                self.penalty_map.len()
            )));
        }
        let p = self.total_coeffs;
        let mut embedded = Vec::with_capacity(penalties.len());
        for block in &self.penalty_map {
            let penalty = &penalties[block.penalty_idx];
            let width = block.col_range.len();
            if penalty.dim() != (width, width) {
                return Err(DesignError::LayoutError(format!(
                    "Penalty for {} is {}×{} but its block spans {} columns",
                    block.term_name,
                    penalty.nrows(),
                    penalty.ncols(),
                    width
                )));
            }
            let mut full = Array2::zeros((p, p));
            full.slice_mut(s![block.col_range.clone(), block.col_range.clone()])
                .assign(penalty);
            embedded.push(full);
        }
        Ok(embedded)
    }
}

/// The design matrix handed to the solver.
#[derive(Debug, Clone)]
pub struct AugmentedDesign {
    /// `n_rows × total_coeffs`: original predictors, then every GAM column.
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub column_names: Vec<String>,
    /// One group of generated column names per smooth predictor.
    pub column_groups: Vec<Vec<String>>,
    /// The full training frame with the generated columns appended.
    pub frame: TrainingFrame,
}

impl AugmentedDesign {
    pub fn nrows(&self) -> usize {
        self.x.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.x.ncols()
    }
}

/// Appends every generated frame to the training frame in predictor order and
/// extracts the design matrix (response excluded) and the response vector.
///
/// `predictor_columns` are the original frame columns that enter the design
/// as plain predictors, in frame order.
pub fn assemble_design(
    frame: &TrainingFrame,
    response: &str,
    predictor_columns: &[String],
    columns: &GamColumns,
) -> Result<(AugmentedDesign, GamLayout), DesignError> {
    let y = frame
        .column(response)
        .ok_or_else(|| DesignError::MissingResponse(response.to_string()))?
        .to_owned();

    let mut augmented = frame.clone();
    for generated in &columns.frames {
        augmented.append(generated)?;
    }

    let mut column_names: Vec<String> = predictor_columns.to_vec();
    let column_groups = columns.column_groups();
    column_names.extend(column_groups.iter().flatten().cloned());

    let selected: Vec<&str> = column_names.iter().map(String::as_str).collect();
    let design = augmented.select(&selected)?;

    let term_names: Vec<String> = columns.artifacts.iter().map(|a| a.column.clone()).collect();
    let block_sizes: Vec<usize> = column_groups.iter().map(Vec::len).collect();
    let layout = GamLayout::new(predictor_columns.len(), &term_names, &block_sizes)?;
    if layout.total_coeffs != design.ncols() {
        return Err(DesignError::LayoutError(format!(
            "GamLayout dimension calculation error: calculated total_coeffs={} but the design has {} columns",
            layout.total_coeffs,
            design.ncols()
        )));
    }

    log::info!(
        "Assembled design matrix: {} rows × {} columns ({} predictors, {} GAM columns).",
        design.nrows(),
        design.ncols(),
        predictor_columns.len(),
        design.ncols() - predictor_columns.len()
    );

    let x = design.values().to_owned();
    Ok((
        AugmentedDesign {
            x,
            y,
            column_names,
            column_groups,
            frame: augmented,
        },
        layout,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn layout_places_blocks_after_the_predictors() {
        let layout = GamLayout::new(2, &["a".to_string(), "b".to_string()], &[3, 4]).unwrap();
        assert_eq!(layout.total_coeffs, 9);
        assert_eq!(layout.penalty_map[0].col_range, 2..5);
        assert_eq!(layout.penalty_map[1].col_range, 5..9);
        assert_eq!(layout.penalty_map[1].term_name, "s(b)");
    }

    #[test]
    fn penalties_are_embedded_at_their_blocks() {
        let layout = GamLayout::new(1, &["a".to_string()], &[2]).unwrap();
        let embedded = layout.embed_penalties(&[array![[1.0, -1.0], [-1.0, 1.0]]]).unwrap();
        let expected = array![[0.0, 0.0, 0.0], [0.0, 1.0, -1.0], [0.0, -1.0, 1.0]];
        assert_eq!(embedded[0], expected);

        match layout.embed_penalties(&[Array2::zeros((3, 3))]).unwrap_err() {
            DesignError::LayoutError(msg) => assert!(msg.contains("spans 2 columns")),
            other => panic!("Expected LayoutError, got {other:?}"),
        }
    }
}
