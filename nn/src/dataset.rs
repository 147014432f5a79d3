//! In-memory training data.
//!
//! Datasets are read from JSON documents of the form
//! `{"inputs": [[...], ...], "targets": [[...], ...]}`, one row per sample.
use crate::{
    errors::{NnError, NnResult},
    Precision, Tensor,
};
use ndarray::{array, Array2};
use serde_derive::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    inputs: Tensor,
    targets: Tensor,
}

#[derive(Deserialize)]
struct RawDataset {
    inputs: Vec<Vec<Precision>>,
    targets: Vec<Vec<Precision>>,
}

#[derive(Deserialize)]
struct RawInputs {
    inputs: Vec<Vec<Precision>>,
}

impl Dataset {
    /// Fails if there are no samples or inputs and targets differ in their number of rows.
    pub fn new(inputs: Tensor, targets: Tensor) -> NnResult<Dataset> {
        if inputs.nrows() != targets.nrows() {
            return Err(NnError::SampleCountError {
                inputs: inputs.nrows(),
                targets: targets.nrows(),
            });
        }
        if inputs.is_empty() || targets.is_empty() {
            return Err(NnError::EmptyBatchError);
        }
        Ok(Dataset { inputs, targets })
    }

    pub fn from_json_str(content: &str) -> NnResult<Dataset> {
        let raw: RawDataset = serde_json::from_str(content)?;
        Dataset::new(tensor_from_rows(raw.inputs)?, tensor_from_rows(raw.targets)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> NnResult<Dataset> {
        let raw_file = fs::read_to_string(path)?;
        Dataset::from_json_str(&raw_file)
    }

    /// The four samples of the XOR function.
    pub fn xor() -> Dataset {
        Dataset {
            inputs: array![[0., 0.], [0., 1.], [1., 0.], [1., 1.]],
            targets: array![[0.], [1.], [1.], [0.]],
        }
    }

    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    pub fn targets(&self) -> &Tensor {
        &self.targets
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads only the `inputs` field of a dataset document, e.g. for prediction.
pub fn inputs_from_json_file<P: AsRef<Path>>(path: P) -> NnResult<Tensor> {
    let raw_file = fs::read_to_string(path)?;
    let raw: RawInputs = serde_json::from_str(&raw_file)?;
    tensor_from_rows(raw.inputs)
}

/// Stacks rows of equal length into a tensor.
pub fn tensor_from_rows(rows: Vec<Vec<Precision>>) -> NnResult<Tensor> {
    let cols = match rows.first() {
        Some(row) if !row.is_empty() => row.len(),
        _ => return Err(NnError::EmptyBatchError),
    };
    if let Some(row) = rows.iter().find(|row| row.len() != cols) {
        return Err(NnError::ShapeMismatchError {
            layer: "dataset",
            expected: cols,
            found: row.len(),
        });
    }
    let num_rows = rows.len();
    let flat: Vec<Precision> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((num_rows, cols), flat)?)
}

pub fn tensor_to_rows(tensor: &Tensor) -> Vec<Vec<Precision>> {
    tensor.outer_iter().map(|row| row.to_vec()).collect()
}

/// One row per label with a single 1 in the column of the label.
pub fn one_hot(labels: &[usize], classes: usize) -> NnResult<Tensor> {
    let mut encoded = Array2::zeros((labels.len(), classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(NnError::LabelError { label, classes });
        }
        encoded[[i, label]] = 1.;
    }
    Ok(encoded)
}
