use crate::Precision;
use ndarray::ShapeError;
use thiserror::Error;

pub type NnResult<T> = Result<T, NnError>;

#[derive(Error, Debug)]
pub enum NnError {
    #[error("Received an empty batch, at least one sample row is required.")]
    EmptyBatchError,
    #[error("{layer} expected {expected} features per row but received {found}.")]
    ShapeMismatchError {
        layer: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Inputs have {inputs} samples but targets have {targets}.")]
    SampleCountError { inputs: usize, targets: usize },
    #[error("Invalid layer geometry: {0}")]
    GeometryError(String),
    #[error("{0} received a backward call without a preceding forward call.")]
    MissingForwardContextError(&'static str),
    #[error("{0} received a forward call while the previous forward is still awaiting its backward call.")]
    PendingBackwardError(&'static str),
    #[error("Label {label} is out of range for {classes} classes.")]
    LabelError { label: usize, classes: usize },
    #[error("Invalid training configuration: {0}")]
    ConfigError(String),
    #[error("Batch loss was {0}, the batch was not applied.")]
    NonFiniteBatchLossError(Precision),
    #[error("Loss became non-finite in epoch {epoch}, batch {batch}.")]
    NonFiniteLossError { epoch: usize, batch: usize },
    #[error("Could not reshape tensor:\n {0}.")]
    ReshapeError(#[from] ShapeError),
    #[error("File could not be accessed. Filesystem reported error\n {0}.")]
    IoError(#[from] std::io::Error),
    #[error("Model could not be encoded or decoded:\n {0}.")]
    EncodingError(#[from] bincode::Error),
    #[error("JSON document didn't have the expected format:\n {0}.")]
    JsonError(#[from] serde_json::Error),
}
