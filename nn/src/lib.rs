//! A small neural network training library.
//!
//! Networks are built from layers that each know how to run forward and how to
//! push a gradient backwards while updating their own parameters with plain SGD.
//! Convolutions are computed by rewriting every sliding window as a column
//! of a matrix (im2col) so that a whole batch is a single matrix product.
pub mod activation_functions;
pub mod config;
pub mod convolutions;
pub mod dataset;
pub mod errors;
pub mod fully_connected;
pub mod im2col;
pub mod init;
pub mod layer;
pub mod loss;
pub mod models;
pub mod pooling;
pub mod serialization;

use ndarray::{Array2, ArrayView2};

pub type Precision = f64;

/// Sample-major 2-D tensor, one row per batch element.
pub type Tensor = Array2<Precision>;
pub type TensorView<'a> = ArrayView2<'a, Precision>;

pub use config::TrainingConfig;
pub use errors::{NnError, NnResult};
pub use layer::{Layer, LayerKind};
pub use loss::{Loss, LossKind};
pub use models::{ConvolutionalNetwork, FeedForwardNetwork, Model, TrainingHistory};
pub use serialization::Persist;
