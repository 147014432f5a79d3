use crate::{
    errors::{NnError, NnResult},
    init,
    layer::{check_batch, ForwardContext, Layer},
    Precision, Tensor, TensorView,
};
use ndarray::{Array1, Axis};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

/// How the bias gradient of a [`DenseLayer`] is scaled.
///
/// The learning rate handed to a dense layer has already been divided by the batch
/// size. `Legacy` additionally averages the bias gradient over the batch rows, so
/// biases are normalized twice. Existing trained models rely on that, hence it is
/// the default. `Single` sums the bias gradient over the
/// rows and normalizes exactly once, like the weight update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiasNormalization {
    Legacy,
    Single,
}

impl Default for BiasNormalization {
    fn default() -> Self {
        BiasNormalization::Legacy
    }
}

/// Rust implementation of a fully connected layer.
/// The weight matrix has dimension input units x output units, so a batch
/// is propagated as `input.dot(&weights) + biases`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawDenseLayer")]
pub struct DenseLayer {
    weights: Tensor,
    biases: Array1<Precision>,
    bias_normalization: BiasNormalization,
    #[serde(skip)]
    context: ForwardContext<Tensor>,
}

#[derive(Deserialize)]
struct RawDenseLayer {
    weights: Tensor,
    biases: Array1<Precision>,
    #[serde(default)]
    bias_normalization: BiasNormalization,
}

impl TryFrom<RawDenseLayer> for DenseLayer {
    type Error = NnError;

    fn try_from(raw: RawDenseLayer) -> NnResult<Self> {
        Ok(DenseLayer::from_parameters(raw.weights, raw.biases)?
            .with_bias_normalization(raw.bias_normalization))
    }
}

impl DenseLayer {
    const NAME: &'static str = "DenseLayer";

    /// Randomly initialized layer with zero biases.
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self::from_rng(inputs, outputs, &mut init::entropy_rng())
    }

    pub fn from_rng<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        DenseLayer {
            weights: init::scaled_normal(inputs, outputs, rng),
            biases: Array1::zeros(outputs),
            bias_normalization: BiasNormalization::default(),
            context: ForwardContext::Idle,
        }
    }

    /// Builds a layer from trained parameters. `biases` needs one entry per output unit.
    pub fn from_parameters(weights: Tensor, biases: Array1<Precision>) -> NnResult<Self> {
        if weights.ncols() != biases.len() {
            return Err(NnError::ShapeMismatchError {
                layer: Self::NAME,
                expected: weights.ncols(),
                found: biases.len(),
            });
        }
        Ok(DenseLayer {
            weights,
            biases,
            bias_normalization: BiasNormalization::default(),
            context: ForwardContext::Idle,
        })
    }

    pub fn with_bias_normalization(mut self, bias_normalization: BiasNormalization) -> Self {
        self.bias_normalization = bias_normalization;
        self
    }

    pub fn input_len(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_len(&self) -> usize {
        self.weights.ncols()
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn biases(&self) -> &Array1<Precision> {
        &self.biases
    }

    pub fn bias_normalization(&self) -> BiasNormalization {
        self.bias_normalization
    }
}

impl Layer for DenseLayer {
    fn forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        self.context.ensure_idle(Self::NAME)?;
        let output = self.infer(input)?;
        // owned copy, the caller may reuse its buffer before backward runs
        self.context.store(Self::NAME, input.to_owned())?;
        Ok(output)
    }

    /// `learning_rate` is expected to be normalized by the batch size already.
    fn backward(
        &mut self,
        upstream_gradient: TensorView,
        learning_rate: Precision,
    ) -> NnResult<Tensor> {
        let input = self.context.take(Self::NAME)?;
        check_batch(Self::NAME, self.output_len(), &upstream_gradient)?;
        if upstream_gradient.nrows() != input.nrows() {
            return Err(NnError::SampleCountError {
                inputs: input.nrows(),
                targets: upstream_gradient.nrows(),
            });
        }

        let weight_gradient = input.t().dot(&upstream_gradient);
        // computed before the update
        let downstream_gradient = upstream_gradient.dot(&self.weights.t());
        self.weights.scaled_add(-learning_rate, &weight_gradient);

        let bias_gradient = upstream_gradient.sum_axis(Axis(0));
        let bias_scale = match self.bias_normalization {
            BiasNormalization::Legacy => learning_rate / upstream_gradient.nrows() as Precision,
            BiasNormalization::Single => learning_rate,
        };
        self.biases.scaled_add(-bias_scale, &bias_gradient);

        Ok(downstream_gradient)
    }

    fn infer(&self, input: TensorView) -> NnResult<Tensor> {
        check_batch(Self::NAME, self.input_len(), &input)?;
        Ok(input.dot(&self.weights) + &self.biases)
    }

    fn discard_pending(&mut self) -> bool {
        self.context.discard()
    }
}

impl fmt::Display for DenseLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Layer [{} -> {}]:", self.input_len(), self.output_len())?;
        writeln!(f, "  Weights:\n{:.4}", self.weights)?;
        write!(f, "  Biases:\n{:.4}", self.biases)
    }
}
