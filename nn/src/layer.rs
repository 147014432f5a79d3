//! The contract every layer implements and the closed set of layer kinds
//! a network can be built from.
use crate::{
    activation_functions::{ReluLayer, TanhLayer},
    convolutions::ConvolutionLayer,
    errors::{NnError, NnResult},
    fully_connected::DenseLayer,
    pooling::MaxPoolLayer,
    Precision, Tensor, TensorView,
};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// A layer of a network trained by backpropagation.
///
/// `forward` stores whatever the following `backward` call needs in the layer itself,
/// so every `forward` has to be answered by exactly one `backward` before the next
/// `forward`. `infer` evaluates the layer without touching that state.
pub trait Layer {
    /// Feeds a batch forward and remembers the context for [`Layer::backward`].
    fn forward(&mut self, input: TensorView) -> NnResult<Tensor>;

    /// Consumes the context of the last forward call, updates the parameters with
    /// plain SGD and returns the gradient with respect to the layer input.
    fn backward(&mut self, upstream_gradient: TensorView, learning_rate: Precision)
        -> NnResult<Tensor>;

    /// Feeds a batch forward without remembering anything.
    fn infer(&self, input: TensorView) -> NnResult<Tensor>;

    /// Drops a pending forward context. Returns whether there was one.
    fn discard_pending(&mut self) -> bool;
}

/// State a layer keeps between a forward call and the matching backward call.
#[derive(Debug, Clone)]
pub enum ForwardContext<C> {
    Idle,
    AwaitingBackward(C),
}

impl<C> Default for ForwardContext<C> {
    fn default() -> Self {
        ForwardContext::Idle
    }
}

impl<C> ForwardContext<C> {
    /// Fails if the previous context has not been consumed by a backward call yet.
    pub fn store(&mut self, layer: &'static str, context: C) -> NnResult<()> {
        if self.is_pending() {
            return Err(NnError::PendingBackwardError(layer));
        }
        *self = ForwardContext::AwaitingBackward(context);
        Ok(())
    }

    pub fn take(&mut self, layer: &'static str) -> NnResult<C> {
        match std::mem::take(self) {
            ForwardContext::AwaitingBackward(context) => Ok(context),
            ForwardContext::Idle => Err(NnError::MissingForwardContextError(layer)),
        }
    }

    pub fn ensure_idle(&self, layer: &'static str) -> NnResult<()> {
        if self.is_pending() {
            Err(NnError::PendingBackwardError(layer))
        } else {
            Ok(())
        }
    }

    pub fn discard(&mut self) -> bool {
        let was_pending = self.is_pending();
        *self = ForwardContext::Idle;
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ForwardContext::AwaitingBackward(_))
    }
}

/// Checks that a batch is non-empty and has the expected number of features.
pub(crate) fn check_batch(layer: &'static str, expected: usize, batch: &TensorView) -> NnResult<()> {
    if batch.nrows() == 0 {
        return Err(NnError::EmptyBatchError);
    }
    if batch.ncols() != expected {
        return Err(NnError::ShapeMismatchError {
            layer,
            expected,
            found: batch.ncols(),
        });
    }
    Ok(())
}

/// All layers a network can hold. Serialized with its parameters, never with its
/// forward context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LayerKind {
    Dense(DenseLayer),
    Convolution(ConvolutionLayer),
    MaxPool(MaxPoolLayer),
    Relu(ReluLayer),
    Tanh(TanhLayer),
}

macro_rules! dispatch {
    ($self:expr, $layer:ident => $body:expr) => {
        match $self {
            LayerKind::Dense($layer) => $body,
            LayerKind::Convolution($layer) => $body,
            LayerKind::MaxPool($layer) => $body,
            LayerKind::Relu($layer) => $body,
            LayerKind::Tanh($layer) => $body,
        }
    };
}

impl Layer for LayerKind {
    fn forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        dispatch!(self, layer => layer.forward(input))
    }

    fn backward(
        &mut self,
        upstream_gradient: TensorView,
        learning_rate: Precision,
    ) -> NnResult<Tensor> {
        dispatch!(self, layer => layer.backward(upstream_gradient, learning_rate))
    }

    fn infer(&self, input: TensorView) -> NnResult<Tensor> {
        dispatch!(self, layer => layer.infer(input))
    }

    fn discard_pending(&mut self) -> bool {
        dispatch!(self, layer => layer.discard_pending())
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, layer => fmt::Display::fmt(layer, f))
    }
}

impl From<DenseLayer> for LayerKind {
    fn from(layer: DenseLayer) -> Self {
        LayerKind::Dense(layer)
    }
}

impl From<ConvolutionLayer> for LayerKind {
    fn from(layer: ConvolutionLayer) -> Self {
        LayerKind::Convolution(layer)
    }
}

impl From<MaxPoolLayer> for LayerKind {
    fn from(layer: MaxPoolLayer) -> Self {
        LayerKind::MaxPool(layer)
    }
}

impl From<ReluLayer> for LayerKind {
    fn from(layer: ReluLayer) -> Self {
        LayerKind::Relu(layer)
    }
}

impl From<TanhLayer> for LayerKind {
    fn from(layer: TanhLayer) -> Self {
        LayerKind::Tanh(layer)
    }
}
