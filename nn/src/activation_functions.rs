//! This module provides the activation functions for our neural networks,
//! namely Relu and Tanh.
//!
//! All activation functions are exposed as a layer as well as a free function
use ndarray::{Array, ArrayBase, Data, Dimension, Zip};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::{
    errors::{NnError, NnResult},
    layer::{ForwardContext, Layer},
    Precision, Tensor, TensorView,
};

/// Relu implementation
pub fn relu<S, D>(data: &ArrayBase<S, D>) -> Array<Precision, D>
where
    S: Data<Elem = Precision>,
    D: Dimension,
{
    data.mapv(|x| if x > 0. { x } else { 0. })
}

/// Tanh implementation
pub fn tanh<S, D>(data: &ArrayBase<S, D>) -> Array<Precision, D>
where
    S: Data<Elem = Precision>,
    D: Dimension,
{
    data.mapv(Precision::tanh)
}

fn check_not_empty(input: &TensorView) -> NnResult<()> {
    if input.nrows() == 0 {
        Err(NnError::EmptyBatchError)
    } else {
        Ok(())
    }
}

fn check_gradient(layer: &'static str, cached: &Tensor, gradient: &TensorView) -> NnResult<()> {
    if cached.dim() != gradient.dim() {
        return Err(NnError::ShapeMismatchError {
            layer,
            expected: cached.len(),
            found: gradient.len(),
        });
    }
    Ok(())
}

/// Relu as a layer. Remembers its input to mask the gradient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReluLayer {
    #[serde(skip)]
    context: ForwardContext<Tensor>,
}

impl ReluLayer {
    const NAME: &'static str = "ReluLayer";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for ReluLayer {
    fn forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        self.context.ensure_idle(Self::NAME)?;
        let output = self.infer(input)?;
        self.context.store(Self::NAME, input.to_owned())?;
        Ok(output)
    }

    /// Passes the gradient where the input was strictly positive.
    fn backward(&mut self, upstream_gradient: TensorView, _: Precision) -> NnResult<Tensor> {
        let input = self.context.take(Self::NAME)?;
        check_gradient(Self::NAME, &input, &upstream_gradient)?;

        Ok(Zip::from(&upstream_gradient)
            .and(&input)
            .map_collect(|&g, &x| if x > 0. { g } else { 0. }))
    }

    fn infer(&self, input: TensorView) -> NnResult<Tensor> {
        check_not_empty(&input)?;
        Ok(relu(&input))
    }

    fn discard_pending(&mut self) -> bool {
        self.context.discard()
    }
}

impl fmt::Display for ReluLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Activation: ReLU")
    }
}

/// Tanh as a layer. Remembers its output, since the derivative is `1 - tanh(x)^2`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TanhLayer {
    #[serde(skip)]
    context: ForwardContext<Tensor>,
}

impl TanhLayer {
    const NAME: &'static str = "TanhLayer";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for TanhLayer {
    fn forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        self.context.ensure_idle(Self::NAME)?;
        let output = self.infer(input)?;
        self.context.store(Self::NAME, output.clone())?;
        Ok(output)
    }

    fn backward(&mut self, upstream_gradient: TensorView, _: Precision) -> NnResult<Tensor> {
        let output = self.context.take(Self::NAME)?;
        check_gradient(Self::NAME, &output, &upstream_gradient)?;

        Ok(Zip::from(&upstream_gradient)
            .and(&output)
            .map_collect(|&g, &y| g * (1. - y * y)))
    }

    fn infer(&self, input: TensorView) -> NnResult<Tensor> {
        check_not_empty(&input)?;
        Ok(tanh(&input))
    }

    fn discard_pending(&mut self) -> bool {
        self.context.discard()
    }
}

impl fmt::Display for TanhLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Activation: Tanh")
    }
}
