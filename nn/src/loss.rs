//! Loss functions turning raw network output into a scalar loss and the gradient
//! the backward pass starts from.
use crate::{
    errors::{NnError, NnResult},
    Precision, Tensor, TensorView,
};
use ndarray::{Axis, Zip};
use serde_derive::{Deserialize, Serialize};

/// Added inside the logarithm of the cross entropy, so that `ln(0)` never happens.
pub const LOG_EPSILON: Precision = 1e-15;

pub trait Loss {
    /// Mean loss of a batch.
    fn calculate(&self, output: TensorView, target: TensorView) -> NnResult<Precision>;

    /// Gradient of the loss with respect to `output`, same shape as `output`.
    fn derivative(&self, output: TensorView, target: TensorView) -> NnResult<Tensor>;

    /// Maps raw output into the domain of the loss, e.g. logits into probabilities.
    fn transform(&self, output: TensorView) -> Tensor;
}

fn check_pair(output: &TensorView, target: &TensorView) -> NnResult<()> {
    if output.nrows() == 0 || output.ncols() == 0 {
        return Err(NnError::EmptyBatchError);
    }
    if output.nrows() != target.nrows() {
        return Err(NnError::SampleCountError {
            inputs: output.nrows(),
            targets: target.nrows(),
        });
    }
    if output.ncols() != target.ncols() {
        return Err(NnError::ShapeMismatchError {
            layer: "loss",
            expected: output.ncols(),
            found: target.ncols(),
        });
    }
    Ok(())
}

/// Squared error averaged over all entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn calculate(&self, output: TensorView, target: TensorView) -> NnResult<Precision> {
        check_pair(&output, &target)?;
        let squared_sum = Zip::from(&output)
            .and(&target)
            .fold(0., |acc, &o, &t| acc + (o - t) * (o - t));
        Ok(squared_sum / output.len() as Precision)
    }

    /// `output - target`, the constant factor 2 is left to the learning rate.
    fn derivative(&self, output: TensorView, target: TensorView) -> NnResult<Tensor> {
        check_pair(&output, &target)?;
        Ok(&output - &target)
    }

    fn transform(&self, output: TensorView) -> Tensor {
        output.to_owned()
    }
}

/// Softmax followed by cross entropy. Targets are expected to be one-hot rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftmaxCrossEntropy;

impl Loss for SoftmaxCrossEntropy {
    /// Only the entries with a positive target contribute, averaged over the rows.
    fn calculate(&self, output: TensorView, target: TensorView) -> NnResult<Precision> {
        check_pair(&output, &target)?;
        let probabilities = self.transform(output);
        let total = Zip::from(&probabilities)
            .and(&target)
            .fold(0., |acc, &p, &t| {
                if t > 0. {
                    acc - (p + LOG_EPSILON).ln()
                } else {
                    acc
                }
            });
        Ok(total / output.nrows() as Precision)
    }

    fn derivative(&self, output: TensorView, target: TensorView) -> NnResult<Tensor> {
        check_pair(&output, &target)?;
        Ok(self.transform(output) - &target)
    }

    /// Row-wise softmax, the row maximum is subtracted before exponentiating.
    fn transform(&self, output: TensorView) -> Tensor {
        let mut probabilities = output.to_owned();
        for mut row in probabilities.axis_iter_mut(Axis(0)) {
            let max = row.fold(Precision::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }
        probabilities
    }
}

/// The losses a network can be trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    MeanSquaredError(MeanSquaredError),
    SoftmaxCrossEntropy(SoftmaxCrossEntropy),
}

impl LossKind {
    pub fn mean_squared_error() -> Self {
        LossKind::MeanSquaredError(MeanSquaredError)
    }

    pub fn softmax_cross_entropy() -> Self {
        LossKind::SoftmaxCrossEntropy(SoftmaxCrossEntropy)
    }
}

impl Loss for LossKind {
    fn calculate(&self, output: TensorView, target: TensorView) -> NnResult<Precision> {
        match self {
            LossKind::MeanSquaredError(loss) => loss.calculate(output, target),
            LossKind::SoftmaxCrossEntropy(loss) => loss.calculate(output, target),
        }
    }

    fn derivative(&self, output: TensorView, target: TensorView) -> NnResult<Tensor> {
        match self {
            LossKind::MeanSquaredError(loss) => loss.derivative(output, target),
            LossKind::SoftmaxCrossEntropy(loss) => loss.derivative(output, target),
        }
    }

    fn transform(&self, output: TensorView) -> Tensor {
        match self {
            LossKind::MeanSquaredError(loss) => loss.transform(output),
            LossKind::SoftmaxCrossEntropy(loss) => loss.transform(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mean_squared_error() {
        let loss = MeanSquaredError;
        let output = array![[1., 2.], [3., 4.]];
        let target = array![[1., 0.], [0., 4.]];

        assert_eq!(loss.calculate(output.view(), target.view()).unwrap(), 13. / 4.);
        assert_eq!(
            loss.derivative(output.view(), target.view()).unwrap(),
            array![[0., 2.], [3., 0.]]
        );
        assert_eq!(loss.transform(output.view()), output);
    }

    #[test]
    fn test_softmax_is_stable() {
        let loss = SoftmaxCrossEntropy;
        let output = array![[1000., 1000.], [0., 0.]];
        let probabilities = loss.transform(output.view());

        assert_eq!(probabilities, array![[0.5, 0.5], [0.5, 0.5]]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let loss = SoftmaxCrossEntropy;
        let output = array![[1., 2., 3.], [-5., 0., 5.]];
        for row in loss.transform(output.view()).outer_iter() {
            assert!((row.sum() - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cross_entropy() {
        let loss = SoftmaxCrossEntropy;
        let output = array![[0., 0.], [2., 0.]];
        let target = array![[1., 0.], [0., 1.]];

        let p = 1. / (1. + 2f64.exp());
        let expected = (-(0.5 + LOG_EPSILON).ln() - (p + LOG_EPSILON).ln()) / 2.;
        let actual = loss.calculate(output.view(), target.view()).unwrap();
        assert!((actual - expected).abs() < 1e-12);

        let gradient = loss.derivative(output.view(), target.view()).unwrap();
        assert!((gradient[[0, 0]] + 0.5).abs() < 1e-12);
        assert!((gradient[[1, 1]] - (p - 1.)).abs() < 1e-12);
    }

    #[test]
    fn test_cross_entropy_never_infinite() {
        let loss = SoftmaxCrossEntropy;
        let output = array![[0., 1000.]];
        let target = array![[1., 0.]];
        assert!(loss.calculate(output.view(), target.view()).unwrap().is_finite());
    }

    #[test]
    fn test_mismatched_inputs() {
        let loss = LossKind::mean_squared_error();
        let output = array![[1., 2.]];
        assert!(matches!(
            loss.calculate(output.view(), array![[1., 2., 3.]].view()),
            Err(NnError::ShapeMismatchError { .. })
        ));
        assert!(matches!(
            loss.derivative(output.view(), array![[1., 2.], [3., 4.]].view()),
            Err(NnError::SampleCountError { inputs: 1, targets: 2 })
        ));
        let empty = Tensor::zeros((0, 2));
        assert!(matches!(
            loss.calculate(empty.view(), empty.view()),
            Err(NnError::EmptyBatchError)
        ));
    }
}
