use crate::{
    errors::{NnError, NnResult},
    layer::{check_batch, ForwardContext, Layer},
    Precision, Tensor, TensorView,
};
use ndarray::{Array2, ArrayView1};
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

/// Max pooling over `size x size` windows placed every `stride` pixels.
///
/// Input and output rows use the same channel-major layout as the convolution layer.
/// The forward pass remembers for every output value the flat index of the input
/// value it came from, the backward pass routes the gradient back to exactly that value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawMaxPoolLayer")]
pub struct MaxPoolLayer {
    size: usize,
    stride: usize,
    channels: usize,
    rows: usize,
    cols: usize,
    /// Source index per output value of every sample of the last forward call
    #[serde(skip)]
    context: ForwardContext<Vec<usize>>,
}

#[derive(Deserialize)]
struct RawMaxPoolLayer {
    size: usize,
    stride: usize,
    channels: usize,
    rows: usize,
    cols: usize,
}

impl TryFrom<RawMaxPoolLayer> for MaxPoolLayer {
    type Error = NnError;

    fn try_from(raw: RawMaxPoolLayer) -> NnResult<Self> {
        MaxPoolLayer::new(raw.size, raw.stride, raw.channels, raw.rows, raw.cols)
    }
}

impl MaxPoolLayer {
    const NAME: &'static str = "MaxPoolLayer";

    pub fn new(
        size: usize,
        stride: usize,
        channels: usize,
        rows: usize,
        cols: usize,
    ) -> NnResult<MaxPoolLayer> {
        if size == 0 || stride == 0 {
            return Err(NnError::GeometryError(format!(
                "pooling size {} and stride {} have to be positive",
                size, stride
            )));
        }
        if channels == 0 || size > rows || size > cols {
            return Err(NnError::GeometryError(format!(
                "pooling window of size {} does not fit into {} channels of {}x{} pixels",
                size, channels, rows, cols
            )));
        }
        Ok(MaxPoolLayer {
            size,
            stride,
            channels,
            rows,
            cols,
            context: ForwardContext::Idle,
        })
    }

    pub fn out_rows(&self) -> usize {
        (self.rows - self.size) / self.stride + 1
    }

    pub fn out_cols(&self) -> usize {
        (self.cols - self.size) / self.stride + 1
    }

    pub fn input_len(&self) -> usize {
        self.channels * self.rows * self.cols
    }

    pub fn output_len(&self) -> usize {
        self.channels * self.out_rows() * self.out_cols()
    }

    /// Returns the pooled values and their source indices.
    fn pool(&self, input: &TensorView) -> (Tensor, Vec<usize>) {
        let batch_size = input.nrows();
        let (out_rows, out_cols) = (self.out_rows(), self.out_cols());
        let mut output = Array2::zeros((batch_size, self.output_len()));
        let mut sources = Vec::with_capacity(batch_size * self.output_len());

        for (sample, mut pooled) in input.outer_iter().zip(output.outer_iter_mut()) {
            for c in 0..self.channels {
                let channel_offset = c * self.rows * self.cols;
                for i in 0..out_rows {
                    for j in 0..out_cols {
                        let top_left = channel_offset + i * self.stride * self.cols + j * self.stride;
                        let (index, value) = self.window_max(&sample, top_left);
                        pooled[c * out_rows * out_cols + i * out_cols + j] = value;
                        sources.push(index);
                    }
                }
            }
        }
        (output, sources)
    }

    /// Strict comparison, so on ties the first value in row-major order wins.
    fn window_max(&self, sample: &ArrayView1<Precision>, top_left: usize) -> (usize, Precision) {
        let mut best = (top_left, sample[top_left]);
        for ky in 0..self.size {
            for kx in 0..self.size {
                let index = top_left + ky * self.cols + kx;
                if sample[index] > best.1 {
                    best = (index, sample[index]);
                }
            }
        }
        best
    }
}

impl Layer for MaxPoolLayer {
    fn forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        self.context.ensure_idle(Self::NAME)?;
        check_batch(Self::NAME, self.input_len(), &input)?;
        let (output, sources) = self.pool(&input);
        self.context.store(Self::NAME, sources)?;
        Ok(output)
    }

    /// Pooling has no parameters, the learning rate is ignored.
    fn backward(&mut self, upstream_gradient: TensorView, _: Precision) -> NnResult<Tensor> {
        let sources = self.context.take(Self::NAME)?;
        check_batch(Self::NAME, self.output_len(), &upstream_gradient)?;
        let batch_size = upstream_gradient.nrows();
        if sources.len() != batch_size * self.output_len() {
            return Err(NnError::SampleCountError {
                inputs: sources.len() / self.output_len(),
                targets: batch_size,
            });
        }

        let mut input_gradient = Array2::zeros((batch_size, self.input_len()));
        for ((gradient, mut routed), sources) in upstream_gradient
            .outer_iter()
            .zip(input_gradient.outer_iter_mut())
            .zip(sources.chunks(self.output_len()))
        {
            // overlapping windows may share a source
            for (&g, &source) in gradient.iter().zip(sources) {
                routed[source] += g;
            }
        }
        Ok(input_gradient)
    }

    fn infer(&self, input: TensorView) -> NnResult<Tensor> {
        check_batch(Self::NAME, self.input_len(), &input)?;
        Ok(self.pool(&input).0)
    }

    fn discard_pending(&mut self) -> bool {
        self.context.discard()
    }
}

impl fmt::Display for MaxPoolLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MaxPool [{}x{}x{} -> {}x{}x{}]: size {}, stride {}",
            self.channels,
            self.rows,
            self.cols,
            self.channels,
            self.out_rows(),
            self.out_cols(),
            self.size,
            self.stride
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_tie_goes_to_top_left() {
        let mut pool = MaxPoolLayer::new(2, 2, 1, 2, 2).unwrap();
        let input = array![[5., 5., 1., 1.]];

        assert_eq!(pool.forward(input.view()).unwrap(), array![[5.]]);
        assert_eq!(
            pool.backward(array![[1.]].view(), 0.1).unwrap(),
            array![[1., 0., 0., 0.]]
        );
    }

    #[test]
    fn test_pooling_per_channel() {
        // 2 channels of 4x4, 2x2 windows with stride 2
        let mut pool = MaxPoolLayer::new(2, 2, 2, 4, 4).unwrap();
        let mut values: Vec<f64> = (0..16).map(|x| x as f64).collect();
        values.extend((0..16).map(|x| -(x as f64)));
        let input = Array2::from_shape_vec((1, 32), values).unwrap();

        let output = pool.forward(input.view()).unwrap();
        assert_eq!(output, array![[5., 7., 13., 15., 0., -2., -8., -10.]]);

        let gradient = array![[1., 2., 3., 4., 5., 6., 7., 8.]];
        let routed = pool.backward(gradient.view(), 0.0).unwrap();
        let mut expected = Array2::zeros((1, 32));
        for (&index, &g) in [5, 7, 13, 15, 16, 18, 24, 26].iter().zip(gradient.iter()) {
            expected[[0, index]] = g;
        }
        assert_eq!(routed, expected);
    }

    #[test]
    fn test_overlapping_windows_accumulate() {
        let mut pool = MaxPoolLayer::new(2, 1, 1, 2, 3).unwrap();
        let input = array![[0., 9., 0., 0., 0., 0.]];

        assert_eq!(pool.forward(input.view()).unwrap(), array![[9., 9.]]);
        assert_eq!(
            pool.backward(array![[1., 2.]].view(), 0.0).unwrap(),
            array![[0., 3., 0., 0., 0., 0.]]
        );
    }

    #[test]
    fn test_negative_inputs() {
        let pool = MaxPoolLayer::new(2, 2, 1, 2, 2).unwrap();
        let input = array![[-1e300, -2e300, -3e300, -4e300]];
        assert_eq!(pool.infer(input.view()).unwrap(), array![[-1e300]]);
    }

    #[test]
    fn test_output_size() {
        let pool = MaxPoolLayer::new(3, 2, 4, 7, 8).unwrap();
        assert_eq!((pool.out_rows(), pool.out_cols()), (3, 3));
        assert_eq!(pool.output_len(), 36);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(
            MaxPoolLayer::new(3, 1, 1, 2, 2),
            Err(NnError::GeometryError(_))
        ));
        assert!(matches!(
            MaxPoolLayer::new(2, 0, 1, 2, 2),
            Err(NnError::GeometryError(_))
        ));
    }

    #[test]
    fn test_decoding_validates_layer() {
        let pool = MaxPoolLayer::new(2, 2, 1, 4, 4).unwrap();
        let json = serde_json::to_string(&pool).unwrap();
        let decoded: MaxPoolLayer = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.output_len(), pool.output_len());

        let zero_stride = serde_json::from_str::<MaxPoolLayer>(
            "{\"size\": 1, \"stride\": 0, \"channels\": 1, \"rows\": 2, \"cols\": 2}",
        );
        assert!(zero_stride.unwrap_err().to_string().contains("stride 0"));

        let too_large = serde_json::from_str::<MaxPoolLayer>(
            "{\"size\": 3, \"stride\": 1, \"channels\": 1, \"rows\": 2, \"cols\": 2}",
        );
        assert!(too_large.is_err());
    }
}
