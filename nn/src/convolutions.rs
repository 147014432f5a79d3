use crate::{
    errors::{NnError, NnResult},
    im2col::WindowGeometry,
    init,
    layer::{check_batch, ForwardContext, Layer},
    Precision, Tensor, TensorView,
};
use ndarray::{Array1, Axis};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

/// Rust implementation of a convolutional layer (stride 1, no padding).
///
/// The kernel matrix has dimension number of kernels x (input channels * kernel height
/// * kernel width), every row flattened channel first, then row by row, in the same
/// order [`WindowGeometry::to_windows`] lays out a window. The convolution of a whole
/// batch is then one matrix product of the kernels with the window matrix.
///
/// Input rows hold `channels x rows x cols` features, output rows hold
/// `kernels x out_rows x out_cols` features, one feature map per kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawConvolutionLayer")]
pub struct ConvolutionLayer {
    /// Weight matrix of the kernels
    kernels: Tensor,
    /// One bias per kernel
    biases: Array1<Precision>,
    geometry: WindowGeometry,
    /// Window matrix of the last forward call
    #[serde(skip)]
    context: ForwardContext<Tensor>,
}

#[derive(Deserialize)]
struct RawConvolutionLayer {
    kernels: Tensor,
    biases: Array1<Precision>,
    geometry: WindowGeometry,
}

impl TryFrom<RawConvolutionLayer> for ConvolutionLayer {
    type Error = NnError;

    fn try_from(raw: RawConvolutionLayer) -> NnResult<Self> {
        ConvolutionLayer::from_parameters(raw.kernels, raw.biases, raw.geometry)
    }
}

impl ConvolutionLayer {
    const NAME: &'static str = "ConvolutionLayer";

    /// Randomly initialized layer with zero biases.
    pub fn new(
        kernel_size: usize,
        num_kernels: usize,
        channels: usize,
        rows: usize,
        cols: usize,
    ) -> NnResult<ConvolutionLayer> {
        Self::from_rng(
            kernel_size,
            num_kernels,
            channels,
            rows,
            cols,
            &mut init::entropy_rng(),
        )
    }

    pub fn from_rng<R: Rng + ?Sized>(
        kernel_size: usize,
        num_kernels: usize,
        channels: usize,
        rows: usize,
        cols: usize,
        rng: &mut R,
    ) -> NnResult<ConvolutionLayer> {
        if num_kernels == 0 {
            return Err(NnError::GeometryError(
                "a convolution needs at least one kernel".to_string(),
            ));
        }
        let geometry = WindowGeometry::new(channels, rows, cols, kernel_size)?;
        log::debug!(
            "Creating convolution with {} {}x{} kernels over {}x{}x{} inputs",
            num_kernels,
            kernel_size,
            kernel_size,
            channels,
            rows,
            cols
        );

        Ok(ConvolutionLayer {
            kernels: init::scaled_normal(num_kernels, geometry.window_len(), rng),
            biases: Array1::zeros(num_kernels),
            geometry,
            context: ForwardContext::Idle,
        })
    }

    /// Builds a layer from trained parameters.
    /// `kernels` needs shape (number of kernels, channels * kernel_size^2).
    pub fn from_parameters(
        kernels: Tensor,
        biases: Array1<Precision>,
        geometry: WindowGeometry,
    ) -> NnResult<ConvolutionLayer> {
        if kernels.ncols() != geometry.window_len() {
            return Err(NnError::ShapeMismatchError {
                layer: Self::NAME,
                expected: geometry.window_len(),
                found: kernels.ncols(),
            });
        }
        if kernels.nrows() != biases.len() || biases.is_empty() {
            return Err(NnError::GeometryError(format!(
                "{} kernels but {} biases",
                kernels.nrows(),
                biases.len()
            )));
        }
        Ok(ConvolutionLayer {
            kernels,
            biases,
            geometry,
            context: ForwardContext::Idle,
        })
    }

    pub fn num_kernels(&self) -> usize {
        self.kernels.nrows()
    }

    pub fn geometry(&self) -> &WindowGeometry {
        &self.geometry
    }

    pub fn kernels(&self) -> &Tensor {
        &self.kernels
    }

    pub fn biases(&self) -> &Array1<Precision> {
        &self.biases
    }

    /// Number of features of one output row.
    pub fn output_len(&self) -> usize {
        self.num_kernels() * self.geometry.windows_per_image()
    }

    /// Convolves a window matrix and lays the result out sample-major.
    fn convolve(&self, windows: &Tensor, batch_size: usize) -> NnResult<Tensor> {
        let num_windows = self.geometry.windows_per_image();
        // shape (kernels, batch * windows)
        let mut raw = self.kernels.dot(windows);
        raw += &self.biases.view().insert_axis(Axis(1));

        let output = raw
            .into_shape((self.num_kernels(), batch_size, num_windows))?
            .permuted_axes([1, 0, 2]);
        Ok(output
            .as_standard_layout()
            .into_owned()
            .into_shape((batch_size, self.output_len()))?)
    }

    /// Inverse of the output layout of [`ConvolutionLayer::convolve`]: turns a
    /// `(batch, kernels * windows)` gradient into `(kernels, batch * windows)`.
    fn gradient_to_window_space(&self, gradient: TensorView) -> NnResult<Tensor> {
        let batch_size = gradient.nrows();
        let num_windows = self.geometry.windows_per_image();

        let per_kernel = gradient
            .as_standard_layout()
            .into_shape((batch_size, self.num_kernels(), num_windows))?
            .permuted_axes([1, 0, 2]);
        Ok(per_kernel
            .as_standard_layout()
            .into_owned()
            .into_shape((self.num_kernels(), batch_size * num_windows))?)
    }
}

impl Layer for ConvolutionLayer {
    fn forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        self.context.ensure_idle(Self::NAME)?;
        check_batch(Self::NAME, self.geometry.input_len(), &input)?;

        let windows = self.geometry.to_windows(input)?;
        let output = self.convolve(&windows, input.nrows())?;
        self.context.store(Self::NAME, windows)?;
        Ok(output)
    }

    /// Takes the raw learning rate, the update is normalized by the batch size here.
    fn backward(
        &mut self,
        upstream_gradient: TensorView,
        learning_rate: Precision,
    ) -> NnResult<Tensor> {
        let windows = self.context.take(Self::NAME)?;
        check_batch(Self::NAME, self.output_len(), &upstream_gradient)?;
        let batch_size = upstream_gradient.nrows();
        if windows.ncols() != batch_size * self.geometry.windows_per_image() {
            return Err(NnError::SampleCountError {
                inputs: windows.ncols() / self.geometry.windows_per_image(),
                targets: batch_size,
            });
        }
        let step = learning_rate / batch_size as Precision;

        let gradient = self.gradient_to_window_space(upstream_gradient)?;

        // summed over all samples and all window positions
        let bias_gradient = gradient.sum_axis(Axis(1));
        let kernel_gradient = gradient.dot(&windows.t());
        // computed with the kernels from before the update
        let window_gradient = self.kernels.t().dot(&gradient);

        self.biases.scaled_add(-step, &bias_gradient);
        self.kernels.scaled_add(-step, &kernel_gradient);

        self.geometry.from_windows(window_gradient.view(), batch_size)
    }

    fn infer(&self, input: TensorView) -> NnResult<Tensor> {
        check_batch(Self::NAME, self.geometry.input_len(), &input)?;
        let windows = self.geometry.to_windows(input)?;
        self.convolve(&windows, input.nrows())
    }

    fn discard_pending(&mut self) -> bool {
        self.context.discard()
    }
}

impl fmt::Display for ConvolutionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.geometry;
        write!(
            f,
            "Convolution [{}x{}x{} -> {}x{}x{}]: {} kernels of size {}x{}",
            g.channels(),
            g.rows(),
            g.cols(),
            self.num_kernels(),
            g.out_rows(),
            g.out_cols(),
            self.num_kernels(),
            g.kernel_size(),
            g.kernel_size()
        )
    }
}
