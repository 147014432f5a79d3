//! Image-to-column transform.
//!
//! A batch of multi-channel feature maps is stored sample-major: row `b` holds the
//! `channels x rows x cols` values of sample `b`, channel after channel, each
//! channel in row-major order. [`WindowGeometry::to_windows`] gathers every
//! stride-1 `kernel_size x kernel_size` window into one column of a matrix so a
//! convolution becomes `kernels.dot(&windows)`. [`WindowGeometry::from_windows`]
//! is its adjoint and scatters a gradient in window space back onto the pixels.
//!
//! More on the idea can be read here:
//! https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
use crate::{
    errors::{NnError, NnResult},
    Tensor, TensorView,
};
use ndarray::{s, Array4};
use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Shape of the feature maps a window transform runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWindowGeometry")]
pub struct WindowGeometry {
    channels: usize,
    rows: usize,
    cols: usize,
    kernel_size: usize,
}

#[derive(Deserialize)]
struct RawWindowGeometry {
    channels: usize,
    rows: usize,
    cols: usize,
    kernel_size: usize,
}

impl TryFrom<RawWindowGeometry> for WindowGeometry {
    type Error = NnError;

    fn try_from(raw: RawWindowGeometry) -> NnResult<Self> {
        WindowGeometry::new(raw.channels, raw.rows, raw.cols, raw.kernel_size)
    }
}

impl WindowGeometry {
    /// Fails if any dimension is zero or the kernel does not fit into the feature map.
    pub fn new(
        channels: usize,
        rows: usize,
        cols: usize,
        kernel_size: usize,
    ) -> NnResult<WindowGeometry> {
        if channels == 0 || rows == 0 || cols == 0 {
            return Err(NnError::GeometryError(format!(
                "feature maps of {} channels with {}x{} pixels are empty",
                channels, rows, cols
            )));
        }
        if kernel_size == 0 || kernel_size > rows || kernel_size > cols {
            return Err(NnError::GeometryError(format!(
                "kernel of size {} does not fit into a {}x{} feature map",
                kernel_size, rows, cols
            )));
        }
        Ok(WindowGeometry {
            channels,
            rows,
            cols,
            kernel_size,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn out_rows(&self) -> usize {
        self.rows - self.kernel_size + 1
    }

    pub fn out_cols(&self) -> usize {
        self.cols - self.kernel_size + 1
    }

    pub fn windows_per_image(&self) -> usize {
        self.out_rows() * self.out_cols()
    }

    /// Number of values in one window, i.e. the row count of the window matrix.
    pub fn window_len(&self) -> usize {
        self.channels * self.kernel_size * self.kernel_size
    }

    /// Number of features of one flattened input sample.
    pub fn input_len(&self) -> usize {
        self.channels * self.rows * self.cols
    }

    /// Returns the window matrix of shape `(window_len, batch * windows_per_image)`.
    ///
    /// Column `b * windows_per_image + i * out_cols + j` holds the window whose top left
    /// corner is pixel `(i, j)` of sample `b`. Within a column the values are ordered
    /// channel first, then kernel row, then kernel column.
    pub fn to_windows(&self, features: TensorView) -> NnResult<Tensor> {
        if features.ncols() != self.input_len() {
            return Err(NnError::ShapeMismatchError {
                layer: "im2col",
                expected: self.input_len(),
                found: features.ncols(),
            });
        }
        let batch_size = features.nrows();
        let (out_rows, out_cols, k) = (self.out_rows(), self.out_cols(), self.kernel_size);

        let images = features
            .as_standard_layout()
            .into_shape((batch_size, self.channels, self.rows, self.cols))?;
        let mut windows = Array4::zeros((self.window_len(), batch_size, out_rows, out_cols));

        for c in 0..self.channels {
            for ky in 0..k {
                for kx in 0..k {
                    let row = c * k * k + ky * k + kx;
                    windows
                        .slice_mut(s![row, .., .., ..])
                        .assign(&images.slice(s![.., c, ky..ky + out_rows, kx..kx + out_cols]));
                }
            }
        }

        Ok(windows.into_shape((self.window_len(), batch_size * self.windows_per_image()))?)
    }

    /// Adjoint of [`WindowGeometry::to_windows`]. Every entry of the window matrix is added
    /// onto the pixel it was read from, so overlapping windows accumulate.
    pub fn from_windows(&self, window_gradient: TensorView, batch_size: usize) -> NnResult<Tensor> {
        let expected_cols = batch_size * self.windows_per_image();
        if window_gradient.nrows() != self.window_len() {
            return Err(NnError::ShapeMismatchError {
                layer: "col2im",
                expected: self.window_len(),
                found: window_gradient.nrows(),
            });
        }
        if window_gradient.ncols() != expected_cols {
            return Err(NnError::ShapeMismatchError {
                layer: "col2im",
                expected: expected_cols,
                found: window_gradient.ncols(),
            });
        }
        let (out_rows, out_cols, k) = (self.out_rows(), self.out_cols(), self.kernel_size);

        let gradient = window_gradient.as_standard_layout().into_shape((
            self.window_len(),
            batch_size,
            out_rows,
            out_cols,
        ))?;
        let mut images = Array4::zeros((batch_size, self.channels, self.rows, self.cols));

        for c in 0..self.channels {
            for ky in 0..k {
                for kx in 0..k {
                    let row = c * k * k + ky * k + kx;
                    let mut target =
                        images.slice_mut(s![.., c, ky..ky + out_rows, kx..kx + out_cols]);
                    target += &gradient.slice(s![row, .., .., ..]);
                }
            }
        }

        Ok(images.into_shape((batch_size, self.input_len()))?)
    }
}

/// Gathers all stride-1 windows of a feature map batch into columns.
pub fn to_windows(
    features: TensorView,
    channels: usize,
    rows: usize,
    cols: usize,
    kernel_size: usize,
) -> NnResult<Tensor> {
    WindowGeometry::new(channels, rows, cols, kernel_size)?.to_windows(features)
}

/// Scatter-adds a window space gradient back into feature map space.
pub fn from_windows(
    window_gradient: TensorView,
    batch_size: usize,
    channels: usize,
    rows: usize,
    cols: usize,
    kernel_size: usize,
) -> NnResult<Tensor> {
    WindowGeometry::new(channels, rows, cols, kernel_size)?.from_windows(window_gradient, batch_size)
}
