//! Weight initialization.
use crate::{Precision, Tensor};
use ndarray::Array;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Draws a `(rows, cols)` matrix of normal samples scaled by `sqrt(1 / rows)`.
pub fn scaled_normal<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Tensor {
    let scale = (1.0 / rows as Precision).sqrt();
    Array::from_shape_fn((rows, cols), |_| {
        let sample: Precision = StandardNormal.sample(&mut *rng);
        sample * scale
    })
}

/// Returns a generator seeded from the operating system.
pub fn entropy_rng() -> StdRng {
    StdRng::from_entropy()
}
