//! This package provides the layer building blocks of image inpainting networks:
//! partial convolutions (hard-gated by an explicit validity mask) and gated convolutions
//! (soft-gated by a learned sigmoid branch), together with pooling, upsampling,
//! activation and normalization wrappers that carry a feature tensor and its mask through
//! a network side by side.
//!
//! All tensors are ndarrays in NCHW layout (batch, channels, height, width). Kernels use the
//! Pytorch layout (out channels, in channels / groups, kernel height, kernel width), so weights
//! exported from Pytorch can be loaded as-is.
//!
//! Convolutions are computed with the im2col technique described in this blog:
//! - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
//!
//! Partial convolutions follow "Image Inpainting for Irregular Holes Using Partial Convolutions"
//! (Liu et al. 2018), gated convolutions follow "Free-Form Image Inpainting with Gated
//! Convolution" (Yu et al. 2019).
//!
//! Example:
//! ```
//! use ndarray::*;
//! use partial_convolutions_rs::config::ConvConfig;
//! use partial_convolutions_rs::partial::PartialConv;
//! use partial_convolutions_rs::module::PairedModule;
//! use partial_convolutions_rs::Padding;
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let config = ConvConfig::new(3, 8, 3).with_padding(Padding::Zeros(1));
//! let mut rng = StdRng::seed_from_u64(0);
//! let mut layer = PartialConv::<f32>::from_config(&config, &mut rng).unwrap();
//!
//! let image = Array4::<f32>::ones((1, 3, 8, 8));
//! // 0 marks a hole, 1 a known pixel
//! let mut mask = Array4::<f32>::ones((1, 1, 8, 8));
//! mask.slice_mut(s![.., .., 0..2, 0..2]).fill(0.);
//!
//! let (output, output_mask) = layer.forward_pair((image, mask)).unwrap();
//! assert_eq!(output.dim(), (1, 8, 8, 8));
//! assert_eq!(output_mask[[0, 0, 0, 0]], 0.);
//! assert_eq!(output_mask[[0, 0, 1, 1]], 1.);
//! ```

use std::fmt::Debug;
use std::ops::AddAssign;

use ndarray::{Array4, ScalarOperand};
use num_traits::Float;
use rand::distributions::uniform::SampleUniform;
use serde::{Deserialize, Serialize};

pub mod activation;
pub mod block;
pub mod config;
pub mod convolutions;
pub mod error;
pub mod gated;
pub mod io;
pub mod module;
pub mod norm;
pub mod paired;
pub mod partial;
pub mod resample;

pub use error::{ConvError, Result};

/// Scalar types the layers can be instantiated with (`f32` and `f64`).
pub trait Element: 'static + Float + AddAssign + ScalarOperand + SampleUniform + Debug {}

impl<T> Element for T where T: 'static + Float + AddAssign + ScalarOperand + SampleUniform + Debug {}

/// Batched image data, (batch, channels, height, width).
pub type DataRepresentation<F> = Array4<F>;
/// Convolution kernel, (out channels, in channels / groups, height, width).
pub type ConvKernel<F> = Array4<F>;
/// A feature tensor travelling together with its validity mask.
pub type FeatureMask<F> = (Array4<F>, Array4<F>);

/// Padding (specific way of adding zeros to the input matrix) kind used in the convolution.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Padding {
    /// Output has the same shape as input (divided by the stride).
    Same,
    /// No padding, the kernel only visits positions where it fits.
    Valid,
    /// The given number of zero rows and columns is added on every side.
    Zeros(usize),
}

impl Default for Padding {
    fn default() -> Self {
        Padding::Valid
    }
}

impl From<usize> for Padding {
    fn from(amount: usize) -> Self {
        if amount == 0 {
            Padding::Valid
        } else {
            Padding::Zeros(amount)
        }
    }
}

impl Padding {
    /// Returns the number of zeros added (top, bottom, left, right) for an input of the
    /// given size and a kernel with the given effective (dilated) extent.
    pub fn amounts(
        self,
        input_h: usize,
        input_w: usize,
        kernel_h: usize,
        kernel_w: usize,
        stride: usize,
    ) -> (usize, usize, usize, usize) {
        match self {
            Padding::Valid => (0, 0, 0, 0),
            Padding::Zeros(p) => (p, p, p, p),
            Padding::Same => {
                // https://mmuratarat.github.io/2019-01-17/implementing-padding-schemes-of-tensorflow-in-python
                let along = |input: usize, kernel: usize| {
                    let out = (input + stride - 1) / stride;
                    (out.saturating_sub(1) * stride + kernel).saturating_sub(input)
                };
                let pad_h = along(input_h, kernel_h);
                let pad_w = along(input_w, kernel_w);
                (pad_h / 2, pad_h - pad_h / 2, pad_w / 2, pad_w - pad_w / 2)
            }
        }
    }
}

/// Spatial extent of a convolution kernel. A plain integer means a square kernel.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "KernelSizeRepr")]
pub struct KernelSize {
    pub height: usize,
    pub width: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KernelSizeRepr {
    Square(usize),
    Pair(usize, usize),
    Named { height: usize, width: usize },
}

impl From<KernelSizeRepr> for KernelSize {
    fn from(repr: KernelSizeRepr) -> Self {
        match repr {
            KernelSizeRepr::Square(k) => k.into(),
            KernelSizeRepr::Pair(h, w) => (h, w).into(),
            KernelSizeRepr::Named { height, width } => KernelSize { height, width },
        }
    }
}

impl From<usize> for KernelSize {
    fn from(k: usize) -> Self {
        KernelSize {
            height: k,
            width: k,
        }
    }
}

impl From<(usize, usize)> for KernelSize {
    fn from((height, width): (usize, usize)) -> Self {
        KernelSize { height, width }
    }
}
