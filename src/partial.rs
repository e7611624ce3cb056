//! Partial convolution, as introduced in "Image Inpainting for Irregular Holes Using
//! Partial Convolutions" (Liu et al. 2018).
//!
//! The mask marks known pixels with 1 and holes with 0. Holes are zeroed before the
//! convolution, and every output is rescaled by the number of known pixels its receptive
//! field covered. Outputs that saw at least one known pixel become known themselves.
//!
//! More can be read here:
//! - <https://github.com/NVIDIA/partialconv>

use log::{debug, trace};
use ndarray::*;
use rand::Rng;

use crate::config::ConvConfig;
use crate::convolutions::ConvolutionLayer;
use crate::error::{ConvError, Result};
use crate::module::{NamedParameter, NamedParameterMut, PairedModule, Parameterized};
use crate::{ConvKernel, Element, FeatureMask};

pub struct PartialConv<F: Element> {
    feature_conv: ConvolutionLayer<F>,
    /// All-ones kernel with the feature convolution's footprint. It counts the known
    /// pixels under every receptive field and is never handed out mutably.
    mask_conv: ConvolutionLayer<F>,
}

impl<F: Element> PartialConv<F> {
    /// Creates a partial convolution with Pytorch's default initialisation for the
    /// feature convolution.
    pub fn from_config<R: Rng + ?Sized>(config: &ConvConfig, rng: &mut R) -> Result<Self> {
        let feature_conv = ConvolutionLayer::from_config(config, rng)?;
        PartialConv::from_layer(feature_conv)
    }

    /// Wraps an existing convolution, e.g. one holding weights exported from Pytorch.
    pub fn from_layer(feature_conv: ConvolutionLayer<F>) -> Result<Self> {
        let ones: ConvKernel<F> = Array4::ones(feature_conv.kernel.raw_dim());
        let mask_conv = ConvolutionLayer::with_options(
            ones,
            None,
            feature_conv.stride,
            feature_conv.padding,
            feature_conv.dilation,
            feature_conv.groups,
        )?;
        debug!(
            "partial convolution {} -> {}, kernel {:?}, stride {}, padding {:?}, dilation {}, groups {}",
            feature_conv.in_channels(),
            feature_conv.out_channels(),
            &feature_conv.kernel.shape()[2..],
            feature_conv.stride,
            feature_conv.padding,
            feature_conv.dilation,
            feature_conv.groups
        );
        Ok(PartialConv {
            feature_conv,
            mask_conv,
        })
    }

    pub fn feature_conv(&self) -> &ConvolutionLayer<F> {
        &self.feature_conv
    }

    pub fn feature_conv_mut(&mut self) -> &mut ConvolutionLayer<F> {
        &mut self.feature_conv
    }

    /// The fixed kernel used to count known pixels.
    pub fn mask_kernel(&self) -> ArrayView4<'_, F> {
        self.mask_conv.kernel.view()
    }

    pub fn in_channels(&self) -> usize {
        self.feature_conv.in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.feature_conv.out_channels()
    }

    /// Runs the partial convolution on `x` with validity `mask`.
    ///
    /// The mask needs the spatial shape of `x` and either one channel or one per input
    /// channel; it is broadcast to `x` before use. Returns the renormalized output and
    /// the updated binary mask, which has one channel per output channel.
    pub fn forward(&self, x: &Array4<F>, mask: &Array4<F>) -> Result<FeatureMask<F>> {
        let mask = match mask.broadcast(x.raw_dim()) {
            Some(m) => m,
            None => return Err(ConvError::shape_mismatch(x.shape(), mask.shape())),
        };

        let masked_x = x * &mask;
        let mut output = self.feature_conv.convolve(&masked_x)?;
        // number of known pixels under each receptive field (a weighted count for soft masks)
        let mut output_mask = self.mask_conv.convolve(&mask.to_owned())?;

        let bias = self.feature_conv.bias.as_ref();
        Zip::indexed(&mut output)
            .and(&mut output_mask)
            .for_each(|(_, c, _, _), out, mask_sum| {
                if *mask_sum != F::zero() {
                    let output_bias = bias.map_or_else(F::zero, |b| b[c]);
                    *out = (*out - output_bias) / *mask_sum + output_bias;
                    *mask_sum = F::one();
                } else {
                    *out = F::zero();
                    *mask_sum = F::zero();
                }
            });
        trace!(
            "partial convolution {:?} -> {:?}",
            x.dim(),
            output.dim()
        );
        Ok((output, output_mask))
    }
}

impl<F: Element> Parameterized<F> for PartialConv<F> {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        self.feature_conv
            .parameters()
            .into_iter()
            .map(|(name, p)| (format!("feature_conv.{}", name), p))
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        self.feature_conv
            .parameters_mut()
            .into_iter()
            .map(|(name, p)| (format!("feature_conv.{}", name), p))
            .collect()
    }
}

impl<F: Element> PairedModule<F> for PartialConv<F> {
    fn forward_pair(&mut self, pair: FeatureMask<F>) -> Result<FeatureMask<F>> {
        let (x, mask) = pair;
        self.forward(&x, &mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolutions::conv2d;
    use crate::module::sgd_step;
    use crate::Padding;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn random_mask(shape: (usize, usize, usize, usize), rng: &mut StdRng) -> Array4<f32> {
        Array4::from_shape_simple_fn(shape, || if rng.gen_bool(0.6) { 1. } else { 0. })
    }

    fn random_image(shape: (usize, usize, usize, usize), rng: &mut StdRng) -> Array4<f32> {
        Array4::from_shape_simple_fn(shape, || rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn output_mask_is_binary_and_holes_are_zero() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = ConvConfig::new(4, 6, 3).with_padding(1).with_stride(2).with_groups(2);
        let layer = PartialConv::<f32>::from_config(&config, &mut rng).unwrap();
        let x = random_image((2, 4, 9, 9), &mut rng);
        let mut mask = random_mask((2, 4, 9, 9), &mut rng);
        mask.slice_mut(s![.., .., 0..5, 0..5]).fill(0.);

        let counts = conv2d(
            &Array4::<f32>::ones((6, 2, 3, 3)),
            None,
            &mask,
            Padding::Zeros(1),
            2,
            1,
            2,
        )
        .unwrap();
        let (output, output_mask) = layer.forward(&x, &mask).unwrap();
        assert_eq!(output.dim(), (2, 6, 5, 5));
        assert_eq!(output_mask.dim(), output.dim());
        assert!(output_mask.iter().all(|&m| m == 0. || m == 1.));
        for ((o, m), c) in output.iter().zip(output_mask.iter()).zip(counts.iter()) {
            if *c == 0. {
                assert_eq!(*o, 0.);
                assert_eq!(*m, 0.);
            } else {
                assert_eq!(*m, 1.);
            }
        }
        // the top left corner only ever saw holes
        assert!(output.slice(s![.., .., 0..2, 0..2]).iter().all(|&o| o == 0.));
    }

    #[test]
    fn unit_footprint_is_a_plain_convolution() {
        let mut rng = StdRng::seed_from_u64(1);
        // 1x1 kernel and one input channel per group: every count is exactly 1
        let config = ConvConfig::new(3, 6, 1).with_groups(3);
        let mut layer = PartialConv::<f32>::from_config(&config, &mut rng).unwrap();
        let x = random_image((2, 3, 5, 4), &mut rng);
        let mask = Array4::ones((2, 1, 5, 4));

        let plain = layer.feature_conv().convolve(&x).unwrap();
        let (output, output_mask) = layer.forward_pair((x, mask)).unwrap();
        assert!(output_mask.iter().all(|&m| m == 1.));
        for (a, b) in output.iter().zip(plain.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn full_mask_rescales_by_the_footprint() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = ConvConfig::new(3, 2, 3);
        let layer = PartialConv::<f64>::from_config(&config, &mut rng).unwrap();
        let x = Array4::from_shape_simple_fn((1, 3, 6, 6), || rng.gen_range(-1.0..1.0));
        let mask = Array4::ones((1, 3, 6, 6));

        // without padding every receptive field covers 3 * 3 * 3 known pixels
        let conv = layer.feature_conv();
        let scaled = conv2d(
            &conv.kernel().mapv(|w| w / 27.),
            conv.bias(),
            &x,
            Padding::Valid,
            1,
            1,
            1,
        )
        .unwrap();
        let (output, _) = layer.forward(&x, &mask).unwrap();
        for (a, b) in output.iter().zip(scaled.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn soft_masks_use_weighted_counts() {
        let kernel = Array4::from_elem((1, 1, 1, 2), 1.0f64);
        let conv = ConvolutionLayer::new(kernel, Some(Array1::from_elem(1, 0.5)), 1, Padding::Valid).unwrap();
        let layer = PartialConv::from_layer(conv).unwrap();
        let x = Array::from_shape_vec((1, 1, 1, 3), vec![2.0, 4.0, 8.0]).unwrap();
        let mask = Array::from_shape_vec((1, 1, 1, 3), vec![0.5, 1.0, 0.0]).unwrap();
        let (output, output_mask) = layer.forward(&x, &mask).unwrap();
        // (2 * 0.5 + 4 * 1) / 1.5 + 0.5, then 4 / 1 + 0.5
        assert_abs_diff_eq!(output[[0, 0, 0, 0]], 5.0 / 1.5 + 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(output[[0, 0, 0, 1]], 4.5, epsilon = 1e-12);
        assert_eq!(output_mask.into_raw_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn bias_free_layers_renormalize() {
        let kernel = Array4::from_elem((1, 1, 2, 2), 1.0f32);
        let conv = ConvolutionLayer::new(kernel, None, 2, Padding::Valid).unwrap();
        let layer = PartialConv::from_layer(conv).unwrap();
        let x = Array4::from_elem((1, 1, 2, 4), 3.0f32);
        let mask = Array::from_shape_vec((1, 1, 2, 4), vec![1., 0., 0., 0., 0., 0., 0., 0.]).unwrap();
        let (output, output_mask) = layer.forward(&x, &mask).unwrap();
        assert_eq!(output.into_raw_vec(), vec![3., 0.]);
        assert_eq!(output_mask.into_raw_vec(), vec![1., 0.]);
    }

    #[test]
    fn same_padding_counts_only_real_pixels_at_the_far_border() {
        // 2x2 kernel on 3x3: the single padding row and column go bottom and right
        let kernel = Array4::from_elem((1, 1, 2, 2), 1.0f64);
        let conv = ConvolutionLayer::new(kernel, None, 1, Padding::Same).unwrap();
        let layer = PartialConv::from_layer(conv).unwrap();
        let x = Array::from_shape_vec((1, 1, 3, 3), (1..=9).map(|v| v as f64).collect()).unwrap();
        let mask = Array4::ones((1, 1, 3, 3));
        let (output, output_mask) = layer.forward(&x, &mask).unwrap();

        assert_eq!(output.dim(), (1, 1, 3, 3));
        assert!(output_mask.iter().all(|&m| m == 1.));
        // every output is the mean of the real pixels in its window
        let expected = [3.0, 4.0, 4.5, 6.0, 7.0, 7.5, 7.5, 8.5, 9.0];
        for (o, e) in output.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*o, *e, epsilon = 1e-12);
        }
    }

    #[test]
    fn rejects_masks_that_do_not_broadcast() {
        let mut rng = StdRng::seed_from_u64(9);
        let layer = PartialConv::<f32>::from_config(&ConvConfig::new(3, 4, 3), &mut rng).unwrap();
        let x = Array4::zeros((1, 3, 8, 8));
        assert!(matches!(
            layer.forward(&x, &Array4::ones((1, 1, 7, 8))),
            Err(ConvError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            layer.forward(&x, &Array4::ones((1, 2, 8, 8))),
            Err(ConvError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn mask_kernel_survives_gradient_steps() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = ConvConfig::new(2, 4, 3).with_padding(1);
        let mut layer = PartialConv::<f32>::from_config(&config, &mut rng).unwrap();
        let before = layer.feature_conv().kernel().clone();

        let names: Vec<String> = layer.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["feature_conv.weight", "feature_conv.bias"]);

        for _ in 0..5 {
            let mut grads = BTreeMap::new();
            for (name, p) in layer.parameters() {
                let shape = p.raw_dim();
                grads.insert(name, ArrayD::from_shape_simple_fn(shape, || rng.gen_range(-10.0..10.0)));
            }
            // a gradient aimed at the mask convolution has nowhere to go
            grads.insert(
                "mask_conv.weight".to_string(),
                ArrayD::from_elem(IxDyn(&[4, 2, 3, 3]), 100.0),
            );
            assert_eq!(sgd_step(&mut layer, &grads, 0.5).unwrap(), 2);
        }

        assert!(layer.mask_kernel().iter().all(|&w| w == 1.));
        assert_ne!(layer.feature_conv().kernel(), &before);
    }
}
