//! Gated convolution, as introduced in "Free-Form Image Inpainting with Gated Convolution"
//! (Yu et al. 2019).
//!
//! A single convolution produces twice the wanted channels. The first half carries
//! features, the second half is squashed by a sigmoid and used as a learned soft mask.
//! No explicit mask travels with the tensor.

use log::{debug, trace};
use ndarray::*;
use rand::Rng;

use crate::activation::{sigmoid, Activation};
use crate::config::ConvConfig;
use crate::convolutions::ConvolutionLayer;
use crate::error::{ConvError, Result};
use crate::module::{Module, NamedParameter, NamedParameterMut, Parameterized};
use crate::Element;

pub struct PartialGatedConv<F: Element> {
    feature_conv: ConvolutionLayer<F>,
    activation: Activation,
}

impl<F: Element> PartialGatedConv<F> {
    /// Fails with [`ConvError::OddGatedChannels`] unless `config.out_channels` is even.
    pub fn from_config<R: Rng + ?Sized>(
        config: &ConvConfig,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        if config.out_channels % 2 != 0 {
            return Err(ConvError::OddGatedChannels(config.out_channels));
        }
        let feature_conv = ConvolutionLayer::from_config(config, rng)?;
        PartialGatedConv::from_layer(feature_conv, activation)
    }

    pub fn from_layer(feature_conv: ConvolutionLayer<F>, activation: Activation) -> Result<Self> {
        let out_channels = feature_conv.out_channels();
        if out_channels % 2 != 0 {
            return Err(ConvError::OddGatedChannels(out_channels));
        }
        debug!(
            "gated convolution {} -> {} ({} gated), activation {:?}",
            feature_conv.in_channels(),
            out_channels,
            out_channels / 2,
            activation
        );
        Ok(PartialGatedConv {
            feature_conv,
            activation,
        })
    }

    pub fn feature_conv(&self) -> &ConvolutionLayer<F> {
        &self.feature_conv
    }

    pub fn feature_conv_mut(&mut self) -> &mut ConvolutionLayer<F> {
        &mut self.feature_conv
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Channels of the gated output, half of the convolution's.
    pub fn out_channels(&self) -> usize {
        self.feature_conv.out_channels() / 2
    }

    /// `activation(feature) * sigmoid(gate)`, where feature and gate are the two channel
    /// halves of one convolution.
    pub fn gate(&self, x: &Array4<F>) -> Result<Array4<F>> {
        let raw = self.feature_conv.convolve(x)?;
        let half = raw.len_of(Axis(1)) / 2;
        let (feature, gate) = raw.view().split_at(Axis(1), half);
        let activation = self.activation;
        let output = Zip::from(&feature)
            .and(&gate)
            .map_collect(|&f, &g| activation.eval(f) * sigmoid(g));
        trace!("gated convolution {:?} -> {:?}", x.dim(), output.dim());
        Ok(output)
    }
}

impl<F: Element> Parameterized<F> for PartialGatedConv<F> {
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

impl<F: Element> Module<F> for PartialGatedConv<F> {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>> {
        self.gate(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Padding;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn odd_channels_fail_before_any_forward() {
        let mut rng = StdRng::seed_from_u64(0);
        let result =
            PartialGatedConv::<f32>::from_config(&ConvConfig::new(3, 5, 3), Activation::Selu, &mut rng);
        assert!(matches!(result, Err(ConvError::OddGatedChannels(5))));

        let conv = ConvolutionLayer::new(Array4::<f32>::ones((3, 1, 1, 1)), None, 1, Padding::Valid).unwrap();
        assert!(PartialGatedConv::from_layer(conv, Activation::Relu).is_err());
    }

    #[test]
    fn output_has_half_the_channels() {
        let mut rng = StdRng::seed_from_u64(1);
        let config = ConvConfig::new(3, 8, 3).with_stride(2).with_padding(1).with_dilation(2);
        let mut layer = PartialGatedConv::<f32>::from_config(&config, Activation::default(), &mut rng).unwrap();
        let x = Array4::from_shape_simple_fn((2, 3, 11, 10), || rng.gen_range(-1.0..1.0));
        let output = layer.forward(&x).unwrap();
        let plain = layer.feature_conv().convolve(&x).unwrap();
        assert_eq!(layer.out_channels(), 4);
        assert_eq!(output.dim(), (2, 4, plain.len_of(Axis(2)), plain.len_of(Axis(3))));
        // (11 + 2 - 4 - 1) / 2 + 1, (10 + 2 - 4 - 1) / 2 + 1
        assert_eq!(&output.shape()[2..], &[5, 4]);
    }

    #[test]
    fn feature_half_is_gated_by_second_half() {
        // channel 0 passes x through, channel 1 is the gate with a fixed logit
        let mut kernel = Array4::<f64>::zeros((2, 1, 1, 1));
        kernel[[0, 0, 0, 0]] = 1.0;
        let bias = Array1::from(vec![0.0, 0.3]);
        let conv = ConvolutionLayer::new(kernel, Some(bias), 1, Padding::Valid).unwrap();
        let layer = PartialGatedConv::from_layer(conv, Activation::Selu).unwrap();

        let x = Array::from_shape_vec((1, 1, 1, 3), vec![-1.0, 0.0, 2.0]).unwrap();
        let output = layer.gate(&x).unwrap();
        let g = 1.0 / (1.0 + (-0.3f64).exp());
        for (o, v) in output.iter().zip(x.iter()) {
            assert_abs_diff_eq!(*o, Activation::Selu.eval(*v) * g, epsilon = 1e-12);
        }
    }
}
