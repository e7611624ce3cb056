//! Factories assembling a convolution with its optional normalization and activation
//! into an ordered list of stages, ready to be embedded in a larger network.

use log::debug;
use rand::Rng;

use crate::config::{GatedConvBlockConfig, PartialConvBlockConfig};
use crate::error::Result;
use crate::gated::PartialGatedConv;
use crate::module::{Module, PairedModule};
use crate::norm::BatchNorm2d;
use crate::paired::{DoubleActivation, DoubleNorm};
use crate::partial::PartialConv;
use crate::Element;

/// `[PartialConv, DoubleNorm(BatchNorm2d) if batch_norm, DoubleActivation if activation]`.
///
/// Every stage consumes and produces a (feature, mask) pair; run them in order, e.g.
/// through a [`PairedSequential`](crate::module::PairedSequential).
pub fn partial_conv_block<F, R>(
    config: &PartialConvBlockConfig,
    rng: &mut R,
) -> Result<Vec<Box<dyn PairedModule<F>>>>
where
    F: Element,
    R: Rng + ?Sized,
{
    let mut stages: Vec<Box<dyn PairedModule<F>>> =
        vec![Box::new(PartialConv::<F>::from_config(&config.conv, rng)?)];
    if config.batch_norm {
        stages.push(Box::new(DoubleNorm::new(BatchNorm2d::<F>::with_config(
            config.conv.out_channels,
            &config.batch_norm_config,
        ))));
    }
    if let Some(activation) = config.activation {
        stages.push(Box::new(DoubleActivation::new(activation)));
    }
    debug!(
        "partial conv block with {} stages (batch norm: {}, activation: {:?})",
        stages.len(),
        config.batch_norm,
        config.activation
    );
    Ok(stages)
}

/// `[PartialGatedConv, BatchNorm2d if batch_norm]`.
///
/// The gated convolution emits a single tensor, so normalization is a plain stage here.
/// It is sized to the gated output, `out_channels / 2`.
pub fn partial_gated_conv_block<F, R>(
    config: &GatedConvBlockConfig,
    rng: &mut R,
) -> Result<Vec<Box<dyn Module<F>>>>
where
    F: Element,
    R: Rng + ?Sized,
{
    let gated = PartialGatedConv::<F>::from_config(&config.conv, config.activation, rng)?;
    let gated_channels = gated.out_channels();
    let mut stages: Vec<Box<dyn Module<F>>> = vec![Box::new(gated)];
    if config.batch_norm {
        stages.push(Box::new(BatchNorm2d::<F>::with_config(
            gated_channels,
            &config.batch_norm_config,
        )));
    }
    debug!(
        "gated conv block with {} stages (batch norm: {}, activation: {:?})",
        stages.len(),
        config.batch_norm,
        config.activation
    );
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::config::ConvConfig;
    use crate::error::ConvError;
    use crate::module::{PairedSequential, Parameterized, Sequential};
    use crate::Padding;
    use ndarray::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn partial_block_stage_count_follows_flags() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = ConvConfig::new(3, 4, 3).with_padding(1);

        let full = PartialConvBlockConfig::new(conv).with_activation(Some(Activation::Relu));
        let block = partial_conv_block::<f32, _>(&full, &mut rng).unwrap();
        assert_eq!(block.len(), 3);

        let bare = PartialConvBlockConfig::new(conv).with_batch_norm(false);
        assert_eq!(partial_conv_block::<f32, _>(&bare, &mut rng).unwrap().len(), 1);

        let names: Vec<String> = PairedSequential::from(block)
            .parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(
            names,
            vec!["0.feature_conv.weight", "0.feature_conv.bias", "1.weight", "1.bias"]
        );
    }

    #[test]
    fn partial_block_runs_end_to_end() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = ConvConfig::new(3, 4, 3).with_padding(1);
        let config = PartialConvBlockConfig::new(conv).with_activation(Some(Activation::Relu));
        let mut block = PairedSequential::from(partial_conv_block::<f32, _>(&config, &mut rng).unwrap());

        let x = Array4::from_shape_simple_fn((2, 3, 8, 8), || rng.gen_range(-1.0..1.0));
        let mut mask = Array4::ones((2, 1, 8, 8));
        mask.slice_mut(s![.., .., 2..6, 2..6]).fill(0.);
        let (output, output_mask) = block.forward_pair((x, mask)).unwrap();
        assert_eq!(output.dim(), (2, 4, 8, 8));
        assert!(output.iter().all(|&v| v >= 0.));
        assert!(output_mask.iter().all(|&m| m == 0. || m == 1.));
        // the hole shrinks by one pixel on every side
        assert_eq!(output_mask.iter().filter(|&&m| m == 0.).count(), 2 * 4 * 4);
    }

    #[test]
    fn gated_block_normalizes_the_gated_channels() {
        let mut rng = StdRng::seed_from_u64(2);
        let conv = ConvConfig::new(3, 8, 3).with_padding(Padding::Same);
        let config = GatedConvBlockConfig::new(conv).with_batch_norm(true);
        let block = partial_gated_conv_block::<f64, _>(&config, &mut rng).unwrap();
        assert_eq!(block.len(), 2);

        let mut seq = Sequential::from(block);
        let x = Array4::from_shape_simple_fn((2, 3, 5, 5), || rng.gen_range(-1.0..1.0));
        let output = seq.forward(&x).unwrap();
        assert_eq!(output.dim(), (2, 4, 5, 5));
        assert_eq!(seq.num_parameters(), 8 * 3 * 9 + 8 + 4 + 4);
    }

    #[test]
    fn gated_block_without_norm_and_odd_channels() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = ConvConfig::new(3, 8, 3);
        let block = partial_gated_conv_block::<f32, _>(&GatedConvBlockConfig::new(conv), &mut rng).unwrap();
        assert_eq!(block.len(), 1);

        let odd = GatedConvBlockConfig::new(ConvConfig::new(3, 7, 3));
        assert!(matches!(
            partial_gated_conv_block::<f32, _>(&odd, &mut rng),
            Err(ConvError::OddGatedChannels(7))
        ));
    }
}
