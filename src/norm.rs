//! Batch normalization for NCHW feature maps.

use log::{debug, trace};
use ndarray::*;

use crate::config::BatchNormConfig;
use crate::convolutions::channel_view;
use crate::error::{ConvError, Result};
use crate::module::{Module, NamedParameter, NamedParameterMut, Parameterized};
use crate::Element;

/// Batch normalization over the (batch, height, width) axes of an NCHW tensor.
///
/// In training mode the batch statistics normalize the input and are folded into the
/// running estimates; in evaluation mode the running estimates are used instead.
#[derive(Debug, Clone)]
pub struct BatchNorm2d<F: Element> {
    num_features: usize,
    eps: F,
    momentum: F,
    training: bool,
    // Parameters (learnable)
    gamma: Array1<F>,
    beta: Array1<F>,
    // Buffers (not learnable)
    running_mean: Array1<F>,
    running_var: Array1<F>,
}

impl<F: Element> BatchNorm2d<F> {
    pub fn new(num_features: usize) -> Self {
        Self::with_config(num_features, &BatchNormConfig::default())
    }

    pub fn with_config(num_features: usize, config: &BatchNormConfig) -> Self {
        debug!(
            "batch norm over {} channels, eps {}, momentum {}",
            num_features, config.eps, config.momentum
        );
        BatchNorm2d {
            num_features,
            eps: F::from(config.eps).unwrap_or_else(F::epsilon),
            momentum: F::from(config.momentum).unwrap_or_else(F::zero),
            training: true,
            gamma: Array1::ones(num_features),
            beta: Array1::zeros(num_features),
            running_mean: Array1::zeros(num_features),
            running_var: Array1::ones(num_features),
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn running_mean(&self) -> &Array1<F> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Array1<F> {
        &self.running_var
    }

    /// Per channel mean and biased variance of a batch.
    fn batch_statistics(x: &Array4<F>) -> (Array1<F>, Array1<F>, usize) {
        let channels = x.len_of(Axis(1));
        // (C, N*H*W)
        let per_channel = x.view().permuted_axes([1, 0, 2, 3]);
        let count = x.len() / channels.max(1);
        let mut mean = Array1::zeros(channels);
        let mut var = Array1::zeros(channels);
        let n = F::from(count).unwrap_or_else(F::one);
        for (c, lane) in per_channel.outer_iter().enumerate() {
            let m = lane.sum() / n;
            let v = lane.fold(F::zero(), |acc, &val| acc + (val - m) * (val - m)) / n;
            mean[c] = m;
            var[c] = v;
        }
        (mean, var, count)
    }
}

impl<F: Element> Parameterized<F> for BatchNorm2d<F> {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        vec![
            ("weight".to_string(), self.gamma.view().into_dyn()),
            ("bias".to_string(), self.beta.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        vec![
            ("weight".to_string(), self.gamma.view_mut().into_dyn()),
            ("bias".to_string(), self.beta.view_mut().into_dyn()),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

impl<F: Element> Module<F> for BatchNorm2d<F> {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>> {
        let (batch, channels, height, width) = x.dim();
        if channels != self.num_features {
            return Err(ConvError::shape_mismatch(
                &[batch, self.num_features, height, width],
                x.shape(),
            ));
        }

        let (mean, var) = if self.training {
            let (mean, var, count) = Self::batch_statistics(x);
            if count < 2 {
                return Err(ConvError::InvalidParameter(format!(
                    "batch norm needs more than one value per channel in training, got {}",
                    count
                )));
            }
            // running_var tracks the unbiased variance, the batch is normalized with the biased one
            let n = F::from(count).unwrap_or_else(F::one);
            let unbiased = var.mapv(|v| v * n / (n - F::one()));
            let m = self.momentum;
            self.running_mean = &self.running_mean * (F::one() - m) + &mean * m;
            self.running_var = &self.running_var * (F::one() - m) + &unbiased * m;
            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };

        let eps = self.eps;
        let scale = Zip::from(&self.gamma)
            .and(&var)
            .map_collect(|&g, &v| g / (v + eps).sqrt());
        let shift = Zip::from(&self.beta)
            .and(&mean)
            .and(&scale)
            .map_collect(|&b, &m, &s| b - m * s);

        let mut output = x * &channel_view(&scale)?;
        output += &channel_view(&shift)?;
        trace!("batch norm {:?} (training: {})", output.dim(), self.training);
        Ok(output)
    }
}
