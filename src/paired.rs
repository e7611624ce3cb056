//! Wrappers that carry a (feature, mask) pair through pooling, upsampling, activation and
//! normalization. Resampling touches both tensors the same way; activation and
//! normalization only touch the feature, since the mask holds validity flags.

use log::trace;

use crate::activation::Activation;
use crate::error::Result;
use crate::module::{Module, NamedParameter, NamedParameterMut, PairedModule, Parameterized};
use crate::resample::{avg_pool2d, upsample, UpsampleMode};
use crate::{Element, FeatureMask, KernelSize};

/// Average pooling applied independently to feature and mask.
#[derive(Debug, Clone, Copy)]
pub struct DoubleAvgPool {
    pub kernel_size: KernelSize,
}

impl DoubleAvgPool {
    pub fn new(kernel_size: impl Into<KernelSize>) -> Self {
        DoubleAvgPool {
            kernel_size: kernel_size.into(),
        }
    }
}

impl<F: Element> Parameterized<F> for DoubleAvgPool {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        Vec::new()
    }
}

impl<F: Element> PairedModule<F> for DoubleAvgPool {
    fn forward_pair(&mut self, (x, mask): FeatureMask<F>) -> Result<FeatureMask<F>> {
        let pooled = (
            avg_pool2d(&x, self.kernel_size)?,
            avg_pool2d(&mask, self.kernel_size)?,
        );
        trace!("double avg pool {:?} -> {:?}", x.dim(), pooled.0.dim());
        Ok(pooled)
    }
}

/// Upsampling applied independently to feature and mask.
#[derive(Debug, Clone, Copy)]
pub struct DoubleUpSample {
    pub scale_factor: usize,
    pub mode: UpsampleMode,
}

impl DoubleUpSample {
    pub fn new(scale_factor: usize, mode: UpsampleMode) -> Self {
        DoubleUpSample { scale_factor, mode }
    }
}

impl<F: Element> Parameterized<F> for DoubleUpSample {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        Vec::new()
    }
}

impl<F: Element> PairedModule<F> for DoubleUpSample {
    fn forward_pair(&mut self, (x, mask): FeatureMask<F>) -> Result<FeatureMask<F>> {
        let upsampled = (
            upsample(&x, self.scale_factor, self.mode)?,
            upsample(&mask, self.scale_factor, self.mode)?,
        );
        trace!("double upsample {:?} -> {:?}", x.dim(), upsampled.0.dim());
        Ok(upsampled)
    }
}

/// Activation of the feature; the mask passes through untouched.
#[derive(Debug, Clone, Copy)]
pub struct DoubleActivation {
    pub activation: Activation,
}

impl DoubleActivation {
    pub fn new(activation: Activation) -> Self {
        DoubleActivation { activation }
    }
}

impl<F: Element> Parameterized<F> for DoubleActivation {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        Vec::new()
    }
}

impl<F: Element> PairedModule<F> for DoubleActivation {
    fn forward_pair(&mut self, (x, mask): FeatureMask<F>) -> Result<FeatureMask<F>> {
        Ok((self.activation.apply(x.view()), mask))
    }
}

/// Normalization of the feature; the mask passes through untouched.
/// Any single-tensor module works, usually a [`BatchNorm2d`](crate::norm::BatchNorm2d).
pub struct DoubleNorm<F: Element> {
    norm: Box<dyn Module<F>>,
}

impl<F: Element> DoubleNorm<F> {
    pub fn new<M: Module<F> + 'static>(norm: M) -> Self {
        DoubleNorm {
            norm: Box::new(norm),
        }
    }

    pub fn inner(&self) -> &dyn Module<F> {
        self.norm.as_ref()
    }
}

impl<F: Element> Parameterized<F> for DoubleNorm<F> {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        self.norm.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        self.norm.parameters_mut()
    }

    fn set_training(&mut self, training: bool) {
        self.norm.set_training(training);
    }
}

impl<F: Element> PairedModule<F> for DoubleNorm<F> {
    fn forward_pair(&mut self, (x, mask): FeatureMask<F>) -> Result<FeatureMask<F>> {
        Ok((self.norm.forward(&x)?, mask))
    }
}
