//! Stage interfaces shared by every layer.
//!
//! Layers come in two flavours: [`Module`]s map a single tensor to a tensor, and
//! [`PairedModule`]s map a (feature, mask) pair to a pair. Both expose their trainable
//! parameters through [`Parameterized`], which is the only path an optimizer has to
//! the weights. Anything a layer keeps out of `parameters_mut` is frozen.

use std::collections::BTreeMap;

use log::trace;
use ndarray::{Array4, ArrayD, ArrayViewD, ArrayViewMutD};

use crate::error::{ConvError, Result};
use crate::{Element, FeatureMask};

pub type NamedParameter<'a, F> = (String, ArrayViewD<'a, F>);
pub type NamedParameterMut<'a, F> = (String, ArrayViewMutD<'a, F>);

pub trait Parameterized<F: Element> {
    /// Trainable parameters, keyed by a dotted name such as `feature_conv.weight`.
    fn parameters(&self) -> Vec<NamedParameter<'_, F>>;
    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>>;

    /// Switch between training and evaluation mode.
    /// Only matters for layers that track batch statistics.
    fn set_training(&mut self, _training: bool) {}

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|(_, p)| p.len()).sum()
    }
}

pub trait Module<F: Element>: Parameterized<F> {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>>;
}

pub trait PairedModule<F: Element>: Parameterized<F> {
    fn forward_pair(&mut self, pair: FeatureMask<F>) -> Result<FeatureMask<F>>;
}

fn prefixed<T>(index: usize, named: Vec<(String, T)>) -> impl Iterator<Item = (String, T)> {
    named
        .into_iter()
        .map(move |(name, p)| (format!("{}.{}", index, name), p))
}

/// Single-tensor stages run one after another.
pub struct Sequential<F: Element> {
    layers: Vec<Box<dyn Module<F>>>,
}

impl<F: Element> Sequential<F> {
    pub fn new(layers: Vec<Box<dyn Module<F>>>) -> Self {
        Sequential { layers }
    }

    pub fn push(&mut self, layer: Box<dyn Module<F>>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<F: Element> From<Vec<Box<dyn Module<F>>>> for Sequential<F> {
    fn from(layers: Vec<Box<dyn Module<F>>>) -> Self {
        Sequential::new(layers)
    }
}

impl<F: Element> Parameterized<F> for Sequential<F> {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| prefixed(i, l.parameters()))
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        self.layers
            .iter_mut()
            .enumerate()
            .flat_map(|(i, l)| prefixed(i, l.parameters_mut()))
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }
}

impl<F: Element> Module<F> for Sequential<F> {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>> {
        let mut current = x.clone();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            current = layer.forward(&current)?;
            trace!("sequential stage {} -> {:?}", i, current.dim());
        }
        Ok(current)
    }
}

/// Paired stages run one after another, threading the (feature, mask) pair through.
pub struct PairedSequential<F: Element> {
    layers: Vec<Box<dyn PairedModule<F>>>,
}

impl<F: Element> PairedSequential<F> {
    pub fn new(layers: Vec<Box<dyn PairedModule<F>>>) -> Self {
        PairedSequential { layers }
    }

    pub fn push(&mut self, layer: Box<dyn PairedModule<F>>) {
        self.layers.push(layer);
    }

    /// Appends every stage of a block, keeping their order.
    pub fn extend(&mut self, block: Vec<Box<dyn PairedModule<F>>>) {
        self.layers.extend(block);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<F: Element> From<Vec<Box<dyn PairedModule<F>>>> for PairedSequential<F> {
    fn from(layers: Vec<Box<dyn PairedModule<F>>>) -> Self {
        PairedSequential::new(layers)
    }
}

impl<F: Element> Parameterized<F> for PairedSequential<F> {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| prefixed(i, l.parameters()))
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        self.layers
            .iter_mut()
            .enumerate()
            .flat_map(|(i, l)| prefixed(i, l.parameters_mut()))
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }
}

impl<F: Element> PairedModule<F> for PairedSequential<F> {
    fn forward_pair(&mut self, pair: FeatureMask<F>) -> Result<FeatureMask<F>> {
        let mut current = pair;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            current = layer.forward_pair(current)?;
            trace!(
                "paired stage {} -> feature {:?}, mask {:?}",
                i,
                current.0.dim(),
                current.1.dim()
            );
        }
        Ok(current)
    }
}

/// Plain gradient descent, `p -= learning_rate * grad`, over every trainable parameter
/// that has a gradient in `gradients`. Returns the number of parameters updated.
/// Shapes are checked before anything is written, so a failed step changes nothing.
pub fn sgd_step<F, M>(
    module: &mut M,
    gradients: &BTreeMap<String, ArrayD<F>>,
    learning_rate: F,
) -> Result<usize>
where
    F: Element,
    M: Parameterized<F> + ?Sized,
{
    let params = module.parameters_mut();
    for (name, param) in &params {
        if let Some(grad) = gradients.get(name) {
            if grad.shape() != param.shape() {
                return Err(ConvError::shape_mismatch(param.shape(), grad.shape()));
            }
        }
    }
    let mut updated = 0;
    for (name, mut param) in params {
        if let Some(grad) = gradients.get(&name) {
            param.scaled_add(-learning_rate, grad);
            updated += 1;
        }
    }
    trace!("sgd step updated {} parameters", updated);
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolutions::ConvolutionLayer;
    use crate::Padding;
    use ndarray::{Array1, IxDyn};

    fn layer() -> ConvolutionLayer<f32> {
        ConvolutionLayer::new(Array4::ones((4, 2, 3, 3)), Some(Array1::zeros(4)), 1, Padding::Valid).unwrap()
    }

    #[test]
    fn sgd_step_moves_parameters_against_the_gradient() {
        let mut conv = layer();
        let mut grads = BTreeMap::new();
        grads.insert("weight".to_string(), ArrayD::from_elem(IxDyn(&[4, 2, 3, 3]), 2.0));
        assert_eq!(sgd_step(&mut conv, &grads, 0.25).unwrap(), 1);
        assert!(conv.kernel().iter().all(|&w| w == 0.5));
        assert!(conv.bias().unwrap().iter().all(|&b| b == 0.));
    }

    #[test]
    fn failed_sgd_step_changes_nothing() {
        let mut conv = layer();
        let mut grads = BTreeMap::new();
        grads.insert("weight".to_string(), ArrayD::from_elem(IxDyn(&[4, 2, 3, 3]), 2.0));
        grads.insert("bias".to_string(), ArrayD::zeros(IxDyn(&[5])));
        assert!(matches!(
            sgd_step(&mut conv, &grads, 0.25),
            Err(ConvError::ShapeMismatch { .. })
        ));
        assert!(conv.kernel().iter().all(|&w| w == 1.));
    }

    #[test]
    fn sequential_prefixes_parameter_names() {
        let layers: Vec<Box<dyn Module<f32>>> = vec![Box::new(layer()), Box::new(layer())];
        let seq = Sequential::new(layers);
        let names: Vec<String> = seq.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["0.weight", "0.bias", "1.weight", "1.bias"]);
        assert_eq!(seq.num_parameters(), 2 * (4 * 2 * 9 + 4));
    }
}
