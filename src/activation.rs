//! Elementwise nonlinearities.

use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::module::{Module, NamedParameter, NamedParameterMut, Parameterized};
use crate::Element;

const SELU_ALPHA: f64 = 1.673_263_242_354_377_2;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    Relu,
    LeakyRelu { negative_slope: f64 },
    Elu { alpha: f64 },
    /// Self-normalizing ELU, `scale * (max(0, x) + min(0, alpha * (exp(x) - 1)))`.
    Selu,
    Sigmoid,
    Tanh,
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Selu
    }
}

impl Activation {
    /// Applies the function to a single value.
    pub fn eval<F: Element>(self, x: F) -> F {
        let cast = |v: f64| F::from(v).unwrap_or_else(F::one);
        let elu = |x: F, alpha: F| {
            if x > F::zero() {
                x
            } else {
                alpha * (x.exp() - F::one())
            }
        };
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(F::zero()),
            Activation::LeakyRelu { negative_slope } => {
                if x >= F::zero() {
                    x
                } else {
                    cast(negative_slope) * x
                }
            }
            Activation::Elu { alpha } => elu(x, cast(alpha)),
            Activation::Selu => cast(SELU_SCALE) * elu(x, cast(SELU_ALPHA)),
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
        }
    }

    /// Applies the function to every element.
    pub fn apply<F: Element>(self, x: ArrayView4<F>) -> Array4<F> {
        x.mapv(|v| self.eval(v))
    }
}

pub fn sigmoid<F: Element>(x: F) -> F {
    F::one() / (F::one() + (-x).exp())
}

/// An [`Activation`] usable as a stage of a [`Sequential`](crate::module::Sequential).
#[derive(Debug, Clone, Copy)]
pub struct ActivationLayer {
    pub activation: Activation,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Self {
        ActivationLayer { activation }
    }
}

impl<F: Element> Parameterized<F> for ActivationLayer {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        Vec::new()
    }
}

impl<F: Element> Module<F> for ActivationLayer {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>> {
        Ok(self.activation.apply(x.view()))
    }
}
