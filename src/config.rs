//! Serializable layer configurations.
//!
//! These mirror the constructor arguments of the layers and block factories, so a model
//! description can be kept in a JSON or TOML file and handed to the assembling code.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{ConvError, Result};
use crate::{KernelSize, Padding};

fn one() -> usize {
    1
}

fn enabled() -> bool {
    true
}

/// Hyper parameters shared by every convolution in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: KernelSize,
    #[serde(default = "one")]
    pub stride: usize,
    #[serde(default)]
    pub padding: Padding,
    #[serde(default = "one")]
    pub dilation: usize,
    #[serde(default = "one")]
    pub groups: usize,
    #[serde(default = "enabled")]
    pub bias: bool,
}

impl ConvConfig {
    /// Stride 1, no padding, no dilation, a single group and a bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: impl Into<KernelSize>) -> Self {
        ConvConfig {
            in_channels,
            out_channels,
            kernel_size: kernel_size.into(),
            stride: 1,
            padding: Padding::Valid,
            dilation: 1,
            groups: 1,
            bias: true,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: impl Into<Padding>) -> Self {
        self.padding = padding.into();
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Shape of the weight tensor described by this configuration.
    pub fn kernel_shape(&self) -> (usize, usize, usize, usize) {
        (
            self.out_channels,
            self.in_channels / self.groups.max(1),
            self.kernel_size.height,
            self.kernel_size.width,
        )
    }

    /// Checks that every size is positive and that both channel counts split into the groups.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel height", self.kernel_size.height),
            ("kernel width", self.kernel_size.width),
            ("stride", self.stride),
            ("dilation", self.dilation),
            ("groups", self.groups),
        ];
        for (name, value) in positive.iter() {
            if *value == 0 {
                return Err(ConvError::InvalidParameter(format!("{} must be positive", name)));
            }
        }
        for channels in [self.in_channels, self.out_channels].iter() {
            if channels % self.groups != 0 {
                return Err(ConvError::ChannelsNotDivisible {
                    channels: *channels,
                    groups: self.groups,
                });
            }
        }
        debug!("validated convolution config {:?}", self);
        Ok(())
    }
}

/// Batch normalization hyper parameters, Pytorch defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormConfig {
    pub eps: f64,
    pub momentum: f64,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        BatchNormConfig {
            eps: 1e-5,
            momentum: 0.1,
        }
    }
}

/// Arguments of [`partial_conv_block`](crate::block::partial_conv_block).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialConvBlockConfig {
    pub conv: ConvConfig,
    #[serde(default = "enabled")]
    pub batch_norm: bool,
    #[serde(default)]
    pub batch_norm_config: BatchNormConfig,
    #[serde(default)]
    pub activation: Option<Activation>,
}

impl PartialConvBlockConfig {
    /// Batch normalization on, no activation.
    pub fn new(conv: ConvConfig) -> Self {
        PartialConvBlockConfig {
            conv,
            batch_norm: true,
            batch_norm_config: BatchNormConfig::default(),
            activation: None,
        }
    }

    pub fn with_batch_norm(mut self, batch_norm: bool) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    pub fn with_activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }
}

/// Arguments of [`partial_gated_conv_block`](crate::block::partial_gated_conv_block).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GatedConvBlockConfig {
    pub conv: ConvConfig,
    #[serde(default)]
    pub batch_norm: bool,
    #[serde(default)]
    pub batch_norm_config: BatchNormConfig,
    #[serde(default)]
    pub activation: Activation,
}

impl GatedConvBlockConfig {
    /// No batch normalization, SELU on the feature branch.
    pub fn new(conv: ConvConfig) -> Self {
        GatedConvBlockConfig {
            conv,
            batch_norm: false,
            batch_norm_config: BatchNormConfig::default(),
            activation: Activation::default(),
        }
    }

    pub fn with_batch_norm(mut self, batch_norm: bool) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}
