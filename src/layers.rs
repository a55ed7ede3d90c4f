use std::str::FromStr;

use candle_core::{ModuleT, Tensor};
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

use crate::error::{Error, Result};

const LEAKY_SLOPE: f64 = 0.1;
const BATCH_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Mish,
    Relu,
    Leaky,
    Linear,
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "mish" => Ok(Activation::Mish),
            "relu" => Ok(Activation::Relu),
            "leaky" => Ok(Activation::Leaky),
            "linear" => Ok(Activation::Linear),
            other => Err(Error::InvalidActivation(other.to_string())),
        }
    }
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Mish => mish(xs),
            Activation::Relu => xs.relu(),
            Activation::Leaky => candle_nn::ops::leaky_relu(xs, LEAKY_SLOPE),
            Activation::Linear => Ok(xs.clone()),
        }
    }
}

/// `x * tanh(softplus(x))`, with softplus written to stay finite for large `x`.
pub fn mish(xs: &Tensor) -> candle_core::Result<Tensor> {
    let softplus = (xs.relu()? + (xs.abs()?.neg()?.exp()? + 1.0)?.log()?)?;
    xs.mul(&softplus.tanh()?)
}

/// Convolution with `(k - 1) / 2` padding, optional batch norm and an activation.
///
/// Without batch norm the convolution carries its own bias.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv2d,
    bn: Option<BatchNorm>,
    activation: Activation,
}

impl ConvBlock {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        activation: &str,
        use_batch_norm: bool,
    ) -> Result<Self> {
        let activation = activation.parse::<Activation>()?;
        let config = Conv2dConfig {
            padding: (kernel_size - 1) / 2,
            stride,
            ..Default::default()
        };
        let (conv, bn) = if use_batch_norm {
            let conv = conv2d_no_bias(in_channels, out_channels, kernel_size, config, vb.pp("conv"))?;
            let bn = batch_norm(out_channels, BATCH_NORM_EPS, vb.pp("bn"))?;
            (conv, Some(bn))
        } else {
            (conv2d(in_channels, out_channels, kernel_size, config, vb.pp("conv"))?, None)
        };
        Ok(Self {
            conv,
            bn,
            activation,
        })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = xs.apply(&self.conv)?;
        let xs = match &self.bn {
            Some(bn) => xs.apply_t(bn, train)?,
            None => xs,
        };
        self.activation.apply(&xs)
    }
}

/// Final layers of one scale: a 3x3 leaky block doubling the channels, then a
/// linear 1x1 convolution producing the raw `anchors * (5 + classes)` map.
#[derive(Debug, Clone)]
pub struct HeadProjection {
    hidden: ConvBlock,
    output: ConvBlock,
}

impl HeadProjection {
    pub fn load(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let hidden = ConvBlock::load(vb.pp("c1"), in_channels, in_channels * 2, 3, 1, "leaky", true)?;
        let output = ConvBlock::load(vb.pp("c2"), in_channels * 2, out_channels, 1, 1, "linear", false)?;
        Ok(Self { hidden, output })
    }
}

impl ModuleT for HeadProjection {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        xs.apply_t(&self.hidden, train)?.apply_t(&self.output, train)
    }
}
