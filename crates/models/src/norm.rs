use std::str::FromStr;

use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig, RmsNorm, RmsNormConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::ModelError;

const NORM_EPS: f64 = 1e-6;

/// Normalisation applied over the channel (last) dimension of token tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

impl FromStr for NormKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ln" | "layernorm" => Ok(NormKind::LayerNorm),
            "rms" | "rmsnorm" => Ok(NormKind::RmsNorm),
            other => Err(ModelError::config(format!(
                "unknown MODEL.PVT.NORM_LAYER {other:?} (expected LN or RMS)"
            ))),
        }
    }
}

/// Norm constructor bound to one [`NormKind`]; handed to stage builders so
/// every block creates the same kind of layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormLayer {
    kind: NormKind,
}

impl NormLayer {
    pub fn new(kind: NormKind) -> Self {
        Self { kind }
    }

    pub fn init<B: Backend>(&self, dim: usize, device: &B::Device) -> Norm<B> {
        match self.kind {
            NormKind::LayerNorm => Norm::Layer(
                LayerNormConfig::new(dim)
                    .with_epsilon(NORM_EPS)
                    .init(device),
            ),
            NormKind::RmsNorm => Norm::Rms(
                RmsNormConfig::new(dim)
                    .with_epsilon(NORM_EPS)
                    .init(device),
            ),
        }
    }
}

#[derive(Module, Debug)]
pub enum Norm<B: Backend> {
    Layer(LayerNorm<B>),
    Rms(RmsNorm<B>),
}

impl<B: Backend> Norm<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Norm::Layer(norm) => norm.forward(x),
            Norm::Rms(norm) => norm.forward(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn parses_known_names() {
        assert_eq!("LN".parse::<NormKind>().unwrap(), NormKind::LayerNorm);
        assert_eq!("LayerNorm".parse::<NormKind>().unwrap(), NormKind::LayerNorm);
        assert_eq!("rms".parse::<NormKind>().unwrap(), NormKind::RmsNorm);
        assert!("BN".parse::<NormKind>().unwrap_err().is_configuration());
    }

    #[test]
    fn layer_norm_centres_tokens() {
        let device = Default::default();
        let norm = NormLayer::new(NormKind::LayerNorm).init::<NdArray<f32>>(4, &device);
        let x = Tensor::<NdArray<f32>, 3>::from_floats([[[1.0, 2.0, 3.0, 4.0]]], &device);
        let mean: f32 = norm.forward(x).mean().into_scalar();
        assert!(mean.abs() < 1e-5);
    }
}
