//! Compression techniques.
//!
//! A technique rewrites one named layer in place. The environment resolves the
//! parameters of each (technique, layer) pair once, at construction, and holds
//! the ready-built technique objects per action index.

mod factorization;
mod pruning;

pub use factorization::{ConvSvd, DenseSvd, DepthwiseSeparable};
pub use pruning::{MagnitudePruning, SparseConnections};

use crate::error::EngineError;
use crate::network::{ActivationFn, ConvStage, LayerOp, Network};
use burn::prelude::*;
use rlcomp_core::LayerKind;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechniqueKind {
    Identity,
    MagnitudePruning,
    DenseSvd,
    ConvSvd,
    DepthwiseSeparable,
    SparseConnections,
}

impl TechniqueKind {
    pub const ALL: [TechniqueKind; 6] = [
        TechniqueKind::Identity,
        TechniqueKind::MagnitudePruning,
        TechniqueKind::DenseSvd,
        TechniqueKind::ConvSvd,
        TechniqueKind::DepthwiseSeparable,
        TechniqueKind::SparseConnections,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TechniqueKind::Identity => "identity",
            TechniqueKind::MagnitudePruning => "magnitude_pruning",
            TechniqueKind::DenseSvd => "dense_svd",
            TechniqueKind::ConvSvd => "conv_svd",
            TechniqueKind::DepthwiseSeparable => "depthwise_separable",
            TechniqueKind::SparseConnections => "sparse_connections",
        }
    }

    pub fn supports(&self, kind: LayerKind) -> bool {
        match self {
            TechniqueKind::Identity | TechniqueKind::MagnitudePruning => kind.is_compressible(),
            TechniqueKind::DenseSvd => kind == LayerKind::FullyConnected,
            TechniqueKind::ConvSvd
            | TechniqueKind::DepthwiseSeparable
            | TechniqueKind::SparseConnections => kind == LayerKind::Convolutional,
        }
    }

    /// Parameters used when the configuration names none for a layer.
    /// `None` means the technique has no sensible default and must be configured.
    pub fn default_params(&self) -> Option<TechniqueParams> {
        match self {
            TechniqueKind::Identity => Some(TechniqueParams::Identity),
            TechniqueKind::MagnitudePruning => {
                Some(TechniqueParams::MagnitudePruning { threshold: 1e-4 })
            }
            TechniqueKind::DenseSvd => None,
            TechniqueKind::ConvSvd => Some(TechniqueParams::ConvSvd { units: 32 }),
            TechniqueKind::DepthwiseSeparable => Some(TechniqueParams::DepthwiseSeparable),
            TechniqueKind::SparseConnections => {
                Some(TechniqueParams::SparseConnections { keep_fraction: 0.75 })
            }
        }
    }
}

impl fmt::Display for TechniqueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technique", rename_all = "snake_case")]
pub enum TechniqueParams {
    Identity,
    MagnitudePruning { threshold: f32 },
    DenseSvd { units: usize },
    ConvSvd { units: usize },
    DepthwiseSeparable,
    SparseConnections { keep_fraction: f32 },
}

impl TechniqueParams {
    pub fn kind(&self) -> TechniqueKind {
        match self {
            TechniqueParams::Identity => TechniqueKind::Identity,
            TechniqueParams::MagnitudePruning { .. } => TechniqueKind::MagnitudePruning,
            TechniqueParams::DenseSvd { .. } => TechniqueKind::DenseSvd,
            TechniqueParams::ConvSvd { .. } => TechniqueKind::ConvSvd,
            TechniqueParams::DepthwiseSeparable => TechniqueKind::DepthwiseSeparable,
            TechniqueParams::SparseConnections { .. } => TechniqueKind::SparseConnections,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::InvalidParameter {
            technique: self.kind().name().to_string(),
            reason,
        };
        match self {
            TechniqueParams::MagnitudePruning { threshold } => {
                if !threshold.is_finite() || *threshold < 0.0 {
                    return Err(invalid(format!("threshold {threshold} must be >= 0")));
                }
            }
            TechniqueParams::DenseSvd { units } | TechniqueParams::ConvSvd { units } => {
                if *units == 0 {
                    return Err(invalid("units must be positive".to_string()));
                }
            }
            TechniqueParams::SparseConnections { keep_fraction } => {
                if !(*keep_fraction > 0.0 && *keep_fraction <= 1.0) {
                    return Err(invalid(format!(
                        "keep_fraction {keep_fraction} outside (0, 1]"
                    )));
                }
            }
            TechniqueParams::Identity | TechniqueParams::DepthwiseSeparable => {}
        }
        Ok(())
    }

    pub fn build<B: Backend>(&self) -> Result<Box<dyn CompressionTechnique<B>>, EngineError> {
        self.validate()?;
        let technique: Box<dyn CompressionTechnique<B>> = match *self {
            TechniqueParams::Identity => Box::new(Identity),
            TechniqueParams::MagnitudePruning { threshold } => {
                Box::new(MagnitudePruning::new(threshold))
            }
            TechniqueParams::DenseSvd { units } => Box::new(DenseSvd::new(units)),
            TechniqueParams::ConvSvd { units } => Box::new(ConvSvd::new(units)),
            TechniqueParams::DepthwiseSeparable => Box::new(DepthwiseSeparable),
            TechniqueParams::SparseConnections { keep_fraction } => {
                Box::new(SparseConnections::new(keep_fraction))
            }
        };
        Ok(technique)
    }
}

/// Weight counts around one `compress_layer` call.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionStats {
    pub weights_before: usize,
    pub weights_after: usize,
    /// Frobenius norm of the discarded part of the layer's weights.
    pub reconstruction_error: f32,
}

pub trait CompressionTechnique<B: Backend> {
    fn name(&self) -> &str;

    fn supports(&self, kind: LayerKind) -> bool;

    /// Rewrites `layer_name` in place.
    fn compress_layer(
        &self,
        network: &mut Network<B>,
        layer_name: &str,
    ) -> Result<CompressionStats, EngineError>;
}

/// Leaves the layer untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl<B: Backend> CompressionTechnique<B> for Identity {
    fn name(&self) -> &str {
        TechniqueKind::Identity.name()
    }

    fn supports(&self, kind: LayerKind) -> bool {
        TechniqueKind::Identity.supports(kind)
    }

    fn compress_layer(
        &self,
        network: &mut Network<B>,
        layer_name: &str,
    ) -> Result<CompressionStats, EngineError> {
        let weights = network.layer(layer_name)?.parameter_count()?;
        Ok(CompressionStats {
            weights_before: weights,
            weights_after: weights,
            reconstruction_error: 0.0,
        })
    }
}

/// The single stage of an untouched convolution.
pub(crate) fn single_conv_stage<'a, B: Backend>(
    technique: &str,
    network: &'a Network<B>,
    layer_name: &str,
) -> Result<(&'a ConvStage<B>, ActivationFn), EngineError> {
    match &network.layer(layer_name)?.op {
        LayerOp::Conv2d { stages, activation } if stages.len() == 1 && stages[0].groups == 1 => {
            Ok((&stages[0], *activation))
        }
        LayerOp::Conv2d { .. } => Err(EngineError::unsupported(
            technique,
            layer_name,
            "convolution is already factorised",
        )),
        _ => Err(EngineError::unsupported(
            technique,
            layer_name,
            "not a convolution",
        )),
    }
}

/// Weight matrix, bias and activation of an untouched dense layer.
pub(crate) fn single_dense_factor<'a, B: Backend>(
    technique: &str,
    network: &'a Network<B>,
    layer_name: &str,
) -> Result<(&'a Tensor<B, 2>, Option<&'a Tensor<B, 1>>, ActivationFn), EngineError> {
    match &network.layer(layer_name)?.op {
        LayerOp::Dense {
            factors,
            bias,
            activation,
        } if factors.len() == 1 => Ok((&factors[0], bias.as_ref(), *activation)),
        LayerOp::Dense { .. } => Err(EngineError::unsupported(
            technique,
            layer_name,
            "dense layer is already factorised",
        )),
        _ => Err(EngineError::unsupported(
            technique,
            layer_name,
            "not a dense layer",
        )),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::network::{tensor_from_vec, ActivationFn, ConvStage, Layer, LayerOp, Network};
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;

    pub fn ramp(len: usize, scale: f32) -> Vec<f32> {
        (0..len)
            .map(|i| ((i as f32 * 0.37).sin() + (i as f32 * 0.11).cos()) * scale)
            .collect()
    }

    /// conv(2->4, 3x3) -> flatten -> dense(64->6) -> dense(6->3)
    pub fn network() -> Network<TestBackend> {
        let device = Default::default();
        Network::new(
            [2, 6, 6],
            vec![
                Layer::new(
                    "conv",
                    LayerOp::Conv2d {
                        stages: vec![ConvStage::new(
                            tensor_from_vec(ramp(4 * 2 * 9, 0.5), [4, 2, 3, 3], &device),
                            Some(tensor_from_vec(vec![0.1; 4], [4], &device)),
                        )],
                        activation: ActivationFn::Relu,
                    },
                ),
                Layer::new("flatten", LayerOp::Flatten),
                Layer::new(
                    "dense",
                    LayerOp::Dense {
                        factors: vec![tensor_from_vec(ramp(64 * 6, 0.3), [64, 6], &device)],
                        bias: Some(tensor_from_vec(vec![0.05; 6], [6], &device)),
                        activation: ActivationFn::Relu,
                    },
                ),
                Layer::new(
                    "head",
                    LayerOp::Dense {
                        factors: vec![tensor_from_vec(ramp(6 * 3, 1.0), [6, 3], &device)],
                        bias: None,
                        activation: ActivationFn::Softmax,
                    },
                ),
            ],
        )
        .unwrap()
    }

    pub fn input() -> burn::tensor::Tensor<TestBackend, 4> {
        let device = Default::default();
        tensor_from_vec(ramp(3 * 2 * 36, 1.0), [3, 2, 6, 6], &device)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn params_round_trip_through_json() {
        let params = TechniqueParams::DenseSvd { units: 16 };
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"technique":"dense_svd","units":16}"#);
        let back: TechniqueParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(TechniqueParams::DenseSvd { units: 0 }.validate().is_err());
        assert!(TechniqueParams::MagnitudePruning { threshold: -1.0 }
            .validate()
            .is_err());
        assert!(TechniqueParams::SparseConnections { keep_fraction: 1.5 }
            .validate()
            .is_err());
        assert!(TechniqueParams::ConvSvd { units: 4 }.validate().is_ok());
    }

    #[test]
    fn technique_targets_follow_layer_type() {
        assert!(TechniqueKind::DenseSvd.supports(LayerKind::FullyConnected));
        assert!(!TechniqueKind::DenseSvd.supports(LayerKind::Convolutional));
        assert!(TechniqueKind::ConvSvd.supports(LayerKind::Convolutional));
        assert!(TechniqueKind::Identity.supports(LayerKind::Convolutional));
        assert!(!TechniqueKind::Identity.supports(LayerKind::Other));
        assert!(TechniqueKind::DenseSvd.default_params().is_none());
    }

    #[test]
    fn identity_keeps_weights() {
        let mut network = network();
        let before = network.parameter_count().unwrap();
        let technique = TechniqueParams::Identity.build::<TestBackend>().unwrap();
        let stats = technique.compress_layer(&mut network, "dense").unwrap();
        assert_eq!(stats.weights_before, stats.weights_after);
        assert_eq!(network.parameter_count().unwrap(), before);
    }
}
