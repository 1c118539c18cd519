use super::{single_conv_stage, CompressionStats, CompressionTechnique, TechniqueKind};
use crate::error::EngineError;
use crate::network::{tensor_from_vec, tensor_to_vec, ConvStage, LayerOp, Network};
use burn::prelude::*;
use rlcomp_core::LayerKind;
use std::cmp::Ordering;
use tracing::{debug, info};

/// Zeroes every weight whose magnitude is below `threshold`. Biases are kept.
#[derive(Clone, Copy, Debug)]
pub struct MagnitudePruning {
    pub threshold: f32,
}

impl MagnitudePruning {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn prune<B: Backend, const D: usize>(
        &self,
        tensor: &Tensor<B, D>,
    ) -> Result<(Tensor<B, D>, usize, f32), EngineError> {
        let mut values = tensor_to_vec(tensor)?;
        let mut pruned = 0;
        let mut error = 0.0f32;
        for value in values.iter_mut() {
            if *value != 0.0 && value.abs() < self.threshold {
                error += *value * *value;
                *value = 0.0;
                pruned += 1;
            }
        }
        Ok((
            tensor_from_vec(values, tensor.dims(), &tensor.device()),
            pruned,
            error,
        ))
    }
}

impl<B: Backend> CompressionTechnique<B> for MagnitudePruning {
    fn name(&self) -> &str {
        TechniqueKind::MagnitudePruning.name()
    }

    fn supports(&self, kind: LayerKind) -> bool {
        TechniqueKind::MagnitudePruning.supports(kind)
    }

    fn compress_layer(
        &self,
        network: &mut Network<B>,
        layer_name: &str,
    ) -> Result<CompressionStats, EngineError> {
        let layer = network.layer(layer_name)?;
        let weights_before = layer.parameter_count()?;
        let mut pruned = 0;
        let mut error_sq = 0.0;
        let op = match &layer.op {
            LayerOp::Conv2d { stages, activation } => {
                let mut new_stages = Vec::with_capacity(stages.len());
                for stage in stages {
                    let (weight, count, err) = self.prune(&stage.weight)?;
                    pruned += count;
                    error_sq += err;
                    new_stages.push(ConvStage {
                        weight,
                        ..stage.clone()
                    });
                }
                LayerOp::Conv2d {
                    stages: new_stages,
                    activation: *activation,
                }
            }
            LayerOp::Dense {
                factors,
                bias,
                activation,
            } => {
                let mut new_factors = Vec::with_capacity(factors.len());
                for factor in factors {
                    let (weight, count, err) = self.prune(factor)?;
                    pruned += count;
                    error_sq += err;
                    new_factors.push(weight);
                }
                LayerOp::Dense {
                    factors: new_factors,
                    bias: bias.clone(),
                    activation: *activation,
                }
            }
            _ => {
                return Err(EngineError::unsupported(
                    TechniqueKind::MagnitudePruning.name(),
                    layer_name,
                    "layer has no weights",
                ))
            }
        };
        info!(layer = layer_name, pruned, threshold = self.threshold, "pruned weights");
        network.replace_layer(layer_name, op)?;
        let weights_after = network.layer(layer_name)?.parameter_count()?;
        Ok(CompressionStats {
            weights_before,
            weights_after,
            reconstruction_error: error_sq.sqrt(),
        })
    }
}

/// Keeps the strongest `keep_fraction` of the (output, input) channel
/// connections of a convolution, ranked by kernel L2 norm, and zeroes the rest.
#[derive(Clone, Copy, Debug)]
pub struct SparseConnections {
    pub keep_fraction: f32,
}

impl SparseConnections {
    pub fn new(keep_fraction: f32) -> Self {
        Self { keep_fraction }
    }
}

impl<B: Backend> CompressionTechnique<B> for SparseConnections {
    fn name(&self) -> &str {
        TechniqueKind::SparseConnections.name()
    }

    fn supports(&self, kind: LayerKind) -> bool {
        TechniqueKind::SparseConnections.supports(kind)
    }

    fn compress_layer(
        &self,
        network: &mut Network<B>,
        layer_name: &str,
    ) -> Result<CompressionStats, EngineError> {
        let weights_before = network.layer(layer_name)?.parameter_count()?;
        let (stage, activation) =
            single_conv_stage(TechniqueKind::SparseConnections.name(), network, layer_name)?;
        let [out, inp, kh, kw] = stage.weight.dims();
        let kernel = kh * kw;
        let mut values = tensor_to_vec(&stage.weight)?;

        let mut connections: Vec<(usize, f32)> = values
            .chunks(kernel)
            .map(|chunk| chunk.iter().map(|w| w * w).sum::<f32>())
            .enumerate()
            .collect();
        connections.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let keep = ((out * inp) as f32 * self.keep_fraction).ceil() as usize;

        let mut error_sq = 0.0;
        for &(connection, norm_sq) in connections.iter().skip(keep) {
            let start = connection * kernel;
            values[start..start + kernel].fill(0.0);
            error_sq += norm_sq;
        }
        debug!(
            layer = layer_name,
            kept = keep.min(out * inp),
            total = out * inp,
            "sparsified connections"
        );

        let device = stage.weight.device();
        let new_stage = ConvStage {
            weight: tensor_from_vec(values, [out, inp, kh, kw], &device),
            ..stage.clone()
        };
        network.replace_layer(
            layer_name,
            LayerOp::Conv2d {
                stages: vec![new_stage],
                activation,
            },
        )?;
        let weights_after = network.layer(layer_name)?.parameter_count()?;
        Ok(CompressionStats {
            weights_before,
            weights_after,
            reconstruction_error: error_sq.sqrt(),
        })
    }
}
