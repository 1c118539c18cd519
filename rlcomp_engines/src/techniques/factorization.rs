use super::{
    single_conv_stage, single_dense_factor, CompressionStats, CompressionTechnique, TechniqueKind,
};
use crate::error::EngineError;
use crate::network::{tensor_from_vec, tensor_to_vec, ConvStage, LayerOp, Network};
use burn::prelude::*;
use nalgebra::DMatrix;
use rlcomp_core::LayerKind;
use std::cmp::Ordering;
use tracing::info;

/// Rank-`rank` factors of a row-major `rows x cols` matrix: `left * right`, with the
/// singular values folded into `right`.
struct LowRank {
    left: Vec<f32>,
    right: Vec<f32>,
    rank: usize,
    residual: f32,
}

fn truncated_svd(
    data: &[f32],
    rows: usize,
    cols: usize,
    rank: usize,
) -> Result<LowRank, EngineError> {
    if data.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::Linalg(
            "matrix contains non-finite values".to_string(),
        ));
    }
    let matrix = DMatrix::<f64>::from_row_iterator(rows, cols, data.iter().map(|v| *v as f64));
    let svd = matrix.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| EngineError::Linalg("left singular vectors missing".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| EngineError::Linalg("right singular vectors missing".to_string()))?;
    let sigma = svd.singular_values;

    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|a, b| sigma[*b].partial_cmp(&sigma[*a]).unwrap_or(Ordering::Equal));
    let rank = rank.min(order.len());
    let kept = &order[..rank];

    let mut left = Vec::with_capacity(rows * rank);
    for row in 0..rows {
        left.extend(kept.iter().map(|&k| u[(row, k)] as f32));
    }
    let mut right = Vec::with_capacity(rank * cols);
    for &k in kept {
        right.extend((0..cols).map(|col| (sigma[k] * v_t[(k, col)]) as f32));
    }
    let residual = order[rank..]
        .iter()
        .map(|&k| sigma[k] * sigma[k])
        .sum::<f64>()
        .sqrt() as f32;
    Ok(LowRank {
        left,
        right,
        rank,
        residual,
    })
}

/// Replaces a dense `[in, out]` matrix by `[in, units] x [units, out]` factors
/// taken from its truncated SVD.
#[derive(Clone, Copy, Debug)]
pub struct DenseSvd {
    pub units: usize,
}

impl DenseSvd {
    pub fn new(units: usize) -> Self {
        Self { units }
    }
}

impl<B: Backend> CompressionTechnique<B> for DenseSvd {
    fn name(&self) -> &str {
        TechniqueKind::DenseSvd.name()
    }

    fn supports(&self, kind: LayerKind) -> bool {
        TechniqueKind::DenseSvd.supports(kind)
    }

    fn compress_layer(
        &self,
        network: &mut Network<B>,
        layer_name: &str,
    ) -> Result<CompressionStats, EngineError> {
        let weights_before = network.layer(layer_name)?.parameter_count()?;
        let (weight, bias, activation) =
            single_dense_factor(TechniqueKind::DenseSvd.name(), network, layer_name)?;
        let [rows, cols] = weight.dims();
        let low = truncated_svd(&tensor_to_vec(weight)?, rows, cols, self.units)?;
        info!(
            layer = layer_name,
            rank = low.rank,
            residual = low.residual,
            "factorised dense layer"
        );

        let device = weight.device();
        let op = LayerOp::Dense {
            factors: vec![
                tensor_from_vec(low.left, [rows, low.rank], &device),
                tensor_from_vec(low.right, [low.rank, cols], &device),
            ],
            bias: bias.cloned(),
            activation,
        };
        network.replace_layer(layer_name, op)?;
        Ok(CompressionStats {
            weights_before,
            weights_after: network.layer(layer_name)?.parameter_count()?,
            reconstruction_error: low.residual,
        })
    }
}

/// Channel low-rank factorisation of a convolution: a k x k convolution onto
/// `units` basis maps followed by a 1 x 1 convolution mixing them into the
/// original filters.
#[derive(Clone, Copy, Debug)]
pub struct ConvSvd {
    pub units: usize,
}

impl ConvSvd {
    pub fn new(units: usize) -> Self {
        Self { units }
    }
}

impl<B: Backend> CompressionTechnique<B> for ConvSvd {
    fn name(&self) -> &str {
        TechniqueKind::ConvSvd.name()
    }

    fn supports(&self, kind: LayerKind) -> bool {
        TechniqueKind::ConvSvd.supports(kind)
    }

    fn compress_layer(
        &self,
        network: &mut Network<B>,
        layer_name: &str,
    ) -> Result<CompressionStats, EngineError> {
        let weights_before = network.layer(layer_name)?.parameter_count()?;
        let (stage, activation) =
            single_conv_stage(TechniqueKind::ConvSvd.name(), network, layer_name)?;
        let [out, inp, kh, kw] = stage.weight.dims();
        let low = truncated_svd(&tensor_to_vec(&stage.weight)?, out, inp * kh * kw, self.units)?;
        info!(
            layer = layer_name,
            rank = low.rank,
            residual = low.residual,
            "factorised convolution"
        );

        let device = stage.weight.device();
        let basis = ConvStage::new(
            tensor_from_vec(low.right, [low.rank, inp, kh, kw], &device),
            None,
        )
        .with_stride(stage.stride)
        .with_padding(stage.padding);
        let mix = ConvStage::new(
            tensor_from_vec(low.left, [out, low.rank, 1, 1], &device),
            stage.bias.clone(),
        );
        network.replace_layer(
            layer_name,
            LayerOp::Conv2d {
                stages: vec![basis, mix],
                activation,
            },
        )?;
        Ok(CompressionStats {
            weights_before,
            weights_after: network.layer(layer_name)?.parameter_count()?,
            reconstruction_error: low.residual,
        })
    }
}

/// Best depthwise-separable approximation of a convolution: one k x k kernel per
/// input channel, then a 1 x 1 pointwise convolution. Each input channel's
/// `[out, k*k]` slice is replaced by its rank-1 SVD.
#[derive(Clone, Copy, Debug, Default)]
pub struct DepthwiseSeparable;

impl<B: Backend> CompressionTechnique<B> for DepthwiseSeparable {
    fn name(&self) -> &str {
        TechniqueKind::DepthwiseSeparable.name()
    }

    fn supports(&self, kind: LayerKind) -> bool {
        TechniqueKind::DepthwiseSeparable.supports(kind)
    }

    fn compress_layer(
        &self,
        network: &mut Network<B>,
        layer_name: &str,
    ) -> Result<CompressionStats, EngineError> {
        let weights_before = network.layer(layer_name)?.parameter_count()?;
        let (stage, activation) =
            single_conv_stage(TechniqueKind::DepthwiseSeparable.name(), network, layer_name)?;
        let [out, inp, kh, kw] = stage.weight.dims();
        let kernel = kh * kw;
        let values = tensor_to_vec(&stage.weight)?;

        let mut depthwise = vec![0.0f32; inp * kernel];
        let mut pointwise = vec![0.0f32; out * inp];
        let mut error_sq = 0.0f32;
        for channel in 0..inp {
            let mut slice = Vec::with_capacity(out * kernel);
            for filter in 0..out {
                let start = (filter * inp + channel) * kernel;
                slice.extend_from_slice(&values[start..start + kernel]);
            }
            let low = truncated_svd(&slice, out, kernel, 1)?;
            if low.rank == 0 {
                continue;
            }
            depthwise[channel * kernel..(channel + 1) * kernel].copy_from_slice(&low.right);
            for filter in 0..out {
                pointwise[filter * inp + channel] = low.left[filter];
            }
            error_sq += low.residual * low.residual;
        }
        info!(
            layer = layer_name,
            residual = error_sq.sqrt(),
            "separated convolution"
        );

        let device = stage.weight.device();
        let depthwise = ConvStage::new(tensor_from_vec(depthwise, [inp, 1, kh, kw], &device), None)
            .with_stride(stage.stride)
            .with_padding(stage.padding)
            .with_groups(inp);
        let pointwise = ConvStage::new(
            tensor_from_vec(pointwise, [out, inp, 1, 1], &device),
            stage.bias.clone(),
        );
        network.replace_layer(
            layer_name,
            LayerOp::Conv2d {
                stages: vec![depthwise, pointwise],
                activation,
            },
        )?;
        Ok(CompressionStats {
            weights_before,
            weights_after: network.layer(layer_name)?.parameter_count()?,
            reconstruction_error: error_sq.sqrt(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::network::{ActivationFn, Layer};

    fn outputs(network: &Network<TestBackend>) -> Vec<f32> {
        tensor_to_vec(&network.forward(input()).unwrap()).unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-3, "{x} vs {y}");
        }
    }

    #[test]
    fn svd_factors_reconstruct_at_full_rank() {
        let data = ramp(12, 1.0);
        let low = truncated_svd(&data, 3, 4, 3).unwrap();
        for row in 0..3 {
            for col in 0..4 {
                let value: f32 = (0..3)
                    .map(|k| low.left[row * 3 + k] * low.right[k * 4 + col])
                    .sum();
                assert!((value - data[row * 4 + col]).abs() < 1e-4);
            }
        }
        assert!(low.residual < 1e-4);
    }

    #[test]
    fn full_rank_dense_svd_preserves_outputs() {
        let mut network = network();
        let before = outputs(&network);
        DenseSvd::new(6)
            .compress_layer(&mut network, "dense")
            .unwrap();
        assert_close(&before, &outputs(&network));
    }

    #[test]
    fn low_rank_dense_svd_shrinks_the_layer() {
        let mut network = network();
        let stats = DenseSvd::new(2)
            .compress_layer(&mut network, "dense")
            .unwrap();
        // 64*6 + 6 bias -> 64*2 + 2*6 + 6 bias
        assert_eq!(stats.weights_before, 390);
        assert_eq!(stats.weights_after, 146);
        assert!(stats.reconstruction_error > 0.0);
    }

    #[test]
    fn dense_svd_refuses_a_second_pass() {
        let mut network = network();
        DenseSvd::new(2)
            .compress_layer(&mut network, "dense")
            .unwrap();
        let err = DenseSvd::new(2)
            .compress_layer(&mut network, "dense")
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedLayer { .. }));
    }

    #[test]
    fn full_rank_conv_svd_preserves_outputs() {
        let mut network = network();
        let before = outputs(&network);
        ConvSvd::new(4).compress_layer(&mut network, "conv").unwrap();
        assert_close(&before, &outputs(&network));
    }

    #[test]
    fn depthwise_separable_shrinks_the_convolution() {
        let mut network = network();
        let stats = DepthwiseSeparable
            .compress_layer(&mut network, "conv")
            .unwrap();
        // 4*2*9 + 4 bias -> 2*9 depthwise + 4*2 pointwise + 4 bias
        assert_eq!(stats.weights_before, 76);
        assert_eq!(stats.weights_after, 30);
        assert_eq!(network.forward(input()).unwrap().dims(), [3, 3]);
    }

    #[test]
    fn depthwise_separable_is_exact_for_separable_kernels() {
        let device = Default::default();
        let (out, inp) = (3, 2);
        let depth = [ramp(9, 1.0), ramp(9, -0.5)];
        let mut weight = Vec::with_capacity(out * inp * 9);
        for filter in 0..out {
            for channel in 0..inp {
                let scale = 0.5 + filter as f32 - channel as f32 * 0.3;
                weight.extend(depth[channel].iter().map(|v| v * scale));
            }
        }
        let mut network = Network::<TestBackend>::new(
            [2, 5, 5],
            vec![
                Layer::new(
                    "conv",
                    LayerOp::Conv2d {
                        stages: vec![ConvStage::new(
                            tensor_from_vec(weight, [out, inp, 3, 3], &device),
                            None,
                        )],
                        activation: ActivationFn::Linear,
                    },
                ),
                Layer::new("flatten", LayerOp::Flatten),
            ],
        )
        .unwrap();
        let input = tensor_from_vec::<TestBackend, 4>(ramp(2 * 25, 1.0), [1, 2, 5, 5], &device);
        let before = tensor_to_vec(&network.forward(input.clone()).unwrap()).unwrap();
        let stats = DepthwiseSeparable
            .compress_layer(&mut network, "conv")
            .unwrap();
        assert!(stats.reconstruction_error < 1e-3);
        let after = tensor_to_vec(&network.forward(input).unwrap()).unwrap();
        assert_close(&before, &after);
    }
}
