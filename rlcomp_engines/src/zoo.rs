use crate::error::EngineError;
use crate::network::{tensor_from_vec, ActivationFn, ConvStage, Layer, LayerOp, Network};
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Two convolutions, a pooling stage and three dense layers, named the way the
/// compression configs refer to them.
#[derive(Config, Debug)]
pub struct SmallConvNetConfig {
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 12)]
    pub image_size: usize,
    #[config(default = 8)]
    pub filters: usize,
    #[config(default = 3)]
    pub kernel: usize,
    #[config(default = 32)]
    pub hidden: usize,
    #[config(default = 4)]
    pub num_classes: usize,
    #[config(default = 7)]
    pub seed: u64,
}

impl SmallConvNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Network<B>, EngineError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut he = |fan_in: usize, len: usize| -> Result<Vec<f32>, EngineError> {
            let normal = Normal::new(0.0f64, (2.0 / fan_in.max(1) as f64).sqrt())
                .map_err(|err| EngineError::InvalidParameter {
                    technique: "he_init".to_string(),
                    reason: err.to_string(),
                })?;
            Ok((0..len).map(|_| normal.sample(&mut rng) as f32).collect())
        };

        let (c, f, k) = (self.channels, self.filters, self.kernel);
        let conv = |weights: Vec<f32>, inputs: usize| LayerOp::Conv2d {
            stages: vec![ConvStage::new(
                tensor_from_vec(weights, [f, inputs, k, k], device),
                Some(tensor_from_vec(vec![0.01; f], [f], device)),
            )],
            activation: ActivationFn::Relu,
        };
        let dense = |weights: Vec<f32>, rows: usize, cols: usize, activation| LayerOp::Dense {
            factors: vec![tensor_from_vec(weights, [rows, cols], device)],
            bias: Some(tensor_from_vec(vec![0.01; cols], [cols], device)),
            activation,
        };

        if k == 0 {
            return Err(EngineError::InvalidParameter {
                technique: "small_convnet".to_string(),
                reason: "kernel size must be positive".to_string(),
            });
        }
        if self.image_size < 2 * (k - 1) + 2 {
            return Err(EngineError::InvalidParameter {
                technique: "small_convnet".to_string(),
                reason: format!("image size {} too small for kernel {k}", self.image_size),
            });
        }
        let spatial = (self.image_size - 2 * (k - 1)) / 2;
        let flat = f * spatial * spatial;
        let (hidden, classes) = (self.hidden, self.num_classes);

        let conv_0 = conv(he(c * k * k, f * c * k * k)?, c);
        let conv_1 = conv(he(f * k * k, f * f * k * k)?, f);
        let dense_0 = dense(he(flat, flat * hidden)?, flat, hidden, ActivationFn::Relu);
        let dense_1 = dense(he(hidden, hidden * hidden)?, hidden, hidden, ActivationFn::Relu);
        let head = dense(
            he(hidden, hidden * classes)?,
            hidden,
            classes,
            ActivationFn::Softmax,
        );

        Network::new(
            [c, self.image_size, self.image_size],
            vec![
                Layer::new("conv2d_0", conv_0),
                Layer::new("conv2d_1", conv_1),
                Layer::new("max_pool", LayerOp::MaxPool2d { kernel: 2, stride: 2 }),
                Layer::new("flatten", LayerOp::Flatten),
                Layer::new("dense_0", dense_0),
                Layer::new("dense_1", dense_1),
                Layer::new("dense_softmax", head),
            ],
        )
    }
}
