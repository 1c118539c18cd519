//! A dynamic sequential network.
//!
//! Layers are plain tensors driven through burn's functional ops, so a
//! compression technique can swap a layer for one of a different structure at
//! runtime. Every structural change is re-validated against the input shape
//! before it is accepted.

use crate::dataset::Batch;
use crate::error::EngineError;
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use burn::tensor::module::{conv2d, max_pool2d};
use burn::tensor::ops::ConvOptions;
use burn::tensor::TensorData;
use rlcomp_core::LayerKind;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFn {
    Linear,
    Relu,
    Softmax,
}

/// One convolution stage. `weight` is `[out, in / groups, k_h, k_w]`.
#[derive(Clone, Debug)]
pub struct ConvStage<B: Backend> {
    pub weight: Tensor<B, 4>,
    pub bias: Option<Tensor<B, 1>>,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl<B: Backend> ConvStage<B> {
    pub fn new(weight: Tensor<B, 4>, bias: Option<Tensor<B, 1>>) -> Self {
        Self {
            weight,
            bias,
            stride: 1,
            padding: 0,
            groups: 1,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let options = ConvOptions::new(
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            self.groups,
        );
        conv2d(x, self.weight.clone(), self.bias.clone(), options)
    }
}

#[derive(Clone, Debug)]
pub enum LayerOp<B: Backend> {
    /// Convolution stages applied back to back; the activation follows the last one.
    /// An untouched convolution has a single stage.
    Conv2d {
        stages: Vec<ConvStage<B>>,
        activation: ActivationFn,
    },
    /// Matrix factors multiplied in order (`[in, r] x [r, out]`), then bias and activation.
    Dense {
        factors: Vec<Tensor<B, 2>>,
        bias: Option<Tensor<B, 1>>,
        activation: ActivationFn,
    },
    MaxPool2d {
        kernel: usize,
        stride: usize,
    },
    Flatten,
}

impl<B: Backend> LayerOp<B> {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerOp::Conv2d { .. } => LayerKind::Convolutional,
            LayerOp::Dense { .. } => LayerKind::FullyConnected,
            LayerOp::MaxPool2d { .. } | LayerOp::Flatten => LayerKind::Other,
        }
    }

    fn weight_tensors(&self) -> Vec<TensorRef<'_, B>> {
        match self {
            LayerOp::Conv2d { stages, .. } => stages
                .iter()
                .flat_map(|stage| {
                    std::iter::once(TensorRef::Four(&stage.weight))
                        .chain(stage.bias.iter().map(TensorRef::One))
                })
                .collect(),
            LayerOp::Dense { factors, bias, .. } => factors
                .iter()
                .map(TensorRef::Two)
                .chain(bias.iter().map(TensorRef::One))
                .collect(),
            LayerOp::MaxPool2d { .. } | LayerOp::Flatten => Vec::new(),
        }
    }
}

enum TensorRef<'a, B: Backend> {
    One(&'a Tensor<B, 1>),
    Two(&'a Tensor<B, 2>),
    Four(&'a Tensor<B, 4>),
}

impl<B: Backend> TensorRef<'_, B> {
    fn values(&self) -> Result<Vec<f32>, EngineError> {
        match self {
            TensorRef::One(t) => tensor_to_vec(*t),
            TensorRef::Two(t) => tensor_to_vec(*t),
            TensorRef::Four(t) => tensor_to_vec(*t),
        }
    }

    fn len(&self) -> usize {
        match self {
            TensorRef::One(t) => t.dims().iter().product(),
            TensorRef::Two(t) => t.dims().iter().product(),
            TensorRef::Four(t) => t.dims().iter().product(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Layer<B: Backend> {
    pub name: String,
    pub op: LayerOp<B>,
}

impl<B: Backend> Layer<B> {
    pub fn new(name: impl Into<String>, op: LayerOp<B>) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.op.kind()
    }

    /// Weights and biases stored by the layer, zeros included.
    pub fn stored_parameters(&self) -> usize {
        self.op.weight_tensors().iter().map(TensorRef::len).sum()
    }

    /// Non-zero weights and biases. Pruned entries do not count.
    pub fn parameter_count(&self) -> Result<usize, EngineError> {
        let mut count = 0;
        for tensor in self.op.weight_tensors() {
            count += tensor.values()?.iter().filter(|v| **v != 0.0).count();
        }
        Ok(count)
    }
}

/// Per-example activation shape, batch dimension excluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeSpec {
    Spatial([usize; 3]),
    Flat(usize),
}

/// Activations flowing between layers.
#[derive(Clone, Debug)]
pub enum Activations<B: Backend> {
    Spatial(Tensor<B, 4>),
    Flat(Tensor<B, 2>),
}

impl<B: Backend> Activations<B> {
    pub fn values(&self) -> Result<Vec<f32>, EngineError> {
        match self {
            Activations::Spatial(t) => tensor_to_vec(t),
            Activations::Flat(t) => tensor_to_vec(t),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Network<B: Backend> {
    input_shape: [usize; 3],
    layers: Vec<Layer<B>>,
}

impl<B: Backend> Network<B> {
    /// Builds a network over `[channels, height, width]` inputs.
    pub fn new(input_shape: [usize; 3], layers: Vec<Layer<B>>) -> Result<Self, EngineError> {
        for (index, layer) in layers.iter().enumerate() {
            if layers[..index].iter().any(|l| l.name == layer.name) {
                return Err(EngineError::DuplicateLayer(layer.name.clone()));
            }
        }
        let network = Self {
            input_shape,
            layers,
        };
        network.output_shapes()?;
        Ok(network)
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    pub fn layers(&self) -> &[Layer<B>] {
        &self.layers
    }

    pub fn layer_index(&self, name: &str) -> Result<usize, EngineError> {
        self.layers
            .iter()
            .position(|layer| layer.name == name)
            .ok_or_else(|| EngineError::LayerNotFound(name.to_string()))
    }

    pub fn layer(&self, name: &str) -> Result<&Layer<B>, EngineError> {
        let index = self.layer_index(name)?;
        Ok(&self.layers[index])
    }

    /// Replaces the op of a named layer. The swap is rejected, and the old op kept,
    /// when the new structure no longer fits its neighbours.
    pub fn replace_layer(&mut self, name: &str, op: LayerOp<B>) -> Result<(), EngineError> {
        let index = self.layer_index(name)?;
        let previous = std::mem::replace(&mut self.layers[index].op, op);
        if let Err(err) = self.output_shapes() {
            self.layers[index].op = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Non-zero trainable parameters of the whole network.
    pub fn parameter_count(&self) -> Result<usize, EngineError> {
        let mut total = 0;
        for layer in &self.layers {
            total += layer.parameter_count()?;
        }
        Ok(total)
    }

    /// Output shape of every layer, in order.
    pub fn output_shapes(&self) -> Result<Vec<ShapeSpec>, EngineError> {
        let mut shape = ShapeSpec::Spatial(self.input_shape);
        let mut shapes = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            shape = infer_shape(layer, shape)?;
            shapes.push(shape);
        }
        Ok(shapes)
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>, EngineError> {
        self.check_input(&input)?;
        let mut x = Activations::Spatial(input);
        for layer in &self.layers {
            x = forward_layer(layer, x)?;
        }
        match x {
            Activations::Flat(logits) => Ok(logits),
            Activations::Spatial(_) => Err(EngineError::shape(
                self.layers.last().map(|l| l.name.as_str()).unwrap_or("<input>"),
                "network output is not flat",
            )),
        }
    }

    /// Runs the network up to and including `index`, returning that layer's
    /// input and output activations.
    pub fn capture(
        &self,
        input: Tensor<B, 4>,
        index: usize,
    ) -> Result<(Activations<B>, Activations<B>), EngineError> {
        self.check_input(&input)?;
        let mut x = Activations::Spatial(input);
        for (position, layer) in self.layers.iter().enumerate() {
            if position == index {
                let output = forward_layer(layer, x.clone())?;
                return Ok((x, output));
            }
            x = forward_layer(layer, x)?;
        }
        Err(EngineError::LayerNotFound(format!("#{index}")))
    }

    pub fn predict(&self, input: Tensor<B, 4>) -> Result<Vec<usize>, EngineError> {
        let logits = self.forward(input)?;
        let predictions = logits
            .argmax(1)
            .into_data()
            .convert::<i64>()
            .into_vec::<i64>()
            .map_err(|err| EngineError::Tensor(format!("{err:?}")))?;
        Ok(predictions.into_iter().map(|p| p as usize).collect())
    }

    /// Fraction of correctly classified examples over all batches.
    pub fn accuracy(&self, batches: &[Batch<B>]) -> Result<f32, EngineError> {
        let mut correct = 0usize;
        let mut total = 0usize;
        for batch in batches {
            let predictions = self.predict(batch.inputs.clone())?;
            correct += predictions
                .iter()
                .zip(batch.labels.iter())
                .filter(|(p, l)| p == l)
                .count();
            total += batch.labels.len();
        }
        if total == 0 {
            return Err(EngineError::EmptySplit("evaluation".to_string()));
        }
        Ok(correct as f32 / total as f32)
    }

    fn check_input(&self, input: &Tensor<B, 4>) -> Result<(), EngineError> {
        let [_, c, h, w] = input.dims();
        if [c, h, w] != self.input_shape {
            return Err(EngineError::shape(
                "<input>",
                format!("expected {:?}, got {:?}", self.input_shape, [c, h, w]),
            ));
        }
        Ok(())
    }
}

fn infer_shape<B: Backend>(layer: &Layer<B>, input: ShapeSpec) -> Result<ShapeSpec, EngineError> {
    let name = layer.name.as_str();
    match (&layer.op, input) {
        (LayerOp::Conv2d { stages, .. }, ShapeSpec::Spatial(mut shape)) => {
            if stages.is_empty() {
                return Err(EngineError::shape(name, "convolution without stages"));
            }
            for stage in stages {
                shape = conv_output_shape(name, stage, shape)?;
            }
            Ok(ShapeSpec::Spatial(shape))
        }
        (LayerOp::Dense { factors, bias, .. }, ShapeSpec::Flat(mut width)) => {
            if factors.is_empty() {
                return Err(EngineError::shape(name, "dense layer without factors"));
            }
            for factor in factors {
                let [rows, cols] = factor.dims();
                if rows != width {
                    return Err(EngineError::shape(
                        name,
                        format!("factor expects {rows} inputs, got {width}"),
                    ));
                }
                width = cols;
            }
            if let Some(bias) = bias {
                let [len] = bias.dims();
                if len != width {
                    return Err(EngineError::shape(
                        name,
                        format!("bias of length {len} for {width} outputs"),
                    ));
                }
            }
            Ok(ShapeSpec::Flat(width))
        }
        (LayerOp::MaxPool2d { kernel, stride }, ShapeSpec::Spatial([c, h, w])) => {
            if *kernel == 0 || *stride == 0 || h < *kernel || w < *kernel {
                return Err(EngineError::shape(
                    name,
                    format!("pool {kernel}/{stride} does not fit {h}x{w}"),
                ));
            }
            Ok(ShapeSpec::Spatial([
                c,
                (h - kernel) / stride + 1,
                (w - kernel) / stride + 1,
            ]))
        }
        (LayerOp::Flatten, ShapeSpec::Spatial([c, h, w])) => Ok(ShapeSpec::Flat(c * h * w)),
        (LayerOp::Flatten, flat @ ShapeSpec::Flat(_)) => Ok(flat),
        (LayerOp::Dense { .. }, ShapeSpec::Spatial(shape)) => Err(EngineError::shape(
            name,
            format!("dense layer fed spatial activations {shape:?}"),
        )),
        (_, ShapeSpec::Flat(width)) => Err(EngineError::shape(
            name,
            format!("spatial layer fed flat activations of width {width}"),
        )),
    }
}

fn conv_output_shape<B: Backend>(
    name: &str,
    stage: &ConvStage<B>,
    [c, h, w]: [usize; 3],
) -> Result<[usize; 3], EngineError> {
    let [out, in_per_group, kh, kw] = stage.weight.dims();
    if stage.groups == 0 || stage.stride == 0 {
        return Err(EngineError::shape(name, "groups and stride must be positive"));
    }
    if in_per_group * stage.groups != c || out % stage.groups != 0 {
        return Err(EngineError::shape(
            name,
            format!(
                "kernel {:?} with {} groups does not accept {c} channels",
                stage.weight.dims(),
                stage.groups
            ),
        ));
    }
    if let Some(bias) = &stage.bias {
        let [len] = bias.dims();
        if len != out {
            return Err(EngineError::shape(
                name,
                format!("bias of length {len} for {out} filters"),
            ));
        }
    }
    let (ph, pw) = (h + 2 * stage.padding, w + 2 * stage.padding);
    if ph < kh || pw < kw {
        return Err(EngineError::shape(
            name,
            format!("kernel {kh}x{kw} larger than padded input {ph}x{pw}"),
        ));
    }
    Ok([
        out,
        (ph - kh) / stage.stride + 1,
        (pw - kw) / stage.stride + 1,
    ])
}

fn forward_layer<B: Backend>(
    layer: &Layer<B>,
    x: Activations<B>,
) -> Result<Activations<B>, EngineError> {
    match (&layer.op, x) {
        (LayerOp::Conv2d { stages, activation }, Activations::Spatial(mut x)) => {
            for stage in stages {
                x = stage.forward(x);
            }
            Ok(Activations::Spatial(activate4(x, *activation)))
        }
        (
            LayerOp::Dense {
                factors,
                bias,
                activation,
            },
            Activations::Flat(mut x),
        ) => {
            for factor in factors {
                x = x.matmul(factor.clone());
            }
            if let Some(bias) = bias {
                x = x + bias.clone().unsqueeze::<2>();
            }
            Ok(Activations::Flat(activate2(x, *activation)))
        }
        (LayerOp::MaxPool2d { kernel, stride }, Activations::Spatial(x)) => {
            Ok(Activations::Spatial(max_pool2d(
                x,
                [*kernel, *kernel],
                [*stride, *stride],
                [0, 0],
                [1, 1],
            )))
        }
        (LayerOp::Flatten, Activations::Spatial(x)) => Ok(Activations::Flat(x.flatten::<2>(1, 3))),
        (LayerOp::Flatten, flat @ Activations::Flat(_)) => Ok(flat),
        _ => Err(EngineError::shape(
            layer.name.as_str(),
            "activation rank does not match layer type",
        )),
    }
}

fn activate4<B: Backend>(x: Tensor<B, 4>, activation: ActivationFn) -> Tensor<B, 4> {
    match activation {
        ActivationFn::Linear => x,
        ActivationFn::Relu => relu(x),
        ActivationFn::Softmax => softmax(x, 1),
    }
}

fn activate2<B: Backend>(x: Tensor<B, 2>, activation: ActivationFn) -> Tensor<B, 2> {
    match activation {
        ActivationFn::Linear => x,
        ActivationFn::Relu => relu(x),
        ActivationFn::Softmax => softmax(x, 1),
    }
}

pub fn tensor_to_vec<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
) -> Result<Vec<f32>, EngineError> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .into_vec::<f32>()
        .map_err(|err| EngineError::Tensor(format!("{err:?}")))
}

pub fn tensor_from_vec<B: Backend, const D: usize>(
    data: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::from_data(TensorData::new(data, shape), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn dense(rows: usize, cols: usize, value: f32) -> LayerOp<TestBackend> {
        let device = Default::default();
        LayerOp::Dense {
            factors: vec![tensor_from_vec(vec![value; rows * cols], [rows, cols], &device)],
            bias: Some(tensor_from_vec(vec![0.0; cols], [cols], &device)),
            activation: ActivationFn::Linear,
        }
    }

    fn conv(out: usize, inp: usize, k: usize) -> LayerOp<TestBackend> {
        let device = Default::default();
        LayerOp::Conv2d {
            stages: vec![ConvStage::new(
                tensor_from_vec(vec![0.1; out * inp * k * k], [out, inp, k, k], &device),
                Some(tensor_from_vec(vec![0.0; out], [out], &device)),
            )],
            activation: ActivationFn::Relu,
        }
    }

    fn small() -> Network<TestBackend> {
        Network::new(
            [1, 6, 6],
            vec![
                Layer::new("conv", conv(2, 1, 3)),
                Layer::new("pool", LayerOp::MaxPool2d { kernel: 2, stride: 2 }),
                Layer::new("flatten", LayerOp::Flatten),
                Layer::new("dense", dense(8, 3, 0.5)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn infers_shapes_through_every_layer() {
        let network = small();
        let shapes = network.output_shapes().unwrap();
        assert_eq!(
            shapes,
            vec![
                ShapeSpec::Spatial([2, 4, 4]),
                ShapeSpec::Spatial([2, 2, 2]),
                ShapeSpec::Flat(8),
                ShapeSpec::Flat(3),
            ]
        );
    }

    #[test]
    fn counts_non_zero_parameters() {
        let network = small();
        // conv: 2*1*3*3 weights; dense: 8*3 weights, biases are zero
        assert_eq!(network.parameter_count().unwrap(), 18 + 24);
        assert_eq!(network.layers()[3].stored_parameters(), 24 + 3);
    }

    #[test]
    fn forward_produces_one_row_per_example() {
        let network = small();
        let device = Default::default();
        let input = tensor_from_vec::<TestBackend, 4>(vec![1.0; 2 * 36], [2, 1, 6, 6], &device);
        let logits = network.forward(input).unwrap();
        assert_eq!(logits.dims(), [2, 3]);
    }

    #[test]
    fn rejects_replacement_that_breaks_the_next_layer() {
        let mut network = small();
        let err = network.replace_layer("conv", conv(3, 1, 3)).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
        // the old op is kept
        assert_eq!(network.output_shapes().unwrap()[0], ShapeSpec::Spatial([2, 4, 4]));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Network::<TestBackend>::new(
            [1, 6, 6],
            vec![
                Layer::new("flatten", LayerOp::Flatten),
                Layer::new("flatten", LayerOp::Flatten),
            ],
        )
        .unwrap_err();
        assert_eq!(err, EngineError::DuplicateLayer("flatten".to_string()));
    }

    #[test]
    fn capture_returns_layer_input_and_output() {
        let network = small();
        let device = Default::default();
        let input = tensor_from_vec::<TestBackend, 4>(vec![1.0; 36], [1, 1, 6, 6], &device);
        let (before, after) = network.capture(input, 3).unwrap();
        assert_eq!(before.values().unwrap().len(), 8);
        assert_eq!(after.values().unwrap().len(), 3);
    }

    #[test]
    fn unknown_layer_is_reported() {
        let network = small();
        assert_eq!(
            network.layer("missing").unwrap_err(),
            EngineError::LayerNotFound("missing".to_string())
        );
    }
}
