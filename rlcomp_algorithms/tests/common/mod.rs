#![allow(dead_code)]

use burn::backend::NdArray;
use rlcomp_core::{
    Action, LayerKind, Observation, StepInfo, StepResult, Trajectory, Transition,
};
use rlcomp_engines::{DataSplits, Network, SmallConvNetConfig, SyntheticDataConfig, TechniqueKind};
use rlcomp_envs::{CompressionEnvironment, EnvironmentConfig};

pub type B = NdArray;

pub fn fixture() -> (Network<B>, DataSplits<B>) {
    let device = Default::default();
    let network = SmallConvNetConfig::new()
        .with_image_size(8)
        .with_filters(4)
        .with_hidden(8)
        .init::<B>(&device)
        .unwrap();
    let data = SyntheticDataConfig::new()
        .with_train_batches(1)
        .with_validation_batches(1)
        .with_test_batches(1)
        .with_batch_size(8)
        .generate(&network, &device)
        .unwrap();
    (network, data)
}

pub fn environment(config: EnvironmentConfig) -> CompressionEnvironment<B> {
    let (network, data) = fixture();
    CompressionEnvironment::new(network, data, config).unwrap()
}

pub fn identity_config() -> EnvironmentConfig {
    EnvironmentConfig::new(vec![TechniqueKind::Identity], vec![TechniqueKind::Identity])
}

pub fn observation(kind: LayerKind, data: Vec<f32>) -> Observation {
    Observation {
        kind,
        layer: "layer".to_string(),
        data,
    }
}

pub fn transition(
    weights_before: usize,
    weights_after: usize,
    acc_before: f32,
    acc_after: f32,
) -> Transition {
    let obs = observation(LayerKind::FullyConnected, vec![0.0; 4]);
    Transition::new(
        obs.clone(),
        Action::new(LayerKind::FullyConnected, 0),
        StepResult {
            observation: obs,
            reward: 0.0,
            done: false,
            truncated: false,
            info: StepInfo {
                layer: "layer".to_string(),
                technique: "identity".to_string(),
                weights_before,
                weights_after,
                acc_before,
                acc_after,
                splits: None,
            },
        },
    )
}

pub fn trajectory(transitions: Vec<Transition>) -> Trajectory {
    let mut trajectory = Trajectory::new();
    for transition in transitions {
        trajectory.push(transition);
    }
    trajectory
}
