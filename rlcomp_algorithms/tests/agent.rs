mod common;

use common::{environment, identity_config, observation, B};
use rlcomp_algorithms::{checkpoint_path, AgentConfig, AgentSet, LayerAgent};
use rlcomp_core::{CompressionError, Environment, LayerKind, UsageError};
use rlcomp_engines::TechniqueKind;
use rlcomp_envs::EnvironmentConfig;
use std::path::Path;

fn conv_agent(epsilon: f64) -> LayerAgent<B> {
    let config = AgentConfig::new().with_epsilon(epsilon).with_seed(3);
    LayerAgent::new(LayerKind::Convolutional, 6, 3, &config, &Default::default()).unwrap()
}

fn batch(kind: LayerKind, rows: usize, width: usize) -> Vec<rlcomp_core::Observation> {
    (0..rows)
        .map(|row| {
            observation(
                kind,
                (0..width)
                    .map(|i| ((row * width + i) as f32 * 0.7).sin())
                    .collect(),
            )
        })
        .collect()
}

#[test]
fn scores_one_row_per_observation() {
    let agent = conv_agent(0.0);
    let values = agent
        .score(&batch(LayerKind::Convolutional, 4, 6))
        .unwrap();
    assert_eq!(values.len(), 4);
    assert!(values.iter().all(|row| row.len() == 3));
    assert!(agent.score(&[]).unwrap().is_empty());
}

#[test]
fn greedy_selection_is_deterministic() {
    let agent = conv_agent(0.5);
    let observations = batch(LayerKind::Convolutional, 5, 6);
    let values = agent.score(&observations).unwrap();
    assert_eq!(values, agent.score(&observations).unwrap());

    let first = agent.select_greedy(&values).unwrap();
    let second = agent.select_greedy(&values).unwrap();
    assert_eq!(first, second);
    for (action, row) in first.iter().zip(&values) {
        assert_eq!(action.kind, LayerKind::Convolutional);
        assert!(row.iter().all(|v| *v <= row[action.index]));
    }
}

#[test]
fn exploration_without_epsilon_is_greedy() {
    let mut agent = conv_agent(0.0);
    let values = vec![vec![0.1, 0.9, 0.3], vec![2.0, -1.0, 0.0], vec![0.0, 0.0, 5.0]];
    for _ in 0..10 {
        assert_eq!(
            agent.select_exploratory(&values).unwrap(),
            agent.select_greedy(&values).unwrap()
        );
    }
}

#[test]
fn full_exploration_stays_in_range() {
    let mut agent = conv_agent(1.0);
    let values = vec![vec![0.0, 1.0, 0.0]; 50];
    let actions = agent.select_exploratory(&values).unwrap();
    assert!(actions.iter().all(|a| a.index < 3));
    assert!(actions.iter().any(|a| a.index != 1));
}

#[test]
fn wrong_width_value_rows_fail() {
    let mut agent = conv_agent(0.0);
    let fc_rows = vec![vec![0.0, 0.0, 0.0, 0.0, 9.0]];
    let err = agent.select_greedy(&fc_rows).unwrap_err();
    assert!(matches!(
        err,
        CompressionError::Usage(UsageError::ValueWidth {
            kind: LayerKind::Convolutional,
            expected: 3,
            found: 5,
        })
    ));
    assert!(agent.select_exploratory(&fc_rows).is_err());
}

#[test]
fn observations_of_the_other_layer_type_fail() {
    let agent = conv_agent(0.0);
    let err = agent
        .score(&batch(LayerKind::FullyConnected, 1, 6))
        .unwrap_err();
    assert!(matches!(
        err,
        CompressionError::Usage(UsageError::ObservationKindMismatch {
            agent: LayerKind::Convolutional,
            found: LayerKind::FullyConnected,
        })
    ));
}

#[test]
fn observations_of_the_wrong_length_fail() {
    let agent = conv_agent(0.0);
    let err = agent
        .score(&batch(LayerKind::Convolutional, 1, 5))
        .unwrap_err();
    assert!(matches!(
        err,
        CompressionError::Usage(UsageError::ObservationShape {
            expected: 6,
            found: 5,
        })
    ));
}

#[test]
fn there_is_no_agent_for_other_layers() {
    let err = LayerAgent::<B>::new(
        LayerKind::Other,
        4,
        2,
        &AgentConfig::new(),
        &Default::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(
        err,
        CompressionError::Usage(UsageError::NoAgent(LayerKind::Other))
    ));

    let env = environment(identity_config());
    let agents = AgentSet::<B>::init(&env, &AgentConfig::new(), &Default::default()).unwrap();
    assert!(agents.agent_for(LayerKind::Other).is_err());
    assert_eq!(
        agents.agent_for(LayerKind::FullyConnected).unwrap().kind(),
        LayerKind::FullyConnected
    );
}

#[test]
fn agents_are_sized_after_the_environment() {
    let env = environment(EnvironmentConfig::new(
        vec![TechniqueKind::Identity, TechniqueKind::ConvSvd, TechniqueKind::DepthwiseSeparable],
        vec![TechniqueKind::Identity, TechniqueKind::MagnitudePruning],
    ));
    let agents = AgentSet::<B>::init(&env, &AgentConfig::new(), &Default::default()).unwrap();
    assert_eq!(agents.conv.num_actions(), 3);
    assert_eq!(agents.fc.num_actions(), 2);
    assert_eq!(
        agents.conv.input_dim(),
        env.observation_size(LayerKind::Convolutional)
    );
    assert_eq!(
        agents.fc.input_dim(),
        env.observation_size(LayerKind::FullyConnected)
    );
    agents.check_compatible(&env).unwrap();
}

#[test]
fn missing_checkpoint_is_a_missing_resource() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint_path(dir.path(), "synthetic", LayerKind::Convolutional);
    let err = conv_agent(0.0).load(&path).err().unwrap();
    assert!(matches!(err, CompressionError::MissingResource { .. }));
    assert!(!err.is_episode_local());
}

#[test]
fn checkpoint_path_layout() {
    let path = checkpoint_path(Path::new("ckpt"), "cifar", LayerKind::FullyConnected);
    assert_eq!(path, Path::new("ckpt/cifar/fc_agent.mpk"));
}

#[test]
fn saved_agents_load_back_with_identical_scores() {
    let dir = tempfile::tempdir().unwrap();
    let env = environment(identity_config());
    let device = Default::default();
    let trained = AgentSet::<B>::init(&env, &AgentConfig::new().with_seed(11), &device).unwrap();
    trained.save(dir.path(), "synthetic").unwrap();
    assert!(checkpoint_path(dir.path(), "synthetic", LayerKind::Convolutional).is_file());

    let fresh = AgentSet::<B>::init(&env, &AgentConfig::new().with_seed(12), &device).unwrap();
    let restored = fresh.load(dir.path(), "synthetic").unwrap();

    let conv = batch(
        LayerKind::Convolutional,
        3,
        env.observation_size(LayerKind::Convolutional),
    );
    let fc = batch(
        LayerKind::FullyConnected,
        3,
        env.observation_size(LayerKind::FullyConnected),
    );
    let close = |a: Vec<Vec<f32>>, b: Vec<Vec<f32>>| {
        a.iter()
            .flatten()
            .zip(b.iter().flatten())
            .all(|(x, y)| (x - y).abs() < 1e-6)
    };
    assert!(close(
        trained.conv.score(&conv).unwrap(),
        restored.conv.score(&conv).unwrap()
    ));
    assert!(close(
        trained.fc.score(&fc).unwrap(),
        restored.fc.score(&fc).unwrap()
    ));
}
