use crate::config::EnvironmentConfig;
use burn::prelude::*;
use rlcomp_core::{
    Action, ActionSpace, CompressionError, Environment, LayerDescriptor, LayerKind, Observation,
    Result, SplitAccuracy, SplitEvaluation, StateRole, StateSource, StepInfo, StepResult,
    UsageError,
};
use rlcomp_engines::features::{activation_features, MOMENT_FEATURES};
use rlcomp_engines::{
    Batch, CompressionTechnique, DataSplits, EngineError, Network, Split, TechniqueKind,
    TechniqueParams,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
struct ModelStats {
    weights: usize,
    accuracy: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finished,
    Aborted,
}

/// Drives one network through the ordered sequence of compressible layers.
///
/// The environment owns its network exclusively. `reset` restores it from an
/// in-memory copy of the baseline taken at construction, so every episode
/// starts from identical weights.
pub struct CompressionEnvironment<B: Backend> {
    config: EnvironmentConfig,
    baseline: Network<B>,
    network: Network<B>,
    data: DataSplits<B>,
    sample_batch: Tensor<B, 4>,
    layers: Vec<LayerDescriptor>,
    network_indices: Vec<usize>,
    conv_space: ActionSpace,
    fc_space: ActionSpace,
    /// `[sequence position][action index]`
    techniques: Vec<Vec<Box<dyn CompressionTechnique<B>>>>,
    baseline_stats: ModelStats,
    baseline_splits: SplitAccuracy,
    current_stats: ModelStats,
    cursor: usize,
    last_compressed: Option<usize>,
    phase: Phase,
}

impl<B: Backend> CompressionEnvironment<B> {
    /// Validates `config` against `network` and resolves every technique the
    /// episode can reach. All configuration errors surface here.
    pub fn new(
        network: Network<B>,
        data: DataSplits<B>,
        config: EnvironmentConfig,
    ) -> Result<Self> {
        let (layers, network_indices) = resolve_sequence(&network, &config)?;

        let conv_space = action_space(LayerKind::Convolutional, &config.conv_actions)?;
        let fc_space = action_space(LayerKind::FullyConnected, &config.fc_actions)?;
        for layer in &layers {
            let space = match layer.kind {
                LayerKind::Convolutional => &config.conv_actions,
                _ => &config.fc_actions,
            };
            if space.is_empty() {
                return Err(CompressionError::Config(format!(
                    "layer `{}` is {} but no {} actions are configured",
                    layer.name, layer.kind, layer.kind
                )));
            }
        }

        let explicit = resolve_parameters(&network, &config)?;
        let mut techniques = Vec::with_capacity(layers.len());
        for layer in &layers {
            let kinds = match layer.kind {
                LayerKind::Convolutional => &config.conv_actions,
                _ => &config.fc_actions,
            };
            let mut slots: Vec<Box<dyn CompressionTechnique<B>>> = Vec::with_capacity(kinds.len());
            for kind in kinds {
                let params = explicit
                    .get(&(layer.name.clone(), *kind))
                    .cloned()
                    .or_else(|| kind.default_params())
                    .ok_or_else(|| {
                        CompressionError::Config(format!(
                            "technique `{kind}` needs parameters for layer `{}`",
                            layer.name
                        ))
                    })?;
                slots.push(params.build::<B>().map_err(config_error)?);
            }
            techniques.push(slots);
        }

        let baseline_stats = ModelStats {
            weights: network.parameter_count().map_err(construction_error)?,
            accuracy: network
                .accuracy(data.split(config.accuracy_split))
                .map_err(construction_error)?,
        };
        if baseline_stats.weights == 0 {
            return Err(CompressionError::Config(
                "baseline network has no parameters".to_string(),
            ));
        }
        let baseline_splits = split_accuracy(&network, &data).map_err(construction_error)?;
        let sample_batch = data
            .sample_batch(config.observation_split, config.observation_samples)
            .map_err(construction_error)?;
        info!(
            layers = layers.len(),
            weights = baseline_stats.weights,
            accuracy = baseline_stats.accuracy,
            "compression environment ready"
        );

        Ok(Self {
            config,
            baseline: network.clone(),
            network,
            data,
            sample_batch,
            layers,
            network_indices,
            conv_space,
            fc_space,
            techniques,
            baseline_stats,
            baseline_splits,
            current_stats: baseline_stats,
            cursor: 0,
            last_compressed: None,
            phase: Phase::Idle,
        })
    }

    /// Replaces the technique behind one action slot of one layer.
    pub fn register_technique(
        &mut self,
        layer_name: &str,
        action: usize,
        technique: Box<dyn CompressionTechnique<B>>,
    ) -> Result<()> {
        let position = self
            .layers
            .iter()
            .position(|layer| layer.name == layer_name)
            .ok_or_else(|| {
                CompressionError::Config(format!("layer `{layer_name}` is not in the sequence"))
            })?;
        let kind = self.layers[position].kind;
        if !technique.supports(kind) {
            return Err(CompressionError::Config(format!(
                "technique `{}` does not support {kind} layers",
                technique.name()
            )));
        }
        let slots = &mut self.techniques[position];
        let size = slots.len();
        let slot = slots.get_mut(action).ok_or(UsageError::ActionOutOfRange {
            kind,
            index: action,
            size,
        })?;
        *slot = technique;
        Ok(())
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn network(&self) -> &Network<B> {
        &self.network
    }

    pub fn data(&self) -> &DataSplits<B> {
        &self.data
    }

    pub fn baseline_weights(&self) -> usize {
        self.baseline_stats.weights
    }

    pub fn baseline_accuracy(&self) -> f32 {
        self.baseline_stats.accuracy
    }

    /// Baseline accuracy on every split, measured at construction.
    pub fn baseline_split_accuracy(&self) -> SplitAccuracy {
        self.baseline_splits
    }

    fn check_running(&self) -> Result<()> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Idle => Err(UsageError::NotReset.into()),
            Phase::Finished | Phase::Aborted => Err(UsageError::EpisodeFinished.into()),
        }
    }

    fn observe(&self, position: usize, source: StateSource) -> Result<Observation> {
        let layer = &self.layers[position];
        let (input, output) = self
            .network
            .capture(self.sample_batch.clone(), self.network_indices[position])
            .map_err(|err| CompressionError::integrity(&layer.name, err))?;
        let activations = match source {
            StateSource::LayerInput => input,
            StateSource::LayerOutput => output,
        };
        let values = activations
            .values()
            .map_err(|err| CompressionError::integrity(&layer.name, err))?;
        Ok(Observation {
            kind: layer.kind,
            layer: layer.name.clone(),
            data: activation_features(&values, self.histogram_bins(layer.kind)),
        })
    }

    fn histogram_bins(&self, kind: LayerKind) -> usize {
        match kind {
            LayerKind::Convolutional => self.config.conv_histogram_bins,
            LayerKind::FullyConnected | LayerKind::Other => self.config.fc_histogram_bins,
        }
    }

    fn measure(&self, layer: &str) -> Result<ModelStats> {
        let weights = self
            .network
            .parameter_count()
            .map_err(|err| CompressionError::integrity(layer, err))?;
        let accuracy = self
            .network
            .accuracy(self.data.split(self.config.accuracy_split))
            .map_err(|err| CompressionError::integrity(layer, err))?;
        Ok(ModelStats { weights, accuracy })
    }

    /// Shaping signal: the change this step made to the end-of-episode reward terms.
    /// Summed over a full episode it equals `1 - w_after/w_before + acc_after - acc_before`.
    fn step_reward(&self, before: ModelStats, after: ModelStats) -> f32 {
        let baseline = self.baseline_stats.weights as f32;
        (before.weights as f32 - after.weights as f32) / baseline
            + (after.accuracy - before.accuracy)
    }

    fn apply(&mut self, action: Action) -> Result<StepResult> {
        let position = self.cursor;
        let layer_name = self.layers[position].name.clone();
        let before = self.current_stats;

        let technique = &self.techniques[position][action.index];
        let technique_name = technique.name().to_string();
        let stats = technique
            .compress_layer(&mut self.network, &layer_name)
            .map_err(|err| CompressionError::integrity(&layer_name, err))?;
        self.network
            .output_shapes()
            .map_err(|err| CompressionError::integrity(&layer_name, err))?;
        let after = self.measure(&layer_name)?;
        debug!(
            layer = %layer_name,
            technique = %technique_name,
            layer_weights_before = stats.weights_before,
            layer_weights_after = stats.weights_after,
            "layer compressed"
        );

        self.layers[position].compressed = true;
        self.last_compressed = Some(position);
        self.current_stats = after;
        self.cursor += 1;

        let observation = self.observe(position, self.config.next_state_source)?;
        let truncated = self.cursor < self.layers.len()
            && self
                .config
                .max_accuracy_drop
                .is_some_and(|drop| after.accuracy < self.baseline_stats.accuracy - drop);
        let done = self.cursor == self.layers.len() || truncated;
        let splits = if done {
            let compressed = split_accuracy(&self.network, &self.data)
                .map_err(|err| CompressionError::integrity(&layer_name, err))?;
            Some(SplitEvaluation {
                baseline: self.baseline_splits,
                compressed,
            })
        } else {
            None
        };
        if done {
            self.phase = Phase::Finished;
        }
        if truncated {
            warn!(
                layer = %layer_name,
                accuracy = after.accuracy,
                baseline = self.baseline_stats.accuracy,
                "accuracy drop limit reached, ending episode early"
            );
        }

        Ok(StepResult {
            observation,
            reward: self.step_reward(before, after),
            done,
            truncated,
            info: StepInfo {
                layer: layer_name,
                technique: technique_name,
                weights_before: before.weights,
                weights_after: after.weights,
                acc_before: before.accuracy,
                acc_after: after.accuracy,
                splits,
            },
        })
    }
}

impl<B: Backend> Environment for CompressionEnvironment<B> {
    fn reset(&mut self) -> Result<Observation> {
        self.network = self.baseline.clone();
        for layer in self.layers.iter_mut() {
            layer.compressed = false;
        }
        self.cursor = 0;
        self.last_compressed = None;
        self.current_stats = self.baseline_stats;
        self.phase = Phase::Running;
        self.observe(0, self.config.current_state_source)
    }

    fn step(&mut self, action: Action) -> Result<StepResult> {
        self.check_running()?;
        let layer = &self.layers[self.cursor];
        if action.kind != layer.kind {
            return Err(UsageError::ActionKindMismatch {
                expected: layer.kind,
                found: action.kind,
            }
            .into());
        }
        let size = self.techniques[self.cursor].len();
        if action.index >= size {
            return Err(UsageError::ActionOutOfRange {
                kind: layer.kind,
                index: action.index,
                size,
            }
            .into());
        }

        self.apply(action).inspect_err(|err| {
            self.phase = Phase::Aborted;
            warn!("episode aborted: {err}");
        })
    }

    fn get_state(&self, role: StateRole) -> Result<Observation> {
        match role {
            StateRole::Current => {
                self.check_running()?;
                self.observe(self.cursor, self.config.current_state_source)
            }
            StateRole::Next => {
                let position = self.last_compressed.ok_or(UsageError::NothingCompressed)?;
                self.observe(position, self.config.next_state_source)
            }
        }
    }

    fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn action_space(&self, kind: LayerKind) -> ActionSpace {
        match kind {
            LayerKind::Convolutional => self.conv_space.clone(),
            LayerKind::FullyConnected => self.fc_space.clone(),
            LayerKind::Other => ActionSpace {
                kind,
                actions: Vec::new(),
            },
        }
    }

    fn observation_size(&self, kind: LayerKind) -> usize {
        self.histogram_bins(kind) + MOMENT_FEATURES
    }

    fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Aborted)
    }
}

/// Accuracy on every split that holds examples.
fn split_accuracy<B: Backend>(
    network: &Network<B>,
    data: &DataSplits<B>,
) -> Result<SplitAccuracy, EngineError> {
    let measure = |split: Split| -> Result<Option<f32>, EngineError> {
        let batches = data.split(split);
        if batches.iter().all(Batch::is_empty) {
            return Ok(None);
        }
        network.accuracy(batches).map(Some)
    };
    Ok(SplitAccuracy {
        train: measure(Split::Train)?,
        validation: measure(Split::Validation)?,
        test: measure(Split::Test)?,
    })
}

fn config_error(err: EngineError) -> CompressionError {
    CompressionError::Config(err.to_string())
}

fn construction_error(err: EngineError) -> CompressionError {
    match err {
        EngineError::EmptySplit(split) => CompressionError::MissingResource {
            path: split.into(),
            reason: "dataset split has no examples".to_string(),
        },
        other => config_error(other),
    }
}

fn action_space(
    kind: LayerKind,
    techniques: &[TechniqueKind],
) -> Result<ActionSpace> {
    for technique in techniques {
        if !technique.supports(kind) {
            return Err(CompressionError::Config(format!(
                "technique `{technique}` cannot be offered to {kind} layers"
            )));
        }
    }
    Ok(ActionSpace {
        kind,
        actions: techniques.iter().map(|t| t.name().to_string()).collect(),
    })
}

fn resolve_sequence<B: Backend>(
    network: &Network<B>,
    config: &EnvironmentConfig,
) -> Result<(Vec<LayerDescriptor>, Vec<usize>)> {
    let indices: Vec<usize> = if config.layer_sequence.is_empty() {
        network
            .layers()
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.kind().is_compressible())
            .map(|(index, _)| index)
            .collect()
    } else {
        let mut indices = Vec::with_capacity(config.layer_sequence.len());
        for name in &config.layer_sequence {
            let index = network.layer_index(name).map_err(config_error)?;
            if !network.layers()[index].kind().is_compressible() {
                return Err(CompressionError::Config(format!(
                    "layer `{name}` is not compressible"
                )));
            }
            if indices.last().is_some_and(|last| *last >= index) {
                return Err(CompressionError::Config(format!(
                    "layer `{name}` is out of network order or repeated"
                )));
            }
            indices.push(index);
        }
        indices
    };
    if indices.is_empty() {
        return Err(CompressionError::Config(
            "no compressible layers in the sequence".to_string(),
        ));
    }
    let layers = indices
        .iter()
        .enumerate()
        .map(|(position, &index)| {
            let layer = &network.layers()[index];
            LayerDescriptor::new(layer.name.clone(), layer.kind(), position)
        })
        .collect();
    Ok((layers, indices))
}

fn resolve_parameters<B: Backend>(
    network: &Network<B>,
    config: &EnvironmentConfig,
) -> Result<HashMap<(String, TechniqueKind), TechniqueParams>> {
    let mut resolved = HashMap::new();
    for entry in &config.parameters {
        let layer = network.layer(&entry.layer_name).map_err(config_error)?;
        let technique = entry.params.kind();
        if !technique.supports(layer.kind()) {
            return Err(CompressionError::Config(format!(
                "technique `{technique}` configured for {} layer `{}`",
                layer.kind(),
                entry.layer_name
            )));
        }
        entry.params.validate().map_err(config_error)?;
        let key = (entry.layer_name.clone(), technique);
        if resolved.insert(key, entry.params.clone()).is_some() {
            return Err(CompressionError::Config(format!(
                "technique `{technique}` configured twice for layer `{}`",
                entry.layer_name
            )));
        }
    }
    Ok(resolved)
}
