use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rlcomp_core::utils::argmax;
use rlcomp_core::{Action, CompressionError, Environment, LayerKind, Observation, Result, UsageError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Config, Debug)]
pub struct QNetworkConfig {
    pub input_dim: usize,
    pub num_actions: usize,
    #[config(default = 64)]
    pub hidden_dim: usize,
}

impl QNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> QNetwork<B> {
        QNetwork {
            fc1: LinearConfig::new(self.input_dim, self.hidden_dim).init(device),
            activation: Relu::new(),
            head: LinearConfig::new(self.hidden_dim, self.num_actions).init(device),
        }
    }
}

/// One hidden layer mapping an observation to a value per action.
#[derive(Module, Debug)]
pub struct QNetwork<B: Backend> {
    fc1: Linear<B>,
    activation: Relu,
    head: Linear<B>,
}

impl<B: Backend> QNetwork<B> {
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.fc1.forward(input);
        let x = self.activation.forward(x);
        self.head.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct AgentConfig {
    #[config(default = 64)]
    pub hidden_dim: usize,
    /// Probability of a uniformly random action in exploratory selection.
    #[config(default = 0.1)]
    pub epsilon: f64,
    #[config(default = 0)]
    pub seed: u64,
}

/// Scores observations of one layer type and turns the scores into actions.
pub struct LayerAgent<B: Backend> {
    kind: LayerKind,
    network: QNetwork<B>,
    input_dim: usize,
    num_actions: usize,
    epsilon: f64,
    rng: StdRng,
    device: B::Device,
}

impl<B: Backend> LayerAgent<B> {
    pub fn new(
        kind: LayerKind,
        input_dim: usize,
        num_actions: usize,
        config: &AgentConfig,
        device: &B::Device,
    ) -> Result<Self> {
        if !kind.is_compressible() {
            return Err(UsageError::NoAgent(kind).into());
        }
        if input_dim == 0 || num_actions == 0 {
            return Err(CompressionError::Config(format!(
                "{kind} agent needs a non-empty observation ({input_dim}) and action space ({num_actions})"
            )));
        }
        if !(0.0..=1.0).contains(&config.epsilon) {
            return Err(CompressionError::Config(format!(
                "epsilon {} outside [0, 1]",
                config.epsilon
            )));
        }
        let network = QNetworkConfig::new(input_dim, num_actions)
            .with_hidden_dim(config.hidden_dim)
            .init(device);
        Ok(Self {
            kind,
            network,
            input_dim,
            num_actions,
            epsilon: config.epsilon,
            rng: StdRng::seed_from_u64(config.seed),
            device: device.clone(),
        })
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn network(&self) -> &QNetwork<B> {
        &self.network
    }

    fn check_observation(&self, observation: &Observation) -> Result<()> {
        if observation.kind != self.kind {
            return Err(UsageError::ObservationKindMismatch {
                agent: self.kind,
                found: observation.kind,
            }
            .into());
        }
        if observation.len() != self.input_dim {
            return Err(UsageError::ObservationShape {
                expected: self.input_dim,
                found: observation.len(),
            }
            .into());
        }
        Ok(())
    }

    fn check_row(&self, row: &[f32]) -> Result<()> {
        if row.len() != self.num_actions {
            return Err(UsageError::ValueWidth {
                kind: self.kind,
                expected: self.num_actions,
                found: row.len(),
            }
            .into());
        }
        Ok(())
    }

    /// One row of action values per observation. Does not touch agent state.
    pub fn score(&self, observations: &[Observation]) -> Result<Vec<Vec<f32>>> {
        if observations.is_empty() {
            return Ok(Vec::new());
        }
        let mut flat = Vec::with_capacity(observations.len() * self.input_dim);
        for observation in observations {
            self.check_observation(observation)?;
            flat.extend_from_slice(&observation.data);
        }
        let input = Tensor::<B, 2>::from_data(
            TensorData::new(flat, [observations.len(), self.input_dim]),
            &self.device,
        );
        let values = self
            .network
            .forward(input)
            .into_data()
            .convert::<f32>()
            .into_vec::<f32>()
            .map_err(|err| {
                CompressionError::integrity(format!("{}_agent", self.kind.tag()), format!("{err:?}"))
            })?;
        Ok(values
            .chunks(self.num_actions)
            .map(<[f32]>::to_vec)
            .collect())
    }

    /// Highest-valued action of every row.
    pub fn select_greedy(&self, values: &[Vec<f32>]) -> Result<Vec<Action>> {
        values
            .iter()
            .map(|row| {
                self.check_row(row)?;
                Ok(Action::new(self.kind, argmax(row)))
            })
            .collect()
    }

    /// Epsilon-greedy selection: a uniformly random action with probability
    /// `epsilon`, the greedy one otherwise.
    pub fn select_exploratory(&mut self, values: &[Vec<f32>]) -> Result<Vec<Action>> {
        let mut actions = Vec::with_capacity(values.len());
        for row in values {
            self.check_row(row)?;
            let index = if self.rng.random::<f64>() < self.epsilon {
                self.rng.random_range(0..self.num_actions)
            } else {
                argmax(row)
            };
            actions.push(Action::new(self.kind, index));
        }
        Ok(actions)
    }

    /// Scores a single observation and picks its action.
    pub fn act(&mut self, observation: &Observation, explore: bool) -> Result<Action> {
        let values = self.score(std::slice::from_ref(observation))?;
        let actions = if explore {
            self.select_exploratory(&values)?
        } else {
            self.select_greedy(&values)?
        };
        actions.into_iter().next().ok_or_else(|| {
            CompressionError::integrity(format!("{}_agent", self.kind.tag()), "no action selected")
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| CompressionError::MissingResource {
                path: parent.to_path_buf(),
                reason: err.to_string(),
            })?;
        }
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.network
            .clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|err| CompressionError::MissingResource {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        debug!(path = %path.display(), kind = %self.kind, "agent checkpoint saved");
        Ok(())
    }

    /// Replaces the agent weights with the checkpoint at `path`.
    pub fn load(mut self, path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CompressionError::MissingResource {
                path: path.to_path_buf(),
                reason: "checkpoint not found".to_string(),
            });
        }
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.network = self
            .network
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .map_err(|err| CompressionError::MissingResource {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        debug!(path = %path.display(), kind = %self.kind, "agent checkpoint loaded");
        Ok(self)
    }
}

/// `<root>/<dataset>/<conv|fc>_agent.mpk`
pub fn checkpoint_path(root: &Path, dataset: &str, kind: LayerKind) -> PathBuf {
    root.join(dataset).join(format!("{}_agent.mpk", kind.tag()))
}

/// The convolutional and fully connected agents of one run.
pub struct AgentSet<B: Backend> {
    pub conv: LayerAgent<B>,
    pub fc: LayerAgent<B>,
}

impl<B: Backend> AgentSet<B> {
    /// Sizes both agents after the observation and action spaces of `env`.
    pub fn init(env: &dyn Environment, config: &AgentConfig, device: &B::Device) -> Result<Self> {
        let build = |kind: LayerKind, seed: u64| {
            let config = AgentConfig {
                seed,
                ..config.clone()
            };
            LayerAgent::new(
                kind,
                env.observation_size(kind),
                env.action_space(kind).len().max(1),
                &config,
                device,
            )
        };
        Ok(Self {
            conv: build(LayerKind::Convolutional, config.seed)?,
            fc: build(LayerKind::FullyConnected, config.seed.wrapping_add(1))?,
        })
    }

    pub fn agent_for(&self, kind: LayerKind) -> Result<&LayerAgent<B>> {
        match kind {
            LayerKind::Convolutional => Ok(&self.conv),
            LayerKind::FullyConnected => Ok(&self.fc),
            LayerKind::Other => Err(UsageError::NoAgent(kind).into()),
        }
    }

    pub fn agent_for_mut(&mut self, kind: LayerKind) -> Result<&mut LayerAgent<B>> {
        match kind {
            LayerKind::Convolutional => Ok(&mut self.conv),
            LayerKind::FullyConnected => Ok(&mut self.fc),
            LayerKind::Other => Err(UsageError::NoAgent(kind).into()),
        }
    }

    /// Fails when an agent would see observations or offer actions that do not
    /// fit the layers `env` will visit.
    pub fn check_compatible(&self, env: &dyn Environment) -> Result<()> {
        for layer in env.layers() {
            let agent = self.agent_for(layer.kind)?;
            let observed = env.observation_size(layer.kind);
            if agent.input_dim() != observed {
                return Err(UsageError::ObservationShape {
                    expected: agent.input_dim(),
                    found: observed,
                }
                .into());
            }
            let offered = env.action_space(layer.kind).len();
            if agent.num_actions() != offered {
                return Err(UsageError::ValueWidth {
                    kind: layer.kind,
                    expected: offered,
                    found: agent.num_actions(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn save(&self, root: &Path, dataset: &str) -> Result<()> {
        self.conv
            .save(&checkpoint_path(root, dataset, LayerKind::Convolutional))?;
        self.fc
            .save(&checkpoint_path(root, dataset, LayerKind::FullyConnected))?;
        info!(root = %root.display(), dataset, "agents saved");
        Ok(())
    }

    pub fn load(self, root: &Path, dataset: &str) -> Result<Self> {
        let conv = self
            .conv
            .load(&checkpoint_path(root, dataset, LayerKind::Convolutional))?;
        let fc = self
            .fc
            .load(&checkpoint_path(root, dataset, LayerKind::FullyConnected))?;
        info!(root = %root.display(), dataset, "agents loaded");
        Ok(Self { conv, fc })
    }
}
