use crate::LayerKind;
use std::path::PathBuf;
use thiserror::Error;

/// Misuse of the decision-process API. Never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UsageError {
    #[error("step called before the first reset")]
    NotReset,
    #[error("step called on a finished episode")]
    EpisodeFinished,
    #[error("no layer has been compressed in this episode yet")]
    NothingCompressed,
    #[error("action {index} is outside the {kind} action space of size {size}")]
    ActionOutOfRange {
        kind: LayerKind,
        index: usize,
        size: usize,
    },
    #[error("action for {found} layers applied to a {expected} layer")]
    ActionKindMismatch { expected: LayerKind, found: LayerKind },
    #[error("{agent} agent asked to score a {found} observation")]
    ObservationKindMismatch { agent: LayerKind, found: LayerKind },
    #[error("observation of length {found} does not match agent input size {expected}")]
    ObservationShape { expected: usize, found: usize },
    #[error("value row of width {found} does not match the {kind} action count {expected}")]
    ValueWidth {
        kind: LayerKind,
        expected: usize,
        found: usize,
    },
    #[error("no agent handles {0} layers")]
    NoAgent(LayerKind),
}

/// Reward aggregation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StatisticsError {
    #[error("trajectory is empty")]
    EmptyTrajectory,
    #[error("baseline weight count is zero")]
    ZeroBaselineWeights,
    #[error("statistic `{field}` is not finite")]
    NonFinite { field: &'static str },
    #[error("no completed episodes to average")]
    NoEpisodes,
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    #[error("model integrity error on layer `{layer}`: {reason}")]
    ModelIntegrity { layer: String, reason: String },
    #[error("missing resource {}: {reason}", path.display())]
    MissingResource { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("statistics error: {0}")]
    Statistics(#[from] StatisticsError),
}

impl CompressionError {
    pub fn integrity(layer: impl Into<String>, reason: impl ToString) -> Self {
        CompressionError::ModelIntegrity {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors confined to one episode. Everything else aborts the run.
    pub fn is_episode_local(&self) -> bool {
        matches!(
            self,
            CompressionError::ModelIntegrity { .. } | CompressionError::Statistics(_)
        )
    }
}

pub type Result<T, E = CompressionError> = std::result::Result<T, E>;
