//! Layer agents and the evaluation loop.
//! Agents only see `rlcomp_core` types; any `Environment` implementation can
//! be evaluated.

pub mod agent;
pub mod evaluation;
pub mod reward;

pub use agent::{checkpoint_path, AgentConfig, AgentSet, LayerAgent, QNetwork, QNetworkConfig};
pub use evaluation::{
    EpisodeOutcome, EpisodeSummary, EvaluationConfig, EvaluationReport, Evaluator,
};
pub use reward::{episode_reward, RewardBreakdown};
