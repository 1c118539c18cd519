use crate::agent::AgentSet;
use crate::reward::{episode_reward, RewardBreakdown};
use burn::prelude::*;
use rlcomp_core::{
    CompressionError, Environment, Result, SplitAccuracy, StateRole, StatisticsError, Trajectory,
    Transition,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Config, Debug)]
pub struct EvaluationConfig {
    #[config(default = 5)]
    pub n_games: usize,
    /// Use epsilon-greedy selection and keep the trajectories.
    #[config(default = false)]
    pub explore: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EpisodeOutcome {
    Completed(RewardBreakdown),
    /// Ended by the accuracy limit before visiting every layer. Not reward-bearing.
    Truncated { layers_visited: usize },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode: usize,
    pub steps: usize,
    pub outcome: EpisodeOutcome,
}

/// Aggregate of many episodes. Only completed episodes enter the means.
#[derive(Clone, Debug, Default)]
pub struct EvaluationReport {
    pub episodes: Vec<EpisodeSummary>,
    pub completed: usize,
    pub truncated: usize,
    pub failed: usize,
    reward_sum: f64,
    accuracy_sum: f64,
    weights_sum: f64,
    /// Filled by exploratory runs only.
    pub trajectories: Vec<Trajectory>,
}

impl EvaluationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, steps: usize, outcome: EpisodeOutcome) {
        match &outcome {
            EpisodeOutcome::Completed(breakdown) => {
                self.completed += 1;
                self.reward_sum += breakdown.reward as f64;
                self.accuracy_sum += breakdown.acc_after as f64;
                self.weights_sum += breakdown.weights_after as f64;
            }
            EpisodeOutcome::Truncated { .. } => self.truncated += 1,
            EpisodeOutcome::Failed { .. } => self.failed += 1,
        }
        self.episodes.push(EpisodeSummary {
            episode: self.episodes.len(),
            steps,
            outcome,
        });
    }

    fn mean(&self, sum: f64) -> std::result::Result<f32, StatisticsError> {
        if self.completed == 0 {
            return Err(StatisticsError::NoEpisodes);
        }
        Ok((sum / self.completed as f64) as f32)
    }

    pub fn mean_reward(&self) -> std::result::Result<f32, StatisticsError> {
        self.mean(self.reward_sum)
    }

    pub fn mean_accuracy(&self) -> std::result::Result<f32, StatisticsError> {
        self.mean(self.accuracy_sum)
    }

    pub fn mean_weights(&self) -> std::result::Result<f32, StatisticsError> {
        self.mean(self.weights_sum)
    }

    /// Mean accuracy of the compressed models on each split, over completed
    /// episodes. A split stays `None` when no episode measured it.
    pub fn mean_split_accuracy(&self) -> std::result::Result<SplitAccuracy, StatisticsError> {
        if self.completed == 0 {
            return Err(StatisticsError::NoEpisodes);
        }
        let compressed: Vec<SplitAccuracy> = self
            .episodes
            .iter()
            .filter_map(|summary| match &summary.outcome {
                EpisodeOutcome::Completed(breakdown) => breakdown.splits,
                _ => None,
            })
            .map(|splits| splits.compressed)
            .collect();
        let mean = |pick: fn(&SplitAccuracy) -> Option<f32>| {
            let values: Vec<f64> = compressed.iter().filter_map(pick).map(f64::from).collect();
            if values.is_empty() {
                None
            } else {
                Some((values.iter().sum::<f64>() / values.len() as f64) as f32)
            }
        };
        Ok(SplitAccuracy {
            train: mean(|s| s.train),
            validation: mean(|s| s.validation),
            test: mean(|s| s.test),
        })
    }

    /// Folds in the report of another environment instance. Sums and counts
    /// add up, so merge order does not change the means.
    pub fn merge(&mut self, other: EvaluationReport) {
        let offset = self.episodes.len();
        self.episodes
            .extend(other.episodes.into_iter().map(|summary| EpisodeSummary {
                episode: summary.episode + offset,
                ..summary
            }));
        self.completed += other.completed;
        self.truncated += other.truncated;
        self.failed += other.failed;
        self.reward_sum += other.reward_sum;
        self.accuracy_sum += other.accuracy_sum;
        self.weights_sum += other.weights_sum;
        self.trajectories.extend(other.trajectories);
    }
}

/// Plays whole episodes with a pair of agents.
pub struct Evaluator {
    config: EvaluationConfig,
}

impl Evaluator {
    pub fn new(config: EvaluationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Resets `env` and lets the agents pick one technique per layer until the
    /// episode ends.
    pub fn run_episode<B: Backend>(
        &self,
        env: &mut dyn Environment,
        agents: &mut AgentSet<B>,
    ) -> Result<Trajectory> {
        let mut state = env.reset()?;
        let mut trajectory = Trajectory::with_capacity(env.layers().len());
        while !env.is_done() {
            let action = agents
                .agent_for_mut(state.kind)?
                .act(&state, self.config.explore)?;
            let result = env.step(action)?;
            debug!(
                layer = %result.info.layer,
                technique = %result.info.technique,
                weights = result.info.weights_after,
                accuracy = result.info.acc_after,
                "step"
            );
            let done = result.done;
            let current = state;
            trajectory.push(Transition::new(current, action, result));
            if done {
                break;
            }
            state = env.get_state(StateRole::Current)?;
        }
        Ok(trajectory)
    }

    /// Runs `n_games` episodes. Episode-local failures are logged and counted;
    /// any other error stops the evaluation.
    pub fn evaluate<B: Backend>(
        &self,
        env: &mut dyn Environment,
        agents: &mut AgentSet<B>,
    ) -> Result<EvaluationReport> {
        if self.config.n_games == 0 {
            return Err(CompressionError::Config(
                "n_games must be positive".to_string(),
            ));
        }
        agents.check_compatible(env)?;

        let mut report = EvaluationReport::new();
        for episode in 0..self.config.n_games {
            let trajectory = match self.run_episode(env, agents) {
                Ok(trajectory) => trajectory,
                Err(err) if err.is_episode_local() => {
                    warn!(episode, "episode failed: {err}");
                    report.record(
                        env.cursor(),
                        EpisodeOutcome::Failed {
                            reason: err.to_string(),
                        },
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            let steps = trajectory.len();
            let outcome = if trajectory.is_truncated() {
                warn!(episode, steps, "episode truncated, no reward");
                EpisodeOutcome::Truncated {
                    layers_visited: steps,
                }
            } else {
                match episode_reward(&trajectory) {
                    Ok(breakdown) => {
                        info!(
                            episode,
                            reward = breakdown.reward,
                            accuracy = breakdown.acc_after,
                            weights = breakdown.weights_after,
                            "episode finished"
                        );
                        EpisodeOutcome::Completed(breakdown)
                    }
                    Err(err) => {
                        warn!(episode, "episode reward unavailable: {err}");
                        EpisodeOutcome::Failed {
                            reason: err.to_string(),
                        }
                    }
                }
            };
            report.record(steps, outcome);
            if self.config.explore {
                report.trajectories.push(trajectory);
            }
        }

        info!(
            completed = report.completed,
            truncated = report.truncated,
            failed = report.failed,
            "evaluation finished"
        );
        Ok(report)
    }
}
