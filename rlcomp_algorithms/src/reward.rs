use rlcomp_core::{SplitEvaluation, StatisticsError, Trajectory};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Terms of the end-of-episode reward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub weights_before: usize,
    pub weights_after: usize,
    pub acc_before: f32,
    pub acc_after: f32,
    /// `weights_after / weights_before`
    pub compression_ratio: f32,
    pub reward: f32,
    /// Accuracy on every split, when the environment measured it.
    #[serde(default)]
    pub splits: Option<SplitEvaluation>,
}

/// `1 - weights_after / weights_before + acc_after`, with the "before" terms
/// taken from the first transition and the "after" terms from the last.
pub fn episode_reward(trajectory: &Trajectory) -> Result<RewardBreakdown, StatisticsError> {
    let (first, last) = match (trajectory.first(), trajectory.last()) {
        (Some(first), Some(last)) => (&first.info, &last.info),
        _ => return Err(StatisticsError::EmptyTrajectory),
    };
    if trajectory.len() == 1 {
        debug!(
            layer = %last.layer,
            "single-transition episode, before and after terms come from one step"
        );
    }
    if first.weights_before == 0 {
        return Err(StatisticsError::ZeroBaselineWeights);
    }
    for (field, value) in [("acc_before", first.acc_before), ("acc_after", last.acc_after)] {
        if !value.is_finite() {
            return Err(StatisticsError::NonFinite { field });
        }
    }

    let compression_ratio = last.weights_after as f32 / first.weights_before as f32;
    let reward = 1.0 - compression_ratio + last.acc_after;
    if !reward.is_finite() {
        return Err(StatisticsError::NonFinite { field: "reward" });
    }
    Ok(RewardBreakdown {
        weights_before: first.weights_before,
        weights_after: last.weights_after,
        acc_before: first.acc_before,
        acc_after: last.acc_after,
        compression_ratio,
        reward,
        splits: last.splits,
    })
}
