mod common;

use common::{trajectory, transition};
use rlcomp_algorithms::episode_reward;
use rlcomp_core::{SplitAccuracy, SplitEvaluation, StatisticsError, Trajectory};

#[test]
fn halving_weights_at_ninety_percent_scores_one_point_four() {
    let episode = trajectory(vec![
        transition(1000, 800, 0.95, 0.93),
        transition(800, 650, 0.93, 0.92),
        transition(650, 500, 0.92, 0.9),
    ]);
    let breakdown = episode_reward(&episode).unwrap();
    assert_eq!(breakdown.weights_before, 1000);
    assert_eq!(breakdown.weights_after, 500);
    assert_eq!(breakdown.acc_before, 0.95);
    assert!((breakdown.compression_ratio - 0.5).abs() < 1e-6);
    assert!((breakdown.reward - 1.4).abs() < 1e-6);
}

#[test]
fn single_step_episode_uses_its_own_before_and_after() {
    let episode = trajectory(vec![transition(1000, 500, 1.0, 0.9)]);
    let breakdown = episode_reward(&episode).unwrap();
    assert!((breakdown.reward - 1.4).abs() < 1e-6);
    assert_eq!(breakdown.weights_before, 1000);
    assert_eq!(breakdown.acc_before, 1.0);
    assert!(breakdown.splits.is_none());
}

#[test]
fn split_accuracy_comes_from_the_last_transition() {
    let measured = SplitAccuracy {
        train: Some(0.97),
        validation: Some(0.9),
        test: None,
    };
    let splits = SplitEvaluation {
        baseline: SplitAccuracy {
            train: Some(1.0),
            validation: Some(0.95),
            test: None,
        },
        compressed: measured,
    };
    let mut last = transition(800, 500, 0.93, 0.9);
    last.info.splits = Some(splits);
    let episode = trajectory(vec![transition(1000, 800, 0.95, 0.93), last]);

    let breakdown = episode_reward(&episode).unwrap();
    assert_eq!(breakdown.splits, Some(splits));
    // the reward still uses the configured split only
    assert!((breakdown.reward - 1.4).abs() < 1e-6);
}

#[test]
fn empty_trajectory_is_a_statistics_error() {
    let err = episode_reward(&Trajectory::new()).unwrap_err();
    assert_eq!(err, StatisticsError::EmptyTrajectory);
}

#[test]
fn zero_baseline_weights_are_rejected() {
    let episode = trajectory(vec![transition(0, 0, 1.0, 1.0)]);
    let err = episode_reward(&episode).unwrap_err();
    assert_eq!(err, StatisticsError::ZeroBaselineWeights);
}

#[test]
fn non_finite_accuracy_is_rejected() {
    let episode = trajectory(vec![transition(10, 5, 1.0, f32::NAN)]);
    let err = episode_reward(&episode).unwrap_err();
    assert_eq!(err, StatisticsError::NonFinite { field: "acc_after" });
}
