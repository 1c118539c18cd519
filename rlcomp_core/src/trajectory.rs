use crate::Transition;

/// Append-only, step-ordered record of one episode.
#[derive(Clone, Debug, Default)]
pub struct Trajectory {
    points: Vec<Transition>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(steps: usize) -> Self {
        Self {
            points: Vec::with_capacity(steps),
        }
    }

    pub fn push(&mut self, transition: Transition) {
        self.points.push(transition);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&Transition> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&Transition> {
        self.points.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transition> {
        self.points.iter()
    }

    /// True when the last transition ended the episode early.
    pub fn is_truncated(&self) -> bool {
        self.points.last().is_some_and(|t| t.truncated)
    }

    pub fn total_step_reward(&self) -> f32 {
        self.points.iter().map(|t| t.reward).sum()
    }

    pub fn into_transitions(self) -> Vec<Transition> {
        self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, LayerKind, Observation, StepInfo, StepResult};

    fn transition(layer: &str, reward: f32, truncated: bool) -> Transition {
        let obs = Observation {
            kind: LayerKind::FullyConnected,
            layer: layer.to_string(),
            data: vec![0.0; 4],
        };
        Transition::new(
            obs.clone(),
            Action::new(LayerKind::FullyConnected, 0),
            StepResult {
                observation: obs,
                reward,
                done: truncated,
                truncated,
                info: StepInfo {
                    layer: layer.to_string(),
                    technique: "identity".to_string(),
                    weights_before: 10,
                    weights_after: 10,
                    acc_before: 1.0,
                    acc_after: 1.0,
                    splits: None,
                },
            },
        )
    }

    #[test]
    fn keeps_insertion_order() {
        let mut trajectory = Trajectory::new();
        trajectory.push(transition("dense_0", 0.1, false));
        trajectory.push(transition("dense_1", 0.2, false));
        trajectory.push(transition("dense_2", 0.3, false));

        assert_eq!(trajectory.len(), 3);
        assert_eq!(trajectory.first().unwrap().info.layer, "dense_0");
        assert_eq!(trajectory.last().unwrap().info.layer, "dense_2");
        assert!((trajectory.total_step_reward() - 0.6).abs() < 1e-6);
        assert!(!trajectory.is_truncated());
    }

    #[test]
    fn reports_truncation_from_last_point() {
        let mut trajectory = Trajectory::new();
        assert!(!trajectory.is_truncated());
        trajectory.push(transition("dense_0", 0.0, true));
        assert!(trajectory.is_truncated());
    }
}
