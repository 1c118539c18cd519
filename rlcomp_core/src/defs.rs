use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag of a layer in the target network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Convolutional,
    FullyConnected,
    Other,
}

impl LayerKind {
    /// Short tag used in checkpoint file names and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            LayerKind::Convolutional => "conv",
            LayerKind::FullyConnected => "fc",
            LayerKind::Other => "other",
        }
    }

    pub fn is_compressible(&self) -> bool {
        !matches!(self, LayerKind::Other)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One entry of the ordered compression sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub name: String,
    pub kind: LayerKind,
    pub position: usize,
    pub compressed: bool,
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, kind: LayerKind, position: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            position,
            compressed: false,
        }
    }
}

/// Which observation the environment should hand out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateRole {
    /// The layer under the cursor, before it is transformed.
    Current,
    /// The layer transformed by the most recent step.
    Next,
}

/// Where an observation is read from, relative to its layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    LayerInput,
    LayerOutput,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub kind: LayerKind,
    pub layer: String,
    pub data: Vec<f32>,
}

impl Observation {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A discrete action. `index` is only meaningful for the action space of `kind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    pub kind: LayerKind,
    pub index: usize,
}

impl Action {
    pub fn new(kind: LayerKind, index: usize) -> Self {
        Self { kind, index }
    }
}

/// Technique names available to one layer type, in action-index order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionSpace {
    pub kind: LayerKind,
    pub actions: Vec<String>,
}

impl ActionSpace {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.actions.get(index).map(String::as_str)
    }
}

/// Statistics of one layer transformation.
#[derive(Clone, Debug, PartialEq)]
pub struct StepInfo {
    pub layer: String,
    pub technique: String,
    pub weights_before: usize,
    pub weights_after: usize,
    pub acc_before: f32,
    pub acc_after: f32,
    /// Set on the step that ends the episode.
    pub splits: Option<SplitEvaluation>,
}

/// Accuracy of one model on every dataset split. `None` marks an empty split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitAccuracy {
    pub train: Option<f32>,
    pub validation: Option<f32>,
    pub test: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitEvaluation {
    pub baseline: SplitAccuracy,
    pub compressed: SplitAccuracy,
}

#[derive(Clone, Debug)]
pub struct StepResult {
    pub observation: Observation,
    pub reward: f32,
    pub done: bool,
    /// Set when the episode ended before the whole layer sequence was visited.
    pub truncated: bool,
    pub info: StepInfo,
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub state: Observation,
    pub action: Action,
    pub reward: f32,
    pub next_state: Observation,
    pub done: bool,
    pub truncated: bool,
    pub info: StepInfo,
}

impl Transition {
    pub fn new(state: Observation, action: Action, result: StepResult) -> Self {
        Self {
            state,
            action,
            reward: result.reward,
            next_state: result.observation,
            done: result.done,
            truncated: result.truncated,
            info: result.info,
        }
    }
}
