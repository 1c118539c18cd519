//! Shared types for the layer-compression decision process.
//! Engines, environments and agents all speak in these terms.

pub mod defs;
pub mod error;
pub mod trajectory;
pub mod utils;

pub use defs::{
    Action, ActionSpace, LayerDescriptor, LayerKind, Observation, SplitAccuracy,
    SplitEvaluation, StateRole, StateSource, StepInfo, StepResult, Transition,
};
pub use error::{CompressionError, Result, StatisticsError, UsageError};
pub use trajectory::Trajectory;

/// Environment is the mapper between a live network and the decision process.
///
/// Implementations own their model exclusively; a single instance must never be
/// driven by more than one caller at a time.
pub trait Environment {
    /// Restores the baseline model and returns the first observation.
    fn reset(&mut self) -> Result<Observation>;

    /// Applies `action` to the layer under the cursor and advances the cursor.
    fn step(&mut self, action: Action) -> Result<StepResult>;

    fn get_state(&self, role: StateRole) -> Result<Observation>;

    fn layers(&self) -> &[LayerDescriptor];

    fn cursor(&self) -> usize;

    fn current_layer(&self) -> Option<&LayerDescriptor> {
        self.layers().get(self.cursor())
    }

    fn action_space(&self, kind: LayerKind) -> ActionSpace;

    /// Length of the observations produced for layers of `kind`.
    fn observation_size(&self, kind: LayerKind) -> usize;

    fn is_done(&self) -> bool;
}
