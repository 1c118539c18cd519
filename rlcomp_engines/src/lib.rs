//! Compression mechanics: a dynamic sequential network, dataset splits and the
//! catalogue of layer compression techniques.
//! Engines stay free of any decision-process logic; envs do the glue.

pub mod dataset;
pub mod error;
pub mod features;
pub mod network;
pub mod techniques;
pub mod zoo;

pub use dataset::{Batch, DataSplits, Split, SyntheticDataConfig};
pub use error::EngineError;
pub use network::{Activations, ActivationFn, ConvStage, Layer, LayerOp, Network, ShapeSpec};
pub use techniques::{CompressionStats, CompressionTechnique, TechniqueKind, TechniqueParams};
pub use zoo::SmallConvNetConfig;
