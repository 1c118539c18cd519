//! The compression decision process: walks a network layer by layer and lets an
//! agent pick one technique per layer.
//! Engines stay free of decision logic; this crate is the glue.

pub mod compression_env;
pub mod config;

pub use compression_env::CompressionEnvironment;
pub use config::{EnvironmentConfig, LayerTechnique};
