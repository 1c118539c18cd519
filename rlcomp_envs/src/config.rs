use burn::config::Config;
use rlcomp_core::StateSource;
use rlcomp_engines::{Split, TechniqueKind, TechniqueParams};
use serde::{Deserialize, Serialize};

/// Parameters of one technique for one named layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerTechnique {
    pub layer_name: String,
    #[serde(flatten)]
    pub params: TechniqueParams,
}

impl LayerTechnique {
    pub fn new(layer_name: impl Into<String>, params: TechniqueParams) -> Self {
        Self {
            layer_name: layer_name.into(),
            params,
        }
    }
}

#[derive(Config, Debug)]
pub struct EnvironmentConfig {
    /// Techniques offered to convolutional layers, in action-index order.
    pub conv_actions: Vec<TechniqueKind>,
    /// Techniques offered to fully connected layers, in action-index order.
    pub fc_actions: Vec<TechniqueKind>,
    /// Per-layer technique parameters. Techniques without an entry for a layer
    /// fall back to their defaults.
    #[config(default = "Vec::new()")]
    pub parameters: Vec<LayerTechnique>,
    /// Layers visited per episode, in network order. Empty means every
    /// convolutional and fully connected layer.
    #[config(default = "Vec::new()")]
    pub layer_sequence: Vec<String>,
    #[config(default = "StateSource::LayerInput")]
    pub current_state_source: StateSource,
    #[config(default = "StateSource::LayerOutput")]
    pub next_state_source: StateSource,
    #[config(default = 16)]
    pub conv_histogram_bins: usize,
    #[config(default = 12)]
    pub fc_histogram_bins: usize,
    /// Examples of the sample batch used to build observations.
    #[config(default = 32)]
    pub observation_samples: usize,
    #[config(default = "Split::Train")]
    pub observation_split: Split,
    #[config(default = "Split::Validation")]
    pub accuracy_split: Split,
    /// Ends the episode early once accuracy falls this far below the baseline.
    #[config(default = "None")]
    pub max_accuracy_drop: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_parameters_read_flat_json() {
        let json = r#"{"layer_name":"dense_0","technique":"dense_svd","units":8}"#;
        let entry: LayerTechnique = serde_json::from_str(json).unwrap();
        assert_eq!(
            entry,
            LayerTechnique::new("dense_0", TechniqueParams::DenseSvd { units: 8 })
        );
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EnvironmentConfig::new(
            vec![TechniqueKind::Identity, TechniqueKind::ConvSvd],
            vec![TechniqueKind::DenseSvd],
        )
        .with_parameters(vec![
            LayerTechnique::new("conv2d_0", TechniqueParams::ConvSvd { units: 4 }),
            LayerTechnique::new("dense_0", TechniqueParams::Identity),
        ])
        .with_max_accuracy_drop(Some(0.1));
        let json = serde_json::to_string(&config).unwrap();
        let back: EnvironmentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.conv_actions, config.conv_actions);
        assert_eq!(back.parameters, config.parameters);
        assert_eq!(back.max_accuracy_drop, Some(0.1));
        assert_eq!(back.current_state_source, StateSource::LayerInput);
    }
}
