//! Bundling configuration loaded from TOML
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```toml
//! sample_length = 0.25
//! importance_mode = "edge_times_class_mean"
//!
//! [edge_annealing]
//! reduction = 0.95
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, Result};
use crate::importance::ImportanceMode;
use crate::types::{
    DEFAULT_ADVECT_STRENGTH, DEFAULT_CELL_SIZE, DEFAULT_DENSITY_RADIUS,
    DEFAULT_EDGE_NOISE_STRENGTH, DEFAULT_LAYER_DISTANCE, DEFAULT_LAYER_HEIGHT,
    DEFAULT_LAYER_WIDTH, DEFAULT_MAX_EDGES_PER_BUFFER, DEFAULT_NODE_NOISE_STRENGTH,
    DEFAULT_SAMPLE_LENGTH, DEFAULT_SMOOTH_RADIUS,
};

/// Annealing parameters of one bundling phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnealingConfig {
    /// Bandwidth at iteration 0
    pub bandwidth: f32,
    /// Multiplicative decay per iteration (0 < reduction < 1)
    pub reduction: f32,
    /// Bandwidth below which the phase terminates
    pub limit: f32,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        Self {
            bandwidth: 1.0,
            reduction: 0.9,
            limit: 0.1,
        }
    }
}

impl AnnealingConfig {
    pub fn validate(&self, phase: &str) -> Result<()> {
        if !(self.reduction > 0.0 && self.reduction < 1.0) {
            return Err(BundleError::Config(format!(
                "{phase}: reduction must be in (0, 1), got {}",
                self.reduction
            )));
        }
        if !(self.limit >= 0.0 && self.limit < self.bandwidth) {
            return Err(BundleError::Config(format!(
                "{phase}: limit must be in [0, bandwidth), got limit {} bandwidth {}",
                self.limit, self.bandwidth
            )));
        }
        Ok(())
    }
}

/// Configuration for the whole bundling pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlingConfig {
    /// Extent of a layer plane along x
    pub layer_width: f32,
    /// Extent of a layer plane along y
    pub layer_height: f32,
    /// Distance between consecutive layers along z
    pub layer_distance: f32,
    /// Edges with `importance * endpoint_weight` below this are dropped
    pub prune_threshold: f32,
    /// How edge importance is aggregated
    pub importance_mode: ImportanceMode,
    /// Class indices that contribute to importance (empty = all)
    pub relevant_classes: Vec<usize>,
    /// Spacing between resampled polyline points
    pub sample_length: f32,
    /// Upper bound on edges per sample buffer
    pub max_edges_per_buffer: usize,
    /// Edge length of a density grid cell
    pub cell_size: f32,
    /// Density falloff radius at full bandwidth
    pub density_radius: f32,
    /// Smoothing radius at full bandwidth
    pub smooth_radius: f32,
    /// Advection step scale
    pub advect_strength: f32,
    /// Node jitter in multiples of `sample_length`
    pub node_noise_strength: f32,
    /// Polyline jitter in multiples of `sample_length`
    pub edge_noise_strength: f32,
    /// Whether edge jitter also moves polyline endpoints
    pub noise_moves_endpoints: bool,
    /// Seed for the hash-based jitter
    pub noise_seed: u32,
    /// Annealing schedule for node bundling
    pub node_annealing: AnnealingConfig,
    /// Annealing schedule for edge bundling
    pub edge_annealing: AnnealingConfig,
}

impl Default for BundlingConfig {
    fn default() -> Self {
        Self {
            layer_width: DEFAULT_LAYER_WIDTH,
            layer_height: DEFAULT_LAYER_HEIGHT,
            layer_distance: DEFAULT_LAYER_DISTANCE,
            prune_threshold: 0.0,
            importance_mode: ImportanceMode::default(),
            relevant_classes: Vec::new(),
            sample_length: DEFAULT_SAMPLE_LENGTH,
            max_edges_per_buffer: DEFAULT_MAX_EDGES_PER_BUFFER,
            cell_size: DEFAULT_CELL_SIZE,
            density_radius: DEFAULT_DENSITY_RADIUS,
            smooth_radius: DEFAULT_SMOOTH_RADIUS,
            advect_strength: DEFAULT_ADVECT_STRENGTH,
            node_noise_strength: DEFAULT_NODE_NOISE_STRENGTH,
            edge_noise_strength: DEFAULT_EDGE_NOISE_STRENGTH,
            noise_moves_endpoints: false,
            noise_seed: 0x5eed,
            node_annealing: AnnealingConfig::default(),
            edge_annealing: AnnealingConfig {
                reduction: 0.92,
                ..AnnealingConfig::default()
            },
        }
    }
}

impl BundlingConfig {
    /// Load and validate a config file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: BundlingConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value the pipeline divides by or sizes buffers from
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("layer_width", self.layer_width),
            ("layer_height", self.layer_height),
            ("layer_distance", self.layer_distance),
            ("sample_length", self.sample_length),
            ("cell_size", self.cell_size),
            ("density_radius", self.density_radius),
            ("smooth_radius", self.smooth_radius),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(BundleError::Config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.max_edges_per_buffer == 0 {
            return Err(BundleError::Config(
                "max_edges_per_buffer must be at least 1".to_string(),
            ));
        }
        self.node_annealing.validate("node_annealing")?;
        self.edge_annealing.validate("edge_annealing")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BundlingConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = BundlingConfig::from_toml_str(
            r#"
            sample_length = 0.25
            importance_mode = "class_mean"

            [edge_annealing]
            reduction = 0.95
            "#,
        )
        .unwrap();
        assert_eq!(config.sample_length, 0.25);
        assert_eq!(config.importance_mode, ImportanceMode::ClassMean);
        assert_eq!(config.edge_annealing.reduction, 0.95);
        assert_eq!(config.edge_annealing.limit, 0.1);
        assert_eq!(config.cell_size, DEFAULT_CELL_SIZE);
    }

    #[test]
    fn rejects_non_positive_sample_length() {
        let err = BundlingConfig::from_toml_str("sample_length = 0.0").unwrap_err();
        assert!(err.to_string().contains("sample_length"));
    }

    #[test]
    fn rejects_reduction_outside_unit_interval() {
        let err = BundlingConfig::from_toml_str("[node_annealing]\nreduction = 1.0").unwrap_err();
        assert!(matches!(err, BundleError::Config(_)));
    }

    #[test]
    fn rejects_limit_above_bandwidth() {
        let annealing = AnnealingConfig {
            bandwidth: 1.0,
            reduction: 0.9,
            limit: 2.0,
        };
        assert!(annealing.validate("edge").is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = BundlingConfig::from_toml_str("sample_length = [").unwrap_err();
        assert!(matches!(err, BundleError::Toml(_)));
    }
}
