//! Layout parameters and construction-time constants

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, LayoutResult};

/// Children per cluster in the hierarchical tree
pub const BRANCHING_FACTOR: u32 = 4;

/// Capacity of the per-node traversal stack in the repulsive pass.
/// Entries that do not fit are dropped.
pub const STACK_CAPACITY: u32 = 64;

/// Scale used to store the bounding box as fixed-point integers
pub const FIXED_POINT_SCALE: f32 = 1000.0;

/// Quantisation bits per axis for the spatial keys (2 x 16 = 32-bit key)
pub const MORTON_BITS_PER_AXIS: u32 = 16;

/// Default ideal edge length
pub const DEFAULT_IDEAL_LENGTH: f32 = 0.01;

/// Default starting cooling factor
pub const DEFAULT_INITIAL_COOLING: f32 = 0.985;

/// Default multiplicative cooling decay per iteration
pub const DEFAULT_COOLING_DECAY: f32 = 0.975;

/// Cooling factor below which a run is considered converged
pub const DEFAULT_MIN_COOLING: f32 = 0.0001;

/// Default Barnes-Hut opening angle
pub const DEFAULT_THETA: f32 = 0.8;

/// Default maximum number of iterations per run
pub const DEFAULT_ITERATION_BUDGET: u32 = 1000;

/// Default number of iterations between host/device synchronisations
pub const DEFAULT_SYNC_INTERVAL: u32 = 10;

/// Lower bound of the working coordinate domain
pub const DEFAULT_DOMAIN_LOW: f32 = -7.0;

/// Upper bound of the working coordinate domain
pub const DEFAULT_DOMAIN_HIGH: f32 = 8.0;

/// Parameters for one layout run.
///
/// These are fixed for the duration of a run; the engine only accepts a new
/// configuration between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Target distance between connected nodes
    pub ideal_length: f32,
    /// Cooling factor at the start of a run (maximum step length)
    pub initial_cooling: f32,
    /// Multiplier applied to the cooling factor after every iteration
    pub cooling_decay: f32,
    /// Runs stop once the cooling factor drops below this value
    pub min_cooling: f32,
    /// Barnes-Hut opening angle
    pub theta: f32,
    /// Maximum number of iterations
    pub iteration_budget: u32,
    /// Iterations between host/device synchronisation points
    pub sync_interval: u32,
    /// Lower bound of the working domain (both axes)
    pub domain_low: f32,
    /// Upper bound of the working domain (both axes)
    pub domain_high: f32,
    /// Treat a graph without edges as "no data"
    pub require_edges: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            ideal_length: DEFAULT_IDEAL_LENGTH,
            initial_cooling: DEFAULT_INITIAL_COOLING,
            cooling_decay: DEFAULT_COOLING_DECAY,
            min_cooling: DEFAULT_MIN_COOLING,
            theta: DEFAULT_THETA,
            iteration_budget: DEFAULT_ITERATION_BUDGET,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            domain_low: DEFAULT_DOMAIN_LOW,
            domain_high: DEFAULT_DOMAIN_HIGH,
            require_edges: true,
        }
    }
}

impl LayoutConfig {
    /// Load a configuration from a YAML or JSON file (chosen by extension).
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_path(path: &Path) -> LayoutResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that all parameters are usable
    pub fn validate(&self) -> LayoutResult<()> {
        let invalid = |msg: String| Err(LayoutError::InvalidConfig(msg));
        if !(self.ideal_length > 0.0 && self.ideal_length.is_finite()) {
            return invalid(format!("ideal_length must be positive, got {}", self.ideal_length));
        }
        if !(self.cooling_decay > 0.0 && self.cooling_decay < 1.0) {
            return invalid(format!(
                "cooling_decay must be in (0, 1), got {}",
                self.cooling_decay
            ));
        }
        if !(self.initial_cooling > 0.0 && self.initial_cooling.is_finite()) {
            return invalid(format!(
                "initial_cooling must be positive, got {}",
                self.initial_cooling
            ));
        }
        if self.min_cooling < 0.0 {
            return invalid(format!("min_cooling must not be negative, got {}", self.min_cooling));
        }
        if !(self.theta > 0.0) {
            return invalid(format!("theta must be positive, got {}", self.theta));
        }
        if self.sync_interval == 0 {
            return invalid("sync_interval must be at least 1".to_string());
        }
        if !(self.domain_low < self.domain_high) {
            return invalid(format!(
                "domain [{}, {}] is empty",
                self.domain_low, self.domain_high
            ));
        }
        Ok(())
    }
}
