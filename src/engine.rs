//! Engine-wide tuning.
//!
//! `EngineConfig` selects between cheap and precise code paths (narrow phase,
//! voxel occupancy) and carries the numeric tolerances. It is passed
//! explicitly to every operation that needs it; there is no ambient state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Narrow-phase strategy for non-sphere pairs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NarrowPhase {
    /// Separating-axis test per oriented sub-box pair. Exact for box
    /// decompositions.
    Obb,
    /// Corner containment through parity ray casts against the other
    /// surface. Approximate: an edge passing through a face with no corner
    /// inside the other solid goes undetected.
    Mesh,
}

impl fmt::Display for NarrowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NarrowPhase::Obb => "obb",
            NarrowPhase::Mesh => "mesh",
        })
    }
}

impl FromStr for NarrowPhase {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "obb" => Ok(NarrowPhase::Obb),
            "mesh" => Ok(NarrowPhase::Mesh),
            other => Err(format!("unknown narrow phase '{other}', expected obb or mesh")),
        }
    }
}

/// How voxel centers are classified as occupied.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyMode {
    /// Inside any object's world AABB. Over-counts non-box shapes.
    Aabb,
    /// Analytic containment for spheres and compounds, AABB for plain boxes.
    Hybrid,
    /// Analytic containment for every shape.
    Exact,
}

impl fmt::Display for OccupancyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OccupancyMode::Aabb => "aabb",
            OccupancyMode::Hybrid => "hybrid",
            OccupancyMode::Exact => "exact",
        })
    }
}

impl FromStr for OccupancyMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aabb" => Ok(OccupancyMode::Aabb),
            "hybrid" => Ok(OccupancyMode::Hybrid),
            "exact" => Ok(OccupancyMode::Exact),
            other => Err(format!("unknown occupancy mode '{other}', expected aabb, hybrid or exact")),
        }
    }
}

/// Tolerances and precision switches shared by the engine components.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Margin shrunk off every solid before overlap tests so touching
    /// contact is legal.
    pub contact_epsilon: f64,
    /// Vertical increment of the resting-height scan.
    pub rest_step: f64,
    pub resolver_iterations: usize,
    /// Factor applied to each separating translation.
    pub resolver_overshoot: f64,
    pub narrow_phase: NarrowPhase,
    /// Voxels per zone axis for quality measurement.
    pub quality_resolution: usize,
    /// Voxels per zone axis inside search and optimizer loops.
    pub fitness_resolution: usize,
    pub quality_occupancy: OccupancyMode,
    pub fitness_occupancy: OccupancyMode,
    pub empty_weight: f64,
    pub fragment_weight: f64,
    /// Maximum ring radius of the staging search.
    pub staging_ring_cap: usize,
    /// Whether staging may stack objects once the floor is full.
    pub staging_stacking: bool,
}

impl EngineConfig {
    pub const DEFAULT_CONTACT_EPSILON: f64 = 0.25;
    pub const DEFAULT_REST_STEP: f64 = 0.5;
    pub const DEFAULT_RESOLVER_ITERATIONS: usize = 20;
    pub const DEFAULT_RESOLVER_OVERSHOOT: f64 = 1.001;
    pub const DEFAULT_NARROW_PHASE: NarrowPhase = NarrowPhase::Obb;
    pub const DEFAULT_QUALITY_RESOLUTION: usize = 20;
    pub const DEFAULT_FITNESS_RESOLUTION: usize = 12;
    pub const DEFAULT_QUALITY_OCCUPANCY: OccupancyMode = OccupancyMode::Hybrid;
    pub const DEFAULT_FITNESS_OCCUPANCY: OccupancyMode = OccupancyMode::Hybrid;
    pub const DEFAULT_EMPTY_WEIGHT: f64 = 1.0;
    pub const DEFAULT_FRAGMENT_WEIGHT: f64 = 0.6;
    pub const DEFAULT_STAGING_RING_CAP: usize = 100;
    pub const DEFAULT_STAGING_STACKING: bool = true;

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            contact_epsilon: Self::DEFAULT_CONTACT_EPSILON,
            rest_step: Self::DEFAULT_REST_STEP,
            resolver_iterations: Self::DEFAULT_RESOLVER_ITERATIONS,
            resolver_overshoot: Self::DEFAULT_RESOLVER_OVERSHOOT,
            narrow_phase: Self::DEFAULT_NARROW_PHASE,
            quality_resolution: Self::DEFAULT_QUALITY_RESOLUTION,
            fitness_resolution: Self::DEFAULT_FITNESS_RESOLUTION,
            quality_occupancy: Self::DEFAULT_QUALITY_OCCUPANCY,
            fitness_occupancy: Self::DEFAULT_FITNESS_OCCUPANCY,
            empty_weight: Self::DEFAULT_EMPTY_WEIGHT,
            fragment_weight: Self::DEFAULT_FRAGMENT_WEIGHT,
            staging_ring_cap: Self::DEFAULT_STAGING_RING_CAP,
            staging_stacking: Self::DEFAULT_STAGING_STACKING,
        }
    }
}

/// Builder for `EngineConfig`.
#[derive(Clone, Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn contact_epsilon(mut self, epsilon: f64) -> Self {
        self.config.contact_epsilon = epsilon;
        self
    }

    pub fn rest_step(mut self, step: f64) -> Self {
        self.config.rest_step = step;
        self
    }

    pub fn resolver_iterations(mut self, iterations: usize) -> Self {
        self.config.resolver_iterations = iterations;
        self
    }

    pub fn resolver_overshoot(mut self, factor: f64) -> Self {
        self.config.resolver_overshoot = factor;
        self
    }

    pub fn narrow_phase(mut self, mode: NarrowPhase) -> Self {
        self.config.narrow_phase = mode;
        self
    }

    pub fn quality_resolution(mut self, resolution: usize) -> Self {
        self.config.quality_resolution = resolution;
        self
    }

    pub fn fitness_resolution(mut self, resolution: usize) -> Self {
        self.config.fitness_resolution = resolution;
        self
    }

    pub fn quality_occupancy(mut self, mode: OccupancyMode) -> Self {
        self.config.quality_occupancy = mode;
        self
    }

    pub fn fitness_occupancy(mut self, mode: OccupancyMode) -> Self {
        self.config.fitness_occupancy = mode;
        self
    }

    /// Sets the empty-ratio and fragmentation weights of the energy.
    pub fn energy_weights(mut self, empty: f64, fragment: f64) -> Self {
        self.config.empty_weight = empty;
        self.config.fragment_weight = fragment;
        self
    }

    pub fn staging_ring_cap(mut self, cap: usize) -> Self {
        self.config.staging_ring_cap = cap;
        self
    }

    pub fn staging_stacking(mut self, allow: bool) -> Self {
        self.config.staging_stacking = allow;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
