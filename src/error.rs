//! Error types for the placement engine.

use thiserror::Error;

use crate::model::{ObjectId, ZoneId};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Conditions surfaced by the public engine operations.
///
/// `PlacementFailed` and `ResidualOverlap` are recoverable by the caller
/// (typically by falling back to the staging zone). `DegenerateGeometry` is
/// raised at construction time before any placement is attempted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The search exhausted its candidates.
    #[error("No legal position found for object {id} in the {zone} zone")]
    PlacementFailed { id: ObjectId, zone: ZoneId },

    /// The penetration resolver hit its iteration cap without separating the object.
    #[error("Object {id} still overlaps object {other} after penetration resolution")]
    ResidualOverlap { id: ObjectId, other: ObjectId },

    /// Zero, negative or non-finite extents.
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// No object with this id exists in the scene.
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),
}

impl EngineError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::PlacementFailed { .. } => "placement_failed",
            EngineError::ResidualOverlap { .. } => "residual_overlap",
            EngineError::DegenerateGeometry(_) => "degenerate_geometry",
            EngineError::UnknownObject(_) => "unknown_object",
        }
    }
}
