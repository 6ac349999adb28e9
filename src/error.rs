use thiserror::Error;

/// Errors raised by the simulation core.
///
/// Configuration problems are reported before a run starts. The remaining
/// variants signal broken engine invariants and abort the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("invalid configuration for `{field}`: {reason}")]
    Configuration { field: String, reason: String },

    #[error("cell ({row}, {col}) is already occupied")]
    OccupancyConflict { row: usize, col: usize },

    #[error("cell ({row}, {col}) is outside the grid")]
    OutOfBounds { row: usize, col: usize },

    #[error("unknown agent {0}")]
    UnknownAgent(usize),
}

impl SimError {
    pub fn config(field: &str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
