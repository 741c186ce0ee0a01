//! Error and warning types for mapping runs.

use serde::Serialize;
use thiserror::Error;

/// Failures while turning subject masks into a lesion matrix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// No subject masks were supplied.
    #[error("no lesion masks supplied")]
    NoMasks,

    /// The analysis mask contains no voxels.
    #[error("analysis mask is empty")]
    EmptyMask,

    /// A subject mask does not share the analysis mask geometry.
    #[error("lesion mask {index} does not match the analysis mask geometry")]
    GeometryMismatch { index: usize },

    /// Data length disagrees with the declared dimensions.
    #[error("volume holds {actual} voxels but its geometry declares {expected}")]
    DataLength { expected: usize, actual: usize },

    /// A voxel index lies outside the volume.
    #[error("voxel {voxel} is outside a volume of {n_voxels} voxels")]
    VoxelOutOfRange { voxel: usize, n_voxels: usize },
}

/// Errors that abort a mapping run before any result is produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    /// Invalid method, correction, or parameter combination.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Inputs whose shape or content cannot be analyzed.
    #[error("input shape error: {0}")]
    InputShape(String),

    /// Lesion matrix construction failed.
    #[error("build error: {0}")]
    Build(#[from] BuildError),

    /// A permutation worker thread panicked; its share of the null is lost.
    #[error("permutation worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },
}

impl MappingError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::InputShape(msg.into())
    }
}

/// Result type for mapping operations.
pub type MappingResult<T> = Result<T, MappingError>;

/// Non-fatal conditions recorded in the run output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingWarning {
    /// Columns whose statistic, p-value, or z-score was not finite; they
    /// were zeroed.
    NumericAnomaly { columns: Vec<usize> },

    /// A correction was requested that the method does not use.
    IgnoredCorrection { correction: String, method: String },

    /// The permutation loop stopped before the requested count.
    PermutationsTruncated { requested: usize, completed: usize },
}

impl std::fmt::Display for MappingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NumericAnomaly { columns } => write!(
                f,
                "{} column(s) produced NaN/infinite values and were zeroed",
                columns.len()
            ),
            Self::IgnoredCorrection { correction, method } => {
                write!(f, "correction '{correction}' is not used by method '{method}'")
            }
            Self::PermutationsTruncated {
                requested,
                completed,
            } => write!(
                f,
                "permutations stopped early: {completed} of {requested} completed"
            ),
        }
    }
}
