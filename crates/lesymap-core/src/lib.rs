//! # lesymap-core
//!
//! **Which lesioned voxels explain a behavioral deficit?**
//!
//! `lesymap-core` maps the association between per-subject binary lesion
//! masks and a per-subject behavioral score, voxel by voxel, and corrects
//! the resulting map for the thousands of comparisons involved.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lesymap_core::{BinaryVolume, Geometry, MappingConfig, MappingInput, run_mapping};
//!
//! let geometry = Geometry::new([4, 4, 1]);
//! let masks: Vec<BinaryVolume> = (0..20)
//!     .map(|i| BinaryVolume::from_indices(geometry.clone(), &[i % 16]).unwrap())
//!     .collect();
//! let behavior: Vec<f64> = (0..20).map(|i| i as f64).collect();
//!
//! let config = MappingConfig { method: "ttest".parse().unwrap(), ..Default::default() };
//! let input = MappingInput::Masks { masks, mask: None, behavior, covariates: None };
//! let outcome = run_mapping(input, &config).unwrap();
//! if let Some(map) = outcome.map() {
//!     println!("{} columns survive", map.correction.surviving_columns);
//! }
//! ```
//!
//! ## Architecture
//!
//! Masks → analysis mask → patches → test → (permutation null) → correction → voxel map
//!
//! Voxels lesioned in exactly the same subjects are merged into one
//! *patch* and tested once ([`PatchMatrixBuilder`]). Every method implements
//! the [`StatisticalTest`] trait; [`Method`] is the registry of available
//! methods. Corrections are either standard p-value adjustments or
//! thresholds drawn from a [`PermutationEngine`] null distribution.

pub mod cluster;
pub mod config;
pub mod correction;
pub mod error;
pub mod lesion_size;
pub mod mask;
pub mod matrix;
pub mod method;
pub mod patch;
pub mod permutation;
pub mod pipeline;
pub mod sccan;
pub mod volume;

pub use cluster::{Components, Connectivity, cluster_sizes, label_components};
pub use config::MappingConfig;
pub use correction::{
    CorrectionMethod, CorrectionPolicy, CorrectionResult, p_adjust, p_adjust_weighted, sanitize,
};
pub use error::{BuildError, MappingError, MappingResult, MappingWarning};
pub use lesion_size::LesionSizeCorrection;
pub use mask::{MinSubjects, derive_mask};
pub use matrix::LesionMatrix;
pub use method::{Method, MethodInfo, StatisticalTest, TestContext, TestResult};
pub use patch::{Extent, Patch, PatchIndex, PatchMatrixBuilder, PatchedLesions, lesion_sizes};
pub use permutation::{NullDistribution, NullMode, PermutationEngine, PermutationPlan, quantile};
pub use pipeline::{
    CorrectionSummary, MappingInput, MappingOutcome, MappingOutput, PatchSummary, SccanSummary,
    run_mapping, run_mapping_with_abort, validate,
};
pub use sccan::{SccanFit, SccanOptions, SccanTest};
pub use volume::{BinaryVolume, Geometry, Volume};

pub use lesymap_stats::{Alternative, BM_PERMUTATION_MIN_GROUP};
pub use nalgebra::DMatrix;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
