//! Mapping run configuration.
//!
//! Every field has a default, so a JSON config file only needs the settings
//! it changes:
//!
//! ```json
//! { "method": "ttest", "correction": "FWERperm", "n_permutations": 5000, "seed": 42 }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use lesymap_stats::Alternative;

use crate::cluster::Connectivity;
use crate::correction::CorrectionMethod;
use crate::error::{MappingError, MappingResult};
use crate::lesion_size::LesionSizeCorrection;
use crate::mask::MinSubjects;
use crate::method::Method;
use crate::sccan::SccanOptions;

/// Settings of one mapping run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub method: Method,
    pub correction: CorrectionMethod,
    /// Significance level for p-value corrections and the FWER quantile.
    pub p_threshold: f64,
    /// Permutations for FWER and cluster corrections.
    pub n_permutations: usize,
    /// Significance level for the cluster-size quantile.
    pub cluster_p_threshold: f64,
    /// Voxel p-value that defines suprathreshold clusters.
    pub cluster_voxel_p_threshold: f64,
    /// Rank of the permutation peak statistic (1 = maximum).
    pub peak_rank: usize,
    /// Merge voxels with identical lesion patterns.
    pub patching: bool,
    pub min_subjects: MinSubjects,
    pub lesion_size_correction: LesionSizeCorrection,
    pub alternative: Alternative,
    /// Overrides the pooled/unpooled variance choice of `ttest`/`welch`.
    pub equal_variance: Option<bool>,
    /// Permutations for small-group Brunner–Munzel columns.
    pub bm_permutations: usize,
    /// Per-column permutations for `regresPerm`.
    pub regression_permutations: usize,
    /// Per-column permutations for chi-square; `None` is asymptotic.
    pub chisq_permutations: Option<usize>,
    pub chisq_yates: bool,
    pub sccan: SccanOptions,
    pub connectivity: Connectivity,
    pub seed: Option<u64>,
    /// Permutation worker threads; `None` uses all cores.
    pub threads: Option<usize>,
    /// Wall-clock budget for the permutation loop, in seconds.
    pub time_limit_secs: Option<f64>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            method: Method::RankSum,
            correction: CorrectionMethod::BenjaminiHochberg,
            p_threshold: 0.05,
            n_permutations: 1000,
            cluster_p_threshold: 0.05,
            cluster_voxel_p_threshold: 0.001,
            peak_rank: 1,
            patching: true,
            min_subjects: MinSubjects::default(),
            lesion_size_correction: LesionSizeCorrection::None,
            alternative: Alternative::Greater,
            equal_variance: None,
            bm_permutations: 20_000,
            regression_permutations: 1000,
            chisq_permutations: None,
            chisq_yates: true,
            sccan: SccanOptions::default(),
            connectivity: Connectivity::Vertices,
            seed: None,
            threads: None,
            time_limit_secs: None,
        }
    }
}

fn check_probability(name: &str, value: f64) -> MappingResult<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(MappingError::config(format!(
            "{name} must lie strictly between 0 and 1, got {value}"
        )))
    }
}

impl MappingConfig {
    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> MappingResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MappingError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            MappingError::config(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Check the settings on their own, independent of any input data.
    pub fn validate(&self) -> MappingResult<()> {
        let info = self.method.info();
        check_probability("p_threshold", self.p_threshold)?;

        if self.correction.is_permutation() {
            if !info.permutation_correction {
                return Err(MappingError::config(format!(
                    "correction '{}' is not available for method '{}'",
                    self.correction, self.method
                )));
            }
            if self.n_permutations == 0 {
                return Err(MappingError::config(format!(
                    "correction '{}' needs a positive number of permutations",
                    self.correction
                )));
            }
            if self.peak_rank == 0 {
                return Err(MappingError::config("peak_rank must be at least 1"));
            }
        }
        if self.correction == CorrectionMethod::ClusterExtent {
            check_probability("cluster_p_threshold", self.cluster_p_threshold)?;
            check_probability("cluster_voxel_p_threshold", self.cluster_voxel_p_threshold)?;
        }

        if info.binary_behavior && self.lesion_size_correction.corrects_behavior() {
            return Err(MappingError::config(format!(
                "lesion size correction '{}' residualizes behavior, which method '{}' requires to stay binary",
                self.lesion_size_correction, self.method
            )));
        }

        if self.bm_permutations == 0
            || self.regression_permutations == 0
            || self.chisq_permutations == Some(0)
        {
            return Err(MappingError::config(
                "per-column permutation counts must be positive",
            ));
        }
        if self.threads == Some(0) {
            return Err(MappingError::config("threads must be at least 1"));
        }
        if self.time_limit_secs.is_some_and(|t| !(t > 0.0 && t.is_finite())) {
            return Err(MappingError::config("time limit must be a positive number of seconds"));
        }

        if self.method == Method::Sccan {
            let s = &self.sccan;
            if !(s.lower > 0.0 && s.lower < s.upper && s.upper <= 1.0) {
                return Err(MappingError::config(format!(
                    "sparseness search range [{}, {}] must satisfy 0 < lower < upper <= 1",
                    s.lower, s.upper
                )));
            }
            if let Some(sparseness) = s.sparseness
                && !(sparseness > 0.0 && sparseness <= 1.0)
            {
                return Err(MappingError::config(format!(
                    "sparseness must lie in (0, 1], got {sparseness}"
                )));
            }
            if s.folds < 2 {
                return Err(MappingError::config("SCCAN needs at least 2 cross-validation folds"));
            }
            if s.tolerance <= 0.0 {
                return Err(MappingError::config("sparseness search tolerance must be positive"));
            }
            check_probability("sccan.p_threshold", s.p_threshold)?;
        }
        Ok(())
    }
}
