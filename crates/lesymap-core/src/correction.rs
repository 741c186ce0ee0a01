//! Multiple-comparison correction of a per-column test result.
//!
//! Standard corrections adjust p-values; the permutation corrections compare
//! the observed map against a threshold taken from a
//! [`NullDistribution`](crate::permutation::NullDistribution). Columns that
//! do not survive have their statistic (and z-score) set to zero.

use serde::{Deserialize, Serialize};

use lesymap_stats::Alternative;

use crate::cluster::{Connectivity, label_components};
use crate::method::TestResult;
use crate::patch::PatchIndex;
use crate::permutation::suprathreshold_voxels;
use crate::volume::Geometry;

/// Correction applied to the observed map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CorrectionMethod {
    None,
    Bonferroni,
    Holm,
    Hochberg,
    /// Benjamini–Hochberg false discovery rate.
    #[default]
    BenjaminiHochberg,
    /// Benjamini–Yekutieli false discovery rate under dependence.
    BenjaminiYekutieli,
    /// Permutation threshold on the peak statistic.
    FamilyWise,
    /// Permutation threshold on cluster size.
    ClusterExtent,
}

impl CorrectionMethod {
    /// Needs a permutation null distribution.
    pub fn is_permutation(self) -> bool {
        matches!(self, Self::FamilyWise | Self::ClusterExtent)
    }
}

impl std::fmt::Display for CorrectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Bonferroni => "bonferroni",
            Self::Holm => "holm",
            Self::Hochberg => "hochberg",
            Self::BenjaminiHochberg => "BH",
            Self::BenjaminiYekutieli => "BY",
            Self::FamilyWise => "FWERperm",
            Self::ClusterExtent => "clusterPerm",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CorrectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "bonferroni" => Ok(Self::Bonferroni),
            "holm" => Ok(Self::Holm),
            "hochberg" => Ok(Self::Hochberg),
            "BH" | "fdr" => Ok(Self::BenjaminiHochberg),
            "BY" => Ok(Self::BenjaminiYekutieli),
            "FWERperm" => Ok(Self::FamilyWise),
            "clusterPerm" => Ok(Self::ClusterExtent),
            _ => Err(format!(
                "unknown correction '{s}' (expected one of: none, bonferroni, holm, hochberg, BH, fdr, BY, FWERperm, clusterPerm)"
            )),
        }
    }
}

impl TryFrom<String> for CorrectionMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CorrectionMethod> for String {
    fn from(value: CorrectionMethod) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// p-value adjustment
// ---------------------------------------------------------------------------

/// Adjust p-values for multiple comparisons.
///
/// Permutation methods return the p-values unchanged.
pub fn p_adjust(p: &[f64], method: CorrectionMethod) -> Vec<f64> {
    let n = p.len();
    if n == 0 {
        return Vec::new();
    }
    let nf = n as f64;
    let mut order: Vec<usize> = (0..n).collect();
    let mut adjusted = vec![0.0; n];

    match method {
        CorrectionMethod::None | CorrectionMethod::FamilyWise | CorrectionMethod::ClusterExtent => {
            return p.to_vec();
        }
        CorrectionMethod::Bonferroni => {
            return p.iter().map(|&v| (v * nf).min(1.0)).collect();
        }
        CorrectionMethod::Holm => {
            order.sort_by(|&a, &b| p[a].total_cmp(&p[b]));
            let mut running = 0.0f64;
            for (i, &idx) in order.iter().enumerate() {
                running = running.max((nf - i as f64) * p[idx]);
                adjusted[idx] = running.min(1.0);
            }
        }
        CorrectionMethod::Hochberg => {
            order.sort_by(|&a, &b| p[b].total_cmp(&p[a]));
            let mut running = f64::INFINITY;
            for (i, &idx) in order.iter().enumerate() {
                // i-th largest p has multiplier i + 1
                running = running.min((i as f64 + 1.0) * p[idx]);
                adjusted[idx] = running.min(1.0);
            }
        }
        CorrectionMethod::BenjaminiHochberg | CorrectionMethod::BenjaminiYekutieli => {
            let q = if method == CorrectionMethod::BenjaminiYekutieli {
                (1..=n).map(|i| 1.0 / i as f64).sum::<f64>()
            } else {
                1.0
            };
            order.sort_by(|&a, &b| p[b].total_cmp(&p[a]));
            let mut running = f64::INFINITY;
            for (i, &idx) in order.iter().enumerate() {
                let rank = (n - i) as f64;
                running = running.min(q * nf / rank * p[idx]);
                adjusted[idx] = running.min(1.0);
            }
        }
    }
    adjusted
}

/// [`p_adjust`] as if column `j` were repeated `weights[j]` times.
///
/// Tied p-values receive identical adjusted values, so each column takes the
/// value of its copies. The result matches adjusting the unpatched voxel map.
pub fn p_adjust_weighted(p: &[f64], weights: &[usize], method: CorrectionMethod) -> Vec<f64> {
    if weights.iter().all(|&w| w == 1) {
        return p_adjust(p, method);
    }
    let mut expanded = Vec::with_capacity(weights.iter().sum());
    let mut first = Vec::with_capacity(p.len());
    for (&v, &w) in p.iter().zip(weights) {
        first.push(expanded.len());
        expanded.extend(std::iter::repeat_n(v, w));
    }
    let adjusted = p_adjust(&expanded, method);
    p.iter()
        .zip(weights)
        .zip(first)
        .map(|((&raw, &w), start)| if w == 0 { raw } else { adjusted[start] })
        .collect()
}

// ---------------------------------------------------------------------------
// Applying a correction
// ---------------------------------------------------------------------------

/// How survivors are decided.
#[derive(Debug, Clone, Copy)]
pub enum CorrectionPolicy<'a> {
    /// Keep columns whose adjusted p-value is below `p_threshold`.
    Standard {
        method: CorrectionMethod,
        p_threshold: f64,
        weights: &'a [usize],
    },
    /// Keep columns whose oriented statistic reaches `threshold`.
    FamilyWise {
        orientation: Alternative,
        threshold: Option<f64>,
    },
    /// Keep voxels in suprathreshold clusters of at least `cluster_threshold`
    /// voxels.
    ClusterExtent {
        voxel_p_threshold: f64,
        cluster_threshold: Option<f64>,
        connectivity: Connectivity,
        geometry: &'a Geometry,
        index: &'a PatchIndex,
    },
}

/// Corrected map. All values are finite.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionResult {
    pub statistic: Vec<f64>,
    /// Adjusted p-values for standard corrections, raw otherwise.
    pub p_value: Option<Vec<f64>>,
    pub z_score: Option<Vec<f64>>,
    pub threshold: Option<f64>,
    /// Per-voxel statistic over the analysis domain, when survival is
    /// decided per voxel (cluster correction).
    pub voxel_statistic: Option<Vec<f64>>,
    /// Columns zeroed because the test produced non-finite values.
    pub anomalies: Vec<usize>,
}

impl CorrectionResult {
    pub fn surviving_columns(&self) -> usize {
        self.statistic.iter().filter(|&&s| s != 0.0).count()
    }
}

/// Zero every column with a non-finite statistic, p-value or z-score and
/// return their indices. Their p-value becomes 1.
pub fn sanitize(result: &mut TestResult) -> Vec<usize> {
    let mut bad = Vec::new();
    for j in 0..result.statistic.len() {
        let finite = result.statistic[j].is_finite()
            && result.p_value.as_ref().is_none_or(|p| p[j].is_finite())
            && result.z_score.as_ref().is_none_or(|z| z[j].is_finite());
        if !finite {
            bad.push(j);
            result.statistic[j] = 0.0;
            if let Some(p) = result.p_value.as_mut() {
                p[j] = 1.0;
            }
            if let Some(z) = result.z_score.as_mut() {
                z[j] = 0.0;
            }
        }
    }
    if !bad.is_empty() {
        log::warn!("{} column(s) produced non-finite values and were zeroed", bad.len());
    }
    bad
}

/// Sanitize `result` and apply `policy`.
pub fn apply(mut result: TestResult, policy: CorrectionPolicy<'_>) -> CorrectionResult {
    let anomalies = sanitize(&mut result);
    let TestResult {
        mut statistic,
        p_value,
        mut z_score,
    } = result;

    fn zero(j: usize, statistic: &mut [f64], z_score: &mut Option<Vec<f64>>) {
        statistic[j] = 0.0;
        if let Some(z) = z_score.as_mut() {
            z[j] = 0.0;
        }
    }

    match policy {
        CorrectionPolicy::Standard {
            method,
            p_threshold,
            weights,
        } => {
            let Some(raw) = p_value else {
                return CorrectionResult {
                    statistic,
                    p_value: None,
                    z_score,
                    threshold: None,
                    voxel_statistic: None,
                    anomalies,
                };
            };
            let adjusted = p_adjust_weighted(&raw, weights, method);
            for (j, &p) in adjusted.iter().enumerate() {
                if p >= p_threshold {
                    zero(j, &mut statistic, &mut z_score);
                }
            }
            CorrectionResult {
                statistic,
                p_value: Some(adjusted),
                z_score,
                threshold: Some(p_threshold),
                voxel_statistic: None,
                anomalies,
            }
        }
        CorrectionPolicy::FamilyWise {
            orientation,
            threshold,
        } => {
            for j in 0..statistic.len() {
                let keep = threshold.is_some_and(|t| orientation.orient(statistic[j]) >= t);
                if !keep {
                    zero(j, &mut statistic, &mut z_score);
                }
            }
            CorrectionResult {
                statistic,
                p_value,
                z_score,
                threshold,
                voxel_statistic: None,
                anomalies,
            }
        }
        CorrectionPolicy::ClusterExtent {
            voxel_p_threshold,
            cluster_threshold,
            connectivity,
            geometry,
            index,
        } => {
            let mut voxel_statistic = vec![0.0; index.voxels().len()];
            let mut column_survives = vec![false; statistic.len()];
            if let (Some(raw), Some(min_size)) = (p_value.as_deref(), cluster_threshold) {
                let mask = suprathreshold_voxels(raw, voxel_p_threshold, geometry, index);
                let components = label_components(&mask, geometry, connectivity);
                log::debug!(
                    "{} suprathreshold cluster(s), largest {} voxels, minimum size {min_size:.1}",
                    components.len(),
                    components.largest()
                );
                for (k, (&voxel, &column)) in
                    index.voxels().iter().zip(index.columns()).enumerate()
                {
                    let size = components.size_at(voxel);
                    if size > 0 && size as f64 >= min_size {
                        voxel_statistic[k] = statistic[column];
                        column_survives[column] = true;
                    }
                }
            }
            for (j, survives) in column_survives.into_iter().enumerate() {
                if !survives {
                    zero(j, &mut statistic, &mut z_score);
                }
            }
            CorrectionResult {
                statistic,
                p_value,
                z_score,
                threshold: cluster_threshold,
                voxel_statistic: Some(voxel_statistic),
                anomalies,
            }
        }
    }
}
