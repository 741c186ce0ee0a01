//! End-to-end mapping run.
//!
//! masks → analysis mask → patched lesion matrix → lesion-size correction →
//! statistical test → (permutation null) → correction → voxel map.
//!
//! Every configuration and input-shape check happens in [`validate`] before
//! any matrix is built, so a run either fails fast or produces a complete
//! [`MappingOutput`].

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use nalgebra::DMatrix;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use lesymap_stats::binary_classes;

use crate::config::MappingConfig;
use crate::correction::{self, CorrectionMethod, CorrectionPolicy, CorrectionResult};
use crate::error::{BuildError, MappingError, MappingResult, MappingWarning};
use crate::mask::derive_mask;
use crate::matrix::LesionMatrix;
use crate::method::{Method, TestContext, TestResult};
use crate::patch::{Patch, PatchIndex, PatchMatrixBuilder, lesion_sizes};
use crate::permutation::{NullDistribution, NullMode, PermutationEngine, PermutationPlan};
use crate::sccan::SccanTest;
use crate::volume::{BinaryVolume, Geometry, Volume};

/// Data for one mapping run.
#[derive(Debug, Clone)]
pub enum MappingInput {
    /// Subject lesion masks; the analysis mask is derived from them and
    /// restricted to `mask` when given.
    Masks {
        masks: Vec<BinaryVolume>,
        mask: Option<BinaryVolume>,
        behavior: Vec<f64>,
        /// N×k nuisance regressors.
        covariates: Option<DMatrix<f64>>,
    },
    /// A prepared lesion matrix. `weights` gives the voxel count behind each
    /// column (all ones when absent).
    Matrix {
        lesions: LesionMatrix,
        behavior: Vec<f64>,
        covariates: Option<DMatrix<f64>>,
        weights: Option<Vec<usize>>,
    },
}

impl MappingInput {
    pub fn n_subjects(&self) -> usize {
        match self {
            Self::Masks { masks, .. } => masks.len(),
            Self::Matrix { lesions, .. } => lesions.n_subjects(),
        }
    }

    pub fn behavior(&self) -> &[f64] {
        match self {
            Self::Masks { behavior, .. } | Self::Matrix { behavior, .. } => behavior,
        }
    }

    pub fn covariates(&self) -> Option<&DMatrix<f64>> {
        match self {
            Self::Masks { covariates, .. } | Self::Matrix { covariates, .. } => covariates.as_ref(),
        }
    }
}

/// How the map was corrected.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionSummary {
    pub method: CorrectionMethod,
    pub p_threshold: f64,
    /// Adjusted-p cutoff, peak-statistic threshold, or minimum cluster size.
    pub threshold: Option<f64>,
    /// Permutation null sample, in completion order.
    pub null_distribution: Option<Vec<f64>>,
    pub permutations_requested: Option<usize>,
    pub permutations_completed: Option<usize>,
    pub aborted: bool,
    pub surviving_columns: usize,
    /// Columns zeroed for non-finite values.
    pub anomalous_columns: usize,
}

/// Patch compression of the analysis.
#[derive(Debug, Clone, Serialize)]
pub struct PatchSummary {
    pub patched: bool,
    pub n_voxels: usize,
    pub n_columns: usize,
    pub patches: Vec<Patch>,
}

/// Sparse canonical correlation details.
#[derive(Debug, Clone, Serialize)]
pub struct SccanSummary {
    pub sparseness: f64,
    pub cv_correlation: Option<f64>,
    pub cv_p_value: Option<f64>,
}

/// A completed map.
#[derive(Debug, Clone, Serialize)]
pub struct MappingOutput {
    pub method: Method,
    pub n_subjects: usize,
    /// Per-column statistic; columns that did not survive are zero.
    pub statistic: Vec<f64>,
    pub p_value: Option<Vec<f64>>,
    pub z_score: Option<Vec<f64>>,
    pub correction: CorrectionSummary,
    pub patches: Option<PatchSummary>,
    pub sccan: Option<SccanSummary>,
    pub warnings: Vec<MappingWarning>,
    /// Lesion size of each subject, in voxels.
    pub lesion_sizes: Vec<f64>,
    /// Statistic in voxel space (mask input only).
    #[serde(skip)]
    pub statistic_map: Option<Volume>,
    #[serde(skip)]
    pub analysis_mask: Option<BinaryVolume>,
}

/// Result of a mapping run.
#[derive(Debug, Clone)]
pub enum MappingOutcome {
    Map(Box<MappingOutput>),
    /// SCCAN found no cross-validated association.
    Null {
        cv_correlation: f64,
        cv_p_value: f64,
        sparseness: f64,
    },
}

impl MappingOutcome {
    pub fn map(&self) -> Option<&MappingOutput> {
        match self {
            Self::Map(output) => Some(output),
            Self::Null { .. } => None,
        }
    }

    pub fn into_map(self) -> Option<MappingOutput> {
        match self {
            Self::Map(output) => Some(*output),
            Self::Null { .. } => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null { .. })
    }
}

/// Check `config` and the shape of `input` without doing any analysis.
pub fn validate(input: &MappingInput, config: &MappingConfig) -> MappingResult<()> {
    config.validate()?;
    let info = config.method.info();

    let n = match input {
        MappingInput::Masks { masks, mask, .. } => {
            let first = masks.first().ok_or(BuildError::NoMasks)?;
            let geometry = mask.as_ref().map_or(first.geometry(), |m| m.geometry());
            if let Some(index) = masks.iter().position(|m| !m.geometry().is_compatible(geometry)) {
                return Err(BuildError::GeometryMismatch { index }.into());
            }
            if mask.as_ref().is_some_and(BinaryVolume::is_empty) {
                return Err(MappingError::shape("the supplied analysis mask is empty"));
            }
            masks.len()
        }
        MappingInput::Matrix {
            lesions, weights, ..
        } => {
            if config.correction == CorrectionMethod::ClusterExtent {
                return Err(MappingError::config(
                    "cluster correction needs lesion masks to define voxel neighbourhoods",
                ));
            }
            if lesions.n_columns() == 0 {
                return Err(MappingError::shape("the lesion matrix has no columns"));
            }
            if let Some(w) = weights {
                if w.len() != lesions.n_columns() {
                    return Err(MappingError::shape(format!(
                        "{} column weights for {} columns",
                        w.len(),
                        lesions.n_columns()
                    )));
                }
                if w.contains(&0) {
                    return Err(MappingError::shape("column weights must be positive"));
                }
            }
            if lesions.columns().flatten().any(|v| !v.is_finite()) {
                return Err(MappingError::shape("the lesion matrix contains non-finite values"));
            }
            lesions.n_subjects()
        }
    };

    let behavior = input.behavior();
    if behavior.len() != n {
        return Err(MappingError::shape(format!(
            "behavior has {} values but there are {n} subjects",
            behavior.len()
        )));
    }
    if n < 2 {
        return Err(MappingError::shape(format!("at least 2 subjects are needed, got {n}")));
    }
    if let Some(i) = behavior.iter().position(|b| !b.is_finite()) {
        return Err(MappingError::shape(format!("behavior of subject {i} is not finite")));
    }
    if info.binary_behavior && binary_classes(behavior).is_none() {
        let mut distinct: Vec<f64> = behavior.to_vec();
        distinct.sort_by(f64::total_cmp);
        distinct.dedup();
        return Err(MappingError::shape(format!(
            "method '{}' requires binary behavior (exactly two distinct values), found {}",
            config.method,
            distinct.len()
        )));
    }

    if let Some(c) = input.covariates() {
        if !info.covariates {
            return Err(MappingError::config(format!(
                "method '{}' does not accept covariates; use regres or regresPerm",
                config.method
            )));
        }
        if c.nrows() != n {
            return Err(MappingError::shape(format!(
                "covariates have {} rows but there are {n} subjects",
                c.nrows()
            )));
        }
        if c.iter().any(|v| !v.is_finite()) {
            return Err(MappingError::shape("covariates contain non-finite values"));
        }
        if n <= c.ncols() + 2 {
            return Err(MappingError::shape(format!(
                "{n} subjects cannot fit {} covariates plus intercept and voxel",
                c.ncols()
            )));
        }
    }
    Ok(())
}

/// Run a mapping analysis.
pub fn run_mapping(input: MappingInput, config: &MappingConfig) -> MappingResult<MappingOutcome> {
    run_mapping_with_abort(input, config, None)
}

/// [`run_mapping`] whose permutation loop stops when `abort` becomes true.
pub fn run_mapping_with_abort(
    input: MappingInput,
    config: &MappingConfig,
    abort: Option<Arc<AtomicBool>>,
) -> MappingResult<MappingOutcome> {
    validate(&input, config)?;
    let n_subjects = input.n_subjects();
    let seed = config.seed.unwrap_or_else(|| rand::rng().random());
    log::info!(
        "mapping {n_subjects} subjects with {} ({} correction)",
        config.method,
        config.correction
    );

    let prepared = prepare(input, config)?;
    let Prepared {
        mut lesions,
        mut behavior,
        covariates,
        index,
        weights,
        patches,
        geometry,
        analysis_mask,
        lesion_sizes,
    } = prepared;
    config
        .lesion_size_correction
        .apply(&mut lesions, &mut behavior, &lesion_sizes);

    let mut warnings = Vec::new();
    let mut sccan = None;
    let summary_base = CorrectionSummary {
        method: config.correction,
        p_threshold: config.p_threshold,
        threshold: None,
        null_distribution: None,
        permutations_requested: None,
        permutations_completed: None,
        aborted: false,
        surviving_columns: 0,
        anomalous_columns: 0,
    };

    let (corrected, mut summary) = if config.method == Method::Sccan {
        let test = SccanTest::new(config.sccan.clone());
        let fit = test.fit(&lesions, &behavior, &mut StdRng::seed_from_u64(seed));
        if !fit.significant {
            return Ok(MappingOutcome::Null {
                cv_correlation: fit.cv_correlation.unwrap_or(0.0),
                cv_p_value: fit.cv_p_value.unwrap_or(1.0),
                sparseness: fit.sparseness,
            });
        }
        if config.correction != CorrectionMethod::None {
            warnings.push(MappingWarning::IgnoredCorrection {
                correction: config.correction.to_string(),
                method: config.method.to_string(),
            });
        }
        sccan = Some(SccanSummary {
            sparseness: fit.sparseness,
            cv_correlation: fit.cv_correlation,
            cv_p_value: fit.cv_p_value,
        });
        let corrected = correction::apply(
            TestResult::statistic_only(fit.weights),
            CorrectionPolicy::Standard {
                method: CorrectionMethod::None,
                p_threshold: config.p_threshold,
                weights: &weights,
            },
        );
        (corrected, summary_base)
    } else {
        let test = config.method.build(config, covariates.clone());
        let observed = test.run(&lesions, &behavior, &mut TestContext::new(seed));
        log::debug!("tested {} columns", observed.len());

        match config.correction {
            CorrectionMethod::FamilyWise | CorrectionMethod::ClusterExtent => {
                let mut plan = PermutationPlan::new(config.n_permutations, weights.clone());
                plan.peak_rank = config.peak_rank;
                plan.seed = Some(seed);
                plan.threads = config.threads;
                plan.deadline = config
                    .time_limit_secs
                    .map(|s| Instant::now() + Duration::from_secs_f64(s));
                plan.abort = abort;
                plan.covariates = covariates;
                let engine = PermutationEngine::new(plan)?;

                let (null, corrected) = if config.correction == CorrectionMethod::FamilyWise {
                    let null = engine.run(&lesions, &behavior, test.as_ref(), NullMode::FamilyWise)?;
                    let threshold = null.threshold(config.p_threshold);
                    let corrected = correction::apply(
                        observed,
                        CorrectionPolicy::FamilyWise {
                            orientation: test.orientation(),
                            threshold,
                        },
                    );
                    (null, corrected)
                } else {
                    let geometry = geometry.as_ref().ok_or_else(|| {
                        MappingError::config("cluster correction needs lesion masks")
                    })?;
                    let mode = NullMode::ClusterExtent {
                        voxel_p_threshold: config.cluster_voxel_p_threshold,
                        connectivity: config.connectivity,
                        geometry,
                        index: &index,
                    };
                    let null = engine.run(&lesions, &behavior, test.as_ref(), mode)?;
                    let threshold = null.threshold(config.cluster_p_threshold);
                    let corrected = correction::apply(
                        observed,
                        CorrectionPolicy::ClusterExtent {
                            voxel_p_threshold: config.cluster_voxel_p_threshold,
                            cluster_threshold: threshold,
                            connectivity: config.connectivity,
                            geometry,
                            index: &index,
                        },
                    );
                    (null, corrected)
                };
                let summary = permutation_summary(summary_base, &null, &mut warnings);
                (corrected, summary)
            }
            standard => {
                let corrected = correction::apply(
                    observed,
                    CorrectionPolicy::Standard {
                        method: standard,
                        p_threshold: config.p_threshold,
                        weights: &weights,
                    },
                );
                (corrected, summary_base)
            }
        }
    };

    if !corrected.anomalies.is_empty() {
        warnings.push(MappingWarning::NumericAnomaly {
            columns: corrected.anomalies.clone(),
        });
    }
    for warning in &warnings {
        log::warn!("{warning}");
    }
    summary.threshold = corrected.threshold;
    summary.surviving_columns = corrected.surviving_columns();
    summary.anomalous_columns = corrected.anomalies.len();
    log::info!(
        "{} of {} columns survive correction",
        summary.surviving_columns,
        corrected.statistic.len()
    );

    let statistic_map = geometry
        .as_ref()
        .map(|g| voxel_map(g, &index, &corrected));
    let CorrectionResult {
        statistic,
        p_value,
        z_score,
        ..
    } = corrected;

    Ok(MappingOutcome::Map(Box::new(MappingOutput {
        method: config.method,
        n_subjects,
        statistic,
        p_value,
        z_score,
        correction: summary,
        patches,
        sccan,
        warnings,
        lesion_sizes,
        statistic_map,
        analysis_mask,
    })))
}

/// Inputs reduced to a lesion matrix plus the bookkeeping to map results
/// back to voxels.
struct Prepared {
    lesions: LesionMatrix,
    behavior: Vec<f64>,
    covariates: Option<DMatrix<f64>>,
    index: PatchIndex,
    weights: Vec<usize>,
    patches: Option<PatchSummary>,
    geometry: Option<Geometry>,
    analysis_mask: Option<BinaryVolume>,
    lesion_sizes: Vec<f64>,
}

fn prepare(input: MappingInput, config: &MappingConfig) -> MappingResult<Prepared> {
    match input {
        MappingInput::Masks {
            masks,
            mask,
            behavior,
            covariates,
        } => {
            let domain = derive_mask(&masks, config.min_subjects, mask.as_ref())?;
            let built = PatchMatrixBuilder::new(config.patching).build(&masks, &domain)?;
            let weights = built.index.weights(built.matrix.n_columns());
            log::info!(
                "{} voxels in {} columns",
                built.index.voxels().len(),
                built.matrix.n_columns()
            );
            Ok(Prepared {
                patches: Some(PatchSummary {
                    patched: built.patched,
                    n_voxels: built.index.voxels().len(),
                    n_columns: built.matrix.n_columns(),
                    patches: built.patches,
                }),
                lesions: built.matrix,
                behavior,
                covariates,
                index: built.index,
                weights,
                geometry: Some(domain.geometry().clone()),
                lesion_sizes: lesion_sizes(&masks),
                analysis_mask: Some(domain),
            })
        }
        MappingInput::Matrix {
            lesions,
            behavior,
            covariates,
            weights,
        } => {
            let p = lesions.n_columns();
            let weights = weights.unwrap_or_else(|| vec![1; p]);
            let index = PatchIndex::identity((0..p).collect());
            Ok(Prepared {
                lesion_sizes: lesions.weighted_row_sums(&weights),
                lesions,
                behavior,
                covariates,
                index,
                weights,
                patches: None,
                geometry: None,
                analysis_mask: None,
            })
        }
    }
}

fn permutation_summary(
    mut summary: CorrectionSummary,
    null: &NullDistribution,
    warnings: &mut Vec<MappingWarning>,
) -> CorrectionSummary {
    if null.aborted {
        warnings.push(MappingWarning::PermutationsTruncated {
            requested: null.requested,
            completed: null.completed(),
        });
    }
    summary.null_distribution = Some(null.values.clone());
    summary.permutations_requested = Some(null.requested);
    summary.permutations_completed = Some(null.completed());
    summary.aborted = null.aborted;
    summary
}

fn voxel_map(geometry: &Geometry, index: &PatchIndex, corrected: &CorrectionResult) -> Volume {
    match &corrected.voxel_statistic {
        Some(per_voxel) => {
            let mut volume = Volume::zeros(geometry.clone());
            for (&voxel, &value) in index.voxels().iter().zip(per_voxel) {
                volume.data_mut()[voxel] = value;
            }
            volume
        }
        None => Volume::from_columns(geometry, index, &corrected.statistic),
    }
}
