//! Permutation null distributions for family-wise and cluster-extent
//! thresholds.
//!
//! Each permutation shuffles behavior (or, with covariates, the covariate
//! residuals, Freedman–Lane), re-runs the statistical test in resampling
//! mode, and reduces the resulting map to one scalar. Permutation `i` draws
//! from its own RNG seeded from `(seed, i)`, so the null does not depend on
//! how the work is split across threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use lesymap_stats::{Alternative, residualize};

use crate::cluster::{Connectivity, label_components};
use crate::error::{MappingError, MappingResult};
use crate::matrix::LesionMatrix;
use crate::method::{StatisticalTest, TestContext, TestResult};
use crate::patch::PatchIndex;
use crate::volume::Geometry;

/// What each permutation contributes to the null.
#[derive(Debug, Clone, Copy)]
pub enum NullMode<'a> {
    /// The `peak_rank`-th largest oriented statistic.
    FamilyWise,
    /// The largest connected cluster of voxels with `p < voxel_p_threshold`.
    ClusterExtent {
        voxel_p_threshold: f64,
        connectivity: Connectivity,
        geometry: &'a Geometry,
        index: &'a PatchIndex,
    },
}

/// Settings for one permutation run.
#[derive(Debug, Clone)]
pub struct PermutationPlan {
    pub n_permutations: usize,
    /// Rank of the peak statistic recorded per permutation (1 = maximum).
    pub peak_rank: usize,
    pub seed: Option<u64>,
    /// Worker threads; `None` uses the available parallelism.
    pub threads: Option<usize>,
    pub deadline: Option<Instant>,
    pub abort: Option<Arc<AtomicBool>>,
    /// Nuisance regressors (N×k) for Freedman–Lane permutation.
    pub covariates: Option<DMatrix<f64>>,
    /// Voxel count of each column.
    pub weights: Vec<usize>,
}

impl PermutationPlan {
    pub fn new(n_permutations: usize, weights: Vec<usize>) -> Self {
        Self {
            n_permutations,
            peak_rank: 1,
            seed: None,
            threads: None,
            deadline: None,
            abort: None,
            covariates: None,
            weights,
        }
    }

    fn should_stop(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn worker_count(&self) -> usize {
        let available = std::thread::available_parallelism().map_or(1, |n| n.get());
        self.threads
            .unwrap_or(available)
            .clamp(1, self.n_permutations.max(1))
    }
}

/// Sample of permutation statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct NullDistribution {
    pub values: Vec<f64>,
    pub requested: usize,
    /// Stopped early by the abort flag or deadline.
    pub aborted: bool,
}

impl NullDistribution {
    pub fn completed(&self) -> usize {
        self.values.len()
    }

    /// Value exceeded by a fraction `p` of the null; `None` for an empty
    /// sample.
    pub fn threshold(&self, p: f64) -> Option<f64> {
        quantile(&self.values, 1.0 - p)
    }
}

/// Empirical quantile with linear interpolation between order statistics
/// (Hyndman–Fan type 7, `h = (n - 1) * prob`).
pub fn quantile(values: &[f64], prob: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let h = (sorted.len() - 1) as f64 * prob.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

/// The `rank`-th largest oriented statistic, where column `j` occupies
/// `weights[j]` ranks. Non-finite statistics count as zero.
pub fn weighted_peak(
    statistic: &[f64],
    weights: &[usize],
    orientation: Alternative,
    rank: usize,
) -> f64 {
    let mut oriented: Vec<(f64, usize)> = statistic
        .iter()
        .zip(weights)
        .filter(|(_, w)| **w > 0)
        .map(|(&s, &w)| {
            let o = orientation.orient(s);
            (if o.is_finite() { o } else { 0.0 }, w)
        })
        .collect();
    oriented.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut seen = 0usize;
    for &(value, weight) in &oriented {
        seen += weight;
        if seen >= rank {
            return value;
        }
    }
    oriented.last().map_or(0.0, |&(v, _)| v)
}

/// Voxels of the domain whose expanded p-value falls below `threshold`.
pub fn suprathreshold_voxels(
    p_values: &[f64],
    threshold: f64,
    geometry: &Geometry,
    index: &PatchIndex,
) -> Vec<bool> {
    let mut mask = vec![false; geometry.n_voxels()];
    for (&voxel, &column) in index.voxels().iter().zip(index.columns()) {
        let p = p_values[column];
        mask[voxel] = p.is_finite() && p < threshold;
    }
    mask
}

/// splitmix64 finaliser; decorrelates neighbouring permutation seeds.
fn mix_seed(seed: u64, stream: u64) -> u64 {
    let mut z = seed ^ stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Runs a statistical test repeatedly under permuted behavior.
pub struct PermutationEngine {
    plan: PermutationPlan,
}

impl PermutationEngine {
    pub fn new(plan: PermutationPlan) -> MappingResult<Self> {
        if plan.n_permutations == 0 {
            return Err(MappingError::config(
                "permutation-based correction needs at least one permutation",
            ));
        }
        if plan.peak_rank == 0 {
            return Err(MappingError::config("peak rank must be at least 1"));
        }
        Ok(Self { plan })
    }

    /// Build the null distribution for `mode`.
    pub fn run(
        &self,
        lesions: &LesionMatrix,
        behavior: &[f64],
        test: &dyn StatisticalTest,
        mode: NullMode<'_>,
    ) -> MappingResult<NullDistribution> {
        let plan = &self.plan;
        if behavior.len() != lesions.n_subjects() {
            return Err(MappingError::shape(format!(
                "behavior has {} values but the lesion matrix has {} subjects",
                behavior.len(),
                lesions.n_subjects()
            )));
        }
        if plan.weights.len() != lesions.n_columns() {
            return Err(MappingError::shape(format!(
                "{} column weights for {} columns",
                plan.weights.len(),
                lesions.n_columns()
            )));
        }
        if matches!(mode, NullMode::ClusterExtent { .. }) && !test.info().p_values {
            return Err(MappingError::config(format!(
                "cluster correction needs p-values, which '{}' does not produce",
                test.name()
            )));
        }

        // Freedman–Lane: permute residuals around the nuisance fit.
        let (base, shuffled) = match &plan.covariates {
            Some(c) => {
                let r = residualize(behavior, c);
                (Some(r.fitted), r.residuals)
            }
            None => (None, behavior.to_vec()),
        };

        let seed = plan.seed.unwrap_or_else(|| rand::rng().random());
        let n = plan.n_permutations;
        let workers = plan.worker_count();
        let chunk = n.div_ceil(workers);
        let orientation = test.orientation();
        let started = Instant::now();

        let slices: Vec<(Vec<f64>, bool)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let range = (w * chunk).min(n)..((w + 1) * chunk).min(n);
                    let base = base.as_deref();
                    let shuffled = shuffled.as_slice();
                    s.spawn(move || {
                        let mut values = Vec::with_capacity(range.len());
                        let mut stopped = false;
                        let mut y = vec![0.0; shuffled.len()];
                        for i in range {
                            if plan.should_stop() {
                                stopped = true;
                                break;
                            }
                            let stream = mix_seed(seed, i as u64);
                            let mut rng = StdRng::seed_from_u64(stream);
                            y.copy_from_slice(shuffled);
                            y.shuffle(&mut rng);
                            if let Some(fitted) = base {
                                for (v, f) in y.iter_mut().zip(fitted) {
                                    *v += f;
                                }
                            }
                            let mut ctx = TestContext::resampling(mix_seed(stream, u64::MAX));
                            let result = test.run(lesions, &y, &mut ctx);
                            values.push(Self::reduce(&result, mode, plan, orientation));
                        }
                        (values, stopped)
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(worker, h)| {
                    h.join().map_err(|payload| {
                        let message = panic_message(payload.as_ref());
                        log::error!("permutation worker {worker} panicked: {message}");
                        MappingError::WorkerPanicked { worker, message }
                    })
                })
                .collect::<MappingResult<Vec<_>>>()
        })?;

        let aborted = slices.iter().any(|(_, stopped)| *stopped);
        let values: Vec<f64> = slices.into_iter().flat_map(|(v, _)| v).collect();
        if aborted {
            log::warn!(
                "permutations stopped early: {} of {n} completed",
                values.len()
            );
        }
        log::info!(
            "{} permutations on {workers} thread(s) in {:.2}s",
            values.len(),
            started.elapsed().as_secs_f64()
        );

        Ok(NullDistribution {
            values,
            requested: n,
            aborted,
        })
    }

    fn reduce(
        result: &TestResult,
        mode: NullMode<'_>,
        plan: &PermutationPlan,
        orientation: Alternative,
    ) -> f64 {
        match mode {
            NullMode::FamilyWise => {
                weighted_peak(&result.statistic, &plan.weights, orientation, plan.peak_rank)
            }
            NullMode::ClusterExtent {
                voxel_p_threshold,
                connectivity,
                geometry,
                index,
            } => {
                let Some(p_values) = result.p_value.as_deref() else {
                    return 0.0;
                };
                let mask = suprathreshold_voxels(p_values, voxel_p_threshold, geometry, index);
                label_components(&mask, geometry, connectivity).largest() as f64
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
