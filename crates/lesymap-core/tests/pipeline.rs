//! Integration tests for lesymap-core.
//!
//! These tests drive the full pipeline:
//! masks → analysis mask → patches → test → correction → voxel map.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lesymap_core::{
    Alternative, BinaryVolume, BuildError, CorrectionMethod, DMatrix, Geometry, LesionMatrix,
    LesionSizeCorrection, MappingConfig, MappingError, MappingInput, MappingOutcome,
    MappingOutput, MappingWarning, Method, MinSubjects, NullMode, PatchMatrixBuilder,
    PermutationEngine, PermutationPlan, SccanOptions, run_mapping, run_mapping_with_abort,
};

const N_SUBJECTS: usize = 40;
const KEY_VOXEL: [usize; 3] = [3, 3, 0];

fn geometry() -> Geometry {
    Geometry::new([8, 8, 2])
}

/// Box lesions spanning both slices, so voxels stacked in z always share a
/// pattern and patching has something to merge.
fn blob_masks(seed: u64) -> Vec<BinaryVolume> {
    let g = geometry();
    let mut rng = StdRng::seed_from_u64(seed);
    (0..N_SUBJECTS)
        .map(|_| {
            let cx = rng.random_range(0..8usize);
            let cy = rng.random_range(0..8usize);
            let mut voxels = Vec::new();
            for z in 0..2 {
                for y in cy.saturating_sub(2)..(cy + 3).min(8) {
                    for x in cx.saturating_sub(2)..(cx + 3).min(8) {
                        voxels.push(g.index(x, y, z));
                    }
                }
            }
            BinaryVolume::from_indices(g.clone(), &voxels).unwrap()
        })
        .collect()
}

/// Behavior lowered by a lesion at [`KEY_VOXEL`], plus noise.
fn continuous_behavior(masks: &[BinaryVolume], seed: u64) -> Vec<f64> {
    let g = geometry();
    let key = g.index(KEY_VOXEL[0], KEY_VOXEL[1], KEY_VOXEL[2]);
    let mut rng = StdRng::seed_from_u64(seed);
    masks
        .iter()
        .map(|m| {
            let deficit = if m.is_set(key) { -2.0 } else { 0.0 };
            10.0 + deficit + rng.random::<f64>() * 2.0
        })
        .collect()
}

/// Two-valued behavior following the key voxel, with 15% of labels flipped.
fn binary_behavior(masks: &[BinaryVolume], seed: u64) -> Vec<f64> {
    let g = geometry();
    let key = g.index(KEY_VOXEL[0], KEY_VOXEL[1], KEY_VOXEL[2]);
    let mut rng = StdRng::seed_from_u64(seed);
    masks
        .iter()
        .map(|m| {
            let impaired = m.is_set(key) != rng.random_bool(0.15);
            if impaired { 1.0 } else { 0.0 }
        })
        .collect()
}

/// Voxels where both groups have at least `min` subjects.
fn balanced_mask(masks: &[BinaryVolume], min: usize) -> BinaryVolume {
    let g = geometry();
    let voxels: Vec<usize> = (0..g.n_voxels())
        .filter(|&v| {
            let lesioned = masks.iter().filter(|m| m.is_set(v)).count();
            lesioned >= min && masks.len() - lesioned >= min
        })
        .collect();
    BinaryVolume::from_indices(g, &voxels).unwrap()
}

fn run_map(input: MappingInput, config: &MappingConfig) -> MappingOutput {
    match run_mapping(input, config).unwrap() {
        MappingOutcome::Map(output) => *output,
        MappingOutcome::Null { .. } => panic!("expected a map"),
    }
}

fn masks_input(
    masks: &[BinaryVolume],
    mask: Option<BinaryVolume>,
    behavior: Vec<f64>,
) -> MappingInput {
    MappingInput::Masks {
        masks: masks.to_vec(),
        mask,
        behavior,
        covariates: None,
    }
}

/// Run with patching on and off and compare the voxel maps.
fn assert_patching_equivalent(
    config: MappingConfig,
    mask: Option<BinaryVolume>,
    behavior: Vec<f64>,
    masks: &[BinaryVolume],
) {
    let patched_cfg = MappingConfig {
        patching: true,
        ..config.clone()
    };
    let unpatched_cfg = MappingConfig {
        patching: false,
        ..config
    };
    let patched = run_map(masks_input(masks, mask.clone(), behavior.clone()), &patched_cfg);
    let unpatched = run_map(masks_input(masks, mask, behavior), &unpatched_cfg);

    let p = patched.patches.as_ref().unwrap();
    let u = unpatched.patches.as_ref().unwrap();
    assert_eq!(p.n_voxels, u.n_voxels);
    assert!(p.n_columns < u.n_columns, "patching merged nothing");
    assert_eq!(u.n_columns, u.n_voxels);

    let pm = patched.statistic_map.as_ref().unwrap();
    let um = unpatched.statistic_map.as_ref().unwrap();
    assert_eq!(pm, um, "{} maps differ between patched and unpatched runs", patched.method);
    assert!(
        pm.data().iter().any(|&v| v != 0.0),
        "{}: nothing survived, comparison is vacuous",
        patched.method
    );
}

// ---------------------------------------------------------------------------
// Concrete scenarios
// ---------------------------------------------------------------------------

#[test]
fn separated_groups_survive_fdr() {
    let column: Vec<f64> = (0..20).map(|i| if i < 10 { 1.0 } else { 0.0 }).collect();
    let lesions = LesionMatrix::from_columns(20, &vec![column; 5]).unwrap();
    let behavior: Vec<f64> = (0..20).map(|i| if i < 10 { 5.0 } else { 1.0 }).collect();
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::BenjaminiHochberg,
        p_threshold: 0.05,
        ..MappingConfig::default()
    };
    let output = run_map(
        MappingInput::Matrix {
            lesions,
            behavior,
            covariates: None,
            weights: None,
        },
        &config,
    );
    assert_eq!(output.correction.surviving_columns, 5);
    assert!(output.statistic.iter().all(|&t| t > 100.0));
    let p = output.p_value.unwrap();
    assert!(p.iter().all(|&p| p < 1e-6));
    assert!(output.warnings.is_empty());
}

#[test]
fn behavior_length_mismatch_is_input_shape_error() {
    let column: Vec<f64> = (0..20).map(|i| f64::from(i % 2 == 0)).collect();
    let lesions = LesionMatrix::from_columns(20, &[column]).unwrap();
    let err = run_mapping(
        MappingInput::Matrix {
            lesions,
            behavior: vec![1.0; 19],
            covariates: None,
            weights: None,
        },
        &MappingConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, MappingError::InputShape(_)), "got {err:?}");
}

#[test]
fn chisq_rejects_three_valued_behavior() {
    let masks = blob_masks(1);
    let behavior: Vec<f64> = (0..N_SUBJECTS).map(|i| (i % 3) as f64).collect();
    let config = MappingConfig {
        method: Method::ChiSquare,
        ..MappingConfig::default()
    };
    match run_mapping(masks_input(&masks, None, behavior), &config) {
        Err(MappingError::InputShape(msg)) => assert!(msg.contains("binary"), "{msg}"),
        other => panic!("expected InputShape error, got {other:?}"),
    }
}

#[test]
fn cluster_correction_with_zero_permutations_is_configuration_error() {
    let masks = blob_masks(2);
    let behavior = continuous_behavior(&masks, 2);
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::ClusterExtent,
        n_permutations: 0,
        ..MappingConfig::default()
    };
    let err = run_mapping(masks_input(&masks, None, behavior), &config).unwrap_err();
    assert!(matches!(err, MappingError::Configuration(_)), "got {err:?}");
}

#[test]
fn mismatched_geometry_is_build_error() {
    let g = geometry();
    let other = Geometry::new([8, 8, 3]);
    let masks = vec![
        BinaryVolume::from_indices(g.clone(), &[0, 1]).unwrap(),
        BinaryVolume::from_indices(other, &[0, 1]).unwrap(),
    ];
    let domain = BinaryVolume::from_indices(g, &[0, 1]).unwrap();
    assert_eq!(
        PatchMatrixBuilder::default().build(&masks, &domain).unwrap_err(),
        BuildError::GeometryMismatch { index: 1 }
    );

    let err = run_mapping(
        masks_input(&masks, None, vec![1.0, 2.0]),
        &MappingConfig::default(),
    )
    .unwrap_err();
    assert_eq!(err, MappingError::Build(BuildError::GeometryMismatch { index: 1 }));
}

// ---------------------------------------------------------------------------
// Patching is a compression, not an approximation
// ---------------------------------------------------------------------------

#[test]
fn patching_equivalent_for_ttest_and_welch() {
    let masks = blob_masks(10);
    let behavior = continuous_behavior(&masks, 10);
    for method in [Method::TTest, Method::Welch] {
        let config = MappingConfig {
            method,
            correction: CorrectionMethod::BenjaminiHochberg,
            min_subjects: MinSubjects::Count(3),
            alternative: Alternative::Less,
            ..MappingConfig::default()
        };
        assert_patching_equivalent(config, None, behavior.clone(), &masks);
    }
}

#[test]
fn patching_equivalent_for_regression() {
    let masks = blob_masks(11);
    let behavior = continuous_behavior(&masks, 11);
    let config = MappingConfig {
        method: Method::Regression,
        correction: CorrectionMethod::Holm,
        min_subjects: MinSubjects::Count(3),
        alternative: Alternative::TwoSided,
        ..MappingConfig::default()
    };
    assert_patching_equivalent(config, None, behavior, &masks);
}

#[test]
fn patching_equivalent_for_chisq() {
    let masks = blob_masks(12);
    let behavior = binary_behavior(&masks, 12);
    let config = MappingConfig {
        method: Method::ChiSquare,
        correction: CorrectionMethod::None,
        min_subjects: MinSubjects::Count(4),
        ..MappingConfig::default()
    };
    assert_patching_equivalent(config, None, behavior, &masks);
}

#[test]
fn patching_equivalent_for_brunner_munzel_with_large_groups() {
    let masks = blob_masks(13);
    let behavior = continuous_behavior(&masks, 13);
    let domain = balanced_mask(&masks, lesymap_core::BM_PERMUTATION_MIN_GROUP);
    assert!(!domain.is_empty());
    let config = MappingConfig {
        method: Method::RankSum,
        correction: CorrectionMethod::BenjaminiHochberg,
        min_subjects: MinSubjects::Count(1),
        alternative: Alternative::Less,
        ..MappingConfig::default()
    };
    assert_patching_equivalent(config, Some(domain), behavior, &masks);
}

#[test]
fn patching_equivalent_for_seeded_fwer() {
    let masks = blob_masks(14);
    let behavior = continuous_behavior(&masks, 14);
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::FamilyWise,
        n_permutations: 200,
        min_subjects: MinSubjects::Count(3),
        alternative: Alternative::Less,
        seed: Some(1234),
        ..MappingConfig::default()
    };
    assert_patching_equivalent(config, None, behavior, &masks);
}

// ---------------------------------------------------------------------------
// Corrections and warnings
// ---------------------------------------------------------------------------

#[test]
fn fwer_reports_null_and_threshold() {
    let masks = blob_masks(20);
    let behavior = continuous_behavior(&masks, 20);
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::FamilyWise,
        n_permutations: 100,
        alternative: Alternative::Less,
        seed: Some(7),
        threads: Some(2),
        ..MappingConfig::default()
    };
    let output = run_map(masks_input(&masks, None, behavior), &config);
    let c = &output.correction;
    assert_eq!(c.permutations_requested, Some(100));
    assert_eq!(c.permutations_completed, Some(100));
    assert!(!c.aborted);
    assert_eq!(c.null_distribution.as_ref().unwrap().len(), 100);
    let threshold = c.threshold.unwrap();
    for &t in &output.statistic {
        assert!(t == 0.0 || -t >= threshold);
    }
}

#[test]
fn cluster_correction_keeps_whole_clusters() {
    let masks = blob_masks(21);
    let behavior = continuous_behavior(&masks, 21);
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::ClusterExtent,
        n_permutations: 50,
        cluster_voxel_p_threshold: 0.01,
        alternative: Alternative::Less,
        seed: Some(3),
        ..MappingConfig::default()
    };
    let output = run_map(masks_input(&masks, None, behavior), &config);
    assert_eq!(output.correction.permutations_completed, Some(50));
    let min_size = output.correction.threshold.unwrap();
    let map = output.statistic_map.unwrap();
    let kept: Vec<bool> = map.data().iter().map(|&v| v != 0.0).collect();
    let sizes = lesymap_core::cluster_sizes(&kept, map.geometry(), config.connectivity);
    // surviving voxels are unions of clusters that each reached the threshold
    assert!(sizes.iter().all(|&s| s as f64 >= min_size));
}

#[test]
fn abort_flag_truncates_permutations() {
    let masks = blob_masks(22);
    let behavior = continuous_behavior(&masks, 22);
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::FamilyWise,
        n_permutations: 500,
        ..MappingConfig::default()
    };
    let abort = Arc::new(AtomicBool::new(true));
    let outcome = run_mapping_with_abort(masks_input(&masks, None, behavior), &config, Some(abort)).unwrap();
    let output = outcome.into_map().unwrap();
    assert!(output.correction.aborted);
    assert_eq!(output.correction.surviving_columns, 0);
    assert!(output.warnings.contains(&MappingWarning::PermutationsTruncated {
        requested: 500,
        completed: 0,
    }));
}

#[test]
fn time_limit_truncates_permutations() {
    let masks = blob_masks(26);
    let behavior = continuous_behavior(&masks, 26);
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::FamilyWise,
        n_permutations: 1_000_000,
        time_limit_secs: Some(1e-9),
        seed: Some(4),
        ..MappingConfig::default()
    };
    let output = run_map(masks_input(&masks, None, behavior), &config);
    assert!(output.correction.aborted);
    let completed = output.correction.permutations_completed.unwrap();
    assert!(completed < 1_000_000);
    assert!(output.warnings.contains(&MappingWarning::PermutationsTruncated {
        requested: 1_000_000,
        completed,
    }));
}

#[test]
fn non_finite_columns_are_zeroed_and_reported() {
    // Two subjects at the edge of the f64 range: a column lesioning both
    // overflows its group mean, a column splitting them stays finite.
    let n = 20;
    let behavior: Vec<f64> = (0..n).map(|i| if i < 2 { 1e308 } else { i as f64 }).collect();
    let overflowing: Vec<f64> = (0..n).map(|i| f64::from(i < 10)).collect();
    let split: Vec<f64> = (0..n).map(|i| f64::from(i == 0 || (2..11).contains(&i))).collect();
    let lesions = LesionMatrix::from_columns(n, &[overflowing, split]).unwrap();
    let config = MappingConfig {
        method: Method::TTest,
        correction: CorrectionMethod::None,
        ..MappingConfig::default()
    };
    let input = MappingInput::Matrix {
        lesions,
        behavior,
        covariates: None,
        weights: None,
    };
    let output = run_map(input, &config);
    assert!(output.warnings.contains(&MappingWarning::NumericAnomaly { columns: vec![0] }));
    assert_eq!(output.correction.anomalous_columns, 1);
    assert_eq!(output.statistic[0], 0.0);
    assert_eq!(output.p_value.as_ref().unwrap()[0], 1.0);
    assert!(output.statistic.iter().all(|v| v.is_finite()));
}

#[test]
fn covariates_require_regression() {
    let masks = blob_masks(23);
    let behavior = continuous_behavior(&masks, 23);
    let covariates = DMatrix::from_fn(N_SUBJECTS, 1, |r, _| (r % 5) as f64);
    let input = |c: DMatrix<f64>| MappingInput::Masks {
        masks: masks.clone(),
        mask: None,
        behavior: behavior.clone(),
        covariates: Some(c),
    };

    let ttest = MappingConfig {
        method: Method::TTest,
        ..MappingConfig::default()
    };
    assert!(matches!(
        run_mapping(input(covariates.clone()), &ttest),
        Err(MappingError::Configuration(_))
    ));

    let regres = MappingConfig {
        method: Method::Regression,
        correction: CorrectionMethod::FamilyWise,
        n_permutations: 50,
        alternative: Alternative::Less,
        seed: Some(5),
        ..MappingConfig::default()
    };
    let output = run_map(input(covariates), &regres);
    assert_eq!(output.correction.permutations_completed, Some(50));
}

#[test]
fn lesion_size_behavior_correction_rejected_for_chisq() {
    let masks = blob_masks(24);
    let behavior = binary_behavior(&masks, 24);
    let config = MappingConfig {
        method: Method::ChiSquare,
        lesion_size_correction: LesionSizeCorrection::Behavior,
        ..MappingConfig::default()
    };
    assert!(matches!(
        run_mapping(masks_input(&masks, None, behavior), &config),
        Err(MappingError::Configuration(_))
    ));
}

#[test]
fn lesion_sizes_reported_per_subject() {
    let masks = blob_masks(25);
    let behavior = continuous_behavior(&masks, 25);
    let config = MappingConfig {
        method: Method::Regression,
        lesion_size_correction: LesionSizeCorrection::Both,
        ..MappingConfig::default()
    };
    let output = run_map(masks_input(&masks, None, behavior), &config);
    let expected: Vec<f64> = masks.iter().map(|m| m.count() as f64).collect();
    assert_eq!(output.lesion_sizes, expected);
}

// ---------------------------------------------------------------------------
// SCCAN
// ---------------------------------------------------------------------------

#[test]
fn sccan_constant_behavior_is_null_outcome() {
    let masks = blob_masks(30);
    let config = MappingConfig {
        method: Method::Sccan,
        seed: Some(1),
        ..MappingConfig::default()
    };
    let outcome = run_mapping(masks_input(&masks, None, vec![3.0; N_SUBJECTS]), &config).unwrap();
    match outcome {
        MappingOutcome::Null { cv_p_value, .. } => assert!(cv_p_value > 0.05),
        MappingOutcome::Map(_) => panic!("expected a null outcome"),
    }
}

#[test]
fn sccan_noise_at_fixed_sparseness_is_null_outcome() {
    let masks = blob_masks(33);
    let config = MappingConfig {
        method: Method::Sccan,
        correction: CorrectionMethod::None,
        min_subjects: MinSubjects::Count(3),
        sccan: SccanOptions {
            sparseness: Some(0.1),
            validate_sparseness: true,
            ..SccanOptions::default()
        },
        ..MappingConfig::default()
    };
    let nulls = (0..10u64)
        .filter(|&seed| {
            let mut rng = StdRng::seed_from_u64(500 + seed);
            let noise: Vec<f64> = (0..N_SUBJECTS).map(|_| rng.random::<f64>()).collect();
            let config = MappingConfig {
                seed: Some(seed),
                ..config.clone()
            };
            run_mapping(masks_input(&masks, None, noise), &config)
                .unwrap()
                .is_null()
        })
        .count();
    assert!(nulls >= 8, "only {nulls}/10 noise behaviors gave a null outcome");
}

#[test]
fn sccan_map_ignores_standard_correction() {
    let masks = blob_masks(31);
    let g = geometry();
    let key = g.index(KEY_VOXEL[0], KEY_VOXEL[1], KEY_VOXEL[2]);
    let behavior: Vec<f64> = masks
        .iter()
        .enumerate()
        .map(|(i, m)| (if m.is_set(key) { 2.0 } else { 8.0 }) + (i % 3) as f64 * 0.1)
        .collect();
    let config = MappingConfig {
        method: Method::Sccan,
        seed: Some(2),
        min_subjects: MinSubjects::Count(3),
        ..MappingConfig::default()
    };
    let output = run_map(masks_input(&masks, None, behavior), &config);
    let summary = output.sccan.as_ref().unwrap();
    assert!(summary.cv_correlation.unwrap() > 0.5);
    assert!(output.p_value.is_none());
    assert!(output.statistic.iter().all(|&w| (0.0..=1.0).contains(&w)));
    assert!(output.warnings.iter().any(|w| matches!(w, MappingWarning::IgnoredCorrection { .. })));
    let map = output.statistic_map.unwrap();
    assert!(map.data()[key] > 0.0);
}

#[test]
fn sccan_rejects_permutation_correction() {
    let masks = blob_masks(32);
    let behavior = continuous_behavior(&masks, 32);
    let config = MappingConfig {
        method: Method::Sccan,
        correction: CorrectionMethod::FamilyWise,
        ..MappingConfig::default()
    };
    assert!(matches!(
        run_mapping(masks_input(&masks, None, behavior), &config),
        Err(MappingError::Configuration(_))
    ));
}

// ---------------------------------------------------------------------------
// Statistical properties (slow)
// ---------------------------------------------------------------------------

fn threshold_spread(n_permutations: usize, runs: u64) -> f64 {
    let masks = blob_masks(40);
    let behavior = continuous_behavior(&masks, 40);
    let domain = balanced_mask(&masks, 3);
    let built = PatchMatrixBuilder::default().build(&masks, &domain).unwrap();
    let weights = built.index.weights(built.matrix.n_columns());
    let config = MappingConfig {
        method: Method::TTest,
        ..MappingConfig::default()
    };
    let test = config.method.build(&config, None);

    let thresholds: Vec<f64> = (0..runs)
        .map(|seed| {
            let mut plan = PermutationPlan::new(n_permutations, weights.clone());
            plan.seed = Some(seed);
            let null = PermutationEngine::new(plan)
                .unwrap()
                .run(&built.matrix, &behavior, test.as_ref(), NullMode::FamilyWise)
                .unwrap();
            null.threshold(0.05).unwrap()
        })
        .collect();
    let mean = thresholds.iter().sum::<f64>() / thresholds.len() as f64;
    thresholds.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (thresholds.len() - 1) as f64
}

#[test]
#[ignore] // Run with: cargo test -- --ignored
fn fwer_threshold_variance_shrinks_with_permutations() {
    let coarse = threshold_spread(100, 8);
    let fine = threshold_spread(2000, 8);
    assert!(
        fine < coarse,
        "threshold variance did not shrink: {coarse:.4} -> {fine:.4}"
    );
}
