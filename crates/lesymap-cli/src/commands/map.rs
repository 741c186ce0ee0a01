//! `lesymap map`: run a lesion-to-symptom mapping on a JSON study.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use lesymap_core::{
    Alternative, Connectivity, CorrectionMethod, LesionSizeCorrection, MappingConfig,
    MappingOutcome, MappingOutput, Method, MinSubjects, run_mapping_with_abort,
};

use crate::study::Study;

/// Command-line settings of one `map` invocation. Flags that are set
/// override the config file.
#[derive(Debug, Clone, Default)]
pub struct MapArgs {
    pub study: PathBuf,
    pub config: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub method: Option<Method>,
    pub correction: Option<CorrectionMethod>,
    pub p_threshold: Option<f64>,
    pub permutations: Option<usize>,
    pub alternative: Option<Alternative>,
    pub min_subjects: Option<MinSubjects>,
    pub lesion_size: Option<LesionSizeCorrection>,
    pub connectivity: Option<Connectivity>,
    pub seed: Option<u64>,
    pub threads: Option<usize>,
    pub deadline: Option<String>,
    pub no_patching: bool,
}

/// One nonzero voxel of the output map.
#[derive(Debug, Clone, Serialize)]
pub struct MapVoxel {
    pub index: usize,
    pub coords: [usize; 3],
    pub value: f64,
}

#[derive(Debug, Serialize)]
pub struct NullReport {
    pub cv_correlation: f64,
    pub cv_p_value: f64,
    pub sparseness: f64,
}

/// The JSON document written by `lesymap map`.
#[derive(Debug, Serialize)]
pub struct MapReport {
    pub run_id: String,
    pub version: &'static str,
    pub study: String,
    pub config: MappingConfig,
    pub covariates: Vec<String>,
    /// `"map"` or `"null"`.
    pub outcome: &'static str,
    pub result: Option<MappingOutput>,
    pub null: Option<NullReport>,
    /// Nonzero voxels of the corrected statistic map.
    pub voxels: Vec<MapVoxel>,
}

/// Merge the config file (if any) with the command-line overrides.
pub fn resolve_config(args: &MapArgs) -> Result<MappingConfig, String> {
    let mut config = match &args.config {
        Some(path) => MappingConfig::load(path).map_err(|e| e.to_string())?,
        None => MappingConfig::default(),
    };

    if let Some(method) = args.method {
        config.method = method;
    }
    if let Some(correction) = args.correction {
        config.correction = correction;
    }
    if let Some(p) = args.p_threshold {
        config.p_threshold = p;
    }
    if let Some(n) = args.permutations {
        config.n_permutations = n;
    }
    if let Some(alternative) = args.alternative {
        config.alternative = alternative;
    }
    if let Some(min) = args.min_subjects {
        config.min_subjects = min;
    }
    if let Some(lsc) = args.lesion_size {
        config.lesion_size_correction = lsc;
    }
    if let Some(connectivity) = args.connectivity {
        config.connectivity = connectivity;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if let Some(deadline) = &args.deadline {
        config.time_limit_secs = Some(super::parse_duration(deadline)?.as_secs_f64());
    }
    if args.no_patching {
        config.patching = false;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Load, map, and assemble the report.
pub fn execute(args: &MapArgs, abort: Option<Arc<AtomicBool>>) -> Result<MapReport, String> {
    let config = resolve_config(args)?;
    let study = Study::load(&args.study)?;
    let covariates: Vec<String> = study
        .covariate_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    log::info!(
        "loaded {} subjects on a {:?} grid from {}",
        study.subjects.len(),
        study.geometry.dims,
        args.study.display()
    );

    let input = study.into_input()?;
    let outcome = run_mapping_with_abort(input, &config, abort).map_err(|e| e.to_string())?;

    let mut report = MapReport {
        run_id: uuid::Uuid::new_v4().to_string(),
        version: lesymap_core::VERSION,
        study: args.study.display().to_string(),
        config,
        covariates,
        outcome: "map",
        result: None,
        null: None,
        voxels: Vec::new(),
    };

    match outcome {
        MappingOutcome::Null {
            cv_correlation,
            cv_p_value,
            sparseness,
        } => {
            report.outcome = "null";
            report.null = Some(NullReport {
                cv_correlation,
                cv_p_value,
                sparseness,
            });
        }
        MappingOutcome::Map(output) => {
            if let Some(map) = &output.statistic_map {
                let geometry = map.geometry();
                report.voxels = map
                    .nonzero()
                    .into_iter()
                    .map(|(index, value)| MapVoxel {
                        index,
                        coords: geometry.coords(index),
                        value,
                    })
                    .collect();
            }
            report.result = Some(*output);
        }
    }
    Ok(report)
}

fn print_summary(report: &MapReport) {
    eprintln!("Run {}", report.run_id);
    eprintln!("  Method:      {}", report.config.method);
    if let Some(null) = &report.null {
        eprintln!(
            "  No association: CV r = {:.3}, p = {:.4} (sparseness {:.3})",
            null.cv_correlation, null.cv_p_value, null.sparseness
        );
        return;
    }
    if let Some(result) = &report.result {
        let c = &result.correction;
        eprintln!("  Subjects:    {}", result.n_subjects);
        eprintln!("  Correction:  {}", c.method);
        if let Some(threshold) = c.threshold {
            eprintln!("  Threshold:   {threshold:.4}");
        }
        if let (Some(requested), Some(completed)) =
            (c.permutations_requested, c.permutations_completed)
        {
            let note = if c.aborted { " (stopped early)" } else { "" };
            eprintln!("  Permutations: {completed}/{requested}{note}");
        }
        eprintln!(
            "  Surviving:   {} column(s), {} voxel(s)",
            c.surviving_columns,
            report.voxels.len()
        );
        for warning in &result.warnings {
            eprintln!("  Warning:     {warning}");
        }
    }
}

pub fn run(args: &MapArgs) {
    let abort = Arc::new(AtomicBool::new(false));
    let flag = abort.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        log::warn!("cannot install Ctrl+C handler: {e}");
    }

    let report = match execute(args, Some(abort)) {
        Ok(report) => report,
        Err(e) => super::fail(e),
    };

    if let Err(e) = super::write_json(&report, args.output.as_deref()) {
        super::fail(e);
    }
    if let Some(path) = &args.output {
        print_summary(&report);
        eprintln!("Report written to {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const N: usize = 24;

    /// 24 subjects on a 4×4×1 grid. Voxel 0 is lesioned in the first 12
    /// subjects, who also score higher.
    fn study_json(behavior: impl Fn(usize) -> f64) -> String {
        let subjects: Vec<String> = (0..N)
            .map(|i| {
                let mut lesion = vec![];
                if i < N / 2 {
                    lesion.push(0);
                }
                if i % 3 == 0 {
                    lesion.push(5);
                }
                if i % 4 == 1 {
                    lesion.push(10);
                }
                format!(
                    r#"{{"id":"s{i}","lesion":{lesion:?},"behavior":{}}}"#,
                    behavior(i)
                )
            })
            .collect();
        format!(
            r#"{{"geometry":{{"dims":[4,4,1]}},"subjects":[{}]}}"#,
            subjects.join(",")
        )
    }

    fn write_temp(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    fn separated(i: usize) -> f64 {
        (if i < N / 2 { 20.0 } else { 5.0 }) + (i % 5) as f64
    }

    #[test]
    fn test_flags_override_config_file() {
        let config = write_temp(r#"{"method": "regres", "correction": "bonferroni", "seed": 3}"#);
        let args = MapArgs {
            config: Some(config.path().to_path_buf()),
            correction: Some(CorrectionMethod::None),
            deadline: Some("2m".into()),
            no_patching: true,
            ..MapArgs::default()
        };
        let c = resolve_config(&args).unwrap();
        assert_eq!(c.method, Method::Regression);
        assert_eq!(c.correction, CorrectionMethod::None);
        assert_eq!(c.seed, Some(3));
        assert_eq!(c.time_limit_secs, Some(120.0));
        assert!(!c.patching);
    }

    #[test]
    fn test_invalid_combination_is_rejected() {
        let args = MapArgs {
            method: Some(Method::Sccan),
            correction: Some(CorrectionMethod::FamilyWise),
            ..MapArgs::default()
        };
        let err = resolve_config(&args).unwrap_err();
        assert!(err.contains("configuration error"), "{err}");
    }

    #[test]
    fn test_ttest_report() {
        let study = write_temp(&study_json(separated));
        let args = MapArgs {
            study: study.path().to_path_buf(),
            method: Some(Method::TTest),
            correction: Some(CorrectionMethod::None),
            ..MapArgs::default()
        };
        let report = execute(&args, None).unwrap();
        assert_eq!(report.outcome, "map");
        assert!(uuid::Uuid::parse_str(&report.run_id).is_ok());
        let result = report.result.as_ref().unwrap();
        assert_eq!(result.n_subjects, N);
        assert!(report.voxels.iter().any(|v| v.index == 0 && v.value > 0.0));
        assert_eq!(report.voxels[0].coords, [0, 0, 0]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["config"]["method"], "ttest");
        assert!(json["result"]["statistic"].is_array());
    }

    #[test]
    fn test_sccan_constant_behavior_reports_null() {
        let study = write_temp(&study_json(|_| 3.0));
        let args = MapArgs {
            study: study.path().to_path_buf(),
            method: Some(Method::Sccan),
            seed: Some(1),
            ..MapArgs::default()
        };
        let report = execute(&args, None).unwrap();
        assert_eq!(report.outcome, "null");
        assert!(report.result.is_none());
        assert!(report.voxels.is_empty());
    }

    #[test]
    fn test_missing_study() {
        let args = MapArgs {
            study: PathBuf::from("/nonexistent/study.json"),
            ..MapArgs::default()
        };
        assert!(execute(&args, None).is_err());
    }
}
