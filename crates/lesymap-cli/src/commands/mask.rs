//! `lesymap mask`: show which voxels a study would analyze.

use std::path::Path;

use serde::Serialize;

use lesymap_core::{MinSubjects, derive_mask};

use crate::study::Study;

#[derive(Debug, Serialize)]
pub struct MaskReport {
    pub n_subjects: usize,
    pub min_subjects: MinSubjects,
    /// Subject count a voxel needs to be analyzed.
    pub threshold: usize,
    pub n_voxels: usize,
    pub voxels: Vec<usize>,
}

pub fn execute(study_path: &Path, min_subjects: MinSubjects) -> Result<MaskReport, String> {
    let study = Study::load(study_path)?;
    let masks = study.masks()?;
    let user_mask = study.analysis_mask()?;
    let domain =
        derive_mask(&masks, min_subjects, user_mask.as_ref()).map_err(|e| e.to_string())?;

    let voxels = domain.voxel_indices();
    Ok(MaskReport {
        n_subjects: masks.len(),
        min_subjects,
        threshold: min_subjects.resolve(masks.len()).max(1),
        n_voxels: voxels.len(),
        voxels,
    })
}

pub fn run(study_path: &Path, min_subjects: MinSubjects, output: Option<&Path>) {
    match execute(study_path, min_subjects) {
        Ok(report) => {
            eprintln!(
                "{} voxel(s) lesioned in at least {} of {} subjects",
                report.n_voxels, report.threshold, report.n_subjects
            );
            if let Err(e) = super::write_json(&report, output) {
                super::fail(e);
            }
        }
        Err(e) => super::fail(e),
    }
}
