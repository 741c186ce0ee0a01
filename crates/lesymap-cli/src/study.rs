//! JSON study files: the on-disk input of `lesymap map` and `lesymap mask`.
//!
//! ```json
//! {
//!   "geometry": { "dims": [91, 109, 91] },
//!   "subjects": [
//!     { "id": "s01", "lesion": [1204, 1205, 1295], "behavior": 12.5 },
//!     { "id": "s02", "lesion": [880], "behavior": 3.0 }
//!   ],
//!   "covariates": { "age": [61, 48] },
//!   "mask": [880, 1204, 1205, 1295]
//! }
//! ```
//!
//! Lesions and the optional analysis mask are sparse lists of voxel indices
//! in column-major order.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use lesymap_core::{BinaryVolume, DMatrix, Geometry, MappingInput};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub id: Option<String>,
    pub lesion: Vec<usize>,
    pub behavior: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub geometry: Geometry,
    pub subjects: Vec<Subject>,
    /// Nuisance regressors by name, one value per subject.
    #[serde(default)]
    pub covariates: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub mask: Option<Vec<usize>>,
}

impl Study {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read study {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("invalid study {}: {e}", path.display()))
    }

    pub fn masks(&self) -> Result<Vec<BinaryVolume>, String> {
        self.subjects
            .iter()
            .enumerate()
            .map(|(i, s)| {
                BinaryVolume::from_indices(self.geometry.clone(), &s.lesion).map_err(|e| {
                    let name = s.id.clone().unwrap_or_else(|| format!("#{i}"));
                    format!("subject {name}: {e}")
                })
            })
            .collect()
    }

    pub fn analysis_mask(&self) -> Result<Option<BinaryVolume>, String> {
        self.mask
            .as_ref()
            .map(|voxels| {
                BinaryVolume::from_indices(self.geometry.clone(), voxels)
                    .map_err(|e| format!("mask: {e}"))
            })
            .transpose()
    }

    pub fn behavior(&self) -> Vec<f64> {
        self.subjects.iter().map(|s| s.behavior).collect()
    }

    /// Covariates as an N×k matrix, columns in name order.
    pub fn covariate_matrix(&self) -> Result<Option<DMatrix<f64>>, String> {
        if self.covariates.is_empty() {
            return Ok(None);
        }
        let n = self.subjects.len();
        for (name, values) in &self.covariates {
            if values.len() != n {
                return Err(format!(
                    "covariate '{name}' has {} values for {n} subjects",
                    values.len()
                ));
            }
        }
        let columns: Vec<&Vec<f64>> = self.covariates.values().collect();
        Ok(Some(DMatrix::from_fn(n, columns.len(), |r, c| columns[c][r])))
    }

    pub fn covariate_names(&self) -> Vec<&str> {
        self.covariates.keys().map(String::as_str).collect()
    }

    pub fn into_input(self) -> Result<MappingInput, String> {
        Ok(MappingInput::Masks {
            masks: self.masks()?,
            mask: self.analysis_mask()?,
            behavior: self.behavior(),
            covariates: self.covariate_matrix()?,
        })
    }
}
