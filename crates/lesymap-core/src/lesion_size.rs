//! Control for total lesion volume.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use lesymap_stats::residualize;

use crate::matrix::LesionMatrix;

/// Where lesion size is removed from the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LesionSizeCorrection {
    #[default]
    None,
    /// Divide each subject's lesion row by the square root of its lesion
    /// size.
    Voxel,
    /// Replace behavior with its residuals on lesion size.
    Behavior,
    Both,
}

impl LesionSizeCorrection {
    pub fn corrects_voxels(self) -> bool {
        matches!(self, Self::Voxel | Self::Both)
    }

    pub fn corrects_behavior(self) -> bool {
        matches!(self, Self::Behavior | Self::Both)
    }

    /// Scale the rows of `lesions` and residualize `behavior` as selected.
    pub fn apply(self, lesions: &mut LesionMatrix, behavior: &mut Vec<f64>, sizes: &[f64]) {
        if self.corrects_voxels() {
            scale_by_lesion_size(lesions, sizes);
        }
        if self.corrects_behavior() {
            *behavior = residualize_on_lesion_size(behavior, sizes);
        }
        if self != Self::None {
            log::debug!("lesion size correction '{self}' applied to {} subjects", sizes.len());
        }
    }
}

impl std::fmt::Display for LesionSizeCorrection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Voxel => write!(f, "voxel"),
            Self::Behavior => write!(f, "behavior"),
            Self::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for LesionSizeCorrection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "voxel" => Ok(Self::Voxel),
            "behavior" => Ok(Self::Behavior),
            "both" => Ok(Self::Both),
            _ => Err(format!(
                "unknown lesion size correction '{s}' (expected none, voxel, behavior, both)"
            )),
        }
    }
}

/// Divide row `i` by `sqrt(sizes[i])`. Subjects without lesions are left
/// untouched (their row is all zeros).
pub fn scale_by_lesion_size(lesions: &mut LesionMatrix, sizes: &[f64]) {
    let factors: Vec<f64> = sizes
        .iter()
        .map(|&s| if s > 0.0 { 1.0 / s.sqrt() } else { 1.0 })
        .collect();
    lesions.scale_rows(&factors);
}

/// Residuals of `behavior ~ 1 + lesion size`.
pub fn residualize_on_lesion_size(behavior: &[f64], sizes: &[f64]) -> Vec<f64> {
    let design = DMatrix::from_column_slice(sizes.len(), 1, sizes);
    residualize(behavior, &design).residuals
}

#[cfg(test)]
mod tests {
    use super::*;
    use lesymap_stats::pearson;

    #[test]
    fn test_voxel_scaling() {
        let cols = vec![vec![1.0, 1.0, 0.0], vec![0.0, 1.0, 0.0]];
        let mut m = LesionMatrix::from_columns(3, &cols).unwrap();
        scale_by_lesion_size(&mut m, &[4.0, 16.0, 0.0]);
        assert_eq!(m.column(0), &[0.5, 0.25, 0.0]);
        assert_eq!(m.column(1), &[0.0, 0.25, 0.0]);
    }

    #[test]
    fn test_behavior_residuals_uncorrelated_with_size() {
        let sizes = [10.0, 40.0, 25.0, 5.0, 60.0, 33.0];
        let behavior = [3.0, 9.0, 6.5, 1.0, 12.0, 7.0];
        let residuals = residualize_on_lesion_size(&behavior, &sizes);
        assert!(pearson(&residuals, &sizes).abs() < 1e-9);
        assert!(residuals.iter().sum::<f64>().abs() < 1e-9);
    }

    #[test]
    fn test_apply_both() {
        let mut m = LesionMatrix::from_columns(2, &[vec![1.0, 1.0]]).unwrap();
        let mut behavior = vec![1.0, 2.0];
        LesionSizeCorrection::Both.apply(&mut m, &mut behavior, &[1.0, 4.0]);
        assert_eq!(m.column(0), &[1.0, 0.5]);
        assert!(behavior.iter().all(|b| b.abs() < 1e-9));
    }

    #[test]
    fn test_parse_and_flags() {
        let c: LesionSizeCorrection = "both".parse().unwrap();
        assert!(c.corrects_voxels() && c.corrects_behavior());
        assert!(!LesionSizeCorrection::Voxel.corrects_behavior());
        assert!("size".parse::<LesionSizeCorrection>().is_err());
    }
}
