//! Analysis-domain derivation from lesion frequency.

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, MappingError, MappingResult};
use crate::volume::BinaryVolume;

/// Minimum number of lesioned subjects for a voxel to be tested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MinSubjects {
    Count(usize),
    /// Percentage of the sample, rounded up.
    Percent(f64),
}

impl Default for MinSubjects {
    fn default() -> Self {
        Self::Percent(10.0)
    }
}

impl MinSubjects {
    /// Absolute subject count for a sample of `n_subjects`.
    pub fn resolve(self, n_subjects: usize) -> usize {
        match self {
            Self::Count(n) => n,
            Self::Percent(p) => (p / 100.0 * n_subjects as f64 - 1e-9).ceil().max(0.0) as usize,
        }
    }
}

impl std::str::FromStr for MinSubjects {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let p: f64 = pct
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage '{s}'"))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(format!("percentage out of range: '{s}'"));
            }
            Ok(Self::Percent(p))
        } else {
            s.parse::<usize>()
                .map(Self::Count)
                .map_err(|_| format!("invalid subject count '{s}' (use e.g. 5 or 10%)"))
        }
    }
}

impl TryFrom<String> for MinSubjects {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MinSubjects> for String {
    fn from(value: MinSubjects) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for MinSubjects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// Voxels lesioned in at least `min_subjects` subjects, restricted to
/// `user_mask` when one is given.
pub fn derive_mask(
    masks: &[BinaryVolume],
    min_subjects: MinSubjects,
    user_mask: Option<&BinaryVolume>,
) -> MappingResult<BinaryVolume> {
    let first = masks.first().ok_or(BuildError::NoMasks)?;
    let geometry = user_mask.map_or_else(|| first.geometry(), |m| m.geometry());
    if let Some(index) = masks
        .iter()
        .position(|m| !m.geometry().is_compatible(geometry))
    {
        return Err(BuildError::GeometryMismatch { index }.into());
    }

    let threshold = min_subjects.resolve(masks.len()).max(1);
    let mut counts = vec![0usize; geometry.n_voxels()];
    for m in masks {
        for (count, &v) in counts.iter_mut().zip(m.data()) {
            *count += usize::from(v != 0);
        }
    }

    let mut domain = BinaryVolume::empty(geometry.clone());
    for (i, &count) in counts.iter().enumerate() {
        let allowed = user_mask.is_none_or(|m| m.is_set(i));
        if allowed && count >= threshold {
            domain.set(i, true);
        }
    }

    if domain.is_empty() {
        return Err(MappingError::shape(format!(
            "no voxel is lesioned in at least {threshold} subjects"
        )));
    }
    log::info!(
        "analysis mask: {} voxels lesioned in >= {threshold} subjects",
        domain.count()
    );
    Ok(domain)
}
