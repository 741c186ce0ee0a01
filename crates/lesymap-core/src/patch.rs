//! Patch compression of the lesion matrix.
//!
//! Voxels that are lesioned in exactly the same subjects carry identical
//! information for every test. They are grouped into one *patch* and tested
//! once. Patch ids follow first appearance in voxel order, so the same input
//! always yields the same matrix.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::BuildError;
use crate::matrix::LesionMatrix;
use crate::volume::BinaryVolume;

/// Inclusive bounding box in voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl Extent {
    fn at(coords: [usize; 3]) -> Self {
        Self {
            min: coords,
            max: coords,
        }
    }

    fn include(&mut self, coords: [usize; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(coords[axis]);
            self.max[axis] = self.max[axis].max(coords[axis]);
        }
    }
}

/// Voxels sharing one lesion pattern across subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Patch {
    /// Column of the lesion matrix holding this patch.
    pub id: usize,
    /// First member voxel in traversal order.
    pub representative: usize,
    pub voxel_count: usize,
    pub extent: Extent,
}

/// Maps every analysis voxel to its lesion-matrix column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchIndex {
    voxels: Vec<usize>,
    columns: Vec<usize>,
}

impl PatchIndex {
    pub fn new(voxels: Vec<usize>, columns: Vec<usize>) -> Self {
        debug_assert_eq!(voxels.len(), columns.len());
        Self { voxels, columns }
    }

    /// One column per voxel.
    pub fn identity(voxels: Vec<usize>) -> Self {
        let columns = (0..voxels.len()).collect();
        Self { voxels, columns }
    }

    /// Analysis voxels in increasing order.
    pub fn voxels(&self) -> &[usize] {
        &self.voxels
    }

    /// Column of each voxel, aligned with [`voxels`](Self::voxels).
    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Number of voxels mapped to each of `n_columns` columns.
    pub fn weights(&self, n_columns: usize) -> Vec<usize> {
        let mut weights = vec![0usize; n_columns];
        for &c in &self.columns {
            weights[c] += 1;
        }
        weights
    }

    /// Broadcast per-column values to per-voxel values.
    pub fn expand(&self, values: &[f64]) -> Vec<f64> {
        self.columns.iter().map(|&c| values[c]).collect()
    }
}

/// Output of [`PatchMatrixBuilder::build`].
#[derive(Debug, Clone)]
pub struct PatchedLesions {
    pub matrix: LesionMatrix,
    pub index: PatchIndex,
    pub patches: Vec<Patch>,
    pub patched: bool,
}

/// Builds the (optionally deduplicated) lesion matrix from subject masks.
#[derive(Debug, Clone, Copy)]
pub struct PatchMatrixBuilder {
    patching: bool,
}

impl Default for PatchMatrixBuilder {
    fn default() -> Self {
        Self { patching: true }
    }
}

impl PatchMatrixBuilder {
    pub fn new(patching: bool) -> Self {
        Self { patching }
    }

    /// Build the lesion matrix over the voxels of `mask`.
    pub fn build(
        &self,
        masks: &[BinaryVolume],
        mask: &BinaryVolume,
    ) -> Result<PatchedLesions, BuildError> {
        if masks.is_empty() {
            return Err(BuildError::NoMasks);
        }
        if let Some(index) = masks
            .iter()
            .position(|m| !m.geometry().is_compatible(mask.geometry()))
        {
            return Err(BuildError::GeometryMismatch { index });
        }
        let voxels = mask.voxel_indices();
        if voxels.is_empty() {
            return Err(BuildError::EmptyMask);
        }

        let n = masks.len();
        let words = n.div_ceil(64);
        let geometry = mask.geometry();

        let mut patches: Vec<Patch> = Vec::new();
        let mut patterns: Vec<Vec<u64>> = Vec::new();
        let mut seen: HashMap<Vec<u64>, usize> = HashMap::new();
        let mut columns = Vec::with_capacity(voxels.len());

        for &voxel in &voxels {
            let mut pattern = vec![0u64; words];
            for (i, m) in masks.iter().enumerate() {
                if m.is_set(voxel) {
                    pattern[i / 64] |= 1u64 << (i % 64);
                }
            }
            let coords = geometry.coords(voxel);
            let existing = if self.patching {
                seen.get(&pattern).copied()
            } else {
                None
            };
            let column = match existing {
                Some(id) => {
                    let patch = &mut patches[id];
                    patch.voxel_count += 1;
                    patch.extent.include(coords);
                    id
                }
                None => {
                    let id = patches.len();
                    patches.push(Patch {
                        id,
                        representative: voxel,
                        voxel_count: 1,
                        extent: Extent::at(coords),
                    });
                    if self.patching {
                        seen.insert(pattern.clone(), id);
                    }
                    patterns.push(pattern);
                    id
                }
            };
            columns.push(column);
        }

        let p = patterns.len();
        let mut data = Vec::with_capacity(n * p);
        for pattern in &patterns {
            data.extend((0..n).map(|i| ((pattern[i / 64] >> (i % 64)) & 1) as f64));
        }

        log::debug!(
            "built lesion matrix: {n} subjects, {} voxels, {p} columns (patching {})",
            voxels.len(),
            if self.patching { "on" } else { "off" }
        );

        Ok(PatchedLesions {
            matrix: LesionMatrix::from_raw(n, p, data),
            index: PatchIndex::new(voxels, columns),
            patches,
            patched: self.patching,
        })
    }
}

/// Lesioned voxel count of each subject over the whole volume.
pub fn lesion_sizes(masks: &[BinaryVolume]) -> Vec<f64> {
    masks.iter().map(|m| m.count() as f64).collect()
}
