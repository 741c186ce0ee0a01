//! In-memory volumes shared by every stage of a mapping run.
//!
//! Voxels are addressed in column-major (NIfTI) order:
//! `index = x + y*nx + z*nx*ny`.

use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::patch::PatchIndex;

/// Tolerance for comparing voxel sizes and affine entries.
const GEOMETRY_TOLERANCE: f64 = 1e-4;

/// Spatial layout of a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Dimensions (nx, ny, nz).
    pub dims: [usize; 3],
    /// Voxel sizes in mm.
    #[serde(default = "unit_voxel")]
    pub voxel_size: [f64; 3],
    /// Affine transformation matrix (4x4, row-major).
    #[serde(default = "identity_affine")]
    pub affine: [f64; 16],
}

fn unit_voxel() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn identity_affine() -> [f64; 16] {
    let mut affine = [0.0; 16];
    for i in 0..4 {
        affine[i * 4 + i] = 1.0;
    }
    affine
}

impl Geometry {
    /// Geometry with 1 mm isotropic voxels and an identity affine.
    pub fn new(dims: [usize; 3]) -> Self {
        Self {
            dims,
            voxel_size: unit_voxel(),
            affine: identity_affine(),
        }
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + y * self.dims[0] + z * self.dims[0] * self.dims[1]
    }

    pub fn coords(&self, index: usize) -> [usize; 3] {
        let [nx, ny, _] = self.dims;
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    /// Same grid and the same placement in space.
    pub fn is_compatible(&self, other: &Geometry) -> bool {
        self.dims == other.dims
            && self
                .voxel_size
                .iter()
                .zip(&other.voxel_size)
                .all(|(a, b)| (a - b).abs() <= GEOMETRY_TOLERANCE)
            && self
                .affine
                .iter()
                .zip(&other.affine)
                .all(|(a, b)| (a - b).abs() <= GEOMETRY_TOLERANCE)
    }
}

/// A binary mask: lesion maps and analysis domains.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryVolume {
    geometry: Geometry,
    data: Vec<u8>,
}

impl BinaryVolume {
    /// Wrap raw voxel data; any non-zero value counts as set.
    pub fn new(geometry: Geometry, data: Vec<u8>) -> Result<Self, BuildError> {
        let expected = geometry.n_voxels();
        if data.len() != expected {
            return Err(BuildError::DataLength {
                expected,
                actual: data.len(),
            });
        }
        let data = data.into_iter().map(|v| u8::from(v != 0)).collect();
        Ok(Self { geometry, data })
    }

    /// Build a mask with the listed voxel indices set.
    pub fn from_indices(geometry: Geometry, indices: &[usize]) -> Result<Self, BuildError> {
        let n_voxels = geometry.n_voxels();
        let mut data = vec![0u8; n_voxels];
        for &idx in indices {
            if idx >= n_voxels {
                return Err(BuildError::VoxelOutOfRange {
                    voxel: idx,
                    n_voxels,
                });
            }
            data[idx] = 1;
        }
        Ok(Self { geometry, data })
    }

    /// An all-zero mask.
    pub fn empty(geometry: Geometry) -> Self {
        let data = vec![0u8; geometry.n_voxels()];
        Self { geometry, data }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.data[index] != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        self.data[index] = u8::from(value);
    }

    /// Number of voxels set.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }

    /// Indices of set voxels in increasing order.
    pub fn voxel_indices(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| (v != 0).then_some(i))
            .collect()
    }
}

/// A real-valued volume, typically a reconstructed statistic map.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    geometry: Geometry,
    data: Vec<f64>,
}

impl Volume {
    pub fn zeros(geometry: Geometry) -> Self {
        let data = vec![0.0; geometry.n_voxels()];
        Self { geometry, data }
    }

    /// Expand per-column values back onto the voxels of the analysis domain.
    /// Voxels outside the domain are zero.
    pub fn from_columns(geometry: &Geometry, index: &PatchIndex, values: &[f64]) -> Self {
        let mut volume = Self::zeros(geometry.clone());
        for (&voxel, value) in index.voxels().iter().zip(index.expand(values)) {
            volume.data[voxel] = value;
        }
        volume
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// `(voxel index, value)` for every non-zero voxel.
    pub fn nonzero(&self) -> Vec<(usize, f64)> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, &v)| (i, v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        let g = Geometry::new([4, 3, 2]);
        assert_eq!(g.n_voxels(), 24);
        let idx = g.index(1, 2, 1);
        assert_eq!(idx, 1 + 2 * 4 + 12);
        assert_eq!(g.coords(idx), [1, 2, 1]);
    }

    #[test]
    fn test_compatibility_tolerance() {
        let a = Geometry::new([4, 4, 4]);
        let mut b = a.clone();
        b.voxel_size[0] += 1e-6;
        assert!(a.is_compatible(&b));
        b.affine[3] = 2.0;
        assert!(!a.is_compatible(&b));
        assert!(!a.is_compatible(&Geometry::new([4, 4, 5])));
    }

    #[test]
    fn test_binary_volume_normalizes() {
        let g = Geometry::new([2, 2, 1]);
        let v = BinaryVolume::new(g.clone(), vec![0, 7, 1, 0]).unwrap();
        assert_eq!(v.data(), &[0, 1, 1, 0]);
        assert_eq!(v.count(), 2);
        assert_eq!(v.voxel_indices(), vec![1, 2]);
        assert!(BinaryVolume::new(g, vec![0; 3]).is_err());
    }

    #[test]
    fn test_from_indices_out_of_range() {
        let g = Geometry::new([2, 2, 1]);
        assert_eq!(
            BinaryVolume::from_indices(g, &[5]),
            Err(BuildError::VoxelOutOfRange {
                voxel: 5,
                n_voxels: 4
            })
        );
    }

    #[test]
    fn test_from_columns_broadcasts_patches() {
        let g = Geometry::new([3, 2, 1]);
        // voxels 1 and 4 share column 0; voxel 2 is column 1
        let index = PatchIndex::new(vec![1, 2, 4], vec![0, 1, 0]);
        let volume = Volume::from_columns(&g, &index, &[2.5, -1.0]);
        assert_eq!(volume.data(), &[0.0, 2.5, -1.0, 0.0, 2.5, 0.0]);
        assert_eq!(volume.nonzero(), vec![(1, 2.5), (2, -1.0), (4, 2.5)]);
    }
}
