//! Connected components of thresholded voxel maps.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::volume::Geometry;

/// Neighbourhood used when growing clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// 6 neighbours sharing a face.
    Faces,
    /// 18 neighbours sharing a face or an edge.
    Edges,
    /// 26 neighbours sharing a face, an edge, or a corner.
    #[default]
    Vertices,
}

impl Connectivity {
    /// Neighbour offsets for this connectivity.
    fn offsets(self) -> Vec<[isize; 3]> {
        let mut offsets = Vec::with_capacity(26);
        for dz in -1isize..=1 {
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let manhattan = dx.abs() + dy.abs() + dz.abs();
                    let keep = match self {
                        Self::Faces => manhattan == 1,
                        Self::Edges => manhattan == 1 || manhattan == 2,
                        Self::Vertices => manhattan > 0,
                    };
                    if keep {
                        offsets.push([dx, dy, dz]);
                    }
                }
            }
        }
        offsets
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Faces => write!(f, "faces"),
            Self::Edges => write!(f, "edges"),
            Self::Vertices => write!(f, "vertices"),
        }
    }
}

impl std::str::FromStr for Connectivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "faces" | "6" => Ok(Self::Faces),
            "edges" | "18" => Ok(Self::Edges),
            "vertices" | "26" => Ok(Self::Vertices),
            _ => Err(format!(
                "unknown connectivity '{s}' (expected faces, edges, vertices or 6, 18, 26)"
            )),
        }
    }
}

/// Component labelling of a voxel map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Components {
    /// Per-voxel label; `0` is background, components count from `1`.
    pub labels: Vec<u32>,
    /// Voxel count of component `l` at index `l - 1`.
    pub sizes: Vec<usize>,
}

impl Components {
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Size of the component containing `voxel`, `0` for background.
    pub fn size_at(&self, voxel: usize) -> usize {
        match self.labels[voxel] {
            0 => 0,
            l => self.sizes[l as usize - 1],
        }
    }

    pub fn largest(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0)
    }
}

/// Label the connected components of the `true` voxels of `mask`.
///
/// Labels follow the voxel index of each component's first voxel.
pub fn label_components(
    mask: &[bool],
    geometry: &Geometry,
    connectivity: Connectivity,
) -> Components {
    let [nx, ny, nz] = geometry.dims;
    let offsets = connectivity.offsets();
    let mut labels = vec![0u32; mask.len()];
    let mut sizes = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mask.len() {
        if !mask[start] || labels[start] != 0 {
            continue;
        }
        let label = sizes.len() as u32 + 1;
        labels[start] = label;
        queue.push_back(start);
        let mut size = 0usize;

        while let Some(idx) = queue.pop_front() {
            size += 1;
            let [x, y, z] = geometry.coords(idx);
            for [dx, dy, dz] in &offsets {
                let (Some(x), Some(y), Some(z)) = (
                    x.checked_add_signed(*dx),
                    y.checked_add_signed(*dy),
                    z.checked_add_signed(*dz),
                ) else {
                    continue;
                };
                if x >= nx || y >= ny || z >= nz {
                    continue;
                }
                let n = geometry.index(x, y, z);
                if mask[n] && labels[n] == 0 {
                    labels[n] = label;
                    queue.push_back(n);
                }
            }
        }
        sizes.push(size);
    }

    Components { labels, sizes }
}

/// Voxel count of every component, in label order.
pub fn cluster_sizes(mask: &[bool], geometry: &Geometry, connectivity: Connectivity) -> Vec<usize> {
    label_components(mask, geometry, connectivity).sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(geometry: &Geometry, voxels: &[[usize; 3]]) -> Vec<bool> {
        let mut mask = vec![false; geometry.n_voxels()];
        for &[x, y, z] in voxels {
            mask[geometry.index(x, y, z)] = true;
        }
        mask
    }

    #[test]
    fn test_offset_counts() {
        assert_eq!(Connectivity::Faces.offsets().len(), 6);
        assert_eq!(Connectivity::Edges.offsets().len(), 18);
        assert_eq!(Connectivity::Vertices.offsets().len(), 26);
    }

    #[test]
    fn test_connectivity_changes_grouping() {
        let g = Geometry::new([3, 3, 3]);
        // diagonal chain through the cube
        let mask = mask_from(&g, &[[0, 0, 0], [1, 1, 1], [2, 2, 2]]);
        assert_eq!(cluster_sizes(&mask, &g, Connectivity::Faces), vec![1, 1, 1]);
        assert_eq!(cluster_sizes(&mask, &g, Connectivity::Edges), vec![1, 1, 1]);
        assert_eq!(cluster_sizes(&mask, &g, Connectivity::Vertices), vec![3]);

        // edge neighbours in one plane
        let mask = mask_from(&g, &[[0, 0, 0], [1, 1, 0]]);
        assert_eq!(cluster_sizes(&mask, &g, Connectivity::Faces), vec![1, 1]);
        assert_eq!(cluster_sizes(&mask, &g, Connectivity::Edges), vec![2]);
    }

    #[test]
    fn test_labels_and_sizes() {
        let g = Geometry::new([5, 1, 1]);
        let mask = vec![true, true, false, false, true];
        let comps = label_components(&mask, &g, Connectivity::Faces);
        assert_eq!(comps.labels, vec![1, 1, 0, 0, 2]);
        assert_eq!(comps.sizes, vec![2, 1]);
        assert_eq!(comps.size_at(1), 2);
        assert_eq!(comps.size_at(2), 0);
        assert_eq!(comps.largest(), 2);
    }

    #[test]
    fn test_no_wraparound_between_rows() {
        let g = Geometry::new([2, 2, 1]);
        // (1,0) and (0,1) touch only diagonally
        let mask = mask_from(&g, &[[1, 0, 0], [0, 1, 0]]);
        assert_eq!(cluster_sizes(&mask, &g, Connectivity::Faces), vec![1, 1]);
    }

    #[test]
    fn test_empty_mask() {
        let g = Geometry::new([2, 2, 2]);
        let comps = label_components(&vec![false; 8], &g, Connectivity::default());
        assert!(comps.is_empty());
        assert_eq!(comps.largest(), 0);
    }

    #[test]
    fn test_parse() {
        assert_eq!("26".parse::<Connectivity>(), Ok(Connectivity::Vertices));
        assert_eq!("faces".parse::<Connectivity>(), Ok(Connectivity::Faces));
        assert!("4".parse::<Connectivity>().is_err());
    }
}
