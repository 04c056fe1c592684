//! Distribution math: how global indices along one dimension map onto
//! process-local storage.
//!
//! Both ends of a connection evaluate these functions independently and must
//! agree, so everything here is pure.

use crate::error::{ConduitError, Result};
use crate::map::{Dist, DistKind, Map};

/// Derived layout of one distributed dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Local block length `d`.
    pub block_len: usize,
    /// Elements in the trailing partial cycle, `n mod s`.
    pub remainder: usize,
    /// Stride `s = p * d` between consecutive blocks of one process.
    pub stride: usize,
    /// Number of (possibly partial) cycles, `ceil(n / s)`.
    pub cycles: usize,
    /// Processes along the dimension.
    pub procs: usize,
    /// Halo elements shared with the next process (BLOCK only).
    pub overlap: usize,
}

fn div_ceil(a: usize, b: usize) -> usize {
    if b == 0 {
        0
    } else {
        a.div_ceil(b)
    }
}

/// Compute the layout of dimension `dim` of `map` for an extent of `element_count`.
///
/// Only BLOCK, CYCLIC and BLOCK_CYCLIC dimensions have a layout; anything else
/// is a misconfiguration and fails the call.
pub fn compute_layout(dim: usize, element_count: usize, map: &Map) -> Result<Layout> {
    let dist = map.dist(dim)?;
    let procs = map.grid().dim(dim)?;

    let block_len = match dist {
        Dist::Block { overlap } if overlap > 0 && procs > 1 => {
            div_ceil(element_count.saturating_sub(overlap), procs)
        }
        Dist::Block { .. } => div_ceil(element_count, procs),
        Dist::Cyclic => 1,
        Dist::BlockCyclic { block } => block,
        Dist::Local | Dist::Replicated => {
            tracing::error!(dim, kind = %dist.kind(), "no layout for undistributed dimension");
            return Err(ConduitError::UnsupportedDistribution {
                kind: dist.kind(),
                dim,
            });
        }
    };

    let stride = procs * block_len;
    let (cycles, remainder) = if stride == 0 {
        (0, 0)
    } else {
        (div_ceil(element_count, stride), element_count % stride)
    };

    Ok(Layout {
        block_len,
        remainder,
        stride,
        cycles,
        procs,
        overlap: dist.overlap(),
    })
}

/// Ownership of one array dimension across the processes of its grid axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimPartition {
    /// LOCAL or REPLICATED: every process on the axis stores the whole extent.
    Whole { extent: usize, replicated: bool },
    Distributed {
        kind: DistKind,
        extent: usize,
        layout: Layout,
    },
}

impl DimPartition {
    pub fn for_dim(dim: usize, extent: usize, map: &Map) -> Result<Self> {
        match map.dist(dim)? {
            Dist::Local => Ok(DimPartition::Whole {
                extent,
                replicated: false,
            }),
            Dist::Replicated => Ok(DimPartition::Whole {
                extent,
                replicated: true,
            }),
            dist => Ok(DimPartition::Distributed {
                kind: dist.kind(),
                extent,
                layout: compute_layout(dim, extent, map)?,
            }),
        }
    }

    pub fn extent(&self) -> usize {
        match *self {
            DimPartition::Whole { extent, .. } | DimPartition::Distributed { extent, .. } => {
                extent
            }
        }
    }

    /// Grid coordinate that owns global index `g` for sending.
    ///
    /// Every index has exactly one sending owner; halos and replicas are
    /// receive-only copies. Replicated dimensions send from coordinate 0.
    pub fn owner(&self, g: usize) -> usize {
        match *self {
            DimPartition::Whole { .. } => 0,
            DimPartition::Distributed {
                kind: DistKind::Block,
                layout,
                ..
            } => {
                if layout.block_len == 0 {
                    layout.procs - 1
                } else {
                    (g / layout.block_len).min(layout.procs - 1)
                }
            }
            DimPartition::Distributed { layout, .. } => {
                (g % layout.stride) / layout.block_len
            }
        }
    }

    /// Global indices stored by coordinate `coord`, halo included, ascending.
    pub fn stored_indices(&self, coord: usize) -> Vec<usize> {
        match *self {
            DimPartition::Whole { extent, .. } => (0..extent).collect(),
            DimPartition::Distributed {
                kind: DistKind::Block,
                extent,
                layout,
            } => {
                let start = (coord * layout.block_len).min(extent);
                let end = if coord + 1 == layout.procs {
                    extent
                } else {
                    (start + layout.block_len + layout.overlap).min(extent)
                };
                (start..end).collect()
            }
            DimPartition::Distributed { extent, layout, .. } => {
                let mut indices = Vec::new();
                for cycle in 0..layout.cycles {
                    let start = cycle * layout.stride + coord * layout.block_len;
                    indices.extend((start..start + layout.block_len).take_while(|&g| g < extent));
                }
                indices
            }
        }
    }

    /// Position of global index `g` inside the local storage of `coord`.
    pub fn local_index(&self, coord: usize, g: usize) -> usize {
        match *self {
            DimPartition::Whole { .. } => g,
            DimPartition::Distributed {
                kind: DistKind::Block,
                layout,
                ..
            } => g - coord * layout.block_len,
            DimPartition::Distributed { layout, .. } => {
                (g / layout.stride) * layout.block_len + (g % layout.stride)
                    - coord * layout.block_len
            }
        }
    }

    pub fn local_extent(&self, coord: usize) -> usize {
        self.stored_indices(coord).len()
    }
}

/// The part of an N-dimensional array one process stores, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBlock {
    coords: Vec<usize>,
    parts: Vec<DimPartition>,
    stored: Vec<Vec<usize>>,
}

impl LocalBlock {
    pub fn new(map: &Map, shape: &[usize], rank: usize) -> Result<Self> {
        if shape.len() != map.ndims() {
            return Err(ConduitError::config(format!(
                "array of rank {} does not fit a {}-dimensional map",
                shape.len(),
                map.ndims()
            )));
        }
        let coords = map
            .coords_of(rank)
            .ok_or_else(|| ConduitError::config(format!("rank {rank} is not placed by the map")))?;
        let parts = shape
            .iter()
            .enumerate()
            .map(|(dim, &extent)| DimPartition::for_dim(dim, extent, map))
            .collect::<Result<Vec<_>>>()?;
        let stored = parts
            .iter()
            .zip(&coords)
            .map(|(part, &coord)| part.stored_indices(coord))
            .collect();
        Ok(Self {
            coords,
            parts,
            stored,
        })
    }

    pub fn ndims(&self) -> usize {
        self.parts.len()
    }

    pub fn coords(&self) -> &[usize] {
        &self.coords
    }

    pub fn extents(&self) -> Vec<usize> {
        self.stored.iter().map(Vec::len).collect()
    }

    /// Elements stored locally.
    pub fn len(&self) -> usize {
        self.stored.iter().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Global indices stored along `dim`, halo included.
    pub fn stored_indices(&self, dim: usize) -> &[usize] {
        &self.stored[dim]
    }

    /// Global indices along `dim` this process is responsible for sending.
    pub fn owned_indices(&self, dim: usize) -> Vec<usize> {
        let coord = self.coords[dim];
        self.stored[dim]
            .iter()
            .copied()
            .filter(|&g| self.parts[dim].owner(g) == coord)
            .collect()
    }

    pub fn local_index(&self, dim: usize, g: usize) -> usize {
        self.parts[dim].local_index(self.coords[dim], g)
    }

    /// Row-major strides of the local storage.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.stored.len()];
        for dim in (0..self.stored.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * self.stored[dim + 1].len();
        }
        strides
    }

    /// Global coordinates of local element `flat`.
    pub fn global_coords(&self, flat: usize) -> Vec<usize> {
        let mut coords = vec![0; self.stored.len()];
        let mut rest = flat;
        for (dim, indices) in self.stored.iter().enumerate().rev() {
            if indices.is_empty() {
                continue;
            }
            coords[dim] = indices[rest % indices.len()];
            rest /= indices.len();
        }
        coords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Grid, RankList};
    use proptest::prelude::*;

    fn one_dim(procs: usize, dist: Dist) -> Map {
        Map::new(
            RankList::contiguous(0, procs),
            Grid::new(vec![procs]).unwrap(),
            vec![dist],
        )
        .unwrap()
    }

    #[test]
    fn block_layout() {
        let layout = compute_layout(0, 10, &one_dim(4, Dist::block())).unwrap();
        assert_eq!(layout.block_len, 3);
        assert_eq!(layout.stride, 12);
        assert_eq!(layout.cycles, 1);
        assert_eq!(layout.remainder, 10);
        assert_eq!(layout.procs, 4);
    }

    #[test]
    fn block_with_overlap_shrinks_block() {
        let layout = compute_layout(0, 10, &one_dim(3, Dist::Block { overlap: 1 })).unwrap();
        assert_eq!(layout.block_len, 3);
        assert_eq!(layout.overlap, 1);
        let part = DimPartition::for_dim(0, 10, &one_dim(3, Dist::Block { overlap: 1 })).unwrap();
        assert_eq!(part.stored_indices(0), vec![0, 1, 2, 3]);
        assert_eq!(part.stored_indices(1), vec![3, 4, 5, 6]);
        assert_eq!(part.stored_indices(2), vec![6, 7, 8, 9]);
        assert_eq!(part.owner(3), 1);
        assert_eq!(part.owner(9), 2);
    }

    #[test]
    fn cyclic_layout() {
        let layout = compute_layout(0, 10, &one_dim(3, Dist::Cyclic)).unwrap();
        assert_eq!(layout.block_len, 1);
        assert_eq!(layout.stride, 3);
        assert_eq!(layout.cycles, 4);
        assert_eq!(layout.remainder, 1);
    }

    #[test]
    fn block_cyclic_local_indices() {
        let map = one_dim(2, Dist::BlockCyclic { block: 2 });
        let part = DimPartition::for_dim(0, 9, &map).unwrap();
        assert_eq!(part.stored_indices(0), vec![0, 1, 4, 5, 8]);
        assert_eq!(part.stored_indices(1), vec![2, 3, 6, 7]);
        for (local, g) in part.stored_indices(1).into_iter().enumerate() {
            assert_eq!(part.local_index(1, g), local);
        }
    }

    #[test]
    fn undistributed_kinds_have_no_layout() {
        let map = one_dim(2, Dist::Replicated);
        assert!(matches!(
            compute_layout(0, 8, &map),
            Err(ConduitError::UnsupportedDistribution {
                kind: DistKind::Replicated,
                dim: 0
            })
        ));
        assert!(matches!(
            compute_layout(0, 8, &Map::local(0, 1)),
            Err(ConduitError::UnsupportedDistribution { .. })
        ));
        assert!(matches!(
            compute_layout(1, 8, &one_dim(2, Dist::Cyclic)),
            Err(ConduitError::InvalidDimension { .. })
        ));
    }

    #[test]
    fn empty_extent() {
        let layout = compute_layout(0, 0, &one_dim(3, Dist::block())).unwrap();
        assert_eq!(layout.block_len, 0);
        assert_eq!(layout.cycles, 0);
        let part = DimPartition::for_dim(0, 0, &one_dim(3, Dist::Cyclic)).unwrap();
        assert!(part.stored_indices(1).is_empty());
    }

    #[test]
    fn local_block_of_two_dimensional_map() {
        let map = Map::new(
            RankList::contiguous(0, 4),
            Grid::new(vec![2, 2]).unwrap(),
            vec![Dist::block(), Dist::Cyclic],
        )
        .unwrap();
        // Rank 3 sits at grid (1, 1): rows 3..5, odd columns.
        let block = LocalBlock::new(&map, &[5, 5], 3).unwrap();
        assert_eq!(block.coords(), &[1, 1]);
        assert_eq!(block.extents(), vec![2, 2]);
        assert_eq!(block.len(), 4);
        assert_eq!(block.strides(), vec![2, 1]);
        assert_eq!(block.global_coords(0), vec![3, 1]);
        assert_eq!(block.global_coords(3), vec![4, 3]);
        assert_eq!(block.local_index(1, 3), 1);
        assert!(LocalBlock::new(&map, &[5, 5], 7).is_err());
        assert!(LocalBlock::new(&map, &[5], 0).is_err());
    }

    #[test]
    fn replicated_block_stores_everything_but_owns_only_at_zero() {
        let map = Map::new(
            RankList::contiguous(0, 2),
            Grid::new(vec![2]).unwrap(),
            vec![Dist::Replicated],
        )
        .unwrap();
        let first = LocalBlock::new(&map, &[4], 0).unwrap();
        let second = LocalBlock::new(&map, &[4], 1).unwrap();
        assert_eq!(first.stored_indices(0), &[0, 1, 2, 3]);
        assert_eq!(second.stored_indices(0), &[0, 1, 2, 3]);
        assert_eq!(first.owned_indices(0), vec![0, 1, 2, 3]);
        assert!(second.owned_indices(0).is_empty());
    }

    fn dist_strategy() -> impl Strategy<Value = Dist> {
        prop_oneof![
            Just(Dist::block()),
            Just(Dist::Cyclic),
            (1usize..6).prop_map(|block| Dist::BlockCyclic { block }),
        ]
    }

    proptest! {
        #[test]
        fn block_covers_extent_minimally(n in 1usize..500, p in 1usize..17) {
            let layout = compute_layout(0, n, &one_dim(p, Dist::block())).unwrap();
            let d = layout.block_len;
            prop_assert!(d * p >= n);
            prop_assert!((d - 1) * p < n);
            // The last process holds data exactly when d * (p - 1) < n.
            let part = DimPartition::for_dim(0, n, &one_dim(p, Dist::block())).unwrap();
            prop_assert_eq!(part.local_extent(p - 1) > 0, d * (p - 1) < n);
        }

        #[test]
        fn layout_is_deterministic(n in 0usize..300, p in 1usize..9, dist in dist_strategy()) {
            let map = one_dim(p, dist);
            prop_assert_eq!(compute_layout(0, n, &map).unwrap(), compute_layout(0, n, &map).unwrap());
        }

        #[test]
        fn stride_is_procs_times_block(n in 0usize..300, p in 1usize..9, dist in dist_strategy()) {
            let layout = compute_layout(0, n, &one_dim(p, dist)).unwrap();
            prop_assert_eq!(layout.stride, layout.procs * layout.block_len);
        }

        #[test]
        fn every_index_has_one_owner_that_stores_it(
            n in 1usize..200,
            p in 1usize..7,
            dist in dist_strategy(),
        ) {
            let part = DimPartition::for_dim(0, n, &one_dim(p, dist)).unwrap();
            let mut seen = vec![0usize; n];
            for coord in 0..p {
                let stored = part.stored_indices(coord);
                for (local, &g) in stored.iter().enumerate() {
                    prop_assert_eq!(part.local_index(coord, g), local);
                    if part.owner(g) == coord {
                        seen[g] += 1;
                    }
                }
            }
            prop_assert!(seen.iter().all(|&count| count == 1));
        }
    }
}
