//! Process maps: rank lists, process grids and per-dimension distributions.
//!
//! A [`Map`] says how a distributed array is laid out over the processes of
//! one task replica. Ranks are placed on the grid in row-major order (the last
//! grid dimension varies fastest), matching how local storage is laid out.

pub mod codec;
pub mod spec;

use std::fmt;

use crate::error::{ConduitError, Result};

pub use codec::{FlatCodec, FlatReader};

/// Distribution kind of one dimension, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistKind {
    Local,
    Block,
    Cyclic,
    BlockCyclic,
    Replicated,
}

impl DistKind {
    /// Integer code used by the flat map encoding.
    pub fn code(self) -> i64 {
        match self {
            DistKind::Local => 0,
            DistKind::Block => 1,
            DistKind::Cyclic => 2,
            DistKind::BlockCyclic => 3,
            DistKind::Replicated => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DistKind::Local),
            1 => Some(DistKind::Block),
            2 => Some(DistKind::Cyclic),
            3 => Some(DistKind::BlockCyclic),
            4 => Some(DistKind::Replicated),
            _ => None,
        }
    }
}

impl fmt::Display for DistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistKind::Local => "LOCAL",
            DistKind::Block => "BLOCK",
            DistKind::Cyclic => "CYCLIC",
            DistKind::BlockCyclic => "BLOCK_CYCLIC",
            DistKind::Replicated => "REPLICATED",
        };
        f.write_str(name)
    }
}

/// How one array dimension is spread over the processes of its grid axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dist {
    /// Not distributed; the grid axis must have a single process.
    Local,
    /// Contiguous blocks of `ceil(n / p)`, optionally sharing `overlap` halo
    /// elements with the next process.
    Block { overlap: usize },
    /// Element `i` lives on process `i mod p`.
    Cyclic,
    /// Blocks of `block` elements dealt round-robin over the processes.
    BlockCyclic { block: usize },
    /// Every process on the axis holds the full extent.
    Replicated,
}

impl Dist {
    pub fn block() -> Self {
        Dist::Block { overlap: 0 }
    }

    pub fn kind(&self) -> DistKind {
        match self {
            Dist::Local => DistKind::Local,
            Dist::Block { .. } => DistKind::Block,
            Dist::Cyclic => DistKind::Cyclic,
            Dist::BlockCyclic { .. } => DistKind::BlockCyclic,
            Dist::Replicated => DistKind::Replicated,
        }
    }

    /// Configured block size (0 when the block length is derived from the extent).
    pub fn block_size(&self) -> usize {
        match self {
            Dist::Cyclic => 1,
            Dist::BlockCyclic { block } => *block,
            _ => 0,
        }
    }

    pub fn overlap(&self) -> usize {
        match self {
            Dist::Block { overlap } => *overlap,
            _ => 0,
        }
    }

    /// Overwrite this description with `other`, refusing to change its kind.
    #[track_caller]
    pub fn assign(&mut self, other: Dist) -> Result<()> {
        if self.kind() != other.kind() {
            return Err(ConduitError::DistributionMismatch {
                expected: self.kind(),
                found: other.kind(),
                location: std::panic::Location::caller(),
            });
        }
        *self = other;
        Ok(())
    }
}

/// Ordered set of global process ranks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RankList(Vec<usize>);

impl RankList {
    #[track_caller]
    pub fn new(ranks: Vec<usize>) -> Result<Self> {
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConduitError::config(format!(
                "rank list contains duplicates: {ranks:?}"
            )));
        }
        Ok(RankList(ranks))
    }

    /// Ranks `start..start + len`.
    pub fn contiguous(start: usize, len: usize) -> Self {
        RankList((start..start + len).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[track_caller]
    pub fn get(&self, index: usize) -> Result<usize> {
        self.0
            .get(index)
            .copied()
            .ok_or_else(|| ConduitError::invalid_rank_index(index, self.0.len()))
    }

    /// Index of `rank` within the list.
    pub fn position(&self, rank: usize) -> Option<usize> {
        self.0.iter().position(|&r| r == rank)
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.0.contains(&rank)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Split into `parts` equal consecutive groups.
    #[track_caller]
    pub fn split(&self, parts: usize) -> Result<Vec<RankList>> {
        if parts == 0 || self.0.len() % parts != 0 {
            return Err(ConduitError::config(format!(
                "cannot split {} ranks into {parts} equal groups",
                self.0.len()
            )));
        }
        let chunk = self.0.len() / parts;
        Ok(self.0.chunks(chunk).map(|c| RankList(c.to_vec())).collect())
    }
}

/// Process count along each grid dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Grid(Vec<usize>);

impl Grid {
    #[track_caller]
    pub fn new(dims: Vec<usize>) -> Result<Self> {
        if dims.is_empty() || dims.contains(&0) {
            return Err(ConduitError::config(format!(
                "grid dimensions must be non-empty and positive, got {dims:?}"
            )));
        }
        Ok(Grid(dims))
    }

    pub fn ndims(&self) -> usize {
        self.0.len()
    }

    #[track_caller]
    pub fn dim(&self, dim: usize) -> Result<usize> {
        self.0
            .get(dim)
            .copied()
            .ok_or_else(|| ConduitError::invalid_dimension(dim, self.0.len()))
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Total process count.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major grid coordinates of the process at `index`.
    pub fn coords(&self, index: usize) -> Vec<usize> {
        let mut coords = vec![0; self.0.len()];
        let mut rest = index;
        for (axis, &extent) in self.0.iter().enumerate().rev() {
            coords[axis] = rest % extent;
            rest /= extent;
        }
        coords
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Map {
    ranks: RankList,
    grid: Grid,
    dists: Vec<Dist>,
}

impl Map {
    #[track_caller]
    pub fn new(ranks: RankList, grid: Grid, dists: Vec<Dist>) -> Result<Self> {
        if dists.len() != grid.ndims() {
            return Err(ConduitError::config(format!(
                "map has {} distributions for a {}-dimensional grid",
                dists.len(),
                grid.ndims()
            )));
        }
        if grid.size() != ranks.len() {
            return Err(ConduitError::config(format!(
                "grid {:?} holds {} processes but the rank list has {}",
                grid.dims(),
                grid.size(),
                ranks.len()
            )));
        }
        for (dim, (&dist, &procs)) in dists.iter().zip(grid.dims()).enumerate() {
            check_dist(dim, dist, procs)?;
        }
        Ok(Map { ranks, grid, dists })
    }

    /// One-dimensional block map over `ranks`.
    #[track_caller]
    pub fn block(ranks: RankList) -> Result<Self> {
        let grid = Grid::new(vec![ranks.len()])?;
        Map::new(ranks, grid, vec![Dist::block()])
    }

    /// Degenerate map placing every dimension on the single process `rank`.
    pub fn local(rank: usize, ndims: usize) -> Self {
        Map {
            ranks: RankList(vec![rank]),
            grid: Grid(vec![1; ndims.max(1)]),
            dists: vec![Dist::Local; ndims.max(1)],
        }
    }

    pub fn ranks(&self) -> &RankList {
        &self.ranks
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn dists(&self) -> &[Dist] {
        &self.dists
    }

    pub fn ndims(&self) -> usize {
        self.dists.len()
    }

    pub fn num_procs(&self) -> usize {
        self.ranks.len()
    }

    #[track_caller]
    pub fn dist(&self, dim: usize) -> Result<Dist> {
        self.dists
            .get(dim)
            .copied()
            .ok_or_else(|| ConduitError::invalid_dimension(dim, self.dists.len()))
    }

    /// Replace the distribution of `dim`, which must keep its kind.
    #[track_caller]
    pub fn assign_dist(&mut self, dim: usize, dist: Dist) -> Result<()> {
        let ndims = self.dists.len();
        let procs = self.grid.dims().get(dim).copied().unwrap_or(1);
        match self.dists.get_mut(dim) {
            Some(slot) => {
                if slot.kind() == dist.kind() {
                    check_dist(dim, dist, procs)?;
                }
                slot.assign(dist)
            }
            None => Err(ConduitError::invalid_dimension(dim, ndims)),
        }
    }

    /// Grid coordinates of `rank`, or `None` when it is not part of the map.
    pub fn coords_of(&self, rank: usize) -> Option<Vec<usize>> {
        self.ranks.position(rank).map(|idx| self.grid.coords(idx))
    }

    /// Same grid and distributions placed on a different rank list.
    #[track_caller]
    pub fn with_ranks(&self, ranks: RankList) -> Result<Self> {
        Map::new(ranks, self.grid.clone(), self.dists.clone())
    }

    /// True when both maps share grid and distributions (rank lists may differ).
    pub fn same_layout(&self, other: &Map) -> bool {
        self.grid == other.grid && self.dists == other.dists
    }
}

/// Constraints a distribution places on the dimension carrying it.
#[track_caller]
fn check_dist(dim: usize, dist: Dist, procs: usize) -> Result<()> {
    match dist {
        Dist::Local if procs != 1 => Err(ConduitError::config(format!(
            "dimension {dim} is LOCAL but spans {procs} processes"
        ))),
        Dist::BlockCyclic { block: 0 } => Err(ConduitError::config(format!(
            "dimension {dim} is BLOCK_CYCLIC with a zero block size"
        ))),
        _ => Ok(()),
    }
}
