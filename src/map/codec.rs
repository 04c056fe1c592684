//! Flat integer encoding of maps.
//!
//! Map descriptions produced by the offline preprocessing tool arrive as a
//! flat list of integers:
//!
//! ```text
//! DistDescription  kind block overlap
//! Grid             ndims dim0 dim1 ...
//! RankList         n rank0 rank1 ...
//! Map              Grid DistDescription*ndims RankList
//! ```
//!
//! Kind codes: LOCAL=0, BLOCK=1, CYCLIC=2, BLOCK_CYCLIC=3, REPLICATED=4.
//! Decoding only accepts the canonical form `serialize` writes, so the two
//! are exact inverses.

use crate::error::{ConduitError, Result};

use super::{Dist, DistKind, Grid, Map, RankList};

/// Cursor over a flat integer description.
pub struct FlatReader<'a> {
    words: &'a [i64],
    pos: usize,
}

impl<'a> FlatReader<'a> {
    pub fn new(words: &'a [i64]) -> Self {
        Self { words, pos: 0 }
    }

    pub fn next(&mut self) -> Result<i64> {
        let word = self.words.get(self.pos).copied().ok_or_else(|| {
            ConduitError::Decode(format!("description truncated at word {}", self.pos))
        })?;
        self.pos += 1;
        Ok(word)
    }

    pub fn next_usize(&mut self) -> Result<usize> {
        let word = self.next()?;
        usize::try_from(word).map_err(|_| {
            ConduitError::Decode(format!("negative value {word} at word {}", self.pos - 1))
        })
    }

    /// Error unless every word has been consumed.
    pub fn finish(&self) -> Result<()> {
        if self.pos != self.words.len() {
            return Err(ConduitError::Decode(format!(
                "{} trailing words after description",
                self.words.len() - self.pos
            )));
        }
        Ok(())
    }
}

pub trait FlatCodec: Sized {
    fn serialize_into(&self, out: &mut Vec<i64>);

    fn deserialize_from(reader: &mut FlatReader<'_>) -> Result<Self>;

    fn serialize(&self) -> Vec<i64> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    fn deserialize(words: &[i64]) -> Result<Self> {
        let mut reader = FlatReader::new(words);
        let value = Self::deserialize_from(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

impl FlatCodec for Dist {
    fn serialize_into(&self, out: &mut Vec<i64>) {
        out.push(self.kind().code());
        out.push(self.block_size() as i64);
        out.push(self.overlap() as i64);
    }

    fn deserialize_from(reader: &mut FlatReader<'_>) -> Result<Self> {
        let code = reader.next()?;
        let kind = DistKind::from_code(code)
            .ok_or_else(|| ConduitError::Decode(format!("unknown distribution kind {code}")))?;
        let block = reader.next_usize()?;
        let overlap = reader.next_usize()?;

        let dist = match kind {
            DistKind::Local => Dist::Local,
            DistKind::Block => Dist::Block { overlap },
            DistKind::Cyclic => Dist::Cyclic,
            DistKind::BlockCyclic => Dist::BlockCyclic { block },
            DistKind::Replicated => Dist::Replicated,
        };
        if dist.block_size() != block || dist.overlap() != overlap {
            return Err(ConduitError::Decode(format!(
                "non-canonical {kind} description (block {block}, overlap {overlap})"
            )));
        }
        Ok(dist)
    }
}

impl FlatCodec for Grid {
    fn serialize_into(&self, out: &mut Vec<i64>) {
        out.push(self.ndims() as i64);
        out.extend(self.dims().iter().map(|&d| d as i64));
    }

    fn deserialize_from(reader: &mut FlatReader<'_>) -> Result<Self> {
        let ndims = reader.next_usize()?;
        let dims = (0..ndims)
            .map(|_| reader.next_usize())
            .collect::<Result<Vec<_>>>()?;
        Grid::new(dims).map_err(|e| ConduitError::Decode(e.to_string()))
    }
}

impl FlatCodec for RankList {
    fn serialize_into(&self, out: &mut Vec<i64>) {
        out.push(self.len() as i64);
        out.extend(self.iter().map(|r| r as i64));
    }

    fn deserialize_from(reader: &mut FlatReader<'_>) -> Result<Self> {
        let len = reader.next_usize()?;
        let ranks = (0..len)
            .map(|_| reader.next_usize())
            .collect::<Result<Vec<_>>>()?;
        RankList::new(ranks).map_err(|e| ConduitError::Decode(e.to_string()))
    }
}

impl FlatCodec for Map {
    fn serialize_into(&self, out: &mut Vec<i64>) {
        self.grid().serialize_into(out);
        for dist in self.dists() {
            dist.serialize_into(out);
        }
        self.ranks().serialize_into(out);
    }

    fn deserialize_from(reader: &mut FlatReader<'_>) -> Result<Self> {
        let grid = Grid::deserialize_from(reader)?;
        let dists = (0..grid.ndims())
            .map(|_| Dist::deserialize_from(reader))
            .collect::<Result<Vec<_>>>()?;
        let ranks = RankList::deserialize_from(reader)?;
        Map::new(ranks, grid, dists).map_err(|e| ConduitError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> Map {
        Map::new(
            RankList::new(vec![4, 5, 6, 7, 8, 9]).unwrap(),
            Grid::new(vec![2, 3]).unwrap(),
            vec![Dist::Block { overlap: 1 }, Dist::BlockCyclic { block: 4 }],
        )
        .unwrap()
    }

    #[test]
    fn map_layout_matches_documented_encoding() {
        let words = sample_map().serialize();
        assert_eq!(
            words,
            vec![2, 2, 3, 1, 0, 1, 3, 4, 0, 6, 4, 5, 6, 7, 8, 9]
        );
    }

    #[test]
    fn map_decodes_to_equal_map() {
        let map = sample_map();
        assert_eq!(Map::deserialize(&map.serialize()).unwrap(), map);
    }

    #[test]
    fn every_dist_kind_decodes_back() {
        for dist in [
            Dist::Local,
            Dist::block(),
            Dist::Block { overlap: 3 },
            Dist::Cyclic,
            Dist::BlockCyclic { block: 7 },
            Dist::Replicated,
        ] {
            assert_eq!(Dist::deserialize(&dist.serialize()).unwrap(), dist);
        }
    }

    #[test]
    fn rejects_non_canonical_cyclic() {
        assert!(matches!(
            Dist::deserialize(&[2, 4, 0]),
            Err(ConduitError::Decode(_))
        ));
    }

    #[test]
    fn rejects_unknown_kind_and_truncation() {
        assert!(Dist::deserialize(&[9, 0, 0]).is_err());
        assert!(Grid::deserialize(&[3, 1, 2]).is_err());
        assert!(RankList::deserialize(&[2, 0, 1, 5]).is_err());
        assert!(RankList::deserialize(&[1, -3]).is_err());
    }

    #[test]
    fn map_decode_checks_grid_against_ranks() {
        // 2x2 grid with only three ranks.
        let words = vec![2, 2, 2, 1, 0, 0, 2, 1, 0, 3, 0, 1, 2];
        assert!(Map::deserialize(&words).is_err());
    }
}
