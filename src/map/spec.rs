//! Textual map specifications.
//!
//! A compact notation for grids and distributions, used by the `conduit` binary:
//!
//! ```text
//! local                       one process, undistributed
//! block(P)                    P processes, block distribution
//! block(P, overlap=O)         block with O halo elements
//! cyclic(P)                   P processes, cyclic
//! blockcyclic(P, B)           P processes, blocks of B dealt cyclically
//! replicated(P)               P processes, each holding the full extent
//! block(2) x cyclic(3)        one entry per dimension, joined by `x`
//! ```
//!
//! Keywords are case-insensitive.

use nom::branch::alt;
use nom::bytes::complete::tag_no_case;
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{all_consuming, map, map_res, opt, value};
use nom::multi::separated_list1;
use nom::sequence::{delimited, preceded, separated_pair};
use nom::IResult;
use nom::Parser;

use crate::error::{ConduitError, Result};

use super::{Dist, Grid, Map, RankList};

/// Grid and distributions parsed from a spec, not yet placed on ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    pub grid: Grid,
    pub dists: Vec<Dist>,
}

impl MapSpec {
    /// Number of processes the layout needs.
    pub fn procs(&self) -> usize {
        self.grid.size()
    }

    /// Place the layout on a concrete rank list.
    #[track_caller]
    pub fn place(&self, ranks: RankList) -> Result<Map> {
        Map::new(ranks, self.grid.clone(), self.dists.clone())
    }
}

/// Parse a textual map spec such as `block(2) x cyclic(3)`.
pub fn parse_map_spec(input: &str) -> Result<MapSpec> {
    let (_, dims) = all_consuming(delimited(
        multispace0,
        separated_list1(delimited(multispace0, tag_no_case("x"), multispace0), dimension),
        multispace0,
    ))
    .parse(input)
    .map_err(|e| ConduitError::Parse(format!("'{input}': {e}")))?;

    let (procs, dists): (Vec<usize>, Vec<Dist>) = dims.into_iter().unzip();
    let grid = Grid::new(procs).map_err(|e| ConduitError::Parse(e.to_string()))?;
    if dists.iter().any(|d| matches!(d, Dist::BlockCyclic { block: 0 })) {
        return Err(ConduitError::Parse(format!(
            "'{input}': blockcyclic block size must be positive"
        )));
    }
    Ok(MapSpec { grid, dists })
}

fn number(input: &str) -> IResult<&str, usize> {
    map_res(digit1, str::parse::<usize>).parse(input)
}

fn open(input: &str) -> IResult<&str, char> {
    delimited(multispace0, char('('), multispace0).parse(input)
}

fn close(input: &str) -> IResult<&str, char> {
    preceded(multispace0, char(')')).parse(input)
}

fn comma(input: &str) -> IResult<&str, char> {
    delimited(multispace0, char(','), multispace0).parse(input)
}

/// One dimension: `(process count, distribution)`.
fn dimension(input: &str) -> IResult<&str, (usize, Dist)> {
    alt((blockcyclic, block, cyclic, replicated, local)).parse(input)
}

fn block(input: &str) -> IResult<&str, (usize, Dist)> {
    let overlap = preceded(
        (comma, tag_no_case("overlap"), multispace0, char('='), multispace0),
        number,
    );
    map(
        preceded(
            tag_no_case("block"),
            delimited(open, (number, opt(overlap)), close),
        ),
        |(procs, overlap)| {
            (
                procs,
                Dist::Block {
                    overlap: overlap.unwrap_or(0),
                },
            )
        },
    )
    .parse(input)
}

fn blockcyclic(input: &str) -> IResult<&str, (usize, Dist)> {
    map(
        preceded(
            tag_no_case("blockcyclic"),
            delimited(open, separated_pair(number, comma, number), close),
        ),
        |(procs, block)| (procs, Dist::BlockCyclic { block }),
    )
    .parse(input)
}

fn cyclic(input: &str) -> IResult<&str, (usize, Dist)> {
    map(
        preceded(tag_no_case("cyclic"), delimited(open, number, close)),
        |procs| (procs, Dist::Cyclic),
    )
    .parse(input)
}

fn replicated(input: &str) -> IResult<&str, (usize, Dist)> {
    map(
        preceded(tag_no_case("replicated"), delimited(open, number, close)),
        |procs| (procs, Dist::Replicated),
    )
    .parse(input)
}

fn local(input: &str) -> IResult<&str, (usize, Dist)> {
    value((1, Dist::Local), tag_no_case("local")).parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_block() {
        let spec = parse_map_spec("block(4)").unwrap();
        assert_eq!(spec.grid.dims(), &[4]);
        assert_eq!(spec.dists, vec![Dist::block()]);
    }

    #[test]
    fn parse_block_with_overlap() {
        let spec = parse_map_spec("BLOCK( 3 , overlap = 2 )").unwrap();
        assert_eq!(spec.grid.dims(), &[3]);
        assert_eq!(spec.dists, vec![Dist::Block { overlap: 2 }]);
    }

    #[test]
    fn parse_two_dimensions() {
        let spec = parse_map_spec("blockcyclic(2, 4) x cyclic(3)").unwrap();
        assert_eq!(spec.grid.dims(), &[2, 3]);
        assert_eq!(
            spec.dists,
            vec![Dist::BlockCyclic { block: 4 }, Dist::Cyclic]
        );
        assert_eq!(spec.procs(), 6);
    }

    #[test]
    fn parse_local_and_replicated() {
        let spec = parse_map_spec("local x replicated(2)").unwrap();
        assert_eq!(spec.grid.dims(), &[1, 2]);
        assert_eq!(spec.dists, vec![Dist::Local, Dist::Replicated]);
    }

    #[test]
    fn place_on_ranks() {
        let spec = parse_map_spec("cyclic(3)").unwrap();
        let map = spec.place(RankList::contiguous(4, 3)).unwrap();
        assert_eq!(map.ranks().as_slice(), &[4, 5, 6]);
        assert!(spec.place(RankList::contiguous(0, 2)).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_map_spec("blok(2)"), Err(ConduitError::Parse(_))));
        assert!(parse_map_spec("block(2) x").is_err());
        assert!(parse_map_spec("cyclic(0)").is_err());
        assert!(parse_map_spec("blockcyclic(2, 0)").is_err());
    }
}
