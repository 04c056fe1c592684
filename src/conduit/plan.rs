//! Connection planning.
//!
//! Every process derives the full connection set of a conduit from the two
//! tasks' maps alone, then keeps the connections it takes part in. For each
//! pair of replicas that share frames, every (source process, destination
//! process) pair whose blocks overlap gets a connection carrying the overlap.
//! The first process of each source replica always keeps a connection to
//! every destination process so that tags and end-of-chunk markers reach
//! processes with nothing else to receive.

use rayon::prelude::*;

use crate::correspondence::{find_initial_buffer_indices, BufferIndices};
use crate::error::{ConduitError, Result};
use crate::layout::LocalBlock;
use crate::task::Task;

use super::connection::ConnectionPlan;

/// Axis of the destination array that source axis `dim` lands on.
pub fn dest_axis(dim: usize, transpose: bool) -> usize {
    match (transpose, dim) {
        (true, 0) => 1,
        (true, 1) => 0,
        _ => dim,
    }
}

/// Shape of the destination array for a source array of `shape`.
pub fn destination_shape(shape: &[usize], transpose: bool) -> Vec<usize> {
    let mut dst = shape.to_vec();
    if transpose && dst.len() >= 2 {
        dst.swap(0, 1);
    }
    dst
}

struct Candidate {
    src_replica: usize,
    dst_replica: usize,
    src_proc: usize,
    dst_proc: usize,
    src_rank: usize,
    dst_rank: usize,
    indices: BufferIndices,
}

/// Connections of the conduit `src -> dst` that `rank` is an endpoint of.
pub fn plan_connections(
    src: &Task,
    dst: &Task,
    shape: &[usize],
    transpose: bool,
    rank: usize,
) -> Result<Vec<ConnectionPlan>> {
    check_shape(src, dst, shape, transpose)?;
    let dst_shape = destination_shape(shape, transpose);
    let (m, n) = (src.replicas(), dst.replicas());

    let mut candidates = Vec::new();
    for src_replica in 0..m {
        for dst_replica in 0..n {
            let Some(indices) = find_initial_buffer_indices(src_replica, m, dst_replica, n) else {
                continue;
            };
            let src_ranks = src.map(src_replica)?.ranks();
            let dst_ranks = dst.map(dst_replica)?.ranks();
            for (src_proc, src_rank) in src_ranks.iter().enumerate() {
                for (dst_proc, dst_rank) in dst_ranks.iter().enumerate() {
                    if src_rank == rank || dst_rank == rank {
                        candidates.push(Candidate {
                            src_replica,
                            dst_replica,
                            src_proc,
                            dst_proc,
                            src_rank,
                            dst_rank,
                            indices,
                        });
                    }
                }
            }
        }
    }

    let plans = candidates
        .into_par_iter()
        .map(|c| {
            let src_block = LocalBlock::new(src.map(c.src_replica)?, shape, c.src_rank)?;
            let dst_block = LocalBlock::new(dst.map(c.dst_replica)?, &dst_shape, c.dst_rank)?;
            let (src_offsets, dst_offsets) = overlap(&src_block, &dst_block, transpose);
            if src_offsets.is_empty() && c.src_proc != 0 {
                return Ok(None);
            }
            Ok(Some(ConnectionPlan {
                src_replica: c.src_replica,
                dst_replica: c.dst_replica,
                src_proc: c.src_proc,
                dst_proc: c.dst_proc,
                src_rank: c.src_rank,
                dst_rank: c.dst_rank,
                indices: c.indices,
                src_offsets,
                dst_offsets,
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(plans.into_iter().flatten().collect())
}

fn check_shape(src: &Task, dst: &Task, shape: &[usize], transpose: bool) -> Result<()> {
    let src_dims = src.map(0)?.ndims();
    let dst_dims = dst.map(0)?.ndims();
    if shape.len() != src_dims || shape.len() != dst_dims {
        return Err(ConduitError::config(format!(
            "array of rank {} between a {src_dims}-d source and a {dst_dims}-d destination",
            shape.len()
        )));
    }
    if transpose && shape.len() < 2 {
        return Err(ConduitError::config(
            "transpose needs an array of at least two dimensions",
        ));
    }
    Ok(())
}

/// Ascending intersection of two ascending index lists.
fn intersect(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Local offsets, on both sides, of the elements `src` owns and `dst` stores.
///
/// Elements are enumerated in row-major order of the source array.
fn overlap(src: &LocalBlock, dst: &LocalBlock, transpose: bool) -> (Vec<usize>, Vec<usize>) {
    let ndims = src.ndims();
    let mut common = Vec::with_capacity(ndims);
    for dim in 0..ndims {
        let shared = intersect(&src.owned_indices(dim), dst.stored_indices(dest_axis(dim, transpose)));
        if shared.is_empty() {
            return (Vec::new(), Vec::new());
        }
        common.push(shared);
    }

    let src_strides = src.strides();
    let dst_strides = dst.strides();
    let src_terms: Vec<Vec<usize>> = common
        .iter()
        .enumerate()
        .map(|(dim, indices)| {
            indices
                .iter()
                .map(|&g| src.local_index(dim, g) * src_strides[dim])
                .collect()
        })
        .collect();
    let dst_terms: Vec<Vec<usize>> = common
        .iter()
        .enumerate()
        .map(|(dim, indices)| {
            let axis = dest_axis(dim, transpose);
            indices
                .iter()
                .map(|&g| dst.local_index(axis, g) * dst_strides[axis])
                .collect()
        })
        .collect();

    let total: usize = common.iter().map(Vec::len).product();
    let mut src_offsets = Vec::with_capacity(total);
    let mut dst_offsets = Vec::with_capacity(total);
    let mut counter = vec![0usize; ndims];
    for _ in 0..total {
        src_offsets.push(counter.iter().enumerate().map(|(d, &i)| src_terms[d][i]).sum());
        dst_offsets.push(counter.iter().enumerate().map(|(d, &i)| dst_terms[d][i]).sum());
        for dim in (0..ndims).rev() {
            counter[dim] += 1;
            if counter[dim] < common[dim].len() {
                break;
            }
            counter[dim] = 0;
        }
    }
    (src_offsets, dst_offsets)
}
