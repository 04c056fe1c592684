//! Buffer correspondence between replicated source and destination tasks.
//!
//! Frames are dealt round-robin: the k-th insert of source replica `s` (of `m`)
//! is global frame `s + k*m`, and the j-th extract of destination replica `d`
//! (of `n`) is global frame `d + j*n`. Frame `f` therefore flows from replica
//! `f mod m` to replica `f mod n`, and a replica pair `(s, d)` shares the frames
//! solving `f ≡ s (mod m), f ≡ d (mod n)`. By the Chinese remainder theorem
//! those exist iff `s ≡ d (mod gcd(m, n))` and repeat every `lcm(m, n)` frames.
//!
//! Every process evaluates this independently; nothing is communicated.

/// Extended Euclid: `(g, x, y)` with `a*x + b*y = g = gcd(a, b)` and `g >= 0`.
pub fn extended_gcd(a: i64, b: i64) -> (i64, i64, i64) {
    let (mut old_r, mut r) = (a, b);
    let (mut old_x, mut x) = (1i64, 0i64);
    let (mut old_y, mut y) = (0i64, 1i64);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_x, x) = (x, old_x - q * x);
        (old_y, y) = (y, old_y - q * y);
    }
    if old_r < 0 {
        (-old_r, -old_x, -old_y)
    } else {
        (old_r, old_x, old_y)
    }
}

/// Inverse of `a` modulo `modulus`, if `a` and `modulus` are coprime.
pub fn modular_inverse(a: u64, modulus: u64) -> Option<u64> {
    if modulus == 0 {
        return None;
    }
    if modulus == 1 {
        return Some(0);
    }
    let (g, x, _) = extended_gcd((a % modulus) as i64, modulus as i64);
    if g != 1 {
        return None;
    }
    Some(x.rem_euclid(modulus as i64) as u64)
}

/// `(a⁻¹ mod b, b⁻¹ mod a)` for coprime `a` and `b`.
pub fn double_modular_inverse(a: u64, b: u64) -> Option<(u64, u64)> {
    Some((modular_inverse(a, b)?, modular_inverse(b, a)?))
}

/// Where a replica pair's shared frame stream starts on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferIndices {
    /// Insert index (on the source replica) of the first shared frame, in `[0, n/g)`.
    pub src: usize,
    /// Extract index (on the destination replica) of the first shared frame, in `[0, m/g)`.
    pub dst: usize,
    /// Global number of the first shared frame, in `[0, lcm(m, n))`.
    pub first_frame: u64,
    /// Frame distance between consecutive shared frames, `lcm(m, n)`.
    pub frame_stride: u64,
}

impl BufferIndices {
    /// How many source inserts pass between two frames of this pair.
    pub fn src_period(&self, src_replicas: usize) -> usize {
        (self.frame_stride / src_replicas as u64) as usize
    }

    /// How many destination extracts pass between two frames of this pair.
    pub fn dst_period(&self, dst_replicas: usize) -> usize {
        (self.frame_stride / dst_replicas as u64) as usize
    }

    /// Global frame of the `t`-th transfer between the pair.
    pub fn frame(&self, transfer: u64) -> u64 {
        self.first_frame + transfer * self.frame_stride
    }
}

/// Initial buffer indices for source replica `src_rank` of `src_replicas`
/// talking to destination replica `dst_rank` of `dst_replicas`.
///
/// Returns `None` when the pair never exchanges a frame (the replica ranks
/// differ modulo `gcd(src_replicas, dst_replicas)`) or the arguments are out
/// of range.
pub fn find_initial_buffer_indices(
    src_rank: usize,
    src_replicas: usize,
    dst_rank: usize,
    dst_replicas: usize,
) -> Option<BufferIndices> {
    if src_replicas == 0 || dst_replicas == 0 {
        return None;
    }
    if src_rank >= src_replicas || dst_rank >= dst_replicas {
        return None;
    }

    let (m, n) = (src_replicas as i64, dst_replicas as i64);
    let (s, d) = (src_rank as i64, dst_rank as i64);
    let (g, _, _) = extended_gcd(m, n);
    if (d - s).rem_euclid(g) != 0 {
        return None;
    }

    // Reduce to the coprime pair (m/g, n/g) and fold the two replica ranks
    // into one frame offset.
    let (m_red, n_red) = (m / g, n / g);
    let (m_inv, _) = double_modular_inverse(m_red as u64, n_red as u64)?;
    let t = ((d - s) / g).rem_euclid(n_red);
    let k = (t * m_inv as i64).rem_euclid(n_red);
    let first_frame = s + m * k;

    Some(BufferIndices {
        src: k as usize,
        dst: ((first_frame - d) / n) as usize,
        first_frame: first_frame as u64,
        frame_stride: (m * n_red) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn extended_gcd_bezout() {
        let (g, x, y) = extended_gcd(240, 46);
        assert_eq!(g, 2);
        assert_eq!(240 * x + 46 * y, 2);
        assert_eq!(extended_gcd(0, 5).0, 5);
        assert_eq!(extended_gcd(7, 0).0, 7);
    }

    #[test]
    fn modular_inverse_values() {
        assert_eq!(modular_inverse(3, 7), Some(5));
        assert_eq!(modular_inverse(2, 4), None);
        assert_eq!(modular_inverse(5, 1), Some(0));
        assert_eq!(double_modular_inverse(2, 3), Some((2, 1)));
        assert_eq!(double_modular_inverse(4, 6), None);
    }

    #[test]
    fn coprime_reference_vector() {
        // (src, dst) -> first frame for 2 source and 3 destination replicas.
        let expected = [
            ((0, 0), 0),
            ((0, 1), 4),
            ((0, 2), 2),
            ((1, 0), 3),
            ((1, 1), 1),
            ((1, 2), 5),
        ];
        for ((s, d), frame) in expected {
            let idx = find_initial_buffer_indices(s, 2, d, 3).unwrap();
            assert_eq!(idx.first_frame, frame, "pair ({s}, {d})");
            assert_eq!(idx.frame_stride, 6);
            assert_eq!(idx.src, (frame as usize - s) / 2);
            assert_eq!(idx.dst, (frame as usize - d) / 3);
        }
    }

    #[test]
    fn non_coprime_reference_vector() {
        // gcd(2, 4) = 2: only pairs with equal parity communicate.
        let expected = [
            ((0, 0), Some((0, 0, 0))),
            ((0, 1), None),
            ((0, 2), Some((1, 0, 2))),
            ((0, 3), None),
            ((1, 0), None),
            ((1, 1), Some((0, 0, 1))),
            ((1, 2), None),
            ((1, 3), Some((1, 0, 3))),
        ];
        for ((s, d), want) in expected {
            let got = find_initial_buffer_indices(s, 2, d, 4).map(|i| (i.src, i.dst, i.first_frame));
            assert_eq!(got, want, "pair ({s}, {d})");
        }
    }

    #[test]
    fn single_replica_on_both_sides() {
        let idx = find_initial_buffer_indices(0, 1, 0, 1).unwrap();
        assert_eq!(
            idx,
            BufferIndices {
                src: 0,
                dst: 0,
                first_frame: 0,
                frame_stride: 1
            }
        );
        assert_eq!(idx.frame(5), 5);
    }

    #[test]
    fn out_of_range_arguments() {
        assert!(find_initial_buffer_indices(2, 2, 0, 3).is_none());
        assert!(find_initial_buffer_indices(0, 0, 0, 3).is_none());
    }

    fn symmetric_crt(s: u64, m: u64, d: u64, n: u64) -> u64 {
        let (m_inv, n_inv) = double_modular_inverse(m, n).unwrap();
        (s * n * n_inv + d * m * m_inv) % (m * n)
    }

    proptest! {
        #[test]
        fn coprime_counts_give_a_bijection(m in 1usize..12, n in 1usize..12) {
            prop_assume!(extended_gcd(m as i64, n as i64).0 == 1);
            let mut frames = HashSet::new();
            let mut src_slots = HashSet::new();
            let mut dst_slots = HashSet::new();
            for s in 0..m {
                for d in 0..n {
                    let idx = find_initial_buffer_indices(s, m, d, n).unwrap();
                    prop_assert!(idx.src < n && idx.dst < m);
                    prop_assert_eq!(idx.first_frame, symmetric_crt(s as u64, m as u64, d as u64, n as u64));
                    prop_assert!(frames.insert(idx.first_frame));
                    // A source replica never reuses an insert index for two
                    // destinations, and vice versa.
                    prop_assert!(src_slots.insert((s, idx.src)));
                    prop_assert!(dst_slots.insert((d, idx.dst)));
                }
            }
            prop_assert_eq!(frames.len(), m * n);
            prop_assert!(frames.iter().all(|&f| f < (m * n) as u64));
        }

        #[test]
        fn reduced_pairing_covers_every_frame_once(m in 1usize..10, n in 1usize..10) {
            let g = extended_gcd(m as i64, n as i64).0 as usize;
            let lcm = m * n / g;
            let mut owner = vec![None; lcm];
            for s in 0..m {
                for d in 0..n {
                    match find_initial_buffer_indices(s, m, d, n) {
                        Some(idx) => {
                            prop_assert_eq!(s % g, d % g);
                            prop_assert_eq!(idx.frame_stride as usize, lcm);
                            let f = idx.first_frame as usize;
                            prop_assert_eq!(f % m, s);
                            prop_assert_eq!(f % n, d);
                            prop_assert!(owner[f].is_none());
                            owner[f] = Some((s, d));
                        }
                        None => prop_assert_ne!(s % g, d % g),
                    }
                }
            }
            prop_assert!(owner.iter().all(Option::is_some));
        }

        #[test]
        fn independent_evaluations_agree(s in 0usize..8, m in 1usize..9, d in 0usize..8, n in 1usize..9) {
            prop_assume!(s < m && d < n);
            prop_assert_eq!(
                find_initial_buffer_indices(s, m, d, n),
                find_initial_buffer_indices(s, m, d, n)
            );
        }
    }
}
