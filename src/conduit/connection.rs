use std::sync::Arc;

use crate::correspondence::BufferIndices;

use super::manager::SendManager;
use super::sender::{DataTagSender, EocSender, RouteKind};

/// One (source process, destination process) leg of a conduit, as computed
/// identically on every process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPlan {
    pub src_replica: usize,
    pub dst_replica: usize,
    /// Position of the source process in its replica's rank list.
    pub src_proc: usize,
    pub dst_proc: usize,
    pub src_rank: usize,
    pub dst_rank: usize,
    pub indices: BufferIndices,
    /// Source-local element offsets, in wire order.
    pub src_offsets: Vec<usize>,
    /// Destination-local element offsets, in the same order.
    pub dst_offsets: Vec<usize>,
}

impl ConnectionPlan {
    /// Elements carried per frame.
    pub fn elements(&self) -> usize {
        self.src_offsets.len()
    }

    /// The first process of each source replica signals end of chunk.
    pub fn carries_eoc(&self) -> bool {
        self.src_proc == 0
    }

    /// Transfer index of global `frame` on this connection.
    pub fn transfer_of(&self, frame: u64) -> u64 {
        (frame - self.indices.first_frame) / self.indices.frame_stride
    }
}

/// A connection end owned by a [`super::ConduitSource`] or [`super::ConduitDest`].
pub struct Connection {
    plan: Arc<ConnectionPlan>,
    route: RouteKind,
    depth: usize,
    data: Vec<Arc<SendManager<DataTagSender>>>,
    eoc: Option<SendManager<EocSender>>,
}

impl Connection {
    pub fn new(
        plan: Arc<ConnectionPlan>,
        route: RouteKind,
        data: Vec<Arc<SendManager<DataTagSender>>>,
        eoc: Option<SendManager<EocSender>>,
    ) -> Self {
        Self {
            plan,
            route,
            depth: data.len().max(1),
            data,
            eoc,
        }
    }

    pub fn plan(&self) -> &ConnectionPlan {
        &self.plan
    }

    pub fn route(&self) -> RouteKind {
        self.route
    }

    pub fn is_src_local(&self, rank: usize) -> bool {
        self.plan.src_rank == rank
    }

    pub fn is_dst_local(&self, rank: usize) -> bool {
        self.plan.dst_rank == rank
    }

    /// Source buffer slot used by `transfer`.
    pub fn src_slot(&self, transfer: u64) -> usize {
        (self.plan.indices.src + (transfer % self.depth as u64) as usize) % self.depth
    }

    /// Destination buffer slot used by `transfer`.
    pub fn dst_slot(&self, transfer: u64) -> usize {
        (self.plan.indices.dst + (transfer % self.depth as u64) as usize) % self.depth
    }

    pub fn slot(&self, index: usize) -> &SendManager<DataTagSender> {
        &self.data[index]
    }

    pub fn slots(&self) -> impl Iterator<Item = &SendManager<DataTagSender>> {
        self.data.iter().map(|manager| manager.as_ref())
    }

    pub fn eoc(&self) -> Option<&SendManager<EocSender>> {
        self.eoc.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspondence::find_initial_buffer_indices;

    fn plan(indices: BufferIndices) -> Arc<ConnectionPlan> {
        Arc::new(ConnectionPlan {
            src_replica: 1,
            dst_replica: 0,
            src_proc: 0,
            dst_proc: 2,
            src_rank: 3,
            dst_rank: 6,
            indices,
            src_offsets: vec![0, 1],
            dst_offsets: vec![4, 5],
        })
    }

    #[test]
    fn slots_advance_round_robin_from_initial_indices() {
        // Source replica 1 of 2 feeding destination replica 0 of 3: first
        // shared frame 3, then every 6th frame.
        let indices = find_initial_buffer_indices(1, 2, 0, 3).unwrap();
        let connection = Connection::new(plan(indices), RouteKind::Remote, Vec::new(), None);
        assert_eq!(connection.plan().transfer_of(3), 0);
        assert_eq!(connection.plan().transfer_of(15), 2);

        assert_eq!(connection.src_slot(0), 0);
        assert_eq!(connection.route(), RouteKind::Remote);
        assert!(connection.is_src_local(3));
        assert!(connection.is_dst_local(6));
        assert!(connection.plan().carries_eoc());
        assert_eq!(connection.plan().elements(), 2);
    }
}
