//! Conduits: typed streams of array frames from one task to another.
//!
//! A conduit moves a sequence of frames, each a whole N-dimensional array
//! plus a small tag, from a source task to a destination task whose data
//! layouts may differ. Source replica `s` (of `m`) produces frames
//! `s, s + m, s + 2m, ...`; destination replica `d` (of `n`) consumes frames
//! `d, d + n, d + 2n, ...`. Each process keeps one [`connection::Connection`]
//! per peer it exchanges data with, and each connection rotates through a
//! ring of buffer slots so that several frames can be in flight at once.
//!
//! ```text
//!   ConduitSource::insert          ConduitDest::extract
//!        │ gather per connection        ▲ scatter per connection
//!        ▼                              │
//!   SendManager ─ DataTagSender ═══ route ═══ DataTagSender ─ SendManager
//! ```

pub mod connection;
pub mod manager;
pub mod plan;
pub mod sender;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::{debug, error, info, trace, warn};

use crate::config::{validate_depth, PollPolicy};
use crate::error::{ConduitError, Result};
use crate::layout::LocalBlock;
use crate::runtime::ProcessContext;
use crate::stats::TransferStats;
use crate::task::{identity, Task, TaskId};
use crate::transfer::{IntraTaskSlot, LocalExchange, LocalTransferSlot, SlotKey, SlotUse, TransferKind};
use crate::transport::Transport;

use connection::{Connection, ConnectionPlan};
use manager::{Releaser, SendManager, SlotState};
use sender::{DataTagSender, Direction, EocSender, Packet, Route, RouteKind};

/// Per-conduit options, defaulted from the process [`crate::config::RuntimeConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConduitSettings {
    pub depth: usize,
    pub sequencing: bool,
    pub end_of_chunk: bool,
    pub local_transfer: TransferKind,
    pub transpose: bool,
}

pub struct ConduitBuilder<'a, T, Tag> {
    src: &'a Arc<Task>,
    dst: &'a Arc<Task>,
    shape: Vec<usize>,
    transpose: bool,
    depth: Option<usize>,
    sequencing: Option<bool>,
    end_of_chunk: bool,
    local_transfer: Option<TransferKind>,
    _marker: PhantomData<fn(T, Tag)>,
}

impl<'a, T: Pod, Tag: Pod> ConduitBuilder<'a, T, Tag> {
    /// Swap the first two axes on the way: source element `[i][j]` lands at
    /// destination element `[j][i]`.
    pub fn transpose(mut self, transpose: bool) -> Self {
        self.transpose = transpose;
        self
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn sequencing(mut self, sequencing: bool) -> Self {
        self.sequencing = Some(sequencing);
        self
    }

    /// Let the source announce the end of its stream.
    pub fn end_of_chunk(mut self, end_of_chunk: bool) -> Self {
        self.end_of_chunk = end_of_chunk;
        self
    }

    pub fn local_transfer(mut self, kind: TransferKind) -> Self {
        self.local_transfer = Some(kind);
        self
    }

    /// Create the conduit on this process.
    ///
    /// Must be called from the same task scope, in the same order, on every
    /// process so that conduit ids agree.
    pub fn build(self, ctx: &ProcessContext) -> Result<Conduit<T, Tag>> {
        let config = ctx.config();
        let settings = ConduitSettings {
            depth: self.depth.unwrap_or(config.buffer_depth),
            sequencing: self.sequencing.unwrap_or(config.sequencing),
            end_of_chunk: self.end_of_chunk,
            local_transfer: self.local_transfer.unwrap_or(config.local_transfer),
            transpose: self.transpose,
        };
        validate_depth(settings.depth)?;
        if settings.local_transfer == TransferKind::None {
            return Err(ConduitError::config("local transfer kind must be sync or async"));
        }
        if size_of::<T>() == 0 {
            return Err(ConduitError::config("conduit elements must not be zero-sized"));
        }

        let owner = ctx.current_task()?;
        let id = owner.next_conduit_id()?;
        let rank = ctx.rank();
        let plans: Vec<Arc<ConnectionPlan>> =
            plan::plan_connections(self.src, self.dst, &self.shape, self.transpose, rank)?
                .into_iter()
                .map(Arc::new)
                .collect();

        let mut conduit = Conduit {
            id,
            src: Arc::clone(self.src),
            dst: Arc::clone(self.dst),
            dst_shape: plan::destination_shape(&self.shape, self.transpose),
            shape: self.shape,
            settings,
            rank,
            transport: Arc::clone(ctx.transport()),
            exchange: Arc::clone(ctx.exchange()),
            stats: Arc::clone(ctx.stats()),
            poll: config.poll,
            plans,
            local_slots: Vec::new(),
            shared: HashMap::new(),
            _marker: PhantomData,
        };
        conduit.bind_local_slots();

        info!(
            conduit = id,
            src = %conduit.src.id(),
            dst = %conduit.dst.id(),
            shape = ?conduit.shape,
            connections = conduit.plans.len(),
            local_slots = conduit.local_slots.len(),
            depth = settings.depth,
            "built conduit"
        );
        Ok(conduit)
    }
}

/// Slots both ends of an intra-task connection operate on.
struct SharedLink {
    data: Vec<Arc<SendManager<DataTagSender>>>,
    eoc: Arc<IntraTaskSlot>,
}

/// A conduit as seen from one process. Hand out its ends with
/// [`Conduit::source`] and [`Conduit::dest`].
pub struct Conduit<T, Tag = ()> {
    id: u32,
    src: Arc<Task>,
    dst: Arc<Task>,
    shape: Vec<usize>,
    dst_shape: Vec<usize>,
    settings: ConduitSettings,
    rank: usize,
    transport: Arc<dyn Transport>,
    exchange: Arc<LocalExchange>,
    stats: Arc<TransferStats>,
    poll: PollPolicy,
    plans: Vec<Arc<ConnectionPlan>>,
    /// Keeps this conduit's local hand-off slots alive until both ends exist.
    local_slots: Vec<Arc<LocalTransferSlot>>,
    shared: HashMap<usize, SharedLink>,
    _marker: PhantomData<fn(T, Tag)>,
}

impl<T: Pod, Tag: Pod> Conduit<T, Tag> {
    pub fn builder<'a>(src: &'a Arc<Task>, dst: &'a Arc<Task>, shape: &[usize]) -> ConduitBuilder<'a, T, Tag> {
        ConduitBuilder {
            src,
            dst,
            shape: shape.to_vec(),
            transpose: false,
            depth: None,
            sequencing: None,
            end_of_chunk: false,
            local_transfer: None,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dest_shape(&self) -> &[usize] {
        &self.dst_shape
    }

    pub fn settings(&self) -> &ConduitSettings {
        &self.settings
    }

    /// Connections this process takes part in.
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionPlan> {
        self.plans.iter().map(|plan| plan.as_ref())
    }

    fn is_intra_task(&self, plan: &ConnectionPlan) -> bool {
        plan.src_rank == plan.dst_rank && self.src.id() == self.dst.id()
    }

    fn bind_local_slots(&mut self) {
        let depth = self.settings.depth;
        let data_len = |plan: &ConnectionPlan| plan.elements() * size_of::<T>();
        for (index, plan) in self.plans.iter().enumerate() {
            if plan.src_rank != plan.dst_rank {
                continue;
            }
            if self.is_intra_task(plan) {
                let data = (0..depth)
                    .map(|_| {
                        let route = Route::IntraTask {
                            slot: Arc::new(IntraTaskSlot::new()),
                        };
                        let sender = DataTagSender::new(
                            self.id,
                            route,
                            self.settings.sequencing,
                            data_len(plan),
                            size_of::<Tag>(),
                        );
                        Arc::new(SendManager::new(sender, 2))
                    })
                    .collect();
                self.shared.insert(
                    index,
                    SharedLink {
                        data,
                        eoc: Arc::new(IntraTaskSlot::new()),
                    },
                );
                continue;
            }
            let uses = (0..depth)
                .map(SlotUse::Data)
                .chain((self.settings.end_of_chunk && plan.carries_eoc()).then_some(SlotUse::EndOfChunk));
            for slot in uses {
                let key = SlotKey {
                    stream: self.id,
                    src_rank: plan.src_rank,
                    dst_rank: plan.dst_rank,
                    slot,
                };
                self.local_slots.push(self.exchange.slot(key));
            }
        }
    }

    fn route(&self, plan: &ConnectionPlan, direction: Direction, slot: SlotUse) -> Route {
        if plan.src_rank != plan.dst_rank {
            let peer = match direction {
                Direction::Send => plan.dst_rank,
                Direction::Recv => plan.src_rank,
            };
            return Route::Remote {
                transport: Arc::clone(&self.transport),
                peer,
            };
        }
        let key = SlotKey {
            stream: self.id,
            src_rank: plan.src_rank,
            dst_rank: plan.dst_rank,
            slot,
        };
        Route::LocalThread {
            slot: self.exchange.slot(key),
            kind: self.settings.local_transfer,
        }
    }

    fn connection(&self, index: usize, plan: &Arc<ConnectionPlan>, direction: Direction) -> Connection {
        let depth = self.settings.depth;
        let eoc_needed = self.settings.end_of_chunk && plan.carries_eoc();

        if let Some(link) = self.shared.get(&index) {
            let eoc = eoc_needed.then(|| {
                let route = Route::IntraTask {
                    slot: Arc::clone(&link.eoc),
                };
                SendManager::new(EocSender::new(self.id, route), 1)
            });
            return Connection::new(Arc::clone(plan), RouteKind::IntraTask, link.data.clone(), eoc);
        }

        // A destination slot talks to the source slot used by the same transfers.
        let shift = (plan.indices.src % depth + depth - plan.indices.dst % depth) % depth;
        let data = (0..depth)
            .map(|k| {
                let ring = match direction {
                    Direction::Send => k,
                    Direction::Recv => (k + shift) % depth,
                };
                let sender = DataTagSender::new(
                    self.id,
                    self.route(plan, direction, SlotUse::Data(ring)),
                    self.settings.sequencing,
                    plan.elements() * size_of::<T>(),
                    size_of::<Tag>(),
                );
                Arc::new(SendManager::new(sender, 1))
            })
            .collect::<Vec<_>>();
        let eoc = eoc_needed.then(|| {
            let route = self.route(plan, direction, SlotUse::EndOfChunk);
            SendManager::new(EocSender::new(self.id, route), 1)
        });
        let kind = if plan.src_rank == plan.dst_rank {
            RouteKind::LocalThread
        } else {
            RouteKind::Remote
        };
        Connection::new(Arc::clone(plan), kind, data, eoc)
    }

    /// The sending end for this process. Fails on processes outside the
    /// source task.
    pub fn source(&self) -> Result<ConduitSource<T, Tag>> {
        let replica = self.src.replica_of(self.rank).ok_or(ConduitError::NotMember {
            task: self.src.id(),
            rank: self.rank,
        })?;
        let block = LocalBlock::new(self.src.map(replica)?, &self.shape, self.rank)?;
        let connections: Vec<Connection> = self
            .plans
            .iter()
            .enumerate()
            .filter(|(_, plan)| plan.src_rank == self.rank)
            .map(|(index, plan)| self.connection(index, plan, Direction::Send))
            .collect();
        debug!(conduit = self.id, replica, connections = connections.len(), elements = block.len(), "opened source");
        Ok(ConduitSource {
            id: self.id,
            task: self.src.id(),
            replica,
            src_replicas: self.src.replicas(),
            dst_replicas: self.dst.replicas(),
            block,
            connections,
            inserted: 0,
            ended: false,
            sequencing: self.settings.sequencing,
            poll: self.poll,
            stats: Arc::clone(&self.stats),
            _marker: PhantomData,
        })
    }

    /// The receiving end for this process. Fails on processes outside the
    /// destination task.
    pub fn dest(&self) -> Result<ConduitDest<T, Tag>> {
        let replica = self.dst.replica_of(self.rank).ok_or(ConduitError::NotMember {
            task: self.dst.id(),
            rank: self.rank,
        })?;
        let block = LocalBlock::new(self.dst.map(replica)?, &self.dst_shape, self.rank)?;
        let connections: Vec<Connection> = self
            .plans
            .iter()
            .enumerate()
            .filter(|(_, plan)| plan.dst_rank == self.rank)
            .map(|(index, plan)| self.connection(index, plan, Direction::Recv))
            .collect();
        debug!(conduit = self.id, replica, connections = connections.len(), elements = block.len(), "opened destination");
        Ok(ConduitDest {
            id: self.id,
            task: self.dst.id(),
            replica,
            src_replicas: self.src.replicas(),
            dst_replicas: self.dst.replicas(),
            block,
            connections,
            extracted: 0,
            end_of_chunk: self.settings.end_of_chunk,
            eoc_counts: vec![None; self.src.replicas()],
            done: false,
            poll: self.poll,
            stats: Arc::clone(&self.stats),
            _marker: PhantomData,
        })
    }
}

fn check_caller(expected: TaskId) -> Result<()> {
    let actual = identity::current_task()?;
    if actual != expected {
        return Err(ConduitError::WrongTask { expected, actual });
    }
    Ok(())
}

fn gather<T: Pod>(data: &[T], offsets: &[usize]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(offsets.len() * size_of::<T>());
    for &offset in offsets {
        bytes.extend_from_slice(bytemuck::bytes_of(&data[offset]));
    }
    bytes
}

fn scatter<T: Pod>(bytes: &[u8], offsets: &[usize], out: &mut [T]) {
    for (chunk, &offset) in bytes.chunks_exact(size_of::<T>()).zip(offsets) {
        out[offset] = bytemuck::pod_read_unaligned(chunk);
    }
}

/// Sends still owned by one [`ConduitSource::insert_nb`] call.
#[derive(Debug)]
#[must_use = "an insert is not finished until its handle completes"]
pub struct InsertHandle {
    frame: u64,
    /// (connection, slot, transfer)
    pending: Vec<(usize, usize, u64)>,
}

impl InsertHandle {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The sending end of a conduit on one process.
pub struct ConduitSource<T, Tag = ()> {
    id: u32,
    task: TaskId,
    replica: usize,
    src_replicas: usize,
    dst_replicas: usize,
    block: LocalBlock,
    connections: Vec<Connection>,
    inserted: u64,
    ended: bool,
    sequencing: bool,
    poll: PollPolicy,
    stats: Arc<TransferStats>,
    _marker: PhantomData<fn(T, Tag)>,
}

impl<T: Pod, Tag: Pod> ConduitSource<T, Tag> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Local part of the source array this process supplies.
    pub fn block(&self) -> &LocalBlock {
        &self.block
    }

    /// Elements every insert must supply.
    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    pub fn frames_inserted(&self) -> u64 {
        self.inserted
    }

    /// Global number of the next frame this process inserts.
    pub fn next_frame(&self) -> u64 {
        self.replica as u64 + self.inserted * self.src_replicas as u64
    }

    /// Insert one frame and wait until its buffers may be reused.
    pub fn insert(&mut self, data: &[T], tag: Tag) -> Result<()> {
        let mut handle = self.insert_nb(data, tag)?;
        self.wait(&mut handle)
    }

    /// Start inserting one frame. `data` is this process's local block in
    /// row-major order; it is copied before the call returns.
    pub fn insert_nb(&mut self, data: &[T], tag: Tag) -> Result<InsertHandle> {
        check_caller(self.task)?;
        if self.ended {
            return Err(ConduitError::EndOfChunk(self.id));
        }
        if data.len() != self.block.len() {
            return Err(ConduitError::SizeMismatch {
                expected: self.block.len() * size_of::<T>(),
                actual: data.len() * size_of::<T>(),
            });
        }

        let frame = self.next_frame();
        let dst_replica = (frame % self.dst_replicas as u64) as usize;
        let tag = bytemuck::bytes_of(&tag).to_vec();
        let mut pending = Vec::new();
        for (index, connection) in self.connections.iter().enumerate() {
            let plan = connection.plan();
            if plan.dst_replica != dst_replica {
                continue;
            }
            let transfer = plan.transfer_of(frame);
            let slot = connection.src_slot(transfer);
            let manager = connection.slot(slot);
            self.reclaim(manager)?;

            let packet = Packet {
                sequence: self.sequencing.then_some(frame),
                tag: tag.clone(),
                data: gather(data, &plan.src_offsets),
            };
            let bytes = packet.data.len();
            manager.send(transfer, packet)?;
            self.stats.record_send(connection.route(), bytes);
            pending.push((index, slot, transfer));
        }

        self.inserted += 1;
        self.stats.frame_inserted();
        trace!(conduit = self.id, frame, connections = pending.len(), "inserted frame");
        Ok(InsertHandle { frame, pending })
    }

    /// Wait until `manager` can take a new send, releasing the one it holds.
    fn reclaim(&self, manager: &SendManager<DataTagSender>) -> Result<()> {
        self.poll.wait_until(|| match manager.state() {
            SlotState::Idle | SlotState::WaitingForSend => Ok(true),
            _ => {
                if manager.sender_done()? {
                    manager.release(Releaser::Sender)?;
                }
                Ok(matches!(manager.state(), SlotState::Idle | SlotState::WaitingForSend))
            }
        })
    }

    /// Poll the sends of `handle`; `true` once every buffer is free.
    pub fn test_comm_complete(&self, handle: &mut InsertHandle) -> Result<bool> {
        let mut still = Vec::with_capacity(handle.pending.len());
        for (index, slot, transfer) in handle.pending.drain(..) {
            let manager = self.connections[index].slot(slot);
            // A later insert may already have reclaimed the slot.
            if manager.transfer() != Some(transfer) {
                continue;
            }
            if manager.sender_done()? {
                manager.release(Releaser::Sender)?;
            } else {
                still.push((index, slot, transfer));
            }
        }
        handle.pending = still;
        Ok(handle.pending.is_empty())
    }

    pub fn wait(&self, handle: &mut InsertHandle) -> Result<()> {
        self.poll.wait_until(|| self.test_comm_complete(handle))
    }

    /// Tell every destination process that this replica inserts no more
    /// frames. Further inserts fail with [`ConduitError::EndOfChunk`].
    pub fn end_chunk(&mut self) -> Result<()> {
        check_caller(self.task)?;
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        for connection in &self.connections {
            if let Some(eoc) = connection.eoc() {
                eoc.send(0, self.inserted)?;
                eoc.wait_complete(&self.poll)?;
                eoc.release(Releaser::Sender)?;
            }
        }
        info!(conduit = self.id, replica = self.replica, frames = self.inserted, "end of chunk");
        Ok(())
    }
}

/// What [`ConduitDest::extract`] delivered besides the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extracted<Tag> {
    pub tag: Tag,
    /// Sequence number carried by the frame, when sequencing is on.
    pub sequence: Option<u64>,
    /// Frame number this extract expected.
    pub frame: u64,
}

/// The receiving end of a conduit on one process.
pub struct ConduitDest<T, Tag = ()> {
    id: u32,
    task: TaskId,
    replica: usize,
    src_replicas: usize,
    dst_replicas: usize,
    block: LocalBlock,
    connections: Vec<Connection>,
    extracted: u64,
    end_of_chunk: bool,
    /// Frames each source replica announced at end of chunk.
    eoc_counts: Vec<Option<u64>>,
    done: bool,
    poll: PollPolicy,
    stats: Arc<TransferStats>,
    _marker: PhantomData<fn(T, Tag)>,
}

impl<T: Pod, Tag: Pod> ConduitDest<T, Tag> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Local part of the destination array this process receives.
    pub fn block(&self) -> &LocalBlock {
        &self.block
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    pub fn frames_extracted(&self) -> u64 {
        self.extracted
    }

    /// Global number of the next frame this process extracts.
    pub fn next_frame(&self) -> u64 {
        self.replica as u64 + self.extracted * self.dst_replicas as u64
    }

    fn check(&self, out: &[T]) -> Result<()> {
        check_caller(self.task)?;
        if out.len() != self.block.len() {
            return Err(ConduitError::SizeMismatch {
                expected: self.block.len() * size_of::<T>(),
                actual: out.len() * size_of::<T>(),
            });
        }
        if self.done {
            return Err(ConduitError::EndOfChunk(self.id));
        }
        Ok(())
    }

    /// Block until the next frame has arrived and copy it into `out`.
    ///
    /// Returns [`ConduitError::EndOfChunk`] once the source has ended its
    /// stream before this frame.
    pub fn extract(&mut self, out: &mut [T]) -> Result<Extracted<Tag>> {
        self.check(out)?;
        let poll = self.poll;
        let mut result = None;
        poll.wait_until(|| {
            result = self.try_extract(out)?;
            Ok(result.is_some())
        })?;
        result.ok_or(ConduitError::InvalidState {
            state: "empty",
            op: "extract",
        })
    }

    /// Extract the next frame if it has fully arrived.
    pub fn try_extract(&mut self, out: &mut [T]) -> Result<Option<Extracted<Tag>>> {
        self.check(out)?;
        let frame = self.next_frame();
        if self.poll_frame(frame)? {
            return self.finish(frame, out).map(Some);
        }
        if self.probe_done(frame)? {
            self.mark_done();
            return Err(ConduitError::EndOfChunk(self.id));
        }
        Ok(None)
    }

    /// Tag of the next frame, as soon as any connection has delivered it.
    pub fn peek_tag(&mut self) -> Result<Option<Tag>> {
        check_caller(self.task)?;
        let frame = self.next_frame();
        self.post(frame)?;
        let src_replica = (frame % self.src_replicas as u64) as usize;
        for connection in &self.connections {
            let plan = connection.plan();
            if plan.src_replica != src_replica {
                continue;
            }
            let transfer = plan.transfer_of(frame);
            let manager = connection.slot(connection.dst_slot(transfer));
            if manager.transfer() != Some(transfer)
                || !matches!(manager.state(), SlotState::InProgress | SlotState::Complete)
            {
                continue;
            }
            let tag = manager.with_sender(|sender| -> Result<Option<Vec<u8>>> {
                Ok(if sender.poll_tag()? {
                    sender.received_tag().map(<[u8]>::to_vec)
                } else {
                    None
                })
            })?;
            if let Some(bytes) = tag {
                return decode_tag(&bytes).map(Some);
            }
        }
        Ok(None)
    }

    /// Block until the tag of the next frame is known.
    ///
    /// The frame itself stays in place for a following [`extract`](Self::extract).
    /// Returns [`ConduitError::EndOfChunk`] if the source ended its stream first.
    pub fn wait_for_tag(&mut self) -> Result<Tag> {
        check_caller(self.task)?;
        if self.done {
            return Err(ConduitError::EndOfChunk(self.id));
        }
        let poll = self.poll;
        let mut tag = None;
        poll.wait_until(|| {
            tag = self.peek_tag()?;
            if tag.is_none() && self.probe_done(self.next_frame())? {
                self.mark_done();
                return Err(ConduitError::EndOfChunk(self.id));
            }
            Ok(tag.is_some())
        })?;
        tag.ok_or(ConduitError::InvalidState {
            state: "empty",
            op: "wait for tag",
        })
    }

    /// Whether the source has ended its stream before the next frame.
    pub fn is_done(&mut self) -> Result<bool> {
        if !self.done && self.probe_done(self.next_frame())? {
            self.mark_done();
        }
        Ok(self.done)
    }

    /// Post receives for `frame` on every connection that is free for it.
    fn post(&self, frame: u64) -> Result<()> {
        let src_replica = (frame % self.src_replicas as u64) as usize;
        for connection in &self.connections {
            let plan = connection.plan();
            if plan.src_replica != src_replica {
                continue;
            }
            let transfer = plan.transfer_of(frame);
            let manager = connection.slot(connection.dst_slot(transfer));
            match manager.state() {
                SlotState::Idle => manager.recv(transfer)?,
                SlotState::WaitingForRecv if manager.transfer() == Some(transfer) => {
                    manager.recv(transfer)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Post and poll `frame`; `true` once every connection has delivered it.
    fn poll_frame(&self, frame: u64) -> Result<bool> {
        self.post(frame)?;
        let src_replica = (frame % self.src_replicas as u64) as usize;
        let mut ready = true;
        for connection in &self.connections {
            let plan = connection.plan();
            if plan.src_replica != src_replica {
                continue;
            }
            let transfer = plan.transfer_of(frame);
            let manager = connection.slot(connection.dst_slot(transfer));
            if manager.transfer() != Some(transfer)
                || manager.state() == SlotState::WaitingForRecv
                || !manager.test_complete()?
            {
                ready = false;
            }
        }
        Ok(ready)
    }

    /// Copy a fully arrived frame out and release its slots.
    fn finish(&mut self, frame: u64, out: &mut [T]) -> Result<Extracted<Tag>> {
        let src_replica = (frame % self.src_replicas as u64) as usize;
        let mut tag: Option<Vec<u8>> = None;
        let mut sequence = None;
        let mut failure = None;

        for connection in &self.connections {
            let plan = connection.plan();
            if plan.src_replica != src_replica {
                continue;
            }
            let transfer = plan.transfer_of(frame);
            let manager = connection.slot(connection.dst_slot(transfer));
            let packet = manager.take_item();
            manager.release(Releaser::Receiver)?;
            let Some(packet) = packet else {
                failure.get_or_insert(ConduitError::InvalidState {
                    state: "empty",
                    op: "extract",
                });
                continue;
            };

            scatter(&packet.data, &plan.dst_offsets, out);
            self.stats.record_recv(packet.data.len());
            if let Some(received) = packet.sequence {
                if received != frame {
                    failure.get_or_insert(ConduitError::OutOfSequence {
                        conduit: self.id,
                        expected: frame,
                        received,
                    });
                }
                sequence = Some(received);
            }
            if tag.is_none() {
                tag = Some(packet.tag);
            } else if tag.as_ref() != Some(&packet.tag) {
                failure.get_or_insert(ConduitError::TagMismatch {
                    conduit: self.id,
                    frame,
                });
            }
        }
        self.extracted += 1;

        if let Some(err) = failure {
            if matches!(err, ConduitError::OutOfSequence { .. }) {
                self.stats.sequence_error();
            }
            error!(conduit = self.id, frame, %err, "bad frame");
            return Err(err);
        }
        self.stats.frame_extracted();
        trace!(conduit = self.id, frame, "extracted frame");

        let tag = tag.ok_or(ConduitError::InvalidState {
            state: "empty",
            op: "extract",
        })?;
        Ok(Extracted {
            tag: decode_tag(&tag)?,
            sequence,
            frame,
        })
    }

    /// Whether the source replica owning `frame` ended before it.
    fn probe_done(&mut self, frame: u64) -> Result<bool> {
        if !self.end_of_chunk {
            return Ok(false);
        }
        let src_replica = (frame % self.src_replicas as u64) as usize;
        if self.eoc_counts[src_replica].is_none() {
            let carrier = self
                .connections
                .iter()
                .filter(|c| c.plan().src_replica == src_replica)
                .find_map(Connection::eoc);
            if let Some(eoc) = carrier {
                if eoc.is_idle() {
                    eoc.recv(0)?;
                }
                if eoc.test_complete()? {
                    self.eoc_counts[src_replica] = eoc.take_item();
                    eoc.release(Releaser::Receiver)?;
                }
            }
        }
        let index = (frame - src_replica as u64) / self.src_replicas as u64;
        Ok(self.eoc_counts[src_replica].is_some_and(|count| count <= index))
    }

    fn mark_done(&mut self) {
        self.done = true;
        let cancelled = self.cancel_pending();
        info!(conduit = self.id, frames = self.extracted, cancelled, "destination reached end of chunk");
    }
}

impl<T, Tag> ConduitDest<T, Tag> {
    /// Withdraw receives this end has posted but not completed.
    fn cancel_pending(&self) -> u64 {
        let mut cancelled = 0;
        for connection in &self.connections {
            for manager in connection.slots() {
                if matches!(manager.state(), SlotState::InProgress | SlotState::WaitingForSend) {
                    manager.cancel();
                    if let Err(err) = manager.release(Releaser::Receiver) {
                        warn!(conduit = self.id, %err, "releasing a cancelled receive failed");
                    }
                    cancelled += 1;
                }
            }
            if let Some(eoc) = connection.eoc() {
                if eoc.state() == SlotState::InProgress {
                    eoc.cancel();
                    if let Err(err) = eoc.release(Releaser::Receiver) {
                        warn!(conduit = self.id, %err, "releasing a cancelled end-of-chunk receive failed");
                    }
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            self.stats.cancelled(cancelled);
        }
        cancelled
    }
}

impl<T, Tag> Drop for ConduitDest<T, Tag> {
    fn drop(&mut self) {
        let cancelled = self.cancel_pending();
        if cancelled > 0 {
            debug!(conduit = self.id, cancelled, "dropped destination with receives pending");
        }
    }
}

fn decode_tag<Tag: Pod>(bytes: &[u8]) -> Result<Tag> {
    if bytes.len() != size_of::<Tag>() {
        return Err(ConduitError::SizeMismatch {
            expected: size_of::<Tag>(),
            actual: bytes.len(),
        });
    }
    Ok(bytemuck::pod_read_unaligned(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::map::{Dist, Grid, RankList};
    use crate::runtime::LocalWorld;
    use crate::task::TaskSpec;

    #[test]
    fn gather_and_scatter_follow_offsets() {
        let data = [10u32, 11, 12, 13];
        let bytes = gather(&data, &[3, 0]);
        let mut out = [0u32; 3];
        scatter(&bytes, &[1, 2], &mut out);
        assert_eq!(out, [0, 13, 10]);
    }

    #[test]
    fn tag_size_is_checked() {
        assert!(decode_tag::<u32>(&[1, 2]).is_err());
        assert_eq!(decode_tag::<u16>(&[1, 0]).unwrap(), 1);
    }

    #[test]
    fn intra_task_round_trip_on_one_thread() {
        let out = LocalWorld::new(1)
            .run(|ctx| {
                let root = Arc::clone(ctx.root());
                let conduit = Conduit::<f64, u32>::builder(&root, &root, &[3]).depth(2).build(ctx)?;
                let mut source = conduit.source()?;
                let mut dest = conduit.dest()?;
                let mut seen = Vec::new();
                for frame in 0..4u32 {
                    source.insert(&[frame as f64, 1.0, 2.0], frame + 100)?;
                    let mut out = [0.0; 3];
                    let got = dest.extract(&mut out)?;
                    seen.push((got.tag, got.sequence, out[0]));
                }
                Ok(seen)
            })
            .unwrap();
        assert_eq!(
            out[0],
            vec![
                (100, Some(0), 0.0),
                (101, Some(1), 1.0),
                (102, Some(2), 2.0),
                (103, Some(3), 3.0)
            ]
        );
    }

    #[test]
    fn views_check_membership_and_caller() {
        LocalWorld::new(2)
            .run(|ctx| {
                let spec = TaskSpec::new("half", RankList::contiguous(0, 1))?
                    .with_layout(Grid::new(vec![1])?, vec![Dist::block()]);
                let half = ctx.create_task(spec)?;
                let conduit = Conduit::<u8>::builder(&half, &half, &[4]).build(ctx)?;
                if ctx.rank() == 1 {
                    assert!(matches!(conduit.source(), Err(ConduitError::NotMember { .. })));
                    return Ok(());
                }
                // The root thread is not a thread of `half`.
                let mut source = conduit.source()?;
                assert!(matches!(
                    source.insert(&[0; 4], ()),
                    Err(ConduitError::WrongTask { .. })
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn settings_default_from_runtime_config() {
        LocalWorld::new(1)
            .with_config(RuntimeConfig::default().with_buffer_depth(3).with_sequencing(false))
            .run(|ctx| {
                let root = Arc::clone(ctx.root());
                let conduit = Conduit::<u16>::builder(&root, &root, &[2]).build(ctx)?;
                assert_eq!(conduit.settings().depth, 3);
                assert!(!conduit.settings().sequencing);
                assert!(Conduit::<u16>::builder(&root, &root, &[2]).depth(0).build(ctx).is_err());
                Ok(())
            })
            .unwrap();
    }
}
