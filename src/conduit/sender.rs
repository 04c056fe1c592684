//! Per-connection protocol objects.
//!
//! A [`DataTagSender`] moves one frame's payload, its tag and (optionally) its
//! sequence number. An [`EocSender`] moves the end-of-chunk marker. Both ride
//! the connection's [`Route`]: the transport between processes, a
//! [`LocalTransferSlot`] between tasks of one process, or an
//! [`IntraTaskSlot`] within one task.

use std::sync::Arc;

use crate::error::{ConduitError, Result};
use crate::transfer::{DestView, Header, IntraTaskSlot, LocalTransferSlot, SourceView, TransferKind};
use crate::transport::{Channel, MessageTag, Request, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Begin/test/cancel protocol driven by a [`super::manager::SendManager`].
pub trait Sender: Send {
    type Item;

    /// Issue the non-blocking operations for `transfer`. `item` is the
    /// outgoing value when sending.
    fn begin_comm(&mut self, direction: Direction, transfer: u64, item: Option<Self::Item>) -> Result<()>;

    /// Poll every outstanding operation without blocking.
    fn test_comm_complete(&mut self) -> Result<bool>;

    /// Withdraw outstanding operations. Harmless when nothing is outstanding.
    fn cancel_comm(&mut self);

    /// Received value, once a receive has completed.
    fn take_item(&mut self) -> Option<Self::Item>;
}

/// How a connection end reaches its peer.
#[derive(Clone)]
pub enum Route {
    Remote {
        transport: Arc<dyn Transport>,
        peer: usize,
    },
    LocalThread {
        slot: Arc<LocalTransferSlot>,
        kind: TransferKind,
    },
    IntraTask {
        slot: Arc<IntraTaskSlot>,
    },
}

/// Route without its endpoint, for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Remote,
    LocalThread,
    IntraTask,
}

impl RouteKind {
    pub fn name(self) -> &'static str {
        match self {
            RouteKind::Remote => "remote",
            RouteKind::LocalThread => "local",
            RouteKind::IntraTask => "intra-task",
        }
    }
}

impl Route {
    pub fn kind(&self) -> RouteKind {
        match self {
            Route::Remote { .. } => RouteKind::Remote,
            Route::LocalThread { .. } => RouteKind::LocalThread,
            Route::IntraTask { .. } => RouteKind::IntraTask,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Remote { peer, .. } => write!(f, "Remote({peer})"),
            Route::LocalThread { kind, .. } => write!(f, "LocalThread({kind:?})"),
            Route::IntraTask { .. } => f.write_str("IntraTask"),
        }
    }
}

/// One frame on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: Option<u64>,
    pub tag: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Data,
    Tag,
    Sequence,
}

impl Part {
    fn channel(self) -> Channel {
        match self {
            Part::Data => Channel::Data,
            Part::Tag => Channel::Tag,
            Part::Sequence => Channel::Sequence,
        }
    }
}

#[derive(Debug, Default)]
struct Received {
    data: Option<Vec<u8>>,
    tag: Option<Vec<u8>>,
    sequence: Option<u64>,
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ConduitError::Decode(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_le_bytes(raw))
}

pub struct DataTagSender {
    stream: u32,
    route: Route,
    sequencing: bool,
    data_len: usize,
    tag_len: usize,
    requests: Vec<(Part, Box<dyn Request>)>,
    received: Received,
    complete: bool,
}

impl DataTagSender {
    /// `data_len` and `tag_len` are the byte sizes both ends agree on.
    pub fn new(stream: u32, route: Route, sequencing: bool, data_len: usize, tag_len: usize) -> Self {
        Self {
            stream,
            route,
            sequencing,
            data_len,
            tag_len,
            requests: Vec::new(),
            received: Received::default(),
            complete: false,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    fn parts(&self) -> impl Iterator<Item = Part> {
        let data = (self.data_len > 0).then_some(Part::Data);
        let sequence = self.sequencing.then_some(Part::Sequence);
        data.into_iter().chain([Part::Tag]).chain(sequence)
    }

    fn begin_remote_send(&mut self, transport: &Arc<dyn Transport>, peer: usize, transfer: u64, packet: Packet) -> Result<()> {
        let Packet {
            sequence,
            tag,
            mut data,
        } = packet;
        let mut tag = Some(tag);
        for part in self.parts().collect::<Vec<_>>() {
            let payload = match part {
                Part::Data => std::mem::take(&mut data),
                Part::Tag => tag.take().unwrap_or_default(),
                Part::Sequence => sequence.unwrap_or(0).to_le_bytes().to_vec(),
            };
            let message = MessageTag::new(self.stream, part.channel(), transfer);
            self.requests.push((part, transport.isend(peer, message, payload)?));
        }
        Ok(())
    }

    fn begin_remote_recv(&mut self, transport: &Arc<dyn Transport>, peer: usize, transfer: u64) -> Result<()> {
        for part in self.parts().collect::<Vec<_>>() {
            let message = MessageTag::new(self.stream, part.channel(), transfer);
            self.requests.push((part, transport.irecv(peer, message)?));
        }
        Ok(())
    }

    fn store(&mut self, part: Part, payload: Vec<u8>) -> Result<()> {
        match part {
            Part::Data => {
                if payload.len() != self.data_len {
                    return Err(ConduitError::SizeMismatch {
                        expected: self.data_len,
                        actual: payload.len(),
                    });
                }
                self.received.data = Some(payload);
            }
            Part::Tag => self.received.tag = Some(payload),
            Part::Sequence => self.received.sequence = Some(decode_u64(&payload)?),
        }
        Ok(())
    }

    /// Poll remote requests, keeping only `only` when given.
    fn poll_remote(&mut self, only: Option<Part>) -> Result<()> {
        let mut pending = Vec::with_capacity(self.requests.len());
        for (part, mut request) in std::mem::take(&mut self.requests) {
            if only.is_some_and(|wanted| wanted != part) || !request.test()? {
                pending.push((part, request));
                continue;
            }
            if let Some(payload) = request.take_payload() {
                self.store(part, payload)?;
            }
        }
        self.requests = pending;
        Ok(())
    }

    fn poll_local(&mut self) -> Result<()> {
        let mut buffer = vec![0u8; self.data_len];
        let header = match &self.route {
            Route::LocalThread { slot, .. } => slot.try_recv(DestView::from_bytes(&mut buffer))?,
            Route::IntraTask { slot } => slot.take_into(DestView::from_bytes(&mut buffer))?,
            Route::Remote { .. } => None,
        };
        if let Some(header) = header {
            self.received = Received {
                data: Some(buffer),
                sequence: self.sequencing.then_some(header.sequence),
                tag: Some(header.tag),
            };
            self.complete = true;
        }
        Ok(())
    }

    /// Poll just far enough to learn the tag. `true` once it has arrived.
    pub fn poll_tag(&mut self) -> Result<bool> {
        if self.received.tag.is_none() {
            match self.route {
                Route::Remote { .. } => self.poll_remote(Some(Part::Tag))?,
                _ => {
                    self.test_comm_complete()?;
                }
            }
        }
        Ok(self.received.tag.is_some())
    }

    pub fn received_tag(&self) -> Option<&[u8]> {
        self.received.tag.as_deref()
    }
}

impl Sender for DataTagSender {
    type Item = Packet;

    fn begin_comm(&mut self, direction: Direction, transfer: u64, item: Option<Packet>) -> Result<()> {
        self.requests.clear();
        self.complete = false;

        match (direction, self.route.clone()) {
            (Direction::Send, route) => {
                let packet = item.ok_or(ConduitError::InvalidState {
                    state: "empty",
                    op: "send",
                })?;
                if packet.data.len() != self.data_len || packet.tag.len() != self.tag_len {
                    return Err(ConduitError::SizeMismatch {
                        expected: self.data_len + self.tag_len,
                        actual: packet.data.len() + packet.tag.len(),
                    });
                }
                match route {
                    Route::Remote { transport, peer } => {
                        self.begin_remote_send(&transport, peer, transfer, packet)?;
                    }
                    Route::LocalThread { slot, kind } => {
                        let header = Header {
                            tag: packet.tag,
                            sequence: packet.sequence.unwrap_or(0),
                        };
                        slot.send(SourceView::from_bytes(&packet.data), header, kind)?;
                        self.complete = true;
                    }
                    Route::IntraTask { slot } => {
                        let header = Header {
                            tag: packet.tag,
                            sequence: packet.sequence.unwrap_or(0),
                        };
                        slot.put(header, packet.data)?;
                    }
                }
            }
            (Direction::Recv, route) => {
                self.received = Received::default();
                if let Route::Remote { transport, peer } = route {
                    self.begin_remote_recv(&transport, peer, transfer)?;
                }
            }
        }
        Ok(())
    }

    fn test_comm_complete(&mut self) -> Result<bool> {
        if self.complete {
            return Ok(true);
        }
        match self.route {
            Route::Remote { .. } => {
                self.poll_remote(None)?;
                self.complete = self.requests.is_empty();
            }
            Route::LocalThread { .. } | Route::IntraTask { .. } => self.poll_local()?,
        }
        Ok(self.complete)
    }

    fn cancel_comm(&mut self) {
        for (_, request) in &mut self.requests {
            request.cancel();
        }
        self.requests.clear();
        match &self.route {
            Route::LocalThread { slot, .. } => {
                slot.withdraw();
            }
            Route::IntraTask { slot } => {
                slot.clear();
            }
            Route::Remote { .. } => {}
        }
        self.complete = false;
    }

    fn take_item(&mut self) -> Option<Packet> {
        let received = std::mem::take(&mut self.received);
        let tag = received.tag?;
        Some(Packet {
            sequence: received.sequence,
            tag,
            data: received.data.unwrap_or_default(),
        })
    }
}

/// Carries the count of frames a source replica inserted before ending its chunk.
pub struct EocSender {
    stream: u32,
    route: Route,
    request: Option<Box<dyn Request>>,
    count: Option<u64>,
    complete: bool,
}

impl EocSender {
    pub fn new(stream: u32, route: Route) -> Self {
        Self {
            stream,
            route,
            request: None,
            count: None,
            complete: false,
        }
    }

    fn message(&self) -> MessageTag {
        MessageTag::new(self.stream, Channel::EndOfChunk, 0)
    }
}

impl Sender for EocSender {
    type Item = u64;

    fn begin_comm(&mut self, direction: Direction, _transfer: u64, item: Option<u64>) -> Result<()> {
        self.request = None;
        self.complete = false;
        match direction {
            Direction::Send => {
                let count = item.ok_or(ConduitError::InvalidState {
                    state: "empty",
                    op: "signal end of chunk",
                })?;
                let header = Header {
                    tag: Vec::new(),
                    sequence: count,
                };
                match &self.route {
                    Route::Remote { transport, peer } => {
                        let request = transport.isend(*peer, self.message(), count.to_le_bytes().to_vec())?;
                        self.request = Some(request);
                    }
                    Route::LocalThread { slot, .. } => {
                        slot.send(SourceView::from_bytes(&[]), header, TransferKind::Async)?;
                        self.complete = true;
                    }
                    Route::IntraTask { slot } => {
                        slot.put(header, Vec::new())?;
                        self.complete = true;
                    }
                }
            }
            Direction::Recv => {
                self.count = None;
                if let Route::Remote { transport, peer } = &self.route {
                    self.request = Some(transport.irecv(*peer, self.message())?);
                }
            }
        }
        Ok(())
    }

    fn test_comm_complete(&mut self) -> Result<bool> {
        if self.complete {
            return Ok(true);
        }
        match &self.route {
            Route::Remote { .. } => {
                if let Some(request) = self.request.as_mut() {
                    if request.test()? {
                        if let Some(payload) = request.take_payload() {
                            self.count = Some(decode_u64(&payload)?);
                        }
                        self.request = None;
                        self.complete = true;
                    }
                }
            }
            Route::LocalThread { slot, .. } => {
                if let Some(header) = slot.try_recv(DestView::from_bytes(&mut []))? {
                    self.count = Some(header.sequence);
                    self.complete = true;
                }
            }
            Route::IntraTask { slot } => {
                if let Some(header) = slot.take_into(DestView::from_bytes(&mut []))? {
                    self.count = Some(header.sequence);
                    self.complete = true;
                }
            }
        }
        Ok(self.complete)
    }

    fn cancel_comm(&mut self) {
        if let Some(mut request) = self.request.take() {
            request.cancel();
        }
        self.complete = false;
    }

    fn take_item(&mut self) -> Option<u64> {
        self.count.take()
    }
}
