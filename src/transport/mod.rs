//! Point-to-point transport substrate.
//!
//! Conduits and barriers only need non-blocking send/receive keyed by
//! `(peer rank, MessageTag)` plus test and cancel on the returned requests.
//! Implementations: [`fabric::LocalFabric`] (threads standing in for
//! processes) and `mpi::MpiTransport` (feature `distributed`).

pub mod fabric;
#[cfg(feature = "distributed")]
pub mod mpi;

use crate::config::PollPolicy;
use crate::error::Result;

pub use fabric::{FabricEndpoint, LocalFabric};

/// Logical channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Data,
    Tag,
    Sequence,
    EndOfChunk,
    BarrierArrive,
    BarrierRelease,
}

impl Channel {
    fn code(self) -> u32 {
        match self {
            Channel::Data => 0,
            Channel::Tag => 1,
            Channel::Sequence => 2,
            Channel::EndOfChunk => 3,
            Channel::BarrierArrive => 4,
            Channel::BarrierRelease => 5,
        }
    }
}

/// Identifies one message between a pair of ranks.
///
/// `stream` is the conduit id (or task id for barrier traffic). A conduit has
/// at most one connection per (source rank, destination rank) pair, so stream,
/// channel and sequence pin down a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageTag {
    pub stream: u32,
    pub channel: Channel,
    pub sequence: u64,
}

impl MessageTag {
    pub fn new(stream: u32, channel: Channel, sequence: u64) -> Self {
        Self {
            stream,
            channel,
            sequence,
        }
    }

    /// 15-bit tag for transports with a small tag space.
    ///
    /// Keeps 8 folded bits of stream, the channel, and the low 4 bits of
    /// sequence. Messages with equal wire tags between the same ranks are
    /// matched in send order, which is enough while fewer than 16 transfers
    /// per connection are in flight. Folding spreads the task part of a
    /// conduit id over the low byte; two conduits between the same pair of
    /// ranks that still fold to the same byte must not be in flight together.
    pub fn wire_tag(&self) -> i32 {
        let s = self.stream;
        let folded = (s ^ (s >> 8) ^ (s >> 16) ^ (s >> 24)) & 0xFF;
        ((folded << 7) | (self.channel.code() << 4) | (self.sequence & 0xF) as u32) as i32
    }
}

/// An outstanding non-blocking operation.
pub trait Request: Send {
    /// Poll for completion without blocking.
    fn test(&mut self) -> Result<bool>;

    /// Withdraw the operation. A cancelled request tests complete and carries
    /// no payload.
    fn cancel(&mut self);

    /// Received bytes, once a receive has completed.
    fn take_payload(&mut self) -> Option<Vec<u8>>;

    /// Bytes delivered by a completed receive.
    fn byte_count(&self) -> Option<usize>;
}

/// Inter-process transport.
pub trait Transport: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of ranks reachable through the transport.
    fn num_ranks(&self) -> usize;

    /// Start sending `payload` to `dest`.
    fn isend(&self, dest: usize, tag: MessageTag, payload: Vec<u8>) -> Result<Box<dyn Request>>;

    /// Start receiving the message tagged `tag` from `source`.
    fn irecv(&self, source: usize, tag: MessageTag) -> Result<Box<dyn Request>>;
}

/// Block until `request` completes.
pub fn wait(request: &mut dyn Request, poll: &PollPolicy) -> Result<()> {
    poll.wait_until(|| request.test())
}

/// A send that finished before `isend` returned.
#[derive(Debug, Default)]
pub struct CompletedSend;

impl Request for CompletedSend {
    fn test(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn cancel(&mut self) {}

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn byte_count(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tag_fits_fifteen_bits() {
        let tag = MessageTag::new(0xFFFF_FFFF, Channel::BarrierRelease, u64::MAX);
        assert!(tag.wire_tag() <= 0x7FFF);
        assert!(tag.wire_tag() >= 0);
    }

    #[test]
    fn wire_tag_separates_channels() {
        let data = MessageTag::new(3, Channel::Data, 9).wire_tag();
        let tag = MessageTag::new(3, Channel::Tag, 9).wire_tag();
        let eoc = MessageTag::new(3, Channel::EndOfChunk, 9).wire_tag();
        assert_ne!(data, tag);
        assert_ne!(tag, eoc);
    }

    #[test]
    fn wire_tag_separates_first_conduits_of_sibling_tasks() {
        // Conduit 0 of tasks 1 and 2.
        let a = MessageTag::new(4096, Channel::Data, 0).wire_tag();
        let b = MessageTag::new(2 * 4096, Channel::Data, 0).wire_tag();
        assert_ne!(a, b);
    }
}
