//! In-process transport where each rank is a thread.
//!
//! Messages are parked in a shared mailbox keyed by
//! `(source, destination, MessageTag)`. Sends are buffered and complete
//! immediately; a receive completes once its message is in the mailbox.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::{lock, ConduitError, Result};

use super::{CompletedSend, MessageTag, Request, Transport};

type Key = (usize, usize, MessageTag);

#[derive(Debug)]
struct Mailbox {
    size: usize,
    messages: Mutex<HashMap<Key, VecDeque<Vec<u8>>>>,
}

/// A set of connected in-process ranks.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    mailbox: Arc<Mailbox>,
}

impl LocalFabric {
    pub fn new(size: usize) -> Self {
        Self {
            mailbox: Arc::new(Mailbox {
                size,
                messages: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.mailbox.size
    }

    pub fn endpoint(&self, rank: usize) -> Result<FabricEndpoint> {
        if rank >= self.mailbox.size {
            return Err(ConduitError::Transport(format!(
                "rank {rank} outside fabric of {} ranks",
                self.mailbox.size
            )));
        }
        Ok(FabricEndpoint {
            rank,
            mailbox: Arc::clone(&self.mailbox),
        })
    }

    /// Messages sent but not yet received.
    pub fn in_flight(&self) -> usize {
        lock(&self.mailbox.messages).values().map(VecDeque::len).sum()
    }
}

/// One rank's view of a [`LocalFabric`].
#[derive(Debug, Clone)]
pub struct FabricEndpoint {
    rank: usize,
    mailbox: Arc<Mailbox>,
}

impl FabricEndpoint {
    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.mailbox.size {
            return Err(ConduitError::Transport(format!(
                "peer rank {peer} outside fabric of {} ranks",
                self.mailbox.size
            )));
        }
        Ok(())
    }
}

impl Transport for FabricEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.mailbox.size
    }

    fn isend(&self, dest: usize, tag: MessageTag, payload: Vec<u8>) -> Result<Box<dyn Request>> {
        self.check_peer(dest)?;
        lock(&self.mailbox.messages)
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(payload);
        Ok(Box::new(CompletedSend))
    }

    fn irecv(&self, source: usize, tag: MessageTag) -> Result<Box<dyn Request>> {
        self.check_peer(source)?;
        Ok(Box::new(FabricRecv {
            mailbox: Arc::clone(&self.mailbox),
            key: (source, self.rank, tag),
            payload: None,
            delivered: None,
            finished: false,
        }))
    }
}

struct FabricRecv {
    mailbox: Arc<Mailbox>,
    key: Key,
    payload: Option<Vec<u8>>,
    delivered: Option<usize>,
    finished: bool,
}

impl Request for FabricRecv {
    fn test(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        let mut messages = lock(&self.mailbox.messages);
        if let Some(queue) = messages.get_mut(&self.key) {
            if let Some(bytes) = queue.pop_front() {
                if queue.is_empty() {
                    messages.remove(&self.key);
                }
                self.delivered = Some(bytes.len());
                self.payload = Some(bytes);
                self.finished = true;
            }
        }
        Ok(self.finished)
    }

    fn cancel(&mut self) {
        self.finished = true;
    }

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.payload.take()
    }

    fn byte_count(&self) -> Option<usize> {
        self.delivered
    }
}
