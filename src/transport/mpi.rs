//! MPI transport.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//!
//! # Usage
//!
//! The caller must initialize MPI with multi-threaded support before
//! constructing `MpiTransport`, since task threads issue requests
//! concurrently:
//!
//! ```ignore
//! let (universe, _) = mpi::initialize_with_threading(mpi::Threading::Multiple)
//!     .expect("MPI init failed");
//! let transport = MpiTransport::new();
//! ```
//!
//! # Requests
//!
//! `isend` never blocks the caller. Each message is handed, with its owned
//! payload, to a short-lived send thread that performs a standard-mode send and
//! reports completion over a channel; the returned request tests that channel.
//! A large message therefore waits for its matching receive on the send thread,
//! while the caller keeps polling its own receives. Receives poll with a
//! matched probe, so no receive buffer has to outlive the call that posted it.
//!
//! Cancelling a send detaches it. MPI cannot withdraw a send that has already
//! been started, so the send thread still finishes once the peer matches.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use tracing::trace;

use crate::error::{ConduitError, Result};

use super::{MessageTag, Request, Transport};

/// MPI world communicator as a conduit transport.
pub struct MpiTransport;

impl MpiTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MpiTransport {
    fn rank(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.rank() as usize
    }

    fn num_ranks(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.size() as usize
    }

    fn isend(&self, dest: usize, tag: MessageTag, payload: Vec<u8>) -> Result<Box<dyn Request>> {
        let (done, completion) = mpsc::sync_channel(1);
        let wire_tag = tag.wire_tag();
        let bytes = payload.len();
        thread::Builder::new()
            .name(format!("mpi-send-{dest}"))
            .spawn(move || {
                let world = SimpleCommunicator::world();
                world
                    .process_at_rank(dest as i32)
                    .send_with_tag(&payload[..], wire_tag);
                if done.send(()).is_err() {
                    trace!(dest, tag = wire_tag, bytes, "send matched after its request was dropped");
                }
            })?;
        Ok(Box::new(MpiSend {
            completion: Some(completion),
        }))
    }

    fn irecv(&self, source: usize, tag: MessageTag) -> Result<Box<dyn Request>> {
        Ok(Box::new(MpiRecv {
            source: source as i32,
            tag: tag.wire_tag(),
            payload: None,
            delivered: None,
            finished: false,
        }))
    }
}

/// Send running on its own thread; complete once that thread reports back.
struct MpiSend {
    completion: Option<Receiver<()>>,
}

impl Request for MpiSend {
    fn test(&mut self) -> Result<bool> {
        let Some(completion) = &self.completion else {
            return Ok(true);
        };
        match completion.try_recv() {
            Ok(()) => {
                self.completion = None;
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => {
                self.completion = None;
                Err(ConduitError::Transport(
                    "send thread exited without completing".into(),
                ))
            }
        }
    }

    fn cancel(&mut self) {
        self.completion = None;
    }

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn byte_count(&self) -> Option<usize> {
        None
    }
}

struct MpiRecv {
    source: i32,
    tag: i32,
    payload: Option<Vec<u8>>,
    delivered: Option<usize>,
    finished: bool,
}

impl Request for MpiRecv {
    fn test(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        let world = SimpleCommunicator::world();
        let process = world.process_at_rank(self.source);
        if let Some((message, _status)) = process.immediate_matched_probe_with_tag(self.tag) {
            let (bytes, _status) = message.matched_receive_vec::<u8>();
            self.delivered = Some(bytes.len());
            self.payload = Some(bytes);
            self.finished = true;
        }
        Ok(self.finished)
    }

    fn cancel(&mut self) {
        // Nothing is posted until the probe matches, so there is nothing to
        // withdraw on the MPI side.
        self.finished = true;
    }

    fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.payload.take()
    }

    fn byte_count(&self) -> Option<usize> {
        self.delivered
    }
}
