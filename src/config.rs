//! Runtime configuration shared by every conduit on a process.

use std::time::Duration;

use crate::error::{ConduitError, Result};
use crate::transfer::TransferKind;

/// Upper bound on buffer slots per connection.
///
/// The MPI backend packs the low four bits of the transfer sequence into the
/// wire tag, so no more than 16 transfers per connection may be in flight.
pub const MAX_BUFFER_DEPTH: usize = 16;

/// How blocking waits poll their non-blocking test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Number of `yield_now` rounds before falling back to sleeping.
    pub spin_limit: u32,
    /// Sleep between polls once the spin budget is used up.
    pub sleep: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            spin_limit: 64,
            sleep: Duration::from_micros(50),
        }
    }
}

impl PollPolicy {
    /// Poll `probe` until it reports completion.
    pub fn wait_until(&self, mut probe: impl FnMut() -> Result<bool>) -> Result<()> {
        let mut spins = 0u32;
        loop {
            if probe()? {
                return Ok(());
            }
            if spins < self.spin_limit {
                spins += 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.sleep);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Buffer slots per connection side (multi-buffering depth).
    pub buffer_depth: usize,
    /// Whether data transfers carry a frame sequence number.
    pub sequencing: bool,
    /// Hand-off mode used between threads of one process.
    pub local_transfer: TransferKind,
    pub poll: PollPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_depth: 2,
            sequencing: true,
            local_transfer: TransferKind::Async,
            poll: PollPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_buffer_depth(mut self, depth: usize) -> Self {
        self.buffer_depth = depth;
        self
    }

    pub fn with_sequencing(mut self, sequencing: bool) -> Self {
        self.sequencing = sequencing;
        self
    }

    pub fn with_local_transfer(mut self, kind: TransferKind) -> Self {
        self.local_transfer = kind;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_depth(self.buffer_depth)?;
        if self.local_transfer == TransferKind::None {
            return Err(ConduitError::config(
                "local transfer kind must be sync or async",
            ));
        }
        Ok(())
    }
}

#[track_caller]
pub(crate) fn validate_depth(depth: usize) -> Result<()> {
    if depth == 0 || depth > MAX_BUFFER_DEPTH {
        return Err(ConduitError::config(format!(
            "buffer depth must be in 1..={MAX_BUFFER_DEPTH}, got {depth}"
        )));
    }
    Ok(())
}
