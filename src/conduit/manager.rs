//! Completion state machine around a [`Sender`].
//!
//! A manager guards one buffer slot of one connection end. Most slots are used
//! by a single party and release after one `release`. When the source and
//! destination of a connection are the same task on the same process, both
//! ends share the manager and it waits for two releases.
//!
//! ```text
//!            send (count 2)                recv
//!   Idle ───────────────────► WaitingForRecv ───┐
//!    │  recv (count 2)                          ▼
//!    ├──────────────────────► WaitingForSend ─► InProgress ─► Complete ─► Idle
//!    │  send / recv (count 1)                   ▲   test          release(s)
//!    └──────────────────────────────────────────┘
//! ```
//!
//! The lock is held only around non-blocking sender calls; blocking waits poll
//! [`SendManager::test_complete`].

use crate::config::PollPolicy;
use crate::error::{lock, ConduitError, Result};

use super::sender::{Direction, Sender};

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    WaitingForSend,
    WaitingForRecv,
    InProgress,
    Complete,
}

impl SlotState {
    pub fn name(self) -> &'static str {
        match self {
            SlotState::Idle => "idle",
            SlotState::WaitingForSend => "waiting for send",
            SlotState::WaitingForRecv => "waiting for receive",
            SlotState::InProgress => "in progress",
            SlotState::Complete => "complete",
        }
    }
}

/// Party giving up its hold on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Releaser {
    Sender,
    Receiver,
}

impl Releaser {
    fn index(self) -> usize {
        match self {
            Releaser::Sender => 0,
            Releaser::Receiver => 1,
        }
    }
}

struct Inner<S> {
    state: SlotState,
    sender: S,
    transfer: Option<u64>,
    released: [bool; 2],
    cancelled: bool,
}

impl<S> Inner<S> {
    fn reset(&mut self) {
        self.state = SlotState::Idle;
        self.transfer = None;
        self.released = [false; 2];
        self.cancelled = false;
    }
}

pub struct SendManager<S: Sender> {
    release_count: u8,
    inner: Mutex<Inner<S>>,
}

impl<S: Sender> SendManager<S> {
    /// `release_count` is 2 for a slot shared by both ends, 1 otherwise.
    pub fn new(sender: S, release_count: u8) -> Self {
        Self {
            release_count: release_count.clamp(1, 2),
            inner: Mutex::new(Inner {
                state: SlotState::Idle,
                sender,
                transfer: None,
                released: [false; 2],
                cancelled: false,
            }),
        }
    }

    pub fn release_count(&self) -> u8 {
        self.release_count
    }

    pub fn state(&self) -> SlotState {
        lock(&self.inner).state
    }

    pub fn is_idle(&self) -> bool {
        self.state() == SlotState::Idle
    }

    /// Transfer index the slot is working on.
    pub fn transfer(&self) -> Option<u64> {
        lock(&self.inner).transfer
    }

    /// Start sending `item` as transfer `transfer`.
    pub fn send(&self, transfer: u64, item: S::Item) -> Result<()> {
        let mut inner = lock(&self.inner);
        let next = match inner.state {
            SlotState::Idle if self.release_count == 1 => SlotState::InProgress,
            SlotState::Idle => SlotState::WaitingForRecv,
            SlotState::WaitingForSend if inner.transfer == Some(transfer) => SlotState::InProgress,
            state => {
                return Err(ConduitError::InvalidState {
                    state: state.name(),
                    op: "send",
                })
            }
        };
        inner.sender.begin_comm(Direction::Send, transfer, Some(item))?;
        if inner.state == SlotState::Idle {
            inner.released = [false; 2];
            inner.cancelled = false;
        }
        inner.state = next;
        inner.transfer = Some(transfer);
        Ok(())
    }

    /// Start receiving transfer `transfer`.
    pub fn recv(&self, transfer: u64) -> Result<()> {
        let mut inner = lock(&self.inner);
        let next = match inner.state {
            SlotState::Idle if self.release_count == 1 => SlotState::InProgress,
            SlotState::Idle => SlotState::WaitingForSend,
            SlotState::WaitingForRecv if inner.transfer == Some(transfer) => SlotState::InProgress,
            state => {
                return Err(ConduitError::InvalidState {
                    state: state.name(),
                    op: "receive",
                })
            }
        };
        inner.sender.begin_comm(Direction::Recv, transfer, None)?;
        if inner.state == SlotState::Idle {
            inner.released = [false; 2];
            inner.cancelled = false;
        }
        inner.state = next;
        inner.transfer = Some(transfer);
        Ok(())
    }

    /// Poll the sender; `true` once the transfer is complete.
    pub fn test_complete(&self) -> Result<bool> {
        let mut inner = lock(&self.inner);
        match inner.state {
            SlotState::Complete => Ok(true),
            SlotState::InProgress => {
                if inner.sender.test_comm_complete()? {
                    inner.state = SlotState::Complete;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            SlotState::WaitingForSend | SlotState::WaitingForRecv => Ok(false),
            SlotState::Idle => Err(ConduitError::InvalidState {
                state: SlotState::Idle.name(),
                op: "test",
            }),
        }
    }

    pub fn wait_complete(&self, poll: &PollPolicy) -> Result<()> {
        poll.wait_until(|| self.test_complete())
    }

    /// Whether the sending party is finished with its buffer.
    ///
    /// On a shared slot the send side is done as soon as the data is handed
    /// over; the receive side completes the transfer later.
    pub fn sender_done(&self) -> Result<bool> {
        if self.release_count == 1 {
            return self.test_complete();
        }
        Ok(matches!(
            self.state(),
            SlotState::WaitingForRecv | SlotState::InProgress | SlotState::Complete
        ))
    }

    /// Abandon the transfer. The slot still has to be released.
    pub fn cancel(&self) {
        let mut inner = lock(&self.inner);
        match inner.state {
            SlotState::Idle | SlotState::Complete => {}
            state => {
                tracing::warn!(state = state.name(), transfer = ?inner.transfer, "cancelling transfer");
                inner.sender.cancel_comm();
                inner.cancelled = true;
                inner.state = SlotState::Complete;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner).cancelled
    }

    /// Give up `who`'s hold on the slot.
    ///
    /// Releasing twice is harmless. The slot returns to `Idle` once every
    /// expected party has released a completed transfer, or after a single
    /// release of a cancelled one.
    pub fn release(&self, who: Releaser) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state == SlotState::Idle || inner.released[who.index()] {
            return Ok(());
        }

        let own_half_done = self.release_count == 2
            && who == Releaser::Sender
            && matches!(inner.state, SlotState::WaitingForRecv | SlotState::InProgress);
        if inner.state != SlotState::Complete && !own_half_done {
            return Err(ConduitError::InvalidState {
                state: inner.state.name(),
                op: "release",
            });
        }

        inner.released[who.index()] = true;
        let released = inner.released.iter().filter(|&&r| r).count() as u8;
        if inner.cancelled || (inner.state == SlotState::Complete && released >= self.release_count)
        {
            inner.reset();
        }
        Ok(())
    }

    /// Run `f` against the wrapped sender.
    pub fn with_sender<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.inner).sender)
    }

    /// Take what a completed receive delivered.
    pub fn take_item(&self) -> Option<S::Item> {
        lock(&self.inner).sender.take_item()
    }
}
