//! Same-address-space hand-off.
//!
//! When both ends of a transfer live in one process the payload never touches
//! the transport. Two slot flavours exist:
//!
//! * [`LocalTransferSlot`] connects threads of *different* tasks. The
//!   sender stages a copy of its buffer. A `Sync` sender then parks until the
//!   receiver acknowledges the copy; an `Async` sender returns immediately.
//! * [`IntraTaskSlot`] connects the source and destination ends of a conduit
//!   whose two tasks are the same task. The inserting thread may well be the
//!   extracting thread, so staging is the only mode and nothing ever blocks.
//!
//! Slots are found through a per-process [`LocalExchange`], so the two ends
//! of a connection rendezvous without holding references to each other.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use bytemuck::Pod;

use crate::error::{lock, ConduitError, Result};

/// How a local hand-off completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferKind {
    /// No local transfer configured.
    None,
    /// Sender waits until the receiver has copied the data.
    Sync,
    /// Sender stages a private copy and returns.
    #[default]
    Async,
}

/// Borrowed bytes a sender offers to a slot.
#[derive(Debug, Clone, Copy)]
pub struct SourceView<'a> {
    bytes: &'a [u8],
}

impl<'a> SourceView<'a> {
    pub fn new<T: Pod>(data: &'a [T]) -> Self {
        Self {
            bytes: bytemuck::cast_slice(data),
        }
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Borrowed buffer a receiver offers to a slot.
#[derive(Debug)]
pub struct DestView<'a> {
    bytes: &'a mut [u8],
}

impl<'a> DestView<'a> {
    pub fn new<T: Pod>(data: &'a mut [T]) -> Self {
        Self {
            bytes: bytemuck::cast_slice_mut(data),
        }
    }

    pub fn from_bytes(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

/// Metadata travelling with a hand-off.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub tag: Vec<u8>,
    pub sequence: u64,
}

fn size_mismatch((expected, actual): (usize, usize)) -> ConduitError {
    ConduitError::SizeMismatch { expected, actual }
}

/// Why a parked `Sync` sender was released without a clean hand-off.
#[derive(Debug, Clone, Copy)]
enum Refusal {
    Mismatch(usize, usize),
    Withdrawn,
}

impl From<Refusal> for ConduitError {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Mismatch(expected, actual) => size_mismatch((expected, actual)),
            Refusal::Withdrawn => ConduitError::Cancelled,
        }
    }
}

struct Staged {
    header: Header,
    bytes: Vec<u8>,
    /// A `Sync` sender is waiting in `send` for the outcome.
    acknowledge: bool,
}

struct SlotState {
    pending: Option<Staged>,
    sender_outcome: Option<std::result::Result<(), Refusal>>,
}

/// Mutex/condvar hand-off between two threads of one process.
///
/// Every transfer is staged as an owned copy. A `Sync` sender then waits for
/// the receiver to acknowledge the copy, or for [`LocalTransferSlot::withdraw`].
pub struct LocalTransferSlot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl Default for LocalTransferSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalTransferSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransferSlot")
            .field("occupied", &!self.is_empty())
            .finish()
    }
}

impl LocalTransferSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                sender_outcome: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, SlotState>) -> MutexGuard<'a, SlotState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand `source` to the receiver.
    ///
    /// Blocks while an earlier transfer still occupies the slot. With
    /// [`TransferKind::Sync`] it also blocks until the receiver has copied the
    /// data. A length disagreement fails both sides with `SizeMismatch`
    /// (an `Async` sender has already returned and only the receiver sees it).
    /// A `Sync` sender whose transfer is withdrawn fails with `Cancelled`.
    pub fn send(&self, source: SourceView<'_>, header: Header, kind: TransferKind) -> Result<()> {
        if kind == TransferKind::None {
            return Err(ConduitError::config(
                "local transfer kind must be sync or async",
            ));
        }

        let mut state = lock(&self.state);
        while state.pending.is_some() || state.sender_outcome.is_some() {
            state = self.wait(state);
        }

        let acknowledge = kind == TransferKind::Sync;
        state.pending = Some(Staged {
            header,
            bytes: source.bytes().to_vec(),
            acknowledge,
        });
        self.changed.notify_all();
        if !acknowledge {
            return Ok(());
        }

        loop {
            if let Some(outcome) = state.sender_outcome.take() {
                self.changed.notify_all();
                return outcome.map_err(ConduitError::from);
            }
            state = self.wait(state);
        }
    }

    /// Receive into `dest`, blocking until a sender arrives.
    pub fn recv(&self, mut dest: DestView<'_>) -> Result<Header> {
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = self.deliver(&mut state, &mut dest) {
                return outcome;
            }
            state = self.wait(state);
        }
    }

    /// Receive into `dest` if a sender has already arrived.
    pub fn try_recv(&self, mut dest: DestView<'_>) -> Result<Option<Header>> {
        let mut state = lock(&self.state);
        self.deliver(&mut state, &mut dest).transpose()
    }

    /// Copy a pending transfer into `dest`. Runs on the receiver's thread.
    fn deliver(&self, state: &mut SlotState, dest: &mut DestView<'_>) -> Option<Result<Header>> {
        let staged = state.pending.take()?;
        let outcome = if staged.bytes.len() == dest.len() {
            dest.bytes_mut().copy_from_slice(&staged.bytes);
            Ok(())
        } else {
            Err(Refusal::Mismatch(dest.len(), staged.bytes.len()))
        };
        if staged.acknowledge {
            state.sender_outcome = Some(outcome);
        }
        self.changed.notify_all();
        Some(
            outcome
                .map(|()| staged.header)
                .map_err(ConduitError::from),
        )
    }

    /// Drop a staged transfer nobody received. Returns whether one was dropped.
    ///
    /// A `Sync` sender waiting on the dropped transfer wakes with `Cancelled`.
    pub fn withdraw(&self) -> bool {
        let mut state = lock(&self.state);
        let Some(staged) = state.pending.take() else {
            return false;
        };
        if staged.acknowledge {
            state.sender_outcome = Some(Err(Refusal::Withdrawn));
        }
        self.changed.notify_all();
        true
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).pending.is_none()
    }
}

/// Staging cell between the two ends of a conduit inside one task.
#[derive(Debug, Default)]
pub struct IntraTaskSlot {
    staged: Mutex<Option<(Header, Vec<u8>)>>,
}

impl IntraTaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, header: Header, bytes: Vec<u8>) -> Result<()> {
        let mut staged = lock(&self.staged);
        if staged.is_some() {
            return Err(ConduitError::InvalidState {
                state: "occupied",
                op: "stage",
            });
        }
        *staged = Some((header, bytes));
        Ok(())
    }

    /// Move the staged transfer into `dest`, if there is one.
    pub fn take_into(&self, mut dest: DestView<'_>) -> Result<Option<Header>> {
        let Some((header, bytes)) = lock(&self.staged).take() else {
            return Ok(None);
        };
        if bytes.len() != dest.len() {
            return Err(size_mismatch((dest.len(), bytes.len())));
        }
        dest.bytes_mut().copy_from_slice(&bytes);
        Ok(Some(header))
    }

    pub fn clear(&self) -> bool {
        lock(&self.staged).take().is_some()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.staged).is_none()
    }
}

/// What a slot carries on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotUse {
    /// Data slot `n` of the connection's buffer ring.
    Data(usize),
    EndOfChunk,
}

/// Identifies a local slot within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub stream: u32,
    pub src_rank: usize,
    pub dst_rank: usize,
    pub slot: SlotUse,
}

/// Per-process directory of live [`LocalTransferSlot`]s.
///
/// A slot is created by whichever end asks first and disappears when both
/// ends have dropped it.
#[derive(Debug, Default)]
pub struct LocalExchange {
    slots: Mutex<HashMap<SlotKey, Weak<LocalTransferSlot>>>,
}

impl LocalExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, key: SlotKey) -> Arc<LocalTransferSlot> {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(&key).and_then(Weak::upgrade) {
            return slot;
        }
        slots.retain(|_, slot| slot.strong_count() > 0);
        let slot = Arc::new(LocalTransferSlot::new());
        slots.insert(key, Arc::downgrade(&slot));
        slot
    }

    /// Slots with at least one live end.
    pub fn live_slots(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn header(sequence: u64) -> Header {
        Header {
            tag: vec![7],
            sequence,
        }
    }

    #[test]
    fn async_send_stages_before_receiver_arrives() {
        let slot = LocalTransferSlot::new();
        let data = [1u32, 2, 3];
        slot.send(SourceView::new(&data), header(4), TransferKind::Async)
            .unwrap();
        assert!(!slot.is_empty());

        let mut out = [0u32; 3];
        let got = slot.try_recv(DestView::new(&mut out)).unwrap();
        assert_eq!(got, Some(header(4)));
        assert_eq!(out, data);
        assert!(slot.is_empty());
    }

    #[test]
    fn try_recv_on_empty_slot() {
        let slot = LocalTransferSlot::new();
        let mut out = [0u8; 2];
        assert_eq!(slot.try_recv(DestView::new(&mut out)).unwrap(), None);
    }

    #[test]
    fn sync_send_waits_for_receiver() {
        let slot = Arc::new(LocalTransferSlot::new());
        let sender = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let data = [9.5f64, -1.0];
                slot.send(SourceView::new(&data), header(1), TransferKind::Sync)
            })
        };
        let mut out = [0f64; 2];
        let got = slot.recv(DestView::new(&mut out)).unwrap();
        assert_eq!(got.sequence, 1);
        assert_eq!(out, [9.5, -1.0]);
        sender.join().unwrap().unwrap();
    }

    #[test]
    fn waiting_receiver_is_served_by_sender() {
        let slot = Arc::new(LocalTransferSlot::new());
        let receiver = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let mut out = [0u16; 4];
                let header = slot.recv(DestView::new(&mut out))?;
                Ok::<_, ConduitError>((header, out))
            })
        };
        let data = [1u16, 2, 3, 4];
        slot.send(SourceView::new(&data), header(2), TransferKind::Sync)
            .unwrap();
        let (got, out) = receiver.join().unwrap().unwrap();
        assert_eq!(got, header(2));
        assert_eq!(out, data);
    }

    #[test]
    fn length_mismatch_fails_both_sides() {
        let slot = Arc::new(LocalTransferSlot::new());
        let sender = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let data = [1u8; 3];
                slot.send(SourceView::new(&data), header(0), TransferKind::Sync)
            })
        };
        let mut out = [0u8; 5];
        let err = slot.recv(DestView::new(&mut out)).unwrap_err();
        assert!(matches!(
            err,
            ConduitError::SizeMismatch {
                expected: 5,
                actual: 3
            }
        ));
        assert!(matches!(
            sender.join().unwrap(),
            Err(ConduitError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn none_kind_is_rejected() {
        let slot = LocalTransferSlot::new();
        let err = slot
            .send(SourceView::from_bytes(&[]), header(0), TransferKind::None)
            .unwrap_err();
        assert!(matches!(err, ConduitError::Config { .. }));
    }

    #[test]
    fn withdraw_drops_staged_copy() {
        let slot = LocalTransferSlot::new();
        slot.send(SourceView::from_bytes(&[1, 2]), header(0), TransferKind::Async)
            .unwrap();
        assert!(slot.withdraw());
        assert!(!slot.withdraw());
        assert!(slot.is_empty());
    }

    #[test]
    fn withdraw_releases_parked_sync_sender() {
        let slot = Arc::new(LocalTransferSlot::new());
        let sender = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let data = [3u32; 4];
                slot.send(SourceView::new(&data), header(6), TransferKind::Sync)
            })
        };
        while slot.is_empty() {
            thread::yield_now();
        }
        assert!(slot.withdraw());
        assert!(matches!(
            sender.join().unwrap(),
            Err(ConduitError::Cancelled)
        ));
        assert!(slot.is_empty());

        // The slot is usable again afterwards.
        slot.send(SourceView::from_bytes(&[8]), header(7), TransferKind::Async)
            .unwrap();
        let mut out = [0u8; 1];
        assert_eq!(slot.try_recv(DestView::new(&mut out)).unwrap(), Some(header(7)));
    }

    #[test]
    fn intra_task_slot_holds_one_transfer() {
        let slot = IntraTaskSlot::new();
        slot.put(header(3), vec![4, 5]).unwrap();
        assert!(matches!(
            slot.put(header(4), vec![6, 7]),
            Err(ConduitError::InvalidState { .. })
        ));
        let mut out = [0u8; 2];
        assert_eq!(slot.take_into(DestView::new(&mut out)).unwrap(), Some(header(3)));
        assert_eq!(out, [4, 5]);
        assert_eq!(slot.take_into(DestView::new(&mut out)).unwrap(), None);
    }

    #[test]
    fn exchange_shares_slot_until_both_ends_drop() {
        let exchange = LocalExchange::new();
        let key = SlotKey {
            stream: 1,
            src_rank: 0,
            dst_rank: 0,
            slot: SlotUse::Data(0),
        };
        let a = exchange.slot(key);
        let b = exchange.slot(key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(exchange.live_slots(), 1);

        let other = exchange.slot(SlotKey {
            slot: SlotUse::EndOfChunk,
            ..key
        });
        assert!(!Arc::ptr_eq(&a, &other));

        drop(a);
        drop(b);
        drop(other);
        assert_eq!(exchange.live_slots(), 0);
    }
}
