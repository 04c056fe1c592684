//! Reusable barrier over every thread of a task on every process.
//!
//! The first thread to arrive in a phase leads it: it waits for the other
//! local threads, then represents the process in a gather/release round over
//! the transport rooted at the task's lowest rank. Once that round finishes it
//! bumps the generation and wakes everyone. The same barrier serves any number
//! of phases.
//!
//! Every thread of the task must call [`Barrier::synch`] once per phase. A
//! thread that never arrives leaves the others blocked forever.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::config::PollPolicy;
use crate::error::{lock, ConduitError, Result};
use crate::map::RankList;
use crate::transport::{self, Channel, MessageTag, Request, Transport};

use super::TaskId;

struct BarrierState {
    arrived: usize,
    generation: u64,
    /// Process-level arrivals of the current phase, indexed like `ranks`.
    /// Only the root process fills it.
    arrivals: Vec<bool>,
}

pub struct Barrier {
    task: TaskId,
    ranks: RankList,
    threads: usize,
    rank: usize,
    transport: Arc<dyn Transport>,
    poll: PollPolicy,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("task", &self.task)
            .field("ranks", &self.ranks)
            .field("threads", &self.threads)
            .field("rank", &self.rank)
            .finish()
    }
}

impl Barrier {
    pub fn new(
        task: TaskId,
        ranks: RankList,
        threads: usize,
        rank: usize,
        transport: Arc<dyn Transport>,
        poll: PollPolicy,
    ) -> Self {
        let participants = ranks.len();
        Self {
            task,
            ranks,
            threads: threads.max(1),
            rank,
            transport,
            poll,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                arrivals: vec![false; participants],
            }),
            released: Condvar::new(),
        }
    }

    /// Completed phases.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, BarrierState>) -> MutexGuard<'a, BarrierState> {
        self.released
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until every thread of the task on every process has arrived.
    pub fn synch(&self) -> Result<()> {
        if !self.ranks.contains(self.rank) {
            return Err(ConduitError::NotMember {
                task: self.task,
                rank: self.rank,
            });
        }

        let mut state = lock(&self.state);
        let generation = state.generation;
        state.arrived += 1;

        if state.arrived > 1 {
            self.released.notify_all();
            while state.generation == generation {
                state = self.wait(state);
            }
            return Ok(());
        }

        let _span = tracing::debug_span!("barrier", task = %self.task, generation).entered();
        while state.arrived < self.threads {
            state = self.wait(state);
        }
        drop(state);

        let outcome = self.synch_processes(generation);

        let mut state = lock(&self.state);
        state.arrived = 0;
        state.generation += 1;
        self.released.notify_all();
        outcome
    }

    fn synch_processes(&self, generation: u64) -> Result<()> {
        if self.ranks.len() < 2 {
            return Ok(());
        }
        let root = self.ranks.iter().min().unwrap_or(self.rank);
        let arrive = MessageTag::new(self.task.0, Channel::BarrierArrive, generation);
        let release = MessageTag::new(self.task.0, Channel::BarrierRelease, generation);

        if self.rank != root {
            self.transport.isend(root, arrive, Vec::new())?;
            let mut released = self.transport.irecv(root, release)?;
            return transport::wait(released.as_mut(), &self.poll);
        }

        let mut pending: Vec<(usize, Box<dyn Request>)> = Vec::with_capacity(self.ranks.len());
        for (index, peer) in self.ranks.iter().enumerate() {
            if peer == self.rank {
                lock(&self.state).arrivals[index] = true;
            } else {
                pending.push((index, self.transport.irecv(peer, arrive)?));
            }
        }

        self.poll.wait_until(|| {
            let mut still_pending = Vec::with_capacity(pending.len());
            for (index, mut request) in pending.drain(..) {
                if request.test()? {
                    lock(&self.state).arrivals[index] = true;
                } else {
                    still_pending.push((index, request));
                }
            }
            pending = still_pending;
            Ok(lock(&self.state).arrivals.iter().all(|&arrived| arrived))
        })?;
        tracing::trace!(task = %self.task, generation, "all processes arrived");

        for peer in self.ranks.iter().filter(|&peer| peer != self.rank) {
            self.transport.isend(peer, release, Vec::new())?;
        }
        lock(&self.state).arrivals.fill(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalFabric;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn single_process(threads: usize) -> Barrier {
        let fabric = LocalFabric::new(1);
        Barrier::new(
            TaskId(1),
            RankList::contiguous(0, 1),
            threads,
            0,
            Arc::new(fabric.endpoint(0).unwrap()),
            PollPolicy::default(),
        )
    }

    #[test]
    fn single_thread_passes_straight_through() {
        let barrier = single_process(1);
        barrier.synch().unwrap();
        barrier.synch().unwrap();
        assert_eq!(barrier.generation(), 2);
    }

    #[test]
    fn threads_wait_for_each_other() {
        const THREADS: usize = 6;
        let barrier = single_process(THREADS);
        let before = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for phase in 1..=3 {
                        before.fetch_add(1, Ordering::SeqCst);
                        barrier.synch().unwrap();
                        assert!(before.load(Ordering::SeqCst) >= phase * THREADS);
                        barrier.synch().unwrap();
                    }
                });
            }
        });
        assert_eq!(barrier.generation(), 6);
    }

    #[test]
    fn non_member_is_rejected() {
        let fabric = LocalFabric::new(2);
        let barrier = Barrier::new(
            TaskId(2),
            RankList::contiguous(0, 1),
            1,
            1,
            Arc::new(fabric.endpoint(1).unwrap()),
            PollPolicy::default(),
        );
        assert!(matches!(
            barrier.synch(),
            Err(ConduitError::NotMember { rank: 1, .. })
        ));
    }

    #[test]
    fn processes_synchronize_over_fabric() {
        let fabric = LocalFabric::new(3);
        let arrived = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for rank in 0..3 {
                let endpoint = fabric.endpoint(rank).unwrap();
                let arrived = &arrived;
                scope.spawn(move || {
                    let barrier = Barrier::new(
                        TaskId(4),
                        RankList::contiguous(0, 3),
                        1,
                        rank,
                        Arc::new(endpoint),
                        PollPolicy::default(),
                    );
                    for phase in 1..=4 {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        barrier.synch().unwrap();
                        assert!(arrived.load(Ordering::SeqCst) >= phase * 3);
                        barrier.synch().unwrap();
                    }
                });
            }
        });
        assert_eq!(fabric.in_flight(), 0);
    }
}
