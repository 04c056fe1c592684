//! Per-process runtime: the task registry, the local hand-off exchange, and
//! the thread plumbing that runs task bodies.

use std::sync::Arc;

use tracing::{debug, info, info_span};

use crate::config::RuntimeConfig;
use crate::error::{ConduitError, Result};
use crate::map::RankList;
use crate::stats::TransferStats;
use crate::task::identity::{self, Frame, TaskScope};
use crate::task::{Task, TaskId, TaskRegistry, TaskSpec};
use crate::transfer::LocalExchange;
use crate::transport::{LocalFabric, Transport};

/// Everything one process needs to create tasks and conduits.
pub struct ProcessContext {
    rank: usize,
    transport: Arc<dyn Transport>,
    registry: TaskRegistry,
    exchange: Arc<LocalExchange>,
    config: RuntimeConfig,
    stats: Arc<TransferStats>,
    root: Arc<Task>,
}

impl ProcessContext {
    pub fn new(transport: Arc<dyn Transport>, config: RuntimeConfig) -> Result<Self> {
        Self::with_stats(transport, config, Arc::new(TransferStats::new()))
    }

    /// Build the context and its root task, which spans every rank.
    pub fn with_stats(
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
        stats: Arc<TransferStats>,
    ) -> Result<Self> {
        config.validate()?;
        let rank = transport.rank();
        let size = transport.num_ranks();
        let spec = TaskSpec::new("root", RankList::contiguous(0, size))?;
        let root = Arc::new(Task::new(
            TaskId::ROOT,
            None,
            spec,
            rank,
            Arc::clone(&transport),
            config.poll,
        )?);
        let registry = TaskRegistry::new();
        registry.register(Arc::clone(&root))?;
        debug!(rank, size, "process context ready");
        Ok(Self {
            rank,
            transport,
            registry,
            exchange: Arc::new(LocalExchange::new()),
            config,
            stats,
            root,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.transport.num_ranks()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn exchange(&self) -> &Arc<LocalExchange> {
        &self.exchange
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn root(&self) -> &Arc<Task> {
        &self.root
    }

    /// Make the calling thread the root task's main thread.
    pub fn enter_root(&self) -> TaskScope {
        identity::enter(Frame {
            task: TaskId::ROOT,
            parent: None,
            local_rank: 0,
            global_rank: self.rank,
        })
    }

    /// Make the calling thread thread `local_rank` of `task`.
    pub fn enter(&self, task: &Task, local_rank: usize) -> Result<TaskScope> {
        if !task.is_member(self.rank) {
            return Err(ConduitError::NotMember {
                task: task.id(),
                rank: self.rank,
            });
        }
        if local_rank >= task.threads() {
            return Err(ConduitError::invalid_rank_index(local_rank, task.threads()));
        }
        Ok(identity::enter(Frame {
            task: task.id(),
            parent: task.parent(),
            local_rank,
            global_rank: self.rank,
        }))
    }

    /// Task of the calling thread.
    pub fn current_task(&self) -> Result<Arc<Task>> {
        self.registry.get(identity::current_task()?)
    }

    /// Parent of the calling thread's task; `None` for the root task.
    pub fn parent_task(&self) -> Result<Option<Arc<Task>>> {
        identity::parent_task()?
            .map(|id| self.registry.get(id))
            .transpose()
    }

    pub fn local_rank(&self) -> Result<usize> {
        identity::local_rank()
    }

    pub fn global_rank(&self) -> Result<usize> {
        identity::global_rank()
    }

    /// Create a child of the calling thread's task.
    ///
    /// Every process must create the same tasks in the same order, members
    /// or not, so that ids agree.
    pub fn create_task(&self, spec: TaskSpec) -> Result<Arc<Task>> {
        let parent = self.current_task()?;
        if let Some(rank) = spec.ranks.iter().find(|&r| r >= self.num_ranks()) {
            return Err(ConduitError::config(format!(
                "task '{}' names rank {rank} of {}",
                spec.name,
                self.num_ranks()
            )));
        }
        let id = parent.next_child_id()?;
        let task = Arc::new(Task::new(
            id,
            Some(parent.id()),
            spec,
            self.rank,
            Arc::clone(&self.transport),
            self.config.poll,
        )?);
        self.registry.register(Arc::clone(&task))?;
        info!(
            task = %id,
            parent = %parent.id(),
            name = task.name(),
            ranks = task.ranks().len(),
            replicas = task.replicas(),
            "created task"
        );
        Ok(task)
    }

    pub fn retire_task(&self, task: &Task) -> Result<()> {
        self.registry.unregister(task.id()).map(|_| ())
    }

    /// Run `body` on every thread of `task` on this process and collect the
    /// results in local-rank order. Non-members return nothing.
    pub fn run_task<R, F>(&self, task: &Task, body: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(usize) -> Result<R> + Sync,
    {
        if !task.is_member(self.rank) {
            return Ok(Vec::new());
        }
        let _span = info_span!("task", id = %task.id(), name = task.name()).entered();
        std::thread::scope(|scope| {
            let handles = (0..task.threads())
                .map(|local_rank| {
                    let body = &body;
                    std::thread::Builder::new()
                        .name(format!("{}-{}", task.name(), local_rank))
                        .spawn_scoped(scope, move || {
                            let _scope = self.enter(task, local_rank)?;
                            body(local_rank)
                        })
                })
                .collect::<std::io::Result<Vec<_>>>()?;
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

/// Runs several ranks as threads of this process over a [`LocalFabric`].
///
/// A rank whose body fails returns its error, but peers blocked waiting on it
/// stay blocked; bodies should fail before communicating or not at all.
pub struct LocalWorld {
    size: usize,
    config: RuntimeConfig,
    stats: Arc<TransferStats>,
}

impl LocalWorld {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            config: RuntimeConfig::default(),
            stats: Arc::new(TransferStats::new()),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share one set of counters across every rank.
    pub fn with_stats(mut self, stats: Arc<TransferStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// Run `body` once per rank, each inside the root task scope, and
    /// collect the results in rank order.
    pub fn run<R, F>(&self, body: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&ProcessContext) -> Result<R> + Sync,
    {
        if self.size == 0 {
            return Err(ConduitError::config("a local world needs at least one rank"));
        }
        let fabric = LocalFabric::new(self.size);
        let _span = info_span!("local_world", size = self.size).entered();
        std::thread::scope(|scope| {
            let handles = (0..self.size)
                .map(|rank| {
                    let body = &body;
                    let endpoint = fabric.endpoint(rank);
                    let config = self.config.clone();
                    let stats = Arc::clone(&self.stats);
                    std::thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || -> Result<R> {
                            let ctx = ProcessContext::with_stats(Arc::new(endpoint?), config, stats)?;
                            let _root = ctx.enter_root();
                            body(&ctx)
                        })
                })
                .collect::<std::io::Result<Vec<_>>>()?;
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_scope_resolves_to_root_task() {
        let ranks = LocalWorld::new(2)
            .run(|ctx| {
                let task = ctx.current_task()?;
                assert_eq!(task.id(), TaskId::ROOT);
                assert!(ctx.parent_task()?.is_none());
                ctx.global_rank()
            })
            .unwrap();
        assert_eq!(ranks, vec![0, 1]);
    }

    #[test]
    fn child_tasks_get_matching_ids_everywhere() {
        let ids = LocalWorld::new(3)
            .run(|ctx| {
                let a = ctx.create_task(TaskSpec::new("a", RankList::contiguous(0, 2))?)?;
                let b = ctx.create_task(TaskSpec::new("b", RankList::contiguous(2, 1))?)?;
                Ok((a.id(), b.id()))
            })
            .unwrap();
        assert!(ids.iter().all(|&pair| pair == (TaskId(1), TaskId(2))));
    }

    #[test]
    fn task_threads_see_their_own_identity() {
        let results = LocalWorld::new(2)
            .run(|ctx| {
                let task = ctx.create_task(TaskSpec::new("w", RankList::contiguous(1, 1))?.with_threads(3))?;
                ctx.run_task(&task, |local_rank| {
                    assert_eq!(ctx.current_task()?.id(), task.id());
                    assert_eq!(ctx.parent_task()?.map(|t| t.id()), Some(TaskId::ROOT));
                    assert_eq!(ctx.local_rank()?, local_rank);
                    Ok(local_rank)
                })
            })
            .unwrap();
        assert!(results[0].is_empty());
        assert_eq!(results[1], vec![0, 1, 2]);
    }

    #[test]
    fn tasks_outside_the_world_are_rejected() {
        let errors = LocalWorld::new(2)
            .run(|ctx| Ok(ctx.create_task(TaskSpec::new("x", RankList::contiguous(1, 2))?).is_err()))
            .unwrap();
        assert_eq!(errors, vec![true, true]);
    }

    #[test]
    fn no_scope_outside_task_threads() {
        let ctx = ProcessContext::new(
            Arc::new(LocalFabric::new(1).endpoint(0).unwrap()),
            RuntimeConfig::default(),
        )
        .unwrap();
        assert!(matches!(ctx.current_task(), Err(ConduitError::NoTaskScope)));
        let _scope = ctx.enter_root();
        assert_eq!(ctx.current_task().unwrap().id(), TaskId::ROOT);
    }
}
