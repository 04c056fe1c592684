//! Tasks: groups of threads on a set of processes running one parallel scope.
//!
//! Every process builds the same `Task` objects in the same order, so ids and
//! maps agree everywhere without communication. A task's ranks may be split
//! into several replicas, each holding a complete copy of the task's data
//! laid out by a map of the same shape.

pub mod barrier;
pub mod identity;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::PollPolicy;
use crate::error::{lock, ConduitError, Result};
use crate::map::{spec::MapSpec, Dist, Grid, Map, RankList};
use crate::transport::Transport;

pub use barrier::Barrier;
pub use identity::{Frame, TaskScope};

/// Child tasks a single task may create.
pub const MAX_CHILD_TASKS: u32 = 64;
/// Conduits a single task may create.
pub const MAX_TASK_CONDUITS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl TaskId {
    pub const ROOT: TaskId = TaskId(0);
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out identifiers in a fixed per-owner range.
///
/// Ids are `base * radix + offset + n` for the n-th call. Two dealers with
/// different bases never overlap, and every process dealing in the same order
/// gets the same ids.
#[derive(Debug)]
pub struct Dealer {
    base: u32,
    radix: u32,
    offset: u32,
    next: AtomicU32,
}

impl Dealer {
    pub fn new(base: u32, radix: u32, offset: u32) -> Self {
        Self {
            base,
            radix,
            offset,
            next: AtomicU32::new(0),
        }
    }

    pub fn deal(&self) -> Result<u32> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        if n >= self.radix {
            return Err(ConduitError::config(format!(
                "dealer for {} exhausted after {} ids",
                self.base, self.radix
            )));
        }
        self.base
            .checked_mul(self.radix)
            .and_then(|first| first.checked_add(self.offset + n))
            .ok_or_else(|| ConduitError::config(format!("id space exhausted below {}", self.base)))
    }

    /// Ids handed out so far.
    pub fn dealt(&self) -> u32 {
        self.next.load(Ordering::Relaxed).min(self.radix)
    }
}

/// Description of a task to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub ranks: RankList,
    pub replicas: usize,
    pub grid: Grid,
    pub dists: Vec<Dist>,
    pub threads: usize,
}

impl TaskSpec {
    /// One replica, one thread per process, one-dimensional BLOCK layout.
    pub fn new(name: impl Into<String>, ranks: RankList) -> Result<Self> {
        let grid = Grid::new(vec![ranks.len()])?;
        Ok(Self {
            name: name.into(),
            ranks,
            replicas: 1,
            grid,
            dists: vec![Dist::block()],
            threads: 1,
        })
    }

    /// Ranks `start..` sized to hold `replicas` copies of the layout in `spec`.
    pub fn from_map_spec(
        name: impl Into<String>,
        start: usize,
        spec: &MapSpec,
        replicas: usize,
    ) -> Self {
        Self {
            name: name.into(),
            ranks: RankList::contiguous(start, spec.procs() * replicas),
            replicas,
            grid: spec.grid.clone(),
            dists: spec.dists.clone(),
            threads: 1,
        }
    }

    pub fn with_layout(mut self, grid: Grid, dists: Vec<Dist>) -> Self {
        self.grid = grid;
        self.dists = dists;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// A task as seen from one process.
pub struct Task {
    id: TaskId,
    parent: Option<TaskId>,
    name: String,
    ranks: RankList,
    maps: Vec<Map>,
    threads: usize,
    barrier: Barrier,
    conduit_ids: Dealer,
    child_ids: Dealer,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("name", &self.name)
            .field("ranks", &self.ranks)
            .field("replicas", &self.maps.len())
            .field("threads", &self.threads)
            .finish()
    }
}

impl Task {
    /// Build task `id` as seen from process `rank`.
    pub fn new(
        id: TaskId,
        parent: Option<TaskId>,
        spec: TaskSpec,
        rank: usize,
        transport: Arc<dyn Transport>,
        poll: PollPolicy,
    ) -> Result<Self> {
        if spec.threads == 0 {
            return Err(ConduitError::config(format!(
                "task '{}' needs at least one thread",
                spec.name
            )));
        }
        let maps = spec
            .ranks
            .split(spec.replicas)?
            .into_iter()
            .map(|group| Map::new(group, spec.grid.clone(), spec.dists.clone()))
            .collect::<Result<Vec<_>>>()?;

        let barrier = Barrier::new(
            id,
            spec.ranks.clone(),
            spec.threads,
            rank,
            transport,
            poll,
        );
        Ok(Self {
            id,
            parent,
            name: spec.name,
            ranks: spec.ranks,
            maps,
            threads: spec.threads,
            barrier,
            conduit_ids: Dealer::new(id.0, MAX_TASK_CONDUITS, 0),
            child_ids: Dealer::new(id.0, MAX_CHILD_TASKS, 1),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All ranks of the task, replicas in order.
    pub fn ranks(&self) -> &RankList {
        &self.ranks
    }

    pub fn replicas(&self) -> usize {
        self.maps.len()
    }

    #[track_caller]
    pub fn map(&self, replica: usize) -> Result<&Map> {
        self.maps
            .get(replica)
            .ok_or_else(|| ConduitError::invalid_rank_index(replica, self.maps.len()))
    }

    pub fn maps(&self) -> &[Map] {
        &self.maps
    }

    /// Replica holding `rank`.
    pub fn replica_of(&self, rank: usize) -> Option<usize> {
        self.maps.iter().position(|map| map.ranks().contains(rank))
    }

    pub fn is_member(&self, rank: usize) -> bool {
        self.ranks.contains(rank)
    }

    /// Threads of the task on each member process.
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    pub fn next_conduit_id(&self) -> Result<u32> {
        self.conduit_ids.deal()
    }

    pub fn next_child_id(&self) -> Result<TaskId> {
        self.child_ids.deal().map(TaskId)
    }
}

/// The tasks known to one process.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: Arc<Task>) -> Result<()> {
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(&task.id()) {
            return Err(ConduitError::config(format!(
                "task {} is already registered",
                task.id()
            )));
        }
        tracing::debug!(task = %task.id(), name = task.name(), "registered task");
        tasks.insert(task.id(), task);
        Ok(())
    }

    pub fn unregister(&self, id: TaskId) -> Result<Arc<Task>> {
        let task = lock(&self.tasks)
            .remove(&id)
            .ok_or(ConduitError::UnknownTask(id))?;
        tracing::debug!(task = %id, "unregistered task");
        Ok(task)
    }

    pub fn get(&self, id: TaskId) -> Result<Arc<Task>> {
        lock(&self.tasks)
            .get(&id)
            .cloned()
            .ok_or(ConduitError::UnknownTask(id))
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalFabric;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(LocalFabric::new(8).endpoint(0).unwrap())
    }

    #[test]
    fn dealer_ranges_do_not_overlap() {
        let root = Dealer::new(0, MAX_CHILD_TASKS, 1);
        let child = Dealer::new(1, MAX_CHILD_TASKS, 1);
        assert_eq!(root.deal().unwrap(), 1);
        assert_eq!(root.deal().unwrap(), 2);
        assert_eq!(child.deal().unwrap(), 65);
        assert_eq!(root.dealt(), 2);
    }

    #[test]
    fn dealer_exhaustion_is_an_error() {
        let dealer = Dealer::new(3, 2, 0);
        assert_eq!(dealer.deal().unwrap(), 6);
        assert_eq!(dealer.deal().unwrap(), 7);
        assert!(dealer.deal().is_err());
        assert!(Dealer::new(u32::MAX, 4, 0).deal().is_err());
    }

    #[test]
    fn replicas_split_ranks() {
        let spec = TaskSpec::new("producer", RankList::contiguous(2, 6))
            .unwrap()
            .with_layout(Grid::new(vec![3]).unwrap(), vec![Dist::Cyclic])
            .with_replicas(2);
        let task = Task::new(TaskId(1), Some(TaskId::ROOT), spec, 0, transport(), PollPolicy::default())
            .unwrap();
        assert_eq!(task.replicas(), 2);
        assert_eq!(task.map(1).unwrap().ranks().as_slice(), &[5, 6, 7]);
        assert_eq!(task.replica_of(4), Some(0));
        assert_eq!(task.replica_of(7), Some(1));
        assert_eq!(task.replica_of(0), None);
        assert!(task.map(2).is_err());
    }

    #[test]
    fn replica_layout_must_fit() {
        let spec = TaskSpec::new("bad", RankList::contiguous(0, 4))
            .unwrap()
            .with_layout(Grid::new(vec![3]).unwrap(), vec![Dist::block()])
            .with_replicas(2);
        assert!(Task::new(TaskId(1), None, spec, 0, transport(), PollPolicy::default()).is_err());
    }

    #[test]
    fn registry_lookup() {
        let registry = TaskRegistry::new();
        let spec = TaskSpec::new("root", RankList::contiguous(0, 1)).unwrap();
        let task = Arc::new(
            Task::new(TaskId::ROOT, None, spec, 0, transport(), PollPolicy::default()).unwrap(),
        );
        registry.register(Arc::clone(&task)).unwrap();
        assert!(registry.register(task).is_err());
        assert_eq!(registry.get(TaskId::ROOT).unwrap().name(), "root");
        assert!(matches!(
            registry.get(TaskId(9)),
            Err(ConduitError::UnknownTask(TaskId(9)))
        ));
        registry.unregister(TaskId::ROOT).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn child_and_conduit_ids_are_scoped_to_the_task() {
        let spec = TaskSpec::new("t", RankList::contiguous(0, 1)).unwrap();
        let task = Task::new(TaskId(2), Some(TaskId::ROOT), spec, 0, transport(), PollPolicy::default())
            .unwrap();
        assert_eq!(task.next_child_id().unwrap(), TaskId(2 * MAX_CHILD_TASKS + 1));
        assert_eq!(task.next_conduit_id().unwrap(), 2 * MAX_TASK_CONDUITS);
    }
}
