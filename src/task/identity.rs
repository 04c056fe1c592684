//! Thread-local task identity.
//!
//! A thread belongs to whichever task scope it entered last. Scopes nest: a
//! task thread that enters a child task's scope resolves to the child until
//! the guard drops.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::{ConduitError, Result};

use super::TaskId;

/// Identity of the calling thread inside one task scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub task: TaskId,
    pub parent: Option<TaskId>,
    /// Thread index within the task on this process.
    pub local_rank: usize,
    /// Rank of the process running the thread.
    pub global_rank: usize,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Guard for an entered task scope. Leaving is dropping.
///
/// Bound to the thread that entered the scope.
#[derive(Debug)]
pub struct TaskScope {
    depth: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        FRAMES.with(|frames| frames.borrow_mut().truncate(self.depth - 1));
    }
}

/// Push `frame` onto the calling thread's scope stack.
pub fn enter(frame: Frame) -> TaskScope {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        frames.push(frame);
        tracing::trace!(task = %frame.task, local_rank = frame.local_rank, "entered task scope");
        TaskScope {
            depth: frames.len(),
            _thread_bound: PhantomData,
        }
    })
}

pub fn current_frame() -> Result<Frame> {
    FRAMES.with(|frames| frames.borrow().last().copied().ok_or(ConduitError::NoTaskScope))
}

pub fn in_scope() -> bool {
    FRAMES.with(|frames| !frames.borrow().is_empty())
}

pub fn current_task() -> Result<TaskId> {
    Ok(current_frame()?.task)
}

/// Parent of the current task; `None` for the root task.
pub fn parent_task() -> Result<Option<TaskId>> {
    Ok(current_frame()?.parent)
}

pub fn local_rank() -> Result<usize> {
    Ok(current_frame()?.local_rank)
}

pub fn global_rank() -> Result<usize> {
    Ok(current_frame()?.global_rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(task: u32, local_rank: usize) -> Frame {
        Frame {
            task: TaskId(task),
            parent: task.checked_sub(1).map(TaskId),
            local_rank,
            global_rank: 3,
        }
    }

    #[test]
    fn identity_outside_scope_fails() {
        std::thread::spawn(|| {
            assert!(!in_scope());
            assert!(matches!(current_task(), Err(ConduitError::NoTaskScope)));
            assert!(matches!(local_rank(), Err(ConduitError::NoTaskScope)));
            assert!(matches!(global_rank(), Err(ConduitError::NoTaskScope)));
            assert!(matches!(parent_task(), Err(ConduitError::NoTaskScope)));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn scopes_nest_and_unwind() {
        std::thread::spawn(|| {
            let outer = enter(frame(0, 0));
            assert_eq!(current_task().unwrap(), TaskId(0));
            assert_eq!(parent_task().unwrap(), None);
            {
                let _inner = enter(frame(1, 2));
                assert_eq!(current_task().unwrap(), TaskId(1));
                assert_eq!(parent_task().unwrap(), Some(TaskId(0)));
                assert_eq!(local_rank().unwrap(), 2);
                assert_eq!(global_rank().unwrap(), 3);
            }
            assert_eq!(current_task().unwrap(), TaskId(0));
            drop(outer);
            assert!(!in_scope());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn identity_is_per_thread() {
        let _scope = enter(frame(5, 0));
        std::thread::spawn(|| assert!(!in_scope())).join().unwrap();
        assert_eq!(current_task().unwrap(), TaskId(5));
    }
}
