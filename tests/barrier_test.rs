use std::sync::atomic::{AtomicUsize, Ordering};

use conduit::map::RankList;
use conduit::task::TaskSpec;
use conduit::LocalWorld;

const PHASES: usize = 5;

#[test]
fn task_threads_on_every_rank_meet_each_phase() {
    // Shared across ranks: the world runs in one process.
    let arrived = AtomicUsize::new(0);
    let generations = LocalWorld::new(3)
        .run(|ctx| {
            let task = ctx.create_task(TaskSpec::new("workers", RankList::contiguous(0, 3))?.with_threads(2))?;
            ctx.run_task(&task, |_| {
                for phase in 0..PHASES {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    task.barrier().synch()?;
                    assert_eq!(arrived.load(Ordering::SeqCst), 6 * (phase + 1));
                    task.barrier().synch()?;
                }
                Ok(())
            })?;
            Ok(task.barrier().generation())
        })
        .unwrap();
    assert_eq!(generations, vec![2 * PHASES as u64; 3]);
}

#[test]
fn root_barrier_orders_ranks() {
    let stamp = AtomicUsize::new(0);
    let seen = LocalWorld::new(4)
        .run(|ctx| {
            if ctx.rank() == 0 {
                stamp.store(42, Ordering::SeqCst);
            }
            ctx.root().barrier().synch()?;
            Ok(stamp.load(Ordering::SeqCst))
        })
        .unwrap();
    assert_eq!(seen, vec![42; 4]);
}

#[test]
fn barrier_rejects_ranks_outside_the_task() {
    let results = LocalWorld::new(2)
        .run(|ctx| {
            let task = ctx.create_task(TaskSpec::new("one", RankList::contiguous(0, 1))?)?;
            Ok(task.barrier().synch().is_err())
        })
        .unwrap();
    assert_eq!(results, vec![false, true]);
}
