//! End-to-end redistribution run: a producer task streams numbered frames
//! through one conduit to a consumer task, which checks every element.
//!
//! Element values encode their origin, `frame * 1e6 + i` where `i` is the
//! row-major index of the element in the source array, so the consumer can
//! verify placement without knowing the producer's layout.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::conduit::Conduit;
use crate::error::{lock, ConduitError, Result};
use crate::map::spec::MapSpec;
use crate::report::{ProcessReport, Role};
use crate::runtime::ProcessContext;
use crate::task::{Task, TaskSpec};

/// Frame value stride; arrays must hold fewer elements than this.
const FRAME_SCALE: f64 = 1e6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub src: MapSpec,
    pub dst: MapSpec,
    pub shape: Vec<usize>,
    pub frames: u64,
    pub src_replicas: usize,
    pub dst_replicas: usize,
    pub transpose: bool,
    /// Put the consumer on the producer's ranks instead of after them.
    pub shared_ranks: bool,
    pub end_of_chunk: bool,
}

impl Scenario {
    fn src_procs(&self) -> usize {
        self.src.procs() * self.src_replicas
    }

    fn dst_start(&self) -> usize {
        if self.shared_ranks {
            0
        } else {
            self.src_procs()
        }
    }

    /// Ranks the scenario runs on.
    pub fn ranks_needed(&self) -> usize {
        self.src_procs()
            .max(self.dst_start() + self.dst.procs() * self.dst_replicas)
    }

    pub fn validate(&self) -> Result<()> {
        if self.src_replicas == 0 || self.dst_replicas == 0 {
            return Err(ConduitError::config("replica counts must be positive"));
        }
        if self.shape.iter().product::<usize>() as f64 >= FRAME_SCALE {
            return Err(ConduitError::config(format!(
                "arrays are limited to {FRAME_SCALE} elements"
            )));
        }
        Ok(())
    }

    /// Frames source replica `replica` inserts.
    fn frames_from(&self, replica: usize) -> u64 {
        frames_for(self.frames, replica, self.src_replicas)
    }

    /// Frames destination replica `replica` extracts.
    fn frames_to(&self, replica: usize) -> u64 {
        frames_for(self.frames, replica, self.dst_replicas)
    }
}

/// Members of the residue class `replica (mod replicas)` below `frames`.
fn frames_for(frames: u64, replica: usize, replicas: usize) -> u64 {
    let replica = replica as u64;
    if replica >= frames {
        0
    } else {
        (frames - replica).div_ceil(replicas as u64)
    }
}

fn linear(coords: &[usize], shape: &[usize]) -> usize {
    coords.iter().zip(shape).fold(0, |acc, (&c, &n)| acc * n + c)
}

/// Run `scenario` on this process. Every process of the world must call it.
pub fn run(ctx: &ProcessContext, scenario: &Scenario) -> Result<Vec<ProcessReport>> {
    scenario.validate()?;
    if ctx.num_ranks() < scenario.ranks_needed() {
        return Err(ConduitError::config(format!(
            "scenario needs {} ranks, world has {}",
            scenario.ranks_needed(),
            ctx.num_ranks()
        )));
    }

    let setup = Instant::now();
    let producer = ctx.create_task(TaskSpec::from_map_spec(
        "producer",
        0,
        &scenario.src,
        scenario.src_replicas,
    ))?;
    let consumer = ctx.create_task(TaskSpec::from_map_spec(
        "consumer",
        scenario.dst_start(),
        &scenario.dst,
        scenario.dst_replicas,
    ))?;
    let conduit = Conduit::<f64, u64>::builder(&producer, &consumer, &scenario.shape)
        .transpose(scenario.transpose)
        .end_of_chunk(scenario.end_of_chunk)
        .build(ctx)?;
    ctx.stats().add_phase("Setup", setup.elapsed());

    let streaming = Instant::now();
    let (sent, received) = std::thread::scope(|scope| {
        let sender = scope.spawn(|| produce(ctx, &producer, &conduit, scenario));
        let received = consume(ctx, &consumer, &conduit, scenario);
        let sent = sender
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        (sent, received)
    });
    ctx.stats().add_phase("Streaming", streaming.elapsed());

    ctx.retire_task(&consumer)?;
    ctx.retire_task(&producer)?;
    Ok(sent?.into_iter().chain(received?).collect())
}

fn produce(
    ctx: &ProcessContext,
    producer: &Arc<Task>,
    conduit: &Conduit<f64, u64>,
    scenario: &Scenario,
) -> Result<Vec<ProcessReport>> {
    if !producer.is_member(ctx.rank()) {
        return Ok(Vec::new());
    }
    let source = Mutex::new(conduit.source()?);
    let replica = lock(&source).replica();
    let frames = scenario.frames_from(replica);
    ctx.run_task(producer, |_| {
        let mut source = lock(&source);
        let mut data = vec![0.0; source.len()];
        for _ in 0..frames {
            let frame = source.next_frame();
            for (i, value) in data.iter_mut().enumerate() {
                let global = linear(&source.block().global_coords(i), &scenario.shape);
                *value = frame as f64 * FRAME_SCALE + global as f64;
            }
            source.insert(&data, frame)?;
        }
        if scenario.end_of_chunk {
            source.end_chunk()?;
        }
        info!(rank = ctx.rank(), replica, frames, "producer finished");
        Ok(ProcessReport {
            rank: ctx.rank(),
            role: Role::Source,
            replica,
            frames,
            elements: frames * source.len() as u64,
            mismatches: 0,
        })
    })
}

fn consume(
    ctx: &ProcessContext,
    consumer: &Arc<Task>,
    conduit: &Conduit<f64, u64>,
    scenario: &Scenario,
) -> Result<Vec<ProcessReport>> {
    if !consumer.is_member(ctx.rank()) {
        return Ok(Vec::new());
    }
    let dest = Mutex::new(conduit.dest()?);
    let replica = lock(&dest).replica();
    let expected_frames = scenario.frames_to(replica);
    ctx.run_task(consumer, |_| {
        let mut dest = lock(&dest);
        let mut out = vec![0.0; dest.len()];
        let mut frames = 0;
        let mut mismatches = 0;
        let mut last_sequence = None;
        loop {
            if !scenario.end_of_chunk && frames == expected_frames {
                break;
            }
            let got = match dest.extract(&mut out) {
                Ok(got) => got,
                Err(ConduitError::EndOfChunk(_)) => break,
                Err(err) => return Err(err),
            };
            if got.tag != got.frame {
                mismatches += 1;
            }
            if let Some(sequence) = got.sequence {
                if last_sequence.is_some_and(|last| sequence <= last) {
                    warn!(rank = ctx.rank(), sequence, ?last_sequence, "sequence did not increase");
                    mismatches += 1;
                }
                last_sequence = Some(sequence);
            }
            for (i, &value) in out.iter().enumerate() {
                let mut coords = dest.block().global_coords(i);
                if scenario.transpose {
                    coords.swap(0, 1);
                }
                let want = got.frame as f64 * FRAME_SCALE + linear(&coords, &scenario.shape) as f64;
                if value != want {
                    mismatches += 1;
                }
            }
            frames += 1;
        }
        if frames != expected_frames {
            warn!(rank = ctx.rank(), frames, expected_frames, "consumer saw an unexpected frame count");
        }
        info!(rank = ctx.rank(), replica, frames, mismatches, "consumer finished");
        Ok(ProcessReport {
            rank: ctx.rank(),
            role: Role::Destination,
            replica,
            frames,
            elements: frames * dest.len() as u64,
            mismatches,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_by_residue() {
        assert_eq!(frames_for(10, 0, 3), 4);
        assert_eq!(frames_for(10, 1, 3), 3);
        assert_eq!(frames_for(10, 2, 3), 3);
        assert_eq!(frames_for(2, 3, 4), 0);
    }

    #[test]
    fn row_major_linear_index() {
        assert_eq!(linear(&[1, 2], &[3, 4]), 6);
        assert_eq!(linear(&[2], &[5]), 2);
    }
}
