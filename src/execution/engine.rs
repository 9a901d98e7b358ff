use std::time::{Duration, Instant};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::comm::{Communicator, Tag};
use crate::distribution::{block_from_vec, LocalBlocks};
use crate::error::{Error, Result};
use crate::grid::ProcessGrid;
use crate::matrix::{self, Matrix};
use crate::ops::block;

use super::context::ExecutionOptions;

/// Working buffer of a single round
#[derive(Debug, Clone, PartialEq)]
pub struct RoundState {
    /// Round index
    pub step: usize,
    /// The A block every rank in this row multiplies with during the round
    pub broadcast_a: Matrix,
}

/// What one active rank observed while running the rounds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundStats {
    /// Number of completed rounds
    pub rounds_executed: usize,
    /// Wall time of each round (only filled when profiling is enabled)
    pub round_durations: Vec<Duration>,
}

/// Accumulated C block and the statistics of the rounds that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct FoxOutcome {
    pub c: Matrix,
    pub stats: RoundStats,
}

/// Runs the q broadcast / multiply / rotate rounds of the Fox algorithm
///
/// Round `step` on the rank at `(row, col)`:
/// 1. the rank at `(row, (row + step) mod q)` broadcasts its A block along the row
/// 2. `C += broadcast_a * B` on the local thread budget
/// 3. B moves one row up the column, wrapping around the torus
/// 4. the active ranks meet at a barrier (unless disabled)
///
/// After q rounds every rank has multiplied its column of B against every A
/// block of its row, so its C block is complete. Rounds only ever run in
/// increasing order and cannot be resumed halfway.
pub struct FoxStepEngine<'a> {
    grid: &'a ProcessGrid,
    /// Threads for the local multiply
    threads: usize,
    round_barrier: bool,
    enable_profiling: bool,
}

impl<'a> FoxStepEngine<'a> {
    /// Create an engine for `grid` using the thread cap and flags of `options`
    pub fn new(grid: &'a ProcessGrid, options: &ExecutionOptions) -> Self {
        Self {
            grid,
            threads: options.local_thread_count(),
            round_barrier: options.round_barrier,
            enable_profiling: options.enable_profiling,
        }
    }

    /// Override the local thread count
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run all rounds on this rank and return its C block
    pub fn run<C: Communicator>(&self, comm: &C, blocks: LocalBlocks) -> Result<FoxOutcome> {
        let rank = comm.rank();
        let (row, col) = self.grid.rank_coords(rank)?;
        let q = self.grid.side();
        let k = self.grid.block_size();

        for held in [&blocks.a, &blocks.b] {
            if held.dim() != (k, k) {
                return Err(Error::BlockSizeMismatch {
                    expected: k * k,
                    actual: held.len(),
                });
            }
        }

        let LocalBlocks { a: local_a, b: mut local_b } = blocks;
        let mut local_c = Array2::zeros((k, k));
        let row_members = self.grid.row_members(row);
        let active = self.grid.active_ranks();
        let (send_to, recv_from) = self.grid.rotation_ranks(row, col);
        let mut stats = RoundStats::default();

        for step in 0..q {
            let started = Instant::now();

            let state = self.broadcast_step(comm, step, row, &row_members, &local_a)?;
            block::multiply_accumulate(
                state.broadcast_a.view(),
                local_b.view(),
                local_c.view_mut(),
                self.threads,
            )?;
            local_b = self.rotate_step(comm, step, send_to, recv_from, local_b)?;

            if self.round_barrier && active.len() > 1 {
                comm.barrier(&active, step)?;
            }

            stats.rounds_executed += 1;
            if self.enable_profiling {
                stats.round_durations.push(started.elapsed());
            }
            log::debug!("rank {} ({}, {}) finished round {}/{}", rank, row, col, state.step + 1, q);
        }

        Ok(FoxOutcome { c: local_c, stats })
    }

    /// Share this round's A block along the grid row
    fn broadcast_step<C: Communicator>(
        &self,
        comm: &C,
        step: usize,
        row: usize,
        row_members: &[usize],
        local_a: &Matrix,
    ) -> Result<RoundState> {
        let root = self.grid.broadcaster(row, step);
        let payload = if comm.rank() == root {
            Some(matrix::to_row_major(local_a))
        } else {
            None
        };

        let data = comm.broadcast(root, row_members, Tag::Broadcast(step), payload)?;
        Ok(RoundState {
            step,
            broadcast_a: block_from_vec(self.grid.block_size(), data)?,
        })
    }

    /// Pass B to the rank above and take the one from below
    fn rotate_step<C: Communicator>(
        &self,
        comm: &C,
        step: usize,
        send_to: usize,
        recv_from: usize,
        local_b: Matrix,
    ) -> Result<Matrix> {
        let rank = comm.rank();
        if send_to == rank && recv_from == rank {
            return Ok(local_b);
        }

        let data = comm.send_recv(send_to, recv_from, Tag::Rotate(step), matrix::to_row_major(&local_b))?;
        block_from_vec(self.grid.block_size(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalWorld;
    use crate::distribution::extract_block;
    use crate::grid::GridPolicy;

    fn test_matrices(n: usize) -> (Matrix, Matrix) {
        let a = Array2::from_shape_fn((n, n), |(i, j)| ((i * 3 + j * 5) % 7) as f64 - 3.0);
        let b = Array2::from_shape_fn((n, n), |(i, j)| ((i + 2 * j) % 5) as f64 * 0.5);
        (a, b)
    }

    /// Run the engine on every rank with blocks cut directly from `a` and `b`
    fn run_engine(
        world_size: usize,
        a: &Matrix,
        b: &Matrix,
        options: &ExecutionOptions,
        threads: usize,
    ) -> Result<(ProcessGrid, Vec<Option<FoxOutcome>>)> {
        let grid = ProcessGrid::compute(world_size, a.nrows(), GridPolicy::Strict)?;
        let outcomes = LocalWorld::new(world_size)?.run(|comm| {
            let Some((row, col)) = grid.coords(comm.rank()) else {
                return Ok(None);
            };
            let k = grid.block_size();
            let blocks = LocalBlocks {
                a: extract_block(a, row, col, k),
                b: extract_block(b, row, col, k),
            };
            let engine = FoxStepEngine::new(&grid, options).with_threads(threads);
            engine.run(&comm, blocks).map(Some)
        })?;
        Ok((grid, outcomes))
    }

    #[test]
    fn test_blocks_match_reference_product() {
        let (a, b) = test_matrices(6);
        let expected = block::multiply(&a, &b).unwrap();
        let options = ExecutionOptions::new().set_world_size(9);

        let (grid, outcomes) = run_engine(9, &a, &b, &options, 1).unwrap();

        for (rank, outcome) in outcomes.iter().enumerate() {
            let (row, col) = grid.coords(rank).unwrap();
            let outcome = outcome.as_ref().unwrap();
            let want = extract_block(&expected, row, col, grid.block_size());
            assert!(
                block::max_abs_diff(&outcome.c, &want) < 1e-12,
                "rank {} block differs", rank
            );
        }
    }

    #[test]
    fn test_round_count_equals_grid_side() {
        for (world_size, n) in [(1, 3), (4, 4), (9, 6), (16, 8)] {
            let (a, b) = test_matrices(n);
            let options = ExecutionOptions::new().set_world_size(world_size);
            let (grid, outcomes) = run_engine(world_size, &a, &b, &options, 1).unwrap();

            for outcome in outcomes.iter().flatten() {
                assert_eq!(outcome.stats.rounds_executed, grid.side());
            }
        }
    }

    #[test]
    fn test_without_barrier_same_result() {
        let (a, b) = test_matrices(8);
        let with = ExecutionOptions::new().set_world_size(16);
        let without = with.clone().enable_round_barrier(false);

        let (_, first) = run_engine(16, &a, &b, &with, 1).unwrap();
        let (_, second) = run_engine(16, &a, &b, &without, 1).unwrap();

        for (x, y) in first.iter().zip(&second) {
            assert_eq!(x.as_ref().unwrap().c, y.as_ref().unwrap().c);
        }
    }

    #[test]
    fn test_threaded_local_multiply_is_bitwise_identical() {
        let (a, b) = test_matrices(2 * block::PARALLEL_MIN_SIDE);
        let options = ExecutionOptions::new().set_world_size(4);

        let (_, serial) = run_engine(4, &a, &b, &options, 1).unwrap();
        let (_, threaded) = run_engine(4, &a, &b, &options, 4).unwrap();

        for (x, y) in serial.iter().zip(&threaded) {
            assert_eq!(x.as_ref().unwrap().c, y.as_ref().unwrap().c);
        }
    }

    #[test]
    fn test_profiling_records_each_round() {
        let (a, b) = test_matrices(4);
        let options = ExecutionOptions::new().set_world_size(4).enable_profiling(true);

        let (_, outcomes) = run_engine(4, &a, &b, &options, 1).unwrap();
        for outcome in outcomes.iter().flatten() {
            assert_eq!(outcome.stats.round_durations.len(), 2);
        }
    }

    #[test]
    fn test_wrong_block_size_rejected() {
        let grid = ProcessGrid::compute(1, 4, GridPolicy::Pad).unwrap();
        let options = ExecutionOptions::new();
        let result = LocalWorld::new(1).unwrap().run(|comm| {
            let blocks = LocalBlocks {
                a: Array2::zeros((4, 4)),
                b: Array2::zeros((3, 3)),
            };
            FoxStepEngine::new(&grid, &options).run(&comm, blocks)
        });
        assert!(matches!(result, Err(Error::BlockSizeMismatch { expected: 16, actual: 9 })));
    }

    #[test]
    fn test_idle_rank_cannot_run() {
        let grid = ProcessGrid::compute(2, 4, GridPolicy::Pad).unwrap();
        let options = ExecutionOptions::new().set_world_size(2);
        let result = LocalWorld::new(2).unwrap().run(|comm| {
            if comm.rank() == 0 {
                return Ok(());
            }
            let blocks = LocalBlocks {
                a: Array2::zeros((4, 4)),
                b: Array2::zeros((4, 4)),
            };
            FoxStepEngine::new(&grid, &options).run(&comm, blocks).map(|_| ())
        });
        assert!(matches!(result, Err(Error::InvalidGrid(_))));
    }

    #[test]
    fn test_broadcast_step_shares_scheduled_block() {
        // Round 1 of row 0 on a 2x2 grid takes its A block from column 1
        let grid = ProcessGrid::compute(4, 4, GridPolicy::Strict).unwrap();
        let options = ExecutionOptions::new().set_world_size(4);
        let states = LocalWorld::new(4).unwrap().run(|comm| {
            let (row, _) = grid.rank_coords(comm.rank())?;
            let local_a = Array2::from_elem((2, 2), comm.rank() as f64);
            FoxStepEngine::new(&grid, &options).broadcast_step(&comm, 1, row, &grid.row_members(row), &local_a)
        }).unwrap();

        for (rank, state) in states.iter().enumerate() {
            assert_eq!(state.step, 1);
            let broadcaster = grid.broadcaster(rank / 2, 1);
            assert_eq!(state.broadcast_a, Array2::from_elem((2, 2), broadcaster as f64));
        }
        assert_eq!(states[0].broadcast_a[[0, 0]], 1.0);
        assert_eq!(states[2].broadcast_a[[0, 0]], 2.0);
    }
}
