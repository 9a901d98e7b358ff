//! Entry points that take two full matrices and return their product.
//!
//! `run_rank` is what every rank executes; it works over any `Communicator`.
//! `FoxMatMul` wraps it for the common case of running the whole world inside
//! this process.

use std::time::Duration;

use serde::Serialize;

use crate::comm::{Communicator, LocalWorld, ProblemHeader};
use crate::distribution::BlockDistributor;
use crate::error::{Error, Result};
use crate::execution::assembler::ResultAssembler;
use crate::execution::context::{ExecutionOptions, ROOT_RANK};
use crate::execution::engine::{FoxStepEngine, RoundStats};
use crate::grid::ProcessGrid;
use crate::matrix::{self, Matrix};

/// What an active rank ends a run with
#[derive(Debug, Clone, PartialEq)]
pub struct RankOutcome {
    pub rank: usize,
    pub grid: ProcessGrid,
    pub stats: RoundStats,
    /// Threads the rank used for its local multiply
    pub local_threads: usize,
    /// Assembled product, only on the root
    pub output: Option<Matrix>,
}

/// Result of a run together with how it was carried out
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoxReport {
    pub output: Matrix,
    pub grid: ProcessGrid,
    pub rounds_executed: usize,
    pub local_threads: usize,
    /// Root's per-round wall time, empty unless profiling was enabled
    pub round_durations_ns: Vec<u64>,
}

impl FoxReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Side shared by two operands, or why they cannot be multiplied
fn operand_side(a: &Matrix, b: &Matrix) -> Result<usize> {
    let n = matrix::square_side(a, "A")?;
    let m = matrix::square_side(b, "B")?;
    if n != m {
        return Err(Error::ValidationError(format!(
            "operand sizes differ: A is {}x{}, B is {}x{}", n, n, m, m
        )));
    }
    Ok(n)
}

/// Work out what the root announces, rejecting inputs no grid can take
fn root_header(
    world_size: usize,
    options: &ExecutionOptions,
    inputs: Option<(&Matrix, &Matrix)>,
) -> Result<ProblemHeader> {
    let (a, b) = inputs.ok_or_else(|| {
        Error::ValidationError(format!("root rank {} was given no input matrices", ROOT_RANK))
    })?;
    let n = operand_side(a, b)?;
    ProcessGrid::compute(world_size, n, options.grid_policy)?;
    Ok(ProblemHeader {
        n,
        policy: options.grid_policy,
    })
}

/// Whole nanoseconds, saturating at `u64::MAX`
fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Run one rank's share of a distributed multiplication.
///
/// Only the root passes `inputs`. The root first broadcasts the matrix side
/// and its grid policy, and every rank derives the grid from those; the
/// policy in the other ranks' `options` is not used. If the root rejects its
/// inputs it broadcasts a rejection instead and returns the error, while
/// every other rank returns `Ok(None)` without exchanging any block. Idle
/// ranks also return `Ok(None)` once the grid is known.
pub fn run_rank<C: Communicator>(
    comm: &C,
    options: &ExecutionOptions,
    inputs: Option<(&Matrix, &Matrix)>,
) -> Result<Option<RankOutcome>> {
    let rank = comm.rank();
    let world_size = comm.size();
    let options = options.clone().set_world_size(world_size);

    let header = if rank == ROOT_RANK {
        match root_header(world_size, &options, inputs) {
            Ok(header) => comm.broadcast_dimension(ROOT_RANK, Some(header))?,
            Err(e) => {
                comm.broadcast_dimension(ROOT_RANK, None)?;
                return Err(e);
            }
        }
    } else {
        comm.broadcast_dimension(ROOT_RANK, None)?
    };

    let ProblemHeader { n, policy } = match header {
        Some(header) => header,
        None => {
            log::debug!("rank {} stopping: root rejected its inputs", rank);
            return Ok(None);
        }
    };
    if policy != options.grid_policy {
        log::debug!("rank {} follows root grid policy {} over its own {}", rank, policy, options.grid_policy);
    }
    let options = options.set_grid_policy(policy);

    let grid = ProcessGrid::compute(world_size, n, policy)?;
    if !grid.is_active(rank) {
        log::debug!("rank {} is idle in a {}x{} grid", rank, grid.side(), grid.side());
        return Ok(None);
    }

    let local_threads = options.local_thread_count();
    if rank == ROOT_RANK {
        log::info!(
            "Fox multiply: n={}, {} ranks, grid {}x{}, block {}, {} threads per rank",
            n, world_size, grid.side(), grid.side(), grid.block_size(), local_threads
        );
        if grid.is_padded() {
            log::warn!("padding {}x{} matrices to {}x{}", n, n, grid.padded_n(), grid.padded_n());
        }
        if grid.idle_count() > 0 {
            log::warn!("{} of {} ranks are idle", grid.idle_count(), world_size);
        }
    }

    let (a, b) = match inputs {
        Some((a, b)) => (Some(a), Some(b)),
        None => (None, None),
    };
    let blocks = BlockDistributor::new(&grid, ROOT_RANK)
        .scatter_pair(comm, a, b)?
        .ok_or_else(|| Error::CommunicationError {
            rank,
            message: "active rank received no blocks".to_string(),
        })?;

    let outcome = FoxStepEngine::new(&grid, &options)
        .with_threads(local_threads)
        .run(comm, blocks)?;

    let output = ResultAssembler::new(&grid, ROOT_RANK).assemble(comm, Some(&outcome.c))?;

    Ok(Some(RankOutcome {
        rank,
        grid,
        stats: outcome.stats,
        local_threads,
        output,
    }))
}

/// Multiplies square matrices with the Fox algorithm over an in-process world
#[derive(Debug, Clone, Default)]
pub struct FoxMatMul {
    options: ExecutionOptions,
}

impl FoxMatMul {
    pub fn new(options: ExecutionOptions) -> Self {
        Self { options }
    }

    /// Configure from `FOX_WORLD_SIZE`, `FOX_NUM_THREADS` and `FOX_GRID_POLICY`
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ExecutionOptions::from_env()?))
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Check inputs and an output buffer length before anything runs.
    ///
    /// Fails when either matrix is not square, the sizes differ, the output
    /// does not hold exactly `n * n` elements, or no grid can be formed.
    pub fn validate(&self, a: &Matrix, b: &Matrix, output_len: usize) -> Result<ProcessGrid> {
        self.options.validate()?;
        let n = operand_side(a, b)?;
        if output_len != n * n {
            return Err(Error::ValidationError(format!(
                "output holds {} elements, expected {}x{} = {}",
                output_len, n, n, n * n
            )));
        }
        ProcessGrid::compute(self.options.world_size, n, self.options.grid_policy)
    }

    /// Multiply `a` by `b`
    pub fn run(&self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        Ok(self.run_with_report(a, b)?.output)
    }

    /// Multiply `a` by `b`, writing the product row-major into `out`
    pub fn run_into(&self, a: &Matrix, b: &Matrix, out: &mut [f64]) -> Result<()> {
        self.validate(a, b, out.len())?;
        let product = self.run(a, b)?;
        for (slot, value) in out.iter_mut().zip(product.iter()) {
            *slot = *value;
        }
        Ok(())
    }

    /// Multiply two `n x n` row-major buffers into a third
    pub fn run_buffers(&self, n: usize, a: &[f64], b: &[f64], out: &mut [f64]) -> Result<()> {
        let a = matrix::from_row_major(n, n, a)?;
        let b = matrix::from_row_major(n, n, b)?;
        self.run_into(&a, &b, out)
    }

    /// Multiply `a` by `b` and report the grid and rounds used
    pub fn run_with_report(&self, a: &Matrix, b: &Matrix) -> Result<FoxReport> {
        let n = operand_side(a, b)?;
        let grid = self.validate(a, b, n * n)?;
        log::debug!("validated {}x{} operands for grid {:?}", n, n, grid);

        let world = LocalWorld::new(self.options.world_size)?;
        let outcomes = world.run(|comm| {
            let inputs = if comm.rank() == ROOT_RANK { Some((a, b)) } else { None };
            run_rank(&comm, &self.options, inputs)
        })?;

        for outcome in outcomes.iter().flatten() {
            if outcome.stats.rounds_executed != grid.side() {
                return Err(Error::ValidationError(format!(
                    "rank {} executed {} rounds on a grid of side {}",
                    outcome.rank, outcome.stats.rounds_executed, grid.side()
                )));
            }
        }

        let root = outcomes
            .into_iter()
            .nth(ROOT_RANK)
            .flatten()
            .ok_or_else(|| Error::CommunicationError {
                rank: ROOT_RANK,
                message: "root finished without taking part".to_string(),
            })?;
        let output = root.output.ok_or_else(|| Error::CommunicationError {
            rank: ROOT_RANK,
            message: "root finished without an assembled result".to_string(),
        })?;

        Ok(FoxReport {
            output,
            grid: root.grid,
            rounds_executed: root.stats.rounds_executed,
            local_threads: root.local_threads,
            round_durations_ns: root
                .stats
                .round_durations
                .iter()
                .copied()
                .map(duration_nanos)
                .collect(),
        })
    }
}
