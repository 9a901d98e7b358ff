//! Fox multiply with one OS process per rank.
//!
//! ```text
//! cargo build --release --features mpi --example fox_mpi
//! FOX_NUM_THREADS=8 mpirun -n 4 target/release/examples/fox_mpi 512
//! ```
//!
//! Rank 0 generates two random matrices, every rank takes part in the run,
//! and rank 0 checks the product against the naive triple loop.

use anyhow::{anyhow, Context, Result};
use ndarray::Array2;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use fox_matmul::{comm::MpiComm, ops::block, run_rank, Communicator, ExecutionOptions, Matrix, ROOT_RANK};

fn random_matrix(n: usize, seed: u64) -> Result<Matrix> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0)?;
    Ok(Array2::from_shape_simple_fn((n, n), || normal.sample(&mut rng)))
}

fn main() -> Result<()> {
    env_logger::init();

    let universe = mpi::initialize().ok_or_else(|| anyhow!("MPI was already initialized"))?;
    let comm = MpiComm::new(universe.world())?;

    let n: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("matrix side must be a non-negative integer")?,
        None => 256,
    };
    let options = ExecutionOptions::from_env()?;

    let inputs = if comm.rank() == ROOT_RANK {
        Some((random_matrix(n, 1)?, random_matrix(n, 2)?))
    } else {
        None
    };

    let outcome = run_rank(&comm, &options, inputs.as_ref().map(|(a, b)| (a, b)))?;

    if let (Some(outcome), Some((a, b))) = (outcome, inputs.as_ref()) {
        let product = outcome.output.ok_or_else(|| anyhow!("root finished without a result"))?;
        let expected = block::multiply(a, b)?;
        println!(
            "n={} ranks={} grid={}x{} rounds={} max_abs_diff={:e}",
            n,
            comm.size(),
            outcome.grid.side(),
            outcome.grid.side(),
            outcome.stats.rounds_executed,
            block::max_abs_diff(&product, &expected)
        );
    }

    Ok(())
}
