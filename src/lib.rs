pub mod error;
pub mod matrix;
pub mod ops;
pub mod grid;
pub mod comm;
pub mod distribution;
pub mod execution;
pub mod task;

// Re-export commonly used types
pub use error::{Error, Result};
pub use matrix::Matrix;
pub use grid::{GridPolicy, GridRole, ProcessGrid};
pub use comm::{Communicator, LocalComm, LocalWorld, ProblemHeader, Tag};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use distribution::{BlockDistributor, LocalBlocks};
pub use execution::assembler::ResultAssembler;
pub use execution::context::{ExecutionOptions, ROOT_RANK};
pub use execution::engine::{FoxStepEngine, RoundStats};
pub use task::{run_rank, FoxMatMul, FoxReport, RankOutcome};
