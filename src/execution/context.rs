use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::grid::GridPolicy;

/// Environment variable holding the number of cooperating ranks
pub const WORLD_SIZE_ENV: &str = "FOX_WORLD_SIZE";
/// Environment variable holding the machine-wide thread budget
pub const NUM_THREADS_ENV: &str = "FOX_NUM_THREADS";
/// Environment variable selecting the grid policy
pub const GRID_POLICY_ENV: &str = "FOX_GRID_POLICY";

/// Rank that owns the full matrices
pub const ROOT_RANK: usize = 0;

/// Options for a distributed multiplication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Number of cooperating ranks
    pub world_size: usize,
    /// Threads shared by all ranks on this machine (0 = use system default)
    pub thread_count: usize,
    /// How the grid side is chosen for awkward matrix sizes
    pub grid_policy: GridPolicy,
    /// Synchronize the active ranks at the end of every round
    pub round_barrier: bool,
    /// Record per-round timings
    pub enable_profiling: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            world_size: 1,
            thread_count: 0, // Use system default
            grid_policy: GridPolicy::Pad,
            round_barrier: true,
            enable_profiling: false,
        }
    }
}

impl ExecutionOptions {
    /// Create a new execution options object
    pub fn new() -> Self {
        Self::default()
    }

    /// Read options from the ambient environment.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(value) = lookup(WORLD_SIZE_ENV) {
            options.world_size = parse_var(WORLD_SIZE_ENV, &value)?;
        }
        if let Some(value) = lookup(NUM_THREADS_ENV) {
            options.thread_count = parse_var(NUM_THREADS_ENV, &value)?;
        }
        if let Some(value) = lookup(GRID_POLICY_ENV) {
            options.grid_policy = value.parse()?;
        }

        Ok(options)
    }

    /// Set the number of ranks
    pub fn set_world_size(mut self, world_size: usize) -> Self {
        self.world_size = world_size;
        self
    }

    /// Set the number of threads to use
    pub fn set_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Set the grid policy
    pub fn set_grid_policy(mut self, policy: GridPolicy) -> Self {
        self.grid_policy = policy;
        self
    }

    /// Enable or disable the end-of-round barrier
    pub fn enable_round_barrier(mut self, enable: bool) -> Self {
        self.round_barrier = enable;
        self
    }

    /// Enable or disable profiling
    pub fn enable_profiling(mut self, enable: bool) -> Self {
        self.enable_profiling = enable;
        self
    }

    /// Threads available to the whole machine
    pub fn total_threads(&self) -> usize {
        if self.thread_count > 0 {
            return self.thread_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Threads one rank may use for its local multiply.
    ///
    /// The budget is split evenly across all ranks so ranks sharing a machine
    /// do not oversubscribe it.
    pub fn local_thread_count(&self) -> usize {
        (self.total_threads() / self.world_size.max(1)).max(1)
    }

    /// Reject option combinations no run can start with
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(Error::ValidationError(
                "world size must be at least 1".to_string()
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::ValidationError(format!("{}={} is not a valid value", key, value))
    })
}
