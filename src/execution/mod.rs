pub mod assembler;
pub mod context;
pub mod engine;

pub use assembler::ResultAssembler;
pub use context::ExecutionOptions;
pub use engine::{FoxOutcome, FoxStepEngine, RoundState, RoundStats};
