pub mod block;

pub use block::{multiply, multiply_accumulate};
