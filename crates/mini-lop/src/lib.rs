#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod corpus;
pub mod dictionary;
pub mod error;
pub mod execution;
pub mod feedback;
pub mod fuzzer;
pub mod mutation;
pub mod schedule;
pub mod stats;

pub(crate) mod util;

pub use error::FuzzerError;
pub use execution::MAP_SIZE;
pub use fuzzer::{FuzzConfig, Fuzzer};
