//! CLI command implementations.

pub mod inspect_batch;
pub mod simulate;
