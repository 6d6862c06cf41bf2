//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod audit;
pub mod layout;
pub mod run;
