//! CLI command implementations.

pub mod repl;
pub mod run;
