//! CLI command implementations

pub mod deploy;
