//! rollout - release deployment to a single remote host
//!
//! This crate provides both a library and CLI for rollout, including:
//! - Configuration file parsing and merging
//! - SSH command and file transfer channels
//! - The fixed deployment recipe and its execution engine
//! - Progress reporting and the local deploy record

pub mod commands;
pub mod config;
pub mod error;
pub mod recipe;
pub mod record;
pub mod remote;
pub mod report;

pub use error::{Error, Result};
