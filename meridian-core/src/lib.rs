//! Shared utilities for the Meridian workspace: collection aliases,
//! logging bootstrap, and CLI plumbing for binaries.

pub mod cli;
pub mod collections;
pub mod log;
