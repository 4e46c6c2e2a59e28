//! ModSoft scheduler service
//!
//! Runs the affinity placement pipeline on a fixed interval and serves the
//! latest decisions over HTTP.

pub mod api;
pub mod config;
pub mod schedule;
