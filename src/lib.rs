//! The Hadron placement coordinator.
//!
//! Tracks which streaming node owns each physical channel, under which term, and whether that
//! assignment has been confirmed. Terms act as fencing tokens, so a superseded owner can never
//! write to a channel it no longer owns.

pub mod app;
pub mod balancer;
pub mod config;
pub mod database;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod server;
pub mod stats;
pub mod store;
pub mod utils;
pub mod wal;

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

use crate::config::Config;

/// Get a handle to the global metrics recorder, building it on first use.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| PrometheusBuilder::new().add_global_label("node", config.node_name.clone()).build())
}
