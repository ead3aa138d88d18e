//! Corekeeper - control plane for a proxy engine
//!
//! This library provides the background machinery of a proxy panel:
//! - Supervises a single engine process (start, stop, crash reports, restart)
//! - Runs independent jobs under one lifecycle manager with bounded shutdown
//! - Recovers a crashed engine after two consecutive failed health samples
//! - Accounts clear-on-read traffic counters and disables exhausted quotas
//! - Tracks source IPs per client from the access log and writes a ban log
//!   for an external intrusion-prevention tool
//! - Rotates the ban and access logs keeping one previous generation

pub mod access_log;
pub mod admin;
pub mod client_ips;
pub mod config;
pub mod db;
pub mod engine_config;
pub mod error;
pub mod healthcheck;
pub mod iplimit;
pub mod jobs;
pub mod log_rotator;
pub mod log_streamer;
pub mod log_writer;
pub mod notifications;
pub mod process;
pub mod restart;
pub mod stats;
pub mod supervisor;
pub mod traffic;
