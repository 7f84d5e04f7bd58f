//! remexec - remote command execution agent
//!
//! Consumes task messages from a broker, runs the requested commands on
//! remote hosts over SSH, Telnet or WinRM and publishes one result per task.

pub mod agent;
pub mod broker;
pub mod cli;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod executors;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod reply;
pub mod retry;
pub mod scheduler;
pub mod task;
