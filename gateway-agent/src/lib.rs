//! Gateway Agent - runtime library
//!
//! Bridges a device-local MQTT control channel with the cluster message broker:
//! - Control commands decoded from measurement packs (`commands`, `service`)
//! - Service liveness from broker heartbeats (`heartbeat`)
//! - Pty-backed remote terminals (`terminal`)
//! - Transport adapters and the bridge loops (`transport`, `bridge`)
//! - Admin HTTP API, bootstrap retrieval and configuration

pub mod bootstrap;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod execution;
pub mod heartbeat;
pub mod http;
pub mod senml;
pub mod service;
pub mod state;
pub mod terminal;
pub mod transport;

pub use config::Config;
pub use error::{AgentError, ErrorKind, Result};
pub use service::AgentService;
