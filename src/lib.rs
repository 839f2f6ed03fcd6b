//! Supervisor for a sandboxed claw gateway with remote state backup.
//!
//! The crate keeps one healthy gateway process running inside an ephemeral
//! sandbox and mirrors the gateway's durable state (config, skills, workspace)
//! to a remote blob store mounted into the sandbox.

pub mod ai_env;
pub mod cli;
pub mod config;
pub mod config_fallback;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod sandbox;
pub mod services;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use services::Services;
