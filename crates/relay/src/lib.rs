//! Relay a single MCP tool provider to HTTP clients.
//!
//! The relay keeps one lazily established connection to the provider ([`connection`]), exposes
//! its tools through a JSON API ([`gateway`], [`http`]), and serves long-lived event streams with
//! periodic liveness pings ([`stream`]).

pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod http;
pub mod notify;
pub mod provider;
pub mod server;
pub mod stream;
pub mod telemetry;

pub use error::{RelayError, Result};
pub use server::{Relay, run};
