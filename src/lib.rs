//! CT library
//!
//! One host shares one sandboxed directory over the LAN; clients find it by
//! UDP broadcast, authenticate with a shared token and password, and keep a
//! persistent session with a logical remote working directory.

pub mod auth;
pub mod bootstrap;
pub mod cli;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
#[cfg(test)]
mod fake_host;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod service;
pub mod session;
pub mod verbs;
