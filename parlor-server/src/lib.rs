//! parlor — a small multi-user chat server over TLS.
//!
//! One shared room: every connected participant has a unique display name,
//! messages fan out to everyone with a bounded recent-history replay for
//! newcomers, and identities (client-certificate fingerprints) can be
//! banned or granted operator privileges.
//!
//! Module map:
//! - [`registry`] — the session registry and broadcast engine (the core)
//! - [`participant`] — handle for one connected session
//! - [`history`] — bounded log of recent broadcasts
//! - [`auth`] — client-certificate identity and the handshake-time ban gate
//! - [`connection`] — per-connection read loop, writer task, commands
//! - [`server`] — TLS listener and lifecycle
//! - [`config`] — CLI/env configuration

pub mod auth;
pub mod config;
pub mod connection;
pub mod history;
pub mod participant;
pub mod registry;
pub mod server;
