//! Server configuration (CLI flags and environment).

use clap::Parser;

/// Runtime configuration for the parlor server.
#[derive(Parser, Debug, Clone)]
#[command(name = "parlor-server", about = "Multi-user chat server over TLS")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:2022", env = "PARLOR_LISTEN")]
    pub listen_addr: String,

    /// Path to the TLS certificate (PEM).
    #[arg(long, env = "PARLOR_TLS_CERT")]
    pub tls_cert: String,

    /// Path to the TLS private key (PEM).
    #[arg(long, env = "PARLOR_TLS_KEY")]
    pub tls_key: String,

    /// Message of the day, sent to each participant on join.
    #[arg(long)]
    pub motd: Option<String>,

    /// Read the MOTD from a file (resolved into --motd at startup).
    #[arg(long)]
    pub motd_file: Option<String>,

    /// Identity fingerprint granted operator status at startup. Repeatable.
    #[arg(long = "admin")]
    pub admins: Vec<String>,

    /// Keep accepting connections after a failed accept instead of
    /// aborting the accept loop.
    #[arg(long)]
    pub keep_accepting: bool,
}
