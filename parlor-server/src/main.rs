use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // rustls needs an explicit provider selection before any TLS usage.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    // Use JSON logs in production (PARLOR_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("PARLOR_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("parlor_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = parlor_server::config::ServerConfig::parse();
    tracing::info!("Starting chat server on {}", config.listen_addr);

    // Resolve --motd-file into --motd
    if let Some(ref path) = config.motd_file {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                tracing::info!("Loaded MOTD from {path}");
                config.motd = Some(content);
            }
            Err(e) => tracing::warn!("Failed to read MOTD file {path}: {e}"),
        }
    }

    let server = parlor_server::server::Server::new(config)?;
    server.run().await
}
