//! Server state and TLS listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use crate::auth::{self, AcceptAnyClientCert};
use crate::config::ServerConfig;
use crate::connection;
use crate::registry::Registry;

/// What the accept loop does when `accept()` itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// Abort the loop: no further connections for the life of the
    /// process. Existing sessions are unaffected.
    Abort,
    /// Log the failure and keep accepting.
    Continue,
}

/// Composes the registry, the TLS acceptor, and the listener lifecycle.
/// One-way lifecycle: stopped -> listening -> stopped, no restart.
pub struct Server {
    config: ServerConfig,
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Build a server from config: load TLS material and seed the admin
    /// set from `--admin` fingerprints.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let acceptor = build_tls_acceptor(&config)?;
        let registry = Arc::new(Registry::new());
        for fingerprint in &config.admins {
            registry.op(fingerprint);
        }
        Ok(Self {
            config,
            acceptor,
            registry,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run the server, blocking until the accept loop exits.
    pub async fn run(self) -> Result<()> {
        let (addr, handle) = self.start().await?;
        tracing::info!(%addr, "Listening");
        handle.await?;
        Ok(())
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address and the loop's task handle (useful for tests).
    pub async fn start(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;

        let policy = if self.config.keep_accepting {
            AcceptPolicy::Continue
        } else {
            AcceptPolicy::Abort
        };
        let acceptor = self.acceptor.clone();
        let registry = Arc::clone(&self.registry);
        let shutdown = Arc::clone(&self.shutdown);
        let motd = self.config.motd.clone();

        let handle = tokio::spawn(async move {
            accept_loop(listener, acceptor, registry, shutdown, policy, motd).await;
        });

        Ok((addr, handle))
    }

    /// Close every connected participant's transport, then shut the
    /// listener down. Best-effort: in-flight handler tasks are not
    /// awaited.
    pub fn stop(&self) {
        for participant in self.registry.participants() {
            participant.close();
        }
        self.shutdown.notify_one();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    shutdown: Arc<Notify>,
    policy: AcceptPolicy,
    motd: Option<String>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => match policy {
                    AcceptPolicy::Abort => {
                        tracing::error!("Failed to accept connection, aborting loop: {e}");
                        return;
                    }
                    AcceptPolicy::Continue => {
                        tracing::warn!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            },
            _ = shutdown.notified() => {
                tracing::info!("Shutdown signalled, closing listener");
                return;
            }
        };

        let acceptor = acceptor.clone();
        let registry = Arc::clone(&registry);
        let motd = motd.clone();
        tokio::spawn(async move {
            let mut tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(%peer, "TLS handshake failed: {e}");
                    return;
                }
            };

            // The ban gate runs here, before any participant exists.
            let authenticated = {
                let (_, session) = tls_stream.get_ref();
                auth::authenticate(&registry, session.peer_certificates())
            };
            let fingerprint = match authenticated {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    tracing::info!(%peer, "Rejected connection: {e}");
                    let _ = tls_stream.write_all(format!("-> {e}\r\n").as_bytes()).await;
                    let _ = tls_stream.shutdown().await;
                    return;
                }
            };

            tracing::info!(%peer, %fingerprint, "Connection authenticated");
            if let Err(e) = connection::handle_io(tls_stream, fingerprint, registry, motd).await {
                tracing::warn!(%peer, "Connection error: {e}");
            }
        });
    }
}

/// Load the TLS certificate and key and build an acceptor that requires
/// a client certificate. Any certificate is accepted; it supplies
/// identity, not authorization.
pub fn build_tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(&config.tls_cert)
        .with_context(|| format!("Failed to read TLS cert: {}", config.tls_cert))?;
    let key_pem = std::fs::read(&config.tls_key)
        .with_context(|| format!("Failed to read TLS key: {}", config.tls_key))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificates")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("Failed to parse TLS private key")?
        .context("No private key found in PEM file")?;

    let tls_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
        .with_single_cert(certs, key)
        .context("Invalid TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
