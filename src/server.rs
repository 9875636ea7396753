//! TCP (optionally TLS) listener for chat clients.
//!
//! Every accepted connection gets its own task running a
//! [`SessionDriver`]. The accept loop stops when the cancel token fires;
//! live sessions observe a child of the same token and end with
//! `SessionError::Cancelled`. `serve` waits for them and for their fan-out
//! workers before returning.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::{ConfigError, ServerConfig};
use crate::outbox::DeliveryPolicy;
use crate::registry::Registry;
use crate::router::Router;
use crate::session::{SessionDriver, SessionError, SessionSettings};
use crate::tls::{self, TlsError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct Server {
    listener: TcpListener,
    driver: SessionDriver,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Bind the configured address and build the registry and router.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let tls = config.tls.as_ref().map(tls::acceptor).transpose()?;
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind,
                source,
            })?;
        Ok(Self::from_listener(listener, config, tls))
    }

    /// Build a server around an already-bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: &ServerConfig,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        let registry = Registry::new(config.outbound_capacity, config.name_release);
        let router = Router::new(registry, DeliveryPolicy::from_config(config));
        let driver = SessionDriver::new(router, SessionSettings::from_config(config));
        Self {
            listener,
            driver,
            tls,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> &Router {
        self.driver.router()
    }

    pub fn registry(&self) -> &Registry {
        self.driver.router().registry()
    }

    /// Accept connections until `cancel` fires, then wait for live sessions
    /// to wind down.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        let addr = self.listener.local_addr()?;
        tracing::info!(
            %addr,
            tls = self.tls.is_some(),
            name_release = ?self.registry().release_policy(),
            "chat server listening"
        );

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("server received cancel signal, stopping accept loop");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let conn = uuid::Uuid::new_v4();
                            let span = tracing::info_span!("conn", %conn, %peer);
                            let driver = self.driver.clone();
                            let tls = self.tls.clone();
                            let cancel = cancel.child_token();
                            tracker.spawn(
                                async move {
                                    if let Err(e) = handle_connection(stream, tls, driver, cancel).await {
                                        tracing::debug!(error = %e, "connection ended");
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            tracing::error!(?e, "failed to accept connection");
                            // Backoff to prevent tight loop under sustained accept errors
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        // Fan-out workers outlive their sessions until queued envelopes are pushed
        self.driver.router().wait_workers().await;
        tracing::info!("chat server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    driver: SessionDriver,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let _ = stream.set_nodelay(true);
    match tls {
        Some(acceptor) => {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                accepted = acceptor.accept(stream) => accepted?,
            };
            driver.run(stream, cancel).await
        }
        None => driver.run(stream, cancel).await,
    }
}
