//! Per-connection session driver.
//!
//! A connection starts awaiting its handshake: the first `Envelope` names the
//! client. Once the name is registered the driver runs three things until
//! the connection ends:
//!
//! - a receive task that reads frames from the client into a bounded channel,
//! - a fan-out worker (see [`crate::router::Fanout`]) that broadcasts them,
//! - the event loop, which hands inbound envelopes to the worker and writes
//!   this session's outbound queue back to the client.
//!
//! The registration is dropped on every exit path, which releases the name
//! unless the registry is configured to reserve names.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::protocol::{Envelope, Frame};
use crate::registry::RegistryError;
use crate::router::Router;

/// Error codes sent to the client in an `Error` frame.
pub mod codes {
    pub const NAME_TAKEN: &str = "name_taken";
    pub const INVALID_NAME: &str = "invalid_name";
    pub const INVALID_HANDSHAKE: &str = "invalid_handshake";
}

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("no registration received within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("session cancelled")]
    Cancelled,
}

/// Queue sizes and timeouts for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub inbound_capacity: usize,
    pub fanout_queue_capacity: usize,
    pub handshake_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            inbound_capacity: config.inbound_capacity,
            fanout_queue_capacity: config.fanout_queue_capacity,
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// Extract the display name from a registration envelope.
///
/// Line-oriented clients send the raw input line, so a trailing line ending
/// is stripped. An empty name is refused.
pub fn handshake_name(envelope: &Envelope) -> Result<String, RegistryError> {
    let name = envelope.author.trim_end_matches(['\r', '\n']);
    if name.is_empty() {
        return Err(RegistryError::InvalidName(
            "name must not be empty".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Drives connections against a shared [`Router`].
#[derive(Clone)]
pub struct SessionDriver {
    router: Router,
    settings: SessionSettings,
}

impl SessionDriver {
    pub fn new(router: Router, settings: SessionSettings) -> Self {
        Self { router, settings }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Run one connection to completion.
    ///
    /// Returns `Ok(())` when the client ends its stream, and the terminal
    /// error otherwise. Cancellation yields [`SessionError::Cancelled`].
    pub async fn run<S>(&self, stream: S, cancel: CancellationToken) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        let first = self.read_handshake(&mut reader, &cancel).await?;
        let envelope = match first.into_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                refuse(&mut writer, codes::INVALID_HANDSHAKE, &e.to_string()).await;
                return Err(SessionError::InvalidHandshake(e.to_string()));
            }
        };

        let name = match handshake_name(&envelope) {
            Ok(name) => name,
            Err(e) => {
                refuse(&mut writer, codes::INVALID_NAME, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let mut registration = match self.router.registry().register(&name) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::info!(name = %name, "rejected handshake, name in use");
                refuse(&mut writer, codes::NAME_TAKEN, &e.to_string()).await;
                return Err(e.into());
            }
        };
        tracing::info!(name = %name, "session registered");

        let (inbound_tx, mut inbound_rx) = mpsc::channel(self.settings.inbound_capacity);
        let receive_task = tokio::spawn(receive_loop(reader, inbound_tx));
        let fanout = self
            .router
            .spawn_fanout(name.clone(), self.settings.fanout_queue_capacity);

        // At most one envelope waits for the fan-out queue; the outbound
        // queue keeps draining meanwhile.
        let mut pending: Option<Envelope> = None;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(SessionError::Cancelled),

                permit = fanout.reserve(), if pending.is_some() => match (permit, pending.take()) {
                    (Some(permit), Some(envelope)) => permit.send(envelope),
                    _ => break Ok(()),
                },

                inbound = inbound_rx.recv(), if pending.is_none() => match inbound {
                    Some(envelope) => {
                        // Authorship is the registered name, whatever the client claims.
                        let envelope = Envelope::new(name.as_str(), envelope.body);
                        if envelope.fits_in_frame() {
                            pending = Some(envelope);
                        } else {
                            tracing::warn!(
                                name = %name,
                                body_len = envelope.body.len(),
                                "message too large to relay, dropping"
                            );
                        }
                    }
                    None => {
                        tracing::debug!(name = %name, "client ended stream");
                        break Ok(());
                    }
                },

                outbound = registration.recv() => match outbound {
                    Some(envelope) => {
                        if let Err(e) = write_envelope(&mut writer, &envelope).await {
                            break Err(SessionError::Transport(e));
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        receive_task.abort();
        // Queued messages from this client are still broadcast after it leaves.
        drop(fanout);
        drop(registration);
        let _ = writer.shutdown().await;

        match &result {
            Ok(()) => tracing::info!(name = %name, "session ended"),
            Err(e) => tracing::info!(name = %name, error = %e, "session terminated"),
        }
        result
    }

    async fn read_handshake<R>(
        &self,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Frame, SessionError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let read = async {
            match self.settings.handshake_timeout {
                Some(limit) => match tokio::time::timeout(limit, Frame::read_from(reader)).await {
                    Ok(frame) => frame.map_err(SessionError::Transport),
                    Err(_) => Err(SessionError::HandshakeTimeout(limit)),
                },
                None => Frame::read_from(reader).await.map_err(SessionError::Transport),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            frame = read => frame,
        }
    }
}

/// Read client frames into `tx` until end of input or a read error.
///
/// Dropping `tx` on exit closes the channel, which the event loop treats as
/// the end of the session.
async fn receive_loop<S>(mut reader: BufReader<ReadHalf<S>>, tx: mpsc::Sender<Envelope>)
where
    S: AsyncRead,
{
    loop {
        let frame = match Frame::read_from(&mut reader).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::debug!(?e, "read error, stopping receive loop");
                break;
            }
        };
        match frame.into_envelope() {
            Ok(envelope) => {
                if tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(?e, "ignoring unexpected frame from client");
            }
        }
    }
}

async fn write_envelope<W: AsyncWriteExt + Unpin>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
    let frame = Frame::envelope(envelope).map_err(io::Error::other)?;
    tokio::time::timeout(WRITE_TIMEOUT, frame.write_to(writer))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

/// Best-effort `Error` frame before the connection is dropped.
async fn refuse<W: AsyncWriteExt + Unpin>(writer: &mut W, code: &str, message: &str) {
    if let Ok(frame) = Frame::error(code, message) {
        let _ = tokio::time::timeout(WRITE_TIMEOUT, frame.write_to(writer)).await;
    }
    let _ = writer.shutdown().await;
}
