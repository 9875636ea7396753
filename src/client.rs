//! TCP client for the chat server.
//!
//! `Client::connect` opens the connection; `register` sends the handshake and
//! turns it into a [`ChatStream`]. A refused handshake surfaces on the first
//! `recv` as [`ClientError::Rejected`], since the server accepts silently.

use std::io;

use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::protocol::{Envelope, ErrorMsg, Frame, FrameType};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("server refused registration ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// A connected but not yet registered client.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream })
    }

    /// Send the registration envelope and open the chat stream.
    pub async fn register(mut self, name: &str) -> Result<ChatStream, ClientError> {
        Frame::envelope(&Envelope::registration(name))?
            .write_to(&mut self.stream)
            .await?;

        let (reader, writer) = tokio::io::split(self.stream);
        Ok(ChatStream {
            sender: ChatSender {
                name: name.to_string(),
                writer,
            },
            receiver: ChatReceiver {
                reader: BufReader::new(reader),
            },
        })
    }
}

/// A registered connection: send chat lines, receive everyone else's.
pub struct ChatStream {
    sender: ChatSender,
    receiver: ChatReceiver,
}

impl ChatStream {
    pub fn name(&self) -> &str {
        &self.sender.name
    }

    pub async fn send(&mut self, body: &str) -> Result<(), ClientError> {
        self.sender.send(body).await
    }

    pub async fn recv(&mut self) -> Result<Option<Envelope>, ClientError> {
        self.receiver.recv().await
    }

    /// End our side of the stream. The server then deregisters this name.
    pub async fn close(self) -> Result<(), ClientError> {
        self.sender.close().await
    }

    /// Split into halves that can be driven from separate tasks.
    pub fn split(self) -> (ChatSender, ChatReceiver) {
        (self.sender, self.receiver)
    }
}

pub struct ChatSender {
    name: String,
    writer: WriteHalf<TcpStream>,
}

impl ChatSender {
    pub async fn send(&mut self, body: &str) -> Result<(), ClientError> {
        let frame = Frame::envelope(&Envelope::new(self.name.as_str(), body))?;
        frame.write_to(&mut self.writer).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

pub struct ChatReceiver {
    reader: BufReader<ReadHalf<TcpStream>>,
}

impl ChatReceiver {
    /// Next message from another client.
    ///
    /// `Ok(None)` means the server closed the stream cleanly.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, ClientError> {
        let frame = match Frame::read_from(&mut self.reader).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match frame.frame_type {
            FrameType::Envelope => Ok(Some(frame.parse_json()?)),
            FrameType::Error => {
                let err: ErrorMsg = frame.parse_json()?;
                Err(ClientError::Rejected {
                    code: err.code,
                    message: err.message,
                })
            }
        }
    }
}
