//! TCP link to the evaluation server.

use super::encoder::{encrypt_message, AcceptedResult, EncodeError, SharedKey};
use std::io::Write;
use std::net::TcpStream;
use thiserror::Error;

/// Server link failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to connect to evaluation server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send result: {0}")]
    Send(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Owns the server socket and the shared key.
///
/// Each result is encrypted and written as one payload with no framing. The
/// writer is generic so tests can capture payloads in a `Vec<u8>`.
pub struct ServerLink<W: Write = TcpStream> {
    writer: W,
    key: SharedKey,
    sent: u64,
}

impl ServerLink<TcpStream> {
    /// Connect to `host:port`.
    pub fn connect(host: &str, port: u16, key: SharedKey) -> Result<Self, ServerError> {
        let addr = format!("{host}:{port}");
        tracing::info!("Connecting to evaluation server at {}", addr);

        let stream = TcpStream::connect(&addr).map_err(|source| ServerError::Connect {
            addr: addr.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;

        tracing::info!("Connected to {}", addr);
        Ok(Self::from_writer(stream, key))
    }
}

impl<W: Write> ServerLink<W> {
    pub fn from_writer(writer: W, key: SharedKey) -> Self {
        Self {
            writer,
            key,
            sent: 0,
        }
    }

    /// Encrypt and send an accepted result; returns the plain-text message.
    pub fn send_result(&mut self, result: &AcceptedResult) -> Result<String, ServerError> {
        let message = result.format();
        self.send_message(&message)?;
        Ok(message)
    }

    /// Encrypt and send an already formatted message.
    pub fn send_message(&mut self, message: &str) -> Result<(), ServerError> {
        let payload = encrypt_message(message, &self.key)?;
        self.writer.write_all(payload.as_bytes())?;
        self.writer.flush()?;
        self.sent += 1;
        tracing::debug!("Sent {} byte payload", payload.len());
        Ok(())
    }

    /// Payloads written so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}
