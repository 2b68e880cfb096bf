//! Transfer protocol driver.
//!
//! Runs the [`TransferSession`] state machine over a [`Conn`], sealing every
//! message with the session's [`CryptoChannel`]. The machine is identical over
//! a direct connection and over the relay.
//!
//! # Hard Failures
//!
//! Any error (decryption, unexpected message, I/O) fails the session, closes
//! the connection and surfaces. The channel and its key go with the driver.

use log::{debug, info};
use portal_core::{
    CryptoChannel, Direction, ProgressState, ProtocolError, TransferMessage, TransferSession,
    TransferState, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::conn::Conn;
use crate::error::PortalError;

/// What the receiver got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Payload name announced by the sender.
    pub name: String,
    /// Bytes written to the sink.
    pub bytes: u64,
}

/// One side of the data plane.
pub struct TransferProtocol {
    conn: Box<dyn Conn>,
    channel: CryptoChannel,
    session: TransferSession,
}

impl std::fmt::Debug for TransferProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProtocol")
            .field("channel", &self.channel)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl TransferProtocol {
    /// Bind a connection to a sealed channel. The role follows the channel.
    pub fn new(conn: Box<dyn Conn>, channel: CryptoChannel) -> Self {
        let session = match channel.outbound() {
            Direction::SenderToReceiver => TransferSession::new_sender(),
            Direction::ReceiverToSender => TransferSession::new_receiver(),
        };
        Self {
            conn,
            channel,
            session,
        }
    }

    /// Current state of the underlying machine.
    pub fn state(&self) -> TransferState {
        self.session.state()
    }

    async fn send(&mut self, msg: TransferMessage) -> Result<(), PortalError> {
        self.session.on_send(&msg)?;
        let plaintext = Zeroizing::new(msg.to_bytes()?);
        let frame = self.channel.encrypt(&plaintext)?;
        self.conn.write(frame).await
    }

    async fn recv(&mut self) -> Result<TransferMessage, PortalError> {
        let frame = self.conn.read().await?;
        let plaintext = Zeroizing::new(self.channel.decrypt(&frame)?);
        let msg = TransferMessage::from_bytes(&plaintext)?;
        self.session.on_receive(&msg)?;
        Ok(msg)
    }

    async fn finish<T>(&mut self, result: Result<T, PortalError>) -> Result<T, PortalError> {
        if result.is_err() {
            self.session.fail();
        }
        self.conn.close().await;
        result
    }

    /// Serve `size` bytes from `reader` under `name`.
    ///
    /// Returns the number of payload bytes sent. `on_progress` is called with
    /// throttled fractions.
    pub async fn run_sender<R>(
        &mut self,
        name: &str,
        size: u64,
        reader: &mut R,
        chunk_size: usize,
        on_progress: impl FnMut(f64) + Send,
    ) -> Result<u64, PortalError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let result = self
            .sender_inner(name, size, reader, chunk_size, on_progress)
            .await;
        self.finish(result).await
    }

    async fn sender_inner<R>(
        &mut self,
        name: &str,
        size: u64,
        reader: &mut R,
        chunk_size: usize,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> Result<u64, PortalError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        // Version is checked by the state machine.
        self.recv().await?;
        self.send(TransferMessage::SenderHandshake {
            name: name.to_string(),
            size,
        })
        .await?;

        self.recv().await?;
        info!("sending {} ({} bytes)", name, size);

        let mut progress = ProgressState::new(size);
        let mut buf = Zeroizing::new(vec![0u8; chunk_size.max(1)]);
        loop {
            let n = reader
                .read(&mut buf[..])
                .await
                .map_err(|e| PortalError::Preparation(e.to_string()))?;
            if n == 0 {
                break;
            }
            self.send(TransferMessage::PayloadChunk {
                data: buf[..n].to_vec(),
            })
            .await?;
            if let Some(fraction) = progress.advance(n as u64) {
                on_progress(fraction);
            }
        }

        self.send(TransferMessage::PayloadEnd {}).await?;
        if let Some(fraction) = progress.finish() {
            on_progress(fraction);
        }
        debug!("payload sent, waiting for receiver to close");

        self.recv().await?;
        self.send(TransferMessage::SenderClosing {}).await?;

        Ok(progress.done())
    }

    /// Fetch the payload into `sink`.
    ///
    /// `on_metadata` is called once the sender announced name and size.
    pub async fn run_receiver<W>(
        &mut self,
        sink: &mut W,
        on_metadata: impl FnOnce(&str, u64) + Send,
        on_progress: impl FnMut(f64) + Send,
    ) -> Result<Received, PortalError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let result = self.receiver_inner(sink, on_metadata, on_progress).await;
        self.finish(result).await
    }

    async fn receiver_inner<W>(
        &mut self,
        sink: &mut W,
        on_metadata: impl FnOnce(&str, u64) + Send,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> Result<Received, PortalError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.send(TransferMessage::ReceiverHandshake {
            version: PROTOCOL_VERSION,
        })
        .await?;

        let (name, size) = match self.recv().await? {
            TransferMessage::SenderHandshake { name, size } => (name, size),
            other => return Err(unexpected("portal.v1.sender.handshake", &other)),
        };
        info!("receiving {} ({} bytes)", name, size);
        on_metadata(&name, size);

        self.send(TransferMessage::RequestPayload {}).await?;

        let mut progress = ProgressState::new(size);
        loop {
            match self.recv().await? {
                TransferMessage::PayloadChunk { data } => {
                    let data = Zeroizing::new(data);
                    sink.write_all(&data)
                        .await
                        .map_err(|e| PortalError::Preparation(e.to_string()))?;
                    if let Some(fraction) = progress.advance(data.len() as u64) {
                        on_progress(fraction);
                    }
                }
                TransferMessage::PayloadEnd {} => break,
                other => return Err(unexpected("portal.v1.sender.payload-chunk", &other)),
            }
        }
        sink.flush()
            .await
            .map_err(|e| PortalError::Preparation(e.to_string()))?;
        if let Some(fraction) = progress.finish() {
            on_progress(fraction);
        }

        self.send(TransferMessage::ReceiverClosing {}).await?;
        self.recv().await?;

        Ok(Received {
            name,
            bytes: progress.done(),
        })
    }
}

fn unexpected(expected: &'static str, got: &TransferMessage) -> PortalError {
    PortalError::Protocol(ProtocolError::UnexpectedMessage {
        expected,
        got: got.kind(),
    })
}
