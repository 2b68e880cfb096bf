//! Sender and receiver sessions.
//!
//! The main public interface. One call runs one transfer end to end:
//!
//! 1. Dial the rendezvous server and run the PAKE through it
//! 2. Derive the session key and exchange sealed connection info
//! 3. Race direct against relay
//! 4. Run the transfer protocol over the winner
//!
//! Every call ends in exactly one `TransferOutcome` or one `PortalError`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{info, warn};
use portal_core::{ConnectionInfo, Password, Role, Spake2Exchange};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::PortalConfig;
use crate::error::PortalError;
use crate::event::{ConnectionKind, EventSink, SessionEvent};
use crate::negotiate::{negotiate_receiver, negotiate_sender};
use crate::rendezvous::RendezvousSession;
use crate::transfer::TransferProtocol;

/// What the sender offers: a name, a total length and a byte stream.
pub struct Payload {
    /// Name shown to the receiver.
    pub name: String,
    /// Exact number of bytes `reader` yields.
    pub size: u64,
    /// The bytes.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Payload {
    /// Wrap an arbitrary reader.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            reader: Box::new(reader),
        }
    }

    /// Serve an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::new(name, size, std::io::Cursor::new(bytes))
    }

    /// Serve a regular file. The payload name is the file name.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, PortalError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| PortalError::Preparation(format!("{}: {}", path.display(), e)))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| PortalError::Preparation(format!("{}: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(PortalError::Preparation(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PortalError::Preparation(format!("{}: no file name", path.display())))?;

        Ok(Self::new(name, metadata.len(), file))
    }
}

/// Terminal result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Payload name.
    pub name: String,
    /// Payload bytes moved.
    pub bytes: u64,
    /// Wall time from rendezvous to close.
    pub elapsed: Duration,
    /// Path the payload took.
    pub connection: ConnectionKind,
}

/// Address to advertise for direct connections.
fn advertised_addr(
    config: &PortalConfig,
    listener: Option<&TcpListener>,
    control: &RendezvousSession,
) -> Option<SocketAddr> {
    if config.advertise_addr.is_some() {
        return config.advertise_addr;
    }
    let port = listener?.local_addr().ok()?.port();
    control.local_ip().map(|ip| SocketAddr::new(ip, port))
}

/// Sending side of a transfer.
#[derive(Debug, Clone, Default)]
pub struct Sender {
    config: PortalConfig,
    events: EventSink,
}

impl Sender {
    /// Create a sender.
    pub fn new(config: PortalConfig) -> Self {
        Self {
            config,
            events: EventSink::default(),
        }
    }

    /// Report progress on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    /// Offer `payload` under a fresh password and wait for one receiver.
    ///
    /// The rendezvous server assigns the password's channel id. The password
    /// is reported through [`SessionEvent::Password`] once it exists.
    pub async fn send(&self, payload: Payload) -> Result<TransferOutcome, PortalError> {
        self.report(self.send_inner(None, payload).await)
    }

    /// Offer `payload` under a caller-chosen `password`.
    ///
    /// Fails with [`PortalError::Rendezvous`] if another sender holds the same
    /// channel id.
    pub async fn send_with_password(
        &self,
        password: &Password,
        payload: Payload,
    ) -> Result<TransferOutcome, PortalError> {
        self.report(self.send_inner(Some(password), payload).await)
    }

    fn report(
        &self,
        result: Result<TransferOutcome, PortalError>,
    ) -> Result<TransferOutcome, PortalError> {
        match &result {
            Ok(_) => self.events.emit(SessionEvent::Done),
            Err(e) => {
                warn!("send failed: {}", e);
                self.events.emit(SessionEvent::Error(e.to_string()));
            }
        }
        result
    }

    async fn send_inner(
        &self,
        password: Option<&Password>,
        mut payload: Payload,
    ) -> Result<TransferOutcome, PortalError> {
        let started = Instant::now();

        let listener = if self.config.direct {
            let listener = TcpListener::bind(self.config.listen_addr)
                .await
                .map_err(|e| {
                    PortalError::Connectivity(format!(
                        "listen on {}: {}",
                        self.config.listen_addr, e
                    ))
                })?;
            Some(listener)
        } else {
            None
        };

        let mut control = RendezvousSession::connect(&self.config, Role::Sender).await?;
        let password = match password {
            Some(password) => password.clone(),
            None => Password::generate(control.bind().await?),
        };
        let local = ConnectionInfo {
            addr: advertised_addr(&self.config, listener.as_ref(), &control),
        };
        info!("advertising {:?} for direct connections", local.addr);

        self.events.emit(SessionEvent::Ready);
        self.events
            .emit(SessionEvent::Password(password.as_str().to_string()));

        let (channel, _peer) = control
            .establish_sender::<Spake2Exchange>(&password, &local)
            .await?;
        self.events.emit(SessionEvent::FileInfo {
            name: payload.name.clone(),
            size: payload.size,
        });

        let (conn, kind) = negotiate_sender(control, listener, &self.config).await?;
        self.events.emit(SessionEvent::Connected(kind));

        let mut protocol = TransferProtocol::new(conn, channel);
        let events = &self.events;
        let bytes = protocol
            .run_sender(
                &payload.name,
                payload.size,
                &mut payload.reader,
                self.config.chunk_size,
                |fraction| events.emit(SessionEvent::Progress(fraction)),
            )
            .await?;

        Ok(TransferOutcome {
            name: payload.name,
            bytes,
            elapsed: started.elapsed(),
            connection: kind,
        })
    }
}

/// Receiving side of a transfer.
#[derive(Debug, Clone, Default)]
pub struct Receiver {
    config: PortalConfig,
    events: EventSink,
}

impl Receiver {
    /// Create a receiver.
    pub fn new(config: PortalConfig) -> Self {
        Self {
            config,
            events: EventSink::default(),
        }
    }

    /// Report progress on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    /// Fetch the payload offered under `password` into `sink`.
    ///
    /// The password is validated before any network activity.
    pub async fn receive<W>(&self, password: &str, sink: &mut W) -> Result<TransferOutcome, PortalError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let result = self.receive_inner(password, sink).await;
        match &result {
            Ok(_) => self.events.emit(SessionEvent::Done),
            Err(e) => {
                warn!("receive failed: {}", e);
                self.events.emit(SessionEvent::Error(e.to_string()));
            }
        }
        result
    }

    async fn receive_inner<W>(&self, password: &str, sink: &mut W) -> Result<TransferOutcome, PortalError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let password = Password::parse(password)?;
        let started = Instant::now();

        let mut control = RendezvousSession::connect(&self.config, Role::Receiver).await?;
        self.events.emit(SessionEvent::Ready);

        let local = ConnectionInfo { addr: None };
        let (channel, peer) = control
            .establish_receiver::<Spake2Exchange>(&password, &local)
            .await?;

        let (conn, kind) = negotiate_receiver(control, &peer, &self.config).await?;
        self.events.emit(SessionEvent::Connected(kind));

        let mut protocol = TransferProtocol::new(conn, channel);
        let events = &self.events;
        let received = protocol
            .run_receiver(
                sink,
                |name, size| {
                    events.emit(SessionEvent::FileInfo {
                        name: name.to_string(),
                        size,
                    })
                },
                |fraction| events.emit(SessionEvent::Progress(fraction)),
            )
            .await?;

        Ok(TransferOutcome {
            name: received.name,
            bytes: received.bytes,
            elapsed: started.elapsed(),
            connection: kind,
        })
    }
}
