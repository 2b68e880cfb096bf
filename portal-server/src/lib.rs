//! Portal rendezvous server.
//!
//! Pairs a sender and a receiver by the hash of their password's channel id,
//! forwards their opaque PAKE bytes, issues the session salt, forwards their
//! sealed connection info and, on request, relays their data-plane frames.
//!
//! The server never sees a password, a key or a plaintext byte.
//!
//! Endpoints:
//! - `/establish-sender`: either `sender.bind` (the server picks a free
//!   channel id) followed by `sender.establish` for it, or `sender.establish`
//!   alone for a caller-chosen password
//! - `/establish-receiver`

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use portal_core::{hash_channel, RendezvousMessage};
use rand::{Rng, RngCore};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Sender endpoint.
pub const SENDER_PATH: &str = "/establish-sender";

/// Receiver endpoint.
pub const RECEIVER_PATH: &str = "/establish-receiver";

/// Salt length in bytes.
pub const SALT_SIZE: usize = 32;

/// Channel ids are drawn from `0..space`, starting small for short passwords.
const CHANNEL_SPACE_START: u32 = 100;
const CHANNEL_SPACE_MAX: u32 = 100_000_000;
const RESERVE_ATTEMPTS: usize = 8;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a sender may wait for its receiver.
    pub session_ttl: Duration,
    /// How long a paired session may stay silent before relaying starts.
    pub control_idle: Duration,
    /// How often expired sessions are swept.
    pub cleanup_interval: Duration,
    /// Outbound queue depth per connection.
    pub queue_depth: usize,
    /// Concurrent connections allowed per client IP.
    pub max_conn_per_ip: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(3600),
            control_idle: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
            queue_depth: 64,
            max_conn_per_ip: 16,
        }
    }
}

impl ServerConfig {
    /// Set the unpaired-session TTL.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Set the idle deadline for paired sessions still in the control phase.
    pub fn with_control_idle(mut self, idle: Duration) -> Self {
        self.control_idle = idle;
        self
    }

    /// Set the sweep interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the per-IP connection cap.
    pub fn with_max_conn_per_ip(mut self, max: usize) -> Self {
        self.max_conn_per_ip = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Sender,
    Receiver,
}

impl Side {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            SENDER_PATH => Some(Self::Sender),
            RECEIVER_PATH => Some(Self::Receiver),
            _ => None,
        }
    }
}

struct Session {
    sender_tx: Option<mpsc::Sender<Message>>,
    receiver_tx: Option<mpsc::Sender<Message>>,
    created_at: Instant,
    last_activity: Instant,
    paired: bool,
    relaying: bool,
}

impl Session {
    fn waiting(sender_tx: mpsc::Sender<Message>) -> Self {
        let now = Instant::now();
        Self {
            sender_tx: Some(sender_tx),
            receiver_tx: None,
            created_at: now,
            last_activity: now,
            paired: false,
            relaying: false,
        }
    }

    fn expired(&self, now: Instant, config: &ServerConfig) -> bool {
        if self.relaying {
            false
        } else if self.paired {
            now.duration_since(self.last_activity) > config.control_idle
        } else {
            now.duration_since(self.created_at) > config.session_ttl
        }
    }

    fn peer_of(&self, side: Side) -> Option<mpsc::Sender<Message>> {
        match side {
            Side::Sender => self.receiver_tx.clone(),
            Side::Receiver => self.sender_tx.clone(),
        }
    }
}

type SessionMap = Arc<DashMap<String, Session>>;
type IpConnMap = Arc<DashMap<IpAddr, usize>>;

fn encode(msg: &RendezvousMessage) -> Result<Message, BoxError> {
    Ok(Message::Text(msg.to_json()?))
}

fn error_message(text: &str) -> Result<Message, BoxError> {
    encode(&RendezvousMessage::Error {
        message: text.to_string(),
    })
}

/// Reserve a free channel id for `sender_tx`.
///
/// The id space widens tenfold whenever a few random picks all collide.
fn reserve_channel(sessions: &SessionMap, sender_tx: &mpsc::Sender<Message>) -> Option<(u32, String)> {
    let mut rng = rand::thread_rng();
    let mut space = CHANNEL_SPACE_START;
    while space <= CHANNEL_SPACE_MAX {
        for _ in 0..RESERVE_ATTEMPTS {
            let channel = rng.gen_range(0..space);
            let hash = hash_channel(&channel.to_string());
            if let Entry::Vacant(slot) = sessions.entry(hash.clone()) {
                slot.insert(Session::waiting(sender_tx.clone()));
                return Some((channel, hash));
            }
        }
        space = space.saturating_mul(10);
    }
    None
}

fn fresh_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Run the server with default settings.
pub async fn run_server(listener: TcpListener) {
    run_server_with(listener, ServerConfig::default()).await
}

/// Run the server until the listener fails.
pub async fn run_server_with(listener: TcpListener, config: ServerConfig) {
    let sessions: SessionMap = Arc::new(DashMap::new());
    let ip_conns: IpConnMap = Arc::new(DashMap::new());

    // Cleanup task
    let sessions_clone = sessions.clone();
    let sweep_config = config.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_config.cleanup_interval);
        loop {
            interval.tick().await;
            let now = Instant::now();

            let expired: Vec<String> = sessions_clone
                .iter()
                .filter(|entry| entry.expired(now, &sweep_config))
                .map(|entry| entry.key().clone())
                .collect();

            for id in expired {
                if let Some((_, session)) = sessions_clone.remove(&id) {
                    let reason = if session.paired {
                        "session timed out"
                    } else {
                        "session expired"
                    };
                    info!("session {}: {}", short_id(&id), reason);
                    for tx in [session.sender_tx, session.receiver_tx].into_iter().flatten() {
                        if let Ok(msg) = error_message(reason) {
                            let _ = tx.try_send(msg);
                        }
                    }
                }
            }
        }
    });

    if let Ok(addr) = listener.local_addr() {
        info!("rendezvous server listening on {}", addr);
    }

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                break;
            }
        };
        let sessions = sessions.clone();
        let ip_conns = ip_conns.clone();
        let config = config.clone();

        let ip = peer_addr.ip();
        let current_conns = *ip_conns.entry(ip).or_insert(0);
        if current_conns >= config.max_conn_per_ip {
            warn!("connection cap reached for {}", ip);
            continue;
        }
        ip_conns.entry(ip).and_modify(|c| *c += 1);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, sessions, &config).await {
                debug!("connection from {} ended: {}", peer_addr, e);
            }
            ip_conns.entry(ip).and_modify(|c| {
                if *c > 0 {
                    *c -= 1
                }
            });
        });
    }
}

/// First 8 hex chars of a channel hash, for logs.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

async fn handle_connection(
    stream: TcpStream,
    sessions: SessionMap,
    config: &ServerConfig,
) -> Result<(), BoxError> {
    let mut path = String::new();
    let callback = |req: &Request, response: Response| {
        path = req.uri().path().to_string();
        Ok::<Response, ErrorResponse>(response)
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let Some(side) = Side::from_path(&path) else {
        ws_tx.send(error_message("unknown endpoint")?).await?;
        return Ok(());
    };

    let (tx, mut rx) = mpsc::channel::<Message>(config.queue_depth);

    // Writer task - owns ws_tx
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // 1. Wait for a bind or establish message matching the endpoint
    let first = next_message(&mut ws_rx).await;

    // 2. Register
    let hash = match (side, first) {
        (Side::Sender, Some(RendezvousMessage::SenderBind {})) => {
            let Some((channel, hash)) = reserve_channel(&sessions, &tx) else {
                tx.send(error_message("no free channel")?).await?;
                return Ok(());
            };
            tx.send(encode(&RendezvousMessage::Bound { channel })?).await?;

            // The password built on the channel must hash to the reservation.
            match next_message(&mut ws_rx).await {
                Some(RendezvousMessage::SenderEstablish { password_hash }) if password_hash == hash => {}
                _ => {
                    sessions.remove(&hash);
                    tx.send(error_message("expected establish for the bound channel")?)
                        .await?;
                    return Ok(());
                }
            }
            info!("sender bound to channel {} ({})", channel, short_id(&hash));
            hash
        }
        (Side::Sender, Some(RendezvousMessage::SenderEstablish { password_hash })) => {
            let registered = match sessions.entry(password_hash.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(Session::waiting(tx.clone()));
                    true
                }
            };
            if !registered {
                tx.send(error_message("password already in use")?).await?;
                return Ok(());
            }
            info!("sender waiting on {}", short_id(&password_hash));
            password_hash
        }
        (Side::Receiver, Some(RendezvousMessage::ReceiverEstablish { password_hash })) => {
            let sender_tx = match sessions.get_mut(&password_hash) {
                Some(mut session) if !session.paired => {
                    session.paired = true;
                    session.last_activity = Instant::now();
                    session.receiver_tx = Some(tx.clone());
                    session.sender_tx.clone()
                }
                _ => None,
            };
            match sender_tx {
                Some(sender_tx) => {
                    info!("receiver paired on {}", short_id(&password_hash));
                    sender_tx.send(encode(&RendezvousMessage::Approve {})?).await?;
                }
                None => {
                    tx.send(error_message("no sender waiting for this password")?)
                        .await?;
                    return Ok(());
                }
            }
            password_hash
        }
        _ => {
            tx.send(error_message("expected establish message")?).await?;
            return Ok(());
        }
    };

    // 3. Forward until either side goes away
    let result = forward(&mut ws_rx, &tx, &sessions, &hash, side).await;

    // Cleanup on disconnect. The entry may already belong to a newer sender.
    let mut remove = false;
    if let Some(mut session) = sessions.get_mut(&hash) {
        let own = match side {
            Side::Sender => &mut session.sender_tx,
            Side::Receiver => &mut session.receiver_tx,
        };
        if own.as_ref().is_some_and(|t| t.same_channel(&tx)) {
            *own = None;
            if let Some(peer) = session.peer_of(side) {
                if let Ok(msg) = encode(&RendezvousMessage::PeerGone {}) {
                    let _ = peer.try_send(msg);
                }
            }
            remove = side == Side::Sender
                || (session.sender_tx.is_none() && session.receiver_tx.is_none());
        }
    }
    if remove {
        sessions.remove(&hash);
        debug!("session {} removed", short_id(&hash));
    }

    result
}

/// Next control message, or `None` if the client sent something else or left.
async fn next_message(
    ws_rx: &mut futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<TcpStream>,
    >,
) -> Option<RendezvousMessage> {
    loop {
        match ws_rx.next().await? {
            Ok(Message::Text(text)) => return RendezvousMessage::from_json(&text).ok(),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            _ => return None,
        }
    }
}

async fn forward(
    ws_rx: &mut futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<TcpStream>,
    >,
    tx: &mpsc::Sender<Message>,
    sessions: &SessionMap,
    hash: &str,
    side: Side,
) -> Result<(), BoxError> {
    let peer = || sessions.get(hash).and_then(|s| s.peer_of(side));

    while let Some(msg) = ws_rx.next().await {
        match msg? {
            Message::Text(text) => {
                let msg = match RendezvousMessage::from_json(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tx.send(error_message("malformed message")?).await?;
                        return Err(e.into());
                    }
                };
                debug!("{:?} -> {}", side, msg.kind());
                if let Some(mut session) = sessions.get_mut(hash) {
                    session.last_activity = Instant::now();
                }

                match (side, msg) {
                    (Side::Sender, msg @ RendezvousMessage::SenderPake { .. })
                    | (Side::Sender, msg @ RendezvousMessage::SenderInfo { .. })
                    | (Side::Receiver, msg @ RendezvousMessage::ReceiverInfo { .. }) => {
                        if let Some(peer) = peer() {
                            peer.send(encode(&msg)?).await?;
                        }
                    }
                    (Side::Receiver, msg @ RendezvousMessage::ReceiverPake { .. }) => {
                        let salt = encode(&RendezvousMessage::Salt { salt: fresh_salt() })?;
                        if let Some(peer) = peer() {
                            peer.send(encode(&msg)?).await?;
                            peer.send(salt.clone()).await?;
                        }
                        tx.send(salt).await?;
                    }
                    (Side::Receiver, RendezvousMessage::RelayRequest {}) => {
                        if let Some(mut session) = sessions.get_mut(hash) {
                            session.relaying = true;
                        }
                        info!("relaying session {}", short_id(hash));
                        let ready = encode(&RendezvousMessage::RelayReady {})?;
                        if let Some(peer) = peer() {
                            peer.send(ready.clone()).await?;
                        }
                        tx.send(ready).await?;
                    }
                    (_, other) => {
                        tx.send(error_message(&format!("unexpected message {}", other.kind()))?)
                            .await?;
                        return Ok(());
                    }
                }
            }
            Message::Binary(data) => {
                let relaying = sessions.get(hash).map(|s| s.relaying).unwrap_or(false);
                if !relaying {
                    tx.send(error_message("relay not active")?).await?;
                    return Ok(());
                }
                match peer() {
                    Some(peer) => peer.send(Message::Binary(data)).await?,
                    None => return Ok(()),
                }
            }
            Message::Close(_) => return Ok(()),
            _ => {} // Ping, Pong
        }
    }
    Ok(())
}
