use futures_util::{SinkExt, StreamExt};
use portal_core::{hash_channel, RendezvousMessage};
use portal_server::{run_server, run_server_with, ServerConfig};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Helpers ---

async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        run_server(listener).await;
    });
    format!("ws://{}", addr)
}

async fn connect(url: &str, path: &str) -> Client {
    let (ws, _) = connect_async(format!("{}{}", url, path)).await.unwrap();
    ws
}

async fn send(ws: &mut Client, msg: RendezvousMessage) {
    ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
}

async fn recv(ws: &mut Client) -> RendezvousMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return RendezvousMessage::from_json(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn recv_binary(ws: &mut Client) -> Vec<u8> {
    match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
        Some(Ok(Message::Binary(data))) => data,
        other => panic!("expected binary frame, got {:?}", other),
    }
}

fn establish_sender(hash: &str) -> RendezvousMessage {
    RendezvousMessage::SenderEstablish {
        password_hash: hash.to_string(),
    }
}

fn establish_receiver(hash: &str) -> RendezvousMessage {
    RendezvousMessage::ReceiverEstablish {
        password_hash: hash.to_string(),
    }
}

/// Pair a sender and a receiver on `hash` and return both sockets.
async fn paired(url: &str, hash: &str) -> (Client, Client) {
    let mut s_ws = connect(url, "/establish-sender").await;
    send(&mut s_ws, establish_sender(hash)).await;
    sleep(Duration::from_millis(100)).await;

    let mut r_ws = connect(url, "/establish-receiver").await;
    send(&mut r_ws, establish_receiver(hash)).await;

    assert_eq!(recv(&mut s_ws).await, RendezvousMessage::Approve {});
    (s_ws, r_ws)
}

fn expect_error(msg: RendezvousMessage) -> String {
    match msg {
        RendezvousMessage::Error { message } => message,
        other => panic!("expected error, got {:?}", other),
    }
}

// --- Scenarios ---

#[tokio::test]
async fn test_pairing_and_pake_forwarding() {
    let url = start_server().await;
    let (mut s_ws, mut r_ws) = paired(&url, "aa01").await;

    send(&mut s_ws, RendezvousMessage::SenderPake { bytes: vec![1, 2, 3] }).await;
    assert_eq!(
        recv(&mut r_ws).await,
        RendezvousMessage::SenderPake { bytes: vec![1, 2, 3] }
    );

    send(&mut r_ws, RendezvousMessage::ReceiverPake { bytes: vec![4, 5] }).await;
    assert_eq!(
        recv(&mut s_ws).await,
        RendezvousMessage::ReceiverPake { bytes: vec![4, 5] }
    );

    // Both sides get the same fresh salt
    let s_salt = match recv(&mut s_ws).await {
        RendezvousMessage::Salt { salt } => salt,
        other => panic!("expected salt, got {:?}", other),
    };
    let r_salt = match recv(&mut r_ws).await {
        RendezvousMessage::Salt { salt } => salt,
        other => panic!("expected salt, got {:?}", other),
    };
    assert_eq!(s_salt.len(), 32);
    assert_eq!(s_salt, r_salt);
}

#[tokio::test]
async fn test_info_forwarding() {
    let url = start_server().await;
    let (mut s_ws, mut r_ws) = paired(&url, "aa02").await;

    send(&mut s_ws, RendezvousMessage::SenderInfo { sealed: vec![9; 40] }).await;
    send(&mut r_ws, RendezvousMessage::ReceiverInfo { sealed: vec![7; 40] }).await;

    assert_eq!(
        recv(&mut r_ws).await,
        RendezvousMessage::SenderInfo { sealed: vec![9; 40] }
    );
    assert_eq!(
        recv(&mut s_ws).await,
        RendezvousMessage::ReceiverInfo { sealed: vec![7; 40] }
    );
}

#[tokio::test]
async fn test_duplicate_sender_rejected() {
    let url = start_server().await;

    let mut first = connect(&url, "/establish-sender").await;
    send(&mut first, establish_sender("aa03")).await;
    sleep(Duration::from_millis(100)).await;

    let mut second = connect(&url, "/establish-sender").await;
    send(&mut second, establish_sender("aa03")).await;
    let message = expect_error(recv(&mut second).await);
    assert!(message.contains("already in use"));
}

#[tokio::test]
async fn test_unknown_receiver_rejected() {
    let url = start_server().await;

    let mut r_ws = connect(&url, "/establish-receiver").await;
    send(&mut r_ws, establish_receiver("nobody")).await;
    let message = expect_error(recv(&mut r_ws).await);
    assert!(message.contains("no sender"));
}

#[tokio::test]
async fn test_second_receiver_rejected() {
    let url = start_server().await;
    let (_s_ws, _r_ws) = paired(&url, "aa04").await;

    let mut late = connect(&url, "/establish-receiver").await;
    send(&mut late, establish_receiver("aa04")).await;
    expect_error(recv(&mut late).await);
}

#[tokio::test]
async fn test_wrong_establish_for_endpoint() {
    let url = start_server().await;

    let mut ws = connect(&url, "/establish-sender").await;
    send(&mut ws, establish_receiver("aa05")).await;
    expect_error(recv(&mut ws).await);
}

#[tokio::test]
async fn test_unknown_endpoint() {
    let url = start_server().await;

    let mut ws = connect(&url, "/somewhere-else").await;
    let message = expect_error(recv(&mut ws).await);
    assert!(message.contains("unknown endpoint"));
}

#[tokio::test]
async fn test_unknown_message_type() {
    let url = start_server().await;
    let (mut s_ws, _r_ws) = paired(&url, "aa06").await;

    s_ws.send(Message::Text(r#"{"type":"portal.v1.nonsense","payload":{}}"#.into()))
        .await
        .unwrap();
    expect_error(recv(&mut s_ws).await);
}

#[tokio::test]
async fn test_binary_before_relay_rejected() {
    let url = start_server().await;
    let (mut s_ws, _r_ws) = paired(&url, "aa07").await;

    s_ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let message = expect_error(recv(&mut s_ws).await);
    assert!(message.contains("relay not active"));
}

#[tokio::test]
async fn test_relay_promotion_forwards_both_ways() {
    let url = start_server().await;
    let (mut s_ws, mut r_ws) = paired(&url, "aa08").await;

    send(&mut r_ws, RendezvousMessage::RelayRequest {}).await;
    assert_eq!(recv(&mut s_ws).await, RendezvousMessage::RelayReady {});
    assert_eq!(recv(&mut r_ws).await, RendezvousMessage::RelayReady {});

    s_ws.send(Message::Binary(vec![0xAB; 100])).await.unwrap();
    assert_eq!(recv_binary(&mut r_ws).await, vec![0xAB; 100]);

    r_ws.send(Message::Binary(vec![0xCD; 3])).await.unwrap();
    assert_eq!(recv_binary(&mut s_ws).await, vec![0xCD; 3]);
}

#[tokio::test]
async fn test_peer_gone_on_disconnect() {
    let url = start_server().await;
    let (s_ws, mut r_ws) = paired(&url, "aa09").await;

    drop(s_ws);
    assert_eq!(recv(&mut r_ws).await, RendezvousMessage::PeerGone {});
}

#[tokio::test]
async fn test_password_reusable_after_sender_leaves() {
    let url = start_server().await;

    let mut first = connect(&url, "/establish-sender").await;
    send(&mut first, establish_sender("aa10")).await;
    sleep(Duration::from_millis(100)).await;
    first.close(None).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let (_s_ws, _r_ws) = paired(&url, "aa10").await;
}

#[tokio::test]
async fn test_unpaired_session_expires() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let config = ServerConfig::default()
        .with_session_ttl(Duration::from_millis(100))
        .with_cleanup_interval(Duration::from_millis(50));
    tokio::spawn(async move {
        run_server_with(listener, config).await;
    });

    let mut s_ws = connect(&url, "/establish-sender").await;
    send(&mut s_ws, establish_sender("aa11")).await;
    let message = expect_error(recv(&mut s_ws).await);
    assert!(message.contains("expired"));

    sleep(Duration::from_millis(50)).await;
    let mut r_ws = connect(&url, "/establish-receiver").await;
    send(&mut r_ws, establish_receiver("aa11")).await;
    expect_error(recv(&mut r_ws).await);
}

async fn bind(url: &str) -> (Client, u32) {
    let mut ws = connect(url, "/establish-sender").await;
    send(&mut ws, RendezvousMessage::SenderBind {}).await;
    match recv(&mut ws).await {
        RendezvousMessage::Bound { channel } => (ws, channel),
        other => panic!("expected bound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bound_channels_do_not_collide() {
    let url = start_server().await;

    let mut senders = Vec::new();
    let mut channels = std::collections::HashSet::new();
    for _ in 0..12 {
        let (mut ws, channel) = bind(&url).await;
        send(&mut ws, establish_sender(&hash_channel(&channel.to_string()))).await;
        assert!(channels.insert(channel), "channel {} handed out twice", channel);
        senders.push(ws);
    }
}

#[tokio::test]
async fn test_bound_channel_pairs_with_receiver() {
    let url = start_server().await;

    let (mut s_ws, channel) = bind(&url).await;
    let hash = hash_channel(&channel.to_string());
    send(&mut s_ws, establish_sender(&hash)).await;
    sleep(Duration::from_millis(100)).await;

    let mut r_ws = connect(&url, "/establish-receiver").await;
    send(&mut r_ws, establish_receiver(&hash)).await;
    assert_eq!(recv(&mut s_ws).await, RendezvousMessage::Approve {});

    // A caller-chosen password on the same channel is refused while bound.
    let mut other = connect(&url, "/establish-sender").await;
    send(&mut other, establish_sender(&hash)).await;
    let message = expect_error(recv(&mut other).await);
    assert!(message.contains("already in use"));
}

#[tokio::test]
async fn test_establish_must_match_bound_channel() {
    let url = start_server().await;

    let (mut s_ws, channel) = bind(&url).await;
    let wrong = hash_channel(&(channel + 1).to_string());
    send(&mut s_ws, establish_sender(&wrong)).await;
    let message = expect_error(recv(&mut s_ws).await);
    assert!(message.contains("bound channel"));

    // The reservation is released.
    let hash = hash_channel(&channel.to_string());
    let mut again = connect(&url, "/establish-sender").await;
    send(&mut again, establish_sender(&hash)).await;
    sleep(Duration::from_millis(100)).await;
    let mut r_ws = connect(&url, "/establish-receiver").await;
    send(&mut r_ws, establish_receiver(&hash)).await;
    assert_eq!(recv(&mut again).await, RendezvousMessage::Approve {});
}

#[tokio::test]
async fn test_silent_pair_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let config = ServerConfig::default()
        .with_control_idle(Duration::from_millis(150))
        .with_cleanup_interval(Duration::from_millis(50));
    tokio::spawn(async move {
        run_server_with(listener, config).await;
    });

    // The receiver joins and then never sends its PAKE message.
    let (mut s_ws, mut r_ws) = paired(&url, "aa12").await;
    send(&mut s_ws, RendezvousMessage::SenderPake { bytes: vec![1] }).await;
    assert_eq!(
        recv(&mut r_ws).await,
        RendezvousMessage::SenderPake { bytes: vec![1] }
    );

    let message = expect_error(recv(&mut s_ws).await);
    assert!(message.contains("timed out"));
    let message = expect_error(recv(&mut r_ws).await);
    assert!(message.contains("timed out"));
}
