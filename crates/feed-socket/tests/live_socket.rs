use feed_socket::{ConnectionConfig, ConnectionManager, ConnectionState, RetryPolicy};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

fn config(addr: SocketAddr, heartbeat_ms: u64) -> ConnectionConfig {
    let mut config = ConnectionConfig::parse(&format!("ws://{addr}/v1a/ws/")).expect("config");
    config.heartbeat_interval = Duration::from_millis(heartbeat_ms);
    config.retry = RetryPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        jitter_ratio: 0.0,
        max_attempts: None,
    };
    config
}

async fn wait_for_state(
    states: &mut watch::Receiver<ConnectionState>,
    want: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(WAIT, async {
        loop {
            let current = *states.borrow_and_update();
            if want(&current) {
                return current;
            }
            states.changed().await.expect("state channel open");
        }
    })
    .await
    .expect("state reached in time")
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (tcp, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client connected in time")
        .expect("accept");
    accept_async(tcp).await.expect("handshake")
}

async fn next_text(server: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        let frame = tokio::time::timeout(WAIT, server.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = frame {
            return text;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn routes_frames_and_sends_heartbeats() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let manager = ConnectionManager::new(config(listener.local_addr().expect("addr"), 100));
    let (_network, mut network_rx) = manager.subscribe_channel("network");
    let (_dashboard, mut dashboard_rx) = manager.subscribe_channel("dashboard");
    let mut states = manager.watch_state();
    let handle = manager.start().expect("start");

    let mut server = accept(&listener).await;
    wait_for_state(&mut states, ConnectionState::is_connected).await;
    assert_eq!(next_text(&mut server).await, r#"{"type":"ping"}"#);

    for frame in [
        r#"{"type":"pong"}"#,
        "not json",
        r#"{"type":"network:new_tx_accepted","tx_id":"00aa","timestamp":1}"#,
        r#"{"type":"dashboard:metrics","transactions":3}"#,
    ] {
        server
            .send(Message::Text(frame.to_string()))
            .await
            .expect("server send");
    }

    let tx = tokio::time::timeout(WAIT, network_rx.recv())
        .await
        .expect("network message in time")
        .expect("network channel open");
    assert_eq!(tx.kind(), "network:new_tx_accepted");
    assert_eq!(tx.body()["tx_id"], "00aa");
    let metrics = tokio::time::timeout(WAIT, dashboard_rx.recv())
        .await
        .expect("dashboard message in time")
        .expect("dashboard channel open");
    assert_eq!(metrics.event(), Some("metrics"));

    assert!(manager.send(r#"{"type":"subscribe_address","address":"HAddr"}"#));
    let outbound = loop {
        let text = next_text(&mut server).await;
        if text != r#"{"type":"ping"}"# {
            break text;
        }
    };
    assert!(outbound.contains("subscribe_address"));

    manager.shutdown();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("run loop exit")
        .expect("join");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.send("late"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_server_drops_and_keeps_subscribers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let manager = ConnectionManager::new(config(listener.local_addr().expect("addr"), 1_000));
    let (_network, mut network_rx) = manager.subscribe_channel("network");
    let mut states = manager.watch_state();
    let handle = manager.start().expect("start");

    let first = accept(&listener).await;
    wait_for_state(&mut states, ConnectionState::is_connected).await;
    drop(first);

    let mut second = accept(&listener).await;
    wait_for_state(&mut states, ConnectionState::is_connected).await;
    second
        .send(Message::Text(
            r#"{"type":"network:new_tx_accepted","tx_id":"after","timestamp":2}"#.to_string(),
        ))
        .await
        .expect("server send");
    let tx = tokio::time::timeout(WAIT, network_rx.recv())
        .await
        .expect("message in time")
        .expect("channel open");
    assert_eq!(tx.body()["tx_id"], "after");

    manager.shutdown();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("run loop exit")
        .expect("join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_server_is_treated_as_stale() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let manager = ConnectionManager::new(config(listener.local_addr().expect("addr"), 50));
    let handle = manager.start().expect("start");

    let _silent = accept(&listener).await;
    let _replacement = accept(&listener).await;

    manager.shutdown();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("run loop exit")
        .expect("join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_max_attempts() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr")
    };
    let mut config = config(addr, 1_000);
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_attempts = Some(2);
    let manager = ConnectionManager::new(config);
    let mut states = manager.watch_state();
    let handle = manager.start().expect("start");

    let state = wait_for_state(&mut states, |state| {
        matches!(state, ConnectionState::Failed { .. })
    })
    .await;
    assert_eq!(state, ConnectionState::Failed { attempts: 2 });
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("run loop exit")
        .expect("join");

    // A failed manager may be started again.
    let retry = manager.start().expect("restart");
    manager.shutdown();
    tokio::time::timeout(WAIT, retry)
        .await
        .expect("run loop exit")
        .expect("join");
}
