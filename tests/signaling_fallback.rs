//! Production wiring: WebSocket signaling with fallback and QUIC channels.

use std::net::SocketAddr;
use std::time::Duration;

use seymour_mesh::{NetworkConfig, NetworkController, NetworkError, bind_signal_server};
use tokio::time::{Instant, sleep};

const ROOM: &str = "https://example.com/quic";

/// A URL nothing listens on.
async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

fn config(servers: Vec<String>) -> NetworkConfig {
    let mut config = NetworkConfig {
        signal_servers: servers,
        signaling_attempts_per_server: 2,
        signaling_retry_delay: Duration::from_millis(20),
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..NetworkConfig::default()
    };
    config.mesh.signaling_timeout = Duration::from_secs(2);
    config.sync.sync_interval = Duration::from_millis(200);
    config
}

#[tokio::test]
async fn nodes_fall_back_and_exchange_comments_over_quic() {
    let (addr, server) = bind_signal_server(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let servers = vec![dead_url().await, format!("ws://{addr}")];

    let x = NetworkController::start(config(servers.clone())).await.unwrap();
    let y = NetworkController::start(config(servers)).await.unwrap();
    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();

    let posted = x.post_comment(ROOM, "over quic", None, None).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let comments = y.comments(ROOM).await.unwrap();
        if comments.contains(&posted) {
            break;
        }
        assert!(Instant::now() < deadline, "comment never arrived over quic");
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(y.room_peers(ROOM).await, vec![x.peer_id()]);

    x.shutdown().await;
    y.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn start_fails_when_every_signaling_server_is_down() {
    let servers = vec![dead_url().await, dead_url().await];
    let err = match NetworkController::start(config(servers)).await {
        Ok(_) => panic!("started without signaling"),
        Err(err) => err,
    };
    match err.downcast_ref::<NetworkError>() {
        Some(NetworkError::SignalingConnection { attempts, .. }) => assert_eq!(*attempts, 4),
        other => panic!("unexpected error: {other:?} ({err:#})"),
    }
}
