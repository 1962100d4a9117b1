//! Two nodes on one in-process signaling hub and memory network: they meet in
//! a room, exchange a comment, a reply and a vote, and print what arrives.
//!
//! ```text
//! cargo run --example two_peers -- --room https://example.com/article
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::timeout;

use seymour_mesh::{
    Comment, CommentEvent, Keypair, MemoryNetwork, MemoryStore, NetworkConfig, NetworkController, NetworkParts,
    PeerIdentity, SignalHub, transport_channel,
};

#[derive(Parser, Debug)]
#[command(name = "two_peers")]
#[command(about = "Two seymour-mesh peers trading comments in one process")]
struct DemoArgs {
    #[arg(long, default_value = "https://example.com/article")]
    room: String,

    #[arg(long, default_value = "hello from alice")]
    text: String,
}

async fn peer(hub: &SignalHub, network: &MemoryNetwork, name: &str) -> Result<NetworkController> {
    let identity = PeerIdentity::from_keypair(Keypair::generate());
    let (events_tx, events_rx) = transport_channel();
    let transport = network.transport(identity.public_key, events_tx);
    let parts = NetworkParts {
        store: Arc::new(MemoryStore::new()),
        signaling: hub.connect().await?,
        signaling_connector: Some(Arc::new(hub.clone())),
        transport: Arc::new(transport),
        transport_events: events_rx,
    };
    let config = NetworkConfig {
        display_name: Some(name.to_string()),
        ..NetworkConfig::default()
    };
    NetworkController::init(config, identity, parts).await
}

/// The next merged comment matching `wanted`. Local writes show up on the
/// event stream too, so everything else is skipped.
async fn wait_for<F>(events: &mut mpsc::Receiver<CommentEvent>, wanted: F) -> Result<Comment>
where
    F: Fn(&Comment) -> bool,
{
    loop {
        let CommentEvent::Merged { comments, .. } = timeout(Duration::from_secs(10), events.recv())
            .await
            .context("no comment event within 10s")?
            .context("event stream closed")?;
        if let Some(comment) = comments.into_iter().find(|c| wanted(c)) {
            return Ok(comment);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = DemoArgs::parse();
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();

    let alice = peer(&hub, &network, "alice").await?;
    let bob = peer(&hub, &network, "bob").await?;
    let mut alice_events = alice.events().await?;
    let mut bob_events = bob.events().await?;

    println!("alice {}", alice.peer_id());
    println!("bob   {}", bob.peer_id());

    alice.join_room(&args.room).await?;
    let offered = bob.join_room(&args.room).await?;
    println!("bob joined {} and offered channels to {} peer(s)", args.room, offered.len());

    // Channels open asynchronously; wait until both sides see each other.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while alice.room_peers(&args.room).await.is_empty() || bob.room_peers(&args.room).await.is_empty() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "peers never connected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let first = alice.post_comment(&args.room, &args.text, None, None).await?;
    let got = wait_for(&mut bob_events, |c| c.id == first.id).await?;
    println!("bob received {}: {:?}", got.id, got.text);

    let reply = bob.post_comment(&args.room, "hi alice", None, Some(first.id)).await?;
    let got = wait_for(&mut alice_events, |c| c.id == reply.id).await?;
    println!("alice received {} (reply to {:?}): {:?}", got.id, got.reply_to, got.text);

    bob.vote(&first.id).await?;
    let got = wait_for(&mut alice_events, |c| c.id == first.id && c.upvotes() > 0).await?;
    println!("alice sees {} with {} upvote(s)", got.id, got.upvotes());

    let stats = alice.get_stats().await?;
    println!(
        "alice: {} peer(s), {} comment(s), {} gossiped",
        stats.connected_peers, stats.comments_stored, stats.messages_gossiped
    );

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
