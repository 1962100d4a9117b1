use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use seymour_mesh::{CommentEvent, NetworkConfig, NetworkController, bind_signal_server};

#[derive(Parser, Debug)]
#[command(name = "seymour-mesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a signaling (rendezvous) server.
    Signal {
        #[arg(short, long, default_value = "127.0.0.1:8787")]
        bind: SocketAddr,
    },
    /// Run a comment node.
    Node {
        /// Signaling server URL; repeat for fallbacks, tried in order.
        #[arg(short = 's', long = "signal", value_name = "URL")]
        signal: Vec<String>,

        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        /// Address to offer peers instead of the bound one; repeatable.
        #[arg(short, long, value_name = "ADDR")]
        advertise: Vec<SocketAddr>,

        /// Persist identity, comments and DHT records here.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Page URL to join; repeatable.
        #[arg(short, long = "room", value_name = "URL")]
        rooms: Vec<String>,

        #[arg(short, long)]
        name: Option<String>,

        /// Post this comment to the first room after joining.
        #[arg(short, long)]
        post: Option<String>,

        #[arg(short = 'i', long, default_value = "300")]
        stats_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Signal { bind } => run_signal(bind).await,
        Command::Node {
            signal,
            bind,
            advertise,
            data_dir,
            rooms,
            name,
            post,
            stats_interval,
        } => {
            let mut config = NetworkConfig {
                bind_addr: bind,
                advertise_addrs: advertise,
                data_dir,
                display_name: name,
                ..NetworkConfig::default()
            };
            if !signal.is_empty() {
                config.signal_servers = signal;
            }
            run_node(config, rooms, post, Duration::from_secs(stats_interval.max(1))).await
        }
    }
}

async fn run_signal(bind: SocketAddr) -> Result<()> {
    let (addr, server) = bind_signal_server(bind).await?;
    info!(addr = %addr, "signaling server running");

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!("Received shutdown signal, exiting gracefully");
    server.abort();
    Ok(())
}

async fn run_node(
    config: NetworkConfig,
    rooms: Vec<String>,
    post: Option<String>,
    stats_interval: Duration,
) -> Result<()> {
    let controller = NetworkController::start(config).await?;
    info!("Node identity: {}", controller.peer_id().to_hex());
    let mut events = controller.events().await?;

    for room in &rooms {
        match controller.join_room(room).await {
            Ok(peers) => info!(room = %room, peers = peers.len(), "joined"),
            Err(e) => warn!(room = %room, error = %e, "join failed"),
        }
    }

    if let (Some(text), Some(room)) = (post, rooms.first()) {
        let comment = controller.post_comment(room, &text, None, None).await?;
        info!(comment = %comment.id, "posted");
    }

    let mut interval = time::interval(stats_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(CommentEvent::Merged { room_id, comments }) = events.recv() => {
                for comment in comments {
                    let author = comment.display_name.clone().unwrap_or_else(|| comment.author.to_string());
                    let marker = if comment.is_deleted() { " [deleted]" } else { "" };
                    println!("[{room_id}] {author} (+{}): {}{marker}", comment.upvotes(), comment.text);
                }
            }
            _ = interval.tick() => {
                match controller.get_stats().await {
                    Ok(stats) => info!(
                        connected = stats.connected_peers,
                        gossiped = stats.messages_gossiped,
                        relayed = stats.messages_relayed,
                        duplicates = stats.duplicates_dropped,
                        rejected = stats.verification_failures,
                        comments = stats.comments_stored,
                        routing = stats.routing_table_size,
                        records = stats.dht_records,
                        "stats snapshot"
                    ),
                    Err(e) => warn!(error = %e, "stats unavailable"),
                }
            }
        }
    }

    controller.shutdown().await;
    Ok(())
}
