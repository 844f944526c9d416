use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use rand::seq::IndexedRandom;
use tracing_subscriber::EnvFilter;

use heartgrid::types::format_elapsed;
use heartgrid::{
    AttachMode, MemoryStore, RemoteStore, RoomId, Session, Settings, SystemClock, TOTAL_TILES,
    config, server,
};

#[derive(Parser, Debug)]
#[command(name = "heartgrid", version, about = "Find the hidden tile, together")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay store.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join a room as a bot and reveal cells until the target is found.
    Play {
        #[arg(short, long)]
        room: String,
        #[arg(short, long)]
        name: String,
        /// Create the room if it does not exist.
        #[arg(long)]
        create: bool,
        #[arg(short, long)]
        server: Option<String>,
        /// Games to play; this bot resets the room between games.
        #[arg(long, default_value_t = 1)]
        rounds: u32,
        #[arg(long, default_value_t = 300)]
        think_min_ms: u64,
        #[arg(long, default_value_t = 1200)]
        think_max_ms: u64,
    },
    /// Print a fresh room id.
    NewRoom,
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    config::init()?;
    let settings = config::load_settings()?;

    match args.command {
        Command::Serve { port } => {
            let port = match port {
                Some(port) => port,
                None => config::port()?,
            };
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
            server::serve(listener, Arc::new(MemoryStore::new())).await?;
        }
        Command::Play {
            room,
            name,
            create,
            server,
            rounds,
            think_min_ms,
            think_max_ms,
        } => {
            let url = server.unwrap_or_else(config::server_url);
            let think = think_min_ms..=think_max_ms.max(think_min_ms);
            play(&settings, &url, &room, &name, create, rounds, think).await?;
        }
        Command::NewRoom => {
            println!("{}", RoomId::generate());
        }
    }

    Ok(())
}

async fn play(
    settings: &Settings,
    url: &str,
    room: &str,
    name: &str,
    create: bool,
    rounds: u32,
    think: std::ops::RangeInclusive<u64>,
) -> heartgrid::Result<()> {
    let room_id = RoomId::parse(room)?;
    let timeout = Duration::from_millis(settings.request_timeout_millis);
    let store = Arc::new(RemoteStore::connect(url, timeout).await?);
    let mode = if create { AttachMode::Create } else { AttachMode::Join };

    let session = Session::open(store, settings, Arc::new(SystemClock), &room_id, name, mode).await?;

    for round in 1..=rounds.max(1) {
        let view = session.wait_until(|v| !v.is_finished()).await?;
        let epoch = view.room.as_ref().map(|r| r.epoch).unwrap_or_default();
        tracing::info!("Round {} in room {} (epoch {})", round, room_id, epoch);

        loop {
            let view = session.view();
            if view.is_finished() {
                break;
            }

            let pause = rand::rng().random_range(think.clone());
            tokio::time::sleep(Duration::from_millis(pause)).await;

            let hidden: Vec<usize> = match &session.view().room {
                Some(room) => (0..TOTAL_TILES).filter(|i| !room.revealed[*i]).collect(),
                None => continue,
            };
            let Some(&index) = hidden.choose(&mut rand::rng()) else {
                break;
            };

            if let Err(e) = session.reveal(index).await {
                // Same reveal is safe to retry on the next pass.
                tracing::warn!("Reveal of {} failed: {}", index, e);
            }
        }

        let view = session.view();
        if let Some(room) = &view.room {
            let names: Vec<&str> = view.players.iter().map(|p| p.display_name.as_str()).collect();
            tracing::info!(
                "Round {} won by {} in {} (players: {})",
                round,
                room.winner.as_deref().unwrap_or("nobody"),
                format_elapsed(room.elapsed),
                names.join(", ")
            );
        }

        if round < rounds {
            if create {
                tokio::time::sleep(Duration::from_secs(2)).await;
                session.reset().await?;
            } else {
                session
                    .wait_until(|v| v.room.as_ref().is_some_and(|r| r.epoch > epoch))
                    .await?;
            }
        }
    }

    session.leave().await
}
