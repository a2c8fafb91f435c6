use a2s::QueryKind;
use cacher::challenge::{self, ChallengeCache};
use cacher::config::{Args, Config};
use cacher::handler::Handler;
use cacher::network::QueryServer;
use cacher::poller::Poller;
use cacher::response::ResponseCache;
use cacher::stats::{self, Stats};
use clap::Parser;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::watch;

/// Parses configuration, connects one poller per query kind to the game
/// server, then serves cached replies until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = Config::load(&args)?;
    debug!("Resolved configuration: {:?}", config);

    info!("Starting query cacher for game server {}", config.game_server);

    let challenges = Arc::new(ChallengeCache::new(
        config.challenge_ttl,
        config.max_challenge_codes,
        config.challenge_concurrency,
    ));
    let responses = Arc::new(ResponseCache::new());
    let stats = Arc::new(Stats::new(config.stats_pps, config.stats_bps));
    let handler = Arc::new(Handler::new(
        Arc::clone(&challenges),
        Arc::clone(&responses),
        Arc::clone(&stats),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for kind in QueryKind::ALL {
        let poller = match Poller::connect(kind, Arc::clone(&responses), &config).await {
            Ok(poller) => poller,
            Err(e) => {
                error!(
                    "Failed to set up {} poller for {}: {}",
                    kind.name(),
                    config.game_server,
                    e
                );
                return Err(e.into());
            }
        };
        tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));
    }

    tasks.push(tokio::spawn(challenge::run_sweeper(
        Arc::clone(&challenges),
        config.cleaner_interval,
        shutdown_rx.clone(),
    )));

    if stats.enabled() {
        tasks.push(tokio::spawn(stats::run_reporter(
            Arc::clone(&stats),
            shutdown_rx.clone(),
        )));
    }

    let server = QueryServer::bind(&config, handler)?;
    let mut server_task = tokio::spawn(server.run(shutdown_rx));

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut server_task => {
            if let Err(e) = result {
                error!("Server task panicked: {}", e);
            }
            let _ = shutdown_tx.send(true);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = shutdown_tx.send(true);
            let _ = (&mut server_task).await;
        }
    }

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
