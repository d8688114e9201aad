use clap::Parser;
use log::{error, info};
use server::network::ServerResult;
use server::timers::Clock;
use server::{
    ActorOptions, Args, JsonFileStore, LocalBus, MemoryStore, RaceStore, RoomRegistry, Server,
    ServerConfig, StorageConfig,
};
use shared::Participant;
use std::sync::Arc;

/// Parses arguments, opens the configured store and serves until Ctrl+C.
#[tokio::main]
async fn main() -> ServerResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=debug for detailed logging");
    }

    let config = match ServerConfig::from_args(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    match config.storage.clone() {
        StorageConfig::Memory => {
            info!("Running with in-memory storage; rooms are lost on exit");
            run(config, Arc::new(MemoryStore::new())).await
        }
        StorageConfig::JsonDir(dir) => {
            info!("Persisting rooms under {}", dir.display());
            let store = JsonFileStore::open(dir).await?;
            run(config, Arc::new(store)).await
        }
    }
}

async fn run<S: RaceStore>(config: ServerConfig, store: Arc<S>) -> ServerResult<()> {
    let options = ActorOptions {
        countdown_interval: config.countdown_interval,
        race_timeout: config.race_timeout,
        clock: Clock::system(),
        finish_hook: Some(Arc::new(|p: &Participant| {
            info!(
                "{} finished: {:.2} wpm, {:.2}% accuracy",
                p.display_name,
                p.wpm.unwrap_or_default(),
                p.accuracy.unwrap_or_default()
            );
        })),
    };

    let registry = Arc::new(RoomRegistry::new(store, Arc::new(LocalBus::new()), options));
    let mut server = Server::new(&config, Arc::clone(&registry)).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    registry.close_all().await;
    Ok(())
}
