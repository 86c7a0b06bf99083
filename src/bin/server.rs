//! battlemat-server binary
//!
//! Loads the persisted map registry and image store, repairs image
//! refcounts, then serves the websocket hub until interrupted. A final
//! synchronous save runs on shutdown.
//!
//! ## Configuration (flags / env)
//!
//! | Key                  | Default          | Description                     |
//! |----------------------|------------------|---------------------------------|
//! | `BM_BIND`            | `127.0.0.1:9000` | Websocket listen address        |
//! | `BM_DATA_DIR`        | `data`           | Snapshot directory              |
//! | `BM_SAVE_INTERVAL`   | `60`             | Save interval in seconds        |
//! | `BM_MAP_WIDTH`       | `30`             | Grid width for new maps         |
//! | `BM_MAP_HEIGHT`      | `20`             | Grid height for new maps        |

use anyhow::Result;
use battlemat::imagestore::ImageStoreSnapshot;
use battlemat::persist::{self, DirtyFlag, Persister};
use battlemat::registry::RegistrySnapshot;
use battlemat::{ImageStore, MapRegistry, ServerHub};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "battlemat-server", about = "Battlemat Engine", version)]
struct Args {
    /// Websocket listen address
    #[arg(long, env = "BM_BIND", default_value = "127.0.0.1:9000")]
    bind: String,

    /// Snapshot directory
    #[arg(long, env = "BM_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Save interval in seconds
    #[arg(long, env = "BM_SAVE_INTERVAL", default_value_t = 60)]
    save_interval: i64,

    /// Grid width for newly created maps
    #[arg(long, env = "BM_MAP_WIDTH", default_value_t = 30)]
    map_width: i32,

    /// Grid height for newly created maps
    #[arg(long, env = "BM_MAP_HEIGHT", default_value_t = 20)]
    map_height: i32,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("battlemat=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let default_size = (args.map_width, args.map_height);

    log::info!(
        "Starting battlemat-server (bind='{}', data_dir='{}', save_interval={}s)",
        args.bind,
        args.data_dir.display(),
        args.save_interval,
    );

    // Restore persisted aggregates (each falls back to empty on its own).
    let registry = Arc::new(
        match persist::load_aggregate::<RegistrySnapshot>(&args.data_dir, persist::MAPS_AGGREGATE)
        {
            Some(snapshot) => MapRegistry::restore(snapshot, default_size),
            None => MapRegistry::new(default_size),
        },
    );
    let images = Arc::new(
        match persist::load_aggregate::<ImageStoreSnapshot>(
            &args.data_dir,
            persist::IMAGES_AGGREGATE,
        ) {
            Some(snapshot) => ImageStore::restore(snapshot),
            None => ImageStore::new(),
        },
    );
    log::info!(
        "loaded {} map(s), {} image(s)",
        registry.len(),
        images.len()
    );

    // Crash-consistency repair between the store and the bindings.
    registry.with_all_maps(|maps| images.repair(maps));

    // Background persistence
    let dirty = Arc::new(DirtyFlag::new());
    let (interval_tx, interval_rx) = watch::channel(args.save_interval);
    let persister = Persister::new(
        args.data_dir.clone(),
        registry.clone(),
        images.clone(),
        dirty.clone(),
    );
    let persist_handle = tokio::spawn(persister.run(interval_rx));

    // Hub
    let hub = Arc::new(ServerHub::new(registry, images, dirty));

    tokio::select! {
        result = hub.clone().run(&args.bind) => {
            log::error!("hub exited unexpectedly: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("battlemat-server shutting down (SIGINT)");
        }
    }

    // Interval ≤ 0 stops the loop after one final synchronous save.
    let _ = interval_tx.send(0);
    let _ = persist_handle.await;
    Ok(())
}
