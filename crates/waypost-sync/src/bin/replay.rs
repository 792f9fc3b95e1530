//! # Fix Log Replay
//!
//! Runs a recorded fix log through the tracker against an in-memory remote
//! store and prints the events that reached it. Handy for tuning the
//! confirmation settings against real traces.
//!
//! ## Usage
//! ```bash
//! # Zones as a JSON array of remote documents, fixes as JSON lines
//! cargo run -p waypost-sync --bin replay -- --zones zones.json --fixes trace.jsonl
//!
//! # Keep the local store around for inspection
//! cargo run -p waypost-sync --bin replay -- --zones zones.json --fixes trace.jsonl --db ./replay.db
//!
//! # Replay with the offline confirmation policy; events stay queued
//! cargo run -p waypost-sync --bin replay -- --zones zones.json --fixes trace.jsonl --offline
//! ```
//!
//! ## Fix Line Format
//! ```json
//! {"latitude": -23.5505, "longitude": -46.6333, "accuracy_m": 6.0, "timestamp": "2024-05-02T12:00:00Z"}
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::EnvFilter;

use waypost_core::geo::Fix;
use waypost_db::{Database, DbConfig};
use waypost_sync::{InMemoryRemoteStore, PresenceTracker, RecordingLocationProvider, TrackerConfig};

const REPLAY_TENANT: &str = "replay";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,waypost=debug,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let mut zones_path: Option<PathBuf> = None;
    let mut fixes_path: Option<PathBuf> = None;
    let mut db_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut offline = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--zones" | "-z" => {
                if i + 1 < args.len() {
                    zones_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--fixes" | "-f" => {
                if i + 1 < args.len() {
                    fixes_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--offline" => offline = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => eprintln!("Ignoring unknown argument: {other}"),
        }
        i += 1;
    }

    let (Some(zones_path), Some(fixes_path)) = (zones_path, fixes_path) else {
        print_help();
        return Err("--zones and --fixes are required".into());
    };

    let docs: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&zones_path)?)?;
    let fixes: Vec<Fix> = std::fs::read_to_string(&fixes_path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;

    let mut config = match config_path {
        Some(path) => TrackerConfig::load(Some(path))?,
        None => TrackerConfig::default(),
    };
    config.actor.tenant_id = Some(REPLAY_TENANT.to_string());

    let db_config = match db_path {
        Some(path) => DbConfig::new(path),
        None => DbConfig::in_memory(),
    };
    let db = Arc::new(Database::new(db_config).await?);

    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.set_zones(REPLAY_TENANT, docs).await;
    let location = Arc::new(RecordingLocationProvider::new());

    let tracker = PresenceTracker::open(config, db.clone(), remote.clone(), location.clone()).await?;

    let start = fixes.first().map(|f| f.timestamp).unwrap_or_else(chrono::Utc::now);
    tracker.resume_session(start).await?;
    let outcome = tracker.zones().refresh().await?;
    eprintln!("Zones: {outcome:?}");

    tracker.set_network_available(!offline).await?;

    for fix in fixes.iter().copied() {
        tracker.on_fix(fix).await?;
    }
    let drain = tracker.sync_now().await?;

    for stored in remote.events().await {
        println!("{}", serde_json::to_string(&stored)?);
    }

    eprintln!();
    eprintln!("Fixes replayed:     {}", fixes.len());
    eprintln!("Remote events:      {}", remote.write_count().await);
    eprintln!("Still queued:       {}", db.event_queue().count().await?);
    eprintln!("Profile changes:    {}", location.applied().await.len());
    eprintln!("Inside at the end:  {:?}", tracker.inside_zones().await);
    eprintln!("Final drain:        {drain:?}");

    db.lifecycle().mark_stopped(chrono::Utc::now()).await?;
    db.close().await;
    Ok(())
}

fn print_help() {
    println!("Waypost fix log replay");
    println!();
    println!("Usage: replay --zones <FILE> --fixes <FILE> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -z, --zones <FILE>    JSON array of zone documents");
    println!("  -f, --fixes <FILE>    JSON lines, one fix per line");
    println!("  -d, --db <PATH>       Local store (default: in memory)");
    println!("  -c, --config <FILE>   Tracker config (default: built-in defaults)");
    println!("      --offline         Replay with the offline policy; nothing is uploaded");
    println!("  -h, --help            Show this help message");
}
