//! Roomdrop - room-based peer-to-peer file transfer

use anyhow::Result;
use clap::{Parser, Subcommand};
use roomdrop_client::config::Config;
use roomdrop_client::session::{Session, SessionEvent};
use roomdrop_client::store::ChunkStore;
use roomdrop_client::transfer::FlowControl;
use roomdrop_core::channel::mem::MemNetwork;
use roomdrop_core::signal::mem::MemHub;
use roomdrop_core::{ConnectionState, TransferStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "roomdrop")]
#[command(about = "Room-based peer-to-peer file transfer", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.roomdrop/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and data directory
    Init,

    /// List stored transfers
    List,

    /// Assemble a completed transfer into a file
    Export {
        /// Transfer id
        #[arg(required = true)]
        id: String,

        /// Output path (defaults to the stored filename)
        #[arg(short, long)]
        output: Option<String>,

        /// Keep the stored transfer instead of deleting it after export
        #[arg(long)]
        keep: bool,
    },

    /// Delete a transfer's metadata and chunks
    Delete {
        /// Transfer id
        #[arg(required = true)]
        id: String,
    },

    /// Check stored transfers for chunk-count mismatches
    Sweep,

    /// Run an in-process loopback transfer between two sessions
    Demo {
        /// Path to the file to transfer
        #[arg(required = true)]
        file: String,
    },

    /// Show status and statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = load_config(&cli);

    match cli.command {
        Commands::Init => init_config(&config)?,
        Commands::List => list_transfers(&config)?,
        Commands::Export { id, output, keep } => export_transfer(&config, &id, output, keep)?,
        Commands::Delete { id } => delete_transfer(&config, &id)?,
        Commands::Sweep => sweep(&config)?,
        Commands::Demo { file } => run_demo(&config, &file).await?,
        Commands::Status => show_status(&config)?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Config {
    let config_path = expand_path(&cli.config);
    let mut config = if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not read config, using defaults");
            Config::default()
        })
    } else {
        Config::default()
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    config
}

fn expand_path(path: &str) -> PathBuf {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

fn open_store(config: &Config) -> Result<ChunkStore> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    Ok(ChunkStore::open(&data_dir.join("transfers.db"))?)
}

fn init_config(config: &Config) -> Result<()> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let config_path = data_dir.join("config.toml");
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    let toml = toml::to_string_pretty(config)?;
    std::fs::write(&config_path, toml)?;
    std::fs::create_dir_all(data_dir.join("exports"))?;

    println!("Initialized roomdrop at: {}", data_dir.display());
    Ok(())
}

fn list_transfers(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let transfers = store.list_all_metadata()?;
    if transfers.is_empty() {
        println!("No stored transfers.");
        return Ok(());
    }
    for meta in transfers {
        let chunks = store.chunk_count(&meta.id)?;
        println!(
            "{}  {}  {} bytes  {}  {}  chunks {}/{}",
            meta.id,
            meta.name,
            meta.size,
            meta.direction.as_str(),
            meta.status.as_str(),
            chunks,
            meta.total_chunks,
        );
    }
    Ok(())
}

fn export_transfer(config: &Config, id: &str, output: Option<String>, keep: bool) -> Result<()> {
    let store = open_store(config)?;
    let Some(meta) = store.get_metadata(id)? else {
        anyhow::bail!("No transfer with id {}", id);
    };
    let Some(bytes) = store.assemble_completed(id)? else {
        anyhow::bail!(
            "Transfer {} is incomplete ({}/{} chunks)",
            id,
            store.chunk_count(id)?,
            meta.total_chunks
        );
    };

    let output_path = output.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(&meta.name));
    std::fs::write(&output_path, &bytes)?;
    println!(
        "Exported {} ({} bytes) to {}",
        meta.name,
        bytes.len(),
        output_path.display()
    );

    if !keep {
        store.delete_metadata(id)?;
        store.delete_chunks(id)?;
        println!("Removed stored transfer {}", id);
    }
    Ok(())
}

fn delete_transfer(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config)?;
    store.delete_metadata(id)?;
    store.delete_chunks(id)?;
    println!("Deleted transfer {}", id);
    Ok(())
}

fn sweep(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let flipped = store.integrity_sweep()?;
    println!("Integrity sweep complete: {} transfer(s) marked as errored", flipped);
    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    println!("roomdrop v{}", env!("CARGO_PKG_VERSION"));
    println!("Data directory: {}", config.data_dir().display());

    let store = open_store(config)?;
    let transfers = store.list_all_metadata()?;
    let completed = transfers
        .iter()
        .filter(|m| m.status == TransferStatus::Completed)
        .count();
    println!(
        "Stored transfers: {} ({} completed)",
        transfers.len(),
        completed
    );
    Ok(())
}

/// Two in-process sessions join a room and move one file end to end
async fn run_demo(config: &Config, file: &str) -> Result<()> {
    let path = expand_path(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let hub = MemHub::new();
    let network = MemNetwork::new();
    let room = roomdrop_core::mint_transfer_id();
    let flow = FlowControl {
        high_water: config.transfer.buffer_high_water,
    };

    // The sender keeps its bookkeeping in memory; the receiver persists to
    // the regular store so `list`/`export` can see the result afterwards
    let sender_store = Arc::new(Mutex::new(ChunkStore::open_in_memory()?));
    let receiver_store = Arc::new(Mutex::new(open_store(config)?));

    let (sender, mut sender_handle) = Session::new(
        hub.client("alice"),
        network
            .connector("alice")
            .with_low_water(config.transfer.buffer_low_water),
        sender_store,
        &room,
        config.transfer.chunk_size,
        flow,
    );
    let (receiver, mut receiver_handle) = Session::new(
        hub.client("bob"),
        network
            .connector("bob")
            .with_low_water(config.transfer.buffer_low_water),
        receiver_store,
        &room,
        config.transfer.chunk_size,
        flow,
    );
    let sender_task = tokio::spawn(sender.run());
    let receiver_task = tokio::spawn(receiver.run());

    println!("Demo room: {}", room);

    // Wait for the sender to see both members, then dial
    while let Some(event) = sender_handle.next_event().await {
        if let SessionEvent::RoomClients(clients) = event {
            if clients.contains(&"bob".to_string()) {
                sender_handle.dial("bob");
                break;
            }
        }
    }

    // Wait for the connection, then start the transfer
    while let Some(event) = sender_handle.next_event().await {
        if let SessionEvent::ConnectionState { sid, state } = &event {
            if sid == "bob" && *state == ConnectionState::Connected {
                sender_handle.send_file("bob", &path);
                break;
            }
        }
    }

    // Print sender progress until it reports done
    while let Some(event) = sender_handle.next_event().await {
        match event {
            SessionEvent::Transfer(ev) => {
                println!("sent {:.2}%", ev.progress);
                if ev.progress >= 100.0 {
                    break;
                }
            }
            SessionEvent::TransferFailed { reason, .. } => {
                anyhow::bail!("Transfer failed: {}", reason);
            }
            _ => {}
        }
    }

    // Wait for the receiver to persist the completed transfer
    let mut transfer_id = None;
    while let Some(event) = receiver_handle.next_event().await {
        match event {
            SessionEvent::Transfer(ev) if ev.metadata.status == TransferStatus::Completed => {
                println!(
                    "received {} ({} bytes, {} chunks) as transfer {}",
                    ev.metadata.name, ev.metadata.size, ev.metadata.total_chunks, ev.metadata.id
                );
                transfer_id = Some(ev.metadata.id);
                break;
            }
            SessionEvent::TransferFailed { reason, .. } => {
                anyhow::bail!("Receive failed: {}", reason);
            }
            _ => {}
        }
    }

    sender_handle.shutdown();
    receiver_handle.shutdown();
    let _ = sender_task.await;
    let _ = receiver_task.await;

    if let Some(id) = transfer_id {
        println!("Export it with: roomdrop export {}", id);
    }
    Ok(())
}
