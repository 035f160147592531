//! lanshare CLI
//!
//! Thin wrapper around lanshare-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Write a config file with defaults
//! lanshare config init
//!
//! # Run a node: announce, accept transfers, sync a save directory
//! lanshare serve --save game1=~/Games/Game1/saves
//!
//! # List peers seen on the LAN
//! lanshare peers list --wait 6
//!
//! # Push a package to a peer's transfer port
//! lanshare send 192.168.1.20:47101 ./photos
//!
//! # Browse a peer's library, or your own
//! lanshare library 192.168.1.20:47101
//!
//! # Measure throughput
//! lanshare speed-test 192.168.1.20:47101 --megabytes 64
//!
//! # Punch through NAT at an agreed time, then send
//! lanshare punch 203.0.113.7:40000 --local-port 40000 --at 2026-10-16T18:00:00Z --send ./photos
//!
//! # How likely is a punch between two NAT classes?
//! lanshare nat-advice restricted-cone symmetric
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use lanshare_core::logging::LoggingBuilder;
use lanshare_core::net::holepunch::{self, NatType};
use lanshare_core::savesync::SyncMode;
use lanshare_core::transfer::ApprovalRequest;
use lanshare_core::{LanShareNode, ShareConfig, TransferEvent, TransferResult};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

/// lanshare - LAN file sharing
#[derive(Parser)]
#[command(name = "lanshare")]
#[command(version = "0.1.0")]
#[command(about = "lanshare - LAN discovery, resumable transfers and save sync")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Root directory for data, received files and the library (default: ~/.lanshare)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Serve {
        /// Monitor a save directory, as ID=PATH (repeatable)
        #[arg(long = "save", value_name = "ID=PATH")]
        saves: Vec<String>,

        /// Accept incoming packages without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Send a file or directory to a peer
    Send {
        /// Peer transfer address (ip:port)
        peer: SocketAddr,
        /// File or directory to send
        path: PathBuf,
    },

    /// Peer management
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },

    /// Measure throughput to a peer
    SpeedTest {
        /// Peer transfer address (ip:port)
        peer: SocketAddr,
        /// Amount of test data
        #[arg(long, default_value = "16")]
        megabytes: u64,
    },

    /// List a peer's library, or the local one when no peer is given
    Library {
        /// Peer transfer address (ip:port)
        peer: Option<SocketAddr>,
    },

    /// Open a TCP connection through NAT by simultaneous open
    Punch {
        /// Peer's public endpoint
        remote: SocketAddr,
        /// Local port the NAT mapping was learned on
        #[arg(long)]
        local_port: u16,
        /// Go time: RFC 3339 or unix seconds
        #[arg(long)]
        at: String,
        /// Send this path over the punched connection
        #[arg(long)]
        send: Option<PathBuf>,
    },

    /// Estimate hole punch success for two NAT classes
    NatAdvice {
        /// open, full-cone, restricted-cone, symmetric or blocked
        local: NatType,
        /// open, full-cone, restricted-cone, symmetric or blocked
        remote: NatType,
    },

    /// Save version history
    Saves {
        #[command(subcommand)]
        action: SavesAction,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PeersAction {
    /// Listen for announces and list who was seen
    List {
        /// Seconds to listen before printing
        #[arg(long, default_value = "6")]
        wait: u64,
    },
    /// Register a peer that broadcasts cannot reach
    Add {
        /// Peer transfer address (ip:port)
        address: SocketAddr,
        /// Label shown in listings
        #[arg(long)]
        name: Option<String>,
    },
    /// Forget a manually added peer
    Remove {
        address: SocketAddr,
    },
}

#[derive(Subcommand)]
enum SavesAction {
    /// List stored versions of a save
    Versions { save_id: String },
    /// Put an old version back in place
    Restore { save_id: String, version: u64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let root = cli.data_dir.clone().unwrap_or_else(default_root);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join("config.json"));

    match cli.command {
        Commands::Config { action } => {
            setup_logging(cli.verbose, None);
            match action {
                ConfigAction::Init { force } => {
                    if config_path.exists() && !force {
                        bail!(
                            "{} already exists (use --force to overwrite)",
                            config_path.display()
                        );
                    }
                    let config = ShareConfig::with_root(&root);
                    config
                        .save(&config_path)
                        .with_context(|| format!("writing {}", config_path.display()))?;
                    println!("Wrote {}", config_path.display());
                    println!("  Device ID: {}", config.device_id);
                }
                ConfigAction::Show => {
                    let config = load_config(&root, &config_path)?;
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
            }
        }

        Commands::NatAdvice { local, remote } => {
            let likelihood = holepunch::estimate_success(local, remote);
            println!("Local NAT:  {:?}", local);
            println!("Remote NAT: {:?}", remote);
            println!(
                "Hole punch likelihood: {} (~{:.0}%)",
                likelihood,
                likelihood.probability() * 100.0
            );
        }

        Commands::Serve { saves, auto_accept } => {
            let mut config = load_config(&root, &config_path)?;
            config.auto_accept |= auto_accept;
            setup_logging(cli.verbose, Some((config.device_id.as_str(), config.data_dir.join("logs"))));

            let saves = saves
                .iter()
                .map(|s| parse_save_arg(s))
                .collect::<Result<Vec<_>>>()?;
            let node = LanShareNode::new(config).await?;
            serve(node, saves).await?;
        }

        Commands::Send { peer, path } => {
            if !path.exists() {
                bail!("{} does not exist", path.display());
            }
            let node = open_node(cli.verbose, &root, &config_path).await?;
            println!("Sending {} to {}...", path.display(), peer);
            let result = node.transfer().send_package(peer, &path).await;
            print_result(&result);
            if !result.success {
                tracing::warn!(
                    %peer,
                    transfer_id = %result.transfer_id,
                    error = result.error.as_deref().unwrap_or("unknown error"),
                    "Send failed"
                );
                bail!("send failed");
            }
            tracing::info!(
                %peer,
                transfer_id = %result.transfer_id,
                files = result.stats.files_transferred,
                skipped = result.stats.files_skipped,
                "Send finished"
            );
        }

        Commands::Peers { action } => {
            let node = open_node(cli.verbose, &root, &config_path).await?;
            match action {
                PeersAction::List { wait } => {
                    node.discovery().start().await?;
                    println!("Listening for {}s...", wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    let peers = node.discovery().peers();
                    node.discovery().stop().await;

                    if peers.is_empty() {
                        println!("No peers found.");
                    } else {
                        println!("Peers ({}):", peers.len());
                        for peer in peers {
                            println!();
                            println!("  {}", peer.label());
                            println!(
                                "    Device:  {}",
                                peer.device_id.as_deref().unwrap_or("(unknown)")
                            );
                            println!("    Items:   {}", peer.item_count);
                            if peer.manual {
                                println!("    Manual:  yes");
                            }
                            println!(
                                "    Seen:    {}",
                                peer.last_seen.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                    }
                }
                PeersAction::Add { address, name } => {
                    let peer = node.discovery().add_manual_peer(address, name)?;
                    println!("Added {}", peer.label());
                }
                PeersAction::Remove { address } => {
                    if node.discovery().remove_manual_peer(address)? {
                        println!("Removed {}", address);
                    } else {
                        println!("{} was not a manual peer", address);
                    }
                }
            }
        }

        Commands::SpeedTest { peer, megabytes } => {
            let node = open_node(cli.verbose, &root, &config_path).await?;
            let bytes = megabytes.max(1) * 1024 * 1024;
            println!("Sending {} MiB to {}...", megabytes.max(1), peer);
            let result = node.transfer().speed_test(peer, bytes).await?;
            println!(
                "{:.1} MiB/s ({} bytes in {:.2}s)",
                result.bytes_per_sec() / (1024.0 * 1024.0),
                result.bytes,
                result.elapsed.as_secs_f64()
            );
        }

        Commands::Library { peer } => {
            let node = open_node(cli.verbose, &root, &config_path).await?;
            let catalog = match peer {
                Some(peer) => node.transfer().list_peer_library(peer).await?,
                None => node.transfer().library_catalog().await?,
            };

            if catalog.items.is_empty() {
                println!("Library is empty.");
            } else {
                println!("Library ({} items):", catalog.items.len());
                for item in &catalog.items {
                    println!(
                        "  {:<32} {:>6} files  {}",
                        item.name,
                        item.file_count,
                        human_bytes(item.size)
                    );
                }
            }
        }

        Commands::Punch {
            remote,
            local_port,
            at,
            send,
        } => {
            let node = open_node(cli.verbose, &root, &config_path).await?;
            let go_time = parse_go_time(&at)?;
            if let Some(path) = &send {
                if !path.exists() {
                    bail!("{} does not exist", path.display());
                }
            }

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            println!("Punching to {} from port {}...", remote, local_port);
            let stream = holepunch::attempt_connect(remote, local_port, go_time, &cancel).await?;
            println!(
                "Connected: {} -> {}",
                stream.local_addr()?,
                stream.peer_addr()?
            );

            match send {
                Some(path) => {
                    let result = node.transfer().send_package_over(stream, &path).await;
                    print_result(&result);
                    if !result.success {
                        bail!("send failed");
                    }
                }
                None => {
                    // Act as the receiving side on the punched connection
                    let events = node.transfer().subscribe();
                    node.transfer().serve_connection(stream)?;
                    wait_for_transfer(events).await;
                }
            }
        }

        Commands::Saves { action } => {
            let node = open_node(cli.verbose, &root, &config_path).await?;
            match action {
                SavesAction::Versions { save_id } => {
                    let versions = node.saves().get_versions(&save_id)?;
                    if versions.is_empty() {
                        println!("No versions stored for {}.", save_id);
                    }
                    for v in versions {
                        println!(
                            "  v{:<4} {}  {:>4} files  {}  {}",
                            v.version,
                            v.created_at.format("%Y-%m-%d %H:%M:%S"),
                            v.file_count,
                            human_bytes(v.size),
                            v.clock
                        );
                    }
                }
                SavesAction::Restore { save_id, version } => {
                    let restored = node.saves().restore_version(&save_id, version).await?;
                    println!(
                        "Restored {} v{} as v{}",
                        save_id, version, restored.version
                    );
                }
            }
        }
    }

    Ok(())
}

/// Long-running node loop
async fn serve(node: LanShareNode, saves: Vec<(String, PathBuf)>) -> Result<()> {
    node.start().await?;

    for (save_id, path) in &saves {
        let state = node
            .saves()
            .start_monitoring(save_id, path, SyncMode::Automatic)
            .await
            .with_context(|| format!("monitoring save {}", save_id))?;
        println!("Monitoring save {} at {} ({})", save_id, path.display(), state.clock);
        tracing::info!(%save_id, path = %path.display(), clock = %state.clock, "Monitoring save");
        node.request_save_offers(save_id).await?;
    }

    println!("lanshare node running");
    println!("  Device ID: {}", node.device_id());
    if let Some(addr) = node.transfer().local_addr() {
        println!("  Transfers: {}", addr);
    }
    if let Some(addr) = node.discovery().local_addr() {
        println!("  Discovery: {}", addr);
    }
    println!("  Receiving into: {}", node.config().receive_dir.display());
    println!();
    println!("Press Ctrl+C to stop.");
    tracing::info!(device_id = %node.device_id(), saves = saves.len(), "Node serving");

    let mut discovery_events = node.discovery().subscribe();
    let mut transfer_events = node.transfer().subscribe();
    let mut save_events = node.saves().subscribe();
    let mut approvals = node.transfer().approval_requests();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received Ctrl+C, shutting down...");
                break;
            }
            Ok(event) = discovery_events.recv() => {
                println!("[Discovery] {}", event);
            }
            Ok(event) = transfer_events.recv() => {
                println!("[Transfer] {}", event);
            }
            Ok(event) = save_events.recv() => {
                println!("[Saves] {}", event);
            }
            Some(request) = next_approval(&mut approvals) => {
                let incoming = &request.transfer;
                println!(
                    "Incoming {} from {} ({} files, {}). Accept? [y/N]",
                    incoming.item_name,
                    incoming.peer_device,
                    incoming.total_files,
                    human_bytes(incoming.total_size)
                );
                let answer = stdin.next_line().await.ok().flatten().unwrap_or_default();
                if matches!(answer.trim(), "y" | "Y" | "yes") {
                    tracing::info!(item = %incoming.item_name, peer = %incoming.peer_device, "Transfer accepted");
                    request.accept();
                } else {
                    tracing::info!(item = %incoming.item_name, peer = %incoming.peer_device, "Transfer declined");
                    request.decline();
                }
            }
        }
    }

    node.stop().await;
    tracing::info!("Node stopped");
    println!("Goodbye.");
    Ok(())
}

async fn next_approval(
    approvals: &mut Option<tokio::sync::mpsc::Receiver<ApprovalRequest>>,
) -> Option<ApprovalRequest> {
    match approvals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Wait until a connection handed to `serve_connection` has finished
async fn wait_for_transfer(mut events: tokio::sync::broadcast::Receiver<TransferEvent>) {
    loop {
        match events.recv().await {
            Ok(event @ TransferEvent::Completed { .. })
            | Ok(event @ TransferEvent::Failed { .. }) => {
                println!("{}", event);
                break;
            }
            Ok(event) => println!("{}", event),
            Err(_) => break,
        }
    }
}

fn setup_logging(verbosity: u8, jsonl: Option<(&str, PathBuf)>) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "lanshare_core=debug,info",
        _ => "trace",
    };

    let builder = match jsonl {
        Some((node, logs_dir)) => LoggingBuilder::new(node).with_logs_dir(logs_dir),
        None => LoggingBuilder::new("lanshare"),
    };
    if let Err(e) = builder.with_filter(filter).init() {
        eprintln!("Logging setup failed: {}", e);
    }
}

/// Get the default root directory (~/.lanshare)
fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lanshare")
}

/// Config file if present, else defaults rooted at `root`
fn load_config(root: &Path, config_path: &Path) -> Result<ShareConfig> {
    if config_path.exists() {
        ShareConfig::load(config_path).with_context(|| format!("loading {}", config_path.display()))
    } else {
        Ok(ShareConfig::with_root(root))
    }
}

async fn open_node(verbose: u8, root: &Path, config_path: &Path) -> Result<LanShareNode> {
    let config = load_config(root, config_path)?;
    setup_logging(verbose, None);
    Ok(LanShareNode::new(config).await?)
}

/// Parse `ID=PATH`
fn parse_save_arg(s: &str) -> Result<(String, PathBuf)> {
    match s.split_once('=') {
        Some((id, path)) if !id.is_empty() && !path.is_empty() => {
            Ok((id.to_string(), PathBuf::from(path)))
        }
        _ => bail!("Invalid save '{}': expected ID=PATH", s),
    }
}

/// Parse a go time given as RFC 3339 or unix seconds
fn parse_go_time(s: &str) -> Result<SystemTime> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(UNIX_EPOCH + Duration::from_secs(secs));
    }
    let time = DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("Invalid go time '{}': {}", s, e))?;
    Ok(SystemTime::from(time.with_timezone(&Utc)))
}

fn print_result(result: &TransferResult) {
    if result.success {
        println!("Transfer {} complete", result.transfer_id);
        println!(
            "  Files sent:    {} ({})",
            result.stats.files_transferred,
            human_bytes(result.stats.bytes_transferred)
        );
        println!("  Files skipped: {}", result.stats.files_skipped);
        println!("  Elapsed:       {:.2}s", result.stats.elapsed.as_secs_f64());
    } else {
        println!(
            "Transfer {} failed: {}",
            result.transfer_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
