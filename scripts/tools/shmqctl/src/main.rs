use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use shmq::{ChannelAdmin, ChannelKind, ChannelStatus, ManagerConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Parser)]
#[command(name = "shmqctl")]
#[command(about = "Inspect and repair shared-memory channels")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Channel manager configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Environment overlay under `environments/`
    #[arg(long, global = true)]
    env: Option<String>,

    /// Override the shared-memory root directory
    #[arg(long, global = true)]
    shm_root: Option<PathBuf>,

    /// Override the journal directory
    #[arg(long, global = true)]
    journal_dir: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data and command segment pools
    InitPools,
    /// Create an empty channel
    Create {
        name: String,
        /// Slots, a power of two; the configured default when omitted
        #[arg(short = 'n', long, default_value = "0")]
        capacity: u32,
    },
    /// Drain a channel, free its messages and remove it
    Delete { name: String },
    /// Drop every queued message, keeping the channel
    Reset { name: String },
    /// Print queued messages without consuming them
    Dump(RangeArgs),
    /// Print journal entries between two positions
    DumpJournal(RangeArgs),
    /// Replay a channel's unacknowledged backlog from its journal
    Restore {
        channel: String,
        /// Slots if the channel has to be recreated
        #[arg(short = 'n', long, default_value = "0")]
        capacity: u32,
    },
    /// List channels and pools with their utilization
    Monitor {
        /// Refresh period in seconds
        #[arg(short, long, default_value = "1")]
        interval: u64,
        /// Print once and exit
        #[arg(long)]
        once: bool,
        /// One JSON document per refresh
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RangeArgs {
    /// Channel name
    name: String,
    /// First position, inclusive
    #[arg(short, long)]
    start: Option<u32>,
    /// Last position, exclusive
    #[arg(short, long)]
    end: Option<u32>,
    /// Print payloads as hex instead of text
    #[arg(long)]
    hex: bool,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global)?;
    let config = load_config(&cli.global)?;
    debug!("Using shm root {:?}", config.shm_root);
    let admin = ChannelAdmin::new(config);

    match cli.command {
        Commands::InitPools => {
            let (data, command) = admin.init_pools().context("Failed to create pools")?;
            println!(
                "✅ {} ({} segments), {} ({} segments)",
                data.name().green(),
                data.capacity(),
                command.name().green(),
                command.capacity()
            );
        }

        Commands::Create { name, capacity } => {
            let ring = admin
                .create_channel(&name, capacity)
                .with_context(|| format!("Failed to create channel {}", name))?;
            println!("✅ Created {} with {} slots", name.green(), ring.capacity());
        }

        Commands::Delete { name } => {
            let capacity = admin
                .delete_channel(&name)
                .with_context(|| format!("Failed to delete channel {}", name))?;
            println!("🗑  Deleted {} ({} slots)", name.green(), capacity);
        }

        Commands::Reset { name } => {
            let dropped = admin
                .reset_channel(&name)
                .with_context(|| format!("Failed to reset channel {}", name))?;
            println!("♻️  Reset {}, dropped {} messages", name.green(), dropped);
        }

        Commands::Dump(args) => {
            let entries = admin
                .dump_channel(&args.name, args.start, args.end)
                .with_context(|| format!("Failed to dump channel {}", args.name))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("{} is empty", args.name);
            } else {
                for entry in &entries {
                    let segment = entry
                        .segment
                        .map_or_else(|| "sealed".to_string(), |s| s.to_string());
                    println!(
                        "{:>10} {} {}",
                        entry.position.to_string().cyan(),
                        format!("[{}]", segment).dimmed(),
                        render::payload(&entry.payload, args.hex)
                    );
                }
            }
        }

        Commands::DumpJournal(args) => {
            let dump = admin
                .dump_journal(&args.name, args.start, args.end)
                .with_context(|| format!("Failed to read journal of {}", args.name))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&dump)?);
            } else {
                println!(
                    "📒 {} (mask {:#x}, generation {})",
                    dump.path.display().to_string().green(),
                    dump.mask,
                    dump.generation
                );
                render::endpoints("producers", &dump.producers);
                render::endpoints("consumers", &dump.consumers);
                for record in &dump.records {
                    let more = if record.has_more { " +more" } else { "" };
                    println!(
                        "{:>10} {}{} {}",
                        record.position.to_string().cyan(),
                        format!("{}B", record.len).dimmed(),
                        more.yellow(),
                        render::payload(&record.payload, args.hex)
                    );
                }
            }
        }

        Commands::Restore { channel, capacity } => {
            let restored = admin
                .restore_from_journal(&channel, capacity)
                .with_context(|| format!("Failed to restore {} from its journal", channel))?;
            println!("✅ Restored {} messages into {}", restored, channel.green());
        }

        Commands::Monitor {
            interval,
            once,
            json,
        } => loop {
            let channels = admin.list_channels().context("Failed to list channels")?;
            if json {
                println!("{}", serde_json::to_string(&channels)?);
            } else {
                print_channels(&channels);
            }
            if once {
                break;
            }
            thread::sleep(Duration::from_secs(interval.max(1)));
        },
    }

    Ok(())
}

fn init_logging(args: &GlobalArgs) -> Result<()> {
    let default = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn load_config(args: &GlobalArgs) -> Result<ManagerConfig> {
    let mut config = match &args.config {
        Some(path) => shmq_config::load_config(path, args.env.as_deref())
            .with_context(|| format!("Failed to load {:?}", path))?,
        None => ManagerConfig::default(),
    };
    if let Some(root) = &args.shm_root {
        config.shm_root = root.clone();
    }
    if let Some(dir) = &args.journal_dir {
        config.journal.dir = dir.clone();
    }
    Ok(config)
}

fn print_channels(channels: &[ChannelStatus]) {
    println!(
        "{:<32} {:>8} {:>10} {:>10} {:>8}",
        "NAME".bold(),
        "KIND".bold(),
        "USED".bold(),
        "CAPACITY".bold(),
        "USE%".bold()
    );
    for channel in channels {
        let kind = match channel.kind {
            ChannelKind::Channel => "channel",
            ChannelKind::Pool => "pool",
        };
        println!(
            "{:<32} {:>8} {:>10} {:>10} {}",
            channel.name.green(),
            kind,
            channel.used,
            channel.capacity,
            render::usage(channel.usage_percent)
        );
        for endpoint in &channel.producers {
            println!("    {} {}", "prod".dimmed(), render::endpoint(endpoint));
        }
        for endpoint in &channel.consumers {
            println!("    {} {}", "cons".dimmed(), render::endpoint(endpoint));
        }
    }
    println!();
}
