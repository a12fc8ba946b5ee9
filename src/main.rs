//! Binary entrypoint for the meshchat CLI.
//!
//! Commands:
//! - `start` - run the sync layer, log the feed, send lines typed on stdin
//! - `init` - create a starter `config.toml`
//! - `probe [--timeout <s>]` - connect once and print a JSON summary
//!
//! See the library crate docs for module-level details: `meshchat::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use meshchat::config::Config;
use meshchat::logutil::preview;
use meshchat::meshcore::io::DeviceConnector;
use meshchat::meshcore::link::LinkOptions;
use meshchat::meshcore::{CompanionTarget, Connector, RadioLink};
use meshchat::model::{ConversationId, Snapshot};
use meshchat::provider::DataProvider;
use meshchat::sync::FeedEvent;
use meshchat::validation::validate_prefix;

#[derive(Parser)]
#[command(name = "meshchat")]
#[command(about = "Live chat state for MeshCore companion radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start syncing; type `/to <channel|prefix>` to pick a conversation, other lines are sent
    Start {
        /// Override companion.transport (bluetooth, serial, tcp, fake)
        #[arg(short, long)]
        transport: Option<String>,
        /// Override companion.endpoint
        #[arg(short, long)]
        endpoint: Option<String>,
        /// Override companion.device
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Write a starter configuration file
    Init,
    /// Connect once, read identity, channels and contacts, print JSON
    Probe {
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 15)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                warn!("{} already exists; leaving it untouched", cli.config);
                return Ok(());
            }
            Config::load_or_init(&cli.config, "config.example.toml").await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Start {
            transport,
            endpoint,
            device,
        } => {
            let mut config = Config::load_or_init(&cli.config, "config.example.toml").await?;
            if let Some(t) = transport {
                config.companion.transport = t;
            }
            if let Some(e) = endpoint {
                config.companion.endpoint = e;
            }
            if let Some(d) = device {
                config.companion.device = d;
            }
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshchat v{}", env!("CARGO_PKG_VERSION"));
            run(config).await?;
        }
        Commands::Probe { timeout } => {
            let config = Config::load(&cli.config).await.ok();
            init_logging(&config, cli.verbose);
            let config = config.unwrap_or_default();
            probe(&config, Duration::from_secs(timeout)).await?;
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let provider = DataProvider::from_config(&config);
    let mut feed = provider.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut target = ConversationId::channel("public");
    let mut stdin_open = true;
    info!(
        "Source: {} (connection {}); sending to {}",
        provider.provider_kind(),
        provider.connection_state(),
        target
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
            event = feed.recv() => match event {
                Some(event) => log_feed_event(&provider, event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_line(&provider, &mut target, line.trim_end()) {
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed; still syncing (Ctrl-C to stop)");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    if let Some(metrics) = provider.metrics() {
        info!("Session metrics: {}", serde_json::to_string(&metrics)?);
    }
    provider.shutdown().await;
    Ok(())
}

/// Returns false when the operator asked to quit.
fn handle_line(provider: &DataProvider, target: &mut ConversationId, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if line == "/quit" {
        return false;
    }
    if let Some(name) = line.strip_prefix("/to ") {
        match resolve_conversation(&provider.snapshot(), name.trim()) {
            Some(conversation) => {
                info!("Now sending to {}", conversation);
                provider.set_focus(Some(conversation.clone()));
                *target = conversation;
            }
            None => warn!("No channel or contact matches '{}'", preview(name, 32)),
        }
        return true;
    }
    if line == "/status" {
        let snap = provider.snapshot();
        info!(
            "{} source, connection {}, revision {}, {} channel(s), {} contact(s)",
            provider.provider_kind(),
            provider.connection_state(),
            snap.revision,
            snap.channels.len(),
            snap.contacts.len()
        );
        return true;
    }
    match provider.send(target, line) {
        Ok(key) => info!("Queued #{} to {}", key.seq, key.conversation),
        Err(e) => warn!("Send failed: {}", e),
    }
    true
}

fn resolve_conversation(snap: &Snapshot, name: &str) -> Option<ConversationId> {
    if let Some(channel) = snap.channel(name) {
        return Some(ConversationId::channel(channel.name.clone()));
    }
    if let Some(contact) = snap
        .contacts
        .iter()
        .find(|c| c.display_name.eq_ignore_ascii_case(name))
    {
        return Some(ConversationId::contact(&contact.prefix));
    }
    let prefix = validate_prefix(name).ok()?;
    snap.contacts
        .iter()
        .find(|c| c.matches(&prefix))
        .map(|c| ConversationId::contact(&c.prefix))
}

fn log_feed_event(provider: &DataProvider, event: FeedEvent) {
    match event {
        FeedEvent::State(update) => {
            let snap = provider.snapshot();
            for change in update.changes {
                if let meshchat::sync::Change::MessageAdded(key) = change {
                    if let Some(m) = snap.messages(&key.conversation).iter().find(|m| m.key == key) {
                        info!(
                            "[{}] {:?}: {}",
                            key.conversation,
                            m.sender,
                            preview(&m.body, 120)
                        );
                    }
                }
            }
        }
        FeedEvent::Connection(event) => info!("Connection: {:?}", event),
        FeedEvent::Notice(notice) => error!("Message #{} failed: {}", notice.key.seq, notice.error),
        FeedEvent::ProviderChanged(kind) => info!("Now showing {} data", kind),
        FeedEvent::Resync => warn!("Feed lagged; state re-read on next event"),
    }
}

async fn probe(config: &Config, limit: Duration) -> Result<()> {
    let target = CompanionTarget::from_config(&config.companion)?;
    let connector = DeviceConnector::new(LinkOptions {
        command_timeout: config.companion.command_timeout(),
        log_packets: config.companion.log_packets,
    });
    info!("Probing companion via {}", target);
    let started = std::time::Instant::now();
    let connection = tokio::time::timeout(limit, connector.connect(&target))
        .await
        .map_err(|_| anyhow!("no response from {} within {:?}", target, limit))??;
    let link: Arc<dyn RadioLink> = connection.link.clone();
    let metadata = tokio::time::timeout(limit, link.fetch_metadata()).await;
    link.disconnect().await;
    connector.release(&target).await;

    let (status, channels, contacts) = match metadata {
        Ok(Ok(m)) => ("ok", m.channels, m.contacts),
        Ok(Err(e)) => {
            warn!("Metadata fetch failed: {}", e);
            ("incomplete", Vec::new(), Vec::new())
        }
        Err(_) => ("incomplete", Vec::new(), Vec::new()),
    };
    let payload = serde_json::json!({
        "status": status,
        "transport": target.kind.to_string(),
        "endpoint": target.to_string(),
        "self": connection.self_info,
        "channels": channels.iter().map(|c| serde_json::json!({"index": c.index, "name": c.name})).collect::<Vec<_>>(),
        "contacts": contacts.iter().map(|c| serde_json::json!({"name": c.name, "public_key": c.public_key, "hops": c.hops})).collect::<Vec<_>>(),
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    if status != "ok" {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    // -v / -vv raise the level, never lower it
    let base_level = match verbosity {
        0 => configured,
        1 => configured.max(log::LevelFilter::Debug),
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.clone())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only in the foreground.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
