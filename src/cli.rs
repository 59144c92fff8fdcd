//! Command-line surface for markbridge.
//!
//! Wraps the core's `Bridge` ops facade: status, config get/set, the
//! connection loop, a one-shot legacy HTTP push, and the debug
//! timeline.

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use markbridge_core::bookmarks::{BookmarkNode, BookmarkStore, MemoryBookmarkStore};
use markbridge_core::storage::JsonFileKv;
use markbridge_core::sync::{
    bookmark_event_channel, run_capture_pump, Bridge, BridgeClient, PushOutcome, SyncEngine,
    TokioConnector,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "markbridge")]
#[command(about = "Sync a managed bookmark subtree with a note bridge", long_about = None)]
struct Cli {
    /// Path to the persistent store file (default: ~/.markbridge/store.json)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connection and queue status
    Status,

    /// Show or update the bridge configuration
    Config {
        /// WebSocket endpoint of the bridge
        #[arg(long)]
        ws_url: Option<String>,

        /// HTTP payload endpoint of the bridge
        #[arg(long)]
        url: Option<String>,

        /// Bridge access token
        #[arg(long)]
        token: Option<String>,

        /// Client id presented to the bridge
        #[arg(long)]
        client_id: Option<String>,

        /// Keep a connection up automatically
        #[arg(long)]
        auto_sync: Option<bool>,
    },

    /// Run the bridge connection loop against a bookmarks file
    Run {
        /// Bookmarks JSON file kept in sync with the bridge
        #[arg(long)]
        bookmarks: PathBuf,
    },

    /// Push queued reverse events over the legacy HTTP endpoint
    Sync,

    /// Show the debug timeline
    Events {
        /// Clear the timeline instead of printing it
        #[arg(long)]
        clear: bool,
    },
}

fn store_path(cli: &Cli) -> PathBuf {
    cli.store.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".markbridge")
            .join("store.json")
    })
}

async fn open_bridge(path: &PathBuf, bookmarks: Arc<MemoryBookmarkStore>) -> Result<Bridge, Box<dyn Error>> {
    let kv = Arc::new(JsonFileKv::open(path).await?);
    let engine = SyncEngine::load(kv, bookmarks).await?;
    Ok(Bridge::new(engine))
}

/// Parse arguments and dispatch.
pub async fn run() -> CliResult {
    let cli = Cli::parse();
    let path = store_path(&cli);

    match cli.command {
        Commands::Status => handle_status(&path).await,
        Commands::Config {
            ws_url,
            url,
            token,
            client_id,
            auto_sync,
        } => handle_config(&path, ws_url, url, token, client_id, auto_sync).await,
        Commands::Run { bookmarks } => handle_run(&path, &bookmarks).await,
        Commands::Sync => handle_sync(&path).await,
        Commands::Events { clear } => handle_events(&path, clear).await,
    }
}

async fn handle_status(path: &PathBuf) -> CliResult {
    let bridge = open_bridge(path, Arc::new(MemoryBookmarkStore::new())).await?;
    let report = bridge.status().await;
    let session = &report.session;

    println!("Bridge Status");
    println!("=============");
    println!();
    println!("Connection: {:?}", session.status);
    if !session.ws_url.is_empty() {
        println!("Endpoint: {}", session.ws_url);
    }
    if !session.active_client_id.is_empty() {
        println!("Client: {}", session.active_client_id);
    }
    println!("Auto-sync: {}", if report.auto_sync { "on" } else { "off" });
    println!("Reconnect attempts: {}", session.reconnect_attempt);
    println!("Heartbeat: {} ms", session.heartbeat_ms);
    match &session.last_connected_at {
        Some(at) => println!("Last connected: {}", at),
        None => println!("Last connected: (never)"),
    }
    if let Some(err) = &session.last_error {
        println!("Last error: {}", err);
    }
    println!();
    println!("Reverse queue: {} event(s)", report.reverse_queue_len);
    println!(
        "In-process queues: {} inbound, {} outbound",
        session.queued_inbound, session.queued_outbound
    );
    Ok(())
}

async fn handle_config(
    path: &PathBuf,
    ws_url: Option<String>,
    url: Option<String>,
    token: Option<String>,
    client_id: Option<String>,
    auto_sync: Option<bool>,
) -> CliResult {
    let bridge = open_bridge(path, Arc::new(MemoryBookmarkStore::new())).await?;
    let mut settings = bridge.settings().await;

    let no_changes = ws_url.is_none()
        && url.is_none()
        && token.is_none()
        && client_id.is_none()
        && auto_sync.is_none();
    if no_changes {
        println!("Bridge Configuration");
        println!("====================");
        println!();
        println!("Auto-sync: {}", if settings.auto_sync { "on" } else { "off" });
        println!("Active client: {}", settings.active_client_id);
        for profile in &settings.profiles {
            println!();
            println!("Profile {}:", profile.client_id);
            println!("  ws: {}", markbridge_core::sync::config::sanitize_url(&profile.ws_url));
            println!("  http: {}", markbridge_core::sync::config::sanitize_url(&profile.url));
            println!("  token: {}", if profile.token.is_empty() { "(not set)" } else { "(set)" });
            println!("  enabled: {}  priority: {}", profile.enabled, profile.priority);
        }
        return Ok(());
    }

    if let Some(auto) = auto_sync {
        settings.auto_sync = auto;
    }
    if let Some(client_id) = client_id {
        settings.active_client_id = client_id;
    }
    // Edits land on the active profile (created if missing).
    let active_id = settings.active_client_id.clone();
    if !settings.profiles.iter().any(|p| p.client_id == active_id) {
        settings.profiles.push(markbridge_core::sync::ClientProfile {
            client_id: active_id.clone(),
            ..Default::default()
        });
    }
    let profile = settings
        .profiles
        .iter_mut()
        .find(|p| p.client_id == active_id)
        .expect("just ensured");
    if let Some(ws_url) = ws_url {
        profile.ws_url = ws_url;
    }
    if let Some(url) = url {
        profile.url = url;
    }
    if let Some(token) = token {
        profile.token = token;
    }

    bridge.update_settings(settings).await?;
    println!("Configuration updated.");
    Ok(())
}

async fn handle_run(path: &PathBuf, bookmarks_path: &PathBuf) -> CliResult {
    let store = Arc::new(MemoryBookmarkStore::new());
    match tokio::fs::read_to_string(bookmarks_path).await {
        Ok(contents) => {
            let nodes: Vec<BookmarkNode> = serde_json::from_str(&contents)?;
            store.load_nodes(&nodes);
            println!("Loaded {} bookmark node(s)", nodes.len());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("Starting with an empty bookmark tree");
        }
        Err(e) => return Err(e.into()),
    }

    let bridge = open_bridge(path, Arc::clone(&store)).await?;
    let engine = bridge.engine();

    let (observer, events) = bookmark_event_channel();
    store.set_observer(observer);

    let running = Arc::new(AtomicBool::new(true));
    let pump = tokio::spawn(run_capture_pump(
        Arc::clone(&engine),
        events,
        Arc::clone(&running),
    ));

    let client = BridgeClient::new(engine, TokioConnector);
    println!("Running; press Ctrl-C to stop.");
    tokio::select! {
        _ = client.run_persistent(Arc::clone(&running)) => {}
        _ = tokio::signal::ctrl_c() => {
            running.store(false, Ordering::SeqCst);
        }
    }
    pump.abort();
    store.clear_observer();

    // Write the tree back so the next run starts from what the bridge
    // last applied.
    let nodes = store.export_nodes();
    if let Some(parent) = bookmarks_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(bookmarks_path, serde_json::to_string_pretty(&nodes)?).await?;
    println!("Saved {} bookmark node(s)", nodes.len());
    Ok(())
}

async fn handle_sync(path: &PathBuf) -> CliResult {
    let bridge = open_bridge(path, Arc::new(MemoryBookmarkStore::new())).await?;
    bridge.trigger_sync().await?;
    match bridge.push_reverse_http().await? {
        PushOutcome::Empty => println!("Nothing queued."),
        PushOutcome::Acked { sent, applied } => {
            println!("Pushed {} event(s); {} applied.", sent, applied);
        }
    }
    Ok(())
}

async fn handle_events(path: &PathBuf, clear: bool) -> CliResult {
    let bridge = open_bridge(path, Arc::new(MemoryBookmarkStore::new())).await?;
    if clear {
        bridge.clear_debug_events().await?;
        println!("Timeline cleared.");
        return Ok(());
    }
    let events = bridge.debug_events().await;
    if events.is_empty() {
        println!("No debug events recorded.");
        return Ok(());
    }
    for entry in events {
        println!("{} [{}] {} {}", entry.at, entry.level, entry.event, entry.summary);
    }
    Ok(())
}
