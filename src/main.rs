use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tokio::sync::{broadcast, mpsc};

use dx_coedit::presence::{LogRenderer, OverlayRegistry};
use dx_coedit::{server, telemetry, CollabConfig, CollabSession, DocumentEvent, RetryPolicy};
use dx_coedit::{Edit, SiteId, WsGateway};

#[derive(Parser)]
#[command(name = "coedit")]
#[command(about = "Real-time collaborative editing: a WebSocket relay and a headless session observer", version)]
#[command(after_help = "Coedit Features:
- Convergent text replicas: edits integrate in any delivery order
- Optimistic local edits with background sending and backpressure
- Automatic resync by operation replay or full snapshot
- Live cursor and pointer presence with liveness expiry

Start a relay with 'coedit serve', then point editors (or 'coedit watch') at ws://<host>:<port>/ws.")]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Session configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the collaboration relay
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },

    /// Join a session and print document and presence changes
    Watch {
        /// Relay endpoint, e.g. ws://localhost:3000/ws
        url: String,

        /// Resume as this site id
        #[arg(long)]
        site: Option<u64>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<CollabConfig> {
    match path {
        Some(path) => CollabConfig::load(path),
        None => Ok(CollabConfig::default()),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Serve { port } => {
            println!(
                "{}",
                format!("🌐 Starting relay on port {}...", port).cyan().bold()
            );
            server::start(port, config).await?;
        }

        Commands::Watch { url, site } => {
            println!("{}", "👁  Joining collaborative session...".cyan().bold());
            watch(&url, site.map(SiteId::new), config).await?;
        }
    }

    Ok(())
}

async fn watch(url: &str, site: Option<SiteId>, config: CollabConfig) -> Result<()> {
    let (gateway, mut inbound) =
        WsGateway::connect(url, site, &config, &RetryPolicy::default()).await?;
    let mut session = CollabSession::new(gateway, config);
    println!(
        "{} Connected as {}",
        "✓".green(),
        session.site().to_string().bright_yellow()
    );

    let mut documents = session.subscribe_document();
    let mut presence = session.subscribe_presence();
    let printer = tokio::spawn(async move {
        let mut overlays = OverlayRegistry::new(LogRenderer);
        loop {
            tokio::select! {
                event = documents.recv() => match event {
                    Ok(event) => print_document_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        println!("{} {} document events skipped", "!".yellow(), missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                change = presence.recv() => match change {
                    Ok(change) => overlays.apply(&change),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    session.join();

    // headless: no local editor feeds this session
    let (_local_tx, mut local_rx) = mpsc::unbounded_channel();
    tokio::select! {
        _ = session.run(&mut inbound, &mut local_rx) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    session.disconnect();

    let (text, revision) = session.snapshot();
    drop(session);
    let _ = printer.await;

    println!(
        "{} Left session at revision {} ({} chars)",
        "✓".green(),
        revision.to_string().bright_white(),
        text.chars().count()
    );
    Ok(())
}

fn print_document_event(event: &DocumentEvent) {
    match event {
        DocumentEvent::Applied {
            site,
            revision,
            edits,
        } => {
            let (inserted, deleted) = edits.iter().fold((0, 0), |(ins, del), edit| match edit {
                Edit::Insert { text, .. } => (ins + text.chars().count(), del),
                Edit::Delete { length, .. } => (ins, del + length),
            });
            println!(
                "  {} rev {} from {}: {} {}",
                "✎".bright_blue(),
                revision,
                site.to_string().bright_yellow(),
                format!("+{}", inserted).green(),
                format!("-{}", deleted).red()
            );
        }
        DocumentEvent::Reset { revision, text } => {
            println!(
                "  {} rev {}: resynchronized ({} chars)",
                "⟳".bright_magenta(),
                revision,
                text.chars().count()
            );
        }
    }
}
