//! sone-cli: inspect identity documents and try out sync in-process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use sone::data::{Document, Post};
use sone::sync::wire::{decode_document, DecodedDocument};
use sone::sync::MemoryNetwork;
use sone::{SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "sone-cli")]
#[command(about = "Inspect identity documents and simulate document sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a document file and print a summary
    Inspect {
        file: PathBuf,
    },
    /// Print the effective configuration as JSON
    Config {
        /// Config file to load instead of the defaults
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Publish a document on one in-process node and follow it from another
    Simulate {
        #[arg(long, default_value_t = 2)]
        debounce_secs: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn format_time(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(|| millis.to_string(), |t| t.to_rfc3339())
}

fn print_summary(doc: &DecodedDocument) {
    println!("id:          {}", doc.id);
    println!("name:        {}", doc.name);
    println!("time:        {}", format_time(doc.time));
    if let Some(locator) = &doc.request_locator {
        println!("request-uri: {}", locator);
    }
    if doc.insert_locator.is_some() {
        println!("insert-uri:  (present)");
    }
    if let Some(full_name) = doc.profile.full_name() {
        println!("profile:     {}", full_name);
    }
    println!("posts:       {}", doc.posts.len());
    println!("replies:     {}", doc.replies.len());
    println!(
        "likes:       {} posts, {} replies",
        doc.liked_post_ids.len(),
        doc.liked_reply_ids.len()
    );
    println!("known:       {}", doc.known_documents.len());
    for known in &doc.known_documents {
        println!("  {} {} ({})", known.id, known.name, known.locator);
    }
    if !doc.missing_sections.is_empty() {
        println!("missing:     {}", doc.missing_sections.join(", "));
    }
}

async fn simulate(debounce_secs: u64, timeout_secs: u64) -> anyhow::Result<()> {
    let mut config = SyncConfig::default();
    config.inserter.debounce_secs = debounce_secs;
    config.inserter.tick_millis = 200;

    let network = MemoryNetwork::new();
    let publisher = SyncEngine::start(config.clone(), network.clone(), network.clone(), network.clone());
    let follower = SyncEngine::start(config, network.clone(), network.clone(), network.clone());

    let (insert, request) = MemoryNetwork::generate_identity("Sone");
    let doc = Document::generate();
    doc.set_name("Alice");
    doc.set_request_locator(request.clone())?;
    doc.set_insert_locator(insert)?;
    let local = publisher.add_local(doc).await?;
    let remote = follower.follow(local.id(), request)?;
    println!("node A publishes {}", local);

    local.add_post(Post::new(local.id(), "hello from node A"));
    println!("added a post, waiting for the {}s debounce", debounce_secs);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while remote.posts().is_empty() {
        if tokio::time::Instant::now() >= deadline {
            publisher.shutdown().await;
            follower.shutdown().await;
            bail!("post did not reach node B within {}s", timeout_secs);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!(
        "node B sees {} with {} post(s) at edition {}",
        remote,
        remote.posts().len(),
        remote
            .request_locator()
            .map_or(0, |locator| locator.suggested_edition())
    );
    for post in remote.posts() {
        println!("  [{}] {}", format_time(post.time), post.text);
    }

    publisher.shutdown().await;
    follower.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let doc = decode_document(&bytes, None)
                .with_context(|| format!("{} is not a valid document", file.display()))?;
            print_summary(&doc);
        }
        Command::Config { file } => {
            let config = match file {
                Some(path) => SyncConfig::from_json_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => SyncConfig::default(),
            };
            log::debug!("Effective config: {:?}", config);
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Simulate {
            debounce_secs,
            timeout_secs,
        } => simulate(debounce_secs, timeout_secs).await?,
    }
    Ok(())
}
