//! CLI entry point for media-relay.

use std::fs::{self, File, OpenOptions};
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use fs2::FileExt;
use media_relay::{
    BatchSummary, BotApi, BotApiNotifier, BotApiPublisher, Database, DiskSpaceMonitor, HttpClient,
    LOCK_FILE_NAME, LogNotifier, NewFileRecord, Notifier, Orchestrator, PipelineConfig,
    PublishError, PublishGate, PublishReceipt, PublishRequest, Publisher, RateLimiter,
    RecordStore, RetryPolicy, TransferEngine,
};
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use app_config::{FileConfig, load_file_config};
use cli::{
    AddArgs, Args, BotArgs, Command, PublishArgs, ResetArgs, RunArgs, StatusArgs, TransferArgs,
};

const DEFAULT_DB_PATH: &str = "media-relay.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = load_file_config(args.config.as_deref())?.unwrap_or_default();
    let db_path = args
        .db
        .clone()
        .or_else(|| file_config.database.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let store = open_store(&db_path, &file_config).await?;

    match args.command {
        Command::Add(add) => run_add(&store, &add).await,
        Command::Download(download) => {
            let mut config = pipeline_config(&file_config, args.download_dir, &download.transfer);
            config.upload_concurrency = 0;
            config.validate().context("Invalid configuration")?;
            let _lock = acquire_run_lock(&config.download_dir)?;
            let orchestrator = build_orchestrator(store, &db_path, config, None)?;
            let summary = orchestrator
                .download_only(&download.transfer.collection)
                .await?;
            report(&summary);
            Ok(())
        }
        Command::Run(run) => {
            run_pipeline(store, &db_path, &file_config, args.download_dir, &run).await
        }
        Command::Publish(publish) => {
            run_publish(store, &db_path, &file_config, args.download_dir, &publish).await
        }
        Command::Reset(reset) => run_reset(&store, &reset).await,
        Command::Status(status) => run_status(&store, &status).await,
    }
}

async fn open_store(db_path: &Path, file_config: &FileConfig) -> Result<RecordStore> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    let db = Database::new(db_path)
        .await
        .with_context(|| format!("Failed to open database '{}'", db_path.display()))?;
    let mut store = RecordStore::new(db);
    if let Some(max_attempts) = file_config.max_record_attempts {
        store = store.with_max_attempts(max_attempts);
    }
    Ok(store)
}

/// Layers defaults, the config file and CLI flags, in that order.
fn pipeline_config(
    file_config: &FileConfig,
    download_dir: Option<PathBuf>,
    transfer: &TransferArgs,
) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    file_config.apply(&mut config);

    if let Some(dir) = download_dir {
        config.download_dir = dir;
    }
    if let Some(concurrency) = transfer.concurrency {
        config.download_concurrency = usize::from(concurrency);
    }
    if let Some(retries) = transfer.max_retries {
        config.download_attempts = u32::from(retries);
    }
    if let Some(rate_limit) = transfer.rate_limit {
        config.origin_interval_ms = rate_limit;
    }
    if let Some(secs) = transfer.download_timeout {
        config.download_deadline = Some(Duration::from_secs(secs));
    }
    config.batch_limit = transfer.limit;
    config
}

async fn run_pipeline(
    store: RecordStore,
    db_path: &Path,
    file_config: &FileConfig,
    download_dir: Option<PathBuf>,
    run: &RunArgs,
) -> Result<()> {
    let mut config = pipeline_config(file_config, download_dir, &run.transfer);
    if let Some(mode) = run.mode {
        config.mode = mode;
    }
    if let Some(uploads) = run.uploads {
        config.upload_concurrency = usize::from(uploads);
    }
    if run.keep_files {
        config.delete_after_publish = false;
    }

    let bot = if config.publishes() {
        Some(resolve_bot(file_config, &run.bot, &mut config)?)
    } else {
        None
    };
    config.validate().context("Invalid configuration")?;

    let _lock = acquire_run_lock(&config.download_dir)?;
    let orchestrator = build_orchestrator(store, db_path, config, bot)?;
    let summary = orchestrator.run(&run.transfer.collection).await?;
    report(&summary);
    Ok(())
}

async fn run_publish(
    store: RecordStore,
    db_path: &Path,
    file_config: &FileConfig,
    download_dir: Option<PathBuf>,
    publish: &PublishArgs,
) -> Result<()> {
    let mut config = pipeline_config(
        file_config,
        download_dir,
        &TransferArgs {
            collection: publish.collection.clone(),
            limit: publish.limit,
            ..TransferArgs::default()
        },
    );
    config.upload_concurrency = config.upload_concurrency.max(1);
    if publish.keep_files {
        config.delete_after_publish = false;
    }
    let bot = resolve_bot(file_config, &publish.bot, &mut config)?;
    config.validate().context("Invalid configuration")?;

    let _lock = acquire_run_lock(&config.download_dir)?;
    let orchestrator = build_orchestrator(store, db_path, config, Some(bot))?;
    let summary = orchestrator.publish_only(&publish.collection).await?;
    report(&summary);
    Ok(())
}

/// Bot API client plus the optional progress chat.
struct BotSetup {
    api: BotApi,
    notify_chat_id: Option<String>,
}

fn resolve_bot(
    file_config: &FileConfig,
    bot: &BotArgs,
    config: &mut PipelineConfig,
) -> Result<BotSetup> {
    let Some(token) = bot.bot_token.as_deref().filter(|t| !t.trim().is_empty()) else {
        bail!("A bot token is required to publish (--bot-token or MEDIA_RELAY_BOT_TOKEN)");
    };
    if let Some(chat_id) = &bot.chat_id {
        config.publish.destination.clone_from(chat_id);
    }
    if config.publish.destination.trim().is_empty() {
        bail!("A chat id is required to publish (--chat-id, MEDIA_RELAY_CHAT_ID or `chat_id` in the config file)");
    }

    let mut api = BotApi::new(token).context("Failed to create Bot API client")?;
    if let Some(url) = &file_config.bot_api_url {
        api = api.with_base_url(url.clone());
    }
    Ok(BotSetup {
        api,
        notify_chat_id: bot
            .notify_chat_id
            .clone()
            .or_else(|| file_config.notify_chat_id.clone()),
    })
}

/// Stand-in publisher for download-only runs.
#[derive(Debug)]
struct NoPublisher;

#[async_trait]
impl Publisher for NoPublisher {
    async fn publish(&self, _request: PublishRequest) -> Result<PublishReceipt, PublishError> {
        Err(PublishError::Permanent("no bot token configured".to_string()))
    }
}

fn build_orchestrator(
    store: RecordStore,
    db_path: &Path,
    config: PipelineConfig,
    bot: Option<BotSetup>,
) -> Result<Orchestrator> {
    let client = HttpClient::new().context("Failed to create HTTP client")?;
    let policy = RetryPolicy::with_max_attempts(config.download_attempts);
    let limiter = if config.origin_interval_ms == 0 {
        debug!("rate limiting disabled");
        Arc::new(RateLimiter::disabled())
    } else {
        debug!(rate_limit_ms = config.origin_interval_ms, "rate limiting enabled");
        Arc::new(RateLimiter::from_millis(config.origin_interval_ms))
    };
    let engine = Arc::new(
        TransferEngine::new(client, policy, limiter)
            .with_attempt_deadline(config.download_deadline),
    );

    let monitor = Arc::new(
        DiskSpaceMonitor::new(&config.download_dir, &config.disk)
            .protect(db_path)
            .protect(config.download_dir.join(LOCK_FILE_NAME)),
    );

    let (publisher, notifier): (Arc<dyn Publisher>, Arc<dyn Notifier>) = match bot {
        Some(BotSetup {
            api,
            notify_chat_id,
        }) => {
            let notifier: Arc<dyn Notifier> = match notify_chat_id {
                Some(chat_id) => Arc::new(BotApiNotifier::new(api.clone(), chat_id)),
                None => Arc::new(LogNotifier),
            };
            (Arc::new(BotApiPublisher::new(api)), notifier)
        }
        None => (Arc::new(NoPublisher), Arc::new(LogNotifier)),
    };
    let gate = Arc::new(PublishGate::new(publisher, &config.publish));

    info!(
        download_dir = %config.download_dir.display(),
        mode = ?config.mode,
        downloads = config.download_concurrency,
        uploads = config.upload_concurrency,
        "pipeline configured"
    );
    Ok(Orchestrator::new(store, engine, gate, monitor, config).with_notifier(notifier))
}

/// Takes the per-directory run lock; held until the returned file is dropped.
fn acquire_run_lock(download_dir: &Path) -> Result<File> {
    fs::create_dir_all(download_dir)
        .with_context(|| format!("Failed to create '{}'", download_dir.display()))?;
    let path = download_dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "Another media-relay run is using '{}'",
            download_dir.display()
        )
    })?;
    Ok(file)
}

fn report(summary: &BatchSummary) {
    println!("{summary}");
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some records failed; re-run to retry them");
    }
}

async fn run_add(store: &RecordStore, add: &AddArgs) -> Result<()> {
    let input = match add.file.as_deref() {
        Some(path) if path != Path::new("-") => fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?,
        _ => {
            if io::stdin().is_terminal() {
                info!("No input provided. Pipe JSON Lines via stdin or pass --file.");
                info!(r#"Example: echo '{{"page":"https://site/p/1","url":"https://cdn/1.mp4"}}' | media-relay add site"#);
                return Ok(());
            }
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    let (mut inserted, mut duplicates, mut invalid) = (0_usize, 0_usize, 0_usize);
    for (index, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: NewFileRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipped invalid record");
                invalid += 1;
                continue;
            }
        };
        match store.insert(&add.collection, &record).await? {
            Some(id) => {
                debug!(id, page = %record.page, "Record added");
                inserted += 1;
            }
            None => duplicates += 1,
        }
    }

    println!("{inserted} added, {duplicates} already tracked, {invalid} invalid");
    Ok(())
}

async fn run_reset(store: &RecordStore, reset: &ResetArgs) -> Result<()> {
    if reset.failures {
        let cleared = store.reset_failures(&reset.collection).await?;
        println!("{cleared} failure counters cleared in {}", reset.collection);
    } else {
        let cleared = store.reset_published(&reset.collection).await?;
        println!("{cleared} records marked unpublished in {}", reset.collection);
    }
    Ok(())
}

async fn run_status(store: &RecordStore, status: &StatusArgs) -> Result<()> {
    let collections = match &status.collection {
        Some(collection) => vec![collection.clone()],
        None => store.collections().await?,
    };
    if collections.is_empty() {
        println!("No records tracked");
        return Ok(());
    }

    for collection in collections {
        let counts = store.counts(&collection).await?;
        println!(
            "{collection}: {} total, {} pending download, {} awaiting publish, {} published, {} over attempt limit",
            counts.total,
            counts.pending_download,
            counts.awaiting_publish,
            counts.published,
            counts.over_attempt_limit
        );
    }
    Ok(())
}
