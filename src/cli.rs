//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use media_relay::RunMode;

/// Download tracked media files and republish them to a Telegram channel.
///
/// Records are added as JSON Lines, downloaded with resume support, and
/// published one at a time. State lives in a SQLite database so every
/// command can be re-run safely.
#[derive(Parser, Debug)]
#[command(name = "media-relay")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// SQLite database file [default: media-relay.db]
    #[arg(long, global = true, env = "MEDIA_RELAY_DB")]
    pub db: Option<PathBuf>,

    /// Root directory for downloaded files [default: downloads]
    #[arg(long, global = true)]
    pub download_dir: Option<PathBuf>,

    /// Config file (defaults to $XDG_CONFIG_HOME/media-relay/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add discovered records from JSON Lines (stdin or --file)
    Add(AddArgs),
    /// Download pending files without publishing
    Download(DownloadArgs),
    /// Download and publish
    Run(RunArgs),
    /// Publish files that are already downloaded
    Publish(PublishArgs),
    /// Clear published flags (or failure counters) for a collection
    Reset(ResetArgs),
    /// Show per-collection counts
    Status(StatusArgs),
}

/// Arguments for `add`.
#[derive(ClapArgs, Debug)]
pub struct AddArgs {
    /// Collection the records belong to
    pub collection: String,

    /// JSON Lines file to read; `-` or omitted reads stdin
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

/// Download tuning shared by `download` and `run`.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct TransferArgs {
    /// Collection to process
    pub collection: String,

    /// Maximum concurrent downloads (1-32)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Attempts per download within one run (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: Option<u8>,

    /// Minimum delay between requests to the same origin in milliseconds (0 disables, max 60000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: Option<u64>,

    /// Deadline for one download attempt in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub download_timeout: Option<u64>,

    /// Process at most this many records
    #[arg(long)]
    pub limit: Option<u32>,
}

/// Bot API credentials.
#[derive(ClapArgs, Clone, Default)]
pub struct BotArgs {
    /// Telegram bot token
    #[arg(long, env = "MEDIA_RELAY_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// Channel or chat to publish to (e.g. @mychannel or -100123...)
    #[arg(long, env = "MEDIA_RELAY_CHAT_ID")]
    pub chat_id: Option<String>,

    /// Chat that receives progress messages
    #[arg(long, env = "MEDIA_RELAY_NOTIFY_CHAT_ID")]
    pub notify_chat_id: Option<String>,
}

impl std::fmt::Debug for BotArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotArgs")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_id", &self.chat_id)
            .field("notify_chat_id", &self.notify_chat_id)
            .finish()
    }
}

/// Arguments for `download`.
#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub transfer: TransferArgs,
}

/// Arguments for `run`.
#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Execution mode
    #[arg(short, long, value_enum)]
    pub mode: Option<RunMode>,

    /// Publish workers (0 downloads only, max 32)
    #[arg(short = 'u', long, value_parser = clap::value_parser!(u8).range(0..=32))]
    pub uploads: Option<u8>,

    /// Keep local files after publishing
    #[arg(long)]
    pub keep_files: bool,

    #[command(flatten)]
    pub bot: BotArgs,
}

/// Arguments for `publish`.
#[derive(ClapArgs, Debug)]
pub struct PublishArgs {
    /// Collection to publish
    pub collection: String,

    /// Publish at most this many records
    #[arg(long)]
    pub limit: Option<u32>,

    /// Keep local files after publishing
    #[arg(long)]
    pub keep_files: bool,

    #[command(flatten)]
    pub bot: BotArgs,
}

/// Arguments for `reset`.
#[derive(ClapArgs, Debug)]
pub struct ResetArgs {
    /// Collection to reset
    pub collection: String,

    /// Zero failure counters instead of clearing published flags
    #[arg(long)]
    pub failures: bool,
}

/// Arguments for `status`.
#[derive(ClapArgs, Debug)]
pub struct StatusArgs {
    /// Only this collection
    pub collection: Option<String>,
}
