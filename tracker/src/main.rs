//! Databuddy Tracker - command-line harness.
//!
//! This binary drives a [`Tracker`] over an in-memory page whose storage is
//! kept in files, so identity survives between runs the way it would in a
//! browser profile.
//!
//! # Commands
//!
//! - `databuddy-tracker track`: Report one event and flush
//! - `databuddy-tracker replay <file.jsonl>`: Feed recorded events, then flush
//! - `databuddy-tracker identity`: Print the anonymous and session ids
//!
//! # Environment Variables
//!
//! See the [`config`](databuddy_tracker::config) module for available
//! configuration options.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use databuddy_tracker::config::TrackerOptions;
use databuddy_tracker::delivery::SpawnedBeacon;
use databuddy_tracker::host::{BrowsingContext, StaticPage};
use databuddy_tracker::storage::FileStore;
use databuddy_tracker::tracker::{Dispatch, ErrorDetails, Tracker, PAGE_VIEW_EVENT};
use databuddy_tracker::types::Properties;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// File holding indefinite-lifetime identity state.
const LOCAL_STORE_FILE: &str = "local.json";

/// File holding session-scoped identity state.
const SESSION_STORE_FILE: &str = "session.json";

/// Databuddy Tracker - telemetry collection and delivery engine.
///
/// Reports events for a simulated page to a Databuddy collector.
#[derive(Parser, Debug)]
#[command(name = "databuddy-tracker")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    DATABUDDY_CLIENT_ID        Site identifier (required unless --config is given)
    DATABUDDY_API_URL          Collector URL (default: https://basket.databuddy.cc)
    DATABUDDY_SAMPLING_RATE    Keep probability per event (default: 1.0)
    DATABUDDY_ENABLE_RETRIES   Retry transient failures (default: false)
    DATABUDDY_SKIP_PATTERNS    Comma-separated path patterns to skip
    DATABUDDY_MASK_PATTERNS    Comma-separated path patterns to mask

EXAMPLES:
    # Report a page view
    export DATABUDDY_CLIENT_ID=my-site
    databuddy-tracker --url https://example.com/pricing track

    # Report a named event with properties
    databuddy-tracker track --name signup -p plan=pro -p seats=3

    # Replay a recorded session
    databuddy-tracker replay session.jsonl
")]
struct Cli {
    /// Page URL the events are reported for.
    #[arg(long, global = true, default_value = "https://localhost/")]
    url: Url,

    /// Document title of the page.
    #[arg(long, global = true)]
    title: Option<String>,

    /// Document referrer of the page.
    #[arg(long, global = true)]
    referrer: Option<String>,

    /// JSON options file (camelCase keys). Overrides environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding identity state (default: platform data directory).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Report one event and flush.
    Track {
        /// Event name.
        #[arg(long, default_value = PAGE_VIEW_EVENT)]
        name: String,

        /// Event property as key=value; values are parsed as JSON when possible.
        #[arg(short, long = "property", value_parser = parse_property)]
        properties: Vec<(String, Value)>,

        /// Send immediately to `POST /` instead of batching.
        #[arg(long)]
        now: bool,
    },

    /// Feed events from a JSON-lines file, then flush.
    ///
    /// Each line is an object with a "type" of page_view, event, vital,
    /// error, custom or navigate.
    Replay {
        /// JSON-lines file to read.
        file: PathBuf,
    },

    /// Print the anonymous and session ids.
    Identity,
}

/// One line of a replay file.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayRecord {
    PageView,
    Event {
        name: String,
        #[serde(default)]
        properties: Properties,
    },
    Vital {
        metric: String,
        value: f64,
    },
    Error {
        message: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        lineno: Option<u32>,
        #[serde(default)]
        colno: Option<u32>,
        #[serde(default)]
        stack: Option<String>,
        #[serde(default)]
        error_type: Option<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        properties: Properties,
    },
    Navigate {
        path: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let options = load_options(cli.config.as_deref())?;
    let state_dir = state_directory(cli.state_dir)?;
    let page = Arc::new(build_page(&cli.url, cli.title, cli.referrer, &state_dir)?);

    let host: Arc<dyn BrowsingContext> = page.clone();
    let tracker = Tracker::new(options, Some(host)).context("Failed to create tracker")?;

    match cli.command {
        Command::Track {
            name,
            properties,
            now,
        } => run_track(&tracker, &name, properties.into_iter().collect(), now).await?,
        Command::Replay { file } => run_replay(&tracker, &page, &file)?,
        Command::Identity => {
            println!("anonymous_id: {}", tracker.anonymous_id());
            println!("session_id:   {}", tracker.session_id());
            return Ok(());
        }
    }

    let remaining = tracker
        .shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
        .await;
    if remaining > 0 {
        bail!("{remaining} events were not delivered");
    }
    Ok(())
}

/// Runs the track command.
async fn run_track(tracker: &Tracker, name: &str, properties: Properties, now: bool) -> Result<()> {
    let dispatch = if now {
        tracker
            .track_now(name, properties)
            .await
            .context("Failed to send event")?
    } else {
        tracker.track(name, properties)
    };

    report(name, &dispatch);
    Ok(())
}

/// Runs the replay command.
fn run_replay(tracker: &Tracker, page: &StaticPage, file: &Path) -> Result<()> {
    let reader = BufReader::new(
        fs::File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );

    let mut replayed = 0usize;
    let mut invalid = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", file.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let record: ReplayRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping invalid replay record");
                invalid += 1;
                continue;
            }
        };

        let dispatch = match record {
            ReplayRecord::PageView => tracker.track_page_view(),
            ReplayRecord::Event { name, properties } => tracker.track(&name, properties),
            ReplayRecord::Vital { metric, value } => tracker.track_vital(&metric, value),
            ReplayRecord::Error {
                message,
                filename,
                lineno,
                colno,
                stack,
                error_type,
            } => tracker.track_error(
                &message,
                ErrorDetails {
                    filename,
                    lineno,
                    colno,
                    stack,
                    error_type,
                },
            ),
            ReplayRecord::Custom { name, properties } => tracker.track_custom(&name, properties),
            ReplayRecord::Navigate { path } => {
                if let Err(e) = page.navigate(&path) {
                    warn!(line = index + 1, error = %e, "Skipping navigation");
                    invalid += 1;
                } else {
                    tracker.notify_route_change(&path);
                }
                continue;
            }
        };

        if let Dispatch::Skipped(reason) = &dispatch {
            info!(line = index + 1, %reason, "Event skipped");
        }
        replayed += 1;
    }

    info!(replayed, invalid, "Replay finished");
    Ok(())
}

fn report(name: &str, dispatch: &Dispatch) {
    match dispatch {
        Dispatch::Queued(kind) => println!("{name}: queued ({})", kind.name()),
        Dispatch::SentDirect => println!("{name}: sent"),
        Dispatch::Skipped(reason) => println!("{name}: skipped ({reason})"),
    }
}

/// Loads options from `config` when given, otherwise from the environment.
fn load_options(config: Option<&Path>) -> Result<TrackerOptions> {
    match config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let options: TrackerOptions = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            options.validate().context("Invalid tracker options")?;
            Ok(options)
        }
        None => TrackerOptions::from_env().context("Failed to load configuration"),
    }
}

/// Gets the identity state directory from the argument or the platform
/// default, creating it if needed.
fn state_directory(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => dir,
        None => ProjectDirs::from("cc", "databuddy", "databuddy-tracker")
            .context("Failed to determine data directory")?
            .data_dir()
            .to_path_buf(),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir)
}

fn build_page(
    url: &Url,
    title: Option<String>,
    referrer: Option<String>,
    state_dir: &Path,
) -> Result<StaticPage> {
    let beacon = SpawnedBeacon::new().context("Failed to create beacon client")?;

    let mut page = StaticPage::new(url.clone())
        .with_local_storage(Some(Arc::new(FileStore::new(state_dir.join(LOCAL_STORE_FILE)))))
        .with_session_storage(Some(Arc::new(FileStore::new(
            state_dir.join(SESSION_STORE_FILE),
        ))))
        .with_beacon(Arc::new(beacon));
    if let Some(title) = title {
        page = page.with_title(title);
    }
    if let Some(referrer) = referrer {
        page = page.with_referrer(referrer);
    }
    Ok(page)
}

/// Parses a `key=value` property; the value is JSON when it parses as JSON
/// and a string otherwise.
fn parse_property(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty property name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Initializes the tracing subscriber for logging.
///
/// Logs go to stderr so command output on stdout stays clean. `json`
/// switches to one JSON object per line for log shippers.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
    });
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .init();
}
