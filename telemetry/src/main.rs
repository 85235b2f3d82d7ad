//! StudyTrail telemetry driver.
//!
//! Feeds interaction records from stdin or a file through the telemetry
//! pipeline. Useful for replaying captured sessions against a collector and
//! for exercising the flush behaviour without a browser.
//!
//! # Commands
//!
//! - `studytrail-telemetry run`: Read JSON lines from stdin until EOF or Ctrl+C
//! - `studytrail-telemetry replay <FILE>`: Read JSON lines from a file
//!
//! # Input
//!
//! One JSON object per line:
//!
//! ```text
//! {"type": "quiz_complete", "metadata": {"quizId": "q-1", "score": 0.9}}
//! {"visibility": "hidden"}
//! {"navigate": "https://learn.example.com/topics/3"}
//! ```
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use studytrail_telemetry::config::Config;
use studytrail_telemetry::context::{
    DeviceInfo, FileTokenStore, PageContext, ScreenResolution, TokenSource, TokenStore,
};
use studytrail_telemetry::telemetry::Telemetry;
use studytrail_telemetry::transport::{HttpTransport, MemoryTransport, Transport};
use studytrail_telemetry::types::{InteractionType, Visibility};

const ENV_PAGE_URL: &str = "STUDYTRAIL_PAGE_URL";
const ENV_VIEWPORT_WIDTH: &str = "STUDYTRAIL_VIEWPORT_WIDTH";
const ENV_SCREEN: &str = "STUDYTRAIL_SCREEN";
const ENV_USER_AGENT: &str = "STUDYTRAIL_USER_AGENT";
const ENV_LOG_FORMAT: &str = "STUDYTRAIL_LOG_FORMAT";

/// StudyTrail telemetry driver.
///
/// Captures learner interactions from JSON lines and delivers them to the
/// collector in batches.
#[derive(Parser, Debug)]
#[command(name = "studytrail-telemetry")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    STUDYTRAIL_COLLECTOR_URL        Collector URL (required for live deployments)
    STUDYTRAIL_DEPLOYMENT           live, static or demo (default: live)
    STUDYTRAIL_AUTH_TOKEN           Bearer token (overrides the token file)
    STUDYTRAIL_TOKEN_PATH           Token file (default: ~/.studytrail/token)
    STUDYTRAIL_FLUSH_INTERVAL_SECS  Timer flush period (default: 30)
    STUDYTRAIL_PAGE_URL             Initial page URL (default: /)
    STUDYTRAIL_VIEWPORT_WIDTH       Viewport width in pixels
    STUDYTRAIL_SCREEN               Screen resolution, e.g. 1920x1080
    STUDYTRAIL_LOG_FORMAT           Set to 'json' for JSON logs

EXAMPLES:
    # Replay a captured session without contacting the collector
    studytrail-telemetry replay session.jsonl --dry-run

    # Forward interactions from another process
    export STUDYTRAIL_COLLECTOR_URL=https://api.studytrail.dev
    produce-events | studytrail-telemetry run
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Read interaction lines from stdin.
    ///
    /// Runs until end of input or Ctrl+C, then performs a final flush.
    Run {
        /// Record batches in memory instead of sending them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Read interaction lines from a file.
    Replay {
        /// JSON lines file to replay.
        file: PathBuf,

        /// Record batches in memory instead of sending them.
        #[arg(long)]
        dry_run: bool,
    },
}

/// One line of driver input.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Interaction {
        #[serde(rename = "type")]
        interaction_type: InteractionType,
        #[serde(default)]
        metadata: Option<Value>,
    },
    Visibility {
        visibility: Visibility,
    },
    Navigate {
        navigate: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    match cli.command {
        Command::Run { dry_run } => runtime.block_on(run_session(None, dry_run)),
        Command::Replay { file, dry_run } => runtime.block_on(run_session(Some(file), dry_run)),
    }
}

/// Runs one telemetry session over the given input.
async fn run_session(input: Option<PathBuf>, dry_run: bool) -> Result<()> {
    init_logging();

    info!("Starting StudyTrail telemetry");

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        deployment = %config.deployment,
        collector_url = config.collector_url.as_deref().unwrap_or("-"),
        flush_interval_secs = config.flush_interval_secs,
        dry_run,
        "Configuration loaded"
    );

    let tokens = Arc::new(FileTokenStore::new(&config.token_path));
    log_token_source(&tokens);

    let recorder = Arc::new(MemoryTransport::new());
    let transport: Arc<dyn Transport> = match (&config.collector_url, dry_run) {
        (Some(url), false) => Arc::new(
            HttpTransport::new(url, tokens.clone()).context("Failed to create HTTP transport")?,
        ),
        _ => recorder.clone(),
    };

    let context = Arc::new(page_context_from_env());
    let telemetry = Telemetry::new(
        config.telemetry_config(),
        context.clone(),
        transport,
        tokens,
    );
    telemetry.start();

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => Box::new(BufReader::new(
            File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();

    info!(session_id = %telemetry.session_id(), "Session running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received");
                break;
            }

            line = lines.next_line() => {
                match line.context("Failed to read input")? {
                    Some(line) => handle_line(&telemetry, &context, &line),
                    None => {
                        debug!("End of input");
                        break;
                    }
                }
            }
        }
    }

    info!("Shutting down...");

    let unsent = telemetry.stop().await;
    if unsent > 0 {
        error!(unsent_events = unsent, "Some events could not be sent");
    }

    if dry_run {
        let batches = recorder.batches();
        info!(
            batches = batches.len(),
            events = batches.iter().map(Vec::len).sum::<usize>(),
            "Dry run finished"
        );
    }

    info!("Telemetry stopped");
    Ok(())
}

/// Applies one input line to the session. Malformed lines are skipped.
fn handle_line(telemetry: &Telemetry, context: &PageContext, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<InputLine>(line) {
        Ok(InputLine::Interaction {
            interaction_type,
            metadata,
        }) => telemetry.capture(interaction_type, metadata),
        Ok(InputLine::Visibility { visibility }) => telemetry.visibility_changed(visibility),
        Ok(InputLine::Navigate { navigate }) => {
            debug!(url = %navigate, "Navigated");
            context.navigate(navigate);
        }
        Err(e) => warn!(error = %e, "Skipping malformed input line"),
    }
}

/// Builds the page context from the driver's environment variables.
fn page_context_from_env() -> PageContext {
    let url = env::var(ENV_PAGE_URL).unwrap_or_else(|_| "/".to_string());

    let viewport_width = env::var(ENV_VIEWPORT_WIDTH)
        .ok()
        .and_then(|val| match val.trim().parse::<u32>() {
            Ok(width) => Some(width),
            Err(_) => {
                warn!(value = %val, "Ignoring invalid {ENV_VIEWPORT_WIDTH}");
                None
            }
        });

    let screen = env::var(ENV_SCREEN)
        .ok()
        .and_then(|val| match val.parse::<ScreenResolution>() {
            Ok(screen) => Some(screen),
            Err(e) => {
                warn!(value = %val, error = %e, "Ignoring invalid {ENV_SCREEN}");
                None
            }
        });

    let user_agent = env::var(ENV_USER_AGENT).unwrap_or_else(|_| {
        format!("studytrail-telemetry/{}", env!("CARGO_PKG_VERSION"))
    });

    PageContext::new(url).with_device(DeviceInfo {
        viewport_width,
        user_agent: Some(user_agent),
        screen,
    })
}

/// Logs where the bearer token comes from, without logging the token.
fn log_token_source(tokens: &FileTokenStore) {
    match tokens.load_with_source() {
        Some((_, TokenSource::EnvironmentVariable)) => {
            if tokens.path().exists() {
                info!(
                    ignored_path = %tokens.path().display(),
                    "Token file exists but STUDYTRAIL_AUTH_TOKEN takes precedence"
                );
            }
            info!(source = "environment", "Authentication token loaded");
        }
        Some((_, TokenSource::File(path))) => {
            info!(source = "file", path = %path.display(), "Authentication token loaded");
        }
        None => {
            warn!(
                path = %tokens.path().display(),
                "No authentication token yet, events will be held until one is available"
            );
        }
    }
    debug!(has_token = tokens.has_token(), "Token store ready");
}

/// Initializes the logging subsystem.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var(ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interaction_line() {
        let line: InputLine =
            serde_json::from_str(r#"{"type": "quiz_complete", "metadata": {"score": 1}}"#)
                .unwrap();
        assert!(matches!(
            line,
            InputLine::Interaction { interaction_type: InteractionType::QuizComplete, metadata: Some(_) }
        ));
    }

    #[test]
    fn parses_interaction_without_metadata() {
        let line: InputLine = serde_json::from_str(r#"{"type": "page_view"}"#).unwrap();
        assert!(matches!(
            line,
            InputLine::Interaction { metadata: None, .. }
        ));
    }

    #[test]
    fn parses_visibility_and_navigation() {
        let line: InputLine = serde_json::from_str(r#"{"visibility": "hidden"}"#).unwrap();
        assert!(matches!(
            line,
            InputLine::Visibility { visibility: Visibility::Hidden }
        ));

        let line: InputLine = serde_json::from_str(r#"{"navigate": "/topics"}"#).unwrap();
        assert!(matches!(line, InputLine::Navigate { ref navigate } if navigate == "/topics"));
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(serde_json::from_str::<InputLine>(r#"{"visibility": "dim"}"#).is_err());
        assert!(serde_json::from_str::<InputLine>(r#"{"foo": 1}"#).is_err());
    }
}
