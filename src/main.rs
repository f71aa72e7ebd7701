//! Interaction Recorder CLI
//!
//! Browser interaction sampling for research.

use anyhow::Context;
use clap::{Parser, Subcommand};
use interaction_recorder::{
    collector::{
        capture_for, serve_page_queries, Background, BrowserVendor, Dispatch, ExtensionMessage,
        MessagingProbe, ReportedPage, SharedInputTracker, UrlComponents, WebcamPermission,
    },
    config::Config,
    core::{AggregationLoop, CollectorContext, FlushOutcome, LoopState},
    normalize_url,
    transparency::create_shared_log_with_persistence,
    transport::{EndpointConfig, HttpTransport},
    PRIVACY_DECLARATION, VERSION,
};
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "interaction-recorder")]
#[command(version = VERSION)]
#[command(about = "Browser interaction recorder for research", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record extension messages read as JSON lines from stdin
    Record {
        /// User ID to record for (defaults to the enrolled user)
        #[arg(long)]
        user_id: Option<String>,

        /// Ingest server base URL (defaults to the configured one)
        #[arg(long)]
        server: Option<String>,

        /// Browser the messages come from (chromium or firefox)
        #[arg(long)]
        browser: Option<BrowserVendor>,
    },

    /// Submit the enrollment survey and store the assigned user ID
    Enroll {
        /// Survey answers as key=value
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        /// Ingest server base URL (defaults to the configured one)
        #[arg(long)]
        server: Option<String>,
    },

    /// Run the ingest server (configured through the environment / .env)
    #[cfg(feature = "server")]
    Serve,

    /// Reduce a URL to the given components
    NormalizeUrl {
        url: String,

        /// Components to keep (protocol, domain, path, query, fragment, all)
        #[arg(long, default_value = "protocol,domain")]
        keep: String,
    },

    /// Show current collection status
    Status,

    /// Display privacy declaration
    Privacy,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            user_id,
            server,
            browser,
        } => cmd_record(user_id, server, browser).await,
        Commands::Enroll { fields, server } => cmd_enroll(fields, server).await,
        #[cfg(feature = "server")]
        Commands::Serve => cmd_serve().await,
        Commands::NormalizeUrl { url, keep } => {
            cmd_normalize_url(&url, &keep);
            Ok(())
        }
        Commands::Status => {
            cmd_status();
            Ok(())
        }
        Commands::Privacy => {
            cmd_privacy();
            Ok(())
        }
        Commands::Config => {
            cmd_config();
            Ok(())
        }
    }
}

async fn cmd_record(
    user_id: Option<String>,
    server: Option<String>,
    browser: Option<BrowserVendor>,
) -> anyhow::Result<()> {
    println!("Interaction Recorder v{VERSION}");
    println!();

    let mut config = Config::load().unwrap_or_default();
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    let server_url = server.unwrap_or_else(|| config.server_url.clone());
    let browser = browser.unwrap_or(config.browser);
    let user_id = user_id.or_else(|| config.enrolled_user().map(String::from));

    let transport = HttpTransport::new(EndpointConfig::new(server_url.clone()))?;
    match transport.test_connection().await {
        Ok(true) => println!("  Server connection: OK"),
        Ok(false) => eprintln!("Warning: Server health check failed"),
        Err(e) => eprintln!("Warning: Could not connect to server: {e}"),
    }

    let log = create_shared_log_with_persistence(config.data_path.join("transparency.json"));
    let tracker = SharedInputTracker::new();
    let page = Arc::new(RwLock::new(ReportedPage::default()));
    let permission = WebcamPermission::new();
    let (probe, queries) = MessagingProbe::channel(64);
    let responder = tokio::spawn(serve_page_queries(queries, page.clone()));

    let context = CollectorContext {
        tracker: tracker.clone(),
        probe: Arc::new(probe.clone()),
        capture: capture_for(browser, permission.clone(), probe, page.clone()),
        transport: Arc::new(transport),
        log: log.clone(),
    };
    let background = Background::new(tracker, page, permission, log.clone());
    let mut aggregation = AggregationLoop::new(context);

    println!("Starting collection...");
    println!("  Server: {server_url}");
    println!("  Browser: {browser:?}");
    println!(
        "  Sampling every {}ms, sending every {}ms",
        config.collection.main_interval.as_millis(),
        config.collection.send_interval.as_millis()
    );
    match user_id.as_deref() {
        Some(id) => {
            aggregation.configure(id, config.collection.clone())?;
            println!("  User: {id}");
        }
        None => println!("  Not enrolled: waiting for a surveycompleted message"),
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    // Set up Ctrl+C handler
    let shutdown = CancellationToken::new();
    ctrlc_handler(shutdown.clone())?;

    let mut lines = spawn_line_reader(std::io::stdin());
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            None => {
                tracing::info!("stdin closed");
                break;
            }
            Some(Err(e)) => {
                tracing::error!("Failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: ExtensionMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed message: {e}");
                continue;
            }
        };

        if let Dispatch::Enrolled(id) = background.handle(message) {
            println!("Enrolled as {id}");
            config.user_id = Some(id.clone());
            if let Err(e) = config.save() {
                eprintln!("Warning: Could not save config: {e}");
            }
            if aggregation.state() == LoopState::Idle {
                aggregation.configure(&id, config.collection.clone())?;
            }
        }
    }

    // Stop collection
    println!();
    println!("Stopping collection...");
    match aggregation.stop().await? {
        FlushOutcome::Sent(n) => println!("Sent final batch of {n} samples"),
        FlushOutcome::Dropped(n) => eprintln!("Final batch of {n} samples could not be sent"),
        FlushOutcome::Empty => {}
    }
    responder.abort();

    // Save transparency log
    if let Err(e) = log.save() {
        eprintln!("Warning: Could not save transparency log: {e}");
    }

    // Final stats
    println!();
    println!("{}", log.summary());
    Ok(())
}

async fn cmd_enroll(fields: Vec<(String, String)>, server: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    let server_url = server.unwrap_or_else(|| config.server_url.clone());

    let transport = HttpTransport::new(EndpointConfig::new(server_url))?;
    let user_id = transport
        .enroll(&fields)
        .await
        .context("Enrollment failed")?;

    config.user_id = Some(user_id.clone());
    config.save().context("Could not save config")?;

    println!("Enrolled as {user_id}");
    println!("Run 'interaction-recorder record' to begin collecting data.");
    Ok(())
}

#[cfg(feature = "server")]
async fn cmd_serve() -> anyhow::Result<()> {
    use interaction_recorder::config::ServerSettings;
    use interaction_recorder::server::{run_with_state, ServerConfig, ServerState};

    dotenvy::dotenv().ok();
    let settings = ServerSettings::from_env()?;

    let state = Arc::new(ServerState::from_settings(&settings).await?);
    let (addr, shutdown_tx) =
        run_with_state(ServerConfig::from_settings(&settings), state.clone()).await?;
    println!("Interaction server listening on {addr}");
    println!("Press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    ctrlc_handler(shutdown.clone())?;
    shutdown.cancelled().await;

    let _ = shutdown_tx.send(());
    state.drain().await;
    Ok(())
}

fn cmd_normalize_url(url: &str, keep: &str) {
    let components = UrlComponents::from_csv(keep);
    match normalize_url(url, &components) {
        Some(normalized) => println!("{normalized}"),
        None => {
            eprintln!("Not a URL: {url}");
            std::process::exit(1);
        }
    }
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();

    println!("Interaction Recorder Status");
    println!("===========================");
    println!();

    println!("Configuration:");
    println!(
        "  Enrolled user: {}",
        config.enrolled_user().unwrap_or("not enrolled")
    );
    println!("  Server: {}", config.server_url);
    println!("  Browser: {:?}", config.browser);
    println!(
        "  Sampling interval: {}ms",
        config.collection.main_interval.as_millis()
    );
    println!(
        "  Webcam interval: {}ms",
        config.collection.emotions_interval.as_millis()
    );
    println!(
        "  Send interval: {}ms",
        config.collection.send_interval.as_millis()
    );
    println!();

    // Load and show transparency stats if available
    let stats_path = config.data_path.join("transparency.json");
    if stats_path.exists() {
        if let Ok(content) = std::fs::read_to_string(&stats_path) {
            if let Ok(stats) = serde_json::from_str::<serde_json::Value>(&content) {
                println!("Cumulative Statistics:");
                for (key, label) in [
                    ("messages_received", "Messages received"),
                    ("samples_collected", "Samples collected"),
                    ("frames_captured", "Webcam frames captured"),
                    ("batches_sent", "Batches sent"),
                    ("batches_dropped", "Batches dropped"),
                    ("samples_dropped", "Samples lost"),
                ] {
                    if let Some(value) = stats.get(key) {
                        println!("  {label}: {value}");
                    }
                }
            }
        }
    } else {
        println!("No previous session data found.");
    }
}

fn cmd_privacy() {
    println!("{PRIVACY_DECLARATION}");
}

fn cmd_config() {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    ctrlc::set_handler(move || shutdown.cancel()).context("Error setting Ctrl+C handler")
}

/// Read lines on a detached thread and forward them. A read blocked on an
/// open pipe must not hold runtime shutdown.
fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<std::io::Result<String>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let failed = line.is_err();
            if tx.blocking_send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Parse a `key=value` survey field.
fn parse_field(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    /// Blocks on read until its writer is dropped.
    struct OpenPipe(std::sync::mpsc::Receiver<()>);

    impl Read for OpenPipe {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_line_reader_forwards_lines_then_closes() {
        let mut lines = spawn_line_reader(Cursor::new(b"{\"type\":\"a\"}\n\nlast".to_vec()));
        assert_eq!(lines.recv().await.unwrap().unwrap(), "{\"type\":\"a\"}");
        assert_eq!(lines.recv().await.unwrap().unwrap(), "");
        assert_eq!(lines.recv().await.unwrap().unwrap(), "last");
        assert!(lines.recv().await.is_none());
    }

    #[test]
    fn test_runtime_shuts_down_with_reader_still_blocked() {
        let (writer, pipe) = std::sync::mpsc::channel::<()>();
        let started = std::time::Instant::now();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let stopped = runtime.block_on(async {
            let mut lines = spawn_line_reader(OpenPipe(pipe));
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.cancel();
            });
            tokio::select! {
                _ = shutdown.cancelled() => true,
                _ = lines.recv() => false,
            }
        });
        drop(runtime);

        assert!(stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(writer);
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("age=25"),
            Ok(("age".to_string(), "25".to_string()))
        );
        assert_eq!(
            parse_field("note=a=b"),
            Ok(("note".to_string(), "a=b".to_string()))
        );
        assert!(parse_field("=x").is_err());
        assert!(parse_field("novalue").is_err());
    }
}
