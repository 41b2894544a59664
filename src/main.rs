// ABOUTME: Main entry point for the code-box CLI
// Runs local files in a sandboxed session, forwarding stdin as input and printing output

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use code_box::config::AppConfig;
use code_box::docker::StreamKind;
use code_box::models::{IsolationRuntime, SessionProfile};
use code_box::protocol::FileRecord;
use code_box::{OutputChunk, SessionId, SessionService};
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "code-box", version, about = "Run code in sandboxed, interactive container sessions")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload files into a fresh session, run the entry file and attach to it
    Run {
        /// Session profile (python, node, shell)
        #[arg(short, long, default_value = "python")]
        profile: SessionProfile,

        /// Isolation runtime (default, gvisor, kata)
        #[arg(short, long)]
        runtime: Option<IsolationRuntime>,

        /// Sandbox image, overriding the profile's image
        #[arg(short, long)]
        image: Option<String>,

        /// Files to upload; the profile's entry file must be among them
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = AppConfig::load().context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            profile,
            runtime,
            image,
            files,
        } => {
            if let Some(runtime) = runtime {
                config.runtime = runtime;
            }
            if image.is_some() {
                config.image = image;
            }
            run_session(&config, profile, &files).await
        }
        Command::Config { json } => {
            let rendered = if json {
                serde_json::to_string_pretty(&config)?
            } else {
                config.to_toml()?
            };
            println!("{}", rendered);
            Ok(())
        }
    }
}

async fn run_session(config: &AppConfig, profile: SessionProfile, paths: &[PathBuf]) -> Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid file name: {}", path.display()))?;
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let file = FileRecord::from_bytes(name, &bytes, profile.payload_encoding())?;
        files.push((file.filename().to_string(), file.content().to_string()));
    }

    let service = Arc::new(
        SessionService::connect(config)
            .await
            .context("Failed to connect to Docker")?,
    );

    let id = service.start_session(profile).await?;
    info!("Session {} started", id);

    let result = drive_session(Arc::clone(&service), id, files).await;

    if let Err(e) = service.terminate_session(id).await {
        warn!("Failed to terminate session {}: {}", id, e);
    }
    result
}

async fn drive_session(
    service: Arc<SessionService>,
    id: SessionId,
    files: Vec<(String, String)>,
) -> Result<()> {
    service.upsert_files(id, files).await?;

    // Attach before starting so no early output is missed
    let mut output = service.output_stream(id).await?;
    service.start_program(id).await?;

    let input_service = Arc::clone(&service);
    let input_task = tokio::spawn(async move {
        let mut lines = UnboundedReceiverStream::new(spawn_line_reader(BufReader::new(io::stdin())));
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if let Err(e) = input_service.send_input(id, line).await {
                warn!("Failed to send input: {}", e);
                break;
            }
        }
    });

    let end = pump_output(&mut output, tokio::signal::ctrl_c(), |chunk| {
        if chunk.kind == StreamKind::Stderr {
            eprint!("{}", chunk.text);
            Ok(())
        } else {
            print!("{}", chunk.text);
            io::stdout().flush()
        }
    })
    .await;

    match &end {
        Ok(OutputEnd::Finished) => info!("Output of session {} ended", id),
        Ok(OutputEnd::Interrupted) => info!("Interrupted, stopping session {}", id),
        Err(_) => {}
    }

    input_task.abort();
    output.cancel();
    end.map(|_| ())
}

/// Read lines on a plain OS thread and forward them over a channel.
///
/// A read blocked on a terminal cannot be cancelled; on its own thread it
/// never holds up runtime shutdown, and it dies with the process.
fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<io::Result<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in reader.lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[derive(Debug, PartialEq, Eq)]
enum OutputEnd {
    Finished,
    Interrupted,
}

/// Hand every output chunk to `on_chunk` until the output ends or `interrupt` fires.
async fn pump_output<S, I, F>(output: &mut S, interrupt: I, mut on_chunk: F) -> Result<OutputEnd>
where
    S: Stream<Item = OutputChunk> + Unpin,
    I: Future,
    F: FnMut(OutputChunk) -> io::Result<()>,
{
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(chunk) => on_chunk(chunk)?,
                None => return Ok(OutputEnd::Finished),
            },
            _ = &mut interrupt => return Ok(OutputEnd::Interrupted),
        }
    }
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::prelude::*;

    let default_filter = if verbose { "code_box=debug" } else { "code_box=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
