use std::error::Error;
use std::io::{self, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eventstream::http::{HttpEndpointConfig, PayloadSchema, PubSubHttpEndpoint};
use eventstream::{Clock, FilePersister, FilePersisterConfig, Stream, SystemClock};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "eventstream-cli", version, about = "Event stream tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Publish {
        log_path: PathBuf,
        message: String,
    },
    Tail {
        log_path: PathBuf,
        #[arg(long = "follow")]
        follow: bool,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    Inspect {
        log_path: PathBuf,
    },
    Serve {
        log_path: PathBuf,
        #[arg(long = "addr", default_value = "127.0.0.1:8008")]
        addr: String,
    },
}

/// A single demo event: free-text line plus the process that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LineEvent {
    message: String,
    pid: u32,
}

impl PayloadSchema for LineEvent {
    fn json_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" },
                "pid": { "type": "integer" }
            },
            "required": ["message", "pid"]
        })
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Publish { log_path, message } => cmd_publish(&log_path, message, &mut out)?,
        Commands::Tail {
            log_path,
            follow,
            limit,
        } => cmd_tail(&log_path, follow, limit, &mut out)?,
        Commands::Inspect { log_path } => cmd_inspect(&log_path, &mut out)?,
        Commands::Serve { log_path, addr } => cmd_serve(&log_path, &addr)?,
    }
    Ok(())
}

fn open_stream(log_path: &std::path::Path) -> Result<Arc<Stream<LineEvent>>, Box<dyn Error>> {
    let persister = Arc::new(FilePersister::<LineEvent>::open_with_config(
        log_path,
        FilePersisterConfig::default(),
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(Stream::new(persister, clock))
}

fn cmd_publish(
    log_path: &std::path::Path,
    message: String,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let stream = open_stream(log_path)?;
    let idxts = stream.publish(LineEvent {
        message,
        pid: std::process::id(),
    })?;
    writeln!(out, "published index={} us={}", idxts.index, idxts.us)?;
    Ok(())
}

fn cmd_tail(
    log_path: &std::path::Path,
    follow: bool,
    limit: Option<usize>,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    use eventstream::subscriber::{CallbackResponse, SubscriberOptions, TerminateResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    let stream = open_stream(log_path)?;
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_for_cb = Arc::clone(&seen);

    let options = SubscriberOptions::new(move |entry, idxts, _last| {
        println!(
            "index={} us={} message={:?} pid={}",
            idxts.index, idxts.us, entry.payload.message, entry.payload.pid
        );
        let count = seen_for_cb.fetch_add(1, Ordering::SeqCst) + 1;
        if limit.is_some_and(|limit| count >= limit) {
            return CallbackResponse::Done;
        }
        CallbackResponse::More
    })
    .with_terminate_hook(move || TerminateResponse::Terminate)
    .with_stop_when_caught_up(!follow);

    let scope = stream.subscribe_with_options(options)?;
    scope.join();
    writeln!(out, "delivered {} entries", seen.load(Ordering::SeqCst))?;
    Ok(())
}

fn cmd_inspect(log_path: &std::path::Path, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let stream = open_stream(log_path)?;
    writeln!(out, "size={} head_us={}", stream.size(), stream.head())?;
    let last = stream.last_idxts();
    writeln!(out, "last_index={} last_us={}", last.index, last.us)?;
    Ok(())
}

fn cmd_serve(log_path: &std::path::Path, addr: &str) -> Result<(), Box<dyn Error>> {
    let stream = open_stream(log_path)?;
    let endpoint = PubSubHttpEndpoint::with_config(stream, HttpEndpointConfig::default());
    let listener = TcpListener::bind(addr)?;
    log::info!("serving {} on {addr}", log_path.display());
    endpoint.serve(listener)?;
    Ok(())
}
