//! Embedding worker process.
//!
//! Reads one JSON request per line on stdin and writes JSON responses on
//! stdout. Logs go to stderr so they never mix with the protocol.

use anyhow::Result;
use quarry_embed::pipeline::default_factory;
use quarry_embed::protocol::{ErrorKind, Response, encode_line};
use quarry_embed::worker::{Flow, WorkerSession};
use std::io::{BufRead, Write};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_env("QUARRY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    info!("quarry-embed-worker {} started", env!("CARGO_PKG_VERSION"));

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut session = WorkerSession::new(default_factory());

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut write_error = None;
        let mut emit = |response: Response| {
            if write_error.is_some() {
                return;
            }
            let written = encode_line(&response)
                .map_err(anyhow::Error::from)
                .and_then(|encoded| {
                    out.write_all(encoded.as_bytes())?;
                    out.flush()?;
                    Ok(())
                });
            if let Err(e) = written {
                write_error = Some(e);
            }
        };

        let flow = match serde_json::from_str(&line) {
            Ok(request) => session.handle(request, &mut emit),
            Err(e) => {
                warn!("Unparseable request: {e}");
                emit(Response::Error {
                    id: None,
                    kind: ErrorKind::Generation,
                    message: format!("invalid request: {e}"),
                });
                Flow::Continue
            }
        };

        if let Some(e) = write_error {
            return Err(e.context("writing to stdout"));
        }
        if flow == Flow::Stop {
            break;
        }
    }

    debug!("Worker loop finished");
    Ok(())
}
