mod config;
mod db;
mod ident;
mod ipc;
mod store;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(author, version, about)]
struct Args {
    /// TOML config file.
    #[clap(short, long, env = "MAPPINGD_CONFIG")]
    config: Option<PathBuf>,
    /// SQLite database file; overrides `database.database`.
    #[clap(short, long, env = "MAPPINGD_DATABASE")]
    database: Option<PathBuf>,
    /// Log level or filter directive; overrides `log.level`.
    #[clap(short, long, env = "MAPPINGD_LOG")]
    log_level: Option<String>,
}

/// `--log-level`/`MAPPINGD_LOG` wins over `RUST_LOG`, which wins over `log.level`.
/// Returns the filter plus every directive that failed to parse.
fn build_filter(explicit: Option<&str>, configured: &str) -> (EnvFilter, Vec<String>) {
    let mut rejected = Vec::new();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let candidates = [
        ("--log-level", explicit),
        (EnvFilter::DEFAULT_ENV, env.as_deref()),
        ("log.level", Some(configured)),
    ];
    for (source, directive) in candidates {
        let Some(directive) = directive else { continue };
        match EnvFilter::try_new(directive) {
            Ok(filter) => return (filter, rejected),
            Err(e) => rejected.push(format!("{source} `{directive}`: {e}")),
        }
    }
    (EnvFilter::new("info"), rejected)
}

fn setup_logging(explicit: Option<&str>, configured: &str) {
    let (filter, rejected) = build_filter(explicit, configured);
    // stdout carries responses; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
    for r in rejected {
        warn!("ignoring invalid log filter {r}");
    }
}

fn write_response(stdout: &mut io::Stdout, resp: &serde_json::Value) {
    let _ = writeln!(
        stdout,
        "{}",
        serde_json::to_string(resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    );
    let _ = stdout.flush();
}

fn bad_json(message: String) -> serde_json::Value {
    json!({ "ok": false, "error": { "code": "bad_json", "message": message } })
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = match args.config.as_deref() {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };
    if let Some(db) = args.database {
        cfg.database.database = Some(db);
    }

    setup_logging(args.log_level.as_deref(), &cfg.log.level);
    if let Some(secret) = cfg.secret_ref()? {
        debug!(secret = %secret, "database secret configured");
    }
    let ignored = cfg.ignored_database_settings();
    if !ignored.is_empty() {
        warn!(settings = ?ignored, "sqlite driver ignores these database settings");
    }

    let mut state = ipc::AppState {
        db_path: None,
        db: None,
        key_encoding: cfg.identifiers.encoding,
    };
    if let Some(path) = cfg.database.database.clone() {
        let conn = db::open_db(&path)
            .with_context(|| format!("startup database {}", path.to_string_lossy()))?;
        info!(path = %path.to_string_lossy(), "database opened");
        state.db_path = Some(path);
        state.db = Some(conn);
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        key_encoding = cfg.identifiers.encoding.as_str(),
        "mappingd ready"
    );

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut stdout = io::stdout();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match input.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        }
        // Can't reply with an id to a line we can't read.
        let line = match std::str::from_utf8(&buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("request line is not utf-8: {e}");
                write_response(&mut stdout, &bad_json(format!("request is not utf-8: {e}")));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("unparseable request: {e}");
                write_response(&mut stdout, &bad_json(e.to_string()));
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        write_response(&mut stdout, &resp);
    }

    info!("stdin closed, shutting down");
    Ok(())
}
