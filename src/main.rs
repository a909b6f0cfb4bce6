//! # persona - operator CLI
//!
//! Opens the configured storage engine and runs one maintenance command
//! against it. Results are printed to stdout as JSON; logs go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use persona::service::{
    BatchGetValueReq, BatchSetValueReq, ExportDataReq, ImportDataReq, VersionKey, VersionKeyValue,
};
use persona::{open_engine, Config, PersonaService, RequestContext};

/// Personalization key-value and dataset store.
#[derive(Parser, Debug)]
#[command(name = "persona", version, about = "Personalization key-value and dataset store")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    /// Overrides `log.level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    /// Acts on behalf of this user (the `User-Id` of a request).
    #[arg(long, global = true)]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the backend and create the search index if it is missing.
    InitIndex,

    /// Read a value. With --version reads the versioned key.
    Get {
        key: String,
        #[arg(long)]
        version: Option<String>,
    },

    /// Write a value. With --version writes the versioned key.
    Set {
        key: String,
        value: String,
        #[arg(long)]
        version: Option<String>,
    },

    /// Dump every record of an application as JSON.
    Export { app_id: String },

    /// Load records produced by `export` from a file, or stdin with `-`.
    Import { file: PathBuf },

    /// List version/key pairs under a physical key prefix.
    Search { prefix: String },

    /// Delete everything under a physical key prefix.
    Purge {
        prefix: String,
        /// Required to actually delete.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    initialize_tracing(log_level)?;

    let cancel = CancellationToken::new();
    setup_signal_handler(cancel.clone());

    let mut ctx = RequestContext::new().with_cancellation(cancel);
    if let Some(user_id) = &args.user_id {
        ctx = ctx.with_user_id(user_id.clone());
    }

    let engine = open_engine(&config)
        .await
        .context("opening storage engine")?;
    info!(engine = engine.name(), "storage engine ready");
    let service = PersonaService::new(engine);

    match run(&service, &ctx, args.command).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Command failed: {:?}", e);
            Err(e)
        }
    }
}

async fn run(service: &PersonaService, ctx: &RequestContext, command: Command) -> anyhow::Result<()> {
    let user_scoped = ctx.user_id().is_some();

    match command {
        Command::InitIndex => {
            print_json(&serde_json::json!({ "engine": service.engine().name(), "ready": true }))
        }

        Command::Get { key, version: None } => {
            let found = service.engine().get(ctx, &key).await?;
            print_json(&found)
        }
        Command::Get { key, version: Some(version) } => {
            let req = BatchGetValueReq {
                keys: vec![VersionKey { version, key }],
            };
            let resp = if user_scoped {
                service.user_get_value(ctx, &req).await?
            } else {
                service.get_value(ctx, &req).await?
            };
            print_json(&resp)
        }

        Command::Set { key, value, version: None } => {
            service.engine().put(ctx, &key, &value).await?;
            print_json(&serde_json::json!({ "successKeys": [key] }))
        }
        Command::Set { key, value, version: Some(version) } => {
            let req = BatchSetValueReq {
                keys: vec![VersionKeyValue { version, key, value }],
            };
            let resp = if user_scoped {
                service.user_set_value(ctx, &req).await?
            } else {
                service.set_value(ctx, &req).await?
            };
            print_json(&resp)
        }

        Command::Export { app_id } => {
            let resp = service.export_data(ctx, &ExportDataReq { app_id }).await?;
            print_json(&resp)
        }

        Command::Import { file } => {
            let raw = read_input(&file)?;
            let req: ImportDataReq =
                serde_json::from_str(&raw).context("parsing import file")?;
            service.import_data(ctx, &req).await?;
            print_json(&serde_json::json!({ "imported": req.app_data.len() }))
        }

        Command::Search { prefix } => {
            let found = service.search_keys(ctx, &prefix).await?;
            print_json(&found)
        }

        Command::Purge { prefix, yes } => {
            if !yes {
                anyhow::bail!("refusing to delete keys under {:?} without --yes", prefix);
            }
            let report = service.purge(ctx, &prefix).await?;
            if !report.failed.is_empty() {
                warn!(failed = report.failed.len(), "some keys were not deleted");
            }
            print_json(&report)
        }
    }
}

fn read_input(file: &Path) -> anyhow::Result<String> {
    if file.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        return Ok(raw);
    }
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Cancels in-flight backend calls on Ctrl-C.
fn setup_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, cancelling request");
                cancel.cancel();
            }
            Err(e) => warn!("failed to install Ctrl-C handler: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versioned_set() {
        let args = Args::try_parse_from([
            "persona", "--user-id", "alice", "set", "theme", "dark", "--version", "v1",
        ])
        .unwrap();
        assert_eq!(args.user_id.as_deref(), Some("alice"));
        match args.command {
            Command::Set { key, value, version } => {
                assert_eq!(key, "theme");
                assert_eq!(value, "dark");
                assert_eq!(version.as_deref(), Some("v1"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_purge_requires_prefix() {
        assert!(Args::try_parse_from(["persona", "purge"]).is_err());
        let args = Args::try_parse_from(["persona", "purge", "app_id:A", "--yes"]).unwrap();
        assert!(matches!(args.command, Command::Purge { yes: true, .. }));
    }
}
