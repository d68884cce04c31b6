mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use sd_core::error::AppError;
use sd_core::repo::datasources::{NewDatasource, DEFAULT_SYNC_INTERVAL_SECONDS};

use crate::commands::AppContext;
use crate::config::AppConfig;

const DEFAULT_LOG_FILTER: &str = "statusdash=info,sd_sync=info,sd_core=info";

#[derive(Debug, Parser)]
#[command(name = "statusdash", version, about = "Service status aggregation and incident sync")]
struct Cli {
    /// TOML config file.
    #[arg(long, global = true, env = "STATUSDASH_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path; overrides `db_path` from the config file.
    #[arg(long, global = true, env = "STATUSDASH_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database or apply pending migrations.
    Init,
    /// Print the aggregated status overview.
    Overview,
    /// Run one sync for a datasource now, regardless of its interval.
    Sync { datasource_id: i64 },
    /// Check a datasource's provider credentials.
    TestConnection { datasource_id: i64 },
    /// Run the sync scheduler.
    Run {
        /// Do a single scheduling pass and wait for it to finish.
        #[arg(long)]
        once: bool,
    },
    #[command(subcommand)]
    Datasource(DatasourceCommand),
}

#[derive(Debug, Subcommand)]
enum DatasourceCommand {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "pagerduty")]
        provider: String,
        /// Provider config as JSON, e.g. '{"api_key":"...","service_ids":["PXXXX"]}'.
        #[arg(long, default_value = "{}")]
        config_json: String,
        #[arg(long, default_value_t = DEFAULT_SYNC_INTERVAL_SECONDS)]
        interval: i64,
        #[arg(long)]
        enabled: bool,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| {
        AppError::new("APP_OUTPUT_FAILED", "Failed to encode output").with_details(e.to_string())
    })?;
    println!("{text}");
    Ok(())
}

/// Returns whether the command itself reported success.
fn dispatch(ctx: &AppContext, command: Command) -> Result<bool, AppError> {
    match command {
        Command::Init => print_json(&commands::init_db(ctx)?).map(|_| true),
        Command::Overview => print_json(&commands::status_overview(ctx)?).map(|_| true),
        Command::Sync { datasource_id } => {
            let result = commands::sync_datasource(ctx, datasource_id)?;
            print_json(&result)?;
            Ok(result.success)
        }
        Command::TestConnection { datasource_id } => {
            let result = commands::test_datasource_connection(ctx, datasource_id)?;
            print_json(&result)?;
            Ok(result.success)
        }
        Command::Run { once: true } => {
            let results = commands::run_once(ctx)?;
            print_json(&results)?;
            Ok(results.iter().all(|r| r.success))
        }
        Command::Run { once: false } => commands::run_forever(ctx).map(|_| true),
        Command::Datasource(DatasourceCommand::List) => {
            print_json(&commands::datasources_list(ctx)?).map(|_| true)
        }
        Command::Datasource(DatasourceCommand::Add {
            name,
            provider,
            config_json,
            interval,
            enabled,
        }) => {
            let ds = commands::datasource_add(
                ctx,
                &NewDatasource {
                    name,
                    provider_type: provider,
                    config_json,
                    enabled,
                    sync_interval_seconds: interval,
                },
            )?;
            print_json(&ds).map(|_| true)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            if let Some(details) = &e.details {
                eprintln!("  {details}");
            }
            return ExitCode::FAILURE;
        }
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    init_tracing(config.log_json);
    let ctx = AppContext::new(config);

    match dispatch(&ctx, cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(code = %e.code, details = ?e.details, "{}", e.message);
            if let Ok(text) = serde_json::to_string_pretty(&e) {
                eprintln!("{text}");
            }
            ExitCode::FAILURE
        }
    }
}
