use std::io::{self, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use oee_cli::commands::{
    backfill, compute, downtime, ingest, invalidate, master, query, refresh, status,
};
use oee_cli::{Cli, Commands, Config, MasterAction, QueryAction};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(oee_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = oee_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr so JSON output on stdout stays parseable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let mut stdout = io::stdout().lock();

    let (mut db, config) = open_database(cli.config.as_deref())?;
    match command {
        Commands::Ingest { file } => match file {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                ingest::run(&mut db, BufReader::new(file), &mut stdout)?;
            }
            None => ingest::run(&mut db, io::stdin().lock(), &mut stdout)?,
        },
        Commands::Master(action) => match action {
            MasterAction::Load { path } => master::load(&mut db, path, &mut stdout)?,
            MasterAction::Show { json } => master::show(&db, *json, &mut stdout)?,
        },
        Commands::Refresh { once } => {
            drop(db);
            refresh::run(&config.database_path, config.scheduler.clone(), *once, &mut stdout)?;
        }
        Commands::Backfill {
            start,
            end,
            equipment,
        } => backfill::run(&db, &config.database_path, equipment, start, end, &mut stdout)?,
        Commands::Compute {
            equipment,
            start,
            end,
            shift,
            json,
        } => compute::run(
            &db,
            equipment,
            start.as_deref(),
            end.as_deref(),
            shift.as_deref(),
            *json,
            &mut stdout,
        )?,
        Commands::Query(action) => match action {
            QueryAction::Oee {
                equipment,
                granularity,
                start,
                json,
            } => query::oee(&db, equipment, granularity, start, *json, &mut stdout)?,
            QueryAction::Reliability {
                equipment,
                start,
                end,
                json,
            } => query::reliability(&db, equipment, start, end, *json, &mut stdout)?,
        },
        Commands::Invalidate {
            equipment,
            start,
            end,
        } => invalidate::run(&mut db, equipment, start, end, &mut stdout)?,
        Commands::Status { equipment, json } => {
            status::run(&db, equipment.as_deref(), *json, &mut stdout)?;
        }
        Commands::Downtime {
            equipment,
            start,
            end,
            json,
        } => downtime::run(&db, equipment, start, end, *json, &mut stdout)?,
    }

    Ok(())
}
