//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Equipment effectiveness and reliability rollups.
///
/// Records equipment states, production counts and quality events, keeps
/// OEE rollups from 1-minute to day windows up to date, and answers
/// availability, performance, quality, MTBF and MTTR queries.
#[derive(Debug, Parser)]
#[command(name = "oee", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Append raw events, one JSON object per line.
    Ingest {
        /// Read events from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Manage equipment, reason codes and shifts.
    #[command(subcommand)]
    Master(MasterAction),

    /// Run the refresh scheduler until interrupted.
    Refresh {
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },

    /// Recompute every rollup level for whole days in a range.
    Backfill {
        /// Range start (RFC 3339, YYYY-MM-DD or "N days ago").
        #[arg(long)]
        start: String,

        /// Range end (exclusive).
        #[arg(long)]
        end: String,

        /// Equipment to backfill (default: all).
        #[arg(long = "equipment", short = 'e')]
        equipment: Vec<String>,
    },

    /// Compute OEE straight from raw events without storing it.
    Compute {
        /// Equipment ID.
        equipment: String,

        /// Window start.
        #[arg(long, requires = "end", conflicts_with = "shift")]
        start: Option<String>,

        /// Window end (exclusive).
        #[arg(long, requires = "start")]
        end: Option<String>,

        /// Compute over a whole shift instance.
        #[arg(long)]
        shift: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Read materialized results.
    #[command(subcommand)]
    Query(QueryAction),

    /// Force recomputation of every window overlapping a range.
    Invalidate {
        /// Equipment ID.
        equipment: String,

        /// Range start.
        #[arg(long)]
        start: String,

        /// Range end (exclusive).
        #[arg(long)]
        end: String,
    },

    /// Show the refresh queue, or the live status of one equipment unit.
    Status {
        /// Equipment ID.
        equipment: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rank downtime reason codes by lost time.
    Downtime {
        /// Equipment ID.
        equipment: String,

        /// Period start.
        #[arg(long)]
        start: String,

        /// Period end (exclusive).
        #[arg(long)]
        end: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Master-data subcommands.
#[derive(Debug, Subcommand)]
pub enum MasterAction {
    /// Validate and store a master-data TOML file.
    Load {
        /// Path to the master-data file.
        path: PathBuf,
    },

    /// Print the stored master data.
    Show {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Query subcommands.
#[derive(Debug, Subcommand)]
pub enum QueryAction {
    /// OEE of one rollup window.
    Oee {
        /// Equipment ID.
        equipment: String,

        /// Rollup level: 1min, 5min, hour or day.
        #[arg(long, short = 'g', default_value = "hour")]
        granularity: String,

        /// Window start, on a boundary of the granularity.
        #[arg(long)]
        start: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// MTBF, MTTR and availability of a stored period.
    Reliability {
        /// Equipment ID.
        equipment: String,

        /// Period start.
        #[arg(long)]
        start: String,

        /// Period end (exclusive).
        #[arg(long)]
        end: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}
