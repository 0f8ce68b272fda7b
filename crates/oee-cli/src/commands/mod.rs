//! CLI subcommand implementations.

pub mod backfill;
pub mod compute;
pub mod downtime;
pub mod ingest;
pub mod invalidate;
pub mod master;
pub mod query;
pub mod refresh;
pub mod status;
pub mod util;
