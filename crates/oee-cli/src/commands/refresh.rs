//! Refresh command: run the scheduler in the foreground.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oee_refresh::{Scheduler, SchedulerConfig, TickSummary};
use tokio_util::sync::CancellationToken;

pub fn run<W: Write>(db_path: &Path, config: SchedulerConfig, once: bool, writer: &mut W) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    let scheduler = Scheduler::new(db_path, config);

    if once {
        let summary = rt.block_on(tick_once(&scheduler, Utc::now()))?;
        write_summary(writer, &summary)?;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    rt.block_on(async {
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping after the current window");
            }
            on_signal.cancel();
        });
        scheduler.run(cancel).await
    })?;
    Ok(())
}

async fn tick_once(scheduler: &Scheduler, now: DateTime<Utc>) -> Result<TickSummary> {
    Ok(scheduler.tick(now, &CancellationToken::new()).await?)
}

fn write_summary<W: Write>(writer: &mut W, summary: &TickSummary) -> Result<()> {
    writeln!(
        writer,
        "Tick: {} enqueued, {} claimed, {} completed, {} failed ({} exhausted), {} leases reaped",
        summary.enqueued,
        summary.claimed,
        summary.completed,
        summary.failed,
        summary.exhausted,
        summary.reaped
    )?;
    Ok(())
}
