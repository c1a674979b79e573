//! Status command: log size, latest snapshot, and per-pool usage.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use ql_db::format_timestamp;
use ql_engine::Engine;

pub fn run<W: Write>(writer: &mut W, engine: &Engine, database_path: &Path) -> Result<()> {
    let log = engine.log();

    writeln!(writer, "Quota ledger status")?;
    writeln!(writer, "Database: {}", database_path.display())?;
    writeln!(writer, "Events: {}", log.event_count()?)?;

    match log.snapshot_boundary()? {
        Some(boundary) => writeln!(
            writer,
            "Snapshot: {} at {} (boundary {})",
            boundary.snapshot_id,
            format_timestamp(boundary.ts_snapshot),
            boundary.last_event_id
        )?,
        None => writeln!(writer, "Snapshot: none")?,
    }

    let types = log.last_event_times_by_type()?;
    if types.is_empty() {
        writeln!(writer, "No events recorded.")?;
        return Ok(());
    }
    writeln!(writer, "Event types:")?;
    for entry in types {
        writeln!(
            writer,
            "- {}: {} (last {})",
            entry.event_type, entry.count, entry.last_ingest
        )?;
    }

    let pools = engine.projections().usage.pools();
    if !pools.is_empty() {
        writeln!(writer, "Pools:")?;
    }
    for pool in pools {
        write!(
            writer,
            "- {}/{}: used {}, remaining {}",
            pool.provider_id, pool.pool_id, pool.used, pool.remaining
        )?;
        if let Some(reset_at) = pool.reset_at {
            write!(writer, ", resets {}", format_timestamp(reset_at))?;
        }
        if let Some(forecast) = &pool.latest_forecast {
            write!(writer, ", p50 exhaustion in {}s", forecast.tte.p50_seconds)?;
        }
        writeln!(writer)?;
    }

    Ok(())
}
