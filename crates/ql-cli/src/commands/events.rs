//! Events command: dump the log as JSONL for debugging.

use std::io::Write;

use anyhow::{Context, Result};
use ql_core::EventType;
use ql_db::{EventFilter, EventLog};

pub fn run<W: Write>(writer: &mut W, log: &EventLog, limit: usize, event_type: Option<&str>) -> Result<()> {
    let events = match event_type {
        Some(name) => {
            let event_type: EventType = name
                .parse()
                .with_context(|| format!("invalid --type {name}"))?;
            log.query(&EventFilter {
                event_types: vec![event_type],
                limit: Some(limit),
                ..EventFilter::default()
            })?
        }
        None => log.read_recent(limit)?,
    };

    for event in events {
        let json = serde_json::to_string(&event)?;
        writeln!(writer, "{json}")?;
    }

    Ok(())
}
