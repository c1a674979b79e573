//! Ingest command: record provider poll results from a file.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use ql_engine::{Engine, PollResult};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum PollFile {
    Many(Vec<PollResult>),
    One(PollResult),
}

pub fn run<W: Write>(writer: &mut W, engine: &Engine, file: &Path) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let polls = match serde_json::from_str::<PollFile>(&json)
        .with_context(|| format!("{} is not a poll result or a list of them", file.display()))?
    {
        PollFile::Many(polls) => polls,
        PollFile::One(poll) => vec![poll],
    };

    for poll in &polls {
        let events = engine
            .ingest_poll(poll)
            .with_context(|| format!("failed to ingest poll for {}", poll.provider_id))?;
        writeln!(
            writer,
            "{}: {} ({} events)",
            poll.provider_id,
            poll.status,
            events.len()
        )?;
    }

    Ok(())
}
