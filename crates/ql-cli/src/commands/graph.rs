//! Graph command: the constraint graph as JSON.

use std::io::Write;

use anyhow::Result;
use ql_engine::Engine;

pub fn run<W: Write>(writer: &mut W, engine: &Engine, scope: Option<&str>) -> Result<()> {
    let graph = &engine.projections().constraint_graph;
    let json = match scope {
        Some(scope) => serde_json::to_string_pretty(&graph.constraints_for_scope(scope))?,
        None => serde_json::to_string_pretty(&graph.graph())?,
    };
    writeln!(writer, "{json}")?;
    Ok(())
}
