//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Event-sourced quota ledger.
///
/// Records provider usage, forecasts exhaustion, and decides whether
/// intents to consume quota may proceed.
#[derive(Debug, Parser)]
#[command(name = "ql", version, about, long_about = None)]
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
    /// Show log size, snapshot, and pool status.
    Status,

    /// Print events as JSONL.
    Events {
        /// Maximum number of events.
        #[arg(long, default_value_t = ql_db::DEFAULT_RECENT_LIMIT)]
        limit: usize,

        /// Only this event type (e.g. `usage_observed`), oldest first.
        /// Without it the newest events are printed first.
        #[arg(long = "type")]
        event_type: Option<String>,
    },

    /// Record provider poll results from a JSON file.
    IngestPoll {
        /// A poll result object, or an array of them.
        file: PathBuf,
    },

    /// Evaluate an intent against the active policies.
    Evaluate {
        #[arg(long)]
        provider: String,

        #[arg(long)]
        pool: String,

        /// Expected cost in quota units.
        #[arg(long, default_value_t = 0)]
        cost: i64,

        #[arg(long)]
        scope: Option<String>,

        #[arg(long)]
        identity: Option<String>,

        #[arg(long)]
        agent: Option<String>,

        #[arg(long)]
        workload: Option<String>,

        /// Record the decision as an `intent_decided` event.
        #[arg(long)]
        record: bool,
    },

    /// Load a policy document and record it.
    Policy {
        /// JSON policy document.
        file: PathBuf,
    },

    /// Manage identities.
    #[command(subcommand)]
    Identity(IdentityAction),

    /// Checkpoint all projections now.
    Snapshot,

    /// Apply the configured retention once.
    Prune,

    /// Print the constraint graph as JSON.
    Graph {
        /// Only constraints that apply to this scope.
        #[arg(long)]
        scope: Option<String>,
    },

    /// Restore state and run background workers until interrupted.
    Run,
}

#[derive(Debug, Subcommand)]
pub enum IdentityAction {
    /// Register or update an identity.
    Register {
        id: String,

        #[arg(long, default_value = "service")]
        kind: String,

        /// Hash of the identity's bearer token.
        #[arg(long)]
        token_hash: Option<String>,
    },

    /// Delete a registered identity.
    Delete { id: String },
}
