use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use ql_core::Intent;
use tracing_subscriber::EnvFilter;

use ql_cli::commands::{
    evaluate, events, graph, identity, ingest, maintenance, open_engine, policy, read_policy_file,
    run, status,
};
use ql_cli::{Cli, Commands, Config, IdentityAction};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
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

    let config = Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    let engine = open_engine(&config)?;
    let mut out = io::stdout().lock();

    match command {
        Commands::Status => status::run(&mut out, &engine, &config.database_path)?,
        Commands::Events { limit, event_type } => {
            events::run(&mut out, engine.log(), *limit, event_type.as_deref())?;
        }
        Commands::IngestPoll { file } => ingest::run(&mut out, &engine, file)?,
        Commands::Evaluate {
            provider,
            pool,
            cost,
            scope,
            identity,
            agent,
            workload,
            record,
        } => {
            let policies = config
                .policy_path
                .as_deref()
                .map(read_policy_file)
                .transpose()?;
            let intent = Intent {
                agent_id: agent.clone().unwrap_or_default(),
                identity_id: identity.clone().unwrap_or_default(),
                workload_id: workload.clone().unwrap_or_default(),
                scope_id: scope.clone().unwrap_or_default(),
                provider_id: provider.clone(),
                pool_id: pool.clone(),
                expected_cost: *cost,
                ..Intent::default()
            };
            evaluate::run(&mut out, &engine, policies, &intent, *record)?;
        }
        Commands::Policy { file } => policy::run(&mut out, &engine, read_policy_file(file)?)?,
        Commands::Identity(action) => match action {
            IdentityAction::Register {
                id,
                kind,
                token_hash,
            } => identity::register(&mut out, &engine, id, kind, token_hash.clone())?,
            IdentityAction::Delete { id } => identity::delete(&mut out, &engine, id)?,
        },
        Commands::Snapshot => maintenance::snapshot(&mut out, &engine)?,
        Commands::Prune => maintenance::prune(&mut out, &engine, &config.retention_policy()?)?,
        Commands::Graph { scope } => graph::run(&mut out, &engine, scope.as_deref())?,
        Commands::Run => {
            drop(out);
            run::run(&engine, &config)?;
        }
    }

    Ok(())
}
