mod cli;
mod config;
mod logging;
mod output;

use anyhow::Context;
use clap::Parser;
use cli::Args;
use config::{expand_tilde, load_config, ConfigResolver};
use logfleet_core::{
    ClientSettings, Fleet, FleetUpdate, MergedQueryResult, ProcessConnector, QueryParams,
};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = logging::init_tracing(&logging::LogOptions {
        dir: expand_tilde(&args.log_dir),
        to_stderr: args.log_to_stderr,
        debug_hosts: args.debug_hosts.clone(),
    })?;

    let config_path = expand_tilde(&args.config);
    let config = load_config(&config_path)?;
    let agent_script = tokio::fs::read_to_string(&config.agent_script)
        .await
        .with_context(|| format!("failed to read agent script {}", config.agent_script.display()))?;
    let connector = ProcessConnector {
        ssh_args: config.defaults.ssh_args.clone(),
        ssh_password: config.defaults.ssh_password.clone(),
        prompt_password: false,
        askpass_dir: None,
    };
    let settings = ClientSettings {
        agent_script,
        ..ClientSettings::default()
    };
    let resolver = ConfigResolver::new(config)?;

    let (fleet, mut updates) = Fleet::spawn(Arc::new(resolver), Arc::new(connector), Arc::new(settings));
    let outcome = run(&fleet, &mut updates, &args).await;

    fleet.close();
    let drain = tokio::spawn(async move { while updates.recv().await.is_some() {} });
    fleet.wait().await?;
    let _ = drain.await;
    info!(event = "logfleet.exit");
    outcome
}

async fn run(
    fleet: &Fleet,
    updates: &mut mpsc::Receiver<FleetUpdate>,
    args: &Args,
) -> anyhow::Result<()> {
    fleet.set_hosts(&args.hosts).await?;
    wait_connected(updates, args).await?;

    let mut params = QueryParams {
        from: args.from,
        to: args.to,
        query: args.query.clone(),
        max_lines: args.max_lines,
        load_earlier: false,
        refresh_index: args.refresh_index,
    };
    let mut result = query(fleet, updates, params.clone()).await?;
    params.load_earlier = true;
    params.refresh_index = false;
    for page in 0..args.pages {
        // Coverage already reaches the lower bound: there is nothing earlier to load.
        if result.is_error() || result.coverage_from == params.from {
            break;
        }
        info!(event = "logfleet.page", page = page + 1);
        result = query(fleet, updates, params.clone()).await?;
    }

    let mut stdout = io::stdout().lock();
    if args.json {
        output::write_json(&mut stdout, &result)?;
    } else {
        output::write_text(&mut stdout, &result)?;
    }
    if result.is_error() {
        anyhow::bail!("query failed on {} host(s)", result.errors.len());
    }
    Ok(())
}

async fn wait_connected(
    updates: &mut mpsc::Receiver<FleetUpdate>,
    args: &Args,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + args.connect_wait;
    loop {
        let update = tokio::select! {
            update = updates.recv() => update.context("fleet stopped")?,
            _ = tokio::time::sleep_until(deadline) => {
                anyhow::bail!("hosts did not connect within {}", humantime::format_duration(args.connect_wait));
            }
            _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
        };
        match update {
            FleetUpdate::Snapshot(snapshot) if snapshot.no_matching_hosts => {
                anyhow::bail!("no hosts match {:?}", args.hosts);
            }
            FleetUpdate::Snapshot(snapshot) if snapshot.connected => return Ok(()),
            FleetUpdate::Snapshot(snapshot) => {
                for (host, details) in &snapshot.conn_details {
                    if let Some(err) = details.err.as_deref() {
                        warn!(event = "logfleet.connect.pending", host = %host, attempt = details.attempt, error = %err);
                    }
                }
            }
            other => report(other),
        }
    }
}

async fn query(
    fleet: &Fleet,
    updates: &mut mpsc::Receiver<FleetUpdate>,
    params: QueryParams,
) -> anyhow::Result<MergedQueryResult> {
    fleet.query_logs(params).await?;
    loop {
        let update = tokio::select! {
            update = updates.recv() => update.context("fleet stopped")?,
            _ = tokio::signal::ctrl_c() => {
                fleet.abort_query().await?;
                anyhow::bail!("interrupted");
            }
        };
        match update {
            FleetUpdate::QueryResult(result) => return Ok(result),
            FleetUpdate::Snapshot(_) => {}
            other => report(other),
        }
    }
}

fn report(update: FleetUpdate) {
    match update {
        FleetUpdate::BootstrapIssue { host, issue } => {
            if let Some(err) = issue.err.as_deref() {
                eprintln!("{host}: bootstrap failed: {err}");
            }
            if issue.warn_no_admin_access {
                eprintln!("{host}: no admin access, some logs may be missing");
            }
        }
        FleetUpdate::DataRequest { host, title, .. } => {
            // Dropping the reply fails the connect attempt; configure ssh_password instead.
            warn!(event = "logfleet.data_request.refused", host = %host, title = %title);
        }
        FleetUpdate::Snapshot(_) | FleetUpdate::QueryResult(_) => {}
    }
}
