use std::process;

use anyhow::Context;
use clap::Parser;
use colored::*;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use gridring::cli::Cli;
use gridring::{DiscoveryEvent, RingNode};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".bright_red().bold(), e);
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.ring_config().context("invalid configuration")?;
    let node = RingNode::start(config).await.context("failed to start node")?;
    let mut events = node.subscribe();

    if !cli.json {
        println!(
            "{} {} listening on {}",
            "Node".bright_green().bold(),
            node.local_id(),
            node.local_address()
        );
    }

    tokio::select! {
        joined = node.wait_joined() => joined.context("failed to join the ring")?,
        _ = tokio::signal::ctrl_c() => {
            node.abort().await;
            return Ok(());
        }
    }

    if !cli.json {
        let members = node.snapshot();
        println!(
            "{} ring of {} node(s), coordinator {}",
            "Joined".bright_green().bold(),
            members.len(),
            node.coordinator()
                .map(|c| c.id.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let segmented = matches!(event, DiscoveryEvent::Segmented);
                    print_event(&event, cli.json)?;
                    if segmented {
                        anyhow::bail!("node was declared failed by the ring");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagging behind");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                if !cli.json {
                    println!("{}", "Leaving ring...".yellow());
                }
                node.leave().await.context("leave failed")?;
                return Ok(());
            }
        }
    }
}

fn print_event(event: &DiscoveryEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        DiscoveryEvent::NodeJoined { node } => println!(
            "{} {} at {} (order {})",
            "+ joined".bright_green(),
            node.id,
            node.address,
            node.internal_order
        ),
        DiscoveryEvent::NodeLeft { node_id } => println!("{} {}", "- left".yellow(), node_id),
        DiscoveryEvent::NodeFailed { node_id } => println!("{} {}", "x failed".bright_red(), node_id),
        DiscoveryEvent::CustomMessage {
            creator,
            message_id,
            payload,
        } => println!(
            "{} {} from {} ({} bytes)",
            "> message".cyan(),
            message_id,
            creator,
            payload.len()
        ),
        DiscoveryEvent::Segmented => println!("{}", "! segmented from the ring".bright_red().bold()),
    }
    Ok(())
}
