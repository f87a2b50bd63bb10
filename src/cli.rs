use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::RingConfig;
use crate::error::{DiscoveryError, DiscoveryResult};

/// gridring - ring-based cluster membership node
#[derive(Parser, Debug)]
#[command(name = "gridring-node")]
#[command(version)]
#[command(about = "Run a gridring node and print membership events")]
#[command(long_about = "
Starts a node that joins a gridring ring through the given seeds, or starts
a new ring when no seed answers. Membership changes are printed as they are
observed. Ctrl-C leaves the ring gracefully.

Usage examples:
  gridring-node --bind 127.0.0.1:7100
  gridring-node --bind 127.0.0.1:7101 --seed 127.0.0.1:7100
  gridring-node --config node.toml --attr zone=eu-west --json
")]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Seed address to join through (repeatable)
    #[arg(short, long = "seed")]
    pub seeds: Vec<SocketAddr>,

    /// Attribute published with this node, as key=value (repeatable)
    #[arg(short, long = "attr", value_parser = parse_attribute)]
    pub attributes: Vec<(String, String)>,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl Cli {
    /// Load the configuration file, if any, and apply command line overrides
    pub fn ring_config(&self) -> DiscoveryResult<RingConfig> {
        let mut config = match &self.config {
            Some(path) => RingConfig::from_file(path)?,
            None => RingConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.node.bind_address = bind;
        }
        for seed in &self.seeds {
            if !config.node.seeds.contains(seed) {
                config.node.seeds.push(*seed);
            }
        }
        let attributes: BTreeMap<String, String> = self.attributes.iter().cloned().collect();
        config.node.attributes.extend(attributes);
        config.validate()?;
        Ok(config)
    }
}

fn parse_attribute(value: &str) -> Result<(String, String), DiscoveryError> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(DiscoveryError::Configuration(format!(
            "attribute '{}' is not key=value",
            value
        ))),
    }
}
