//! Fleet CLI - manage VPC cluster nodes from the command line.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet::node::{TAG_NODE_KIND, TAG_NODE_NAME, TAG_NODE_STATUS};
use fleet::{ClusterConfig, NodeProvider, NodeRole, StatusTag, TagFilter, VpcNodeProvider};

/// Fleet CLI - VPC node provider for CTO Platform clusters.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Create, inspect and terminate VPC cluster nodes")]
struct Cli {
    /// Cluster configuration file.
    #[arg(long, default_value = "cluster.yaml")]
    config: PathBuf,

    /// IAM API key (or set `IBM_API_KEY` env var); overrides the config file.
    #[arg(long, env = "IBM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List non-terminated nodes.
    List {
        /// Only nodes with this role (head or worker).
        #[arg(long)]
        role: Option<NodeRole>,

        /// Additional tag filter as key=value (repeatable).
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Create nodes.
    Create {
        /// Role of the new nodes.
        #[arg(long, default_value = "worker")]
        role: NodeRole,

        /// Number of nodes.
        #[arg(long, default_value = "1")]
        count: usize,

        /// Extra tag as key=value (repeatable).
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Terminate nodes (stop or delete, per `cache_stopped_nodes`).
    Terminate {
        /// Node IDs.
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Show the tags of a node.
    Tags {
        /// Node ID.
        id: String,
    },

    /// Replace the status tag of a node.
    SetStatus {
        /// Node ID.
        id: String,

        /// New status (e.g. up-to-date).
        status: StatusTag,
    },

    /// Show the addresses of a node.
    Ip {
        /// Node ID.
        id: String,
    },
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ClusterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let provider = VpcNodeProvider::from_config(&config, cli.api_key.clone())
        .context("Failed to create node provider")?;

    match cli.command {
        Commands::List { role, tags } => {
            let mut filter: TagFilter = tags.into_iter().collect();
            if let Some(role) = role {
                filter.insert(TAG_NODE_KIND.to_string(), role.to_string());
            }

            let ids = provider.non_terminated_nodes(&filter).await?;
            println!(
                "\n{:<42} {:<36} {:<8} {:<10} {:<16} {:<16}",
                "ID", "NAME", "ROLE", "STATUS", "PRIVATE IP", "PUBLIC IP"
            );
            println!("{}", "-".repeat(132));
            for id in ids {
                let node = provider.get_cached_node(&id).await?;
                println!(
                    "{:<42} {:<36} {:<8} {:<10} {:<16} {:<16}",
                    node.id,
                    node.name,
                    node.role,
                    node.status,
                    node.private_ip.unwrap_or_default(),
                    node.floating_ips.first().cloned().unwrap_or_default()
                );
            }
        }

        Commands::Create { role, count, tags } => {
            let template = match role {
                NodeRole::Head => &config.head_node,
                NodeRole::Worker => &config.worker_node,
            };
            let mut node_tags: BTreeMap<String, String> = tags.into_iter().collect();
            node_tags.insert(TAG_NODE_KIND.to_string(), role.to_string());
            node_tags
                .entry(TAG_NODE_NAME.to_string())
                .or_insert_with(|| format!("ray-{}-{role}", config.cluster_name));
            node_tags
                .entry(TAG_NODE_STATUS.to_string())
                .or_insert_with(|| StatusTag::Uninitialized.to_string());

            info!("Creating {count} {role} node(s)");
            let nodes = provider
                .create_node(template, &node_tags, count)
                .await
                .context("Failed to create nodes")?;
            for node in nodes.values() {
                println!("{}  {}  {}", node.id, node.name, node.status);
            }
        }

        Commands::Terminate { ids } => {
            provider
                .terminate_nodes(&ids)
                .await
                .context("Failed to terminate nodes")?;
            for id in ids {
                println!("Terminated {id}");
            }
        }

        Commands::Tags { id } => {
            for (key, value) in provider.node_tags(&id).await? {
                println!("{key}={value}");
            }
        }

        Commands::SetStatus { id, status } => {
            let mut tags = BTreeMap::new();
            tags.insert(TAG_NODE_STATUS.to_string(), status.to_string());
            provider
                .set_node_tags(&id, &tags)
                .await
                .with_context(|| format!("Failed to set status on {id}"))?;
            println!("{id}: {TAG_NODE_STATUS}={status}");
        }

        Commands::Ip { id } => {
            let internal = provider.internal_ip(&id).await?;
            let external = provider.external_ip(&id).await?;
            println!("\nNode {id}:");
            println!("  Internal: {}", internal.unwrap_or_default());
            println!("  External: {}", external.unwrap_or_default());
        }
    }

    Ok(())
}
