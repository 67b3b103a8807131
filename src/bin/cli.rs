//! CLI for operator actions

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use topokeeper::arbitration::PromoteScope;
use topokeeper::channel::{CoordinationChannel, FileChannel, LinkInfo, LinkKind};

#[derive(Parser)]
#[command(name = "topokeeper")]
#[command(about = "topokeeper operator CLI")]
#[command(version)]
struct Cli {
    /// Agent status API of the member to act on
    #[arg(long, default_value = "http://localhost:8090")]
    agent: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "120")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the member's status
    Status,

    /// Promote this member (scope unit) or its deployment (scope cluster)
    PromoteToPrimary {
        /// unit or cluster
        #[arg(long, default_value = "cluster")]
        scope: PromoteScope,

        /// Promote even though the linked deployment is primary
        #[arg(long)]
        force: bool,
    },

    /// Make this deployment the first primary of its replication link
    CreateReplication,

    /// Manage links in the coordination channel
    Link {
        /// Channel directory
        #[arg(long, default_value = "/var/lib/topokeeper/channel")]
        channel: PathBuf,

        #[command(subcommand)]
        command: LinkCommands,
    },
}

#[derive(Subcommand)]
enum LinkCommands {
    /// Link two deployments
    Create {
        name: String,

        /// The two deployments (comma-separated)
        #[arg(long, value_delimiter = ',', num_args = 2)]
        deployments: Vec<String>,

        /// Link a quorum witness instead of a replica deployment
        #[arg(long)]
        witness: bool,
    },

    /// Remove a link
    Break { name: String },

    /// List links
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cli.timeout))
        .build()?;
    let agent = cli.agent.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Status => {
            let body: serde_json::Value = client
                .get(format!("{}/status", agent))
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::PromoteToPrimary { scope, force } => {
            let response = client
                .post(format!("{}/actions/promote-to-primary", agent))
                .json(&json!({ "scope": scope, "force": force }))
                .send()
                .await?;
            print_action(response).await?;
        }

        Commands::CreateReplication => {
            let response = client
                .post(format!("{}/actions/create-replication", agent))
                .send()
                .await?;
            print_action(response).await?;
        }

        Commands::Link { channel, command } => {
            let channel = FileChannel::open(&channel, Duration::from_millis(500)).await?;
            match command {
                LinkCommands::Create {
                    name,
                    deployments,
                    witness,
                } => {
                    let [a, b]: [String; 2] = deployments
                        .try_into()
                        .map_err(|_| anyhow::anyhow!("exactly two deployments are required"))?;
                    let kind = if witness {
                        LinkKind::Witness
                    } else {
                        LinkKind::Replication
                    };
                    channel
                        .establish_link(LinkInfo {
                            name: name.clone(),
                            kind,
                            deployments: [a, b],
                        })
                        .await?;
                    println!("Link {} established", name);
                }
                LinkCommands::Break { name } => {
                    channel.break_link(&name).await?;
                    println!("Link {} broken", name);
                }
                LinkCommands::List => {
                    for link in channel.roster().await?.links.values() {
                        println!(
                            "{}\t{:?}\t{} <-> {}",
                            link.name, link.kind, link.deployments[0], link.deployments[1]
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

async fn print_action(response: reqwest::Response) -> anyhow::Result<()> {
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if status.is_success() {
        println!("{}", body["result"].as_str().unwrap_or("ok"));
        Ok(())
    } else {
        anyhow::bail!(
            "action failed ({}): {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        )
    }
}
