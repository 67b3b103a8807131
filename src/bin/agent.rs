//! Agent binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use topokeeper::arbitration::PromoteRequest;
use topokeeper::channel::LinkKind;
use topokeeper::testing::Simulation;
use topokeeper::AgentConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "topokeeper-agent")]
#[command(about = "Topology-control agent for replicated PostgreSQL deployments")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent for this member
    Serve {
        /// Configuration file (TOML); TOPOKEEPER_* variables override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for the status API
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Run two simulated deployments through a promotion and a failback
    Simulate {
        /// Members per deployment
        #[arg(long, default_value = "3")]
        members: usize,

        /// Maximum rounds per phase
        #[arg(long, default_value = "200")]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            let mut config = AgentConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.status_bind = bind;
            }
            let ctx = topokeeper::agent::build_context(config).await?;
            topokeeper::agent::serve(ctx, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }

        Commands::Simulate { members, rounds } => simulate(members.max(1), rounds).await?,
    }

    Ok(())
}

async fn simulate(members: usize, rounds: usize) -> anyhow::Result<()> {
    let mut sim = Simulation::new();
    for (deployment, net) in [("east", 0), ("west", 1)] {
        for i in 0..members {
            sim.add_member(
                deployment,
                &format!("{}/{}", deployment, i),
                &format!("10.0.{}.{}", net, i + 1),
            )
            .await?;
        }
    }
    let used = sim.settle(rounds).await?;
    println!("Bootstrapped both deployments in {} rounds", used);

    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await?;
    sim.settle(rounds).await?;
    println!("{}", sim.act("east/0", topokeeper::Event::CreateReplication).await?);
    let used = sim.settle(rounds).await?;
    println!("west follows east after {} rounds", used);
    report(&sim, &["east", "west"]);

    let forced = PromoteRequest {
        force: true,
        ..Default::default()
    };
    println!("{}", sim.promote("west/0", forced).await?);
    let used = sim.settle(rounds).await?;
    println!("east follows west after {} rounds", used);
    report(&sim, &["east", "west"]);
    Ok(())
}

fn report(sim: &Simulation, deployments: &[&str]) {
    for deployment in deployments {
        for member in sim.members_of(deployment) {
            if let Some(status) = sim.status(&member) {
                println!("  {:<8} {:?}: {}", member, status.kind, status.message);
            }
        }
    }
}
