//! Cross-cluster replication: arbitration, promotion and standby takeover

use topokeeper::arbitration::{self, ArbitrationState, PromoteRequest, PromoteScope};
use topokeeper::channel::{keys, LinkKind, Partition};
use topokeeper::testing::{simulation_config, FakeDeployment, Simulation};
use topokeeper::{Event, StatusKind};

const ROUNDS: usize = 80;

/// Two bootstrapped deployments of two members each
async fn two_deployments() -> Simulation {
    let mut sim = Simulation::new();
    for (deployment, net) in [("east", 0), ("west", 1)] {
        for i in 0..2 {
            sim.add_member(
                deployment,
                &format!("{}/{}", deployment, i),
                &format!("10.0.{}.{}", net, i + 1),
            )
            .await
            .unwrap();
        }
    }
    sim.settle(ROUNDS).await.unwrap();
    assert!(sim.is_initialised("east").await);
    assert!(sim.is_initialised("west").await);
    sim
}

/// East at epoch 3, linked to west, everything settled
async fn east_primary_at_three() -> Simulation {
    let mut sim = two_deployments().await;
    sim.set_epoch("east", 3).await.unwrap();
    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await
        .unwrap();
    sim.settle(ROUNDS).await.unwrap();
    sim
}

/// Every data wipe happened after every member had stopped
fn assert_wipes_after_all_stopped(fake: &FakeDeployment, members: &[&str]) {
    let events = fake.events();
    for (idx, event) in events.iter().enumerate() {
        if !event.starts_with("wipe:") {
            continue;
        }
        for member in members {
            let stop = format!("stop:{}", member);
            assert!(
                events[..idx].contains(&stop),
                "{} happened before {} stopped",
                event,
                member
            );
        }
    }
}

async fn acks(sim: &Simulation, deployment: &str) -> Vec<Option<String>> {
    let mut acks = Vec::new();
    for member in sim.members_of(deployment) {
        acks.push(
            sim.member_value(&member, keys::UNIT_PROMOTED_CLUSTER_COUNTER)
                .await,
        );
    }
    acks
}

#[tokio::test]
async fn test_standby_takes_over_from_higher_epoch() {
    let mut sim = east_primary_at_three().await;
    let west = sim.deployment("west");

    assert!(sim.is_initialised("west").await);
    assert_eq!(acks(&sim, "west").await, vec![Some("3".to_string()); 2]);
    assert_eq!(acks(&sim, "east").await, vec![Some("3".to_string()); 2]);

    assert!(west.is_standby());
    assert!(west.is_running("west/0") && west.is_running("west/1"));
    assert_eq!(west.events_of("wipe").len(), 2);
    assert_wipes_after_all_stopped(&west, &["west/0", "west/1"]);

    // Diverged lineage was archived once, by the leader
    assert_eq!(west.events_of("archive"), vec!["west/0"]);
    assert_eq!(west.lineage(), "east-lineage");

    // The standby adopted the primary's passwords but kept its raft password
    let west_creds = sim.context("west/0").unwrap().credentials().await.unwrap().unwrap();
    let east_creds = sim.context("east/0").unwrap().credentials().await.unwrap().unwrap();
    assert_eq!(west_creds.superuser_password, east_creds.superuser_password);
    assert_eq!(west_creds.replication_password, east_creds.replication_password);
    assert_ne!(west_creds.raft_password, east_creds.raft_password);
    assert!(!sim.deployment("east").is_standby());

    let west_ctx = sim.context("west/0").unwrap();
    assert_eq!(
        arbitration::state(&west_ctx).await.unwrap(),
        ArbitrationState::RemotePrimary
    );
    let east_ctx = sim.context("east/0").unwrap();
    assert_eq!(
        arbitration::state(&east_ctx).await.unwrap(),
        ArbitrationState::LocalPrimary
    );
    assert_eq!(
        sim.status("west/1").map(|s| s.kind),
        Some(StatusKind::Active)
    );
}

#[tokio::test]
async fn test_standby_renders_upstream_and_primary_admits_it() {
    let mut sim = east_primary_at_three().await;

    let standby_doc = sim.deployment("west").document("west/0").unwrap();
    let standby: serde_json::Value = serde_json::from_str(&standby_doc).unwrap();
    assert_eq!(
        standby["bootstrap"]["dcs"]["standby_cluster"]["host"],
        "10.0.0.1"
    );

    let primary_doc = sim.deployment("east").document("east/0").unwrap();
    assert!(primary_doc.contains("host replication replication 10.0.1.1/32"));
    assert!(primary_doc.contains("host replication replication 10.0.1.2/32"));
}

#[tokio::test]
async fn test_promotion_refused_while_remote_is_primary() {
    let mut sim = east_primary_at_three().await;
    let writes = sim.channel().write_count();

    let err = sim
        .promote("west/0", PromoteRequest::default())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("east"), "{}", message);
    assert!(message.contains("force"), "{}", message);
    assert_eq!(sim.channel().write_count(), writes);
}

#[tokio::test]
async fn test_forced_promotion_demotes_the_old_primary() {
    let mut sim = east_primary_at_three().await;
    let east = sim.deployment("east");
    let wipes_before = east.events_of("wipe").len();
    assert_eq!(wipes_before, 0);

    let forced = PromoteRequest {
        scope: PromoteScope::Cluster,
        force: true,
    };
    let message = sim.promote("west/0", forced).await.unwrap();
    assert!(message.contains("epoch 4"), "{}", message);
    assert_eq!(
        sim.deployment_value("west", keys::PROMOTED_CLUSTER_COUNTER)
            .await
            .as_deref(),
        Some("4")
    );

    sim.settle(ROUNDS).await.unwrap();

    assert!(!sim.deployment("west").is_standby());
    assert!(east.is_standby());
    assert_eq!(acks(&sim, "east").await, vec![Some("4".to_string()); 2]);
    assert_eq!(acks(&sim, "west").await, vec![Some("4".to_string()); 2]);
    assert!(sim.is_initialised("east").await);
    assert!(sim.is_initialised("west").await);
    assert_eq!(east.events_of("wipe").len(), 2);
    assert_wipes_after_all_stopped(&east, &["east/0", "east/1"]);

    // East's data came from east originally: nothing to archive
    assert!(east.events_of("archive").is_empty());

    let link_side = Partition::Link {
        link: "dr".into(),
        deployment: "west".into(),
    };
    assert_eq!(
        sim.read(link_side, keys::PROMOTED_CLUSTER_CONFIRMED)
            .await
            .as_deref(),
        Some("4")
    );
}

#[tokio::test]
async fn test_create_replication_on_fresh_link() {
    let mut sim = two_deployments().await;
    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await
        .unwrap();
    sim.settle(ROUNDS).await.unwrap();

    // No epoch yet: nobody is primary, nobody wipes anything
    let ctx = sim.context("west/0").unwrap();
    assert_eq!(
        arbitration::state(&ctx).await.unwrap(),
        ArbitrationState::Unarbitrated
    );
    assert!(sim.deployment("west").events_of("wipe").is_empty());

    sim.act("east/0", Event::CreateReplication).await.unwrap();
    sim.settle(ROUNDS).await.unwrap();
    assert_eq!(acks(&sim, "west").await, vec![Some("1".to_string()); 2]);
    assert!(sim.deployment("west").is_standby());

    let err = sim
        .act("west/0", Event::CreateReplication)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already set up"));
}

#[tokio::test]
async fn test_promotion_must_run_on_the_leader() {
    let mut sim = two_deployments().await;
    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await
        .unwrap();
    sim.settle(ROUNDS).await.unwrap();

    let err = sim
        .promote("east/1", PromoteRequest::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("leader"));
}

#[tokio::test]
async fn test_unit_promotion_switches_over_inside_the_deployment() {
    let mut sim = two_deployments().await;
    let request = PromoteRequest {
        scope: PromoteScope::Unit,
        force: false,
    };
    sim.promote("east/1", request).await.unwrap();
    assert_eq!(sim.deployment("east").leader().as_deref(), Some("east/1"));

    let err = sim.promote("east/1", request).await.unwrap_err();
    assert!(err.to_string().contains("already the primary"));
}

#[tokio::test]
async fn test_stop_failure_blocks_before_anything_is_wiped() {
    let mut sim = two_deployments().await;
    let west = sim.deployment("west");
    west.fail_stop("west/1", true);

    sim.set_epoch("east", 3).await.unwrap();
    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await
        .unwrap();
    sim.settle(ROUNDS).await.unwrap();

    assert!(west.events_of("wipe").is_empty());
    assert_eq!(
        sim.status("west/1").map(|s| s.kind),
        Some(StatusKind::Blocked)
    );
    assert!(sim
        .deferred("west/1")
        .contains(&Event::LinkChanged { link: "dr".into() }));

    west.fail_stop("west/1", false);
    sim.settle(ROUNDS).await.unwrap();
    assert_eq!(acks(&sim, "west").await, vec![Some("3".to_string()); 2]);
    assert_wipes_after_all_stopped(&west, &["west/0", "west/1"]);
}

#[tokio::test]
async fn test_wipe_failure_blocks_the_takeover() {
    let mut sim = two_deployments().await;
    let west = sim.deployment("west");
    west.fail_wipe("west/0", true);

    sim.set_epoch("east", 3).await.unwrap();
    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await
        .unwrap();
    sim.settle(ROUNDS).await.unwrap();

    let status = sim.status("west/0").unwrap();
    assert_eq!(status.kind, StatusKind::Blocked);
    assert!(status.message.contains("wipe"), "{}", status.message);
    assert!(!west.is_running("west/0"));
    // Replicas never start ahead of the standby leader
    assert!(!west.is_running("west/1"));
    assert!(!sim.is_initialised("west").await);
}

#[tokio::test]
async fn test_broken_link_blocks_the_standby_until_promoted() {
    let mut sim = east_primary_at_three().await;
    sim.break_link("dr").await.unwrap();
    sim.settle(ROUNDS).await.unwrap();

    let status = sim.status("west/0").unwrap();
    assert_eq!(status.kind, StatusKind::Blocked);
    assert!(status.message.contains("read-only"), "{}", status.message);
    assert_eq!(
        sim.status("east/0").map(|s| s.kind),
        Some(StatusKind::Active)
    );
    for member in ["west/0", "west/1"] {
        assert_eq!(
            sim.member_value(member, keys::REINITIALISED_COUNTER).await,
            None
        );
    }

    let message = sim
        .promote("west/0", PromoteRequest::default())
        .await
        .unwrap();
    assert!(message.contains("west-0"), "{}", message);
    assert!(!sim.deployment("west").is_standby());
    assert_eq!(
        sim.status("west/0").map(|s| s.kind),
        Some(StatusKind::Active)
    );
}

#[tokio::test]
async fn test_broken_link_zeroes_the_demoted_epoch() {
    let mut sim = east_primary_at_three().await;
    let forced = PromoteRequest {
        scope: PromoteScope::Cluster,
        force: true,
    };
    sim.promote("west/0", forced).await.unwrap();
    sim.settle(ROUNDS).await.unwrap();
    assert!(sim.deployment("east").is_standby());
    assert_eq!(
        sim.deployment_value("east", keys::PROMOTED_CLUSTER_COUNTER)
            .await
            .as_deref(),
        Some("3")
    );

    sim.break_link("dr").await.unwrap();
    sim.settle(ROUNDS).await.unwrap();

    // The old primary no longer claims its epoch; the new one keeps it
    assert_eq!(
        sim.deployment_value("east", keys::PROMOTED_CLUSTER_COUNTER).await,
        None
    );
    assert_eq!(
        sim.deployment_value("west", keys::PROMOTED_CLUSTER_COUNTER)
            .await
            .as_deref(),
        Some("4")
    );
    assert_eq!(
        sim.status("east/0").map(|s| s.kind),
        Some(StatusKind::Blocked)
    );
    assert_eq!(
        sim.status("west/0").map(|s| s.kind),
        Some(StatusKind::Active)
    );
}

#[tokio::test]
async fn test_engine_version_mismatch_blocks_the_takeover() {
    let mut sim = Simulation::new();
    for (deployment, net, version) in [("east", 0, "16"), ("west", 1, "15")] {
        for i in 0..2 {
            let mut config = simulation_config(
                deployment,
                &format!("{}/{}", deployment, i),
                &format!("10.0.{}.{}", net, i + 1),
            );
            config.engine_version = version.to_string();
            sim.add_member_with(config).await.unwrap();
        }
    }
    sim.settle(ROUNDS).await.unwrap();
    sim.set_epoch("east", 3).await.unwrap();
    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await
        .unwrap();
    sim.settle(ROUNDS).await.unwrap();

    let west = sim.deployment("west");
    assert!(west.events_of("wipe").is_empty());
    assert!(west.events_of("stop").is_empty());
    assert!(!west.is_standby());
    assert!(west.is_running("west/0") && west.is_running("west/1"));
    for member in ["west/0", "west/1"] {
        let status = sim.status(member).unwrap();
        assert_eq!(status.kind, StatusKind::Blocked);
        assert!(status.message.contains("engine version"), "{}", status.message);
    }
    assert_eq!(acks(&sim, "west").await, vec![None, None]);
}

#[tokio::test]
async fn test_full_failover_and_failback_settle_in_bounded_rounds() {
    let mut sim = Simulation::new();
    for (deployment, net) in [("east", 0), ("west", 1)] {
        for i in 0..3 {
            sim.add_member(
                deployment,
                &format!("{}/{}", deployment, i),
                &format!("10.0.{}.{}", net, i + 1),
            )
            .await
            .unwrap();
        }
    }
    sim.settle(ROUNDS).await.unwrap();
    sim.establish_link("dr", LinkKind::Replication, "east", "west")
        .await
        .unwrap();
    sim.act("east/0", Event::CreateReplication).await.unwrap();
    sim.settle(ROUNDS).await.unwrap();

    let forced = PromoteRequest {
        force: true,
        ..Default::default()
    };
    sim.promote("west/0", forced).await.unwrap();
    sim.settle(ROUNDS).await.unwrap();
    sim.promote("east/0", forced).await.unwrap();
    sim.settle(ROUNDS).await.unwrap();

    assert_eq!(acks(&sim, "west").await, vec![Some("3".to_string()); 3]);
    assert!(sim.deployment("west").is_standby());
    assert!(!sim.deployment("east").is_standby());
    assert_wipes_after_all_stopped(&sim.deployment("east"), &["east/0", "east/1", "east/2"]);

    // Settled state is a fixed point
    let writes = sim.channel().write_count();
    sim.resync().await.unwrap();
    sim.settle(10).await.unwrap();
    assert_eq!(sim.channel().write_count(), writes);
}
