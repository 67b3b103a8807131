//! Local membership reconciliation in simulated deployments

use topokeeper::channel::{keys, CoordinationChannel};
use topokeeper::testing::Simulation;
use topokeeper::{Event, StatusKind};

async fn three_members() -> Simulation {
    let mut sim = Simulation::new();
    for i in 0..3 {
        sim.add_member("east", &format!("east/{}", i), &format!("10.0.0.{}", i + 1))
            .await
            .unwrap();
    }
    sim.settle(50).await.unwrap();
    sim
}

#[tokio::test]
async fn test_members_are_added_one_at_a_time() {
    let mut sim = three_members().await;
    let fake = sim.deployment("east");

    assert!(sim.is_initialised("east").await);
    assert_eq!(
        sim.members_ips("east").await,
        vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
    );
    for i in 0..3 {
        assert!(fake.is_running(&format!("east/{}", i)));
    }
    assert_eq!(fake.leader().as_deref(), Some("east/0"));

    // Every addition patched the synchronous node count
    let counts: Vec<u64> = fake
        .patches()
        .iter()
        .filter_map(|p| p["synchronous_node_count"].as_u64())
        .collect();
    assert_eq!(counts, vec![1, 2]);
    assert_eq!(
        sim.status("east/0").map(|s| s.kind),
        Some(StatusKind::Active)
    );
}

#[tokio::test]
async fn test_member_waits_until_added() {
    let mut sim = Simulation::new();
    sim.add_member("east", "east/0", "10.0.0.1").await.unwrap();
    sim.add_member("east", "east/1", "10.0.0.2").await.unwrap();
    sim.step().await.unwrap();

    // After the first round the follower published its address but is not
    // part of the member list yet
    assert_eq!(
        sim.member_value("east/1", keys::IP).await.as_deref(),
        Some("10.0.0.2")
    );
    assert!(!sim.deployment("east").is_running("east/1"));
    assert_eq!(
        sim.status("east/1").map(|s| s.kind),
        Some(StatusKind::Waiting)
    );

    sim.settle(30).await.unwrap();
    assert!(sim.deployment("east").is_running("east/1"));
}

#[tokio::test]
async fn test_departed_member_is_removed_from_raft_first() {
    let mut sim = three_members().await;
    let fake = sim.deployment("east");

    fake.fail_removes(true);
    sim.remove_member("east/2").await.unwrap();
    sim.settle(30).await.unwrap();

    // Raft removal failed: the address stays and the change is retried
    assert!(sim
        .members_ips("east")
        .await
        .contains(&"10.0.0.3".to_string()));
    assert!(sim.deferred("east/0").contains(&Event::MembershipChanged));

    fake.fail_removes(false);
    sim.settle(30).await.unwrap();
    assert_eq!(sim.members_ips("east").await, vec!["10.0.0.1", "10.0.0.2"]);
    assert!(sim.deferred("east/0").is_empty());
}

#[tokio::test]
async fn test_leader_departure_hands_over_reconciliation() {
    let mut sim = three_members().await;
    sim.remove_member("east/0").await.unwrap();
    sim.settle(30).await.unwrap();

    let leader = sim.channel().leader("east").await.unwrap();
    assert_eq!(leader.as_deref(), Some("east/1"));
    assert_eq!(sim.members_ips("east").await, vec!["10.0.0.2", "10.0.0.3"]);
    assert!(sim.is_initialised("east").await);
}

#[tokio::test]
async fn test_handlers_are_idempotent_once_settled() {
    let mut sim = three_members().await;
    let writes = sim.channel().write_count();
    let activity = sim.deployment("east").events().len();

    sim.tick().await;
    sim.resync().await.unwrap();
    sim.settle(10).await.unwrap();

    assert_eq!(sim.channel().write_count(), writes);
    assert_eq!(sim.deployment("east").events().len(), activity);
}
