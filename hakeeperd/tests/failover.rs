mod common;

use common::*;
use futures::future::join_all;
use hakeeper_api::{EngineRole, NodeRole, OpTime};
use hakeeperd::error::{HaError, SwitchoverRejection};
use hakeeperd::ha::Action;
use hakeeperd::record::{LeaderRecord, SwitchoverIntent};
use hakeeperd::store::Store;
use tokio::test;

/// `a` is the leader, `b` and `c` follow it
async fn elected(names: &[&str]) -> TestCluster {
    let cluster = TestCluster::new(names);
    cluster.at(0);
    cluster.cycle_all().await;
    assert_eq!(cluster.leaders(), ["a"]);
    cluster
}

#[test]
async fn first_member_becomes_leader() -> anyhow::Result<()> {
    let cluster = TestCluster::new(&["a", "b", "c"]);
    cluster.at(0);

    assert!(matches!(cluster.cycle("a").await, Ok(Action::Acquired)));
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Followed)));
    assert!(matches!(cluster.cycle("c").await, Ok(Action::Followed)));

    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Primary);
    assert_eq!(cluster.member("b").engine.current_source().as_deref(), Some("a"));
    assert_eq!(cluster.member("c").engine.current_source().as_deref(), Some("a"));
    assert_eq!(
        cluster.stored_leader().await.map(|r| r.leader).as_deref(),
        Some("a")
    );

    cluster.at(1);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::Renewed)));
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Following)));
    Ok(())
}

#[test]
async fn concurrent_cycles_elect_one_leader() -> anyhow::Result<()> {
    let cluster = TestCluster::new(&["a", "b", "c"]);
    cluster.at(0);

    join_all(cluster.members.iter().map(|m| m.ha.run_cycle())).await;
    cluster.at(1);
    cluster.cycle_all().await;

    assert_eq!(cluster.leaders().len(), 1);
    let primaries = cluster
        .members
        .iter()
        .filter(|m| m.engine.current_role() == EngineRole::Primary)
        .count();
    assert_eq!(primaries, 1);
    Ok(())
}

#[test]
async fn follower_takes_over_expired_lease() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;

    // `a` goes away: stops polling and answering probes
    cluster.probe.set_reachable("a", false);

    cluster.at(30);
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Following)));

    cluster.at(31);
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Acquired)));
    assert_eq!(cluster.member("b").engine.current_role(), EngineRole::Primary);

    cluster.at(32);
    assert!(matches!(cluster.cycle("c").await, Ok(Action::Followed)));
    assert_eq!(cluster.member("c").engine.current_source().as_deref(), Some("b"));
    assert_eq!(cluster.member("c").ha.status().role, NodeRole::Follower);
    assert_eq!(
        cluster.stored_leader().await.map(|r| r.leader).as_deref(),
        Some("b")
    );
    Ok(())
}

#[test]
async fn lagging_follower_never_takes_over() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;
    cluster.member("c").engine.set_op_time(OpTime(50));
    cluster.probe.set_reachable("a", false);

    cluster.at(31);
    assert!(matches!(cluster.cycle("c").await, Ok(Action::Declined)));
    assert!(cluster.stored_leader().await.map_or(false, |r| r.leader == "a"));

    assert!(matches!(cluster.cycle("b").await, Ok(Action::Acquired)));
    assert_eq!(cluster.member("c").engine.current_role(), EngineRole::Secondary);

    cluster.at(32);
    assert!(matches!(cluster.cycle("c").await, Ok(Action::Followed)));
    Ok(())
}

#[test]
async fn switchover_to_healthiest_member() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;

    let res = cluster.member("c").ha.switchover("", "").await;
    assert!(res.is_success(), "{}", res.message);
    assert!(cluster.stored_switchover().await.is_some());

    cluster.at(1);
    let res = cluster.cycle_all().await;
    assert!(matches!(res[0], Ok(Action::HandedOver)));
    assert!(matches!(res[1], Ok(Action::Acquired)));
    assert!(matches!(res[2], Ok(Action::Followed)));
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Secondary);

    cluster.at(2);
    cluster.cycle_all().await;
    assert_eq!(cluster.leaders(), ["b"]);
    assert_eq!(cluster.member("a").engine.current_source().as_deref(), Some("b"));
    assert_eq!(cluster.stored_switchover().await, None);
    Ok(())
}

#[test]
async fn switchover_to_named_candidate() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;

    let res = cluster.member("b").ha.switchover("a", "c").await;
    assert!(res.is_success(), "{}", res.message);

    cluster.at(1);
    let res = cluster.cycle_all().await;
    assert!(matches!(res[0], Ok(Action::HandedOver)));
    assert!(matches!(res[1], Ok(Action::Declined)));
    assert!(matches!(res[2], Ok(Action::Acquired)));

    cluster.at(2);
    cluster.cycle_all().await;
    assert_eq!(cluster.leaders(), ["c"]);
    assert_eq!(cluster.member("b").engine.current_source().as_deref(), Some("c"));
    assert_eq!(cluster.stored_switchover().await, None);
    Ok(())
}

#[test]
async fn invalid_switchover_requests_are_refused() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;
    let ha = &cluster.member("b").ha;

    let res = ha.switchover("", "not-a-member").await;
    assert!(!res.is_success());
    assert!(res.message.contains("not-a-member"), "{}", res.message);

    let res = ha.switchover("b", "").await;
    assert!(!res.is_success());
    assert!(res.message.contains("does not match"), "{}", res.message);

    assert_eq!(cluster.stored_switchover().await, None);

    let res = ha.switchover("", "c").await;
    assert!(res.is_success(), "{}", res.message);
    let res = ha.switchover("", "b").await;
    assert!(!res.is_success());
    assert!(res.message.contains("already in progress"), "{}", res.message);
    Ok(())
}

#[test]
async fn switchover_without_healthy_candidate_is_dropped() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b"]).await;
    cluster.probe.set_reachable("b", false);

    let res = cluster.member("a").ha.switchover("", "b").await;
    assert!(res.is_success(), "{}", res.message);

    cluster.at(1);
    assert!(matches!(
        cluster.cycle("a").await,
        Err(HaError::PreconditionFailed(_))
    ));
    assert_eq!(cluster.stored_switchover().await, None);
    assert_eq!(cluster.leaders(), ["a"]);
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Primary);
    Ok(())
}

#[test]
async fn switchover_to_lagging_candidate_is_refused() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;
    cluster.member("b").engine.set_op_time(OpTime(50));
    cluster.at(1);
    cluster.cycle_all().await;
    assert_eq!(cluster.member("b").ha.status().op_time, OpTime(50));

    let res = cluster.member("c").ha.switchover("", "b").await;
    assert!(res.is_success(), "{}", res.message);

    cluster.at(2);
    assert!(matches!(
        cluster.cycle("a").await,
        Err(HaError::PreconditionFailed(
            SwitchoverRejection::NoEligibleCandidate
        ))
    ));
    assert_eq!(cluster.stored_switchover().await, None);
    assert_eq!(cluster.leaders(), ["a"]);
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Primary);

    // the healthiest-member variant still finds `c`
    let res = cluster.member("c").ha.switchover("", "").await;
    assert!(res.is_success(), "{}", res.message);
    cluster.at(3);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::HandedOver)));
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Declined)));
    assert!(matches!(cluster.cycle("c").await, Ok(Action::Acquired)));
    Ok(())
}

/// Writes the intent straight to the store, skipping request checks
async fn stored_intent(cluster: &TestCluster, leader: &str, candidate: &str) -> anyhow::Result<()> {
    let intent = SwitchoverIntent {
        leader: leader.to_owned(),
        candidate: candidate.to_owned(),
        scheduled_at: T0,
        handed_over_at: None,
    };
    cluster
        .store
        .create(&cluster.keys().switchover(), intent.to_annotations())
        .await?;
    Ok(())
}

#[test]
async fn stored_intent_for_unknown_candidate_is_dropped() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;
    stored_intent(&cluster, "", "ghost").await?;

    cluster.at(1);
    let res = cluster.cycle("a").await;
    assert!(
        matches!(
            &res,
            Err(HaError::PreconditionFailed(SwitchoverRejection::CandidateNotFound(name))) if name == "ghost"
        ),
        "{res:?}"
    );
    assert_eq!(cluster.stored_switchover().await, None);
    assert_eq!(cluster.leaders(), ["a"]);
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Primary);

    cluster.at(2);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::Renewed)));
    Ok(())
}

#[test]
async fn stored_intent_for_other_leader_is_dropped() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;
    stored_intent(&cluster, "b", "").await?;

    cluster.at(1);
    let res = cluster.cycle("a").await;
    assert!(
        matches!(
            &res,
            Err(HaError::PreconditionFailed(SwitchoverRejection::LeaderMismatch {
                requested,
                current: Some(current),
            })) if requested == "b" && current == "a"
        ),
        "{res:?}"
    );
    assert_eq!(cluster.stored_switchover().await, None);
    assert_eq!(cluster.leaders(), ["a"]);
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Primary);
    assert_eq!(cluster.member("b").engine.current_role(), EngineRole::Secondary);
    Ok(())
}

#[test]
async fn failover_to_candidate_without_leader() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b", "c"]).await;
    cluster.probe.set_reachable("a", false);

    cluster.at(31);
    let ha = &cluster.member("b").ha;
    let res = ha.failover("").await;
    assert!(!res.is_success());
    let res = ha.failover("c").await;
    assert!(res.is_success(), "{}", res.message);

    assert!(matches!(cluster.cycle("b").await, Ok(Action::Declined)));
    assert!(matches!(cluster.cycle("c").await, Ok(Action::Acquired)));

    cluster.at(32);
    assert!(matches!(cluster.cycle("c").await, Ok(Action::Renewed)));
    assert_eq!(cluster.stored_switchover().await, None);
    Ok(())
}

#[test]
async fn promote_then_demote() -> anyhow::Result<()> {
    let cluster = TestCluster::new(&["a"]);
    cluster.at(0);
    let a = cluster.member("a");

    let res = a.ha.promote().await;
    assert!(res.is_success(), "{}", res.message);
    assert_eq!(a.engine.current_role(), EngineRole::Primary);
    assert_eq!(a.ha.status().role, NodeRole::Leader);
    assert_eq!(
        cluster.stored_leader().await.map(|r| r.leader).as_deref(),
        Some("a")
    );

    let res = a.ha.demote().await;
    assert!(res.is_success(), "{}", res.message);
    assert_eq!(a.engine.current_role(), EngineRole::Secondary);
    assert_eq!(a.ha.status().role, NodeRole::Follower);
    assert!(cluster
        .stored_leader()
        .await
        .map_or(false, |r| r.is_released()));

    // sits out instead of grabbing the lease right back
    cluster.at(1);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::AwaitingSuccessor)));
    assert_eq!(a.engine.current_role(), EngineRole::Secondary);
    Ok(())
}

#[test]
async fn promote_is_refused_while_lease_is_held() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b"]).await;

    let res = cluster.member("b").ha.promote().await;
    assert!(!res.is_success());
    assert_eq!(cluster.member("b").engine.current_role(), EngineRole::Secondary);
    assert_eq!(cluster.leaders(), ["a"]);
    Ok(())
}

#[test]
async fn overwritten_lease_demotes_leader() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b"]).await;

    let key = cluster.keys().leader();
    let entry = cluster.store.get(&key).await?.expect("leader record");
    cluster
        .store
        .update(
            &key,
            LeaderRecord::new("b", T0, 30, OpTime(100)).to_annotations(),
            entry.version,
        )
        .await?;

    cluster.at(1);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::Followed)));
    let a = cluster.member("a");
    assert_eq!(a.ha.status().role, NodeRole::Follower);
    assert_eq!(a.engine.current_role(), EngineRole::Secondary);
    assert_eq!(a.engine.current_source().as_deref(), Some("b"));
    Ok(())
}

#[test]
async fn degraded_leader_steps_down() -> anyhow::Result<()> {
    use hakeeperd::engine::Operation;

    let cluster = elected(&["a", "b", "c"]).await;
    cluster
        .member("a")
        .engine
        .set_failing(Operation::HealthCheck, true);

    cluster.at(1);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::Renewed)));
    cluster.at(2);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::Renewed)));
    cluster.at(3);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::SteppedDown)));
    assert!(cluster.member("a").ha.status().is_degraded);
    assert_eq!(cluster.member("a").ha.status().degraded_since, Some(T0.plus_secs(3)));
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Secondary);

    cluster.at(4);
    assert!(matches!(cluster.cycle("a").await, Ok(Action::Declined)));
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Acquired)));
    assert_eq!(cluster.leaders(), ["b"]);

    cluster
        .member("a")
        .engine
        .set_failing(Operation::HealthCheck, false);
    cluster.at(5);
    cluster.cycle("a").await?;
    assert!(!cluster.member("a").ha.status().is_degraded);
    assert_eq!(cluster.member("a").ha.status().degraded_since, None);
    Ok(())
}

#[test]
async fn leader_without_store_demotes_after_ttl() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b"]).await;
    cluster.store.set_available(false);

    cluster.at(10);
    assert!(matches!(cluster.cycle("a").await, Err(HaError::Unavailable(_))));
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Primary);
    assert_eq!(cluster.member("a").ha.status().role, NodeRole::Leader);

    cluster.at(31);
    assert!(matches!(cluster.cycle("a").await, Err(HaError::Unavailable(_))));
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Secondary);
    assert_eq!(cluster.member("a").ha.status().role, NodeRole::Follower);
    Ok(())
}

#[test]
async fn follower_replication_source_is_corrected() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b"]).await;
    let b = cluster.member("b");
    b.engine.set_source(Some("somewhere-else"));

    cluster.at(1);
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Followed)));
    assert_eq!(b.engine.current_source().as_deref(), Some("a"));

    cluster.at(2);
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Following)));
    Ok(())
}

#[test]
async fn shutdown_releases_lease_and_membership() -> anyhow::Result<()> {
    let cluster = elected(&["a", "b"]).await;

    cluster.member("a").ha.shutdown().await;
    assert_eq!(cluster.member("a").engine.current_role(), EngineRole::Secondary);
    assert!(cluster
        .stored_leader()
        .await
        .map_or(false, |r| r.is_released()));
    assert!(cluster
        .store
        .get(&cluster.keys().member("a"))
        .await?
        .is_none());

    cluster.at(1);
    assert!(matches!(cluster.cycle("b").await, Ok(Action::Acquired)));
    Ok(())
}
