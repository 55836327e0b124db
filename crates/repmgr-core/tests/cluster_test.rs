//! Two managers talking over loopback
//!
//! Site A is configured with site B; B discovers A from the handshake.

mod common;

use bytes::Bytes;
use common::{Collect, Elections, eventually, init_logging, start_quiet};
use repmgr_core::{
    AckPolicy, ConnState, Direction, Eid, Error, LogPosition, NoopHandler, RemoteSiteConfig,
    RepMgr, RepMgrConfig, SiteState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Pair {
    a: Arc<RepMgr>,
    b: Arc<RepMgr>,
    /// B as seen by A
    b_at_a: Eid,
    /// A as seen by B
    a_at_b: Eid,
    b_inbox: mpsc::UnboundedReceiver<(Eid, Bytes, Bytes)>,
    a_elections: Arc<Elections>,
}

async fn pair() -> Pair {
    pair_with(|config| config).await
}

/// Connected pair with `tune` applied to both configurations
async fn pair_with(tune: impl Fn(RepMgrConfig) -> RepMgrConfig) -> Pair {
    init_logging();
    let (collect, b_inbox) = Collect::new();
    let b = RepMgr::start(
        tune(RepMgrConfig::new("127.0.0.1", 0)),
        collect,
        Arc::new(NoopHandler),
    )
    .await
    .unwrap();

    let a_elections = Arc::new(Elections::default());
    let config = tune(RepMgrConfig::new("127.0.0.1", 0))
        .with_remote_site(RemoteSiteConfig::new("127.0.0.1", b.local_addr().port()));
    let a = RepMgr::start(config, Arc::new(NoopHandler), a_elections.clone())
        .await
        .unwrap();
    let b_at_a = Eid::new(0);

    eventually("A to see B ready", || {
        a.site(b_at_a).unwrap().connection_state == Some(ConnState::Ready)
    })
    .await;
    let a_port = a.local_addr().port();
    eventually("B to discover A", || {
        b.find_site("127.0.0.1", a_port)
            .and_then(|eid| b.site(eid).ok())
            .is_some_and(|site| site.connection_state == Some(ConnState::Ready))
    })
    .await;
    let a_at_b = b.find_site("127.0.0.1", a_port).unwrap();

    Pair {
        a,
        b,
        b_at_a,
        a_at_b,
        b_inbox,
        a_elections,
    }
}

#[tokio::test]
async fn test_sites_connect_and_learn_priorities() {
    let pair = pair().await;
    assert_eq!(pair.a.site(pair.b_at_a).unwrap().version, Some(2));
    assert_eq!(pair.a.site(pair.b_at_a).unwrap().priority, Some(100));
    eventually("B to learn A's priority", || {
        pair.b.site(pair.a_at_b).unwrap().priority == Some(100)
    })
    .await;
    assert_eq!(pair.a.stats().connections_initiated, 1);
    assert_eq!(pair.b.stats().connections_accepted, 1);
    pair.a.shutdown().await;
    pair.b.shutdown().await;
}

#[tokio::test]
async fn test_rep_messages_delivered_to_handler() {
    let mut pair = pair().await;
    for i in 0..20u32 {
        pair.a
            .send_to(
                pair.b_at_a,
                Bytes::copy_from_slice(&i.to_be_bytes()),
                Bytes::from(vec![i as u8; 100]),
            )
            .await
            .unwrap();
    }

    // Message threads run in parallel, so delivery order is not fixed.
    let mut seen = Vec::new();
    for _ in 0..20 {
        let (from, control, record) =
            tokio::time::timeout(Duration::from_secs(5), pair.b_inbox.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(from, pair.a_at_b);
        let n = u32::from_be_bytes(control[..].try_into().unwrap());
        assert_eq!(record, Bytes::from(vec![n as u8; 100]));
        seen.push(n);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<u32>>());
    assert_eq!(pair.a.stats().messages_sent, 20);
    eventually("B to count the messages", || {
        pair.b.stats().messages_received == 20
    })
    .await;
    assert_eq!(pair.b.stats().message_backlog, 0);

    pair.a.shutdown().await;
    pair.b.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_connected_sites() {
    let mut pair = pair().await;
    let queued = pair
        .a
        .broadcast(Bytes::from_static(b"log record"), Bytes::new())
        .unwrap();
    assert_eq!(queued, 1);
    let (from, control, record) =
        tokio::time::timeout(Duration::from_secs(5), pair.b_inbox.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(from, pair.a_at_b);
    assert_eq!(&control[..], b"log record");
    assert!(record.is_empty());
    pair.a.shutdown().await;
    pair.b.shutdown().await;
}

#[tokio::test]
async fn test_ack_releases_waiter() {
    let pair = pair().await;
    let target = LogPosition::new(3, 4096);

    let waiter = {
        let a = pair.a.clone();
        tokio::spawn(async move { a.wait_for_ack(target, AckPolicy::AllPeers).await })
    };
    pair.b.send_ack(pair.a_at_b, target).await.unwrap();
    waiter.await.unwrap().unwrap();

    eventually("A to record the ack", || {
        pair.a.site(pair.b_at_a).unwrap().max_ack == target
    })
    .await;
    assert_eq!(pair.a.stats().acks_received, 1);

    // Already acked: no wait.
    pair.a
        .wait_for_ack(LogPosition::new(3, 0), AckPolicy::Quorum)
        .await
        .unwrap();
    let err = pair
        .a
        .wait_for_ack(LogPosition::new(4, 0), AckPolicy::OnePeer)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AckTimeout));

    pair.a.shutdown().await;
    pair.b.shutdown().await;
}

#[tokio::test]
async fn test_lost_master_connection_triggers_election() {
    let pair = pair().await;
    pair.a.set_connection_retry(Duration::from_secs(3600));
    pair.a.set_master(Some(pair.b_at_a));
    let conn = pair.a.connection(pair.b_at_a).unwrap();

    pair.b.shutdown().await;

    eventually("A to bust the connection", || conn.is_defunct()).await;
    assert_eq!(conn.eid(), None);
    eventually("B to go idle at A", || {
        let site = pair.a.site(pair.b_at_a).unwrap();
        site.state == SiteState::Idle && site.retry_pending
    })
    .await;
    assert_eq!(pair.a_elections.count(), 1);
    assert_eq!(pair.a.stats().elections_triggered, 1);
    assert_eq!(pair.a.stats().connections_busted, 1);
    assert!(pair.a.links_consistent());
    assert!(matches!(
        pair.a.connection(pair.b_at_a),
        Err(Error::NotReady)
    ));
    let err = pair
        .a
        .send_to(pair.b_at_a, Bytes::from_static(b"x"), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotReady));

    pair.a.shutdown().await;
}

#[tokio::test]
async fn test_lost_non_master_does_not_trigger_election() {
    let pair = pair().await;
    pair.a.set_connection_retry(Duration::from_secs(3600));
    pair.b.shutdown().await;
    eventually("B to go idle at A", || {
        pair.a.site(pair.b_at_a).unwrap().state == SiteState::Idle
    })
    .await;
    assert_eq!(pair.a_elections.count(), 0);
    pair.a.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_restart() {
    let b = start_quiet(RepMgrConfig::new("127.0.0.1", 0)).await;
    let b_port = b.local_addr().port();
    let config = RepMgrConfig::new("127.0.0.1", 0)
        .with_remote_site(RemoteSiteConfig::new("127.0.0.1", b_port))
        .with_connection_retry_secs(1);
    let a = start_quiet(config).await;
    let eid = Eid::new(0);
    eventually("initial connection", || {
        a.site(eid).unwrap().connection_state == Some(ConnState::Ready)
    })
    .await;

    b.shutdown().await;
    eventually("connection loss", || a.site(eid).unwrap().state == SiteState::Idle).await;
    assert!(a.links_consistent());

    let restarted = start_quiet(RepMgrConfig::new("127.0.0.1", b_port)).await;
    eventually("reconnect", || {
        a.site(eid).unwrap().connection_state == Some(ConnState::Ready)
    })
    .await;
    assert!(a.stats().connections_initiated >= 2);
    assert!(a.links_consistent());
    assert!(!a.site(eid).unwrap().retry_pending);

    a.shutdown().await;
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_heartbeats_keep_master_connection() {
    let pair = pair_with(|config| {
        config
            .with_heartbeat_send_secs(1)
            .with_heartbeat_monitor_secs(3)
    })
    .await;
    pair.a.set_master(Some(pair.b_at_a));
    let conn = pair.a.connection(pair.b_at_a).unwrap();

    tokio::time::sleep(Duration::from_millis(4500)).await;

    assert!(pair.b.stats().heartbeats_sent > 0);
    assert!(conn.is_ready());
    assert_eq!(pair.a.connection(pair.b_at_a).unwrap().id(), conn.id());
    assert_eq!(pair.a.stats().connections_busted, 0);
    assert_eq!(pair.a_elections.count(), 0);
    pair.a.shutdown().await;
    pair.b.shutdown().await;
}

#[tokio::test]
async fn test_silent_master_is_busted() {
    // Only A watches; nobody sends heartbeats.
    init_logging();
    let b = start_quiet(RepMgrConfig::new("127.0.0.1", 0)).await;
    let elections = Arc::new(Elections::default());
    let config = RepMgrConfig::new("127.0.0.1", 0)
        .with_remote_site(RemoteSiteConfig::new("127.0.0.1", b.local_addr().port()))
        .with_connection_retry_secs(3600)
        .with_heartbeat_monitor_secs(2);
    let a = RepMgr::start(config, Arc::new(NoopHandler), elections.clone())
        .await
        .unwrap();
    let eid = Eid::new(0);
    eventually("A to see B ready", || {
        a.site(eid).unwrap().connection_state == Some(ConnState::Ready)
    })
    .await;
    a.set_master(Some(eid));

    eventually("A to give up on the master", || {
        let site = a.site(eid).unwrap();
        site.state == SiteState::Idle && site.retry_pending
    })
    .await;
    assert_eq!(elections.count(), 1);
    assert_eq!(a.stats().connections_busted, 1);
    assert_eq!(a.stats().heartbeats_sent, 0);
    assert!(a.links_consistent());
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_mutually_configured_sites_keep_one_connection() {
    init_logging();
    let (a_port, b_port) = (common::closed_port(), common::closed_port());
    let a_config = RepMgrConfig::new("127.0.0.1", a_port)
        .with_remote_site(RemoteSiteConfig::new("127.0.0.1", b_port));
    let b_config = RepMgrConfig::new("127.0.0.1", b_port)
        .with_remote_site(RemoteSiteConfig::new("127.0.0.1", a_port));
    let (a, b) = tokio::join!(start_quiet(a_config), start_quiet(b_config));
    let eid = Eid::new(0);

    let both_ready = || {
        [&a, &b]
            .iter()
            .all(|mgr| mgr.connection(eid).is_ok_and(|conn| conn.is_ready()))
    };
    eventually("both links ready", both_ready).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(both_ready());

    // Both ends kept the same socket: one dialed it, the other accepted it.
    let (at_a, at_b) = (a.connection(eid).unwrap(), b.connection(eid).unwrap());
    assert_ne!(at_a.direction(), at_b.direction());
    if at_a.direction() == Direction::Outgoing {
        assert_eq!(at_a.peer_addr(), Some(b.local_addr()));
    } else {
        assert_eq!(at_b.peer_addr(), Some(a.local_addr()));
    }
    for mgr in [&a, &b] {
        assert_eq!(mgr.sites().len(), 1);
        assert!(mgr.links_consistent());
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_oversize_messages_refused_locally() {
    let pair = pair_with(|config| config.with_max_message_size(64)).await;
    let err = pair
        .a
        .send_to(pair.b_at_a, Bytes::from(vec![0u8; 40]), Bytes::from(vec![0u8; 40]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedFrame(_)));
    let err = pair
        .a
        .broadcast(Bytes::from(vec![0u8; 65]), Bytes::new())
        .unwrap_err();
    assert!(matches!(err, Error::MalformedFrame(_)));

    // A message at the limit still goes through on the same connection.
    pair.a
        .send_to(pair.b_at_a, Bytes::from(vec![1u8; 32]), Bytes::from(vec![2u8; 32]))
        .await
        .unwrap();
    eventually("B to receive it", || pair.b.stats().messages_received == 1).await;
    assert!(pair.a.connection(pair.b_at_a).unwrap().is_ready());
    assert_eq!(pair.a.stats().messages_sent, 1);
    assert_eq!(pair.a.stats().connections_busted, 0);
    assert_eq!(pair.b.stats().connections_busted, 0);
    pair.a.shutdown().await;
    pair.b.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_blocked_waiters() {
    let pair = pair().await;
    let waiter = {
        let a = pair.a.clone();
        tokio::spawn(async move {
            a.wait_for_ack(LogPosition::new(9, 9), AckPolicy::AllPeers)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    pair.a.shutdown().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Shutdown | Error::AckTimeout));
    pair.b.shutdown().await;
}
