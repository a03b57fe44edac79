//! TunnelManager against the in-memory transport.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::FakeTransport;
use spyder_remote_client::{ClientError, ReconnectPolicy, TunnelManager};

fn manager(transport: &Arc<FakeTransport>) -> TunnelManager {
    TunnelManager::with_policy(
        transport.clone(),
        ReconnectPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            attempts: 3,
        },
    )
}

#[tokio::test]
async fn test_leases_on_one_target_share_a_forwarding() {
    let transport = FakeTransport::new();
    let tunnels = manager(&transport);

    let (p1, h1) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    let (p2, h2) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    assert_eq!(p1, p2);
    assert_ne!(h1, h2);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    assert_eq!(tunnels.open_forwardings().await, 1);

    tunnels.release(&h1).await;
    assert_eq!(tunnels.open_forwardings().await, 1);
    assert_eq!(transport.active_forwards(), 1);

    tunnels.release(&h2).await;
    assert_eq!(tunnels.open_forwardings().await, 0);
    assert_eq!(transport.active_forwards(), 0);
}

#[tokio::test]
async fn test_concurrent_leases_coalesce() {
    let transport = FakeTransport::new();
    let tunnels = Arc::new(manager(&transport));

    let (a, b) = tokio::join!(
        tunnels.lease("127.0.0.1", 50001),
        tunnels.lease("127.0.0.1", 50001)
    );
    let (pa, _) = a.unwrap();
    let (pb, _) = b.unwrap();
    assert_eq!(pa, pb);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_distinct_targets_get_distinct_ports() {
    let transport = FakeTransport::new();
    let tunnels = manager(&transport);

    let (p1, _) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    let (p2, _) = tunnels.lease("127.0.0.1", 50002).await.unwrap();
    let (p3, _) = tunnels.lease("10.0.0.5", 50001).await.unwrap();
    assert_ne!(p1, p2);
    assert_ne!(p1, p3);
    assert_eq!(tunnels.open_forwardings().await, 3);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let transport = FakeTransport::new();
    let tunnels = manager(&transport);

    let (_, h1) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    let (_, h2) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    tunnels.release(&h1).await;
    tunnels.release(&h1).await;
    assert_eq!(tunnels.open_forwardings().await, 1);
    assert!(tunnels.local_port(&h2).await.is_some());
    assert!(tunnels.local_port(&h1).await.is_none());

    tunnels.release(&h2).await;
    assert_eq!(transport.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_busy_local_port_is_retried() {
    let transport = FakeTransport::new();
    transport.busy_ports.store(2, Ordering::SeqCst);
    let tunnels = manager(&transport);

    let (port, _) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
    assert_eq!(transport.forwards_to(50001), vec![port]);
}

#[tokio::test]
async fn test_no_free_port_after_three_collisions() {
    let transport = FakeTransport::new();
    transport.busy_ports.store(3, Ordering::SeqCst);
    let tunnels = manager(&transport);

    let err = tunnels.lease("127.0.0.1", 50001).await.unwrap_err();
    assert!(matches!(err, ClientError::NoFreePort(_)), "{err:?}");
    assert_eq!(tunnels.open_forwardings().await, 0);
}

#[tokio::test]
async fn test_denied_forwarding() {
    let transport = FakeTransport::new();
    transport.deny.store(true, Ordering::SeqCst);
    let tunnels = manager(&transport);

    let err = tunnels.lease("127.0.0.1", 50001).await.unwrap_err();
    assert!(matches!(err, ClientError::TunnelDenied(_)), "{err:?}");
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_tears_everything_down() {
    let transport = FakeTransport::new();
    let tunnels = manager(&transport);

    let (_, h) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    tunnels.lease("127.0.0.1", 50002).await.unwrap();
    tunnels.close().await;

    assert_eq!(tunnels.open_forwardings().await, 0);
    assert_eq!(transport.active_forwards(), 0);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    // Releasing after close is harmless.
    tunnels.release(&h).await;

    let err = tunnels.lease("127.0.0.1", 50001).await.unwrap_err();
    assert!(matches!(err, ClientError::TransportLost(_)));
}

#[tokio::test]
async fn test_recover_reopens_on_the_same_ports() {
    let transport = FakeTransport::new();
    let tunnels = manager(&transport);

    let (p1, h1) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    let (p2, _) = tunnels.lease("127.0.0.1", 50002).await.unwrap();

    transport.dead.store(true, Ordering::SeqCst);
    transport.failing_connects.store(1, Ordering::SeqCst);
    tunnels.recover().await.unwrap();

    assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
    assert_eq!(transport.forwards_to(50001), vec![p1]);
    assert_eq!(transport.forwards_to(50002), vec![p2]);
    assert_eq!(tunnels.local_port(&h1).await, Some(p1));
}

#[tokio::test]
async fn test_recover_is_a_no_op_while_alive() {
    let transport = FakeTransport::new();
    let tunnels = manager(&transport);
    tunnels.lease("127.0.0.1", 50001).await.unwrap();

    tunnels.recover().await.unwrap();
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_recovery_invalidates_the_manager() {
    let transport = FakeTransport::new();
    let tunnels = manager(&transport);
    let (_, h) = tunnels.lease("127.0.0.1", 50001).await.unwrap();

    transport.dead.store(true, Ordering::SeqCst);
    transport.failing_connects.store(10, Ordering::SeqCst);
    let err = tunnels.recover().await.unwrap_err();
    assert!(matches!(err, ClientError::TransportLost(_)));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1 + 3);

    assert_eq!(tunnels.open_forwardings().await, 0);
    assert!(tunnels.local_port(&h).await.is_none());
    let err = tunnels.lease("127.0.0.1", 50001).await.unwrap_err();
    assert!(matches!(err, ClientError::TransportLost(_)));
}

#[tokio::test]
async fn test_manager_stays_usable_while_recovering() {
    let transport = FakeTransport::new();
    let tunnels = Arc::new(TunnelManager::with_policy(
        transport.clone(),
        ReconnectPolicy {
            base: Duration::from_millis(300),
            cap: Duration::from_millis(300),
            attempts: 2,
        },
    ));
    let (p1, _h1) = tunnels.lease("127.0.0.1", 50001).await.unwrap();
    let (_, h2) = tunnels.lease("127.0.0.1", 50002).await.unwrap();

    transport.dead.store(true, Ordering::SeqCst);
    transport.failing_connects.store(1, Ordering::SeqCst);
    let recovering = tokio::spawn({
        let tunnels = Arc::clone(&tunnels);
        async move { tunnels.recover().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First attempt failed; the manager is backing off, not locked.
    tokio::time::timeout(Duration::from_millis(100), tunnels.release(&h2))
        .await
        .unwrap();
    let open = tokio::time::timeout(Duration::from_millis(100), tunnels.open_forwardings())
        .await
        .unwrap();
    assert_eq!(open, 1);
    assert!(!recovering.is_finished());

    recovering.await.unwrap().unwrap();
    assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
    assert_eq!(transport.forwards_to(50001), vec![p1]);
    assert!(transport.forwards_to(50002).is_empty());
}
