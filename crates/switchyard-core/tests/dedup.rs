use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use switchyard_core::broadcast::{Broadcaster, StreamOutcome};
use switchyard_core::dedup::{BeginRole, DedupRegistry, SharedOutcome, SharedResponse};

const TTL: Duration = Duration::from_secs(60);

fn response(text: &str) -> SharedResponse {
    SharedResponse {
        status: 200,
        body: Bytes::from(text.to_string()),
    }
}

#[tokio::test]
async fn second_arrival_waits_for_the_owner() {
    let registry = DedupRegistry::new();
    assert!(matches!(registry.begin("fp", TTL), BeginRole::Owner));

    let BeginRole::Wait(rx) = registry.begin("fp", TTL) else {
        panic!("expected waiter role");
    };
    registry.complete("fp", response("answer"));

    let outcome = timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    match outcome {
        SharedOutcome::Unary(shared) => {
            assert_eq!(shared.status, 200);
            assert_eq!(shared.body, Bytes::from("answer"));
        }
        SharedOutcome::Stream(_) => panic!("expected unary outcome"),
    }
    // Entry removed: the next arrival owns the fingerprint again.
    assert!(matches!(registry.begin("fp", TTL), BeginRole::Owner));
}

#[tokio::test]
async fn all_waiters_receive_the_same_failure() {
    let registry = DedupRegistry::new();
    assert!(matches!(registry.begin("fp", TTL), BeginRole::Owner));
    let mut receivers = Vec::new();
    for _ in 0..3 {
        match registry.begin("fp", TTL) {
            BeginRole::Wait(rx) => receivers.push(rx),
            _ => panic!("expected waiter role"),
        }
    }

    registry.fail(
        "fp",
        SharedResponse {
            status: 503,
            body: Bytes::from_static(b"overloaded"),
        },
    );
    for rx in receivers {
        match rx.await.unwrap() {
            SharedOutcome::Unary(shared) => assert_eq!(shared.status, 503),
            SharedOutcome::Stream(_) => panic!("expected unary outcome"),
        }
    }
}

#[tokio::test]
async fn publishing_a_stream_upgrades_waiters_and_late_joiners() {
    let registry = DedupRegistry::new();
    assert!(matches!(registry.begin("fp", TTL), BeginRole::Owner));
    let BeginRole::Wait(rx) = registry.begin("fp", TTL) else {
        panic!("expected waiter role");
    };

    let broadcaster = Broadcaster::new(16);
    broadcaster.push(Bytes::from_static(b"event: ping\n\n"));
    registry.publish_stream("fp", broadcaster.clone());

    // The early waiter is promoted to a stream subscriber.
    let SharedOutcome::Stream(joined) = rx.await.unwrap() else {
        panic!("expected stream outcome");
    };
    let mut subscriber = joined.subscribe();

    // A later duplicate joins directly.
    let BeginRole::Join(direct) = registry.begin("fp", TTL) else {
        panic!("expected join role");
    };
    let mut direct_subscriber = direct.subscribe();

    broadcaster.finish(StreamOutcome::Completed);
    assert_eq!(
        subscriber.next().await.unwrap(),
        Some(Bytes::from_static(b"event: ping\n\n"))
    );
    assert_eq!(
        direct_subscriber.next().await.unwrap(),
        Some(Bytes::from_static(b"event: ping\n\n"))
    );
}

#[tokio::test]
async fn expired_pending_owner_is_demoted() {
    let registry = DedupRegistry::new();
    let ttl = Duration::from_millis(20);
    assert!(matches!(registry.begin("fp", ttl), BeginRole::Owner));
    let BeginRole::Wait(rx) = registry.begin("fp", ttl) else {
        panic!("expected waiter role");
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    // The stale entry is evicted; a fresh arrival becomes the new owner and
    // the abandoned waiter's channel closes.
    assert!(matches!(registry.begin("fp", ttl), BeginRole::Owner));
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn abandon_clears_the_entry_without_waking() {
    let registry = DedupRegistry::new();
    assert!(matches!(registry.begin("fp", TTL), BeginRole::Owner));
    registry.abandon("fp");
    assert!(registry.is_empty());
    assert!(matches!(registry.begin("fp", TTL), BeginRole::Owner));
}
