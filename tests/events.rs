mod common;

use common::{build_broker, build_broker_with_buffer, setup_db};

use opsflow::events::EventsRepo;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[serial]
async fn publish_assigns_strictly_increasing_seq() {
    let pool = setup_db().await;
    let (_poller, broker) = build_broker(&pool);

    let first = broker
        .publish("p1", "session_updated", json!({"sessionId": "s1"}))
        .await
        .unwrap();
    let second = broker
        .publish("p2", "workspace_updated", json!({"workspaceId": "w1"}))
        .await
        .unwrap();
    let third = broker
        .publish("p1", "session_updated", json!({"sessionId": "s1"}))
        .await
        .unwrap();

    assert!(first.seq < second.seq);
    assert!(second.seq < third.seq);
}

#[tokio::test]
#[serial]
async fn typed_publishers_use_stable_payload_shapes() {
    let pool = setup_db().await;
    let (_poller, broker) = build_broker(&pool);

    let session = broker
        .publish_session_updated("p1", "sess-1", "running", Some("dirty"))
        .await
        .unwrap();
    assert_eq!(session.event_type, "session_updated");
    assert_eq!(session.data["sessionId"], "sess-1");
    assert_eq!(session.data["status"], "running");
    assert_eq!(session.data["commitStatus"], "dirty");

    let workspace = broker
        .publish_workspace_updated("p1", "ws-1", "ready")
        .await
        .unwrap();
    assert_eq!(workspace.event_type, "workspace_updated");
    assert_eq!(workspace.data["workspaceId"], "ws-1");
    assert_eq!(workspace.data["status"], "ready");

    // SSE wire shape: renamed type/timestamp keys, data passed through.
    let wire = serde_json::to_value(session.wire()).unwrap();
    assert_eq!(wire["type"], "session_updated");
    assert_eq!(wire["seq"], session.seq);
    assert!(wire.get("timestamp").is_some());
}

#[tokio::test]
#[serial]
async fn replay_is_scoped_to_one_project() {
    let pool = setup_db().await;
    let (_poller, broker) = build_broker(&pool);
    let events = EventsRepo::new(pool.clone());

    let a1 = broker.publish("project-a", "session_updated", json!({})).await.unwrap();
    let _b1 = broker.publish("project-b", "session_updated", json!({})).await.unwrap();
    let a2 = broker.publish("project-a", "workspace_updated", json!({})).await.unwrap();

    let all_a = events
        .list_project_events_after_seq("project-a", 0, 100)
        .await
        .unwrap();
    assert_eq!(
        all_a.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![a1.seq, a2.seq]
    );
    assert!(all_a.iter().all(|e| e.project_id == "project-a"));

    // Boundary is exclusive: replaying from a1 yields only a2.
    let after_a1 = events
        .list_project_events_after_seq("project-a", a1.seq, 100)
        .await
        .unwrap();
    assert_eq!(after_a1.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![a2.seq]);

    // Time-based replay is scoped the same way.
    let since = chrono::Utc::now() - chrono::Duration::minutes(5);
    let recent_a = events
        .list_project_events_since("project-a", since, 100)
        .await
        .unwrap();
    assert_eq!(recent_a.len(), 2);
    assert!(recent_a.iter().all(|e| e.project_id == "project-a"));
}

#[tokio::test]
#[serial]
async fn poller_fans_out_only_to_matching_project() {
    let pool = setup_db().await;
    let (poller, broker) = build_broker(&pool);
    let handle = Arc::clone(&poller).start();

    let mut sub_a = Arc::clone(&poller).subscribe("project-a");
    let mut sub_b = Arc::clone(&poller).subscribe("project-b");

    let published = broker
        .publish("project-a", "session_updated", json!({"sessionId": "s1"}))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), sub_a.recv())
        .await
        .expect("subscriber should receive the event in time")
        .expect("subscription should stay open");
    assert_eq!(received.seq, published.seq);
    assert_eq!(received.event_type, "session_updated");

    // The other project's subscriber sees nothing.
    let nothing = tokio::time::timeout(Duration::from_millis(400), sub_b.recv()).await;
    assert!(nothing.is_err(), "event leaked across projects");

    handle.shutdown().await;
}

#[tokio::test]
#[serial]
async fn late_subscriber_never_sees_history() {
    let pool = setup_db().await;
    let (poller, broker) = build_broker(&pool);

    // Persisted before the poller starts: history, not broadcast.
    broker
        .publish("project-a", "session_updated", json!({"old": true}))
        .await
        .unwrap();

    let handle = Arc::clone(&poller).start();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut sub = Arc::clone(&poller).subscribe("project-a");

    let fresh = broker
        .publish("project-a", "session_updated", json!({"old": false}))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("fresh event should arrive")
        .expect("subscription should stay open");
    assert_eq!(received.seq, fresh.seq);
    assert_eq!(received.data["old"], false);

    let nothing = tokio::time::timeout(Duration::from_millis(300), sub.recv()).await;
    assert!(nothing.is_err(), "historical event was re-broadcast");

    handle.shutdown().await;
}

#[tokio::test]
#[serial]
async fn full_subscriber_buffer_drops_instead_of_blocking() {
    let pool = setup_db().await;
    let (poller, broker) = build_broker_with_buffer(&pool, 1);
    let handle = Arc::clone(&poller).start();

    let mut sub = Arc::clone(&poller).subscribe("project-a");

    // Nobody is draining the buffer, so only the first event fits.
    let first = broker.publish("project-a", "session_updated", json!({"n": 1})).await.unwrap();
    for n in 2..=5 {
        broker
            .publish("project-a", "session_updated", json!({"n": n}))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let received = sub.recv().await.expect("buffered event");
    assert_eq!(received.seq, first.seq);

    let nothing = tokio::time::timeout(Duration::from_millis(300), sub.recv()).await;
    assert!(nothing.is_err(), "overflow events should have been dropped");

    // The dropped events are still durable for replay.
    let events = EventsRepo::new(pool.clone());
    let all = events
        .list_project_events_after_seq("project-a", 0, 100)
        .await
        .unwrap();
    assert_eq!(all.len(), 5);

    handle.shutdown().await;
}

#[tokio::test]
#[serial]
async fn dropped_subscription_detaches_from_the_poller() {
    let pool = setup_db().await;
    let (poller, _broker) = build_broker(&pool);

    let sub_a = Arc::clone(&poller).subscribe("project-a");
    let _sub_b = Arc::clone(&poller).subscribe("project-b");
    assert_eq!(poller.subscriber_count(), 2);

    drop(sub_a);
    assert_eq!(poller.subscriber_count(), 1);
}
