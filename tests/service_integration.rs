//! End-to-end behavior of the notification service on the memory backend.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use notify_engine::backend::NotificationBackend;
use notify_engine::error::NotifyError;
use notify_engine::notification::{
    HookEvent, Notification, NotificationMode, NotificationService, NotifyRequest, SendOutcome,
};

use common::{memory_service, recv_within, FailingStoreBackend};

fn step(n: &Notification) -> Option<&str> {
    n.payload.get("step").and_then(|v| v.as_str())
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_a_session_notification_is_queued() {
    let service = memory_service().await;
    service
        .notify_session("s1", Notification::builder("ping").build())
        .await
        .unwrap();

    let queued = service.get_queued("s1", None).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].notification_type, "ping");
}

#[tokio::test]
async fn scenario_b_group_replacement_keeps_latest() {
    let service = memory_service().await;
    let mut queue = service.register_connection("s1", None).await.unwrap();

    let first = service
        .notify_session(
            "s1",
            Notification::builder("deploy").group("deploy").field("step", "1").build(),
        )
        .await
        .unwrap();
    let first_id = first.notification().unwrap().id;

    service
        .notify_session(
            "s1",
            Notification::builder("deploy").group("deploy").field("step", "2").build(),
        )
        .await
        .unwrap();

    let queued = service.get_queued("s1", None).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(step(&queued[0]), Some("2"));

    // step 1, then its dismissal, then step 2
    let events = queue.drain();
    assert_eq!(events.len(), 3);
    assert_eq!(step(&events[0]), Some("1"));
    assert!(events[1].is_dismissal());
    assert_eq!(events[1].id, first_id);
    assert_eq!(step(&events[2]), Some("2"));
}

#[tokio::test]
async fn scenario_c_timeseries_cannot_be_dismissed() {
    let service = memory_service().await;
    let outcome = service
        .notify_session(
            "s1",
            Notification::builder("audit").mode(NotificationMode::Timeseries).build(),
        )
        .await
        .unwrap();
    let id = outcome.notification().unwrap().id;

    let err = service.dismiss("s1", None, Some(id), None).await.unwrap_err();
    assert!(matches!(err, NotifyError::DismissNotAllowed { id: rejected } if rejected == id));

    // still stored
    let history = service
        .get_since("s1", None, Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn scenario_d_user_notification_reaches_session_once() {
    let service = memory_service().await;
    let mut queue = service.register_connection("s1", Some("u1")).await.unwrap();

    service
        .notify_user("u1", Notification::builder("alert").build())
        .await
        .unwrap();

    let received = queue.drain();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].notification_type, "alert");
}

// =============================================================================
// Delivery modes and ordering
// =============================================================================

#[tokio::test]
async fn test_timeseries_and_ephemeral_storage_rules() {
    let service = memory_service().await;
    let before = Utc::now() - ChronoDuration::seconds(1);
    let mut queue = service.register_connection("s1", None).await.unwrap();

    service
        .notify_session("s1", Notification::builder("metric").mode(NotificationMode::Timeseries).build())
        .await
        .unwrap();
    service
        .notify_session("s1", Notification::builder("typing").mode(NotificationMode::Ephemeral).build())
        .await
        .unwrap();

    // both delivered live
    assert_eq!(queue.drain().len(), 2);

    assert!(service.get_queued("s1", None).await.unwrap().is_empty());
    let history = service.get_since("s1", None, before).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].notification_type, "metric");
}

#[tokio::test]
async fn test_get_since_is_strictly_after() {
    let service = memory_service().await;
    let outcome = service
        .notify_session("s1", Notification::builder("m").mode(NotificationMode::Timeseries).build())
        .await
        .unwrap();
    let created = outcome.notification().unwrap().created_at;

    assert!(service.get_since("s1", None, created).await.unwrap().is_empty());
    assert_eq!(
        service
            .get_since("s1", None, created - ChronoDuration::microseconds(1))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_get_queued_merges_scopes_in_creation_order() {
    let service = memory_service().await;
    let pause = || tokio::time::sleep(std::time::Duration::from_millis(2));
    service
        .notify_broadcast(Notification::builder("first").build())
        .await
        .unwrap();
    pause().await;
    service
        .notify_user("u1", Notification::builder("second").build())
        .await
        .unwrap();
    pause().await;
    service
        .notify_session("s1", Notification::builder("third").build())
        .await
        .unwrap();
    service
        .notify_session("other", Notification::builder("unrelated").build())
        .await
        .unwrap();

    let queued = service.get_queued("s1", Some("u1")).await.unwrap();
    let types: Vec<_> = queued.iter().map(|n| n.notification_type.as_str()).collect();
    assert_eq!(types, vec!["first", "second", "third"]);

    let mut sorted = queued.clone();
    sorted.sort_by_key(|n| n.created_at);
    assert_eq!(queued, sorted);
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_topic_subscription_delivers_and_replays() {
    let service = memory_service().await;
    service.subscribe_source("user:u1", "blog:tech").await.unwrap();

    let mut queue = service.register_connection("s1", Some("u1")).await.unwrap();
    service
        .notify_source("blog:tech", Notification::builder("post").build())
        .await
        .unwrap();

    assert_eq!(queue.drain().len(), 1);
    let queued = service.get_queued("s1", Some("u1")).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].notification_type, "post");
}

#[tokio::test]
async fn test_subscriptions_are_idempotent() {
    let service = memory_service().await;
    service.subscribe_source("user:u1", "blog:tech").await.unwrap();
    service.subscribe_source("user:u1", "blog:tech").await.unwrap();

    let subs = service.backend().get_subscriptions("user:u1").await.unwrap();
    assert_eq!(subs, vec!["blog:tech".to_string()]);

    let mut queue = service.register_connection("s1", Some("u1")).await.unwrap();
    service
        .notify_source("blog:tech", Notification::builder("post").build())
        .await
        .unwrap();
    assert_eq!(queue.drain().len(), 1);

    service.unsubscribe_source("user:u1", "blog:tech").await.unwrap();
    service.unsubscribe_source("user:u1", "blog:tech").await.unwrap();
    assert!(service.backend().get_subscriptions("user:u1").await.unwrap().is_empty());
    assert!(!service.resolve_upstream("user:u1").contains("blog:tech"));
}

#[tokio::test]
async fn test_last_connection_tears_down_session_edges() {
    let service = memory_service().await;
    let first = service.register_connection("s1", Some("u1")).await.unwrap();
    let second = service.register_connection("s1", Some("u1")).await.unwrap();
    assert!(!service.resolve_upstream("session:s1").is_empty());

    assert!(service.unregister_connection("s1", first.id()));
    assert!(!service.resolve_upstream("session:s1").is_empty());

    assert!(service.unregister_connection("s1", second.id()));
    assert!(service.resolve_upstream("session:s1").is_empty());

    // unknown listener
    assert!(!service.unregister_connection("s1", second.id()));
}

// =============================================================================
// Dismissal
// =============================================================================

#[tokio::test]
async fn test_dismiss_by_id_pushes_sentinel_at_user_scope() {
    let service = memory_service().await;
    let mut phone = service.register_connection("phone", Some("u1")).await.unwrap();
    let mut laptop = service.register_connection("laptop", Some("u1")).await.unwrap();

    let id = service
        .notify_user("u1", Notification::builder("invite").build())
        .await
        .unwrap()
        .notification()
        .unwrap()
        .id;
    phone.drain();
    laptop.drain();

    assert!(service.dismiss("phone", Some("u1"), Some(id), None).await.unwrap());
    assert!(service.get_queued("phone", Some("u1")).await.unwrap().is_empty());

    for queue in [&mut phone, &mut laptop] {
        let events = queue.drain();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_dismissal());
        assert_eq!(events[0].id, id);
    }

    // second dismissal finds nothing
    assert!(!service.dismiss("phone", Some("u1"), Some(id), None).await.unwrap());
}

#[tokio::test]
async fn test_dismiss_by_group() {
    let service = memory_service().await;
    service
        .notify_session("s1", Notification::builder("upload").group("upload").build())
        .await
        .unwrap();
    service
        .notify_user("u1", Notification::builder("sync").group("sync").build())
        .await
        .unwrap();

    assert!(service.dismiss("s1", Some("u1"), None, Some("upload")).await.unwrap());
    assert!(service.dismiss("s1", Some("u1"), None, Some("sync")).await.unwrap());
    assert!(!service.dismiss("s1", Some("u1"), None, Some("missing")).await.unwrap());
    assert!(service.get_queued("s1", Some("u1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dismiss_timeseries_by_group_is_rejected() {
    let service = memory_service().await;
    let id = service
        .notify_session(
            "s1",
            Notification::builder("build").group("ci").mode(NotificationMode::Timeseries).build(),
        )
        .await
        .unwrap()
        .notification()
        .unwrap()
        .id;

    let err = service.dismiss("s1", None, None, Some("ci")).await.unwrap_err();
    assert!(matches!(err, NotifyError::DismissNotAllowed { id: rejected } if rejected == id));

    let history = service
        .get_since("s1", None, Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, id);
}

#[tokio::test]
async fn test_group_dismiss_rejected_leaves_other_scopes_untouched() {
    let service = memory_service().await;
    let mut queue = service.register_connection("s1", Some("u1")).await.unwrap();

    service
        .notify_session("s1", Notification::builder("progress").group("g").build())
        .await
        .unwrap();
    service
        .notify_user(
            "u1",
            Notification::builder("history").group("g").mode(NotificationMode::Timeseries).build(),
        )
        .await
        .unwrap();
    queue.drain();

    let err = service.dismiss("s1", Some("u1"), None, Some("g")).await.unwrap_err();
    assert!(matches!(err, NotifyError::DismissNotAllowed { .. }));

    // nothing removed, nothing announced
    let queued = service.get_queued("s1", Some("u1")).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].notification_type, "progress");
    assert!(queue.drain().is_empty());
}

// =============================================================================
// Storage failure
// =============================================================================

#[tokio::test]
async fn test_failed_store_aborts_send_before_delivery() {
    let backend = Arc::new(FailingStoreBackend::default());
    let service = NotificationService::new(backend.clone());
    service.start().await.unwrap();
    let mut queue = service.register_connection("s1", None).await.unwrap();

    let err = service
        .notify_session("s1", Notification::builder("lost").build())
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Storage(_)));
    assert!(queue.drain().is_empty());
    assert_eq!(backend.publishes(), 0);

    // ephemeral sends skip storage and still go out
    service
        .notify_session("s1", Notification::builder("live").mode(NotificationMode::Ephemeral).build())
        .await
        .unwrap();
    assert_eq!(queue.drain().len(), 1);
    assert_eq!(backend.publishes(), 1);
}

// =============================================================================
// Hooks and ingress
// =============================================================================

#[tokio::test]
async fn test_filter_can_cancel_and_rewrite() {
    let service = memory_service().await;
    service.hooks().add_filter_fn(0, |_source: &str, n: Notification| {
        if n.notification_type == "spam" {
            None
        } else {
            let mut n = n;
            n.payload.insert("filtered".into(), json!(true));
            Some(n)
        }
    });

    let outcome = service
        .notify_session("s1", Notification::builder("spam").build())
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Cancelled));

    service
        .notify_session("s1", Notification::builder("ham").build())
        .await
        .unwrap();
    let queued = service.get_queued("s1", None).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload.get("filtered"), Some(&json!(true)));
}

#[tokio::test]
async fn test_actions_observe_sends_and_dismissals() {
    let service = memory_service().await;
    let sent = Arc::new(AtomicUsize::new(0));
    let dismissed = Arc::new(AtomicUsize::new(0));
    {
        let sent = sent.clone();
        let dismissed = dismissed.clone();
        service.hooks().add_action_fn(0, move |event: &HookEvent| match event {
            HookEvent::Sent { .. } => {
                sent.fetch_add(1, Ordering::SeqCst);
            }
            HookEvent::Dismissed { .. } => {
                dismissed.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let id = service
        .notify_session("s1", Notification::builder("a").build())
        .await
        .unwrap()
        .notification()
        .unwrap()
        .id;
    service.dismiss("s1", None, Some(id), None).await.unwrap();

    assert_eq!(sent.load(Ordering::SeqCst), 1);
    assert_eq!(dismissed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dispatch_routes_ingress_request() {
    let service = memory_service().await;
    let mut queue = service.register_connection("s1", Some("u1")).await.unwrap();

    let request: NotifyRequest = serde_json::from_value(json!({
        "target": "user",
        "user_id": "u1",
        "type": "alert",
        "payload": {"level": "high"}
    }))
    .unwrap();
    service.dispatch(request).await.unwrap();

    let got = recv_within(&mut queue, 100).await.unwrap();
    assert_eq!(got.notification_type, "alert");
    assert_eq!(got.payload.get("level"), Some(&json!("high")));
    assert_eq!(got.mode, NotificationMode::Queued);
}
