//! Message loop: acknowledgment contract and reconcile independence.

mod harness;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lbr_reconcile::RetryTracker;
use lbr_routing_daemon::bus::{InboundMessage, MemoryBus, MemoryBusHandle};
use lbr_routing_daemon::controller::{AsyncController, BatchedController, SimpleController};
use lbr_routing_daemon::daemon::{Daemon, Disposition};
use lbr_routing_daemon::model::DummyModel;
use lbr_routing_daemon::router::EventRouter;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use harness::{event, settings, simple_router, CountingController};

const INTERVAL: Duration = Duration::from_secs(5);

const BLOG_CALLS: [&str; 3] = [
    "create_pool(pool_ose_blog_ns1_80, -)",
    "create_route(pool_ose_blog_ns1_80, route_ose_blog_ns1, /blog)",
    "add_pool_alias(pool_ose_blog_ns1_80, ha-blog-ns1.example.com)",
];

fn retry() -> RetryTracker {
    RetryTracker::new(3, Duration::from_secs(600))
}

fn endpoint_event() -> String {
    event(
        "add_public_endpoint",
        "blog",
        "ns1",
        &[
            ("public_address", "10.0.0.1"),
            ("public_port", "8080"),
            ("types", "[load_balancer]"),
        ],
    )
}

fn message(id: Option<&str>, body: &str) -> InboundMessage {
    InboundMessage {
        message_id: id.map(str::to_string),
        subscription: Some("sub-0".to_string()),
        destination: Some("/topic/routinginfo".to_string()),
        body: Bytes::copy_from_slice(body.as_bytes()),
    }
}

struct Running {
    handle: MemoryBusHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Running {
    fn start(router: EventRouter) -> Self {
        let (bus, handle) = MemoryBus::new();
        let (shutdown, rx) = watch::channel(false);
        let daemon = Daemon::new(bus, router, INTERVAL);
        let task = tokio::spawn(daemon.run(rx));
        Self {
            handle,
            shutdown,
            task,
        }
    }

    async fn stop(self) -> MemoryBusHandle {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap();
        self.handle
    }
}

#[tokio::test]
async fn test_dispositions() {
    let model = Arc::new(DummyModel::new());
    let (bus, _handle) = MemoryBus::new();
    let mut daemon = Daemon::new(bus, simple_router(&model, settings()), INTERVAL);

    let create = event("create_application", "blog", "ns1", &[]);
    assert_eq!(
        daemon.handle_message(&message(Some("m-1"), &create)).await,
        Disposition::Ack
    );
    assert_eq!(
        daemon.handle_message(&message(None, &create)).await,
        Disposition::Drop
    );
    assert_eq!(
        daemon.handle_message(&message(Some("m-2"), "{ not: [valid")).await,
        Disposition::Ack
    );

    model.fail("delete_pool", None);
    let delete = event("delete_application", "blog", "ns1", &[]);
    assert_eq!(
        daemon.handle_message(&message(Some("m-3"), &delete)).await,
        Disposition::Nack
    );

    let alias = event("add_alias", "missing", "ns1", &[("alias", "www.missing.com")]);
    assert_eq!(
        daemon.handle_message(&message(Some("m-4"), &alias)).await,
        Disposition::Ack
    );
}

#[tokio::test(start_paused = true)]
async fn test_well_formed_event_is_acked() {
    let model = Arc::new(DummyModel::new());
    let running = Running::start(simple_router(&model, settings()));

    running.handle.publish(
        Some("m-1"),
        event("create_application", "blog", "ns1", &[]),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = running.stop().await;
    assert_eq!(handle.acked(), vec!["m-1"]);
    assert!(handle.nacked().is_empty());
    assert!(model.pools().contains_key("pool_ose_blog_ns1_80"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_acked_once_and_backend_untouched() {
    let model = Arc::new(DummyModel::new());
    let running = Running::start(simple_router(&model, settings()));

    running.handle.publish(Some("m-1"), ":::\n- [unbalanced");
    running.handle.publish(Some("m-2"), "just a string");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = running.stop().await;
    assert_eq!(handle.acked(), vec!["m-1", "m-2"]);
    assert!(model.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_backend_failure_is_nacked() {
    let model = Arc::new(DummyModel::new());
    model.fail("create_route", None);
    let running = Running::start(simple_router(&model, settings()));

    running.handle.publish(
        Some("m-1"),
        event("create_application", "blog", "ns1", &[]),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = running.stop().await;
    assert_eq!(handle.nacked(), vec!["m-1"]);
    assert!(handle.acked().is_empty());
    // The pool was created before the failing call; nothing after it ran.
    assert_eq!(
        model.calls(),
        vec![
            "create_pool(pool_ose_blog_ns1_80, -)",
            "create_route(pool_ose_blog_ns1_80, route_ose_blog_ns1, /blog)",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_message_without_id_is_dropped() {
    let model = Arc::new(DummyModel::new());
    let running = Running::start(simple_router(&model, settings()));

    running
        .handle
        .publish(None, event("create_application", "blog", "ns1", &[]));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = running.stop().await;
    assert!(handle.acked().is_empty());
    assert!(handle.nacked().is_empty());
    assert!(model.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_runs_while_idle() {
    let model = Arc::new(DummyModel::new());
    let (controller, reconciles) =
        CountingController::new(Box::new(SimpleController::new(model.clone())), false);
    let running = Running::start(EventRouter::new(Box::new(controller), settings()));

    tokio::time::sleep(INTERVAL * 3 + Duration::from_secs(1)).await;

    running.stop().await;
    assert!(reconciles.load(Ordering::SeqCst) >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_failing_reconcile_does_not_stop_the_loop() {
    let model = Arc::new(DummyModel::new());
    let (controller, reconciles) =
        CountingController::new(Box::new(SimpleController::new(model.clone())), true);
    let running = Running::start(EventRouter::new(Box::new(controller), settings()));

    tokio::time::sleep(INTERVAL * 2 + Duration::from_secs(1)).await;
    assert!(reconciles.load(Ordering::SeqCst) >= 2);

    running.handle.publish(
        Some("m-1"),
        event("create_application", "blog", "ns1", &[]),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handle = running.stop().await;
    assert_eq!(handle.acked(), vec!["m-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_busy_topic_still_reconciles() {
    let model = Arc::new(DummyModel::new());
    let (controller, reconciles) =
        CountingController::new(Box::new(SimpleController::new(model.clone())), false);
    let running = Running::start(EventRouter::new(Box::new(controller), settings()));

    for i in 0..12 {
        running.handle.publish(
            Some(&format!("m-{i}")),
            event("create_application", &format!("app{i}"), "ns1", &[]),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let handle = running.stop().await;
    assert_eq!(handle.acked().len(), 12);
    assert!(reconciles.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_batched_changes_commit_on_tick() {
    let model = Arc::new(DummyModel::new());
    let controller = BatchedController::new(model.clone(), retry());
    let running = Running::start(EventRouter::new(Box::new(controller), settings()));

    running.handle.publish(
        Some("m-1"),
        event("create_application", "blog", "ns1", &[]),
    );
    running.handle.publish(Some("m-2"), endpoint_event());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(running.handle.acked(), vec!["m-1", "m-2"]);
    assert!(model.calls().is_empty());

    tokio::time::sleep(INTERVAL).await;
    let mut expected = vec!["apply_batch(4)".to_string()];
    expected.extend(BLOG_CALLS.iter().map(|c| c.to_string()));
    expected.push("add_pool_member(pool_ose_blog_ns1_80, 10.0.0.1:8080)".to_string());
    assert_eq!(model.calls(), expected);

    // Later ticks with an empty batch leave the backend alone.
    tokio::time::sleep(INTERVAL * 2).await;
    let handle = running.stop().await;
    assert_eq!(model.calls(), expected);
    assert!(handle.nacked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_is_committed_once_after_recovery() {
    let model = Arc::new(DummyModel::new());
    model.fail("apply_batch", None);
    let controller = BatchedController::new(model.clone(), retry());
    let running = Running::start(EventRouter::new(Box::new(controller), settings()));

    running.handle.publish(
        Some("m-1"),
        event("create_application", "blog", "ns1", &[]),
    );
    tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;
    assert_eq!(model.calls(), vec!["apply_batch(3)"]);
    assert!(model.pools().is_empty());

    model.heal("apply_batch");
    tokio::time::sleep(INTERVAL * 2).await;

    let handle = running.stop().await;
    assert_eq!(handle.acked(), vec!["m-1"]);
    let calls = model.calls();
    assert_eq!(calls[..2], ["apply_batch(3)", "apply_batch(3)"]);
    assert_eq!(calls[2..], BLOG_CALLS);
}

#[tokio::test(start_paused = true)]
async fn test_async_jobs_settle_one_per_tick() {
    let model = Arc::new(DummyModel::new().with_async_jobs(0));
    let controller = AsyncController::new(model.clone(), retry());
    let running = Running::start(EventRouter::new(Box::new(controller), settings()));

    running.handle.publish(
        Some("m-1"),
        event("create_application", "blog", "ns1", &[]),
    );
    running.handle.publish(
        Some("m-2"),
        event("create_application", "shop", "ns2", &[]),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One job in flight per pool; the rest of each lane waits.
    assert_eq!(running.handle.acked(), vec!["m-1", "m-2"]);
    assert_eq!(model.submitted_jobs().len(), 2);
    assert!(model.calls().is_empty());

    tokio::time::sleep(INTERVAL).await;
    let blog: Vec<String> = model
        .calls()
        .into_iter()
        .filter(|c| c.contains("blog"))
        .collect();
    assert_eq!(blog, BLOG_CALLS[..1]);

    tokio::time::sleep(INTERVAL * 3).await;
    let handle = running.stop().await;

    let blog: Vec<String> = model
        .calls()
        .into_iter()
        .filter(|c| c.contains("blog"))
        .collect();
    assert_eq!(blog, BLOG_CALLS);
    assert_eq!(model.calls().len(), 6);
    assert_eq!(model.submitted_jobs().len(), 6);
    assert!(handle.nacked().is_empty());
}
