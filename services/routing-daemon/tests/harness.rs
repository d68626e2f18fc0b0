//! Shared helpers for routing daemon integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lbr_routing_daemon::controller::{Controller, ControllerError, SimpleController, Strategy};
use lbr_routing_daemon::model::{Change, DummyModel, ModelError, Pools};
use lbr_routing_daemon::naming::NamingTemplates;
use lbr_routing_daemon::router::{EventRouter, MonitorSettings, RouterSettings};

pub fn settings() -> RouterSettings {
    RouterSettings {
        endpoint_types: ["load_balancer".to_string()].into_iter().collect(),
        cloud_domain: "example.com".to_string(),
        naming: NamingTemplates {
            pool: "pool_ose_%a_%n_80".to_string(),
            route: "route_ose_%a_%n".to_string(),
            monitor_name: None,
            monitor_path: None,
        },
        monitor: MonitorSettings::default(),
    }
}

pub fn simple_router(model: &Arc<DummyModel>, settings: RouterSettings) -> EventRouter {
    EventRouter::new(Box::new(SimpleController::new(model.clone())), settings)
}

/// A YAML event body.
pub fn event(action: &str, app_name: &str, namespace: &str, extra: &[(&str, &str)]) -> String {
    let mut body = format!("action: {action}\napp_name: {app_name}\nnamespace: {namespace}\n");
    for (key, value) in extra {
        body.push_str(&format!("{key}: {value}\n"));
    }
    body
}

/// Wraps a controller, counting reconcile ticks and optionally failing them.
pub struct CountingController {
    inner: Box<dyn Controller>,
    reconciles: Arc<AtomicUsize>,
    fail_reconcile: bool,
}

impl CountingController {
    pub fn new(inner: Box<dyn Controller>, fail_reconcile: bool) -> (Self, Arc<AtomicUsize>) {
        let reconciles = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                reconciles: reconciles.clone(),
                fail_reconcile,
            },
            reconciles,
        )
    }
}

#[async_trait]
impl Controller for CountingController {
    fn strategy(&self) -> Strategy {
        self.inner.strategy()
    }

    async fn apply(&mut self, change: Change) -> Result<(), ControllerError> {
        self.inner.apply(change).await
    }

    async fn pools(&mut self) -> Result<Pools, ControllerError> {
        self.inner.pools().await
    }

    async fn reconcile(&mut self) -> Result<(), ControllerError> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        if self.fail_reconcile {
            return Err(ControllerError::Pools(ModelError::Injected(
                "reconcile".to_string(),
            )));
        }
        self.inner.reconcile().await
    }

    fn pending(&self) -> usize {
        self.inner.pending()
    }
}
