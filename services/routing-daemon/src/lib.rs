//! Load-balancer routing daemon.
//!
//! Consumes application lifecycle events from a STOMP topic and keeps a load
//! balancer's pools, routes, aliases, TLS bindings and monitors in step.
//!
//! ## Architecture
//!
//! - **Message loop** ([`daemon`]): receive, decode, route, acknowledge, and a
//!   periodic reconcile tick
//! - **Event router** ([`router`]): maps one event onto controller operations
//! - **Controller** ([`controller`]): when changes reach the backend
//!   (simple, batched, asynchronous)
//! - **Model** ([`model`]): how changes reach the backend (dummy, nginx, REST)
//!
//! Every backend mutation is idempotent: the broker delivers at least once.

use std::sync::Arc;

use lbr_reconcile::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

pub mod bus;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod logging;
pub mod model;
pub mod naming;
pub mod router;

use crate::config::{BackendSelection, ModelSelection};
use crate::controller::Controller;
use crate::model::{BackendModel, DummyModel, ModelError, NginxModel, RestModel};

/// Open the configured backend model.
pub fn build_model(selection: &ModelSelection) -> Result<Arc<dyn BackendModel>, ModelError> {
    let model: Arc<dyn BackendModel> = match selection {
        ModelSelection::Dummy => Arc::new(DummyModel::new()),
        ModelSelection::Nginx(settings) => Arc::new(NginxModel::open(settings.clone())?),
        ModelSelection::Rest(settings) => Arc::new(RestModel::new(settings.clone())?),
    };
    Ok(model)
}

/// Open the configured backend and wrap it in its controller strategy.
pub fn build_controller(backend: &BackendSelection) -> Result<Box<dyn Controller>, ModelError> {
    let model = build_model(&backend.model)?;
    let retry = RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW);
    Ok(controller::build(backend.strategy, model, retry))
}
