//! Backend controllers: when and how changes reach the model.
//!
//! Three strategies share one contract:
//!
//! - **Simple**: apply each change immediately
//! - **Batched**: collect changes, commit them together on the reconcile tick
//! - **Async**: submit changes as backend jobs, poll them on the reconcile tick
//!
//! Every operation is a provided method that builds a [`Change`] and hands it
//! to [`Controller::apply`]; a strategy only decides what `apply`, `pools` and
//! `reconcile` do.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use lbr_events::PrivateKey;
use lbr_reconcile::RetryTracker;
use thiserror::Error;

use crate::model::{BackendModel, Change, Member, ModelError, MonitorSpec, Pools};

mod asynchronous;
mod batched;
mod simple;

pub use asynchronous::AsyncController;
pub use batched::BatchedController;
pub use simple::SimpleController;

/// Controller strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Simple,
    Batched,
    Async,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Simple => "simple",
            Strategy::Batched => "batched",
            Strategy::Async => "async",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Strategy::Simple),
            "batched" => Some(Strategy::Batched),
            "async" | "asynchronous" => Some(Strategy::Async),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend controller error.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A single backend call failed.
    #[error("{operation} {target} failed: {source}")]
    Backend {
        operation: &'static str,
        target: String,
        #[source]
        source: ModelError,
    },

    /// Listing pools failed.
    #[error("listing pools failed: {0}")]
    Pools(#[source] ModelError),

    /// Committing a batch failed.
    #[error("committing {size} batched changes failed: {source}")]
    Flush {
        size: usize,
        #[source]
        source: ModelError,
    },

    /// The backend refused a job submission.
    #[error("submitting {operation} {target} failed: {source}")]
    Submit {
        operation: &'static str,
        target: String,
        #[source]
        source: ModelError,
    },
}

impl ControllerError {
    pub(crate) fn backend(change: &Change, source: ModelError) -> Self {
        ControllerError::Backend {
            operation: change.kind(),
            target: change.target(),
            source,
        }
    }

    pub(crate) fn submit(change: &Change, source: ModelError) -> Self {
        ControllerError::Submit {
            operation: change.kind(),
            target: change.target(),
            source,
        }
    }
}

/// Backend controller.
///
/// Single owner: the message loop holds the controller and awaits each call
/// before the next, so methods take `&mut self`.
#[async_trait]
pub trait Controller: Send {
    fn strategy(&self) -> Strategy;

    /// Apply (or schedule) one change.
    async fn apply(&mut self, change: Change) -> Result<(), ControllerError>;

    /// Pools as they will be once scheduled changes land.
    async fn pools(&mut self) -> Result<Pools, ControllerError>;

    /// Strategy-specific catch-up, run on the reconcile tick.
    async fn reconcile(&mut self) -> Result<(), ControllerError>;

    /// Changes accepted but not yet confirmed by the backend.
    fn pending(&self) -> usize;

    async fn create_monitor(&mut self, monitor: MonitorSpec) -> Result<(), ControllerError> {
        self.apply(Change::CreateMonitor(monitor)).await
    }

    async fn delete_monitor(&mut self, name: &str, pool: &str) -> Result<(), ControllerError> {
        self.apply(Change::DeleteMonitor {
            name: name.to_string(),
            pool: pool.to_string(),
        })
        .await
    }

    async fn create_pool(
        &mut self,
        name: &str,
        monitor: Option<&str>,
    ) -> Result<(), ControllerError> {
        self.apply(Change::CreatePool {
            name: name.to_string(),
            monitor: monitor.map(str::to_string),
        })
        .await
    }

    async fn delete_pool(&mut self, name: &str) -> Result<(), ControllerError> {
        self.apply(Change::DeletePool {
            name: name.to_string(),
        })
        .await
    }

    async fn create_route(
        &mut self,
        pool: &str,
        route: &str,
        path: &str,
    ) -> Result<(), ControllerError> {
        self.apply(Change::CreateRoute {
            pool: pool.to_string(),
            route: route.to_string(),
            path: path.to_string(),
        })
        .await
    }

    async fn delete_route(&mut self, pool: &str, route: &str) -> Result<(), ControllerError> {
        self.apply(Change::DeleteRoute {
            pool: pool.to_string(),
            route: route.to_string(),
        })
        .await
    }

    async fn add_member(&mut self, pool: &str, member: Member) -> Result<(), ControllerError> {
        self.apply(Change::AddMember {
            pool: pool.to_string(),
            member,
        })
        .await
    }

    async fn delete_member(&mut self, pool: &str, member: Member) -> Result<(), ControllerError> {
        self.apply(Change::DeleteMember {
            pool: pool.to_string(),
            member,
        })
        .await
    }

    async fn add_alias(&mut self, pool: &str, alias: &str) -> Result<(), ControllerError> {
        self.apply(Change::AddAlias {
            pool: pool.to_string(),
            alias: alias.to_string(),
        })
        .await
    }

    async fn delete_alias(&mut self, pool: &str, alias: &str) -> Result<(), ControllerError> {
        self.apply(Change::DeleteAlias {
            pool: pool.to_string(),
            alias: alias.to_string(),
        })
        .await
    }

    async fn add_tls(
        &mut self,
        pool: &str,
        alias: &str,
        cert: &str,
        key: PrivateKey,
    ) -> Result<(), ControllerError> {
        self.apply(Change::AddSsl {
            pool: pool.to_string(),
            alias: alias.to_string(),
            cert: cert.to_string(),
            key,
        })
        .await
    }

    async fn remove_tls(&mut self, pool: &str, alias: &str) -> Result<(), ControllerError> {
        self.apply(Change::RemoveSsl {
            pool: pool.to_string(),
            alias: alias.to_string(),
        })
        .await
    }
}

/// Build the controller for a strategy over a model.
pub fn build(
    strategy: Strategy,
    model: Arc<dyn BackendModel>,
    retry: RetryTracker,
) -> Box<dyn Controller> {
    match strategy {
        Strategy::Simple => Box::new(SimpleController::new(model)),
        Strategy::Batched => Box::new(BatchedController::new(model, retry)),
        Strategy::Async => Box::new(AsyncController::new(model, retry)),
    }
}
