//! Batched application.
//!
//! Changes accumulate between reconcile ticks and are committed together
//! through [`BackendModel::apply_batch`]. A failed batch is kept and retried
//! on the next tick until the retry tracker gives up on it.

use std::sync::Arc;

use async_trait::async_trait;
use lbr_reconcile::RetryTracker;
use tracing::{debug, error, info, warn};

use super::{Controller, ControllerError, Strategy};
use crate::model::{BackendModel, Change, Pools};

const BATCH_KEY: &str = "batch";

pub struct BatchedController {
    model: Arc<dyn BackendModel>,
    batch: Vec<Change>,
    retry: RetryTracker,
}

impl BatchedController {
    pub fn new(model: Arc<dyn BackendModel>, retry: RetryTracker) -> Self {
        Self {
            model,
            batch: Vec::new(),
            retry,
        }
    }
}

#[async_trait]
impl Controller for BatchedController {
    fn strategy(&self) -> Strategy {
        Strategy::Batched
    }

    async fn apply(&mut self, change: Change) -> Result<(), ControllerError> {
        debug!(change = %change, queued = self.batch.len() + 1, "Queued change for next batch");
        self.batch.push(change);
        Ok(())
    }

    async fn pools(&mut self) -> Result<Pools, ControllerError> {
        let mut pools = self.model.get_pools().await.map_err(ControllerError::Pools)?;
        for change in &self.batch {
            change.apply_to_view(&mut pools);
        }
        Ok(pools)
    }

    async fn reconcile(&mut self) -> Result<(), ControllerError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let size = self.batch.len();
        match self.model.apply_batch(&self.batch).await {
            Ok(()) => {
                info!(size, "Committed batch");
                self.batch.clear();
                self.retry.clear(BATCH_KEY);
                Ok(())
            }
            Err(source) => {
                if self.retry.record_failure(BATCH_KEY) {
                    error!(
                        size,
                        error = %source,
                        "Batch keeps failing; dropping it"
                    );
                    for change in self.batch.drain(..) {
                        warn!(change = %change, "Dropped change");
                    }
                    self.retry.clear(BATCH_KEY);
                }
                Err(ControllerError::Flush { size, source })
            }
        }
    }

    fn pending(&self) -> usize {
        self.batch.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{DummyModel, Member};

    fn controller(model: &Arc<DummyModel>, max_retries: u32) -> BatchedController {
        BatchedController::new(
            model.clone(),
            RetryTracker::new(max_retries, Duration::from_secs(600)),
        )
    }

    #[tokio::test]
    async fn test_nothing_reaches_backend_until_reconcile() {
        let model = Arc::new(DummyModel::new());
        let mut c = controller(&model, 3);

        c.create_pool("p", None).await.unwrap();
        c.add_alias("p", "a.example.com").await.unwrap();
        assert!(model.calls().is_empty());
        assert_eq!(c.pending(), 2);

        c.reconcile().await.unwrap();
        assert_eq!(
            model.calls(),
            vec![
                "apply_batch(2)",
                "create_pool(p, -)",
                "add_pool_alias(p, a.example.com)"
            ]
        );
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_pools_overlay_pending_batch() {
        let model = Arc::new(DummyModel::new());
        let mut c = controller(&model, 3);
        let member = Member::new("10.0.0.1", 8080);

        c.create_pool("p", None).await.unwrap();
        c.add_member("p", member.clone()).await.unwrap();

        let pools = c.pools().await.unwrap();
        assert!(pools["p"].has_member(&member));
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried_then_dropped() {
        let model = Arc::new(DummyModel::new());
        model.fail("apply_batch", None);
        let mut c = controller(&model, 1);

        c.create_pool("p", None).await.unwrap();

        assert!(c.reconcile().await.is_err());
        assert_eq!(c.pending(), 1);

        assert!(c.reconcile().await.is_err());
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_batch_survives_transient_failure() {
        let model = Arc::new(DummyModel::new());
        model.fail("apply_batch", Some(1));
        let mut c = controller(&model, 3);

        c.create_pool("p", None).await.unwrap();
        assert!(c.reconcile().await.is_err());
        c.reconcile().await.unwrap();

        assert!(model.pools().contains_key("p"));
    }
}
