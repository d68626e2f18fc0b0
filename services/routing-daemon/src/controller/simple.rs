//! Immediate application.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Controller, ControllerError, Strategy};
use crate::model::{BackendModel, Change, Pools};

/// Applies every change synchronously; nothing is ever pending.
pub struct SimpleController {
    model: Arc<dyn BackendModel>,
}

impl SimpleController {
    pub fn new(model: Arc<dyn BackendModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Controller for SimpleController {
    fn strategy(&self) -> Strategy {
        Strategy::Simple
    }

    async fn apply(&mut self, change: Change) -> Result<(), ControllerError> {
        change
            .apply_to(self.model.as_ref())
            .await
            .map_err(|e| ControllerError::backend(&change, e))?;
        debug!(change = %change, "Applied change");
        Ok(())
    }

    async fn pools(&mut self) -> Result<Pools, ControllerError> {
        self.model.get_pools().await.map_err(ControllerError::Pools)
    }

    async fn reconcile(&mut self) -> Result<(), ControllerError> {
        Ok(())
    }

    fn pending(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DummyModel, Member};

    #[tokio::test]
    async fn test_applies_immediately() {
        let model = Arc::new(DummyModel::new());
        let mut controller = SimpleController::new(model.clone());

        controller.create_pool("p", None).await.unwrap();
        controller
            .add_member("p", Member::new("10.0.0.1", 8080))
            .await
            .unwrap();

        assert_eq!(
            model.calls(),
            vec!["create_pool(p, -)", "add_pool_member(p, 10.0.0.1:8080)"]
        );
        assert_eq!(controller.pending(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces() {
        let model = Arc::new(DummyModel::new());
        model.fail("create_pool", None);
        let mut controller = SimpleController::new(model);

        let err = controller.create_pool("p", None).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Backend {
                operation: "create_pool",
                ..
            }
        ));
    }
}
