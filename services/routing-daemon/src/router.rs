//! Event routing: one lifecycle event in, controller operations out.

use std::collections::BTreeSet;

use lbr_events::{
    AliasPayload, ApplicationPayload, EndpointAddedPayload, EndpointRemovedPayload, RoutingEvent,
    SslAddedPayload,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::controller::{Controller, ControllerError};
use crate::model::{Member, MonitorSpec, Pool};
use crate::naming::NamingTemplates;

/// Health-check parameters shared by every per-application monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub up_code: String,
    pub kind: String,
    /// Seconds.
    pub interval: u32,
    /// Seconds.
    pub timeout: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            up_code: "1".to_string(),
            kind: "http-ecv".to_string(),
            interval: 10,
            timeout: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Endpoint types that are routed; anything else is ignored.
    pub endpoint_types: BTreeSet<String>,
    /// Suffix of the default `ha-<app>-<namespace>` alias.
    pub cloud_domain: String,
    pub naming: NamingTemplates,
    pub monitor: MonitorSettings,
}

/// Routing error.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Backend(#[from] ControllerError),

    /// The event refers to a pool that does not exist.
    #[error("pool {pool} does not exist")]
    UnknownPool { pool: String },
}

impl RouteError {
    /// Returns true if redelivering the event could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RouteError::Backend(_) => true,
            RouteError::UnknownPool { .. } => false,
        }
    }
}

/// Maps lifecycle events onto a backend controller.
pub struct EventRouter {
    controller: Box<dyn Controller>,
    settings: RouterSettings,
}

impl EventRouter {
    pub fn new(controller: Box<dyn Controller>, settings: RouterSettings) -> Self {
        Self {
            controller,
            settings,
        }
    }

    pub fn controller(&self) -> &dyn Controller {
        self.controller.as_ref()
    }

    pub async fn route(&mut self, event: &RoutingEvent) -> Result<(), RouteError> {
        match event {
            RoutingEvent::CreateApplication(p) => self.create_application(p).await,
            RoutingEvent::DeleteApplication(p) => self.delete_application(p).await,
            RoutingEvent::AddPublicEndpoint(p) => self.add_public_endpoint(p).await,
            RoutingEvent::RemovePublicEndpoint(p) => self.remove_public_endpoint(p).await,
            RoutingEvent::AddAlias(p) => self.add_alias(p).await,
            RoutingEvent::RemoveAlias(p) => self.remove_alias(p).await,
            RoutingEvent::AddSsl(p) => self.add_ssl(p).await,
            RoutingEvent::RemoveSsl(p) => self.remove_ssl(p).await,
            RoutingEvent::Unrecognized { action } => {
                debug!(action = %action, "Ignoring unrecognized action");
                Ok(())
            }
        }
    }

    pub async fn create_application(&mut self, p: &ApplicationPayload) -> Result<(), RouteError> {
        let naming = &self.settings.naming;
        let pool = naming.pool_name(&p.app_name, &p.namespace);
        let route = naming.route_name(&p.app_name, &p.namespace);
        let monitor = naming.monitor_for(&p.app_name, &p.namespace);

        info!(
            app = %p.app_name,
            namespace = %p.namespace,
            pool = %pool,
            route = %route,
            "Creating application"
        );

        let monitor_name = match monitor {
            Some(m) => {
                info!(monitor = %m.name, path = %m.path, "Creating monitor");
                let spec = MonitorSpec {
                    name: m.name.clone(),
                    path: m.path,
                    up_code: self.settings.monitor.up_code.clone(),
                    kind: self.settings.monitor.kind.clone(),
                    interval: self.settings.monitor.interval,
                    timeout: self.settings.monitor.timeout,
                };
                self.controller.create_monitor(spec).await?;
                Some(m.name)
            }
            None => None,
        };

        self.controller
            .create_pool(&pool, monitor_name.as_deref())
            .await?;

        let path = format!("/{}", p.app_name);
        self.controller.create_route(&pool, &route, &path).await?;

        let alias = format!(
            "ha-{}-{}.{}",
            p.app_name, p.namespace, self.settings.cloud_domain
        );
        self.controller.add_alias(&pool, &alias).await?;
        Ok(())
    }

    /// Route, then pool, then monitor. Pool and monitor deletion are
    /// attempted even when an earlier step fails; the first error wins.
    pub async fn delete_application(&mut self, p: &ApplicationPayload) -> Result<(), RouteError> {
        let naming = &self.settings.naming;
        let pool = naming.pool_name(&p.app_name, &p.namespace);
        let route = naming.route_name(&p.app_name, &p.namespace);
        let monitor = naming.monitor_for(&p.app_name, &p.namespace);

        info!(
            app = %p.app_name,
            namespace = %p.namespace,
            pool = %pool,
            route = %route,
            "Deleting application"
        );

        let mut first_error: Option<RouteError> = None;

        if let Err(e) = self.controller.delete_route(&pool, &route).await {
            error!(route = %route, pool = %pool, error = %e, "Deleting route failed");
            first_error.get_or_insert(e.into());
        }

        if let Err(e) = self.controller.delete_pool(&pool).await {
            error!(pool = %pool, error = %e, "Deleting pool failed");
            first_error.get_or_insert(e.into());
        }

        if let Some(m) = monitor {
            info!(monitor = %m.name, pool = %pool, "Deleting monitor");
            if let Err(e) = self.controller.delete_monitor(&m.name, &pool).await {
                error!(monitor = %m.name, pool = %pool, error = %e, "Deleting monitor failed");
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn add_public_endpoint(
        &mut self,
        p: &EndpointAddedPayload,
    ) -> Result<(), RouteError> {
        if !p
            .types
            .iter()
            .any(|t| self.settings.endpoint_types.contains(t))
        {
            debug!(
                app = %p.app_name,
                namespace = %p.namespace,
                endpoint = %format!("{}:{}", p.public_address, p.public_port),
                types = %p.types.join(","),
                "Ignoring endpoint of unrouted type"
            );
            return Ok(());
        }

        let pool = self.settings.naming.pool_name(&p.app_name, &p.namespace);
        self.require_pool(&pool).await?;

        let member = Member::new(&p.public_address, p.public_port);
        info!(pool = %pool, member = %member, "Adding pool member");
        self.controller.add_member(&pool, member).await?;
        Ok(())
    }

    /// Only members currently in the pool are removed; anything else is a no-op.
    pub async fn remove_public_endpoint(
        &mut self,
        p: &EndpointRemovedPayload,
    ) -> Result<(), RouteError> {
        let pool = self.settings.naming.pool_name(&p.app_name, &p.namespace);
        let member = Member::new(&p.public_address, p.public_port);

        let Some(current) = self.find_pool(&pool).await? else {
            debug!(pool = %pool, member = %member, "Pool absent; nothing to remove");
            return Ok(());
        };
        if !current.has_member(&member) {
            debug!(pool = %pool, member = %member, "Not a pool member; nothing to remove");
            return Ok(());
        }

        info!(pool = %pool, member = %member, "Deleting pool member");
        self.controller.delete_member(&pool, member).await?;
        Ok(())
    }

    pub async fn add_alias(&mut self, p: &AliasPayload) -> Result<(), RouteError> {
        let pool = self.settings.naming.pool_name(&p.app_name, &p.namespace);
        self.require_pool(&pool).await?;

        info!(pool = %pool, alias = %p.alias, "Adding alias");
        self.controller.add_alias(&pool, &p.alias).await?;
        Ok(())
    }

    pub async fn remove_alias(&mut self, p: &AliasPayload) -> Result<(), RouteError> {
        let pool = self.settings.naming.pool_name(&p.app_name, &p.namespace);
        if self.find_pool(&pool).await?.is_none() {
            debug!(pool = %pool, alias = %p.alias, "Pool absent; nothing to remove");
            return Ok(());
        }

        info!(pool = %pool, alias = %p.alias, "Deleting alias");
        self.controller.delete_alias(&pool, &p.alias).await?;
        Ok(())
    }

    pub async fn add_ssl(&mut self, p: &SslAddedPayload) -> Result<(), RouteError> {
        let pool = self.settings.naming.pool_name(&p.app_name, &p.namespace);
        self.require_pool(&pool).await?;

        info!(pool = %pool, alias = %p.alias, "Binding TLS certificate");
        self.controller
            .add_tls(&pool, &p.alias, &p.ssl, p.private_key.clone())
            .await?;
        Ok(())
    }

    pub async fn remove_ssl(&mut self, p: &AliasPayload) -> Result<(), RouteError> {
        let pool = self.settings.naming.pool_name(&p.app_name, &p.namespace);
        if self.find_pool(&pool).await?.is_none() {
            debug!(pool = %pool, alias = %p.alias, "Pool absent; nothing to remove");
            return Ok(());
        }

        info!(pool = %pool, alias = %p.alias, "Removing TLS certificate");
        self.controller.remove_tls(&pool, &p.alias).await?;
        Ok(())
    }

    /// Run the controller's reconcile step.
    pub async fn reconcile(&mut self) -> Result<(), ControllerError> {
        self.controller.reconcile().await
    }

    /// Log the current pool inventory. Failures are logged, never returned.
    pub async fn log_inventory(&mut self) {
        match self.controller.pools().await {
            Ok(pools) => {
                info!(count = pools.len(), "Found {} pools", pools.len());
                for (name, pool) in &pools {
                    info!(pool = %name, members = pool.members.len(), "Pool");
                }
            }
            Err(e) => {
                warn!(error = %e, "Listing pools failed");
            }
        }
    }

    async fn find_pool(&mut self, name: &str) -> Result<Option<Pool>, RouteError> {
        let mut pools = self.controller.pools().await?;
        Ok(pools.remove(name))
    }

    async fn require_pool(&mut self, name: &str) -> Result<Pool, RouteError> {
        self.find_pool(name)
            .await?
            .ok_or_else(|| RouteError::UnknownPool {
                pool: name.to_string(),
            })
    }
}
