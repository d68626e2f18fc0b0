//! Backend model: CRUD over the load balancer's resources.
//!
//! A model holds no policy. Every mutating call must be safe to repeat,
//! because a message may be redelivered after the backend applied it but
//! before it was acknowledged.
//!
//! Adapters:
//! - [`DummyModel`]: in-memory, records calls, used by tests
//! - [`NginxModel`]: renders an nginx include file and reloads nginx
//! - [`RestModel`]: JSON resource API, optionally asynchronous (jobs)

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use lbr_events::PrivateKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod dummy;
mod nginx;
mod rest;

pub use dummy::DummyModel;
pub use nginx::{NginxModel, NginxSettings, ReloadMethod};
pub use rest::{RestAuth, RestModel, RestSettings};

// =============================================================================
// Resources
// =============================================================================

/// One traffic-serving endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Member {
    pub host: String,
    pub port: u16,
}

impl Member {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A pool as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub members: BTreeSet<Member>,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    /// Aliases that have a TLS binding.
    #[serde(default)]
    pub tls_aliases: BTreeSet<String>,
}

impl Pool {
    pub fn new(name: impl Into<String>, monitor: Option<String>) -> Self {
        Self {
            name: name.into(),
            monitor,
            ..Self::default()
        }
    }

    pub fn has_member(&self, member: &Member) -> bool {
        self.members.contains(member)
    }
}

/// Pools keyed by name.
pub type Pools = BTreeMap<String, Pool>;

/// Health-check definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSpec {
    pub name: String,
    /// Path requested by the check.
    pub path: String,
    /// Expected status.
    pub up_code: String,
    /// Protocol type, e.g. `http-ecv`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds between checks.
    pub interval: u32,
    /// Seconds before a check counts as failed.
    pub timeout: u32,
}

// =============================================================================
// Changes
// =============================================================================

/// One mutation of backend state.
///
/// Controllers defer changes as values; a change can be applied to a model
/// or overlaid on a pool listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    CreateMonitor(MonitorSpec),
    DeleteMonitor { name: String, pool: String },
    CreatePool { name: String, monitor: Option<String> },
    DeletePool { name: String },
    CreateRoute { pool: String, route: String, path: String },
    DeleteRoute { pool: String, route: String },
    AddMember { pool: String, member: Member },
    DeleteMember { pool: String, member: Member },
    AddAlias { pool: String, alias: String },
    DeleteAlias { pool: String, alias: String },
    AddSsl { pool: String, alias: String, cert: String, key: PrivateKey },
    RemoveSsl { pool: String, alias: String },
}

impl Change {
    /// Operation name, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::CreateMonitor(_) => "create_monitor",
            Change::DeleteMonitor { .. } => "delete_monitor",
            Change::CreatePool { .. } => "create_pool",
            Change::DeletePool { .. } => "delete_pool",
            Change::CreateRoute { .. } => "create_route",
            Change::DeleteRoute { .. } => "delete_route",
            Change::AddMember { .. } => "add_pool_member",
            Change::DeleteMember { .. } => "delete_pool_member",
            Change::AddAlias { .. } => "add_pool_alias",
            Change::DeleteAlias { .. } => "delete_pool_alias",
            Change::AddSsl { .. } => "add_ssl",
            Change::RemoveSsl { .. } => "remove_ssl",
        }
    }

    /// The pool this change belongs to. Monitor creation belongs to none.
    pub fn pool(&self) -> Option<&str> {
        match self {
            Change::CreateMonitor(_) => None,
            Change::DeleteMonitor { pool, .. } => Some(pool),
            Change::CreatePool { name, .. } | Change::DeletePool { name } => Some(name),
            Change::CreateRoute { pool, .. }
            | Change::DeleteRoute { pool, .. }
            | Change::AddMember { pool, .. }
            | Change::DeleteMember { pool, .. }
            | Change::AddAlias { pool, .. }
            | Change::DeleteAlias { pool, .. }
            | Change::AddSsl { pool, .. }
            | Change::RemoveSsl { pool, .. } => Some(pool),
        }
    }

    /// The resource the change acts on.
    pub fn target(&self) -> String {
        match self {
            Change::CreateMonitor(monitor) => monitor.name.clone(),
            Change::DeleteMonitor { name, .. } => name.clone(),
            Change::CreatePool { name, .. } | Change::DeletePool { name } => name.clone(),
            Change::CreateRoute { route, .. } | Change::DeleteRoute { route, .. } => route.clone(),
            Change::AddMember { member, .. } | Change::DeleteMember { member, .. } => {
                member.to_string()
            }
            Change::AddAlias { alias, .. }
            | Change::DeleteAlias { alias, .. }
            | Change::AddSsl { alias, .. }
            | Change::RemoveSsl { alias, .. } => alias.clone(),
        }
    }

    /// Stable identity for retry accounting.
    pub fn key(&self) -> String {
        format!(
            "{} {}/{}",
            self.kind(),
            self.pool().unwrap_or("-"),
            self.target()
        )
    }

    /// Apply the change through the model's per-resource calls.
    pub async fn apply_to<M>(&self, model: &M) -> Result<(), ModelError>
    where
        M: BackendModel + ?Sized,
    {
        match self {
            Change::CreateMonitor(monitor) => model.create_monitor(monitor).await,
            Change::DeleteMonitor { name, pool } => model.delete_monitor(name, pool).await,
            Change::CreatePool { name, monitor } => {
                model.create_pool(name, monitor.as_deref()).await
            }
            Change::DeletePool { name } => model.delete_pool(name).await,
            Change::CreateRoute { pool, route, path } => {
                model.create_route(pool, route, path).await
            }
            Change::DeleteRoute { pool, route } => model.delete_route(pool, route).await,
            Change::AddMember { pool, member } => model.add_pool_member(pool, member).await,
            Change::DeleteMember { pool, member } => model.delete_pool_member(pool, member).await,
            Change::AddAlias { pool, alias } => model.add_pool_alias(pool, alias).await,
            Change::DeleteAlias { pool, alias } => model.delete_pool_alias(pool, alias).await,
            Change::AddSsl {
                pool,
                alias,
                cert,
                key,
            } => model.add_ssl(pool, alias, cert, key).await,
            Change::RemoveSsl { pool, alias } => model.remove_ssl(pool, alias).await,
        }
    }

    /// Apply the change to a pool listing as if it had succeeded.
    ///
    /// Monitor and route changes are not visible in a pool listing.
    pub fn apply_to_view(&self, pools: &mut Pools) {
        match self {
            Change::CreatePool { name, monitor } => {
                pools
                    .entry(name.clone())
                    .or_insert_with(|| Pool::new(name.clone(), monitor.clone()));
            }
            Change::DeletePool { name } => {
                pools.remove(name);
            }
            Change::AddMember { pool, member } => {
                if let Some(p) = pools.get_mut(pool) {
                    p.members.insert(member.clone());
                }
            }
            Change::DeleteMember { pool, member } => {
                if let Some(p) = pools.get_mut(pool) {
                    p.members.remove(member);
                }
            }
            Change::AddAlias { pool, alias } => {
                if let Some(p) = pools.get_mut(pool) {
                    p.aliases.insert(alias.clone());
                }
            }
            Change::DeleteAlias { pool, alias } => {
                if let Some(p) = pools.get_mut(pool) {
                    p.aliases.remove(alias);
                    p.tls_aliases.remove(alias);
                }
            }
            Change::AddSsl { pool, alias, .. } => {
                if let Some(p) = pools.get_mut(pool) {
                    p.tls_aliases.insert(alias.clone());
                }
            }
            Change::RemoveSsl { pool, alias } => {
                if let Some(p) = pools.get_mut(pool) {
                    p.tls_aliases.remove(alias);
                }
            }
            Change::CreateMonitor(_)
            | Change::DeleteMonitor { .. }
            | Change::CreateRoute { .. }
            | Change::DeleteRoute { .. } => {}
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pool() {
            Some(pool) => write!(f, "{} {} (pool {})", self.kind(), self.target(), pool),
            None => write!(f, "{} {}", self.kind(), self.target()),
        }
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// Backend-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of submitting a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Applied before the call returned.
    Done,
    /// Accepted; poll [`BackendModel::job_status`].
    Job(JobId),
}

/// State of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed(String),
}

// =============================================================================
// Errors
// =============================================================================

/// Backend model error: one resource-level call failed.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{operation} rejected with status {status}: {body}")]
    Rejected {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response to {operation}: {reason}")]
    Protocol { operation: String, reason: String },

    #[error("job {job} failed: {reason}")]
    JobFailed { job: JobId, reason: String },

    #[error("timed out waiting for job {0}")]
    JobTimeout(JobId),

    #[error("pool {0} does not exist")]
    NoSuchPool(String),

    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is unreadable: {reason}")]
    State { path: PathBuf, reason: String },

    #[error("reload failed: {0}")]
    Reload(String),

    #[error("{model} backend does not support {operation}")]
    Unsupported {
        model: &'static str,
        operation: &'static str,
    },

    #[error("injected failure in {0}")]
    Injected(String),
}

// =============================================================================
// Model Interface
// =============================================================================

/// Load balancer backend.
#[async_trait]
pub trait BackendModel: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &'static str;

    async fn get_pools(&self) -> Result<Pools, ModelError>;

    async fn create_monitor(&self, monitor: &MonitorSpec) -> Result<(), ModelError>;

    /// Delete a monitor. `pool` is the pool being deleted alongside it, so
    /// backends that need exclusive access can order the two deletions.
    async fn delete_monitor(&self, name: &str, pool: &str) -> Result<(), ModelError>;

    async fn create_pool(&self, name: &str, monitor: Option<&str>) -> Result<(), ModelError>;

    async fn delete_pool(&self, name: &str) -> Result<(), ModelError>;

    async fn create_route(&self, pool: &str, route: &str, path: &str) -> Result<(), ModelError>;

    async fn delete_route(&self, pool: &str, route: &str) -> Result<(), ModelError>;

    async fn add_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError>;

    async fn delete_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError>;

    async fn add_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError>;

    async fn delete_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError>;

    async fn add_ssl(
        &self,
        pool: &str,
        alias: &str,
        cert: &str,
        key: &PrivateKey,
    ) -> Result<(), ModelError>;

    async fn remove_ssl(&self, pool: &str, alias: &str) -> Result<(), ModelError>;

    /// Apply several changes. Adapters that can commit once override this.
    async fn apply_batch(&self, changes: &[Change]) -> Result<(), ModelError> {
        for change in changes {
            change.apply_to(self).await?;
        }
        Ok(())
    }

    /// Start applying a change without waiting for it.
    async fn submit(&self, change: &Change) -> Result<Submission, ModelError> {
        change.apply_to(self).await?;
        Ok(Submission::Done)
    }

    /// Poll a job returned by [`BackendModel::submit`].
    async fn job_status(&self, _job: &JobId) -> Result<JobStatus, ModelError> {
        Err(ModelError::Unsupported {
            model: self.name(),
            operation: "job_status",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools_with(name: &str) -> Pools {
        let mut pools = Pools::new();
        pools.insert(name.to_string(), Pool::new(name, None));
        pools
    }

    #[test]
    fn test_view_overlay_membership() {
        let mut pools = pools_with("p");
        let member = Member::new("10.0.0.1", 8080);

        Change::AddMember {
            pool: "p".to_string(),
            member: member.clone(),
        }
        .apply_to_view(&mut pools);
        assert!(pools["p"].has_member(&member));

        Change::DeleteMember {
            pool: "p".to_string(),
            member: member.clone(),
        }
        .apply_to_view(&mut pools);
        assert!(!pools["p"].has_member(&member));
    }

    #[test]
    fn test_view_overlay_create_pool_is_idempotent() {
        let mut pools = pools_with("p");
        pools.get_mut("p").unwrap().aliases.insert("a.example.com".to_string());

        Change::CreatePool {
            name: "p".to_string(),
            monitor: None,
        }
        .apply_to_view(&mut pools);
        assert!(pools["p"].aliases.contains("a.example.com"));
    }

    #[test]
    fn test_view_overlay_on_missing_pool_is_ignored() {
        let mut pools = Pools::new();
        Change::AddAlias {
            pool: "missing".to_string(),
            alias: "a".to_string(),
        }
        .apply_to_view(&mut pools);
        assert!(pools.is_empty());
    }

    #[test]
    fn test_delete_alias_clears_tls() {
        let mut pools = pools_with("p");
        for change in [
            Change::AddAlias {
                pool: "p".to_string(),
                alias: "a".to_string(),
            },
            Change::AddSsl {
                pool: "p".to_string(),
                alias: "a".to_string(),
                cert: "CERT".to_string(),
                key: PrivateKey::new("KEY"),
            },
            Change::DeleteAlias {
                pool: "p".to_string(),
                alias: "a".to_string(),
            },
        ] {
            change.apply_to_view(&mut pools);
        }
        assert!(pools["p"].aliases.is_empty());
        assert!(pools["p"].tls_aliases.is_empty());
    }

    #[test]
    fn test_change_identity() {
        let change = Change::AddMember {
            pool: "pool_a".to_string(),
            member: Member::new("10.0.0.1", 8080),
        };
        assert_eq!(change.kind(), "add_pool_member");
        assert_eq!(change.pool(), Some("pool_a"));
        assert_eq!(change.target(), "10.0.0.1:8080");
        assert_eq!(change.key(), "add_pool_member pool_a/10.0.0.1:8080");
        assert_eq!(change.to_string(), "add_pool_member 10.0.0.1:8080 (pool pool_a)");
    }

    #[test]
    fn test_ssl_change_debug_hides_key() {
        let change = Change::AddSsl {
            pool: "p".to_string(),
            alias: "a".to_string(),
            cert: "CERT".to_string(),
            key: PrivateKey::new("SECRETKEY"),
        };
        assert!(!format!("{change:?}").contains("SECRETKEY"));
    }
}
