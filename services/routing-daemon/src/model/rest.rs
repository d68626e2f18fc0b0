//! REST load-balancer backend.
//!
//! Talks to a JSON resource API:
//!
//! | Call | Request |
//! |---|---|
//! | list pools | `GET /pools` |
//! | pool | `PUT|DELETE /pools/{pool}` |
//! | member | `PUT|DELETE /pools/{pool}/members/{host}:{port}` |
//! | alias | `PUT|DELETE /pools/{pool}/aliases/{alias}` |
//! | TLS binding | `PUT|DELETE /pools/{pool}/aliases/{alias}/tls` |
//! | route | `PUT|DELETE /routes/{route}` |
//! | monitor | `PUT /monitors/{name}`, `DELETE /monitors/{name}?pool={pool}` |
//! | job | `GET /jobs/{id}` |
//!
//! PUT makes creation idempotent and a 404 on DELETE counts as success. A
//! `202 Accepted` response carries `{"job_id": ...}`: the change is queued
//! on the service side. Synchronous calls wait for such jobs; [`submit`]
//! returns them to the caller.
//!
//! [`submit`]: BackendModel::submit

use std::time::Duration;

use async_trait::async_trait;
use lbr_events::PrivateKey;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::{
    BackendModel, Change, JobId, JobStatus, Member, ModelError, MonitorSpec, Pool, Pools,
    Submission,
};

/// How often synchronous calls poll a job they are waiting for.
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Request authentication.
#[derive(Clone, Default)]
pub enum RestAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
}

impl std::fmt::Debug for RestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestAuth::None => f.write_str("None"),
            RestAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            RestAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// REST adapter settings.
#[derive(Debug, Clone)]
pub struct RestSettings {
    pub base_url: Url,
    pub auth: RestAuth,
    /// Per-request timeout, also the limit for waiting on a job.
    pub timeout: Duration,
}

/// A request derived from a [`Change`].
struct Request {
    method: Method,
    url: Url,
    body: Option<Value>,
}

/// Outcome of a mutating request.
enum Outcome {
    Done,
    Accepted(JobId),
}

#[derive(Debug, Deserialize)]
struct JobAccepted {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobReport {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// REST-backed load balancer.
pub struct RestModel {
    client: reqwest::Client,
    settings: RestSettings,
}

impl RestModel {
    pub fn new(settings: RestSettings) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ModelError> {
        let mut url = self.settings.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ModelError::Protocol {
                operation: "build url".to_string(),
                reason: format!("{} cannot be a base URL", self.settings.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, change: &Change) -> Result<Request, ModelError> {
        let put = |url, body| Request {
            method: Method::PUT,
            url,
            body: Some(body),
        };
        let delete = |url| Request {
            method: Method::DELETE,
            url,
            body: None,
        };

        let request = match change {
            Change::CreateMonitor(monitor) => put(
                self.url(&["monitors", monitor.name.as_str()])?,
                serde_json::to_value(monitor).map_err(|e| ModelError::Protocol {
                    operation: change.kind().to_string(),
                    reason: e.to_string(),
                })?,
            ),
            Change::DeleteMonitor { name, pool } => {
                let mut url = self.url(&["monitors", name.as_str()])?;
                url.query_pairs_mut().append_pair("pool", pool);
                delete(url)
            }
            Change::CreatePool { name, monitor } => {
                put(self.url(&["pools", name.as_str()])?, json!({ "monitor": monitor }))
            }
            Change::DeletePool { name } => delete(self.url(&["pools", name.as_str()])?),
            Change::CreateRoute { pool, route, path } => put(
                self.url(&["routes", route.as_str()])?,
                json!({ "pool": pool, "path": path }),
            ),
            Change::DeleteRoute { route, .. } => delete(self.url(&["routes", route.as_str()])?),
            Change::AddMember { pool, member } => put(
                self.url(&["pools", pool.as_str(), "members", member.to_string().as_str()])?,
                json!({ "host": member.host, "port": member.port }),
            ),
            Change::DeleteMember { pool, member } => {
                delete(self.url(&["pools", pool.as_str(), "members", member.to_string().as_str()])?)
            }
            Change::AddAlias { pool, alias } => put(
                self.url(&["pools", pool.as_str(), "aliases", alias.as_str()])?,
                json!({ "alias": alias }),
            ),
            Change::DeleteAlias { pool, alias } => {
                delete(self.url(&["pools", pool.as_str(), "aliases", alias.as_str()])?)
            }
            Change::AddSsl {
                pool,
                alias,
                cert,
                key,
            } => put(
                self.url(&["pools", pool.as_str(), "aliases", alias.as_str(), "tls"])?,
                json!({ "certificate": cert, "private_key": key.expose() }),
            ),
            Change::RemoveSsl { pool, alias } => {
                delete(self.url(&["pools", pool.as_str(), "aliases", alias.as_str(), "tls"])?)
            }
        };

        Ok(request)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.auth {
            RestAuth::None => builder,
            RestAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            RestAuth::Bearer(token) => builder.bearer_auth(token),
        }
    }

    async fn execute(&self, change: &Change) -> Result<Outcome, ModelError> {
        let operation = change.kind();
        let Request { method, url, body } = self.request(change)?;
        let is_delete = method == Method::DELETE;

        debug!(method = %method, url = %url, change = %change, "LB request");

        let mut builder = self.authorize(self.client.request(method, url));
        if let Some(body) = &body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::ACCEPTED {
            let accepted: JobAccepted = response.json().await.map_err(|e| ModelError::Protocol {
                operation: operation.to_string(),
                reason: format!("202 without job id: {e}"),
            })?;
            return Ok(Outcome::Accepted(JobId(accepted.job_id)));
        }

        if status.is_success() || (is_delete && status == StatusCode::NOT_FOUND) {
            return Ok(Outcome::Done);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ModelError::Rejected {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    /// Apply a change and wait until it has taken effect.
    async fn apply(&self, change: Change) -> Result<(), ModelError> {
        let job = match self.execute(&change).await? {
            Outcome::Done => return Ok(()),
            Outcome::Accepted(job) => job,
        };

        let deadline = Instant::now() + self.settings.timeout;
        loop {
            match self.job_status(&job).await? {
                JobStatus::Completed => return Ok(()),
                JobStatus::Failed(reason) => return Err(ModelError::JobFailed { job, reason }),
                JobStatus::Pending if Instant::now() >= deadline => {
                    return Err(ModelError::JobTimeout(job))
                }
                JobStatus::Pending => sleep(JOB_POLL_INTERVAL).await,
            }
        }
    }
}

#[async_trait]
impl BackendModel for RestModel {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn get_pools(&self) -> Result<Pools, ModelError> {
        let url = self.url(&["pools"])?;
        let response = self.authorize(self.client.get(url)).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Rejected {
                operation: "get_pools".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let pools: Vec<Pool> = response.json().await.map_err(|e| ModelError::Protocol {
            operation: "get_pools".to_string(),
            reason: e.to_string(),
        })?;

        Ok(pools.into_iter().map(|p| (p.name.clone(), p)).collect())
    }

    async fn create_monitor(&self, monitor: &MonitorSpec) -> Result<(), ModelError> {
        self.apply(Change::CreateMonitor(monitor.clone())).await
    }

    async fn delete_monitor(&self, name: &str, pool: &str) -> Result<(), ModelError> {
        self.apply(Change::DeleteMonitor {
            name: name.to_string(),
            pool: pool.to_string(),
        })
        .await
    }

    async fn create_pool(&self, name: &str, monitor: Option<&str>) -> Result<(), ModelError> {
        self.apply(Change::CreatePool {
            name: name.to_string(),
            monitor: monitor.map(str::to_string),
        })
        .await
    }

    async fn delete_pool(&self, name: &str) -> Result<(), ModelError> {
        self.apply(Change::DeletePool {
            name: name.to_string(),
        })
        .await
    }

    async fn create_route(&self, pool: &str, route: &str, path: &str) -> Result<(), ModelError> {
        self.apply(Change::CreateRoute {
            pool: pool.to_string(),
            route: route.to_string(),
            path: path.to_string(),
        })
        .await
    }

    async fn delete_route(&self, pool: &str, route: &str) -> Result<(), ModelError> {
        self.apply(Change::DeleteRoute {
            pool: pool.to_string(),
            route: route.to_string(),
        })
        .await
    }

    async fn add_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError> {
        self.apply(Change::AddMember {
            pool: pool.to_string(),
            member: member.clone(),
        })
        .await
    }

    async fn delete_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError> {
        self.apply(Change::DeleteMember {
            pool: pool.to_string(),
            member: member.clone(),
        })
        .await
    }

    async fn add_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.apply(Change::AddAlias {
            pool: pool.to_string(),
            alias: alias.to_string(),
        })
        .await
    }

    async fn delete_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.apply(Change::DeleteAlias {
            pool: pool.to_string(),
            alias: alias.to_string(),
        })
        .await
    }

    async fn add_ssl(
        &self,
        pool: &str,
        alias: &str,
        cert: &str,
        key: &PrivateKey,
    ) -> Result<(), ModelError> {
        self.apply(Change::AddSsl {
            pool: pool.to_string(),
            alias: alias.to_string(),
            cert: cert.to_string(),
            key: key.clone(),
        })
        .await
    }

    async fn remove_ssl(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.apply(Change::RemoveSsl {
            pool: pool.to_string(),
            alias: alias.to_string(),
        })
        .await
    }

    async fn submit(&self, change: &Change) -> Result<Submission, ModelError> {
        match self.execute(change).await? {
            Outcome::Done => Ok(Submission::Done),
            Outcome::Accepted(job) => {
                debug!(job = %job, change = %change, "LB job accepted");
                Ok(Submission::Job(job))
            }
        }
    }

    async fn job_status(&self, job: &JobId) -> Result<JobStatus, ModelError> {
        let url = self.url(&["jobs", job.0.as_str()])?;
        let response = self.authorize(self.client.get(url)).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Rejected {
                operation: "job_status".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let report: JobReport = response.json().await.map_err(|e| ModelError::Protocol {
            operation: "job_status".to_string(),
            reason: e.to_string(),
        })?;

        match report.status.as_str() {
            "pending" | "queued" | "running" => Ok(JobStatus::Pending),
            "completed" | "done" | "succeeded" => Ok(JobStatus::Completed),
            "failed" | "error" => Ok(JobStatus::Failed(
                report.error.unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => {
                warn!(job = %job, status = %other, "Unknown job status; treating as pending");
                Ok(JobStatus::Pending)
            }
        }
    }
}
