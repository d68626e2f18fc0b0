//! In-memory backend.
//!
//! Keeps pools, routes and monitors in memory and records every mutating call
//! in order, so tests can assert exactly what the daemon asked for. Failures
//! can be injected per operation, and an asynchronous mode turns
//! [`BackendModel::submit`] into jobs that finish on the next poll.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use lbr_events::PrivateKey;
use tracing::debug;

use super::{
    BackendModel, Change, JobId, JobStatus, Member, ModelError, MonitorSpec, Pool, Pools,
    Submission,
};

#[derive(Debug)]
struct Job {
    change: Change,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct DummyState {
    pools: Pools,
    /// route name -> (pool, path)
    routes: BTreeMap<String, (String, String)>,
    monitors: BTreeMap<String, MonitorSpec>,
    calls: Vec<String>,
    /// operation -> remaining injected failures (None = always)
    failures: HashMap<String, Option<u32>>,
    jobs: BTreeMap<JobId, Job>,
    submitted: VecDeque<JobId>,
    next_job: u64,
}

/// In-memory load balancer.
#[derive(Debug, Default)]
pub struct DummyModel {
    state: Mutex<DummyState>,
    async_jobs: bool,
    job_latency: u32,
}

impl DummyModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`BackendModel::submit`] return jobs instead of applying.
    ///
    /// A job reports `Pending` for `latency` polls, then applies its change
    /// and reports `Completed` (or `Failed` if the change fails).
    pub fn with_async_jobs(mut self, latency: u32) -> Self {
        self.async_jobs = true;
        self.job_latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DummyState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls of `operation`, or every call if `None`.
    ///
    /// Operations use the names from [`Change::kind`], plus `get_pools`,
    /// `apply_batch`, `submit` and `job_status`.
    pub fn fail(&self, operation: &str, times: Option<u32>) {
        self.lock().failures.insert(operation.to_string(), times);
    }

    /// Stop injecting failures for `operation`.
    pub fn heal(&self, operation: &str) {
        self.lock().failures.remove(operation);
    }

    /// Mutating calls made so far, e.g. `delete_pool(pool_a)`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Current pools.
    pub fn pools(&self) -> Pools {
        self.lock().pools.clone()
    }

    /// Current routes as `(route, pool, path)`.
    pub fn routes(&self) -> Vec<(String, String, String)> {
        self.lock()
            .routes
            .iter()
            .map(|(route, (pool, path))| (route.clone(), pool.clone(), path.clone()))
            .collect()
    }

    /// Current monitors.
    pub fn monitors(&self) -> Vec<MonitorSpec> {
        self.lock().monitors.values().cloned().collect()
    }

    /// Jobs submitted but not yet finished.
    pub fn open_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Ids of every job submitted so far, oldest first.
    pub fn submitted_jobs(&self) -> Vec<JobId> {
        self.lock().submitted.iter().cloned().collect()
    }

    /// Record the call and apply any injected failure, then run `f`.
    fn call<T>(
        &self,
        record: String,
        operation: &str,
        f: impl FnOnce(&mut DummyState) -> Result<T, ModelError>,
    ) -> Result<T, ModelError> {
        let mut state = self.lock();
        state.calls.push(record);
        check_failure(&mut state, operation)?;
        f(&mut state)
    }
}

fn check_failure(state: &mut DummyState, operation: &str) -> Result<(), ModelError> {
    let Some(remaining) = state.failures.get_mut(operation) else {
        return Ok(());
    };

    match remaining {
        None => Err(ModelError::Injected(operation.to_string())),
        Some(0) => Ok(()),
        Some(n) => {
            *n -= 1;
            Err(ModelError::Injected(operation.to_string()))
        }
    }
}

fn pool_mut<'a>(state: &'a mut DummyState, pool: &str) -> Result<&'a mut Pool, ModelError> {
    state
        .pools
        .get_mut(pool)
        .ok_or_else(|| ModelError::NoSuchPool(pool.to_string()))
}

#[async_trait]
impl BackendModel for DummyModel {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn get_pools(&self) -> Result<Pools, ModelError> {
        let mut state = self.lock();
        check_failure(&mut state, "get_pools")?;
        Ok(state.pools.clone())
    }

    async fn create_monitor(&self, monitor: &MonitorSpec) -> Result<(), ModelError> {
        self.call(
            format!("create_monitor({}, {})", monitor.name, monitor.path),
            "create_monitor",
            |state| {
                state.monitors.insert(monitor.name.clone(), monitor.clone());
                Ok(())
            },
        )
    }

    async fn delete_monitor(&self, name: &str, pool: &str) -> Result<(), ModelError> {
        self.call(
            format!("delete_monitor({name}, {pool})"),
            "delete_monitor",
            |state| {
                state.monitors.remove(name);
                Ok(())
            },
        )
    }

    async fn create_pool(&self, name: &str, monitor: Option<&str>) -> Result<(), ModelError> {
        self.call(
            format!("create_pool({name}, {})", monitor.unwrap_or("-")),
            "create_pool",
            |state| {
                state
                    .pools
                    .entry(name.to_string())
                    .or_insert_with(|| Pool::new(name, monitor.map(str::to_string)));
                Ok(())
            },
        )
    }

    async fn delete_pool(&self, name: &str) -> Result<(), ModelError> {
        self.call(format!("delete_pool({name})"), "delete_pool", |state| {
            state.pools.remove(name);
            Ok(())
        })
    }

    async fn create_route(&self, pool: &str, route: &str, path: &str) -> Result<(), ModelError> {
        self.call(
            format!("create_route({pool}, {route}, {path})"),
            "create_route",
            |state| {
                pool_mut(state, pool)?;
                state
                    .routes
                    .insert(route.to_string(), (pool.to_string(), path.to_string()));
                Ok(())
            },
        )
    }

    async fn delete_route(&self, pool: &str, route: &str) -> Result<(), ModelError> {
        self.call(
            format!("delete_route({pool}, {route})"),
            "delete_route",
            |state| {
                state.routes.remove(route);
                Ok(())
            },
        )
    }

    async fn add_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError> {
        self.call(
            format!("add_pool_member({pool}, {member})"),
            "add_pool_member",
            |state| {
                pool_mut(state, pool)?.members.insert(member.clone());
                Ok(())
            },
        )
    }

    async fn delete_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError> {
        self.call(
            format!("delete_pool_member({pool}, {member})"),
            "delete_pool_member",
            |state| {
                if let Some(p) = state.pools.get_mut(pool) {
                    p.members.remove(member);
                }
                Ok(())
            },
        )
    }

    async fn add_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.call(
            format!("add_pool_alias({pool}, {alias})"),
            "add_pool_alias",
            |state| {
                pool_mut(state, pool)?.aliases.insert(alias.to_string());
                Ok(())
            },
        )
    }

    async fn delete_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.call(
            format!("delete_pool_alias({pool}, {alias})"),
            "delete_pool_alias",
            |state| {
                if let Some(p) = state.pools.get_mut(pool) {
                    p.aliases.remove(alias);
                    p.tls_aliases.remove(alias);
                }
                Ok(())
            },
        )
    }

    async fn add_ssl(
        &self,
        pool: &str,
        alias: &str,
        _cert: &str,
        _key: &PrivateKey,
    ) -> Result<(), ModelError> {
        self.call(format!("add_ssl({pool}, {alias})"), "add_ssl", |state| {
            pool_mut(state, pool)?.tls_aliases.insert(alias.to_string());
            Ok(())
        })
    }

    async fn remove_ssl(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.call(format!("remove_ssl({pool}, {alias})"), "remove_ssl", |state| {
            if let Some(p) = state.pools.get_mut(pool) {
                p.tls_aliases.remove(alias);
            }
            Ok(())
        })
    }

    async fn apply_batch(&self, changes: &[Change]) -> Result<(), ModelError> {
        self.call(
            format!("apply_batch({})", changes.len()),
            "apply_batch",
            |_| Ok(()),
        )?;
        for change in changes {
            change.apply_to(self).await?;
        }
        Ok(())
    }

    async fn submit(&self, change: &Change) -> Result<Submission, ModelError> {
        if !self.async_jobs {
            {
                let mut state = self.lock();
                check_failure(&mut state, "submit")?;
            }
            change.apply_to(self).await?;
            return Ok(Submission::Done);
        }

        let mut state = self.lock();
        check_failure(&mut state, "submit")?;

        state.next_job += 1;
        let job = JobId(format!("job-{}", state.next_job));
        state.jobs.insert(
            job.clone(),
            Job {
                change: change.clone(),
                polls_left: self.job_latency,
            },
        );
        state.submitted.push_back(job.clone());
        debug!(job = %job, change = %change, "[DUMMY] Job submitted");
        Ok(Submission::Job(job))
    }

    async fn job_status(&self, job: &JobId) -> Result<JobStatus, ModelError> {
        let change = {
            let mut state = self.lock();
            check_failure(&mut state, "job_status")?;

            let Some(entry) = state.jobs.get_mut(job) else {
                return Err(ModelError::Protocol {
                    operation: "job_status".to_string(),
                    reason: format!("unknown job {job}"),
                });
            };

            if entry.polls_left > 0 {
                entry.polls_left -= 1;
                return Ok(JobStatus::Pending);
            }

            match state.jobs.remove(job) {
                Some(entry) => entry.change,
                None => return Ok(JobStatus::Completed),
            }
        };

        match change.apply_to(self).await {
            Ok(()) => Ok(JobStatus::Completed),
            Err(e) => Ok(JobStatus::Failed(e.to_string())),
        }
    }
}
