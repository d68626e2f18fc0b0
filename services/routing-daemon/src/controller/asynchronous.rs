//! Asynchronous application through backend jobs.
//!
//! Changes are partitioned into lanes: one per pool, plus one per monitor.
//! Each lane has at most one job in flight; later changes for the lane queue
//! behind it. Two cross-lane orderings matter:
//!
//! - a pool bound to a monitor is created after that monitor
//! - a monitor is deleted after the pool it belonged to
//!
//! Job status is only polled on the reconcile tick, never inline with event
//! handling.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use lbr_reconcile::RetryTracker;
use tracing::{debug, error, info, warn};

use super::{Controller, ControllerError, Strategy};
use crate::model::{BackendModel, Change, JobId, JobStatus, Pools, Submission};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    Pool(String),
    Monitor(String),
}

impl Lane {
    fn of(change: &Change) -> Self {
        match change {
            Change::CreateMonitor(monitor) => Lane::Monitor(monitor.name.clone()),
            Change::DeleteMonitor { name, .. } => Lane::Monitor(name.clone()),
            other => Lane::Pool(other.pool().unwrap_or_default().to_string()),
        }
    }

    /// The lane that must settle before `change` may be submitted.
    fn dependency(change: &Change) -> Option<Self> {
        match change {
            Change::CreatePool {
                monitor: Some(monitor),
                ..
            } => Some(Lane::Monitor(monitor.clone())),
            Change::DeleteMonitor { pool, .. } => Some(Lane::Pool(pool.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Pool(name) => write!(f, "pool:{name}"),
            Lane::Monitor(name) => write!(f, "monitor:{name}"),
        }
    }
}

#[derive(Debug)]
struct Scheduled {
    seq: u64,
    change: Change,
}

#[derive(Debug)]
struct InFlight {
    seq: u64,
    change: Change,
    job: JobId,
}

#[derive(Debug, Default)]
struct LaneState {
    in_flight: Option<InFlight>,
    queue: VecDeque<Scheduled>,
}

impl LaneState {
    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }
}

pub struct AsyncController {
    model: Arc<dyn BackendModel>,
    retry: RetryTracker,
    lanes: BTreeMap<Lane, LaneState>,
    next_seq: u64,
}

impl AsyncController {
    pub fn new(model: Arc<dyn BackendModel>, retry: RetryTracker) -> Self {
        Self {
            model,
            retry,
            lanes: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn lane_idle(&self, lane: &Lane) -> bool {
        self.lanes.get(lane).map_or(true, LaneState::is_idle)
    }

    /// Returns true if `lane` holds work that must go before change `seq`.
    fn lane_blocks(&self, lane: &Lane, seq: u64) -> bool {
        self.lanes.get(lane).is_some_and(|state| {
            state.in_flight.is_some() || state.queue.front().is_some_and(|q| q.seq < seq)
        })
    }

    /// The lane whose queued head is oldest among those free to submit.
    fn next_ready(&self, skipped: &BTreeSet<Lane>) -> Option<Lane> {
        self.lanes
            .iter()
            .filter(|(lane, state)| state.in_flight.is_none() && !skipped.contains(*lane))
            .filter_map(|(lane, state)| state.queue.front().map(|head| (lane, head)))
            .filter(|(_, head)| {
                Lane::dependency(&head.change).map_or(true, |dep| !self.lane_blocks(&dep, head.seq))
            })
            .min_by_key(|(_, head)| head.seq)
            .map(|(lane, _)| lane.clone())
    }

    /// Poll every in-flight job once.
    async fn poll(&mut self) {
        let busy: Vec<Lane> = self
            .lanes
            .iter()
            .filter(|(_, state)| state.in_flight.is_some())
            .map(|(lane, _)| lane.clone())
            .collect();

        for lane in busy {
            let Some(job) = self
                .lanes
                .get(&lane)
                .and_then(|s| s.in_flight.as_ref())
                .map(|f| f.job.clone())
            else {
                continue;
            };

            let status = self.model.job_status(&job).await;
            let Some(state) = self.lanes.get_mut(&lane) else {
                continue;
            };

            match status {
                Ok(JobStatus::Pending) => {
                    debug!(job = %job, lane = %lane, "Job still pending");
                }
                Ok(JobStatus::Completed) => {
                    if let Some(done) = state.in_flight.take() {
                        self.retry.clear(&done.change.key());
                        info!(job = %job, change = %done.change, "Job completed");
                    }
                }
                Ok(JobStatus::Failed(reason)) => {
                    let Some(failed) = state.in_flight.take() else {
                        continue;
                    };
                    let key = failed.change.key();
                    if self.retry.record_failure(&key) {
                        error!(
                            job = %job,
                            change = %failed.change,
                            reason = %reason,
                            "Job keeps failing; giving up on change"
                        );
                        self.retry.clear(&key);
                    } else {
                        warn!(
                            job = %job,
                            change = %failed.change,
                            reason = %reason,
                            attempts = self.retry.failures(&key),
                            "Job failed; will resubmit"
                        );
                        state.queue.push_front(Scheduled {
                            seq: failed.seq,
                            change: failed.change,
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        job = %job,
                        lane = %lane,
                        error = %e,
                        "Polling job failed; will poll again"
                    );
                }
            }
        }
    }

    /// Submit queued changes whose lanes are free, oldest first.
    async fn drain(&mut self) -> Result<(), ControllerError> {
        let mut first_error = None;
        let mut skipped = BTreeSet::new();

        while let Some(lane) = self.next_ready(&skipped) {
            let Some(next) = self.lanes.get_mut(&lane).and_then(|s| s.queue.pop_front()) else {
                break;
            };

            let submitted = self.model.submit(&next.change).await;
            let Some(state) = self.lanes.get_mut(&lane) else {
                break;
            };

            match submitted {
                Ok(Submission::Done) => {
                    self.retry.clear(&next.change.key());
                    debug!(change = %next.change, "Applied queued change");
                }
                Ok(Submission::Job(job)) => {
                    debug!(job = %job, change = %next.change, "Submitted queued change");
                    state.in_flight = Some(InFlight {
                        seq: next.seq,
                        change: next.change,
                        job,
                    });
                }
                Err(e) => {
                    let key = next.change.key();
                    if self.retry.record_failure(&key) {
                        error!(
                            change = %next.change,
                            error = %e,
                            "Submission keeps failing; dropping change"
                        );
                        self.retry.clear(&key);
                    } else {
                        warn!(change = %next.change, error = %e, "Submission failed; will retry");
                        skipped.insert(lane);
                        first_error.get_or_insert(ControllerError::submit(&next.change, e));
                        state.queue.push_front(next);
                        continue;
                    }
                    first_error.get_or_insert(ControllerError::submit(&next.change, e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Controller for AsyncController {
    fn strategy(&self) -> Strategy {
        Strategy::Async
    }

    async fn apply(&mut self, change: Change) -> Result<(), ControllerError> {
        let lane = Lane::of(&change);
        let blocked = !self.lane_idle(&lane)
            || Lane::dependency(&change).is_some_and(|dep| !self.lane_idle(&dep));

        self.next_seq += 1;
        let seq = self.next_seq;

        if blocked {
            debug!(change = %change, lane = %lane, "Lane busy; queued change");
            self.lanes
                .entry(lane)
                .or_default()
                .queue
                .push_back(Scheduled { seq, change });
            return Ok(());
        }

        match self.model.submit(&change).await {
            Ok(Submission::Done) => {
                debug!(change = %change, "Change applied on submission");
                Ok(())
            }
            Ok(Submission::Job(job)) => {
                debug!(job = %job, change = %change, "Submitted change");
                self.lanes.entry(lane).or_default().in_flight = Some(InFlight { seq, change, job });
                Ok(())
            }
            Err(e) => Err(ControllerError::submit(&change, e)),
        }
    }

    async fn pools(&mut self) -> Result<Pools, ControllerError> {
        let mut pools = self.model.get_pools().await.map_err(ControllerError::Pools)?;

        let mut scheduled: Vec<(u64, &Change)> = Vec::new();
        for state in self.lanes.values() {
            if let Some(f) = &state.in_flight {
                scheduled.push((f.seq, &f.change));
            }
            scheduled.extend(state.queue.iter().map(|q| (q.seq, &q.change)));
        }
        scheduled.sort_by_key(|(seq, _)| *seq);

        for (_, change) in scheduled {
            change.apply_to_view(&mut pools);
        }
        Ok(pools)
    }

    async fn reconcile(&mut self) -> Result<(), ControllerError> {
        self.poll().await;
        let drained = self.drain().await;

        self.lanes.retain(|_, state| !state.is_idle());
        self.retry.prune();

        if !self.lanes.is_empty() {
            debug!(
                lanes = self.lanes.len(),
                pending = self.pending(),
                "Changes still outstanding"
            );
        }
        drained
    }

    fn pending(&self) -> usize {
        self.lanes.values().map(LaneState::len).sum()
    }
}
