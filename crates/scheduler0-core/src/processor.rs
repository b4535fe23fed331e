//! Job processor.
//!
//! One driver task per node. On every committed allocation it materializes
//! the jobs in its assigned range, reconstructs where each job left off from
//! the latest execution log, and drives a single wheel of upcoming fires.
//! Fires that are already in the past when their turn comes are skipped (and
//! recorded as `missed`); the processor never back-fills.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use scheduler0_commons::models::{ExecutionState, Job, JobExecutionLog};
use scheduler0_commons::{Clock, NodeId, SchedulerError};
use scheduler0_raft::{FsmEvent, SchedulerFsm};
use tokio_util::sync::CancellationToken;

use crate::executor::{ExecutionMode, ExecutorHandle, FireEvent};
use crate::repos::{ExecutionEntry, ExecutionsRepo, JobQueueRepo, JobRepo};
use crate::schedule::{next_fire, parse_spec, parse_timezone};

/// Fires older than this when popped are treated as missed rather than
/// dispatched; covers clock jumps and long downtime.
fn missed_grace() -> Duration {
    Duration::seconds(10)
}

/// Outcome decision for a due wheel entry.
#[derive(Debug, PartialEq, Eq)]
enum FireDecision {
    Dispatch,
    Missed,
}

fn classify_fire(now: DateTime<Utc>, fire_at: DateTime<Utc>) -> FireDecision {
    if now - fire_at > missed_grace() {
        FireDecision::Missed
    } else {
        FireDecision::Dispatch
    }
}

/// Wheel entry for one job.
struct ScheduledJob {
    job: Job,
    schedule: Schedule,
    tz: Tz,
    next_fire: DateTime<Utc>,
    last_fire: DateTime<Utc>,
    execution_version: u64,
}

/// Seed (next fire, execution version) for a job, continuing from its latest
/// recorded execution when one exists.
fn seed_job(
    job: &Job,
    schedule: &Schedule,
    tz: Tz,
    last_log: Option<&JobExecutionLog>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>, u64)> {
    let floor = job.start_date.map_or(now, |start| start.max(now));
    match last_log {
        Some(log) => {
            let next = next_fire(schedule, tz, log.next_execution_datetime)?;
            Some((next, log.next_execution_datetime, log.execution_version + 1))
        }
        None => {
            let next = next_fire(schedule, tz, floor)?;
            Some((next, floor, 1))
        }
    }
}

pub struct JobProcessor {
    job_repo: Arc<JobRepo>,
    executions_repo: Arc<ExecutionsRepo>,
    queue_repo: Arc<JobQueueRepo>,
    fsm: Arc<SchedulerFsm>,
    executor: ExecutorHandle,
    mode: ExecutionMode,
    clock: Arc<dyn Clock>,
    node_id: NodeId,
    cancel: CancellationToken,
}

impl JobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_repo: Arc<JobRepo>,
        executions_repo: Arc<ExecutionsRepo>,
        queue_repo: Arc<JobQueueRepo>,
        fsm: Arc<SchedulerFsm>,
        executor: ExecutorHandle,
        mode: ExecutionMode,
        clock: Arc<dyn Clock>,
        node_id: NodeId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_repo,
            executions_repo,
            queue_repo,
            fsm,
            executor,
            mode,
            clock,
            node_id,
            cancel,
        }
    }

    /// The driver loop. Owns the wheel; everything else communicates through
    /// the FSM event channel and the executor queue.
    pub async fn run(self) {
        let mut events = self.fsm.subscribe();
        let mut jobs: HashMap<u64, ScheduledJob> = HashMap::new();
        let mut wheel: BinaryHeap<Reverse<(DateTime<Utc>, u64)>> = BinaryHeap::new();
        let mut queue_version = 0u64;

        if let Err(e) = self.reload(&mut jobs, &mut wheel, &mut queue_version) {
            log::warn!("initial job range load failed: {e}");
        }

        loop {
            self.fire_due(&mut jobs, &mut wheel, queue_version);

            let now = self.clock.now();
            let sleep_for = match wheel.peek() {
                Some(Reverse((fire_at, _))) => {
                    let until = *fire_at - now;
                    until
                        .to_std()
                        .unwrap_or(std::time::Duration::from_millis(0))
                        .max(std::time::Duration::from_millis(50))
                }
                None => std::time::Duration::from_secs(1),
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("job processor stopping");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
                event = events.recv() => {
                    if let Ok(FsmEvent::JobQueueUpdated { version, .. }) = event {
                        log::info!("allocation changed to version {version}; rebuilding wheel");
                        if let Err(e) = self.reload(&mut jobs, &mut wheel, &mut queue_version) {
                            log::warn!("job range reload failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Rebuild the wheel from this node's currently assigned range.
    fn reload(
        &self,
        jobs: &mut HashMap<u64, ScheduledJob>,
        wheel: &mut BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
        queue_version: &mut u64,
    ) -> Result<(), SchedulerError> {
        jobs.clear();
        wheel.clear();

        let version = self.queue_repo.get_last_version()?;
        *queue_version = version;
        if version == 0 {
            return Ok(());
        }

        let Some(range) = self
            .queue_repo
            .get_last_job_queue_log_for_node(self.node_id, version)?
        else {
            log::debug!("no range assigned to node {} at version {version}", self.node_id);
            return Ok(());
        };
        if range.lower_bound_job_id == 0 && range.upper_bound_job_id == 0 {
            return Ok(());
        }

        let assigned = self
            .job_repo
            .get_jobs_in_range(range.lower_bound_job_id, range.upper_bound_job_id)?;
        let job_ids: Vec<u64> = assigned.iter().map(|j| j.id).collect();
        let last_logs = self
            .executions_repo
            .get_last_execution_log_for_job_ids(&job_ids)?;

        let now = self.clock.now();
        for job in assigned {
            let schedule = match parse_spec(&job.spec) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("job {} has an unparsable spec: {e}", job.id);
                    continue;
                }
            };
            let tz = match parse_timezone(&job.timezone) {
                Ok(tz) => tz,
                Err(e) => {
                    log::warn!("job {} has an unparsable timezone: {e}", job.id);
                    continue;
                }
            };

            let Some((next, last, exec_version)) =
                seed_job(&job, &schedule, tz, last_logs.get(&job.id), now)
            else {
                log::debug!("job {} has no upcoming fires", job.id);
                continue;
            };

            wheel.push(Reverse((next, job.id)));
            jobs.insert(
                job.id,
                ScheduledJob {
                    job,
                    schedule,
                    tz,
                    next_fire: next,
                    last_fire: last,
                    execution_version: exec_version,
                },
            );
        }

        log::info!(
            "node {} scheduling {} jobs in range [{}, {}] at version {}",
            self.node_id,
            jobs.len(),
            range.lower_bound_job_id,
            range.upper_bound_job_id,
            version
        );
        Ok(())
    }

    /// Pop and act on every wheel entry that is due.
    fn fire_due(
        &self,
        jobs: &mut HashMap<u64, ScheduledJob>,
        wheel: &mut BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
        queue_version: u64,
    ) {
        loop {
            let now = self.clock.now();
            let Some(Reverse((fire_at, job_id))) = wheel.peek().copied() else {
                return;
            };
            if fire_at > now {
                return;
            }
            wheel.pop();

            let Some(entry) = jobs.get_mut(&job_id) else {
                continue;
            };
            // Stale wheel entry left behind by a reload.
            if entry.next_fire != fire_at {
                continue;
            }
            if entry
                .job
                .end_date
                .is_some_and(|end| fire_at > end)
            {
                jobs.remove(&job_id);
                continue;
            }

            match classify_fire(now, fire_at) {
                FireDecision::Dispatch => {
                    self.executor.submit(FireEvent {
                        job: entry.job.clone(),
                        last_execution_datetime: entry.last_fire,
                        next_execution_datetime: fire_at,
                        execution_version: entry.execution_version,
                        job_queue_version: queue_version,
                    });
                }
                FireDecision::Missed => {
                    log::warn!(
                        "job {job_id} missed its fire at {fire_at}; skipping without back-fill"
                    );
                    if let Err(e) = self.executions_repo.batch_insert(
                        &[ExecutionEntry {
                            job_id,
                            last_execution_datetime: entry.last_fire,
                            next_execution_datetime: fire_at,
                            execution_version: entry.execution_version,
                            job_queue_version: queue_version,
                        }],
                        ExecutionState::Missed,
                        self.mode.committed(),
                    ) {
                        log::error!("failed to record missed fire for job {job_id}: {e}");
                    }
                }
            }

            entry.last_fire = fire_at;
            entry.execution_version += 1;
            // After a missed fire, resume from now so the skip never cascades.
            let resume_from = fire_at.max(now);
            match next_fire(&entry.schedule, entry.tz, resume_from) {
                Some(next) => {
                    entry.next_fire = next;
                    wheel.push(Reverse((next, job_id)));
                }
                None => {
                    jobs.remove(&job_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, secs).unwrap()
    }

    #[test]
    fn fresh_fires_dispatch_and_stale_fires_miss() {
        assert_eq!(classify_fire(at(5), at(3)), FireDecision::Dispatch);
        assert_eq!(classify_fire(at(30), at(3)), FireDecision::Missed);
        assert_eq!(classify_fire(at(3), at(3)), FireDecision::Dispatch);
    }

    fn job(spec: &str) -> Job {
        Job {
            id: 1,
            project_id: 1,
            spec: spec.into(),
            timezone: "UTC".into(),
            callback_url: "http://127.0.0.1:1/cb".into(),
            data: "{}".into(),
            start_date: None,
            end_date: None,
            date_created: at(0),
        }
    }

    #[test]
    fn seed_without_history_starts_after_now() {
        let job = job("0 * * * * *");
        let schedule = parse_spec(&job.spec).unwrap();
        let (next, last, version) =
            seed_job(&job, &schedule, chrono_tz::UTC, None, at(30)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap());
        assert_eq!(last, at(30));
        assert_eq!(version, 1);
    }

    #[test]
    fn seed_with_history_continues_from_last_recorded_instant() {
        let job = job("0 * * * * *");
        let schedule = parse_spec(&job.spec).unwrap();
        let log = JobExecutionLog {
            next_execution_datetime: Utc.with_ymd_and_hms(2024, 5, 1, 9, 58, 0).unwrap(),
            execution_version: 4,
            ..Default::default()
        };
        let (next, last, version) =
            seed_job(&job, &schedule, chrono_tz::UTC, Some(&log), at(30)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 9, 59, 0).unwrap());
        assert_eq!(last, log.next_execution_datetime);
        // Never resets: continues past the recorded version.
        assert_eq!(version, 5);
    }

    #[test]
    fn seed_respects_future_start_date() {
        let mut job = job("0 * * * * *");
        job.start_date = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let schedule = parse_spec(&job.spec).unwrap();
        let (next, _, _) = seed_job(&job, &schedule, chrono_tz::UTC, None, at(0)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
    }
}
