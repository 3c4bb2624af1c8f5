//! Cron-driven trigger layer.
//!
//! Holds an in-memory registry of scheduled jobs keyed by task id, fed
//! from persisted task documents. Each firing creates a fresh result and
//! hands off to the orchestrator without waiting for completion.

pub mod engine;

pub use self::engine::run_scheduler_loop;

use crate::engine::{load_run_inputs, orchestrator, EngineContext};
use crate::model::Trigger;
use crate::storage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What to do when a cron tick fires for a task whose previous run is
/// still in flight. `Allow` matches the historical behavior; `Block`
/// skips the tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Allow,
    Block,
}

struct Job {
    task_id: Uuid,
    name: String,
    cron: String,
    schedule: CronSchedule,
    next_at: DateTime<Utc>,
    /// Count of currently executing runs for this task. A counter, not a
    /// flag: the allow policy can have several runs in flight at once.
    in_flight: Arc<AtomicUsize>,
}

/// Live registry snapshot entry, served by the API and CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    pub task_id: Uuid,
    pub name: String,
    pub cron: String,
    pub next_at: DateTime<Utc>,
    pub in_flight: bool,
}

/// Registry of active scheduled jobs plus the machinery to fire them.
#[derive(Clone)]
pub struct Scheduler {
    ctx: EngineContext,
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    policy: OverlapPolicy,
}

impl Scheduler {
    pub fn new(ctx: EngineContext, policy: OverlapPolicy) -> Self {
        Self {
            ctx,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    /// Register every eligible task from storage. Invalid cron
    /// expressions are logged and skipped, never fatal.
    pub async fn load_jobs(&self) -> Result<usize> {
        let tasks = storage::list_scheduled_tasks(&self.ctx.pool)?;
        let mut registered = 0;
        for task in &tasks {
            if self.register_task(task).await {
                registered += 1;
            }
        }
        info!(registered, candidates = tasks.len(), "scheduler loaded");
        Ok(registered)
    }

    /// Register (or replace) the job for a task. Returns false when the
    /// task is not schedulable.
    pub async fn register_task(&self, task: &crate::model::Task) -> bool {
        if !task.enabled || !task.schedule.enabled || task.schedule.cron.trim().is_empty() {
            return false;
        }
        let schedule = match CronSchedule::from_str(&task.schedule.cron) {
            Ok(s) => s,
            Err(e) => {
                warn!(task=%task.id, cron=%task.schedule.cron, "invalid cron expression, skipping: {}", e);
                return false;
            }
        };
        let Some(next_at) = schedule.upcoming(Utc).next() else {
            warn!(task=%task.id, cron=%task.schedule.cron, "cron expression never fires, skipping");
            return false;
        };

        let mut jobs = self.jobs.write().await;
        // Preserve the in-flight guard across re-registration so the
        // block policy still sees a running job after a reload.
        let in_flight = jobs
            .get(&task.id)
            .map(|j| j.in_flight.clone())
            .unwrap_or_default();
        jobs.insert(
            task.id,
            Job {
                task_id: task.id,
                name: task.name.clone(),
                cron: task.schedule.cron.clone(),
                schedule,
                next_at,
                in_flight,
            },
        );
        info!(task=%task.id, cron=%task.schedule.cron, %next_at, "schedule registered");
        true
    }

    /// Re-read a task and bring its job in line with persisted state:
    /// re-register when still eligible, remove otherwise. Returns
    /// whether a job is registered afterwards.
    pub async fn reload_task(&self, task_id: Uuid) -> Result<bool> {
        match storage::get_task(&self.ctx.pool, task_id)? {
            Some(task) => {
                let registered = self.register_task(&task).await;
                if !registered {
                    self.remove(task_id).await;
                }
                Ok(registered)
            }
            None => {
                self.remove(task_id).await;
                Ok(false)
            }
        }
    }

    pub async fn remove(&self, task_id: Uuid) {
        if self.jobs.write().await.remove(&task_id).is_some() {
            info!(task=%task_id, "schedule removed");
        }
    }

    pub async fn snapshot(&self) -> Vec<ScheduleEntry> {
        let jobs = self.jobs.read().await;
        let mut entries: Vec<ScheduleEntry> = jobs
            .values()
            .map(|j| ScheduleEntry {
                task_id: j.task_id,
                name: j.name.clone(),
                cron: j.cron.clone(),
                next_at: j.next_at,
                in_flight: j.in_flight.load(Ordering::SeqCst) > 0,
            })
            .collect();
        entries.sort_by_key(|e| e.next_at);
        entries
    }

    /// Upcoming fire times within the next `hours`, for dry-run previews.
    pub async fn preview_next_runs(&self, hours: u64) -> Vec<(DateTime<Utc>, String)> {
        let end = Utc::now() + chrono::Duration::hours(hours as i64);
        let jobs = self.jobs.read().await;
        let mut preview = Vec::new();
        for job in jobs.values() {
            for fire_at in job.schedule.upcoming(Utc) {
                if fire_at > end {
                    break;
                }
                preview.push((fire_at, job.name.clone()));
            }
        }
        preview.sort_by_key(|(t, _)| *t);
        preview
    }

    /// Fire every job whose next fire time has passed. Returns
    /// (started, skipped) counts; skips happen only under the block
    /// policy when a previous run is still in flight.
    pub async fn fire_due(&self) -> (usize, usize) {
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            for job in jobs.values_mut() {
                if job.next_at > now {
                    continue;
                }
                match job.schedule.after(&now).next() {
                    Some(next) => job.next_at = next,
                    None => {
                        // Expression has no future firings; leave next_at in
                        // the past, reload will clean the job up.
                        warn!(task=%job.task_id, "cron expression exhausted");
                        continue;
                    }
                }
                due.push((job.task_id, job.in_flight.clone()));
            }
        }

        let mut started = 0;
        let mut skipped = 0;
        for (task_id, in_flight) in due {
            if self.policy == OverlapPolicy::Block && in_flight.load(Ordering::SeqCst) > 0 {
                warn!(task=%task_id, "previous run still in flight, skipping tick");
                skipped += 1;
                continue;
            }
            in_flight.fetch_add(1, Ordering::SeqCst);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                fire_task(ctx, task_id).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
            started += 1;
        }
        (started, skipped)
    }
}

/// Run one scheduled firing to completion. Failures are logged, never
/// propagated to the scheduler loop.
async fn fire_task(ctx: EngineContext, task_id: Uuid) {
    let (task, environment) = match load_run_inputs(&ctx, task_id) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!(task=%task_id, "scheduled run could not start: {}", e);
            return;
        }
    };
    let result_id = Uuid::new_v4();
    info!(task=%task_id, result=%result_id, "scheduled run firing");
    orchestrator::run(ctx, task, environment, result_id, Trigger::Schedule, None).await;
}
