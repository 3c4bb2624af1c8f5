use crate::scheduler::Scheduler;
use std::time::Duration;
use tracing::{debug, info};

/// Main scheduler execution loop.
/// Polls the job registry for due schedules at a fixed interval; each
/// due job spawns its run and the loop moves on without waiting.
pub async fn run_scheduler_loop(scheduler: Scheduler, poll_interval: Duration) {
    info!(poll_secs = poll_interval.as_secs(), "Scheduler engine started");

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let (started, skipped) = scheduler.fire_due().await;
        if started > 0 || skipped > 0 {
            debug!(started, skipped, "scheduler tick");
        }
    }
}
