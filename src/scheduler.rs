// Daily trigger - fires the balance job on a cron schedule
//
// Idle -> Triggered -> Running -> Succeeded | Failed -> Idle
//
// Anything the job returns or panics with is logged here and swallowed, so
// the schedule keeps firing. Overlap across processes is left to the run lock.

use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::orchestrator::{BalanceJob, RunReport};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Triggered,
    Running,
    Succeeded,
    Failed,
}

pub struct Scheduler<J: BalanceJob + 'static> {
    job: Arc<J>,
    schedule: cron::Schedule,
    timezone: Tz,
    state: watch::Sender<SchedulerState>,
}

impl<J: BalanceJob + 'static> Scheduler<J> {
    pub fn new(job: Arc<J>, config: &ScheduleConfig) -> Result<Self> {
        let schedule = config.parse_cron()?;
        let timezone = config.parse_timezone()?;
        let (state, _) = watch::channel(SchedulerState::Idle);

        Ok(Self {
            job,
            schedule,
            timezone,
            state,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Next fire strictly after `after`, in the schedule's timezone
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Tz>> {
        self.schedule.after(&after.with_timezone(&self.timezone)).next()
    }

    /// Business date processed by a fire: the local day before it
    pub fn balance_date_for(&self, fired_at: &DateTime<Tz>) -> NaiveDate {
        let local = fired_at.date_naive();
        local.pred_opt().unwrap_or(local)
    }

    fn transition(&self, next: SchedulerState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(from = ?previous, to = ?next, "Scheduler state");
    }

    /// Fire the job once; never propagates the job's failure
    pub async fn fire(&self, fired_at: DateTime<Tz>) -> SchedulerState {
        self.transition(SchedulerState::Triggered);

        let balance_date = self.balance_date_for(&fired_at);
        tracing::info!(%fired_at, %balance_date, "Scheduled balance run triggered");

        let job = Arc::clone(&self.job);
        self.transition(SchedulerState::Running);

        // Own task so a panic inside the job is contained
        let outcome = tokio::spawn(async move {
            job.run(balance_date).await.and_then(RunReport::into_result)
        })
        .await;

        let finished = match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    run_id = %report.context.run_id,
                    %balance_date,
                    partitions = report.outcomes.len(),
                    "Scheduled balance run succeeded"
                );
                SchedulerState::Succeeded
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, %balance_date, "Scheduled balance run failed");
                SchedulerState::Failed
            }
            Err(e) => {
                tracing::error!(error = %e, %balance_date, "Scheduled balance run aborted");
                SchedulerState::Failed
            }
        };

        self.transition(finished);
        self.transition(SchedulerState::Idle);
        finished
    }

    /// Sleep until each fire and run the job, until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let Some(next) = self.next_fire_after(Utc::now()) else {
                tracing::warn!("Schedule has no upcoming fire times; scheduler stopping");
                return;
            };

            let wait = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tracing::info!(next_fire = %next, wait_secs = wait.as_secs(), "Waiting for next scheduled run");

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.fire(next).await;
        }
    }
}
