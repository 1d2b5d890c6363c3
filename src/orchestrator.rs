// Job orchestrator - partition, fan out, aggregate
//
// A run is reported successful only if every partition committed. Partitions
// that committed stay committed when a sibling fails; nothing is retried or
// rolled back here.

use crate::config::BatchConfig;
use crate::db::{insert_event, Event, Store};
use crate::error::{BatchError, Result};
use crate::partition::partition_range;
use crate::pool::{PartitionOutcome, WorkerPool};
use crate::run_lock::{acquire_run_lock, finish_run, release_run_lock, RunStatus};
use crate::unit_of_work::{execute_partition, PartitionCounts};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use std::time::Duration;

pub const EVENT_ACTOR: &str = "balance_orchestrator";
pub const EVENT_ENTITY: &str = "balance_run";

// ============================================================================
// RUN CONTEXT & REPORT
// ============================================================================

/// Identifies one invocation of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunContext {
    /// yyyyMMddHHmmss plus a random suffix
    pub run_id: String,
    pub balance_date: NaiveDate,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(balance_date: NaiveDate) -> Self {
        let started_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();

        Self {
            run_id: format!("{}-{}", started_at.format("%Y%m%d%H%M%S"), &suffix[..8]),
            balance_date,
            started_at,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub context: RunContext,
    pub outcomes: Vec<PartitionOutcome<PartitionCounts>>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_success())
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }

    /// Row counts summed over committed partitions
    pub fn totals(&self) -> PartitionCounts {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .fold(PartitionCounts::default(), |acc, counts| acc.merge(*counts))
    }

    /// Surface a partially failed run as an error
    pub fn into_result(self) -> Result<RunReport> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BatchError::RunFailed {
                run_id: self.context.run_id.clone(),
                failed: self.failed_count(),
                total: self.outcomes.len(),
            })
        }
    }
}

/// Seam between the scheduler and whatever it fires
#[async_trait]
pub trait BalanceJob: Send + Sync {
    async fn run(&self, balance_date: NaiveDate) -> Result<RunReport>;
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub partition_count: usize,
    pub min_key: i64,
    pub max_key: i64,
    pub workers: usize,
    pub unit_timeout: Option<Duration>,
}

impl From<&BatchConfig> for OrchestratorSettings {
    fn from(config: &BatchConfig) -> Self {
        Self {
            partition_count: config.partitioning.partition_count,
            min_key: config.partitioning.min_key,
            max_key: config.partitioning.max_key,
            workers: config.partitioning.worker_count(),
            unit_timeout: config.execution.unit_timeout(),
        }
    }
}

pub struct JobOrchestrator {
    store: Store,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    /// Validates the partition layout up front so bad settings never reach a run
    pub fn new(store: Store, settings: OrchestratorSettings) -> Result<Self> {
        partition_range(settings.min_key, settings.max_key, settings.partition_count)?;

        if settings.workers == 0 {
            return Err(BatchError::Config("worker count must be at least 1".to_string()));
        }
        if (store.max_connections() as usize) < settings.workers {
            return Err(BatchError::Config(format!(
                "connection pool ({}) is smaller than the worker pool ({})",
                store.max_connections(),
                settings.workers
            )));
        }

        Ok(Self { store, settings })
    }

    pub fn from_config(store: Store, config: &BatchConfig) -> Result<Self> {
        Self::new(store, OrchestratorSettings::from(config))
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Execute one run for `balance_date`
    pub async fn run(&self, balance_date: NaiveDate) -> Result<RunReport> {
        let context = RunContext::new(balance_date);
        let partitions = partition_range(
            self.settings.min_key,
            self.settings.max_key,
            self.settings.partition_count,
        )?;

        {
            let ctx = context.clone();
            let partition_count = partitions.len();
            self.store
                .call(move |conn| {
                    acquire_run_lock(conn, ctx.balance_date, &ctx.run_id, ctx.started_at)?;
                    insert_event(
                        conn,
                        &Event::new(
                            "run_started",
                            EVENT_ENTITY,
                            &ctx.run_id,
                            serde_json::json!({
                                "balance_date": ctx.balance_date,
                                "partitions": partition_count,
                            }),
                            EVENT_ACTOR,
                        ),
                    )
                })
                .await?;
        }

        // Pool is scoped to this run and joined before the report is built
        let pool = WorkerPool::new(self.settings.workers);

        tracing::info!(
            run_id = %context.run_id,
            %balance_date,
            partitions = partitions.len(),
            workers = pool.workers(),
            "Balance run started"
        );

        let outcomes = {
            let store = self.store.clone();
            let timeout = self.settings.unit_timeout;

            pool.execute(partitions, move |partition| {
                let mut conn = store.conn()?;
                execute_partition(&mut conn, &partition, balance_date, timeout)
            })
            .await
        };

        let report = RunReport {
            context,
            outcomes,
            finished_at: Utc::now(),
        };

        // An unrecorded outcome must not leave the date locked as RUNNING
        if let Err(e) = self.record_outcome(&report).await {
            tracing::error!(
                run_id = %report.context.run_id,
                %balance_date,
                error = %e,
                "Failed to record run outcome; releasing run lock"
            );
            if let Err(e) = self
                .store
                .call(move |conn| release_run_lock(conn, balance_date))
                .await
            {
                tracing::error!(
                    %balance_date,
                    error = %e,
                    "Run lock could not be released; clear it with `unlock`"
                );
            }
        }

        let totals = report.totals();
        if report.is_success() {
            tracing::info!(
                run_id = %report.context.run_id,
                %balance_date,
                daily_records_upserted = totals.daily_records_upserted,
                balances_updated = totals.balances_updated,
                "Balance run completed"
            );
        } else {
            tracing::error!(
                run_id = %report.context.run_id,
                %balance_date,
                failed = report.failed_count(),
                total = report.outcomes.len(),
                "Balance run failed"
            );
        }

        Ok(report)
    }

    async fn record_outcome(&self, report: &RunReport) -> Result<()> {
        let ctx = report.context.clone();
        let total = report.outcomes.len();
        let failed = report.failed_count();
        let totals = report.totals();
        let status = if failed == 0 { RunStatus::Completed } else { RunStatus::Failed };

        let failures: Vec<serde_json::Value> = report
            .outcomes
            .iter()
            .filter_map(|o| {
                o.result.as_ref().err().map(|e| {
                    serde_json::json!({
                        "partition": o.partition.index,
                        "min_key": o.partition.min_key,
                        "max_key": o.partition.max_key,
                        "error": e.to_string(),
                    })
                })
            })
            .collect();

        self.store
            .call(move |conn| {
                // Status and events land together or not at all
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                for failure in failures {
                    insert_event(
                        &tx,
                        &Event::new("partition_failed", EVENT_ENTITY, &ctx.run_id, failure, EVENT_ACTOR),
                    )?;
                }

                finish_run(&tx, ctx.balance_date, &ctx.run_id, status, total, failed)?;

                let event_type = match status {
                    RunStatus::Completed => "run_completed",
                    _ => "run_failed",
                };
                insert_event(
                    &tx,
                    &Event::new(
                        event_type,
                        EVENT_ENTITY,
                        &ctx.run_id,
                        serde_json::json!({
                            "balance_date": ctx.balance_date,
                            "partitions_total": total,
                            "partitions_failed": failed,
                            "daily_records_upserted": totals.daily_records_upserted,
                            "balances_updated": totals.balances_updated,
                        }),
                        EVENT_ACTOR,
                    ),
                )?;

                tx.commit()?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl BalanceJob for JobOrchestrator {
    async fn run(&self, balance_date: NaiveDate) -> Result<RunReport> {
        JobOrchestrator::run(self, balance_date).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_account, get_daily_balance, get_events_for_entity, insert_transaction, Transaction};
    use crate::run_lock::get_run;
    use crate::test_support::{date, seed_accounts, temp_store};
    use std::sync::Arc;

    fn settings(partition_count: usize, max_key: i64) -> OrchestratorSettings {
        OrchestratorSettings {
            partition_count,
            min_key: 1,
            max_key,
            workers: partition_count,
            unit_timeout: None,
        }
    }

    /// 20 accounts with 1_000 each; account n gets +n*10 and -n on `d`
    fn seed_ledger(store: &Store, d: NaiveDate) {
        let conn = store.conn().unwrap();
        let accounts: Vec<(i64, i64)> = (1..=20).map(|id| (id, 1_000)).collect();
        seed_accounts(&conn, &accounts);
        for id in 1..=20 {
            insert_transaction(&conn, &Transaction::validated(id, id * 10, d)).unwrap();
            insert_transaction(&conn, &Transaction::validated(id, -id, d)).unwrap();
        }
    }

    #[test]
    fn test_run_context_ids_are_distinct() {
        let d = date(2024, 5, 1);
        let a = RunContext::new(d);
        let b = RunContext::new(d);

        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.run_id.len(), 14 + 1 + 8);
        assert!(a.run_id[..14].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_new_rejects_bad_settings() {
        let (_dir, store) = temp_store(2);

        let inverted = OrchestratorSettings { min_key: 10, max_key: 1, ..settings(2, 10) };
        assert!(matches!(JobOrchestrator::new(store.clone(), inverted), Err(BatchError::Config(_))));

        let zero = settings(0, 10);
        assert!(matches!(JobOrchestrator::new(store.clone(), zero), Err(BatchError::Config(_))));

        // 4 workers cannot share 2 connections
        assert!(matches!(JobOrchestrator::new(store, settings(4, 10)), Err(BatchError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_run_updates_every_partition() {
        let (_dir, store) = temp_store(4);
        let d = date(2024, 5, 1);
        seed_ledger(&store, d);

        let orchestrator = JobOrchestrator::new(store.clone(), settings(4, 20)).unwrap();
        let report = orchestrator.run(d).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.totals().daily_records_upserted, 20);
        assert_eq!(report.totals().balances_updated, 20);

        let conn = store.conn().unwrap();
        for id in 1..=20 {
            assert_eq!(get_account(&conn, id).unwrap().unwrap().balance, 1_000 + id * 9);
        }

        let run = get_run(&conn, d).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.run_id, report.context.run_id);

        let events = get_events_for_entity(&conn, EVENT_ENTITY, &report.context.run_id).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["run_started", "run_completed"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_partition_failure_is_isolated() {
        let (_dir, store) = temp_store(4);
        let d = date(2024, 5, 1);
        seed_ledger(&store, d);

        // account 7 lives in partition1 [5-8]
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_account_7 BEFORE UPDATE OF balance ON accounts
                 WHEN NEW.id = 7
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let orchestrator = JobOrchestrator::new(store.clone(), settings(4, 20)).unwrap();
        let report = orchestrator.run(d).await.unwrap();

        assert!(!report.is_success());
        assert_eq!(report.failed_count(), 1);
        assert!(!report.outcomes[1].is_success());
        assert_eq!(report.totals().daily_records_upserted, 16);

        let conn = store.conn().unwrap();
        for id in 1..=20 {
            let balance = get_account(&conn, id).unwrap().unwrap().balance;
            if (5..=8).contains(&id) {
                assert_eq!(balance, 1_000, "failed partition must roll back account {id}");
                assert!(get_daily_balance(&conn, id, d).unwrap().is_none());
            } else {
                assert_eq!(balance, 1_000 + id * 9, "account {id} should be committed");
            }
        }

        assert_eq!(get_run(&conn, d).unwrap().unwrap().status, RunStatus::Failed);
        let events = get_events_for_entity(&conn, EVENT_ENTITY, &report.context.run_id).unwrap();
        assert!(events.iter().any(|e| e.event_type == "partition_failed" && e.data["partition"] == 1));

        let run_id = report.context.run_id.clone();
        match report.into_result() {
            Err(BatchError::RunFailed { run_id: id, failed: 1, total: 4 }) => assert_eq!(id, run_id),
            other => panic!("expected RunFailed, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_after_failure_applies_each_total_once() {
        let (_dir, store) = temp_store(4);
        let d = date(2024, 5, 1);
        seed_ledger(&store, d);

        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_account_18 BEFORE UPDATE OF balance ON accounts
                 WHEN NEW.id = 18
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let orchestrator = JobOrchestrator::new(store.clone(), settings(4, 20)).unwrap();
        assert!(!orchestrator.run(d).await.unwrap().is_success());

        store.conn().unwrap().execute_batch("DROP TRIGGER fail_account_18").unwrap();

        let retry = orchestrator.run(d).await.unwrap();
        assert!(retry.is_success());
        // only the previously failed partition [13-20] had anything left to apply
        assert_eq!(retry.totals().balances_updated, 8);

        let conn = store.conn().unwrap();
        for id in 1..=20 {
            assert_eq!(get_account(&conn, id).unwrap().unwrap().balance, 1_000 + id * 9);
        }

        assert!(matches!(orchestrator.run(d).await, Err(BatchError::AlreadyCommitted(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_runs_apply_once() {
        let (_dir, store) = temp_store(8);
        let d = date(2024, 5, 1);
        seed_ledger(&store, d);

        let orchestrator = Arc::new(JobOrchestrator::new(store.clone(), settings(4, 20)).unwrap());

        let (a, b) = tokio::join!(
            {
                let o = Arc::clone(&orchestrator);
                async move { o.run(d).await }
            },
            {
                let o = Arc::clone(&orchestrator);
                async move { o.run(d).await }
            }
        );

        let results = [a, b];
        let successes = results.iter().filter(|r| matches!(r, Ok(report) if report.is_success())).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(BatchError::RunInProgress(_)) | Err(BatchError::AlreadyCommitted(_))))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(rejected, 1);

        let conn = store.conn().unwrap();
        assert_eq!(get_account(&conn, 3).unwrap().unwrap().balance, 1_000 + 27);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unrecorded_outcome_does_not_leave_date_locked() {
        let (_dir, store) = temp_store(5);
        let d = date(2024, 5, 1);
        seed_ledger(&store, d);

        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_finish BEFORE UPDATE ON balance_runs
                 BEGIN SELECT RAISE(ABORT, 'transient'); END;",
            )
            .unwrap();

        let orchestrator = JobOrchestrator::new(store.clone(), settings(4, 20)).unwrap();
        let report = orchestrator.run(d).await.unwrap();
        assert!(report.is_success());

        let conn = store.conn().unwrap();
        assert!(get_run(&conn, d).unwrap().is_none(), "lock should have been released");
        let events = get_events_for_entity(&conn, EVENT_ENTITY, &report.context.run_id).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["run_started"]);

        conn.execute_batch("DROP TRIGGER fail_finish").unwrap();

        // the retry reclaims the date and applies nothing twice
        let retry = orchestrator.run(d).await.unwrap();
        assert!(retry.is_success());
        assert_eq!(retry.totals().balances_updated, 0);
        assert_eq!(get_run(&conn, d).unwrap().unwrap().status, RunStatus::Completed);
        for id in 1..=20 {
            assert_eq!(get_account(&conn, id).unwrap().unwrap().balance, 1_000 + id * 9);
        }
    }

    #[tokio::test]
    async fn test_run_with_no_movement_succeeds() {
        let (_dir, store) = temp_store(2);
        seed_accounts(&store.conn().unwrap(), &[(1, 50)]);

        let orchestrator = JobOrchestrator::new(store.clone(), settings(2, 10)).unwrap();
        let report = BalanceJob::run(&orchestrator, date(2024, 5, 1)).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.totals(), PartitionCounts::default());
        assert_eq!(get_account(&store.conn().unwrap(), 1).unwrap().unwrap().balance, 50);
    }
}
