//! Runner - periodic driver for queued and running requests
//!
//! Each tick drains a batch of queued records into execution, then converges
//! running records by polling adapters for async task status. Ticks are
//! non-reentrant; a `busy` flag drops overlapping invocations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use dirigent_core::engine::Engine;
use dirigent_core::fingerprint::value_fingerprint;
use dirigent_core::locks::RecordLocks;
use dirigent_core::store::{RecordPatch, RequestStore, StoreError};
use dirigent_core::telemetry::Metrics;
use dirigent_core::types::{
    RequestRecord, RequestStatus, TaskResult, TaskStatus,
};

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Tick period
    pub period: Duration,
    /// Max queued records drained per tick
    pub drain_batch: usize,
    /// Max running records converged per tick
    pub converge_batch: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            drain_batch: 5,
            converge_batch: 50,
        }
    }
}

/// Runner - drains queued requests and converges running ones
pub struct Runner {
    engine: Arc<Engine>,
    store: Arc<dyn RequestStore>,
    locks: Arc<RecordLocks>,
    metrics: Arc<Metrics>,
    config: RunnerConfig,
    busy: AtomicBool,
    wakeup: Notify,
}

impl Runner {
    /// Record locks come from the engine so that every writer for a record
    /// shares one table.
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<dyn RequestStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_config(engine, store, metrics, RunnerConfig::default())
    }

    pub fn with_config(
        engine: Arc<Engine>,
        store: Arc<dyn RequestStore>,
        metrics: Arc<Metrics>,
        config: RunnerConfig,
    ) -> Self {
        let locks = engine.locks();
        Self {
            engine,
            store,
            locks,
            metrics,
            config,
            busy: AtomicBool::new(false),
            wakeup: Notify::new(),
        }
    }

    /// Best-effort wake-up: the next tick starts without waiting the full
    /// period. Callers use this to cut queueing latency after admission or a
    /// callback fold.
    pub fn poke(&self) {
        self.wakeup.notify_one();
    }

    /// Periodic loop; spawn this once per engine instance.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.period) => {}
                _ = self.wakeup.notified() => {}
            }
            self.tick().await;
        }
    }

    /// One tick: drain then converge. A tick already in progress makes this
    /// a no-op.
    pub async fn tick(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            return;
        }
        let started = Instant::now();
        if let Err(err) = self.drain_queued().await {
            tracing::error!(error = %err, "runner drain phase failed");
        }
        if let Err(err) = self.converge_running().await {
            tracing::error!(error = %err, "runner converge phase failed");
        }
        self.metrics.incr("runner_ticks_total");
        self.metrics
            .observe_ms("tick_ms", started.elapsed().as_millis() as u64);
        self.busy.store(false, Ordering::SeqCst);
    }

    async fn drain_queued(&self) -> Result<(), StoreError> {
        let queued = self
            .store
            .list_by_status(&[RequestStatus::Queued], self.config.drain_batch)
            .await?;
        for listed in queued {
            let _guard = self.locks.lock(&listed.request_id).await;
            // re-read under the lock; a callback or another caller may have
            // moved the record since the listing
            let Some(record) = self.store.get(&listed.request_id).await? else {
                continue;
            };
            if record.status != RequestStatus::Queued {
                continue;
            }
            self.start_record(record).await?;
        }
        Ok(())
    }

    async fn start_record(&self, record: RequestRecord) -> Result<(), StoreError> {
        let request_id = record.request_id.clone();
        let Some(plan) = record.plan.clone() else {
            tracing::error!(request_id = %request_id, "queued record has no plan");
            self.store
                .update(
                    &request_id,
                    RecordPatch::new().with_status(RequestStatus::Failed),
                )
                .await?;
            return Ok(());
        };

        let mut seeded: Vec<TaskResult> = Vec::with_capacity(plan.len());
        let existing = record.results.clone().unwrap_or_default();
        for task in &plan.tasks {
            match existing.iter().find(|r| r.task_id == task.id) {
                Some(result) => seeded.push(result.clone()),
                None => seeded.push(TaskResult::queued(&task.id, &task.backend)),
            }
        }
        self.store
            .update(
                &request_id,
                RecordPatch::new()
                    .with_status(RequestStatus::Running)
                    .with_results(seeded.clone()),
            )
            .await?;

        tracing::info!(request_id = %request_id, task_count = plan.len(), "executing queued request");
        match self
            .engine
            .execute_plan(&request_id, &record.envelope, &plan, Some(seeded))
            .await
        {
            Ok(outcome) => {
                self.store
                    .update(
                        &request_id,
                        RecordPatch::new()
                            .with_results(outcome.results)
                            .with_status(outcome.status),
                    )
                    .await?;
            }
            Err(err) => {
                tracing::error!(request_id = %request_id, error = %err, "plan execution failed");
                self.store
                    .update(
                        &request_id,
                        RecordPatch::new().with_status(RequestStatus::Failed),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn converge_running(&self) -> Result<(), StoreError> {
        let running = self
            .store
            .list_by_status(&[RequestStatus::Running], self.config.converge_batch)
            .await?;
        for listed in running {
            let _guard = self.locks.lock(&listed.request_id).await;
            let Some(record) = self.store.get(&listed.request_id).await? else {
                continue;
            };
            if record.status != RequestStatus::Running {
                continue;
            }
            if let Err(err) = self.converge_record(record).await {
                tracing::error!(
                    request_id = %listed.request_id,
                    error = %err,
                    "convergence failed for record"
                );
            }
        }
        Ok(())
    }

    async fn converge_record(&self, record: RequestRecord) -> Result<(), StoreError> {
        let request_id = record.request_id.clone();
        let (Some(plan), Some(mut results)) = (record.plan.clone(), record.results.clone())
        else {
            return Ok(());
        };
        let before = value_fingerprint(
            &serde_json::to_value(&results).map_err(|e| StoreError::Serialization(e.to_string()))?,
        );

        for result in results.iter_mut() {
            if !matches!(result.status, TaskStatus::Running | TaskStatus::Queued) {
                continue;
            }
            let Some(external_id) = result.external_id.clone() else {
                continue;
            };
            let Some(task) = plan.task(&result.task_id) else {
                continue;
            };
            let Some(adapter) = self.engine.registry().adapter(&task.backend) else {
                continue;
            };
            let ctx = self.engine.adapter_context(&request_id, task).await;
            match adapter.check_status(&external_id, &ctx).await {
                Ok(update) => fold_poll_update(result, update),
                Err(err) => {
                    // transient: leave the task untouched and retry next tick
                    self.metrics.incr("poll_failures_total");
                    tracing::warn!(
                        request_id = %request_id,
                        task_id = %result.task_id,
                        external_id = %external_id,
                        error = %err,
                        "status poll failed; will retry"
                    );
                }
            }
        }

        // start any tasks the converged results unblocked
        let outcome = match self
            .engine
            .execute_plan(&request_id, &record.envelope, &plan, Some(results))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(request_id = %request_id, error = %err, "re-execution failed");
                return Ok(());
            }
        };

        let after = value_fingerprint(
            &serde_json::to_value(&outcome.results)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        );
        // commit only on an observable change to avoid write amplification
        if after != before || outcome.status != record.status {
            self.store
                .update(
                    &request_id,
                    RecordPatch::new()
                        .with_results(outcome.results)
                        .with_status(outcome.status),
                )
                .await?;
        }
        Ok(())
    }
}

/// Fold a poll response into a task result. Terminal results are never
/// reopened.
fn fold_poll_update(result: &mut TaskResult, update: dirigent_core::adapter::AdapterResult) {
    if result.status.is_terminal() {
        return;
    }
    result.status = update.status;
    if update.output.is_some() {
        result.output = update.output;
    }
    if update.error.is_some() {
        result.error = update.error;
    }
    if result.status.is_terminal() && result.finished_at.is_none() {
        result.finished_at = Some(chrono::Utc::now());
    }
}
