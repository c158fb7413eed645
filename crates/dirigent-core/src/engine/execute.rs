//! DAG execution
//!
//! Single-threaded cooperative scheduling: tasks are dispatched sequentially
//! in topological order, the runnable set is recomputed after each round, and
//! cancellation propagates transitively from failed dependencies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::adapter::{AdapterError, AdapterResult};
use crate::types::{
    AuditEvent, AuditStage, Envelope, ExecutionPlan, ExecutionTask, RequestStatus, TaskError,
    TaskResult, TaskStatus,
};

use super::{rollup_with, Engine, EngineError};

/// Result of one `execute_plan` pass.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// One result per plan task, in topological order
    pub results: Vec<TaskResult>,
    pub status: RequestStatus,
}

impl Engine {
    /// Execute a plan, resuming from `existing` results when present.
    ///
    /// Tasks whose dependencies are not all succeeded stay queued; async
    /// tasks left running converge later through polling or callbacks, after
    /// which re-invoking this method starts the newly unblocked tasks.
    pub async fn execute_plan(
        &self,
        request_id: &str,
        envelope: &Envelope,
        plan: &ExecutionPlan,
        existing: Option<Vec<TaskResult>>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let order = topological_order(plan)?;
        let started = Instant::now();

        let mut results: HashMap<String, TaskResult> = HashMap::new();
        if let Some(existing) = existing {
            for result in existing {
                if plan.task(&result.task_id).is_some() {
                    results.insert(result.task_id.clone(), result);
                } else {
                    self.audit_log(
                        AuditEvent::warn(
                            request_id,
                            AuditStage::Execute,
                            "dropping result for task not in plan",
                        )
                        .with_data(json!({"task_id": result.task_id})),
                    )
                    .await;
                }
            }
        }
        for task in &plan.tasks {
            results
                .entry(task.id.clone())
                .or_insert_with(|| TaskResult::queued(&task.id, &task.backend));
        }

        loop {
            self.sweep_cancellations(request_id, plan, &mut results).await;

            let runnable: Vec<String> = order
                .iter()
                .filter(|id| is_runnable(plan, &results, id))
                .cloned()
                .collect();
            if runnable.is_empty() {
                break;
            }

            for task_id in runnable {
                let Some(task) = plan.task(&task_id) else {
                    continue;
                };
                let result = self.run_task(request_id, task).await;
                results.insert(task_id, result);

                // A failed roll-up ends this round only: the sweep at the top
                // of the next round cancels queued dependents, and independent
                // tasks still get scheduled.
                if rollup_with(plan, |id| results.get(id).map(|r| r.status))
                    == RequestStatus::Failed
                {
                    break;
                }
            }
        }

        let ordered: Vec<TaskResult> = order.iter().filter_map(|id| results.remove(id)).collect();
        let status = super::rollup(plan, &ordered);
        self.metrics
            .observe_ms("execute_plan_ms", started.elapsed().as_millis() as u64);
        tracing::info!(
            request_id = %request_id,
            kind = %envelope.kind,
            status = status.as_str(),
            task_count = ordered.len(),
            "plan execution pass finished"
        );
        Ok(ExecutionOutcome {
            results: ordered,
            status,
        })
    }

    async fn run_task(&self, request_id: &str, task: &ExecutionTask) -> TaskResult {
        let Some(adapter) = self.registry.adapter(&task.backend) else {
            let message = format!("no adapter registered for backend '{}'", task.backend);
            self.metrics.incr("tasks_failed_total");
            self.audit_log(
                AuditEvent::error(request_id, AuditStage::Execute, &message)
                    .with_data(json!({"task_id": &task.id})),
            )
            .await;
            let now = Utc::now();
            let mut result = TaskResult::queued(&task.id, &task.backend);
            result.status = TaskStatus::Failed;
            result.error = Some(TaskError::new(message));
            result.started_at = Some(now);
            result.finished_at = Some(now);
            return result;
        };

        let ctx = self.adapter_context(request_id, task).await;
        self.audit_log(
            AuditEvent::info(request_id, AuditStage::Execute, "task started").with_data(json!({
                "task_id": &task.id,
                "backend": &task.backend,
                "action": &task.action,
            })),
        )
        .await;

        let started_at = Utc::now();
        let outcome = adapter.execute(task, &ctx).await;
        let result = normalize_result(task, outcome, started_at);

        match result.status {
            TaskStatus::Succeeded => {
                self.metrics.incr("tasks_executed_total");
                self.audit_log(
                    AuditEvent::info(request_id, AuditStage::Execute, "task succeeded")
                        .with_data(json!({"task_id": &task.id})),
                )
                .await;
            }
            TaskStatus::Running | TaskStatus::Queued => {
                self.audit_log(
                    AuditEvent::info(request_id, AuditStage::Execute, "task accepted as async job")
                        .with_data(json!({
                            "task_id": &task.id,
                            "external_id": &result.external_id,
                        })),
                )
                .await;
            }
            TaskStatus::Failed | TaskStatus::Canceled => {
                self.metrics.incr("tasks_failed_total");
                let message = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "task failed".to_string());
                self.audit_log(
                    AuditEvent::error(request_id, AuditStage::Execute, message)
                        .with_data(json!({"task_id": &task.id})),
                )
                .await;
            }
        }

        result
    }

    /// Cancel queued tasks whose dependencies failed or were canceled.
    ///
    /// Repeats until a fixpoint so cancellation propagates transitively.
    async fn sweep_cancellations(
        &self,
        request_id: &str,
        plan: &ExecutionPlan,
        results: &mut HashMap<String, TaskResult>,
    ) {
        loop {
            let mut to_cancel: Vec<(String, String)> = Vec::new();
            for task in &plan.tasks {
                let Some(result) = results.get(&task.id) else {
                    continue;
                };
                if result.status != TaskStatus::Queued {
                    continue;
                }
                let blocked_by = task.depends_on.iter().find(|dep| {
                    results
                        .get(*dep)
                        .map(|r| matches!(r.status, TaskStatus::Failed | TaskStatus::Canceled))
                        .unwrap_or(false)
                });
                if let Some(dep) = blocked_by {
                    to_cancel.push((task.id.clone(), dep.clone()));
                }
            }
            if to_cancel.is_empty() {
                break;
            }
            for (task_id, dep) in to_cancel {
                let message = format!("canceled due to failed dependency {dep}");
                if let Some(result) = results.get_mut(&task_id) {
                    result.cancel(&message);
                }
                self.metrics.incr("tasks_canceled_total");
                tracing::warn!(
                    request_id = %request_id,
                    task_id = %task_id,
                    dependency = %dep,
                    "task canceled"
                );
                self.audit_log(
                    AuditEvent::warn(request_id, AuditStage::Execute, message)
                        .with_data(json!({"task_id": task_id, "dependency": dep})),
                )
                .await;
            }
        }
    }
}

fn is_runnable(plan: &ExecutionPlan, results: &HashMap<String, TaskResult>, id: &str) -> bool {
    let Some(task) = plan.task(id) else {
        return false;
    };
    let Some(result) = results.get(id) else {
        return false;
    };
    result.status == TaskStatus::Queued
        && result.started_at.is_none()
        && task.depends_on.iter().all(|dep| {
            results
                .get(dep)
                .map(|r| r.status == TaskStatus::Succeeded)
                .unwrap_or(false)
        })
}

fn normalize_result(
    task: &ExecutionTask,
    outcome: Result<AdapterResult, AdapterError>,
    started_at: DateTime<Utc>,
) -> TaskResult {
    let mut result = TaskResult::queued(&task.id, &task.backend);
    result.started_at = Some(started_at);
    match outcome {
        Ok(adapter_result) => {
            result.status = adapter_result.status;
            result.external_id = adapter_result.external_id;
            result.output = adapter_result.output;
            result.error = adapter_result.error;
        }
        Err(err) => {
            result.status = TaskStatus::Failed;
            result.error = Some(TaskError::new(err.to_string()));
        }
    }
    if result.status.is_terminal() {
        result.finished_at = Some(Utc::now());
    }
    result
}

/// Order plan tasks so every task follows its dependencies.
///
/// Ties break by plan order, which keeps execution deterministic.
pub(crate) fn topological_order(plan: &ExecutionPlan) -> Result<Vec<String>, EngineError> {
    let mut ids: HashSet<&str> = HashSet::with_capacity(plan.tasks.len());
    for task in &plan.tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(EngineError::InvalidPlan(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
    }

    let mut indegree: HashMap<&str, usize> = HashMap::with_capacity(plan.tasks.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::InvalidPlan(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
        indegree.insert(task.id.as_str(), task.depends_on.len());
    }

    let mut ready: VecDeque<&str> = plan
        .tasks
        .iter()
        .filter(|t| t.depends_on.is_empty())
        .map(|t| t.id.as_str())
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(plan.tasks.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for &dependent in next {
                let entry = indegree.get_mut(dependent).expect("dependent is a task");
                *entry -= 1;
                if *entry == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    if order.len() != plan.tasks.len() {
        return Err(EngineError::InvalidPlan(
            "dependency cycle detected".to_string(),
        ));
    }
    Ok(order)
}
