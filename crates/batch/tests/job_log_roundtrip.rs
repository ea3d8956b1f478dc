//! Orchestrator runs recorded through the file-backed job log.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use adflow_batch::{
    read_entries, BatchComputeService, BatchConfig, BatchError, BatchRunState, BatchRunStatus,
    BatchTask, JobLog, JobLogEntry, JobLogStatus, JsonlJobLog, RemoteBatchJobOrchestrator,
};
use adflow_resilience::{CallError, RunBudget};

/// Succeeds every run whose `params.ok` is true, fails the rest on task `load`.
struct ParamDrivenService {
    next_run: AtomicU32,
    outcomes: std::sync::Mutex<std::collections::HashMap<String, bool>>,
}

#[async_trait]
impl BatchComputeService for ParamDrivenService {
    async fn submit(&self, _job_id: &str, params: &Value) -> Result<String, CallError> {
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst).to_string();
        let ok = params["ok"].as_bool().unwrap_or(false);
        self.outcomes.lock().unwrap().insert(run_id.clone(), ok);
        Ok(run_id)
    }

    async fn get_status(&self, run_id: &str) -> Result<BatchRunStatus, CallError> {
        let ok = self.outcomes.lock().unwrap()[run_id];
        Ok(if ok {
            BatchRunStatus { state: BatchRunState::Succeeded, tasks: vec![], message: None }
        } else {
            BatchRunStatus {
                state: BatchRunState::Failed,
                tasks: vec![BatchTask {
                    task_key: "load".into(),
                    task_run_id: format!("{run_id}-1"),
                    state: BatchRunState::Failed,
                }],
                message: None,
            }
        })
    }

    async fn get_task_error(&self, _run_id: &str, _task: &BatchTask) -> Result<String, CallError> {
        Ok("quota exceeded".into())
    }

    async fn cancel(&self, _run_id: &str) -> Result<(), CallError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn every_submission_and_terminal_state_lands_in_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("batch/jobs.jsonl");

    let service = Arc::new(ParamDrivenService {
        next_run: AtomicU32::new(1),
        outcomes: Default::default(),
    });
    let log = Arc::new(JsonlJobLog::new(&log_path));
    let orch = RemoteBatchJobOrchestrator::new(
        BatchConfig::default().with_job_id("77"),
        service,
        log,
    )
    .unwrap();

    let results = orch
        .run_many(
            "daily",
            vec![json!({"ok": true}), json!({"ok": false})],
            &RunBudget::start(Duration::from_secs(600)),
        )
        .await;

    assert!(results[0].is_ok());
    assert!(matches!(
        &results[1],
        Err(BatchError::JobFailed { message, .. }) if message == "load: quota exceeded"
    ));

    let entries = read_entries(&log_path).unwrap();
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e.job_id == "77"));

    let for_corr = |corr: &str| -> Vec<JobLogStatus> {
        entries
            .iter()
            .filter(|e| e.correlation_id == corr)
            .map(|e| e.status)
            .collect()
    };
    assert_eq!(for_corr("daily-0"), vec![JobLogStatus::Submitted, JobLogStatus::Succeeded]);
    assert_eq!(for_corr("daily-1"), vec![JobLogStatus::Submitted, JobLogStatus::Failed]);

    let failed = entries
        .iter()
        .find(|e| e.status == JobLogStatus::Failed)
        .unwrap();
    assert_eq!(failed.parameters, json!({"ok": false}));
    assert_eq!(failed.error.as_deref(), Some("load: quota exceeded"));
}

#[tokio::test(start_paused = true)]
async fn restarted_orchestrator_adopts_the_logged_run() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("jobs.jsonl");

    // A previous process submitted run 41 and gave up waiting for it.
    let earlier = JsonlJobLog::new(&log_path);
    earlier.record(
        &JobLogEntry::new("77", "item-9", JobLogStatus::Submitted, json!({"ok": true}))
            .with_run_id("41"),
    );
    earlier.record(
        &JobLogEntry::new("77", "item-9", JobLogStatus::DeadlineExceeded, json!({"ok": true}))
            .with_run_id("41"),
    );

    let service = Arc::new(ParamDrivenService {
        next_run: AtomicU32::new(1),
        outcomes: Default::default(),
    });
    service.outcomes.lock().unwrap().insert("41".into(), true);
    let orch = RemoteBatchJobOrchestrator::new(
        BatchConfig::default().with_job_id("77"),
        service.clone(),
        Arc::new(JsonlJobLog::new(&log_path)),
    )
    .unwrap();

    let outcome = orch
        .run("item-9", json!({"ok": true}), &RunBudget::start(Duration::from_secs(600)))
        .await
        .unwrap();

    assert_eq!(outcome.run_id, "41");
    assert_eq!(service.next_run.load(Ordering::SeqCst), 1, "nothing was submitted");
    let last = read_entries(&log_path).unwrap().pop().unwrap();
    assert_eq!(last.status, JobLogStatus::Succeeded);
}
