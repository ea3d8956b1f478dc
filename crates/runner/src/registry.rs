//! Maps a definition's `kind` to the executor that runs it.
//!
//! Executors are built once at startup, so a definition naming an unknown
//! kind fails before anything is claimed.

use std::collections::HashMap;
use std::sync::Arc;

use adflow_batch::RemoteBatchJobOrchestrator;

use crate::definition::JobDefinition;
use crate::error::RunnerError;
use crate::executor::{BatchComputeExecutor, ItemExecutor};
use crate::lifecycle::{ReportJob, ReportLifecycle};

type ExecutorFactory =
    Box<dyn Fn(&JobDefinition) -> anyhow::Result<Arc<dyn ItemExecutor>> + Send + Sync>;

/// A definition paired with its executor.
#[derive(Clone)]
pub struct ResolvedJob {
    pub definition: Arc<JobDefinition>,
    pub executor: Arc<dyn ItemExecutor>,
}

#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: &str, factory: F) -> Result<(), RunnerError>
    where
        F: Fn(&JobDefinition) -> anyhow::Result<Arc<dyn ItemExecutor>> + Send + Sync + 'static,
    {
        if self.factories.contains_key(kind) {
            return Err(RunnerError::InvalidDefinition(format!(
                "executor kind '{kind}' registered twice"
            )));
        }
        self.factories.insert(kind.to_string(), Box::new(factory));
        Ok(())
    }

    /// Register a [`ReportJob`] driven through the submit/poll/download lifecycle.
    pub fn register_report_job(
        &mut self,
        kind: &str,
        job: Arc<dyn ReportJob>,
    ) -> Result<(), RunnerError> {
        self.register(kind, move |_| {
            Ok(Arc::new(ReportLifecycle::new(job.clone())) as Arc<dyn ItemExecutor>)
        })
    }

    /// Register the remote batch compute executor under `batch`.
    pub fn register_batch(
        &mut self,
        orchestrator: Arc<RemoteBatchJobOrchestrator>,
    ) -> Result<(), RunnerError> {
        self.register("batch", move |_| {
            Ok(Arc::new(BatchComputeExecutor::new(orchestrator.clone())) as Arc<dyn ItemExecutor>)
        })
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn resolve(&self, definition: &JobDefinition) -> Result<ResolvedJob, RunnerError> {
        let factory = self
            .factories
            .get(&definition.kind)
            .ok_or_else(|| RunnerError::UnknownKind(definition.kind.clone()))?;
        let executor = factory(definition)
            .map_err(|e| {
                RunnerError::Other(format!("building executor for '{}': {e:#}", definition.name))
            })?;
        Ok(ResolvedJob {
            definition: Arc::new(definition.clone()),
            executor,
        })
    }

    /// Resolve every enabled definition.
    pub fn resolve_all(
        &self,
        definitions: &[JobDefinition],
    ) -> Result<Vec<ResolvedJob>, RunnerError> {
        definitions
            .iter()
            .filter(|d| d.enabled)
            .map(|d| self.resolve(d))
            .collect()
    }
}
