//! Jobs: script executions that stay alive and accept attached callbacks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use async_trait::async_trait;

use super::JobId;
use crate::driver::CallOutcome;
use crate::script::EngineError;
use crate::script::FunctionCall;

/// A running script execution that callbacks can be attached to.
///
/// Attached callbacks run inside the job's execution context, so they see
/// the in-memory state the script built up before it started waiting.
#[async_trait]
pub trait LiveJob: Send + Sync {
    fn id(&self) -> JobId;

    fn program_id(&self) -> &str;

    async fn spawn_callback(&self, call: FunctionCall) -> Result<CallOutcome, EngineError>;
}

/// Jobs currently alive, keyed by id.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<JobId, Arc<dyn LiveJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: Arc<dyn LiveJob>) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id(), job);
    }

    pub fn remove(&self, id: JobId) -> Option<Arc<dyn LiveJob>> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn get(&self, id: JobId) -> Option<Arc<dyn LiveJob>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// The oldest live job of `program_id`.
    pub fn find_by_program(&self, program_id: &str) -> Option<Arc<dyn LiveJob>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|job| job.program_id() == program_id)
            .cloned()
    }
}
