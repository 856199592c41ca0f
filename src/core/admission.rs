//! Per-pipeline concurrency limits.
//!
//! Each pipeline gets its own active-run counter and its own admission
//! gate, so triggers for unrelated pipelines never wait on each other.
//! The check, the run-creation transaction and the increment happen under
//! the pipeline's gate; a rejected trigger leaves the counter untouched.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{OrchestratorError, Pipeline};

#[derive(Debug, Default)]
struct PipelineSlots {
    active: AtomicUsize,
    gate: tokio::sync::Mutex<()>,
}

/// Admission control for run triggers
#[derive(Debug, Default)]
pub struct RunAdmission {
    pipelines: Mutex<HashMap<Uuid, Arc<PipelineSlots>>>,
}

impl RunAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, pipeline_id: Uuid) -> Arc<PipelineSlots> {
        // The map only holds Arcs; a poisoned guard is still consistent
        let mut pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        pipelines.entry(pipeline_id).or_default().clone()
    }

    /// Number of admitted runs that have not reached a terminal status
    pub fn active_runs(&self, pipeline_id: Uuid) -> usize {
        let pipelines = self.pipelines.lock().unwrap_or_else(PoisonError::into_inner);
        pipelines
            .get(&pipeline_id)
            .map(|slots| slots.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Admit a trigger and run its creation transaction.
    ///
    /// `create` runs only when the pipeline is below its concurrency limit.
    /// The counter is incremented only if `create` succeeds; the returned
    /// [`AdmissionSlot`] gives the increment back when released or dropped.
    pub async fn admit<F, Fut, T>(
        &self,
        pipeline: &Pipeline,
        create: F,
    ) -> Result<(T, AdmissionSlot), OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let slots = self.slots(pipeline.id);
        let _gate = slots.gate.lock().await;

        let active = slots.active.load(Ordering::Acquire);
        let limit = pipeline.concurrency_limit.max(1) as usize;
        if active >= limit {
            warn!(
                pipeline = %pipeline.name,
                active,
                limit,
                "Trigger rejected by concurrency limit"
            );
            return Err(OrchestratorError::conflict(format!(
                "pipeline {} has reached its concurrency limit ({} active runs)",
                pipeline.name, active
            )));
        }

        let created = create().await?;
        slots.active.fetch_add(1, Ordering::AcqRel);
        debug!(pipeline = %pipeline.name, active = active + 1, "Run admitted");

        Ok((
            created,
            AdmissionSlot {
                pipeline_id: pipeline.id,
                slots: Some(slots.clone()),
            },
        ))
    }
}

/// One admitted run counted against its pipeline's limit
#[derive(Debug)]
pub struct AdmissionSlot {
    pipeline_id: Uuid,
    slots: Option<Arc<PipelineSlots>>,
}

impl AdmissionSlot {
    /// Give the slot back. Equivalent to dropping it.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(slots) = self.slots.take() {
            let previous = slots.active.fetch_sub(1, Ordering::AcqRel);
            debug!(pipeline_id = %self.pipeline_id, active = previous - 1, "Admission slot released");
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release_once();
    }
}
