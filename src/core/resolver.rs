//! Dependency resolution for a pipeline's job set.
//!
//! Validates the `depends_on` graph and groups jobs into layers: layer 0
//! holds jobs without dependencies, layer k holds jobs whose dependencies
//! all live in earlier layers. Pure function of the job set.

use std::collections::HashMap;

use crate::domain::{OrchestratorError, PipelineJob};

/// Layered execution order for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    layers: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Layers in dispatch order; each layer sorted by (`job_order`, name)
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Layer index of a job
    pub fn layer_of(&self, job_name: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|name| name == job_name))
    }

    /// All job names in deterministic plan order
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done(usize),
}

/// Validate the job DAG and compute its layers
pub fn resolve_execution_order(jobs: &[PipelineJob]) -> Result<ExecutionPlan, OrchestratorError> {
    if jobs.is_empty() {
        return Ok(ExecutionPlan::default());
    }

    // Stable iteration order so error messages and layers are deterministic
    let mut ordered: Vec<&PipelineJob> = jobs.iter().collect();
    ordered.sort_by(|a, b| a.job_order.cmp(&b.job_order).then_with(|| a.name.cmp(&b.name)));

    let mut by_name: HashMap<&str, &PipelineJob> = HashMap::with_capacity(jobs.len());
    for job in ordered.iter().copied() {
        if by_name.insert(job.name.as_str(), job).is_some() {
            return Err(OrchestratorError::validation(format!(
                "duplicate job name '{}'",
                job.name
            )));
        }
    }

    for job in ordered.iter().copied() {
        for dep in &job.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(OrchestratorError::validation(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.name, dep
                )));
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(jobs.len());
    for job in ordered.iter().copied() {
        assign_layers(job.name.as_str(), &by_name, &mut marks)?;
    }

    let depth = marks
        .values()
        .filter_map(|m| match m {
            Mark::Done(d) => Some(*d),
            Mark::Visiting => None,
        })
        .max()
        .unwrap_or(0);

    let mut layers: Vec<Vec<String>> = vec![Vec::new(); depth + 1];
    for job in ordered.iter().copied() {
        if let Some(Mark::Done(layer)) = marks.get(job.name.as_str()) {
            layers[*layer].push(job.name.clone());
        }
    }

    Ok(ExecutionPlan { layers })
}

/// Depth-first walk from `root` on an explicit stack, so long chains
/// cannot exhaust the thread's stack. Marks every reached job with its layer.
fn assign_layers<'a>(
    root: &'a str,
    by_name: &HashMap<&'a str, &'a PipelineJob>,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<(), OrchestratorError> {
    if marks.contains_key(root) {
        return Ok(());
    }
    marks.insert(root, Mark::Visiting);

    // Each frame is a job and the index of its next dependency to visit
    let mut stack: Vec<(&'a str, usize)> = vec![(root, 0)];

    while let Some(frame) = stack.last_mut() {
        let (name, next) = *frame;
        let job: &'a PipelineJob = by_name[name];

        if let Some(dep) = job.depends_on.get(next) {
            frame.1 += 1;
            match marks.get(dep.as_str()) {
                Some(Mark::Visiting) => {
                    return Err(OrchestratorError::validation(format!(
                        "dependency cycle detected at job '{}'",
                        dep
                    )))
                }
                Some(Mark::Done(_)) => {}
                None => {
                    marks.insert(dep.as_str(), Mark::Visiting);
                    stack.push((dep.as_str(), 0));
                }
            }
            continue;
        }

        let layer = job
            .depends_on
            .iter()
            .filter_map(|dep| match marks.get(dep.as_str()) {
                Some(Mark::Done(layer)) => Some(layer + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        marks.insert(name, Mark::Done(layer));
        stack.pop();
    }

    Ok(())
}
