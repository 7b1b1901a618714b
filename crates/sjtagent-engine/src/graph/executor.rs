use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sjtagent_core::config::RunConfig;

use super::builder::Graph;
use super::edge::{Edge, Target};
use super::state::State;
use crate::error::{FailureKind, RunFailure, StepFailure};

/// One step execution in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: String,
    /// 1-based entry count of this step at the time it ran.
    pub entry: u32,
    /// Label emitted or chosen for a conditional edge.
    pub label: Option<String>,
    /// Destination taken after the step.
    pub next: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A terminal marker was reached.
    Completed,
    /// Cancelled between steps; the state is consistent but partial.
    Cancelled,
}

/// Result of a run that did not fail.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: State,
    pub status: RunStatus,
    /// Steps in execution order.
    pub trace: Vec<StepRecord>,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Drives a [`Graph`] from its entry step to a terminal marker.
///
/// The engine is stateless between runs; one engine can drive many graphs
/// and many runs of the same graph concurrently.
#[derive(Debug, Clone)]
pub struct Engine {
    max_steps: u32,
    step_limits: BTreeMap<String, u32>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Engine {
    /// `max_steps` bounds how many times any single step may be entered.
    pub fn new(max_steps: u32) -> Self {
        Self {
            max_steps,
            step_limits: BTreeMap::new(),
        }
    }

    pub fn from_config(run: &RunConfig) -> Self {
        Self {
            max_steps: run.max_steps,
            step_limits: run.step_limits.clone(),
        }
    }

    /// Override the entry bound for one step.
    pub fn with_step_limit(mut self, step: impl Into<String>, limit: u32) -> Self {
        self.step_limits.insert(step.into(), limit);
        self
    }

    fn limit_for(&self, step: &str) -> u32 {
        self.step_limits.get(step).copied().unwrap_or(self.max_steps)
    }

    pub async fn run(&self, graph: &Graph, initial: State) -> Result<RunOutcome, RunFailure> {
        self.run_with_cancel(graph, initial, &CancellationToken::new())
            .await
    }

    /// Run the graph, checking `cancel` before each step.
    ///
    /// Steps execute strictly one at a time. Given the same graph, initial
    /// state and step outputs, the trace and final state are identical.
    pub async fn run_with_cancel(
        &self,
        graph: &Graph,
        initial: State,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        let start = Instant::now();
        let mut state = initial;
        let mut trace: Vec<StepRecord> = Vec::new();
        let mut entries: HashMap<String, u32> = HashMap::new();
        let mut current = graph.entry().to_string();

        loop {
            if cancel.is_cancelled() {
                info!(step = %current, steps = trace.len(), "Run cancelled");
                return Ok(RunOutcome {
                    state,
                    status: RunStatus::Cancelled,
                    trace,
                });
            }

            let entry = {
                let count = entries.entry(current.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let limit = self.limit_for(&current);
            if entry > limit {
                warn!(step = %current, limit, "Step entry bound exceeded");
                return Err(RunFailure {
                    kind: FailureKind::IterationLimitExceeded,
                    message: format!("step entered more than {} times", limit),
                    step: current,
                    entry,
                    last_state: state,
                    trace,
                    cause: None,
                });
            }

            // Graph::build guarantees every edge target and the entry exist.
            let Some(step) = graph.step(&current) else {
                return Err(RunFailure {
                    kind: FailureKind::StepError,
                    message: "step is not defined".into(),
                    step: current,
                    entry,
                    last_state: state,
                    trace,
                    cause: None,
                });
            };

            debug!(step = %current, entry, "Executing step");
            let step_start = Instant::now();
            let update = match step.execute(&state).await {
                Ok(update) => update,
                Err(failure) => {
                    error!(step = %current, error = %failure, "Step failed");
                    return Err(RunFailure {
                        kind: FailureKind::StepError,
                        message: failure.reason.clone(),
                        step: current,
                        entry,
                        last_state: state,
                        trace,
                        cause: Some(failure),
                    });
                }
            };
            let elapsed_ms = step_start.elapsed().as_millis() as u64;

            if let Some(allowed) = step.writes() {
                if let Some(key) = update.touched().find(|k| !allowed.iter().any(|a| a == k)) {
                    let message = format!("wrote undeclared field '{}'", key);
                    error!(step = %current, field = key, "Step wrote outside its declared fields");
                    return Err(RunFailure {
                        kind: FailureKind::StepError,
                        cause: Some(StepFailure::new(message.clone())),
                        message,
                        step: current,
                        entry,
                        last_state: state,
                        trace,
                    });
                }
            }

            let emitted = update.label().map(str::to_string);
            state.apply(update);

            let edge = graph.edge(&current);
            let (label, next) = match edge {
                Some(Edge::Direct(target)) => (None, target.clone()),
                Some(Edge::Conditional(cond)) => match cond.resolve(&state, emitted.as_deref()) {
                    Ok((label, target)) => (Some(label), target.clone()),
                    Err(message) => {
                        error!(step = %current, error = %message, "Routing failed");
                        return Err(RunFailure {
                            kind: FailureKind::RoutingError,
                            message,
                            step: current,
                            entry,
                            last_state: state,
                            trace,
                            cause: None,
                        });
                    }
                },
                None => {
                    return Err(RunFailure {
                        kind: FailureKind::RoutingError,
                        message: "step has no outgoing edge".into(),
                        step: current,
                        entry,
                        last_state: state,
                        trace,
                        cause: None,
                    });
                }
            };

            debug!(
                step = %current,
                label = label.as_deref().unwrap_or("-"),
                next = %next,
                elapsed_ms,
                "Step complete"
            );
            trace.push(StepRecord {
                step: current.clone(),
                entry,
                label,
                next: next.to_string(),
                elapsed_ms,
            });

            match next {
                Target::End => {
                    info!(
                        steps = trace.len(),
                        total_ms = start.elapsed().as_millis() as u64,
                        "Run complete"
                    );
                    return Ok(RunOutcome {
                        state,
                        status: RunStatus::Completed,
                        trace,
                    });
                }
                Target::Step(name) => current = name,
            }
        }
    }
}
