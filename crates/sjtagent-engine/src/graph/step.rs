use futures::future::BoxFuture;

use super::state::{State, StateUpdate};
use crate::error::StepFailure;

/// A node in the execution graph.
///
/// A step reads the current state and answers with an update. It knows
/// nothing about the graph around it: who routes to it, or where its label
/// leads.
pub trait Step: Send + Sync {
    /// Unique name within a graph.
    fn name(&self) -> &str;

    /// Every label this step can emit for a conditional edge.
    fn labels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fields and counters this step may write. `None` means unrestricted.
    fn writes(&self) -> Option<Vec<String>> {
        None
    }

    fn execute<'a>(&'a self, state: &'a State) -> BoxFuture<'a, Result<StateUpdate, StepFailure>>;
}

type StepFn = dyn Fn(&State) -> Result<StateUpdate, StepFailure> + Send + Sync;

/// A synchronous step built from a closure, for pure computation such as
/// quality checks and packaging.
pub struct FnStep {
    name: String,
    labels: Vec<String>,
    writes: Option<Vec<String>>,
    run: Box<StepFn>,
}

impl FnStep {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&State) -> Result<StateUpdate, StepFailure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            labels: Vec::new(),
            writes: None,
            run: Box::new(run),
        }
    }

    /// Declare the labels this step emits.
    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Restrict the fields this step may write.
    pub fn with_writes(mut self, keys: &[&str]) -> Self {
        self.writes = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }
}

impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn writes(&self) -> Option<Vec<String>> {
        self.writes.clone()
    }

    fn execute<'a>(&'a self, state: &'a State) -> BoxFuture<'a, Result<StateUpdate, StepFailure>> {
        let result = (self.run)(state);
        Box::pin(async move { result })
    }
}
