use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use super::edge::{ConditionalEdge, Edge, Target};
use super::step::Step;
use crate::error::GraphError;

/// An immutable, validated workflow.
///
/// Only [`GraphBuilder::build`] creates one, so every `Graph` in hand has an
/// entry step, one outgoing edge per step, exhaustive conditional edges, and
/// an escape path to a terminal marker from every reachable step.
#[derive(Clone)]
pub struct Graph {
    steps: HashMap<String, Arc<dyn Step>>,
    edges: HashMap<String, Edge>,
    entry: String,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn step(&self, name: &str) -> Option<&Arc<dyn Step>> {
        self.steps.get(name)
    }

    pub fn edge(&self, name: &str) -> Option<&Edge> {
        self.edges.get(name)
    }

    /// Step names in sorted order.
    pub fn step_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("entry", &self.entry)
            .field("steps", &self.step_names())
            .field("edges", &self.edges)
            .finish()
    }
}

/// Collects steps and edges, then validates them into a [`Graph`].
#[derive(Default)]
pub struct GraphBuilder {
    steps: Vec<Arc<dyn Step>>,
    edges: Vec<(String, Edge)>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn add_shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Unconditional edge. `to` may be [`END`](super::edge::END).
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), Edge::Direct(Target::parse(to))));
        self
    }

    pub fn add_conditional_edge(mut self, from: impl Into<String>, edge: ConditionalEdge) -> Self {
        self.edges.push((from.into(), Edge::Conditional(edge)));
        self
    }

    /// Conditional edge routed by the label the source step emits.
    pub fn add_conditional_edges<I, L, T>(self, from: impl Into<String>, routes: I) -> Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        self.add_conditional_edge(from, ConditionalEdge::by_label(routes))
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        let mut steps: HashMap<String, Arc<dyn Step>> = HashMap::new();
        for step in self.steps {
            let name = step.name().to_string();
            if steps.insert(name.clone(), step).is_some() {
                return Err(GraphError::DuplicateStep(name));
            }
        }

        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        if !steps.contains_key(&entry) {
            return Err(GraphError::UnknownEntry(entry));
        }

        let mut edges: HashMap<String, Edge> = HashMap::new();
        for (from, edge) in self.edges {
            if !steps.contains_key(&from) {
                return Err(GraphError::UnknownStep(from));
            }
            for target in edge.targets() {
                if let Some(name) = target.step_name() {
                    if !steps.contains_key(name) {
                        return Err(GraphError::UnknownStep(name.to_string()));
                    }
                }
            }
            if edges.contains_key(&from) {
                return Err(GraphError::DuplicateEdge(from));
            }
            edges.insert(from, edge);
        }

        let mut names: Vec<&String> = steps.keys().collect();
        names.sort();

        // Destinations each step can actually take at run time.
        let mut live: HashMap<&str, Vec<&Target>> = HashMap::new();
        for name in &names {
            let edge = edges
                .get(*name)
                .ok_or_else(|| GraphError::MissingEdge((*name).clone()))?;
            let targets = match edge {
                Edge::Direct(target) => vec![target],
                Edge::Conditional(cond) => {
                    let produced = check_labels(name, steps[*name].as_ref(), cond)?;
                    produced.iter().filter_map(|l| cond.routes().get(l)).collect()
                }
            };
            live.insert(name.as_str(), targets);
        }

        check_termination(&entry, &names, &live)?;

        Ok(Graph {
            steps,
            edges,
            entry,
        })
    }
}

/// Every label the source can produce must be routed. Returns those labels.
fn check_labels(
    name: &str,
    step: &dyn Step,
    edge: &ConditionalEdge,
) -> Result<Vec<String>, GraphError> {
    if edge.routes().is_empty() {
        return Err(GraphError::EmptyRoutes(name.to_string()));
    }
    let produced = match edge.router() {
        Some(router) => router.labels(),
        None => step.labels(),
    };
    if produced.is_empty() {
        return Err(GraphError::NoLabelSource(name.to_string()));
    }
    if let Some(label) = produced.iter().find(|l| !edge.declares(l)) {
        return Err(GraphError::UnroutedLabel {
            step: name.to_string(),
            label: label.clone(),
        });
    }
    Ok(produced)
}

/// Every step reachable from the entry must be able to reach a terminal
/// marker through routes its label source can select; otherwise some cycle
/// has no escape edge.
fn check_termination(
    entry: &str,
    names: &[&String],
    live: &HashMap<&str, Vec<&Target>>,
) -> Result<(), GraphError> {
    // Steps that can reach END, grown to a fixpoint.
    let mut escapes: BTreeSet<&str> = BTreeSet::new();
    loop {
        let before = escapes.len();
        for name in names {
            if escapes.contains(name.as_str()) {
                continue;
            }
            let reaches = live[name.as_str()].iter().any(|t| match t {
                Target::End => true,
                Target::Step(next) => escapes.contains(next.as_str()),
            });
            if reaches {
                escapes.insert(name.as_str());
            }
        }
        if escapes.len() == before {
            break;
        }
    }

    // Forward reachability from the entry, in deterministic order.
    let mut reachable: BTreeMap<&str, ()> = BTreeMap::new();
    let mut frontier = vec![entry];
    while let Some(name) = frontier.pop() {
        if reachable.insert(name, ()).is_some() {
            continue;
        }
        for target in &live[name] {
            if let Target::Step(next) = target {
                frontier.push(next.as_str());
            }
        }
    }

    for name in reachable.keys() {
        if !escapes.contains(name) {
            return Err(GraphError::NoEscape(name.to_string()));
        }
    }

    for name in names {
        if !reachable.contains_key(name.as_str()) {
            warn!(step = %name, "Step is unreachable from the entry step");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::{PredicateRouter, END};
    use crate::graph::state::StateUpdate;
    use crate::graph::step::FnStep;

    fn noop(name: &str) -> FnStep {
        FnStep::new(name, |_| Ok(StateUpdate::new()))
    }

    fn gate(name: &str, labels: &[&str]) -> FnStep {
        FnStep::new(name, |_| Ok(StateUpdate::new().with_label("stop"))).with_labels(labels)
    }

    fn generation_shape() -> GraphBuilder {
        Graph::builder()
            .add_step(noop("trait_analysis"))
            .add_step(noop("situation_construction"))
            .add_step(noop("behavior_adaptation"))
            .add_step(gate("quality_check", &["revise", "stop"]))
            .add_step(noop("revise"))
            .set_entry("trait_analysis")
            .add_edge("trait_analysis", "situation_construction")
            .add_edge("situation_construction", "behavior_adaptation")
            .add_edge("behavior_adaptation", "quality_check")
            .add_conditional_edges("quality_check", [("revise", "revise"), ("stop", END)])
            .add_edge("revise", "behavior_adaptation")
    }

    #[test]
    fn test_graph_construction() {
        let graph = generation_shape().build().unwrap();
        assert_eq!(graph.entry(), "trait_analysis");
        assert_eq!(graph.step_names().len(), 5);
        assert!(matches!(graph.edge("quality_check"), Some(Edge::Conditional(_))));
    }

    #[test]
    fn test_label_outside_declared_set_rejected() {
        let err = Graph::builder()
            .add_step(gate("quality_check", &["revise", "stop", "escalate"]))
            .add_step(noop("revise"))
            .set_entry("quality_check")
            .add_conditional_edges("quality_check", [("revise", "revise"), ("stop", END)])
            .add_edge("revise", "quality_check")
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            GraphError::UnroutedLabel {
                step: "quality_check".into(),
                label: "escalate".into()
            }
        );
    }

    #[test]
    fn test_router_labels_checked_instead_of_step() {
        let router = PredicateRouter::new(&["continue", "end", "abort"], |_| "end".into());
        let err = Graph::builder()
            .add_step(noop("batch_evaluations"))
            .add_step(noop("process_batch"))
            .set_entry("batch_evaluations")
            .add_conditional_edge(
                "batch_evaluations",
                ConditionalEdge::by_label([("continue", "process_batch"), ("end", END)])
                    .with_router(Arc::new(router)),
            )
            .add_edge("process_batch", "batch_evaluations")
            .build()
            .unwrap_err();

        assert!(matches!(err, GraphError::UnroutedLabel { label, .. } if label == "abort"));
    }

    #[test]
    fn test_conditional_without_label_source() {
        let err = Graph::builder()
            .add_step(noop("check"))
            .set_entry("check")
            .add_conditional_edges("check", [("stop", END)])
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::NoLabelSource("check".into()));
    }

    #[test]
    fn test_cycle_without_escape_rejected() {
        let err = Graph::builder()
            .add_step(noop("a"))
            .add_step(noop("b"))
            .set_entry("a")
            .add_edge("a", "b")
            .add_edge("b", "a")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::NoEscape(_)));
    }

    #[test]
    fn test_escape_route_never_selected_rejected() {
        let err = Graph::builder()
            .add_step(noop("draft"))
            .add_step(gate("review", &["revise"]))
            .set_entry("draft")
            .add_edge("draft", "review")
            .add_conditional_edges("review", [("revise", "draft"), ("stop", END)])
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::NoEscape(_)));
    }

    #[test]
    fn test_router_without_escape_label_rejected() {
        let router = PredicateRouter::new(&["continue"], |_| "continue".into());
        let err = Graph::builder()
            .add_step(noop("batch_evaluations"))
            .add_step(noop("process_batch"))
            .set_entry("batch_evaluations")
            .add_conditional_edge(
                "batch_evaluations",
                ConditionalEdge::by_label([("continue", "process_batch"), ("end", END)])
                    .with_router(Arc::new(router)),
            )
            .add_edge("process_batch", "batch_evaluations")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::NoEscape(_)));
    }

    #[test]
    fn test_conditional_cycle_with_escape_accepted() {
        assert!(generation_shape().build().is_ok());
    }

    #[test]
    fn test_missing_edge() {
        let err = Graph::builder()
            .add_step(noop("a"))
            .add_step(noop("b"))
            .set_entry("a")
            .add_edge("a", "b")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::MissingEdge("b".into()));
    }

    #[test]
    fn test_structural_errors() {
        let err = Graph::builder().add_step(noop("a")).build().unwrap_err();
        assert_eq!(err, GraphError::MissingEntry);

        let err = Graph::builder()
            .add_step(noop("a"))
            .set_entry("z")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownEntry("z".into()));

        let err = Graph::builder()
            .add_step(noop("a"))
            .add_step(noop("a"))
            .set_entry("a")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateStep("a".into()));

        let err = Graph::builder()
            .add_step(noop("a"))
            .set_entry("a")
            .add_edge("a", "ghost")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownStep("ghost".into()));

        let err = Graph::builder()
            .add_step(noop("a"))
            .set_entry("a")
            .add_edge("a", END)
            .add_edge("a", END)
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateEdge("a".into()));
    }
}
