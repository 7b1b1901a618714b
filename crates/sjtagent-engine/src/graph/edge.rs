use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::state::State;

/// Terminal marker accepted wherever a destination step name is expected.
pub const END: &str = "__end__";

/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Step(String),
    End,
}

impl Target {
    /// Parse a destination name, mapping [`END`] to the terminal marker.
    pub fn parse(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == END {
            Target::End
        } else {
            Target::Step(name)
        }
    }

    pub fn step_name(&self) -> Option<&str> {
        match self {
            Target::Step(name) => Some(name),
            Target::End => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Step(name) => f.write_str(name),
            Target::End => f.write_str(END),
        }
    }
}

/// Chooses a label for a conditional edge.
///
/// Routers are pure functions of the merged state and the label the step
/// emitted: no side effects and no external calls, so replaying a state
/// sequence always routes the same way.
pub trait Router: Send + Sync {
    /// Every label `route` can return.
    fn labels(&self) -> Vec<String>;

    fn route(&self, state: &State, emitted: Option<&str>, available: &[&str]) -> Option<String>;
}

type PredicateFn = dyn Fn(&State) -> String + Send + Sync;

/// Router backed by a predicate over the merged state.
pub struct PredicateRouter {
    labels: Vec<String>,
    predicate: Box<PredicateFn>,
}

impl PredicateRouter {
    pub fn new<F>(labels: &[&str], predicate: F) -> Self
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
    {
        Self {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            predicate: Box::new(predicate),
        }
    }
}

impl Router for PredicateRouter {
    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn route(&self, state: &State, _emitted: Option<&str>, _available: &[&str]) -> Option<String> {
        Some((self.predicate)(state))
    }
}

/// Label → destination map evaluated after the source step runs.
#[derive(Clone)]
pub struct ConditionalEdge {
    routes: BTreeMap<String, Target>,
    router: Option<Arc<dyn Router>>,
}

impl fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("routes", &self.routes)
            .field("router", &self.router.is_some())
            .finish()
    }
}

impl ConditionalEdge {
    /// Route by the label the source step emits in its update.
    pub fn by_label<I, L, T>(routes: I) -> Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        Self {
            routes: routes
                .into_iter()
                .map(|(label, to)| (label.into(), Target::parse(to)))
                .collect(),
            router: None,
        }
    }

    /// Route with an explicit router instead of the emitted label.
    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn routes(&self) -> &BTreeMap<String, Target> {
        &self.routes
    }

    pub fn router(&self) -> Option<&Arc<dyn Router>> {
        self.router.as_ref()
    }

    pub fn declares(&self, label: &str) -> bool {
        self.routes.contains_key(label)
    }

    /// Pick the destination for the merged `state`.
    ///
    /// Fails with a description when no label was produced or the label is
    /// outside the declared set.
    pub fn resolve(&self, state: &State, emitted: Option<&str>) -> Result<(String, &Target), String> {
        let available: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        let label = match &self.router {
            Some(router) => router.route(state, emitted, &available),
            None => emitted.map(str::to_string),
        };
        let label = label.ok_or_else(|| "no routing label was produced".to_string())?;
        match self.routes.get(&label) {
            Some(target) => Ok((label, target)),
            None => Err(format!(
                "label '{}' is not one of [{}]",
                label,
                available.join(", ")
            )),
        }
    }
}

/// The outgoing edge of one step.
#[derive(Debug, Clone)]
pub enum Edge {
    /// Always continue to the same destination.
    Direct(Target),
    /// Choose the destination from a label.
    Conditional(ConditionalEdge),
}

impl Edge {
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Edge::Direct(t) => vec![t],
            Edge::Conditional(c) => c.routes.values().collect(),
        }
    }
}
