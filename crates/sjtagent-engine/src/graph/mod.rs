//! Graph workflow execution.
//!
//! A workflow is a set of named steps joined by direct and conditional
//! edges. Steps read a shared [`State`] and answer with a [`StateUpdate`];
//! the [`Engine`] merges updates and follows edges until a terminal marker.

pub mod builder;
pub mod edge;
pub mod executor;
pub mod state;
pub mod step;

pub use builder::{Graph, GraphBuilder};
pub use edge::{ConditionalEdge, Edge, PredicateRouter, Router, Target, END};
pub use executor::{Engine, RunOutcome, RunStatus, StepRecord};
pub use state::{State, StateUpdate};
pub use step::{FnStep, Step};
