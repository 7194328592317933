use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use cadre_core::event::EventBus;
use cadre_core::types::{GraphEvent, Message, Route, RunFailure};

use crate::handoff::Handoff;

/// What the graph should do after a node returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Continue at a node of the same graph, or terminate.
    Route(Route),
    /// Dispatch into a named node that may live in another graph.
    Handoff(Handoff),
    /// Abort the run. Only produced when a nested run failed.
    Abort(RunFailure),
}

/// The result of one node dispatch: a control decision plus a state delta.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub transition: Transition,
    pub delta: Vec<Message>,
}

impl StepOutput {
    pub fn route(route: Route, delta: Vec<Message>) -> Self {
        Self {
            transition: Transition::Route(route),
            delta,
        }
    }

    pub fn goto(node: impl Into<String>, delta: Vec<Message>) -> Self {
        Self::route(Route::To(node.into()), delta)
    }

    pub fn end(delta: Vec<Message>) -> Self {
        Self::route(Route::End, delta)
    }

    pub fn handoff(handoff: Handoff, delta: Vec<Message>) -> Self {
        Self {
            transition: Transition::Handoff(handoff),
            delta,
        }
    }
}

/// Per-run services shared by every node of a run, nested teams included.
#[derive(Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    events: Option<Arc<EventBus>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the run between steps when this token is cancelled.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish graph events to this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit(&self, event: GraphEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// A unit of work in a graph.
///
/// Given a read-only view of the log, a node performs its action and returns
/// where control goes next plus the messages to append. Nodes hold no
/// run-scoped state, so one instance can serve concurrent runs.
pub trait Node: Send + Sync + 'static {
    /// Unique name within the owning graph.
    fn name(&self) -> &str;

    /// Every route this node can return on its own, checked when the graph
    /// is built. Handoff targets are resolved at run time and not listed.
    fn destinations(&self) -> Vec<Route>;

    /// Whether the node only decides where control goes and never appends.
    ///
    /// Routing-only dispatches are not charged against the step budget, so a
    /// budget of N allows N dispatches of nodes that do the work.
    fn routes_only(&self) -> bool {
        false
    }

    /// Run the node once.
    fn step<'a>(&'a self, log: &'a [Message], ctx: &'a RunContext) -> BoxFuture<'a, StepOutput>;
}
