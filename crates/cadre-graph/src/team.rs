use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use cadre_core::types::{GraphEvent, Message, MessageLog, Route, RunStatus};

use crate::executor::{Exit, Graph, Progress};
use crate::node::{Node, RunContext, StepOutput, Transition};

/// A graph registered as a single node of a parent graph.
///
/// The team sees the parent's full log, runs its own graph to local
/// termination and hands back only what it appended, then returns control
/// to its fixed return edge. The parent never learns the team's node names.
pub struct Team {
    name: String,
    graph: Arc<Graph>,
    returns_to: String,
}

impl Team {
    pub fn new(name: impl Into<String>, graph: Graph, returns_to: impl Into<String>) -> Self {
        Self::shared(name, Arc::new(graph), returns_to)
    }

    /// Wrap a graph that is also used elsewhere.
    pub fn shared(
        name: impl Into<String>,
        graph: Arc<Graph>,
        returns_to: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            graph,
            returns_to: returns_to.into(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl Node for Team {
    fn name(&self) -> &str {
        &self.name
    }

    fn destinations(&self) -> Vec<Route> {
        vec![Route::To(self.returns_to.clone())]
    }

    fn step<'a>(&'a self, log: &'a [Message], ctx: &'a RunContext) -> BoxFuture<'a, StepOutput> {
        Box::pin(async move {
            info!(team = %self.name, graph = %self.graph.name(), "Entering team");
            ctx.emit(GraphEvent::TeamEntered {
                team: self.name.clone(),
            });

            let mut inner = MessageLog::from(log.to_vec());
            let start = inner.len();
            let mut progress = Progress::default();
            let exit = self.graph.drive(&mut inner, ctx, &mut progress, true).await;
            let delta = inner.since(start).to_vec();

            let status = match &exit {
                Exit::Finished(status) => status.clone(),
                // Handing off counts as local termination.
                Exit::Escalate(_) => RunStatus::Completed,
            };
            info!(
                team = %self.name,
                status = %status,
                steps = progress.steps,
                appended = delta.len(),
                "Leaving team"
            );
            ctx.emit(GraphEvent::TeamExited {
                team: self.name.clone(),
                status: status.clone(),
                appended: delta.len(),
            });

            match exit {
                Exit::Escalate(handoff) => StepOutput::handoff(handoff, delta),
                Exit::Finished(RunStatus::Failed(failure)) => StepOutput {
                    transition: Transition::Abort(failure),
                    delta,
                },
                Exit::Finished(status) => {
                    if status == RunStatus::StepBudgetExceeded {
                        warn!(team = %self.name, "Team stopped on its step budget");
                    }
                    StepOutput::goto(self.returns_to.clone(), delta)
                }
            }
        })
    }
}
