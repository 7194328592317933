use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use cadre_core::config::HandoffScope;
use cadre_core::traits::Oracle;
use cadre_core::types::{GraphEvent, Message, Role, Route};

use crate::decision::{allowed_labels, decode_decision, fallback_reason, routing_prompt, Choice};
use crate::node::{Node, RunContext, StepOutput};

/// What the handoff target sees when it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffInput {
    /// The full current log, history included.
    FullLog,
    /// A freshly minted single-message log carrying only the task.
    Task(Message),
}

/// Request to dispatch into a named node outside the current static wiring.
///
/// Resolved by the graph executing the requesting node; if that graph does
/// not own `target`, the request escapes one level to the parent graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    pub target: String,
    pub input: HandoffInput,
    /// Set once the request has left the graph it was issued in.
    pub escalated: bool,
}

impl Handoff {
    pub fn new(target: impl Into<String>, input: HandoffInput) -> Self {
        Self {
            target: target.into(),
            input,
            escalated: false,
        }
    }

    /// Hand off with the whole conversation.
    pub fn with_history(target: impl Into<String>) -> Self {
        Self::new(target, HandoffInput::FullLog)
    }

    /// Hand off with only a task description.
    pub fn with_task(target: impl Into<String>, task: Message) -> Self {
        Self::new(target, HandoffInput::Task(task))
    }

    pub(crate) fn escalate(mut self) -> Self {
        self.escalated = true;
        self
    }

    /// The log the target runs against, when it differs from the current log.
    pub(crate) fn scoped_log(&self) -> Option<Vec<Message>> {
        match &self.input {
            HandoffInput::FullLog => None,
            HandoffInput::Task(task) => Some(vec![task.clone()]),
        }
    }
}

/// Asks the oracle which specialist should take the task and hands it off.
///
/// Specialists are addressed by name and need not be wired as children of
/// this node; they may live in this graph or in its parent.
pub struct Delegator {
    name: String,
    prompt: String,
    specialists: Vec<Choice>,
    scope: HandoffScope,
    fallback: Route,
    context_window: usize,
    oracle: Arc<dyn Oracle>,
}

impl Delegator {
    pub fn new(name: impl Into<String>, oracle: Arc<dyn Oracle>) -> Self {
        Self {
            name: name.into(),
            prompt: "You are a supervisor. Delegate the request to the most suitable specialist."
                .to_string(),
            specialists: vec![],
            scope: HandoffScope::default(),
            fallback: Route::End,
            context_window: 3,
            oracle,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn specialist(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.specialists.push(Choice::new(name, description));
        self
    }

    pub fn with_scope(mut self, scope: HandoffScope) -> Self {
        self.scope = scope;
        self
    }

    /// Route taken when the oracle fails. Terminates by default.
    pub fn with_fallback(mut self, fallback: Route) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    /// The task description handed to a specialist: the latest user request.
    fn task(&self, log: &[Message]) -> Message {
        let request = log
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .or_else(|| log.last())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Message::user(request).from_node(self.name.clone())
    }
}

impl Node for Delegator {
    fn name(&self) -> &str {
        &self.name
    }

    fn destinations(&self) -> Vec<Route> {
        vec![Route::End, self.fallback.clone()]
    }

    fn routes_only(&self) -> bool {
        true
    }

    fn step<'a>(&'a self, log: &'a [Message], ctx: &'a RunContext) -> BoxFuture<'a, StepOutput> {
        Box::pin(async move {
            let prompt = routing_prompt(&self.prompt, &self.specialists, log, self.context_window);
            let allowed = allowed_labels(&self.specialists);

            let decision = match self.oracle.decide(prompt, allowed.clone()).await {
                Ok(raw) => decode_decision(&self.name, &raw, &allowed),
                Err(e) => Err(e),
            };

            match decision {
                Ok(decision) => {
                    debug!(node = %self.name, to = %decision.route, "Delegator decided");
                    ctx.emit(GraphEvent::Decision {
                        node: self.name.clone(),
                        decision: decision.clone(),
                    });
                    match decision.route {
                        Route::End => StepOutput::end(vec![]),
                        Route::To(target) => {
                            let handoff = match self.scope {
                                HandoffScope::FullLog => Handoff::with_history(target),
                                HandoffScope::Task => Handoff::with_task(target, self.task(log)),
                            };
                            StepOutput::handoff(handoff, vec![])
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        node = %self.name,
                        error = %e,
                        fallback = %self.fallback,
                        "Delegation failed, taking fallback"
                    );
                    ctx.emit(GraphEvent::FallbackTaken {
                        node: self.name.clone(),
                        reason: fallback_reason(&e),
                        detail: e.to_string(),
                        to: self.fallback.clone(),
                    });
                    StepOutput::route(self.fallback.clone(), vec![])
                }
            }
        })
    }
}
