use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use cadre_core::traits::Oracle;
use cadre_core::types::{GraphEvent, Message, Route, RoutingDecision};

use crate::decision::{allowed_labels, decode_decision, fallback_reason, routing_prompt, Choice};
use crate::node::{Node, RunContext, StepOutput};

/// Route a supervisor takes when the oracle fails or answers out of bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Fallback {
    /// The first declared child.
    #[default]
    FirstChild,
    /// A fixed route, possibly termination.
    Route(Route),
}

impl Fallback {
    /// Parse a configured label; `None` means the first child.
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            Some(label) => Self::Route(Route::from_label(label)),
            None => Self::FirstChild,
        }
    }
}

/// A node whose only output is a routing decision over its children.
///
/// Supervisors never append to the log; their rationale goes to tracing and
/// the event bus.
pub struct Supervisor {
    name: String,
    prompt: String,
    children: Vec<Choice>,
    fallback: Fallback,
    context_window: usize,
    oracle: Arc<dyn Oracle>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, oracle: Arc<dyn Oracle>) -> Self {
        let name = name.into();
        Self {
            prompt: format!("You are {}, a supervisor coordinating a team of agents.", name),
            name,
            children: vec![],
            fallback: Fallback::default(),
            context_window: 3,
            oracle,
        }
    }

    /// Set the role description that opens every routing prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Declare a child this supervisor may route to.
    pub fn child(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.children.push(Choice::new(name, description));
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Number of trailing messages quoted in the routing prompt.
    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    pub fn children(&self) -> &[Choice] {
        &self.children
    }

    /// The concrete fallback route.
    pub fn fallback_route(&self) -> Route {
        match &self.fallback {
            Fallback::Route(route) => route.clone(),
            Fallback::FirstChild => self
                .children
                .first()
                .map(|c| Route::To(c.label.clone()))
                .unwrap_or(Route::End),
        }
    }

    async fn decide(&self, log: &[Message]) -> cadre_core::Result<RoutingDecision> {
        let prompt = routing_prompt(&self.prompt, &self.children, log, self.context_window);
        let allowed = allowed_labels(&self.children);
        let raw = self.oracle.decide(prompt, allowed.clone()).await?;
        decode_decision(&self.name, &raw, &allowed)
    }
}

impl Node for Supervisor {
    fn name(&self) -> &str {
        &self.name
    }

    fn destinations(&self) -> Vec<Route> {
        self.children
            .iter()
            .map(|c| Route::To(c.label.clone()))
            .chain([Route::End, self.fallback_route()])
            .collect()
    }

    fn routes_only(&self) -> bool {
        true
    }

    fn step<'a>(&'a self, log: &'a [Message], ctx: &'a RunContext) -> BoxFuture<'a, StepOutput> {
        Box::pin(async move {
            match self.decide(log).await {
                Ok(decision) => {
                    debug!(
                        node = %self.name,
                        to = %decision.route,
                        reasoning = %decision.justification,
                        "Supervisor routed"
                    );
                    let route = decision.route.clone();
                    ctx.emit(GraphEvent::Decision {
                        node: self.name.clone(),
                        decision,
                    });
                    StepOutput::route(route, vec![])
                }
                Err(e) => {
                    let route = self.fallback_route();
                    warn!(
                        node = %self.name,
                        error = %e,
                        fallback = %route,
                        "Routing failed, taking fallback"
                    );
                    ctx.emit(GraphEvent::FallbackTaken {
                        node: self.name.clone(),
                        reason: fallback_reason(&e),
                        detail: e.to_string(),
                        to: route.clone(),
                    });
                    StepOutput::route(route, vec![])
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Transition;
    use cadre_core::types::FallbackReason;
    use cadre_test_utils::{FailingOracle, FixedOracle};

    fn research_supervisor(oracle: Arc<dyn Oracle>) -> Supervisor {
        Supervisor::new("research_supervisor", oracle)
            .child("research_agent", "For gathering information")
            .child("fact_checker", "For verifying information accuracy")
    }

    #[tokio::test]
    async fn test_routes_to_declared_child() {
        let oracle = Arc::new(FixedOracle::new(
            r#"{"next": "fact_checker", "reasoning": "verify"}"#,
        ));
        let sup = research_supervisor(oracle);
        let out = sup.step(&[Message::user("check this")], &RunContext::new()).await;

        assert_eq!(out.transition, Transition::Route(Route::to("fact_checker")));
        assert!(out.delta.is_empty());
    }

    #[tokio::test]
    async fn test_selects_terminal() {
        let oracle = Arc::new(FixedOracle::new(r#"{"next": "__end__", "reasoning": "done"}"#));
        let sup = research_supervisor(oracle);
        let out = sup.step(&[], &RunContext::new()).await;
        assert_eq!(out.transition, Transition::Route(Route::End));
    }

    #[tokio::test]
    async fn test_illegal_label_takes_fallback() {
        let oracle = Arc::new(FixedOracle::new(r#"{"next": "editor", "reasoning": "?"}"#));
        let bus = Arc::new(cadre_core::EventBus::new(8));
        let mut rx = bus.subscribe();
        let sup = research_supervisor(oracle)
            .with_fallback(Fallback::Route(Route::to("fact_checker")));

        let ctx = RunContext::new().with_events(bus);
        let out = sup.step(&[Message::user("x")], &ctx).await;
        assert_eq!(out.transition, Transition::Route(Route::to("fact_checker")));

        match rx.recv().await.unwrap() {
            GraphEvent::FallbackTaken { node, reason, to, .. } => {
                assert_eq!(node, "research_supervisor");
                assert_eq!(reason, FallbackReason::InvalidDecision);
                assert_eq!(to, Route::to("fact_checker"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oracle_failure_defaults_to_first_child() {
        let sup = research_supervisor(Arc::new(FailingOracle::new()));
        let out = sup.step(&[Message::user("x")], &RunContext::new()).await;
        assert_eq!(out.transition, Transition::Route(Route::to("research_agent")));
    }

    #[test]
    fn test_destinations_cover_children_and_end() {
        let sup = research_supervisor(Arc::new(FailingOracle::new()));
        let dests = sup.destinations();
        assert!(dests.contains(&Route::to("research_agent")));
        assert!(dests.contains(&Route::to("fact_checker")));
        assert!(dests.contains(&Route::End));
    }

    #[test]
    fn test_fallback_from_label() {
        assert_eq!(Fallback::from_label(None), Fallback::FirstChild);
        assert_eq!(
            Fallback::from_label(Some("__end__")),
            Fallback::Route(Route::End)
        );
        let childless = Supervisor::new("empty", Arc::new(FailingOracle::new()));
        assert_eq!(childless.fallback_route(), Route::End);
    }
}
