use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use cadre_core::traits::Oracle;
use cadre_core::types::{FallbackReason, GraphEvent, Message, Route, END_LABEL};

use crate::decision::{match_label, parse_json};
use crate::node::{Node, RunContext, StepOutput};

/// Marker that ends a peer network regardless of the named next peer.
pub const FINAL_ANSWER: &str = "FINAL ANSWER";

/// An agent in a flat network: it writes content and names the next peer in
/// the same reply.
pub struct Peer {
    name: String,
    prompt: String,
    peers: Vec<String>,
    fallback: Route,
    oracle: Arc<dyn Oracle>,
}

#[derive(Debug, Deserialize)]
struct PeerReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(alias = "next")]
    next_agent: Option<String>,
    #[serde(default)]
    reasoning: String,
}

impl Peer {
    /// `fallback` is taken when the reply cannot be decoded.
    pub fn new(name: impl Into<String>, fallback: Route, oracle: Arc<dyn Oracle>) -> Self {
        let name = name.into();
        Self {
            prompt: format!("You are {}, collaborating with other assistants.", name),
            name,
            peers: vec![],
            fallback,
            oracle,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Declare a peer this node may pass control to.
    pub fn peer(mut self, name: impl Into<String>) -> Self {
        self.peers.push(name.into());
        self
    }

    fn allowed(&self) -> Vec<String> {
        self.peers
            .iter()
            .cloned()
            .chain(std::iter::once(END_LABEL.to_string()))
            .collect()
    }

    fn full_prompt(&self) -> String {
        format!(
            "{}\n\nRespond with a JSON object containing:\n\
             - content: your contribution\n\
             - next_agent: one of [{}]\n\
             - reasoning: why you chose that next step\n\
             If you have the final deliverable, prefix the content with {}.",
            self.prompt.trim(),
            self.allowed().join(", "),
            FINAL_ANSWER
        )
    }

    /// Decode a reply into (content, route, fallback reason if any).
    fn interpret(&self, raw: &str) -> (String, Route, Option<(FallbackReason, String)>) {
        let allowed = self.allowed();
        let (content, route, fallback) = match parse_json::<PeerReply>(raw) {
            Some(reply) => {
                let content = reply.content.unwrap_or_else(|| raw.trim().to_string());
                let label = reply.next_agent.unwrap_or_default();
                match match_label(&label, &allowed) {
                    Some(route) => {
                        debug!(
                            node = %self.name,
                            to = %route,
                            reasoning = %reply.reasoning,
                            "Peer chose next"
                        );
                        (content, route, None)
                    }
                    None => (
                        content,
                        self.fallback.clone(),
                        Some((
                            FallbackReason::InvalidDecision,
                            format!("undeclared next agent '{}'", label),
                        )),
                    ),
                }
            }
            None => (
                raw.trim().to_string(),
                self.fallback.clone(),
                Some((
                    FallbackReason::OracleFailure,
                    "reply is not a JSON object".to_string(),
                )),
            ),
        };

        if content.contains(FINAL_ANSWER) {
            return (content, Route::End, None);
        }
        (content, route, fallback)
    }
}

impl Node for Peer {
    fn name(&self) -> &str {
        &self.name
    }

    fn destinations(&self) -> Vec<Route> {
        self.peers
            .iter()
            .map(|p| Route::To(p.clone()))
            .chain([Route::End, self.fallback.clone()])
            .collect()
    }

    fn step<'a>(&'a self, log: &'a [Message], ctx: &'a RunContext) -> BoxFuture<'a, StepOutput> {
        Box::pin(async move {
            let raw = match self.oracle.generate(self.full_prompt(), log.to_vec()).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        node = %self.name,
                        error = %e,
                        fallback = %self.fallback,
                        "Peer generation failed"
                    );
                    ctx.emit(GraphEvent::FallbackTaken {
                        node: self.name.clone(),
                        reason: FallbackReason::OracleFailure,
                        detail: e.to_string(),
                        to: self.fallback.clone(),
                    });
                    return StepOutput::route(self.fallback.clone(), vec![]);
                }
            };

            let (content, route, fallback) = self.interpret(&raw);
            if let Some((reason, detail)) = fallback {
                warn!(
                    node = %self.name,
                    %detail,
                    fallback = %route,
                    "Peer reply not understood, taking fallback"
                );
                ctx.emit(GraphEvent::FallbackTaken {
                    node: self.name.clone(),
                    reason,
                    detail,
                    to: route.clone(),
                });
            }

            let message = Message::assistant(content).from_node(self.name.clone());
            StepOutput::route(route, vec![message])
        })
    }
}
