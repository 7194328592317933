//! Routing prompts and the typed decode of oracle replies.

use regex::Regex;
use serde::Deserialize;

use cadre_core::error::{CadreError, Result};
use cadre_core::types::{FallbackReason, Message, Route, RoutingDecision, END_LABEL};

/// A routing option offered to the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub description: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
        }
    }
}

/// Labels the oracle may answer with: every choice plus the terminal sentinel.
pub fn allowed_labels(choices: &[Choice]) -> Vec<String> {
    choices
        .iter()
        .map(|c| c.label.clone())
        .chain(std::iter::once(END_LABEL.to_string()))
        .collect()
}

/// Build the prompt a supervisor sends with a routing request.
pub fn routing_prompt(role: &str, choices: &[Choice], log: &[Message], window: usize) -> String {
    let mut prompt = String::new();
    prompt.push_str(role.trim());
    prompt.push_str("\n\nDecide what happens next:\n");
    for choice in choices {
        if choice.description.is_empty() {
            prompt.push_str(&format!("- {}\n", choice.label));
        } else {
            prompt.push_str(&format!("- {}: {}\n", choice.label, choice.description));
        }
    }
    prompt.push_str(&format!("- {}: If the task is complete\n", END_LABEL));

    let start = log.len().saturating_sub(window);
    let recent = &log[start..];
    if !recent.is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        for message in recent {
            prompt.push_str(&format!("- {}\n", message.render()));
        }
    }

    let last = log
        .last()
        .map(|m| m.content.as_str())
        .unwrap_or("No previous messages");
    prompt.push_str(&format!("\nLast message: {}\n", last));

    let labels = allowed_labels(choices).join(", ");
    prompt.push_str(&format!(
        "\nRespond with ONLY a JSON object: {{\"next\": one of [{}], \"reasoning\": \"why\"}}",
        labels
    ));
    prompt
}

#[derive(Debug, Deserialize)]
struct DecisionReply {
    #[serde(alias = "next_agent", alias = "next_team", alias = "destination")]
    next: String,
    #[serde(default, alias = "reason", alias = "rationale", alias = "justification")]
    reasoning: String,
}

/// Decode a routing reply into a decision restricted to `allowed`.
///
/// A JSON reply naming an undeclared label is `InvalidDecision`. A reply that
/// is not JSON is scanned for the earliest declared label; if none appears the
/// result is `OracleFailure`.
pub fn decode_decision(node: &str, raw: &str, allowed: &[String]) -> Result<RoutingDecision> {
    if let Some(reply) = parse_json::<DecisionReply>(raw) {
        let route = match_label(&reply.next, allowed).ok_or_else(|| CadreError::InvalidDecision {
            node: node.to_string(),
            label: reply.next.trim().to_string(),
        })?;
        return Ok(RoutingDecision {
            route,
            justification: reply.reasoning,
        });
    }

    match find_label(raw, allowed) {
        Some(route) => Ok(RoutingDecision {
            route,
            justification: raw.trim().to_string(),
        }),
        None => Err(CadreError::OracleFailure(format!(
            "no declared label in reply: {}",
            truncate(raw.trim(), 120)
        ))),
    }
}

/// Parse a JSON object out of a reply, tolerating markdown code fences.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).ok()
}

/// Exact match of a label against the declared set.
pub(crate) fn match_label(label: &str, allowed: &[String]) -> Option<Route> {
    let route = Route::from_label(label);
    allowed
        .iter()
        .any(|a| a.as_str() == route.label())
        .then_some(route)
}

/// Best-effort scan: the declared label that appears first in free text.
fn find_label(text: &str, allowed: &[String]) -> Option<Route> {
    let mut best: Option<(usize, &str)> = None;
    for label in allowed {
        let pattern = if label == END_LABEL {
            format!(r"\b{}\b|\bEND\b", regex::escape(END_LABEL))
        } else {
            format!(r"(?i)\b{}\b", regex::escape(label))
        };
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if let Some(m) = re.find(text) {
            if best.map_or(true, |(pos, _)| m.start() < pos) {
                best = Some((m.start(), label.as_str()));
            }
        }
    }
    best.map(|(_, label)| Route::from_label(label))
}

/// Classify a decode or oracle error for the fallback event.
pub(crate) fn fallback_reason(e: &CadreError) -> FallbackReason {
    match e {
        CadreError::InvalidDecision { .. } => FallbackReason::InvalidDecision,
        _ => FallbackReason::OracleFailure,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
