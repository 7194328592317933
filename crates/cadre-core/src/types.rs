use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label the oracle uses to select termination.
pub const END_LABEL: &str = "__end__";

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single entry of the shared conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Name of the node that authored this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            origin: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Tag the message with the name of the node that produced it.
    pub fn from_node(mut self, node: impl Into<String>) -> Self {
        self.origin = Some(node.into());
        self
    }

    /// Render as `[origin] content`, or just the content for untagged messages.
    pub fn render(&self) -> String {
        match &self.origin {
            Some(origin) => format!("[{}] {}", origin, self.content),
            None => self.content.clone(),
        }
    }
}

/// Append-only, ordered conversation shared by every node of a run.
///
/// Entries are never removed or edited; corrections are appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append messages to the end, preserving their order.
    pub fn append(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The last `n` messages (fewer if the log is shorter).
    pub fn tail(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Messages appended at or after position `start`.
    pub fn since(&self, start: usize) -> &[Message] {
        &self.messages[start.min(self.messages.len())..]
    }

    /// Read-only view handed to nodes.
    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl From<Vec<Message>> for MessageLog {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

impl<'a> IntoIterator for &'a MessageLog {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

/// Where control goes after a node finishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Another node of the same graph.
    To(String),
    /// The terminal sentinel.
    End,
}

impl Route {
    pub fn to(name: impl Into<String>) -> Self {
        Self::To(name.into())
    }

    /// Parse an oracle label. Only `__end__` and the exact word `END` mean
    /// termination, so such names can never be used for nodes.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if Self::is_end_label(label) {
            Self::End
        } else {
            Self::To(label.to_string())
        }
    }

    pub fn is_end_label(label: &str) -> bool {
        matches!(label.trim(), END_LABEL | "END")
    }

    pub fn label(&self) -> &str {
        match self {
            Self::To(name) => name,
            Self::End => END_LABEL,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A supervisor's validated choice of the next node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub route: Route,
    pub justification: String,
}

/// Why a run stopped without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum RunFailure {
    #[error("Node '{0}' not found in graph")]
    UnknownNode(String),

    #[error("Handoff target '{0}' could not be resolved")]
    UnresolvedHandoff(String),
}

/// Terminal status of a run. Every status comes with the accumulated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    StepBudgetExceeded,
    Cancelled,
    Failed(RunFailure),
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::StepBudgetExceeded => f.write_str("step budget exceeded"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(failure) => write!(f, "failed: {}", failure),
        }
    }
}

/// Why a node fell back to its default route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    OracleFailure,
    InvalidDecision,
}

/// Graph event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// A graph run started.
    RunStarted { run_id: RunId, graph: String },
    /// A node is about to be dispatched.
    NodeStarted { graph: String, node: String, step: usize },
    /// A node finished and chose its successor.
    Routed {
        graph: String,
        from: String,
        to: Route,
        appended: usize,
    },
    /// A supervisor or peer took its declared fallback.
    FallbackTaken {
        node: String,
        reason: FallbackReason,
        detail: String,
        to: Route,
    },
    /// Supervisor rationale for the record.
    Decision {
        node: String,
        decision: RoutingDecision,
    },
    /// A handoff was dispatched into its target.
    HandoffResolved {
        graph: String,
        from: String,
        target: String,
        escalated: bool,
    },
    /// A team node began its internal run.
    TeamEntered { team: String },
    /// A team node finished its internal run.
    TeamExited {
        team: String,
        status: RunStatus,
        appended: usize,
    },
    /// A graph run finished.
    RunFinished {
        run_id: RunId,
        graph: String,
        status: RunStatus,
        steps: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_append_only_and_ordered() {
        let mut log = MessageLog::new();
        log.push(Message::user("first"));
        log.append(vec![Message::assistant("second"), Message::assistant("third")]);

        let contents: Vec<_> = log.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(log.last().map(|m| m.content.as_str()), Some("third"));
    }

    #[test]
    fn test_tail_and_since() {
        let log = MessageLog::from(vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::assistant("c"),
        ]);
        assert_eq!(log.tail(2).len(), 2);
        assert_eq!(log.tail(2)[0].content, "b");
        assert_eq!(log.tail(10).len(), 3);
        assert_eq!(log.since(1).len(), 2);
        assert!(log.since(7).is_empty());
    }

    #[test]
    fn test_render_with_origin() {
        let msg = Message::assistant("found it").from_node("research_agent");
        assert_eq!(msg.render(), "[research_agent] found it");
        assert_eq!(Message::user("hi").render(), "hi");
    }

    #[test]
    fn test_route_labels() {
        assert_eq!(Route::from_label("__end__"), Route::End);
        assert_eq!(Route::from_label(" END "), Route::End);
        assert_eq!(Route::from_label("End"), Route::to("End"));
        assert_eq!(Route::from_label("end"), Route::to("end"));
        assert_eq!(Route::from_label("editor"), Route::to("editor"));
        assert_eq!(Route::End.label(), END_LABEL);
        assert_eq!(Route::to("critic").to_string(), "critic");
    }

    #[test]
    fn test_log_serializes_as_array() {
        let mut msg = Message::user("hello");
        msg.timestamp = None;
        let log = MessageLog::from(vec![msg]);
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json, serde_json::json!([{"role": "user", "content": "hello"}]));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RunStatus::Completed.to_string(), "completed");
        let failed = RunStatus::Failed(RunFailure::UnknownNode("ghost".into()));
        assert_eq!(failed.to_string(), "failed: Node 'ghost' not found in graph");
    }
}
