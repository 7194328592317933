use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::Message;

/// Decision-making and generation capability consulted by nodes.
///
/// Implementations are fallible, slow and non-deterministic; the graph never
/// trusts a reply without validating it.
pub trait Oracle: Send + Sync + 'static {
    /// Ask for a routing choice among `allowed` labels.
    ///
    /// The reply is expected to be a JSON object
    /// `{"next": "<label>", "reasoning": "<text>"}`. Anything else is decoded
    /// best-effort by the caller.
    fn decide(&self, prompt: String, allowed: Vec<String>) -> BoxFuture<'_, Result<String>>;

    /// Produce free-form text for a worker, given its prompt and the history.
    fn generate(&self, prompt: String, history: Vec<Message>) -> BoxFuture<'_, Result<String>>;
}

/// Domain capability a worker can invoke.
pub trait Tool: Send + Sync + 'static {
    /// Tool name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Execute the tool with structured arguments.
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<String>>;
}
