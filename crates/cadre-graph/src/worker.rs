use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use cadre_core::traits::{Oracle, Tool};
use cadre_core::types::{Message, Route};

use crate::decision::parse_json;
use crate::node::{Node, RunContext, StepOutput};

/// Builds a tool's JSON arguments from the current log.
pub type ArgsBuilder = Arc<dyn Fn(&[Message]) -> serde_json::Value + Send + Sync>;

/// The capability a worker invokes once per step.
#[derive(Clone)]
pub enum WorkerAction {
    /// Free-form generation by the oracle.
    Generate(Arc<dyn Oracle>),
    /// A single domain tool call.
    Tool { tool: Arc<dyn Tool>, args: ArgsBuilder },
    /// The oracle picks tools turn by turn until it answers in plain text.
    ToolLoop {
        oracle: Arc<dyn Oracle>,
        tools: Vec<Arc<dyn Tool>>,
    },
}

/// Default bound on tool calls within one tool-loop step.
pub const DEFAULT_MAX_TOOL_TURNS: usize = 8;

/// A tool request inside a tool-loop reply.
#[derive(Debug, Deserialize)]
struct ToolCall {
    #[serde(alias = "name")]
    tool: String,
    #[serde(default, alias = "arguments", alias = "input")]
    args: serde_json::Value,
}

/// Produces content and always hands control back to its supervisor.
///
/// The return edge is fixed when the worker is built; nothing in the log can
/// change it.
pub struct Worker {
    name: String,
    prompt: String,
    supervisor: String,
    action: WorkerAction,
    max_tool_turns: usize,
}

impl Worker {
    /// A worker backed by oracle generation.
    pub fn new(
        name: impl Into<String>,
        supervisor: impl Into<String>,
        oracle: Arc<dyn Oracle>,
    ) -> Self {
        Self::with_action(name, supervisor, WorkerAction::Generate(oracle))
    }

    /// A worker backed by one tool call.
    pub fn with_tool<F>(
        name: impl Into<String>,
        supervisor: impl Into<String>,
        tool: Arc<dyn Tool>,
        args: F,
    ) -> Self
    where
        F: Fn(&[Message]) -> serde_json::Value + Send + Sync + 'static,
    {
        Self::with_action(
            name,
            supervisor,
            WorkerAction::Tool {
                tool,
                args: Arc::new(args),
            },
        )
    }

    /// A worker whose oracle may call any of `tools` before answering.
    pub fn with_tools(
        name: impl Into<String>,
        supervisor: impl Into<String>,
        oracle: Arc<dyn Oracle>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Self {
        Self::with_action(name, supervisor, WorkerAction::ToolLoop { oracle, tools })
    }

    pub fn with_action(
        name: impl Into<String>,
        supervisor: impl Into<String>,
        action: WorkerAction,
    ) -> Self {
        let name = name.into();
        Self {
            prompt: format!(
                "You are {}. Complete your part of the task described in the conversation.",
                name
            ),
            name,
            supervisor: supervisor.into(),
            action,
            max_tool_turns: DEFAULT_MAX_TOOL_TURNS,
        }
    }

    /// Set the system prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Bound the number of tool calls in one step of a tool-loop worker.
    pub fn with_max_tool_turns(mut self, max_tool_turns: usize) -> Self {
        self.max_tool_turns = max_tool_turns;
        self
    }

    pub fn supervisor(&self) -> &str {
        &self.supervisor
    }

    fn tool_prompt(&self, tools: &[Arc<dyn Tool>]) -> String {
        let listing: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect();
        format!(
            "{}\n\nYou can use these tools:\n{}\n\n\
             To call one, reply with only a JSON object \
             {{\"tool\": \"<name>\", \"args\": {{...}}}}. \
             When you are done, reply with your answer as plain text.",
            self.prompt.trim(),
            listing.join("\n")
        )
    }

    async fn run_tool(&self, tool: &dyn Tool, input: serde_json::Value) -> String {
        debug!(node = %self.name, tool = %tool.name(), %input, "Invoking tool");
        match tool.execute(input).await {
            Ok(output) => output,
            Err(e) => {
                warn!(node = %self.name, tool = %tool.name(), error = %e, "Tool failed");
                format!("Tool error: {}", e)
            }
        }
    }

    /// Alternate oracle turns and tool calls on a private scratch history.
    /// Only the final answer leaves the worker.
    async fn tool_loop(
        &self,
        oracle: &dyn Oracle,
        tools: &[Arc<dyn Tool>],
        log: &[Message],
    ) -> String {
        let prompt = self.tool_prompt(tools);
        let mut scratch = log.to_vec();

        for turn in 0..=self.max_tool_turns {
            let reply = match oracle.generate(prompt.clone(), scratch.clone()).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(node = %self.name, turn, error = %e, "Worker generation failed");
                    return format!("{} could not complete the task: {}", self.name, e);
                }
            };

            let Some(call) = parse_json::<ToolCall>(&reply) else {
                return reply;
            };
            if turn == self.max_tool_turns {
                break;
            }

            let result = match tools.iter().find(|t| t.name() == call.tool) {
                Some(tool) => self.run_tool(tool.as_ref(), call.args).await,
                None => {
                    warn!(node = %self.name, tool = %call.tool, "Oracle asked for an unknown tool");
                    format!("Tool error: no tool named '{}'", call.tool)
                }
            };
            scratch.push(Message::assistant(reply));
            scratch.push(Message::user(format!("Tool {} returned: {}", call.tool, result)));
        }

        warn!(node = %self.name, max_tool_turns = self.max_tool_turns, "Tool turn limit reached");
        format!(
            "{} stopped after {} tool calls without an answer",
            self.name, self.max_tool_turns
        )
    }

    async fn produce(&self, log: &[Message]) -> String {
        match &self.action {
            WorkerAction::Generate(oracle) => {
                match oracle.generate(self.prompt.clone(), log.to_vec()).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(node = %self.name, error = %e, "Worker generation failed");
                        format!("{} could not complete the task: {}", self.name, e)
                    }
                }
            }
            WorkerAction::Tool { tool, args } => self.run_tool(tool.as_ref(), args(log)).await,
            WorkerAction::ToolLoop { oracle, tools } => {
                self.tool_loop(oracle.as_ref(), tools, log).await
            }
        }
    }
}

impl Node for Worker {
    fn name(&self) -> &str {
        &self.name
    }

    fn destinations(&self) -> Vec<Route> {
        vec![Route::To(self.supervisor.clone())]
    }

    fn step<'a>(
        &'a self,
        log: &'a [Message],
        _ctx: &'a RunContext,
    ) -> BoxFuture<'a, StepOutput> {
        Box::pin(async move {
            let content = self.produce(log).await;
            let message = Message::assistant(content).from_node(self.name.clone());
            StepOutput::goto(self.supervisor.clone(), vec![message])
        })
    }
}
