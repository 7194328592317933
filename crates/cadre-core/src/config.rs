use std::path::Path;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CadreError, Result};

/// Top-level Cadre configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    /// Declarative topology of the top-level graph.
    #[serde(default)]
    pub graph: Option<TopologyConfig>,
}

/// Execution limits for a graph run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum charged dispatches before the run stops with `StepBudgetExceeded`.
    /// Routing-only nodes such as supervisors are not charged.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Number of trailing messages quoted in supervisor prompts.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            context_window: default_context_window(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

fn default_max_steps() -> usize { 150 }
fn default_context_window() -> usize { 3 }
fn default_event_capacity() -> usize { 256 }

/// Oracle call policy and the scripted replies used for dry runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Per-call timeout. No timeout when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Replies returned, in order, to routing requests.
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Replies returned, in order, to generation requests.
    #[serde(default)]
    pub generations: Vec<String>,
}

/// Retry configuration for oracle requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// A graph described in TOML: its nodes and entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub name: String,
    pub entry: String,
    /// Overrides the inherited engine limits for this graph only.
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// One node of a declarative topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Produces content, then always returns to `supervisor`.
    Worker {
        name: String,
        #[serde(default)]
        prompt: Option<String>,
        supervisor: String,
    },
    /// Routes among its children or ends the graph.
    Supervisor {
        name: String,
        #[serde(default)]
        prompt: Option<String>,
        children: Vec<ChildConfig>,
        /// Label taken when the oracle fails. First child when unset.
        #[serde(default)]
        fallback: Option<String>,
    },
    /// Produces content and names the next peer in one reply.
    Peer {
        name: String,
        #[serde(default)]
        prompt: Option<String>,
        peers: Vec<String>,
        fallback: String,
    },
    /// A nested graph exposed as a single node.
    Team {
        name: String,
        returns_to: String,
        graph: Box<TopologyConfig>,
    },
    /// Hands the task off to a specialist that may live in another graph.
    Delegator {
        name: String,
        #[serde(default)]
        prompt: Option<String>,
        specialists: Vec<ChildConfig>,
        #[serde(default)]
        scope: HandoffScope,
        #[serde(default)]
        fallback: Option<String>,
    },
}

impl NodeConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Worker { name, .. }
            | Self::Supervisor { name, .. }
            | Self::Peer { name, .. }
            | Self::Team { name, .. }
            | Self::Delegator { name, .. } => name,
        }
    }
}

/// A routing option with the description shown to the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// What a handoff target gets to see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffScope {
    /// The full current log.
    FullLog,
    /// A fresh log holding only the task description.
    #[default]
    Task,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CadreError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| CadreError::Config(e.to_string()))?;
        debug!(path = %path.display(), has_graph = config.graph.is_some(), "Loaded config");
        Ok(config)
    }
}

/// Substitute `${NAME}` with the value of environment variable `NAME`.
/// References to unset variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let Ok(pattern) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return input.to_string();
    };
    pattern
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CADRE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_CADRE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_CADRE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_CADRE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_CADRE_VAR}\"");
    }

    #[test]
    fn test_expand_env_vars_leaves_other_dollars() {
        std::env::set_var("TEST_CADRE_MODEL", "scripted");
        let input = concat!(
            "price = \"$5\"\n",
            "empty = \"${}\"\n",
            "model = \"${TEST_CADRE_MODEL}-${TEST_CADRE_MODEL}\"",
        );
        let result = expand_env_vars(input);
        assert_eq!(
            result,
            "price = \"$5\"\nempty = \"${}\"\nmodel = \"scripted-scripted\""
        );
        std::env::remove_var("TEST_CADRE_MODEL");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_steps, 150);
        assert_eq!(config.engine.context_window, 3);
        assert_eq!(config.engine.event_capacity, 256);
        assert!(config.oracle.timeout_secs.is_none());
        assert!(config.graph.is_none());
    }

    #[test]
    fn test_retry_defaults() {
        let toml_str = r#"
[oracle]
timeout_secs = 20

[oracle.retry]
max_retries = 5
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let retry = config.oracle.retry.unwrap();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_backoff_ms, 1000);
        assert_eq!(retry.max_backoff_ms, 30000);
        assert_eq!(config.oracle.timeout_secs, Some(20));
    }

    #[test]
    fn test_nested_team_topology() {
        let toml_str = r#"
[graph]
name = "main"
entry = "top"

[[graph.nodes]]
kind = "supervisor"
name = "top"
children = [{ name = "research_team", description = "Research tasks" }]

[[graph.nodes]]
kind = "team"
name = "research_team"
returns_to = "top"

[graph.nodes.graph]
name = "research"
entry = "research_supervisor"

[[graph.nodes.graph.nodes]]
kind = "supervisor"
name = "research_supervisor"
children = [{ name = "research_agent" }]
fallback = "__end__"

[[graph.nodes.graph.nodes]]
kind = "worker"
name = "research_agent"
supervisor = "research_supervisor"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let graph = config.graph.unwrap();
        assert_eq!(graph.entry, "top");
        assert_eq!(graph.nodes.len(), 2);

        match &graph.nodes[1] {
            NodeConfig::Team { name, returns_to, graph } => {
                assert_eq!(name, "research_team");
                assert_eq!(returns_to, "top");
                assert_eq!(graph.nodes.len(), 2);
                assert_eq!(graph.nodes[1].name(), "research_agent");
            }
            other => panic!("expected team, got {:?}", other),
        }
    }

    #[test]
    fn test_delegator_scope_default() {
        let toml_str = r#"
kind = "delegator"
name = "dispatcher"
specialists = [{ name = "math_agent" }]
"#;
        let node: NodeConfig = toml::from_str(toml_str).unwrap();
        match node {
            NodeConfig::Delegator { scope, .. } => assert_eq!(scope, HandoffScope::Task),
            other => panic!("expected delegator, got {:?}", other),
        }
    }
}
