use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use cadre_core::config::EngineConfig;
use cadre_core::error::{CadreError, Result};
use cadre_core::types::{GraphEvent, Message, MessageLog, Route, RunFailure, RunId, RunStatus};

use crate::handoff::Handoff;
use crate::node::{Node, RunContext, Transition};

/// Result of executing a graph. The log is always present, whatever the status.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Initial messages followed by every delta, in order.
    pub log: MessageLog,
    /// Charged dispatches in the top-level graph. Routing-only nodes are free.
    pub steps: usize,
    /// Visited node names, in dispatch order.
    pub trace: Vec<String>,
    /// Total execution time in milliseconds.
    pub total_elapsed_ms: u64,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}

/// How a (possibly nested) run left the loop.
#[derive(Debug)]
pub(crate) enum Exit {
    Finished(RunStatus),
    /// A handoff this graph cannot resolve, passed up to the parent graph.
    Escalate(Handoff),
}

/// Dispatch bookkeeping for one graph run.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub steps: usize,
    /// Routing-only dispatches since the last charged one.
    pub routing: usize,
    pub trace: Vec<String>,
}

/// A named set of nodes with a designated entry.
///
/// A graph holds no run state: every run gets its own log and progress, so a
/// single graph can be shared by concurrent runs and nested in teams.
pub struct Graph {
    name: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    entry: String,
    config: EngineConfig,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.node_names())
            .field("config", &self.config)
            .finish()
    }
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names, sorted.
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Execute the graph from its entry with a fresh context.
    pub async fn run(&self, initial: Vec<Message>) -> RunOutcome {
        self.run_with(initial, &RunContext::new()).await
    }

    /// Execute the graph from its entry.
    ///
    /// The run ends when a node routes to the terminal sentinel, the step
    /// budget is spent, the context is cancelled, or wiring fails at run time.
    pub async fn run_with(&self, initial: Vec<Message>, ctx: &RunContext) -> RunOutcome {
        let start = Instant::now();
        let run_id = RunId::new();
        ctx.emit(GraphEvent::RunStarted {
            run_id: run_id.clone(),
            graph: self.name.clone(),
        });
        info!(run_id = %run_id, graph = %self.name, "Run started");

        let mut log = MessageLog::from(initial);
        let mut progress = Progress::default();
        let status = match self.drive(&mut log, ctx, &mut progress, false).await {
            Exit::Finished(status) => status,
            Exit::Escalate(handoff) => {
                RunStatus::Failed(RunFailure::UnresolvedHandoff(handoff.target))
            }
        };

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            graph = %self.name,
            status = %status,
            steps = progress.steps,
            messages = log.len(),
            total_elapsed_ms,
            "Run finished"
        );
        ctx.emit(GraphEvent::RunFinished {
            run_id: run_id.clone(),
            graph: self.name.clone(),
            status: status.clone(),
            steps: progress.steps,
        });

        RunOutcome {
            run_id,
            status,
            log,
            steps: progress.steps,
            trace: progress.trace,
            total_elapsed_ms,
        }
    }

    /// The dispatch loop. `nested` is set when the graph runs inside a team,
    /// which allows unresolved handoffs to escape to the parent.
    pub(crate) async fn drive(
        &self,
        log: &mut MessageLog,
        ctx: &RunContext,
        progress: &mut Progress,
        nested: bool,
    ) -> Exit {
        let mut current = Route::To(self.entry.clone());
        // Set when a task-scoped handoff gives the next node a fresh log.
        let mut scoped: Option<Vec<Message>> = None;

        loop {
            let name = match current {
                Route::End => return Exit::Finished(RunStatus::Completed),
                Route::To(ref name) => name.clone(),
            };

            if ctx.is_cancelled() {
                info!(graph = %self.name, steps = progress.steps, "Run cancelled");
                return Exit::Finished(RunStatus::Cancelled);
            }

            // A chain of routers that never reaches a working node is cut off
            // by the same limit.
            if progress.steps >= self.config.max_steps
                || progress.routing >= self.config.max_steps
            {
                warn!(
                    graph = %self.name,
                    max_steps = self.config.max_steps,
                    "Step budget exhausted, terminating graph"
                );
                return Exit::Finished(RunStatus::StepBudgetExceeded);
            }

            let node = match self.nodes.get(&name) {
                Some(node) => node,
                None => {
                    error!(graph = %self.name, node = %name, "Node not found in graph");
                    return Exit::Finished(RunStatus::Failed(RunFailure::UnknownNode(name)));
                }
            };

            if node.routes_only() {
                progress.routing += 1;
            } else {
                progress.steps += 1;
                progress.routing = 0;
            }
            progress.trace.push(name.clone());
            let dispatch = progress.trace.len();
            info!(graph = %self.name, node = %name, step = dispatch, "Executing graph node");
            ctx.emit(GraphEvent::NodeStarted {
                graph: self.name.clone(),
                node: name.clone(),
                step: dispatch,
            });

            let output = match scoped.take() {
                Some(input) => node.step(&input, ctx).await,
                None => node.step(log.snapshot(), ctx).await,
            };

            let appended = output.delta.len();
            log.append(output.delta);

            match output.transition {
                Transition::Route(route) => {
                    debug!(
                        graph = %self.name,
                        from = %name,
                        to = %route,
                        appended,
                        "Node complete"
                    );
                    ctx.emit(GraphEvent::Routed {
                        graph: self.name.clone(),
                        from: name,
                        to: route.clone(),
                        appended,
                    });
                    current = route;
                }
                Transition::Handoff(handoff) => {
                    if self.nodes.contains_key(&handoff.target) {
                        info!(
                            graph = %self.name,
                            from = %name,
                            target = %handoff.target,
                            escalated = handoff.escalated,
                            "Handoff resolved"
                        );
                        ctx.emit(GraphEvent::HandoffResolved {
                            graph: self.name.clone(),
                            from: name,
                            target: handoff.target.clone(),
                            escalated: handoff.escalated,
                        });
                        scoped = handoff.scoped_log();
                        current = Route::To(handoff.target);
                    } else if nested && !handoff.escalated {
                        debug!(
                            graph = %self.name,
                            target = %handoff.target,
                            "Handoff escapes to parent graph"
                        );
                        return Exit::Escalate(handoff.escalate());
                    } else {
                        error!(
                            graph = %self.name,
                            from = %name,
                            target = %handoff.target,
                            "Handoff target not found"
                        );
                        return Exit::Finished(RunStatus::Failed(RunFailure::UnresolvedHandoff(
                            handoff.target,
                        )));
                    }
                }
                Transition::Abort(failure) => {
                    error!(graph = %self.name, node = %name, error = %failure, "Nested run failed");
                    return Exit::Finished(RunStatus::Failed(failure));
                }
            }
        }
    }
}

/// Run `graph` on `initial` with a fresh context.
pub async fn run(graph: &Graph, initial: Vec<Message>) -> RunOutcome {
    graph.run(initial).await
}

/// Collects nodes and validates the wiring before a graph can run.
pub struct GraphBuilder {
    name: String,
    entry: Option<String>,
    nodes: Vec<Arc<dyn Node>>,
    config: EngineConfig,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            nodes: vec![],
            config: EngineConfig::default(),
        }
    }

    /// Set the entry node.
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Register a node.
    pub fn node(self, node: impl Node) -> Self {
        self.add_node(Arc::new(node))
    }

    /// Register a shared node.
    pub fn add_node(mut self, node: Arc<dyn Node>) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.config.max_steps = max_steps;
        self
    }

    /// Validate and build.
    ///
    /// Fails when the entry is missing or unknown, a name is registered twice
    /// or reserved for termination, or a node declares a destination that is
    /// not registered here.
    pub fn build(self) -> Result<Graph> {
        let entry = self
            .entry
            .ok_or_else(|| CadreError::Config(format!("graph '{}' has no entry node", self.name)))?;

        let mut nodes: HashMap<String, Arc<dyn Node>> = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            let name = node.name().to_string();
            if Route::is_end_label(&name) {
                return Err(CadreError::Config(format!(
                    "node name '{}' in graph '{}' is reserved for termination",
                    name, self.name
                )));
            }
            if nodes.contains_key(&name) {
                return Err(CadreError::DuplicateNode(name));
            }
            nodes.insert(name, node);
        }

        if !nodes.contains_key(&entry) {
            return Err(CadreError::UnknownNode(format!(
                "{} (entry of graph '{}')",
                entry, self.name
            )));
        }

        for node in nodes.values() {
            for dest in node.destinations() {
                if let Route::To(target) = dest {
                    if !nodes.contains_key(&target) {
                        return Err(CadreError::UnknownNode(format!(
                            "{} (destination of '{}' in graph '{}')",
                            target,
                            node.name(),
                            self.name
                        )));
                    }
                }
            }
        }

        debug!(graph = %self.name, nodes = nodes.len(), entry = %entry, "Graph built");
        Ok(Graph {
            name: self.name,
            nodes,
            entry,
            config: self.config,
        })
    }
}
