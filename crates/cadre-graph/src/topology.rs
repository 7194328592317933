use std::sync::Arc;

use tracing::debug;

use cadre_core::config::{EngineConfig, NodeConfig, TopologyConfig};
use cadre_core::error::Result;
use cadre_core::traits::Oracle;
use cadre_core::types::Route;

use crate::executor::Graph;
use crate::handoff::Delegator;
use crate::peer::Peer;
use crate::supervisor::{Fallback, Supervisor};
use crate::team::Team;
use crate::worker::Worker;

/// Build a runnable graph from its TOML description.
///
/// Every node consults `oracle`. Teams are built recursively and inherit
/// `engine` unless their own `[engine]` table overrides it.
pub fn build_topology(
    topology: &TopologyConfig,
    oracle: Arc<dyn Oracle>,
    engine: &EngineConfig,
) -> Result<Graph> {
    let config = topology.engine.clone().unwrap_or_else(|| engine.clone());
    let mut builder = Graph::builder(topology.name.clone())
        .entry(topology.entry.clone())
        .config(config.clone());

    for node in &topology.nodes {
        debug!(graph = %topology.name, node = %node.name(), "Building node");
        builder = match node {
            NodeConfig::Worker {
                name,
                prompt,
                supervisor,
            } => {
                let mut worker = Worker::new(name.clone(), supervisor.clone(), oracle.clone());
                if let Some(prompt) = prompt {
                    worker = worker.with_prompt(prompt.clone());
                }
                builder.node(worker)
            }
            NodeConfig::Supervisor {
                name,
                prompt,
                children,
                fallback,
            } => {
                let mut supervisor = Supervisor::new(name.clone(), oracle.clone())
                    .with_fallback(Fallback::from_label(fallback.as_deref()))
                    .with_context_window(config.context_window);
                for child in children {
                    supervisor = supervisor.child(child.name.clone(), child.description.clone());
                }
                if let Some(prompt) = prompt {
                    supervisor = supervisor.with_prompt(prompt.clone());
                }
                builder.node(supervisor)
            }
            NodeConfig::Peer {
                name,
                prompt,
                peers,
                fallback,
            } => {
                let mut peer = Peer::new(name.clone(), Route::from_label(fallback), oracle.clone());
                for p in peers {
                    peer = peer.peer(p.clone());
                }
                if let Some(prompt) = prompt {
                    peer = peer.with_prompt(prompt.clone());
                }
                builder.node(peer)
            }
            NodeConfig::Team {
                name,
                returns_to,
                graph,
            } => {
                let inner = build_topology(graph, oracle.clone(), &config)?;
                builder.node(Team::new(name.clone(), inner, returns_to.clone()))
            }
            NodeConfig::Delegator {
                name,
                prompt,
                specialists,
                scope,
                fallback,
            } => {
                let mut delegator = Delegator::new(name.clone(), oracle.clone())
                    .with_scope(*scope)
                    .with_context_window(config.context_window);
                if let Some(fallback) = fallback {
                    delegator = delegator.with_fallback(Route::from_label(fallback));
                }
                for s in specialists {
                    delegator = delegator.specialist(s.name.clone(), s.description.clone());
                }
                if let Some(prompt) = prompt {
                    delegator = delegator.with_prompt(prompt.clone());
                }
                builder.node(delegator)
            }
        };
    }

    builder.build()
}
