//! Graph execution engine for supervised multi-agent orchestration.
//!
//! A graph is a set of named `Node`s with one entry. Each dispatch hands the
//! node a read-only view of the shared message log; the node returns the
//! messages it appends and where control goes next. Control ends when a node
//! routes to the terminal sentinel or the step budget runs out.
//!
//! Supervisors route among workers using an `Oracle`, workers always return
//! to their supervisor, peers name each other directly, and a `Team` nests a
//! whole graph behind a single node name. Delegators hand a task to a named
//! specialist, which may live one graph up.

pub mod decision;
pub mod executor;
pub mod handoff;
pub mod node;
pub mod oracle;
pub mod peer;
pub mod supervisor;
pub mod team;
pub mod topology;
pub mod worker;

pub use decision::{decode_decision, routing_prompt, Choice};
pub use executor::{run, Graph, GraphBuilder, RunOutcome};
pub use handoff::{Delegator, Handoff, HandoffInput};
pub use node::{Node, RunContext, StepOutput, Transition};
pub use oracle::{RetryingOracle, ScriptedOracle};
pub use peer::{Peer, FINAL_ANSWER};
pub use supervisor::{Fallback, Supervisor};
pub use team::Team;
pub use topology::build_topology;
pub use worker::{Worker, WorkerAction};
