use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use cadre_core::event::EventBus;
use cadre_core::types::{FallbackReason, GraphEvent, Message, Route, RunFailure, RunStatus};
use cadre_graph::{
    Delegator, Fallback, Graph, Node, Peer, RunContext, ScriptedOracle, StepOutput, Supervisor,
    Team, Worker,
};
use cadre_test_utils::{user_log, FixedOracle};

fn contents(log: &cadre_core::types::MessageLog) -> Vec<String> {
    log.iter().map(|m| m.content.clone()).collect()
}

fn research_graph(oracle: Arc<ScriptedOracle>) -> Graph {
    Graph::builder("research")
        .entry("supervisor")
        .node(
            Supervisor::new("supervisor", oracle.clone())
                .child("search_agent", "Searches the web")
                .child("writer_agent", "Writes the report"),
        )
        .node(Worker::new("search_agent", "supervisor", oracle.clone()))
        .node(Worker::new("writer_agent", "supervisor", oracle))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_completed_log_extends_initial_log() {
    let oracle = Arc::new(ScriptedOracle::new(
        vec![
            r#"{"next": "search_agent", "reasoning": "need facts"}"#.into(),
            r#"{"next": "writer_agent", "reasoning": "write it up"}"#.into(),
            r#"{"next": "__end__", "reasoning": "done"}"#.into(),
        ],
        vec!["three sources found".into(), "final report".into()],
    ));
    let graph = research_graph(oracle);

    let initial = vec![Message::system("be brief"), Message::user("report on solar")];
    let outcome = cadre_graph::run(&graph, initial.clone()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(&outcome.log.snapshot()[..2], &initial[..]);
    assert_eq!(
        contents(&outcome.log),
        vec!["be brief", "report on solar", "three sources found", "final report"]
    );
    assert_eq!(
        outcome.trace,
        vec!["supervisor", "search_agent", "supervisor", "writer_agent", "supervisor"]
    );
}

#[tokio::test]
async fn test_undeclared_label_takes_fallback() {
    let oracle = Arc::new(FixedOracle::new(r#"{"next": "publisher", "reasoning": "ship it"}"#));
    let graph = Graph::builder("content")
        .entry("supervisor")
        .node(
            Supervisor::new("supervisor", oracle.clone())
                .child("editor", "Edits drafts")
                .with_fallback(Fallback::Route(Route::End)),
        )
        .node(Worker::new("editor", "supervisor", oracle))
        .build()
        .unwrap();

    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();
    let ctx = RunContext::new().with_events(bus.clone());
    let outcome = graph.run_with(user_log("publish the post"), &ctx).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.trace, vec!["supervisor"]);
    assert_eq!(outcome.log.len(), 1);

    let mut fallback = None;
    while let Ok(event) = rx.try_recv() {
        if let GraphEvent::FallbackTaken { reason, to, .. } = event {
            fallback = Some((reason, to));
        }
    }
    assert_eq!(fallback, Some((FallbackReason::InvalidDecision, Route::End)));
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let script = || {
        Arc::new(ScriptedOracle::new(
            vec![
                "search_agent".into(),
                "writer_agent".into(),
                "search_agent".into(),
                "__end__".into(),
            ],
            vec![],
        ))
    };

    let first = research_graph(script()).run(user_log("climate")).await;
    let second = research_graph(script()).run(user_log("climate")).await;

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.trace, second.trace);
    assert_eq!(first.log.len(), second.log.len());
    assert_eq!(first.log.len(), 4);
}

#[tokio::test]
async fn test_step_budget_is_exact() {
    let oracle = Arc::new(FixedOracle::new("").with_generation("still thinking"));
    let graph = Graph::builder("loop")
        .entry("a")
        .node(Peer::new("a", Route::to("b"), oracle.clone()).peer("b"))
        .node(Peer::new("b", Route::to("a"), oracle).peer("a"))
        .max_steps(5)
        .build()
        .unwrap();

    let outcome = graph.run(user_log("go")).await;
    assert_eq!(outcome.status, RunStatus::StepBudgetExceeded);
    assert_eq!(outcome.steps, 5);
    assert_eq!(outcome.log.len(), 1 + 5);
    assert_eq!(outcome.trace, vec!["a", "b", "a", "b", "a"]);
}

#[tokio::test]
async fn test_team_delta_lands_in_order() {
    let top_oracle = Arc::new(ScriptedOracle::new(
        vec!["research_team".into(), "summarizer".into(), "__end__".into()],
        vec![],
    ));
    let team_graph = Graph::builder("research")
        .entry("worker_a")
        .node(Peer::new(
            "worker_a",
            Route::to("worker_b"),
            Arc::new(FixedOracle::new("").with_generation("A's findings")),
        ))
        .node(Peer::new(
            "worker_b",
            Route::End,
            Arc::new(FixedOracle::new("").with_generation("B's findings")),
        ))
        .build()
        .unwrap();

    let graph = Graph::builder("main")
        .entry("top")
        .node(
            Supervisor::new("top", top_oracle)
                .child("research_team", "Research")
                .child("summarizer", "Summarize"),
        )
        .node(Team::new("research_team", team_graph, "top"))
        .node(Worker::new(
            "summarizer",
            "top",
            Arc::new(FixedOracle::new("").with_generation("summary")),
        ))
        .build()
        .unwrap();

    let outcome = graph.run(user_log("study batteries")).await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        contents(&outcome.log),
        vec!["study batteries", "A's findings", "B's findings", "summary"]
    );
    // The parent only ever sees the team's own name.
    assert_eq!(
        outcome.trace,
        vec!["top", "research_team", "top", "summarizer", "top"]
    );
}

/// Appends one message per call and cancels the run on its `cancel_on`-th call.
struct Ticker {
    name: String,
    next: Route,
    calls: Arc<AtomicUsize>,
    cancel_on: usize,
    token: CancellationToken,
}

impl Node for Ticker {
    fn name(&self) -> &str {
        &self.name
    }

    fn destinations(&self) -> Vec<Route> {
        vec![self.next.clone()]
    }

    fn step<'a>(&'a self, _log: &'a [Message], _ctx: &'a RunContext) -> BoxFuture<'a, StepOutput> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.cancel_on {
                self.token.cancel();
            }
            StepOutput::route(self.next.clone(), vec![Message::assistant(format!("step {}", n))])
        })
    }
}

#[tokio::test]
async fn test_cancellation_between_steps() {
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = Graph::builder("chain").entry("n1");
    for i in 1..=5 {
        let next = if i == 5 {
            Route::End
        } else {
            Route::to(format!("n{}", i + 1))
        };
        builder = builder.node(Ticker {
            name: format!("n{}", i),
            next,
            calls: calls.clone(),
            cancel_on: 2,
            token: token.clone(),
        });
    }
    let graph = builder.build().unwrap();

    let ctx = RunContext::new().with_cancel(token);
    let outcome = graph.run_with(user_log("count"), &ctx).await;

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(contents(&outcome.log), vec!["count", "step 1", "step 2"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn help_desk(specialist: &str) -> Graph {
    let team_graph = Graph::builder("help_desk")
        .entry("dispatcher")
        .node(
            Delegator::new(
                "dispatcher",
                Arc::new(FixedOracle::new(format!(
                    r#"{{"next": "{}", "reasoning": "outside our team"}}"#,
                    specialist
                ))),
            )
            .specialist(specialist, "Specialist"),
        )
        .build()
        .unwrap();

    Graph::builder("main")
        .entry("help_desk")
        .node(Team::new("help_desk", team_graph, "top"))
        .node(
            Supervisor::new("top", Arc::new(FixedOracle::new("__end__")))
                .child("help_desk", "Front desk")
                .child("math_agent", "Math"),
        )
        .node(Worker::new("math_agent", "top", Arc::new(ScriptedOracle::new(vec![], vec![]))))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_handoff_escalates_to_parent() {
    let graph = help_desk("math_agent");
    let outcome = graph.run(user_log("what is 2+2")).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.trace, vec!["help_desk", "math_agent", "top"]);
    assert_eq!(outcome.log.len(), 2);
    let answer = outcome.log.last().unwrap();
    assert_eq!(answer.origin.as_deref(), Some("math_agent"));
    // The specialist saw only the task description.
    assert_eq!(answer.content, "what is 2+2");
}

#[tokio::test]
async fn test_unresolvable_escalation_fails() {
    let graph = help_desk("legal_agent");
    let outcome = graph.run(user_log("review my lease")).await;

    assert_eq!(
        outcome.status,
        RunStatus::Failed(RunFailure::UnresolvedHandoff("legal_agent".into()))
    );
    assert_eq!(contents(&outcome.log), vec!["review my lease"]);
}

#[tokio::test]
async fn test_budget_counts_worker_turns() {
    let oracle = Arc::new(
        FixedOracle::new(r#"{"next": "w", "reasoning": "keep going"}"#).with_generation("work"),
    );
    let graph = Graph::builder("crew")
        .entry("sup")
        .node(Supervisor::new("sup", oracle.clone()).child("w", "Does the work"))
        .node(Worker::new("w", "sup", oracle))
        .max_steps(5)
        .build()
        .unwrap();

    let outcome = graph.run(user_log("go")).await;
    assert_eq!(outcome.status, RunStatus::StepBudgetExceeded);
    assert_eq!(outcome.steps, 5);
    assert_eq!(outcome.log.len(), 1 + 5);
    let from_worker = outcome
        .log
        .iter()
        .filter(|m| m.origin.as_deref() == Some("w"))
        .count();
    assert_eq!(from_worker, 5);
}

#[tokio::test]
async fn test_child_named_like_end_is_reachable() {
    let oracle = Arc::new(ScriptedOracle::new(
        vec![r#"{"next": "End", "reasoning": "wrap up"}"#.into(), "__end__".into()],
        vec!["closing remarks".into()],
    ));
    let graph = Graph::builder("show")
        .entry("host")
        .node(Supervisor::new("host", oracle.clone()).child("End", "Closes the show"))
        .node(Worker::new("End", "host", oracle))
        .build()
        .unwrap();

    let outcome = graph.run(user_log("start")).await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.trace, vec!["host", "End", "host"]);
    assert_eq!(contents(&outcome.log), vec!["start", "closing remarks"]);
}

#[tokio::test]
async fn test_failed_inner_team_aborts_every_parent() {
    // innermost: hands off to a specialist nobody has
    let innermost = Graph::builder("desk")
        .entry("dispatcher")
        .node(
            Delegator::new(
                "dispatcher",
                Arc::new(FixedOracle::new(r#"{"next": "ghost", "reasoning": "not ours"}"#)),
            )
            .specialist("ghost", "Nobody"),
        )
        .build()
        .unwrap();

    let middle = Graph::builder("department")
        .entry("prep")
        .node(Peer::new(
            "prep",
            Route::to("inner"),
            Arc::new(FixedOracle::new("").with_generation("prepared")),
        ))
        .node(Team::new("inner", innermost, "prep"))
        .build()
        .unwrap();

    let graph = Graph::builder("company")
        .entry("middle")
        .node(Team::new("middle", middle, "wrap"))
        .node(Peer::new(
            "wrap",
            Route::End,
            Arc::new(FixedOracle::new("").with_generation("wrapped")),
        ))
        .build()
        .unwrap();

    let outcome = graph.run(user_log("task")).await;
    assert_eq!(
        outcome.status,
        RunStatus::Failed(RunFailure::UnresolvedHandoff("ghost".into()))
    );
    // The middle team's partial delta is kept.
    assert_eq!(contents(&outcome.log), vec!["task", "prepared"]);
    assert_eq!(outcome.trace, vec!["middle"]);
}

/// Declares only END but routes somewhere else at run time.
struct Stray;

impl Node for Stray {
    fn name(&self) -> &str {
        "stray"
    }

    fn destinations(&self) -> Vec<Route> {
        vec![Route::End]
    }

    fn step<'a>(&'a self, _log: &'a [Message], _ctx: &'a RunContext) -> BoxFuture<'a, StepOutput> {
        Box::pin(async {
            StepOutput::route(Route::to("ghost"), vec![Message::assistant("wandering off")])
        })
    }
}

#[tokio::test]
async fn test_undeclared_runtime_route_fails() {
    let graph = Graph::builder("solo").entry("stray").node(Stray).build().unwrap();

    let outcome = graph.run(user_log("task")).await;
    assert_eq!(
        outcome.status,
        RunStatus::Failed(RunFailure::UnknownNode("ghost".into()))
    );
    assert_eq!(contents(&outcome.log), vec!["task", "wandering off"]);
    assert_eq!(outcome.steps, 1);
}
