//! Mocks and fixtures shared by the Cadre test suites.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use cadre_core::config::AppConfig;
use cadre_core::error::{CadreError, Result};
use cadre_core::traits::{Oracle, Tool};
use cadre_core::types::Message;

/// An oracle whose every call fails.
pub struct FailingOracle {
    message: String,
    calls: AtomicUsize,
}

impl FailingOracle {
    pub fn new() -> Self {
        Self::with_message("oracle unavailable")
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FailingOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl Oracle for FailingOracle {
    fn decide(&self, _prompt: String, _allowed: Vec<String>) -> BoxFuture<'_, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let message = self.message.clone();
        Box::pin(async move { Err(CadreError::OracleFailure(message)) })
    }

    fn generate(&self, _prompt: String, _history: Vec<Message>) -> BoxFuture<'_, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let message = self.message.clone();
        Box::pin(async move { Err(CadreError::OracleFailure(message)) })
    }
}

/// An oracle that gives the same answer to every call of a kind.
pub struct FixedOracle {
    decision: String,
    generation: String,
    decide_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl FixedOracle {
    /// `decision` is returned verbatim from every `decide` call.
    pub fn new(decision: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            generation: "done".to_string(),
            decide_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_generation(mut self, text: impl Into<String>) -> Self {
        self.generation = text.into();
        self
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Every prompt passed to `decide`, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Oracle for FixedOracle {
    fn decide(&self, prompt: String, _allowed: Vec<String>) -> BoxFuture<'_, Result<String>> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt);
        let reply = self.decision.clone();
        Box::pin(async move { Ok(reply) })
    }

    fn generate(&self, _prompt: String, _history: Vec<Message>) -> BoxFuture<'_, Result<String>> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.generation.clone();
        Box::pin(async move { Ok(reply) })
    }
}

/// A tool that records its inputs and returns a canned output.
pub struct RecordingTool {
    name: String,
    output: Option<String>,
    calls: Mutex<Vec<Value>>,
}

impl RecordingTool {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Some(output.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A tool whose every invocation errors.
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records its input"
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<String>> {
        self.calls.lock().unwrap().push(input);
        Box::pin(async move {
            match &self.output {
                Some(output) => Ok(output.clone()),
                None => Err(CadreError::Tool {
                    tool: self.name.clone(),
                    message: "service unreachable".to_string(),
                }),
            }
        })
    }
}

/// A log holding one user request.
pub fn user_log(text: &str) -> Vec<Message> {
    vec![Message::user(text)]
}

/// Parse an inline TOML config.
pub fn test_config(toml_str: &str) -> AppConfig {
    toml::from_str(toml_str).expect("invalid test config")
}

/// Write `contents` to a temporary config file and return its handle.
pub fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("failed to create temp config");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp config");
    file
}
