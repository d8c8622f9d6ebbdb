//! Mock change source for testing and development.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fuzzdeploy_reconcile::Token;
use tracing::info;

use super::{ChangeSource, SourceContext};
use crate::error::SourceError;
use crate::process::WorkerPort;

/// Shared, ordered record of source and worker events.
#[derive(Debug, Clone, Default)]
pub struct SourceLog(Arc<Mutex<Vec<String>>>);

impl SourceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push(&self, event: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.into());
    }

    /// All events so far.
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[derive(Debug, Default)]
struct MockState {
    token: String,
    identify_errors: VecDeque<String>,
    rebuild_errors: VecDeque<String>,
}

/// Source whose token and failures are controlled from outside.
///
/// Clones share state, so a test keeps one clone while the update loop owns
/// another. Records `identify:<name>` and `rebuild:<name>` into its log.
#[derive(Debug, Clone)]
pub struct MockSource {
    name: String,
    state: Arc<Mutex<MockState>>,
    log: SourceLog,
    port_probe: Option<WorkerPort>,
}

impl MockSource {
    /// Create a source reporting `token`.
    pub fn new(name: &str, token: &str, log: SourceLog) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockState {
                token: token.to_string(),
                ..MockState::default()
            })),
            log,
            port_probe: None,
        }
    }

    /// Also record `port_at_rebuild:<port>` on every rebuild.
    pub fn with_port_probe(mut self, port: WorkerPort) -> Self {
        self.port_probe = Some(port);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the reported token.
    pub fn set_token(&self, token: &str) {
        self.state().token = token.to_string();
    }

    /// Fail the next `identify` call.
    pub fn fail_next_identify(&self, message: &str) {
        self.state().identify_errors.push_back(message.to_string());
    }

    /// Fail the next `rebuild` call.
    pub fn fail_next_rebuild(&self, message: &str) {
        self.state().rebuild_errors.push_back(message.to_string());
    }
}

#[async_trait]
impl ChangeSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&mut self, _ctx: &mut SourceContext) -> Result<Token, SourceError> {
        self.log.push(format!("identify:{}", self.name));
        let mut state = self.state();
        if let Some(message) = state.identify_errors.pop_front() {
            return Err(SourceError::Task(message));
        }
        Ok(Token::new(state.token.clone()))
    }

    async fn rebuild(&mut self, _ctx: &mut SourceContext) -> Result<(), SourceError> {
        self.log.push(format!("rebuild:{}", self.name));
        if let Some(port) = &self.port_probe {
            self.log.push(format!("port_at_rebuild:{}", port.get()));
        }
        let error = self.state().rebuild_errors.pop_front();
        if let Some(message) = error {
            return Err(SourceError::Task(message));
        }
        info!(source = %self.name, "[MOCK] Rebuilt");
        Ok(())
    }
}
