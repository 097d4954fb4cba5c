//! Turn executor seam
//!
//! The executor turns a coalesced message into a reply. It is slow, fallible
//! and owned by someone else; the orchestrator bounds it with a timeout and
//! never retries it.

use crate::error::ExecutorError;
use async_trait::async_trait;
use cadence_types::ConversationId;
use std::collections::VecDeque;
use std::time::Duration;

/// Everything the executor gets for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub message: String,
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub counterparty_id: String,
    pub is_audio: bool,
    pub timezone: Option<String>,
}

#[async_trait]
pub trait TurnExecutor: Send + Sync {
    /// Produce the reply text for one turn
    async fn execute_turn(&self, request: TurnRequest) -> Result<String, ExecutorError>;
}

/// Replies with the message it was given
///
/// Stand-in for local runs. Appends a score tag when configured so the scorer
/// has something to read.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor {
    score_tag: Option<f64>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(score: f64) -> Self {
        Self { score_tag: Some(score) }
    }
}

#[async_trait]
impl TurnExecutor for EchoExecutor {
    async fn execute_turn(&self, request: TurnRequest) -> Result<String, ExecutorError> {
        let mut reply = format!("You said: {}", request.message);
        if let Some(score) = self.score_tag {
            reply.push_str(&format!(" [Score: {score:.2}/100]"));
        }
        Ok(reply)
    }
}

/// Scripted outcome for [`ScriptedExecutor`]
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    Fail(String),
    /// Reply after sleeping (tokio time, so paused clocks apply)
    Delayed(Duration, String),
}

/// Test double: plays back scripted outcomes in order and records every request
///
/// Once the script runs out it echoes the message back.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: parking_lot::Mutex<VecDeque<Scripted>>,
    calls: parking_lot::Mutex<Vec<TurnRequest>>,
}

impl ScriptedExecutor {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: parking_lot::Mutex::new(script.into_iter().collect()),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn replying(reply: impl Into<String>) -> Self {
        Self::new([Scripted::Reply(reply.into())])
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new([Scripted::Fail(message.into())])
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().push_back(step);
    }

    pub fn calls(&self) -> Vec<TurnRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl TurnExecutor for ScriptedExecutor {
    async fn execute_turn(&self, request: TurnRequest) -> Result<String, ExecutorError> {
        let message = request.message.clone();
        self.calls.lock().push(request);
        let step = self.script.lock().pop_front();
        match step {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Fail(message)) => Err(ExecutorError::Failed(message)),
            Some(Scripted::Delayed(delay, reply)) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            None => Ok(message),
        }
    }
}
