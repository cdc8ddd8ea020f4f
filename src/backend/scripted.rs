//! In-process event channel for tests.
//!
//! Responses are queued per command name. A command can be held in flight
//! until the test releases it, which lets tests interleave notifications with
//! a suspended command.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, oneshot, Mutex};

use super::{EventChannel, RawNotification};
use crate::error::BackendError;

pub(crate) struct ScriptedChannel {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, BackendError>>>>,
    gates: Mutex<HashMap<String, VecDeque<oneshot::Receiver<()>>>>,
    calls: Mutex<Vec<(String, Value)>>,
    events_tx: broadcast::Sender<RawNotification>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            responses: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    pub async fn respond_ok(&self, command: &str, value: Value) {
        self.push(command, Ok(value)).await;
    }

    pub async fn respond_err(&self, command: &str, err: BackendError) {
        self.push(command, Err(err)).await;
    }

    async fn push(&self, command: &str, response: Result<Value, BackendError>) {
        self.responses
            .lock()
            .await
            .entry(command.to_string())
            .or_default()
            .push_back(response);
    }

    /// Hold the next invocation of `command` until the returned sender fires.
    pub async fn hold(&self, command: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates
            .lock()
            .await
            .entry(command.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(name, _)| name == command)
            .count()
    }

    pub fn emit(&self, notification: RawNotification) {
        let _ = self.events_tx.send(notification);
    }
}

#[async_trait]
impl EventChannel for ScriptedChannel {
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, BackendError> {
        self.calls.lock().await.push((command.to_string(), args));

        let gate = self
            .gates
            .lock()
            .await
            .get_mut(command)
            .and_then(|queue| queue.pop_front());
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        self.responses
            .lock()
            .await
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(Value::Null))
    }

    fn subscribe(&self) -> broadcast::Receiver<RawNotification> {
        self.events_tx.subscribe()
    }
}
