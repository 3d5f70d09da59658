#![cfg(test)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::config::ClientConfig;
use crate::error::{QueryError, RemoteError};
use crate::readiness::{EnvironmentStatus, EnvironmentStatusSource};
use crate::remote::{ChangeListener, RemoteFlagClient};
use crate::snapshot::FlagSnapshot;
use crate::status::FlagStoreStatus;
use crate::store::{StoreEvent, StoreObserver};

/// How one call to [ScriptedRemoteClient::init] ends.
pub enum InitOutcome {
    Resolve {
        after: Duration,
        snapshot: FlagSnapshot,
    },
    Reject {
        after: Duration,
        error: RemoteError,
    },
    Panic,
}

/// A remote flag client that plays back one [InitOutcome] per `init` call. Calls past the end of
/// the script resolve immediately without delivering anything.
pub struct ScriptedRemoteClient {
    outcomes: Mutex<VecDeque<InitOutcome>>,
    listener: Mutex<Option<ChangeListener>>,
    configs: Mutex<Vec<ClientConfig>>,
}

impl ScriptedRemoteClient {
    pub fn new(outcomes: Vec<InitOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            listener: Mutex::new(None),
            configs: Mutex::new(Vec::new()),
        }
    }

    /// Simulates a realtime or polled update arriving after initialization.
    pub fn push_change(&self, snapshot: FlagSnapshot) {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .clone()
            .expect("init has not been called");
        listener.notify(snapshot);
    }

    pub fn configs(&self) -> Vec<ClientConfig> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteFlagClient for ScriptedRemoteClient {
    async fn init(&self, config: &ClientConfig, listener: ChangeListener) -> Result<(), RemoteError> {
        self.configs.lock().unwrap().push(config.clone());
        *self.listener.lock().unwrap() = Some(listener.clone());
        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(InitOutcome::Resolve { after, snapshot }) => {
                sleep(after).await;
                listener.notify(snapshot);
                Ok(())
            }
            Some(InitOutcome::Reject { after, error }) => {
                sleep(after).await;
                Err(error)
            }
            Some(InitOutcome::Panic) => panic!("scripted client panic"),
            None => Ok(()),
        }
    }
}

/// A readiness source that answers from a script, repeating the last answer once the script runs
/// out. An empty script never answers.
pub struct ScriptedStatusSource {
    responses: Mutex<VecDeque<Result<EnvironmentStatus, QueryError>>>,
    last: Mutex<Option<Result<EnvironmentStatus, QueryError>>>,
    latency: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedStatusSource {
    pub fn new(responses: Vec<Result<EnvironmentStatus, QueryError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Environment ids queried and when each query started.
    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl EnvironmentStatusSource for ScriptedStatusSource {
    async fn environment_status(
        &self,
        environment_id: &str,
    ) -> Result<EnvironmentStatus, QueryError> {
        self.calls
            .lock()
            .unwrap()
            .push((environment_id.to_string(), Instant::now()));
        let next = {
            let mut responses = self.responses.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(response) = responses.pop_front() {
                *last = Some(response);
            }
            last.clone()
        };
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        match next {
            Some(response) => response,
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<StoreEvent>>,
}

impl RecordingObserver {
    pub fn statuses(&self) -> Vec<FlagStoreStatus> {
        self.events.lock().unwrap().iter().map(|e| e.status).collect()
    }
}

impl StoreObserver for RecordingObserver {
    fn on_transition(&self, event: &StoreEvent) {
        self.events.lock().unwrap().push(*event);
    }
}
