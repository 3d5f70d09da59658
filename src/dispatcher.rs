use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::FlagStore;

/// A UI-originated command: `{"actionType": "...", ...payload}`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub action_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Command {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// A named subscriber on the [Dispatcher]. Handlers must tolerate action types they do not know.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command);
}

/// The flag store listens on the dispatcher but has no commands of its own yet.
impl CommandHandler for FlagStore {
    fn handle(&self, command: &Command) {
        debug!("flag store ignoring command {}", command.action_type);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatchToken(usize);

struct Registration {
    token: DispatchToken,
    name: String,
    handler: Arc<dyn CommandHandler>,
}

/// Fans commands out to every registered handler, in registration order.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<Vec<Registration>>,
    next_token: AtomicUsize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> DispatchToken {
        let token = DispatchToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        let name = name.into();
        debug!("registering command handler {}", name);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                token,
                name,
                handler,
            });
        token
    }

    pub fn unregister(&self, token: DispatchToken) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|r| r.token != token);
        handlers.len() != before
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn dispatch(&self, command: &Command) {
        // Handlers may dispatch or register in turn, so call them without the lock held.
        let handlers: Vec<Arc<dyn CommandHandler>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for handler in handlers {
            handler.handle(command);
        }
    }

    /// Decode and dispatch a raw command object.
    pub fn dispatch_json(&self, command: Value) -> Result<(), serde_json::Error> {
        let command: Command = serde_json::from_value(command)?;
        self.dispatch(&command);
        Ok(())
    }
}
