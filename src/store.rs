use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::InitError;
use crate::flag::FlagValue;
use crate::remote::{ChangeListener, RemoteFlagClient};
use crate::snapshot::FlagSnapshot;
use crate::status::FlagStoreStatus;

/// Published to observers on every status transition.
///
/// `generation` increases by one per transition, so repeated `Changed` events can be told apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreEvent {
    pub status: FlagStoreStatus,
    pub generation: u64,
}

/// Receives [StoreEvent]s synchronously from inside the callback that caused them.
///
/// Observers run after the store's state is updated and without any store lock held, so they may
/// read the store freely.
pub trait StoreObserver: Send + Sync {
    fn on_transition(&self, event: &StoreEvent);
}

impl<F> StoreObserver for F
where
    F: Fn(&StoreEvent) + Send + Sync,
{
    fn on_transition(&self, event: &StoreEvent) {
        self(event)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct StoreState {
    status: FlagStoreStatus,
    snapshot: Option<FlagSnapshot>,
    error: bool,
    last_error: Option<InitError>,
    last_updated: Option<DateTime<Utc>>,
    generation: u64,
    cycle: u64,
}

pub(crate) struct StoreInner {
    client: Arc<dyn RemoteFlagClient>,
    state: RwLock<StoreState>,
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn StoreObserver>)>>,
    next_subscription: AtomicU64,
    events: watch::Sender<StoreEvent>,
    delivered: AtomicU64,
}

impl StoreInner {
    /// Bumps the generation and publishes the new event to `watch` receivers. Called with the
    /// state write lock held so the channel never falls behind the state.
    fn next_event(&self, state: &mut StoreState) -> StoreEvent {
        state.generation += 1;
        let event = StoreEvent {
            status: state.status,
            generation: state.generation,
        };
        self.events.send_replace(event);
        event
    }

    fn begin_cycle(&self) -> (u64, StoreEvent) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.cycle += 1;
        state.status = FlagStoreStatus::Loading;
        state.error = false;
        state.last_error = None;
        let event = self.next_event(&mut state);
        (state.cycle, event)
    }

    pub(crate) fn apply_change(&self, snapshot: FlagSnapshot) {
        let event = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let status = FlagStoreStatus::after_change(state.snapshot.as_ref());
            debug!(
                "flag store {} -> {} ({} flags)",
                state.status,
                status,
                snapshot.len()
            );
            state.status = status;
            state.snapshot = Some(snapshot);
            state.last_updated = Some(Utc::now());
            self.next_event(&mut state)
        };
        self.publish(event);
    }

    pub(crate) fn apply_error(&self, cycle: u64, error: InitError) {
        let event = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.cycle != cycle {
                debug!(
                    "ignoring failure of superseded initialization cycle {}: {}",
                    cycle, error
                );
                return;
            }
            warn!("flag store initialization failed: {}", error);
            state.status = FlagStoreStatus::after_error();
            state.error = true;
            state.last_error = Some(error);
            self.next_event(&mut state)
        };
        self.publish(event);
    }

    /// Hands `event` to the observers unless a newer event has already been delivered, which
    /// happens when an observer triggers a transition itself or two callbacks race.
    fn publish(&self, event: StoreEvent) {
        if self.delivered.fetch_max(event.generation, Ordering::AcqRel) > event.generation {
            debug!("dropping superseded store event {:?}", event);
            return;
        }
        let observers: Vec<Arc<dyn StoreObserver>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            if self.delivered.load(Ordering::Acquire) > event.generation {
                break;
            }
            observer.on_transition(&event);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the flags this client currently believes in, kept in sync with the remote service.
///
/// The store is an explicit value rather than a global: construct one at startup and hand clones
/// to whoever needs to read flags. Only the [RemoteFlagClient]'s callbacks write to it; every
/// public method here is a read, apart from [FlagStore::initialize] which starts a new cycle.
#[derive(Clone)]
pub struct FlagStore {
    inner: Arc<StoreInner>,
}

impl FlagStore {
    pub fn new(client: Arc<dyn RemoteFlagClient>) -> Self {
        let initial = StoreEvent {
            status: FlagStoreStatus::Loading,
            generation: 0,
        };
        let (events, _) = watch::channel(initial);
        Self {
            inner: Arc::new(StoreInner {
                client,
                state: RwLock::new(StoreState {
                    status: initial.status,
                    snapshot: None,
                    error: false,
                    last_error: None,
                    last_updated: None,
                    generation: initial.generation,
                    cycle: 0,
                }),
                observers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
                events,
                delivered: AtomicU64::new(initial.generation),
            }),
        }
    }

    /// Start connecting the remote client.
    ///
    /// The status is `Loading` (and observers have heard about it) by the time this returns.
    /// Failures never reach the caller; they show up as the `Error` status. Calling this again
    /// starts a fresh cycle: the error flag is cleared, the current snapshot is kept, and any
    /// late failure from the previous cycle is ignored.
    ///
    /// The connection runs as a task on the current tokio runtime. Outside a runtime the cycle
    /// fails immediately with [InitError::NoRuntime].
    pub fn initialize(&self, config: ClientConfig) -> InitHandle {
        let (cycle, event) = self.inner.begin_cycle();
        info!(
            "initializing flags for environment {} from {}",
            config.environment_key, config.endpoint
        );
        self.inner.publish(event);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.inner.apply_error(cycle, InitError::NoRuntime);
                return InitHandle { task: None };
            }
        };

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            if let Err(e) = config.validate() {
                inner.apply_error(cycle, e.into());
                return;
            }
            let client = Arc::clone(&inner.client);
            let listener = ChangeListener::new(&inner);
            // Run the client in its own task so a panicking client still ends the cycle.
            let outcome =
                tokio::spawn(async move { client.init(&config, listener).await }).await;
            match outcome {
                Ok(Ok(())) => info!("flag client initialized (cycle {})", cycle),
                Ok(Err(e)) => inner.apply_error(cycle, e.into()),
                Err(e) => {
                    warn!("flag client initialization task failed: {}", e);
                    inner.apply_error(cycle, InitError::Aborted);
                }
            }
        });
        InitHandle { task: Some(task) }
    }

    /// The most recently delivered snapshot, or `None` before the first delivery.
    pub fn get_snapshot(&self) -> Option<FlagSnapshot> {
        self.inner.read().snapshot.clone()
    }

    pub fn get_status(&self) -> FlagStoreStatus {
        self.inner.read().status
    }

    /// Set when an initialization cycle fails; stays set until the next [FlagStore::initialize].
    pub fn has_error(&self) -> bool {
        self.inner.read().error
    }

    pub fn last_error(&self) -> Option<InitError> {
        self.inner.read().last_error.clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_updated
    }

    pub fn is_enabled(&self, flag: &str) -> bool {
        self.inner
            .read()
            .snapshot
            .as_ref()
            .map(|s| s.is_enabled(flag))
            .unwrap_or(false)
    }

    pub fn value(&self, flag: &str) -> Option<FlagValue> {
        self.inner
            .read()
            .snapshot
            .as_ref()
            .and_then(|s| s.value(flag).cloned())
    }

    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(other, _)| *other != id);
        observers.len() != before
    }

    /// The latest [StoreEvent], for consumers that prefer to await changes.
    pub fn watch(&self) -> watch::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for FlagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        f.debug_struct("FlagStore")
            .field("status", &state.status)
            .field("flags", &state.snapshot.as_ref().map(FlagSnapshot::len))
            .field("error", &state.error)
            .finish()
    }
}

/// Tracks the background task started by [FlagStore::initialize].
///
/// Dropping the handle does not cancel initialization.
#[derive(Debug)]
pub struct InitHandle {
    task: Option<JoinHandle<()>>,
}

impl InitHandle {
    /// Wait until the cycle has either resolved or been recorded as an error.
    pub async fn wait(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!("flag store initialization task did not complete: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }
}
