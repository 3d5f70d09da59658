use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::config::ClientConfig;
use crate::error::RemoteError;
use crate::snapshot::FlagSnapshot;
use crate::store::StoreInner;

/// The SDK that talks to the flag evaluation service.
///
/// Implementations own the network connection, the local cache and any realtime subscription.
/// The [crate::FlagStore] only drives them through this trait.
#[async_trait]
pub trait RemoteFlagClient: Send + Sync {
    /// Connect using `config` and keep `listener` for the rest of the client's life.
    ///
    /// Every snapshot the client obtains, the first one included, must be delivered through
    /// [ChangeListener::notify]. The returned future resolves once the first snapshot has been
    /// delivered, or fails if the client gives up.
    async fn init(&self, config: &ClientConfig, listener: ChangeListener) -> Result<(), RemoteError>;
}

/// The `onChange` callback handed to a [RemoteFlagClient].
///
/// Holds only a weak reference, so a client that outlives its store just stops delivering.
#[derive(Clone)]
pub struct ChangeListener {
    store: Weak<StoreInner>,
}

impl ChangeListener {
    pub(crate) fn new(store: &Arc<StoreInner>) -> Self {
        Self {
            store: Arc::downgrade(store),
        }
    }

    /// Publish a new snapshot. Observers of the store are notified before this returns.
    pub fn notify(&self, snapshot: FlagSnapshot) {
        if let Some(store) = self.store.upgrade() {
            store.apply_change(snapshot);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.store.strong_count() > 0
    }
}

impl std::fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeListener")
            .field("attached", &self.is_attached())
            .finish()
    }
}
