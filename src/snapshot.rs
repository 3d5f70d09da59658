use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::flag::{FlagState, FlagValue};

/// The complete set of flag states known to the client at one point in time.
///
/// Snapshots are immutable; the store swaps whole snapshots rather than editing one in place.
/// Cloning only bumps a reference count, so readers can hold on to a snapshot while newer ones
/// are published.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlagSnapshot {
    flags: Arc<HashMap<String, FlagState>>,
}

impl FlagSnapshot {
    pub fn new(flags: HashMap<String, FlagState>) -> Self {
        Self {
            flags: Arc::new(flags),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn get(&self, name: &str) -> Option<&FlagState> {
        self.flags.get(name)
    }

    /// Unknown flags are treated as disabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).map(|f| f.enabled).unwrap_or(false)
    }

    pub fn value(&self, name: &str) -> Option<&FlagValue> {
        self.get(name).and_then(|f| f.value.as_ref())
    }

    pub fn flag_names(&self) -> Vec<&str> {
        self.flags.keys().map(String::as_str).sorted().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlagState)> {
        self.flags.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl From<HashMap<String, FlagState>> for FlagSnapshot {
    fn from(flags: HashMap<String, FlagState>) -> Self {
        Self::new(flags)
    }
}

impl<'de> Deserialize<'de> for FlagSnapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        HashMap::<String, FlagState>::deserialize(deserializer).map(Self::new)
    }
}

impl Serialize for FlagSnapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.flags.serialize(serializer)
    }
}
