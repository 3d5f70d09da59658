use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::FlagSnapshot;

/// Lifecycle of the [crate::FlagStore].
///
/// `Loaded` is only reported for the first non-empty delivery; every later delivery is `Changed`,
/// which lets the UI show a blocking spinner once and a lighter "flags updated" hint afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStoreStatus {
    Loading,
    Loaded,
    Changed,
    Error,
}

impl FlagStoreStatus {
    /// Status after the remote client delivers a snapshot, given the snapshot held before it.
    pub fn after_change(previous: Option<&FlagSnapshot>) -> Self {
        match previous {
            Some(snapshot) if !snapshot.is_empty() => FlagStoreStatus::Changed,
            _ => FlagStoreStatus::Loaded,
        }
    }

    /// Status after initialization is rejected. Always `Error`, whatever came before.
    pub fn after_error() -> Self {
        FlagStoreStatus::Error
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, FlagStoreStatus::Loaded | FlagStoreStatus::Changed)
    }
}

impl fmt::Display for FlagStoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlagStoreStatus::Loading => "loading",
            FlagStoreStatus::Loaded => "loaded",
            FlagStoreStatus::Changed => "changed",
            FlagStoreStatus::Error => "error",
        };
        f.write_str(s)
    }
}
