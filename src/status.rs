use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether the published clock offset can be trusted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// No sync attempted since construction or the last reset
    #[default]
    NotSynced,
    /// A sync worker is running
    Syncing,
    /// The last completed sync succeeded
    Synced,
    /// Every server and attempt of the last sync failed
    Failed,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Synced | SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::NotSynced => "Not synced",
            SyncState::Syncing => "Syncing...",
            SyncState::Synced => "Synced",
            SyncState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Snapshot published by the sync worker. State and offset always travel
/// together.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Reference minus local, in ms
    pub offset_ms: i64,
    /// Server that produced `offset_ms`
    pub server: Option<String>,
    pub round_trip_ms: Option<i64>,
    /// Local Unix ms of the last terminal transition (0 = never)
    pub updated_ts: i64,
}
