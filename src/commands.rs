use crate::config::ModerationMode;
use crate::moderation::guard::NetworkStats;
use serde::{Deserialize, Serialize};

/// Requests from the settings UI, serialized as `{"action": "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    GetTabStatus,
    ForceActivate,
    TriggersUpdated,
    ForceRescan,
    GetNetworkStats,
    ResetBlockFlag,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommandResponse {
    #[serde(rename_all = "camelCase")]
    TabStatus {
        is_active: bool,
        tab_id: String,
        mode: ModerationMode,
    },
    Success,
    NetworkStats(NetworkStats),
    /// View mode only answers tab status queries.
    Ignored,
    #[serde(rename_all = "camelCase")]
    Failed { error: String },
}
