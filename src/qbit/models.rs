//! Wire types mirrored from the qBittorrent Web API
//!
//! Only the fields the dashboard caches or renders are modeled; heavyweight
//! payloads the UI consumes verbatim (properties, peers, preferences, logs)
//! pass through as raw JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One torrent as reported by `/api/v2/torrents/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentInfo {
    pub hash: String,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub dlspeed: i64,
    #[serde(default)]
    pub upspeed: i64,
    #[serde(default)]
    pub downloaded: i64,
    #[serde(default)]
    pub uploaded: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub eta: i64,
    #[serde(default)]
    pub category: String,
    /// Comma-joined tag list, exactly as the remote reports it.
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub tracker: String,
    #[serde(default)]
    pub save_path: String,
    #[serde(default)]
    pub added_on: i64,
    #[serde(default)]
    pub completion_on: i64,
    #[serde(default)]
    pub last_activity: i64,
}

/// Global transfer info from `/api/v2/transfer/info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferInfo {
    #[serde(default)]
    pub dl_info_speed: i64,
    #[serde(default)]
    pub up_info_speed: i64,
    #[serde(default)]
    pub dl_rate_limit: i64,
    #[serde(default)]
    pub up_rate_limit: i64,
}

/// One tracker entry from `/api/v2/torrents/trackers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerEntry {
    pub url: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub tier: serde_json::Value,
    #[serde(default)]
    pub num_peers: i64,
    #[serde(default)]
    pub num_seeds: i64,
    #[serde(default)]
    pub num_leeches: i64,
    #[serde(default)]
    pub msg: String,
}

/// One file entry from `/api/v2/torrents/files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentContent {
    #[serde(default)]
    pub index: i64,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub priority: i64,
}

/// One category from `/api/v2/torrents/categories`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(rename = "savePath", default)]
    pub save_path: String,
}

/// Category map keyed by category name.
pub type Categories = HashMap<String, Category>;

// Lifecycle state families. Every filter and statistic classifies torrents
// by membership in these fixed sets, never by bespoke string matching, so a
// new remote state variant only needs to be added in one place.

pub const DOWNLOADING_STATES: &[&str] = &["downloading", "stalledDL", "metaDL", "forcedDL"];
pub const SEEDING_STATES: &[&str] = &["uploading", "stalledUP", "forcedUP", "queuedUP"];
pub const PAUSED_STATES: &[&str] = &[
    "pausedDL", "pausedUP", "paused", "stopped", "stoppedDL", "stoppedUP",
];
pub const CHECKING_STATES: &[&str] = &["checkingUP", "checkingDL", "checkingResumeData"];
pub const ERROR_STATES: &[&str] = &["error", "missingFiles"];
/// Actively transferring, as opposed to merely not-paused.
pub const ACTIVE_STATES: &[&str] = &["downloading", "uploading", "forcedDL", "forcedUP"];

/// Resolves a filter name to its state family, if it is state-based.
pub fn family_states(filter: &str) -> Option<&'static [&'static str]> {
    match filter {
        "downloading" => Some(DOWNLOADING_STATES),
        "seeding" => Some(SEEDING_STATES),
        "paused" => Some(PAUSED_STATES),
        "checking" => Some(CHECKING_STATES),
        "error" => Some(ERROR_STATES),
        "active" => Some(ACTIVE_STATES),
        _ => None,
    }
}
