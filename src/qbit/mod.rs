//! qBittorrent Web API session client
//!
//! Each configured instance gets one [`QbClient`] holding an authenticated
//! cookie session. Every operation runs under the same retry contract: an
//! expired session triggers exactly one re-login followed by one replay of
//! the original call.

pub mod client;
pub mod error;
pub mod models;
pub mod pool;
pub mod version;

pub use client::{AddTorrentOptions, QbClient, TorrentLister};
pub use error::QbError;
pub use models::{TorrentInfo, TransferInfo};
pub use pool::{ListerProvider, QbClientPool};
