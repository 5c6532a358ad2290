//! Boundary to the embedded BitTorrent engine
//!
//! Everything above this module talks to the engine only through
//! [`TorrentEngine`] and [`EngineHandle`]. Engine callbacks arrive as
//! [`Alert`] values on a channel so the rest of the crate never runs on the
//! engine's own threads.

pub mod alert;
pub mod memory;
pub mod types;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use alert::{Alert, AlertType};
pub use memory::{MemoryEngine, MemoryTorrent};
pub use types::{AddTorrentParams, EngineTorrentState, Priority, SessionParams, TorrentStatus};

use crate::torrent::{InfoHash, MagnetLink, TorrentMetadata};

/// Shared reference to a torrent registered with the engine.
pub type TorrentHandle = Arc<dyn EngineHandle>;

/// Receiving end of the engine's alert stream.
pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// Errors reported by the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine session is not running")]
    NotRunning,

    #[error("Torrent handle {info_hash} is no longer valid")]
    InvalidHandle { info_hash: InfoHash },

    #[error("Torrent {info_hash} is not known to the engine")]
    UnknownTorrent { info_hash: InfoHash },

    #[error("Piece {piece} out of range (torrent has {piece_count} pieces)")]
    PieceOutOfRange { piece: u32, piece_count: u32 },

    #[error("Unknown priority value {value}")]
    UnknownPriority { value: i32 },

    #[error("Engine operation failed: {context}")]
    Operation { context: String },
}

/// Session-level operations of the engine.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Starts the engine and returns its alert stream.
    ///
    /// # Errors
    ///
    /// - `EngineError::Operation` - Engine refused to start or is already running
    fn start(&self, params: SessionParams) -> Result<AlertReceiver, EngineError>;

    /// Stops the engine. Every handle becomes invalid. No-op when stopped.
    fn stop(&self);

    /// Begins DHT bootstrap.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotRunning` - Engine not started
    fn start_dht(&self) -> Result<(), EngineError>;

    /// Number of DHT nodes currently known.
    fn dht_node_count(&self) -> usize;

    /// Queues a torrent for addition. Completion is announced with
    /// `Alert::TorrentAdded` or `Alert::AddTorrentFailed`.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotRunning` - Engine not started
    fn async_add_torrent(&self, params: AddTorrentParams) -> Result<(), EngineError>;

    /// Removes a torrent and invalidates its handle.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownTorrent` - No torrent with that info hash
    /// - `EngineError::NotRunning` - Engine not started
    fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    /// Looks up the handle of a registered torrent.
    fn find_torrent(&self, info_hash: InfoHash) -> Option<TorrentHandle>;

    /// Downloads the bencoded torrent for a magnet link from the swarm.
    ///
    /// Returns `Ok(None)` when nothing arrived before `timeout`.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotRunning` - Engine not started
    async fn fetch_magnet(
        &self,
        magnet: &MagnetLink,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, EngineError>;
}

/// Per-torrent operations of the engine.
///
/// Mutating calls on an invalid handle fail with
/// `EngineError::InvalidHandle`; queries return neutral values.
pub trait EngineHandle: Send + Sync + fmt::Debug {
    fn is_valid(&self) -> bool;

    fn info_hash(&self) -> InfoHash;

    fn metadata(&self) -> Arc<TorrentMetadata>;

    fn save_path(&self) -> PathBuf;

    fn file_priorities(&self) -> Vec<Priority>;

    /// Replaces every file priority. Piece priorities are re-derived from
    /// the files overlapping each piece.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    /// - `EngineError::Operation` - Priority count differs from file count
    fn prioritize_files(&self, priorities: &[Priority]) -> Result<(), EngineError>;

    /// Priority of every piece, indexed by global piece index.
    fn piece_priorities(&self) -> Vec<Priority>;

    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    /// - `EngineError::PieceOutOfRange` - No such piece
    fn set_piece_priority(&self, piece: u32, priority: Priority) -> Result<(), EngineError>;

    /// Asks the engine to have `piece` within `deadline`.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    /// - `EngineError::PieceOutOfRange` - No such piece
    fn set_piece_deadline(&self, piece: u32, deadline: Duration) -> Result<(), EngineError>;

    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    fn clear_piece_deadlines(&self) -> Result<(), EngineError>;

    fn have_piece(&self, piece: u32) -> bool;

    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    fn pause(&self) -> Result<(), EngineError>;

    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    fn resume(&self) -> Result<(), EngineError>;

    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    fn set_sequential_download(&self, sequential: bool) -> Result<(), EngineError>;

    fn status(&self) -> TorrentStatus;

    /// Requests a tracker scrape, answered by `Alert::ScrapeReply` or
    /// `Alert::ScrapeFailed`.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidHandle` - Handle removed
    fn scrape_tracker(&self) -> Result<(), EngineError>;
}
