//! Streaming of a single file out of a torrent
//!
//! [`StreamableTorrent`] turns "I need byte N" into piece priorities and
//! deadlines, and tracks completion of the file's piece range.

pub mod listener;
pub mod piece_range;
pub mod state;
pub mod status;
pub mod torrent;

pub use listener::TorrentListener;
pub use piece_range::PieceRange;
pub use state::TorrentState;
pub use status::DownloadStatus;
pub use torrent::{PRIORITY_DEADLINE, StreamableTorrent};

use crate::engine::EngineError;
use crate::session::SessionError;
use crate::torrent::InfoHash;

/// Errors raised by the streaming scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("Could not determine piece range: no piece is selected for download")]
    PieceRange,

    #[error("File index {index} out of range (torrent has {file_count} files)")]
    InvalidFileIndex { index: usize, file_count: usize },

    #[error("Torrent {info_hash} is not managed by this stream")]
    NotManaged { info_hash: InfoHash },

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}
