//! PieceStream Core - BitTorrent streaming for video playback
//!
//! Resolves torrent sources, drives a BitTorrent engine session, and
//! schedules piece downloads for one file at a time so playback can start
//! before the download completes.

pub mod config;
pub mod engine;
pub mod health;
pub mod resolver;
pub mod service;
pub mod session;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

pub use config::PieceStreamConfig;
pub use engine::{EngineError, MemoryEngine, TorrentEngine, TorrentHandle};
pub use health::{Health, HealthError, HealthEstimator, HealthState, calculate_health};
pub use resolver::{ResolveError, SourceScheme, TorrentResolver};
pub use service::{StreamEvent, StreamHandle, StreamingService};
pub use session::{SessionError, SessionState, TorrentSession};
pub use streaming::{
    DownloadStatus, PieceRange, StreamError, StreamableTorrent, TorrentListener, TorrentState,
};
pub use torrent::{FileEntry, InfoHash, TorrentError, TorrentMetadata};

/// Errors that can bubble up from any PieceStream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PieceStreamError {
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Streaming error: {0}")]
    Stream(#[from] StreamError),

    #[error("Health error: {0}")]
    Health(#[from] HealthError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PieceStreamError {
    /// Returns a message suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            PieceStreamError::Resolve(e) => match e {
                ResolveError::InvalidSource { uri } => {
                    format!("Not a magnet link, HTTP URL or file: {uri}")
                }
                ResolveError::Fetch { uri, .. } => format!("Could not download torrent from {uri}"),
                ResolveError::Decode(_) => "The torrent file is damaged or invalid".to_string(),
                ResolveError::Session(_) => "Torrent session is not ready".to_string(),
            },
            PieceStreamError::Session(SessionError::Timeout { operation, .. }) => {
                format!("Timed out waiting for {operation}")
            }
            PieceStreamError::Session(_) => "Torrent session is not ready".to_string(),
            PieceStreamError::Stream(StreamError::InvalidFileIndex { index, file_count }) => {
                format!("File {index} does not exist, the torrent has {file_count} files")
            }
            PieceStreamError::Stream(_) => "Streaming error occurred".to_string(),
            PieceStreamError::Health(HealthError::Timeout { .. }) => {
                "Trackers did not answer in time".to_string()
            }
            PieceStreamError::Health(_) => "Could not check torrent health".to_string(),
            PieceStreamError::Engine(_) => "Download error occurred".to_string(),
            PieceStreamError::Torrent(TorrentError::InvalidMagnetLink { reason }) => {
                format!("Invalid magnet link: {reason}")
            }
            PieceStreamError::Torrent(TorrentError::InvalidTorrentFile { reason }) => {
                format!("Invalid torrent file: {reason}")
            }
            PieceStreamError::Configuration { .. } => "Configuration error occurred".to_string(),
            PieceStreamError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PieceStreamError::Configuration { .. }
                | PieceStreamError::Torrent(_)
                | PieceStreamError::Resolve(ResolveError::InvalidSource { .. })
                | PieceStreamError::Resolve(ResolveError::Decode(_))
                | PieceStreamError::Stream(StreamError::InvalidFileIndex { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PieceStreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let bad_source = PieceStreamError::from(ResolveError::InvalidSource {
            uri: "ftp://x".to_string(),
        });
        assert!(bad_source.is_user_error());
        assert!(bad_source.user_message().contains("ftp://x"));

        let fetch = PieceStreamError::from(ResolveError::Fetch {
            uri: "http://tracker/x.torrent".to_string(),
            reason: "HTTP 404".to_string(),
        });
        assert!(!fetch.is_user_error());
        assert_eq!(
            fetch.user_message(),
            "Could not download torrent from http://tracker/x.torrent"
        );

        let index = PieceStreamError::from(StreamError::InvalidFileIndex {
            index: 3,
            file_count: 2,
        });
        assert!(index.is_user_error());
    }
}
