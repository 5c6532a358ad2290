//! Typed engine notifications

use std::fmt;

use crate::torrent::InfoHash;

/// Event emitted by the engine, delivered in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    TorrentAdded { info_hash: InfoHash },
    AddTorrentFailed { info_hash: InfoHash, message: String },
    /// Periodic counters update; read them from the handle's status.
    Stats { info_hash: InfoHash },
    /// `piece` is the global piece index.
    PieceFinished { info_hash: InfoHash, piece: u32 },
    TrackerAnnounce { info_hash: InfoHash, url: String },
    ScrapeReply {
        info_hash: InfoHash,
        complete: u32,
        incomplete: u32,
    },
    ScrapeFailed { info_hash: InfoHash, message: String },
    MetadataFailed { info_hash: InfoHash, message: String },
}

/// Discriminant of [`Alert`], used by listeners to filter deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertType {
    TorrentAdded,
    AddTorrentFailed,
    Stats,
    PieceFinished,
    TrackerAnnounce,
    ScrapeReply,
    ScrapeFailed,
    MetadataFailed,
}

impl Alert {
    pub fn alert_type(&self) -> AlertType {
        match self {
            Alert::TorrentAdded { .. } => AlertType::TorrentAdded,
            Alert::AddTorrentFailed { .. } => AlertType::AddTorrentFailed,
            Alert::Stats { .. } => AlertType::Stats,
            Alert::PieceFinished { .. } => AlertType::PieceFinished,
            Alert::TrackerAnnounce { .. } => AlertType::TrackerAnnounce,
            Alert::ScrapeReply { .. } => AlertType::ScrapeReply,
            Alert::ScrapeFailed { .. } => AlertType::ScrapeFailed,
            Alert::MetadataFailed { .. } => AlertType::MetadataFailed,
        }
    }

    /// Torrent the alert concerns.
    pub fn info_hash(&self) -> InfoHash {
        match self {
            Alert::TorrentAdded { info_hash }
            | Alert::AddTorrentFailed { info_hash, .. }
            | Alert::Stats { info_hash }
            | Alert::PieceFinished { info_hash, .. }
            | Alert::TrackerAnnounce { info_hash, .. }
            | Alert::ScrapeReply { info_hash, .. }
            | Alert::ScrapeFailed { info_hash, .. }
            | Alert::MetadataFailed { info_hash, .. } => *info_hash,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_accessors() {
        let info_hash = InfoHash::new([3; 20]);
        let alert = Alert::PieceFinished {
            info_hash,
            piece: 12,
        };
        assert_eq!(alert.alert_type(), AlertType::PieceFinished);
        assert_eq!(alert.info_hash(), info_hash);

        let alert = Alert::ScrapeReply {
            info_hash,
            complete: 4,
            incomplete: 9,
        };
        assert_eq!(alert.alert_type(), AlertType::ScrapeReply);
        assert_eq!(alert.alert_type().to_string(), "ScrapeReply");
    }
}
