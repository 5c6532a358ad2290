use std::fmt;

/// Lifecycle of a streamed torrent.
///
/// `Creating -> Starting -> Downloading <-> Paused -> Completed`. `Error` is
/// entered when the engine cannot load the torrent and is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    Creating,
    Starting,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TorrentState::Creating => "creating",
            TorrentState::Starting => "starting",
            TorrentState::Downloading => "downloading",
            TorrentState::Paused => "paused",
            TorrentState::Completed => "completed",
            TorrentState::Error => "error",
        };
        write!(f, "{name}")
    }
}
