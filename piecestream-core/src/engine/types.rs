//! Value types exchanged with the torrent engine

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::EngineError;
use crate::torrent::TorrentMetadata;

/// Download priority of a file or piece.
///
/// Integer-tagged the way engines store it; `Ignore` means "do not
/// download" and `Top` is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum Priority {
    Ignore = 0,
    Low = 1,
    Two = 2,
    Three = 3,
    #[default]
    Normal = 4,
    Five = 5,
    Six = 6,
    Top = 7,
}

impl Priority {
    /// Returns the engine's integer tag for this priority.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Priority {
    type Error = EngineError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Ignore),
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Two),
            3 => Ok(Priority::Three),
            4 => Ok(Priority::Normal),
            5 => Ok(Priority::Five),
            6 => Ok(Priority::Six),
            7 => Ok(Priority::Top),
            _ => Err(EngineError::UnknownPriority { value }),
        }
    }
}

/// Settings handed to the engine when the session starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub anonymous_mode: bool,
    pub connections_limit: u32,
    /// Bytes per second, `None` for unlimited.
    pub download_rate_limit: Option<u64>,
    /// Bytes per second, `None` for unlimited.
    pub upload_rate_limit: Option<u64>,
    pub active_dht_limit: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            anonymous_mode: true,
            connections_limit: 200,
            download_rate_limit: None,
            upload_rate_limit: None,
            active_dht_limit: 88,
        }
    }
}

/// Request to add a torrent to a running engine.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub metadata: Arc<TorrentMetadata>,
    pub save_path: PathBuf,
    /// One entry per file. Empty means every file at `Priority::Normal`.
    pub file_priorities: Vec<Priority>,
}

/// Engine-side lifecycle of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineTorrentState {
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    /// Every wanted piece is present.
    Finished,
    /// Every piece of the torrent is present.
    Seeding,
}

impl fmt::Display for EngineTorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineTorrentState::CheckingFiles => "checking_files",
            EngineTorrentState::DownloadingMetadata => "downloading_metadata",
            EngineTorrentState::Downloading => "downloading",
            EngineTorrentState::Finished => "finished",
            EngineTorrentState::Seeding => "seeding",
        };
        write!(f, "{name}")
    }
}

/// Counters reported by a handle at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    pub state: EngineTorrentState,
    pub paused: bool,
    pub sequential_download: bool,
    /// Fraction of wanted bytes present, in `[0, 1]`.
    pub progress: f32,
    pub num_seeds: u32,
    pub num_peers: u32,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub total_wanted_done: u64,
    pub total_wanted: u64,
}
