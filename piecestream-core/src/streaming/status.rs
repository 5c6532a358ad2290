//! Download progress snapshots

use serde::Serialize;

use crate::engine::TorrentStatus;

/// Snapshot of a stream's download counters, pushed on every stats alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadStatus {
    /// Fraction of wanted bytes present, in `[0, 1]`.
    pub progress: f32,
    pub seeds: u32,
    pub peers: u32,
    pub download_speed_bps: u64,
    pub upload_speed_bps: u64,
    pub downloaded_bytes: u64,
    pub total_wanted_bytes: u64,
}

impl From<&TorrentStatus> for DownloadStatus {
    fn from(status: &TorrentStatus) -> Self {
        Self {
            progress: status.progress.clamp(0.0, 1.0),
            seeds: status.num_seeds,
            peers: status.num_peers,
            download_speed_bps: status.download_rate,
            upload_speed_bps: status.upload_rate,
            downloaded_bytes: status.total_wanted_done,
            total_wanted_bytes: status.total_wanted,
        }
    }
}
