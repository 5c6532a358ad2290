use super::{DownloadStatus, TorrentState};

/// Observer of a [`StreamableTorrent`](super::StreamableTorrent).
///
/// Registered listeners are held weakly; dropping the last `Arc`
/// unregisters them. Callbacks run on the session's alert task.
pub trait TorrentListener: Send + Sync {
    fn on_state_changed(&self, _old: TorrentState, _new: TorrentState) {}

    /// `piece` is local to the streamed file.
    fn on_piece_finished(&self, _piece: u32) {}

    fn on_download_status(&self, _status: &DownloadStatus) {}
}
