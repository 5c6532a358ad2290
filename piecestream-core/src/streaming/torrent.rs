//! Piece scheduler for one file inside a torrent

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{DownloadStatus, PieceRange, StreamError, TorrentListener, TorrentState};
use crate::engine::{Alert, AlertType, EngineTorrentState, Priority, TorrentHandle};
use crate::session::{AlertListener, SubscriptionId, TorrentSession};
use crate::torrent::{FileEntry, InfoHash};

/// Deadline attached to explicitly prioritized pieces.
pub const PRIORITY_DEADLINE: Duration = Duration::from_millis(1000);

const STREAM_ALERTS: &[AlertType] = &[
    AlertType::PieceFinished,
    AlertType::Stats,
    AlertType::MetadataFailed,
];

/// One active download of one file within a torrent.
///
/// Construction selects the file (every other file is ignored), computes
/// its piece range and subscribes to the session's alerts. Byte-level
/// requests from the player are turned into piece priorities; engine
/// alerts drive the [`TorrentState`] machine and listener callbacks.
///
/// Public methods may be called from any thread while alerts are being
/// handled. The piece range is fixed at construction; state and listeners
/// sit behind their own locks.
pub struct StreamableTorrent {
    info_hash: InfoHash,
    handle: TorrentHandle,
    session: TorrentSession,
    file: FileEntry,
    piece_length: u32,
    piece_range: PieceRange,
    state: Mutex<TorrentState>,
    listeners: Mutex<Vec<Weak<dyn TorrentListener>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    removed: AtomicBool,
}

/// Session-side listener. Holds the torrent weakly so the session's
/// registry never keeps a dropped stream alive.
struct AlertBridge {
    torrent: Weak<StreamableTorrent>,
}

impl AlertListener for AlertBridge {
    fn alert_types(&self) -> &[AlertType] {
        STREAM_ALERTS
    }

    fn on_alert(&self, alert: &Alert) {
        if let Some(torrent) = self.torrent.upgrade() {
            torrent.handle_alert(alert);
        }
    }
}

impl StreamableTorrent {
    /// Selects `file_index` for download and attaches to `session`.
    ///
    /// With `auto_start` the torrent moves to `Starting` and the handle is
    /// resumed immediately.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidFileIndex` - No such file in the torrent
    /// - `StreamError::PieceRange` - No piece selected after setting file priorities
    /// - `StreamError::Session` - Session not running
    /// - `StreamError::Engine` - Handle rejected priority or resume calls
    pub fn new(
        session: &TorrentSession,
        handle: TorrentHandle,
        file_index: usize,
        auto_start: bool,
    ) -> Result<Arc<Self>, StreamError> {
        let metadata = handle.metadata();
        let file = metadata
            .file(file_index)
            .cloned()
            .ok_or(StreamError::InvalidFileIndex {
                index: file_index,
                file_count: metadata.files.len(),
            })?;

        let mut file_priorities = vec![Priority::Ignore; metadata.files.len()];
        file_priorities[file_index] = Priority::Normal;
        handle.prioritize_files(&file_priorities)?;

        let piece_range = PieceRange::from_priorities(&handle.piece_priorities())?;
        tracing::debug!(
            "Streaming {} from {}: pieces {}..={}",
            file.path.display(),
            metadata.info_hash,
            piece_range.first(),
            piece_range.last()
        );

        let torrent = Arc::new(Self {
            info_hash: metadata.info_hash,
            handle,
            session: session.clone(),
            file,
            piece_length: metadata.piece_length,
            piece_range,
            state: Mutex::new(TorrentState::Creating),
            listeners: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            removed: AtomicBool::new(false),
        });

        let bridge = Arc::new(AlertBridge {
            torrent: Arc::downgrade(&torrent),
        });
        *torrent.subscription.lock() = Some(session.subscribe(bridge)?);

        if auto_start {
            if let Err(error) = torrent.start_download() {
                torrent.detach();
                return Err(error);
            }
        }

        Ok(torrent)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn handle(&self) -> &TorrentHandle {
        &self.handle
    }

    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    pub fn filename(&self) -> String {
        self.file.filename()
    }

    /// Where the engine writes the streamed file.
    pub fn file_path(&self) -> PathBuf {
        self.file.full_path(&self.handle.save_path())
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_range(&self) -> PieceRange {
        self.piece_range
    }

    pub fn state(&self) -> TorrentState {
        *self.state.lock()
    }

    /// Whether [`remove`](Self::remove) has run.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Current counters, read directly from the handle.
    pub fn download_status(&self) -> DownloadStatus {
        DownloadStatus::from(&self.handle.status())
    }

    /// Moves `Creating -> Starting` and resumes. No-op in any other state.
    ///
    /// # Errors
    ///
    /// - `StreamError::Engine` - Handle refused to resume
    pub fn start_download(&self) -> Result<(), StreamError> {
        if !self.transition(TorrentState::Starting, |old| old == TorrentState::Creating) {
            return Ok(());
        }
        tracing::info!("Starting download of {}", self.file.path.display());
        self.resume()
    }

    /// Resumes the engine handle. No-op once `Completed`.
    ///
    /// # Errors
    ///
    /// - `StreamError::Engine` - Handle refused to resume
    pub fn resume(&self) -> Result<(), StreamError> {
        if self.state() == TorrentState::Completed {
            tracing::trace!("Ignoring resume of completed torrent {}", self.info_hash);
            return Ok(());
        }
        self.handle.resume()?;
        self.transition(TorrentState::Downloading, |old| old == TorrentState::Paused);
        Ok(())
    }

    /// Pauses the engine handle. No-op when `Completed` or already `Paused`.
    ///
    /// # Errors
    ///
    /// - `StreamError::Engine` - Handle refused to pause
    pub fn pause(&self) -> Result<(), StreamError> {
        if matches!(self.state(), TorrentState::Completed | TorrentState::Paused) {
            return Ok(());
        }
        self.update_state(TorrentState::Paused);
        self.handle.pause()?;
        Ok(())
    }

    /// Drops deadline scheduling in favour of strict in-order download.
    ///
    /// # Errors
    ///
    /// - `StreamError::Engine` - Handle removed
    pub fn sequential_mode(&self) -> Result<(), StreamError> {
        self.handle.clear_piece_deadlines()?;
        self.handle.set_sequential_download(true)?;
        tracing::debug!("Torrent {} switched to sequential mode", self.info_hash);
        Ok(())
    }

    /// Whether the file-local piece is downloaded.
    pub fn has_piece(&self, piece: u32) -> bool {
        self.piece_range
            .to_global(piece)
            .is_some_and(|global| self.handle.have_piece(global))
    }

    /// `last - first` of the piece range. See [`PieceRange::total_pieces`].
    pub fn total_pieces(&self) -> u32 {
        self.piece_range.total_pieces()
    }

    /// Raises file-local pieces to top priority with a short deadline.
    /// Indices outside the file are skipped.
    ///
    /// # Errors
    ///
    /// - `StreamError::Engine` - Handle rejected the priority or deadline
    pub fn prioritize_pieces(&self, pieces: &[u32]) -> Result<(), StreamError> {
        for &local in pieces {
            let Some(global) = self.piece_range.to_global(local) else {
                tracing::warn!(
                    "Skipping piece {} outside download range of {} ({} pieces)",
                    local,
                    self.info_hash,
                    self.total_pieces()
                );
                continue;
            };

            tracing::trace!("Prioritizing piece {} (global {})", local, global);
            self.handle.set_piece_priority(global, Priority::Top)?;
            self.handle.set_piece_deadline(global, PRIORITY_DEADLINE)?;
        }
        Ok(())
    }

    /// Whether the piece holding `byte_offset` of the file is downloaded.
    pub fn has_byte(&self, byte_offset: u64) -> bool {
        self.piece_range
            .piece_for_byte(self.piece_length, byte_offset)
            .is_some_and(|piece| self.handle.have_piece(piece))
    }

    /// Raises the piece holding `byte_offset` and the following piece to
    /// top priority, without deadlines. Returns the global pieces touched.
    ///
    /// # Errors
    ///
    /// - `StreamError::Engine` - Handle rejected the priority
    pub fn prioritize_byte(&self, byte_offset: u64) -> Result<Vec<u32>, StreamError> {
        let pieces = self.piece_range.lookahead(self.piece_length, byte_offset);
        if pieces.is_empty() {
            tracing::trace!("Byte {} is past the end of {}", byte_offset, self.filename());
        }
        for &piece in &pieces {
            self.handle.set_piece_priority(piece, Priority::Top)?;
        }
        Ok(pieces)
    }

    /// [`prioritize_byte`](Self::prioritize_byte) for many offsets, touching
    /// each distinct piece once. Returns the sorted global pieces.
    ///
    /// # Errors
    ///
    /// - `StreamError::Engine` - Handle rejected the priority
    pub fn prioritize_bytes(&self, byte_offsets: &[u64]) -> Result<Vec<u32>, StreamError> {
        let pieces: BTreeSet<u32> = byte_offsets
            .iter()
            .flat_map(|&offset| self.piece_range.lookahead(self.piece_length, offset))
            .collect();

        for &piece in &pieces {
            self.handle.set_piece_priority(piece, Priority::Top)?;
        }
        Ok(pieces.into_iter().collect())
    }

    /// Registers a listener. Only a weak reference is kept.
    pub fn add_listener(&self, listener: &Arc<dyn TorrentListener>) {
        let mut listeners = self.listeners.lock();
        let registered = listeners
            .iter()
            .any(|existing| std::ptr::addr_eq(existing.as_ptr(), Arc::as_ptr(listener)));
        if !registered {
            listeners.push(Arc::downgrade(listener));
        }
    }

    /// Unregisters a listener. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn TorrentListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|existing| !std::ptr::addr_eq(existing.as_ptr(), Arc::as_ptr(listener)));
        listeners.len() != before
    }

    /// Pauses, detaches from the session's alerts and removes the handle.
    ///
    /// Alerts still in flight for this torrent are ignored afterwards.
    ///
    /// # Errors
    ///
    /// - `StreamError::NotManaged` - Already removed
    /// - `StreamError::Session` - Session refused to remove the handle
    pub fn remove(&self) -> Result<(), StreamError> {
        let Some(subscription) = self.subscription.lock().take() else {
            return Err(StreamError::NotManaged {
                info_hash: self.info_hash,
            });
        };

        if let Err(error) = self.pause() {
            tracing::debug!("Pause before removing {} failed: {}", self.info_hash, error);
        }
        self.removed.store(true, Ordering::SeqCst);
        self.session.unsubscribe(subscription)?;
        self.session.remove_torrent(&self.handle)?;
        tracing::info!("Removed stream {} ({})", self.filename(), self.info_hash);
        Ok(())
    }

    fn detach(&self) {
        self.removed.store(true, Ordering::SeqCst);
        if let Some(subscription) = self.subscription.lock().take() {
            let _ = self.session.unsubscribe(subscription);
        }
    }

    fn handle_alert(&self, alert: &Alert) {
        if self.is_removed() || alert.info_hash() != self.info_hash {
            return;
        }

        match alert {
            Alert::PieceFinished { piece, .. } => self.on_piece_finished(*piece),
            Alert::Stats { .. } => self.on_stats(),
            Alert::MetadataFailed { message, .. } => {
                tracing::error!("Engine failed to load {}: {}", self.info_hash, message);
                self.update_state(TorrentState::Error);
            }
            _ => {}
        }
    }

    fn on_piece_finished(&self, global: u32) {
        let Some(local) = self.piece_range.to_local(global) else {
            tracing::trace!("Ignoring piece {} outside the streamed file", global);
            return;
        };

        tracing::trace!("Piece {} finished for {}", local, self.info_hash);
        self.notify(|listener| listener.on_piece_finished(local));

        let complete = self
            .piece_range
            .iter()
            .all(|piece| self.handle.have_piece(piece));
        self.update_state(if complete {
            TorrentState::Completed
        } else {
            TorrentState::Downloading
        });
    }

    fn on_stats(&self) {
        let status = self.handle.status();
        let download_status = DownloadStatus::from(&status);
        self.notify(|listener| listener.on_download_status(&download_status));

        if matches!(
            status.state,
            EngineTorrentState::Finished | EngineTorrentState::Seeding
        ) {
            self.update_state(TorrentState::Completed);
        }
    }

    fn update_state(&self, next: TorrentState) -> bool {
        self.transition(next, |_| true)
    }

    /// Moves to `next` when `allowed` accepts the current state. Nothing
    /// leaves `Error`.
    fn transition(&self, next: TorrentState, allowed: impl Fn(TorrentState) -> bool) -> bool {
        let old = {
            let mut state = self.state.lock();
            let old = *state;
            if old == TorrentState::Error {
                tracing::debug!("Refusing {} -> {} for {}", old, next, self.info_hash);
                return false;
            }
            if old == next || !allowed(old) {
                return false;
            }
            *state = next;
            old
        };

        tracing::debug!("Torrent {} state {} -> {}", self.info_hash, old, next);
        self.notify(|listener| listener.on_state_changed(old, next));
        true
    }

    fn notify(&self, callback: impl Fn(&dyn TorrentListener)) {
        let listeners: Vec<Arc<dyn TorrentListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref()))).is_err() {
                tracing::error!("Torrent listener panicked for {}", self.info_hash);
            }
        }
    }
}

impl std::fmt::Debug for StreamableTorrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableTorrent")
            .field("info_hash", &self.info_hash)
            .field("file", &self.file.path)
            .field("piece_range", &self.piece_range)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::PieceStreamConfig;
    use crate::engine::MemoryEngine;
    use crate::torrent::{BencodeParser, TorrentCreator, TorrentMetadata};

    const PIECE: usize = 1024;

    struct Fixture {
        engine: MemoryEngine,
        session: TorrentSession,
        metadata: Arc<TorrentMetadata>,
    }

    impl Fixture {
        /// Torrent with `a.mkv` (2.5 pieces), `b.mkv` (4 pieces) and an
        /// empty `c.txt`.
        async fn new() -> Self {
            let a = vec![1u8; PIECE * 5 / 2];
            let b = vec![2u8; PIECE * 4];
            let bytes = TorrentCreator::with_piece_size(PIECE as u32)
                .create_multi_file(
                    "pack",
                    &[("a.mkv", &a[..]), ("b.mkv", &b[..]), ("c.txt", &[][..])],
                )
                .unwrap();
            let metadata = Arc::new(BencodeParser::parse_torrent_bytes(&bytes).unwrap());

            let engine = MemoryEngine::new();
            let session = TorrentSession::new(
                Arc::new(engine.clone()),
                PieceStreamConfig::for_testing().session,
            );
            session.initialize();
            session
                .wait_until_running(Duration::from_secs(2))
                .await
                .unwrap();

            Self {
                engine,
                session,
                metadata,
            }
        }

        async fn stream(
            &self,
            file_index: usize,
            auto_start: bool,
        ) -> Result<Arc<StreamableTorrent>, StreamError> {
            let handle = self
                .session
                .add_torrent(self.metadata.clone(), Path::new("/tmp/pack"))
                .await?;
            StreamableTorrent::new(&self.session, handle, file_index, auto_start)
        }

        fn complete(&self, piece: u32) {
            self.engine
                .complete_piece(self.metadata.info_hash, piece)
                .unwrap();
        }
    }

    async fn wait_for_state(torrent: &StreamableTorrent, expected: TorrentState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while torrent.state() != expected {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("torrent stuck in {} waiting for {}", torrent.state(), expected));
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<(TorrentState, TorrentState)>>,
        pieces: Mutex<Vec<u32>>,
        statuses: Mutex<Vec<DownloadStatus>>,
    }

    impl TorrentListener for Recorder {
        fn on_state_changed(&self, old: TorrentState, new: TorrentState) {
            self.states.lock().push((old, new));
        }

        fn on_piece_finished(&self, piece: u32) {
            self.pieces.lock().push(piece);
        }

        fn on_download_status(&self, status: &DownloadStatus) {
            self.statuses.lock().push(status.clone());
        }
    }

    struct Panicker;

    impl TorrentListener for Panicker {
        fn on_piece_finished(&self, _piece: u32) {
            panic!("listener failure");
        }
    }

    #[tokio::test]
    async fn test_construction_selects_only_target_file() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(1, false).await.unwrap();

        assert_eq!(
            torrent.handle().file_priorities(),
            vec![Priority::Ignore, Priority::Normal, Priority::Ignore]
        );
        // b.mkv spans bytes 2560..6656: pieces 2 through 6.
        assert_eq!(torrent.piece_range(), PieceRange::new(2, 6).unwrap());
        assert_eq!(torrent.total_pieces(), 4);
        assert_eq!(torrent.state(), TorrentState::Creating);
        assert_eq!(torrent.filename(), "b.mkv");
        assert_eq!(torrent.file_path(), PathBuf::from("/tmp/pack/pack/b.mkv"));
        assert_eq!(torrent.piece_length(), PIECE as u32);
    }

    #[tokio::test]
    async fn test_invalid_file_index() {
        let fixture = Fixture::new().await;
        assert_eq!(
            fixture.stream(7, false).await.unwrap_err(),
            StreamError::InvalidFileIndex {
                index: 7,
                file_count: 3
            }
        );
    }

    #[tokio::test]
    async fn test_empty_file_has_no_piece_range() {
        let fixture = Fixture::new().await;
        assert_eq!(
            fixture.stream(2, false).await.unwrap_err(),
            StreamError::PieceRange
        );
    }

    #[tokio::test]
    async fn test_start_download_only_from_creating() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, false).await.unwrap();
        let memory = fixture.engine.torrent(fixture.metadata.info_hash).unwrap();
        assert!(memory.is_paused());

        torrent.start_download().unwrap();
        assert_eq!(torrent.state(), TorrentState::Starting);
        assert!(!memory.is_paused());

        torrent.pause().unwrap();
        torrent.start_download().unwrap();
        assert_eq!(torrent.state(), TorrentState::Paused);
    }

    #[tokio::test]
    async fn test_auto_start_resumes_handle() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, true).await.unwrap();

        assert_eq!(torrent.state(), TorrentState::Starting);
        assert!(!fixture.engine.torrent(torrent.info_hash()).unwrap().is_paused());
    }

    #[tokio::test]
    async fn test_prioritize_pieces_sets_top_priority_and_deadline() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(1, true).await.unwrap();

        torrent.prioritize_pieces(&[0, 3, 9]).unwrap();

        let priorities = torrent.handle().piece_priorities();
        assert_eq!(priorities[2], Priority::Top);
        assert_eq!(priorities[5], Priority::Top);
        assert_eq!(priorities[3], Priority::Normal);
        let memory = fixture.engine.torrent(torrent.info_hash()).unwrap();
        assert_eq!(memory.piece_deadline(2), Some(PRIORITY_DEADLINE));
        assert_eq!(memory.piece_deadline(5), Some(PRIORITY_DEADLINE));
        assert_eq!(memory.deadline_count(), 2);
    }

    #[tokio::test]
    async fn test_prioritize_byte_looks_one_piece_ahead() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(1, true).await.unwrap();

        assert_eq!(torrent.prioritize_byte(0).unwrap(), vec![2, 3]);
        assert_eq!(torrent.prioritize_byte(PIECE as u64 * 4).unwrap(), vec![6]);
        assert!(torrent.prioritize_byte(PIECE as u64 * 5).unwrap().is_empty());

        let priorities = torrent.handle().piece_priorities();
        assert_eq!(priorities[2], Priority::Top);
        assert_eq!(priorities[3], Priority::Top);
        assert_eq!(priorities[4], Priority::Normal);
        assert_eq!(priorities[6], Priority::Top);
        let memory = fixture.engine.torrent(torrent.info_hash()).unwrap();
        assert_eq!(memory.deadline_count(), 0);
    }

    #[tokio::test]
    async fn test_prioritize_bytes_touches_distinct_pieces() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(1, true).await.unwrap();

        let pieces = torrent
            .prioritize_bytes(&[0, 10, PIECE as u64 + 1, PIECE as u64 * 4])
            .unwrap();
        assert_eq!(pieces, vec![2, 3, 4, 6]);
    }

    #[tokio::test]
    async fn test_has_byte_and_has_piece_follow_engine() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(1, true).await.unwrap();
        assert!(!torrent.has_byte(0));

        fixture.complete(2);

        assert!(torrent.has_byte(0));
        assert!(torrent.has_byte(PIECE as u64 - 1));
        assert!(!torrent.has_byte(PIECE as u64));
        assert!(torrent.has_piece(0));
        assert!(!torrent.has_piece(1));
        assert!(!torrent.has_piece(40));
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, true).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn TorrentListener> = recorder.clone();
        torrent.add_listener(&listener);

        torrent.pause().unwrap();
        torrent.pause().unwrap();

        assert_eq!(torrent.state(), TorrentState::Paused);
        assert_eq!(
            *recorder.states.lock(),
            vec![(TorrentState::Starting, TorrentState::Paused)]
        );

        torrent.resume().unwrap();
        assert_eq!(torrent.state(), TorrentState::Downloading);
    }

    #[tokio::test]
    async fn test_sequential_mode_clears_deadlines() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(1, true).await.unwrap();
        torrent.prioritize_pieces(&[0, 1]).unwrap();

        torrent.sequential_mode().unwrap();

        let memory = fixture.engine.torrent(torrent.info_hash()).unwrap();
        assert_eq!(memory.deadline_count(), 0);
        assert!(torrent.handle().status().sequential_download);
    }

    #[tokio::test]
    async fn test_pieces_drive_completion() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, true).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn TorrentListener> = recorder.clone();
        torrent.add_listener(&listener);

        fixture.complete(0);
        wait_for_state(&torrent, TorrentState::Downloading).await;
        fixture.complete(1);
        // Piece 5 belongs to b.mkv and must not count.
        fixture.complete(5);
        fixture.complete(2);
        wait_for_state(&torrent, TorrentState::Completed).await;

        assert_eq!(*recorder.pieces.lock(), vec![0, 1, 2]);
        assert_eq!(
            *recorder.states.lock(),
            vec![
                (TorrentState::Starting, TorrentState::Downloading),
                (TorrentState::Downloading, TorrentState::Completed),
            ]
        );

        torrent.resume().unwrap();
        torrent.pause().unwrap();
        assert_eq!(torrent.state(), TorrentState::Completed);
    }

    struct PieceCounter(tokio::sync::mpsc::UnboundedSender<u32>);

    impl AlertListener for PieceCounter {
        fn alert_types(&self) -> &[AlertType] {
            &[AlertType::PieceFinished]
        }

        fn on_alert(&self, alert: &Alert) {
            if let Alert::PieceFinished { piece, .. } = alert {
                let _ = self.0.send(*piece);
            }
        }
    }

    #[tokio::test]
    async fn test_stats_alert_pushes_status() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, true).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn TorrentListener> = recorder.clone();
        torrent.add_listener(&listener);
        fixture.engine.set_swarm(fixture.metadata.info_hash, 9, 4);
        fixture
            .engine
            .set_transfer_rates(fixture.metadata.info_hash, 4096, 512)
            .unwrap();

        fixture.engine.post_stats(fixture.metadata.info_hash).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.statuses.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        let status = recorder.statuses.lock()[0].clone();
        assert_eq!(status.seeds, 9);
        assert_eq!(status.peers, 4);
        assert_eq!(status.download_speed_bps, 4096);
        assert_eq!(status.upload_speed_bps, 512);
        assert_eq!(status.progress, 0.0);
        assert_eq!(status.total_wanted_bytes, 3 * PIECE as u64);
        assert_eq!(torrent.state(), TorrentState::Starting);
    }

    #[tokio::test]
    async fn test_finished_stats_complete_the_stream() {
        let fixture = Fixture::new().await;
        let handle = fixture
            .session
            .add_torrent(fixture.metadata.clone(), Path::new("/tmp/pack"))
            .await
            .unwrap();

        // Pieces arrive before the stream exists, so only stats can tell it.
        let (sender, mut finished) = tokio::sync::mpsc::unbounded_channel();
        fixture
            .session
            .subscribe(Arc::new(PieceCounter(sender)))
            .unwrap();
        for piece in 0..=2 {
            fixture.complete(piece);
        }
        for _ in 0..=2 {
            finished.recv().await.unwrap();
        }

        let torrent = StreamableTorrent::new(&fixture.session, handle, 0, false).unwrap();
        assert_eq!(torrent.state(), TorrentState::Creating);

        fixture.engine.post_stats(fixture.metadata.info_hash).unwrap();
        wait_for_state(&torrent, TorrentState::Completed).await;
        assert_eq!(torrent.download_status().progress, 1.0);
    }

    #[tokio::test]
    async fn test_metadata_failure_is_terminal() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, true).await.unwrap();

        fixture
            .engine
            .fail_metadata(fixture.metadata.info_hash, "corrupt info dictionary")
            .unwrap();
        wait_for_state(&torrent, TorrentState::Error).await;

        torrent.pause().unwrap();
        torrent.handle_alert(&Alert::PieceFinished {
            info_hash: torrent.info_hash(),
            piece: 0,
        });
        assert_eq!(torrent.state(), TorrentState::Error);
    }

    #[tokio::test]
    async fn test_remove_detaches_and_ignores_late_alerts() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, true).await.unwrap();
        let handle = Arc::clone(torrent.handle());

        torrent.remove().unwrap();

        assert!(torrent.is_removed());
        assert!(!handle.is_valid());
        assert_eq!(torrent.state(), TorrentState::Paused);
        assert_eq!(fixture.engine.torrent_count(), 0);

        torrent.handle_alert(&Alert::PieceFinished {
            info_hash: torrent.info_hash(),
            piece: 0,
        });
        assert_eq!(torrent.state(), TorrentState::Paused);

        assert_eq!(
            torrent.remove().unwrap_err(),
            StreamError::NotManaged {
                info_hash: torrent.info_hash()
            }
        );
    }

    #[tokio::test]
    async fn test_listeners_are_weak_and_isolated() {
        let fixture = Fixture::new().await;
        let torrent = fixture.stream(0, true).await.unwrap();

        let panicker: Arc<dyn TorrentListener> = Arc::new(Panicker);
        torrent.add_listener(&panicker);
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn TorrentListener> = recorder.clone();
        torrent.add_listener(&listener);
        torrent.add_listener(&listener);

        let dropped: Arc<dyn TorrentListener> = Arc::new(Recorder::default());
        torrent.add_listener(&dropped);
        drop(dropped);

        fixture.complete(0);
        wait_for_state(&torrent, TorrentState::Downloading).await;

        assert_eq!(*recorder.pieces.lock(), vec![0]);
        assert!(torrent.remove_listener(&listener));
        assert!(!torrent.remove_listener(&listener));
    }
}
