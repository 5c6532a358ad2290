//! Streaming API consumed by playback code
//!
//! Composes the resolver, session, scheduler and health estimator behind one
//! object.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::PieceStreamConfig;
use crate::engine::TorrentEngine;
use crate::health::{Health, HealthError, HealthEstimator, calculate_health};
use crate::resolver::{ResolveError, TorrentResolver};
use crate::session::{SessionError, SessionState, TorrentSession};
use crate::streaming::{
    DownloadStatus, StreamError, StreamableTorrent, TorrentListener, TorrentState,
};
use crate::torrent::{FileEntry, InfoHash, TorrentMetadata};
use crate::PieceStreamError;

/// Slack on top of the DHT bootstrap timeout when waiting for the session.
const BOOTSTRAP_GRACE: Duration = Duration::from_secs(5);

/// Handle to an active stream returned by [`StreamingService::create_stream`].
pub type StreamHandle = Arc<StreamableTorrent>;

/// Event forwarded to playback code by [`StreamingService::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StateChanged {
        info_hash: InfoHash,
        file_index: usize,
        old: TorrentState,
        new: TorrentState,
    },
    PieceFinished {
        info_hash: InfoHash,
        file_index: usize,
        /// File-local piece index.
        piece: u32,
    },
    Status {
        info_hash: InfoHash,
        file_index: usize,
        status: DownloadStatus,
    },
}

/// Forwards listener callbacks into an unbounded channel.
struct ChannelListener {
    info_hash: InfoHash,
    file_index: usize,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl TorrentListener for ChannelListener {
    fn on_state_changed(&self, old: TorrentState, new: TorrentState) {
        let _ = self.events.send(StreamEvent::StateChanged {
            info_hash: self.info_hash,
            file_index: self.file_index,
            old,
            new,
        });
    }

    fn on_piece_finished(&self, piece: u32) {
        let _ = self.events.send(StreamEvent::PieceFinished {
            info_hash: self.info_hash,
            file_index: self.file_index,
            piece,
        });
    }

    fn on_download_status(&self, status: &DownloadStatus) {
        let _ = self.events.send(StreamEvent::Status {
            info_hash: self.info_hash,
            file_index: self.file_index,
            status: status.clone(),
        });
    }
}

struct ActiveStream {
    torrent: StreamHandle,
    /// Strong references for listeners the torrent only holds weakly.
    forwarders: Vec<Arc<dyn TorrentListener>>,
}

/// Entry point for playback code.
pub struct StreamingService {
    config: PieceStreamConfig,
    session: TorrentSession,
    resolver: TorrentResolver,
    health: HealthEstimator,
    /// One stream per torrent, since a stream ignores every other file.
    streams: Mutex<HashMap<InfoHash, ActiveStream>>,
}

impl StreamingService {
    /// Creates the service. Call [`start`](Self::start) before streaming.
    ///
    /// # Errors
    ///
    /// - `PieceStreamError::Resolve` - HTTP client could not be created
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        config: PieceStreamConfig,
    ) -> Result<Self, PieceStreamError> {
        let session = TorrentSession::new(engine, config.session.clone());
        let resolver = TorrentResolver::new(session.clone(), config.resolver.clone())?;
        let health = HealthEstimator::new(session.clone(), config.health.clone());

        Ok(Self {
            config,
            session,
            resolver,
            health,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Initializes the session and waits for it to run.
    ///
    /// # Errors
    ///
    /// - `SessionError` - Bootstrap failed or did not finish in time
    pub async fn start(&self) -> Result<(), SessionError> {
        self.session.initialize();
        self.session
            .wait_until_running(self.config.session.dht_bootstrap_timeout + BOOTSTRAP_GRACE)
            .await
    }

    pub fn session(&self) -> &TorrentSession {
        &self.session
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Resolves a magnet, HTTP(S) or `file://` source.
    ///
    /// # Errors
    ///
    /// See [`TorrentResolver::resolve`].
    pub async fn resolve(&self, uri: &str) -> Result<Arc<TorrentMetadata>, ResolveError> {
        self.resolver.resolve(uri).await.map(Arc::new)
    }

    /// Starts streaming one file of a resolved torrent into `save_dir`, or
    /// the configured save directory when `None`.
    ///
    /// Asking again for a file that is already streaming returns the
    /// existing stream. Asking for another file of the same torrent replaces
    /// the previous stream.
    ///
    /// # Errors
    ///
    /// - `PieceStreamError::Stream` - Invalid file index or piece range
    /// - `PieceStreamError::Session` - Session not running or add failed
    /// - `PieceStreamError::Io` - Save directory could not be created
    pub async fn create_stream(
        &self,
        metadata: Arc<TorrentMetadata>,
        file_index: usize,
        save_dir: Option<&Path>,
        auto_start: bool,
    ) -> Result<StreamHandle, PieceStreamError> {
        if metadata.file(file_index).is_none() {
            return Err(StreamError::InvalidFileIndex {
                index: file_index,
                file_count: metadata.files.len(),
            }
            .into());
        }

        let previous = self.streams.lock().remove(&metadata.info_hash);
        if let Some(active) = previous {
            if !active.torrent.is_removed() && active.torrent.file().index == file_index {
                let existing = Arc::clone(&active.torrent);
                self.streams.lock().insert(metadata.info_hash, active);
                return Ok(existing);
            }
            tracing::info!(
                "Replacing stream {} with file {}",
                active.torrent.filename(),
                file_index
            );
            if let Err(error) = active.torrent.remove() {
                tracing::debug!("Previous stream already gone: {}", error);
            }
        }

        let save_dir = save_dir.unwrap_or(&self.config.session.save_directory);
        tokio::fs::create_dir_all(save_dir).await?;

        let handle = self.session.add_torrent(Arc::clone(&metadata), save_dir).await?;
        let torrent =
            match StreamableTorrent::new(&self.session, Arc::clone(&handle), file_index, auto_start) {
                Ok(torrent) => torrent,
                Err(error) => {
                    if let Err(remove_error) = self.session.remove_torrent(&handle) {
                        tracing::warn!("Failed to discard handle after error: {}", remove_error);
                    }
                    return Err(error.into());
                }
            };

        tracing::info!(
            "Created stream for {} in {}",
            torrent.filename(),
            save_dir.display()
        );
        self.streams.lock().insert(
            metadata.info_hash,
            ActiveStream {
                torrent: Arc::clone(&torrent),
                forwarders: Vec::new(),
            },
        );
        Ok(torrent)
    }

    /// Stops a stream and frees its engine resources.
    ///
    /// # Errors
    ///
    /// - `StreamError::NotManaged` - Stream already removed
    /// - `StreamError::Session` - Session refused the removal
    pub fn remove_stream(&self, stream: &StreamHandle) -> Result<(), StreamError> {
        let info_hash = stream.info_hash();
        {
            let mut streams = self.streams.lock();
            if streams
                .get(&info_hash)
                .is_some_and(|active| Arc::ptr_eq(&active.torrent, stream))
            {
                streams.remove(&info_hash);
            }
        }
        stream.remove()
    }

    /// Streams currently managed by the service.
    pub fn streams(&self) -> Vec<StreamHandle> {
        self.streams
            .lock()
            .values()
            .map(|active| Arc::clone(&active.torrent))
            .collect()
    }

    /// Opens a channel of state, piece and status events for `stream`.
    ///
    /// # Errors
    ///
    /// - `StreamError::NotManaged` - Stream not created by this service
    pub fn subscribe(
        &self,
        stream: &StreamHandle,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, StreamError> {
        let info_hash = stream.info_hash();
        let mut streams = self.streams.lock();
        let active = streams
            .get_mut(&info_hash)
            .filter(|active| Arc::ptr_eq(&active.torrent, stream))
            .ok_or(StreamError::NotManaged {
                info_hash: stream.info_hash(),
            })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let listener: Arc<dyn TorrentListener> = Arc::new(ChannelListener {
            info_hash,
            file_index: stream.file().index,
            events: sender,
        });
        active.torrent.add_listener(&listener);
        active.forwarders.push(listener);
        Ok(receiver)
    }

    /// Probes the swarm of a resolved torrent.
    ///
    /// # Errors
    ///
    /// See [`HealthEstimator::health_of_file`].
    pub async fn health_of_file(
        &self,
        metadata: &Arc<TorrentMetadata>,
        file: &FileEntry,
    ) -> Result<Health, HealthError> {
        self.health.health_of_file(metadata, file).await
    }

    /// Resolves `uri` and probes the swarm through its largest file.
    ///
    /// # Errors
    ///
    /// - `HealthError::Resolve` - Source could not be resolved
    /// - Any error of [`HealthEstimator::health_of_file`]
    pub async fn health_of_uri(&self, uri: &str) -> Result<Health, HealthError> {
        let metadata = self.resolve(uri).await?;
        let file = metadata
            .largest_file()
            .cloned()
            .ok_or_else(|| HealthError::Probe {
                reason: format!("{} has no files", metadata.name),
            })?;
        self.health.health_of_file(&metadata, &file).await
    }

    /// Scores a swarm from known counts.
    pub fn calculate_health(&self, seeds: u32, peers: u32) -> Health {
        calculate_health(seeds, peers)
    }

    /// Removes every remaining stream.
    pub fn cleanup(&self) {
        let streams: Vec<ActiveStream> = self
            .streams
            .lock()
            .drain()
            .map(|(_, active)| active)
            .collect();

        for active in streams {
            if let Err(error) = active.torrent.remove() {
                tracing::warn!(
                    "Failed to remove stream {}: {}",
                    active.torrent.filename(),
                    error
                );
            }
        }
    }

    /// Removes every stream and stops the session.
    pub fn shutdown(&self) {
        self.cleanup();
        self.session.shutdown();
    }
}
