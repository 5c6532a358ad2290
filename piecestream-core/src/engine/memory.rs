//! In-process engine for simulation mode and tests
//!
//! Keeps every torrent's piece book in memory and never touches the network.
//! Piece arrival, swarm sizes and magnet metadata are driven explicitly
//! through the simulation controls on [`MemoryEngine`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    AddTorrentParams, Alert, AlertReceiver, EngineError, EngineHandle, EngineTorrentState,
    Priority, SessionParams, TorrentEngine, TorrentHandle, TorrentStatus,
};
use crate::torrent::{InfoHash, MagnetLink, TorrentMetadata};

/// DHT nodes reported once bootstrap has started, unless overridden.
pub const DEFAULT_SIMULATED_DHT_NODES: usize = 32;

const MAGNET_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
struct Swarm {
    seeds: u32,
    peers: u32,
}

struct EngineCore {
    alerts: Option<mpsc::UnboundedSender<Alert>>,
    params: Option<SessionParams>,
    dht_started: bool,
    dht_nodes: usize,
    start_failure: Option<String>,
    add_failure: Option<String>,
    torrents: HashMap<InfoHash, Arc<MemoryTorrent>>,
    published: HashMap<InfoHash, Vec<u8>>,
    swarms: HashMap<InfoHash, Swarm>,
}

struct EngineShared {
    core: Mutex<EngineCore>,
}

impl EngineShared {
    fn emit(&self, alert: Alert) {
        if let Some(sender) = &self.core.lock().alerts {
            // Receiver gone means the session stopped listening.
            let _ = sender.send(alert);
        }
    }

    fn swarm(&self, info_hash: &InfoHash) -> Option<Swarm> {
        self.core.lock().swarms.get(info_hash).copied()
    }
}

/// Engine that simulates a swarm in memory.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EngineShared {
                core: Mutex::new(EngineCore {
                    alerts: None,
                    params: None,
                    dht_started: false,
                    dht_nodes: DEFAULT_SIMULATED_DHT_NODES,
                    start_failure: None,
                    add_failure: None,
                    torrents: HashMap::new(),
                    published: HashMap::new(),
                    swarms: HashMap::new(),
                }),
            }),
        }
    }

    /// Makes the next `start` call fail with `reason`.
    pub fn fail_start(&self, reason: impl Into<String>) {
        self.shared.core.lock().start_failure = Some(reason.into());
    }

    /// Makes every add fail with `reason` until reset with `None`.
    pub fn reject_adds(&self, reason: Option<String>) {
        self.shared.core.lock().add_failure = reason;
    }

    /// Number of DHT nodes reported after `start_dht`.
    pub fn set_dht_nodes(&self, nodes: usize) {
        self.shared.core.lock().dht_nodes = nodes;
    }

    /// Makes bencoded torrent bytes available to `fetch_magnet`.
    pub fn publish_metadata(&self, info_hash: InfoHash, torrent_bytes: Vec<u8>) {
        self.shared
            .core
            .lock()
            .published
            .insert(info_hash, torrent_bytes);
    }

    /// Sets the swarm reported by scrapes and status for `info_hash`.
    pub fn set_swarm(&self, info_hash: InfoHash, seeds: u32, peers: u32) {
        self.shared
            .core
            .lock()
            .swarms
            .insert(info_hash, Swarm { seeds, peers });
    }

    /// Marks a global piece as downloaded and emits `PieceFinished` the
    /// first time it arrives.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownTorrent` - Torrent not registered
    /// - `EngineError::PieceOutOfRange` - No such piece
    pub fn complete_piece(&self, info_hash: InfoHash, piece: u32) -> Result<(), EngineError> {
        let torrent = self.registered(info_hash)?;
        if torrent.mark_have(piece)? {
            tracing::trace!("Simulated piece {} of {} finished", piece, info_hash);
            self.shared.emit(Alert::PieceFinished { info_hash, piece });
        }
        Ok(())
    }

    /// Emits a `Stats` alert for a registered torrent.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownTorrent` - Torrent not registered
    pub fn post_stats(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.registered(info_hash)?;
        self.shared.emit(Alert::Stats { info_hash });
        Ok(())
    }

    /// Emits `MetadataFailed` for a registered torrent.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownTorrent` - Torrent not registered
    pub fn fail_metadata(&self, info_hash: InfoHash, message: &str) -> Result<(), EngineError> {
        self.registered(info_hash)?;
        self.shared.emit(Alert::MetadataFailed {
            info_hash,
            message: message.to_string(),
        });
        Ok(())
    }

    /// Sets the transfer rates reported while the torrent is not paused.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownTorrent` - Torrent not registered
    pub fn set_transfer_rates(
        &self,
        info_hash: InfoHash,
        download_rate: u64,
        upload_rate: u64,
    ) -> Result<(), EngineError> {
        let torrent = self.registered(info_hash)?;
        let mut book = torrent.book.lock();
        book.download_rate = download_rate;
        book.upload_rate = upload_rate;
        Ok(())
    }

    /// Concrete torrent for inspecting deadlines and flags.
    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<MemoryTorrent>> {
        self.shared.core.lock().torrents.get(&info_hash).cloned()
    }

    pub fn torrent_count(&self) -> usize {
        self.shared.core.lock().torrents.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.core.lock().alerts.is_some()
    }

    /// Parameters of the current run, if started.
    pub fn session_params(&self) -> Option<SessionParams> {
        self.shared.core.lock().params.clone()
    }

    fn registered(&self, info_hash: InfoHash) -> Result<Arc<MemoryTorrent>, EngineError> {
        self.torrent(info_hash)
            .ok_or(EngineError::UnknownTorrent { info_hash })
    }
}

#[async_trait]
impl TorrentEngine for MemoryEngine {
    fn start(&self, params: SessionParams) -> Result<AlertReceiver, EngineError> {
        let mut core = self.shared.core.lock();
        if let Some(reason) = core.start_failure.take() {
            return Err(EngineError::Operation { context: reason });
        }
        if core.alerts.is_some() {
            return Err(EngineError::Operation {
                context: "Engine already running".to_string(),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        core.alerts = Some(sender);
        tracing::debug!("Memory engine started with {:?}", params);
        core.params = Some(params);
        Ok(receiver)
    }

    fn stop(&self) {
        let torrents: Vec<Arc<MemoryTorrent>> = {
            let mut core = self.shared.core.lock();
            if core.alerts.take().is_none() {
                return;
            }
            core.dht_started = false;
            core.params = None;
            core.torrents.drain().map(|(_, torrent)| torrent).collect()
        };

        for torrent in &torrents {
            torrent.invalidate();
        }
        tracing::debug!("Memory engine stopped, {} torrents dropped", torrents.len());
    }

    fn start_dht(&self) -> Result<(), EngineError> {
        let mut core = self.shared.core.lock();
        if core.alerts.is_none() {
            return Err(EngineError::NotRunning);
        }
        core.dht_started = true;
        Ok(())
    }

    fn dht_node_count(&self) -> usize {
        let core = self.shared.core.lock();
        if core.dht_started { core.dht_nodes } else { 0 }
    }

    fn async_add_torrent(&self, params: AddTorrentParams) -> Result<(), EngineError> {
        let info_hash = params.metadata.info_hash;
        let alert = {
            let mut core = self.shared.core.lock();
            if core.alerts.is_none() {
                return Err(EngineError::NotRunning);
            }

            let file_count = params.metadata.files.len();
            if let Some(reason) = &core.add_failure {
                Alert::AddTorrentFailed {
                    info_hash,
                    message: reason.clone(),
                }
            } else if !params.file_priorities.is_empty() && params.file_priorities.len() != file_count
            {
                Alert::AddTorrentFailed {
                    info_hash,
                    message: format!(
                        "{} file priorities for {file_count} files",
                        params.file_priorities.len()
                    ),
                }
            } else {
                if !core.torrents.contains_key(&info_hash) {
                    let torrent = MemoryTorrent::new(params, Arc::downgrade(&self.shared));
                    core.torrents.insert(info_hash, Arc::new(torrent));
                }
                Alert::TorrentAdded { info_hash }
            }
        };

        self.shared.emit(alert);
        Ok(())
    }

    fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        let torrent = {
            let mut core = self.shared.core.lock();
            if core.alerts.is_none() {
                return Err(EngineError::NotRunning);
            }
            core.torrents
                .remove(&info_hash)
                .ok_or(EngineError::UnknownTorrent { info_hash })?
        };
        torrent.invalidate();
        Ok(())
    }

    fn find_torrent(&self, info_hash: InfoHash) -> Option<TorrentHandle> {
        self.torrent(info_hash)
            .map(|torrent| torrent as TorrentHandle)
    }

    async fn fetch_magnet(
        &self,
        magnet: &MagnetLink,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let info_hash = magnet.info_hash;
        let poll = async {
            loop {
                let published = self.shared.core.lock().published.get(&info_hash).cloned();
                if let Some(bytes) = published {
                    return bytes;
                }
                tokio::time::sleep(MAGNET_POLL_INTERVAL).await;
            }
        };

        Ok(tokio::time::timeout(timeout, poll).await.ok())
    }
}

#[derive(Debug)]
struct PieceBook {
    valid: bool,
    paused: bool,
    sequential: bool,
    file_priorities: Vec<Priority>,
    piece_priorities: Vec<Priority>,
    deadlines: HashMap<u32, Duration>,
    have: Vec<bool>,
    download_rate: u64,
    upload_rate: u64,
}

/// Torrent registered with a [`MemoryEngine`].
#[derive(Debug)]
pub struct MemoryTorrent {
    info_hash: InfoHash,
    metadata: Arc<TorrentMetadata>,
    save_path: PathBuf,
    engine: Weak<EngineShared>,
    book: Mutex<PieceBook>,
}

impl MemoryTorrent {
    fn new(params: AddTorrentParams, engine: Weak<EngineShared>) -> Self {
        let file_priorities = if params.file_priorities.is_empty() {
            vec![Priority::Normal; params.metadata.files.len()]
        } else {
            params.file_priorities
        };
        let piece_count = params.metadata.piece_count() as usize;
        let piece_priorities = derive_piece_priorities(&params.metadata, &file_priorities);

        Self {
            info_hash: params.metadata.info_hash,
            metadata: params.metadata,
            save_path: params.save_path,
            engine,
            book: Mutex::new(PieceBook {
                valid: true,
                // Added torrents start paused until a stream resumes them.
                paused: true,
                sequential: false,
                file_priorities,
                piece_priorities,
                deadlines: HashMap::new(),
                have: vec![false; piece_count],
                download_rate: 0,
                upload_rate: 0,
            }),
        }
    }

    /// Deadline currently set for a global piece.
    pub fn piece_deadline(&self, piece: u32) -> Option<Duration> {
        self.book.lock().deadlines.get(&piece).copied()
    }

    pub fn deadline_count(&self) -> usize {
        self.book.lock().deadlines.len()
    }

    pub fn is_paused(&self) -> bool {
        self.book.lock().paused
    }

    fn invalidate(&self) {
        self.book.lock().valid = false;
    }

    fn mark_have(&self, piece: u32) -> Result<bool, EngineError> {
        let mut book = self.book.lock();
        self.check_piece(piece)?;
        let slot = &mut book.have[piece as usize];
        let newly = !*slot;
        *slot = true;
        Ok(newly)
    }

    fn check_piece(&self, piece: u32) -> Result<(), EngineError> {
        let piece_count = self.metadata.piece_count();
        if piece >= piece_count {
            return Err(EngineError::PieceOutOfRange { piece, piece_count });
        }
        Ok(())
    }

    fn ensure_valid(&self, book: &PieceBook) -> Result<(), EngineError> {
        if book.valid {
            Ok(())
        } else {
            Err(EngineError::InvalidHandle {
                info_hash: self.info_hash,
            })
        }
    }

    fn emit(&self, alert: Alert) {
        if let Some(engine) = self.engine.upgrade() {
            engine.emit(alert);
        }
    }
}

/// A piece takes the highest priority of any file overlapping it.
fn derive_piece_priorities(metadata: &TorrentMetadata, file_priorities: &[Priority]) -> Vec<Priority> {
    let mut pieces = vec![Priority::Ignore; metadata.piece_count() as usize];
    for (index, &priority) in file_priorities.iter().enumerate() {
        let Some(range) = metadata.pieces_for_file(index) else {
            continue;
        };
        for piece in range {
            if let Some(slot) = pieces.get_mut(piece as usize) {
                *slot = (*slot).max(priority);
            }
        }
    }
    pieces
}

impl EngineHandle for MemoryTorrent {
    fn is_valid(&self) -> bool {
        self.book.lock().valid
    }

    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn metadata(&self) -> Arc<TorrentMetadata> {
        Arc::clone(&self.metadata)
    }

    fn save_path(&self) -> PathBuf {
        self.save_path.clone()
    }

    fn file_priorities(&self) -> Vec<Priority> {
        self.book.lock().file_priorities.clone()
    }

    fn prioritize_files(&self, priorities: &[Priority]) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        self.ensure_valid(&book)?;
        if priorities.len() != self.metadata.files.len() {
            return Err(EngineError::Operation {
                context: format!(
                    "{} file priorities for {} files",
                    priorities.len(),
                    self.metadata.files.len()
                ),
            });
        }

        book.file_priorities = priorities.to_vec();
        book.piece_priorities = derive_piece_priorities(&self.metadata, priorities);
        Ok(())
    }

    fn piece_priorities(&self) -> Vec<Priority> {
        self.book.lock().piece_priorities.clone()
    }

    fn set_piece_priority(&self, piece: u32, priority: Priority) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        self.ensure_valid(&book)?;
        self.check_piece(piece)?;
        book.piece_priorities[piece as usize] = priority;
        Ok(())
    }

    fn set_piece_deadline(&self, piece: u32, deadline: Duration) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        self.ensure_valid(&book)?;
        self.check_piece(piece)?;
        book.deadlines.insert(piece, deadline);
        Ok(())
    }

    fn clear_piece_deadlines(&self) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        self.ensure_valid(&book)?;
        book.deadlines.clear();
        Ok(())
    }

    fn have_piece(&self, piece: u32) -> bool {
        let book = self.book.lock();
        book.valid && book.have.get(piece as usize).copied().unwrap_or(false)
    }

    fn pause(&self) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        self.ensure_valid(&book)?;
        book.paused = true;
        Ok(())
    }

    fn resume(&self) -> Result<(), EngineError> {
        let was_paused = {
            let mut book = self.book.lock();
            self.ensure_valid(&book)?;
            std::mem::replace(&mut book.paused, false)
        };

        if was_paused {
            if let Some(url) = self.metadata.announce_urls.first() {
                self.emit(Alert::TrackerAnnounce {
                    info_hash: self.info_hash,
                    url: url.clone(),
                });
            }
        }
        Ok(())
    }

    fn set_sequential_download(&self, sequential: bool) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        self.ensure_valid(&book)?;
        book.sequential = sequential;
        Ok(())
    }

    fn status(&self) -> TorrentStatus {
        let swarm = self
            .engine
            .upgrade()
            .and_then(|engine| engine.swarm(&self.info_hash))
            .unwrap_or(Swarm { seeds: 0, peers: 0 });

        let book = self.book.lock();
        let mut total_wanted = 0u64;
        let mut total_wanted_done = 0u64;
        for (piece, priority) in book.piece_priorities.iter().enumerate() {
            if *priority == Priority::Ignore {
                continue;
            }
            let size = self.metadata.piece_size(piece as u32);
            total_wanted += size;
            if book.have[piece] {
                total_wanted_done += size;
            }
        }

        // Nothing wanted yet means no file has been selected, not finished.
        let state = if book.have.iter().all(|&have| have) {
            EngineTorrentState::Seeding
        } else if total_wanted > 0 && total_wanted_done == total_wanted {
            EngineTorrentState::Finished
        } else {
            EngineTorrentState::Downloading
        };

        let progress = if total_wanted == 0 {
            0.0
        } else {
            (total_wanted_done as f64 / total_wanted as f64) as f32
        };
        let active = book.valid && !book.paused;

        TorrentStatus {
            state,
            paused: book.paused,
            sequential_download: book.sequential,
            progress,
            num_seeds: swarm.seeds,
            num_peers: swarm.peers,
            download_rate: if active { book.download_rate } else { 0 },
            upload_rate: if active { book.upload_rate } else { 0 },
            total_wanted_done,
            total_wanted,
        }
    }

    fn scrape_tracker(&self) -> Result<(), EngineError> {
        {
            let book = self.book.lock();
            self.ensure_valid(&book)?;
        }

        let Some(engine) = self.engine.upgrade() else {
            return Err(EngineError::NotRunning);
        };
        let alert = match engine.swarm(&self.info_hash) {
            Some(swarm) => Alert::ScrapeReply {
                info_hash: self.info_hash,
                complete: swarm.seeds,
                incomplete: swarm.peers,
            },
            None => Alert::ScrapeFailed {
                info_hash: self.info_hash,
                message: "No tracker replied".to_string(),
            },
        };
        engine.emit(alert);
        Ok(())
    }
}
