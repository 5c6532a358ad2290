//! Lifecycle wrapper around the embedded torrent engine
//!
//! `TorrentSession` owns the engine for the whole process. It bootstraps the
//! DHT on a background task, funnels engine alerts into one dispatch task
//! and guards every operation behind the `Running` state.

pub mod listeners;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

pub use listeners::{AlertListener, SubscriptionId};
use listeners::ListenerRegistry;

use crate::config::SessionConfig;
use crate::engine::{
    AddTorrentParams, Alert, AlertReceiver, EngineError, Priority, TorrentEngine, TorrentHandle,
};
use crate::torrent::{InfoHash, MagnetLink, TorrentMetadata};

/// Lifecycle of a [`TorrentSession`].
///
/// `Error` and `Stopped` are terminal; a failed session must be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Initializing,
    Running,
    Error,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Creating => "creating",
            SessionState::Initializing => "initializing",
            SessionState::Running => "running",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Errors raised by session operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Session is not running (state: {state})")]
    InvalidSessionState { state: SessionState },

    #[error("Torrent {info_hash} is not managed by this session")]
    NotManaged { info_hash: InfoHash },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

type AddResult = Result<(), String>;

/// Who holds which torrent, and which additions are still in flight.
#[derive(Default)]
struct HandleBook {
    /// Outstanding `add_torrent` results per torrent, each released by one
    /// `remove_torrent`.
    claims: HashMap<InfoHash, usize>,
    pending_adds: HashMap<InfoHash, Vec<oneshot::Sender<AddResult>>>,
    /// Additions whose caller gave up before the engine registered them.
    abandoned: HashSet<InfoHash>,
}

struct SessionInner {
    engine: Arc<dyn TorrentEngine>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    last_error: Mutex<Option<SessionError>>,
    initialize_called: AtomicBool,
    engine_started: AtomicBool,
    listeners: ListenerRegistry,
    book: Mutex<HandleBook>,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves to `next` unless the session already reached a terminal state.
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if matches!(*current, SessionState::Error | SessionState::Stopped)
                || *current == next
            {
                return false;
            }
            tracing::debug!("Session state {} -> {}", current, next);
            *current = next;
            true
        })
    }

    fn fail(&self, error: SessionError) {
        tracing::error!("Session initialization failed: {}", error);
        *self.last_error.lock() = Some(error);
        self.transition(SessionState::Error);
    }

    fn dispatch(&self, alert: &Alert) {
        match alert {
            Alert::TorrentAdded { info_hash } => self.complete_add(info_hash, Ok(())),
            Alert::AddTorrentFailed { info_hash, message } => {
                self.complete_add(info_hash, Err(message.clone()))
            }
            _ => {}
        }
        self.listeners.dispatch(alert);
    }

    /// Answers every waiter and records a claim for each one still listening.
    fn complete_add(&self, info_hash: &InfoHash, result: AddResult) {
        let mut book = self.book.lock();
        let waiters = book.pending_adds.remove(info_hash).unwrap_or_default();
        let abandoned = book.abandoned.remove(info_hash);

        let mut claimed = 0;
        for waiter in waiters {
            if waiter.send(result.clone()).is_ok() && result.is_ok() {
                claimed += 1;
            }
        }

        if claimed > 0 {
            *book.claims.entry(*info_hash).or_default() += claimed;
        } else if abandoned && result.is_ok() && !book.claims.contains_key(info_hash) {
            tracing::debug!("Discarding torrent {} added after its caller gave up", info_hash);
            if let Err(error) = self.engine.remove_torrent(*info_hash) {
                tracing::warn!("Failed to discard abandoned torrent {}: {}", info_hash, error);
            }
        }
    }

    /// Drops one claim on `info_hash`. The engine only forgets the torrent
    /// once nobody holds it.
    fn release(&self, info_hash: InfoHash) -> Result<(), SessionError> {
        let mut book = self.book.lock();
        if let Some(count) = book.claims.get_mut(&info_hash) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                tracing::debug!("Torrent {} still held by {} callers", info_hash, count);
                return Ok(());
            }
            book.claims.remove(&info_hash);
        }

        match self.engine.remove_torrent(info_hash) {
            Ok(()) => {
                tracing::info!("Removed torrent {} from session", info_hash);
                Ok(())
            }
            Err(EngineError::UnknownTorrent { info_hash }) => {
                Err(SessionError::NotManaged { info_hash })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Cleans up after an `add_torrent` caller that stopped waiting. The
    /// torrent is removed unless someone else claimed or is still adding it.
    fn abandon_add(&self, info_hash: InfoHash) {
        let mut book = self.book.lock();
        if let Some(waiters) = book.pending_adds.get_mut(&info_hash) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                book.pending_adds.remove(&info_hash);
            }
        }
        if book.claims.contains_key(&info_hash) || book.pending_adds.contains_key(&info_hash) {
            return;
        }

        match self.engine.remove_torrent(info_hash) {
            Ok(()) => tracing::debug!("Discarded abandoned torrent {}", info_hash),
            Err(EngineError::UnknownTorrent { .. }) => {
                book.abandoned.insert(info_hash);
            }
            Err(error) => {
                tracing::debug!("Could not discard abandoned torrent {}: {}", info_hash, error)
            }
        }
    }
}

/// An `add_torrent` call waiting for the engine's confirmation.
///
/// Dropping it before [`wait`](Self::wait) returns hands the torrent back,
/// so a cancelled or timed out add never leaves an unclaimed torrent behind.
struct PendingAdd<'a> {
    inner: &'a SessionInner,
    info_hash: InfoHash,
    receiver: Option<oneshot::Receiver<AddResult>>,
}

impl PendingAdd<'_> {
    async fn wait(&mut self) -> AddResult {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err("torrent add already finished".to_string());
        };
        let outcome = receiver
            .await
            .unwrap_or_else(|_| Err("session stopped before the torrent was added".to_string()));
        self.receiver = None;
        outcome
    }
}

impl Drop for PendingAdd<'_> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        if let Ok(Ok(())) = receiver.try_recv() {
            // Confirmed and claimed, but never handed to the caller.
            if let Err(error) = self.inner.release(self.info_hash) {
                tracing::debug!("Could not release torrent {}: {}", self.info_hash, error);
            }
        } else {
            drop(receiver);
            self.inner.abandon_add(self.info_hash);
        }
    }
}

/// Shared handle to the engine session. Clones refer to the same session.
#[derive(Clone)]
pub struct TorrentSession {
    inner: Arc<SessionInner>,
}

impl TorrentSession {
    /// Creates a session in `Creating` state. Nothing starts until
    /// [`initialize`](Self::initialize).
    pub fn new(engine: Arc<dyn TorrentEngine>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Creating);
        Self {
            inner: Arc::new(SessionInner {
                engine,
                config,
                state,
                last_error: Mutex::new(None),
                initialize_called: AtomicBool::new(false),
                engine_started: AtomicBool::new(false),
                listeners: ListenerRegistry::default(),
                book: Mutex::new(HandleBook::default()),
            }),
        }
    }

    /// Starts the engine and DHT bootstrap on a background task.
    ///
    /// Only the first call has any effect. Must be called inside a tokio
    /// runtime. Observe the outcome with [`state`](Self::state) or
    /// [`wait_until_running`](Self::wait_until_running).
    pub fn initialize(&self) {
        if self.inner.initialize_called.swap(true, Ordering::SeqCst) {
            tracing::debug!("Session initialize called again, ignoring");
            return;
        }

        self.inner.transition(SessionState::Initializing);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(error) = bootstrap(&inner).await {
                inner.fail(error);
            }
        });
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Cause of the transition to `Error`, if any.
    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.last_error.lock().clone()
    }

    /// Waits until bootstrap finishes.
    ///
    /// # Errors
    ///
    /// - `SessionError::Timeout` - Still bootstrapping after `timeout`
    /// - The stored bootstrap error when the session failed
    /// - `SessionError::InvalidSessionState` - Session stopped or never initialized
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut receiver = self.inner.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            receiver.wait_for(|state| *state != SessionState::Initializing),
        )
        .await
        .map_err(|_| SessionError::Timeout {
            operation: "session bootstrap",
            timeout,
        })?;

        let state = settled.map(|state| *state).unwrap_or(SessionState::Stopped);
        match state {
            SessionState::Running => Ok(()),
            SessionState::Error => Err(self
                .last_error()
                .unwrap_or(SessionError::InvalidSessionState { state })),
            state => Err(SessionError::InvalidSessionState { state }),
        }
    }

    /// Adds a torrent with every file ignored, or returns the existing
    /// handle when the engine already has it.
    ///
    /// Every successful call holds the torrent until a matching
    /// [`remove_torrent`](Self::remove_torrent). Dropping the returned future
    /// early removes a torrent nobody else holds.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidSessionState` - Session not running
    /// - `SessionError::Engine` - Engine rejected the torrent
    /// - `SessionError::Timeout` - Engine never confirmed the addition
    pub async fn add_torrent(
        &self,
        metadata: Arc<TorrentMetadata>,
        save_path: &Path,
    ) -> Result<TorrentHandle, SessionError> {
        self.ensure_running()?;
        let info_hash = metadata.info_hash;

        {
            let mut book = self.inner.book.lock();
            if let Some(handle) = self.inner.engine.find_torrent(info_hash) {
                if handle.is_valid() {
                    *book.claims.entry(info_hash).or_default() += 1;
                    tracing::debug!("Reusing existing handle for {}", info_hash);
                    return Ok(handle);
                }
            }
        }

        let (sender, receiver) = oneshot::channel();
        self.inner
            .book
            .lock()
            .pending_adds
            .entry(info_hash)
            .or_default()
            .push(sender);
        let mut pending = PendingAdd {
            inner: &self.inner,
            info_hash,
            receiver: Some(receiver),
        };

        let params = AddTorrentParams {
            file_priorities: vec![Priority::Ignore; metadata.files.len()],
            metadata,
            save_path: save_path.to_path_buf(),
        };
        self.inner.engine.async_add_torrent(params)?;

        let timeout = self.inner.config.add_torrent_timeout;
        let outcome = tokio::time::timeout(timeout, pending.wait())
            .await
            .map_err(|_| SessionError::Timeout {
                operation: "torrent add",
                timeout,
            })?;
        outcome.map_err(|context| EngineError::Operation { context })?;

        let Some(handle) = self.inner.engine.find_torrent(info_hash) else {
            self.inner.book.lock().claims.remove(&info_hash);
            return Err(EngineError::UnknownTorrent { info_hash }.into());
        };
        tracing::info!("Added torrent {} to session", info_hash);
        Ok(handle)
    }

    /// Releases one hold on a torrent taken by
    /// [`add_torrent`](Self::add_torrent). The engine removes the torrent
    /// when the last holder lets go.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidSessionState` - Session not running
    /// - `SessionError::NotManaged` - Engine does not know the torrent
    pub fn remove_torrent(&self, handle: &TorrentHandle) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.inner.release(handle.info_hash())
    }

    /// Looks up a valid handle by info hash.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidSessionState` - Session not running
    pub fn find_handle(&self, info_hash: InfoHash) -> Result<Option<TorrentHandle>, SessionError> {
        self.ensure_running()?;
        Ok(self
            .inner
            .engine
            .find_torrent(info_hash)
            .filter(|handle| handle.is_valid()))
    }

    /// Registers an alert listener.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidSessionState` - Session not running
    pub fn subscribe(&self, listener: Arc<dyn AlertListener>) -> Result<SubscriptionId, SessionError> {
        self.ensure_running()?;
        Ok(self.inner.listeners.add(listener))
    }

    /// Removes a listener. Returns whether it was registered.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidSessionState` - Session not running
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, SessionError> {
        self.ensure_running()?;
        Ok(self.inner.listeners.remove(id))
    }

    /// Downloads magnet metadata through the engine.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidSessionState` - Session not running
    /// - `SessionError::Engine` - Engine failure
    pub async fn fetch_magnet(
        &self,
        magnet: &MagnetLink,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        self.ensure_running()?;
        Ok(self.inner.engine.fetch_magnet(magnet, timeout).await?)
    }

    /// Stops the engine and drops every listener.
    ///
    /// Safe in any state, including after a failed or unfinished
    /// initialization.
    pub fn shutdown(&self) {
        if self.inner.engine_started.swap(false, Ordering::SeqCst) {
            self.inner.engine.stop();
        }
        self.inner.listeners.clear();
        *self.inner.book.lock() = HandleBook::default();
        self.inner.state.send_if_modified(|state| {
            let changed = *state != SessionState::Stopped;
            *state = SessionState::Stopped;
            changed
        });
        tracing::info!("Torrent session shut down");
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        match self.inner.state() {
            SessionState::Running => Ok(()),
            state => Err(SessionError::InvalidSessionState { state }),
        }
    }
}

async fn bootstrap(inner: &Arc<SessionInner>) -> Result<(), SessionError> {
    let config = &inner.config;
    let alerts = inner.engine.start(config.session_params())?;
    inner.engine_started.store(true, Ordering::SeqCst);
    if inner.state() == SessionState::Stopped {
        // Shut down while the engine was starting.
        inner.engine.stop();
        return Ok(());
    }
    tokio::spawn(dispatch_alerts(Arc::downgrade(inner), alerts));

    inner.engine.start_dht()?;
    tracing::debug!("Waiting for {} DHT nodes", config.min_dht_nodes);

    let engine = Arc::clone(&inner.engine);
    let min_nodes = config.min_dht_nodes;
    let poll_interval = config.dht_poll_interval;
    tokio::time::timeout(config.dht_bootstrap_timeout, async move {
        while engine.dht_node_count() < min_nodes {
            tokio::time::sleep(poll_interval).await;
        }
    })
    .await
    .map_err(|_| SessionError::Timeout {
        operation: "DHT bootstrap",
        timeout: config.dht_bootstrap_timeout,
    })?;

    if inner.transition(SessionState::Running) {
        tracing::info!(
            "Torrent session running with {} DHT nodes",
            inner.engine.dht_node_count()
        );
    }
    Ok(())
}

async fn dispatch_alerts(inner: Weak<SessionInner>, mut alerts: AlertReceiver) {
    while let Some(alert) = alerts.recv().await {
        let Some(session) = inner.upgrade() else {
            break;
        };
        tracing::trace!("Dispatching {:?}", alert);
        session.dispatch(&alert);
    }
    tracing::debug!("Alert dispatch finished");
}
