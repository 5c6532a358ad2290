//! One-shot tracker scrape through a throwaway torrent handle

use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::oneshot;

use super::{Health, HealthError, calculate_health};
use crate::config::HealthConfig;
use crate::engine::{Alert, AlertType, TorrentHandle};
use crate::session::{AlertListener, SubscriptionId, TorrentSession};
use crate::torrent::{FileEntry, InfoHash, TorrentMetadata};

type ScrapeOutcome = Result<(u32, u32), String>;

const SCRAPE_ALERTS: &[AlertType] = &[AlertType::ScrapeReply, AlertType::ScrapeFailed];

/// Resolves the first scrape reply or failure for one torrent.
struct ScrapeListener {
    info_hash: InfoHash,
    reply: Mutex<Option<oneshot::Sender<ScrapeOutcome>>>,
}

impl AlertListener for ScrapeListener {
    fn alert_types(&self) -> &[AlertType] {
        SCRAPE_ALERTS
    }

    fn on_alert(&self, alert: &Alert) {
        if alert.info_hash() != self.info_hash {
            return;
        }

        let outcome = match alert {
            Alert::ScrapeReply {
                complete,
                incomplete,
                ..
            } => Ok((*complete, *incomplete)),
            Alert::ScrapeFailed { message, .. } => Err(message.clone()),
            _ => return,
        };
        if let Some(reply) = self.reply.lock().take() {
            let _ = reply.send(outcome);
        }
    }
}

/// Hold on a torrent for the length of one scrape.
///
/// Dropping it unsubscribes the listener and releases the handle before the
/// scratch directory goes away, on every exit path including cancellation.
struct ScrapeLease {
    session: TorrentSession,
    handle: TorrentHandle,
    subscription: Option<SubscriptionId>,
    _scratch_dir: TempDir,
}

impl Drop for ScrapeLease {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            if let Err(error) = self.session.unsubscribe(subscription) {
                tracing::warn!("Failed to unsubscribe scrape listener: {}", error);
            }
        }
        if let Err(error) = self.session.remove_torrent(&self.handle) {
            tracing::warn!(
                "Failed to release scrape torrent {}: {}",
                self.handle.info_hash(),
                error
            );
        }
    }
}

/// Estimates swarm health by scraping trackers.
#[derive(Clone)]
pub struct HealthEstimator {
    session: TorrentSession,
    config: HealthConfig,
}

impl HealthEstimator {
    pub fn new(session: TorrentSession, config: HealthConfig) -> Self {
        Self { session, config }
    }

    /// Scores the swarm of the torrent containing `file`.
    ///
    /// Holds the torrent through the session for the duration of one scrape,
    /// sharing the handle of any stream that has it. A torrent added just
    /// for the scrape lives in a temporary directory and is removed again,
    /// together with the directory, whatever the outcome. Streams that pick
    /// up the handle meanwhile keep it.
    ///
    /// # Errors
    ///
    /// - `HealthError::Probe` - File not part of the torrent, or the scrape failed
    /// - `HealthError::Timeout` - No scrape answer within the probe timeout
    /// - `HealthError::Session` - Session not running or the handle could not be added
    /// - `HealthError::Io` - Temporary directory could not be created
    pub async fn health_of_file(
        &self,
        metadata: &Arc<TorrentMetadata>,
        file: &FileEntry,
    ) -> Result<Health, HealthError> {
        if metadata.file(file.index) != Some(file) {
            return Err(HealthError::Probe {
                reason: format!(
                    "{} is not part of torrent {}",
                    file.path.display(),
                    metadata.info_hash
                ),
            });
        }

        let info_hash = metadata.info_hash;
        let scratch_dir = tempfile::Builder::new()
            .prefix("piecestream-health-")
            .tempdir()?;
        let handle = self
            .session
            .add_torrent(Arc::clone(metadata), scratch_dir.path())
            .await?;
        let mut lease = ScrapeLease {
            session: self.session.clone(),
            handle,
            subscription: None,
            _scratch_dir: scratch_dir,
        };

        let (reply, outcome) = oneshot::channel();
        let listener = Arc::new(ScrapeListener {
            info_hash,
            reply: Mutex::new(Some(reply)),
        });
        lease.subscription = Some(self.session.subscribe(listener)?);

        let result = self.scrape(&lease.handle, outcome).await;
        drop(lease);

        let health = result.map(|(seeds, peers)| calculate_health(seeds, peers))?;
        tracing::info!(
            "Health of {}: {} (seeds={}, peers={})",
            info_hash,
            health.state,
            health.seeds,
            health.peers
        );
        Ok(health)
    }

    async fn scrape(
        &self,
        handle: &TorrentHandle,
        outcome: oneshot::Receiver<ScrapeOutcome>,
    ) -> Result<(u32, u32), HealthError> {
        handle.scrape_tracker().map_err(|e| HealthError::Probe {
            reason: e.to_string(),
        })?;

        let timeout = self.config.probe_timeout;
        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(Ok(counts))) => Ok(counts),
            Ok(Ok(Err(reason))) => Err(HealthError::Probe { reason }),
            Ok(Err(_)) => Err(HealthError::Probe {
                reason: "scrape listener dropped".to_string(),
            }),
            Err(_) => Err(HealthError::Timeout { timeout }),
        }
    }
}
