//! Centralized configuration for PieceStream.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::SessionParams;

/// Central configuration for all PieceStream components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct PieceStreamConfig {
    pub session: SessionConfig,
    pub resolver: ResolverConfig,
    pub health: HealthConfig,
    pub simulation: SimulationConfig,
}

/// Engine session settings and bootstrap limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hide client identity from peers and trackers
    pub anonymous_mode: bool,
    /// Maximum peer connections across all torrents
    pub connections_limit: u32,
    /// Download limit in bytes per second (None = unlimited)
    pub download_rate_limit: Option<u64>,
    /// Upload limit in bytes per second (None = unlimited)
    pub upload_rate_limit: Option<u64>,
    pub active_dht_limit: u32,
    /// DHT nodes required before the session counts as running
    pub min_dht_nodes: usize,
    pub dht_poll_interval: Duration,
    pub dht_bootstrap_timeout: Duration,
    /// Wait for the engine to confirm a torrent was added
    pub add_torrent_timeout: Duration,
    /// Default directory for stream downloads
    pub save_directory: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let params = SessionParams::default();
        Self {
            anonymous_mode: params.anonymous_mode,
            connections_limit: params.connections_limit,
            download_rate_limit: params.download_rate_limit,
            upload_rate_limit: params.upload_rate_limit,
            active_dht_limit: params.active_dht_limit,
            min_dht_nodes: 10,
            dht_poll_interval: Duration::from_millis(100),
            dht_bootstrap_timeout: Duration::from_secs(60),
            add_torrent_timeout: Duration::from_secs(30),
            save_directory: std::env::temp_dir().join("piecestream"),
        }
    }
}

impl SessionConfig {
    /// Engine settings pack derived from this configuration.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            anonymous_mode: self.anonymous_mode,
            connections_limit: self.connections_limit,
            download_rate_limit: self.download_rate_limit,
            upload_rate_limit: self.upload_rate_limit,
            active_dht_limit: self.active_dht_limit,
        }
    }
}

/// Source resolution timeouts.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Upper bound on fetching magnet metadata from the swarm
    pub magnet_timeout: Duration,
    /// HTTP request timeout for `.torrent` downloads
    pub http_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            magnet_timeout: Duration::from_secs(60),
            http_timeout: Duration::from_secs(30),
            user_agent: "piecestream/0.1.0",
        }
    }
}

/// Swarm health probing.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How long a probe waits for a tracker scrape
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Simulation mode configuration for testing and development.
///
/// When enabled the CLI runs against the in-process engine instead of a
/// real swarm.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub enabled: bool,
    /// Seeds reported for simulated swarms
    pub simulated_seeds: u32,
    /// Leechers reported for simulated swarms
    pub simulated_peers: u32,
    /// Delay between simulated piece arrivals
    pub piece_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            simulated_seeds: 24,
            simulated_peers: 8,
            piece_interval: Duration::from_millis(50),
        }
    }
}

impl PieceStreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("PIECESTREAM_MAGNET_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.resolver.magnet_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(nodes) = std::env::var("PIECESTREAM_MIN_DHT_NODES") {
            if let Ok(count) = nodes.parse::<usize>() {
                config.session.min_dht_nodes = count;
            }
        }

        if let Ok(dir) = std::env::var("PIECESTREAM_SAVE_DIR") {
            if !dir.is_empty() {
                config.session.save_directory = PathBuf::from(dir);
            }
        }

        if let Ok(enabled) = std::env::var("PIECESTREAM_SIMULATION_MODE") {
            config.simulation.enabled = enabled.parse().unwrap_or(false);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            session: SessionConfig {
                min_dht_nodes: 0,
                dht_poll_interval: Duration::from_millis(5),
                dht_bootstrap_timeout: Duration::from_millis(500),
                add_torrent_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            resolver: ResolverConfig {
                magnet_timeout: Duration::from_millis(100),
                http_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            health: HealthConfig {
                probe_timeout: Duration::from_millis(500),
            },
            simulation: SimulationConfig {
                enabled: true,
                piece_interval: Duration::ZERO,
                ..Default::default()
            },
        }
    }
}
