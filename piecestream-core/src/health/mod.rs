//! Swarm health scoring
//!
//! A health score combines the seed to peer ratio with the absolute seed
//! count. Seed and peer counts come from a one-shot tracker scrape, see
//! [`HealthEstimator`].

pub mod probe;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

pub use probe::HealthEstimator;

use crate::resolver::ResolveError;
use crate::session::SessionError;

/// A seed to peer ratio of 5 already scores 100.
const RATIO_CEILING: f64 = 5.0;
/// 30 seeds already score 100.
const SEEDS_CEILING: f64 = 30.0;
const RATIO_WEIGHT: f64 = 0.6;
const SEEDS_WEIGHT: f64 = 0.4;

/// Discrete swarm health, ordered from worst to best after `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Bad,
    Medium,
    Good,
    Excellent,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Unknown => "unknown",
            HealthState::Bad => "bad",
            HealthState::Medium => "medium",
            HealthState::Good => "good",
            HealthState::Excellent => "excellent",
        };
        write!(f, "{name}")
    }
}

/// Health snapshot, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub state: HealthState,
    /// Seeds per peer, or the seed count when there are no peers.
    pub ratio: f32,
    pub seeds: u32,
    pub peers: u32,
}

impl Health {
    pub fn unknown() -> Self {
        Self {
            state: HealthState::Unknown,
            ratio: 0.0,
            seeds: 0,
            peers: 0,
        }
    }
}

/// Scores a swarm from its seed and peer counts.
pub fn calculate_health(seeds: u32, peers: u32) -> Health {
    if seeds == 0 && peers == 0 {
        return Health::unknown();
    }

    let seeds_f = f64::from(seeds);
    let ratio = if peers > 0 {
        seeds_f / f64::from(peers)
    } else {
        seeds_f
    };

    let normalized_ratio = (ratio / RATIO_CEILING * 100.0).min(100.0);
    let normalized_seeds = (seeds_f / SEEDS_CEILING * 100.0).min(100.0);
    let weighted_total = normalized_ratio * RATIO_WEIGHT + normalized_seeds * SEEDS_WEIGHT;

    let state = match (weighted_total * 3.0 / 100.0).floor() as i64 {
        0 => HealthState::Bad,
        1 => HealthState::Medium,
        2 => HealthState::Good,
        3 => HealthState::Excellent,
        _ => HealthState::Unknown,
    };

    Health {
        state,
        ratio: ratio as f32,
        seeds,
        peers,
    }
}

/// Errors raised while probing swarm health.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Health probe failed: {reason}")]
    Probe { reason: String },

    #[error("No scrape reply within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Could not resolve torrent: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
