//! Peer scoring.
//!
//! Two scales, both clamped to [0, 100]:
//!
//! - **quality score**: how good the link to this peer has historically
//!   been; pure function of [`ConnectionQuality`].
//! - **reconnection score**: how promising a reconnect attempt is right
//!   now; mixes quality with recency, track record and attempt fatigue.
//!
//! A separate **cold-start score** ranks very recent peers when the node
//! wakes with zero live channels and cannot rely on the mesh for help.
//!
//! ## Scoring Bands
//!
//! | Input | Band | Points |
//! |-------|------|--------|
//! | latency | ≤50 / ≤100 / ≤200 / ≤500 / ≤1000 ms | 40 / 35 / 25 / 15 / 5 |
//! | success rate | linear | ×30 |
//! | candidate class | host / srflx / relay | 20 / 12 / 5 |
//! | avg uptime | >600 / >300 / >60 s | 10 / 7 / 4 |

use crate::transport::ConnectionType;

use super::record::{ConnectionQuality, PeerRecord};

/// Link quality on a 0–100 scale
pub fn quality_score(quality: &ConnectionQuality) -> f64 {
    let mut score = 0.0;

    if let Some(latency) = quality.latency_ms {
        score += match latency {
            0..=50 => 40.0,
            51..=100 => 35.0,
            101..=200 => 25.0,
            201..=500 => 15.0,
            501..=1000 => 5.0,
            _ => 0.0,
        };
    }

    score += quality.success_rate.clamp(0.0, 1.0) * 30.0;

    score += match quality.connection_type {
        Some(ConnectionType::Host) => 20.0,
        Some(ConnectionType::Srflx) => 12.0,
        Some(ConnectionType::Relay) => 5.0,
        _ => 0.0,
    };

    score += if quality.avg_uptime_s > 600.0 {
        10.0
    } else if quality.avg_uptime_s > 300.0 {
        7.0
    } else if quality.avg_uptime_s > 60.0 {
        4.0
    } else {
        0.0
    };

    score.clamp(0.0, 100.0)
}

/// Reconnection promise on a 0–100 scale
///
/// `0.4·quality + recency + connection bonus + reliability − attempt
/// fatigue`, clamped.
pub fn reconnection_score(record: &PeerRecord, now_ms: i64) -> f64 {
    let mut score = 0.4 * quality_score(&record.connection_quality);

    let reference = record.last_connected.unwrap_or(record.last_seen);
    let age_ms = now_ms.saturating_sub(reference);
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    score += if age_ms <= DAY_MS {
        30.0
    } else if age_ms <= 3 * DAY_MS {
        20.0
    } else if age_ms <= 7 * DAY_MS {
        10.0
    } else {
        0.0
    };

    score += (2.0 * f64::from(record.connection_quality.successful_connections)).min(20.0);

    let failure_rate = record.connection_quality.failure_rate();
    score += if failure_rate < 0.1 {
        10.0
    } else if failure_rate < 0.3 {
        5.0
    } else {
        0.0
    };

    score -= 5.0 * f64::from(record.reconnection_attempts);

    score.clamp(0.0, 100.0)
}

/// Cold-start ranking for the recent-peers layer
///
/// Rewards very recent connections and direct candidate classes; a
/// blacklisted peer scores zero.
pub fn cold_start_score(record: &PeerRecord, now_ms: i64) -> f64 {
    if record.is_blacklisted(now_ms) {
        return 0.0;
    }

    let mut score = 0.0;

    if let Some(age_ms) = record.ms_since_connected(now_ms) {
        score += if age_ms < 60 * 1000 {
            30.0
        } else if age_ms < 5 * 60 * 1000 {
            20.0
        } else if age_ms < 10 * 60 * 1000 {
            10.0
        } else {
            0.0
        };
    }

    score += match record.connection_quality.connection_type {
        Some(ConnectionType::Host) => 40.0,
        Some(ConnectionType::Srflx) => 25.0,
        Some(ConnectionType::Relay) => 10.0,
        _ => 0.0,
    };

    score += 20.0 * record.connection_quality.success_rate.clamp(0.0, 1.0);
    score -= 5.0 * f64::from(record.reconnection_attempts);

    score.max(0.0)
}

// ============================================================================
// TESTS
// ============================================================================
