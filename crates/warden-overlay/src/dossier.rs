//! Node dossiers.
//!
//! The overlay keeps one dossier per storage node: identity, capacity,
//! reputation state, and lifecycle timestamps. Reputation is a pair of Beta
//! distributions (audit, uptime) updated by Bernoulli observations; the
//! update math lives in [`crate::reputation`].

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use warden_core::NodeId;

use crate::reputation::ReputationConfig;

/// Advertised free resources of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub free_disk: u64,
    pub free_bandwidth: u64,
}

/// Beta-distribution reputation state plus observation counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeReputation {
    pub audit_alpha: f64,
    pub audit_beta: f64,
    pub uptime_alpha: f64,
    pub uptime_beta: f64,
    pub audit_count: u64,
    pub uptime_count: u64,
}

impl NodeReputation {
    /// Initial reputation for a freshly seen node.
    pub fn initial(audit: &ReputationConfig, uptime: &ReputationConfig) -> Self {
        NodeReputation {
            audit_alpha: audit.initial_alpha,
            audit_beta: audit.initial_beta,
            uptime_alpha: uptime.initial_alpha,
            uptime_beta: uptime.initial_beta,
            audit_count: 0,
            uptime_count: 0,
        }
    }

    pub fn audit_score(&self) -> f64 {
        score(self.audit_alpha, self.audit_beta)
    }

    pub fn uptime_score(&self) -> f64 {
        score(self.uptime_alpha, self.uptime_beta)
    }
}

fn score(alpha: f64, beta: f64) -> f64 {
    if alpha + beta == 0.0 {
        return 0.0;
    }
    alpha / (alpha + beta)
}

/// Everything the satellite knows about one storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDossier {
    pub id: NodeId,
    /// Dialable address, e.g. `host:port`.
    pub address: String,
    pub capacity: NodeCapacity,
    pub reputation: NodeReputation,
    pub last_contact_success: Option<DateTime<Utc>>,
    pub last_contact_failure: Option<DateTime<Utc>>,
    /// Set exactly once; a disqualified node never comes back.
    pub disqualified_at: Option<DateTime<Utc>>,
    /// Set exactly once, when both observation counters reach their
    /// vetting thresholds.
    pub vetted_at: Option<DateTime<Utc>>,
}

impl NodeDossier {
    pub fn new(
        id: NodeId,
        address: impl Into<String>,
        audit: &ReputationConfig,
        uptime: &ReputationConfig,
    ) -> Self {
        NodeDossier {
            id,
            address: address.into(),
            capacity: NodeCapacity::default(),
            reputation: NodeReputation::initial(audit, uptime),
            last_contact_success: None,
            last_contact_failure: None,
            disqualified_at: None,
            vetted_at: None,
        }
    }

    pub fn is_disqualified(&self) -> bool {
        self.disqualified_at.is_some()
    }

    /// A node is online when its last successful contact falls inside the
    /// configured window.
    pub fn is_online(&self, now: DateTime<Utc>, online_window: Duration) -> bool {
        match self.last_contact_success {
            Some(last) => match now.signed_duration_since(last).to_std() {
                Ok(elapsed) => elapsed < online_window,
                // contact stamped ahead of our clock still counts as fresh
                Err(_) => true,
            },
            None => false,
        }
    }

    pub fn is_vetted(&self) -> bool {
        self.vetted_at.is_some()
    }

    /// Online, not disqualified: eligible for reads and counted as healthy
    /// by the repair path.
    pub fn is_reliable(&self, now: DateTime<Utc>, online_window: Duration) -> bool {
        !self.is_disqualified() && self.is_online(now, online_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dossier() -> NodeDossier {
        let config = ReputationConfig::default();
        NodeDossier::new(NodeId([1u8; 32]), "127.0.0.1:7777", &config, &config)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn fresh_node_is_offline_and_unvetted() {
        let node = dossier();
        assert!(!node.is_online(Utc::now(), HOUR));
        assert!(!node.is_vetted());
        assert!(!node.is_disqualified());
        assert!(!node.is_reliable(Utc::now(), HOUR));
    }

    #[test]
    fn online_window_boundary() {
        let mut node = dossier();
        let now = Utc::now();

        node.last_contact_success = Some(now - chrono::Duration::minutes(59));
        assert!(node.is_online(now, HOUR));

        node.last_contact_success = Some(now - chrono::Duration::hours(1));
        assert!(!node.is_online(now, HOUR));
    }

    #[test]
    fn disqualified_node_is_never_reliable() {
        let mut node = dossier();
        let now = Utc::now();
        node.last_contact_success = Some(now);
        node.disqualified_at = Some(now);
        assert!(!node.is_reliable(now, HOUR));
    }

    #[test]
    fn score_of_fresh_reputation() {
        let config = ReputationConfig::default();
        let rep = NodeReputation::initial(&config, &config);
        assert_eq!(rep.audit_score(), 1.0);
        assert_eq!(rep.uptime_score(), 1.0);
    }
}
