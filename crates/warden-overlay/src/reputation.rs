//! Beta-distribution reputation updates.
//!
//! Each observation is a Bernoulli trial folded into a Beta distribution
//! with a forgetting factor:
//!
//! ```text
//! alpha' = lambda * alpha + weight * v
//! beta'  = lambda * beta  + weight * (1 - v)
//! score  = alpha' / (alpha' + beta')
//! ```
//!
//! where `v` is 1 for success and 0 for failure. A node whose score drops
//! below the disqualification threshold is disqualified permanently; later
//! observations leave its state untouched.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::dossier::NodeDossier;

/// Tuning constants for one reputation dimension (audit or uptime).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Forgetting factor applied to both shape parameters per observation.
    pub lambda: f64,
    /// Weight of one observation.
    pub weight: f64,
    pub initial_alpha: f64,
    pub initial_beta: f64,
    /// Scores below this disqualify the node.
    pub dq_threshold: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            lambda: 0.95,
            weight: 1.0,
            initial_alpha: 1.0,
            initial_beta: 0.0,
            dq_threshold: 0.6,
        }
    }
}

/// Which reputation dimension an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    Audit,
    Uptime,
}

/// Outcome of applying one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The node was already disqualified; nothing changed.
    Ignored,
    /// This observation pushed the score below the threshold.
    Disqualified,
}

/// Fold one observation into a dossier.
///
/// Also bumps the observation counter, refreshes the contact timestamps
/// (uptime observations double as contact evidence), and stamps
/// `vetted_at` once both counters pass the given thresholds.
pub fn apply_observation(
    dossier: &mut NodeDossier,
    kind: ObservationKind,
    success: bool,
    config: &ReputationConfig,
    vetting: VettingThresholds,
    now: DateTime<Utc>,
) -> UpdateOutcome {
    if dossier.is_disqualified() {
        return UpdateOutcome::Ignored;
    }

    let v = if success { 1.0 } else { 0.0 };
    let (alpha, beta) = match kind {
        ObservationKind::Audit => (&mut dossier.reputation.audit_alpha, &mut dossier.reputation.audit_beta),
        ObservationKind::Uptime => (&mut dossier.reputation.uptime_alpha, &mut dossier.reputation.uptime_beta),
    };
    *alpha = config.lambda * *alpha + config.weight * v;
    *beta = config.lambda * *beta + config.weight * (1.0 - v);
    let score = *alpha / (*alpha + *beta);

    match kind {
        ObservationKind::Audit => dossier.reputation.audit_count += 1,
        ObservationKind::Uptime => {
            dossier.reputation.uptime_count += 1;
            if success {
                dossier.last_contact_success = Some(now);
            } else {
                dossier.last_contact_failure = Some(now);
            }
        }
    }

    if dossier.vetted_at.is_none()
        && dossier.reputation.audit_count >= vetting.audit_count
        && dossier.reputation.uptime_count >= vetting.uptime_count
    {
        dossier.vetted_at = Some(now);
    }

    if score < config.dq_threshold {
        dossier.disqualified_at = Some(now);
        return UpdateOutcome::Disqualified;
    }

    UpdateOutcome::Applied
}

/// Observation counts required before a node is considered vetted.
#[derive(Debug, Clone, Copy)]
pub struct VettingThresholds {
    pub audit_count: u64,
    pub uptime_count: u64,
}

impl Default for VettingThresholds {
    fn default() -> Self {
        VettingThresholds {
            audit_count: 100,
            uptime_count: 100,
        }
    }
}
