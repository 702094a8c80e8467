//! Top-level configuration.

use std::time::Duration;

use warden_audit::AuditConfig;
use warden_audit::AuditServiceConfig;
use warden_metainfo::LoopConfig;
use warden_orders::OrdersConfig;
use warden_overlay::OverlayConfig;
use warden_repair::CheckerConfig;
use warden_repair::RepairerConfig;

/// Aggregated tuning surface of the durability core.
#[derive(Debug, Clone)]
pub struct Config {
    pub metainfo_loop: LoopConfig,
    pub checker: CheckerConfig,
    pub repairer: RepairerConfig,
    pub audit: AuditConfig,
    pub audit_service: AuditServiceConfig,
    pub orders: OrdersConfig,
    pub overlay: OverlayConfig,
    /// Max age of the reliable-node snapshot.
    pub reliability_staleness: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            metainfo_loop: LoopConfig::default(),
            checker: CheckerConfig::default(),
            repairer: RepairerConfig::default(),
            audit: AuditConfig::default(),
            audit_service: AuditServiceConfig::default(),
            orders: OrdersConfig::default(),
            overlay: OverlayConfig::default(),
            reliability_staleness: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Tight timings for development and tests.
    pub fn fast() -> Self {
        Config {
            metainfo_loop: LoopConfig {
                interval: Duration::from_millis(50),
                page_size: 100,
            },
            checker: CheckerConfig {
                interval: Duration::from_millis(100),
                irreparable_interval: Duration::from_millis(500),
                irreparable_page_size: 100,
            },
            repairer: RepairerConfig {
                timeout: Duration::from_secs(5),
                excess_optimal: 0.05,
                max_workers: 2,
                poll_interval: Duration::from_millis(50),
            },
            audit_service: AuditServiceConfig {
                interval: Duration::from_millis(100),
                page_size: 100,
            },
            reliability_staleness: Duration::from_millis(50),
            ..Config::default()
        }
    }
}
