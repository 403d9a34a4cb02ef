use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::RwLock;
use tracing::warn;

/// IP admission control with brute-force protection.
///
/// Counters are monotone until an operator clears the entry; there is no
/// sliding window, so the threshold calibration stays stable under load.
pub struct Firewall {
    threshold: u32,
    failed_auths: RwLock<HashMap<IpAddr, u32>>,
    blacklist: RwLock<HashSet<IpAddr>>,
}

impl Firewall {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failed_auths: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
        }
    }

    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        !self.blacklist.read().unwrap().contains(ip)
    }

    pub fn record_failed_auth(&self, ip: IpAddr) {
        let count = {
            let mut failed = self.failed_auths.write().unwrap();
            let count = failed.entry(ip).or_insert(0);
            *count += 1;
            *count
        };

        if count >= self.threshold && self.blacklist.write().unwrap().insert(ip) {
            warn!(%ip, count, "IP blacklisted after repeated failed registrations");
            crate::metrics::firewall::blacklisted();
        }
    }

    pub fn get_blacklist(&self) -> Vec<IpAddr> {
        self.blacklist.read().unwrap().iter().copied().collect()
    }

    /// Operator reset: drops both the blacklist entry and the counter.
    pub fn clear(&self, ip: &IpAddr) -> bool {
        self.failed_auths.write().unwrap().remove(ip);
        self.blacklist.write().unwrap().remove(ip)
    }
}
