use std::{
    collections::{HashMap, HashSet},
    io,
    net::IpAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::config::{
    AdmissionConfig, BlacklistMode, DEFAULT_IPV4_MASK, DEFAULT_IPV6_MASK, MAX_IPV4_MASK,
    MAX_IPV6_MASK, MIN_IPV4_MASK, MIN_IPV6_MASK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Ip,
    Subnet,
}

/// One persisted line of the blacklist file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub ip: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub violations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlacklistStats {
    pub total_blocked: usize,
    pub blocked_subnets: usize,
    pub active_violators: usize,
}

#[derive(Debug, Default)]
struct BlacklistState {
    ips: HashMap<String, BlacklistEntry>,
    subnets: HashMap<String, (IpNetwork, BlacklistEntry)>,
    violations: HashMap<String, u32>,
    configured: HashSet<String>,
}

impl BlacklistState {
    fn insert(&mut self, entry: BlacklistEntry) {
        match entry.kind {
            EntryKind::Ip => {
                self.ips.insert(entry.ip.clone(), entry);
            }
            EntryKind::Subnet => match entry.ip.parse::<IpNetwork>() {
                Ok(network) => {
                    self.subnets.insert(network.to_string(), (network, entry));
                }
                Err(error) => warn!(subnet = %entry.ip, error = %error, "skipping invalid subnet"),
            },
        }
    }

    fn contains(&self, ip: &str) -> bool {
        if self.ips.contains_key(ip) {
            return true;
        }
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.subnets
            .values()
            .any(|(network, _)| network.contains(addr))
    }

    /// Entries added at runtime, which are the ones written to disk.
    fn dynamic_entries(&self) -> Vec<BlacklistEntry> {
        let mut entries: Vec<BlacklistEntry> = self
            .ips
            .values()
            .chain(self.subnets.values().map(|(_, entry)| entry))
            .filter(|entry| !self.configured.contains(&entry.ip))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.ip.cmp(&b.ip)));
        entries
    }
}

/// Escalates repeat rate-limit offenders into a persisted deny-list of single IPs or
/// whole subnets.
#[derive(Debug)]
pub struct BlacklistManager {
    state: RwLock<BlacklistState>,
    /// Held from snapshot to rename so writes land in mutation order.
    persist_lock: Mutex<()>,
    mode: BlacklistMode,
    threshold: u32,
    path: PathBuf,
    ipv4_mask: u8,
    ipv6_mask: u8,
}

impl BlacklistManager {
    /// Builds the manager from the configured static entries and whatever the blacklist
    /// file already holds. A missing file is not an error.
    pub async fn open(config: &AdmissionConfig) -> Self {
        let mut state = BlacklistState::default();
        let now = Utc::now();
        for raw in &config.blacklist {
            let kind = if raw.contains('/') {
                EntryKind::Subnet
            } else {
                EntryKind::Ip
            };
            let ip = match kind {
                EntryKind::Subnet => match raw.parse::<IpNetwork>() {
                    Ok(network) => network.to_string(),
                    Err(error) => {
                        warn!(entry = %raw, error = %error, "invalid IP_BLACKLIST entry");
                        continue;
                    }
                },
                EntryKind::Ip => raw.clone(),
            };
            state.configured.insert(ip.clone());
            state.insert(BlacklistEntry {
                ip,
                kind,
                added_at: now,
                violations: 0,
            });
        }

        let path = PathBuf::from(&config.blacklist_file);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let entries = parse_snapshot(&contents);
                info!(path = %path.display(), entries = entries.len(), "loaded blacklist");
                for entry in entries {
                    state.insert(entry);
                }
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no blacklist file yet");
            }
            Err(error) => warn!(path = %path.display(), error = %error, "failed to read blacklist"),
        }

        Self {
            state: RwLock::new(state),
            persist_lock: Mutex::new(()),
            mode: config.mode,
            threshold: config.threshold.max(1),
            path,
            ipv4_mask: validate_mask(
                config.ipv4_mask,
                MIN_IPV4_MASK,
                MAX_IPV4_MASK,
                DEFAULT_IPV4_MASK,
                "IPV4_MASK",
            ),
            ipv6_mask: validate_mask(
                config.ipv6_mask,
                MIN_IPV6_MASK,
                MAX_IPV6_MASK,
                DEFAULT_IPV6_MASK,
                "IPV6_MASK",
            ),
        }
    }

    pub async fn is_blocked(&self, ip: &str) -> bool {
        self.state.read().await.contains(ip)
    }

    /// Counts one violation for `ip` and blacklists it, or its subnet, once the count
    /// reaches the threshold. Returns true when a new entry was added.
    pub async fn record_violation(&self, ip: &str) -> bool {
        if self.mode == BlacklistMode::Off {
            return false;
        }

        let added = {
            let mut state = self.state.write().await;
            let count = state.violations.entry(ip.to_owned()).or_insert(0);
            *count = count.saturating_add(1);
            let count = *count;
            if count < self.threshold {
                return false;
            }

            match self.mode {
                BlacklistMode::Subnet => match self.subnet_for(ip) {
                    Some(network) => {
                        let key = network.to_string();
                        if state.subnets.contains_key(&key) {
                            false
                        } else {
                            warn!(ip, subnet = %key, violations = count, "blacklisting subnet");
                            state.insert(BlacklistEntry {
                                ip: key,
                                kind: EntryKind::Subnet,
                                added_at: Utc::now(),
                                violations: count,
                            });
                            true
                        }
                    }
                    None => false,
                },
                _ => {
                    if state.ips.contains_key(ip) {
                        false
                    } else {
                        warn!(ip, violations = count, "blacklisting ip");
                        state.insert(BlacklistEntry {
                            ip: ip.to_owned(),
                            kind: EntryKind::Ip,
                            added_at: Utc::now(),
                            violations: count,
                        });
                        true
                    }
                }
            }
        };

        if added {
            if let Err(error) = self.persist().await {
                warn!(path = %self.path.display(), error = %error, "failed to persist blacklist");
            }
        }
        added
    }

    fn subnet_for(&self, ip: &str) -> Option<IpNetwork> {
        let addr = match ip.parse::<IpAddr>() {
            Ok(addr) => addr,
            Err(error) => {
                warn!(ip, error = %error, "cannot derive subnet");
                return None;
            }
        };
        let mask = match addr {
            IpAddr::V4(_) => self.ipv4_mask,
            IpAddr::V6(_) => self.ipv6_mask,
        };
        IpNetwork::new(addr, mask)
            .and_then(|network| IpNetwork::new(network.network(), mask))
            .ok()
    }

    /// Rewrites the whole file with the current dynamic entries, one JSON object per
    /// line. The snapshot goes to a sibling temp file first and is renamed into place.
    pub async fn persist(&self) -> io::Result<()> {
        let _writer = self.persist_lock.lock().await;
        let contents = {
            let state = self.state.read().await;
            let mut contents = String::new();
            for entry in state.dynamic_entries() {
                contents.push_str(&serde_json::to_string(&entry).map_err(io::Error::other)?);
                contents.push('\n');
            }
            contents
        };

        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, contents).await?;
        tokio::fs::rename(&staging, &self.path).await
    }

    pub async fn entries(&self) -> Vec<BlacklistEntry> {
        self.state.read().await.dynamic_entries()
    }

    pub async fn stats(&self) -> BlacklistStats {
        let state = self.state.read().await;
        BlacklistStats {
            total_blocked: state.ips.len() + state.subnets.len(),
            blocked_subnets: state.subnets.len(),
            active_violators: state.violations.len(),
        }
    }

    /// Drops counters that can no longer matter: zeroed ones and those of IPs that are
    /// already blocked, since blocked IPs never reach the rate limiter again.
    pub async fn cleanup_violations(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.violations.len();
        let blocked: Vec<String> = state
            .violations
            .keys()
            .filter(|ip| state.contains(ip))
            .cloned()
            .collect();
        for ip in &blocked {
            state.violations.remove(ip);
        }
        state.violations.retain(|_, count| *count > 0);
        before - state.violations.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.cleanup_violations().await;
                debug!(removed, "swept violation counters");
            }
        })
    }
}

/// Reads JSON lines. A line holding a JSON array of entries is accepted as well.
fn parse_snapshot(contents: &str) -> Vec<BlacklistEntry> {
    let mut entries = Vec::new();
    for line in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if line.starts_with('[') {
            match serde_json::from_str::<Vec<BlacklistEntry>>(line) {
                Ok(batch) => entries.extend(batch),
                Err(error) => warn!(error = %error, "skipping malformed blacklist line"),
            }
            continue;
        }
        match serde_json::from_str::<BlacklistEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(error) => warn!(error = %error, "skipping malformed blacklist line"),
        }
    }
    entries
}

fn validate_mask(value: u8, min: u8, max: u8, default: u8, name: &str) -> u8 {
    if (min..=max).contains(&value) {
        value
    } else {
        warn!(mask = value, min, max, default, "{name} out of range, using default");
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir, mode: BlacklistMode, threshold: u32) -> AdmissionConfig {
        AdmissionConfig {
            mode,
            threshold,
            blacklist_file: dir
                .path()
                .join("blacklist.txt")
                .to_string_lossy()
                .into_owned(),
            ..AdmissionConfig::default()
        }
    }

    #[tokio::test]
    async fn single_mode_blocks_at_threshold_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BlacklistManager::open(&config(&dir, BlacklistMode::Single, 3)).await;

        assert!(!manager.record_violation("203.0.113.7").await);
        assert!(!manager.record_violation("203.0.113.7").await);
        assert!(!manager.is_blocked("203.0.113.7").await);
        assert!(manager.record_violation("203.0.113.7").await);
        assert!(manager.is_blocked("203.0.113.7").await);
        assert!(!manager.is_blocked("203.0.113.8").await);

        let written = std::fs::read_to_string(dir.path().join("blacklist.txt")).expect("file");
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 1);
        let entry: BlacklistEntry = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(entry.ip, "203.0.113.7");
        assert_eq!(entry.kind, EntryKind::Ip);
        assert_eq!(entry.violations, 3);
    }

    #[tokio::test]
    async fn subnet_mode_blocks_siblings_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BlacklistManager::open(&config(&dir, BlacklistMode::Subnet, 1)).await;

        assert!(manager.record_violation("198.51.100.23").await);
        assert!(manager.is_blocked("198.51.100.200").await);
        assert!(!manager.is_blocked("198.51.101.1").await);

        let entries = manager.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip, "198.51.100.0/24");
        assert_eq!(entries[0].kind, EntryKind::Subnet);

        let stats = manager.stats().await;
        assert_eq!(stats.blocked_subnets, 1);
        assert_eq!(stats.active_violators, 1);
    }

    #[tokio::test]
    async fn ipv6_subnet_uses_configured_mask() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BlacklistManager::open(&config(&dir, BlacklistMode::Subnet, 1)).await;
        assert!(manager.record_violation("2001:db8:1:2::5").await);
        assert!(manager.is_blocked("2001:db8:1:ffff::1").await);
        assert!(!manager.is_blocked("2001:db8:2::1").await);
    }

    #[tokio::test]
    async fn off_mode_records_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BlacklistManager::open(&config(&dir, BlacklistMode::Off, 1)).await;
        assert!(!manager.record_violation("192.0.2.1").await);
        assert_eq!(manager.stats().await.active_violators, 0);
        assert!(!dir.path().join("blacklist.txt").exists());
    }

    #[tokio::test]
    async fn reload_restores_dynamic_entries_and_skips_configured_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut admission = config(&dir, BlacklistMode::Single, 1);
        admission.blacklist = vec!["192.0.2.0/28".to_owned(), "192.0.2.99".to_owned()];

        let manager = BlacklistManager::open(&admission).await;
        assert!(manager.is_blocked("192.0.2.5").await);
        assert!(manager.is_blocked("192.0.2.99").await);
        assert!(manager.record_violation("192.0.2.50").await);
        assert_eq!(manager.entries().await.len(), 1);

        admission.blacklist.clear();
        let reloaded = BlacklistManager::open(&admission).await;
        assert!(reloaded.is_blocked("192.0.2.50").await);
        assert!(!reloaded.is_blocked("192.0.2.5").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_escalations_all_reach_disk() {
        const CLIENTS: usize = 64;
        let dir = tempfile::tempdir().expect("tempdir");
        let admission = config(&dir, BlacklistMode::Single, 1);
        let manager = Arc::new(BlacklistManager::open(&admission).await);

        let tasks: Vec<_> = (0..CLIENTS)
            .map(|n| {
                let manager = manager.clone();
                let ip = format!("10.1.{}.{}", n / 8, n % 8);
                tokio::spawn(async move { manager.record_violation(&ip).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.expect("join"));
        }

        let written = std::fs::read_to_string(dir.path().join("blacklist.txt")).expect("file");
        assert_eq!(parse_snapshot(&written).len(), CLIENTS);
        let reloaded = BlacklistManager::open(&admission).await;
        assert_eq!(reloaded.entries().await.len(), CLIENTS);
        assert!(reloaded.is_blocked("10.1.7.7").await);
        assert!(!dir.path().join("blacklist.txt.tmp").exists());
    }

    #[tokio::test]
    async fn sweep_forgets_counters_of_blocked_ips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BlacklistManager::open(&config(&dir, BlacklistMode::Single, 2)).await;
        assert!(!manager.record_violation("192.0.2.1").await);
        assert!(!manager.record_violation("192.0.2.2").await);
        assert!(manager.record_violation("192.0.2.2").await);
        assert_eq!(manager.stats().await.active_violators, 2);

        assert_eq!(manager.cleanup_violations().await, 1);
        let stats = manager.stats().await;
        assert_eq!(stats.active_violators, 1);
        assert_eq!(stats.total_blocked, 1);
        assert!(manager.is_blocked("192.0.2.2").await);
    }

    #[test]
    fn snapshot_accepts_lines_and_legacy_arrays() {
        let contents = concat!(
            r#"{"ip":"192.0.2.1","type":"ip","added_at":"2024-05-01T00:00:00Z","violations":100}"#,
            "\n\nnot json\n",
            r#"[{"ip":"10.0.0.0/24","type":"subnet","added_at":"2024-05-01T00:00:00Z","violations":7}]"#,
            "\n"
        );
        let entries = parse_snapshot(contents);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, EntryKind::Subnet);
    }

    #[test]
    fn out_of_range_masks_fall_back() {
        assert_eq!(validate_mask(4, 8, 32, 24, "IPV4_MASK"), 24);
        assert_eq!(validate_mask(16, 8, 32, 24, "IPV4_MASK"), 16);
        assert_eq!(validate_mask(129, 32, 128, 48, "IPV6_MASK"), 48);
    }
}
