use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::RwLock, task::JoinHandle, time::Instant};
use tracing::{debug, info};

use crate::blacklist::BlacklistManager;
use crate::config::{AdmissionConfig, RateLimitRule};
use crate::errors::AppError;

/// Limit state reported on a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub rule: String,
    pub limit: u32,
    pub window: Duration,
    pub retry_after: Duration,
}

impl RateLimitSnapshot {
    pub fn to_header_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("x-ratelimit-rule".to_owned(), self.rule.clone()),
            ("x-ratelimit-limit".to_owned(), self.limit.to_string()),
            ("x-ratelimit-remaining".to_owned(), "0".to_owned()),
            (
                "retry-after".to_owned(),
                self.retry_after.as_secs().max(1).to_string(),
            ),
        ]
    }
}

#[derive(Debug)]
pub enum RateLimitError {
    Blocked,
    Exceeded(RateLimitSnapshot),
}

impl RateLimitError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Blocked => "ip_blocked",
            Self::Exceeded(_) => "rate_limited",
        }
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        match self {
            Self::Blocked => Vec::new(),
            Self::Exceeded(snapshot) => snapshot.to_header_pairs(),
        }
    }
}

impl From<&RateLimitError> for AppError {
    fn from(error: &RateLimitError) -> Self {
        match error {
            RateLimitError::Blocked => AppError::IpBlocked,
            RateLimitError::Exceeded(_) => AppError::RateLimited,
        }
    }
}

/// Counters for one client. All rules share `window_start`.
#[derive(Debug)]
struct Visitor {
    window_start: Instant,
    counts: Vec<u32>,
    last_seen: Instant,
}

/// Per-client-IP admission: whitelist, blacklist, then every enabled rule's window.
#[derive(Debug)]
pub struct RateLimiter {
    rules: Vec<(String, RateLimitRule)>,
    whitelist: HashSet<String>,
    visitors: RwLock<HashMap<String, Visitor>>,
    blacklist: Arc<BlacklistManager>,
    max_window: Duration,
}

impl RateLimiter {
    pub fn new(config: &AdmissionConfig, blacklist: Arc<BlacklistManager>) -> Self {
        let rules: Vec<(String, RateLimitRule)> = config
            .rules
            .iter()
            .filter(|(_, rule)| rule.enabled && rule.window > Duration::ZERO)
            .map(|(name, rule)| (name.clone(), *rule))
            .collect();
        let max_window = rules
            .iter()
            .map(|(_, rule)| rule.window)
            .max()
            .unwrap_or(Duration::ZERO);
        info!(
            rules = ?rules.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            whitelist = config.whitelist.len(),
            "rate limiter configured"
        );

        Self {
            rules,
            whitelist: config.whitelist.iter().cloned().collect(),
            visitors: RwLock::new(HashMap::new()),
            blacklist,
            max_window,
        }
    }

    pub fn blacklist(&self) -> &Arc<BlacklistManager> {
        &self.blacklist
    }

    pub async fn admit(&self, ip: &str) -> Result<(), RateLimitError> {
        if self.whitelist.contains(ip) {
            return Ok(());
        }
        if self.blacklist.is_blocked(ip).await {
            debug!(ip, "blocked ip rejected");
            return Err(RateLimitError::Blocked);
        }
        if self.rules.is_empty() {
            return Ok(());
        }

        let rejected = self.check_and_count(ip).await;
        match rejected {
            None => Ok(()),
            Some(snapshot) => {
                debug!(ip, rule = %snapshot.rule, limit = snapshot.limit, "rate limit exceeded");
                self.blacklist.record_violation(ip).await;
                Err(RateLimitError::Exceeded(snapshot))
            }
        }
    }

    async fn check_and_count(&self, ip: &str) -> Option<RateLimitSnapshot> {
        let now = Instant::now();
        let mut visitors = self.visitors.write().await;
        let visitor = visitors.entry(ip.to_owned()).or_insert_with(|| Visitor {
            window_start: now,
            counts: vec![0; self.rules.len()],
            last_seen: now,
        });
        visitor.last_seen = now;

        let elapsed = now.duration_since(visitor.window_start);
        if self.rules.iter().any(|(_, rule)| elapsed > rule.window) {
            visitor.window_start = now;
            visitor.counts.iter_mut().for_each(|count| *count = 0);
        }

        let elapsed = now.duration_since(visitor.window_start);
        let tripped = self
            .rules
            .iter()
            .zip(visitor.counts.iter())
            .find(|((_, rule), count)| **count >= rule.limit);
        if let Some(((name, rule), _)) = tripped {
            return Some(RateLimitSnapshot {
                rule: name.clone(),
                limit: rule.limit,
                window: rule.window,
                retry_after: rule.window.saturating_sub(elapsed),
            });
        }

        for count in visitor.counts.iter_mut() {
            *count += 1;
        }
        None
    }

    /// Drops visitors idle for longer than the longest rule window.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut visitors = self.visitors.write().await;
        let before = visitors.len();
        visitors.retain(|_, visitor| now.duration_since(visitor.last_seen) <= self.max_window);
        before - visitors.len()
    }

    pub async fn tracked_visitors(&self) -> usize {
        self.visitors.read().await.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.cleanup().await;
                debug!(evicted, "swept idle visitors");
            }
        })
    }
}
