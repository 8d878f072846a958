use std::{collections::BTreeMap, env, time::Duration};

use tracing::warn;
use uuid::Uuid;

use crate::catalog;

pub const MIN_IPV4_MASK: u8 = 8;
pub const MAX_IPV4_MASK: u8 = 32;
pub const MIN_IPV6_MASK: u8 = 32;
pub const MAX_IPV6_MASK: u8 = 128;
pub const DEFAULT_IPV4_MASK: u8 = 24;
pub const DEFAULT_IPV6_MASK: u8 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistMode {
    Off,
    Single,
    Subnet,
}

impl BlacklistMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Self::Off,
            "subnet" => Self::Subnet,
            "single" => Self::Single,
            other => {
                warn!(mode = other, "unknown BLACKLIST_MODE, using single");
                Self::Single
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub scale_interval: Duration,
}

impl PoolConfig {
    /// Applies the same fallbacks as the environment loader: a non-positive minimum
    /// becomes 5 and a maximum below the minimum becomes twice the minimum.
    pub fn normalized(min_size: usize, max_size: usize, scale_interval: Duration) -> Self {
        let min_size = if min_size == 0 { 5 } else { min_size };
        let max_size = if max_size == 0 || max_size < min_size {
            min_size * 2
        } else {
            max_size
        };
        Self {
            min_size,
            max_size,
            scale_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub rules: BTreeMap<String, RateLimitRule>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub mode: BlacklistMode,
    pub threshold: u32,
    pub blacklist_file: String,
    pub ipv4_mask: u8,
    pub ipv6_mask: u8,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub api_key: Option<String>,
    pub admin_key: String,
    pub vertex_addr: String,
    pub gpt_addr: String,
    pub default_model: Option<String>,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub api_prefix: String,
    pub enable_model_route: bool,
    /// Serve from the in-process mock backend instead of the gRPC services.
    pub mock_backend: bool,
    pub pool: PoolConfig,
    pub admission: AdmissionConfig,
}

const DEFAULT_VERTEX_ADDR: &str =
    "runtime-native-io-vertex-inference-grpc-service-lmuw6mcn3q-ul.a.run.app:443";
const DEFAULT_GPT_ADDR: &str =
    "runtime-native-io-gpt-inference-grpc-service-lmuw6mcn3q-ul.a.run.app:443";

impl Default for AdmissionConfig {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert("default".to_owned(), rule(60, 60, true));
        rules.insert("strict".to_owned(), rule(10, 60, false));
        rules.insert("burst".to_owned(), rule(100, 1, false));
        Self {
            rules,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            mode: BlacklistMode::Single,
            threshold: 100,
            blacklist_file: "blacklist.txt".to_owned(),
            ipv4_mask: DEFAULT_IPV4_MASK,
            ipv6_mask: DEFAULT_IPV6_MASK,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            api_key: None,
            admin_key: Uuid::new_v4().simple().to_string(),
            vertex_addr: DEFAULT_VERTEX_ADDR.to_owned(),
            gpt_addr: DEFAULT_GPT_ADDR.to_owned(),
            default_model: None,
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(300),
            api_prefix: "/v1".to_owned(),
            enable_model_route: false,
            mock_backend: false,
            pool: PoolConfig::normalized(5, 20, Duration::from_secs(30)),
            admission: AdmissionConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let admission_defaults = &defaults.admission;

        let default_model = read_string("DEFAULT_MODEL").and_then(|model| {
            if catalog::is_supported(&model) {
                Some(model)
            } else {
                warn!(model = %model, "DEFAULT_MODEL is not supported, ignoring it");
                None
            }
        });

        let admin_key = read_string("ADMIN_KEY").unwrap_or_else(|| {
            warn!(admin_key = %defaults.admin_key, "ADMIN_KEY not set, generated a random one");
            defaults.admin_key.clone()
        });

        let mut rules = BTreeMap::new();
        for (name, env_prefix) in [
            ("default", "RATE_LIMIT"),
            ("strict", "STRICT_RATE_LIMIT"),
            ("burst", "BURST_RATE_LIMIT"),
        ] {
            let fallback = admission_defaults.rules[name];
            rules.insert(name.to_owned(), read_rule(env_prefix, fallback));
        }

        Self {
            port: read_parsed("PORT", defaults.port),
            api_key: read_string("API_KEY"),
            admin_key,
            vertex_addr: read_string("VERTEX_GRPC_ADDR").unwrap_or(defaults.vertex_addr),
            gpt_addr: read_string("GPT_GRPC_ADDR").unwrap_or(defaults.gpt_addr),
            default_model,
            max_retries: read_parsed("MAX_RETRIES", defaults.max_retries),
            request_timeout: read_secs("TIMEOUT", defaults.request_timeout),
            stream_timeout: read_secs("STREAM_TIMEOUT", defaults.stream_timeout),
            api_prefix: normalize_prefix(
                &read_string("API_PREFIX").unwrap_or(defaults.api_prefix),
            ),
            enable_model_route: read_bool("ENABLE_MODEL_ROUTE", defaults.enable_model_route),
            mock_backend: read_bool("MOCK_BACKEND", defaults.mock_backend),
            pool: PoolConfig::normalized(
                read_parsed("MIN_POOL_SIZE", defaults.pool.min_size),
                read_parsed("MAX_POOL_SIZE", defaults.pool.max_size),
                read_secs("SCALE_INTERVAL", defaults.pool.scale_interval),
            ),
            admission: AdmissionConfig {
                rules,
                whitelist: read_list("IP_WHITELIST"),
                blacklist: read_list("IP_BLACKLIST"),
                mode: read_string("BLACKLIST_MODE")
                    .map(|mode| BlacklistMode::parse(&mode))
                    .unwrap_or(admission_defaults.mode),
                threshold: read_parsed("BLACKLIST_THRESHOLD", admission_defaults.threshold),
                blacklist_file: read_string("BLACKLIST_FILE")
                    .unwrap_or_else(|| admission_defaults.blacklist_file.clone()),
                ipv4_mask: read_parsed("IPV4_MASK", admission_defaults.ipv4_mask),
                ipv6_mask: read_parsed("IPV6_MASK", admission_defaults.ipv6_mask),
            },
        }
    }
}

pub fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_owned();
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
        warn!(prefix = %prefix, "API_PREFIX should start with /, fixed");
    }
    if prefix.len() > 1 && prefix.ends_with('/') {
        prefix = prefix.trim_end_matches('/').to_owned();
        warn!(prefix = %prefix, "API_PREFIX should not end with /, fixed");
    }
    prefix
}

fn rule(limit: u32, window_secs: u64, enabled: bool) -> RateLimitRule {
    RateLimitRule {
        limit,
        window: Duration::from_secs(window_secs),
        enabled,
    }
}

fn read_rule(prefix: &str, fallback: RateLimitRule) -> RateLimitRule {
    RateLimitRule {
        limit: read_parsed(prefix, fallback.limit),
        window: read_secs(&format!("{prefix}_WINDOW"), fallback.window),
        enabled: read_bool(&format!("{prefix}_ENABLED"), fallback.enabled),
    }
}

fn read_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(read_parsed(name, default.as_secs()))
}

fn read_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn read_parsed<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    let Some(value) = read_string(name) else {
        return default;
    };
    match value.parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(value = %value, default = %default, "{name} is not a valid value, using default");
            default
        }
    }
}

fn read_bool(name: &str, default: bool) -> bool {
    match read_string(name).map(|value| value.to_ascii_lowercase()) {
        Some(value) if matches!(value.as_str(), "1" | "true" | "t" | "yes") => true,
        Some(value) if matches!(value.as_str(), "0" | "false" | "f" | "no") => false,
        _ => default,
    }
}

fn read_list(name: &str) -> Vec<String> {
    read_string(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_normalized() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix("/api/v1"), "/api/v1");
    }

    #[test]
    fn pool_bounds_fall_back() {
        let pool = PoolConfig::normalized(0, 0, Duration::from_secs(30));
        assert_eq!((pool.min_size, pool.max_size), (5, 10));

        let pool = PoolConfig::normalized(4, 2, Duration::from_secs(30));
        assert_eq!((pool.min_size, pool.max_size), (4, 8));
    }

    #[test]
    fn defaults_enable_only_the_default_rule() {
        let config = GatewayConfig::default();
        let enabled: Vec<_> = config
            .admission
            .rules
            .iter()
            .filter(|(_, rule)| rule.enabled)
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(enabled, vec!["default"]);
        assert_eq!(config.admission.rules["burst"].window, Duration::from_secs(1));
        assert_eq!(config.api_prefix, "/v1");
        assert_eq!(config.admin_key.len(), 32);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_default() {
        const NAME: &str = "CHAT_RELAY_CONFIG_TEST_MASK";
        env::set_var(NAME, "300");
        assert_eq!(read_parsed(NAME, DEFAULT_IPV4_MASK), DEFAULT_IPV4_MASK);
        env::set_var(NAME, "16");
        assert_eq!(read_parsed(NAME, DEFAULT_IPV4_MASK), 16);
        env::set_var(NAME, "soon");
        assert_eq!(read_secs(NAME, Duration::from_secs(30)), Duration::from_secs(30));
        env::remove_var(NAME);
        assert_eq!(read_parsed(NAME, 7u32), 7);
    }
}
