//! Runtime configuration: timing constants, query profiles, and env overrides.

use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_PAGE_DELAY_MS: u64 = 500;
const DEFAULT_TARGET_DELAY_MS: u64 = 3000;

/// Query type whose content expires, so its targets are visited in random order.
pub const EPHEMERAL_STORIES_API: &str = "get_list_ig_user_stories";

/// Timing and retry knobs shared by the broker, engine, and orchestrator.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interval at which workers are expected to send heartbeats. The
    /// liveness sweep runs at this period and evicts after twice this long.
    pub heartbeat_interval: Duration,
    /// Deadline for a single brokered call.
    pub request_timeout: Duration,
    /// `reconnect` signals tolerated per connection before it is closed.
    pub max_reconnect_attempts: u32,
    /// Pause between consecutive pages of one target.
    pub page_delay: Duration,
    /// Pause between consecutive targets of one run.
    pub target_delay: Duration,
    pub profiles: QueryProfiles,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            target_delay: Duration::from_millis(DEFAULT_TARGET_DELAY_MS),
            profiles: QueryProfiles::default(),
        }
    }
}

impl RelayConfig {
    /// Build a config from defaults overridden by `PAGERELAY_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            heartbeat_interval: Duration::from_secs(
                read_env_u64("PAGERELAY_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS).max(1),
            ),
            request_timeout: Duration::from_secs(
                read_env_u64("PAGERELAY_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)
                    .max(1),
            ),
            max_reconnect_attempts: read_env_u32(
                "PAGERELAY_MAX_RECONNECT_ATTEMPTS",
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
            page_delay: Duration::from_millis(read_env_u64(
                "PAGERELAY_PAGE_DELAY_MS",
                DEFAULT_PAGE_DELAY_MS,
            )),
            target_delay: Duration::from_millis(read_env_u64(
                "PAGERELAY_TARGET_DELAY_MS",
                DEFAULT_TARGET_DELAY_MS,
            )),
            profiles: QueryProfiles::default(),
        };

        if let Some(list) = read_env_string("PAGERELAY_RANDOMIZED_APIS") {
            config.profiles = QueryProfiles::randomized(list.split(',').map(str::trim));
        }

        config
    }
}

/// Per-query-type behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryProfile {
    /// Shuffle the target list before running, and persist the chosen order.
    pub randomize_order: bool,
}

/// Lookup table from query type (api name) to its profile.
#[derive(Debug, Clone)]
pub struct QueryProfiles {
    profiles: HashMap<String, QueryProfile>,
}

impl Default for QueryProfiles {
    fn default() -> Self {
        Self::randomized([EPHEMERAL_STORIES_API])
    }
}

impl QueryProfiles {
    /// A table in which exactly the given api names randomize their order.
    pub fn randomized<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let profiles = names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .filter(|n| !n.is_empty())
            .map(|n| {
                (
                    n,
                    QueryProfile {
                        randomize_order: true,
                    },
                )
            })
            .collect();
        Self { profiles }
    }

    /// Set the profile for one api name.
    pub fn set(&mut self, api_name: &str, profile: QueryProfile) {
        self.profiles.insert(api_name.to_string(), profile);
    }

    /// Profile for an api name; unknown names get the default (ordered) profile.
    pub fn get(&self, api_name: &str) -> QueryProfile {
        self.profiles.get(api_name).copied().unwrap_or_default()
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}
