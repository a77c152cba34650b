//! Owner-id extraction from target URLs.
//!
//! The owner id groups items for dedup and reporting. It is derived from the
//! URL's structure only, and an unrecognized or unparseable URL maps to
//! [`UNKNOWN_OWNER`] rather than an error.

use url::Url;

/// Owner id used when none can be derived from a URL.
pub const UNKNOWN_OWNER: &str = "unknown_user";

/// First path segment that marks a numeric-profile URL (`/profile.php?id=...`).
const PROFILE_BY_ID_SEGMENT: &str = "profile.php";

/// Generic first path segments that never name an owner.
const EXCLUDED_SEGMENTS: &[&str] = &["photo.php", "story.php"];

/// Host families and how each derives an owner id.
#[derive(Debug, Clone)]
pub struct OwnerRules {
    /// Hosts where `/profile.php?id=N` names owner `N` and otherwise the
    /// first non-generic path segment is the owner.
    pub profile_hosts: Vec<String>,
    /// Hosts where the first path segment is the owner.
    pub path_hosts: Vec<String>,
}

impl Default for OwnerRules {
    fn default() -> Self {
        Self {
            profile_hosts: vec!["facebook.com".to_string()],
            path_hosts: vec!["instagram.com".to_string()],
        }
    }
}

impl OwnerRules {
    /// Derive the owner id for `raw_url`. Never fails.
    pub fn owner_of(&self, raw_url: &str) -> String {
        let Ok(url) = Url::parse(raw_url.trim()) else {
            tracing::debug!("Cannot parse owner from URL: {raw_url}");
            return UNKNOWN_OWNER.to_string();
        };
        let Some(host) = url.host_str() else {
            return UNKNOWN_OWNER.to_string();
        };

        let owner = if host_matches(host, &self.profile_hosts) {
            profile_owner(&url)
        } else if host_matches(host, &self.path_hosts) {
            path_segments(&url).into_iter().next()
        } else {
            None
        };

        owner.unwrap_or_else(|| UNKNOWN_OWNER.to_string())
    }
}

/// Derive the owner id with the default host families.
pub fn owner_from_url(raw_url: &str) -> String {
    OwnerRules::default().owner_of(raw_url)
}

fn host_matches(host: &str, families: &[String]) -> bool {
    families.iter().any(|family| host.contains(family.as_str()))
}

fn profile_owner(url: &Url) -> Option<String> {
    let first = path_segments(url).into_iter().next()?;
    if first == PROFILE_BY_ID_SEGMENT {
        if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "id") {
            return Some(id.into_owned());
        }
    }
    if EXCLUDED_SEGMENTS.contains(&first.as_str()) {
        return None;
    }
    Some(first)
}

fn path_segments(url: &Url) -> Vec<String> {
    url.path()
        .split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
