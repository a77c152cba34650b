//! Configuration loading and resolution.

use std::path::PathBuf;

/// Default listen address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:3000";

/// Resolve the data directory: explicit flag, then `PAGERELAY_DATA_DIR`,
/// then `./result`.
pub fn resolve_data_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var("PAGERELAY_DATA_DIR") {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }

    PathBuf::from("result")
}

/// Resolve the listen address: explicit flag, then `PORT` (on localhost),
/// then [`DEFAULT_ADDR`].
pub fn resolve_addr(explicit: Option<&str>) -> String {
    if let Some(addr) = explicit {
        return addr.to_string();
    }

    match std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
        Some(port) => format!("127.0.0.1:{port}"),
        None => DEFAULT_ADDR.to_string(),
    }
}
