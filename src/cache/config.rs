//! Cache configuration.
//!
//! Controls the serving-side interceptor and the outbound caching client.

use serde::Deserialize;

const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Cache configuration, usually built from `[cache]` in the settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Validate and stamp ETags on this service's own responses.
    pub enable_server_cache: bool,
    /// Revalidate and replay peer responses in the outbound client.
    pub enable_client_cache: bool,
    /// Largest response body the interceptor buffers for hashing.
    pub max_body_bytes: usize,
    /// Redirect hops the outbound client follows before giving up.
    pub max_redirects: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_server_cache: true,
            enable_client_cache: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_server_cache: settings.enable_server_cache,
            enable_client_cache: settings.enable_client_cache,
            max_body_bytes: settings.max_body_bytes,
            max_redirects: settings.max_redirects,
        }
    }
}

impl CacheConfig {
    /// Returns true if either side caches.
    pub fn is_enabled(&self) -> bool {
        self.enable_server_cache || self.enable_client_cache
    }
}
