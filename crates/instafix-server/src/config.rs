//! Configuration loading and resolution.
//!
//! Every tunable is a CLI flag with an `INSTAFIX_*` environment fallback.
//! Paths default to `~/.instafix`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use instafix::origin::DEFAULT_BASE_URL;
use instafix::{
    CoordinatorConfig, FetchRoute, GridConfig, OriginConfig, RemoteConfig, DEFAULT_MEDIA_HOST,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--remote-listen needs a token (--remote-token or INSTAFIX_REMOTE_TOKEN)")]
    MissingToken,

    #[error("invalid remote settings: {0}")]
    Remote(#[from] instafix::RemoteError),
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Directory for the cache database and grid collages.
    #[arg(long, global = true, env = "INSTAFIX_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Lifetime of a cached post, in seconds.
    #[arg(long, global = true, env = "INSTAFIX_CACHE_TTL_SECS", default_value_t = 86_400)]
    pub cache_ttl_secs: u64,

    /// Fetch route (local-only, local-then-remote, remote-then-local, remote-only).
    /// Defaults to local-then-remote when a remote listener is configured.
    #[arg(long, global = true, env = "INSTAFIX_ROUTE")]
    pub route: Option<FetchRoute>,

    /// Host media URLs are rewritten to.
    #[arg(long, global = true, env = "INSTAFIX_MEDIA_HOST", default_value = DEFAULT_MEDIA_HOST)]
    pub media_host: String,

    /// Keep media URLs exactly as extracted.
    #[arg(long, global = true, env = "INSTAFIX_NO_MEDIA_REWRITE")]
    pub no_media_rewrite: bool,

    /// Origin base URL.
    #[arg(long, global = true, env = "INSTAFIX_ORIGIN_URL", default_value = DEFAULT_BASE_URL)]
    pub origin_url: String,

    /// Per-request origin timeout, in seconds.
    #[arg(long, global = true, env = "INSTAFIX_ORIGIN_TIMEOUT_SECS", default_value_t = 10)]
    pub origin_timeout_secs: u64,

    /// Attempts for the embed document before giving up.
    #[arg(long, global = true, env = "INSTAFIX_ORIGIN_ATTEMPTS", default_value_t = 3)]
    pub origin_attempts: u32,

    /// Address the remote worker listener binds to (host:port). Disabled when unset.
    #[arg(long, global = true, env = "INSTAFIX_REMOTE_LISTEN")]
    pub remote_listen: Option<String>,

    /// Shared worker token, at most 8 bytes.
    #[arg(long, global = true, env = "INSTAFIX_REMOTE_TOKEN", hide_env_values = true)]
    pub remote_token: Option<String>,

    /// Time a dispatch waits for a free worker stream, in milliseconds.
    #[arg(long, global = true, env = "INSTAFIX_REMOTE_ACQUIRE_MS", default_value_t = 1_000)]
    pub remote_acquire_ms: u64,

    /// Time a worker has to answer a request, in seconds.
    #[arg(long, global = true, env = "INSTAFIX_REMOTE_TIMEOUT_SECS", default_value_t = 5)]
    pub remote_timeout_secs: u64,

    /// Directory for grid collages (default: <data-dir>/grid).
    #[arg(long, global = true, env = "INSTAFIX_GRID_DIR")]
    pub grid_dir: Option<PathBuf>,

    /// Total size budget for grid collages, e.g. 25GB or 512mb.
    #[arg(long, global = true, env = "INSTAFIX_GRID_MAX_SIZE", default_value = "25GB", value_parser = parse_byte_size)]
    pub grid_max_size: u64,

    /// Most grid collages kept on disk.
    #[arg(long, global = true, env = "INSTAFIX_GRID_MAX_ENTRIES", default_value_t = 10_000)]
    pub grid_max_entries: usize,

    /// Seconds between cache sweeps.
    #[arg(long, global = true, env = "INSTAFIX_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,
}

impl Settings {
    pub fn data_dir(&self) -> PathBuf {
        resolve_data_dir(self.data_dir.as_deref())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir().join("cache.db")
    }

    pub fn grid_dir(&self) -> PathBuf {
        self.grid_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("grid"))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn route(&self) -> FetchRoute {
        match (self.route, &self.remote_listen) {
            (Some(route), _) => route,
            (None, Some(_)) => FetchRoute::LocalThenRemote,
            (None, None) => FetchRoute::LocalOnly,
        }
    }

    pub fn origin_config(&self) -> OriginConfig {
        let mut config = OriginConfig::default().with_base_url(&self.origin_url);
        config.timeout = Duration::from_secs(self.origin_timeout_secs.max(1));
        config.max_attempts = self.origin_attempts.max(1);
        config
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            route: self.route(),
            media_host: (!self.no_media_rewrite).then(|| self.media_host.clone()),
        }
    }

    /// Listener settings, or `None` when no listener is configured.
    pub fn remote_config(&self) -> Result<Option<RemoteConfig>, ConfigError> {
        if self.remote_listen.is_none() {
            return Ok(None);
        }
        let token = self.remote_token.as_deref().ok_or(ConfigError::MissingToken)?;
        let mut config = RemoteConfig::new(token.as_bytes())?;
        config.acquire_timeout = Duration::from_millis(self.remote_acquire_ms);
        config.read_timeout = Duration::from_secs(self.remote_timeout_secs.max(1));
        Ok(Some(config))
    }

    pub fn grid_config(&self) -> GridConfig {
        let mut config = GridConfig::new(self.grid_dir());
        config.max_bytes = self.grid_max_size;
        config.max_entries = self.grid_max_entries.max(1);
        config
    }
}

/// Resolve the data directory: explicit value, else `~/.instafix`.
pub fn resolve_data_dir(explicit: Option<&std::path::Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".instafix")
}

/// Parse a human byte size: `1024`, `512kb`, `64M`, `25GB`, `1tb`.
pub fn parse_byte_size(raw: &str) -> Result<u64, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size {raw:?}: expected a number"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size {raw:?}: {e}"))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        other => return Err(format!("invalid size {raw:?}: unknown unit {other:?}")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {raw:?} is too large"))
}
