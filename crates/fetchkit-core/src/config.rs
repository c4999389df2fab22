use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Global configuration loaded from `~/.config/fetchkit/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default directory for new downloads when the caller gives none.
    pub download_dir: Option<PathBuf>,
    /// Maximum tasks downloading at once (clamped to [1, 10]).
    pub max_concurrent: usize,
    /// Global bandwidth cap in bytes/sec; 0 = unlimited.
    pub global_limit_bps: u64,
    /// `User-Agent` sent when a task supplies none.
    pub user_agent: String,
    /// Free space kept in reserve on the target filesystem, in bytes.
    pub free_space_margin: u64,
    /// Command run with the finished file's path appended, after
    /// verification. Failures are logged and ignored.
    pub completion_hook: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            max_concurrent: 4,
            global_limit_bps: 0,
            user_agent: format!("fetchkit/{}", env!("CARGO_PKG_VERSION")),
            free_space_margin: crate::allocator::FREE_SPACE_MARGIN,
            completion_hook: None,
        }
    }
}

impl EngineConfig {
    /// `max_concurrent` clamped to the supported range.
    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent.clamp(1, 10)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("fetchkit")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}
