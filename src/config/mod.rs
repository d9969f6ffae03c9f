use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// External tool provisioning
    pub tools: ToolsConfig,

    /// Subprocess streaming and cleanup timing
    pub transfer: TransferConfig,

    /// Scratch file storage
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Explicit directory for tool binaries (takes precedence over temp and cache dirs)
    pub dir: Option<PathBuf>,

    /// Retry count handed to the extractor's own retry flag
    pub retries: u32,

    /// Override for the extractor download URL on this host
    pub extractor_url: Option<String>,

    /// Override for the transcoder download URL on this host
    pub transcoder_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Seconds a streaming subprocess may stay silent before it is killed
    pub first_byte_timeout_secs: u64,

    /// Seconds to keep a served file after its transfer finishes
    pub cleanup_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root for scratch downloads (defaults to the runtime temp dir)
    pub root: Option<PathBuf>,

    /// Maximum total size of the downloads directory
    pub max_bytes: u64,

    /// Artifacts older than this are swept on allocation
    pub max_age_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retries: 3,
            extractor_url: None,
            transcoder_url: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            first_byte_timeout_secs: 90,
            cleanup_grace_secs: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_bytes: 2 * 1024 * 1024 * 1024,
            max_age_secs: 3600,
        }
    }
}

impl TransferConfig {
    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_secs(self.first_byte_timeout_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Directory that holds per-request scratch files
    pub fn downloads_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("downly"))
            .join("downloads")
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let mut config = if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            serde_yaml::from_str(&content).context("Failed to parse config file")?
        } else {
            let config = Self::default();
            // A read-only config dir should not stop the service from starting
            if let Err(e) = config.save().await {
                tracing::warn!("Could not write default config: {e:#}");
            }
            config
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    fn config_path() -> Result<PathBuf> {
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("downly").join("config.yaml"))
    }

    /// Environment variables win over file values
    fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os("DOWNLY_TOOLS_DIR") {
            self.tools.dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = std::env::var_os("DOWNLY_CACHE_DIR") {
            self.cache.root = Some(PathBuf::from(dir));
        }
        if let Ok(bind) = std::env::var("DOWNLY_BIND") {
            self.server.bind = bind;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))?;

        if self.transfer.first_byte_timeout_secs == 0 {
            anyhow::bail!("transfer.first_byte_timeout_secs must be greater than zero");
        }

        if self.tools.retries > 20 {
            anyhow::bail!("tools.retries must be at most 20");
        }

        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  Bind Address: {}", self.server.bind);
        match &self.tools.dir {
            Some(dir) => println!("  Tools Dir: {}", dir.display()),
            None => println!("  Tools Dir: (auto)"),
        }
        println!("  Extractor Retries: {}", self.tools.retries);
        println!("  First Byte Timeout: {}s", self.transfer.first_byte_timeout_secs);
        println!("  Cleanup Grace: {}s", self.transfer.cleanup_grace_secs);
        println!("  Downloads Dir: {}", self.cache.downloads_dir().display());
        println!(
            "  Cache Limit: {}",
            crate::utils::format_file_size(self.cache.max_bytes)
        );
    }

    /// Path of the active config file, for display
    pub fn location() -> Result<PathBuf> {
        Self::config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transfer.first_byte_timeout(), Duration::from_secs(90));
        assert_eq!(config.transfer.cleanup_grace(), Duration::from_secs(10));
        assert_eq!(config.tools.retries, 3);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  bind: 0.0.0.0:8080\n").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.transfer.first_byte_timeout_secs, 90);
        assert!(config.tools.dir.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_bind() {
        let mut config = Config::default();
        config.server.bind = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.transfer.first_byte_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_downloads_dir_honours_root() {
        let mut config = Config::default();
        config.cache.root = Some(PathBuf::from("/srv/downly"));
        assert_eq!(
            config.cache.downloads_dir(),
            PathBuf::from("/srv/downly/downloads")
        );
    }
}
