use crate::error::{AssetError, Result};
use crate::models::auth::Credentials;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct StorageConfig {
    /// Overrides `~/.nataili`
    pub base_dir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ManifestConfig {
    #[serde(default = "default_true")]
    pub refresh: bool,
    #[serde(default = "default_models_url")]
    pub models_url: String,
    #[serde(default = "default_dependencies_url")]
    pub dependencies_url: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub progress: bool,
    #[serde(default = "default_headroom_mb")]
    pub headroom_mb: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_env_var")]
    pub env_var: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_models_url() -> String {
    "https://raw.githubusercontent.com/Sygil-Dev/nataili-model-reference/main/db.json".to_string()
}
fn default_dependencies_url() -> String {
    "https://raw.githubusercontent.com/Sygil-Dev/nataili-model-reference/main/db_dep.json"
        .to_string()
}
fn default_timeout_secs() -> u64 {
    600
}
fn default_headroom_mb() -> u64 {
    100
}
fn default_env_var() -> String {
    "HUGGING_FACE_HUB_TOKEN".to_string()
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            refresh: default_true(),
            models_url: default_models_url(),
            dependencies_url: default_dependencies_url(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            progress: default_true(),
            headroom_mb: default_headroom_mb(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            env_var: default_env_var(),
        }
    }
}

impl Config {
    /// Load config from the user config directory, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            AssetError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| AssetError::Config(format!("Failed to parse {}: {e}", path.display())))
    }

    /// Resolved asset base directory
    pub fn base_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.base_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| AssetError::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(".nataili"))
    }

    /// Credentials from the `[auth]` section.
    ///
    /// A half-filled section still yields credentials so that the shape check in
    /// availability recomputation can reject it.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.auth.username, &self.auth.password) {
            (None, None) => None,
            (username, password) => Some(Credentials {
                username: username.clone().unwrap_or_default(),
                password: password.clone().unwrap_or_default(),
            }),
        }
    }
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        dirs::config_dir()
            .ok_or_else(|| AssetError::Config("Could not determine config directory".to_string()))?
    };

    Ok(config_dir.join("nataili").join("config.toml"))
}
