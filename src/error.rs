use thiserror::Error;

/// Main error type for nataili
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}\n\nTroubleshooting:\n- Credentials need both a username and a non-empty password\n- Check the [auth] section of ~/.config/nataili/config.toml")]
    InvalidConfiguration(String),

    #[error("Missing credentials: {0}\n\nTroubleshooting:\n- Set username and password in the [auth] section of the config\n- Some models are gated and need an account on the hosting site")]
    MissingCredentials(String),

    #[error("Network error: {0}\n\nTroubleshooting:\n- Check internet connection\n- Verify firewall settings\n- Try increasing download.timeout_secs in config")]
    Transport(#[from] reqwest::Error),

    #[error("Download failed: {url} returned HTTP {status}")]
    Http { url: String, status: u16 },

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Git error: {0}\n\nTroubleshooting:\n- Is git installed and in PATH?\n- Remove a half-finished clone before retrying")]
    Git(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Not enough disk space: {required_mb} MB required, {available_mb} MB available")]
    InsufficientSpace { required_mb: u64, available_mb: u64 },

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/nataili/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AssetError>;
