//! Configuration module for nataili
//!
//! Loads config from `$XDG_CONFIG_HOME/nataili/config.toml` or `~/.config/nataili/config.toml`.
//! Falls back to embedded defaults if the file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use nataili::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Base dir: {}", config.base_dir().unwrap().display());
//! println!("Refresh manifests: {}", config.manifest.refresh);
//! ```

pub mod schema;

pub use schema::Config;
