#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod error;
pub mod models;

pub use error::{AssetError, Result};
pub use models::ModelManager;
