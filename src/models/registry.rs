use crate::error::{AssetError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where a loaded model runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| {
                    AssetError::Config(format!("Unknown device '{other}' (expected cpu or cuda:N)"))
                }),
        }
    }
}

/// A model instance handed to inference code
#[derive(Debug)]
pub struct LoadedModel<M> {
    pub model: M,
    pub device: Device,
}

/// Builds runtime models from resolved files.
///
/// Implemented by inference crates; the manager only hands over paths.
pub trait ModelLoader<M> {
    fn load(&self, name: &str, files: &[PathBuf], device: Device) -> Result<M>;
}

/// Loaded models by name
#[derive(Debug)]
pub struct Registry<M> {
    loaded: HashMap<String, LoadedModel<M>>,
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self {
            loaded: HashMap::new(),
        }
    }
}

impl<M> Registry<M> {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; callers avoid double loading
    pub fn register(&mut self, name: impl Into<String>, model: M, device: Device) {
        let name = name.into();
        tracing::debug!("Registered {name} on {device}");
        self.loaded.insert(name, LoadedModel { model, device });
    }

    /// Returns whether the model was loaded
    pub fn unload(&mut self, name: &str) -> bool {
        self.loaded.remove(name).is_some()
    }

    /// Drop every loaded model
    pub fn unload_all(&mut self) {
        self.loaded.clear();
    }

    /// Loaded model by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LoadedModel<M>> {
        self.loaded.get(name)
    }

    /// Whether a model is loaded under this name
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// Sorted names of loaded models
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.loaded.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of loaded models
    #[must_use]
    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    /// True when nothing is loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}
