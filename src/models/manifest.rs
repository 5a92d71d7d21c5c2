use crate::error::{AssetError, Result};
use crate::models::download::Transport;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const BUNDLED_MODELS: &str = include_str!("../../assets/db.json");
const BUNDLED_DEPENDENCIES: &str = include_str!("../../assets/db_dep.json");

/// Entries of this type are fetched by their own tooling and list no files
const DIFFUSERS_TYPE: &str = "diffusers";

/// Expected content hash of a required file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Md5(String),
    Sha256(String),
}

impl Checksum {
    /// Hex digest as written in the manifest
    #[must_use]
    pub fn hex(&self) -> &str {
        match self {
            Self::Md5(hex) | Self::Sha256(hex) => hex,
        }
    }

    /// Algorithm name for log messages
    #[must_use]
    pub const fn algorithm(&self) -> &'static str {
        match self {
            Self::Md5(_) => "md5",
            Self::Sha256(_) => "sha256",
        }
    }
}

#[derive(Deserialize)]
struct RawFileSpec {
    path: String,
    md5sum: Option<String>,
    sha256: Option<String>,
}

/// A file an entry needs, relative to the base directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawFileSpec")]
pub struct FileSpec {
    pub path: String,
    pub checksum: Option<Checksum>,
}

impl From<RawFileSpec> for FileSpec {
    fn from(raw: RawFileSpec) -> Self {
        let checksum = raw
            .sha256
            .map(Checksum::Sha256)
            .or_else(|| raw.md5sum.map(Checksum::Md5));
        Self {
            path: raw.path,
            checksum,
        }
    }
}

impl FileSpec {
    /// File spec relative to the base directory
    #[must_use]
    pub fn new(path: impl Into<String>, checksum: Option<Checksum>) -> Self {
        Self {
            path: path.into(),
            checksum,
        }
    }
}

/// Cleanup applied after a git clone
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostProcess {
    pub delete: Option<String>,
}

/// What a download step does. Exactly one per step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Operator places the file by hand
    Manual { url: Option<String> },
    /// Write literal text to the target
    WriteContent { content: String },
    /// Link the target to another path under the base directory
    Symlink { target: String },
    GitClone {
        url: String,
        post_process: Vec<PostProcess>,
    },
    /// Fetch an archive and move a directory out of it
    Unzip { url: String },
    /// Fetch with `{username}`/`{password}` substituted from credentials
    AuthFetch { url_template: String },
    Fetch { url: String },
}

impl StepAction {
    /// Short step name for log messages
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Manual { .. } => "manual",
            Self::WriteContent { .. } => "file_content",
            Self::Symlink { .. } => "symlink",
            Self::GitClone { .. } => "git",
            Self::Unzip { .. } => "unzip",
            Self::AuthFetch { .. } => "hf_auth",
            Self::Fetch { .. } => "file_url",
        }
    }
}

/// Step as it appears in the manifest JSON; the action is decided by which keys are present
#[derive(Deserialize)]
struct RawStep {
    file_name: Option<String>,
    file_path: Option<String>,
    file_url: Option<String>,
    hf_auth: Option<Value>,
    manual: Option<Value>,
    file_content: Option<String>,
    symlink: Option<String>,
    git: Option<Value>,
    #[serde(default)]
    post_process: Vec<PostProcess>,
    unzip: Option<Value>,
}

/// One resolved step of a download recipe
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct DownloadStep {
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub action: StepAction,
}

impl TryFrom<RawStep> for DownloadStep {
    type Error = String;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        let url = raw.file_url;
        let require_url = |kind: &str, url: Option<String>| {
            url.ok_or_else(|| format!("{kind} step requires file_url"))
        };

        let action = if raw.manual.is_some() {
            StepAction::Manual { url }
        } else if let Some(content) = raw.file_content {
            StepAction::WriteContent { content }
        } else if let Some(target) = raw.symlink {
            StepAction::Symlink { target }
        } else if raw.git.is_some() {
            StepAction::GitClone {
                url: require_url("git", url)?,
                post_process: raw.post_process,
            }
        } else if raw.unzip.is_some() {
            StepAction::Unzip {
                url: require_url("unzip", url)?,
            }
        } else if raw.hf_auth.is_some() {
            StepAction::AuthFetch {
                url_template: require_url("hf_auth", url)?,
            }
        } else if let Some(url) = url {
            StepAction::Fetch { url }
        } else {
            return Err("download step has no file_url, file_content, symlink or manual key".into());
        };

        Ok(Self {
            file_name: raw.file_name,
            file_path: raw.file_path,
            action,
        })
    }
}

impl DownloadStep {
    /// Explicit `file_path/file_name` override, if the step has one
    #[must_use]
    pub fn explicit_target(&self) -> Option<PathBuf> {
        match (&self.file_path, &self.file_name) {
            (Some(dir), Some(name)) => Some(Path::new(dir).join(name)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryConfig {
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub download: Vec<DownloadStep>,
}

/// One named model or dependency record
#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub config: EntryConfig,
    /// Every other top-level key (`description`, `download_all`, ...)
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Entry {
    /// Files that must exist for the entry to count as available
    #[must_use]
    pub fn required_files(&self) -> &[FileSpec] {
        if self.kind == DIFFUSERS_TYPE {
            return &[];
        }
        &self.config.files
    }

    /// Download steps in manifest order
    #[must_use]
    pub fn recipe(&self) -> &[DownloadStep] {
        &self.config.download
    }

    /// Equality test on a metadata key; `"type"` compares the entry type
    #[must_use]
    pub fn matches(&self, key: &str, expected: &Value) -> bool {
        if key == "type" {
            return expected.as_str() == Some(self.kind.as_str());
        }
        self.metadata.get(key) == Some(expected)
    }
}

/// Mapping of entry name to entry, as stored in a manifest document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    entries: BTreeMap<String, Entry>,
}

impl Catalog {
    /// Parse a manifest document
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Entry by exact name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    /// Whether an entry with this exact name exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entry names in lexical order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Name and entry pairs in lexical order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True for an empty manifest document
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries matching every `key == value` constraint
    #[must_use]
    pub fn filter(&self, constraints: &[(&str, Value)]) -> Vec<(&str, &Entry)> {
        self.iter()
            .filter(|(_, entry)| {
                constraints
                    .iter()
                    .all(|(key, value)| entry.matches(key, value))
            })
            .collect()
    }

    /// Closest entry name within two edits
    #[must_use]
    pub fn suggest(&self, name: &str) -> Option<&str> {
        if name.is_empty() {
            return None;
        }

        self.names()
            .map(|candidate| (candidate, levenshtein_distance(name, candidate)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2)
            .map(|(candidate, _)| candidate)
    }

    fn not_found(&self, kind: &str, name: &str) -> AssetError {
        match self.suggest(name) {
            Some(candidate) => AssetError::NotFound(format!(
                "{kind} '{name}' is not in the manifest. Did you mean '{candidate}'?"
            )),
            None => AssetError::NotFound(format!("{kind} '{name}' is not in the manifest")),
        }
    }
}

/// Where the catalogs in a [`ManifestStore`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    Remote,
    Bundled,
    /// Refresh was attempted and failed; bundled copies are in use
    Degraded,
}

impl std::fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Remote => "remote",
            Self::Bundled => "bundled",
            Self::Degraded => "bundled (remote refresh failed)",
        };
        f.write_str(label)
    }
}

/// Locations of the remote manifest documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteManifests {
    pub models_url: String,
    pub dependencies_url: String,
}

/// The model and dependency catalogs, loaded once at startup
#[derive(Debug, Clone)]
pub struct ManifestStore {
    models: Catalog,
    dependencies: Catalog,
    source: ManifestSource,
    loaded_at: chrono::DateTime<chrono::Utc>,
}

impl ManifestStore {
    /// Load the catalogs, refreshing from `remote` when given.
    ///
    /// Never fails: any refresh problem falls back to the bundled copies.
    pub fn initialize(remote: Option<&RemoteManifests>, transport: &dyn Transport) -> Self {
        let Some(remote) = remote else {
            return Self::bundled();
        };

        tracing::info!("Model reference: downloading");
        let fetched = fetch_catalog(transport, &remote.models_url).and_then(|models| {
            fetch_catalog(transport, &remote.dependencies_url).map(|deps| (models, deps))
        });

        match fetched {
            Ok((models, dependencies)) => {
                tracing::info!(
                    "Model reference: OK ({} models, {} dependencies)",
                    models.len(),
                    dependencies.len()
                );
                Self::with_source(models, dependencies, ManifestSource::Remote)
            }
            Err(e) => {
                tracing::error!("Model reference: download error: {e}");
                tracing::warn!("Model reference: using bundled copy");
                let bundled = Self::bundled();
                Self::with_source(bundled.models, bundled.dependencies, ManifestSource::Degraded)
            }
        }
    }

    /// Catalogs shipped with the crate
    #[must_use]
    pub fn bundled() -> Self {
        let models = Catalog::from_json(BUNDLED_MODELS).unwrap_or_else(|e| {
            tracing::error!("Bundled model manifest is invalid: {e}");
            Catalog::default()
        });
        let dependencies = Catalog::from_json(BUNDLED_DEPENDENCIES).unwrap_or_else(|e| {
            tracing::error!("Bundled dependency manifest is invalid: {e}");
            Catalog::default()
        });
        Self::with_source(models, dependencies, ManifestSource::Bundled)
    }

    /// Store over already-parsed catalogs
    #[must_use]
    pub fn from_catalogs(models: Catalog, dependencies: Catalog) -> Self {
        Self::with_source(models, dependencies, ManifestSource::Bundled)
    }

    fn with_source(models: Catalog, dependencies: Catalog, source: ManifestSource) -> Self {
        Self {
            models,
            dependencies,
            source,
            loaded_at: chrono::Utc::now(),
        }
    }

    /// Where the catalogs came from
    #[must_use]
    pub const fn source(&self) -> ManifestSource {
        self.source
    }

    /// When the catalogs were loaded
    #[must_use]
    pub const fn loaded_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.loaded_at
    }

    /// Model catalog
    #[must_use]
    pub const fn models(&self) -> &Catalog {
        &self.models
    }

    /// Dependency catalog
    #[must_use]
    pub const fn dependencies(&self) -> &Catalog {
        &self.dependencies
    }

    /// Model entry by name, with a suggestion in the error when it is unknown
    pub fn lookup_model(&self, name: &str) -> Result<&Entry> {
        self.models
            .get(name)
            .ok_or_else(|| self.models.not_found("Model", name))
    }

    /// Dependency entry by name, with a suggestion in the error when it is unknown
    pub fn lookup_dependency(&self, name: &str) -> Result<&Entry> {
        self.dependencies
            .get(name)
            .ok_or_else(|| self.dependencies.not_found("Dependency", name))
    }

    /// Models whose metadata matches every constraint
    #[must_use]
    pub fn filter_models(&self, constraints: &[(&str, Value)]) -> Vec<(&str, &Entry)> {
        self.models.filter(constraints)
    }

    /// Names of the models matching every constraint
    #[must_use]
    pub fn filtered_model_names(&self, constraints: &[(&str, Value)]) -> Vec<String> {
        self.filter_models(constraints)
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

fn fetch_catalog(transport: &dyn Transport, url: &str) -> Result<Catalog> {
    let response = transport.get(url)?;
    Ok(serde_json::from_reader(response.body)?)
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for (i, c1) in s1.chars().enumerate() {
        for (j, c2) in s2.chars().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
