use crate::config::schema::{AuthConfig, Config, DownloadConfig};
use crate::error::Result;
use crate::models::auth::{CredentialStore, Credentials};
use crate::models::availability::{files_available, validate_files};
use crate::models::download::{BarProgress, HttpTransport, NoProgress, ProgressObserver, Transport};
use crate::models::manifest::{FileSpec, ManifestStore, RemoteManifests};
use crate::models::recipe::{Acknowledge, RecipeOutcome, RecipeRunner, Scope, StdinAcknowledger};
use crate::models::registry::{Device, LoadedModel, ModelLoader, Registry};
use std::any::Any;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BYTES_PER_MB: u64 = 1_024 * 1_024;

/// Reconciles the manifest against the base directory and holds loaded models.
///
/// `M` is the runtime model type produced by the inference loader.
pub struct ModelManager<M = Box<dyn Any + Send>> {
    store: ManifestStore,
    base_dir: PathBuf,
    credentials: CredentialStore,
    transport: Box<dyn Transport>,
    progress: Box<dyn ProgressObserver>,
    acknowledger: Box<dyn Acknowledge>,
    headroom_bytes: u64,
    available_models: BTreeSet<String>,
    tainted_models: BTreeSet<String>,
    available_dependencies: BTreeSet<String>,
    registry: Registry<M>,
}

impl<M> ModelManager<M> {
    /// Create a manager over `base_dir` (created if missing) with default
    /// download and auth settings.
    ///
    /// Availability sets start empty; call [`Self::recompute_availability`].
    pub fn new(store: ManifestStore, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let download = DownloadConfig::default();
        let transport = http_transport(&download)?;
        Self::assemble(
            store,
            base_dir.into(),
            transport,
            &download,
            &AuthConfig::default().env_var,
        )
    }

    /// Build from config: refresh manifests if enabled, apply credentials
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = http_transport(&config.download)?;
        let remote = config.manifest.refresh.then(|| RemoteManifests {
            models_url: config.manifest.models_url.clone(),
            dependencies_url: config.manifest.dependencies_url.clone(),
        });
        let store = ManifestStore::initialize(remote.as_ref(), &transport);

        let mut manager = Self::assemble(
            store,
            config.base_dir()?,
            transport,
            &config.download,
            &config.auth.env_var,
        )?;
        manager.set_authentication(config.credentials());

        Ok(manager)
    }

    fn assemble(
        store: ManifestStore,
        base_dir: PathBuf,
        transport: HttpTransport,
        download: &DownloadConfig,
        token_env: &str,
    ) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;

        let progress: Box<dyn ProgressObserver> = if download.progress {
            Box::new(BarProgress::new())
        } else {
            Box::new(NoProgress)
        };

        Ok(Self {
            store,
            base_dir,
            credentials: CredentialStore::new(Some(token_env.to_string())),
            transport: Box::new(transport),
            progress,
            acknowledger: Box::new(StdinAcknowledger),
            headroom_bytes: download.headroom_mb.saturating_mul(BYTES_PER_MB),
            available_models: BTreeSet::new(),
            tainted_models: BTreeSet::new(),
            available_dependencies: BTreeSet::new(),
            registry: Registry::new(),
        })
    }

    /// Replace the HTTP transport
    #[must_use]
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Box::new(transport);
        self
    }

    /// Replace the progress observer
    #[must_use]
    pub fn with_progress(mut self, progress: impl ProgressObserver + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Replace the manual-step prompt
    #[must_use]
    pub fn with_acknowledger(mut self, acknowledger: impl Acknowledge + 'static) -> Self {
        self.acknowledger = Box::new(acknowledger);
        self
    }

    /// Free space required beyond a download's size
    #[must_use]
    pub fn with_headroom(mut self, bytes: u64) -> Self {
        self.headroom_bytes = bytes;
        self
    }

    /// Directory every manifest path is relative to
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Loaded catalogs
    #[must_use]
    pub const fn manifest(&self) -> &ManifestStore {
        &self.store
    }

    /// Set credentials; `None` keeps whatever is already configured
    pub fn set_authentication(&mut self, credentials: Option<Credentials>) {
        self.credentials.set(credentials);
    }

    /// Whether credentials have been set
    #[must_use]
    pub const fn has_authentication(&self) -> bool {
        self.credentials.is_configured()
    }

    /// Current credentials, if any
    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.get()
    }

    /// Rescan every catalog entry and replace the available sets.
    ///
    /// Tainted models stay out of the available set until re-acquired.
    pub fn recompute_availability(&mut self) -> Result<()> {
        let base = &self.base_dir;

        self.available_dependencies = self
            .store
            .dependencies()
            .iter()
            .filter(|(_, entry)| files_available(base, &entry.config.files))
            .map(|(name, _)| name.to_string())
            .collect();

        self.available_models = self
            .store
            .models()
            .iter()
            .filter(|(name, entry)| {
                !self.tainted_models.contains(*name) && files_available(base, entry.required_files())
            })
            .map(|(name, _)| name.to_string())
            .collect();

        tracing::debug!(
            "{} models and {} dependencies available",
            self.available_models.len(),
            self.available_dependencies.len()
        );

        self.credentials.validate()
    }

    /// Models whose required files were present at the last scan
    #[must_use]
    pub const fn available_models(&self) -> &BTreeSet<String> {
        &self.available_models
    }

    /// Models marked unavailable and awaiting re-acquisition
    #[must_use]
    pub const fn tainted_models(&self) -> &BTreeSet<String> {
        &self.tainted_models
    }

    /// Dependencies whose files were present at the last scan
    #[must_use]
    pub const fn available_dependencies(&self) -> &BTreeSet<String> {
        &self.available_dependencies
    }

    /// Presence check straight against disk; false for unknown names
    #[must_use]
    pub fn check_model_available(&self, name: &str) -> bool {
        self.store
            .models()
            .get(name)
            .is_some_and(|entry| files_available(&self.base_dir, entry.required_files()))
    }

    /// Presence check straight against disk; false for unknown names
    #[must_use]
    pub fn check_dependency_available(&self, name: &str) -> bool {
        self.store
            .dependencies()
            .get(name)
            .is_some_and(|entry| files_available(&self.base_dir, &entry.config.files))
    }

    /// Every model and dependency in the catalogs is present
    #[must_use]
    pub fn check_all_available(&self) -> bool {
        self.store
            .models()
            .names()
            .all(|name| self.check_model_available(name))
            && self
                .store
                .dependencies()
                .names()
                .all(|name| self.check_dependency_available(name))
    }

    /// Files a model needs, relative to the base directory
    pub fn required_files(&self, name: &str) -> Result<&[FileSpec]> {
        Ok(self.store.lookup_model(name)?.required_files())
    }

    /// Absolute paths of a model's required files, in manifest order
    pub fn model_files(&self, name: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .required_files(name)?
            .iter()
            .map(|file| self.base_dir.join(&file.path))
            .collect())
    }

    /// Absolute paths of a dependency's files
    pub fn dependency_files(&self, name: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .store
            .lookup_dependency(name)?
            .config
            .files
            .iter()
            .map(|file| self.base_dir.join(&file.path))
            .collect())
    }

    /// Every required file exists and matches its checksum
    pub fn validate_model(&self, name: &str) -> Result<bool> {
        let entry = self.store.lookup_model(name)?;
        Ok(validate_files(&self.base_dir, entry.required_files()))
    }

    /// Move an available model to the tainted set; no-op otherwise
    pub fn mark_unavailable(&mut self, name: &str) {
        if self.available_models.remove(name) {
            tracing::info!("{name} marked unavailable");
            self.tainted_models.insert(name.to_string());
        }
    }

    /// Taint each listed model that is currently available
    pub fn mark_all_unavailable<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            self.mark_unavailable(name);
        }
    }

    fn runner(&self) -> RecipeRunner<'_> {
        RecipeRunner {
            base_dir: &self.base_dir,
            transport: self.transport.as_ref(),
            progress: self.progress.as_ref(),
            acknowledger: self.acknowledger.as_ref(),
            credentials: &self.credentials,
            headroom_bytes: self.headroom_bytes,
        }
    }

    /// Download whatever the model is missing, then validate it.
    ///
    /// Returns `Ok(false)` when the files on disk fail validation afterwards.
    /// Transport and filesystem errors propagate.
    pub fn acquire_model(&mut self, name: &str) -> Result<bool> {
        let entry = self.store.lookup_model(name)?;
        if self.available_models.contains(name) {
            tracing::info!("{name} is already available");
            return Ok(true);
        }

        let scope = Scope::Model {
            tainted: self.tainted_models.contains(name),
        };
        tracing::info!("{name}: downloading");
        self.runner()
            .run(name, entry.required_files(), entry.recipe(), scope)?;

        if !self.validate_model(name)? {
            tracing::warn!("{name}: downloaded files failed validation");
            return Ok(false);
        }

        self.tainted_models.remove(name);
        self.recompute_availability()?;
        tracing::info!("{name}: ready");
        Ok(true)
    }

    /// Download a dependency. Returns whether it is available afterwards.
    pub fn acquire_dependency(&mut self, name: &str) -> Result<bool> {
        let entry = self.store.lookup_dependency(name)?;
        if self.available_dependencies.contains(name) {
            tracing::info!("{name} is already installed");
            return Ok(true);
        }

        tracing::info!("{name}: downloading");
        let outcome = self
            .runner()
            .run(name, &entry.config.files, entry.recipe(), Scope::Dependency)?;
        if outcome == RecipeOutcome::Aborted {
            tracing::warn!("{name}: recipe stopped early");
        }

        self.recompute_availability()?;
        Ok(self.available_dependencies.contains(name))
    }

    /// Acquire every model in the catalog, one at a time
    pub fn acquire_all(&mut self) -> Result<bool> {
        let names: Vec<String> = self.store.models().names().map(str::to_string).collect();
        self.acquire_models(&names)
    }

    /// Acquire the models flagged `download_all` in the manifest
    pub fn acquire_marked(&mut self) -> Result<bool> {
        let names = self
            .store
            .filtered_model_names(&[("download_all", serde_json::Value::Bool(true))]);
        self.acquire_models(&names)
    }

    /// Acquire every dependency that is not yet installed
    pub fn acquire_all_dependencies(&mut self) -> Result<bool> {
        let names: Vec<String> = self
            .store
            .dependencies()
            .names()
            .map(str::to_string)
            .collect();

        let mut all_ok = true;
        for name in &names {
            if self.available_dependencies.contains(name) {
                tracing::info!("{name} is already installed");
                continue;
            }
            all_ok &= self.acquire_dependency(name)?;
        }
        Ok(all_ok)
    }

    /// Dependencies first, then the `download_all` models
    pub fn acquire_everything(&mut self) -> Result<bool> {
        let deps_ok = self.acquire_all_dependencies()?;
        let models_ok = self.acquire_marked()?;
        Ok(deps_ok && models_ok)
    }

    fn acquire_models(&mut self, names: &[String]) -> Result<bool> {
        let mut all_ok = true;
        for name in names {
            if self.available_models.contains(name) {
                tracing::info!("{name} is already downloaded");
                continue;
            }
            all_ok &= self.acquire_model(name)?;
        }
        Ok(all_ok)
    }

    /// Insert or replace a loaded model
    pub fn register(&mut self, name: &str, model: M, device: Device) {
        self.registry.register(name, model, device);
    }

    /// Resolve the model's files, build it with `loader` and register it
    pub fn load_model(
        &mut self,
        name: &str,
        loader: &dyn ModelLoader<M>,
        device: Device,
    ) -> Result<()> {
        let files = self.model_files(name)?;
        let model = loader.load(name, &files, device)?;
        self.registry.register(name, model, device);
        tracing::info!("Loaded {name} on {device}");
        Ok(())
    }

    /// Drop a loaded model; returns whether it was loaded
    pub fn unload(&mut self, name: &str) -> bool {
        self.registry.unload(name)
    }

    /// Drop every loaded model
    pub fn unload_all(&mut self) {
        self.registry.unload_all();
    }

    /// Loaded model and its device
    #[must_use]
    pub fn loaded_model(&self, name: &str) -> Option<&LoadedModel<M>> {
        self.registry.get(name)
    }

    /// Sorted names of loaded models
    #[must_use]
    pub fn loaded_model_names(&self) -> Vec<&str> {
        self.registry.names()
    }
}

fn http_transport(download: &DownloadConfig) -> Result<HttpTransport> {
    HttpTransport::new(Duration::from_secs(download.timeout_secs))
}
