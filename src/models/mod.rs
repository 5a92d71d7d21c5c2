pub mod auth;
pub mod availability;
pub mod download;
pub mod manager;
pub mod manifest;
pub mod recipe;
pub mod registry;

pub use auth::{CredentialStore, Credentials};
pub use download::{BarProgress, Download, HttpTransport, NoProgress, ProgressObserver, Transport};
pub use manager::ModelManager;
pub use manifest::{
    Catalog, Checksum, Entry, FileSpec, ManifestSource, ManifestStore, RemoteManifests,
};
pub use recipe::{Acknowledge, StdinAcknowledger};
pub use registry::{Device, LoadedModel, ModelLoader, Registry};
