use md5::{Digest, Md5};
use nataili::models::{
    Acknowledge, Catalog, Credentials, Download, ManifestSource, ManifestStore, NoProgress,
    RemoteManifests, Transport,
};
use nataili::{AssetError, ModelManager, Result};
use serde_json::json;
use serial_test::serial;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::rc::Rc;
use subprocess::Exec;
use tempfile::TempDir;

/// Serves fixed bodies by URL and records every request
#[derive(Clone, Default)]
struct MemoryTransport {
    bodies: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    requests: Rc<RefCell<Vec<String>>>,
}

impl MemoryTransport {
    fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.bodies.borrow_mut().insert(url.to_string(), body.into());
    }

    fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl Transport for MemoryTransport {
    fn get(&self, url: &str) -> Result<Download> {
        self.requests.borrow_mut().push(url.to_string());
        let body = self
            .bodies
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| AssetError::Http {
                url: url.to_string(),
                status: 404,
            })?;
        Ok(Download {
            content_length: Some(body.len() as u64),
            body: Box::new(Cursor::new(body)),
        })
    }
}

struct AutoConfirm;

impl Acknowledge for AutoConfirm {
    fn acknowledge(&self, _prompt: &str) -> Result<()> {
        Ok(())
    }
}

const WEIGHTS: &[u8] = b"model weights v1";

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn models_json() -> String {
    format!(
        r#"{{
            "M": {{
                "type": "test",
                "download_all": true,
                "config": {{
                    "files": [{{"path": "m.bin", "md5sum": "{}"}}],
                    "download": [{{"file_url": "http://mem/m.bin"}}]
                }}
            }},
            "Other": {{
                "type": "test",
                "download_all": false,
                "config": {{
                    "files": [{{"path": "other/o.bin"}}],
                    "download": [{{"file_url": "http://mem/o.bin"}}]
                }}
            }}
        }}"#,
        md5_hex(WEIGHTS)
    )
}

const DEPS: &str = r#"{
    "D": {
        "type": "dependency",
        "config": {
            "files": [{"path": "D/vocab.txt"}],
            "download": [{"file_url": "http://mem/D.zip", "unzip": true, "file_path": "D", "file_name": "D"}]
        }
    }
}"#;

fn manager(base: &Path, transport: &MemoryTransport) -> ModelManager<()> {
    let store = ManifestStore::from_catalogs(
        Catalog::from_json(&models_json()).unwrap(),
        Catalog::from_json(DEPS).unwrap(),
    );
    ModelManager::new(store, base)
        .unwrap()
        .with_transport(transport.clone())
        .with_progress(NoProgress)
        .with_acknowledger(AutoConfirm)
        .with_headroom(0)
}

fn dependency_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    writer.add_directory("D-main/D/", options).unwrap();
    writer.start_file("D-main/D/vocab.txt", options).unwrap();
    writer.write_all(b"a b c").unwrap();
    writer.start_file("D-main/README.md", options).unwrap();
    writer.write_all(b"readme").unwrap();
    writer.finish().unwrap().into_inner()
}

#[test]
fn test_fresh_download_validates() {
    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    transport.serve("http://mem/m.bin", WEIGHTS);
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    assert!(manager.acquire_model("M").unwrap());
    assert_eq!(fs::read(temp_dir.path().join("m.bin")).unwrap(), WEIGHTS);
    assert!(manager.available_models().contains("M"));
    assert!(!temp_dir.path().join("m.bin.part").exists());
}

#[test]
fn test_available_model_makes_no_requests() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("m.bin"), WEIGHTS).unwrap();
    let transport = MemoryTransport::default();
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    assert!(manager.acquire_model("M").unwrap());
    assert_eq!(transport.request_count(), 0);
}

#[test]
fn test_recompute_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("m.bin"), WEIGHTS).unwrap();
    let transport = MemoryTransport::default();
    let mut manager = manager(temp_dir.path(), &transport);

    manager.recompute_availability().unwrap();
    let models = manager.available_models().clone();
    let deps = manager.available_dependencies().clone();

    manager.recompute_availability().unwrap();
    assert_eq!(manager.available_models(), &models);
    assert_eq!(manager.available_dependencies(), &deps);
}

#[test]
fn test_stale_file_is_kept_unless_tainted() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("m.bin"), b"corrupted").unwrap();
    let transport = MemoryTransport::default();
    transport.serve("http://mem/m.bin", WEIGHTS);
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    // present counts as available, so the bad copy only shows up on validation
    assert!(manager.available_models().contains("M"));
    assert!(!manager.validate_model("M").unwrap());

    manager.mark_unavailable("M");
    assert!(manager.tainted_models().contains("M"));
    assert!(!manager.available_models().contains("M"));

    assert!(manager.acquire_model("M").unwrap());
    assert_eq!(transport.request_count(), 1);
    assert_eq!(fs::read(temp_dir.path().join("m.bin")).unwrap(), WEIGHTS);
    assert!(manager.available_models().contains("M"));
    assert!(!manager.tainted_models().contains("M"));
}

#[test]
fn test_untainted_stale_file_fails_validation() {
    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    transport.serve("http://mem/m.bin", WEIGHTS);
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    // appears after the scan, so the manager still considers it missing
    fs::write(temp_dir.path().join("m.bin"), b"corrupted").unwrap();

    assert!(!manager.acquire_model("M").unwrap());
    assert_eq!(transport.request_count(), 0);
    assert!(!manager.available_models().contains("M"));
}

#[test]
fn test_checksum_mismatch_after_download() {
    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    transport.serve("http://mem/m.bin", b"not the weights".to_vec());
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    assert!(!manager.acquire_model("M").unwrap());
    assert!(!manager.available_models().contains("M"));
}

#[test]
fn test_taint_never_overlaps_available() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("m.bin"), WEIGHTS).unwrap();
    let transport = MemoryTransport::default();
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    manager.mark_all_unavailable(["M", "Other"]);
    manager.recompute_availability().unwrap();

    assert!(manager
        .tainted_models()
        .is_disjoint(manager.available_models()));
    assert_eq!(manager.tainted_models().len(), 1);
}

#[test]
#[serial]
fn test_credentials_are_never_cleared() {
    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    let mut manager = manager(temp_dir.path(), &transport);

    manager.set_authentication(None);
    assert!(!manager.has_authentication());

    manager.set_authentication(Some(Credentials {
        username: "user".to_string(),
        password: "secret".to_string(),
    }));
    manager.set_authentication(None);

    assert!(manager.has_authentication());
    assert_eq!(manager.credentials().unwrap().username, "user");
}

#[test]
fn test_unzip_dependency_cleans_scratch() {
    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    transport.serve("http://mem/D.zip", dependency_zip());
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    assert!(manager.acquire_dependency("D").unwrap());
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("D/vocab.txt")).unwrap(),
        "a b c"
    );
    assert!(!temp_dir.path().join("temp/D.zip").exists());
    assert!(!temp_dir.path().join("temp/D-main").exists());
    assert!(manager.available_dependencies().contains("D"));
}

#[test]
fn test_acquire_marked_skips_unmarked_and_available() {
    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    transport.serve("http://mem/m.bin", WEIGHTS);
    transport.serve("http://mem/D.zip", dependency_zip());
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    assert!(manager.acquire_everything().unwrap());
    assert!(manager.available_models().contains("M"));
    assert!(!manager.available_models().contains("Other"));
    assert_eq!(transport.request_count(), 2);

    // everything marked is present now
    assert!(manager.acquire_everything().unwrap());
    assert_eq!(transport.request_count(), 2);
}

#[test]
fn test_acquire_all_stops_on_transport_error() {
    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    transport.serve("http://mem/m.bin", WEIGHTS);
    let mut manager = manager(temp_dir.path(), &transport);
    manager.recompute_availability().unwrap();

    // catalog order is M then Other; Other has no body to serve
    let result = manager.acquire_all();
    assert!(matches!(result, Err(AssetError::Http { status: 404, .. })));
    assert!(manager.available_models().contains("M"));
    assert!(!temp_dir.path().join("other/o.bin").exists());
}

#[test]
fn test_manifest_falls_back_to_bundled() {
    let transport = MemoryTransport::default();
    let remote = RemoteManifests {
        models_url: "http://mem/db.json".to_string(),
        dependencies_url: "http://mem/db_dep.json".to_string(),
    };

    let store = ManifestStore::initialize(Some(&remote), &transport);
    assert_eq!(store.source(), ManifestSource::Degraded);
    assert!(store.models().contains("stable_diffusion"));
    assert!(store.dependencies().contains("clip"));
}

#[test]
fn test_manifest_prefers_remote() {
    let transport = MemoryTransport::default();
    transport.serve("http://mem/db.json", models_json());
    transport.serve("http://mem/db_dep.json", DEPS);
    let remote = RemoteManifests {
        models_url: "http://mem/db.json".to_string(),
        dependencies_url: "http://mem/db_dep.json".to_string(),
    };

    let store = ManifestStore::initialize(Some(&remote), &transport);
    assert_eq!(store.source(), ManifestSource::Remote);
    assert_eq!(store.models().len(), 2);
    assert!(store.dependencies().contains("D"));
}

/// Commits one file into a fresh repository. Returns false without git.
fn local_repo(dir: &Path) -> bool {
    if which::which("git").is_err() {
        return false;
    }
    fs::write(dir.join("README.md"), "repo").unwrap();

    let git = |args: &[&str]| {
        let status = Exec::cmd("git").args(args).cwd(dir).join().unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    git(&["init", "-q"]);
    git(&["add", "README.md"]);
    git(&[
        "-c",
        "user.name=test",
        "-c",
        "user.email=test@example.com",
        "-c",
        "commit.gpgsign=false",
        "commit",
        "-q",
        "-m",
        "init",
    ]);
    true
}

#[test]
fn test_git_model_recovers_after_failed_step() {
    let upstream = TempDir::new().unwrap();
    if !local_repo(upstream.path()) {
        return;
    }
    let models = json!({
        "G": {
            "type": "test",
            "config": {
                "files": [{"path": "repos/g"}, {"path": "w.bin"}],
                "download": [
                    {"file_url": upstream.path().to_str().unwrap(), "git": true},
                    {"file_url": "http://mem/w.bin"}
                ]
            }
        }
    });

    let temp_dir = TempDir::new().unwrap();
    let transport = MemoryTransport::default();
    let store = ManifestStore::from_catalogs(
        Catalog::from_json(&models.to_string()).unwrap(),
        Catalog::default(),
    );
    let mut manager: ModelManager<()> = ModelManager::new(store, temp_dir.path())
        .unwrap()
        .with_transport(transport.clone())
        .with_progress(NoProgress)
        .with_acknowledger(AutoConfirm)
        .with_headroom(0);
    manager.recompute_availability().unwrap();

    // clone succeeds, the weights are not served yet
    let first = manager.acquire_model("G");
    assert!(matches!(first, Err(AssetError::Http { status: 404, .. })));
    assert!(temp_dir.path().join("repos/g/README.md").exists());

    transport.serve("http://mem/w.bin", WEIGHTS);
    assert!(manager.acquire_model("G").unwrap());
    assert!(manager.available_models().contains("G"));

    // a tainted git model re-clones over the existing checkout
    manager.mark_unavailable("G");
    assert!(manager.acquire_model("G").unwrap());
    assert!(manager.available_models().contains("G"));
    assert!(!manager.tainted_models().contains("G"));
}
