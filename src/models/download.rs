use crate::error::{AssetError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use zip::ZipArchive;

/// Read size for streaming response bodies to disk
const CHUNK_SIZE: usize = 16 * 1024;

/// An open response body
pub struct Download {
    /// Size from the `Content-Length` header, if the server sent one
    pub content_length: Option<u64>,
    pub body: Box<dyn Read>,
}

/// Fetches URLs. The blocking HTTP client in production, an in-memory map in tests.
pub trait Transport {
    fn get(&self, url: &str) -> Result<Download>;
}

/// Blocking HTTP transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Client with a whole-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Download> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(Download {
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

/// Observes byte progress of a running download
pub trait ProgressObserver {
    fn begin(&self, label: &str, total: Option<u64>);
    fn advance(&self, bytes: u64);
    fn finish(&self);
}

/// Discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn begin(&self, _label: &str, _total: Option<u64>) {}
    fn advance(&self, _bytes: u64) {}
    fn finish(&self) {}
}

/// Terminal progress bar
#[derive(Debug, Default)]
pub struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    /// Bar is created when a download begins
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for BarProgress {
    fn begin(&self, label: &str, total: Option<u64>) {
        let bar = match total {
            Some(total) => {
                let bar = ProgressBar::new(total);
                if let Ok(style) = ProgressStyle::with_template(
                    "{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})",
                ) {
                    bar.set_style(style.progress_chars("=>-"));
                }
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                if let Ok(style) = ProgressStyle::with_template("{msg} {spinner} {bytes}") {
                    bar.set_style(style);
                }
                bar
            }
        };
        bar.set_message(label.to_string());

        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn advance(&self, bytes: u64) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.inc(bytes);
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

/// Stream `url` to `dest`.
///
/// The body lands in `<dest>.part` first and is renamed into place once complete,
/// so an interrupted transfer never leaves a file that passes the existence check.
/// Returns the number of bytes written.
pub fn fetch_to_path(
    transport: &dyn Transport,
    url: &str,
    dest: &Path,
    progress: &dyn ProgressObserver,
    headroom_bytes: u64,
) -> Result<u64> {
    let parent = dest
        .parent()
        .ok_or_else(|| AssetError::Other(format!("{} has no parent directory", dest.display())))?;
    fs::create_dir_all(parent)?;

    let mut download = transport.get(url)?;
    if let Some(total) = download.content_length {
        check_disk_space(parent, total.saturating_add(headroom_bytes))?;
    }

    let file_name = dest
        .file_name()
        .map_or_else(|| "download".into(), |n| n.to_string_lossy().into_owned());
    let partial = dest.with_file_name(format!("{file_name}.part"));

    progress.begin(&file_name, download.content_length);
    let written = stream_body(&mut download.body, &partial, progress);
    progress.finish();

    let written = match written {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
    };

    fs::rename(&partial, dest)?;
    tracing::debug!("Wrote {} to {}", format_bytes(written), dest.display());
    Ok(written)
}

fn stream_body(body: &mut dyn Read, path: &Path, progress: &dyn ProgressObserver) -> Result<u64> {
    let mut out = File::create(path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = body.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
        progress.advance(n as u64);
    }
    out.flush()?;

    Ok(written)
}

/// Fail if the filesystem holding `dir` has less than `required_bytes` free
pub fn check_disk_space(dir: &Path, required_bytes: u64) -> Result<()> {
    let stats = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| AssetError::Other(format!("Failed to check disk space: {e}")))?;

    #[allow(clippy::unnecessary_cast)]
    let available_bytes = stats.blocks_available() as u64 * stats.fragment_size() as u64;

    if available_bytes < required_bytes {
        return Err(AssetError::InsufficientSpace {
            required_mb: required_bytes / (1_024 * 1_024),
            available_mb: available_bytes / (1_024 * 1_024),
        });
    }

    Ok(())
}

/// Extract every entry of `zip_path` under `dest`
pub fn unzip_into(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let outpath = dest.join(entry.mangled_name());
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&outpath)?;
            io::copy(&mut entry, &mut out)?;
        }
    }

    Ok(())
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
