//! Checkpoint Store: maps a brand to a checkpoint file on disk, downloading it
//! from the configured remote when it is not present locally.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{ModelError, Result};
use crate::lookup::{self, LookupStrategy};
use crate::metrics::{DOWNLOADS, DOWNLOAD_BYTES};

static PART_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub sha256: Option<String>,
}

/// Parses `"Brand:remote_id[:sha256],..."`. Keys are exact brand strings.
pub fn parse_brand_map(raw: &str) -> std::result::Result<HashMap<String, RemoteEntry>, String> {
    let mut out = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':').map(str::trim);
        let brand = parts.next().unwrap_or_default();
        let id = parts.next().unwrap_or_default();
        if brand.is_empty() || id.is_empty() {
            return Err(format!("mapping entry '{entry}' is not Brand:remote_id"));
        }
        let sha256 = match parts.next().filter(|s| !s.is_empty()) {
            Some(h) if h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()) => Some(h.to_ascii_lowercase()),
            Some(h) => return Err(format!("mapping entry for '{brand}' has malformed sha256 '{h}'")),
            None => None,
        };
        out.insert(brand.to_string(), RemoteEntry { id: id.to_string(), sha256 });
    }
    Ok(out)
}

/// Where downloads come from. The store owns naming, atomic placement and
/// integrity checks; a source only moves bytes into `dest`.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Writes the artifact for `entry` to `dest`, returning the byte count.
    async fn download(&self, brand: &str, entry: &RemoteEntry, dest: &Path) -> Result<u64>;
}

/// Plain HTTP(S) GET against a URL template containing `{id}`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    url_template: String,
}

impl HttpRemote {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Unexpected(format!("http client: {e}")))?;
        Ok(Self { client, url_template: url_template.into() })
    }

    pub fn url_for(&self, id: &str) -> String { self.url_template.replace("{id}", id) }

    /// Streams `url` into `dest`. Shared with the brand classifier bootstrap.
    pub async fn download_url(&self, brand: &str, url: &str, dest: &Path) -> Result<u64> {
        debug!(brand, url, "requesting checkpoint");
        let mut resp = self.client.get(url).send().await.map_err(|e| ModelError::download(brand, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ModelError::download(brand, format!("HTTP {status} from {url}")));
        }
        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/html"));
        if is_html {
            return Err(ModelError::download(brand, "remote answered with an HTML page instead of a checkpoint"));
        }
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| ModelError::download(brand, format!("create {}: {e}", dest.display())))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|e| ModelError::download(brand, e))? {
            file.write_all(&chunk).await.map_err(|e| ModelError::download(brand, format!("write: {e}")))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| ModelError::download(brand, format!("flush: {e}")))?;
        file.sync_all().await.map_err(|e| ModelError::download(brand, format!("sync: {e}")))?;
        Ok(written)
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn download(&self, brand: &str, entry: &RemoteEntry, dest: &Path) -> Result<u64> {
        let url = self.url_for(&entry.id);
        self.download_url(brand, &url, dest).await
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub models_dir: PathBuf,
    pub legacy_dir: Option<PathBuf>,
    pub extension: String,
    pub architecture_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub path: PathBuf,
    pub downloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    /// Normalized brand recovered from the file name.
    pub brand: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub struct CheckpointStore {
    cfg: StoreConfig,
    remotes: HashMap<String, RemoteEntry>,
    source: Arc<dyn RemoteSource>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").field("cfg", &self.cfg).field("remotes", &self.remotes.len()).finish()
    }
}

impl CheckpointStore {
    pub fn new(cfg: StoreConfig, remotes: HashMap<String, RemoteEntry>, source: Arc<dyn RemoteSource>) -> Self {
        Self { cfg, remotes, source }
    }

    pub fn config(&self) -> &StoreConfig { &self.cfg }
    pub fn has_remote(&self, brand: &str) -> bool { self.remotes.contains_key(brand) }

    pub fn canonical_path(&self, brand: &str) -> PathBuf {
        let name = lookup::canonical_file_name(&lookup::normalize_brand(brand), &self.cfg.architecture_tag, &self.cfg.extension);
        self.cfg.models_dir.join(name)
    }

    fn legacy_strategies(&self, brand: &str) -> Vec<LookupStrategy> {
        lookup::legacy_strategies(&lookup::normalize_brand(brand), &self.cfg.extension)
    }

    /// Legacy lookup first, then the canonical path. `found` reports whether
    /// the returned file exists right now.
    pub fn resolve(&self, brand: &str) -> Resolved {
        if let Some(dir) = &self.cfg.legacy_dir {
            match lookup::find_first(dir, &self.legacy_strategies(brand)) {
                Ok(Some(path)) => {
                    debug!(brand, path=%path.display(), "legacy checkpoint located");
                    return Resolved { path, found: true };
                }
                Ok(None) => {}
                Err(e) => warn!(brand, dir=%dir.display(), error=%e, "legacy directory unreadable"),
            }
        }
        let path = self.canonical_path(brand);
        let found = path.is_file();
        Resolved { path, found }
    }

    /// Returns a local checkpoint for `brand`, downloading it when needed.
    /// Never retries on its own.
    #[instrument(skip(self))]
    pub async fn fetch(&self, brand: &str) -> Result<Fetched> {
        let resolved = self.resolve(brand);
        if resolved.found {
            return Ok(Fetched { path: resolved.path, downloaded: false });
        }
        let entry = self.remotes.get(brand).ok_or_else(|| ModelError::NotConfigured { brand: brand.to_string() })?;
        info!(brand, remote_id=%entry.id, dest=%resolved.path.display(), "checkpoint not on disk, downloading");
        match self.download_into(brand, entry, &resolved.path).await {
            Ok(bytes) => {
                DOWNLOADS.add(1, &[KeyValue::new("outcome", "ok")]);
                DOWNLOAD_BYTES.add(bytes, &[]);
                info!(brand, size_mb = bytes as f64 / (1024.0 * 1024.0), "download complete");
                Ok(Fetched { path: resolved.path, downloaded: true })
            }
            Err(e) => {
                DOWNLOADS.add(1, &[KeyValue::new("outcome", e.kind())]);
                warn!(brand, error=%e, "download failed");
                Err(e)
            }
        }
    }

    async fn download_into(&self, brand: &str, entry: &RemoteEntry, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| ModelError::download(brand, format!("create {}: {e}", parent.display())))?;
        }
        let part = part_path(dest);
        let result = self.download_verified(brand, entry, dest, &part).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&part).await;
        }
        result
    }

    async fn download_verified(&self, brand: &str, entry: &RemoteEntry, dest: &Path, part: &Path) -> Result<u64> {
        self.source.download(brand, entry, part).await?;
        let size = match tokio::fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(_) => return Err(ModelError::corrupt(dest, "artifact missing after transfer")),
        };
        if size == 0 {
            return Err(ModelError::corrupt(dest, "artifact empty after transfer"));
        }
        let digest = sha256_file(part.to_path_buf()).await?;
        debug!(brand, sha256=%digest, "artifact digest");
        if let Some(want) = &entry.sha256 {
            if !want.eq_ignore_ascii_case(&digest) {
                return Err(ModelError::corrupt(dest, format!("sha256 mismatch: expected {want}, got {digest}")));
            }
        }
        tokio::fs::rename(part, dest).await.map_err(|e| ModelError::download(brand, format!("rename into place: {e}")))?;
        Ok(size)
    }

    /// Deletes the resolved checkpoint file. Returns whether a file was removed.
    pub fn delete(&self, brand: &str) -> bool {
        let resolved = self.resolve(brand);
        if !resolved.found {
            return false;
        }
        match std::fs::remove_file(&resolved.path) {
            Ok(()) => {
                info!(brand, path=%resolved.path.display(), "checkpoint deleted");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(brand, path=%resolved.path.display(), error=%e, "checkpoint delete failed");
                false
            }
        }
    }

    /// Checkpoint files in the models directory, sorted by file name.
    pub fn list(&self) -> Vec<DiskEntry> {
        let dir = &self.cfg.models_dir;
        let names = match lookup::sorted_file_names(dir) {
            Ok(names) => names,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir=%dir.display(), error=%e, "models directory unreadable");
                }
                return Vec::new();
            }
        };
        names
            .into_iter()
            .filter_map(|name| {
                let brand = lookup::brand_from_file_name(&name, &self.cfg.architecture_tag, &self.cfg.extension)?;
                let path = dir.join(&name);
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                Some(DiskEntry { brand, path, size_bytes })
            })
            .collect()
    }

    /// Deletes every checkpoint file in the models directory; other files and
    /// the legacy directory are left alone. Returns the number deleted.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for entry in self.list() {
            match std::fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path=%entry.path.display(), error=%e, "checkpoint delete failed"),
            }
        }
        removed
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}-{seq}.part", std::process::id()));
    dest.with_file_name(name)
}

async fn sha256_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path).map_err(|e| ModelError::corrupt(&path, format!("open: {e}")))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| ModelError::corrupt(&path, format!("read: {e}")))?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await?
}
