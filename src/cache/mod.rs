//! Cache Store (C1): content-addressed on-disk store of response metadata
//! and body, keyed by the 128-bit digest from the URL Normalizer (C2).
//!
//! Layout: `<base>/meta/<hex32>.meta` and `<base>/body/<hex32>.body`.
//! Meta uses the binary codec in [`codec`]; bodies are
//! stored as raw decoded bytes. All operations are concurrent-safe at the
//! filesystem level (distinct files per key); same-key write races are
//! serialized by the pipeline's instance-level in-progress set, not by this
//! store.

pub mod codec;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use tokio::fs;

use crate::core::ProxyResult;
use codec::CacheMeta;

/// A fully materialized cache hit: status, headers (as the caller stored
/// them — already filtered to the safe set at admission time), body, and
/// the `origin_content_length` credited to "bytes saved" on a hit.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status_code: u16,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    pub origin_content_length: u64,
}

/// The value handed to [`DiskCache::set`].
pub struct CacheWrite<'a> {
    pub status_code: u16,
    pub headers: &'a [(Vec<u8>, Vec<u8>)],
    pub body: &'a [u8],
    pub origin_content_length: u64,
}

#[derive(Debug, Clone)]
pub struct DiskCache {
    meta_dir: PathBuf,
    body_dir: PathBuf,
}

/// 128-bit MD5 digest of a normalized URL; not security sensitive, only
/// used for content addressing.
pub type CacheKey = [u8; 16];

fn hex32(key: &CacheKey) -> String {
    let mut s = String::with_capacity(32);
    for byte in key {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl DiskCache {
    /// Opens (without yet creating) a cache store rooted at `base_dir`.
    /// Directories are created lazily on first write.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref();
        DiskCache {
            meta_dir: base_dir.join("meta"),
            body_dir: base_dir.join("body"),
        }
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.meta_dir.join(format!("{}.meta", hex32(key)))
    }

    fn body_path(&self, key: &CacheKey) -> PathBuf {
        self.body_dir.join(format!("{}.body", hex32(key)))
    }

    async fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.meta_dir).await?;
        fs::create_dir_all(&self.body_dir).await?;
        Ok(())
    }

    /// Deletes whatever meta/body artifacts exist for `key`, ignoring
    /// not-found errors. Used both by the public [`delete`](Self::delete)
    /// and by internal corrupt-entry cleanup.
    async fn remove_artifacts(&self, key: &CacheKey) {
        let _ = fs::remove_file(self.meta_path(key)).await;
        let _ = fs::remove_file(self.body_path(key)).await;
    }

    /// `None` when either file is missing, when meta fails to decode, or
    /// when `expire_at` has passed. The latter two cases delete whatever is
    /// left on disk before returning.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let meta_bytes = match fs::read(self.meta_path(key)).await {
            Ok(b) => b,
            Err(_) => return None,
        };

        let meta: CacheMeta = match codec::decode(&meta_bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!("corrupt cache meta for {}: {e}", hex32(key));
                self.remove_artifacts(key).await;
                return None;
            }
        };

        if let Some(expire_at) = meta.expire_at {
            if expire_at <= now_unix() {
                debug!("cache entry {} expired, evicting", hex32(key));
                self.remove_artifacts(key).await;
                return None;
            }
        }

        let body = match fs::read(self.body_path(key)).await {
            Ok(b) => b,
            Err(_) => {
                warn!("cache meta present but body missing for {}", hex32(key));
                self.remove_artifacts(key).await;
                return None;
            }
        };

        Some(CachedResponse {
            status_code: meta.status_code,
            headers: meta.headers,
            body,
            origin_content_length: meta.origin_content_length,
        })
    }

    /// Writes meta then body, cleaning up partial writes on failure. Write
    /// failures are never surfaced to the flow — the caller just logs and
    /// continues uncached.
    pub async fn set(&self, key: &CacheKey, value: CacheWrite<'_>, ttl_seconds: u64) -> ProxyResult<()> {
        if let Err(e) = self.ensure_dirs().await {
            warn!("failed to create cache directories: {e}");
            return Ok(());
        }

        let expire_at = if ttl_seconds == 0 {
            // A zero-TTL write is stored as already-expired so a
            // subsequent `get` treats it as a miss without special-casing.
            Some(now_unix())
        } else {
            Some(now_unix() + ttl_seconds)
        };

        let meta = CacheMeta {
            status_code: value.status_code,
            headers: value.headers.to_vec(),
            expire_at,
            origin_content_length: value.origin_content_length,
        };

        let meta_bytes = codec::encode(&meta);

        if let Err(e) = fs::write(self.meta_path(key), &meta_bytes).await {
            warn!("failed to write cache meta for {}: {e}", hex32(key));
            self.remove_artifacts(key).await;
            return Ok(());
        }

        if let Err(e) = fs::write(self.body_path(key), value.body).await {
            warn!("failed to write cache body for {}: {e}", hex32(key));
            self.remove_artifacts(key).await;
            return Ok(());
        }

        Ok(())
    }

    /// Best-effort removal.
    pub async fn delete(&self, key: &CacheKey) {
        self.remove_artifacts(key).await;
    }

    /// Walks `meta/`, deleting entries whose `expire_at` has passed, plus
    /// any meta whose body counterpart is already gone. Returns the count
    /// of entries removed.
    pub async fn sweep_expired(&self) -> u64 {
        let mut removed = 0u64;
        let mut entries = match fs::read_dir(&self.meta_dir).await {
            Ok(e) => e,
            Err(_) => return 0,
        };

        let now = now_unix();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(key) = parse_hex32(stem) else {
                continue;
            };

            let should_remove = match fs::read(&path).await {
                Ok(bytes) => match codec::decode(&bytes) {
                    Ok(meta) => meta.expire_at.is_some_and(|t| t <= now) || !self.body_path(&key).exists(),
                    Err(_) => true,
                },
                Err(_) => true,
            };

            if should_remove {
                self.remove_artifacts(&key).await;
                removed += 1;
            }
        }

        removed
    }
}

fn parse_hex32(s: &str) -> Option<CacheKey> {
    if s.len() != 32 {
        return None;
    }
    let mut key = [0u8; 16];
    for i in 0..16 {
        key[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> CacheKey {
        [n; 16]
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let headers = vec![(b"content-type".to_vec(), b"application/javascript".to_vec())];
        cache
            .set(
                &key(1),
                CacheWrite {
                    status_code: 200,
                    headers: &headers,
                    body: b"hello",
                    origin_content_length: 5,
                },
                3600,
            )
            .await
            .unwrap();

        let hit = cache.get(&key(1)).await.unwrap();
        assert_eq!(hit.status_code, 200);
        assert_eq!(hit.body, b"hello");
        assert_eq!(hit.origin_content_length, 5);
        assert_eq!(hit.headers, headers);
    }

    #[tokio::test]
    async fn miss_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        assert!(cache.get(&key(9)).await.is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let headers: Vec<(Vec<u8>, Vec<u8>)> = vec![];
        cache
            .set(
                &key(2),
                CacheWrite { status_code: 200, headers: &headers, body: b"v1", origin_content_length: 2 },
                3600,
            )
            .await
            .unwrap();
        cache
            .set(
                &key(2),
                CacheWrite { status_code: 200, headers: &headers, body: b"v2", origin_content_length: 2 },
                3600,
            )
            .await
            .unwrap();
        let hit = cache.get(&key(2)).await.unwrap();
        assert_eq!(hit.body, b"v2");
    }

    #[tokio::test]
    async fn zero_ttl_is_immediately_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let headers: Vec<(Vec<u8>, Vec<u8>)> = vec![];
        cache
            .set(
                &key(3),
                CacheWrite { status_code: 200, headers: &headers, body: b"x", origin_content_length: 1 },
                0,
            )
            .await
            .unwrap();
        assert!(cache.get(&key(3)).await.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let headers: Vec<(Vec<u8>, Vec<u8>)> = vec![];
        cache
            .set(
                &key(4),
                CacheWrite { status_code: 200, headers: &headers, body: b"x", origin_content_length: 1 },
                0,
            )
            .await
            .unwrap();
        let removed = cache.sweep_expired().await;
        assert_eq!(removed, 1);
        assert!(!cache.meta_path(&key(4)).exists());
    }

    #[tokio::test]
    async fn empty_body_is_admitted_and_retrievable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let headers: Vec<(Vec<u8>, Vec<u8>)> = vec![];
        cache
            .set(
                &key(5),
                CacheWrite { status_code: 200, headers: &headers, body: b"", origin_content_length: 0 },
                3600,
            )
            .await
            .unwrap();
        let hit = cache.get(&key(5)).await.unwrap();
        assert!(hit.body.is_empty());
    }
}
