//! File-backed token cache.
//!
//! Tokens are stored as `{"created_at", "expires_in", "value"}` JSON, one
//! file per key. A token is treated as expired 120 seconds before the
//! vendor-stated expiry.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// Head start before the vendor expiry at which a token counts as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileToken {
    /// Unix seconds.
    pub created_at: i64,
    /// Seconds.
    pub expires_in: i64,
    pub value: String,
}

impl FileToken {
    pub fn new(value: impl Into<String>, expires_in: i64, now_secs: i64) -> Self {
        Self {
            created_at: now_secs,
            expires_in,
            value: value.into(),
        }
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs > self.created_at + self.expires_in - EXPIRY_MARGIN_SECS
    }

    /// Seconds left before the token counts as expired.
    pub fn remaining(&self, now_secs: i64) -> i64 {
        (self.created_at + self.expires_in - EXPIRY_MARGIN_SECS - now_secs).max(0)
    }
}

pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Read an unexpired token; missing, corrupt or expired files yield `None`.
    pub async fn get(&self, key: &str, now_secs: i64) -> Option<FileToken> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read token cache file");
                return None;
            }
        };
        let token: FileToken = match serde_json::from_slice(&raw) {
            Ok(token) => token,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt token cache file");
                return None;
            }
        };
        if token.is_expired(now_secs) {
            debug!(key, "Cached token expired");
            return None;
        }
        Some(token)
    }

    pub async fn put(&self, key: &str, token: &FileToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(token)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_margin() {
        let token = FileToken::new("t", 7200, 1_000);
        assert!(!token.is_expired(1_000 + 7200 - 120));
        assert!(token.is_expired(1_000 + 7200 - 119));
        assert_eq!(token.remaining(1_000), 7080);
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        let token = FileToken::new("abc", 7200, 100);

        store.put("feishu:D1", &token).await.unwrap();
        assert_eq!(store.get("feishu:D1", 200).await, Some(token));
        assert_eq!(store.get("feishu:D1", 100 + 7200).await, None);

        store.remove("feishu:D1").await.unwrap();
        assert_eq!(store.get("feishu:D1", 200).await, None);
        store.remove("feishu:D1").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        tokio::fs::write(dir.path().join("k.json"), b"{oops").await.unwrap();
        assert_eq!(store.get("k", 0).await, None);
    }
}
