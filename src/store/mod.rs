pub mod settings;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use settings::{ChatKind, Feed, SettingKey, Settings, SettingsStore};

pub const LAST_POST_FILE: &str = "last_post.txt";
pub const LAST_CLIP_FILE: &str = "last_clip.txt";
pub const ALERT_MESSAGE_FILE: &str = "alerts_mes.txt";

/// A small text file holding one value: a polling cursor or the custom
/// alert message. A missing file means "no value yet".
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
        }
    }

    /// Read the stored value, trimmed. Empty files read as `None`.
    pub async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let value = content.trim();
                Ok((!value.is_empty()).then(|| value.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    /// Read and parse the stored value. Unparseable content reads as `None`.
    pub async fn load_parsed<T: std::str::FromStr>(&self) -> Result<Option<T>> {
        Ok(self.load().await?.and_then(|v| v.parse().ok()))
    }

    /// Replace the stored value. Writes to a sibling temp file first so a
    /// crash mid-write leaves the previous value intact.
    pub async fn save(&self, value: &str) -> Result<()> {
        write_replacing(&self.path, value).await?;
        debug!("Saved {}", self.path.display());
        Ok(())
    }

    /// Remove the stored value; removing an absent file is a no-op.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// Write `content` to `path` through a temp file + rename.
pub(crate) async fn write_replacing(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path(), LAST_POST_FILE);
        assert_eq!(file.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_reload_survives_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        StateFile::new(dir.path(), LAST_POST_FILE)
            .save("1234")
            .await
            .unwrap();

        let reopened = StateFile::new(dir.path(), LAST_POST_FILE);
        assert_eq!(reopened.load_parsed::<u64>().await.unwrap(), Some(1234));
    }

    #[tokio::test]
    async fn test_save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("others");
        let file = StateFile::new(&nested, LAST_CLIP_FILE);
        file.save("1700000000000").await.unwrap();
        assert_eq!(
            file.load_parsed::<i64>().await.unwrap(),
            Some(1_700_000_000_000)
        );
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path(), LAST_CLIP_FILE);
        file.save("5").await.unwrap();
        file.clear().await.unwrap();
        file.clear().await.unwrap();
        assert_eq!(file.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_garbage_cursor_parses_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path(), LAST_POST_FILE);
        file.save("not-a-number").await.unwrap();
        assert_eq!(file.load_parsed::<u64>().await.unwrap(), None);
    }
}
