use super::DeadLetterStore;
use crate::core::dead_letter::DeadLetterEntry;
use crate::error::LaunchResult;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Stores each namespace as `dead_letter_<namespace>.json` in a directory.
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, namespace: &str) -> PathBuf {
        let safe: String = namespace
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("dead_letter_{}.json", safe))
    }
}

#[async_trait]
impl DeadLetterStore for FileStore {
    async fn load(&self, namespace: &str) -> LaunchResult<Vec<DeadLetterEntry>> {
        match tokio::fs::read(self.path(namespace)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, namespace: &str, entries: &[DeadLetterEntry]) -> LaunchResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(namespace);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
