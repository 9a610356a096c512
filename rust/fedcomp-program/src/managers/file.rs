//! A program state manager persisting to the file system.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tracing::{debug, info};

use super::{ManagerError, ProgramStateManager};

const PREFIX: &str = "program_state_";

/// Saves every version of a program state as a bincode file `program_state_{version}` in a root
/// directory.
pub struct FileProgramStateManager<T> {
    root_dir: PathBuf,
    keep_total: usize,
    _state: PhantomData<fn() -> T>,
}

impl<T> FileProgramStateManager<T> {
    /// Creates a manager saving to `root_dir`. Only the newest `keep_total` versions are kept,
    /// `0` keeps all of them.
    pub fn new(root_dir: impl Into<PathBuf>, keep_total: usize) -> Self {
        Self {
            root_dir: root_dir.into(),
            keep_total,
            _state: PhantomData,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn path(&self, version: u64) -> PathBuf {
        self.root_dir.join(format!("{}{}", PREFIX, version))
    }

    /// Gets the saved versions, oldest first.
    pub async fn versions(&self) -> Result<Vec<u64>, ManagerError> {
        let mut versions = Vec::new();
        let mut entries = match fs::read_dir(&self.root_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(err) => return Err(err).context("failed to list saved program states"),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let version = name
                .to_str()
                .and_then(|name| name.strip_prefix(PREFIX))
                .and_then(|version| version.parse().ok());
            if let Some(version) = version {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn remove_old_versions(&self) -> Result<(), ManagerError> {
        if self.keep_total == 0 {
            return Ok(());
        }
        let versions = self.versions().await?;
        let stale = versions.len().saturating_sub(self.keep_total);
        for version in &versions[..stale] {
            debug!("removing program state version {}", version);
            fs::remove_file(self.path(*version)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T> ProgramStateManager<T> for FileProgramStateManager<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load_latest(&self, _structure: &T) -> Result<(Option<T>, u64), ManagerError> {
        let version = match self.versions().await?.last() {
            Some(version) => *version,
            None => return Ok((None, 0)),
        };
        let path = self.path(version);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let state = bincode::deserialize(&bytes)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        info!("loaded program state version {} from {}", version, path.display());
        Ok((Some(state), version))
    }

    async fn save(&self, state: &T, version: u64) -> Result<(), ManagerError> {
        let path = self.path(version);
        if fs::metadata(&path).await.is_ok() {
            bail!("program state version {} already exists at {}", version, path.display());
        }
        fs::create_dir_all(&self.root_dir).await?;
        let bytes = bincode::serialize(state)?;
        // a crash while writing must not leave a truncated version behind
        let temporary = self.root_dir.join(format!(".{}{}.tmp", PREFIX, version));
        fs::write(&temporary, bytes).await?;
        fs::rename(&temporary, &path).await?;
        debug!("saved program state version {} to {}", version, path.display());
        self.remove_old_versions().await
    }
}
