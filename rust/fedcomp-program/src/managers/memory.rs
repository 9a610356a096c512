//! In-memory managers.

use std::collections::BTreeMap;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ManagerError, ProgramStateManager, ReleaseManager};

#[derive(Debug, Default)]
/// Keeps every saved version of a program state in memory.
pub struct MemoryProgramStateManager<T> {
    versions: Mutex<BTreeMap<u64, T>>,
}

impl<T: Clone> MemoryProgramStateManager<T> {
    pub fn new() -> Self {
        Self {
            versions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Gets the saved versions and states, oldest first.
    pub async fn saved(&self) -> Vec<(u64, T)> {
        self.versions
            .lock()
            .await
            .iter()
            .map(|(version, state)| (*version, state.clone()))
            .collect()
    }
}

#[async_trait]
impl<T> ProgramStateManager<T> for MemoryProgramStateManager<T>
where
    T: Clone + Send + Sync,
{
    async fn load_latest(&self, _structure: &T) -> Result<(Option<T>, u64), ManagerError> {
        Ok(self
            .versions
            .lock()
            .await
            .iter()
            .next_back()
            .map_or((None, 0), |(version, state)| (Some(state.clone()), *version)))
    }

    async fn save(&self, state: &T, version: u64) -> Result<(), ManagerError> {
        let mut versions = self.versions.lock().await;
        if versions.contains_key(&version) {
            bail!("program state version {} already exists", version);
        }
        versions.insert(version, state.clone());
        Ok(())
    }
}

#[derive(Debug)]
/// Records released values in memory.
pub struct MemoryReleaseManager<V, K> {
    released: Mutex<Vec<(K, V)>>,
}

impl<V, K> Default for MemoryReleaseManager<V, K> {
    fn default() -> Self {
        Self {
            released: Mutex::new(Vec::new()),
        }
    }
}

impl<V: Clone, K: Clone> MemoryReleaseManager<V, K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the released keys and values, in release order.
    pub async fn released(&self) -> Vec<(K, V)> {
        self.released.lock().await.clone()
    }
}

#[async_trait]
impl<V, K> ReleaseManager<V, K> for MemoryReleaseManager<V, K>
where
    V: Clone + Send + Sync,
    K: Clone + Send + Sync,
{
    async fn release(&self, value: &V, key: &K) -> Result<(), ManagerError> {
        self.released.lock().await.push((key.clone(), value.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_latest_version() {
        let manager = MemoryProgramStateManager::new();
        assert_eq!(manager.load_latest(&0).await.unwrap(), (None, 0));
        manager.save(&10, 0).await.unwrap();
        manager.save(&12, 2).await.unwrap();
        manager.save(&11, 1).await.unwrap();
        assert_eq!(manager.load_latest(&0).await.unwrap(), (Some(12), 2));
        assert!(manager.save(&13, 2).await.is_err());
        assert_eq!(manager.saved().await, vec![(0, 10), (1, 11), (2, 12)]);
    }

    #[tokio::test]
    async fn test_release_order() {
        let manager = MemoryReleaseManager::new();
        manager.release(&"b", &2).await.unwrap();
        manager.release(&"a", &1).await.unwrap();
        assert_eq!(manager.released().await, vec![(2, "b"), (1, "a")]);
    }
}
