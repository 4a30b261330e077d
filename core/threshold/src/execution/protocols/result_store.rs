use std::hash::Hash;
use std::sync::Arc;

use async_cell::sync::AsyncCell;
use dashmap::DashMap;

use crate::error::error_handler::anyhow_error_and_log;

pub type ResultCell<T, E> = Arc<AsyncCell<Result<T, E>>>;

/// Write-once result cells, one per key, that consumers can await before the result exists.
pub struct ResultStore<K, T, E> {
    storage: DashMap<K, ResultCell<T, E>>,
}

impl<K, T, E> Default for ResultStore<K, T, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        ResultStore {
            storage: DashMap::new(),
        }
    }
}

impl<K, T, E> ResultStore<K, T, E>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    T: Clone,
    E: Clone,
{
    /// Returns the cell of `key`, creating it if needed. The flag tells whether it was created.
    pub fn get_or_insert(&self, key: &K) -> (ResultCell<T, E>, bool) {
        let mut created = false;
        let cell = self
            .storage
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                AsyncCell::shared()
            })
            .clone();
        (cell, created)
    }

    /// Sets the value of an element. We only allow setting the result once.
    pub fn update(&self, key: &K, update: Result<T, E>) -> anyhow::Result<()> {
        let (cell, _) = self.get_or_insert(key);
        if cell.is_set() {
            return Err(anyhow_error_and_log(format!(
                "The element with ID {key} is already done, update is not allowed"
            )));
        }
        cell.set(update);
        Ok(())
    }

    pub fn retrieve(&self, key: &K) -> Option<ResultCell<T, E>> {
        self.storage.get(key).map(|cell| Arc::clone(cell.value()))
    }

    /// The result of `key`, if it has been set.
    pub fn try_get(&self, key: &K) -> Option<Result<T, E>> {
        self.retrieve(key).and_then(|cell| cell.try_get())
    }

    /// Removes an element. Consumers already holding its cell still observe its value.
    pub fn delete(&self, key: &K) -> Option<ResultCell<T, E>> {
        self.storage.remove(key).map(|(_, cell)| cell)
    }
}
