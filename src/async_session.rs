//! Futures over a [`Session`] with completion threads.
//!
//! Each call submits asynchronously with a callback that forwards the
//! [`Outcome`] through a oneshot channel; a completion thread resolves it.

use crate::context::{IoCompletion, Outcome};
use crate::error::{AdapterError, Result};
use crate::session::{IoOptions, Session};
use crate::types::{
    ContainerId, DeleteOption, IteratorEntry, IteratorHandle, IteratorList, KvStatus, OpKind,
    RetrieveOption, StoreOption,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

#[derive(Clone)]
pub struct AsyncSession {
    session: Arc<Session>,
}

impl AsyncSession {
    /// Wrap `session`. Fails when the session has no completion threads.
    pub fn new(session: Arc<Session>) -> Result<Self> {
        let config = session.config();
        if config.sync_io || config.completion_threads == 0 {
            return Err(AdapterError::InvalidArgument(
                "async session requires completion threads".to_string(),
            ));
        }
        Ok(Self { session })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn store(
        &self,
        container: ContainerId,
        key: &[u8],
        value: &[u8],
        option: StoreOption,
    ) -> Result<Outcome> {
        let (options, rx) = forwarding_options();
        self.session.store(container, key, value, option, options)?;
        receive(rx).await
    }

    pub async fn retrieve(
        &self,
        container: ContainerId,
        key: &[u8],
        capacity: usize,
        option: RetrieveOption,
    ) -> Result<Outcome> {
        let (options, rx) = forwarding_options();
        self.session.retrieve(container, key, capacity, option, options)?;
        receive(rx).await
    }

    pub async fn delete(
        &self,
        container: ContainerId,
        key: &[u8],
        option: DeleteOption,
    ) -> Result<Outcome> {
        let (options, rx) = forwarding_options();
        self.session.delete(container, key, option, options)?;
        receive(rx).await
    }

    pub async fn exist<K: AsRef<[u8]>>(&self, container: ContainerId, keys: &[K]) -> Result<Outcome> {
        let (options, rx) = forwarding_options();
        self.session
            .exist(container, keys, vec![0u8; keys.len()], options)?;
        receive(rx).await
    }

    pub async fn iterator_next(&self, handle: IteratorHandle, list: IteratorList) -> Result<Outcome> {
        let (options, rx) = forwarding_options();
        self.session.iterator_next(handle, list, options)?;
        receive(rx).await
    }

    /// Fetch batches of `list_capacity` bytes until the iterator is exhausted.
    pub async fn scan(&self, handle: IteratorHandle, list_capacity: usize) -> Result<Vec<IteratorEntry>> {
        let mut entries = Vec::new();
        loop {
            let outcome = self
                .iterator_next(handle, IteratorList::with_capacity(list_capacity))
                .await?;
            match outcome.status {
                KvStatus::Success => {
                    let Some(list) = outcome.list else {
                        break;
                    };
                    let end = list.is_end();
                    entries.extend(list.into_entries());
                    if end {
                        break;
                    }
                }
                KvStatus::IteratorEnd => break,
                status => {
                    return Err(AdapterError::Engine {
                        op: OpKind::IteratorNext,
                        status,
                    })
                }
            }
        }
        Ok(entries)
    }
}

fn forwarding_options() -> (IoOptions, oneshot::Receiver<Outcome>) {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let options = IoOptions::asynchronous().with_callback(move |completion: &IoCompletion<'_>| {
        let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(Outcome::from_completion(completion));
        }
    });
    (options, rx)
}

async fn receive(rx: oneshot::Receiver<Outcome>) -> Result<Outcome> {
    rx.await.map_err(|_| AdapterError::SessionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::IteratorOption;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<Session> {
        let config = Config::new(dir.path().join("device.snap"))
            .with_queue_depth(16)
            .with_completion_threads(1)
            .with_dma_memory_mb(1)
            .with_max_value_size(4096);
        Arc::new(Session::open(config).unwrap())
    }

    #[tokio::test]
    async fn test_async_store_retrieve_delete() {
        let dir = TempDir::new().unwrap();
        let db = AsyncSession::new(open(&dir)).unwrap();

        let stored = db.store(0, b"key1", b"value1", StoreOption::Overwrite).await.unwrap();
        assert!(stored.is_success());

        let got = db.retrieve(0, b"key1", 64, RetrieveOption::Default).await.unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"value1"[..]));

        db.delete(0, b"key1", DeleteOption::Default).await.unwrap();
        let got = db.retrieve(0, b"key1", 64, RetrieveOption::Default).await.unwrap();
        assert_eq!(got.status, KvStatus::KeyNotFound);
    }

    #[tokio::test]
    async fn test_async_exist() {
        let dir = TempDir::new().unwrap();
        let db = AsyncSession::new(open(&dir)).unwrap();
        db.store(0, b"key2", b"v", StoreOption::Overwrite).await.unwrap();

        let outcome = db.exist(0, &[b"key1", b"key2"]).await.unwrap();
        assert_eq!(outcome.exist, Some(vec![0, 1]));
    }

    #[tokio::test]
    async fn test_async_scan_collects_all_batches() {
        let dir = TempDir::new().unwrap();
        let db = AsyncSession::new(open(&dir)).unwrap();
        for i in 0..20u32 {
            let key = format!("key{:03}", i);
            db.store(0, key.as_bytes(), b"v", StoreOption::Overwrite).await.unwrap();
        }

        let handle = db
            .session()
            .open_iterator(0, IteratorOption::KeyOnly, 0, 0)
            .unwrap();
        let entries = db.scan(handle, 32).await.unwrap();
        assert_eq!(entries.len(), 20);
        assert_eq!(entries[0].key, b"key000");
        assert_eq!(entries[19].key, b"key019");
        db.session().close_iterator(handle).unwrap();
    }

    #[test]
    fn test_requires_completion_threads() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("device.snap"))
            .with_sync_io(true)
            .with_completion_threads(0)
            .with_queue_depth(4)
            .with_dma_memory_mb(1)
            .with_max_value_size(4096);
        let session = Arc::new(Session::open(config).unwrap());
        assert!(AsyncSession::new(session).is_err());
    }
}
