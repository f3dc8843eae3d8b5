//! Async wrappers for callers on a tokio runtime.
//!
//! Every rusqlite call can sit in the busy timeout while a worker holds the
//! write lock, so async code goes through the blocking pool instead of
//! calling the store directly.

use std::sync::Arc;

use anyhow::anyhow;
use kimaki_core::{IpcRequest, NewIpcRequest};

use crate::{StatusCounts, Store, ThreadSession};

/// Run `op` against a shared store on the blocking pool.
pub async fn run_blocking<S, T, F>(store: &Arc<S>, op: F) -> anyhow::Result<T>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> anyhow::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&*store))
        .await
        .map_err(|err| anyhow!("store task join error: {err}"))?
}

impl Store {
    async fn blocking<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| anyhow!("store task join error: {err}"))?
    }

    pub async fn create_ipc_request_async(&self, request: NewIpcRequest) -> anyhow::Result<IpcRequest> {
        self.blocking(move |store| store.create_ipc_request(&request))
            .await
    }

    pub async fn get_ipc_request_async(&self, id: String) -> anyhow::Result<Option<IpcRequest>> {
        self.blocking(move |store| store.get_ipc_request(&id)).await
    }

    pub async fn status_counts_async(&self) -> anyhow::Result<StatusCounts> {
        self.blocking(|store| store.status_counts()).await
    }

    pub async fn get_thread_session_async(
        &self,
        thread_id: String,
    ) -> anyhow::Result<Option<ThreadSession>> {
        self.blocking(move |store| store.get_thread_session(&thread_id))
            .await
    }

    pub async fn set_thread_session_async(&self, session: ThreadSession) -> anyhow::Result<()> {
        self.blocking(move |store| store.set_thread_session(&session))
            .await
    }

    pub async fn delete_thread_session_async(&self, thread_id: String) -> anyhow::Result<()> {
        self.blocking(move |store| store.delete_thread_session(&thread_id))
            .await
    }
}
