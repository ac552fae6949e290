//! Key-value stores exposed to scripts as `ctx.kv.<name>`.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use vesper_common::{Result, VesperError};

pub type KvFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A pluggable key-value backend.
pub trait KvStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, Option<Bytes>>;

    fn put<'a>(&'a self, key: &'a str, value: Bytes) -> KvFuture<'a, ()>;

    /// Removes `key`, returning whether it existed.
    fn del<'a>(&'a self, key: &'a str) -> KvFuture<'a, bool>;
}

/// In-process store for `memory://` bindings.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: DashMap<String, Bytes>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get<'a>(&'a self, key: &'a str) -> KvFuture<'a, Option<Bytes>> {
        let value = self.entries.get(key).map(|entry| entry.value().clone());
        Box::pin(async move { Ok(value) })
    }

    fn put<'a>(&'a self, key: &'a str, value: Bytes) -> KvFuture<'a, ()> {
        self.entries.insert(key.to_string(), value);
        Box::pin(async { Ok(()) })
    }

    fn del<'a>(&'a self, key: &'a str) -> KvFuture<'a, bool> {
        let existed = self.entries.remove(key).is_some();
        Box::pin(async move { Ok(existed) })
    }
}

/// Named store bindings shared by every shard.
#[derive(Clone, Default)]
pub struct KvRegistry {
    stores: HashMap<String, Arc<dyn KvStore>>,
}

impl std::fmt::Debug for KvRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl KvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to a backend chosen by the URI scheme.
    ///
    /// # Errors
    ///
    /// [`VesperError::KvBackendNotFound`] for schemes without a backend and
    /// [`VesperError::InvalidConfig`] for malformed names or URIs.
    pub fn configure(&mut self, name: &str, uri: &str) -> Result<()> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(VesperError::InvalidConfig(format!(
                "invalid KV binding name: {name:?}"
            )));
        }

        let (scheme, _rest) = uri
            .split_once("://")
            .ok_or_else(|| VesperError::InvalidConfig(format!("invalid KV uri: {uri}")))?;

        let store: Arc<dyn KvStore> = match scheme {
            "memory" => Arc::new(MemoryKv::new()),
            other => return Err(VesperError::KvBackendNotFound(other.to_string())),
        };

        self.insert(name, store);
        Ok(())
    }

    /// Binds `name` to an already built store.
    pub fn insert(&mut self, name: &str, store: Arc<dyn KvStore>) {
        tracing::debug!(name, "Configured KV binding");
        self.stores.insert(name.to_string(), store);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KvStore>> {
        self.stores.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A single store operation, as requested by a script.
#[derive(Debug, Clone)]
pub enum KvOp {
    Get(String),
    Put(String, Bytes),
    Del(String),
}

/// Result of a [`KvOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum KvOutput {
    Value(Option<Bytes>),
    Stored,
    Deleted(bool),
}

impl KvOp {
    pub async fn apply(self, store: &dyn KvStore) -> Result<KvOutput> {
        match self {
            KvOp::Get(key) => store.get(&key).await.map(KvOutput::Value),
            KvOp::Put(key, value) => store.put(&key, value).await.map(|()| KvOutput::Stored),
            KvOp::Del(key) => store.del(&key).await.map(KvOutput::Deleted),
        }
    }
}
