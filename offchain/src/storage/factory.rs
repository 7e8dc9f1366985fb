use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CResult, Error};
use crate::storage::store::KvStore;
use crate::storage::Namespace;

/// Builds typed persistent values, lists and dictionaries over a shared
/// KvStore, and hands out scoped write sessions for atomic mutations.
///
/// Sessions are reentrant: nested atomic_writes() calls increment a depth
/// counter and only the outermost scope commits (or rolls back, if any
/// scope was abandoned without committing). Writing to a storable outside
/// an open session fails.
///
/// The store rolls partially-committed state back on reopen, so a factory
/// always starts from a consistent snapshot.
pub struct StorableFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

struct FactoryInner {
    store: Box<dyn KvStore>,
    depth: usize,
    failed: bool,
}

impl FactoryInner {
    fn open(&mut self) -> CResult<()> {
        if self.depth == 0 {
            self.store.begin()?;
            self.failed = false;
        }
        self.depth += 1;
        Ok(())
    }

    fn close(&mut self, commit: bool) -> CResult<()> {
        if self.depth == 0 {
            return Err(Error::Internal("closing a session that is not open".to_string()));
        }
        self.depth -= 1;
        if !commit {
            self.failed = true;
        }
        if self.depth > 0 {
            return Ok(());
        }
        if self.failed {
            self.store.rollback()?;
            return Err(Error::Storage("write session rolled back".to_string()));
        }
        self.store.commit()
    }
}

impl StorableFactory {
    pub fn new(store: Box<dyn KvStore>) -> Self {
        StorableFactory {
            inner: Arc::new(Mutex::new(FactoryInner { store, depth: 0, failed: false })),
        }
    }

    /// Opens a scoped write session. All storable mutations until the
    /// session ends are applied atomically: they become durable when the
    /// outermost session commits, and are discarded if it is dropped
    /// without committing.
    pub fn atomic_writes(&self) -> CResult<WriteSession> {
        self.inner.lock()?.open()?;
        Ok(WriteSession { inner: self.inner.clone(), finished: false })
    }

    /// A single typed cell with an in-memory read cache.
    pub fn make_value<T>(&self, path: &[&str], default: Option<T>) -> StorableValue<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        StorableValue {
            inner: self.inner.clone(),
            ns: Namespace::derive(path),
            cache: None,
            default,
        }
    }

    /// An append-only sequence with random access by index.
    pub fn make_list<T>(&self, path: &[&str]) -> StorableList<T>
    where
        T: Serialize + DeserializeOwned,
    {
        StorableList {
            inner: self.inner.clone(),
            ns: Namespace::derive(path),
            len: None,
            _marker: PhantomData,
        }
    }

    /// A string-keyed map with key iteration.
    pub fn make_dict<T>(&self, path: &[&str]) -> StorableDict<T>
    where
        T: Serialize + DeserializeOwned,
    {
        StorableDict { inner: self.inner.clone(), ns: Namespace::derive(path), _marker: PhantomData }
    }
}

/// Guard token for a scoped write session. Call commit() on the success
/// path; dropping the token without committing marks the scope failed and
/// the outermost scope rolls everything back.
pub struct WriteSession {
    inner: Arc<Mutex<FactoryInner>>,
    finished: bool,
}

impl WriteSession {
    pub fn commit(mut self) -> CResult<()> {
        self.finished = true;
        self.inner.lock()?.close(true)
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            let _ = inner.close(false);
        }
    }
}

fn encode<T: Serialize>(value: &T) -> CResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A persistent single value. Reads are served from an in-memory cache
/// once the value has been seen; writes go through to the store.
pub struct StorableValue<T> {
    inner: Arc<Mutex<FactoryInner>>,
    ns: Namespace,
    cache: Option<T>,
    default: Option<T>,
}

const VALUE_KEY: &str = "value";

impl<T: Serialize + DeserializeOwned + Clone> StorableValue<T> {
    pub fn get_value(&mut self) -> CResult<T> {
        if let Some(cached) = &self.cache {
            return Ok(cached.clone());
        }
        let stored = self.inner.lock()?.store.get(&self.ns, VALUE_KEY);
        let value = match stored {
            Ok(bytes) => decode(&bytes)?,
            Err(Error::NotFound) => match &self.default {
                Some(default) => default.clone(),
                None => return Err(Error::NotFound),
            },
            Err(err) => return Err(err),
        };
        self.cache = Some(value.clone());
        Ok(value)
    }

    pub fn set_value(&mut self, value: &T) -> CResult<()> {
        let bytes = encode(value)?;
        self.inner.lock()?.store.put(&self.ns, VALUE_KEY, bytes)?;
        self.cache = Some(value.clone());
        Ok(())
    }
}

/// A persistent append-only list. Indexes are dense; the length lives in
/// the same namespace under a reserved key.
pub struct StorableList<T> {
    inner: Arc<Mutex<FactoryInner>>,
    ns: Namespace,
    len: Option<u64>,
    _marker: PhantomData<T>,
}

const LEN_KEY: &str = "__len__";

impl<T: Serialize + DeserializeOwned> StorableList<T> {
    pub fn len(&mut self) -> CResult<u64> {
        if let Some(len) = self.len {
            return Ok(len);
        }
        let stored = self.inner.lock()?.store.get(&self.ns, LEN_KEY);
        let len = match stored {
            Ok(bytes) => decode(&bytes)?,
            Err(Error::NotFound) => 0,
            Err(err) => return Err(err),
        };
        self.len = Some(len);
        Ok(len)
    }

    pub fn is_empty(&mut self) -> CResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&mut self, index: u64) -> CResult<T> {
        if index >= self.len()? {
            return Err(Error::NotFound);
        }
        let bytes = self.inner.lock()?.store.get(&self.ns, &index.to_string())?;
        decode(&bytes)
    }

    /// Overwrites an existing index.
    pub fn set(&mut self, index: u64, value: &T) -> CResult<()> {
        if index >= self.len()? {
            return Err(Error::NotFound);
        }
        let bytes = encode(value)?;
        self.inner.lock()?.store.put(&self.ns, &index.to_string(), bytes)
    }

    /// Appends a value and returns its index.
    pub fn push(&mut self, value: &T) -> CResult<u64> {
        let index = self.len()?;
        let bytes = encode(value)?;
        let mut inner = self.inner.lock()?;
        inner.store.put(&self.ns, &index.to_string(), bytes)?;
        inner.store.put(&self.ns, LEN_KEY, encode(&(index + 1))?)?;
        drop(inner);
        self.len = Some(index + 1);
        Ok(index)
    }
}

/// A persistent string-keyed dictionary.
pub struct StorableDict<T> {
    inner: Arc<Mutex<FactoryInner>>,
    ns: Namespace,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> StorableDict<T> {
    pub fn get(&self, key: &str) -> CResult<T> {
        let bytes = self.inner.lock()?.store.get(&self.ns, key)?;
        decode(&bytes)
    }

    pub fn insert(&self, key: &str, value: &T) -> CResult<()> {
        let bytes = encode(value)?;
        self.inner.lock()?.store.put(&self.ns, key, bytes)
    }

    pub fn remove(&self, key: &str) -> CResult<()> {
        self.inner.lock()?.store.delete(&self.ns, key)
    }

    pub fn contains(&self, key: &str) -> CResult<bool> {
        self.inner.lock()?.store.contains(&self.ns, key)
    }

    pub fn keys(&self) -> CResult<Vec<String>> {
        self.inner.lock()?.store.keys(&self.ns)
    }

    pub fn len(&self) -> CResult<u64> {
        self.inner.lock()?.store.count(&self.ns)
    }

    pub fn is_empty(&self) -> CResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn values(&self) -> CResult<Vec<T>> {
        self.keys()?.iter().map(|key| self.get(key)).collect()
    }
}
