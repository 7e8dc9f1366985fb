use std::collections::BTreeMap;

use crate::error::{CResult, Error};
use crate::storage::store::KvStore;
use crate::storage::Namespace;

/// The in-memory reference store. Committed state lives in a BTreeMap; an
/// open transaction buffers writes (tombstones for deletes) and folds them
/// in on commit. Nothing survives the process, so reopening after a crash
/// trivially discards partially-written state.
pub struct MemoryStore {
    committed: BTreeMap<(String, String), Vec<u8>>,

    /// Buffered writes of the open transaction. None marks a delete.
    pending: BTreeMap<(String, String), Option<Vec<u8>>>,

    in_transaction: bool,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self { committed: BTreeMap::new(), pending: BTreeMap::new(), in_transaction: false }
    }

    fn check_write(&self) -> CResult<()> {
        if !self.in_transaction {
            return Err(Error::WriteOutsideTransaction);
        }
        Ok(())
    }

    fn entry_key(ns: &Namespace, key: &str) -> (String, String) {
        (ns.as_str().to_string(), key.to_string())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl KvStore for MemoryStore {
    fn get(&mut self, ns: &Namespace, key: &str) -> CResult<Vec<u8>> {
        let entry = Self::entry_key(ns, key);
        if let Some(buffered) = self.pending.get(&entry) {
            return match buffered {
                Some(value) => Ok(value.clone()),
                None => Err(Error::NotFound),
            };
        }
        self.committed.get(&entry).cloned().ok_or(Error::NotFound)
    }

    fn put(&mut self, ns: &Namespace, key: &str, value: Vec<u8>) -> CResult<()> {
        self.check_write()?;
        self.pending.insert(Self::entry_key(ns, key), Some(value));
        Ok(())
    }

    fn delete(&mut self, ns: &Namespace, key: &str) -> CResult<()> {
        self.check_write()?;
        // Missing keys must fail, against both buffered and committed state.
        self.get(ns, key)?;
        self.pending.insert(Self::entry_key(ns, key), None);
        Ok(())
    }

    fn keys(&mut self, ns: &Namespace) -> CResult<Vec<String>> {
        let ns = ns.as_str();
        let mut keys: Vec<String> = self
            .committed
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, k)| k.clone())
            .collect();
        for ((n, k), value) in &self.pending {
            if n != ns {
                continue;
            }
            match value {
                Some(_) => {
                    if !keys.contains(k) {
                        keys.push(k.clone());
                    }
                }
                None => keys.retain(|existing| existing != k),
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn begin(&mut self) -> CResult<()> {
        if self.in_transaction {
            return Err(Error::Internal("transaction already open".to_string()));
        }
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> CResult<()> {
        if !self.in_transaction {
            return Err(Error::Internal("no open transaction to commit".to_string()));
        }
        for (entry, value) in std::mem::take(&mut self.pending) {
            match value {
                Some(value) => {
                    self.committed.insert(entry, value);
                }
                None => {
                    self.committed.remove(&entry);
                }
            }
        }
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> CResult<()> {
        if !self.in_transaction {
            return Err(Error::Internal("no open transaction to roll back".to_string()));
        }
        self.pending.clear();
        self.in_transaction = false;
        Ok(())
    }
}
