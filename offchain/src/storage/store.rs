use crate::error::CResult;
use crate::storage::Namespace;

/// A transactional, namespaced key/value store. Keys and namespaces are
/// strings, values are arbitrary byte strings.
///
/// Writes are only permitted inside an explicit transaction window opened
/// with begin() and closed with commit() or rollback(); a write outside the
/// window fails with Error::WriteOutsideTransaction. Reads observe writes
/// buffered in the open window (read-your-writes).
///
/// Only supports single-threaded use since all methods take a mutable
/// reference -- callers serialize access behind a lock anyway, since the
/// store is shared by every channel of one VASP.
pub trait KvStore: std::fmt::Display + Send {
    /// Gets the value for a key, or Error::NotFound.
    fn get(&mut self, ns: &Namespace, key: &str) -> CResult<Vec<u8>>;

    /// Sets a value for a key, replacing the existing value if any.
    fn put(&mut self, ns: &Namespace, key: &str, value: Vec<u8>) -> CResult<()>;

    /// Deletes a key, or fails with Error::NotFound if it does not exist.
    fn delete(&mut self, ns: &Namespace, key: &str) -> CResult<()>;

    /// Returns true if the key exists.
    fn contains(&mut self, ns: &Namespace, key: &str) -> CResult<bool> {
        match self.get(ns, key) {
            Ok(_) => Ok(true),
            Err(crate::error::Error::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Returns all keys in a namespace.
    fn keys(&mut self, ns: &Namespace) -> CResult<Vec<String>>;

    /// Returns the number of keys in a namespace.
    fn count(&mut self, ns: &Namespace) -> CResult<u64> {
        Ok(self.keys(ns)?.len() as u64)
    }

    /// Opens the transaction window.
    fn begin(&mut self) -> CResult<()>;

    /// Closes the window, making all buffered writes durable atomically.
    fn commit(&mut self) -> CResult<()>;

    /// Closes the window, discarding all buffered writes.
    fn rollback(&mut self) -> CResult<()>;
}
