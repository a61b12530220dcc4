//! C1: the embedded persistent ordered key-value engine. Two logical
//! namespaces — user keys and per-node metadata — are kept as separate
//! `sled::Tree`s on one `sled::Db`, so each gets its own consistent
//! iteration order without key-prefix bookkeeping.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::error::Error;

pub struct KvStore {
    db: sled::Db,
    user: sled::Tree,
    meta: sled::Tree,
    closed: AtomicBool,
}

impl KvStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(dir)?;
        let user = db.open_tree("user")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            user,
            meta,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.check_open()?;
        Ok(self.user.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        self.user.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        self.user.remove(key)?;
        Ok(())
    }

    /// A snapshot-consistent, ascending-key iterator over all user pairs as
    /// of the call (`sled::Tree::iter` is an MVCC read view, so concurrent
    /// writes never become visible partway through a scan).
    pub fn scan(&self) -> Result<impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), Error>>, Error> {
        self.check_open()?;
        Ok(self.user.iter().map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Error::from)))
    }

    pub fn get_metadata(&self, node_id: u64) -> Result<Option<Vec<u8>>, Error> {
        self.check_open()?;
        Ok(self.meta.get(node_id.to_be_bytes())?.map(|v| v.to_vec()))
    }

    pub fn put_metadata(&self, node_id: u64, encoded: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        self.meta.insert(node_id.to_be_bytes(), encoded)?;
        Ok(())
    }

    pub fn delete_metadata(&self, node_id: u64) -> Result<(), Error> {
        self.check_open()?;
        self.meta.remove(node_id.to_be_bytes())?;
        Ok(())
    }

    pub fn scan_metadata(&self) -> Result<impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), Error>>, Error> {
        self.check_open()?;
        Ok(self.meta.iter().map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Error::from)))
    }

    /// Replace both namespaces' contents atomically with the given
    /// iterators, used by snapshot restore. Existing data is cleared first;
    /// on an error midway the tree may be left empty but never a mix of old
    /// and new pairs (sled's `clear` + sequential `insert` never interleaves
    /// with concurrent readers mid-call because restore holds exclusive
    /// access via `fsm::Store`).
    pub fn replace_all(
        &self,
        user_kv: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
        metadata_kv: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<(), Error> {
        self.user.clear()?;
        for (k, v) in user_kv {
            self.user.insert(k, v)?;
        }
        self.meta.clear()?;
        for (k, v) in metadata_kv {
            self.meta.insert(k, v)?;
        }
        Ok(())
    }

    /// Opens an additional tree on the same `sled::Db`, for small amounts of
    /// state-machine bookkeeping (last-applied log id, current snapshot
    /// pointer) that lives alongside the KV data it describes.
    pub fn open_aux_tree(&self, name: &str) -> Result<sled::Tree, Error> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();

        assert_eq!(kv.get(b"a").unwrap(), None);
        kv.put(b"a", b"1").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));

        kv.delete(b"a").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);

        // Deleting an absent key is not an error.
        kv.delete(b"a").unwrap();
    }

    #[test]
    fn scan_is_ordered_and_excludes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();

        kv.put(b"b", b"2").unwrap();
        kv.put(b"a", b"1").unwrap();
        kv.put_metadata(7, b"{}").unwrap();

        let pairs: Vec<_> = kv.scan().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(pairs, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn operations_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();
        kv.close();
        assert!(matches!(kv.get(b"a"), Err(Error::Closed)));
        assert!(matches!(kv.put(b"a", b"1"), Err(Error::Closed)));
    }
}
