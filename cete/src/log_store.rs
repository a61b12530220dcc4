//! C3 (log half): a durable, append-only `sled::Tree` keyed by big-endian
//! `u64` log index, so iteration order matches index order for free.

use std::ops::Bound;
use std::ops::RangeBounds;
use std::path::Path;

use async_raft::raft::Entry;
use async_raft::raft::EntryPayload;
use async_raft::raft::MembershipConfig;
use async_raft::LogId;

use crate::command::Command;
use crate::error::Error;

pub struct LogStore {
    db: sled::Db,
    tree: sled::Tree,
}

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn key_index(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[..8]);
    u64::from_be_bytes(buf)
}

fn bound_key(bound: Bound<&u64>, if_unbounded: u64) -> ([u8; 8], bool) {
    match bound {
        Bound::Included(i) => (index_key(*i), true),
        Bound::Excluded(i) => (index_key(*i), false),
        Bound::Unbounded => (index_key(if_unbounded), true),
    }
}

impl LogStore {
    /// Opens the log store's own `sled::Db` at `<dataDir>/raft/log`, kept
    /// separate from the state machine's KV engine so the two can be
    /// backed up, truncated, or replaced independently.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(dir)?;
        let tree = db.open_tree("entries")?;
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    pub fn last_log_id(&self) -> Result<LogId, Error> {
        match self.tree.last()? {
            None => Ok(LogId { term: 0, index: 0 }),
            Some((_, v)) => {
                let entry: Entry<Command> = serde_json::from_slice(&v)?;
                Ok(entry.log_id)
            }
        }
    }

    pub fn try_get(&self, index: u64) -> Result<Option<Entry<Command>>, Error> {
        match self.tree.get(index_key(index))? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
        }
    }

    pub fn get_range<RNG: RangeBounds<u64>>(&self, range: RNG) -> Result<Vec<Entry<Command>>, Error> {
        let (start, start_inclusive) = bound_key(range.start_bound(), 0);
        let mut out = Vec::new();
        for item in self.tree.range(start..) {
            let (k, v) = item?;
            let idx = key_index(&k);
            if idx == key_index(&start) && !start_inclusive {
                continue;
            }
            match range.end_bound() {
                Bound::Included(end) if idx > *end => break,
                Bound::Excluded(end) if idx >= *end => break,
                _ => {}
            }
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    pub fn append(&self, entries: &[&Entry<Command>]) -> Result<(), Error> {
        for entry in entries {
            let bytes = serde_json::to_vec(entry)?;
            self.tree.insert(index_key(entry.log_id.index), bytes)?;
        }
        Ok(())
    }

    /// Scans the log tail-to-head for the most recent `ConfigChange` entry.
    /// `get_membership_config` falls back to the current snapshot's
    /// membership, then to a brand-new single-node config, when this
    /// returns `None`.
    pub fn find_last_membership(&self) -> Result<Option<MembershipConfig>, Error> {
        for item in self.tree.iter().rev() {
            let (_, v) = item?;
            let entry: Entry<Command> = serde_json::from_slice(&v)?;
            if let EntryPayload::ConfigChange(change) = entry.payload {
                return Ok(Some(change.membership));
            }
        }
        Ok(None)
    }

    pub fn delete_from<RNG: RangeBounds<u64>>(&self, range: RNG) -> Result<(), Error> {
        let (start, start_inclusive) = bound_key(range.start_bound(), 0);
        let keys: Vec<_> = self
            .tree
            .range(start..)
            .keys()
            .filter_map(|r| r.ok())
            .filter(|k| {
                let idx = key_index(k);
                if idx == key_index(&start) && !start_inclusive {
                    return false;
                }
                match range.end_bound() {
                    Bound::Included(end) => idx <= *end,
                    Bound::Excluded(end) => idx < *end,
                    Bound::Unbounded => true,
                }
            })
            .collect();
        for key in keys {
            self.tree.remove(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_raft::raft::EntryPayload;

    fn entry(index: u64) -> Entry<Command> {
        Entry {
            log_id: LogId { term: 1, index },
            payload: EntryPayload::Blank,
        }
    }

    #[test]
    fn append_and_range_scan() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::open(dir.path()).unwrap();

        let entries: Vec<Entry<Command>> = (1..=5).map(entry).collect();
        let refs: Vec<&Entry<Command>> = entries.iter().collect();
        log.append(&refs).unwrap();

        assert_eq!(log.last_log_id().unwrap(), LogId { term: 1, index: 5 });

        let got = log.get_range(2..4).unwrap();
        assert_eq!(got.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![2, 3]);

        let got_all = log.get_range(..).unwrap();
        assert_eq!(got_all.len(), 5);
    }

    #[test]
    fn delete_from_removes_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogStore::open(dir.path()).unwrap();

        let entries: Vec<Entry<Command>> = (1..=5).map(entry).collect();
        let refs: Vec<&Entry<Command>> = entries.iter().collect();
        log.append(&refs).unwrap();

        log.delete_from(3..).unwrap();
        let remaining = log.get_range(..).unwrap();
        assert_eq!(remaining.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![1, 2]);
    }
}
