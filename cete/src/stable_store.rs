//! C3 (stable half): the tiny key/value store consensus needs for durable
//! hard state (`CurrentTerm`, `LastVoteCand`) plus this node's own assigned
//! id, so a restart recovers identity without depending on CLI flags.

use std::path::Path;

use async_raft::storage::HardState;
use async_raft::NodeId;

use crate::error::Error;

const HARD_STATE_KEY: &[u8] = b"hard_state";
const NODE_ID_KEY: &[u8] = b"node_id";

pub struct StableStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl StableStore {
    /// Opens the stable store's own `sled::Db` at `<dataDir>/raft/stable`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(dir)?;
        let tree = db.open_tree("stable")?;
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    pub fn save_hard_state(&self, hs: &HardState) -> Result<(), Error> {
        self.tree.insert(HARD_STATE_KEY, serde_json::to_vec(hs)?)?;
        Ok(())
    }

    pub fn read_hard_state(&self) -> Result<Option<HardState>, Error> {
        match self.tree.get(HARD_STATE_KEY)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
        }
    }

    pub fn save_node_id(&self, id: NodeId) -> Result<(), Error> {
        self.tree.insert(NODE_ID_KEY, &id.to_be_bytes())?;
        Ok(())
    }

    pub fn read_node_id(&self) -> Result<Option<NodeId>, Error> {
        match self.tree.get(NODE_ID_KEY)? {
            None => Ok(None),
            Some(v) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&v[..8]);
                Ok(Some(NodeId::from_be_bytes(buf)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let stable = StableStore::open(dir.path()).unwrap();

        assert!(stable.read_hard_state().unwrap().is_none());
        let hs = HardState {
            current_term: 3,
            voted_for: Some(2),
        };
        stable.save_hard_state(&hs).unwrap();
        assert_eq!(stable.read_hard_state().unwrap(), Some(hs));
    }

    #[test]
    fn node_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let stable = StableStore::open(dir.path()).unwrap();

        assert!(stable.read_node_id().unwrap().is_none());
        stable.save_node_id(42).unwrap();
        assert_eq!(stable.read_node_id().unwrap(), Some(42));
    }
}
