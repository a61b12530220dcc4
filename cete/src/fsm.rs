//! C2: the deterministic bridge between committed log entries and C1. This
//! is the only code path allowed to mutate the KV engine (invariant: single
//! writer, durable order) — `async-raft` itself guarantees `apply_to_state_machine`
//! calls never overlap, so no extra mutex is taken here around apply.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use async_raft::raft::Entry;
use async_raft::raft::EntryPayload;
use async_raft::raft::MembershipConfig;
use async_raft::storage::HardState;
use async_raft::storage::InitialState;
use async_raft::storage::Snapshot;
use async_raft::storage::SnapshotMeta;
use async_raft::LogId;
use async_raft::NodeId;
use async_raft::RaftStorage;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::command::Command;
use crate::command::CommandResponse;
use crate::error::Error;
use crate::kv::KvStore;
use crate::log_store::LogStore;
use crate::snapshot;
use crate::stable_store::StableStore;
use crate::types::NodeMetadata;

const LAST_APPLIED_KEY: &[u8] = b"last_applied";
const CURRENT_SNAPSHOT_KEY: &[u8] = b"current_snapshot";

/// Everything described by C1 (via [`KvStore`]), C2, and C3 (via
/// [`LogStore`]/[`StableStore`]) for a single node, rooted at `<dataDir>`.
pub struct Store {
    node_id: NodeId,
    kv: KvStore,
    log: LogStore,
    stable: StableStore,
    sm_meta: sled::Tree,
    snapshot_dir: PathBuf,
}

impl Store {
    pub fn open(data_dir: impl AsRef<Path>, node_id: NodeId) -> Result<Self, Error> {
        let data_dir = data_dir.as_ref();
        let kv = KvStore::open(data_dir.join("kvs"))?;
        let sm_meta = kv.open_aux_tree("sm_meta")?;
        let log = LogStore::open(data_dir.join("raft").join("log"))?;
        let stable = StableStore::open(data_dir.join("raft").join("stable"))?;

        let snapshot_dir = data_dir.join("snapshots");
        std::fs::create_dir_all(&snapshot_dir).map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        Self::discard_partial_snapshots(&snapshot_dir)?;

        if stable.read_node_id()?.is_none() {
            stable.save_node_id(node_id)?;
        }

        Ok(Self {
            node_id,
            kv,
            log,
            stable,
            sm_meta,
            snapshot_dir,
        })
    }

    fn discard_partial_snapshots(dir: &Path) -> Result<(), Error> {
        for entry in std::fs::read_dir(dir).map_err(|e| Error::Other(anyhow::anyhow!(e)))? {
            let entry = entry.map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            if entry.path().extension().map(|e| e == "partial").unwrap_or(false) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn get_metadata(&self, node_id: NodeId) -> Result<Option<NodeMetadata>, Error> {
        match self.kv.get_metadata(node_id)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
        }
    }

    pub fn list_metadata(&self) -> Result<std::collections::BTreeMap<NodeId, NodeMetadata>, Error> {
        let mut out = std::collections::BTreeMap::new();
        for item in self.kv.scan_metadata()? {
            let (k, v) = item?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&k[..8]);
            let id = NodeId::from_be_bytes(buf);
            out.insert(id, serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    fn set_last_applied(&self, log_id: LogId) -> Result<(), Error> {
        self.sm_meta.insert(LAST_APPLIED_KEY, serde_json::to_vec(&log_id)?)?;
        Ok(())
    }

    pub fn last_applied(&self) -> Result<LogId, Error> {
        match self.sm_meta.get(LAST_APPLIED_KEY)? {
            None => Ok(LogId { term: 0, index: 0 }),
            Some(v) => Ok(serde_json::from_slice(&v)?),
        }
    }

    fn save_current_snapshot_meta(&self, meta: &SnapshotMeta) -> Result<(), Error> {
        self.sm_meta.insert(CURRENT_SNAPSHOT_KEY, serde_json::to_vec(meta)?)?;
        Ok(())
    }

    fn read_current_snapshot_meta(&self) -> Result<Option<SnapshotMeta>, Error> {
        match self.sm_meta.get(CURRENT_SNAPSHOT_KEY)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
        }
    }

    fn snapshot_path(&self, id: &str, partial: bool) -> PathBuf {
        self.snapshot_dir.join(format!("{}.{}", id, if partial { "partial" } else { "snap" }))
    }

    /// Keep at most the 2 most recent complete snapshot files, always
    /// preserving `keep_id`.
    fn gc_old_snapshots(&self, keep_id: &str) -> Result<(), Error> {
        let keep_name = format!("{}.snap", keep_id);
        let mut files: Vec<_> = std::fs::read_dir(&self.snapshot_dir)
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "snap").unwrap_or(false))
            .filter(|e| e.file_name().to_string_lossy() != keep_name)
            .collect();
        files.sort_by_key(|e| e.file_name());
        while files.len() > 1 {
            let oldest = files.remove(0);
            let _ = std::fs::remove_file(oldest.path());
        }
        Ok(())
    }

    fn apply_command(&self, cmd: &Command) -> Result<CommandResponse, Error> {
        match cmd {
            Command::Put { key, value } => {
                self.kv.put(key, value)?;
                Ok(CommandResponse::Ok)
            }
            Command::Delete { key } => {
                self.kv.delete(key)?;
                Ok(CommandResponse::Ok)
            }
            Command::Join {
                node_id,
                bind_addr,
                grpc_addr,
                http_addr,
            } => {
                let meta = NodeMetadata {
                    bind_addr: bind_addr.clone(),
                    grpc_addr: grpc_addr.clone(),
                    http_addr: http_addr.clone(),
                };
                self.kv.put_metadata(*node_id, &serde_json::to_vec(&meta)?)?;
                Ok(CommandResponse::Ok)
            }
            Command::Leave { node_id } => {
                self.kv.delete_metadata(*node_id)?;
                Ok(CommandResponse::Ok)
            }
        }
    }
}

#[async_trait]
impl RaftStorage<Command, CommandResponse> for Store {
    type SnapshotData = tokio::fs::File;
    type ShutdownError = Error;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        if let Some(membership) = self.log.find_last_membership()? {
            return Ok(membership);
        }
        if let Some(meta) = self.read_current_snapshot_meta()? {
            return Ok(meta.membership);
        }
        Ok(MembershipConfig::new_initial(self.node_id))
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let last_log_id = self.log.last_log_id()?;
        let last_applied_log = self.last_applied()?;
        let hard_state = self.stable.read_hard_state()?.unwrap_or_default();
        let membership = RaftStorage::<Command, CommandResponse>::get_membership_config(self).await?;
        Ok(InitialState {
            last_log_id,
            last_applied_log,
            hard_state,
            membership,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        Ok(self.stable.save_hard_state(hs)?)
    }

    async fn get_log_entries<RNG>(&self, range: RNG) -> Result<Vec<Entry<Command>>>
    where
        RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync,
    {
        Ok(self.log.get_range(range)?)
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<Command>>> {
        Ok(self.log.try_get(log_index)?)
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        Ok(self.log.last_log_id()?)
    }

    async fn delete_logs_from<RNG>(&self, range: RNG) -> Result<()>
    where
        RNG: std::ops::RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync,
    {
        Ok(self.log.delete_from(range)?)
    }

    async fn append_to_log(&self, entries: &[&Entry<Command>]) -> Result<()> {
        Ok(self.log.append(entries)?)
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<Command>]) -> Result<Vec<CommandResponse>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            self.set_last_applied(entry.log_id)?;
            let resp = match &entry.payload {
                EntryPayload::Blank => CommandResponse::Ok,
                EntryPayload::Normal(normal) => self.apply_command(&normal.data)?,
                EntryPayload::ConfigChange(_) => CommandResponse::Ok,
                EntryPayload::PurgedMarker => CommandResponse::Ok,
            };
            responses.push(resp);
        }
        Ok(responses)
    }

    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let last_applied = self.last_applied()?;
        let membership = RaftStorage::<Command, CommandResponse>::get_membership_config(self).await?;

        let user_kv: Vec<(Vec<u8>, Vec<u8>)> = self.kv.scan()?.collect::<Result<_, Error>>()?;
        let meta_kv: Vec<(Vec<u8>, Vec<u8>)> = self.kv.scan_metadata()?.collect::<Result<_, Error>>()?;
        let bytes = snapshot::encode(
            user_kv.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
            meta_kv.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        );

        let snapshot_id = format!("{}-{}", last_applied.term, last_applied.index);
        let partial_path = self.snapshot_path(&snapshot_id, true);
        {
            let mut file = tokio::fs::File::create(&partial_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
        }
        let final_path = self.snapshot_path(&snapshot_id, false);
        tokio::fs::rename(&partial_path, &final_path).await?;

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            membership,
            snapshot_id: snapshot_id.clone(),
        };
        self.save_current_snapshot_meta(&meta)?;
        self.gc_old_snapshots(&snapshot_id)?;

        let file = tokio::fs::File::open(&final_path).await?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(file),
        })
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        let path = self.snapshot_path("incoming", true);
        let file = tokio::fs::File::create(&path).await?;
        Ok(Box::new(file))
    }

    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        mut snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        snapshot.seek(std::io::SeekFrom::Start(0)).await?;
        let mut bytes = Vec::new();
        snapshot.read_to_end(&mut bytes).await?;
        let decoded = snapshot::decode(&bytes)?;
        self.kv.replace_all(decoded.user_kv.into_iter(), decoded.metadata_kv.into_iter())?;

        self.log.delete_from(..=meta.last_log_id.index)?;
        let pointer = Entry::new_purged_marker(meta.last_log_id);
        self.log.append(&[&pointer])?;
        self.set_last_applied(meta.last_log_id)?;

        let incoming_path = self.snapshot_path("incoming", true);
        let final_path = self.snapshot_path(&meta.snapshot_id, false);
        tokio::fs::rename(&incoming_path, &final_path).await?;
        self.save_current_snapshot_meta(meta)?;
        self.gc_old_snapshots(&meta.snapshot_id)?;
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match self.read_current_snapshot_meta()? {
            None => Ok(None),
            Some(meta) => {
                let path = self.snapshot_path(&meta.snapshot_id, false);
                let file = tokio::fs::File::open(&path).await?;
                Ok(Some(Snapshot {
                    meta,
                    snapshot: Box::new(file),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_raft::raft::EntryNormal;

    fn normal(index: u64, cmd: Command) -> Entry<Command> {
        Entry {
            log_id: LogId { term: 1, index },
            payload: EntryPayload::Normal(EntryNormal { data: cmd }),
        }
    }

    #[tokio::test]
    async fn apply_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 1).unwrap();

        let e1 = normal(1, Command::Put { key: b"a".to_vec(), value: b"1".to_vec() });
        RaftStorage::<Command, CommandResponse>::apply_to_state_machine(&store, &[&e1]).await.unwrap();
        assert_eq!(store.kv().get(b"a").unwrap(), Some(b"1".to_vec()));

        let e2 = normal(2, Command::Delete { key: b"a".to_vec() });
        RaftStorage::<Command, CommandResponse>::apply_to_state_machine(&store, &[&e2]).await.unwrap();
        assert_eq!(store.kv().get(b"a").unwrap(), None);

        assert_eq!(store.last_applied().unwrap(), LogId { term: 1, index: 2 });
    }

    #[tokio::test]
    async fn join_then_leave_updates_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 1).unwrap();

        let join = normal(1, Command::Join {
            node_id: 2,
            bind_addr: "127.0.0.1:7001".into(),
            grpc_addr: "127.0.0.1:8001".into(),
            http_addr: "127.0.0.1:9001".into(),
        });
        RaftStorage::<Command, CommandResponse>::apply_to_state_machine(&store, &[&join]).await.unwrap();
        assert!(store.get_metadata(2).unwrap().is_some());

        let leave = normal(2, Command::Leave { node_id: 2 });
        RaftStorage::<Command, CommandResponse>::apply_to_state_machine(&store, &[&leave]).await.unwrap();
        assert!(store.get_metadata(2).unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_equivalent_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 1).unwrap();

        let e1 = normal(1, Command::Put { key: b"x".to_vec(), value: b"x1".to_vec() });
        let e2 = normal(2, Command::Put { key: b"y".to_vec(), value: b"y1".to_vec() });
        RaftStorage::<Command, CommandResponse>::apply_to_state_machine(&store, &[&e1, &e2]).await.unwrap();

        let snap = RaftStorage::<Command, CommandResponse>::do_log_compaction(&store).await.unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let restored = Store::open(dir2.path(), 1).unwrap();
        let mut handle = RaftStorage::<Command, CommandResponse>::begin_receiving_snapshot(&restored).await.unwrap();
        let mut src = tokio::fs::File::open(self_snapshot_path(&store, &snap.meta.snapshot_id)).await.unwrap();
        tokio::io::copy(&mut src, &mut *handle).await.unwrap();
        handle.flush().await.unwrap();
        RaftStorage::<Command, CommandResponse>::finalize_snapshot_installation(&restored, &snap.meta, handle)
            .await
            .unwrap();

        let original: Vec<_> = store.kv().scan().unwrap().collect::<Result<_, _>>().unwrap();
        let restored_pairs: Vec<_> = restored.kv().scan().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(original, restored_pairs);
    }

    fn self_snapshot_path(store: &Store, id: &str) -> PathBuf {
        store.snapshot_path(id, false)
    }
}
