use rocksdb::{IteratorMode, Options, ReadOptions, WriteOptions, DB};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{path::Path, sync::Arc};

use common::constants::{CHUNK_KEY_PREFIX, NODE_KEY_PREFIX};
use common::time_utils::utc_now_ms;

const MAX_OPEN_FILES: i32 = 512;

pub fn node_key(node_id: &str) -> String {
    format!("{NODE_KEY_PREFIX}:{node_id}")
}

pub fn chunk_key(chunk_id: &str) -> String {
    format!("{CHUNK_KEY_PREFIX}:{chunk_id}")
}

/// RocksDB wrapper holding the control plane's durable state: node records
/// under `node:` and chunk placement records under `chunk:`.
#[derive(Clone)]
pub struct KvDb {
    inner: Arc<DB>,
}

impl KvDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_max_open_files(MAX_OPEN_FILES);
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);

        let db = DB::open(&opts, path)?;
        Ok(Self {
            inner: Arc::new(db),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let v = self.inner.get(key.as_bytes())?;
        if let Some(raw) = v {
            let t = serde_json::from_slice::<T>(&raw)?;
            Ok(Some(t))
        } else {
            Ok(None)
        }
    }

    // Control-plane records are small and rarely written; every put is synced.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let buf = serde_json::to_vec(value)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.inner.put_opt(key.as_bytes(), buf, &write_opts)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete(key.as_bytes())?;
        Ok(())
    }

    pub fn iter(&self) -> rocksdb::DBIterator<'_> {
        let readopts = ReadOptions::default();
        self.inner.iterator_opt(IteratorMode::Start, readopts)
    }
}

/// Where a chunk lives. The control plane decides and records placement; the
/// bytes themselves move through the upload pipeline, not through here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub file_id: String,
    pub size_bytes: u64,
    pub replicas: Vec<String>, // node_ids, ranked order preserved
    pub created_ms: i128,
}

impl ChunkRecord {
    pub fn new(chunk_id: String, file_id: String, size_bytes: u64, replicas: Vec<String>) -> Self {
        Self {
            chunk_id,
            file_id,
            size_bytes,
            replicas,
            created_ms: utc_now_ms(),
        }
    }
}
