//! RocksDB-backed store.
//!
//! Column families:
//! - `presence` — one [`PresenceRecord`] per `trip_id\0user_id`
//! - `items`    — one [`ItineraryItem`] per `trip_id\0item_id`
//!
//! Values are bincode (serde mode). Every multi-row write goes through a
//! single `WriteBatch`, so a reorder lands all of its rows or none.

use std::path::PathBuf;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use withme_core::{ItineraryItem, PresenceRecord};

use super::{apply_offline, most_recent, ItemStore, PresenceStore, StoreError};

const CF_PRESENCE: &str = "presence";
const CF_ITEMS: &str = "items";

const COLUMN_FAMILIES: &[&str] = &[CF_PRESENCE, CF_ITEMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("withme_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open or create the database with both column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Rewritten on every heartbeat; small and hot.
            CF_PRESENCE => {
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_ITEMS => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    // ─── Row helpers ───────────────────────────────────────

    fn key(trip_id: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(trip_id.len() + id.len() + 1);
        key.extend_from_slice(trip_id.as_bytes());
        key.push(0);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn prefix(trip_id: &str) -> Vec<u8> {
        let mut prefix = trip_id.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// All values under the trip prefix, in key order.
    fn scan<T: DeserializeOwned>(&self, cf: &str, trip_id: &str) -> Result<Vec<T>, StoreError> {
        let prefix = Self::prefix(trip_id);
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(&prefix, Direction::Forward));

        let mut rows = Vec::new();
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(decode(&value)?);
        }
        Ok(rows)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[async_trait]
impl PresenceStore for RocksStore {
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_PRESENCE)?,
            Self::key(&record.trip_id, &record.user_id),
            encode(record)?,
        );
        self.write(batch)
    }

    async fn mark_offline(
        &self,
        trip_id: &str,
        user_id: &str,
        as_of: u64,
    ) -> Result<bool, StoreError> {
        let key = Self::key(trip_id, user_id);
        let Some(mut record) = self.get::<PresenceRecord>(CF_PRESENCE, &key)? else {
            return Ok(false);
        };
        if !apply_offline(&mut record, as_of) {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_PRESENCE)?, key, encode(&record)?);
        self.write(batch)?;
        Ok(true)
    }

    async fn active_members(
        &self,
        trip_id: &str,
        limit: usize,
    ) -> Result<Vec<PresenceRecord>, StoreError> {
        let records = self.scan(CF_PRESENCE, trip_id)?;
        Ok(most_recent(records, limit))
    }
}

#[async_trait]
impl ItemStore for RocksStore {
    async fn load_items(&self, trip_id: &str) -> Result<Vec<ItineraryItem>, StoreError> {
        self.scan(CF_ITEMS, trip_id)
    }

    async fn put_items(&self, trip_id: &str, items: &[ItineraryItem]) -> Result<(), StoreError> {
        let cf = self.cf(CF_ITEMS)?;
        let mut batch = WriteBatch::default();
        for item in items {
            batch.put_cf(cf, Self::key(trip_id, &item.id), encode(item)?);
        }
        self.write(batch)
    }
}
