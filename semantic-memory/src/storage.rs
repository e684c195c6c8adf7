//! RocksDB storage handle
//!
//! One database with a column family per table. Nodes, edges and legacy
//! embedding rows each live in their own family; `meta` holds the schema
//! version and the migration state.

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{MemoryError, Result};

pub const CF_NODES: &str = "nodes";
pub const CF_EDGES: &str = "edges";
pub const CF_EMBEDDINGS: &str = "embeddings";
pub const CF_META: &str = "meta";

const COLUMN_FAMILIES: [&str; 4] = [CF_NODES, CF_EDGES, CF_EMBEDDINGS, CF_META];

/// Database version stored in metadata
const DB_VERSION_KEY: &[u8] = b"_db_version";
const CURRENT_VERSION: u32 = 1;

/// Shared RocksDB handle
pub struct Database {
    db: DB,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let database = Self {
            db,
            path: path.to_path_buf(),
        };
        database.check_version()?;

        log::info!("Database opened at: {}", path.display());
        Ok(Arc::new(database))
    }

    /// Stamp a fresh database, refuse one written by a newer binary
    fn check_version(&self) -> Result<()> {
        let stored = match self.get_raw(CF_META, DB_VERSION_KEY)? {
            Some(bytes) => {
                let version_bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| MemoryError::incompatible("Invalid version format"))?;
                u32::from_le_bytes(version_bytes)
            }
            None => {
                self.put_raw(CF_META, DB_VERSION_KEY, &CURRENT_VERSION.to_le_bytes())?;
                return Ok(());
            }
        };

        log::debug!(
            "Database version: {} (current: {})",
            stored,
            CURRENT_VERSION
        );

        if stored > CURRENT_VERSION {
            return Err(MemoryError::incompatible(format!(
                "database version {} is newer than supported version {}",
                stored, CURRENT_VERSION
            )));
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| MemoryError::other(format!("missing column family: {}", name)))
    }

    pub fn get_raw(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    pub fn put_raw(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(table)?;
        self.db.put_cf(&cf, key, value)?;
        Ok(())
    }

    /// Delete several keys from one table in a single atomic write
    pub fn delete_many(&self, table: &str, keys: &[Vec<u8>]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let cf = self.cf(table)?;
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(&cf, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// All rows of a table in key order
    pub fn scan(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(table)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    /// Read a JSON value from the meta table
    pub fn get_meta<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(CF_META, key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| MemoryError::Decode {
                    key: format!("meta:{}", key),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Write a JSON value to the meta table
    pub fn put_meta<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put_raw(CF_META, key.as_bytes(), &bytes)?;
        let cf = self.cf(CF_META)?;
        self.db.flush_cf(&cf)?;
        Ok(())
    }

    /// Flush every table's memtable to disk
    pub fn flush(&self) -> Result<()> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
