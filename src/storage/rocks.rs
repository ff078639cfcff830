//! RocksDB-backed physical tables, one column family per table.

use super::backend::{TableBackend, WriteOp};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

pub struct RocksBackend {
    db: DB,
    // Serializes check-then-put so `insert_unique` is atomic within the process.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksBackend")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksBackend {
    /// Opens (or creates) the database at `path` with a column family per table.
    /// Column families left over from earlier layouts stay open but unused.
    pub fn open(path: impl AsRef<Path>, tables: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let mut names: BTreeSet<String> = tables.iter().cloned().collect();
        if let Ok(existing) = DB::list_cf(&options, path) {
            names.extend(existing);
        }
        names.remove(rocksdb::DEFAULT_COLUMN_FAMILY_NAME);

        let cfs = names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&options, path, cfs)
            .with_context(|| format!("fail to open rocksdb at {}", path.display()))?;
        info!(path = %path.display(), tables = names.len(), "opened rocksdb backend");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, table: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(table)
            .ok_or_else(|| anyhow!("missing column family {table}"))
    }
}

impl TableBackend for RocksBackend {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn multi_get(&self, table: &str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let cf = self.cf(table)?;
        self.db
            .multi_get_cf(keys.iter().map(|key| (cf, key.as_slice())))
            .into_iter()
            .map(|value| value.map_err(anyhow::Error::from))
            .collect()
    }

    fn insert_unique(&self, table: &str, key: &[u8], value: &[u8]) -> Result<bool> {
        let cf = self.cf(table)?;
        let _guard = self.write_lock.lock();
        if self.db.get_pinned_cf(cf, key)?.is_some() {
            return Ok(false);
        }
        self.db.put_cf(cf, key, value)?;
        Ok(true)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for op in &ops {
            match op {
                WriteOp::Put { table, key, value } => batch.put_cf(self.cf(table)?, key, value),
                WriteOp::Delete { table, key } => batch.delete_cf(self.cf(table)?, key),
            }
        }
        let _guard = self.write_lock.lock();
        self.db.write(batch)?;
        Ok(())
    }

    fn scan_rev(
        &self,
        table: &str,
        lower: &[u8],
        upper: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(table)?;
        let mut rows = Vec::new();
        if lower >= upper || limit == 0 {
            return Ok(rows);
        }
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(upper, Direction::Reverse));
        for entry in iter {
            let (key, value) = entry?;
            if key.as_ref() >= upper {
                continue;
            }
            if key.as_ref() < lower {
                break;
            }
            rows.push((key.into_vec(), value.into_vec()));
            if rows.len() == limit {
                break;
            }
        }
        Ok(rows)
    }
}
