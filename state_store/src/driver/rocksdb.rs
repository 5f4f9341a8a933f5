use std::path::PathBuf;

pub use rocksdb::Options as RocksDBOptions;
use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    IteratorMode,
    ReadOptions,
    Transaction,
    TransactionDB,
    TransactionDBOptions,
    TransactionOptions,
    WriteOptions,
};

use crate::driver::{Driver, Error as DriverError, KVBytes, RangeOptions, Reader, Writer};

/// Options to start a connection with RocksDB.
pub struct Options {
    pub path: PathBuf,
    pub column_families: Vec<ColumnFamilyDescriptor>,
    /// How long a transaction waits for a row lock before giving up with
    /// a retryable error.
    pub lock_timeout_ms: i64,
}

/// Driver to connect with a RocksDB database.
pub struct RocksDBDriver {
    db: TransactionDB,
}

impl RocksDBDriver {
    /// Open a new connection with a RocksDB database.
    pub(crate) fn open(driver_options: Options) -> Result<RocksDBDriver, DriverError> {
        let mut db_opts = RocksDBOptions::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(driver_options.lock_timeout_ms);

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &txn_db_opts,
            &driver_options.path,
            driver_options.column_families,
        )
        .map_err(|source| DriverError::OpenDatabaseFailed { source })?;

        Ok(RocksDBDriver { db })
    }

    fn column_family(&self, name: &str) -> Result<&ColumnFamily, DriverError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| DriverError::MissingColumnFamily {
                name: name.to_string(),
            })
    }
}

impl Writer for RocksDBDriver {
    fn transaction(&self) -> super::Transaction<'_> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_deadlock_detect(true);
        let tx = self.db.transaction_opt(&WriteOptions::default(), &txn_opts);

        super::Transaction::RocksDB(RocksDBTransaction { db: self, tx })
    }

    fn put<N, K, V>(&self, cf: N, key: K, value: V) -> Result<(), DriverError>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let cf = self.column_family(cf.as_ref())?;
        Ok(self.db.put_cf(cf, key, value)?)
    }
}

impl Reader for RocksDBDriver {
    fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, DriverError>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let cf = self.column_family(cf.as_ref())?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn range<N>(&self, cf: N, options: RangeOptions) -> Result<Vec<KVBytes>, DriverError>
    where
        N: AsRef<str>,
    {
        let cf = self.column_family(cf.as_ref())?;

        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(4_194_304);
        if let Some(lower_bound) = options.lower_bound {
            read_options.set_iterate_lower_bound(lower_bound);
        }
        if let Some(upper_bound) = options.upper_bound {
            read_options.set_iterate_upper_bound(upper_bound);
        }

        let mode = if options.reverse {
            IteratorMode::End
        } else {
            IteratorMode::Start
        };
        let limit = options.limit.unwrap_or(usize::MAX);

        let mut items = Vec::new();
        for kv in self.db.iterator_cf_opt(cf, read_options, mode) {
            if items.len() >= limit {
                break;
            }
            items.push(kv?);
        }
        Ok(items)
    }
}

impl Driver for RocksDBDriver {}

pub struct RocksDBTransaction<'a> {
    db: &'a RocksDBDriver,
    tx: Transaction<'a, TransactionDB>,
}

impl RocksDBTransaction<'_> {
    pub fn commit(self) -> Result<(), DriverError> {
        Ok(self.tx.commit()?)
    }

    pub fn get<K: AsRef<[u8]>>(&self, table: &str, key: K) -> Result<Option<Vec<u8>>, DriverError> {
        let cf = self.db.column_family(table)?;
        Ok(self.tx.get_cf(cf, key)?)
    }

    pub fn get_for_update<K: AsRef<[u8]>>(
        &self,
        table: &str,
        key: K,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        let cf = self.db.column_family(table)?;
        Ok(self.tx.get_for_update_cf(cf, key, true)?)
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        table: &str,
        key: K,
        value: V,
    ) -> Result<(), DriverError> {
        let cf = self.db.column_family(table)?;
        Ok(self.tx.put_cf(cf, key, value)?)
    }

    pub fn delete<K: AsRef<[u8]>>(&self, table: &str, key: K) -> Result<(), DriverError> {
        let cf = self.db.column_family(table)?;
        Ok(self.tx.delete_cf(cf, key)?)
    }
}
