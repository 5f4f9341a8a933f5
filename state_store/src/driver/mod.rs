//! The driver module centralizes the logic for reading and writing data in
//! the state store.
//!
//! Callers never touch RocksDB types directly: reads go through [`Reader`],
//! writes through a [`Transaction`] obtained from [`Writer::transaction`].
//! Rows that participate in conditional updates implement [`Versioned`] and
//! are written with [`Transaction::compare_and_swap`].

use std::fmt;

use derive_builder::Builder;
use serde::{de::DeserializeOwned, Serialize};

use crate::serializer::{JsonEncode, JsonEncoder};

pub mod rocksdb;
use self::rocksdb::*;

pub type KVBytes = (Box<[u8]>, Box<[u8]>);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(
        "record changed since it was read. table: {}, key: {}, expected version: {:?}, found: {:?}",
        table,
        key,
        expected,
        found
    )]
    VersionMismatch {
        table: String,
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Failed to decode a serialized record. error: {}", source)]
    JsonDecoderFailed { source: anyhow::Error },

    #[error("Failed to encode a new serialized record. error: {}", source)]
    JsonEncoderFailed { source: anyhow::Error },

    #[error("column family {} does not exist", name)]
    MissingColumnFamily { name: String },

    #[error("Failed to open RocksDB database. error: {}", source)]
    OpenDatabaseFailed { source: ::rocksdb::Error },

    #[error(transparent)]
    RocksDBFailure {
        #[from]
        source: ::rocksdb::Error,
    },
}

impl Error {
    /// Identifies failed operations that can be retried: a row lock that
    /// could not be acquired in time, or a deadlock the database broke up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RocksDBFailure { source } => matches!(
                source.kind(),
                ::rocksdb::ErrorKind::Busy |
                    ::rocksdb::ErrorKind::TimedOut |
                    ::rocksdb::ErrorKind::TryAgain
            ),
            _ => false,
        }
    }

    /// Identifies failed operations that MUST not be retried.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    /// Classifies an error that has been through `anyhow`.
    pub fn is_retryable_anyhow(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Error>().is_some_and(Error::is_retryable)
    }
}

/// Rows guarded by an optimistic version number. Every successful write
/// bumps the version by one.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

impl Versioned for data_model::ProtectedInstance {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Writer defines all the write operations for a given driver.
pub trait Writer {
    /// Start a new Transaction in the database.
    fn transaction(&self) -> Transaction<'_>;

    fn put<N, K, V>(&self, cf: N, key: K, value: V) -> Result<(), Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>;
}

/// Reader defines all the read operations for a given driver.
pub trait Reader {
    fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>;

    /// Return the key/value pairs in `[lower_bound, upper_bound)`.
    fn range<N>(&self, cf: N, options: RangeOptions) -> Result<Vec<KVBytes>, Error>
    where
        N: AsRef<str>;
}

/// Options that you can provide to perform a key range scan.
#[derive(Builder, Clone, Debug, Default)]
pub struct RangeOptions {
    #[builder(setter(into, strip_option), default)]
    pub lower_bound: Option<Vec<u8>>,
    #[builder(setter(into, strip_option), default)]
    pub upper_bound: Option<Vec<u8>>,
    /// Walk from the upper bound down.
    #[builder(default)]
    pub reverse: bool,
    #[builder(setter(strip_option), default)]
    pub limit: Option<usize>,
}

impl RangeOptions {
    /// Every key that starts with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            lower_bound: Some(prefix.as_bytes().to_vec()),
            upper_bound: Some(prefix_upper_bound(prefix.as_bytes())),
            ..Default::default()
        }
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return upper;
        }
    }
    vec![u8::MAX]
}

/// Driver defines all the operations a database driver needs to support.
pub trait Driver: Writer + Reader {}

/// Multiple options to configure different database drivers.
#[non_exhaustive]
pub enum ConnectionOptions {
    RocksDB(rocksdb::Options),
}

/// Open a connection to a database.
pub fn open_database(options: ConnectionOptions) -> Result<RocksDBDriver, Error> {
    match options {
        ConnectionOptions::RocksDB(options) => rocksdb::RocksDBDriver::open(options),
    }
}

/// Transaction is a wrapper around specific database transactions.
///
/// Reads through [`Transaction::get_for_update`] take an exclusive row lock
/// held until commit, which serializes writers of the same row without a
/// global lock.
pub enum Transaction<'db> {
    RocksDB(RocksDBTransaction<'db>),
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transaction::RocksDB(_) => write!(f, "Transaction::RocksDB"),
        }
    }
}

impl<'db> Transaction<'db> {
    pub fn commit(self) -> Result<(), Error> {
        let Self::RocksDB(tx) = self;
        tx.commit()
    }

    /// Read without locking the row.
    pub fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let Self::RocksDB(tx) = self;
        tx.get(cf.as_ref(), key)
    }

    /// Read and lock the row until the transaction ends.
    pub fn get_for_update<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let Self::RocksDB(tx) = self;
        tx.get_for_update(cf.as_ref(), key)
    }

    pub fn put<N, K, V>(&self, cf: N, key: K, value: V) -> Result<(), Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let Self::RocksDB(tx) = self;
        tx.put(cf.as_ref(), key, value)
    }

    pub fn delete<N, K>(&self, cf: N, key: K) -> Result<(), Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let Self::RocksDB(tx) = self;
        tx.delete(cf.as_ref(), key)
    }

    /// Lock the persisted record, check that its version is `expected`
    /// (`None` meaning the row must not exist yet) and write `record` with
    /// the next version.
    pub fn compare_and_swap<N, K, R>(
        &self,
        cf: N,
        key: K,
        expected: Option<u64>,
        record: &mut R,
    ) -> Result<(), Error>
    where
        N: AsRef<str>,
        K: AsRef<str>,
        R: Versioned + Serialize + DeserializeOwned + fmt::Debug,
    {
        let table = cf.as_ref();
        let key = key.as_ref();
        let found = match self.get_for_update(table, key)? {
            Some(bytes) => {
                let existing: R = JsonEncoder::decode(&bytes)
                    .map_err(|source| Error::JsonDecoderFailed { source })?;
                Some(existing.version())
            }
            None => None,
        };

        if found != expected {
            return Err(Error::VersionMismatch {
                table: table.to_string(),
                key: key.to_string(),
                expected,
                found,
            });
        }

        record.set_version(found.unwrap_or_default() + 1);
        let bytes =
            JsonEncoder::encode(record).map_err(|source| Error::JsonEncoderFailed { source })?;
        self.put(table, key, bytes)
    }
}
