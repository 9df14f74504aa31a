//! Persistent payload caching using sled
//!
//! Binary payloads are deployed under content-hashed addresses, so an entry
//! never goes stale: the address changes whenever the bytes do.

use anyhow::Result;
use sled::Db;
use std::path::Path;

#[derive(Clone)]
pub struct PayloadCache {
    db: Db,
}

impl PayloadCache {
    /// Open or create a cache database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory cache discarded on drop, for tests and ephemeral hosts.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Store the payload fetched from `address`
    pub fn put(&self, address: &str, payload: &[u8]) -> Result<()> {
        self.db.insert(address, payload)?;
        tracing::debug!(address, bytes = payload.len(), "payload cached");
        Ok(())
    }

    /// Retrieve a payload by its address
    pub fn get(&self, address: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(address)?.map(|v| v.to_vec()))
    }

    pub fn contains(&self, address: &str) -> Result<bool> {
        Ok(self.db.contains_key(address)?)
    }

    /// Remove a payload
    pub fn remove(&self, address: &str) -> Result<()> {
        self.db.remove(address)?;
        Ok(())
    }

    /// Clear all entries
    pub fn clear(&self) -> Result<()> {
        self.db.clear()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
