//! Storage and caching fabric
//!
//! This module provides:
//! - Stored/requested file records
//! - The [`StorageElement`] contract with classic, hitrate-parametric and
//!   per-file-hitrate implementations, plus the shared remote storage
//! - The cache admission/eviction algorithm
//! - The site-aware [`connection::Connection`] routing file requests

pub mod cachealgorithm;
pub mod connection;
pub mod element;
pub mod files;

use std::rc::Rc;

use async_trait::async_trait;

use crate::kernel::Pipe;

pub use cachealgorithm::{CacheAlgorithm, CacheDecision};
pub use connection::Connection;
pub use element::{CacheStorage, FileBasedHitrateStorage, HitrateStorage, RemoteStorage};
pub use files::{RequestedFile, StoredFile};

/// Contract of a site-local storage element.
#[async_trait(?Send)]
pub trait StorageElement {
    fn name(&self) -> &str;

    fn sitename(&self) -> Option<&str>;

    /// Total capacity in bytes.
    fn size(&self) -> f64;

    /// Bytes currently resident.
    fn used(&self) -> f64;

    /// Bytes still free.
    fn available(&self) -> f64;

    fn file_count(&self) -> usize;

    /// Resident files, for eviction decisions.
    fn stored_files(&self) -> Vec<Rc<StoredFile>>;

    /// Bytes of `file` this storage can serve; 0 on a miss.
    fn find(&self, file: &RequestedFile) -> f64;

    /// Serve `file` through the storage's pipe (and/or the remote pipe,
    /// depending on the variant), updating access metadata.
    async fn transfer(&self, file: &RequestedFile);

    /// Make `file` resident, piping its bytes in.
    async fn add(&self, file: &RequestedFile);

    /// Evict a resident file by name.
    async fn remove(&self, filename: &str);

    /// Wire up the shared remote storage serving misses.
    fn connect_remote(&self, remote: Rc<RemoteStorage>);

    /// The storage's own throughput pipe.
    fn pipe(&self) -> Pipe;
}
