//! Storage element implementations
//!
//! `CacheStorage` tracks real residency with timed add/remove operations.
//! The two hitrate variants keep no real content: `HitrateStorage` splits
//! every transfer between the local and remote pipes by a fixed fraction,
//! `FileBasedHitrateStorage` routes each request wholly to one side based on
//! a per-request decision.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;

use crate::kernel::{Capacity, Handle, Pipe};
use crate::monitor::{Sample, SampleQueue, StorageSnapshot};
use crate::storage::files::{RequestedFile, StoredFile};
use crate::storage::StorageElement;

const DELETION_DURATION: f64 = 5.0;
const UPDATE_DURATION: f64 = 1.0;

/// The shared far-away storage behind the remote pipe. Unlimited capacity,
/// never caches.
pub struct RemoteStorage {
    pipe: Pipe,
}

impl RemoteStorage {
    pub fn new(handle: &Handle, throughput: f64) -> Rc<Self> {
        let pipe = Pipe::new(handle, throughput);
        pipe.set_label("remote");
        Rc::new(Self { pipe })
    }

    pub fn pipe(&self) -> Pipe {
        self.pipe.clone()
    }

    pub async fn transfer(&self, file: &RequestedFile) {
        self.pipe.transfer(file.filesize, None).await;
    }
}

/// Classic cache with real residency and eviction.
pub struct CacheStorage {
    name: String,
    sitename: Option<String>,
    handle: Handle,
    samples: SampleQueue,
    used: Capacity,
    files: RefCell<BTreeMap<String, Rc<StoredFile>>>,
    pipe: Pipe,
    remote: RefCell<Option<Rc<RemoteStorage>>>,
}

impl CacheStorage {
    pub fn new(
        handle: &Handle,
        samples: SampleQueue,
        name: impl Into<String>,
        sitename: Option<String>,
        size: f64,
        throughput: f64,
        preloaded: Vec<Rc<StoredFile>>,
    ) -> Rc<Self> {
        let name = name.into();
        let pipe = Pipe::new(handle, throughput);
        pipe.set_label(name.clone());
        let used = Capacity::new(size);
        let mut files = BTreeMap::new();
        for file in preloaded {
            if used.increase(file.storedsize).is_err() {
                log::warn!(
                    "storage {}: preloaded file {} exceeds capacity, skipped",
                    name,
                    file.filename
                );
                continue;
            }
            files.insert(file.filename.clone(), file);
        }
        Rc::new(Self {
            name,
            sitename,
            handle: handle.clone(),
            samples,
            used,
            files: RefCell::new(files),
            pipe,
            remote: RefCell::new(None),
        })
    }

    fn snapshot(&self) -> StorageSnapshot {
        StorageSnapshot {
            storage: self.name.clone(),
            used: self.used.used(),
            size: self.used.total(),
            files: self.files.borrow().len(),
        }
    }
}

#[async_trait(?Send)]
impl StorageElement for CacheStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn sitename(&self) -> Option<&str> {
        self.sitename.as_deref()
    }

    fn size(&self) -> f64 {
        self.used.total()
    }

    fn used(&self) -> f64 {
        self.used.used()
    }

    fn available(&self) -> f64 {
        self.used.available()
    }

    fn file_count(&self) -> usize {
        self.files.borrow().len()
    }

    fn stored_files(&self) -> Vec<Rc<StoredFile>> {
        self.files.borrow().values().cloned().collect()
    }

    fn find(&self, file: &RequestedFile) -> f64 {
        self.files
            .borrow()
            .get(&file.filename)
            .map(|stored| stored.filesize)
            .unwrap_or(0.0)
    }

    async fn transfer(&self, file: &RequestedFile) {
        self.pipe.transfer(file.filesize, None).await;
        let resident = self.files.borrow().get(&file.filename).cloned();
        if let Some(stored) = resident {
            self.handle.delay(UPDATE_DURATION).await;
            stored.touch(self.handle.now());
        }
    }

    async fn add(&self, file: &RequestedFile) {
        let stored = file.into_stored(self.handle.now());
        if self.used.increase(stored.storedsize).is_err() {
            log::warn!(
                "storage {}: admission of {} without headroom, dropped",
                self.name,
                file.filename
            );
            return;
        }
        self.files
            .borrow_mut()
            .insert(stored.filename.clone(), stored);
        self.pipe.transfer(file.filesize, None).await;
        self.samples.put(Sample::Storage(self.snapshot()));
    }

    async fn remove(&self, filename: &str) {
        self.handle.delay(DELETION_DURATION).await;
        if let Some(stored) = self.files.borrow_mut().remove(filename) {
            self.used.decrease(stored.storedsize);
        }
        self.samples.put(Sample::Storage(self.snapshot()));
    }

    fn connect_remote(&self, remote: Rc<RemoteStorage>) {
        *self.remote.borrow_mut() = Some(remote);
    }

    fn pipe(&self) -> Pipe {
        self.pipe.clone()
    }
}

/// Cache effectiveness modelled as a fixed fraction `hitrate`: that share of
/// every transfer flows through the local pipe, the rest through the remote
/// pipe, concurrently.
pub struct HitrateStorage {
    name: String,
    sitename: Option<String>,
    hitrate: f64,
    size: f64,
    pipe: Pipe,
    remote: RefCell<Option<Rc<RemoteStorage>>>,
}

impl HitrateStorage {
    pub fn new(
        handle: &Handle,
        hitrate: f64,
        name: impl Into<String>,
        sitename: Option<String>,
        size: f64,
        throughput: f64,
    ) -> Rc<Self> {
        let name = name.into();
        let pipe = Pipe::new(handle, throughput);
        pipe.set_label(name.clone());
        Rc::new(Self {
            name,
            sitename,
            hitrate,
            size,
            pipe,
            remote: RefCell::new(None),
        })
    }

    pub fn hitrate(&self) -> f64 {
        self.hitrate
    }
}

#[async_trait(?Send)]
impl StorageElement for HitrateStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn sitename(&self) -> Option<&str> {
        self.sitename.as_deref()
    }

    fn size(&self) -> f64 {
        self.size
    }

    fn used(&self) -> f64 {
        0.0
    }

    fn available(&self) -> f64 {
        self.size
    }

    fn file_count(&self) -> usize {
        0
    }

    fn stored_files(&self) -> Vec<Rc<StoredFile>> {
        Vec::new()
    }

    // content is fictional: every file reads as fully resident
    fn find(&self, file: &RequestedFile) -> f64 {
        file.filesize
    }

    async fn transfer(&self, file: &RequestedFile) {
        let local = self.hitrate * file.filesize;
        let remote_share = (1.0 - self.hitrate) * file.filesize;
        let remote = self.remote.borrow().clone();
        match remote {
            Some(remote) => {
                let remote_pipe = remote.pipe();
                futures::join!(
                    self.pipe.transfer(local, None),
                    remote_pipe.transfer(remote_share, None)
                );
            }
            None => self.pipe.transfer(local, None).await,
        }
    }

    async fn add(&self, _file: &RequestedFile) {}

    async fn remove(&self, _filename: &str) {}

    fn connect_remote(&self, remote: Rc<RemoteStorage>) {
        *self.remote.borrow_mut() = Some(remote);
    }

    fn pipe(&self) -> Pipe {
        self.pipe.clone()
    }
}

/// Cache effectiveness decided per request: a hit streams entirely from the
/// local pipe, a miss entirely from the remote pipe.
pub struct FileBasedHitrateStorage {
    name: String,
    sitename: Option<String>,
    size: f64,
    pipe: Pipe,
    remote: RefCell<Option<Rc<RemoteStorage>>>,
}

impl FileBasedHitrateStorage {
    pub fn new(
        handle: &Handle,
        name: impl Into<String>,
        sitename: Option<String>,
        size: f64,
        throughput: f64,
    ) -> Rc<Self> {
        let name = name.into();
        let pipe = Pipe::new(handle, throughput);
        pipe.set_label(name.clone());
        Rc::new(Self {
            name,
            sitename,
            size,
            pipe,
            remote: RefCell::new(None),
        })
    }
}

#[async_trait(?Send)]
impl StorageElement for FileBasedHitrateStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn sitename(&self) -> Option<&str> {
        self.sitename.as_deref()
    }

    fn size(&self) -> f64 {
        self.size
    }

    fn used(&self) -> f64 {
        0.0
    }

    fn available(&self) -> f64 {
        self.size
    }

    fn file_count(&self) -> usize {
        0
    }

    fn stored_files(&self) -> Vec<Rc<StoredFile>> {
        Vec::new()
    }

    fn find(&self, file: &RequestedFile) -> f64 {
        file.filesize * file.cachehitrate.unwrap_or(0.0)
    }

    async fn transfer(&self, file: &RequestedFile) {
        let hit = file.cachehitrate.unwrap_or(0.0) > 0.0;
        if hit {
            self.pipe.transfer(file.filesize, None).await;
        } else {
            let remote = self.remote.borrow().clone();
            match remote {
                Some(remote) => remote.pipe().transfer(file.filesize, None).await,
                None => self.pipe.transfer(file.filesize, None).await,
            }
        }
    }

    async fn add(&self, _file: &RequestedFile) {}

    async fn remove(&self, _filename: &str) {}

    fn connect_remote(&self, remote: Rc<RemoteStorage>) {
        *self.remote.borrow_mut() = Some(remote);
    }

    fn pipe(&self) -> Pipe {
        self.pipe.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Queue, Simulation};

    #[test]
    fn test_hitrate_storage_reports_full_residency() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let storage = HitrateStorage::new(&handle, 0.5, "cache", None, 1000.0, 10.0);
        let file = RequestedFile::new("testfile", 100.0);
        assert_eq!(storage.find(&file), 100.0);
        assert_eq!(storage.available(), 1000.0);
        assert_eq!(storage.used(), 0.0);
    }

    #[test]
    fn test_hitrate_transfer_splits_between_pipes() {
        let sim = Simulation::new();
        let handle = sim.handle();
        // local pipe is effectively unconstrained, remote is the bottleneck
        let storage =
            HitrateStorage::new(&handle, 0.5, "cache", None, 1000.0, 10_000_000_000.0);
        let remote = RemoteStorage::new(&handle, 10.0);
        storage.connect_remote(remote);
        let root = {
            let storage = storage.clone();
            async move {
                storage.transfer(&RequestedFile::new("testfile", 100.0)).await;
            }
        };
        let end = sim.run(root, None);
        // 50 bytes over the remote pipe at 10/s dominate
        assert!((end - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_file_based_hitrate_routes_by_flag() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let storage = FileBasedHitrateStorage::new(&handle, "cache", None, 1000.0, 10.0);
        let remote = RemoteStorage::new(&handle, 5.0);
        storage.connect_remote(remote);
        let hit = RequestedFile::with_hitrate("hit", 100.0, true);
        let miss = RequestedFile::with_hitrate("miss", 100.0, false);
        assert_eq!(storage.find(&hit), 100.0);
        assert_eq!(storage.find(&miss), 0.0);
        let root = {
            let storage = storage.clone();
            async move {
                storage.transfer(&hit).await;
                assert!((storage.pipe().transferred() - 100.0).abs() < 1e-6);
                storage.transfer(&miss).await;
            }
        };
        let end = sim.run(root, None);
        // 10s local + 20s remote
        assert!((end - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_cache_storage_add_and_remove_account_bytes() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let storage = CacheStorage::new(
            &handle,
            Queue::new(),
            "cache",
            Some("site1".into()),
            1000.0,
            10.0,
            Vec::new(),
        );
        let probe = storage.clone();
        let root = {
            let storage = storage.clone();
            async move {
                let file = RequestedFile::new("data", 100.0);
                assert_eq!(storage.find(&file), 0.0);
                storage.add(&file).await;
                assert_eq!(storage.used(), 100.0);
                assert_eq!(storage.find(&file), 100.0);
                storage.remove("data").await;
                assert_eq!(storage.used(), 0.0);
            }
        };
        let end = sim.run(root, None);
        // 10s inbound pipe + 5s deletion
        assert!((end - 15.0).abs() < 1e-6);
        assert_eq!(probe.file_count(), 0);
    }

    #[test]
    fn test_cache_storage_transfer_touches_metadata() {
        let sim = Simulation::new();
        let handle = sim.handle();
        let preloaded = vec![StoredFile::new("data", 100.0, None, 0.0, 0.0, 1)];
        let storage = CacheStorage::new(
            &handle,
            Queue::new(),
            "cache",
            None,
            1000.0,
            10.0,
            preloaded,
        );
        let root = {
            let storage = storage.clone();
            async move {
                storage.transfer(&RequestedFile::new("data", 100.0)).await;
            }
        };
        let end = sim.run(root, None);
        // 10s transfer + 1s metadata update
        assert!((end - 11.0).abs() < 1e-6);
        let stored = &storage.stored_files()[0];
        assert_eq!(stored.numberofaccesses.get(), 2);
        assert_eq!(stored.lastaccessed.get(), 11.0);
    }
}
