//! Site-aware routing of file requests
//!
//! The connection maps each site to its storage elements and owns the shared
//! remote pipe. A requested file streams from the site storage holding the
//! largest cached share, or from remote on a miss; misses optionally run the
//! cache admission/eviction algorithm against a randomly chosen site cache.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::drone::Drone;
use crate::job::Job;
use crate::kernel::Handle;
use crate::monitor::{HitrateInfo, Sample, SampleQueue};
use crate::storage::cachealgorithm::CacheAlgorithm;
use crate::storage::element::RemoteStorage;
use crate::storage::files::RequestedFile;
use crate::storage::StorageElement;

enum Source {
    Cache(Rc<dyn StorageElement>),
    Remote,
}

/// Router from a job's file requests to site storages or the remote pipe.
pub struct Connection {
    handle: Handle,
    samples: SampleQueue,
    rng: Rc<RefCell<StdRng>>,
    storages: RefCell<BTreeMap<Option<String>, Vec<Rc<dyn StorageElement>>>>,
    remote: Rc<RemoteStorage>,
    algorithm: CacheAlgorithm,
    caching: bool,
}

impl Connection {
    /// `caching` enables the admission/eviction path for classic storages;
    /// hitrate-based setups keep it off because their content is fictional.
    pub fn new(
        handle: Handle,
        samples: SampleQueue,
        rng: Rc<RefCell<StdRng>>,
        remote_throughput: f64,
        caching: bool,
    ) -> Rc<Self> {
        Rc::new(Self {
            remote: RemoteStorage::new(&handle, remote_throughput),
            handle,
            samples,
            rng,
            storages: RefCell::new(BTreeMap::new()),
            algorithm: CacheAlgorithm::new(),
            caching,
        })
    }

    pub fn remote(&self) -> Rc<RemoteStorage> {
        self.remote.clone()
    }

    /// Register a storage element under its site.
    pub fn add_storage_element(&self, storage: Rc<dyn StorageElement>) {
        storage.connect_remote(self.remote.clone());
        self.storages
            .borrow_mut()
            .entry(storage.sitename().map(str::to_string))
            .or_default()
            .push(storage);
    }

    pub fn storages_for(&self, site: Option<&str>) -> Vec<Rc<dyn StorageElement>> {
        self.storages
            .borrow()
            .get(&site.map(str::to_string))
            .cloned()
            .unwrap_or_default()
    }

    /// Forward every pipe's throttle samples into the monitoring queue.
    pub fn enable_pipe_monitoring(&self) {
        let monitor = |samples: SampleQueue| {
            move |load: crate::kernel::PipeLoad| samples.put(Sample::PipeStatus(load))
        };
        self.remote
            .pipe()
            .set_monitor(Box::new(monitor(self.samples.clone())));
        for storages in self.storages.borrow().values() {
            for storage in storages {
                storage
                    .pipe()
                    .set_monitor(Box::new(monitor(self.samples.clone())));
            }
        }
    }

    /// Pick the site storage with the largest cached share of `file`, or
    /// remote when nothing positive is cached.
    fn determine_source(&self, file: &RequestedFile, site: Option<&str>) -> Source {
        let mut candidates: Vec<(f64, Rc<dyn StorageElement>)> = self
            .storages_for(site)
            .into_iter()
            .map(|storage| (storage.find(file), storage))
            .collect();
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        for (cached, storage) in candidates {
            if cached > 0.0 {
                return Source::Cache(storage);
            }
        }
        Source::Remote
    }

    async fn stream_file(&self, file: &RequestedFile, site: Option<&str>) {
        let source = self.determine_source(file, site);
        if self.caching {
            if let Source::Remote = source {
                let site_storages = self.storages_for(site);
                if !site_storages.is_empty() {
                    let pick = self.rng.borrow_mut().gen_range(0..site_storages.len());
                    let cache = site_storages[pick].clone();
                    let decision = self.algorithm.consider(file, &*cache);
                    if decision.admit {
                        for evicted in decision.evict {
                            cache.remove(&evicted.filename).await;
                        }
                        cache.add(file).await;
                    } else {
                        log::debug!(
                            "file {} not admitted to cache {} at {}",
                            file.filename,
                            cache.name(),
                            self.handle.now()
                        );
                    }
                }
            }
        }
        match source {
            Source::Cache(storage) => storage.transfer(file).await,
            Source::Remote => self.remote.transfer(file).await,
        }
    }

    /// Stream all of a job's input files, sequentially, and return the
    /// elapsed simulated time. When the trace carries per-site hitrates, one
    /// Bernoulli draw decides for the whole job whether the site cache
    /// provides its files, and every request carries that flag.
    pub async fn transfer_files(&self, drone: &Rc<Drone>, job: &Rc<Job>) -> f64 {
        let started = self.handle.now();
        let files = job.input_files();
        if files.is_empty() {
            return 0.0;
        }
        let site = drone.sitename();
        let hitrate_based = files.values().any(|spec| !spec.hitrates.is_empty());
        let mut provides = None;
        if hitrate_based {
            let volume: f64 = files.values().map(|spec| spec.transfer_size()).sum();
            let weighted: f64 = files
                .values()
                .map(|spec| {
                    spec.transfer_size()
                        * site
                            .and_then(|site| spec.hitrates.get(site).copied())
                            .unwrap_or(0.0)
                })
                .sum();
            let hitrate = if volume > 0.0 { weighted / volume } else { 0.0 };
            let drawn = volume > 0.0 && self.rng.borrow_mut().gen::<f64>() < hitrate;
            self.samples.put(Sample::Hitrate(HitrateInfo {
                hitrate,
                volume,
                provides_file: drawn,
            }));
            job.set_read_from_cache(drawn);
            provides = Some(drawn);
        }
        for (filename, spec) in files {
            let file = if spec.hitrates.is_empty() {
                RequestedFile::new(filename.clone(), spec.transfer_size())
            } else {
                RequestedFile::with_hitrate(
                    filename.clone(),
                    spec.transfer_size(),
                    provides.unwrap_or(false),
                )
            };
            self.stream_file(&file, site).await;
        }
        self.handle.now() - started
    }
}
