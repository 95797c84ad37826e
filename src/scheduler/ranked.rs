//! Ranked (auto)clusters of drone wrappers
//!
//! Drones are bucketed under a sort key derived from the negated
//! PreJobRank, so higher-ranked drones come first. The autoclustering
//! variant extends the key with quantized free resources, making drones
//! with equivalent offers interchangeable during matchmaking. Snapshots
//! share the wrappers (and their temporary residual overlays) but own the
//! cluster structure, so hypothetical matches never disturb the live view.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use ordered_float::OrderedFloat;

use crate::classad::{evaluate, quantize, AttributeSource, Expr};
use crate::scheduler::wrapped::WrappedAd;

/// One set of interchangeable drone wrappers.
pub type Cluster = Vec<Rc<WrappedAd>>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ClusterKey {
    rank: OrderedFloat<f64>,
    dims: Option<[i64; 3]>,
}

/// Sorted clustering of drone wrappers by matchmaking rank.
pub trait RankedClusters {
    fn add(&mut self, item: Rc<WrappedAd>);

    fn remove(&mut self, item: &Rc<WrappedAd>);

    /// Re-key an item after its state changed.
    fn update(&mut self, item: &Rc<WrappedAd>) {
        self.remove(item);
        self.add(item.clone());
    }

    /// Whether no drone has resources left to hand out.
    fn empty(&self) -> bool;

    /// All clusters in key order.
    fn clusters(&self) -> Vec<Cluster>;

    /// Clusters grouped by equal PreJobRank, best rank first.
    fn cluster_groups(&self) -> Vec<Vec<Cluster>>;

    /// Structural copy sharing the wrapped items.
    fn copy_snapshot(&self) -> Box<dyn RankedClusters>;
}

#[derive(Clone)]
struct ClusterStore {
    quantization: BTreeMap<String, f64>,
    ranking: Expr,
    clusters: BTreeMap<ClusterKey, Cluster>,
    inverse: HashMap<u64, ClusterKey>,
}

impl ClusterStore {
    fn new(quantization: BTreeMap<String, f64>, ranking: Expr) -> Self {
        Self {
            quantization,
            ranking,
            clusters: BTreeMap::new(),
            inverse: HashMap::new(),
        }
    }

    fn rank_of(&self, item: &WrappedAd) -> f64 {
        -evaluate(&self.ranking, item, None)
            .as_number()
            .unwrap_or(0.0)
    }

    fn quantized_dims(&self, item: &WrappedAd) -> [i64; 3] {
        let mut dims = [0i64; 3];
        for (slot, key) in ["cpus", "memory", "disk"].iter().enumerate() {
            let value = item
                .attribute(key)
                .and_then(|value| value.as_number())
                .unwrap_or(0.0);
            let quantum = self.quantization.get(*key).copied().unwrap_or(1.0);
            dims[slot] = quantize(value, quantum) as i64;
        }
        dims
    }

    fn insert(&mut self, key: ClusterKey, item: Rc<WrappedAd>) {
        self.clusters.entry(key.clone()).or_default().push(item.clone());
        self.inverse.insert(item.id(), key);
    }

    fn take(&mut self, item: &Rc<WrappedAd>) {
        let Some(key) = self.inverse.remove(&item.id()) else {
            return;
        };
        if let Some(cluster) = self.clusters.get_mut(&key) {
            cluster.retain(|member| member.id() != item.id());
            if cluster.is_empty() {
                self.clusters.remove(&key);
            }
        }
    }
}

/// Clusters drones by (PreJobRank, quantized free resources).
pub struct RankedAutoClusters {
    store: ClusterStore,
}

impl RankedAutoClusters {
    pub fn new(quantization: BTreeMap<String, f64>, ranking: Expr) -> Self {
        Self {
            store: ClusterStore::new(quantization, ranking),
        }
    }
}

impl RankedClusters for RankedAutoClusters {
    fn add(&mut self, item: Rc<WrappedAd>) {
        let key = ClusterKey {
            rank: OrderedFloat(self.store.rank_of(&item)),
            dims: Some(self.store.quantized_dims(&item)),
        };
        self.store.insert(key, item);
    }

    fn remove(&mut self, item: &Rc<WrappedAd>) {
        self.store.take(item);
    }

    fn empty(&self) -> bool {
        self.store
            .clusters
            .values()
            .all(|cluster| cluster.first().map(|rep| rep.empty()).unwrap_or(true))
    }

    fn clusters(&self) -> Vec<Cluster> {
        self.store.clusters.values().cloned().collect()
    }

    fn cluster_groups(&self) -> Vec<Vec<Cluster>> {
        let mut groups: Vec<Vec<Cluster>> = Vec::new();
        let mut current_rank: Option<OrderedFloat<f64>> = None;
        for (key, cluster) in &self.store.clusters {
            if cluster.first().map(|rep| rep.empty()).unwrap_or(true) {
                continue;
            }
            if current_rank != Some(key.rank) {
                current_rank = Some(key.rank);
                groups.push(Vec::new());
            }
            if let Some(group) = groups.last_mut() {
                group.push(cluster.clone());
            }
        }
        groups
    }

    fn copy_snapshot(&self) -> Box<dyn RankedClusters> {
        Box::new(Self {
            store: self.store.clone(),
        })
    }
}

/// Clusters drones by PreJobRank alone; every drone stays individually
/// visible to the matchmaker.
pub struct RankedNonClusters {
    store: ClusterStore,
}

impl RankedNonClusters {
    pub fn new(quantization: BTreeMap<String, f64>, ranking: Expr) -> Self {
        Self {
            store: ClusterStore::new(quantization, ranking),
        }
    }
}

impl RankedClusters for RankedNonClusters {
    fn add(&mut self, item: Rc<WrappedAd>) {
        let key = ClusterKey {
            rank: OrderedFloat(self.store.rank_of(&item)),
            dims: None,
        };
        self.store.insert(key, item);
    }

    fn remove(&mut self, item: &Rc<WrappedAd>) {
        self.store.take(item);
    }

    fn empty(&self) -> bool {
        self.store
            .clusters
            .values()
            .all(|cluster| cluster.iter().all(|drone| drone.empty()))
    }

    fn clusters(&self) -> Vec<Cluster> {
        self.store.clusters.values().cloned().collect()
    }

    fn cluster_groups(&self) -> Vec<Vec<Cluster>> {
        self.store
            .clusters
            .values()
            .map(|cluster| {
                cluster
                    .iter()
                    .map(|drone| vec![drone.clone()])
                    .collect::<Vec<Cluster>>()
            })
            .collect()
    }

    fn copy_snapshot(&self) -> Box<dyn RankedClusters> {
        Box::new(Self {
            store: self.store.clone(),
        })
    }
}
