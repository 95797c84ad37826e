//! HTCondor pool export reader
//!
//! Space-delimited CSV with the columns `TotalSlotCPUs`, `TotalSlotDisk`
//! (MiB), `TotalSlotMemory` (MiB), `Count` and optionally `sitename`. A
//! `Count` of `None` means an unbounded pool. Disk is carried in the drone
//! resource map but excluded from allocation/utilisation accounting, which
//! the simulator enforces via the ignored-resources list.

use std::io::Read;

use crate::io::ReadResult;
use crate::resources::ResourceMap;

/// One pool as described by the export.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: f64,
    pub resources: ResourceMap,
    pub sitename: Option<String>,
}

/// Read all pool definitions from an HTCondor pool export.
pub fn htcondor_pool_reader(reader: impl Read) -> ReadResult<Vec<PoolConfig>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let index_of = |name: &str| headers.iter().position(|header| header == name);
    let (Some(cpus), Some(disk), Some(memory), Some(count)) = (
        index_of("TotalSlotCPUs"),
        index_of("TotalSlotDisk"),
        index_of("TotalSlotMemory"),
        index_of("Count"),
    ) else {
        return Err(crate::io::ReadError::MissingColumn(
            "TotalSlotCPUs TotalSlotDisk TotalSlotMemory Count".into(),
        ));
    };
    let sitename_column = index_of("sitename");
    let mut pools = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        let parse = |index: usize| row.get(index).and_then(|field| field.parse::<f64>().ok());
        let capacity = match row.get(count) {
            Some("None") => f64::INFINITY,
            Some(value) => match value.parse::<f64>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    log::warn!("removed pool row with unreadable count");
                    continue;
                }
            },
            None => {
                log::warn!("removed incomplete pool row");
                continue;
            }
        };
        let (Some(cpus), Some(disk), Some(memory)) = (parse(cpus), parse(disk), parse(memory))
        else {
            log::warn!("removed pool row with unreadable resources");
            continue;
        };
        let mut resources = ResourceMap::new();
        resources.set("cores", cpus);
        resources.set("disk", disk * 1024.0 * 1024.0);
        resources.set("memory", memory * 1024.0 * 1024.0);
        pools.push(PoolConfig {
            capacity,
            resources,
            sitename: sitename_column
                .and_then(|index| row.get(index))
                .filter(|site| !site.is_empty())
                .map(str::to_string),
        });
    }
    Ok(pools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_pool_with_site() {
        let export = "TotalSlotCPUs TotalSlotDisk TotalSlotMemory Count sitename\n\
                      1 44624348.0 8000 1 site1\n";
        let pools = htcondor_pool_reader(export.as_bytes()).unwrap();
        assert_eq!(pools.len(), 1);
        let pool = &pools[0];
        assert_eq!(pool.capacity, 1.0);
        assert_eq!(pool.resources.get("cores"), Some(1.0));
        assert_eq!(
            pool.resources.get("memory"),
            Some(8000.0 * 1024.0 * 1024.0)
        );
        assert_eq!(pool.sitename.as_deref(), Some("site1"));
    }

    #[test]
    fn test_count_none_means_unbounded() {
        let export = "TotalSlotCPUs TotalSlotDisk TotalSlotMemory Count\n\
                      8 1000 16000 None\n";
        let pools = htcondor_pool_reader(export.as_bytes()).unwrap();
        assert!(pools[0].capacity.is_infinite());
        assert!(pools[0].sitename.is_none());
    }

    #[test]
    fn test_missing_columns_fail() {
        let export = "TotalSlotCPUs Count\n1 1\n";
        assert!(htcondor_pool_reader(export.as_bytes()).is_err());
    }
}
