//! Storage index and content readers
//!
//! The index file lists caches as `name sitename cachesizeGB
//! throughput_limit`; sizes and throughput arrive in GiB and are converted
//! to bytes. The optional content file preloads caches with `filename
//! cachename filesize storedsize cachedsince lastaccessed numberofaccesses`
//! rows (sizes in GiB). A cache without content rows starts empty.

use std::collections::BTreeMap;
use std::io::Read;

use crate::io::{ReadError, ReadResult};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One preloaded file as described by the content file.
#[derive(Debug, Clone)]
pub struct StoredFileConfig {
    pub filename: String,
    pub filesize: f64,
    pub storedsize: f64,
    pub cachedsince: f64,
    pub lastaccessed: f64,
    pub numberofaccesses: u32,
}

/// One cache as described by the index file.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub name: String,
    pub sitename: Option<String>,
    pub size: f64,
    pub throughput: f64,
    pub files: Vec<StoredFileConfig>,
}

fn space_reader(reader: impl Read) -> csv::Reader<impl Read> {
    csv::ReaderBuilder::new()
        .delimiter(b' ')
        .trim(csv::Trim::All)
        .from_reader(reader)
}

/// Read the content file into per-cache file lists.
pub fn storage_content_reader(
    reader: impl Read,
) -> ReadResult<BTreeMap<String, Vec<StoredFileConfig>>> {
    let mut csv_reader = space_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let index_of = |name: &str| headers.iter().position(|header| header == name);
    let columns = (
        index_of("filename"),
        index_of("cachename"),
        index_of("filesize"),
        index_of("storedsize"),
        index_of("cachedsince"),
        index_of("lastaccessed"),
        index_of("numberofaccesses"),
    );
    let (
        Some(filename),
        Some(cachename),
        Some(filesize),
        Some(storedsize),
        Some(cachedsince),
        Some(lastaccessed),
        Some(numberofaccesses),
    ) = columns
    else {
        return Err(ReadError::MissingColumn("storage content header".into()));
    };
    let mut content: BTreeMap<String, Vec<StoredFileConfig>> = BTreeMap::new();
    for row in csv_reader.records() {
        let row = row?;
        let parse = |index: usize| row.get(index).and_then(|field| field.parse::<f64>().ok());
        let (Some(filesize), Some(storedsize), Some(cachedsince), Some(lastaccessed)) = (
            parse(filesize),
            parse(storedsize),
            parse(cachedsince),
            parse(lastaccessed),
        ) else {
            log::warn!("removed malformed storage content row");
            continue;
        };
        let accesses = row
            .get(numberofaccesses)
            .and_then(|field| field.parse::<u32>().ok())
            .unwrap_or(0);
        let (Some(filename), Some(cachename)) = (row.get(filename), row.get(cachename)) else {
            log::warn!("removed incomplete storage content row");
            continue;
        };
        content
            .entry(cachename.to_string())
            .or_default()
            .push(StoredFileConfig {
                filename: filename.to_string(),
                filesize: filesize * GIB,
                storedsize: storedsize * GIB,
                cachedsince,
                lastaccessed,
                numberofaccesses: accesses,
            });
    }
    Ok(content)
}

/// Read the storage index, attaching any preloaded content.
pub fn storage_reader(
    index: impl Read,
    content: Option<impl Read>,
) -> ReadResult<Vec<StorageConfig>> {
    let mut preloaded = match content {
        Some(reader) => storage_content_reader(reader)?,
        None => BTreeMap::new(),
    };
    let mut csv_reader = space_reader(index);
    let headers = csv_reader.headers()?.clone();
    let index_of = |name: &str| headers.iter().position(|header| header == name);
    let (Some(name), Some(sitename), Some(size), Some(throughput)) = (
        index_of("name"),
        index_of("sitename"),
        index_of("cachesizeGB"),
        index_of("throughput_limit"),
    ) else {
        return Err(ReadError::MissingColumn(
            "name sitename cachesizeGB throughput_limit".into(),
        ));
    };
    let mut storages = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        let parse = |index: usize| row.get(index).and_then(|field| field.parse::<f64>().ok());
        let (Some(cache_name), Some(size), Some(throughput)) =
            (row.get(name), parse(size), parse(throughput))
        else {
            log::warn!("removed malformed storage row");
            continue;
        };
        storages.push(StorageConfig {
            name: cache_name.to_string(),
            sitename: row
                .get(sitename)
                .filter(|site| !site.is_empty())
                .map(str::to_string),
            size: size * GIB,
            throughput: throughput * GIB,
            files: preloaded.remove(cache_name).unwrap_or_default(),
        });
    }
    Ok(storages)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = "name sitename cachesizeGB throughput_limit\n\
                         cache1 site1 1000 1.0\n";

    const CONTENT: &str = "\
filename cachename filesize storedsize cachedsince lastaccessed numberofaccesses
/data/a.root cache1 2 2 1400000000 1400000100 3
/data/b.root cache2 1 1 1400000000 1400000000 1
";

    #[test]
    fn test_reads_index_with_unit_conversion() {
        let storages = storage_reader(INDEX.as_bytes(), None::<&[u8]>).unwrap();
        assert_eq!(storages.len(), 1);
        let storage = &storages[0];
        assert_eq!(storage.name, "cache1");
        assert_eq!(storage.sitename.as_deref(), Some("site1"));
        assert_eq!(storage.size, 1000.0 * GIB);
        assert_eq!(storage.throughput, GIB);
        assert!(storage.files.is_empty());
    }

    #[test]
    fn test_content_is_grouped_by_cache() {
        let content = storage_content_reader(CONTENT.as_bytes()).unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content["cache1"].len(), 1);
        let file = &content["cache1"][0];
        assert_eq!(file.filename, "/data/a.root");
        assert_eq!(file.filesize, 2.0 * GIB);
        assert_eq!(file.numberofaccesses, 3);
    }

    #[test]
    fn test_index_attaches_matching_content() {
        let storages =
            storage_reader(INDEX.as_bytes(), Some(CONTENT.as_bytes())).unwrap();
        assert_eq!(storages[0].files.len(), 1);
        assert_eq!(storages[0].files[0].filename, "/data/a.root");
    }
}
