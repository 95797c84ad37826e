//! File records moving through the storage fabric

use std::cell::Cell;
use std::rc::Rc;

/// A file resident in a storage element.
#[derive(Debug)]
pub struct StoredFile {
    pub filename: String,
    pub filesize: f64,
    pub storedsize: f64,
    pub cachedsince: Cell<f64>,
    pub lastaccessed: Cell<f64>,
    pub numberofaccesses: Cell<u32>,
}

impl StoredFile {
    pub fn new(
        filename: impl Into<String>,
        filesize: f64,
        storedsize: Option<f64>,
        cachedsince: f64,
        lastaccessed: f64,
        numberofaccesses: u32,
    ) -> Rc<Self> {
        Rc::new(Self {
            filename: filename.into(),
            filesize,
            storedsize: storedsize.unwrap_or(filesize),
            cachedsince: Cell::new(cachedsince),
            lastaccessed: Cell::new(lastaccessed),
            numberofaccesses: Cell::new(numberofaccesses),
        })
    }

    pub fn touch(&self, now: f64) {
        self.lastaccessed.set(now);
        self.numberofaccesses.set(self.numberofaccesses.get() + 1);
    }
}

/// A file requested by a job.
#[derive(Debug, Clone)]
pub struct RequestedFile {
    pub filename: String,
    pub filesize: f64,
    /// Pre-drawn cache decision for the per-file hitrate variant: 1.0 when
    /// the site cache provides the file, 0.0 when it does not.
    pub cachehitrate: Option<f64>,
}

impl RequestedFile {
    pub fn new(filename: impl Into<String>, filesize: f64) -> Self {
        Self {
            filename: filename.into(),
            filesize,
            cachehitrate: None,
        }
    }

    pub fn with_hitrate(filename: impl Into<String>, filesize: f64, provides: bool) -> Self {
        Self {
            filename: filename.into(),
            filesize,
            cachehitrate: Some(if provides { 1.0 } else { 0.0 }),
        }
    }

    /// Freshly cached copy of this request.
    pub fn into_stored(&self, now: f64) -> Rc<StoredFile> {
        StoredFile::new(self.filename.clone(), self.filesize, None, now, now, 1)
    }
}
