//! Record sinks
//!
//! The dispatcher is agnostic of where records end up; sinks receive the
//! statistic name, the simulation timestamp and the finished record. The
//! JSON-lines sink is the default for files and stdout; the log sink routes
//! records through the `log` facade for ad-hoc runs.

use std::cell::RefCell;
use std::io::Write;

use serde_json::{Map, Value};

/// Destination for monitoring records.
pub trait RecordSink {
    fn emit(&self, statistic: &str, time: f64, record: &Map<String, Value>);
}

/// Writes one JSON object per record, timestamped with simulation time.
pub struct JsonLinesSink {
    out: RefCell<Box<dyn Write>>,
}

impl JsonLinesSink {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out: RefCell::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl RecordSink for JsonLinesSink {
    fn emit(&self, statistic: &str, time: f64, record: &Map<String, Value>) {
        let mut line = Map::new();
        line.insert("statistic".into(), Value::String(statistic.into()));
        line.insert("time".into(), Value::from(time));
        for (key, value) in record {
            line.insert(key.clone(), value.clone());
        }
        let mut out = self.out.borrow_mut();
        if serde_json::to_writer(&mut *out, &Value::Object(line)).is_ok() {
            let _ = out.write_all(b"\n");
        }
    }
}

/// Forwards records to the `log` facade under the statistic's target.
pub struct LogSink;

impl RecordSink for LogSink {
    fn emit(&self, statistic: &str, time: f64, record: &Map<String, Value>) {
        log::info!(
            target: "gridsim::monitor",
            "{} t={} {}",
            statistic,
            time,
            Value::Object(record.clone())
        );
    }
}

/// Collects records in memory; used by tests.
#[derive(Default)]
pub struct MemorySink {
    pub records: RefCell<Vec<(String, f64, Map<String, Value>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(&self, statistic: &str) -> Vec<Map<String, Value>> {
        self.records
            .borrow()
            .iter()
            .filter(|(name, _, _)| name == statistic)
            .map(|(_, _, record)| record.clone())
            .collect()
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, statistic: &str, time: f64, record: &Map<String, Value>) {
        self.records
            .borrow_mut()
            .push((statistic.into(), time, record.clone()));
    }
}
