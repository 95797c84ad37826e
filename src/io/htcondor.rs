//! HTCondor job dump reader
//!
//! Consumes the JSON export of an HTCondor schedd (a list of job records).
//! Requested memory arrives in MiB and disk in KiB; observed memory in MB
//! and disk in KiB. Everything is converted to bytes and seconds. Jobs that
//! recorded a non-positive walltime are rejected with a warning.

use std::collections::BTreeMap;
use std::io::Read;

use serde_json::Value;

use crate::io::{ReadError, ReadResult};
use crate::job::{InputFile, Job, JobDescription};
use crate::resources::ResourceMap;

fn numeric(record: &Value, key: &str) -> Option<f64> {
    match record.get(key) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    }
}

fn input_files(record: &Value) -> BTreeMap<String, InputFile> {
    let mut files = BTreeMap::new();
    let Some(Value::Object(entries)) = record.get("Inputfiles") else {
        return files;
    };
    for (filename, spec) in entries {
        let mut file = InputFile {
            filesize: numeric(spec, "filesize"),
            usedsize: numeric(spec, "usedsize"),
            hitrates: BTreeMap::new(),
        };
        if let Some(Value::Object(hitrates)) = spec.get("hitrates") {
            for (site, probability) in hitrates {
                if let Some(probability) = probability.as_f64() {
                    file.hitrates.insert(site.clone(), probability);
                }
            }
        }
        files.insert(filename.clone(), file);
    }
    files
}

/// Read all jobs from an HTCondor JSON dump.
pub fn htcondor_job_reader(
    reader: impl Read,
    calculation_efficiency: Option<f64>,
) -> ReadResult<Vec<Job>> {
    let parsed: Value = serde_json::from_reader(reader)?;
    let Value::Array(records) = parsed else {
        return Err(ReadError::UnexpectedShape);
    };
    let mut jobs = Vec::new();
    for record in records {
        let Some(walltime) = numeric(&record, "RemoteWallClockTime") else {
            log::warn!("removed job without walltime from htcondor import");
            continue;
        };
        if walltime <= 0.0 {
            log::warn!("removed job with non-positive walltime from htcondor import");
            continue;
        }
        let required = [
            "QDate",
            "RequestCpus",
            "RequestWalltime",
            "RequestMemory",
            "RequestDisk",
            "MemoryUsage",
            "DiskUsage_RAW",
            "RemoteSysCpu",
            "RemoteUserCpu",
        ];
        let mut fields = BTreeMap::new();
        let mut complete = true;
        for key in required {
            match numeric(&record, key) {
                Some(value) => {
                    fields.insert(key, value);
                }
                None => {
                    log::warn!("removed job missing {key} from htcondor import");
                    complete = false;
                    break;
                }
            }
        }
        if !complete {
            continue;
        }
        let mut resources = ResourceMap::new();
        resources.set("cores", fields["RequestCpus"]);
        resources.set("walltime", fields["RequestWalltime"]);
        resources.set("memory", fields["RequestMemory"] * 1024.0 * 1024.0);
        resources.set("disk", fields["RequestDisk"] * 1024.0);
        let mut used_resources = ResourceMap::new();
        used_resources.set(
            "cores",
            (fields["RemoteSysCpu"] + fields["RemoteUserCpu"]) / walltime,
        );
        used_resources.set("walltime", walltime);
        used_resources.set("memory", fields["MemoryUsage"] * 1000.0 * 1000.0);
        used_resources.set("disk", fields["DiskUsage_RAW"] * 1024.0);
        let job = Job::new(JobDescription {
            resources,
            used_resources,
            queue_date: fields["QDate"],
            calculation_efficiency,
            input_files: input_files(&record),
            ..Default::default()
        })?;
        jobs.push(job);
    }
    Ok(jobs)
}
