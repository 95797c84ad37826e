//! Standard Workload Format reader
//!
//! SWF 2.2 traces are whitespace-separated with `;` comment lines and a
//! fixed column order. Requested memory is per processor and gets scaled by
//! the processor count; negative requested quantities coerce to zero.

use std::io::{BufRead, BufReader, Read};

use crate::io::ReadResult;
use crate::job::{Job, JobDescription};
use crate::resources::ResourceMap;

const JOB_NUMBER: usize = 0;
const SUBMIT_TIME: usize = 1;
const RUN_TIME: usize = 3;
const ALLOCATED_PROCESSORS: usize = 4;
const USED_MEMORY: usize = 6;
const REQUESTED_PROCESSORS: usize = 7;
const REQUESTED_TIME: usize = 8;
const REQUESTED_MEMORY: usize = 9;

fn column(fields: &[&str], index: usize) -> Option<f64> {
    fields.get(index).and_then(|field| field.parse().ok())
}

/// Read all jobs from an SWF trace.
pub fn swf_job_reader(reader: impl Read) -> ReadResult<Vec<Job>> {
    let mut jobs = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let values = (
            column(&fields, SUBMIT_TIME),
            column(&fields, RUN_TIME),
            column(&fields, ALLOCATED_PROCESSORS),
            column(&fields, USED_MEMORY),
            column(&fields, REQUESTED_PROCESSORS),
            column(&fields, REQUESTED_TIME),
            column(&fields, REQUESTED_MEMORY),
        );
        let (
            Some(submit),
            Some(run_time),
            Some(used_cores),
            Some(used_memory),
            Some(cores),
            Some(walltime),
            Some(memory),
        ) = values
        else {
            log::warn!("removed malformed row from swf import");
            continue;
        };
        let cores = cores.max(0.0);
        let mut resources = ResourceMap::new();
        resources.set("cores", cores);
        resources.set("walltime", walltime.max(0.0));
        resources.set("memory", memory.max(0.0) * cores);
        let used_cores = used_cores.max(0.0);
        let mut used_resources = ResourceMap::new();
        used_resources.set("cores", used_cores);
        used_resources.set("walltime", run_time.max(0.0));
        used_resources.set("memory", used_memory.max(0.0) * used_cores);
        let name = fields.get(JOB_NUMBER).map(|id| id.to_string());
        match Job::new(JobDescription {
            resources,
            used_resources,
            queue_date: submit,
            name,
            ..Default::default()
        }) {
            Ok(job) => jobs.push(job),
            Err(error) => log::warn!("removed job from swf import: {error}"),
        }
    }
    Ok(jobs)
}
