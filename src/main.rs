//! GRIDSIM command line interface
//!
//! Wires the input readers, a scheduler, pools and (optionally) the storage
//! fabric into one simulation run:
//!
//! - `static`: fixed-size pools
//! - `dynamic`: elastic pools regulated by linear controllers
//! - `hybrid`: a mix of both

use std::fs::File;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use gridsim::io::htcondor::htcondor_job_reader;
use gridsim::io::pools::htcondor_pool_reader;
use gridsim::io::storage::storage_reader;
use gridsim::io::swf::swf_job_reader;
use gridsim::monitor::sink::JsonLinesSink;
use gridsim::scheduler::classad::{
    JOB_AD_DEFAULTS, MACHINE_AD_DEFAULTS, PRE_JOB_RANK_DEFAULTS,
};
use gridsim::{ControllerKind, PoolSetup, Simulator, StorageVariant};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Parser)]
#[command(name = "gridsim", version, about = "Opportunistic batch site simulator")]
struct Cli {
    /// Seed for every random decision in the run.
    #[arg(long, default_value_t = 1234)]
    seed: u64,

    /// Stop the simulation at this simulated time.
    #[arg(long)]
    until: Option<f64>,

    /// Write monitoring records as JSON lines to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Scale of compute time per used core (jobs without it run their
    /// recorded walltime).
    #[arg(long)]
    calculation_efficiency: Option<f64>,

    /// Machine ad for the ClassAd matchmaker; selecting any ad option
    /// switches from the greedy scheduler to the matchmaker.
    #[arg(long)]
    machine_ad: Option<String>,

    /// Job ad for the ClassAd matchmaker.
    #[arg(long)]
    job_ad: Option<String>,

    /// PreJobRank expression for the ClassAd matchmaker.
    #[arg(long)]
    pre_job_rank: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against fixed-size pools.
    Static {
        /// Job trace: PATH TYPE (htcondor | swf).
        #[arg(long, num_args = 2, value_names = ["PATH", "TYPE"])]
        job_file: Vec<String>,

        /// Pool export: PATH TYPE (htcondor); repeatable.
        #[arg(long, num_args = 2, value_names = ["PATH", "TYPE"], action = ArgAction::Append)]
        pool_file: Vec<String>,

        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Run against elastic pools with linear demand controllers.
    Dynamic {
        #[arg(long, num_args = 2, value_names = ["PATH", "TYPE"])]
        job_file: Vec<String>,

        #[arg(long, num_args = 2, value_names = ["PATH", "TYPE"], action = ArgAction::Append)]
        pool_file: Vec<String>,

        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Run against a mix of static and elastic pools.
    Hybrid {
        #[arg(long, num_args = 2, value_names = ["PATH", "TYPE"])]
        job_file: Vec<String>,

        /// Static pool export; repeatable.
        #[arg(long, num_args = 2, value_names = ["PATH", "TYPE"], action = ArgAction::Append)]
        static_pool_file: Vec<String>,

        /// Elastic pool export; repeatable.
        #[arg(long, num_args = 2, value_names = ["PATH", "TYPE"], action = ArgAction::Append)]
        dynamic_pool_file: Vec<String>,

        #[command(flatten)]
        storage: StorageArgs,
    },
}

#[derive(clap::Args)]
struct StorageArgs {
    /// Storage setup: INDEX CONTENT TYPE where CONTENT may be `none` and
    /// TYPE is standard | hitrate | filehitrate.
    #[arg(long, num_args = 3, value_names = ["INDEX", "CONTENT", "TYPE"])]
    storage_files: Vec<String>,

    /// Shared remote throughput in GiB/s.
    #[arg(long, default_value_t = 1.0)]
    remote_throughput: f64,

    /// Fixed cache hitrate for the `hitrate` storage type.
    #[arg(long)]
    cache_hitrate: Option<f64>,
}

fn read_jobs(
    simulator: &Simulator,
    job_file: &[String],
    calculation_efficiency: Option<f64>,
) -> Result<()> {
    let [path, file_type] = job_file else {
        bail!("--job-file expects PATH TYPE");
    };
    let reader = File::open(path).with_context(|| format!("cannot open job file {path}"))?;
    let jobs = match file_type.as_str() {
        "htcondor" => htcondor_job_reader(reader, calculation_efficiency)?,
        "swf" => swf_job_reader(reader)?,
        other => bail!("unknown job file type {other:?}"),
    };
    simulator.create_job_generator(jobs);
    Ok(())
}

fn read_pools(simulator: &Simulator, pool_files: &[String], setup: PoolSetup) -> Result<()> {
    for pair in pool_files.chunks(2) {
        let [path, file_type] = pair else {
            bail!("--pool-file expects PATH TYPE");
        };
        if file_type != "htcondor" {
            bail!("unknown pool file type {file_type:?}");
        }
        let reader =
            File::open(path).with_context(|| format!("cannot open pool file {path}"))?;
        let pools = htcondor_pool_reader(reader)?;
        simulator.create_pools(pools, setup)?;
    }
    Ok(())
}

fn read_storage(simulator: &Simulator, storage: &StorageArgs) -> Result<()> {
    if storage.storage_files.is_empty() {
        return Ok(());
    }
    let [index, content, file_type] = &storage.storage_files[..] else {
        bail!("--storage-files expects INDEX CONTENT TYPE");
    };
    let variant = match file_type.as_str() {
        "standard" => StorageVariant::Standard,
        "hitrate" => {
            let hitrate = storage
                .cache_hitrate
                .context("--cache-hitrate is required for hitrate storage")?;
            StorageVariant::Hitrate(hitrate)
        }
        "filehitrate" => StorageVariant::FileBasedHitrate,
        other => bail!("unknown storage type {other:?}"),
    };
    // classic storages cache admitted misses; hitrate content is fictional
    let caching = matches!(variant, StorageVariant::Standard);
    simulator.create_connection(storage.remote_throughput * GIB, caching);
    let index_reader =
        File::open(index).with_context(|| format!("cannot open storage index {index}"))?;
    let content_reader = match content.as_str() {
        "none" | "-" => None,
        path => Some(
            File::open(path)
                .with_context(|| format!("cannot open storage content {path}"))?,
        ),
    };
    let configs = storage_reader(index_reader, content_reader)?;
    simulator.create_storage(configs, variant)?;
    Ok(())
}

fn create_scheduler(cli: &Cli, simulator: &Simulator) -> Result<()> {
    if cli.machine_ad.is_some() || cli.job_ad.is_some() || cli.pre_job_rank.is_some() {
        simulator.create_classad_scheduler(
            cli.machine_ad.as_deref().unwrap_or(MACHINE_AD_DEFAULTS),
            cli.job_ad.as_deref().unwrap_or(JOB_AD_DEFAULTS),
            cli.pre_job_rank.as_deref().unwrap_or(PRE_JOB_RANK_DEFAULTS),
            false,
        )?;
    } else {
        simulator.create_condor_scheduler();
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let simulator = Simulator::new(cli.seed);
    if let Some(path) = &cli.log_file {
        let out = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        simulator.set_record_sink(Rc::new(JsonLinesSink::new(Box::new(out))));
    }
    simulator.enable_monitoring();
    create_scheduler(&cli, &simulator)?;
    match &cli.command {
        Command::Static {
            job_file,
            pool_file,
            storage,
        } => {
            read_storage(&simulator, storage)?;
            read_jobs(&simulator, job_file, cli.calculation_efficiency)?;
            read_pools(&simulator, pool_file, PoolSetup::Static)?;
        }
        Command::Dynamic {
            job_file,
            pool_file,
            storage,
        } => {
            read_storage(&simulator, storage)?;
            read_jobs(&simulator, job_file, cli.calculation_efficiency)?;
            read_pools(
                &simulator,
                pool_file,
                PoolSetup::Elastic(ControllerKind::Linear),
            )?;
        }
        Command::Hybrid {
            job_file,
            static_pool_file,
            dynamic_pool_file,
            storage,
        } => {
            read_storage(&simulator, storage)?;
            read_jobs(&simulator, job_file, cli.calculation_efficiency)?;
            read_pools(&simulator, static_pool_file, PoolSetup::Static)?;
            read_pools(
                &simulator,
                dynamic_pool_file,
                PoolSetup::Elastic(ControllerKind::Linear),
            )?;
        }
    }
    let duration = simulator.run(cli.until);
    println!("simulation finished after {duration} ticks");
    Ok(())
}
