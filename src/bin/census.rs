use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use subgroup_census::distribute::CostModel;
use subgroup_census::gap::DedupMethod;
use subgroup_census::pipeline::{
    self, LaunchOptions, LeafOptions, PrecomputeOptions, PrepareOptions,
};
use subgroup_census::selftest::SelftestOptions;
use subgroup_census::{CensusConfig, Result};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file. Defaults to census_config.json in the current directory,
    /// or built-in defaults if there is none.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the work directory from the config.
    #[arg(short, long, value_name = "DIRECTORY")]
    dir: Option<PathBuf>,

    /// Log GAP output and internal decisions at debug level.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: CensusCommand,
}

#[derive(Subcommand)]
enum CensusCommand {
    /// Writes census_config.json with the defaults filled in.
    Init {},
    /// Enumerates the conjugacy classes of S_n in GAP and writes their
    /// invariants.
    Precompute {
        #[arg(long)]
        skip_conjugacy: bool,
        #[arg(long)]
        skip_invariants: bool,
    },
    /// Runs the leaf lattice workers over leaves.g.
    Leaves {
        #[arg(long, value_name = "ID")]
        first: Option<usize>,
        #[arg(long, value_name = "ID")]
        last: Option<usize>,
    },
    /// Combines leaf results into one candidate file.
    Combine {},
    /// Buckets the input and writes worker scripts and tracking.json.
    Prepare {
        /// Record file to bucket. Defaults to the precomputed invariants.
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
        /// Deduplicate up to isomorphism instead of conjugacy.
        #[arg(long)]
        isomorphism: bool,
        #[arg(long, value_enum, default_value_t = CostModel::Linear)]
        cost: CostModel,
    },
    /// Launches the dedup workers from tracking.json.
    Launch {
        #[arg(long, conflicts_with = "cygwin_only")]
        wsl_only: bool,
        #[arg(long)]
        cygwin_only: bool,
        #[arg(long, value_name = "NAME")]
        only: Option<String>,
    },
    /// Collects representatives and checks the total.
    Merge {},
    /// Per bucket representatives and duplicates.
    Breakdown {},
    /// Resolves duplicate proofs into a GAP map.
    IsoMap {
        #[arg(short, long, value_name = "FILE")]
        proofs: Option<PathBuf>,
    },
    /// Checks that proofs cover every bucketed group.
    VerifyProofs {
        #[arg(short, long, value_name = "FILE")]
        proofs: Option<PathBuf>,
    },
    /// Re-checks every proof's homomorphism in GAP.
    CheckProofs {
        #[arg(short, long, value_name = "FILE")]
        proofs: Option<PathBuf>,
        /// Verification workers; defaults to num_workers.
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Stages the proofs the master proof file does not have yet.
    StageProofs {
        /// Master proof file; defaults to proofs.g.
        #[arg(short, long, value_name = "FILE")]
        master: Option<PathBuf>,
        #[arg(value_name = "FILE", required = true)]
        candidates: Vec<PathBuf>,
    },
    /// Appends staged proofs that passed verification to the master file.
    AppendProofs {
        #[arg(short, long, value_name = "FILE")]
        master: Option<PathBuf>,
        /// Verification output listing failed proofs.
        #[arg(long, value_name = "FILE")]
        verify_output: Option<PathBuf>,
    },
    /// Writes the minimal invariant fingerprint of every isomorphism type.
    Fingerprints {
        #[arg(short, long, value_name = "FILE")]
        proofs: Option<PathBuf>,
    },
    /// Compares representative counts per sigKey with another work directory.
    ComparePasses {
        #[arg(value_name = "DIR")]
        other: PathBuf,
    },
    /// Writes the IdGroup map of the input records and counts its types.
    Idgroups {
        /// Extra map files to include.
        #[arg(value_name = "FILE")]
        extra: Vec<PathBuf>,
    },
    /// Watches worker progress files.
    Monitor {
        #[arg(long)]
        once: bool,
        /// Watch the leaf workers instead of the dedup workers.
        #[arg(long)]
        leaves: bool,
    },
    /// Formats a GROUPS_START listing into subgroups_summary.txt.
    Summary {
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
    },
    /// Writes the verification report.
    Report {
        /// JSON list of independent verification passes.
        #[arg(short, long, value_name = "FILE")]
        passes: Option<PathBuf>,
    },
    /// Runs the GAP regression scripts.
    Selftest {
        #[arg(long)]
        wsl_only: bool,
        #[arg(long)]
        cygwin_only: bool,
        #[arg(long)]
        quick: bool,
        /// Pre-flight check a prepared work directory instead.
        #[arg(long, value_name = "DIR")]
        validate: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli) -> Result<CensusConfig> {
    let mut conf = match &cli.config {
        Some(path) => CensusConfig::from_file(path)?,
        None => CensusConfig::from_dir(".")?,
    };
    if let Some(dir) = &cli.dir {
        conf.work_dir = dir.clone();
    }
    Ok(conf)
}

fn run(cli: Cli) -> Result<bool> {
    let conf = load_config(&cli)?;
    log::info!(
        "S{:} census in {:} ({:} workers, {:} at a time)",
        conf.n,
        conf.work_dir.display(),
        conf.num_workers,
        conf.max_parallel
    );
    match cli.command {
        CensusCommand::Init {} => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(subgroup_census::config::CENSUS_CONFIG_FILENAME));
            conf.save_to_disk(&path)?;
            println!("Wrote {:}", path.display());
            Ok(true)
        }
        CensusCommand::Precompute {
            skip_conjugacy,
            skip_invariants,
        } => pipeline::precompute(
            &conf,
            PrecomputeOptions {
                skip_conjugacy,
                skip_invariants,
            },
        ),
        CensusCommand::Leaves { first, last } => {
            let summary = pipeline::run_leaves(&conf, LeafOptions { first, last })?;
            Ok(summary.all_success)
        }
        CensusCommand::Combine {} => pipeline::combine(&conf),
        CensusCommand::Prepare {
            input,
            isomorphism,
            cost,
        } => {
            let method = if isomorphism {
                DedupMethod::Isomorphism
            } else {
                DedupMethod::Conjugacy
            };
            let tracking = pipeline::prepare(&conf, &PrepareOptions { input, method, cost })?;
            Ok(tracking.coverage.complete)
        }
        CensusCommand::Launch {
            wsl_only,
            cygwin_only,
            only,
        } => {
            let summary = pipeline::launch(
                &conf,
                &LaunchOptions {
                    wsl_only,
                    cygwin_only,
                    only,
                },
            )?;
            Ok(summary.all_success)
        }
        CensusCommand::Merge {} => Ok(pipeline::merge(&conf)?.is_ok()),
        CensusCommand::Breakdown {} => Ok(pipeline::breakdown(&conf)?.empty_buckets().is_empty()),
        CensusCommand::IsoMap { proofs } => Ok(pipeline::iso_map(&conf, proofs.as_deref())?.is_ok()),
        CensusCommand::VerifyProofs { proofs } => {
            Ok(pipeline::verify_proofs(&conf, proofs.as_deref())?.passed())
        }
        CensusCommand::CheckProofs { proofs, workers } => {
            Ok(pipeline::check_proofs(&conf, proofs.as_deref(), workers)?.passed())
        }
        CensusCommand::StageProofs { master, candidates } => {
            pipeline::stage_proofs(&conf, master.as_deref(), &candidates)?;
            Ok(true)
        }
        CensusCommand::AppendProofs { master, verify_output } => {
            pipeline::append_staged_proofs(&conf, master.as_deref(), verify_output.as_deref())?;
            Ok(true)
        }
        CensusCommand::Fingerprints { proofs } => {
            let info = pipeline::fingerprints(&conf, proofs.as_deref())?;
            let expected = conf.expected_isomorphism_types();
            Ok(info.undistinguished.is_empty() && expected.map_or(true, |e| e == info.total() as u64))
        }
        CensusCommand::ComparePasses { other } => Ok(pipeline::compare_passes(&conf, &other)?.agrees()),
        CensusCommand::Idgroups { extra } => {
            Ok(pipeline::idgroups(&conf, &extra)?.duplicate_indices.is_empty())
        }
        CensusCommand::Monitor { once, leaves } => {
            pipeline::monitor(&conf, once, leaves)?;
            Ok(true)
        }
        CensusCommand::Summary { input } => Ok(pipeline::summary(&conf, input.as_deref())? > 0),
        CensusCommand::Report { passes } => {
            Ok(pipeline::report(&conf, passes.as_deref())?.all_passed())
        }
        CensusCommand::Selftest {
            wsl_only,
            cygwin_only,
            quick,
            validate,
        } => pipeline::selftest(
            &conf,
            SelftestOptions {
                wsl_only,
                cygwin_only,
                quick,
            },
            validate.as_deref(),
        ),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("could not start logger: {:}", e);
    }
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:}", e);
            ExitCode::FAILURE
        }
    }
}
