//! Thin wiring around [`gbp_core::Publisher`]: parse a subcommand, build a
//! `Publisher` from [`gbp_config::Settings`], call the matching method,
//! print a plain-text result. No subcommand here attempts to reproduce the
//! original's Django admin console or GraphQL surface (out of scope); this
//! binary exists so the crates can be exercised from a shell.

use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use gbp_config::{RecordsBackend, Settings, WorkerBackend};
use gbp_core::Publisher;
use gbp_records::{MemoryRecordDb, RecordDb, SqlRecordDb};
use gbp_storage::Storage;
use gbp_types::Build;
use gbp_worker::{SyncWorker, ThreadWorker, Worker};

#[derive(Parser, Debug)]
#[command(name = "gbp", version)]
#[command(about = "Gentoo Build Publisher: pull/publish/tag/purge CI build artifacts")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download and extract a build's artifact.
    Pull {
        build: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Publish a build (pulling it first if necessary).
    Publish { build: String },
    /// Apply a tag to a build. Empty name publishes.
    Tag { build: String, name: String },
    /// Remove a tag from a machine. Empty name unpublishes.
    Untag { machine: String, name: String },
    /// Delete a build's record and storage.
    Delete { build: String },
    /// Run the retention algorithm for a machine.
    Purge { machine: String },
    /// List known machines and their aggregate info.
    Machines,
    /// Show the package cpvb diff between two builds.
    Diff { left: String, right: String },
    /// Run storage/record integrity checks.
    Check,
    /// Dump every known build's record and storage tree to a tar file.
    Dump { path: std::path::PathBuf },
    /// Restore records and storage from a previously dumped tar file.
    Restore { path: std::path::PathBuf },
}

fn parse_build(s: &str) -> Result<Build> {
    s.parse::<Build>()
        .map_err(|e| anyhow::anyhow!("invalid build {s:?}: {e}"))
}

fn build_publisher(settings: &Settings) -> Result<Publisher> {
    let storage = Storage::new(&settings.storage_path);
    storage.init().context("initializing storage root")?;

    let records: Arc<dyn RecordDb> = match settings.records_backend {
        RecordsBackend::Memory => Arc::new(MemoryRecordDb::new()),
        RecordsBackend::Sql => {
            Arc::new(SqlRecordDb::connect(&settings.database_url).context("connecting record store")?)
        }
    };

    let jenkins = gbp_ci::JenkinsClient::new(gbp_ci::JenkinsConfig {
        base_url: settings.jenkins_base_url.clone(),
        user: settings.jenkins_user.clone(),
        api_key: settings.jenkins_api_key.clone(),
        artifact_name: settings.jenkins_artifact_name.clone(),
    });

    Ok(Publisher::new(
        Arc::new(jenkins),
        storage,
        records,
        hostname(),
        env!("CARGO_PKG_VERSION"),
    ))
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "gbp".to_string())
}

fn build_worker(publisher: Arc<Publisher>, settings: &Settings) -> Result<Box<dyn Worker>> {
    match &settings.worker_backend {
        WorkerBackend::Sync => Ok(Box::new(SyncWorker::new(publisher, settings.enable_purge))),
        WorkerBackend::Thread => Ok(Box::new(ThreadWorker::new(
            publisher,
            settings.enable_purge,
            false,
        ))),
        WorkerBackend::Queue(name) => {
            bail!("external queue backend {name:?} is not wired into this binary")
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("loading BUILD_PUBLISHER_* settings")?;
    let publisher = Arc::new(build_publisher(&settings)?);

    match cli.cmd {
        Commands::Pull { build, note, tags } => {
            let build = parse_build(&build)?;
            let worker = build_worker(publisher.clone(), &settings)?;
            worker.run(gbp_worker::Task::PullBuild {
                build_id: build.to_string(),
                note,
                tags,
            })?;
            println!("pulled: {}", publisher.pulled(&build));
        }
        Commands::Publish { build } => {
            let build = parse_build(&build)?;
            let worker = build_worker(publisher.clone(), &settings)?;
            worker.run(gbp_worker::Task::PublishBuild {
                build_id: build.to_string(),
            })?;
            println!("published: {}", publisher.storage().published(&build));
        }
        Commands::Tag { build, name } => {
            let build = parse_build(&build)?;
            publisher.tag(&build, &name)?;
            println!("tagged {build} as {name:?}");
        }
        Commands::Untag { machine, name } => {
            publisher.untag(&machine, &name)?;
            println!("untagged {machine:?} from {name:?}");
        }
        Commands::Delete { build } => {
            let build = parse_build(&build)?;
            publisher.delete(&build)?;
            println!("deleted {build}");
        }
        Commands::Purge { machine } => {
            publisher.purge(&machine)?;
            println!("purged {machine}");
        }
        Commands::Machines => {
            for info in publisher.machines(None)? {
                println!(
                    "{}: {} builds, latest={:?}, published={:?}, tags={:?}",
                    info.machine,
                    info.build_count,
                    info.latest_build.as_ref().map(|r| r.build.to_string()),
                    info.published_build.as_ref().map(|b| b.to_string()),
                    info.tags,
                );
            }
        }
        Commands::Diff { left, right } => {
            let left = parse_build(&left)?;
            let right = parse_build(&right)?;
            for change in publisher.diff_binpkgs(&left, &right)? {
                let sign = match change.state {
                    gbp_core::ChangeState::Added => '+',
                    gbp_core::ChangeState::Removed => '-',
                    gbp_core::ChangeState::Changed => '~',
                };
                println!("{sign}{}", change.item);
            }
        }
        Commands::Check => {
            let outcome = gbp_stats::checks::run_all(publisher.records(), publisher.storage())?;
            for err in &outcome.errors {
                println!("error: {err}");
            }
            for warn in &outcome.warnings {
                println!("warning: {warn}");
            }
            if outcome.is_clean() {
                println!("ok");
            } else {
                std::process::exit(1);
            }
        }
        Commands::Dump { path } => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            let builds: Vec<Build> = publisher
                .records()
                .list_machines()?
                .iter()
                .flat_map(|m| publisher.records().for_machine(m).unwrap_or_default())
                .map(|r| r.build)
                .collect();
            gbp_archive::dump(
                &publisher,
                &builds,
                BufWriter::new(file),
                chrono::Utc::now(),
                |_, _, _| {},
            )?;
            println!("dumped {} builds to {}", builds.len(), path.display());
        }
        Commands::Restore { path } => {
            let file =
                std::fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            let restored = gbp_archive::restore(&publisher, BufReader::new(file), |_, _, _| {})?;
            println!("restored {} builds from {}", restored.len(), path.display());
        }
    }

    Ok(())
}
