use anyhow::{Context as _, Result as AnyhowResult};
use cephbackup::config::Configuration;
use cephbackup::orchestrator::Orchestrator;
use chrono::Local;
use clap::Parser;
use fs2::FileExt;
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cephbackup", version, about = "Incremental snapshot replication between RBD pools")]
struct Args {
    /// Redirect all output to the log file
    #[arg(short, long)]
    silent: bool,

    /// Compute and log all actions without mutating cluster state
    #[arg(short, long)]
    dry_run: bool,

    /// Skip replication and run retention pruning only
    #[arg(short, long)]
    clean_only: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file
    #[arg(long, default_value = "/etc/cephbackup.conf")]
    config_file: PathBuf,

    /// Lock file preventing overlapping runs
    #[arg(long, default_value = "/var/run/cephlivebackup.pid")]
    pid_file: PathBuf,

    /// Log file used in silent mode
    #[arg(long, default_value = "/var/log/cephbackup/backup.log")]
    log_file: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("cannot initialize logging: {:#}", e);
        return ExitCode::from(2);
    }

    // be sure it runs only once
    let _lock = match acquire_lock(&args.pid_file) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            log::info!("another instance is running, exiting");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            log::error!("cannot acquire lock \"{}\": {}", args.pid_file.display(), e);
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(()) => {
            log::info!("backup completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> AnyhowResult<()> {
    let config = Configuration::read_from_file(&args.config_file).with_context(|| {
        format!(
            "could not read configuration file \"{}\"",
            args.config_file.display()
        )
    })?;

    log::debug!(
        "configuration read from file \"{}\"",
        args.config_file.display()
    );

    let now = Local::now().naive_local();

    Orchestrator::new(config, now, args.dry_run, args.clean_only).run()
}

fn init_logging(args: &Args) -> AnyhowResult<()> {
    let mut builder = env_logger::Builder::from_default_env();

    builder.filter_level(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    if args.silent {
        if let Some(directory) = args.log_file.parent() {
            fs::create_dir_all(directory)?;
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.log_file)?;

        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();

    Ok(())
}

/// Takes an exclusive advisory lock on the pid file. Returns `None` when
/// another instance holds it.
fn acquire_lock(path: &Path) -> std::io::Result<Option<File>> {
    let mut file = OpenOptions::new().write(true).create(true).open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            Ok(Some(file))
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}
