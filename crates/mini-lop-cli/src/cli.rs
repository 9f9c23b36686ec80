use std::{
    fs,
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use mini_lop::{dictionary::load_dictionary, FuzzConfig, Fuzzer};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Coverage-guided fuzzer for AFL-instrumented targets.
#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    /// Path to the instrumented target binary.
    target_binary: PathBuf,

    /// Directory containing the initial corpus; never written to.
    #[clap(long)]
    seeds_folder: PathBuf,

    /// Working directory for queue, crashes and the staged input.
    #[clap(long, default_value = "minilop-out")]
    output_dir: PathBuf,

    /// Where admitted seeds are kept. Defaults to <output-dir>/queue.
    #[clap(long)]
    queue_folder: Option<PathBuf>,

    /// Where crashing inputs are kept. Defaults to <output-dir>/crashes.
    #[clap(long)]
    crashes_folder: Option<PathBuf>,

    /// File the next input is staged at. Defaults to
    /// <output-dir>/.cur_input.
    #[clap(long)]
    current_input: Option<PathBuf>,

    /// Per-execution timeout in milliseconds.
    #[clap(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Optional AFL-style token dictionary.
    #[clap(long)]
    dictionary: Option<PathBuf>,

    /// Fix the RNG seed for a reproducible run.
    #[clap(long)]
    random_seed: Option<u64>,

    /// Write a JSON stats snapshot here periodically.
    #[clap(long)]
    stats_file: Option<PathBuf>,

    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,
}

impl Cli {
    pub fn run(self) -> ExitCode {
        if let Err(err) = setup_logger(self.default_log_level) {
            eprintln!("cannot set up logging: {err:#}");
            return ExitCode::from(1);
        }

        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            if let Err(err) = ctrlc::set_handler(move || {
                stop.store(true, Ordering::Relaxed);
            }) {
                error!("cannot install the SIGINT handler: {err:#}");
                return ExitCode::from(1);
            }
        }

        let mut fuzzer = match self.build_fuzzer() {
            Ok(fuzzer) => fuzzer,
            Err(err) => {
                error!("{err:#}");
                return ExitCode::from(1);
            }
        };

        match fuzzer.run(&stop) {
            Ok(()) => {
                info!("clean shutdown");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("fatal: {err:#}");
                ExitCode::from(2)
            }
        }
    }

    fn build_fuzzer(self) -> anyhow::Result<Fuzzer> {
        let queue_dir = self
            .queue_folder
            .unwrap_or_else(|| self.output_dir.join("queue"));
        let crashes_dir = self
            .crashes_folder
            .unwrap_or_else(|| self.output_dir.join("crashes"));
        let current_input = self
            .current_input
            .unwrap_or_else(|| self.output_dir.join(".cur_input"));

        fs::create_dir_all(&queue_dir)
            .with_context(|| format!("creating {}", queue_dir.display()))?;
        fs::create_dir_all(&crashes_dir)
            .with_context(|| format!("creating {}", crashes_dir.display()))?;
        if let Some(parent) = current_input.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }

        let seed_files = collect_seed_files(&self.seeds_folder)?;
        anyhow::ensure!(
            !seed_files.is_empty(),
            "no seed inputs found in {}",
            self.seeds_folder.display()
        );
        info!(seeds = seed_files.len(), "initial corpus collected");

        let dictionary = match &self.dictionary {
            Some(path) => load_dictionary(path).context("loading dictionary")?,
            None => Vec::new(),
        };

        let config = FuzzConfig {
            target: self.target_binary,
            seed_files,
            queue_dir,
            crashes_dir,
            current_input,
            timeout: Duration::from_millis(self.timeout_ms),
            dictionary,
            random_seed: self.random_seed,
            stats_file: self.stats_file,
        };
        Fuzzer::init(config).context("initializing the fuzzer")
    }
}

fn collect_seed_files(seeds_folder: &std::path::Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(seeds_folder) {
        let entry = entry.with_context(|| format!("reading {}", seeds_folder.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn setup_logger(default_level: LevelFilter) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env()
                .context("constructing the log filter")?,
        )
        .init();
    Ok(())
}
